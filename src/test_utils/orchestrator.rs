use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Value, json};

use crate::core::DinghyError;
use crate::orchestrator::types::{self, ApplicationSpec, Permissions, Pipeline};
use crate::orchestrator::Orchestrator;

#[derive(Default)]
struct State {
    applications: BTreeMap<String, ApplicationSpec>,
    pipelines: BTreeMap<(String, String), Pipeline>,
    roles: HashMap<String, Vec<String>>,
    writes: Vec<String>,
    next_id: usize,
    fail_upserts: Option<String>,
}

/// Orchestrator kept entirely in memory.
///
/// Seeding through `add_*` and `set_roles` is not recorded; every trait
/// write is, in the same format as
/// [`ReadOnlyOrchestrator::writes`](crate::orchestrator::ReadOnlyOrchestrator::writes).
#[derive(Default)]
pub struct FakeOrchestrator {
    state: Mutex<State>,
}

impl FakeOrchestrator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_application(&self, name: &str) {
        self.state.lock().applications.insert(
            name.to_string(),
            ApplicationSpec {
                name: name.to_string(),
                ..ApplicationSpec::default()
            },
        );
    }

    pub fn add_pipeline(&self, application: &str, name: &str, id: &str) {
        let pipeline = match json!({"application": application, "name": name, "id": id}) {
            Value::Object(map) => map,
            _ => Pipeline::new(),
        };
        self.state
            .lock()
            .pipelines
            .insert((application.to_string(), name.to_string()), pipeline);
    }

    pub fn set_roles(&self, user: &str, roles: &[&str]) {
        self.state
            .lock()
            .roles
            .insert(user.to_string(), roles.iter().map(|r| r.to_string()).collect());
    }

    /// Make every later upsert fail with `message`.
    pub fn fail_upserts(&self, message: &str) {
        self.state.lock().fail_upserts = Some(message.to_string());
    }

    pub fn writes(&self) -> Vec<String> {
        self.state.lock().writes.clone()
    }

    pub fn application(&self, name: &str) -> Option<ApplicationSpec> {
        self.state.lock().applications.get(name).cloned()
    }

    pub fn pipeline(&self, application: &str, name: &str) -> Option<Pipeline> {
        self.state
            .lock()
            .pipelines
            .get(&(application.to_string(), name.to_string()))
            .cloned()
    }
}

#[async_trait]
impl Orchestrator for FakeOrchestrator {
    async fn get_application(&self, name: &str) -> Result<Option<ApplicationSpec>, DinghyError> {
        Ok(self.application(name))
    }

    async fn create_application(&self, spec: &ApplicationSpec) -> Result<(), DinghyError> {
        let mut state = self.state.lock();
        state.writes.push(format!("create application {}", spec.name));
        state.applications.insert(spec.name.clone(), spec.clone());
        Ok(())
    }

    async fn update_permissions(
        &self,
        application: &str,
        permissions: &Permissions,
    ) -> Result<(), DinghyError> {
        let mut state = self.state.lock();
        state.writes.push(format!("update permissions {application}"));
        let app = state.applications.entry(application.to_string()).or_default();
        app.permissions = Some(permissions.clone());
        Ok(())
    }

    async fn update_notifications(
        &self,
        application: &str,
        notifications: &Value,
    ) -> Result<(), DinghyError> {
        let mut state = self.state.lock();
        state.writes.push(format!("update notifications {application}"));
        let app = state.applications.entry(application.to_string()).or_default();
        app.notifications = Some(notifications.clone());
        Ok(())
    }

    async fn pipelines(&self, application: &str) -> Result<Vec<Pipeline>, DinghyError> {
        Ok(self
            .state
            .lock()
            .pipelines
            .iter()
            .filter(|((app, _), _)| app == application)
            .map(|(_, p)| p.clone())
            .collect())
    }

    async fn upsert_pipeline(&self, pipeline: &Pipeline) -> Result<(), DinghyError> {
        let application = types::pipeline_application(pipeline).unwrap_or_default().to_string();
        let name = types::pipeline_name(pipeline).unwrap_or_default().to_string();
        let mut state = self.state.lock();
        if let Some(message) = &state.fail_upserts {
            let operation = format!("upsert pipeline {name}");
            return Err(DinghyError::orchestrator(operation, message.clone()));
        }
        state.writes.push(format!("upsert pipeline {application}/{name}"));

        let mut stored = pipeline.clone();
        if types::pipeline_id(&stored).is_none() {
            state.next_id += 1;
            stored.insert("id".to_string(), json!(format!("fake-{}", state.next_id)));
        }
        state.pipelines.insert((application, name), stored);
        Ok(())
    }

    async fn delete_pipeline(&self, application: &str, name: &str) -> Result<(), DinghyError> {
        let mut state = self.state.lock();
        state.writes.push(format!("delete pipeline {application}/{name}"));
        state.pipelines.remove(&(application.to_string(), name.to_string()));
        Ok(())
    }

    async fn user_roles(&self, user: &str) -> Result<Vec<String>, DinghyError> {
        self.state.lock().roles.get(user).cloned().ok_or_else(|| DinghyError::UserNotFound {
            user: user.to_string(),
        })
    }

    async fn force_refresh(&self) -> Result<(), DinghyError> {
        self.state.lock().writes.push("force refresh".to_string());
        Ok(())
    }
}
