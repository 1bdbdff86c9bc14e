//! Validation surrogate for the orchestrator.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Value, json};

use super::types::{self, ApplicationSpec, Permissions, Pipeline};
use super::Orchestrator;
use crate::core::DinghyError;

#[derive(Debug, Default)]
struct Recorded {
    applications: HashMap<String, ApplicationSpec>,
    /// Pipelines keyed by `(application, name)`.
    pipelines: BTreeMap<(String, String), Pipeline>,
    writes: Vec<String>,
}

/// Serves reads from `inner` and keeps every write in memory.
///
/// Pipelines "created" during a validation run get synthetic ids, so a later
/// `pipelineID` lookup in the same run resolves to the pipeline that would
/// exist had the push been processed.
pub struct ReadOnlyOrchestrator {
    inner: Arc<dyn Orchestrator>,
    recorded: Mutex<Recorded>,
}

impl ReadOnlyOrchestrator {
    pub fn new(inner: Arc<dyn Orchestrator>) -> Self {
        Self {
            inner,
            recorded: Mutex::new(Recorded::default()),
        }
    }

    /// Writes that were intercepted, in order, e.g. `upsert pipeline app/deploy`.
    pub fn writes(&self) -> Vec<String> {
        self.recorded.lock().writes.clone()
    }

    fn record(&self, write: String) {
        tracing::debug!("read-only orchestrator: skipping {}", write);
        self.recorded.lock().writes.push(write);
    }
}

#[async_trait]
impl Orchestrator for ReadOnlyOrchestrator {
    async fn get_application(&self, name: &str) -> Result<Option<ApplicationSpec>, DinghyError> {
        let recorded = self.recorded.lock().applications.get(name).cloned();
        if recorded.is_some() {
            return Ok(recorded);
        }
        self.inner.get_application(name).await
    }

    async fn create_application(&self, spec: &ApplicationSpec) -> Result<(), DinghyError> {
        self.record(format!("create application {}", spec.name));
        self.recorded.lock().applications.insert(spec.name.clone(), spec.clone());
        Ok(())
    }

    async fn update_permissions(
        &self,
        application: &str,
        _permissions: &Permissions,
    ) -> Result<(), DinghyError> {
        self.record(format!("update permissions {application}"));
        Ok(())
    }

    async fn update_notifications(
        &self,
        application: &str,
        _notifications: &Value,
    ) -> Result<(), DinghyError> {
        self.record(format!("update notifications {application}"));
        Ok(())
    }

    async fn pipelines(&self, application: &str) -> Result<Vec<Pipeline>, DinghyError> {
        // A recorded application may not exist upstream yet.
        let known_upstream = self.inner.get_application(application).await?.is_some();
        let mut pipelines = if known_upstream {
            self.inner.pipelines(application).await?
        } else {
            Vec::new()
        };

        let recorded = self.recorded.lock();
        for ((app, name), pipeline) in &recorded.pipelines {
            if app != application {
                continue;
            }
            match pipelines.iter_mut().find(|p| types::pipeline_name(p) == Some(name.as_str())) {
                Some(existing) => *existing = pipeline.clone(),
                None => pipelines.push(pipeline.clone()),
            }
        }
        Ok(pipelines)
    }

    async fn upsert_pipeline(&self, pipeline: &Pipeline) -> Result<(), DinghyError> {
        let application = types::pipeline_application(pipeline).unwrap_or_default().to_string();
        let name = types::pipeline_name(pipeline).unwrap_or_default().to_string();
        self.record(format!("upsert pipeline {application}/{name}"));

        let mut stored = pipeline.clone();
        if types::pipeline_id(&stored).is_none() {
            stored.insert("id".to_string(), json!(uuid::Uuid::new_v4().to_string()));
        }
        self.recorded.lock().pipelines.insert((application, name), stored);
        Ok(())
    }

    async fn delete_pipeline(&self, application: &str, name: &str) -> Result<(), DinghyError> {
        self.record(format!("delete pipeline {application}/{name}"));
        self.recorded.lock().pipelines.remove(&(application.to_string(), name.to_string()));
        Ok(())
    }

    async fn user_roles(&self, user: &str) -> Result<Vec<String>, DinghyError> {
        self.inner.user_roles(user).await
    }

    async fn force_refresh(&self) -> Result<(), DinghyError> {
        self.record("force refresh".to_string());
        Ok(())
    }
}
