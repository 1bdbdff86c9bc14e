//! Client for the deployment orchestrator.
//!
//! [`Orchestrator`] is the surface the pipeline builder needs: application
//! lookup and creation, permissions and notifications, pipeline list /
//! upsert / delete, user roles for the write-access check, and a role cache
//! refresh.
//!
//! - [`HttpOrchestrator`] talks to the orchestrator's REST services
//! - [`ReadOnlyOrchestrator`] wraps another client for validation runs:
//!   reads pass through, writes are recorded in memory and never sent

mod http;
mod readonly;
pub mod types;

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::core::DinghyError;

pub use http::HttpOrchestrator;
pub use readonly::ReadOnlyOrchestrator;
pub use types::{ApplicationSpec, DataSources, Permissions, Pipeline, TaskStatus};

#[async_trait]
pub trait Orchestrator: Send + Sync {
    /// Look up an application; `None` when it does not exist.
    async fn get_application(&self, name: &str) -> Result<Option<ApplicationSpec>, DinghyError>;

    /// Create an application and wait for the creation task to finish.
    async fn create_application(&self, spec: &ApplicationSpec) -> Result<(), DinghyError>;

    async fn update_permissions(
        &self,
        application: &str,
        permissions: &Permissions,
    ) -> Result<(), DinghyError>;

    async fn update_notifications(
        &self,
        application: &str,
        notifications: &Value,
    ) -> Result<(), DinghyError>;

    /// Every pipeline of `application`.
    async fn pipelines(&self, application: &str) -> Result<Vec<Pipeline>, DinghyError>;

    /// Create the pipeline, or update it in place when it carries an `id`.
    async fn upsert_pipeline(&self, pipeline: &Pipeline) -> Result<(), DinghyError>;

    async fn delete_pipeline(&self, application: &str, name: &str) -> Result<(), DinghyError>;

    /// Roles held by `user`. Unknown users fail with [`DinghyError::UserNotFound`].
    async fn user_roles(&self, user: &str) -> Result<Vec<String>, DinghyError>;

    /// Ask the authorization service to resync its role cache.
    async fn force_refresh(&self) -> Result<(), DinghyError>;

    async fn application_exists(&self, name: &str) -> Result<bool, DinghyError> {
        Ok(self.get_application(name).await?.is_some())
    }

    /// Id of the pipeline `name` in `application`.
    ///
    /// A missing pipeline is created empty so templates can reference
    /// pipelines that a later dinghyfile will fill in.
    async fn pipeline_id(&self, application: &str, name: &str) -> Result<String, DinghyError> {
        if let Some(id) = find_pipeline_id(&self.pipelines(application).await?, name) {
            return Ok(id);
        }

        tracing::info!("pipeline {} not found in {}, creating an empty one", name, application);
        let mut placeholder = Pipeline::new();
        placeholder.insert("application".to_string(), json!(application));
        placeholder.insert("name".to_string(), json!(name));
        self.upsert_pipeline(&placeholder).await?;
        find_pipeline_id(&self.pipelines(application).await?, name).ok_or_else(|| {
            DinghyError::orchestrator(
                format!("lookup pipeline {application}/{name}"),
                "pipeline has no id after creation",
            )
        })
    }
}

fn find_pipeline_id(pipelines: &[Pipeline], name: &str) -> Option<String> {
    pipelines
        .iter()
        .find(|p| types::pipeline_name(p) == Some(name))
        .and_then(types::pipeline_id)
        .map(str::to_string)
}
