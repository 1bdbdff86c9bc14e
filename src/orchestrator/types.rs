//! Orchestrator data model.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A pipeline definition. The orchestrator owns the schema; dinghy only reads
/// `application`, `name` and `id`.
pub type Pipeline = Map<String, Value>;

/// Application name of a pipeline.
pub fn pipeline_application(pipeline: &Pipeline) -> Option<&str> {
    pipeline.get("application").and_then(Value::as_str)
}

pub fn pipeline_name(pipeline: &Pipeline) -> Option<&str> {
    pipeline.get("name").and_then(Value::as_str)
}

/// Server-assigned id, absent until the pipeline was saved once.
pub fn pipeline_id(pipeline: &Pipeline) -> Option<&str> {
    pipeline.get("id").and_then(Value::as_str).filter(|id| !id.is_empty())
}

/// Role sets allowed to read, write and execute an application.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permissions {
    #[serde(rename = "READ", default, skip_serializing_if = "Vec::is_empty")]
    pub read: Vec<String>,
    #[serde(rename = "WRITE", default, skip_serializing_if = "Vec::is_empty")]
    pub write: Vec<String>,
    #[serde(rename = "EXECUTE", default, skip_serializing_if = "Vec::is_empty")]
    pub execute: Vec<String>,
}

impl Permissions {
    pub fn is_empty(&self) -> bool {
        self.read.is_empty() && self.write.is_empty() && self.execute.is_empty()
    }
}

/// Tabs shown in the application UI.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataSources {
    #[serde(default)]
    pub enabled: Vec<String>,
    #[serde(default)]
    pub disabled: Vec<String>,
}

/// Application descriptor, as written in a dinghyfile `spec` block and as
/// returned by the orchestrator.
///
/// Unknown keys (cloud providers, instance port, ...) are carried in `extra`
/// and passed through on creation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationSpec {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_sources: Option<DataSources>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permissions: Option<Permissions>,
    /// Notification settings, stored separately from the application.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notifications: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Status of an orchestration task.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TaskStatus {
    #[serde(default)]
    pub id: String,
    pub status: String,
}

impl TaskStatus {
    pub fn is_succeeded(&self) -> bool {
        self.status == "SUCCEEDED"
    }

    /// Whether the task has stopped, successfully or not.
    pub fn is_complete(&self) -> bool {
        matches!(
            self.status.as_str(),
            "SUCCEEDED" | "TERMINAL" | "CANCELED" | "STOPPED" | "FAILED_CONTINUE" | "SKIPPED"
        )
    }
}
