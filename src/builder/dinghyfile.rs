//! The rendered root document.

use serde::Deserialize;
use serde_json::{Map, Value};

use crate::config::ParserFormat;
use crate::core::DinghyError;
use crate::orchestrator::types::{self, ApplicationSpec, DataSources, Pipeline};

/// A rendered dinghyfile.
///
/// Only the keys dinghy acts on are modelled; pipelines stay opaque maps.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Dinghyfile {
    pub application: String,
    pub spec: ApplicationSpec,
    pub globals: Map<String, Value>,
    pub pipelines: Vec<Pipeline>,
    /// `None` defers to the process-wide default.
    pub delete_stale_pipelines: Option<bool>,
}

impl Dinghyfile {
    /// Unmarshal rendered `text`.
    ///
    /// Anything the parser rejects, or that has the wrong shape, is a
    /// [`DinghyError::MalformedDocument`].
    pub fn parse(format: ParserFormat, path: &str, text: &str) -> Result<Self, DinghyError> {
        let malformed = |message: String| DinghyError::MalformedDocument {
            path: path.to_string(),
            format: format.to_string(),
            message,
        };
        let value = format.parse(text).map_err(malformed)?;
        serde_json::from_value(value).map_err(|e| malformed(e.to_string()))
    }

    /// Fill in application defaults and stamp every pipeline with it.
    ///
    /// `spec.name` takes precedence over `application`; either one alone names
    /// the application. A document that names neither, or a pipeline without
    /// a name, is malformed.
    pub fn apply_defaults(
        &mut self,
        format: ParserFormat,
        path: &str,
        default_email: &str,
    ) -> Result<(), DinghyError> {
        let malformed = |message: &str| DinghyError::MalformedDocument {
            path: path.to_string(),
            format: format.to_string(),
            message: message.to_string(),
        };

        if self.spec.name.is_empty() {
            self.spec.name = self.application.clone();
        } else {
            self.application = self.spec.name.clone();
        }
        if self.application.is_empty() {
            return Err(malformed("no application named"));
        }
        if self.spec.email.is_empty() {
            self.spec.email = default_email.to_string();
        }
        if self.spec.data_sources.is_none() {
            self.spec.data_sources = Some(DataSources::default());
        }

        for (index, pipeline) in self.pipelines.iter_mut().enumerate() {
            if types::pipeline_name(pipeline).is_none_or(str::is_empty) {
                return Err(malformed(&format!("pipeline {index} has no name")));
            }
            if types::pipeline_application(pipeline).is_none_or(str::is_empty) {
                pipeline.insert("application".to_string(), Value::String(self.application.clone()));
            }
        }
        Ok(())
    }

    /// Names of the pipelines in document order.
    pub fn pipeline_names(&self) -> Vec<String> {
        self.pipelines
            .iter()
            .filter_map(types::pipeline_name)
            .map(str::to_string)
            .collect()
    }
}
