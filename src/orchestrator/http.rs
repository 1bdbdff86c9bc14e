//! REST client for the orchestrator services.
//!
//! | Service | Used for |
//! |---|---|
//! | front50 | applications, permissions, notifications, pipelines |
//! | orca | application creation tasks |
//! | fiat | user roles and role sync |

use std::collections::HashMap;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use parking_lot::RwLock;
use reqwest::{Method, RequestBuilder, StatusCode};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::time::Instant;

use super::types::{self, ApplicationSpec, Permissions, Pipeline, TaskStatus};
use super::Orchestrator;
use crate::config::OrchestratorSettings;
use crate::core::DinghyError;
use crate::utils::retry::send_with_retry;

#[derive(Debug, Deserialize)]
struct TaskRef {
    #[serde(rename = "ref")]
    task_ref: String,
}

#[derive(Debug, Deserialize)]
struct Role {
    name: String,
}

/// Orchestrator client over HTTP.
pub struct HttpOrchestrator {
    http: reqwest::Client,
    front50: String,
    orca: String,
    fiat: String,
    user: Option<String>,
    retries: usize,
    poll_interval: Duration,
    task_timeout: Duration,
    /// Roles by user, filled on first lookup.
    role_cache: RwLock<HashMap<String, Vec<String>>>,
}

impl HttpOrchestrator {
    pub fn new(settings: &OrchestratorSettings) -> Result<Self, DinghyError> {
        Ok(Self {
            http: crate::vcs::http_client()?,
            front50: settings.front50_url.trim_end_matches('/').to_string(),
            orca: settings.orca_url.trim_end_matches('/').to_string(),
            fiat: settings.fiat_url.trim_end_matches('/').to_string(),
            user: settings.fiat_user.clone(),
            retries: settings.retries,
            poll_interval: Duration::from_secs(settings.poll_interval_secs),
            task_timeout: Duration::from_secs(settings.task_timeout_secs),
            role_cache: RwLock::new(HashMap::new()),
        })
    }

    /// Override task polling cadence and total wait.
    pub fn with_polling(mut self, interval: Duration, timeout: Duration) -> Self {
        self.poll_interval = interval;
        self.task_timeout = timeout;
        self
    }

    fn request(&self, method: Method, url: String) -> RequestBuilder {
        let request = self.http.request(method, url);
        match &self.user {
            Some(user) => request.header("X-SPINNAKER-USER", user),
            None => request,
        }
    }

    /// Send with retries, mapping any failure to an orchestrator error.
    async fn send(
        &self,
        operation: &str,
        accept: impl Fn(StatusCode) -> bool,
        build: impl Fn() -> RequestBuilder,
    ) -> Result<reqwest::Response, DinghyError> {
        send_with_retry(self.retries, accept, build)
            .await
            .map_err(|e| DinghyError::orchestrator(operation, format!("{e:#}")))
    }

    async fn json<T: serde::de::DeserializeOwned>(
        operation: &str,
        response: reqwest::Response,
    ) -> Result<T, DinghyError> {
        response
            .json()
            .await
            .context("Failed to decode response")
            .map_err(|e| DinghyError::orchestrator(operation, format!("{e:#}")))
    }

    /// Submit an orchestration task and return its id.
    pub async fn submit_task(&self, task: &Value) -> Result<String, DinghyError> {
        let operation = "submit task";
        let url = format!("{}/ops", self.orca);
        let response = self
            .send(operation, |_| false, || self.request(Method::POST, url.clone()).json(task))
            .await?;
        let task_ref: TaskRef = Self::json(operation, response).await?;
        Ok(task_ref.task_ref.rsplit('/').next().unwrap_or_default().to_string())
    }

    /// Poll a task until it completes or the configured wait runs out.
    pub async fn wait_for_task(&self, id: &str) -> Result<TaskStatus, DinghyError> {
        let operation = format!("task {id}");
        let url = format!("{}/tasks/{}", self.orca, id);
        let started = Instant::now();
        loop {
            let response =
                self.send(&operation, |_| false, || self.request(Method::GET, url.clone())).await?;
            let status: TaskStatus = Self::json(&operation, response).await?;
            if status.is_complete() {
                return Ok(status);
            }
            if started.elapsed() >= self.task_timeout {
                return Err(DinghyError::Timeout {
                    operation,
                    waited: started.elapsed(),
                });
            }
            tracing::debug!("task {} is {}, polling again", id, status.status);
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

#[async_trait]
impl Orchestrator for HttpOrchestrator {
    async fn get_application(&self, name: &str) -> Result<Option<ApplicationSpec>, DinghyError> {
        let operation = format!("get application {name}");
        let url = format!("{}/v2/applications/{}", self.front50, name);
        let not_found = |s: StatusCode| s == StatusCode::NOT_FOUND;
        let response =
            self.send(&operation, not_found, || self.request(Method::GET, url.clone())).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Ok(Some(Self::json(&operation, response).await?))
    }

    async fn create_application(&self, spec: &ApplicationSpec) -> Result<(), DinghyError> {
        let task = json!({
            "application": spec.name,
            "description": format!("Create Application: {}", spec.name),
            "job": [{
                "type": "createApplication",
                "application": spec,
                "user": self.user.clone().unwrap_or_default(),
            }],
        });
        let id = self.submit_task(&task).await?;
        tracing::info!("creating application {} (task {})", spec.name, id);
        let status = self.wait_for_task(&id).await?;
        if !status.is_succeeded() {
            return Err(DinghyError::orchestrator(
                format!("create application {}", spec.name),
                format!("task {} ended {}", id, status.status),
            ));
        }
        Ok(())
    }

    async fn update_permissions(
        &self,
        application: &str,
        permissions: &Permissions,
    ) -> Result<(), DinghyError> {
        let url = format!("{}/permissions/applications/{}", self.front50, application);
        let body = json!({"name": application, "permissions": permissions});
        self.send(
            &format!("update permissions of {application}"),
            |_| false,
            || self.request(Method::PUT, url.clone()).json(&body),
        )
        .await?;
        Ok(())
    }

    async fn update_notifications(
        &self,
        application: &str,
        notifications: &Value,
    ) -> Result<(), DinghyError> {
        let url = format!("{}/notifications/application/{}", self.front50, application);
        self.send(
            &format!("update notifications of {application}"),
            |_| false,
            || self.request(Method::POST, url.clone()).json(notifications),
        )
        .await?;
        Ok(())
    }

    async fn pipelines(&self, application: &str) -> Result<Vec<Pipeline>, DinghyError> {
        let operation = format!("list pipelines of {application}");
        let url = format!("{}/pipelines/{}", self.front50, application);
        let response =
            self.send(&operation, |_| false, || self.request(Method::GET, url.clone())).await?;
        Self::json(&operation, response).await
    }

    async fn upsert_pipeline(&self, pipeline: &Pipeline) -> Result<(), DinghyError> {
        let name = types::pipeline_name(pipeline).unwrap_or_default();
        let operation = format!("upsert pipeline {name}");
        let (method, url) = match types::pipeline_id(pipeline) {
            Some(id) => (Method::PUT, format!("{}/pipelines/{}", self.front50, id)),
            None => (Method::POST, format!("{}/pipelines", self.front50)),
        };
        self.send(&operation, |_| false, || {
            self.request(method.clone(), url.clone()).json(pipeline)
        })
        .await?;
        Ok(())
    }

    async fn delete_pipeline(&self, application: &str, name: &str) -> Result<(), DinghyError> {
        let url = format!("{}/pipelines/{}/{}", self.front50, application, name);
        let operation = format!("delete pipeline {name}");
        self.send(&operation, |_| false, || self.request(Method::DELETE, url.clone())).await?;
        Ok(())
    }

    async fn user_roles(&self, user: &str) -> Result<Vec<String>, DinghyError> {
        if let Some(roles) = self.role_cache.read().get(user) {
            return Ok(roles.clone());
        }
        if self.fiat.is_empty() {
            return Err(DinghyError::Config(
                "orchestrator.fiat_url is required for role lookups".to_string(),
            ));
        }

        let operation = format!("roles of {user}");
        let url = format!("{}/authorize/{}/roles", self.fiat, user);
        let not_found = |s: StatusCode| s == StatusCode::NOT_FOUND;
        let response =
            self.send(&operation, not_found, || self.request(Method::GET, url.clone())).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(DinghyError::UserNotFound {
                user: user.to_string(),
            });
        }
        let roles: Vec<Role> = Self::json(&operation, response).await?;
        let roles: Vec<String> = roles.into_iter().map(|r| r.name).collect();
        self.role_cache.write().insert(user.to_string(), roles.clone());
        Ok(roles)
    }

    async fn force_refresh(&self) -> Result<(), DinghyError> {
        if self.fiat.is_empty() {
            return Ok(());
        }
        let url = format!("{}/roles/sync", self.fiat);
        self.send("sync roles", |_| false, || self.request(Method::POST, url.clone())).await?;
        self.role_cache.write().clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;

    fn settings(server: &mockito::Server) -> OrchestratorSettings {
        OrchestratorSettings {
            front50_url: server.url(),
            orca_url: server.url(),
            fiat_url: server.url(),
            retries: 0,
            ..OrchestratorSettings::default()
        }
    }

    #[tokio::test]
    async fn test_missing_application_is_none() {
        let mut server = mockito::Server::new_async().await;
        server.mock("GET", "/v2/applications/nope").with_status(404).create_async().await;
        server
            .mock("GET", "/v2/applications/app")
            .with_body(r#"{"name": "app", "email": "a@b.c"}"#)
            .create_async()
            .await;
        let client = HttpOrchestrator::new(&settings(&server)).unwrap();

        assert!(client.get_application("nope").await.unwrap().is_none());
        assert_eq!(client.get_application("app").await.unwrap().unwrap().email, "a@b.c");
        assert!(client.application_exists("app").await.unwrap());
    }

    #[tokio::test]
    async fn test_create_application_polls_task() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/ops")
            .match_body(Matcher::PartialJson(json!({"job": [{"type": "createApplication"}]})))
            .with_body(r#"{"ref": "/tasks/01ABC"}"#)
            .create_async()
            .await;
        server
            .mock("GET", "/tasks/01ABC")
            .with_body(r#"{"id": "01ABC", "status": "SUCCEEDED"}"#)
            .create_async()
            .await;
        let client = HttpOrchestrator::new(&settings(&server)).unwrap();
        let spec = ApplicationSpec {
            name: "app".to_string(),
            email: "a@b.c".to_string(),
            ..ApplicationSpec::default()
        };
        client.create_application(&spec).await.unwrap();
    }

    #[tokio::test]
    async fn test_task_timeout() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/tasks/slow")
            .with_body(r#"{"id": "slow", "status": "RUNNING"}"#)
            .expect_at_least(2)
            .create_async()
            .await;
        let client = HttpOrchestrator::new(&settings(&server))
            .unwrap()
            .with_polling(Duration::from_millis(10), Duration::from_millis(50));

        let err = client.wait_for_task("slow").await.unwrap_err();
        assert!(matches!(err, DinghyError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_upsert_uses_put_with_id() {
        let mut server = mockito::Server::new_async().await;
        let create = server.mock("POST", "/pipelines").create_async().await;
        let update = server.mock("PUT", "/pipelines/p-1").create_async().await;
        let client = HttpOrchestrator::new(&settings(&server)).unwrap();

        let mut pipeline: Pipeline =
            serde_json::from_value(json!({"application": "app", "name": "deploy"})).unwrap();
        client.upsert_pipeline(&pipeline).await.unwrap();
        pipeline.insert("id".to_string(), json!("p-1"));
        client.upsert_pipeline(&pipeline).await.unwrap();

        create.assert_async().await;
        update.assert_async().await;
    }

    #[tokio::test]
    async fn test_pipeline_id_creates_missing_pipeline() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/pipelines/app")
            .with_body(r#"[]"#)
            .create_async()
            .await;
        let create = server
            .mock("POST", "/pipelines")
            .match_body(Matcher::Json(json!({"application": "app", "name": "deploy"})))
            .create_async()
            .await;
        let client = HttpOrchestrator::new(&settings(&server)).unwrap();

        // The second listing still answers [] so the lookup fails after creating.
        let err = client.pipeline_id("app", "deploy").await.unwrap_err();
        assert!(matches!(err, DinghyError::Orchestrator { .. }));
        create.assert_async().await;
    }

    #[tokio::test]
    async fn test_user_roles_are_cached() {
        let mut server = mockito::Server::new_async().await;
        let roles = server
            .mock("GET", "/authorize/alice/roles")
            .with_body(r#"[{"name": "devs"}, {"name": "ops"}]"#)
            .expect(1)
            .create_async()
            .await;
        server.mock("GET", "/authorize/bob/roles").with_status(404).create_async().await;
        let client = HttpOrchestrator::new(&settings(&server)).unwrap();

        assert_eq!(
            client.user_roles("alice").await.unwrap(),
            vec!["devs".to_string(), "ops".to_string()]
        );
        assert_eq!(client.user_roles("alice").await.unwrap().len(), 2);
        roles.assert_async().await;

        let err = client.user_roles("bob").await.unwrap_err();
        assert!(matches!(err, DinghyError::UserNotFound { .. }));
    }
}
