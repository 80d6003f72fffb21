//! HTTP client for the project/experiment API
//!
//! Used to discover test data and as the polling [`StatusSource`] for the
//! completion waiter. The API itself is owned by the system under test.

use std::time::Duration;
use async_trait::async_trait;
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::auth::Session;
use crate::error::{E2eError, E2eResult};
use crate::pipeline::{status_from_backend, JobId, JobStatus};
use crate::waiter::StatusSource;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub uuid: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub experiments: Vec<String>,
}

impl Project {
    /// The experiment launched by the analysis button
    pub fn primary_experiment(&self) -> Option<&str> {
        self.experiments.first().map(String::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExperimentSummary {
    pub experiment_id: String,
    #[serde(default)]
    pub experiment_name: String,
    #[serde(default)]
    pub project_id: Option<String>,
}

pub struct ApiClient {
    base_url: String,
    session: Option<Session>,
    http_client: reqwest::Client,
}

impl ApiClient {
    pub fn new(api_url: &str, session: Option<Session>) -> E2eResult<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            base_url: format!("{}/v1", api_url.trim_end_matches('/')),
            session,
            http_client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    async fn send(&self, method: Method, path: &str) -> E2eResult<reqwest::Response> {
        let url = self.url(path);
        debug!("{} {}", method, url);

        let mut req = self.http_client.request(method, &url);
        if let Some(session) = &self.session {
            req = req.header("Authorization", session.bearer());
        }

        let resp = req.send().await?;
        if !resp.status().is_success() {
            return Err(E2eError::Api {
                status: resp.status().as_u16(),
                url,
            });
        }
        Ok(resp)
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> E2eResult<T> {
        let resp = self.send(Method::GET, path).await?;
        Ok(resp.json().await?)
    }

    pub async fn list_projects(&self) -> E2eResult<Vec<Project>> {
        self.get_json("projects").await
    }

    pub async fn find_project(&self, name: &str) -> E2eResult<Option<Project>> {
        Ok(self
            .list_projects()
            .await?
            .into_iter()
            .find(|p| p.name == name))
    }

    pub async fn list_experiments(&self) -> E2eResult<Vec<ExperimentSummary>> {
        self.get_json("experiments").await
    }

    pub async fn delete_project(&self, uuid: &str) -> E2eResult<()> {
        self.send(Method::DELETE, &format!("projects/{}", uuid)).await?;
        Ok(())
    }

    /// Raw `backendStatus` document of an experiment
    pub async fn backend_status(&self, experiment_id: &str) -> E2eResult<serde_json::Value> {
        self.get_json(&format!("experiments/{}/backendStatus", experiment_id))
            .await
    }
}

#[async_trait]
impl StatusSource for ApiClient {
    async fn status(&self, job: &JobId) -> E2eResult<JobStatus> {
        let doc = self.backend_status(&job.experiment_id).await?;
        Ok(status_from_backend(&doc, job.stage))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_urls_are_joined_under_v1() {
        let client = ApiClient::new("http://localhost:3000/", None).unwrap();
        assert_eq!(client.url("/projects"), "http://localhost:3000/v1/projects");
        assert_eq!(
            client.url("experiments/e1/backendStatus"),
            "http://localhost:3000/v1/experiments/e1/backendStatus"
        );
    }

    #[test]
    fn test_project_without_experiments() {
        let project: Project =
            serde_json::from_str(r#"{"uuid":"p1","name":"Pequeninos Sample"}"#).unwrap();
        assert_eq!(project.primary_experiment(), None);
        assert!(project.description.is_empty());
    }
}
