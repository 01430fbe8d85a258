//! PipelineClient - Pipeline Service Adapter
//!
//! ## Responsibilities
//!
//! - Task execution requests against the authoritative pipeline service
//! - Task list / system metrics snapshots (polling fallback)
//! - Connection health checks
//!
//! The base URL is resolved from configuration at startup; no endpoint is
//! hardcoded to a specific host.

use crate::error::{Error, Result};
use crate::task_orchestrator::{CreateTaskRequest, Task, TaskExecutor};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

/// Pipeline service client
pub struct PipelineClient {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct CreatedTask {
    id: String,
}

impl PipelineClient {
    /// Create new PipelineClient
    pub fn new(base_url: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("Failed to create HTTP client");

        Self { client, base_url }
    }

    /// Event-stream endpoint consumed by the realtime channel
    pub fn events_url(&self) -> String {
        format!("{}/events", self.base_url)
    }

    /// Fetch the current system metrics snapshot
    pub async fn fetch_metrics(&self) -> Result<serde_json::Value> {
        let url = format!("{}/metrics", self.base_url);
        let resp = self.client.get(&url).send().await?;

        if !resp.status().is_success() {
            return Err(Error::Pipeline(format!(
                "metrics fetch failed: {}",
                resp.status()
            )));
        }

        Ok(resp.json().await?)
    }

    /// Check pipeline service health
    pub async fn health_check(&self) -> Result<bool> {
        let url = format!("{}/healthz", self.base_url);
        let resp = self.client.get(&url).send().await?;
        Ok(resp.status().is_success())
    }

    async fn post_empty(&self, url: String, action: &str) -> Result<()> {
        let resp = self.client.post(&url).send().await?;

        if resp.status().as_u16() == 404 {
            return Err(Error::NotFound(format!("{}: task not found", action)));
        }
        if !resp.status().is_success() {
            return Err(Error::Pipeline(format!(
                "{} failed: {} - {}",
                action,
                resp.status(),
                resp.text().await.unwrap_or_default()
            )));
        }

        Ok(())
    }
}

#[async_trait]
impl TaskExecutor for PipelineClient {
    async fn create_task(&self, request: &CreateTaskRequest) -> Result<String> {
        let url = format!("{}/tasks", self.base_url);
        let resp = self.client.post(&url).json(request).send().await?;

        if !resp.status().is_success() {
            return Err(Error::Pipeline(format!(
                "task create failed: {} - {}",
                resp.status(),
                resp.text().await.unwrap_or_default()
            )));
        }

        let created: CreatedTask = resp.json().await?;
        tracing::debug!(task_id = %created.id, "Pipeline accepted task");
        Ok(created.id)
    }

    async fn start_task(&self, id: &str) -> Result<()> {
        self.post_empty(format!("{}/tasks/{}/start", self.base_url, id), "task start")
            .await
    }

    async fn stop_task(&self, id: &str) -> Result<()> {
        self.post_empty(format!("{}/tasks/{}/stop", self.base_url, id), "task stop")
            .await
    }

    async fn delete_task(&self, id: &str) -> Result<()> {
        let url = format!("{}/tasks/{}", self.base_url, id);
        let resp = self.client.delete(&url).send().await?;

        if resp.status().as_u16() == 404 {
            return Err(Error::NotFound(format!("task {} not found", id)));
        }
        if !resp.status().is_success() {
            return Err(Error::Pipeline(format!(
                "task delete failed: {}",
                resp.status()
            )));
        }

        Ok(())
    }

    async fn list_tasks(&self) -> Result<Vec<Task>> {
        let url = format!("{}/tasks", self.base_url);
        let resp = self.client.get(&url).send().await?;

        if !resp.status().is_success() {
            return Err(Error::Pipeline(format!(
                "task list failed: {}",
                resp.status()
            )));
        }

        Ok(resp.json().await?)
    }
}
