//! StatusPoller - Degraded-Mode Polling Fallback
//!
//! While the realtime channel is degraded, task and metrics snapshots are
//! refetched on a fixed interval and fed through the same dispatch registry
//! the channel uses, so view-update handlers never care which path an
//! update arrived on.

use crate::pipeline_client::PipelineClient;
use crate::task_orchestrator::{TaskExecutor, TaskOrchestrator};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::interval;

use super::{ChannelPhase, Envelope, RealtimeChannel, MSG_SYSTEM_METRICS, MSG_TASK_STATUS};

/// StatusPoller instance
pub struct StatusPoller {
    pipeline: Arc<PipelineClient>,
    channel: Arc<RealtimeChannel>,
    orchestrator: Arc<TaskOrchestrator>,
    poll_interval: Duration,
    running: Arc<RwLock<bool>>,
}

impl StatusPoller {
    /// Create new StatusPoller
    pub fn new(
        pipeline: Arc<PipelineClient>,
        channel: Arc<RealtimeChannel>,
        orchestrator: Arc<TaskOrchestrator>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            pipeline,
            channel,
            orchestrator,
            poll_interval,
            running: Arc::new(RwLock::new(false)),
        }
    }

    /// Start the polling loop
    pub async fn start(&self) {
        {
            let mut running = self.running.write().await;
            if *running {
                tracing::warn!("Status poller already running");
                return;
            }
            *running = true;
        }

        tracing::info!(
            interval_sec = self.poll_interval.as_secs(),
            "Starting status poller"
        );

        let pipeline = self.pipeline.clone();
        let channel = self.channel.clone();
        let orchestrator = self.orchestrator.clone();
        let poll_interval = self.poll_interval;
        let running = self.running.clone();

        tokio::spawn(async move {
            let mut ticker = interval(poll_interval);

            loop {
                ticker.tick().await;

                {
                    let is_running = running.read().await;
                    if !*is_running {
                        break;
                    }
                }

                // Only poll while live updates are unavailable
                if channel.phase().await != ChannelPhase::Degraded {
                    continue;
                }

                Self::poll_once(&pipeline, &channel, &orchestrator).await;
            }

            tracing::info!("Status poller stopped");
        });
    }

    /// Stop the polling loop
    pub async fn stop(&self) {
        let mut running = self.running.write().await;
        *running = false;
        tracing::info!("Stopping status poller");
    }

    /// One polling round: task snapshot + metrics snapshot
    async fn poll_once(
        pipeline: &PipelineClient,
        channel: &RealtimeChannel,
        orchestrator: &TaskOrchestrator,
    ) {
        match pipeline.list_tasks().await {
            Ok(snapshot) => {
                let changed = orchestrator.apply_snapshot(snapshot).await;
                for task in changed {
                    match serde_json::to_value(&task) {
                        Ok(data) => {
                            channel
                                .dispatch(Envelope {
                                    kind: MSG_TASK_STATUS.to_string(),
                                    data,
                                })
                                .await;
                        }
                        Err(e) => {
                            tracing::error!(task_id = %task.id, error = %e, "Task serialization failed");
                        }
                    }
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Task poll failed");
            }
        }

        match pipeline.fetch_metrics().await {
            Ok(metrics) => {
                channel
                    .dispatch(Envelope {
                        kind: MSG_SYSTEM_METRICS.to_string(),
                        data: metrics,
                    })
                    .await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Metrics poll failed");
            }
        }
    }
}
