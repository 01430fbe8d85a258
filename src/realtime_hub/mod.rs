//! RealtimeHub - Dashboard WebSocket Distribution
//!
//! ## Responsibilities
//!
//! - WebSocket connection management for dashboard clients
//! - Fan-out of typed hub messages (task/device/metrics/detections)
//! - Channel-status notices (one non-blocking notice when live updates
//!   degrade to polling)

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::task_orchestrator::TaskStatus;

/// Hub message types
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
#[serde(rename_all = "snake_case")]
pub enum HubMessage {
    SystemMetrics(SystemMetricsMessage),
    TaskStatus(TaskStatusMessage),
    DeviceStatus(DeviceStatusMessage),
    DetectionEvent(DetectionEventMessage),
    /// Sent when the upstream channel changes phase (e.g. degraded to
    /// polling); the dashboard shows a single non-blocking notice
    ChannelStatus(ChannelStatusMessage),
}

/// System metrics snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemMetricsMessage {
    pub healthy: bool,
    pub cpu_percent: f32,
    pub memory_percent: f32,
    pub active_streams: i32,
}

/// Task status update
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStatusMessage {
    pub id: String,
    pub status: TaskStatus,
    pub progress: u8,
    pub timestamp: String,
}

/// Device status update
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceStatusMessage {
    pub index: u32,
    pub available: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend: Option<String>,
    pub timestamp: String,
}

/// Detection event notification
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionEventMessage {
    pub event_id: u64,
    pub source: String,
    pub label: String,
    pub severity: i32,
    pub timestamp: String,
}

/// Channel status notice
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelStatusMessage {
    pub phase: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Client connection
struct ClientConnection {
    id: Uuid,
    tx: mpsc::UnboundedSender<String>,
}

/// RealtimeHub instance
pub struct RealtimeHub {
    connections: RwLock<HashMap<Uuid, ClientConnection>>,
    connection_count: AtomicU64,
}

impl RealtimeHub {
    /// Create new RealtimeHub
    pub fn new() -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            connection_count: AtomicU64::new(0),
        }
    }

    /// Register a new client
    pub async fn register(&self) -> (Uuid, mpsc::UnboundedReceiver<String>) {
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();

        {
            let mut connections = self.connections.write().await;
            connections.insert(id, ClientConnection { id, tx });
        }

        self.connection_count.fetch_add(1, Ordering::Relaxed);

        tracing::info!(connection_id = %id, "Dashboard client connected");

        (id, rx)
    }

    /// Unregister a client
    pub async fn unregister(&self, id: &Uuid) {
        let mut connections = self.connections.write().await;
        if connections.remove(id).is_some() {
            self.connection_count.fetch_sub(1, Ordering::Relaxed);
            tracing::info!(connection_id = %id, "Dashboard client disconnected");
        }
    }

    /// Broadcast message to all clients
    pub async fn broadcast(&self, message: HubMessage) {
        let json = match serde_json::to_string(&message) {
            Ok(j) => j,
            Err(e) => {
                tracing::error!(error = %e, "Failed to serialize hub message");
                return;
            }
        };

        let connections = self.connections.read().await;
        tracing::debug!(
            client_count = connections.len(),
            "Broadcasting to dashboard clients"
        );

        for conn in connections.values() {
            if let Err(e) = conn.tx.send(json.clone()) {
                tracing::warn!(connection_id = %conn.id, error = %e, "Failed to send message");
            }
        }
    }

    /// Get connection count
    pub fn connection_count(&self) -> u64 {
        self.connection_count.load(Ordering::Relaxed)
    }
}

impl Default for RealtimeHub {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metrics_message() -> HubMessage {
        HubMessage::SystemMetrics(SystemMetricsMessage {
            healthy: true,
            cpu_percent: 12.5,
            memory_percent: 40.0,
            active_streams: 1,
        })
    }

    #[tokio::test]
    async fn test_broadcast_reaches_registered_client() {
        let hub = RealtimeHub::new();
        let (_id, mut rx) = hub.register().await;

        hub.broadcast(metrics_message()).await;

        let json = rx.recv().await.unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["type"], "system_metrics");
        assert_eq!(value["data"]["active_streams"], 1);
    }

    #[tokio::test]
    async fn test_unregistered_client_stops_receiving() {
        let hub = RealtimeHub::new();
        let (id, mut rx) = hub.register().await;
        hub.unregister(&id).await;

        hub.broadcast(metrics_message()).await;

        assert!(rx.try_recv().is_err());
        assert_eq!(hub.connection_count(), 0);
    }

    #[test]
    fn test_envelope_shape() {
        let json = serde_json::to_value(HubMessage::ChannelStatus(ChannelStatusMessage {
            phase: "degraded".to_string(),
            detail: Some("live updates paused".to_string()),
        }))
        .unwrap();
        assert_eq!(json["type"], "channel_status");
        assert_eq!(json["data"]["phase"], "degraded");
    }
}
