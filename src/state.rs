//! Application state
//!
//! Holds all shared components and state

use crate::capture_registry::CaptureRegistry;
use crate::device_probe::DeviceProbe;
use crate::event_log_service::EventLogService;
use crate::pipeline_client::PipelineClient;
use crate::realtime_channel::RealtimeChannel;
use crate::realtime_hub::RealtimeHub;
use crate::stream_relay::StreamRelay;
use crate::task_orchestrator::TaskOrchestrator;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Application configuration
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Pipeline service URL (authoritative task execution + status feed)
    pub pipeline_url: String,
    /// Server port
    pub port: u16,
    /// Server host
    pub host: String,
    /// Dashboard static asset directory
    pub static_dir: PathBuf,
    /// Auto-reconnect the realtime channel after an unexpected close
    pub channel_auto_reconnect: bool,
    /// Reconnect attempts before the channel degrades to polling
    pub channel_max_reconnect_attempts: u32,
    /// Fixed interval between reconnect attempts (ms)
    pub channel_reconnect_interval_ms: u64,
    /// Polling fallback period in seconds (used while degraded)
    pub poll_interval_sec: u64,
    /// Frame pull cadence for stream relays (ms)
    pub stream_cadence_ms: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            pipeline_url: std::env::var("PIPELINE_URL")
                .unwrap_or_else(|_| "http://localhost:9000".to_string()),
            port: std::env::var("PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(8080),
            host: std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            static_dir: std::env::var("STATIC_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("/opt/va31/frontend/dist")),
            channel_auto_reconnect: std::env::var("CHANNEL_AUTO_RECONNECT")
                .map(|v| v != "false" && v != "0")
                .unwrap_or(true),
            channel_max_reconnect_attempts: std::env::var("CHANNEL_MAX_RECONNECT_ATTEMPTS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(5),
            channel_reconnect_interval_ms: std::env::var("CHANNEL_RECONNECT_INTERVAL_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(3000),
            poll_interval_sec: std::env::var("POLL_INTERVAL_SEC")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(5),
            stream_cadence_ms: std::env::var("STREAM_CADENCE_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(200),
        }
    }
}

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    /// Application config
    pub config: AppConfig,
    /// PipelineClient (pipeline service adapter)
    pub pipeline: Arc<PipelineClient>,
    /// TaskOrchestrator (analysis task lifecycle)
    pub orchestrator: Arc<TaskOrchestrator>,
    /// DeviceProbe (capture device discovery)
    pub probe: Arc<DeviceProbe>,
    /// CaptureRegistry (per-device exclusive leases)
    pub captures: Arc<CaptureRegistry>,
    /// StreamRelay (viewer-bound frame relays)
    pub relay: Arc<StreamRelay>,
    /// RealtimeChannel (upstream status subscription)
    pub channel: Arc<RealtimeChannel>,
    /// RealtimeHub (WebSocket fan-out to dashboard clients)
    pub realtime: Arc<RealtimeHub>,
    /// EventLogService (detection event ring buffer)
    pub event_log: Arc<EventLogService>,
    /// System health status
    pub system_health: Arc<RwLock<SystemHealth>>,
}

/// System health metrics
#[derive(Debug, Clone, Default)]
pub struct SystemHealth {
    pub cpu_percent: f32,
    pub memory_percent: f32,
    pub overloaded: bool,
    pub last_overload_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl SystemHealth {
    /// Check and update overload status
    pub fn update(&mut self, cpu: f32, memory: f32) {
        self.cpu_percent = cpu;
        self.memory_percent = memory;

        if cpu > 85.0 || memory > 90.0 {
            self.overloaded = true;
            self.last_overload_at = Some(chrono::Utc::now());
        } else if self.overloaded {
            // Recovery with hysteresis
            if let Some(last) = self.last_overload_at {
                let elapsed = chrono::Utc::now() - last;
                if elapsed > chrono::Duration::seconds(60) && cpu < 60.0 && memory < 70.0 {
                    self.overloaded = false;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overload_set_on_high_cpu() {
        let mut health = SystemHealth::default();
        health.update(90.0, 50.0);
        assert!(health.overloaded);
    }

    #[test]
    fn test_no_immediate_recovery() {
        let mut health = SystemHealth::default();
        health.update(90.0, 50.0);
        // Load dropped but hysteresis window has not elapsed
        health.update(10.0, 10.0);
        assert!(health.overloaded);
    }
}
