//! RealtimeChannel - Upstream Status Subscription
//!
//! ## Responsibilities
//!
//! - Keep one connection to the pipeline service's status feed
//! - Bounded fixed-interval reconnection after unexpected closes
//! - Degrade to polling once the reconnect budget is exhausted
//! - Dispatch typed `{type, data}` envelopes to registered handlers
//!
//! Phases: disconnected -> connecting -> connected; connected -> reconnecting
//! on an unexpected close; reconnecting -> degraded after max attempts.
//! `connect()` is idempotent (at most one active connection) and
//! `disconnect()` cancels any pending reconnect timer.

mod poller;
mod transport;

pub use poller::StatusPoller;
pub use transport::{ChannelConnection, ChannelTransport, EventStreamTransport};

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;

/// Message types consumed by the dashboard
pub const MSG_SYSTEM_METRICS: &str = "system_metrics";
pub const MSG_TASK_STATUS: &str = "task_status";
pub const MSG_DEVICE_STATUS: &str = "device_status";
pub const MSG_DETECTION_EVENT: &str = "detection_event";

/// Typed message envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

/// Channel connection phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelPhase {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Degraded,
}

impl ChannelPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelPhase::Disconnected => "disconnected",
            ChannelPhase::Connecting => "connecting",
            ChannelPhase::Connected => "connected",
            ChannelPhase::Reconnecting => "reconnecting",
            ChannelPhase::Degraded => "degraded",
        }
    }
}

/// Reconnect policy
///
/// Fixed interval between attempts. Auto-reconnect is a deliberate policy
/// switch: with it off, an unexpected close degrades straight to polling
/// and the channel only comes back on an explicit `connect()`.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub auto_reconnect: bool,
    pub max_attempts: u32,
    pub interval: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            auto_reconnect: true,
            max_attempts: 5,
            interval: Duration::from_secs(3),
        }
    }
}

/// Connection bookkeeping
#[derive(Debug, Clone)]
pub struct ChannelState {
    pub phase: ChannelPhase,
    pub reconnect_attempts: u32,
    pub last_error: Option<String>,
}

impl Default for ChannelState {
    fn default() -> Self {
        Self {
            phase: ChannelPhase::Disconnected,
            reconnect_attempts: 0,
            last_error: None,
        }
    }
}

type Handler = Arc<dyn Fn(serde_json::Value) + Send + Sync>;
type HandlerMap = Arc<RwLock<HashMap<String, Vec<Handler>>>>;

/// RealtimeChannel instance
pub struct RealtimeChannel {
    transport: Arc<dyn ChannelTransport>,
    policy: ReconnectPolicy,
    state: Arc<RwLock<ChannelState>>,
    phase_tx: watch::Sender<ChannelPhase>,
    handlers: HandlerMap,
    run_task: Mutex<Option<JoinHandle<()>>>,
}

impl RealtimeChannel {
    /// Create new RealtimeChannel
    pub fn new(transport: Arc<dyn ChannelTransport>, policy: ReconnectPolicy) -> Self {
        let (phase_tx, _) = watch::channel(ChannelPhase::Disconnected);
        Self {
            transport,
            policy,
            state: Arc::new(RwLock::new(ChannelState::default())),
            phase_tx,
            handlers: Arc::new(RwLock::new(HashMap::new())),
            run_task: Mutex::new(None),
        }
    }

    /// Register a handler for one message type
    pub async fn on<F>(&self, kind: &str, handler: F)
    where
        F: Fn(serde_json::Value) + Send + Sync + 'static,
    {
        let mut handlers = self.handlers.write().await;
        handlers
            .entry(kind.to_string())
            .or_default()
            .push(Arc::new(handler));
    }

    /// Open the channel. No-op while a connection attempt or connection is
    /// already active; valid again from `disconnected` and `degraded`.
    pub async fn connect(&self) {
        {
            let state = self.state.read().await;
            if matches!(
                state.phase,
                ChannelPhase::Connecting | ChannelPhase::Connected | ChannelPhase::Reconnecting
            ) {
                tracing::debug!(
                    phase = state.phase.as_str(),
                    "Channel already active - connect is a no-op"
                );
                return;
            }
        }

        {
            let mut state = self.state.write().await;
            state.reconnect_attempts = 0;
            set_phase(&mut state, &self.phase_tx, ChannelPhase::Connecting);
        }

        let transport = self.transport.clone();
        let policy = self.policy.clone();
        let state = self.state.clone();
        let phase_tx = self.phase_tx.clone();
        let handlers = self.handlers.clone();

        let handle = tokio::spawn(run_channel(transport, policy, state, phase_tx, handlers));

        let mut run_task = self.run_task.lock().await;
        if let Some(old) = run_task.replace(handle) {
            old.abort();
        }
    }

    /// Close the channel and cancel any pending reconnect timer.
    /// Explicit disconnect never auto-reconnects.
    pub async fn disconnect(&self) {
        if let Some(task) = self.run_task.lock().await.take() {
            task.abort();
        }

        let mut state = self.state.write().await;
        state.reconnect_attempts = 0;
        set_phase(&mut state, &self.phase_tx, ChannelPhase::Disconnected);
        tracing::info!("Channel disconnected");
    }

    /// Current phase
    pub async fn phase(&self) -> ChannelPhase {
        self.state.read().await.phase
    }

    /// Current connection bookkeeping
    pub async fn state(&self) -> ChannelState {
        self.state.read().await.clone()
    }

    /// Watch phase transitions
    pub fn phase_watch(&self) -> watch::Receiver<ChannelPhase> {
        self.phase_tx.subscribe()
    }

    /// Inject a locally-sourced envelope into the dispatch registry
    /// (used by the polling fallback so both paths share handlers)
    pub async fn dispatch(&self, envelope: Envelope) {
        dispatch_envelope(&self.handlers, envelope).await;
    }
}

/// Connection loop: read until close/error, then apply the reconnect policy
async fn run_channel(
    transport: Arc<dyn ChannelTransport>,
    policy: ReconnectPolicy,
    state: Arc<RwLock<ChannelState>>,
    phase_tx: watch::Sender<ChannelPhase>,
    handlers: HandlerMap,
) {
    loop {
        match transport.connect().await {
            Ok(mut conn) => {
                {
                    let mut state = state.write().await;
                    state.reconnect_attempts = 0;
                    state.last_error = None;
                    set_phase(&mut state, &phase_tx, ChannelPhase::Connected);
                }
                tracing::info!("Channel connected");

                loop {
                    match conn.next_envelope().await {
                        Some(Ok(envelope)) => {
                            dispatch_envelope(&handlers, envelope).await;
                        }
                        Some(Err(e)) => {
                            tracing::warn!(error = %e, "Channel read error");
                            state.write().await.last_error = Some(e.to_string());
                            break;
                        }
                        None => {
                            tracing::info!("Channel closed by server");
                            break;
                        }
                    }
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Channel connect failed");
                state.write().await.last_error = Some(e.to_string());
            }
        }

        if !policy.auto_reconnect {
            let mut state = state.write().await;
            set_phase(&mut state, &phase_tx, ChannelPhase::Degraded);
            tracing::info!("Auto-reconnect disabled - degrading to polling");
            return;
        }

        let attempts = {
            let mut state = state.write().await;
            state.reconnect_attempts += 1;
            state.reconnect_attempts
        };

        if attempts > policy.max_attempts {
            let mut state = state.write().await;
            set_phase(&mut state, &phase_tx, ChannelPhase::Degraded);
            tracing::warn!(
                attempts = attempts - 1,
                "Reconnect budget exhausted - degrading to polling"
            );
            return;
        }

        {
            let mut state = state.write().await;
            set_phase(&mut state, &phase_tx, ChannelPhase::Reconnecting);
        }
        tracing::info!(
            attempt = attempts,
            max_attempts = policy.max_attempts,
            interval_ms = policy.interval.as_millis(),
            "Reconnecting"
        );

        tokio::time::sleep(policy.interval).await;
    }
}

fn set_phase(
    state: &mut ChannelState,
    phase_tx: &watch::Sender<ChannelPhase>,
    phase: ChannelPhase,
) {
    if state.phase != phase {
        tracing::debug!(
            from = state.phase.as_str(),
            to = phase.as_str(),
            "Channel phase changed"
        );
        state.phase = phase;
        let _ = phase_tx.send(phase);
    }
}

/// Dispatch one envelope to its handler set; unknown types are ignored
async fn dispatch_envelope(handlers: &HandlerMap, envelope: Envelope) {
    let handlers = handlers.read().await;
    match handlers.get(&envelope.kind) {
        Some(list) => {
            for handler in list {
                handler(envelope.data.clone());
            }
        }
        None => {
            tracing::trace!(kind = %envelope.kind, "Unknown message type ignored");
        }
    }
}
