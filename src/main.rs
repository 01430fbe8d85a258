//! VA31 Opsdeck - Video Analytics Operator Console
//!
//! Main entry point for the console backend.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::{ServeDir, ServeFile};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use va31_opsdeck::{
    capture_registry::CaptureRegistry,
    device_probe::{default_backends, DeviceProbe},
    event_log_service::{DetectionEvent, EventLogService},
    pipeline_client::PipelineClient,
    realtime_channel::{
        ChannelPhase, EventStreamTransport, RealtimeChannel, ReconnectPolicy, StatusPoller,
        MSG_DETECTION_EVENT, MSG_DEVICE_STATUS, MSG_SYSTEM_METRICS, MSG_TASK_STATUS,
    },
    realtime_hub::{
        ChannelStatusMessage, DetectionEventMessage, DeviceStatusMessage, HubMessage,
        RealtimeHub, SystemMetricsMessage, TaskStatusMessage,
    },
    state::{AppConfig, AppState, SystemHealth},
    stream_relay::StreamRelay,
    task_orchestrator::{TaskOrchestrator, TaskUpdate},
    web_api,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "va31_opsdeck=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting VA31 Opsdeck v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = AppConfig::default();
    tracing::info!(
        pipeline_url = %config.pipeline_url,
        host = %config.host,
        port = config.port,
        auto_reconnect = config.channel_auto_reconnect,
        "Configuration loaded"
    );

    // Initialize components
    let system_health = Arc::new(RwLock::new(SystemHealth::default()));

    let pipeline = Arc::new(PipelineClient::new(config.pipeline_url.clone()));
    let orchestrator = Arc::new(TaskOrchestrator::new(pipeline.clone()));
    tracing::info!("TaskOrchestrator initialized");

    let captures = Arc::new(CaptureRegistry::new());
    let backends = default_backends();
    let probe = Arc::new(DeviceProbe::with_backends(
        captures.clone(),
        backends.clone(),
    ));
    let relay = Arc::new(StreamRelay::new(
        captures.clone(),
        backends,
        Duration::from_millis(config.stream_cadence_ms),
    ));
    tracing::info!("DeviceProbe and StreamRelay initialized");

    let realtime = Arc::new(RealtimeHub::new());
    let event_log = Arc::new(EventLogService::default());

    let policy = ReconnectPolicy {
        auto_reconnect: config.channel_auto_reconnect,
        max_attempts: config.channel_max_reconnect_attempts,
        interval: Duration::from_millis(config.channel_reconnect_interval_ms),
    };
    let transport = Arc::new(EventStreamTransport::new(pipeline.events_url()));
    let channel = Arc::new(RealtimeChannel::new(transport, policy));
    tracing::info!("RealtimeChannel initialized");

    // Route channel envelopes to caches and the dashboard hub
    register_channel_handlers(&channel, &orchestrator, &realtime, &event_log).await;

    // One non-blocking notice per channel phase change
    {
        let hub = realtime.clone();
        let mut phase_rx = channel.phase_watch();
        tokio::spawn(async move {
            while phase_rx.changed().await.is_ok() {
                let phase = *phase_rx.borrow();
                let detail = match phase {
                    ChannelPhase::Degraded => {
                        Some("live updates degraded to polling".to_string())
                    }
                    _ => None,
                };
                hub.broadcast(HubMessage::ChannelStatus(ChannelStatusMessage {
                    phase: phase.as_str().to_string(),
                    detail,
                }))
                .await;
            }
        });
    }

    // Create application state
    let state = AppState {
        config: config.clone(),
        pipeline: pipeline.clone(),
        orchestrator: orchestrator.clone(),
        probe,
        captures,
        relay: relay.clone(),
        channel: channel.clone(),
        realtime: realtime.clone(),
        event_log,
        system_health: system_health.clone(),
    };

    // Seed the task cache before serving
    match orchestrator.refresh().await {
        Ok(changed) => tracing::info!(tasks = changed.len(), "Task cache seeded"),
        Err(e) => tracing::warn!(error = %e, "Initial task fetch failed"),
    }

    // Open the upstream status channel
    channel.connect().await;

    // Polling fallback while the channel is degraded
    let poller = Arc::new(StatusPoller::new(
        pipeline,
        channel,
        orchestrator,
        Duration::from_secs(config.poll_interval_sec),
    ));
    poller.start().await;

    // System health monitoring
    {
        let health_monitor = system_health.clone();
        let hub = realtime.clone();
        let relay_monitor = relay.clone();
        tokio::spawn(async move {
            use sysinfo::System;
            let mut sys = System::new_all();
            let mut interval = tokio::time::interval(Duration::from_secs(30));

            loop {
                interval.tick().await;
                sys.refresh_all();

                let cpu = {
                    let cpus = sys.cpus();
                    if cpus.is_empty() {
                        0.0
                    } else {
                        cpus.iter().map(|c| c.cpu_usage()).sum::<f32>() / cpus.len() as f32
                    }
                };
                let memory = if sys.total_memory() > 0 {
                    (sys.used_memory() as f32 / sys.total_memory() as f32) * 100.0
                } else {
                    0.0
                };

                let healthy = {
                    let mut health = health_monitor.write().await;
                    health.update(cpu, memory);
                    !health.overloaded
                };

                hub.broadcast(HubMessage::SystemMetrics(SystemMetricsMessage {
                    healthy,
                    cpu_percent: cpu,
                    memory_percent: memory,
                    active_streams: relay_monitor.active_session_count().await as i32,
                }))
                .await;
            }
        });
    }

    // Create router with static file serving
    let serve_dir = ServeDir::new(&state.config.static_dir).not_found_service(ServeFile::new(
        state.config.static_dir.join("index.html"),
    ));

    let app = web_api::create_router(state.clone())
        .fallback_service(serve_dir)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http());

    // Start server
    let addr = format!("{}:{}", state.config.host, state.config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Listening on {}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}

/// Wire channel message types to their view-update handlers
async fn register_channel_handlers(
    channel: &RealtimeChannel,
    orchestrator: &Arc<TaskOrchestrator>,
    hub: &Arc<RealtimeHub>,
    event_log: &Arc<EventLogService>,
) {
    {
        let orchestrator = orchestrator.clone();
        let hub = hub.clone();
        channel
            .on(MSG_TASK_STATUS, move |data| {
                let orchestrator = orchestrator.clone();
                let hub = hub.clone();
                tokio::spawn(async move {
                    let update: TaskUpdate = match serde_json::from_value(data) {
                        Ok(update) => update,
                        Err(e) => {
                            tracing::warn!(error = %e, "Malformed task update");
                            return;
                        }
                    };
                    if let Some(task) = orchestrator.apply_update(update).await {
                        hub.broadcast(HubMessage::TaskStatus(TaskStatusMessage {
                            id: task.id.clone(),
                            status: task.status,
                            progress: task.progress,
                            timestamp: task.updated_at.to_rfc3339(),
                        }))
                        .await;
                    }
                });
            })
            .await;
    }

    {
        let hub = hub.clone();
        channel
            .on(MSG_SYSTEM_METRICS, move |data| {
                let hub = hub.clone();
                tokio::spawn(async move {
                    match serde_json::from_value::<SystemMetricsMessage>(data) {
                        Ok(metrics) => {
                            hub.broadcast(HubMessage::SystemMetrics(metrics)).await;
                        }
                        Err(e) => {
                            tracing::debug!(error = %e, "Unrecognized metrics snapshot shape");
                        }
                    }
                });
            })
            .await;
    }

    {
        let hub = hub.clone();
        channel
            .on(MSG_DEVICE_STATUS, move |data| {
                let hub = hub.clone();
                tokio::spawn(async move {
                    match serde_json::from_value::<DeviceStatusMessage>(data) {
                        Ok(status) => {
                            hub.broadcast(HubMessage::DeviceStatus(status)).await;
                        }
                        Err(e) => {
                            tracing::debug!(error = %e, "Unrecognized device status shape");
                        }
                    }
                });
            })
            .await;
    }

    {
        let hub = hub.clone();
        let event_log = event_log.clone();
        channel
            .on(MSG_DETECTION_EVENT, move |data| {
                let hub = hub.clone();
                let event_log = event_log.clone();
                tokio::spawn(async move {
                    let event: DetectionEvent = match serde_json::from_value(data) {
                        Ok(event) => event,
                        Err(e) => {
                            tracing::warn!(error = %e, "Malformed detection event");
                            return;
                        }
                    };
                    let event_id = event_log.add_event(event.clone()).await;
                    hub.broadcast(HubMessage::DetectionEvent(DetectionEventMessage {
                        event_id,
                        source: event.source,
                        label: event.label,
                        severity: event.severity,
                        timestamp: event.detected_at.to_rfc3339(),
                    }))
                    .await;
                });
            })
            .await;
    }
}
