//! VA31 Opsdeck Library
//!
//! Operator console backend for the video analytics pipeline.
//!
//! ## Architecture (9 Components)
//!
//! 1. CaptureRegistry - exclusive per-device capture leases
//! 2. DeviceProbe - capture device discovery and validation
//! 3. PipelineClient - pipeline service adapter
//! 4. TaskOrchestrator - analysis task lifecycle state machine
//! 5. RealtimeChannel - upstream status subscription with reconnect policy
//! 6. StatusPoller - degraded-mode polling fallback
//! 7. RealtimeHub - dashboard WebSocket distribution
//! 8. StreamRelay - viewer-bound frame relays
//! 9. WebAPI - REST API endpoints
//!
//! ## Design Principles
//!
//! - The pipeline service is the single source of truth; local stores are
//!   read-mostly caches merged from its updates
//! - One owner per mutable resource; the device handle is leased, never
//!   shared
//! - Transport and rendering are decoupled through typed messages

pub mod capture_registry;
pub mod device_probe;
pub mod event_log_service;
pub mod pipeline_client;
pub mod realtime_channel;
pub mod realtime_hub;
pub mod stream_relay;
pub mod task_orchestrator;
pub mod web_api;
pub mod error;
pub mod models;
pub mod state;

pub use error::{Error, Result};
pub use state::AppState;
