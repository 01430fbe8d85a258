//! DeviceProbe types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Capture backend identifier
///
/// Each backend is a distinct capture path with its own reliability profile;
/// a device that fails bring-up on one may still deliver frames on another.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendId {
    /// Video4Linux2, format auto-negotiated
    V4l2,
    /// Video4Linux2 forcing the MJPEG stream (some UVC devices only
    /// deliver usable frames this way)
    V4l2Mjpeg,
    /// AVFoundation (macOS)
    AvFoundation,
}

impl BackendId {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendId::V4l2 => "v4l2",
            BackendId::V4l2Mjpeg => "v4l2_mjpeg",
            BackendId::AvFoundation => "avfoundation",
        }
    }
}

/// Outcome of one backend attempt against one device index
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeAttempt {
    pub backend: BackendId,
    pub opened: bool,
    pub frame_ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    pub elapsed_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// One scanned capture device
///
/// `frame_ok == true` implies `width` and `height` are set and positive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub index: u32,
    pub backend: Option<BackendId>,
    pub frame_ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    pub attempts: Vec<ProbeAttempt>,
}

impl Device {
    /// Unresolved device placeholder (no backend delivered frames)
    pub fn unavailable(index: u32, attempts: Vec<ProbeAttempt>) -> Self {
        Self {
            index,
            backend: None,
            frame_ok: false,
            width: None,
            height: None,
            attempts,
        }
    }
}

/// Scan parameters
#[derive(Debug, Clone, Copy)]
pub struct ScanOptions {
    /// Probe indices 0..max_index
    pub max_index: u32,
    /// Frames that must be read before a backend is trusted
    pub warmup_frames: u32,
    /// Attempt every backend even after one succeeded (diagnostics)
    pub force_probe: bool,
    /// Additional per-index retry rounds after all backends failed
    pub retries: u32,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            max_index: 4,
            warmup_frames: 2,
            force_probe: false,
            retries: 1,
        }
    }
}

/// Scan result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanReport {
    pub devices: Vec<Device>,
    pub available_indices: Vec<u32>,
    pub count: usize,
    pub scanned_at: DateTime<Utc>,
}
