//! Capture backends
//!
//! Backends are the seam between probe/relay logic and the platform capture
//! APIs. Production backends drive an ffmpeg subprocess against the platform
//! demuxer; tests substitute scripted implementations.

use crate::error::{Error, Result};
use async_trait::async_trait;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;

use super::types::BackendId;

/// Hard bound on a single frame grab
const FRAME_READ_TIMEOUT: Duration = Duration::from_secs(10);

/// One captured frame (JPEG bytes)
#[derive(Debug, Clone)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
}

/// A capture API capable of opening a device index
#[async_trait]
pub trait CaptureBackend: Send + Sync {
    fn id(&self) -> BackendId;

    /// Open the device. Success means the device node/API accepted the open,
    /// not that frames will follow.
    async fn open(&self, index: u32) -> Result<Box<dyn CaptureHandle>>;
}

/// An open device delivering frames
#[async_trait]
pub trait CaptureHandle: Send {
    async fn read_frame(&mut self) -> Result<Frame>;
}

/// Backends in priority order for this platform
pub fn default_backends() -> Vec<Arc<dyn CaptureBackend>> {
    #[cfg(target_os = "macos")]
    {
        vec![Arc::new(FfmpegBackend::new(BackendId::AvFoundation))]
    }
    #[cfg(not(target_os = "macos"))]
    {
        vec![
            Arc::new(FfmpegBackend::new(BackendId::V4l2)),
            Arc::new(FfmpegBackend::new(BackendId::V4l2Mjpeg)),
        ]
    }
}

/// ffmpeg-subprocess backend
///
/// Grabs single JPEG frames from the platform demuxer over stdout. Frame
/// dimensions come from the JPEG SOF header, so no image decoding is needed.
pub struct FfmpegBackend {
    id: BackendId,
}

impl FfmpegBackend {
    pub fn new(id: BackendId) -> Self {
        Self { id }
    }

    fn input_args(&self, index: u32) -> Vec<String> {
        match self.id {
            BackendId::V4l2 => vec![
                "-f".into(),
                "v4l2".into(),
                "-i".into(),
                format!("/dev/video{}", index),
            ],
            BackendId::V4l2Mjpeg => vec![
                "-f".into(),
                "v4l2".into(),
                "-input_format".into(),
                "mjpeg".into(),
                "-i".into(),
                format!("/dev/video{}", index),
            ],
            BackendId::AvFoundation => vec![
                "-f".into(),
                "avfoundation".into(),
                "-framerate".into(),
                "30".into(),
                "-i".into(),
                format!("{}:", index),
            ],
        }
    }
}

#[async_trait]
impl CaptureBackend for FfmpegBackend {
    fn id(&self) -> BackendId {
        self.id
    }

    async fn open(&self, index: u32) -> Result<Box<dyn CaptureHandle>> {
        // V4L2 devices have a node we can check before spawning ffmpeg
        if matches!(self.id, BackendId::V4l2 | BackendId::V4l2Mjpeg) {
            let path = format!("/dev/video{}", index);
            if tokio::fs::metadata(&path).await.is_err() {
                return Err(Error::Capture(format!("no such device: {}", path)));
            }
        }

        Ok(Box::new(FfmpegHandle {
            input_args: self.input_args(index),
            index,
            backend: self.id,
        }))
    }
}

struct FfmpegHandle {
    input_args: Vec<String>,
    index: u32,
    backend: BackendId,
}

#[async_trait]
impl CaptureHandle for FfmpegHandle {
    async fn read_frame(&mut self) -> Result<Frame> {
        let mut cmd = Command::new("ffmpeg");
        cmd.arg("-hide_banner")
            .arg("-loglevel")
            .arg("error")
            .args(&self.input_args)
            .args(["-frames:v", "1", "-c:v", "mjpeg", "-f", "image2", "pipe:1"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = tokio::time::timeout(FRAME_READ_TIMEOUT, cmd.output())
            .await
            .map_err(|_| {
                Error::Capture(format!(
                    "frame grab timed out (device {}, backend {})",
                    self.index,
                    self.backend.as_str()
                ))
            })??;

        if !output.status.success() || output.stdout.is_empty() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::Capture(format!(
                "ffmpeg frame grab failed (device {}, backend {}): {}",
                self.index,
                self.backend.as_str(),
                stderr.trim()
            )));
        }

        let data = output.stdout;
        let (width, height) = jpeg_dimensions(&data).ok_or_else(|| {
            Error::Capture(format!(
                "unparseable frame from device {} (backend {})",
                self.index,
                self.backend.as_str()
            ))
        })?;

        Ok(Frame {
            width,
            height,
            data,
        })
    }
}

/// Extract pixel dimensions from a JPEG SOF marker
pub fn jpeg_dimensions(data: &[u8]) -> Option<(u32, u32)> {
    if data.len() < 4 || data[0] != 0xFF || data[1] != 0xD8 {
        return None;
    }

    let mut i = 2;
    while i + 4 <= data.len() {
        if data[i] != 0xFF {
            return None;
        }
        let marker = data[i + 1];

        // Standalone markers carry no length field
        if (0xD0..=0xD9).contains(&marker) || marker == 0x01 {
            i += 2;
            continue;
        }

        let len = ((data[i + 2] as usize) << 8) | data[i + 3] as usize;
        if len < 2 || i + 2 + len > data.len() {
            return None;
        }

        match marker {
            // SOF0..SOF15 except DHT/JPG/DAC
            0xC0..=0xC3 | 0xC5..=0xC7 | 0xC9..=0xCB | 0xCD..=0xCF => {
                if len >= 7 {
                    let height = ((data[i + 5] as u32) << 8) | data[i + 6] as u32;
                    let width = ((data[i + 7] as u32) << 8) | data[i + 8] as u32;
                    return Some((width, height));
                }
                return None;
            }
            _ => i += 2 + len,
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_jpeg(width: u16, height: u16) -> Vec<u8> {
        let mut data = vec![0xFF, 0xD8];
        // APP0 stub
        data.extend_from_slice(&[0xFF, 0xE0, 0x00, 0x04, 0x00, 0x00]);
        // SOF0: len=11, precision, height, width, 1 component
        data.extend_from_slice(&[0xFF, 0xC0, 0x00, 0x0B, 0x08]);
        data.extend_from_slice(&height.to_be_bytes());
        data.extend_from_slice(&width.to_be_bytes());
        data.extend_from_slice(&[0x01, 0x01, 0x11, 0x00]);
        data.extend_from_slice(&[0xFF, 0xD9]);
        data
    }

    #[test]
    fn test_jpeg_dimensions() {
        let data = minimal_jpeg(1280, 720);
        assert_eq!(jpeg_dimensions(&data), Some((1280, 720)));
    }

    #[test]
    fn test_jpeg_dimensions_rejects_garbage() {
        assert_eq!(jpeg_dimensions(&[0x00, 0x01, 0x02]), None);
        assert_eq!(jpeg_dimensions(&[]), None);
    }
}
