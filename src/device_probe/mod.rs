//! DeviceProbe - Capture Device Discovery
//!
//! ## Responsibilities
//!
//! - Enumerate candidate device indices 0..max_index
//! - Validate each through a bounded bring-up sequence (open + warmup frames)
//! - Try backends in fixed priority order, with per-index retry rounds
//! - Report a ranked availability list plus the full per-attempt log
//!
//! A failed attempt is never fatal to the scan; an index only counts as
//! unavailable after exhausting every backend across all retry rounds.
//! Backends for one index run strictly sequentially under that index's
//! capture lease; distinct indices probe concurrently up to a bounded
//! worker count.

mod backend;
mod types;

pub use backend::{default_backends, jpeg_dimensions, CaptureBackend, CaptureHandle, Frame};
pub use types::*;

use crate::capture_registry::CaptureRegistry;
use crate::error::{Error, Result};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;

/// Hard bound on one backend attempt (open + warmup reads)
const DEFAULT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(15);

/// Concurrent index probes
const DEFAULT_CONCURRENCY: usize = 4;

/// DeviceProbe service
pub struct DeviceProbe {
    backends: Vec<Arc<dyn CaptureBackend>>,
    registry: Arc<CaptureRegistry>,
    attempt_timeout: Duration,
    concurrency: usize,
}

impl DeviceProbe {
    /// Create with the platform backend set
    pub fn new(registry: Arc<CaptureRegistry>) -> Self {
        Self::with_backends(registry, default_backends())
    }

    /// Create with an explicit backend list (priority order)
    pub fn with_backends(
        registry: Arc<CaptureRegistry>,
        backends: Vec<Arc<dyn CaptureBackend>>,
    ) -> Self {
        Self {
            backends,
            registry,
            attempt_timeout: DEFAULT_ATTEMPT_TIMEOUT,
            concurrency: DEFAULT_CONCURRENCY,
        }
    }

    /// Override the per-attempt timeout
    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = timeout;
        self
    }

    /// Run a scan
    pub async fn scan(&self, opts: ScanOptions) -> Result<ScanReport> {
        if opts.max_index == 0 {
            return Err(Error::Validation("max_index must be positive".to_string()));
        }

        tracing::info!(
            max_index = opts.max_index,
            warmup_frames = opts.warmup_frames,
            force_probe = opts.force_probe,
            retries = opts.retries,
            "Starting device scan"
        );

        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut handles = Vec::new();

        for index in 0..opts.max_index {
            let permit = semaphore.clone().acquire_owned().await.unwrap();
            let backends = self.backends.clone();
            let registry = self.registry.clone();
            let attempt_timeout = self.attempt_timeout;

            let handle = tokio::spawn(async move {
                let device =
                    probe_index(index, &backends, &registry, attempt_timeout, opts).await;
                drop(permit);
                device
            });
            handles.push(handle);
        }

        let mut devices = Vec::new();
        for handle in handles {
            if let Ok(device) = handle.await {
                devices.push(device);
            }
        }
        devices.sort_by_key(|d| d.index);

        let available_indices: Vec<u32> = devices
            .iter()
            .filter(|d| d.frame_ok)
            .map(|d| d.index)
            .collect();

        tracing::info!(
            scanned = devices.len(),
            available = available_indices.len(),
            "Device scan complete"
        );

        Ok(ScanReport {
            count: devices.len(),
            devices,
            available_indices,
            scanned_at: chrono::Utc::now(),
        })
    }
}

/// Probe one index: backends in priority order, retry rounds on full failure
async fn probe_index(
    index: u32,
    backends: &[Arc<dyn CaptureBackend>],
    registry: &CaptureRegistry,
    attempt_timeout: Duration,
    opts: ScanOptions,
) -> Device {
    // The hardware handle is exclusive; never contend with an active stream
    let _lease = match registry.try_acquire(index).await {
        Some(lease) => lease,
        None => {
            tracing::warn!(
                device_index = index,
                "Index held by another consumer - skipping probe"
            );
            return Device::unavailable(index, Vec::new());
        }
    };

    let mut attempts = Vec::new();
    let mut resolved: Option<(BackendId, u32, u32)> = None;

    for round in 0..=opts.retries {
        if round > 0 {
            tracing::debug!(device_index = index, round = round, "Retry round");
        }

        for backend in backends {
            let attempt =
                try_backend(backend.as_ref(), index, opts.warmup_frames, attempt_timeout).await;

            let succeeded = attempt.frame_ok;
            if succeeded && resolved.is_none() {
                resolved = Some((
                    attempt.backend,
                    attempt.width.unwrap_or(0),
                    attempt.height.unwrap_or(0),
                ));
            }
            attempts.push(attempt);

            if succeeded && !opts.force_probe {
                break;
            }
        }

        if resolved.is_some() {
            break;
        }
    }

    match resolved {
        Some((backend, width, height)) => {
            tracing::info!(
                device_index = index,
                backend = backend.as_str(),
                width = width,
                height = height,
                "Device available"
            );
            Device {
                index,
                backend: Some(backend),
                frame_ok: true,
                width: Some(width),
                height: Some(height),
                attempts,
            }
        }
        None => {
            tracing::info!(
                device_index = index,
                attempts = attempts.len(),
                "Device unavailable after all backends and retries"
            );
            Device::unavailable(index, attempts)
        }
    }
}

/// One backend attempt: open, then read warmup frames, under a hard timeout
async fn try_backend(
    backend: &dyn CaptureBackend,
    index: u32,
    warmup_frames: u32,
    attempt_timeout: Duration,
) -> ProbeAttempt {
    let started = Instant::now();

    let outcome = tokio::time::timeout(attempt_timeout, async {
        let mut handle = match backend.open(index).await {
            Ok(handle) => handle,
            Err(e) => return (false, None, Some(e.to_string())),
        };

        let mut last_frame: Option<Frame> = None;
        for _ in 0..warmup_frames.max(1) {
            match handle.read_frame().await {
                Ok(frame) if frame.width > 0 && frame.height > 0 => {
                    last_frame = Some(frame);
                }
                Ok(_) => {
                    return (true, None, Some("frame with zero dimensions".to_string()));
                }
                Err(e) => return (true, None, Some(e.to_string())),
            }
        }
        (true, last_frame, None)
    })
    .await;

    let elapsed_ms = started.elapsed().as_millis() as u64;

    match outcome {
        Ok((opened, frame, error)) => {
            let attempt = ProbeAttempt {
                backend: backend.id(),
                opened,
                frame_ok: frame.is_some(),
                width: frame.as_ref().map(|f| f.width),
                height: frame.as_ref().map(|f| f.height),
                elapsed_ms,
                error,
            };
            tracing::debug!(
                device_index = index,
                backend = attempt.backend.as_str(),
                opened = attempt.opened,
                frame_ok = attempt.frame_ok,
                elapsed_ms = elapsed_ms,
                "Backend attempt finished"
            );
            attempt
        }
        Err(_) => {
            tracing::warn!(
                device_index = index,
                backend = backend.id().as_str(),
                timeout_ms = attempt_timeout.as_millis(),
                "Backend attempt timed out"
            );
            ProbeAttempt {
                backend: backend.id(),
                opened: false,
                frame_ok: false,
                width: None,
                height: None,
                elapsed_ms,
                error: Some(format!(
                    "attempt timed out after {}ms",
                    attempt_timeout.as_millis()
                )),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::{HashMap, VecDeque};
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::sync::Mutex;

    #[derive(Debug, Clone, Copy)]
    enum ScriptOutcome {
        /// open() fails
        OpenFail,
        /// open() succeeds, reads fail
        NoFrames,
        /// open() succeeds, frames delivered
        Frames(u32, u32),
    }

    struct ScriptBackend {
        id: BackendId,
        /// Per-index outcome queue; exhausted/missing entries mean OpenFail
        script: Mutex<HashMap<u32, VecDeque<ScriptOutcome>>>,
        opens: AtomicU32,
    }

    impl ScriptBackend {
        fn new(id: BackendId, script: Vec<(u32, Vec<ScriptOutcome>)>) -> Arc<Self> {
            let map = script
                .into_iter()
                .map(|(index, outcomes)| (index, outcomes.into_iter().collect()))
                .collect();
            Arc::new(Self {
                id,
                script: Mutex::new(map),
                opens: AtomicU32::new(0),
            })
        }

        fn open_count(&self) -> u32 {
            self.opens.load(Ordering::SeqCst)
        }
    }

    struct ScriptHandle {
        frame: Option<(u32, u32)>,
    }

    #[async_trait]
    impl CaptureHandle for ScriptHandle {
        async fn read_frame(&mut self) -> crate::error::Result<Frame> {
            match self.frame {
                Some((width, height)) => Ok(Frame {
                    width,
                    height,
                    data: vec![0xFF, 0xD8, 0xFF, 0xD9],
                }),
                None => Err(Error::Capture("no frames delivered".to_string())),
            }
        }
    }

    #[async_trait]
    impl CaptureBackend for ScriptBackend {
        fn id(&self) -> BackendId {
            self.id
        }

        async fn open(&self, index: u32) -> crate::error::Result<Box<dyn CaptureHandle>> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            let outcome = {
                let mut script = self.script.lock().await;
                script
                    .get_mut(&index)
                    .and_then(|queue| queue.pop_front())
                    .unwrap_or(ScriptOutcome::OpenFail)
            };

            match outcome {
                ScriptOutcome::OpenFail => {
                    Err(Error::Capture("device did not open".to_string()))
                }
                ScriptOutcome::NoFrames => Ok(Box::new(ScriptHandle { frame: None })),
                ScriptOutcome::Frames(w, h) => {
                    Ok(Box::new(ScriptHandle { frame: Some((w, h)) }))
                }
            }
        }
    }

    fn probe_with(backends: Vec<Arc<dyn CaptureBackend>>) -> DeviceProbe {
        DeviceProbe::with_backends(Arc::new(CaptureRegistry::new()), backends)
    }

    #[tokio::test]
    async fn test_scan_rejects_zero_max_index() {
        let probe = probe_with(vec![ScriptBackend::new(BackendId::V4l2, vec![])]);
        let result = probe
            .scan(ScanOptions {
                max_index: 0,
                ..Default::default()
            })
            .await;
        assert!(matches!(result, Err(Error::Validation(_))));
    }

    #[tokio::test]
    async fn test_scan_probes_all_indices() {
        let backend = ScriptBackend::new(
            BackendId::V4l2,
            vec![
                (0, vec![ScriptOutcome::Frames(640, 480)]),
                (1, vec![ScriptOutcome::Frames(640, 480)]),
                (2, vec![ScriptOutcome::Frames(1280, 720)]),
            ],
        );
        let probe = probe_with(vec![backend]);

        let report = probe
            .scan(ScanOptions {
                max_index: 3,
                warmup_frames: 1,
                force_probe: false,
                retries: 0,
            })
            .await
            .unwrap();

        assert_eq!(report.count, 3);
        assert_eq!(report.devices.len(), 3);
        assert_eq!(report.available_indices, vec![0, 1, 2]);
        for (i, device) in report.devices.iter().enumerate() {
            assert_eq!(device.index, i as u32);
            assert!(device.frame_ok);
            assert!(device.width.unwrap() > 0 && device.height.unwrap() > 0);
        }
    }

    #[tokio::test]
    async fn test_first_success_stops_backend_iteration() {
        let first = ScriptBackend::new(
            BackendId::V4l2,
            vec![(0, vec![ScriptOutcome::Frames(640, 480)])],
        );
        let second = ScriptBackend::new(BackendId::V4l2Mjpeg, vec![]);
        let probe = probe_with(vec![first.clone(), second.clone()]);

        let report = probe
            .scan(ScanOptions {
                max_index: 1,
                warmup_frames: 1,
                force_probe: false,
                retries: 0,
            })
            .await
            .unwrap();

        assert_eq!(report.devices[0].attempts.len(), 1);
        assert_eq!(report.devices[0].backend, Some(BackendId::V4l2));
        assert_eq!(second.open_count(), 0);
    }

    #[tokio::test]
    async fn test_force_probe_records_every_backend() {
        let first = ScriptBackend::new(
            BackendId::V4l2,
            vec![(0, vec![ScriptOutcome::Frames(640, 480)])],
        );
        let second = ScriptBackend::new(
            BackendId::V4l2Mjpeg,
            vec![(0, vec![ScriptOutcome::Frames(640, 480)])],
        );
        let probe = probe_with(vec![first, second.clone()]);

        let report = probe
            .scan(ScanOptions {
                max_index: 1,
                warmup_frames: 1,
                force_probe: true,
                retries: 0,
            })
            .await
            .unwrap();

        assert_eq!(report.devices[0].attempts.len(), 2);
        // Resolution keeps the first successful backend
        assert_eq!(report.devices[0].backend, Some(BackendId::V4l2));
        assert_eq!(second.open_count(), 1);
    }

    #[tokio::test]
    async fn test_retry_rounds_and_attempt_log() {
        // Index 0 succeeds immediately on backend A; index 1 fails everything
        // across both rounds; index 2 succeeds on backend B in the retry round.
        let backend_a = ScriptBackend::new(
            BackendId::V4l2,
            vec![
                (0, vec![ScriptOutcome::Frames(640, 480)]),
                (2, vec![ScriptOutcome::OpenFail, ScriptOutcome::OpenFail]),
            ],
        );
        let backend_b = ScriptBackend::new(
            BackendId::V4l2Mjpeg,
            vec![(
                2,
                vec![ScriptOutcome::NoFrames, ScriptOutcome::Frames(1920, 1080)],
            )],
        );
        let probe = probe_with(vec![backend_a, backend_b]);

        let report = probe
            .scan(ScanOptions {
                max_index: 3,
                warmup_frames: 2,
                force_probe: false,
                retries: 1,
            })
            .await
            .unwrap();

        assert_eq!(report.count, 3);
        assert_eq!(report.available_indices, vec![0, 2]);

        // Index 1: every backend failed in both rounds, all recorded
        let device1 = &report.devices[1];
        assert!(!device1.frame_ok);
        assert_eq!(device1.attempts.len(), 4);
        assert!(device1.attempts.iter().all(|a| !a.frame_ok));

        // Index 2: resolved on backend B in round two
        let device2 = &report.devices[2];
        assert_eq!(device2.backend, Some(BackendId::V4l2Mjpeg));
        assert_eq!(device2.width, Some(1920));
        assert_eq!(device2.attempts.len(), 4);
    }

    #[tokio::test]
    async fn test_busy_index_is_skipped() {
        let registry = Arc::new(CaptureRegistry::new());
        let backend = ScriptBackend::new(
            BackendId::V4l2,
            vec![(0, vec![ScriptOutcome::Frames(640, 480)])],
        );
        let probe = DeviceProbe::with_backends(registry.clone(), vec![backend.clone()]);

        let _lease = registry.acquire(0).await.unwrap();

        let report = probe
            .scan(ScanOptions {
                max_index: 1,
                warmup_frames: 1,
                force_probe: false,
                retries: 0,
            })
            .await
            .unwrap();

        assert!(!report.devices[0].frame_ok);
        assert!(report.devices[0].attempts.is_empty());
        assert!(report.available_indices.is_empty());
        assert_eq!(backend.open_count(), 0);
    }

    #[tokio::test]
    async fn test_unavailable_device_keeps_attempt_log() {
        let backend = ScriptBackend::new(BackendId::V4l2, vec![(0, vec![ScriptOutcome::NoFrames])]);
        let probe = probe_with(vec![backend]);

        let report = probe
            .scan(ScanOptions {
                max_index: 1,
                warmup_frames: 1,
                force_probe: false,
                retries: 0,
            })
            .await
            .unwrap();

        let device = &report.devices[0];
        assert!(!device.frame_ok);
        assert_eq!(device.attempts.len(), 1);
        assert!(device.attempts[0].opened);
        assert!(!device.attempts[0].frame_ok);
        assert!(report.available_indices.is_empty());
    }
}
