//! StreamRelay - Viewer-Bound Frame Relays
//!
//! ## Responsibilities
//!
//! - One relay session per device index, with lifecycle bound to viewers:
//!   the source starts on the 0->1 viewer transition and stops on 1->0
//! - Continuous pull-based frame fetch at a configurable cadence
//! - A fetch failure marks the session inactive and surfaces the error to
//!   every attached viewer; recovery requires an explicit new attach
//!
//! The session holds the device's capture lease for its whole lifetime, so
//! probing and relaying the same index can never overlap.

use crate::capture_registry::{CaptureLease, CaptureRegistry};
use crate::device_probe::{CaptureBackend, CaptureHandle, Frame};
use crate::error::{Error, Result};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Broadcast capacity per session; slow viewers skip frames rather than
/// stalling the source
const FRAME_CHANNEL_CAPACITY: usize = 8;

/// Bound on a one-shot preview grab
const PREVIEW_TIMEOUT: Duration = Duration::from_secs(5);

/// Event delivered to viewers
#[derive(Debug, Clone)]
pub enum StreamEvent {
    Frame(Arc<Frame>),
    /// The source died; the session is inactive from here on
    Failed(String),
}

/// Session summary for the status surface
#[derive(Debug, Clone, Serialize)]
pub struct StreamSessionInfo {
    pub device_index: u32,
    pub viewer_count: usize,
    pub active: bool,
}

/// StreamRelay instance
pub struct StreamRelay {
    registry: Arc<CaptureRegistry>,
    backends: Vec<Arc<dyn CaptureBackend>>,
    sessions: RwLock<HashMap<u32, Arc<StreamSession>>>,
    cadence: Duration,
}

impl StreamRelay {
    /// Create new StreamRelay
    pub fn new(
        registry: Arc<CaptureRegistry>,
        backends: Vec<Arc<dyn CaptureBackend>>,
        cadence: Duration,
    ) -> Self {
        Self {
            registry,
            backends,
            sessions: RwLock::new(HashMap::new()),
            cadence,
        }
    }

    /// Attach a viewer to a device stream
    ///
    /// The first viewer acquires the device lease and starts the frame
    /// source; later viewers share the running session.
    pub async fn attach(&self, device_index: u32) -> Result<ViewerHandle> {
        let mut sessions = self.sessions.write().await;

        if let Some(session) = sessions.get(&device_index) {
            if session.is_active() {
                let rx = session.frames.subscribe();
                let count = session.viewer_count.fetch_add(1, Ordering::SeqCst) + 1;
                tracing::debug!(
                    device_index = device_index,
                    viewer_count = count,
                    "Viewer attached to running session"
                );
                return Ok(ViewerHandle {
                    session: session.clone(),
                    rx,
                    detached: false,
                });
            }
        }

        // First viewer: take the exclusive handle and bring the source up
        let lease = self
            .registry
            .try_acquire(device_index)
            .await
            .ok_or_else(|| Error::DeviceBusy {
                index: device_index,
                message: "held by another consumer".to_string(),
            })?;

        let handle = open_first(&self.backends, device_index).await?;

        let (tx, rx) = broadcast::channel(FRAME_CHANNEL_CAPACITY);
        let session = Arc::new(StreamSession {
            device_index,
            viewer_count: AtomicUsize::new(1),
            active: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
            frames: tx,
            last_error: std::sync::RwLock::new(None),
            task: std::sync::Mutex::new(None),
        });

        let task = tokio::spawn(pull_loop(session.clone(), handle, lease, self.cadence));
        *session.task.lock().unwrap() = Some(task);

        sessions.insert(device_index, session.clone());
        tracing::info!(device_index = device_index, "Stream session started");

        Ok(ViewerHandle {
            session,
            rx,
            detached: false,
        })
    }

    /// One-shot preview frame
    ///
    /// Serves from the live session when one is up (the handle is exclusive),
    /// otherwise grabs a single frame under a short-lived lease.
    pub async fn preview(&self, device_index: u32) -> Result<Frame> {
        let live = {
            let sessions = self.sessions.read().await;
            sessions
                .get(&device_index)
                .filter(|s| s.is_active())
                .cloned()
        };

        if let Some(session) = live {
            let mut rx = session.frames.subscribe();
            return tokio::time::timeout(PREVIEW_TIMEOUT, async {
                loop {
                    match rx.recv().await {
                        Ok(StreamEvent::Frame(frame)) => return Ok((*frame).clone()),
                        Ok(StreamEvent::Failed(e)) => return Err(Error::Capture(e)),
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => {
                            return Err(Error::Capture("stream stopped".to_string()))
                        }
                    }
                }
            })
            .await
            .map_err(|_| Error::Capture("preview timed out".to_string()))?;
        }

        let _lease = self
            .registry
            .try_acquire(device_index)
            .await
            .ok_or_else(|| Error::DeviceBusy {
                index: device_index,
                message: "held by another consumer".to_string(),
            })?;

        let mut handle = open_first(&self.backends, device_index).await?;
        handle.read_frame().await
    }

    /// Number of live sessions
    pub async fn active_session_count(&self) -> usize {
        let sessions = self.sessions.read().await;
        sessions.values().filter(|s| s.is_active()).count()
    }

    /// Session summaries
    pub async fn list_sessions(&self) -> Vec<StreamSessionInfo> {
        let sessions = self.sessions.read().await;
        sessions
            .values()
            .map(|s| StreamSessionInfo {
                device_index: s.device_index,
                viewer_count: s.viewer_count.load(Ordering::SeqCst),
                active: s.is_active(),
            })
            .collect()
    }
}

/// A live relay for one device
pub struct StreamSession {
    device_index: u32,
    viewer_count: AtomicUsize,
    active: AtomicBool,
    stopped: AtomicBool,
    frames: broadcast::Sender<StreamEvent>,
    last_error: std::sync::RwLock<Option<String>>,
    task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl StreamSession {
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst) && !self.stopped.load(Ordering::SeqCst)
    }

    /// Stop the frame source; releases the device lease. Idempotent - the
    /// source stops exactly once however many times this is reached.
    fn stop_source(&self) {
        if self
            .stopped
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            if let Some(task) = self.task.lock().unwrap().take() {
                task.abort();
            }
            self.active.store(false, Ordering::SeqCst);
            tracing::info!(device_index = self.device_index, "Stream source stopped");
        }
    }
}

/// Viewer handle; detaching (or dropping) decrements the session's count
pub struct ViewerHandle {
    session: Arc<StreamSession>,
    rx: broadcast::Receiver<StreamEvent>,
    detached: bool,
}

impl ViewerHandle {
    pub fn device_index(&self) -> u32 {
        self.session.device_index
    }

    /// Next stream event; slow viewers skip lagged frames
    pub async fn next_event(&mut self) -> Result<StreamEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Ok(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!(
                        device_index = self.session.device_index,
                        skipped = skipped,
                        "Viewer lagged - frames skipped"
                    );
                }
                Err(broadcast::error::RecvError::Closed) => {
                    let message = self
                        .session
                        .last_error
                        .read()
                        .unwrap()
                        .clone()
                        .unwrap_or_else(|| "stream stopped".to_string());
                    return Err(Error::Capture(message));
                }
            }
        }
    }

    /// Detach this viewer
    pub fn detach(self) {
        // Drop impl does the bookkeeping
    }

    fn release(&mut self) {
        if self.detached {
            return;
        }
        self.detached = true;

        let remaining = self.session.viewer_count.fetch_sub(1, Ordering::SeqCst) - 1;
        tracing::debug!(
            device_index = self.session.device_index,
            viewer_count = remaining,
            "Viewer detached"
        );

        if remaining == 0 {
            self.session.stop_source();
        }
    }
}

impl Drop for ViewerHandle {
    fn drop(&mut self) {
        self.release();
    }
}

/// Open the device on the first backend that accepts it (priority order)
async fn open_first(
    backends: &[Arc<dyn CaptureBackend>],
    device_index: u32,
) -> Result<Box<dyn CaptureHandle>> {
    let mut last_error = None;

    for backend in backends {
        match backend.open(device_index).await {
            Ok(handle) => {
                tracing::debug!(
                    device_index = device_index,
                    backend = backend.id().as_str(),
                    "Device opened for streaming"
                );
                return Ok(handle);
            }
            Err(e) => {
                tracing::debug!(
                    device_index = device_index,
                    backend = backend.id().as_str(),
                    error = %e,
                    "Backend open failed"
                );
                last_error = Some(e);
            }
        }
    }

    Err(last_error
        .unwrap_or_else(|| Error::Capture(format!("no backend opened device {}", device_index))))
}

/// Fetch loop: frames at the configured cadence until the source dies
async fn pull_loop(
    session: Arc<StreamSession>,
    mut handle: Box<dyn CaptureHandle>,
    lease: CaptureLease,
    cadence: Duration,
) {
    let _lease = lease;
    let mut ticker = tokio::time::interval(cadence);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;

        match handle.read_frame().await {
            Ok(frame) => {
                let _ = session.frames.send(StreamEvent::Frame(Arc::new(frame)));
            }
            Err(e) => {
                // A dead stream must be visible, never silently stale
                tracing::warn!(
                    device_index = session.device_index,
                    error = %e,
                    "Stream fetch failed - session marked inactive"
                );
                *session.last_error.write().unwrap() = Some(e.to_string());
                session.active.store(false, Ordering::SeqCst);
                let _ = session.frames.send(StreamEvent::Failed(e.to_string()));
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device_probe::BackendId;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicU32;

    struct FakeBackend {
        opens: AtomicU32,
        /// Fail reads after this many successful frames (None = never)
        fail_after: Option<u32>,
    }

    impl FakeBackend {
        fn new(fail_after: Option<u32>) -> Arc<Self> {
            Arc::new(Self {
                opens: AtomicU32::new(0),
                fail_after,
            })
        }

        fn open_count(&self) -> u32 {
            self.opens.load(Ordering::SeqCst)
        }
    }

    struct FakeHandle {
        reads: u32,
        fail_after: Option<u32>,
    }

    #[async_trait]
    impl CaptureHandle for FakeHandle {
        async fn read_frame(&mut self) -> Result<Frame> {
            if let Some(limit) = self.fail_after {
                if self.reads >= limit {
                    return Err(Error::Capture("device unplugged".to_string()));
                }
            }
            self.reads += 1;
            Ok(Frame {
                width: 640,
                height: 480,
                data: vec![0xFF, 0xD8, 0xFF, 0xD9],
            })
        }
    }

    #[async_trait]
    impl CaptureBackend for FakeBackend {
        fn id(&self) -> BackendId {
            BackendId::V4l2
        }

        async fn open(&self, _index: u32) -> Result<Box<dyn CaptureHandle>> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(FakeHandle {
                reads: 0,
                fail_after: self.fail_after,
            }))
        }
    }

    fn relay_with(
        registry: Arc<CaptureRegistry>,
        backend: Arc<FakeBackend>,
    ) -> StreamRelay {
        StreamRelay::new(registry, vec![backend], Duration::from_millis(1))
    }

    async fn wait_for_lease(registry: &CaptureRegistry, index: u32) -> CaptureLease {
        for _ in 0..1000 {
            if let Some(lease) = registry.try_acquire(index).await {
                return lease;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        panic!("lease for index {} never released", index);
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_viewer_shares_the_source() {
        let registry = Arc::new(CaptureRegistry::new());
        let backend = FakeBackend::new(None);
        let relay = relay_with(registry, backend.clone());

        let mut first = relay.attach(0).await.unwrap();
        let mut second = relay.attach(0).await.unwrap();

        assert_eq!(backend.open_count(), 1);
        assert_eq!(relay.active_session_count().await, 1);

        assert!(matches!(
            first.next_event().await.unwrap(),
            StreamEvent::Frame(_)
        ));
        assert!(matches!(
            second.next_event().await.unwrap(),
            StreamEvent::Frame(_)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_last_detach_stops_source_and_releases_lease() {
        let registry = Arc::new(CaptureRegistry::new());
        let backend = FakeBackend::new(None);
        let relay = relay_with(registry.clone(), backend.clone());

        let first = relay.attach(0).await.unwrap();
        let second = relay.attach(0).await.unwrap();

        first.detach();
        assert_eq!(relay.active_session_count().await, 1);

        drop(second);
        let _lease = wait_for_lease(&registry, 0).await;
        assert_eq!(relay.active_session_count().await, 0);

        // A new attach after shutdown starts a fresh source
        drop(_lease);
        let _third = relay.attach(0).await.unwrap();
        assert_eq!(backend.open_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_failure_surfaces_to_viewers() {
        let registry = Arc::new(CaptureRegistry::new());
        let backend = FakeBackend::new(Some(2));
        let relay = relay_with(registry.clone(), backend.clone());

        let mut viewer = relay.attach(0).await.unwrap();

        let mut frames = 0;
        loop {
            match viewer.next_event().await.unwrap() {
                StreamEvent::Frame(_) => frames += 1,
                StreamEvent::Failed(message) => {
                    assert!(message.contains("unplugged"));
                    break;
                }
            }
        }
        assert_eq!(frames, 2);

        // No silent retry: the session is dead until a new attach
        assert_eq!(relay.active_session_count().await, 0);
        drop(viewer);
        let lease = wait_for_lease(&registry, 0).await;
        drop(lease);

        let _viewer = relay.attach(0).await.unwrap();
        assert_eq!(backend.open_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attach_conflicts_with_held_device() {
        let registry = Arc::new(CaptureRegistry::new());
        let backend = FakeBackend::new(None);
        let relay = relay_with(registry.clone(), backend);

        let _lease = registry.acquire(0).await.unwrap();

        let result = relay.attach(0).await;
        assert!(matches!(result, Err(Error::DeviceBusy { index: 0, .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_preview_without_session_releases_lease() {
        let registry = Arc::new(CaptureRegistry::new());
        let backend = FakeBackend::new(None);
        let relay = relay_with(registry.clone(), backend.clone());

        let frame = relay.preview(0).await.unwrap();
        assert_eq!(frame.width, 640);
        assert_eq!(backend.open_count(), 1);

        // One-shot grab released the handle
        assert!(registry.try_acquire(0).await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_preview_uses_live_session() {
        let registry = Arc::new(CaptureRegistry::new());
        let backend = FakeBackend::new(None);
        let relay = relay_with(registry, backend.clone());

        let _viewer = relay.attach(0).await.unwrap();
        let frame = relay.preview(0).await.unwrap();
        assert_eq!(frame.width, 640);

        // Served from the session, no second open
        assert_eq!(backend.open_count(), 1);
    }
}
