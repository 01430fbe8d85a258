//! CaptureRegistry - per-device capture handle leases
//!
//! ## Responsibilities
//!
//! - One owned lease per device index (hardware handles are exclusive)
//! - Probe and relay code paths acquire through the same registry
//! - Lease released automatically on drop

use crate::error::{Error, Result};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::time::timeout;

/// Default wait timeout when acquiring a held lease (5s)
const DEFAULT_WAIT_TIMEOUT_MS: u64 = 5000;

/// CaptureRegistry - serializes access to capture device handles
pub struct CaptureRegistry {
    /// Lock per device index
    locks: RwLock<HashMap<u32, Arc<Mutex<()>>>>,
    /// Wait timeout for blocking acquisition
    wait_timeout: Duration,
}

impl CaptureRegistry {
    /// Create new registry
    pub fn new() -> Self {
        Self {
            locks: RwLock::new(HashMap::new()),
            wait_timeout: Duration::from_millis(DEFAULT_WAIT_TIMEOUT_MS),
        }
    }

    /// Create with a specific wait timeout
    pub fn with_timeout(timeout_ms: u64) -> Self {
        Self {
            locks: RwLock::new(HashMap::new()),
            wait_timeout: Duration::from_millis(timeout_ms),
        }
    }

    /// Acquire the lease for a device index, waiting briefly if held
    ///
    /// - Waits up to the configured timeout while another holder finishes
    /// - Returns `Error::DeviceBusy` on timeout
    /// - The returned `CaptureLease` releases on drop
    pub async fn acquire(&self, index: u32) -> Result<CaptureLease> {
        let lock = self.get_or_create_lock(index).await;

        match timeout(self.wait_timeout, lock.clone().lock_owned()).await {
            Ok(guard) => {
                tracing::debug!(device_index = index, "Capture lease acquired");
                Ok(CaptureLease {
                    index,
                    _guard: guard,
                })
            }
            Err(_) => {
                tracing::warn!(
                    device_index = index,
                    timeout_ms = self.wait_timeout.as_millis(),
                    "Capture lease timeout - device busy"
                );
                Err(Error::DeviceBusy {
                    index,
                    message: "held by another consumer".to_string(),
                })
            }
        }
    }

    /// Try to acquire the lease without waiting
    ///
    /// Returns `None` immediately when another consumer holds the handle.
    pub async fn try_acquire(&self, index: u32) -> Option<CaptureLease> {
        let lock = self.get_or_create_lock(index).await;

        match lock.clone().try_lock_owned() {
            Ok(guard) => {
                tracing::debug!(device_index = index, "Capture lease acquired (try)");
                Some(CaptureLease {
                    index,
                    _guard: guard,
                })
            }
            Err(_) => {
                tracing::debug!(device_index = index, "Capture lease denied - device busy");
                None
            }
        }
    }

    /// Get or create the lock for a device index
    async fn get_or_create_lock(&self, index: u32) -> Arc<Mutex<()>> {
        {
            let locks = self.locks.read().await;
            if let Some(lock) = locks.get(&index) {
                return lock.clone();
            }
        }

        let mut locks = self.locks.write().await;
        locks
            .entry(index)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Number of indices seen so far (debug)
    pub async fn lock_count(&self) -> usize {
        self.locks.read().await.len()
    }
}

impl Default for CaptureRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Capture lease - released automatically on drop
pub struct CaptureLease {
    index: u32,
    _guard: tokio::sync::OwnedMutexGuard<()>,
}

impl CaptureLease {
    pub fn index(&self) -> u32 {
        self.index
    }
}

impl Drop for CaptureLease {
    fn drop(&mut self) {
        tracing::debug!(device_index = self.index, "Capture lease released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_acquire_release() {
        let registry = CaptureRegistry::new();

        let lease = registry.acquire(0).await.unwrap();
        assert_eq!(lease.index(), 0);

        drop(lease);

        let _lease2 = registry.acquire(0).await.unwrap();
    }

    #[tokio::test]
    async fn test_try_acquire_busy() {
        let registry = CaptureRegistry::new();

        let _lease1 = registry.acquire(0).await.unwrap();

        let result = registry.try_acquire(0).await;
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_different_indices() {
        let registry = CaptureRegistry::new();

        let lease1 = registry.acquire(0).await.unwrap();
        let lease2 = registry.acquire(1).await.unwrap();

        assert_eq!(lease1.index(), 0);
        assert_eq!(lease2.index(), 1);
    }

    #[tokio::test]
    async fn test_acquire_timeout() {
        let registry = CaptureRegistry::with_timeout(100);

        let _lease1 = registry.acquire(0).await.unwrap();

        let result = registry.acquire(0).await;
        assert!(matches!(result, Err(Error::DeviceBusy { index: 0, .. })));
    }
}
