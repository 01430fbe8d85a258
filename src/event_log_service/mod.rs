//! EventLogService - Detection Event Recording (Ring Buffer)
//!
//! ## Responsibilities
//!
//! - Store detection-event notifications in a bounded ring buffer
//! - Provide recent-event queries for the dashboard
//!
//! Events arrive over the realtime channel; the pipeline service owns
//! durable storage, so this buffer is display-only.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tokio::sync::RwLock;

/// Detection event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionEvent {
    #[serde(default)]
    pub event_id: u64,
    /// Camera or task that produced the detection
    pub source: String,
    pub label: String,
    pub severity: i32,
    pub detected_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attributes: Option<serde_json::Value>,
}

/// Ring buffer for events
struct EventRingBuffer {
    events: VecDeque<DetectionEvent>,
    capacity: usize,
    next_id: u64,
}

impl EventRingBuffer {
    fn new(capacity: usize) -> Self {
        Self {
            events: VecDeque::with_capacity(capacity),
            capacity,
            next_id: 1,
        }
    }

    fn push(&mut self, mut event: DetectionEvent) -> u64 {
        event.event_id = self.next_id;
        self.next_id += 1;

        if self.events.len() >= self.capacity {
            self.events.pop_front();
        }
        self.events.push_back(event);
        self.next_id - 1
    }

    fn get_latest(&self, count: usize) -> Vec<DetectionEvent> {
        self.events.iter().rev().take(count).cloned().collect()
    }

    fn get_by_source(&self, source: &str, count: usize) -> Vec<DetectionEvent> {
        self.events
            .iter()
            .rev()
            .filter(|e| e.source == source)
            .take(count)
            .cloned()
            .collect()
    }
}

/// EventLogService instance
pub struct EventLogService {
    buffer: RwLock<EventRingBuffer>,
}

impl EventLogService {
    /// Create new EventLogService
    pub fn new(capacity: usize) -> Self {
        Self {
            buffer: RwLock::new(EventRingBuffer::new(capacity)),
        }
    }

    /// Add event, returns the assigned id
    pub async fn add_event(&self, event: DetectionEvent) -> u64 {
        let mut buffer = self.buffer.write().await;
        let id = buffer.push(event);
        tracing::debug!(event_id = id, "Event added to ring buffer");
        id
    }

    /// Get latest events
    pub async fn get_latest(&self, count: usize) -> Vec<DetectionEvent> {
        let buffer = self.buffer.read().await;
        buffer.get_latest(count)
    }

    /// Get events for one source
    pub async fn get_by_source(&self, source: &str, count: usize) -> Vec<DetectionEvent> {
        let buffer = self.buffer.read().await;
        buffer.get_by_source(source, count)
    }

    /// Get event count
    pub async fn count(&self) -> usize {
        let buffer = self.buffer.read().await;
        buffer.events.len()
    }
}

impl Default for EventLogService {
    fn default() -> Self {
        Self::new(2000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(source: &str) -> DetectionEvent {
        DetectionEvent {
            event_id: 0,
            source: source.to_string(),
            label: "person".to_string(),
            severity: 2,
            detected_at: Utc::now(),
            attributes: None,
        }
    }

    #[tokio::test]
    async fn test_ids_are_assigned_sequentially() {
        let log = EventLogService::new(10);
        assert_eq!(log.add_event(event("cam-0")).await, 1);
        assert_eq!(log.add_event(event("cam-0")).await, 2);
        assert_eq!(log.count().await, 2);
    }

    #[tokio::test]
    async fn test_capacity_evicts_oldest() {
        let log = EventLogService::new(2);
        log.add_event(event("cam-0")).await;
        log.add_event(event("cam-1")).await;
        log.add_event(event("cam-2")).await;

        assert_eq!(log.count().await, 2);
        let latest = log.get_latest(10).await;
        assert_eq!(latest[0].source, "cam-2");
        assert_eq!(latest[1].source, "cam-1");
    }

    #[tokio::test]
    async fn test_filter_by_source() {
        let log = EventLogService::new(10);
        log.add_event(event("cam-0")).await;
        log.add_event(event("cam-1")).await;
        log.add_event(event("cam-0")).await;

        let filtered = log.get_by_source("cam-0", 10).await;
        assert_eq!(filtered.len(), 2);
        assert!(filtered.iter().all(|e| e.source == "cam-0"));
    }
}
