//! Liveness signal for the background loops.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Timestamp of the last iteration of one background loop.
///
/// Cloning shares the underlying timestamp, so the loop keeps one clone and the
/// health endpoint another.
#[derive(Debug, Clone)]
pub struct Heartbeat {
    name: &'static str,
    last_beat_ms: Arc<AtomicI64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LoopHealth {
    pub name: &'static str,
    pub alive: bool,
    pub last_beat: Option<DateTime<Utc>>,
}

impl Heartbeat {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            last_beat_ms: Arc::new(AtomicI64::new(0)),
        }
    }

    pub fn beat(&self) {
        self.last_beat_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    pub fn last_beat(&self) -> Option<DateTime<Utc>> {
        match self.last_beat_ms.load(Ordering::Relaxed) {
            0 => None,
            ms => DateTime::from_timestamp_millis(ms),
        }
    }

    pub fn check(&self, stale_after: Duration) -> LoopHealth {
        let last_beat = self.last_beat();
        let alive = last_beat
            .map(|at| {
                let age = Utc::now().signed_duration_since(at);
                age.to_std().map(|age| age <= stale_after).unwrap_or(true)
            })
            .unwrap_or(false);

        LoopHealth {
            name: self.name,
            alive,
            last_beat,
        }
    }
}
