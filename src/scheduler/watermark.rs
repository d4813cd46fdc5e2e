use std::time::{Duration, Instant};

use serde::Serialize;

use crate::error::{Result, SchedulerError};
use crate::model::Ts;

/// Progress reported by one capture. `checkpoint_ts <= resolved_ts` always holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Watermark {
    checkpoint_ts: Ts,
    resolved_ts: Ts,
}

impl Watermark {
    pub fn new(checkpoint_ts: Ts, resolved_ts: Ts) -> Option<Self> {
        if checkpoint_ts > resolved_ts {
            return None;
        }
        Some(Self {
            checkpoint_ts,
            resolved_ts,
        })
    }

    /// Like [`Watermark::new`], naming the reporting capture in the error.
    pub fn reported_by(capture: &str, checkpoint_ts: Ts, resolved_ts: Ts) -> Result<Self> {
        Self::new(checkpoint_ts, resolved_ts).ok_or_else(|| SchedulerError::InvalidWatermark {
            capture: capture.to_string(),
            checkpoint_ts,
            resolved_ts,
        })
    }

    pub fn checkpoint_ts(&self) -> Ts {
        self.checkpoint_ts
    }

    pub fn resolved_ts(&self) -> Ts {
        self.resolved_ts
    }

    /// Component-wise minimum of two watermarks.
    pub fn min(self, other: Watermark) -> Watermark {
        Watermark {
            checkpoint_ts: self.checkpoint_ts.min(other.checkpoint_ts),
            resolved_ts: self.resolved_ts.min(other.resolved_ts),
        }
    }
}

/// Where the owner stands in the announce/sync handshake with a capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    /// Not yet announced to.
    Uninitialized,
    /// Announced, waiting for the sync report.
    SyncSent { since: Instant },
    /// The owner's view of this capture comes from its own report.
    Synced,
    /// The capture did not answer in time; its keyspans were released.
    TimedOut { since: Instant },
}

impl SyncStatus {
    pub fn is_synced(&self) -> bool {
        matches!(self, SyncStatus::Synced)
    }

    /// Whether the capture may receive new keyspans.
    pub fn is_schedulable(&self) -> bool {
        self.is_synced()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Uninitialized => "uninitialized",
            SyncStatus::SyncSent { .. } => "sync-sent",
            SyncStatus::Synced => "synced",
            SyncStatus::TimedOut { .. } => "timed-out",
        }
    }
}

/// Owner-side record of one capture.
#[derive(Debug, Clone)]
pub struct CaptureStatus {
    pub sync_status: SyncStatus,
    pub watermark: Option<Watermark>,
    pub processor_version: Option<String>,
}

impl Default for CaptureStatus {
    fn default() -> Self {
        Self::new()
    }
}

impl CaptureStatus {
    pub fn new() -> Self {
        Self {
            sync_status: SyncStatus::Uninitialized,
            watermark: None,
            processor_version: None,
        }
    }

    pub fn mark_announced(&mut self, now: Instant) {
        self.sync_status = SyncStatus::SyncSent { since: now };
    }

    pub fn mark_synced(&mut self, processor_version: String) {
        self.sync_status = SyncStatus::Synced;
        self.processor_version = Some(processor_version);
    }

    /// Returns true if the capture has waited longer than `timeout` for a sync
    /// report, or if a timed-out capture is due to be announced to again.
    pub fn handshake_expired(&self, now: Instant, timeout: Duration) -> bool {
        match self.sync_status {
            SyncStatus::SyncSent { since } | SyncStatus::TimedOut { since } => {
                now.saturating_duration_since(since) >= timeout
            }
            _ => false,
        }
    }

    pub fn update_watermark(&mut self, watermark: Watermark) {
        self.watermark = Some(watermark);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn watermark_rejects_regression() {
        assert!(Watermark::new(100, 120).is_some());
        assert!(Watermark::new(100, 100).is_some());
        assert!(Watermark::new(121, 120).is_none());
    }

    #[test]
    fn reported_by_names_capture() {
        let err = Watermark::reported_by("cap-1", 10, 5).unwrap_err();
        assert!(matches!(
            err,
            SchedulerError::InvalidWatermark { ref capture, checkpoint_ts: 10, resolved_ts: 5 }
                if capture == "cap-1"
        ));
    }

    #[test]
    fn watermark_min_is_component_wise() {
        let a = Watermark::new(100, 300).unwrap();
        let b = Watermark::new(80, 400).unwrap();
        let m = a.min(b);
        assert_eq!(m.checkpoint_ts(), 80);
        assert_eq!(m.resolved_ts(), 300);
    }

    #[test]
    fn handshake_expiry() {
        let start = Instant::now();
        let mut status = CaptureStatus::new();
        assert!(!status.handshake_expired(start, Duration::ZERO));

        status.mark_announced(start);
        assert!(!status.handshake_expired(start, Duration::from_secs(1)));
        assert!(status.handshake_expired(start + Duration::from_secs(1), Duration::from_secs(1)));

        status.mark_synced("v1".to_string());
        assert!(status.sync_status.is_synced());
        assert!(!status.handshake_expired(start + Duration::from_secs(60), Duration::from_secs(1)));
    }
}
