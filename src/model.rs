//! Identifiers and value types shared by the owner and processor sides.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifies one replication task.
pub type ChangeFeedId = String;

/// Identifies one processor instance. Stable for the lifetime of its process.
pub type CaptureId = String;

/// Identifies one contiguous key range.
pub type KeySpanId = u64;

/// Term number handed out by leader election. Never reused.
pub type OwnerRevision = i64;

/// Hybrid logical timestamp (TSO): physical milliseconds shifted left by
/// [`LOGICAL_BITS`] with a logical counter in the low bits.
pub type Ts = u64;

pub const LOGICAL_BITS: u32 = 18;

/// Build a TSO from a physical millisecond clock reading and a logical counter.
pub fn compose_ts(physical_ms: u64, logical: u64) -> Ts {
    (physical_ms << LOGICAL_BITS) | (logical & ((1 << LOGICAL_BITS) - 1))
}

/// Physical milliseconds of a TSO.
pub fn extract_physical(ts: Ts) -> u64 {
    ts >> LOGICAL_BITS
}

/// TSO for the current wall clock with a zero logical part.
pub fn ts_from_datetime(at: DateTime<Utc>) -> Ts {
    compose_ts(at.timestamp_millis().max(0) as u64, 0)
}

/// Start/end key boundaries of a keyspan. `end` is exclusive.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeySpan {
    pub start: Vec<u8>,
    pub end: Vec<u8>,
}

impl KeySpan {
    pub fn new(start: impl Into<Vec<u8>>, end: impl Into<Vec<u8>>) -> Self {
        Self {
            start: start.into(),
            end: end.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn compose_and_extract_physical() {
        let ts = compose_ts(1_700_000_000_000, 42);
        assert_eq!(extract_physical(ts), 1_700_000_000_000);
        assert_eq!(ts & ((1 << LOGICAL_BITS) - 1), 42);
    }

    #[test]
    fn logical_part_is_masked() {
        let ts = compose_ts(1, 1 << LOGICAL_BITS);
        assert_eq!(ts, 1 << LOGICAL_BITS);
    }

    #[test]
    fn ts_from_datetime_orders_by_wall_clock() {
        let earlier = Utc.timestamp_millis_opt(1_000).unwrap();
        let later = Utc.timestamp_millis_opt(2_000).unwrap();
        assert!(ts_from_datetime(earlier) < ts_from_datetime(later));
        assert_eq!(extract_physical(ts_from_datetime(later)), 2_000);
    }
}
