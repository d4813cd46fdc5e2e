use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::Serialize;

use crate::model::{CaptureId, KeySpan, KeySpanId};

/// The owner's belief about a keyspan's lifecycle phase on one capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum KeySpanStatus {
    Adding,
    Running,
    Removing,
}

impl KeySpanStatus {
    /// Adding and Running records both claim the keyspan.
    pub fn is_active(self) -> bool {
        matches!(self, KeySpanStatus::Adding | KeySpanStatus::Running)
    }
}

impl fmt::Display for KeySpanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeySpanStatus::Adding => write!(f, "adding"),
            KeySpanStatus::Running => write!(f, "running"),
            KeySpanStatus::Removing => write!(f, "removing"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KeySpanRecord {
    pub keyspan_id: KeySpanId,
    pub capture_id: CaptureId,
    pub status: KeySpanStatus,
    /// Boundaries, when known. Records rebuilt from sync reports carry none.
    pub span: Option<KeySpan>,
}

/// Result of applying a processor acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmOutcome {
    /// Adding -> Running.
    Running,
    /// Removing -> gone.
    Removed,
    /// The record was already Running.
    AlreadyRunning,
    /// No record for this keyspan on this capture.
    Unknown,
}

/// Which capture runs which keyspan.
///
/// Records are keyed by `(keyspan, capture)` so that a migration can hold the
/// keyspan Removing on its source while it is Adding on its destination. At
/// most one Adding or Running record exists per keyspan.
#[derive(Debug, Default, Clone)]
pub struct KeySpanSet {
    records: BTreeMap<KeySpanId, BTreeMap<CaptureId, KeySpanRecord>>,
}

impl KeySpanSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `id` is being added to `capture`.
    ///
    /// Re-adding a keyspan the capture already holds Adding or Running is a
    /// no-op that returns true. Returns false, leaving the table unchanged, when
    /// another capture already claims the keyspan or `capture` is still
    /// removing it.
    pub fn add_keyspan(&mut self, id: KeySpanId, capture: &str, span: KeySpan) -> bool {
        let holders = self.records.entry(id).or_default();
        if let Some(existing) = holders.get(capture) {
            return existing.status.is_active();
        }
        if let Some(other) = holders.values().find(|r| r.status.is_active()) {
            tracing::warn!(
                keyspan = id,
                capture = %capture,
                holder = %other.capture_id,
                status = %other.status,
                "Refusing to add keyspan already claimed by another capture"
            );
            return false;
        }
        holders.insert(
            capture.to_string(),
            KeySpanRecord {
                keyspan_id: id,
                capture_id: capture.to_string(),
                status: KeySpanStatus::Adding,
                span: Some(span),
            },
        );
        true
    }

    /// Record that `id` is being removed from `capture`. Only Running records
    /// can start removing; an already Removing record is left as is.
    pub fn mark_removing(&mut self, id: KeySpanId, capture: &str) -> bool {
        match self.record_mut(id, capture) {
            Some(record) => match record.status {
                KeySpanStatus::Running => {
                    record.status = KeySpanStatus::Removing;
                    true
                }
                KeySpanStatus::Removing => true,
                KeySpanStatus::Adding => false,
            },
            None => false,
        }
    }

    /// Apply an acknowledgement from `capture` for `id`.
    pub fn confirm(&mut self, id: KeySpanId, capture: &str) -> ConfirmOutcome {
        let Some(record) = self.record_mut(id, capture) else {
            return ConfirmOutcome::Unknown;
        };
        match record.status {
            KeySpanStatus::Adding => {
                record.status = KeySpanStatus::Running;
                ConfirmOutcome::Running
            }
            KeySpanStatus::Running => ConfirmOutcome::AlreadyRunning,
            KeySpanStatus::Removing => {
                self.remove_record(id, capture);
                ConfirmOutcome::Removed
            }
        }
    }

    /// Replace everything known about `capture` with its own report.
    ///
    /// Records of `capture` missing from the report are dropped, which makes
    /// those keyspans eligible for reassignment. Reported Running or Adding
    /// keyspans that another capture already claims are recorded as Removing
    /// and returned, so the caller can tell `capture` to stop them.
    pub fn reconcile(
        &mut self,
        capture: &str,
        running: &[KeySpanId],
        adding: &[KeySpanId],
        removing: &[KeySpanId],
    ) -> Vec<KeySpanId> {
        let previous = self.remove_capture(capture);
        let known_span = |set: &Self, id: KeySpanId| {
            previous
                .iter()
                .find(|r| r.keyspan_id == id)
                .and_then(|r| r.span.clone())
                .or_else(|| {
                    set.records
                        .get(&id)
                        .and_then(|h| h.values().find_map(|r| r.span.clone()))
                })
        };

        let mut conflicts = Vec::new();
        let reported = running
            .iter()
            .map(|id| (*id, KeySpanStatus::Running))
            .chain(adding.iter().map(|id| (*id, KeySpanStatus::Adding)))
            .chain(removing.iter().map(|id| (*id, KeySpanStatus::Removing)));
        for (id, mut status) in reported {
            if status.is_active() && self.active_holder_other_than(id, capture).is_some() {
                if !conflicts.contains(&id) {
                    conflicts.push(id);
                }
                status = KeySpanStatus::Removing;
            }
            let span = known_span(self, id);
            self.records.entry(id).or_default().insert(
                capture.to_string(),
                KeySpanRecord {
                    keyspan_id: id,
                    capture_id: capture.to_string(),
                    status,
                    span,
                },
            );
        }

        let reported_ids: BTreeSet<KeySpanId> = running
            .iter()
            .chain(adding)
            .chain(removing)
            .copied()
            .collect();
        for lost in previous.iter().filter(|r| !reported_ids.contains(&r.keyspan_id)) {
            tracing::info!(
                keyspan = lost.keyspan_id,
                capture = %capture,
                status = %lost.status,
                "Keyspan missing from sync report, releasing it"
            );
        }
        conflicts
    }

    /// Drop a single record.
    pub fn remove_record(&mut self, id: KeySpanId, capture: &str) -> Option<KeySpanRecord> {
        let holders = self.records.get_mut(&id)?;
        let removed = holders.remove(capture);
        if holders.is_empty() {
            self.records.remove(&id);
        }
        removed
    }

    /// Drop every record held by `capture`.
    pub fn remove_capture(&mut self, capture: &str) -> Vec<KeySpanRecord> {
        let mut removed = Vec::new();
        self.records.retain(|_, holders| {
            if let Some(record) = holders.remove(capture) {
                removed.push(record);
            }
            !holders.is_empty()
        });
        removed
    }

    pub fn record(&self, id: KeySpanId, capture: &str) -> Option<&KeySpanRecord> {
        self.records.get(&id).and_then(|h| h.get(capture))
    }

    fn record_mut(&mut self, id: KeySpanId, capture: &str) -> Option<&mut KeySpanRecord> {
        self.records.get_mut(&id).and_then(|h| h.get_mut(capture))
    }

    /// All records of a keyspan, across captures.
    pub fn records_of_keyspan(&self, id: KeySpanId) -> impl Iterator<Item = &KeySpanRecord> {
        self.records.get(&id).into_iter().flat_map(|h| h.values())
    }

    /// The capture holding `id` Adding or Running, if any.
    pub fn active_holder(&self, id: KeySpanId) -> Option<&KeySpanRecord> {
        self.records_of_keyspan(id).find(|r| r.status.is_active())
    }

    fn active_holder_other_than(&self, id: KeySpanId, capture: &str) -> Option<&KeySpanRecord> {
        self.records_of_keyspan(id)
            .find(|r| r.status.is_active() && r.capture_id != capture)
    }

    pub fn iter(&self) -> impl Iterator<Item = &KeySpanRecord> {
        self.records.values().flat_map(|h| h.values())
    }

    /// For each capture, the keyspans it is responsible for.
    pub fn group_by_capture(&self) -> BTreeMap<CaptureId, BTreeMap<KeySpanId, KeySpanRecord>> {
        let mut grouped: BTreeMap<CaptureId, BTreeMap<KeySpanId, KeySpanRecord>> =
            BTreeMap::new();
        for record in self.iter() {
            grouped
                .entry(record.capture_id.clone())
                .or_default()
                .insert(record.keyspan_id, record.clone());
        }
        grouped
    }

    /// Number of Adding or Running keyspans per capture.
    pub fn count_by_capture(&self) -> BTreeMap<CaptureId, usize> {
        let mut counts = BTreeMap::new();
        for record in self.iter().filter(|r| r.status.is_active()) {
            *counts.entry(record.capture_id.clone()).or_insert(0) += 1;
        }
        counts
    }

    /// Captures holding at least one record.
    pub fn captures(&self) -> BTreeSet<CaptureId> {
        self.iter().map(|r| r.capture_id.clone()).collect()
    }

    pub fn keyspan_ids(&self) -> impl Iterator<Item = KeySpanId> + '_ {
        self.records.keys().copied()
    }

    /// True when every record is Running.
    pub fn all_running(&self) -> bool {
        self.iter().all(|r| r.status == KeySpanStatus::Running)
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.records.values().map(|h| h.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
