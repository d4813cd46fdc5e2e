use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use crate::error::Result;
use crate::model::{KeySpan, KeySpanId, Ts};
use crate::scheduler::Watermark;

/// Runs replication for the keyspans of one capture.
///
/// Adds and removes are asynchronous: the agent starts them and then polls
/// the `is_*_finished` methods on each tick.
pub trait KeySpanExecutor: Send + Sync {
    fn add_keyspan(&self, id: KeySpanId, span: &KeySpan) -> Result<()>;

    fn remove_keyspan(&self, id: KeySpanId) -> Result<()>;

    fn is_add_finished(&self, id: KeySpanId) -> bool;

    fn is_remove_finished(&self, id: KeySpanId) -> bool;

    /// Lowest progress across every keyspan started on this capture, or
    /// `None` if it runs nothing.
    fn checkpoint(&self) -> Option<Watermark>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorPhase {
    Starting,
    Running,
    Stopping,
}

#[derive(Debug, Clone)]
struct ExecutorKeySpan {
    span: KeySpan,
    phase: ExecutorPhase,
    checkpoint_ts: Ts,
    resolved_ts: Ts,
}

#[derive(Debug, Default)]
struct ExecutorState {
    keyspans: BTreeMap<KeySpanId, ExecutorKeySpan>,
    /// Progress given to keyspans started from now on.
    checkpoint_ts: Ts,
    resolved_ts: Ts,
    hold_operations: bool,
}

/// Executor that tracks keyspans in memory without doing any replication.
///
/// Operations complete on the next poll unless held with
/// [`InMemoryExecutor::hold_operations`].
#[derive(Debug, Default)]
pub struct InMemoryExecutor {
    state: Mutex<ExecutorState>,
}

impl InMemoryExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, ExecutorState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// While held, started operations never report as finished.
    pub fn hold_operations(&self, hold: bool) {
        self.state().hold_operations = hold;
    }

    /// Move every keyspan, and the starting point of future ones, to the given progress.
    pub fn advance(&self, checkpoint_ts: Ts, resolved_ts: Ts) {
        let mut state = self.state();
        state.checkpoint_ts = checkpoint_ts;
        state.resolved_ts = resolved_ts;
        for keyspan in state.keyspans.values_mut() {
            keyspan.checkpoint_ts = checkpoint_ts;
            keyspan.resolved_ts = resolved_ts;
        }
    }

    /// Set the progress of a single keyspan.
    pub fn advance_keyspan(&self, id: KeySpanId, checkpoint_ts: Ts, resolved_ts: Ts) {
        if let Some(keyspan) = self.state().keyspans.get_mut(&id) {
            keyspan.checkpoint_ts = checkpoint_ts;
            keyspan.resolved_ts = resolved_ts;
        }
    }

    pub fn phase(&self, id: KeySpanId) -> Option<ExecutorPhase> {
        self.state().keyspans.get(&id).map(|k| k.phase)
    }

    pub fn span(&self, id: KeySpanId) -> Option<KeySpan> {
        self.state().keyspans.get(&id).map(|k| k.span.clone())
    }

    /// Keyspans currently replicating, in any phase.
    pub fn keyspan_ids(&self) -> Vec<KeySpanId> {
        self.state().keyspans.keys().copied().collect()
    }
}

impl KeySpanExecutor for InMemoryExecutor {
    fn add_keyspan(&self, id: KeySpanId, span: &KeySpan) -> Result<()> {
        let mut state = self.state();
        let (checkpoint_ts, resolved_ts) = (state.checkpoint_ts, state.resolved_ts);
        state.keyspans.entry(id).or_insert_with(|| ExecutorKeySpan {
            span: span.clone(),
            phase: ExecutorPhase::Starting,
            checkpoint_ts,
            resolved_ts,
        });
        Ok(())
    }

    fn remove_keyspan(&self, id: KeySpanId) -> Result<()> {
        if let Some(keyspan) = self.state().keyspans.get_mut(&id) {
            keyspan.phase = ExecutorPhase::Stopping;
        }
        Ok(())
    }

    fn is_add_finished(&self, id: KeySpanId) -> bool {
        let mut state = self.state();
        let hold = state.hold_operations;
        match state.keyspans.get_mut(&id) {
            Some(keyspan) => match keyspan.phase {
                ExecutorPhase::Starting if !hold => {
                    keyspan.phase = ExecutorPhase::Running;
                    true
                }
                ExecutorPhase::Running => true,
                _ => false,
            },
            None => false,
        }
    }

    fn is_remove_finished(&self, id: KeySpanId) -> bool {
        let mut state = self.state();
        if state.hold_operations {
            return !state.keyspans.contains_key(&id);
        }
        state.keyspans.remove(&id);
        true
    }

    fn checkpoint(&self) -> Option<Watermark> {
        self.state()
            .keyspans
            .values()
            .filter(|k| k.phase != ExecutorPhase::Stopping)
            .filter_map(|k| Watermark::new(k.checkpoint_ts, k.resolved_ts))
            .reduce(Watermark::min)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn span() -> KeySpan {
        KeySpan::new(b"a".to_vec(), b"z".to_vec())
    }

    #[test]
    fn add_finishes_on_next_poll() {
        let exec = InMemoryExecutor::new();
        exec.add_keyspan(1, &span()).unwrap();
        assert_eq!(exec.phase(1), Some(ExecutorPhase::Starting));
        assert!(exec.is_add_finished(1));
        assert_eq!(exec.phase(1), Some(ExecutorPhase::Running));
        assert_eq!(exec.span(1), Some(span()));
    }

    #[test]
    fn held_operations_stay_pending() {
        let exec = InMemoryExecutor::new();
        exec.hold_operations(true);
        exec.add_keyspan(1, &span()).unwrap();
        assert!(!exec.is_add_finished(1));

        exec.hold_operations(false);
        assert!(exec.is_add_finished(1));

        exec.hold_operations(true);
        exec.remove_keyspan(1).unwrap();
        assert!(!exec.is_remove_finished(1));
        exec.hold_operations(false);
        assert!(exec.is_remove_finished(1));
        assert!(exec.keyspan_ids().is_empty());
    }

    #[test]
    fn checkpoint_is_minimum_over_keyspans() {
        let exec = InMemoryExecutor::new();
        assert!(exec.checkpoint().is_none());

        exec.add_keyspan(1, &span()).unwrap();
        exec.add_keyspan(2, &span()).unwrap();
        exec.advance_keyspan(1, 100, 150);
        exec.advance_keyspan(2, 80, 200);

        let wm = exec.checkpoint().unwrap();
        assert_eq!(wm.checkpoint_ts(), 80);
        assert_eq!(wm.resolved_ts(), 150);
    }

    #[test]
    fn new_keyspans_start_at_current_progress() {
        let exec = InMemoryExecutor::new();
        exec.advance(500, 600);
        exec.add_keyspan(3, &span()).unwrap();
        let wm = exec.checkpoint().unwrap();
        assert_eq!(wm.checkpoint_ts(), 500);
        assert_eq!(wm.resolved_ts(), 600);
    }
}
