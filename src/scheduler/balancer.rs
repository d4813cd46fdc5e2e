use std::collections::BTreeMap;

use crate::config::BalanceConfig;
use crate::model::{CaptureId, KeySpanId};

/// A planned migration of one keyspan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySpanMove {
    pub keyspan: KeySpanId,
    pub from: CaptureId,
    pub to: CaptureId,
}

/// Decides which capture receives a keyspan.
///
/// Implementations only see captures that may currently receive work.
pub trait BalancePolicy: Send + Sync {
    /// Choose a capture for a keyspan that has no holder. `loads` maps every
    /// eligible capture to the number of keyspans it holds.
    fn pick_target(&self, keyspan: KeySpanId, loads: &BTreeMap<CaptureId, usize>)
        -> Option<CaptureId>;

    /// Plan moves that even out `placement` (eligible capture -> keyspans it runs).
    fn plan_rebalance(&self, placement: &BTreeMap<CaptureId, Vec<KeySpanId>>)
        -> Vec<KeySpanMove>;
}

/// Sends new work to the capture with the fewest keyspans.
#[derive(Debug, Clone, Default)]
pub struct LeastLoaded {
    config: BalanceConfig,
}

impl LeastLoaded {
    pub fn new(config: BalanceConfig) -> Self {
        Self { config }
    }
}

impl BalancePolicy for LeastLoaded {
    fn pick_target(
        &self,
        _keyspan: KeySpanId,
        loads: &BTreeMap<CaptureId, usize>,
    ) -> Option<CaptureId> {
        // BTreeMap order makes ties resolve to the smallest capture ID.
        loads
            .iter()
            .min_by(|(a_id, a), (b_id, b)| a.cmp(b).then_with(|| a_id.cmp(b_id)))
            .map(|(id, _)| id.clone())
    }

    fn plan_rebalance(
        &self,
        placement: &BTreeMap<CaptureId, Vec<KeySpanId>>,
    ) -> Vec<KeySpanMove> {
        if placement.len() < 2 {
            return Vec::new();
        }
        let mut remaining: BTreeMap<CaptureId, Vec<KeySpanId>> = placement.clone();
        let mut moves = Vec::new();

        while moves.len() < self.config.max_moves_per_round {
            let Some((donor, donor_load)) = remaining
                .iter()
                .map(|(id, ks)| (id.clone(), ks.len()))
                .max_by(|(a_id, a), (b_id, b)| a.cmp(b).then_with(|| b_id.cmp(a_id)))
            else {
                break;
            };
            let Some((recipient, recipient_load)) = remaining
                .iter()
                .map(|(id, ks)| (id.clone(), ks.len()))
                .min_by(|(a_id, a), (b_id, b)| a.cmp(b).then_with(|| a_id.cmp(b_id)))
            else {
                break;
            };
            if donor_load <= recipient_load + 1 + self.config.tolerance {
                break;
            }
            let Some(keyspan) = remaining.get_mut(&donor).and_then(|ks| ks.pop()) else {
                break;
            };
            remaining.entry(recipient.clone()).or_default().push(keyspan);
            moves.push(KeySpanMove {
                keyspan,
                from: donor,
                to: recipient,
            });
        }

        if !moves.is_empty() {
            tracing::info!(moves = moves.len(), "Planned keyspan rebalance");
        }
        moves
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loads(entries: &[(&str, usize)]) -> BTreeMap<CaptureId, usize> {
        entries.iter().map(|(id, n)| (id.to_string(), *n)).collect()
    }

    fn placement(entries: &[(&str, &[KeySpanId])]) -> BTreeMap<CaptureId, Vec<KeySpanId>> {
        entries
            .iter()
            .map(|(id, ks)| (id.to_string(), ks.to_vec()))
            .collect()
    }

    #[test]
    fn picks_least_loaded_capture() {
        let policy = LeastLoaded::default();
        let target = policy.pick_target(1, &loads(&[("cap-1", 3), ("cap-2", 1), ("cap-3", 2)]));
        assert_eq!(target.as_deref(), Some("cap-2"));
    }

    #[test]
    fn ties_resolve_to_smallest_capture_id() {
        let policy = LeastLoaded::default();
        let target = policy.pick_target(1, &loads(&[("cap-b", 0), ("cap-a", 0)]));
        assert_eq!(target.as_deref(), Some("cap-a"));
    }

    #[test]
    fn no_target_without_captures() {
        let policy = LeastLoaded::default();
        assert!(policy.pick_target(1, &BTreeMap::new()).is_none());
    }

    #[test]
    fn rebalance_moves_work_to_new_capture() {
        let policy = LeastLoaded::default();
        let moves = policy.plan_rebalance(&placement(&[
            ("cap-1", &[1, 2, 3, 4]),
            ("cap-2", &[]),
        ]));
        assert_eq!(moves.len(), 2);
        assert!(moves.iter().all(|m| m.from == "cap-1" && m.to == "cap-2"));
    }

    #[test]
    fn balanced_placement_needs_no_moves() {
        let policy = LeastLoaded::default();
        let moves = policy.plan_rebalance(&placement(&[
            ("cap-1", &[1, 2]),
            ("cap-2", &[3]),
            ("cap-3", &[4, 5]),
        ]));
        assert!(moves.is_empty());
    }

    #[test]
    fn rebalance_respects_move_limit() {
        let policy = LeastLoaded::new(BalanceConfig {
            max_moves_per_round: 1,
            tolerance: 0,
        });
        let moves = policy.plan_rebalance(&placement(&[
            ("cap-1", &[1, 2, 3, 4, 5, 6]),
            ("cap-2", &[]),
        ]));
        assert_eq!(moves.len(), 1);
    }

    #[test]
    fn tolerance_allows_slack() {
        let policy = LeastLoaded::new(BalanceConfig {
            max_moves_per_round: 16,
            tolerance: 2,
        });
        let moves = policy.plan_rebalance(&placement(&[("cap-1", &[1, 2, 3]), ("cap-2", &[])]));
        assert!(moves.is_empty());
    }
}
