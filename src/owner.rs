//! Owner runtime: one [`ScheduleDispatcher`] driven for the lifetime of one
//! [`OwnerTerm`].

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tokio::sync::{mpsc, watch};

use crate::config::SchedulerConfig;
use crate::election::OwnerTerm;
use crate::error::{Result, SchedulerError};
use crate::model::{CaptureId, ChangeFeedId, KeySpan, KeySpanId, OwnerRevision};
use crate::protocol::InboundMessage;
use crate::scheduler::{BalancePolicy, LeastLoaded, ScheduleDispatcher, Watermark};
use crate::transport::{Envelope, MessageTransport};

pub struct Owner {
    term: OwnerTerm,
    config: SchedulerConfig,
    dispatcher: Arc<ScheduleDispatcher>,
    checkpoint: watch::Sender<Option<Watermark>>,
}

impl Owner {
    /// Build an owner using the [`LeastLoaded`] policy.
    pub fn new(
        term: OwnerTerm,
        changefeed: impl Into<ChangeFeedId>,
        config: SchedulerConfig,
        transport: Arc<dyn MessageTransport>,
    ) -> Self {
        let policy = Arc::new(LeastLoaded::new(config.balance.clone()));
        Self::with_policy(term, changefeed, config, transport, policy)
    }

    pub fn with_policy(
        term: OwnerTerm,
        changefeed: impl Into<ChangeFeedId>,
        config: SchedulerConfig,
        transport: Arc<dyn MessageTransport>,
        policy: Arc<dyn BalancePolicy>,
    ) -> Self {
        let dispatcher = Arc::new(
            ScheduleDispatcher::new(changefeed, term.revision, config.clone(), transport, policy)
                .with_fence(term.fence()),
        );
        let (checkpoint, _) = watch::channel(None);
        Self {
            term,
            config,
            dispatcher,
            checkpoint,
        }
    }

    pub fn revision(&self) -> OwnerRevision {
        self.term.revision
    }

    pub fn capture(&self) -> &str {
        &self.term.capture
    }

    pub fn term(&self) -> &OwnerTerm {
        &self.term
    }

    pub fn dispatcher(&self) -> &Arc<ScheduleDispatcher> {
        &self.dispatcher
    }

    /// Changefeed checkpoint published by this owner so far. Never moves
    /// backwards.
    pub fn global_checkpoint(&self) -> Option<Watermark> {
        *self.checkpoint.borrow()
    }

    /// Schedule until the term is lost or the inbox closes.
    ///
    /// Membership and the desired keyspans are re-read on every tick. The
    /// inbox is borrowed so that a later term on the same capture can reuse it.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::OwnershipLost`] as soon as the term ends. No
    /// further message is sent once that happens.
    pub async fn run(
        &self,
        inbox: &mut mpsc::Receiver<Envelope>,
        membership: watch::Receiver<BTreeSet<CaptureId>>,
        keyspans: watch::Receiver<BTreeMap<KeySpanId, KeySpan>>,
    ) -> Result<()> {
        tracing::info!(
            changefeed = %self.dispatcher.changefeed(),
            capture = %self.term.capture,
            revision = self.term.revision,
            "Owner started"
        );
        let mut interval = tokio::time::interval(self.config.tick_interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = self.term.lost() => {
                    tracing::warn!(
                        capture = %self.term.capture,
                        revision = self.term.revision,
                        "Ownership lost, owner stopping"
                    );
                    return Err(SchedulerError::OwnershipLost(self.term.revision));
                }

                envelope = inbox.recv() => {
                    let Some(envelope) = envelope else {
                        tracing::info!(capture = %self.term.capture, "Owner inbox closed");
                        return Ok(());
                    };
                    self.handle_envelope(envelope).await;
                }

                _ = interval.tick() => {
                    if self.term.is_lost() {
                        continue;
                    }
                    let captures = membership.borrow().clone();
                    let desired = keyspans.borrow().clone();
                    match self.dispatcher.tick(&desired, &captures).await {
                        Ok(Some(watermark)) => self.advance_checkpoint(watermark),
                        Ok(None) => {}
                        Err(e) => {
                            tracing::error!(revision = self.term.revision, error = %e, "Scheduler tick failed");
                        }
                    }
                }
            }
        }
    }

    async fn handle_envelope(&self, envelope: Envelope) {
        let (changefeed, msg) = match InboundMessage::decode(&envelope.topic, &envelope.payload) {
            Ok(decoded) => decoded,
            Err(e) => {
                tracing::warn!(from = %envelope.from, error = %e, "Dropping undecodable message");
                return;
            }
        };
        if changefeed != self.dispatcher.changefeed() {
            tracing::debug!(from = %envelope.from, topic = %envelope.topic, "Message for another changefeed ignored");
            return;
        }
        if let Err(e) = self.dispatcher.handle_inbound(&envelope.from, msg).await {
            tracing::warn!(from = %envelope.from, topic = %envelope.topic, error = %e, "Failed to handle message");
        }
    }

    fn advance_checkpoint(&self, next: Watermark) {
        self.checkpoint.send_if_modified(|current| match *current {
            Some(prev) if next.checkpoint_ts() < prev.checkpoint_ts() => {
                tracing::warn!(
                    checkpoint_ts = next.checkpoint_ts(),
                    current_checkpoint_ts = prev.checkpoint_ts(),
                    "Checkpoint regression ignored"
                );
                false
            }
            Some(prev) => {
                let resolved_ts = next.resolved_ts().max(prev.resolved_ts());
                let advanced = Watermark::new(next.checkpoint_ts(), resolved_ts).unwrap_or(next);
                if advanced == prev {
                    return false;
                }
                *current = Some(advanced);
                true
            }
            None => {
                tracing::info!(checkpoint_ts = next.checkpoint_ts(), "First changefeed checkpoint");
                *current = Some(next);
                true
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::LocalHub;

    fn owner() -> Owner {
        let hub = LocalHub::new();
        let (transport, _inbox) = hub.endpoint("owner").unwrap();
        Owner::new(
            OwnerTerm::new("owner", 3),
            "cf-1",
            SchedulerConfig::default(),
            Arc::new(transport),
        )
    }

    fn wm(c: u64, r: u64) -> Watermark {
        Watermark::new(c, r).unwrap()
    }

    #[test]
    fn checkpoint_never_moves_backwards() {
        let owner = owner();
        assert!(owner.global_checkpoint().is_none());

        owner.advance_checkpoint(wm(100, 150));
        owner.advance_checkpoint(wm(80, 200));
        assert_eq!(owner.global_checkpoint(), Some(wm(100, 150)));

        owner.advance_checkpoint(wm(120, 140));
        assert_eq!(owner.global_checkpoint(), Some(wm(120, 150)));
    }

    #[tokio::test]
    async fn run_returns_when_term_is_lost() {
        let owner = owner();
        let (_tx, mut inbox) = mpsc::channel(8);
        let (_m, membership) = watch::channel(BTreeSet::new());
        let (_k, keyspans) = watch::channel(BTreeMap::new());

        owner.term().revoke();
        let result = owner.run(&mut inbox, membership, keyspans).await;
        assert!(matches!(result, Err(SchedulerError::OwnershipLost(3))));
    }
}
