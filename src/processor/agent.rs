use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::AgentConfig;
use crate::error::Result;
use crate::model::{CaptureId, ChangeFeedId, KeySpanId, OwnerRevision};
use crate::processor::executor::KeySpanExecutor;
use crate::protocol::{
    self, AnnounceMessage, CheckpointMessage, DispatchKeySpanMessage,
    DispatchKeySpanResponseMessage, ProtocolMessage, SyncMessage, Topic,
};
use crate::scheduler::KeySpanStatus;

/// A message the agent wants sent.
#[derive(Debug, Clone)]
pub struct Reply {
    pub to: CaptureId,
    pub topic: Topic,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct OwnerInfo {
    capture: CaptureId,
    revision: OwnerRevision,
}

/// Capture-side half of the protocol for one changefeed.
///
/// Follows whichever owner carries the highest revision seen so far and
/// drops control messages from older ones.
pub struct Agent {
    capture: CaptureId,
    changefeed: ChangeFeedId,
    config: AgentConfig,
    executor: Arc<dyn KeySpanExecutor>,
    owner: Option<OwnerInfo>,
    keyspans: BTreeMap<KeySpanId, KeySpanStatus>,
    last_checkpoint_sent: Option<Instant>,
}

impl Agent {
    pub fn new(
        capture: impl Into<CaptureId>,
        changefeed: impl Into<ChangeFeedId>,
        config: AgentConfig,
        executor: Arc<dyn KeySpanExecutor>,
    ) -> Self {
        Self {
            capture: capture.into(),
            changefeed: changefeed.into(),
            config,
            executor,
            owner: None,
            keyspans: BTreeMap::new(),
            last_checkpoint_sent: None,
        }
    }

    pub fn capture(&self) -> &str {
        &self.capture
    }

    pub fn changefeed(&self) -> &str {
        &self.changefeed
    }

    /// Highest owner revision accepted so far.
    pub fn owner_revision(&self) -> Option<OwnerRevision> {
        self.owner.as_ref().map(|o| o.revision)
    }

    pub fn owner_capture(&self) -> Option<&str> {
        self.owner.as_ref().map(|o| o.capture.as_str())
    }

    pub fn keyspan_status(&self, id: KeySpanId) -> Option<KeySpanStatus> {
        self.keyspans.get(&id).copied()
    }

    pub fn keyspans(&self) -> &BTreeMap<KeySpanId, KeySpanStatus> {
        &self.keyspans
    }

    pub fn tick_interval(&self) -> Duration {
        self.config.tick_interval()
    }

    /// Handle a dispatch from `from`. Redelivered dispatches are no-ops; a
    /// dispatch for a state already reached is acknowledged again.
    pub fn on_dispatch(&mut self, from: &str, msg: DispatchKeySpanMessage) -> Result<Vec<Reply>> {
        if !self.accept_owner(from, msg.owner_rev, "dispatch") {
            return Ok(Vec::new());
        }
        let id = msg.id;
        let mut replies = Vec::new();
        match (msg.is_delete, self.keyspans.get(&id).copied()) {
            (false, None) => {
                self.executor.add_keyspan(id, &msg.span())?;
                self.keyspans.insert(id, KeySpanStatus::Adding);
                tracing::info!(capture = %self.capture, keyspan = id, "Adding keyspan");
            }
            (false, Some(KeySpanStatus::Running)) | (true, None) => {
                tracing::debug!(capture = %self.capture, keyspan = id, is_delete = msg.is_delete, "Dispatch already applied");
                replies.push(self.ack(from, id)?);
            }
            (false, Some(KeySpanStatus::Adding)) | (true, Some(KeySpanStatus::Removing)) => {
                tracing::debug!(capture = %self.capture, keyspan = id, "Dispatch already in progress");
            }
            (false, Some(KeySpanStatus::Removing)) => {
                tracing::warn!(capture = %self.capture, keyspan = id, "Add for keyspan still being removed ignored");
            }
            (true, Some(KeySpanStatus::Adding | KeySpanStatus::Running)) => {
                self.executor.remove_keyspan(id)?;
                self.keyspans.insert(id, KeySpanStatus::Removing);
                tracing::info!(capture = %self.capture, keyspan = id, "Removing keyspan");
            }
        }
        Ok(replies)
    }

    /// Handle an ownership announcement by reporting everything held.
    pub fn on_announce(&mut self, from: &str, msg: AnnounceMessage) -> Result<Vec<Reply>> {
        if !self.accept_owner(from, msg.owner_rev, "announce") {
            return Ok(Vec::new());
        }
        tracing::info!(
            capture = %self.capture,
            owner = %from,
            revision = msg.owner_rev,
            owner_version = %msg.owner_version,
            "Owner announced, sending sync report"
        );
        let mut sync = SyncMessage {
            processor_version: self.config.processor_version.clone(),
            ..Default::default()
        };
        for (id, status) in &self.keyspans {
            match status {
                KeySpanStatus::Running => sync.running.push(*id),
                KeySpanStatus::Adding => sync.adding.push(*id),
                KeySpanStatus::Removing => sync.removing.push(*id),
            }
        }
        // Any report still owed goes to the new owner.
        self.last_checkpoint_sent = None;
        Ok(vec![self.reply(from, &sync)?])
    }

    /// Poll finished operations and emit acknowledgements and, when due, a
    /// watermark report.
    pub fn tick(&mut self, now: Instant) -> Result<Vec<Reply>> {
        let Some(owner) = self.owner.clone() else {
            return Ok(Vec::new());
        };
        let mut replies = Vec::new();
        let pending: Vec<(KeySpanId, KeySpanStatus)> = self
            .keyspans
            .iter()
            .filter(|(_, s)| **s != KeySpanStatus::Running)
            .map(|(id, s)| (*id, *s))
            .collect();
        for (id, status) in pending {
            match status {
                KeySpanStatus::Adding if self.executor.is_add_finished(id) => {
                    self.keyspans.insert(id, KeySpanStatus::Running);
                    tracing::info!(capture = %self.capture, keyspan = id, "Keyspan added");
                    replies.push(self.ack(&owner.capture, id)?);
                }
                KeySpanStatus::Removing if self.executor.is_remove_finished(id) => {
                    self.keyspans.remove(&id);
                    tracing::info!(capture = %self.capture, keyspan = id, "Keyspan removed");
                    replies.push(self.ack(&owner.capture, id)?);
                }
                _ => {}
            }
        }

        let due = self
            .last_checkpoint_sent
            .map_or(true, |at| now.saturating_duration_since(at) >= self.config.checkpoint_interval());
        if due {
            if let Some(watermark) = self.executor.checkpoint() {
                let msg = CheckpointMessage {
                    checkpoint_ts: watermark.checkpoint_ts(),
                    resolved_ts: watermark.resolved_ts(),
                };
                replies.push(self.reply(&owner.capture, &msg)?);
                self.last_checkpoint_sent = Some(now);
            }
        }
        Ok(replies)
    }

    fn accept_owner(&mut self, from: &str, revision: OwnerRevision, what: &str) -> bool {
        match &self.owner {
            Some(current) if revision < current.revision => {
                tracing::debug!(
                    capture = %self.capture,
                    from = %from,
                    revision,
                    current_revision = current.revision,
                    message = what,
                    "Dropping message from stale owner"
                );
                false
            }
            Some(current) if revision == current.revision => true,
            _ => {
                tracing::info!(capture = %self.capture, owner = %from, revision, "Following new owner");
                self.owner = Some(OwnerInfo {
                    capture: from.to_string(),
                    revision,
                });
                true
            }
        }
    }

    fn ack(&self, to: &str, id: KeySpanId) -> Result<Reply> {
        self.reply(to, &DispatchKeySpanResponseMessage { id })
    }

    fn reply<M: ProtocolMessage>(&self, to: &str, msg: &M) -> Result<Reply> {
        let (topic, payload) = protocol::encode(&self.changefeed, msg)?;
        Ok(Reply {
            to: to.to_string(),
            topic,
            payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::KeySpan;
    use crate::processor::executor::InMemoryExecutor;
    use crate::protocol::{decode, TopicKind};

    fn agent_with(executor: Arc<InMemoryExecutor>) -> Agent {
        Agent::new("cap-1", "cf-1", AgentConfig::default(), executor)
    }

    fn span() -> KeySpan {
        KeySpan::new(b"a".to_vec(), b"m".to_vec())
    }

    fn announce(rev: OwnerRevision) -> AnnounceMessage {
        AnnounceMessage {
            owner_rev: rev,
            owner_version: "test".to_string(),
        }
    }

    fn acked_ids(replies: &[Reply]) -> Vec<KeySpanId> {
        replies
            .iter()
            .filter(|r| TopicKind::parse(&r.topic).map(|(k, _)| k).ok() == Some(TopicKind::DispatchResponse))
            .map(|r| {
                decode::<DispatchKeySpanResponseMessage>(&r.topic, &r.payload)
                    .unwrap()
                    .id
            })
            .collect()
    }

    #[test]
    fn ignores_dispatch_from_older_revision() {
        let exec = Arc::new(InMemoryExecutor::new());
        let mut agent = agent_with(exec.clone());

        agent.on_announce("owner-b", announce(6)).unwrap();
        let replies = agent
            .on_dispatch("owner-a", DispatchKeySpanMessage::add(5, 7, &span()))
            .unwrap();

        assert!(replies.is_empty());
        assert_eq!(agent.keyspan_status(7), None);
        assert!(exec.keyspan_ids().is_empty());
        assert_eq!(agent.owner_revision(), Some(6));
        assert_eq!(agent.owner_capture(), Some("owner-b"));
    }

    #[test]
    fn ignores_announce_from_older_revision() {
        let exec = Arc::new(InMemoryExecutor::new());
        let mut agent = agent_with(exec.clone());
        agent.on_announce("owner-b", announce(6)).unwrap();
        agent
            .on_dispatch("owner-b", DispatchKeySpanMessage::add(6, 3, &span()))
            .unwrap();

        let replies = agent.on_announce("owner-a", announce(5)).unwrap();

        assert!(replies.is_empty());
        assert_eq!(agent.owner_revision(), Some(6));
        assert_eq!(agent.owner_capture(), Some("owner-b"));
        assert_eq!(agent.keyspan_status(3), Some(KeySpanStatus::Adding));
    }

    #[test]
    fn higher_revision_dispatch_adopts_new_owner() {
        let mut agent = agent_with(Arc::new(InMemoryExecutor::new()));
        agent.on_announce("owner-a", announce(5)).unwrap();
        agent
            .on_dispatch("owner-b", DispatchKeySpanMessage::add(6, 1, &span()))
            .unwrap();
        assert_eq!(agent.owner_revision(), Some(6));
        assert_eq!(agent.owner_capture(), Some("owner-b"));
        assert_eq!(agent.keyspan_status(1), Some(KeySpanStatus::Adding));
    }

    #[test]
    fn duplicate_add_is_idempotent() {
        let exec = Arc::new(InMemoryExecutor::new());
        exec.hold_operations(true);
        let mut agent = agent_with(exec.clone());

        let add = DispatchKeySpanMessage::add(1, 3, &span());
        assert!(agent.on_dispatch("owner", add.clone()).unwrap().is_empty());
        assert!(agent.on_dispatch("owner", add.clone()).unwrap().is_empty());
        assert_eq!(exec.keyspan_ids(), vec![3]);

        exec.hold_operations(false);
        let replies = agent.tick(Instant::now()).unwrap();
        assert_eq!(acked_ids(&replies), vec![3]);
        assert_eq!(agent.keyspan_status(3), Some(KeySpanStatus::Running));

        // redelivered after completion: acknowledged again, nothing restarted
        let replies = agent.on_dispatch("owner", add).unwrap();
        assert_eq!(acked_ids(&replies), vec![3]);
        assert_eq!(exec.phase(3), Some(crate::processor::ExecutorPhase::Running));
    }

    #[test]
    fn delete_of_absent_keyspan_is_acknowledged() {
        let mut agent = agent_with(Arc::new(InMemoryExecutor::new()));
        let replies = agent
            .on_dispatch("owner", DispatchKeySpanMessage::remove(1, 9))
            .unwrap();
        assert_eq!(acked_ids(&replies), vec![9]);
        assert_eq!(replies[0].to, "owner");
    }

    #[test]
    fn remove_runs_to_completion_on_tick() {
        let exec = Arc::new(InMemoryExecutor::new());
        let mut agent = agent_with(exec.clone());
        agent
            .on_dispatch("owner", DispatchKeySpanMessage::add(1, 4, &span()))
            .unwrap();
        agent.tick(Instant::now()).unwrap();

        agent
            .on_dispatch("owner", DispatchKeySpanMessage::remove(1, 4))
            .unwrap();
        assert_eq!(agent.keyspan_status(4), Some(KeySpanStatus::Removing));

        let replies = agent.tick(Instant::now()).unwrap();
        assert_eq!(acked_ids(&replies), vec![4]);
        assert_eq!(agent.keyspan_status(4), None);
        assert!(exec.keyspan_ids().is_empty());
    }

    #[test]
    fn announce_reports_every_held_keyspan() {
        let exec = Arc::new(InMemoryExecutor::new());
        let mut agent = agent_with(exec.clone());
        for id in [1, 5] {
            agent
                .on_dispatch("owner-a", DispatchKeySpanMessage::add(1, id, &span()))
                .unwrap();
        }
        agent.tick(Instant::now()).unwrap();
        exec.hold_operations(true);
        agent
            .on_dispatch("owner-a", DispatchKeySpanMessage::add(1, 9, &span()))
            .unwrap();

        let replies = agent.on_announce("owner-b", announce(2)).unwrap();
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].to, "owner-b");
        let sync: SyncMessage = decode(&replies[0].topic, &replies[0].payload).unwrap();
        assert_eq!(sync.running, vec![1, 5]);
        assert_eq!(sync.adding, vec![9]);
        assert!(sync.removing.is_empty());
    }

    #[test]
    fn tick_sends_checkpoint_at_interval() {
        let exec = Arc::new(InMemoryExecutor::new());
        let config = AgentConfig::default().with_checkpoint_interval_ms(1_000);
        let mut agent = Agent::new("cap-1", "cf-1", config, exec.clone());

        // no owner yet
        assert!(agent.tick(Instant::now()).unwrap().is_empty());

        agent.on_announce("owner", announce(1)).unwrap();
        agent
            .on_dispatch("owner", DispatchKeySpanMessage::add(1, 1, &span()))
            .unwrap();
        exec.advance(100, 120);

        let start = Instant::now();
        let replies = agent.tick(start).unwrap();
        let checkpoints: Vec<CheckpointMessage> = replies
            .iter()
            .filter_map(|r| decode::<CheckpointMessage>(&r.topic, &r.payload).ok())
            .collect();
        assert_eq!(
            checkpoints,
            vec![CheckpointMessage {
                checkpoint_ts: 100,
                resolved_ts: 120
            }]
        );

        let replies = agent.tick(start + Duration::from_millis(10)).unwrap();
        assert!(replies.is_empty());

        let replies = agent.tick(start + Duration::from_millis(1_000)).unwrap();
        assert_eq!(replies.len(), 1);
    }
}
