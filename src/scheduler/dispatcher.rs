use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::config::SchedulerConfig;
use crate::error::Result;
use crate::model::{CaptureId, ChangeFeedId, KeySpan, KeySpanId, OwnerRevision, Ts};
use crate::protocol::{
    self, AnnounceMessage, DispatchKeySpanMessage, InboundMessage, SyncMessage, Topic,
};
use crate::scheduler::balancer::{BalancePolicy, KeySpanMove};
use crate::scheduler::keyspan_set::{ConfirmOutcome, KeySpanRecord, KeySpanSet, KeySpanStatus};
use crate::scheduler::watermark::{CaptureStatus, SyncStatus, Watermark};
use crate::transport::MessageTransport;

/// An encoded message waiting to be published once the lock is released.
#[derive(Debug)]
struct Outbound {
    to: CaptureId,
    topic: Topic,
    payload: Vec<u8>,
}

#[derive(Debug, Default)]
pub(crate) struct DispatcherState {
    pub(crate) keyspans: KeySpanSet,
    pub(crate) captures: BTreeMap<CaptureId, CaptureStatus>,
    /// Manual moves waiting for a tick where every keyspan is Running.
    move_jobs: BTreeMap<KeySpanId, CaptureId>,
    need_rebalance: bool,
}

impl DispatcherState {
    fn eligible_loads(&self) -> BTreeMap<CaptureId, usize> {
        let counts = self.keyspans.count_by_capture();
        self.captures
            .iter()
            .filter(|(_, s)| s.sync_status.is_schedulable())
            .map(|(id, _)| (id.clone(), counts.get(id).copied().unwrap_or(0)))
            .collect()
    }

    fn is_schedulable(&self, capture: &str) -> bool {
        self.captures
            .get(capture)
            .is_some_and(|s| s.sync_status.is_schedulable())
    }
}

/// Per-capture view exposed by [`ScheduleDispatcher::snapshot`].
#[derive(Debug, Clone, Serialize)]
pub struct CaptureSnapshot {
    pub sync_status: &'static str,
    pub checkpoint_ts: Option<Ts>,
    pub resolved_ts: Option<Ts>,
    pub processor_version: Option<String>,
}

/// Read-only copy of the scheduler tables.
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerSnapshot {
    pub changefeed: ChangeFeedId,
    pub revision: OwnerRevision,
    pub keyspans: Vec<KeySpanRecord>,
    pub captures: BTreeMap<CaptureId, CaptureSnapshot>,
}

impl SchedulerSnapshot {
    /// Status of `keyspan` on `capture`, if the owner knows of one.
    pub fn status_of(&self, keyspan: KeySpanId, capture: &str) -> Option<KeySpanStatus> {
        self.keyspans
            .iter()
            .find(|r| r.keyspan_id == keyspan && r.capture_id == capture)
            .map(|r| r.status)
    }

    /// Captures on which `keyspan` is Running.
    pub fn running_on(&self, keyspan: KeySpanId) -> Vec<CaptureId> {
        self.keyspans
            .iter()
            .filter(|r| r.keyspan_id == keyspan && r.status == KeySpanStatus::Running)
            .map(|r| r.capture_id.clone())
            .collect()
    }
}

/// Owner-side scheduler for one changefeed and one owner term.
///
/// All tables live behind a single mutex. Each operation computes its
/// outgoing messages while holding the lock and publishes them after
/// releasing it.
pub struct ScheduleDispatcher {
    changefeed: ChangeFeedId,
    revision: OwnerRevision,
    config: SchedulerConfig,
    transport: Arc<dyn MessageTransport>,
    policy: Arc<dyn BalancePolicy>,
    /// Cancelled when the owner term ends; nothing is published after that.
    fence: CancellationToken,
    pub(crate) state: Mutex<DispatcherState>,
}

impl ScheduleDispatcher {
    pub fn new(
        changefeed: impl Into<ChangeFeedId>,
        revision: OwnerRevision,
        config: SchedulerConfig,
        transport: Arc<dyn MessageTransport>,
        policy: Arc<dyn BalancePolicy>,
    ) -> Self {
        Self {
            changefeed: changefeed.into(),
            revision,
            config,
            transport,
            policy,
            fence: CancellationToken::new(),
            state: Mutex::new(DispatcherState::default()),
        }
    }

    /// Stop publishing once `fence` is cancelled.
    pub fn with_fence(mut self, fence: CancellationToken) -> Self {
        self.fence = fence;
        self
    }

    pub fn changefeed(&self) -> &str {
        &self.changefeed
    }

    pub fn revision(&self) -> OwnerRevision {
        self.revision
    }

    /// Drive the state machine one step.
    ///
    /// `desired` is the set of keyspans the changefeed must replicate and
    /// `captures` the live membership. Returns the aggregated watermark when
    /// every desired keyspan is Running and every holder has reported
    /// progress, `None` when the checkpoint cannot proceed yet.
    pub async fn tick(
        &self,
        desired: &BTreeMap<KeySpanId, KeySpan>,
        captures: &BTreeSet<CaptureId>,
    ) -> Result<Option<Watermark>> {
        let now = Instant::now();
        let mut out = Vec::new();
        let watermark = {
            let mut state = self.state.lock().await;
            self.sync_membership(&mut state, captures);
            self.drive_handshakes(&mut state, now, &mut out)?;

            let pending_sync = state
                .captures
                .values()
                .any(|s| matches!(s.sync_status, SyncStatus::SyncSent { .. }));
            if pending_sync {
                None
            } else {
                self.schedule_desired(&mut state, desired, &mut out)?;
                if state.keyspans.all_running() {
                    self.handle_move_jobs(&mut state, desired, &mut out)?;
                    self.handle_rebalance(&mut state, desired, &mut out)?;
                }
                Self::calculate_watermark(&state, desired)
            }
        };
        self.publish(out).await;
        Ok(watermark)
    }

    /// A processor finished a dispatched add or remove.
    pub async fn on_agent_finished_keyspan_operation(&self, capture: &str, keyspan: KeySpanId) {
        let mut state = self.state.lock().await;
        match state.captures.get(capture) {
            None => {
                tracing::warn!(capture = %capture, keyspan, "Acknowledgement from unknown capture ignored");
                return;
            }
            Some(status) if !status.sync_status.is_synced() => {
                tracing::warn!(
                    capture = %capture,
                    keyspan,
                    sync_status = status.sync_status.as_str(),
                    "Acknowledgement from unsynced capture ignored"
                );
                return;
            }
            Some(_) => {}
        }

        match state.keyspans.confirm(keyspan, capture) {
            ConfirmOutcome::Running => {
                // A report taken before this keyspan started may overstate progress.
                if let Some(status) = state.captures.get_mut(capture) {
                    status.watermark = None;
                }
                tracing::info!(capture = %capture, keyspan, "Keyspan is running");
            }
            ConfirmOutcome::Removed => {
                tracing::info!(capture = %capture, keyspan, "Keyspan removed");
            }
            ConfirmOutcome::AlreadyRunning => {
                tracing::debug!(capture = %capture, keyspan, "Duplicate acknowledgement");
            }
            ConfirmOutcome::Unknown => {
                tracing::warn!(
                    capture = %capture,
                    keyspan,
                    "Acknowledgement for keyspan with no pending operation"
                );
            }
        }
    }

    /// A processor reported everything it holds, in reply to an announcement.
    pub async fn on_agent_sync_task_statuses(&self, capture: &str, msg: SyncMessage) -> Result<()> {
        let mut out = Vec::new();
        {
            let mut state = self.state.lock().await;
            let Some(status) = state.captures.get(capture) else {
                tracing::warn!(capture = %capture, "Sync report from unknown capture ignored");
                return Ok(());
            };
            match status.sync_status {
                SyncStatus::SyncSent { .. } | SyncStatus::TimedOut { .. } => {}
                other => {
                    tracing::warn!(
                        capture = %capture,
                        sync_status = other.as_str(),
                        "Unexpected sync report ignored"
                    );
                    return Ok(());
                }
            }
            if msg.processor_version != self.config.owner_version {
                tracing::warn!(
                    capture = %capture,
                    processor_version = %msg.processor_version,
                    owner_version = %self.config.owner_version,
                    "Processor version differs from owner version"
                );
            }

            let conflicts =
                state
                    .keyspans
                    .reconcile(capture, &msg.running, &msg.adding, &msg.removing);
            if let Some(status) = state.captures.get_mut(capture) {
                status.mark_synced(msg.processor_version.clone());
            }
            tracing::info!(
                changefeed = %self.changefeed,
                capture = %capture,
                running = msg.running.len(),
                adding = msg.adding.len(),
                removing = msg.removing.len(),
                "Capture synced"
            );

            for keyspan in conflicts {
                tracing::warn!(
                    capture = %capture,
                    keyspan,
                    "Keyspan claimed by more than one capture, removing duplicate"
                );
                let msg = DispatchKeySpanMessage::remove(self.revision, keyspan);
                let (topic, payload) = protocol::encode(&self.changefeed, &msg)?;
                out.push(Outbound {
                    to: capture.to_string(),
                    topic,
                    payload,
                });
            }
        }
        self.publish(out).await;
        Ok(())
    }

    /// A processor reported its lowest checkpoint and resolved timestamps.
    pub async fn on_agent_checkpoint(
        &self,
        capture: &str,
        checkpoint_ts: Ts,
        resolved_ts: Ts,
    ) -> Result<()> {
        let watermark = Watermark::reported_by(capture, checkpoint_ts, resolved_ts)?;
        let mut state = self.state.lock().await;
        let Some(status) = state.captures.get_mut(capture) else {
            tracing::warn!(capture = %capture, "Checkpoint from unknown capture ignored");
            return Ok(());
        };
        if !status.sync_status.is_synced() {
            tracing::debug!(capture = %capture, "Checkpoint from unsynced capture ignored");
            return Ok(());
        }
        status.update_watermark(watermark);
        Ok(())
    }

    /// Route a decoded owner-bound message.
    pub async fn handle_inbound(&self, from: &str, msg: InboundMessage) -> Result<()> {
        match msg {
            InboundMessage::DispatchResponse(resp) => {
                self.on_agent_finished_keyspan_operation(from, resp.id).await;
                Ok(())
            }
            InboundMessage::Sync(sync) => self.on_agent_sync_task_statuses(from, sync).await,
            InboundMessage::Checkpoint(cp) => {
                self.on_agent_checkpoint(from, cp.checkpoint_ts, cp.resolved_ts)
                    .await
            }
            other => {
                tracing::warn!(from = %from, topic = %other.kind(), "Owner ignoring processor-bound message");
                Ok(())
            }
        }
    }

    /// Request that `keyspan` be moved to `target`. Applied on a later tick
    /// once every keyspan is Running.
    pub async fn move_keyspan(&self, keyspan: KeySpanId, target: impl Into<CaptureId>) {
        let target = target.into();
        tracing::info!(keyspan, target = %target, "Manual keyspan move requested");
        self.state.lock().await.move_jobs.insert(keyspan, target);
    }

    /// Request a rebalance on a later tick.
    pub async fn rebalance(&self) {
        self.state.lock().await.need_rebalance = true;
    }

    pub async fn snapshot(&self) -> SchedulerSnapshot {
        let state = self.state.lock().await;
        SchedulerSnapshot {
            changefeed: self.changefeed.clone(),
            revision: self.revision,
            keyspans: state.keyspans.iter().cloned().collect(),
            captures: state
                .captures
                .iter()
                .map(|(id, s)| {
                    (
                        id.clone(),
                        CaptureSnapshot {
                            sync_status: s.sync_status.as_str(),
                            checkpoint_ts: s.watermark.map(|w| w.checkpoint_ts()),
                            resolved_ts: s.watermark.map(|w| w.resolved_ts()),
                            processor_version: s.processor_version.clone(),
                        },
                    )
                })
                .collect(),
        }
    }

    fn sync_membership(&self, state: &mut DispatcherState, captures: &BTreeSet<CaptureId>) {
        let departed: Vec<CaptureId> = state
            .captures
            .keys()
            .chain(state.keyspans.captures().iter())
            .filter(|id| !captures.contains(*id))
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        for capture in departed {
            state.captures.remove(&capture);
            let released = state.keyspans.remove_capture(&capture);
            tracing::info!(
                changefeed = %self.changefeed,
                capture = %capture,
                released = released.len(),
                "Capture left, releasing its keyspans"
            );
        }
        state
            .move_jobs
            .retain(|_, target| captures.contains(target.as_str()));

        for capture in captures {
            if !state.captures.contains_key(capture) {
                tracing::info!(changefeed = %self.changefeed, capture = %capture, "Capture joined");
                state.captures.insert(capture.clone(), CaptureStatus::new());
            }
        }
    }

    fn drive_handshakes(
        &self,
        state: &mut DispatcherState,
        now: Instant,
        out: &mut Vec<Outbound>,
    ) -> Result<()> {
        let timeout = self.config.reconcile_timeout();
        let mut timed_out = Vec::new();
        for (capture, status) in state.captures.iter_mut() {
            let expired = status.handshake_expired(now, timeout);
            let announce = match status.sync_status {
                SyncStatus::Uninitialized => true,
                // Keep asking, without holding back the other captures.
                SyncStatus::TimedOut { .. } => expired,
                SyncStatus::SyncSent { .. } if expired => {
                    tracing::warn!(
                        changefeed = %self.changefeed,
                        capture = %capture,
                        timeout_ms = self.config.reconcile_timeout_ms,
                        "Capture did not answer announcement, treating it as empty"
                    );
                    status.sync_status = SyncStatus::TimedOut { since: now };
                    status.watermark = None;
                    timed_out.push(capture.clone());
                    false
                }
                _ => false,
            };
            if announce {
                let msg = AnnounceMessage {
                    owner_rev: self.revision,
                    owner_version: self.config.owner_version.clone(),
                };
                let (topic, payload) = protocol::encode(&self.changefeed, &msg)?;
                out.push(Outbound {
                    to: capture.clone(),
                    topic,
                    payload,
                });
                if matches!(status.sync_status, SyncStatus::TimedOut { .. }) {
                    status.sync_status = SyncStatus::TimedOut { since: now };
                } else {
                    status.mark_announced(now);
                }
                tracing::info!(
                    changefeed = %self.changefeed,
                    capture = %capture,
                    revision = self.revision,
                    "Announcing ownership"
                );
            }
        }
        for capture in timed_out {
            state.keyspans.reconcile(&capture, &[], &[], &[]);
        }
        Ok(())
    }

    fn schedule_desired(
        &self,
        state: &mut DispatcherState,
        desired: &BTreeMap<KeySpanId, KeySpan>,
        out: &mut Vec<Outbound>,
    ) -> Result<()> {
        let mut loads = state.eligible_loads();
        for (id, span) in desired {
            if state.keyspans.active_holder(*id).is_some() {
                continue;
            }
            // A capture still removing this keyspan cannot take it back yet.
            let mut candidates = loads.clone();
            for record in state.keyspans.records_of_keyspan(*id) {
                candidates.remove(&record.capture_id);
            }
            let Some(target) = self.policy.pick_target(*id, &candidates) else {
                tracing::debug!(keyspan = id, "No capture available for keyspan");
                continue;
            };
            if self.dispatch_add(state, *id, &target, span.clone(), out)? {
                *loads.entry(target).or_insert(0) += 1;
            }
        }

        let stale: Vec<(KeySpanId, CaptureId)> = state
            .keyspans
            .iter()
            .filter(|r| r.status == KeySpanStatus::Running && !desired.contains_key(&r.keyspan_id))
            .map(|r| (r.keyspan_id, r.capture_id.clone()))
            .collect();
        for (id, capture) in stale {
            self.dispatch_remove(state, id, &capture, out)?;
        }
        Ok(())
    }

    fn handle_move_jobs(
        &self,
        state: &mut DispatcherState,
        desired: &BTreeMap<KeySpanId, KeySpan>,
        out: &mut Vec<Outbound>,
    ) -> Result<()> {
        let jobs = std::mem::take(&mut state.move_jobs);
        for (keyspan, target) in jobs {
            if !state.is_schedulable(&target) {
                tracing::warn!(keyspan, target = %target, "Move target cannot take keyspans, dropping move");
                continue;
            }
            let Some(holder) = state.keyspans.active_holder(keyspan) else {
                tracing::warn!(keyspan, "Cannot move keyspan with no holder");
                continue;
            };
            if holder.capture_id == target {
                continue;
            }
            let from = holder.capture_id.clone();
            self.migrate(state, desired, KeySpanMove { keyspan, from, to: target }, out)?;
        }
        Ok(())
    }

    fn handle_rebalance(
        &self,
        state: &mut DispatcherState,
        desired: &BTreeMap<KeySpanId, KeySpan>,
        out: &mut Vec<Outbound>,
    ) -> Result<()> {
        if !state.need_rebalance {
            return Ok(());
        }
        state.need_rebalance = false;

        let mut placement: BTreeMap<CaptureId, Vec<KeySpanId>> = state
            .eligible_loads()
            .into_keys()
            .map(|id| (id, Vec::new()))
            .collect();
        for record in state.keyspans.iter() {
            if let Some(keyspans) = placement.get_mut(&record.capture_id) {
                keyspans.push(record.keyspan_id);
            }
        }
        for mv in self.policy.plan_rebalance(&placement) {
            self.migrate(state, desired, mv, out)?;
        }
        Ok(())
    }

    /// Remove from the source and add to the destination in the same step.
    /// The source stays Removing until acknowledged, so the keyspan is never
    /// Running in two places.
    fn migrate(
        &self,
        state: &mut DispatcherState,
        desired: &BTreeMap<KeySpanId, KeySpan>,
        mv: KeySpanMove,
        out: &mut Vec<Outbound>,
    ) -> Result<()> {
        let span = desired
            .get(&mv.keyspan)
            .cloned()
            .or_else(|| {
                state
                    .keyspans
                    .record(mv.keyspan, &mv.from)
                    .and_then(|r| r.span.clone())
            })
            .unwrap_or_default();
        if !self.dispatch_remove(state, mv.keyspan, &mv.from, out)? {
            return Ok(());
        }
        tracing::info!(keyspan = mv.keyspan, from = %mv.from, to = %mv.to, "Migrating keyspan");
        self.dispatch_add(state, mv.keyspan, &mv.to, span, out)?;
        Ok(())
    }

    fn dispatch_add(
        &self,
        state: &mut DispatcherState,
        keyspan: KeySpanId,
        capture: &str,
        span: KeySpan,
        out: &mut Vec<Outbound>,
    ) -> Result<bool> {
        let msg = DispatchKeySpanMessage::add(self.revision, keyspan, &span);
        let (topic, payload) = protocol::encode(&self.changefeed, &msg)?;
        if !state.keyspans.add_keyspan(keyspan, capture, span) {
            return Ok(false);
        }
        tracing::info!(changefeed = %self.changefeed, capture = %capture, keyspan, "Dispatching keyspan add");
        out.push(Outbound {
            to: capture.to_string(),
            topic,
            payload,
        });
        Ok(true)
    }

    fn dispatch_remove(
        &self,
        state: &mut DispatcherState,
        keyspan: KeySpanId,
        capture: &str,
        out: &mut Vec<Outbound>,
    ) -> Result<bool> {
        let msg = DispatchKeySpanMessage::remove(self.revision, keyspan);
        let (topic, payload) = protocol::encode(&self.changefeed, &msg)?;
        if !state.keyspans.mark_removing(keyspan, capture) {
            return Ok(false);
        }
        tracing::info!(changefeed = %self.changefeed, capture = %capture, keyspan, "Dispatching keyspan removal");
        out.push(Outbound {
            to: capture.to_string(),
            topic,
            payload,
        });
        Ok(true)
    }

    fn calculate_watermark(
        state: &DispatcherState,
        desired: &BTreeMap<KeySpanId, KeySpan>,
    ) -> Option<Watermark> {
        if !state.keyspans.all_running() {
            return None;
        }
        if desired
            .keys()
            .any(|id| state.keyspans.active_holder(*id).is_none())
        {
            return None;
        }
        let mut result: Option<Watermark> = None;
        for capture in state.keyspans.captures() {
            let watermark = state.captures.get(&capture)?.watermark?;
            result = Some(result.map_or(watermark, |r| r.min(watermark)));
        }
        result
    }

    /// Send everything in `out`. A capture we failed to reach is marked for
    /// a fresh announce/sync round, which rebuilds its state from scratch.
    async fn publish(&self, out: Vec<Outbound>) {
        if self.fence.is_cancelled() {
            if !out.is_empty() {
                tracing::debug!(
                    revision = self.revision,
                    dropped = out.len(),
                    "Owner term ended, not publishing"
                );
            }
            return;
        }
        let mut unreachable = BTreeSet::new();
        for msg in out {
            if let Err(e) = self.transport.send(&msg.to, &msg.topic, msg.payload) {
                tracing::warn!(
                    capture = %msg.to,
                    topic = %msg.topic,
                    error = %e,
                    "Failed to publish scheduler message"
                );
                unreachable.insert(msg.to);
            }
        }
        if unreachable.is_empty() {
            return;
        }
        let mut state = self.state.lock().await;
        for capture in unreachable {
            match state.captures.get_mut(&capture) {
                Some(status) if !matches!(status.sync_status, SyncStatus::TimedOut { .. }) => {
                    status.sync_status = SyncStatus::Uninitialized;
                }
                _ => {}
            }
        }
    }
}
