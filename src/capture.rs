use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tokio::sync::{mpsc, watch, Mutex};
use tokio_util::sync::CancellationToken;

use crate::api::OwnerSlot;
use crate::config::CaptureConfig;
use crate::election::LocalElection;
use crate::error::Result;
use crate::model::{CaptureId, KeySpan, KeySpanId};
use crate::owner::Owner;
use crate::processor::{self, Agent, KeySpanExecutor};
use crate::protocol::TopicKind;
use crate::transport::{Envelope, LocalHub, MessageTransport};

/// One capture process: always runs a processor agent, and runs an owner
/// while it holds office.
pub struct CaptureNode {
    config: CaptureConfig,
    transport: Arc<dyn MessageTransport>,
    agent: Arc<Mutex<Agent>>,
    owner_inbox: Mutex<mpsc::Receiver<Envelope>>,
    owner_slot: OwnerSlot,
    cancel: CancellationToken,
}

impl CaptureNode {
    /// Register with `hub` and spawn the inbox router and the agent loop.
    ///
    /// Both tasks stop when `cancel` fires.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the hub rejects
    /// the registration.
    pub fn start(
        config: CaptureConfig,
        hub: &LocalHub,
        executor: Arc<dyn KeySpanExecutor>,
        cancel: CancellationToken,
    ) -> Result<Arc<Self>> {
        Self::start_with_owner_slot(config, hub, executor, OwnerSlot::new(), cancel)
    }

    /// Like [`CaptureNode::start`], publishing this capture's owner into a
    /// slot that may be shared with other captures in the process.
    pub fn start_with_owner_slot(
        config: CaptureConfig,
        hub: &LocalHub,
        executor: Arc<dyn KeySpanExecutor>,
        owner_slot: OwnerSlot,
        cancel: CancellationToken,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let (transport, inbox) = hub.endpoint(&config.capture_id)?;
        let transport: Arc<dyn MessageTransport> = Arc::new(transport);

        let agent = Arc::new(Mutex::new(Agent::new(
            config.capture_id.clone(),
            config.changefeed.clone(),
            config.agent.clone(),
            executor,
        )));
        let (owner_tx, owner_rx) = mpsc::channel(config.owner_inbox_capacity);
        let (agent_tx, agent_rx) = mpsc::channel(config.owner_inbox_capacity);

        let node = Arc::new(Self {
            config,
            transport: transport.clone(),
            agent: agent.clone(),
            owner_inbox: Mutex::new(owner_rx),
            owner_slot,
            cancel: cancel.clone(),
        });

        let capture = node.config.capture_id.clone();
        let router_cancel = cancel.clone();
        tokio::spawn(async move {
            route_inbox(capture, inbox, owner_tx, agent_tx, router_cancel).await;
        });
        tokio::spawn(async move {
            processor::run_agent(agent, agent_rx, transport, cancel).await;
        });

        tracing::info!(
            capture = %node.config.capture_id,
            changefeed = %node.config.changefeed,
            "Capture started"
        );
        Ok(node)
    }

    pub fn id(&self) -> &str {
        &self.config.capture_id
    }

    pub fn agent(&self) -> &Arc<Mutex<Agent>> {
        &self.agent
    }

    pub fn owner_slot(&self) -> OwnerSlot {
        self.owner_slot.clone()
    }

    /// The owner this capture is running, if it currently holds office.
    pub async fn owner(&self) -> Option<Arc<Owner>> {
        self.owner_slot
            .get()
            .await
            .filter(|owner| owner.capture() == self.id())
    }

    /// Campaign for ownership and schedule until the term ends or the
    /// capture shuts down.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::SchedulerError::OwnershipLost`] when another
    /// capture takes office.
    pub async fn run_owner(
        &self,
        election: &LocalElection,
        membership: watch::Receiver<BTreeSet<CaptureId>>,
        keyspans: watch::Receiver<BTreeMap<KeySpanId, KeySpan>>,
    ) -> Result<()> {
        let term = election.campaign(&self.config.capture_id).await;
        let owner = Arc::new(Owner::new(
            term,
            self.config.changefeed.clone(),
            self.config.scheduler.clone(),
            self.transport.clone(),
        ));
        let revision = owner.revision();
        self.owner_slot.set(owner.clone()).await;

        let mut inbox = self.owner_inbox.lock().await;
        let result = tokio::select! {
            result = owner.run(&mut inbox, membership, keyspans) => result,
            _ = self.cancel.cancelled() => {
                election.resign(owner.term()).await;
                Ok(())
            }
        };
        self.owner_slot.clear(revision).await;
        result
    }
}

/// Split the capture's single inbox by direction: owner-bound replies go to
/// the owner queue, control messages to the agent.
async fn route_inbox(
    capture: CaptureId,
    mut inbox: mpsc::Receiver<Envelope>,
    owner_tx: mpsc::Sender<Envelope>,
    agent_tx: mpsc::Sender<Envelope>,
    cancel: CancellationToken,
) {
    loop {
        let envelope = tokio::select! {
            _ = cancel.cancelled() => break,
            envelope = inbox.recv() => match envelope {
                Some(envelope) => envelope,
                None => break,
            },
        };
        let kind = match TopicKind::parse(&envelope.topic) {
            Ok((kind, _)) => kind,
            Err(e) => {
                tracing::warn!(capture = %capture, from = %envelope.from, error = %e, "Dropping message on unknown topic");
                continue;
            }
        };
        let target = match kind {
            TopicKind::Dispatch | TopicKind::Announce => &agent_tx,
            TopicKind::DispatchResponse | TopicKind::Sync | TopicKind::Checkpoint => &owner_tx,
        };
        if let Err(e) = target.try_send(envelope) {
            tracing::debug!(capture = %capture, topic = %kind, error = %e, "Dropping message, queue full");
        }
    }
    tracing::debug!(capture = %capture, "Inbox router stopped");
}
