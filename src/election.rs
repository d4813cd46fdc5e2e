//! Owner election.
//!
//! The scheduler only needs two things from election: a revision that grows
//! with every new owner, and a signal when the current owner loses office.
//! [`LocalElection`] provides both inside a single process.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;

use crate::model::{CaptureId, OwnerRevision};

/// One owner incarnation.
#[derive(Debug, Clone)]
pub struct OwnerTerm {
    pub capture: CaptureId,
    pub revision: OwnerRevision,
    lost: CancellationToken,
}

impl OwnerTerm {
    pub fn new(capture: impl Into<CaptureId>, revision: OwnerRevision) -> Self {
        Self {
            capture: capture.into(),
            revision,
            lost: CancellationToken::new(),
        }
    }

    pub fn is_lost(&self) -> bool {
        self.lost.is_cancelled()
    }

    /// Completes once this term has ended.
    pub async fn lost(&self) {
        self.lost.cancelled().await
    }

    /// Token cancelled when this term ends.
    pub fn fence(&self) -> CancellationToken {
        self.lost.clone()
    }

    /// End this term.
    pub fn revoke(&self) {
        self.lost.cancel();
    }
}

/// Who holds office, as published to observers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OwnerInfo {
    pub capture: CaptureId,
    pub revision: OwnerRevision,
}

#[derive(Debug, Default)]
struct ElectionState {
    last_revision: OwnerRevision,
    current: Option<OwnerTerm>,
}

/// In-process election handing out strictly increasing revisions.
#[derive(Debug, Clone)]
pub struct LocalElection {
    state: Arc<Mutex<ElectionState>>,
    owner_tx: Arc<watch::Sender<Option<OwnerInfo>>>,
}

impl Default for LocalElection {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalElection {
    pub fn new() -> Self {
        let (owner_tx, _) = watch::channel(None);
        Self {
            state: Arc::new(Mutex::new(ElectionState::default())),
            owner_tx: Arc::new(owner_tx),
        }
    }

    /// Make `capture` the owner, ending the previous term if any.
    pub async fn campaign(&self, capture: &str) -> OwnerTerm {
        let mut state = self.state.lock().await;
        if let Some(previous) = state.current.take() {
            tracing::info!(
                capture = %previous.capture,
                revision = previous.revision,
                "Owner deposed"
            );
            previous.revoke();
        }
        state.last_revision += 1;
        let term = OwnerTerm::new(capture, state.last_revision);
        state.current = Some(term.clone());
        tracing::info!(capture = %capture, revision = term.revision, "Owner elected");
        self.owner_tx.send_replace(Some(OwnerInfo {
            capture: term.capture.clone(),
            revision: term.revision,
        }));
        term
    }

    /// Give up office. No-op unless `term` is the current one.
    pub async fn resign(&self, term: &OwnerTerm) {
        let mut state = self.state.lock().await;
        let is_current = state
            .current
            .as_ref()
            .is_some_and(|c| c.revision == term.revision);
        if !is_current {
            return;
        }
        if let Some(current) = state.current.take() {
            current.revoke();
            tracing::info!(capture = %current.capture, revision = current.revision, "Owner resigned");
        }
        self.owner_tx.send_replace(None);
    }

    pub async fn current(&self) -> Option<OwnerInfo> {
        self.state.lock().await.current.as_ref().map(|t| OwnerInfo {
            capture: t.capture.clone(),
            revision: t.revision,
        })
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<OwnerInfo>> {
        self.owner_tx.subscribe()
    }
}
