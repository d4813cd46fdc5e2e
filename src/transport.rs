//! Peer-addressed message transport.
//!
//! The scheduler only needs a non-blocking `send(to, topic, payload)` and an
//! inbox of [`Envelope`]s. Delivery is at-least-once and ordered per
//! (sender, receiver) pair. [`LocalHub`] implements this in memory for
//! single-process deployments and tests.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use tokio::sync::mpsc;

use crate::error::{Result, SchedulerError};
use crate::model::CaptureId;
use crate::protocol::Topic;

const DEFAULT_INBOX_CAPACITY: usize = 1024;

/// A message as seen by its receiver.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub from: CaptureId,
    pub topic: Topic,
    pub payload: Vec<u8>,
}

/// Fire-and-forget publishing. Implementations must not block.
pub trait MessageTransport: Send + Sync {
    /// Identity of the local node, stamped on every envelope it sends.
    fn local_id(&self) -> &str;

    fn send(&self, to: &str, topic: &Topic, payload: Vec<u8>) -> Result<()>;
}

#[derive(Debug, Default)]
struct HubState {
    inboxes: HashMap<CaptureId, mpsc::Sender<Envelope>>,
    isolated: HashSet<CaptureId>,
}

/// In-memory registry of node inboxes.
#[derive(Debug, Clone)]
pub struct LocalHub {
    state: Arc<RwLock<HubState>>,
    inbox_capacity: usize,
}

impl Default for LocalHub {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalHub {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_INBOX_CAPACITY)
    }

    pub fn with_capacity(inbox_capacity: usize) -> Self {
        Self {
            state: Arc::new(RwLock::new(HubState::default())),
            inbox_capacity,
        }
    }

    /// Register `node` and return its sending handle and inbox. Registering
    /// an existing node replaces its inbox.
    pub fn endpoint(&self, node: &str) -> Result<(LocalTransport, mpsc::Receiver<Envelope>)> {
        let (tx, rx) = mpsc::channel(self.inbox_capacity);
        self.write()?.inboxes.insert(node.to_string(), tx);
        tracing::debug!(node = %node, "Registered transport endpoint");
        Ok((
            LocalTransport {
                node: node.to_string(),
                hub: self.clone(),
            },
            rx,
        ))
    }

    /// Remove `node`. Its inbox closes once pending messages are drained.
    pub fn deregister(&self, node: &str) -> Result<()> {
        self.write()?.inboxes.remove(node);
        Ok(())
    }

    /// While isolated, every message to or from `node` is silently lost.
    pub fn set_isolated(&self, node: &str, isolated: bool) -> Result<()> {
        let mut state = self.write()?;
        if isolated {
            state.isolated.insert(node.to_string());
        } else {
            state.isolated.remove(node);
        }
        Ok(())
    }

    pub fn nodes(&self) -> Result<Vec<CaptureId>> {
        let state = self.read()?;
        let mut nodes: Vec<CaptureId> = state.inboxes.keys().cloned().collect();
        nodes.sort();
        Ok(nodes)
    }

    fn deliver(&self, from: &str, to: &str, topic: &Topic, payload: Vec<u8>) -> Result<()> {
        let state = self.read()?;
        if state.isolated.contains(from) || state.isolated.contains(to) {
            tracing::debug!(from = %from, to = %to, topic = %topic, "Dropping message for isolated node");
            return Ok(());
        }
        let inbox = state
            .inboxes
            .get(to)
            .ok_or_else(|| SchedulerError::Transport(format!("unknown peer {to}")))?;
        inbox
            .try_send(Envelope {
                from: from.to_string(),
                topic: topic.clone(),
                payload,
            })
            .map_err(|e| SchedulerError::Transport(format!("send to {to} on {topic}: {e}")))
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, HubState>> {
        self.state
            .read()
            .map_err(|_| SchedulerError::Internal("transport hub lock poisoned".to_string()))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, HubState>> {
        self.state
            .write()
            .map_err(|_| SchedulerError::Internal("transport hub lock poisoned".to_string()))
    }
}

/// Sending handle of one node registered with a [`LocalHub`].
#[derive(Debug, Clone)]
pub struct LocalTransport {
    node: CaptureId,
    hub: LocalHub,
}

impl MessageTransport for LocalTransport {
    fn local_id(&self) -> &str {
        &self.node
    }

    fn send(&self, to: &str, topic: &Topic, payload: Vec<u8>) -> Result<()> {
        self.hub.deliver(&self.node, to, topic, payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delivers_in_send_order() {
        let hub = LocalHub::new();
        let (a, _a_rx) = hub.endpoint("a").unwrap();
        let (_b, mut b_rx) = hub.endpoint("b").unwrap();

        a.send("b", &"t/cf".to_string(), vec![1]).unwrap();
        a.send("b", &"t/cf".to_string(), vec![2]).unwrap();

        let first = b_rx.recv().await.unwrap();
        let second = b_rx.recv().await.unwrap();
        assert_eq!(first.from, "a");
        assert_eq!(first.payload, vec![1]);
        assert_eq!(second.payload, vec![2]);
    }

    #[tokio::test]
    async fn unknown_peer_is_an_error() {
        let hub = LocalHub::new();
        let (a, _rx) = hub.endpoint("a").unwrap();
        let err = a.send("nobody", &"t/cf".to_string(), vec![]).unwrap_err();
        assert!(matches!(err, SchedulerError::Transport(_)));
    }

    #[tokio::test]
    async fn full_inbox_is_an_error() {
        let hub = LocalHub::with_capacity(1);
        let (a, _a_rx) = hub.endpoint("a").unwrap();
        let (_b, _b_rx) = hub.endpoint("b").unwrap();
        a.send("b", &"t/cf".to_string(), vec![]).unwrap();
        assert!(a.send("b", &"t/cf".to_string(), vec![]).is_err());
    }

    #[tokio::test]
    async fn isolated_nodes_lose_messages() {
        let hub = LocalHub::new();
        let (a, _a_rx) = hub.endpoint("a").unwrap();
        let (_b, mut b_rx) = hub.endpoint("b").unwrap();

        hub.set_isolated("b", true).unwrap();
        a.send("b", &"t/cf".to_string(), vec![1]).unwrap();
        hub.set_isolated("b", false).unwrap();
        a.send("b", &"t/cf".to_string(), vec![2]).unwrap();

        assert_eq!(b_rx.recv().await.unwrap().payload, vec![2]);
        assert!(b_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn deregister_removes_peer() {
        let hub = LocalHub::new();
        let (a, _a_rx) = hub.endpoint("a").unwrap();
        let (_b, _b_rx) = hub.endpoint("b").unwrap();
        assert_eq!(hub.nodes().unwrap(), vec!["a".to_string(), "b".to_string()]);

        hub.deregister("b").unwrap();
        assert!(a.send("b", &"t/cf".to_string(), vec![]).is_err());
    }
}
