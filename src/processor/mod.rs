//! Capture-side processing of scheduler messages.
//!
//! - [`Agent`]: applies dispatches and announcements, reports progress
//! - [`KeySpanExecutor`]: runs replication for individual keyspans
//!
//! # Flow
//!
//! 1. An owner announces itself; the agent answers with a sync report
//! 2. Dispatches start or stop keyspans on the executor
//! 3. Each tick, finished operations are acknowledged and, every
//!    checkpoint interval, the lowest watermark is reported

pub mod agent;
pub mod executor;

pub use agent::{Agent, Reply};
pub use executor::{ExecutorPhase, InMemoryExecutor, KeySpanExecutor};

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::protocol::InboundMessage;
use crate::transport::{Envelope, MessageTransport};

/// Run `agent` until `cancel` fires or the inbox closes.
///
/// The agent is shared so that callers can inspect it while it runs.
pub async fn run_agent(
    agent: Arc<Mutex<Agent>>,
    mut inbox: mpsc::Receiver<Envelope>,
    transport: Arc<dyn MessageTransport>,
    cancel: CancellationToken,
) {
    let tick_interval = agent.lock().await.tick_interval();
    let mut interval = tokio::time::interval(tick_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        let replies = tokio::select! {
            _ = cancel.cancelled() => break,
            envelope = inbox.recv() => {
                let Some(envelope) = envelope else {
                    tracing::info!(capture = %transport.local_id(), "Agent inbox closed");
                    break;
                };
                handle_envelope(&agent, envelope).await
            }
            _ = interval.tick() => {
                agent.lock().await.tick(Instant::now())
            }
        };

        match replies {
            Ok(replies) => {
                for reply in replies {
                    if let Err(e) = transport.send(&reply.to, &reply.topic, reply.payload) {
                        tracing::warn!(
                            capture = %transport.local_id(),
                            to = %reply.to,
                            topic = %reply.topic,
                            error = %e,
                            "Failed to send agent reply"
                        );
                    }
                }
            }
            Err(e) => {
                tracing::warn!(capture = %transport.local_id(), error = %e, "Agent step failed");
            }
        }
    }
}

async fn handle_envelope(
    agent: &Mutex<Agent>,
    envelope: Envelope,
) -> crate::error::Result<Vec<Reply>> {
    let (changefeed, msg) = InboundMessage::decode(&envelope.topic, &envelope.payload)?;
    let mut agent = agent.lock().await;
    if changefeed != agent.changefeed() {
        tracing::debug!(topic = %envelope.topic, "Message for another changefeed ignored");
        return Ok(Vec::new());
    }
    match msg {
        InboundMessage::Dispatch(dispatch) => agent.on_dispatch(&envelope.from, dispatch),
        InboundMessage::Announce(announce) => agent.on_announce(&envelope.from, announce),
        other => {
            tracing::warn!(from = %envelope.from, topic = %other.kind(), "Agent ignoring owner-bound message");
            Ok(Vec::new())
        }
    }
}
