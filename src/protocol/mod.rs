//! Owner/processor message protocol.
//!
//! Every message travels on a topic scoped to one changefeed. Small control
//! messages are JSON; the sync report is MessagePack because it carries whole
//! keyspan lists.
//!
//! | Topic | Direction | Message |
//! |---|---|---|
//! | `dispatch/<cf>` | owner -> capture | [`DispatchKeySpanMessage`] |
//! | `dispatch-resp/<cf>` | capture -> owner | [`DispatchKeySpanResponseMessage`] |
//! | `send-status/<cf>` | owner -> capture | [`AnnounceMessage`] |
//! | `send-status-resp/<cf>` | capture -> owner | [`SyncMessage`] |
//! | `checkpoint/<cf>` | capture -> owner | [`CheckpointMessage`] |

pub mod messages;
pub mod topic;

pub use messages::{
    AnnounceMessage, CheckpointMessage, DispatchKeySpanMessage, DispatchKeySpanResponseMessage,
    Encoding, ProtocolMessage, SyncMessage,
};
pub use topic::{
    announce_topic, checkpoint_topic, dispatch_keyspan_response_topic, dispatch_keyspan_topic,
    sync_topic, Topic, TopicKind,
};

use serde::Serialize;

use crate::error::{Result, SchedulerError};

/// Serialize a message for `changefeed`, returning the topic it belongs on.
pub fn encode<M: ProtocolMessage>(changefeed: &str, msg: &M) -> Result<(Topic, Vec<u8>)> {
    let topic = M::KIND.topic(changefeed);
    let payload = match M::ENCODING {
        Encoding::Json => serde_json::to_vec(msg).map_err(|e| e.to_string()),
        Encoding::MessagePack => rmp_serde::to_vec_named(msg).map_err(|e| e.to_string()),
    }
    .map_err(|reason| SchedulerError::Encode {
        topic: topic.clone(),
        message: M::NAME,
        reason,
    })?;
    Ok((topic, payload))
}

/// Deserialize a payload received on `topic`.
pub fn decode<M: ProtocolMessage>(topic: &str, payload: &[u8]) -> Result<M> {
    let (kind, _) = TopicKind::parse(topic)?;
    if kind != M::KIND {
        return Err(SchedulerError::Decode {
            topic: topic.to_string(),
            message: M::NAME,
            reason: format!("expected a {} topic", M::KIND),
        });
    }
    match M::ENCODING {
        Encoding::Json => serde_json::from_slice(payload).map_err(|e| e.to_string()),
        Encoding::MessagePack => rmp_serde::from_slice(payload).map_err(|e| e.to_string()),
    }
    .map_err(|reason| SchedulerError::Decode {
        topic: topic.to_string(),
        message: M::NAME,
        reason,
    })
}

/// Any protocol message, decoded according to its topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "message", rename_all = "kebab-case")]
pub enum InboundMessage {
    Dispatch(DispatchKeySpanMessage),
    DispatchResponse(DispatchKeySpanResponseMessage),
    Announce(AnnounceMessage),
    Sync(SyncMessage),
    Checkpoint(CheckpointMessage),
}

impl InboundMessage {
    /// Decode a payload, returning the changefeed the topic is scoped to.
    pub fn decode(topic: &str, payload: &[u8]) -> Result<(String, InboundMessage)> {
        let (kind, changefeed) = TopicKind::parse(topic)?;
        let msg = match kind {
            TopicKind::Dispatch => InboundMessage::Dispatch(decode(topic, payload)?),
            TopicKind::DispatchResponse => {
                InboundMessage::DispatchResponse(decode(topic, payload)?)
            }
            TopicKind::Announce => InboundMessage::Announce(decode(topic, payload)?),
            TopicKind::Sync => InboundMessage::Sync(decode(topic, payload)?),
            TopicKind::Checkpoint => InboundMessage::Checkpoint(decode(topic, payload)?),
        };
        Ok((changefeed.to_string(), msg))
    }

    pub fn kind(&self) -> TopicKind {
        match self {
            InboundMessage::Dispatch(_) => TopicKind::Dispatch,
            InboundMessage::DispatchResponse(_) => TopicKind::DispatchResponse,
            InboundMessage::Announce(_) => TopicKind::Announce,
            InboundMessage::Sync(_) => TopicKind::Sync,
            InboundMessage::Checkpoint(_) => TopicKind::Checkpoint,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::KeySpan;

    #[test]
    fn dispatch_uses_tagged_field_names() {
        let msg = DispatchKeySpanMessage::add(3, 42, &KeySpan::new(b"a".to_vec(), b"b".to_vec()));
        let (topic, payload) = encode("cf-1", &msg).unwrap();
        assert_eq!(topic, "dispatch/cf-1");

        let value: serde_json::Value = serde_json::from_slice(&payload).unwrap();
        assert_eq!(value["owner-rev"], 3);
        assert_eq!(value["id"], 42);
        assert_eq!(value["is-delete"], false);
        assert_eq!(value["start"], "YQ==");
        assert_eq!(value["end"], "Yg==");
    }

    #[test]
    fn dispatch_accepts_null_boundaries() {
        let payload = br#"{"owner-rev":5,"id":7,"is-delete":true,"start":null,"end":null}"#;
        let msg: DispatchKeySpanMessage = decode("dispatch/cf-1", payload).unwrap();
        assert!(msg.is_delete);
        assert!(msg.start.is_empty());
        assert!(msg.end.is_empty());
    }

    #[test]
    fn announce_and_checkpoint_field_names() {
        let (_, payload) = encode(
            "cf",
            &AnnounceMessage {
                owner_rev: 6,
                owner_version: "v1.0.0".to_string(),
            },
        )
        .unwrap();
        assert_eq!(
            std::str::from_utf8(&payload).unwrap(),
            r#"{"owner-rev":6,"owner-version":"v1.0.0"}"#
        );

        let (topic, payload) = encode(
            "cf",
            &CheckpointMessage {
                checkpoint_ts: 100,
                resolved_ts: 120,
            },
        )
        .unwrap();
        assert_eq!(topic, "checkpoint/cf");
        assert_eq!(
            std::str::from_utf8(&payload).unwrap(),
            r#"{"checkpoint-ts":100,"resolved-ts":120}"#
        );
    }

    #[test]
    fn sync_message_is_messagepack_with_named_fields() {
        let msg = SyncMessage {
            processor_version: "v1.0.0".to_string(),
            running: vec![1, 5],
            adding: vec![9],
            removing: vec![],
        };
        let (topic, payload) = encode("cf", &msg).unwrap();
        assert_eq!(topic, "send-status-resp/cf");
        // fixmap with four entries
        assert_eq!(payload[0], 0x84);
        assert!(payload
            .windows(b"ProcessorVersion".len())
            .any(|w| w == b"ProcessorVersion"));

        let decoded: SyncMessage = decode(&topic, &payload).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn sync_message_tolerates_nil_lists() {
        #[derive(serde::Serialize)]
        #[serde(rename_all = "PascalCase")]
        struct Sparse {
            processor_version: &'static str,
            running: Option<Vec<u64>>,
            adding: Option<Vec<u64>>,
            removing: Option<Vec<u64>>,
        }
        let payload = rmp_serde::to_vec_named(&Sparse {
            processor_version: "v1",
            running: Some(vec![3]),
            adding: None,
            removing: None,
        })
        .unwrap();
        let msg: SyncMessage = decode("send-status-resp/cf", &payload).unwrap();
        assert_eq!(msg.running, vec![3]);
        assert!(msg.adding.is_empty());
        assert!(msg.removing.is_empty());
    }

    #[test]
    fn decode_error_names_topic_and_message() {
        let err = decode::<CheckpointMessage>("checkpoint/cf-9", b"{not json").unwrap_err();
        match err {
            SchedulerError::Decode { topic, message, .. } => {
                assert_eq!(topic, "checkpoint/cf-9");
                assert_eq!(message, "CheckpointMessage");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn decode_rejects_mismatched_topic() {
        let (_, payload) = encode(
            "cf",
            &DispatchKeySpanResponseMessage { id: 1 },
        )
        .unwrap();
        assert!(decode::<CheckpointMessage>("dispatch-resp/cf", &payload).is_err());
    }

    #[test]
    fn inbound_message_routes_by_topic() {
        let (topic, payload) = encode("cf-2", &DispatchKeySpanResponseMessage { id: 11 }).unwrap();
        let (cf, msg) = InboundMessage::decode(&topic, &payload).unwrap();
        assert_eq!(cf, "cf-2");
        assert_eq!(
            msg,
            InboundMessage::DispatchResponse(DispatchKeySpanResponseMessage { id: 11 })
        );
        assert_eq!(msg.kind(), TopicKind::DispatchResponse);
    }
}
