use serde::{Deserialize, Deserializer, Serialize};

use crate::model::{KeySpan, KeySpanId, OwnerRevision, Ts};
use crate::protocol::topic::TopicKind;

/// Asks a processor to start (`is_delete == false`) or stop replicating a keyspan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct DispatchKeySpanMessage {
    pub owner_rev: OwnerRevision,
    pub id: KeySpanId,
    pub is_delete: bool,
    #[serde(with = "base64_bytes")]
    pub start: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub end: Vec<u8>,
}

impl DispatchKeySpanMessage {
    pub fn add(owner_rev: OwnerRevision, id: KeySpanId, span: &KeySpan) -> Self {
        Self {
            owner_rev,
            id,
            is_delete: false,
            start: span.start.clone(),
            end: span.end.clone(),
        }
    }

    pub fn remove(owner_rev: OwnerRevision, id: KeySpanId) -> Self {
        Self {
            owner_rev,
            id,
            is_delete: true,
            start: Vec::new(),
            end: Vec::new(),
        }
    }

    pub fn span(&self) -> KeySpan {
        KeySpan::new(self.start.clone(), self.end.clone())
    }
}

/// Sent by a processor once a dispatched operation has finished.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct DispatchKeySpanResponseMessage {
    pub id: KeySpanId,
}

/// Broadcast by a newly elected owner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct AnnounceMessage {
    pub owner_rev: OwnerRevision,
    pub owner_version: String,
}

/// A processor's full report of the keyspans it holds, sent in reply to an
/// announcement. Encoded as MessagePack because the lists can be large.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SyncMessage {
    pub processor_version: String,
    #[serde(default, deserialize_with = "nullable_vec")]
    pub running: Vec<KeySpanId>,
    #[serde(default, deserialize_with = "nullable_vec")]
    pub adding: Vec<KeySpanId>,
    #[serde(default, deserialize_with = "nullable_vec")]
    pub removing: Vec<KeySpanId>,
}

/// Periodic watermark report from a processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct CheckpointMessage {
    pub checkpoint_ts: Ts,
    pub resolved_ts: Ts,
}

/// Payload encoding used on a topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Json,
    MessagePack,
}

/// Binds a message type to its topic and wire encoding.
pub trait ProtocolMessage: Serialize + for<'de> Deserialize<'de> {
    const KIND: TopicKind;
    const ENCODING: Encoding;
    const NAME: &'static str;
}

impl ProtocolMessage for DispatchKeySpanMessage {
    const KIND: TopicKind = TopicKind::Dispatch;
    const ENCODING: Encoding = Encoding::Json;
    const NAME: &'static str = "DispatchKeySpanMessage";
}

impl ProtocolMessage for DispatchKeySpanResponseMessage {
    const KIND: TopicKind = TopicKind::DispatchResponse;
    const ENCODING: Encoding = Encoding::Json;
    const NAME: &'static str = "DispatchKeySpanResponseMessage";
}

impl ProtocolMessage for AnnounceMessage {
    const KIND: TopicKind = TopicKind::Announce;
    const ENCODING: Encoding = Encoding::Json;
    const NAME: &'static str = "AnnounceMessage";
}

impl ProtocolMessage for SyncMessage {
    const KIND: TopicKind = TopicKind::Sync;
    const ENCODING: Encoding = Encoding::MessagePack;
    const NAME: &'static str = "SyncMessage";
}

impl ProtocolMessage for CheckpointMessage {
    const KIND: TopicKind = TopicKind::Checkpoint;
    const ENCODING: Encoding = Encoding::Json;
    const NAME: &'static str = "CheckpointMessage";
}

fn nullable_vec<'de, D>(deserializer: D) -> Result<Vec<KeySpanId>, D::Error>
where
    D: Deserializer<'de>,
{
    let v: Option<Vec<KeySpanId>> = Deserialize::deserialize(deserializer)?;
    Ok(v.unwrap_or_default())
}

/// Byte slices travel as base64 strings in JSON payloads.
mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(val: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(val))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s: Option<String> = Deserialize::deserialize(deserializer)?;
        match s {
            Some(s) => STANDARD.decode(s).map_err(serde::de::Error::custom),
            None => Ok(Vec::new()),
        }
    }
}
