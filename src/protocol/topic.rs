use std::fmt;

use crate::error::{Result, SchedulerError};

/// A message topic, scoped to one changefeed.
pub type Topic = String;

/// The five topics of the owner/processor protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TopicKind {
    /// owner -> capture: add or remove a keyspan
    Dispatch,
    /// capture -> owner: a dispatched operation finished
    DispatchResponse,
    /// owner -> capture: a new owner took office
    Announce,
    /// capture -> owner: full report of the capture's keyspans
    Sync,
    /// capture -> owner: watermark report
    Checkpoint,
}

impl TopicKind {
    pub const ALL: [TopicKind; 5] = [
        TopicKind::Dispatch,
        TopicKind::DispatchResponse,
        TopicKind::Announce,
        TopicKind::Sync,
        TopicKind::Checkpoint,
    ];

    pub fn prefix(self) -> &'static str {
        match self {
            TopicKind::Dispatch => "dispatch",
            TopicKind::DispatchResponse => "dispatch-resp",
            TopicKind::Announce => "send-status",
            TopicKind::Sync => "send-status-resp",
            TopicKind::Checkpoint => "checkpoint",
        }
    }

    pub fn topic(self, changefeed: &str) -> Topic {
        format!("{}/{}", self.prefix(), changefeed)
    }

    /// Split a topic into its kind and changefeed.
    pub fn parse(topic: &str) -> Result<(TopicKind, &str)> {
        let (prefix, changefeed) = topic
            .split_once('/')
            .ok_or_else(|| SchedulerError::UnknownTopic(topic.to_string()))?;
        let kind = TopicKind::ALL
            .into_iter()
            .find(|k| k.prefix() == prefix)
            .ok_or_else(|| SchedulerError::UnknownTopic(topic.to_string()))?;
        if changefeed.is_empty() {
            return Err(SchedulerError::UnknownTopic(topic.to_string()));
        }
        Ok((kind, changefeed))
    }
}

impl fmt::Display for TopicKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.prefix())
    }
}

pub fn dispatch_keyspan_topic(changefeed: &str) -> Topic {
    TopicKind::Dispatch.topic(changefeed)
}

pub fn dispatch_keyspan_response_topic(changefeed: &str) -> Topic {
    TopicKind::DispatchResponse.topic(changefeed)
}

pub fn announce_topic(changefeed: &str) -> Topic {
    TopicKind::Announce.topic(changefeed)
}

pub fn sync_topic(changefeed: &str) -> Topic {
    TopicKind::Sync.topic(changefeed)
}

pub fn checkpoint_topic(changefeed: &str) -> Topic {
    TopicKind::Checkpoint.topic(changefeed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topics_are_scoped_by_changefeed() {
        assert_eq!(dispatch_keyspan_topic("cf-1"), "dispatch/cf-1");
        assert_eq!(dispatch_keyspan_response_topic("cf-1"), "dispatch-resp/cf-1");
        assert_eq!(announce_topic("cf-1"), "send-status/cf-1");
        assert_eq!(sync_topic("cf-1"), "send-status-resp/cf-1");
        assert_eq!(checkpoint_topic("cf-1"), "checkpoint/cf-1");
    }

    #[test]
    fn parse_distinguishes_overlapping_prefixes() {
        let (kind, cf) = TopicKind::parse("send-status-resp/cf-1").unwrap();
        assert_eq!(kind, TopicKind::Sync);
        assert_eq!(cf, "cf-1");

        let (kind, _) = TopicKind::parse("send-status/cf-1").unwrap();
        assert_eq!(kind, TopicKind::Announce);
    }

    #[test]
    fn parse_keeps_slashes_in_changefeed() {
        let (kind, cf) = TopicKind::parse("checkpoint/ns/cf-1").unwrap();
        assert_eq!(kind, TopicKind::Checkpoint);
        assert_eq!(cf, "ns/cf-1");
    }

    #[test]
    fn parse_rejects_unknown_topics() {
        assert!(TopicKind::parse("heartbeat/cf-1").is_err());
        assert!(TopicKind::parse("dispatch").is_err());
        assert!(TopicKind::parse("dispatch/").is_err());
    }
}
