use thiserror::Error;

use crate::model::{CaptureId, Ts};

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("Failed to encode {message} for topic {topic}: {reason}")]
    Encode {
        topic: String,
        message: &'static str,
        reason: String,
    },

    #[error("Failed to decode {message} from topic {topic}: {reason}")]
    Decode {
        topic: String,
        message: &'static str,
        reason: String,
    },

    #[error("Unknown topic: {0}")]
    UnknownTopic(String),

    #[error(
        "Invalid watermark from capture {capture}: checkpoint {checkpoint_ts} > resolved {resolved_ts}"
    )]
    InvalidWatermark {
        capture: CaptureId,
        checkpoint_ts: Ts,
        resolved_ts: Ts,
    },

    #[error("Ownership lost at revision {0}")]
    OwnershipLost(i64),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
