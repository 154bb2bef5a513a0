//! Coordinator/worker wire protocol
//!
//! One TCP connection per worker carries newline-delimited JSON records in
//! both directions. The first record from the worker must be a handshake;
//! after the coordinator's `welcome` the worker receives dispatches and
//! answers each with exactly one result. Both sides send heartbeats.

pub mod codec;
pub mod message;

use thiserror::Error;

use crate::models::JobId;

pub use codec::{FrameReader, FrameWriter, DEFAULT_MAX_FRAME_BYTES};
pub use message::{CoordinatorMessage, Dispatch, Handshake, JobResult, WorkerMessage};

/// Protocol errors. Any of these drops the offending connection.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("connection I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed record: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("frame exceeds {limit} bytes")]
    FrameTooLarge { limit: usize },

    #[error("connection closed in the middle of a frame")]
    Truncated,

    #[error("expected {expected}, got {got}")]
    UnexpectedMessage {
        expected: &'static str,
        got: &'static str,
    },

    #[error("no handshake within the handshake timeout")]
    HandshakeTimeout,

    #[error("second handshake on an established connection")]
    DuplicateHandshake,

    #[error("invalid handshake: {0}")]
    InvalidHandshake(String),

    #[error("result for job {0} which is not running on this connection")]
    UnknownJob(JobId),

    #[error("coordinator rejected handshake: {0}")]
    Rejected(String),

    #[error("connection closed by peer")]
    Closed,
}

impl ProtocolError {
    /// Violations are the peer's fault; I/O errors and closes are not
    pub fn is_violation(&self) -> bool {
        !matches!(self, Self::Io(_) | Self::Closed)
    }

    /// Short label for metrics
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Io(_) => "io",
            Self::Malformed(_) => "malformed",
            Self::FrameTooLarge { .. } => "frame_too_large",
            Self::Truncated => "truncated",
            Self::UnexpectedMessage { .. } => "unexpected_message",
            Self::HandshakeTimeout => "handshake_timeout",
            Self::DuplicateHandshake => "duplicate_handshake",
            Self::InvalidHandshake(_) => "invalid_handshake",
            Self::UnknownJob(_) => "unknown_job",
            Self::Rejected(_) => "rejected",
            Self::Closed => "closed",
        }
    }
}
