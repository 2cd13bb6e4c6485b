//! Boundary to the target system's transactional remote-call protocol.
//!
//! Wire encoding, connection handling and authentication belong to the
//! implementor of [`RemoteTransport`]; this crate only relies on the four
//! primitives below and on the target applying a `(tid, sequence_number)`
//! pair at most once.

pub mod loopback;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::{Destination, DocumentList, TransactionId};

pub use loopback::{CallOutcome, CallRecord, LoopbackTarget, Operation};

pub const MAX_ERROR_MESSAGE_LENGTH: usize = 512;
pub const MAX_ERROR_CODE_LENGTH: usize = 64;

/// Acknowledgement of one `send_with_tid` call.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    pub tid: TransactionId,
    pub sequence_number: u64,
    /// The target had already applied this pair and did not apply it again.
    pub duplicate: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    Transient,
    Permanent,
}

#[derive(Clone, Debug, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum TransportError {
    #[error("transient transport failure [{code}]: {message}")]
    Transient { code: String, message: String },

    #[error("permanent transport failure [{code}]: {message}")]
    Permanent { code: String, message: String },

    #[error("sequence conflict on {tid}: expected {expected}, received {received}")]
    SequenceConflict {
        tid: TransactionId,
        expected: u64,
        received: u64,
    },
}

impl TransportError {
    pub fn transient(code: impl Into<String>, message: impl Into<String>) -> Self {
        let (code, message) = bounded(code.into(), message.into());
        TransportError::Transient { code, message }
    }

    pub fn permanent(code: impl Into<String>, message: impl Into<String>) -> Self {
        let (code, message) = bounded(code.into(), message.into());
        TransportError::Permanent { code, message }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, TransportError::Transient { .. })
    }

    /// Sequence conflicts are never retried, so they count as permanent.
    pub fn kind(&self) -> FailureKind {
        match self {
            TransportError::Transient { .. } => FailureKind::Transient,
            TransportError::Permanent { .. } | TransportError::SequenceConflict { .. } => {
                FailureKind::Permanent
            }
        }
    }

    pub fn code(&self) -> &str {
        match self {
            TransportError::Transient { code, .. } | TransportError::Permanent { code, .. } => {
                code
            }
            TransportError::SequenceConflict { .. } => "SEQUENCE_CONFLICT",
        }
    }
}

fn bounded(mut code: String, mut message: String) -> (String, String) {
    truncate_utf8_safe(&mut code, MAX_ERROR_CODE_LENGTH);
    truncate_utf8_safe(&mut message, MAX_ERROR_MESSAGE_LENGTH);
    (code, message)
}

fn truncate_utf8_safe(s: &mut String, max_bytes: usize) {
    if s.len() <= max_bytes {
        return;
    }

    let mut truncate_at = max_bytes;
    while truncate_at > 0 && !s.is_char_boundary(truncate_at) {
        truncate_at -= 1;
    }
    s.truncate(truncate_at);
}

#[async_trait::async_trait]
pub trait RemoteTransport: Send + Sync {
    async fn create_tid(&self, destination: &Destination) -> Result<TransactionId, TransportError>;

    async fn send_with_tid(
        &self,
        destination: &Destination,
        payload: &DocumentList,
        tid: &TransactionId,
        sequence_number: u64,
    ) -> Result<Ack, TransportError>;

    async fn commit(
        &self,
        destination: &Destination,
        tid: &TransactionId,
    ) -> Result<(), TransportError>;

    async fn rollback(
        &self,
        destination: &Destination,
        tid: &TransactionId,
    ) -> Result<(), TransportError>;
}
