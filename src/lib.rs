//! Transactional outbound delivery of IDoc document lists over tRFC.
//!
//! A [`TransactionalSender`] binds each [`TransactionKey`] to one target
//! issued [`TransactionId`], delivers document lists under it as ordered,
//! idempotent sends and finishes the transaction with a single commit or
//! rollback. The target itself sits behind [`RemoteTransport`].

#![forbid(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::missing_errors_doc)]

pub mod allocator;
pub mod config;
pub mod lock;
pub mod model;
pub mod retry;
pub mod sender;
pub mod store;
pub mod tracker;
pub mod transport;

pub use allocator::{AllocationError, TransactionIdAllocator};
pub use config::{ConfigError, DeliveryConfig};
pub use lock::{KeyGuard, KeyLocks};
pub use model::{
    Destination, Document, DocumentList, FlowName, PayloadFingerprint, SendRequest,
    TransactionId, TransactionKey, UnixTimeMs, ValidationError,
};
pub use retry::RetryPolicy;
pub use sender::{
    DeliveryReport, MetricsSnapshot, Receipt, SendError, SendOutcome, SenderMetrics,
    SenderState, TransactionOutcome, TransactionScope, TransactionalSender,
};
pub use store::{Lookup, StoreError, TransactionIdStore, TransactionRecord, TransactionState};
pub use tracker::{
    AttemptId, AttemptOutcome, DeliveryAttempt, DeliveryTracker, Disposition, RollbackReason,
    TrackerError,
};
pub use transport::{
    Ack, CallOutcome, CallRecord, FailureKind, LoopbackTarget, Operation, RemoteTransport,
    TransportError,
};
