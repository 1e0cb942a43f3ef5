//! The durable storage behind the pipeline.
//!
//! An [`EnvelopeStore`] is the single source of truth for the status and attempt count of every
//! envelope. All state transitions are atomic per envelope id.
use std::pin::Pin;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::Stream;
use thiserror::Error;

use crate::envelope::{AttemptError, Envelope, EnvelopeId, EnvelopeKind, EnvelopeStatus};

pub mod memory;
mod queryable;
pub mod testing;

/// A stream of envelopes that are due and have already been claimed for the subscriber.
pub type ReadyStream = Pin<Box<dyn Stream<Item = Result<Envelope, StoreError>> + Send>>;

#[async_trait]
pub trait EnvelopeStore: Send + Sync {
    /// Persist a new [`EnvelopeStatus::Pending`] envelope with an attempt count of zero.
    ///
    /// When the envelope carries an idempotency key and an envelope of the same kind with that
    /// key already exists, the existing id is returned and nothing is inserted.
    async fn insert(&self, envelope: NewEnvelope) -> Result<EnvelopeId, StoreError>;

    async fn get(&self, id: EnvelopeId) -> Result<Envelope, StoreError>;

    /// Atomically move a pending envelope to [`EnvelopeStatus::InFlight`] and increment its
    /// attempt count.
    ///
    /// Fails with [`StoreError::AlreadyInFlight`] or [`StoreError::Terminal`] otherwise, so at
    /// most one caller ever holds an envelope.
    async fn claim(&self, id: EnvelopeId) -> Result<Envelope, StoreError>;

    /// Record the outcome of the attempt currently in flight.
    ///
    /// The update is rejected unless the envelope is in flight and `update.attempt` matches the
    /// stored attempt count.
    async fn update_status(&self, id: EnvelopeId, update: StatusUpdate) -> Result<(), StoreError>;

    /// Subscribe to envelopes of the given kind as they become due.
    ///
    /// Every envelope yielded has been claimed on behalf of the subscriber. When several streams
    /// subscribe to the same kind each envelope is yielded to exactly one of them.
    async fn subscribe_ready(&self, kind: EnvelopeKind) -> ReadyStream;

    /// Return envelopes left in flight since before `attempted_before` to pending, due
    /// immediately. The attempt count is left untouched.
    async fn rescue_stalled(
        &self,
        attempted_before: DateTime<Utc>,
    ) -> Result<Vec<EnvelopeId>, StoreError>;

    async fn query(&self, query: EnvelopeQuery) -> Result<Vec<Envelope>, StoreError>;
}

/// An envelope to be inserted.
#[derive(Debug, Clone, PartialEq)]
pub struct NewEnvelope {
    pub kind: EnvelopeKind,
    pub payload: serde_json::Value,
    /// When the first attempt becomes due.
    pub scheduled_at: DateTime<Utc>,
    pub idempotency_key: Option<u64>,
}

/// The bookkeeping written at the end of an attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusUpdate {
    pub status: EnvelopeStatus,
    pub attempt: u16,
    pub last_error: Option<AttemptError>,
    pub next_attempt_at: Option<DateTime<Utc>>,
}

impl StatusUpdate {
    pub fn succeeded(attempt: u16) -> Self {
        Self {
            status: EnvelopeStatus::Succeeded,
            attempt,
            last_error: None,
            next_attempt_at: None,
        }
    }

    pub fn retrying(attempt: u16, next_attempt_at: DateTime<Utc>, error: AttemptError) -> Self {
        Self {
            status: EnvelopeStatus::Pending,
            attempt,
            last_error: Some(error),
            next_attempt_at: Some(next_attempt_at),
        }
    }

    pub fn failed(attempt: u16, error: AttemptError) -> Self {
        Self {
            status: EnvelopeStatus::Failed,
            attempt,
            last_error: Some(error),
            next_attempt_at: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvelopeQuery {
    Not(Box<EnvelopeQuery>),
    And(Vec<EnvelopeQuery>),
    Or(Vec<EnvelopeQuery>),
    IdEquals(EnvelopeId),
    KindEqual(EnvelopeKind),
    StatusEqual(EnvelopeStatus),
    IdempotencyKeyEqual(u64),
    DueBefore(DateTime<Utc>),
}

impl EnvelopeQuery {
    /// Matches every envelope.
    pub fn all() -> Self {
        Self::And(vec![])
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Envelope {0} not found")]
    NotFound(EnvelopeId),
    #[error("Envelope {0} is already in flight")]
    AlreadyInFlight(EnvelopeId),
    #[error("Envelope {id} already reached terminal state {status:?}")]
    Terminal {
        id: EnvelopeId,
        status: EnvelopeStatus,
    },
    #[error("Envelope {0} is not in flight")]
    NotInFlight(EnvelopeId),
    #[error("Stale update for envelope {id}: attempt {expected} in flight, got {found}")]
    StaleUpdate {
        id: EnvelopeId,
        expected: u16,
        found: u16,
    },
    #[error("Envelope {id} cannot transition to {status:?}")]
    InvalidTransition {
        id: EnvelopeId,
        status: EnvelopeStatus,
    },
    #[error("Error encoding or decoding data")]
    EncodeDecode(#[from] serde_json::Error),
    #[error("Store in bad state")]
    BadState,
}
