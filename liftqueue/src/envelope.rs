//! The envelope: the durable record of one unit of background work.
//!
//! An [`Envelope`] is created when a business action happens (for example a user registering
//! produces a [`EnvelopeKind::Welcome`] envelope) and from then on it is only mutated by the
//! [`crate::dispatcher::Dispatcher`] while executing attempts.
use std::{fmt::Display, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod builder;

/// Opaque identifier of an [`Envelope`].
///
/// Assigned by the [`crate::store::EnvelopeStore`] on insertion and never reused.
#[derive(Debug, Eq, PartialEq, Clone, Copy, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EnvelopeId(u64);

impl From<u64> for EnvelopeId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<EnvelopeId> for u64 {
    fn from(value: EnvelopeId) -> Self {
        value.0
    }
}

impl Display for EnvelopeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "EnvelopeId({})", self.0)
    }
}

/// Selects which [`crate::handler::JobHandler`] processes an envelope.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvelopeKind {
    /// Sent once a user has registered.
    Welcome,
    /// Sent when a user invites someone to train with them.
    Invitation,
    /// Any other transactional notification.
    Generic,
}

impl EnvelopeKind {
    /// Every kind, in declaration order.
    pub const ALL: [EnvelopeKind; 3] = [Self::Welcome, Self::Invitation, Self::Generic];

    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Welcome => "welcome",
            Self::Invitation => "invitation",
            Self::Generic => "generic",
        }
    }
}

impl Display for EnvelopeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("Unknown envelope kind: {0}")]
pub struct UnknownKind(pub String);

impl FromStr for EnvelopeKind {
    type Err = UnknownKind;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == value)
            .ok_or_else(|| UnknownKind(value.to_owned()))
    }
}

/// The lifecycle state of an [`Envelope`].
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum EnvelopeStatus {
    /// Waiting for its first attempt or for a retry.
    Pending,
    /// Claimed by exactly one worker and currently executing.
    InFlight,
    /// The handler reported success. Terminal.
    Succeeded,
    /// Failed permanently or ran out of attempts. Terminal.
    Failed,
}

impl EnvelopeStatus {
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

/// How an attempt failed.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum Failure {
    /// Expected to succeed on a later attempt.
    Transient,
    /// Will not succeed on retry.
    Permanent,
    /// A transient failure on the final permitted attempt.
    Exhausted,
}

/// A failure recorded against an envelope.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct AttemptError {
    pub attempt: u16,
    pub failure: Failure,
    pub error_type: String,
    pub detail: String,
    pub recorded_at: DateTime<Utc>,
}

impl AttemptError {
    pub fn new(
        attempt: u16,
        failure: Failure,
        error_type: impl Into<String>,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            attempt,
            failure,
            error_type: error_type.into(),
            detail: detail.into(),
            recorded_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub id: EnvelopeId,
    pub kind: EnvelopeKind,
    /// Opaque data for the handler. Never interpreted by the dispatcher.
    pub payload: serde_json::Value,
    pub status: EnvelopeStatus,
    /// Number of attempts claimed so far.
    pub attempt: u16,
    pub last_error: Option<AttemptError>,
    pub errors: Vec<AttemptError>,
    pub idempotency_key: Option<u64>,
    pub inserted_at: DateTime<Utc>,
    /// When the envelope becomes due. [`None`] while in flight and once terminal.
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub attempted_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
}

impl Envelope {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Whether the envelope is pending and due at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == EnvelopeStatus::Pending
            && self.next_attempt_at.is_some_and(|due| due <= now)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn kind_round_trips_through_str() {
        for kind in EnvelopeKind::ALL {
            assert_eq!(kind.as_str().parse::<EnvelopeKind>(), Ok(kind));
        }
        assert_eq!(
            "workout".parse::<EnvelopeKind>(),
            Err(UnknownKind("workout".to_owned()))
        );
    }

    #[test]
    fn kind_serializes_lowercase() {
        assert_eq!(
            serde_json::to_value(EnvelopeKind::Invitation).unwrap(),
            serde_json::json!("invitation")
        );
    }

    #[test]
    fn terminal_statuses() {
        assert!(!EnvelopeStatus::Pending.is_terminal());
        assert!(!EnvelopeStatus::InFlight.is_terminal());
        assert!(EnvelopeStatus::Succeeded.is_terminal());
        assert!(EnvelopeStatus::Failed.is_terminal());
    }

    #[test]
    fn display_envelope_id() {
        assert_eq!(EnvelopeId::from(42).to_string(), "EnvelopeId(42)");
    }
}
