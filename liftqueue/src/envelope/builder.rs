use std::hash::Hash;

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;

use crate::{
    store::{EnvelopeStore, NewEnvelope},
    LiftQueueError,
};

use super::{EnvelopeId, EnvelopeKind};

/// Builder for creating and enqueuing an envelope.
///
/// # Example
///
/// ```
/// # use liftqueue::prelude::*;
/// # use liftqueue::store::memory::InMemoryStore;
/// # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
/// let store = InMemoryStore::new().paused();
///
/// let id = EnvelopeBuilder::new(EnvelopeKind::Welcome)
///     .with_payload(serde_json::json!({ "user_id": 7 }))
///     .unique_by(&("welcome", 7))
///     .enqueue_to(&store)
///     .await
///     .unwrap();
///
/// let again = EnvelopeBuilder::new(EnvelopeKind::Welcome)
///     .unique_by(&("welcome", 7))
///     .enqueue_to(&store)
///     .await
///     .unwrap();
///
/// assert_eq!(id, again);
/// # });
/// ```
pub struct EnvelopeBuilder<P = ()> {
    kind: EnvelopeKind,
    payload: P,
    scheduled_at: Option<DateTime<Utc>>,
    idempotency_key: Option<u64>,
}

impl EnvelopeBuilder<()> {
    pub fn new(kind: EnvelopeKind) -> Self {
        Self {
            kind,
            payload: (),
            scheduled_at: None,
            idempotency_key: None,
        }
    }
}

impl<P> EnvelopeBuilder<P>
where
    P: Serialize,
{
    pub fn with_payload<Q: Serialize>(self, payload: Q) -> EnvelopeBuilder<Q> {
        EnvelopeBuilder {
            kind: self.kind,
            payload,
            scheduled_at: self.scheduled_at,
            idempotency_key: self.idempotency_key,
        }
    }

    /// Delay the first attempt until `scheduled_at`.
    pub fn schedule_at(self, scheduled_at: DateTime<Utc>) -> Self {
        Self {
            scheduled_at: Some(scheduled_at),
            ..self
        }
    }

    pub fn schedule_in(self, schedule_in: TimeDelta) -> Self {
        self.schedule_at(Utc::now() + schedule_in)
    }

    /// Deduplicate on `key`: enqueuing a second envelope of the same kind with an equal key
    /// returns the id of the existing envelope instead of creating a new one.
    pub fn unique_by<K: Hash + ?Sized>(self, key: &K) -> Self {
        Self {
            idempotency_key: Some(fxhash::hash64(key)),
            ..self
        }
    }

    pub fn build(self) -> Result<NewEnvelope, serde_json::Error> {
        Ok(NewEnvelope {
            kind: self.kind,
            payload: serde_json::to_value(self.payload)?,
            scheduled_at: self.scheduled_at.unwrap_or_else(Utc::now),
            idempotency_key: self.idempotency_key,
        })
    }

    pub async fn enqueue_to<S>(self, store: &S) -> Result<EnvelopeId, LiftQueueError>
    where
        S: EnvelopeStore + ?Sized,
    {
        let envelope = self.build()?;
        let kind = envelope.kind;
        let id = store.insert(envelope).await?;
        tracing::debug!(envelope_id = %id, %kind, "Enqueued {kind} envelope {id}");
        Ok(id)
    }
}
