//! Provides an in memory implementation of [`EnvelopeStore`].
//!
//! It is not optimized, instead it is designed to be a correct implementation for use in tests,
//! demos, and single process deployments that can tolerate losing envelopes on restart.
use std::{
    collections::HashMap,
    ops::Sub,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, RwLock,
    },
};

use async_stream::stream;
use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use tokio::sync::mpsc;

use super::{
    queryable::Queryable, EnvelopeQuery, EnvelopeStore, NewEnvelope, ReadyStream, StatusUpdate,
    StoreError,
};
use crate::envelope::{Envelope, EnvelopeId, EnvelopeKind, EnvelopeStatus};

struct ReadyEnvelopeStream {
    store: InMemoryStore,
    kind: EnvelopeKind,
    receiver: mpsc::UnboundedReceiver<DateTime<Utc>>,
}

impl ReadyEnvelopeStream {
    const DEFAULT_DELAY: std::time::Duration = std::time::Duration::from_secs(30);
    const DELTA: std::time::Duration = std::time::Duration::from_millis(15);

    async fn next(&mut self) -> Result<Envelope, StoreError> {
        loop {
            let delay = match self.store.next_due_at_for_kind(self.kind)? {
                Some(timestamp) => timestamp
                    .sub(Utc::now())
                    .to_std()
                    .unwrap_or(Self::DELTA)
                    .min(Self::DEFAULT_DELAY),
                None => Self::DEFAULT_DELAY,
            };
            if delay <= Self::DELTA {
                if let Some(envelope) = self.store.claim_next_due_for_kind(self.kind)? {
                    return Ok(envelope);
                }
            }
            tokio::select! {
                _ = self.receiver.recv() => {},
                _ = tokio::time::sleep(delay) => {},
            }
        }
    }
}

type Subscriber = mpsc::UnboundedSender<DateTime<Utc>>;

/// An in memory implementation of [`EnvelopeStore`].
///
/// Clones share the same underlying storage.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    envelopes: Arc<RwLock<Vec<Envelope>>>,
    id_counter: Arc<AtomicU64>,
    subscribers: Arc<RwLock<HashMap<EnvelopeKind, Vec<Subscriber>>>>,
    paused: Arc<AtomicBool>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run the store in paused mode, where ready streams are not woken up when envelopes are
    /// inserted or updated.
    ///
    /// Call [`InMemoryStore::notify_all`] to wake them.
    pub fn paused(self) -> Self {
        self.paused.store(true, Ordering::Relaxed);
        self
    }

    /// Wake every ready stream subscriber.
    pub fn notify_all(&self) -> Result<(), StoreError> {
        let now = Utc::now();
        self.subscribers
            .write()
            .map_err(|_| StoreError::BadState)?
            .values_mut()
            .for_each(|senders| senders.retain(|sender| sender.send(now).is_ok()));
        Ok(())
    }

    fn next_due_at_for_kind(
        &self,
        kind: EnvelopeKind,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        Ok(self
            .envelopes
            .read()
            .map_err(|_| StoreError::BadState)?
            .iter()
            .filter(|envelope| {
                envelope.kind == kind && envelope.status == EnvelopeStatus::Pending
            })
            .filter_map(|envelope| envelope.next_attempt_at)
            .min())
    }

    fn claim_next_due_for_kind(
        &self,
        kind: EnvelopeKind,
    ) -> Result<Option<Envelope>, StoreError> {
        let horizon =
            Utc::now() + TimeDelta::milliseconds(ReadyEnvelopeStream::DELTA.as_millis() as i64);
        let mut envelopes = self.envelopes.write().map_err(|_| StoreError::BadState)?;
        let next = envelopes
            .iter_mut()
            .filter(|envelope| envelope.kind == kind && envelope.is_due(horizon))
            .min_by(|a, b| {
                a.next_attempt_at
                    .cmp(&b.next_attempt_at)
                    .then(a.id.cmp(&b.id))
            });
        Ok(next.map(|envelope| {
            envelope.mark_in_flight();
            envelope.clone()
        }))
    }

    fn notify_subscribers(
        &self,
        kind: EnvelopeKind,
        due_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        if !self.paused.load(Ordering::Relaxed) {
            if let Some(senders) = self
                .subscribers
                .write()
                .map_err(|_| StoreError::BadState)?
                .get_mut(&kind)
            {
                // Streams that were dropped are unsubscribed here.
                senders.retain(|sender| sender.send(due_at).is_ok());
            }
        }
        Ok(())
    }

    fn with_envelope<T>(
        &self,
        id: EnvelopeId,
        f: impl FnOnce(&mut Envelope) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut envelopes = self.envelopes.write().map_err(|_| StoreError::BadState)?;
        match envelopes.iter_mut().find(|envelope| envelope.id == id) {
            None => Err(StoreError::NotFound(id)),
            Some(envelope) => f(envelope),
        }
    }
}

impl NewEnvelope {
    fn into_envelope(self, id: EnvelopeId) -> Envelope {
        Envelope {
            id,
            kind: self.kind,
            payload: self.payload,
            status: EnvelopeStatus::Pending,
            attempt: 0,
            last_error: None,
            errors: vec![],
            idempotency_key: self.idempotency_key,
            inserted_at: Utc::now(),
            next_attempt_at: Some(self.scheduled_at),
            attempted_at: None,
            completed_at: None,
            failed_at: None,
        }
    }
}

impl Envelope {
    fn mark_in_flight(&mut self) {
        self.status = EnvelopeStatus::InFlight;
        self.attempt = self.attempt.saturating_add(1);
        self.attempted_at = Some(Utc::now());
        self.next_attempt_at = None;
    }

    fn claim(&mut self) -> Result<(), StoreError> {
        match self.status {
            EnvelopeStatus::Pending => {
                self.mark_in_flight();
                Ok(())
            }
            EnvelopeStatus::InFlight => Err(StoreError::AlreadyInFlight(self.id)),
            status => Err(StoreError::Terminal {
                id: self.id,
                status,
            }),
        }
    }

    fn apply(&mut self, update: StatusUpdate) -> Result<(), StoreError> {
        if self.status != EnvelopeStatus::InFlight {
            return Err(StoreError::NotInFlight(self.id));
        }
        if update.attempt != self.attempt {
            return Err(StoreError::StaleUpdate {
                id: self.id,
                expected: self.attempt,
                found: update.attempt,
            });
        }
        let now = Utc::now();
        match update.status {
            EnvelopeStatus::Succeeded => {
                self.completed_at = Some(now);
                self.next_attempt_at = None;
            }
            EnvelopeStatus::Pending => {
                self.next_attempt_at = Some(update.next_attempt_at.unwrap_or(now));
            }
            EnvelopeStatus::Failed => {
                self.failed_at = Some(now);
                self.next_attempt_at = None;
            }
            status @ EnvelopeStatus::InFlight => {
                return Err(StoreError::InvalidTransition {
                    id: self.id,
                    status,
                })
            }
        }
        self.status = update.status;
        if let Some(error) = update.last_error.as_ref() {
            self.errors.push(error.clone());
        }
        self.last_error = update.last_error;
        Ok(())
    }

    fn rescue(&mut self) {
        self.status = EnvelopeStatus::Pending;
        self.next_attempt_at = Some(Utc::now());
    }
}

#[async_trait]
impl EnvelopeStore for InMemoryStore {
    async fn insert(&self, envelope: NewEnvelope) -> Result<EnvelopeId, StoreError> {
        let kind = envelope.kind;
        let due_at = envelope.scheduled_at;
        let id = {
            let mut envelopes = self.envelopes.write().map_err(|_| StoreError::BadState)?;
            if let Some(existing) = envelope.idempotency_key.and_then(|key| {
                envelopes.iter().find(|existing| {
                    existing.kind == kind && existing.idempotency_key == Some(key)
                })
            }) {
                return Ok(existing.id);
            }
            let id = EnvelopeId::from(self.id_counter.fetch_add(1, Ordering::SeqCst));
            envelopes.push(envelope.into_envelope(id));
            id
        };
        self.notify_subscribers(kind, due_at)?;
        Ok(id)
    }

    async fn get(&self, id: EnvelopeId) -> Result<Envelope, StoreError> {
        self.envelopes
            .read()
            .map_err(|_| StoreError::BadState)?
            .iter()
            .find(|envelope| envelope.id == id)
            .cloned()
            .ok_or(StoreError::NotFound(id))
    }

    async fn claim(&self, id: EnvelopeId) -> Result<Envelope, StoreError> {
        self.with_envelope(id, |envelope| {
            envelope.claim()?;
            Ok(envelope.clone())
        })
    }

    async fn update_status(&self, id: EnvelopeId, update: StatusUpdate) -> Result<(), StoreError> {
        let due = self.with_envelope(id, |envelope| {
            envelope.apply(update)?;
            Ok(match envelope.status {
                EnvelopeStatus::Pending => envelope.next_attempt_at.map(|at| (envelope.kind, at)),
                _ => None,
            })
        })?;
        if let Some((kind, due_at)) = due {
            self.notify_subscribers(kind, due_at)?;
        }
        Ok(())
    }

    async fn subscribe_ready(&self, kind: EnvelopeKind) -> ReadyStream {
        let (sender, receiver) = mpsc::unbounded_channel();
        match self.subscribers.write() {
            Ok(mut subscribers) => {
                let senders = subscribers.entry(kind).or_default();
                senders.retain(|sender| !sender.is_closed());
                senders.push(sender);
            }
            Err(_) => {
                return Box::pin(futures::stream::once(async {
                    Err::<Envelope, _>(StoreError::BadState)
                }))
            }
        }

        let mut stream = ReadyEnvelopeStream {
            store: self.clone(),
            kind,
            receiver,
        };
        Box::pin(stream! {
            loop {
                yield stream.next().await;
            }
        })
    }

    async fn rescue_stalled(
        &self,
        attempted_before: DateTime<Utc>,
    ) -> Result<Vec<EnvelopeId>, StoreError> {
        let rescued = {
            let mut envelopes = self.envelopes.write().map_err(|_| StoreError::BadState)?;
            envelopes
                .iter_mut()
                .filter(|envelope| {
                    envelope.status == EnvelopeStatus::InFlight
                        && envelope
                            .attempted_at
                            .is_some_and(|attempted_at| attempted_at < attempted_before)
                })
                .map(|envelope| {
                    envelope.rescue();
                    (envelope.id, envelope.kind)
                })
                .collect::<Vec<_>>()
        };
        let now = Utc::now();
        for (_, kind) in &rescued {
            self.notify_subscribers(*kind, now)?;
        }
        Ok(rescued.into_iter().map(|(id, _)| id).collect())
    }

    async fn query(&self, query: EnvelopeQuery) -> Result<Vec<Envelope>, StoreError> {
        Ok(self
            .envelopes
            .read()
            .map_err(|_| StoreError::BadState)?
            .iter()
            .filter(|envelope| query.matches(envelope))
            .cloned()
            .collect())
    }
}
