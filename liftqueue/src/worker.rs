use std::{sync::Arc, time::Duration};

use futures::StreamExt;
use tokio::{
    sync::{OwnedSemaphorePermit, Semaphore},
    task::JoinHandle,
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::Instrument;

use crate::{
    definition::JobDefinition,
    dispatcher::{DispatchError, Dispatcher},
    envelope::{Envelope, EnvelopeKind},
};

/// Drives every ready envelope of one kind through the [`Dispatcher`].
pub(crate) struct Worker {
    kind: EnvelopeKind,
    dispatcher: Dispatcher,
    limit: Option<Arc<Semaphore>>,
    tracker: TaskTracker,
}

impl Worker {
    const ERROR_BACKOFF: Duration = Duration::from_secs(1);

    pub(crate) fn new(dispatcher: Dispatcher, definition: &JobDefinition) -> Self {
        Self {
            kind: definition.kind(),
            dispatcher,
            limit: definition
                .max_concurrency()
                .map(|permits| Arc::new(Semaphore::new(permits))),
            tracker: TaskTracker::new(),
        }
    }

    /// Spawn the worker loop.
    ///
    /// Once the token is cancelled no further envelopes are claimed, and the returned handle
    /// completes after every attempt already started has finished.
    pub(crate) fn spawn(self, cancellation_token: CancellationToken) -> JoinHandle<()> {
        let kind = self.kind;
        tokio::spawn(
            async move {
                let mut stream = self.dispatcher.store().subscribe_ready(kind).await;
                loop {
                    let permit = tokio::select! {
                        biased;
                        _ = cancellation_token.cancelled() => break,
                        permit = self.acquire() => permit,
                    };
                    let next = tokio::select! {
                        biased;
                        _ = cancellation_token.cancelled() => break,
                        next = stream.next() => next,
                    };
                    match next {
                        Some(Ok(envelope)) => self.dispatch(envelope, permit),
                        Some(Err(err)) => {
                            drop(permit);
                            tracing::error!(
                                ?err,
                                %kind,
                                "Failed to get ready envelope for {kind}, retrying in {:?}: {err}",
                                Self::ERROR_BACKOFF
                            );
                            tokio::select! {
                                biased;
                                _ = cancellation_token.cancelled() => break,
                                _ = tokio::time::sleep(Self::ERROR_BACKOFF) => {}
                            }
                        }
                        None => {
                            tracing::warn!(%kind, "Ready stream for {kind} ended");
                            break;
                        }
                    }
                }
                self.tracker.close();
                self.tracker.wait().await;
                tracing::debug!(%kind, "Shutting down liftqueue worker for {kind}");
            }
            .instrument(tracing::info_span!("worker", %kind)),
        )
    }

    /// Wait for capacity before claiming, so envelopes are only taken off the stream once they
    /// can run.
    async fn acquire(&self) -> Option<OwnedSemaphorePermit> {
        let limit = Arc::clone(self.limit.as_ref()?);
        limit
            .acquire_owned()
            .await
            .inspect_err(|err| {
                tracing::error!(?err, "Concurrency limit for {} unavailable", self.kind)
            })
            .ok()
    }

    fn dispatch(&self, envelope: Envelope, permit: Option<OwnedSemaphorePermit>) {
        let dispatcher = self.dispatcher.clone();
        self.tracker.spawn(
            async move {
                let _permit = permit;
                let envelope_id = envelope.id;
                match dispatcher.run_claimed(envelope).await {
                    Ok(outcome) => {
                        tracing::trace!(%envelope_id, ?outcome, "Attempt of {envelope_id} done")
                    }
                    Err(DispatchError::UnknownKind { .. }) => {}
                    Err(err) => tracing::error!(
                        ?err,
                        %envelope_id,
                        "Failed to dispatch envelope {envelope_id}: {err}"
                    ),
                }
            }
            .in_current_span(),
        );
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use chrono::{DateTime, TimeDelta, Utc};

    use super::*;
    use crate::{
        definition::Registry,
        envelope::{EnvelopeId, EnvelopeStatus},
        retry::RetryPolicy,
        store::{
            memory::InMemoryStore, EnvelopeQuery, EnvelopeStore, NewEnvelope, ReadyStream,
            StatusUpdate, StoreError,
        },
        testing::{ScriptedHandler, Step},
    };

    /// A store whose ready streams fail on every poll.
    #[derive(Default)]
    struct BrokenStore {
        polls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl EnvelopeStore for BrokenStore {
        async fn insert(&self, _envelope: NewEnvelope) -> Result<EnvelopeId, StoreError> {
            Err(StoreError::BadState)
        }
        async fn get(&self, _id: EnvelopeId) -> Result<Envelope, StoreError> {
            Err(StoreError::BadState)
        }
        async fn claim(&self, _id: EnvelopeId) -> Result<Envelope, StoreError> {
            Err(StoreError::BadState)
        }
        async fn update_status(
            &self,
            _id: EnvelopeId,
            _update: StatusUpdate,
        ) -> Result<(), StoreError> {
            Err(StoreError::BadState)
        }
        async fn subscribe_ready(&self, _kind: EnvelopeKind) -> ReadyStream {
            let polls = Arc::clone(&self.polls);
            Box::pin(futures::stream::repeat_with(move || {
                polls.fetch_add(1, Ordering::SeqCst);
                Err(StoreError::BadState)
            }))
        }
        async fn rescue_stalled(
            &self,
            _attempted_before: DateTime<Utc>,
        ) -> Result<Vec<EnvelopeId>, StoreError> {
            Err(StoreError::BadState)
        }
        async fn query(&self, _query: EnvelopeQuery) -> Result<Vec<Envelope>, StoreError> {
            Err(StoreError::BadState)
        }
    }

    fn worker(store: &InMemoryStore, definition: JobDefinition) -> Worker {
        let registry = Registry::builder()
            .register(definition.clone())
            .unwrap()
            .build()
            .unwrap();
        let dispatcher = Dispatcher::new(Arc::new(store.clone()), Arc::new(registry));
        Worker::new(dispatcher, &definition)
    }

    async fn wait_for_status(store: &InMemoryStore, id: EnvelopeId, status: EnvelopeStatus) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while store.get(id).await.unwrap().status != status {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn processes_ready_envelopes() {
        let store = InMemoryStore::new();
        let handler = Arc::new(ScriptedHandler::always_done());
        let token = CancellationToken::new();
        let handle = worker(
            &store,
            JobDefinition::with_shared_handler(EnvelopeKind::Welcome, handler.clone()),
        )
        .spawn(token.clone());

        let id = store
            .insert(NewEnvelope::mock(EnvelopeKind::Welcome))
            .await
            .unwrap();

        wait_for_status(&store, id, EnvelopeStatus::Succeeded).await;
        assert_eq!(handler.calls(), 1);

        token.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn retries_once_due() {
        let store = InMemoryStore::new();
        let handler = Arc::new(ScriptedHandler::new([
            Step::Transient("mail server down"),
            Step::Transient("mail server down"),
        ]));
        let policy = RetryPolicy::new(
            3,
            vec![TimeDelta::milliseconds(20), TimeDelta::milliseconds(40)],
        )
        .unwrap();
        let token = CancellationToken::new();
        let handle = worker(
            &store,
            JobDefinition::with_shared_handler(EnvelopeKind::Welcome, handler.clone())
                .with_retry_policy(policy),
        )
        .spawn(token.clone());

        let id = store
            .insert(NewEnvelope::mock(EnvelopeKind::Welcome))
            .await
            .unwrap();

        wait_for_status(&store, id, EnvelopeStatus::Succeeded).await;
        let envelope = store.get(id).await.unwrap();
        assert_eq!(envelope.attempt, 3);
        assert_eq!(envelope.errors.len(), 2);
        assert_eq!(handler.calls(), 3);

        token.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn respects_max_concurrency() {
        let store = InMemoryStore::new();
        let handler = Arc::new(ScriptedHandler::always(Step::Sleep(Duration::from_millis(
            100,
        ))));
        let token = CancellationToken::new();
        let handle = worker(
            &store,
            JobDefinition::with_shared_handler(EnvelopeKind::Generic, handler.clone())
                .with_max_concurrency(1),
        )
        .spawn(token.clone());

        let first = store
            .insert(NewEnvelope::mock(EnvelopeKind::Generic))
            .await
            .unwrap();
        let second = store
            .insert(NewEnvelope::mock(EnvelopeKind::Generic))
            .await
            .unwrap();

        wait_for_status(&store, first, EnvelopeStatus::InFlight).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(
            store.get(second).await.unwrap().status,
            EnvelopeStatus::Pending
        );

        wait_for_status(&store, second, EnvelopeStatus::Succeeded).await;
        assert_eq!(handler.calls(), 2);

        token.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_waits_for_attempts_in_flight() {
        let store = InMemoryStore::new();
        let handler = Arc::new(ScriptedHandler::always(Step::Sleep(Duration::from_millis(
            50,
        ))));
        let token = CancellationToken::new();
        let handle = worker(
            &store,
            JobDefinition::with_shared_handler(EnvelopeKind::Generic, handler),
        )
        .spawn(token.clone());

        let id = store
            .insert(NewEnvelope::mock(EnvelopeKind::Generic))
            .await
            .unwrap();
        wait_for_status(&store, id, EnvelopeStatus::InFlight).await;

        token.cancel();
        handle.await.unwrap();

        assert_eq!(
            store.get(id).await.unwrap().status,
            EnvelopeStatus::Succeeded
        );
    }

    #[tokio::test]
    async fn backs_off_when_the_ready_stream_fails() {
        let store = BrokenStore::default();
        let polls = Arc::clone(&store.polls);
        let definition =
            JobDefinition::new(EnvelopeKind::Welcome, ScriptedHandler::always_done());
        let registry = Registry::builder()
            .register(definition.clone())
            .unwrap()
            .build()
            .unwrap();
        let dispatcher = Dispatcher::new(Arc::new(store), Arc::new(registry));
        let token = CancellationToken::new();
        let handle = Worker::new(dispatcher, &definition).spawn(token.clone());

        tokio::time::sleep(Duration::from_millis(100)).await;
        token.cancel();
        tokio::time::timeout(Duration::from_millis(500), handle)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(polls.load(Ordering::SeqCst), 1);
    }
}
