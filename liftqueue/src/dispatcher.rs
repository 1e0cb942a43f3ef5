//! Executes one attempt of an envelope and records the outcome.
//!
//! The [`Dispatcher`] is the only writer of attempt bookkeeping. Every call to
//! [`Dispatcher::execute`] claims the envelope, so the attempt count always grows by exactly one
//! per invocation of the handler.
use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::task::JoinError;
use tracing::{instrument, Instrument};

use crate::{
    definition::{JobDefinition, Registry},
    envelope::{AttemptError, Envelope, EnvelopeId, EnvelopeKind, EnvelopeStatus, Failure},
    handler::{ExecutionError, ExecutionResult},
    retry::RetryDecision,
    store::{EnvelopeStore, StatusUpdate, StoreError},
};

const ERROR_TYPE_PANIC: &str = "panic";
const ERROR_TYPE_TIMEOUT: &str = "timeout";
const ERROR_TYPE_UNKNOWN_KIND: &str = "unknown_kind";

/// The state an envelope was left in by a single attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Succeeded,
    Retrying { next_attempt_at: DateTime<Utc> },
    Failed { failure: Failure },
}

#[derive(Clone)]
pub struct Dispatcher {
    store: Arc<dyn EnvelopeStore>,
    registry: Arc<Registry>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    pub fn new(store: Arc<dyn EnvelopeStore>, registry: Arc<Registry>) -> Self {
        Self { store, registry }
    }

    pub fn store(&self) -> &Arc<dyn EnvelopeStore> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Claim the envelope and run one attempt of it.
    ///
    /// Terminal and in-flight envelopes are rejected without invoking the handler. Handler
    /// failures are never returned as [`Err`]: they are recorded against the envelope and
    /// reported through the returned [`Outcome`].
    #[instrument(skip(self))]
    pub async fn execute(&self, envelope_id: EnvelopeId) -> Result<Outcome, DispatchError> {
        let envelope = self
            .store
            .claim(envelope_id)
            .await
            .inspect_err(|err| {
                tracing::debug!(?err, %envelope_id, "Unable to claim envelope {envelope_id}")
            })?;
        self.run_claimed(envelope).await
    }

    /// Run one attempt of an envelope that has already been claimed, for example by a
    /// [`crate::store::ReadyStream`].
    ///
    /// Envelopes that are not in flight are rejected without invoking the handler.
    #[instrument(
        skip(self, envelope),
        fields(envelope_id = %envelope.id, kind = %envelope.kind, attempt = envelope.attempt)
    )]
    pub(crate) async fn run_claimed(&self, envelope: Envelope) -> Result<Outcome, DispatchError> {
        let envelope_id = envelope.id;
        let kind = envelope.kind;
        let attempt = envelope.attempt;

        match envelope.status {
            EnvelopeStatus::InFlight => {}
            status if status.is_terminal() => {
                return Err(DispatchError::Terminal {
                    id: envelope_id,
                    status,
                })
            }
            _ => return Err(DispatchError::NotClaimed(envelope_id)),
        }

        let Some(definition) = self.registry.get(kind) else {
            tracing::error!(
                %envelope_id,
                %kind,
                "No job definition registered for {kind}, envelope {envelope_id} will be failed"
            );
            let error = AttemptError::new(
                attempt,
                Failure::Permanent,
                ERROR_TYPE_UNKNOWN_KIND,
                format!("No job definition registered for {kind}"),
            );
            self.record(envelope_id, StatusUpdate::failed(attempt, error))
                .await?;
            return Err(DispatchError::UnknownKind {
                id: envelope_id,
                kind,
            });
        };

        tracing::debug!(%envelope_id, %kind, "Executing attempt {attempt} of {envelope_id}");
        match invoke(definition, envelope_id).await {
            Ok(()) => self.handle_success(envelope_id, kind, attempt).await,
            Err(failure) if failure.permanent => {
                tracing::error!(
                    %envelope_id,
                    %kind,
                    ?failure,
                    "Envelope {envelope_id} failed permanently: error type: {}, message: {}",
                    failure.error_type,
                    failure.detail
                );
                let error = failure.into_attempt_error(attempt, Failure::Permanent);
                self.record(envelope_id, StatusUpdate::failed(attempt, error))
                    .await?;
                Ok(Outcome::Failed {
                    failure: Failure::Permanent,
                })
            }
            Err(failure) => {
                self.handle_transient(definition, envelope_id, attempt, failure)
                    .await
            }
        }
    }

    async fn handle_success(
        &self,
        envelope_id: EnvelopeId,
        kind: EnvelopeKind,
        attempt: u16,
    ) -> Result<Outcome, DispatchError> {
        tracing::debug!(%envelope_id, %kind, "Envelope {envelope_id} succeeded");
        self.record(envelope_id, StatusUpdate::succeeded(attempt))
            .await?;
        Ok(Outcome::Succeeded)
    }

    async fn handle_transient(
        &self,
        definition: &JobDefinition,
        envelope_id: EnvelopeId,
        attempt: u16,
        failure: AttemptFailure,
    ) -> Result<Outcome, DispatchError> {
        let kind = definition.kind();
        match definition.retry_policy().decide(attempt) {
            RetryDecision::RetryAfter(delay) => {
                let next_attempt_at = Utc::now() + delay;
                tracing::warn!(
                    %envelope_id,
                    %kind,
                    ?failure,
                    "Envelope {envelope_id} failed and will be retried in {delay}: \
                     error type: {}, message: {}",
                    failure.error_type,
                    failure.detail
                );
                let error = failure.into_attempt_error(attempt, Failure::Transient);
                self.record(
                    envelope_id,
                    StatusUpdate::retrying(attempt, next_attempt_at, error),
                )
                .await?;
                Ok(Outcome::Retrying { next_attempt_at })
            }
            RetryDecision::GiveUp => {
                tracing::error!(
                    %envelope_id,
                    %kind,
                    ?failure,
                    "Envelope {envelope_id} failed on its final attempt {attempt} and will be \
                     discarded: error type: {}, message: {}",
                    failure.error_type,
                    failure.detail
                );
                let error = failure.into_attempt_error(attempt, Failure::Exhausted);
                self.record(envelope_id, StatusUpdate::failed(attempt, error))
                    .await?;
                Ok(Outcome::Failed {
                    failure: Failure::Exhausted,
                })
            }
        }
    }

    async fn record(
        &self,
        envelope_id: EnvelopeId,
        update: StatusUpdate,
    ) -> Result<(), DispatchError> {
        let status = update.status;
        self.store
            .update_status(envelope_id, update)
            .await
            .inspect_err(|err| {
                tracing::error!(
                    ?err,
                    %envelope_id,
                    "Failed to mark envelope {envelope_id} as {status:?}, error: {err:?}",
                )
            })?;
        Ok(())
    }
}

/// Run the handler on its own task so that a panic surfaces as a [`JoinError`].
async fn invoke(
    definition: &JobDefinition,
    envelope_id: EnvelopeId,
) -> Result<(), AttemptFailure> {
    let handler = Arc::clone(definition.handler());
    let timeout = definition.timeout();
    let handle = tokio::spawn(
        async move {
            let fut = handler.process(envelope_id);
            match timeout {
                Some(timeout) => tokio::time::timeout(timeout, fut)
                    .await
                    .map_err(|_elapsed| timeout),
                None => Ok(fut.await),
            }
        }
        .in_current_span(),
    );

    match handle.await {
        Ok(Ok(ExecutionResult::Done)) => Ok(()),
        Ok(Ok(ExecutionResult::Error { error })) => Err(error.into()),
        Ok(Err(timeout)) => Err(timeout.into()),
        Err(error) => Err(error.into()),
    }
}

#[derive(Debug)]
struct AttemptFailure {
    error_type: String,
    detail: String,
    permanent: bool,
}

impl AttemptFailure {
    fn into_attempt_error(self, attempt: u16, failure: Failure) -> AttemptError {
        AttemptError::new(attempt, failure, self.error_type, self.detail)
    }
}

impl From<JoinError> for AttemptFailure {
    fn from(value: JoinError) -> Self {
        let msg = value.to_string();
        let detail = match value.try_into_panic() {
            Ok(panic) => panic
                .downcast_ref::<&str>()
                .map(ToString::to_string)
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or(msg),
            Err(_) => msg,
        };
        Self {
            error_type: ERROR_TYPE_PANIC.to_owned(),
            detail: format!("Handler panicked: {detail}"),
            permanent: false,
        }
    }
}

impl From<Box<dyn ExecutionError>> for AttemptFailure {
    fn from(value: Box<dyn ExecutionError>) -> Self {
        Self {
            error_type: value.error_type().to_owned(),
            detail: value.to_string(),
            permanent: value.is_permanent(),
        }
    }
}

impl From<Duration> for AttemptFailure {
    fn from(value: Duration) -> Self {
        Self {
            error_type: ERROR_TYPE_TIMEOUT.to_owned(),
            detail: format!("Handler failed to complete within timeout: {value:?}"),
            permanent: false,
        }
    }
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Envelope {0} is already in flight")]
    AlreadyInFlight(EnvelopeId),
    #[error("Envelope {id} already reached terminal state {status:?}")]
    Terminal {
        id: EnvelopeId,
        status: EnvelopeStatus,
    },
    #[error("Envelope {0} has not been claimed")]
    NotClaimed(EnvelopeId),
    #[error("No job definition registered for {kind} (envelope {id})")]
    UnknownKind { id: EnvelopeId, kind: EnvelopeKind },
    #[error("Error communicating with the store")]
    Store(#[source] StoreError),
}

impl From<StoreError> for DispatchError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::AlreadyInFlight(id) => Self::AlreadyInFlight(id),
            StoreError::Terminal { id, status } => Self::Terminal { id, status },
            error => Self::Store(error),
        }
    }
}

#[cfg(test)]
mod test {
    use assert_matches::assert_matches;
    use chrono::TimeDelta;

    use super::*;
    use crate::{
        handler::{HandlerError, MockJobHandler},
        retry::RetryPolicy,
        store::{memory::InMemoryStore, NewEnvelope},
        testing::{ScriptedHandler, Step},
    };

    fn dispatcher(
        definitions: impl IntoIterator<Item = JobDefinition>,
    ) -> (InMemoryStore, Dispatcher) {
        let registry = definitions
            .into_iter()
            .try_fold(Registry::builder(), |builder, definition| {
                builder.register(definition)
            })
            .and_then(|builder| builder.build())
            .unwrap();
        let store = InMemoryStore::new();
        let dispatcher = Dispatcher::new(Arc::new(store.clone()), Arc::new(registry));
        (store, dispatcher)
    }

    async fn enqueue(store: &InMemoryStore, kind: EnvelopeKind) -> EnvelopeId {
        store.insert(NewEnvelope::mock(kind)).await.unwrap()
    }

    fn assert_due_in(next_attempt_at: DateTime<Utc>, before: DateTime<Utc>, delay: TimeDelta) {
        assert!(next_attempt_at >= before + delay);
        assert!(next_attempt_at <= Utc::now() + delay);
    }

    #[tokio::test]
    async fn execute_increments_attempt_by_one() {
        let handler = Arc::new(ScriptedHandler::always_done());
        let (store, dispatcher) = dispatcher([JobDefinition::with_shared_handler(
            EnvelopeKind::Generic,
            handler.clone(),
        )]);
        let id = enqueue(&store, EnvelopeKind::Generic).await;

        let before = store.get(id).await.unwrap().attempt;
        let outcome = dispatcher.execute(id).await.unwrap();
        let envelope = store.get(id).await.unwrap();

        assert_eq!(outcome, Outcome::Succeeded);
        assert_eq!(envelope.attempt, before + 1);
        assert_eq!(envelope.status, EnvelopeStatus::Succeeded);
        assert!(envelope.completed_at.is_some());
        assert_eq!(handler.calls(), 1);
    }

    #[tokio::test]
    async fn reference_policy_schedule() {
        let handler = Arc::new(ScriptedHandler::always(Step::Transient("mail server down")));
        let (store, dispatcher) = dispatcher([JobDefinition::with_shared_handler(
            EnvelopeKind::Generic,
            handler.clone(),
        )
        .with_retry_policy(RetryPolicy::reference())]);
        let id = enqueue(&store, EnvelopeKind::Generic).await;

        let before = Utc::now();
        let outcome = dispatcher.execute(id).await.unwrap();
        let next_attempt_at = assert_matches!(
            outcome,
            Outcome::Retrying { next_attempt_at } => next_attempt_at
        );
        assert_due_in(next_attempt_at, before, TimeDelta::seconds(60));
        let envelope = store.get(id).await.unwrap();
        assert_eq!(envelope.status, EnvelopeStatus::Pending);
        assert_eq!(envelope.next_attempt_at, Some(next_attempt_at));

        let before = Utc::now();
        let outcome = dispatcher.execute(id).await.unwrap();
        let next_attempt_at = assert_matches!(
            outcome,
            Outcome::Retrying { next_attempt_at } => next_attempt_at
        );
        assert_due_in(next_attempt_at, before, TimeDelta::seconds(300));

        let outcome = dispatcher.execute(id).await.unwrap();
        assert_eq!(
            outcome,
            Outcome::Failed {
                failure: Failure::Exhausted
            }
        );
        let envelope = store.get(id).await.unwrap();
        assert_eq!(envelope.status, EnvelopeStatus::Failed);
        assert_eq!(envelope.attempt, 3);
        assert_eq!(envelope.next_attempt_at, None);
        assert!(envelope.failed_at.is_some());
        assert_eq!(handler.calls(), 3);
    }

    #[tokio::test]
    async fn terminal_envelopes_are_not_executed() {
        let handler = Arc::new(ScriptedHandler::always_done());
        let (store, dispatcher) = dispatcher([JobDefinition::with_shared_handler(
            EnvelopeKind::Welcome,
            handler.clone(),
        )]);
        let id = enqueue(&store, EnvelopeKind::Welcome).await;
        dispatcher.execute(id).await.unwrap();

        let result = dispatcher.execute(id).await;

        assert_matches!(
            result,
            Err(DispatchError::Terminal { id: terminal, status: EnvelopeStatus::Succeeded })
                if terminal == id
        );
        assert_eq!(store.get(id).await.unwrap().attempt, 1);
        assert_eq!(handler.calls(), 1);
    }

    #[tokio::test]
    async fn permanent_failure_on_first_attempt() {
        let handler = Arc::new(ScriptedHandler::new([Step::Permanent("unknown recipient")]));
        let (store, dispatcher) = dispatcher([JobDefinition::with_shared_handler(
            EnvelopeKind::Invitation,
            handler,
        )]);
        let id = enqueue(&store, EnvelopeKind::Invitation).await;

        let outcome = dispatcher.execute(id).await.unwrap();

        assert_eq!(
            outcome,
            Outcome::Failed {
                failure: Failure::Permanent
            }
        );
        let envelope = store.get(id).await.unwrap();
        assert_eq!(envelope.status, EnvelopeStatus::Failed);
        assert_eq!(envelope.attempt, 1);
        let error = envelope.last_error.unwrap();
        assert_eq!(error.failure, Failure::Permanent);
        assert_eq!(error.detail, "unknown recipient");
    }

    #[tokio::test]
    async fn concurrent_execute_runs_handler_once() {
        let handler = Arc::new(ScriptedHandler::always(Step::Sleep(Duration::from_millis(
            50,
        ))));
        let (store, dispatcher) = dispatcher([JobDefinition::with_shared_handler(
            EnvelopeKind::Generic,
            handler.clone(),
        )]);
        let id = enqueue(&store, EnvelopeKind::Generic).await;

        let (first, second) = tokio::join!(dispatcher.execute(id), dispatcher.execute(id));

        assert_matches!(first, Ok(Outcome::Succeeded));
        assert_matches!(
            second,
            Err(DispatchError::AlreadyInFlight(in_flight)) if in_flight == id
        );
        assert_eq!(handler.calls(), 1);
        assert_eq!(store.get(id).await.unwrap().attempt, 1);
    }

    #[tokio::test]
    async fn welcome_succeeds_on_third_attempt() {
        let handler = Arc::new(ScriptedHandler::new([
            Step::Transient("mail server down"),
            Step::Transient("mail server down"),
            Step::Done,
        ]));
        let (store, dispatcher) = dispatcher([JobDefinition::with_shared_handler(
            EnvelopeKind::Welcome,
            handler.clone(),
        )]);
        let id = enqueue(&store, EnvelopeKind::Welcome).await;

        assert_matches!(dispatcher.execute(id).await, Ok(Outcome::Retrying { .. }));
        assert_matches!(dispatcher.execute(id).await, Ok(Outcome::Retrying { .. }));
        assert_matches!(dispatcher.execute(id).await, Ok(Outcome::Succeeded));

        let envelope = store.get(id).await.unwrap();
        assert_eq!(envelope.status, EnvelopeStatus::Succeeded);
        assert_eq!(envelope.attempt, 3);
        assert_eq!(envelope.last_error, None);
        assert_eq!(envelope.errors.len(), 2);
        assert_eq!(handler.calls(), 3);
    }

    #[tokio::test]
    async fn invitation_exhausts_attempts() {
        let handler = Arc::new(ScriptedHandler::new([
            Step::Transient("timeout talking to mail server"),
            Step::Transient("timeout talking to mail server"),
            Step::Transient("connection reset"),
        ]));
        let (store, dispatcher) = dispatcher([JobDefinition::with_shared_handler(
            EnvelopeKind::Invitation,
            handler,
        )]);
        let id = enqueue(&store, EnvelopeKind::Invitation).await;

        for _ in 0..3 {
            dispatcher.execute(id).await.unwrap();
        }

        let envelope = store.get(id).await.unwrap();
        assert_eq!(envelope.status, EnvelopeStatus::Failed);
        assert_eq!(envelope.attempt, 3);
        let error = envelope.last_error.unwrap();
        assert_eq!(error.failure, Failure::Exhausted);
        assert_eq!(error.attempt, 3);
        assert_eq!(error.detail, "connection reset");
        assert_matches!(
            dispatcher.execute(id).await,
            Err(DispatchError::Terminal { status: EnvelopeStatus::Failed, .. })
        );
    }

    #[tokio::test]
    async fn panicking_handler_is_retried() {
        let (store, dispatcher) = dispatcher([JobDefinition::new(
            EnvelopeKind::Generic,
            ScriptedHandler::new([Step::Panic]),
        )]);
        let id = enqueue(&store, EnvelopeKind::Generic).await;

        let outcome = dispatcher.execute(id).await.unwrap();

        assert_matches!(outcome, Outcome::Retrying { .. });
        let envelope = store.get(id).await.unwrap();
        assert_eq!(envelope.status, EnvelopeStatus::Pending);
        let error = envelope.last_error.unwrap();
        assert_eq!(error.error_type, ERROR_TYPE_PANIC);
        assert_eq!(error.failure, Failure::Transient);

        assert_matches!(dispatcher.execute(id).await, Ok(Outcome::Succeeded));
    }

    #[tokio::test]
    async fn timeout_is_a_transient_failure() {
        let (store, dispatcher) = dispatcher([JobDefinition::new(
            EnvelopeKind::Generic,
            ScriptedHandler::always(Step::Sleep(Duration::from_secs(10))),
        )
        .with_timeout(Duration::from_millis(20))]);
        let id = enqueue(&store, EnvelopeKind::Generic).await;

        let outcome = dispatcher.execute(id).await.unwrap();

        assert_matches!(outcome, Outcome::Retrying { .. });
        let error = store.get(id).await.unwrap().last_error.unwrap();
        assert_eq!(error.error_type, ERROR_TYPE_TIMEOUT);
        assert_eq!(error.failure, Failure::Transient);
    }

    #[tokio::test]
    async fn unknown_kind_fails_envelope() {
        let handler = Arc::new(ScriptedHandler::always_done());
        let (store, dispatcher) = dispatcher([JobDefinition::with_shared_handler(
            EnvelopeKind::Welcome,
            handler.clone(),
        )]);
        let id = enqueue(&store, EnvelopeKind::Generic).await;

        let result = dispatcher.execute(id).await;

        assert_matches!(
            result,
            Err(DispatchError::UnknownKind { kind: EnvelopeKind::Generic, .. })
        );
        let envelope = store.get(id).await.unwrap();
        assert_eq!(envelope.status, EnvelopeStatus::Failed);
        assert_eq!(envelope.last_error.unwrap().error_type, ERROR_TYPE_UNKNOWN_KIND);
        assert_eq!(handler.calls(), 0);
    }

    #[tokio::test]
    async fn unknown_envelope() {
        let (_store, dispatcher) = dispatcher([JobDefinition::new(
            EnvelopeKind::Welcome,
            ScriptedHandler::always_done(),
        )]);

        let result = dispatcher.execute(404.into()).await;

        assert_matches!(result, Err(DispatchError::Store(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn handler_only_receives_the_envelope_id() {
        let (store, _) = dispatcher([JobDefinition::new(
            EnvelopeKind::Invitation,
            ScriptedHandler::always_done(),
        )]);
        let id = enqueue(&store, EnvelopeKind::Invitation).await;

        let mut handler = MockJobHandler::new();
        handler
            .expect_process()
            .withf(move |envelope_id| *envelope_id == id)
            .times(1)
            .returning(|_| HandlerError::permanent("recipient", "unknown recipient").into());
        let registry = Registry::builder()
            .register(JobDefinition::new(EnvelopeKind::Invitation, handler))
            .unwrap()
            .build()
            .unwrap();
        let dispatcher = Dispatcher::new(Arc::new(store.clone()), Arc::new(registry));

        let outcome = dispatcher.execute(id).await.unwrap();

        assert_eq!(
            outcome,
            Outcome::Failed {
                failure: Failure::Permanent
            }
        );
        assert_eq!(
            store.get(id).await.unwrap().last_error.unwrap().error_type,
            "recipient"
        );
    }

    #[tokio::test]
    async fn run_claimed_envelope() {
        let handler = Arc::new(ScriptedHandler::always_done());
        let (store, dispatcher) = dispatcher([JobDefinition::with_shared_handler(
            EnvelopeKind::Welcome,
            handler.clone(),
        )]);
        let id = enqueue(&store, EnvelopeKind::Welcome).await;
        let envelope = store.claim(id).await.unwrap();

        let outcome = dispatcher.run_claimed(envelope).await.unwrap();

        assert_eq!(outcome, Outcome::Succeeded);
        assert_eq!(store.get(id).await.unwrap().attempt, 1);
        assert_eq!(handler.calls(), 1);
    }

    #[tokio::test]
    async fn run_claimed_rejects_envelopes_not_in_flight() {
        let handler = Arc::new(ScriptedHandler::always_done());
        let (store, dispatcher) = dispatcher([JobDefinition::with_shared_handler(
            EnvelopeKind::Welcome,
            handler.clone(),
        )]);
        let succeeded = enqueue(&store, EnvelopeKind::Welcome).await;
        let pending = enqueue(&store, EnvelopeKind::Welcome).await;
        dispatcher.execute(succeeded).await.unwrap();

        let result = dispatcher
            .run_claimed(store.get(succeeded).await.unwrap())
            .await;
        assert_matches!(
            result,
            Err(DispatchError::Terminal {
                status: EnvelopeStatus::Succeeded,
                ..
            })
        );

        let result = dispatcher
            .run_claimed(store.get(pending).await.unwrap())
            .await;
        assert_matches!(result, Err(DispatchError::NotClaimed(id)) if id == pending);

        assert_eq!(handler.calls(), 1);
        let envelope = store.get(pending).await.unwrap();
        assert_eq!(envelope.status, EnvelopeStatus::Pending);
        assert_eq!(envelope.attempt, 0);
    }
}
