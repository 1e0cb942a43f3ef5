//! A durable background job pipeline for transactional notifications.
//!
//! Business actions (a user registering, a user inviting a training partner) persist an
//! [`Envelope`] describing the work to be done. Workers pick up envelopes as they become due and
//! hand them to the [`JobHandler`] bound to their [`EnvelopeKind`]. Transient failures are
//! retried according to a table driven [`RetryPolicy`], permanent failures fail the envelope
//! straight away, and every attempt is recorded against the envelope.
//!
//! # Example
//!
//! ```
//! use liftqueue::prelude::*;
//! use liftqueue::store::memory::InMemoryStore;
//!
//! struct SendWelcomeEmail;
//!
//! #[async_trait::async_trait]
//! impl JobHandler for SendWelcomeEmail {
//!     async fn process(&self, envelope_id: EnvelopeId) -> ExecutionResult {
//!         println!("Sending welcome email for {envelope_id}");
//!         ExecutionResult::Done
//!     }
//! }
//!
//! # tokio::runtime::Builder::new_multi_thread().enable_all().build().unwrap().block_on(async {
//! let store = InMemoryStore::new();
//! let registry = Registry::builder()
//!     .register(JobDefinition::new(EnvelopeKind::Welcome, SendWelcomeEmail))
//!     .unwrap()
//!     .build()
//!     .unwrap();
//!
//! let queue = LiftQueue::new(store.clone(), registry).start();
//!
//! let id = EnvelopeBuilder::new(EnvelopeKind::Welcome)
//!     .with_payload(serde_json::json!({ "user_id": 7 }))
//!     .enqueue_to(&store)
//!     .await
//!     .unwrap();
//!
//! while store.get(id).await.unwrap().status != EnvelopeStatus::Succeeded {
//!     tokio::time::sleep(std::time::Duration::from_millis(5)).await;
//! }
//!
//! queue.graceful_shutdown().await.unwrap();
//! # });
//! ```
//!
//! [`Envelope`]: envelope::Envelope
//! [`JobHandler`]: handler::JobHandler
//! [`EnvelopeKind`]: envelope::EnvelopeKind
//! [`RetryPolicy`]: retry::RetryPolicy
use std::sync::Arc;

use definition::{Registry, RegistryError};
use dispatcher::{DispatchError, Dispatcher};
use envelope::EnvelopeId;
use rescuer::{
    runner::{kinds_outliving_stall, RescuerRunner},
    RescuerConfig,
};
use retry::PolicyError;
use store::{EnvelopeStore, NewEnvelope, StoreError};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use worker::Worker;

pub mod definition;
pub mod dispatcher;
pub mod envelope;
pub mod handler;
pub mod prelude;
pub mod rescuer;
pub mod retry;
pub mod store;
pub mod testing;
mod worker;

/// The worker pool: one worker loop per registered [`envelope::EnvelopeKind`].
pub struct LiftQueue {
    dispatcher: Dispatcher,
    cancellation_token: CancellationToken,
    handles: Vec<JoinHandle<()>>,
    started: bool,
}

impl std::fmt::Debug for LiftQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiftQueue")
            .field("dispatcher", &self.dispatcher)
            .field("tasks", &self.handles.len())
            .field("started", &self.started)
            .finish()
    }
}

impl LiftQueue {
    pub fn new(store: impl EnvelopeStore + 'static, registry: Registry) -> Self {
        Self::from_shared(Arc::new(store), Arc::new(registry))
    }

    pub fn from_shared(store: Arc<dyn EnvelopeStore>, registry: Arc<Registry>) -> Self {
        Self {
            dispatcher: Dispatcher::new(store, registry),
            cancellation_token: CancellationToken::new(),
            handles: Vec::new(),
            started: false,
        }
    }

    pub fn store(&self) -> &Arc<dyn EnvelopeStore> {
        self.dispatcher.store()
    }

    pub fn registry(&self) -> &Arc<Registry> {
        self.dispatcher.registry()
    }

    /// The dispatcher shared by all worker loops, for executing envelopes explicitly.
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Spawn one worker loop per registered kind.
    ///
    /// Calling this more than once has no further effect.
    pub fn start(mut self) -> Self {
        if self.started {
            tracing::warn!("LiftQueue workers already started");
            return self;
        }
        for definition in self.dispatcher.registry().definitions() {
            let kind = definition.kind();
            tracing::debug!(%kind, "Starting liftqueue worker for {kind}");
            let handle = Worker::new(self.dispatcher.clone(), definition)
                .spawn(self.cancellation_token.clone());
            self.handles.push(handle);
        }
        self.started = true;
        self
    }

    /// Periodically return envelopes stalled in flight to pending.
    ///
    /// An attempt still running after [`RescuerConfig::stall_after`] is handed out again, so give
    /// every definition a timeout shorter than the stall threshold. Kinds without one are logged
    /// at `warn`.
    pub fn with_rescuer(mut self, config: RescuerConfig) -> Self {
        let stall_after = config.stall_after();
        for kind in kinds_outliving_stall(self.registry(), stall_after) {
            tracing::warn!(
                %kind,
                "Attempts of {kind} are not bounded by a timeout shorter than the rescuer stall \
                 threshold of {stall_after} and may be delivered twice"
            );
        }
        let handle = RescuerRunner::new(
            Arc::clone(self.store()),
            Arc::clone(self.registry()),
            config,
        )
        .spawn(self.cancellation_token.clone());
        self.handles.push(handle);
        self
    }

    pub async fn enqueue(&self, envelope: NewEnvelope) -> Result<EnvelopeId, LiftQueueError> {
        let kind = envelope.kind;
        let id = self.store().insert(envelope).await?;
        tracing::debug!(envelope_id = %id, %kind, "Enqueued {kind} envelope {id}");
        Ok(id)
    }

    /// Stop claiming envelopes and wait for every attempt in flight to finish.
    pub async fn graceful_shutdown(self) -> Result<(), LiftQueueError> {
        tracing::debug!("Shutting down liftqueue tasks");
        self.cancellation_token.cancel();
        futures::future::join_all(self.handles)
            .await
            .into_iter()
            .try_for_each(|result| {
                result.map_err(|err| {
                    tracing::error!(?err, "Liftqueue task failed during shutdown: {err}");
                    LiftQueueError::GracefulShutdownFailed
                })
            })
    }
}

#[derive(Debug, Error)]
pub enum LiftQueueError {
    #[error("Failed to gracefully shut down")]
    GracefulShutdownFailed,
    #[error("Error communicating with the store")]
    Store(#[from] StoreError),
    #[error("Error dispatching envelope")]
    Dispatch(#[from] DispatchError),
    #[error("Invalid job registry")]
    Registry(#[from] RegistryError),
    #[error("Invalid retry policy")]
    Policy(#[from] PolicyError),
    #[error("Error encoding or decoding value")]
    EncodeError(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use std::{str::FromStr, time::Duration};

    use assert_matches::assert_matches;
    use chrono::TimeDelta;

    use super::*;
    use crate::{
        definition::JobDefinition,
        envelope::{builder::EnvelopeBuilder, EnvelopeKind, EnvelopeStatus, Failure},
        retry::RetryPolicy,
        store::memory::InMemoryStore,
        testing::{ScriptedHandler, Step},
    };

    fn short_policy() -> RetryPolicy {
        RetryPolicy::new(
            3,
            vec![TimeDelta::milliseconds(10), TimeDelta::milliseconds(20)],
        )
        .unwrap()
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
    async fn graceful_shutdown_without_start() {
        let registry = Registry::builder()
            .register(JobDefinition::new(
                EnvelopeKind::Generic,
                ScriptedHandler::always_done(),
            ))
            .unwrap()
            .build()
            .unwrap();

        LiftQueue::new(InMemoryStore::new(), registry)
            .graceful_shutdown()
            .await
            .unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn drives_envelopes_through_retries() {
        let store = InMemoryStore::new();
        let welcome = Arc::new(ScriptedHandler::new([
            Step::Transient("mail server down"),
            Step::Transient("mail server down"),
            Step::Done,
        ]));
        let invitation = Arc::new(ScriptedHandler::always(Step::Transient("connection reset")));
        let registry = Registry::builder()
            .register(
                JobDefinition::with_shared_handler(EnvelopeKind::Welcome, welcome.clone())
                    .with_retry_policy(short_policy()),
            )
            .unwrap()
            .register(
                JobDefinition::with_shared_handler(EnvelopeKind::Invitation, invitation.clone())
                    .with_retry_policy(short_policy())
                    .with_max_concurrency(2),
            )
            .unwrap()
            .build()
            .unwrap();
        let queue = LiftQueue::new(store.clone(), registry).start();

        let e1 = EnvelopeBuilder::new(EnvelopeKind::Welcome)
            .with_payload(serde_json::json!({ "user_id": 1 }))
            .enqueue_to(&store)
            .await
            .unwrap();
        let e2 = queue
            .enqueue(
                EnvelopeBuilder::new(EnvelopeKind::Invitation)
                    .with_payload(serde_json::json!({ "from": 1, "to": 2 }))
                    .build()
                    .unwrap(),
            )
            .await
            .unwrap();

        wait_for_status(&store, e1, EnvelopeStatus::Succeeded).await;
        wait_for_status(&store, e2, EnvelopeStatus::Failed).await;
        queue.graceful_shutdown().await.unwrap();

        let e1 = store.get(e1).await.unwrap();
        assert_eq!(e1.attempt, 3);
        assert_eq!(e1.last_error, None);
        assert_eq!(welcome.calls(), 3);

        let e2 = store.get(e2).await.unwrap();
        assert_eq!(e2.attempt, 3);
        let error = e2.last_error.unwrap();
        assert_eq!(error.failure, Failure::Exhausted);
        assert_eq!(error.detail, "connection reset");
        assert_eq!(invitation.calls(), 3);
    }

    #[tokio::test]
    async fn explicit_execute_through_dispatcher() {
        let store = InMemoryStore::new().paused();
        let registry = Registry::builder()
            .register(JobDefinition::new(
                EnvelopeKind::Generic,
                ScriptedHandler::new([Step::Permanent("template missing")]),
            ))
            .unwrap()
            .build()
            .unwrap();
        let queue = LiftQueue::new(store.clone(), registry);
        let id = EnvelopeBuilder::new(EnvelopeKind::Generic)
            .enqueue_to(queue.store().as_ref())
            .await
            .unwrap();

        let outcome = queue.dispatcher().execute(id).await;

        assert_matches!(
            outcome,
            Ok(dispatcher::Outcome::Failed {
                failure: Failure::Permanent
            })
        );
        let result = queue
            .dispatcher()
            .execute(id)
            .await
            .map_err(LiftQueueError::from);
        assert_matches!(
            result,
            Err(LiftQueueError::Dispatch(DispatchError::Terminal { .. }))
        );
    }

    #[tokio::test]
    async fn rescuer_recovers_stalled_envelopes() {
        let store = InMemoryStore::new();
        let handler = Arc::new(ScriptedHandler::always_done());
        let registry = Registry::builder()
            .register(JobDefinition::with_shared_handler(
                EnvelopeKind::Welcome,
                handler.clone(),
            ))
            .unwrap()
            .build()
            .unwrap();
        let id = store
            .insert(NewEnvelope {
                kind: EnvelopeKind::Welcome,
                payload: serde_json::Value::Null,
                scheduled_at: chrono::Utc::now() + TimeDelta::hours(1),
                idempotency_key: None,
            })
            .await
            .unwrap();
        // Simulates a process that died mid attempt.
        store.claim(id).await.unwrap();

        let queue = LiftQueue::new(store.clone(), registry)
            .start()
            .with_rescuer(
                RescuerConfig::new(cron::Schedule::from_str("* * * * * *").unwrap())
                    .with_stall_after(TimeDelta::zero()),
            );

        wait_for_status(&store, id, EnvelopeStatus::Succeeded).await;
        queue.graceful_shutdown().await.unwrap();

        assert_eq!(store.get(id).await.unwrap().attempt, 2);
        assert_eq!(handler.calls(), 1);
    }
}
