//! Test suite for ensuring a correct implementation of an [`EnvelopeStore`].
use std::time::Duration;

use chrono::{TimeDelta, Utc};
use futures::StreamExt;

use super::*;
use crate::envelope::Failure;

impl NewEnvelope {
    pub(crate) fn mock(kind: EnvelopeKind) -> Self {
        Self {
            kind,
            payload: serde_json::json!({ "recipient": "athlete@example.com" }),
            scheduled_at: Utc::now(),
            idempotency_key: None,
        }
    }

    pub(crate) fn with_scheduled_at(self, scheduled_at: DateTime<Utc>) -> Self {
        Self {
            scheduled_at,
            ..self
        }
    }

    pub(crate) fn with_idempotency_key(self, key: u64) -> Self {
        Self {
            idempotency_key: Some(key),
            ..self
        }
    }
}

fn transient_error(attempt: u16) -> AttemptError {
    AttemptError::new(attempt, Failure::Transient, "smtp", "mail server unavailable")
}

macro_rules! assert_status {
    ($store:expr, $id:expr, $status:pat) => {
        let envelope = $store.get($id).await.unwrap();
        assert!(
            matches!(envelope.status, $status),
            "Unexpected status {:?} for {}",
            envelope.status,
            $id
        );
    };
}

/// Create a test suite for an [`EnvelopeStore`] implementation.
///
/// Store implementors should include this as part of their test suite.
///
/// # Example
///
/// ```
/// use liftqueue::store_test_suite;
/// use liftqueue::store::memory::InMemoryStore;
/// store_test_suite!(for: InMemoryStore::new());
/// ```
///
/// A different async test attribute can be used, for example when the store needs a database
/// pool injected by the test harness:
///
/// ```ignore
/// use liftqueue::store_test_suite;
/// store_test_suite!(
///     attr: sqlx::test,
///     args: (pool: PgPool),
///     store: PgEnvelopeStore::from_pool(pool).await.unwrap()
/// );
/// ```
#[macro_export]
macro_rules! store_test_suite {
    (for: $store:expr) => {
        $crate::store_test_suite!(attr: tokio::test, args: (), store: $store);
    };
    (attr: $attr:meta, args: $args:tt, store: $store:expr) => {
        #[$attr]
        async fn insert_assigns_unique_ids $args {
            $crate::store::testing::insert_assigns_unique_ids($store).await;
        }
        #[$attr]
        async fn insert_with_idempotency_key $args {
            $crate::store::testing::insert_with_idempotency_key($store).await;
        }
        #[$attr]
        async fn get_not_found $args {
            $crate::store::testing::get_not_found($store).await;
        }
        #[$attr]
        async fn claim_marks_in_flight $args {
            $crate::store::testing::claim_marks_in_flight($store).await;
        }
        #[$attr]
        async fn claim_rejects_in_flight $args {
            $crate::store::testing::claim_rejects_in_flight($store).await;
        }
        #[$attr]
        async fn claim_rejects_terminal $args {
            $crate::store::testing::claim_rejects_terminal($store).await;
        }
        #[$attr]
        async fn claim_not_found $args {
            $crate::store::testing::claim_not_found($store).await;
        }
        #[$attr]
        async fn update_status_succeeded $args {
            $crate::store::testing::update_status_succeeded($store).await;
        }
        #[$attr]
        async fn update_status_retrying $args {
            $crate::store::testing::update_status_retrying($store).await;
        }
        #[$attr]
        async fn update_status_failed $args {
            $crate::store::testing::update_status_failed($store).await;
        }
        #[$attr]
        async fn update_status_requires_in_flight $args {
            $crate::store::testing::update_status_requires_in_flight($store).await;
        }
        #[$attr]
        async fn update_status_rejects_stale_attempt $args {
            $crate::store::testing::update_status_rejects_stale_attempt($store).await;
        }
        #[$attr]
        async fn subscribe_ready $args {
            $crate::store::testing::subscribe_ready($store).await;
        }
        #[$attr]
        async fn subscribe_ready_insert_wakes_subscriber $args {
            $crate::store::testing::subscribe_ready_insert_wakes_subscriber($store).await;
        }
        #[$attr]
        async fn subscribe_ready_in_due_order $args {
            $crate::store::testing::subscribe_ready_in_due_order($store).await;
        }
        #[$attr]
        async fn subscribe_ready_only_one_stream_receives_envelope $args {
            $crate::store::testing::subscribe_ready_only_one_stream_receives_envelope($store)
                .await;
        }
        #[$attr]
        async fn subscribe_ready_yields_retry_once_due $args {
            $crate::store::testing::subscribe_ready_yields_retry_once_due($store).await;
        }
        #[$attr]
        async fn rescue_stalled $args {
            $crate::store::testing::rescue_stalled($store).await;
        }
        #[$attr]
        async fn query $args {
            $crate::store::testing::query($store).await;
        }
    };
}

pub use store_test_suite;

#[doc(hidden)]
pub async fn insert_assigns_unique_ids(store: impl EnvelopeStore) {
    let id1 = store
        .insert(NewEnvelope::mock(EnvelopeKind::Welcome))
        .await
        .unwrap();
    let id2 = store
        .insert(NewEnvelope::mock(EnvelopeKind::Welcome))
        .await
        .unwrap();

    assert_ne!(id1, id2);
    let envelope = store.get(id1).await.unwrap();
    assert_eq!(envelope.id, id1);
    assert_eq!(envelope.kind, EnvelopeKind::Welcome);
    assert_eq!(envelope.status, EnvelopeStatus::Pending);
    assert_eq!(envelope.attempt, 0);
    assert_eq!(envelope.last_error, None);
    assert!(envelope.next_attempt_at.is_some());
}

#[doc(hidden)]
pub async fn insert_with_idempotency_key(store: impl EnvelopeStore) {
    let id1 = store
        .insert(NewEnvelope::mock(EnvelopeKind::Invitation).with_idempotency_key(7))
        .await
        .unwrap();
    let id2 = store
        .insert(NewEnvelope::mock(EnvelopeKind::Invitation).with_idempotency_key(7))
        .await
        .unwrap();
    let other_kind = store
        .insert(NewEnvelope::mock(EnvelopeKind::Generic).with_idempotency_key(7))
        .await
        .unwrap();
    let other_key = store
        .insert(NewEnvelope::mock(EnvelopeKind::Invitation).with_idempotency_key(8))
        .await
        .unwrap();

    assert_eq!(id1, id2);
    assert_ne!(id1, other_kind);
    assert_ne!(id1, other_key);
    assert_eq!(
        store
            .query(EnvelopeQuery::IdempotencyKeyEqual(7))
            .await
            .unwrap()
            .len(),
        2
    );
}

#[doc(hidden)]
pub async fn get_not_found(store: impl EnvelopeStore) {
    let id = EnvelopeId::from(1_000_000);
    assert!(matches!(store.get(id).await, Err(StoreError::NotFound(not_found)) if not_found == id));
}

#[doc(hidden)]
pub async fn claim_marks_in_flight(store: impl EnvelopeStore) {
    let id = store
        .insert(NewEnvelope::mock(EnvelopeKind::Welcome))
        .await
        .unwrap();

    let claimed = store.claim(id).await.unwrap();

    assert_eq!(claimed.status, EnvelopeStatus::InFlight);
    assert_eq!(claimed.attempt, 1);
    assert!(claimed.attempted_at.is_some());
    assert_eq!(claimed.next_attempt_at, None);
    assert_eq!(store.get(id).await.unwrap(), claimed);
}

#[doc(hidden)]
pub async fn claim_rejects_in_flight(store: impl EnvelopeStore) {
    let id = store
        .insert(NewEnvelope::mock(EnvelopeKind::Welcome))
        .await
        .unwrap();
    store.claim(id).await.unwrap();

    assert!(matches!(
        store.claim(id).await,
        Err(StoreError::AlreadyInFlight(in_flight)) if in_flight == id
    ));
    assert_eq!(store.get(id).await.unwrap().attempt, 1);
}

#[doc(hidden)]
pub async fn claim_rejects_terminal(store: impl EnvelopeStore) {
    let succeeded = store
        .insert(NewEnvelope::mock(EnvelopeKind::Welcome))
        .await
        .unwrap();
    store.claim(succeeded).await.unwrap();
    store
        .update_status(succeeded, StatusUpdate::succeeded(1))
        .await
        .unwrap();

    let failed = store
        .insert(NewEnvelope::mock(EnvelopeKind::Welcome))
        .await
        .unwrap();
    store.claim(failed).await.unwrap();
    store
        .update_status(failed, StatusUpdate::failed(1, transient_error(1)))
        .await
        .unwrap();

    assert!(matches!(
        store.claim(succeeded).await,
        Err(StoreError::Terminal {
            status: EnvelopeStatus::Succeeded,
            ..
        })
    ));
    assert!(matches!(
        store.claim(failed).await,
        Err(StoreError::Terminal {
            status: EnvelopeStatus::Failed,
            ..
        })
    ));
    assert_eq!(store.get(succeeded).await.unwrap().attempt, 1);
    assert_eq!(store.get(failed).await.unwrap().attempt, 1);
}

#[doc(hidden)]
pub async fn claim_not_found(store: impl EnvelopeStore) {
    assert!(matches!(
        store.claim(EnvelopeId::from(1_000_000)).await,
        Err(StoreError::NotFound(_))
    ));
}

#[doc(hidden)]
pub async fn update_status_succeeded(store: impl EnvelopeStore) {
    let id = store
        .insert(NewEnvelope::mock(EnvelopeKind::Welcome))
        .await
        .unwrap();
    store.claim(id).await.unwrap();
    store
        .update_status(
            id,
            StatusUpdate::retrying(1, Utc::now(), transient_error(1)),
        )
        .await
        .unwrap();
    store.claim(id).await.unwrap();

    store
        .update_status(id, StatusUpdate::succeeded(2))
        .await
        .unwrap();

    let envelope = store.get(id).await.unwrap();
    assert_eq!(envelope.status, EnvelopeStatus::Succeeded);
    assert_eq!(envelope.attempt, 2);
    assert_eq!(envelope.last_error, None);
    assert_eq!(envelope.errors.len(), 1);
    assert_eq!(envelope.next_attempt_at, None);
    assert!(envelope.completed_at.is_some());
}

#[doc(hidden)]
pub async fn update_status_retrying(store: impl EnvelopeStore) {
    let id = store
        .insert(NewEnvelope::mock(EnvelopeKind::Welcome))
        .await
        .unwrap();
    store.claim(id).await.unwrap();
    let next_attempt_at = Utc::now() + TimeDelta::seconds(60);
    let error = transient_error(1);

    store
        .update_status(
            id,
            StatusUpdate::retrying(1, next_attempt_at, error.clone()),
        )
        .await
        .unwrap();

    let envelope = store.get(id).await.unwrap();
    assert_eq!(envelope.status, EnvelopeStatus::Pending);
    assert_eq!(envelope.attempt, 1);
    assert_eq!(envelope.next_attempt_at, Some(next_attempt_at));
    assert_eq!(envelope.last_error, Some(error.clone()));
    assert_eq!(envelope.errors, vec![error]);
}

#[doc(hidden)]
pub async fn update_status_failed(store: impl EnvelopeStore) {
    let id = store
        .insert(NewEnvelope::mock(EnvelopeKind::Generic))
        .await
        .unwrap();
    store.claim(id).await.unwrap();
    let error = AttemptError::new(1, Failure::Permanent, "recipient", "unknown recipient");

    store
        .update_status(id, StatusUpdate::failed(1, error.clone()))
        .await
        .unwrap();

    assert_status!(store, id, EnvelopeStatus::Failed);
    let envelope = store.get(id).await.unwrap();
    assert_eq!(envelope.last_error, Some(error));
    assert_eq!(envelope.next_attempt_at, None);
    assert!(envelope.failed_at.is_some());
}

#[doc(hidden)]
pub async fn update_status_requires_in_flight(store: impl EnvelopeStore) {
    let id = store
        .insert(NewEnvelope::mock(EnvelopeKind::Welcome))
        .await
        .unwrap();

    assert!(matches!(
        store.update_status(id, StatusUpdate::succeeded(0)).await,
        Err(StoreError::NotInFlight(_))
    ));
    store.claim(id).await.unwrap();
    assert!(matches!(
        store
            .update_status(
                id,
                StatusUpdate {
                    status: EnvelopeStatus::InFlight,
                    attempt: 1,
                    last_error: None,
                    next_attempt_at: None,
                }
            )
            .await,
        Err(StoreError::InvalidTransition { .. })
    ));
    assert!(matches!(
        store
            .update_status(EnvelopeId::from(1_000_000), StatusUpdate::succeeded(1))
            .await,
        Err(StoreError::NotFound(_))
    ));
    assert_status!(store, id, EnvelopeStatus::InFlight);
}

#[doc(hidden)]
pub async fn update_status_rejects_stale_attempt(store: impl EnvelopeStore) {
    let id = store
        .insert(NewEnvelope::mock(EnvelopeKind::Welcome))
        .await
        .unwrap();
    store.claim(id).await.unwrap();

    assert!(matches!(
        store.update_status(id, StatusUpdate::succeeded(2)).await,
        Err(StoreError::StaleUpdate {
            expected: 1,
            found: 2,
            ..
        })
    ));
    assert_status!(store, id, EnvelopeStatus::InFlight);
}

#[doc(hidden)]
pub async fn subscribe_ready(store: impl EnvelopeStore) {
    let mut stream = store.subscribe_ready(EnvelopeKind::Welcome).await;
    store
        .insert(NewEnvelope::mock(EnvelopeKind::Invitation))
        .await
        .unwrap();
    let id = store
        .insert(NewEnvelope::mock(EnvelopeKind::Welcome))
        .await
        .unwrap();

    let envelope = stream.next().await.unwrap().unwrap();
    assert_eq!(envelope.id, id);
    assert_eq!(envelope.kind, EnvelopeKind::Welcome);
    assert_eq!(envelope.status, EnvelopeStatus::InFlight);
    assert_eq!(envelope.attempt, 1);
    assert_status!(store, id, EnvelopeStatus::InFlight);
}

#[doc(hidden)]
pub async fn subscribe_ready_insert_wakes_subscriber(store: impl EnvelopeStore) {
    let mut stream = store.subscribe_ready(EnvelopeKind::Welcome).await;
    let handle = tokio::spawn(async move {
        match tokio::time::timeout(Duration::from_secs(2), stream.next()).await {
            Ok(Some(Ok(envelope))) => assert_eq!(envelope.kind, EnvelopeKind::Welcome),
            Err(_) => panic!("Didn't get woken by insert of a new envelope"),
            _ => panic!("Bad things happened"),
        }
    });
    tokio::task::yield_now().await;
    store
        .insert(NewEnvelope::mock(EnvelopeKind::Invitation))
        .await
        .unwrap();
    store
        .insert(NewEnvelope::mock(EnvelopeKind::Welcome))
        .await
        .unwrap();
    handle.await.unwrap();
}

#[doc(hidden)]
pub async fn subscribe_ready_in_due_order(store: impl EnvelopeStore) {
    let now = Utc::now();
    let mut stream = store.subscribe_ready(EnvelopeKind::Generic).await;
    let later = store
        .insert(
            NewEnvelope::mock(EnvelopeKind::Generic)
                .with_scheduled_at(now + TimeDelta::milliseconds(300)),
        )
        .await
        .unwrap();
    let earliest = store
        .insert(
            NewEnvelope::mock(EnvelopeKind::Generic).with_scheduled_at(now - TimeDelta::seconds(5)),
        )
        .await
        .unwrap();
    let earlier = store
        .insert(
            NewEnvelope::mock(EnvelopeKind::Generic).with_scheduled_at(now - TimeDelta::seconds(1)),
        )
        .await
        .unwrap();

    let ids = [
        stream.next().await.unwrap().unwrap().id,
        stream.next().await.unwrap().unwrap().id,
        stream.next().await.unwrap().unwrap().id,
    ];
    assert_eq!(ids, [earliest, earlier, later]);
}

#[doc(hidden)]
pub async fn subscribe_ready_only_one_stream_receives_envelope(store: impl EnvelopeStore) {
    let mut stream1 = store.subscribe_ready(EnvelopeKind::Welcome).await;
    let mut stream2 = store.subscribe_ready(EnvelopeKind::Welcome).await;
    let id1 = store
        .insert(NewEnvelope::mock(EnvelopeKind::Welcome))
        .await
        .unwrap();
    let id2 = store
        .insert(NewEnvelope::mock(EnvelopeKind::Welcome))
        .await
        .unwrap();

    let ids: std::collections::HashSet<_> =
        futures::future::join_all([stream1.next(), stream2.next()])
            .await
            .into_iter()
            .map(|res| res.unwrap().unwrap().id)
            .collect();
    let expected = [id1, id2].into_iter().collect();
    assert_eq!(ids, expected);
}

#[doc(hidden)]
pub async fn subscribe_ready_yields_retry_once_due(store: impl EnvelopeStore) {
    let mut stream = store.subscribe_ready(EnvelopeKind::Invitation).await;
    let id = store
        .insert(NewEnvelope::mock(EnvelopeKind::Invitation))
        .await
        .unwrap();
    let first = stream.next().await.unwrap().unwrap();
    assert_eq!(first.id, id);

    let next_attempt_at = Utc::now() + TimeDelta::milliseconds(200);
    store
        .update_status(
            id,
            StatusUpdate::retrying(1, next_attempt_at, transient_error(1)),
        )
        .await
        .unwrap();

    let second = tokio::time::timeout(Duration::from_secs(2), stream.next())
        .await
        .expect("retry was never yielded")
        .unwrap()
        .unwrap();
    assert_eq!(second.id, id);
    assert_eq!(second.attempt, 2);
    assert!(Utc::now() + TimeDelta::milliseconds(20) >= next_attempt_at);
}

#[doc(hidden)]
pub async fn rescue_stalled(store: impl EnvelopeStore) {
    let stalled = store
        .insert(NewEnvelope::mock(EnvelopeKind::Welcome))
        .await
        .unwrap();
    let pending = store
        .insert(NewEnvelope::mock(EnvelopeKind::Welcome))
        .await
        .unwrap();
    store.claim(stalled).await.unwrap();

    let rescued = store
        .rescue_stalled(Utc::now() - TimeDelta::hours(1))
        .await
        .unwrap();
    assert!(rescued.is_empty());

    let rescued = store
        .rescue_stalled(Utc::now() + TimeDelta::seconds(1))
        .await
        .unwrap();
    assert_eq!(rescued, vec![stalled]);

    let envelope = store.get(stalled).await.unwrap();
    assert_eq!(envelope.status, EnvelopeStatus::Pending);
    assert_eq!(envelope.attempt, 1);
    assert!(envelope.next_attempt_at.is_some());
    assert_status!(store, pending, EnvelopeStatus::Pending);

    let reclaimed = store.claim(stalled).await.unwrap();
    assert_eq!(reclaimed.attempt, 2);
}

#[doc(hidden)]
pub async fn query(store: impl EnvelopeStore) {
    let welcome = store
        .insert(NewEnvelope::mock(EnvelopeKind::Welcome))
        .await
        .unwrap();
    let invitation = store
        .insert(NewEnvelope::mock(EnvelopeKind::Invitation))
        .await
        .unwrap();
    store.claim(invitation).await.unwrap();

    let ids = |envelopes: Vec<Envelope>| envelopes.into_iter().map(|e| e.id).collect::<Vec<_>>();

    assert_eq!(
        ids(store.query(EnvelopeQuery::all()).await.unwrap()).len(),
        2
    );
    assert_eq!(
        ids(store
            .query(EnvelopeQuery::KindEqual(EnvelopeKind::Welcome))
            .await
            .unwrap()),
        vec![welcome]
    );
    assert_eq!(
        ids(store
            .query(EnvelopeQuery::StatusEqual(EnvelopeStatus::InFlight))
            .await
            .unwrap()),
        vec![invitation]
    );
    assert_eq!(
        ids(store
            .query(EnvelopeQuery::And(vec![
                EnvelopeQuery::KindEqual(EnvelopeKind::Welcome),
                EnvelopeQuery::StatusEqual(EnvelopeStatus::InFlight),
            ]))
            .await
            .unwrap()),
        Vec::<EnvelopeId>::new()
    );
    assert_eq!(
        ids(store
            .query(EnvelopeQuery::IdEquals(invitation))
            .await
            .unwrap()),
        vec![invitation]
    );
}
