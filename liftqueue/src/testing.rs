//! Helpers for testing code built on liftqueue.
use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;

use crate::{
    envelope::EnvelopeId,
    handler::{ExecutionResult, HandlerError, JobHandler},
};

const ERROR_TYPE_SCRIPTED: &str = "scripted";

/// What a [`ScriptedHandler`] does on one invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    Done,
    Transient(&'static str),
    Permanent(&'static str),
    Panic,
    /// Sleep for the given duration and then succeed.
    Sleep(Duration),
}

/// A [`JobHandler`] that plays back a fixed sequence of [`Step`]s.
///
/// Once the script is exhausted every further invocation performs the fallback step, which
/// defaults to [`Step::Done`].
///
/// # Example
///
/// ```
/// # use liftqueue::prelude::*;
/// # use liftqueue::testing::{ScriptedHandler, Step};
/// # tokio::runtime::Builder::new_current_thread().enable_time().build().unwrap().block_on(async {
/// let handler = ScriptedHandler::new([Step::Transient("mail server down")]);
///
/// assert!(matches!(handler.process(1.into()).await, ExecutionResult::Error { .. }));
/// assert!(matches!(handler.process(1.into()).await, ExecutionResult::Done));
/// assert_eq!(handler.calls(), 2);
/// # });
/// ```
#[derive(Debug)]
pub struct ScriptedHandler {
    steps: Mutex<VecDeque<Step>>,
    fallback: Step,
    calls: AtomicUsize,
}

impl ScriptedHandler {
    pub fn new(steps: impl IntoIterator<Item = Step>) -> Self {
        Self {
            steps: Mutex::new(steps.into_iter().collect()),
            fallback: Step::Done,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn always(step: Step) -> Self {
        Self::new([]).with_fallback(step)
    }

    pub fn always_done() -> Self {
        Self::always(Step::Done)
    }

    pub fn with_fallback(self, fallback: Step) -> Self {
        Self { fallback, ..self }
    }

    /// How many times the handler has been invoked.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn next_step(&self) -> Step {
        self.steps
            .lock()
            .ok()
            .and_then(|mut steps| steps.pop_front())
            .unwrap_or_else(|| self.fallback.clone())
    }
}

#[async_trait]
impl JobHandler for ScriptedHandler {
    async fn process(&self, envelope_id: EnvelopeId) -> ExecutionResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.next_step() {
            Step::Done => ExecutionResult::Done,
            Step::Transient(detail) => HandlerError::transient(ERROR_TYPE_SCRIPTED, detail).into(),
            Step::Permanent(detail) => HandlerError::permanent(ERROR_TYPE_SCRIPTED, detail).into(),
            Step::Panic => panic!("Scripted panic while processing {envelope_id}"),
            Step::Sleep(duration) => {
                tokio::time::sleep(duration).await;
                ExecutionResult::Done
            }
        }
    }
}

/// A macro for making assertions about the envelopes held by a store.
///
/// Assertions can be based on kind, status, idempotency key and due time.
///
/// # Example
///
/// ```
/// # use liftqueue::prelude::*;
/// # use liftqueue::assert_envelopes;
/// # use chrono::{TimeDelta, Utc};
/// # tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(async {
/// use liftqueue::store::memory::InMemoryStore;
/// let store = InMemoryStore::new().paused();
///
/// EnvelopeBuilder::new(EnvelopeKind::Welcome)
///     .schedule_in(TimeDelta::minutes(5))
///     .enqueue_to(&store)
///     .await
///     .unwrap();
///
/// assert_envelopes!(
///     store: store,
///     of_kind: EnvelopeKind::Welcome,
///     with_status: EnvelopeStatus::Pending,
///     due_before: Utc::now() + TimeDelta::hours(1),
/// );
///
/// assert_envelopes!(
///     0 envelopes,
///     store: store,
///     of_kind: EnvelopeKind::Invitation
/// );
/// # });
/// ```
#[macro_export]
macro_rules! assert_envelopes {
    (@internal $n:literal, $store:expr, $($tail:tt)*) => {{
        use $crate::store::EnvelopeStore as _;
        let mut queries = Vec::new();
        $crate::assert_envelopes!(@query queries; $($tail)*);
        let envelopes = $store
            .query($crate::store::EnvelopeQuery::And(queries))
            .await
            .unwrap();
        let all_envelopes = $store
            .query($crate::store::EnvelopeQuery::all())
            .await
            .unwrap();
        assert!(
            envelopes.len() == $n,
            "Unexpected number of envelopes matching {},\n\n\
            Expected {} envelopes, found {}:\n\n\
            Matching envelopes:\n\
            {envelopes:#?}\n\n\
            All envelopes:\n\
            {all_envelopes:#?}",
            stringify!($($tail)*),
            $n,
            envelopes.len(),
        );
    }};
    (@query $vec:ident;) => {};
    (@query $vec:ident; of_kind: $kind:expr $(, $($tail:tt)*)?) => {
        $vec.push($crate::store::EnvelopeQuery::KindEqual($kind));
        $($crate::assert_envelopes!(@query $vec; $($tail)*);)?
    };
    (@query $vec:ident; with_status: $status:expr $(, $($tail:tt)*)?) => {
        $vec.push($crate::store::EnvelopeQuery::StatusEqual($status));
        $($crate::assert_envelopes!(@query $vec; $($tail)*);)?
    };
    (@query $vec:ident; with_idempotency_key: $key:expr $(, $($tail:tt)*)?) => {
        $vec.push($crate::store::EnvelopeQuery::IdempotencyKeyEqual($key));
        $($crate::assert_envelopes!(@query $vec; $($tail)*);)?
    };
    (@query $vec:ident; due_before: $due_before:expr $(, $($tail:tt)*)?) => {
        $vec.push($crate::store::EnvelopeQuery::DueBefore($due_before));
        $($crate::assert_envelopes!(@query $vec; $($tail)*);)?
    };
    (1 envelope, store: $store:expr, $($tail:tt)*) => {
        $crate::assert_envelopes!(@internal 1, $store, $($tail)*)
    };
    ($n:literal envelopes, store: $store:expr, $($tail:tt)*) => {
        $crate::assert_envelopes!(@internal $n, $store, $($tail)*)
    };
    (store: $store:expr, $($tail:tt)*) => {
        $crate::assert_envelopes!(@internal 1, $store, $($tail)*)
    };
}

pub use assert_envelopes;
