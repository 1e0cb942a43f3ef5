//! Job definitions and the registry that binds each [`EnvelopeKind`] to one of them.
//!
//! The registry is populated once at start up and is read only afterwards.
//!
//! # Example
//!
//! ```
//! # use liftqueue::prelude::*;
//! # use std::time::Duration;
//! # struct SendWelcomeEmail;
//! # #[async_trait::async_trait]
//! # impl JobHandler for SendWelcomeEmail {
//! #     async fn process(&self, _envelope_id: EnvelopeId) -> ExecutionResult {
//! #         ExecutionResult::Done
//! #     }
//! # }
//! let registry = Registry::builder()
//!     .register(
//!         JobDefinition::new(EnvelopeKind::Welcome, SendWelcomeEmail)
//!             .with_retry_policy(RetryPolicy::reference())
//!             .with_timeout(Duration::from_secs(30))
//!             .with_max_concurrency(4),
//!     )
//!     .unwrap()
//!     .build()
//!     .unwrap();
//!
//! assert!(registry.get(EnvelopeKind::Welcome).is_some());
//! assert!(registry.get(EnvelopeKind::Invitation).is_none());
//! ```
use std::{sync::Arc, time::Duration};

use fxhash::FxHashMap;
use thiserror::Error;

use crate::{envelope::EnvelopeKind, handler::JobHandler, retry::RetryPolicy};

/// A retryable unit of work bound to exactly one [`JobHandler`].
#[derive(Clone)]
pub struct JobDefinition {
    kind: EnvelopeKind,
    handler: Arc<dyn JobHandler>,
    retry_policy: RetryPolicy,
    timeout: Option<Duration>,
    max_concurrency: Option<usize>,
}

impl std::fmt::Debug for JobDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobDefinition")
            .field("kind", &self.kind)
            .field("retry_policy", &self.retry_policy)
            .field("timeout", &self.timeout)
            .field("max_concurrency", &self.max_concurrency)
            .finish_non_exhaustive()
    }
}

impl JobDefinition {
    /// Creates a definition with the reference [`RetryPolicy`], no timeout and no concurrency
    /// limit.
    pub fn new(kind: EnvelopeKind, handler: impl JobHandler + 'static) -> Self {
        Self::with_shared_handler(kind, Arc::new(handler))
    }

    pub fn with_shared_handler(kind: EnvelopeKind, handler: Arc<dyn JobHandler>) -> Self {
        Self {
            kind,
            handler,
            retry_policy: RetryPolicy::default(),
            timeout: None,
            max_concurrency: None,
        }
    }

    pub fn with_retry_policy(self, retry_policy: RetryPolicy) -> Self {
        Self {
            retry_policy,
            ..self
        }
    }

    /// Bound every handler invocation. An attempt exceeding the timeout counts as a transient
    /// failure.
    pub fn with_timeout(self, timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            ..self
        }
    }

    /// Limit how many envelopes of this kind the worker pool executes at once.
    pub fn with_max_concurrency(self, max_concurrency: usize) -> Self {
        Self {
            max_concurrency: Some(max_concurrency),
            ..self
        }
    }

    pub fn kind(&self) -> EnvelopeKind {
        self.kind
    }

    pub fn handler(&self) -> &Arc<dyn JobHandler> {
        &self.handler
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry_policy
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn max_concurrency(&self) -> Option<usize> {
        self.max_concurrency
    }
}

/// Maps every registered [`EnvelopeKind`] to its [`JobDefinition`].
#[derive(Debug, Default)]
pub struct Registry {
    definitions: FxHashMap<EnvelopeKind, JobDefinition>,
}

impl Registry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    pub fn get(&self, kind: EnvelopeKind) -> Option<&JobDefinition> {
        self.definitions.get(&kind)
    }

    /// The registered kinds in declaration order of [`EnvelopeKind`].
    pub fn kinds(&self) -> Vec<EnvelopeKind> {
        EnvelopeKind::ALL
            .into_iter()
            .filter(|kind| self.definitions.contains_key(kind))
            .collect()
    }

    pub fn definitions(&self) -> impl Iterator<Item = &JobDefinition> {
        self.definitions.values()
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct RegistryBuilder {
    definitions: FxHashMap<EnvelopeKind, JobDefinition>,
}

impl RegistryBuilder {
    pub fn register(mut self, definition: JobDefinition) -> Result<Self, RegistryError> {
        let kind = definition.kind;
        if definition.max_concurrency == Some(0) {
            return Err(RegistryError::ZeroConcurrency(kind));
        }
        if self.definitions.contains_key(&kind) {
            return Err(RegistryError::DuplicateKind(kind));
        }
        tracing::debug!(%kind, ?definition, "Registered job definition for {kind}");
        self.definitions.insert(kind, definition);
        Ok(self)
    }

    pub fn build(self) -> Result<Registry, RegistryError> {
        if self.definitions.is_empty() {
            return Err(RegistryError::Empty);
        }
        Ok(Registry {
            definitions: self.definitions,
        })
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("A job definition for {0} is already registered")]
    DuplicateKind(EnvelopeKind),
    #[error("The job definition for {0} must allow at least one concurrent envelope")]
    ZeroConcurrency(EnvelopeKind),
    #[error("No job definitions registered")]
    Empty,
}
