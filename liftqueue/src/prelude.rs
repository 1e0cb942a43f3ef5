//! The purpose of this module is to alleviate the need to import many of the `[liftqueue]` types.
//!
//! ```
//! # #![allow(unused_imports)]
//! use liftqueue::prelude::*;
//! ```
pub use crate::definition::{JobDefinition, Registry};
pub use crate::dispatcher::{Dispatcher, Outcome};
pub use crate::envelope::builder::EnvelopeBuilder;
pub use crate::envelope::{EnvelopeId, EnvelopeKind, EnvelopeStatus, Failure};
pub use crate::handler::{ExecutionError, ExecutionResult, HandlerError, JobHandler};
pub use crate::rescuer::RescuerConfig;
pub use crate::retry::{RetryDecision, RetryPolicy, RetryPolicyConfig};
pub use crate::store::EnvelopeStore;
pub use crate::LiftQueue;
