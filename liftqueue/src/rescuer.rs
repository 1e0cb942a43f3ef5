//! The API for configuring the stalled-envelope rescuer.
//!
//! Delivery is at-least-once. An envelope is left [`EnvelopeStatus::InFlight`] when the process
//! executing it dies before its outcome was recorded. The rescuer periodically returns such
//! envelopes to [`EnvelopeStatus::Pending`] so that they are attempted again. The attempt count
//! is left untouched: the interrupted attempt still counts towards the retry budget, and an
//! envelope that stalled on its final attempt is failed as [`Failure::Exhausted`] instead.
//!
//! The stall threshold should comfortably exceed the timeout of every job definition, otherwise
//! an attempt that is still running could be handed out a second time. Definitions without a
//! timeout are never bounded, so `LiftQueue::with_rescuer` warns about them.
//!
//! # Example
//!
//! ```
//! # use liftqueue::prelude::*;
//! # use std::str::FromStr;
//! # use chrono::TimeDelta;
//! let config = RescuerConfig::new(cron::Schedule::from_str("0 */5 * * * *").unwrap())
//!     .with_stall_after(TimeDelta::minutes(15));
//!
//! assert_eq!(config.stall_after(), TimeDelta::minutes(15));
//! ```
//!
//! [`EnvelopeStatus::InFlight`]: crate::envelope::EnvelopeStatus::InFlight
//! [`EnvelopeStatus::Pending`]: crate::envelope::EnvelopeStatus::Pending
//! [`Failure::Exhausted`]: crate::envelope::Failure::Exhausted
use chrono::TimeDelta;

pub(crate) mod runner;

/// When the rescuer runs and how long an attempt may stay in flight before it is considered
/// stalled.
#[derive(Debug, Clone)]
pub struct RescuerConfig {
    schedule: cron::Schedule,
    stall_after: TimeDelta,
}

impl RescuerConfig {
    /// Creates a config with a stall threshold of 30 minutes.
    pub fn new(schedule: cron::Schedule) -> Self {
        Self {
            schedule,
            stall_after: TimeDelta::minutes(30),
        }
    }

    pub fn with_stall_after(self, stall_after: TimeDelta) -> Self {
        Self {
            stall_after,
            ..self
        }
    }

    pub fn schedule(&self) -> &cron::Schedule {
        &self.schedule
    }

    pub fn stall_after(&self) -> TimeDelta {
        self.stall_after
    }
}
