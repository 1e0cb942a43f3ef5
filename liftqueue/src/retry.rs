//! The retry policy engine.
//!
//! A [`RetryPolicy`] is an explicit table of delays rather than a computed curve, so the time of
//! every re-attempt is exactly reproducible.
//!
//! # Example
//!
//! ```
//! # use liftqueue::prelude::*;
//! # use chrono::TimeDelta;
//! let policy = RetryPolicy::default();
//!
//! assert_eq!(policy.max_attempts(), 3);
//! assert_eq!(policy.decide(1), RetryDecision::RetryAfter(TimeDelta::seconds(60)));
//! assert_eq!(policy.decide(2), RetryDecision::RetryAfter(TimeDelta::seconds(300)));
//! assert_eq!(policy.decide(3), RetryDecision::GiveUp);
//! ```
use std::borrow::Cow;

use chrono::TimeDelta;
use serde::{Deserialize, Serialize};
use thiserror::Error;

const REFERENCE_SCHEDULE: &[TimeDelta] = &[
    TimeDelta::seconds(60),
    TimeDelta::seconds(300),
    TimeDelta::seconds(900),
];

/// What to do after a transiently failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    RetryAfter(TimeDelta),
    GiveUp,
}

/// The maximum number of attempts and the delays applied between consecutive attempts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u16,
    delay_schedule: Cow<'static, [TimeDelta]>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::reference()
    }
}

impl RetryPolicy {
    /// Three attempts, waiting 60 seconds then 300 seconds between them.
    ///
    /// The table also holds a 900 second entry which applies when the attempt limit is raised via
    /// [`RetryPolicy::with_max_attempts`].
    pub const fn reference() -> Self {
        Self {
            max_attempts: 3,
            delay_schedule: Cow::Borrowed(REFERENCE_SCHEDULE),
        }
    }

    /// Creates a validated policy.
    ///
    /// The schedule needs at least `max_attempts - 1` entries, every delay must be strictly
    /// positive, and delays may never shrink from one attempt to the next.
    pub fn new(
        max_attempts: u16,
        delay_schedule: impl Into<Cow<'static, [TimeDelta]>>,
    ) -> Result<Self, PolicyError> {
        let delay_schedule = delay_schedule.into();
        validate(max_attempts, &delay_schedule)?;
        Ok(Self {
            max_attempts,
            delay_schedule,
        })
    }

    /// A policy that never retries.
    pub const fn single_attempt() -> Self {
        Self {
            max_attempts: 1,
            delay_schedule: Cow::Borrowed(&[]),
        }
    }

    pub fn with_max_attempts(self, max_attempts: u16) -> Result<Self, PolicyError> {
        Self::new(max_attempts, self.delay_schedule)
    }

    pub fn max_attempts(&self) -> u16 {
        self.max_attempts
    }

    pub fn delay_schedule(&self) -> &[TimeDelta] {
        &self.delay_schedule
    }

    /// Given the number of attempts already made, decide whether another attempt is allowed and
    /// how long to wait before it.
    ///
    /// An attempt count of zero is treated as one.
    pub fn decide(&self, attempt: u16) -> RetryDecision {
        if attempt >= self.max_attempts {
            return RetryDecision::GiveUp;
        }
        let index = usize::from(attempt.saturating_sub(1));
        match self.delay_schedule.get(index) {
            Some(delay) => RetryDecision::RetryAfter(*delay),
            None => RetryDecision::GiveUp,
        }
    }
}

fn validate(max_attempts: u16, delay_schedule: &[TimeDelta]) -> Result<(), PolicyError> {
    if max_attempts == 0 {
        return Err(PolicyError::ZeroAttempts);
    }
    let required = usize::from(max_attempts - 1);
    if delay_schedule.len() < required {
        return Err(PolicyError::ScheduleTooShort {
            max_attempts,
            required,
            found: delay_schedule.len(),
        });
    }
    if let Some(index) = delay_schedule
        .iter()
        .position(|delay| *delay <= TimeDelta::zero())
    {
        return Err(PolicyError::NonPositiveDelay { index });
    }
    if let Some(index) = delay_schedule
        .windows(2)
        .position(|pair| pair[1] < pair[0])
    {
        return Err(PolicyError::Descending { index: index + 1 });
    }
    Ok(())
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PolicyError {
    #[error("A retry policy needs at least one attempt")]
    ZeroAttempts,
    #[error("{max_attempts} attempts need {required} delays, found {found}")]
    ScheduleTooShort {
        max_attempts: u16,
        required: usize,
        found: usize,
    },
    #[error("Delay {index} must be greater than zero")]
    NonPositiveDelay { index: usize },
    #[error("Delay {index} is shorter than the delay before it")]
    Descending { index: usize },
    #[error("Delay {index} is out of range")]
    DelayOutOfRange { index: usize },
    #[error("Invalid retry policy configuration: {0}")]
    Parse(String),
}

/// Serializable form of a [`RetryPolicy`] with delays in whole seconds.
///
/// # Example
///
/// ```
/// # use liftqueue::prelude::*;
/// # use chrono::TimeDelta;
/// let policy = RetryPolicyConfig::from_json(r#"{"max_attempts": 4, "delays_secs": [5, 30, 120]}"#)
///     .unwrap();
///
/// assert_eq!(policy.max_attempts(), 4);
/// assert_eq!(policy.decide(3), RetryDecision::RetryAfter(TimeDelta::seconds(120)));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicyConfig {
    pub max_attempts: u16,
    pub delays_secs: Vec<u64>,
}

impl RetryPolicyConfig {
    pub fn from_json(json: &str) -> Result<RetryPolicy, PolicyError> {
        serde_json::from_str::<Self>(json)
            .map_err(|err| PolicyError::Parse(err.to_string()))?
            .try_into()
    }
}

impl TryFrom<RetryPolicyConfig> for RetryPolicy {
    type Error = PolicyError;

    fn try_from(value: RetryPolicyConfig) -> Result<Self, Self::Error> {
        let delays = value
            .delays_secs
            .into_iter()
            .enumerate()
            .map(|(index, secs)| {
                i64::try_from(secs)
                    .ok()
                    .and_then(TimeDelta::try_seconds)
                    .ok_or(PolicyError::DelayOutOfRange { index })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(value.max_attempts, delays)
    }
}

impl From<&RetryPolicy> for RetryPolicyConfig {
    fn from(value: &RetryPolicy) -> Self {
        Self {
            max_attempts: value.max_attempts,
            delays_secs: value
                .delay_schedule
                .iter()
                .map(|delay| delay.num_seconds().max(0).unsigned_abs())
                .collect(),
        }
    }
}
