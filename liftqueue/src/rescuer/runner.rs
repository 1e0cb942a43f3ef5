use std::{ops::Sub, sync::Arc, time::Duration};

use chrono::{DateTime, TimeDelta, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::{
    definition::Registry,
    envelope::{AttemptError, EnvelopeKind, EnvelopeStatus, Failure},
    store::{EnvelopeQuery, EnvelopeStore, StatusUpdate},
};

use super::RescuerConfig;

const ERROR_TYPE_STALLED: &str = "stalled";

pub(crate) struct RescuerRunner {
    config: RescuerConfig,
    store: Arc<dyn EnvelopeStore>,
    registry: Arc<Registry>,
}

impl RescuerRunner {
    pub fn new(
        store: Arc<dyn EnvelopeStore>,
        registry: Arc<Registry>,
        config: RescuerConfig,
    ) -> Self {
        Self {
            config,
            store,
            registry,
        }
    }

    pub fn spawn(self, cancellation_token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let Some(next) = self.config.schedule.upcoming(Utc).next() else {
                    tracing::warn!("No future scheduled time for the stalled-envelope rescuer");
                    break;
                };
                let delay = next
                    .sub(Utc::now())
                    .sub(TimeDelta::milliseconds(10))
                    .to_std()
                    .unwrap_or(Duration::ZERO);
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {
                        self.rescue().await;
                        if let Ok(delay) = next.sub(Utc::now()).to_std() {
                            tokio::time::sleep(delay).await;
                        }
                    }
                    _ = cancellation_token.cancelled() => {
                        tracing::debug!("Shutting down the stalled-envelope rescuer");
                        break;
                    },
                }
            }
        })
    }

    pub(crate) async fn rescue(&self) {
        let attempted_before = Utc::now() - self.config.stall_after;
        self.fail_exhausted(attempted_before).await;
        match self.store.rescue_stalled(attempted_before).await {
            Ok(rescued) => {
                for envelope_id in rescued {
                    tracing::warn!(
                        %envelope_id,
                        "Envelope {envelope_id} stalled in flight since before \
                         {attempted_before} and will be attempted again",
                    );
                }
            }
            Err(err) => {
                tracing::error!(?err, "Failed to rescue stalled envelopes with error {err}")
            }
        }
    }

    /// Fail stalled envelopes whose interrupted attempt was the last one their policy allows.
    ///
    /// Runs before [`EnvelopeStore::rescue_stalled`], which then only sees envelopes with
    /// attempts to spare.
    async fn fail_exhausted(&self, attempted_before: DateTime<Utc>) {
        let in_flight = match self
            .store
            .query(EnvelopeQuery::StatusEqual(EnvelopeStatus::InFlight))
            .await
        {
            Ok(envelopes) => envelopes,
            Err(err) => {
                tracing::error!(?err, "Failed to look up stalled envelopes with error {err}");
                return;
            }
        };

        let exhausted = in_flight.into_iter().filter(|envelope| {
            envelope
                .attempted_at
                .is_some_and(|attempted_at| attempted_at < attempted_before)
                && self
                    .registry
                    .get(envelope.kind)
                    .is_some_and(|definition| {
                        envelope.attempt >= definition.retry_policy().max_attempts()
                    })
        });

        for envelope in exhausted {
            let envelope_id = envelope.id;
            let attempt = envelope.attempt;
            let error = AttemptError::new(
                attempt,
                Failure::Exhausted,
                ERROR_TYPE_STALLED,
                format!("Final attempt {attempt} stalled in flight before {attempted_before}"),
            );
            match self
                .store
                .update_status(envelope_id, StatusUpdate::failed(attempt, error))
                .await
            {
                Ok(()) => tracing::error!(
                    %envelope_id,
                    kind = %envelope.kind,
                    "Envelope {envelope_id} stalled on its final attempt {attempt} and will be \
                     discarded"
                ),
                Err(err) => tracing::debug!(
                    ?err,
                    %envelope_id,
                    "Stalled envelope {envelope_id} changed before it could be failed: {err}"
                ),
            }
        }
    }
}

/// Kinds whose attempts may still be running when the rescuer considers them stalled, because
/// their definition has no timeout or one at least as long as `stall_after`.
pub(crate) fn kinds_outliving_stall(
    registry: &Registry,
    stall_after: TimeDelta,
) -> Vec<EnvelopeKind> {
    registry
        .kinds()
        .into_iter()
        .filter(|kind| {
            registry
                .get(*kind)
                .and_then(|definition| definition.timeout())
                .and_then(|timeout| TimeDelta::from_std(timeout).ok())
                .map_or(true, |timeout| timeout >= stall_after)
        })
        .collect()
}
