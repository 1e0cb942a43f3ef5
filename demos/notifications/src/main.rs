use std::{
    collections::HashSet,
    error::Error,
    str::FromStr,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use liftqueue::{
    prelude::*,
    store::{memory::InMemoryStore, EnvelopeQuery},
};
use tracing_subscriber::EnvFilter;

const POLICY: &str = "LIFTQUEUE_POLICY";
const CONCURRENCY: &str = "LIFTQUEUE_CONCURRENCY";
const DEFAULT_POLICY: &str = r#"{ "max_attempts": 3, "delays_secs": [1, 2] }"#;
const DEFAULT_CONCURRENCY: usize = 4;

#[tokio::main]
pub async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,liftqueue=debug")),
        )
        .init();

    let policy = std::env::var(POLICY).unwrap_or_else(|_| DEFAULT_POLICY.to_owned());
    let policy = RetryPolicyConfig::from_json(&policy)?;
    let concurrency = std::env::var(CONCURRENCY)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(DEFAULT_CONCURRENCY);
    tracing::info!(?policy, concurrency, "Starting notification demo");

    let store: Arc<dyn EnvelopeStore> = Arc::new(InMemoryStore::new());
    let registry = Registry::builder()
        .register(
            JobDefinition::new(EnvelopeKind::Welcome, FlakyMailer::new(store.clone()))
                .with_retry_policy(policy.clone())
                .with_timeout(Duration::from_secs(5))
                .with_max_concurrency(concurrency),
        )?
        .register(
            JobDefinition::new(EnvelopeKind::Invitation, InvitationMailer(store.clone()))
                .with_retry_policy(policy)
                .with_max_concurrency(concurrency),
        )?
        .register(
            JobDefinition::new(EnvelopeKind::Generic, PushNotifier)
                .with_retry_policy(RetryPolicy::single_attempt()),
        )?
        .build()?;

    let queue = LiftQueue::from_shared(store, Arc::new(registry))
        .start()
        .with_rescuer(
            RescuerConfig::new(cron::Schedule::from_str("*/10 * * * * *")?)
                .with_stall_after(chrono::TimeDelta::seconds(30)),
        );

    for user_id in [1, 2] {
        // Registering twice must not send two welcome emails.
        for _ in 0..2 {
            let id = EnvelopeBuilder::new(EnvelopeKind::Welcome)
                .with_payload(serde_json::json!({ "user_id": user_id }))
                .unique_by(&("welcome", user_id))
                .enqueue_to(queue.store().as_ref())
                .await?;
            println!("Enqueued welcome envelope {id} for user {user_id}");
        }
    }

    let id = EnvelopeBuilder::new(EnvelopeKind::Invitation)
        .with_payload(serde_json::json!({ "from": 1, "to": "partner@example.com" }))
        .enqueue_to(queue.store().as_ref())
        .await?;
    println!("Enqueued invitation envelope {id}");

    let id = EnvelopeBuilder::new(EnvelopeKind::Invitation)
        .with_payload(serde_json::json!({ "from": 2 }))
        .enqueue_to(queue.store().as_ref())
        .await?;
    println!("Enqueued invitation envelope {id} without a recipient");

    let id = EnvelopeBuilder::new(EnvelopeKind::Generic)
        .with_payload(serde_json::json!({ "message": "New personal record!" }))
        .schedule_in(chrono::TimeDelta::seconds(1))
        .enqueue_to(queue.store().as_ref())
        .await?;
    println!("Enqueued generic envelope {id}");

    let unfinished = EnvelopeQuery::Or(vec![
        EnvelopeQuery::StatusEqual(EnvelopeStatus::Pending),
        EnvelopeQuery::StatusEqual(EnvelopeStatus::InFlight),
    ]);
    while !queue.store().query(unfinished.clone()).await?.is_empty() {
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    for envelope in queue.store().query(EnvelopeQuery::all()).await? {
        println!(
            "{} {}: {:?} after {} attempt(s), last error: {:?}",
            envelope.kind,
            envelope.id,
            envelope.status,
            envelope.attempt,
            envelope.last_error.map(|error| error.detail),
        );
    }

    queue.graceful_shutdown().await?;
    Ok(())
}

/// Sends welcome emails through a mail transport that drops the first attempt of every
/// envelope.
struct FlakyMailer {
    store: Arc<dyn EnvelopeStore>,
    seen: Mutex<HashSet<EnvelopeId>>,
}

impl FlakyMailer {
    fn new(store: Arc<dyn EnvelopeStore>) -> Self {
        Self {
            store,
            seen: Default::default(),
        }
    }
}

#[async_trait]
impl JobHandler for FlakyMailer {
    async fn process(&self, envelope_id: EnvelopeId) -> ExecutionResult {
        let first_attempt = self
            .seen
            .lock()
            .map(|mut seen| seen.insert(envelope_id))
            .unwrap_or(false);
        if first_attempt {
            return HandlerError::transient("smtp", "421 service not available").into();
        }
        match self.store.get(envelope_id).await {
            Ok(envelope) => {
                println!("Welcome email sent for {}", envelope.payload["user_id"]);
                ExecutionResult::Done
            }
            Err(err) => HandlerError::transient("store", err.to_string()).into(),
        }
    }
}

struct InvitationMailer(Arc<dyn EnvelopeStore>);

#[async_trait]
impl JobHandler for InvitationMailer {
    async fn process(&self, envelope_id: EnvelopeId) -> ExecutionResult {
        let envelope = match self.0.get(envelope_id).await {
            Ok(envelope) => envelope,
            Err(err) => return HandlerError::transient("store", err.to_string()).into(),
        };
        match envelope.payload["to"].as_str() {
            Some(recipient) => {
                println!("Invitation sent to {recipient}");
                ExecutionResult::Done
            }
            None => HandlerError::permanent("recipient", "Invitation has no recipient").into(),
        }
    }
}

struct PushNotifier;

#[async_trait]
impl JobHandler for PushNotifier {
    async fn process(&self, envelope_id: EnvelopeId) -> ExecutionResult {
        println!("Push notification delivered for {envelope_id}");
        ExecutionResult::Done
    }
}
