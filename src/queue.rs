//! Durable FIFO queue of writes deferred while offline.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::config::RetryPolicy;
use crate::error::{Error, Result};
use crate::store::{QueueBackend, QueueStore};

/// One deferred write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedMutation {
    /// Unique identifier; enqueueing an existing identifier is a no-op.
    pub id: String,
    /// Endpoint path (or absolute URL) the payload is POSTed to.
    pub endpoint: String,
    /// Payload bytes, delivered verbatim.
    #[serde(with = "base64_body")]
    pub body: Vec<u8>,
    /// `Content-Type` of the payload.
    #[serde(default = "default_content_type")]
    pub content_type: String,
    /// When the mutation was enqueued.
    pub enqueued_at: DateTime<Utc>,
    /// Number of failed delivery attempts so far.
    #[serde(default)]
    pub attempts: u32,
    /// Error from the most recent failed attempt.
    pub last_error: Option<String>,
    /// Earliest time of the next attempt, when backoff applies.
    pub next_attempt_at: Option<DateTime<Utc>>,
}

fn default_content_type() -> String {
    "application/json".to_string()
}

impl QueuedMutation {
    /// Creates a JSON mutation with a fresh identifier.
    #[must_use]
    pub fn new(endpoint: impl Into<String>, body: impl Into<Vec<u8>>) -> Self {
        Self::with_id(uuid::Uuid::new_v4().to_string(), endpoint, body)
    }

    /// Creates a JSON mutation with a caller-chosen identifier.
    #[must_use]
    pub fn with_id(
        id: impl Into<String>,
        endpoint: impl Into<String>,
        body: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            id: id.into(),
            endpoint: endpoint.into(),
            body: body.into(),
            content_type: default_content_type(),
            enqueued_at: Utc::now(),
            attempts: 0,
            last_error: None,
            next_attempt_at: None,
        }
    }

    /// Sets the payload content type.
    #[must_use]
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = content_type.into();
        self
    }

    fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_attempt_at.is_none_or(|at| at <= now)
    }

    fn is_expired(&self, policy: &RetryPolicy, now: DateTime<Utc>) -> bool {
        policy.max_age.is_some_and(|max_age| {
            chrono::Duration::from_std(max_age)
                .is_ok_and(|max_age| now.signed_duration_since(self.enqueued_at) > max_age)
        })
    }
}

mod base64_body {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD as BASE64;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(body: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64.encode(body))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        BASE64.decode(encoded).map_err(serde::de::Error::custom)
    }
}

/// Delivers a queued mutation to its endpoint.
#[async_trait]
pub trait MutationSender: Send + Sync {
    /// Sends the mutation. `Ok` means the endpoint accepted it (2xx).
    async fn deliver(&self, mutation: &QueuedMutation) -> Result<()>;
}

/// Result of one item within a flush.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum FlushResult {
    /// Delivered and removed from the queue.
    Delivered {
        /// Mutation identifier.
        id: String,
    },
    /// Delivery failed; the mutation stays queued.
    Failed {
        /// Mutation identifier.
        id: String,
        /// Why delivery failed.
        error: String,
    },
    /// Retry policy gave up; the mutation was removed without delivery.
    Abandoned {
        /// Mutation identifier.
        id: String,
        /// Why it was abandoned.
        reason: String,
    },
    /// Backoff has not elapsed; not attempted this time.
    Deferred {
        /// Mutation identifier.
        id: String,
    },
}

impl FlushResult {
    /// Returns the identifier of the mutation this result refers to.
    #[must_use]
    pub fn id(&self) -> &str {
        match self {
            Self::Delivered { id }
            | Self::Failed { id, .. }
            | Self::Abandoned { id, .. }
            | Self::Deferred { id } => id,
        }
    }

    /// Returns true if the mutation was delivered.
    #[must_use]
    pub const fn is_delivered(&self) -> bool {
        matches!(self, Self::Delivered { .. })
    }
}

/// Persistent FIFO of deferred writes.
///
/// Every change is written through to the backing [`QueueStore`] before the
/// call that made it returns.
pub struct MutationQueue<S: QueueStore = QueueBackend> {
    store: S,
    items: Mutex<Vec<QueuedMutation>>,
    flushing: Mutex<()>,
    policy: RetryPolicy,
}

impl<S: QueueStore> MutationQueue<S> {
    /// Opens the queue, loading whatever the store already holds.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub async fn open(store: S, policy: RetryPolicy) -> Result<Self> {
        let items = store.load().await?;
        if !items.is_empty() {
            log::info!("Restored {} pending mutation(s)", items.len());
        }
        Ok(Self {
            store,
            items: Mutex::new(items),
            flushing: Mutex::new(()),
            policy,
        })
    }

    /// Returns the retry policy.
    #[must_use]
    pub const fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Appends a mutation. Returns false if its identifier is already queued.
    ///
    /// # Errors
    ///
    /// Returns an error if the mutation could not be persisted; the queue is
    /// left unchanged in that case.
    pub async fn enqueue(&self, mutation: QueuedMutation) -> Result<bool> {
        let mut items = self.items.lock().await;
        if items.iter().any(|m| m.id == mutation.id) {
            log::debug!("Mutation {} already queued", mutation.id);
            return Ok(false);
        }
        let id = mutation.id.clone();
        items.push(mutation);
        if let Err(e) = self.store.save(&items).await {
            items.pop();
            return Err(e);
        }
        log::info!("Queued mutation {id} ({} pending)", items.len());
        Ok(true)
    }

    /// Returns a snapshot of the pending mutations in queue order.
    pub async fn pending(&self) -> Vec<QueuedMutation> {
        self.items.lock().await.clone()
    }

    /// Returns the number of pending mutations.
    pub async fn len(&self) -> usize {
        self.items.lock().await.len()
    }

    /// Returns true if nothing is pending.
    pub async fn is_empty(&self) -> bool {
        self.items.lock().await.is_empty()
    }

    /// Attempts delivery of every pending mutation in FIFO order.
    ///
    /// Successes are removed. Failures stay queued in their original position
    /// with their attempt count raised, unless the retry policy abandons them.
    /// A failure never stops the sweep. Concurrent flushes are serialised, and
    /// mutations enqueued during a flush wait for the next one.
    pub async fn flush<M: MutationSender + ?Sized>(&self, sender: &M) -> Vec<FlushResult> {
        let _guard = self.flushing.lock().await;
        let batch = self.pending().await;
        let mut results = Vec::with_capacity(batch.len());

        for mutation in batch {
            let now = Utc::now();

            if mutation.is_expired(&self.policy, now) {
                let reason = format!("older than {:?}", self.policy.max_age.unwrap_or_default());
                log::error!("Abandoning mutation {}: {reason}", mutation.id);
                self.remove(&mutation.id).await;
                results.push(FlushResult::Abandoned {
                    id: mutation.id,
                    reason,
                });
                continue;
            }

            if !mutation.is_due(now) {
                results.push(FlushResult::Deferred { id: mutation.id });
                continue;
            }

            match sender.deliver(&mutation).await {
                Ok(()) => {
                    log::info!("Synced mutation {}", mutation.id);
                    self.remove(&mutation.id).await;
                    results.push(FlushResult::Delivered { id: mutation.id });
                }
                Err(e) => results.push(self.record_failure(&mutation, &e).await),
            }
        }

        results
    }

    async fn record_failure(&self, mutation: &QueuedMutation, error: &Error) -> FlushResult {
        let attempts = mutation.attempts.saturating_add(1);
        // A mutation that can never be addressed is not retried.
        let undeliverable = matches!(error, Error::Config(_));
        let error = error.to_string();

        if undeliverable || self.policy.max_attempts.is_some_and(|max| attempts >= max) {
            log::error!(
                "Abandoning mutation {} after {attempts} attempt(s): {error}",
                mutation.id
            );
            self.remove(&mutation.id).await;
            let reason = if undeliverable {
                format!("undeliverable: {error}")
            } else {
                format!("{attempts} failed attempt(s), last: {error}")
            };
            return FlushResult::Abandoned {
                id: mutation.id.clone(),
                reason,
            };
        }

        log::warn!(
            "Failed to sync mutation {} (attempt {attempts}): {error}",
            mutation.id
        );
        let delay = self.policy.backoff(attempts);
        let next_attempt_at = (!delay.is_zero())
            .then(|| chrono::Duration::from_std(delay).ok())
            .flatten()
            .map(|delay| Utc::now() + delay);

        let mut items = self.items.lock().await;
        if let Some(item) = items.iter_mut().find(|m| m.id == mutation.id) {
            item.attempts = attempts;
            item.last_error = Some(error.clone());
            item.next_attempt_at = next_attempt_at;
        }
        self.persist(&items).await;

        FlushResult::Failed {
            id: mutation.id.clone(),
            error,
        }
    }

    async fn remove(&self, id: &str) {
        let mut items = self.items.lock().await;
        items.retain(|m| m.id != id);
        self.persist(&items).await;
    }

    async fn persist(&self, items: &[QueuedMutation]) {
        if let Err(e) = self.store.save(items).await {
            log::error!("Failed to persist mutation queue: {e}");
        }
    }
}
