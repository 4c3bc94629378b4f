//! Background sync: tag registrations and delivery of queued mutations.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use tokio::sync::Mutex;

use crate::config::SyncConfig;
use crate::error::{Error, Result};
use crate::http::{Method, Request, Url, same_origin};
use crate::network::{HttpNetwork, Network};
use crate::queue::{FlushResult, MutationQueue, MutationSender, QueuedMutation};
use crate::store::QueueStore;

/// Delivers deferred writes and tracks which sync tags are pending.
pub struct SyncCoordinator<N: Network = HttpNetwork> {
    network: Arc<N>,
    origin: Url,
    config: SyncConfig,
    registered: Mutex<BTreeSet<String>>,
}

impl<N: Network> SyncCoordinator<N> {
    /// Creates a coordinator delivering through `network` to `origin`.
    pub fn new(network: Arc<N>, origin: Url, config: SyncConfig) -> Self {
        Self {
            network,
            origin,
            config,
            registered: Mutex::new(BTreeSet::new()),
        }
    }

    /// Returns the tag that flushes the mutation queue.
    #[must_use]
    pub fn tag(&self) -> &str {
        &self.config.tag
    }

    /// Returns the sync settings.
    #[must_use]
    pub const fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Resolves a mutation endpoint against the origin.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if `endpoint` is not a valid URL reference or
    /// resolves to another origin.
    pub fn resolve(&self, endpoint: &str) -> Result<Url> {
        let url = self
            .origin
            .join(endpoint)
            .map_err(|e| Error::Config(format!("invalid endpoint {endpoint:?}: {e}")))?;
        if !same_origin(&url, &self.origin) {
            return Err(Error::Config(format!(
                "endpoint {endpoint:?} is not on {}",
                self.origin.origin().ascii_serialization()
            )));
        }
        Ok(url)
    }

    /// Returns true if `request` is a write to the deferred-write endpoint.
    #[must_use]
    pub fn is_deferrable(&self, request: &Request) -> bool {
        request.method != Method::GET
            && request.method != Method::HEAD
            && same_origin(&request.url, &self.origin)
            && request.url.path() == self.config.endpoint
    }

    /// Records a sync registration. Returns false if `tag` was already pending.
    pub async fn register(&self, tag: &str) -> bool {
        let added = self.registered.lock().await.insert(tag.to_string());
        if added {
            log::debug!("Registered sync {tag}");
        }
        added
    }

    /// Drops a sync registration.
    pub async fn unregister(&self, tag: &str) -> bool {
        self.registered.lock().await.remove(tag)
    }

    /// Returns the pending tags.
    pub async fn pending_tags(&self) -> Vec<String> {
        self.registered.lock().await.iter().cloned().collect()
    }

    /// Handles a `sync` event.
    ///
    /// Returns `None` for tags this worker does not handle; their registration
    /// is dropped. For the queue tag the queue is flushed, and the
    /// registration stays pending until a flush leaves the queue empty.
    pub async fn handle_sync<S: QueueStore>(
        &self,
        tag: &str,
        queue: &MutationQueue<S>,
    ) -> Option<Vec<FlushResult>> {
        if tag != self.config.tag {
            log::debug!("Ignoring sync for unknown tag {tag}");
            self.unregister(tag).await;
            return None;
        }

        log::info!("Background sync triggered: {tag}");
        let results = queue.flush(self).await;
        if queue.is_empty().await {
            self.unregister(tag).await;
        }
        Some(results)
    }
}

#[async_trait]
impl<N: Network> MutationSender for SyncCoordinator<N> {
    async fn deliver(&self, mutation: &QueuedMutation) -> Result<()> {
        let url = self.resolve(&mutation.endpoint)?;
        let mut request = Request::post_json(url, mutation.body.clone())
            .with_header(CONTENT_TYPE.as_str(), &mutation.content_type);
        if let Some(token) = &self.config.csrf_token {
            request = request.with_header(&self.config.csrf_header, token);
        }

        let response = self.network.fetch(&request).await?;
        if response.is_ok() {
            Ok(())
        } else {
            Err(Error::Delivery {
                id: mutation.id.clone(),
                status: response.status,
            })
        }
    }
}
