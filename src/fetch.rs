//! Per-request fetch policy.
//!
//! Same-origin navigations, of any method and path, go to the network first
//! and fall back to the cached offline page; they are never cached. Other
//! same-origin `GET`s are served cache-first and fill the cache in the
//! background. Writes and bypassed paths always go to the network.
//! Cross-origin requests are left alone.

use std::sync::Arc;

use regex::Regex;
use tokio_util::task::TaskTracker;

use crate::cache::CacheStore;
use crate::error::{Error, Result};
use crate::http::{Method, Request, Response, ResponseClass, Url, same_origin};
use crate::network::Network;

/// How a request is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Not intercepted; the request goes out as if there were no worker.
    Ignore,
    /// Network only, never cached.
    NetworkOnly,
    /// Network, falling back to the offline page.
    NetworkFirst,
    /// Cache, falling back to the network.
    CacheFirst,
}

/// Result of intercepting a request.
#[derive(Debug)]
pub enum FetchDecision {
    /// The worker did not handle the request.
    Ignored,
    /// The worker answered the request.
    Respond(Response),
}

impl FetchDecision {
    /// Returns the response, if the worker produced one.
    #[must_use]
    pub fn into_response(self) -> Option<Response> {
        match self {
            Self::Ignored => None,
            Self::Respond(response) => Some(response),
        }
    }
}

/// Chooses a [`Strategy`] for each request.
#[derive(Debug, Clone)]
pub struct FetchPolicy {
    origin: Url,
    bypass: Vec<Regex>,
}

impl FetchPolicy {
    /// Creates a policy for `origin` with the given bypass path patterns.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if a pattern is not a valid regex.
    pub fn new(origin: Url, bypass: &[String]) -> Result<Self> {
        let bypass = bypass
            .iter()
            .map(|p| {
                Regex::new(p).map_err(|e| Error::Config(format!("invalid bypass pattern {p:?}: {e}")))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { origin, bypass })
    }

    #[must_use]
    pub const fn origin(&self) -> &Url {
        &self.origin
    }

    /// Returns the strategy for `request`.
    #[must_use]
    pub fn strategy(&self, request: &Request) -> Strategy {
        if !same_origin(&request.url, &self.origin) {
            return Strategy::Ignore;
        }
        // Navigations always fall back to the offline page, whatever their
        // method or path.
        if request.is_navigation() {
            return Strategy::NetworkFirst;
        }
        let path = request.url.path();
        if request.method != Method::GET || self.bypass.iter().any(|re| re.is_match(path)) {
            Strategy::NetworkOnly
        } else {
            Strategy::CacheFirst
        }
    }
}

/// Answers intercepted requests from the cache and the network.
pub struct FetchInterceptor<N: Network> {
    policy: FetchPolicy,
    network: Arc<N>,
    cache: Arc<CacheStore>,
    tracker: TaskTracker,
}

impl<N: Network> FetchInterceptor<N> {
    /// Creates an interceptor. Background cache writes are spawned on
    /// `tracker` so they finish even if the caller goes away.
    pub const fn new(
        policy: FetchPolicy,
        network: Arc<N>,
        cache: Arc<CacheStore>,
        tracker: TaskTracker,
    ) -> Self {
        Self {
            policy,
            network,
            cache,
            tracker,
        }
    }

    #[must_use]
    pub const fn policy(&self) -> &FetchPolicy {
        &self.policy
    }

    /// Handles `request` against cache `generation`.
    ///
    /// # Errors
    ///
    /// Returns the network error when a cache-first or network-only request
    /// cannot be fetched. Navigations never fail.
    pub async fn intercept(
        &self,
        generation: &str,
        offline_url: &Url,
        request: &Request,
    ) -> Result<FetchDecision> {
        let response = match self.policy.strategy(request) {
            Strategy::Ignore => return Ok(FetchDecision::Ignored),
            Strategy::NetworkOnly => self.network.fetch(request).await?,
            Strategy::NetworkFirst => self.network_first(generation, offline_url, request).await,
            Strategy::CacheFirst => self.cache_first(generation, request).await?,
        };
        Ok(FetchDecision::Respond(response))
    }

    async fn network_first(&self, generation: &str, offline_url: &Url, request: &Request) -> Response {
        match self.network.fetch(request).await {
            Ok(response) => response,
            Err(e) => {
                log::warn!("Navigation to {} failed, serving offline page: {e}", request.url);
                let fallback = Request::get(offline_url.clone());
                match self.cache.lookup(generation, &fallback).await {
                    Some(page) => page,
                    None => {
                        log::warn!("Offline page {offline_url} is not cached");
                        Response::offline()
                    }
                }
            }
        }
    }

    async fn cache_first(&self, generation: &str, request: &Request) -> Result<Response> {
        if let Some(cached) = self.cache.lookup(generation, request).await {
            log::debug!("Cache hit: {}", request.url);
            return Ok(cached);
        }

        let response = self.network.fetch(request).await?;
        if response.classify() == ResponseClass::Cacheable {
            let cache = Arc::clone(&self.cache);
            let generation = generation.to_string();
            let request = request.clone();
            let copy = response.clone();
            self.tracker.spawn(async move {
                cache.store(&generation, &request, &copy).await;
            });
        }
        Ok(response)
    }
}
