//! Network abstraction for testability.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;
use crate::http::{Request, Response, ResponseType, Url, same_origin};

/// Abstraction over the network stack the worker fetches through.
///
/// An `Err` means the request never produced an HTTP response (offline, DNS,
/// refused connection, timeout). Any HTTP status, including 5xx, is `Ok`.
#[async_trait]
pub trait Network: Send + Sync {
    /// Performs the request and returns the full response.
    async fn fetch(&self, request: &Request) -> Result<Response>;
}

/// Network implementation backed by `reqwest`.
///
/// Redirects are not followed, so a 3xx reaches the page unchanged and is
/// never written to the cache.
#[derive(Debug, Clone)]
pub struct HttpNetwork {
    client: reqwest::Client,
    origin: Url,
}

impl HttpNetwork {
    /// Creates a network for the given origin with the default client.
    ///
    /// # Errors
    ///
    /// Returns an error if the TLS backend cannot be initialised.
    pub fn new(origin: Url) -> Result<Self> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .pool_idle_timeout(Duration::from_secs(60))
            .tcp_keepalive(Duration::from_secs(30))
            .build()?;
        Ok(Self { client, origin })
    }

    /// Returns the origin responses are classified against.
    #[must_use]
    pub const fn origin(&self) -> &Url {
        &self.origin
    }
}

#[async_trait]
impl Network for HttpNetwork {
    async fn fetch(&self, request: &Request) -> Result<Response> {
        let mut builder = self
            .client
            .request(request.method.clone(), request.url.clone())
            .headers(request.headers.clone());
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        let resp = builder.send().await?;
        let status = resp.status().as_u16();
        let kind = if same_origin(resp.url(), &self.origin) {
            ResponseType::Basic
        } else {
            ResponseType::Cors
        };
        let headers = resp.headers().clone();
        let body = resp.bytes().await?;

        log::debug!("{} {} -> {status}", request.method, request.url);

        Ok(Response {
            status,
            headers,
            body,
            kind,
        })
    }
}
