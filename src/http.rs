//! Request and response types seen by the worker.
//!
//! These mirror what a fetch event carries: a URL, a method, a request mode
//! and an optional body going in, and a status, headers, a body and a
//! response type coming out.

use bytes::Bytes;
use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};

pub use reqwest::{Method, StatusCode, Url};

/// How a request was issued by the page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RequestMode {
    /// Top-level document load.
    Navigate,
    /// Same-origin subresource load.
    #[default]
    SameOrigin,
    /// Cross-origin load with CORS.
    Cors,
    /// Cross-origin load without CORS (yields opaque responses).
    NoCors,
}

/// A request intercepted by the worker.
#[derive(Debug, Clone)]
pub struct Request {
    /// Absolute request URL.
    pub url: Url,
    /// HTTP method.
    pub method: Method,
    /// Request mode.
    pub mode: RequestMode,
    /// Request headers.
    pub headers: HeaderMap,
    /// Request body, if any.
    pub body: Option<Bytes>,
}

impl Request {
    /// Creates a GET subresource request.
    #[must_use]
    pub fn get(url: Url) -> Self {
        Self {
            url,
            method: Method::GET,
            mode: RequestMode::SameOrigin,
            headers: HeaderMap::new(),
            body: None,
        }
    }

    /// Creates a top-level navigation request.
    #[must_use]
    pub fn navigate(url: Url) -> Self {
        Self {
            mode: RequestMode::Navigate,
            ..Self::get(url)
        }
    }

    /// Creates a POST request with a JSON body.
    #[must_use]
    pub fn post_json(url: Url, body: impl Into<Bytes>) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Self {
            url,
            method: Method::POST,
            mode: RequestMode::SameOrigin,
            headers,
            body: Some(body.into()),
        }
    }

    /// Creates a HEAD request, used for connectivity checks.
    #[must_use]
    pub fn head(url: Url) -> Self {
        Self {
            method: Method::HEAD,
            ..Self::get(url)
        }
    }

    /// Adds a header, ignoring names or values that are not valid HTTP.
    #[must_use]
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            self.headers.insert(name, value);
        }
        self
    }

    /// Returns true for top-level document loads.
    #[must_use]
    pub fn is_navigation(&self) -> bool {
        self.mode == RequestMode::Navigate
    }

    /// Returns the identity under which this request is cached.
    #[must_use]
    pub fn cache_key(&self) -> CacheKey {
        CacheKey::new(&self.method, &self.url)
    }
}

/// Identity of a cached request: method plus absolute URL without fragment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CacheKey {
    method: String,
    url: String,
}

impl CacheKey {
    /// Builds a key from a method and URL. The fragment is never part of the key.
    #[must_use]
    pub fn new(method: &Method, url: &Url) -> Self {
        let mut url = url.clone();
        url.set_fragment(None);
        Self {
            method: method.as_str().to_string(),
            url: url.into(),
        }
    }

    /// Returns the URL part of the key.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }
}

/// Response type as seen by the worker, analogous to `Response.type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseType {
    /// Same-origin response with readable status and body.
    #[default]
    Basic,
    /// Cross-origin response fetched with CORS.
    Cors,
    /// Cross-origin no-cors response; status and body are hidden.
    Opaque,
    /// Redirect returned under manual redirect handling.
    OpaqueRedirect,
    /// Network error placeholder.
    Error,
}

/// What the cache may do with a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseClass {
    /// HTTP 200, same-origin basic response. Only these are written at run time.
    Cacheable,
    /// 3xx status or opaque redirect.
    Redirect,
    /// Cross-origin response the worker cannot inspect or must not keep.
    Opaque,
    /// Everything else: 4xx/5xx, network error placeholders, and non-200
    /// successes that cannot be replayed from cache (204, 206).
    Error,
}

/// A response produced by the network or served from the cache.
#[derive(Debug, Clone)]
pub struct Response {
    /// HTTP status code.
    pub status: u16,
    /// Response headers.
    pub headers: HeaderMap,
    /// Response body.
    pub body: Bytes,
    /// Response type.
    pub kind: ResponseType,
}

impl Response {
    /// Creates a basic response with the given status and body.
    #[must_use]
    pub fn new(status: u16, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: body.into(),
            kind: ResponseType::Basic,
        }
    }

    /// Sets the response type.
    #[must_use]
    pub const fn with_kind(mut self, kind: ResponseType) -> Self {
        self.kind = kind;
        self
    }

    /// Sets the `Content-Type` header.
    #[must_use]
    pub fn with_content_type(mut self, content_type: &'static str) -> Self {
        self.headers
            .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
        self
    }

    /// The plain-text `503` answer used when neither network nor cache can help.
    #[must_use]
    pub fn offline() -> Self {
        Self::new(503, "Offline").with_content_type("text/plain; charset=utf-8")
    }

    /// Returns true for 2xx statuses, analogous to `Response.ok`.
    #[must_use]
    pub const fn is_ok(&self) -> bool {
        self.status >= 200 && self.status < 300
    }

    /// Classifies the response for caching decisions.
    #[must_use]
    pub const fn classify(&self) -> ResponseClass {
        match self.kind {
            ResponseType::Opaque => ResponseClass::Opaque,
            ResponseType::OpaqueRedirect => ResponseClass::Redirect,
            ResponseType::Error => ResponseClass::Error,
            ResponseType::Cors => {
                if self.status >= 300 && self.status < 400 {
                    ResponseClass::Redirect
                } else {
                    ResponseClass::Opaque
                }
            }
            ResponseType::Basic => match self.status {
                200 => ResponseClass::Cacheable,
                300..=399 => ResponseClass::Redirect,
                _ => ResponseClass::Error,
            },
        }
    }
}

/// Returns true if both URLs share scheme, host and port.
#[must_use]
pub fn same_origin(a: &Url, b: &Url) -> bool {
    a.origin() == b.origin()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn basic_200_is_cacheable() {
        assert_eq!(Response::new(200, "ok").classify(), ResponseClass::Cacheable);
    }

    #[test]
    fn redirects_are_not_cacheable() {
        assert_eq!(Response::new(302, "").classify(), ResponseClass::Redirect);
        assert_eq!(
            Response::new(0, "")
                .with_kind(ResponseType::OpaqueRedirect)
                .classify(),
            ResponseClass::Redirect
        );
    }

    #[test]
    fn cross_origin_200_is_opaque() {
        let cors = Response::new(200, "lib").with_kind(ResponseType::Cors);
        assert_eq!(cors.classify(), ResponseClass::Opaque);
        let opaque = Response::new(0, "").with_kind(ResponseType::Opaque);
        assert_eq!(opaque.classify(), ResponseClass::Opaque);
    }

    #[test]
    fn non_200_successes_and_failures_are_errors() {
        assert_eq!(Response::new(204, "").classify(), ResponseClass::Error);
        assert_eq!(Response::new(404, "").classify(), ResponseClass::Error);
        assert_eq!(Response::new(500, "").classify(), ResponseClass::Error);
    }

    #[test]
    fn cache_key_ignores_fragment() {
        let a = CacheKey::new(&Method::GET, &url("http://app.test/static/app.js#top"));
        let b = CacheKey::new(&Method::GET, &url("http://app.test/static/app.js"));
        assert_eq!(a, b);
        assert_eq!(a.url(), "http://app.test/static/app.js");
    }

    #[test]
    fn cache_key_includes_method() {
        let u = url("http://app.test/x");
        assert_ne!(CacheKey::new(&Method::GET, &u), CacheKey::new(&Method::HEAD, &u));
    }

    #[test]
    fn same_origin_compares_scheme_host_port() {
        assert!(same_origin(&url("http://app.test/a"), &url("http://app.test/b?c")));
        assert!(!same_origin(&url("http://app.test/a"), &url("https://app.test/a")));
        assert!(!same_origin(&url("http://app.test/a"), &url("http://app.test:8080/a")));
        assert!(!same_origin(&url("http://app.test/a"), &url("https://cdn.jsdelivr.net/a")));
    }

    #[test]
    fn navigate_sets_mode() {
        let req = Request::navigate(url("http://app.test/"));
        assert!(req.is_navigation());
        assert!(!Request::get(url("http://app.test/")).is_navigation());
    }

    #[test]
    fn with_header_skips_invalid_names() {
        let req = Request::get(url("http://app.test/"))
            .with_header("X-CSRFToken", "abc")
            .with_header("bad header", "x");
        assert_eq!(req.headers.len(), 1);
        assert_eq!(req.headers["x-csrftoken"], "abc");
    }

    mod property_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn only_basic_200_is_cacheable(status in 0u16..1000) {
                for kind in [
                    ResponseType::Basic,
                    ResponseType::Cors,
                    ResponseType::Opaque,
                    ResponseType::OpaqueRedirect,
                    ResponseType::Error,
                ] {
                    let class = Response::new(status, "").with_kind(kind).classify();
                    let expected = status == 200 && kind == ResponseType::Basic;
                    prop_assert_eq!(class == ResponseClass::Cacheable, expected);
                }
            }
        }
    }
}
