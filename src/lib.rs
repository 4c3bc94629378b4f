//! voucher-sw - offline caching and background sync for the voucher portal.
//!
//! This library implements the service worker behind the voucher system's
//! Progressive Web App: a versioned response cache filled at install time,
//! per-request fetch policies (network-first navigations with an offline
//! fallback, cache-first assets), worker version lifecycle, a durable queue
//! of writes made while offline, and push notifications.
//!
//! The `voucher-sw` binary hosts the worker as a local HTTP proxy in front of
//! the voucher backend.
//!
//! # Example
//!
//! ```no_run
//! use voucher_sw::{AppConfig, ClientMessage, Request, ServiceWorker};
//!
//! # async fn example() -> voucher_sw::Result<()> {
//! let config = AppConfig::default();
//! let script = config.worker.script()?;
//! let worker = ServiceWorker::from_config(config).await?;
//!
//! // Install and activate the app shell
//! worker.register(script).await?;
//!
//! // Ask which cache generation is serving
//! let reply = worker.message(ClientMessage::GetVersion).await?;
//! println!("{reply:?}");
//!
//! // Route a request through the worker
//! let url = voucher_sw::Url::parse("http://127.0.0.1:5000/static/css/themes.css").unwrap();
//! let decision = worker.fetch(&Request::get(url)).await?;
//! # let _ = decision;
//! # Ok(())
//! # }
//! ```

#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

pub mod cache;
pub mod config;
pub mod connectivity;
pub mod error;
pub mod fetch;
pub mod http;
pub mod lifecycle;
pub mod network;
pub mod notification;
pub mod queue;
#[cfg(feature = "server")]
pub mod server;
pub mod store;
pub mod sync;
pub mod worker;

// Re-export main types for convenience
pub use cache::{CacheStore, CachedResponse, GenerationStats};
pub use config::{AppConfig, CacheConfig, NotificationConfig, RetryPolicy, SyncConfig, WorkerConfig};
pub use error::{Error, Result};
pub use fetch::{FetchDecision, FetchInterceptor, FetchPolicy, Strategy};
pub use http::{CacheKey, Method, Request, RequestMode, Response, ResponseClass, ResponseType, Url};
pub use lifecycle::{ClientId, InstallOutcome, Registration, WorkerId, WorkerScript, WorkerState};
pub use network::{HttpNetwork, Network};
pub use notification::{ClickOutcome, Notification, NotificationCenter};
pub use queue::{FlushResult, MutationQueue, MutationSender, QueuedMutation};
pub use store::{FileQueueStore, MemoryQueueStore, QueueBackend, QueueStore};
pub use sync::SyncCoordinator;
pub use worker::{ClientMessage, ServiceWorker, VersionReply, WorkerSignal, WorkerStatus};
