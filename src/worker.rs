//! The service worker: lifecycle, per-event handlers, and the signals it
//! broadcasts to its clients.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use reqwest::header::CONTENT_TYPE;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, broadcast};
use tokio_util::task::TaskTracker;
use uuid::Uuid;

use crate::cache::{CacheStore, GenerationStats};
use crate::config::AppConfig;
use crate::error::{Error, Result};
use crate::fetch::{FetchDecision, FetchInterceptor, FetchPolicy};
use crate::http::{Request, Response};
use crate::lifecycle::{
    ClientId, InstallOutcome, Registration, StateChange, WorkerScript, WorkerState, WorkerVersion,
};
use crate::network::{HttpNetwork, Network};
use crate::notification::{ClickOutcome, Notification, NotificationCenter};
use crate::queue::{FlushResult, MutationQueue, QueuedMutation};
use crate::store::{QueueBackend, QueueStore};
use crate::sync::SyncCoordinator;

const SIGNAL_CAPACITY: usize = 64;

/// Header a client may set to choose the identifier of a deferred write.
pub const MUTATION_ID_HEADER: &str = "x-mutation-id";

/// Something the worker tells its clients.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerSignal {
    /// A worker version changed state.
    StateChange(StateChange),
    /// A new version is installed and waiting to activate.
    UpdateAvailable { version: String },
    /// A new version took control; clients should reload if `reload` is set.
    ControllerChange { version: String, reload: bool },
    /// A notification was shown.
    Notification(Notification),
    /// A notification click asked for a window on `url`.
    OpenWindow { url: String },
    /// A background sync finished.
    SyncComplete {
        tag: String,
        results: Vec<FlushResult>,
    },
}

impl WorkerSignal {
    /// Returns the signal's name, as used for the `type` field.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::StateChange(_) => "state_change",
            Self::UpdateAvailable { .. } => "update_available",
            Self::ControllerChange { .. } => "controller_change",
            Self::Notification(_) => "notification",
            Self::OpenWindow { .. } => "open_window",
            Self::SyncComplete { .. } => "sync_complete",
        }
    }
}

/// A message posted to the worker by a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientMessage {
    /// Activate the waiting version now.
    SkipWaiting,
    /// Ask for the active cache generation.
    GetVersion,
}

/// Reply to [`ClientMessage::GetVersion`]. `version` is `None` while no
/// version is active.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionReply {
    pub version: Option<String>,
}

/// Snapshot of the worker for health and diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerStatus {
    pub active: Option<String>,
    pub waiting: Option<String>,
    pub installing: Option<String>,
    pub clients: usize,
    pub online: bool,
    pub pending_mutations: usize,
    pub pending_syncs: Vec<String>,
    pub caches: Vec<GenerationStats>,
}

/// One service worker registration and everything it owns.
///
/// Handlers take `&self` and may run concurrently. Background work (cache
/// writes after a fetch) is tracked by a [`TaskTracker`]; [`settle`] waits
/// for it.
///
/// [`settle`]: ServiceWorker::settle
pub struct ServiceWorker<N: Network = HttpNetwork, S: QueueStore = QueueBackend> {
    config: AppConfig,
    network: Arc<N>,
    cache: Arc<CacheStore>,
    queue: MutationQueue<S>,
    sync: SyncCoordinator<N>,
    fetch: FetchInterceptor<N>,
    registration: Mutex<Registration>,
    notifications: NotificationCenter,
    signals: broadcast::Sender<WorkerSignal>,
    tracker: TaskTracker,
    online: AtomicBool,
}

impl ServiceWorker {
    /// Creates a worker talking HTTP to the configured origin, with its
    /// queue persisted under the state directory.
    ///
    /// A queue file that cannot be parsed is moved aside and an empty queue
    /// is started. If the state directory cannot be written the queue is
    /// kept in memory.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid, the HTTP client
    /// cannot be built, or the queue file cannot be read.
    pub async fn from_config(config: AppConfig) -> Result<Self> {
        let network = Arc::new(HttpNetwork::new(config.worker.origin_url()?)?);
        let store = QueueBackend::open(config.paths.queue_path()).await;
        if let QueueBackend::File(file) = &store
            && let Err(e @ Error::TomlDe(_)) = file.load().await
        {
            log::error!("Mutation queue at {} is unreadable: {e}", file.path().display());
            let moved = file.quarantine().await?;
            log::warn!("Moved unreadable queue to {}", moved.display());
        }
        Self::new(config, network, store).await
    }
}

impl<N: Network, S: QueueStore> ServiceWorker<N, S> {
    /// Creates a worker. Nothing is registered yet; call [`register`].
    ///
    /// A non-empty restored queue gets a pending sync registration.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the queue store
    /// cannot be read.
    ///
    /// [`register`]: ServiceWorker::register
    pub async fn new(config: AppConfig, network: Arc<N>, store: S) -> Result<Self> {
        config.validate()?;
        let origin = config.worker.origin_url()?;
        let cache = Arc::new(CacheStore::new().with_max_bytes(config.cache.max_bytes));
        let queue = MutationQueue::open(store, config.sync.retry_policy()).await?;
        let sync = SyncCoordinator::new(Arc::clone(&network), origin.clone(), config.sync.clone());
        if !queue.is_empty().await {
            sync.register(sync.tag()).await;
        }
        let tracker = TaskTracker::new();
        let fetch = FetchInterceptor::new(
            FetchPolicy::new(origin, &config.worker.bypass)?,
            Arc::clone(&network),
            Arc::clone(&cache),
            tracker.clone(),
        );
        let (signals, _) = broadcast::channel(SIGNAL_CAPACITY);

        Ok(Self {
            config,
            network,
            cache,
            queue,
            sync,
            fetch,
            registration: Mutex::new(Registration::new()),
            notifications: NotificationCenter::new(),
            signals,
            tracker,
            online: AtomicBool::new(true),
        })
    }

    #[must_use]
    pub const fn config(&self) -> &AppConfig {
        &self.config
    }

    #[must_use]
    pub const fn network(&self) -> &Arc<N> {
        &self.network
    }

    #[must_use]
    pub const fn cache(&self) -> &Arc<CacheStore> {
        &self.cache
    }

    #[must_use]
    pub const fn queue(&self) -> &MutationQueue<S> {
        &self.queue
    }

    #[must_use]
    pub const fn sync_coordinator(&self) -> &SyncCoordinator<N> {
        &self.sync
    }

    /// Returns the keep-alive scope handlers run under.
    #[must_use]
    pub const fn tracker(&self) -> &TaskTracker {
        &self.tracker
    }

    /// Subscribes to worker signals.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<WorkerSignal> {
        self.signals.subscribe()
    }

    fn emit(&self, signal: WorkerSignal) {
        // No subscribers is fine.
        let _ = self.signals.send(signal);
    }

    fn emit_changes(&self, changes: Vec<StateChange>) {
        for change in changes {
            log::debug!("{} ({}): {:?} -> {:?}", change.worker, change.version, change.from, change.to);
            self.emit(WorkerSignal::StateChange(change));
        }
    }

    /// Installs `script` as a new version.
    ///
    /// The manifest is cached into the script's generation. On success the
    /// version activates at once when nothing blocks it, and otherwise waits
    /// (clients are told an update is available).
    ///
    /// # Errors
    ///
    /// Returns the caching error when install fails, or
    /// [`Error::InvalidState`] when a newer install superseded this one. The
    /// previously active version keeps serving in both cases.
    pub async fn register(&self, script: WorkerScript) -> Result<InstallOutcome> {
        let version = script.version.clone();
        let manifest = script.manifest.clone();
        let (id, changes) = self.registration.lock().await.begin_install(script);
        self.emit_changes(changes);
        log::info!("Installing {version} ({id}), caching {} entries", manifest.len());

        if let Err(e) = self
            .cache
            .populate(
                &version,
                &manifest,
                self.network.as_ref(),
                self.config.worker.install_concurrency,
            )
            .await
        {
            log::error!("Install of {version} failed: {e}");
            if let Ok(change) = self.registration.lock().await.install_failed(id) {
                self.emit(WorkerSignal::StateChange(change));
            }
            return Err(e);
        }

        let result = {
            let mut registration = self.registration.lock().await;
            if self.config.worker.skip_waiting_on_install {
                registration.skip_waiting();
            }
            let result = registration.install_succeeded(id);
            if result.is_err() {
                let in_use = [registration.active(), registration.waiting(), registration.installing()]
                    .into_iter()
                    .flatten()
                    .any(|w| w.version() == version);
                if !in_use && self.cache.evict(&version).await {
                    log::info!("Deleted cache {version} of superseded install");
                }
            }
            result
        };
        let (outcome, changes) = match result {
            Ok(installed) => installed,
            Err(e) => {
                log::warn!("Install of {version} was superseded: {e}");
                return Err(e);
            }
        };
        self.emit_changes(changes);

        match outcome {
            InstallOutcome::ReadyToActivate => {
                self.activate().await?;
            }
            InstallOutcome::Waiting => {
                log::info!("{version} installed, waiting for clients to close");
                self.emit(WorkerSignal::UpdateAvailable { version });
            }
        }
        Ok(outcome)
    }

    /// Activates the waiting version, if any: deletes every other cache
    /// generation, then takes control of all clients. Returns false when
    /// nothing was waiting.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] if the registration is inconsistent.
    pub async fn activate(&self) -> Result<bool> {
        let mut registration = self.registration.lock().await;
        let Some((script, changes)) = registration.begin_activation()? else {
            return Ok(false);
        };
        self.emit_changes(changes);

        let evicted = self.cache.evict_except(&script.version).await;
        if !evicted.is_empty() {
            log::info!("Evicted {} old cache generation(s)", evicted.len());
        }

        let change = registration.finish_activation()?;
        self.emit(WorkerSignal::StateChange(change));
        let claimed = registration.claim()?;
        drop(registration);

        log::info!("{} activated, controlling {} client(s)", script.version, claimed.len());
        if !claimed.is_empty() {
            self.emit(WorkerSignal::ControllerChange {
                version: script.version,
                reload: self.config.worker.reload_on_controller_change,
            });
        }
        Ok(true)
    }

    /// Returns the active cache generation.
    pub async fn active_version(&self) -> Option<String> {
        self.registration
            .lock()
            .await
            .active()
            .map(|w| w.version().to_string())
    }

    /// Handles a `fetch` event.
    ///
    /// Requests are ignored while no version is active. A write to the
    /// deferred-write endpoint that fails at the network layer is queued and
    /// answered `202 Accepted` when deferral is enabled, even when it was
    /// issued as a navigation.
    ///
    /// # Errors
    ///
    /// Returns the network error for failed non-navigation requests.
    pub async fn fetch(&self, request: &Request) -> Result<FetchDecision> {
        let controller = self
            .registration
            .lock()
            .await
            .active()
            .filter(|w| w.state() == WorkerState::Activated)
            .map(|w| (w.version().to_string(), w.script().offline_url.clone()));
        let Some((generation, offline_url)) = controller else {
            return Ok(FetchDecision::Ignored);
        };

        // Deferrable writes skip the fetch policy, navigations included.
        if self.config.sync.defer_failed_mutations && self.sync.is_deferrable(request) {
            return match self.network.fetch(request).await {
                Ok(response) => Ok(FetchDecision::Respond(response)),
                Err(e) => self.defer(request, e).await,
            };
        }

        self.fetch.intercept(&generation, &offline_url, request).await
    }

    async fn defer(&self, request: &Request, cause: Error) -> Result<FetchDecision> {
        let endpoint = match request.url.query() {
            Some(query) => format!("{}?{query}", request.url.path()),
            None => request.url.path().to_string(),
        };
        let body = request.body.clone().unwrap_or_default().to_vec();
        let header = |name: &str| request.headers.get(name).and_then(|v| v.to_str().ok());

        let mut mutation = match header(MUTATION_ID_HEADER) {
            Some(id) => QueuedMutation::with_id(id, endpoint, body),
            None => QueuedMutation::new(endpoint, body),
        };
        if let Some(content_type) = header(CONTENT_TYPE.as_str()) {
            mutation = mutation.with_content_type(content_type);
        }
        let id = mutation.id.clone();

        if let Err(e) = self.enqueue(mutation).await {
            log::error!("Could not queue {} for background sync: {e}", request.url);
            return Err(cause);
        }
        log::info!("Network unavailable, queued {} as {id}: {cause}", request.url);

        let body = serde_json::to_vec(&serde_json::json!({ "queued": true, "id": id }))?;
        Ok(FetchDecision::Respond(
            Response::new(202, body).with_content_type("application/json"),
        ))
    }

    /// Hands a mutation to the durable queue and records a sync registration
    /// for it. Returns false if its identifier was already queued.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the endpoint is not on the origin, or an
    /// error if the mutation could not be persisted.
    pub async fn enqueue(&self, mutation: QueuedMutation) -> Result<bool> {
        self.sync.resolve(&mutation.endpoint)?;
        let added = self.queue.enqueue(mutation).await?;
        self.sync.register(self.sync.tag()).await;
        Ok(added)
    }

    /// Records a sync registration for `tag`, and fires it right away when
    /// the origin is reachable.
    pub async fn register_sync(&self, tag: &str) -> Option<Vec<FlushResult>> {
        self.sync.register(tag).await;
        if self.is_online() {
            self.sync(tag).await
        } else {
            None
        }
    }

    /// Handles a `sync` event. Returns `None` for tags this worker ignores.
    pub async fn sync(&self, tag: &str) -> Option<Vec<FlushResult>> {
        let results = self.sync.handle_sync(tag, &self.queue).await?;
        let delivered = results.iter().filter(|r| r.is_delivered()).count();
        log::info!("Sync {tag}: {delivered} of {} mutation(s) delivered", results.len());
        self.emit(WorkerSignal::SyncComplete {
            tag: tag.to_string(),
            results: results.clone(),
        });
        Some(results)
    }

    /// Returns the pending sync tags.
    pub async fn pending_syncs(&self) -> Vec<String> {
        self.sync.pending_tags().await
    }

    /// Handles a `push` event by showing a notification.
    pub async fn push(&self, payload: Option<&str>) -> Notification {
        let notification = Notification::from_push(&self.config.notification, payload);
        self.notifications.show(notification.clone()).await;
        self.emit(WorkerSignal::Notification(notification.clone()));
        notification
    }

    /// Handles a `notificationclick` event.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] if the notification is not shown.
    pub async fn notification_click(&self, id: Uuid, action: Option<&str>) -> Result<ClickOutcome> {
        let outcome = self.notifications.click(id, action).await?;
        if let ClickOutcome::OpenWindow { url } = &outcome {
            self.emit(WorkerSignal::OpenWindow { url: url.clone() });
        }
        Ok(outcome)
    }

    /// Handles a `message` event.
    ///
    /// # Errors
    ///
    /// Returns an error if skip-waiting triggers an activation that fails.
    pub async fn message(&self, message: ClientMessage) -> Result<Option<VersionReply>> {
        match message {
            ClientMessage::SkipWaiting => {
                let waiting = self.registration.lock().await.skip_waiting();
                if waiting {
                    self.activate().await?;
                }
                Ok(None)
            }
            ClientMessage::GetVersion => Ok(Some(VersionReply {
                version: self.active_version().await,
            })),
        }
    }

    /// Opens a client. It is controlled by the active version, if any.
    pub async fn connect_client(&self) -> ClientId {
        let id = self.registration.lock().await.add_client();
        log::debug!("Client {id} connected");
        id
    }

    /// Closes a client. When the last client goes away a waiting version
    /// activates.
    ///
    /// # Errors
    ///
    /// Returns an error if that activation fails.
    pub async fn disconnect_client(&self, id: ClientId) -> Result<()> {
        let may_activate = self.registration.lock().await.remove_client(id);
        log::debug!("Client {id} disconnected");
        if may_activate {
            self.activate().await?;
        }
        Ok(())
    }

    /// Records whether the origin is reachable.
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Waits for all background work started so far.
    pub async fn settle(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }

    /// Returns a status snapshot.
    pub async fn status(&self) -> WorkerStatus {
        let (active, waiting, installing, clients) = {
            let registration = self.registration.lock().await;
            let version = |w: Option<&WorkerVersion>| w.map(|w| w.version().to_string());
            (
                version(registration.active()),
                version(registration.waiting()),
                version(registration.installing()),
                registration.client_count(),
            )
        };
        WorkerStatus {
            active,
            waiting,
            installing,
            clients,
            online: self.is_online(),
            pending_mutations: self.queue.len().await,
            pending_syncs: self.pending_syncs().await,
            caches: self.cache.stats().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::config::WorkerConfig;
    use crate::http::Url;
    use crate::network::mock::MockNetwork;
    use crate::store::MemoryQueueStore;

    const ORIGIN: &str = "http://app.test";
    const TAG: &str = "background-sync-vouchers";
    const ENDPOINT: &str = "http://app.test/vendor/create_vouchers";

    type TestWorker = ServiceWorker<MockNetwork, MemoryQueueStore>;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    fn config(version: &str, precache: &[&str]) -> AppConfig {
        AppConfig {
            worker: WorkerConfig::new()
                .with_version(version)
                .with_origin(ORIGIN)
                .with_precache(precache.iter().map(ToString::to_string).collect()),
            ..AppConfig::default()
        }
    }

    fn shell() -> Vec<&'static str> {
        vec!["/", "/static/css/dashboard.css", "/pwa-offline"]
    }

    fn network() -> Arc<MockNetwork> {
        let network = Arc::new(MockNetwork::new());
        network.route("http://app.test/", Response::new(200, "<html>home</html>"));
        network.route("http://app.test/static/css/dashboard.css", Response::new(200, "body{}"));
        network.route("http://app.test/pwa-offline", Response::new(200, "<html>offline</html>"));
        network
    }

    async fn worker(network: &Arc<MockNetwork>) -> TestWorker {
        ServiceWorker::new(config("v1", &shell()), Arc::clone(network), MemoryQueueStore::new())
            .await
            .unwrap()
    }

    async fn installed(network: &Arc<MockNetwork>) -> TestWorker {
        let worker = worker(network).await;
        let script = worker.config().worker.script().unwrap();
        worker.register(script).await.unwrap();
        worker
    }

    fn script(version: &str, precache: &[&str]) -> WorkerScript {
        config(version, precache).worker.script().unwrap()
    }

    fn drain(rx: &mut broadcast::Receiver<WorkerSignal>) -> Vec<WorkerSignal> {
        std::iter::from_fn(|| rx.try_recv().ok()).collect()
    }

    #[tokio::test]
    async fn install_and_activate_caches_every_manifest_url() {
        let network = network();
        let worker = worker(&network).await;
        let script = worker.config().worker.script().unwrap();
        let manifest = script.manifest.clone();

        let outcome = worker.register(script).await.unwrap();

        assert_eq!(outcome, InstallOutcome::ReadyToActivate);
        assert_eq!(worker.active_version().await.as_deref(), Some("v1"));
        for entry in manifest {
            let cached = worker.cache().lookup("v1", &Request::get(entry.clone())).await;
            assert_eq!(cached.map(|r| r.status), Some(200), "{entry} missing");
        }
    }

    #[tokio::test]
    async fn failed_install_keeps_previous_generation() {
        let network = network();
        let worker = installed(&network).await;
        network.route("http://app.test/static/js/new.js", Response::new(200, "new"));
        network.fail("http://app.test/static/js/broken.js");

        let result = worker
            .register(script("v2", &["/static/js/new.js", "/static/js/broken.js"]))
            .await;

        assert!(matches!(result, Err(Error::CacheWrite { .. })));
        assert_eq!(worker.active_version().await.as_deref(), Some("v1"));
        assert_eq!(worker.cache().generations().await, vec!["v1"]);
        let home = Request::get(url("http://app.test/"));
        assert!(worker.cache().lookup("v1", &home).await.is_some());
        assert!(worker.status().await.installing.is_none());
    }

    #[tokio::test]
    async fn upgrade_waits_for_clients_then_leaves_one_generation() {
        let network = network();
        network.route("http://app.test/static/js/old.js", Response::new(200, "old"));
        let worker = worker(&network).await;
        worker
            .register(script("v1", &["/", "/pwa-offline", "/static/js/old.js"]))
            .await
            .unwrap();
        let client = worker.connect_client().await;
        let mut rx = worker.subscribe();

        let outcome = worker.register(script("v2", &shell())).await.unwrap();

        assert_eq!(outcome, InstallOutcome::Waiting);
        assert_eq!(worker.active_version().await.as_deref(), Some("v1"));
        assert_eq!(worker.cache().generations().await, vec!["v1", "v2"]);
        assert!(
            drain(&mut rx)
                .iter()
                .any(|s| matches!(s, WorkerSignal::UpdateAvailable { version } if version == "v2"))
        );

        worker.disconnect_client(client).await.unwrap();

        assert_eq!(worker.active_version().await.as_deref(), Some("v2"));
        assert_eq!(worker.cache().generations().await, vec!["v2"]);
        let old = Request::get(url("http://app.test/static/js/old.js"));
        assert!(worker.cache().lookup("v2", &old).await.is_none());
        assert!(worker.cache().lookup("v1", &old).await.is_none());
    }

    #[tokio::test]
    async fn superseded_install_leaves_no_generation_behind() {
        let network = network();
        let worker = installed(&network).await;
        worker.connect_client().await;
        network.set_delay(Duration::from_millis(20));

        let (v2, v3) = tokio::join!(
            worker.register(script("v2", &shell())),
            worker.register(script("v3", &shell())),
        );

        assert!(matches!(v2, Err(Error::InvalidState(_))));
        assert_eq!(v3.unwrap(), InstallOutcome::Waiting);
        assert_eq!(worker.cache().generations().await, vec!["v1", "v3"]);
        assert_eq!(worker.status().await.waiting.as_deref(), Some("v3"));
    }

    #[tokio::test]
    async fn register_runs_on_a_spawned_task() {
        let network = network();
        let worker = Arc::new(worker(&network).await);
        let script = worker.config().worker.script().unwrap();

        let task = tokio::spawn({
            let worker = Arc::clone(&worker);
            async move { worker.register(script).await }
        });

        assert_eq!(task.await.unwrap().unwrap(), InstallOutcome::ReadyToActivate);
        assert_eq!(worker.active_version().await.as_deref(), Some("v1"));
    }

    #[tokio::test]
    async fn skip_waiting_activates_and_tells_clients_to_reload() {
        let network = network();
        let worker = installed(&network).await;
        let client = worker.connect_client().await;
        worker.register(script("v2", &shell())).await.unwrap();
        let mut rx = worker.subscribe();

        let reply = worker.message(ClientMessage::SkipWaiting).await.unwrap();

        assert!(reply.is_none());
        assert_eq!(worker.active_version().await.as_deref(), Some("v2"));
        assert_eq!(worker.cache().generations().await, vec!["v2"]);
        let signals = drain(&mut rx);
        assert!(signals.iter().any(|s| matches!(
            s,
            WorkerSignal::ControllerChange { version, reload: true } if version == "v2"
        )));
        let registration = worker.registration.lock().await;
        let active = registration.active().unwrap().id();
        assert_eq!(registration.controller_of(client), Some(active));
    }

    #[tokio::test]
    async fn skip_waiting_without_waiting_version_is_a_no_op() {
        let network = network();
        let worker = installed(&network).await;
        assert!(worker.message(ClientMessage::SkipWaiting).await.unwrap().is_none());
        assert_eq!(worker.active_version().await.as_deref(), Some("v1"));
    }

    #[tokio::test]
    async fn skip_waiting_on_install_ignores_clients() {
        let network = network();
        let mut eager = config("v1", &shell());
        eager.worker = eager.worker.with_skip_waiting_on_install(true);
        let worker: TestWorker = ServiceWorker::new(eager, Arc::clone(&network), MemoryQueueStore::new())
            .await
            .unwrap();
        worker.register(script("v1", &shell())).await.unwrap();
        worker.connect_client().await;

        let outcome = worker.register(script("v2", &shell())).await.unwrap();

        assert_eq!(outcome, InstallOutcome::ReadyToActivate);
        assert_eq!(worker.active_version().await.as_deref(), Some("v2"));
    }

    #[tokio::test]
    async fn get_version_replies_with_active_generation() {
        let network = network();
        let worker = worker(&network).await;
        let message: ClientMessage = serde_json::from_str(r#"{"type":"GET_VERSION"}"#).unwrap();

        let before = worker.message(message).await.unwrap().unwrap();
        assert_eq!(before.version, None);

        worker.register(script("v1", &shell())).await.unwrap();
        let reply = worker.message(message).await.unwrap().unwrap();
        assert_eq!(serde_json::to_string(&reply).unwrap(), r#"{"version":"v1"}"#);
    }

    #[test]
    fn skip_waiting_message_parses() {
        let message: ClientMessage = serde_json::from_str(r#"{"type":"SKIP_WAITING"}"#).unwrap();
        assert_eq!(message, ClientMessage::SkipWaiting);
        assert!(serde_json::from_str::<ClientMessage>(r#"{"type":"RELOAD"}"#).is_err());
    }

    #[tokio::test]
    async fn requests_are_ignored_until_a_version_is_active() {
        let network = network();
        let worker = worker(&network).await;
        let decision = worker.fetch(&Request::get(url("http://app.test/"))).await.unwrap();
        assert!(matches!(decision, FetchDecision::Ignored));
        assert_eq!(network.calls(), 0);
    }

    #[tokio::test]
    async fn cached_asset_is_served_without_network() {
        let network = network();
        let worker = installed(&network).await;
        let calls = network.calls();

        let response = worker
            .fetch(&Request::get(url("http://app.test/static/css/dashboard.css")))
            .await
            .unwrap()
            .into_response()
            .unwrap();

        assert_eq!(response.body, "body{}");
        assert_eq!(network.calls(), calls);
    }

    #[tokio::test]
    async fn uncached_asset_is_fetched_and_then_cached() {
        let network = network();
        let worker = installed(&network).await;
        network.route("http://app.test/static/js/auto-sync.js", Response::new(200, "poll()"));
        let request = Request::get(url("http://app.test/static/js/auto-sync.js"));

        let response = worker.fetch(&request).await.unwrap().into_response().unwrap();
        assert_eq!(response.body, "poll()");

        worker.settle().await;
        let cached = worker.cache().lookup("v1", &request).await.unwrap();
        assert_eq!(cached.body, "poll()");
    }

    #[tokio::test]
    async fn failed_navigation_returns_offline_page() {
        let network = network();
        let worker = installed(&network).await;
        network.set_offline(true);

        let response = worker
            .fetch(&Request::navigate(url("http://app.test/vendor/vouchers")))
            .await
            .unwrap()
            .into_response()
            .unwrap();

        assert_eq!(response.status, 200);
        assert_eq!(response.body, "<html>offline</html>");
    }

    #[tokio::test]
    async fn concurrent_fetches_leave_an_intact_entry() {
        let network = network();
        let worker = installed(&network).await;
        network.route("http://app.test/static/css/themes.css", Response::new(200, ":root{}"));
        network.set_delay(Duration::from_millis(25));
        let request = Request::get(url("http://app.test/static/css/themes.css"));

        let (a, b) = tokio::join!(worker.fetch(&request), worker.fetch(&request));
        assert_eq!(a.unwrap().into_response().unwrap().body, ":root{}");
        assert_eq!(b.unwrap().into_response().unwrap().body, ":root{}");
        worker.settle().await;

        let cached = worker.cache().lookup("v1", &request).await.unwrap();
        assert_eq!(cached.status, 200);
        assert_eq!(cached.body, ":root{}");
    }

    #[tokio::test]
    async fn enqueue_then_sync_delivers_identical_payload() {
        let network = network();
        let worker = installed(&network).await;
        network.route(ENDPOINT, Response::new(200, r#"{"success": true}"#));
        let body = br#"{"plan_id": 4, "quantity": 25}"#.to_vec();

        worker
            .enqueue(QueuedMutation::with_id("m1", "/vendor/create_vouchers", body.clone()))
            .await
            .unwrap();
        assert_eq!(worker.pending_syncs().await, vec![TAG]);

        let results = worker.sync(TAG).await.unwrap();

        assert_eq!(results, vec![FlushResult::Delivered { id: "m1".into() }]);
        assert!(worker.queue().is_empty().await);
        assert!(worker.pending_syncs().await.is_empty());
        let sent = network.requests().into_iter().find(|r| r.url.as_str() == ENDPOINT).unwrap();
        assert_eq!(sent.body.as_deref(), Some(body.as_slice()));
    }

    #[tokio::test]
    async fn only_failed_mutations_are_retried() {
        let network = network();
        let worker = installed(&network).await;
        network.route("http://app.test/vendor/create_vouchers?batch=1", Response::new(500, ""));
        network.route("http://app.test/vendor/create_vouchers?batch=2", Response::new(200, ""));
        for (id, endpoint) in [
            ("first", "/vendor/create_vouchers?batch=1"),
            ("second", "/vendor/create_vouchers?batch=2"),
        ] {
            worker
                .enqueue(QueuedMutation::with_id(id, endpoint, b"{}".to_vec()))
                .await
                .unwrap();
        }

        worker.sync(TAG).await.unwrap();
        let pending: Vec<_> = worker.queue().pending().await.into_iter().map(|m| m.id).collect();
        assert_eq!(pending, vec!["first"]);

        let before = network.requests().len();
        worker.sync(TAG).await.unwrap();
        let retried: Vec<_> = network.requests()[before..].iter().map(|r| r.url.to_string()).collect();
        assert_eq!(retried, vec!["http://app.test/vendor/create_vouchers?batch=1"]);
    }

    #[tokio::test]
    async fn failed_write_to_endpoint_is_deferred() {
        let network = network();
        let worker = installed(&network).await;
        network.fail(ENDPOINT);

        let request = Request::post_json(url(ENDPOINT), r#"{"plan_id": 1}"#)
            .with_header(MUTATION_ID_HEADER, "form-42");
        let response = worker.fetch(&request).await.unwrap().into_response().unwrap();

        assert_eq!(response.status, 202);
        let json: serde_json::Value = serde_json::from_slice(&response.body).unwrap();
        assert_eq!(json["id"], "form-42");
        assert_eq!(worker.queue().len().await, 1);
        assert_eq!(worker.pending_syncs().await, vec![TAG]);

        // Resubmitting the same form does not queue it twice.
        worker.fetch(&request).await.unwrap();
        assert_eq!(worker.queue().len().await, 1);

        network.heal(ENDPOINT);
        network.route(ENDPOINT, Response::new(201, ""));
        let results = worker.sync(TAG).await.unwrap();
        assert!(results[0].is_delivered());
        let delivered = network.requests().into_iter().last().unwrap();
        assert_eq!(delivered.body.as_deref(), Some(&br#"{"plan_id": 1}"#[..]));
    }

    #[tokio::test]
    async fn offline_form_navigation_to_endpoint_is_deferred() {
        let network = network();
        let worker = installed(&network).await;
        network.set_offline(true);
        let mut request = Request::post_json(url(ENDPOINT), r#"{"plan_id": 3}"#);
        request.mode = crate::http::RequestMode::Navigate;

        let response = worker.fetch(&request).await.unwrap().into_response().unwrap();

        assert_eq!(response.status, 202);
        assert_eq!(worker.queue().len().await, 1);
    }

    #[tokio::test]
    async fn offline_form_navigation_elsewhere_gets_offline_page() {
        let network = network();
        let worker = installed(&network).await;
        network.set_offline(true);
        let mut request = Request::post_json(url("http://app.test/login"), "user=a");
        request.mode = crate::http::RequestMode::Navigate;

        let response = worker.fetch(&request).await.unwrap().into_response().unwrap();

        assert_eq!(response.status, 200);
        assert_eq!(response.body, "<html>offline</html>");
        assert!(worker.queue().is_empty().await);
    }

    #[tokio::test]
    async fn failed_write_elsewhere_is_surfaced() {
        let network = network();
        let worker = installed(&network).await;
        network.fail("http://app.test/vendor/delete_plan");

        let request = Request::post_json(url("http://app.test/vendor/delete_plan"), "{}");
        assert!(worker.fetch(&request).await.is_err());
        assert!(worker.queue().is_empty().await);
    }

    #[tokio::test]
    async fn off_origin_endpoint_is_rejected() {
        let network = network();
        let worker = installed(&network).await;

        for endpoint in ["https://evil.test/steal", "//evil.test/steal"] {
            let result = worker.enqueue(QueuedMutation::new(endpoint, b"{}".to_vec())).await;
            assert!(matches!(result, Err(Error::Config(_))), "{endpoint} accepted");
        }
        assert!(worker.queue().is_empty().await);
        assert!(worker.pending_syncs().await.is_empty());
    }

    #[tokio::test]
    async fn unwritable_state_dir_still_queues_writes() {
        let dir = tempfile::TempDir::new().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, "").unwrap();
        let mut config = config("v1", &shell());
        config.paths.state_dir = blocker.join("state");

        let worker = ServiceWorker::from_config(config).await.unwrap();
        let added = worker
            .enqueue(QueuedMutation::new("/vendor/create_vouchers", b"{}".to_vec()))
            .await
            .unwrap();

        assert!(added);
        assert_eq!(worker.queue().len().await, 1);
    }

    #[tokio::test]
    async fn unreadable_queue_file_is_moved_aside() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join("queue.toml"), "garbage = [").unwrap();
        let mut config = config("v1", &shell());
        config.paths.state_dir = dir.path().to_path_buf();

        let worker = ServiceWorker::from_config(config).await.unwrap();

        assert!(worker.queue().is_empty().await);
        assert!(dir.path().join("queue.toml.corrupt").exists());
    }

    #[tokio::test]
    async fn restored_queue_registers_sync() {
        let store = MemoryQueueStore::new();
        store
            .save(&[QueuedMutation::with_id("old", "/vendor/create_vouchers", b"{}".to_vec())])
            .await
            .unwrap();
        let worker: TestWorker = ServiceWorker::new(config("v1", &shell()), network(), store)
            .await
            .unwrap();
        assert_eq!(worker.pending_syncs().await, vec![TAG]);
    }

    #[tokio::test]
    async fn register_sync_fires_only_when_online() {
        let network = network();
        let worker = installed(&network).await;
        network.route(ENDPOINT, Response::new(200, ""));
        worker.queue().enqueue(QueuedMutation::new("/vendor/create_vouchers", b"{}".to_vec())).await.unwrap();

        worker.set_online(false);
        assert!(worker.register_sync(TAG).await.is_none());
        assert_eq!(worker.queue().len().await, 1);

        worker.set_online(true);
        let results = worker.register_sync(TAG).await.unwrap();
        assert!(results[0].is_delivered());
    }

    #[tokio::test]
    async fn push_and_click_open_the_app() {
        let network = network();
        let worker = installed(&network).await;
        let mut rx = worker.subscribe();

        let notification = worker.push(Some("Vouchers synced")).await;
        let outcome = worker.notification_click(notification.id, Some("explore")).await.unwrap();

        assert_eq!(outcome, ClickOutcome::OpenWindow { url: "/".into() });
        let kinds: Vec<_> = drain(&mut rx).iter().map(WorkerSignal::kind).collect();
        assert_eq!(kinds, vec!["notification", "open_window"]);
    }

    #[test]
    fn signals_serialize_with_type_tag() {
        let signal = WorkerSignal::ControllerChange {
            version: "v2".into(),
            reload: true,
        };
        let json = serde_json::to_value(&signal).unwrap();
        assert_eq!(json["type"], signal.kind());
        assert_eq!(json["version"], "v2");
    }
}
