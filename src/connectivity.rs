//! Connectivity monitor: checks the origin and fires background syncs when
//! it becomes reachable.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::http::Request;
use crate::network::Network;
use crate::store::QueueStore;
use crate::worker::ServiceWorker;

/// Change in reachability between two checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    WentOnline,
    WentOffline,
    StillOnline,
    StillOffline,
}

impl Transition {
    /// Returns true if the origin is reachable after this transition.
    #[must_use]
    pub const fn is_online(self) -> bool {
        matches!(self, Self::WentOnline | Self::StillOnline)
    }
}

/// Tracks reachability across checks. The first check is compared against
/// offline, so a reachable origin at startup counts as coming online.
#[derive(Debug, Default)]
pub struct Connectivity {
    online: bool,
}

impl Connectivity {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a check result.
    pub const fn observe(&mut self, online: bool) -> Transition {
        let transition = match (self.online, online) {
            (false, true) => Transition::WentOnline,
            (true, false) => Transition::WentOffline,
            (true, true) => Transition::StillOnline,
            (false, false) => Transition::StillOffline,
        };
        self.online = online;
        transition
    }
}

/// Returns true if the origin answers a `HEAD /` with any HTTP status.
pub async fn is_reachable<N: Network + ?Sized>(network: &N, origin: &crate::http::Url) -> bool {
    network.fetch(&Request::head(origin.clone())).await.is_ok()
}

/// Checks once and fires a sync for every pending tag while the origin is
/// reachable. Returns the transition observed.
pub async fn tick<N: Network, S: QueueStore>(
    worker: &ServiceWorker<N, S>,
    state: &mut Connectivity,
) -> Transition {
    let online = match worker.config().worker.origin_url() {
        Ok(origin) => is_reachable(worker.network().as_ref(), &origin).await,
        Err(e) => {
            log::error!("Cannot check origin: {e}");
            false
        }
    };
    let transition = state.observe(online);
    worker.set_online(online);

    match transition {
        Transition::WentOnline => log::info!("Origin reachable"),
        Transition::WentOffline => log::warn!("Origin unreachable, writes will be queued"),
        Transition::StillOnline | Transition::StillOffline => {}
    }

    if transition.is_online() {
        for tag in worker.pending_syncs().await {
            worker.sync(&tag).await;
        }
    }
    transition
}

/// Runs the monitor until `cancel` fires.
pub async fn run<N, S>(worker: Arc<ServiceWorker<N, S>>, interval: Duration, cancel: CancellationToken)
where
    N: Network,
    S: QueueStore,
{
    let mut state = Connectivity::new();
    let mut ticker = tokio::time::interval(interval.max(Duration::from_secs(1)));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                log::debug!("Connectivity monitor stopped");
                break;
            }
            _ = ticker.tick() => {
                tick(&worker, &mut state).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AppConfig, WorkerConfig};
    use crate::http::Response;
    use crate::network::mock::MockNetwork;
    use crate::queue::QueuedMutation;
    use crate::store::MemoryQueueStore;

    #[test]
    fn transitions() {
        let mut state = Connectivity::new();
        assert_eq!(state.observe(false), Transition::StillOffline);
        assert_eq!(state.observe(true), Transition::WentOnline);
        assert_eq!(state.observe(true), Transition::StillOnline);
        assert_eq!(state.observe(false), Transition::WentOffline);
    }

    async fn worker(network: &Arc<MockNetwork>) -> ServiceWorker<MockNetwork, MemoryQueueStore> {
        let config = AppConfig {
            worker: WorkerConfig::new()
                .with_origin("http://app.test")
                .with_precache(Vec::new()),
            ..AppConfig::default()
        };
        ServiceWorker::new(config, Arc::clone(network), MemoryQueueStore::new())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn coming_online_flushes_the_queue() {
        let network = Arc::new(MockNetwork::new());
        network.route("http://app.test/", Response::new(200, ""));
        network.route("http://app.test/vendor/create_vouchers", Response::new(200, ""));
        let worker = worker(&network).await;
        worker
            .enqueue(QueuedMutation::new("/vendor/create_vouchers", b"{}".to_vec()))
            .await
            .unwrap();
        let mut state = Connectivity::new();

        network.set_offline(true);
        assert_eq!(tick(&worker, &mut state).await, Transition::StillOffline);
        assert!(!worker.is_online());
        assert_eq!(worker.queue().len().await, 1);

        network.set_offline(false);
        assert_eq!(tick(&worker, &mut state).await, Transition::WentOnline);
        assert!(worker.queue().is_empty().await);
        assert!(worker.pending_syncs().await.is_empty());
    }

    #[tokio::test]
    async fn any_http_status_counts_as_online() {
        let network = MockNetwork::new();
        let origin = crate::http::Url::parse("http://app.test").unwrap();
        assert!(is_reachable(&network, &origin).await);
        network.set_offline(true);
        assert!(!is_reachable(&network, &origin).await);
    }

    #[tokio::test]
    async fn run_stops_on_cancel() {
        let network = Arc::new(MockNetwork::new());
        let worker = Arc::new(worker(&network).await);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run(worker, Duration::from_secs(1), cancel.clone()));
        cancel.cancel();
        handle.await.unwrap();
    }
}
