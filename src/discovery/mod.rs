//! Container discovery.
//!
//! Containers reported by the runtime are classified into a (domain, service)
//! pair and fed to the [`ContainerTracker`]. Live events drive the tracker
//! between full scans; the scans catch up on whatever the events missed.

mod container;
mod matcher;
mod rules;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::mpsc;

use crate::runtime::{ContainerEvent, ContainerEventKind, ContainerFilter, ContainerRuntime};
use crate::tracker::{ContainerState, ContainerTracker, HostContainerStates, TrackerError};

pub use container::{Container, ContainerPort};
pub use matcher::{DEFAULT_DOMAIN_KEY, DiscoveryContainerMatcher, service_key};
pub use rules::{MatchError, WatchContainerSpec};

const RECONNECT_DELAY: Duration = Duration::from_secs(5);

pub struct Discovery {
    matcher: Arc<DiscoveryContainerMatcher>,
    tracker: ContainerTracker,
    runtime: Arc<dyn ContainerRuntime>,
}

impl Discovery {
    pub fn new(
        matcher: Arc<DiscoveryContainerMatcher>,
        tracker: ContainerTracker,
        runtime: Arc<dyn ContainerRuntime>,
    ) -> Self {
        Self {
            matcher,
            tracker,
            runtime,
        }
    }

    /// Reconciles the tracker with the full container population of the
    /// host. Tracked containers the runtime no longer reports are removed.
    pub async fn scan(&self) -> Result<usize, crate::runtime::RuntimeError> {
        let filter = ContainerFilter {
            all: true,
            labels: Vec::new(),
        };
        let containers = self.runtime.find_containers(&filter).await?;

        let mut seen = HashSet::new();
        let mut classified = 0;
        for container in &containers {
            seen.insert(container.id.clone());
            let Some(classification) = self.matcher.match_container(container) else {
                continue;
            };
            let service = classification.key();
            classified += 1;
            if let Err(e) = self.settle(&service, container) {
                log::warn!("Discovery of {}: {}", container.short_id(), e);
            }
        }

        for service in self.tracker.services() {
            for gone in self.tracked(&service) {
                if seen.contains(&gone.id) {
                    continue;
                }
                if let Err(e) = self.tracker.removed(&service, &gone) {
                    log::warn!("Discovery of {}: {}", gone.short_id(), e);
                }
            }
        }

        log::debug!(
            "Scan found {} containers, {} classified",
            containers.len(),
            classified
        );
        Ok(classified)
    }

    /// Applies one runtime event to the tracker.
    pub async fn observe(&self, event: &ContainerEvent) -> Result<(), TrackerError> {
        let container = match event.kind {
            ContainerEventKind::Destroy => event.snapshot(),
            ContainerEventKind::Other(_) => return Ok(()),
            // Events carry no environment, which classification may need
            _ => match self.runtime.inspect_container(&event.id).await {
                Ok(Some(container)) => container,
                Ok(None) => event.snapshot(),
                Err(e) => {
                    log::warn!("Failed to inspect container {}: {}", event.id, e);
                    event.snapshot()
                }
            },
        };

        let Some(classification) = self.matcher.match_container(&container) else {
            if event.kind == ContainerEventKind::Destroy {
                self.tracker.forget(&event.id);
            }
            return Ok(());
        };
        let service = classification.key();

        let current = self.tracker.current_state(&service, &container.id);
        match event.kind {
            ContainerEventKind::Create => self.tracker.starting(&service, &container),
            ContainerEventKind::Start => self.tracker.running(&service, &container),
            ContainerEventKind::Kill if current == Some(ContainerState::Running) => {
                self.tracker.stopping(&service, &container)
            }
            ContainerEventKind::Die => {
                let stopping = current == Some(ContainerState::Stopping);
                let clean = container.exit_code == Some(0)
                    && current != Some(ContainerState::Starting);
                if stopping || clean {
                    self.tracker.stopped(&service, &container)
                } else {
                    self.tracker.died(&service, &container)
                }
            }
            ContainerEventKind::Destroy => self.tracker.removed(&service, &container),
            // A stop follows the die that already settled the machine
            ContainerEventKind::Kill | ContainerEventKind::Stop | ContainerEventKind::Other(_) => {
                Ok(())
            }
        }
    }

    /// Follows runtime events until `true` arrives on `stop`, rescanning every
    /// `scan_every`. A broken event stream triggers a reconnect.
    pub async fn watch(self: Arc<Self>, scan_every: Duration, mut stop: mpsc::Receiver<bool>) {
        log::info!("Discovery started");
        let mut events = self.runtime.events();
        let mut rescan = tokio::time::interval(scan_every);

        loop {
            tokio::select! {
                maybe_stop = stop.recv() => {
                    if maybe_stop.unwrap_or(true) {
                        break;
                    }
                }
                maybe_event = events.next() => {
                    match maybe_event {
                        Some(Ok(event)) => {
                            if let Err(e) = self.observe(&event).await {
                                log::warn!("Event {:?} for {}: {}", event.kind, event.id, e);
                            }
                        }
                        Some(Err(e)) => {
                            log::warn!("Container event stream failed: {}", e);
                            events = self.resubscribe().await;
                        }
                        None => {
                            log::warn!("Container event stream ended");
                            events = self.resubscribe().await;
                        }
                    }
                }
                _ = rescan.tick() => {
                    if let Err(e) = self.scan().await {
                        log::warn!("Container scan failed: {}", e);
                    }
                }
            }
        }
        log::info!("Discovery stopped");
    }

    async fn resubscribe(&self) -> crate::runtime::ContainerEvents {
        tokio::time::sleep(RECONNECT_DELAY).await;
        if let Err(e) = self.runtime.reconnect() {
            log::error!(target: "herdsman::exception", "Reconnect to the container runtime failed: {}", e);
        }
        // Missed events are recovered by the scan right after
        if let Err(e) = self.scan().await {
            log::warn!("Container scan failed: {}", e);
        }
        self.runtime.events()
    }

    /// Moves the machine of `container` to the state the runtime reports,
    /// unless it is already there.
    fn settle(&self, service: &str, container: &Container) -> Result<(), TrackerError> {
        let current = self.tracker.current_state(service, &container.id);
        if container.running {
            return match current {
                Some(ContainerState::Running) => Ok(()),
                _ => self.tracker.running(service, container),
            };
        }
        match current {
            Some(ContainerState::Stopped | ContainerState::Failed) => Ok(()),
            // Created but never started
            Some(ContainerState::Starting) | None if container.started_at.is_none() => Ok(()),
            Some(ContainerState::Running | ContainerState::Stopping) | None
                if container.exit_code == Some(0) =>
            {
                self.tracker.stopped(service, container)
            }
            _ => self.tracker.died(service, container),
        }
    }

    fn tracked(&self, service: &str) -> Vec<Container> {
        let mut tracked = Vec::new();
        self.tracker.visit_versions(service, &mut |group| {
            tracked.extend(group.instances().map(|fsm| Container {
                id: fsm.custom_data().clone(),
                image: group.image().to_string(),
                ..Default::default()
            }));
        });
        tracked
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::fake::FakeRuntime;
    use chrono::{TimeZone, Utc};
    use std::collections::HashMap;

    const SERVICE: &str = "ops/infradash";

    fn matcher() -> Arc<DiscoveryContainerMatcher> {
        let spec: WatchContainerSpec = toml::from_str(
            r#"
            image = { repository = "infradash/infradash" }
            match_all = [{ labels = { DASH_SERVICE = "infradash" } }]
        "#,
        )
        .unwrap();
        let mut matcher = DiscoveryContainerMatcher::default();
        matcher.add_rule("ops", "infradash", &spec).unwrap();
        Arc::new(matcher)
    }

    fn container(id: &str, running: bool, exit_code: Option<i64>) -> Container {
        Container {
            id: id.to_string(),
            name: format!("infradash-{id}"),
            image: "infradash/infradash:develop-1.1".to_string(),
            labels: HashMap::from([("DASH_SERVICE".to_string(), "infradash".to_string())]),
            running,
            exit_code,
            started_at: Some(Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap()),
            ..Default::default()
        }
    }

    fn discovery(containers: Vec<Container>) -> (Discovery, ContainerTracker, Arc<FakeRuntime>) {
        let runtime = Arc::new(FakeRuntime::default());
        *runtime.containers.lock().unwrap() = containers;
        let tracker = ContainerTracker::new();
        let discovery = Discovery::new(matcher(), tracker.clone(), runtime.clone());
        (discovery, tracker, runtime)
    }

    fn event(id: &str, kind: ContainerEventKind) -> ContainerEvent {
        ContainerEvent {
            id: id.to_string(),
            kind,
            attributes: HashMap::from([
                (
                    "image".to_string(),
                    "infradash/infradash:develop-1.1".to_string(),
                ),
                ("DASH_SERVICE".to_string(), "infradash".to_string()),
            ]),
        }
    }

    #[tokio::test]
    async fn test_scan_tracks_matching_containers() {
        let mut stranger = container("300", true, None);
        stranger.labels.clear();
        let (discovery, tracker, _) = discovery(vec![
            container("110", true, None),
            container("120", false, Some(1)),
            stranger,
        ]);

        assert_eq!(discovery.scan().await.unwrap(), 2);
        assert_eq!(
            tracker.current_state(SERVICE, "110"),
            Some(ContainerState::Running)
        );
        assert_eq!(
            tracker.current_state(SERVICE, "120"),
            Some(ContainerState::Failed)
        );

        // A second pass leaves settled machines alone
        assert_eq!(discovery.scan().await.unwrap(), 2);
        let fsm = tracker
            .instances(SERVICE, "infradash/infradash:develop-1.1")
            .into_iter()
            .find(|fsm| fsm.custom_data() == "120")
            .unwrap();
        assert_eq!(fsm.history().len(), 2);
    }

    #[tokio::test]
    async fn test_same_service_in_two_domains_is_tracked_apart() {
        let spec: WatchContainerSpec =
            toml::from_str(r#"image = { repository = "infradash/infradash" }"#).unwrap();
        let mut matcher = DiscoveryContainerMatcher::default();
        matcher.add_rule("ops", "infradash", &spec).unwrap();
        matcher.add_rule("prod", "infradash", &spec).unwrap();

        let mut ops = container("110", true, None);
        ops.labels.insert("DASH_DOMAIN".to_string(), "ops".to_string());
        let mut prod = container("210", true, None);
        prod.image = "infradash/infradash:develop-1.5".to_string();
        prod.labels.insert("DASH_DOMAIN".to_string(), "prod".to_string());

        let runtime = Arc::new(FakeRuntime::default());
        *runtime.containers.lock().unwrap() = vec![ops, prod];
        let tracker = ContainerTracker::new();
        let discovery = Discovery::new(Arc::new(matcher), tracker.clone(), runtime);
        assert_eq!(discovery.scan().await.unwrap(), 2);

        assert_eq!(tracker.count_versions(SERVICE), 1);
        assert_eq!(tracker.count_versions("prod/infradash"), 1);
        assert_eq!(tracker.current_state(SERVICE, "210"), None);
        assert_eq!(
            tracker.current_state("prod/infradash", "210"),
            Some(ContainerState::Running)
        );
    }

    #[tokio::test]
    async fn test_scan_removes_vanished_containers() {
        let (discovery, tracker, runtime) = discovery(vec![container("110", true, None)]);
        discovery.scan().await.unwrap();

        runtime.containers.lock().unwrap().clear();
        discovery.scan().await.unwrap();

        assert_eq!(tracker.current_state(SERVICE, "110"), None);
        assert_eq!(tracker.count_versions(SERVICE), 0);
    }

    #[tokio::test]
    async fn test_observe_lifecycle() {
        let (discovery, tracker, runtime) = discovery(vec![container("110", false, None)]);

        discovery
            .observe(&event("110", ContainerEventKind::Create))
            .await
            .unwrap();
        assert_eq!(
            tracker.current_state(SERVICE, "110"),
            Some(ContainerState::Starting)
        );

        runtime.containers.lock().unwrap()[0].running = true;
        discovery
            .observe(&event("110", ContainerEventKind::Start))
            .await
            .unwrap();
        assert_eq!(
            tracker.current_state(SERVICE, "110"),
            Some(ContainerState::Running)
        );

        discovery
            .observe(&event("110", ContainerEventKind::Kill))
            .await
            .unwrap();
        {
            let mut containers = runtime.containers.lock().unwrap();
            containers[0].running = false;
            containers[0].exit_code = Some(143);
        }
        discovery
            .observe(&event("110", ContainerEventKind::Die))
            .await
            .unwrap();
        assert_eq!(
            tracker.current_state(SERVICE, "110"),
            Some(ContainerState::Stopped)
        );

        discovery
            .observe(&event("110", ContainerEventKind::Stop))
            .await
            .unwrap();
        runtime.containers.lock().unwrap().clear();
        discovery
            .observe(&event("110", ContainerEventKind::Destroy))
            .await
            .unwrap();
        assert_eq!(tracker.current_state(SERVICE, "110"), None);
    }

    #[tokio::test]
    async fn test_unexpected_exit_is_a_failure() {
        let (discovery, tracker, runtime) = discovery(vec![container("110", true, None)]);
        discovery.scan().await.unwrap();

        {
            let mut containers = runtime.containers.lock().unwrap();
            containers[0].running = false;
            containers[0].exit_code = Some(1);
        }
        discovery
            .observe(&event("110", ContainerEventKind::Die))
            .await
            .unwrap();
        assert_eq!(
            tracker.current_state(SERVICE, "110"),
            Some(ContainerState::Failed)
        );
    }

    #[tokio::test]
    async fn test_scan_skips_containers_never_started() {
        let mut created = container("110", false, Some(0));
        created.started_at = None;
        let (discovery, tracker, _) = discovery(vec![created]);

        assert_eq!(discovery.scan().await.unwrap(), 1);
        assert_eq!(tracker.current_state(SERVICE, "110"), None);
    }

    #[tokio::test]
    async fn test_destroy_of_unclassified_container_is_forgotten() {
        let (discovery, tracker, runtime) = discovery(vec![container("110", true, None)]);
        discovery.scan().await.unwrap();
        runtime.containers.lock().unwrap().clear();

        let bare = ContainerEvent {
            id: "110".to_string(),
            kind: ContainerEventKind::Destroy,
            attributes: HashMap::new(),
        };
        discovery.observe(&bare).await.unwrap();
        assert_eq!(tracker.current_state(SERVICE, "110"), None);
    }

    #[tokio::test]
    async fn test_watch_reconnects_when_events_end() {
        let (discovery, tracker, runtime) = discovery(vec![container("110", true, None)]);
        runtime
            .events
            .lock()
            .unwrap()
            .push(event("110", ContainerEventKind::Start));
        let (stop_tx, stop_rx) = mpsc::channel(1);

        tokio::time::pause();
        let handle = tokio::spawn(Arc::new(discovery).watch(Duration::from_secs(60), stop_rx));
        tokio::time::sleep(RECONNECT_DELAY * 2).await;
        stop_tx.send(true).await.unwrap();
        handle.await.unwrap();

        assert!(runtime.reconnects.load(std::sync::atomic::Ordering::SeqCst) >= 1);
        assert_eq!(
            tracker.current_state(SERVICE, "110"),
            Some(ContainerState::Running)
        );
    }
}
