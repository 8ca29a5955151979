//! Per-host container state.
//!
//! [`ContainerTracker`] is the only writer of the lifecycle machines and of
//! the two per-service priority structures:
//!
//! - the version heap, one [`ContainerGroup`] per image, oldest version first;
//! - the start-time heap, one entry per started container, earliest first.
//!
//! Every successful mutation is followed by a best-effort notification to the
//! listeners registered for the service. Delivery is at most once: a listener
//! whose channel is full simply misses that signal and must catch up on its
//! own schedule.

mod group;
mod heap;
mod version;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;

use crate::discovery::Container;
use crate::fsm::{FsmError, StateSet};

pub use group::{ContainerFsm, ContainerGroup, ContainerState, StartedContainer};
pub use version::parse_image;

use heap::IndexedHeap;

use group::{group_is_older, started_before};

/// Capacity of each listener channel. One pending signal is enough since a
/// signal only means "something changed, look again".
const NOTIFY_BUFFER: usize = 1;

/// Read access to the tracked population of a host.
pub trait HostContainerStates: Send + Sync {
    /// Machines of every tracked instance of `image` in `service`.
    fn instances(&self, service: &str, image: &str) -> Vec<ContainerFsm>;

    fn count_versions(&self, service: &str) -> usize;

    /// Image and instances of the oldest version group.
    fn oldest_version(&self, service: &str) -> Option<(String, Vec<ContainerFsm>)>;

    /// Visits groups from oldest to newest version.
    fn visit_versions(&self, service: &str, visitor: &mut dyn FnMut(&ContainerGroup));

    /// Visits started containers from earliest to latest start.
    fn visit_start_times(&self, service: &str, visitor: &mut dyn FnMut(&StartedContainer));

    fn count_in_states(&self, service: &str, image: &str, states: &[ContainerState]) -> usize {
        self.instances(service, image)
            .iter()
            .filter(|fsm| states.contains(&fsm.state()))
            .count()
    }
}

/// Per-service subscription handle returned by
/// [`ContainerTracker::add_states_listener`].
pub type HostContainerStatesChanged = mpsc::Receiver<Arc<dyn HostContainerStates>>;

#[derive(Debug, thiserror::Error)]
pub enum TrackerError {
    #[error("Container {container} of service {service}: {source}")]
    Transition {
        service: String,
        container: String,
        #[source]
        source: FsmError,
    },
    #[error("Container {container} is not tracked for service {service}")]
    UnknownContainer { service: String, container: String },
}

/// Outcome of removing a container from the start-time heaps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Removal {
    /// Found in the heap of the service it was reported for.
    Direct,
    /// Found only by scanning every service; carries the service that held it.
    Fallback { service: String },
    Missing,
}

struct ServiceStates {
    versions: IndexedHeap<String, ContainerGroup>,
    start_times: IndexedHeap<String, StartedContainer>,
}

impl ServiceStates {
    fn new() -> Self {
        Self {
            versions: IndexedHeap::new(group_is_older),
            start_times: IndexedHeap::new(started_before),
        }
    }

    /// Image of the group holding `container`. The reported image is tried
    /// first; a container whose image is unknown is looked up by id.
    fn locate(&self, container: &Container) -> Option<String> {
        if let Some(group) = self.versions.get(&container.image) {
            if group.contains(&container.id) {
                return Some(container.image.clone());
            }
        }
        self.versions
            .iter()
            .find(|(_, group)| group.contains(&container.id))
            .map(|(image, _)| image.clone())
    }
}

#[derive(Default)]
struct TrackerState {
    services: HashMap<String, ServiceStates>,
    listeners: HashMap<String, Vec<mpsc::Sender<Arc<dyn HostContainerStates>>>>,
}

impl TrackerState {
    fn remove_started(&mut self, service: &str, container_id: &str) -> Removal {
        let direct = self
            .services
            .get_mut(service)
            .and_then(|states| states.start_times.remove(&container_id.to_string()));
        if direct.is_some() {
            return Removal::Direct;
        }

        // The runtime may have reported the container under another service,
        // or without the metadata needed to classify it.
        let key = container_id.to_string();
        for (name, states) in self.services.iter_mut() {
            if states.start_times.remove(&key).is_some() {
                log::debug!(
                    "Container {container_id} removed from start times of {name} instead of {service}"
                );
                return Removal::Fallback {
                    service: name.clone(),
                };
            }
        }
        Removal::Missing
    }
}

/// Shared handle to the tracked state of this host.
#[derive(Clone, Default)]
pub struct ContainerTracker {
    state: Arc<Mutex<TrackerState>>,
}

impl ContainerTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn starting(&self, service: &str, container: &Container) -> Result<(), TrackerError> {
        self.process(service, container, ContainerState::Starting, "starting")
    }

    pub fn running(&self, service: &str, container: &Container) -> Result<(), TrackerError> {
        self.process(service, container, ContainerState::Running, "running")
    }

    pub fn stopping(&self, service: &str, container: &Container) -> Result<(), TrackerError> {
        self.process(service, container, ContainerState::Stopping, "stopping")
    }

    pub fn stopped(&self, service: &str, container: &Container) -> Result<(), TrackerError> {
        self.process(service, container, ContainerState::Stopped, "stopped")
    }

    pub fn died(&self, service: &str, container: &Container) -> Result<(), TrackerError> {
        self.process(service, container, ContainerState::Failed, "died")
    }

    pub fn removed(&self, service: &str, container: &Container) -> Result<(), TrackerError> {
        self.process(service, container, ContainerState::Removed, "removed")
    }

    /// Registers a listener for changes to `service`.
    pub fn add_states_listener(&self, service: &str) -> HostContainerStatesChanged {
        let (tx, rx) = mpsc::channel(NOTIFY_BUFFER);
        self.lock()
            .listeners
            .entry(service.to_string())
            .or_default()
            .push(tx);
        rx
    }

    pub fn current_state(&self, service: &str, container_id: &str) -> Option<ContainerState> {
        let state = self.lock();
        let states = state.services.get(service)?;
        states
            .versions
            .iter()
            .find_map(|(_, group)| group.fsm(container_id))
            .map(|fsm| fsm.state())
    }

    pub fn services(&self) -> Vec<String> {
        self.lock().services.keys().cloned().collect()
    }

    /// Evicts a container known only by id from every service.
    ///
    /// Used when the runtime reports a container as gone but no longer
    /// provides enough metadata to classify it. The machine is dropped without
    /// a transition since there is nothing left to observe.
    pub fn forget(&self, container_id: &str) -> Vec<String> {
        let key = container_id.to_string();
        let mut evicted = Vec::new();
        {
            let mut state = self.lock();
            for (service, states) in state.services.iter_mut() {
                let image = states
                    .versions
                    .iter()
                    .find(|(_, group)| group.contains(container_id))
                    .map(|(image, _)| image.clone());
                if let Some(image) = &image {
                    evict(states, image, container_id);
                }
                let started = states.start_times.remove(&key).is_some();
                if image.is_some() || started {
                    evicted.push(service.clone());
                }
            }
        }
        for service in &evicted {
            log::debug!("Forgot container {container_id} of service {service}");
            self.notify(service);
        }
        evicted
    }

    fn process(
        &self,
        service: &str,
        container: &Container,
        target: ContainerState,
        reason: &str,
    ) -> Result<(), TrackerError> {
        {
            let mut state = self.lock();
            let states = state
                .services
                .entry(service.to_string())
                .or_insert_with(ServiceStates::new);

            let image = match states.locate(container) {
                Some(image) => image,
                None if container.image.is_empty() => {
                    return Err(TrackerError::UnknownContainer {
                        service: service.to_string(),
                        container: container.id.clone(),
                    });
                }
                None => {
                    states.versions.push(
                        container.image.clone(),
                        ContainerGroup::new(container.image.clone()),
                    );
                    container.image.clone()
                }
            };

            let group = states.versions.get_mut(&image).ok_or_else(|| {
                TrackerError::UnknownContainer {
                    service: service.to_string(),
                    container: container.id.clone(),
                }
            })?;
            let fsm = group.get_fsm(&container.id);
            let result = advance(fsm, target, reason, container).map_err(|source| {
                TrackerError::Transition {
                    service: service.to_string(),
                    container: container.id.clone(),
                    source,
                }
            });

            // A machine created for a rejected first observation must not
            // linger, nor the group created for it.
            if result.is_err() && fsm_is_fresh(group, &container.id) {
                evict(states, &image, &container.id);
            }
            result?;

            match target {
                ContainerState::Removed => {
                    evict(states, &image, &container.id);
                    let removal = state.remove_started(service, &container.id);
                    log::debug!(
                        "Container {} of {service} removed ({removal:?})",
                        container.short_id()
                    );
                }
                ContainerState::Failed | ContainerState::Stopped => {
                    log::info!(
                        "Container {} of {service} is {target} (exit code {:?})",
                        container.short_id(),
                        container.exit_code
                    );
                    track_start(states, container);
                }
                _ => {
                    log::debug!("Container {} of {service} is {target}", container.short_id());
                    track_start(states, container);
                }
            }
        }
        self.notify(service);
        Ok(())
    }

    fn notify(&self, service: &str) {
        let listeners = {
            let mut state = self.lock();
            match state.listeners.get_mut(service) {
                Some(listeners) => {
                    listeners.retain(|tx| !tx.is_closed());
                    listeners.clone()
                }
                None => return,
            }
        };
        for tx in listeners {
            let snapshot: Arc<dyn HostContainerStates> = Arc::new(self.clone());
            if let Err(mpsc::error::TrySendError::Full(_)) = tx.try_send(snapshot) {
                log::trace!("Listener for {service} is busy, dropping notification");
            }
        }
    }
}

/// Applies `target` to `fsm`.
///
/// Removal is a fact reported by the runtime rather than a request, so when
/// the stop or death leading up to it was missed the implied step (`Stopped`
/// if reachable, `Failed` otherwise) is applied first. Both steps are table
/// edges; nothing is skipped.
fn advance(
    fsm: &mut ContainerFsm,
    target: ContainerState,
    reason: &str,
    container: &Container,
) -> Result<(), FsmError> {
    let current = fsm.state();
    if target == ContainerState::Removed && !current.can_reach(target) {
        let implied = [ContainerState::Stopped, ContainerState::Failed]
            .into_iter()
            .find(|&step| current.can_reach(step) && step.can_reach(target));
        if let Some(step) = implied {
            log::debug!(
                "Container {} went from {current} to {target} unobserved, assuming {step}",
                container.short_id()
            );
            fsm.next(step, "implied by removal", Some(container.clone()))?;
        }
    }
    fsm.next(target, reason, Some(container.clone()))?;
    Ok(())
}

fn fsm_is_fresh(group: &ContainerGroup, container_id: &str) -> bool {
    group
        .fsm(container_id)
        .is_some_and(|fsm| fsm.history().len() == 1)
}

fn evict(states: &mut ServiceStates, image: &str, container_id: &str) {
    let key = image.to_string();
    let now_empty = match states.versions.get_mut(&key) {
        Some(group) => {
            group.remove_fsm(container_id);
            group.is_empty()
        }
        None => false,
    };
    if now_empty {
        states.versions.remove(&key);
    }
}

fn track_start(states: &mut ServiceStates, container: &Container) {
    if let Some(started_at) = container.started_at {
        states.start_times.push(
            container.id.clone(),
            StartedContainer {
                id: container.id.clone(),
                image: container.image.clone(),
                started_at,
            },
        );
    }
}

impl HostContainerStates for ContainerTracker {
    fn instances(&self, service: &str, image: &str) -> Vec<ContainerFsm> {
        let state = self.lock();
        state
            .services
            .get(service)
            .and_then(|states| states.versions.get(&image.to_string()))
            .map(|group| group.instances().cloned().collect())
            .unwrap_or_default()
    }

    fn count_versions(&self, service: &str) -> usize {
        let state = self.lock();
        state
            .services
            .get(service)
            .map_or(0, |states| states.versions.len())
    }

    fn oldest_version(&self, service: &str) -> Option<(String, Vec<ContainerFsm>)> {
        let state = self.lock();
        let (image, group) = state.services.get(service)?.versions.peek()?;
        Some((image.clone(), group.instances().cloned().collect()))
    }

    fn visit_versions(&self, service: &str, visitor: &mut dyn FnMut(&ContainerGroup)) {
        let state = self.lock();
        if let Some(states) = state.services.get(service) {
            for (_, group) in states.versions.sorted() {
                visitor(group);
            }
        }
    }

    fn visit_start_times(&self, service: &str, visitor: &mut dyn FnMut(&StartedContainer)) {
        let state = self.lock();
        if let Some(states) = state.services.get(service) {
            for (_, started) in states.start_times.sorted() {
                visitor(started);
            }
        }
    }
}
