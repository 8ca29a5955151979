use std::collections::BTreeMap;
use std::fmt::Display;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::discovery::Container;
use crate::fsm::{Fsm, StateSet};
use crate::tracker::version::is_older;

/// Observed lifecycle of a tracked container.
///
/// ```text
///   Created ──▶ Starting ──▶ Running ──▶ Stopping ──▶ Stopped ──▶ Removed
///      │            │           │           │                       ▲
///      └────────────┴───────────┴───────────┴──▶ Failed ────────────┘
/// ```
///
/// `Created` may also jump straight to `Running`, `Stopped` or `Removed` when
/// the first observation of a container is a late one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ContainerState {
    Created,
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
    Removed,
}

impl Display for ContainerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ContainerState::Created => "created",
            ContainerState::Starting => "starting",
            ContainerState::Running => "running",
            ContainerState::Stopping => "stopping",
            ContainerState::Stopped => "stopped",
            ContainerState::Failed => "failed",
            ContainerState::Removed => "removed",
        };
        f.write_str(name)
    }
}

impl StateSet for ContainerState {
    fn initial() -> Self {
        ContainerState::Created
    }

    fn targets(self) -> &'static [Self] {
        use ContainerState::*;
        match self {
            Created => &[Starting, Running, Failed, Stopped, Removed],
            Starting => &[Running, Failed, Stopping],
            Running => &[Running, Failed, Stopping, Stopped],
            Stopping => &[Failed, Stopped],
            Stopped => &[Removed],
            Failed => &[Removed],
            Removed => &[],
        }
    }
}

/// Lifecycle machine of one container. The custom data is the container id;
/// each transition carries the container snapshot that caused it.
pub type ContainerFsm = Fsm<ContainerState, Container, String>;

/// All tracked instances of one image.
#[derive(Debug, Clone)]
pub struct ContainerGroup {
    image: String,
    instances: BTreeMap<String, ContainerFsm>,
}

impl ContainerGroup {
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            instances: BTreeMap::new(),
        }
    }

    pub fn image(&self) -> &str {
        &self.image
    }

    /// Existing machine for `container_id`, or a fresh one in `Created`.
    pub fn get_fsm(&mut self, container_id: &str) -> &mut ContainerFsm {
        self.instances
            .entry(container_id.to_string())
            .or_insert_with(|| ContainerFsm::new(container_id.to_string()))
    }

    pub fn fsm(&self, container_id: &str) -> Option<&ContainerFsm> {
        self.instances.get(container_id)
    }

    pub fn remove_fsm(&mut self, container_id: &str) -> Option<ContainerFsm> {
        self.instances.remove(container_id)
    }

    pub fn contains(&self, container_id: &str) -> bool {
        self.instances.contains_key(container_id)
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn instances(&self) -> impl Iterator<Item = &ContainerFsm> {
        self.instances.values()
    }
}

pub(crate) fn group_is_older(a: &ContainerGroup, b: &ContainerGroup) -> bool {
    is_older(&a.image, &b.image)
}

/// Entry of the start-time heap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartedContainer {
    pub id: String,
    pub image: String,
    pub started_at: DateTime<Utc>,
}

pub(crate) fn started_before(a: &StartedContainer, b: &StartedContainer) -> bool {
    a.started_at < b.started_at
}
