//! Container runtime boundary.
//!
//! The engine only talks to the container runtime through
//! [`ContainerRuntime`]. [`DockerRuntime`] implements it with bollard.

mod docker;
mod options;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bollard::auth::DockerCredentials;
use futures::stream::BoxStream;
use tokio::sync::oneshot;

use crate::discovery::Container;

pub use docker::DockerRuntime;
pub use options::ContainerOptions;

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("Docker API error: {0}")]
    DockerApi(#[from] bollard::errors::Error),
    #[error("Failed to connect to the container runtime: {0}")]
    Connect(String),
    #[error("Container {0} not found")]
    NotFound(String),
    #[error("Pull of {0} was abandoned before completion")]
    PullAbandoned(String),
    #[error("Invalid container options: {0}")]
    InvalidOptions(String),
}

/// Resolves once an image pull has finished.
pub type PullDone = oneshot::Receiver<Result<(), RuntimeError>>;

/// Filter for [`ContainerRuntime::find_containers`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerFilter {
    /// Include containers that are not running.
    pub all: bool,
    /// `key` or `key=value` label filters, all of which must hold.
    pub labels: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContainerEventKind {
    Create,
    Start,
    Kill,
    Die,
    Stop,
    Destroy,
    Other(String),
}

impl From<&str> for ContainerEventKind {
    fn from(action: &str) -> Self {
        // exec and health events carry a suffix, e.g. "exec_start: sh"
        match action {
            "create" => Self::Create,
            "start" | "restart" | "unpause" => Self::Start,
            "kill" => Self::Kill,
            "die" => Self::Die,
            "stop" => Self::Stop,
            "destroy" => Self::Destroy,
            other => Self::Other(other.to_string()),
        }
    }
}

/// A container lifecycle event as delivered by the runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerEvent {
    pub id: String,
    pub kind: ContainerEventKind,
    /// Image, container name and labels as attached to the event.
    pub attributes: HashMap<String, String>,
}

impl ContainerEvent {
    /// The partial container the event describes. Docker mixes labels into
    /// the event attributes, so everything but the well-known keys is taken as
    /// a label.
    pub fn snapshot(&self) -> Container {
        const KNOWN: [&str; 4] = ["image", "name", "exitCode", "signal"];
        Container {
            id: self.id.clone(),
            name: self.attributes.get("name").cloned().unwrap_or_default(),
            image: self.attributes.get("image").cloned().unwrap_or_default(),
            labels: self
                .attributes
                .iter()
                .filter(|(k, _)| !KNOWN.contains(&k.as_str()))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            exit_code: self
                .attributes
                .get("exitCode")
                .and_then(|code| code.parse().ok()),
            ..Default::default()
        }
    }
}

pub type ContainerEvents = BoxStream<'static, Result<ContainerEvent, RuntimeError>>;

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn find_containers(&self, filter: &ContainerFilter)
    -> Result<Vec<Container>, RuntimeError>;

    /// `Ok(None)` when the container no longer exists.
    async fn inspect_container(&self, id: &str) -> Result<Option<Container>, RuntimeError>;

    /// Starts pulling `image`. The returned receiver resolves when the pull
    /// completes.
    async fn pull_image(
        &self,
        auth: Option<DockerCredentials>,
        image: &str,
    ) -> Result<PullDone, RuntimeError>;

    /// Creates and starts a container named `name` from `image`.
    async fn start_container(
        &self,
        name: &str,
        image: &str,
        options: &ContainerOptions,
    ) -> Result<Container, RuntimeError>;

    async fn stop_container(&self, id: &str, timeout: Duration) -> Result<(), RuntimeError>;

    async fn remove_container(&self, id: &str, force: bool) -> Result<(), RuntimeError>;

    /// Live container events. The stream ends when the connection is lost.
    fn events(&self) -> ContainerEvents;

    /// Re-establishes the connection in place, for every holder of this
    /// runtime.
    fn reconnect(&self) -> Result<(), RuntimeError> {
        Ok(())
    }
}
