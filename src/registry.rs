//! Desired state of a service across the cluster.

use async_trait::async_trait;
use serde::Deserialize;

use crate::tracker::{ContainerState, ContainerTracker, HostContainerStates, parse_image};

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Registry node {0} does not exist")]
    NodeNotFound(String),
    #[error("Registry unavailable: {0}")]
    Unavailable(String),
}

/// The release a service should run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReleaseImage {
    /// Registry node the release was read from.
    pub path: String,
    pub version: String,
    /// Full image reference. Empty when the release is not published.
    pub image: String,
}

#[async_trait]
pub trait GlobalServiceState: Send + Sync {
    async fn image(&self) -> Result<ReleaseImage, RegistryError>;

    /// Instances of the release registered across the cluster.
    async fn instances(&self) -> Result<u32, RegistryError>;
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct ReleaseConfig {
    pub image: String,
    #[serde(default)]
    pub path: Option<String>,
}

/// Desired state for a single host without a coordination registry: the
/// release comes from configuration and this host is the whole cluster.
pub struct StandaloneServiceState {
    service: String,
    release: ReleaseImage,
    tracker: ContainerTracker,
}

impl StandaloneServiceState {
    pub fn new(service: &str, config: &ReleaseConfig, tracker: ContainerTracker) -> Self {
        let (_, version) = parse_image(&config.image);
        let release = ReleaseImage {
            path: config
                .path
                .clone()
                .unwrap_or_else(|| format!("/{service}/live")),
            version: version.to_string(),
            image: config.image.clone(),
        };
        Self {
            service: service.to_string(),
            release,
            tracker,
        }
    }
}

#[async_trait]
impl GlobalServiceState for StandaloneServiceState {
    async fn image(&self) -> Result<ReleaseImage, RegistryError> {
        Ok(self.release.clone())
    }

    async fn instances(&self) -> Result<u32, RegistryError> {
        let count = self.tracker.count_in_states(
            &self.service,
            &self.release.image,
            &[ContainerState::Running, ContainerState::Starting],
        );
        Ok(count as u32)
    }
}
