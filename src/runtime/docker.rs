//! [`ContainerRuntime`] over the Docker Engine API.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use bollard::auth::DockerCredentials;
use bollard::models::{ContainerInspectResponse, EventMessage};
use bollard::query_parameters::{
    CreateContainerOptions, CreateContainerOptionsBuilder, CreateImageOptions,
    CreateImageOptionsBuilder, EventsOptions, EventsOptionsBuilder, InspectContainerOptions,
    InspectContainerOptionsBuilder, ListContainersOptions, ListContainersOptionsBuilder,
    RemoveContainerOptions, RemoveContainerOptionsBuilder, StartContainerOptions,
    StartContainerOptionsBuilder, StopContainerOptions, StopContainerOptionsBuilder,
};
use bollard::{API_DEFAULT_VERSION, Docker};
use chrono::{DateTime, Datelike, Utc};
use futures_util::StreamExt;
use tokio::sync::{mpsc, oneshot};

use super::{
    ContainerEvent, ContainerEventKind, ContainerEvents, ContainerFilter, ContainerOptions,
    ContainerRuntime, PullDone, RuntimeError,
};
use crate::discovery::{Container, ContainerPort};
use crate::tracker::parse_image;

const CONNECT_TIMEOUT_SECS: u64 = 120;
const EVENT_BUFFER: usize = 64;

type Connector = Box<dyn Fn() -> Result<Docker, bollard::errors::Error> + Send + Sync>;

/// Docker client shared by discovery, the executors and the vacuums.
///
/// A reconnect swaps the client in place so every holder of the runtime
/// sees the new connection.
pub struct DockerRuntime {
    client: RwLock<Docker>,
    connector: Connector,
    generation: AtomicU64,
}

impl DockerRuntime {
    /// Connects to `socket`, or to the local defaults (`DOCKER_HOST` or the
    /// platform socket) when none is given.
    pub fn connect(socket: Option<&str>) -> Result<Self, RuntimeError> {
        let connector: Connector = match socket {
            Some(socket) => {
                let socket = socket.to_string();
                Box::new(move || {
                    Docker::connect_with_socket(&socket, CONNECT_TIMEOUT_SECS, API_DEFAULT_VERSION)
                })
            }
            None => Box::new(Docker::connect_with_local_defaults),
        };
        Self::with_connector(connector)
    }

    pub fn with_connector(connector: Connector) -> Result<Self, RuntimeError> {
        let client = connector().map_err(|e| RuntimeError::Connect(e.to_string()))?;
        Ok(Self {
            client: RwLock::new(client),
            connector,
            generation: AtomicU64::new(0),
        })
    }

    fn client(&self) -> Docker {
        self.client
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    async fn inspect(&self, id: &str) -> Result<Option<Container>, RuntimeError> {
        let options: InspectContainerOptions = InspectContainerOptionsBuilder::new().build();
        match self.client().inspect_container(id, Some(options)).await {
            Ok(info) => Ok(Some(container_from_inspect(info))),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(None),
            Err(e) => Err(RuntimeError::DockerApi(e)),
        }
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn find_containers(
        &self,
        filter: &ContainerFilter,
    ) -> Result<Vec<Container>, RuntimeError> {
        let mut filters: HashMap<&str, Vec<String>> = HashMap::new();
        if !filter.labels.is_empty() {
            filters.insert("label", filter.labels.clone());
        }
        let options: ListContainersOptions = ListContainersOptionsBuilder::new()
            .all(filter.all)
            .filters(&filters)
            .build();

        let summaries = self.client().list_containers(Some(options)).await?;

        // The summaries carry neither env nor start times
        let mut containers = Vec::with_capacity(summaries.len());
        for id in summaries.into_iter().filter_map(|s| s.id) {
            if let Some(container) = self.inspect(&id).await? {
                containers.push(container);
            }
        }
        Ok(containers)
    }

    async fn inspect_container(&self, id: &str) -> Result<Option<Container>, RuntimeError> {
        self.inspect(id).await
    }

    async fn pull_image(
        &self,
        auth: Option<DockerCredentials>,
        image: &str,
    ) -> Result<PullDone, RuntimeError> {
        log::info!("Pulling image: {}", image);
        let docker = self.client();
        let image = image.to_string();
        let (tx, rx) = oneshot::channel();

        tokio::spawn(async move {
            let options: CreateImageOptions = if image.contains('@') {
                CreateImageOptionsBuilder::new().from_image(&image).build()
            } else {
                let (repository, tag) = parse_image(&image);
                CreateImageOptionsBuilder::new()
                    .from_image(repository)
                    .tag(tag)
                    .build()
            };

            let mut stream = docker.create_image(Some(options), None, auth);
            let mut result = Ok(());
            while let Some(progress) = stream.next().await {
                match progress {
                    Ok(info) => {
                        if let Some(status) = info.status {
                            log::debug!("Pull status: {}", status);
                        }
                    }
                    Err(e) => {
                        log::error!("Failed to pull image {}: {}", image, e);
                        result = Err(RuntimeError::DockerApi(e));
                        break;
                    }
                }
            }
            if result.is_ok() {
                log::info!("Image {} pulled successfully", image);
            }
            let _ = tx.send(result);
        });

        Ok(rx)
    }

    async fn start_container(
        &self,
        name: &str,
        image: &str,
        options: &ContainerOptions,
    ) -> Result<Container, RuntimeError> {
        log::info!("Creating container {} from {}", name, image);
        let docker = self.client();
        let body = options.to_create_body(image)?;

        let create: CreateContainerOptions = CreateContainerOptionsBuilder::new().name(name).build();
        let created = docker.create_container(Some(create), body).await?;

        let start: StartContainerOptions = StartContainerOptionsBuilder::new().build();
        docker
            .start_container(&created.id, Some(start))
            .await
            .inspect_err(|e| {
                log::error!("Failed to start container {}: {}", name, e);
            })?;

        log::info!("Container {} started successfully", name);
        self.inspect(&created.id)
            .await?
            .ok_or_else(|| RuntimeError::NotFound(created.id.clone()))
    }

    async fn stop_container(&self, id: &str, timeout: Duration) -> Result<(), RuntimeError> {
        log::info!("Stopping container: {}", id);
        let options: StopContainerOptions = StopContainerOptionsBuilder::new()
            .t(timeout.as_secs() as i32)
            .build();

        match self.client().stop_container(id, Some(options)).await {
            Ok(_) => {
                log::info!("Container {} stopped successfully", id);
                Ok(())
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => {
                log::warn!("Container {} not found, skipping stop", id);
                Ok(())
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304, ..
            }) => {
                log::info!("Container {} already stopped", id);
                Ok(())
            }
            Err(e) => {
                log::warn!("Failed to stop container {}: {}", id, e);
                Err(RuntimeError::DockerApi(e))
            }
        }
    }

    async fn remove_container(&self, id: &str, force: bool) -> Result<(), RuntimeError> {
        log::info!("Removing container: {}", id);
        let options: RemoveContainerOptions =
            RemoveContainerOptionsBuilder::new().force(force).build();

        match self.client().remove_container(id, Some(options)).await {
            Ok(_) => {
                log::info!("Container {} removed successfully", id);
                Ok(())
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => {
                log::info!("Container {} not found, skipping removal", id);
                Ok(())
            }
            Err(e) => {
                log::error!("Failed to remove container {}: {}", id, e);
                Err(RuntimeError::DockerApi(e))
            }
        }
    }

    fn events(&self) -> ContainerEvents {
        let docker = self.client();
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);

        tokio::spawn(async move {
            let filters = HashMap::from([("type", vec!["container".to_string()])]);
            let options: EventsOptions = EventsOptionsBuilder::new().filters(&filters).build();
            let mut stream = Box::pin(docker.events(Some(options)));
            while let Some(message) = stream.next().await {
                let item = match message {
                    Ok(message) => match event_from_message(message) {
                        Some(event) => Ok(event),
                        None => continue,
                    },
                    Err(e) => Err(RuntimeError::DockerApi(e)),
                };
                let failed = item.is_err();
                if tx.send(item).await.is_err() || failed {
                    break;
                }
            }
        });

        Box::pin(futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        }))
    }

    fn reconnect(&self) -> Result<(), RuntimeError> {
        let client = (self.connector)().map_err(|e| RuntimeError::Connect(e.to_string()))?;
        *self.client.write().unwrap_or_else(PoisonError::into_inner) = client;
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        log::info!("Reconnected to the container runtime (generation {})", generation);
        Ok(())
    }
}

fn event_from_message(message: EventMessage) -> Option<ContainerEvent> {
    let actor = message.actor?;
    Some(ContainerEvent {
        id: actor.id?,
        kind: ContainerEventKind::from(message.action?.as_str()),
        attributes: actor.attributes.unwrap_or_default(),
    })
}

fn parse_started_at(started_at: &str) -> Option<DateTime<Utc>> {
    let started_at = DateTime::parse_from_rfc3339(started_at)
        .ok()?
        .with_timezone(&Utc);
    // Never started containers report 0001-01-01T00:00:00Z
    (started_at.year() > 1).then_some(started_at)
}

fn container_from_inspect(info: ContainerInspectResponse) -> Container {
    let config = info.config.unwrap_or_default();
    let state = info.state.unwrap_or_default();

    let mut ports = Vec::new();
    let port_map = info.network_settings.and_then(|n| n.ports).unwrap_or_default();
    for (key, bindings) in port_map {
        let Some(private) = key.split('/').next().and_then(|p| p.parse::<u16>().ok()) else {
            continue;
        };
        let published: Vec<u16> = bindings
            .unwrap_or_default()
            .iter()
            .filter_map(|b| b.host_port.as_deref()?.parse().ok())
            .collect();
        if published.is_empty() {
            ports.push(ContainerPort {
                private,
                public: None,
            });
        }
        ports.extend(published.into_iter().map(|public| ContainerPort {
            private,
            public: Some(public),
        }));
    }
    ports.sort_by_key(|p| (p.private, p.public));

    let running = state.running.unwrap_or(false);
    Container {
        id: info.id.unwrap_or_default(),
        name: info
            .name
            .map(|n| n.trim_start_matches('/').to_string())
            .unwrap_or_default(),
        image: config.image.unwrap_or_default(),
        labels: config.labels.unwrap_or_default(),
        env: config.env.unwrap_or_default(),
        ports,
        running,
        exit_code: if running { None } else { state.exit_code },
        started_at: state.started_at.as_deref().and_then(parse_started_at),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bollard::models::{
        ContainerConfig, ContainerState as DockerState, EventActor, NetworkSettings, PortBinding,
    };
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    fn inspect_response(running: bool, started_at: &str) -> ContainerInspectResponse {
        ContainerInspectResponse {
            id: Some("6f1f5c1e2b7d".to_string()),
            name: Some("/infradash-1".to_string()),
            config: Some(ContainerConfig {
                image: Some("infradash/infradash:develop-1.1".to_string()),
                env: Some(vec!["DASH_DOMAIN=ops".to_string()]),
                labels: Some(HashMap::from([(
                    "DASH_SERVICE".to_string(),
                    "infradash".to_string(),
                )])),
                ..Default::default()
            }),
            state: Some(DockerState {
                running: Some(running),
                exit_code: Some(if running { 0 } else { 137 }),
                started_at: Some(started_at.to_string()),
                ..Default::default()
            }),
            network_settings: Some(NetworkSettings {
                ports: Some(HashMap::from([
                    (
                        "3000/tcp".to_string(),
                        Some(vec![PortBinding {
                            host_ip: Some("0.0.0.0".to_string()),
                            host_port: Some("32768".to_string()),
                        }]),
                    ),
                    ("9090/tcp".to_string(), None),
                ])),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_container_from_inspect() {
        let container =
            container_from_inspect(inspect_response(true, "2024-03-01T10:00:00.123456789Z"));
        assert_eq!(container.name, "infradash-1");
        assert_eq!(container.image, "infradash/infradash:develop-1.1");
        assert_eq!(container.env_value("DASH_DOMAIN"), Some("ops"));
        assert!(container.running);
        assert_eq!(container.exit_code, None);
        assert!(container.started_at.is_some());
        assert_eq!(
            container.ports,
            vec![
                ContainerPort {
                    private: 3000,
                    public: Some(32768)
                },
                ContainerPort {
                    private: 9090,
                    public: None
                },
            ]
        );
    }

    #[test]
    fn test_never_started_container_has_no_start_time() {
        let container = container_from_inspect(inspect_response(false, "0001-01-01T00:00:00Z"));
        assert!(!container.running);
        assert_eq!(container.exit_code, Some(137));
        assert_eq!(container.started_at, None);
    }

    #[test]
    fn test_event_from_message() {
        let message = EventMessage {
            action: Some("die".to_string()),
            actor: Some(EventActor {
                id: Some("6f1f5c1e2b7d".to_string()),
                attributes: Some(HashMap::from([(
                    "image".to_string(),
                    "infradash/infradash:develop-1.1".to_string(),
                )])),
            }),
            ..Default::default()
        };
        let event = event_from_message(message).unwrap();
        assert_eq!(event.kind, ContainerEventKind::Die);
        assert_eq!(event.snapshot().image, "infradash/infradash:develop-1.1");

        assert!(event_from_message(EventMessage::default()).is_none());
    }

    #[tokio::test]
    async fn test_reconnect_is_seen_by_every_holder() {
        let connects = Arc::new(AtomicUsize::new(0));
        let counter = connects.clone();
        // Connecting over http is lazy, nothing is dialed here
        let runtime = Arc::new(
            DockerRuntime::with_connector(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Docker::connect_with_http("http://127.0.0.1:2375", 4, API_DEFAULT_VERSION)
            }))
            .unwrap(),
        );
        let other_holder = runtime.clone();

        runtime.reconnect().unwrap();
        assert_eq!(other_holder.generation.load(Ordering::SeqCst), 1);
        assert_eq!(connects.load(Ordering::SeqCst), 2);
    }
}
