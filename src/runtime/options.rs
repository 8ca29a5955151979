use std::collections::HashMap;

use bollard::models::{
    ContainerCreateBody, HostConfig, PortBinding, RestartPolicy, RestartPolicyNameEnum,
};
use serde::{Deserialize, Serialize};

use super::RuntimeError;

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub enum Restart {
    #[serde(alias = "always")]
    Always,
    #[default]
    #[serde(alias = "no", alias = "never")]
    No,
    #[serde(alias = "on-failure", alias = "on_failure", alias = "onfailure")]
    OnFailure,
    #[serde(
        alias = "unless-stopped",
        alias = "unless_stopped",
        alias = "unlessstopped"
    )]
    UnlessStopped,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PortEntry {
    /// Host port. Left to the runtime when absent, so several instances can
    /// run side by side.
    #[serde(default)]
    pub host: Option<u16>,
    pub container: u16,
}

/// How a scheduled container is created.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContainerOptions {
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default, rename = "port")]
    pub ports: Vec<PortEntry>,
    #[serde(default)]
    pub command: Option<Vec<String>>,
    #[serde(default)]
    pub restart: Restart,
    #[serde(default)]
    pub network: Option<String>,
    #[serde(default)]
    pub memory: Option<String>,
    #[serde(default)]
    pub cpus: Option<String>,
}

impl ContainerOptions {
    /// Builds the creation body for `image`.
    pub fn to_create_body(&self, image: &str) -> Result<ContainerCreateBody, RuntimeError> {
        let mut port_bindings: HashMap<String, Option<Vec<PortBinding>>> = HashMap::new();
        let mut exposed_ports: Vec<String> = Vec::new();

        for port in &self.ports {
            let container_port = format!("{}/tcp", port.container);
            exposed_ports.push(container_port.clone());
            port_bindings.insert(
                container_port,
                Some(vec![PortBinding {
                    host_ip: Some("0.0.0.0".to_string()),
                    host_port: port.host.map(|p| p.to_string()),
                }]),
            );
        }

        let mut env: Vec<String> = self
            .env
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        env.sort();

        let name = match self.restart {
            Restart::Always => RestartPolicyNameEnum::ALWAYS,
            Restart::No => RestartPolicyNameEnum::NO,
            Restart::OnFailure => RestartPolicyNameEnum::ON_FAILURE,
            Restart::UnlessStopped => RestartPolicyNameEnum::UNLESS_STOPPED,
        };
        let restart_policy = Some(RestartPolicy {
            name: Some(name),
            maximum_retry_count: None,
        });

        let memory = self
            .memory
            .as_deref()
            .map(parse_memory_limit)
            .transpose()?;

        // Docker expects nano CPUs
        let nano_cpus = self
            .cpus
            .as_deref()
            .map(|c| {
                c.trim()
                    .parse::<f64>()
                    .map(|cpus| (cpus * 1_000_000_000.0) as i64)
                    .map_err(|_| RuntimeError::InvalidOptions(format!("cpus '{c}'")))
            })
            .transpose()?;

        let host_config = HostConfig {
            port_bindings: if port_bindings.is_empty() {
                None
            } else {
                Some(port_bindings)
            },
            restart_policy,
            memory,
            nano_cpus,
            network_mode: self.network.clone(),
            ..Default::default()
        };

        Ok(ContainerCreateBody {
            image: Some(image.to_string()),
            env: if env.is_empty() { None } else { Some(env) },
            labels: if self.labels.is_empty() {
                None
            } else {
                Some(self.labels.clone())
            },
            cmd: self.command.clone(),
            exposed_ports: if exposed_ports.is_empty() {
                None
            } else {
                Some(exposed_ports)
            },
            host_config: Some(host_config),
            ..Default::default()
        })
    }
}

/// Parse memory limit string (e.g., "512m", "2g") to bytes
fn parse_memory_limit(limit: &str) -> Result<i64, RuntimeError> {
    let lower = limit.trim().to_lowercase();
    let (num_str, multiplier) = if let Some(n) = lower.strip_suffix('g') {
        (n, 1024 * 1024 * 1024)
    } else if let Some(n) = lower.strip_suffix('m') {
        (n, 1024 * 1024)
    } else if let Some(n) = lower.strip_suffix('k') {
        (n, 1024)
    } else if let Some(n) = lower.strip_suffix('b') {
        (n, 1)
    } else {
        (lower.as_str(), 1)
    };

    num_str
        .parse::<i64>()
        .map(|n| n * multiplier)
        .map_err(|_| RuntimeError::InvalidOptions(format!("memory '{limit}'")))
}
