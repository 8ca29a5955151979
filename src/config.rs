use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::discovery::{DEFAULT_DOMAIN_KEY, DiscoveryContainerMatcher, MatchError, WatchContainerSpec};
use crate::registry::ReleaseConfig;
use crate::runtime::ContainerOptions;
use crate::scheduler::{DEFAULT_NAME_TEMPLATE, NameContext, SwarmConfigError, SwarmSchedule, render_name};
use crate::template::TemplateError;
use crate::vacuum::{VacuumConfig, VacuumConfigError};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Rule error: {0}")]
    Match(#[from] MatchError),
    #[error("Service {service}: {source}")]
    Swarm {
        service: String,
        #[source]
        source: SwarmConfigError,
    },
    #[error("Service {service}: invalid vacuum: {source}")]
    Vacuum {
        service: String,
        #[source]
        source: VacuumConfigError,
    },
    #[error("Service {service}: invalid name template: {source}")]
    Template {
        service: String,
        #[source]
        source: TemplateError,
    },
    #[error("Service {0} has a schedule but no release")]
    MissingRelease(String),
    #[error("Domain {0} is declared twice")]
    DuplicateDomain(String),
    #[error("{0} must be positive")]
    ZeroInterval(&'static str),
}

fn default_max_attempts() -> usize {
    3
}

fn default_resync_seconds() -> u64 {
    30
}

fn default_scan_seconds() -> u64 {
    60
}

fn default_domain_key() -> String {
    DEFAULT_DOMAIN_KEY.to_string()
}

fn default_name_template() -> String {
    DEFAULT_NAME_TEMPLATE.to_string()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HerdsmanConfig {
    /// Failed instances of a release before its scheduling is suspended.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,
    /// Seconds between scheduler passes when nothing changes.
    #[serde(default = "default_resync_seconds")]
    pub resync_seconds: u64,
    /// Seconds between full container scans.
    #[serde(default = "default_scan_seconds")]
    pub scan_seconds: u64,
    #[serde(default = "default_domain_key")]
    pub domain_label: String,
    #[serde(default = "default_domain_key")]
    pub domain_env: String,
    /// Docker socket. Local defaults (`DOCKER_HOST`) are used when unset.
    #[serde(default)]
    pub docker_socket: Option<String>,
    #[serde(default, rename = "domain")]
    pub domains: Vec<DomainConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DomainConfig {
    pub name: String,
    #[serde(default, rename = "service")]
    pub services: Vec<ServiceConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceConfig {
    pub name: String,
    pub watch: WatchContainerSpec,
    #[serde(default)]
    pub schedule: Option<SwarmSchedule>,
    #[serde(default)]
    pub vacuum: Option<VacuumConfig>,
    #[serde(default)]
    pub release: Option<ReleaseConfig>,
    #[serde(default)]
    pub container: ContainerOptions,
    #[serde(default = "default_name_template")]
    pub name_template: String,
}

impl HerdsmanConfig {
    pub fn try_init_from_string(config: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(config)?;
        config.validate()?;
        Ok(config)
    }

    pub fn try_init(path: &Path) -> Result<Self, ConfigError> {
        let config = std::fs::read_to_string(path)?;
        Self::try_init_from_string(&config)
    }

    pub fn resync_interval(&self) -> Duration {
        Duration::from_secs(self.resync_seconds)
    }

    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.scan_seconds)
    }

    /// Every configured service with its domain.
    pub fn services(&self) -> impl Iterator<Item = (&DomainConfig, &ServiceConfig)> {
        self.domains
            .iter()
            .flat_map(|domain| domain.services.iter().map(move |service| (domain, service)))
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.resync_seconds == 0 {
            return Err(ConfigError::ZeroInterval("resync_seconds"));
        }
        if self.scan_seconds == 0 {
            return Err(ConfigError::ZeroInterval("scan_seconds"));
        }

        let mut domains = HashSet::new();
        for domain in &self.domains {
            if !domains.insert(domain.name.as_str()) {
                return Err(ConfigError::DuplicateDomain(domain.name.clone()));
            }
        }

        for (domain, service) in self.services() {
            let label = format!("{}/{}", domain.name, service.name);
            if let Some(schedule) = &service.schedule {
                schedule.validate().map_err(|source| ConfigError::Swarm {
                    service: label.clone(),
                    source,
                })?;
                if service.release.is_none() {
                    return Err(ConfigError::MissingRelease(label));
                }
            }
            if let Some(vacuum) = &service.vacuum {
                vacuum.validate().map_err(|source| ConfigError::Vacuum {
                    service: label.clone(),
                    source,
                })?;
            }

            let sample = NameContext {
                domain: domain.name.clone(),
                service: service.name.clone(),
                image: "image:tag".to_string(),
                version: "tag".to_string(),
                sequence: 1,
            };
            render_name(&service.name_template, &sample).map_err(|source| {
                ConfigError::Template {
                    service: label.clone(),
                    source,
                }
            })?;
        }

        // Rules compile or the duplicate check fails here
        self.matcher()?;
        Ok(())
    }

    pub fn matcher(&self) -> Result<DiscoveryContainerMatcher, ConfigError> {
        let mut matcher = DiscoveryContainerMatcher::new(&self.domain_label, &self.domain_env);
        for (domain, service) in self.services() {
            matcher.add_rule(&domain.name, &service.name, &service.watch)?;
        }
        Ok(matcher)
    }
}
