//! Retirement of superseded versions.
//!
//! A [`Vacuum`] watches one service. Once it runs more versions than it
//! should keep, every instance of the oldest version is stopped, or removed
//! when no longer running. Stopped instances are removed on a later tick.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::runtime::ContainerRuntime;
use crate::tracker::{ContainerState, HostContainerStates};

const DEFAULT_RUN_INTERVAL: Duration = Duration::from_secs(1);
const STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// Stops a running vacuum when `true` is sent.
pub type VacuumStop = mpsc::Sender<bool>;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum VacuumConfigError {
    #[error("versions_to_keep must not be negative, got {0}")]
    NegativeVersionsToKeep(i64),
    #[error("by_version and by_start_time are mutually exclusive")]
    ConflictingPolicies,
    #[error("no vacuum policy configured")]
    NoPolicy,
    #[error("run_interval_seconds must be positive")]
    ZeroInterval,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ByVersion {
    pub versions_to_keep: i64,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ByStartTime {}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct VacuumConfig {
    #[serde(default)]
    pub by_version: Option<ByVersion>,
    #[serde(default)]
    pub by_start_time: Option<ByStartTime>,
    #[serde(default)]
    pub run_interval_seconds: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VacuumPolicy {
    ByVersion { keep: usize },
    /// Not implemented yet: ticks do nothing.
    ByStartTime,
}

impl VacuumConfig {
    pub fn validate(&self) -> Result<(VacuumPolicy, Duration), VacuumConfigError> {
        let interval = match self.run_interval_seconds {
            Some(0) => return Err(VacuumConfigError::ZeroInterval),
            Some(seconds) => Duration::from_secs(seconds),
            None => DEFAULT_RUN_INTERVAL,
        };
        let policy = match (self.by_version, self.by_start_time) {
            (Some(_), Some(_)) => return Err(VacuumConfigError::ConflictingPolicies),
            (Some(ByVersion { versions_to_keep }), None) => {
                let keep = usize::try_from(versions_to_keep)
                    .map_err(|_| VacuumConfigError::NegativeVersionsToKeep(versions_to_keep))?;
                VacuumPolicy::ByVersion { keep }
            }
            (None, Some(_)) => VacuumPolicy::ByStartTime,
            (None, None) => return Err(VacuumConfigError::NoPolicy),
        };
        Ok((policy, interval))
    }
}

pub struct Vacuum {
    service: String,
    policy: VacuumPolicy,
    interval: Duration,
    states: Arc<dyn HostContainerStates>,
    runtime: Arc<dyn ContainerRuntime>,
}

impl Vacuum {
    pub fn new(
        service: &str,
        config: &VacuumConfig,
        states: Arc<dyn HostContainerStates>,
        runtime: Arc<dyn ContainerRuntime>,
    ) -> Result<Self, VacuumConfigError> {
        let (policy, interval) = config.validate()?;
        Ok(Self {
            service: service.to_string(),
            policy,
            interval,
            states,
            runtime,
        })
    }

    /// Spawns the vacuum loop.
    pub fn start(self) -> (VacuumStop, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(1);
        let handle = tokio::spawn(self.run(rx));
        (tx, handle)
    }

    async fn run(self, mut stop: mpsc::Receiver<bool>) {
        log::info!("Vacuum for {} started ({:?})", self.service, self.policy);
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                maybe_stop = stop.recv() => {
                    if maybe_stop.unwrap_or(true) {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    self.tick();
                }
            }
        }
        log::info!("Vacuum for {} stopped", self.service);
    }

    /// One collection pass. Returns the detached stop and remove tasks it
    /// spawned.
    pub fn tick(&self) -> Vec<JoinHandle<()>> {
        let keep = match self.policy {
            VacuumPolicy::ByVersion { keep } => keep,
            VacuumPolicy::ByStartTime => return Vec::new(),
        };
        let versions = self.states.count_versions(&self.service);
        if versions <= keep {
            return Vec::new();
        }
        let Some((image, instances)) = self.states.oldest_version(&self.service) else {
            return Vec::new();
        };
        log::info!(
            "Vacuum for {}: {} versions, keeping {}, retiring {}",
            self.service,
            versions,
            keep,
            image
        );

        instances
            .into_iter()
            .map(|fsm| {
                let runtime = self.runtime.clone();
                let id = fsm.custom_data().clone();
                let state = fsm.state();
                tokio::spawn(async move {
                    let result = if state == ContainerState::Running {
                        runtime.stop_container(&id, STOP_TIMEOUT).await
                    } else {
                        runtime.remove_container(&id, true).await
                    };
                    match result {
                        Ok(()) => log::info!("Vacuumed {} ({})", id, state),
                        Err(e) => log::error!(
                            target: "herdsman::exception",
                            "Vacuum of {} ({}) failed: {}",
                            id,
                            state,
                            e
                        ),
                    }
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::Container;
    use crate::runtime::fake::{Call, FakeRuntime};
    use crate::tracker::ContainerTracker;

    fn by_version(keep: i64) -> VacuumConfig {
        VacuumConfig {
            by_version: Some(ByVersion {
                versions_to_keep: keep,
            }),
            ..Default::default()
        }
    }

    fn track(tracker: &ContainerTracker, id: &str, image: &str, running: bool) {
        let container = Container {
            id: id.to_string(),
            image: image.to_string(),
            ..Default::default()
        };
        if running {
            tracker.running("infradash", &container).unwrap();
        } else {
            tracker.died("infradash", &container).unwrap();
        }
    }

    #[test]
    fn test_validate() {
        assert_eq!(
            by_version(2).validate(),
            Ok((VacuumPolicy::ByVersion { keep: 2 }, DEFAULT_RUN_INTERVAL))
        );
        assert_eq!(
            by_version(-1).validate(),
            Err(VacuumConfigError::NegativeVersionsToKeep(-1))
        );
        let both = VacuumConfig {
            by_start_time: Some(ByStartTime {}),
            ..by_version(1)
        };
        assert_eq!(both.validate(), Err(VacuumConfigError::ConflictingPolicies));
        assert_eq!(
            VacuumConfig::default().validate(),
            Err(VacuumConfigError::NoPolicy)
        );
    }

    #[test]
    fn test_from_toml() {
        let config: VacuumConfig = toml::from_str(
            r#"
            run_interval_seconds = 30

            [by_version]
            versions_to_keep = 2
        "#,
        )
        .unwrap();
        assert_eq!(
            config.validate(),
            Ok((
                VacuumPolicy::ByVersion { keep: 2 },
                Duration::from_secs(30)
            ))
        );

        let config: VacuumConfig = toml::from_str("[by_start_time]").unwrap();
        assert_eq!(config.validate().unwrap().0, VacuumPolicy::ByStartTime);
    }

    #[tokio::test]
    async fn test_retires_oldest_version() {
        let tracker = ContainerTracker::new();
        track(&tracker, "110", "infradash/infradash:develop-1.1", true);
        track(&tracker, "111", "infradash/infradash:develop-1.1", false);
        track(&tracker, "120", "infradash/infradash:develop-1.2", true);
        track(&tracker, "130", "infradash/infradash:develop-1.3", true);

        let runtime = Arc::new(FakeRuntime::default());
        let vacuum = Vacuum::new(
            "infradash",
            &by_version(1),
            Arc::new(tracker.clone()),
            runtime.clone(),
        )
        .unwrap();

        let handles = vacuum.tick();
        assert_eq!(handles.len(), 2);
        for handle in handles {
            handle.await.unwrap();
        }

        let mut calls = runtime.calls();
        calls.sort_by_key(|call| format!("{call:?}"));
        assert_eq!(
            calls,
            vec![
                Call::Remove("111".to_string()),
                Call::Stop("110".to_string())
            ]
        );
    }

    #[tokio::test]
    async fn test_other_domains_are_left_alone() {
        let tracker = ContainerTracker::new();
        for (service, id, image) in [
            ("b/web", "b5", "b/web:5"),
            ("a/web", "a1", "a/web:1"),
            ("a/web", "a2", "a/web:2"),
        ] {
            let container = Container {
                id: id.to_string(),
                image: image.to_string(),
                ..Default::default()
            };
            tracker.running(service, &container).unwrap();
        }

        let runtime = Arc::new(FakeRuntime::default());
        let states: Arc<dyn HostContainerStates> = Arc::new(tracker);
        let keep_two = Vacuum::new("a/web", &by_version(2), states.clone(), runtime.clone()).unwrap();
        assert!(keep_two.tick().is_empty());

        let keep_one = Vacuum::new("a/web", &by_version(1), states, runtime.clone()).unwrap();
        for handle in keep_one.tick() {
            handle.await.unwrap();
        }
        assert_eq!(runtime.calls(), vec![Call::Stop("a1".to_string())]);
    }

    #[tokio::test]
    async fn test_within_budget_is_a_no_op() {
        let tracker = ContainerTracker::new();
        track(&tracker, "110", "infradash/infradash:develop-1.1", true);
        track(&tracker, "120", "infradash/infradash:develop-1.2", true);

        let runtime = Arc::new(FakeRuntime::default());
        let vacuum = Vacuum::new(
            "infradash",
            &by_version(2),
            Arc::new(tracker.clone()),
            runtime.clone(),
        )
        .unwrap();
        assert!(vacuum.tick().is_empty());
        assert!(runtime.calls().is_empty());
    }

    #[tokio::test]
    async fn test_by_start_time_does_nothing_yet() {
        let tracker = ContainerTracker::new();
        track(&tracker, "110", "infradash/infradash:develop-1.1", true);
        track(&tracker, "120", "infradash/infradash:develop-1.2", true);

        let config = VacuumConfig {
            by_start_time: Some(ByStartTime {}),
            ..Default::default()
        };
        let runtime = Arc::new(FakeRuntime::default());
        let vacuum =
            Vacuum::new("infradash", &config, Arc::new(tracker), runtime.clone()).unwrap();
        assert!(vacuum.tick().is_empty());
    }

    #[tokio::test]
    async fn test_stop_channel_halts_loop() {
        let runtime = Arc::new(FakeRuntime::default());
        let vacuum = Vacuum::new(
            "infradash",
            &by_version(1),
            Arc::new(ContainerTracker::new()),
            runtime,
        )
        .unwrap();
        let (stop, handle) = vacuum.start();
        stop.send(true).await.unwrap();
        handle.await.unwrap();
    }
}
