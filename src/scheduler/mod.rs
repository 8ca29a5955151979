//! Per-service reconciliation.
//!
//! A [`Scheduler`] compares the instances of the desired release on this host
//! with the cluster-wide count and enqueues start jobs on the shared
//! executor. It runs on every tracker notification and on a timer, since
//! notifications may be dropped.

mod executor;
mod job;
mod swarm;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;

use crate::auth::AuthLookup;
use crate::discovery::service_key;
use crate::registry::{GlobalServiceState, RegistryError};
use crate::runtime::{ContainerOptions, RuntimeError};
use crate::template::{TemplateError, render_template};
use crate::tracker::{ContainerState, HostContainerStates, HostContainerStatesChanged};

pub use executor::{ScheduleExecutor, SchedulerExecutor};
pub use job::{Assignment, Job};
pub use swarm::{SwarmConfigError, SwarmSchedule};

pub const DEFAULT_NAME_TEMPLATE: &str = "${ service }-${ sequence }";

#[derive(Debug, thiserror::Error)]
pub enum ScheduleError {
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),
    #[error("Service {0}: cannot determine image")]
    NoImage(String),
    #[error("Breaker open for {image}: {failed} failed instances")]
    BreakerOpen { image: String, failed: usize },
    #[error("Invalid schedule: {0}")]
    Swarm(#[from] SwarmConfigError),
    #[error("Container runtime error: {0}")]
    Runtime(#[from] RuntimeError),
    #[error("Schedule executor is gone")]
    ExecutorClosed,
}

/// Values available to container name templates.
#[derive(Debug, Clone, Serialize)]
pub struct NameContext {
    pub domain: String,
    pub service: String,
    pub image: String,
    pub version: String,
    pub sequence: u32,
}

/// Renders the name of the next container of a service.
pub fn render_name(template: &str, context: &NameContext) -> Result<String, TemplateError> {
    render_template(template, context)
}

/// Latched when a release keeps failing. Scheduling for that release stays
/// suspended until the desired image changes or [`Breaker::reset`] is
/// called.
#[derive(Debug, Clone, Default)]
pub struct Breaker {
    tripped: Arc<Mutex<Option<String>>>,
}

impl Breaker {
    fn lock(&self) -> std::sync::MutexGuard<'_, Option<String>> {
        self.tripped.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn tripped(&self) -> Option<String> {
        self.lock().clone()
    }

    pub fn reset(&self) {
        if let Some(image) = self.lock().take() {
            log::info!("Breaker for {} reset", image);
        }
    }

    fn trip(&self, image: &str) {
        *self.lock() = Some(image.to_string());
    }

    /// Open for `image`. A breaker tripped for another image is cleared.
    fn is_open(&self, image: &str) -> bool {
        let mut tripped = self.lock();
        match tripped.as_deref() {
            Some(previous) if previous == image => true,
            Some(previous) => {
                log::info!("Release moved from {} to {}, breaker cleared", previous, image);
                *tripped = None;
                false
            }
            None => false,
        }
    }
}

/// How a service is scheduled.
#[derive(Clone)]
pub struct SchedulerSettings {
    pub domain: String,
    pub service: String,
    /// No scheduling happens without a policy.
    pub constraint: Option<SwarmSchedule>,
    pub max_attempts: usize,
    pub name_template: String,
    pub options: ContainerOptions,
    pub auth: Option<AuthLookup>,
}

pub struct Scheduler {
    settings: SchedulerSettings,
    global: Arc<dyn GlobalServiceState>,
    executor: SchedulerExecutor,
    breaker: Breaker,
    /// Tracker key, `domain/service`.
    key: String,
    /// Last sequence number handed out, per image.
    sequences: Arc<Mutex<HashMap<String, u32>>>,
}

impl Scheduler {
    pub fn new(
        settings: SchedulerSettings,
        global: Arc<dyn GlobalServiceState>,
        executor: SchedulerExecutor,
    ) -> Self {
        let key = service_key(&settings.domain, &settings.service);
        Self {
            settings,
            global,
            executor,
            breaker: Breaker::default(),
            key,
            sequences: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// The service this scheduler reconciles, as keyed in the tracker.
    pub fn service(&self) -> &str {
        &self.key
    }

    pub fn breaker(&self) -> Breaker {
        self.breaker.clone()
    }

    fn label(&self) -> &str {
        &self.key
    }

    /// One reconciliation pass. Returns the number of containers enqueued
    /// for start.
    pub async fn synchronize(
        &self,
        states: &dyn HostContainerStates,
    ) -> Result<u32, ScheduleError> {
        let service = self.key.as_str();
        let release = match self.global.image().await {
            Ok(release) => release,
            Err(RegistryError::NodeNotFound(path)) => {
                log::warn!("{}: no release published at {}", self.label(), path);
                return Ok(0);
            }
            Err(e) => return Err(e.into()),
        };
        if release.image.is_empty() {
            return Err(ScheduleError::NoImage(self.key.clone()));
        }
        let image = release.image.clone();

        let failed = states.count_in_states(service, &image, &[ContainerState::Failed]);
        if self.breaker.is_open(&image) {
            return Err(ScheduleError::BreakerOpen { image, failed });
        }
        if failed >= self.settings.max_attempts {
            self.breaker.trip(&image);
            log::error!(
                target: "herdsman::exception",
                "{}: {} instances of {} failed, scheduling suspended",
                self.label(),
                failed,
                image
            );
            return Err(ScheduleError::BreakerOpen { image, failed });
        }

        let Some(constraint) = self.settings.constraint else {
            log::debug!("{}: no schedule configured", self.label());
            return Ok(0);
        };

        let local = states.count_in_states(
            service,
            &image,
            &[ContainerState::Running, ContainerState::Starting],
        ) as u32;
        let global = self.global.instances().await?;
        let count = constraint.schedule(local, global)?;
        if count == 0 {
            log::debug!(
                "{}: nothing to start ({} local, {} global)",
                self.label(),
                local,
                global
            );
            return Ok(0);
        }

        let jobs: Vec<Job> = (0..count)
            .map(|_| self.start_job(&release.image, &release.version, local))
            .collect();
        log::info!(
            "{}: starting {} of {} ({} local, {} global)",
            self.label(),
            count,
            image,
            local,
            global
        );
        self.executor
            .send(jobs)
            .await
            .map_err(|_| ScheduleError::ExecutorClosed)?;
        Ok(count)
    }

    /// The name is bound when the job runs, so a job that never runs does
    /// not use up a sequence number.
    fn start_job(&self, image: &str, version: &str, local: u32) -> Job {
        let sequences = self.sequences.clone();
        let template = self.settings.name_template.clone();
        let context = NameContext {
            domain: self.settings.domain.clone(),
            service: self.settings.service.clone(),
            image: image.to_string(),
            version: version.to_string(),
            sequence: 0,
        };
        let name = Assignment::deferred(move || {
            let mut context = context.clone();
            context.sequence = {
                let mut sequences = sequences.lock().unwrap_or_else(PoisonError::into_inner);
                let last = sequences.entry(context.image.clone()).or_insert(local);
                *last = (*last).max(local) + 1;
                *last
            };
            render_name(&template, &context).unwrap_or_else(|e| {
                log::error!(target: "herdsman::exception", "Container name for {}: {}", context.service, e);
                format!("{}-{}", context.service, context.sequence)
            })
        });

        Job::Start {
            service: self.key.clone(),
            image: Assignment::Literal(image.to_string()),
            name,
            options: self.settings.options.clone(),
            auth: self.settings.auth.clone(),
        }
    }

    /// Synchronizes at startup, on every notification and every `resync`,
    /// until `true` arrives on `stop`.
    pub async fn run(
        self,
        states: Arc<dyn HostContainerStates>,
        mut changes: HostContainerStatesChanged,
        resync: Duration,
        mut stop: mpsc::Receiver<bool>,
    ) {
        log::info!("Scheduler for {} started", self.label());
        let mut resync = tokio::time::interval(resync);

        loop {
            let result = tokio::select! {
                maybe_stop = stop.recv() => {
                    if maybe_stop.unwrap_or(true) {
                        break;
                    }
                    continue;
                }
                maybe_states = changes.recv() => {
                    match maybe_states {
                        Some(states) => self.synchronize(states.as_ref()).await,
                        None => break,
                    }
                }
                _ = resync.tick() => self.synchronize(states.as_ref()).await,
            };
            match result {
                Ok(_) => {}
                Err(ScheduleError::BreakerOpen { image, failed }) => {
                    log::debug!("{}: breaker open for {} ({} failed)", self.label(), image, failed);
                }
                Err(e) => log::warn!("Synchronization of {} failed: {}", self.label(), e),
            }
        }
        log::info!("Scheduler for {} stopped", self.label());
    }
}
