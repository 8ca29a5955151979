use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::cli::Args;
use crate::config::{ConfigError, HerdsmanConfig};
use crate::discovery::{Discovery, service_key};
use crate::registry::StandaloneServiceState;
use crate::runtime::{ContainerRuntime, DockerRuntime, RuntimeError};
use crate::scheduler::{ScheduleExecutor, Scheduler, SchedulerSettings};
use crate::tracker::{ContainerTracker, HostContainerStates};
use crate::vacuum::{Vacuum, VacuumConfigError};

mod auth;
mod cli;
mod config;
mod discovery;
mod fsm;
mod registry;
mod runtime;
mod scheduler;
mod signals;
mod template;
mod tracker;
mod vacuum;

#[derive(Debug, thiserror::Error)]
enum StartupError {
    #[error("{0}")]
    Config(#[from] ConfigError),
    #[error("{0}")]
    Runtime(#[from] RuntimeError),
    #[error("Invalid vacuum: {0}")]
    Vacuum(#[from] VacuumConfigError),
    #[error("Unable to install signal handlers: {0}")]
    Signals(#[from] std::io::Error),
}

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize the logger
    env_logger::init();

    let args = cli::get_cli_args();
    let config = match HerdsmanConfig::try_init(&args.config) {
        Ok(config) => config,
        Err(e) => {
            log::error!("Unable to load {}: {}", args.config.display(), e);
            return ExitCode::FAILURE;
        }
    };

    match run(config, args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(config: HerdsmanConfig, args: &Args) -> Result<(), StartupError> {
    let runtime: Arc<dyn ContainerRuntime> =
        Arc::new(DockerRuntime::connect(config.docker_socket.as_deref())?);
    let tracker = ContainerTracker::new();
    let states: Arc<dyn HostContainerStates> = Arc::new(tracker.clone());

    let matcher = Arc::new(config.matcher()?);
    let discovery = Arc::new(Discovery::new(matcher, tracker.clone(), runtime.clone()));
    let classified = discovery.scan().await?;
    log::info!("Initial scan classified {} containers", classified);

    let (executor, executor_handle) =
        ScheduleExecutor::new(runtime.clone(), auth::default_lookup()).start();

    let mut schedulers = Vec::new();
    for (domain, service) in config.services() {
        let Some(release) = &service.release else {
            continue;
        };
        let global = Arc::new(StandaloneServiceState::new(
            &service_key(&domain.name, &service.name),
            release,
            tracker.clone(),
        ));
        let settings = SchedulerSettings {
            domain: domain.name.clone(),
            service: service.name.clone(),
            constraint: service.schedule,
            max_attempts: config.max_attempts,
            name_template: service.name_template.clone(),
            options: service.container.clone(),
            auth: None,
        };
        schedulers.push(Scheduler::new(settings, global, executor.clone()));
    }

    if args.once {
        for scheduler in &schedulers {
            if let Err(e) = scheduler.synchronize(states.as_ref()).await {
                log::warn!("Synchronization of {} failed: {}", scheduler.service(), e);
            }
        }
        // The executor drains its inbox once every sender is gone
        drop(schedulers);
        drop(executor);
        let _ = executor_handle.await;
        return Ok(());
    }

    let mut stops = Vec::new();
    let mut breakers = Vec::new();
    let mut handles = Vec::new();

    for scheduler in schedulers {
        let changes = tracker.add_states_listener(scheduler.service());
        let (stop, stop_rx) = mpsc::channel(1);
        breakers.push(scheduler.breaker());
        stops.push(stop);
        handles.push(tokio::spawn(scheduler.run(
            states.clone(),
            changes,
            config.resync_interval(),
            stop_rx,
        )));
    }

    for (domain, service) in config.services() {
        let Some(vacuum) = &service.vacuum else {
            continue;
        };
        let key = service_key(&domain.name, &service.name);
        let vacuum = Vacuum::new(&key, vacuum, states.clone(), runtime.clone())?;
        let (stop, handle) = vacuum.start();
        stops.push(stop);
        handles.push(handle);
    }

    let scan_interval = args
        .scan_interval
        .map(|seconds| Duration::from_secs(seconds.max(1)))
        .unwrap_or_else(|| config.scan_interval());
    let (stop, stop_rx) = mpsc::channel(1);
    stops.push(stop);
    handles.push(tokio::spawn(discovery.watch(scan_interval, stop_rx)));

    signals::handle_shutdown(stops)?;
    signals::handle_reset(breakers)?;
    let _ = sd_notify::notify(true, &[sd_notify::NotifyState::Ready]);

    for handle in futures::future::join_all(handles).await {
        if let Err(e) = handle {
            log::error!("Task failed: {}", e);
        }
    }

    drop(executor);
    let _ = executor_handle.await;
    Ok(())
}
