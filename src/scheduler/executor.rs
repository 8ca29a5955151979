use std::sync::Arc;

use bollard::auth::DockerCredentials;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::job::Job;
use super::ScheduleError;
use crate::auth::AuthLookup;
use crate::runtime::{ContainerRuntime, RuntimeError};

/// Inbox of the schedule executor. Sends wait while a batch is executing.
pub type SchedulerExecutor = mpsc::Sender<Vec<Job>>;

const INBOX_CAPACITY: usize = 1;

/// Executes job batches one at a time, each job in order.
pub struct ScheduleExecutor {
    runtime: Arc<dyn ContainerRuntime>,
    auth: AuthLookup,
}

impl ScheduleExecutor {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, auth: AuthLookup) -> Self {
        Self { runtime, auth }
    }

    /// Spawns the executor. It stops once every sender is dropped.
    pub fn start(self) -> (SchedulerExecutor, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(INBOX_CAPACITY);
        let handle = tokio::spawn(self.run(rx));
        (tx, handle)
    }

    async fn run(self, mut inbox: mpsc::Receiver<Vec<Job>>) {
        log::info!("Schedule executor started");
        while let Some(jobs) = inbox.recv().await {
            for job in jobs {
                if let Err(e) = self.execute(&job).await {
                    log::error!(target: "herdsman::exception", "Job {:?} failed: {}", job, e);
                }
            }
        }
        log::info!("Schedule executor stopped");
    }

    /// Credential helpers are external processes, so the lookup runs on the
    /// blocking pool.
    async fn credentials(&self, auth: Option<&AuthLookup>, image: &str) -> Option<DockerCredentials> {
        let lookup = auth.unwrap_or(&self.auth).clone();
        let image = image.to_string();
        tokio::task::spawn_blocking(move || lookup(&image))
            .await
            .unwrap_or_else(|e| {
                log::warn!("Credential lookup failed: {}", e);
                None
            })
    }

    pub async fn execute(&self, job: &Job) -> Result<(), ScheduleError> {
        match job {
            Job::Start {
                service,
                image,
                name,
                options,
                auth,
            } => {
                let image = image.resolve();
                let credentials = self.credentials(auth.as_ref(), &image).await;
                let done = self.runtime.pull_image(credentials, &image).await?;
                done.await
                    .map_err(|_| RuntimeError::PullAbandoned(image.clone()))??;

                let name = name.resolve();
                let container = self.runtime.start_container(&name, &image, options).await?;
                log::info!(
                    "Started {} ({}) for {} from {}",
                    name,
                    container.short_id(),
                    service,
                    image
                );
                Ok(())
            }
            // Stopping and removing is left to the vacuum
            Job::Stop { container_id, .. } => {
                log::debug!("Ignoring stop job for {}", container_id);
                Ok(())
            }
            Job::Remove { container_id, .. } => {
                log::debug!("Ignoring remove job for {}", container_id);
                Ok(())
            }
        }
    }
}
