use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::auth::AuthLookup;
use crate::runtime::ContainerOptions;

/// A value fixed either when the job is built or when it runs.
#[derive(Clone)]
pub enum Assignment {
    Literal(String),
    /// Evaluated by the executor right before use.
    Deferred(Arc<dyn Fn() -> String + Send + Sync>),
}

impl Assignment {
    pub fn deferred(f: impl Fn() -> String + Send + Sync + 'static) -> Self {
        Self::Deferred(Arc::new(f))
    }

    pub fn resolve(&self) -> String {
        match self {
            Self::Literal(value) => value.clone(),
            Self::Deferred(f) => f(),
        }
    }
}

impl fmt::Debug for Assignment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Literal(value) => f.debug_tuple("Literal").field(value).finish(),
            Self::Deferred(_) => f.write_str("Deferred"),
        }
    }
}

impl From<&str> for Assignment {
    fn from(value: &str) -> Self {
        Self::Literal(value.to_string())
    }
}

/// An action for the schedule executor.
#[derive(Clone)]
pub enum Job {
    Start {
        /// `domain/service`, for log lines.
        service: String,
        image: Assignment,
        name: Assignment,
        options: ContainerOptions,
        /// Falls back to the executor's lookup when unset.
        auth: Option<AuthLookup>,
    },
    Stop {
        container_id: String,
        timeout: Duration,
    },
    Remove {
        container_id: String,
        force: bool,
    },
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Job::Start {
                service,
                image,
                name,
                ..
            } => f
                .debug_struct("Start")
                .field("service", service)
                .field("image", image)
                .field("name", name)
                .finish_non_exhaustive(),
            Job::Stop {
                container_id,
                timeout,
            } => f
                .debug_struct("Stop")
                .field("container_id", container_id)
                .field("timeout", timeout)
                .finish(),
            Job::Remove {
                container_id,
                force,
            } => f
                .debug_struct("Remove")
                .field("container_id", container_id)
                .field("force", force)
                .finish(),
        }
    }
}
