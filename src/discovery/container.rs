use std::collections::HashMap;

use chrono::{DateTime, Utc};

/// A port mapping as reported by the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContainerPort {
    /// Port inside the container.
    pub private: u16,
    /// Host port it is published on, if any.
    pub public: Option<u16>,
}

/// Runtime-neutral snapshot of a container.
///
/// Fields the runtime could not report are left empty: a container seen only
/// through a `destroy` event typically has an id, an image and its labels but
/// no environment and no start time.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Container {
    pub id: String,
    /// Name without the leading `/` Docker prepends.
    pub name: String,
    pub image: String,
    pub labels: HashMap<String, String>,
    /// `KEY=VALUE` pairs.
    pub env: Vec<String>,
    pub ports: Vec<ContainerPort>,
    pub running: bool,
    pub exit_code: Option<i64>,
    pub started_at: Option<DateTime<Utc>>,
}

impl Container {
    pub fn exposes(&self, port: u16) -> bool {
        self.ports
            .iter()
            .any(|p| p.private == port || p.public == Some(port))
    }

    pub fn env_value(&self, key: &str) -> Option<&str> {
        self.env.iter().find_map(|pair| {
            let (k, v) = pair.split_once('=')?;
            (k == key).then_some(v)
        })
    }

    /// Short form of the id used in log lines.
    pub fn short_id(&self) -> &str {
        let end = self.id.len().min(12);
        &self.id[..end]
    }
}
