//! Error taxonomy for registry, routing and lifecycle operations

use std::path::PathBuf;
use std::time::Duration;

/// Kind of registry entity a lookup was made for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Project,
    Service,
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntityKind::Project => write!(f, "project"),
            EntityKind::Service => write!(f, "service"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A project or service name is absent from the registry
    #[error("{kind} not found: {name}")]
    NotFound { kind: EntityKind, name: String },

    /// A routing domain resolves to two different targets
    #[error("domain {domain} is claimed twice: {first} and {second}")]
    ConfigurationConflict {
        domain: String,
        first: String,
        second: String,
    },

    /// An external command exited non-zero
    #[error("command `{command}` failed in {} with exit code {}", cwd.display(), exit_code(code))]
    CommandFailure {
        command: String,
        cwd: PathBuf,
        code: Option<i32>,
    },

    /// An external command did not exit within its bounded wait
    #[error("command `{command}` in {} timed out after {}s", cwd.display(), timeout.as_secs())]
    CommandTimeout {
        command: String,
        cwd: PathBuf,
        timeout: Duration,
    },

    /// The registry (or settings) failed semantic validation
    #[error("validation failed:\n  - {}", .0.join("\n  - "))]
    Validation(Vec<String>),

    /// A webhook delivery failed signature verification
    #[error("webhook signature verification failed")]
    InvalidSignature,

    /// Another writer holds the registry lock
    #[error("registry is locked by another writer ({})", .0.display())]
    Locked(PathBuf),

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("invalid JSON payload: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid settings: {0}")]
    Config(#[from] toml::de::Error),
}

impl Error {
    pub fn project_not_found(name: impl Into<String>) -> Self {
        Error::NotFound {
            kind: EntityKind::Project,
            name: name.into(),
        }
    }

    pub fn service_not_found(project: &str, service: &str) -> Self {
        Error::NotFound {
            kind: EntityKind::Service,
            name: format!("{}/{}", project, service),
        }
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether this error came from a lookup of a missing entity
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }
}

fn exit_code(code: &Option<i32>) -> String {
    match code {
        Some(c) => c.to_string(),
        None => "none".to_string(),
    }
}

pub type Result<T> = std::result::Result<T, Error>;
