//! Error types for stackrun

use thiserror::Error;

/// Result type for stackrun operations
pub type Result<T> = std::result::Result<T, StackError>;

/// stackrun error types
#[derive(Error, Debug)]
pub enum StackError {
    #[error("Container error: {0}")]
    Container(String),

    #[error("Container not found: {0}")]
    ContainerNotFound(String),

    #[error("Container already exists: {0}")]
    ContainerExists(String),

    #[error("Container already running: {0}")]
    ContainerAlreadyRunning(String),

    #[error("Container not running: {0}")]
    ContainerNotRunning(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Network not found: {0}")]
    NetworkNotFound(String),

    #[error("Volume error: {0}")]
    Volume(String),

    #[error("Compose error: {0}")]
    Compose(String),

    #[error("Compose file parse error: {0}")]
    ComposeParse(String),

    #[error("Circular dependency between services: {}", .0.join(" -> "))]
    CircularDependency(Vec<String>),

    #[error("Service '{service}' depends on unknown service '{dependency}'")]
    UnknownDependency { service: String, dependency: String },

    #[error("Host port {port}/{protocol} is bound by both '{first}' and '{second}'")]
    PortConflict {
        port: u16,
        protocol: String,
        first: String,
        second: String,
    },

    #[error("Service not found: {0}")]
    ServiceNotFound(String),

    #[error("Service '{service}' failed to start after {attempts} attempts: {reason}")]
    StartFailed {
        service: String,
        attempts: u32,
        reason: String,
    },

    #[error("Service '{0}' did not become ready")]
    NotReady(String),

    #[error("Launcher error: {0}")]
    Launch(String),

    #[error("Lock error: {0}")]
    Lock(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl From<serde_yaml::Error> for StackError {
    fn from(e: serde_yaml::Error) -> Self {
        StackError::Yaml(e.to_string())
    }
}
