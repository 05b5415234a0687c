//! Container configuration

use crate::error::{Result, StackError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Container status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    /// Container is created but not running
    Created,
    /// Container is running
    Running,
    /// Container is waiting to be restarted after an exit
    Restarting,
    /// Container was stopped by the user
    Stopped,
    /// Container process exited on its own
    Exited,
    /// Container could not be started
    Dead,
}

impl std::fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ContainerStatus::Created => write!(f, "created"),
            ContainerStatus::Running => write!(f, "running"),
            ContainerStatus::Restarting => write!(f, "restarting"),
            ContainerStatus::Stopped => write!(f, "stopped"),
            ContainerStatus::Exited => write!(f, "exited"),
            ContainerStatus::Dead => write!(f, "dead"),
        }
    }
}

/// Restart policy, with Docker's semantics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RestartPolicy {
    /// Never restart
    #[default]
    No,
    /// Always restart, including after the daemon comes back
    Always,
    /// Restart only when the exit code is non-zero
    OnFailure,
    /// Restart unless the user stopped the container
    UnlessStopped,
}

impl RestartPolicy {
    /// Whether an exit not initiated by the user leads to a restart
    pub fn restarts_on_exit(&self, exit_code: i32) -> bool {
        match self {
            RestartPolicy::No => false,
            RestartPolicy::OnFailure => exit_code != 0,
            RestartPolicy::Always | RestartPolicy::UnlessStopped => true,
        }
    }

    /// Whether a failed start attempt may be retried
    pub fn retries_start(&self) -> bool {
        !matches!(self, RestartPolicy::No)
    }

    /// Whether the container comes back when the daemon restarts
    pub fn resumes_after_daemon_restart(&self, stopped_by_user: bool) -> bool {
        match self {
            RestartPolicy::Always => true,
            RestartPolicy::UnlessStopped | RestartPolicy::OnFailure => !stopped_by_user,
            RestartPolicy::No => false,
        }
    }
}

impl std::fmt::Display for RestartPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RestartPolicy::No => write!(f, "no"),
            RestartPolicy::Always => write!(f, "always"),
            RestartPolicy::OnFailure => write!(f, "on-failure"),
            RestartPolicy::UnlessStopped => write!(f, "unless-stopped"),
        }
    }
}

impl std::str::FromStr for RestartPolicy {
    type Err = StackError;

    fn from_str(s: &str) -> Result<Self> {
        // on-failure[:max-retries] is accepted; the retry count is not tracked
        match s.split(':').next().unwrap_or(s) {
            "no" | "\"no\"" => Ok(RestartPolicy::No),
            "always" => Ok(RestartPolicy::Always),
            "on-failure" => Ok(RestartPolicy::OnFailure),
            "unless-stopped" => Ok(RestartPolicy::UnlessStopped),
            other => Err(StackError::InvalidConfig(format!(
                "Unknown restart policy: {}",
                other
            ))),
        }
    }
}

/// Container configuration and runtime state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerConfig {
    /// Unique container ID
    pub id: String,
    /// Container name
    pub name: String,
    /// Compose service this container belongs to
    pub service: String,
    /// Image name/tag
    pub image: String,
    /// Command to run
    pub cmd: Vec<String>,
    /// Environment variables
    pub env: BTreeMap<String, String>,
    /// Working directory
    pub working_dir: String,
    /// User to run as
    pub user: String,
    /// Published ports
    pub ports: Vec<PortMapping>,
    /// Volume mounts
    pub volumes: Vec<VolumeMount>,
    /// Container labels
    pub labels: BTreeMap<String, String>,
    /// Hostname
    pub hostname: String,
    /// Networks the container is attached to
    pub networks: Vec<String>,
    /// Names other containers on the same networks can use
    #[serde(default)]
    pub aliases: Vec<String>,
    /// Restart policy
    pub restart_policy: RestartPolicy,
    /// Current status
    pub status: ContainerStatus,
    /// Set when the user explicitly stopped the container
    pub stopped_by_user: bool,
    /// Number of automatic restarts
    pub restart_count: u32,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Start time
    pub started_at: Option<DateTime<Utc>>,
    /// Stop time
    pub finished_at: Option<DateTime<Utc>>,
    /// Exit code
    pub exit_code: Option<i32>,
    /// Process ID
    pub pid: Option<u32>,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            id: Uuid::new_v4().simple().to_string()[..12].to_string(),
            name: String::new(),
            service: String::new(),
            image: String::new(),
            cmd: Vec::new(),
            env: BTreeMap::new(),
            working_dir: "/".to_string(),
            user: String::new(),
            ports: Vec::new(),
            volumes: Vec::new(),
            labels: BTreeMap::new(),
            hostname: String::new(),
            networks: Vec::new(),
            aliases: Vec::new(),
            restart_policy: RestartPolicy::No,
            status: ContainerStatus::Created,
            stopped_by_user: false,
            restart_count: 0,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            exit_code: None,
            pid: None,
        }
    }
}

impl ContainerConfig {
    /// Create a new container configuration
    pub fn new(name: &str, image: &str) -> Self {
        Self {
            name: name.to_string(),
            image: image.to_string(),
            hostname: name.to_string(),
            ..Self::default()
        }
    }

    /// Add environment variable
    pub fn env(mut self, key: &str, value: &str) -> Self {
        self.env.insert(key.to_string(), value.to_string());
        self
    }

    /// Add port mapping
    pub fn port(mut self, host_port: u16, container_port: u16) -> Self {
        self.ports.push(PortMapping {
            host_ip: None,
            host_port,
            container_port,
            protocol: Protocol::Tcp,
        });
        self
    }

    /// Add volume mount
    pub fn volume(mut self, host_path: &str, container_path: &str) -> Self {
        self.volumes.push(VolumeMount {
            host_path: host_path.to_string(),
            container_path: container_path.to_string(),
            read_only: false,
        });
        self
    }

    /// Set restart policy
    pub fn restart(mut self, policy: RestartPolicy) -> Self {
        self.restart_policy = policy;
        self
    }

    pub fn is_running(&self) -> bool {
        self.status == ContainerStatus::Running
    }
}

/// Port mapping
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMapping {
    pub host_ip: Option<String>,
    pub host_port: u16,
    pub container_port: u16,
    pub protocol: Protocol,
}

impl std::fmt::Display for PortMapping {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{}->{}/{}",
            self.host_ip.as_deref().unwrap_or("0.0.0.0"),
            self.host_port,
            self.container_port,
            self.protocol
        )
    }
}

/// Network protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "tcp"),
            Protocol::Udp => write!(f, "udp"),
        }
    }
}

impl std::str::FromStr for Protocol {
    type Err = StackError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            other => Err(StackError::InvalidConfig(format!(
                "Unknown protocol: {}",
                other
            ))),
        }
    }
}

/// Volume mount
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeMount {
    pub host_path: String,
    pub container_path: String,
    pub read_only: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_restart_policy_parse() {
        assert_eq!("unless-stopped".parse::<RestartPolicy>().unwrap(), RestartPolicy::UnlessStopped);
        assert_eq!("on-failure:3".parse::<RestartPolicy>().unwrap(), RestartPolicy::OnFailure);
        assert_eq!("no".parse::<RestartPolicy>().unwrap(), RestartPolicy::No);
        assert!("sometimes".parse::<RestartPolicy>().is_err());
    }

    #[test]
    fn test_restart_policy_semantics() {
        let policy = RestartPolicy::UnlessStopped;
        assert!(policy.restarts_on_exit(1));
        assert!(policy.restarts_on_exit(0));
        assert!(!policy.resumes_after_daemon_restart(true));
        assert!(policy.resumes_after_daemon_restart(false));

        assert!(RestartPolicy::Always.resumes_after_daemon_restart(true));
        assert!(!RestartPolicy::OnFailure.restarts_on_exit(0));
        assert!(!RestartPolicy::No.retries_start());
    }

    #[test]
    fn test_container_config_builder() {
        let config = ContainerConfig::new("stack-redis-1", "redis:5.0")
            .port(6379, 6379)
            .volume("/opt/stack/data/redis", "/data")
            .restart(RestartPolicy::UnlessStopped);

        assert_eq!(config.hostname, "stack-redis-1");
        assert_eq!(config.ports[0].to_string(), "0.0.0.0:6379->6379/tcp");
        assert_eq!(config.volumes.len(), 1);
        assert_eq!(config.status, ContainerStatus::Created);
        assert_eq!(config.id.len(), 12);
    }
}
