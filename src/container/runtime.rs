//! Container runtime implementation

use super::config::{ContainerConfig, ContainerStatus};
use crate::error::{Result, StackError};
use crate::network::NetworkConfig;
use async_trait::async_trait;
use chrono::Utc;
use std::path::{Path, PathBuf};

/// Backend that actually launches and signals container processes
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Launch the container's process, returning its PID if there is one
    async fn spawn(&self, config: &ContainerConfig) -> Result<Option<u32>>;

    /// Deliver a signal to the container's process
    async fn signal(&self, config: &ContainerConfig, signal: i32) -> Result<()>;

    /// Block until the container's process exits and return its exit code
    async fn wait(&self, config: &ContainerConfig) -> Result<i32>;

    /// Run a command inside a running container and return its exit code
    async fn exec(&self, container: &str, command: &[String]) -> Result<i32>;

    /// Drop whatever the backend keeps for a removed container
    async fn remove(&self, config: &ContainerConfig) -> Result<()>;

    /// Make a project network available to containers
    async fn create_network(&self, network: &NetworkConfig) -> Result<()>;

    async fn remove_network(&self, name: &str) -> Result<()>;
}

/// Runtime that only records lifecycle transitions.
///
/// No process isolation happens here; the manager's bookkeeping is the
/// whole effect. Processes never exit on their own and every command run
/// inside a container succeeds. Used for dry runs and tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct RecordingRuntime;

#[async_trait]
impl ContainerRuntime for RecordingRuntime {
    async fn spawn(&self, config: &ContainerConfig) -> Result<Option<u32>> {
        if config.image.is_empty() {
            return Err(StackError::Container(format!(
                "Container {} has no image",
                config.name
            )));
        }
        tracing::debug!(container = %config.name, image = %config.image, "recorded container start");
        Ok(None)
    }

    async fn signal(&self, config: &ContainerConfig, signal: i32) -> Result<()> {
        tracing::debug!(container = %config.name, signal, "recorded container signal");
        Ok(())
    }

    async fn wait(&self, _config: &ContainerConfig) -> Result<i32> {
        std::future::pending().await
    }

    async fn exec(&self, container: &str, command: &[String]) -> Result<i32> {
        tracing::debug!(container, command = ?command, "recorded exec");
        Ok(0)
    }

    async fn remove(&self, config: &ContainerConfig) -> Result<()> {
        tracing::debug!(container = %config.name, "recorded container removal");
        Ok(())
    }

    async fn create_network(&self, network: &NetworkConfig) -> Result<()> {
        tracing::debug!(network = %network.name, "recorded network creation");
        Ok(())
    }

    async fn remove_network(&self, name: &str) -> Result<()> {
        tracing::debug!(network = name, "recorded network removal");
        Ok(())
    }
}

/// Container instance.
///
/// Only tracks state; the manager drives the runtime and feeds the
/// results back through these transitions.
#[derive(Debug)]
pub struct Container {
    /// Container configuration
    pub config: ContainerConfig,
    /// Container bundle path
    pub bundle: PathBuf,
}

impl Container {
    /// Create a new container
    pub fn new(config: ContainerConfig, base_path: &Path) -> Self {
        let bundle = base_path.join(&config.id);
        Self { config, bundle }
    }

    /// Get container ID
    pub fn id(&self) -> &str {
        &self.config.id
    }

    /// Check if container is running
    pub fn is_running(&self) -> bool {
        self.config.status == ContainerStatus::Running
    }

    /// Fail unless the container may be started
    pub fn ensure_startable(&self) -> Result<()> {
        if self.is_running() {
            return Err(StackError::ContainerAlreadyRunning(self.config.id.clone()));
        }
        Ok(())
    }

    /// Apply the outcome of a spawn
    pub fn finish_start(&mut self, spawned: Result<Option<u32>>) -> Result<()> {
        match spawned {
            Ok(pid) => {
                self.config.status = ContainerStatus::Running;
                self.config.started_at = Some(Utc::now());
                self.config.finished_at = None;
                self.config.exit_code = None;
                self.config.stopped_by_user = false;
                self.config.pid = pid;
                Ok(())
            }
            Err(e) => {
                self.config.status = ContainerStatus::Dead;
                self.config.finished_at = Some(Utc::now());
                self.config.exit_code = Some(127);
                self.config.pid = None;
                Err(e)
            }
        }
    }

    /// Record that the user asked for a stop, before any signal is sent
    pub fn begin_stop(&mut self) -> Result<()> {
        if !matches!(
            self.config.status,
            ContainerStatus::Running | ContainerStatus::Restarting
        ) {
            return Err(StackError::ContainerNotRunning(self.config.id.clone()));
        }
        self.config.stopped_by_user = true;
        Ok(())
    }

    /// Record that the process is gone after a user stop or kill
    pub fn mark_stopped(&mut self, exit_code: i32) {
        self.config.status = ContainerStatus::Stopped;
        self.config.stopped_by_user = true;
        self.config.finished_at = Some(Utc::now());
        self.config.exit_code = Some(exit_code);
        self.config.pid = None;
    }

    /// Record that the container's process exited without user involvement
    pub fn mark_exited(&mut self, exit_code: i32) {
        self.config.status = ContainerStatus::Exited;
        self.config.finished_at = Some(Utc::now());
        self.config.exit_code = Some(exit_code);
        self.config.pid = None;
    }

    /// Remove the container's on-disk state
    pub fn remove_bundle(&self) -> Result<()> {
        if self.is_running() {
            return Err(StackError::Container(
                "Cannot remove a running container".to_string(),
            ));
        }

        if self.bundle.exists() {
            std::fs::remove_dir_all(&self.bundle)?;
        }

        Ok(())
    }
}
