//! Container lifecycle management

use super::config::{ContainerConfig, ContainerStatus};
use super::runtime::{Container, ContainerRuntime, RecordingRuntime};
use crate::error::{Result, StackError};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

/// State file kept under the manager's base path
pub const STATE_FILE: &str = "state.json";

/// What happened after a container's process exited on its own
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitOutcome {
    /// The restart policy brought the container back
    Restarted { restart_count: u32 },
    /// The container stays down
    Exited,
}

/// Container manager for handling container lifecycle.
///
/// The state lock is never held across a runtime call: each operation
/// snapshots the config, drives the runtime, then applies the outcome and
/// persists it, whether the runtime succeeded or not.
pub struct ContainerManager {
    /// All containers indexed by ID
    containers: Arc<RwLock<HashMap<String, Container>>>,
    /// Base path for container storage
    base_path: PathBuf,
    /// Backend that launches processes
    runtime: Arc<dyn ContainerRuntime>,
    /// Where state is persisted, if anywhere
    state_file: Option<PathBuf>,
}

impl ContainerManager {
    /// Create an in-memory container manager
    pub fn new(base_path: PathBuf) -> Result<Self> {
        Self::with_runtime(base_path, Arc::new(RecordingRuntime))
    }

    /// Create an in-memory container manager backed by `runtime`
    pub fn with_runtime(base_path: PathBuf, runtime: Arc<dyn ContainerRuntime>) -> Result<Self> {
        std::fs::create_dir_all(&base_path)?;

        Ok(Self {
            containers: Arc::new(RwLock::new(HashMap::new())),
            base_path,
            runtime,
            state_file: None,
        })
    }

    /// Open a persistent manager that only records transitions
    pub fn open(base_path: PathBuf) -> Result<Self> {
        Self::open_with_runtime(base_path, Arc::new(RecordingRuntime))
    }

    /// Open a manager whose state survives across processes
    pub fn open_with_runtime(
        base_path: PathBuf,
        runtime: Arc<dyn ContainerRuntime>,
    ) -> Result<Self> {
        let mut manager = Self::with_runtime(base_path, runtime)?;
        manager.state_file = Some(manager.base_path.join(STATE_FILE));
        manager.reload()?;
        Ok(manager)
    }

    /// Replace in-memory state with what is on disk.
    ///
    /// Another invocation may have stopped or removed containers since
    /// this manager was opened. No-op for in-memory managers.
    pub fn reload(&self) -> Result<()> {
        let Some(state_file) = &self.state_file else {
            return Ok(());
        };
        if !state_file.exists() {
            return Ok(());
        }

        let content = std::fs::read_to_string(state_file)?;
        let configs: Vec<ContainerConfig> = serde_json::from_str(&content)?;

        let mut containers = self.write_lock()?;
        containers.clear();
        for config in configs {
            let container = Container::new(config, &self.base_path);
            containers.insert(container.id().to_string(), container);
        }
        tracing::debug!(path = %state_file.display(), "loaded container state");
        Ok(())
    }

    /// Base path for container bundles
    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Backend this manager drives
    pub fn runtime(&self) -> Arc<dyn ContainerRuntime> {
        Arc::clone(&self.runtime)
    }

    /// Create a new container
    pub fn create(&self, config: ContainerConfig) -> Result<String> {
        let container = Container::new(config, &self.base_path);
        let id = container.id().to_string();

        let mut containers = self.write_lock()?;

        if containers.contains_key(&id)
            || containers.values().any(|c| c.config.name == container.config.name)
        {
            return Err(StackError::ContainerExists(container.config.name.clone()));
        }

        std::fs::create_dir_all(&container.bundle)?;
        containers.insert(id.clone(), container);
        self.persist(&containers)?;
        Ok(id)
    }

    /// Start a container
    pub async fn start(&self, id_or_name: &str) -> Result<()> {
        let config = self.snapshot(id_or_name, |c| c.ensure_startable())?;
        let spawned = self.runtime.spawn(&config).await;
        self.update(&config.id, |c| c.finish_start(spawned))
    }

    /// Stop a container; a user stop never triggers a restart
    pub async fn stop(&self, id_or_name: &str) -> Result<()> {
        // The stop intent is on disk before the process sees a signal, so a
        // watcher that observes the exit never restarts it.
        let config = self.update(id_or_name, |c| {
            c.begin_stop()?;
            Ok(c.config.clone())
        })?;

        if config.status == ContainerStatus::Running {
            if let Err(e) = self.runtime.signal(&config, libc::SIGTERM).await {
                self.update(&config.id, |c| {
                    c.config.stopped_by_user = false;
                    Ok(())
                })?;
                return Err(e);
            }
        }

        self.update(&config.id, |c| {
            c.mark_stopped(0);
            Ok(())
        })
    }

    /// Remove a container. Other containers are left untouched.
    pub async fn remove(&self, id_or_name: &str, force: bool) -> Result<()> {
        let config = self.get(id_or_name)?;

        if config.is_running() {
            if !force {
                return Err(StackError::Container(
                    "Cannot remove a running container".to_string(),
                ));
            }
            self.update(&config.id, |c| c.begin_stop())?;
            self.runtime.signal(&config, libc::SIGKILL).await?;
            self.update(&config.id, |c| {
                c.mark_stopped(128 + libc::SIGKILL);
                Ok(())
            })?;
        }

        self.runtime.remove(&config).await?;

        let removed = {
            let mut containers = self.write_lock()?;
            let removed = containers.remove(&config.id);
            self.persist(&containers)?;
            removed
        };
        if let Some(container) = removed {
            container.remove_bundle()?;
        }
        Ok(())
    }

    /// Record that a container's process exited on its own and apply its
    /// restart policy
    pub async fn record_exit(&self, id_or_name: &str, exit_code: i32) -> Result<ExitOutcome> {
        let config = self.update(id_or_name, |c| {
            if !c.is_running() {
                return Err(StackError::ContainerNotRunning(c.id().to_string()));
            }
            c.mark_exited(exit_code);
            if !c.config.stopped_by_user && c.config.restart_policy.restarts_on_exit(exit_code) {
                c.config.status = ContainerStatus::Restarting;
            }
            Ok(c.config.clone())
        })?;

        if config.status != ContainerStatus::Restarting {
            tracing::info!(container = %config.name, exit_code, "container exited");
            return Ok(ExitOutcome::Exited);
        }

        let spawned = self.runtime.spawn(&config).await;
        self.update(&config.id, |c| {
            c.config.restart_count += 1;
            c.finish_start(spawned)?;
            tracing::warn!(
                container = %c.config.name,
                exit_code,
                restart_count = c.config.restart_count,
                "container exited, restarted per {} policy",
                c.config.restart_policy
            );
            Ok(ExitOutcome::Restarted {
                restart_count: c.config.restart_count,
            })
        })
    }

    /// Bring back containers the way a restarted daemon would.
    ///
    /// Returns the IDs of the containers that were started. A container
    /// that fails to start is recorded as dead and the rest still resume.
    pub async fn resume_after_daemon_restart(&self) -> Result<Vec<String>> {
        let candidates: Vec<ContainerConfig> = {
            let containers = self.read_lock()?;
            containers
                .values()
                .filter(|c| !c.is_running())
                .filter(|c| {
                    c.config
                        .restart_policy
                        .resumes_after_daemon_restart(c.config.stopped_by_user)
                })
                .map(|c| c.config.clone())
                .collect()
        };

        let mut resumed = Vec::new();
        for config in candidates {
            let spawned = self.runtime.spawn(&config).await;
            match self.update(&config.id, |c| c.finish_start(spawned)) {
                Ok(()) => resumed.push(config.id),
                Err(e) => {
                    tracing::error!(container = %config.name, error = %e, "failed to resume container")
                }
            }
        }

        resumed.sort();
        Ok(resumed)
    }

    /// Follow a running container until it stays down.
    ///
    /// Each exit reported by the runtime is fed through the restart policy.
    /// Returns once the container exits for good, or once another
    /// invocation has stopped or removed it.
    pub async fn watch(&self, id_or_name: &str) -> Result<()> {
        loop {
            let config = match self.get(id_or_name) {
                Ok(config) if config.is_running() => config,
                Ok(_) | Err(StackError::ContainerNotFound(_)) => return Ok(()),
                Err(e) => return Err(e),
            };

            let waited = self.runtime.wait(&config).await;
            self.reload()?;
            let exit_code = match waited {
                Ok(code) => code,
                // Removed by another invocation while we waited
                Err(_) if !self.get(&config.id).is_ok_and(|c| c.is_running()) => return Ok(()),
                Err(e) => return Err(e),
            };

            match self.record_exit(&config.id, exit_code).await {
                Ok(ExitOutcome::Restarted { .. }) => continue,
                Ok(ExitOutcome::Exited) => return Ok(()),
                Err(StackError::ContainerNotRunning(_)) | Err(StackError::ContainerNotFound(_)) => {
                    tracing::debug!(container = %config.name, exit_code, "exit after stop");
                    return Ok(());
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Get container by ID or name
    pub fn get(&self, id_or_name: &str) -> Result<ContainerConfig> {
        let containers = self.read_lock()?;
        containers
            .get(id_or_name)
            .or_else(|| containers.values().find(|c| c.config.name == id_or_name))
            .map(|c| c.config.clone())
            .ok_or_else(|| StackError::ContainerNotFound(id_or_name.to_string()))
    }

    /// List containers, sorted by name
    pub fn list(&self, all: bool) -> Result<Vec<ContainerConfig>> {
        let containers = self.read_lock()?;

        let mut result: Vec<ContainerConfig> = containers
            .values()
            .filter(|c| all || c.is_running())
            .map(|c| c.config.clone())
            .collect();
        result.sort_by(|a, b| a.name.cmp(&b.name));

        Ok(result)
    }

    /// Find container by name
    pub fn find_by_name(&self, name: &str) -> Result<Option<ContainerConfig>> {
        let containers = self.read_lock()?;

        Ok(containers
            .values()
            .find(|c| c.config.name == name)
            .map(|c| c.config.clone()))
    }

    /// Get container count
    pub fn count(&self) -> Result<usize> {
        Ok(self.read_lock()?.len())
    }

    /// Get running container count
    pub fn running_count(&self) -> Result<usize> {
        let containers = self.read_lock()?;
        Ok(containers.values().filter(|c| c.is_running()).count())
    }

    /// Check a container and clone its config without changing anything
    fn snapshot(
        &self,
        id_or_name: &str,
        check: impl FnOnce(&Container) -> Result<()>,
    ) -> Result<ContainerConfig> {
        let mut containers = self.write_lock()?;
        let container = Self::lookup_mut(&mut containers, id_or_name)?;
        check(container)?;
        Ok(container.config.clone())
    }

    /// Apply a transition and persist, even when the transition fails
    fn update<T>(
        &self,
        id_or_name: &str,
        apply: impl FnOnce(&mut Container) -> Result<T>,
    ) -> Result<T> {
        let mut containers = self.write_lock()?;
        let container = Self::lookup_mut(&mut containers, id_or_name)?;
        let result = apply(container);
        self.persist(&containers)?;
        result
    }

    fn lookup_mut<'a>(
        containers: &'a mut HashMap<String, Container>,
        id_or_name: &str,
    ) -> Result<&'a mut Container> {
        let id = if containers.contains_key(id_or_name) {
            id_or_name.to_string()
        } else {
            containers
                .values()
                .find(|c| c.config.name == id_or_name)
                .map(|c| c.id().to_string())
                .ok_or_else(|| StackError::ContainerNotFound(id_or_name.to_string()))?
        };

        containers
            .get_mut(&id)
            .ok_or_else(|| StackError::ContainerNotFound(id_or_name.to_string()))
    }

    fn persist(&self, containers: &HashMap<String, Container>) -> Result<()> {
        let Some(path) = &self.state_file else {
            return Ok(());
        };

        let mut configs: Vec<&ContainerConfig> = containers.values().map(|c| &c.config).collect();
        configs.sort_by(|a, b| a.name.cmp(&b.name));
        std::fs::write(path, serde_json::to_string_pretty(&configs)?)?;
        Ok(())
    }

    fn read_lock(&self) -> Result<std::sync::RwLockReadGuard<'_, HashMap<String, Container>>> {
        self.containers
            .read()
            .map_err(|_| StackError::Lock("Failed to acquire read lock".to_string()))
    }

    fn write_lock(&self) -> Result<std::sync::RwLockWriteGuard<'_, HashMap<String, Container>>> {
        self.containers
            .write()
            .map_err(|_| StackError::Lock("Failed to acquire write lock".to_string()))
    }
}
