//! Compose orchestrator
//!
//! Brings a project up wave by wave. Every service in a wave is started on
//! its own task; the next wave begins only once the whole wave is started
//! (and ready, where a dependent asked for that).

use super::config::{ComposeConfig, DependencyCondition, ServiceConfig};
use super::graph::DependencyGraph;
use super::parser::ComposeParser;
use crate::container::{
    ContainerConfig, ContainerManager, ContainerStatus, PortMapping, RestartPolicy, VolumeMount,
};
use crate::error::{Result, StackError};
use crate::network::{NetworkConfig, NetworkDriver, NetworkManager};
use crate::readiness::{probe_for_service, wait_until_ready, ReadinessProbe};
use crate::storage::{prepare_host_paths, BindMount, MountSource};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;

/// Label carrying the project a container or network belongs to
pub const PROJECT_LABEL: &str = "com.docker.compose.project";

/// Label carrying the service a container runs
pub const SERVICE_LABEL: &str = "com.docker.compose.service";

/// Label carrying the compose-level network name
pub const NETWORK_LABEL: &str = "com.docker.compose.network";

/// How `up` starts services
#[derive(Debug, Clone)]
pub struct StartupOptions {
    /// Give up on a service after this many failed starts; `None` retries
    /// for as long as the restart policy allows
    pub max_start_attempts: Option<u32>,
    /// Delay before the first retry
    pub backoff_initial: Duration,
    /// Upper bound for the retry delay
    pub backoff_max: Duration,
    /// Wait on every registered probe, not only on `service_healthy` edges
    pub wait_ready: bool,
    /// Probe attempts before a service counts as not ready
    pub probe_retries: usize,
    /// Delay between the first two probe attempts
    pub probe_interval: Duration,
}

impl Default for StartupOptions {
    fn default() -> Self {
        Self {
            max_start_attempts: None,
            backoff_initial: Duration::from_millis(500),
            backoff_max: Duration::from_secs(30),
            wait_ready: false,
            probe_retries: 30,
            probe_interval: Duration::from_secs(1),
        }
    }
}

/// Observed state of one service
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    pub service: String,
    pub container: String,
    pub id: Option<String>,
    pub status: Option<ContainerStatus>,
    pub ports: Vec<PortMapping>,
    pub restart_count: u32,
}

/// Compose orchestrator
pub struct ComposeOrchestrator {
    /// Project name
    project_name: String,
    /// Compose configuration
    config: ComposeConfig,
    /// Container manager
    container_manager: Arc<ContainerManager>,
    /// Network manager
    network_manager: Arc<NetworkManager>,
    /// Project working directory, for relative bind mounts
    working_dir: PathBuf,
    options: StartupOptions,
    probes: HashMap<String, Arc<dyn ReadinessProbe>>,
}

impl ComposeOrchestrator {
    /// Create a new orchestrator
    pub fn new(
        project_name: &str,
        config: ComposeConfig,
        container_manager: Arc<ContainerManager>,
        network_manager: Arc<NetworkManager>,
        working_dir: PathBuf,
    ) -> Self {
        Self {
            project_name: project_name.to_string(),
            config,
            container_manager,
            network_manager,
            working_dir,
            options: StartupOptions::default(),
            probes: HashMap::new(),
        }
    }

    /// Replace the startup options
    pub fn with_options(mut self, options: StartupOptions) -> Self {
        self.options = options;
        self
    }

    pub fn project_name(&self) -> &str {
        &self.project_name
    }

    pub fn config(&self) -> &ComposeConfig {
        &self.config
    }

    /// Use `probe` to decide when `service` is ready
    pub fn register_probe(&mut self, service: &str, probe: Arc<dyn ReadinessProbe>) {
        tracing::debug!(service, probe = %probe.describe(), "registered readiness probe");
        self.probes.insert(service.to_string(), probe);
    }

    /// Register the derived readiness probe of every service that has none
    /// yet. Returns how many were added.
    pub fn register_default_probes(&mut self) -> Result<usize> {
        let runtime = self.container_manager.runtime();
        let names: Vec<String> = self.config.services.keys().cloned().collect();
        let mut registered = 0;

        for name in names {
            if self.probes.contains_key(&name) {
                continue;
            }
            let probe = {
                let service = self.config.service(&name)?;
                let container = self.container_name(&name, service);
                probe_for_service(service, &container, Arc::clone(&runtime))?
            };
            if let Some(probe) = probe {
                self.register_probe(&name, probe);
                registered += 1;
            }
        }

        Ok(registered)
    }

    /// Start the whole compose project
    pub async fn up(&self) -> Result<()> {
        self.up_services(&[]).await
    }

    /// Start `services` and everything they depend on; all services when
    /// `services` is empty.
    ///
    /// The configuration is validated and every start is planned before
    /// anything is created, so a rejected topology leaves no partial state
    /// behind.
    pub async fn up_services(&self, services: &[String]) -> Result<()> {
        for warning in ComposeParser::validate(&self.config)? {
            tracing::warn!(project = %self.project_name, "{}", warning);
        }

        let graph = DependencyGraph::from_config(&self.config)?;
        let selected = self.select_services(&graph, services)?;
        let waves: Vec<Vec<String>> = graph
            .start_waves()?
            .into_iter()
            .map(|wave| wave.into_iter().filter(|s| selected.contains(s)).collect::<Vec<_>>())
            .filter(|wave| !wave.is_empty())
            .collect();

        let healthy_targets = self.healthy_targets(&selected)?;
        let plans = waves
            .iter()
            .map(|wave| {
                wave.iter()
                    .map(|name| self.plan_start(name, healthy_targets.contains(name)))
                    .collect::<Result<Vec<_>>>()
            })
            .collect::<Result<Vec<_>>>()?;

        tracing::info!(
            project = %self.project_name,
            services = selected.len(),
            waves = plans.len(),
            "starting compose project"
        );

        self.create_networks(&selected).await?;
        self.prepare_mounts(&selected)?;

        let starter = ServiceStarter {
            containers: Arc::clone(&self.container_manager),
            networks: Arc::clone(&self.network_manager),
            options: self.options.clone(),
        };

        for (index, wave) in plans.into_iter().enumerate() {
            tracing::debug!(wave = index, services = wave.len(), "starting wave");

            let mut tasks = JoinSet::new();
            for job in wave {
                let starter = starter.clone();
                tasks.spawn(async move { job.run(&starter).await });
            }

            while let Some(joined) = tasks.join_next().await {
                let outcome = joined
                    .map_err(|e| StackError::Compose(format!("Start task failed: {}", e)))
                    .and_then(|result| result);
                if let Err(e) = outcome {
                    tasks.abort_all();
                    return Err(e);
                }
            }
        }

        tracing::info!(project = %self.project_name, "compose project is up");
        Ok(())
    }

    /// Follow the project's running containers, applying restart policies
    /// as their processes exit. Returns once every container stays down.
    pub async fn watch(&self) -> Result<()> {
        let running: Vec<ContainerConfig> = self
            .project_containers()?
            .into_iter()
            .filter(|c| c.is_running())
            .collect();

        tracing::info!(project = %self.project_name, containers = running.len(), "watching containers");

        let mut tasks = JoinSet::new();
        for container in running {
            let manager = Arc::clone(&self.container_manager);
            tasks.spawn(async move {
                let result = manager.watch(&container.id).await;
                (container.name, result)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((name, Ok(()))) => tracing::info!(container = %name, "container is down"),
                Ok((name, Err(e))) => {
                    tracing::error!(container = %name, error = %e, "stopped watching container")
                }
                Err(e) => return Err(StackError::Compose(format!("Watch task failed: {}", e))),
            }
        }

        Ok(())
    }

    /// Start containers a host restart left down, as their restart
    /// policies ask. Returns the IDs of the containers started.
    pub async fn resume(&self) -> Result<Vec<String>> {
        let resumed = self.container_manager.resume_after_daemon_restart().await?;
        tracing::info!(project = %self.project_name, resumed = resumed.len(), "resumed containers");
        Ok(resumed)
    }

    /// Stop and remove the project's containers in reverse start order, then
    /// its networks. With `remove_volumes`, host directories that `up`
    /// created are deleted as well.
    pub async fn down(&self, remove_volumes: bool) -> Result<()> {
        tracing::info!(project = %self.project_name, "stopping compose project");

        let order = DependencyGraph::from_config(&self.config)
            .and_then(|graph| graph.stop_order())
            .unwrap_or_default();
        let rank = |service: &str| order.iter().position(|s| s == service).unwrap_or(order.len());

        let mut containers = self.project_containers()?;
        containers.sort_by_key(|c| rank(&c.service));

        for container in &containers {
            self.teardown_container(container).await?;
        }

        let runtime = self.container_manager.runtime();
        for network in self.network_manager.list()? {
            if network.labels.get(PROJECT_LABEL) == Some(&self.project_name) {
                runtime.remove_network(&network.name).await?;
                self.network_manager.remove(&network.name)?;
                tracing::debug!(network = %network.name, "removed network");
            }
        }

        if remove_volumes {
            self.remove_created_dirs()?;
        }

        Ok(())
    }

    /// Start an existing service container
    pub async fn start_service(&self, service_name: &str) -> Result<()> {
        let service = self.config.service(service_name)?;
        let container = self.require_container(service_name)?;

        if container.is_running() {
            tracing::info!(service = service_name, "already running");
            return Ok(());
        }

        let starter = ServiceStarter {
            containers: Arc::clone(&self.container_manager),
            networks: Arc::clone(&self.network_manager),
            options: self.options.clone(),
        };
        starter
            .start_with_retry(service_name, &container.id, service.restart_policy()?)
            .await
    }

    /// Stop a service's container. A stopped service is not restarted by
    /// its restart policy.
    pub async fn stop_service(&self, service_name: &str) -> Result<()> {
        self.config.service(service_name)?;
        let container = self.require_container(service_name)?;

        if container.is_running() {
            self.container_manager.stop(&container.id).await?;
            tracing::info!(service = service_name, container = %container.name, "stopped");
        }

        Ok(())
    }

    /// Restart a service
    pub async fn restart_service(&self, service_name: &str) -> Result<()> {
        self.stop_service(service_name).await?;
        self.start_service(service_name).await
    }

    /// Remove a service's container. Dependents keep running.
    pub async fn remove_service(&self, service_name: &str) -> Result<()> {
        self.config.service(service_name)?;
        let container = self.require_container(service_name)?;
        self.teardown_container(&container).await?;

        let dependents = DependencyGraph::from_config(&self.config)?.dependents(service_name);
        if !dependents.is_empty() {
            tracing::warn!(service = service_name, dependents = ?dependents, "dependents keep running without it");
        }
        Ok(())
    }

    /// Status of every service in the project, by service name
    pub fn status(&self) -> Result<Vec<ServiceStatus>> {
        let mut statuses = Vec::new();

        for (name, service) in &self.config.services {
            let container_name = self.container_name(name, service);
            let status = match self.container_manager.find_by_name(&container_name)? {
                Some(c) => ServiceStatus {
                    service: name.clone(),
                    container: container_name,
                    id: Some(c.id),
                    status: Some(c.status),
                    ports: c.ports,
                    restart_count: c.restart_count,
                },
                None => ServiceStatus {
                    service: name.clone(),
                    container: container_name,
                    id: None,
                    status: None,
                    ports: Vec::new(),
                    restart_count: 0,
                },
            };
            statuses.push(status);
        }

        Ok(statuses)
    }

    /// Project-qualified name of a compose network
    pub fn network_name(&self, network: &str) -> String {
        match self.config.networks.get(network).and_then(|n| n.name.clone()) {
            Some(explicit) => explicit,
            None => format!("{}_{}", self.project_name, network),
        }
    }

    fn container_name(&self, service_name: &str, service: &ServiceConfig) -> String {
        service
            .container_name
            .clone()
            .unwrap_or_else(|| format!("{}-{}-1", self.project_name, service_name))
    }

    fn require_container(&self, service_name: &str) -> Result<ContainerConfig> {
        let service = self.config.service(service_name)?;
        let name = self.container_name(service_name, service);
        self.container_manager
            .find_by_name(&name)?
            .ok_or(StackError::ContainerNotFound(name))
    }

    fn project_containers(&self) -> Result<Vec<ContainerConfig>> {
        Ok(self
            .container_manager
            .list(true)?
            .into_iter()
            .filter(|c| c.labels.get(PROJECT_LABEL) == Some(&self.project_name))
            .collect())
    }

    async fn teardown_container(&self, container: &ContainerConfig) -> Result<()> {
        if container.is_running() {
            self.container_manager.stop(&container.id).await?;
        }

        for network in &container.networks {
            if let Err(e) = self.network_manager.disconnect(network, &container.id) {
                tracing::warn!(container = %container.name, network = %network, error = %e, "disconnect failed");
            }
        }

        self.container_manager.remove(&container.id, true).await?;
        tracing::info!(service = %container.service, container = %container.name, "removed");
        Ok(())
    }

    /// Networks each service joins, `default` when it names none
    fn service_networks(service: &ServiceConfig) -> Vec<String> {
        let networks = service.network_names();
        if networks.is_empty() {
            vec!["default".to_string()]
        } else {
            networks
        }
    }

    /// `services` plus their transitive dependencies, or every service
    fn select_services(
        &self,
        graph: &DependencyGraph,
        services: &[String],
    ) -> Result<BTreeSet<String>> {
        if services.is_empty() {
            return Ok(self.config.services.keys().cloned().collect());
        }

        let mut selected = BTreeSet::new();
        for name in services {
            self.config.service(name)?;
            selected.insert(name.clone());
            selected.extend(graph.transitive_dependencies(name));
        }
        Ok(selected)
    }

    async fn create_networks(&self, selected: &BTreeSet<String>) -> Result<()> {
        let used: BTreeSet<String> = self
            .config
            .services
            .iter()
            .filter(|(name, _)| selected.contains(*name))
            .flat_map(|(_, service)| Self::service_networks(service))
            .collect();

        let runtime = self.container_manager.runtime();
        for network in used {
            let name = self.network_name(&network);
            if self.network_manager.exists(&name)? {
                // The backend may have lost it since the last run
                runtime.create_network(&self.network_manager.get(&name)?).await?;
                continue;
            }

            let declared = self.config.networks.get(&network);
            let driver = match declared.and_then(|n| n.driver.as_deref()) {
                Some(driver) => driver.parse()?,
                None => NetworkDriver::Bridge,
            };

            let config = NetworkConfig::new(&name)
                .driver(driver)
                .subnet(&self.network_manager.next_free_subnet()?)
                .internal(declared.and_then(|n| n.internal).unwrap_or(false))
                .label(PROJECT_LABEL, &self.project_name)
                .label(NETWORK_LABEL, &network);

            runtime.create_network(&config).await?;
            self.network_manager.create(config)?;
            tracing::info!(network = %name, "created network");
        }

        Ok(())
    }

    fn prepare_mounts(&self, selected: &BTreeSet<String>) -> Result<()> {
        let mut mounts = Vec::new();
        for (name, service) in &self.config.services {
            if !selected.contains(name) {
                continue;
            }
            for mount in service.volumes.iter().flatten() {
                mounts.push(BindMount::from_config(mount)?);
            }
        }

        let created = prepare_host_paths(&mounts, &self.working_dir)?;
        if !created.is_empty() {
            let mut ledger = self.read_mount_ledger()?;
            ledger.extend(created);
            ledger.sort();
            ledger.dedup();
            std::fs::write(self.mount_ledger_path(), serde_json::to_string_pretty(&ledger)?)?;
        }

        Ok(())
    }

    /// Delete what `up` created on the host, deepest first. Mounted
    /// directories go with their contents; parents created only to hold
    /// them are removed once empty.
    fn remove_created_dirs(&self) -> Result<()> {
        let mut mounted = BTreeSet::new();
        for service in self.config.services.values() {
            for mount in service.volumes.iter().flatten() {
                if let Some(path) = BindMount::from_config(mount)?.host_path(&self.working_dir) {
                    mounted.insert(path);
                }
            }
        }

        let mut created = self.read_mount_ledger()?;
        created.sort_by_key(|path| std::cmp::Reverse(path.components().count()));

        for path in created {
            if !path.is_dir() {
                continue;
            }
            if mounted.contains(&path) {
                std::fs::remove_dir_all(&path)?;
            } else if std::fs::read_dir(&path)?.next().is_none() {
                std::fs::remove_dir(&path)?;
            } else {
                tracing::debug!(path = %path.display(), "kept non-empty directory");
                continue;
            }
            tracing::debug!(path = %path.display(), "removed host directory");
        }

        let ledger = self.mount_ledger_path();
        if ledger.exists() {
            std::fs::remove_file(ledger)?;
        }
        Ok(())
    }

    /// Host directories `up` created for this project
    fn mount_ledger_path(&self) -> PathBuf {
        self.container_manager
            .base_path()
            .join(format!("{}.mounts.json", self.project_name))
    }

    fn read_mount_ledger(&self) -> Result<Vec<PathBuf>> {
        let path = self.mount_ledger_path();
        if !path.exists() {
            return Ok(Vec::new());
        }
        Ok(serde_json::from_str(&std::fs::read_to_string(path)?)?)
    }

    /// Services some selected dependent waits on with `service_healthy`
    fn healthy_targets(&self, selected: &BTreeSet<String>) -> Result<BTreeSet<String>> {
        let mut targets = BTreeSet::new();
        for (name, service) in &self.config.services {
            if !selected.contains(name) {
                continue;
            }
            for (dependency, condition) in service.dependencies()? {
                match condition {
                    DependencyCondition::Healthy => {
                        targets.insert(dependency);
                    }
                    DependencyCondition::CompletedSuccessfully => {
                        tracing::debug!(
                            dependency = %dependency,
                            "service_completed_successfully is treated as service_started"
                        );
                    }
                    DependencyCondition::Started => {}
                }
            }
        }
        Ok(targets)
    }

    fn plan_start(&self, name: &str, must_be_healthy: bool) -> Result<StartJob> {
        let service = self.config.service(name)?;

        let probe = if must_be_healthy {
            let probe = match self.probes.get(name) {
                Some(probe) => Some(Arc::clone(probe)),
                None => probe_for_service(
                    service,
                    &self.container_name(name, service),
                    self.container_manager.runtime(),
                )?,
            };
            if probe.is_none() {
                return Err(StackError::Compose(format!(
                    "Service '{}' is awaited as healthy but has no readiness probe",
                    name
                )));
            }
            probe
        } else if self.options.wait_ready {
            self.probes.get(name).cloned()
        } else {
            None
        };

        let endpoints = Self::service_networks(service)
            .into_iter()
            .map(|network| {
                let mut aliases = vec![name.to_string()];
                aliases.extend(service.network_aliases(&network));
                (self.network_name(&network), aliases)
            })
            .collect();

        Ok(StartJob {
            service: name.to_string(),
            container: self.service_to_container_config(name, service)?,
            endpoints,
            policy: service.restart_policy()?,
            probe,
        })
    }

    /// Convert service config to container config
    fn service_to_container_config(
        &self,
        service_name: &str,
        service: &ServiceConfig,
    ) -> Result<ContainerConfig> {
        let image = service.image.clone().ok_or_else(|| {
            StackError::Compose(format!("Service '{}' has no image", service_name))
        })?;

        let container_name = self.container_name(service_name, service);
        let mut config = ContainerConfig::new(&container_name, &image);

        config.service = service_name.to_string();
        config.cmd = service.command_args();
        config.env = service.environment_map();
        config.restart_policy = service.restart_policy()?;
        config.hostname = service
            .hostname
            .clone()
            .unwrap_or_else(|| service_name.to_string());

        if let Some(ref wd) = service.working_dir {
            config.working_dir = wd.clone();
        }
        if let Some(ref user) = service.user {
            config.user = user.clone();
        }

        for binding in service.port_bindings()? {
            let Some(host_port) = binding.host_port else {
                continue;
            };
            config.ports.push(PortMapping {
                host_ip: binding.host_ip,
                host_port,
                container_port: binding.container_port,
                protocol: binding.protocol,
            });
        }

        for (index, mount) in service.volumes.iter().flatten().enumerate() {
            let mount = BindMount::from_config(mount)?;
            let host_path = match &mount.source {
                MountSource::Bind(_) => mount.host_path(&self.working_dir).unwrap_or_default(),
                MountSource::Named(volume) => self.volume_path(volume),
                MountSource::Anonymous => {
                    self.volume_path(&format!("{}_anon{}", service_name, index))
                }
            };
            config.volumes.push(VolumeMount {
                host_path: host_path.to_string_lossy().to_string(),
                container_path: mount.target,
                read_only: mount.read_only,
            });
        }

        let networks = Self::service_networks(service);
        config.networks = networks.iter().map(|n| self.network_name(n)).collect();
        config.aliases = vec![service_name.to_string()];
        for alias in networks.iter().flat_map(|n| service.network_aliases(n)) {
            if !config.aliases.contains(&alias) {
                config.aliases.push(alias);
            }
        }

        config.labels = service.label_map();
        config
            .labels
            .insert(PROJECT_LABEL.to_string(), self.project_name.clone());
        config
            .labels
            .insert(SERVICE_LABEL.to_string(), service_name.to_string());

        Ok(config)
    }

    fn volume_path(&self, volume: &str) -> PathBuf {
        volume_root(self.container_manager.base_path())
            .join(format!("{}_{}", self.project_name, volume))
    }
}

fn volume_root(base: &Path) -> PathBuf {
    base.join("volumes")
}

/// Shared handles a start task needs
#[derive(Clone)]
struct ServiceStarter {
    containers: Arc<ContainerManager>,
    networks: Arc<NetworkManager>,
    options: StartupOptions,
}

impl ServiceStarter {
    /// Start a container, retrying with exponential backoff when the
    /// restart policy allows it
    async fn start_with_retry(&self, service: &str, id: &str, policy: RestartPolicy) -> Result<()> {
        let mut delay = self.options.backoff_initial;
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            let error = match self.containers.start(id).await {
                Ok(()) => {
                    tracing::info!(service, attempts, "started");
                    return Ok(());
                }
                Err(e) => e,
            };

            let exhausted = self
                .options
                .max_start_attempts
                .is_some_and(|max| attempts >= max);
            if !policy.retries_start() || exhausted {
                return Err(StackError::StartFailed {
                    service: service.to_string(),
                    attempts,
                    reason: error.to_string(),
                });
            }

            tracing::warn!(
                service,
                attempts,
                retry_in_ms = delay.as_millis() as u64,
                error = %error,
                "start failed, retrying per {} policy",
                policy
            );
            tokio::time::sleep(delay).await;
            delay = std::cmp::min(delay * 2, self.options.backoff_max);
        }
    }

    fn ensure_connected(
        &self,
        network: &str,
        id: &str,
        container_name: &str,
        aliases: &[String],
    ) -> Result<()> {
        if self.networks.get(network)?.containers.contains_key(id) {
            return Ok(());
        }
        let endpoint = self
            .networks
            .connect(network, id, container_name, aliases.to_vec())?;
        tracing::debug!(
            container = container_name,
            network,
            ip = ?endpoint.ipv4_address,
            "connected"
        );
        Ok(())
    }
}

/// Everything needed to bring one service up
struct StartJob {
    service: String,
    container: ContainerConfig,
    /// Project network name and the aliases to register on it
    endpoints: Vec<(String, Vec<String>)>,
    policy: RestartPolicy,
    /// Set when the service must be ready before the next wave
    probe: Option<Arc<dyn ReadinessProbe>>,
}

impl StartJob {
    async fn run(self, starter: &ServiceStarter) -> Result<String> {
        let name = self.container.name.clone();
        let id = match starter.containers.find_by_name(&name)? {
            Some(existing) => existing.id,
            None => starter.containers.create(self.container)?,
        };

        for (network, aliases) in &self.endpoints {
            starter.ensure_connected(network, &id, &name, aliases)?;
        }

        if starter.containers.get(&id)?.is_running() {
            tracing::debug!(service = %self.service, "already running");
        } else {
            starter
                .start_with_retry(&self.service, &id, self.policy)
                .await?;
        }

        if let Some(probe) = self.probe {
            tracing::info!(service = %self.service, probe = %probe.describe(), "waiting for readiness");
            let ready = wait_until_ready(
                probe.as_ref(),
                starter.options.probe_retries,
                starter.options.probe_interval,
            )
            .await;
            if !ready {
                return Err(StackError::NotReady(self.service));
            }
        }

        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::ContainerRuntime;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use tempfile::tempdir;

    /// Records spawn order, fails the first `failures` spawns of `flaky` and
    /// lets services exit once with a queued code
    #[derive(Default)]
    struct ScriptedRuntime {
        spawned: Mutex<Vec<String>>,
        flaky: Option<String>,
        failures: u32,
        attempts: AtomicU32,
        exits: Mutex<HashMap<String, i32>>,
        networks: Mutex<Vec<String>>,
    }

    impl ScriptedRuntime {
        fn flaky(service: &str, failures: u32) -> Self {
            Self {
                flaky: Some(service.to_string()),
                failures,
                ..Self::default()
            }
        }
    }

    #[async_trait]
    impl ContainerRuntime for ScriptedRuntime {
        async fn spawn(&self, config: &ContainerConfig) -> Result<Option<u32>> {
            if self.flaky.as_deref() == Some(config.service.as_str()) {
                let n = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
                if n <= self.failures {
                    return Err(StackError::Container(format!("spawn failure {}", n)));
                }
            }
            self.spawned.lock().unwrap().push(config.service.clone());
            Ok(None)
        }

        async fn signal(&self, _config: &ContainerConfig, _signal: i32) -> Result<()> {
            Ok(())
        }

        async fn wait(&self, config: &ContainerConfig) -> Result<i32> {
            let exit = self.exits.lock().unwrap().remove(&config.service);
            match exit {
                Some(code) => Ok(code),
                None => std::future::pending().await,
            }
        }

        async fn exec(&self, _container: &str, _command: &[String]) -> Result<i32> {
            Ok(0)
        }

        async fn remove(&self, _config: &ContainerConfig) -> Result<()> {
            Ok(())
        }

        async fn create_network(&self, network: &NetworkConfig) -> Result<()> {
            self.networks.lock().unwrap().push(network.name.clone());
            Ok(())
        }

        async fn remove_network(&self, name: &str) -> Result<()> {
            self.networks.lock().unwrap().retain(|n| n != name);
            Ok(())
        }
    }

    fn fast_options() -> StartupOptions {
        StartupOptions {
            backoff_initial: Duration::from_millis(1),
            backoff_max: Duration::from_millis(4),
            ..StartupOptions::default()
        }
    }

    fn orchestrator(
        yaml: &str,
        runtime: Arc<ScriptedRuntime>,
        dir: &Path,
    ) -> ComposeOrchestrator {
        let config = ComposeParser::parse_str(yaml).unwrap();
        let containers =
            Arc::new(ContainerManager::with_runtime(dir.join("containers"), runtime).unwrap());
        let networks = Arc::new(NetworkManager::new().unwrap());
        ComposeOrchestrator::new("test", config, containers, networks, dir.to_path_buf())
            .with_options(fast_options())
    }

    const CHAIN: &str = r#"
services:
  web:
    image: nginx
    restart: unless-stopped
    depends_on:
      - api
  api:
    image: node
    restart: unless-stopped
    depends_on:
      - db
  db:
    image: postgres
    restart: unless-stopped
"#;

    #[tokio::test]
    async fn test_up_starts_dependencies_first() {
        let temp = tempdir().unwrap();
        let runtime = Arc::new(ScriptedRuntime::default());
        let orch = orchestrator(CHAIN, Arc::clone(&runtime), temp.path());

        orch.up().await.unwrap();

        assert_eq!(*runtime.spawned.lock().unwrap(), vec!["db", "api", "web"]);
        let statuses = orch.status().unwrap();
        assert!(statuses
            .iter()
            .all(|s| s.status == Some(ContainerStatus::Running)));
        assert_eq!(statuses[0].container, "test-api-1");
    }

    #[tokio::test]
    async fn test_up_is_idempotent() {
        let temp = tempdir().unwrap();
        let runtime = Arc::new(ScriptedRuntime::default());
        let orch = orchestrator(CHAIN, Arc::clone(&runtime), temp.path());

        orch.up().await.unwrap();
        orch.up().await.unwrap();

        assert_eq!(runtime.spawned.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_cycle_rejected_before_anything_starts() {
        let yaml = r#"
services:
  a:
    image: nginx
    depends_on: [b]
  b:
    image: nginx
    depends_on: [a]
"#;
        let temp = tempdir().unwrap();
        let runtime = Arc::new(ScriptedRuntime::default());
        let orch = orchestrator(yaml, Arc::clone(&runtime), temp.path());

        let err = orch.up().await.unwrap_err();
        assert!(matches!(err, StackError::CircularDependency(_)));
        assert!(runtime.spawned.lock().unwrap().is_empty());
        assert_eq!(orch.container_manager.count().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_failed_start_is_retried() {
        let temp = tempdir().unwrap();
        let runtime = Arc::new(ScriptedRuntime::flaky("db", 2));
        let orch = orchestrator(CHAIN, Arc::clone(&runtime), temp.path());

        orch.up().await.unwrap();

        assert_eq!(runtime.attempts.load(Ordering::SeqCst), 3);
        assert_eq!(*runtime.spawned.lock().unwrap(), vec!["db", "api", "web"]);
    }

    #[tokio::test]
    async fn test_max_start_attempts_names_service() {
        let temp = tempdir().unwrap();
        let runtime = Arc::new(ScriptedRuntime::flaky("db", u32::MAX));
        let orch = orchestrator(CHAIN, Arc::clone(&runtime), temp.path()).with_options(
            StartupOptions {
                max_start_attempts: Some(3),
                ..fast_options()
            },
        );

        match orch.up().await.unwrap_err() {
            StackError::StartFailed {
                service, attempts, ..
            } => {
                assert_eq!(service, "db");
                assert_eq!(attempts, 3);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(runtime.spawned.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_restart_no_fails_immediately() {
        let yaml = "services:\n  once:\n    image: busybox\n    restart: \"no\"\n";
        let temp = tempdir().unwrap();
        let runtime = Arc::new(ScriptedRuntime::flaky("once", 1));
        let orch = orchestrator(yaml, Arc::clone(&runtime), temp.path());

        let err = orch.up().await.unwrap_err();
        assert!(matches!(err, StackError::StartFailed { attempts: 1, .. }));
    }

    #[tokio::test]
    async fn test_services_resolve_on_project_network() {
        let temp = tempdir().unwrap();
        let orch = orchestrator(CHAIN, Arc::new(ScriptedRuntime::default()), temp.path());
        orch.up().await.unwrap();

        let network = orch.network_name("default");
        assert_eq!(network, "test_default");
        for service in ["web", "api", "db"] {
            assert!(orch.network_manager.resolve(&network, service).unwrap().is_some());
        }
    }

    #[tokio::test]
    async fn test_stop_and_start_service() {
        let temp = tempdir().unwrap();
        let orch = orchestrator(CHAIN, Arc::new(ScriptedRuntime::default()), temp.path());
        orch.up().await.unwrap();

        orch.stop_service("api").await.unwrap();
        let api = orch.container_manager.get("test-api-1").unwrap();
        assert_eq!(api.status, ContainerStatus::Stopped);
        assert!(api.stopped_by_user);

        orch.start_service("api").await.unwrap();
        assert!(orch.container_manager.get("test-api-1").unwrap().is_running());
    }

    #[tokio::test]
    async fn test_down_removes_containers_and_network() {
        let temp = tempdir().unwrap();
        let orch = orchestrator(CHAIN, Arc::new(ScriptedRuntime::default()), temp.path());
        orch.up().await.unwrap();

        orch.down(false).await.unwrap();

        assert_eq!(orch.container_manager.count().unwrap(), 0);
        assert!(!orch.network_manager.exists("test_default").unwrap());
    }

    #[tokio::test]
    async fn test_down_with_volumes_removes_created_dirs() {
        let yaml = r#"
services:
  cache:
    image: redis
    volumes:
      - ./data/redis:/data
  db:
    image: mongo
    volumes:
      - ./data/mongo/db:/data/db
"#;
        let temp = tempdir().unwrap();
        std::fs::create_dir(temp.path().join("keep")).unwrap();
        let orch = orchestrator(yaml, Arc::new(ScriptedRuntime::default()), temp.path());

        orch.up().await.unwrap();
        let dir = temp.path().join("data/redis");
        assert!(dir.is_dir());
        std::fs::write(dir.join("dump.rdb"), b"x").unwrap();

        orch.down(true).await.unwrap();
        assert!(!temp.path().join("data").exists());
        assert!(temp.path().join("keep").is_dir());
    }

    #[tokio::test]
    async fn test_healthy_dependency_waits_for_probe() {
        struct Ready;

        #[async_trait]
        impl ReadinessProbe for Ready {
            async fn check(&self) -> Result<bool> {
                Ok(true)
            }
            fn timeout(&self) -> Duration {
                Duration::from_millis(10)
            }
            fn describe(&self) -> String {
                "always ready".to_string()
            }
        }

        let yaml = r#"
services:
  app:
    image: app
    volumes:
      - ./data/app:/data
    depends_on:
      db:
        condition: service_healthy
  db:
    image: postgres
"#;
        let temp = tempdir().unwrap();
        let runtime = Arc::new(ScriptedRuntime::default());
        let mut orch = orchestrator(yaml, Arc::clone(&runtime), temp.path());

        // Nothing is created when a healthy target cannot be checked
        let err = orch.up().await.unwrap_err();
        assert!(matches!(err, StackError::Compose(_)));
        assert!(!orch.network_manager.exists("test_default").unwrap());
        assert!(runtime.networks.lock().unwrap().is_empty());
        assert!(!temp.path().join("data").exists());

        orch.register_probe("db", Arc::new(Ready));
        orch.up().await.unwrap();
        assert_eq!(*runtime.spawned.lock().unwrap(), vec!["db", "app"]);
    }

    #[tokio::test]
    async fn test_healthcheck_makes_dependency_checkable() {
        let yaml = r#"
services:
  app:
    image: app
    depends_on:
      db:
        condition: service_healthy
  db:
    image: postgres
    healthcheck:
      test: ["CMD", "pg_isready"]
"#;
        let temp = tempdir().unwrap();
        let mut orch = orchestrator(yaml, Arc::new(ScriptedRuntime::default()), temp.path());
        assert_eq!(orch.register_default_probes().unwrap(), 1);
        orch.up().await.unwrap();
        assert!(orch.container_manager.get("test-app-1").unwrap().is_running());
    }

    #[tokio::test]
    async fn test_up_selected_service_brings_its_dependencies() {
        let temp = tempdir().unwrap();
        let runtime = Arc::new(ScriptedRuntime::default());
        let orch = orchestrator(CHAIN, Arc::clone(&runtime), temp.path());

        orch.up_services(&["api".to_string()]).await.unwrap();

        assert_eq!(*runtime.spawned.lock().unwrap(), vec!["db", "api"]);
        assert!(orch.container_manager.find_by_name("test-web-1").unwrap().is_none());

        let err = orch.up_services(&["nope".to_string()]).await.unwrap_err();
        assert!(matches!(err, StackError::ServiceNotFound(_)));
    }

    #[tokio::test]
    async fn test_networks_are_created_on_the_runtime() {
        let temp = tempdir().unwrap();
        let runtime = Arc::new(ScriptedRuntime::default());
        let orch = orchestrator(CHAIN, Arc::clone(&runtime), temp.path());

        orch.up().await.unwrap();
        assert_eq!(*runtime.networks.lock().unwrap(), vec!["test_default"]);
        let db = orch.container_manager.get("test-db-1").unwrap();
        assert_eq!(db.networks, vec!["test_default"]);
        assert_eq!(db.aliases, vec!["db"]);

        orch.down(false).await.unwrap();
        assert!(runtime.networks.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_watch_applies_restart_policy() {
        let temp = tempdir().unwrap();
        let runtime = Arc::new(ScriptedRuntime::default());
        let orch = orchestrator(CHAIN, Arc::clone(&runtime), temp.path());
        orch.up().await.unwrap();

        runtime.exits.lock().unwrap().insert("db".to_string(), 1);
        // The other services never exit, so watching only ends on timeout
        let watched = tokio::time::timeout(Duration::from_millis(200), orch.watch()).await;
        assert!(watched.is_err());

        let db = orch.container_manager.get("test-db-1").unwrap();
        assert!(db.is_running());
        assert_eq!(db.restart_count, 1);
        assert_eq!(runtime.spawned.lock().unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_remove_service_keeps_dependents() {
        let temp = tempdir().unwrap();
        let orch = orchestrator(CHAIN, Arc::new(ScriptedRuntime::default()), temp.path());
        orch.up().await.unwrap();

        orch.remove_service("db").await.unwrap();

        assert!(orch.container_manager.find_by_name("test-db-1").unwrap().is_none());
        assert!(orch.container_manager.get("test-api-1").unwrap().is_running());
        assert!(orch.container_manager.get("test-web-1").unwrap().is_running());
    }
}
