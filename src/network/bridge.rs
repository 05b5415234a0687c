//! Bridge network implementation

use super::config::{IpAllocator, NetworkConfig, NetworkContainer, NetworkDriver};
use crate::error::{Result, StackError};
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use uuid::Uuid;

/// State file for networks
pub const NETWORK_STATE_FILE: &str = "networks.json";

/// Names of the networks that always exist
const BUILTIN_NETWORKS: &[&str] = &["bridge", "host", "none"];

/// Bridge network
pub struct BridgeNetwork {
    /// Network configuration
    pub config: NetworkConfig,
    /// IP allocator
    allocator: IpAllocator,
}

impl BridgeNetwork {
    /// Create a bridge network, re-reserving addresses of already
    /// connected containers
    pub fn new(mut config: NetworkConfig) -> Result<Self> {
        let mut allocator = IpAllocator::new(&config.subnet)?;

        if config.gateway.is_none() {
            config.gateway = Some(allocator.gateway().to_string());
        }
        for container in config.containers.values() {
            if let Some(ip) = container.ip() {
                allocator.reserve(ip);
            }
        }

        Ok(Self { config, allocator })
    }

    /// Connect a container to this network
    pub fn connect(
        &mut self,
        container_id: &str,
        container_name: &str,
        aliases: Vec<String>,
    ) -> Result<NetworkContainer> {
        if self.config.containers.contains_key(container_id) {
            return Err(StackError::Network(format!(
                "Container {} already connected to network {}",
                container_name, self.config.name
            )));
        }

        let ipv4_address = match self.config.driver {
            NetworkDriver::Bridge => {
                let ip = self.allocator.allocate()?;
                Some(format!("{}/{}", ip, self.allocator.prefix()))
            }
            NetworkDriver::Host | NetworkDriver::None => None,
        };

        let container = NetworkContainer {
            container_id: container_id.to_string(),
            name: container_name.to_string(),
            aliases,
            endpoint_id: Uuid::new_v4().simple().to_string()[..12].to_string(),
            mac_address: generate_mac_address(),
            ipv4_address,
        };

        self.config
            .containers
            .insert(container_id.to_string(), container.clone());

        Ok(container)
    }

    /// Disconnect a container from this network
    pub fn disconnect(&mut self, container_id: &str) -> Result<()> {
        let container = self.config.containers.remove(container_id).ok_or_else(|| {
            StackError::Network(format!(
                "Container {} not connected to network {}",
                container_id, self.config.name
            ))
        })?;

        if let Some(ip) = container.ip() {
            self.allocator.release(ip);
        }

        Ok(())
    }

    /// Resolve a container name or alias to its address on this network
    pub fn resolve(&self, name: &str) -> Option<Ipv4Addr> {
        self.config
            .containers
            .values()
            .find(|c| c.answers_to(name))
            .and_then(|c| c.ip())
    }
}

/// Network manager for handling all networks
pub struct NetworkManager {
    /// Networks indexed by ID
    networks: Arc<RwLock<HashMap<String, BridgeNetwork>>>,
    /// Name to ID mapping
    names: Arc<RwLock<HashMap<String, String>>>,
    /// Where state is persisted, if anywhere
    state_file: Option<PathBuf>,
}

impl NetworkManager {
    /// Create a new in-memory network manager
    pub fn new() -> Result<Self> {
        let manager = Self {
            networks: Arc::new(RwLock::new(HashMap::new())),
            names: Arc::new(RwLock::new(HashMap::new())),
            state_file: None,
        };

        manager.create_default_networks()?;
        Ok(manager)
    }

    /// Open a manager whose state survives across processes
    pub fn open(base_path: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&base_path)?;
        let state_file = base_path.join(NETWORK_STATE_FILE);

        let mut manager = Self {
            networks: Arc::new(RwLock::new(HashMap::new())),
            names: Arc::new(RwLock::new(HashMap::new())),
            state_file: None,
        };

        if state_file.exists() {
            let content = std::fs::read_to_string(&state_file)?;
            let configs: Vec<NetworkConfig> = serde_json::from_str(&content)?;
            for config in configs {
                manager.create(config)?;
            }
        } else {
            manager.create_default_networks()?;
        }

        manager.state_file = Some(state_file);
        Ok(manager)
    }

    /// Create default networks (bridge, host, none)
    fn create_default_networks(&self) -> Result<()> {
        let bridge = NetworkConfig::new("bridge")
            .driver(NetworkDriver::Bridge)
            .subnet("172.17.0.0/16")
            .gateway("172.17.0.1");
        self.create(bridge)?;

        self.create(NetworkConfig::new("host").driver(NetworkDriver::Host))?;
        self.create(NetworkConfig::new("none").driver(NetworkDriver::None))?;

        Ok(())
    }

    /// First `172.N.0.0/16` subnet no existing network uses
    pub fn next_free_subnet(&self) -> Result<String> {
        let networks = self.read_networks()?;
        (18..=31)
            .map(|n| format!("172.{}.0.0/16", n))
            .find(|candidate| networks.values().all(|n| &n.config.subnet != candidate))
            .ok_or_else(|| StackError::Network("No free subnet available".to_string()))
    }

    /// Create a new network
    pub fn create(&self, config: NetworkConfig) -> Result<String> {
        let id = config.id.clone();
        let name = config.name.clone();

        let network = BridgeNetwork::new(config)?;

        let mut networks = self.write_networks()?;
        let mut names = self.write_names()?;

        if names.contains_key(&name) {
            return Err(StackError::Network(format!(
                "Network {} already exists",
                name
            )));
        }

        tracing::debug!(network = %name, subnet = %network.config.subnet, "created network");
        networks.insert(id.clone(), network);
        names.insert(name, id.clone());
        self.persist(&networks)?;

        Ok(id)
    }

    /// Remove a network
    pub fn remove(&self, id_or_name: &str) -> Result<()> {
        let mut networks = self.write_networks()?;
        let mut names = self.write_names()?;

        let id = Self::resolve_id(&networks, &names, id_or_name)?;

        if let Some(network) = networks.get(&id) {
            if BUILTIN_NETWORKS.contains(&network.config.name.as_str()) {
                return Err(StackError::Network(format!(
                    "Network {} is built in and cannot be removed",
                    network.config.name
                )));
            }
            if !network.config.containers.is_empty() {
                return Err(StackError::Network(format!(
                    "Network {} has active endpoints",
                    id_or_name
                )));
            }
            names.remove(&network.config.name);
        }

        networks.remove(&id);
        self.persist(&networks)
    }

    /// Get a network by ID or name
    pub fn get(&self, id_or_name: &str) -> Result<NetworkConfig> {
        let networks = self.read_networks()?;
        let names = self.read_names()?;

        let id = Self::resolve_id(&networks, &names, id_or_name)?;
        networks
            .get(&id)
            .map(|n| n.config.clone())
            .ok_or_else(|| StackError::NetworkNotFound(id_or_name.to_string()))
    }

    /// Whether a network with this name exists
    pub fn exists(&self, name: &str) -> Result<bool> {
        Ok(self.read_names()?.contains_key(name))
    }

    /// List all networks, sorted by name
    pub fn list(&self) -> Result<Vec<NetworkConfig>> {
        let networks = self.read_networks()?;
        let mut result: Vec<NetworkConfig> = networks.values().map(|n| n.config.clone()).collect();
        result.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(result)
    }

    /// Connect a container to a network
    pub fn connect(
        &self,
        network_id_or_name: &str,
        container_id: &str,
        container_name: &str,
        aliases: Vec<String>,
    ) -> Result<NetworkContainer> {
        let mut networks = self.write_networks()?;
        let names = self.read_names()?;

        let id = Self::resolve_id(&networks, &names, network_id_or_name)?;
        let network = networks
            .get_mut(&id)
            .ok_or_else(|| StackError::NetworkNotFound(network_id_or_name.to_string()))?;

        let endpoint = network.connect(container_id, container_name, aliases)?;
        self.persist(&networks)?;
        Ok(endpoint)
    }

    /// Disconnect a container from a network
    pub fn disconnect(&self, network_id_or_name: &str, container_id: &str) -> Result<()> {
        let mut networks = self.write_networks()?;
        let names = self.read_names()?;

        let id = Self::resolve_id(&networks, &names, network_id_or_name)?;
        let network = networks
            .get_mut(&id)
            .ok_or_else(|| StackError::NetworkNotFound(network_id_or_name.to_string()))?;

        network.disconnect(container_id)?;
        self.persist(&networks)
    }

    /// Resolve a service name on a network, the way the embedded DNS would
    pub fn resolve(&self, network_id_or_name: &str, name: &str) -> Result<Option<Ipv4Addr>> {
        let networks = self.read_networks()?;
        let names = self.read_names()?;

        let id = Self::resolve_id(&networks, &names, network_id_or_name)?;
        Ok(networks.get(&id).and_then(|n| n.resolve(name)))
    }

    fn resolve_id(
        networks: &HashMap<String, BridgeNetwork>,
        names: &HashMap<String, String>,
        id_or_name: &str,
    ) -> Result<String> {
        if networks.contains_key(id_or_name) {
            Ok(id_or_name.to_string())
        } else if let Some(id) = names.get(id_or_name) {
            Ok(id.clone())
        } else {
            Err(StackError::NetworkNotFound(id_or_name.to_string()))
        }
    }

    fn persist(&self, networks: &HashMap<String, BridgeNetwork>) -> Result<()> {
        let Some(path) = &self.state_file else {
            return Ok(());
        };

        let mut configs: Vec<&NetworkConfig> = networks.values().map(|n| &n.config).collect();
        configs.sort_by(|a, b| a.name.cmp(&b.name));
        std::fs::write(path, serde_json::to_string_pretty(&configs)?)?;
        Ok(())
    }

    fn read_networks(
        &self,
    ) -> Result<std::sync::RwLockReadGuard<'_, HashMap<String, BridgeNetwork>>> {
        self.networks
            .read()
            .map_err(|_| StackError::Lock("Failed to acquire read lock".to_string()))
    }

    fn write_networks(
        &self,
    ) -> Result<std::sync::RwLockWriteGuard<'_, HashMap<String, BridgeNetwork>>> {
        self.networks
            .write()
            .map_err(|_| StackError::Lock("Failed to acquire write lock".to_string()))
    }

    fn read_names(&self) -> Result<std::sync::RwLockReadGuard<'_, HashMap<String, String>>> {
        self.names
            .read()
            .map_err(|_| StackError::Lock("Failed to acquire read lock".to_string()))
    }

    fn write_names(&self) -> Result<std::sync::RwLockWriteGuard<'_, HashMap<String, String>>> {
        self.names
            .write()
            .map_err(|_| StackError::Lock("Failed to acquire write lock".to_string()))
    }
}

/// Generate a random MAC address
fn generate_mac_address() -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();

    // Locally administered, unicast
    let bytes: [u8; 6] = [0x02, rng.gen(), rng.gen(), rng.gen(), rng.gen(), rng.gen()];

    format!(
        "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5]
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_network_manager_default_networks() {
        let manager = NetworkManager::new().unwrap();

        let bridge = manager.get("bridge").unwrap();
        assert_eq!(bridge.driver, NetworkDriver::Bridge);

        let host = manager.get("host").unwrap();
        assert_eq!(host.driver, NetworkDriver::Host);
    }

    #[test]
    fn test_resolve_by_name_and_alias() {
        let manager = NetworkManager::new().unwrap();
        let subnet = manager.next_free_subnet().unwrap();
        assert_eq!(subnet, "172.18.0.0/16");
        manager
            .create(NetworkConfig::new("stack_backend").subnet(&subnet))
            .unwrap();

        let endpoint = manager
            .connect(
                "stack_backend",
                "c1",
                "stack-elasticsearch-1",
                vec!["elasticsearch".to_string()],
            )
            .unwrap();
        assert_eq!(endpoint.ipv4_address.as_deref(), Some("172.18.0.2/16"));

        let ip = manager.resolve("stack_backend", "elasticsearch").unwrap();
        assert_eq!(ip, Some(Ipv4Addr::new(172, 18, 0, 2)));
        assert_eq!(manager.resolve("stack_backend", "mongo").unwrap(), None);

        // Active endpoints block removal
        assert!(manager.remove("stack_backend").is_err());
        manager.disconnect("stack_backend", "c1").unwrap();
        manager.remove("stack_backend").unwrap();
        assert!(!manager.exists("stack_backend").unwrap());
    }

    #[test]
    fn test_state_persists_across_open() {
        let temp = tempdir().unwrap();
        {
            let manager = NetworkManager::open(temp.path().to_path_buf()).unwrap();
            manager
                .create(NetworkConfig::new("stack_backend").subnet("172.18.0.0/16"))
                .unwrap();
            manager
                .connect("stack_backend", "c1", "redis-1", vec!["redis".to_string()])
                .unwrap();
        }

        let manager = NetworkManager::open(temp.path().to_path_buf()).unwrap();
        assert!(manager.exists("bridge").unwrap());
        // The reloaded allocator must not hand out the address again
        let endpoint = manager
            .connect("stack_backend", "c2", "mongo-1", Vec::new())
            .unwrap();
        assert_eq!(endpoint.ipv4_address.as_deref(), Some("172.18.0.3/16"));
    }

    #[test]
    fn test_builtin_networks_cannot_be_removed() {
        let manager = NetworkManager::new().unwrap();
        assert!(manager.remove("bridge").is_err());
        assert!(manager.exists("bridge").unwrap());

        manager.create(NetworkConfig::new("unused").subnet("10.1.0.0/16")).unwrap();
        manager.remove("unused").unwrap();
        assert!(!manager.exists("unused").unwrap());
    }
}
