//! Network configuration

use crate::error::{Result, StackError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::net::Ipv4Addr;
use uuid::Uuid;

/// Network driver types
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkDriver {
    /// Bridge network (default)
    #[default]
    Bridge,
    /// Host network
    Host,
    /// No networking
    None,
}

impl std::fmt::Display for NetworkDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NetworkDriver::Bridge => write!(f, "bridge"),
            NetworkDriver::Host => write!(f, "host"),
            NetworkDriver::None => write!(f, "none"),
        }
    }
}

impl std::str::FromStr for NetworkDriver {
    type Err = StackError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "bridge" => Ok(NetworkDriver::Bridge),
            "host" => Ok(NetworkDriver::Host),
            "none" => Ok(NetworkDriver::None),
            other => Err(StackError::Network(format!(
                "Unsupported network driver: {}",
                other
            ))),
        }
    }
}

/// Network configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Network ID
    pub id: String,
    /// Network name
    pub name: String,
    /// Network driver
    pub driver: NetworkDriver,
    /// Subnet in CIDR form
    pub subnet: String,
    /// Gateway address
    pub gateway: Option<String>,
    /// Internal network (no external access)
    pub internal: bool,
    /// Network labels
    pub labels: BTreeMap<String, String>,
    /// Connected containers, keyed by container ID
    pub containers: BTreeMap<String, NetworkContainer>,
    /// Created timestamp
    pub created: DateTime<Utc>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            id: Uuid::new_v4().simple().to_string()[..12].to_string(),
            name: String::new(),
            driver: NetworkDriver::default(),
            subnet: "172.17.0.0/16".to_string(),
            gateway: Some("172.17.0.1".to_string()),
            internal: false,
            labels: BTreeMap::new(),
            containers: BTreeMap::new(),
            created: Utc::now(),
        }
    }
}

impl NetworkConfig {
    /// Create a new network configuration
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }

    /// Set network driver
    pub fn driver(mut self, driver: NetworkDriver) -> Self {
        self.driver = driver;
        self
    }

    /// Set subnet; the gateway moves to the subnet's first address
    pub fn subnet(mut self, subnet: &str) -> Self {
        self.subnet = subnet.to_string();
        self.gateway = None;
        self
    }

    /// Set gateway
    pub fn gateway(mut self, gateway: &str) -> Self {
        self.gateway = Some(gateway.to_string());
        self
    }

    /// Add label
    pub fn label(mut self, key: &str, value: &str) -> Self {
        self.labels.insert(key.to_string(), value.to_string());
        self
    }

    /// Set internal
    pub fn internal(mut self, internal: bool) -> Self {
        self.internal = internal;
        self
    }
}

/// Container network connection info
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkContainer {
    /// Container ID
    pub container_id: String,
    /// Container name
    pub name: String,
    /// Names this endpoint answers to besides the container name
    pub aliases: Vec<String>,
    /// Endpoint ID
    pub endpoint_id: String,
    /// MAC address
    pub mac_address: String,
    /// IPv4 address with prefix
    pub ipv4_address: Option<String>,
}

impl NetworkContainer {
    /// Whether `name` resolves to this endpoint
    pub fn answers_to(&self, name: &str) -> bool {
        self.name == name || self.aliases.iter().any(|a| a == name)
    }

    /// IPv4 address without the prefix length
    pub fn ip(&self) -> Option<Ipv4Addr> {
        self.ipv4_address
            .as_deref()
            .and_then(|s| s.split('/').next())
            .and_then(|s| s.parse().ok())
    }
}

/// IP address allocator for one subnet
#[derive(Debug, Clone)]
pub struct IpAllocator {
    /// Network address
    network: u32,
    /// Prefix length
    prefix: u8,
    /// Allocated addresses
    allocated: BTreeSet<u32>,
}

impl IpAllocator {
    /// Create a new IP allocator for a subnet such as `172.17.0.0/16`
    pub fn new(subnet: &str) -> Result<Self> {
        let (base, prefix) = subnet
            .split_once('/')
            .ok_or_else(|| StackError::Network(format!("Invalid subnet: {}", subnet)))?;

        let base: Ipv4Addr = base
            .parse()
            .map_err(|_| StackError::Network(format!("Invalid IP: {}", base)))?;
        let prefix: u8 = prefix
            .parse()
            .ok()
            .filter(|p| (8..=30).contains(p))
            .ok_or_else(|| StackError::Network(format!("Invalid prefix: {}", prefix)))?;

        let mask = u32::MAX << (32 - prefix);
        let network = u32::from(base) & mask;

        // Gateway takes the first host address
        let mut allocated = BTreeSet::new();
        allocated.insert(network + 1);

        Ok(Self {
            network,
            prefix,
            allocated,
        })
    }

    /// Prefix length of the subnet
    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    /// Gateway address
    pub fn gateway(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.network + 1)
    }

    /// Allocate the lowest free address
    pub fn allocate(&mut self) -> Result<Ipv4Addr> {
        let broadcast = self.network | (u32::MAX >> self.prefix);

        let candidate = (self.network + 2..broadcast)
            .find(|ip| !self.allocated.contains(ip))
            .ok_or_else(|| StackError::Network("Address pool exhausted".to_string()))?;

        self.allocated.insert(candidate);
        Ok(Ipv4Addr::from(candidate))
    }

    /// Mark an address as in use
    pub fn reserve(&mut self, ip: Ipv4Addr) {
        self.allocated.insert(u32::from(ip));
    }

    /// Release an IP address
    pub fn release(&mut self, ip: Ipv4Addr) {
        let ip = u32::from(ip);
        if ip != self.network + 1 {
            self.allocated.remove(&ip);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_network_config_builder() {
        let config = NetworkConfig::new("stack_backend")
            .subnet("10.0.0.0/24")
            .gateway("10.0.0.1")
            .label("com.docker.compose.project", "stack")
            .internal(true);

        assert_eq!(config.name, "stack_backend");
        assert_eq!(config.driver, NetworkDriver::Bridge);
        assert!(config.internal);
        assert_eq!(config.labels.len(), 1);
    }

    #[test]
    fn test_ip_allocator() {
        let mut allocator = IpAllocator::new("172.17.0.0/16").unwrap();
        assert_eq!(allocator.gateway(), Ipv4Addr::new(172, 17, 0, 1));

        let ip1 = allocator.allocate().unwrap();
        assert_eq!(ip1, Ipv4Addr::new(172, 17, 0, 2));

        let ip2 = allocator.allocate().unwrap();
        assert_eq!(ip2, Ipv4Addr::new(172, 17, 0, 3));

        allocator.release(ip1);
        assert_eq!(allocator.allocate().unwrap(), ip1);
    }

    #[test]
    fn test_ip_allocator_exhaustion() {
        let mut allocator = IpAllocator::new("192.168.1.0/30").unwrap();
        // .0 network, .1 gateway, .2 host, .3 broadcast
        assert_eq!(allocator.allocate().unwrap(), Ipv4Addr::new(192, 168, 1, 2));
        assert!(allocator.allocate().is_err());
    }

    #[test]
    fn test_invalid_subnet() {
        assert!(IpAllocator::new("172.17.0.0").is_err());
        assert!(IpAllocator::new("not-an-ip/16").is_err());
        assert!(IpAllocator::new("10.0.0.0/31").is_err());
    }
}
