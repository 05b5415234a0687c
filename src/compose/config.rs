//! Compose file configuration types

use crate::container::{Protocol, RestartPolicy};
use crate::error::{Result, StackError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Compose file configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComposeConfig {
    /// Compose file version
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Project name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Services
    #[serde(default)]
    pub services: BTreeMap<String, ServiceConfig>,
    /// Networks
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub networks: BTreeMap<String, NetworkConfig>,
    /// Named volumes
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub volumes: BTreeMap<String, VolumeConfig>,
}

impl Default for ComposeConfig {
    fn default() -> Self {
        Self {
            version: Some("3.6".to_string()),
            name: None,
            services: BTreeMap::new(),
            networks: BTreeMap::new(),
            volumes: BTreeMap::new(),
        }
    }
}

impl ComposeConfig {
    /// Look up a service by name
    pub fn service(&self, name: &str) -> Result<&ServiceConfig> {
        self.services
            .get(name)
            .ok_or_else(|| StackError::ServiceNotFound(name.to_string()))
    }

    /// Names of the networks declared at top level, or `default` if none are
    pub fn network_names(&self) -> Vec<String> {
        if self.networks.is_empty() {
            vec!["default".to_string()]
        } else {
            self.networks.keys().cloned().collect()
        }
    }
}

/// Service configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Image reference
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    /// Command override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<CommandConfig>,
    /// Container name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_name: Option<String>,
    /// Hostname
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    /// Environment variables
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<EnvironmentConfig>,
    /// Port mappings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ports: Option<Vec<PortConfig>>,
    /// Volume mounts
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volumes: Option<Vec<VolumeMount>>,
    /// Networks to join
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub networks: Option<NetworksConfig>,
    /// Service dependencies
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub depends_on: Option<DependsOnConfig>,
    /// Healthcheck configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub healthcheck: Option<HealthcheckConfig>,
    /// Labels
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<LabelsConfig>,
    /// Restart policy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restart: Option<String>,
    /// Working directory
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    /// User
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
}

impl ServiceConfig {
    /// Declared dependencies with the condition each edge waits for
    pub fn dependencies(&self) -> Result<Vec<(String, DependencyCondition)>> {
        match &self.depends_on {
            None => Ok(Vec::new()),
            Some(DependsOnConfig::Array(arr)) => Ok(arr
                .iter()
                .map(|name| (name.clone(), DependencyCondition::Started))
                .collect()),
            Some(DependsOnConfig::Map(map)) => map
                .iter()
                .map(|(name, cond)| Ok((name.clone(), cond.condition.parse()?)))
                .collect(),
        }
    }

    /// Names of the services this one depends on
    pub fn dependency_names(&self) -> Vec<String> {
        match &self.depends_on {
            None => Vec::new(),
            Some(DependsOnConfig::Array(arr)) => arr.clone(),
            Some(DependsOnConfig::Map(map)) => map.keys().cloned().collect(),
        }
    }

    /// Environment flattened into a map; keys without a value are dropped
    pub fn environment_map(&self) -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();
        match &self.environment {
            None => {}
            Some(EnvironmentConfig::Array(arr)) => {
                for item in arr {
                    if let Some((key, value)) = item.split_once('=') {
                        env.insert(key.to_string(), value.to_string());
                    }
                }
            }
            Some(EnvironmentConfig::Map(map)) => {
                for (key, value) in map {
                    if let Some(v) = value {
                        env.insert(key.clone(), v.to_scalar_string());
                    }
                }
            }
        }
        env
    }

    /// Networks this service joins
    pub fn network_names(&self) -> Vec<String> {
        match &self.networks {
            None => Vec::new(),
            Some(NetworksConfig::Array(arr)) => arr.clone(),
            Some(NetworksConfig::Map(map)) => map.keys().cloned().collect(),
        }
    }

    /// Aliases this service is reachable by on `network`
    pub fn network_aliases(&self, network: &str) -> Vec<String> {
        match &self.networks {
            Some(NetworksConfig::Map(map)) => map
                .get(network)
                .and_then(|cfg| cfg.as_ref())
                .and_then(|cfg| cfg.aliases.clone())
                .unwrap_or_default(),
            _ => Vec::new(),
        }
    }

    /// Parsed port bindings
    pub fn port_bindings(&self) -> Result<Vec<PortBinding>> {
        self.ports
            .iter()
            .flatten()
            .map(PortBinding::from_config)
            .collect()
    }

    /// Parsed restart policy; absent means `no`
    pub fn restart_policy(&self) -> Result<RestartPolicy> {
        match &self.restart {
            None => Ok(RestartPolicy::No),
            Some(s) => s.parse(),
        }
    }

    /// Command in exec form; the string form is split into words
    pub fn command_args(&self) -> Vec<String> {
        match &self.command {
            None => Vec::new(),
            Some(CommandConfig::Shell(s)) => split_words(s),
            Some(CommandConfig::Exec(arr)) => arr.clone(),
        }
    }

    /// Labels flattened into a map
    pub fn label_map(&self) -> BTreeMap<String, String> {
        match &self.labels {
            None => BTreeMap::new(),
            Some(LabelsConfig::Map(map)) => map.clone(),
            Some(LabelsConfig::Array(arr)) => arr
                .iter()
                .map(|item| match item.split_once('=') {
                    Some((k, v)) => (k.to_string(), v.to_string()),
                    None => (item.clone(), String::new()),
                })
                .collect(),
        }
    }
}

/// Command configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CommandConfig {
    /// Shell command string
    Shell(String),
    /// Exec form array
    Exec(Vec<String>),
}

/// Environment configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EnvironmentConfig {
    /// Array of KEY=value strings
    Array(Vec<String>),
    /// Map of key to value
    Map(BTreeMap<String, Option<EnvValue>>),
}

/// Environment value; YAML lets numbers and booleans appear unquoted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EnvValue {
    String(String),
    Integer(i64),
    Float(f64),
    Bool(bool),
}

impl EnvValue {
    /// Render the value the way it is handed to the process
    pub fn to_scalar_string(&self) -> String {
        match self {
            EnvValue::String(s) => s.clone(),
            EnvValue::Integer(i) => i.to_string(),
            EnvValue::Float(f) => f.to_string(),
            EnvValue::Bool(b) => b.to_string(),
        }
    }
}

impl From<&str> for EnvValue {
    fn from(s: &str) -> Self {
        EnvValue::String(s.to_string())
    }
}

/// Port configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PortConfig {
    /// Short syntax: "8080:80"
    Short(String),
    /// Long syntax
    Long(PortConfigLong),
}

/// Long port configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PortConfigLong {
    /// Target port in container
    pub target: u16,
    /// Published port on host
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published: Option<PublishedPort>,
    /// Host IP to bind to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_ip: Option<String>,
    /// Protocol (tcp/udp)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
}

/// Published port in long syntax, written either as a number or a string
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PublishedPort {
    Number(u16),
    Text(String),
}

/// A resolved host/container port pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortBinding {
    /// Host interface, `None` for all interfaces
    pub host_ip: Option<String>,
    /// Host port, `None` when only the container port is exposed
    pub host_port: Option<u16>,
    /// Container port
    pub container_port: u16,
    /// Protocol
    pub protocol: Protocol,
}

impl PortBinding {
    /// Resolve a compose port entry
    pub fn from_config(port: &PortConfig) -> Result<Self> {
        match port {
            PortConfig::Short(s) => Self::parse_short(s),
            PortConfig::Long(long) => {
                let host_port = match &long.published {
                    None => None,
                    Some(PublishedPort::Number(n)) => Some(*n),
                    Some(PublishedPort::Text(t)) => Some(parse_port(t)?),
                };
                let protocol = match &long.protocol {
                    None => Protocol::Tcp,
                    Some(p) => p.parse()?,
                };
                Ok(Self {
                    host_ip: long.host_ip.clone(),
                    host_port,
                    container_port: long.target,
                    protocol,
                })
            }
        }
    }

    /// Parse `[ip:]host:container[/proto]` or `container[/proto]`
    pub fn parse_short(spec: &str) -> Result<Self> {
        let (addr, protocol) = match spec.rsplit_once('/') {
            Some((addr, proto)) => (addr, proto.parse()?),
            None => (spec, Protocol::Tcp),
        };

        let parts: Vec<&str> = addr.rsplitn(3, ':').collect();
        let (host_ip, host_port, container_port) = match parts.as_slice() {
            [container] => (None, None, parse_port(container)?),
            [container, host] => (None, Some(parse_port(host)?), parse_port(container)?),
            [container, host, ip] => (
                Some(ip.to_string()),
                Some(parse_port(host)?),
                parse_port(container)?,
            ),
            _ => {
                return Err(StackError::ComposeParse(format!(
                    "Invalid port mapping: {}",
                    spec
                )))
            }
        };

        Ok(Self {
            host_ip,
            host_port,
            container_port,
            protocol,
        })
    }
}

impl std::fmt::Display for PortBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(ip) = &self.host_ip {
            write!(f, "{}:", ip)?;
        }
        match self.host_port {
            Some(host) => write!(f, "{}->{}/{}", host, self.container_port, self.protocol),
            None => write!(f, "{}/{}", self.container_port, self.protocol),
        }
    }
}

fn parse_port(s: &str) -> Result<u16> {
    s.trim()
        .parse()
        .map_err(|_| StackError::ComposeParse(format!("Invalid port: {}", s)))
}

/// Volume mount configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum VolumeMount {
    /// Short syntax: "host:container:mode"
    Short(String),
    /// Long syntax
    Long(VolumeMountLong),
}

/// Long volume mount configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VolumeMountLong {
    /// Mount type (volume, bind, tmpfs)
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub mount_type: Option<String>,
    /// Source path or volume name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// Target path in container
    pub target: String,
    /// Read only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_only: Option<bool>,
}

/// Networks configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NetworksConfig {
    /// Array of network names
    Array(Vec<String>),
    /// Map of network name to config
    Map(BTreeMap<String, Option<ServiceNetworkConfig>>),
}

/// Service network configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceNetworkConfig {
    /// Aliases
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aliases: Option<Vec<String>>,
    /// IPv4 address
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipv4_address: Option<String>,
}

/// Depends on configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DependsOnConfig {
    /// Array of service names
    Array(Vec<String>),
    /// Map of service to condition
    Map(BTreeMap<String, DependsOnCondition>),
}

/// Depends on condition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DependsOnCondition {
    /// Condition to wait for
    pub condition: String,
}

/// What a dependent waits for before it starts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DependencyCondition {
    /// The dependency's process has been launched
    Started,
    /// The dependency's readiness probe succeeded
    Healthy,
    /// The dependency ran to completion with exit code 0
    CompletedSuccessfully,
}

impl std::str::FromStr for DependencyCondition {
    type Err = StackError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "service_started" => Ok(DependencyCondition::Started),
            "service_healthy" => Ok(DependencyCondition::Healthy),
            "service_completed_successfully" => Ok(DependencyCondition::CompletedSuccessfully),
            other => Err(StackError::ComposeParse(format!(
                "Unknown depends_on condition: {}",
                other
            ))),
        }
    }
}

/// Healthcheck configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HealthcheckConfig {
    /// Test command
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test: Option<HealthcheckTest>,
    /// Interval
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<String>,
    /// Timeout
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,
    /// Retries
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retries: Option<u32>,
    /// Disable healthcheck
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disable: Option<bool>,
}

impl HealthcheckConfig {
    /// Test command in exec form, with the `CMD`/`CMD-SHELL` marker resolved
    pub fn test_args(&self) -> Option<Vec<String>> {
        match self.test.as_ref()? {
            HealthcheckTest::Command(s) => {
                Some(vec!["/bin/sh".to_string(), "-c".to_string(), s.clone()])
            }
            HealthcheckTest::Array(arr) => match arr.first().map(String::as_str) {
                Some("NONE") | None => None,
                Some("CMD") => Some(arr[1..].to_vec()),
                Some("CMD-SHELL") => {
                    Some(vec!["/bin/sh".to_string(), "-c".to_string(), arr[1..].join(" ")])
                }
                Some(_) => Some(arr.clone()),
            },
        }
    }

    pub fn is_disabled(&self) -> bool {
        self.disable.unwrap_or(false)
    }
}

/// Healthcheck test
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HealthcheckTest {
    /// Command string
    Command(String),
    /// Command array
    Array(Vec<String>),
}

/// Labels configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LabelsConfig {
    /// Array of "key=value" strings
    Array(Vec<String>),
    /// Map of key to value
    Map(BTreeMap<String, String>),
}

/// Network configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Driver
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub driver: Option<String>,
    /// Internal network
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub internal: Option<bool>,
    /// Explicit name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// Named volume configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VolumeConfig {
    /// Driver
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub driver: Option<String>,
    /// Name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// Split a command string into words, honouring single and double quotes
pub fn split_words(s: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut quote: Option<char> = None;

    for c in s.chars() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), c) => current.push(c),
            (None, '\'' | '"') => {
                quote = Some(c);
                in_word = true;
            }
            (None, c) if c.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            (None, c) => {
                current.push(c);
                in_word = true;
            }
        }
    }
    if in_word {
        words.push(current);
    }

    words
}

/// Parse a compose duration such as `30s`, `1m30s` or `500ms`
pub fn parse_duration(s: &str) -> Result<Duration> {
    let invalid = || StackError::ComposeParse(format!("Invalid duration: {}", s));
    let s = s.trim();
    if s.is_empty() {
        return Err(invalid());
    }

    let mut total = Duration::ZERO;
    let mut digits = String::new();
    let mut chars = s.chars().peekable();

    while let Some(c) = chars.next() {
        if c.is_ascii_digit() {
            digits.push(c);
            continue;
        }
        let value: u64 = digits.parse().map_err(|_| invalid())?;
        digits.clear();
        let secs = |factor: u64| value.checked_mul(factor).map(Duration::from_secs);
        let unit = match c {
            'h' => secs(3600),
            'm' if chars.peek() == Some(&'s') => {
                chars.next();
                Some(Duration::from_millis(value))
            }
            'm' => secs(60),
            's' => secs(1),
            _ => return Err(invalid()),
        };
        total = unit
            .and_then(|unit| total.checked_add(unit))
            .ok_or_else(invalid)?;
    }

    if !digits.is_empty() {
        // Bare numbers are seconds
        let value: u64 = digits.parse().map_err(|_| invalid())?;
        total = total
            .checked_add(Duration::from_secs(value))
            .ok_or_else(invalid)?;
    }

    Ok(total)
}
