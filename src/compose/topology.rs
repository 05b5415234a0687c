//! Built-in four-service stack
//!
//! The orchestrating `server` service depends on three leaves (search
//! index, document store, cache) and reaches each of them through a fixed
//! pair of environment variables. The search engine tuning block and the
//! document store's sort buffer flag are carried through verbatim.

use super::config::ComposeConfig;
use super::parser::ComposeParser;
use crate::error::{Result, StackError};
use std::collections::HashMap;
use std::path::Path;

/// Compose template for the stack; `${DATA_ROOT}` and `${SERVER_IMAGE}` are
/// interpolated at load time
pub const TEMPLATE: &str = include_str!("../../assets/compose.yaml");

/// Default root for host-mounted state
pub const DEFAULT_DATA_ROOT: &str = "/opt/stack";

/// Name of the service that depends on all leaves
pub const ORCHESTRATING_SERVICE: &str = "server";

/// Host ports the orchestrating service publishes
pub const SERVER_PORTS: [u16; 3] = [8008, 8080, 8081];

/// Connection coordinates of one leaf service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeafEndpoint {
    /// Service name, which doubles as its host name on the network
    pub service: &'static str,
    /// Port the leaf listens on inside the network
    pub port: u16,
    /// Variable carrying the host name
    pub host_var: &'static str,
    /// Variable carrying the port
    pub port_var: &'static str,
}

/// The leaves the orchestrating service connects to
pub const LEAF_ENDPOINTS: [LeafEndpoint; 3] = [
    LeafEndpoint {
        service: "elasticsearch",
        port: 9200,
        host_var: "ELASTIC_SERVICE_HOST",
        port_var: "ELASTIC_SERVICE_PORT",
    },
    LeafEndpoint {
        service: "mongo",
        port: 27017,
        host_var: "MONGODB_SERVICE_HOST",
        port_var: "MONGODB_SERVICE_PORT",
    },
    LeafEndpoint {
        service: "redis",
        port: 6379,
        host_var: "REDIS_SERVICE_HOST",
        port_var: "REDIS_SERVICE_PORT",
    },
];

/// Environment the orchestrating service expects, in key order
pub fn connection_env() -> Vec<(String, String)> {
    let mut env: Vec<(String, String)> = LEAF_ENDPOINTS
        .iter()
        .flat_map(|leaf| {
            [
                (leaf.host_var.to_string(), leaf.service.to_string()),
                (leaf.port_var.to_string(), leaf.port.to_string()),
            ]
        })
        .collect();
    env.sort();
    env
}

/// Load the built-in stack with host mounts rooted at `data_root`
pub fn default_topology(data_root: &Path) -> Result<ComposeConfig> {
    let mut vars = HashMap::new();
    vars.insert(
        "DATA_ROOT".to_string(),
        data_root.to_string_lossy().trim_end_matches('/').to_string(),
    );
    if let Ok(image) = std::env::var("SERVER_IMAGE") {
        vars.insert("SERVER_IMAGE".to_string(), image);
    }

    let mut config = ComposeParser::parse_str(TEMPLATE)?;
    ComposeParser::interpolate(&mut config, &vars);
    Ok(config)
}

/// Check that the orchestrating service's connection variables point at the
/// leaves as they are declared.
///
/// Each host variable must equal the leaf's service name and each port
/// variable must equal a container port the leaf exposes. Reachability is
/// not checked.
pub fn verify_connection_env(config: &ComposeConfig) -> Result<()> {
    let server = config.service(ORCHESTRATING_SERVICE)?;
    let env = server.environment_map();

    for leaf in &LEAF_ENDPOINTS {
        let service = config.service(leaf.service)?;

        let host = env.get(leaf.host_var).ok_or_else(|| {
            StackError::InvalidConfig(format!(
                "'{}' is missing {}",
                ORCHESTRATING_SERVICE, leaf.host_var
            ))
        })?;
        if host != leaf.service {
            return Err(StackError::InvalidConfig(format!(
                "{}={} does not name service '{}'",
                leaf.host_var, host, leaf.service
            )));
        }

        let port = env.get(leaf.port_var).ok_or_else(|| {
            StackError::InvalidConfig(format!(
                "'{}' is missing {}",
                ORCHESTRATING_SERVICE, leaf.port_var
            ))
        })?;
        let port: u16 = port.parse().map_err(|_| {
            StackError::InvalidConfig(format!("{}={} is not a port", leaf.port_var, port))
        })?;

        let exposed = service
            .port_bindings()?
            .iter()
            .any(|binding| binding.container_port == port);
        if port != leaf.port || !exposed {
            return Err(StackError::InvalidConfig(format!(
                "{}={} does not match the port '{}' listens on ({})",
                leaf.port_var, port, leaf.service, leaf.port
            )));
        }

        if !server.dependency_names().iter().any(|d| d == leaf.service) {
            return Err(StackError::InvalidConfig(format!(
                "'{}' does not depend on '{}'",
                ORCHESTRATING_SERVICE, leaf.service
            )));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compose::config::{EnvValue, EnvironmentConfig};
    use crate::compose::DependencyGraph;
    use crate::container::RestartPolicy;

    fn topology() -> ComposeConfig {
        default_topology(Path::new("/srv/stack/")).unwrap()
    }

    #[test]
    fn test_default_topology_is_valid() {
        let config = topology();
        let warnings = ComposeParser::validate(&config).unwrap();
        assert!(warnings.is_empty(), "unexpected warnings: {warnings:?}");
        assert_eq!(config.services.len(), 4);
        assert_eq!(config.networks.len(), 1);
    }

    #[test]
    fn test_every_service_restarts_unless_stopped() {
        for (name, service) in &topology().services {
            assert_eq!(
                service.restart_policy().unwrap(),
                RestartPolicy::UnlessStopped,
                "service {name}"
            );
        }
    }

    #[test]
    fn test_leaves_start_before_server() {
        let graph = DependencyGraph::from_config(&topology()).unwrap();
        let waves = graph.start_waves().unwrap();
        assert_eq!(waves.len(), 2);
        assert_eq!(waves[0].len(), 3);
        assert_eq!(waves[1], vec![ORCHESTRATING_SERVICE.to_string()]);
    }

    #[test]
    fn test_connection_env_matches_leaves() {
        let config = topology();
        verify_connection_env(&config).unwrap();

        let env = config.services[ORCHESTRATING_SERVICE].environment_map();
        for (key, value) in connection_env() {
            assert_eq!(env.get(&key), Some(&value));
        }
        assert_eq!(env.get("ELASTIC_SERVICE_PORT").map(String::as_str), Some("9200"));
    }

    #[test]
    fn test_mismatched_connection_env_rejected() {
        let mut config = topology();
        let server = config.services.get_mut(ORCHESTRATING_SERVICE).unwrap();
        let mut env = server.environment_map();
        env.insert("REDIS_SERVICE_PORT".to_string(), "6380".to_string());
        server.environment = Some(EnvironmentConfig::Map(
            env.into_iter().map(|(k, v)| (k, Some(EnvValue::String(v)))).collect(),
        ));

        assert!(verify_connection_env(&config).is_err());
    }

    #[test]
    fn test_data_root_is_interpolated() {
        let config = topology();
        let redis = config.services["redis"].clone();
        let mounts = redis.volumes.unwrap();
        match &mounts[0] {
            crate::compose::config::VolumeMount::Short(s) => {
                assert_eq!(s, "/srv/stack/data/redis:/data")
            }
            other => panic!("unexpected mount: {other:?}"),
        }
    }

    #[test]
    fn test_passthrough_tuning_preserved() {
        let config = topology();
        let es = config.services["elasticsearch"].environment_map();
        assert_eq!(es.get("thread_pool.search.queue_size").map(String::as_str), Some("10000"));
        assert_eq!(es.get("ES_JAVA_OPTS").map(String::as_str), Some("-Xms2g -Xmx2g"));

        let mongo = &config.services["mongo"];
        assert!(mongo
            .command_args()
            .contains(&"internalQueryExecMaxBlockingSortBytes=196100200".to_string()));
    }

    #[test]
    fn test_server_publishes_three_ports() {
        let config = topology();
        let mut published: Vec<u16> = config.services[ORCHESTRATING_SERVICE]
            .port_bindings()
            .unwrap()
            .iter()
            .filter_map(|b| b.host_port)
            .collect();
        published.sort();
        assert_eq!(published, SERVER_PORTS.to_vec());
    }
}
