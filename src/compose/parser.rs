//! Compose file parser and validator

use super::config::{ComposeConfig, CommandConfig, EnvValue, EnvironmentConfig, PortConfig, VolumeMount};
use super::graph::DependencyGraph;
use crate::container::RestartPolicy;
use crate::error::{Result, StackError};
use crate::storage::validate_exclusive_mounts;
use regex::{Captures, Regex};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

/// Default compose file names
pub const DEFAULT_COMPOSE_FILES: &[&str] = &[
    "compose.yaml",
    "compose.yml",
    "docker-compose.yaml",
    "docker-compose.yml",
];

/// Compose file parser
pub struct ComposeParser;

impl ComposeParser {
    /// Find compose file in directory
    pub fn find_compose_file(dir: &Path) -> Option<PathBuf> {
        DEFAULT_COMPOSE_FILES
            .iter()
            .map(|name| dir.join(name))
            .find(|path| path.exists())
    }

    /// Parse compose file from path
    pub fn parse_file(path: &Path) -> Result<ComposeConfig> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            StackError::ComposeParse(format!("Failed to read {}: {}", path.display(), e))
        })?;

        Self::parse_str(&content)
    }

    /// Parse compose file from string
    pub fn parse_str(content: &str) -> Result<ComposeConfig> {
        serde_yaml::from_str(content)
            .map_err(|e| StackError::ComposeParse(format!("Failed to parse YAML: {}", e)))
    }

    /// Parse multiple compose files, later files overriding earlier ones
    pub fn parse_files(paths: &[&Path]) -> Result<ComposeConfig> {
        let mut config = ComposeConfig::default();

        for path in paths {
            let file_config = Self::parse_file(path)?;
            config = Self::merge_configs(config, file_config);
        }

        Ok(config)
    }

    /// Merge two compose configurations
    pub fn merge_configs(base: ComposeConfig, overlay: ComposeConfig) -> ComposeConfig {
        let mut result = base;

        if overlay.version.is_some() {
            result.version = overlay.version;
        }
        if overlay.name.is_some() {
            result.name = overlay.name;
        }

        for (name, service) in overlay.services {
            let Some(existing) = result.services.get_mut(&name) else {
                result.services.insert(name, service);
                continue;
            };
            let overlay_env = service.environment_map();

            macro_rules! overlay_field {
                ($($field:ident),*) => {
                    $(if service.$field.is_some() {
                        existing.$field = service.$field;
                    })*
                };
            }
            overlay_field!(
                image,
                command,
                container_name,
                hostname,
                ports,
                volumes,
                networks,
                depends_on,
                healthcheck,
                labels,
                restart,
                working_dir,
                user
            );

            // Environment entries merge key by key
            let mut env = existing.environment_map();
            env.extend(overlay_env);
            if !env.is_empty() {
                existing.environment = Some(EnvironmentConfig::Map(
                    env.into_iter()
                        .map(|(k, v)| (k, Some(EnvValue::String(v))))
                        .collect(),
                ));
            }
        }

        result.networks.extend(overlay.networks);
        result.volumes.extend(overlay.volumes);

        result
    }

    /// Validate compose configuration.
    ///
    /// Structural problems (missing image, unknown or cyclic dependencies,
    /// host port conflicts, shared host mounts, bad restart policies) are
    /// errors; everything else is returned as a warning.
    pub fn validate(config: &ComposeConfig) -> Result<Vec<String>> {
        let mut warnings = Vec::new();

        for (name, service) in &config.services {
            if service.image.as_deref().map_or(true, str::is_empty) {
                return Err(StackError::ComposeParse(format!(
                    "Service '{}' must have an 'image' specified",
                    name
                )));
            }

            service.dependencies()?;

            match service.restart_policy()? {
                RestartPolicy::UnlessStopped => {}
                other => warnings.push(format!(
                    "Service '{}' uses restart policy '{}' instead of 'unless-stopped'",
                    name, other
                )),
            }

            for net in service.network_names() {
                if net != "default" && !config.networks.contains_key(&net) {
                    warnings.push(format!(
                        "Service '{}' references undefined network '{}' (will be created)",
                        name, net
                    ));
                }
            }

            if let Some(hc) = &service.healthcheck {
                if !hc.is_disabled() && hc.test_args().is_none() {
                    warnings.push(format!(
                        "Service '{}' has a healthcheck without a test command",
                        name
                    ));
                }
            }
        }

        let graph = DependencyGraph::from_config(config)?;
        graph.start_waves()?;

        Self::check_port_conflicts(config)?;
        validate_exclusive_mounts(config)?;

        Ok(warnings)
    }

    /// Reject topologies in which two services publish the same host port
    pub fn check_port_conflicts(config: &ComposeConfig) -> Result<()> {
        // (port, protocol) -> [(service, host_ip)]
        let mut bound: HashMap<(u16, String), Vec<(&str, Option<String>)>> = HashMap::new();

        for (name, service) in &config.services {
            for binding in service.port_bindings()? {
                let Some(port) = binding.host_port else {
                    continue;
                };
                let ip = binding
                    .host_ip
                    .clone()
                    .filter(|ip| ip != "0.0.0.0" && !ip.is_empty());
                let key = (port, binding.protocol.to_string());
                let holders = bound.entry(key).or_default();

                if let Some((first, _)) = holders.iter().find(|(_, owner_ip)| {
                    // Wildcard binds collide with every address
                    owner_ip.is_none() || ip.is_none() || *owner_ip == ip
                }) {
                    return Err(StackError::PortConflict {
                        port,
                        protocol: binding.protocol.to_string(),
                        first: first.to_string(),
                        second: name.clone(),
                    });
                }
                holders.push((name.as_str(), ip));
            }
        }

        Ok(())
    }

    /// Interpolate `${VAR}`, `${VAR:-default}`, `${VAR-default}` and `$VAR`
    /// in every string field a service carries. `$$` escapes a literal `$`.
    pub fn interpolate(config: &mut ComposeConfig, env: &HashMap<String, String>) {
        for service in config.services.values_mut() {
            if let Some(image) = service.image.as_mut() {
                *image = interpolate_string(image, env);
            }

            match service.command.as_mut() {
                Some(CommandConfig::Shell(s)) => *s = interpolate_string(s, env),
                Some(CommandConfig::Exec(arr)) => {
                    for item in arr.iter_mut() {
                        *item = interpolate_string(item, env);
                    }
                }
                None => {}
            }

            match service.environment.as_mut() {
                Some(EnvironmentConfig::Map(map)) => {
                    for value in map.values_mut() {
                        if let Some(EnvValue::String(v)) = value {
                            *v = interpolate_string(v, env);
                        }
                    }
                }
                Some(EnvironmentConfig::Array(arr)) => {
                    for item in arr.iter_mut() {
                        *item = interpolate_string(item, env);
                    }
                }
                None => {}
            }

            for port in service.ports.iter_mut().flatten() {
                if let PortConfig::Short(s) = port {
                    *s = interpolate_string(s, env);
                }
            }

            for volume in service.volumes.iter_mut().flatten() {
                if let VolumeMount::Short(s) = volume {
                    *s = interpolate_string(s, env);
                }
            }
        }
    }
}

fn variable_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\$(?:(\$)|\{([A-Za-z_][A-Za-z0-9_]*)(?:(:?-)([^}]*))?\}|([A-Za-z_][A-Za-z0-9_]*))")
            .expect("interpolation pattern is valid")
    })
}

/// Interpolate environment variables in a string
pub fn interpolate_string(s: &str, env: &HashMap<String, String>) -> String {
    variable_pattern()
        .replace_all(s, |caps: &Captures| {
            if caps.get(1).is_some() {
                return "$".to_string();
            }

            if let Some(var) = caps.get(5) {
                return env.get(var.as_str()).cloned().unwrap_or_default();
            }

            let var = &caps[2];
            let value = env.get(var);
            match (caps.get(3).map(|m| m.as_str()), caps.get(4)) {
                // ${VAR:-default}: default when unset or empty
                (Some(":-"), Some(default)) => match value {
                    Some(v) if !v.is_empty() => v.clone(),
                    _ => default.as_str().to_string(),
                },
                // ${VAR-default}: default only when unset
                (Some("-"), Some(default)) => value
                    .cloned()
                    .unwrap_or_else(|| default.as_str().to_string()),
                _ => value.cloned().unwrap_or_default(),
            }
        })
        .into_owned()
}
