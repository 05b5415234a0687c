//! Host mount parsing and preparation

use crate::compose::config::{ComposeConfig, VolumeMount as ComposeVolumeMount};
use crate::error::{Result, StackError};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Where the data of a mount lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MountSource {
    /// Host directory
    Bind(PathBuf),
    /// Named volume
    Named(String),
    /// Anonymous volume
    Anonymous,
}

/// A resolved service mount
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindMount {
    pub source: MountSource,
    pub target: String,
    pub read_only: bool,
}

impl BindMount {
    /// Parse the short syntax `source:target[:ro|rw]` or a bare `target`
    pub fn parse(spec: &str) -> Result<Self> {
        let parts: Vec<&str> = spec.split(':').collect();
        let (source, target, mode) = match parts.as_slice() {
            [target] => (None, *target, None),
            [source, target] => (Some(*source), *target, None),
            [source, target, mode] => (Some(*source), *target, Some(*mode)),
            _ => {
                return Err(StackError::Volume(format!("Invalid volume spec: {}", spec)));
            }
        };

        if target.is_empty() || !target.starts_with('/') {
            return Err(StackError::Volume(format!(
                "Mount target must be an absolute path: {}",
                spec
            )));
        }

        let read_only = match mode {
            None | Some("rw") => false,
            Some("ro") => true,
            Some(other) => {
                return Err(StackError::Volume(format!(
                    "Unknown mount mode '{}' in {}",
                    other, spec
                )))
            }
        };

        Ok(Self {
            source: source.map(classify_source).unwrap_or(MountSource::Anonymous),
            target: target.to_string(),
            read_only,
        })
    }

    /// Resolve a compose volume entry
    pub fn from_config(mount: &ComposeVolumeMount) -> Result<Self> {
        match mount {
            ComposeVolumeMount::Short(s) => Self::parse(s),
            ComposeVolumeMount::Long(long) => {
                let source = match (long.mount_type.as_deref(), long.source.as_deref()) {
                    (_, None) => MountSource::Anonymous,
                    (Some("bind"), Some(src)) => MountSource::Bind(PathBuf::from(src)),
                    (Some("volume"), Some(src)) => MountSource::Named(src.to_string()),
                    (_, Some(src)) => classify_source(src),
                };
                Ok(Self {
                    source,
                    target: long.target.clone(),
                    read_only: long.read_only.unwrap_or(false),
                })
            }
        }
    }

    /// Host path of a bind mount. `~` expands to the home directory and
    /// other relative paths resolve against `working_dir`.
    pub fn host_path(&self, working_dir: &Path) -> Option<PathBuf> {
        let MountSource::Bind(path) = &self.source else {
            return None;
        };
        let path = expand_home(path);
        if path.is_relative() {
            Some(normalize(&working_dir.join(path)))
        } else {
            Some(normalize(&path))
        }
    }
}

/// Replace a leading `~` component with the user's home directory
fn expand_home(path: &Path) -> PathBuf {
    match (path.strip_prefix("~"), dirs::home_dir()) {
        (Ok(rest), Some(home)) => home.join(rest),
        _ => path.to_path_buf(),
    }
}

fn classify_source(source: &str) -> MountSource {
    if source.starts_with('/') || source.starts_with('.') || source.starts_with('~') {
        MountSource::Bind(PathBuf::from(source))
    } else {
        MountSource::Named(source.to_string())
    }
}

/// Ensure no host path is mounted by more than one service
pub fn validate_exclusive_mounts(config: &ComposeConfig) -> Result<()> {
    let mut owners: HashMap<PathBuf, &str> = HashMap::new();

    for (name, service) in &config.services {
        for mount in service.volumes.iter().flatten() {
            let mount = BindMount::from_config(mount)?;
            let MountSource::Bind(path) = &mount.source else {
                continue;
            };

            let key = normalize(&expand_home(path));
            if let Some(owner) = owners.get(&key) {
                if *owner != name.as_str() {
                    return Err(StackError::Volume(format!(
                        "Host path {} is mounted by both '{}' and '{}'",
                        path.display(),
                        owner,
                        name
                    )));
                }
            }
            owners.insert(key, name.as_str());
        }
    }

    Ok(())
}

/// Create missing host directories for bind mounts.
///
/// Returns every directory that had to be created, missing parents
/// included, each listed before its children.
pub fn prepare_host_paths(mounts: &[BindMount], working_dir: &Path) -> Result<Vec<PathBuf>> {
    let mut created = Vec::new();

    for mount in mounts {
        let Some(path) = mount.host_path(working_dir) else {
            continue;
        };
        let missing: Vec<PathBuf> = path
            .ancestors()
            .take_while(|dir| !dir.as_os_str().is_empty() && !dir.exists())
            .map(Path::to_path_buf)
            .collect();
        if missing.is_empty() {
            continue;
        }

        std::fs::create_dir_all(&path).map_err(|e| {
            StackError::Volume(format!("Failed to create {}: {}", path.display(), e))
        })?;
        tracing::debug!(path = %path.display(), created = missing.len(), "created host mount directory");
        created.extend(missing.into_iter().rev());
    }

    Ok(created)
}

fn normalize(path: &Path) -> PathBuf {
    path.components().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compose::ComposeParser;
    use tempfile::tempdir;

    #[test]
    fn test_parse_mount_forms() {
        let m = BindMount::parse("/opt/stack/data/redis:/data").unwrap();
        assert_eq!(m.source, MountSource::Bind(PathBuf::from("/opt/stack/data/redis")));
        assert_eq!(m.target, "/data");
        assert!(!m.read_only);

        let m = BindMount::parse("./config:/etc/app:ro").unwrap();
        assert!(m.read_only);

        let m = BindMount::parse("esdata:/usr/share/elasticsearch/data").unwrap();
        assert_eq!(m.source, MountSource::Named("esdata".to_string()));

        let m = BindMount::parse("/scratch").unwrap();
        assert_eq!(m.source, MountSource::Anonymous);

        assert!(BindMount::parse("/a:/b:maybe").is_err());
        assert!(BindMount::parse("/a:relative").is_err());
    }

    #[test]
    fn test_shared_host_path_rejected() {
        let yaml = r#"
services:
  a:
    image: busybox
    volumes:
      - /opt/shared:/data
  b:
    image: busybox
    volumes:
      - /opt/shared/:/other
"#;
        let config = ComposeParser::parse_str(yaml).unwrap();
        assert!(validate_exclusive_mounts(&config).is_err());
    }

    #[test]
    fn test_prepare_host_paths() {
        let temp = tempdir().unwrap();
        let mounts = vec![
            BindMount::parse("./logs:/var/log/app").unwrap(),
            BindMount::parse("named:/data").unwrap(),
        ];

        let created = prepare_host_paths(&mounts, temp.path()).unwrap();
        assert_eq!(created, vec![temp.path().join("logs")]);
        assert!(temp.path().join("logs").is_dir());

        // Second call has nothing left to do
        assert!(prepare_host_paths(&mounts, temp.path()).unwrap().is_empty());
    }

    #[test]
    fn test_prepare_records_missing_parents() {
        let temp = tempdir().unwrap();
        let mounts = vec![
            BindMount::parse("./data/mongo/db:/data/db").unwrap(),
            BindMount::parse("./data/redis:/data").unwrap(),
        ];

        let created = prepare_host_paths(&mounts, temp.path()).unwrap();
        assert_eq!(
            created,
            vec![
                temp.path().join("data"),
                temp.path().join("data/mongo"),
                temp.path().join("data/mongo/db"),
                temp.path().join("data/redis"),
            ]
        );
    }

    #[test]
    fn test_home_relative_bind_expands() {
        let mount = BindMount::parse("~/stack/logs:/logs").unwrap();
        let working_dir = Path::new("/srv/project");
        if let Some(home) = dirs::home_dir() {
            assert_eq!(mount.host_path(working_dir), Some(home.join("stack/logs")));
        }

        let relative = BindMount::parse("./data/../logs:/logs").unwrap();
        assert_eq!(
            relative.host_path(working_dir),
            Some(PathBuf::from("/srv/project/data/../logs"))
        );
    }
}
