//! stackrun settings
//!
//! Read from `--config <file>` or `<config dir>/stackrun/config.yaml`.
//! Every field is optional; missing ones take their defaults.

use crate::compose::topology::DEFAULT_DATA_ROOT;
use crate::compose::StartupOptions;
use crate::container::{ContainerRuntime, DockerRuntime, RecordingRuntime};
use crate::error::{Result, StackError};
use crate::launcher::{SiblingFailurePolicy, DEFAULT_SCRIPT_PATH, DEFAULT_WRAPPER};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Top-level settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Container and network state
    pub data_dir: PathBuf,
    /// Root of the host directories mounted into the stack
    pub data_root: PathBuf,
    /// Project name; derived from the compose file or directory when unset
    pub project_name: Option<String>,
    pub runtime: RuntimeSettings,
    pub startup: StartupSettings,
    pub launcher: LauncherSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            data_dir: dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("/var/lib"))
                .join("stackrun"),
            data_root: PathBuf::from(DEFAULT_DATA_ROOT),
            project_name: None,
            runtime: RuntimeSettings::default(),
            startup: StartupSettings::default(),
            launcher: LauncherSettings::default(),
        }
    }
}

/// Which backend runs containers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeBackend {
    /// The docker CLI
    #[default]
    Docker,
    /// Bookkeeping only; nothing is launched
    Recording,
}

/// Container backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeSettings {
    pub backend: RuntimeBackend,
    /// docker executable, looked up on PATH unless absolute
    pub docker_binary: String,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            backend: RuntimeBackend::Docker,
            docker_binary: "docker".to_string(),
        }
    }
}

impl RuntimeSettings {
    pub fn build(&self) -> Arc<dyn ContainerRuntime> {
        match self.backend {
            RuntimeBackend::Docker => Arc::new(DockerRuntime::new(self.docker_binary.clone())),
            RuntimeBackend::Recording => Arc::new(RecordingRuntime),
        }
    }
}

/// How `up` starts services
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StartupSettings {
    /// Unbounded when unset
    pub max_start_attempts: Option<u32>,
    pub backoff_initial_ms: u64,
    pub backoff_max_ms: u64,
    pub wait_ready: bool,
    pub probe_retries: usize,
    pub probe_interval_ms: u64,
}

impl Default for StartupSettings {
    fn default() -> Self {
        Self {
            max_start_attempts: None,
            backoff_initial_ms: 500,
            backoff_max_ms: 30_000,
            wait_ready: false,
            probe_retries: 30,
            probe_interval_ms: 1_000,
        }
    }
}

impl StartupSettings {
    pub fn to_options(&self) -> StartupOptions {
        StartupOptions {
            max_start_attempts: self.max_start_attempts,
            backoff_initial: Duration::from_millis(self.backoff_initial_ms),
            backoff_max: Duration::from_millis(self.backoff_max_ms),
            wait_ready: self.wait_ready,
            probe_retries: self.probe_retries,
            probe_interval: Duration::from_millis(self.probe_interval_ms),
        }
    }
}

/// In-container launcher
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LauncherSettings {
    pub script_path: PathBuf,
    /// Program each standard entry runs with its role as argument
    pub wrapper: String,
    pub sibling_failure: SiblingFailurePolicy,
    /// `exec` the foreground process from the script
    pub exec_foreground: bool,
}

impl Default for LauncherSettings {
    fn default() -> Self {
        Self {
            script_path: PathBuf::from(DEFAULT_SCRIPT_PATH),
            wrapper: DEFAULT_WRAPPER.to_string(),
            sibling_failure: SiblingFailurePolicy::default(),
            exec_foreground: false,
        }
    }
}

impl Settings {
    /// Default location of the settings file
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("stackrun").join("config.yaml"))
    }

    /// Load settings.
    ///
    /// An explicit `path` must exist. Without one, the default location is
    /// used if present, and the built-in defaults otherwise.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let settings = match path {
            Some(path) => Self::from_file(path)?,
            None => match Self::default_path().filter(|p| p.exists()) {
                Some(path) => Self::from_file(&path)?,
                None => Self::default(),
            },
        };

        settings.validate()?;
        Ok(settings)
    }

    fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            StackError::InvalidConfig(format!("Cannot read {}: {}", path.display(), e))
        })?;
        let settings: Settings = serde_yaml::from_str(&content)?;
        tracing::debug!(path = %path.display(), "loaded settings");
        Ok(settings)
    }

    /// Reject values that would make startup misbehave
    pub fn validate(&self) -> Result<()> {
        let startup = &self.startup;

        if startup.max_start_attempts == Some(0) {
            return Err(StackError::InvalidConfig(
                "startup.max_start_attempts must be at least 1".to_string(),
            ));
        }
        if startup.backoff_initial_ms == 0 {
            return Err(StackError::InvalidConfig(
                "startup.backoff_initial_ms must be positive".to_string(),
            ));
        }
        if startup.backoff_max_ms < startup.backoff_initial_ms {
            return Err(StackError::InvalidConfig(
                "startup.backoff_max_ms is below startup.backoff_initial_ms".to_string(),
            ));
        }
        if startup.probe_retries == 0 {
            return Err(StackError::InvalidConfig(
                "startup.probe_retries must be at least 1".to_string(),
            ));
        }
        if self.runtime.docker_binary.trim().is_empty() {
            return Err(StackError::InvalidConfig(
                "runtime.docker_binary must not be empty".to_string(),
            ));
        }
        if self.launcher.wrapper.trim().is_empty() {
            return Err(StackError::InvalidConfig(
                "launcher.wrapper must not be empty".to_string(),
            ));
        }

        Ok(())
    }

    /// Where container state lives
    pub fn containers_dir(&self) -> PathBuf {
        self.data_dir.join("containers")
    }

    /// Where network state lives
    pub fn networks_dir(&self) -> PathBuf {
        self.data_dir.join("networks")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.data_root, PathBuf::from("/opt/stack"));
        assert_eq!(settings.launcher.script_path, PathBuf::from("/opt/stack/all.sh"));
        assert_eq!(settings.launcher.sibling_failure, SiblingFailurePolicy::Ignore);
        assert_eq!(settings.runtime.backend, RuntimeBackend::Docker);

        let options = settings.startup.to_options();
        assert_eq!(options.backoff_initial, Duration::from_millis(500));
        assert_eq!(options.backoff_max, Duration::from_secs(30));
        assert_eq!(options.max_start_attempts, None);
        settings.validate().unwrap();
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("config.yaml");
        std::fs::write(
            &path,
            "data_root: /srv/stack\nruntime:\n  backend: recording\nstartup:\n  max_start_attempts: 5\nlauncher:\n  sibling_failure: shutdown\n",
        )
        .unwrap();

        let settings = Settings::load(Some(&path)).unwrap();
        assert_eq!(settings.data_root, PathBuf::from("/srv/stack"));
        assert_eq!(settings.startup.max_start_attempts, Some(5));
        assert_eq!(settings.startup.backoff_initial_ms, 500);
        assert_eq!(settings.launcher.sibling_failure, SiblingFailurePolicy::Shutdown);
        assert_eq!(settings.launcher.wrapper, DEFAULT_WRAPPER);
        assert_eq!(settings.runtime.backend, RuntimeBackend::Recording);
        assert_eq!(settings.runtime.docker_binary, "docker");
    }

    #[test]
    fn test_explicit_missing_file_is_error() {
        let temp = tempdir().unwrap();
        assert!(Settings::load(Some(&temp.path().join("absent.yaml"))).is_err());
    }

    #[test]
    fn test_invalid_values_rejected() {
        let mut settings = Settings::default();
        settings.startup.max_start_attempts = Some(0);
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.startup.backoff_max_ms = 100;
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.launcher.wrapper = " ".to_string();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_state_dirs_under_data_dir() {
        let settings = Settings {
            data_dir: PathBuf::from("/var/lib/stackrun"),
            ..Settings::default()
        };
        assert_eq!(settings.containers_dir(), PathBuf::from("/var/lib/stackrun/containers"));
        assert_eq!(settings.networks_dir(), PathBuf::from("/var/lib/stackrun/networks"));
    }
}
