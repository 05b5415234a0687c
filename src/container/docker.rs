//! Docker CLI backend.
//!
//! Every container and network operation shells out to `docker`. Restart
//! policies stay with the manager, so containers are run without
//! `--restart` and exits are picked up through `docker wait`.

use super::config::ContainerConfig;
use super::runtime::ContainerRuntime;
use crate::error::{Result, StackError};
use crate::launcher::script::exit_code;
use crate::network::{NetworkConfig, NetworkDriver};
use async_trait::async_trait;
use std::process::Output;
use std::time::Duration;

/// Time allowed for short docker commands
const COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// Grace period `docker stop` gives a process before killing it
const STOP_GRACE_SECS: u32 = 10;

/// Runtime that drives the docker CLI
#[derive(Debug, Clone)]
pub struct DockerRuntime {
    binary: String,
}

impl Default for DockerRuntime {
    fn default() -> Self {
        Self::new("docker")
    }
}

impl DockerRuntime {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    // ========================================================================
    // Internal helpers
    // ========================================================================

    /// Run a docker command, optionally bounded by a timeout
    async fn run(&self, args: &[String], timeout: Option<Duration>) -> Result<Output> {
        let command = format!("{} {}", self.binary, args.join(" "));
        tracing::debug!(command = %command, "running docker");

        let output = tokio::process::Command::new(&self.binary).args(args).output();
        let result = match timeout {
            Some(limit) => tokio::time::timeout(limit, output).await.map_err(|_| {
                StackError::Container(format!("'{}' timed out after {:?}", command, limit))
            })?,
            None => output.await,
        };

        result.map_err(|e| StackError::Container(format!("Failed to run '{}': {}", command, e)))
    }

    /// Run a docker command and fail unless it exits 0
    async fn run_success(&self, args: &[String], timeout: Option<Duration>) -> Result<Output> {
        let output = self.run(args, timeout).await?;
        if output.status.success() {
            return Ok(output);
        }
        Err(failed(&args[0], &output))
    }

    async fn inspect(&self, name: &str, format: &str) -> Result<Option<String>> {
        let output = self
            .run(
                &strings(&["inspect", "--type", "container", "--format", format, name]),
                Some(COMMAND_TIMEOUT),
            )
            .await?;
        if !output.status.success() {
            return Ok(None);
        }
        Ok(Some(stdout(&output)))
    }

    // ========================================================================
    // Argument building
    // ========================================================================

    /// Arguments for `docker run` that create and start `config` detached
    pub fn run_args(config: &ContainerConfig) -> Vec<String> {
        let mut args = strings(&["run", "-d", "--name", &config.name]);

        if !config.hostname.is_empty() {
            args.extend(strings(&["--hostname", &config.hostname]));
        }
        if let Some(network) = config.networks.first() {
            args.extend(strings(&["--network", network]));
            for alias in &config.aliases {
                args.extend(strings(&["--network-alias", alias]));
            }
        }
        for port in &config.ports {
            let published = match &port.host_ip {
                Some(ip) => format!(
                    "{}:{}:{}/{}",
                    ip, port.host_port, port.container_port, port.protocol
                ),
                None => format!("{}:{}/{}", port.host_port, port.container_port, port.protocol),
            };
            args.extend(["-p".to_string(), published]);
        }
        for volume in &config.volumes {
            let mut spec = format!("{}:{}", volume.host_path, volume.container_path);
            if volume.read_only {
                spec.push_str(":ro");
            }
            args.extend(["-v".to_string(), spec]);
        }
        for (key, value) in &config.env {
            args.extend(["-e".to_string(), format!("{}={}", key, value)]);
        }
        for (key, value) in &config.labels {
            args.extend(["--label".to_string(), format!("{}={}", key, value)]);
        }
        if !config.working_dir.is_empty() && config.working_dir != "/" {
            args.extend(strings(&["-w", &config.working_dir]));
        }
        if !config.user.is_empty() {
            args.extend(strings(&["-u", &config.user]));
        }

        args.push(config.image.clone());
        args.extend(config.cmd.iter().cloned());
        args
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn spawn(&self, config: &ContainerConfig) -> Result<Option<u32>> {
        // An existing container keeps its configuration and is just started
        match self.inspect(&config.name, "{{.State.Running}}").await? {
            Some(running) if running == "true" => {}
            Some(_) => {
                self.run_success(&strings(&["start", &config.name]), None)
                    .await?;
            }
            None => {
                self.run_success(&Self::run_args(config), None).await?;
                for network in config.networks.iter().skip(1) {
                    let mut args = strings(&["network", "connect"]);
                    for alias in &config.aliases {
                        args.extend(strings(&["--alias", alias]));
                    }
                    args.extend(strings(&[network, &config.name]));
                    self.run_success(&args, Some(COMMAND_TIMEOUT)).await?;
                }
            }
        }

        let pid = self
            .inspect(&config.name, "{{.State.Pid}}")
            .await?
            .and_then(|pid| pid.parse::<u32>().ok())
            .filter(|pid| *pid != 0);
        tracing::info!(container = %config.name, image = %config.image, pid = ?pid, "container started");
        Ok(pid)
    }

    /// SIGTERM goes through `docker stop` so the process is killed after a
    /// grace period; other signals are delivered as is
    async fn signal(&self, config: &ContainerConfig, signal: i32) -> Result<()> {
        let args = if signal == libc::SIGTERM {
            strings(&["stop", "-t", &STOP_GRACE_SECS.to_string(), &config.name])
        } else {
            strings(&["kill", "-s", &signal.to_string(), &config.name])
        };

        let output = self.run(&args, Some(COMMAND_TIMEOUT)).await?;
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        // Already gone is as good as stopped
        if stderr.contains("No such container") || stderr.contains("is not running") {
            return Ok(());
        }
        Err(failed(&args[0], &output))
    }

    async fn wait(&self, config: &ContainerConfig) -> Result<i32> {
        let output = self
            .run_success(&strings(&["wait", &config.name]), None)
            .await?;
        let code = stdout(&output);
        code.parse::<i32>().map_err(|_| {
            StackError::Container(format!(
                "docker wait returned '{}' for {}",
                code, config.name
            ))
        })
    }

    async fn exec(&self, container: &str, command: &[String]) -> Result<i32> {
        let mut args = strings(&["exec", container]);
        args.extend(command.iter().cloned());
        let output = self.run(&args, None).await?;
        Ok(exit_code(output.status))
    }

    async fn remove(&self, config: &ContainerConfig) -> Result<()> {
        let args = strings(&["rm", "-f", &config.name]);
        let output = self.run(&args, Some(COMMAND_TIMEOUT)).await?;
        if output.status.success()
            || String::from_utf8_lossy(&output.stderr).contains("No such container")
        {
            return Ok(());
        }
        Err(failed("rm", &output))
    }

    async fn create_network(&self, network: &NetworkConfig) -> Result<()> {
        if network.driver != NetworkDriver::Bridge {
            tracing::debug!(network = %network.name, driver = %network.driver, "using built-in docker network");
            return Ok(());
        }

        let exists = self
            .run(&strings(&["network", "inspect", &network.name]), Some(COMMAND_TIMEOUT))
            .await?;
        if exists.status.success() {
            return Ok(());
        }

        // Docker picks the subnet so it never overlaps networks it already has
        let mut args = strings(&["network", "create", "--driver", "bridge"]);
        if network.internal {
            args.push("--internal".to_string());
        }
        for (key, value) in &network.labels {
            args.extend(["--label".to_string(), format!("{}={}", key, value)]);
        }
        args.push(network.name.clone());
        self.run_success(&args, Some(COMMAND_TIMEOUT)).await?;
        Ok(())
    }

    async fn remove_network(&self, name: &str) -> Result<()> {
        let output = self
            .run(&strings(&["network", "rm", name]), Some(COMMAND_TIMEOUT))
            .await?;
        let stderr = String::from_utf8_lossy(&output.stderr);
        if output.status.success() || stderr.contains("not found") {
            return Ok(());
        }
        Err(failed("network rm", &output))
    }
}

fn strings(args: &[&str]) -> Vec<String> {
    args.iter().map(|s| s.to_string()).collect()
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}

fn failed(command: &str, output: &Output) -> StackError {
    StackError::Container(format!(
        "docker {} failed ({}): {}",
        command,
        exit_code(output.status),
        String::from_utf8_lossy(&output.stderr).trim()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::{PortMapping, Protocol, RestartPolicy};
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;
    use tempfile::tempdir;

    /// Stand-in docker binary that logs its arguments and answers like a
    /// daemon with no containers
    fn fake_docker(dir: &Path) -> (DockerRuntime, std::path::PathBuf) {
        let log = dir.join("calls.log");
        let script = dir.join("docker");
        let body = format!(
            r#"#!/bin/sh
echo "$*" >> {log}
case "$1" in
  inspect)
    case "$*" in
      *State.Pid*) [ -f {dir}/created ] && echo 4242 && exit 0 ;;
    esac
    [ -f {dir}/created ] && echo true && exit 0
    echo "Error: No such object" >&2; exit 1 ;;
  run) touch {dir}/created; echo 0123abcd ;;
  wait) echo 3 ;;
  exec) shift 2; [ "$1" = "redis-cli" ] && exit 0; exit 1 ;;
  network) [ "$2" = "inspect" ] && exit 1; exit 0 ;;
  *) exit 0 ;;
esac
"#,
            log = log.display(),
            dir = dir.display()
        );
        std::fs::write(&script, body).unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        (DockerRuntime::new(script.to_string_lossy()), log)
    }

    fn redis() -> ContainerConfig {
        let mut config = ContainerConfig::new("stack-redis-1", "redis:5.0")
            .env("TZ", "UTC")
            .volume("/opt/stack/data/redis", "/data")
            .restart(RestartPolicy::UnlessStopped);
        config.networks = vec!["stack_backend".to_string(), "stack_admin".to_string()];
        config.aliases = vec!["redis".to_string()];
        config.ports.push(PortMapping {
            host_ip: Some("127.0.0.1".to_string()),
            host_port: 6379,
            container_port: 6379,
            protocol: Protocol::Tcp,
        });
        config.cmd = vec!["redis-server".to_string(), "--appendonly".to_string(), "yes".to_string()];
        config
    }

    #[test]
    fn test_run_args() {
        let args = DockerRuntime::run_args(&redis()).join(" ");
        assert!(args.starts_with("run -d --name stack-redis-1 --hostname stack-redis-1"));
        assert!(args.contains("--network stack_backend --network-alias redis"));
        assert!(args.contains("-p 127.0.0.1:6379:6379/tcp"));
        assert!(args.contains("-v /opt/stack/data/redis:/data"));
        assert!(args.contains("-e TZ=UTC"));
        assert!(args.ends_with("redis:5.0 redis-server --appendonly yes"));
        // Restarts belong to the manager
        assert!(!args.contains("--restart"));
    }

    #[tokio::test]
    async fn test_spawn_runs_then_connects_extra_networks() {
        let temp = tempdir().unwrap();
        let (runtime, log) = fake_docker(temp.path());

        let pid = runtime.spawn(&redis()).await.unwrap();
        assert_eq!(pid, Some(4242));

        let calls = std::fs::read_to_string(&log).unwrap();
        assert!(calls.contains("run -d --name stack-redis-1"));
        assert!(calls.contains("network connect --alias redis stack_admin stack-redis-1"));

        // Second spawn finds the running container and leaves it alone
        runtime.spawn(&redis()).await.unwrap();
        let calls = std::fs::read_to_string(&log).unwrap();
        assert_eq!(calls.matches("run -d").count(), 1);
    }

    #[tokio::test]
    async fn test_wait_and_exec_report_exit_codes() {
        let temp = tempdir().unwrap();
        let (runtime, log) = fake_docker(temp.path());

        assert_eq!(runtime.wait(&redis()).await.unwrap(), 3);
        let ping = ["redis-cli".to_string(), "ping".to_string()];
        assert_eq!(runtime.exec("stack-redis-1", &ping).await.unwrap(), 0);
        assert_eq!(runtime.exec("stack-redis-1", &["false".to_string()]).await.unwrap(), 1);

        let calls = std::fs::read_to_string(&log).unwrap();
        assert!(calls.contains("exec stack-redis-1 redis-cli ping"));
    }

    #[tokio::test]
    async fn test_signal_maps_sigterm_to_stop() {
        let temp = tempdir().unwrap();
        let (runtime, log) = fake_docker(temp.path());

        runtime.signal(&redis(), libc::SIGTERM).await.unwrap();
        runtime.signal(&redis(), libc::SIGKILL).await.unwrap();

        let calls = std::fs::read_to_string(&log).unwrap();
        assert!(calls.contains("stop -t 10 stack-redis-1"));
        assert!(calls.contains("kill -s 9 stack-redis-1"));
    }

    #[tokio::test]
    async fn test_create_network_skips_builtin_drivers() {
        let temp = tempdir().unwrap();
        let (runtime, log) = fake_docker(temp.path());

        let mut network = NetworkConfig::new("stack_backend");
        network.labels.insert("io.stackrun.project".to_string(), "stack".to_string());
        runtime.create_network(&network).await.unwrap();

        network.name = "stack_host".to_string();
        network.driver = NetworkDriver::Host;
        runtime.create_network(&network).await.unwrap();

        let calls = std::fs::read_to_string(&log).unwrap();
        assert!(calls.contains("network create --driver bridge --label io.stackrun.project=stack stack_backend"));
        assert!(!calls.contains("stack_host"));
    }

    #[tokio::test]
    async fn test_missing_binary_is_container_error() {
        let runtime = DockerRuntime::new("/nonexistent/docker");
        let err = runtime.wait(&redis()).await.unwrap_err();
        assert!(matches!(err, StackError::Container(_)));
    }
}
