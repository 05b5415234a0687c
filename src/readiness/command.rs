use super::ReadinessProbe;
use crate::container::ContainerRuntime;
use crate::error::{Result, StackError};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Ready once a command run inside the container exits with status 0
pub struct CommandProbe {
    runtime: Arc<dyn ContainerRuntime>,
    container: String,
    command: Vec<String>,
    timeout: Duration,
}

impl CommandProbe {
    /// Create a probe from an exec-form command
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        container: impl Into<String>,
        command: Vec<String>,
        timeout: Duration,
    ) -> Result<Self> {
        if command.is_empty() {
            return Err(StackError::InvalidConfig("Empty probe command".to_string()));
        }

        Ok(Self {
            runtime,
            container: container.into(),
            command,
            timeout,
        })
    }
}

#[async_trait]
impl ReadinessProbe for CommandProbe {
    async fn check(&self) -> Result<bool> {
        let status = tokio::time::timeout(
            self.timeout,
            self.runtime.exec(&self.container, &self.command),
        )
        .await;

        match status {
            Ok(Ok(code)) => Ok(code == 0),
            Ok(Err(_)) | Err(_) => Ok(false),
        }
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn describe(&self) -> String {
        format!("exec {}: {}", self.container, self.command.join(" "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::ContainerConfig;
    use crate::network::NetworkConfig;
    use std::sync::Mutex;

    /// Runtime whose exec answers from a fixed exit code and remembers
    /// where each command ran
    struct ExecRuntime {
        exit_code: i32,
        delay: Duration,
        calls: Mutex<Vec<(String, Vec<String>)>>,
    }

    impl ExecRuntime {
        fn new(exit_code: i32, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                exit_code,
                delay,
                calls: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl ContainerRuntime for ExecRuntime {
        async fn spawn(&self, _config: &ContainerConfig) -> Result<Option<u32>> {
            Ok(None)
        }

        async fn signal(&self, _config: &ContainerConfig, _signal: i32) -> Result<()> {
            Ok(())
        }

        async fn wait(&self, _config: &ContainerConfig) -> Result<i32> {
            std::future::pending().await
        }

        async fn exec(&self, container: &str, command: &[String]) -> Result<i32> {
            self.calls
                .lock()
                .unwrap()
                .push((container.to_string(), command.to_vec()));
            tokio::time::sleep(self.delay).await;
            Ok(self.exit_code)
        }

        async fn remove(&self, _config: &ContainerConfig) -> Result<()> {
            Ok(())
        }

        async fn create_network(&self, _network: &NetworkConfig) -> Result<()> {
            Ok(())
        }

        async fn remove_network(&self, _name: &str) -> Result<()> {
            Ok(())
        }
    }

    fn ping() -> Vec<String> {
        vec!["redis-cli".to_string(), "ping".to_string()]
    }

    #[tokio::test]
    async fn test_runs_inside_the_container() {
        let runtime = ExecRuntime::new(0, Duration::ZERO);
        let check = CommandProbe::new(runtime.clone(), "stack-redis-1", ping(), Duration::from_secs(5))
            .unwrap();

        assert!(check.check().await.unwrap());
        assert_eq!(
            runtime.calls.lock().unwrap().as_slice(),
            &[("stack-redis-1".to_string(), ping())]
        );
        assert_eq!(check.describe(), "exec stack-redis-1: redis-cli ping");
    }

    #[tokio::test]
    async fn test_exit_status_decides() {
        let failing = CommandProbe::new(
            ExecRuntime::new(3, Duration::ZERO),
            "stack-redis-1",
            ping(),
            Duration::from_secs(5),
        )
        .unwrap();
        assert!(!failing.check().await.unwrap());
    }

    #[tokio::test]
    async fn test_timeout_is_not_ready() {
        let slow = CommandProbe::new(
            ExecRuntime::new(0, Duration::from_secs(5)),
            "stack-redis-1",
            ping(),
            Duration::from_millis(50),
        )
        .unwrap();
        assert!(!slow.check().await.unwrap());
    }

    #[test]
    fn test_empty_command_rejected() {
        let runtime = ExecRuntime::new(0, Duration::ZERO);
        assert!(CommandProbe::new(runtime, "c", Vec::new(), Duration::from_secs(1)).is_err());
    }
}
