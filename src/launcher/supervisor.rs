//! Process supervisor
//!
//! Alternative to running the launcher script: every entry becomes a child
//! process watched by its own task. The foreground entry's exit status is
//! the supervisor's exit status; what happens when a background entry exits
//! first is decided by [`SiblingFailurePolicy`].

use super::script::{exit_code, LauncherEntry, LauncherScript, Placement, ProcessRole};
use crate::error::{Result, StackError};
use serde::{Deserialize, Serialize};
use std::process::Stdio;
use tokio::process::Command;
use tokio::sync::watch;
use tokio::task::JoinSet;

/// Reaction to a background process exiting while the foreground one runs
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SiblingFailurePolicy {
    /// Log it and keep going
    #[default]
    Ignore,
    /// Stop everything and exit with the sibling's status
    Shutdown,
}

/// Owns the launcher's processes
pub struct Supervisor {
    entries: Vec<LauncherEntry>,
    policy: SiblingFailurePolicy,
}

impl Supervisor {
    /// Supervise the entries of a valid launcher script
    pub fn new(script: &LauncherScript, policy: SiblingFailurePolicy) -> Result<Self> {
        script.validate()?;
        Ok(Self {
            entries: script.entries().to_vec(),
            policy,
        })
    }

    /// Spawn every entry and wait until the supervisor has to exit.
    ///
    /// Returns the exit code the container should report. Processes still
    /// running at that point are killed and reaped before this returns.
    pub async fn run(self) -> Result<i32> {
        let (shutdown, _) = watch::channel(false);
        let mut tasks: JoinSet<Result<Exit>> = JoinSet::new();

        for entry in self.entries {
            if let Err(e) = spawn_entry(&mut tasks, entry, shutdown.subscribe()) {
                drain(&mut tasks, &shutdown).await;
                return Err(e);
            }
        }

        let outcome = loop {
            let Some(joined) = tasks.join_next().await else {
                break Err(StackError::Launch(
                    "All processes exited without a foreground process".to_string(),
                ));
            };

            let exit = match joined {
                Ok(Ok(exit)) => exit,
                Ok(Err(e)) => break Err(e),
                Err(e) => break Err(StackError::Launch(format!("Supervisor task failed: {}", e))),
            };

            match (exit.placement, self.policy) {
                (Placement::Foreground, _) => {
                    tracing::info!(role = %exit.role, exit_code = exit.code, "foreground process exited");
                    break Ok(exit.code);
                }
                (Placement::Background, SiblingFailurePolicy::Ignore) => {
                    tracing::warn!(role = %exit.role, exit_code = exit.code, "background process exited, ignoring");
                }
                (Placement::Background, SiblingFailurePolicy::Shutdown) => {
                    tracing::error!(role = %exit.role, exit_code = exit.code, "background process exited, shutting down");
                    break Ok(exit.code);
                }
            }
        };

        drain(&mut tasks, &shutdown).await;
        outcome
    }
}

/// How one supervised process ended
struct Exit {
    role: ProcessRole,
    placement: Placement,
    code: i32,
}

fn spawn_entry(
    tasks: &mut JoinSet<Result<Exit>>,
    entry: LauncherEntry,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let (program, args) = entry
        .command
        .split_first()
        .ok_or_else(|| StackError::Launch(format!("Entry for {} has no command", entry.role)))?;

    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| {
            StackError::Launch(format!("Failed to start {} ({}): {}", entry.role, program, e))
        })?;

    tracing::info!(role = %entry.role, pid = ?child.id(), placement = ?entry.placement, "started");

    let (role, placement) = (entry.role, entry.placement);
    tasks.spawn(async move {
        tokio::select! {
            status = child.wait() => Ok(Exit { role, placement, code: exit_code(status?) }),
            _ = async { shutdown.wait_for(|stop| *stop).await.map(|_| ()) } => {
                // kill() also waits, so no zombie outlives the supervisor
                child.kill().await?;
                tracing::debug!(role = %role, "killed");
                Ok(Exit { role, placement, code: 128 + libc::SIGKILL })
            }
        }
    });
    Ok(())
}

/// Kill whatever is still running and wait for every task to finish
async fn drain(tasks: &mut JoinSet<Result<Exit>>, shutdown: &watch::Sender<bool>) {
    shutdown.send_replace(true);
    while let Some(joined) = tasks.join_next().await {
        if let Ok(Err(e)) = joined {
            tracing::warn!(error = %e, "failed to stop process");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    fn sh(script: &str) -> Vec<String> {
        vec!["sh".to_string(), "-c".to_string(), script.to_string()]
    }

    fn script(web: &str, files: &str, api: &str) -> LauncherScript {
        LauncherScript::new(vec![
            LauncherEntry::new(ProcessRole::WebServer, sh(web), Placement::Background),
            LauncherEntry::new(ProcessRole::FileServer, sh(files), Placement::Background),
            LauncherEntry::new(ProcessRole::ApiServer, sh(api), Placement::Foreground),
        ])
    }

    /// Whether a process with this PID still exists, zombies included
    fn alive(pid: i32) -> bool {
        unsafe { libc::kill(pid, 0) == 0 }
    }

    fn recorded_pid(path: &std::path::Path) -> i32 {
        std::fs::read_to_string(path).unwrap().trim().parse().unwrap()
    }

    #[tokio::test]
    async fn test_foreground_status_propagates_and_siblings_are_killed() {
        let temp = tempfile::tempdir().unwrap();
        let web_pid = temp.path().join("web.pid");
        let files_pid = temp.path().join("files.pid");
        let sibling = |pidfile: &std::path::Path| {
            format!("echo $$ > {}; exec sleep 30", pidfile.display())
        };

        let started = Instant::now();
        let supervisor = Supervisor::new(
            &script(&sibling(&web_pid), &sibling(&files_pid), "sleep 0.5; exit 4"),
            SiblingFailurePolicy::Ignore,
        )
        .unwrap();

        assert_eq!(supervisor.run().await.unwrap(), 4);
        assert!(started.elapsed() < Duration::from_secs(10));

        for pidfile in [&web_pid, &files_pid] {
            let pid = recorded_pid(pidfile);
            assert!(!alive(pid), "sibling {pid} outlived the supervisor");
        }
    }

    #[tokio::test]
    async fn test_ignore_policy_waits_for_foreground() {
        let supervisor = Supervisor::new(
            &script("exit 9", "sleep 30", "sleep 0.3; exit 0"),
            SiblingFailurePolicy::Ignore,
        )
        .unwrap();

        assert_eq!(supervisor.run().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_policy_returns_sibling_status() {
        let started = Instant::now();
        let supervisor = Supervisor::new(
            &script("exit 9", "sleep 30", "sleep 30"),
            SiblingFailurePolicy::Shutdown,
        )
        .unwrap();

        assert_eq!(supervisor.run().await.unwrap(), 9);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_missing_program_is_launch_error() {
        let script = LauncherScript::new(vec![LauncherEntry::new(
            ProcessRole::ApiServer,
            vec!["/nonexistent/stackrun-api".to_string()],
            Placement::Foreground,
        )]);
        let err = Supervisor::new(&script, SiblingFailurePolicy::Ignore)
            .unwrap()
            .run()
            .await
            .unwrap_err();
        assert!(matches!(err, StackError::Launch(_)));
    }

    #[test]
    fn test_invalid_script_rejected() {
        let script = LauncherScript::new(vec![LauncherEntry::new(
            ProcessRole::WebServer,
            sh("true"),
            Placement::Background,
        )]);
        assert!(Supervisor::new(&script, SiblingFailurePolicy::Shutdown).is_err());
    }
}
