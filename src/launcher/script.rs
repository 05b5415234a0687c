//! Launcher script synthesis

use crate::error::{Result, StackError};
use serde::{Deserialize, Serialize};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};

/// Where the orchestrating container writes its launcher
pub const DEFAULT_SCRIPT_PATH: &str = "/opt/stack/all.sh";

/// Program the standard entries invoke, with the role as its argument
pub const DEFAULT_WRAPPER: &str = "/opt/stack/bin/server";

/// Process the orchestrating container runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessRole {
    /// Web interface
    WebServer,
    /// File server
    FileServer,
    /// API server
    ApiServer,
}

impl ProcessRole {
    /// Argument passed to the wrapper to select this role
    pub fn as_arg(&self) -> &'static str {
        match self {
            ProcessRole::WebServer => "webserver",
            ProcessRole::FileServer => "fileserver",
            ProcessRole::ApiServer => "apiserver",
        }
    }
}

impl std::fmt::Display for ProcessRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_arg())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Placement {
    /// Detached with `&`
    Background,
    /// Holds the script, and with it the container, until it exits
    Foreground,
}

/// One process start in the launcher
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LauncherEntry {
    pub role: ProcessRole,
    pub command: Vec<String>,
    pub placement: Placement,
}

impl LauncherEntry {
    pub fn new(role: ProcessRole, command: Vec<String>, placement: Placement) -> Self {
        Self {
            role,
            command,
            placement,
        }
    }
}

/// Ordered process starts, rendered as a bash script
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LauncherScript {
    entries: Vec<LauncherEntry>,
    exec_foreground: bool,
}

impl LauncherScript {
    /// Build a script from arbitrary entries
    pub fn new(entries: Vec<LauncherEntry>) -> Self {
        Self {
            entries,
            exec_foreground: false,
        }
    }

    /// Web interface and file server in the background, API server in the
    /// foreground, each started as `<wrapper> <role>`
    pub fn standard(wrapper: &str) -> Self {
        let entry = |role: ProcessRole, placement| {
            LauncherEntry::new(
                role,
                vec![wrapper.to_string(), role.as_arg().to_string()],
                placement,
            )
        };

        Self::new(vec![
            entry(ProcessRole::WebServer, Placement::Background),
            entry(ProcessRole::FileServer, Placement::Background),
            entry(ProcessRole::ApiServer, Placement::Foreground),
        ])
    }

    /// Replace the shell with the foreground process instead of forking it
    pub fn exec_foreground(mut self, exec: bool) -> Self {
        self.exec_foreground = exec;
        self
    }

    pub fn entries(&self) -> &[LauncherEntry] {
        &self.entries
    }

    /// Exactly one foreground entry, placed last, and no empty command
    pub fn validate(&self) -> Result<()> {
        if let Some(empty) = self.entries.iter().find(|e| e.command.is_empty()) {
            return Err(StackError::Launch(format!(
                "Entry for {} has no command",
                empty.role
            )));
        }

        let foreground: Vec<usize> = self
            .entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.placement == Placement::Foreground)
            .map(|(i, _)| i)
            .collect();

        match foreground.as_slice() {
            [index] if *index + 1 == self.entries.len() => Ok(()),
            [_] => Err(StackError::Launch(
                "The foreground entry must be the last one".to_string(),
            )),
            [] => Err(StackError::Launch("No foreground entry".to_string())),
            _ => Err(StackError::Launch(format!(
                "{} foreground entries, expected one",
                foreground.len()
            ))),
        }
    }

    /// Render the script text
    pub fn render(&self) -> String {
        let mut script = String::from("#!/bin/bash\n");

        for entry in &self.entries {
            let command = entry
                .command
                .iter()
                .map(|arg| shell_quote(arg))
                .collect::<Vec<_>>()
                .join(" ");

            match entry.placement {
                Placement::Background => script.push_str(&format!("{} &\n", command)),
                Placement::Foreground if self.exec_foreground => {
                    script.push_str(&format!("exec {}\n", command))
                }
                Placement::Foreground => script.push_str(&format!("{}\n", command)),
            }
        }

        script
    }

    /// Validate, write the script to `path` and mark it executable.
    ///
    /// The file is rewritten on every call.
    pub fn write_to(&self, path: &Path) -> Result<PathBuf> {
        self.validate()?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StackError::Launch(format!("Failed to create {}: {}", parent.display(), e))
            })?;
        }

        std::fs::write(path, self.render()).map_err(|e| {
            StackError::Launch(format!("Failed to write {}: {}", path.display(), e))
        })?;

        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).map_err(|e| {
            StackError::Launch(format!(
                "Failed to make {} executable: {}",
                path.display(),
                e
            ))
        })?;

        tracing::debug!(path = %path.display(), entries = self.entries.len(), "wrote launcher script");
        Ok(path.to_path_buf())
    }

    /// Run a written script with bash and return its exit code
    pub async fn execute(path: &Path) -> Result<i32> {
        tracing::info!(path = %path.display(), "executing launcher script");

        let status = tokio::process::Command::new("/bin/bash")
            .arg(path)
            .status()
            .await
            .map_err(|e| {
                StackError::Launch(format!("Failed to run {}: {}", path.display(), e))
            })?;

        Ok(exit_code(status))
    }
}

/// Exit code of a finished process, `128 + signal` when it was killed
pub(crate) fn exit_code(status: std::process::ExitStatus) -> i32 {
    status
        .code()
        .unwrap_or_else(|| 128 + status.signal().unwrap_or(0))
}

fn shell_quote(arg: &str) -> String {
    let safe = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,+@%".contains(c));
    if safe {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_standard_script_layout() {
        let script = LauncherScript::standard("/opt/stack/bin/server");
        script.validate().unwrap();

        assert_eq!(
            script.render(),
            "#!/bin/bash\n\
             /opt/stack/bin/server webserver &\n\
             /opt/stack/bin/server fileserver &\n\
             /opt/stack/bin/server apiserver\n"
        );

        let roles: Vec<ProcessRole> = script.entries().iter().map(|e| e.role).collect();
        assert_eq!(
            roles,
            vec![ProcessRole::WebServer, ProcessRole::FileServer, ProcessRole::ApiServer]
        );
    }

    #[test]
    fn test_exec_foreground() {
        let text = LauncherScript::standard("srv").exec_foreground(true).render();
        assert!(text.ends_with("exec srv apiserver\n"));
        assert!(text.contains("srv webserver &\n"));
    }

    #[test]
    fn test_arguments_are_quoted() {
        let script = LauncherScript::new(vec![LauncherEntry::new(
            ProcessRole::ApiServer,
            vec!["echo".to_string(), "it's here".to_string()],
            Placement::Foreground,
        )]);
        assert!(script.render().contains(r"echo 'it'\''s here'"));
    }

    #[test]
    fn test_validate_rejects_misplaced_foreground() {
        let entry = |role, placement| LauncherEntry::new(role, vec!["true".to_string()], placement);

        let first = LauncherScript::new(vec![
            entry(ProcessRole::ApiServer, Placement::Foreground),
            entry(ProcessRole::WebServer, Placement::Background),
        ]);
        assert!(first.validate().is_err());

        let none = LauncherScript::new(vec![entry(ProcessRole::WebServer, Placement::Background)]);
        assert!(none.validate().is_err());

        let two = LauncherScript::new(vec![
            entry(ProcessRole::WebServer, Placement::Foreground),
            entry(ProcessRole::ApiServer, Placement::Foreground),
        ]);
        assert!(two.validate().is_err());
    }

    #[test]
    fn test_write_to_sets_mode() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("nested/all.sh");

        let written = LauncherScript::standard("srv").write_to(&path).unwrap();
        assert_eq!(written, path);

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);
        assert!(std::fs::read_to_string(&path).unwrap().starts_with("#!/bin/bash\n"));
    }

    #[test]
    fn test_write_failure_is_launch_error() {
        let temp = tempdir().unwrap();
        let blocker = temp.path().join("file");
        std::fs::write(&blocker, "").unwrap();

        let err = LauncherScript::standard("srv")
            .write_to(&blocker.join("all.sh"))
            .unwrap_err();
        assert!(matches!(err, StackError::Launch(_)));
    }

    #[tokio::test]
    async fn test_execute_propagates_foreground_status() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("all.sh");
        let sh = |script: &str| vec!["sh".to_string(), "-c".to_string(), script.to_string()];

        LauncherScript::new(vec![
            LauncherEntry::new(ProcessRole::WebServer, sh("exit 1"), Placement::Background),
            LauncherEntry::new(ProcessRole::FileServer, sh("exit 2"), Placement::Background),
            LauncherEntry::new(ProcessRole::ApiServer, sh("exit 7"), Placement::Foreground),
        ])
        .write_to(&path)
        .unwrap();

        assert_eq!(LauncherScript::execute(&path).await.unwrap(), 7);
    }
}
