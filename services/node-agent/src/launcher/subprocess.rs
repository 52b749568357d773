//! External subprocesses.

use std::os::unix::process::ExitStatusExt;
use std::process::Stdio;

use anyhow::Context;
use camfleet_manifest::ProcessManifestEntry;
use camfleet_proto::ProcessId;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::process::{Child, Command};

use super::{Exit, ProcessHandle};
use crate::error::LaunchError;

/// Arguments passed after the program: positional args, then every kwarg as
/// `--key value`, then every flag as `--flag`.
///
/// Keys and flags that already start with `-` are passed as written.
pub fn command_line(entry: &ProcessManifestEntry) -> Vec<String> {
    let mut argv = entry.args.clone();

    for (key, value) in &entry.kwargs {
        argv.push(as_option(key));
        argv.push(value.clone());
    }

    argv.extend(entry.flags.iter().map(|flag| as_option(flag)));
    argv
}

fn as_option(name: &str) -> String {
    if name.starts_with('-') {
        name.to_string()
    } else {
        format!("--{name}")
    }
}

/// A spawned child process.
///
/// The child is not killed when the handle is dropped, so processes survive
/// a lost control connection.
pub struct SubprocessHandle {
    child: Child,
    pid: u32,
}

impl SubprocessHandle {
    pub fn spawn(entry: &ProcessManifestEntry) -> Result<Self, LaunchError> {
        let mut cmd = Command::new(&entry.command);

        cmd.args(command_line(entry))
            .stdin(Stdio::null())
            .kill_on_drop(false);

        let child = cmd.spawn().map_err(|source| LaunchError::Spawn {
            command: entry.command.clone(),
            source,
        })?;

        let pid = child
            .id()
            .ok_or_else(|| LaunchError::NoPid(entry.command.clone()))?;

        Ok(Self { child, pid })
    }

    fn signal(&self, signal: Signal) -> anyhow::Result<()> {
        let pid = i32::try_from(self.pid).context("pid out of range")?;
        kill(Pid::from_raw(pid), signal)
            .with_context(|| format!("failed to send {signal:?} to pid {}", self.pid))
    }
}

impl ProcessHandle for SubprocessHandle {
    fn id(&self) -> ProcessId {
        ProcessId::Os(self.pid)
    }

    fn poll_exit(&mut self) -> Option<Exit> {
        match self.child.try_wait() {
            Ok(Some(status)) => Some(match (status.code(), status.signal()) {
                (Some(code), _) => Exit::Code(code),
                (None, Some(signal)) => Exit::Signal(signal),
                (None, None) => Exit::Failed(status.to_string()),
            }),
            Ok(None) => None,
            Err(e) => Some(Exit::Failed(e.to_string())),
        }
    }

    fn request_stop(&mut self) -> anyhow::Result<()> {
        self.signal(Signal::SIGTERM)
    }

    fn force_kill(&mut self) -> anyhow::Result<()> {
        // Already reaped means already gone.
        if self.child.id().is_none() {
            return Ok(());
        }
        self.child
            .start_kill()
            .with_context(|| format!("failed to kill pid {}", self.pid))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use camfleet_manifest::{Group, ProcessMode};
    use std::time::Duration;

    fn entry(command: &str, args: &[&str]) -> ProcessManifestEntry {
        ProcessManifestEntry {
            mode: ProcessMode::ExternalSubprocess,
            command: command.to_string(),
            timeout_secs: 1.0,
            args: args.iter().map(|s| s.to_string()).collect(),
            kwargs: Default::default(),
            flags: Default::default(),
            group: Group::Ingest,
            description: String::new(),
        }
    }

    async fn wait_exit(handle: &mut SubprocessHandle) -> Exit {
        for _ in 0..200 {
            if let Some(exit) = handle.poll_exit() {
                return exit;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("process did not exit");
    }

    #[test]
    fn test_command_line_order() {
        let mut e = entry("/opt/i24/ingest", &["4", "cam"]);
        e.kwargs.insert("fps".to_string(), "30".to_string());
        e.kwargs.insert("-o".to_string(), "out.mp4".to_string());
        e.flags.insert("verbose".to_string());
        e.flags.insert("--dry-run".to_string());

        assert_eq!(
            command_line(&e),
            vec!["4", "cam", "-o", "out.mp4", "--fps", "30", "--dry-run", "--verbose"]
        );
    }

    #[tokio::test]
    async fn test_exit_code_reported() {
        let mut handle = SubprocessHandle::spawn(&entry("sh", &["-c", "exit 3"])).unwrap();
        assert!(matches!(handle.id(), ProcessId::Os(pid) if pid > 0));
        assert_eq!(wait_exit(&mut handle).await, Exit::Code(3));
    }

    #[tokio::test]
    async fn test_sigterm_stops_process() {
        let mut handle = SubprocessHandle::spawn(&entry("sleep", &["30"])).unwrap();
        assert!(handle.poll_exit().is_none());

        handle.request_stop().unwrap();
        assert_eq!(wait_exit(&mut handle).await, Exit::Signal(Signal::SIGTERM as i32));
    }

    #[tokio::test]
    async fn test_force_kill_ignores_sigterm_trap() {
        let mut handle =
            SubprocessHandle::spawn(&entry("sh", &["-c", "trap '' TERM; exec sleep 30"])).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        handle.request_stop().unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(handle.poll_exit().is_none());

        handle.force_kill().unwrap();
        assert!(matches!(wait_exit(&mut handle).await, Exit::Signal(_)));
    }

    #[tokio::test]
    async fn test_missing_program_is_launch_error() {
        let err = SubprocessHandle::spawn(&entry("/nonexistent/camfleet-binary", &[]))
            .err()
            .unwrap();
        assert!(matches!(err, LaunchError::Spawn { .. }));
    }
}
