//! Scripted launcher for testing and development.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use camfleet_manifest::ProcessManifestEntry;
use camfleet_proto::ProcessId;
use tracing::debug;

use super::{Exit, Launcher, ProcessHandle};
use crate::error::LaunchError;

/// Launcher whose processes only exist in memory.
///
/// By default a mock process runs until it is stopped or killed. Behaviour
/// can be scripted per command.
#[derive(Clone, Default)]
pub struct MockLauncher {
    state: Arc<Mutex<MockState>>,
    next_pid: Arc<AtomicU32>,
}

#[derive(Default)]
struct MockState {
    fail_launch: HashSet<String>,
    crash_on_launch: HashSet<String>,
    ignore_stop: HashSet<String>,
    launched: HashMap<String, Vec<MockControl>>,
}

impl MockLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every launch of `command` fails.
    pub fn fail_launches(&self, command: &str) -> &Self {
        self.lock().fail_launch.insert(command.to_string());
        self
    }

    /// Every process of `command` has already exited with code 1 when first
    /// polled.
    pub fn crash_on_launch(&self, command: &str) -> &Self {
        self.lock().crash_on_launch.insert(command.to_string());
        self
    }

    /// Processes of `command` ignore stop requests and only die when killed.
    pub fn ignore_stop(&self, command: &str) -> &Self {
        self.lock().ignore_stop.insert(command.to_string());
        self
    }

    /// How many times `command` was launched successfully.
    pub fn launch_count(&self, command: &str) -> usize {
        self.lock().launched.get(command).map_or(0, Vec::len)
    }

    /// Control over the most recent process of `command`.
    pub fn last(&self, command: &str) -> Option<MockControl> {
        self.lock()
            .launched
            .get(command)
            .and_then(|controls| controls.last().cloned())
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        // A panicking test thread must not hide the state from the others.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Launcher for MockLauncher {
    fn launch(&self, entry: &ProcessManifestEntry) -> Result<Box<dyn ProcessHandle>, LaunchError> {
        let mut state = self.lock();

        if state.fail_launch.contains(&entry.command) {
            return Err(LaunchError::Spawn {
                command: entry.command.clone(),
                source: std::io::Error::other("mock launcher configured to fail"),
            });
        }

        let pid = 1000 + self.next_pid.fetch_add(1, Ordering::SeqCst);
        let control = MockControl {
            inner: Arc::new(Mutex::new(MockProcess {
                exit: state
                    .crash_on_launch
                    .contains(&entry.command)
                    .then_some(Exit::Code(1)),
                ignore_stop: state.ignore_stop.contains(&entry.command),
                stop_requests: 0,
                killed: false,
            })),
        };

        state
            .launched
            .entry(entry.command.clone())
            .or_default()
            .push(control.clone());

        debug!(command = %entry.command, pid, "[MOCK] Launched process");

        Ok(Box::new(MockHandle { pid, control }))
    }
}

struct MockProcess {
    exit: Option<Exit>,
    ignore_stop: bool,
    stop_requests: u32,
    killed: bool,
}

/// Test-side view of one mock process.
#[derive(Clone)]
pub struct MockControl {
    inner: Arc<Mutex<MockProcess>>,
}

impl MockControl {
    /// Make the process exit.
    pub fn exit(&self, exit: Exit) {
        self.lock().exit.get_or_insert(exit);
    }

    pub fn is_running(&self) -> bool {
        self.lock().exit.is_none()
    }

    pub fn stop_requests(&self) -> u32 {
        self.lock().stop_requests
    }

    pub fn was_killed(&self) -> bool {
        self.lock().killed
    }

    fn lock(&self) -> MutexGuard<'_, MockProcess> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

struct MockHandle {
    pid: u32,
    control: MockControl,
}

impl ProcessHandle for MockHandle {
    fn id(&self) -> ProcessId {
        ProcessId::Os(self.pid)
    }

    fn poll_exit(&mut self) -> Option<Exit> {
        self.control.lock().exit.clone()
    }

    fn request_stop(&mut self) -> anyhow::Result<()> {
        let mut process = self.control.lock();
        process.stop_requests += 1;
        if !process.ignore_stop {
            process.exit.get_or_insert(Exit::Signal(15));
        }
        Ok(())
    }

    fn force_kill(&mut self) -> anyhow::Result<()> {
        let mut process = self.control.lock();
        process.killed = true;
        process.exit.get_or_insert(Exit::Signal(9));
        Ok(())
    }
}
