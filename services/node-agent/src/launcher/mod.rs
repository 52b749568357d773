//! Launching and controlling managed processes.
//!
//! The supervisor never talks to the OS directly. It asks a [`Launcher`] for
//! a [`ProcessHandle`] and from then on only polls, signals and kills through
//! that handle, so the state machine can be driven by [`MockLauncher`] in
//! tests.
//!
//! - [`HostLauncher`]: real subprocesses plus in-process functions
//! - [`MockLauncher`]: scripted handles for tests and development

mod function;
mod mock;
mod subprocess;

use std::fmt;
use std::sync::Arc;

use camfleet_manifest::{ProcessManifestEntry, ProcessMode};
use camfleet_proto::ProcessId;

use crate::error::LaunchError;

pub use function::{
    FunctionContext, FunctionHandle, FunctionRegistry, IdleFunction, ProcessFunction,
    SleepFunction,
};
pub use mock::{MockControl, MockLauncher};
pub use subprocess::{command_line, SubprocessHandle};

/// How a managed process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Exit {
    /// Exited with a status code.
    Code(i32),

    /// Killed by a signal.
    Signal(i32),

    /// An in-process function returned normally.
    Returned,

    /// The process failed in a way that carries no status (function error,
    /// panic, lost child).
    Failed(String),
}

impl fmt::Display for Exit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Exit::Code(code) => write!(f, "exited with code {code}"),
            Exit::Signal(signal) => write!(f, "killed by signal {signal}"),
            Exit::Returned => f.write_str("function returned"),
            Exit::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}

/// Control over one launched process.
///
/// Every method is non-blocking so the supervisor loop never stalls on a
/// single entry.
pub trait ProcessHandle: Send {
    fn id(&self) -> ProcessId;

    /// Returns the exit once the process has ended, `None` while it runs.
    fn poll_exit(&mut self) -> Option<Exit>;

    /// Ask the process to stop on its own.
    fn request_stop(&mut self) -> anyhow::Result<()>;

    /// Stop the process unconditionally.
    fn force_kill(&mut self) -> anyhow::Result<()>;
}

/// Starts manifest entries.
pub trait Launcher: Send + Sync + 'static {
    fn launch(&self, entry: &ProcessManifestEntry) -> Result<Box<dyn ProcessHandle>, LaunchError>;
}

/// Launches entries on this host according to their mode.
#[derive(Clone)]
pub struct HostLauncher {
    functions: Arc<FunctionRegistry>,
}

impl HostLauncher {
    pub fn new(functions: FunctionRegistry) -> Self {
        Self {
            functions: Arc::new(functions),
        }
    }
}

impl Default for HostLauncher {
    fn default() -> Self {
        Self::new(FunctionRegistry::with_builtins())
    }
}

impl Launcher for HostLauncher {
    fn launch(&self, entry: &ProcessManifestEntry) -> Result<Box<dyn ProcessHandle>, LaunchError> {
        match entry.mode {
            ProcessMode::ExternalSubprocess => Ok(Box::new(SubprocessHandle::spawn(entry)?)),
            ProcessMode::InProcessFunction => Ok(Box::new(self.functions.spawn(entry)?)),
        }
    }
}
