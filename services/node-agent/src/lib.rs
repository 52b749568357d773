//! camfleet Node Agent Library
//!
//! The node agent runs on every machine of the camera cluster. It accepts a
//! single control connection from the control plane, receives the node's
//! process manifest and then runs, monitors, restarts and stops those
//! processes as lifecycle commands arrive.
//!
//! ## Architecture
//!
//! ```text
//! AgentServer (one control connection at a time)
//! └── SupervisorHandle ──mailbox──> supervisor actor
//!                                   └── ProcessSupervisor
//!                                       └── Launcher -> ProcessHandle per entry
//! ```
//!
//! Status reports flow back from the supervisor over a broadcast channel and
//! are forwarded upstream on the live connection.
//!
//! ## Modules
//!
//! - `supervisor`: per-entry state machine, its actor, restart policy
//! - `launcher`: subprocesses, in-process functions, mock launcher
//! - `server`: control listener and connection handling

pub mod config;
pub mod error;
pub mod launcher;
pub mod server;
pub mod supervisor;

pub use config::Config;
pub use error::{LaunchError, SupervisorError};
pub use launcher::{HostLauncher, Launcher, MockLauncher};
pub use server::AgentServer;
pub use supervisor::{spawn_supervisor, SupervisorHandle, SupervisorPolicy};
