//! camfleet control plane library.
//!
//! This crate primarily ships a `control-plane` binary, but we expose a small
//! library surface to enable integration testing and reuse.
//!
//! - `control`: manifest distribution and group-filtered command fan-out
//! - `link`: one control connection per node agent
//! - `prompt`: the interactive command prompt

pub mod config;
pub mod control;
pub mod error;
pub mod link;
pub mod prompt;

pub use config::{Config, LinkSettings};
pub use control::{ControlPlane, DispatchReport};
pub use error::{ConnectionError, PromptError};
