//! Process supervision.
//!
//! - `state`: the per-entry state machine ([`ProcessSupervisor`])
//! - `actor`: the task that owns it and the [`SupervisorHandle`] to reach it
//! - `policy`: restart bound, backoff and timing

mod actor;
mod policy;
mod state;

pub use actor::{spawn_supervisor, SupervisorHandle, SupervisorMessage};
pub use policy::{BackoffPolicy, SupervisorPolicy};
pub use state::{EntrySnapshot, ManifestOutcome, ProcessSupervisor};
