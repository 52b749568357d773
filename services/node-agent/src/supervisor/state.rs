//! Process supervisor state machine.
//!
//! ## State Machine
//!
//! ```text
//! pending -> starting -> running ------> stopping -> terminated
//!                |          |               ^
//!                v          v               |
//!              failed -> restarting --------+
//! ```
//!
//! Every operation takes the current time instead of reading a clock, and
//! never blocks: launching, polling and signalling all go through
//! non-blocking [`ProcessHandle`] calls. The actor in `actor.rs` owns one
//! `ProcessSupervisor` and drives it from its mailbox and ticker.

use std::sync::Arc;
use std::time::Duration;

use camfleet_manifest::{NodeManifest, ProcessManifestEntry, ProcessStatus};
use camfleet_proto::{CommandKind, ProcessId, StatusEvent, StatusReport};
use chrono::Utc;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::policy::SupervisorPolicy;
use crate::error::SupervisorError;
use crate::launcher::{Exit, Launcher, ProcessHandle};

/// What happened to a manifest handed to the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManifestOutcome {
    /// First manifest.
    Loaded,
    /// Same manifest as the one already loaded; runtime state kept.
    Unchanged,
    /// A different manifest replaced an idle one.
    Replaced,
}

/// Point-in-time view of one entry.
#[derive(Debug, Clone, PartialEq)]
pub struct EntrySnapshot {
    pub entry: usize,
    pub command: String,
    pub status: ProcessStatus,
    pub process_id: Option<ProcessId>,
    pub restarts: u32,
}

/// Runtime wrapper around one manifest entry.
struct ManagedEntry {
    template: ProcessManifestEntry,
    status: ProcessStatus,
    id: Option<ProcessId>,
    handle: Option<Box<dyn ProcessHandle>>,

    /// Relaunches since the last START.
    restarts: u32,
    restart_at: Option<Instant>,
    stop_deadline: Option<Instant>,
    next_check: Instant,
}

impl ManagedEntry {
    fn new(template: ProcessManifestEntry, now: Instant) -> Self {
        Self {
            template,
            status: ProcessStatus::Pending,
            id: None,
            handle: None,
            restarts: 0,
            restart_at: None,
            stop_deadline: None,
            next_check: now,
        }
    }
}

/// Owns the runtime state of every entry of one node's manifest.
pub struct ProcessSupervisor<L: Launcher> {
    launcher: Arc<L>,
    policy: SupervisorPolicy,
    manifest: Option<NodeManifest>,
    entries: Vec<ManagedEntry>,
    events: broadcast::Sender<StatusReport>,
}

impl<L: Launcher> ProcessSupervisor<L> {
    pub fn new(
        launcher: Arc<L>,
        policy: SupervisorPolicy,
        events: broadcast::Sender<StatusReport>,
    ) -> Self {
        Self {
            launcher,
            policy,
            manifest: None,
            entries: Vec::new(),
            events,
        }
    }

    /// Node name of the loaded manifest.
    pub fn node(&self) -> &str {
        self.manifest.as_ref().map_or("", |m| m.node.as_str())
    }

    /// Entries the supervisor is actively driving.
    pub fn active_count(&self) -> usize {
        self.entries.iter().filter(|e| e.status.is_active()).count()
    }

    pub fn snapshot(&self) -> Vec<EntrySnapshot> {
        self.entries
            .iter()
            .enumerate()
            .map(|(index, e)| EntrySnapshot {
                entry: index,
                command: e.template.command.clone(),
                status: e.status,
                process_id: e.id,
                restarts: e.restarts,
            })
            .collect()
    }

    /// Install a manifest.
    ///
    /// An identical manifest is a no-op. A different one only replaces the
    /// current manifest while no entry is active.
    pub fn load_manifest(
        &mut self,
        manifest: NodeManifest,
        now: Instant,
    ) -> Result<ManifestOutcome, SupervisorError> {
        let outcome = match &self.manifest {
            None => ManifestOutcome::Loaded,
            Some(current) if *current == manifest => {
                // A reconnecting controller learns where every entry stands.
                for index in 0..self.entries.len() {
                    let detail = Some("manifest unchanged".to_string());
                    self.emit(index, StatusEvent::Transition, detail);
                }
                return Ok(ManifestOutcome::Unchanged);
            }
            Some(_) => {
                let active = self.active_count();
                if active > 0 {
                    return Err(SupervisorError::ManifestRefused { active });
                }
                ManifestOutcome::Replaced
            }
        };

        info!(
            node = %manifest.node,
            entries = manifest.len(),
            outcome = ?outcome,
            "Manifest installed"
        );

        self.entries = manifest
            .entries
            .iter()
            .cloned()
            .map(|template| ManagedEntry::new(template, now))
            .collect();
        self.manifest = Some(manifest);

        for index in 0..self.entries.len() {
            self.emit(index, StatusEvent::Transition, None);
        }

        Ok(outcome)
    }

    /// Apply a lifecycle command to every entry.
    pub fn apply(&mut self, kind: CommandKind, now: Instant) {
        info!(
            node = %self.node(),
            command = %kind,
            entries = self.entries.len(),
            "Applying command"
        );

        match kind {
            CommandKind::Start => self.start(now),
            CommandKind::FinishProcessing => self.finish_processing(now),
            CommandKind::SoftStop => self.soft_stop(now),
            CommandKind::HardStop => self.hard_stop(),
        }
    }

    /// Launch every `Pending` or `Terminated` entry. Other entries are left
    /// alone, `Failed` ones included.
    pub fn start(&mut self, now: Instant) {
        for index in 0..self.entries.len() {
            match self.entries[index].status {
                ProcessStatus::Pending | ProcessStatus::Terminated => {
                    self.entries[index].restarts = 0;
                    self.launch(index, now);
                }
                status => {
                    debug!(entry = index, status = %status, "Start skipped");
                }
            }
        }
    }

    /// Cooperative stop bounded by each entry's own timeout.
    pub fn soft_stop(&mut self, now: Instant) {
        for index in 0..self.entries.len() {
            let grace = self.entries[index].template.timeout();
            self.request_stop(index, now, grace);
        }
    }

    /// Cooperative stop with the longer finish-processing grace.
    pub fn finish_processing(&mut self, now: Instant) {
        let multiplier = self.policy.finish_grace_multiplier;
        for index in 0..self.entries.len() {
            let grace = self.entries[index]
                .template
                .timeout()
                .checked_mul(multiplier)
                .unwrap_or(Duration::MAX);
            self.request_stop(index, now, grace);
        }
    }

    /// Force every entry to `Terminated`, whatever its state.
    pub fn hard_stop(&mut self) {
        for index in 0..self.entries.len() {
            if let Some(handle) = self.entries[index].handle.as_mut() {
                if let Err(e) = handle.force_kill() {
                    warn!(entry = index, error = %e, "Failed to kill process");
                }
            }

            if self.entries[index].status != ProcessStatus::Terminated {
                self.terminate(index, StatusEvent::Transition, Some("hard stop".to_string()));
            } else {
                self.clear_runtime(index);
            }
        }
    }

    /// One supervision pass: health checks, stop deadlines, due restarts.
    pub fn tick(&mut self, now: Instant) {
        for index in 0..self.entries.len() {
            match self.entries[index].status {
                ProcessStatus::Running => self.check_running(index, now),
                ProcessStatus::Stopping => self.check_stopping(index, now),
                ProcessStatus::Restarting => {
                    if self.entries[index].restart_at.is_some_and(|at| at <= now) {
                        self.entries[index].restart_at = None;
                        self.launch(index, now);
                    }
                }
                _ => {}
            }
        }
    }

    // -------------------------------------------------------------------------
    // Transitions
    // -------------------------------------------------------------------------

    fn launch(&mut self, index: usize, now: Instant) {
        self.set_status(index, ProcessStatus::Starting, StatusEvent::Transition, None);

        match self.launcher.launch(&self.entries[index].template) {
            Ok(handle) => {
                let entry = &mut self.entries[index];
                entry.id = Some(handle.id());
                entry.handle = Some(handle);
                entry.next_check = now + self.policy.check_interval(entry.template.timeout());
                self.set_status(index, ProcessStatus::Running, StatusEvent::Transition, None);
            }
            Err(e) => {
                self.set_status(
                    index,
                    ProcessStatus::Failed,
                    StatusEvent::LaunchFailed,
                    Some(e.to_string()),
                );
                self.schedule_restart(index, now);
            }
        }
    }

    /// From `Failed`: relaunch after backoff, or stay failed for good.
    fn schedule_restart(&mut self, index: usize, now: Instant) {
        let max = self.policy.max_restarts;
        let restarts = self.entries[index].restarts;

        if restarts >= max {
            self.set_status(
                index,
                ProcessStatus::Failed,
                StatusEvent::RetriesExhausted,
                Some(format!("gave up after {restarts} restarts")),
            );
            return;
        }

        let delay = self.policy.backoff.delay(restarts);
        let entry = &mut self.entries[index];
        entry.restarts += 1;
        entry.restart_at = Some(now + delay);

        let detail = format!(
            "restart {} of {max} in {}ms",
            entry.restarts,
            delay.as_millis()
        );
        self.set_status(
            index,
            ProcessStatus::Restarting,
            StatusEvent::RestartScheduled,
            Some(detail),
        );
    }

    fn request_stop(&mut self, index: usize, now: Instant, grace: Duration) {
        let deadline = deadline_after(now, grace);

        match self.entries[index].status {
            ProcessStatus::Running => {
                let entry = &mut self.entries[index];
                if let Some(handle) = entry.handle.as_mut() {
                    if let Err(e) = handle.request_stop() {
                        warn!(entry = index, error = %e, "Failed to request process stop");
                    }
                }
                entry.stop_deadline = Some(deadline);
                self.set_status(
                    index,
                    ProcessStatus::Stopping,
                    StatusEvent::Transition,
                    Some(format!("grace {}ms", grace.as_millis())),
                );
            }
            ProcessStatus::Restarting => {
                self.entries[index].restart_at = None;
                self.set_status(index, ProcessStatus::Stopping, StatusEvent::Transition, None);
                self.terminate(
                    index,
                    StatusEvent::Transition,
                    Some("pending restart cancelled".to_string()),
                );
            }
            ProcessStatus::Stopping => {
                let entry = &mut self.entries[index];
                if entry.stop_deadline.is_none_or(|current| deadline < current) {
                    entry.stop_deadline = Some(deadline);
                }
            }
            _ => {}
        }
    }

    fn check_running(&mut self, index: usize, now: Instant) {
        let interval = self.policy.check_interval(self.entries[index].template.timeout());
        let entry = &mut self.entries[index];
        if now < entry.next_check {
            return;
        }
        entry.next_check = now + interval;

        let exit = match entry.handle.as_mut() {
            Some(handle) => handle.poll_exit(),
            None => Some(Exit::Failed("process handle lost".to_string())),
        };

        if let Some(exit) = exit {
            entry.handle = None;
            self.set_status(
                index,
                ProcessStatus::Failed,
                StatusEvent::Crashed,
                Some(exit.to_string()),
            );
            self.entries[index].id = None;
            self.schedule_restart(index, now);
        }
    }

    fn check_stopping(&mut self, index: usize, now: Instant) {
        let entry = &mut self.entries[index];
        let exit = match entry.handle.as_mut() {
            Some(handle) => handle.poll_exit(),
            None => Some(Exit::Failed("process handle lost".to_string())),
        };

        if let Some(exit) = exit {
            self.terminate(index, StatusEvent::Transition, Some(exit.to_string()));
            return;
        }

        if entry.stop_deadline.is_some_and(|deadline| now >= deadline) {
            if let Some(handle) = entry.handle.as_mut() {
                if let Err(e) = handle.force_kill() {
                    error!(entry = index, error = %e, "Failed to kill process after stop timeout");
                }
            }
            self.terminate(
                index,
                StatusEvent::Escalated,
                Some("no exit before the stop deadline, killed".to_string()),
            );
        }
    }

    fn terminate(&mut self, index: usize, event: StatusEvent, detail: Option<String>) {
        self.set_status(index, ProcessStatus::Terminated, event, detail);
        self.clear_runtime(index);
    }

    fn clear_runtime(&mut self, index: usize) {
        let entry = &mut self.entries[index];
        entry.handle = None;
        entry.id = None;
        entry.restart_at = None;
        entry.stop_deadline = None;
    }

    fn set_status(
        &mut self,
        index: usize,
        status: ProcessStatus,
        event: StatusEvent,
        detail: Option<String>,
    ) {
        self.entries[index].status = status;
        self.emit(index, event, detail);
    }

    /// Log a status change and publish it to subscribers.
    fn emit(&self, index: usize, event: StatusEvent, detail: Option<String>) {
        let entry = &self.entries[index];
        let report = StatusReport {
            node: self.node().to_string(),
            entry: index,
            command: entry.template.command.clone(),
            status: entry.status,
            event,
            process_id: entry.id,
            detail,
            at: Utc::now(),
        };

        let pid = report.process_id.map(|id| id.to_string());
        let detail = report.detail.as_deref().unwrap_or("");
        match event {
            StatusEvent::Transition => info!(
                node = %report.node,
                entry = index,
                command = %report.command,
                status = %report.status,
                process_id = ?pid,
                detail,
                "Process status changed"
            ),
            StatusEvent::RestartScheduled => info!(
                node = %report.node,
                entry = index,
                command = %report.command,
                detail,
                "Process restart scheduled"
            ),
            StatusEvent::LaunchFailed => error!(
                node = %report.node,
                entry = index,
                command = %report.command,
                error = %detail,
                "Process launch failed"
            ),
            StatusEvent::Crashed => error!(
                node = %report.node,
                entry = index,
                command = %report.command,
                process_id = ?pid,
                exit = %detail,
                "Process exited unexpectedly"
            ),
            StatusEvent::RetriesExhausted => error!(
                node = %report.node,
                entry = index,
                command = %report.command,
                detail,
                "Process retries exhausted, leaving failed"
            ),
            StatusEvent::Escalated => warn!(
                node = %report.node,
                entry = index,
                command = %report.command,
                process_id = ?pid,
                "Soft stop timed out, process killed"
            ),
        }

        // No subscribers is fine; reports are also in the log.
        let _ = self.events.send(report);
    }
}

/// Stop deadline `grace` after `now`, saturating to a year out.
fn deadline_after(now: Instant, grace: Duration) -> Instant {
    const FAR: Duration = Duration::from_secs(365 * 24 * 60 * 60);

    now.checked_add(grace)
        .or_else(|| now.checked_add(FAR))
        .unwrap_or(now)
}
