//! Supervisor actor and its handle.
//!
//! One task owns the [`ProcessSupervisor`] and serializes everything that
//! touches it: mailbox messages from the control connection and the periodic
//! tick that runs health checks, stop deadlines and restarts.

use std::sync::Arc;

use camfleet_manifest::NodeManifest;
use camfleet_proto::{CommandKind, StatusReport};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};

use super::policy::SupervisorPolicy;
use super::state::{EntrySnapshot, ManifestOutcome, ProcessSupervisor};
use crate::error::SupervisorError;
use crate::launcher::Launcher;

const MAILBOX_SIZE: usize = 64;
const EVENT_BUFFER: usize = 1024;

/// Messages handled by the supervisor actor.
#[derive(Debug)]
pub enum SupervisorMessage {
    /// Install a manifest.
    LoadManifest {
        manifest: NodeManifest,
        reply: oneshot::Sender<Result<ManifestOutcome, SupervisorError>>,
    },

    /// Apply a lifecycle command. The reply fires once it has been applied.
    Apply {
        kind: CommandKind,
        reply: oneshot::Sender<()>,
    },

    /// Report the state of every entry.
    Snapshot {
        reply: oneshot::Sender<Vec<EntrySnapshot>>,
    },
}

/// Handle for talking to the supervisor actor.
#[derive(Clone)]
pub struct SupervisorHandle {
    tx: mpsc::Sender<SupervisorMessage>,
    events: broadcast::Sender<StatusReport>,
}

impl SupervisorHandle {
    pub async fn load_manifest(
        &self,
        manifest: NodeManifest,
    ) -> Result<ManifestOutcome, SupervisorError> {
        let (reply, rx) = oneshot::channel();
        self.send(SupervisorMessage::LoadManifest { manifest, reply })
            .await?;
        rx.await.map_err(|_| SupervisorError::Stopped)?
    }

    pub async fn apply(&self, kind: CommandKind) -> Result<(), SupervisorError> {
        let (reply, rx) = oneshot::channel();
        self.send(SupervisorMessage::Apply { kind, reply }).await?;
        rx.await.map_err(|_| SupervisorError::Stopped)
    }

    pub async fn snapshot(&self) -> Result<Vec<EntrySnapshot>, SupervisorError> {
        let (reply, rx) = oneshot::channel();
        self.send(SupervisorMessage::Snapshot { reply }).await?;
        rx.await.map_err(|_| SupervisorError::Stopped)
    }

    /// Receive every status report published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<StatusReport> {
        self.events.subscribe()
    }

    async fn send(&self, msg: SupervisorMessage) -> Result<(), SupervisorError> {
        self.tx.send(msg).await.map_err(|_| SupervisorError::Stopped)
    }
}

/// Spawn the supervisor actor.
///
/// The actor runs until `shutdown` flips to true or every handle is dropped.
/// On exit it hard-stops whatever is still running.
pub fn spawn_supervisor<L: Launcher>(
    launcher: Arc<L>,
    policy: SupervisorPolicy,
    shutdown: watch::Receiver<bool>,
) -> (SupervisorHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(MAILBOX_SIZE);
    let (events, _) = broadcast::channel(EVENT_BUFFER);

    let supervisor = ProcessSupervisor::new(launcher, policy, events.clone());
    let task = tokio::spawn(run_supervisor_loop(supervisor, rx, shutdown, policy));

    (SupervisorHandle { tx, events }, task)
}

async fn run_supervisor_loop<L: Launcher>(
    mut supervisor: ProcessSupervisor<L>,
    mut rx: mpsc::Receiver<SupervisorMessage>,
    mut shutdown: watch::Receiver<bool>,
    policy: SupervisorPolicy,
) {
    let mut ticker = tokio::time::interval(policy.tick_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    debug!(tick_ms = policy.tick_interval.as_millis(), "Process supervisor started");

    loop {
        tokio::select! {
            biased;

            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!("Process supervisor received shutdown signal");
                    break;
                }
            }

            msg = rx.recv() => {
                match msg {
                    Some(msg) => handle_message(&mut supervisor, msg),
                    None => {
                        debug!("Process supervisor mailbox closed");
                        break;
                    }
                }
            }

            _ = ticker.tick() => {
                supervisor.tick(Instant::now());
            }
        }
    }

    supervisor.hard_stop();
    info!(node = %supervisor.node(), "Process supervisor stopped");
}

fn handle_message<L: Launcher>(supervisor: &mut ProcessSupervisor<L>, msg: SupervisorMessage) {
    match msg {
        SupervisorMessage::LoadManifest { manifest, reply } => {
            let _ = reply.send(supervisor.load_manifest(manifest, Instant::now()));
        }
        SupervisorMessage::Apply { kind, reply } => {
            supervisor.apply(kind, Instant::now());
            let _ = reply.send(());
        }
        SupervisorMessage::Snapshot { reply } => {
            let _ = reply.send(supervisor.snapshot());
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::launcher::MockLauncher;
    use camfleet_manifest::{Group, ProcessManifestEntry, ProcessMode, ProcessStatus};
    use camfleet_proto::StatusEvent;

    fn manifest() -> NodeManifest {
        NodeManifest::new(
            "node1",
            vec![ProcessManifestEntry {
                mode: ProcessMode::ExternalSubprocess,
                command: "ingest".to_string(),
                timeout_secs: 0.2,
                args: vec![],
                kwargs: Default::default(),
                flags: Default::default(),
                group: Group::Ingest,
                description: String::new(),
            }],
        )
    }

    fn fast_policy() -> SupervisorPolicy {
        SupervisorPolicy {
            tick_interval: Duration::from_millis(5),
            health_interval: Duration::from_millis(10),
            ..SupervisorPolicy::default()
        }
    }

    #[tokio::test]
    async fn test_handle_round_trip() {
        let launcher = Arc::new(MockLauncher::new());
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let (handle, _task) = spawn_supervisor(Arc::clone(&launcher), fast_policy(), shutdown_rx);

        let outcome = handle.load_manifest(manifest()).await.unwrap();
        assert_eq!(outcome, ManifestOutcome::Loaded);

        handle.apply(CommandKind::Start).await.unwrap();
        let snapshot = handle.snapshot().await.unwrap();
        assert_eq!(snapshot[0].status, ProcessStatus::Running);
        assert_eq!(launcher.launch_count("ingest"), 1);
    }

    #[tokio::test]
    async fn test_ticks_drive_soft_stop_to_termination() {
        let launcher = Arc::new(MockLauncher::new());
        launcher.ignore_stop("ingest");
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let (handle, _task) = spawn_supervisor(Arc::clone(&launcher), fast_policy(), shutdown_rx);
        let mut reports = handle.subscribe();

        handle.load_manifest(manifest()).await.unwrap();
        handle.apply(CommandKind::Start).await.unwrap();
        handle.apply(CommandKind::SoftStop).await.unwrap();

        let escalated = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let report = reports.recv().await.unwrap();
                if report.event == StatusEvent::Escalated {
                    return report;
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(escalated.status, ProcessStatus::Terminated);
        assert!(launcher.last("ingest").unwrap().was_killed());
    }

    #[tokio::test]
    async fn test_shutdown_hard_stops_processes() {
        let launcher = Arc::new(MockLauncher::new());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (handle, task) = spawn_supervisor(Arc::clone(&launcher), fast_policy(), shutdown_rx);

        handle.load_manifest(manifest()).await.unwrap();
        handle.apply(CommandKind::Start).await.unwrap();

        shutdown_tx.send(true).unwrap();
        task.await.unwrap();

        assert!(launcher.last("ingest").unwrap().was_killed());
        assert!(matches!(
            handle.snapshot().await,
            Err(SupervisorError::Stopped)
        ));
    }
}
