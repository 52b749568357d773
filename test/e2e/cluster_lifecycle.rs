//! End-to-end cluster lifecycle tests.
//!
//! Real node agents (host launcher, real subprocesses) listen on localhost
//! ports; a control plane built from an on-disk run config and template
//! directory drives them through the full command vocabulary.
//!
//! ## Running
//!
//! ```bash
//! cargo test -p camfleet-e2e --test cluster_lifecycle
//! ```

use std::fs;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use camfleet_control_plane::{ConnectionError, ControlPlane, LinkSettings};
use camfleet_manifest::{
    load_templates, Group, ManifestGenerator, ManifestSet, NodeManifest, ProcessStatus, RunConfig,
    ServerEntry, ServerRegistry,
};
use camfleet_node_agent::{
    spawn_supervisor, AgentServer, HostLauncher, Launcher, MockLauncher, SupervisorHandle,
    SupervisorPolicy,
};
use camfleet_proto::{Command, CommandKind, StatusEvent, StatusReport};
use tempfile::TempDir;
use tokio::sync::{broadcast, watch};
use tokio::time::Instant;

const WAIT: Duration = Duration::from_secs(10);

/// Subprocess that ignores SIGTERM; only a forced kill ends it.
const STUBBORN_TEMPLATE: &str = r#"[{
    "mode": "subprocess",
    "command": "sh",
    "timeout": 2,
    "args": ["-c", "trap '' TERM; exec sleep 30", "$camera_count"],
    "group": "ingest",
    "description": "ingest stand-in that ignores SIGTERM"
}]"#;

const FUNCTION_TEMPLATE: &str = r#"[{
    "mode": "process",
    "command": "idle",
    "timeout": 1,
    "group": "tracking",
    "description": "in-process tracker stand-in"
}]"#;

struct Agent {
    addr: SocketAddr,
    supervisor: SupervisorHandle,
    reports: broadcast::Receiver<StatusReport>,
    _shutdown: watch::Sender<bool>,
}

impl Agent {
    async fn start() -> Self {
        Self::with_launcher(Arc::new(HostLauncher::default())).await
    }

    async fn with_launcher<L: Launcher>(launcher: Arc<L>) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let policy = SupervisorPolicy {
            tick_interval: Duration::from_millis(20),
            health_interval: Duration::from_millis(50),
            ..SupervisorPolicy::default()
        };

        let (supervisor, _task) = spawn_supervisor(launcher, policy, shutdown_rx.clone());
        let reports = supervisor.subscribe();

        let server = AgentServer::bind(
            "127.0.0.1:0".parse().unwrap(),
            supervisor.clone(),
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        let addr = server.local_addr().unwrap();
        tokio::spawn(server.run(shutdown_rx));

        Self {
            addr,
            supervisor,
            reports,
            _shutdown: shutdown_tx,
        }
    }

    async fn wait_for(&mut self, pred: impl Fn(&StatusReport) -> bool) -> StatusReport {
        tokio::time::timeout(WAIT, async {
            loop {
                match self.reports.recv().await {
                    Ok(report) if pred(&report) => return report,
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => panic!("supervisor stopped"),
                }
            }
        })
        .await
        .expect("status report never arrived")
    }

    async fn status(&self, entry: usize) -> ProcessStatus {
        self.supervisor.snapshot().await.unwrap()[entry].status
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,camfleet_node_agent=debug".into()),
        )
        .with_test_writer()
        .try_init();
}

/// Write a run config and template directory for the given servers and
/// build the control plane from them.
fn control_plane(
    dir: &TempDir,
    servers: &[(&str, SocketAddr, &str)],
) -> (ControlPlane, ManifestSet) {
    let mut ini = String::from("[PARAMETERS]\ncamera_count = 4\n\n[SERVERS]\n");
    for (node, addr, _) in servers {
        ini.push_str(&format!("{node} = {addr}\n"));
    }
    ini.push_str("\n[GROUPS]\n");
    for (node, _, group) in servers {
        ini.push_str(&format!("{node} = {group}\n"));
    }

    let config_path = dir.path().join("run_config.ini");
    fs::write(&config_path, ini).unwrap();

    let template_dir = dir.path().join("templates");
    fs::create_dir(&template_dir).unwrap();
    fs::write(template_dir.join("node1:ingest.json"), STUBBORN_TEMPLATE).unwrap();
    fs::write(template_dir.join("node2.json"), FUNCTION_TEMPLATE).unwrap();

    let run = RunConfig::load(&config_path).unwrap();
    let templates = load_templates(&template_dir).unwrap();
    let manifests = ManifestGenerator::new(&run.parameters)
        .generate(&templates, &run.servers)
        .unwrap();

    let settings = LinkSettings {
        connect_timeout: Duration::from_secs(1),
        dispatch_timeout: Duration::from_secs(2),
    };
    let control = ControlPlane::new(run.servers, manifests.clone(), settings);
    (control, manifests)
}

#[tokio::test]
async fn test_cluster_lifecycle() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let mut node1 = Agent::start().await;
    let mut node2 = Agent::start().await;

    let (control, manifests) = control_plane(
        &dir,
        &[("node1", node1.addr, "ingest"), ("node2", node2.addr, "tracking")],
    );

    // `$camera_count` resolved against CAMERA_COUNT = 4.
    let ingest = &manifests["node1"].entries[0];
    assert_eq!(ingest.args.last().map(String::as_str), Some("4"));
    assert!(ingest.unresolved_tokens().is_empty());

    let report = control.initialize().await;
    assert_eq!(report.delivered, ["node1", "node2"]);

    // START reaches both nodes.
    let report = control.dispatch(Command::new(CommandKind::Start)).await;
    assert!(report.is_complete());
    let running = node1
        .wait_for(|r| r.status == ProcessStatus::Running)
        .await;
    assert!(running.process_id.is_some());
    node2
        .wait_for(|r| r.status == ProcessStatus::Running)
        .await;

    // Repeating START keeps the same process.
    control.dispatch(Command::new(CommandKind::Start)).await;
    let snapshot = node1.supervisor.snapshot().await.unwrap();
    assert_eq!(snapshot[0].process_id, running.process_id);

    // SOFT STOP for the ingest group: SIGTERM is ignored, so the agent
    // escalates once the 2 s grace period runs out.
    let issued = Instant::now();
    let report = control
        .dispatch(Command::for_group(CommandKind::SoftStop, Group::Ingest))
        .await;
    assert_eq!(report.delivered, ["node1"]);

    node1
        .wait_for(|r| r.status == ProcessStatus::Stopping)
        .await;
    let escalated = node1
        .wait_for(|r| r.status == ProcessStatus::Terminated)
        .await;
    let elapsed = issued.elapsed();
    assert_eq!(escalated.event, StatusEvent::Escalated);
    assert!(elapsed >= Duration::from_millis(1900), "escalated after {elapsed:?}");
    assert!(elapsed < Duration::from_secs(5), "escalated after {elapsed:?}");

    // The tracking node was not addressed.
    assert_eq!(node2.status(0).await, ProcessStatus::Running);

    // HARD STOP ends everything; repeating it changes nothing.
    control.dispatch(Command::new(CommandKind::HardStop)).await;
    node2
        .wait_for(|r| r.status == ProcessStatus::Terminated)
        .await;
    control.dispatch(Command::new(CommandKind::HardStop)).await;
    assert_eq!(node1.status(0).await, ProcessStatus::Terminated);
    assert_eq!(node2.status(0).await, ProcessStatus::Terminated);
}

#[tokio::test]
async fn test_partial_failure_isolation() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let mut node1 = Agent::start().await;
    let mut node2 = Agent::start().await;

    // node3 points at a port nobody listens on.
    let dead = {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    };

    let (control, _) = control_plane(
        &dir,
        &[
            ("node1", node1.addr, "ingest"),
            ("node2", node2.addr, "tracking"),
            ("node3", dead, "archive"),
        ],
    );

    let report = control.initialize().await;
    assert_eq!(report.delivered, ["node1", "node2"]);
    assert!(matches!(
        report.error_for("node3"),
        Some(ConnectionError::Unreachable { .. })
    ));

    let report = control.dispatch(Command::new(CommandKind::Start)).await;
    assert_eq!(report.delivered, ["node1", "node2"]);
    assert_eq!(report.failed.len(), 1);

    node1
        .wait_for(|r| r.status == ProcessStatus::Running)
        .await;
    node2
        .wait_for(|r| r.status == ProcessStatus::Running)
        .await;

    control.dispatch(Command::new(CommandKind::HardStop)).await;
    node1
        .wait_for(|r| r.status == ProcessStatus::Terminated)
        .await;
    node2
        .wait_for(|r| r.status == ProcessStatus::Terminated)
        .await;
}

#[tokio::test]
async fn test_concurrent_dispatch_shares_one_connection() {
    init_tracing();

    for _ in 0..20 {
        let agent = Agent::with_launcher(Arc::new(MockLauncher::new())).await;

        let mut registry = ServerRegistry::new();
        let entry = ServerEntry::parse("node1", &agent.addr.to_string(), None).unwrap();
        registry.insert("node1", entry);
        let mut manifests = ManifestSet::new();
        manifests.insert("node1".to_string(), NodeManifest::new("node1", Vec::new()));
        let settings = LinkSettings {
            connect_timeout: Duration::from_secs(1),
            dispatch_timeout: Duration::from_secs(2),
        };
        let control = ControlPlane::new(registry, manifests, settings);

        // No initialize: both dispatches find node1 without a link.
        let (first, second) = tokio::join!(
            control.dispatch(Command::new(CommandKind::Start)),
            control.dispatch(Command::new(CommandKind::Start)),
        );
        assert!(first.is_complete(), "first dispatch failed: {:?}", first.failed);
        assert!(second.is_complete(), "second dispatch failed: {:?}", second.failed);

        // The agent still talks to this control plane afterwards.
        for _ in 0..3 {
            let report = control.dispatch(Command::new(CommandKind::Start)).await;
            assert!(report.is_complete(), "follow-up dispatch failed: {:?}", report.failed);
        }
        assert!(control.is_connected("node1").await);
    }
}
