//! Control connection listener.
//!
//! The agent accepts at most one control connection at a time. A second
//! connection receives a `rejected` frame and is closed; the first keeps
//! working. When the active connection goes away the managed processes keep
//! running and the next connection is accepted.
//!
//! ## Connection Flow
//!
//! ```text
//! accept -> manifest (within deadline) -> { command | status } ... -> close
//! ```

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use camfleet_manifest::NodeManifest;
use camfleet_proto::{write_frame, AgentMessage, ControlMessage, FrameReader, ProtocolError};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use crate::error::SupervisorError;
use crate::supervisor::SupervisorHandle;

/// Accepts control connections and feeds them to the supervisor.
pub struct AgentServer {
    listener: TcpListener,
    supervisor: SupervisorHandle,
    manifest_timeout: Duration,
    busy: Arc<AtomicBool>,
}

impl AgentServer {
    pub async fn bind(
        addr: SocketAddr,
        supervisor: SupervisorHandle,
        manifest_timeout: Duration,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind control listener on {addr}"))?;

        Ok(Self {
            listener,
            supervisor,
            manifest_timeout,
            busy: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until shutdown.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(addr = ?self.listener.local_addr().ok(), "Control listener started");

        loop {
            tokio::select! {
                biased;

                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Control listener received shutdown signal");
                        break;
                    }
                }

                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => self.dispatch(stream, peer),
                        Err(e) => warn!(error = %e, "Failed to accept control connection"),
                    }
                }
            }
        }
    }

    fn dispatch(&self, stream: TcpStream, peer: SocketAddr) {
        let Some(guard) = ConnectionGuard::acquire(&self.busy) else {
            tokio::spawn(reject(stream, peer));
            return;
        };

        info!(peer = %peer, "Control connection accepted");

        let supervisor = self.supervisor.clone();
        let manifest_timeout = self.manifest_timeout;
        tokio::spawn(async move {
            let _guard = guard;
            match serve_connection(stream, supervisor, manifest_timeout).await {
                Ok(()) => info!(peer = %peer, "Control connection closed"),
                Err(e) => warn!(
                    peer = %peer,
                    error = %format!("{e:#}"),
                    "Control connection closed with error"
                ),
            }
        });
    }
}

/// Marks the single connection slot as taken until dropped.
struct ConnectionGuard(Arc<AtomicBool>);

impl ConnectionGuard {
    fn acquire(busy: &Arc<AtomicBool>) -> Option<Self> {
        busy.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(Arc::clone(busy)))
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

async fn reject(mut stream: TcpStream, peer: SocketAddr) {
    warn!(peer = %peer, "Rejecting control connection, another one is active");

    let message = AgentMessage::Rejected {
        reason: "agent already has an active control connection".to_string(),
    };
    if let Err(e) = write_frame(&mut stream, &message).await {
        debug!(peer = %peer, error = %e, "Failed to send rejection");
    }
    let _ = stream.shutdown().await;
}

async fn serve_connection(
    stream: TcpStream,
    supervisor: SupervisorHandle,
    manifest_timeout: Duration,
) -> Result<()> {
    let (read_half, mut writer) = stream.into_split();
    let mut reader = FrameReader::new(read_half);

    // Subscribe before loading so the initial pending reports go upstream too.
    let mut reports = supervisor.subscribe();

    let first = tokio::time::timeout(manifest_timeout, reader.recv::<ControlMessage>())
        .await
        .map_err(|_| anyhow!("no manifest within {}ms", manifest_timeout.as_millis()))??;

    match first {
        Some(ControlMessage::Manifest(manifest)) => {
            if !install(&supervisor, &mut writer, manifest).await? {
                return Ok(());
            }
        }
        Some(other) => {
            return Err(ProtocolError::Unexpected(format!(
                "expected manifest as first message, got {}",
                other.kind()
            ))
            .into());
        }
        None => {
            debug!("Connection closed before a manifest arrived");
            return Ok(());
        }
    }

    loop {
        tokio::select! {
            msg = reader.recv::<ControlMessage>() => {
                match msg? {
                    Some(ControlMessage::Command(command)) => {
                        info!(command = %command, "Command received");
                        supervisor.apply(command.kind).await?;
                    }
                    Some(ControlMessage::Manifest(manifest)) => {
                        if !install(&supervisor, &mut writer, manifest).await? {
                            return Ok(());
                        }
                    }
                    None => return Ok(()),
                }
            }

            report = reports.recv() => {
                match report {
                    Ok(report) => write_frame(&mut writer, &AgentMessage::Status(report)).await?,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Status reports dropped, connection too slow");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err(SupervisorError::Stopped.into());
                    }
                }
            }
        }
    }
}

/// Hand a manifest to the supervisor. Returns false when it was refused and
/// the connection should close.
async fn install(
    supervisor: &SupervisorHandle,
    writer: &mut OwnedWriteHalf,
    manifest: NodeManifest,
) -> Result<bool> {
    let node = manifest.node.clone();
    let entries = manifest.len();

    match supervisor.load_manifest(manifest).await {
        Ok(outcome) => {
            info!(node = %node, entries, outcome = ?outcome, "Manifest received");
            Ok(true)
        }
        Err(SupervisorError::ManifestRefused { active }) => {
            warn!(node = %node, active, "Refusing manifest, current one still has active processes");
            let message = AgentMessage::Rejected {
                reason: SupervisorError::ManifestRefused { active }.to_string(),
            };
            write_frame(writer, &message).await?;
            let _ = writer.shutdown().await;
            Ok(false)
        }
        Err(e) => Err(e.into()),
    }
}
