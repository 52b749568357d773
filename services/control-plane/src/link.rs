//! One control connection to a node agent.
//!
//! A link owns the write half of the TCP stream behind a mutex so frames to
//! one node go out in order. The read half belongs to a background task that
//! logs the agent's status reports and takes the link out of the connection
//! map once the agent rejects or drops it.
//!
//! A write that fails or is abandoned part way (its future dropped by a
//! deadline) closes the link and drops the write half, so the agent sees the
//! connection end instead of a torn frame.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use camfleet_manifest::NodeManifest;
use camfleet_proto::{write_frame, AgentMessage, ControlMessage, FrameReader, StatusReport};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, MutexGuard, RwLock};
use tracing::{debug, info, warn};

use crate::error::ConnectionError;

/// Live links keyed by node name.
pub(crate) type LinkMap = Arc<RwLock<HashMap<String, Arc<NodeLink>>>>;

pub struct NodeLink {
    node: String,
    writer: Mutex<Option<OwnedWriteHalf>>,
    open: AtomicBool,
}

impl NodeLink {
    /// Connect to an agent and deliver its manifest.
    ///
    /// The returned link is not yet in the map; the caller inserts it.
    pub(crate) async fn open(
        node: &str,
        address: &str,
        manifest: &NodeManifest,
        links: LinkMap,
    ) -> Result<Arc<Self>, ConnectionError> {
        let stream = TcpStream::connect(address)
            .await
            .map_err(|source| ConnectionError::Unreachable {
                address: address.to_string(),
                source,
            })?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!(node = %node, error = %e, "Failed to set TCP_NODELAY");
        }

        let (read_half, write_half) = stream.into_split();
        let link = Arc::new(Self::new(node, write_half));

        link.send(&ControlMessage::Manifest(manifest.clone())).await?;

        tokio::spawn(read_reports(
            Arc::clone(&link),
            FrameReader::new(read_half),
            links,
        ));

        Ok(link)
    }

    fn new(node: &str, writer: OwnedWriteHalf) -> Self {
        Self {
            node: node.to_string(),
            writer: Mutex::new(Some(writer)),
            open: AtomicBool::new(true),
        }
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    /// Returns false once the agent closed or rejected the connection.
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Write one message. A write that fails or never finishes closes the
    /// link.
    pub async fn send(&self, message: &ControlMessage) -> Result<(), ConnectionError> {
        let closed = || ConnectionError::Dropped("link already closed".to_string());
        if !self.is_open() {
            return Err(closed());
        }

        let mut write = InFlightWrite {
            open: &self.open,
            writer: self.writer.lock().await,
            finished: false,
        };
        let stream = write.writer.as_mut().ok_or_else(closed)?;
        write_frame(stream, message).await?;
        write.finished = true;

        debug!(node = %self.node, message = message.kind(), "Frame sent");
        Ok(())
    }

    fn close(&self) {
        self.open.store(false, Ordering::Release);
    }
}

/// Holds the writer for one frame. Dropped before `finished` is set, it
/// closes the link and releases the write half.
struct InFlightWrite<'a> {
    open: &'a AtomicBool,
    writer: MutexGuard<'a, Option<OwnedWriteHalf>>,
    finished: bool,
}

impl Drop for InFlightWrite<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.open.store(false, Ordering::Release);
            self.writer.take();
        }
    }
}

/// Log what the agent sends until the connection ends.
async fn read_reports(
    link: Arc<NodeLink>,
    mut reader: FrameReader<OwnedReadHalf>,
    links: LinkMap,
) {
    let node = link.node().to_string();

    loop {
        match reader.recv::<AgentMessage>().await {
            Ok(Some(AgentMessage::Status(report))) => log_report(&report),
            Ok(Some(AgentMessage::Rejected { reason })) => {
                let err = ConnectionError::Rejected(reason);
                warn!(node = %node, error = %err, "Agent refused the control connection");
                break;
            }
            Ok(None) => {
                warn!(node = %node, "Agent closed the control connection");
                break;
            }
            Err(e) => {
                let err = ConnectionError::from(e);
                warn!(node = %node, error = %err, "Control connection failed");
                break;
            }
        }
    }

    link.close();

    // A reconnect may already have replaced this link.
    let mut links = links.write().await;
    if links
        .get(&node)
        .is_some_and(|current| Arc::ptr_eq(current, &link))
    {
        links.remove(&node);
    }
}

fn log_report(report: &StatusReport) {
    let process_id = report
        .process_id
        .as_ref()
        .map(ToString::to_string)
        .unwrap_or_default();
    let detail = report.detail.as_deref().unwrap_or("");

    if report.event.is_error() {
        warn!(
            node = %report.node,
            entry = report.entry,
            command = %report.command,
            status = %report.status,
            event = ?report.event,
            process_id = %process_id,
            detail = %detail,
            "Process problem reported"
        );
    } else {
        info!(
            node = %report.node,
            entry = report.entry,
            command = %report.command,
            status = %report.status,
            event = ?report.event,
            process_id = %process_id,
            detail = %detail,
            "Process status"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use camfleet_manifest::{Group, ProcessManifestEntry, ProcessMode};
    use camfleet_proto::{Command, CommandKind};
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpSocket;

    /// A connected pair with small buffers; the peer side is returned unread.
    async fn tight_pair() -> (OwnedWriteHalf, TcpStream) {
        let listener = TcpSocket::new_v4().unwrap();
        listener.set_recv_buffer_size(4096).unwrap();
        listener.bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let listener = listener.listen(1).unwrap();
        let addr = listener.local_addr().unwrap();

        let client = TcpSocket::new_v4().unwrap();
        client.set_send_buffer_size(4096).unwrap();
        let (client, accepted) = tokio::join!(client.connect(addr), listener.accept());

        let (_, write_half) = client.unwrap().into_split();
        (write_half, accepted.unwrap().0)
    }

    fn bulky_manifest(bytes: usize) -> ControlMessage {
        let entry = ProcessManifestEntry {
            mode: ProcessMode::InProcessFunction,
            command: "idle".to_string(),
            timeout_secs: 1.0,
            args: Vec::new(),
            kwargs: Default::default(),
            flags: Default::default(),
            group: Group::Ingest,
            description: "x".repeat(bytes),
        };
        ControlMessage::Manifest(NodeManifest::new("node1", vec![entry]))
    }

    #[tokio::test]
    async fn test_abandoned_write_closes_link() {
        let (write_half, mut peer) = tight_pair().await;
        let link = NodeLink::new("node1", write_half);

        let stalled = tokio::time::timeout(
            Duration::from_millis(200),
            link.send(&bulky_manifest(4 << 20)),
        )
        .await;
        assert!(stalled.is_err(), "write should not fit the socket buffers");
        assert!(!link.is_open());

        let command = ControlMessage::Command(Command::new(CommandKind::Start));
        assert!(matches!(
            link.send(&command).await,
            Err(ConnectionError::Dropped(_))
        ));

        // The peer sees the torn frame followed by end of stream.
        let mut received = Vec::new();
        tokio::time::timeout(Duration::from_secs(5), peer.read_to_end(&mut received))
            .await
            .unwrap()
            .unwrap();
        assert!(received.len() < 4 << 20);
    }

    #[tokio::test]
    async fn test_completed_write_keeps_link_open() {
        let (write_half, peer) = tight_pair().await;
        let link = NodeLink::new("node1", write_half);

        let command = ControlMessage::Command(Command::new(CommandKind::Start));
        link.send(&command).await.unwrap();
        link.send(&command).await.unwrap();
        assert!(link.is_open());

        let mut reader = FrameReader::new(peer);
        for _ in 0..2 {
            let frame = reader.recv::<ControlMessage>().await.unwrap();
            assert_eq!(frame, Some(command.clone()));
        }
    }
}
