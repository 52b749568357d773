//! Length-prefixed framing.
//!
//! Every frame is a 4-byte big-endian payload length followed by that many
//! bytes of JSON. The payload is an [`Envelope`] carrying the protocol
//! version and one message.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::ProtocolError;
use crate::message::{Envelope, PROTOCOL_VERSION};

/// Size of the length prefix.
pub const HEADER_LEN: usize = 4;

/// Largest payload a peer may declare.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

const READ_CHUNK: usize = 8 * 1024;

/// Encode a message into a complete frame.
pub fn encode<T: Serialize>(message: &T) -> Result<Bytes, ProtocolError> {
    let payload = serde_json::to_vec(&Envelope::new(message))?;
    if payload.len() > MAX_FRAME_LEN {
        return Err(ProtocolError::FrameTooLarge {
            len: payload.len(),
            max: MAX_FRAME_LEN,
        });
    }

    let mut frame = BytesMut::with_capacity(HEADER_LEN + payload.len());
    frame.put_u32(payload.len() as u32);
    frame.extend_from_slice(&payload);
    Ok(frame.freeze())
}

/// Decode one frame payload, checking the envelope version first.
pub fn decode<T: DeserializeOwned>(payload: &[u8]) -> Result<T, ProtocolError> {
    let envelope: Envelope<serde_json::Value> = serde_json::from_slice(payload)?;
    if envelope.version == 0 || envelope.version > PROTOCOL_VERSION {
        return Err(ProtocolError::UnsupportedVersion {
            got: envelope.version,
            supported: PROTOCOL_VERSION,
        });
    }
    Ok(serde_json::from_value(envelope.message)?)
}

/// Reassembles frames from arbitrarily split input.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: BytesMut,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Bytes held that do not yet form a complete frame.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Split off the next complete payload, if one is buffered.
    pub fn next_frame(&mut self) -> Result<Option<Bytes>, ProtocolError> {
        if self.buf.len() < HEADER_LEN {
            return Ok(None);
        }

        let len = u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) as usize;
        if len > MAX_FRAME_LEN {
            return Err(ProtocolError::FrameTooLarge {
                len,
                max: MAX_FRAME_LEN,
            });
        }

        if self.buf.len() < HEADER_LEN + len {
            self.buf.reserve(HEADER_LEN + len - self.buf.len());
            return Ok(None);
        }

        self.buf.advance(HEADER_LEN);
        Ok(Some(self.buf.split_to(len).freeze()))
    }

    /// Decode the next complete message, if one is buffered.
    pub fn decode_next<T: DeserializeOwned>(&mut self) -> Result<Option<T>, ProtocolError> {
        match self.next_frame()? {
            Some(payload) => decode(&payload).map(Some),
            None => Ok(None),
        }
    }

    fn buf_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }
}

/// Reads messages off a byte stream.
///
/// `recv` is cancel safe: partially read frames stay buffered, so it can sit
/// in a `select!` next to other branches.
pub struct FrameReader<R> {
    reader: R,
    decoder: FrameDecoder,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            decoder: FrameDecoder::new(),
        }
    }

    /// Receive the next message. `None` means the peer closed cleanly
    /// between frames.
    pub async fn recv<T: DeserializeOwned>(&mut self) -> Result<Option<T>, ProtocolError> {
        loop {
            if let Some(message) = self.decoder.decode_next()? {
                return Ok(Some(message));
            }

            let buf = self.decoder.buf_mut();
            buf.reserve(READ_CHUNK);
            if self.reader.read_buf(buf).await? == 0 {
                let buffered = self.decoder.buffered();
                if buffered == 0 {
                    return Ok(None);
                }
                return Err(ProtocolError::Truncated { buffered });
            }
        }
    }

    pub fn into_inner(self) -> R {
        self.reader
    }
}

/// Encode and write one message, flushing the stream.
pub async fn write_frame<W, T>(writer: &mut W, message: &T) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let frame = encode(message)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{Command, CommandKind};
    use crate::message::ControlMessage;
    use camfleet_manifest::{Group, NodeManifest};

    fn command(kind: CommandKind) -> ControlMessage {
        ControlMessage::Command(Command::new(kind))
    }

    #[test]
    fn test_byte_by_byte_input_reassembles() {
        let frame = encode(&command(CommandKind::SoftStop)).unwrap();
        let mut decoder = FrameDecoder::new();

        for (i, byte) in frame.iter().enumerate() {
            let before: Option<ControlMessage> = decoder.decode_next().unwrap();
            assert!(before.is_none(), "frame completed early at byte {i}");
            decoder.extend(&[*byte]);
        }

        let message: ControlMessage = decoder.decode_next().unwrap().unwrap();
        assert_eq!(message, command(CommandKind::SoftStop));
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_coalesced_frames_split() {
        let mut joined = Vec::new();
        joined.extend_from_slice(&encode(&ControlMessage::Manifest(NodeManifest::new("node1", vec![]))).unwrap());
        joined.extend_from_slice(&encode(&command(CommandKind::Start)).unwrap());
        joined.extend_from_slice(
            &encode(&ControlMessage::Command(Command::for_group(CommandKind::HardStop, Group::Archive)))
                .unwrap(),
        );

        let mut decoder = FrameDecoder::new();
        decoder.extend(&joined);

        let first: ControlMessage = decoder.decode_next().unwrap().unwrap();
        let second: ControlMessage = decoder.decode_next().unwrap().unwrap();
        let third: ControlMessage = decoder.decode_next().unwrap().unwrap();

        assert_eq!(first.kind(), "manifest");
        assert_eq!(second, command(CommandKind::Start));
        assert!(matches!(third, ControlMessage::Command(c) if c.group == Some(Group::Archive)));
        assert!(decoder.decode_next::<ControlMessage>().unwrap().is_none());
    }

    #[test]
    fn test_oversized_length_rejected() {
        let mut decoder = FrameDecoder::new();
        decoder.extend(&((MAX_FRAME_LEN as u32) + 1).to_be_bytes());

        let err = decoder.next_frame().unwrap_err();
        assert!(matches!(err, ProtocolError::FrameTooLarge { .. }));
    }

    #[test]
    fn test_unsupported_version_rejected() {
        for version in [0, PROTOCOL_VERSION + 1] {
            let payload = format!(r#"{{"version":{version},"message":{{"type":"command","kind":"START"}}}}"#);
            let err = decode::<ControlMessage>(payload.as_bytes()).unwrap_err();
            assert!(matches!(err, ProtocolError::UnsupportedVersion { got, .. } if got == version));
        }
    }

    #[test]
    fn test_unknown_message_type_is_malformed() {
        let payload = br#"{"version":1,"message":{"type":"reboot"}}"#;
        let err = decode::<ControlMessage>(payload).unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed(_)));
    }

    #[tokio::test]
    async fn test_reader_over_split_stream() {
        let (mut client, server) = tokio::io::duplex(7);
        let mut reader = FrameReader::new(server);

        let writer = tokio::spawn(async move {
            write_frame(&mut client, &command(CommandKind::Start)).await.unwrap();
            write_frame(&mut client, &command(CommandKind::FinishProcessing)).await.unwrap();
        });

        let first: ControlMessage = reader.recv().await.unwrap().unwrap();
        let second: ControlMessage = reader.recv().await.unwrap().unwrap();
        writer.await.unwrap();

        assert_eq!(first, command(CommandKind::Start));
        assert_eq!(second, command(CommandKind::FinishProcessing));
        assert!(reader.recv::<ControlMessage>().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_reader_reports_truncated_frame() {
        let (mut client, server) = tokio::io::duplex(64);
        let mut reader = FrameReader::new(server);

        let frame = encode(&command(CommandKind::Start)).unwrap();
        client.write_all(&frame[..frame.len() - 2]).await.unwrap();
        drop(client);

        let err = reader.recv::<ControlMessage>().await.unwrap_err();
        assert!(matches!(err, ProtocolError::Truncated { .. }));
    }
}
