//! Length framing for the control/data stream
//!
//! Each message travels as `[length: u32 LE][tag + payload]`. The explicit
//! length keeps the stream self-delimiting regardless of payload content,
//! so the codec always decodes exactly one complete message.

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::codec::{self, Message};
use crate::constants::MAX_MESSAGE_SIZE;
use crate::error::{Error, NetworkError};

/// Encode a message together with its length prefix, ready to write
pub fn frame_message(message: &Message) -> Bytes {
    let body = codec::encode(message);
    let mut framed = BytesMut::with_capacity(4 + body.len());
    framed.put_u32_le(body.len() as u32);
    framed.extend_from_slice(&body);
    framed.freeze()
}

/// Write one framed message
pub async fn write_message<W>(writer: &mut W, message: &Message) -> Result<(), Error>
where
    W: AsyncWrite + Unpin,
{
    write_frame(writer, &frame_message(message)).await
}

/// Write pre-framed bytes (used for fanout, where one encode serves many
/// clients)
pub async fn write_frame<W>(writer: &mut W, framed: &[u8]) -> Result<(), Error>
where
    W: AsyncWrite + Unpin,
{
    writer
        .write_all(framed)
        .await
        .map_err(|e| NetworkError::SendFailed(e.to_string()))?;
    Ok(())
}

/// Read one framed message. Returns [`NetworkError::Closed`] on a clean EOF
/// at a frame boundary.
pub async fn read_message<R>(reader: &mut R) -> Result<Message, Error>
where
    R: AsyncRead + Unpin,
{
    let mut len_bytes = [0u8; 4];
    match reader.read_exact(&mut len_bytes).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(NetworkError::Closed.into());
        }
        Err(e) => return Err(NetworkError::ReceiveFailed(e.to_string()).into()),
    }

    // A bogus length desyncs the stream; unlike a decode failure on a
    // fully consumed body, this is not recoverable on the same connection.
    let len = u32::from_le_bytes(len_bytes) as usize;
    if len == 0 || len > MAX_MESSAGE_SIZE {
        return Err(NetworkError::ReceiveFailed(format!("bad frame length {}", len)).into());
    }

    let mut body = vec![0u8; len];
    reader
        .read_exact(&mut body)
        .await
        .map_err(|e| NetworkError::ReceiveFailed(e.to_string()))?;

    Ok(codec::decode(&body)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Direction;

    #[tokio::test]
    async fn test_frame_roundtrip() {
        let (mut client, mut server) = tokio::io::duplex(64 * 1024);

        let message = Message::AudioBuffer {
            direction: Direction::Input,
            channels: 2,
            frames: 4,
            samples: vec![0.0, 0.1, 0.2, 0.3, 0.4, 0.5, 0.6, 0.7],
        };
        write_message(&mut client, &message).await.unwrap();

        let received = read_message(&mut server).await.unwrap();
        assert_eq!(received, message);
    }

    #[tokio::test]
    async fn test_back_to_back_frames() {
        let (mut client, mut server) = tokio::io::duplex(4096);

        let first = Message::ReinitIoCount {
            inputs: 8,
            outputs: 4,
        };
        let second = Message::TrafficSelection(Default::default());
        write_message(&mut client, &first).await.unwrap();
        write_message(&mut client, &second).await.unwrap();

        assert_eq!(read_message(&mut server).await.unwrap(), first);
        assert_eq!(read_message(&mut server).await.unwrap(), second);
    }

    #[tokio::test]
    async fn test_eof_reports_closed() {
        let (client, mut server) = tokio::io::duplex(64);
        drop(client);
        assert!(matches!(
            read_message(&mut server).await,
            Err(Error::Network(NetworkError::Closed))
        ));
    }

    #[tokio::test]
    async fn test_oversized_length_rejected() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client
            .write_all(&(u32::MAX).to_le_bytes())
            .await
            .unwrap();
        assert!(matches!(
            read_message(&mut server).await,
            Err(Error::Network(NetworkError::ReceiveFailed(_)))
        ));
    }
}
