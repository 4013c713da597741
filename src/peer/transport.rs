use std::net::SocketAddr;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;

use super::error::PeerError;
use super::message::{Handshake, Message};
use crate::constants::{HANDSHAKE_LEN, MAX_FRAME_LEN, READ_TIMEOUT, WRITE_TIMEOUT};

/// Framed access to a peer socket during the handshake.
///
/// Once both handshakes are through, [`into_split`](Self::into_split) hands
/// the two directions to separate tasks. Bytes the peer sent right after its
/// handshake stay buffered in the reader.
pub struct PeerTransport {
    stream: TcpStream,
    read_buf: BytesMut,
}

/// Receiving half of an established connection.
pub struct MessageReader {
    half: OwnedReadHalf,
    read_buf: BytesMut,
}

/// Sending half of an established connection.
pub struct MessageWriter {
    half: OwnedWriteHalf,
}

impl PeerTransport {
    pub fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            read_buf: BytesMut::with_capacity(32 * 1024),
        }
    }

    pub async fn send_handshake(&mut self, handshake: &Handshake) -> Result<(), PeerError> {
        write_all(&mut self.stream, &handshake.encode()).await
    }

    pub async fn receive_handshake(&mut self) -> Result<Handshake, PeerError> {
        fill(&mut self.stream, &mut self.read_buf, HANDSHAKE_LEN).await?;
        let data = self.read_buf.split_to(HANDSHAKE_LEN);
        Handshake::decode(&data)
    }

    pub async fn send_message(&mut self, message: &Message) -> Result<(), PeerError> {
        write_all(&mut self.stream, &message.encode()).await
    }

    pub async fn receive_message(&mut self) -> Result<Message, PeerError> {
        read_message(&mut self.stream, &mut self.read_buf).await
    }

    pub fn peer_addr(&self) -> std::io::Result<SocketAddr> {
        self.stream.peer_addr()
    }

    pub fn into_split(self) -> (MessageReader, MessageWriter) {
        let (read, write) = self.stream.into_split();
        (
            MessageReader {
                half: read,
                read_buf: self.read_buf,
            },
            MessageWriter { half: write },
        )
    }
}

impl MessageReader {
    pub async fn receive_message(&mut self) -> Result<Message, PeerError> {
        read_message(&mut self.half, &mut self.read_buf).await
    }
}

impl MessageWriter {
    pub async fn send_message(&mut self, message: &Message) -> Result<(), PeerError> {
        write_all(&mut self.half, &message.encode()).await
    }

    pub async fn shutdown(&mut self) {
        let _ = self.half.shutdown().await;
    }
}

async fn write_all<W: AsyncWrite + Unpin>(writer: &mut W, data: &[u8]) -> Result<(), PeerError> {
    timeout(WRITE_TIMEOUT, writer.write_all(data))
        .await
        .map_err(|_| PeerError::Timeout)??;
    Ok(())
}

/// Reads until `buf` holds at least `wanted` bytes.
async fn fill<R: AsyncRead + Unpin>(
    reader: &mut R,
    buf: &mut BytesMut,
    wanted: usize,
) -> Result<(), PeerError> {
    while buf.len() < wanted {
        let n = timeout(READ_TIMEOUT, reader.read_buf(buf))
            .await
            .map_err(|_| PeerError::Timeout)??;
        if n == 0 {
            return Err(PeerError::ConnectionClosed);
        }
    }
    Ok(())
}

async fn read_message<R: AsyncRead + Unpin>(
    reader: &mut R,
    buf: &mut BytesMut,
) -> Result<Message, PeerError> {
    fill(reader, buf, 4).await?;
    let length = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if length > MAX_FRAME_LEN {
        return Err(PeerError::InvalidMessage(format!(
            "message too large: {}",
            length
        )));
    }

    let total_len = 4 + length;
    fill(reader, buf, total_len).await?;
    Message::decode(buf.split_to(total_len).freeze())
}
