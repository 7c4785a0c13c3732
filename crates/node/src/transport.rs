//! Framed TCP transport: 24-byte header (magic, command, length, sha256d
//! checksum), a read task dispatching into the peer handler, and a write
//! task draining the peer's outbound queue.

use std::sync::Arc;
use std::time::Duration;

use meridian_chainstate::{ChainEngine, ChainStore};
use meridian_primitives::encoding::DecodeError;
use meridian_primitives::sha256d;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::debug;

use crate::handler::PeerHandler;
use crate::message::{Message, VersionPayload};
use crate::peer::{Peer, PeerState};
use crate::registry::RegistryHandle;

const FRAME_HEADER_LEN: usize = 24;
const COMMAND_LEN: usize = 12;
const HANDSHAKE_TIMEOUT_SECS: u64 = 8;
const READ_TIMEOUT_SECS: u64 = 120;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid magic in frame header")]
    InvalidMagic,
    #[error("invalid payload checksum")]
    InvalidChecksum,
    #[error("payload of {length} bytes exceeds the {command} bound")]
    PayloadTooLarge { command: String, length: usize },
    #[error("command name too long")]
    CommandTooLong,
    #[error("handshake timed out")]
    HandshakeTimeout,
    #[error("peer read timed out")]
    ReadTimeout,
    #[error("payload decode failed: {0}")]
    Decode(#[from] DecodeError),
}

pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    magic: [u8; 4],
    message: &Message,
) -> Result<(), TransportError> {
    let command = message.command();
    if command.len() > COMMAND_LEN {
        return Err(TransportError::CommandTooLong);
    }
    let payload = message.encode_payload();

    let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    frame.extend_from_slice(&magic);
    let mut command_bytes = [0u8; COMMAND_LEN];
    command_bytes[..command.len()].copy_from_slice(command.as_bytes());
    frame.extend_from_slice(&command_bytes);
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    let checksum = sha256d(&payload);
    frame.extend_from_slice(&checksum[..4]);
    frame.extend_from_slice(&payload);

    writer.write_all(&frame).await?;
    Ok(())
}

pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    magic: [u8; 4],
) -> Result<(String, Vec<u8>), TransportError> {
    let mut header = [0u8; FRAME_HEADER_LEN];
    reader.read_exact(&mut header).await?;
    if header[..4] != magic {
        return Err(TransportError::InvalidMagic);
    }

    let command: String = header[4..4 + COMMAND_LEN]
        .iter()
        .take_while(|byte| **byte != 0)
        .map(|byte| *byte as char)
        .collect();
    let length = u32::from_le_bytes([header[16], header[17], header[18], header[19]]) as usize;
    if length > Message::max_payload_size(&command) {
        return Err(TransportError::PayloadTooLarge { command, length });
    }

    let checksum = &header[20..24];
    let mut payload = vec![0u8; length];
    reader.read_exact(&mut payload).await?;
    let calc = sha256d(&payload);
    if checksum != &calc[..4] {
        return Err(TransportError::InvalidChecksum);
    }
    Ok((command, payload))
}

/// Drives a peer session over an established stream: handshake, registry
/// membership, then the read loop. Posts DonePeer on the way out.
pub async fn run_peer<C>(
    mut stream: TcpStream,
    peer: Arc<Peer>,
    outbound_rx: mpsc::Receiver<Message>,
    mut handler: PeerHandler<C>,
    registry: RegistryHandle,
    magic: [u8; 4],
    local_version: VersionPayload,
) -> Result<(), TransportError>
where
    C: ChainStore + ChainEngine + Send + Sync + 'static,
{
    let handshake_result = timeout(
        Duration::from_secs(HANDSHAKE_TIMEOUT_SECS),
        handshake(&mut stream, &peer, magic, &local_version),
    )
    .await;
    match handshake_result {
        Ok(Ok(())) => {}
        Ok(Err(err)) => return Err(err),
        Err(_) => return Err(TransportError::HandshakeTimeout),
    }

    registry.new_peer(Arc::clone(&peer)).await;

    let (mut read_half, mut write_half) = stream.into_split();
    let writer_peer = Arc::clone(&peer);
    let writer = tokio::spawn(async move {
        let mut outbound_rx = outbound_rx;
        while let Some(message) = outbound_rx.recv().await {
            if writer_peer.is_disconnected() {
                break;
            }
            if let Err(err) = write_frame(&mut write_half, magic, &message).await {
                debug!(%err, "peer write failed");
                break;
            }
        }
    });

    let result = read_loop(&mut read_half, &peer, &mut handler, magic).await;

    peer.disconnect();
    writer.abort();
    registry.done_peer(peer).await;
    result
}

async fn read_loop<R, C>(
    reader: &mut R,
    peer: &Arc<Peer>,
    handler: &mut PeerHandler<C>,
    magic: [u8; 4],
) -> Result<(), TransportError>
where
    R: AsyncRead + Unpin,
    C: ChainStore + ChainEngine,
{
    loop {
        if peer.is_disconnected() {
            return Ok(());
        }

        let frame = match timeout(
            Duration::from_secs(READ_TIMEOUT_SECS),
            read_frame(reader, magic),
        )
        .await
        {
            Ok(Ok(frame)) => frame,
            Ok(Err(err)) => return Err(err),
            Err(_) => return Err(TransportError::ReadTimeout),
        };

        let (command, payload) = frame;
        let message = Message::decode_payload(&command, &payload)?;
        match message {
            Message::Ping(nonce) => {
                let _ = peer.send_message(Message::Pong(nonce)).await;
            }
            message => {
                if handler.handle(message).await.is_err() {
                    return Ok(());
                }
            }
        }
    }
}

/// Version/verack exchange. Outbound peers speak first; the session is
/// established once our verack is acknowledged and the remote version is
/// known.
async fn handshake(
    stream: &mut TcpStream,
    peer: &Arc<Peer>,
    magic: [u8; 4],
    local_version: &VersionPayload,
) -> Result<(), TransportError> {
    peer.set_state(PeerState::Hand);
    if !peer.is_inbound() {
        write_frame(stream, magic, &Message::Version(local_version.clone())).await?;
    }

    while !(peer.version_known() && peer.ver_ack_received()) {
        let (command, payload) = read_frame(stream, magic).await?;
        match Message::decode_payload(&command, &payload)? {
            Message::Version(remote) => {
                peer.set_version_info(remote.version, remote.services, remote.height, remote.relay);
                peer.set_state(PeerState::HandShake);
                if peer.is_inbound() {
                    write_frame(stream, magic, &Message::Version(local_version.clone())).await?;
                }
                write_frame(stream, magic, &Message::VerAck).await?;
            }
            Message::VerAck => peer.set_ver_ack_received(),
            Message::Ping(nonce) => {
                write_frame(stream, magic, &Message::Pong(nonce)).await?;
            }
            other => debug!(command = other.command(), "ignored during handshake"),
        }
    }

    peer.set_state(PeerState::Established);
    debug!(
        peer = peer.id(),
        version = peer.version(),
        services = peer.services(),
        height = peer.height(),
        "handshake complete"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_primitives::ZERO_HASH;

    #[tokio::test]
    async fn frame_round_trip() {
        let message = Message::GetBlocks {
            locator: vec![[0x11; 32]],
            hash_stop: ZERO_HASH,
        };
        let mut buffer = Vec::new();
        write_frame(&mut buffer, [0xA1, 0xB2, 0xC3, 0xD4], &message)
            .await
            .expect("write");

        let mut cursor = std::io::Cursor::new(buffer);
        let (command, payload) = read_frame(&mut cursor, [0xA1, 0xB2, 0xC3, 0xD4])
            .await
            .expect("read");
        assert_eq!(command, "getblocks");
        assert_eq!(
            Message::decode_payload(&command, &payload).expect("decode"),
            message
        );
    }

    #[tokio::test]
    async fn wrong_magic_is_rejected() {
        let mut buffer = Vec::new();
        write_frame(&mut buffer, [1, 2, 3, 4], &Message::VerAck)
            .await
            .expect("write");
        let mut cursor = std::io::Cursor::new(buffer);
        assert!(matches!(
            read_frame(&mut cursor, [9, 9, 9, 9]).await,
            Err(TransportError::InvalidMagic)
        ));
    }

    #[tokio::test]
    async fn corrupted_payload_fails_checksum() {
        let mut buffer = Vec::new();
        write_frame(&mut buffer, [1, 2, 3, 4], &Message::Ping(7))
            .await
            .expect("write");
        let last = buffer.len() - 1;
        buffer[last] ^= 0xFF;
        let mut cursor = std::io::Cursor::new(buffer);
        assert!(matches!(
            read_frame(&mut cursor, [1, 2, 3, 4]).await,
            Err(TransportError::InvalidChecksum)
        ));
    }

    #[tokio::test]
    async fn oversized_length_is_refused_before_reading() {
        // A reqconsensus frame claiming far more than its 4-byte bound.
        let mut frame = Vec::new();
        frame.extend_from_slice(&[1, 2, 3, 4]);
        frame.extend_from_slice(b"reqconsensus");
        frame.extend_from_slice(&(1024u32).to_le_bytes());
        frame.extend_from_slice(&[0u8; 4]);
        let mut cursor = std::io::Cursor::new(frame);
        assert!(matches!(
            read_frame(&mut cursor, [1, 2, 3, 4]).await,
            Err(TransportError::PayloadTooLarge { .. })
        ));
    }
}
