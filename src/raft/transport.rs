//! Peer-to-peer transport for raft messages
//!
//! Frames are length-prefixed:
//! - 4 bytes: frame length (big-endian u32)
//! - N bytes: bincode [`Envelope`] holding the sender, a protobuf-encoded
//!   raft `Message`, and for snapshots the member directory
//!
//! Every outbound peer gets one long-lived connection owned by a writer task.
//! Sending never blocks the raft worker: when a peer's queue is full or its
//! connection is down, messages are dropped and raft retransmits.

use crate::common::{raft_id, Error, Result};
use crate::raft::Server;
use protobuf::Message as PbMessage;
use raft::prelude::Message;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Upper bound on a single frame; snapshots carry the full key space
pub const MAX_FRAME_LEN: usize = 256 * 1024 * 1024;

/// Initial buffer for a frame body
const READ_CHUNK: usize = 64 * 1024;
const PEER_QUEUE_DEPTH: usize = 1024;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
const RECONNECT_BACKOFF: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub from: Server,
    pub message: Vec<u8>,
    /// Names and addresses of members, sent along with snapshots. A follower
    /// restored from a snapshot never sees the earlier membership entries.
    pub members: Vec<Server>,
}

impl Envelope {
    pub fn wrap(from: &Server, msg: &Message, members: &[Server]) -> Result<Self> {
        let message = msg
            .write_to_bytes()
            .map_err(|e| Error::Internal(format!("encode raft message: {}", e)))?;
        Ok(Self {
            from: from.clone(),
            message,
            members: members.to_vec(),
        })
    }

    pub fn unwrap_message(&self) -> Result<Message> {
        let mut msg = Message::default();
        msg.merge_from_bytes(&self.message)
            .map_err(|e| Error::Decode(format!("raft message: {}", e)))?;
        Ok(msg)
    }
}

/// A raft message received from a peer
#[derive(Debug)]
pub struct Inbound {
    pub from: Server,
    pub message: Message,
    pub members: Vec<Server>,
}

pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &[u8]) -> io::Result<()> {
    if frame.len() > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("frame of {} bytes exceeds limit", frame.len()),
        ));
    }
    writer.write_all(&(frame.len() as u32).to_be_bytes()).await?;
    writer.write_all(frame).await?;
    writer.flush().await
}

/// Read one frame. `None` on a clean end of stream.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {} bytes exceeds limit", len),
        ));
    }
    // Grow with the bytes that actually arrive rather than trusting the prefix
    let mut buf = Vec::with_capacity(len.min(READ_CHUNK));
    (&mut *reader).take(len as u64).read_to_end(&mut buf).await?;
    if buf.len() < len {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("frame truncated at {} of {} bytes", buf.len(), len),
        ));
    }
    Ok(Some(buf))
}

/// Accept peer connections and forward decoded messages to `tx`.
pub fn spawn_listener(listener: TcpListener, tx: mpsc::Sender<Inbound>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, remote)) => {
                    let tx = tx.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, tx).await {
                            tracing::debug!(%remote, "Raft connection closed: {}", e);
                        }
                    });
                }
                Err(e) => {
                    tracing::warn!("Raft accept error: {}", e);
                    tokio::time::sleep(RECONNECT_BACKOFF).await;
                }
            }
        }
    })
}

async fn handle_connection(mut stream: TcpStream, tx: mpsc::Sender<Inbound>) -> Result<()> {
    stream.set_nodelay(true)?;
    while let Some(frame) = read_frame(&mut stream).await? {
        let envelope: Envelope = bincode::deserialize(&frame)
            .map_err(|e| Error::Decode(format!("envelope: {}", e)))?;
        let message = envelope.unwrap_message()?;
        let inbound = Inbound {
            from: envelope.from,
            message,
            members: envelope.members,
        };
        if tx.send(inbound).await.is_err() {
            // worker gone
            break;
        }
    }
    Ok(())
}

struct Peer {
    address: String,
    queue: mpsc::Sender<Vec<u8>>,
    task: JoinHandle<()>,
}

/// Outbound side: one writer task per known peer.
pub struct Transport {
    local: Server,
    peers: HashMap<u64, Peer>,
}

impl Transport {
    pub fn new(local: Server) -> Self {
        Self {
            local,
            peers: HashMap::new(),
        }
    }

    pub fn local(&self) -> &Server {
        &self.local
    }

    pub fn address_of(&self, id: u64) -> Option<&str> {
        self.peers.get(&id).map(|p| p.address.as_str())
    }

    /// Register or update the address of a peer.
    pub fn set_peer(&mut self, server: &Server) {
        let id = raft_id(&server.id);
        if id == raft_id(&self.local.id) || server.address.is_empty() {
            return;
        }
        if let Some(peer) = self.peers.get(&id) {
            if peer.address == server.address {
                return;
            }
        }

        let (queue, rx) = mpsc::channel(PEER_QUEUE_DEPTH);
        let task = tokio::spawn(run_writer(server.id.clone(), server.address.clone(), rx));
        tracing::info!(peer = %server.id, address = %server.address, "Connected raft peer");
        if let Some(old) = self.peers.insert(
            id,
            Peer {
                address: server.address.clone(),
                queue,
                task,
            },
        ) {
            old.task.abort();
        }
    }

    pub fn remove_peer(&mut self, id: u64) {
        if let Some(peer) = self.peers.remove(&id) {
            peer.task.abort();
        }
    }

    /// Queue a message for its destination. Unknown peers and full queues
    /// drop the message.
    pub fn send(&mut self, msg: &Message, members: &[Server]) -> Result<()> {
        let Some(peer) = self.peers.get(&msg.to) else {
            tracing::debug!(to = msg.to, "No address for raft peer, dropping message");
            return Ok(());
        };
        let envelope = Envelope::wrap(&self.local, msg, members)?;
        let frame = bincode::serialize(&envelope)
            .map_err(|e| Error::Internal(format!("encode envelope: {}", e)))?;
        if peer.queue.try_send(frame).is_err() {
            tracing::debug!(to = msg.to, "Raft peer queue full, dropping message");
        }
        Ok(())
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        for peer in self.peers.values() {
            peer.task.abort();
        }
    }
}

async fn run_writer(name: String, address: String, mut rx: mpsc::Receiver<Vec<u8>>) {
    let mut stream: Option<TcpStream> = None;
    while let Some(frame) = rx.recv().await {
        if stream.is_none() {
            stream = connect(&address).await;
            if stream.is_none() {
                tracing::debug!(peer = %name, %address, "Raft peer unreachable");
                tokio::time::sleep(RECONNECT_BACKOFF).await;
                continue;
            }
        }
        if let Some(conn) = stream.as_mut() {
            if let Err(e) = write_frame(conn, &frame).await {
                tracing::debug!(peer = %name, "Raft send failed: {}", e);
                stream = None;
            }
        }
    }
}

async fn connect(address: &str) -> Option<TcpStream> {
    match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(address)).await {
        Ok(Ok(stream)) => {
            let _ = stream.set_nodelay(true);
            Some(stream)
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use raft::prelude::MessageType;

    #[tokio::test]
    async fn test_frame_roundtrip_over_duplex() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        write_frame(&mut a, b"hello").await.unwrap();
        drop(a);
        assert_eq!(read_frame(&mut b).await.unwrap(), Some(b"hello".to_vec()));
        assert_eq!(read_frame(&mut b).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_oversized_frame_is_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&(u32::MAX).to_be_bytes()).await.unwrap();
        let err = read_frame(&mut b).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn test_truncated_frame_is_rejected() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        a.write_all(&(MAX_FRAME_LEN as u32).to_be_bytes()).await.unwrap();
        a.write_all(b"short").await.unwrap();
        drop(a);
        let err = read_frame(&mut b).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn test_frame_larger_than_first_chunk() {
        let (mut a, mut b) = tokio::io::duplex(8 * 1024);
        let frame = vec![7u8; READ_CHUNK * 2 + 3];
        let writer = tokio::spawn(async move {
            write_frame(&mut a, &frame).await.unwrap();
        });
        let read = read_frame(&mut b).await.unwrap().unwrap();
        writer.await.unwrap();
        assert_eq!(read.len(), READ_CHUNK * 2 + 3);
        assert!(read.iter().all(|&byte| byte == 7));
    }

    #[tokio::test]
    async fn test_message_reaches_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let (tx, mut rx) = mpsc::channel(8);
        let handle = spawn_listener(listener, tx);

        let remote = Server {
            id: "remote".into(),
            address: addr,
        };
        let mut transport = Transport::new(Server {
            id: "local".into(),
            address: "127.0.0.1:1".into(),
        });
        transport.set_peer(&remote);

        let mut msg = Message::default();
        msg.set_msg_type(MessageType::MsgHeartbeat);
        msg.to = raft_id("remote");
        msg.from = raft_id("local");
        msg.term = 3;
        let members = vec![remote.clone()];
        transport.send(&msg, &members).unwrap();

        let inbound = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(inbound.from.id, "local");
        assert_eq!(inbound.members, members);
        assert_eq!(inbound.message.term, 3);
        assert_eq!(inbound.message.get_msg_type(), MessageType::MsgHeartbeat);
        handle.abort();
    }

    #[tokio::test]
    async fn test_local_and_empty_addresses_are_ignored() {
        let mut transport = Transport::new(Server {
            id: "me".into(),
            address: "127.0.0.1:1".into(),
        });
        transport.set_peer(&Server {
            id: "me".into(),
            address: "127.0.0.1:2".into(),
        });
        transport.set_peer(&Server {
            id: "other".into(),
            address: String::new(),
        });
        assert!(transport.address_of(raft_id("me")).is_none());
        assert!(transport.address_of(raft_id("other")).is_none());
    }
}
