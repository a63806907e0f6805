//! Internal node-to-node RPC.
//!
//! Newline-delimited JSON over TCP: one request envelope per line, one
//! reply per line, answered in order per connection. Operations address
//! inodes by path, since inode numbers are node-local.

use driftfs_core::domain::FsError;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::debug;

/// An inode-scoped operation forwarded to the owner node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum NodeRequest {
    Getattr { path: String },
    Create { path: String, mode: u32, uid: u32, gid: u32 },
    Write { path: String, offset: u64, data: Vec<u8> },
    Read { path: String, offset: u64, len: u32 },
    /// Close-to-open barrier: flush and drop the server-side handle.
    Flush { path: String },
    Unlink { path: String },
    Readdir { path: String },
    /// Cache invalidation broadcast; fire-and-forget semantics.
    Invalidate { path: String },
}

/// Owner-side results.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum NodeResponse {
    Attr { size: u64, mode: u32, is_dir: bool },
    Written { count: u32 },
    Data { bytes: Vec<u8> },
    Names { names: Vec<String> },
    Unit,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RpcEnvelope {
    pub id: u64,
    pub request: NodeRequest,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RpcReply {
    pub id: u64,
    pub result: Result<NodeResponse, FsError>,
}

/// A lazily connected client to one peer. Calls serialise on the
/// connection; an I/O failure drops it and the next call reconnects.
pub struct PeerClient {
    address: String,
    connection: Mutex<Option<Connection>>,
}

struct Connection {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    next_id: u64,
}

impl PeerClient {
    pub fn new(address: String) -> Self {
        Self {
            address,
            connection: Mutex::new(None),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Sends a request and waits for the reply.
    pub async fn call(&self, request: NodeRequest) -> Result<NodeResponse, FsError> {
        let mut guard = self.connection.lock().await;
        if guard.is_none() {
            let stream = TcpStream::connect(&self.address)
                .await
                .map_err(|err| FsError::Io(format!("peer {}: {err}", self.address)))?;
            let (read, write) = stream.into_split();
            *guard = Some(Connection {
                reader: BufReader::new(read),
                writer: write,
                next_id: 1,
            });
            debug!(peer = %self.address, "peer connection established");
        }
        let connection = guard.as_mut().expect("connection just established");

        let id = connection.next_id;
        connection.next_id += 1;
        let envelope = RpcEnvelope { id, request };
        let mut line = serde_json::to_string(&envelope)
            .map_err(|err| FsError::Invalid(err.to_string()))?;
        line.push('\n');

        let exchange = async {
            connection.writer.write_all(line.as_bytes()).await?;
            let mut reply_line = String::new();
            let read = connection.reader.read_line(&mut reply_line).await?;
            if read == 0 {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "peer closed connection",
                ));
            }
            Ok(reply_line)
        };

        let reply_line = match exchange.await {
            Ok(line) => line,
            Err(err) => {
                // Drop the broken connection; the next call redials.
                *guard = None;
                return Err(FsError::Io(format!("peer {}: {err}", self.address)));
            }
        };

        let reply: RpcReply = serde_json::from_str(reply_line.trim_end())
            .map_err(|err| FsError::Io(format!("malformed peer reply: {err}")))?;
        if reply.id != id {
            *guard = None;
            return Err(FsError::Io(format!(
                "peer reply id {} does not match request {id}",
                reply.id
            )));
        }
        reply.result
    }
}
