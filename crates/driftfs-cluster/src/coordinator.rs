//! Owner forwarding.
//!
//! The coordinator wraps a local [`DriftFs`]. Operations on paths this
//! node owns apply locally; everything else is forwarded to the owner over
//! the peer RPC. Owners keep a server-side write handle per path so a
//! stream of forwarded writes does not reopen the file each time; the
//! forwarded `Flush` closes it, which is also the close-to-open barrier.
//!
//! A peer that stops answering is marked lost: every path it owns fails
//! with `Stale` until the mount is recreated with a live membership.

use std::collections::HashSet;
use std::sync::{Arc, RwLock};

use dashmap::DashMap;
use driftfs_core::domain::{FsError, InodeId};
use driftfs_fs::DriftFs;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::membership::Membership;
use crate::rpc::{NodeRequest, NodeResponse, PeerClient, RpcEnvelope, RpcReply};

/// A node of a cooperative mount.
pub struct Coordinator {
    fs: Arc<DriftFs>,
    membership: Membership,
    /// Indexed by member id; `None` at our own slot.
    peers: Vec<Option<PeerClient>>,
    /// Members that stopped answering. Their paths are unreachable.
    lost: RwLock<HashSet<u32>>,
    /// Server-side write handles for forwarded streams, keyed by path.
    write_handles: DashMap<String, (InodeId, u64)>,
}

impl Coordinator {
    /// Binds the local member address and starts serving peers.
    pub async fn start(
        fs: Arc<DriftFs>,
        membership: Membership,
    ) -> Result<Arc<Self>, FsError> {
        let listener = TcpListener::bind(membership.local_address())
            .await
            .map_err(|err| FsError::Io(format!("bind {}: {err}", membership.local_address())))?;
        Ok(Self::start_with_listener(fs, membership, listener))
    }

    /// Starts serving on an already bound listener (lets tests use
    /// ephemeral ports).
    pub fn start_with_listener(
        fs: Arc<DriftFs>,
        membership: Membership,
        listener: TcpListener,
    ) -> Arc<Self> {
        let peers = (0..membership.len() as u32)
            .map(|member| {
                (member != membership.node_id())
                    .then(|| PeerClient::new(membership.address_of(member).to_string()))
            })
            .collect();
        let coordinator = Arc::new(Self {
            fs,
            membership,
            peers,
            lost: RwLock::new(HashSet::new()),
            write_handles: DashMap::new(),
        });

        let server = Arc::clone(&coordinator);
        tokio::spawn(async move {
            info!(node = server.membership.node_id(), "cluster node serving");
            loop {
                match listener.accept().await {
                    Ok((stream, peer_addr)) => {
                        debug!(%peer_addr, "peer connected");
                        let server = Arc::clone(&server);
                        tokio::spawn(async move {
                            server.serve_connection(stream).await;
                        });
                    }
                    Err(err) => {
                        warn!(%err, "accept failed");
                        break;
                    }
                }
            }
        });
        coordinator
    }

    pub fn fs(&self) -> &Arc<DriftFs> {
        &self.fs
    }

    pub fn membership(&self) -> &Membership {
        &self.membership
    }

    async fn serve_connection(self: &Arc<Self>, stream: TcpStream) {
        let (read, mut write) = stream.into_split();
        let mut lines = BufReader::new(read).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let reply = match serde_json::from_str::<RpcEnvelope>(&line) {
                Ok(envelope) => RpcReply {
                    id: envelope.id,
                    result: self.apply_local(envelope.request).await,
                },
                Err(err) => RpcReply {
                    id: 0,
                    result: Err(FsError::Invalid(format!("malformed request: {err}"))),
                },
            };
            let Ok(mut json) = serde_json::to_string(&reply) else {
                break;
            };
            json.push('\n');
            if write.write_all(json.as_bytes()).await.is_err() {
                break;
            }
        }
    }

    // ========================================================================
    // Request application (owner side)
    // ========================================================================

    async fn apply_local(
        self: &Arc<Self>,
        request: NodeRequest,
    ) -> Result<NodeResponse, FsError> {
        match request {
            NodeRequest::Getattr { path } => {
                let ino = self.resolve_path(&path).await?;
                let attr = self.fs.getattr(ino)?;
                Ok(NodeResponse::Attr {
                    size: attr.size,
                    mode: attr.mode,
                    is_dir: attr.kind == driftfs_core::domain::InodeKind::Directory,
                })
            }
            NodeRequest::Create {
                path,
                mode,
                uid,
                gid,
            } => {
                let (parent, name) = split_path(&path)?;
                let parent_ino = self.resolve_path(parent).await?;
                let (entry, fh) = self.fs.create(parent_ino, name, mode, uid, gid).await?;
                self.write_handles.insert(path.clone(), (entry.ino, fh));
                self.broadcast_invalidation(path);
                Ok(NodeResponse::Unit)
            }
            NodeRequest::Write { path, offset, data } => {
                let (ino, fh) = self.write_handle_for(&path).await?;
                let count = self.fs.write(ino, fh, offset, &data).await?;
                Ok(NodeResponse::Written { count })
            }
            NodeRequest::Read { path, offset, len } => {
                let ino = self.resolve_path(&path).await?;
                let fh = self.fs.open(ino, false).await?;
                let result = self.fs.read(ino, fh, offset, len).await;
                self.fs.release(ino, fh).await?;
                Ok(NodeResponse::Data { bytes: result? })
            }
            NodeRequest::Flush { path } => {
                if let Some((_, (ino, fh))) = self.write_handles.remove(&path) {
                    self.fs.release(ino, fh).await?;
                } else {
                    let ino = self.resolve_path(&path).await?;
                    self.fs.flush(ino).await?;
                }
                self.broadcast_invalidation(path);
                Ok(NodeResponse::Unit)
            }
            NodeRequest::Unlink { path } => {
                if let Some((_, (ino, fh))) = self.write_handles.remove(&path) {
                    let _ = self.fs.release(ino, fh).await;
                }
                let (parent, name) = split_path(&path)?;
                let parent_ino = self.resolve_path(parent).await?;
                self.fs.unlink(parent_ino, name).await?;
                self.broadcast_invalidation(path);
                Ok(NodeResponse::Unit)
            }
            NodeRequest::Readdir { path } => {
                let ino = self.resolve_path(&path).await?;
                let names = self
                    .fs
                    .readdir(ino)
                    .await?
                    .into_iter()
                    .map(|entry| entry.name)
                    .collect();
                Ok(NodeResponse::Names { names })
            }
            NodeRequest::Invalidate { path } => {
                self.fs.invalidate_path(&path);
                Ok(NodeResponse::Unit)
            }
        }
    }

    /// The cached server-side write handle for a forwarded stream,
    /// opening one on first use.
    async fn write_handle_for(&self, path: &str) -> Result<(InodeId, u64), FsError> {
        if let Some(entry) = self.write_handles.get(path) {
            return Ok(*entry);
        }
        let ino = self.resolve_path(path).await?;
        let fh = self.fs.open(ino, true).await?;
        self.write_handles.insert(path.to_string(), (ino, fh));
        Ok((ino, fh))
    }

    async fn resolve_path(&self, path: &str) -> Result<InodeId, FsError> {
        let mut ino = InodeId::ROOT;
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            ino = self.fs.lookup(ino, segment).await?.ino;
        }
        Ok(ino)
    }

    /// Fire-and-forget invalidation to every live peer.
    fn broadcast_invalidation(self: &Arc<Self>, path: String) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let lost = this.lost.read().unwrap().clone();
            for member in this.membership.peers() {
                if lost.contains(&member) {
                    continue;
                }
                if let Some(peer) = &this.peers[member as usize] {
                    let _ = peer
                        .call(NodeRequest::Invalidate { path: path.clone() })
                        .await;
                }
            }
        });
    }

    // ========================================================================
    // Routing (client side)
    // ========================================================================

    async fn route(
        self: &Arc<Self>,
        path: &str,
        request: NodeRequest,
    ) -> Result<NodeResponse, FsError> {
        let owner = self.membership.owner_of(path);
        if self.lost.read().unwrap().contains(&owner) {
            return Err(FsError::Stale(format!(
                "owner node {owner} was lost; remount required"
            )));
        }
        if owner == self.membership.node_id() {
            return self.apply_local(request).await;
        }

        let peer = self.peers[owner as usize]
            .as_ref()
            .expect("non-local owner has a peer client");
        debug!(path, owner, "forwarding to owner");
        match peer.call(request).await {
            Ok(response) => Ok(response),
            Err(FsError::Io(message)) => {
                warn!(owner, %message, "peer unreachable, marking member lost");
                self.lost.write().unwrap().insert(owner);
                Err(FsError::Io(message))
            }
            Err(err) => Err(err),
        }
    }

    // ========================================================================
    // Public path-addressed surface
    // ========================================================================

    pub async fn getattr(self: &Arc<Self>, path: &str) -> Result<(u64, u32, bool), FsError> {
        match self.route(path, NodeRequest::Getattr { path: path.to_string() }).await? {
            NodeResponse::Attr { size, mode, is_dir } => Ok((size, mode, is_dir)),
            other => Err(unexpected(other)),
        }
    }

    pub async fn create(
        self: &Arc<Self>,
        path: &str,
        mode: u32,
        uid: u32,
        gid: u32,
    ) -> Result<(), FsError> {
        match self
            .route(
                path,
                NodeRequest::Create {
                    path: path.to_string(),
                    mode,
                    uid,
                    gid,
                },
            )
            .await?
        {
            NodeResponse::Unit => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    pub async fn write(
        self: &Arc<Self>,
        path: &str,
        offset: u64,
        data: &[u8],
    ) -> Result<u32, FsError> {
        match self
            .route(
                path,
                NodeRequest::Write {
                    path: path.to_string(),
                    offset,
                    data: data.to_vec(),
                },
            )
            .await?
        {
            NodeResponse::Written { count } => Ok(count),
            other => Err(unexpected(other)),
        }
    }

    pub async fn read(
        self: &Arc<Self>,
        path: &str,
        offset: u64,
        len: u32,
    ) -> Result<Vec<u8>, FsError> {
        match self
            .route(
                path,
                NodeRequest::Read {
                    path: path.to_string(),
                    offset,
                    len,
                },
            )
            .await?
        {
            NodeResponse::Data { bytes } => Ok(bytes),
            other => Err(unexpected(other)),
        }
    }

    pub async fn flush(self: &Arc<Self>, path: &str) -> Result<(), FsError> {
        match self.route(path, NodeRequest::Flush { path: path.to_string() }).await? {
            NodeResponse::Unit => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    pub async fn unlink(self: &Arc<Self>, path: &str) -> Result<(), FsError> {
        match self.route(path, NodeRequest::Unlink { path: path.to_string() }).await? {
            NodeResponse::Unit => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    /// Directory listings are served locally: reads of a directory need no
    /// single-writer owner, and every node sees the same bucket.
    pub async fn readdir(self: &Arc<Self>, path: &str) -> Result<Vec<String>, FsError> {
        let ino = self.resolve_path(path).await?;
        Ok(self
            .fs
            .readdir(ino)
            .await?
            .into_iter()
            .map(|entry| entry.name)
            .collect())
    }
}

fn unexpected(response: NodeResponse) -> FsError {
    FsError::Io(format!("unexpected peer response: {response:?}"))
}

fn split_path(path: &str) -> Result<(&str, &str), FsError> {
    let trimmed = path.trim_matches('/');
    if trimmed.is_empty() {
        return Err(FsError::Invalid("empty path".to_string()));
    }
    match trimmed.rsplit_once('/') {
        Some((parent, name)) => Ok((parent, name)),
        None => Ok(("", trimmed)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_path() {
        assert_eq!(split_path("a.txt").unwrap(), ("", "a.txt"));
        assert_eq!(split_path("d/sub/f2").unwrap(), ("d/sub", "f2"));
        assert!(split_path("").is_err());
        assert!(split_path("/").is_err());
    }
}
