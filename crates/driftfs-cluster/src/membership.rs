//! Static cluster membership and deterministic ownership.
//!
//! Inode ids are node-local, so ownership hashes over the stable cluster
//! identity of a node: a 64-bit digest of its full object key. Every
//! member computes the same owner for the same path without any
//! coordination. Membership is fixed for the lifetime of the mount.

use driftfs_core::config::ClusterConfig;
use driftfs_core::domain::FsError;
use sha2::{Digest, Sha256};

/// The fixed member list of a cooperative mount.
#[derive(Debug, Clone)]
pub struct Membership {
    node_id: u32,
    members: Vec<String>,
}

impl Membership {
    pub fn from_config(config: &ClusterConfig) -> Result<Self, FsError> {
        if config.members.is_empty() {
            return Err(FsError::Invalid("empty cluster membership".to_string()));
        }
        if config.node_id as usize >= config.members.len() {
            return Err(FsError::Invalid(format!(
                "node id {} out of range for {} members",
                config.node_id,
                config.members.len()
            )));
        }
        Ok(Self {
            node_id: config.node_id,
            members: config.members.clone(),
        })
    }

    pub fn node_id(&self) -> u32 {
        self.node_id
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn address_of(&self, member: u32) -> &str {
        &self.members[member as usize]
    }

    pub fn local_address(&self) -> &str {
        self.address_of(self.node_id)
    }

    /// Stable 64-bit cluster identity of a path.
    pub fn cluster_id(path: &str) -> u64 {
        let digest = Sha256::digest(path.as_bytes());
        u64::from_le_bytes(digest[..8].try_into().expect("digest is long enough"))
    }

    /// The member owning a path.
    pub fn owner_of(&self, path: &str) -> u32 {
        (Self::cluster_id(path) % self.members.len() as u64) as u32
    }

    pub fn owns(&self, path: &str) -> bool {
        self.owner_of(path) == self.node_id
    }

    /// Every member id except this node.
    pub fn peers(&self) -> impl Iterator<Item = u32> + '_ {
        (0..self.members.len() as u32).filter(move |&m| m != self.node_id)
    }
}
