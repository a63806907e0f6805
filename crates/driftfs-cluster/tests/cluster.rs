//! Multi-node tests: several coordinators over one shared backend,
//! talking over loopback TCP.

use std::sync::Arc;

use driftfs_cluster::{Coordinator, Membership};
use driftfs_core::config::{ClusterConfig, MountConfig};
use driftfs_core::domain::{FsError, InodeId};
use driftfs_core::ports::ObjectBackend;
use driftfs_fs::DriftFs;
use driftfs_store::MemoryBackend;
use tokio::net::TcpListener;

async fn spawn_cluster(
    nodes: usize,
    backend: &Arc<MemoryBackend>,
) -> Vec<Arc<Coordinator>> {
    let mut listeners = Vec::new();
    let mut members = Vec::new();
    for _ in 0..nodes {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        members.push(listener.local_addr().unwrap().to_string());
        listeners.push(listener);
    }

    let mut coordinators = Vec::new();
    for (node_id, listener) in listeners.into_iter().enumerate() {
        let fs = DriftFs::mount(
            Arc::clone(backend) as Arc<dyn ObjectBackend>,
            MountConfig::default(),
        )
        .await
        .unwrap();
        let membership = Membership::from_config(&ClusterConfig {
            node_id: node_id as u32,
            members: members.clone(),
        })
        .unwrap();
        coordinators.push(Coordinator::start_with_listener(fs, membership, listener));
    }
    coordinators
}

/// A path whose deterministic owner is `owner`.
fn path_owned_by(membership: &Membership, owner: u32) -> String {
    for index in 0.. {
        let candidate = format!("shared-{index}.txt");
        if membership.owner_of(&candidate) == owner {
            return candidate;
        }
    }
    unreachable!()
}

#[tokio::test]
async fn test_writes_from_two_nodes_serialize_through_owner() {
    let backend = Arc::new(MemoryBackend::new());
    let cluster = spawn_cluster(3, &backend).await;

    let path = path_owned_by(cluster[0].membership(), 0);
    // Both writers are non-owners; everything funnels through node 0.
    cluster[1].create(&path, 0o644, 1000, 1000).await.unwrap();
    cluster[1].write(&path, 0, b"from-b!!").await.unwrap();
    cluster[2].write(&path, 8, b"from-c!!").await.unwrap();
    cluster[1].flush(&path).await.unwrap();

    // The owner materialised the file; the writers never did locally.
    assert!(cluster[0]
        .fs()
        .lookup(InodeId::ROOT, &path)
        .await
        .is_ok());

    // The committed object interleaves both writers' data.
    assert_eq!(
        backend.object_bytes(&path).unwrap(),
        b"from-b!!from-c!!".to_vec()
    );

    // Any node reads the same bytes through the owner.
    let via_c = cluster[2].read(&path, 0, 16).await.unwrap();
    assert_eq!(via_c, b"from-b!!from-c!!".to_vec());
    let (size, _, is_dir) = cluster[2].getattr(&path).await.unwrap();
    assert_eq!(size, 16);
    assert!(!is_dir);
}

#[tokio::test]
async fn test_open_forwarded_to_owner_node() {
    let backend = Arc::new(MemoryBackend::new());
    let cluster = spawn_cluster(3, &backend).await;

    let path = path_owned_by(cluster[0].membership(), 1);
    cluster[0].create(&path, 0o644, 1000, 1000).await.unwrap();
    cluster[0].write(&path, 0, b"owned by node one").await.unwrap();
    cluster[0].flush(&path).await.unwrap();

    // Node 1 carries the inode; node 2 can still read through it.
    assert!(cluster[1]
        .fs()
        .lookup(InodeId::ROOT, &path)
        .await
        .is_ok());
    let bytes = cluster[2].read(&path, 0, 64).await.unwrap();
    assert_eq!(bytes, b"owned by node one".to_vec());
}

#[tokio::test]
async fn test_unlink_propagates_and_invalidates() {
    let backend = Arc::new(MemoryBackend::new());
    let cluster = spawn_cluster(2, &backend).await;

    let path = path_owned_by(cluster[0].membership(), 0);
    cluster[1].create(&path, 0o644, 1000, 1000).await.unwrap();
    cluster[1].write(&path, 0, b"short-lived").await.unwrap();
    cluster[1].flush(&path).await.unwrap();
    assert!(backend.contains(&path));

    cluster[1].unlink(&path).await.unwrap();
    cluster[0].fs().drain_background().await;
    assert!(!backend.contains(&path));
    assert!(matches!(
        cluster[1].getattr(&path).await,
        Err(FsError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_lost_member_makes_its_paths_stale() {
    let backend = Arc::new(MemoryBackend::new());

    // One live node plus one member address that answers nothing.
    let live = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let members = vec![
        live.local_addr().unwrap().to_string(),
        dead.local_addr().unwrap().to_string(),
    ];
    drop(dead);

    let fs = DriftFs::mount(
        Arc::clone(&backend) as Arc<dyn ObjectBackend>,
        MountConfig::default(),
    )
    .await
    .unwrap();
    let membership = Membership::from_config(&ClusterConfig {
        node_id: 0,
        members,
    })
    .unwrap();
    let node = Coordinator::start_with_listener(fs, membership, live);

    let foreign = path_owned_by(node.membership(), 1);
    // First contact fails and marks the member lost.
    assert!(matches!(
        node.getattr(&foreign).await,
        Err(FsError::Io(_))
    ));
    // From then on its paths are stale until remount.
    assert!(matches!(
        node.getattr(&foreign).await,
        Err(FsError::Stale(_))
    ));

    // Paths owned locally keep working.
    let local = path_owned_by(node.membership(), 0);
    node.create(&local, 0o644, 1000, 1000).await.unwrap();
    node.flush(&local).await.unwrap();
    assert!(backend.contains(&local));
}

#[tokio::test]
async fn test_remote_listing_sees_flushed_files() {
    let backend = Arc::new(MemoryBackend::new());
    let cluster = spawn_cluster(2, &backend).await;

    let path = path_owned_by(cluster[0].membership(), 0);
    cluster[1].create(&path, 0o644, 1000, 1000).await.unwrap();
    cluster[1].write(&path, 0, b"visible").await.unwrap();
    cluster[1].flush(&path).await.unwrap();

    // The non-owner lists the bucket and sees the flushed object.
    let names = cluster[1].readdir("").await.unwrap();
    assert!(names.contains(&path), "names: {names:?}");
}
