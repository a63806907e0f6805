//! End-to-end tests driving the full pipeline (inode graph, buffer pool,
//! flusher, prefetcher) against the in-memory backend.

use std::sync::Arc;

use driftfs_core::config::MountConfig;
use driftfs_core::domain::{FsError, InodeId, InodeKind, SetAttr};
use driftfs_core::ports::{Capabilities, Metadata, ObjectBackend, PutBlobRequest, StoreError};
use driftfs_fs::DriftFs;
use driftfs_store::MemoryBackend;

async fn mount(backend: &Arc<MemoryBackend>) -> Arc<DriftFs> {
    mount_with(backend, MountConfig::default()).await
}

async fn mount_with(backend: &Arc<MemoryBackend>, config: MountConfig) -> Arc<DriftFs> {
    DriftFs::mount(Arc::clone(backend) as Arc<dyn ObjectBackend>, config)
        .await
        .unwrap()
}

async fn seed(backend: &MemoryBackend, key: &str, data: &[u8]) {
    backend
        .put_blob(PutBlobRequest {
            key: driftfs_core::domain::ObjectKey::new(key).unwrap(),
            data: data.to_vec(),
            metadata: Metadata::new(),
            content_type: None,
        })
        .await
        .unwrap();
}

async fn lookup_ino(fs: &Arc<DriftFs>, parent: InodeId, name: &str) -> InodeId {
    fs.lookup(parent, name).await.unwrap().ino
}

/// Capability profile with 16-byte multipart parts, so multipart paths
/// run on test-sized data.
fn tiny_part_caps() -> Capabilities {
    Capabilities {
        min_part_size: 16,
        max_part_size: 16,
        ..Capabilities::default()
    }
}

/// Mount config sending every non-empty file through multipart.
fn multipart_config() -> MountConfig {
    let mut config = MountConfig::default();
    config.flush.multipart_threshold_mb = 0;
    config.flush.part_size_mb = 0;
    config
}

// ============================================================================
// Scenario: create, write, close, reopen, read
// ============================================================================

#[tokio::test]
async fn test_create_write_close_reopen_read() {
    let backend = Arc::new(MemoryBackend::new());
    let fs = mount(&backend).await;

    let (entry, fh) = fs
        .create(InodeId::ROOT, "a.txt", 0o644, 1000, 1000)
        .await
        .unwrap();
    assert_eq!(fs.write(entry.ino, fh, 0, b"hello").await.unwrap(), 5);
    fs.release(entry.ino, fh).await.unwrap();

    // The backend holds exactly one key.
    assert_eq!(backend.keys(), vec!["a.txt".to_string()]);
    assert_eq!(backend.object_bytes("a.txt").unwrap(), b"hello");

    // Reopen and read through the cache.
    let ino = lookup_ino(&fs, InodeId::ROOT, "a.txt").await;
    let fh = fs.open(ino, false).await.unwrap();
    assert_eq!(fs.read(ino, fh, 0, 5).await.unwrap(), b"hello");
    fs.release(ino, fh).await.unwrap();

    // The flush outcome surfaced the backend etag on the inode.
    let meta = fs.lookup(InodeId::ROOT, "a.txt").await.unwrap();
    assert!(meta.etag.is_some());
    assert_eq!(meta.attr.size, 5);
}

#[tokio::test]
async fn test_read_of_preexisting_object() {
    let backend = Arc::new(MemoryBackend::new());
    seed(&backend, "docs/readme.md", b"# hi\n").await;
    let fs = mount(&backend).await;

    let docs = lookup_ino(&fs, InodeId::ROOT, "docs").await;
    let ino = lookup_ino(&fs, docs, "readme.md").await;
    let fh = fs.open(ino, false).await.unwrap();
    assert_eq!(fs.read(ino, fh, 0, 100).await.unwrap(), b"# hi\n");
    fs.release(ino, fh).await.unwrap();
}

// ============================================================================
// Scenario: rename a non-empty directory
// ============================================================================

#[tokio::test]
async fn test_rename_non_empty_directory() {
    let backend = Arc::new(MemoryBackend::new());
    seed(&backend, "d/f1", &[1u8; 128]).await;
    seed(&backend, "d/sub/f2", &[2u8; 128]).await;
    let fs = mount(&backend).await;

    fs.rename(InodeId::ROOT, "d", InodeId::ROOT, "e")
        .await
        .unwrap();

    // The graph shows the new name immediately.
    let e = lookup_ino(&fs, InodeId::ROOT, "e").await;
    let names: Vec<String> = fs
        .readdir(e)
        .await
        .unwrap()
        .into_iter()
        .map(|entry| entry.name)
        .collect();
    assert_eq!(names, vec!["f1".to_string(), "sub".to_string()]);

    let sub = lookup_ino(&fs, e, "sub").await;
    let sub_names: Vec<String> = fs
        .readdir(sub)
        .await
        .unwrap()
        .into_iter()
        .map(|entry| entry.name)
        .collect();
    assert_eq!(sub_names, vec!["f2".to_string()]);

    // After the background job: old keys gone, new keys carry the bytes.
    fs.drain_background().await;
    assert!(!backend.contains("d/f1"));
    assert!(!backend.contains("d/sub/f2"));
    assert_eq!(backend.object_bytes("e/f1").unwrap(), vec![1u8; 128]);
    assert_eq!(backend.object_bytes("e/sub/f2").unwrap(), vec![2u8; 128]);

    // The moved file reads back through its new key.
    let f1 = lookup_ino(&fs, e, "f1").await;
    let fh = fs.open(f1, false).await.unwrap();
    assert_eq!(fs.read(f1, fh, 0, 128).await.unwrap(), vec![1u8; 128]);
    fs.release(f1, fh).await.unwrap();
}

#[tokio::test]
async fn test_rename_file_uses_server_side_rename_when_available() {
    let caps = Capabilities {
        supports_rename: true,
        ..Capabilities::default()
    };
    let backend = Arc::new(MemoryBackend::with_capabilities(caps));
    seed(&backend, "old.txt", b"payload").await;
    let fs = mount(&backend).await;

    fs.rename(InodeId::ROOT, "old.txt", InodeId::ROOT, "new.txt")
        .await
        .unwrap();
    fs.drain_background().await;

    assert_eq!(backend.op_count("rename_blob"), 1);
    assert_eq!(backend.op_count("copy_blob"), 0);
    assert!(backend.contains("new.txt"));
    assert!(!backend.contains("old.txt"));
}

// ============================================================================
// Scenario: rename fallback with partial failure
// ============================================================================

#[tokio::test]
async fn test_rename_partial_failure_rolls_back_without_deletes() {
    let backend = Arc::new(MemoryBackend::new());
    seed(&backend, "d/f1", &[1u8; 64]).await;
    seed(&backend, "d/f2", &[2u8; 64]).await;
    let fs = mount(&backend).await;

    // First copy succeeds, second fails hard.
    backend.inject_ok("copy_blob");
    backend.inject_fault("copy_blob", StoreError::Permission("denied".to_string()));
    fs.rename(InodeId::ROOT, "d", InodeId::ROOT, "e")
        .await
        .unwrap();
    fs.drain_background().await;

    // No delete was ever issued and the source keys are intact.
    assert_eq!(backend.op_count("delete_blobs"), 0);
    assert!(backend.contains("d/f1"));
    assert!(backend.contains("d/f2"));

    // The graph rolled back to the source name. (The one copy that landed
    // may leave a harmless duplicate under the new prefix; nothing is
    // lost.)
    let names: Vec<String> = fs
        .readdir(InodeId::ROOT)
        .await
        .unwrap()
        .into_iter()
        .map(|entry| entry.name)
        .collect();
    assert!(names.contains(&"d".to_string()), "names: {names:?}");
    let d = lookup_ino(&fs, InodeId::ROOT, "d").await;
    let inner: Vec<String> = fs
        .readdir(d)
        .await
        .unwrap()
        .into_iter()
        .map(|entry| entry.name)
        .collect();
    assert_eq!(inner, vec!["f1".to_string(), "f2".to_string()]);
}

// ============================================================================
// Scenario: large write triggers multipart
// ============================================================================

#[tokio::test]
async fn test_large_write_takes_multipart_path() {
    let backend = Arc::new(MemoryBackend::with_capabilities(tiny_part_caps()));
    let fs = mount_with(&backend, multipart_config()).await;

    let payload: Vec<u8> = (0..40u8).collect();
    let (entry, fh) = fs
        .create(InodeId::ROOT, "big.bin", 0o644, 1000, 1000)
        .await
        .unwrap();
    fs.write(entry.ino, fh, 0, &payload).await.unwrap();
    fs.release(entry.ino, fh).await.unwrap();

    assert_eq!(backend.object_bytes("big.bin").unwrap(), payload);
    // Multipart etag, not a content hash of the whole body.
    let etag = fs
        .lookup(InodeId::ROOT, "big.bin")
        .await
        .unwrap()
        .etag
        .unwrap();
    assert!(etag.as_str().ends_with("-3"), "etag: {etag}");
    assert_eq!(backend.open_uploads(), 0);
}

#[tokio::test]
async fn test_partial_rewrite_of_large_object_uses_part_copy() {
    let backend = Arc::new(MemoryBackend::with_capabilities(tiny_part_caps()));
    let payload: Vec<u8> = (0..48u8).collect();
    seed(&backend, "big.bin", &payload).await;
    let fs = mount_with(&backend, multipart_config()).await;

    // Rewrite the last 8 bytes of a 48-byte object with 16-byte parts.
    let ino = lookup_ino(&fs, InodeId::ROOT, "big.bin").await;
    let fh = fs.open(ino, true).await.unwrap();
    fs.write(ino, fh, 40, &[0xEE; 8]).await.unwrap();
    fs.release(ino, fh).await.unwrap();

    let mut expected = payload;
    expected[40..].copy_from_slice(&[0xEE; 8]);
    assert_eq!(backend.object_bytes("big.bin").unwrap(), expected);
    // The untouched prefix was assembled server-side, not re-uploaded.
    assert_eq!(backend.op_count("multipart_copy"), 2);
    assert_eq!(backend.op_count("multipart_add"), 1);
    let etag = fs
        .lookup(InodeId::ROOT, "big.bin")
        .await
        .unwrap()
        .etag
        .unwrap();
    assert!(etag.as_str().ends_with("-3"), "etag: {etag}");
}

#[tokio::test]
async fn test_threshold_crossing_mid_write_switches_paths() {
    // Small minimum part size, but real 1 MiB parts.
    let caps = Capabilities {
        min_part_size: 16,
        ..Capabilities::default()
    };
    let backend = Arc::new(MemoryBackend::with_capabilities(caps));
    // Threshold well above the first write, below the second.
    let mut config = MountConfig::default();
    config.flush.multipart_threshold_mb = 1;
    config.flush.part_size_mb = 1;
    let fs = mount_with(&backend, config).await;

    let (entry, fh) = fs
        .create(InodeId::ROOT, "grow.bin", 0o644, 1000, 1000)
        .await
        .unwrap();
    fs.write(entry.ino, fh, 0, &vec![7u8; 512 * 1024]).await.unwrap();
    fs.write(entry.ino, fh, 512 * 1024, &vec![8u8; 600 * 1024])
        .await
        .unwrap();
    fs.release(entry.ino, fh).await.unwrap();

    let bytes = backend.object_bytes("grow.bin").unwrap();
    assert_eq!(bytes.len(), 1112 * 1024);
    assert!(bytes[..512 * 1024].iter().all(|&b| b == 7));
    assert!(bytes[512 * 1024..].iter().all(|&b| b == 8));
    // The upload went through the multipart machine.
    let etag = fs
        .lookup(InodeId::ROOT, "grow.bin")
        .await
        .unwrap()
        .etag
        .unwrap();
    assert!(etag.as_str().contains('-'), "etag: {etag}");
}

// ============================================================================
// Scenario: overlapping writes, last writer wins
// ============================================================================

#[tokio::test]
async fn test_overlapping_writes_last_writer_wins() {
    let backend = Arc::new(MemoryBackend::new());
    let fs = mount(&backend).await;

    let (entry, fh) = fs
        .create(InodeId::ROOT, "overlap.bin", 0o644, 1000, 1000)
        .await
        .unwrap();
    fs.write(entry.ino, fh, 0, &[0xAA; 64 * 1024]).await.unwrap();
    fs.write(entry.ino, fh, 32 * 1024, &[0xBB; 64 * 1024])
        .await
        .unwrap();
    fs.release(entry.ino, fh).await.unwrap();

    let bytes = backend.object_bytes("overlap.bin").unwrap();
    assert_eq!(bytes.len(), 96 * 1024);
    assert!(bytes[..32 * 1024].iter().all(|&b| b == 0xAA));
    assert!(bytes[32 * 1024..].iter().all(|&b| b == 0xBB));
}

// ============================================================================
// Holes and boundaries
// ============================================================================

#[tokio::test]
async fn test_write_past_eof_reads_zeros_in_gap() {
    let backend = Arc::new(MemoryBackend::new());
    let fs = mount(&backend).await;

    let (entry, fh) = fs
        .create(InodeId::ROOT, "sparse.bin", 0o644, 1000, 1000)
        .await
        .unwrap();
    fs.write(entry.ino, fh, 0, b"head").await.unwrap();
    fs.write(entry.ino, fh, 100, b"tail").await.unwrap();

    let bytes = fs.read(entry.ino, fh, 0, 104).await.unwrap();
    assert_eq!(&bytes[..4], b"head");
    assert!(bytes[4..100].iter().all(|&b| b == 0));
    assert_eq!(&bytes[100..], b"tail");

    fs.release(entry.ino, fh).await.unwrap();
    assert_eq!(backend.object_bytes("sparse.bin").unwrap().len(), 104);
}

#[tokio::test]
async fn test_truncate_then_flush_rewrites_object() {
    let backend = Arc::new(MemoryBackend::new());
    seed(&backend, "t.bin", b"0123456789").await;
    let fs = mount(&backend).await;

    let ino = lookup_ino(&fs, InodeId::ROOT, "t.bin").await;
    let fh = fs.open(ino, true).await.unwrap();
    let attr = fs
        .setattr(
            ino,
            SetAttr {
                size: Some(4),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(attr.size, 4);
    fs.release(ino, fh).await.unwrap();

    assert_eq!(backend.object_bytes("t.bin").unwrap(), b"0123");
}

// ============================================================================
// Namespace: unlink, mkdir, rmdir, symlink
// ============================================================================

#[tokio::test]
async fn test_create_unlink_lookup_not_found() {
    let backend = Arc::new(MemoryBackend::new());
    let fs = mount(&backend).await;

    let (entry, fh) = fs
        .create(InodeId::ROOT, "gone.txt", 0o644, 1000, 1000)
        .await
        .unwrap();
    fs.release(entry.ino, fh).await.unwrap();
    fs.unlink(InodeId::ROOT, "gone.txt").await.unwrap();
    fs.drain_background().await;

    assert!(matches!(
        fs.lookup(InodeId::ROOT, "gone.txt").await,
        Err(FsError::NotFound(_))
    ));
    assert!(!backend.contains("gone.txt"));
}

#[tokio::test]
async fn test_mkdir_writes_marker_and_rmdir_removes_it() {
    let backend = Arc::new(MemoryBackend::new());
    let fs = mount(&backend).await;

    let entry = fs
        .mkdir(InodeId::ROOT, "photos", 0o755, 1000, 1000)
        .await
        .unwrap();
    assert_eq!(entry.attr.kind, InodeKind::Directory);
    fs.drain_background().await;
    assert!(backend.contains("photos/"));

    fs.rmdir(InodeId::ROOT, "photos").await.unwrap();
    fs.drain_background().await;
    assert!(!backend.contains("photos/"));
    assert!(matches!(
        fs.rmdir(InodeId::ROOT, "photos").await,
        Err(FsError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_rmdir_of_non_empty_directory_fails() {
    let backend = Arc::new(MemoryBackend::new());
    seed(&backend, "full/file.txt", b"x").await;
    let fs = mount(&backend).await;

    assert!(matches!(
        fs.rmdir(InodeId::ROOT, "full").await,
        Err(FsError::NotEmpty(_))
    ));
    assert!(backend.contains("full/file.txt"));
}

#[tokio::test]
async fn test_symlink_round_trip() {
    let backend = Arc::new(MemoryBackend::new());
    let fs = mount(&backend).await;

    let entry = fs
        .symlink(InodeId::ROOT, "link", "target/file.txt", 1000, 1000)
        .await
        .unwrap();
    assert_eq!(entry.attr.kind, InodeKind::Symlink);
    assert_eq!(fs.readlink(entry.ino).unwrap(), "target/file.txt");
    fs.drain_background().await;

    // A fresh mount resolves the symlink from object metadata.
    let fs2 = mount(&backend).await;
    let entry2 = fs2.lookup(InodeId::ROOT, "link").await.unwrap();
    assert_eq!(entry2.attr.kind, InodeKind::Symlink);
    assert_eq!(fs2.readlink(entry2.ino).unwrap(), "target/file.txt");
}

// ============================================================================
// Listing edge cases
// ============================================================================

#[tokio::test]
async fn test_file_and_directory_name_collision_prefers_directory() {
    let backend = Arc::new(MemoryBackend::new());
    seed(&backend, "foo", b"file body").await;
    seed(&backend, "foo/child", b"nested").await;
    let fs = mount(&backend).await;

    let entries = fs.readdir(InodeId::ROOT).await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].name, "foo");
    assert_eq!(entries[0].kind, InodeKind::Directory);
}

#[tokio::test]
async fn test_lookup_probes_unlisted_remote_object() {
    let backend = Arc::new(MemoryBackend::new());
    let fs = mount(&backend).await;

    // Appears remotely after the mount, without a listing.
    seed(&backend, "late.txt", b"surprise").await;
    let entry = fs.lookup(InodeId::ROOT, "late.txt").await.unwrap();
    assert_eq!(entry.attr.size, 8);
}

#[tokio::test]
async fn test_fresh_listing_answers_negative_lookup_without_probe() {
    let backend = Arc::new(MemoryBackend::new());
    let fs = mount(&backend).await;

    fs.readdir(InodeId::ROOT).await.unwrap();
    let heads = backend.op_count("head_blob");
    assert!(matches!(
        fs.lookup(InodeId::ROOT, "missing.txt").await,
        Err(FsError::NotFound(_))
    ));
    assert_eq!(backend.op_count("head_blob"), heads);
}

// ============================================================================
// Attributes and xattrs
// ============================================================================

#[tokio::test]
async fn test_chmod_persists_through_metadata() {
    let backend = Arc::new(MemoryBackend::new());
    let fs = mount(&backend).await;

    let (entry, fh) = fs
        .create(InodeId::ROOT, "m.txt", 0o644, 1000, 1000)
        .await
        .unwrap();
    fs.write(entry.ino, fh, 0, b"data").await.unwrap();
    fs.setattr(
        entry.ino,
        SetAttr {
            mode: Some(0o600),
            ..Default::default()
        },
    )
    .await
    .unwrap();
    fs.release(entry.ino, fh).await.unwrap();

    // A fresh mount decodes the mode from object metadata.
    let fs2 = mount(&backend).await;
    let entry2 = fs2.lookup(InodeId::ROOT, "m.txt").await.unwrap();
    assert_eq!(entry2.attr.mode, 0o600);
    assert_eq!(entry2.attr.uid, 1000);
}

#[tokio::test]
async fn test_xattr_round_trip_across_mounts() {
    let backend = Arc::new(MemoryBackend::new());
    let fs = mount(&backend).await;

    let (entry, fh) = fs
        .create(InodeId::ROOT, "x.txt", 0o644, 1000, 1000)
        .await
        .unwrap();
    fs.write(entry.ino, fh, 0, b"data").await.unwrap();
    fs.setxattr(entry.ino, "user.origin", "scanner").unwrap();
    assert_eq!(fs.getxattr(entry.ino, "user.origin").unwrap(), "scanner");
    assert_eq!(fs.listxattr(entry.ino).unwrap(), vec!["user.origin"]);
    fs.release(entry.ino, fh).await.unwrap();

    let fs2 = mount(&backend).await;
    let entry2 = fs2.lookup(InodeId::ROOT, "x.txt").await.unwrap();
    assert_eq!(fs2.getxattr(entry2.ino, "user.origin").unwrap(), "scanner");

    fs2.removexattr(entry2.ino, "user.origin").unwrap();
    assert!(matches!(
        fs2.getxattr(entry2.ino, "user.origin"),
        Err(FsError::NotFound(_))
    ));
}

// ============================================================================
// Failure propagation and unmount
// ============================================================================

#[tokio::test]
async fn test_flush_failure_sticks_until_reopen() {
    let backend = Arc::new(MemoryBackend::new());
    let fs = mount(&backend).await;

    let (entry, fh) = fs
        .create(InodeId::ROOT, "bad.txt", 0o644, 1000, 1000)
        .await
        .unwrap();
    fs.write(entry.ino, fh, 0, b"doomed").await.unwrap();

    backend.inject_fault("put_blob", StoreError::Permission("denied".to_string()));
    assert!(matches!(
        fs.flush(entry.ino).await,
        Err(FsError::Permission(_))
    ));
    // Subsequent writes fail while the error sticks.
    assert!(matches!(
        fs.write(entry.ino, fh, 0, b"again").await,
        Err(FsError::Permission(_))
    ));

    // Close clears it (and retries the flush, which now succeeds).
    fs.release(entry.ino, fh).await.unwrap();
    assert_eq!(backend.object_bytes("bad.txt").unwrap(), b"doomed");
}

#[tokio::test]
async fn test_unmount_refuses_unflushable_dirty_data_unless_forced() {
    let backend = Arc::new(MemoryBackend::new());
    let fs = mount(&backend).await;

    let (entry, fh) = fs
        .create(InodeId::ROOT, "stuck.txt", 0o644, 1000, 1000)
        .await
        .unwrap();
    fs.write(entry.ino, fh, 0, b"data").await.unwrap();

    // Every PUT fails permanently.
    for _ in 0..8 {
        backend.inject_fault("put_blob", StoreError::Permission("denied".to_string()));
    }
    assert!(matches!(fs.unmount(false).await, Err(FsError::Busy(_))));

    // Forcing discards and succeeds.
    fs.unmount(true).await.unwrap();
    let _ = fh;
}

#[tokio::test]
async fn test_orderly_unmount_flushes_everything() {
    let backend = Arc::new(MemoryBackend::new());
    let fs = mount(&backend).await;

    let (entry, fh) = fs
        .create(InodeId::ROOT, "pending.txt", 0o644, 1000, 1000)
        .await
        .unwrap();
    fs.write(entry.ino, fh, 0, b"buffered").await.unwrap();
    // No release: unmount itself must flush.
    fs.unmount(false).await.unwrap();

    assert_eq!(backend.object_bytes("pending.txt").unwrap(), b"buffered");
    let _ = fh;
}

// ============================================================================
// Concurrency
// ============================================================================

#[tokio::test]
async fn test_concurrent_readers_see_identical_bytes() {
    let backend = Arc::new(MemoryBackend::new());
    seed(&backend, "shared.bin", &vec![42u8; 8192]).await;
    let fs = mount(&backend).await;

    let ino = lookup_ino(&fs, InodeId::ROOT, "shared.bin").await;
    let mut tasks = Vec::new();
    for _ in 0..8 {
        let fs = Arc::clone(&fs);
        tasks.push(tokio::spawn(async move {
            let fh = fs.open(ino, false).await.unwrap();
            let bytes = fs.read(ino, fh, 0, 8192).await.unwrap();
            fs.release(ino, fh).await.unwrap();
            bytes
        }));
    }
    for task in tasks {
        assert_eq!(task.await.unwrap(), vec![42u8; 8192]);
    }
}

#[tokio::test]
async fn test_concurrent_creates_in_one_directory() {
    let backend = Arc::new(MemoryBackend::new());
    let fs = mount(&backend).await;

    let mut tasks = Vec::new();
    for index in 0..16 {
        let fs = Arc::clone(&fs);
        tasks.push(tokio::spawn(async move {
            let name = format!("file-{index:02}.txt");
            let (entry, fh) = fs
                .create(InodeId::ROOT, &name, 0o644, 1000, 1000)
                .await
                .unwrap();
            fs.write(entry.ino, fh, 0, name.as_bytes()).await.unwrap();
            fs.release(entry.ino, fh).await.unwrap();
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    assert_eq!(backend.keys().len(), 16);
    let entries = fs.readdir(InodeId::ROOT).await.unwrap();
    assert_eq!(entries.len(), 16);
}
