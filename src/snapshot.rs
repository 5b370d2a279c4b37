//! Database snapshots
//!
//! A snapshot is the full database image taken with SQLite's online backup,
//! optionally gzip compressed, with a SHA-256 checksum of the uncompressed
//! image. Restoring auto-detects compression from the gzip magic bytes.
//!
//! Durable storage of the bytes is somebody else's job: the catalog hands each
//! snapshot to a [`SnapshotSink`].

use crate::error::{Error, Result};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use parking_lot::Mutex;
use rusqlite::backup::Progress;
use rusqlite::{Connection, DatabaseName};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::{Read, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{debug, info};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Snapshot metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    pub snapshot_id: String,
    /// RFC 3339 creation time
    pub created_at: String,
    pub resource_count: usize,
    pub compressed: bool,
    /// Hex SHA-256 of the uncompressed database image
    pub checksum: String,
    /// Length of the uncompressed image
    pub size_bytes: usize,
}

#[derive(Debug, Clone)]
pub struct Snapshot {
    pub bytes: Vec<u8>,
    pub metadata: SnapshotMetadata,
}

/// External durable store for snapshots
pub trait SnapshotSink: Send + Sync {
    fn store(&self, snapshot: &Snapshot) -> Result<()>;
}

/// Sink keeping the latest snapshot in memory
#[derive(Debug, Default)]
pub struct MemorySink {
    latest: Mutex<Option<Snapshot>>,
    flushes: AtomicUsize,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn latest(&self) -> Option<Snapshot> {
        self.latest.lock().clone()
    }

    /// Number of snapshots stored so far
    pub fn flush_count(&self) -> usize {
        self.flushes.load(Ordering::SeqCst)
    }
}

impl SnapshotSink for MemorySink {
    fn store(&self, snapshot: &Snapshot) -> Result<()> {
        *self.latest.lock() = Some(snapshot.clone());
        self.flushes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Take a snapshot of the main database
pub fn export_snapshot(conn: &Connection, compress: bool) -> Result<Snapshot> {
    let staging = tempfile::tempdir()?;
    let path = staging.path().join("catalog.sqlite");
    conn.backup(DatabaseName::Main, &path, None)?;
    let image = std::fs::read(&path)?;

    let resource_count: i64 = conn.query_row("SELECT COUNT(*) FROM resources", [], |row| row.get(0))?;
    let checksum = calculate_checksum(&image);
    let size_bytes = image.len();
    let bytes = if compress { compress_data(&image)? } else { image };

    let metadata = SnapshotMetadata {
        snapshot_id: generate_snapshot_id(),
        created_at: chrono::Utc::now().to_rfc3339(),
        resource_count: resource_count as usize,
        compressed: compress,
        checksum,
        size_bytes,
    };
    debug!(
        snapshot_id = %metadata.snapshot_id,
        resources = metadata.resource_count,
        bytes = bytes.len(),
        "exported snapshot"
    );

    Ok(Snapshot { bytes, metadata })
}

/// Uncompressed database image from snapshot bytes
///
/// With an expected checksum, a mismatch is an error.
pub fn decode_snapshot(bytes: &[u8], expected_checksum: Option<&str>) -> Result<Vec<u8>> {
    let image = if is_gzip(bytes) {
        decompress_data(bytes)?
    } else {
        bytes.to_vec()
    };

    if let Some(expected) = expected_checksum {
        let actual = calculate_checksum(&image);
        if !actual.eq_ignore_ascii_case(expected) {
            return Err(Error::Snapshot(format!(
                "checksum mismatch: expected {}, got {}",
                expected, actual
            )));
        }
    }
    Ok(image)
}

/// Open a fresh in-memory connection holding the snapshot's database
pub fn restore_connection(bytes: &[u8], expected_checksum: Option<&str>) -> Result<Connection> {
    let image = decode_snapshot(bytes, expected_checksum)?;

    let mut staged = tempfile::NamedTempFile::new()?;
    staged.write_all(&image)?;
    staged.flush()?;

    let mut conn = Connection::open_in_memory()?;
    conn.restore(DatabaseName::Main, staged.path(), None::<fn(Progress)>)?;

    let status: String = conn.query_row("PRAGMA quick_check", [], |row| row.get(0))?;
    if status != "ok" {
        return Err(Error::Snapshot(format!("restored database failed check: {}", status)));
    }

    info!(bytes = image.len(), "restored database from snapshot");
    Ok(conn)
}

pub fn is_gzip(bytes: &[u8]) -> bool {
    bytes.starts_with(&GZIP_MAGIC)
}

fn generate_snapshot_id() -> String {
    format!(
        "snapshot_{}_{:08x}",
        chrono::Utc::now().format("%Y%m%dT%H%M%S"),
        rand::random::<u32>()
    )
}

fn calculate_checksum(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

fn compress_data(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

fn decompress_data(data: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(data);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|e| Error::Snapshot(format!("decompression failed: {}", e)))?;
    Ok(out)
}
