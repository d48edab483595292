//! Index file persistence
//!
//! File layout (little endian):
//!
//! ```text
//! [magic "SITX"][version: u32][crc32 of payload: u32][payload length: u64][bincode payload]
//! ```
//!
//! Trees are finalized by the caller before saving. Loaded leaves keep the
//! ids they were saved with, so descriptors returned from a loaded tree name
//! the same channels the writer used.

use crate::index::{CombinedStorageBranch, TreeNode};
use crate::{Result, StorageError};
use crc32fast::Hasher;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Extension of index files, without the dot
pub const INDEX_FILE_EXTENSION: &str = "sitx";

const MAGIC: &[u8; 4] = b"SITX";
const FORMAT_VERSION: u32 = 1;
const HEADER_LEN: usize = 4 + 4 + 4 + 8;

fn checksum(payload: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(payload);
    hasher.finalize()
}

/// Serialize a tree into the index file format
pub fn encode_tree(node: &TreeNode) -> Result<Vec<u8>> {
    let payload = bincode::serialize(node)?;

    let mut bytes = Vec::with_capacity(HEADER_LEN + payload.len());
    bytes.extend_from_slice(MAGIC);
    bytes.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
    bytes.extend_from_slice(&checksum(&payload).to_le_bytes());
    bytes.extend_from_slice(&(payload.len() as u64).to_le_bytes());
    bytes.extend_from_slice(&payload);
    Ok(bytes)
}

/// Parse bytes in the index file format
pub fn decode_tree(bytes: &[u8]) -> Result<TreeNode> {
    if bytes.len() < HEADER_LEN {
        return Err(StorageError::Corruption(format!(
            "Index file too short: {} bytes, header needs {}",
            bytes.len(),
            HEADER_LEN
        )));
    }

    let (header, payload) = bytes.split_at(HEADER_LEN);
    if &header[0..4] != MAGIC {
        return Err(StorageError::Corruption("Bad index file magic".into()));
    }

    let version = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
    if version != FORMAT_VERSION {
        return Err(StorageError::Corruption(format!(
            "Unsupported index file version {}",
            version
        )));
    }

    let expected_crc = u32::from_le_bytes([header[8], header[9], header[10], header[11]]);
    let mut len_bytes = [0u8; 8];
    len_bytes.copy_from_slice(&header[12..20]);
    let payload_len = u64::from_le_bytes(len_bytes);

    if payload_len != payload.len() as u64 {
        return Err(StorageError::Corruption(format!(
            "Index payload length mismatch: header says {}, found {}",
            payload_len,
            payload.len()
        )));
    }

    let actual_crc = checksum(payload);
    if actual_crc != expected_crc {
        return Err(StorageError::Corruption(format!(
            "Index payload checksum mismatch: expected {:08x}, got {:08x}",
            expected_crc, actual_crc
        )));
    }

    Ok(bincode::deserialize(payload)?)
}

/// Write `node` to `path`.
///
/// Bytes go to a sibling temp file first and are renamed into place after
/// fsync, so readers never see a partial index file.
pub fn save_tree(path: impl AsRef<Path>, node: &TreeNode) -> Result<()> {
    let path = path.as_ref();
    let bytes = encode_tree(node)?;

    let tmp_path = path.with_extension("tmp");
    {
        let file = File::create(&tmp_path)?;
        let mut writer = BufWriter::new(file);
        writer.write_all(&bytes)?;
        writer.flush()?;
        writer.get_ref().sync_all()?;
    }
    fs::rename(&tmp_path, path)?;

    tracing::debug!(path = %path.display(), bytes = bytes.len(), kind = node.kind_name(), "saved index tree");
    Ok(())
}

pub fn load_tree(path: impl AsRef<Path>) -> Result<TreeNode> {
    let path = path.as_ref();
    let bytes = fs::read(path)?;
    decode_tree(&bytes).map_err(|err| {
        tracing::error!(path = %path.display(), error = %err, "failed to load index tree");
        err
    })
}

/// Index files in `dir`, sorted by file name
pub fn index_files(dir: impl AsRef<Path>) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() && path.extension().and_then(|ext| ext.to_str()) == Some(INDEX_FILE_EXTENSION) {
            files.push(path);
        }
    }
    files.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
    Ok(files)
}

/// Load every index file in `dir` into one read-only combined branch
pub fn load_combined(dir: impl AsRef<Path>) -> Result<CombinedStorageBranch> {
    let dir = dir.as_ref();
    let mut combined = CombinedStorageBranch::new();
    for path in index_files(dir)? {
        combined.add_branch(Arc::new(load_tree(&path)?));
    }
    tracing::info!(dir = %dir.display(), trees = combined.len(), "loaded combined index");
    Ok(combined)
}

/// Fresh random file name with the index extension
pub fn random_index_file_name() -> String {
    format!(
        "{:016x}{:016x}.{}",
        rand::random::<u64>(),
        rand::random::<u64>(),
        INDEX_FILE_EXTENSION
    )
}
