//! src/services/chunk_store.rs
//!
//! ChunkStore: filesystem staging area for resumable uploads.
//!
//! Layout beneath `base_path/{asset_id}`:
//! - `.chunks/manifest.log` — one JSON `ManifestEntry` per file of the asset
//! - `.chunks/{identifier}/{chunk_number}` — raw chunk parts
//! - `files/{relative_path}` — reassembled files (written by the reassembler)
//! - `asset.tar` — archive handed to the remote store

use crate::{
    errors::{GatewayError, GatewayResult},
    models::manifest::ManifestEntry,
};
use bytes::Bytes;
use std::{
    io::{self, ErrorKind},
    path::{Component, Path, PathBuf},
};
use tokio::{
    fs::{self, File, OpenOptions},
    io::AsyncWriteExt,
};
use tracing::debug;
use uuid::Uuid;

const CHUNKS_DIR: &str = ".chunks";
const MANIFEST_FILE: &str = "manifest.log";
const FILES_DIR: &str = "files";
const ARCHIVE_FILE: &str = "asset.tar";
const MAX_TOKEN_LEN: usize = 255;
const MAX_RELATIVE_PATH_LEN: usize = 1024;

/// Chunk coordinates as announced by the resumable-upload client.
#[derive(Clone, Debug)]
pub struct ChunkUpload {
    pub identifier: String,
    /// 1-based.
    pub chunk_number: u32,
    pub total_chunks: u32,
    /// Nominal chunk size; chunk `n` starts at `chunk_size * (n - 1)`.
    pub chunk_size: u64,
    /// Declared size of the whole file.
    pub total_size: u64,
    pub relative_path: String,
}

impl ChunkUpload {
    /// Manifest line describing the file this chunk belongs to.
    pub fn manifest_entry(&self) -> ManifestEntry {
        ManifestEntry {
            identifier: self.identifier.clone(),
            relative_path: self.relative_path.clone(),
            chunk_size: self.chunk_size,
            total_chunks: self.total_chunks,
            total_size: self.total_size,
        }
    }
}

/// Outcome of a chunk write.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChunkWrite {
    pub bytes_written: u64,
    /// Length of the part this write replaced, when the chunk was re-sent.
    pub previous_len: Option<u64>,
    /// Whether this write registered the file in the manifest.
    pub registered: bool,
}

impl ChunkWrite {
    /// Net change in staged bytes.
    pub fn size_delta(&self) -> i64 {
        self.bytes_written as i64 - self.previous_len.unwrap_or(0) as i64
    }
}

#[derive(Clone, Debug)]
pub struct ChunkStore {
    /// Root of the staging area.
    pub base_path: PathBuf,
}

impl ChunkStore {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    pub fn asset_dir(&self, asset_id: &str) -> PathBuf {
        self.base_path.join(asset_id)
    }

    pub fn chunks_dir(&self, asset_id: &str) -> PathBuf {
        self.asset_dir(asset_id).join(CHUNKS_DIR)
    }

    pub fn identifier_dir(&self, asset_id: &str, identifier: &str) -> PathBuf {
        self.chunks_dir(asset_id).join(identifier)
    }

    pub fn part_path(&self, asset_id: &str, identifier: &str, chunk_number: u32) -> PathBuf {
        self.identifier_dir(asset_id, identifier)
            .join(chunk_number.to_string())
    }

    pub fn manifest_path(&self, asset_id: &str) -> PathBuf {
        self.chunks_dir(asset_id).join(MANIFEST_FILE)
    }

    /// Directory the reassembled file tree of an asset lives in.
    pub fn files_root(&self, asset_id: &str) -> PathBuf {
        self.asset_dir(asset_id).join(FILES_DIR)
    }

    pub fn archive_path(&self, asset_id: &str) -> PathBuf {
        self.asset_dir(asset_id).join(ARCHIVE_FILE)
    }

    /// Write one chunk part.
    ///
    /// The chunk layout must tile the declared file size and the part must
    /// carry exactly the bytes its position requires. The first write for an
    /// identifier (the one that creates its chunk directory) appends the
    /// manifest line, whichever chunk number it carries; later writes must
    /// agree with that line. Parts land through a temp file + rename.
    pub async fn put_chunk(
        &self,
        asset_id: &str,
        chunk: &ChunkUpload,
        data: Bytes,
    ) -> GatewayResult<ChunkWrite> {
        ensure_token_safe("asset id", asset_id)?;
        ensure_token_safe("chunk identifier", &chunk.identifier)?;
        ensure_relative_path_safe(&chunk.relative_path)?;
        let entry = chunk.manifest_entry();
        entry.validate()?;
        entry.check_part(chunk.chunk_number, data.len() as u64)?;

        fs::create_dir_all(self.chunks_dir(asset_id)).await?;
        let id_dir = self.identifier_dir(asset_id, &chunk.identifier);
        let registered = match fs::create_dir(&id_dir).await {
            Ok(()) => true,
            Err(err) if err.kind() == ErrorKind::AlreadyExists => false,
            Err(err) => return Err(GatewayError::Io(err)),
        };
        if registered {
            if let Err(err) = self.append_manifest(asset_id, &entry).await {
                let _ = fs::remove_dir_all(&id_dir).await;
                return Err(err);
            }
            debug!(asset_id, identifier = %chunk.identifier, "registered manifest entry");
        } else if let Some(existing) = self.registered_entry(asset_id, &chunk.identifier).await? {
            if existing != entry {
                return Err(GatewayError::InvalidInput(format!(
                    "chunk layout of `{}` differs from its first chunk",
                    chunk.identifier
                )));
            }
        }

        let part_path = self.part_path(asset_id, &chunk.identifier, chunk.chunk_number);
        let previous_len = match fs::metadata(&part_path).await {
            Ok(meta) => Some(meta.len()),
            Err(err) if err.kind() == ErrorKind::NotFound => None,
            Err(err) => return Err(GatewayError::Io(err)),
        };

        let tmp_path = id_dir.join(format!(".tmp-{}", Uuid::new_v4()));
        if let Err(err) = write_file(&tmp_path, &data).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(GatewayError::Io(err));
        }
        if let Err(err) = fs::rename(&tmp_path, &part_path).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(GatewayError::Io(err));
        }

        Ok(ChunkWrite {
            bytes_written: data.len() as u64,
            previous_len,
            registered,
        })
    }

    /// Whether a chunk part is already on disk.
    pub async fn chunk_exists(
        &self,
        asset_id: &str,
        identifier: &str,
        chunk_number: u32,
    ) -> GatewayResult<bool> {
        ensure_token_safe("asset id", asset_id)?;
        ensure_token_safe("chunk identifier", identifier)?;
        Ok(fs::try_exists(self.part_path(asset_id, identifier, chunk_number)).await?)
    }

    /// Number of parts on disk for one file.
    pub async fn received_chunks(&self, asset_id: &str, identifier: &str) -> GatewayResult<u32> {
        let mut dir = match fs::read_dir(self.identifier_dir(asset_id, identifier)).await {
            Ok(dir) => dir,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(0),
            Err(err) => return Err(GatewayError::Io(err)),
        };
        let mut count = 0;
        while let Some(entry) = dir.next_entry().await? {
            if entry.file_name().to_string_lossy().parse::<u32>().is_ok() {
                count += 1;
            }
        }
        Ok(count)
    }

    /// Drop the whole staging directory of an asset. Missing is fine.
    pub async fn remove_asset(&self, asset_id: &str) -> GatewayResult<()> {
        ensure_token_safe("asset id", asset_id)?;
        match fs::remove_dir_all(self.asset_dir(asset_id)).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(GatewayError::Io(err)),
        }
    }

    /// Manifest line registered for `identifier`, if already written.
    async fn registered_entry(
        &self,
        asset_id: &str,
        identifier: &str,
    ) -> GatewayResult<Option<ManifestEntry>> {
        let raw = match fs::read_to_string(self.manifest_path(asset_id)).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(GatewayError::Io(err)),
        };
        Ok(raw
            .lines()
            .filter_map(|line| serde_json::from_str::<ManifestEntry>(line).ok())
            .find(|entry| entry.identifier == identifier))
    }

    async fn append_manifest(&self, asset_id: &str, entry: &ManifestEntry) -> GatewayResult<()> {
        let mut line = serde_json::to_vec(entry).map_err(io::Error::other)?;
        line.push(b'\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.manifest_path(asset_id))
            .await?;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }
}

async fn write_file(path: &Path, data: &[u8]) -> io::Result<()> {
    let mut file = File::create(path).await?;
    file.write_all(data).await?;
    file.flush().await?;
    file.sync_all().await
}

/// Asset ids and chunk identifiers become single path components.
pub fn ensure_token_safe(kind: &str, value: &str) -> GatewayResult<()> {
    let valid = !value.is_empty()
        && value.len() <= MAX_TOKEN_LEN
        && !value.starts_with('.')
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(GatewayError::InvalidInput(format!("invalid {} `{}`", kind, value)))
    }
}

/// Relative paths must stay inside the asset's file tree.
pub fn ensure_relative_path_safe(path: &str) -> GatewayResult<()> {
    let invalid = || GatewayError::InvalidInput(format!("invalid relative path `{}`", path));
    if path.is_empty() || path.len() > MAX_RELATIVE_PATH_LEN {
        return Err(invalid());
    }
    if path.bytes().any(|b| b.is_ascii_control() || b == b'\\') {
        return Err(invalid());
    }
    let all_normal = Path::new(path)
        .components()
        .all(|c| matches!(c, Component::Normal(_)));
    if !all_normal {
        return Err(invalid());
    }
    Ok(())
}

/// Display name of an asset: the first segment of the uploaded path.
pub fn display_name(relative_path: &str) -> &str {
    relative_path
        .split('/')
        .find(|segment| !segment.is_empty())
        .unwrap_or(relative_path)
}
