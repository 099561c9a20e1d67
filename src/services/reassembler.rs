//! Rebuilds an asset's files from its staged chunk parts.

use crate::{
    errors::{GatewayError, GatewayResult},
    models::manifest::ManifestEntry,
    services::chunk_store::{ChunkStore, ensure_relative_path_safe, ensure_token_safe},
};
use std::{
    io::{self, ErrorKind, SeekFrom},
    path::PathBuf,
};
use tokio::{
    fs::{self, File, OpenOptions},
    io::{AsyncBufReadExt, AsyncSeekExt, AsyncWriteExt, BufReader},
};
use tracing::{debug, info};

#[derive(Clone, Debug)]
pub struct Reassembler {
    store: ChunkStore,
}

impl Reassembler {
    pub fn new(store: ChunkStore) -> Self {
        Self { store }
    }

    /// Regenerate every file listed in the asset's manifest and return the
    /// root of the reassembled tree.
    ///
    /// Chunk `n` of an entry is written at `chunk_size * (n - 1)`, so parts may
    /// be applied in any order. Each entry's chunk directory is removed once
    /// its file is complete; the manifest goes last. Without a manifest the
    /// call is a no-op. Errors leave partial output in place and keep the
    /// manifest so the next pass can redo the unfinished entries.
    pub async fn reassemble(&self, asset_id: &str) -> GatewayResult<PathBuf> {
        ensure_token_safe("asset id", asset_id)?;
        let files_root = self.store.files_root(asset_id);
        let manifest_path = self.store.manifest_path(asset_id);

        let manifest = match File::open(&manifest_path).await {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!(asset_id, "no manifest, nothing to reassemble");
                return Ok(files_root);
            }
            Err(err) => return Err(GatewayError::Io(err)),
        };

        let mut lines = BufReader::new(manifest).lines();
        let mut rebuilt = 0usize;
        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let entry: ManifestEntry = serde_json::from_str(&line).map_err(|err| {
                GatewayError::Io(io::Error::new(
                    ErrorKind::InvalidData,
                    format!("corrupt manifest line for asset {}: {}", asset_id, err),
                ))
            })?;
            if self.rebuild_entry(asset_id, &entry).await? {
                rebuilt += 1;
            }
        }

        fs::remove_file(&manifest_path).await?;
        match fs::remove_dir_all(self.store.chunks_dir(asset_id)).await {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => return Err(GatewayError::Io(err)),
        }

        info!(asset_id, files = rebuilt, "reassembled asset");
        Ok(files_root)
    }

    /// Returns `false` when the entry was already rebuilt by an earlier pass.
    async fn rebuild_entry(&self, asset_id: &str, entry: &ManifestEntry) -> GatewayResult<bool> {
        ensure_token_safe("chunk identifier", &entry.identifier)?;
        ensure_relative_path_safe(&entry.relative_path)?;
        entry.validate()?;

        let id_dir = self.store.identifier_dir(asset_id, &entry.identifier);
        if !fs::try_exists(&id_dir).await? {
            debug!(asset_id, identifier = %entry.identifier, "entry already reassembled");
            return Ok(false);
        }

        let destination = self.store.files_root(asset_id).join(&entry.relative_path);
        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent).await?;
        }

        // A later entry for the same path replaces the earlier file.
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&destination)
            .await?;
        for chunk_number in 1..=entry.total_chunks {
            let part = self
                .store
                .part_path(asset_id, &entry.identifier, chunk_number);
            let data = fs::read(&part).await?;
            entry.check_part(chunk_number, data.len() as u64)?;
            let offset = entry.offset_of(chunk_number).ok_or_else(|| {
                GatewayError::InvalidInput(format!("chunk {} offset overflows", chunk_number))
            })?;
            file.seek(SeekFrom::Start(offset)).await?;
            file.write_all(&data).await?;
        }
        file.flush().await?;
        file.sync_all().await?;

        fs::remove_dir_all(&id_dir).await?;
        debug!(
            asset_id,
            identifier = %entry.identifier,
            path = %destination.display(),
            chunks = entry.total_chunks,
            "rebuilt file"
        );
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::chunk_store::ChunkUpload;
    use bytes::Bytes;

    fn source(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 % 251) as u8).collect()
    }

    async fn stage(store: &ChunkStore, asset_id: &str, path: &str, data: &[u8], size: usize, order: &[u32]) {
        let total = data.len().div_ceil(size) as u32;
        for &number in order {
            let start = size * (number as usize - 1);
            let end = (start + size).min(data.len());
            let chunk = ChunkUpload {
                identifier: format!("{}-{}", data.len(), path.replace(['/', '.'], "")),
                chunk_number: number,
                total_chunks: total,
                chunk_size: size as u64,
                total_size: data.len() as u64,
                relative_path: path.to_string(),
            };
            store
                .put_chunk(asset_id, &chunk, Bytes::copy_from_slice(&data[start..end]))
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_any_chunk_order_gives_identical_file() {
        let data = source(1000);
        let orders: [&[u32]; 4] = [
            &[1, 2, 3, 4, 5, 6, 7],
            &[7, 6, 5, 4, 3, 2, 1],
            &[4, 1, 7, 2, 6, 3, 5],
            &[2, 3, 4, 5, 6, 7, 1],
        ];
        for order in orders {
            let dir = tempfile::tempdir().unwrap();
            let store = ChunkStore::new(dir.path());
            stage(&store, "a1", "folder/file.bin", &data, 150, order).await;

            let root = Reassembler::new(store.clone()).reassemble("a1").await.unwrap();
            let rebuilt = fs::read(root.join("folder/file.bin")).await.unwrap();
            assert_eq!(rebuilt, data, "order {:?}", order);
        }
    }

    #[tokio::test]
    async fn test_reassemble_cleans_up_and_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = ChunkStore::new(dir.path());
        let data = source(250);
        stage(&store, "a1", "folder/file.bin", &data, 100, &[1, 2, 3]).await;

        let reassembler = Reassembler::new(store.clone());
        let root = reassembler.reassemble("a1").await.unwrap();
        assert!(!fs::try_exists(store.manifest_path("a1")).await.unwrap());
        assert!(!fs::try_exists(store.identifier_dir("a1", "250-folderfilebin")).await.unwrap());

        let again = reassembler.reassemble("a1").await.unwrap();
        assert_eq!(again, root);
        assert_eq!(fs::read(root.join("folder/file.bin")).await.unwrap(), data);
    }

    #[tokio::test]
    async fn test_multiple_files_in_one_asset() {
        let dir = tempfile::tempdir().unwrap();
        let store = ChunkStore::new(dir.path());
        let a = source(300);
        let b = source(42);
        stage(&store, "a1", "site/index.html", &a, 128, &[3, 1, 2]).await;
        stage(&store, "a1", "site/css/app.css", &b, 128, &[1]).await;

        let root = Reassembler::new(store).reassemble("a1").await.unwrap();
        assert_eq!(fs::read(root.join("site/index.html")).await.unwrap(), a);
        assert_eq!(fs::read(root.join("site/css/app.css")).await.unwrap(), b);
    }

    #[tokio::test]
    async fn test_missing_part_fails_and_keeps_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let store = ChunkStore::new(dir.path());
        let data = source(250);
        stage(&store, "a1", "file.bin", &data, 100, &[1, 3]).await;

        let reassembler = Reassembler::new(store.clone());
        assert!(matches!(
            reassembler.reassemble("a1").await,
            Err(GatewayError::Io(_))
        ));
        assert!(fs::try_exists(store.manifest_path("a1")).await.unwrap());

        stage(&store, "a1", "file.bin", &data, 100, &[2]).await;
        let root = reassembler.reassemble("a1").await.unwrap();
        assert_eq!(fs::read(root.join("file.bin")).await.unwrap(), data);
    }

    #[tokio::test]
    async fn test_no_manifest_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let store = ChunkStore::new(dir.path());
        let root = Reassembler::new(store.clone()).reassemble("never").await.unwrap();
        assert_eq!(root, store.files_root("never"));
    }

    #[tokio::test]
    async fn test_oversized_layout_in_manifest_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = ChunkStore::new(dir.path());
        let entry = ManifestEntry {
            identifier: "9-abc".into(),
            relative_path: "abc.bin".into(),
            chunk_size: 1 << 40,
            total_chunks: 3,
            total_size: 9,
        };
        fs::create_dir_all(store.identifier_dir("a1", "9-abc")).await.unwrap();
        for n in 1..=3 {
            fs::write(store.part_path("a1", "9-abc", n), b"abc").await.unwrap();
        }
        let mut line = serde_json::to_vec(&entry).unwrap();
        line.push(b'\n');
        fs::write(store.manifest_path("a1"), line).await.unwrap();

        let result = Reassembler::new(store.clone()).reassemble("a1").await;
        assert!(matches!(result, Err(GatewayError::InvalidInput(_))));
        assert!(!store.files_root("a1").join("abc.bin").exists());
    }

    #[tokio::test]
    async fn test_same_path_reuploaded_keeps_only_latest_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let store = ChunkStore::new(dir.path());
        let long = source(300);
        let short = vec![9u8; 120];
        stage(&store, "a1", "file.bin", &long, 100, &[1, 2, 3]).await;
        stage(&store, "a1", "file.bin", &short, 100, &[1, 2]).await;

        let root = Reassembler::new(store).reassemble("a1").await.unwrap();
        assert_eq!(fs::read(root.join("file.bin")).await.unwrap(), short);
    }
}
