//! Packs a reassembled asset tree into a single tar archive.

use crate::errors::{GatewayError, GatewayResult};
use std::{
    fs::File,
    io::{self, BufWriter, Write},
    path::{Path, PathBuf},
};
use tar::{Builder, HeaderMode};
use tracing::debug;
use walkdir::WalkDir;

/// Content type sent alongside the archive.
pub const ARCHIVE_CONTENT_TYPE: &str = "application/x-tar";

/// A finished archive on disk.
#[derive(Clone, Debug)]
pub struct Archive {
    pub path: PathBuf,
    /// Entry the remote store should serve as the collection's index.
    pub index_document: String,
    /// Root-relative entry names in archive order.
    pub entries: Vec<String>,
    pub size: u64,
}

impl Archive {
    /// Delete the archive file. Missing is fine.
    pub async fn remove(&self) -> io::Result<()> {
        match tokio::fs::remove_file(&self.path).await {
            Err(err) if err.kind() != io::ErrorKind::NotFound => Err(err),
            _ => Ok(()),
        }
    }
}

/// Walk `root` (sorted, depth first) and write every regular file into a tar
/// archive at `archive_path`, using root-relative names.
///
/// Fails with `NotFound` if `root` is missing and `InvalidInput` if it holds
/// no files. On any I/O error the half-written archive is removed.
pub async fn build_archive(root: PathBuf, archive_path: PathBuf) -> GatewayResult<Archive> {
    tokio::task::spawn_blocking(move || build_archive_blocking(&root, &archive_path)).await?
}

fn build_archive_blocking(root: &Path, archive_path: &Path) -> GatewayResult<Archive> {
    if !root.is_dir() {
        return Err(GatewayError::NotFound(format!(
            "asset root {}",
            root.display()
        )));
    }

    let files = collect_files(root)?;
    let Some(index_document) = choose_index(&files) else {
        return Err(GatewayError::InvalidInput(format!(
            "asset root {} has no files",
            root.display()
        )));
    };

    match write_archive(archive_path, &files) {
        Ok(size) => {
            debug!(
                archive = %archive_path.display(),
                entries = files.len(),
                size,
                index = %index_document,
                "built archive"
            );
            Ok(Archive {
                path: archive_path.to_path_buf(),
                index_document,
                entries: files.into_iter().map(|(_, name)| name).collect(),
                size,
            })
        }
        Err(err) => {
            let _ = std::fs::remove_file(archive_path);
            Err(GatewayError::Io(err))
        }
    }
}

/// Regular files under `root` as `(absolute, relative)` pairs.
fn collect_files(root: &Path) -> io::Result<Vec<(PathBuf, String)>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(root).min_depth(1).sort_by_file_name() {
        let entry = entry.map_err(io::Error::from)?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(root)
            .map_err(io::Error::other)?
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join("/");
        files.push((entry.into_path(), relative));
    }
    Ok(files)
}

/// First top-level file, otherwise the first file of the first top-level
/// directory.
fn choose_index(files: &[(PathBuf, String)]) -> Option<String> {
    files
        .iter()
        .find(|(_, name)| !name.contains('/'))
        .or_else(|| files.first())
        .map(|(_, name)| name.clone())
}

fn write_archive(archive_path: &Path, files: &[(PathBuf, String)]) -> io::Result<u64> {
    let file = File::create(archive_path)?;
    let mut builder = Builder::new(BufWriter::new(file));
    builder.mode(HeaderMode::Deterministic);
    for (path, name) in files {
        builder.append_path_with_name(path, name)?;
    }
    let mut writer = builder.into_inner()?;
    writer.flush()?;
    let file = writer.into_inner().map_err(|err| err.into_error())?;
    file.sync_all()?;
    Ok(file.metadata()?.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(root: &Path, name: &str, data: &[u8]) {
        let path = root.join(name);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, data).unwrap();
    }

    fn read_entries(path: &Path) -> Vec<(String, u64)> {
        let mut archive = tar::Archive::new(File::open(path).unwrap());
        archive
            .entries()
            .unwrap()
            .map(|entry| {
                let entry = entry.unwrap();
                (
                    entry.path().unwrap().to_string_lossy().into_owned(),
                    entry.header().size().unwrap(),
                )
            })
            .collect()
    }

    #[tokio::test]
    async fn test_archive_layout_is_sorted_and_relative() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("files");
        write(&root, "site/b.txt", b"bb");
        write(&root, "site/a.txt", b"a");
        write(&root, "site/css/app.css", b"body{}");
        std::fs::create_dir_all(root.join("site/empty")).unwrap();

        let archive = build_archive(root, dir.path().join("asset.tar"))
            .await
            .unwrap();
        assert_eq!(
            archive.entries,
            vec!["site/a.txt", "site/b.txt", "site/css/app.css"]
        );
        assert_eq!(archive.index_document, "site/a.txt");
        assert_eq!(
            read_entries(&archive.path),
            vec![
                ("site/a.txt".to_string(), 1),
                ("site/b.txt".to_string(), 2),
                ("site/css/app.css".to_string(), 6),
            ]
        );
    }

    #[tokio::test]
    async fn test_top_level_file_wins_index() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("files");
        write(&root, "assets/logo.png", b"png");
        write(&root, "index.html", b"<html>");

        let archive = build_archive(root, dir.path().join("asset.tar"))
            .await
            .unwrap();
        assert_eq!(archive.index_document, "index.html");
    }

    #[tokio::test]
    async fn test_archives_are_reproducible() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("files");
        write(&root, "folder/file.bin", &[7u8; 250]);

        let first = build_archive(root.clone(), dir.path().join("one.tar"))
            .await
            .unwrap();
        let second = build_archive(root, dir.path().join("two.tar")).await.unwrap();
        assert_eq!(
            std::fs::read(first.path).unwrap(),
            std::fs::read(second.path).unwrap()
        );
    }

    #[tokio::test]
    async fn test_missing_root_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let result = build_archive(dir.path().join("nope"), dir.path().join("asset.tar")).await;
        assert!(matches!(result, Err(GatewayError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_empty_root_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("files");
        std::fs::create_dir_all(root.join("only/dirs")).unwrap();
        let result = build_archive(root, dir.path().join("asset.tar")).await;
        assert!(matches!(result, Err(GatewayError::InvalidInput(_))));
        assert!(!dir.path().join("asset.tar").exists());
    }
}
