//! Part-file storage
//!
//! A torrent's payload is staged in a single `<name>.part` stream file in
//! which every verified piece sits at its final offset. The part suffix is
//! the on-disk marker for an incomplete download; completion materializes
//! the torrent's real file layout and removes the marker.
//!
//! The engine writes here once per verified piece, never per block, and
//! reads back through [`PartFile::read`] for the streaming consumer.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;

use crate::error::{EngineError, Result, StorageErrorKind};

/// One destination file within the torrent's concatenated stream.
#[derive(Debug, Clone)]
pub struct FileSpan {
    /// Path relative to the download directory
    pub path: PathBuf,
    /// File size in bytes
    pub length: u64,
}

/// Chunked staging file for an in-progress torrent.
pub struct PartFile {
    dir: PathBuf,
    part_path: PathBuf,
    piece_length: u64,
    total_size: u64,
    files: Vec<FileSpan>,
    handle: Mutex<Option<File>>,
}

impl PartFile {
    /// Creates (or reopens) the staging file for a torrent.
    ///
    /// `files` paths are relative to `dir`; each component is validated
    /// against traversal before anything touches the filesystem.
    pub async fn create(
        dir: impl Into<PathBuf>,
        name: &str,
        piece_length: u64,
        total_size: u64,
        files: Vec<FileSpan>,
    ) -> Result<Self> {
        let dir = dir.into();
        for component in Path::new(name).components() {
            validate_path_component(&component)?;
        }
        for span in &files {
            for component in span.path.components() {
                validate_path_component(&component)?;
            }
        }

        let span_total: u64 = files.iter().map(|f| f.length).sum();
        if span_total != total_size {
            return Err(EngineError::storage(
                StorageErrorKind::Io,
                &dir,
                format!(
                    "file spans cover {} bytes but torrent is {} bytes",
                    span_total, total_size
                ),
            ));
        }

        tokio::fs::create_dir_all(&dir).await?;
        let part_path = dir.join(format!("{}.part", name));

        Ok(Self {
            dir,
            part_path,
            piece_length,
            total_size,
            files,
            handle: Mutex::new(None),
        })
    }

    /// Path of the staging file.
    pub fn part_path(&self) -> &Path {
        &self.part_path
    }

    async fn open(&self) -> Result<File> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.part_path)
            .await
            .map_err(|e| {
                EngineError::storage(StorageErrorKind::Io, &self.part_path, e.to_string())
            })?;
        Ok(file)
    }

    /// Writes a verified piece at its final offset.
    ///
    /// Boundary pieces are simply shorter than `piece_length`; the offset
    /// math is identical.
    pub async fn write_piece(&self, index: u32, data: &[u8]) -> Result<()> {
        let offset = index as u64 * self.piece_length;
        let end = offset + data.len() as u64;
        if end > self.total_size {
            return Err(EngineError::storage(
                StorageErrorKind::Io,
                &self.part_path,
                format!(
                    "piece {} ({} bytes at offset {}) exceeds torrent size {}",
                    index,
                    data.len(),
                    offset,
                    self.total_size
                ),
            ));
        }

        let mut guard = self.handle.lock().await;
        if guard.is_none() {
            *guard = Some(self.open().await?);
        }
        let file = guard.as_mut().unwrap();
        file.seek(SeekFrom::Start(offset)).await?;
        file.write_all(data).await?;
        file.flush().await?;
        Ok(())
    }

    /// Reads `len` bytes of payload starting at stream position `pos`.
    pub async fn read(&self, pos: u64, len: usize) -> Result<Vec<u8>> {
        if pos + len as u64 > self.total_size {
            return Err(EngineError::storage(
                StorageErrorKind::Io,
                &self.part_path,
                format!("read of {} bytes at {} past end", len, pos),
            ));
        }

        let mut guard = self.handle.lock().await;
        if guard.is_none() {
            *guard = Some(self.open().await?);
        }
        let file = guard.as_mut().unwrap();
        file.seek(SeekFrom::Start(pos)).await?;
        let mut buf = vec![0u8; len];
        file.read_exact(&mut buf).await?;
        Ok(buf)
    }

    /// Materializes the torrent's final file layout from the staging file
    /// and removes the part marker.
    ///
    /// Single-file torrents are a rename; multi-file torrents split the
    /// stream into each destination file.
    pub async fn create_final_file(&self) -> Result<()> {
        // Drop any open handle so the rename path is clean on all platforms.
        {
            let mut guard = self.handle.lock().await;
            *guard = None;
        }

        if self.files.len() == 1 {
            let dest = self.dir.join(&self.files[0].path);
            if let Some(parent) = dest.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::rename(&self.part_path, &dest).await.map_err(|e| {
                EngineError::storage(StorageErrorKind::Io, &dest, e.to_string())
            })?;
            return Ok(());
        }

        let mut source = File::open(&self.part_path).await.map_err(|e| {
            EngineError::storage(StorageErrorKind::Io, &self.part_path, e.to_string())
        })?;

        for span in &self.files {
            let dest = self.dir.join(&span.path);
            if let Some(parent) = dest.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let mut out = File::create(&dest)
                .await
                .map_err(|e| EngineError::storage(StorageErrorKind::Io, &dest, e.to_string()))?;

            let mut remaining = span.length;
            let mut buf = vec![0u8; 64 * 1024];
            while remaining > 0 {
                let take = remaining.min(buf.len() as u64) as usize;
                source.read_exact(&mut buf[..take]).await?;
                out.write_all(&buf[..take]).await?;
                remaining -= take as u64;
            }
            out.flush().await?;
        }

        tokio::fs::remove_file(&self.part_path).await.ok();
        Ok(())
    }

    /// Removes the staging file.
    pub async fn dispose(&self) -> Result<()> {
        {
            let mut guard = self.handle.lock().await;
            *guard = None;
        }
        match tokio::fs::remove_file(&self.part_path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(EngineError::storage(
                StorageErrorKind::Io,
                &self.part_path,
                e.to_string(),
            )),
        }
    }
}

/// Reject path components that could escape the download directory.
fn validate_path_component(component: &std::path::Component) -> Result<()> {
    use std::path::Component;
    match component {
        Component::ParentDir => Err(EngineError::storage(
            StorageErrorKind::PathTraversal,
            PathBuf::new(),
            "file path contains parent directory reference (..)",
        )),
        Component::RootDir | Component::Prefix(_) => Err(EngineError::storage(
            StorageErrorKind::PathTraversal,
            PathBuf::new(),
            "file path contains absolute path",
        )),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spans(entries: &[(&str, u64)]) -> Vec<FileSpan> {
        entries
            .iter()
            .map(|(path, length)| FileSpan {
                path: PathBuf::from(path),
                length: *length,
            })
            .collect()
    }

    #[tokio::test]
    async fn write_read_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let part = PartFile::create(dir.path(), "test", 8, 20, spans(&[("test.bin", 20)]))
            .await
            .unwrap();

        part.write_piece(0, &[1u8; 8]).await.unwrap();
        part.write_piece(1, &[2u8; 8]).await.unwrap();
        part.write_piece(2, &[3u8; 4]).await.unwrap(); // short last piece

        let data = part.read(6, 4).await.unwrap();
        assert_eq!(data, vec![1, 1, 2, 2]);
        let tail = part.read(16, 4).await.unwrap();
        assert_eq!(tail, vec![3, 3, 3, 3]);
    }

    #[tokio::test]
    async fn out_of_bounds_writes_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let part = PartFile::create(dir.path(), "test", 8, 10, spans(&[("test.bin", 10)]))
            .await
            .unwrap();

        assert!(part.write_piece(1, &[0u8; 8]).await.is_err());
        assert!(part.read(8, 4).await.is_err());
    }

    #[tokio::test]
    async fn single_file_finalize_renames() {
        let dir = tempfile::tempdir().unwrap();
        let part = PartFile::create(dir.path(), "movie", 4, 8, spans(&[("movie.mkv", 8)]))
            .await
            .unwrap();

        part.write_piece(0, b"abcd").await.unwrap();
        part.write_piece(1, b"efgh").await.unwrap();
        part.create_final_file().await.unwrap();

        assert!(!part.part_path().exists());
        let data = tokio::fs::read(dir.path().join("movie.mkv")).await.unwrap();
        assert_eq!(data, b"abcdefgh");
    }

    #[tokio::test]
    async fn multi_file_finalize_splits_the_stream() {
        let dir = tempfile::tempdir().unwrap();
        let part = PartFile::create(
            dir.path(),
            "album",
            4,
            10,
            spans(&[("album/a.txt", 6), ("album/b.txt", 4)]),
        )
        .await
        .unwrap();

        part.write_piece(0, b"aaaa").await.unwrap();
        part.write_piece(1, b"aabb").await.unwrap();
        part.write_piece(2, b"bb").await.unwrap();
        part.create_final_file().await.unwrap();

        let a = tokio::fs::read(dir.path().join("album/a.txt")).await.unwrap();
        let b = tokio::fs::read(dir.path().join("album/b.txt")).await.unwrap();
        assert_eq!(a, b"aaaaaa");
        assert_eq!(b, b"bbbb");
    }

    #[tokio::test]
    async fn traversal_components_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let result = PartFile::create(
            dir.path(),
            "evil",
            4,
            4,
            spans(&[("../escape.txt", 4)]),
        )
        .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn dispose_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let part = PartFile::create(dir.path(), "gone", 4, 4, spans(&[("gone.bin", 4)]))
            .await
            .unwrap();
        part.write_piece(0, b"data").await.unwrap();
        part.dispose().await.unwrap();
        part.dispose().await.unwrap();
        assert!(!part.part_path().exists());
    }
}
