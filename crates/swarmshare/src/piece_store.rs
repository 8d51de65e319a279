use bytes::Bytes;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;

/// Geometry of the shared file: how it splits into pieces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PieceLayout {
    file_size: u64,
    piece_size: u32,
}

impl PieceLayout {
    pub fn new(file_size: u64, piece_size: u32) -> Self {
        Self { file_size, piece_size }
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    pub fn piece_size(&self) -> u32 {
        self.piece_size
    }

    /// `ceil(file_size / piece_size)`
    pub fn piece_count(&self) -> usize {
        if self.piece_size == 0 {
            return 0;
        }
        self.file_size.div_ceil(self.piece_size as u64) as usize
    }

    /// Length of piece `index`; only the last piece may be short.
    pub fn piece_len(&self, index: u32) -> Option<usize> {
        let count = self.piece_count();
        let idx = index as usize;
        if idx >= count {
            return None;
        }
        let start = self.offset(index);
        let end = (start + self.piece_size as u64).min(self.file_size);
        Some((end - start) as usize)
    }

    pub fn offset(&self, index: u32) -> u64 {
        index as u64 * self.piece_size as u64
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("file i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("piece store is closed")]
    Closed,
    #[error("piece {index} out of range (piece count {piece_count})")]
    OutOfRange { index: u32, piece_count: usize },
    #[error("piece {index} must be {expected} bytes, got {actual}")]
    Length { index: u32, expected: usize, actual: usize },
    #[error("existing file is {actual} bytes, expected {expected}")]
    SizeMismatch { expected: u64, actual: u64 },
}

/// Random-access piece I/O on the single pre-allocated backing file.
///
/// One file handle is shared by every connection; the lock spans each
/// seek together with its read or write.
#[derive(Debug)]
pub struct PieceStore {
    path: PathBuf,
    layout: PieceLayout,
    file: Mutex<Option<File>>,
}

impl PieceStore {
    /// Open the backing file. A peer that starts with the complete file
    /// must already have it at `path` with the exact size; otherwise the file
    /// is created and pre-allocated.
    pub async fn open(path: impl AsRef<Path>, layout: PieceLayout, has_file: bool) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let file = if has_file {
            let file = OpenOptions::new().read(true).write(true).open(&path).await?;
            let actual = file.metadata().await?.len();
            if actual != layout.file_size() {
                return Err(StoreError::SizeMismatch {
                    expected: layout.file_size(),
                    actual,
                });
            }
            file
        } else {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).await?;
            }
            let file = OpenOptions::new()
                .create(true)
                .truncate(false)
                .read(true)
                .write(true)
                .open(&path)
                .await?;
            file.set_len(layout.file_size()).await?;
            file
        };
        Ok(Self {
            path,
            layout,
            file: Mutex::new(Some(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn layout(&self) -> PieceLayout {
        self.layout
    }

    pub async fn read_piece(&self, index: u32) -> Result<Bytes, StoreError> {
        let len = self.piece_len(index)?;
        let mut guard = self.file.lock().await;
        let file = guard.as_mut().ok_or(StoreError::Closed)?;
        file.seek(SeekFrom::Start(self.layout.offset(index))).await?;
        let mut buf = vec![0u8; len];
        file.read_exact(&mut buf).await?;
        Ok(Bytes::from(buf))
    }

    pub async fn write_piece(&self, index: u32, data: &[u8]) -> Result<(), StoreError> {
        let expected = self.piece_len(index)?;
        if data.len() != expected {
            return Err(StoreError::Length {
                index,
                expected,
                actual: data.len(),
            });
        }
        let mut guard = self.file.lock().await;
        let file = guard.as_mut().ok_or(StoreError::Closed)?;
        file.seek(SeekFrom::Start(self.layout.offset(index))).await?;
        file.write_all(data).await?;
        file.flush().await?;
        Ok(())
    }

    /// Flush and release the file handle. Later reads and writes fail with
    /// [`StoreError::Closed`]. Closing twice is a no-op.
    pub async fn close(&self) -> Result<(), StoreError> {
        let file = self.file.lock().await.take();
        if let Some(file) = file {
            file.sync_all().await?;
        }
        Ok(())
    }

    pub async fn is_closed(&self) -> bool {
        self.file.lock().await.is_none()
    }

    fn piece_len(&self, index: u32) -> Result<usize, StoreError> {
        self.layout.piece_len(index).ok_or(StoreError::OutOfRange {
            index,
            piece_count: self.layout.piece_count(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::RngCore;
    use std::sync::Arc;
    use tempfile::tempdir;

    #[test]
    fn piece_geometry() {
        for (file_size, piece_size) in [(100u64, 64u32), (128, 64), (1, 16), (10_000_232, 32_768)] {
            let layout = PieceLayout::new(file_size, piece_size);
            let count = layout.piece_count();
            assert_eq!(count as u64, file_size.div_ceil(piece_size as u64));
            let last = layout.piece_len(count as u32 - 1).unwrap();
            assert_eq!(last as u64, file_size - piece_size as u64 * (count as u64 - 1));
            assert_eq!(layout.piece_len(count as u32), None);
        }
        assert_eq!(PieceLayout::new(128, 64).piece_len(1), Some(64));
        assert_eq!(PieceLayout::new(100, 64).piece_len(1), Some(36));
    }

    #[tokio::test]
    async fn preallocates_and_roundtrips_pieces() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("peer_1002").join("file.bin");
        let layout = PieceLayout::new(100, 64);
        let store = PieceStore::open(&path, layout, false).await.unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 100);

        let mut data = vec![0u8; 100];
        rand::thread_rng().fill_bytes(&mut data);
        store.write_piece(1, &data[64..]).await.unwrap();
        store.write_piece(0, &data[..64]).await.unwrap();

        assert_eq!(&store.read_piece(0).await.unwrap()[..], &data[..64]);
        assert_eq!(&store.read_piece(1).await.unwrap()[..], &data[64..]);

        store.close().await.unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), data);
    }

    #[tokio::test]
    async fn rejects_bad_pieces() {
        let dir = tempdir().unwrap();
        let store = PieceStore::open(dir.path().join("f"), PieceLayout::new(100, 64), false).await.unwrap();
        assert!(matches!(store.read_piece(2).await, Err(StoreError::OutOfRange { index: 2, .. })));
        assert!(matches!(
            store.write_piece(1, &[0u8; 64]).await,
            Err(StoreError::Length { expected: 36, actual: 64, .. })
        ));
    }

    #[tokio::test]
    async fn complete_file_must_exist_with_exact_size() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("seed.bin");
        let layout = PieceLayout::new(10, 4);
        assert!(matches!(PieceStore::open(&path, layout, true).await, Err(StoreError::Io(_))));

        std::fs::write(&path, b"0123456").unwrap();
        assert!(matches!(
            PieceStore::open(&path, layout, true).await,
            Err(StoreError::SizeMismatch { expected: 10, actual: 7 })
        ));

        std::fs::write(&path, b"0123456789").unwrap();
        let store = PieceStore::open(&path, layout, true).await.unwrap();
        assert_eq!(&store.read_piece(2).await.unwrap()[..], b"89");
    }

    #[tokio::test]
    async fn closed_store_refuses_io() {
        let dir = tempdir().unwrap();
        let store = PieceStore::open(dir.path().join("f"), PieceLayout::new(8, 4), false).await.unwrap();
        store.close().await.unwrap();
        store.close().await.unwrap();
        assert!(store.is_closed().await);
        assert!(matches!(store.read_piece(0).await, Err(StoreError::Closed)));
        assert!(matches!(store.write_piece(0, b"abcd").await, Err(StoreError::Closed)));
    }

    #[tokio::test]
    async fn concurrent_writes_land_at_their_offsets() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("f");
        let layout = PieceLayout::new(16 * 64, 64);
        let store = Arc::new(PieceStore::open(&path, layout, false).await.unwrap());
        let mut tasks = Vec::new();
        for i in 0..16u32 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                store.write_piece(i, &[i as u8; 64]).await.unwrap();
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }
        for i in 0..16u32 {
            assert!(store.read_piece(i).await.unwrap().iter().all(|&b| b == i as u8));
        }
    }
}
