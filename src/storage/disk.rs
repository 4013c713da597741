use std::io::{ErrorKind, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::RwLock;
use sha1::{Digest, Sha1};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex as TokioMutex;

use super::error::StorageError;
use super::layout::{FileSpan, StorageLayout};
use crate::peer::Bitfield;

const VERIFY_BATCH: usize = 32;

struct OpenFile {
    file: File,
    writable: bool,
}

/// Lock guarding every access to one path, holding the cached handle.
type FileSlot = Arc<TokioMutex<Option<OpenFile>>>;

/// Piece-addressed access to a torrent's files.
///
/// Each path gets its own lock the first time it is touched; the lock table
/// only grows. Files are opened lazily and kept open. A write to a path that
/// does not exist creates it (and its directories) only when the storage was
/// built with `create` set; reads never create anything.
///
/// The storage also owns the bitfield of verified pieces. A bit is set only
/// by a successful [`verify`](Self::verify).
pub struct PieceStorage {
    root: PathBuf,
    layout: StorageLayout,
    create: bool,
    locks: DashMap<PathBuf, FileSlot>,
    verified: RwLock<Bitfield>,
}

impl PieceStorage {
    pub fn new(root: impl Into<PathBuf>, layout: StorageLayout, create: bool) -> Self {
        let verified = RwLock::new(Bitfield::new(layout.piece_count()));
        Self {
            root: root.into(),
            layout,
            create,
            locks: DashMap::new(),
            verified,
        }
    }

    /// Builds the storage and checks every piece already on disk.
    pub async fn open(root: impl Into<PathBuf>, layout: StorageLayout, create: bool) -> Self {
        let storage = Self::new(root, layout, create);
        let found = storage.verify_all().await;
        tracing::info!(
            "found {}/{} pieces on disk under {}",
            found,
            storage.layout.piece_count(),
            storage.root.display()
        );
        storage
    }

    pub fn layout(&self) -> &StorageLayout {
        &self.layout
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Snapshot of the verified pieces.
    pub fn bitfield(&self) -> Bitfield {
        self.verified.read().clone()
    }

    pub fn has_piece(&self, index: u32) -> bool {
        self.verified.read().has(index as usize)
    }

    pub fn is_complete(&self) -> bool {
        self.verified.read().is_complete()
    }

    /// Bytes still missing: total length minus every verified piece.
    pub fn data_left(&self) -> u64 {
        let verified = self.verified.read();
        let have: u64 = verified
            .iter_set()
            .filter_map(|i| self.layout.piece_size(i as u32))
            .sum();
        self.layout.total_length() - have
    }

    pub async fn read(&self, index: u32, begin: u32, length: u32) -> Result<Bytes, StorageError> {
        let spans = self.layout.spans(index, begin, length)?;
        self.read_spans(&spans, length as usize).await
    }

    pub async fn write(&self, index: u32, begin: u32, data: &[u8]) -> Result<(), StorageError> {
        let length = u32::try_from(data.len()).map_err(|_| StorageError::InvalidBlock {
            piece: index,
            begin,
            length: u32::MAX,
        })?;
        let spans = self.layout.spans(index, begin, length)?;

        let mut written = 0usize;
        for span in spans {
            let path = self.file_path(span.file_index);
            let slot = self.slot(&path);
            let mut guard = slot.lock().await;
            let file = self.open_file(&mut guard, &path, span.file_index, true).await?;
            file.seek(SeekFrom::Start(span.file_offset)).await?;

            let end = written + span.length as usize;
            file.write_all(&data[written..end]).await?;
            written = end;
        }
        Ok(())
    }

    /// Hashes piece `index` and records the outcome in the bitfield.
    ///
    /// A piece whose files are missing or too short is simply not verified.
    pub async fn verify(&self, index: u32) -> Result<bool, StorageError> {
        let size = self
            .layout
            .piece_size(index)
            .ok_or(StorageError::InvalidPieceIndex(index))?;
        let expected = *self
            .layout
            .piece_hash(index)
            .ok_or(StorageError::InvalidPieceIndex(index))?;

        let spans = self.layout.spans_unchecked(index, 0, size)?;
        let data = match self.read_spans(&spans, size as usize).await {
            Ok(data) => data,
            Err(e) if e.is_missing_data() => {
                self.verified.write().clear(index as usize);
                return Ok(false);
            }
            Err(e) => return Err(e),
        };

        let matches = tokio::task::spawn_blocking(move || Sha1::digest(&data)[..] == expected[..])
            .await
            .map_err(|e| StorageError::Io(std::io::Error::other(e)))?;

        let mut verified = self.verified.write();
        if matches {
            verified.set(index as usize);
        } else {
            verified.clear(index as usize);
        }
        Ok(matches)
    }

    /// Verifies every piece, returning how many passed.
    pub async fn verify_all(&self) -> usize {
        let piece_count = self.layout.piece_count();
        let mut found = 0usize;

        for batch_start in (0..piece_count).step_by(VERIFY_BATCH) {
            let batch_end = (batch_start + VERIFY_BATCH).min(piece_count);
            let checks = (batch_start..batch_end).map(|i| self.verify(i as u32));

            for (i, result) in futures::future::join_all(checks).await.into_iter().enumerate() {
                match result {
                    Ok(true) => found += 1,
                    Ok(false) => {}
                    Err(e) => {
                        tracing::warn!("piece {} check failed: {}", batch_start + i, e);
                    }
                }
            }

            if piece_count > 100 && batch_end % 320 == 0 {
                tracing::debug!("checked {}/{} pieces ({} present)", batch_end, piece_count, found);
            }
        }

        found
    }

    async fn read_spans(&self, spans: &[FileSpan], length: usize) -> Result<Bytes, StorageError> {
        let mut data = vec![0u8; length];
        let mut filled = 0usize;

        for span in spans {
            let path = self.file_path(span.file_index);
            let slot = self.slot(&path);
            let mut guard = slot.lock().await;
            let file = self.open_file(&mut guard, &path, span.file_index, false).await?;
            file.seek(SeekFrom::Start(span.file_offset)).await?;

            let end = filled + span.length as usize;
            file.read_exact(&mut data[filled..end]).await?;
            filled = end;
        }

        Ok(Bytes::from(data))
    }

    fn file_path(&self, file_index: usize) -> PathBuf {
        self.root.join(&self.layout.files()[file_index].path)
    }

    fn slot(&self, path: &Path) -> FileSlot {
        self.locks.entry(path.to_path_buf()).or_default().value().clone()
    }

    /// Returns the cached handle for `path`, (re)opening it when there is none
    /// or a write needs a writable one. Must be called with the path's lock
    /// held.
    async fn open_file<'a>(
        &self,
        slot: &'a mut Option<OpenFile>,
        path: &Path,
        file_index: usize,
        write: bool,
    ) -> Result<&'a mut File, StorageError> {
        let open = match slot.take() {
            Some(open) if open.writable || !write => open,
            _ => self.open_path(path, file_index, write).await?,
        };
        Ok(&mut slot.insert(open).file)
    }

    async fn open_path(
        &self,
        path: &Path,
        file_index: usize,
        write: bool,
    ) -> Result<OpenFile, StorageError> {
        let opened = if write {
            OpenOptions::new().read(true).write(true).open(path).await
        } else {
            File::open(path).await
        };

        match opened {
            Ok(file) => Ok(OpenFile {
                file,
                writable: write,
            }),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                if !(write && self.create) {
                    return Err(StorageError::FileMissing(path.to_path_buf()));
                }
                if let Some(parent) = path.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                let file = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .truncate(false)
                    .open(path)
                    .await?;
                file.set_len(self.layout.files()[file_index].length).await?;
                tracing::debug!("created {}", path.display());
                Ok(OpenFile {
                    file,
                    writable: true,
                })
            }
            Err(e) => Err(e.into()),
        }
    }
}

impl std::fmt::Debug for PieceStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PieceStorage")
            .field("root", &self.root)
            .field("pieces", &self.layout.piece_count())
            .field("create", &self.create)
            .finish()
    }
}
