use std::path::{Component, Path, PathBuf};

use super::error::StorageError;

/// One backing file, in torrent order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    /// Path relative to the storage root.
    pub path: PathBuf,
    pub length: u64,
}

impl FileEntry {
    pub fn new(path: impl Into<PathBuf>, length: u64) -> Self {
        Self {
            path: path.into(),
            length,
        }
    }
}

/// A contiguous run of bytes inside a single file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileSpan {
    pub file_index: usize,
    pub file_offset: u64,
    pub length: u64,
}

/// Maps piece-relative offsets onto the backing files.
///
/// The data of a torrent is the concatenation of its files. A table with the
/// starting `(file, offset)` of every piece is computed once, so locating a
/// byte is a direct lookup followed by at most a few steps across file
/// boundaries.
#[derive(Debug, Clone)]
pub struct StorageLayout {
    files: Vec<FileEntry>,
    piece_length: u64,
    total_length: u64,
    hashes: Vec<[u8; 20]>,
    piece_starts: Vec<(usize, u64)>,
}

fn validate_file_path(file_path: &Path) -> Result<(), StorageError> {
    if file_path.as_os_str().is_empty() {
        return Err(StorageError::InvalidLayout("empty file path".into()));
    }
    for component in file_path.components() {
        match component {
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(StorageError::PathTraversal(file_path.display().to_string()));
            }
            _ => {}
        }
    }
    Ok(())
}

impl StorageLayout {
    pub fn new(
        files: Vec<FileEntry>,
        piece_length: u64,
        hashes: Vec<[u8; 20]>,
    ) -> Result<Self, StorageError> {
        if files.is_empty() {
            return Err(StorageError::InvalidLayout("no files".into()));
        }
        if piece_length == 0 {
            return Err(StorageError::InvalidLayout("zero piece length".into()));
        }
        for file in &files {
            validate_file_path(&file.path)?;
        }

        let total_length: u64 = files.iter().map(|f| f.length).sum();
        let expected = total_length.div_ceil(piece_length) as usize;
        if hashes.len() != expected {
            return Err(StorageError::InvalidLayout(format!(
                "{} bytes in {}-byte pieces needs {} hashes, got {}",
                total_length,
                piece_length,
                expected,
                hashes.len()
            )));
        }

        let mut piece_starts = Vec::with_capacity(expected);
        let mut file_index = 0;
        let mut file_start = 0u64;
        for piece in 0..expected as u64 {
            let start = piece * piece_length;
            while start >= file_start + files[file_index].length {
                file_start += files[file_index].length;
                file_index += 1;
            }
            piece_starts.push((file_index, start - file_start));
        }

        Ok(Self {
            files,
            piece_length,
            total_length,
            hashes,
            piece_starts,
        })
    }

    pub fn single_file(
        path: impl Into<PathBuf>,
        length: u64,
        piece_length: u64,
        hashes: Vec<[u8; 20]>,
    ) -> Result<Self, StorageError> {
        Self::new(vec![FileEntry::new(path, length)], piece_length, hashes)
    }

    pub fn files(&self) -> &[FileEntry] {
        &self.files
    }

    pub fn piece_count(&self) -> usize {
        self.hashes.len()
    }

    /// Nominal piece length; only the last piece may be shorter.
    pub fn piece_length(&self) -> u64 {
        self.piece_length
    }

    pub fn total_length(&self) -> u64 {
        self.total_length
    }

    /// Actual size of piece `index`; the last piece holds the remainder.
    pub fn piece_size(&self, index: u32) -> Option<u64> {
        let index = index as u64;
        let start = index.checked_mul(self.piece_length)?;
        (start < self.total_length).then(|| self.piece_length.min(self.total_length - start))
    }

    pub fn piece_hash(&self, index: u32) -> Option<&[u8; 20]> {
        self.hashes.get(index as usize)
    }

    /// Finds the file and in-file offset holding byte `begin` of piece
    /// `index`, or `None` past the end of the data.
    pub fn locate(&self, index: u32, begin: u64) -> Option<(usize, u64)> {
        let &(mut file, mut offset) = self.piece_starts.get(index as usize)?;
        offset += begin;
        while offset >= self.files[file].length {
            offset -= self.files[file].length;
            file += 1;
            if file == self.files.len() {
                return None;
            }
        }
        Some((file, offset))
    }

    /// Splits `length` bytes at `begin` within piece `index` into per-file
    /// spans, in order.
    pub fn spans(&self, index: u32, begin: u32, length: u32) -> Result<Vec<FileSpan>, StorageError> {
        let piece_size = self
            .piece_size(index)
            .ok_or(StorageError::InvalidPieceIndex(index))?;
        if begin as u64 + length as u64 > piece_size {
            return Err(StorageError::InvalidBlock {
                piece: index,
                begin,
                length,
            });
        }
        self.spans_unchecked(index, begin as u64, length as u64)
    }

    pub(crate) fn spans_unchecked(
        &self,
        index: u32,
        begin: u64,
        length: u64,
    ) -> Result<Vec<FileSpan>, StorageError> {
        let mut spans = Vec::new();
        if length == 0 {
            return Ok(spans);
        }

        let (mut file, mut offset) = self
            .locate(index, begin)
            .ok_or(StorageError::InvalidPieceIndex(index))?;
        let mut remaining = length;

        while remaining > 0 {
            let entry = self
                .files
                .get(file)
                .ok_or_else(|| StorageError::InvalidLayout("range runs past last file".into()))?;
            let take = remaining.min(entry.length - offset);
            if take > 0 {
                spans.push(FileSpan {
                    file_index: file,
                    file_offset: offset,
                    length: take,
                });
                remaining -= take;
            }
            file += 1;
            offset = 0;
        }

        Ok(spans)
    }
}
