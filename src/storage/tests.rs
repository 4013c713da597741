use super::*;
use crate::constants::BLOCK_SIZE;
use crate::peer::Bitfield;
use sha1::{Digest, Sha1};
use tempfile::TempDir;

fn sha1(data: &[u8]) -> [u8; 20] {
    let mut out = [0u8; 20];
    out.copy_from_slice(&Sha1::digest(data));
    out
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 % 251) as u8).collect()
}

/// Layout over `data` split into the given files, with real piece hashes.
fn layout_for(data: &[u8], files: &[(&str, u64)], piece_length: u64) -> StorageLayout {
    let hashes = data.chunks(piece_length as usize).map(sha1).collect();
    let files = files
        .iter()
        .map(|&(path, length)| FileEntry::new(path, length))
        .collect();
    StorageLayout::new(files, piece_length, hashes).unwrap()
}

#[test]
fn test_locate_maps_every_offset() {
    let lengths = [3u64, 0, 10, 7, 1];
    let total: u64 = lengths.iter().sum();
    let files = lengths
        .iter()
        .enumerate()
        .map(|(i, &len)| FileEntry::new(format!("f{i}"), len))
        .collect();
    let piece_length = 4;
    let layout = StorageLayout::new(files, piece_length, vec![[0; 20]; 6]).unwrap();

    for offset in 0..total {
        let index = (offset / piece_length) as u32;
        let (file, file_offset) = layout.locate(index, offset % piece_length).unwrap();
        let before: u64 = lengths[..file].iter().sum();
        assert!(file_offset < lengths[file], "offset {offset}");
        assert_eq!(before + file_offset, offset);
    }
    assert_eq!(layout.locate(5, 1), None);
}

#[test]
fn test_spans_cross_file_boundaries() {
    let files = vec![
        FileEntry::new("a", 5),
        FileEntry::new("empty", 0),
        FileEntry::new("b", 3),
        FileEntry::new("c", 8),
    ];
    let layout = StorageLayout::new(files, 10, vec![[0; 20]; 2]).unwrap();

    let spans = layout.spans(0, 3, 7).unwrap();
    assert_eq!(
        spans,
        vec![
            FileSpan {
                file_index: 0,
                file_offset: 3,
                length: 2
            },
            FileSpan {
                file_index: 2,
                file_offset: 0,
                length: 3
            },
            FileSpan {
                file_index: 3,
                file_offset: 0,
                length: 2
            },
        ]
    );

    assert_eq!(layout.piece_size(1), Some(6));
    assert!(matches!(
        layout.spans(1, 4, 3),
        Err(StorageError::InvalidBlock { piece: 1, .. })
    ));
    assert!(matches!(
        layout.spans(2, 0, 1),
        Err(StorageError::InvalidPieceIndex(2))
    ));
}

#[test]
fn test_layout_rejects_bad_input() {
    assert!(matches!(
        StorageLayout::single_file("../escape", 10, 10, vec![[0; 20]]),
        Err(StorageError::PathTraversal(_))
    ));
    assert!(matches!(
        StorageLayout::single_file("/abs", 10, 10, vec![[0; 20]]),
        Err(StorageError::PathTraversal(_))
    ));
    assert!(matches!(
        StorageLayout::single_file("ok", 10, 4, vec![[0; 20]; 2]),
        Err(StorageError::InvalidLayout(_))
    ));
    assert!(matches!(
        StorageLayout::single_file("ok", 10, 0, vec![]),
        Err(StorageError::InvalidLayout(_))
    ));
}

#[tokio::test]
async fn test_write_read_verify_multifile() {
    let temp = TempDir::new().unwrap();
    let data = pattern(100);
    let layout = layout_for(&data, &[("dir/one", 30), ("two", 45), ("dir/sub/three", 25)], 32);
    let storage = PieceStorage::new(temp.path(), layout, true);

    assert_eq!(storage.data_left(), 100);
    for index in 0..4u32 {
        let start = index as usize * 32;
        let end = (start + 32).min(100);
        storage.write(index, 0, &data[start..end]).await.unwrap();
    }
    assert_eq!(storage.data_left(), 100);

    for index in 0..4 {
        assert!(storage.verify(index).await.unwrap());
    }
    assert!(storage.is_complete());
    assert_eq!(storage.data_left(), 0);

    let block = storage.read(0, 28, 4).await.unwrap();
    assert_eq!(block.as_ref(), &data[28..32]);

    let on_disk = std::fs::read(temp.path().join("two")).unwrap();
    assert_eq!(on_disk, &data[30..75]);
}

#[tokio::test]
async fn test_flipped_byte_fails_verification() {
    let temp = TempDir::new().unwrap();
    let data = pattern(64);
    let layout = layout_for(&data, &[("file", 64)], 32);
    let storage = PieceStorage::new(temp.path(), layout, true);

    storage.write(0, 0, &data[..32]).await.unwrap();
    assert!(storage.verify(0).await.unwrap());
    assert!(storage.has_piece(0));

    storage.write(0, 5, &[data[5] ^ 0x01]).await.unwrap();
    assert!(!storage.verify(0).await.unwrap());
    assert!(!storage.has_piece(0));
    assert_eq!(storage.data_left(), 64);
}

#[tokio::test]
async fn test_missing_file_without_create() {
    let temp = TempDir::new().unwrap();
    let data = pattern(40);
    let layout = layout_for(&data, &[("absent", 40)], 20);
    let storage = PieceStorage::new(temp.path(), layout, false);

    assert!(matches!(
        storage.write(0, 0, &data[..20]).await,
        Err(StorageError::FileMissing(_))
    ));
    assert!(matches!(
        storage.read(0, 0, 20).await,
        Err(StorageError::FileMissing(_))
    ));
    assert!(!storage.verify(0).await.unwrap());
    assert!(!temp.path().join("absent").exists());
}

#[tokio::test]
async fn test_reads_never_create() {
    let temp = TempDir::new().unwrap();
    let data = pattern(40);
    let layout = layout_for(&data, &[("lazy", 40)], 20);
    let storage = PieceStorage::new(temp.path(), layout, true);

    assert!(storage.read(1, 0, 20).await.is_err());
    assert!(!temp.path().join("lazy").exists());

    storage.write(1, 0, &data[20..]).await.unwrap();
    let meta = std::fs::metadata(temp.path().join("lazy")).unwrap();
    assert_eq!(meta.len(), 40);
}

#[tokio::test]
async fn test_open_finds_existing_pieces() {
    let temp = TempDir::new().unwrap();
    let data = pattern(50);
    let mut partial = data.clone();
    partial[45] ^= 0xFF;
    std::fs::write(temp.path().join("seed"), &partial).unwrap();

    let layout = layout_for(&data, &[("seed", 50)], 16);
    let storage = PieceStorage::open(temp.path(), layout, false).await;

    let have = storage.bitfield();
    assert_eq!(have.iter_set().collect::<Vec<_>>(), vec![0, 1, 3]);
    assert_eq!(storage.data_left(), 16);
}

#[tokio::test]
async fn test_short_file_is_unverified() {
    let temp = TempDir::new().unwrap();
    let data = pattern(50);
    std::fs::write(temp.path().join("short"), &data[..20]).unwrap();

    let layout = layout_for(&data, &[("short", 50)], 16);
    let storage = PieceStorage::new(temp.path(), layout, false);
    assert!(storage.verify(0).await.unwrap());
    assert!(!storage.verify(1).await.unwrap());
}

#[test]
fn test_progress_blocks() {
    let piece_length = BLOCK_SIZE as u64 * 2;
    let total = piece_length + 100;
    let layout = StorageLayout::single_file("p", total, piece_length, vec![[0; 20]; 2]).unwrap();
    let mut have = Bitfield::new(2);
    have.set(0);
    let mut progress = PieceProgress::new(&layout, &have);

    assert_eq!(progress.block_count(0), 2);
    assert_eq!(progress.block_count(1), 1);
    assert_eq!(progress.block_length(1, 0), Some(100));
    assert_eq!(progress.block_length(0, BLOCK_SIZE), Some(BLOCK_SIZE));
    assert_eq!(progress.block_length(0, 1), None);
    assert_eq!(progress.block_length(1, BLOCK_SIZE), None);

    assert_eq!(progress.mark(0, 0), Some(BlockMark::Duplicate));
    assert_eq!(progress.missing(1), vec![(0, 100)]);
    assert_eq!(progress.mark(1, 0), Some(BlockMark::PieceFull));
    assert_eq!(progress.mark(1, 0), Some(BlockMark::Duplicate));
    assert_eq!(progress.mark(1, 7), None);

    progress.reset(0);
    assert!(!progress.is_done(0, 0));
    assert_eq!(progress.mark(0, BLOCK_SIZE), Some(BlockMark::Added));
    assert_eq!(progress.missing(0), vec![(0, BLOCK_SIZE)]);
}
