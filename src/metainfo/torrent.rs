use std::path::{Path, PathBuf};

use super::error::MetainfoError;
use super::info_hash::InfoHash;
use crate::bencode::{decode, decode_prefix, Value};
use crate::storage::{FileEntry, StorageError, StorageLayout};

/// A parsed `.torrent` file.
///
/// # Examples
///
/// ```no_run
/// use swarmbit::metainfo::Metainfo;
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let metainfo = Metainfo::from_file("example.torrent")?;
///
/// println!("Torrent: {}", metainfo.info.name);
/// println!("Size: {} bytes", metainfo.info.total_length);
/// println!("Info hash: {}", metainfo.info_hash);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct Metainfo {
    pub info: Info,
    /// SHA-1 of the info dictionary exactly as it appears in the file.
    pub info_hash: InfoHash,
    pub announce: Option<String>,
    /// Tiered tracker list ([BEP-12](http://bittorrent.org/beps/bep_0012.html)).
    pub announce_list: Vec<Vec<String>>,
    pub creation_date: Option<i64>,
    pub comment: Option<String>,
    pub created_by: Option<String>,
}

/// The info dictionary of a torrent.
#[derive(Debug, Clone)]
pub struct Info {
    pub name: String,
    pub piece_length: u64,
    pub pieces: Vec<[u8; 20]>,
    /// Files in order; a single-file torrent has one entry named after the
    /// torrent.
    pub files: Vec<File>,
    pub total_length: u64,
    pub private: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct File {
    /// Path relative to the download directory. Multi-file torrents put
    /// every file under a directory named after the torrent.
    pub path: PathBuf,
    pub length: u64,
}

impl Info {
    pub fn piece_count(&self) -> usize {
        self.pieces.len()
    }
}

impl Metainfo {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, MetainfoError> {
        let data = std::fs::read(path)?;
        Self::from_bytes(&data)
    }

    /// Parses a torrent file.
    ///
    /// # Errors
    ///
    /// Returns an error if the data is not valid bencode, a required field is
    /// missing, or the piece hashes do not cover the described files.
    pub fn from_bytes(data: &[u8]) -> Result<Self, MetainfoError> {
        let value = decode(data)?;
        let dict = value.as_dict().ok_or(MetainfoError::InvalidField("root"))?;

        let info_value = dict
            .get(b"info".as_slice())
            .ok_or(MetainfoError::MissingField("info"))?;
        let raw_info = raw_info_span(data)?.ok_or(MetainfoError::MissingField("info"))?;
        let info_hash = InfoHash::of_info(raw_info);
        let info = parse_info(info_value)?;

        let text = |key: &[u8]| value.get(key).and_then(Value::as_str).map(String::from);

        let announce_list = value
            .get(b"announce-list")
            .and_then(Value::as_list)
            .map(|tiers| {
                tiers
                    .iter()
                    .filter_map(Value::as_list)
                    .map(|urls| {
                        urls.iter()
                            .filter_map(|u| u.as_str().map(String::from))
                            .collect::<Vec<_>>()
                    })
                    .filter(|tier| !tier.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            info,
            info_hash,
            announce: text(b"announce"),
            announce_list,
            creation_date: value.get(b"creation date").and_then(Value::as_integer),
            comment: text(b"comment"),
            created_by: text(b"created by"),
        })
    }

    /// Tracker tiers in priority order: `announce-list` when present,
    /// otherwise a single tier holding `announce`.
    pub fn announce_tiers(&self) -> Vec<Vec<String>> {
        if !self.announce_list.is_empty() {
            return self.announce_list.clone();
        }
        self.announce.iter().map(|url| vec![url.clone()]).collect()
    }

    pub fn storage_layout(&self) -> Result<StorageLayout, StorageError> {
        let files = self
            .info
            .files
            .iter()
            .map(|f| FileEntry::new(f.path.clone(), f.length))
            .collect();
        StorageLayout::new(files, self.info.piece_length, self.info.pieces.clone())
    }
}

/// Locates the bytes of the top-level `info` value without re-encoding it,
/// so the hash matches whatever the file's author produced.
fn raw_info_span(data: &[u8]) -> Result<Option<&[u8]>, MetainfoError> {
    if data.first() != Some(&b'd') {
        return Err(MetainfoError::InvalidField("root"));
    }
    let mut pos = 1;
    while data.get(pos).is_some_and(|&b| b != b'e') {
        let (key, used) = decode_prefix(&data[pos..])?;
        pos += used;
        let (_, used) = decode_prefix(&data[pos..])?;
        if key.as_bytes().is_some_and(|k| k[..] == b"info"[..]) {
            return Ok(Some(&data[pos..pos + used]));
        }
        pos += used;
    }
    Ok(None)
}

fn parse_info(value: &Value) -> Result<Info, MetainfoError> {
    value.as_dict().ok_or(MetainfoError::InvalidField("info"))?;

    let name = value
        .get(b"name")
        .and_then(Value::as_str)
        .ok_or(MetainfoError::MissingField("name"))?
        .to_string();

    let piece_length = value
        .get(b"piece length")
        .and_then(Value::as_integer)
        .ok_or(MetainfoError::MissingField("piece length"))?;
    if piece_length <= 0 {
        return Err(MetainfoError::InvalidField("piece length"));
    }
    let piece_length = piece_length as u64;

    let pieces_bytes = value
        .get(b"pieces")
        .and_then(Value::as_bytes)
        .ok_or(MetainfoError::MissingField("pieces"))?;
    if pieces_bytes.len() % 20 != 0 {
        return Err(MetainfoError::InvalidField("pieces"));
    }
    let pieces: Vec<[u8; 20]> = pieces_bytes
        .chunks_exact(20)
        .map(|chunk| {
            let mut hash = [0u8; 20];
            hash.copy_from_slice(chunk);
            hash
        })
        .collect();

    let private = value.get(b"private").and_then(Value::as_integer) == Some(1);

    let files = if let Some(length) = value.get(b"length").and_then(Value::as_integer) {
        vec![File {
            path: PathBuf::from(&name),
            length: file_length(length)?,
        }]
    } else if let Some(list) = value.get(b"files").and_then(Value::as_list) {
        list.iter()
            .map(|entry| parse_file(&name, entry))
            .collect::<Result<Vec<_>, _>>()?
    } else {
        return Err(MetainfoError::MissingField("length or files"));
    };
    if files.is_empty() {
        return Err(MetainfoError::InvalidField("files"));
    }

    let total_length: u64 = files.iter().map(|f| f.length).sum();
    if pieces.len() as u64 != total_length.div_ceil(piece_length) {
        return Err(MetainfoError::InvalidField("pieces"));
    }

    Ok(Info {
        name,
        piece_length,
        pieces,
        files,
        total_length,
        private,
    })
}

fn parse_file(name: &str, entry: &Value) -> Result<File, MetainfoError> {
    let length = entry
        .get(b"length")
        .and_then(Value::as_integer)
        .ok_or(MetainfoError::MissingField("file length"))?;

    let segments = entry
        .get(b"path")
        .and_then(Value::as_list)
        .ok_or(MetainfoError::MissingField("file path"))?;
    if segments.is_empty() {
        return Err(MetainfoError::InvalidField("file path"));
    }

    let mut path = PathBuf::from(name);
    for segment in segments {
        path.push(segment.as_str().ok_or(MetainfoError::InvalidField("file path"))?);
    }

    Ok(File {
        path,
        length: file_length(length)?,
    })
}

fn file_length(length: i64) -> Result<u64, MetainfoError> {
    u64::try_from(length).map_err(|_| MetainfoError::InvalidField("length"))
}
