use std::path::PathBuf;

use riptide_bencode::Value;
use riptide_sha1::sha1;

use crate::hash_id::Id20;
use crate::lengths::Lengths;

#[derive(Debug, thiserror::Error)]
pub enum MetainfoError {
    #[error("bencode: {0}")]
    Bencode(#[from] riptide_bencode::ParseError),
    #[error("torrent is missing required key {0:?}")]
    MissingKey(&'static str),
    #[error("torrent key {0:?} has the wrong type")]
    WrongType(&'static str),
    #[error("pieces length {0} is not a multiple of 20")]
    BadPiecesLength(usize),
    #[error("piece count {actual} does not match total length ({expected} expected)")]
    PieceCountMismatch { actual: u32, expected: u32 },
    #[error("file path contains an unsafe component {0:?}")]
    UnsafePath(String),
    #[error("invalid geometry: {0}")]
    Geometry(String),
}

/// One entry of the torrent's file table, in torrent order.
#[derive(Debug, Clone)]
pub struct MetaFile {
    pub relative_path: PathBuf,
    pub length: u64,
    /// BEP-47 pad file: skipped on write, zero-filled on read.
    pub padding: bool,
    /// Byte offset of this file within the concatenated torrent payload.
    pub offset_in_torrent: u64,
}

/// Immutable torrent descriptor, shared for the lifetime of the torrent.
#[derive(Debug, Clone)]
pub struct Metainfo {
    pub info_hash: Id20,
    pub name: String,
    pub files: Vec<MetaFile>,
    pub lengths: Lengths,
    piece_hashes: Vec<u8>,
}

fn get<'a, 'b>(dict: &'b Value<'a>, key: &'static str) -> Result<&'b Value<'a>, MetainfoError> {
    dict.get(key).ok_or(MetainfoError::MissingKey(key))
}

fn as_u64(v: &Value<'_>, key: &'static str) -> Result<u64, MetainfoError> {
    v.as_integer()
        .filter(|v| *v >= 0)
        .map(|v| v as u64)
        .ok_or(MetainfoError::WrongType(key))
}

fn path_from_components(components: &[Value<'_>]) -> Result<(PathBuf, bool), MetainfoError> {
    let mut path = PathBuf::new();
    let mut last = "";
    for part in components {
        let s = part
            .as_str()
            .ok_or(MetainfoError::WrongType("path"))?;
        if s.is_empty() || s == "." || s == ".." || s.contains(['/', '\\']) {
            return Err(MetainfoError::UnsafePath(s.to_owned()));
        }
        path.push(s);
        last = s;
    }
    if path.as_os_str().is_empty() {
        return Err(MetainfoError::UnsafePath(String::new()));
    }
    // The .pad directory convention marks BEP-47 pad files in torrents that
    // don't carry the attr flag.
    let padding = path.starts_with(".pad") || last.starts_with("_____padding_file");
    Ok((path, padding))
}

impl Metainfo {
    /// Parse a .torrent file. The info-hash is SHA-1 over the exact byte
    /// range the `info` dict occupies in the input.
    pub fn parse(buf: &[u8]) -> Result<Self, MetainfoError> {
        let root = riptide_bencode::from_bytes(buf)?;
        let info = get(&root, "info")?;
        let span = info.dict_span().ok_or(MetainfoError::WrongType("info"))?;
        let info_hash = Id20::new(sha1(&buf[span]));
        Self::parse_info(info, info_hash)
    }

    /// Parse just a bencoded `info` dict (e.g. received over the wire).
    pub fn parse_info_dict(buf: &[u8]) -> Result<Self, MetainfoError> {
        let info = riptide_bencode::from_bytes(buf)?;
        if info.as_dict().is_none() {
            return Err(MetainfoError::WrongType("info"));
        }
        let info_hash = Id20::new(sha1(buf));
        Self::parse_info(&info, info_hash)
    }

    fn parse_info(info: &Value<'_>, info_hash: Id20) -> Result<Self, MetainfoError> {
        let name = get(info, "name")?
            .as_str()
            .ok_or(MetainfoError::WrongType("name"))?
            .to_owned();
        let piece_length = as_u64(get(info, "piece length")?, "piece length")?;
        if piece_length == 0 || piece_length > u32::MAX as u64 {
            return Err(MetainfoError::Geometry(format!(
                "piece length {piece_length} out of range"
            )));
        }

        let pieces = get(info, "pieces")?
            .as_bytes()
            .ok_or(MetainfoError::WrongType("pieces"))?;
        if pieces.len() % 20 != 0 {
            return Err(MetainfoError::BadPiecesLength(pieces.len()));
        }

        let mut files = Vec::new();
        let mut offset = 0u64;
        match info.get("files") {
            Some(list) => {
                let list = list.as_list().ok_or(MetainfoError::WrongType("files"))?;
                for entry in list {
                    let length = as_u64(get(entry, "length")?, "length")?;
                    let components = get(entry, "path")?
                        .as_list()
                        .ok_or(MetainfoError::WrongType("path"))?;
                    let (rel, path_padding) = path_from_components(components)?;
                    // BEP-47 attr string contains 'p' for pad files.
                    let attr_padding = entry
                        .get("attr")
                        .and_then(|a| a.as_bytes())
                        .is_some_and(|a| a.contains(&b'p'));
                    files.push(MetaFile {
                        relative_path: rel,
                        length,
                        padding: attr_padding || path_padding,
                        offset_in_torrent: offset,
                    });
                    offset += length;
                }
                if files.is_empty() {
                    return Err(MetainfoError::WrongType("files"));
                }
            }
            None => {
                let length = as_u64(get(info, "length")?, "length")?;
                files.push(MetaFile {
                    relative_path: PathBuf::from(&name),
                    length,
                    padding: false,
                    offset_in_torrent: 0,
                });
                offset = length;
            }
        }

        let lengths = Lengths::new(offset, piece_length as u32)
            .map_err(|e| MetainfoError::Geometry(format!("{e:#}")))?;
        let expected = lengths.total_pieces();
        let actual = (pieces.len() / 20) as u32;
        if actual != expected {
            return Err(MetainfoError::PieceCountMismatch { actual, expected });
        }

        Ok(Metainfo {
            info_hash,
            name,
            files,
            lengths,
            piece_hashes: pieces.to_vec(),
        })
    }

    pub fn piece_hash(&self, piece: u32) -> Option<Id20> {
        let start = piece as usize * 20;
        self.piece_hashes
            .get(start..start + 20)
            .map(|s| Id20::new(s.try_into().unwrap()))
    }

    /// Walk files in torrent order with their indices, skipping nothing.
    pub fn iter_files(&self) -> impl Iterator<Item = (usize, &MetaFile)> {
        self.files.iter().enumerate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use riptide_bencode::{DictBuilder, ListBuilder};

    pub(crate) fn single_file_torrent(name: &str, length: u64, piece_length: u32) -> Vec<u8> {
        let num_pieces = length.div_ceil(piece_length as u64);
        let pieces = vec![0xabu8; num_pieces as usize * 20];
        let info = DictBuilder::new()
            .push_integer("length", length as i64)
            .push_str("name", name)
            .push_integer("piece length", piece_length as i64)
            .push_bytes("pieces", &pieces);
        DictBuilder::new()
            .push_str("announce", "http://tracker.invalid/announce")
            .push_dict("info", info)
            .finish()
    }

    fn multi_file_torrent() -> Vec<u8> {
        // a(100), .pad/28(28), b(100); piece_length 128
        let mk_file = |len: i64, path: &[&str]| {
            let mut pb = ListBuilder::new();
            for p in path {
                pb = pb.push_bytes(p.as_bytes());
            }
            DictBuilder::new()
                .push_integer("length", len)
                .push_list("path", pb)
        };
        let mut files_raw = vec![b'l'];
        files_raw.extend_from_slice(&mk_file(100, &["a"]).finish());
        files_raw.extend_from_slice(&mk_file(28, &[".pad", "28"]).finish());
        files_raw.extend_from_slice(&mk_file(100, &["b"]).finish());
        files_raw.push(b'e');
        let pieces = vec![0u8; 2 * 20];
        let info = DictBuilder::new()
            .push_raw("files", &files_raw)
            .push_str("name", "multi")
            .push_integer("piece length", 128)
            .push_bytes("pieces", &pieces);
        DictBuilder::new().push_dict("info", info).finish()
    }

    #[test]
    fn test_single_file() {
        let raw = single_file_torrent("file.bin", 100000, 16384);
        let m = Metainfo::parse(&raw).unwrap();
        assert_eq!(m.name, "file.bin");
        assert_eq!(m.files.len(), 1);
        assert_eq!(m.files[0].length, 100000);
        assert_eq!(m.lengths.total_pieces(), 7);
        assert!(m.piece_hash(6).is_some());
        assert!(m.piece_hash(7).is_none());
    }

    #[test]
    fn test_info_hash_covers_exact_span() {
        let raw = single_file_torrent("x", 16384, 16384);
        let m = Metainfo::parse(&raw).unwrap();
        // Recompute by hand over the info dict bytes.
        let root = riptide_bencode::from_bytes(&raw).unwrap();
        let span = root.get("info").unwrap().dict_span().unwrap();
        assert_eq!(m.info_hash, Id20::new(riptide_sha1::sha1(&raw[span])));
    }

    #[test]
    fn test_multi_file_with_pad() {
        let raw = multi_file_torrent();
        let m = Metainfo::parse(&raw).unwrap();
        assert_eq!(m.files.len(), 3);
        assert!(!m.files[0].padding);
        assert!(m.files[1].padding);
        assert_eq!(m.files[1].offset_in_torrent, 100);
        assert_eq!(m.files[2].offset_in_torrent, 128);
        assert_eq!(m.lengths.total_length(), 228);
    }

    #[test]
    fn test_rejects_traversal() {
        let path = ListBuilder::new().push_bytes(b"..").push_bytes(b"evil");
        let file = DictBuilder::new()
            .push_integer("length", 1)
            .push_list("path", path);
        let mut files_raw = vec![b'l'];
        files_raw.extend_from_slice(&file.finish());
        files_raw.push(b'e');
        let info = DictBuilder::new()
            .push_raw("files", &files_raw)
            .push_str("name", "evil")
            .push_integer("piece length", 16384)
            .push_bytes("pieces", &[0u8; 20]);
        let raw = DictBuilder::new().push_dict("info", info).finish();
        assert!(matches!(
            Metainfo::parse(&raw),
            Err(MetainfoError::UnsafePath(_))
        ));
    }

    #[test]
    fn test_piece_count_mismatch() {
        // A 100000-byte torrent needs 7 piece hashes; provide one.
        let info = DictBuilder::new()
            .push_integer("length", 100000)
            .push_str("name", "x")
            .push_integer("piece length", 16384)
            .push_bytes("pieces", &[0u8; 20]);
        let raw = DictBuilder::new().push_dict("info", info).finish();
        assert!(matches!(
            Metainfo::parse(&raw),
            Err(MetainfoError::PieceCountMismatch { .. })
        ));
    }
}
