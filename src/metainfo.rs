//! Metainfo (.torrent) parsing.
//!
//! The static frame of a metainfo file is deserialized with `serde_bencode`
//! derives. The v2 sections (`file tree`, `piece layers`) are free-form
//! dictionaries keyed by path elements and Merkle roots, so they are walked
//! manually from [`serde_bencode::value::Value`].
//!
//! Emission of metainfo lives in the create-torrent pipeline, which builds
//! the canonical byte form directly (see [`crate::bencode`]).

use std::collections::HashMap;

use serde_bencode::value::Value;
use sha1::{Digest, Sha1};
use sha2::Sha256;
use thiserror::Error;

use crate::{
    file_storage::{FileFlags, FileStorage, FileStorageError},
    Sha1Hash, Sha256Hash,
};

#[derive(Debug, Error)]
pub enum MetainfoError {
    #[error("bencode: {0}")]
    Bencode(#[from] serde_bencode::Error),
    #[error("invalid file model: {0}")]
    Model(#[from] FileStorageError),
    #[error("no info dictionary found")]
    NoInfo,
    #[error("torrent has neither v1 pieces nor a v2 file tree")]
    NoHashes,
    #[error("invalid piece length")]
    InvalidPieceLength,
    #[error("invalid file tree: {0}")]
    InvalidFileTree(&'static str),
    #[error("invalid piece layers: {0}")]
    InvalidPieceLayers(&'static str),
}

#[derive(Debug, Deserialize)]
pub struct Metainfo {
    pub announce: Option<String>,
    #[serde(rename = "announce-list")]
    pub announce_list: Option<Vec<Vec<String>>>,
    pub comment: Option<String>,
    #[serde(rename = "created by")]
    pub created_by: Option<String>,
    #[serde(rename = "creation date")]
    pub creation_date: Option<i64>,
    pub info: Info,
    /// Top-level `piece layers` dictionary: file Merkle root mapped to the
    /// concatenation of per-piece SHA-256 hashes.
    #[serde(rename = "piece layers")]
    pub piece_layers: Option<Value>,
    /// Web seeds; a single string or a list of strings on the wire.
    #[serde(rename = "url-list")]
    pub url_list: Option<Value>,
    /// The exact serialized bytes of the info dictionary, captured from the
    /// input so the info-hashes cover unknown keys too.
    #[serde(skip)]
    info_bytes: Vec<u8>,
}

#[derive(Debug, Deserialize)]
pub struct Info {
    pub name: String,
    #[serde(rename = "piece length")]
    pub piece_length: u32,
    /// The concatenated SHA-1 piece hashes of a v1 torrent.
    #[serde(default, with = "serde_bytes")]
    pub pieces: Option<Vec<u8>>,
    /// The length of a v1 single-file torrent.
    pub length: Option<u64>,
    /// The file list of a v1 multi-file torrent.
    pub files: Option<Vec<File>>,
    #[serde(rename = "meta version")]
    pub meta_version: Option<u8>,
    #[serde(rename = "file tree")]
    pub file_tree: Option<Value>,
    pub private: Option<u8>,
}

#[derive(Debug, Deserialize)]
pub struct File {
    pub length: u64,
    pub path: Vec<String>,
    pub attr: Option<String>,
    pub mtime: Option<i64>,
    #[serde(rename = "symlink path")]
    pub symlink_path: Option<Vec<String>>,
}

impl Metainfo {
    pub fn from_bytes(buf: &[u8]) -> Result<Self, MetainfoError> {
        let mut metainfo: Metainfo = serde_bencode::from_bytes(buf)?;
        metainfo.info_bytes =
            info_span(buf).ok_or(MetainfoError::NoInfo)?.to_vec();
        Ok(metainfo)
    }

    /// True if the torrent carries v1 piece hashes.
    pub fn is_v1(&self) -> bool {
        self.info.pieces.is_some()
    }

    /// True if the torrent carries a v2 file tree.
    pub fn is_v2(&self) -> bool {
        self.info.meta_version == Some(2) && self.info.file_tree.is_some()
    }

    /// The SHA-1 info-hash, present for v1 and hybrid torrents.
    pub fn info_hash_v1(&self) -> Option<Sha1Hash> {
        if !self.is_v1() {
            return None;
        }
        let digest = Sha1::digest(&self.info_bytes);
        let mut hash = [0; 20];
        hash.copy_from_slice(&digest);
        Some(hash)
    }

    /// The SHA-256 info-hash, present for v2 and hybrid torrents.
    pub fn info_hash_v2(&self) -> Option<Sha256Hash> {
        if !self.is_v2() {
            return None;
        }
        let digest = Sha256::digest(&self.info_bytes);
        let mut hash = [0; 32];
        hash.copy_from_slice(&digest);
        Some(hash)
    }

    /// Builds the file model described by this metainfo.
    ///
    /// For v2 (and hybrid) torrents the file tree is authoritative: files
    /// are piece aligned and the implied pad files are reconstructed. For
    /// v1-only torrents the file list (or the single `length`) is used and
    /// pad files are recognized from the `p` attribute.
    pub fn file_storage(&self) -> Result<FileStorage, MetainfoError> {
        if self.info.piece_length == 0 {
            return Err(MetainfoError::InvalidPieceLength);
        }

        let mut fs = FileStorage::new();
        fs.set_piece_length(self.info.piece_length);
        fs.set_v1(self.is_v1());
        fs.set_v2(self.is_v2());

        if let Some(tree) = &self.info.file_tree {
            self.add_tree_files(&mut fs, tree)?;
        } else if let Some(files) = &self.info.files {
            for f in files {
                let path = join_components(&self.info.name, &f.path);
                let (flags, symlink) = attr_flags(f);
                fs.add_file(
                    &path,
                    f.length,
                    flags,
                    f.mtime,
                    symlink.as_deref(),
                )?;
            }
        } else if let Some(length) = self.info.length {
            fs.add_file(
                &self.info.name,
                length,
                FileFlags::default(),
                None,
                None,
            )?;
        } else {
            return Err(MetainfoError::NoHashes);
        }

        fs.set_name(&self.info.name);
        Ok(fs)
    }

    fn add_tree_files(
        &self,
        fs: &mut FileStorage,
        tree: &Value,
    ) -> Result<(), MetainfoError> {
        let root = match tree {
            Value::Dict(d) => d,
            _ => {
                return Err(MetainfoError::InvalidFileTree(
                    "file tree is not a dictionary",
                ))
            }
        };
        // a single top-level file named after the torrent is a single-file
        // torrent; everything else nests under the name directory
        let single_file = root.len() == 1
            && root.keys().next().map(Vec::as_slice)
                == Some(self.info.name.as_bytes())
            && match root.values().next() {
                Some(Value::Dict(d)) => d.contains_key(&b""[..].to_vec()),
                _ => false,
            };

        let mut segments = Vec::new();
        self.walk_tree(fs, root, &mut segments, single_file)
    }

    fn walk_tree(
        &self,
        fs: &mut FileStorage,
        node: &HashMap<Vec<u8>, Value>,
        segments: &mut Vec<String>,
        single_file: bool,
    ) -> Result<(), MetainfoError> {
        // dictionary order is canonical in the file, but the in-memory map
        // is unordered, so re-sort by raw key
        let mut keys: Vec<&Vec<u8>> = node.keys().collect();
        keys.sort();

        for key in keys {
            let value = &node[key];
            let child = match value {
                Value::Dict(d) => d,
                _ => {
                    return Err(MetainfoError::InvalidFileTree(
                        "tree node is not a dictionary",
                    ))
                }
            };
            let segment = String::from_utf8(key.clone()).map_err(|_| {
                MetainfoError::InvalidFileTree("non-UTF-8 path element")
            })?;

            if let Some(leaf) = child.get(&b""[..].to_vec()) {
                segments.push(segment);
                let path = if single_file {
                    self.info.name.clone()
                } else {
                    join_components(&self.info.name, segments)
                };
                self.add_tree_leaf(fs, &path, leaf)?;
                segments.pop();
            } else {
                segments.push(segment);
                self.walk_tree(fs, child, segments, single_file)?;
                segments.pop();
            }
        }
        Ok(())
    }

    fn add_tree_leaf(
        &self,
        fs: &mut FileStorage,
        path: &str,
        leaf: &Value,
    ) -> Result<(), MetainfoError> {
        let leaf = match leaf {
            Value::Dict(d) => d,
            _ => {
                return Err(MetainfoError::InvalidFileTree(
                    "file node is not a dictionary",
                ))
            }
        };
        let length = match leaf.get(&b"length"[..].to_vec()) {
            Some(Value::Int(n)) if *n >= 0 => *n as u64,
            None => 0,
            _ => {
                return Err(MetainfoError::InvalidFileTree(
                    "invalid file length",
                ))
            }
        };
        let mut flags = FileFlags::default();
        let mut symlink = None;
        if let Some(Value::Bytes(attr)) = leaf.get(&b"attr"[..].to_vec()) {
            for b in attr {
                match b {
                    b'p' => flags |= FileFlags::PAD,
                    b'h' => flags |= FileFlags::HIDDEN,
                    b'x' => flags |= FileFlags::EXECUTABLE,
                    b'l' => flags |= FileFlags::SYMLINK,
                    _ => {}
                }
            }
        }
        if let Some(Value::List(parts)) =
            leaf.get(&b"symlink path"[..].to_vec())
        {
            let mut target = Vec::new();
            for p in parts {
                match p {
                    Value::Bytes(b) => target.push(
                        String::from_utf8(b.clone()).map_err(|_| {
                            MetainfoError::InvalidFileTree(
                                "non-UTF-8 symlink path",
                            )
                        })?,
                    ),
                    _ => {
                        return Err(MetainfoError::InvalidFileTree(
                            "invalid symlink path",
                        ))
                    }
                }
            }
            symlink = Some(target.join("/"));
        }
        let mtime = match leaf.get(&b"mtime"[..].to_vec()) {
            Some(Value::Int(t)) => Some(*t),
            _ => None,
        };

        fs.add_file(path, length, flags, mtime, symlink.as_deref())?;

        if let Some(Value::Bytes(root)) =
            leaf.get(&b"pieces root"[..].to_vec())
        {
            if root.len() != 32 {
                return Err(MetainfoError::InvalidFileTree(
                    "pieces root is not 32 bytes",
                ));
            }
            let mut hash = [0; 32];
            hash.copy_from_slice(root);
            fs.set_root(fs.num_files() - 1, hash);
        }
        Ok(())
    }

    /// The per-file piece hashes from the `piece layers` dictionary, keyed
    /// by file Merkle root. Files with a single piece have no entry.
    pub fn piece_layers(
        &self,
    ) -> Result<HashMap<Sha256Hash, Vec<Sha256Hash>>, MetainfoError> {
        let mut layers = HashMap::new();
        let dict = match &self.piece_layers {
            None => return Ok(layers),
            Some(Value::Dict(d)) => d,
            Some(_) => {
                return Err(MetainfoError::InvalidPieceLayers(
                    "piece layers is not a dictionary",
                ))
            }
        };
        for (root, hashes) in dict {
            if root.len() != 32 {
                return Err(MetainfoError::InvalidPieceLayers(
                    "layer key is not 32 bytes",
                ));
            }
            let hashes = match hashes {
                Value::Bytes(b) if b.len() % 32 == 0 => b,
                _ => {
                    return Err(MetainfoError::InvalidPieceLayers(
                        "layer is not a multiple of 32 bytes",
                    ))
                }
            };
            let mut key = [0; 32];
            key.copy_from_slice(root);
            let pieces = hashes
                .chunks_exact(32)
                .map(|c| {
                    let mut h = [0; 32];
                    h.copy_from_slice(c);
                    h
                })
                .collect();
            layers.insert(key, pieces);
        }
        Ok(layers)
    }
}

fn join_components(name: &str, components: &[String]) -> String {
    let mut path = name.to_string();
    for c in components {
        path.push('/');
        path.push_str(c);
    }
    path
}

fn attr_flags(f: &File) -> (FileFlags, Option<String>) {
    let mut flags = FileFlags::default();
    if let Some(attr) = &f.attr {
        for c in attr.chars() {
            match c {
                'p' => flags |= FileFlags::PAD,
                'h' => flags |= FileFlags::HIDDEN,
                'x' => flags |= FileFlags::EXECUTABLE,
                'l' => flags |= FileFlags::SYMLINK,
                _ => {}
            }
        }
    }
    let symlink = f.symlink_path.as_ref().map(|p| p.join("/"));
    (flags, symlink)
}

/// Locates the exact byte span of the top-level `info` value, so the
/// info-hashes can be computed over the very bytes of the input.
fn info_span(buf: &[u8]) -> Option<&[u8]> {
    let mut at = 0;
    if *buf.first()? != b'd' {
        return None;
    }
    at += 1;
    while at < buf.len() && buf[at] != b'e' {
        let (key, key_end) = parse_string(buf, at)?;
        let value_end = skip_value(buf, key_end)?;
        if key == b"info" {
            return Some(&buf[key_end..value_end]);
        }
        at = value_end;
    }
    None
}

/// Parses a bencode string at `at`, returning its contents and the offset
/// one past its end.
fn parse_string(buf: &[u8], at: usize) -> Option<(&[u8], usize)> {
    let colon = buf[at..].iter().position(|&b| b == b':')? + at;
    let len: usize =
        std::str::from_utf8(&buf[at..colon]).ok()?.parse().ok()?;
    let start = colon + 1;
    let end = start.checked_add(len)?;
    if end > buf.len() {
        return None;
    }
    Some((&buf[start..end], end))
}

/// Returns the offset one past the bencode value starting at `at`.
fn skip_value(buf: &[u8], at: usize) -> Option<usize> {
    match buf.get(at)? {
        b'i' => {
            let end = buf[at..].iter().position(|&b| b == b'e')? + at;
            Some(end + 1)
        }
        b'l' | b'd' => {
            let mut at = at + 1;
            while *buf.get(at)? != b'e' {
                at = skip_value(buf, at)?;
            }
            Some(at + 1)
        }
        b'0'..=b'9' => parse_string(buf, at).map(|(_, end)| end),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn single_file_v1() -> Vec<u8> {
        let mut info = crate::bencode::Value::dict();
        info.insert("length", crate::bencode::Value::Int(13));
        info.insert("name", crate::bencode::Value::bytes("hello.txt"));
        info.insert("piece length", crate::bencode::Value::Int(16384));
        info.insert(
            "pieces",
            crate::bencode::Value::bytes(vec![0xab; 20]),
        );
        let mut root = crate::bencode::Value::dict();
        root.insert("announce", crate::bencode::Value::bytes("http://t"));
        root.insert("info", info);
        root.encode()
    }

    #[test]
    fn test_parse_single_file_v1() {
        let metainfo = Metainfo::from_bytes(&single_file_v1()).unwrap();
        assert!(metainfo.is_v1());
        assert!(!metainfo.is_v2());
        assert_eq!(metainfo.announce.as_deref(), Some("http://t"));

        let fs = metainfo.file_storage().unwrap();
        assert_eq!(fs.num_files(), 1);
        assert_eq!(fs.name(), "hello.txt");
        assert_eq!(fs.total_size(), 13);
        assert_eq!(fs.num_pieces(), 1);
        assert!(fs.v1());
        assert!(!fs.v2());
    }

    #[test]
    fn test_info_hash_covers_exact_bytes() {
        let buf = single_file_v1();
        let metainfo = Metainfo::from_bytes(&buf).unwrap();

        let span = info_span(&buf).unwrap();
        assert_eq!(span.first(), Some(&b'd'));
        assert_eq!(span.last(), Some(&b'e'));

        let expected: [u8; 20] = Sha1::digest(span).into();
        assert_eq!(metainfo.info_hash_v1(), Some(expected));
        assert_eq!(metainfo.info_hash_v2(), None);
    }

    #[test]
    fn test_info_span_skips_other_keys() {
        // keys sorting before and after "info", with nested structures
        let buf = b"d1:ad1:bi1ee4:infod1:xi2ee3:zzzli3eee";
        assert_eq!(info_span(buf), Some(&b"d1:xi2ee"[..]));
    }

    #[test]
    fn test_parse_v2_file_tree() {
        use crate::bencode::Value as B;

        // t/a (100 bytes) and t/sub/b (200 bytes), 16 KiB pieces
        let mut tree = B::dict();
        let mut leaf_a = B::dict();
        leaf_a.insert("length", B::Int(100));
        leaf_a.insert("pieces root", B::bytes(vec![0x0a; 32]));
        tree.entry_dict("a").insert("", leaf_a);
        let mut leaf_b = B::dict();
        leaf_b.insert("length", B::Int(200));
        leaf_b.insert("pieces root", B::bytes(vec![0x0b; 32]));
        tree.entry_dict("sub").entry_dict("b").insert("", leaf_b);

        let mut info = B::dict();
        info.insert("file tree", tree);
        info.insert("meta version", B::Int(2));
        info.insert("name", B::bytes("t"));
        info.insert("piece length", B::Int(16384));
        let mut root = B::dict();
        root.insert("info", info);

        let metainfo = Metainfo::from_bytes(&root.encode()).unwrap();
        assert!(metainfo.is_v2());
        assert!(!metainfo.is_v1());

        let fs = metainfo.file_storage().unwrap();
        // a, the reconstructed pad, then sub/b
        assert_eq!(fs.num_files(), 3);
        assert_eq!(fs.file_name(0), "t/a");
        assert!(fs.pad_file_at(1));
        assert_eq!(fs.file_size(1), 16384 - 100);
        assert_eq!(fs.file_name(2), "t/sub/b");
        assert_eq!(fs.file_offset(2), 16384);
        assert_eq!(fs.root(0), Some([0x0a; 32]));
        assert_eq!(fs.root(2), Some([0x0b; 32]));
        assert_eq!(
            fs.file_index_for_root(&[0x0b; 32]),
            Some(2)
        );
    }

    #[test]
    fn test_parse_v2_single_file() {
        use crate::bencode::Value as B;

        let mut leaf = B::dict();
        leaf.insert("length", B::Int(13));
        leaf.insert("pieces root", B::bytes(vec![0x0c; 32]));
        let mut tree = B::dict();
        tree.entry_dict("hello.txt").insert("", leaf);

        let mut info = B::dict();
        info.insert("file tree", tree);
        info.insert("meta version", B::Int(2));
        info.insert("name", B::bytes("hello.txt"));
        info.insert("piece length", B::Int(16384));
        let mut root = B::dict();
        root.insert("info", info);

        let metainfo = Metainfo::from_bytes(&root.encode()).unwrap();
        let fs = metainfo.file_storage().unwrap();
        assert_eq!(fs.num_files(), 1);
        assert_eq!(fs.file_name(0), "hello.txt");
        assert_eq!(fs.total_size(), 13);
    }

    #[test]
    fn test_piece_layers() {
        use crate::bencode::Value as B;

        let mut layers = B::dict();
        let mut hashes = vec![0x01; 32];
        hashes.extend_from_slice(&[0x02; 32]);
        layers.insert(vec![0xaa; 32], B::Bytes(hashes));

        let mut leaf = B::dict();
        leaf.insert("length", B::Int(20000));
        leaf.insert("pieces root", B::bytes(vec![0xaa; 32]));
        let mut tree = B::dict();
        tree.entry_dict("big").insert("", leaf);
        let mut info = B::dict();
        info.insert("file tree", tree);
        info.insert("meta version", B::Int(2));
        info.insert("name", B::bytes("big"));
        info.insert("piece length", B::Int(16384));
        let mut root = B::dict();
        root.insert("info", info);
        root.insert("piece layers", layers);

        let metainfo = Metainfo::from_bytes(&root.encode()).unwrap();
        let layers = metainfo.piece_layers().unwrap();
        assert_eq!(layers.len(), 1);
        assert_eq!(
            layers.get(&[0xaa; 32]).unwrap(),
            &vec![[0x01; 32], [0x02; 32]]
        );
    }
}
