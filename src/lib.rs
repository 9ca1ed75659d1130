#[macro_use]
extern crate serde_derive;

pub mod bencode;
pub mod conf;
pub mod create;
pub mod disk;
pub mod error;
pub mod file_storage;
pub mod merkle;
pub mod metainfo;
pub mod net;
pub mod path;

pub use file_storage::{FileEntry, FileStorage};

/// The index of a piece within a torrent. Valid indices are fixed when the
/// torrent's file model is constructed.
pub type PieceIndex = usize;

/// The index of a file within a torrent's file list.
pub type FileIndex = usize;

/// Each torrent registered with the disk engine is assigned a compact index
/// that is stable for the lifetime of its storage. Freed indices are reused
/// via a free-list.
pub type TorrentIndex = u32;

/// A SHA-1 hash digest, 20 bytes long.
pub type Sha1Hash = [u8; 20];

/// A SHA-256 hash digest, 32 bytes long.
pub type Sha256Hash = [u8; 32];

/// The length of a block: the 16 KiB unit in which data is requested over
/// the wire, in which writes reach the disk engine, and in which v2
/// torrents hash files. Only the last block of a piece or file may be
/// shorter.
pub const BLOCK_LEN: u32 = 0x4000;
