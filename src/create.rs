//! The create-torrent pipeline: walk a file tree, hash it through the disk
//! engine, and emit a canonical metainfo file.
//!
//! The pipeline spins up its own [`DiskIo`], registers a storage over the
//! input files and keeps a bounded window of hash jobs in flight, refilling
//! it FIFO as results arrive. When the last hash lands the engine is asked
//! to abort.

use std::{
    collections::VecDeque,
    io,
    os::unix::fs::PermissionsExt,
    path::Path,
    sync::Arc,
    time::UNIX_EPOCH,
};

use thiserror::Error;
use walkdir::WalkDir;

use crate::{
    bencode::Value,
    conf::DiskConf,
    disk::{
        error::{JobError, NewTorrentError},
        DiskIo, DiskJobFlags, StorageParams,
    },
    file_storage::{FileFlags, FileStorage, FileStorageError},
    merkle, path, FileIndex, PieceIndex, Sha1Hash, Sha256Hash, BLOCK_LEN,
};

use sha1::{Digest, Sha1};
use sha2::Sha256;

/// Flags controlling torrent generation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CreateFlags(u16);

impl CreateFlags {
    /// Only generate v1 (SHA-1) metadata.
    pub const V1_ONLY: Self = Self(1);
    /// Only generate v2 (SHA-256 Merkle) metadata.
    pub const V2_ONLY: Self = Self(1 << 1);
    /// Canonicalize the file list even for a v1-only torrent.
    pub const CANONICAL_FILES: Self = Self(1 << 2);
    /// Like [`CANONICAL_FILES`](Self::CANONICAL_FILES) but without padding
    /// the end of the torrent up to a piece boundary.
    pub const CANONICAL_FILES_NO_TAIL_PADDING: Self = Self(1 << 3);
    /// Include per-file modification times.
    pub const MODIFICATION_TIME: Self = Self(1 << 4);
    /// Store symlinks as symlinks instead of following them.
    pub const SYMLINKS: Self = Self(1 << 5);
    /// Accept v1 piece sizes that are not multiples of 16 KiB.
    pub const ALLOW_ODD_PIECE_SIZE: Self = Self(1 << 6);
    /// Don't emit hidden/executable file attributes.
    pub const NO_ATTRIBUTES: Self = Self(1 << 7);

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for CreateFlags {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// One input file of the torrent under construction.
#[derive(Clone, Debug)]
pub struct CreateFileEntry {
    /// Torrent-internal path: `name` or `name/dir/leaf`, `/`-separated.
    pub path: String,
    pub size: u64,
    pub flags: FileFlags,
    pub mtime: Option<i64>,
    /// The link target for symlink entries, relative to the torrent root.
    pub symlink: Option<String>,
}

#[derive(Debug, Error)]
pub enum CreateError {
    #[error("no files in torrent")]
    NoFiles,
    #[error("torrent has no content")]
    TotalSizeZero,
    #[error("invalid piece size")]
    InvalidPieceSize,
    #[error("file model: {0}")]
    Model(#[from] FileStorageError),
    #[error("disk: {0}")]
    Disk(#[from] JobError),
    #[error("registering hash storage: {0}")]
    NewTorrent(#[from] NewTorrentError),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("hashes have not been generated yet")]
    MissingHashes,
}

/// Lists the files under `root` (or `root` itself, for a single file) as
/// torrent entries, capturing sizes, modification times, permissions and,
/// when [`CreateFlags::SYMLINKS`] is set, symlinks.
pub fn list_files(
    root: &Path,
    flags: CreateFlags,
) -> io::Result<Vec<CreateFileEntry>> {
    let root_name = path::filename(root)
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                "root path has no filename",
            )
        })?
        .to_string();

    let mut entries = Vec::new();
    let follow = !flags.contains(CreateFlags::SYMLINKS);
    for entry in WalkDir::new(root).follow_links(follow).sort_by_file_name() {
        let entry = entry.map_err(io::Error::from)?;
        let meta = entry.metadata().map_err(io::Error::from)?;
        let is_symlink = entry.path_is_symlink() && !follow;
        if meta.is_dir() && !is_symlink {
            continue;
        }

        let rel = entry
            .path()
            .strip_prefix(root)
            .expect("walkdir yields children of root");
        let mut torrent_path = root_name.clone();
        for c in rel.components() {
            torrent_path.push('/');
            torrent_path.push_str(&c.as_os_str().to_string_lossy());
        }

        let mut file_flags = FileFlags::default();
        if meta.permissions().mode() & 0o111 != 0 {
            file_flags |= FileFlags::EXECUTABLE;
        }
        if entry.file_name().to_string_lossy().starts_with('.') {
            file_flags |= FileFlags::HIDDEN;
        }
        let mtime = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64);

        if is_symlink {
            let target = std::fs::read_link(entry.path())?;
            file_flags |= FileFlags::SYMLINK;
            entries.push(CreateFileEntry {
                path: torrent_path,
                size: 0,
                flags: file_flags,
                mtime,
                symlink: Some(target.to_string_lossy().into_owned()),
            });
        } else {
            entries.push(CreateFileEntry {
                path: torrent_path,
                size: meta.len(),
                flags: file_flags,
                mtime,
                symlink: None,
            });
        }
    }
    Ok(entries)
}

/// A torrent under construction.
pub struct CreateTorrent {
    files: FileStorage,
    flags: CreateFlags,
    /// Tracker URL tiers.
    trackers: Vec<Vec<String>>,
    url_seeds: Vec<String>,
    comment: Option<String>,
    creator: Option<String>,
    creation_date: Option<i64>,
    private: bool,
    /// v1 piece hashes, filled by hashing.
    piece_hashes: Vec<Option<Sha1Hash>>,
    /// Per file: the SHA-256 root of each of its pieces' block trees.
    file_piece_hashes: Vec<Vec<Sha256Hash>>,
    hashed: bool,
}

impl CreateTorrent {
    /// Validates the inputs and builds the torrent's (possibly
    /// canonicalized) file layout. A `piece_length` of zero picks one
    /// automatically from the total size.
    pub fn new(
        entries: Vec<CreateFileEntry>,
        piece_length: u32,
        flags: CreateFlags,
    ) -> Result<Self, CreateError> {
        if entries.is_empty() {
            return Err(CreateError::NoFiles);
        }
        let total_size: u64 = entries.iter().map(|e| e.size).sum();
        if total_size == 0 {
            return Err(CreateError::TotalSizeZero);
        }

        let v1_only = flags.contains(CreateFlags::V1_ONLY);
        let piece_length =
            validate_piece_length(piece_length, total_size, flags)?;

        let mut files = FileStorage::new();
        files.set_piece_length(piece_length);
        files.set_v1(!flags.contains(CreateFlags::V2_ONLY));
        for entry in &entries {
            files.add_file(
                &entry.path,
                entry.size,
                entry.flags,
                entry.mtime,
                entry.symlink.as_deref(),
            )?;
        }
        // the v2 flag is set after adding so canonicalization, not
        // add_file, decides where the pad files go
        files.set_v2(!v1_only);

        let canonical = !v1_only
            || flags.contains(CreateFlags::CANONICAL_FILES)
            || flags.contains(CreateFlags::CANONICAL_FILES_NO_TAIL_PADDING);
        if canonical {
            let tail_padding = flags.contains(CreateFlags::CANONICAL_FILES)
                && !flags
                    .contains(CreateFlags::CANONICAL_FILES_NO_TAIL_PADDING);
            files.canonicalize(tail_padding);
        }

        let num_files = files.num_files();
        let num_pieces = files.num_pieces();
        Ok(Self {
            files,
            flags,
            trackers: Vec::new(),
            url_seeds: Vec::new(),
            comment: None,
            creator: None,
            creation_date: None,
            private: false,
            piece_hashes: vec![None; num_pieces],
            file_piece_hashes: vec![Vec::new(); num_files],
            hashed: false,
        })
    }

    pub fn files(&self) -> &FileStorage {
        &self.files
    }

    pub fn piece_length(&self) -> u32 {
        self.files.piece_length()
    }

    pub fn num_pieces(&self) -> usize {
        self.files.num_pieces()
    }

    pub fn is_v1_only(&self) -> bool {
        self.flags.contains(CreateFlags::V1_ONLY)
    }

    pub fn is_v2_only(&self) -> bool {
        self.flags.contains(CreateFlags::V2_ONLY)
    }

    pub fn set_comment(&mut self, comment: impl Into<String>) {
        self.comment = Some(comment.into());
    }

    pub fn set_creator(&mut self, creator: impl Into<String>) {
        self.creator = Some(creator.into());
    }

    pub fn set_creation_date(&mut self, seconds_since_epoch: i64) {
        self.creation_date = Some(seconds_since_epoch);
    }

    pub fn set_private(&mut self, private: bool) {
        self.private = private;
    }

    /// Adds a tracker at the given tier.
    pub fn add_tracker(&mut self, url: impl Into<String>, tier: usize) {
        if self.trackers.len() <= tier {
            self.trackers.resize(tier + 1, Vec::new());
        }
        self.trackers[tier].push(url.into());
    }

    pub fn add_url_seed(&mut self, url: impl Into<String>) {
        self.url_seeds.push(url.into());
    }

    /// Records a v1 piece hash computed externally.
    pub fn set_hash(&mut self, piece: PieceIndex, hash: Sha1Hash) {
        self.piece_hashes[piece] = Some(hash);
    }

    /// Records the Merkle root of one piece of one file, computed
    /// externally. `piece` is relative to the file's first piece.
    pub fn set_hash2(
        &mut self,
        file: FileIndex,
        piece: usize,
        root: Sha256Hash,
    ) {
        let hashes = &mut self.file_piece_hashes[file];
        if hashes.len() <= piece {
            hashes.resize(self.files.file_num_pieces(file), [0; 32]);
        }
        hashes[piece] = root;
    }

    /// Hashes the torrent's content through a private disk engine.
    ///
    /// `save_path` is the directory containing the torrent's root (the
    /// parent of the tree the entries were listed from).
    pub async fn generate_hashes(
        &mut self,
        save_path: &Path,
        conf: DiskConf,
    ) -> Result<(), CreateError> {
        let num_pieces = self.files.num_pieces();
        let piece_length = self.files.piece_length();
        let want_v1 = !self.is_v2_only();
        let want_v2 = !self.is_v1_only();

        let disk = DiskIo::new(conf.clone());
        let torrent = disk.new_torrent(StorageParams::new(
            Arc::new(self.files.clone()),
            save_path,
        ))?;

        // keep enough hash jobs in flight to saturate the hash threads,
        // and at least a megabyte's worth for small pieces
        let in_flight = (conf.jobs_per_thread * conf.hash_threads.max(1))
            .max((1 << 20) / piece_length as usize)
            .max(1)
            .min(num_pieces);
        log::debug!(
            "Hashing {} piece(s), {} in flight",
            num_pieces,
            in_flight
        );

        let mut window = VecDeque::new();
        let mut next_piece = 0;
        let result = loop {
            while window.len() < in_flight && next_piece < num_pieces {
                let disk = disk.clone();
                let piece = next_piece;
                window.push_back(tokio::spawn(async move {
                    let hashes = disk
                        .async_hash(
                            torrent,
                            piece,
                            want_v1,
                            want_v2,
                            DiskJobFlags::SEQUENTIAL_ACCESS,
                        )
                        .await;
                    (piece, hashes)
                }));
                next_piece += 1;
            }
            let task = match window.pop_front() {
                Some(task) => task,
                None => break Ok(()),
            };
            let (piece, hashes) = match task.await {
                Ok(done) => done,
                Err(_) => break Err(CreateError::Disk(JobError::Cancelled)),
            };
            match hashes {
                Ok(hashes) => self.on_hash(piece, hashes),
                Err(e) => break Err(CreateError::from(e)),
            }
        };
        // the engine's work is done (or moot); tear it down
        disk.abort(true);
        result?;

        self.finalize_roots();
        self.hashed = true;
        Ok(())
    }

    fn on_hash(
        &mut self,
        piece: PieceIndex,
        hashes: crate::disk::PieceHashes,
    ) {
        if let Some(v1) = hashes.v1 {
            self.piece_hashes[piece] = Some(v1);
        }
        if self.is_v1_only() {
            return;
        }

        let file = self.files.file_index_at_piece(piece);
        if self.files.pad_file_at(file) {
            return;
        }
        debug_assert_eq!(
            self.files.file_offset(file) % self.files.piece_length() as u64,
            0
        );

        let piece_length = self.files.piece_length();
        let file_first_piece =
            (self.files.file_offset(file) / piece_length as u64) as usize;
        // a file smaller than one piece pads its block tree to the next
        // power of two rather than to the piece boundary
        let padded_leafs = if self.files.file_size(file)
            < piece_length as u64
        {
            merkle::merkle_num_leafs(self.files.file_num_blocks(file))
        } else {
            (piece_length / BLOCK_LEN) as usize
        };
        let root = merkle::merkle_root_padded(
            &hashes.blocks,
            padded_leafs,
            [0; 32],
        );
        self.set_hash2(file, piece - file_first_piece, root);
    }

    /// Computes each file's Merkle root from its piece roots and stores it
    /// in the file model.
    fn finalize_roots(&mut self) {
        if self.is_v1_only() {
            return;
        }
        let pad = merkle::merkle_pad(
            (self.files.piece_length() / BLOCK_LEN) as usize,
        );
        for file in 0..self.files.num_files() {
            let hashes = &self.file_piece_hashes[file];
            if hashes.is_empty() {
                continue;
            }
            let root = if hashes.len() == 1 {
                hashes[0]
            } else {
                merkle::merkle_root_padded(
                    hashes,
                    merkle::merkle_num_leafs(hashes.len()),
                    pad,
                )
            };
            self.files.set_root(file, root);
        }
    }

    /// The SHA-1 info-hash of the torrent, once hashed.
    pub fn info_hash_v1(&self) -> Result<Option<Sha1Hash>, CreateError> {
        if self.is_v2_only() {
            return Ok(None);
        }
        let info = self.emit_info()?.encode();
        Ok(Some(Sha1::digest(&info).into()))
    }

    /// The SHA-256 info-hash of the torrent, once hashed.
    pub fn info_hash_v2(&self) -> Result<Option<Sha256Hash>, CreateError> {
        if self.is_v1_only() {
            return Ok(None);
        }
        let info = self.emit_info()?.encode();
        Ok(Some(Sha256::digest(&info).into()))
    }

    /// Serializes the metainfo into its canonical bencoded form.
    pub fn emit(&self) -> Result<Vec<u8>, CreateError> {
        let mut root = Value::dict();

        if let Some(first) = self.trackers.first().and_then(|t| t.first()) {
            root.insert("announce", Value::bytes(first.as_str()));
        }
        if self.trackers.iter().map(|t| t.len()).sum::<usize>() > 1 {
            root.insert(
                "announce-list",
                Value::List(
                    self.trackers
                        .iter()
                        .filter(|tier| !tier.is_empty())
                        .map(|tier| {
                            Value::List(
                                tier.iter()
                                    .map(|url| Value::bytes(url.as_str()))
                                    .collect(),
                            )
                        })
                        .collect(),
                ),
            );
        }
        if let Some(comment) = &self.comment {
            root.insert("comment", Value::bytes(comment.as_str()));
        }
        if let Some(creator) = &self.creator {
            root.insert("created by", Value::bytes(creator.as_str()));
        }
        if let Some(date) = self.creation_date {
            root.insert("creation date", Value::Int(date));
        }

        root.insert("info", self.emit_info()?);

        if !self.is_v1_only() {
            let mut layers = Value::dict();
            let mut any = false;
            for file in 0..self.files.num_files() {
                let hashes = &self.file_piece_hashes[file];
                // single-piece files' roots carry all the information; only
                // files of two or more pieces have a layer entry
                if hashes.len() < 2 {
                    continue;
                }
                let root_hash = self
                    .files
                    .root(file)
                    .expect("roots are set when hashing finishes");
                let mut concat = Vec::with_capacity(hashes.len() * 32);
                for h in hashes {
                    concat.extend_from_slice(h);
                }
                layers.insert(root_hash.to_vec(), Value::Bytes(concat));
                any = true;
            }
            if any {
                root.insert("piece layers", layers);
            }
        }

        match self.url_seeds.len() {
            0 => {}
            1 => root.insert(
                "url-list",
                Value::bytes(self.url_seeds[0].as_str()),
            ),
            _ => root.insert(
                "url-list",
                Value::List(
                    self.url_seeds
                        .iter()
                        .map(|u| Value::bytes(u.as_str()))
                        .collect(),
                ),
            ),
        }

        Ok(root.encode())
    }

    fn emit_info(&self) -> Result<Value, CreateError> {
        if !self.hashed && !self.piece_hashes.iter().all(Option::is_some) {
            return Err(CreateError::MissingHashes);
        }

        let fs = &self.files;
        let mut info = Value::dict();

        if !self.is_v2_only() {
            if is_single_file(fs) {
                info.insert("length", Value::Int(fs.file_size(0) as i64));
                if let Some(attr) = self.attr_string(0) {
                    info.insert("attr", Value::bytes(attr));
                }
                if let Some(mtime) = self.mtime_of(0) {
                    info.insert("mtime", Value::Int(mtime));
                }
            } else {
                let mut files = Vec::with_capacity(fs.num_files());
                for file in 0..fs.num_files() {
                    let mut entry = Value::dict();
                    entry.insert(
                        "length",
                        Value::Int(fs.file_size(file) as i64),
                    );
                    let full = fs.file_name(file);
                    let components: Vec<Value> = full
                        .split('/')
                        .skip(1) // the torrent name is the `name` key
                        .map(Value::bytes)
                        .collect();
                    entry.insert("path", Value::List(components));
                    if let Some(attr) = self.attr_string(file) {
                        entry.insert("attr", Value::bytes(attr));
                    }
                    if let Some(mtime) = self.mtime_of(file) {
                        entry.insert("mtime", Value::Int(mtime));
                    }
                    if let Some(target) = self.symlink_of(file) {
                        entry.insert("symlink path", target);
                    }
                    files.push(entry);
                }
                info.insert("files", Value::List(files));
            }

            let mut pieces = Vec::with_capacity(self.piece_hashes.len() * 20);
            for hash in &self.piece_hashes {
                pieces.extend_from_slice(
                    hash.as_ref().ok_or(CreateError::MissingHashes)?,
                );
            }
            info.insert("pieces", Value::Bytes(pieces));
        }

        if !self.is_v1_only() {
            info.insert("meta version", Value::Int(2));
            info.insert("file tree", self.emit_file_tree()?);
        }

        info.insert("name", Value::bytes(fs.name()));
        info.insert(
            "piece length",
            Value::Int(fs.piece_length() as i64),
        );
        if self.private {
            info.insert("private", Value::Int(1));
        }
        Ok(info)
    }

    fn emit_file_tree(&self) -> Result<Value, CreateError> {
        let fs = &self.files;
        let mut tree = Value::dict();
        for file in 0..fs.num_files() {
            // pad files do not appear in the tree
            if fs.pad_file_at(file) {
                continue;
            }
            let full = fs.file_name(file);
            let components: Vec<&str> = if is_single_file(fs) {
                vec![full.as_str()]
            } else {
                full.split('/').skip(1).collect()
            };

            let mut node = &mut tree;
            for c in &components {
                node = node.entry_dict(*c);
            }

            let mut leaf = Value::dict();
            leaf.insert("length", Value::Int(fs.file_size(file) as i64));
            if fs.file_size(file) > 0 {
                let root = fs
                    .root(file)
                    .ok_or(CreateError::MissingHashes)?;
                leaf.insert("pieces root", Value::Bytes(root.to_vec()));
            }
            if let Some(attr) = self.attr_string(file) {
                leaf.insert("attr", Value::bytes(attr));
            }
            if let Some(mtime) = self.mtime_of(file) {
                leaf.insert("mtime", Value::Int(mtime));
            }
            if let Some(target) = self.symlink_of(file) {
                leaf.insert("symlink path", target);
            }
            node.insert("", leaf);
        }
        Ok(tree)
    }

    fn attr_string(&self, file: FileIndex) -> Option<String> {
        let flags = self.files.file_flags(file);
        let mut attr = String::new();
        if flags.contains(FileFlags::PAD) {
            attr.push('p');
        }
        if !self.flags.contains(CreateFlags::NO_ATTRIBUTES) {
            if flags.contains(FileFlags::HIDDEN) {
                attr.push('h');
            }
            if flags.contains(FileFlags::EXECUTABLE) {
                attr.push('x');
            }
        }
        if flags.contains(FileFlags::SYMLINK)
            && self.flags.contains(CreateFlags::SYMLINKS)
        {
            attr.push('l');
        }
        if attr.is_empty() {
            None
        } else {
            Some(attr)
        }
    }

    fn mtime_of(&self, file: FileIndex) -> Option<i64> {
        if self.flags.contains(CreateFlags::MODIFICATION_TIME) {
            self.files.file_mtime(file)
        } else {
            None
        }
    }

    fn symlink_of(&self, file: FileIndex) -> Option<Value> {
        if !self.flags.contains(CreateFlags::SYMLINKS) {
            return None;
        }
        self.files.symlink(file).map(|target| {
            Value::List(
                target.split('/').map(Value::bytes).collect(),
            )
        })
    }
}

/// True when the one file *is* the torrent root (as opposed to a directory
/// torrent that happens to hold a single file).
fn is_single_file(fs: &FileStorage) -> bool {
    fs.num_files() == 1 && fs.file_name(0) == fs.name()
}

/// Picks the piece length for the given total size: the smallest entry of
/// the table whose threshold exceeds the size.
fn auto_piece_length(total_size: u64) -> u32 {
    const SIZE_TABLE: [u64; 10] = [
        2_684_355,         // -> 16 KiB
        10_737_418,        // -> 32 KiB
        42_949_673,        // -> 64 KiB
        171_798_692,       // -> 128 KiB
        687_194_767,       // -> 256 KiB
        2_748_779_069,     // -> 512 KiB
        10_995_116_278,    // -> 1 MiB
        43_980_465_111,    // -> 2 MiB
        175_921_860_444,   // -> 4 MiB
        703_687_441_777,   // -> 8 MiB
    ];
    let mut i = 0;
    for threshold in SIZE_TABLE.iter() {
        if *threshold >= total_size {
            break;
        }
        i += 1;
    }
    BLOCK_LEN << i
}

fn validate_piece_length(
    piece_length: u32,
    total_size: u64,
    flags: CreateFlags,
) -> Result<u32, CreateError> {
    let mut piece_length = if piece_length == 0 {
        auto_piece_length(total_size)
    } else {
        piece_length
    };

    if !flags.contains(CreateFlags::V1_ONLY) {
        // v2 torrents require power-of-two pieces of at least 16 KiB
        piece_length = piece_length.max(16 * 1024);
        if !piece_length.is_power_of_two() {
            return Err(CreateError::InvalidPieceSize);
        }
    } else if piece_length % (16 * 1024) != 0
        && !piece_length.is_power_of_two()
        && !flags.contains(CreateFlags::ALLOW_ODD_PIECE_SIZE)
    {
        return Err(CreateError::InvalidPieceSize);
    }
    if piece_length == 0 || piece_length > 128 * 1024 * 1024 {
        return Err(CreateError::InvalidPieceSize);
    }
    Ok(piece_length)
}
