//! The immutable description of a torrent's file layout.
//!
//! [`FileStorage`] is the canonical per-torrent file list: every other
//! component (storage, disk jobs, the create pipeline) consults it for piece
//! geometry and for mapping between the contiguous torrent byte stream and
//! byte ranges of individual files.
//!
//! Paths stored here are torrent-internal: `/`-separated, relative, and in
//! multi-file torrents rooted at the torrent's name. Pad files synthesized
//! by canonicalization live under the reserved `.pad` directory.

use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::{path, FileIndex, PieceIndex, Sha256Hash, BLOCK_LEN};

/// The reserved directory name for pad files.
const PAD_DIR: &str = ".pad";

/// The longest accepted torrent-internal path, in bytes.
const MAX_PATH_LEN: usize = 4096;

/// Per-file attribute flags, as carried by the metainfo `attr` string.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FileFlags(u8);

impl FileFlags {
    /// The file is a zero-filled pad file aligning the next file to a piece
    /// boundary.
    pub const PAD: Self = Self(1);
    /// The file is hidden (`attr` `h`).
    pub const HIDDEN: Self = Self(1 << 1);
    /// The file is executable (`attr` `x`).
    pub const EXECUTABLE: Self = Self(1 << 2);
    /// The file is a symlink (`attr` `l`).
    pub const SYMLINK: Self = Self(1 << 3);

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl std::ops::BitOr for FileFlags {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for FileFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// Where a file's directory lives.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum DirRef {
    /// Directly inside the torrent root.
    Root,
    /// Index into the deduplicated [`FileStorage::paths`] table.
    Index(usize),
    /// The file was renamed to an absolute path outside the torrent; its
    /// `name` holds the full path.
    Absolute,
}

/// One file of a torrent.
#[derive(Clone, Debug)]
pub struct FileEntry {
    /// The leaf filename, or the full path for absolute entries.
    name: String,
    /// The directory portion of the path.
    dir: DirRef,
    /// Byte length of the file.
    size: u64,
    /// Offset of the file within the concatenated torrent byte stream.
    offset: u64,
    /// Attribute flags.
    flags: FileFlags,
    /// Modification time, seconds since the epoch.
    mtime: Option<i64>,
    /// Index into the deduplicated symlink table, iff the symlink flag is
    /// set.
    symlink: Option<usize>,
    /// SHA-256 Merkle root of the file's block hashes, for v2 torrents.
    root: Option<Sha256Hash>,
}

impl FileEntry {
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn flags(&self) -> FileFlags {
        self.flags
    }

    pub fn is_pad_file(&self) -> bool {
        self.flags.contains(FileFlags::PAD)
    }

    pub fn mtime(&self) -> Option<i64> {
        self.mtime
    }

    pub fn root(&self) -> Option<Sha256Hash> {
        self.root
    }
}

/// A byte range of one file, produced by [`FileStorage::map_block`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FileSlice {
    /// The index of the file the slice is in.
    pub file_index: FileIndex,
    /// The byte offset in file, relative to the file's start.
    pub offset: u64,
    /// The length of the slice, in bytes. Always positive.
    pub size: u64,
}

/// The location of a byte range within the piece space, produced by
/// [`FileStorage::map_file`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PieceRange {
    pub piece: PieceIndex,
    pub start: u32,
    pub size: u64,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FileStorageError {
    #[error("empty file path")]
    EmptyPath,
    #[error("file path exceeds {MAX_PATH_LEN} bytes")]
    PathTooLong,
    #[error("absolute paths are not allowed in a torrent: {0}")]
    AbsolutePath(String),
    #[error("invalid path component in {0}")]
    InvalidComponent(String),
    #[error("the {PAD_DIR} directory is reserved for pad files")]
    ReservedPadDir,
    #[error("duplicate file path: {0}")]
    DuplicateFile(String),
    #[error("path is both a file and a directory: {0}")]
    FileDirConflict(String),
    #[error("a single-file torrent cannot hold further files")]
    SingleFileConflict,
    #[error("file {0} does not share the torrent root {1}")]
    RootMismatch(String, String),
}

/// The canonical, ordered description of all files in a torrent.
#[derive(Clone, Debug, Default)]
pub struct FileStorage {
    files: Vec<FileEntry>,
    /// Deduplicated directory paths, relative to the torrent root, without
    /// the torrent name.
    paths: Vec<String>,
    /// Deduplicated symlink targets, relative to the torrent root.
    symlinks: Vec<String>,
    /// The torrent's name: the root directory for multi-file torrents, the
    /// filename for single-file ones.
    name: String,
    /// True when this is a single-file torrent: the one file *is* the root.
    root_is_file: bool,
    piece_length: u32,
    total_size: u64,
    v1: bool,
    v2: bool,
}

impl FileStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the nominal piece length. Must be called before geometry queries
    /// and before adding files to a v2 layout.
    pub fn set_piece_length(&mut self, piece_length: u32) {
        self.piece_length = piece_length;
    }

    pub fn piece_length(&self) -> u32 {
        self.piece_length
    }

    pub fn set_name(&mut self, name: &str) {
        self.name = name.to_string();
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_v1(&mut self, v1: bool) {
        self.v1 = v1;
    }

    pub fn set_v2(&mut self, v2: bool) {
        self.v2 = v2;
    }

    /// True if the torrent carries v1 (SHA-1) piece hashes.
    pub fn v1(&self) -> bool {
        self.v1
    }

    /// True if the torrent carries v2 (SHA-256 Merkle) hashes.
    pub fn v2(&self) -> bool {
        self.v2
    }

    pub fn num_files(&self) -> usize {
        self.files.len()
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    pub fn num_pieces(&self) -> usize {
        debug_assert!(self.piece_length > 0);
        ((self.total_size + self.piece_length as u64 - 1)
            / self.piece_length as u64) as usize
    }

    pub fn files(&self) -> impl Iterator<Item = &FileEntry> {
        self.files.iter()
    }

    /// Validates and appends a file.
    ///
    /// `path` is the torrent-internal path: just the filename for a
    /// single-file torrent, or `name/dir.../leaf` for a multi-file one. For
    /// a v2 layout (`set_v2` called up front with a piece length), a pad
    /// file is inserted first whenever the new file would not start on a
    /// piece boundary.
    pub fn add_file(
        &mut self,
        path: &str,
        size: u64,
        flags: FileFlags,
        mtime: Option<i64>,
        symlink_target: Option<&str>,
    ) -> Result<(), FileStorageError> {
        let (branch, leaf) = self.validate_path(path)?;
        self.check_collision(path)?;

        if self.v2
            && self.piece_length > 0
            && size > 0
            && !flags.contains(FileFlags::PAD)
            && self.total_size % self.piece_length as u64 != 0
        {
            self.add_pad_file();
        }

        let dir = match branch {
            None => DirRef::Root,
            Some(b) => DirRef::Index(self.get_or_add_path(b)),
        };
        let symlink = if flags.contains(FileFlags::SYMLINK) {
            Some(self.get_or_add_symlink(symlink_target.unwrap_or("")))
        } else {
            None
        };

        self.files.push(FileEntry {
            name: leaf,
            dir,
            size,
            offset: self.total_size,
            flags,
            mtime,
            symlink,
            root: None,
        });
        self.total_size += size;
        Ok(())
    }

    /// Records the v2 Merkle root of a file's block hash tree.
    pub fn set_root(&mut self, file: FileIndex, root: Sha256Hash) {
        self.files[file].root = root.into();
    }

    pub fn file_entry(&self, file: FileIndex) -> &FileEntry {
        &self.files[file]
    }

    pub fn file_size(&self, file: FileIndex) -> u64 {
        self.files[file].size
    }

    pub fn file_offset(&self, file: FileIndex) -> u64 {
        self.files[file].offset
    }

    pub fn file_flags(&self, file: FileIndex) -> FileFlags {
        self.files[file].flags
    }

    pub fn pad_file_at(&self, file: FileIndex) -> bool {
        self.files[file].is_pad_file()
    }

    pub fn file_mtime(&self, file: FileIndex) -> Option<i64> {
        self.files[file].mtime
    }

    pub fn symlink(&self, file: FileIndex) -> Option<&str> {
        self.files[file].symlink.map(|i| self.symlinks[i].as_str())
    }

    pub fn root(&self, file: FileIndex) -> Option<Sha256Hash> {
        self.files[file].root
    }

    /// The torrent-internal path of the file, beginning with the torrent's
    /// name (or, for single-file torrents, just the filename). Files renamed
    /// to absolute paths return that path unchanged.
    pub fn file_name(&self, file: FileIndex) -> String {
        let f = &self.files[file];
        match f.dir {
            DirRef::Absolute => f.name.clone(),
            DirRef::Root if self.root_is_file => f.name.clone(),
            DirRef::Root => format!("{}/{}", self.name, f.name),
            DirRef::Index(i) => {
                format!("{}/{}/{}", self.name, self.paths[i], f.name)
            }
        }
    }

    /// The on-disk path of the file under `save_path`.
    pub fn file_path(&self, file: FileIndex, save_path: &Path) -> PathBuf {
        let f = &self.files[file];
        if f.dir == DirRef::Absolute {
            PathBuf::from(&f.name)
        } else {
            save_path.join(self.file_name(file))
        }
    }

    /// A case-folded CRC-32 of the file's full on-disk path, used to detect
    /// distinct files that would collide on case-insensitive filesystems.
    pub fn file_path_hash(&self, file: FileIndex, save_path: &Path) -> u32 {
        let full = self.file_path(file, save_path);
        let folded = full.to_string_lossy().to_lowercase();
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(folded.as_bytes());
        hasher.finalize()
    }

    /// Renames a file. An absolute `new_name` detaches the file from the
    /// torrent root entirely.
    pub fn rename_file(&mut self, file: FileIndex, new_name: &str) {
        let f = &mut self.files[file];
        if Path::new(new_name).is_absolute() {
            f.name = new_name.to_string();
            f.dir = DirRef::Absolute;
            return;
        }
        // a relative rename is interpreted like an added path: rooted at
        // the torrent name for multi-file torrents
        let stripped = if !self.root_is_file {
            path::split_first(new_name).1
        } else {
            new_name
        };
        let (branch, leaf) = match stripped {
            "" => (None, new_name),
            s => {
                let (b, l) = path::split_last(s);
                (if b.is_empty() { None } else { Some(b) }, l)
            }
        };
        let dir = match branch {
            None => DirRef::Root,
            Some(b) => {
                let b = b.to_string();
                DirRef::Index(self.get_or_add_path(&b))
            }
        };
        let f = &mut self.files[file];
        f.name = leaf.to_string();
        f.dir = dir;
    }

    /// The nominal size of the piece: `piece_length` for all pieces except
    /// possibly the last one.
    pub fn piece_size(&self, piece: PieceIndex) -> u32 {
        debug_assert!(piece < self.num_pieces());
        if piece + 1 == self.num_pieces() {
            let size_except_last =
                (self.num_pieces() as u64 - 1) * self.piece_length as u64;
            (self.total_size - size_except_last) as u32
        } else {
            self.piece_length
        }
    }

    /// The v2-aware piece size: the number of bytes of the piece that belong
    /// to the file the piece starts in. This is shorter than
    /// [`piece_size`](Self::piece_size) for the last piece of a file that is
    /// followed by a pad file.
    pub fn piece_size2(&self, piece: PieceIndex) -> u32 {
        debug_assert!(piece < self.num_pieces());
        let piece_offset = piece as u64 * self.piece_length as u64;
        // the first file starting strictly after the piece's first byte
        // bounds the piece's v2 payload
        let next = self
            .files
            .partition_point(|f| f.offset <= piece_offset);
        match self.files.get(next) {
            None => self.piece_size(piece),
            Some(f) => {
                (self.piece_length as u64).min(f.offset - piece_offset) as u32
            }
        }
    }

    /// The number of 16 KiB blocks in the v2 payload of the piece.
    pub fn blocks_in_piece2(&self, piece: PieceIndex) -> usize {
        (self.piece_size2(piece) as usize + BLOCK_LEN as usize - 1)
            / BLOCK_LEN as usize
    }

    /// The number of pieces the file spans in its own v2 hash tree.
    pub fn file_num_pieces(&self, file: FileIndex) -> usize {
        debug_assert!(self.piece_length > 0);
        ((self.files[file].size + self.piece_length as u64 - 1)
            / self.piece_length as u64) as usize
    }

    /// The number of 16 KiB blocks in the file.
    pub fn file_num_blocks(&self, file: FileIndex) -> usize {
        ((self.files[file].size + BLOCK_LEN as u64 - 1) / BLOCK_LEN as u64)
            as usize
    }

    /// The index of the file containing the given offset of the torrent
    /// byte stream. Zero-sized files never contain any offset.
    pub fn file_index_at_offset(&self, offset: u64) -> FileIndex {
        debug_assert!(offset < self.total_size);
        // the last file starting at or before the offset; skip backwards
        // over zero-sized files sharing the same offset
        let mut index =
            self.files.partition_point(|f| f.offset <= offset) - 1;
        while self.files[index].size == 0 && index > 0 {
            index -= 1;
        }
        index
    }

    /// The index of the file containing the piece's first byte.
    pub fn file_index_at_piece(&self, piece: PieceIndex) -> FileIndex {
        self.file_index_at_offset(piece as u64 * self.piece_length as u64)
    }

    /// Finds the file whose v2 Merkle root equals `root`. Linear in the
    /// number of files.
    pub fn file_index_for_root(&self, root: &Sha256Hash) -> Option<FileIndex> {
        self.files.iter().position(|f| f.root.as_ref() == Some(root))
    }

    /// Maps a byte range of a piece onto the ordered list of file slices it
    /// covers. The range is truncated at the end of the torrent. Every
    /// returned slice has a positive length and a valid in-file offset.
    pub fn map_block(
        &self,
        piece: PieceIndex,
        offset: u32,
        size: u64,
    ) -> Vec<FileSlice> {
        let global = piece as u64 * self.piece_length as u64 + offset as u64;
        debug_assert!(global < self.total_size);
        let mut remaining = size.min(self.total_size - global);
        let mut slices = Vec::new();
        let mut index = self.file_index_at_offset(global);
        let mut global = global;
        while remaining > 0 && index < self.files.len() {
            let f = &self.files[index];
            if f.size == 0 {
                index += 1;
                continue;
            }
            let in_file = global - f.offset;
            let len = remaining.min(f.size - in_file);
            slices.push(FileSlice {
                file_index: index,
                offset: in_file,
                size: len,
            });
            global += len;
            remaining -= len;
            index += 1;
        }
        slices
    }

    /// The inverse of [`map_block`](Self::map_block): the piece-space
    /// location of a byte range of one file. The size is truncated at the
    /// end of the torrent; the caller iterates pieces as needed.
    pub fn map_file(
        &self,
        file: FileIndex,
        file_offset: u64,
        size: u64,
    ) -> PieceRange {
        let f = &self.files[file];
        debug_assert!(file_offset <= f.size);
        let global = f.offset + file_offset;
        PieceRange {
            piece: (global / self.piece_length as u64) as PieceIndex,
            start: (global % self.piece_length as u64) as u32,
            size: size.min(self.total_size.saturating_sub(global)),
        }
    }

    /// Brings the layout into v2-canonical form: files sorted
    /// lexicographically per path element, existing pad files removed, and
    /// pad files re-inserted so every non-empty file starts on a piece
    /// boundary. With `tail_padding`, the total size is padded up to a piece
    /// boundary as well (hybrid v1 compatibility).
    ///
    /// The operation is idempotent.
    pub fn canonicalize(&mut self, tail_padding: bool) {
        debug_assert!(self.piece_length > 0);

        let mut order: Vec<usize> = (0..self.files.len())
            .filter(|&i| !self.files[i].is_pad_file())
            .collect();
        order.sort_by(|&l, &r| {
            let (ld, lf) = self.dir_and_name(l);
            let (rd, rf) = self.dir_and_name(r);
            path::path_compare(ld, lf, rd, rf)
        });

        let old = std::mem::take(&mut self.files);
        let mut keep: Vec<Option<FileEntry>> =
            old.into_iter().map(Some).collect();
        self.total_size = 0;
        for i in order {
            let mut f = keep[i].take().expect("pad files were filtered out");
            if f.size > 0 {
                if self.total_size % self.piece_length as u64 != 0 {
                    self.add_pad_file();
                }
            }
            f.offset = self.total_size;
            self.total_size += f.size;
            self.files.push(f);
        }
        // single-file torrents are never padded; that would make
        // single-file hybrid torrents impossible
        let data_files =
            self.files.iter().filter(|f| !f.is_pad_file()).count();
        if tail_padding
            && data_files > 1
            && self.total_size % self.piece_length as u64 != 0
        {
            self.add_pad_file();
        }
    }

    fn dir_and_name(&self, file: usize) -> (&str, &str) {
        let f = &self.files[file];
        match f.dir {
            DirRef::Index(i) => (self.paths[i].as_str(), f.name.as_str()),
            _ => ("", f.name.as_str()),
        }
    }

    /// Appends a pad file bringing the total size up to the next piece
    /// boundary.
    fn add_pad_file(&mut self) {
        let pad_size = self.piece_length as u64
            - self.total_size % self.piece_length as u64;
        debug_assert!(pad_size > 0);
        debug_assert!(pad_size < self.piece_length as u64);
        let dir = DirRef::Index(self.get_or_add_path(PAD_DIR));
        self.files.push(FileEntry {
            // pad files are conventionally named after their size
            name: pad_size.to_string(),
            dir,
            size: pad_size,
            offset: self.total_size,
            flags: FileFlags::PAD,
            mtime: None,
            symlink: None,
            root: None,
        });
        self.total_size += pad_size;
    }

    /// Splits and validates a torrent-internal path, establishing the
    /// torrent name on first use. Returns the branch path (without the
    /// torrent name) and the leaf filename.
    fn validate_path<'a>(
        &mut self,
        p: &'a str,
    ) -> Result<(Option<&'a str>, String), FileStorageError> {
        if p.is_empty() {
            return Err(FileStorageError::EmptyPath);
        }
        if p.len() >= MAX_PATH_LEN {
            return Err(FileStorageError::PathTooLong);
        }
        if p.starts_with('/') {
            return Err(FileStorageError::AbsolutePath(p.to_string()));
        }
        for c in p.split('/') {
            if c.is_empty() || c == ".." || c == "." {
                return Err(FileStorageError::InvalidComponent(
                    p.to_string(),
                ));
            }
        }

        let (first, rest) = path::split_first(p);
        if rest.is_empty() {
            // a single component: this is a single-file torrent
            if !self.files.is_empty() {
                return Err(FileStorageError::SingleFileConflict);
            }
            self.name = first.to_string();
            self.root_is_file = true;
            return Ok((None, first.to_string()));
        }

        if self.root_is_file {
            return Err(FileStorageError::SingleFileConflict);
        }
        if self.files.is_empty() && self.name.is_empty() {
            self.name = first.to_string();
        } else if first != self.name {
            return Err(FileStorageError::RootMismatch(
                p.to_string(),
                self.name.clone(),
            ));
        }

        let (branch, leaf) = path::split_last(rest);
        if branch == PAD_DIR || branch.starts_with(".pad/") {
            return Err(FileStorageError::ReservedPadDir);
        }
        Ok((
            if branch.is_empty() { None } else { Some(branch) },
            leaf.to_string(),
        ))
    }

    /// Rejects a path that duplicates an existing file or clashes with an
    /// existing directory prefix (a v2 file tree requires a strict
    /// file/directory distinction at every level).
    fn check_collision(&self, p: &str) -> Result<(), FileStorageError> {
        for i in 0..self.files.len() {
            let existing = self.file_name(i);
            if existing == p {
                return Err(FileStorageError::DuplicateFile(p.to_string()));
            }
            let is_prefix = |shorter: &str, longer: &str| {
                longer.len() > shorter.len()
                    && longer.starts_with(shorter)
                    && longer.as_bytes()[shorter.len()] == b'/'
            };
            if is_prefix(&existing, p) || is_prefix(p, &existing) {
                return Err(FileStorageError::FileDirConflict(p.to_string()));
            }
        }
        Ok(())
    }

    fn get_or_add_path(&mut self, dir: &str) -> usize {
        match self.paths.iter().position(|p| p == dir) {
            Some(i) => i,
            None => {
                self.paths.push(dir.to_string());
                self.paths.len() - 1
            }
        }
    }

    fn get_or_add_symlink(&mut self, target: &str) -> usize {
        match self.symlinks.iter().position(|s| s == target) {
            Some(i) => i,
            None => {
                self.symlinks.push(target.to_string());
                self.symlinks.len() - 1
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn storage(piece_length: u32, files: &[(&str, u64)]) -> FileStorage {
        let mut fs = FileStorage::new();
        fs.set_piece_length(piece_length);
        for (path, size) in files {
            fs.add_file(path, *size, FileFlags::default(), None, None)
                .unwrap();
        }
        fs
    }

    #[test]
    fn test_single_file_geometry() {
        let fs = storage(16384, &[("hello.txt", 13)]);
        assert_eq!(fs.name(), "hello.txt");
        assert_eq!(fs.num_files(), 1);
        assert_eq!(fs.num_pieces(), 1);
        assert_eq!(fs.total_size(), 13);
        assert_eq!(fs.piece_size(0), 13);
        assert_eq!(fs.file_name(0), "hello.txt");
    }

    #[test]
    fn test_total_size_is_sum_of_files() {
        let fs = storage(16, &[("t/0", 9), ("t/1", 11), ("t/2", 7)]);
        let sum: u64 = fs.files().map(|f| f.size()).sum();
        assert_eq!(sum, fs.total_size());
        assert_eq!(fs.num_pieces(), 2);
    }

    #[test]
    fn test_add_file_validation() {
        let mut fs = FileStorage::new();
        fs.set_piece_length(16384);
        assert_eq!(
            fs.add_file("", 0, FileFlags::default(), None, None),
            Err(FileStorageError::EmptyPath)
        );
        assert_eq!(
            fs.add_file("/abs/file", 1, FileFlags::default(), None, None),
            Err(FileStorageError::AbsolutePath("/abs/file".into()))
        );
        assert_eq!(
            fs.add_file("t/../esc", 1, FileFlags::default(), None, None),
            Err(FileStorageError::InvalidComponent("t/../esc".into()))
        );
        assert_eq!(
            fs.add_file("t/.pad/17", 1, FileFlags::default(), None, None),
            Err(FileStorageError::ReservedPadDir)
        );

        fs.add_file("t/a", 1, FileFlags::default(), None, None).unwrap();
        assert_eq!(
            fs.add_file("t/a", 2, FileFlags::default(), None, None),
            Err(FileStorageError::DuplicateFile("t/a".into()))
        );
        // "t/a" is a file, so "t/a/b" would make it a directory too
        assert_eq!(
            fs.add_file("t/a/b", 2, FileFlags::default(), None, None),
            Err(FileStorageError::FileDirConflict("t/a/b".into()))
        );
    }

    #[test]
    fn test_single_file_torrent_is_closed() {
        let mut fs = storage(16384, &[("one", 5)]);
        assert_eq!(
            fs.add_file("two", 5, FileFlags::default(), None, None),
            Err(FileStorageError::SingleFileConflict)
        );
    }

    // The multi-file layout of this test:
    //
    // pieces: (index:first byte offset)
    // --------------------------------------------------------------------
    // |0:0         |1:16          |2:32          |3:48          |4:64    |
    // --------------------------------------------------------------------
    // files: (index:first byte offset,last byte offset)
    // --------------------------------------------------------------------
    // |0:0,8 |1:9,19  |2:20,26|3:27,35 |4:36,47  |5:48,63       |6:64,71 |
    // --------------------------------------------------------------------
    fn seven_file_storage() -> FileStorage {
        storage(
            16,
            &[
                ("t/0", 9),
                ("t/1", 11),
                ("t/2", 7),
                ("t/3", 9),
                ("t/4", 12),
                ("t/5", 16),
                ("t/6", 8),
            ],
        )
    }

    #[test]
    fn test_file_index_at_offset() {
        let fs = seven_file_storage();
        assert_eq!(fs.file_index_at_offset(0), 0);
        assert_eq!(fs.file_index_at_offset(8), 0);
        assert_eq!(fs.file_index_at_offset(9), 1);
        assert_eq!(fs.file_index_at_offset(47), 4);
        assert_eq!(fs.file_index_at_offset(48), 5);
        assert_eq!(fs.file_index_at_offset(71), 6);
        assert_eq!(fs.file_index_at_piece(0), 0);
        assert_eq!(fs.file_index_at_piece(3), 5);
    }

    #[test]
    fn test_map_block_spanning_files() {
        let fs = seven_file_storage();
        // piece 1 starts at offset 16, inside file 1, and spans files 1-3
        assert_eq!(
            fs.map_block(1, 0, 16),
            vec![
                FileSlice { file_index: 1, offset: 7, size: 4 },
                FileSlice { file_index: 2, offset: 0, size: 7 },
                FileSlice { file_index: 3, offset: 0, size: 5 },
            ]
        );
        // a block contained in one file
        assert_eq!(
            fs.map_block(3, 0, 16),
            vec![FileSlice { file_index: 5, offset: 0, size: 16 }]
        );
        // truncated at the end of the torrent
        assert_eq!(
            fs.map_block(4, 0, 16),
            vec![FileSlice { file_index: 6, offset: 0, size: 8 }]
        );
    }

    #[test]
    fn test_map_file_inverts_map_block() {
        let fs = seven_file_storage();
        for piece in 0..fs.num_pieces() {
            let len = fs.piece_size(piece) as u64;
            let first = fs.map_block(piece, 0, len)[0];
            let range =
                fs.map_file(first.file_index, first.offset, first.size);
            assert_eq!(range.piece, piece);
            assert_eq!(range.start, 0);
        }
    }

    #[test]
    fn test_canonicalize_inserts_pad() {
        // two files of 100 and 200 bytes with 16 KiB pieces: one pad of
        // 16384-100 bytes lands between them
        let mut fs = storage(16384, &[("t/a", 100), ("t/b", 200)]);
        fs.canonicalize(false);

        assert_eq!(fs.num_files(), 3);
        assert!(fs.pad_file_at(1));
        assert_eq!(fs.file_size(1), 16284);
        assert_eq!(fs.file_name(1), "t/.pad/16284");
        assert_eq!(fs.total_size(), 100 + 16284 + 200);
        assert_eq!(fs.file_offset(2), 16384);
        // every non-pad file starts on a piece boundary
        for i in 0..fs.num_files() {
            if !fs.pad_file_at(i) {
                assert_eq!(fs.file_offset(i) % 16384, 0);
            }
        }
    }

    #[test]
    fn test_canonicalize_sorts_and_is_idempotent() {
        let mut fs = storage(16384, &[("t/z", 10), ("t/a", 20), ("t/m", 5)]);
        fs.canonicalize(false);
        let first: Vec<_> = (0..fs.num_files())
            .map(|i| (fs.file_name(i), fs.file_offset(i)))
            .collect();
        assert_eq!(first[0].0, "t/a");

        fs.canonicalize(false);
        let second: Vec<_> = (0..fs.num_files())
            .map(|i| (fs.file_name(i), fs.file_offset(i)))
            .collect();
        assert_eq!(first, second);
    }

    #[test]
    fn test_canonicalize_tail_padding() {
        let mut fs = storage(16384, &[("t/a", 100), ("t/b", 200)]);
        fs.canonicalize(true);
        // a, pad, b, tail pad
        assert_eq!(fs.num_files(), 4);
        assert!(fs.pad_file_at(3));
        assert_eq!(fs.total_size(), 2 * 16384);

        // a lone file is never tail padded
        let mut fs = storage(16384, &[("solo.bin", 100)]);
        fs.canonicalize(true);
        assert_eq!(fs.num_files(), 1);
        assert_eq!(fs.total_size(), 100);
    }

    #[test]
    fn test_piece_size2_stops_at_pad() {
        let mut fs = storage(16384, &[("t/a", 100), ("t/b", 200)]);
        fs.canonicalize(false);
        // piece 0 holds file a (100 bytes) followed by a pad; its v2
        // payload is only the 100 bytes of a
        assert_eq!(fs.piece_size(0), 16384);
        assert_eq!(fs.piece_size2(0), 100);
        assert_eq!(fs.blocks_in_piece2(0), 1);
        // piece 1 holds file b alone
        assert_eq!(fs.piece_size2(1), 200);
    }

    #[test]
    fn test_eager_v2_padding_on_add() {
        let mut fs = FileStorage::new();
        fs.set_piece_length(16384);
        fs.set_v2(true);
        fs.add_file("t/a", 100, FileFlags::default(), None, None).unwrap();
        fs.add_file("t/b", 200, FileFlags::default(), None, None).unwrap();
        assert_eq!(fs.num_files(), 3);
        assert!(fs.pad_file_at(1));
        assert_eq!(fs.file_offset(2), 16384);
    }

    #[test]
    fn test_file_path_hash_case_folds() {
        let mut a = FileStorage::new();
        a.set_piece_length(16384);
        a.add_file("t/File", 1, FileFlags::default(), None, None).unwrap();
        let mut b = FileStorage::new();
        b.set_piece_length(16384);
        b.add_file("t/file", 1, FileFlags::default(), None, None).unwrap();

        let save = Path::new("/downloads");
        assert_eq!(a.file_path_hash(0, save), b.file_path_hash(0, save));
    }

    #[test]
    fn test_rename_file() {
        let mut fs = storage(16384, &[("t/a", 10), ("t/b", 20)]);
        fs.rename_file(0, "t/sub/renamed");
        assert_eq!(fs.file_name(0), "t/sub/renamed");

        fs.rename_file(1, "/elsewhere/b");
        assert_eq!(fs.file_name(1), "/elsewhere/b");
        assert_eq!(
            fs.file_path(1, Path::new("/downloads")),
            PathBuf::from("/elsewhere/b")
        );
    }

    #[test]
    fn test_symlink_table_dedup() {
        let mut fs = FileStorage::new();
        fs.set_piece_length(16384);
        fs.add_file(
            "t/link1",
            0,
            FileFlags::SYMLINK,
            None,
            Some("target/file"),
        )
        .unwrap();
        fs.add_file(
            "t/link2",
            0,
            FileFlags::SYMLINK,
            None,
            Some("target/file"),
        )
        .unwrap();
        assert_eq!(fs.symlink(0), Some("target/file"));
        assert_eq!(fs.symlink(1), Some("target/file"));
        assert_eq!(fs.symlinks.len(), 1);
    }
}
