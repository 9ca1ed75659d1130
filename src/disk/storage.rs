//! The per-torrent storage: the IO façade between the torrent's file model
//! and its on-disk layout.
//!
//! All operations here execute on disk engine worker threads; nothing is
//! called directly by user code. Pad files never touch the disk: reads
//! covering a pad region zero-fill it and writes covering one skip it.

use std::{
    collections::HashMap,
    io,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use sha1::{Digest, Sha1};
use sha2::Sha256;

use crate::{
    disk::{
        error::{
            CheckOutcome, JobError, Operation, StatusFlags, StorageError,
        },
        fence::JobFence,
        file::OpenMode,
        file_pool::FilePool,
        job::{DeleteOptions, MoveMode, ResumeData},
        store_buffer::StoreBuffer,
    },
    path, FileIndex, FileStorage, PieceIndex, Sha1Hash, Sha256Hash,
    TorrentIndex, BLOCK_LEN,
};

/// Yields the `(offset, length)` of each block of a piece of the given
/// length, in order. Only the final block may fall short of
/// [`BLOCK_LEN`].
fn piece_blocks(piece_len: u32) -> impl Iterator<Item = (u32, u32)> {
    (0..piece_len)
        .step_by(BLOCK_LEN as usize)
        .map(move |offset| (offset, BLOCK_LEN.min(piece_len - offset)))
}

/// How file space is claimed on disk.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StorageMode {
    /// Let files grow as pieces arrive.
    Sparse,
    /// Preallocate every wanted file up front.
    Allocate,
}

/// The default priority of a file nothing was requested for.
const DEFAULT_PRIORITY: u8 = 4;

/// Everything needed to register a torrent's storage with the disk engine.
#[derive(Clone, Debug)]
pub struct StorageParams {
    pub files: Arc<FileStorage>,
    pub save_path: PathBuf,
    pub mode: StorageMode,
    /// Per-file priorities; zero means the file is not wanted. Missing
    /// entries default to [`DEFAULT_PRIORITY`].
    pub priorities: Vec<u8>,
    /// Renames accumulated in a previous session, applied to the model at
    /// registration.
    pub renamed_files: HashMap<FileIndex, String>,
    /// The v1 info-hash of a hybrid torrent.
    pub info_hash_v1: Option<Sha1Hash>,
    pub want_v1_hashes: bool,
    pub want_v2_hashes: bool,
}

impl StorageParams {
    pub fn new(files: Arc<FileStorage>, save_path: impl Into<PathBuf>) -> Self {
        let v1 = files.v1();
        let v2 = files.v2();
        Self {
            files,
            save_path: save_path.into(),
            mode: StorageMode::Sparse,
            priorities: Vec::new(),
            renamed_files: HashMap::new(),
            info_hash_v1: None,
            want_v1_hashes: v1,
            want_v2_hashes: v2,
        }
    }
}

/// A registered torrent's storage. Owned by the disk engine's torrent
/// table; jobs hold a shared reference that keeps it alive until they
/// complete, even across removal.
pub(crate) struct Storage {
    index: TorrentIndex,
    /// The torrent's own copy of the file model, with renames applied.
    files: Mutex<FileStorage>,
    save_path: Mutex<PathBuf>,
    mode: StorageMode,
    priorities: Mutex<Vec<u8>>,
    /// The per-storage disk-job fence; counters live here, manipulated by
    /// the engine on submission and completion.
    pub fence: JobFence,
}

impl Storage {
    pub fn new(index: TorrentIndex, params: StorageParams) -> Self {
        let mut files = (*params.files).clone();
        for (file, name) in &params.renamed_files {
            files.rename_file(*file, name);
        }
        let mut priorities = params.priorities;
        priorities.resize(files.num_files(), DEFAULT_PRIORITY);

        if let Some(hash) = params.info_hash_v1 {
            log::debug!(
                "Storage {} bound to v1 torrent {}",
                index,
                hex::encode(hash)
            );
        }

        Self {
            index,
            files: Mutex::new(files),
            save_path: Mutex::new(params.save_path),
            mode: params.mode,
            priorities: Mutex::new(priorities),
            fence: JobFence::default(),
        }
    }

    pub fn index(&self) -> TorrentIndex {
        self.index
    }

    pub fn save_path(&self) -> PathBuf {
        self.save_path.lock().unwrap().clone()
    }

    pub fn piece_size(&self, piece: PieceIndex) -> u32 {
        self.files.lock().unwrap().piece_size(piece)
    }

    pub fn piece_size2(&self, piece: PieceIndex) -> u32 {
        self.files.lock().unwrap().piece_size2(piece)
    }

    fn file_path(&self, file: FileIndex) -> PathBuf {
        let fs = self.files.lock().unwrap();
        let save_path = self.save_path.lock().unwrap();
        fs.file_path(file, &save_path)
    }

    /// Creates the save directory and, in allocate mode, claims the space
    /// of every wanted file. Reports files on disk that are larger than the
    /// model says through the advisory flags.
    pub fn initialize(
        &self,
        pool: &FilePool,
    ) -> Result<StatusFlags, StorageError> {
        let save_path = self.save_path();
        path::create_directories(&save_path)
            .map_err(|e| StorageError::new(Operation::Mkdir, e))?;

        let mut flags = StatusFlags::default();
        let num_files = self.files.lock().unwrap().num_files();
        let priorities = self.priorities.lock().unwrap().clone();
        for file in 0..num_files {
            let (size, is_pad, symlink) = {
                let fs = self.files.lock().unwrap();
                (
                    fs.file_size(file),
                    fs.pad_file_at(file),
                    fs.symlink(file).map(str::to_string),
                )
            };
            if is_pad {
                continue;
            }
            let target = self.file_path(file);

            if let Some(link_target) = symlink {
                if !path::exists(&target) {
                    if let Some(parent) = target.parent() {
                        path::create_directories(parent).map_err(|e| {
                            StorageError::with_file(Operation::Mkdir, file, e)
                        })?;
                    }
                    std::os::unix::fs::symlink(&link_target, &target)
                        .map_err(|e| {
                            StorageError::with_file(
                                Operation::Symlink,
                                file,
                                e,
                            )
                        })?;
                }
                continue;
            }

            match path::stat(&target, true) {
                Ok(meta) if meta.len() > size => {
                    flags |= StatusFlags::OVERSIZED_FILE;
                }
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(StorageError::with_file(
                        Operation::Stat,
                        file,
                        e,
                    ))
                }
            }

            if self.mode == StorageMode::Allocate
                && size > 0
                && priorities.get(file).copied().unwrap_or(0) > 0
            {
                let handle = pool.open(
                    self.index,
                    file,
                    &target,
                    OpenMode::READ | OpenMode::WRITE,
                )?;
                handle.allocate(size).map_err(|e| {
                    StorageError::with_file(Operation::Fallocate, file, e)
                })?;
            }
        }
        Ok(flags)
    }

    /// True if any of the torrent's files is present on disk. Used to
    /// decide whether a torrent without resume data needs a recheck.
    pub fn has_any_file(&self) -> Result<bool, StorageError> {
        let num_files = self.files.lock().unwrap().num_files();
        for file in 0..num_files {
            if self.files.lock().unwrap().pad_file_at(file) {
                continue;
            }
            match path::stat(&self.file_path(file), true) {
                Ok(_) => return Ok(true),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(StorageError::with_file(
                        Operation::Stat,
                        file,
                        e,
                    ))
                }
            }
        }
        Ok(false)
    }

    /// Verifies resume data against the on-disk state, honoring hard-link
    /// sources first: for every `Some` entry in `links`, the file is linked
    /// in from the external path (degrading to a copy across filesystems),
    /// and any IO error fails the whole check.
    pub fn check_fastresume(
        &self,
        resume: Option<&ResumeData>,
        links: &[Option<PathBuf>],
    ) -> Result<(CheckOutcome, StatusFlags), StorageError> {
        for (file, link) in links.iter().enumerate() {
            let source = match link {
                Some(source) => source,
                None => continue,
            };
            let target = self.file_path(file);
            if let Some(parent) = target.parent() {
                path::create_directories(parent).map_err(|e| {
                    StorageError::with_file(Operation::Mkdir, file, e)
                })?;
            }
            path::hard_link(source, &target).map_err(|e| {
                StorageError::with_file(Operation::HardLink, file, e)
            })?;
        }

        let resume = match resume {
            Some(resume) => resume,
            None => {
                return if self.has_any_file()? {
                    Ok((CheckOutcome::NeedFullCheck, StatusFlags::default()))
                } else {
                    Ok((CheckOutcome::Valid, StatusFlags::default()))
                };
            }
        };

        let mut flags = StatusFlags::default();
        let num_files = self.files.lock().unwrap().num_files();
        let priorities = self.priorities.lock().unwrap().clone();
        for file in 0..num_files {
            let (model_size, is_pad) = {
                let fs = self.files.lock().unwrap();
                (fs.file_size(file), fs.pad_file_at(file))
            };
            if is_pad || priorities.get(file).copied().unwrap_or(0) == 0 {
                continue;
            }
            let (claimed, _mtime) = match resume.file_sizes.get(file) {
                Some(entry) => *entry,
                None => continue,
            };
            if claimed == 0 {
                continue;
            }
            match path::stat(&self.file_path(file), true) {
                Ok(meta) => {
                    if meta.len() < claimed {
                        return Ok((CheckOutcome::NeedFullCheck, flags));
                    }
                    if meta.len() > model_size {
                        flags |= StatusFlags::OVERSIZED_FILE;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    return Ok((CheckOutcome::NeedFullCheck, flags));
                }
                Err(e) => {
                    return Err(StorageError::with_file(
                        Operation::CheckResume,
                        file,
                        e,
                    ))
                }
            }
        }
        Ok((CheckOutcome::Valid, flags))
    }

    /// Reads into `buf` starting at `(piece, offset)`. Bytes in pad regions
    /// are zero-filled. The request is truncated at the end of the torrent;
    /// a file shorter on disk than the model within the piece's v2 payload
    /// is a fatal error, beyond it the buffer is zero-filled.
    pub fn read(
        &self,
        pool: &FilePool,
        buf: &mut [u8],
        piece: PieceIndex,
        offset: u32,
        mode: OpenMode,
    ) -> Result<usize, StorageError> {
        let (slices, piece_size2, paths): (Vec<_>, u32, Vec<_>) = {
            let fs = self.files.lock().unwrap();
            let save_path = self.save_path.lock().unwrap();
            let slices = fs.map_block(piece, offset, buf.len() as u64);
            let paths = slices
                .iter()
                .map(|s| {
                    (
                        fs.file_path(s.file_index, &save_path),
                        fs.pad_file_at(s.file_index),
                    )
                })
                .collect();
            (slices, fs.piece_size2(piece), paths)
        };

        let mut filled = 0usize;
        for (slice, (file_path, is_pad)) in slices.iter().zip(paths) {
            let len = slice.size as usize;
            let out = &mut buf[filled..filled + len];
            if is_pad {
                for b in out.iter_mut() {
                    *b = 0;
                }
                filled += len;
                continue;
            }

            let handle = pool.open(
                self.index,
                slice.file_index,
                &file_path,
                mode,
            )?;
            let n = handle.read_at(out, slice.offset).map_err(|e| {
                StorageError::with_file(Operation::Read, slice.file_index, e)
            })?;
            if n < len {
                // short read: fatal while still inside the piece's v2
                // payload, zero-filled past it
                let piece_pos = offset as usize + filled + n;
                if (piece_pos as u32) < piece_size2 {
                    return Err(StorageError::with_file(
                        Operation::Read,
                        slice.file_index,
                        io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "file is shorter than the torrent expects",
                        ),
                    ));
                }
                for b in out[n..].iter_mut() {
                    *b = 0;
                }
            }
            filled += len;
        }
        Ok(filled)
    }

    /// Writes `buf` at `(piece, offset)`. Pad regions are skipped.
    pub fn write(
        &self,
        pool: &FilePool,
        buf: &[u8],
        piece: PieceIndex,
        offset: u32,
        mode: OpenMode,
    ) -> Result<usize, StorageError> {
        let (slices, paths): (Vec<_>, Vec<_>) = {
            let fs = self.files.lock().unwrap();
            let save_path = self.save_path.lock().unwrap();
            let slices = fs.map_block(piece, offset, buf.len() as u64);
            let paths = slices
                .iter()
                .map(|s| {
                    (
                        fs.file_path(s.file_index, &save_path),
                        fs.pad_file_at(s.file_index),
                    )
                })
                .collect();
            (slices, paths)
        };

        let mut written = 0usize;
        for (slice, (file_path, is_pad)) in slices.iter().zip(paths) {
            let len = slice.size as usize;
            if is_pad {
                written += len;
                continue;
            }
            let handle = pool.open(
                self.index,
                slice.file_index,
                &file_path,
                mode | OpenMode::WRITE,
            )?;
            handle
                .write_at(&buf[written..written + len], slice.offset)
                .map_err(|e| {
                    StorageError::with_file(
                        Operation::Write,
                        slice.file_index,
                        e,
                    )
                })?;
            written += len;
        }
        Ok(written)
    }

    /// Computes the piece's v1 SHA-1 (over the nominal piece, pad bytes
    /// included) and/or the SHA-256 of every block of its v2 payload.
    /// Blocks with a write still in flight are hashed from the store buffer
    /// rather than from disk.
    pub fn hash(
        &self,
        pool: &FilePool,
        store: &StoreBuffer,
        piece: PieceIndex,
        len: u32,
        want_v1: bool,
        want_v2: bool,
        mode: OpenMode,
    ) -> Result<(Option<Sha1Hash>, Vec<Sha256Hash>), StorageError> {
        let piece_size2 = self.piece_size2(piece);
        let mut sha = if want_v1 { Some(Sha1::new()) } else { None };
        let mut blocks = Vec::new();

        for (block_offset, block_size) in piece_blocks(len) {
            let block_size = block_size as usize;
            let mut block = vec![0u8; block_size];

            let buffered = store.get(
                &(self.index, piece, block_offset),
                |pending| {
                    let n = pending.len().min(block_size);
                    block[..n].copy_from_slice(&pending[..n]);
                },
            );
            if buffered.is_none() {
                self.read(pool, &mut block, piece, block_offset, mode)?;
            }

            if let Some(sha) = &mut sha {
                sha.update(&block);
            }
            if want_v2 && block_offset < piece_size2 {
                let payload =
                    block_size.min((piece_size2 - block_offset) as usize);
                blocks.push(Sha256::digest(&block[..payload]).into());
            }
        }

        let v1 = sha.map(|sha| {
            let mut hash = [0; 20];
            hash.copy_from_slice(&sha.finalize());
            hash
        });
        if let Some(hash) = &v1 {
            log::trace!("Piece {} hash {}", piece, hex::encode(hash));
        }
        Ok((v1, blocks))
    }

    /// Computes the SHA-256 of a single v2 block.
    pub fn hash2(
        &self,
        pool: &FilePool,
        store: &StoreBuffer,
        piece: PieceIndex,
        offset: u32,
        len: u32,
        mode: OpenMode,
    ) -> Result<Sha256Hash, StorageError> {
        debug_assert!(offset % BLOCK_LEN == 0);
        let len = len as usize;
        let mut block = vec![0u8; len];
        let buffered =
            store.get(&(self.index, piece, offset), |pending| {
                let n = pending.len().min(len);
                block[..n].copy_from_slice(&pending[..n]);
            });
        if buffered.is_none() {
            self.read(pool, &mut block, piece, offset, mode)?;
        }
        Ok(Sha256::digest(&block).into())
    }

    /// Moves the torrent's files to a new save path. Files renamed to
    /// absolute paths are left in place. Returns the new save path.
    pub fn move_storage(
        &self,
        pool: &FilePool,
        new_path: &Path,
        mode: MoveMode,
    ) -> Result<PathBuf, JobError> {
        pool.release(self.index);
        path::create_directories(new_path)
            .map_err(|e| StorageError::new(Operation::Mkdir, e))?;

        let old_save_path = self.save_path();
        let files: Vec<(FileIndex, String)> = {
            let fs = self.files.lock().unwrap();
            (0..fs.num_files())
                .filter(|&i| {
                    !fs.pad_file_at(i)
                        && !Path::new(&fs.file_name(i)).is_absolute()
                })
                .map(|i| (i, fs.file_name(i)))
                .collect()
        };

        if mode == MoveMode::FailIfExist {
            for (_, rel) in &files {
                if path::exists(&new_path.join(rel)) {
                    return Err(JobError::FileExist);
                }
            }
        }

        for (file, rel) in &files {
            let source = old_save_path.join(rel);
            if !path::exists(&source) {
                continue;
            }
            let target = new_path.join(rel);
            if mode == MoveMode::DontReplace && path::exists(&target) {
                continue;
            }
            if let Some(parent) = target.parent() {
                path::create_directories(parent).map_err(|e| {
                    StorageError::with_file(Operation::Mkdir, *file, e)
                })?;
            }
            path::move_file(&source, &target).map_err(|e| {
                StorageError::with_file(Operation::Rename, *file, e)
            })?;
        }

        // tidy up the now-possibly-empty old torrent directory
        let name = self.files.lock().unwrap().name().to_string();
        let _ = std::fs::remove_dir(old_save_path.join(name));

        *self.save_path.lock().unwrap() = new_path.to_path_buf();
        Ok(new_path.to_path_buf())
    }

    /// Renames one file, closing its pooled handle first. A file that does
    /// not exist on disk yet is renamed in the model only.
    pub fn rename_file(
        &self,
        pool: &FilePool,
        file: FileIndex,
        new_name: &str,
    ) -> Result<(), StorageError> {
        pool.release_file(self.index, file);

        let old_path = self.file_path(file);
        let new_path = {
            let mut preview = self.files.lock().unwrap().clone();
            preview.rename_file(file, new_name);
            preview.file_path(file, &self.save_path())
        };

        if path::exists(&old_path) && old_path != new_path {
            if let Some(parent) = new_path.parent() {
                path::create_directories(parent).map_err(|e| {
                    StorageError::with_file(Operation::Mkdir, file, e)
                })?;
            }
            path::rename(&old_path, &new_path).map_err(|e| {
                StorageError::with_file(Operation::Rename, file, e)
            })?;
        }
        self.files.lock().unwrap().rename_file(file, new_name);
        Ok(())
    }

    /// Drops the pooled handles of this torrent without touching data.
    pub fn release_files(&self, pool: &FilePool) {
        pool.release(self.index);
    }

    /// Best-effort removal of the torrent's data. The first error is
    /// reported but the remaining files are still attempted.
    pub fn delete_files(
        &self,
        pool: &FilePool,
        options: DeleteOptions,
    ) -> Result<(), StorageError> {
        pool.release(self.index);
        if !options.contains(DeleteOptions::FILES) {
            // nothing beyond partial data was requested and there is no
            // part file in sparse storage
            return Ok(());
        }

        let mut first_error = None;
        let num_files = self.files.lock().unwrap().num_files();
        let mut dirs = Vec::new();
        for file in 0..num_files {
            if self.files.lock().unwrap().pad_file_at(file) {
                continue;
            }
            let target = self.file_path(file);
            if let Some(parent) = target.parent() {
                dirs.push(parent.to_path_buf());
            }
            match path::remove(&target) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => {
                    log::warn!("Failed to delete {:?}: {}", target, e);
                    if first_error.is_none() {
                        first_error = Some(StorageError::with_file(
                            Operation::Remove,
                            file,
                            e,
                        ));
                    }
                }
            }
        }

        // remove now-empty directories, deepest first
        dirs.sort_by_key(|d| std::cmp::Reverse(d.components().count()));
        dirs.dedup();
        let save_path = self.save_path();
        for dir in dirs {
            if dir != save_path {
                let _ = std::fs::remove_dir(&dir);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Updates the per-file priorities.
    pub fn set_priorities(&self, priorities: &[u8]) {
        let mut current = self.priorities.lock().unwrap();
        for (i, p) in priorities.iter().enumerate() {
            if i < current.len() {
                current[i] = *p;
            }
        }
    }

    /// Periodic maintenance: flush files with accumulated writes so a crash
    /// loses as little as possible.
    pub fn tick(&self, pool: &FilePool) {
        pool.flush_dirty(self.index);
    }

    /// Stops the torrent: everything queued before this fence has run, so
    /// only the pooled handles remain to be dropped.
    pub fn stop(&self, pool: &FilePool) {
        pool.release(self.index);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_piece_blocks_full_piece() {
        let blocks: Vec<_> = piece_blocks(2 * BLOCK_LEN).collect();
        assert_eq!(blocks, vec![(0, BLOCK_LEN), (BLOCK_LEN, BLOCK_LEN)]);
    }

    #[test]
    fn test_piece_blocks_short_tail() {
        // a piece that is not a whole number of blocks ends in a short one
        let blocks: Vec<_> = piece_blocks(2 * BLOCK_LEN + 100).collect();
        assert_eq!(
            blocks,
            vec![(0, BLOCK_LEN), (BLOCK_LEN, BLOCK_LEN), (2 * BLOCK_LEN, 100)]
        );
    }

    #[test]
    fn test_piece_blocks_degenerate_sizes() {
        // a piece smaller than one block is a single short block, and an
        // empty piece has no blocks at all
        assert_eq!(piece_blocks(100).collect::<Vec<_>>(), vec![(0, 100)]);
        assert_eq!(piece_blocks(0).count(), 0);
    }
}

