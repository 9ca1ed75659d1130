//! The error taxonomy of the disk engine.
//!
//! No error crosses a worker thread boundary as a panic: workers convert
//! every failure into a [`StorageError`] tagged with the filesystem
//! operation that failed, and job callers receive a [`JobError`].

use std::{fmt, io, sync::Arc};

use thiserror::Error;

use crate::FileIndex;

/// The filesystem operation a storage error occurred in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operation {
    Stat,
    Mkdir,
    Open,
    Rename,
    Remove,
    Copy,
    Read,
    Write,
    Fallocate,
    PartfileMove,
    PartfileRead,
    PartfileWrite,
    CheckResume,
    HardLink,
    Symlink,
    Exception,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::Stat => "stat",
            Operation::Mkdir => "mkdir",
            Operation::Open => "open",
            Operation::Rename => "rename",
            Operation::Remove => "remove",
            Operation::Copy => "copy",
            Operation::Read => "read",
            Operation::Write => "write",
            Operation::Fallocate => "fallocate",
            Operation::PartfileMove => "partfile_move",
            Operation::PartfileRead => "partfile_read",
            Operation::PartfileWrite => "partfile_write",
            Operation::CheckResume => "check_resume",
            Operation::HardLink => "hard_link",
            Operation::Symlink => "symlink",
            Operation::Exception => "exception",
        };
        f.write_str(name)
    }
}

/// A failed filesystem primitive, annotated with the file it concerned and
/// the operation that failed.
///
/// The underlying [`io::Error`] is shared so the same failure can be
/// broadcast to every waiter coalesced on one file open.
#[derive(Clone, Debug, Error)]
#[error("disk {operation} error: {source}")]
pub struct StorageError {
    #[source]
    pub source: Arc<io::Error>,
    /// The file the operation concerned, if any.
    pub file: Option<FileIndex>,
    /// The operation that failed.
    pub operation: Operation,
}

impl StorageError {
    pub fn new(operation: Operation, source: io::Error) -> Self {
        Self { source: Arc::new(source), file: None, operation }
    }

    pub fn with_file(
        operation: Operation,
        file: FileIndex,
        source: io::Error,
    ) -> Self {
        Self { source: Arc::new(source), file: Some(file), operation }
    }
}

/// Why a disk job did not produce its result.
#[derive(Clone, Debug, Error)]
pub enum JobError {
    /// The engine is shutting down, or the job was cancelled in the queue.
    #[error("disk job cancelled")]
    Cancelled,
    /// The torrent index does not refer to a registered storage.
    #[error("invalid torrent index")]
    InvalidTorrent,
    /// A move-storage job refused to overwrite existing files.
    #[error("target files already exist")]
    FileExist,
    /// The job failed on a filesystem primitive and cannot make progress.
    #[error(transparent)]
    Disk(#[from] StorageError),
}

/// Advisory flags a completed job may carry alongside its result.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StatusFlags(u8);

impl StatusFlags {
    /// A file on disk is larger than the torrent model says it should be.
    pub const OVERSIZED_FILE: Self = Self(1);

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOrAssign for StatusFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// The outcome of a fast-resume check.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CheckOutcome {
    /// The resume data is consistent with the files on disk.
    Valid,
    /// The files must be rehashed: either the resume data contradicted the
    /// disk, or there was no resume data but files exist.
    NeedFullCheck,
}

/// An error raised while registering a new torrent with the engine.
#[derive(Debug, Error)]
pub enum NewTorrentError {
    #[error("torrent storage params are invalid: {0}")]
    InvalidParams(&'static str),
    #[error("the disk engine is shut down")]
    ShuttingDown,
}
