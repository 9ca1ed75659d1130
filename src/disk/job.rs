//! Disk job definitions.
//!
//! A [`DiskJob`] is one unit of work bound to a storage. While pending it
//! lives in a queue (or held behind its storage's fence); a worker executes
//! it and its result travels back to the caller through a oneshot channel,
//! delivered by the engine's single completion dispatcher.

use std::{
    path::PathBuf,
    sync::{Arc, Mutex},
};

use bytes::Bytes;
use tokio::sync::oneshot;

use crate::{
    disk::{
        error::{CheckOutcome, JobError, StatusFlags},
        storage::Storage,
    },
    FileIndex, PieceIndex, Sha1Hash, Sha256Hash,
};

/// Flags callers may attach to a job.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DiskJobFlags(u8);

impl DiskJobFlags {
    /// The job is part of a sequential scan (e.g. a full recheck); hash
    /// jobs carrying this flag are routed to the hash pool.
    pub const SEQUENTIAL_ACCESS: Self = Self(1);
    /// The job's result is disposable: aborting the engine cancels it in
    /// the queue instead of letting it run.
    pub const VOLATILE_READ: Self = Self(1 << 1);

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for DiskJobFlags {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// How move-storage treats files already present at the destination.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MoveMode {
    /// Replace whatever is in the way.
    AlwaysReplace,
    /// Fail the whole move if any destination file exists.
    FailIfExist,
    /// Move the files that don't collide and leave the colliding ones.
    DontReplace,
}

/// What delete-files should remove.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DeleteOptions(u8);

impl DeleteOptions {
    /// Remove the downloaded files themselves.
    pub const FILES: Self = Self(1);
    /// Remove partial data. Without a part file this is a no-op, but the
    /// option is accepted for callers that always pass it.
    pub const PARTFILE: Self = Self(1 << 1);

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for DeleteOptions {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// The bundle a fast-resume check verifies against the on-disk state.
#[derive(Clone, Debug, Default)]
pub struct ResumeData {
    /// Per file: the size the file had when the resume data was saved, and
    /// optionally its modification time.
    pub file_sizes: Vec<(u64, Option<i64>)>,
    /// Which pieces the resume data claims are complete.
    pub have_pieces: Vec<bool>,
}

/// The hashes produced by a piece hash job.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PieceHashes {
    /// The SHA-1 of the whole piece, when v1 hashing was requested.
    pub v1: Option<Sha1Hash>,
    /// The SHA-256 of each 16 KiB block of the piece's v2 payload, when v2
    /// hashing was requested.
    pub blocks: Vec<Sha256Hash>,
}

/// The variant-specific payload of a job.
#[derive(Debug)]
pub(crate) enum JobAction {
    Read {
        piece: PieceIndex,
        offset: u32,
        len: u32,
    },
    /// Fills `out[out_offset..out_offset + len]`; the other part of `out`
    /// was satisfied from the store buffer before the job was queued.
    PartialRead {
        out: Arc<Mutex<Vec<u8>>>,
        out_offset: usize,
        piece: PieceIndex,
        offset: u32,
        len: u32,
    },
    Write {
        piece: PieceIndex,
        offset: u32,
        buf: Bytes,
    },
    Hash {
        piece: PieceIndex,
        want_v1: bool,
        want_v2: bool,
    },
    Hash2 {
        piece: PieceIndex,
        offset: u32,
    },
    MoveStorage {
        new_path: PathBuf,
        mode: MoveMode,
    },
    ReleaseFiles,
    DeleteFiles {
        options: DeleteOptions,
    },
    CheckFastresume {
        resume: Option<ResumeData>,
        links: Vec<Option<PathBuf>>,
    },
    RenameFile {
        file: FileIndex,
        name: String,
    },
    StopTorrent,
    FilePriority {
        priorities: Vec<u8>,
    },
    ClearPiece {
        piece: PieceIndex,
    },
}

/// The data a successfully completed job hands back.
#[derive(Debug)]
pub(crate) enum JobData {
    None,
    Read(Vec<u8>),
    Hash(PieceHashes),
    Hash2(Sha256Hash),
    Move(PathBuf),
    Check(CheckOutcome, StatusFlags),
}

pub(crate) type JobOutput = Result<JobData, JobError>;

pub(crate) struct DiskJob {
    pub storage: Arc<Storage>,
    pub action: JobAction,
    pub flags: DiskJobFlags,
    /// Set while the job sits in a queue to fail it on pop.
    pub aborted: bool,
    pub done: oneshot::Sender<JobOutput>,
}

impl DiskJob {
    /// True for the job kinds that must run with no concurrent siblings on
    /// their storage.
    pub fn is_fence(&self) -> bool {
        matches!(
            self.action,
            JobAction::MoveStorage { .. }
                | JobAction::ReleaseFiles
                | JobAction::DeleteFiles { .. }
                | JobAction::CheckFastresume { .. }
                | JobAction::RenameFile { .. }
                | JobAction::StopTorrent
                | JobAction::FilePriority { .. }
                | JobAction::ClearPiece { .. }
        )
    }

    /// True for jobs routed to the hash pool when one exists.
    pub fn is_hash(&self) -> bool {
        matches!(
            self.action,
            JobAction::Hash { .. } | JobAction::Hash2 { .. }
        )
    }

    /// The store-buffer location a write job occupies while it is live;
    /// `None` for every other job kind.
    pub fn write_key(&self) -> Option<(PieceIndex, u32)> {
        match &self.action {
            JobAction::Write { piece, offset, .. } => Some((*piece, *offset)),
            _ => None,
        }
    }
}

impl std::fmt::Debug for DiskJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiskJob")
            .field("action", &self.action)
            .field("flags", &self.flags)
            .field("aborted", &self.aborted)
            .finish()
    }
}
