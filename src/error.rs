//! The crate-wide error type.

use thiserror::Error;

use crate::{
    create::CreateError,
    disk::error::{JobError, NewTorrentError, StorageError},
    file_storage::FileStorageError,
    metainfo::MetainfoError,
};

pub type Result<T> = std::result::Result<T, Error>;

/// Any error the engine core can surface, for callers that don't care
/// which subsystem produced it.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Metainfo(#[from] MetainfoError),
    #[error(transparent)]
    Model(#[from] FileStorageError),
    #[error(transparent)]
    Job(#[from] JobError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    NewTorrent(#[from] NewTorrentError),
    #[error(transparent)]
    Create(#[from] CreateError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
