//! The disk IO engine.
//!
//! [`DiskIo`] owns two worker thread pools (generic and hash), the
//! per-torrent storages, the file handle pool and the store buffer. Callers
//! queue work through the `async_*` methods and await the result; workers
//! execute jobs and post completions back through a single coalesced
//! dispatcher, so results are delivered one at a time.
//!
//! Ordering guarantees:
//!
//! * writes to the same `(torrent, piece, offset)` are never live
//!   concurrently: the storage's fence parks a write while an earlier one
//!   to the same location is in flight, and the store buffer holds the one
//!   pending block so reads and hashes of that location see it;
//! * fence jobs (move, rename, delete, check, stop and friends) run with no
//!   concurrent siblings on their storage;
//! * reads may be freely reordered against reads and against writes of
//!   other locations.

pub mod error;
pub mod file;

mod fence;
mod file_pool;
mod job;
mod storage;
mod store_buffer;

use std::{
    collections::VecDeque,
    io,
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Condvar, Mutex,
    },
    thread,
    time::{Duration, Instant},
};

use bytes::Bytes;
use tokio::sync::oneshot;

use crate::{
    conf::DiskConf, PieceIndex, Sha256Hash, TorrentIndex, BLOCK_LEN,
};

use error::{
    CheckOutcome, JobError, NewTorrentError, Operation, StatusFlags,
    StorageError,
};
use fence::Submit;
use file::OpenMode;
use file_pool::FilePool;
use job::{DiskJob, JobAction, JobData, JobOutput};
use storage::Storage;
use store_buffer::StoreBuffer;

pub use job::{
    DeleteOptions, DiskJobFlags, MoveMode, PieceHashes, ResumeData,
};
pub use storage::{StorageMode, StorageParams};

/// How long an idle maintenance worker sleeps between due-time checks.
const MAINTENANCE_GRANULARITY: Duration = Duration::from_millis(500);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum PoolKind {
    Generic,
    Hash,
}

/// What a worker should do next.
enum Next {
    Job(DiskJob),
    Maintain,
    Exit,
}

#[derive(Default)]
struct Queues {
    generic: VecDeque<DiskJob>,
    hash: VecDeque<DiskJob>,
    abort: bool,
}

#[derive(Default)]
struct Torrents {
    slots: Vec<Option<Arc<Storage>>>,
    free: Vec<TorrentIndex>,
}

struct CompletedJob {
    done: oneshot::Sender<JobOutput>,
    output: JobOutput,
}

#[derive(Default)]
struct Completions {
    jobs: Vec<CompletedJob>,
    /// Exactly one dispatch drains the list at a time.
    dispatch_in_flight: bool,
}

struct Inner {
    conf: DiskConf,
    queues: Mutex<Queues>,
    generic_cv: Condvar,
    hash_cv: Condvar,
    torrents: Mutex<Torrents>,
    store: StoreBuffer,
    fpool: FilePool,
    completions: Mutex<Completions>,
    running_workers: AtomicUsize,
    last_maintenance: Mutex<Instant>,
    threads: Mutex<Vec<thread::JoinHandle<()>>>,
}

/// The disk engine handle. Cheap to clone; all clones drive the same
/// engine. Call [`abort`](Self::abort) before dropping the last one.
#[derive(Clone)]
pub struct DiskIo {
    inner: Arc<Inner>,
}

impl DiskIo {
    pub fn new(conf: DiskConf) -> Self {
        let generic_threads = conf.generic_threads.max(1);
        let hash_threads = conf.hash_threads;
        let inner = Arc::new(Inner {
            fpool: FilePool::new(conf.file_pool_size),
            conf,
            queues: Mutex::new(Queues::default()),
            generic_cv: Condvar::new(),
            hash_cv: Condvar::new(),
            torrents: Mutex::new(Torrents::default()),
            store: StoreBuffer::default(),
            completions: Mutex::new(Completions::default()),
            running_workers: AtomicUsize::new(generic_threads + hash_threads),
            last_maintenance: Mutex::new(Instant::now()),
            threads: Mutex::new(Vec::new()),
        });

        let mut threads = Vec::new();
        for id in 0..generic_threads {
            let inner = Arc::clone(&inner);
            threads.push(
                thread::Builder::new()
                    .name(format!("disk-{}", id))
                    .spawn(move || worker_loop(inner, PoolKind::Generic, id))
                    .expect("failed to spawn disk worker"),
            );
        }
        for id in 0..hash_threads {
            let inner = Arc::clone(&inner);
            threads.push(
                thread::Builder::new()
                    .name(format!("disk-hash-{}", id))
                    .spawn(move || worker_loop(inner, PoolKind::Hash, id))
                    .expect("failed to spawn disk hash worker"),
            );
        }
        *inner.threads.lock().unwrap() = threads;

        log::info!(
            "Disk engine started with {} generic and {} hash worker(s)",
            generic_threads,
            hash_threads
        );
        Self { inner }
    }

    /// Registers a torrent's storage and assigns it an index. Indices of
    /// removed torrents are reused.
    pub fn new_torrent(
        &self,
        params: StorageParams,
    ) -> Result<TorrentIndex, NewTorrentError> {
        if params.files.num_files() == 0 {
            return Err(NewTorrentError::InvalidParams("torrent has no files"));
        }
        if params.files.piece_length() == 0 {
            return Err(NewTorrentError::InvalidParams(
                "piece length is not set",
            ));
        }
        if self.inner.queues.lock().unwrap().abort {
            return Err(NewTorrentError::ShuttingDown);
        }

        let mut torrents = self.inner.torrents.lock().unwrap();
        let index = match torrents.free.pop() {
            Some(index) => index,
            None => {
                torrents.slots.push(None);
                (torrents.slots.len() - 1) as TorrentIndex
            }
        };
        torrents.slots[index as usize] =
            Some(Arc::new(Storage::new(index, params)));
        log::info!("Torrent storage {} registered", index);
        Ok(index)
    }

    /// Stops the torrent behind a fence (so every queued job observes or
    /// precedes it) and frees its index for reuse. Jobs still executing
    /// keep the storage alive until they complete.
    pub async fn remove_torrent(
        &self,
        torrent: TorrentIndex,
    ) -> Result<(), JobError> {
        self.async_stop_torrent(torrent).await?;
        let mut torrents = self.inner.torrents.lock().unwrap();
        if let Some(slot) = torrents.slots.get_mut(torrent as usize) {
            if slot.take().is_some() {
                torrents.free.push(torrent);
                log::info!("Torrent storage {} removed", torrent);
            }
        }
        Ok(())
    }

    /// Reads `len` bytes at `(piece, offset)`. A read fully covered by
    /// pending writes is resolved synchronously from the store buffer; a
    /// read straddling one pending and one missing block only goes to disk
    /// for the missing half.
    pub async fn async_read(
        &self,
        torrent: TorrentIndex,
        piece: PieceIndex,
        offset: u32,
        len: u32,
    ) -> Result<Vec<u8>, JobError> {
        let storage = self.storage(torrent)?;
        let piece_size = storage.piece_size(piece);
        if offset >= piece_size {
            return Err(invalid_input(Operation::Read, "read past piece end"));
        }
        // requests overshooting the piece are truncated to its actual size
        let len = len.min(piece_size - offset);
        let start = offset / BLOCK_LEN * BLOCK_LEN;

        if offset + len <= start + BLOCK_LEN {
            // the request is within one block-aligned region; a pending
            // write that doesn't cover the whole range falls back to disk
            let within = (offset - start) as usize;
            let hit = self
                .inner
                .store
                .get(&(torrent, piece, start), |b| {
                    b.get(within..within + len as usize).map(<[u8]>::to_vec)
                })
                .flatten();
            if let Some(data) = hit {
                return Ok(data);
            }
            let data = self
                .run(
                    &storage,
                    JobAction::Read { piece, offset, len },
                    DiskJobFlags::default(),
                )
                .await?;
            match data {
                JobData::Read(buf) => Ok(buf),
                _ => unreachable!("read job returned non-read data"),
            }
        } else {
            // the request straddles two block-aligned store buffer keys
            let second = start + BLOCK_LEN;
            let split = (second - offset) as usize;
            let tail = len as usize - split;
            let mut out = vec![0u8; len as usize];
            let (_, (got_first, got_second)) = self.inner.store.get2(
                &(torrent, piece, start),
                &(torrent, piece, second),
                |a, b| {
                    let from = (offset - start) as usize;
                    let got_first = a
                        .and_then(|a| a.get(from..from + split))
                        .map(|s| out[..split].copy_from_slice(s))
                        .is_some();
                    let got_second = b
                        .and_then(|b| b.get(..tail))
                        .map(|s| out[split..].copy_from_slice(s))
                        .is_some();
                    (got_first, got_second)
                },
            );
            match (got_first, got_second) {
                (true, true) => Ok(out),
                (true, false) | (false, true) => {
                    // fill the missing half in place, keeping the half
                    // already copied from the store buffer
                    let (offset, len, out_offset) = if got_first {
                        (second, tail as u32, split)
                    } else {
                        (offset, split as u32, 0)
                    };
                    let out = Arc::new(Mutex::new(out));
                    self.run(
                        &storage,
                        JobAction::PartialRead {
                            out: Arc::clone(&out),
                            out_offset,
                            piece,
                            offset,
                            len,
                        },
                        DiskJobFlags::default(),
                    )
                    .await?;
                    let out = Arc::try_unwrap(out)
                        .expect("partial read job dropped its buffer")
                        .into_inner()
                        .unwrap();
                    Ok(out)
                }
                (false, false) => {
                    let data = self
                        .run(
                            &storage,
                            JobAction::Read { piece, offset, len },
                            DiskJobFlags::default(),
                        )
                        .await?;
                    match data {
                        JobData::Read(buf) => Ok(buf),
                        _ => unreachable!("read job returned non-read data"),
                    }
                }
            }
        }
    }

    /// Queues a block write. The offset must be 16 KiB aligned and the
    /// block must fit the piece exactly; oversized writes are rejected
    /// before queuing. A write to a location with an earlier write still in
    /// flight waits for it. Once queued, the block is visible to reads and
    /// hashes until it is durably on disk.
    pub async fn async_write(
        &self,
        torrent: TorrentIndex,
        piece: PieceIndex,
        offset: u32,
        buf: Bytes,
    ) -> Result<(), JobError> {
        let storage = self.storage(torrent)?;
        if offset % BLOCK_LEN != 0 {
            return Err(invalid_input(
                Operation::Write,
                "write offset is not block aligned",
            ));
        }
        if buf.is_empty() || buf.len() > BLOCK_LEN as usize {
            return Err(invalid_input(
                Operation::Write,
                "write is not a single block",
            ));
        }
        let piece_size = storage.piece_size(piece);
        if offset as usize + buf.len() > piece_size as usize {
            return Err(invalid_input(
                Operation::Write,
                "write exceeds piece size",
            ));
        }

        self.run(
            &storage,
            JobAction::Write { piece, offset, buf },
            DiskJobFlags::default(),
        )
        .await
        .map(|_| ())
    }

    /// Computes a piece's v1 SHA-1 and/or its per-block v2 SHA-256s.
    pub async fn async_hash(
        &self,
        torrent: TorrentIndex,
        piece: PieceIndex,
        want_v1: bool,
        want_v2: bool,
        flags: DiskJobFlags,
    ) -> Result<PieceHashes, JobError> {
        let storage = self.storage(torrent)?;
        let data = self
            .run(&storage, JobAction::Hash { piece, want_v1, want_v2 }, flags)
            .await?;
        match data {
            JobData::Hash(hashes) => Ok(hashes),
            _ => unreachable!("hash job returned non-hash data"),
        }
    }

    /// Computes the SHA-256 of one v2 block.
    pub async fn async_hash2(
        &self,
        torrent: TorrentIndex,
        piece: PieceIndex,
        offset: u32,
        flags: DiskJobFlags,
    ) -> Result<Sha256Hash, JobError> {
        let storage = self.storage(torrent)?;
        let data = self
            .run(&storage, JobAction::Hash2 { piece, offset }, flags)
            .await?;
        match data {
            JobData::Hash2(hash) => Ok(hash),
            _ => unreachable!("hash2 job returned non-hash data"),
        }
    }

    /// Moves the torrent's files to a new save path. Fenced.
    pub async fn async_move_storage(
        &self,
        torrent: TorrentIndex,
        new_path: impl Into<std::path::PathBuf>,
        mode: MoveMode,
    ) -> Result<std::path::PathBuf, JobError> {
        let storage = self.storage(torrent)?;
        let data = self
            .run(
                &storage,
                JobAction::MoveStorage { new_path: new_path.into(), mode },
                DiskJobFlags::default(),
            )
            .await?;
        match data {
            JobData::Move(path) => Ok(path),
            _ => unreachable!("move job returned non-move data"),
        }
    }

    /// Drops the torrent's pooled file handles. Fenced.
    pub async fn async_release_files(
        &self,
        torrent: TorrentIndex,
    ) -> Result<(), JobError> {
        let storage = self.storage(torrent)?;
        self.run(&storage, JobAction::ReleaseFiles, DiskJobFlags::default())
            .await
            .map(|_| ())
    }

    /// Deletes the torrent's data. Fenced.
    pub async fn async_delete_files(
        &self,
        torrent: TorrentIndex,
        options: DeleteOptions,
    ) -> Result<(), JobError> {
        let storage = self.storage(torrent)?;
        self.run(
            &storage,
            JobAction::DeleteFiles { options },
            DiskJobFlags::default(),
        )
        .await
        .map(|_| ())
    }

    /// Verifies resume data (and hard-links files in from `links`). Fenced.
    pub async fn async_check_files(
        &self,
        torrent: TorrentIndex,
        resume: Option<ResumeData>,
        links: Vec<Option<std::path::PathBuf>>,
    ) -> Result<(CheckOutcome, StatusFlags), JobError> {
        let storage = self.storage(torrent)?;
        let data = self
            .run(
                &storage,
                JobAction::CheckFastresume { resume, links },
                DiskJobFlags::default(),
            )
            .await?;
        match data {
            JobData::Check(outcome, flags) => Ok((outcome, flags)),
            _ => unreachable!("check job returned non-check data"),
        }
    }

    /// Renames one file of the torrent. Fenced.
    pub async fn async_rename_file(
        &self,
        torrent: TorrentIndex,
        file: crate::FileIndex,
        name: impl Into<String>,
    ) -> Result<(), JobError> {
        let storage = self.storage(torrent)?;
        self.run(
            &storage,
            JobAction::RenameFile { file, name: name.into() },
            DiskJobFlags::default(),
        )
        .await
        .map(|_| ())
    }

    /// Stops the torrent: once this completes, no earlier job is live.
    /// Fenced.
    pub async fn async_stop_torrent(
        &self,
        torrent: TorrentIndex,
    ) -> Result<(), JobError> {
        let storage = self.storage(torrent)?;
        self.run(&storage, JobAction::StopTorrent, DiskJobFlags::default())
            .await
            .map(|_| ())
    }

    /// Updates per-file priorities. Fenced.
    pub async fn async_set_file_priority(
        &self,
        torrent: TorrentIndex,
        priorities: Vec<u8>,
    ) -> Result<(), JobError> {
        let storage = self.storage(torrent)?;
        self.run(
            &storage,
            JobAction::FilePriority { priorities },
            DiskJobFlags::default(),
        )
        .await
        .map(|_| ())
    }

    /// Forgets any partial hash state of the piece. Fenced.
    pub async fn async_clear_piece(
        &self,
        torrent: TorrentIndex,
        piece: PieceIndex,
    ) -> Result<(), JobError> {
        let storage = self.storage(torrent)?;
        self.run(
            &storage,
            JobAction::ClearPiece { piece },
            DiskJobFlags::default(),
        )
        .await
        .map(|_| ())
    }

    /// Shuts the engine down. Queued jobs flagged
    /// [`DiskJobFlags::VOLATILE_READ`] are cancelled in place; every other
    /// queued job runs to completion. New submissions fail with
    /// [`JobError::Cancelled`]. With `wait`, blocks until all workers have
    /// exited.
    pub fn abort(&self, wait: bool) {
        let cancelled = {
            let mut queues = self.inner.queues.lock().unwrap();
            if queues.abort {
                Vec::new()
            } else {
                log::info!("Disk engine shutting down");
                queues.abort = true;
                let Queues { generic, hash, .. } = &mut *queues;
                let mut cancelled = Vec::new();
                for queue in [generic, hash] {
                    let kept = queue
                        .drain(..)
                        .filter_map(|job| {
                            if job
                                .flags
                                .contains(DiskJobFlags::VOLATILE_READ)
                            {
                                cancelled.push(job);
                                None
                            } else {
                                Some(job)
                            }
                        })
                        .collect();
                    *queue = kept;
                }
                cancelled
            }
        };
        self.inner.generic_cv.notify_all();
        self.inner.hash_cv.notify_all();

        for job in cancelled {
            let storage = Arc::clone(&job.storage);
            // a cancelled queued write still holds a published block
            if let Some((piece, offset)) = job.write_key() {
                self.inner.store.erase(&(storage.index(), piece, offset));
            }
            let mut unblocked = Vec::new();
            storage.fence.job_complete(job.write_key(), &mut unblocked);
            self.inner.queue_jobs(unblocked);
            self.inner.post_completion(job.done, Err(JobError::Cancelled));
        }

        if wait {
            let threads: Vec<_> =
                self.inner.threads.lock().unwrap().drain(..).collect();
            for thread in threads {
                let _ = thread.join();
            }
        }
    }

    /// Shrinks or grows the file handle pool.
    pub fn resize_file_pool(&self, capacity: usize) {
        self.inner.fpool.resize(capacity);
    }

    fn storage(
        &self,
        torrent: TorrentIndex,
    ) -> Result<Arc<Storage>, JobError> {
        self.inner
            .torrents
            .lock()
            .unwrap()
            .slots
            .get(torrent as usize)
            .and_then(|slot| slot.clone())
            .ok_or(JobError::InvalidTorrent)
    }

    /// Builds a job, routes it through the storage fence and the right
    /// queue, and awaits its completion.
    async fn run(
        &self,
        storage: &Arc<Storage>,
        action: JobAction,
        flags: DiskJobFlags,
    ) -> Result<JobData, JobError> {
        let (done, rx) = oneshot::channel();
        let job = DiskJob {
            storage: Arc::clone(storage),
            action,
            flags,
            aborted: false,
            done,
        };
        self.inner.submit(job);
        match rx.await {
            Ok(output) => output,
            // the engine dropped the job without completing it
            Err(_) => Err(JobError::Cancelled),
        }
    }
}

impl Inner {
    fn submit(&self, job: DiskJob) {
        if self.queues.lock().unwrap().abort {
            let _ = job.done.send(Err(JobError::Cancelled));
            return;
        }
        let storage = Arc::clone(&job.storage);
        let submit = if job.is_fence() {
            storage.fence.raise_fence(job)
        } else {
            storage.fence.add_job(job)
        };
        if let Submit::Now(job) = submit {
            self.queue_jobs(vec![job]);
        }
    }

    fn queue_jobs(&self, jobs: Vec<DiskJob>) {
        if jobs.is_empty() {
            return;
        }
        let mut queues = self.queues.lock().unwrap();
        for job in jobs {
            // a write is published to the store buffer the moment it is
            // queued; the fence guarantees its location is free
            if let JobAction::Write { piece, offset, buf } = &job.action {
                self.store.insert(
                    (job.storage.index(), *piece, *offset),
                    buf.clone(),
                );
            }
            // hash jobs go to the hash pool iff they are sequential scans
            // and a hash pool exists
            let to_hash = job.is_hash()
                && job.flags.contains(DiskJobFlags::SEQUENTIAL_ACCESS)
                && self.conf.hash_threads > 0;
            if to_hash {
                queues.hash.push_back(job);
                self.hash_cv.notify_one();
            } else {
                queues.generic.push_back(job);
                self.generic_cv.notify_one();
            }
        }
    }

    fn wait_for_job(&self, pool: PoolKind, id: usize) -> Next {
        let mut queues = self.queues.lock().unwrap();
        loop {
            let queue = match pool {
                PoolKind::Generic => &mut queues.generic,
                PoolKind::Hash => &mut queues.hash,
            };
            if let Some(job) = queue.pop_front() {
                return Next::Job(job);
            }
            if queues.abort {
                return Next::Exit;
            }
            // the lowest-id generic worker doubles as the maintenance
            // timer while idle
            if pool == PoolKind::Generic && id == 0 {
                let (guard, timeout) = self
                    .generic_cv
                    .wait_timeout(queues, MAINTENANCE_GRANULARITY)
                    .unwrap();
                queues = guard;
                if timeout.timed_out() && self.maintenance_due() {
                    return Next::Maintain;
                }
            } else {
                queues = match pool {
                    PoolKind::Generic => {
                        self.generic_cv.wait(queues).unwrap()
                    }
                    PoolKind::Hash => self.hash_cv.wait(queues).unwrap(),
                };
            }
        }
    }

    fn maintenance_due(&self) -> bool {
        self.last_maintenance.lock().unwrap().elapsed()
            >= self.conf.tick_interval
    }

    fn run_maintenance(&self) {
        *self.last_maintenance.lock().unwrap() = Instant::now();
        let storages: Vec<Arc<Storage>> = {
            let torrents = self.torrents.lock().unwrap();
            torrents.slots.iter().flatten().cloned().collect()
        };
        for storage in storages {
            storage.tick(&self.fpool);
        }
        self.fpool.close_oldest(self.conf.close_file_interval);
    }

    fn run_job(&self, job: DiskJob) {
        let write_key = job.write_key();
        let DiskJob { storage, action, flags, aborted, done } = job;
        log::trace!(
            "Performing job on storage {} ({} outstanding, fence: {})",
            storage.index(),
            storage.fence.num_outstanding(),
            storage.fence.has_fence(),
        );
        let output = if aborted {
            // a queued write already published its block; retire it
            if let Some((piece, offset)) = write_key {
                self.store.erase(&(storage.index(), piece, offset));
            }
            Err(JobError::Cancelled)
        } else {
            // a panic in a handler must not cross the thread boundary; it
            // becomes a fatal disk error tagged as an exception
            panic::catch_unwind(AssertUnwindSafe(|| {
                self.perform(&storage, action, flags)
            }))
            .unwrap_or_else(|_| {
                Err(JobError::Disk(StorageError::new(
                    Operation::Exception,
                    io::Error::new(
                        io::ErrorKind::Other,
                        "disk job handler panicked",
                    ),
                )))
            })
        };

        let mut unblocked = Vec::new();
        storage.fence.job_complete(write_key, &mut unblocked);
        self.queue_jobs(unblocked);
        self.post_completion(done, output);
    }

    fn perform(
        &self,
        storage: &Arc<Storage>,
        action: JobAction,
        flags: DiskJobFlags,
    ) -> JobOutput {
        let mode = if flags.contains(DiskJobFlags::SEQUENTIAL_ACCESS) {
            OpenMode::READ | OpenMode::SEQUENTIAL
        } else {
            OpenMode::READ | OpenMode::RANDOM_ACCESS
        };

        match action {
            JobAction::Read { piece, offset, len } => {
                let mut buf = vec![0u8; len as usize];
                storage.read(&self.fpool, &mut buf, piece, offset, mode)?;
                Ok(JobData::Read(buf))
            }
            JobAction::PartialRead { out, out_offset, piece, offset, len } => {
                let mut out = out.lock().unwrap();
                let region = &mut out[out_offset..out_offset + len as usize];
                storage.read(&self.fpool, region, piece, offset, mode)?;
                Ok(JobData::None)
            }
            JobAction::Write { piece, offset, buf } => {
                let result =
                    storage.write(&self.fpool, &buf, piece, offset, mode);
                // the pending block is retired whether or not the write
                // made it; a failed write is re-requested by the caller
                self.store.erase(&(storage.index(), piece, offset));
                result?;
                Ok(JobData::None)
            }
            JobAction::Hash { piece, want_v1, want_v2 } => {
                let len = storage.piece_size(piece);
                let (v1, blocks) = storage.hash(
                    &self.fpool,
                    &self.store,
                    piece,
                    len,
                    want_v1,
                    want_v2,
                    mode,
                )?;
                Ok(JobData::Hash(PieceHashes { v1, blocks }))
            }
            JobAction::Hash2 { piece, offset } => {
                let piece_size2 = storage.piece_size2(piece);
                if offset >= piece_size2 {
                    return Err(invalid_input(
                        Operation::Read,
                        "block offset past the piece's v2 payload",
                    ));
                }
                let len = BLOCK_LEN.min(piece_size2 - offset);
                let hash = storage.hash2(
                    &self.fpool,
                    &self.store,
                    piece,
                    offset,
                    len,
                    mode,
                )?;
                Ok(JobData::Hash2(hash))
            }
            JobAction::MoveStorage { new_path, mode: move_mode } => {
                let path = storage.move_storage(
                    &self.fpool,
                    &new_path,
                    move_mode,
                )?;
                Ok(JobData::Move(path))
            }
            JobAction::ReleaseFiles => {
                storage.release_files(&self.fpool);
                Ok(JobData::None)
            }
            JobAction::DeleteFiles { options } => {
                storage.delete_files(&self.fpool, options)?;
                Ok(JobData::None)
            }
            JobAction::CheckFastresume { resume, links } => {
                // initialize lazily so a freshly added torrent creates its
                // directory layout before the first write
                let init_flags = storage.initialize(&self.fpool)?;
                let (outcome, mut flags) =
                    storage.check_fastresume(resume.as_ref(), &links)?;
                flags |= init_flags;
                Ok(JobData::Check(outcome, flags))
            }
            JobAction::RenameFile { file, name } => {
                storage.rename_file(&self.fpool, file, &name)?;
                Ok(JobData::None)
            }
            JobAction::StopTorrent => {
                storage.stop(&self.fpool);
                Ok(JobData::None)
            }
            JobAction::FilePriority { priorities } => {
                storage.set_priorities(&priorities);
                Ok(JobData::None)
            }
            JobAction::ClearPiece { .. } => {
                // hash jobs are self-contained, so there is no partial
                // piece hash state to forget; the fence alone gives the
                // caller the barrier it wants
                Ok(JobData::None)
            }
        }
    }

    fn post_completion(
        &self,
        done: oneshot::Sender<JobOutput>,
        output: JobOutput,
    ) {
        let mut completions = self.completions.lock().unwrap();
        completions.jobs.push(CompletedJob { done, output });
        if completions.dispatch_in_flight {
            return;
        }
        completions.dispatch_in_flight = true;
        drop(completions);
        self.dispatch_completions();
    }

    fn dispatch_completions(&self) {
        loop {
            let batch = {
                let mut completions = self.completions.lock().unwrap();
                if completions.jobs.is_empty() {
                    completions.dispatch_in_flight = false;
                    return;
                }
                std::mem::take(&mut completions.jobs)
            };
            for job in batch {
                // the receiver may have been dropped; that's fine
                let _ = job.done.send(job.output);
            }
        }
    }
}

fn worker_loop(inner: Arc<Inner>, pool: PoolKind, id: usize) {
    log::debug!("Disk worker {:?}/{} starting", pool, id);
    loop {
        match inner.wait_for_job(pool, id) {
            Next::Job(job) => inner.run_job(job),
            Next::Maintain => inner.run_maintenance(),
            Next::Exit => break,
        }
    }
    log::debug!("Disk worker {:?}/{} exiting", pool, id);
    // the last worker out drops the pooled file handles
    if inner.running_workers.fetch_sub(1, Ordering::AcqRel) == 1 {
        inner.fpool.release_all();
    }
}

fn invalid_input(operation: Operation, message: &'static str) -> JobError {
    JobError::Disk(StorageError::new(
        operation,
        io::Error::new(io::ErrorKind::InvalidInput, message),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file_storage::{FileFlags, FileStorage};

    fn test_storage() -> Arc<Storage> {
        let mut fs = FileStorage::new();
        fs.set_piece_length(0x4000);
        fs.add_file("t/a", 0x8000, FileFlags::default(), None, None)
            .unwrap();
        let params = StorageParams::new(Arc::new(fs), "/tmp/nonexistent");
        Arc::new(Storage::new(0, params))
    }

    fn dummy_job(
        storage: &Arc<Storage>,
        action: JobAction,
    ) -> (DiskJob, oneshot::Receiver<JobOutput>) {
        let (done, rx) = oneshot::channel();
        (
            DiskJob {
                storage: Arc::clone(storage),
                action,
                flags: DiskJobFlags::default(),
                aborted: false,
                done,
            },
            rx,
        )
    }

    #[test]
    fn test_fence_submission_order() {
        let storage = test_storage();
        let fence = &storage.fence;

        // two writes run unfenced
        let (w1, _rx1) = dummy_job(
            &storage,
            JobAction::Write {
                piece: 0,
                offset: 0,
                buf: Bytes::from_static(&[0; 4]),
            },
        );
        let (w2, _rx2) = dummy_job(
            &storage,
            JobAction::Write {
                piece: 0,
                offset: 0x4000,
                buf: Bytes::from_static(&[0; 4]),
            },
        );
        assert!(matches!(fence.add_job(w1), Submit::Now(_)));
        assert!(matches!(fence.add_job(w2), Submit::Now(_)));
        assert_eq!(fence.num_outstanding(), 2);

        // a fence job must wait for both
        let (rename, _rx3) = dummy_job(
            &storage,
            JobAction::RenameFile { file: 0, name: "t/new".into() },
        );
        assert!(rename.is_fence());
        assert!(matches!(fence.raise_fence(rename), Submit::Held));

        // a read submitted after the fence is blocked behind it
        let (read, _rx4) = dummy_job(
            &storage,
            JobAction::Read { piece: 0, offset: 0, len: 4 },
        );
        assert!(matches!(fence.add_job(read), Submit::Held));

        // first write completes: nothing is released yet
        let mut out = Vec::new();
        assert_eq!(fence.job_complete(Some((0, 0)), &mut out), 0);
        // second write completes: the fence job alone is released
        assert_eq!(fence.job_complete(Some((0, 0x4000)), &mut out), 1);
        assert!(out[0].is_fence());
        assert!(fence.has_fence());
        out.clear();

        // the fence completes: the read is released
        assert_eq!(fence.job_complete(None, &mut out), 1);
        assert!(!out[0].is_fence());
        assert!(!fence.has_fence());
        out.clear();

        // the read completes: all quiet
        assert_eq!(fence.job_complete(None, &mut out), 0);
        assert_eq!(fence.num_outstanding(), 0);
    }

    #[test]
    fn test_same_location_writes_serialize() {
        let storage = test_storage();
        let fence = &storage.fence;
        let write = |offset| JobAction::Write {
            piece: 0,
            offset,
            buf: Bytes::from_static(&[0; 4]),
        };

        // two writes to one location: only the first goes live
        let (w1, _r1) = dummy_job(&storage, write(0));
        let (w2, _r2) = dummy_job(&storage, write(0));
        let (w3, _r3) = dummy_job(&storage, write(0x4000));
        assert!(matches!(fence.add_job(w1), Submit::Now(_)));
        assert!(matches!(fence.add_job(w2), Submit::Held));
        // a different location is unaffected
        assert!(matches!(fence.add_job(w3), Submit::Now(_)));
        // the parked write still counts as outstanding
        assert_eq!(fence.num_outstanding(), 3);

        // the first write completes and hands the location to the second
        let mut out = Vec::new();
        assert_eq!(fence.job_complete(Some((0, 0)), &mut out), 1);
        assert_eq!(out[0].write_key(), Some((0, 0)));
        out.clear();

        assert_eq!(fence.job_complete(Some((0, 0x4000)), &mut out), 0);
        assert_eq!(fence.job_complete(Some((0, 0)), &mut out), 0);
        assert_eq!(fence.num_outstanding(), 0);
    }

    #[test]
    fn test_fence_waits_for_parked_write() {
        let storage = test_storage();
        let fence = &storage.fence;
        let write = || JobAction::Write {
            piece: 0,
            offset: 0,
            buf: Bytes::from_static(&[0; 4]),
        };

        let (w1, _r1) = dummy_job(&storage, write());
        let (w2, _r2) = dummy_job(&storage, write());
        let (stop, _r3) = dummy_job(&storage, JobAction::StopTorrent);
        assert!(matches!(fence.add_job(w1), Submit::Now(_)));
        assert!(matches!(fence.add_job(w2), Submit::Held));
        assert!(matches!(fence.raise_fence(stop), Submit::Held));

        // the first write releases the parked one, not the fence: the
        // parked write was submitted first and must complete first
        let mut out = Vec::new();
        assert_eq!(fence.job_complete(Some((0, 0)), &mut out), 1);
        assert_eq!(out[0].write_key(), Some((0, 0)));
        assert!(!fence.has_fence());
        out.clear();

        // only once it completes does the fence run
        assert_eq!(fence.job_complete(Some((0, 0)), &mut out), 1);
        assert!(out[0].is_fence());
        assert!(fence.has_fence());
    }

    #[test]
    fn test_fence_immediate_when_idle() {
        let storage = test_storage();
        let (stop, _rx) = dummy_job(&storage, JobAction::StopTorrent);
        // no live jobs: the fence job goes straight to the queue
        assert!(matches!(storage.fence.raise_fence(stop), Submit::Now(_)));

        // and a job arriving while the fence runs is held
        let (read, _rx2) = dummy_job(
            &storage,
            JobAction::Read { piece: 0, offset: 0, len: 4 },
        );
        assert!(matches!(storage.fence.add_job(read), Submit::Held));
    }

    #[test]
    fn test_back_to_back_fences() {
        let storage = test_storage();
        let fence = &storage.fence;

        let (f1, _r1) = dummy_job(&storage, JobAction::ReleaseFiles);
        let (f2, _r2) = dummy_job(&storage, JobAction::StopTorrent);
        assert!(matches!(fence.raise_fence(f1), Submit::Now(_)));
        assert!(matches!(fence.raise_fence(f2), Submit::Held));

        // the first fence completes; the second runs alone
        let mut out = Vec::new();
        assert_eq!(fence.job_complete(None, &mut out), 1);
        assert!(out[0].is_fence());
        assert!(fence.has_fence());
    }
}
