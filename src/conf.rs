//! This module defines types used to configure the disk engine and its parts.

use std::time::Duration;

/// The global configuration of the disk engine.
#[derive(Clone, Debug)]
pub struct DiskConf {
    /// The number of worker threads in the generic pool. These execute all
    /// job types.
    pub generic_threads: usize,

    /// The number of worker threads in the hash pool. Hash jobs flagged as
    /// sequential are routed here so bulk rechecks don't starve reads and
    /// writes. A value of zero routes all hashing to the generic pool.
    pub hash_threads: usize,

    /// The maximum number of file handles kept open by the file pool.
    pub file_pool_size: usize,

    /// How long a file handle may sit unused in the pool before the periodic
    /// maintenance pass closes it.
    pub close_file_interval: Duration,

    /// How often storages are ticked for deferred metadata flushes.
    pub tick_interval: Duration,

    /// The number of hash jobs the create-torrent pipeline keeps in flight
    /// per hash thread.
    pub jobs_per_thread: usize,
}

impl Default for DiskConf {
    fn default() -> Self {
        Self {
            // Two generic workers keep a read and a write in flight without
            // oversubscribing a spinning disk.
            generic_threads: 2,
            hash_threads: 1,
            file_pool_size: 40,
            close_file_interval: Duration::from_secs(120),
            tick_interval: Duration::from_secs(60),
            jobs_per_thread: 4,
        }
    }
}
