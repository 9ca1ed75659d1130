//! The per-storage disk-job fence and write serializer.
//!
//! A fence job (move, rename, delete, resume-check, stop and friends) must
//! observe every previously queued job of its storage and must itself be
//! observed by every job queued after it. The fence tracks how many of the
//! storage's jobs are live in the engine and holds back whatever cannot run
//! yet; [`job_complete`](JobFence::job_complete) hands back the jobs a
//! completion unblocks so the engine can queue them.
//!
//! The same state machine serializes writes per location: while a write to
//! one `(piece, offset)` is live, a second write to that location is parked
//! here instead of queued, so the store buffer holds at most one pending
//! block per location. A parked write still counts as outstanding, which
//! keeps fences ordered after every write submitted before them.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::Mutex,
};

use crate::{disk::job::DiskJob, PieceIndex};

/// A write's location within its storage.
pub(crate) type WriteKey = (PieceIndex, u32);

/// What the caller should do with the job it just offered.
#[derive(Debug)]
pub(crate) enum Submit {
    /// The job may be queued for execution now.
    Now(DiskJob),
    /// The fence took ownership; the job is queued once the fence allows.
    Held,
}

#[derive(Default)]
struct State {
    /// Jobs of this storage currently queued, executing, or parked on a
    /// write location.
    outstanding: usize,
    /// A fence job is currently queued or executing; everything else waits.
    fence_running: bool,
    /// Jobs held back by a fence, in arrival order. May contain further
    /// fence jobs.
    blocked: VecDeque<DiskJob>,
    /// Locations with a write currently queued or executing.
    live_writes: HashSet<WriteKey>,
    /// Writes waiting for an earlier write to the same location.
    parked_writes: HashMap<WriteKey, VecDeque<DiskJob>>,
}

#[derive(Default)]
pub(crate) struct JobFence {
    state: Mutex<State>,
}

impl JobFence {
    /// Offers a non-fence job. A write finding its location occupied is
    /// parked until the earlier write completes.
    pub fn add_job(&self, job: DiskJob) -> Submit {
        let mut state = self.state.lock().unwrap();
        if state.fence_running || !state.blocked.is_empty() {
            state.blocked.push_back(job);
            Submit::Held
        } else {
            Self::claim_or_park(&mut state, job)
        }
    }

    /// Claims a write's location, or parks the job behind the write that
    /// holds it. Non-write jobs always pass.
    fn claim_or_park(state: &mut State, job: DiskJob) -> Submit {
        if let Some(key) = job.write_key() {
            if state.live_writes.contains(&key) {
                // the parked write is still outstanding from the fence's
                // point of view: fences raised now must wait for it
                state.outstanding += 1;
                state
                    .parked_writes
                    .entry(key)
                    .or_insert_with(VecDeque::new)
                    .push_back(job);
                return Submit::Held;
            }
            state.live_writes.insert(key);
        }
        state.outstanding += 1;
        Submit::Now(job)
    }

    /// Offers a fence job. The three outcomes: with no live jobs the fence
    /// is raised and the job queued immediately; with live jobs the fence
    /// job waits for them to drain; with a fence already up it joins the
    /// blocked queue.
    pub fn raise_fence(&self, job: DiskJob) -> Submit {
        let mut state = self.state.lock().unwrap();
        if !state.fence_running
            && state.blocked.is_empty()
            && state.outstanding == 0
        {
            state.fence_running = true;
            state.outstanding = 1;
            Submit::Now(job)
        } else {
            state.blocked.push_back(job);
            Submit::Held
        }
    }

    /// Records a completion of one of this storage's jobs (a write passes
    /// the location it occupied) and appends any newly unblocked jobs to
    /// `out`. Returns how many were unblocked.
    pub fn job_complete(
        &self,
        write_key: Option<WriteKey>,
        out: &mut Vec<DiskJob>,
    ) -> usize {
        let mut state = self.state.lock().unwrap();
        debug_assert!(state.outstanding > 0);
        state.outstanding -= 1;

        let mut released = 0;
        if let Some(key) = write_key {
            let was_live = state.live_writes.remove(&key);
            debug_assert!(was_live);
            // hand the location to the next write waiting for it
            if let Some(parked) = state.parked_writes.get_mut(&key) {
                let next = parked.pop_front();
                let now_empty = parked.is_empty();
                if now_empty {
                    state.parked_writes.remove(&key);
                }
                if let Some(next) = next {
                    state.live_writes.insert(key);
                    out.push(next);
                    released += 1;
                }
            }
        }

        if state.outstanding > 0 {
            return released;
        }
        // nothing outstanding also means nothing parked
        debug_assert!(state.live_writes.is_empty());
        debug_assert!(state.parked_writes.is_empty());
        state.fence_running = false;

        if let Some(job) = state.blocked.front() {
            if job.is_fence() {
                let job = state.blocked.pop_front().expect("front exists");
                state.fence_running = true;
                state.outstanding = 1;
                out.push(job);
                released += 1;
            } else {
                while state
                    .blocked
                    .front()
                    .map(|j| !j.is_fence())
                    .unwrap_or(false)
                {
                    let job =
                        state.blocked.pop_front().expect("front exists");
                    // released writes re-claim their locations; a loser
                    // parks and follows once the winner completes
                    if let Submit::Now(job) =
                        Self::claim_or_park(&mut state, job)
                    {
                        out.push(job);
                        released += 1;
                    }
                }
                // a fence further back keeps waiting for these to drain
            }
        }
        released
    }

    /// The number of this storage's jobs currently live in the engine.
    pub fn num_outstanding(&self) -> usize {
        self.state.lock().unwrap().outstanding
    }

    /// True if a fence job is queued or executing.
    pub fn has_fence(&self) -> bool {
        self.state.lock().unwrap().fence_running
    }
}
