/*
Copyright 2021 Google LLC

Licensed under the Apache License, Version 2.0 (the "License");
you may not use this file except in compliance with the License.
You may obtain a copy of the License at

     https://www.apache.org/licenses/LICENSE-2.0

Unless required by applicable law or agreed to in writing, software
distributed under the License is distributed on an "AS IS" BASIS,
WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
See the License for the specific language governing permissions and
limitations under the License.
*/

//! Job scheduling: per-worker queues fed round-robin by the walker on
//! the master thread, with work stealing between workers and sentinel
//! based termination. Every submission carries a monotonically
//! increasing slot number; the output sink uses it to release chunks
//! in submission order when sorting is requested.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::plan::Input;

/// Reserved slot number of the stop sentinel.
pub const NONE_SLOT: u64 = u64::MAX;

/// One unit of work: a file (or stdin) to search.
#[derive(Debug, Clone)]
pub struct Job {
    pub slot: u64,
    /// None marks the stop sentinel.
    pub input: Option<Input>,
    /// Precomputed fuzzy cost for best-match sorting.
    pub cost: Option<u16>,
}

impl Job {
    fn sentinel() -> Job {
        Job {
            slot: NONE_SLOT,
            input: None,
            cost: None,
        }
    }

    pub fn is_sentinel(&self) -> bool {
        self.slot == NONE_SLOT
    }
}

/// A worker's own job deque. The pending count is kept in an atomic so
/// the master and stealing peers can probe load without the lock.
pub struct JobQueue {
    jobs: Mutex<VecDeque<Job>>,
    ready: Condvar,
    pending: AtomicUsize,
}

impl JobQueue {
    fn new() -> JobQueue {
        JobQueue {
            jobs: Mutex::new(VecDeque::new()),
            ready: Condvar::new(),
            pending: AtomicUsize::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.pending.load(Ordering::Relaxed)
    }

    fn push(&self, job: Job) {
        let mut q = self.jobs.lock().unwrap();
        q.push_back(job);
        self.pending.store(q.len(), Ordering::Relaxed);
        self.ready.notify_one();
    }

    /// Insert keeping slot order; used for stolen jobs so the receiving
    /// worker keeps draining in submission order. The sentinel's slot is
    /// the maximum, so it stays at the back.
    fn push_ordered(&self, job: Job) {
        let mut q = self.jobs.lock().unwrap();
        let at = q
            .iter()
            .position(|j| j.slot > job.slot)
            .unwrap_or(q.len());
        q.insert(at, job);
        self.pending.store(q.len(), Ordering::Relaxed);
        self.ready.notify_one();
    }

    /// Blocking dequeue.
    fn pop(&self) -> Job {
        let mut q = self.jobs.lock().unwrap();
        loop {
            if let Some(job) = q.pop_front() {
                self.pending.store(q.len(), Ordering::Relaxed);
                return job;
            }
            q = self.ready.wait(q).unwrap();
        }
    }

    /// Take the newest job from this queue when it holds at least
    /// `min_steal` jobs. The sentinel is never stolen.
    fn try_steal(&self, min_steal: usize) -> Option<Job> {
        let mut q = self.jobs.lock().unwrap();
        if q.len() < min_steal {
            return None;
        }
        if q.back().map_or(true, |j| j.is_sentinel()) {
            return None;
        }
        let job = q.pop_back();
        self.pending.store(q.len(), Ordering::Relaxed);
        job
    }
}

/// The worker pool. The master owns it, submits jobs from the walker
/// and finally floods the queues with sentinels and joins.
pub struct Pool {
    queues: Arc<Vec<Arc<JobQueue>>>,
    handles: Vec<JoinHandle<()>>,
    cancel: Arc<AtomicBool>,
    max_queue: usize,
    next_slot: u64,
    rr: usize,
}

impl Pool {
    /// Spawn `jobs` workers running `work` on every dequeued job. Thread
    /// creation failures reduce the worker count; at least one worker
    /// must start.
    pub fn new<F>(
        jobs: usize,
        max_queue: usize,
        min_steal: usize,
        cancel: Arc<AtomicBool>,
        work: F,
    ) -> std::io::Result<Pool>
    where
        F: Fn(usize, Job) + Send + Sync + 'static,
    {
        let jobs = jobs.max(1);
        let queues: Arc<Vec<Arc<JobQueue>>> =
            Arc::new((0..jobs).map(|_| Arc::new(JobQueue::new())).collect());
        let work = Arc::new(work);

        let mut handles = Vec::with_capacity(jobs);
        let mut spawn_error = None;

        for id in 0..jobs {
            let queues = Arc::clone(&queues);
            let cancel = Arc::clone(&cancel);
            let work = Arc::clone(&work);

            let handle = std::thread::Builder::new()
                .name(format!("qgrep-worker-{}", id))
                .spawn(move || worker_loop(id, &queues, &cancel, min_steal, &*work));

            match handle {
                Ok(h) => handles.push(h),
                Err(e) => {
                    log::warn!("cannot start worker {}: {}", id, e);
                    spawn_error = Some(e);
                }
            }
        }

        if handles.is_empty() {
            return Err(spawn_error.unwrap_or_else(|| {
                std::io::Error::new(std::io::ErrorKind::Other, "no worker started")
            }));
        }

        Ok(Pool {
            queues,
            handles,
            cancel,
            max_queue: max_queue.max(2),
            next_slot: 0,
            rr: 0,
        })
    }

    pub fn worker_count(&self) -> usize {
        self.handles.len()
    }

    /// Submit one job, picking the least loaded of the live workers
    /// starting at the round-robin cursor. Sleeps briefly while every
    /// queue is at capacity.
    pub fn submit(&mut self, input: Input, cost: Option<u16>) {
        let slot = self.next_slot;
        self.next_slot += 1;
        let job = Job {
            slot,
            input: Some(input),
            cost,
        };

        let n = self.handles.len();

        loop {
            if self.cancel.load(Ordering::Relaxed) {
                return;
            }

            let mut best = 0;
            let mut best_len = usize::MAX;
            for k in 0..n {
                let i = (self.rr + k) % n;
                let len = self.queues[i].len();
                if len < best_len {
                    best = i;
                    best_len = len;
                }
            }

            if best_len < self.max_queue {
                self.queues[best].push(job);
                self.rr = (self.rr + 1) % n;
                return;
            }

            std::thread::sleep(Duration::from_micros(200));
        }
    }

    /// Send one sentinel per worker and join them all.
    pub fn finish(mut self) {
        for queue in self.queues.iter() {
            queue.push(Job::sentinel());
        }
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

fn worker_loop<F>(
    id: usize,
    queues: &[Arc<JobQueue>],
    cancel: &AtomicBool,
    min_steal: usize,
    work: &F,
) where
    F: Fn(usize, Job),
{
    let own = &queues[id];

    loop {
        // a nearly empty queue probes peers and steals from the fullest
        if own.len() <= 1 && queues.len() > 1 {
            let victim = queues
                .iter()
                .enumerate()
                .filter(|(i, _)| *i != id)
                .max_by_key(|(_, q)| q.len())
                .map(|(_, q)| q);
            if let Some(victim) = victim {
                if let Some(job) = victim.try_steal(min_steal.max(1)) {
                    own.push_ordered(job);
                }
            }
        }

        let job = own.pop();

        if job.is_sentinel() {
            break;
        }

        if cancel.load(Ordering::Relaxed) {
            // drain without searching; sentinels still terminate us
            continue;
        }

        work(id, job);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;

    #[test]
    fn runs_all_jobs_and_terminates() {
        let cancel = Arc::new(AtomicBool::new(false));
        let seen = Arc::new(AtomicU64::new(0));
        let seen2 = Arc::clone(&seen);

        let mut pool = Pool::new(4, 8, 3, cancel, move |_, job| {
            assert!(job.input.is_some());
            seen2.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        for i in 0..100 {
            pool.submit(Input::Path(format!("f{}", i).into()), None);
        }
        pool.finish();

        assert_eq!(seen.load(Ordering::SeqCst), 100);
    }

    #[test]
    fn slots_increase_in_submission_order() {
        let cancel = Arc::new(AtomicBool::new(false));
        let slots = Arc::new(Mutex::new(Vec::new()));
        let slots2 = Arc::clone(&slots);

        let mut pool = Pool::new(1, 4, 3, cancel, move |_, job| {
            slots2.lock().unwrap().push(job.slot);
        })
        .unwrap();

        for i in 0..10 {
            pool.submit(Input::Path(format!("f{}", i).into()), None);
        }
        pool.finish();

        let got = slots.lock().unwrap();
        let want: Vec<u64> = (0..10).collect();
        assert_eq!(*got, want);
    }

    #[test]
    fn cancelled_jobs_are_drained() {
        let cancel = Arc::new(AtomicBool::new(false));
        let seen = Arc::new(AtomicU64::new(0));
        let seen2 = Arc::clone(&seen);

        let mut pool = Pool::new(2, 8, 3, Arc::clone(&cancel), move |_, _| {
            seen2.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        cancel.store(true, Ordering::SeqCst);
        for i in 0..50 {
            pool.submit(Input::Path(format!("f{}", i).into()), None);
        }
        pool.finish();

        assert_eq!(seen.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn steal_respects_threshold_and_sentinel() {
        let q = JobQueue::new();
        q.push(Job {
            slot: 0,
            input: Some(Input::Stdin),
            cost: None,
        });
        q.push(Job {
            slot: 1,
            input: Some(Input::Stdin),
            cost: None,
        });
        assert!(q.try_steal(3).is_none());

        q.push(Job {
            slot: 2,
            input: Some(Input::Stdin),
            cost: None,
        });
        let stolen = q.try_steal(3).unwrap();
        assert_eq!(stolen.slot, 2);

        let q = JobQueue::new();
        q.push(Job::sentinel());
        assert!(q.try_steal(1).is_none());
    }

    #[test]
    fn ordered_insert_keeps_slot_order() {
        let q = JobQueue::new();
        for slot in [5u64, 1, 3] {
            q.push_ordered(Job {
                slot,
                input: Some(Input::Stdin),
                cost: None,
            });
        }
        assert_eq!(q.pop().slot, 1);
        assert_eq!(q.pop().slot, 3);
        assert_eq!(q.pop().slot, 5);
    }
}
