// Copyright (c) The Meridian Network Contributors
// SPDX-License-Identifier: Apache-2.0

//! A small prioritized job queue.
//!
//! Jobs run to completion on a fixed worker pool; within a priority class
//! they run in submission order. Ledger acceptance outranks everything so a
//! burst of disk writes can never delay the close of a round.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use tracing::{debug, warn};

/// Priority classes, highest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum JobType {
    Disk = 0,
    ValidationWrite = 1,
    Transaction = 2,
    AcceptLedger = 3,
}

struct QueuedJob {
    job_type: JobType,
    seq: u64,
    name: &'static str,
    work: Box<dyn FnOnce() + Send>,
}

impl PartialEq for QueuedJob {
    fn eq(&self, other: &Self) -> bool {
        self.job_type == other.job_type && self.seq == other.seq
    }
}

impl Eq for QueuedJob {}

impl PartialOrd for QueuedJob {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedJob {
    fn cmp(&self, other: &Self) -> Ordering {
        // Higher class first; earlier submission first within a class.
        self.job_type
            .cmp(&other.job_type)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct Shared {
    // std primitives here: the condvar must pair with the mutex it waits on.
    queue: Mutex<BinaryHeap<QueuedJob>>,
    available: Condvar,
    shutdown: AtomicBool,
    next_seq: AtomicU64,
}

pub struct JobQueue {
    shared: Arc<Shared>,
    workers: Vec<thread::JoinHandle<()>>,
}

impl JobQueue {
    pub fn new(workers: usize) -> Self {
        let shared = Arc::new(Shared {
            queue: Mutex::new(BinaryHeap::new()),
            available: Condvar::new(),
            shutdown: AtomicBool::new(false),
            next_seq: AtomicU64::new(0),
        });
        let workers = (0..workers.max(1))
            .map(|n| {
                let shared = shared.clone();
                thread::Builder::new()
                    .name(format!("job-worker-{}", n))
                    .spawn(move || worker_loop(shared))
                    .expect("worker threads must spawn")
            })
            .collect();
        Self { shared, workers }
    }

    pub fn add_job(&self, job_type: JobType, name: &'static str, work: impl FnOnce() + Send + 'static) {
        let seq = self.shared.next_seq.fetch_add(1, AtomicOrdering::SeqCst);
        let mut queue = self
            .shared
            .queue
            .lock()
            .expect("job queue lock poisoned");
        queue.push(QueuedJob {
            job_type,
            seq,
            name,
            work: Box::new(work),
        });
        drop(queue);
        self.shared.available.notify_one();
    }

    pub fn pending(&self) -> usize {
        self.shared
            .queue
            .lock()
            .expect("job queue lock poisoned")
            .len()
    }

    /// Blocks until the queue drains (test and shutdown aid).
    pub fn drain(&self) {
        while self.pending() > 0 {
            thread::yield_now();
        }
    }
}

impl Drop for JobQueue {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, AtomicOrdering::SeqCst);
        self.shared.available.notify_all();
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                warn!(target: "node", "a job worker panicked during shutdown");
            }
        }
    }
}

fn worker_loop(shared: Arc<Shared>) {
    loop {
        let job = {
            let mut queue = shared.queue.lock().expect("job queue lock poisoned");
            loop {
                if let Some(job) = queue.pop() {
                    break job;
                }
                if shared.shutdown.load(AtomicOrdering::SeqCst) {
                    return;
                }
                queue = shared
                    .available
                    .wait(queue)
                    .expect("job queue lock poisoned");
            }
        };
        debug!(target: "node", job = job.name, "running job");
        (job.work)();
    }
}
