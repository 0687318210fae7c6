// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Deferred completion worker draining queues outside interrupt context
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: 2 unit tests, tests/concurrency.rs
//!
//! The interrupt side only sets a per-queue bit and pokes a condvar; it never
//! touches queue state. The worker thread swaps the pending bits out and runs
//! `process_completed` for every kicked queue. Kicks that arrive while a pass
//! is running are picked up by the next pass.

use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use log::{debug, info};
use parking_lot::{Condvar, Mutex};

use crate::queue::DescQueue;
use crate::QueueId;

struct WorkerShared {
    pending: AtomicU32,
    stop: AtomicBool,
    passes: AtomicU64,
    lock: Mutex<()>,
    wake: Condvar,
}

/// Cloneable kick handle, safe to call from an interrupt-like context.
#[derive(Clone)]
pub struct WorkerHandle {
    shared: Arc<WorkerShared>,
}

impl WorkerHandle {
    /// Schedules a drain of `queue`.
    pub fn kick(&self, queue: QueueId) {
        self.shared.pending.fetch_or(1 << queue.index(), Ordering::AcqRel);
        let _guard = self.shared.lock.lock();
        self.shared.wake.notify_one();
    }

    /// Completed worker passes.
    pub fn passes(&self) -> u64 {
        self.shared.passes.load(Ordering::Acquire)
    }
}

pub struct CompletionWorker {
    handle: WorkerHandle,
    thread: Option<JoinHandle<()>>,
}

impl CompletionWorker {
    pub fn spawn(queues: Vec<Arc<DescQueue>>) -> io::Result<Self> {
        let shared = Arc::new(WorkerShared {
            pending: AtomicU32::new(0),
            stop: AtomicBool::new(false),
            passes: AtomicU64::new(0),
            lock: Mutex::new(()),
            wake: Condvar::new(),
        });
        let worker_shared = Arc::clone(&shared);
        let thread = thread::Builder::new()
            .name("sep-completion".into())
            .spawn(move || run(worker_shared, queues))?;
        info!("sep: completion worker started");
        Ok(Self { handle: WorkerHandle { shared }, thread: Some(thread) })
    }

    pub fn handle(&self) -> WorkerHandle {
        self.handle.clone()
    }

    pub fn kick(&self, queue: QueueId) {
        self.handle.kick(queue);
    }
}

impl Drop for CompletionWorker {
    fn drop(&mut self) {
        self.handle.shared.stop.store(true, Ordering::Release);
        {
            let _guard = self.handle.shared.lock.lock();
            self.handle.shared.wake.notify_all();
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("sep: completion worker panicked");
            }
        }
        info!("sep: completion worker stopped");
    }
}

fn run(shared: Arc<WorkerShared>, queues: Vec<Arc<DescQueue>>) {
    loop {
        let bits = shared.pending.swap(0, Ordering::AcqRel);
        if bits != 0 {
            for queue in &queues {
                if bits & (1 << queue.id().index()) != 0 {
                    let retired = queue.process_completed();
                    debug!("{}: worker retired {retired}", queue.id());
                }
            }
            shared.passes.fetch_add(1, Ordering::AcqRel);
        }

        let mut guard = shared.lock.lock();
        if shared.stop.load(Ordering::Acquire) {
            break;
        }
        if shared.pending.load(Ordering::Acquire) == 0 {
            shared.wake.wait(&mut guard);
        }
    }
}
