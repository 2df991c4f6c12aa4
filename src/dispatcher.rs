//! Dispatcher and worker pool
//!
//! A fixed set of worker threads, each with its own FIFO of connections,
//! plus one dispatch thread. On every tick (or an early wake) the dispatch
//! thread walks the live connections and hands each one with pending work
//! to the least-loaded worker.
//!
//! A connection is claimed (its `processing` flag set) under the same lock
//! that guards the connection list, before it is queued, and released by
//! the worker after its process step. So a connection sits in at most one
//! worker queue and is never processed by two workers at once, which keeps
//! its frames in wire order.

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, trace, warn};

use crate::Config;
use crate::connection::{Connection, Status};
use crate::error::{Error, Result};

/// Wake-up flag for the dispatch thread
#[derive(Default)]
pub(crate) struct Signal {
    woken: Mutex<bool>,
    cond: Condvar,
}

impl Signal {
    /// Wake the dispatch thread before its tick expires
    pub(crate) fn notify(&self) {
        *self.woken.lock() = true;
        self.cond.notify_one();
    }

    /// Block until notified or `timeout` elapses
    fn wait(&self, timeout: Duration) {
        let mut woken = self.woken.lock();
        if !*woken {
            self.cond.wait_for(&mut woken, timeout);
        }
        *woken = false;
    }
}

#[derive(Default)]
struct WorkerQueue {
    items: VecDeque<Arc<Connection>>,
    /// A connection is being processed right now
    busy: bool,
    stopped: bool,
}

#[derive(Default)]
struct Worker {
    queue: Mutex<WorkerQueue>,
    cond: Condvar,
}

impl Worker {
    fn load(&self) -> usize {
        let queue = self.queue.lock();
        queue.items.len() + usize::from(queue.busy)
    }

    fn push(&self, conn: Arc<Connection>) {
        self.queue.lock().items.push_back(conn);
        self.cond.notify_one();
    }

    fn stop(&self) {
        self.queue.lock().stopped = true;
        self.cond.notify_all();
    }

    /// Next connection to process, or `None` once stopped
    fn next(&self) -> Option<Arc<Connection>> {
        let mut queue = self.queue.lock();
        loop {
            if queue.stopped {
                return None;
            }
            if let Some(conn) = queue.items.pop_front() {
                queue.busy = true;
                return Some(conn);
            }
            self.cond.wait(&mut queue);
        }
    }

    fn idle(&self) {
        self.queue.lock().busy = false;
    }

    fn drain(&self) -> Vec<Arc<Connection>> {
        self.queue.lock().items.drain(..).collect()
    }
}

/// Pick the worker with the shortest queue; ties go to the first one
fn least_loaded(workers: &[Arc<Worker>]) -> Option<&Arc<Worker>> {
    workers.iter().min_by_key(|w| w.load())
}

struct Shared {
    connections: Mutex<Vec<Arc<Connection>>>,
    workers: Vec<Arc<Worker>>,
    signal: Arc<Signal>,
    interval: Duration,
    running: AtomicBool,
}

impl Shared {
    /// One pass over the live connections
    fn dispatch(&self) {
        let mut connections = self.connections.lock();

        connections.retain(|conn| {
            let live = conn.status() != Status::Closed;
            if !live {
                debug!(connection = %conn.id(), "connection removed");
            }
            live
        });

        for conn in connections.iter() {
            if conn.is_processing() || !conn.has_pending_work() {
                continue;
            }
            let Some(worker) = least_loaded(&self.workers) else {
                return;
            };
            if conn.try_claim() {
                trace!(connection = %conn.id(), "connection scheduled");
                worker.push(conn.clone());
            }
        }
    }

    fn dispatch_loop(&self) {
        while self.running.load(Ordering::Acquire) {
            self.dispatch();
            self.signal.wait(self.interval);
        }
    }

    fn worker_loop(&self, worker: &Worker) {
        while let Some(conn) = worker.next() {
            if conn.status() != Status::Closed && conn.has_pending_work() {
                // Listener panics are contained by the connection; this catches the rest
                if panic::catch_unwind(AssertUnwindSafe(|| conn.process())).is_err() {
                    warn!(connection = %conn.id(), "process step panicked");
                    conn.abort();
                }
            }

            {
                let _connections = self.connections.lock();
                conn.unclaim();
            }
            worker.idle();

            // Frames queued while the step ran were skipped by the dispatcher
            if conn.has_pending_work() {
                self.signal.notify();
            }
        }
    }
}

/// Schedules live connections onto a fixed worker pool
pub struct Dispatcher {
    shared: Arc<Shared>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl Dispatcher {
    /// Start the dispatch thread and `config.worker_count` workers
    pub fn new(config: &Config) -> Result<Self> {
        let worker_count = config.worker_count.max(1);
        let dispatcher = Self {
            shared: Arc::new(Shared {
                connections: Mutex::new(Vec::new()),
                workers: (0..worker_count).map(|_| Arc::default()).collect(),
                signal: Arc::new(Signal::default()),
                interval: config.dispatch_interval,
                running: AtomicBool::new(true),
            }),
            threads: Mutex::new(Vec::with_capacity(worker_count + 1)),
        };

        // On a spawn failure, dropping `dispatcher` stops the threads already started
        for (i, worker) in dispatcher.shared.workers.iter().enumerate() {
            let shared = dispatcher.shared.clone();
            let worker = worker.clone();
            let handle = spawn(format!("typhoon-worker-{}", i), move || {
                shared.worker_loop(&worker)
            })?;
            dispatcher.threads.lock().push(handle);
        }
        let shared = dispatcher.shared.clone();
        let handle = spawn("typhoon-dispatch".to_string(), move || shared.dispatch_loop())?;
        dispatcher.threads.lock().push(handle);

        info!(workers = worker_count, interval = ?config.dispatch_interval, "dispatcher started");
        Ok(dispatcher)
    }

    /// Add a connection to the live set
    pub fn register(&self, conn: Arc<Connection>) -> Result<()> {
        conn.attach_signal(self.shared.signal.clone());
        {
            // Checked under the lock so shutdown cannot miss a late registration
            let mut connections = self.shared.connections.lock();
            if !self.is_running() {
                return Err(Error::Shutdown);
            }
            debug!(connection = %conn.id(), "connection registered");
            connections.push(conn);
        }
        self.shared.signal.notify();
        Ok(())
    }

    /// Snapshot of the live connections
    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.shared.connections.lock().clone()
    }

    /// Number of live connections
    pub fn len(&self) -> usize {
        self.shared.connections.lock().len()
    }

    /// Check if there are no live connections
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of worker threads
    pub fn worker_count(&self) -> usize {
        self.shared.workers.len()
    }

    /// Check if the dispatcher still accepts connections
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// Wake the dispatch thread now instead of at the next tick
    pub fn wake(&self) {
        self.shared.signal.notify();
    }

    /// Stop scheduling, wait for in-flight steps, then release every stream
    ///
    /// Connections still queued are unclaimed without being processed.
    /// Called from a listener, the listener's own connection is released
    /// when its process step returns. Calling it again is a no-op.
    pub fn shutdown(&self) {
        {
            let _connections = self.shared.connections.lock();
            if !self.shared.running.swap(false, Ordering::AcqRel) {
                return;
            }
        }
        self.shared.signal.notify();
        for worker in &self.shared.workers {
            worker.stop();
        }

        let current = thread::current().id();
        for handle in self.threads.lock().drain(..) {
            if handle.thread().id() != current {
                let _ = handle.join();
            }
        }

        for worker in &self.shared.workers {
            for conn in worker.drain() {
                conn.unclaim();
            }
        }

        let connections: Vec<_> = self.shared.connections.lock().drain(..).collect();
        for conn in &connections {
            conn.abort();
        }
        info!(released = connections.len(), "dispatcher stopped");
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("workers", &self.worker_count())
            .field("connections", &self.len())
            .field("running", &self.is_running())
            .finish()
    }
}

fn spawn<F>(name: String, f: F) -> Result<JoinHandle<()>>
where
    F: FnOnce() + Send + 'static,
{
    Ok(thread::Builder::new().name(name).spawn(f)?)
}
