//! Fixed pool of worker event-loops
//!
//! The acceptor hands every accepted connection to one of a fixed set of
//! workers. Each worker is a dedicated OS thread driving its own
//! current-thread tokio runtime, so a connection spends its whole life on
//! one thread and session state never crosses cores. Assignment is
//! round-robin by default; setting `zuul.server.eventloops.use_leastconns`
//! switches to picking the worker with the fewest connections.
//!
//! Hand-off is a bounded channel per worker. A full channel falls over to
//! the next worker in ring order; when every channel is full the
//! connection is rejected back to the acceptor.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::DynamicProperties;
use crate::constants::worker::HANDOFF_CAPACITY;
use crate::types::{ThreadCount, WorkerId};

/// A connection's whole lifetime, boxed for hand-off to a worker
pub type ConnectionTask = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// One worker as seen from the acceptor side
struct WorkerHandle {
    id: WorkerId,
    sender: mpsc::Sender<ConnectionTask>,
    /// Connections assigned and not yet finished, queued ones included
    load: Arc<AtomicUsize>,
    thread: JoinHandle<()>,
}

/// The fixed set of worker event-loops
pub struct WorkerPool {
    workers: Vec<WorkerHandle>,
    next: AtomicUsize,
    properties: Arc<DynamicProperties>,
}

impl WorkerPool {
    /// Spawn `count` worker threads, each pinned (best effort) to a core
    /// and running its own current-thread runtime
    ///
    /// # Errors
    ///
    /// Returns an error if a worker thread or its runtime cannot be created.
    pub fn start(
        count: ThreadCount,
        drain: Duration,
        properties: Arc<DynamicProperties>,
    ) -> std::io::Result<Self> {
        Self::start_with_capacity(count, drain, HANDOFF_CAPACITY, properties)
    }

    fn start_with_capacity(
        count: ThreadCount,
        drain: Duration,
        capacity: usize,
        properties: Arc<DynamicProperties>,
    ) -> std::io::Result<Self> {
        let mut workers = Vec::with_capacity(count.get());
        for index in 0..count.get() {
            let id = WorkerId::from_index(index);
            let (sender, receiver) = mpsc::channel(capacity);
            let load = Arc::new(AtomicUsize::new(0));

            // Built here so a failure surfaces before any thread exists
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()?;

            let worker_load = Arc::clone(&load);
            let thread = std::thread::Builder::new()
                .name(format!("worker-{index}"))
                .spawn(move || {
                    pin_to_core(index);
                    runtime.block_on(run_worker(id, receiver, worker_load, drain));
                })?;

            workers.push(WorkerHandle {
                id,
                sender,
                load,
                thread,
            });
        }

        info!(workers = count.get(), "worker event-loops started");
        Ok(Self {
            workers,
            next: AtomicUsize::new(0),
            properties,
        })
    }

    /// Number of workers in the pool
    #[must_use]
    pub fn len(&self) -> usize {
        self.workers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Connections currently assigned to the given worker
    #[must_use]
    pub fn load_of(&self, id: WorkerId) -> usize {
        self.workers
            .get(id.as_index())
            .map_or(0, |w| w.load.load(Ordering::Acquire))
    }

    /// Hand a connection to a worker
    ///
    /// Tries the picked worker first, then the rest in ring order. When every
    /// hand-off channel is full the task comes back so the caller can close
    /// the connection instead of queueing unboundedly.
    pub fn dispatch(&self, task: ConnectionTask) -> Result<WorkerId, ConnectionTask> {
        let count = self.workers.len();
        let start = self.pick();
        let mut task = task;

        for offset in 0..count {
            let worker = &self.workers[(start + offset) % count];
            worker.load.fetch_add(1, Ordering::AcqRel);
            match worker.sender.try_send(task) {
                Ok(()) => return Ok(worker.id),
                Err(mpsc::error::TrySendError::Full(rejected))
                | Err(mpsc::error::TrySendError::Closed(rejected)) => {
                    worker.load.fetch_sub(1, Ordering::AcqRel);
                    task = rejected;
                }
            }
        }

        warn!("all worker hand-off channels are full, rejecting connection");
        Err(task)
    }

    fn pick(&self) -> usize {
        if self.properties.use_leastconns() {
            self.workers
                .iter()
                .enumerate()
                .min_by_key(|(_, worker)| worker.load.load(Ordering::Acquire))
                .map_or(0, |(index, _)| index)
        } else {
            self.next.fetch_add(1, Ordering::Relaxed) % self.workers.len()
        }
    }

    /// Close all hand-off channels and wait for every worker to drain
    ///
    /// Each worker gets the drain window to finish its in-flight
    /// connections; whatever is still running afterwards is aborted.
    pub fn shutdown(self) {
        let mut threads = Vec::with_capacity(self.workers.len());
        for worker in self.workers {
            // Dropping the sender ends the worker's recv loop
            drop(worker.sender);
            threads.push((worker.id, worker.thread));
        }
        for (id, thread) in threads {
            if thread.join().is_err() {
                warn!(worker = %id, "worker thread panicked during shutdown");
            }
        }
        info!("all workers drained");
    }
}

/// Decrements the worker's load when the connection finishes, however it
/// finishes
struct LoadGuard(Arc<AtomicUsize>);

impl Drop for LoadGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// The worker's event loop: spawn everything handed over, then drain
async fn run_worker(
    id: WorkerId,
    mut receiver: mpsc::Receiver<ConnectionTask>,
    load: Arc<AtomicUsize>,
    drain: Duration,
) {
    let mut tasks = tokio::task::JoinSet::new();

    loop {
        tokio::select! {
            handed_off = receiver.recv() => match handed_off {
                Some(task) => {
                    let guard = LoadGuard(Arc::clone(&load));
                    tasks.spawn(async move {
                        let _guard = guard;
                        task.await;
                    });
                }
                None => break,
            },
            Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
        }
    }

    // Channel closed: give in-flight connections the drain window
    debug!(worker = %id, in_flight = tasks.len(), "worker draining");
    let deadline = tokio::time::sleep(drain);
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            joined = tasks.join_next() => {
                if joined.is_none() {
                    break;
                }
            }
            () = &mut deadline => {
                warn!(
                    worker = %id,
                    remaining = tasks.len(),
                    "drain window elapsed, aborting remaining connections"
                );
                tasks.abort_all();
                while tasks.join_next().await.is_some() {}
                break;
            }
        }
    }
    debug!(worker = %id, "worker stopped");
}

/// Pin the calling worker thread to one core, wrapping around the
/// available set
///
/// Pinning keeps a worker's cache lines on one core; failure to pin is
/// logged and ignored.
#[cfg(target_os = "linux")]
fn pin_to_core(index: usize) {
    use nix::sched::{sched_setaffinity, CpuSet};
    use nix::unistd::Pid;

    let cores = std::thread::available_parallelism().map_or(1, |p| p.get());
    let core = index % cores;

    let mut cpu_set = CpuSet::new();
    if cpu_set.set(core).is_err() {
        warn!(core, "core index out of range for CpuSet, not pinning");
        return;
    }

    // Pid 0 targets the calling thread
    match sched_setaffinity(Pid::from_raw(0), &cpu_set) {
        Ok(()) => debug!(worker = index, core, "pinned worker thread"),
        Err(error) => warn!(
            core,
            %error,
            "failed to set CPU affinity, continuing without pinning"
        ),
    }
}

#[cfg(not(target_os = "linux"))]
fn pin_to_core(_index: usize) {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::keys;

    fn threads(n: usize) -> ThreadCount {
        ThreadCount::new(n).unwrap()
    }

    #[test]
    fn test_round_robin_cycles_through_workers() {
        let pool = WorkerPool::start(
            threads(2),
            Duration::from_secs(2),
            Arc::new(DynamicProperties::new()),
        )
        .unwrap();

        let mut ids = Vec::new();
        for _ in 0..4 {
            let id = pool.dispatch(Box::pin(async {})).ok().unwrap();
            ids.push(id.as_index());
        }
        pool.shutdown();

        assert_eq!(ids, vec![0, 1, 0, 1]);
    }

    #[test]
    fn test_least_loaded_skips_busy_worker() {
        let properties = Arc::new(DynamicProperties::new());
        properties.set_bool(keys::EVENTLOOPS_USE_LEASTCONNS, true);
        let pool =
            WorkerPool::start(threads(2), Duration::from_secs(2), Arc::clone(&properties)).unwrap();

        // Park one long-lived connection on the first pick
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let first = pool
            .dispatch(Box::pin(async move {
                let _ = release_rx.await;
            }))
            .ok()
            .unwrap();
        assert_eq!(pool.load_of(first), 1);

        // A quick task lands on the idle worker and finishes
        let (done_tx, done_rx) = std::sync::mpsc::channel();
        let second = pool
            .dispatch(Box::pin(async move {
                let _ = done_tx.send(());
            }))
            .ok()
            .unwrap();
        assert_ne!(second, first);
        done_rx.recv_timeout(Duration::from_secs(2)).unwrap();

        // Wait for the load decrement to land, then the idle worker wins
        // again even though round-robin would have moved on
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while pool.load_of(second) != 0 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        let third = pool.dispatch(Box::pin(async {})).ok().unwrap();
        assert_eq!(third, second);

        let _ = release_tx.send(());
        pool.shutdown();
    }

    #[test]
    fn test_full_hand_off_rejects_connection() {
        let pool = WorkerPool::start_with_capacity(
            threads(1),
            Duration::from_secs(5),
            1,
            Arc::new(DynamicProperties::new()),
        )
        .unwrap();

        // Stall the only worker's runtime so its queue cannot drain
        let (started_tx, started_rx) = std::sync::mpsc::channel();
        pool.dispatch(Box::pin(async move {
            let _ = started_tx.send(());
            std::thread::sleep(Duration::from_millis(300));
        }))
        .ok()
        .unwrap();
        started_rx.recv_timeout(Duration::from_secs(2)).unwrap();

        // One task fits the queue, the next has nowhere to go
        assert!(pool.dispatch(Box::pin(async {})).is_ok());
        assert!(pool.dispatch(Box::pin(async {})).is_err());

        pool.shutdown();
    }

    #[test]
    fn test_shutdown_waits_for_in_flight_tasks() {
        let pool = WorkerPool::start(
            threads(2),
            Duration::from_secs(5),
            Arc::new(DynamicProperties::new()),
        )
        .unwrap();

        let (done_tx, done_rx) = std::sync::mpsc::channel();
        pool.dispatch(Box::pin(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            let _ = done_tx.send(());
        }))
        .ok()
        .unwrap();

        pool.shutdown();
        // The task finished inside the drain window, before join returned
        done_rx.try_recv().unwrap();
    }

    #[test]
    fn test_drain_deadline_aborts_stragglers() {
        let pool = WorkerPool::start(
            threads(1),
            Duration::from_millis(100),
            Arc::new(DynamicProperties::new()),
        )
        .unwrap();

        pool.dispatch(Box::pin(async {
            tokio::time::sleep(Duration::from_secs(30)).await;
        }))
        .ok()
        .unwrap();

        let started = std::time::Instant::now();
        pool.shutdown();
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_load_settles_to_zero() {
        let pool = WorkerPool::start(
            threads(1),
            Duration::from_secs(2),
            Arc::new(DynamicProperties::new()),
        )
        .unwrap();

        let (done_tx, done_rx) = std::sync::mpsc::channel();
        let id = pool
            .dispatch(Box::pin(async move {
                let _ = done_tx.send(());
            }))
            .ok()
            .unwrap();
        done_rx.recv_timeout(Duration::from_secs(2)).unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while pool.load_of(id) != 0 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(pool.load_of(id), 0);
        pool.shutdown();
    }
}
