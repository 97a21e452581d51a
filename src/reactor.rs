//! Shared job queue driven by any number of threads.
//!
//! Sessions never run bound functions on the I/O runtime. Each decoded
//! server-side envelope becomes a [`Job`] posted here, and whichever thread
//! is driving the reactor (through `run`, `run_one`, `poll`, `poll_one`, or
//! the workers started by `async_run`) picks it up. All drivers pull from one
//! queue, so there is a single reactor however many threads serve it.
//!
//! The queue is bounded. Posting into a full queue waits for a driver to
//! make room, which in turn stops the posting session from reading more
//! requests off its socket.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;

use crate::error::{Result, RpcError};

/// Default number of jobs that may wait for a driver.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// A unit of work posted to the reactor.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

enum Task {
    Run(Job),
    /// Unblocks one runner so it can observe `stopped`.
    Wake,
}

/// Job queue plus the bookkeeping needed to stop its drivers.
pub struct Reactor {
    tx: flume::Sender<Task>,
    rx: flume::Receiver<Task>,
    stopped: AtomicBool,
    /// Threads currently blocked in `run` or `run_one`.
    runners: AtomicUsize,
    workers: Mutex<WorkerGroup>,
}

impl Reactor {
    /// Create an idle reactor with the default queue capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_QUEUE_CAPACITY)
    }

    /// Create an idle reactor holding at most `capacity` waiting jobs.
    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, rx) = flume::bounded(capacity.max(1));
        Self {
            tx,
            rx,
            stopped: AtomicBool::new(false),
            runners: AtomicUsize::new(0),
            workers: Mutex::new(WorkerGroup::new()),
        }
    }

    /// Queue a job. It runs on the next thread that drives the reactor.
    ///
    /// Blocks while the queue is full.
    ///
    /// # Errors
    ///
    /// [`RpcError::Stopped`] once [`Reactor::stop`] has been called.
    pub fn post<F>(&self, job: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        if self.is_stopped() {
            return Err(RpcError::Stopped);
        }
        // The receiver lives in `self`, so the channel cannot be disconnected.
        let _ = self.tx.send(Task::Run(Box::new(job)));
        Ok(())
    }

    /// Queue a job from async code, yielding while the queue is full.
    ///
    /// # Errors
    ///
    /// [`RpcError::Stopped`] once [`Reactor::stop`] has been called.
    pub async fn post_async<F>(&self, job: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        if self.is_stopped() {
            return Err(RpcError::Stopped);
        }
        let _ = self.tx.send_async(Task::Run(Box::new(job))).await;
        Ok(())
    }

    /// Run jobs on the calling thread until [`Reactor::stop`].
    ///
    /// Returns the number of jobs executed.
    pub fn run(&self) -> usize {
        let _runner = RunnerGuard::enter(self);
        let mut executed = 0;

        while !self.is_stopped() {
            match self.rx.recv() {
                Ok(Task::Run(job)) => {
                    job();
                    executed += 1;
                }
                Ok(Task::Wake) => {}
                Err(_) => break,
            }
        }

        executed
    }

    /// Block until one job has run, or the reactor is stopped.
    pub fn run_one(&self) -> usize {
        let _runner = RunnerGuard::enter(self);
        if self.is_stopped() {
            return 0;
        }

        match self.rx.recv() {
            Ok(Task::Run(job)) => {
                job();
                1
            }
            _ => 0,
        }
    }

    /// Run every ready job without blocking.
    pub fn poll(&self) -> usize {
        let mut executed = 0;
        while self.poll_one() == 1 {
            executed += 1;
        }
        executed
    }

    /// Run at most one ready job without blocking.
    pub fn poll_one(&self) -> usize {
        if self.is_stopped() {
            return 0;
        }

        loop {
            match self.rx.try_recv() {
                Ok(Task::Run(job)) => {
                    job();
                    return 1;
                }
                // Stale wake-up left behind by an earlier stop.
                Ok(Task::Wake) => continue,
                Err(_) => return 0,
            }
        }
    }

    /// Start `threads` worker threads that each call [`Reactor::run`].
    ///
    /// # Errors
    ///
    /// Returns error if the OS refuses to spawn a thread. Workers started
    /// before the failure keep running.
    pub fn async_run(self: &Arc<Self>, threads: usize) -> Result<()> {
        let mut workers = self.workers.lock();
        let reactor = Arc::clone(self);
        workers.create_threads(threads, move || {
            let executed = reactor.run();
            tracing::debug!(executed, "Worker exiting");
        })?;
        tracing::debug!(threads, total = workers.len(), "Workers started");
        Ok(())
    }

    /// Stop every driver and join all worker threads.
    ///
    /// Idempotent. Jobs still queued are discarded, which also releases
    /// anything blocked posting into a full queue. Called from a worker
    /// thread, that thread is not joined.
    pub fn stop(&self) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            tracing::debug!("Stopping reactor");
        }

        for _ in 0..self.runners.load(Ordering::SeqCst) {
            // A full queue wakes runners on its own.
            let _ = self.tx.try_send(Task::Wake);
        }

        let mut workers = std::mem::take(&mut *self.workers.lock());
        workers.join_all();

        let discarded = self
            .rx
            .try_iter()
            .filter(|task| matches!(task, Task::Run(_)))
            .count();
        if discarded > 0 {
            tracing::debug!(discarded, "Dropped queued jobs");
        }
    }

    /// True once [`Reactor::stop`] has been called.
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Number of jobs waiting to run.
    pub fn pending(&self) -> usize {
        self.rx.len()
    }
}

impl Default for Reactor {
    fn default() -> Self {
        Self::new()
    }
}

struct RunnerGuard<'a> {
    runners: &'a AtomicUsize,
}

impl<'a> RunnerGuard<'a> {
    fn enter(reactor: &'a Reactor) -> Self {
        reactor.runners.fetch_add(1, Ordering::SeqCst);
        Self {
            runners: &reactor.runners,
        }
    }
}

impl Drop for RunnerGuard<'_> {
    fn drop(&mut self) {
        self.runners.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Named OS threads created together and joined together.
#[derive(Default)]
pub struct WorkerGroup {
    threads: Vec<JoinHandle<()>>,
}

impl WorkerGroup {
    /// Create an empty group.
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn `n` threads, each running a clone of `entry`.
    pub fn create_threads<F>(&mut self, n: usize, entry: F) -> Result<()>
    where
        F: Fn() + Clone + Send + 'static,
    {
        for _ in 0..n {
            let index = self.threads.len();
            let entry = entry.clone();
            let handle = thread::Builder::new()
                .name(format!("packrpc-worker-{index}"))
                .spawn(entry)?;
            self.threads.push(handle);
        }
        Ok(())
    }

    /// Join every thread in the group, skipping the calling thread.
    pub fn join_all(&mut self) {
        let current = thread::current().id();
        for handle in self.threads.drain(..) {
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                tracing::error!("Worker thread panicked");
            }
        }
    }

    /// Number of threads not yet joined.
    pub fn len(&self) -> usize {
        self.threads.len()
    }

    /// True if no threads are running.
    pub fn is_empty(&self) -> bool {
        self.threads.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    #[test]
    fn test_nothing_runs_until_driven() {
        let reactor = Reactor::new();
        let count = Arc::new(AtomicU32::new(0));

        for _ in 0..3 {
            let count = count.clone();
            reactor
                .post(move || {
                    count.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
        }

        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(reactor.pending(), 3);

        assert_eq!(reactor.poll_one(), 1);
        assert_eq!(reactor.poll(), 2);
        assert_eq!(reactor.poll(), 0);
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_run_one_blocks_for_a_job() {
        let reactor = Arc::new(Reactor::new());

        let poster = {
            let reactor = reactor.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                reactor.post(|| {}).unwrap();
            })
        };

        assert_eq!(reactor.run_one(), 1);
        poster.join().unwrap();
    }

    #[test]
    fn test_stop_unblocks_run() {
        let reactor = Arc::new(Reactor::new());

        let runner = {
            let reactor = reactor.clone();
            thread::spawn(move || reactor.run())
        };

        reactor.post(|| {}).unwrap();
        thread::sleep(Duration::from_millis(20));
        reactor.stop();

        assert_eq!(runner.join().unwrap(), 1);
        assert_eq!(reactor.poll(), 0);
    }

    #[test]
    fn test_async_run_and_stop() {
        let reactor = Arc::new(Reactor::new());
        let count = Arc::new(AtomicU32::new(0));

        reactor.async_run(4).unwrap();
        for _ in 0..100 {
            let count = count.clone();
            reactor
                .post(move || {
                    count.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
        }

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while count.load(Ordering::SeqCst) < 100 && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(count.load(Ordering::SeqCst), 100);

        reactor.stop();
        assert!(reactor.workers.lock().is_empty());

        // Second stop is a no-op.
        reactor.stop();
        assert!(reactor.is_stopped());
    }

    #[test]
    fn test_stop_from_worker_does_not_self_join() {
        let reactor = Arc::new(Reactor::new());
        let (done_tx, done_rx) = flume::bounded(1);

        reactor.async_run(2).unwrap();
        let handle = reactor.clone();
        reactor
            .post(move || {
                handle.stop();
                let _ = done_tx.send(());
            })
            .unwrap();

        done_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(reactor.is_stopped());
    }

    #[test]
    fn test_post_after_stop_is_refused() {
        let reactor = Reactor::new();
        reactor.stop();

        assert!(matches!(reactor.post(|| {}), Err(RpcError::Stopped)));
        assert_eq!(reactor.pending(), 0);
    }

    #[test]
    fn test_full_queue_blocks_poster_until_drained() {
        let reactor = Arc::new(Reactor::with_capacity(2));
        reactor.post(|| {}).unwrap();
        reactor.post(|| {}).unwrap();

        let poster = {
            let reactor = reactor.clone();
            thread::spawn(move || reactor.post(|| {}))
        };
        thread::sleep(Duration::from_millis(20));
        assert!(!poster.is_finished());
        assert_eq!(reactor.pending(), 2);

        assert_eq!(reactor.poll_one(), 1);
        poster.join().unwrap().unwrap();
        assert_eq!(reactor.poll(), 2);
    }

    #[test]
    fn test_stop_discards_queued_jobs() {
        let reactor = Reactor::with_capacity(4);
        let count = Arc::new(AtomicU32::new(0));
        for _ in 0..3 {
            let count = count.clone();
            reactor
                .post(move || {
                    count.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
        }

        reactor.stop();
        assert_eq!(reactor.pending(), 0);
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_post_async_waits_for_room() {
        let reactor = Arc::new(Reactor::with_capacity(1));
        reactor.post_async(|| {}).await.unwrap();

        let driver = {
            let reactor = reactor.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                reactor.poll_one()
            })
        };
        reactor.post_async(|| {}).await.unwrap();

        assert_eq!(driver.join().unwrap(), 1);
        assert_eq!(reactor.pending(), 1);
    }

    #[test]
    fn test_worker_threads_are_named() {
        let mut group = WorkerGroup::new();
        let (tx, rx) = flume::unbounded();

        group
            .create_threads(2, move || {
                let _ = tx.send(thread::current().name().map(str::to_string));
            })
            .unwrap();
        group.join_all();

        let mut names: Vec<_> = rx.try_iter().flatten().collect();
        names.sort();
        assert_eq!(names, vec!["packrpc-worker-0", "packrpc-worker-1"]);
    }
}
