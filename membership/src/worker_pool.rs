//! Fixed-size pools of named worker threads.
//!
//! A *shared* pool feeds every thread from one queue; a *keyed* pool gives
//! each thread its own lane and routes a job by key, so jobs submitted with
//! the same key run one at a time in submission order.

use {
    crossbeam_channel::{unbounded, Receiver, Sender},
    log::{debug, error},
    parking_lot::{Mutex, RwLock},
    std::{
        any::Any,
        panic::{self, AssertUnwindSafe},
        thread::{self, Builder, JoinHandle},
    },
};

type Job = Box<dyn FnOnce() + Send + 'static>;

pub struct WorkerPool {
    name: String,
    lanes: RwLock<Vec<Sender<Job>>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// `threads` workers pulling from a single queue.
    pub fn new(name: &str, threads: usize) -> Self {
        let (sender, receiver) = unbounded::<Job>();
        let threads = (0..threads.max(1))
            .map(|i| spawn_worker(format!("{name}{i:02}"), receiver.clone()))
            .collect();
        Self {
            name: name.to_string(),
            lanes: RwLock::new(vec![sender]),
            threads: Mutex::new(threads),
        }
    }

    /// One worker per lane; see [`WorkerPool::execute_keyed`].
    pub fn keyed(name: &str, lanes: usize) -> Self {
        let (senders, threads) = (0..lanes.max(1))
            .map(|i| {
                let (sender, receiver) = unbounded::<Job>();
                (sender, spawn_worker(format!("{name}{i:02}"), receiver))
            })
            .unzip();
        Self {
            name: name.to_string(),
            lanes: RwLock::new(senders),
            threads: Mutex::new(threads),
        }
    }

    /// Prefix of the pool's thread names.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queue `job`.  Returns false once the pool is shut down.
    pub fn execute<F>(&self, job: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        self.execute_keyed(0, job)
    }

    /// Queue `job` on the lane for `key`.  In a keyed pool jobs sharing a
    /// key never overlap and run in the order they were queued.
    pub fn execute_keyed<F>(&self, key: u64, job: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        let lanes = self.lanes.read();
        let Ok(count) = u64::try_from(lanes.len()) else {
            return false;
        };
        if count == 0 {
            return false;
        }
        let lane = usize::try_from(key.checked_rem(count).unwrap_or(0)).unwrap_or(0);
        lanes
            .get(lane)
            .is_some_and(|sender| sender.send(Box::new(job)).is_ok())
    }

    pub fn is_shutdown(&self) -> bool {
        self.lanes.read().is_empty()
    }

    /// Stop accepting jobs, let queued ones finish and join the workers.
    /// A worker calling this is not joined.  Idempotent.
    pub fn shutdown(&self) {
        let lanes = std::mem::take(&mut *self.lanes.write());
        if lanes.is_empty() && self.threads.lock().is_empty() {
            return;
        }
        drop(lanes);
        let current = thread::current().id();
        let threads = std::mem::take(&mut *self.threads.lock());
        for handle in threads {
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                error!("{} worker exited abnormally", self.name);
            }
        }
        debug!("{} pool shut down", self.name);
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn spawn_worker(name: String, receiver: Receiver<Job>) -> JoinHandle<()> {
    Builder::new()
        .name(name)
        .spawn(move || {
            for job in receiver.iter() {
                if let Err(panic) = panic::catch_unwind(AssertUnwindSafe(job)) {
                    error!(
                        "job on {} panicked: {}",
                        thread::current().name().unwrap_or("worker"),
                        panic_message(panic.as_ref())
                    );
                }
            }
        })
        .expect("failed to spawn worker thread")
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "unknown panic"
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        std::{
            sync::{
                atomic::{AtomicUsize, Ordering},
                Arc,
            },
            time::Duration,
        },
    };

    #[test]
    fn test_keyed_lanes_preserve_order() {
        let pool = WorkerPool::keyed("testLane", 4);
        let seen = Arc::new(Mutex::new(Vec::new()));
        for i in 0..200u64 {
            let seen = seen.clone();
            assert!(pool.execute_keyed(7, move || {
                if i % 10 == 0 {
                    thread::sleep(Duration::from_millis(1));
                }
                seen.lock().push(i);
            }));
        }
        pool.shutdown();
        assert_eq!(*seen.lock(), (0..200).collect::<Vec<_>>());
    }

    #[test]
    fn test_panicking_job_does_not_kill_worker() {
        let pool = WorkerPool::new("testPanic", 1);
        let ran = Arc::new(AtomicUsize::new(0));
        pool.execute(|| panic!("boom"));
        let counter = ran.clone();
        pool.execute(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        pool.shutdown();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_shutdown_from_worker_and_after() {
        let pool = Arc::new(WorkerPool::new("testStop", 2));
        let inner = pool.clone();
        let (done_tx, done_rx) = crossbeam_channel::bounded(1);
        pool.execute(move || {
            inner.shutdown();
            done_tx.send(()).unwrap();
        });
        done_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(pool.is_shutdown());
        assert!(!pool.execute(|| {}));
        pool.shutdown();
    }
}
