//! Bounded worker pool with spawn/wait-all semantics.
//!
//! Fan-outs (quorum PUTs, replication, cleanup) push short tasks onto a
//! bounded channel served by dedicated threads; `run_all` is a join barrier,
//! returning only when every submitted task has finished.

use std::thread::JoinHandle;

use crossbeam_channel::{bounded, Receiver, Sender};

const CHANNEL_BOUND: usize = 1024;

type Job = Box<dyn FnOnce() + Send>;

/// A fixed-size pool of named worker threads.
pub struct WorkerPool {
    tx: Option<Sender<Job>>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(size: usize) -> Self {
        let (tx, rx) = bounded::<Job>(CHANNEL_BOUND);
        let handles = (0..size.max(1))
            .map(|i| {
                let rx: Receiver<Job> = rx.clone();
                std::thread::Builder::new()
                    .name(format!("cleave-worker-{i}"))
                    .spawn(move || {
                        while let Ok(job) = rx.recv() {
                            job();
                        }
                    })
                    .expect("failed to spawn worker thread")
            })
            .collect();
        Self { tx: Some(tx), handles }
    }

    /// Run every task on the pool and wait for all of them. Results come back
    /// in completion order.
    pub fn run_all<T, F>(&self, tasks: Vec<F>) -> Vec<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        if tasks.is_empty() {
            return Vec::new();
        }
        let count = tasks.len();
        let (result_tx, result_rx) = bounded(count);
        let tx = self.tx.as_ref().expect("pool already shut down");
        for task in tasks {
            let result_tx = result_tx.clone();
            let job: Job = Box::new(move || {
                let _ = result_tx.send(task());
            });
            tx.send(job).expect("worker pool channel disconnected");
        }
        drop(result_tx);
        result_rx.iter().take(count).collect()
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // Closing the channel lets the workers drain and exit.
        self.tx.take();
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}
