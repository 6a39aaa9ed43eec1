//! Minimal fork/join worker pool.
//!
//! Shader IO and compilation run as chained jobs on this pool. Jobs are
//! dispatched FIFO over a channel; a `Task<T>` is the join handle, backed by
//! a single-slot channel the job fills on completion. Dependent jobs simply
//! capture the upstream `Task` and wait on it from inside the pool, which is
//! safe because dispatch order follows spawn order.

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use log::debug;
use std::thread::JoinHandle;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Join handle of a spawned job.
pub struct Task<T> {
    rx: Receiver<T>,
}

impl<T> Task<T> {
    /// Blocks until the job finishes and returns its output.
    pub fn wait(self) -> T {
        self.rx
            .recv()
            .expect("task worker dropped its result channel")
    }

    pub fn is_finished(&self) -> bool {
        !self.rx.is_empty()
    }
}

pub struct TaskSystem {
    injector: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl TaskSystem {
    pub fn new(thread_count: usize) -> TaskSystem {
        let (injector, jobs) = unbounded::<Job>();
        let workers = (0..thread_count.max(1))
            .map(|i| {
                let jobs: Receiver<Job> = jobs.clone();
                std::thread::Builder::new()
                    .name(format!("task-worker-{}", i))
                    .spawn(move || {
                        while let Ok(job) = jobs.recv() {
                            job();
                        }
                    })
                    .expect("failed to spawn task worker")
            })
            .collect();
        TaskSystem {
            injector: Some(injector),
            workers,
        }
    }

    pub fn spawn<T, F>(&self, f: F) -> Task<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let (tx, rx) = bounded(1);
        let job: Job = Box::new(move || {
            // the join handle may have been dropped, which is fine
            let _ = tx.send(f());
        });
        self.injector
            .as_ref()
            .expect("task system is shut down")
            .send(job)
            .expect("task workers are gone");
        Task { rx }
    }
}

impl Drop for TaskSystem {
    fn drop(&mut self) {
        // closing the channel drains the queue and stops the workers
        self.injector.take();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
        debug!("task system stopped");
    }
}
