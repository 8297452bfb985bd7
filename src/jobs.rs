//! Background work queues used for reloads and deferred rebuilds.

use std::{
    collections::VecDeque,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{Arc, Condvar, Mutex},
    thread::{self, JoinHandle},
};

/// A unit of background work.
pub trait Job: Send + 'static {
    fn run(self: Box<Self>);

    /// Called instead of [`Job::run`] when the job is dropped from the queue unexecuted.
    fn cancel(self: Box<Self>) {}
}

pub trait JobQueue: Send + Sync {
    fn name(&self) -> &str;

    fn submit(&self, job: Box<dyn Job>);

    /// Cancels every queued job and waits until the ones already running have finished.
    fn stop_pending_jobs(&self);
}

#[derive(Default)]
struct QueueState {
    queue: VecDeque<Box<dyn Job>>,
    running: usize,
    shutdown: bool,
}

#[derive(Default)]
struct Shared {
    state: Mutex<QueueState>,
    job_ready: Condvar,
    idle: Condvar,
}

/// A fixed set of named worker threads pulling from one queue.
pub struct WorkerPool {
    name: String,
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(name: &str, worker_count: usize) -> anyhow::Result<Self> {
        let shared = Arc::new(Shared::default());
        let workers = (0..worker_count.max(1))
            .map(|i| {
                let shared = shared.clone();
                thread::Builder::new()
                    .name(format!("{name}#{i}"))
                    .spawn(move || worker_loop(&shared))
            })
            .collect::<Result<Vec<_>, _>>()?;
        log::debug!("started job manager {name} with {} workers", workers.len());
        Ok(WorkerPool {
            name: name.to_owned(),
            shared,
            workers,
        })
    }

    /// Blocks until the queue is empty and no job is running.
    pub fn wait_idle(&self) {
        let mut state = self.shared.state.lock().unwrap();
        while state.running > 0 || !state.queue.is_empty() {
            state = self.shared.idle.wait(state).unwrap();
        }
    }
}

fn worker_loop(shared: &Shared) {
    loop {
        let job = {
            let mut state = shared.state.lock().unwrap();
            loop {
                if let Some(job) = state.queue.pop_front() {
                    state.running += 1;
                    break job;
                }
                if state.shutdown {
                    return;
                }
                state = shared.job_ready.wait(state).unwrap();
            }
        };

        if catch_unwind(AssertUnwindSafe(|| job.run())).is_err() {
            log::error!(
                "job panicked on {}",
                thread::current().name().unwrap_or("<unnamed>")
            );
        }

        let mut state = shared.state.lock().unwrap();
        state.running -= 1;
        if state.running == 0 {
            shared.idle.notify_all();
        }
    }
}

impl JobQueue for WorkerPool {
    fn name(&self) -> &str {
        &self.name
    }

    fn submit(&self, job: Box<dyn Job>) {
        self.shared.state.lock().unwrap().queue.push_back(job);
        self.shared.job_ready.notify_one();
    }

    fn stop_pending_jobs(&self) {
        let cancelled: Vec<_> = self.shared.state.lock().unwrap().queue.drain(..).collect();
        if !cancelled.is_empty() {
            log::debug!("{}: cancelled {} pending jobs", self.name, cancelled.len());
        }
        cancelled.into_iter().for_each(|job| job.cancel());

        let mut state = self.shared.state.lock().unwrap();
        while state.running > 0 {
            state = self.shared.idle.wait(state).unwrap();
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.stop_pending_jobs();
        self.shared.state.lock().unwrap().shutdown = true;
        self.shared.job_ready.notify_all();
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                log::error!("{}: worker thread panicked", self.name);
            }
        }
    }
}

/// A queue whose jobs only run when the owner calls [`ManualJobQueue::run_pending`].
#[derive(Default)]
pub struct ManualJobQueue {
    name: String,
    queue: Mutex<VecDeque<Box<dyn Job>>>,
}

impl ManualJobQueue {
    pub fn new(name: &str) -> Self {
        ManualJobQueue {
            name: name.to_owned(),
            queue: Default::default(),
        }
    }

    pub fn pending(&self) -> usize {
        self.queue.lock().unwrap().len()
    }

    /// Runs every queued job on the calling thread, including jobs queued while running. Returns
    /// the number of jobs executed.
    pub fn run_pending(&self) -> usize {
        let mut count = 0;
        loop {
            let job = self.queue.lock().unwrap().pop_front();
            match job {
                Some(job) => {
                    job.run();
                    count += 1;
                }
                None => return count,
            }
        }
    }
}

impl JobQueue for ManualJobQueue {
    fn name(&self) -> &str {
        &self.name
    }

    fn submit(&self, job: Box<dyn Job>) {
        self.queue.lock().unwrap().push_back(job);
    }

    fn stop_pending_jobs(&self) {
        let cancelled: Vec<_> = self.queue.lock().unwrap().drain(..).collect();
        cancelled.into_iter().for_each(|job| job.cancel());
    }
}
