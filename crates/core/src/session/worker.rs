//! A named sequential worker thread.
//!
//! Jobs run one at a time in the order they were posted; delayed jobs run
//! once their deadline passes. Session operations and callback delivery
//! both go through one of these.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::error::{Result, RtspError};

type Job = Box<dyn FnOnce() + Send>;

enum Message {
    Run(Job),
    At(Instant, Job),
    Quit,
}

struct Delayed {
    deadline: Instant,
    seq: u64,
    job: Job,
}

impl PartialEq for Delayed {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for Delayed {}

impl PartialOrd for Delayed {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

// Reversed so the max-heap pops the earliest deadline first.
impl Ord for Delayed {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

pub struct Worker {
    name: String,
    tx: Sender<Message>,
    thread: ThreadId,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Worker {
    pub fn spawn(name: &str) -> Result<Self> {
        let (tx, rx) = mpsc::channel();
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || Self::run(rx))?;
        Ok(Self {
            name: name.to_string(),
            tx,
            thread: handle.thread().id(),
            handle: Mutex::new(Some(handle)),
        })
    }

    fn run(rx: Receiver<Message>) {
        let mut timers: BinaryHeap<Delayed> = BinaryHeap::new();
        let mut seq = 0u64;
        loop {
            let now = Instant::now();
            while timers.peek().is_some_and(|t| t.deadline <= now) {
                if let Some(t) = timers.pop() {
                    (t.job)();
                }
            }

            let message = match timers.peek() {
                Some(t) => match rx.recv_timeout(t.deadline.saturating_duration_since(Instant::now())) {
                    Ok(m) => m,
                    Err(RecvTimeoutError::Timeout) => continue,
                    Err(RecvTimeoutError::Disconnected) => return,
                },
                None => match rx.recv() {
                    Ok(m) => m,
                    Err(_) => return,
                },
            };

            match message {
                Message::Run(job) => job(),
                Message::At(deadline, job) => {
                    seq += 1;
                    timers.push(Delayed { deadline, seq, job });
                }
                Message::Quit => return,
            }
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_current(&self) -> bool {
        thread::current().id() == self.thread
    }

    /// Queue a job. Ignored once the worker has quit.
    pub fn post(&self, job: impl FnOnce() + Send + 'static) {
        if self.tx.send(Message::Run(Box::new(job))).is_err() {
            tracing::trace!(worker = %self.name, "job posted after quit");
        }
    }

    pub fn post_delayed(&self, delay: Duration, job: impl FnOnce() + Send + 'static) {
        let deadline = Instant::now() + delay;
        if self.tx.send(Message::At(deadline, Box::new(job))).is_err() {
            tracing::trace!(worker = %self.name, "delayed job posted after quit");
        }
    }

    /// Run `job` on the worker and wait for its result. Called from the
    /// worker itself, the job runs inline.
    pub fn run_sync<T: Send + 'static>(&self, job: impl FnOnce() -> T + Send + 'static) -> Result<T> {
        if self.is_current() {
            return Ok(job());
        }
        let (done_tx, done_rx) = mpsc::sync_channel(1);
        self.tx
            .send(Message::Run(Box::new(move || {
                let _ = done_tx.send(job());
            })))
            .map_err(|_| RtspError::InvalidState("worker has quit"))?;
        done_rx
            .recv()
            .map_err(|_| RtspError::InvalidState("worker has quit"))
    }

    /// Stop after the job currently running. Pending jobs are dropped.
    pub fn quit(&self) {
        let _ = self.tx.send(Message::Quit);
        if self.is_current() {
            return;
        }
        if let Some(handle) = self.handle.lock().take()
            && handle.join().is_err()
        {
            tracing::error!(worker = %self.name, "worker thread panicked");
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.quit();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn jobs_run_in_order() {
        let worker = Worker::spawn("test-order").unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for i in 0..5 {
            let seen = seen.clone();
            worker.post(move || seen.lock().push(i));
        }
        worker.run_sync(|| ()).unwrap();
        assert_eq!(*seen.lock(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn delayed_jobs_wait_for_their_deadline() {
        let worker = Worker::spawn("test-delay").unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (a, b) = (seen.clone(), seen.clone());
        worker.post_delayed(Duration::from_millis(80), move || a.lock().push("late"));
        worker.post_delayed(Duration::from_millis(10), move || b.lock().push("early"));
        worker.run_sync(|| ()).unwrap();
        assert!(seen.lock().is_empty(), "nothing due yet");

        thread::sleep(Duration::from_millis(200));
        assert_eq!(*seen.lock(), vec!["early", "late"]);
    }

    #[test]
    fn run_sync_inline_on_worker() {
        let worker = Arc::new(Worker::spawn("test-inline").unwrap());
        let inner = worker.clone();
        let nested = worker.run_sync(move || inner.run_sync(|| 7).unwrap()).unwrap();
        assert_eq!(nested, 7);
    }

    #[test]
    fn quit_rejects_sync_jobs() {
        let worker = Worker::spawn("test-quit").unwrap();
        worker.quit();
        assert!(worker.run_sync(|| ()).is_err());
    }
}
