//! Execution contexts for work handed off by packet handlers.
//!
//! Each context is a FIFO job queue. In a running server a dedicated thread
//! drains it; tests drain it synchronously with [`ExecutionQueue::run_pending`].
//! Jobs submitted through one queue always run in submission order.

use crate::error::ServerError;
use log::{debug, warn};
use parking_lot::Mutex;
use std::thread::JoinHandle;
use tokio::sync::mpsc;

type Job = Box<dyn FnOnce() + Send + 'static>;

pub struct ExecutionQueue {
    name: &'static str,
    tx: mpsc::UnboundedSender<Job>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<Job>>>,
}

impl ExecutionQueue {
    pub fn new(name: &'static str) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            name,
            tx,
            rx: Mutex::new(Some(rx)),
        }
    }

    /// Queues `job` for later execution. Fire-and-forget.
    pub fn submit<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.tx.send(Box::new(job)).is_err() {
            warn!("{} context is gone, job discarded", self.name);
        }
    }

    /// Moves the queue onto a dedicated thread that runs jobs until every
    /// sender is dropped.
    pub fn spawn_worker(&self) -> Result<Option<JoinHandle<()>>, ServerError> {
        let Some(mut rx) = self.rx.lock().take() else {
            return Ok(None);
        };

        let name = self.name;
        let handle = std::thread::Builder::new()
            .name(format!("{}-context", name))
            .spawn(move || {
                debug!("{} context started", name);
                while let Some(job) = rx.blocking_recv() {
                    job();
                }
                debug!("{} context stopped", name);
            })?;

        Ok(Some(handle))
    }

    /// Runs every queued job on the calling thread, including jobs queued by
    /// the jobs themselves. Returns how many ran; zero once a worker owns the
    /// queue.
    pub fn run_pending(&self) -> usize {
        let mut ran = 0;
        loop {
            let job = match self.rx.lock().as_mut() {
                Some(rx) => rx.try_recv().ok(),
                None => None,
            };

            match job {
                Some(job) => {
                    job();
                    ran += 1;
                }
                None => return ran,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_run_pending_preserves_order() {
        let queue = ExecutionQueue::new("main");
        let seen = Arc::new(Mutex::new(Vec::new()));

        for i in 0..5 {
            let seen = Arc::clone(&seen);
            queue.submit(move || seen.lock().push(i));
        }

        assert_eq!(queue.run_pending(), 5);
        assert_eq!(*seen.lock(), vec![0, 1, 2, 3, 4]);
        assert_eq!(queue.run_pending(), 0);
    }

    #[test]
    fn test_jobs_may_submit_more_jobs() {
        let queue = Arc::new(ExecutionQueue::new("sync"));
        let seen = Arc::new(Mutex::new(Vec::new()));

        {
            let inner_queue = Arc::clone(&queue);
            let seen = Arc::clone(&seen);
            queue.submit(move || {
                seen.lock().push("outer");
                let seen = Arc::clone(&seen);
                inner_queue.submit(move || seen.lock().push("inner"));
            });
        }

        assert_eq!(queue.run_pending(), 2);
        assert_eq!(*seen.lock(), vec!["outer", "inner"]);
    }

    #[test]
    fn test_worker_thread_drains_queue() {
        let queue = ExecutionQueue::new("main");
        let (done_tx, done_rx) = std::sync::mpsc::channel();

        let handle = queue.spawn_worker().unwrap();
        assert!(handle.is_some());
        assert!(queue.spawn_worker().unwrap().is_none());

        for i in 0..3 {
            let done_tx = done_tx.clone();
            queue.submit(move || done_tx.send(i).unwrap());
        }

        let received: Vec<i32> = (0..3)
            .map(|_| done_rx.recv_timeout(std::time::Duration::from_secs(5)).unwrap())
            .collect();
        assert_eq!(received, vec![0, 1, 2]);
        assert_eq!(queue.run_pending(), 0);
    }
}
