//! Fixed-size worker fan-out used by the sync passes.
//!
//! `WorkerManager` runs exactly N workers draining a shared input channel.
//! The process function consumes items and may emit results; when a result
//! callback is installed, a single consumer thread invokes it serially for
//! every emitted result. `wait` closes the input channel, joins the workers,
//! closes the result channel and drains the callback.
//!
//! Every item successfully added is seen by exactly one worker, and every
//! result emitted before the input close reaches the callback.
//!
//! # Example
//!
//! ```
//! use pkgrelay_pool::WorkerManager;
//! use std::sync::Arc;
//! use std::sync::atomic::{AtomicUsize, Ordering};
//!
//! let mut pool = WorkerManager::new(4, |_id, input: crossbeam::channel::Receiver<usize>, output| {
//!     for item in input {
//!         let _ = output.send(item * 2);
//!     }
//! });
//!
//! let total = Arc::new(AtomicUsize::new(0));
//! let sum = Arc::clone(&total);
//! pool.result_callback(move |n: usize| {
//!     sum.fetch_add(n, Ordering::SeqCst);
//! });
//!
//! pool.start();
//! for i in 1..=10 {
//!     pool.add(i).expect("add");
//! }
//! pool.wait();
//!
//! assert_eq!(total.load(Ordering::SeqCst), 110);
//! ```

use std::sync::Arc;
use std::thread::JoinHandle;

use anyhow::{Result, bail};
use crossbeam::channel::{Receiver, Sender, unbounded};

type ProcessFn<T, R> = Arc<dyn Fn(usize, Receiver<T>, Sender<R>) + Send + Sync>;

/// A fan-out of N cooperating workers over a shared input channel.
pub struct WorkerManager<T, R> {
    count: usize,
    process: ProcessFn<T, R>,
    input_tx: Option<Sender<T>>,
    input_rx: Receiver<T>,
    result_tx: Option<Sender<R>>,
    result_rx: Option<Receiver<R>>,
    callback: Option<Box<dyn FnMut(R) + Send>>,
    workers: Vec<JoinHandle<()>>,
    consumer: Option<JoinHandle<()>>,
}

impl<T, R> WorkerManager<T, R>
where
    T: Send + 'static,
    R: Send + 'static,
{
    /// Create a pool of `count` workers running `process`. The process
    /// function drains its receiver until the input channel closes.
    pub fn new(
        count: usize,
        process: impl Fn(usize, Receiver<T>, Sender<R>) + Send + Sync + 'static,
    ) -> Self {
        let (input_tx, input_rx) = unbounded();
        let (result_tx, result_rx) = unbounded();
        Self {
            count,
            process: Arc::new(process),
            input_tx: Some(input_tx),
            input_rx,
            result_tx: Some(result_tx),
            result_rx: Some(result_rx),
            callback: None,
            workers: Vec::new(),
            consumer: None,
        }
    }

    /// Install the single serial consumer for emitted results. Must be
    /// called before `start`.
    pub fn result_callback(&mut self, callback: impl FnMut(R) + Send + 'static) {
        self.callback = Some(Box::new(callback));
    }

    /// Launch the workers (and the result consumer, when installed).
    pub fn start(&mut self) {
        for id in 0..self.count {
            let process = Arc::clone(&self.process);
            let input = self.input_rx.clone();
            let output = self
                .result_tx
                .clone()
                .unwrap_or_else(|| unbounded().0);
            self.workers
                .push(std::thread::spawn(move || process(id, input, output)));
        }

        if let Some(mut callback) = self.callback.take()
            && let Some(results) = self.result_rx.take()
        {
            self.consumer = Some(std::thread::spawn(move || {
                for result in results {
                    callback(result);
                }
            }));
        }
    }

    /// Queue one item for the workers. Fails after `wait` has closed the
    /// input channel.
    pub fn add(&self, item: T) -> Result<()> {
        match &self.input_tx {
            Some(tx) => {
                if tx.send(item).is_err() {
                    bail!("worker pool input channel closed");
                }
                Ok(())
            }
            None => bail!("worker pool is draining"),
        }
    }

    /// Close the input channel, join every worker, close the result channel
    /// and drain the callback consumer.
    pub fn wait(&mut self) {
        self.input_tx.take();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
        self.result_tx.take();
        if let Some(consumer) = self.consumer.take() {
            let _ = consumer.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn every_item_is_processed_exactly_once() {
        let seen = Arc::new(Mutex::new(BTreeSet::new()));
        let mut pool = WorkerManager::new(8, |_id, input: Receiver<u32>, output| {
            for item in input {
                let _ = output.send(item);
            }
        });

        let sink = Arc::clone(&seen);
        pool.result_callback(move |n| {
            assert!(sink.lock().expect("lock").insert(n), "duplicate result {n}");
        });
        pool.start();

        for i in 0..200u32 {
            pool.add(i).expect("add");
        }
        pool.wait();

        assert_eq!(seen.lock().expect("lock").len(), 200);
    }

    #[test]
    fn workers_run_in_parallel_with_distinct_ids() {
        let ids = Arc::new(Mutex::new(BTreeSet::new()));
        let ids_in_worker = Arc::clone(&ids);
        let mut pool = WorkerManager::new(3, move |id, input: Receiver<()>, _output: Sender<()>| {
            ids_in_worker.lock().expect("lock").insert(id);
            for _item in input {}
        });
        pool.start();
        pool.wait();

        assert_eq!(
            ids.lock().expect("lock").iter().copied().collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
    }

    #[test]
    fn pool_without_callback_still_drains() {
        let processed = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&processed);
        let mut pool = WorkerManager::new(2, move |_id, input: Receiver<u8>, _output: Sender<u8>| {
            for _item in input {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });
        pool.start();
        for _ in 0..10 {
            pool.add(0).expect("add");
        }
        pool.wait();
        assert_eq!(processed.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn add_after_wait_fails() {
        let mut pool = WorkerManager::new(1, |_id, input: Receiver<u8>, _output: Sender<u8>| {
            for _item in input {}
        });
        pool.start();
        pool.wait();
        assert!(pool.add(1).is_err());
    }

    #[test]
    fn results_are_consumed_serially() {
        // the callback is a single consumer: no interleaving is observable
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&log);
        let mut pool = WorkerManager::new(4, |_id, input: Receiver<u32>, output| {
            for item in input {
                let _ = output.send(item);
            }
        });
        pool.result_callback(move |n| {
            sink.lock().expect("lock").push(n);
        });
        pool.start();
        for i in 0..50 {
            pool.add(i).expect("add");
        }
        pool.wait();
        assert_eq!(log.lock().expect("lock").len(), 50);
    }
}
