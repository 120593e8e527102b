//! # Consumer
//!
//! Runs `worker_num` tasks that each pull from a [`QueueReceiver`] and hand
//! every item to a user handler until the queue reports end-of-stream.

use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use tokio::task::JoinHandle;

use super::queue::QueueReceiver;

/// # Consumer
///
/// A fixed-size set of worker tasks sharing one handler. Handler panics are not
/// caught by the workers; `stop_consuming` re-raises the first one it joins.
pub struct Consumer<T, F> {
    handler: Arc<F>,
    worker_num: usize,
    workers: Vec<JoinHandle<()>>,
    _item: PhantomData<fn(T)>,
}

impl<T, F, Fut> Consumer<T, F>
where
    T: Send + 'static,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    /// Creates a consumer. A `worker_num` of zero is treated as one.
    pub fn new(handler: F, worker_num: usize) -> Self {
        Self {
            handler: Arc::new(handler),
            worker_num: worker_num.max(1),
            workers: Vec::new(),
            _item: PhantomData,
        }
    }

    /// Number of worker tasks started per `start_consuming` call.
    pub fn worker_num(&self) -> usize {
        self.worker_num
    }

    /// Spawns the worker tasks.
    pub fn start_consuming(&mut self, queue: QueueReceiver<T>) {
        for id in 0..self.worker_num {
            let queue = queue.clone();
            let handler = Arc::clone(&self.handler);
            self.workers.push(tokio::spawn(async move {
                while let Some(item) = queue.recv().await {
                    handler(item).await;
                }
                log::debug!("consumer worker {} finished", id);
            }));
        }
    }

    /// Waits for every worker to exit. The queue must already be closing,
    /// otherwise the workers never see end-of-stream.
    pub async fn stop_consuming(&mut self) {
        let mut panic = None;
        for worker in self.workers.drain(..) {
            if let Err(e) = worker.await {
                if e.is_panic() && panic.is_none() {
                    panic = Some(e.into_panic());
                } else if !e.is_panic() {
                    log::warn!("consumer worker was cancelled: {}", e);
                }
            }
        }
        if let Some(payload) = panic {
            std::panic::resume_unwind(payload);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::HandoffQueue;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::time::timeout;

    const GUARD: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn zero_workers_means_one() {
        let consumer = Consumer::new(|_: u8| async {}, 0);
        assert_eq!(consumer.worker_num(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn every_item_handled_once_across_workers() {
        let handled = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&handled);
        let mut consumer = Consumer::new(
            move |n: usize| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(n, Ordering::SeqCst);
                }
            },
            4,
        );

        let queue = HandoffQueue::new();
        consumer.start_consuming(queue.get());
        for n in 1..=100 {
            queue.put(n).unwrap();
        }
        timeout(GUARD, queue.close()).await.unwrap();
        timeout(GUARD, consumer.stop_consuming()).await.unwrap();

        assert_eq!(handled.load(Ordering::SeqCst), 5050);
    }

    #[tokio::test]
    async fn single_worker_preserves_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let mut consumer = Consumer::new(
            move |s: &'static str| {
                let sink = Arc::clone(&sink);
                async move { sink.lock().unwrap().push(s) }
            },
            1,
        );

        let queue = HandoffQueue::new();
        for s in ["a", "b", "c"] {
            queue.put(s).unwrap();
        }
        consumer.start_consuming(queue.get());
        timeout(GUARD, queue.close()).await.unwrap();
        timeout(GUARD, consumer.stop_consuming()).await.unwrap();

        assert_eq!(*seen.lock().unwrap(), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    #[should_panic(expected = "bad item")]
    async fn handler_panic_reaches_the_caller() {
        let mut consumer = Consumer::new(
            |n: u8| async move {
                if n == 2 {
                    panic!("bad item");
                }
            },
            1,
        );
        let queue = HandoffQueue::new();
        consumer.start_consuming(queue.get());
        queue.put(1).unwrap();
        queue.put(2).unwrap();

        consumer.stop_consuming().await;
    }
}
