//! # Handoff Queue
//!
//! An unbounded FIFO between any number of producers and consumers.
//!
//! One coordinator task owns both the overflow buffer and the list of
//! consumers currently waiting for an item. Handles talk to it over a single
//! command channel, so there is no lock around the buffer:
//!
//! - `put` with consumers waiting hands the item to the oldest waiter and never
//!   touches the buffer.
//! - `put` with nobody waiting appends to the buffer.
//! - a consumer asking for an item gets the buffer head, or is parked as a
//!   waiter when the buffer is empty.
//! - a consumer that gives up on `recv` after an item was already handed to it
//!   sends the item back, and it returns to the head of the buffer.
//! - after `close` the coordinator keeps serving consumers until the buffer is
//!   empty and every handed-over item was taken, then exits. Every parked or
//!   later consumer then sees end-of-stream.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use super::WorkerError;

enum QueueCommand<T> {
    Put(T),
    Take(oneshot::Sender<T>),
    Taken,
    Requeue(T),
    Pending(oneshot::Sender<usize>),
    Close,
}

/// # Handoff Queue
///
/// Producer-side handle. Clones share the same queue.
pub struct HandoffQueue<T> {
    commands: mpsc::UnboundedSender<QueueCommand<T>>,
    closed: Arc<AtomicBool>,
    done: CancellationToken,
}

impl<T> Clone for HandoffQueue<T> {
    fn clone(&self) -> Self {
        Self {
            commands: self.commands.clone(),
            closed: Arc::clone(&self.closed),
            done: self.done.clone(),
        }
    }
}

impl<T> fmt::Debug for HandoffQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandoffQueue")
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .field("drained", &self.done.is_cancelled())
            .finish()
    }
}

impl<T: Send + 'static> Default for HandoffQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + 'static> HandoffQueue<T> {
    /// Creates an empty queue and spawns its coordinator.
    ///
    /// Must be called inside a tokio runtime.
    pub fn new() -> Self {
        let (commands, receiver) = mpsc::unbounded_channel();
        let done = CancellationToken::new();

        let coordinator = Coordinator {
            buffer: VecDeque::new(),
            waiters: VecDeque::new(),
            in_flight: 0,
            closing: false,
        };
        tokio::spawn(coordinator.run(receiver, done.clone()));

        Self {
            commands,
            closed: Arc::new(AtomicBool::new(false)),
            done,
        }
    }

    /// Submits one item. Fails only once the queue has been closed.
    pub fn put(&self, item: T) -> Result<(), WorkerError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(WorkerError::QueueClosed);
        }
        self.commands
            .send(QueueCommand::Put(item))
            .map_err(|_| WorkerError::QueueClosed)
    }

    /// A consumer endpoint yielding items in submission order.
    pub fn get(&self) -> QueueReceiver<T> {
        QueueReceiver {
            commands: self.commands.clone(),
        }
    }

    /// Number of buffered items, excluding any item already handed to a consumer.
    pub async fn pending(&self) -> usize {
        let (reply, len) = oneshot::channel();
        if self.commands.send(QueueCommand::Pending(reply)).is_err() {
            return 0;
        }
        len.await.unwrap_or(0)
    }

    /// Stops accepting items and waits until every buffered item was taken by
    /// a consumer and the coordinator has exited.
    ///
    /// Buffered items are only released through consumers, so without one this
    /// waits until one shows up.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let _ = self.commands.send(QueueCommand::Close);
        self.done.cancelled().await;
    }

    /// Whether `close` has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// # Queue Receiver
///
/// Consumer-side endpoint of a [`HandoffQueue`]. Clones compete for items.
pub struct QueueReceiver<T> {
    commands: mpsc::UnboundedSender<QueueCommand<T>>,
}

impl<T> Clone for QueueReceiver<T> {
    fn clone(&self) -> Self {
        Self {
            commands: self.commands.clone(),
        }
    }
}

impl<T> fmt::Debug for QueueReceiver<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueReceiver").finish_non_exhaustive()
    }
}

impl<T: Send + 'static> QueueReceiver<T> {
    /// Waits for the next item. `None` means the queue is closed and drained.
    ///
    /// Cancel-safe: dropping the future puts an item that was already handed
    /// to it back at the head of the queue.
    pub async fn recv(&self) -> Option<T> {
        let (reply, item) = oneshot::channel();
        self.commands.send(QueueCommand::Take(reply)).ok()?;

        let mut handoff = Handoff {
            reply: item,
            commands: self.commands.clone(),
        };
        let item = (&mut handoff.reply).await.ok()?;
        let _ = self.commands.send(QueueCommand::Taken);
        Some(item)
    }
}

/// An outstanding `Take` request. Returns an unclaimed item on drop.
struct Handoff<T> {
    reply: oneshot::Receiver<T>,
    commands: mpsc::UnboundedSender<QueueCommand<T>>,
}

impl<T> Drop for Handoff<T> {
    fn drop(&mut self) {
        self.reply.close();
        if let Ok(item) = self.reply.try_recv() {
            let _ = self.commands.send(QueueCommand::Requeue(item));
        }
    }
}

struct Coordinator<T> {
    buffer: VecDeque<T>,
    waiters: VecDeque<oneshot::Sender<T>>,
    /// Items sent to a consumer that has not confirmed or returned them yet.
    in_flight: usize,
    closing: bool,
}

impl<T: Send + 'static> Coordinator<T> {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<QueueCommand<T>>,
        done: CancellationToken,
    ) {
        let _done = done.drop_guard();

        while let Some(command) = commands.recv().await {
            match command {
                QueueCommand::Put(item) if self.closing => {
                    drop(item);
                    log::warn!("handoff queue: dropped an item submitted after close");
                }
                QueueCommand::Put(item) => self.accept(item),
                QueueCommand::Take(waiter) => self.serve(waiter),
                QueueCommand::Taken => self.in_flight -= 1,
                QueueCommand::Requeue(item) => {
                    self.in_flight -= 1;
                    self.requeue(item);
                }
                QueueCommand::Pending(reply) => {
                    let _ = reply.send(self.buffer.len());
                }
                QueueCommand::Close => self.closing = true,
            }

            if self.closing && self.buffer.is_empty() && self.in_flight == 0 {
                break;
            }
        }

        // Parked consumers observe end-of-stream when their senders drop here.
        log::debug!(
            "handoff queue: coordinator exiting, {} consumer(s) released",
            self.waiters.len()
        );
    }

    fn accept(&mut self, item: T) {
        if let Some(item) = self.hand_to_waiter(item) {
            self.buffer.push_back(item);
        }
    }

    fn requeue(&mut self, item: T) {
        if let Some(item) = self.hand_to_waiter(item) {
            self.buffer.push_front(item);
        }
    }

    /// Gives `item` to the oldest live waiter, or returns it when the buffer
    /// still holds older items or nobody is waiting.
    fn hand_to_waiter(&mut self, mut item: T) -> Option<T> {
        if !self.buffer.is_empty() {
            return Some(item);
        }
        while let Some(waiter) = self.waiters.pop_front() {
            match waiter.send(item) {
                Ok(()) => {
                    self.in_flight += 1;
                    return None;
                }
                Err(returned) => item = returned,
            }
        }
        Some(item)
    }

    fn serve(&mut self, waiter: oneshot::Sender<T>) {
        match self.buffer.pop_front() {
            Some(item) => match waiter.send(item) {
                Ok(()) => self.in_flight += 1,
                Err(item) => self.buffer.push_front(item),
            },
            None => self.waiters.push_back(waiter),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    const GUARD: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn pending_counts_items_without_consumer() {
        let queue = HandoffQueue::new();
        for i in 0..5 {
            queue.put(i).unwrap();
        }
        assert_eq!(queue.pending().await, 5);

        let rx = queue.get();
        assert_eq!(rx.recv().await, Some(0));
        assert_eq!(queue.pending().await, 4);
    }

    #[tokio::test]
    async fn single_consumer_sees_submission_order() {
        let queue = HandoffQueue::new();
        let input: Vec<u32> = (0..200).collect();

        let rx = queue.get();
        let reader = tokio::spawn(async move {
            let mut seen = Vec::new();
            while let Some(item) = rx.recv().await {
                seen.push(item);
            }
            seen
        });

        for item in &input {
            queue.put(*item).unwrap();
        }
        timeout(GUARD, queue.close()).await.unwrap();

        let seen = timeout(GUARD, reader).await.unwrap().unwrap();
        assert_eq!(seen, input);
    }

    #[tokio::test]
    async fn waiting_consumer_bypasses_buffer() {
        let queue = HandoffQueue::new();
        let rx = queue.get();
        let waiting = tokio::spawn(async move { rx.recv().await });

        // Let the consumer park itself, then round-trip through the coordinator
        // so its request is known to be processed.
        tokio::task::yield_now().await;
        assert_eq!(queue.pending().await, 0);

        queue.put("direct").unwrap();
        assert_eq!(queue.pending().await, 0);

        assert_eq!(timeout(GUARD, waiting).await.unwrap().unwrap(), Some("direct"));
        assert_eq!(queue.pending().await, 0);
    }

    #[tokio::test]
    async fn close_drains_buffer_before_end_of_stream() {
        let queue = HandoffQueue::new();
        for i in 1..=3 {
            queue.put(i).unwrap();
        }

        let closer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.close().await })
        };

        let rx = queue.get();
        let mut drained = Vec::new();
        while let Some(item) = timeout(GUARD, rx.recv()).await.unwrap() {
            drained.push(item);
        }
        assert_eq!(drained, vec![1, 2, 3]);

        timeout(GUARD, closer).await.unwrap().unwrap();
        assert_eq!(queue.put(4), Err(WorkerError::QueueClosed));
        assert!(queue.is_closed());
        assert_eq!(rx.recv().await, None);
        assert_eq!(queue.pending().await, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn competing_consumers_each_item_delivered_once() {
        let queue = HandoffQueue::new();
        let mut readers = Vec::new();
        for _ in 0..4 {
            let rx = queue.get();
            readers.push(tokio::spawn(async move {
                let mut seen = Vec::new();
                while let Some(item) = rx.recv().await {
                    seen.push(item);
                }
                seen
            }));
        }

        for i in 0..1000u32 {
            queue.put(i).unwrap();
        }
        timeout(GUARD, queue.close()).await.unwrap();

        let mut all = Vec::new();
        for reader in readers {
            let seen = timeout(GUARD, reader).await.unwrap().unwrap();
            // Each consumer still sees its share in submission order.
            assert!(seen.windows(2).all(|w| w[0] < w[1]));
            all.extend(seen);
        }
        all.sort_unstable();
        assert_eq!(all, (0..1000).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn cancelled_recv_returns_its_item() {
        let queue = HandoffQueue::new();
        let rx = queue.get();

        // Poll once so the request is parked at the coordinator.
        let mut recv = Box::pin(rx.recv());
        tokio::select! {
            biased;
            _ = &mut recv => panic!("nothing was queued yet"),
            _ = std::future::ready(()) => {}
        }
        assert_eq!(queue.pending().await, 0);

        // Handed straight to the parked request, then abandoned.
        queue.put(42).unwrap();
        assert_eq!(queue.pending().await, 0);
        drop(recv);
        assert_eq!(queue.pending().await, 1);

        let closer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.close().await })
        };
        assert_eq!(timeout(GUARD, rx.recv()).await.unwrap(), Some(42));
        timeout(GUARD, closer).await.unwrap().unwrap();
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn recv_under_timeout_loses_nothing() {
        let queue = HandoffQueue::new();
        let rx = queue.get();

        assert!(timeout(Duration::from_millis(10), rx.recv()).await.is_err());
        for i in 0..3 {
            queue.put(i).unwrap();
        }

        let mut seen = Vec::new();
        while seen.len() < 3 {
            if let Ok(Some(item)) = timeout(Duration::from_millis(10), rx.recv()).await {
                seen.push(item);
            }
        }
        assert_eq!(seen, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn close_releases_parked_consumers() {
        let queue: HandoffQueue<u8> = HandoffQueue::new();
        let rx = queue.get();
        let parked = tokio::spawn(async move { rx.recv().await });
        tokio::task::yield_now().await;

        timeout(GUARD, queue.close()).await.unwrap();
        assert_eq!(timeout(GUARD, parked).await.unwrap().unwrap(), None);
    }
}
