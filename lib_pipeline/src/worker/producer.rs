//! # Producer
//!
//! A [`Producer`] runs a pluggable [`ProducerHandler`] that emits items into a
//! one-slot relay channel. A forwarding task drains the relay into the
//! [`HandoffQueue`] until the relay is closed.
//!
//! [`IntervalProducerHandler`] is the stock handler: it calls a fetch function
//! every `interval` on a [`Clock`] and emits whatever that returns.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::queue::HandoffQueue;
use crate::utils::{Clock, RealClock};

/// A data source feeding a [`Producer`].
pub trait ProducerHandler<T>: Send + 'static {
    /// Starts emitting items into `relay`. Must not block; long-running work
    /// belongs in a spawned task.
    fn start(&mut self, relay: mpsc::Sender<T>);

    /// Stops emitting and resolves once no further item will be sent.
    fn stop(&mut self) -> impl Future<Output = ()> + Send;
}

/// # Producer
///
/// Forwards everything its handler emits into a queue. After
/// `stop_producing` the handler is released and the producer cannot be
/// restarted.
pub struct Producer<T, H> {
    handler: Option<H>,
    forwarder: Option<JoinHandle<()>>,
    relay_closed: CancellationToken,
    _item: std::marker::PhantomData<fn(T)>,
}

impl<T, H> fmt::Debug for Producer<T, H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Producer")
            .field("has_handler", &self.handler.is_some())
            .field("forwarding", &self.forwarder.is_some())
            .finish()
    }
}

impl<T, H> Producer<T, H>
where
    T: Send + 'static,
    H: ProducerHandler<T>,
{
    /// Wraps `handler`. Nothing runs until `start_producing`.
    pub fn new(handler: H) -> Self {
        Self {
            handler: Some(handler),
            forwarder: None,
            relay_closed: CancellationToken::new(),
            _item: std::marker::PhantomData,
        }
    }

    /// Starts the handler and the forwarding task.
    pub fn start_producing(&mut self, queue: HandoffQueue<T>) {
        let Some(handler) = self.handler.as_mut() else {
            log::warn!("producer: start_producing called after stop, ignoring");
            return;
        };

        let (relay, mut items) = mpsc::channel(1);
        handler.start(relay);

        let relay_closed = self.relay_closed.clone();
        self.forwarder = Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    item = items.recv() => match item {
                        Some(item) => forward(&queue, item),
                        None => return,
                    },
                    _ = relay_closed.cancelled() => break,
                }
            }

            // Whatever is still in the relay was emitted before the stop.
            items.close();
            while let Some(item) = items.recv().await {
                forward(&queue, item);
            }
        }));
    }

    /// Stops the handler, closes the relay, waits for the forwarder, then drops
    /// the handler.
    pub async fn stop_producing(&mut self) {
        if let Some(handler) = self.handler.as_mut() {
            handler.stop().await;
        }
        self.relay_closed.cancel();

        if let Some(forwarder) = self.forwarder.take() {
            if let Err(e) = forwarder.await {
                if e.is_panic() {
                    std::panic::resume_unwind(e.into_panic());
                }
            }
        }
        self.handler = None;
    }
}

fn forward<T: Send + 'static>(queue: &HandoffQueue<T>, item: T) {
    if let Err(e) = queue.put(item) {
        log::warn!("producer: dropping item: {}", e);
    }
}

/// # Interval Producer Handler
///
/// Calls `fetch` every `interval` and emits all returned items. The period is
/// measured from the end of one fetch to the next, so a slow fetch delays the
/// following one. With `enqueue_now` one fetch happens immediately on start.
pub struct IntervalProducerHandler<T, F> {
    fetch: Option<F>,
    interval: Duration,
    enqueue_now: bool,
    clock: Option<Arc<dyn Clock>>,
    shutdown: CancellationToken,
    task: Option<JoinHandle<()>>,
    _item: std::marker::PhantomData<fn() -> T>,
}

impl<T, F> fmt::Debug for IntervalProducerHandler<T, F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IntervalProducerHandler")
            .field("interval", &self.interval)
            .field("enqueue_now", &self.enqueue_now)
            .field("running", &self.task.is_some())
            .finish()
    }
}

impl<T, F> IntervalProducerHandler<T, F>
where
    T: Send + 'static,
    F: FnMut() -> Vec<T> + Send + 'static,
{
    /// Creates a handler driven by the real clock.
    pub fn new(fetch: F, interval: Duration, enqueue_now: bool) -> Self {
        Self {
            fetch: Some(fetch),
            interval,
            enqueue_now,
            clock: Some(Arc::new(RealClock::new())),
            shutdown: CancellationToken::new(),
            task: None,
            _item: std::marker::PhantomData,
        }
    }

    /// Replaces the clock the interval timer is taken from.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }
}

impl<T, F> ProducerHandler<T> for IntervalProducerHandler<T, F>
where
    T: Send + 'static,
    F: FnMut() -> Vec<T> + Send + 'static,
{
    fn start(&mut self, relay: mpsc::Sender<T>) {
        let (Some(mut fetch), Some(clock)) = (self.fetch.take(), self.clock.take()) else {
            log::warn!("interval producer: already started");
            return;
        };
        let interval = self.interval;
        let enqueue_now = self.enqueue_now;
        let shutdown = self.shutdown.clone();

        self.task = Some(tokio::spawn(async move {
            if enqueue_now && !emit(&relay, fetch()).await {
                return;
            }

            let mut timer = clock.timer(interval);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        timer.stop();
                        return;
                    }
                    _ = timer.fired() => {
                        if !emit(&relay, fetch()).await {
                            timer.stop();
                            return;
                        }
                        timer.reset(interval);
                    }
                }
            }
        }));
    }

    async fn stop(&mut self) {
        self.shutdown.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                if e.is_panic() {
                    std::panic::resume_unwind(e.into_panic());
                }
            }
        }
        self.fetch = None;
        self.clock = None;
    }
}

/// Sends every item; `false` once the relay is gone.
async fn emit<T>(relay: &mpsc::Sender<T>, items: Vec<T>) -> bool {
    for item in items {
        if relay.send(item).await.is_err() {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::FakeClock;
    use crate::worker::QueueReceiver;
    use tokio::time::timeout;

    const GUARD: Duration = Duration::from_secs(5);

    /// Emits a fixed list once, then stays idle until stopped.
    struct ListHandler {
        items: Vec<u32>,
        task: Option<JoinHandle<()>>,
    }

    impl ProducerHandler<u32> for ListHandler {
        fn start(&mut self, relay: mpsc::Sender<u32>) {
            let items = std::mem::take(&mut self.items);
            self.task = Some(tokio::spawn(async move {
                emit(&relay, items).await;
            }));
        }

        async fn stop(&mut self) {
            if let Some(task) = self.task.take() {
                let _ = task.await;
            }
        }
    }

    async fn collect(rx: QueueReceiver<u32>, n: usize) -> Vec<u32> {
        let mut out = Vec::with_capacity(n);
        for _ in 0..n {
            out.push(timeout(GUARD, rx.recv()).await.unwrap().unwrap());
        }
        out
    }

    #[tokio::test]
    async fn forwards_handler_items_in_order() {
        let queue = HandoffQueue::new();
        let mut producer = Producer::new(ListHandler {
            items: vec![1, 2, 3],
            task: None,
        });
        producer.start_producing(queue.clone());

        assert_eq!(collect(queue.get(), 3).await, vec![1, 2, 3]);
        timeout(GUARD, producer.stop_producing()).await.unwrap();

        // Stopped producers stay stopped.
        producer.start_producing(queue.clone());
        assert_eq!(queue.pending().await, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn interval_handler_fetches_on_every_tick() {
        let fc = FakeClock::new();
        let mut next = 0u32;
        let handler = IntervalProducerHandler::new(
            move || {
                next += 1;
                vec![next * 10, next * 10 + 1]
            },
            Duration::from_secs(5),
            true,
        )
        .with_clock(Arc::new(fc.clone()));

        let queue = HandoffQueue::new();
        let rx = queue.get();
        let mut producer = Producer::new(handler);
        producer.start_producing(queue.clone());

        // Immediate fetch, then the first timer is armed.
        assert_eq!(collect(rx.clone(), 2).await, vec![10, 11]);
        fc.wait_until_block(1).await;

        for round in 2..=4u32 {
            fc.advance(Duration::from_secs(5)).await;
            assert_eq!(collect(rx.clone(), 2).await, vec![round * 10, round * 10 + 1]);
            // The reset after each fetch registers the next tick.
            fc.wait_until_block(1).await;
        }

        let timer = fc.timer_handle(0).await.unwrap();
        timeout(GUARD, producer.stop_producing()).await.unwrap();
        timeout(GUARD, timer.wait_stop()).await.unwrap();
        assert!(timer.stopped());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn interval_handler_waits_a_full_interval_without_enqueue_now() {
        let fc = FakeClock::new();
        let handler =
            IntervalProducerHandler::new(|| vec![7u32], Duration::from_secs(3), false)
                .with_clock(Arc::new(fc.clone()));

        let queue = HandoffQueue::new();
        let mut producer = Producer::new(handler);
        producer.start_producing(queue.clone());
        fc.wait_until_block(1).await;

        fc.advance(Duration::from_secs(2)).await;
        assert_eq!(queue.pending().await, 0);

        fc.advance(Duration::from_secs(1)).await;
        assert_eq!(collect(queue.get(), 1).await, vec![7]);

        timeout(GUARD, producer.stop_producing()).await.unwrap();
    }
}
