//! # Worker Orchestrator
//!
//! [`Worker`] owns one queue, one producer and one consumer. Construction
//! starts both sides; [`Worker::stop`] shuts them down in the only order that
//! loses nothing: producer first, then the queue (which drains), then the
//! consumer.

use std::future::Future;

use super::consumer::Consumer;
use super::producer::{Producer, ProducerHandler};
use super::queue::{HandoffQueue, QueueReceiver};

/// The producing side of a [`Worker`].
pub trait WorkerProducer<T>: Send {
    /// Starts feeding `queue`.
    fn start_producing(&mut self, queue: HandoffQueue<T>);
    /// Stops feeding and resolves once no further `put` will happen.
    fn stop_producing(&mut self) -> impl Future<Output = ()> + Send;
}

/// The consuming side of a [`Worker`].
pub trait WorkerConsumer<T>: Send {
    /// Starts draining `queue`.
    fn start_consuming(&mut self, queue: QueueReceiver<T>);
    /// Resolves once every consuming task has exited.
    fn stop_consuming(&mut self) -> impl Future<Output = ()> + Send;
}

impl<T, H> WorkerProducer<T> for Producer<T, H>
where
    T: Send + 'static,
    H: ProducerHandler<T>,
{
    fn start_producing(&mut self, queue: HandoffQueue<T>) {
        Producer::start_producing(self, queue);
    }

    fn stop_producing(&mut self) -> impl Future<Output = ()> + Send {
        Producer::stop_producing(self)
    }
}

impl<T, F, Fut> WorkerConsumer<T> for Consumer<T, F>
where
    T: Send + 'static,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    fn start_consuming(&mut self, queue: QueueReceiver<T>) {
        Consumer::start_consuming(self, queue);
    }

    fn stop_consuming(&mut self) -> impl Future<Output = ()> + Send {
        Consumer::stop_consuming(self)
    }
}

/// # Worker
///
/// A running producer/consumer pair. All three parts are released by `stop`;
/// calling `stop` again is a no-op.
pub struct Worker<T, P, C> {
    queue: Option<HandoffQueue<T>>,
    producer: Option<P>,
    consumer: Option<C>,
}

impl<T, P, C> Worker<T, P, C>
where
    T: Send + 'static,
    P: WorkerProducer<T>,
    C: WorkerConsumer<T>,
{
    /// Creates the queue and starts the consumer, then the producer.
    pub fn new(mut producer: P, mut consumer: C) -> Self {
        let queue = HandoffQueue::new();
        consumer.start_consuming(queue.get());
        producer.start_producing(queue.clone());
        log::debug!("worker started");

        Self {
            queue: Some(queue),
            producer: Some(producer),
            consumer: Some(consumer),
        }
    }

    /// The queue between the two sides, until `stop` releases it.
    pub fn queue(&self) -> Option<&HandoffQueue<T>> {
        self.queue.as_ref()
    }

    /// Stops the producer, closes and drains the queue, stops the consumer,
    /// then releases all three.
    pub async fn stop(&mut self) {
        if let Some(producer) = self.producer.as_mut() {
            producer.stop_producing().await;
        }
        if let Some(queue) = self.queue.as_ref() {
            queue.close().await;
        }
        if let Some(consumer) = self.consumer.as_mut() {
            consumer.stop_consuming().await;
        }

        self.producer = None;
        self.queue = None;
        self.consumer = None;
        log::debug!("worker stopped");
    }

    /// Whether `stop` has completed.
    pub fn is_stopped(&self) -> bool {
        self.queue.is_none()
    }
}
