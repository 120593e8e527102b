//! # Worker Pipeline Integration Test
//!
//! Wires stock producers and consumers through `Worker` and checks what the
//! consumer handler observed once the worker has been stopped.

use anyhow::{Result, ensure};
use lib_pipeline::{
    Clock, Consumer, FakeClock, IntervalProducerHandler, Producer, ProducerHandler, Worker,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;

const GUARD: Duration = Duration::from_secs(10);

/// Emits a fixed list, then finishes.
struct ListHandler {
    items: Vec<u32>,
    task: Option<JoinHandle<()>>,
}

impl ProducerHandler<u32> for ListHandler {
    fn start(&mut self, relay: mpsc::Sender<u32>) {
        let items = std::mem::take(&mut self.items);
        self.task = Some(tokio::spawn(async move {
            for item in items {
                if relay.send(item).await.is_err() {
                    return;
                }
            }
        }));
    }

    async fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

fn recording_consumer(
    sink: Arc<Mutex<Vec<u32>>>,
    workers: usize,
) -> Consumer<u32, impl Fn(u32) -> std::future::Ready<()> + Send + Sync + 'static> {
    Consumer::new(
        move |item: u32| {
            sink.lock().expect("Sink lock poisoned").push(item);
            std::future::ready(())
        },
        workers,
    )
}

/// A producer emitting [1, 2, 3] and one consumer worker.
async fn list_producer_single_worker() -> Result<()> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let producer = Producer::new(ListHandler {
        items: vec![1, 2, 3],
        task: None,
    });
    let mut worker = Worker::new(producer, recording_consumer(Arc::clone(&seen), 1));

    timeout(GUARD, worker.stop()).await?;

    let seen = seen.lock().expect("Sink lock poisoned").clone();
    ensure!(seen == vec![1, 2, 3], "handler saw {:?}", seen);
    ensure!(worker.queue().is_none(), "worker kept its queue after stop");
    println!("[OK] list producer -> single worker delivered {:?}", seen);
    Ok(())
}

/// Interval producer on a fake clock with several workers.
async fn interval_producer_many_workers() -> Result<()> {
    let fc = FakeClock::new();
    let mut next = 0u32;
    let fetch = move || {
        let batch = vec![next, next + 1, next + 2, next + 3];
        next += 4;
        batch
    };
    let handler = IntervalProducerHandler::new(fetch, Duration::from_secs(60), true)
        .with_clock(Arc::new(fc.clone()) as Arc<dyn Clock>);

    let seen = Arc::new(Mutex::new(Vec::new()));
    let mut worker = Worker::new(Producer::new(handler), recording_consumer(Arc::clone(&seen), 3));

    // First timer armed after the immediate fetch.
    timeout(GUARD, fc.wait_until_block(1)).await?;
    for _ in 0..4 {
        timeout(GUARD, fc.advance(Duration::from_secs(60))).await?;
        timeout(GUARD, fc.wait_until_block(1)).await?;
    }
    let timer = fc
        .timer_handle(0)
        .await
        .ok_or_else(|| anyhow::anyhow!("no armed interval timer"))?;

    timeout(GUARD, worker.stop()).await?;
    ensure!(timer.stopped(), "interval timer still armed after stop");

    let mut seen = seen.lock().expect("Sink lock poisoned").clone();
    seen.sort_unstable();
    ensure!(seen == (0..20).collect::<Vec<_>>(), "handler saw {:?}", seen);
    println!("[OK] interval producer -> 3 workers delivered {} items", seen.len());
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    list_producer_single_worker().await?;
    interval_producer_many_workers().await?;
    println!("[*] worker pipeline checks passed");
    Ok(())
}
