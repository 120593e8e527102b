//! # Pipeline Demo
//!
//! Runs an interval producer feeding a worker pool whose consumers publish
//! every item through a `ResilientClient`. The client talks to a simulated
//! transport that drops its link periodically, so the log shows the reconnect
//! backoff at work while items keep flowing.

use anyhow::{Context, Result};
use lib_pipeline::{
    ClientConfig, Consumer, IntervalProducerHandler, Producer, ResilientClient, Worker,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::signal;

mod demo_logic;
use demo_logic::{config, logger, transport::SimulatedDialer};

#[tokio::main]
async fn main() -> Result<()> {
    let config = config::load_config();
    logger::setup_logging(config.log_dir.as_deref(), config.log_level())?;
    log::info!("Starting pipeline demo: {:?}", config);

    let dialer = SimulatedDialer::new(config.drop_every(), config.dial_failures.unwrap_or(0));
    let client_config = ClientConfig::new(config.address(), dialer, ()).with_backoff(config.backoff());
    let client = Arc::new(
        ResilientClient::connect(client_config)
            .await
            .context("Initial connection failed")?,
    );

    let published = Arc::new(AtomicU64::new(0));
    let handler_client = Arc::clone(&client);
    let handler_published = Arc::clone(&published);
    let consumer = Consumer::new(
        move |item: u64| {
            let client = Arc::clone(&handler_client);
            let published = Arc::clone(&handler_published);
            async move {
                match client.channel().await {
                    Ok(channel) => {
                        published.fetch_add(1, Ordering::Relaxed);
                        log::info!("Item {} published on {}", item, channel);
                    }
                    Err(e) => log::warn!("Item {} dropped while {}: {}", item, client.state(), e),
                }
            }
        },
        config.workers.unwrap_or(1),
    );

    let batch_size = config.batch_size.unwrap_or(1);
    let mut next_item = 0u64;
    let fetch = move || {
        let batch: Vec<u64> = (next_item..next_item + batch_size).collect();
        next_item += batch_size;
        batch
    };
    let producer = Producer::new(IntervalProducerHandler::new(fetch, config.fetch_interval(), true));

    let mut worker = Worker::new(producer, consumer);

    wait_for_shutdown(config.run_for()).await;

    worker.stop().await;
    log::info!("Worker stopped after publishing {} item(s).", published.load(Ordering::Relaxed));

    // The consumer (and its clone of the client) is gone once the worker stopped.
    match Arc::into_inner(client) {
        Some(mut client) => {
            if let Err(e) = client.disconnect().await {
                log::error!("Disconnect failed: {}", e);
            }
        }
        None => log::warn!("Client still shared at shutdown; dropping without disconnect."),
    }

    log::info!("Shutdown complete.");
    Ok(())
}

async fn wait_for_shutdown(run_for: Option<std::time::Duration>) {
    let deadline = async {
        match run_for {
            Some(duration) => tokio::time::sleep(duration).await,
            None => std::future::pending::<()>().await,
        }
    };

    tokio::select! {
        _ = signal::ctrl_c() => {
            log::info!("Ctrl-C received, initiating shutdown.");
        }
        _ = deadline => {
            log::info!("Run time elapsed, initiating shutdown.");
        }
    }
}
