//! # Resilient Connection Integration Test
//!
//! Drives `ResilientClient` through loss, failed re-dials, recovery and a
//! disconnect during backoff, with virtual time and a recording logger.

use anyhow::{Result, bail, ensure};
use lib_pipeline::{
    ClientConfig, ClientError, Connection, ConnectionState, Dialer, EventLogger, FakeClock,
    ResilientClient,
};
use log::Level;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::time::timeout;

const ADDR: &str = "loopback://queue:5672";
const SEC: i64 = 1_000_000_000;
const GUARD: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
#[error("{0}")]
struct LinkError(&'static str);

struct Link {
    id: usize,
    loss: Mutex<Option<oneshot::Sender<&'static str>>>,
    closed: AtomicBool,
}

impl Link {
    fn drop_with(&self, reason: &'static str) -> bool {
        let notify = self.loss.lock().expect("Loss lock poisoned").take();
        notify.is_some_and(|tx| tx.send(reason).is_ok())
    }

    fn has_listener(&self) -> bool {
        self.loss.lock().expect("Loss lock poisoned").is_some()
    }
}

impl Connection for Link {
    type Channel = usize;
    type Error = LinkError;
    type Reason = &'static str;

    async fn channel(&self) -> Result<usize, LinkError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(LinkError("link closed"));
        }
        Ok(self.id)
    }

    async fn close(&self) -> Result<(), LinkError> {
        self.closed.store(true, Ordering::SeqCst);
        self.loss.lock().expect("Loss lock poisoned").take();
        Ok(())
    }

    fn notify_close(&self) -> oneshot::Receiver<&'static str> {
        let (tx, rx) = oneshot::channel();
        *self.loss.lock().expect("Loss lock poisoned") = Some(tx);
        rx
    }
}

/// Succeeds or fails according to a script, then keeps failing.
struct ScriptedDialer {
    script: Mutex<VecDeque<bool>>,
    dials: Arc<AtomicUsize>,
}

impl Dialer for ScriptedDialer {
    type Connection = Link;
    type Config = ();
    type Error = LinkError;

    async fn dial(&self, _address: &str, _config: &()) -> Result<Link, LinkError> {
        let id = self.dials.fetch_add(1, Ordering::SeqCst);
        let ok = self.script.lock().expect("Script lock poisoned").pop_front().unwrap_or(false);
        if !ok {
            return Err(LinkError("connection refused"));
        }
        Ok(Link {
            id,
            loss: Mutex::new(None),
            closed: AtomicBool::new(false),
        })
    }
}

#[derive(Default)]
struct RecordingLogger {
    lines: Mutex<Vec<(Level, String)>>,
}

impl EventLogger for RecordingLogger {
    fn log(&self, level: Level, message: &str) {
        self.lines.lock().expect("Log lock poisoned").push((level, message.to_string()));
    }
}

impl RecordingLogger {
    fn count(&self, level: Level, needle: &str) -> usize {
        self.lines
            .lock()
            .expect("Log lock poisoned")
            .iter()
            .filter(|(l, m)| *l == level && m.contains(needle))
            .count()
    }
}

async fn connect(
    script: &[bool],
    fc: &FakeClock,
    logger: &Arc<RecordingLogger>,
) -> Result<(ResilientClient<ScriptedDialer>, Arc<AtomicUsize>)> {
    let dials = Arc::new(AtomicUsize::new(0));
    let dialer = ScriptedDialer {
        script: Mutex::new(script.iter().copied().collect()),
        dials: Arc::clone(&dials),
    };
    let config = ClientConfig::new(ADDR, dialer, ())
        .with_clock(Arc::new(fc.clone()))
        .with_logger(Arc::clone(logger) as Arc<dyn EventLogger>);
    Ok((ResilientClient::connect(config).await?, dials))
}

async fn wait_state(client: &ResilientClient<ScriptedDialer>, state: ConnectionState) -> Result<()> {
    let mut rx = client.subscribe_state();
    timeout(GUARD, rx.wait_for(|s| *s == state)).await??;
    Ok(())
}

async fn advance_armed(fc: &FakeClock, delay_secs: i64) -> Result<()> {
    timeout(GUARD, fc.wait_until_block(1)).await?;
    let Some(timer) = fc.timer_handle(0).await else {
        bail!("expected an armed backoff timer");
    };
    let expected = fc.right_now() + delay_secs * SEC;
    ensure!(timer.expire_at() == expected, "backoff armed at {} instead of {}", timer.expire_at(), expected);
    timeout(GUARD, fc.advance(Duration::from_secs(delay_secs as u64))).await?;
    Ok(())
}

/// Loss with reason X, two refused re-dials, third succeeds.
async fn recovers_after_refused_redials() -> Result<()> {
    let fc = FakeClock::new();
    let logger = Arc::new(RecordingLogger::default());
    let (mut client, dials) = connect(&[true, false, false, true], &fc, &logger).await?;

    let first = client.current_connection().ok_or_else(|| anyhow::anyhow!("no connection"))?;
    ensure!(first.drop_with("X"), "watcher was not listening for loss");
    wait_state(&client, ConnectionState::Reconnecting).await?;

    advance_armed(&fc, 2).await?;
    advance_armed(&fc, 4).await?;
    advance_armed(&fc, 6).await?;
    wait_state(&client, ConnectionState::Connected).await?;

    let current = client.current_connection().ok_or_else(|| anyhow::anyhow!("no connection"))?;
    ensure!(current.id == 3, "expected link 3, got {}", current.id);
    ensure!(!first.has_listener(), "old link's loss notice not drained");
    ensure!(current.has_listener(), "new link not watched");
    ensure!(dials.load(Ordering::SeqCst) == 4);
    ensure!(client.channel().await? == 3);

    ensure!(logger.count(Level::Error, "lost: \"X\"") == 1, "loss not logged");
    ensure!(logger.count(Level::Error, "failed") == 2, "refused re-dials not logged");
    ensure!(logger.count(Level::Info, "Reconnected") == 1, "recovery not logged");

    client.disconnect().await?;
    ensure!(current.closed.load(Ordering::SeqCst), "disconnect did not close the live link");
    println!("[OK] recovered after two refused re-dials");
    Ok(())
}

/// Sawtooth delays, then disconnect while the timer is armed.
async fn disconnect_during_backoff() -> Result<()> {
    let fc = FakeClock::new();
    let logger = Arc::new(RecordingLogger::default());
    let (mut client, _) = connect(&[true], &fc, &logger).await?;

    let link = client.current_connection().ok_or_else(|| anyhow::anyhow!("no connection"))?;
    link.drop_with("peer reset");
    wait_state(&client, ConnectionState::Reconnecting).await?;

    for delay in [2, 4, 6, 8, 10, 2] {
        advance_armed(&fc, delay).await?;
    }
    timeout(GUARD, fc.wait_until_block(1)).await?;
    let Some(armed) = fc.timer_handle(0).await else {
        bail!("expected an armed backoff timer");
    };

    client.disconnect().await?;
    timeout(GUARD, armed.wait_stop()).await?;

    ensure!(armed.stopped());
    ensure!(client.state() == ConnectionState::Closed);
    ensure!(client.current_connection().is_none());
    ensure!(matches!(client.disconnect().await, Err(ClientError::Closed)));
    ensure!(logger.count(Level::Info, "Disconnected") == 1);
    println!("[OK] disconnect during backoff stopped the armed timer");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    recovers_after_refused_redials().await?;
    disconnect_during_backoff().await?;
    println!("[*] resilient connection checks passed");
    Ok(())
}
