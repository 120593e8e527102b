//! An in-memory transport that drops every connection after a fixed lifetime
//! and refuses a configurable number of dials after each drop.

use lib_pipeline::{Connection, Dialer};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection refused by {0}")]
    Refused(String),
    #[error("Link {0} is down")]
    LinkDown(usize),
}

pub struct SimulatedDialer {
    drop_every: Duration,
    failures_after_drop: usize,
    // Dials still to refuse since the last drop.
    refusals: Arc<AtomicUsize>,
    next_id: AtomicUsize,
}

impl SimulatedDialer {
    pub fn new(drop_every: Duration, failures_after_drop: usize) -> Self {
        Self {
            drop_every,
            failures_after_drop,
            refusals: Arc::new(AtomicUsize::new(0)),
            next_id: AtomicUsize::new(0),
        }
    }
}

impl Dialer for SimulatedDialer {
    type Connection = SimulatedConnection;
    type Config = ();
    type Error = TransportError;

    async fn dial(&self, address: &str, _config: &()) -> Result<SimulatedConnection, TransportError> {
        let refused = self
            .refusals
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(TransportError::Refused(address.to_string()));
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        log::debug!("Simulated link {} up", id);
        Ok(SimulatedConnection::open(
            id,
            self.drop_every,
            self.failures_after_drop,
            Arc::clone(&self.refusals),
        ))
    }
}

pub struct SimulatedConnection {
    id: usize,
    down: Arc<AtomicBool>,
    loss: Arc<Mutex<Option<oneshot::Sender<String>>>>,
    shutdown: CancellationToken,
    channels: AtomicUsize,
}

impl SimulatedConnection {
    fn open(id: usize, lifetime: Duration, failures_after_drop: usize, refusals: Arc<AtomicUsize>) -> Self {
        let down = Arc::new(AtomicBool::new(false));
        let loss: Arc<Mutex<Option<oneshot::Sender<String>>>> = Arc::new(Mutex::new(None));
        let shutdown = CancellationToken::new();

        let link = (Arc::clone(&down), Arc::clone(&loss), shutdown.clone());
        tokio::spawn(async move {
            let (down, loss, shutdown) = link;
            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = tokio::time::sleep(lifetime) => {
                    down.store(true, Ordering::SeqCst);
                    refusals.store(failures_after_drop, Ordering::SeqCst);
                    let notify = loss.lock().expect("Loss lock poisoned").take();
                    if let Some(tx) = notify {
                        let _ = tx.send(format!("link {} timed out", id));
                    }
                }
            }
        });

        Self {
            id,
            down,
            loss,
            shutdown,
            channels: AtomicUsize::new(0),
        }
    }
}

impl Connection for SimulatedConnection {
    type Channel = String;
    type Error = TransportError;
    type Reason = String;

    async fn channel(&self) -> Result<String, TransportError> {
        if self.down.load(Ordering::SeqCst) {
            return Err(TransportError::LinkDown(self.id));
        }
        let n = self.channels.fetch_add(1, Ordering::SeqCst);
        Ok(format!("link-{}/ch-{}", self.id, n))
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.shutdown.cancel();
        self.down.store(true, Ordering::SeqCst);
        self.loss.lock().expect("Loss lock poisoned").take();
        Ok(())
    }

    fn notify_close(&self) -> oneshot::Receiver<String> {
        let (tx, rx) = oneshot::channel();
        *self.loss.lock().expect("Loss lock poisoned") = Some(tx);
        rx
    }
}

impl Drop for SimulatedConnection {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
