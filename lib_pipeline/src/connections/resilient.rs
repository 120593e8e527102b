//! # Resilient Client
//!
//! Owns one logical connection and keeps it alive.
//!
//! ## State machine
//!
//! - **Connecting**: the first dial happens inside [`ResilientClient::connect`].
//!   If it fails, `connect` returns the error and no client exists.
//! - **Connected**: a watcher task waits for the transport's close
//!   notification.
//! - **Reconnecting**: entered when the transport reports a loss. The watcher
//!   arms a backoff timer, re-dials on every fire and widens the delay after
//!   each failure (see [`BackoffPolicy`]). Success swaps the new handle in and
//!   returns to Connected with fresh backoff state for the next loss.
//! - **Closed**: after [`ResilientClient::disconnect`]. The handle is closed,
//!   the watcher has exited and the client holds no connection.
//!
//! The live handle sits behind a mutex that is only held to clone or replace
//! the `Arc`, never across a dial or a call on the handle itself.

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::backoff::{BackoffPolicy, ReconnectBackoff};
use crate::loggers::{EventLogger, FacadeLogger};
use crate::utils::{Clock, RealClock};

/// Boxed error from a dialer or connection.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors returned by [`ResilientClient`].
#[derive(Debug, Error)]
pub enum ClientError {
    /// The initial dial failed; no client was created.
    #[error("Failed to dial {address}: {source}")]
    Dial {
        /// Address that was dialed.
        address: String,
        /// Error reported by the dialer.
        #[source]
        source: BoxError,
    },
    /// The live connection could not open a channel.
    #[error("Failed to open channel: {0}")]
    Channel(#[source] BoxError),
    /// Closing the connection during `disconnect` failed.
    #[error("Failed to close connection: {0}")]
    Close(#[source] BoxError),
    /// The client has been disconnected.
    #[error("Client is closed")]
    Closed,
}

/// Where the client is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Initial dial in progress.
    Connecting,
    /// A live handle is installed.
    Connected,
    /// The transport reported a loss; re-dialing with backoff.
    Reconnecting,
    /// Disconnected for good.
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// A live transport handle.
pub trait Connection: Send + Sync + 'static {
    /// The capability handed out by [`ResilientClient::channel`].
    type Channel: Send;
    /// Error raised by `channel` and `close`.
    type Error: std::error::Error + Send + Sync + 'static;
    /// Why the transport dropped.
    type Reason: fmt::Debug + Send + 'static;

    /// Opens a channel on this connection.
    fn channel(&self) -> impl Future<Output = Result<Self::Channel, Self::Error>> + Send;

    /// Closes the connection. Any pending close notification must end without
    /// a reason (its sender is dropped).
    fn close(&self) -> impl Future<Output = Result<(), Self::Error>> + Send;

    /// Registers for a one-shot loss notification. A reason means the
    /// connection was lost; a dropped sender means it was closed on purpose.
    fn notify_close(&self) -> oneshot::Receiver<Self::Reason>;
}

/// Produces connections; supplied by the embedding application.
pub trait Dialer: Send + Sync + 'static {
    /// The connection type this dialer produces.
    type Connection: Connection;
    /// Transport-specific dial options.
    type Config: Send + Sync + 'static;
    /// Dial failure.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Dials `address`.
    fn dial(
        &self,
        address: &str,
        config: &Self::Config,
    ) -> impl Future<Output = Result<Self::Connection, Self::Error>> + Send;
}

/// # Client Config
///
/// Everything a [`ResilientClient`] needs, passed at construction.
pub struct ClientConfig<D: Dialer> {
    /// Peer address handed to the dialer.
    pub address: String,
    /// Options handed to the dialer on every dial.
    pub dial_config: D::Config,
    /// The dial collaborator.
    pub dialer: D,
    /// Source of backoff timers.
    pub clock: Arc<dyn Clock>,
    /// Reconnect delays.
    pub backoff: BackoffPolicy,
    /// Where reconnect and disconnect events go. `None` means [`FacadeLogger`].
    pub logger: Option<Arc<dyn EventLogger>>,
}

impl<D: Dialer> ClientConfig<D> {
    /// Real clock, default backoff, facade logging.
    pub fn new(address: impl Into<String>, dialer: D, dial_config: D::Config) -> Self {
        Self {
            address: address.into(),
            dial_config,
            dialer,
            clock: Arc::new(RealClock::new()),
            backoff: BackoffPolicy::default(),
            logger: None,
        }
    }

    /// Replaces the clock.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Replaces the backoff policy.
    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Replaces the logger.
    pub fn with_logger(mut self, logger: Arc<dyn EventLogger>) -> Self {
        self.logger = Some(logger);
        self
    }
}

impl<D: Dialer> fmt::Debug for ClientConfig<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("address", &self.address)
            .field("backoff", &self.backoff)
            .field("custom_logger", &self.logger.is_some())
            .finish_non_exhaustive()
    }
}

/// State shared between the client and its watcher task.
struct Shared<D: Dialer> {
    address: String,
    dial_config: D::Config,
    dialer: D,
    logger: Arc<dyn EventLogger>,
    connection: Mutex<Option<Arc<D::Connection>>>,
    state: watch::Sender<ConnectionState>,
}

type CloseNotice<D> = oneshot::Receiver<<<D as Dialer>::Connection as Connection>::Reason>;

impl<D: Dialer> Shared<D> {
    fn current(&self) -> Option<Arc<D::Connection>> {
        self.connection
            .lock()
            .expect("Connection lock poisoned")
            .clone()
    }

    fn take(&self) -> Option<Arc<D::Connection>> {
        self.connection
            .lock()
            .expect("Connection lock poisoned")
            .take()
    }

    /// Registers for loss, then installs the handle.
    fn install(&self, connection: D::Connection) -> CloseNotice<D> {
        let notice = connection.notify_close();
        let previous = self
            .connection
            .lock()
            .expect("Connection lock poisoned")
            .replace(Arc::new(connection));
        drop(previous);
        self.state.send_replace(ConnectionState::Connected);
        notice
    }

    async fn dial(&self) -> Result<D::Connection, D::Error> {
        self.dialer.dial(&self.address, &self.dial_config).await
    }
}

/// # Resilient Client
///
/// See the module docs for the state machine.
pub struct ResilientClient<D: Dialer> {
    shared: Arc<Shared<D>>,
    disconnect: CancellationToken,
    watcher: Option<JoinHandle<()>>,
}

impl<D: Dialer> fmt::Debug for ResilientClient<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResilientClient")
            .field("address", &self.shared.address)
            .field("state", &self.state())
            .finish()
    }
}

impl<D: Dialer> ResilientClient<D> {
    /// Dials once and starts watching the connection.
    ///
    /// # Errors
    ///
    /// [`ClientError::Dial`] if the first dial fails. There is no retry here.
    pub async fn connect(config: ClientConfig<D>) -> Result<Self, ClientError> {
        let ClientConfig {
            address,
            dial_config,
            dialer,
            clock,
            backoff,
            logger,
        } = config;

        let shared = Arc::new(Shared {
            address,
            dial_config,
            dialer,
            logger: logger.unwrap_or_else(|| Arc::new(FacadeLogger::default())),
            connection: Mutex::new(None),
            state: watch::channel(ConnectionState::Connecting).0,
        });

        let connection = shared.dial().await.map_err(|e| ClientError::Dial {
            address: shared.address.clone(),
            source: Box::new(e),
        })?;
        let notice = shared.install(connection);
        shared
            .logger
            .info(&format!("Connected to {}", shared.address));

        let disconnect = CancellationToken::new();
        let watcher = tokio::spawn(watch_connection(
            Arc::clone(&shared),
            clock,
            backoff,
            disconnect.clone(),
            notice,
        ));

        Ok(Self {
            shared,
            disconnect,
            watcher: Some(watcher),
        })
    }

    /// Opens a channel on the current handle.
    ///
    /// While reconnecting this may fail with [`ClientError::Channel`] from the
    /// dead handle; callers retry.
    pub async fn channel(
        &self,
    ) -> Result<<D::Connection as Connection>::Channel, ClientError> {
        let connection = self.shared.current().ok_or(ClientError::Closed)?;
        connection
            .channel()
            .await
            .map_err(|e| ClientError::Channel(Box::new(e)))
    }

    /// The handle currently installed, if any.
    pub fn current_connection(&self) -> Option<Arc<D::Connection>> {
        self.shared.current()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    /// Receiver that observes every state change.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// The address this client dials.
    pub fn address(&self) -> &str {
        &self.shared.address
    }

    /// Closes the handle, stops the watcher (and any armed backoff timer) and
    /// waits for it to exit.
    ///
    /// Teardown completes even if closing the handle fails; that failure is
    /// returned afterwards.
    ///
    /// # Errors
    ///
    /// [`ClientError::Close`] from the handle, or [`ClientError::Closed`] if
    /// the client was already disconnected.
    pub async fn disconnect(&mut self) -> Result<(), ClientError> {
        let Some(watcher) = self.watcher.take() else {
            return Err(ClientError::Closed);
        };

        let closed = match self.shared.take() {
            Some(connection) => connection
                .close()
                .await
                .map_err(|e| ClientError::Close(Box::new(e))),
            None => Ok(()),
        };

        self.disconnect.cancel();
        if let Err(e) = watcher.await {
            if e.is_panic() {
                std::panic::resume_unwind(e.into_panic());
            }
        }

        // A reconnect that finished between the close and the cancel.
        if let Some(late) = self.shared.take() {
            if let Err(e) = late.close().await {
                log::warn!("Failed to close late reconnect to {}: {}", self.shared.address, e);
            }
        }

        self.shared.state.send_replace(ConnectionState::Closed);
        self.shared
            .logger
            .info(&format!("Disconnected from {}", self.shared.address));
        closed
    }
}

impl<D: Dialer> Drop for ResilientClient<D> {
    fn drop(&mut self) {
        self.disconnect.cancel();
    }
}

async fn watch_connection<D: Dialer>(
    shared: Arc<Shared<D>>,
    clock: Arc<dyn Clock>,
    backoff: BackoffPolicy,
    disconnect: CancellationToken,
    mut notice: CloseNotice<D>,
) {
    loop {
        let reason = tokio::select! {
            biased;
            _ = disconnect.cancelled() => return,
            reason = &mut notice => match reason {
                Ok(reason) => reason,
                // Closed on purpose.
                Err(_) => return,
            },
        };

        shared
            .logger
            .error(&format!("Connection to {} lost: {:?}", shared.address, reason));
        shared.state.send_replace(ConnectionState::Reconnecting);

        match reconnect(&shared, clock.as_ref(), backoff, &disconnect).await {
            Some(next) => notice = next,
            None => return,
        }
    }
}

/// Re-dials until it succeeds (returning the new loss notice) or the client is
/// disconnected (returning `None`).
async fn reconnect<D: Dialer>(
    shared: &Shared<D>,
    clock: &dyn Clock,
    policy: BackoffPolicy,
    disconnect: &CancellationToken,
) -> Option<CloseNotice<D>> {
    let mut backoff = ReconnectBackoff::new(policy);
    let mut timer = clock.timer(backoff.delay());

    loop {
        shared.logger.info(&format!(
            "Reconnecting to {} in {:?}",
            shared.address,
            backoff.delay()
        ));

        tokio::select! {
            biased;
            _ = disconnect.cancelled() => {
                timer.stop();
                return None;
            }
            _ = timer.fired() => {}
        }

        let dialed = tokio::select! {
            biased;
            _ = disconnect.cancelled() => return None,
            dialed = shared.dial() => dialed,
        };

        match dialed {
            Ok(connection) => {
                timer.stop();
                let notice = shared.install(connection);
                shared
                    .logger
                    .info(&format!("Reconnected to {}", shared.address));
                return Some(notice);
            }
            Err(e) => {
                shared.logger.error(&format!(
                    "Reconnect to {} failed: {}",
                    shared.address, e
                ));
                timer.reset(backoff.on_failure());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loggers::NoopLogger;
    use crate::utils::FakeClock;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::time::timeout;

    const ADDR: &str = "mock://peer:5672";
    const SEC: i64 = 1_000_000_000;
    const GUARD: Duration = Duration::from_secs(5);

    #[derive(Debug, Error)]
    #[error("{0}")]
    struct MockError(&'static str);

    #[derive(Debug)]
    struct MockConnection {
        id: usize,
        loss: Mutex<Option<oneshot::Sender<String>>>,
        closed: AtomicBool,
        fail_close: bool,
    }

    impl MockConnection {
        fn lose(&self, reason: &str) -> bool {
            match self.loss.lock().unwrap().take() {
                Some(tx) => tx.send(reason.to_string()).is_ok(),
                None => false,
            }
        }

        fn listening(&self) -> bool {
            self.loss.lock().unwrap().is_some()
        }
    }

    impl Connection for MockConnection {
        type Channel = usize;
        type Error = MockError;
        type Reason = String;

        async fn channel(&self) -> Result<usize, MockError> {
            if self.closed.load(Ordering::SeqCst) {
                Err(MockError("connection closed"))
            } else {
                Ok(self.id)
            }
        }

        async fn close(&self) -> Result<(), MockError> {
            self.closed.store(true, Ordering::SeqCst);
            self.loss.lock().unwrap().take();
            if self.fail_close {
                Err(MockError("close failed"))
            } else {
                Ok(())
            }
        }

        fn notify_close(&self) -> oneshot::Receiver<String> {
            let (tx, rx) = oneshot::channel();
            *self.loss.lock().unwrap() = Some(tx);
            rx
        }
    }

    /// Answers dials from a script; once exhausted every dial gets `fallback`.
    struct MockDialer {
        script: Mutex<VecDeque<bool>>,
        fallback: bool,
        attempts: Arc<AtomicUsize>,
        fail_close: bool,
    }

    impl MockDialer {
        fn new(script: &[bool], fallback: bool) -> (Self, Arc<AtomicUsize>) {
            let attempts = Arc::new(AtomicUsize::new(0));
            let dialer = Self {
                script: Mutex::new(script.iter().copied().collect()),
                fallback,
                attempts: Arc::clone(&attempts),
                fail_close: false,
            };
            (dialer, attempts)
        }
    }

    impl Dialer for MockDialer {
        type Connection = MockConnection;
        type Config = ();
        type Error = MockError;

        async fn dial(&self, address: &str, _config: &()) -> Result<MockConnection, MockError> {
            assert_eq!(address, ADDR);
            let id = self.attempts.fetch_add(1, Ordering::SeqCst);
            let ok = self
                .script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(self.fallback);
            if !ok {
                return Err(MockError("connection refused"));
            }
            Ok(MockConnection {
                id,
                loss: Mutex::new(None),
                closed: AtomicBool::new(false),
                fail_close: self.fail_close,
            })
        }
    }

    fn config(dialer: MockDialer, fc: &FakeClock) -> ClientConfig<MockDialer> {
        ClientConfig::new(ADDR, dialer, ())
            .with_clock(Arc::new(fc.clone()))
            .with_logger(Arc::new(NoopLogger))
    }

    async fn wait_state(client: &ResilientClient<MockDialer>, state: ConnectionState) {
        let mut rx = client.subscribe_state();
        timeout(GUARD, rx.wait_for(|s| *s == state))
            .await
            .unwrap()
            .unwrap();
    }

    /// Waits for the backoff timer to be (re)armed and checks its delay.
    async fn expect_armed(fc: &FakeClock, delay_secs: i64) {
        timeout(GUARD, fc.wait_until_block(1)).await.unwrap();
        let timer = fc.timer_handle(0).await.unwrap();
        assert_eq!(timer.expire_at(), fc.right_now() + delay_secs * SEC);
    }

    #[tokio::test]
    async fn failed_first_dial_returns_no_client() {
        let fc = FakeClock::new();
        let (dialer, attempts) = MockDialer::new(&[false], true);

        let err = ResilientClient::connect(config(dialer, &fc)).await.unwrap_err();
        assert!(matches!(err, ClientError::Dial { ref address, .. } if address == ADDR));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert!(fc.timers().await.is_empty());
    }

    #[tokio::test]
    async fn channel_uses_the_live_handle() {
        let fc = FakeClock::new();
        let (dialer, _) = MockDialer::new(&[], true);
        let mut client = ResilientClient::connect(config(dialer, &fc)).await.unwrap();

        assert_eq!(client.state(), ConnectionState::Connected);
        assert_eq!(client.channel().await.unwrap(), 0);

        let conn = client.current_connection().unwrap();
        timeout(GUARD, client.disconnect()).await.unwrap().unwrap();

        assert!(conn.closed.load(Ordering::SeqCst));
        assert_eq!(client.state(), ConnectionState::Closed);
        assert!(matches!(client.channel().await, Err(ClientError::Closed)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn recovers_after_two_failed_redials() {
        let fc = FakeClock::new();
        let (dialer, attempts) = MockDialer::new(&[true, false, false, true], false);
        let mut client = ResilientClient::connect(config(dialer, &fc)).await.unwrap();

        let first = client.current_connection().unwrap();
        assert!(first.listening());
        assert!(first.lose("X"));
        wait_state(&client, ConnectionState::Reconnecting).await;

        expect_armed(&fc, 2).await;
        fc.advance(Duration::from_secs(2)).await;
        expect_armed(&fc, 4).await;
        fc.advance(Duration::from_secs(4)).await;
        expect_armed(&fc, 6).await;
        let backoff_timer = fc.timer_handle(0).await.unwrap();
        fc.advance(Duration::from_secs(6)).await;

        wait_state(&client, ConnectionState::Connected).await;
        assert!(backoff_timer.stopped());
        assert_eq!(attempts.load(Ordering::SeqCst), 4);

        let second = client.current_connection().unwrap();
        assert_eq!(second.id, 3);
        assert!(second.listening());
        // The old handle's loss notice was consumed.
        assert!(!first.listening());
        assert_eq!(client.channel().await.unwrap(), 3);

        timeout(GUARD, client.disconnect()).await.unwrap().unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn backoff_wraps_and_disconnect_stops_the_armed_timer() {
        let fc = FakeClock::new();
        let (dialer, attempts) = MockDialer::new(&[true], false);
        let mut client = ResilientClient::connect(config(dialer, &fc)).await.unwrap();

        client.current_connection().unwrap().lose("broker went away");
        wait_state(&client, ConnectionState::Reconnecting).await;

        for delay in [2, 4, 6, 8, 10, 2, 4] {
            expect_armed(&fc, delay).await;
            fc.advance(Duration::from_secs(delay as u64)).await;
        }
        expect_armed(&fc, 6).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 8);

        let armed = fc.timer_handle(0).await.unwrap();
        assert!(!armed.stopped());

        timeout(GUARD, client.disconnect()).await.unwrap().unwrap();
        timeout(GUARD, armed.wait_stop()).await.unwrap();

        assert!(armed.stopped());
        assert_eq!(client.state(), ConnectionState::Closed);
        assert!(client.current_connection().is_none());
        assert!(matches!(client.disconnect().await, Err(ClientError::Closed)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn each_loss_restarts_backoff_from_base() {
        let fc = FakeClock::new();
        let (dialer, _) = MockDialer::new(&[true, false, true, false, true], false);
        let mut client = ResilientClient::connect(config(dialer, &fc)).await.unwrap();

        for _ in 0..2 {
            client.current_connection().unwrap().lose("flap");
            wait_state(&client, ConnectionState::Reconnecting).await;
            expect_armed(&fc, 2).await;
            fc.advance(Duration::from_secs(2)).await;
            expect_armed(&fc, 4).await;
            fc.advance(Duration::from_secs(4)).await;
            wait_state(&client, ConnectionState::Connected).await;
        }

        timeout(GUARD, client.disconnect()).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn disconnect_reports_close_failure_after_teardown() {
        let fc = FakeClock::new();
        let (mut dialer, _) = MockDialer::new(&[], true);
        dialer.fail_close = true;
        let mut client = ResilientClient::connect(config(dialer, &fc)).await.unwrap();

        let err = timeout(GUARD, client.disconnect()).await.unwrap().unwrap_err();
        assert!(matches!(err, ClientError::Close(_)));
        assert_eq!(err.to_string(), "Failed to close connection: close failed");
        assert_eq!(client.state(), ConnectionState::Closed);
        assert!(client.current_connection().is_none());
    }
}
