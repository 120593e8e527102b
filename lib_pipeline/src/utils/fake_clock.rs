//! # Fake Clock
//!
//! A virtual-time [`Clock`] for deterministic tests of timer-driven code.
//!
//! ## How it works
//!
//! - **Right now** is an integer count of nanoseconds that only moves forward
//!   when [`FakeClock::advance`] is called.
//! - A single **scheduler task** owns the list of outstanding timers, sorted by
//!   expiry. Creating or resetting a timer sends a registration to it;
//!   advancing sends an advance request. Both travel over the same command
//!   channel, so they are processed in the order they were issued.
//! - **Firing is a rendezvous**: the scheduler hands the fire notification to
//!   the timer's owner and waits until the owner has received it (or stopped
//!   the timer) before firing the next one. `advance` returns only after
//!   every due timer went through that handshake.
//! - **Blocks**: each processed registration releases one permit on an
//!   internal semaphore. [`FakeClock::wait_until_block`] consumes permits, so a
//!   test can wait for "the code under test has armed its next timer" without
//!   sleeping.
//!
//! Stopped timers stay in the list until their expiry passes and are then
//! discarded without firing.

use std::fmt;
use std::future::{pending, Future};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot, watch, Semaphore};

use super::clock::{Clock, Timer};

fn as_nanos(duration: Duration) -> i64 {
    i64::try_from(duration.as_nanos()).unwrap_or(i64::MAX)
}

async fn wait_stopped(stopped: &mut watch::Receiver<bool>) {
    let _ = stopped.wait_for(|stopped| *stopped).await;
}

/// A fire notification; the owner acknowledges it by dropping or sending `ack`.
struct Fire {
    at: DateTime<Utc>,
    ack: oneshot::Sender<()>,
}

/// State shared by a timer, its handles and the scheduler.
#[derive(Debug)]
struct TimerCore {
    id: u64,
    expire_at: AtomicI64,
    /// Set on every arm, cleared when the scheduler fires it or it is stopped.
    armed: AtomicBool,
    stopped: watch::Sender<bool>,
}

impl TimerCore {
    fn is_stopped(&self) -> bool {
        *self.stopped.borrow()
    }

    fn stop(&self) -> bool {
        self.stopped.send_if_modified(|stopped| {
            if *stopped {
                false
            } else {
                *stopped = true;
                true
            }
        })
    }
}

enum ClockCommand {
    Register {
        core: Arc<TimerCore>,
        expire_at: i64,
        fire_tx: mpsc::Sender<Fire>,
    },
    Advance {
        duration: Duration,
        done: oneshot::Sender<()>,
    },
    Snapshot {
        reply: oneshot::Sender<Vec<Arc<TimerCore>>>,
    },
}

struct ClockShared {
    right_now: AtomicI64,
    next_id: AtomicU64,
    blocks: Semaphore,
}

/// # Fake Clock
///
/// Cheap to clone; all clones share one timeline and one scheduler task.
/// The scheduler exits once every clone and every timer it produced is gone.
#[derive(Clone)]
pub struct FakeClock {
    commands: mpsc::UnboundedSender<ClockCommand>,
    shared: Arc<ClockShared>,
}

impl fmt::Debug for FakeClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FakeClock")
            .field("right_now", &self.right_now())
            .finish()
    }
}

impl FakeClock {
    /// Creates a fake clock whose "now" starts at the current wall time.
    ///
    /// Spawns the scheduler task, so it must be called inside a tokio runtime.
    pub fn new() -> Self {
        Self::starting_at(Utc::now().timestamp_nanos_opt().unwrap_or_default())
    }

    /// Creates a fake clock whose "now" starts at `right_now` nanoseconds.
    pub fn starting_at(right_now: i64) -> Self {
        let (commands, receiver) = mpsc::unbounded_channel();
        let shared = Arc::new(ClockShared {
            right_now: AtomicI64::new(right_now),
            next_id: AtomicU64::new(0),
            blocks: Semaphore::new(0),
        });

        let scheduler = Scheduler {
            timers: Vec::new(),
            shared: Arc::clone(&shared),
        };
        tokio::spawn(scheduler.run(receiver));

        Self { commands, shared }
    }

    /// The current virtual time in nanoseconds.
    pub fn right_now(&self) -> i64 {
        self.shared.right_now.load(Ordering::SeqCst)
    }

    /// Moves time forward by `duration` and fires every timer that became due,
    /// in expiry order. Returns once all of them have been delivered or stopped.
    pub async fn advance(&self, duration: Duration) {
        let (done, finished) = oneshot::channel();
        if self
            .commands
            .send(ClockCommand::Advance { duration, done })
            .is_ok()
        {
            let _ = finished.await;
        }
    }

    /// Waits until `n` more timer registrations (creations or resets) have been
    /// processed by the scheduler.
    pub async fn wait_until_block(&self, n: usize) {
        let n = u32::try_from(n).unwrap_or(u32::MAX);
        if let Ok(permits) = self.shared.blocks.acquire_many(n).await {
            permits.forget();
        }
    }

    /// Outstanding timers in expiry order, including stopped ones that have not
    /// reached their expiry yet.
    pub async fn timers(&self) -> Vec<FakeTimerHandle> {
        let (reply, snapshot) = oneshot::channel();
        if self.commands.send(ClockCommand::Snapshot { reply }).is_err() {
            return Vec::new();
        }
        snapshot
            .await
            .unwrap_or_default()
            .into_iter()
            .map(|core| FakeTimerHandle { core })
            .collect()
    }

    /// The outstanding timer at `index` in expiry order.
    pub async fn timer_handle(&self, index: usize) -> Option<FakeTimerHandle> {
        self.timers().await.into_iter().nth(index)
    }

    fn schedule(&self, core: Arc<TimerCore>, fire_tx: mpsc::Sender<Fire>) {
        let expire_at = core.expire_at.load(Ordering::SeqCst);
        let _ = self.commands.send(ClockCommand::Register {
            core,
            expire_at,
            fire_tx,
        });
    }
}

impl Clock for FakeClock {
    fn timer(&self, duration: Duration) -> Timer {
        let (fire_tx, fire_rx) = mpsc::channel(1);
        let core = Arc::new(TimerCore {
            id: self.shared.next_id.fetch_add(1, Ordering::Relaxed),
            expire_at: AtomicI64::new(self.right_now().saturating_add(as_nanos(duration))),
            armed: AtomicBool::new(true),
            stopped: watch::channel(false).0,
        });

        self.schedule(Arc::clone(&core), fire_tx.clone());

        Timer::Fake(FakeTimer {
            core,
            fire_tx,
            fire_rx,
            clock: self.clone(),
        })
    }
}

struct Entry {
    expire_at: i64,
    core: Arc<TimerCore>,
    fire_tx: mpsc::Sender<Fire>,
}

/// Owns the outstanding timers. Runs until every command sender is dropped.
struct Scheduler {
    timers: Vec<Entry>,
    shared: Arc<ClockShared>,
}

impl Scheduler {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<ClockCommand>) {
        while let Some(command) = commands.recv().await {
            match command {
                ClockCommand::Register {
                    core,
                    expire_at,
                    fire_tx,
                } => {
                    self.register(core, expire_at, fire_tx);
                    self.shared.blocks.add_permits(1);
                }
                ClockCommand::Advance { duration, done } => {
                    self.advance(duration).await;
                    let _ = done.send(());
                }
                ClockCommand::Snapshot { reply } => {
                    let cores = self.timers.iter().map(|e| Arc::clone(&e.core)).collect();
                    let _ = reply.send(cores);
                }
            }
        }
        log::debug!("fake clock scheduler stopped");
    }

    fn register(&mut self, core: Arc<TimerCore>, expire_at: i64, fire_tx: mpsc::Sender<Fire>) {
        // A reset replaces the previous registration of the same timer.
        self.timers.retain(|entry| entry.core.id != core.id);
        let at = self.timers.partition_point(|entry| entry.expire_at <= expire_at);
        self.timers.insert(
            at,
            Entry {
                expire_at,
                core,
                fire_tx,
            },
        );
    }

    async fn advance(&mut self, duration: Duration) {
        let step = as_nanos(duration);
        let now = self
            .shared
            .right_now
            .fetch_add(step, Ordering::SeqCst)
            .saturating_add(step);
        let at = DateTime::from_timestamp_nanos(now);

        while self.timers.first().is_some_and(|entry| entry.expire_at <= now) {
            let entry = self.timers.remove(0);
            // Stopped, or re-armed by a reset whose registration is still queued.
            let superseded = entry.core.expire_at.load(Ordering::SeqCst) != entry.expire_at;
            if entry.core.is_stopped() || superseded {
                continue;
            }
            entry.core.armed.store(false, Ordering::SeqCst);
            Self::deliver(entry, at).await;
        }
    }

    async fn deliver(entry: Entry, at: DateTime<Utc>) {
        let mut stopped = entry.core.stopped.subscribe();
        let (ack, acked) = oneshot::channel();

        tokio::select! {
            sent = entry.fire_tx.send(Fire { at, ack }) => {
                if sent.is_err() {
                    // Timer dropped.
                    return;
                }
            }
            _ = wait_stopped(&mut stopped) => return,
        }

        tokio::select! {
            _ = acked => {}
            _ = wait_stopped(&mut stopped) => {}
        }
    }
}

/// # Fake Timer
///
/// A timer driven by a [`FakeClock`]. Usually reached through [`Timer::Fake`].
pub struct FakeTimer {
    core: Arc<TimerCore>,
    fire_tx: mpsc::Sender<Fire>,
    fire_rx: mpsc::Receiver<Fire>,
    clock: FakeClock,
}

impl fmt::Debug for FakeTimer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FakeTimer").field("core", &self.core).finish()
    }
}

impl FakeTimer {
    /// Re-registers the timer at `now + duration` and clears the stopped flag.
    pub fn reset(&mut self, duration: Duration) -> bool {
        self.discard_stale_fire();
        self.core.expire_at.store(
            self.clock.right_now().saturating_add(as_nanos(duration)),
            Ordering::SeqCst,
        );
        self.core.armed.store(true, Ordering::SeqCst);
        self.core.stopped.send_replace(false);
        self.clock
            .schedule(Arc::clone(&self.core), self.fire_tx.clone());
        true
    }

    /// Prevents the timer from firing and wakes every `wait_stop` waiter.
    ///
    /// Returns `true` only when the timer was armed, so stopping an already
    /// fired timer reports `false` while still marking it stopped.
    pub fn stop(&mut self) -> bool {
        let was_armed = self.core.armed.swap(false, Ordering::SeqCst);
        let stopped = self.core.stop();
        self.discard_stale_fire();
        was_armed && stopped
    }

    /// Waits for the next fire and acknowledges it to the scheduler.
    pub async fn fired(&mut self) -> DateTime<Utc> {
        loop {
            let Some(fire) = self.fire_rx.recv().await else {
                return pending().await;
            };
            if self.core.is_stopped() {
                continue;
            }
            let _ = fire.ack.send(());
            return fire.at;
        }
    }

    /// A handle for observing this timer from another task.
    pub fn handle(&self) -> FakeTimerHandle {
        FakeTimerHandle {
            core: Arc::clone(&self.core),
        }
    }

    // A fire that was handed over but never awaited must not leak into the
    // next arm. Dropping it also releases a scheduler waiting on its ack.
    fn discard_stale_fire(&mut self) {
        while self.fire_rx.try_recv().is_ok() {}
    }
}

/// # Fake Timer Handle
///
/// A read-only view of a fake timer, used by tests to inspect expiry and stop
/// state from outside the task that owns the timer.
#[derive(Debug, Clone)]
pub struct FakeTimerHandle {
    core: Arc<TimerCore>,
}

impl FakeTimerHandle {
    /// Expiry of the latest arm, in virtual nanoseconds.
    pub fn expire_at(&self) -> i64 {
        self.core.expire_at.load(Ordering::SeqCst)
    }

    /// Whether the timer is currently stopped.
    pub fn stopped(&self) -> bool {
        self.core.is_stopped()
    }

    /// Resolves once the timer is stopped (immediately if it already is).
    pub fn wait_stop(&self) -> impl Future<Output = ()> + Send + 'static {
        let mut stopped = self.core.stopped.subscribe();
        async move { wait_stopped(&mut stopped).await }
    }
}
