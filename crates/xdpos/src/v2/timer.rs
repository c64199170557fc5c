//! Exponential-backoff countdown timer driving round timeouts.
//!
//! The timer is a single-fire countdown running on its own thread. The
//! driver selects over {reset, quit, fire}: a reset restarts the countdown
//! with a freshly computed duration, quit shuts the thread down
//! synchronously, and on fire the user callback runs and the countdown
//! rearms with the same parameters, so a node that stays behind keeps
//! firing.
//!
//! The countdown duration grows exponentially with how far the node's
//! current round has moved past the round of its highest QC:
//! `d * base^min(max_exponent, current_round - highest_round)`.

use crate::errors::{XDPoSError, XDPoSResult};
use crate::v2::Round;
use parking_lot::Mutex;
use std::{
    sync::{
        mpsc::{self, RecvTimeoutError, Sender},
        Arc,
    },
    thread::JoinHandle,
    time::{Duration, Instant},
};
use tracing::{debug, trace};

/// Callback invoked when the countdown fires. Receives the fire time and the
/// context handed to the most recent [`ExpCountdown::reset`].
pub type OnTimeoutFn<C> = dyn Fn(Instant, &C) + Send + Sync;

enum Cmd<C> {
    Reset { ctx: C, current_round: Round, highest_round: Round },
    Quit,
}

struct Driver<C> {
    tx: Sender<Cmd<C>>,
    handle: JoinHandle<()>,
}

/// Single-fire countdown timer with exponential backoff.
///
/// The fire callback is installed separately via
/// [`ExpCountdown::set_on_timeout`]; a countdown without one fires into the
/// void.
pub struct ExpCountdown<C: Send + 'static> {
    base_duration: Duration,
    base: f64,
    max_exponent: u32,
    on_timeout: Arc<Mutex<Option<Arc<OnTimeoutFn<C>>>>>,
    driver: Mutex<Option<Driver<C>>>,
}

impl<C: Send + 'static> std::fmt::Debug for ExpCountdown<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExpCountdown")
            .field("base_duration", &self.base_duration)
            .field("base", &self.base)
            .field("max_exponent", &self.max_exponent)
            .field("running", &self.driver.lock().is_some())
            .finish()
    }
}

impl<C: Send + 'static> ExpCountdown<C> {
    /// Create a countdown with backoff parameters. Fails when `base < 1.0`,
    /// which would shrink timeouts instead of growing them.
    pub fn new_exp_countdown(
        base_duration: Duration,
        base: f64,
        max_exponent: u32,
    ) -> XDPoSResult<Self> {
        if base < 1.0 {
            return Err(XDPoSError::InvalidConfig(format!(
                "countdown backoff base {base} must be >= 1.0"
            )));
        }
        Ok(Self {
            base_duration,
            base,
            max_exponent,
            on_timeout: Arc::new(Mutex::new(None)),
            driver: Mutex::new(None),
        })
    }

    /// Install (or replace) the fire callback.
    pub fn set_on_timeout(&self, on_timeout: Arc<OnTimeoutFn<C>>) {
        *self.on_timeout.lock() = Some(on_timeout);
    }

    /// The countdown duration for the given round pair:
    /// `d * base^min(max_exponent, max(0, current_round - highest_round))`.
    pub fn duration_for(&self, current_round: Round, highest_round: Round) -> Duration {
        let exp = current_round.saturating_sub(highest_round).min(self.max_exponent as u64);
        self.base_duration.mul_f64(self.base.powi(exp as i32))
    }

    /// Restart the countdown for `(current_round, highest_round)`, handing
    /// `ctx` to the callback when the countdown fires. The first reset spawns
    /// the driver thread.
    pub fn reset(&self, ctx: C, current_round: Round, highest_round: Round) {
        let mut driver = self.driver.lock();

        let mut ctx = ctx;
        if let Some(running) = driver.as_ref() {
            match running.tx.send(Cmd::Reset { ctx, current_round, highest_round }) {
                Ok(()) => {
                    trace!(target: "xdpos::timer", current_round, highest_round, "countdown reset");
                    return;
                }
                // The driver thread is gone; reclaim the context and respawn.
                Err(mpsc::SendError(Cmd::Reset { ctx: reclaimed, .. })) => {
                    ctx = reclaimed;
                    *driver = None;
                }
                Err(mpsc::SendError(Cmd::Quit)) => unreachable!("reset does not send quit"),
            }
        }

        let (tx, rx) = mpsc::channel::<Cmd<C>>();
        let on_timeout = Arc::clone(&self.on_timeout);
        let base_duration = self.base_duration;
        let base = self.base;
        let max_exponent = self.max_exponent;
        let mut duration = self.duration_for(current_round, highest_round);
        let mut current_ctx = ctx;

        debug!(target: "xdpos::timer", current_round, highest_round, ?duration, "countdown started");

        let handle = std::thread::spawn(move || loop {
            match rx.recv_timeout(duration) {
                Ok(Cmd::Reset { ctx, current_round, highest_round }) => {
                    let exp = current_round.saturating_sub(highest_round).min(max_exponent as u64);
                    duration = base_duration.mul_f64(base.powi(exp as i32));
                    current_ctx = ctx;
                }
                Ok(Cmd::Quit) | Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => {
                    // Fire and rearm with the same duration; the node keeps
                    // timing out until a reset moves it forward.
                    let callback = on_timeout.lock().clone();
                    if let Some(callback) = callback {
                        callback(Instant::now(), &current_ctx);
                    }
                }
            }
        });

        *driver = Some(Driver { tx, handle });
    }

    /// Shut the driver thread down, waiting for it to exit. A timer that was
    /// never reset is a no-op.
    pub fn stop_timer(&self) {
        let stopped = self.driver.lock().take();
        if let Some(Driver { tx, handle }) = stopped {
            let _ = tx.send(Cmd::Quit);
            let _ = handle.join();
            debug!(target: "xdpos::timer", "countdown stopped");
        }
    }
}

impl<C: Send + 'static> Drop for ExpCountdown<C> {
    fn drop(&mut self) {
        self.stop_timer();
    }
}
