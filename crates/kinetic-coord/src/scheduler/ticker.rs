//! Repeating timers behind a trait so scheduling can be driven by hand.

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};

/// Callback invoked on every tick.
pub type TickFn = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// Cancels its timer when [`TimerHandle::cancel`] is called or the handle is dropped.
#[derive(Debug)]
pub struct TimerHandle {
    period: Duration,
    cancel: watch::Sender<bool>,
}

impl TimerHandle {
    /// A handle and the receiver its timer should watch.
    pub fn channel(period: Duration) -> (Self, watch::Receiver<bool>) {
        let (cancel, cancelled) = watch::channel(false);
        (Self { period, cancel }, cancelled)
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn cancel(&self) {
        let _ = self.cancel.send(true);
    }
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Source of repeating timers.
pub trait Ticker: Send + Sync {
    /// Invoke `tick` every `period`, first after one full period.
    fn every(&self, period: Duration, tick: TickFn) -> TimerHandle;
}

/// Timers backed by `tokio::time::interval`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioTicker;

impl Ticker for TokioTicker {
    fn every(&self, period: Duration, tick: TickFn) -> TimerHandle {
        let period = period.max(Duration::from_millis(1));
        let (handle, mut cancelled) = TimerHandle::channel(period);

        tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = interval.tick() => tick().await,
                    changed = cancelled.changed() => {
                        if changed.is_err() || *cancelled.borrow() {
                            break;
                        }
                    }
                }
            }
        });

        handle
    }
}

struct ManualTimer {
    period: Duration,
    tick: TickFn,
    cancelled: watch::Receiver<bool>,
}

impl ManualTimer {
    fn is_active(&self) -> bool {
        !*self.cancelled.borrow() && self.cancelled.has_changed().is_ok()
    }
}

/// Ticker that records timers and fires them only on request.
#[derive(Clone, Default)]
pub struct ManualTicker {
    timers: Arc<Mutex<Vec<ManualTimer>>>,
}

impl ManualTicker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Periods of every timer that has not been cancelled.
    pub fn periods(&self) -> Vec<Duration> {
        self.timers
            .lock()
            .iter()
            .filter(|t| t.is_active())
            .map(|t| t.period)
            .collect()
    }

    pub fn active_count(&self) -> usize {
        self.timers.lock().iter().filter(|t| t.is_active()).count()
    }

    /// Fire every active timer once, returning how many fired.
    pub async fn fire_all(&self) -> usize {
        let ticks: Vec<TickFn> = {
            let mut timers = self.timers.lock();
            timers.retain(|t| t.is_active());
            timers.iter().map(|t| t.tick.clone()).collect()
        };
        for tick in &ticks {
            tick().await;
        }
        ticks.len()
    }
}

impl Ticker for ManualTicker {
    fn every(&self, period: Duration, tick: TickFn) -> TimerHandle {
        let (handle, cancelled) = TimerHandle::channel(period);
        self.timers.lock().push(ManualTimer {
            period,
            tick,
            cancelled,
        });
        handle
    }
}
