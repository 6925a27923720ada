//! Periodic tick sources
//!
//! Two interchangeable backends drive the poll loop:
//! - [`RequestTimer`]: one outstanding timed request at a time, re-issued
//!   after every firing.
//! - [`InterruptTimer`]: a countdown channel on a timer chip, reloaded by an
//!   interrupt handler and self-repeating.
//!
//! [`select_timer`] picks one at startup and falls back to the request
//! backend when no countdown channel is free.

pub mod chip;
pub mod interrupt;
pub mod request;

use std::future::Future;

pub use chip::{Channel, ChipRegister, ChipRegisters, SoftChip, TimerChip, VectorBusy, VectorHandler};
pub use interrupt::{InterruptTimer, TimerCandidate};
pub use request::RequestTimer;

use crate::config::TimerKind;

/// Capability shared by both tick sources
pub trait TimerBackend: Send {
    /// Which backend this is
    fn kind(&self) -> TimerKind;

    /// Begin ticking every `interval_micros`
    fn start(&mut self, interval_micros: u32) -> Result<(), TimerError>;

    /// Cancel the current period and start again with a new interval
    ///
    /// Returns only once the previous period can no longer fire.
    fn restart(&mut self, interval_micros: u32) -> Result<(), TimerError>;

    /// Arm the next tick after one has been consumed
    fn rearm(&mut self) -> Result<(), TimerError>;

    /// Stop ticking; safe to call repeatedly or before `start`
    fn stop(&mut self);

    /// Wait for the next tick
    fn tick(&mut self) -> impl Future<Output = ()> + Send;
}

/// Tick source chosen at startup
pub enum SelectedTimer {
    Request(RequestTimer),
    Interrupt(InterruptTimer),
}

impl TimerBackend for SelectedTimer {
    fn kind(&self) -> TimerKind {
        match self {
            SelectedTimer::Request(t) => t.kind(),
            SelectedTimer::Interrupt(t) => t.kind(),
        }
    }

    fn start(&mut self, interval_micros: u32) -> Result<(), TimerError> {
        match self {
            SelectedTimer::Request(t) => t.start(interval_micros),
            SelectedTimer::Interrupt(t) => t.start(interval_micros),
        }
    }

    fn restart(&mut self, interval_micros: u32) -> Result<(), TimerError> {
        match self {
            SelectedTimer::Request(t) => t.restart(interval_micros),
            SelectedTimer::Interrupt(t) => t.restart(interval_micros),
        }
    }

    fn rearm(&mut self) -> Result<(), TimerError> {
        match self {
            SelectedTimer::Request(t) => t.rearm(),
            SelectedTimer::Interrupt(t) => t.rearm(),
        }
    }

    fn stop(&mut self) {
        match self {
            SelectedTimer::Request(t) => t.stop(),
            SelectedTimer::Interrupt(t) => t.stop(),
        }
    }

    async fn tick(&mut self) {
        match self {
            SelectedTimer::Request(t) => t.tick().await,
            SelectedTimer::Interrupt(t) => t.tick().await,
        }
    }
}

/// Pick the tick source for `kind`
///
/// An interrupt timer that cannot be acquired is reported and replaced by
/// the request timer.
pub fn select_timer(kind: TimerKind, candidates: &[TimerCandidate]) -> SelectedTimer {
    match kind {
        TimerKind::Request => SelectedTimer::Request(RequestTimer::new()),
        TimerKind::Interrupt => match InterruptTimer::acquire(candidates) {
            Ok(timer) => SelectedTimer::Interrupt(timer),
            Err(e) => {
                tracing::warn!("Interrupt timer unavailable ({}), falling back to request timer", e);
                SelectedTimer::Request(RequestTimer::new())
            }
        },
    }
}

/// Split an interval into whole seconds and remaining microseconds
pub const fn split_interval(interval_micros: u32) -> (u64, u32) {
    ((interval_micros / 1_000_000) as u64, interval_micros % 1_000_000)
}

/// Timer error type
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimerError {
    /// Every countdown channel is already in use
    Unavailable,
    /// A request is already pending; only one may be outstanding
    RequestOutstanding,
    /// The timer resource was released by `stop`
    Released,
    /// Interval the timer cannot produce
    InvalidInterval(u32),
}

impl std::fmt::Display for TimerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TimerError::Unavailable => write!(f, "no timer resource available"),
            TimerError::RequestOutstanding => write!(f, "timer request already outstanding"),
            TimerError::Released => write!(f, "timer resource already released"),
            TimerError::InvalidInterval(micros) => write!(f, "invalid interval {}us", micros),
        }
    }
}

impl std::error::Error for TimerError {}
