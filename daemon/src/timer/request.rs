//! Request-based tick source
//!
//! Mirrors a timer device driven by I/O requests: one request is issued for
//! the interval, its completion is the tick, and a new request has to be
//! issued afterwards. Aborting drops the pending sleep, which deregisters it
//! from the runtime before `restart` returns.

use std::pin::Pin;
use std::time::Duration;

use tokio::time::{sleep, Sleep};

use super::{split_interval, TimerBackend, TimerError};
use crate::config::TimerKind;

/// Single-outstanding-request timer
#[derive(Debug, Default)]
pub struct RequestTimer {
    interval_micros: u32,
    pending: Option<Pin<Box<Sleep>>>,
    /// Completed requests
    fired: u64,
}

impl RequestTimer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    pub fn interval_micros(&self) -> u32 {
        self.interval_micros
    }

    pub fn fired(&self) -> u64 {
        self.fired
    }

    fn issue(&mut self) -> Result<(), TimerError> {
        if self.pending.is_some() {
            return Err(TimerError::RequestOutstanding);
        }
        if self.interval_micros == 0 {
            return Err(TimerError::InvalidInterval(0));
        }

        let (secs, micros) = split_interval(self.interval_micros);
        self.pending = Some(Box::pin(sleep(Duration::new(secs, micros * 1_000))));
        Ok(())
    }

    /// Abort the outstanding request, if any
    fn abort(&mut self) -> bool {
        self.pending.take().is_some()
    }
}

impl TimerBackend for RequestTimer {
    fn kind(&self) -> TimerKind {
        TimerKind::Request
    }

    fn start(&mut self, interval_micros: u32) -> Result<(), TimerError> {
        self.interval_micros = interval_micros;
        self.issue()?;
        tracing::debug!(interval_us = interval_micros, "Request timer started");
        Ok(())
    }

    fn restart(&mut self, interval_micros: u32) -> Result<(), TimerError> {
        let aborted = self.abort();
        tracing::debug!(aborted, interval_us = interval_micros, "Request timer restarting");
        self.interval_micros = interval_micros;
        self.issue()
    }

    fn rearm(&mut self) -> Result<(), TimerError> {
        self.issue()
    }

    fn stop(&mut self) {
        if self.abort() {
            tracing::debug!(fired = self.fired, "Request timer stopped");
        }
    }

    async fn tick(&mut self) {
        match self.pending.as_mut() {
            Some(request) => {
                request.as_mut().await;
                self.pending = None;
                self.fired += 1;
            }
            None => std::future::pending::<()>().await,
        }
    }
}

impl Drop for RequestTimer {
    fn drop(&mut self) {
        self.stop();
    }
}
