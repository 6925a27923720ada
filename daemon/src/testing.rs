//! Test doubles shared by the unit tests

use std::cell::Cell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use crate::config::TimerKind;
use crate::input::{EventSink, InputEventDescriptor, SinkError};
use crate::timer::{TimerBackend, TimerError};

/// Sink that accepts `limit` events and fails every one after
pub struct FailingSink {
    limit: usize,
    pub accepted: usize,
}

impl FailingSink {
    pub fn after(limit: usize) -> Self {
        Self { limit, accepted: 0 }
    }
}

impl EventSink for FailingSink {
    fn inject(&mut self, _event: &InputEventDescriptor) -> Result<(), SinkError> {
        if self.accepted >= self.limit {
            return Err(SinkError::IoError(std::io::Error::other("injection failed")));
        }
        self.accepted += 1;
        Ok(())
    }
}

/// Sink reporting a fixed qualifier and counting how often it is asked
pub struct QualifiedSink {
    qualifier: u16,
    pub events: Vec<InputEventDescriptor>,
    pub qualifier_reads: Cell<usize>,
}

impl QualifiedSink {
    pub fn new(qualifier: u16) -> Self {
        Self {
            qualifier,
            events: Vec::new(),
            qualifier_reads: Cell::new(0),
        }
    }
}

impl EventSink for QualifiedSink {
    fn inject(&mut self, event: &InputEventDescriptor) -> Result<(), SinkError> {
        self.events.push(*event);
        Ok(())
    }

    fn qualifier(&self) -> u16 {
        self.qualifier_reads.set(self.qualifier_reads.get() + 1);
        self.qualifier
    }
}

/// Sink whose events stay readable after the daemon took ownership of it
#[derive(Clone, Default)]
pub struct SharedSink {
    events: Arc<Mutex<Vec<InputEventDescriptor>>>,
}

impl SharedSink {
    pub fn events(&self) -> Vec<InputEventDescriptor> {
        self.events.lock().unwrap().clone()
    }
}

impl EventSink for SharedSink {
    fn inject(&mut self, event: &InputEventDescriptor) -> Result<(), SinkError> {
        self.events.lock().unwrap().push(*event);
        Ok(())
    }
}

/// Call made on a [`ManualTimer`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerCall {
    Start(u32),
    Restart(u32),
    Rearm,
    Stop,
}

/// Timer fired by hand through its [`TimerDriver`]
pub struct ManualTimer {
    ticks: mpsc::UnboundedReceiver<()>,
    calls: Arc<Mutex<Vec<TimerCall>>>,
    fail_restart: Arc<AtomicBool>,
}

/// Test-side control of a [`ManualTimer`]
#[derive(Clone)]
pub struct TimerDriver {
    ticks: mpsc::UnboundedSender<()>,
    calls: Arc<Mutex<Vec<TimerCall>>>,
    fail_restart: Arc<AtomicBool>,
}

impl ManualTimer {
    pub fn new() -> (Self, TimerDriver) {
        let (tx, rx) = mpsc::unbounded_channel();
        let calls = Arc::new(Mutex::new(Vec::new()));
        let fail_restart = Arc::new(AtomicBool::new(false));
        (
            Self {
                ticks: rx,
                calls: Arc::clone(&calls),
                fail_restart: Arc::clone(&fail_restart),
            },
            TimerDriver { ticks: tx, calls, fail_restart },
        )
    }

    fn record(&self, call: TimerCall) {
        self.calls.lock().unwrap().push(call);
    }
}

impl TimerDriver {
    /// Queue one tick
    pub fn fire(&self) {
        let _ = self.ticks.send(());
    }

    /// Make every later `restart` fail
    pub fn fail_restarts(&self) {
        self.fail_restart.store(true, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<TimerCall> {
        self.calls.lock().unwrap().clone()
    }

    /// Restarts recorded so far, in order
    pub fn restarts(&self) -> Vec<u32> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                TimerCall::Restart(micros) => Some(micros),
                _ => None,
            })
            .collect()
    }
}

impl TimerBackend for ManualTimer {
    fn kind(&self) -> TimerKind {
        TimerKind::Request
    }

    fn start(&mut self, interval_micros: u32) -> Result<(), TimerError> {
        self.record(TimerCall::Start(interval_micros));
        Ok(())
    }

    fn restart(&mut self, interval_micros: u32) -> Result<(), TimerError> {
        self.record(TimerCall::Restart(interval_micros));
        if self.fail_restart.load(Ordering::SeqCst) {
            return Err(TimerError::Released);
        }
        Ok(())
    }

    fn rearm(&mut self) -> Result<(), TimerError> {
        self.record(TimerCall::Rearm);
        Ok(())
    }

    fn stop(&mut self) {
        self.record(TimerCall::Stop);
    }

    async fn tick(&mut self) {
        if self.ticks.recv().await.is_none() {
            std::future::pending::<()>().await;
        }
    }
}
