//! Daemon event loop
//!
//! [`DaemonLoop`] owns every resource of a running daemon and multiplexes
//! three event sources: cancellation, control requests and timer ticks.
//! Cancellation always wins; queued control requests are drained in arrival
//! order, one reply each, before the loop looks at anything else.
//!
//! Resources are acquired in a fixed order (control channel, input sink,
//! timer) and released in the exact reverse through their own `Drop`s, so a
//! failure part way through [`startup`] only releases what it acquired.

use std::future::Future;

use crate::config::{ConfigByte, Settings};
use crate::control::{
    self, pack_status, ControlCommand, ControlMessage, ControlPort, ControlReply, ControlRequest,
    CONTROL_QUEUE_DEPTH,
};
use crate::dbus::init_dbus_service;
use crate::evdev::UinputSink;
use crate::input::{EventSink, SinkError};
use crate::poll::{PollEngine, PollState};
use crate::registers::{MappedRegisters, RegisterError, RegisterSource};
use crate::timer::{chip::host_chips, select_timer, SelectedTimer, TimerBackend, TimerCandidate, TimerError};

/// Shortest interval `SetInterval` accepts
pub const MIN_INTERVAL_MICROS: u32 = 1_000;

/// Longest interval `SetInterval` accepts; keeps echoes clear of the sentinel
pub const MAX_INTERVAL_MICROS: u32 = 60_000_000;

/// Debug-mode polls between poll-count log lines
const POLL_LOG_EVERY: u64 = 1_000;

/// Why the loop stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// `Quit` received over the control channel
    Quit,
    /// External cancellation
    Cancelled,
}

/// Single-threaded daemon state machine
pub struct DaemonLoop<R, S, T> {
    // Field order is teardown order: timer, sink, control channel
    timer: T,
    sink: S,
    control: ControlPort,
    control_open: bool,
    registers: R,
    engine: PollEngine,
    polls: u64,
}

impl<R, S, T> DaemonLoop<R, S, T>
where
    R: RegisterSource,
    S: EventSink,
    T: TimerBackend,
{
    /// Baseline the registers and start the timer at the configured interval
    pub fn new(
        registers: R,
        sink: S,
        mut timer: T,
        control: ControlPort,
        config: ConfigByte,
    ) -> Result<Self, TimerError> {
        let engine = PollEngine::new(PollState::baseline(&registers, config));
        timer.start(engine.interval_micros())?;

        tracing::info!(
            config = %config,
            timer = %timer.kind(),
            interval_us = engine.interval_micros(),
            "Daemon loop ready"
        );

        Ok(Self {
            timer,
            sink,
            control,
            control_open: true,
            registers,
            engine,
            polls: 0,
        })
    }

    pub fn engine(&self) -> &PollEngine {
        &self.engine
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Run until `Quit` or until `shutdown` completes
    pub async fn run(&mut self, shutdown: impl Future<Output = ()>) -> ExitReason {
        tokio::pin!(shutdown);

        let reason = loop {
            if let Some(reason) = self.step(&mut shutdown).await {
                break reason;
            }
        };

        tracing::info!(?reason, "Daemon loop terminating");
        reason
    }

    /// Wait for one event and handle it
    async fn step<F>(&mut self, shutdown: &mut F) -> Option<ExitReason>
    where
        F: Future<Output = ()> + Unpin,
    {
        tokio::select! {
            biased;

            _ = shutdown => {
                tracing::info!("Cancellation requested");
                Some(ExitReason::Cancelled)
            }

            request = self.control.recv(), if self.control_open => match request {
                Some(request) => self.drain(request),
                None => {
                    tracing::warn!("Control channel closed, continuing without it");
                    self.control_open = false;
                    None
                }
            },

            _ = self.timer.tick() => {
                self.handle_tick();
                None
            }
        }
    }

    /// Reply to `first` and every request queued behind it
    fn drain(&mut self, first: ControlRequest) -> Option<ExitReason> {
        let mut quit = false;
        let mut next = Some(first);

        while let Some(request) = next {
            let (reply, stop) = self.handle_message(request.message);
            quit |= stop;
            request.respond(reply);
            next = self.control.try_recv();
        }

        if quit {
            self.control.close();
            Some(ExitReason::Quit)
        } else {
            None
        }
    }

    /// Apply one control message; returns its reply and whether to quit
    pub fn handle_message(&mut self, message: ControlMessage) -> (ControlReply, bool) {
        match message.command {
            ControlCommand::Quit => {
                tracing::info!("Quit requested");
                (ControlReply::SUCCESS, true)
            }
            ControlCommand::SetConfig => {
                let config = ConfigByte::new(message.value as u8);
                self.set_config(config);
                (ControlReply::new(u32::from(config.bits())), false)
            }
            ControlCommand::SetInterval => (self.set_interval(message.value), false),
            ControlCommand::GetStatus => {
                let status = pack_status(self.engine.config(), self.engine.interval_micros());
                (ControlReply::new(status), false)
            }
            ControlCommand::Unknown(code) => {
                tracing::warn!(command = code, "Unknown control command");
                (ControlReply::ERROR_SENTINEL, false)
            }
        }
    }

    fn set_config(&mut self, config: ConfigByte) {
        let old = self.engine.apply_config(config, &self.registers);

        if old.debug() != config.debug() {
            tracing::info!("Debug mode {}", if config.debug() { "enabled" } else { "disabled" });
        }

        if old.interval_index() != config.interval_index() {
            let micros = config.poll_interval_micros();
            match self.timer.restart(micros) {
                Ok(()) => self.engine.set_interval_micros(micros),
                Err(e) => {
                    tracing::error!(interval_us = micros, "Failed to restart timer: {}", e);
                }
            }
        }

        tracing::info!(
            config = %config,
            wheel = config.wheel_enabled(),
            buttons = config.buttons_enabled(),
            interval_us = self.engine.interval_micros(),
            "Configuration updated"
        );
    }

    fn set_interval(&mut self, micros: u32) -> ControlReply {
        if !(MIN_INTERVAL_MICROS..=MAX_INTERVAL_MICROS).contains(&micros) {
            tracing::warn!(interval_us = micros, "Rejecting poll interval out of range");
            return ControlReply::ERROR_SENTINEL;
        }

        match self.timer.restart(micros) {
            Ok(()) => {
                self.engine.set_interval_micros(micros);
                tracing::info!(interval_us = micros, "Poll interval updated");
                ControlReply::new(micros)
            }
            Err(e) => {
                tracing::error!(interval_us = micros, "Failed to restart timer: {}", e);
                ControlReply::ERROR_SENTINEL
            }
        }
    }

    fn handle_tick(&mut self) {
        match self.engine.on_tick(&self.registers, &mut self.sink) {
            Ok(report) if report.events > 0 => {
                tracing::trace!(
                    wheel_delta = report.wheel_delta,
                    button_edges = report.button_edges,
                    events = report.events,
                    "Tick injected events"
                );
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!("Event injection failed, skipping rest of tick: {}", e);
            }
        }

        if let Err(e) = self.timer.rearm() {
            tracing::error!("Failed to re-arm timer: {}", e);
        }

        if self.engine.config().debug() {
            self.polls += 1;
            if self.polls % POLL_LOG_EVERY == 0 {
                tracing::info!(
                    polls = self.polls,
                    interval_ms = self.engine.interval_micros() / 1_000,
                    "Timer polls"
                );
            }
        }
    }
}

// ============================================================================
// Host startup
// ============================================================================

/// Daemon loop over the host collaborators
pub type HostLoop = DaemonLoop<MappedRegisters, UinputSink, SelectedTimer>;

/// A started daemon with its bus registration
pub struct HostDaemon {
    pub daemon: HostLoop,
    // Released after the loop, as the first resource acquired
    _bus: zbus::Connection,
}

impl HostDaemon {
    pub async fn run(&mut self, shutdown: impl Future<Output = ()>) -> ExitReason {
        self.daemon.run(shutdown).await
    }
}

/// Acquire every host resource and start the timer
///
/// The register window is mapped first, then the control channel, the input
/// sink and the timer. Any failure drops what was already acquired, in
/// reverse order.
pub async fn startup(settings: &Settings) -> Result<HostDaemon, StartupError> {
    let config = settings.config();

    let registers = MappedRegisters::open(&settings.memory_device, settings.register_base)?;

    let (handle, port) = control::channel(CONTROL_QUEUE_DEPTH);
    let bus = init_dbus_service(handle).await.map_err(StartupError::Control)?;

    let sink = UinputSink::open(&settings.device_name, settings.keyboard_device.as_deref())?;

    let chips = host_chips();
    let timer = select_timer(settings.timer, &TimerCandidate::all(&chips));

    let daemon = DaemonLoop::new(registers, sink, timer, port, config)?;

    Ok(HostDaemon { daemon, _bus: bus })
}

/// Startup error type
#[derive(Debug)]
pub enum StartupError {
    /// Register window could not be mapped
    Registers(RegisterError),
    /// Control channel could not be published
    Control(zbus::Error),
    /// Input sink could not be opened
    Sink(SinkError),
    /// Timer could not be started
    Timer(TimerError),
}

impl std::fmt::Display for StartupError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StartupError::Registers(e) => write!(f, "register access failed: {}", e),
            StartupError::Control(e) => write!(f, "control channel unavailable: {}", e),
            StartupError::Sink(e) => write!(f, "input sink unavailable: {}", e),
            StartupError::Timer(e) => write!(f, "timer unavailable: {}", e),
        }
    }
}

impl std::error::Error for StartupError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StartupError::Registers(e) => Some(e),
            StartupError::Control(e) => Some(e),
            StartupError::Sink(e) => Some(e),
            StartupError::Timer(e) => Some(e),
        }
    }
}

impl From<RegisterError> for StartupError {
    fn from(e: RegisterError) -> Self {
        StartupError::Registers(e)
    }
}

impl From<SinkError> for StartupError {
    fn from(e: SinkError) -> Self {
        StartupError::Sink(e)
    }
}

impl From<TimerError> for StartupError {
    fn from(e: TimerError) -> Self {
        StartupError::Timer(e)
    }
}
