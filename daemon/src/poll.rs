//! Wheel delta and button edge detection
//!
//! [`PollEngine`] keeps the last observed register values and turns each
//! tick's fresh reads into synthesized events. Each logical change produces a
//! raw-key event immediately followed by a pointer-device event with the same
//! code and qualifier.

use crate::config::ConfigByte;
use crate::input::{
    EventClass, EventSink, InputEventDescriptor, SinkError, BUTTON_FIFTH, BUTTON_FOURTH,
    UP_PREFIX, WHEEL_DOWN, WHEEL_UP,
};
use crate::registers::RegisterSource;

/// Two-bit button mask bits and their event codes
const BUTTONS: [(u16, u16, &str); 2] = [(0b01, BUTTON_FOURTH, "Button 4"), (0b10, BUTTON_FIFTH, "Button 5")];

/// Poll state owned by the daemon loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollState {
    pub last_wheel: i8,
    pub last_buttons: u16,
    pub config: ConfigByte,
    pub interval_micros: u32,
}

impl PollState {
    /// Baseline from a fresh hardware read so the first tick reports nothing
    pub fn baseline<R: RegisterSource + ?Sized>(registers: &R, config: ConfigByte) -> Self {
        Self {
            last_wheel: registers.wheel_counter(),
            last_buttons: registers.buttons(),
            config,
            interval_micros: config.poll_interval_micros(),
        }
    }
}

/// Events emitted by one tick
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Normalized wheel delta (0 when wheel disabled or idle)
    pub wheel_delta: i8,
    /// Button bits that changed
    pub button_edges: u16,
    /// Descriptors handed to the sink
    pub events: usize,
}

/// Normalized wheel movement between two counter reads
///
/// Wrapping subtraction keeps the result in the signed 8-bit range, so
/// `last + delta ≡ current (mod 256)` across hardware counter wraparound.
pub const fn wheel_delta(last: i8, current: i8) -> i8 {
    current.wrapping_sub(last)
}

/// Delta and edge detector
#[derive(Debug)]
pub struct PollEngine {
    state: PollState,
}

impl PollEngine {
    pub fn new(state: PollState) -> Self {
        Self { state }
    }

    pub fn state(&self) -> &PollState {
        &self.state
    }

    pub fn config(&self) -> ConfigByte {
        self.state.config
    }

    pub fn interval_micros(&self) -> u32 {
        self.state.interval_micros
    }

    pub fn set_interval_micros(&mut self, micros: u32) {
        self.state.interval_micros = micros;
    }

    /// Replace the configuration
    ///
    /// A feature switched from disabled to enabled is re-baselined from the
    /// hardware, so movement that happened while it was off is not replayed.
    /// Returns the previous configuration.
    pub fn apply_config<R: RegisterSource + ?Sized>(
        &mut self,
        config: ConfigByte,
        registers: &R,
    ) -> ConfigByte {
        let old = self.state.config;

        if config.wheel_enabled() && !old.wheel_enabled() {
            self.state.last_wheel = registers.wheel_counter();
            tracing::debug!(counter = self.state.last_wheel, "Wheel re-baselined");
        }
        if config.buttons_enabled() && !old.buttons_enabled() {
            self.state.last_buttons = registers.buttons();
            tracing::debug!(mask = self.state.last_buttons, "Buttons re-baselined");
        }

        self.state.config = config;
        old
    }

    /// Poll the registers once and inject the resulting events
    ///
    /// A sink failure aborts the rest of the tick; state already committed
    /// for the current read stays committed.
    pub fn on_tick<R, S>(&mut self, registers: &R, sink: &mut S) -> Result<TickReport, SinkError>
    where
        R: RegisterSource + ?Sized,
        S: EventSink + ?Sized,
    {
        let qualifier = sink.qualifier();
        let mut report = TickReport::default();

        if self.state.config.wheel_enabled() {
            self.process_wheel(registers, sink, qualifier, &mut report)?;
        }

        if self.state.config.buttons_enabled() {
            self.process_buttons(registers, sink, qualifier, &mut report)?;
        }

        Ok(report)
    }

    fn process_wheel<R, S>(
        &mut self,
        registers: &R,
        sink: &mut S,
        qualifier: u16,
        report: &mut TickReport,
    ) -> Result<(), SinkError>
    where
        R: RegisterSource + ?Sized,
        S: EventSink + ?Sized,
    {
        let current = registers.wheel_counter();
        let delta = wheel_delta(self.state.last_wheel, current);
        self.state.last_wheel = current;
        report.wheel_delta = delta;

        if delta == 0 {
            return Ok(());
        }

        let code = if delta > 0 { WHEEL_UP } else { WHEEL_DOWN };
        let count = delta.unsigned_abs();

        if self.state.config.debug() {
            tracing::info!(
                delta,
                dir = if code == WHEEL_UP { "UP" } else { "DOWN" },
                count,
                "Wheel"
            );
        }

        for _ in 0..count {
            report.events += self.inject_pair(sink, code, qualifier)?;
        }

        Ok(())
    }

    fn process_buttons<R, S>(
        &mut self,
        registers: &R,
        sink: &mut S,
        qualifier: u16,
        report: &mut TickReport,
    ) -> Result<(), SinkError>
    where
        R: RegisterSource + ?Sized,
        S: EventSink + ?Sized,
    {
        let current = registers.buttons();
        let changed = current ^ self.state.last_buttons;
        self.state.last_buttons = current;
        report.button_edges = changed;

        for (bit, button, name) in BUTTONS {
            if changed & bit == 0 {
                continue;
            }

            let pressed = current & bit != 0;
            let code = if pressed { button } else { button | UP_PREFIX };

            if self.state.config.debug() {
                tracing::info!("{} {}", name, if pressed { "pressed" } else { "released" });
            }

            report.events += self.inject_pair(sink, code, qualifier)?;
        }

        Ok(())
    }

    /// Raw-key first, pointer-device second, same code and qualifier
    fn inject_pair<S: EventSink + ?Sized>(
        &self,
        sink: &mut S,
        code: u16,
        qualifier: u16,
    ) -> Result<usize, SinkError> {
        for class in [EventClass::RawKeyLike, EventClass::PointerDeviceLike] {
            let event = InputEventDescriptor::new(class, code, qualifier);
            if self.state.config.debug() {
                tracing::info!(
                    class = format!("0x{:02x}", class.id()),
                    code = format!("0x{:02x}", code),
                    qualifier = format!("0x{:04x}", qualifier),
                    "injectEvent"
                );
            }
            sink.inject(&event)?;
        }
        Ok(2)
    }
}
