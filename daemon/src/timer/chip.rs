//! Countdown timer chips
//!
//! A chip has two independent countdown channels (A and B). Each channel has
//! a control register and a 16-bit countdown split into low/high bytes, and
//! raises its own interrupt vector on underflow. [`TimerChip`] is the
//! vector-installation and interrupt-masking facility the interrupt tick
//! source needs.
//!
//! [`SoftChip`] emulates such a chip on the host: a driver thread per
//! installed vector counts the loaded value down at the E-clock rate and
//! dispatches the handler with the chip's interrupt mask held. The loaded
//! countdown is consumed by the underflow, so a handler that does not reload
//! it stops the channel. Setting the start bit again begins a fresh
//! countdown: one already in flight is discarded without an underflow.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Chip E-clock frequency (PAL)
pub const ECLOCK_HZ: u64 = 709_379;

/// Control register start bit
pub const CR_START: u8 = 0x01;

/// Control register A bits kept when stopping: TODIN | SPMODE | OUTMODE | PBON
pub const STOP_A_MASK: u8 = 0xC6;

/// Control register B bits kept when stopping: ALARM | OUTMODE | PBON
pub const STOP_B_MASK: u8 = 0x86;

/// How often an idle driver thread re-checks its channel
const IDLE_POLL: Duration = Duration::from_millis(1);

/// Countdown channel on a chip
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    A,
    B,
}

impl Channel {
    pub const fn index(self) -> usize {
        match self {
            Channel::A => 0,
            Channel::B => 1,
        }
    }

    pub const fn control(self) -> ChipRegister {
        match self {
            Channel::A => ChipRegister::ControlA,
            Channel::B => ChipRegister::ControlB,
        }
    }

    pub const fn low(self) -> ChipRegister {
        match self {
            Channel::A => ChipRegister::TimerALow,
            Channel::B => ChipRegister::TimerBLow,
        }
    }

    pub const fn high(self) -> ChipRegister {
        match self {
            Channel::A => ChipRegister::TimerAHigh,
            Channel::B => ChipRegister::TimerBHigh,
        }
    }

    pub const fn stop_mask(self) -> u8 {
        match self {
            Channel::A => STOP_A_MASK,
            Channel::B => STOP_B_MASK,
        }
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Channel::A => write!(f, "A"),
            Channel::B => write!(f, "B"),
        }
    }
}

/// Registers of a countdown chip
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChipRegister {
    TimerALow,
    TimerAHigh,
    TimerBLow,
    TimerBHigh,
    ControlA,
    ControlB,
}

impl ChipRegister {
    const COUNT: usize = 6;

    const fn index(self) -> usize {
        self as usize
    }

    /// Channel whose control register this is
    const fn controls(self) -> Option<Channel> {
        match self {
            ChipRegister::ControlA => Some(Channel::A),
            ChipRegister::ControlB => Some(Channel::B),
            _ => None,
        }
    }
}

/// Byte access to chip registers
pub trait ChipRegisters {
    fn read(&self, reg: ChipRegister) -> u8;
    fn write(&self, reg: ChipRegister, value: u8);
}

/// Interrupt handler; runs in interrupt context with the chip's registers
pub type VectorHandler = Arc<dyn Fn(&dyn ChipRegisters) + Send + Sync>;

/// Vector already owned by someone else
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VectorBusy;

impl std::fmt::Display for VectorBusy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "interrupt vector already in use")
    }
}

impl std::error::Error for VectorBusy {}

/// Countdown chip with per-channel interrupt vectors
pub trait TimerChip: ChipRegisters + Send + Sync {
    fn name(&self) -> &str;

    /// Install `handler` on the channel's underflow vector
    fn add_vector(&self, channel: Channel, handler: VectorHandler) -> Result<(), VectorBusy>;

    /// Remove the channel's handler; no-op when none is installed
    fn remove_vector(&self, channel: Channel);

    /// Run `f` with this chip's interrupts masked
    fn masked(&self, f: &mut dyn FnMut(&dyn ChipRegisters));
}

// ============================================================================
// Host emulation
// ============================================================================

struct ChipInner {
    name: String,
    regs: [AtomicU8; ChipRegister::COUNT],
    vectors: Mutex<[Option<VectorHandler>; 2]>,
    installed: [AtomicBool; 2],
    /// Start-bit rising edges per channel
    starts: [AtomicU32; 2],
    /// Held by the dispatcher while a handler runs
    mask: Mutex<()>,
}

impl ChipInner {
    fn lock_mask(&self) -> MutexGuard<'_, ()> {
        self.mask.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn countdown(&self, channel: Channel) -> u16 {
        u16::from_le_bytes([self.read(channel.low()), self.read(channel.high())])
    }
}

impl ChipRegisters for ChipInner {
    fn read(&self, reg: ChipRegister) -> u8 {
        self.regs[reg.index()].load(Ordering::Acquire)
    }

    fn write(&self, reg: ChipRegister, value: u8) {
        let previous = self.regs[reg.index()].swap(value, Ordering::AcqRel);
        if let Some(channel) = reg.controls() {
            if previous & CR_START == 0 && value & CR_START != 0 {
                self.starts[channel.index()].fetch_add(1, Ordering::AcqRel);
            }
        }
    }
}

/// Emulated countdown chip
pub struct SoftChip {
    inner: Arc<ChipInner>,
    drivers: Mutex<[Option<JoinHandle<()>>; 2]>,
}

impl SoftChip {
    pub fn new(name: &str) -> Self {
        Self {
            inner: Arc::new(ChipInner {
                name: name.to_string(),
                regs: Default::default(),
                vectors: Mutex::new([None, None]),
                installed: Default::default(),
                starts: Default::default(),
                mask: Mutex::new(()),
            }),
            drivers: Mutex::new([None, None]),
        }
    }

    /// Whether a handler is installed on `channel`
    pub fn is_installed(&self, channel: Channel) -> bool {
        self.inner.installed[channel.index()].load(Ordering::Acquire)
    }

    fn join_driver(&self, channel: Channel) {
        let handle = self
            .drivers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)[channel.index()]
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                tracing::error!(chip = %self.inner.name, %channel, "Timer driver thread panicked");
            }
        }
    }
}

/// Count a channel down and dispatch its vector until it is removed
fn drive_channel(inner: Arc<ChipInner>, channel: Channel) {
    let idx = channel.index();

    while inner.installed[idx].load(Ordering::Acquire) {
        let started = inner.starts[idx].load(Ordering::Acquire);
        let running = inner.read(channel.control()) & CR_START != 0;
        let count = inner.countdown(channel);
        if !running || count == 0 {
            thread::sleep(IDLE_POLL);
            continue;
        }

        thread::sleep(countdown_duration(count));

        let _mask = inner.lock_mask();

        // Restarted while counting: the new countdown runs from the restart
        if inner.starts[idx].load(Ordering::Acquire) != started {
            continue;
        }

        inner.write(channel.low(), 0);
        inner.write(channel.high(), 0);

        if inner.read(channel.control()) & CR_START == 0 {
            continue;
        }

        let handler = inner
            .vectors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)[idx]
            .clone();
        if let Some(handler) = handler {
            handler(&*inner);
        }
    }
}

/// Wall time of one countdown from `count`
pub fn countdown_duration(count: u16) -> Duration {
    Duration::from_nanos(u64::from(count) * 1_000_000_000 / ECLOCK_HZ)
}

impl ChipRegisters for SoftChip {
    fn read(&self, reg: ChipRegister) -> u8 {
        self.inner.read(reg)
    }

    fn write(&self, reg: ChipRegister, value: u8) {
        self.inner.write(reg, value);
    }
}

impl TimerChip for SoftChip {
    fn name(&self) -> &str {
        &self.inner.name
    }

    fn add_vector(&self, channel: Channel, handler: VectorHandler) -> Result<(), VectorBusy> {
        let idx = channel.index();
        {
            let mut vectors = self
                .inner
                .vectors
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if vectors[idx].is_some() {
                return Err(VectorBusy);
            }
            vectors[idx] = Some(handler);
        }

        // A previous driver for this channel may still be winding down
        self.join_driver(channel);
        self.inner.installed[idx].store(true, Ordering::Release);

        let inner = Arc::clone(&self.inner);
        let driver = thread::Builder::new()
            .name(format!("{}-timer-{}", self.inner.name, channel))
            .spawn(move || drive_channel(inner, channel));

        match driver {
            Ok(handle) => {
                self.drivers.lock().unwrap_or_else(PoisonError::into_inner)[idx] = Some(handle);
                Ok(())
            }
            Err(e) => {
                tracing::error!(chip = %self.inner.name, %channel, "Failed to spawn timer driver: {}", e);
                self.inner.installed[idx].store(false, Ordering::Release);
                self.inner.vectors.lock().unwrap_or_else(PoisonError::into_inner)[idx] = None;
                Err(VectorBusy)
            }
        }
    }

    fn remove_vector(&self, channel: Channel) {
        let idx = channel.index();
        self.inner.installed[idx].store(false, Ordering::Release);
        self.inner
            .vectors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)[idx] = None;
        self.join_driver(channel);
    }

    fn masked(&self, f: &mut dyn FnMut(&dyn ChipRegisters)) {
        let _mask = self.inner.lock_mask();
        f(&*self.inner);
    }
}

impl Drop for SoftChip {
    fn drop(&mut self) {
        for channel in [Channel::A, Channel::B] {
            self.remove_vector(channel);
        }
    }
}

/// The two host chips, in allocation priority order
pub fn host_chips() -> [Arc<dyn TimerChip>; 2] {
    [Arc::new(SoftChip::new("ciaa")), Arc::new(SoftChip::new("ciab"))]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop_handler() -> VectorHandler {
        Arc::new(|_: &dyn ChipRegisters| {})
    }

    #[test]
    fn test_channel_registers() {
        assert_eq!(Channel::A.control(), ChipRegister::ControlA);
        assert_eq!(Channel::B.low(), ChipRegister::TimerBLow);
        assert_eq!(Channel::B.high(), ChipRegister::TimerBHigh);
        assert_eq!(Channel::A.stop_mask() & CR_START, 0);
        assert_eq!(Channel::B.stop_mask() & CR_START, 0);
    }

    #[test]
    fn test_countdown_duration() {
        assert_eq!(countdown_duration(0), Duration::ZERO);
        // ~10ms worth of E-clock cycles
        let d = countdown_duration(7_093);
        assert!(d > Duration::from_micros(9_900) && d < Duration::from_micros(10_100));
    }

    #[test]
    fn test_vector_exclusive() {
        let chip = SoftChip::new("test");
        assert!(chip.add_vector(Channel::A, noop_handler()).is_ok());
        assert_eq!(chip.add_vector(Channel::A, noop_handler()), Err(VectorBusy));
        assert!(chip.add_vector(Channel::B, noop_handler()).is_ok());

        chip.remove_vector(Channel::A);
        assert!(!chip.is_installed(Channel::A));
        assert!(chip.add_vector(Channel::A, noop_handler()).is_ok());
    }

    #[test]
    fn test_remove_without_vector_is_noop() {
        let chip = SoftChip::new("test");
        chip.remove_vector(Channel::B);
        chip.remove_vector(Channel::B);
        assert!(!chip.is_installed(Channel::B));
    }

    #[test]
    fn test_underflow_consumes_countdown() {
        let chip = SoftChip::new("test");
        let fired = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&fired);
        chip.add_vector(
            Channel::A,
            Arc::new(move |_: &dyn ChipRegisters| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .unwrap();

        // ~1.4ms countdown, never reloaded by the handler
        chip.write(ChipRegister::TimerALow, 0xE8);
        chip.write(ChipRegister::TimerAHigh, 0x03);
        chip.masked(&mut |regs: &dyn ChipRegisters| {
            regs.write(ChipRegister::ControlA, regs.read(ChipRegister::ControlA) | CR_START)
        });

        thread::sleep(Duration::from_millis(100));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(chip.read(ChipRegister::TimerALow), 0);
        assert_eq!(chip.read(ChipRegister::TimerAHigh), 0);
    }

    #[test]
    fn test_restart_discards_countdown_in_flight() {
        let chip = SoftChip::new("test");
        let fired = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&fired);
        chip.add_vector(
            Channel::A,
            Arc::new(move |_: &dyn ChipRegisters| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .unwrap();

        let load_and_start = |regs: &dyn ChipRegisters| {
            regs.write(ChipRegister::ControlA, regs.read(ChipRegister::ControlA) & STOP_A_MASK);
            // Full countdown, ~92ms
            regs.write(ChipRegister::TimerALow, 0xFF);
            regs.write(ChipRegister::TimerAHigh, 0xFF);
            regs.write(ChipRegister::ControlA, regs.read(ChipRegister::ControlA) | CR_START);
        };

        chip.masked(&mut |regs: &dyn ChipRegisters| load_and_start(regs));
        thread::sleep(Duration::from_millis(50));
        chip.masked(&mut |regs: &dyn ChipRegisters| load_and_start(regs));

        // Past the first countdown's underflow, before the restarted one's
        thread::sleep(Duration::from_millis(60));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert_eq!(chip.read(ChipRegister::TimerAHigh), 0xFF);

        thread::sleep(Duration::from_millis(150));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_start_edges_counted_per_channel() {
        let chip = SoftChip::new("test");
        chip.write(ChipRegister::ControlB, CR_START);
        chip.write(ChipRegister::ControlB, CR_START | 0x80);
        chip.write(ChipRegister::ControlB, 0);
        chip.write(ChipRegister::ControlB, CR_START);
        chip.write(ChipRegister::TimerALow, CR_START);

        assert_eq!(chip.inner.starts[Channel::A.index()].load(Ordering::SeqCst), 0);
        assert_eq!(chip.inner.starts[Channel::B.index()].load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_host_chips_named() {
        let chips = host_chips();
        assert_eq!(chips[0].name(), "ciaa");
        assert_eq!(chips[1].name(), "ciab");
    }
}
