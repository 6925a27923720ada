//! Interrupt-driven tick source
//!
//! Allocates one countdown channel from an ordered list of candidates by
//! installing an underflow handler on it. The handler runs in interrupt
//! context: it counts the underflow, wakes the daemon loop every
//! `prescale` underflows and reloads the countdown before returning.
//!
//! Non-interrupt code touches the channel only inside the chip's masked
//! sections. Arming stops the channel, loads the countdown and starts it again
//! in one section, so no underflow from the previous period is seen after it.

use std::sync::atomic::{AtomicU16, AtomicU32, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

use super::chip::{Channel, ChipRegisters, TimerChip, VectorHandler, CR_START, ECLOCK_HZ};
use super::{TimerBackend, TimerError};
use crate::config::TimerKind;

/// One allocatable countdown channel
#[derive(Clone)]
pub struct TimerCandidate {
    chip: Arc<dyn TimerChip>,
    channel: Channel,
}

impl TimerCandidate {
    pub fn new(chip: Arc<dyn TimerChip>, channel: Channel) -> Self {
        Self { chip, channel }
    }

    /// Both channels of each chip, chips in the given order
    pub fn all(chips: &[Arc<dyn TimerChip>]) -> Vec<Self> {
        chips
            .iter()
            .flat_map(|chip| {
                [Channel::A, Channel::B]
                    .into_iter()
                    .map(move |channel| Self::new(Arc::clone(chip), channel))
            })
            .collect()
    }
}

impl std::fmt::Debug for TimerCandidate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.chip.name(), self.channel)
    }
}

/// State shared between the handler and the daemon loop
#[derive(Debug, Default)]
struct TickShared {
    /// Ticks delivered to the loop
    ticks: AtomicU32,
    /// Raw countdown underflows
    underflows: AtomicU32,
    /// Underflows per tick
    prescale: AtomicU32,
    /// Countdown value reloaded on every underflow
    reload: AtomicU16,
    notify: Notify,
}

/// Countdown value and prescaler for an interval
///
/// Intervals longer than one full countdown are split into several equal
/// countdowns, with the handler waking the loop on every `prescale`th.
pub fn countdown_for(interval_micros: u32) -> (u16, u32) {
    let cycles = (u64::from(interval_micros) * ECLOCK_HZ / 1_000_000).max(1);
    let prescale = cycles.div_ceil(u64::from(u16::MAX));
    let countdown = (cycles / prescale).clamp(1, u64::from(u16::MAX));
    (countdown as u16, prescale as u32)
}

fn tick_handler(shared: Arc<TickShared>, channel: Channel) -> VectorHandler {
    Arc::new(move |regs: &dyn ChipRegisters| {
        let underflows = shared.underflows.fetch_add(1, Ordering::AcqRel) + 1;
        let prescale = shared.prescale.load(Ordering::Acquire).max(1);
        if underflows % prescale == 0 {
            shared.ticks.fetch_add(1, Ordering::AcqRel);
            shared.notify.notify_one();
        }

        // Reload every time, or the channel stops after this underflow
        let [low, high] = shared.reload.load(Ordering::Acquire).to_le_bytes();
        regs.write(channel.low(), low);
        regs.write(channel.high(), high);
    })
}

/// Interrupt-driven tick source owning one countdown channel
pub struct InterruptTimer {
    chip: Arc<dyn TimerChip>,
    channel: Channel,
    shared: Arc<TickShared>,
    installed: bool,
    running: bool,
    interval_micros: u32,
    /// Tick count last observed by the loop
    seen: u32,
}

impl InterruptTimer {
    /// Take the first free candidate, in order
    pub fn acquire(candidates: &[TimerCandidate]) -> Result<Self, TimerError> {
        for candidate in candidates {
            let shared = Arc::new(TickShared::default());
            let handler = tick_handler(Arc::clone(&shared), candidate.channel);

            match candidate.chip.add_vector(candidate.channel, handler) {
                Ok(()) => {
                    tracing::info!(timer = ?candidate, "Interrupt timer allocated");
                    return Ok(Self {
                        chip: Arc::clone(&candidate.chip),
                        channel: candidate.channel,
                        shared,
                        installed: true,
                        running: false,
                        interval_micros: 0,
                        seen: 0,
                    });
                }
                Err(e) => {
                    tracing::debug!(timer = ?candidate, "Skipping timer: {}", e);
                }
            }
        }

        tracing::warn!(candidates = candidates.len(), "No interrupt timer available");
        Err(TimerError::Unavailable)
    }

    /// Total ticks delivered since acquisition
    pub fn ticks(&self) -> u32 {
        self.shared.ticks.load(Ordering::Acquire)
    }

    pub fn channel(&self) -> Channel {
        self.channel
    }

    pub fn chip_name(&self) -> &str {
        self.chip.name()
    }

    /// Clear the start bit under the mask
    fn halt(&mut self) {
        let control = self.channel.control();
        let stop_mask = self.channel.stop_mask();
        self.chip.masked(&mut |regs: &dyn ChipRegisters| {
            regs.write(control, regs.read(control) & stop_mask);
        });
        self.running = false;
    }

    fn arm(&mut self, interval_micros: u32) -> Result<(), TimerError> {
        if !self.installed {
            return Err(TimerError::Released);
        }
        if interval_micros == 0 {
            return Err(TimerError::InvalidInterval(0));
        }

        let (countdown, prescale) = countdown_for(interval_micros);
        let [low, high] = countdown.to_le_bytes();
        let channel = self.channel;
        let shared = &self.shared;
        let mut seen = 0;

        self.chip.masked(&mut |regs: &dyn ChipRegisters| {
            let control = channel.control();
            regs.write(control, regs.read(control) & channel.stop_mask());

            shared.reload.store(countdown, Ordering::Release);
            shared.prescale.store(prescale, Ordering::Release);
            shared.underflows.store(0, Ordering::Release);
            seen = shared.ticks.load(Ordering::Acquire);

            regs.write(channel.low(), low);
            regs.write(channel.high(), high);
            regs.write(control, regs.read(control) | CR_START);
        });

        // Wakeups stored before this point belong to the old period
        self.seen = seen;
        self.running = true;
        self.interval_micros = interval_micros;

        tracing::debug!(
            chip = self.chip.name(),
            channel = %self.channel,
            countdown,
            prescale,
            interval_us = interval_micros,
            "Interrupt timer started"
        );
        Ok(())
    }
}

impl TimerBackend for InterruptTimer {
    fn kind(&self) -> TimerKind {
        TimerKind::Interrupt
    }

    fn start(&mut self, interval_micros: u32) -> Result<(), TimerError> {
        self.arm(interval_micros)
    }

    fn restart(&mut self, interval_micros: u32) -> Result<(), TimerError> {
        self.arm(interval_micros)
    }

    fn rearm(&mut self) -> Result<(), TimerError> {
        // The handler reloads the countdown itself
        if self.installed {
            Ok(())
        } else {
            Err(TimerError::Released)
        }
    }

    fn stop(&mut self) {
        if self.running {
            self.halt();
        }
        if self.installed {
            self.chip.remove_vector(self.channel);
            self.installed = false;
            tracing::info!(
                chip = self.chip.name(),
                channel = %self.channel,
                ticks = self.ticks(),
                "Interrupt timer released"
            );
        }
    }

    async fn tick(&mut self) {
        if !self.installed {
            return std::future::pending().await;
        }

        loop {
            self.shared.notify.notified().await;

            let ticks = self.ticks();
            if ticks == self.seen {
                tracing::trace!("Dropping wakeup from before the last restart");
                continue;
            }

            let coalesced = ticks.wrapping_sub(self.seen).saturating_sub(1);
            if coalesced > 0 {
                tracing::trace!(coalesced, "Ticks coalesced while loop was busy");
            }
            self.seen = ticks;
            return;
        }
    }
}

impl Drop for InterruptTimer {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timer::chip::{ChipRegister, SoftChip, VectorBusy};
    use std::sync::Mutex;
    use std::time::Duration;

    fn chips() -> (Arc<SoftChip>, Arc<SoftChip>) {
        (Arc::new(SoftChip::new("ciaa")), Arc::new(SoftChip::new("ciab")))
    }

    fn candidates(a: &Arc<SoftChip>, b: &Arc<SoftChip>) -> Vec<TimerCandidate> {
        let chips: [Arc<dyn TimerChip>; 2] = [a.clone(), b.clone()];
        TimerCandidate::all(&chips)
    }

    /// Chip that logs every register write and whether it was masked
    #[derive(Default)]
    struct RecordingChip {
        writes: Mutex<Vec<(ChipRegister, u8, bool)>>,
        in_mask: std::sync::atomic::AtomicBool,
    }

    impl RecordingChip {
        fn writes(&self) -> Vec<(ChipRegister, u8, bool)> {
            self.writes.lock().unwrap().clone()
        }

        fn clear(&self) {
            self.writes.lock().unwrap().clear();
        }
    }

    impl ChipRegisters for RecordingChip {
        fn read(&self, reg: ChipRegister) -> u8 {
            self.writes
                .lock()
                .unwrap()
                .iter()
                .rev()
                .find(|(r, _, _)| *r == reg)
                .map_or(0, |(_, value, _)| *value)
        }

        fn write(&self, reg: ChipRegister, value: u8) {
            let masked = self.in_mask.load(Ordering::SeqCst);
            self.writes.lock().unwrap().push((reg, value, masked));
        }
    }

    impl TimerChip for RecordingChip {
        fn name(&self) -> &str {
            "rec"
        }

        fn add_vector(&self, _: Channel, _: VectorHandler) -> Result<(), VectorBusy> {
            Ok(())
        }

        fn remove_vector(&self, _: Channel) {}

        fn masked(&self, f: &mut dyn FnMut(&dyn ChipRegisters)) {
            self.in_mask.store(true, Ordering::SeqCst);
            f(self);
            self.in_mask.store(false, Ordering::SeqCst);
        }
    }

    fn occupy(chip: &SoftChip, channel: Channel) {
        chip.add_vector(channel, Arc::new(|_: &dyn ChipRegisters| {}))
            .unwrap();
    }

    #[test]
    fn test_countdown_for_table_intervals() {
        assert_eq!(countdown_for(5_000), (3_546, 1));
        assert_eq!(countdown_for(10_000), (7_093, 1));
        assert_eq!(countdown_for(40_000), (28_375, 1));
    }

    #[test]
    fn test_countdown_for_long_interval_uses_prescaler() {
        let (countdown, prescale) = countdown_for(1_000_000);
        assert_eq!(prescale, 11);
        let total = u64::from(countdown) * u64::from(prescale);
        assert!(total.abs_diff(ECLOCK_HZ) < u64::from(prescale));
    }

    #[test]
    fn test_countdown_for_tiny_interval() {
        assert_eq!(countdown_for(1), (1, 1));
    }

    #[test]
    fn test_candidate_order() {
        let (a, b) = chips();
        let list = candidates(&a, &b);
        let names: Vec<String> = list.iter().map(|c| format!("{:?}", c)).collect();
        assert_eq!(names, vec!["ciaa:A", "ciaa:B", "ciab:A", "ciab:B"]);
    }

    #[tokio::test]
    async fn test_acquire_first_free() {
        let (a, b) = chips();
        let list = candidates(&a, &b);

        let timer = InterruptTimer::acquire(&list).unwrap();
        assert_eq!(timer.chip_name(), "ciaa");
        assert_eq!(timer.channel(), Channel::A);
        assert!(a.is_installed(Channel::A));
        // Later candidates left untried
        assert!(!a.is_installed(Channel::B));
        assert!(!b.is_installed(Channel::A));
    }

    #[tokio::test]
    async fn test_acquire_skips_busy_channels() {
        let (a, b) = chips();
        occupy(&a, Channel::A);
        occupy(&a, Channel::B);
        occupy(&b, Channel::A);

        let timer = InterruptTimer::acquire(&candidates(&a, &b)).unwrap();
        assert_eq!(timer.chip_name(), "ciab");
        assert_eq!(timer.channel(), Channel::B);
    }

    #[tokio::test]
    async fn test_acquire_unavailable_when_all_busy() {
        let (a, b) = chips();
        for chip in [&a, &b] {
            occupy(chip, Channel::A);
            occupy(chip, Channel::B);
        }

        let result = InterruptTimer::acquire(&candidates(&a, &b));
        assert!(matches!(result, Err(TimerError::Unavailable)));
    }

    #[tokio::test]
    async fn test_ticks_repeat_without_rearm() {
        let (a, b) = chips();
        let mut timer = InterruptTimer::acquire(&candidates(&a, &b)).unwrap();
        timer.start(2_000).unwrap();

        for _ in 0..3 {
            tokio::time::timeout(Duration::from_secs(2), timer.tick())
                .await
                .expect("interrupt timer should keep ticking");
        }
        assert!(timer.ticks() >= 3);
    }

    #[tokio::test]
    async fn test_start_loads_countdown_and_sets_start_bit() {
        let (a, b) = chips();
        let mut timer = InterruptTimer::acquire(&candidates(&a, &b)).unwrap();
        a.write(ChipRegister::ControlA, 0xFF);

        timer.start(40_000).unwrap();
        let control = a.read(ChipRegister::ControlA);
        assert_eq!(control & CR_START, CR_START);
        // Run-mode/load bits cleared by the stop mask before starting
        assert_eq!(control & !CR_START, 0xFF & Channel::A.stop_mask());
    }

    #[tokio::test]
    async fn test_stop_releases_vector_and_is_idempotent() {
        let (a, b) = chips();
        let mut timer = InterruptTimer::acquire(&candidates(&a, &b)).unwrap();
        timer.start(5_000).unwrap();

        timer.stop();
        timer.stop();
        assert!(!a.is_installed(Channel::A));
        assert_eq!(a.read(ChipRegister::ControlA) & CR_START, 0);
        assert_eq!(timer.start(5_000), Err(TimerError::Released));
        assert_eq!(timer.rearm(), Err(TimerError::Released));
    }

    #[tokio::test]
    async fn test_stop_before_start() {
        let (a, b) = chips();
        let mut timer = InterruptTimer::acquire(&candidates(&a, &b)).unwrap();
        timer.stop();
        assert!(!a.is_installed(Channel::A));
    }

    #[tokio::test]
    async fn test_drop_frees_channel_for_next_owner() {
        let (a, b) = chips();
        {
            let _timer = InterruptTimer::acquire(&candidates(&a, &b)).unwrap();
        }
        assert!(a.add_vector(Channel::A, Arc::new(|_: &dyn ChipRegisters| {})).is_ok());
        assert_eq!(
            a.add_vector(Channel::A, Arc::new(|_: &dyn ChipRegisters| {})),
            Err(VectorBusy)
        );
    }

    #[tokio::test]
    async fn test_restart_changes_countdown() {
        let (a, b) = chips();
        let mut timer = InterruptTimer::acquire(&candidates(&a, &b)).unwrap();
        timer.start(5_000).unwrap();
        timer.restart(40_000).unwrap();

        assert_eq!(timer.shared.reload.load(Ordering::Acquire), 28_375);
        assert_eq!(a.read(ChipRegister::ControlA) & CR_START, CR_START);
    }

    #[tokio::test]
    async fn test_restart_drops_ticks_from_old_period() {
        let (a, b) = chips();
        let mut timer = InterruptTimer::acquire(&candidates(&a, &b)).unwrap();
        timer.start(1_000).unwrap();

        // Let the fast period deliver while nobody waits on it
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(timer.ticks() > 0);

        timer.restart(10_000_000).unwrap();
        let early = tokio::time::timeout(Duration::from_millis(200), timer.tick()).await;
        assert!(early.is_err(), "tick delivered before the new period elapsed");
    }

    #[tokio::test]
    async fn test_restart_ticks_at_new_period() {
        let (a, b) = chips();
        let mut timer = InterruptTimer::acquire(&candidates(&a, &b)).unwrap();
        timer.start(1_000).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        timer.restart(5_000).unwrap();
        tokio::time::timeout(Duration::from_secs(2), timer.tick())
            .await
            .expect("restarted timer should keep ticking");
    }

    #[test]
    fn test_arm_writes_channel_only_while_masked() {
        let chip = Arc::new(RecordingChip::default());
        let list = [TimerCandidate::new(chip.clone(), Channel::B)];
        let mut timer = InterruptTimer::acquire(&list).unwrap();

        timer.start(5_000).unwrap();
        chip.clear();
        timer.restart(40_000).unwrap();

        let writes = chip.writes();
        assert!(writes.iter().all(|(_, _, masked)| *masked));
        let [low, high] = 28_375u16.to_le_bytes();
        assert_eq!(
            writes.iter().map(|(reg, value, _)| (*reg, *value)).collect::<Vec<_>>(),
            vec![
                (ChipRegister::ControlB, 0),
                (ChipRegister::TimerBLow, low),
                (ChipRegister::TimerBHigh, high),
                (ChipRegister::ControlB, CR_START),
            ]
        );
    }
}
