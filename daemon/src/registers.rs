//! SAGA USB mouse register access
//!
//! The mouse exposes one 16-bit register word:
//! - high byte: button state, bit 8 = button 4, bit 9 = button 5
//! - low byte: signed 8-bit wheel counter
//!
//! [`MappedRegisters`] maps the physical window through `/dev/mem` and reads
//! it with volatile loads. [`MemoryRegisters`] holds the same word in memory
//! for benches and tests.

use std::fs::OpenOptions;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;

/// Button 4 bit in the register word
pub const BUTTON4_MASK: u16 = 0x0100;

/// Button 5 bit in the register word
pub const BUTTON5_MASK: u16 = 0x0200;

/// Read-only view of the wheel and button registers
pub trait RegisterSource: Send {
    /// Current wheel counter
    fn wheel_counter(&self) -> i8;

    /// Raw button register word
    fn button_word(&self) -> u16;

    /// Two-bit button mask: bit 0 = button 4, bit 1 = button 5
    fn buttons(&self) -> u16 {
        button_mask(self.button_word())
    }
}

/// Fold the raw button word into the two-bit mask
pub const fn button_mask(word: u16) -> u16 {
    (word & (BUTTON4_MASK | BUTTON5_MASK)) >> 8
}

// ============================================================================
// Memory-mapped registers
// ============================================================================

/// Register window mapped from a physical memory device
pub struct MappedRegisters {
    /// Start of the mapping (page aligned)
    mapping: NonNull<libc::c_void>,
    /// Mapping length in bytes
    len: usize,
    /// Offset of the register word inside the mapping
    offset: usize,
}

// SAFETY: the mapping is read-only and only ever accessed with volatile loads.
unsafe impl Send for MappedRegisters {}

impl MappedRegisters {
    /// Map the register word at physical address `base`
    pub fn open(device: &Path, base: u64) -> Result<Self, RegisterError> {
        let file = OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_SYNC)
            .open(device)
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::PermissionDenied {
                    RegisterError::PermissionDenied
                } else if e.kind() == std::io::ErrorKind::NotFound {
                    RegisterError::DeviceNotFound
                } else {
                    RegisterError::IoError(e)
                }
            })?;

        // SAFETY: sysconf has no preconditions.
        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        let page_size = if page_size > 0 { page_size as u64 } else { 4096 };
        let page_base = base & !(page_size - 1);
        let offset = (base - page_base) as usize;
        let len = offset + std::mem::size_of::<u16>();

        // SAFETY: fd is valid for the duration of the call; the result is checked.
        let mapping = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ,
                libc::MAP_SHARED,
                file.as_raw_fd(),
                page_base as libc::off_t,
            )
        };
        if mapping == libc::MAP_FAILED {
            return Err(RegisterError::IoError(std::io::Error::last_os_error()));
        }
        let mapping = NonNull::new(mapping).ok_or(RegisterError::DeviceNotFound)?;

        tracing::info!(
            device = %device.display(),
            base = format!("0x{:06X}", base),
            "Mouse registers mapped"
        );

        Ok(Self { mapping, len, offset })
    }

    fn read_byte(&self, index: usize) -> u8 {
        // SAFETY: offset + 1 < len and the mapping lives as long as self.
        unsafe {
            let ptr = (self.mapping.as_ptr() as *const u8).add(self.offset + index);
            std::ptr::read_volatile(ptr)
        }
    }
}

impl RegisterSource for MappedRegisters {
    fn wheel_counter(&self) -> i8 {
        self.read_byte(1) as i8
    }

    fn button_word(&self) -> u16 {
        // The register is big-endian; read byte-wise to stay host-neutral.
        u16::from_be_bytes([self.read_byte(0), self.read_byte(1)])
    }
}

impl Drop for MappedRegisters {
    fn drop(&mut self) {
        // SAFETY: mapping/len come from a successful mmap.
        unsafe {
            libc::munmap(self.mapping.as_ptr(), self.len);
        }
        tracing::debug!("Mouse registers unmapped");
    }
}

// ============================================================================
// In-memory registers
// ============================================================================

/// Register word held in memory, shareable between clones
#[derive(Debug, Clone, Default)]
pub struct MemoryRegisters {
    word: Arc<AtomicU16>,
}

impl MemoryRegisters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_wheel(&self, counter: i8) {
        let word = self.word.load(Ordering::Acquire);
        self.word
            .store((word & 0xFF00) | counter as u8 as u16, Ordering::Release);
    }

    /// Set the button state from a two-bit mask
    pub fn set_buttons(&self, mask: u16) {
        let word = self.word.load(Ordering::Acquire);
        self.word
            .store((word & 0x00FF) | ((mask & 0b11) << 8), Ordering::Release);
    }
}

impl RegisterSource for MemoryRegisters {
    fn wheel_counter(&self) -> i8 {
        self.word.load(Ordering::Acquire) as u8 as i8
    }

    fn button_word(&self) -> u16 {
        self.word.load(Ordering::Acquire)
    }
}

// ============================================================================
// Error Types
// ============================================================================

/// Register mapping error type
#[derive(Debug)]
pub enum RegisterError {
    /// Memory device missing
    DeviceNotFound,
    /// Permission denied
    PermissionDenied,
    /// I/O error
    IoError(std::io::Error),
}

impl std::fmt::Display for RegisterError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegisterError::DeviceNotFound => write!(f, "memory device not found"),
            RegisterError::PermissionDenied => write!(
                f,
                "Permission denied mapping mouse registers. Run as root or grant CAP_SYS_RAWIO."
            ),
            RegisterError::IoError(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl std::error::Error for RegisterError {}
