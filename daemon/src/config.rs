//! Configuration for the XMouse daemon
//!
//! Two layers live here:
//! - [`ConfigByte`]: the packed runtime configuration the control protocol
//!   and the command line exchange (feature flags + poll interval selector).
//! - [`Settings`]: host-side settings loaded once at startup from
//!   `~/.config/xmouse/config.json` (register window, timer backend, device
//!   names). The daemon never writes this file.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

// ============================================================================
// Constants
// ============================================================================

/// Default config directory name
const CONFIG_DIR: &str = "xmouse";

/// Default config file name
const CONFIG_FILE: &str = "config.json";

/// Poll interval table (microseconds), indexed by the 2-bit selector
pub const POLL_INTERVALS: [u32; 4] = [
    5_000,  // 0: 5ms
    10_000, // 1: 10ms - responsive (default)
    20_000, // 2: 20ms - CPU saving
    40_000, // 3: 40ms - maximum CPU saving
];

/// Default configuration: wheel on, buttons on, 10ms, debug off
pub const DEFAULT_CONFIG_BYTE: u8 = 0x13;

/// Default SAGA mouse register word (buttons high byte, wheel counter low byte)
pub const DEFAULT_REGISTER_BASE: u64 = 0x00DF_F212;

// ============================================================================
// Configuration byte
// ============================================================================

/// Packed daemon configuration
///
/// Layout: bit0 wheel, bit1 extra buttons, bits4-5 interval selector,
/// bit7 debug logging. Reserved bits are carried through untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConfigByte(u8);

impl ConfigByte {
    pub const WHEEL_ENABLED: u8 = 0x01;
    pub const BUTTONS_ENABLED: u8 = 0x02;
    pub const INTERVAL_SHIFT: u8 = 4;
    pub const INTERVAL_MASK: u8 = 0x30;
    pub const DEBUG_MODE: u8 = 0x80;

    pub const fn new(bits: u8) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn wheel_enabled(self) -> bool {
        self.0 & Self::WHEEL_ENABLED != 0
    }

    pub const fn buttons_enabled(self) -> bool {
        self.0 & Self::BUTTONS_ENABLED != 0
    }

    pub const fn debug(self) -> bool {
        self.0 & Self::DEBUG_MODE != 0
    }

    /// True when neither wheel nor buttons are enabled
    ///
    /// The command line treats such a byte as a stop request; the control
    /// protocol accepts it as a regular (silent) configuration.
    pub const fn is_idle(self) -> bool {
        self.0 & (Self::WHEEL_ENABLED | Self::BUTTONS_ENABLED) == 0
    }

    /// Interval selector (0..=3)
    pub const fn interval_index(self) -> usize {
        ((self.0 & Self::INTERVAL_MASK) >> Self::INTERVAL_SHIFT) as usize
    }

    /// Poll interval in microseconds selected by this byte
    pub const fn poll_interval_micros(self) -> u32 {
        POLL_INTERVALS[self.interval_index()]
    }
}

impl Default for ConfigByte {
    fn default() -> Self {
        Self(DEFAULT_CONFIG_BYTE)
    }
}

impl From<u8> for ConfigByte {
    fn from(bits: u8) -> Self {
        Self(bits)
    }
}

impl std::fmt::Display for ConfigByte {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{:02x}", self.0)
    }
}

// ============================================================================
// Host settings
// ============================================================================

/// Which tick source the daemon should use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TimerKind {
    /// One timed request at a time against the async timer service
    #[default]
    Request,
    /// Countdown chip channel driven by an interrupt handler
    Interrupt,
}

impl std::fmt::Display for TimerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TimerKind::Request => write!(f, "request"),
            TimerKind::Interrupt => write!(f, "interrupt"),
        }
    }
}

/// Host settings structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Initial configuration byte
    #[serde(default = "default_config_byte")]
    pub config_byte: u8,

    /// Tick source
    #[serde(default)]
    pub timer: TimerKind,

    /// Physical address of the button/wheel register word
    #[serde(default = "default_register_base")]
    pub register_base: u64,

    /// Device node used to map the register window
    #[serde(default = "default_memory_device")]
    pub memory_device: PathBuf,

    /// Name of the uinput device the daemon creates
    #[serde(default = "default_device_name")]
    pub device_name: String,

    /// Keyboard used for qualifier snapshots (auto-detected when unset)
    #[serde(default)]
    pub keyboard_device: Option<PathBuf>,

    /// Settings file path (not serialized)
    #[serde(skip)]
    pub settings_path: Option<PathBuf>,
}

fn default_config_byte() -> u8 { DEFAULT_CONFIG_BYTE }
fn default_register_base() -> u64 { DEFAULT_REGISTER_BASE }
fn default_memory_device() -> PathBuf { PathBuf::from("/dev/mem") }
fn default_device_name() -> String { "XMouse Virtual Pointer".to_string() }

impl Default for Settings {
    fn default() -> Self {
        Self {
            config_byte: DEFAULT_CONFIG_BYTE,
            timer: TimerKind::default(),
            register_base: DEFAULT_REGISTER_BASE,
            memory_device: default_memory_device(),
            device_name: default_device_name(),
            keyboard_device: None,
            settings_path: None,
        }
    }
}

impl Settings {
    /// Get the default settings directory path
    pub fn default_dir() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join(CONFIG_DIR))
    }

    /// Get the default settings file path
    pub fn default_path() -> Option<PathBuf> {
        Self::default_dir().map(|p| p.join(CONFIG_FILE))
    }

    /// Load settings from the default location
    ///
    /// Returns defaults if the file doesn't exist.
    pub fn load_default() -> Result<Self, ConfigError> {
        match Self::default_path() {
            Some(path) => Self::load(&path),
            None => {
                tracing::warn!("Could not determine config directory, using defaults");
                Ok(Self::default())
            }
        }
    }

    /// Load settings from file path
    ///
    /// Returns defaults if the file doesn't exist.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::info!(path = %path.display(), "Settings file not found, using defaults");
            let mut settings = Self::default();
            settings.settings_path = Some(path.to_path_buf());
            return Ok(settings);
        }

        let contents = fs::read_to_string(path).map_err(ConfigError::IoError)?;
        let mut settings: Settings =
            serde_json::from_str(&contents).map_err(ConfigError::ParseError)?;
        settings.validate()?;
        settings.settings_path = Some(path.to_path_buf());

        tracing::info!(
            path = %path.display(),
            config = %settings.config(),
            timer = %settings.timer,
            register_base = format!("0x{:06X}", settings.register_base),
            "Settings loaded"
        );

        Ok(settings)
    }

    /// Reject settings the daemon cannot work with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.device_name.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "device_name must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Initial configuration byte
    pub fn config(&self) -> ConfigByte {
        ConfigByte::new(self.config_byte)
    }
}

// ============================================================================
// Error Types
// ============================================================================

/// Configuration error type
#[derive(Debug)]
pub enum ConfigError {
    /// I/O error reading the settings file
    IoError(std::io::Error),
    /// JSON parsing error
    ParseError(serde_json::Error),
    /// Validation error
    ValidationError(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::IoError(e) => write!(f, "I/O error: {}", e),
            ConfigError::ParseError(e) => write!(f, "Parse error: {}", e),
            ConfigError::ValidationError(msg) => write!(f, "Validation error: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::IoError(e) => Some(e),
            ConfigError::ParseError(e) => Some(e),
            ConfigError::ValidationError(_) => None,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
