//! Synthesized input events
//!
//! Every logical change (one wheel notch, one button edge) is injected twice:
//! once as a raw-key event and once as a pointer-device event. Different host
//! consumers listen to different classes, so both are always sent, raw-key
//! first.

/// Wheel moved up one notch
pub const WHEEL_UP: u16 = 0x7A;

/// Wheel moved down one notch
pub const WHEEL_DOWN: u16 = 0x7B;

/// Fourth mouse button
pub const BUTTON_FOURTH: u16 = 0x7E;

/// Fifth mouse button
pub const BUTTON_FIFTH: u16 = 0x7F;

/// OR'd into a button code when the button is released
pub const UP_PREFIX: u16 = 0x80;

/// Event class of a synthesized event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventClass {
    /// Raw keyboard-style code
    RawKeyLike,
    /// Pointer device event (wheel / extra buttons)
    PointerDeviceLike,
}

impl EventClass {
    /// Class id as seen by the input subsystem
    pub const fn id(self) -> u8 {
        match self {
            EventClass::RawKeyLike => 0x01,
            EventClass::PointerDeviceLike => 0x16,
        }
    }
}

/// One synthesized input event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputEventDescriptor {
    pub class: EventClass,
    pub code: u16,
    /// Modifier state snapshot taken at the start of the tick
    pub qualifier: u16,
    pub x: i16,
    pub y: i16,
    pub timestamp: u64,
}

impl InputEventDescriptor {
    pub const fn new(class: EventClass, code: u16, qualifier: u16) -> Self {
        Self {
            class,
            code,
            qualifier,
            x: 0,
            y: 0,
            timestamp: 0,
        }
    }

    /// Code without the release flag
    pub const fn base_code(&self) -> u16 {
        self.code & !UP_PREFIX
    }

    /// True when this event reports a release
    pub const fn is_release(&self) -> bool {
        self.code & UP_PREFIX != 0
    }
}

/// Destination for synthesized events
///
/// `inject` blocks until the host accepted the event; callers never reorder.
pub trait EventSink: Send {
    fn inject(&mut self, event: &InputEventDescriptor) -> Result<(), SinkError>;

    /// Current modifier state, captured once per tick
    fn qualifier(&self) -> u16 {
        0
    }
}

/// Collects events in memory
impl EventSink for Vec<InputEventDescriptor> {
    fn inject(&mut self, event: &InputEventDescriptor) -> Result<(), SinkError> {
        self.push(*event);
        Ok(())
    }
}

/// Event injection error type
#[derive(Debug)]
pub enum SinkError {
    /// uinput device not available
    DeviceNotFound,
    /// Permission denied
    PermissionDenied,
    /// Code the sink cannot express
    UnsupportedCode(u16),
    /// I/O error
    IoError(std::io::Error),
}

impl std::fmt::Display for SinkError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SinkError::DeviceNotFound => write!(f, "uinput device not found"),
            SinkError::PermissionDenied => write!(
                f,
                "Permission denied. Ensure /dev/uinput is writable by the daemon user."
            ),
            SinkError::UnsupportedCode(code) => write!(f, "unsupported event code 0x{:02x}", code),
            SinkError::IoError(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl std::error::Error for SinkError {}

impl From<std::io::Error> for SinkError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::PermissionDenied => SinkError::PermissionDenied,
            std::io::ErrorKind::NotFound => SinkError::DeviceNotFound,
            _ => SinkError::IoError(e),
        }
    }
}
