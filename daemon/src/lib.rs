//! XMouse Daemon Library
//!
//! Public API for testing and integration.

pub mod config;
pub mod control;
pub mod daemon;
pub mod dbus;
pub mod evdev;
pub mod input;
pub mod poll;
pub mod registers;
pub mod timer;

#[cfg(test)]
mod testing;

/// Re-export commonly used types
pub use config::{ConfigByte, ConfigError, Settings, TimerKind, DEFAULT_CONFIG_BYTE, POLL_INTERVALS};
pub use control::{ControlCommand, ControlError, ControlHandle, ControlMessage, ControlPort, ControlReply};
pub use daemon::{startup, DaemonLoop, ExitReason, HostDaemon, StartupError};
pub use dbus::{init_dbus_service, ClientError, DaemonClient, XMouseService, DBUS_INTERFACE, DBUS_NAME, DBUS_PATH};
pub use evdev::UinputSink;
pub use input::{EventClass, EventSink, InputEventDescriptor, SinkError};
pub use poll::{PollEngine, PollState, TickReport};
pub use registers::{MappedRegisters, MemoryRegisters, RegisterError, RegisterSource};
pub use timer::{select_timer, InterruptTimer, RequestTimer, SelectedTimer, TimerBackend, TimerError};
