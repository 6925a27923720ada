//! Control protocol between a running daemon and short-lived clients
//!
//! A request carries a one-byte command and a 32-bit value; every request is
//! answered with exactly one 32-bit result on the reply channel that travels
//! with it. [`channel`] creates the in-process queue the daemon loop drains;
//! the D-Bus service in [`crate::dbus`] forwards remote calls into it as a
//! typed `(y, u)` pair, so requests never exist as raw bytes.

use tokio::sync::{mpsc, oneshot};

use crate::config::ConfigByte;

/// Queue depth of the control channel
pub const CONTROL_QUEUE_DEPTH: usize = 16;

/// Control command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
    /// Stop the daemon
    Quit,
    /// Replace the configuration byte (low 8 bits of the value)
    SetConfig,
    /// Set the poll interval in microseconds, bypassing the table
    SetInterval,
    /// Report `config << 16 | interval_ms`
    GetStatus,
    /// Anything else; answered with the error sentinel
    Unknown(u8),
}

impl ControlCommand {
    pub const fn code(self) -> u8 {
        match self {
            ControlCommand::Quit => 0,
            ControlCommand::SetConfig => 1,
            ControlCommand::SetInterval => 2,
            ControlCommand::GetStatus => 3,
            ControlCommand::Unknown(code) => code,
        }
    }
}

impl From<u8> for ControlCommand {
    fn from(code: u8) -> Self {
        match code {
            0 => ControlCommand::Quit,
            1 => ControlCommand::SetConfig,
            2 => ControlCommand::SetInterval,
            3 => ControlCommand::GetStatus,
            other => ControlCommand::Unknown(other),
        }
    }
}

/// Request sent by a client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlMessage {
    pub command: ControlCommand,
    pub value: u32,
}

impl ControlMessage {
    pub const fn new(command: ControlCommand, value: u32) -> Self {
        Self { command, value }
    }

    pub const fn quit() -> Self {
        Self::new(ControlCommand::Quit, 0)
    }

    pub const fn set_config(config: ConfigByte) -> Self {
        Self::new(ControlCommand::SetConfig, config.bits() as u32)
    }

    pub const fn set_interval(micros: u32) -> Self {
        Self::new(ControlCommand::SetInterval, micros)
    }

    pub const fn get_status() -> Self {
        Self::new(ControlCommand::GetStatus, 0)
    }

    /// Request as it arrives over the bus; unknown codes are kept for the reply
    pub fn from_raw(code: u8, value: u32) -> Self {
        Self::new(ControlCommand::from(code), value)
    }

    /// Command code and value as they travel over the bus
    pub const fn to_raw(&self) -> (u8, u32) {
        (self.command.code(), self.value)
    }
}

/// Reply to exactly one [`ControlMessage`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlReply {
    pub result: u32,
}

impl ControlReply {
    /// `Quit` acknowledgement
    pub const SUCCESS: ControlReply = ControlReply { result: 0 };

    /// Unrecognized command or rejected value
    pub const ERROR_SENTINEL: ControlReply = ControlReply { result: 0xFFFF_FFFF };

    pub const fn new(result: u32) -> Self {
        Self { result }
    }

    pub const fn is_error(&self) -> bool {
        self.result == Self::ERROR_SENTINEL.result
    }
}

/// Pack the `GetStatus` result
///
/// The millisecond field is 16 bits wide and saturates rather than spilling
/// into the configuration byte.
pub fn pack_status(config: ConfigByte, interval_micros: u32) -> u32 {
    let millis = (interval_micros / 1_000).min(u32::from(u16::MAX));
    (u32::from(config.bits()) << 16) | millis
}

/// Split a `GetStatus` result into configuration and interval in milliseconds
pub fn unpack_status(result: u32) -> (ConfigByte, u32) {
    (ConfigByte::new((result >> 16) as u8), result & 0xFFFF)
}

/// A queued request with its reply channel
#[derive(Debug)]
pub struct ControlRequest {
    pub message: ControlMessage,
    reply: oneshot::Sender<ControlReply>,
}

impl ControlRequest {
    pub fn new(message: ControlMessage) -> (Self, oneshot::Receiver<ControlReply>) {
        let (reply, rx) = oneshot::channel();
        (Self { message, reply }, rx)
    }

    /// Consume the request with its one reply
    pub fn respond(self, reply: ControlReply) {
        if self.reply.send(reply).is_err() {
            tracing::debug!(
                command = self.message.command.code(),
                "Client went away before the reply was delivered"
            );
        }
    }
}

/// Daemon side of the control channel
#[derive(Debug)]
pub struct ControlPort {
    rx: mpsc::Receiver<ControlRequest>,
}

impl ControlPort {
    /// Wait for the next request; `None` once every handle is gone
    pub async fn recv(&mut self) -> Option<ControlRequest> {
        self.rx.recv().await
    }

    /// Next already-queued request, without waiting
    pub fn try_recv(&mut self) -> Option<ControlRequest> {
        self.rx.try_recv().ok()
    }

    /// Refuse further requests; queued ones can still be drained
    pub fn close(&mut self) {
        self.rx.close();
    }
}

/// Client side of the control channel
#[derive(Debug, Clone)]
pub struct ControlHandle {
    tx: mpsc::Sender<ControlRequest>,
}

impl ControlHandle {
    /// Queue a request without waiting for room or for the reply
    pub fn submit(
        &self,
        message: ControlMessage,
    ) -> Result<oneshot::Receiver<ControlReply>, ControlError> {
        let (request, rx) = ControlRequest::new(message);
        self.tx.try_send(request).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => ControlError::Full,
            mpsc::error::TrySendError::Closed(_) => ControlError::Closed,
        })?;
        Ok(rx)
    }

    /// Send a request and wait for its reply
    pub async fn request(&self, message: ControlMessage) -> Result<ControlReply, ControlError> {
        let (request, rx) = ControlRequest::new(message);
        self.tx
            .send(request)
            .await
            .map_err(|_| ControlError::Closed)?;
        rx.await.map_err(|_| ControlError::NoReply)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Create a control channel holding up to `capacity` queued requests
pub fn channel(capacity: usize) -> (ControlHandle, ControlPort) {
    let (tx, rx) = mpsc::channel(capacity);
    (ControlHandle { tx }, ControlPort { rx })
}

/// Control channel error type
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlError {
    /// Daemon side is gone
    Closed,
    /// Queue full
    Full,
    /// Request dropped without a reply
    NoReply,
}

impl std::fmt::Display for ControlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ControlError::Closed => write!(f, "control channel closed"),
            ControlError::Full => write!(f, "control channel full"),
            ControlError::NoReply => write!(f, "request dropped without a reply"),
        }
    }
}

impl std::error::Error for ControlError {}
