//! D-Bus rendezvous for the control channel
//!
//! The running daemon owns the well-known name `org.xmouse` and exports the
//! `org.xmouse.Daemon` interface. A second invocation looks the name up,
//! and either talks to the owner or learns that no daemon is running.
//!
//! ## Interface: org.xmouse.Daemon
//!
//! ### Methods:
//! - `Control(command: y, value: u) -> u` - One control request, one reply
//!
//! ### Properties:
//! - `DaemonVersion: s`

use zbus::names::BusName;
use zbus::proxy::Proxy;
use zbus::{fdo, interface};

use crate::control::{ControlError, ControlHandle, ControlMessage, ControlReply};

/// D-Bus interface name
pub const DBUS_INTERFACE: &str = "org.xmouse.Daemon";

/// D-Bus object path
pub const DBUS_PATH: &str = "/org/xmouse/Daemon";

/// D-Bus bus name
pub const DBUS_NAME: &str = "org.xmouse";

/// XMouse D-Bus service
///
/// Forwards every `Control` call into the daemon loop's control channel and
/// waits for the loop's reply.
pub struct XMouseService {
    control: ControlHandle,
    /// Daemon version
    version: String,
}

impl XMouseService {
    pub fn new(control: ControlHandle) -> Self {
        Self {
            control,
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Queue one request and wait for the loop to answer it
async fn forward(control: &ControlHandle, command: u8, value: u32) -> Result<u32, ControlError> {
    let message = ControlMessage::from_raw(command, value);
    control.request(message).await.map(|reply| reply.result)
}

#[interface(name = "org.xmouse.Daemon")]
impl XMouseService {
    /// Send one control request to the daemon loop
    ///
    /// # Arguments
    /// * `command` - 0 quit, 1 set config, 2 set interval, 3 get status
    /// * `value` - Command argument
    ///
    /// # Returns
    /// The command's result word; `0xFFFFFFFF` for rejected requests
    async fn control(&self, command: u8, value: u32) -> fdo::Result<u32> {
        tracing::debug!(command, value, "Control called");
        match forward(&self.control, command, value).await {
            Ok(result) => Ok(result),
            Err(e) => {
                tracing::warn!(command, "Control request not handled: {}", e);
                Err(fdo::Error::Failed(e.to_string()))
            }
        }
    }

    /// Get daemon version
    #[zbus(property)]
    async fn daemon_version(&self) -> &str {
        &self.version
    }
}

/// Publish the control channel on the session bus
///
/// Fails if another daemon already owns the name.
///
/// # Returns
/// A `zbus::Connection` that should be kept alive for the service to run.
pub async fn init_dbus_service(control: ControlHandle) -> zbus::Result<zbus::Connection> {
    let service = XMouseService::new(control);

    let connection = zbus::connection::Builder::session()?
        .name(DBUS_NAME)?
        .serve_at(DBUS_PATH, service)?
        .build()
        .await?;

    tracing::info!(
        name = DBUS_NAME,
        path = DBUS_PATH,
        "D-Bus service registered"
    );

    Ok(connection)
}

// ============================================================================
// Client side
// ============================================================================

/// Connection to a running daemon
pub struct DaemonClient {
    proxy: Proxy<'static>,
}

impl DaemonClient {
    /// Locate the running daemon
    ///
    /// Returns `ClientError::NotRunning` when nobody owns the bus name.
    pub async fn find() -> Result<Self, ClientError> {
        let connection = zbus::Connection::session().await?;

        let bus = fdo::DBusProxy::new(&connection).await?;
        let name = BusName::try_from(DBUS_NAME).map_err(zbus::Error::from)?;
        if !bus.name_has_owner(name).await? {
            return Err(ClientError::NotRunning);
        }

        let proxy = Proxy::new(&connection, DBUS_NAME, DBUS_PATH, DBUS_INTERFACE).await?;
        Ok(Self { proxy })
    }

    /// Send one request; a sentinel reply becomes `ClientError::ErrorReply`
    pub async fn send(&self, message: ControlMessage) -> Result<ControlReply, ClientError> {
        let (code, value) = message.to_raw();
        let result: u32 = self.proxy.call("Control", &(code, value)).await?;

        let reply = ControlReply::new(result);
        if reply.is_error() {
            return Err(ClientError::ErrorReply(code));
        }

        tracing::debug!(command = code, result, "Daemon replied");
        Ok(reply)
    }
}

/// Client error type
#[derive(Debug)]
pub enum ClientError {
    /// No daemon owns the bus name
    NotRunning,
    /// Bus error
    Bus(zbus::Error),
    /// Daemon answered with the error sentinel
    ErrorReply(u8),
}

impl std::fmt::Display for ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientError::NotRunning => write!(f, "daemon is not running"),
            ClientError::Bus(e) => write!(f, "D-Bus error: {}", e),
            ClientError::ErrorReply(command) => {
                write!(f, "daemon rejected command {}", command)
            }
        }
    }
}

impl std::error::Error for ClientError {}

impl From<zbus::Error> for ClientError {
    fn from(e: zbus::Error) -> Self {
        ClientError::Bus(e)
    }
}

impl From<fdo::Error> for ClientError {
    fn from(e: fdo::Error) -> Self {
        ClientError::Bus(e.into())
    }
}
