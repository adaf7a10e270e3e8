//! usbmuxd access for physical iOS devices.
//!
//! [`list_devices`] enumerates devices attached through Apple's `usbmuxd`
//! daemon and [`connect`] opens a tunnelled stream to a TCP port on one of
//! them. The iOS device uses this as the upstream side of a
//! [`PortForwarder`](crate::forward::PortForwarder) relay so that WDA and the
//! stub socket become reachable on a local port.

use std::fmt;
use std::net::IpAddr;

use idevice::usbmuxd::{Connection, UsbmuxdConnection};
use thiserror::Error;
use tracing::debug;

use crate::forward::DeviceStream;

/// Label reported to usbmuxd for our connections.
const USBMUXD_LABEL: &str = "uixt";

#[derive(Error, Debug)]
pub enum UsbTunnelError {
    /// The local usbmuxd daemon is not reachable.
    #[error("failed to connect to usbmuxd: {0}")]
    UsbmuxdUnavailable(String),

    #[error("device not attached: {0}")]
    DeviceNotFound(String),

    /// usbmuxd refused to open the device port.
    #[error("tunnel to port {port} failed: {message}")]
    ConnectionFailed { port: u16, message: String },

    /// The tunnel connection returned no usable socket.
    #[error("tunnel socket unavailable")]
    NoSocket,
}

/// A device as reported by usbmuxd.
#[derive(Debug, Clone)]
pub struct AttachedDevice {
    pub udid: String,
    /// usbmuxd-assigned numeric id.
    pub device_id: u32,
    pub link: DeviceLink,
}

/// How the device reaches the host.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceLink {
    Usb,
    Network(IpAddr),
    Other(String),
}

impl fmt::Display for DeviceLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceLink::Usb => write!(f, "usb"),
            DeviceLink::Network(ip) => write!(f, "network({ip})"),
            DeviceLink::Other(s) => write!(f, "other({s})"),
        }
    }
}

impl From<Connection> for DeviceLink {
    fn from(conn: Connection) -> Self {
        match conn {
            Connection::Usb => DeviceLink::Usb,
            Connection::Network(ip) => DeviceLink::Network(ip),
            Connection::Unknown(s) => DeviceLink::Other(s),
        }
    }
}

async fn muxd() -> Result<UsbmuxdConnection, UsbTunnelError> {
    UsbmuxdConnection::default()
        .await
        .map_err(|e| UsbTunnelError::UsbmuxdUnavailable(e.to_string()))
}

/// Lists devices currently attached through usbmuxd.
pub async fn list_devices() -> Result<Vec<AttachedDevice>, UsbTunnelError> {
    let devices = muxd()
        .await?
        .get_devices()
        .await
        .map_err(|e| UsbTunnelError::UsbmuxdUnavailable(e.to_string()))?;

    Ok(devices
        .into_iter()
        .map(|d| AttachedDevice {
            udid: d.udid,
            device_id: d.device_id,
            link: d.connection_type.into(),
        })
        .collect())
}

/// Opens a tunnelled stream to `port` on the device `udid`.
pub async fn connect(udid: &str, port: u16) -> Result<Box<dyn DeviceStream>, UsbTunnelError> {
    let mut muxd = muxd().await?;

    let device = muxd
        .get_device(udid)
        .await
        .map_err(|_| UsbTunnelError::DeviceNotFound(udid.to_string()))?;

    let idevice = muxd
        .connect_to_device(device.device_id, port, USBMUXD_LABEL)
        .await
        .map_err(|e| UsbTunnelError::ConnectionFailed {
            port,
            message: e.to_string(),
        })?;

    let socket = idevice.get_socket().ok_or(UsbTunnelError::NoSocket)?;
    debug!(udid, port, "usbmuxd tunnel established");
    Ok(Box::new(socket))
}
