//! Device discovery and USB tunneling through `usbmuxd`.
//!
//! [`DeviceMux`] is the seam between the driver and the local device
//! multiplexer: it enumerates attached devices and opens tunneled
//! connections to ports on a device. [`Usbmuxd`] implements it on top of
//! Apple's `usbmuxd` daemon. [`locate`] resolves the device a run should
//! use.
//!
//! # Example
//!
//! ```no_run
//! use wdalink_core::usb_tunnel::{self, DeviceMux, Usbmuxd};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mux = Usbmuxd;
//! let device = usb_tunnel::locate(&mux, Some("00008110-001A0C123456789A")).await?;
//! let stream = mux.connect(&device, 8100).await?;
//! # drop(stream);
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;
use idevice::usbmuxd::{Connection, UsbmuxdConnection};
use thiserror::Error;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::transport::TransportStream;

/// Label reported to usbmuxd for tunneled connections.
const MUX_LABEL: &str = "wdalink";

/// Timeout for establishing a tunneled connection.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur during device lookup and tunneling.
#[derive(Error, Debug)]
pub enum UsbTunnelError {
    /// Failed to talk to the local usbmuxd daemon.
    #[error("failed to connect to usbmuxd: {0}")]
    UsbmuxdUnavailable(String),

    /// No attached device matched, or none is attached at all.
    #[error("device not found: {0}")]
    DeviceNotFound(String),

    /// Failed to establish a tunnel to the device port.
    #[error("tunnel connection to port {port} failed: {reason}")]
    ConnectionFailed {
        /// Device port that was being tunneled.
        port: u16,
        /// Underlying failure.
        reason: String,
    },

    /// The tunnel connection returned no usable socket.
    #[error("tunnel socket unavailable")]
    NoSocket,
}

// ---------------------------------------------------------------------------
// PhysicalDevice
// ---------------------------------------------------------------------------

/// A device reported by the multiplexer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhysicalDevice {
    /// Unique Device Identifier (UDID), the serial used for lookup.
    pub udid: String,
    /// The mux-assigned numeric device ID (used internally for connections).
    pub device_id: u32,
    /// How the device is connected.
    pub connection: DeviceConnection,
}

/// How a device is connected to the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceConnection {
    /// Connected via USB cable.
    Usb,
    /// Connected via the network (WiFi).
    Network(IpAddr),
    /// Unknown connection type.
    Unknown(String),
}

impl fmt::Display for DeviceConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceConnection::Usb => write!(f, "USB"),
            DeviceConnection::Network(ip) => write!(f, "Network ({ip})"),
            DeviceConnection::Unknown(s) => write!(f, "Unknown ({s})"),
        }
    }
}

impl From<Connection> for DeviceConnection {
    fn from(conn: Connection) -> Self {
        match conn {
            Connection::Usb => DeviceConnection::Usb,
            Connection::Network(ip) => DeviceConnection::Network(ip),
            Connection::Unknown(s) => DeviceConnection::Unknown(s),
        }
    }
}

// ---------------------------------------------------------------------------
// DeviceMux
// ---------------------------------------------------------------------------

/// A local device multiplexer.
#[async_trait]
pub trait DeviceMux: Send + Sync {
    /// Lists every device currently visible to the multiplexer.
    async fn list_devices(&self) -> Result<Vec<PhysicalDevice>, UsbTunnelError>;

    /// Opens a tunneled byte stream to `port` on `device`.
    async fn connect(
        &self,
        device: &PhysicalDevice,
        port: u16,
    ) -> Result<Box<dyn TransportStream>, UsbTunnelError>;
}

/// [`DeviceMux`] backed by the system `usbmuxd` daemon.
#[derive(Debug, Clone, Copy, Default)]
pub struct Usbmuxd;

impl Usbmuxd {
    async fn open() -> Result<UsbmuxdConnection, UsbTunnelError> {
        UsbmuxdConnection::default()
            .await
            .map_err(|e| UsbTunnelError::UsbmuxdUnavailable(e.to_string()))
    }
}

#[async_trait]
impl DeviceMux for Usbmuxd {
    async fn list_devices(&self) -> Result<Vec<PhysicalDevice>, UsbTunnelError> {
        let mut muxd = Self::open().await?;

        let devices = muxd
            .get_devices()
            .await
            .map_err(|e| UsbTunnelError::UsbmuxdUnavailable(e.to_string()))?;

        Ok(devices
            .into_iter()
            .map(|d| PhysicalDevice {
                udid: d.udid,
                device_id: d.device_id,
                connection: d.connection_type.into(),
            })
            .collect())
    }

    async fn connect(
        &self,
        device: &PhysicalDevice,
        port: u16,
    ) -> Result<Box<dyn TransportStream>, UsbTunnelError> {
        let mut muxd = Self::open().await?;

        debug!(udid = %device.udid, port, "opening usbmuxd tunnel");
        let idevice = timeout(
            CONNECT_TIMEOUT,
            muxd.connect_to_device(device.device_id, port, MUX_LABEL),
        )
        .await
        .map_err(|_| UsbTunnelError::ConnectionFailed {
            port,
            reason: "timed out".into(),
        })?
        .map_err(|e| UsbTunnelError::ConnectionFailed {
            port,
            reason: e.to_string(),
        })?;

        let socket = idevice.get_socket().ok_or(UsbTunnelError::NoSocket)?;

        // socket is Box<dyn idevice::ReadWrite>, which satisfies TransportStream.
        Ok(Box::new(socket))
    }
}

// ---------------------------------------------------------------------------
// Lookup
// ---------------------------------------------------------------------------

/// Picks the device to use from an enumeration result.
///
/// With a non-empty `serial`, the first device whose UDID matches exactly is
/// returned. Without one, the first enumerated device is returned.
pub fn select_device(
    devices: Vec<PhysicalDevice>,
    serial: Option<&str>,
) -> Result<PhysicalDevice, UsbTunnelError> {
    match serial.filter(|s| !s.is_empty()) {
        Some(serial) => devices
            .into_iter()
            .find(|d| d.udid == serial)
            .ok_or_else(|| UsbTunnelError::DeviceNotFound(serial.to_string())),
        None => {
            if devices.len() > 1 {
                warn!(
                    count = devices.len(),
                    udid = %devices[0].udid,
                    "multiple devices attached and no serial given, using the first"
                );
            }
            devices
                .into_iter()
                .next()
                .ok_or_else(|| UsbTunnelError::DeviceNotFound("no attached devices".into()))
        }
    }
}

/// Enumerates `mux` and resolves the device for `serial`.
pub async fn locate(
    mux: &dyn DeviceMux,
    serial: Option<&str>,
) -> Result<PhysicalDevice, UsbTunnelError> {
    let devices = mux.list_devices().await?;
    debug!(count = devices.len(), serial, "enumerated devices");
    select_device(devices, serial)
}
