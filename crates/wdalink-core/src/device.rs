//! The device a run is bound to.

use std::fmt;
use std::sync::Arc;

use crate::config::DeviceConfig;
use crate::usb_tunnel::{DeviceMux, PhysicalDevice};

/// A located device plus the ports and options used to drive it.
///
/// Built once per run from the locator result and the caller's
/// [`DeviceConfig`]; immutable afterwards.
#[derive(Clone)]
pub struct Device {
    /// The device UDID.
    pub udid: String,
    /// Port of the automation server's command endpoint.
    pub port: u16,
    /// Port of the automation server's MJPEG screen stream.
    pub mjpeg_port: u16,
    /// Whether server-side log capture is started with the session.
    pub log_on: bool,
    /// The multiplexer entry the device was located from.
    pub physical: PhysicalDevice,
    /// The multiplexer used to reach the device.
    pub mux: Arc<dyn DeviceMux>,
}

impl Device {
    /// Binds a located device to the ports and flags in `config`.
    pub fn new(physical: PhysicalDevice, config: &DeviceConfig, mux: Arc<dyn DeviceMux>) -> Self {
        Self {
            udid: physical.udid.clone(),
            port: config.port,
            mjpeg_port: config.mjpeg_port,
            log_on: config.log_on,
            physical,
            mux,
        }
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("udid", &self.udid)
            .field("port", &self.port)
            .field("mjpeg_port", &self.mjpeg_port)
            .field("log_on", &self.log_on)
            .field("connection", &self.physical.connection)
            .finish()
    }
}
