//! # wdalink-core
//!
//! Client driver for WebDriverAgent-style automation servers running on iOS
//! devices.
//!
//! This crate locates a device through `usbmuxd`, connects to the server's
//! command and screen-stream ports (tunneled over USB or through locally
//! forwarded TCP ports), manages the automation session, and decodes the
//! server's JSON response envelope into typed results.
//!
//! ## Modules
//!
//! - [`usb_tunnel`] - Device enumeration and USB tunnels via `usbmuxd`
//! - [`transport`] - Command/stream connections and the HTTP channel on top
//! - [`client`] - Command execution and session lifecycle
//! - [`response`] - Response envelope decoding and the server error taxonomy
//! - [`stream`] - Background MJPEG screen-stream consumer
//! - [`log_recorder`] - Server-side log capture
//! - [`driver`] / [`wda_driver`] - The driver interface and its implementation
//! - [`config`] - Ports, transport choice and environment overrides
//!
//! ## External Dependencies
//!
//! USB transport requires a running `usbmuxd` (Apple Mobile Device Service on
//! macOS, or the `usbmuxd` daemon on Linux). TCP transport requires the
//! server ports to be forwarded to localhost, e.g. with `iproxy`.
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use wdalink_core::config::DeviceConfig;
//! use wdalink_core::usb_tunnel::Usbmuxd;
//! use wdalink_core::wda_driver::WdaDriver;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = DeviceConfig::load().with_env_overrides();
//! let driver = WdaDriver::open(Arc::new(Usbmuxd), &config).await?;
//!
//! if let Ok(text) = driver.alert_text().await {
//!     println!("alert: {text}");
//! }
//! driver.close().await;
//! # Ok(())
//! # }
//! ```

pub mod capabilities;
pub mod client;
pub mod config;
pub mod device;
pub mod driver;
pub mod log_recorder;
pub mod multipart;
pub mod response;
pub mod stream;
pub mod transport;
pub mod usb_tunnel;
pub mod wda_driver;
