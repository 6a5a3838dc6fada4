//! [`AutomationDriver`] implementation for the device automation server.
//!
//! [`WdaDriver`] wires the pieces together for one run: it locates the
//! device, opens both transports, performs the HTTP handshake on the
//! command channel and keeps the stream transport until the frame stream
//! is started.
//!
//! # Example
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
//! let locked = driver.is_locked().await?;
//! let png = driver.screenshot().await?;
//!
//! driver.start_frame_stream().await?;
//! let frame = driver.current_frame();
//! driver.stop_frame_stream().await?;
//! driver.close().await;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::value::RawValue;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::capabilities::{AlertAction, Capabilities, Settings};
use crate::client::{ClientError, Command, WdaClient};
use crate::config::DeviceConfig;
use crate::device::Device;
use crate::driver::{AutomationDriver, DriverError, DriverKind};
use crate::log_recorder::LogRecorder;
use crate::response::{RawResponse, SessionInfo};
use crate::stream::{FrameBuffer, FrameStream, StreamError, StreamState};
use crate::transport::{self, TransportStream};
use crate::usb_tunnel::{self, DeviceMux};

/// Identifier for log capture started by [`WdaDriver::open`].
pub const DEFAULT_LOG_IDENTIFIER: &str = "wdalink_log";

/// Wraps a command-stage failure.
fn command_error(err: impl Into<ClientError>) -> DriverError {
    DriverError::Command(err.into())
}

/// A connected driver for one device.
pub struct WdaDriver {
    device: Device,
    client: WdaClient,
    stream_transport: Mutex<Option<Box<dyn TransportStream>>>,
    frames: Mutex<FrameStream>,
    frame_buffer: FrameBuffer,
}

impl WdaDriver {
    /// Locates the device and connects both ports. No session is created.
    #[instrument(skip(mux, config), fields(udid = config.udid.as_deref(), transport = %config.transport))]
    pub async fn connect(mux: Arc<dyn DeviceMux>, config: &DeviceConfig) -> Result<Self, DriverError> {
        let physical = usb_tunnel::locate(mux.as_ref(), config.udid.as_deref())
            .await
            .map_err(DriverError::DeviceLookup)?;
        let device = Device::new(physical, config, mux);

        let transport = transport::connect(&device, config.transport)
            .await
            .map_err(DriverError::Connect)?;
        let client = WdaClient::connect(transport.command)
            .await
            .map_err(DriverError::Connect)?;

        let frames = FrameStream::new();
        let frame_buffer = frames.buffer();
        info!(udid = %device.udid, "driver connected");

        Ok(Self {
            device,
            client,
            stream_transport: Mutex::new(Some(transport.stream)),
            frames: Mutex::new(frames),
            frame_buffer,
        })
    }

    /// Connects, creates a session and applies the recommended settings.
    ///
    /// Unexpected alerts are accepted by default. With
    /// [`DeviceConfig::reset_to_home`] set, the device is sent to the home
    /// screen first. When the configuration enables logging, server-side log
    /// capture is started as well.
    pub async fn open(mux: Arc<dyn DeviceMux>, config: &DeviceConfig) -> Result<Self, DriverError> {
        let driver = Self::connect(mux, config).await?;

        if config.reset_to_home {
            info!("switching to home screen");
            driver.home_screen().await.map_err(|e| match e {
                DriverError::Command(err) => DriverError::Session(err),
                other => other,
            })?;
        }

        let capabilities = Capabilities::new().with_default_alert_action(AlertAction::Accept);
        driver.create_session(&capabilities).await?;
        driver.update_settings(&Settings::recommended()).await?;

        if driver.device.log_on {
            driver.start_log_recording(DEFAULT_LOG_IDENTIFIER).await?;
        }
        Ok(driver)
    }

    /// The device this driver is bound to.
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// The active session's identifier.
    pub fn session_id(&self) -> Option<String> {
        self.client.session_id()
    }

    // -----------------------------------------------------------------------
    // Session
    // -----------------------------------------------------------------------

    /// Creates a session with `capabilities` and records its identifier.
    pub async fn create_session(&self, capabilities: &Capabilities) -> Result<SessionInfo, DriverError> {
        self.client
            .create_session(capabilities)
            .await
            .map_err(DriverError::Session)
    }

    /// Applies `settings` to the active session.
    pub async fn update_settings(&self, settings: &Settings) -> Result<Box<RawValue>, DriverError> {
        self.client
            .update_settings(settings)
            .await
            .map_err(DriverError::Session)
    }

    /// Deletes the active session. Session-scoped commands fail until a new one is created.
    pub async fn delete_session(&self) -> Result<(), DriverError> {
        self.client.delete_session().await.map_err(command_error)
    }

    // -----------------------------------------------------------------------
    // Log capture
    // -----------------------------------------------------------------------

    /// Starts server-side log capture tagged with `identifier`.
    pub async fn start_log_recording(&self, identifier: &str) -> Result<(), DriverError> {
        LogRecorder::new(self).start(identifier).await
    }

    /// Stops log capture and returns the collected payload.
    pub async fn stop_log_recording(&self) -> Result<Value, DriverError> {
        LogRecorder::new(self).stop().await
    }

    // -----------------------------------------------------------------------
    // Frame stream
    // -----------------------------------------------------------------------

    /// Starts consuming the screen stream.
    ///
    /// The stream transport is handed to the consumer, so this can succeed
    /// at most once per driver.
    pub async fn start_frame_stream(&self) -> Result<(), DriverError> {
        let stream = self
            .stream_transport
            .lock()
            .await
            .take()
            .ok_or(StreamError::InvalidState("stream transport already used"))?;
        self.frames.lock().await.start(stream).await?;
        Ok(())
    }

    /// The latest complete frame. Never waits on the reader task.
    pub fn current_frame(&self) -> Option<Bytes> {
        self.frame_buffer.current()
    }

    /// Stops the screen stream.
    pub async fn stop_frame_stream(&self) -> Result<(), DriverError> {
        self.frames.lock().await.stop().await?;
        Ok(())
    }

    /// Stops the screen stream if it is running and closes both connections.
    pub async fn close(&self) {
        let mut frames = self.frames.lock().await;
        if frames.state() == StreamState::Streaming {
            if let Err(e) = frames.stop().await {
                warn!(error = %e, "failed to stop frame stream");
            }
        }
        self.stream_transport.lock().await.take();
        self.client.close().await;
        debug!(udid = %self.device.udid, "driver closed");
    }

    // -----------------------------------------------------------------------
    // Typed commands
    // -----------------------------------------------------------------------

    /// Server status document.
    pub async fn status(&self) -> Result<Box<RawValue>, DriverError> {
        let command = Command::get("/status").without_session();
        self.execute_command(&command)
            .await?
            .value_as_json()
            .map_err(command_error)
    }

    /// PNG screenshot of the current screen.
    pub async fn screenshot(&self) -> Result<Vec<u8>, DriverError> {
        let command = Command::get("/screenshot").without_session();
        self.execute_command(&command)
            .await?
            .value_decode_base64()
            .map_err(command_error)
    }

    /// Finds the first element matching `using`/`value`.
    pub async fn find_element(&self, using: &str, value: &str) -> Result<String, DriverError> {
        let command = Command::post("/element", json!({ "using": using, "value": value }));
        self.execute_command(&command)
            .await?
            .value_as_element_id()
            .map_err(command_error)
    }

    /// Finds every element matching `using`/`value`.
    pub async fn find_elements(&self, using: &str, value: &str) -> Result<Vec<String>, DriverError> {
        let command = Command::post("/elements", json!({ "using": using, "value": value }));
        self.execute_command(&command)
            .await?
            .value_as_element_ids()
            .map_err(command_error)
    }

    /// Text of the open alert.
    pub async fn alert_text(&self) -> Result<String, DriverError> {
        self.execute_command(&Command::get("/alert/text"))
            .await?
            .value_as_string()
            .map_err(command_error)
    }

    /// Brings SpringBoard to the foreground.
    pub async fn home_screen(&self) -> Result<(), DriverError> {
        let command = Command::post("/wda/homescreen", json!({})).without_session();
        self.execute_command(&command)
            .await?
            .check_err()
            .map_err(command_error)
    }

    /// Whether the device screen is locked.
    pub async fn is_locked(&self) -> Result<bool, DriverError> {
        let command = Command::get("/wda/locked").without_session();
        self.execute_command(&command)
            .await?
            .value_as_bool()
            .map_err(command_error)
    }
}

#[async_trait]
impl AutomationDriver for WdaDriver {
    fn kind(&self) -> DriverKind {
        DriverKind::Wda
    }

    async fn execute_command(&self, command: &Command) -> Result<RawResponse, DriverError> {
        self.client.execute(command).await.map_err(command_error)
    }
}
