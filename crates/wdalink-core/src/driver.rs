//! The automation driver interface consumed by test runners.
//!
//! Runners depend on [`AutomationDriver`] only: "execute a command and get a
//! raw response back". Everything else (log capture, typed helpers) is built
//! on top of that one method, so alternative drivers only implement two
//! methods. [`WdaDriver`](crate::wda_driver::WdaDriver) is the implementation
//! for the device automation server.
//!
//! [`DriverError`] unifies the per-module errors and tags each with the stage
//! that failed, so a runner can report "session creation failed: ..." rather
//! than a bare transport error.

use async_trait::async_trait;
use thiserror::Error;

use crate::client::{ClientError, Command};
use crate::response::RawResponse;
use crate::stream::StreamError;
use crate::transport::TransportError;
use crate::usb_tunnel::UsbTunnelError;

/// Errors that can occur during driver operations.
#[derive(Error, Debug)]
pub enum DriverError {
    /// The device could not be found through the multiplexer.
    #[error("device lookup failed: {0}")]
    DeviceLookup(#[source] UsbTunnelError),

    /// A device port could not be connected.
    #[error("connect failed: {0}")]
    Connect(#[source] TransportError),

    /// Creating or configuring the session failed.
    #[error("session creation failed: {0}")]
    Session(#[source] ClientError),

    /// A command failed.
    #[error("command failed: {0}")]
    Command(#[source] ClientError),

    /// Starting or stopping the frame stream failed.
    #[error("frame stream: {0}")]
    Stream(#[from] StreamError),

    /// Starting or stopping server-side log capture failed.
    #[error("log recording failed: {0}")]
    LogRecording(#[source] ClientError),
}

impl DriverError {
    /// The server-reported `(kind, message)`, if the server rejected the call.
    pub fn server_error(&self) -> Option<(&str, &str)> {
        match self {
            DriverError::Session(e) | DriverError::Command(e) | DriverError::LogRecording(e) => {
                e.server_error()
            }
            _ => None,
        }
    }

    /// Re-tags a command failure as a log-recording failure.
    pub(crate) fn into_log_recording(self) -> Self {
        match self {
            DriverError::Command(e) => DriverError::LogRecording(e),
            other => other,
        }
    }
}

/// Which kind of server a driver talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverKind {
    /// The iOS device automation server.
    Wda,
    /// Any other backend. Optional server features are skipped.
    Other,
}

/// A backend that executes automation commands.
#[async_trait]
pub trait AutomationDriver: Send + Sync {
    /// The backend kind.
    fn kind(&self) -> DriverKind;

    /// Executes one command and returns the undecoded response.
    async fn execute_command(&self, command: &Command) -> Result<RawResponse, DriverError>;
}
