//! Server-side log capture.
//!
//! The automation server can record its own log for the duration of a test
//! run. Capture is started with an identifier and stopped later; the stop
//! call returns whatever the server collected. Capture is optional: against
//! a driver that is not [`DriverKind::Wda`], both calls succeed without
//! touching the server.

use serde_json::{json, Value};
use tracing::{debug, info};

use crate::client::{ClientError, Command};
use crate::driver::{AutomationDriver, DriverError, DriverKind};
use crate::response::RawResponse;

/// Endpoint for starting and stopping log capture. Not session-scoped.
pub const LOG_ENDPOINT: &str = "/gtf/automation/log";

/// Capture type requested from the server.
const LOG_TYPE: u32 = 2;

/// Starts and stops log capture through an [`AutomationDriver`].
pub struct LogRecorder<'a> {
    driver: &'a dyn AutomationDriver,
}

impl<'a> LogRecorder<'a> {
    /// Sends capture requests through `driver`.
    pub fn new(driver: &'a dyn AutomationDriver) -> Self {
        Self { driver }
    }

    /// Starts capture tagged with `identifier`.
    pub async fn start(&self, identifier: &str) -> Result<(), DriverError> {
        if self.driver.kind() != DriverKind::Wda {
            debug!("log capture not supported by driver, skipping start");
            return Ok(());
        }

        let body = json!({ "action": "start", "type": LOG_TYPE, "identifier": identifier });
        self.send(body).await?;
        info!(identifier, "log capture started");
        Ok(())
    }

    /// Stops capture and returns the server's payload.
    ///
    /// Returns an empty string payload for drivers without log capture.
    pub async fn stop(&self) -> Result<Value, DriverError> {
        if self.driver.kind() != DriverKind::Wda {
            debug!("log capture not supported by driver, returning empty payload");
            return Ok(Value::String(String::new()));
        }

        let response = self.send(json!({ "action": "stop" })).await?;
        let payload = response
            .value_as::<Value>("log payload")
            .map_err(|e| DriverError::LogRecording(e.into()))?;
        info!("log capture stopped");
        Ok(payload)
    }

    /// Posts `body` and fails on an error envelope or a non-success status.
    async fn send(&self, body: Value) -> Result<RawResponse, DriverError> {
        let command = Command::post(LOG_ENDPOINT, body).without_session();
        let response = self
            .driver
            .execute_command(&command)
            .await
            .map_err(DriverError::into_log_recording)?;

        response
            .check_err()
            .map_err(|e| DriverError::LogRecording(e.into()))?;
        if !response.is_success() {
            return Err(DriverError::LogRecording(ClientError::Status(
                response.status(),
            )));
        }
        Ok(response)
    }
}
