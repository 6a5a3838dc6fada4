//! Command channel and session lifecycle.
//!
//! [`WdaClient`] owns the HTTP connection to the automation server's command
//! port. It creates the session, remembers its identifier, and executes
//! [`Command`]s one at a time, returning the undecoded [`RawResponse`] for the
//! caller to convert with the [`response`](crate::response) decoders.
//!
//! # Example
//!
//! ```no_run
//! use wdalink_core::capabilities::{AlertAction, Capabilities};
//! use wdalink_core::client::{Command, WdaClient};
//! use wdalink_core::transport;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let stream = transport::connect_tcp(8100).await?;
//! let client = WdaClient::connect(Box::new(stream)).await?;
//!
//! let caps = Capabilities::new().with_default_alert_action(AlertAction::Accept);
//! let session = client.create_session(&caps).await?;
//! println!("session {}", session.session_id);
//!
//! let text = client.execute(&Command::get("/alert/text")).await?.value_as_string()?;
//! # Ok(())
//! # }
//! ```

use std::sync::RwLock;
use std::time::Duration;

use hyper::header::{CONTENT_TYPE, HOST};
use hyper::{Body, Method, Request};
use serde_json::value::RawValue;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, debug_span, info, trace, warn, Instrument};

use crate::capabilities::{Capabilities, Settings};
use crate::response::{RawResponse, ResponseError, SessionInfo};
use crate::transport::{HttpChannel, TransportError, TransportStream};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Timeout for reading a complete command response.
pub const READ_TIMEOUT: Duration = Duration::from_secs(30);

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur while executing commands.
#[derive(Error, Debug)]
pub enum ClientError {
    /// The exchange with the server failed.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The response could not be decoded, or reported a server error.
    #[error(transparent)]
    Response(#[from] ResponseError),

    /// A session-scoped command was issued before a session exists.
    #[error("no active session")]
    NoSession,

    /// The server answered with a non-success status and no error envelope.
    #[error("unexpected HTTP status {0}")]
    Status(u16),
}

impl ClientError {
    /// The server-reported `(kind, message)`, if this is a server error.
    pub fn server_error(&self) -> Option<(&str, &str)> {
        match self {
            ClientError::Response(ResponseError::Server { kind, message, .. }) => {
                Some((kind, message))
            }
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Command
// ---------------------------------------------------------------------------

/// One request to the automation server.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    /// HTTP method.
    pub method: Method,
    /// Path relative to the server root, or to `/session/{id}` when session-scoped.
    pub path: String,
    /// Optional JSON body.
    pub body: Option<Value>,
    /// Whether the path is prefixed with the active session.
    pub session_scoped: bool,
}

impl Command {
    /// A session-scoped command.
    pub fn new(method: Method, path: impl Into<String>, body: Option<Value>) -> Self {
        Self {
            method,
            path: path.into(),
            body,
            session_scoped: true,
        }
    }

    /// A session-scoped `GET`.
    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path, None)
    }

    /// A session-scoped `POST` with a JSON body.
    pub fn post(path: impl Into<String>, body: Value) -> Self {
        Self::new(Method::POST, path, Some(body))
    }

    /// A session-scoped `DELETE`.
    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path, None)
    }

    /// Addresses the path from the server root instead of the session.
    pub fn without_session(mut self) -> Self {
        self.session_scoped = false;
        self
    }

    /// Resolves the request path against an optional session id.
    fn resolve_path(&self, session_id: Option<&str>) -> Result<String, ClientError> {
        if !self.session_scoped {
            return Ok(self.path.clone());
        }
        let id = session_id.ok_or(ClientError::NoSession)?;
        Ok(format!("/session/{id}{}", self.path))
    }
}

// ---------------------------------------------------------------------------
// WdaClient
// ---------------------------------------------------------------------------

/// Client for the automation server's command port.
///
/// Commands are serialized through an async mutex: one request is in flight
/// per client, and commands complete in the order they were issued. The
/// response body is fully read before the next command may start.
pub struct WdaClient {
    channel: Mutex<Option<HttpChannel>>,
    session: RwLock<Option<SessionInfo>>,
    read_timeout: Duration,
}

impl WdaClient {
    /// Performs the HTTP handshake over `stream`.
    pub async fn connect(stream: Box<dyn TransportStream>) -> Result<Self, TransportError> {
        let channel = HttpChannel::handshake(stream).await?;
        Ok(Self {
            channel: Mutex::new(Some(channel)),
            session: RwLock::new(None),
            read_timeout: READ_TIMEOUT,
        })
    }

    /// Overrides the response read timeout.
    pub fn with_timeout(mut self, read_timeout: Duration) -> Self {
        self.read_timeout = read_timeout;
        self
    }

    /// The active session's identifier.
    pub fn session_id(&self) -> Option<String> {
        self.session_info().map(|s| s.session_id)
    }

    /// The active session's descriptor.
    pub fn session_info(&self) -> Option<SessionInfo> {
        self.session
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn set_session(&self, info: Option<SessionInfo>) {
        *self.session.write().unwrap_or_else(|e| e.into_inner()) = info;
    }

    /// Returns `true` while the connection is usable.
    pub async fn is_connected(&self) -> bool {
        self.channel.lock().await.is_some()
    }

    /// Executes `command` and returns the raw response.
    ///
    /// Non-success statuses are returned as-is; the envelope decoders surface
    /// the server's error.
    pub async fn execute(&self, command: &Command) -> Result<RawResponse, ClientError> {
        let path = command.resolve_path(self.session_id().as_deref())?;
        let span = debug_span!("wda_execute", method = %command.method, path = %path);
        async {
            let request = build_request(&command.method, &path, command.body.as_ref())?;
            let response = self.send(request).await?;
            debug!(status = response.status(), bytes = response.body().len(), "command completed");
            Ok::<RawResponse, ClientError>(response)
        }
        .instrument(span)
        .await
    }

    /// Creates a session with `capabilities` and remembers its identifier.
    pub async fn create_session(
        &self,
        capabilities: &Capabilities,
    ) -> Result<SessionInfo, ClientError> {
        let command = Command::post("/session", capabilities.to_request_body()).without_session();
        let response = self.execute(&command).await?;
        let info = response.value_as_session_info()?;

        info!(session_id = %info.session_id, "session created");
        self.set_session(Some(info.clone()));
        Ok(info)
    }

    /// Applies per-session settings and returns the server's resulting settings.
    pub async fn update_settings(&self, settings: &Settings) -> Result<Box<RawValue>, ClientError> {
        let command = Command::post("/appium/settings", settings.to_request_body());
        let applied = self.execute(&command).await?.value_as_json()?;
        debug!(settings = %applied, "session settings applied");
        Ok(applied)
    }

    /// Deletes the active session on the server and forgets it.
    pub async fn delete_session(&self) -> Result<(), ClientError> {
        let response = self.execute(&Command::delete("")).await?;
        self.set_session(None);
        response.check_err()?;
        Ok(())
    }

    /// Closes the connection; later commands fail with [`TransportError::Closed`].
    pub async fn close(&self) {
        if self.channel.lock().await.take().is_some() {
            debug!("command channel closed");
        }
    }

    /// Sends one request and reads the complete response under the lock.
    async fn send(&self, request: Request<Body>) -> Result<RawResponse, TransportError> {
        let mut guard = self.channel.lock().await;
        let channel = guard.as_mut().ok_or(TransportError::Closed)?;

        let result = timeout(self.read_timeout, async {
            let response = channel.send(request).await?;
            let status = response.status().as_u16();
            let body = hyper::body::to_bytes(response.into_body()).await?;
            trace!(status, body_bytes = body.len(), "response read");
            Ok::<RawResponse, TransportError>(RawResponse::new(status, body))
        })
        .await;

        match result {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e)) => {
                // The connection is likely broken; drop it to prevent reuse.
                warn!(error = %e, "command failed, dropping connection");
                guard.take();
                Err(e)
            }
            Err(_) => {
                // The server may still answer later, leaving a stale response
                // on the connection. Drop it so the next caller gets Closed
                // instead of a mismatched reply.
                warn!(timeout = ?self.read_timeout, "command timed out, dropping connection");
                guard.take();
                Err(TransportError::Timeout)
            }
        }
    }
}

/// Builds an HTTP request for `path` with an optional JSON body.
fn build_request(
    method: &Method,
    path: &str,
    body: Option<&Value>,
) -> Result<Request<Body>, TransportError> {
    let builder = Request::builder()
        .method(method.clone())
        .uri(path)
        .header(HOST, "localhost");

    let request = match body {
        Some(json) => builder
            .header(CONTENT_TYPE, "application/json")
            .body(Body::from(json.to_string()))?,
        None => builder.body(Body::empty())?,
    };
    Ok(request)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
