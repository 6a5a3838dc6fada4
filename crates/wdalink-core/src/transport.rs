//! Transport selection and the HTTP channel layered on top of it.
//!
//! A run talks to the device over two independent byte streams: one for
//! request/response commands and one for the screen stream. Both are reached
//! either through a `usbmuxd` tunnel ([`TransportKind::Usb`]) or over TCP to
//! locally forwarded ports ([`TransportKind::Tcp`]). Either way the caller
//! gets the same [`Transport`], whose streams are plain [`TransportStream`]s.
//!
//! [`HttpChannel`] turns one such stream into a keep-alive HTTP/1.1 client
//! connection, so every command reuses the same socket.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use wdalink_core::config::DeviceConfig;
//! use wdalink_core::device::Device;
//! use wdalink_core::transport::{self, HttpChannel, TransportKind};
//! use wdalink_core::usb_tunnel::{self, Usbmuxd};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mux = Arc::new(Usbmuxd);
//! let physical = usb_tunnel::locate(mux.as_ref(), None).await?;
//! let device = Device::new(physical, &DeviceConfig::default(), mux);
//!
//! let transport = transport::connect(&device, TransportKind::Tcp).await?;
//! let mut channel = HttpChannel::handshake(transport.command).await?;
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::time::Duration;

use futures_util::future::poll_fn;
use hyper::client::conn::{self, SendRequest};
use hyper::{Body, Request, Response};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

use crate::device::Device;

/// Timeout for establishing a TCP connection.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Host forwarded ports are reached on.
const LOCALHOST: &str = "127.0.0.1";

// ---------------------------------------------------------------------------
// TransportStream trait
// ---------------------------------------------------------------------------

/// A bidirectional async byte stream.
///
/// Both [`TcpStream`] and USB tunnel sockets (`idevice::ReadWrite`) satisfy
/// these bounds, as does [`tokio::io::DuplexStream`] in tests.
pub trait TransportStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> TransportStream for T {}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors raised while connecting or exchanging requests.
#[derive(Error, Debug)]
pub enum TransportError {
    /// A port could not be connected.
    #[error("failed to connect to port {port}: {reason}")]
    Connect {
        /// The port that failed.
        port: u16,
        /// Underlying failure.
        reason: String,
    },

    /// A response did not arrive in time.
    #[error("operation timed out")]
    Timeout,

    /// The connection is gone; no further requests can be sent on it.
    #[error("connection closed")]
    Closed,

    /// The HTTP exchange failed.
    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),

    /// The request could not be built.
    #[error("invalid request: {0}")]
    InvalidRequest(#[from] hyper::http::Error),
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

/// How the device ports are reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Tunnel through usbmuxd to the ports on the device.
    #[default]
    Usb,
    /// Plain TCP to ports forwarded on localhost.
    Tcp,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Usb => write!(f, "usb"),
            TransportKind::Tcp => write!(f, "tcp"),
        }
    }
}

/// The command and screen-stream connections to one device.
pub struct Transport {
    /// How both streams were opened.
    pub kind: TransportKind,
    /// Request/response command stream.
    pub command: Box<dyn TransportStream>,
    /// Screen stream.
    pub stream: Box<dyn TransportStream>,
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transport").field("kind", &self.kind).finish_non_exhaustive()
    }
}

/// Opens the command and stream connections to `device`.
///
/// The command port is opened first. If the stream port then fails, the
/// command stream is dropped before the error is returned, so a failed
/// connect never leaves a half-open pair behind.
pub async fn connect(device: &Device, kind: TransportKind) -> Result<Transport, TransportError> {
    info!(udid = %device.udid, %kind, port = device.port, mjpeg_port = device.mjpeg_port, "connecting transport");

    let command = open(device, kind, device.port).await?;
    let stream = open(device, kind, device.mjpeg_port).await?;

    Ok(Transport {
        kind,
        command,
        stream,
    })
}

async fn open(
    device: &Device,
    kind: TransportKind,
    port: u16,
) -> Result<Box<dyn TransportStream>, TransportError> {
    match kind {
        TransportKind::Usb => device
            .mux
            .connect(&device.physical, port)
            .await
            .map_err(|e| TransportError::Connect {
                port,
                reason: e.to_string(),
            }),
        TransportKind::Tcp => {
            let stream = connect_tcp(port).await?;
            Ok(Box::new(stream))
        }
    }
}

/// Connects to a forwarded port on localhost.
pub async fn connect_tcp(port: u16) -> Result<TcpStream, TransportError> {
    debug!(port, "connecting to forwarded port");
    let stream = timeout(CONNECT_TIMEOUT, TcpStream::connect((LOCALHOST, port)))
        .await
        .map_err(|_| TransportError::Connect {
            port,
            reason: "timed out".into(),
        })?
        .map_err(|e| TransportError::Connect {
            port,
            reason: e.to_string(),
        })?;

    stream.set_nodelay(true).map_err(|e| TransportError::Connect {
        port,
        reason: e.to_string(),
    })?;
    if let Err(e) = socket2::SockRef::from(&stream).set_keepalive(true) {
        warn!(port, error = %e, "failed to enable TCP keepalive");
    }
    Ok(stream)
}

// ---------------------------------------------------------------------------
// HttpChannel
// ---------------------------------------------------------------------------

/// An HTTP/1.1 client connection over one [`TransportStream`].
///
/// The connection is driven by a background task. Dropping the channel
/// aborts that task, which closes the underlying stream and ends any
/// response body still being read from it.
pub struct HttpChannel {
    sender: SendRequest<Body>,
    connection: JoinHandle<()>,
}

impl HttpChannel {
    /// Performs the HTTP/1.1 handshake over `stream`.
    pub async fn handshake(stream: Box<dyn TransportStream>) -> Result<Self, TransportError> {
        let (sender, connection) = conn::handshake(stream).await?;
        let connection = tokio::spawn(async move {
            if let Err(e) = connection.await {
                debug!(error = %e, "http connection ended with error");
            }
        });
        Ok(Self { sender, connection })
    }

    /// Sends `request` and returns the response head; the body is streamed.
    ///
    /// Requests are never pipelined: this waits for the previous exchange on
    /// the connection to finish before sending.
    pub async fn send(&mut self, request: Request<Body>) -> Result<Response<Body>, TransportError> {
        trace!(method = %request.method(), uri = %request.uri(), "sending request");
        poll_fn(|cx| self.sender.poll_ready(cx))
            .await
            .map_err(|_| TransportError::Closed)?;
        Ok(self.sender.send_request(request).await?)
    }

    /// Closes the connection.
    pub fn close(self) {}
}

impl Drop for HttpChannel {
    fn drop(&mut self) {
        self.connection.abort();
    }
}
