//! Shared test helpers for wdalink-core integration tests.
//!
//! This module provides a mock automation server speaking the JSON envelope
//! protocol over real TCP, a mock MJPEG stream server, and a [`DeviceMux`]
//! whose "tunnels" are TCP connections to those mocks.

#![allow(dead_code)]

use std::convert::Infallible;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use hyper::body::Sender;
use hyper::header::CONTENT_TYPE;
use hyper::server::conn::Http;
use hyper::service::service_fn;
use hyper::{Body, Method, Request, Response};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use wdalink_core::config::DeviceConfig;
use wdalink_core::transport::{self, TransportKind, TransportStream};
use wdalink_core::usb_tunnel::{DeviceConnection, DeviceMux, PhysicalDevice, UsbTunnelError};

pub const SESSION_ID: &str = "MOCK-SESSION";
pub const UDID: &str = "00008110-001A0C123456789A";
pub const SCREENSHOT: &[u8] = b"\x89PNG\r\n\x1a\nmock";
pub const LOG_PAYLOAD: &str = "2026-10-19 12:00:00 mock log line";
pub const BOUNDARY: &str = "BoundaryString";

// ---------------------------------------------------------------------------
// Mock automation server
// ---------------------------------------------------------------------------

/// A request as received by [`MockWda`].
#[derive(Debug, Clone)]
pub struct Recorded {
    pub method: Method,
    pub path: String,
    pub body: Value,
}

/// A mock automation server listening on a local TCP port.
///
/// Every accepted connection is counted so tests can assert that commands
/// reuse one connection. Connections are counted again when the client
/// hangs up.
pub struct MockWda {
    pub port: u16,
    connections: Arc<AtomicUsize>,
    closed: Arc<AtomicUsize>,
    requests: Arc<Mutex<Vec<Recorded>>>,
}

impl MockWda {
    /// Serve the default route table.
    pub async fn start() -> Self {
        Self::start_with_latency(Duration::ZERO).await
    }

    /// Serve the default route table, sleeping a path-dependent jitter
    /// (up to `max_latency`) before every reply.
    pub async fn start_with_latency(max_latency: Duration) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let connections = Arc::new(AtomicUsize::new(0));
        let closed = Arc::new(AtomicUsize::new(0));
        let requests = Arc::new(Mutex::new(Vec::new()));

        let counter = connections.clone();
        let closed_counter = closed.clone();
        let log = requests.clone();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                counter.fetch_add(1, Ordering::SeqCst);
                let log = log.clone();
                let closed_counter = closed_counter.clone();

                tokio::spawn(async move {
                    let service = service_fn(move |req: Request<Body>| {
                        let log = log.clone();
                        async move { Ok::<_, Infallible>(handle(req, log, max_latency).await) }
                    });
                    let _ = Http::new().http1_only(true).serve_connection(stream, service).await;
                    closed_counter.fetch_add(1, Ordering::SeqCst);
                });
            }
        });

        Self {
            port,
            connections,
            closed,
            requests,
        }
    }

    /// Number of TCP connections accepted so far.
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// Waits until `n` connections have been accepted.
    pub async fn wait_for_connections(&self, n: usize) -> bool {
        for _ in 0..100 {
            if self.connections() >= n {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    /// Number of connections the client has closed so far.
    pub fn closed_connections(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    /// Waits until `n` connections have been closed.
    pub async fn wait_for_closed(&self, n: usize) -> bool {
        for _ in 0..100 {
            if self.closed_connections() >= n {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    /// Every request received so far, in arrival order.
    pub fn requests(&self) -> Vec<Recorded> {
        self.requests.lock().unwrap().clone()
    }

    /// Paths of every request received so far.
    pub fn paths(&self) -> Vec<String> {
        self.requests().into_iter().map(|r| r.path).collect()
    }
}

async fn handle(
    req: Request<Body>,
    log: Arc<Mutex<Vec<Recorded>>>,
    max_latency: Duration,
) -> Response<Body> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let bytes = hyper::body::to_bytes(req.into_body()).await.unwrap_or_default();
    let body: Value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);

    if !max_latency.is_zero() {
        // Deterministic jitter: earlier requests of a burst may answer later.
        let jitter = (path.len() as u64 * 7919) % (max_latency.as_millis() as u64 + 1);
        tokio::time::sleep(Duration::from_millis(jitter)).await;
    }

    let (status, value) = route(&method, &path, &body);
    log.lock().unwrap().push(Recorded { method, path, body });

    let envelope = json!({ "value": value, "sessionId": SESSION_ID });
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "application/json")
        .body(Body::from(envelope.to_string()))
        .unwrap()
}

fn route(method: &Method, path: &str, body: &Value) -> (u16, Value) {
    let session = format!("/session/{SESSION_ID}");
    let scoped = path.strip_prefix(session.as_str());

    match (method.as_str(), path, scoped) {
        ("POST", "/session", _) => (
            200,
            json!({ "sessionId": SESSION_ID, "capabilities": { "device": "iphone", "sdkVersion": "17.4" } }),
        ),
        ("GET", "/status", _) => (
            200,
            json!({ "state": "success", "ready": true, "os": { "name": "iOS" } }),
        ),
        ("GET", "/screenshot", _) => (200, json!(BASE64.encode(SCREENSHOT))),
        ("GET", "/wda/locked", _) => (200, json!(false)),
        ("POST", "/wda/homescreen", _) => (200, Value::Null),
        ("POST", "/gtf/automation/log", _) => match body["action"].as_str() {
            Some("start") => (200, Value::Null),
            Some("stop") => (200, json!(LOG_PAYLOAD)),
            _ => (400, json!({ "error": "invalid argument", "message": "unknown action" })),
        },
        ("POST", _, Some("/appium/settings")) => (200, body["settings"].clone()),
        ("DELETE", _, Some("")) => (200, Value::Null),
        ("GET", _, Some("/alert/text")) => (
            404,
            json!({ "error": "no such alert", "message": "An attempt was made to operate on a modal dialog when one was not open" }),
        ),
        ("POST", _, Some("/element")) => find(body, false),
        ("POST", _, Some("/elements")) => find(body, true),
        _ => (
            404,
            json!({ "error": "unknown command", "message": format!("Unhandled endpoint: {path}") }),
        ),
    }
}

/// Elements with `value == "missing"` do not exist; everything else matches.
fn find(body: &Value, many: bool) -> (u16, Value) {
    let value = body["value"].as_str().unwrap_or_default();
    if value == "missing" {
        let message = format!(
            "Unable to find an element using '{}', value '{value}' {{using={}, value={value}}}",
            body["using"].as_str().unwrap_or_default(),
            body["using"].as_str().unwrap_or_default(),
        );
        return (404, json!({ "error": "no such element", "message": message }));
    }
    if many {
        (
            200,
            json!([
                { "ELEMENT": format!("{value}-1") },
                { "element-6066-11e4-a52e-4f735466cecf": format!("{value}-2") }
            ]),
        )
    } else {
        (200, json!({ "ELEMENT": format!("{value}-1") }))
    }
}

// ---------------------------------------------------------------------------
// Mock MJPEG stream
// ---------------------------------------------------------------------------

/// A mock screen-stream server. Each accepted stream request hands its body
/// sender to the test through [`MockMjpeg::next_sender`].
pub struct MockMjpeg {
    pub port: u16,
    senders: tokio::sync::Mutex<mpsc::UnboundedReceiver<Sender>>,
}

impl MockMjpeg {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (tx, rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                let tx = tx.clone();
                tokio::spawn(async move {
                    let service = service_fn(move |_req: Request<Body>| {
                        let (sender, body) = Body::channel();
                        let _ = tx.send(sender);
                        let response = Response::builder()
                            .header(
                                CONTENT_TYPE,
                                format!("multipart/x-mixed-replace; boundary=--{BOUNDARY}"),
                            )
                            .body(body)
                            .unwrap();
                        async move { Ok::<_, Infallible>(response) }
                    });
                    let _ = Http::new().http1_only(true).serve_connection(stream, service).await;
                });
            }
        });

        Self {
            port,
            senders: tokio::sync::Mutex::new(rx),
        }
    }

    /// Waits for the next stream request and returns its body sender.
    pub async fn next_sender(&self) -> Sender {
        tokio::time::timeout(Duration::from_secs(5), self.senders.lock().await.recv())
            .await
            .expect("no stream request arrived")
            .expect("stream server stopped")
    }
}

/// One multipart section carrying `frame`.
pub fn jpeg_section(frame: &[u8]) -> Bytes {
    let mut out = format!(
        "--{BOUNDARY}\r\nContent-type: image/jpg\r\nContent-Length: {}\r\n\r\n",
        frame.len()
    )
    .into_bytes();
    out.extend_from_slice(frame);
    out.extend_from_slice(b"\r\n");
    Bytes::from(out)
}

// ---------------------------------------------------------------------------
// Device multiplexer
// ---------------------------------------------------------------------------

/// A [`DeviceMux`] with a fixed device list whose tunnels are TCP
/// connections to localhost.
pub struct StaticMux {
    devices: Vec<PhysicalDevice>,
    connects: Mutex<Vec<u16>>,
}

impl StaticMux {
    pub fn new(udids: &[&str]) -> Arc<Self> {
        let devices = udids
            .iter()
            .enumerate()
            .map(|(i, udid)| PhysicalDevice {
                udid: udid.to_string(),
                device_id: i as u32 + 1,
                connection: DeviceConnection::Usb,
            })
            .collect();
        Arc::new(Self {
            devices,
            connects: Mutex::new(Vec::new()),
        })
    }

    /// Ports tunneled so far, in order.
    pub fn connects(&self) -> Vec<u16> {
        self.connects.lock().unwrap().clone()
    }
}

#[async_trait]
impl DeviceMux for StaticMux {
    async fn list_devices(&self) -> Result<Vec<PhysicalDevice>, UsbTunnelError> {
        Ok(self.devices.clone())
    }

    async fn connect(
        &self,
        _device: &PhysicalDevice,
        port: u16,
    ) -> Result<Box<dyn TransportStream>, UsbTunnelError> {
        self.connects.lock().unwrap().push(port);
        let stream = transport::connect_tcp(port)
            .await
            .map_err(|e| UsbTunnelError::ConnectionFailed {
                port,
                reason: e.to_string(),
            })?;
        Ok(Box::new(stream))
    }
}

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

/// A config pointing at the mock ports.
pub fn config(wda: &MockWda, mjpeg_port: u16, kind: TransportKind) -> DeviceConfig {
    DeviceConfig {
        udid: None,
        port: wda.port,
        mjpeg_port,
        log_on: false,
        transport: kind,
        reset_to_home: false,
    }
}

/// A local port with nothing listening on it.
pub async fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}
