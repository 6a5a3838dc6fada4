//! Background consumer for the device's MJPEG screen stream.
//!
//! [`FrameStream`] issues one `GET /` on the stream transport, then spawns a
//! task that reads the endless `multipart/x-mixed-replace` body section by
//! section and keeps the most recent complete JPEG in a shared
//! [`FrameBuffer`]. Readers poll the buffer at any time without waiting for
//! the task.
//!
//! # Example
//!
//! ```no_run
//! use wdalink_core::stream::FrameStream;
//! use wdalink_core::transport;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let stream = transport::connect_tcp(9100).await?;
//! let mut frames = FrameStream::new();
//! frames.start(Box::new(stream)).await?;
//!
//! if let Some(jpeg) = frames.current_frame() {
//!     println!("{} bytes", jpeg.len());
//! }
//!
//! // Later, stop the consumer
//! frames.stop().await?;
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use bytes::Bytes;
use hyper::header::{CONTENT_TYPE, HOST};
use hyper::{Body, Request};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, debug_span, info, trace, Instrument};

use crate::multipart::{parse_boundary, MultipartReader};
use crate::transport::{HttpChannel, TransportError, TransportStream};

/// Timeout for the stream's response headers.
pub const START_TIMEOUT: Duration = Duration::from_secs(10);

/// First delay after a failed section read.
const BASE_BACKOFF: Duration = Duration::from_millis(10);

/// Longest delay between retries.
const MAX_BACKOFF: Duration = Duration::from_secs(1);

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors from starting or stopping a [`FrameStream`].
#[derive(Error, Debug)]
pub enum StreamError {
    /// The stream response could not be obtained or has no usable boundary.
    #[error("failed to start frame stream: {0}")]
    Start(String),

    /// The operation is not valid in the consumer's current state.
    #[error("invalid frame stream state: {0}")]
    InvalidState(&'static str),

    /// The stream connection failed.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

// ---------------------------------------------------------------------------
// FrameBuffer
// ---------------------------------------------------------------------------

/// The most recent complete frame, shared between the reader task and callers.
///
/// Frames are replaced whole; a reader sees either a complete frame or
/// `None`, never a partial one.
#[derive(Clone, Default)]
pub struct FrameBuffer {
    inner: Arc<RwLock<Option<Bytes>>>,
}

impl FrameBuffer {
    /// Returns the current frame.
    pub fn current(&self) -> Option<Bytes> {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn replace(&self, frame: Option<Bytes>) {
        *self.inner.write().unwrap_or_else(|e| e.into_inner()) = frame;
    }
}

impl fmt::Debug for FrameBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameBuffer")
            .field("frame_bytes", &self.current().map(|frame| frame.len()))
            .finish()
    }
}

// ---------------------------------------------------------------------------
// FrameStream
// ---------------------------------------------------------------------------

/// Lifecycle of a [`FrameStream`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Created, not yet started.
    Idle,
    /// The reader task is running.
    Streaming,
    /// Stopped or failed to start. A new consumer is needed to stream again.
    Stopped,
}

struct ReaderTask {
    cancel_token: CancellationToken,
    join_handle: JoinHandle<()>,
}

/// Consumer of one MJPEG screen stream.
pub struct FrameStream {
    state: StreamState,
    buffer: FrameBuffer,
    task: Option<ReaderTask>,
    start_timeout: Duration,
}

impl Default for FrameStream {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for FrameStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameStream")
            .field("state", &self.state)
            .field("buffer", &self.buffer)
            .finish_non_exhaustive()
    }
}

impl FrameStream {
    /// Creates an idle consumer with an empty buffer.
    pub fn new() -> Self {
        Self {
            state: StreamState::Idle,
            buffer: FrameBuffer::default(),
            task: None,
            start_timeout: START_TIMEOUT,
        }
    }

    /// Overrides the timeout for the stream's response headers.
    pub fn with_start_timeout(mut self, start_timeout: Duration) -> Self {
        self.start_timeout = start_timeout;
        self
    }

    /// The consumer's lifecycle state.
    pub fn state(&self) -> StreamState {
        self.state
    }

    /// Returns the latest complete frame, if any.
    pub fn current_frame(&self) -> Option<Bytes> {
        self.buffer.current()
    }

    /// A handle to the shared buffer, for readers that outlive `&self`.
    pub fn buffer(&self) -> FrameBuffer {
        self.buffer.clone()
    }

    /// Requests the stream over `stream` and spawns the reader task.
    ///
    /// Any failure leaves the consumer [`Stopped`](StreamState::Stopped) with
    /// no frame.
    pub async fn start(&mut self, stream: Box<dyn TransportStream>) -> Result<(), StreamError> {
        if self.state != StreamState::Idle {
            return Err(StreamError::InvalidState("frame stream already started"));
        }

        let opened = open_stream(stream, self.start_timeout)
            .instrument(debug_span!("frame_stream_start"))
            .await;
        let (channel, body, boundary) = match opened {
            Ok(opened) => opened,
            Err(e) => {
                self.state = StreamState::Stopped;
                return Err(e);
            }
        };

        info!(%boundary, "frame stream started");
        let reader = MultipartReader::new(body, &boundary);
        let cancel_token = CancellationToken::new();
        let token_clone = cancel_token.clone();
        let buffer = self.buffer.clone();

        let join_handle = tokio::spawn(async move {
            run_loop(channel, reader, buffer, token_clone).await;
        });

        self.task = Some(ReaderTask {
            cancel_token,
            join_handle,
        });
        self.state = StreamState::Streaming;
        Ok(())
    }

    /// Cancels the reader task, closes the connection and waits for the task.
    ///
    /// Valid only while streaming; calling it again fails with
    /// [`StreamError::InvalidState`].
    pub async fn stop(&mut self) -> Result<(), StreamError> {
        if self.state != StreamState::Streaming {
            return Err(StreamError::InvalidState("frame stream is not running"));
        }
        self.state = StreamState::Stopped;

        if let Some(task) = self.task.take() {
            task.cancel_token.cancel();
            let _ = task.join_handle.await;
        }
        info!("frame stream stopped");
        Ok(())
    }
}

impl Drop for FrameStream {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.cancel_token.cancel();
        }
    }
}

/// Sends the stream request and returns the channel, body and boundary.
async fn open_stream(
    stream: Box<dyn TransportStream>,
    start_timeout: Duration,
) -> Result<(HttpChannel, Body, String), StreamError> {
    let request = Request::get("/")
        .header(HOST, "localhost")
        .body(Body::empty())
        .map_err(TransportError::from)?;

    let (channel, response) = timeout(start_timeout, async {
        let mut channel = HttpChannel::handshake(stream).await?;
        let response = channel.send(request).await?;
        Ok::<_, TransportError>((channel, response))
    })
    .await
    .map_err(|_| StreamError::Start("timed out waiting for stream response".into()))?
    .map_err(|e| StreamError::Start(e.to_string()))?;

    let content_type = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| StreamError::Start("response has no content type".into()))?;
    debug!(status = response.status().as_u16(), content_type, "stream response received");

    let boundary = parse_boundary(content_type)
        .ok_or_else(|| StreamError::Start(format!("no multipart boundary in {content_type:?}")))?;

    Ok((channel, response.into_body(), boundary))
}

/// Reads sections until cancelled. The channel is dropped on exit, closing
/// the connection.
async fn run_loop(
    channel: HttpChannel,
    mut reader: MultipartReader<Body>,
    buffer: FrameBuffer,
    cancel_token: CancellationToken,
) {
    let mut consecutive_errors: u32 = 0;

    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => {
                break;
            }
            part = reader.next_part() => match part {
                Ok(frame) => {
                    trace!(bytes = frame.len(), "frame received");
                    buffer.replace(Some(frame));
                    if consecutive_errors > 0 {
                        debug!("frame stream recovered");
                    }
                    consecutive_errors = 0;
                }
                Err(e) => {
                    buffer.replace(None);
                    consecutive_errors = consecutive_errors.saturating_add(1);
                    let delay = backoff_interval(consecutive_errors);
                    debug!(error = %e, consecutive_errors, ?delay, "frame read failed");

                    tokio::select! {
                        _ = cancel_token.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    channel.close();
    debug!("frame reader exited");
}

/// Delay after `consecutive_errors` failed reads.
/// Doubles with each error, capped at one second.
fn backoff_interval(consecutive_errors: u32) -> Duration {
    let exponent = consecutive_errors.saturating_sub(1);
    let multiplier = 1u32.checked_shl(exponent).unwrap_or(u32::MAX);
    std::cmp::min(BASE_BACKOFF.saturating_mul(multiplier), MAX_BACKOFF)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
