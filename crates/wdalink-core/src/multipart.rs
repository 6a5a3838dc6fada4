//! Incremental reader for `multipart/x-mixed-replace` bodies.
//!
//! The screen stream is an endless HTTP response whose body is a sequence
//! of sections, each carrying one JPEG frame:
//!
//! ```text
//! --BoundaryString\r\n
//! Content-type: image/jpg\r\n
//! Content-Length: 12345\r\n
//! \r\n
//! <12345 bytes of JPEG>\r\n
//! --BoundaryString\r\n
//! ...
//! ```
//!
//! [`MultipartReader`] pulls chunks from any `Stream` of [`Bytes`] (a hyper
//! body in production, an in-memory stream in tests) and yields one
//! complete section body per [`next_part`](MultipartReader::next_part) call.
//! The section's `Content-Length` is used when present; otherwise the body
//! extends to the next delimiter.

use bytes::{Buf, Bytes, BytesMut};
use futures_util::{Stream, StreamExt};
use thiserror::Error;

/// Largest section accepted before the reader gives up on it.
pub const MAX_PART_SIZE: usize = 16 * 1024 * 1024;

/// Largest section header block accepted.
pub const MAX_HEADER_SIZE: usize = 8 * 1024;

const CRLF: &[u8] = b"\r\n";
const HEADER_END: &[u8] = b"\r\n\r\n";

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors returned while reading a section.
#[derive(Error, Debug)]
pub enum MultipartError {
    /// The underlying body stream failed.
    #[error("body stream error: {0}")]
    Source(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// The body ended in the middle of a section or before any delimiter.
    #[error("unexpected end of multipart body")]
    UnexpectedEof,

    /// The closing delimiter was seen; no further sections follow.
    #[error("multipart body finished")]
    Finished,

    /// The section exceeds [`MAX_PART_SIZE`].
    #[error("multipart section too large ({0} bytes)")]
    PartTooLarge(usize),

    /// A section header could not be parsed.
    #[error("invalid section header: {0}")]
    InvalidHeader(String),
}

// ---------------------------------------------------------------------------
// Boundary parsing
// ---------------------------------------------------------------------------

/// Extracts the boundary token from a `multipart/*` content type.
///
/// The token is unquoted and trimmed of the `-` padding some servers put
/// around it. Returns `None` for non-multipart types or a missing/empty
/// boundary.
pub fn parse_boundary(content_type: &str) -> Option<String> {
    let mut params = content_type.split(';');
    let media_type = params.next()?.trim().to_ascii_lowercase();
    if !media_type.starts_with("multipart/") {
        return None;
    }

    params
        .filter_map(|param| param.split_once('='))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("boundary"))
        .map(|(_, value)| value.trim().trim_matches('"').trim_matches('-').to_string())
        .filter(|boundary| !boundary.is_empty())
}

// ---------------------------------------------------------------------------
// MultipartReader
// ---------------------------------------------------------------------------

/// Reads successive section bodies from a multipart byte stream.
pub struct MultipartReader<S> {
    source: S,
    buf: BytesMut,
    delimiter: Vec<u8>,
    max_part_size: usize,
    finished: bool,
}

impl<S, E> MultipartReader<S>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
    E: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    /// Creates a reader for sections separated by `--{boundary}`.
    pub fn new(source: S, boundary: &str) -> Self {
        Self {
            source,
            buf: BytesMut::new(),
            delimiter: format!("--{boundary}").into_bytes(),
            max_part_size: MAX_PART_SIZE,
            finished: false,
        }
    }

    /// Overrides the section size limit.
    pub fn with_max_part_size(mut self, max_part_size: usize) -> Self {
        self.max_part_size = max_part_size;
        self
    }

    /// Reads the next section and returns its complete body.
    ///
    /// After an error, the following call resynchronizes on the next
    /// delimiter, so one damaged section does not poison the rest.
    pub async fn next_part(&mut self) -> Result<Bytes, MultipartError> {
        if self.finished {
            return Err(MultipartError::Finished);
        }

        self.skip_to_delimiter().await?;

        // The rest of the delimiter line: "--" marks the closing delimiter.
        let line_end = self.fill_until(CRLF, MAX_HEADER_SIZE).await?;
        if self.buf[..line_end].starts_with(b"--") {
            self.finished = true;
            return Err(MultipartError::Finished);
        }
        self.buf.advance(line_end + CRLF.len());

        let content_length = self.read_headers().await?;

        match content_length {
            Some(len) if len > self.max_part_size => Err(MultipartError::PartTooLarge(len)),
            Some(len) => {
                while self.buf.len() < len {
                    self.fill().await?;
                }
                Ok(self.buf.split_to(len).freeze())
            }
            None => {
                let mut needle = CRLF.to_vec();
                needle.extend_from_slice(&self.delimiter);
                let end = self.fill_until(&needle, self.max_part_size).await?;
                // The delimiter stays buffered for the next call.
                Ok(self.buf.split_to(end).freeze())
            }
        }
    }

    /// Consumes bytes up to and including the next delimiter.
    async fn skip_to_delimiter(&mut self) -> Result<(), MultipartError> {
        loop {
            if let Some(pos) = find(&self.buf, &self.delimiter) {
                self.buf.advance(pos + self.delimiter.len());
                return Ok(());
            }
            // Keep a tail that could be the start of a split delimiter.
            let keep = self.delimiter.len().saturating_sub(1);
            if self.buf.len() > keep {
                let drop = self.buf.len() - keep;
                self.buf.advance(drop);
            }
            self.fill().await?;
        }
    }

    /// Parses section headers, returning `Content-Length` when present.
    async fn read_headers(&mut self) -> Result<Option<usize>, MultipartError> {
        // No headers at all: the blank line follows the delimiter line directly.
        if self.buf.len() < CRLF.len() {
            self.fill_until(CRLF, 0).await?;
        }
        if self.buf.starts_with(CRLF) {
            self.buf.advance(CRLF.len());
            return Ok(None);
        }

        let end = self.fill_until(HEADER_END, MAX_HEADER_SIZE).await?;
        let block = self.buf.split_to(end + HEADER_END.len());
        let text = std::str::from_utf8(&block[..end])
            .map_err(|_| MultipartError::InvalidHeader("non UTF-8 header block".into()))?;

        let mut content_length = None;
        for line in text.split("\r\n") {
            let Some((name, value)) = line.split_once(':') else {
                continue;
            };
            if name.trim().eq_ignore_ascii_case("content-length") {
                let len = value
                    .trim()
                    .parse::<usize>()
                    .map_err(|_| MultipartError::InvalidHeader(line.to_string()))?;
                content_length = Some(len);
            }
        }
        Ok(content_length)
    }

    /// Reads until `needle` is buffered and returns its offset.
    ///
    /// A non-zero `limit` bounds how much may be buffered while searching.
    async fn fill_until(&mut self, needle: &[u8], limit: usize) -> Result<usize, MultipartError> {
        let mut searched = 0;
        loop {
            if let Some(pos) = find(&self.buf[searched..], needle) {
                return Ok(searched + pos);
            }
            searched = self.buf.len().saturating_sub(needle.len() - 1);
            if limit > 0 && self.buf.len() > limit + needle.len() {
                return Err(MultipartError::PartTooLarge(self.buf.len()));
            }
            self.fill().await?;
        }
    }

    /// Appends the next chunk from the source.
    async fn fill(&mut self) -> Result<(), MultipartError> {
        match self.source.next().await {
            Some(Ok(chunk)) => {
                self.buf.extend_from_slice(&chunk);
                Ok(())
            }
            Some(Err(e)) => Err(MultipartError::Source(e.into())),
            None => Err(MultipartError::UnexpectedEof),
        }
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
