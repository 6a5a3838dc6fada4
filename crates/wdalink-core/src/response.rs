//! Decoding of the JSON response envelope returned by the automation server.
//!
//! Every command answers with the same wrapper:
//!
//! ```text
//! { "value": <any>, "sessionId": "<id>" }
//! ```
//!
//! `value` is polymorphic. It may be a scalar, an error object
//! (`{error, message, traceback}`), an element reference map, a list of
//! element reference maps, or an arbitrary JSON document. [`RawResponse`]
//! keeps the undecoded body and offers one conversion per target shape. Each
//! conversion probes for the error shape first via
//! [`check_err`](RawResponse::check_err), so a server-reported failure is
//! never mistaken for a malformed success value.
//!
//! # Example
//!
//! ```
//! use wdalink_core::response::{RawResponse, ResponseError};
//!
//! let raw = RawResponse::new(200, r#"{"value":"hello","sessionId":"abc"}"#);
//! assert_eq!(raw.value_as_string().unwrap(), "hello");
//!
//! let raw = RawResponse::new(404, r#"{"value":{"error":"no such alert","message":"An attempt was made to operate on a modal dialog"}}"#);
//! assert!(matches!(raw.value_as_string(), Err(ResponseError::Server { .. })));
//! ```

use std::fmt;
use std::sync::LazyLock;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::value::RawValue;
use serde_json::{Map, Value};
use thiserror::Error;

/// Keys under which the server reports an element reference, in lookup order.
///
/// `ELEMENT` is the legacy JSON Wire Protocol key, the second is the W3C
/// WebDriver element identifier.
pub const ELEMENT_KEYS: [&str; 2] = ["ELEMENT", "element-6066-11e4-a52e-4f735466cecf"];

/// Matches the `{using=..., value=<detail>}` annotation that the server embeds
/// in lookup failures. The capture is the text after the final `=`.
static ANNOTATION_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{[^{}]*=([^={}]*)\}").expect("invalid error annotation pattern")
});

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors produced while decoding a response envelope.
#[derive(Error, Debug)]
pub enum ResponseError {
    /// The server reported a failure in the envelope's `value`.
    #[error("{kind}: {message}")]
    Server {
        /// Server-reported error class (e.g. `no such element`).
        kind: String,
        /// Error message with internal annotations stripped.
        message: String,
        /// Server-side traceback, if one was sent.
        traceback: Option<String>,
    },

    /// The lookup succeeded but matched nothing.
    #[error("no such element")]
    NoSuchElement,

    /// The server returned an element reference without a usable identifier.
    #[error("invalid element returned: {0}")]
    InvalidElement(String),

    /// The body is not a JSON envelope at all.
    #[error("malformed response envelope: {0}")]
    Malformed(#[source] serde_json::Error),

    /// `value` did not have the requested shape.
    #[error("failed to decode value as {target}: {source}")]
    Decode {
        /// The shape the caller asked for.
        target: &'static str,
        #[source]
        source: serde_json::Error,
    },

    /// `value` was a string but not valid base64.
    #[error("failed to decode base64 value: {0}")]
    Base64(#[from] base64::DecodeError),
}

// ---------------------------------------------------------------------------
// Envelope shapes
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct Envelope<T> {
    value: T,
}

/// The session descriptor returned when a session is created.
///
/// Only the identifier is interpreted; device and server metadata are kept
/// as opaque JSON.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    /// Server-issued session identifier.
    pub session_id: String,
    /// Capabilities the server reports for the session.
    #[serde(default)]
    pub capabilities: Value,
    /// Any other fields, passed through untouched.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

// ---------------------------------------------------------------------------
// RawResponse
// ---------------------------------------------------------------------------

/// The status and undecoded body of one server response.
#[derive(Clone, PartialEq, Eq)]
pub struct RawResponse {
    status: u16,
    body: Bytes,
}

impl fmt::Debug for RawResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawResponse")
            .field("status", &self.status)
            .field("body", &String::from_utf8_lossy(&self.body))
            .finish()
    }
}

impl RawResponse {
    /// Wraps a status code and body.
    pub fn new(status: u16, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    /// The HTTP status code.
    pub fn status(&self) -> u16 {
        self.status
    }

    /// Returns `true` for a 2xx status.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// The raw body bytes.
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Fails with [`ResponseError::Server`] if `value` carries the error shape.
    ///
    /// A message of the form `... {using=class name, value=Button}` is reduced
    /// to the final detail (`Button`); other messages are surfaced verbatim.
    pub fn check_err(&self) -> Result<(), ResponseError> {
        let envelope: Envelope<Value> =
            serde_json::from_slice(&self.body).map_err(ResponseError::Malformed)?;

        // Only an object can carry the error shape.
        let Value::Object(fields) = envelope.value else {
            return Ok(());
        };
        let kind = match fields.get("error").and_then(Value::as_str) {
            Some(kind) if !kind.is_empty() => kind.to_string(),
            _ => return Ok(()),
        };

        let message = lenient_text(fields.get("message")).unwrap_or_default();
        Err(ResponseError::Server {
            kind,
            message: clean_message(&message),
            traceback: lenient_text(fields.get("traceback"))
                .or_else(|| lenient_text(fields.get("stacktrace"))),
        })
    }

    /// Decodes `value` into any deserializable type.
    pub fn value_as<T: DeserializeOwned>(&self, target: &'static str) -> Result<T, ResponseError> {
        self.check_err()?;
        let envelope: Envelope<T> = serde_json::from_slice(&self.body)
            .map_err(|source| ResponseError::Decode { target, source })?;
        Ok(envelope.value)
    }

    /// Decodes `value` as a JSON string.
    pub fn value_as_string(&self) -> Result<String, ResponseError> {
        self.value_as("string")
    }

    /// Decodes `value` as a JSON boolean.
    pub fn value_as_bool(&self) -> Result<bool, ResponseError> {
        self.value_as("bool")
    }

    /// Decodes `value` as a [`SessionInfo`].
    pub fn value_as_session_info(&self) -> Result<SessionInfo, ResponseError> {
        self.value_as("session descriptor")
    }

    /// Returns `value` as an undecoded JSON document.
    pub fn value_as_json(&self) -> Result<Box<RawValue>, ResponseError> {
        self.value_as("json")
    }

    /// Decodes `value` as a base64 string and returns the decoded bytes.
    ///
    /// A non-string `value` fails with [`ResponseError::Decode`]; a string
    /// that is not valid base64 fails with [`ResponseError::Base64`].
    pub fn value_decode_base64(&self) -> Result<Vec<u8>, ResponseError> {
        let mut encoded = self.value_as_string()?;
        // Screenshots arrive wrapped at 64 columns.
        encoded.retain(|c| !c.is_ascii_whitespace());
        Ok(BASE64.decode(encoded)?)
    }

    /// Extracts a single element identifier from a reference map.
    pub fn value_as_element_id(&self) -> Result<String, ResponseError> {
        let map: Map<String, Value> = self.value_as("element reference")?;
        if map.is_empty() {
            return Err(ResponseError::NoSuchElement);
        }
        element_id_from_map(&map)
            .ok_or_else(|| ResponseError::InvalidElement(Value::Object(map).to_string()))
    }

    /// Extracts element identifiers from a list of reference maps.
    ///
    /// Either every entry yields an identifier or the whole call fails.
    pub fn value_as_element_ids(&self) -> Result<Vec<String>, ResponseError> {
        let maps: Vec<Map<String, Value>> = self.value_as("element reference list")?;
        if maps.is_empty() {
            return Err(ResponseError::NoSuchElement);
        }
        maps.into_iter()
            .map(|map| {
                element_id_from_map(&map)
                    .ok_or_else(|| ResponseError::InvalidElement(Value::Object(map).to_string()))
            })
            .collect()
    }
}

/// Returns the identifier under the first known key that holds a non-empty string.
fn element_id_from_map(map: &Map<String, Value>) -> Option<String> {
    ELEMENT_KEYS.iter().find_map(|key| match map.get(*key) {
        Some(Value::String(id)) if !id.is_empty() => Some(id.clone()),
        _ => None,
    })
}

/// A string field as-is, any other non-null value as its JSON text.
fn lenient_text(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::Null => None,
        Value::String(text) => Some(text.clone()),
        other => Some(other.to_string()),
    }
}

/// Surfaces the `<detail>` of a `{...=<detail>}` annotation, or the message as-is.
fn clean_message(message: &str) -> String {
    ANNOTATION_REGEX
        .captures(message)
        .and_then(|caps| caps.get(caps.len() - 1))
        .map(|detail| detail.as_str().trim().to_string())
        .unwrap_or_else(|| message.to_string())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn ok(body: &str) -> RawResponse {
        RawResponse::new(200, body.to_string())
    }

    // -----------------------------------------------------------------------
    // Error probing
    // -----------------------------------------------------------------------

    #[test]
    fn server_error_strips_annotation() {
        let raw = ok(r#"{"value":{"error":"NoSuchElementError","message":"Unable to find element: {using=class name, value=XCUIElementTypeButton}"}}"#);
        match raw.check_err() {
            Err(ResponseError::Server { kind, message, .. }) => {
                assert_eq!(kind, "NoSuchElementError");
                assert_eq!(message, "XCUIElementTypeButton");
            }
            other => panic!("expected Server, got: {other:?}"),
        }
    }

    #[test]
    fn server_error_without_annotation_keeps_message() {
        let raw = ok(r#"{"value":{"error":"invalid session id","message":"Session does not exist","traceback":"at line 1"}}"#);
        match raw.check_err() {
            Err(ResponseError::Server {
                kind,
                message,
                traceback,
            }) => {
                assert_eq!(kind, "invalid session id");
                assert_eq!(message, "Session does not exist");
                assert_eq!(traceback.as_deref(), Some("at line 1"));
            }
            other => panic!("expected Server, got: {other:?}"),
        }
    }

    #[test]
    fn server_error_uses_stacktrace_when_no_traceback() {
        let raw = ok(r#"{"value":{"error":"unknown error","message":"boom","stacktrace":"frame 0"}}"#);
        match raw.check_err() {
            Err(ResponseError::Server { traceback, .. }) => {
                assert_eq!(traceback.as_deref(), Some("frame 0"));
            }
            other => panic!("expected Server, got: {other:?}"),
        }
    }

    #[test]
    fn server_error_display_includes_kind_and_message() {
        let raw = ok(r#"{"value":{"error":"no such alert","message":"nothing open"}}"#);
        let err = raw.check_err().unwrap_err();
        assert_eq!(err.to_string(), "no such alert: nothing open");
    }

    #[test]
    fn error_kind_survives_oddly_typed_siblings() {
        let raw = ok(r#"{"value":{"error":"unknown error","message":{"detail":"boom"},"traceback":7}}"#);
        match raw.check_err() {
            Err(ResponseError::Server {
                kind,
                message,
                traceback,
            }) => {
                assert_eq!(kind, "unknown error");
                assert_eq!(message, r#"{"detail":"boom"}"#);
                assert_eq!(traceback.as_deref(), Some("7"));
            }
            other => panic!("expected Server, got: {other:?}"),
        }
        assert!(matches!(raw.value_as_element_id(), Err(ResponseError::Server { .. })));
    }

    #[test]
    fn non_string_error_field_is_not_an_error() {
        assert!(ok(r#"{"value":{"error":false,"ELEMENT":"a"}}"#).check_err().is_ok());
    }

    #[test]
    fn empty_error_field_is_not_an_error() {
        let raw = ok(r#"{"value":{"error":"","message":"ignored"}}"#);
        assert!(raw.check_err().is_ok());
    }

    #[test]
    fn scalar_value_is_not_an_error() {
        assert!(ok(r#"{"value":42}"#).check_err().is_ok());
        assert!(ok(r#"{"value":null}"#).check_err().is_ok());
        assert!(ok(r#"{"value":[1,2]}"#).check_err().is_ok());
    }

    #[test]
    fn garbage_body_is_malformed() {
        let raw = ok("<html>502 Bad Gateway</html>");
        assert!(matches!(raw.check_err(), Err(ResponseError::Malformed(_))));
        assert!(matches!(raw.value_as_string(), Err(ResponseError::Malformed(_))));
    }

    #[test]
    fn error_probe_wins_over_requested_shape() {
        let raw = ok(r#"{"value":{"error":"stale element reference","message":"gone"}}"#);
        assert!(matches!(raw.value_as_bool(), Err(ResponseError::Server { .. })));
        assert!(matches!(raw.value_as_element_id(), Err(ResponseError::Server { .. })));
        assert!(matches!(raw.value_as_json(), Err(ResponseError::Server { .. })));
    }

    // -----------------------------------------------------------------------
    // Scalars and documents
    // -----------------------------------------------------------------------

    #[test]
    fn string_value() {
        let raw = ok(r#"{"value":"Allow \"App\" to use your location?","sessionId":"s1"}"#);
        assert_eq!(
            raw.value_as_string().unwrap(),
            "Allow \"App\" to use your location?"
        );
    }

    #[test]
    fn string_value_rejects_number() {
        match ok(r#"{"value":1}"#).value_as_string() {
            Err(ResponseError::Decode { target, .. }) => assert_eq!(target, "string"),
            other => panic!("expected Decode, got: {other:?}"),
        }
    }

    #[test]
    fn bool_value() {
        assert!(ok(r#"{"value":true}"#).value_as_bool().unwrap());
        assert!(!ok(r#"{"value":false}"#).value_as_bool().unwrap());
        assert!(ok(r#"{"value":"true"}"#).value_as_bool().is_err());
    }

    #[test]
    fn session_info_passes_metadata_through() {
        let raw = ok(r#"{"value":{"sessionId":"ABC-123","capabilities":{"device":"iphone","sdkVersion":"17.0"},"build":{"time":"now"}},"sessionId":"ABC-123"}"#);
        let info = raw.value_as_session_info().unwrap();
        assert_eq!(info.session_id, "ABC-123");
        assert_eq!(info.capabilities["device"], "iphone");
        assert_eq!(info.extra["build"]["time"], "now");
    }

    #[test]
    fn session_info_requires_id() {
        let raw = ok(r#"{"value":{"capabilities":{}}}"#);
        assert!(matches!(
            raw.value_as_session_info(),
            Err(ResponseError::Decode { .. })
        ));
    }

    #[test]
    fn json_value_is_kept_undecoded() {
        let raw = ok(r#"{"value":{"state":"success","os":{"name":"iOS"}},"sessionId":null}"#);
        let json = raw.value_as_json().unwrap();
        assert_eq!(json.get(), r#"{"state":"success","os":{"name":"iOS"}}"#);
    }

    // -----------------------------------------------------------------------
    // Base64
    // -----------------------------------------------------------------------

    #[test]
    fn base64_roundtrip_including_empty() {
        let payloads: [&[u8]; 4] = [b"", b"\x00", b"\x89PNG\r\n\x1a\n", &[0xFF; 257]];
        for payload in payloads {
            let body = serde_json::json!({ "value": BASE64.encode(payload) }).to_string();
            let decoded = ok(&body).value_decode_base64().unwrap();
            assert_eq!(decoded, payload);
        }

        let payload = [0x5A_u8; 100];
        let flat = BASE64.encode(payload);
        let (head, tail) = flat.split_at(64);
        let body = serde_json::json!({ "value": format!("{head}\r\n{tail}\n") }).to_string();
        assert_eq!(ok(&body).value_decode_base64().unwrap(), payload);
    }

    #[test]
    fn base64_reports_string_step_failure() {
        match ok(r#"{"value":{"not":"a string"}}"#).value_decode_base64() {
            Err(ResponseError::Decode { target, .. }) => assert_eq!(target, "string"),
            other => panic!("expected Decode, got: {other:?}"),
        }
    }

    #[test]
    fn base64_reports_decode_step_failure() {
        assert!(matches!(
            ok(r#"{"value":"%%% not base64 %%%"}"#).value_decode_base64(),
            Err(ResponseError::Base64(_))
        ));
    }

    // -----------------------------------------------------------------------
    // Element references
    // -----------------------------------------------------------------------

    #[test]
    fn element_id_from_legacy_key() {
        let raw = ok(r#"{"value":{"ELEMENT":"0F000000-0000-0000-0A01-000000000000"}}"#);
        assert_eq!(
            raw.value_as_element_id().unwrap(),
            "0F000000-0000-0000-0A01-000000000000"
        );
    }

    #[test]
    fn element_id_from_w3c_key() {
        let raw = ok(r#"{"value":{"element-6066-11e4-a52e-4f735466cecf":"w3c-id"}}"#);
        assert_eq!(raw.value_as_element_id().unwrap(), "w3c-id");
    }

    #[test]
    fn element_id_prefers_first_known_key() {
        let raw = ok(r#"{"value":{"element-6066-11e4-a52e-4f735466cecf":"second","ELEMENT":"first"}}"#);
        assert_eq!(raw.value_as_element_id().unwrap(), "first");
    }

    #[test]
    fn empty_element_map_is_no_such_element() {
        assert!(matches!(
            ok(r#"{"value":{}}"#).value_as_element_id(),
            Err(ResponseError::NoSuchElement)
        ));
    }

    #[test]
    fn unknown_keys_are_invalid_element() {
        match ok(r#"{"value":{"id":"x"}}"#).value_as_element_id() {
            Err(ResponseError::InvalidElement(detail)) => assert!(detail.contains("\"id\"")),
            other => panic!("expected InvalidElement, got: {other:?}"),
        }
    }

    #[test]
    fn element_ids_from_list() {
        let raw = ok(r#"{"value":[{"ELEMENT":"a"},{"element-6066-11e4-a52e-4f735466cecf":"b"}]}"#);
        assert_eq!(raw.value_as_element_ids().unwrap(), vec!["a", "b"]);
    }

    #[test]
    fn empty_element_list_is_no_such_element() {
        assert!(matches!(
            ok(r#"{"value":[]}"#).value_as_element_ids(),
            Err(ResponseError::NoSuchElement)
        ));
    }

    #[test]
    fn one_bad_entry_fails_the_whole_list() {
        let raw = ok(r#"{"value":[{"ELEMENT":"a"},{},{"ELEMENT":"c"}]}"#);
        assert!(matches!(
            raw.value_as_element_ids(),
            Err(ResponseError::InvalidElement(_))
        ));
    }

    // -----------------------------------------------------------------------
    // Status
    // -----------------------------------------------------------------------

    #[test]
    fn success_status_range() {
        assert!(RawResponse::new(200, "{}").is_success());
        assert!(RawResponse::new(204, "").is_success());
        assert!(!RawResponse::new(404, "{}").is_success());
        assert!(!RawResponse::new(500, "{}").is_success());
    }
}
