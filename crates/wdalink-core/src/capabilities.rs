//! Session capabilities and per-session server settings.
//!
//! Capabilities travel with the session-creation request. Settings are
//! applied by the server per session, so they are sent in a separate update
//! right after the session exists.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// Element-tree traversal depth applied by [`Settings::recommended`].
///
/// Keeps source-tree snapshots fast on deep screens at the cost of not
/// seeing elements nested further down.
pub const SNAPSHOT_MAX_DEPTH: u32 = 10;

/// Class-chain selector for the button that counts as "accept" on an alert.
///
/// The search root is the alert itself. If the selector is invalid or
/// matches nothing, the server falls back to its default button lookup.
pub const ACCEPT_ALERT_BUTTON_SELECTOR: &str =
    "**/XCUIElementTypeButton[`label IN {'Allow','OK','Allow While Using App','Not Now'}`]";

/// Class-chain selector for the button that counts as "dismiss" on an alert.
pub const DISMISS_ALERT_BUTTON_SELECTOR: &str =
    "**/XCUIElementTypeButton[`label IN {'Don’t Allow','Cancel'}`]";

/// What the server does with unexpected system alerts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertAction {
    /// Tap the accept button.
    Accept,
    /// Tap the dismiss button.
    Dismiss,
}

/// Capabilities sent when creating a session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Capabilities(Map<String, Value>);

impl Capabilities {
    /// Empty capability set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets an arbitrary capability.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(name.into(), value.into());
        self
    }

    /// Sets the default action for unexpected alerts.
    pub fn with_default_alert_action(self, action: AlertAction) -> Self {
        let value = match action {
            AlertAction::Accept => "accept",
            AlertAction::Dismiss => "dismiss",
        };
        self.with("defaultAlertAction", value)
    }

    /// Looks up a capability.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    /// The JSON body of a session-creation request.
    pub fn to_request_body(&self) -> Value {
        json!({ "capabilities": { "alwaysMatch": self.0 } })
    }
}

/// Per-session server settings.
///
/// Unset fields are omitted from the update and keep the server's value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    /// Maximum depth when traversing the element tree.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot_max_depth: Option<u32>,
    /// Selector for the element treated as "accept" on alerts.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub accept_alert_button_selector: Option<String>,
    /// Selector for the element treated as "dismiss" on alerts.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dismiss_alert_button_selector: Option<String>,
}

impl Settings {
    /// Settings applied when a driver opens its session.
    pub fn recommended() -> Self {
        Self {
            snapshot_max_depth: Some(SNAPSHOT_MAX_DEPTH),
            accept_alert_button_selector: Some(ACCEPT_ALERT_BUTTON_SELECTOR.to_string()),
            dismiss_alert_button_selector: None,
        }
    }

    /// The JSON body of a settings-update request.
    pub fn to_request_body(&self) -> Value {
        json!({ "settings": self })
    }
}
