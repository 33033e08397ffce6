use serde::Serialize;

use crate::core::Frame;

/// JSON notifications sent on the live channel, next to the binary frames.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StatusMessage {
    Status {
        connected: bool,
        /// Present only when the source endpoint was replaced; the viewer
        /// resets its own state on it.
        #[serde(rename = "sourceChanged", skip_serializing_if = "Option::is_none")]
        source_changed: Option<bool>,
    },
    RecordingError {
        message: String,
    },
}

impl StatusMessage {
    pub fn connection(connected: bool) -> Self {
        Self::Status {
            connected,
            source_changed: None,
        }
    }

    pub fn source_changed() -> Self {
        Self::Status {
            connected: false,
            source_changed: Some(true),
        }
    }

    pub fn recording_error(message: impl Into<String>) -> Self {
        Self::RecordingError {
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> String {
        // Plain enum of strings and bools, serialization cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// What a consumer queue carries.
#[derive(Debug, Clone)]
pub enum Outbound {
    Status(StatusMessage),
    Frame(Frame),
}

impl Outbound {
    pub fn is_frame(&self) -> bool {
        matches!(self, Outbound::Frame(_))
    }
}
