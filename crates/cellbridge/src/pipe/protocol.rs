//! Record types streamed from the child process over the named pipe.
//!
//! Every record is a [`DisplayRecord`]. Input requests travel as a display
//! record carrying a single [`MIME_INPUT_REQUEST`] entry whose payload is an
//! [`InputRequest`].

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::message::DisplayData;

/// Environment variable with the FIFO the child writes records to.
pub const PIPE_ENV: &str = "GONB_PIPE";

/// Environment variable with the FIFO reserved for kernel-to-child messages.
pub const PIPE_BACK_ENV: &str = "GONB_PIPE_BACK";

/// Marker MIME type of an input request.
pub const MIME_INPUT_REQUEST: &str = "application/x-input-request";

/// Content to display, keyed by MIME type.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DisplayRecord {
    #[serde(default)]
    pub data: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
    /// When set, replaces a previous display with the same id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_id: Option<String>,
}

impl DisplayRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_data(mut self, mime_type: impl Into<String>, content: impl Into<Value>) -> Self {
        self.data.insert(mime_type.into(), content.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_display_id(mut self, display_id: impl Into<String>) -> Self {
        self.display_id = Some(display_id.into());
        self
    }

    /// The display id, treating an empty one as absent.
    pub fn display_id(&self) -> Option<&str> {
        self.display_id.as_deref().filter(|id| !id.is_empty())
    }

    /// The input request this record carries, if it has the marker.
    pub fn input_request(&self) -> Option<Result<InputRequest, serde_json::Error>> {
        self.data
            .get(MIME_INPUT_REQUEST)
            .map(|payload| InputRequest::deserialize(payload))
    }

    pub fn classify(self) -> RecordKind {
        match self.input_request() {
            Some(Ok(request)) => RecordKind::Input(request),
            Some(Err(e)) => RecordKind::MalformedInput(e.to_string()),
            None => RecordKind::Display(self),
        }
    }

    /// Converts to the kernel's display payload, moving the display id into
    /// `transient`.
    pub fn into_display_data(self) -> DisplayData {
        let display_id = self.display_id().map(str::to_string);
        let mut data = DisplayData {
            data: self.data,
            metadata: self.metadata,
            transient: Map::new(),
        };
        if let Some(id) = display_id {
            data = data.with_display_id(id);
        }
        data
    }
}

/// What a decoded record asks the kernel to do.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordKind {
    Display(DisplayRecord),
    Input(InputRequest),
    /// Input-request marker with a payload that isn't an [`InputRequest`].
    MalformedInput(String),
}

/// Request for a line of input from the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputRequest {
    pub prompt: String,
    /// Mask the input in the front-end.
    #[serde(default)]
    pub password: bool,
}

impl InputRequest {
    pub fn new(prompt: impl Into<String>, password: bool) -> Self {
        Self {
            prompt: prompt.into(),
            password,
        }
    }

    pub fn into_record(self) -> DisplayRecord {
        DisplayRecord::new().with_data(
            MIME_INPUT_REQUEST,
            json!({ "prompt": self.prompt, "password": self.password }),
        )
    }
}
