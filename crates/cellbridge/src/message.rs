//! Host messaging capability.
//!
//! The kernel's wire protocol (framing, signing, routing of Jupyter messages)
//! lives outside this crate. Everything here talks to it through [`Message`]:
//! a handle on the inbound message currently being processed, able to reply on
//! the shell channel, publish on IOPub, and prompt the front-end for input.

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map, Value};

/// Key under `transient` that names a display for in-place updates.
pub const TRANSIENT_DISPLAY_ID: &str = "display_id";

/// Payload of a `display_data` / `update_display_data` message.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DisplayData {
    /// MIME type to content.
    pub data: Map<String, Value>,
    pub metadata: Map<String, Value>,
    pub transient: Map<String, Value>,
}

impl DisplayData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_data(mut self, mime_type: impl Into<String>, content: impl Into<Value>) -> Self {
        self.data.insert(mime_type.into(), content.into());
        self
    }

    pub fn with_display_id(mut self, display_id: impl Into<String>) -> Self {
        self.transient
            .insert(TRANSIENT_DISPLAY_ID.to_string(), Value::String(display_id.into()));
        self
    }

    pub fn display_id(&self) -> Option<&str> {
        self.transient.get(TRANSIENT_DISPLAY_ID).and_then(Value::as_str)
    }
}

/// Output stream of the supervised cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamName {
    Stdout,
    Stderr,
}

impl StreamName {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }
}

/// Called once with the user's answer to an input prompt.
pub type InputResponder = Box<dyn FnOnce(String) + Send + 'static>;

/// Handle on an inbound kernel message.
///
/// All methods are expected to complete once the outbound message has been
/// handed to the transport; none of them wait for the front-end.
#[async_trait]
pub trait Message: Send + Sync {
    /// Parsed `content` of the inbound message.
    fn content(&self) -> &Value;

    /// Reply on the shell channel with the given `msg_type`.
    async fn reply(&self, msg_type: &str, content: Value) -> anyhow::Result<()>;

    /// Publish on the IOPub channel with the given `msg_type`.
    async fn publish(&self, msg_type: &str, content: Value) -> anyhow::Result<()>;

    async fn publish_data(&self, data: DisplayData) -> anyhow::Result<()>;

    async fn publish_update_display_data(&self, data: DisplayData) -> anyhow::Result<()>;

    async fn publish_write_stream(&self, stream: StreamName, text: &str) -> anyhow::Result<()>;

    /// Ask the front-end for a line of input. `on_response` runs when the
    /// `input_reply` arrives, which may be long after this returns.
    async fn prompt_input(
        &self,
        prompt: &str,
        password: bool,
        on_response: InputResponder,
    ) -> anyhow::Result<()>;
}
