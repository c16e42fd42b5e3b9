//! cellbridge: liveness and transport plumbing for a notebook kernel.
//!
//! - [`comms`]: heartbeat-checked control channel to the front-end
//! - [`pipe`]: named-pipe transport from a child process (unix only)

pub mod comms;
mod latch;
pub mod logging;
pub mod message;
#[cfg(unix)]
pub mod pipe;

pub use comms::{CommChannel, CommStatus, CommsConfig, CommsError};
pub use logging::init_tracing;
pub use message::{DisplayData, InputResponder, Message, StreamName};
#[cfg(unix)]
pub use pipe::bridge::{PipeBridge, PipeConfig, PipeError};
#[cfg(unix)]
pub use pipe::child::DisplaySender;
#[cfg(unix)]
pub use pipe::protocol::{DisplayRecord, InputRequest};
