//! Named-pipe transport between the kernel and a child process.
//!
//! # Architecture
//!
//! - **protocol**: Record types (DisplayRecord, InputRequest) and env var names
//! - **codec**: Length-prefixed JSON framing for AsyncRead/AsyncWrite
//! - **fifo**: Creating and removing the FIFO files
//! - **bridge**: Kernel side, [`PipeBridge`](bridge::PipeBridge)
//! - **child**: Child side, [`DisplaySender`](child::DisplaySender)

pub mod bridge;
pub mod child;
pub mod codec;
pub mod fifo;
pub mod protocol;
