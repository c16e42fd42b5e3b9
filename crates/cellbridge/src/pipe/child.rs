//! Child side of the named pipe.
//!
//! A Rust program run by the kernel uses [`DisplaySender`] to stream rich
//! output and ask for input. Programs in other languages only need to write
//! the same frames (see [`codec`](super::codec)) to the path in `GONB_PIPE`.

use std::io;
use std::path::{Path, PathBuf};

use futures::SinkExt;
use tokio::net::unix::pipe;
use tokio_util::codec::FramedWrite;

use super::codec::RecordCodec;
use super::protocol::{DisplayRecord, InputRequest, PIPE_ENV};

pub struct DisplaySender {
    frames: FramedWrite<pipe::Sender, RecordCodec<DisplayRecord>>,
}

impl DisplaySender {
    /// Opens the pipe for writing. Waits until the kernel side has it open
    /// for reading.
    pub async fn connect(path: impl AsRef<Path>) -> io::Result<Self> {
        let path: PathBuf = path.as_ref().to_owned();
        let file = tokio::task::spawn_blocking(move || {
            std::fs::OpenOptions::new().write(true).open(path)
        })
        .await
        .map_err(io::Error::other)??;
        let sender = pipe::Sender::from_file(file)?;
        Ok(Self {
            frames: FramedWrite::new(sender, RecordCodec::new()),
        })
    }

    /// Connects to the pipe named by `GONB_PIPE`.
    pub async fn connect_from_env() -> io::Result<Self> {
        let path = std::env::var_os(PIPE_ENV).ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, format!("{PIPE_ENV} is not set"))
        })?;
        Self::connect(path).await
    }

    pub async fn display(&mut self, record: DisplayRecord) -> io::Result<()> {
        self.frames.send(record).await
    }

    /// The answer arrives on stdin, as a single line.
    pub async fn request_input(&mut self, prompt: &str, password: bool) -> io::Result<()> {
        self.display(InputRequest::new(prompt, password).into_record())
            .await
    }

    /// Flushes and closes the pipe. The kernel sees end-of-stream once every
    /// writer has closed.
    pub async fn close(mut self) -> io::Result<()> {
        self.frames.close().await
    }
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;
    use tokio_util::codec::FramedRead;

    use super::*;
    use crate::pipe::fifo::{FIFO_PREFIX, create_fifo};

    #[tokio::test]
    async fn writes_framed_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = create_fifo(dir.path(), FIFO_PREFIX).unwrap();

        let read_path = path.clone();
        let reader = tokio::spawn(async move {
            let file = tokio::task::spawn_blocking(move || std::fs::File::open(read_path))
                .await
                .unwrap()
                .unwrap();
            let receiver = pipe::Receiver::from_file(file).unwrap();
            FramedRead::new(receiver, RecordCodec::<DisplayRecord>::new())
                .map(|r| r.unwrap())
                .collect::<Vec<_>>()
                .await
        });

        let mut sender = DisplaySender::connect(&path).await.unwrap();
        sender
            .display(DisplayRecord::new().with_data("text/markdown", "# Title"))
            .await
            .unwrap();
        sender.request_input("Age?", false).await.unwrap();
        sender.close().await.unwrap();

        let records = reader.await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].data["text/markdown"], "# Title");
        assert_eq!(
            records[1].clone().input_request().unwrap().unwrap(),
            InputRequest::new("Age?", false)
        );
    }
}
