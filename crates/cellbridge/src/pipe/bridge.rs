//! PipeBridge - streams display records from a child process to the kernel.
//!
//! Flow:
//! 1. Create two FIFOs and export their paths to the child's environment
//! 2. Open the reader FIFO on a blocking thread (returns once a writer attaches)
//! 3. Decode records until end-of-stream, publishing displays and prompting
//!    for input on the child's behalf
//! 4. Once the child is done: unblock a still-pending open, remove the FIFOs
//!
//! Opening a FIFO for reading blocks until some writer opens it. A child that
//! exits (or never starts) without touching the pipe would leave the reader
//! blocked forever, so teardown attaches a throwaway writer whenever the
//! reader hasn't opened yet. A small lock around the "opened" flag keeps the
//! two sides from racing.

use std::io;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use futures::StreamExt;
use nix::errno::Errno;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::unix::pipe;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;

use super::codec::RecordCodec;
use super::fifo::{FIFO_PREFIX, create_fifo, remove_fifo};
use super::protocol::{DisplayRecord, InputRequest, PIPE_BACK_ENV, PIPE_ENV, RecordKind};
use crate::message::{InputResponder, Message, StreamName};

/// Environment variable overriding where FIFOs are created.
pub const PIPE_DIR_ENV: &str = "CELLBRIDGE_PIPE_DIR";

const THROWAWAY_RETRY: Duration = Duration::from_millis(10);

/// Writable stdin of the child process.
pub type ChildStdin = Box<dyn AsyncWrite + Send + Unpin>;

type SharedStdin = Arc<tokio::sync::Mutex<ChildStdin>>;

#[derive(Debug, Clone)]
pub struct PipeConfig {
    pub dir: PathBuf,
    pub pipe_env: String,
    pub pipe_back_env: String,
    /// Interval between attempts to unblock a reader that hasn't reached
    /// its open call yet.
    pub throwaway_retry: Duration,
}

impl PipeConfig {
    pub fn new() -> Self {
        Self {
            dir: std::env::temp_dir(),
            pipe_env: PIPE_ENV.to_string(),
            pipe_back_env: PIPE_BACK_ENV.to_string(),
            throwaway_retry: THROWAWAY_RETRY,
        }
    }

    /// Defaults, with the directory taken from `CELLBRIDGE_PIPE_DIR` if set.
    pub fn from_env() -> Self {
        let config = Self::new();
        match std::env::var_os(PIPE_DIR_ENV) {
            Some(dir) if !dir.is_empty() => config.with_dir(dir),
            _ => config,
        }
    }

    pub fn with_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dir = dir.into();
        self
    }

    pub fn with_env_names(
        mut self,
        pipe_env: impl Into<String>,
        pipe_back_env: impl Into<String>,
    ) -> Self {
        self.pipe_env = pipe_env.into();
        self.pipe_back_env = pipe_back_env.into();
        self
    }

    pub fn with_throwaway_retry(mut self, retry: Duration) -> Self {
        self.throwaway_retry = retry;
        self
    }
}

impl Default for PipeConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PipeError {
    #[error("failed to create named pipe in {}: {source}", dir.display())]
    Resource {
        dir: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Named-pipe transport for a single child process.
pub struct PipeBridge {
    reader_path: PathBuf,
    writer_path: PathBuf,
    pipe_env: String,
    pipe_back_env: String,
    throwaway_retry: Duration,
    dispatcher: Dispatcher,
    reader_started: AtomicBool,
    /// Fired once the FIFOs are removed.
    closed: CancellationToken,
}

impl PipeBridge {
    /// Creates the FIFO pair. Nothing reads from it until
    /// [`open_pipe_reader`](Self::open_pipe_reader).
    pub fn create(config: &PipeConfig, msg: Arc<dyn Message>) -> Result<Self, PipeError> {
        let resource = |source| PipeError::Resource {
            dir: config.dir.clone(),
            source,
        };

        let reader_path = create_fifo(&config.dir, FIFO_PREFIX).map_err(resource)?;
        let writer_path = match create_fifo(&config.dir, FIFO_PREFIX) {
            Ok(path) => path,
            Err(e) => {
                let _ = remove_fifo(&reader_path);
                return Err(resource(e));
            }
        };
        tracing::debug!(
            reader = %reader_path.display(),
            writer = %writer_path.display(),
            "Created named pipes"
        );

        Ok(Self {
            reader_path,
            writer_path,
            pipe_env: config.pipe_env.clone(),
            pipe_back_env: config.pipe_back_env.clone(),
            throwaway_retry: config.throwaway_retry,
            dispatcher: Dispatcher {
                msg,
                done: CancellationToken::new(),
                stdin: Arc::new(StdMutex::new(None)),
            },
            reader_started: AtomicBool::new(false),
            closed: CancellationToken::new(),
        })
    }

    /// Creates the FIFOs, exports them to `command`'s environment and starts
    /// reading.
    ///
    /// The done signal fires on [`finish`](Self::finish), when the child
    /// watched by [`finish_when_exited`](Self::finish_when_exited) exits, or
    /// when the bridge is dropped. Keep the bridge alive while the child runs.
    pub fn setup(
        config: &PipeConfig,
        msg: Arc<dyn Message>,
        command: &mut Command,
    ) -> Result<Self, PipeError> {
        let bridge = Self::create(config, msg)?;
        bridge.apply_env(command);
        bridge.open_pipe_reader();
        Ok(bridge)
    }

    pub fn apply_env(&self, command: &mut Command) {
        command
            .env(&self.pipe_env, &self.reader_path)
            .env(&self.pipe_back_env, &self.writer_path);
    }

    pub fn reader_path(&self) -> &Path {
        &self.reader_path
    }

    pub fn writer_path(&self) -> &Path {
        &self.writer_path
    }

    /// One-shot signal fired when the child is done.
    pub fn done_signal(&self) -> CancellationToken {
        self.dispatcher.done.clone()
    }

    pub fn is_done(&self) -> bool {
        self.dispatcher.done.is_cancelled()
    }

    /// Marks the child as done. Idempotent.
    pub fn finish(&self) {
        self.dispatcher.done.cancel();
    }

    pub fn set_child_stdin(&self, stdin: impl AsyncWrite + Send + Unpin + 'static) {
        let stdin: ChildStdin = Box::new(stdin);
        let mut slot = match self.dispatcher.stdin.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *slot = Some(Arc::new(tokio::sync::Mutex::new(stdin)));
    }

    /// Takes over the child's stdin and fires the done signal when it exits.
    pub fn finish_when_exited(&self, mut child: Child) -> JoinHandle<io::Result<ExitStatus>> {
        if let Some(stdin) = child.stdin.take() {
            self.set_child_stdin(stdin);
        }
        let done = self.dispatcher.done.clone();
        tokio::spawn(async move {
            let status = child.wait().await;
            match &status {
                Ok(status) => tracing::debug!(%status, "Child process exited"),
                Err(e) => tracing::warn!(error = %e, "Failed to wait for child process"),
            }
            done.cancel();
            status
        })
    }

    /// Waits until the FIFOs have been removed. Returns immediately if the
    /// reader was never started.
    pub async fn wait_closed(&self) {
        if self.reader_started.load(Ordering::SeqCst) {
            self.closed.cancelled().await;
        }
    }

    /// Starts the reader and cleanup tasks. Only the first call has effect.
    pub fn open_pipe_reader(&self) {
        if self.reader_started.swap(true, Ordering::SeqCst) {
            tracing::warn!(path = %self.reader_path.display(), "Pipe reader already started");
            return;
        }

        let opened_for_reading = Arc::new(StdMutex::new(false));
        let reader_finished = CancellationToken::new();

        tokio::spawn(run_cleanup(Cleanup {
            reader_path: self.reader_path.clone(),
            writer_path: self.writer_path.clone(),
            done: self.dispatcher.done.clone(),
            opened_for_reading: Arc::clone(&opened_for_reading),
            reader_finished: reader_finished.clone(),
            closed: self.closed.clone(),
            retry: self.throwaway_retry,
        }));

        tokio::spawn(run_reader(
            self.reader_path.clone(),
            self.dispatcher.clone(),
            opened_for_reading,
            reader_finished,
        ));
    }
}

impl Drop for PipeBridge {
    fn drop(&mut self) {
        // Once started, the cleanup task owns removal; firing done lets it run.
        if self.reader_started.load(Ordering::SeqCst) {
            self.dispatcher.done.cancel();
            return;
        }
        for path in [&self.reader_path, &self.writer_path] {
            if let Err(e) = remove_fifo(path) {
                tracing::warn!(path = %path.display(), error = %e, "Failed to remove named pipe");
            }
        }
    }
}

fn set_flag(flag: &StdMutex<bool>, value: bool) {
    match flag.lock() {
        Ok(mut guard) => *guard = value,
        Err(poisoned) => *poisoned.into_inner() = value,
    }
}

async fn run_reader(
    path: PathBuf,
    dispatcher: Dispatcher,
    opened_for_reading: Arc<StdMutex<bool>>,
    reader_finished: CancellationToken,
) {
    let _finished = reader_finished.drop_guard();

    if dispatcher.done.is_cancelled() {
        tracing::debug!(path = %path.display(), "Process already finished, not opening pipe");
        return;
    }

    // Blocks until a writer attaches: the child, or the cleanup task's throwaway.
    let open_path = path.clone();
    let file = match tokio::task::spawn_blocking(move || std::fs::File::open(open_path)).await {
        Ok(Ok(file)) => file,
        Ok(Err(e)) => {
            tracing::warn!(path = %path.display(), error = %e, "Failed to open pipe for reading");
            return;
        }
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Pipe open task failed");
            return;
        }
    };
    set_flag(&opened_for_reading, true);

    let mut receiver = match pipe::Receiver::from_file(file) {
        Ok(receiver) => receiver,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Failed to register pipe reader");
            return;
        }
    };

    let records = decode_loop(&mut receiver, &dispatcher).await;
    tracing::debug!(path = %path.display(), records, "Pipe decoding finished");

    // Closing the read end early would fail the child's next write with
    // EPIPE. Keep it open, discarding whatever else arrives, until done.
    let mut sink = tokio::io::sink();
    tokio::select! {
        _ = dispatcher.done.cancelled() => {}
        _ = tokio::io::copy(&mut receiver, &mut sink) => {
            dispatcher.done.cancelled().await;
        }
    }
    drop(receiver);
    tracing::debug!(path = %path.display(), "Pipe reader closed");
}

struct Cleanup {
    reader_path: PathBuf,
    writer_path: PathBuf,
    done: CancellationToken,
    opened_for_reading: Arc<StdMutex<bool>>,
    reader_finished: CancellationToken,
    closed: CancellationToken,
    retry: Duration,
}

async fn run_cleanup(cleanup: Cleanup) {
    cleanup.done.cancelled().await;

    loop {
        {
            let opened = match cleanup.opened_for_reading.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            if *opened {
                break;
            }
            // Non-blocking: fails with ENXIO unless a reader is in open().
            match pipe::OpenOptions::new().open_sender(&cleanup.reader_path) {
                Ok(throwaway) => {
                    drop(throwaway);
                    tracing::trace!(
                        path = %cleanup.reader_path.display(),
                        "Unblocked pending pipe open with a throwaway writer"
                    );
                    break;
                }
                Err(e) if e.raw_os_error() == Some(Errno::ENXIO as i32) => {}
                Err(e) => {
                    tracing::warn!(
                        path = %cleanup.reader_path.display(),
                        error = %e,
                        "Failed to open pipe for writing"
                    );
                    break;
                }
            }
        }
        tokio::select! {
            _ = cleanup.reader_finished.cancelled() => break,
            _ = tokio::time::sleep(cleanup.retry) => {}
        }
    }

    cleanup.reader_finished.cancelled().await;

    for path in [&cleanup.reader_path, &cleanup.writer_path] {
        if let Err(e) = remove_fifo(path) {
            tracing::warn!(path = %path.display(), error = %e, "Failed to remove named pipe");
        }
    }
    tracing::debug!(path = %cleanup.reader_path.display(), "Named pipes removed");
    cleanup.closed.cancel();
}

fn is_end_of_stream(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::UnexpectedEof | io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset
    )
}

/// Decodes records until end-of-stream, or until the child is done and no
/// more input is buffered. Returns the number of records decoded.
async fn decode_loop<R>(reader: R, dispatcher: &Dispatcher) -> usize
where
    R: AsyncRead + Unpin,
{
    let mut frames = FramedRead::new(reader, RecordCodec::<DisplayRecord>::new());
    let mut records = 0;

    loop {
        let next = tokio::select! {
            biased;
            next = frames.next() => next,
            _ = dispatcher.done.cancelled() => {
                tracing::debug!("Process finished with the pipe still open, closing it");
                break;
            }
        };

        match next {
            Some(Ok(record)) => {
                records += 1;
                dispatcher.dispatch(record).await;
            }
            Some(Err(e)) if is_end_of_stream(&e) => break,
            Some(Err(e)) => {
                tracing::info!(error = %e, "Named pipe: failed to parse record");
                break;
            }
            None => break,
        }
    }
    records
}

#[derive(Clone)]
struct Dispatcher {
    msg: Arc<dyn Message>,
    done: CancellationToken,
    stdin: Arc<StdMutex<Option<SharedStdin>>>,
}

impl Dispatcher {
    async fn dispatch(&self, record: DisplayRecord) {
        match record.classify() {
            RecordKind::Display(record) => self.dispatch_display_data(record).await,
            RecordKind::Input(request) => self.dispatch_input_request(request).await,
            RecordKind::MalformedInput(e) => {
                self.report_cell_error(&format!(
                    "Input request sent to the named pipe without a valid prompt: {e}"
                ))
                .await;
            }
        }
    }

    async fn dispatch_display_data(&self, record: DisplayRecord) {
        let update = record.display_id().is_some();
        let data = record.into_display_data();
        tracing::debug!(
            mime_types = ?data.data.keys().collect::<Vec<_>>(),
            display_id = ?data.display_id(),
            "Displaying data"
        );

        let result = if update {
            self.msg.publish_update_display_data(data).await
        } else {
            self.msg.publish_data(data).await
        };
        if let Err(e) = result {
            tracing::error!(error = %e, "Failed to display data (ignoring)");
        }
    }

    async fn dispatch_input_request(&self, request: InputRequest) {
        tracing::debug!(prompt = %request.prompt, password = request.password, "Input requested");

        let stdin = Arc::clone(&self.stdin);
        let done = self.done.clone();
        let runtime = tokio::runtime::Handle::current();
        let responder: InputResponder = Box::new(move |value: String| {
            // Written off-thread: the child may never read its stdin.
            runtime.spawn(write_stdin(stdin, done, value));
        });

        if let Err(e) = self
            .msg
            .prompt_input(&request.prompt, request.password, responder)
            .await
        {
            self.report_cell_error(&format!("Failed to prompt for input: {e:#}"))
                .await;
        }
    }

    /// Reports to both the cell's stderr and the kernel log.
    async fn report_cell_error(&self, message: &str) {
        tracing::error!(stream = StreamName::Stderr.as_str(), "{}", message);
        if let Err(e) = self
            .msg
            .publish_write_stream(StreamName::Stderr, message)
            .await
        {
            tracing::error!(error = %e, "Failed to report cell error");
        }
    }
}

async fn write_stdin(slot: Arc<StdMutex<Option<SharedStdin>>>, done: CancellationToken, value: String) {
    let stdin = match slot.lock() {
        Ok(guard) => guard.clone(),
        Err(poisoned) => poisoned.into_inner().clone(),
    };
    if done.is_cancelled() {
        tracing::debug!("Process already finished, dropping input");
        return;
    }
    let Some(stdin) = stdin else {
        tracing::warn!("No stdin attached to the child process, dropping input");
        return;
    };

    let line = format!("{value}\n");
    let mut writer = stdin.lock().await;
    let result = match writer.write_all(line.as_bytes()).await {
        Ok(()) => writer.flush().await,
        Err(e) => Err(e),
    };
    if let Err(e) = result {
        // The child may have legitimately closed its stdin.
        tracing::warn!(error = %e, "Failed to write to stdin of cell");
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncReadExt;

    use super::*;
    use crate::message::DisplayData;
    use crate::message::testing::{RecordingMessage, Sent};
    use crate::pipe::child::DisplaySender;
    use crate::pipe::protocol::MIME_INPUT_REQUEST;

    const WAIT: Duration = Duration::from_secs(10);

    fn bridge_in(dir: &Path, msg: &RecordingMessage) -> PipeBridge {
        let config = PipeConfig::new().with_dir(dir);
        PipeBridge::create(&config, Arc::new(msg.clone())).unwrap()
    }

    async fn close(bridge: &PipeBridge) {
        bridge.finish();
        tokio::time::timeout(WAIT, bridge.wait_closed())
            .await
            .expect("pipe bridge did not close");
        assert!(!bridge.reader_path().exists());
        assert!(!bridge.writer_path().exists());
    }

    #[tokio::test]
    async fn dispatches_every_record_until_eof() {
        let dir = tempfile::tempdir().unwrap();
        let msg = RecordingMessage::default();
        let bridge = bridge_in(dir.path(), &msg);
        bridge.open_pipe_reader();

        let mut sender = DisplaySender::connect(bridge.reader_path()).await.unwrap();
        for i in 0..5 {
            sender
                .display(DisplayRecord::new().with_data("text/plain", format!("line {i}")))
                .await
                .unwrap();
        }
        sender.close().await.unwrap();

        let sent = tokio::time::timeout(WAIT, msg.wait_for(5)).await.unwrap();
        close(&bridge).await;

        assert_eq!(msg.sent().len(), 5);
        for (i, sent) in sent.iter().enumerate() {
            assert_eq!(
                sent,
                &Sent::Data(DisplayData::new().with_data("text/plain", format!("line {i}")))
            );
        }
    }

    #[tokio::test]
    async fn display_id_updates_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let msg = RecordingMessage::default();
        let bridge = bridge_in(dir.path(), &msg);
        bridge.open_pipe_reader();

        let mut sender = DisplaySender::connect(bridge.reader_path()).await.unwrap();
        sender
            .display(
                DisplayRecord::new()
                    .with_data("text/html", "<progress value=50>")
                    .with_display_id("bar"),
            )
            .await
            .unwrap();
        sender.close().await.unwrap();

        let sent = tokio::time::timeout(WAIT, msg.wait_for(1)).await.unwrap();
        let Sent::UpdateDisplayData(data) = &sent[0] else {
            panic!("expected update_display_data, got {:?}", sent[0]);
        };
        assert_eq!(data.display_id(), Some("bar"));
        close(&bridge).await;
    }

    #[tokio::test]
    async fn done_before_any_writer_unblocks_reader() {
        let dir = tempfile::tempdir().unwrap();
        let msg = RecordingMessage::default();
        let bridge = bridge_in(dir.path(), &msg);
        bridge.open_pipe_reader();

        // Let the reader block in open().
        tokio::time::sleep(Duration::from_millis(20)).await;
        close(&bridge).await;
        assert!(msg.sent().is_empty());
    }

    #[tokio::test]
    async fn done_before_reader_starts_skips_open() {
        let dir = tempfile::tempdir().unwrap();
        let msg = RecordingMessage::default();
        let bridge = bridge_in(dir.path(), &msg);
        bridge.finish();
        bridge.open_pipe_reader();
        close(&bridge).await;
    }

    #[tokio::test]
    async fn unstarted_bridge_removes_pipes_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let msg = RecordingMessage::default();
        let bridge = bridge_in(dir.path(), &msg);
        let (reader, writer) = (bridge.reader_path().to_owned(), bridge.writer_path().to_owned());
        assert!(reader.exists() && writer.exists());
        bridge.wait_closed().await;
        drop(bridge);
        assert!(!reader.exists() && !writer.exists());
    }

    #[tokio::test]
    async fn dropping_started_bridge_removes_pipes() {
        let dir = tempfile::tempdir().unwrap();
        let msg = RecordingMessage::default();
        let bridge = bridge_in(dir.path(), &msg);
        bridge.open_pipe_reader();
        let (reader, writer) = (bridge.reader_path().to_owned(), bridge.writer_path().to_owned());

        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(bridge);

        tokio::time::timeout(WAIT, async {
            while reader.exists() || writer.exists() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("named pipes left behind after drop");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn finish_racing_reader_open_still_closes() {
        let dir = tempfile::tempdir().unwrap();
        let msg = RecordingMessage::default();
        let config = PipeConfig::new()
            .with_dir(dir.path())
            .with_throwaway_retry(Duration::from_millis(1));

        for _ in 0..20 {
            let bridge = PipeBridge::create(&config, Arc::new(msg.clone())).unwrap();
            bridge.open_pipe_reader();
            tokio::task::yield_now().await;
            close(&bridge).await;
        }
        assert!(msg.sent().is_empty());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn input_response_is_written_to_stdin() {
        let dir = tempfile::tempdir().unwrap();
        let msg = RecordingMessage::default();
        let bridge = bridge_in(dir.path(), &msg);
        let (stdin, mut child_stdin) = tokio::io::duplex(64);
        bridge.set_child_stdin(stdin);
        bridge.open_pipe_reader();

        let mut sender = DisplaySender::connect(bridge.reader_path()).await.unwrap();
        sender.request_input("Name?", false).await.unwrap();

        let sent = tokio::time::timeout(WAIT, msg.wait_for(1)).await.unwrap();
        assert_eq!(
            sent[0],
            Sent::Prompt {
                prompt: "Name?".to_string(),
                password: false,
            }
        );

        let responder = msg.take_responders().pop().unwrap();
        responder("gopher".to_string());

        let mut line = [0u8; 7];
        tokio::time::timeout(WAIT, child_stdin.read_exact(&mut line))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&line, b"gopher\n");

        sender.close().await.unwrap();
        close(&bridge).await;
    }

    #[tokio::test]
    async fn input_after_done_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let msg = RecordingMessage::default();
        let bridge = bridge_in(dir.path(), &msg);
        let (stdin, mut child_stdin) = tokio::io::duplex(64);
        bridge.set_child_stdin(stdin);
        bridge.open_pipe_reader();

        let mut sender = DisplaySender::connect(bridge.reader_path()).await.unwrap();
        sender.request_input("Password:", true).await.unwrap();
        sender.close().await.unwrap();
        tokio::time::timeout(WAIT, msg.wait_for(1)).await.unwrap();

        close(&bridge).await;
        let responder = msg.take_responders().pop().unwrap();
        responder("secret".to_string());

        let mut buf = [0u8; 1];
        let read = tokio::time::timeout(Duration::from_millis(50), child_stdin.read(&mut buf)).await;
        assert!(read.is_err(), "nothing should be written after the child is done");
    }

    #[tokio::test]
    async fn malformed_input_request_reports_and_continues() {
        let dir = tempfile::tempdir().unwrap();
        let msg = RecordingMessage::default();
        let bridge = bridge_in(dir.path(), &msg);
        bridge.open_pipe_reader();

        let mut sender = DisplaySender::connect(bridge.reader_path()).await.unwrap();
        sender
            .display(DisplayRecord::new().with_data(MIME_INPUT_REQUEST, 42))
            .await
            .unwrap();
        sender
            .display(DisplayRecord::new().with_data("text/plain", "after"))
            .await
            .unwrap();
        sender.close().await.unwrap();

        let sent = tokio::time::timeout(WAIT, msg.wait_for(2)).await.unwrap();
        assert!(matches!(&sent[0], Sent::Stream { stream: StreamName::Stderr, .. }));
        assert!(matches!(&sent[1], Sent::Data(_)));
        close(&bridge).await;
    }

    #[tokio::test]
    async fn prompt_failure_is_a_cell_error() {
        let dir = tempfile::tempdir().unwrap();
        let msg = RecordingMessage::default().failing_prompt();
        let bridge = bridge_in(dir.path(), &msg);
        bridge.open_pipe_reader();

        let mut sender = DisplaySender::connect(bridge.reader_path()).await.unwrap();
        sender.request_input("Name?", false).await.unwrap();
        sender.close().await.unwrap();

        let sent = tokio::time::timeout(WAIT, msg.wait_for(1)).await.unwrap();
        let Sent::Stream { stream, text } = &sent[0] else {
            panic!("expected stderr stream, got {:?}", sent[0]);
        };
        assert_eq!(*stream, StreamName::Stderr);
        assert!(text.contains("stdin channel not allowed"));
        close(&bridge).await;
    }

    #[tokio::test]
    async fn garbage_stops_decoding_but_keeps_pipe_open() {
        let dir = tempfile::tempdir().unwrap();
        let msg = RecordingMessage::default();
        let bridge = bridge_in(dir.path(), &msg);
        bridge.open_pipe_reader();

        let path = bridge.reader_path().to_owned();
        let file = tokio::task::spawn_blocking(move || {
            std::fs::OpenOptions::new().write(true).open(path)
        })
        .await
        .unwrap()
        .unwrap();
        let mut raw = pipe::Sender::from_file(file).unwrap();
        raw.write_all(b"\x00\x00\x00\x03abc").await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        // The child keeps running: later writes must not hit a closed pipe.
        let mut valid = tokio_util::bytes::BytesMut::new();
        tokio_util::codec::Encoder::encode(
            &mut RecordCodec::<DisplayRecord>::new(),
            DisplayRecord::new().with_data("text/plain", "late"),
            &mut valid,
        )
        .unwrap();
        raw.write_all(&valid).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        raw.write_all(&valid).await.unwrap();
        assert!(!bridge.is_done());

        bridge.finish();
        tokio::time::timeout(WAIT, bridge.wait_closed()).await.unwrap();
        drop(raw);
        assert!(msg.sent().is_empty());
    }

    #[tokio::test]
    async fn create_in_missing_directory_is_resource_error() {
        let dir = tempfile::tempdir().unwrap();
        let config = PipeConfig::new().with_dir(dir.path().join("missing"));
        let msg = RecordingMessage::default();
        let err = PipeBridge::create(&config, Arc::new(msg)).err().unwrap();
        let PipeError::Resource { dir: failed_dir, source } = err;
        assert_eq!(failed_dir, dir.path().join("missing"));
        assert_eq!(source.kind(), io::ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn setup_exports_pipe_paths() {
        let dir = tempfile::tempdir().unwrap();
        let msg = RecordingMessage::default();
        let mut command = Command::new("true");
        let config = PipeConfig::new()
            .with_dir(dir.path())
            .with_env_names("MY_PIPE", "MY_PIPE_BACK");
        let bridge = PipeBridge::setup(&config, Arc::new(msg), &mut command).unwrap();

        let envs: Vec<_> = command
            .as_std()
            .get_envs()
            .map(|(k, v)| (k.to_owned(), v.map(|v| v.to_owned())))
            .collect();
        assert!(envs.contains(&("MY_PIPE".into(), Some(bridge.reader_path().into()))));
        assert!(envs.contains(&("MY_PIPE_BACK".into(), Some(bridge.writer_path().into()))));
        close(&bridge).await;
    }

    #[tokio::test]
    async fn child_that_never_opens_the_pipe() {
        let dir = tempfile::tempdir().unwrap();
        let msg = RecordingMessage::default();
        let mut command = Command::new("sh");
        command.args(["-c", "exit 3"]);
        let config = PipeConfig::new().with_dir(dir.path());
        let bridge = PipeBridge::setup(&config, Arc::new(msg.clone()), &mut command).unwrap();

        let child = command.spawn().unwrap();
        let status = bridge.finish_when_exited(child).await.unwrap().unwrap();
        assert_eq!(status.code(), Some(3));

        tokio::time::timeout(WAIT, bridge.wait_closed()).await.unwrap();
        assert!(!bridge.reader_path().exists());
        assert!(msg.sent().is_empty());
    }

    #[tokio::test]
    async fn child_process_writes_a_record() {
        let dir = tempfile::tempdir().unwrap();
        let msg = RecordingMessage::default();
        let mut command = Command::new("sh");
        // 16-byte JSON document behind a big-endian length prefix.
        command.args([
            "-c",
            r#"printf '\000\000\000\020{"data":{"a":1}}' > "$GONB_PIPE""#,
        ]);
        let config = PipeConfig::new().with_dir(dir.path());
        let bridge = PipeBridge::setup(&config, Arc::new(msg.clone()), &mut command).unwrap();

        let child = command.spawn().unwrap();
        let status = bridge.finish_when_exited(child).await.unwrap().unwrap();
        assert!(status.success());
        tokio::time::timeout(WAIT, bridge.wait_closed()).await.unwrap();

        assert_eq!(
            msg.sent(),
            vec![Sent::Data(DisplayData::new().with_data("a", 1))]
        );
    }

    #[test]
    fn config_from_env_defaults() {
        let config = PipeConfig::new();
        assert_eq!(config.pipe_env, PIPE_ENV);
        assert_eq!(config.pipe_back_env, PIPE_BACK_ENV);
        assert_eq!(config.dir, std::env::temp_dir());
    }
}
