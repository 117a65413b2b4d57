use super::event::EventRecord;
use super::frame::{Decoded, FrameDecoder, split_frame};
use futures_lite::io::{AsyncRead, AsyncReadExt};
use serde_json::Value;
use std::collections::VecDeque;
use std::io::ErrorKind;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const READ_CHUNK: usize = 8 * 1024;

/// Which pipe a line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutputKind {
    Stdout,
    Stderr,
}

/// A plain (non-event) line of server output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLine {
    pub kind: OutputKind,
    pub text: String,
}

/// Receives decoded server output. Both methods default to doing nothing.
pub trait OutputListener: Send + Sync {
    fn on_text(&self, _line: &OutputLine) {}

    fn on_event(&self, _record: &EventRecord) {}
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Splits the server's output into plain lines and framed events.
///
/// Stdout is scanned for frames; stderr is plain text only. Each stream keeps
/// its own partial-line buffer, so interleaved writes to the two pipes never
/// corrupt each other. Plain lines are logged, archived (bounded) for late
/// viewers and broadcast to listeners; frames whose body is not valid JSON are
/// logged and dropped.
///
/// Feeding is expected from a single consumer at a time, which is what
/// [`ProcessOutputArchive::pump`] sets up.
///
/// # Example
///
/// ```
/// use harness_supervisor::stream::{EventRecord, OutputListener, ProcessOutputArchive, OutputKind};
/// use std::sync::{Arc, Mutex};
///
/// #[derive(Default)]
/// struct Collect(Mutex<Vec<String>>);
///
/// impl OutputListener for Collect {
///     fn on_event(&self, record: &EventRecord) {
///         self.0.lock().unwrap().push(record.event_type.clone());
///     }
/// }
///
/// let archive = ProcessOutputArchive::new("##ev##", 100);
/// let events = Arc::new(Collect::default());
/// archive.add_listener(events.clone());
///
/// archive.feed(OutputKind::Stdout, b"booting\n##ev##PORT:{\"port\":9876}##ev##\n");
/// assert_eq!(*events.0.lock().unwrap(), vec!["PORT".to_string()]);
/// assert_eq!(archive.lines()[0].text, "booting");
/// ```
pub struct ProcessOutputArchive {
    stdout: Mutex<FrameDecoder>,
    stderr: Mutex<FrameDecoder>,
    listeners: RwLock<Vec<Arc<dyn OutputListener>>>,
    history: Mutex<VecDeque<OutputLine>>,
    history_limit: usize,
}

impl ProcessOutputArchive {
    /// Create an archive recognising frames bracketed by `marker` on stdout
    /// and keeping at most `history_limit` plain lines.
    pub fn new(marker: &str, history_limit: usize) -> Self {
        Self {
            stdout: Mutex::new(FrameDecoder::new(marker)),
            stderr: Mutex::new(FrameDecoder::lines_only()),
            listeners: RwLock::new(Vec::new()),
            history: Mutex::new(VecDeque::new()),
            history_limit,
        }
    }

    pub fn add_listener(&self, listener: Arc<dyn OutputListener>) {
        self.listeners
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(listener);
    }

    /// Archived plain lines, oldest first.
    pub fn lines(&self) -> Vec<OutputLine> {
        lock(&self.history).iter().cloned().collect()
    }

    /// Feed a raw chunk read from the given pipe.
    pub fn feed(&self, kind: OutputKind, chunk: &[u8]) {
        let decoded = lock(self.decoder(kind)).decode(chunk);
        self.emit(kind, decoded);
    }

    /// Flush partial lines of both pipes. Called once both pipes hit EOF.
    pub fn finish(&self) {
        for kind in [OutputKind::Stdout, OutputKind::Stderr] {
            let decoded = lock(self.decoder(kind)).finish();
            self.emit(kind, decoded);
        }
    }

    /// Read both pipes until EOF, feeding everything through one consumer task.
    ///
    /// The returned handle completes after [`finish`](Self::finish) has run,
    /// i.e. once every event of the stream has been dispatched.
    pub fn pump<O, E>(self: Arc<Self>, stdout: O, stderr: E) -> JoinHandle<()>
    where
        O: AsyncRead + Unpin + Send + 'static,
        E: AsyncRead + Unpin + Send + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel();
        tokio::spawn(read_pipe(OutputKind::Stdout, stdout, tx.clone()));
        tokio::spawn(read_pipe(OutputKind::Stderr, stderr, tx));

        tokio::spawn(async move {
            while let Some((kind, chunk)) = rx.recv().await {
                self.feed(kind, &chunk);
            }
            self.finish();
        })
    }

    fn decoder(&self, kind: OutputKind) -> &Mutex<FrameDecoder> {
        match kind {
            OutputKind::Stdout => &self.stdout,
            OutputKind::Stderr => &self.stderr,
        }
    }

    fn listeners(&self) -> Vec<Arc<dyn OutputListener>> {
        self.listeners
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn emit(&self, kind: OutputKind, decoded: Vec<Decoded>) {
        if decoded.is_empty() {
            return;
        }
        let listeners = self.listeners();

        for item in decoded {
            match item {
                Decoded::Line(text) => {
                    tracing::debug!(target: "harness_supervisor::output", stream = ?kind, "{}", text);
                    let line = OutputLine { kind, text };
                    self.archive(line.clone());
                    for listener in &listeners {
                        listener.on_text(&line);
                    }
                }
                Decoded::Frame(raw) => {
                    let Some(record) = parse_record(&raw) else {
                        continue;
                    };
                    for listener in &listeners {
                        listener.on_event(&record);
                    }
                }
            }
        }
    }

    fn archive(&self, line: OutputLine) {
        if self.history_limit == 0 {
            return;
        }
        let mut history = lock(&self.history);
        if history.len() == self.history_limit {
            history.pop_front();
        }
        history.push_back(line);
    }
}

fn parse_record(raw: &str) -> Option<EventRecord> {
    let Some((event_type, event_body)) = split_frame(raw) else {
        tracing::warn!(frame = %raw, "Dropping event frame without a type separator");
        return None;
    };

    match serde_json::from_str::<Value>(event_body) {
        Ok(body) => Some(EventRecord::new(event_type, body)),
        Err(e) => {
            tracing::warn!(
                event_type = %event_type,
                event_body = %event_body,
                error = %e,
                "Cannot parse event body from server"
            );
            None
        }
    }
}

async fn read_pipe<R>(kind: OutputKind, mut reader: R, tx: mpsc::UnboundedSender<(OutputKind, Vec<u8>)>)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if tx.send((kind, buf[..n].to_vec())).is_err() {
                    break;
                }
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => {
                tracing::warn!(stream = ?kind, error = %e, "Failed to read server output");
                break;
            }
        }
    }
    tracing::trace!(stream = ?kind, "Output pipe closed");
}
