//! Cancellable streaming of external process output.
//!
//! A stream launches one process and runs three kinds of task:
//!
//! - one reader per output pipe, decoding lines into events and sending them
//!   onto a bounded channel;
//! - a supervisor that waits for the process (or kills it on cancellation)
//!   and reports the exit once both readers have drained;
//! - a forwarder on the blocking pool that drains the channel into the
//!   caller's [`EventSink`], so a slow sink never stalls an async worker.
//!
//! Every await point that could deliver data races against the stream's
//! [`CancellationToken`] in a `biased` select, cancellation first, and the
//! forwarder checks the token before each delivery, so no event reaches the
//! sink after cancellation has been observed.

use crate::process::ProcessSpec;
use crate::pull::{PullParser, PullPhase, PullProgressEvent};
use crate::RuntimeError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Lines of stderr kept for the terminal error message.
const ERROR_TAIL_LINES: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Logs,
    Pull,
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Logs => "logs",
            Self::Pull => "pull",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// One line of container output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogLine {
    pub container: String,
    pub stream: OutputStream,
    pub line: String,
    pub timestamp: DateTime<Utc>,
}

impl LogLine {
    pub fn new(container: impl Into<String>, stream: OutputStream, line: impl Into<String>) -> Self {
        Self {
            container: container.into(),
            stream,
            line: line.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Events delivered to an [`EventSink`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum StreamEvent {
    Log(LogLine),
    Pull(PullProgressEvent),
    /// The process ended on its own. Never sent after cancellation.
    Closed {
        kind: StreamKind,
        target: String,
        exit_code: Option<i32>,
    },
}

/// Receiver of stream events. Called from a blocking thread; a slow sink
/// applies backpressure to the readers through the bounded channel.
pub trait EventSink: Send + Sync + 'static {
    fn deliver(&self, event: StreamEvent);
}

impl<F> EventSink for F
where
    F: Fn(StreamEvent) + Send + Sync + 'static,
{
    fn deliver(&self, event: StreamEvent) {
        self(event);
    }
}

/// Turns raw lines into events; each reader owns a fresh copy.
#[derive(Debug, Clone)]
pub enum LineDecoder {
    Logs { container: String },
    Pull(PullParser),
}

impl LineDecoder {
    fn decode(&mut self, stream: OutputStream, line: &str) -> Option<StreamEvent> {
        match self {
            Self::Logs { container } => {
                let line = line.trim_end();
                (!line.is_empty()).then(|| StreamEvent::Log(LogLine::new(container.clone(), stream, line)))
            }
            Self::Pull(parser) => parser.parse_line(line).map(StreamEvent::Pull),
        }
    }

    fn image(&self) -> Option<&str> {
        match self {
            Self::Logs { .. } => None,
            Self::Pull(parser) => Some(parser.image()),
        }
    }
}

enum Message {
    Event(StreamEvent),
    Exit { code: Option<i32>, stderr_tail: Vec<String> },
}

/// Handle to a running stream.
pub struct StreamHandle {
    kind: StreamKind,
    target: String,
    token: CancellationToken,
    forwarder: JoinHandle<()>,
}

impl StreamHandle {
    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.forwarder.is_finished()
    }

    /// Wait until the forwarder has delivered its last event.
    pub async fn wait(self) {
        if let Err(e) = self.forwarder.await {
            warn!("{} stream for '{}' task failed: {e}", self.kind, self.target);
        }
    }
}

struct ActiveStream {
    id: u64,
    token: CancellationToken,
}

type ActiveMap = HashMap<(StreamKind, String), ActiveStream>;

/// Registry of running streams: at most one per (kind, target).
pub struct StreamManager {
    handle: Handle,
    buffer: usize,
    next_id: AtomicU64,
    active: Arc<Mutex<ActiveMap>>,
}

impl StreamManager {
    pub fn new(handle: Handle, buffer: usize) -> Self {
        Self {
            handle,
            buffer: buffer.max(1),
            next_id: AtomicU64::new(1),
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn is_active(&self, kind: StreamKind, target: &str) -> bool {
        lock(&self.active).contains_key(&(kind, target.to_owned()))
    }

    pub fn active_count(&self) -> usize {
        lock(&self.active).len()
    }

    /// Launch `spec` and stream its output into `sink`.
    ///
    /// Fails with `RuntimeError::Conflict` if a stream of the same kind is
    /// already active for `target`.
    pub fn start(
        &self,
        kind: StreamKind,
        target: &str,
        spec: &ProcessSpec,
        decoder: LineDecoder,
        sink: Arc<dyn EventSink>,
    ) -> Result<StreamHandle, RuntimeError> {
        let key = (kind, target.to_owned());
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        {
            let mut active = lock(&self.active);
            if active.contains_key(&key) {
                return Err(RuntimeError::Conflict {
                    kind,
                    target: target.to_owned(),
                });
            }
            active.insert(
                key.clone(),
                ActiveStream {
                    id,
                    token: token.clone(),
                },
            );
        }

        let spawned = {
            let _guard = self.handle.enter();
            spec.to_tokio_command()
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .spawn()
        };
        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                remove_if_current(&self.active, &key, id);
                return Err(e.into());
            }
        };
        info!("{kind} stream started for '{target}': {}", spec.display());

        let (tx, rx) = mpsc::channel(self.buffer);
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let out_reader = self.handle.spawn(read_lines(
            stdout,
            OutputStream::Stdout,
            decoder.clone(),
            tx.clone(),
            token.clone(),
        ));
        let err_reader = self.handle.spawn(read_lines(
            stderr,
            OutputStream::Stderr,
            decoder.clone(),
            tx.clone(),
            token.clone(),
        ));

        let supervisor_token = token.clone();
        self.handle.spawn(async move {
            let code = tokio::select! {
                biased;
                () = supervisor_token.cancelled() => {
                    let _ = child.kill().await;
                    return;
                }
                status = child.wait() => status.ok().and_then(|s| s.code()),
            };
            let _ = out_reader.await;
            let stderr_tail = err_reader.await.unwrap_or_default();
            tokio::select! {
                biased;
                () = supervisor_token.cancelled() => {}
                _ = tx.send(Message::Exit { code, stderr_tail }) => {}
            }
        });

        let forwarder = {
            let target = target.to_owned();
            let image = decoder.image().map(str::to_owned);
            let token = token.clone();
            let active = Arc::clone(&self.active);
            self.handle.spawn_blocking(move || {
                forward(kind, target, image, rx, sink, token, active, id);
            })
        };

        Ok(StreamHandle {
            kind,
            target: target.to_owned(),
            token,
            forwarder,
        })
    }

    /// Cancel the active stream for (kind, target). Returns whether one was
    /// running. The slot is free for a new stream as soon as this returns.
    pub fn stop(&self, kind: StreamKind, target: &str) -> bool {
        let removed = lock(&self.active).remove(&(kind, target.to_owned()));
        match removed {
            Some(stream) => {
                stream.token.cancel();
                info!("{kind} stream stopped for '{target}'");
                true
            }
            None => false,
        }
    }

    /// Cancel every active stream.
    pub fn stop_all(&self) {
        let drained: Vec<_> = lock(&self.active).drain().collect();
        for ((kind, target), stream) in drained {
            stream.token.cancel();
            debug!("{kind} stream stopped for '{target}'");
        }
    }
}

impl Drop for StreamManager {
    fn drop(&mut self) {
        self.stop_all();
    }
}

fn lock(active: &Mutex<ActiveMap>) -> std::sync::MutexGuard<'_, ActiveMap> {
    active.lock().unwrap_or_else(PoisonError::into_inner)
}

fn remove_if_current(active: &Mutex<ActiveMap>, key: &(StreamKind, String), id: u64) {
    let mut map = lock(active);
    if map.get(key).is_some_and(|s| s.id == id) {
        map.remove(key);
    }
}

/// Read one pipe line by line. Returns the last stderr lines for error
/// reporting.
async fn read_lines<R>(
    pipe: Option<R>,
    stream: OutputStream,
    mut decoder: LineDecoder,
    tx: mpsc::Sender<Message>,
    token: CancellationToken,
) -> Vec<String>
where
    R: AsyncRead + Unpin,
{
    let mut tail = Vec::new();
    let Some(pipe) = pipe else {
        return tail;
    };
    let mut lines = BufReader::new(pipe).lines();
    loop {
        let line = tokio::select! {
            biased;
            () = token.cancelled() => return tail,
            line = lines.next_line() => match line {
                Ok(Some(line)) => line,
                Ok(None) | Err(_) => return tail,
            },
        };
        if stream == OutputStream::Stderr && !line.trim().is_empty() {
            if tail.len() == ERROR_TAIL_LINES {
                tail.remove(0);
            }
            tail.push(line.trim().to_owned());
        }
        let Some(event) = decoder.decode(stream, &line) else {
            continue;
        };
        tokio::select! {
            biased;
            () = token.cancelled() => return tail,
            sent = tx.send(Message::Event(event)) => {
                if sent.is_err() {
                    return tail;
                }
            }
        }
    }
}

/// Drain the channel into the sink on a blocking thread. A pull's terminal
/// event is held until the exit code is known, so the sequence ends with
/// exactly one of `Complete` or `Error`.
#[allow(clippy::too_many_arguments, clippy::needless_pass_by_value)]
fn forward(
    kind: StreamKind,
    target: String,
    image: Option<String>,
    mut rx: mpsc::Receiver<Message>,
    sink: Arc<dyn EventSink>,
    token: CancellationToken,
    active: Arc<Mutex<ActiveMap>>,
    id: u64,
) {
    let mut progress = 0.0_f64;
    let mut held: Option<PullProgressEvent> = None;

    // Senders drop once the readers and supervisor stop, which they do
    // promptly on cancellation.
    while let Some(message) = rx.blocking_recv() {
        if token.is_cancelled() {
            break;
        }
        match message {
            Message::Event(StreamEvent::Pull(mut event)) => {
                if held.is_some() {
                    continue;
                }
                event.percentage = event.percentage.clamp(0.0, 100.0).max(progress);
                progress = event.percentage;
                if event.phase == PullPhase::Complete {
                    held = Some(event);
                } else {
                    sink.deliver(StreamEvent::Pull(event));
                }
            }
            Message::Event(event) => sink.deliver(event),
            Message::Exit { code, stderr_tail } => {
                if let Some(image) = &image {
                    let terminal = if code == Some(0) {
                        held.take()
                            .unwrap_or_else(|| PullProgressEvent::complete(image.clone()))
                    } else {
                        let mut message = match code {
                            Some(code) => format!("image pull failed with exit code {code}"),
                            None => "image pull terminated by signal".to_owned(),
                        };
                        if !stderr_tail.is_empty() {
                            message.push_str(": ");
                            message.push_str(&stderr_tail.join("\n"));
                        }
                        warn!("{message}");
                        let mut failed = PullProgressEvent::failed(image.clone(), message);
                        failed.percentage = progress;
                        failed
                    };
                    sink.deliver(StreamEvent::Pull(terminal));
                }
                debug!("{kind} stream for '{target}' closed (exit {code:?})");
                sink.deliver(StreamEvent::Closed {
                    kind,
                    target: target.clone(),
                    exit_code: code,
                });
                break;
            }
        }
    }
    remove_if_current(&active, &(kind, target), id);
}
