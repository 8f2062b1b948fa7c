//! Push-connection transports.
//!
//! The ingestor only sees [`PushTransport`] / [`FrameSource`]: one opens a
//! connection scoped to a set of subjects, the other yields raw frame text
//! until the connection ends. [`SseTransport`] is the production
//! implementation (Server-Sent Events over reqwest); [`ChannelTransport`]
//! feeds frames from in-process channels.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use reqwest::header::{ACCEPT, CACHE_CONTROL};
use tokio::sync::mpsc;
use tracing::debug;

use crate::errors::TransportError;
use crate::util::{endpoint, response_error_message};

/// Path of the push endpoint relative to the server base URL.
pub const STREAM_PATH: &str = "/api/process/stream";

/// Opens push connections.
#[async_trait]
pub trait PushTransport: Send + Sync + 'static {
    async fn open(&self, subject_ids: &[String]) -> Result<Box<dyn FrameSource>, TransportError>;
}

/// An open push connection.
#[async_trait]
pub trait FrameSource: Send {
    /// Next frame. `None` means the server closed the connection.
    ///
    /// Must be cancel-safe: the ingestor drops this future whenever a timer
    /// fires first.
    async fn next_frame(&mut self) -> Option<Result<String, TransportError>>;
}

// ── Server-Sent Events ───────────────────────────────────────────────

/// `GET {base_url}/api/process/stream?ids=a,b` as an SSE stream.
#[derive(Debug, Clone)]
pub struct SseTransport {
    client: reqwest::Client,
    base_url: String,
}

impl SseTransport {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), base_url)
    }

    pub fn with_client(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl PushTransport for SseTransport {
    async fn open(&self, subject_ids: &[String]) -> Result<Box<dyn FrameSource>, TransportError> {
        let url = endpoint(&self.base_url, STREAM_PATH);
        let ids = subject_ids.join(",");
        debug!(%url, %ids, "opening event stream");

        let resp = self
            .client
            .get(&url)
            .query(&[("ids", ids.as_str())])
            .header(ACCEPT, "text/event-stream")
            .header(CACHE_CONTROL, "no-cache")
            .send()
            .await
            .map_err(TransportError::Connect)?;

        let status = resp.status();
        if !status.is_success() {
            return Err(TransportError::Status {
                status: status.as_u16(),
                message: response_error_message(resp).await,
            });
        }

        Ok(Box::new(SseSource {
            response: resp,
            parser: SseParser::default(),
            finished: false,
        }))
    }
}

struct SseSource {
    response: reqwest::Response,
    parser: SseParser,
    finished: bool,
}

#[async_trait]
impl FrameSource for SseSource {
    async fn next_frame(&mut self) -> Option<Result<String, TransportError>> {
        loop {
            if let Some(frame) = self.parser.next_event() {
                return Some(Ok(frame));
            }
            if self.finished {
                return None;
            }
            match self.response.chunk().await {
                Ok(Some(bytes)) => {
                    if let Err(e) = self.parser.feed(&bytes) {
                        return Some(Err(e));
                    }
                }
                Ok(None) => {
                    self.parser.finish();
                    self.finished = true;
                }
                Err(e) => return Some(Err(TransportError::Read(e))),
            }
        }
    }
}

/// Longest SSE line accepted before the stream is treated as broken.
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

/// Incremental Server-Sent Events parser.
///
/// Only `data:` fields matter; each blank-line-terminated event yields its data
/// lines joined with `\n`. Comments (`:` lines) and other fields are skipped.
#[derive(Debug, Default)]
pub struct SseParser {
    buf: Vec<u8>,
    /// Bytes of `buf` already known to hold no newline.
    scanned: usize,
    data: Vec<String>,
    ready: VecDeque<String>,
}

impl SseParser {
    pub fn feed(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        self.buf.extend_from_slice(bytes);
        while let Some(offset) = self.buf[self.scanned..].iter().position(|b| *b == b'\n') {
            let pos = self.scanned + offset;
            let mut line: Vec<u8> = self.buf.drain(..=pos).collect();
            self.scanned = 0;
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            let line = String::from_utf8_lossy(&line).into_owned();
            self.process_line(&line);
        }
        self.scanned = self.buf.len();
        if self.buf.len() > MAX_LINE_BYTES {
            let len = self.buf.len();
            self.buf.clear();
            self.scanned = 0;
            return Err(TransportError::Other(format!(
                "event stream line exceeds {} bytes ({} buffered)",
                MAX_LINE_BYTES, len
            )));
        }
        Ok(())
    }

    /// Flush whatever is left when the stream ends. An unterminated final
    /// event is still delivered.
    pub fn finish(&mut self) {
        if !self.buf.is_empty() {
            let rest = std::mem::take(&mut self.buf);
            self.scanned = 0;
            let line = String::from_utf8_lossy(&rest);
            let line = line.trim_end_matches('\r').to_string();
            self.process_line(&line);
        }
        self.dispatch();
    }

    pub fn next_event(&mut self) -> Option<String> {
        self.ready.pop_front()
    }

    fn process_line(&mut self, line: &str) {
        if line.is_empty() {
            self.dispatch();
            return;
        }
        if line.starts_with(':') {
            return;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        if field == "data" {
            self.data.push(value.to_string());
        }
    }

    fn dispatch(&mut self) {
        if !self.data.is_empty() {
            self.ready.push_back(self.data.join("\n"));
            self.data.clear();
        }
    }
}

// ── In-process channels ──────────────────────────────────────────────

/// Sender half of one [`ChannelTransport`] connection.
pub type FrameSender = mpsc::Sender<Result<String, TransportError>>;

type QueuedConnection = Result<mpsc::Receiver<Result<String, TransportError>>, TransportError>;

/// Transport whose connections are queued up front as channels.
///
/// Each `open` consumes the next queued outcome: either a channel receiver
/// (a successful connection that yields whatever is sent into it and closes
/// when the sender is dropped) or an error. Once the queue is empty every
/// further `open` fails.
#[derive(Default)]
pub struct ChannelTransport {
    queue: Mutex<VecDeque<QueuedConnection>>,
    opened: Mutex<Vec<Vec<String>>>,
}

impl ChannelTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a successful connection; frames sent on the returned sender are
    /// delivered in order.
    pub fn push_connection(&self, capacity: usize) -> FrameSender {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        self.lock_queue().push_back(Ok(rx));
        tx
    }

    /// Queue a failed connection attempt.
    pub fn push_failure(&self, error: TransportError) {
        self.lock_queue().push_back(Err(error));
    }

    /// Subject sets passed to every `open` so far, in call order.
    pub fn opened(&self) -> Vec<Vec<String>> {
        self.opened.lock().map(|o| o.clone()).unwrap_or_default()
    }

    fn lock_queue(&self) -> MutexGuard<'_, VecDeque<QueuedConnection>> {
        self.queue.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl PushTransport for ChannelTransport {
    async fn open(&self, subject_ids: &[String]) -> Result<Box<dyn FrameSource>, TransportError> {
        if let Ok(mut opened) = self.opened.lock() {
            opened.push(subject_ids.to_vec());
        }
        match self.lock_queue().pop_front() {
            Some(Ok(rx)) => Ok(Box::new(ChannelSource { rx })),
            Some(Err(e)) => Err(e),
            None => Err(TransportError::Other("no connection available".to_string())),
        }
    }
}

struct ChannelSource {
    rx: mpsc::Receiver<Result<String, TransportError>>,
}

#[async_trait]
impl FrameSource for ChannelSource {
    async fn next_frame(&mut self) -> Option<Result<String, TransportError>> {
        self.rx.recv().await
    }
}
