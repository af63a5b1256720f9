//! Server-Sent Events parsing for streaming chat completions.
//!
//! The response body is split into lines, `data:` payloads are decoded into
//! [`StreamChunk`]s and forwarded on a channel until the `[DONE]` sentinel,
//! a malformed payload, or the end of the body.

use std::fmt::Display;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use tokio::sync::mpsc;

use crate::providers::openai::types::StreamChunk;
use crate::{CallContext, Error};

/// Longest line accepted before the stream is rejected.
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

/// Capacity of the chunk channel produced by [`spawn_chunk_reader`].
pub const CHUNK_CHANNEL_CAPACITY: usize = 10;

const DONE_SENTINEL: &str = "[DONE]";

/// Result of parsing one SSE line.
#[derive(Debug)]
pub enum SseLine {
    /// Comment, keep-alive, non-data field or empty payload.
    Skip,
    /// The `data: [DONE]` sentinel.
    Done,
    /// A decoded `data:` payload.
    Chunk(StreamChunk),
}

/// Parse a single line of an SSE body.
pub fn parse_sse_line(line: &str) -> Result<SseLine, Error> {
    let Some(payload) = line.strip_prefix("data:") else {
        return Ok(SseLine::Skip);
    };
    let payload = payload.trim();

    if payload == DONE_SENTINEL {
        return Ok(SseLine::Done);
    }
    if payload.is_empty() {
        return Ok(SseLine::Skip);
    }

    serde_json::from_str::<StreamChunk>(payload)
        .map(SseLine::Chunk)
        .map_err(|e| Error::StreamProtocol {
            message: e.to_string(),
            raw: payload.to_string(),
        })
}

/// Splits a byte stream into text lines.
/// Keeps incomplete trailing bytes between chunks, so lines and multi-byte
/// characters may be split arbitrarily across network reads.
pub struct SseLines<S> {
    /// The underlying byte stream
    inner: S,
    /// Bytes after the last newline seen so far
    buffer: Vec<u8>,
    /// Start of the unread region of `buffer`
    start: usize,
    finished: bool,
}

impl<S> SseLines<S> {
    pub fn new(stream: S) -> Self {
        Self {
            inner: stream,
            buffer: Vec::new(),
            start: 0,
            finished: false,
        }
    }

    /// Pop the next complete line out of the buffer.
    fn take_line(&mut self) -> Option<Result<String, Error>> {
        let pending = &self.buffer[self.start..];
        let pos = memchr::memchr(b'\n', pending)?;
        if pos > MAX_LINE_BYTES {
            self.finished = true;
            self.buffer.clear();
            self.start = 0;
            return Some(Err(line_too_long()));
        }
        let end = self.start + pos;
        let line = decode_line(&self.buffer[self.start..end]);
        self.start = end + 1;
        Some(line)
    }

    fn compact(&mut self) {
        if self.start > 0 {
            self.buffer.drain(..self.start);
            self.start = 0;
        }
    }
}

fn line_too_long() -> Error {
    Error::streaming(format!("SSE line exceeded {MAX_LINE_BYTES} bytes"))
}

fn decode_line(bytes: &[u8]) -> Result<String, Error> {
    let bytes = bytes.strip_suffix(b"\r").unwrap_or(bytes);
    std::str::from_utf8(bytes)
        .map(str::to_owned)
        .map_err(|e| Error::streaming(format!("Invalid UTF-8 in SSE line: {e}")))
}

impl<S, E> Stream for SseLines<S>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
    E: Display,
{
    type Item = Result<String, Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;
        loop {
            if let Some(line) = this.take_line() {
                return Poll::Ready(Some(line));
            }
            if this.finished {
                return Poll::Ready(None);
            }
            this.compact();

            match ready!(this.inner.poll_next_unpin(cx)) {
                Some(Ok(chunk)) => {
                    this.buffer.extend_from_slice(&chunk);
                    let unterminated = memchr::memrchr(b'\n', &this.buffer)
                        .map_or(this.buffer.len(), |pos| this.buffer.len() - pos - 1);
                    if unterminated > MAX_LINE_BYTES {
                        this.finished = true;
                        this.buffer.clear();
                        return Poll::Ready(Some(Err(line_too_long())));
                    }
                }
                Some(Err(e)) => {
                    this.finished = true;
                    return Poll::Ready(Some(Err(Error::streaming(format!(
                        "failed to read SSE stream: {e}"
                    )))));
                }
                None => {
                    this.finished = true;
                    // A final line without a trailing newline still counts.
                    if !this.buffer.is_empty() {
                        let rest = std::mem::take(&mut this.buffer);
                        return Poll::Ready(Some(decode_line(&rest)));
                    }
                    return Poll::Ready(None);
                }
            }
        }
    }
}

/// Where the chunk reader is in the body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderState {
    Reading,
    /// Saw the `[DONE]` sentinel.
    Done,
    /// Hit a malformed payload or a read failure.
    Error,
    /// Body exhausted without a sentinel.
    Eof,
}

/// Pulls [`StreamChunk`]s out of a byte stream one at a time.
pub struct ChunkReader<S> {
    lines: SseLines<S>,
    state: ReaderState,
}

impl<S, E> ChunkReader<S>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
    E: Display,
{
    pub fn new(stream: S) -> Self {
        Self {
            lines: SseLines::new(stream),
            state: ReaderState::Reading,
        }
    }

    pub fn state(&self) -> ReaderState {
        self.state
    }

    /// Next chunk, `None` once the reader reached a terminal state.
    pub async fn next_chunk(&mut self) -> Option<Result<StreamChunk, Error>> {
        while self.state == ReaderState::Reading {
            let line = match self.lines.next().await {
                Some(Ok(line)) => line,
                Some(Err(e)) => {
                    self.state = ReaderState::Error;
                    return Some(Err(e));
                }
                None => {
                    self.state = ReaderState::Eof;
                    return None;
                }
            };

            match parse_sse_line(&line) {
                Ok(SseLine::Skip) => continue,
                Ok(SseLine::Done) => self.state = ReaderState::Done,
                Ok(SseLine::Chunk(chunk)) => return Some(Ok(chunk)),
                Err(e) => {
                    self.state = ReaderState::Error;
                    return Some(Err(e));
                }
            }
        }
        None
    }
}

/// Receiving side of a running chunk reader.
///
/// `chunks` closes when the reader stops; `errors` then holds at most one
/// error, and is empty when the stream ended cleanly.
#[derive(Debug)]
pub struct ChunkStream {
    pub chunks: mpsc::Receiver<StreamChunk>,
    pub errors: mpsc::Receiver<Error>,
}

/// Run a [`ChunkReader`] over `body` in a background task.
///
/// The task stops on the sentinel, on the first error, when `ctx` finishes,
/// or when the receiver is dropped.
pub fn spawn_chunk_reader<S, E>(ctx: CallContext, body: S) -> ChunkStream
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: Display + Send + 'static,
{
    let (chunk_tx, chunks) = mpsc::channel(CHUNK_CHANNEL_CAPACITY);
    let (err_tx, errors) = mpsc::channel(1);

    tokio::spawn(async move {
        let mut reader = ChunkReader::new(Box::pin(body));
        loop {
            let next = tokio::select! {
                err = ctx.done() => {
                    let _ = err_tx.try_send(err);
                    return;
                }
                next = reader.next_chunk() => next,
            };

            let chunk = match next {
                Some(Ok(chunk)) => chunk,
                Some(Err(e)) => {
                    tracing::warn!(error = %e, "SSE stream failed");
                    let _ = err_tx.try_send(e);
                    return;
                }
                None => {
                    tracing::debug!(state = ?reader.state(), "SSE stream finished");
                    return;
                }
            };

            tokio::select! {
                err = ctx.done() => {
                    let _ = err_tx.try_send(err);
                    return;
                }
                sent = chunk_tx.send(chunk) => {
                    if sent.is_err() {
                        // Receiver dropped.
                        return;
                    }
                }
            }
        }
    });

    ChunkStream { chunks, errors }
}
