//! Text streams and the channel wrappers around them.
//!
//! A stream is a bounded text channel plus a single-slot error channel. The
//! producer owns both senders and drops them together when it stops, so a
//! consumer drains the text first and then reads at most one error. An empty,
//! closed error channel means the stream finished cleanly.

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::HandlerError;
use crate::{CallContext, Error, Incomplete};

/// Text channel capacity used when a caller passes zero.
pub const DEFAULT_BUFFER_SIZE: usize = 10;

/// Consumer side of a text stream.
#[derive(Debug)]
pub struct TextStream {
    pub text: mpsc::Receiver<String>,
    pub errors: mpsc::Receiver<Error>,
}

/// Producer side of a text stream.
#[derive(Debug)]
pub struct TextSink {
    text: mpsc::Sender<String>,
    errors: mpsc::Sender<Error>,
}

impl TextStream {
    /// Create a connected sink/stream pair with a text buffer of `capacity`.
    pub fn channel(capacity: usize) -> (TextSink, TextStream) {
        let (text_tx, text) = mpsc::channel(capacity.max(1));
        let (err_tx, errors) = mpsc::channel(1);
        (
            TextSink {
                text: text_tx,
                errors: err_tx,
            },
            TextStream { text, errors },
        )
    }

    /// A stream that is already closed and holds `err`.
    pub fn failed(err: Error) -> Self {
        let (sink, stream) = Self::channel(1);
        sink.fail(err);
        stream
    }

    /// Next text chunk, `None` once the producer is done.
    pub async fn recv(&mut self) -> Option<String> {
        self.text.recv().await
    }

    /// The terminal error, if any. Only meaningful after `recv` returned `None`.
    pub async fn error(&mut self) -> Option<Error> {
        self.errors.recv().await
    }

    /// Next chunk, `Ok(None)` on a clean end, `Err` on a producer error or
    /// when `ctx` finishes first.
    pub async fn next(&mut self, ctx: &CallContext) -> Result<Option<String>, Error> {
        let chunk = tokio::select! {
            biased;
            err = ctx.done() => return Err(err),
            chunk = self.text.recv() => chunk,
        };
        if chunk.is_some() {
            return Ok(chunk);
        }
        tokio::select! {
            biased;
            err = ctx.done() => Err(err),
            err = self.errors.recv() => match err {
                Some(err) => Err(err),
                None => Ok(None),
            },
        }
    }
}

impl TextSink {
    /// Send one chunk, waiting for buffer space. Fails when `ctx` finishes or
    /// the consumer has gone away.
    pub async fn send(&self, ctx: &CallContext, chunk: String) -> Result<(), Error> {
        tokio::select! {
            biased;
            err = ctx.done() => Err(err),
            sent = self.text.send(chunk) => {
                sent.map_err(|_| Error::streaming("stream consumer dropped"))
            }
        }
    }

    /// Record `err` (best effort) and close the stream.
    pub fn fail(self, err: Error) {
        let _ = self.errors.try_send(err);
    }

    /// True once the consumer dropped the text receiver.
    pub fn is_closed(&self) -> bool {
        self.text.is_closed()
    }
}

/// Producer-side helper owning a text sink and its own cancellation scope.
#[derive(Debug)]
pub struct StreamBuffer {
    sink: TextSink,
    scope: CallContext,
}

impl StreamBuffer {
    /// Create a buffer of `size` chunks (0 means [`DEFAULT_BUFFER_SIZE`])
    /// scoped under `ctx`, together with its consumer.
    pub fn new(ctx: &CallContext, size: usize) -> (StreamBuffer, StreamResponse) {
        let size = if size == 0 { DEFAULT_BUFFER_SIZE } else { size };
        let scope = ctx.child();
        let (sink, stream) = TextStream::channel(size);
        (
            StreamBuffer {
                sink,
                scope: scope.clone(),
            },
            StreamResponse::new(scope, stream),
        )
    }

    /// Write one chunk, blocking until there is room or the scope is cancelled.
    pub async fn write(&self, text: impl Into<String>) -> Result<(), Error> {
        self.sink.send(&self.scope, text.into()).await
    }

    /// Push `err` if the slot is free, then close.
    pub fn error(self, err: Error) {
        self.sink.fail(err);
    }

    pub fn close(self) {}

    pub fn scope(&self) -> &CallContext {
        &self.scope
    }
}

/// Consumer-side wrapper pairing a [`TextStream`] with the scope that
/// controls its producer.
#[derive(Debug)]
pub struct StreamResponse {
    stream: TextStream,
    scope: CallContext,
}

impl StreamResponse {
    /// Wrap `stream`; cancelling `scope` must stop its producer.
    pub fn new(scope: CallContext, stream: TextStream) -> Self {
        Self { stream, scope }
    }

    /// Drain the stream into one string.
    pub async fn collect(self) -> Result<String, Incomplete> {
        self.collect_with_callback(|_, _| {}).await
    }

    /// Call `f` for every chunk. A callback error cancels the producer.
    pub async fn for_each<F>(mut self, mut f: F) -> Result<(), Error>
    where
        F: FnMut(&str) -> Result<(), HandlerError>,
    {
        while let Some(chunk) = self.stream.next(&self.scope).await? {
            if let Err(e) = f(&chunk) {
                self.scope.cancel();
                return Err(Error::Callback(e));
            }
        }
        Ok(())
    }

    /// Drain the stream, reporting `(accumulated, delta)` after every chunk.
    pub async fn collect_with_callback<F>(mut self, mut callback: F) -> Result<String, Incomplete>
    where
        F: FnMut(&str, &str),
    {
        let mut text = String::new();
        loop {
            match self.stream.next(&self.scope).await {
                Ok(Some(chunk)) => {
                    text.push_str(&chunk);
                    callback(&text, &chunk);
                }
                Ok(None) => return Ok(text),
                Err(e) => return Err(Incomplete::new(text, e)),
            }
        }
    }

    /// Stop the producer and drop the stream.
    pub fn close(self) {
        self.scope.cancel();
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.scope.token().clone()
    }

    pub fn scope(&self) -> &CallContext {
        &self.scope
    }

    pub fn into_parts(self) -> (CallContext, TextStream) {
        (self.scope, self.stream)
    }
}
