//! Consumers for text streams: accumulate chunks and report progress to an
//! update callback, optionally throttled or batched.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};

use crate::error::HandlerError;
use crate::response::{StreamBuffer, StreamResponse, TextStream, DEFAULT_BUFFER_SIZE};
use crate::{CallContext, Error, Incomplete};

/// Callback invoked with `(accumulated, delta)`.
pub type UpdateHandler = Arc<dyn Fn(&str, &str) -> Result<(), HandlerError> + Send + Sync>;

/// Batch size used when a caller passes zero.
pub const DEFAULT_BATCH_SIZE: usize = 5;

/// Output buffer of [`merge_streams`].
pub const MERGE_BUFFER_SIZE: usize = 20;

/// Drives a [`TextStream`] to completion, reporting progress to an optional
/// [`UpdateHandler`].
///
/// Every method returns the full text on success. On failure the text
/// accumulated so far comes back inside [`Incomplete`].
#[derive(Clone)]
pub struct StreamProcessor {
    buffer_size: usize,
    handler: Option<UpdateHandler>,
}

impl std::fmt::Debug for StreamProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamProcessor")
            .field("buffer_size", &self.buffer_size)
            .field("has_handler", &self.handler.is_some())
            .finish()
    }
}

impl Default for StreamProcessor {
    fn default() -> Self {
        Self::new(None)
    }
}

impl StreamProcessor {
    pub fn new(handler: Option<UpdateHandler>) -> Self {
        Self::with_buffer(handler, DEFAULT_BUFFER_SIZE)
    }

    /// Record a preferred buffer size for streams created on behalf of this
    /// processor; 0 means [`DEFAULT_BUFFER_SIZE`].
    pub fn with_buffer(handler: Option<UpdateHandler>, buffer_size: usize) -> Self {
        let buffer_size = if buffer_size == 0 {
            DEFAULT_BUFFER_SIZE
        } else {
            buffer_size
        };
        Self {
            buffer_size,
            handler,
        }
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    fn notify(&self, accumulated: &str, delta: &str) -> Result<(), Error> {
        match &self.handler {
            Some(handler) => handler(accumulated, delta).map_err(Error::Callback),
            None => Ok(()),
        }
    }

    /// Best-effort final update on an error path.
    fn flush_quietly(&self, accumulated: &str, delta: &str) {
        if let Err(e) = self.notify(accumulated, delta) {
            tracing::debug!(error = %e, "final update before abort failed");
        }
    }

    /// Call the handler after every chunk.
    pub async fn process(
        &self,
        ctx: &CallContext,
        mut stream: TextStream,
    ) -> Result<String, Incomplete> {
        let mut text = String::new();
        loop {
            match stream.next(ctx).await {
                Ok(Some(chunk)) => {
                    text.push_str(&chunk);
                    if let Err(e) = self.notify(&text, &chunk) {
                        return Err(Incomplete::new(text, e));
                    }
                }
                Ok(None) => return Ok(text),
                Err(e) => return Err(Incomplete::new(text, e)),
            }
        }
    }

    /// Accumulate every chunk but call the handler at most once per
    /// `min_interval`. A pending update is always flushed when the stream
    /// ends, and flushed best-effort on error or cancellation.
    pub async fn process_with_throttle(
        &self,
        ctx: &CallContext,
        mut stream: TextStream,
        min_interval: Duration,
    ) -> Result<String, Incomplete> {
        let period = min_interval.max(Duration::from_millis(1));
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut text = String::new();
        let mut pending = false;
        let mut last_update: Option<Instant> = None;

        loop {
            tokio::select! {
                err = ctx.done() => {
                    if pending {
                        self.flush_quietly(&text, "");
                    }
                    return Err(Incomplete::new(text, err));
                }
                chunk = stream.text.recv() => {
                    let Some(chunk) = chunk else { break };
                    text.push_str(&chunk);
                    pending = true;

                    let now = Instant::now();
                    let due = last_update
                        .is_none_or(|last| now.duration_since(last) >= min_interval);
                    if due {
                        if let Err(e) = self.notify(&text, &chunk) {
                            return Err(Incomplete::new(text, e));
                        }
                        last_update = Some(now);
                        pending = false;
                    }
                }
                _ = ticker.tick() => {
                    if pending {
                        if let Err(e) = self.notify(&text, "") {
                            return Err(Incomplete::new(text, e));
                        }
                        last_update = Some(Instant::now());
                        pending = false;
                    }
                }
            }
        }

        if let Some(err) = terminal_error(ctx, &mut stream).await {
            if pending {
                self.flush_quietly(&text, "");
            }
            return Err(Incomplete::new(text, err));
        }
        if pending {
            if let Err(e) = self.notify(&text, "") {
                return Err(Incomplete::new(text, e));
            }
        }
        Ok(text)
    }

    /// Call the handler once per `batch_size` chunks (0 means
    /// [`DEFAULT_BATCH_SIZE`]) with the accumulated text and the batch's
    /// concatenation. A partial final batch is flushed as well.
    pub async fn process_batch(
        &self,
        ctx: &CallContext,
        mut stream: TextStream,
        batch_size: usize,
    ) -> Result<String, Incomplete> {
        let batch_size = if batch_size == 0 {
            DEFAULT_BATCH_SIZE
        } else {
            batch_size
        };

        let mut text = String::new();
        let mut batch = String::new();
        let mut count = 0;

        loop {
            match stream.next(ctx).await {
                Ok(Some(chunk)) => {
                    text.push_str(&chunk);
                    batch.push_str(&chunk);
                    count += 1;
                    if count >= batch_size {
                        if let Err(e) = self.notify(&text, &batch) {
                            return Err(Incomplete::new(text, e));
                        }
                        batch.clear();
                        count = 0;
                    }
                }
                Ok(None) => {
                    if !batch.is_empty() {
                        if let Err(e) = self.notify(&text, &batch) {
                            return Err(Incomplete::new(text, e));
                        }
                    }
                    return Ok(text);
                }
                Err(e) => {
                    if !batch.is_empty() {
                        self.flush_quietly(&text, &batch);
                    }
                    return Err(Incomplete::new(text, e));
                }
            }
        }
    }
}

async fn terminal_error(ctx: &CallContext, stream: &mut TextStream) -> Option<Error> {
    tokio::select! {
        biased;
        err = stream.error() => err,
        err = ctx.done() => Some(err),
    }
}

/// Drain a stream without a callback.
pub async fn simple_process(ctx: &CallContext, stream: TextStream) -> Result<String, Incomplete> {
    StreamProcessor::default().process(ctx, stream).await
}

/// Drain a stream, publishing the accumulated length after each chunk.
///
/// Progress values are dropped when `progress` is full; the sender is
/// dropped on return, which closes the channel.
pub async fn process_with_progress(
    ctx: &CallContext,
    mut stream: TextStream,
    progress: mpsc::Sender<usize>,
) -> Result<String, Incomplete> {
    let mut text = String::new();
    loop {
        match stream.next(ctx).await {
            Ok(Some(chunk)) => {
                text.push_str(&chunk);
                let _ = progress.try_send(text.len());
            }
            Ok(None) => return Ok(text),
            Err(e) => return Err(Incomplete::new(text, e)),
        }
    }
}

/// Wrap `handler` so calls within `min_interval` of the last accepted call
/// are dropped. There is no trailing flush.
pub fn throttled_update_handler(handler: UpdateHandler, min_interval: Duration) -> UpdateHandler {
    let last_update: Mutex<Option<Instant>> = Mutex::new(None);
    Arc::new(move |accumulated: &str, delta: &str| {
        let mut last = last_update.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        if last.is_some_and(|last| now.duration_since(last) < min_interval) {
            return Ok(());
        }
        *last = Some(now);
        handler(accumulated, delta)
    })
}

/// Concatenate several streams into one, source by source.
///
/// Source `i + 1` is not read until source `i` has closed. The first source
/// error, or cancellation of `ctx`, ends the merged stream with that error and
/// cancels the remaining sources.
pub fn merge_streams(ctx: &CallContext, responses: Vec<StreamResponse>) -> StreamResponse {
    let (buffer, merged) = StreamBuffer::new(ctx, MERGE_BUFFER_SIZE);

    tokio::spawn(async move {
        let mut sources = responses.into_iter();
        while let Some(source) = sources.next() {
            let (scope, mut stream) = source.into_parts();
            loop {
                let next = stream.next(buffer.scope()).await;
                let failure = match next {
                    Ok(Some(chunk)) => {
                        let written = buffer.write(chunk).await;
                        match written {
                            Ok(()) => continue,
                            Err(e) => e,
                        }
                    }
                    Ok(None) => break,
                    Err(e) => e,
                };

                tracing::debug!(error = %failure, "merged stream aborted");
                scope.cancel();
                sources.by_ref().for_each(StreamResponse::close);
                buffer.error(failure);
                return;
            }
        }
        buffer.close();
    });

    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    type Calls = Arc<StdMutex<Vec<(String, String)>>>;

    fn recording_handler() -> (UpdateHandler, Calls) {
        let calls: Calls = Arc::new(StdMutex::new(Vec::new()));
        let sink = calls.clone();
        let handler: UpdateHandler = Arc::new(move |acc: &str, delta: &str| -> Result<(), HandlerError> {
            sink.lock().unwrap().push((acc.to_string(), delta.to_string()));
            Ok(())
        });
        (handler, calls)
    }

    /// A closed stream holding `chunks`, optionally followed by `error`.
    fn stream_of(chunks: &[&str], error: Option<Error>) -> TextStream {
        let (sink, stream) = TextStream::channel(chunks.len().max(1));
        let ctx = CallContext::new();
        let chunks: Vec<String> = chunks.iter().map(|c| c.to_string()).collect();
        tokio::spawn(async move {
            for chunk in chunks {
                sink.send(&ctx, chunk).await.unwrap();
            }
            if let Some(err) = error {
                sink.fail(err);
            }
        });
        stream
    }

    fn response_of(chunks: &[&str], error: Option<Error>) -> StreamResponse {
        StreamResponse::new(CallContext::new(), stream_of(chunks, error))
    }

    #[tokio::test]
    async fn test_process_calls_handler_per_chunk() {
        let (handler, calls) = recording_handler();
        let processor = StreamProcessor::new(Some(handler));

        let text = processor
            .process(&CallContext::new(), stream_of(&["a", "b", "c"], None))
            .await
            .unwrap();
        assert_eq!(text, "abc");
        assert_eq!(
            *calls.lock().unwrap(),
            vec![
                ("a".to_string(), "a".to_string()),
                ("ab".to_string(), "b".to_string()),
                ("abc".to_string(), "c".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_process_handler_error_aborts() {
        let handler: UpdateHandler = Arc::new(|acc: &str, _: &str| -> Result<(), HandlerError> {
            if acc.len() >= 2 {
                Err("message too long".into())
            } else {
                Ok(())
            }
        });
        let processor = StreamProcessor::new(Some(handler));

        let incomplete = processor
            .process(&CallContext::new(), stream_of(&["a", "b", "c"], None))
            .await
            .unwrap_err();
        assert_eq!(incomplete.text, "ab");
        assert!(matches!(incomplete.error, Error::Callback(_)));
    }

    #[tokio::test]
    async fn test_stream_error_returns_partial_text() {
        let incomplete = simple_process(
            &CallContext::new(),
            stream_of(&["par", "tial"], Some(Error::streaming("reset"))),
        )
        .await
        .unwrap_err();
        assert_eq!(incomplete.text, "partial");
        assert!(matches!(incomplete.error, Error::Streaming(_)));
    }

    #[tokio::test]
    async fn test_throttle_final_update_has_full_text() {
        let (handler, calls) = recording_handler();
        let processor = StreamProcessor::new(Some(handler));
        let chunks: Vec<String> = (0..20).map(|i| format!("{i},")).collect();
        let refs: Vec<&str> = chunks.iter().map(String::as_str).collect();

        let text = processor
            .process_with_throttle(
                &CallContext::new(),
                stream_of(&refs, None),
                Duration::from_secs(10),
            )
            .await
            .unwrap();

        assert_eq!(text, chunks.concat());
        let calls = calls.lock().unwrap();
        assert!(calls.len() < 20);
        assert_eq!(calls.last().unwrap().0, text);
        for pair in calls.windows(2) {
            assert!(pair[0].0.len() <= pair[1].0.len());
        }
    }

    #[tokio::test]
    async fn test_throttle_flushes_on_error() {
        let (handler, calls) = recording_handler();
        let processor = StreamProcessor::new(Some(handler));

        let incomplete = processor
            .process_with_throttle(
                &CallContext::new(),
                stream_of(&["a", "b"], Some(Error::streaming("reset"))),
                Duration::from_secs(10),
            )
            .await
            .unwrap_err();
        assert_eq!(incomplete.text, "ab");
        assert_eq!(calls.lock().unwrap().last().unwrap().0, "ab");
    }

    #[tokio::test]
    async fn test_throttle_cancellation_returns_partial_text() {
        let (handler, calls) = recording_handler();
        let processor = StreamProcessor::new(Some(handler));
        let ctx = CallContext::new();
        let (sink, stream) = TextStream::channel(4);
        sink.send(&ctx, "first".to_string()).await.unwrap();
        sink.send(&ctx, "second".to_string()).await.unwrap();

        let canceller = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });

        let incomplete = processor
            .process_with_throttle(&ctx, stream, Duration::from_secs(10))
            .await
            .unwrap_err();
        assert_eq!(incomplete.text, "firstsecond");
        assert!(matches!(incomplete.error, Error::Cancelled));
        assert_eq!(calls.lock().unwrap().last().unwrap().0, "firstsecond");
        drop(sink);
    }

    #[tokio::test]
    async fn test_batch_of_three_over_seven_chunks() {
        let (handler, calls) = recording_handler();
        let processor = StreamProcessor::new(Some(handler));

        let text = processor
            .process_batch(
                &CallContext::new(),
                stream_of(&["1", "2", "3", "4", "5", "6", "7"], None),
                3,
            )
            .await
            .unwrap();
        assert_eq!(text, "1234567");

        let deltas: Vec<String> = calls.lock().unwrap().iter().map(|c| c.1.clone()).collect();
        assert_eq!(deltas, vec!["123", "456", "7"]);
        assert_eq!(calls.lock().unwrap().last().unwrap().0, "1234567");
    }

    #[tokio::test]
    async fn test_batch_size_zero_uses_default() {
        let (handler, calls) = recording_handler();
        let processor = StreamProcessor::new(Some(handler));
        let chunks = ["a"; 6];

        processor
            .process_batch(&CallContext::new(), stream_of(&chunks, None), 0)
            .await
            .unwrap();
        let deltas: Vec<String> = calls.lock().unwrap().iter().map(|c| c.1.clone()).collect();
        assert_eq!(deltas, vec!["aaaaa", "a"]);
    }

    #[tokio::test]
    async fn test_progress_reports_lengths() {
        let (tx, mut rx) = mpsc::channel(16);
        let text = process_with_progress(&CallContext::new(), stream_of(&["ab", "cde"], None), tx)
            .await
            .unwrap();
        assert_eq!(text, "abcde");
        assert_eq!(rx.recv().await, Some(2));
        assert_eq!(rx.recv().await, Some(5));
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttled_update_handler_drops_calls() {
        let (handler, calls) = recording_handler();
        let throttled = throttled_update_handler(handler, Duration::from_millis(100));

        throttled("a", "a").unwrap();
        throttled("ab", "b").unwrap();
        tokio::time::advance(Duration::from_millis(150)).await;
        throttled("abc", "c").unwrap();

        let accepted: Vec<String> = calls.lock().unwrap().iter().map(|c| c.0.clone()).collect();
        assert_eq!(accepted, vec!["a", "abc"]);
    }

    #[test]
    fn test_with_buffer_defaults() {
        assert_eq!(StreamProcessor::with_buffer(None, 0).buffer_size(), 10);
        assert_eq!(StreamProcessor::with_buffer(None, 32).buffer_size(), 32);
    }

    #[tokio::test]
    async fn test_merge_is_source_major() {
        let ctx = CallContext::new();
        let merged = merge_streams(
            &ctx,
            vec![response_of(&["a", "b"], None), response_of(&["c", "d"], None)],
        );

        let mut order = Vec::new();
        merged
            .for_each(|chunk| {
                order.push(chunk.to_string());
                Ok(())
            })
            .await
            .unwrap();
        assert_eq!(order, vec!["a", "b", "c", "d"]);
    }

    #[tokio::test]
    async fn test_merge_fails_fast() {
        let ctx = CallContext::new();
        let second = response_of(&["never"], None);
        let second_token = second.cancel_token();
        let merged = merge_streams(
            &ctx,
            vec![
                response_of(&["a"], Some(Error::streaming("source failed"))),
                second,
            ],
        );

        let incomplete = merged.collect().await.unwrap_err();
        assert_eq!(incomplete.text, "a");
        assert!(matches!(incomplete.error, Error::Streaming(_)));
        assert!(second_token.is_cancelled());
    }
}
