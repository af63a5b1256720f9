//! HTTP transport for the Chat Completions endpoint.

use std::sync::Arc;
use std::time::Instant;

use reqwest::{Client, RequestBuilder, Response};

use super::types::{ChatRequest, ChatResponse, ErrorResponse};
use crate::rate_limit::RateLimiter;
use crate::types::OpenAiSettings;
use crate::{CallContext, Error};

/// Rate-limited client for `{base_url}/chat/completions`.
///
/// The blocking path is bounded by the configured timeout unless the caller
/// already set a deadline. Streaming responses are bounded only by the
/// caller's context.
#[derive(Debug, Clone)]
pub struct OpenAiTransport {
    http: Client,
    settings: OpenAiSettings,
    limiter: Arc<RateLimiter>,
}

impl OpenAiTransport {
    pub fn new(settings: OpenAiSettings) -> Result<Self, Error> {
        let limiter = Arc::new(RateLimiter::new(settings.qps));
        Self::with_limiter(settings, limiter)
    }

    /// Share a limiter between several transports.
    pub fn with_limiter(settings: OpenAiSettings, limiter: Arc<RateLimiter>) -> Result<Self, Error> {
        // No client-wide timeout: it would also cut off long streams.
        let http = Client::builder().build()?;
        Ok(Self {
            http,
            settings,
            limiter,
        })
    }

    pub fn settings(&self) -> &OpenAiSettings {
        &self.settings
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// Change the request rate for subsequent calls.
    pub fn set_qps(&self, qps: i64) {
        self.limiter.set_qps(qps);
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/chat/completions",
            self.settings.base_url.trim_end_matches('/')
        )
    }

    fn post(&self, request: &ChatRequest) -> RequestBuilder {
        self.http
            .post(self.endpoint())
            .header("Authorization", format!("Bearer {}", self.settings.api_key))
            .header("Content-Type", "application/json")
            .json(request)
    }

    async fn acquire(&self, ctx: &CallContext) -> Result<(), Error> {
        self.limiter
            .wait(ctx)
            .await
            .map_err(|e| Error::RateLimitWait(Box::new(e)))
    }

    /// Send a non-streaming completion request.
    pub async fn chat_completion(
        &self,
        ctx: &CallContext,
        mut request: ChatRequest,
    ) -> Result<ChatResponse, Error> {
        self.acquire(ctx).await?;
        request.stream = false;

        let scoped = match ctx.deadline() {
            Some(_) => ctx.clone(),
            None => ctx.with_timeout(self.settings.timeout),
        };

        tracing::debug!(
            model = %request.model,
            messages = request.messages.len(),
            "sending chat completion request"
        );
        let started = Instant::now();

        let parsed = scoped
            .run(async {
                let response = check_status(self.post(&request).send().await?).await?;
                let body = response.bytes().await?;
                Ok::<_, Error>(serde_json::from_slice::<ChatResponse>(&body)?)
            })
            .await?;

        tracing::debug!(
            model = %parsed.model,
            choices = parsed.choices.len(),
            total_tokens = parsed.usage.total_tokens,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "chat completion finished"
        );
        Ok(parsed)
    }

    /// Open a streaming completion request and return the raw SSE response.
    pub async fn chat_completion_stream(
        &self,
        ctx: &CallContext,
        mut request: ChatRequest,
    ) -> Result<Response, Error> {
        self.acquire(ctx).await?;
        request.stream = true;

        tracing::debug!(
            model = %request.model,
            messages = request.messages.len(),
            "opening chat completion stream"
        );

        ctx.run(async {
            let response = self
                .post(&request)
                .header("Accept", "text/event-stream")
                .send()
                .await?;
            check_status(response).await
        })
        .await
    }
}

/// Pass successful responses through, turn anything else into an error.
async fn check_status(response: Response) -> Result<Response, Error> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await?;
    tracing::warn!(status = status.as_u16(), "chat completion request rejected");
    Err(decode_error(status.as_u16(), body))
}

/// Prefer the structured `{"error": {...}}` body; fall back to the raw text.
pub(crate) fn decode_error(status: u16, body: String) -> Error {
    match serde_json::from_str::<ErrorResponse>(&body) {
        Ok(parsed) if !parsed.error.message.is_empty() => Error::Api {
            status,
            error_type: parsed.error.r#type,
            message: parsed.error.message,
        },
        _ => Error::Status { status, body },
    }
}
