use std::sync::Arc;

use serde::de::DeserializeOwned;

use super::transport::OpenAiTransport;
use super::types::{ChatRequest, ResponseFormat};
use crate::provider::LlmProvider;
use crate::response::{TextSink, TextStream, DEFAULT_BUFFER_SIZE};
use crate::sse_stream::spawn_chunk_reader;
use crate::structured;
use crate::types::{ChatMessage, GenerateOption, GenerateOptions, OpenAiConfig, OpenAiSettings};
use crate::{CallContext, Error};

pub const PROVIDER_NAME: &str = "openai";

/// OpenAI provider implementation.
#[derive(Debug, Clone)]
pub struct OpenAiProvider {
    transport: Arc<OpenAiTransport>,
}

impl OpenAiProvider {
    /// Create a provider from resolved settings.
    pub fn new(settings: OpenAiSettings) -> Result<Self, Error> {
        let settings = settings.validate()?;
        tracing::info!(
            base_url = %settings.base_url,
            model = %settings.model,
            qps = settings.qps,
            "creating OpenAI provider"
        );
        Ok(Self::with_transport(OpenAiTransport::new(settings)?))
    }

    /// Create a provider from file configuration, honouring `OPENAI_API_KEY`.
    pub fn from_config(config: &OpenAiConfig) -> Result<Self, Error> {
        Self::new(OpenAiSettings::from_config(config)?)
    }

    pub fn with_transport(transport: OpenAiTransport) -> Self {
        Self {
            transport: Arc::new(transport),
        }
    }

    pub fn settings(&self) -> &OpenAiSettings {
        self.transport.settings()
    }

    pub fn transport(&self) -> &OpenAiTransport {
        &self.transport
    }

    /// Change the request rate for subsequent calls.
    pub fn set_qps(&self, qps: i64) {
        self.transport.set_qps(qps);
    }

    /// Options every call starts from before caller overrides are applied.
    pub fn defaults(&self) -> GenerateOptions {
        let settings = self.settings();
        GenerateOptions {
            model: settings.model.clone(),
            temperature: settings.temperature,
            max_tokens: settings.max_tokens,
            ..Default::default()
        }
    }

    /// System prompt, then prior turns, then the user prompt.
    pub fn build_messages(prompt: &str, options: &GenerateOptions) -> Vec<ChatMessage> {
        let mut messages = Vec::with_capacity(options.messages.len() + 2);
        if let Some(system) = &options.system_prompt {
            messages.push(ChatMessage::system(system.clone()));
        }
        messages.extend(options.messages.iter().cloned());
        messages.push(ChatMessage::user(prompt));
        messages
    }

    fn build_request(messages: Vec<ChatMessage>, options: &GenerateOptions) -> ChatRequest {
        let mut request = ChatRequest::new(options.model.clone(), messages);
        request.temperature = Some(options.temperature);
        request.max_tokens = Some(options.max_tokens);
        if options.json_mode {
            request.response_format = Some(ResponseFormat::json_object());
        }
        request
    }

    /// Generate JSON and decode it into `T`.
    pub async fn generate_structured<T: DeserializeOwned>(
        &self,
        ctx: &CallContext,
        prompt: &str,
        opts: &[GenerateOption],
    ) -> Result<T, Error> {
        let raw = self.generate_json(ctx, prompt, opts).await?;
        structured::decode(&raw)
    }
}

/// Forward content deltas from the SSE reader into `sink` until the model
/// reports a finish reason or the body ends.
async fn forward_stream(
    transport: &OpenAiTransport,
    ctx: &CallContext,
    request: ChatRequest,
    sink: &TextSink,
) -> Result<(), Error> {
    let response = transport.chat_completion_stream(ctx, request).await?;

    let reader_ctx = ctx.child();
    // Stops the reader on every exit path.
    let _reader_guard = reader_ctx.token().clone().drop_guard();
    let mut chunks = spawn_chunk_reader(reader_ctx, response.bytes_stream());

    loop {
        let chunk = tokio::select! {
            biased;
            err = ctx.done() => return Err(err),
            chunk = chunks.chunks.recv() => chunk,
        };
        let Some(chunk) = chunk else { break };

        let content = chunk.content();
        if !content.is_empty() {
            sink.send(ctx, content.to_string()).await?;
        }
        if chunk.is_finished() {
            return Ok(());
        }
    }

    match chunks.errors.recv().await {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

#[async_trait::async_trait]
impl LlmProvider for OpenAiProvider {
    fn name(&self) -> &str {
        PROVIDER_NAME
    }

    fn is_available(&self) -> bool {
        !self.settings().api_key.is_empty()
    }

    async fn generate(
        &self,
        ctx: &CallContext,
        prompt: &str,
        opts: &[GenerateOption],
    ) -> Result<String, Error> {
        let options = self.defaults().apply(opts);
        let messages = Self::build_messages(prompt, &options);
        let request = Self::build_request(messages, &options);

        let response = self.transport.chat_completion(ctx, request).await?;
        response
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content)
            .ok_or(Error::EmptyResponse)
    }

    fn generate_stream(
        &self,
        ctx: &CallContext,
        prompt: &str,
        opts: &[GenerateOption],
    ) -> TextStream {
        let options = self.defaults().apply(opts);
        let messages = Self::build_messages(prompt, &options);
        let request = Self::build_request(messages, &options);

        let (sink, stream) = TextStream::channel(DEFAULT_BUFFER_SIZE);
        let transport = Arc::clone(&self.transport);
        let ctx = ctx.clone();

        tokio::spawn(async move {
            if let Err(e) = forward_stream(&transport, &ctx, request, &sink).await {
                let e = if e.is_cancellation() {
                    tracing::debug!(error = %e, "OpenAI stream cancelled");
                    // Report the context's own error, not where it was observed.
                    ctx.err().unwrap_or(e)
                } else {
                    tracing::warn!(error = %e, "OpenAI stream failed");
                    e
                };
                sink.fail(e);
            }
        });

        stream
    }

    async fn generate_json(
        &self,
        ctx: &CallContext,
        prompt: &str,
        opts: &[GenerateOption],
    ) -> Result<String, Error> {
        let mut options = self.defaults().apply(opts);
        options.json_mode = true;

        let content = structured::json_prompt(prompt, options.system_prompt.as_deref());
        let mut messages = options.messages.clone();
        messages.push(ChatMessage::user(content.as_str()));
        let request = Self::build_request(messages, &options);

        tracing::debug!(
            model = %request.model,
            temperature = options.temperature,
            max_tokens = options.max_tokens,
            messages = request.messages.len(),
            "OpenAI structured request"
        );
        tracing::debug!(prompt = %content, "OpenAI request prompt");

        let response = match self.transport.chat_completion(ctx, request).await {
            Ok(response) => response,
            Err(e) => {
                tracing::error!(model = %options.model, error = %e, "OpenAI structured generation failed");
                return Err(e);
            }
        };

        let model = response.model;
        let usage = response.usage;
        let Some(choice) = response.choices.into_iter().next() else {
            tracing::error!(%model, "OpenAI response has no choices");
            return Err(Error::EmptyResponse);
        };

        tracing::info!(
            %model,
            finish_reason = ?choice.finish_reason,
            prompt_tokens = usage.prompt_tokens,
            completion_tokens = usage.completion_tokens,
            total_tokens = usage.total_tokens,
            "OpenAI structured response received"
        );
        tracing::debug!(content = %choice.message.content, "OpenAI raw response content");

        let cleaned = structured::repair(&choice.message.content);
        tracing::debug!(content = %cleaned, "OpenAI cleaned JSON content");
        Ok(cleaned)
    }
}
