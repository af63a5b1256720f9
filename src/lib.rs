//! A provider-agnostic client for streaming LLM chat completions.
//!
//! The library talks to OpenAI-compatible Chat Completions endpoints with
//! rate limiting, cancellation, Server-Sent Events streaming and JSON-mode
//! structured output. Stream consumers in [`processor`] turn token streams
//! into throttled or batched progress updates, and [`prompt`] provides the
//! templates used to build requests.

pub mod client;
pub mod context;
pub mod error;
pub mod factory;
pub mod processor;
pub mod prompt;
pub mod provider;
pub mod providers;
pub mod rate_limit;
pub mod response;
pub mod sse_stream;
pub mod structured;
pub mod types;

// Re-export core types for easy usage
pub use client::LlmClient;
pub use context::CallContext;
pub use error::{Error, HandlerError, Incomplete};
pub use factory::{ProviderFactory, ProviderType};
pub use processor::{
    merge_streams, process_with_progress, simple_process, throttled_update_handler,
    StreamProcessor, UpdateHandler,
};
pub use prompt::PromptBuilder;
pub use provider::LlmProvider;
pub use providers::*;
pub use rate_limit::RateLimiter;
pub use response::{StreamBuffer, StreamResponse, TextSink, TextStream};
pub use types::*;
