//! OpenAI Chat Completions provider (also used for compatible endpoints).

pub mod client;
pub mod transport;
pub mod types;

pub use client::OpenAiProvider;
pub use transport::OpenAiTransport;
