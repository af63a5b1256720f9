use thiserror::Error;

/// Boxed error type returned by caller-supplied update handlers.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Errors that can occur when using the llm-facade library.
#[derive(Error, Debug)]
pub enum Error {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Provider {provider} is not available")]
    ProviderUnavailable { provider: String },

    #[error("Unknown provider '{name}', supported providers: openai")]
    UnknownProvider { name: String },

    #[error("Provider '{name}' is not implemented yet")]
    ProviderNotImplemented { name: String },

    #[error("API error ({error_type}): {message}")]
    Api {
        status: u16,
        error_type: String,
        message: String,
    },

    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Rate limiter wait failed: {0}")]
    RateLimitWait(#[source] Box<Error>),

    #[error("Malformed stream payload: {message}, raw data: {raw}")]
    StreamProtocol { message: String, raw: String },

    #[error("Streaming error: {0}")]
    Streaming(String),

    #[error("Response contained no choices")]
    EmptyResponse,

    #[error("Failed to parse JSON response: {source}, raw content: {raw}")]
    StructuredOutput {
        #[source]
        source: serde_json::Error,
        raw: String,
    },

    #[error("Template error: {0}")]
    Template(String),

    #[error("Update callback failed: {0}")]
    Callback(#[source] HandlerError),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Deadline exceeded")]
    DeadlineExceeded,
}

impl Error {
    pub fn config(message: impl Into<String>) -> Self {
        Error::Config(message.into())
    }

    pub fn streaming(message: impl Into<String>) -> Self {
        Error::Streaming(message.into())
    }

    pub fn template(message: impl Into<String>) -> Self {
        Error::Template(message.into())
    }

    pub fn unavailable(provider: impl Into<String>) -> Self {
        Error::ProviderUnavailable {
            provider: provider.into(),
        }
    }

    /// True for caller-initiated cancellation and expired deadlines,
    /// including when they surface through a rate-limiter wait.
    pub fn is_cancellation(&self) -> bool {
        match self {
            Error::Cancelled | Error::DeadlineExceeded => true,
            Error::RateLimitWait(inner) => inner.is_cancellation(),
            _ => false,
        }
    }
}

/// A stream that ended with an error after delivering some text.
///
/// Stream consumers never drop partial output: the text accumulated before
/// the failure travels with the error.
#[derive(Error, Debug)]
#[error("stream interrupted after {} bytes: {error}", text.len())]
pub struct Incomplete {
    pub text: String,
    #[source]
    pub error: Error,
}

impl Incomplete {
    pub fn new(text: impl Into<String>, error: Error) -> Self {
        Self {
            text: text.into(),
            error,
        }
    }

    /// Split into the partial text and the error.
    pub fn into_parts(self) -> (String, Error) {
        (self.text, self.error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let error = Error::unavailable("openai");
        assert!(error.to_string().contains("openai"));

        let config_error = Error::config("missing model");
        assert!(config_error.to_string().contains("Invalid configuration"));
    }

    #[test]
    fn test_cancellation_classification() {
        assert!(Error::Cancelled.is_cancellation());
        assert!(Error::DeadlineExceeded.is_cancellation());
        assert!(Error::RateLimitWait(Box::new(Error::Cancelled)).is_cancellation());
        assert!(!Error::EmptyResponse.is_cancellation());
    }

    #[test]
    fn test_incomplete_keeps_partial_text() {
        let incomplete = Incomplete::new("Hello", Error::Cancelled);
        assert!(incomplete.to_string().contains("5 bytes"));

        let (text, error) = incomplete.into_parts();
        assert_eq!(text, "Hello");
        assert!(matches!(error, Error::Cancelled));
    }
}
