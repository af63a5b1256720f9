use crate::{CallContext, Error, GenerateOption, TextStream};

/// A text-generation backend.
///
/// Streaming spawns a producer task and returns immediately; the returned
/// [`TextStream`] closes when the model finishes, on error, or when `ctx` is
/// cancelled. JSON generation returns the repaired JSON text so the trait
/// stays object-safe; decoding into a caller type happens on top of it.
#[async_trait::async_trait]
pub trait LlmProvider: Send + Sync + 'static {
    /// Stable provider identifier, e.g. `openai`.
    fn name(&self) -> &str;

    /// True when the provider has what it needs to make calls.
    fn is_available(&self) -> bool;

    /// Generate a complete reply.
    async fn generate(
        &self,
        ctx: &CallContext,
        prompt: &str,
        opts: &[GenerateOption],
    ) -> Result<String, Error>;

    /// Generate a reply as a stream of text fragments.
    fn generate_stream(&self, ctx: &CallContext, prompt: &str, opts: &[GenerateOption])
        -> TextStream;

    /// Generate a JSON object in JSON mode and return it cleaned up for
    /// decoding.
    async fn generate_json(
        &self,
        ctx: &CallContext,
        prompt: &str,
        opts: &[GenerateOption],
    ) -> Result<String, Error>;
}
