//! Provider-agnostic entry point for callers.

use std::sync::Arc;

use serde::de::DeserializeOwned;

use crate::{structured, CallContext, Error, GenerateOption, LlmProvider, TextStream};

/// Thin façade over one [`LlmProvider`].
///
/// Every call checks availability first and fails without touching the
/// network when the provider is not usable.
#[derive(Clone)]
pub struct LlmClient {
    provider: Arc<dyn LlmProvider>,
}

impl std::fmt::Debug for LlmClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlmClient")
            .field("provider", &self.provider.name())
            .finish()
    }
}

impl LlmClient {
    pub fn new(provider: Arc<dyn LlmProvider>) -> Self {
        tracing::info!(provider = provider.name(), "LLM client created");
        Self { provider }
    }

    pub fn provider(&self) -> &Arc<dyn LlmProvider> {
        &self.provider
    }

    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }

    pub fn is_available(&self) -> bool {
        self.provider.is_available()
    }

    fn ensure_available(&self) -> Result<(), Error> {
        if self.provider.is_available() {
            Ok(())
        } else {
            Err(Error::unavailable(self.provider.name()))
        }
    }

    /// Generate a complete reply.
    pub async fn generate(
        &self,
        ctx: &CallContext,
        prompt: &str,
        opts: &[GenerateOption],
    ) -> Result<String, Error> {
        self.ensure_available()?;
        self.provider.generate(ctx, prompt, opts).await
    }

    /// Stream a reply. An unavailable provider yields an already closed
    /// stream carrying the error.
    pub fn generate_stream(
        &self,
        ctx: &CallContext,
        prompt: &str,
        opts: &[GenerateOption],
    ) -> TextStream {
        match self.ensure_available() {
            Ok(()) => self.provider.generate_stream(ctx, prompt, opts),
            Err(e) => TextStream::failed(e),
        }
    }

    /// Generate JSON and decode it into `T`.
    pub async fn generate_structured<T: DeserializeOwned>(
        &self,
        ctx: &CallContext,
        prompt: &str,
        opts: &[GenerateOption],
    ) -> Result<T, Error> {
        self.ensure_available()?;
        let raw = self.provider.generate_json(ctx, prompt, opts).await?;
        structured::decode(&raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Canned provider that counts calls.
    struct StubProvider {
        available: bool,
        calls: AtomicUsize,
    }

    impl StubProvider {
        fn new(available: bool) -> Arc<Self> {
            Arc::new(Self {
                available,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait::async_trait]
    impl LlmProvider for StubProvider {
        fn name(&self) -> &str {
            "stub"
        }

        fn is_available(&self) -> bool {
            self.available
        }

        async fn generate(
            &self,
            _ctx: &CallContext,
            prompt: &str,
            _opts: &[GenerateOption],
        ) -> Result<String, Error> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(format!("echo: {prompt}"))
        }

        fn generate_stream(
            &self,
            ctx: &CallContext,
            prompt: &str,
            _opts: &[GenerateOption],
        ) -> TextStream {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let (sink, stream) = TextStream::channel(4);
            let ctx = ctx.clone();
            let words: Vec<String> = prompt.split(' ').map(str::to_string).collect();
            tokio::spawn(async move {
                for word in words {
                    if sink.send(&ctx, word).await.is_err() {
                        return;
                    }
                }
            });
            stream
        }

        async fn generate_json(
            &self,
            _ctx: &CallContext,
            _prompt: &str,
            _opts: &[GenerateOption],
        ) -> Result<String, Error> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(r#"{"category": "movie"}"#.to_string())
        }
    }

    #[derive(Debug, Deserialize)]
    struct Classification {
        category: String,
    }

    #[tokio::test]
    async fn test_delegates_when_available() {
        let stub = StubProvider::new(true);
        let client = LlmClient::new(stub.clone());
        let ctx = CallContext::new();

        assert_eq!(client.provider_name(), "stub");
        assert_eq!(client.generate(&ctx, "hi", &[]).await.unwrap(), "echo: hi");

        let mut stream = client.generate_stream(&ctx, "a b", &[]);
        assert_eq!(stream.recv().await.as_deref(), Some("a"));
        assert_eq!(stream.recv().await.as_deref(), Some("b"));
        assert!(stream.recv().await.is_none());

        let parsed: Classification = client.generate_structured(&ctx, "x", &[]).await.unwrap();
        assert_eq!(parsed.category, "movie");
        assert_eq!(stub.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_unavailable_short_circuits() {
        let stub = StubProvider::new(false);
        let client = LlmClient::new(stub.clone());
        let ctx = CallContext::new();

        let err = client.generate(&ctx, "hi", &[]).await.unwrap_err();
        assert!(matches!(err, Error::ProviderUnavailable { ref provider } if provider == "stub"));

        let mut stream = client.generate_stream(&ctx, "hi", &[]);
        assert!(stream.recv().await.is_none());
        assert!(matches!(
            stream.error().await,
            Some(Error::ProviderUnavailable { .. })
        ));

        let err = client
            .generate_structured::<Classification>(&ctx, "x", &[])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ProviderUnavailable { .. }));
        assert_eq!(stub.calls.load(Ordering::SeqCst), 0);
    }
}
