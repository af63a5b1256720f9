//! Stream a chat completion and print throttled progress.
//!
//! Reads `llm.toml` from the working directory when present, otherwise uses
//! defaults. The API key comes from `OPENAI_API_KEY` (a `.env` file works):
//!
//! ```bash
//! export OPENAI_API_KEY=your_api_key_here
//! RUST_LOG=llm_facade=debug cargo run --example stream_chat -- "Tell me a short story"
//! ```

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use llm_facade::{
    CallContext, Error, GenerateOption, HandlerError, LlmConfig, ProviderFactory,
    StreamProcessor, UpdateHandler,
};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Error> {
    // Load .env file if it exists
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let mut config = if std::path::Path::new("llm.toml").exists() {
        LlmConfig::from_toml_file("llm.toml")?
    } else {
        LlmConfig::default()
    };
    config.enabled = true;

    let factory = ProviderFactory::new(config);
    factory.validate_config()?;
    let client = factory.create_client()?;

    let prompt = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "Explain what a token bucket rate limiter is.".to_string());

    let ctx = CallContext::new();
    let cancel = ctx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
    });

    let handler: UpdateHandler = Arc::new(|accumulated: &str, _delta: &str| -> Result<(), HandlerError> {
        print!("\r{} chars received", accumulated.chars().count());
        std::io::stdout().flush()?;
        Ok(())
    });

    let stream = client.generate_stream(
        &ctx,
        &prompt,
        &[GenerateOption::system_prompt("You are a helpful assistant that responds concisely.")],
    );

    match StreamProcessor::new(Some(handler))
        .process_with_throttle(&ctx, stream, Duration::from_millis(250))
        .await
    {
        Ok(text) => println!("\n\n{text}"),
        Err(incomplete) => {
            let (text, error) = incomplete.into_parts();
            println!("\n\n{text}");
            eprintln!("stream ended early: {error}");
        }
    }

    Ok(())
}
