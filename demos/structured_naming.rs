//! Infer media metadata from a file name with JSON-mode structured output.
//!
//! ```bash
//! export OPENAI_API_KEY=your_api_key_here
//! cargo run --example structured_naming -- "The.Expanse.S01E02.1080p.WEB-DL.mkv"
//! ```

use llm_facade::prompt::{FileNamingData, FILE_NAMING};
use llm_facade::{CallContext, Error, GenerateOption, LlmConfig, PromptBuilder, ProviderFactory};
use serde::Deserialize;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Deserialize)]
struct FileNaming {
    media_type: String,
    title: String,
    title_cn: Option<String>,
    year: Option<i32>,
    season: Option<i32>,
    episode: Option<i32>,
    confidence: f64,
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let file_name = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "Breaking.Bad.S05E14.Ozymandias.720p.BluRay.x264.mkv".to_string());

    let config = LlmConfig {
        enabled: true,
        ..Default::default()
    };
    let client = ProviderFactory::new(config).create_client()?;

    let prompt = PromptBuilder::new().build(
        FILE_NAMING,
        &FileNamingData {
            file_name,
            file_path: None,
        },
    )?;

    let ctx = CallContext::new();
    let naming: FileNaming = client
        .generate_structured(&ctx, &prompt, &[GenerateOption::temperature(0.1)])
        .await?;

    println!("{} ({})", naming.title, naming.media_type);
    if let Some(title_cn) = &naming.title_cn {
        println!("  chinese title: {title_cn}");
    }
    if let Some(year) = naming.year {
        println!("  year: {year}");
    }
    if let (Some(season), Some(episode)) = (naming.season, naming.episode) {
        println!("  season {season}, episode {episode}");
    }
    println!("  confidence: {:.2}", naming.confidence);

    Ok(())
}
