use anyhow::Result;
use clap::Parser;
use futures::StreamExt;
use question_engine::{setup_logging, EngineConfig, LogConfig, OutputParser, QuestionEngine};
use std::io::Write;
use std::path::PathBuf;
use tracing::info;

/// Generate one comprehension question from a passage of text
#[derive(Parser, Debug)]
struct Args {
    /// File holding the source text
    text_file: PathBuf,

    /// Part of the text the question should target
    #[arg(long, default_value = "")]
    focus: String,

    /// JSON engine configuration
    #[arg(long, env = "QE_CONFIG")]
    config: Option<PathBuf>,

    /// Print fragments as they are generated
    #[arg(long)]
    stream: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => EngineConfig::from_file(path)?,
        None => {
            let mut config = EngineConfig::default();
            config.apply_env()?;
            config
        }
    };
    setup_logging(LogConfig::from_settings(&config.logging)?)?;

    let text = std::fs::read_to_string(&args.text_file)?;

    info!("Initializing engine...");
    let engine = QuestionEngine::builder().with_config(config).build().await?;

    if args.stream {
        let mut stream = engine.stream_question(&text, &args.focus).await?;
        while let Some(fragment) = stream.next().await {
            print!("{}", fragment?);
            std::io::stdout().flush()?;
        }
        println!();

        let parsed = OutputParser::parse_question(stream.text());
        println!("Question: {}", parsed.cleaned());
    } else {
        let parsed = engine.generate_question(&text, &args.focus).await?;
        println!("{}", parsed.cleaned());
    }

    Ok(())
}
