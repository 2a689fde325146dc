use anyhow::Result;
use clap::Parser;
use question_engine::{setup_logging, EngineConfig, EvaluationInput, LogConfig, QuestionEngine};
use std::path::PathBuf;
use tracing::{info, warn};

/// Grade a student's answer against a passage of text
#[derive(Parser, Debug)]
struct Args {
    /// File holding the source text
    text_file: PathBuf,

    /// The student's answer; empty means no answer was given
    #[arg(long, default_value = "")]
    answer: String,

    /// Question the student was answering
    #[arg(long)]
    question: Option<String>,

    /// Expected answer
    #[arg(long)]
    reference: Option<String>,

    /// JSON engine configuration
    #[arg(long, env = "QE_CONFIG")]
    config: Option<PathBuf>,
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

    let mut input = EvaluationInput::new(&text, &args.answer);
    if let Some(question) = &args.question {
        input = input.with_question(question);
    }
    if let Some(reference) = &args.reference {
        input = input.with_reference_answer(reference);
    }

    let evaluation = engine.evaluate(input).await?;
    if evaluation.is_degraded() {
        warn!("model output did not follow the evaluation format");
        println!("{}", evaluation.raw);
        return Ok(());
    }

    let show = |field: &Option<String>| field.clone().unwrap_or_else(|| "-".to_string());
    println!("Note : {}", show(&evaluation.note));
    println!("Erreur : {}", show(&evaluation.erreur));
    println!("Correction : {}", show(&evaluation.correction));

    Ok(())
}
