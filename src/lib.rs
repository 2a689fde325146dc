//! Question Engine - local language model pipeline for reading comprehension
//!
//! Generates one comprehension question from a passage of text and grades a
//! student's answer against that text. Each task renders a ChatML prompt,
//! runs it on a lazily loaded GGUF model, and extracts structured fields
//! from the free-form output.

// Public modules
pub mod config;
pub mod engine;
pub mod error;
pub mod model;
pub mod processing;
pub mod prompt;
pub mod types;
pub mod utils;

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

// Re-exports for public API
pub use config::{EngineConfig, ModelConfig, TaskConfig, WeightRef};
pub use engine::{EngineBuilder, EvaluationInput, QuestionEngine};
pub use error::{ConfigError, GenerationError, ModelError, PipelineError, PromptError, Stage};
pub use model::{ModelRegistry, ModelState};
pub use processing::{OutputParser, StreamingGenerator, TokenStream};
pub use prompt::PromptBuilder;
pub use types::{GenerationRequest, GenerationResult, ParsedEvaluation, ParsedQuestion, StopReason, TaskKind};
pub use utils::{setup_logging, LogConfig};
