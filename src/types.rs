//! Common type definitions used throughout the engine

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// The two tasks the engine knows how to prompt for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    GenerateQuestion,
    EvaluateAnswer,
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskKind::GenerateQuestion => f.write_str("generate_question"),
            TaskKind::EvaluateAnswer => f.write_str("evaluate_answer"),
        }
    }
}

/// Sampling parameters forwarded to the backend
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SamplingParams {
    /// Temperature for sampling; 0 selects greedy decoding
    pub temperature: f64,
    /// Nucleus sampling threshold
    pub top_p: f64,
    /// Seed for the sampler
    pub seed: u64,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            top_p: 0.95,
            seed: 299792458,
        }
    }
}

/// A single generation call
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    /// Fully rendered prompt
    pub prompt: String,
    /// Maximum number of tokens to generate
    pub max_tokens: usize,
    /// Literal sequences that end generation; excluded from the output
    pub stop: Vec<String>,
    pub sampling: SamplingParams,
}

/// Why a generation stream ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// A configured stop sequence was produced
    StopSequence,
    /// The backend finished on its own (end-of-sequence token)
    EndOfStream,
    /// `max_tokens` was reached
    TokenBudget,
    /// The consumer stopped iterating before the stream ended
    Abandoned,
}

/// Aggregated output of a generation stream
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationResult {
    /// Concatenation of every fragment yielded
    pub text: String,
    pub stop_reason: StopReason,
    /// Tokens produced by the backend
    pub tokens: usize,
    pub elapsed: Duration,
}

impl GenerationResult {
    /// Whether the model stopped by itself rather than running out of budget
    pub fn hit_stop(&self) -> bool {
        matches!(
            self.stop_reason,
            StopReason::StopSequence | StopReason::EndOfStream
        )
    }
}

/// Question extracted from model output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedQuestion {
    #[serde(rename = "Question")]
    pub question: String,
    /// Trimmed model output the question was taken from
    pub raw: String,
}

impl ParsedQuestion {
    /// The question with a repeated leading `Question :` label removed
    pub fn cleaned(&self) -> &str {
        match QUESTION_LABEL.find(&self.question) {
            Some(m) => self.question[m.end()..].trim(),
            None => &self.question,
        }
    }
}

lazy_static::lazy_static! {
    static ref QUESTION_LABEL: regex::Regex =
        regex::Regex::new(r"^[Qq]uestion\s*:\s*").expect("valid question label pattern");
}

/// Grading extracted from model output; each field is `None` when its marker was absent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedEvaluation {
    /// Score indicator, e.g. `7/10`
    pub note: Option<String>,
    /// What was wrong in the answer
    pub erreur: Option<String>,
    /// Corrected answer
    pub correction: Option<String>,
    pub raw: String,
}

impl ParsedEvaluation {
    /// True when no marker at all was recognised
    pub fn is_degraded(&self) -> bool {
        self.note.is_none() && self.erreur.is_none() && self.correction.is_none()
    }
}
