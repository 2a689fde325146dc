//! Error taxonomy for the loading, prompting and generation stages

use std::fmt;
use std::time::Duration;

use crate::types::TaskKind;

/// Result alias for registry operations
pub type Result<T, E = ModelError> = std::result::Result<T, E>;

/// Errors raised by the model registry
#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("no model registered under '{0}'")]
    UnknownModel(String),

    #[error("model '{0}' is loaded; pass force to replace it")]
    DuplicateName(String),

    #[error("failed to load model '{name}': {source:#}")]
    Load {
        name: String,
        #[source]
        source: anyhow::Error,
    },
}

/// Required prompt input was missing
#[derive(Debug, thiserror::Error)]
pub enum PromptError {
    #[error("{task} prompt requires a non-empty '{slot}'")]
    InvalidSlot { task: TaskKind, slot: &'static str },
}

/// Errors surfaced while consuming a generation stream
#[derive(Debug, thiserror::Error)]
pub enum GenerationError {
    #[error("inference backend failed: {0:#}")]
    Backend(#[source] anyhow::Error),

    #[error("prompt is {prompt_tokens} tokens but the context window holds {context_size}")]
    ContextOverflow {
        prompt_tokens: usize,
        context_size: usize,
    },

    #[error("model '{0}' was unloaded while a generation was waiting")]
    Cancelled(String),
}

/// Invalid or unreadable configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("configuration error for {parameter}: {message}")]
    Invalid { parameter: String, message: String },

    #[error("failed to read configuration: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("failed to install log subscriber: {0}")]
    Logging(String),
}

impl ConfigError {
    pub(crate) fn invalid(parameter: impl Into<String>, message: impl Into<String>) -> Self {
        ConfigError::Invalid {
            parameter: parameter.into(),
            message: message.into(),
        }
    }
}

/// Pipeline stage at which a task failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Prompt,
    Load,
    Generate,
    Timeout,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Prompt => "prompt",
            Stage::Load => "load",
            Stage::Generate => "generate",
            Stage::Timeout => "timeout",
        };
        f.write_str(name)
    }
}

/// Cause carried by a [`PipelineError`]
#[derive(Debug, thiserror::Error)]
pub enum StageError {
    #[error(transparent)]
    Model(#[from] ModelError),

    #[error(transparent)]
    Prompt(#[from] PromptError),

    #[error(transparent)]
    Generation(#[from] GenerationError),

    #[error("generation did not finish within {0:?}")]
    Timeout(Duration),
}

/// Task-level failure returned by the engine façade
#[derive(Debug, thiserror::Error)]
#[error("{task} failed at {stage} stage: {source}")]
pub struct PipelineError {
    pub task: TaskKind,
    pub stage: Stage,
    #[source]
    pub source: StageError,
}

impl PipelineError {
    pub(crate) fn new(task: TaskKind, stage: Stage, source: impl Into<StageError>) -> Self {
        Self {
            task,
            stage,
            source: source.into(),
        }
    }

    /// The model could not be made ready; report as "service unavailable"
    pub fn is_unavailable(&self) -> bool {
        matches!(self.source, StageError::Model(_))
    }

    /// The request itself was invalid; retrying it will not help
    pub fn is_caller_fault(&self) -> bool {
        matches!(self.source, StageError::Prompt(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = PipelineError::new(
            TaskKind::GenerateQuestion,
            Stage::Prompt,
            PromptError::InvalidSlot {
                task: TaskKind::GenerateQuestion,
                slot: "text",
            },
        );
        assert_eq!(
            error.to_string(),
            "generate_question failed at prompt stage: generate_question prompt requires a non-empty 'text'"
        );
    }

    #[test]
    fn test_error_classification() {
        let load = PipelineError::new(
            TaskKind::EvaluateAnswer,
            Stage::Load,
            ModelError::Load {
                name: "answer_evaluator".to_string(),
                source: anyhow::anyhow!("disk full"),
            },
        );
        assert!(load.is_unavailable());
        assert!(!load.is_caller_fault());

        let timeout = PipelineError::new(
            TaskKind::EvaluateAnswer,
            Stage::Timeout,
            StageError::Timeout(Duration::from_secs(3)),
        );
        assert!(!timeout.is_unavailable());
        assert!(!timeout.is_caller_fault());
    }

    #[test]
    fn test_load_error_keeps_cause() {
        use std::error::Error as _;

        let error = ModelError::Load {
            name: "question_generator".to_string(),
            source: anyhow::anyhow!("connection reset"),
        };
        assert!(error.to_string().contains("connection reset"));
        assert!(error.source().is_some());
    }
}
