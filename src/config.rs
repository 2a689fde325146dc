// Location: src/config.rs

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::types::{SamplingParams, TaskKind};

/// ChatML end-of-turn marker used by the Qwen instruct models
pub const IM_END: &str = "<|im_end|>";

pub const QUESTION_MODEL: &str = "question_generator";
pub const EVALUATION_MODEL: &str = "answer_evaluator";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Directory where downloaded weights are cached
    pub cache_dir: PathBuf,

    /// Models available to the registry
    pub models: Vec<ModelConfig>,

    /// Settings for question generation
    pub question: TaskConfig,

    /// Settings for answer evaluation
    pub evaluation: TaskConfig,

    /// Deadline for a single generation, in seconds
    #[serde(default)]
    pub request_timeout_secs: Option<u64>,

    #[serde(default)]
    pub logging: LogSettings,
}

/// Where a weight or tokenizer file comes from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WeightRef {
    /// File in a Hugging Face hub repository, cached by filename
    Hub { repo_id: String, filename: String },
    /// File already present on disk
    Local { path: PathBuf },
}

impl WeightRef {
    pub fn hub(repo_id: impl Into<String>, filename: impl Into<String>) -> Self {
        WeightRef::Hub {
            repo_id: repo_id.into(),
            filename: filename.into(),
        }
    }

    pub fn local(path: impl Into<PathBuf>) -> Self {
        WeightRef::Local { path: path.into() }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Registry key
    pub name: String,

    /// GGUF weights
    pub source: WeightRef,

    /// `tokenizer.json`; looked up next to the weights when absent
    #[serde(default)]
    pub tokenizer: Option<WeightRef>,

    /// Context window in tokens
    pub context_size: usize,

    /// Compute thread hint, passed to the backend in [`LoadSpec`](crate::model::LoadSpec)
    ///
    /// Advisory: the candle backend computes on the process-wide pool, sized
    /// by `RAYON_NUM_THREADS`, and only records this value.
    pub threads: usize,

    /// Layers to offload to the GPU; 0 keeps the model on the CPU
    #[serde(default)]
    pub gpu_layers: u32,

    #[serde(default)]
    pub description: String,
}

impl ModelConfig {
    pub fn new(name: impl Into<String>, source: WeightRef) -> Self {
        Self {
            name: name.into(),
            source,
            tokenizer: None,
            context_size: 10048,
            threads: default_threads(),
            gpu_layers: 0,
            description: String::new(),
        }
    }

    pub fn with_tokenizer(mut self, tokenizer: WeightRef) -> Self {
        self.tokenizer = Some(tokenizer);
        self
    }

    pub fn with_context_size(mut self, context_size: usize) -> Self {
        self.context_size = context_size;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskConfig {
    /// Name of the registered model serving this task
    pub model: String,

    /// Maximum number of tokens to generate
    pub max_tokens: usize,

    /// Temperature for sampling
    pub temperature: f64,

    /// Top-p sampling threshold
    pub top_p: f64,

    /// Stop sequences
    pub stop: Vec<String>,

    #[serde(default = "default_seed")]
    pub seed: u64,
}

impl TaskConfig {
    fn new(model: &str, max_tokens: usize) -> Self {
        Self {
            model: model.to_string(),
            max_tokens,
            temperature: 0.7,
            top_p: 0.95,
            stop: vec![IM_END.to_string()],
            seed: default_seed(),
        }
    }

    pub fn sampling(&self) -> SamplingParams {
        SamplingParams {
            temperature: self.temperature,
            top_p: self.top_p,
            seed: self.seed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogSettings {
    /// Default level when `RUST_LOG` is unset
    pub level: String,

    /// Append logs to this file instead of stdout
    #[serde(default)]
    pub file: Option<PathBuf>,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}

fn default_seed() -> u64 {
    SamplingParams::default().seed
}

fn default_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(2)
}

impl Default for EngineConfig {
    fn default() -> Self {
        let tokenizer = |repo: &str| WeightRef::hub(repo, "tokenizer.json");
        Self {
            cache_dir: PathBuf::from("./models"),
            models: vec![
                ModelConfig::new(
                    QUESTION_MODEL,
                    WeightRef::hub(
                        "zinec/finetuned-qwen-fr",
                        "finetuned-qwen2.5-0.5B_instruct_finetuned_fr.q8_0.gguf",
                    ),
                )
                .with_tokenizer(tokenizer("Qwen/Qwen2.5-0.5B-Instruct"))
                .with_description("Model for generating questions"),
                ModelConfig::new(
                    EVALUATION_MODEL,
                    WeightRef::hub(
                        "zinec/finetuned-qwen-fr",
                        "qwen2_5_1.5B_instruct_finetuned_fr.q8_0.gguf",
                    ),
                )
                .with_tokenizer(tokenizer("Qwen/Qwen2.5-1.5B-Instruct"))
                .with_description("Model for grading student answers"),
            ],
            question: TaskConfig::new(QUESTION_MODEL, 512),
            evaluation: TaskConfig::new(EVALUATION_MODEL, 300),
            request_timeout_secs: None,
            logging: LogSettings::default(),
        }
    }
}

impl EngineConfig {
    /// Read a JSON configuration file, then apply environment overrides
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: EngineConfig = serde_json::from_str(&contents)?;
        config.apply_env()?;
        Ok(config)
    }

    /// Override selected fields from `QE_*` environment variables
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Ok(dir) = std::env::var("QE_CACHE_DIR") {
            self.cache_dir = PathBuf::from(dir);
        }
        if let Ok(secs) = std::env::var("QE_REQUEST_TIMEOUT_SECS") {
            let secs = secs.parse::<u64>().map_err(|e| {
                ConfigError::invalid("QE_REQUEST_TIMEOUT_SECS", e.to_string())
            })?;
            self.request_timeout_secs = Some(secs);
        }
        if let Ok(level) = std::env::var("QE_LOG_LEVEL") {
            self.logging.level = level;
        }
        Ok(())
    }

    pub fn task(&self, task: TaskKind) -> &TaskConfig {
        match task {
            TaskKind::GenerateQuestion => &self.question,
            TaskKind::EvaluateAnswer => &self.evaluation,
        }
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_secs.map(Duration::from_secs)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.models.is_empty() {
            return Err(ConfigError::invalid("models", "at least one model must be configured"));
        }

        let mut names = HashSet::new();
        for model in &self.models {
            if model.name.is_empty() {
                return Err(ConfigError::invalid("models.name", "model name cannot be empty"));
            }
            if !names.insert(model.name.as_str()) {
                return Err(ConfigError::invalid(
                    "models.name",
                    format!("model '{}' is configured twice", model.name),
                ));
            }
            if model.context_size == 0 {
                return Err(ConfigError::invalid(
                    "context_size",
                    format!("context size of '{}' must be positive", model.name),
                ));
            }
        }

        if self.request_timeout_secs == Some(0) {
            return Err(ConfigError::invalid(
                "request_timeout_secs",
                "timeout must be positive; omit it to disable",
            ));
        }

        for (parameter, task) in [("question", &self.question), ("evaluation", &self.evaluation)] {
            if !names.contains(task.model.as_str()) {
                return Err(ConfigError::invalid(
                    format!("{parameter}.model"),
                    format!("unknown model '{}'", task.model),
                ));
            }
            if task.max_tokens == 0 {
                return Err(ConfigError::invalid(
                    format!("{parameter}.max_tokens"),
                    "token budget must be positive",
                ));
            }
            if task.temperature < 0.0 {
                return Err(ConfigError::invalid(
                    format!("{parameter}.temperature"),
                    "temperature cannot be negative",
                ));
            }
            if !(task.top_p > 0.0 && task.top_p <= 1.0) {
                return Err(ConfigError::invalid(
                    format!("{parameter}.top_p"),
                    "top_p must be in (0, 1]",
                ));
            }
        }

        Ok(())
    }
}
