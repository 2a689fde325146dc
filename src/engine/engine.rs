use std::sync::Arc;

use tracing::{debug, info};

use crate::{
    config::EngineConfig,
    error::{ModelError, PipelineError, Stage, StageError},
    model::{ModelInstance, ModelRegistry},
    processing::{OutputParser, StreamingGenerator, TokenStream},
    prompt::{PromptBuilder, Slots},
    types::{GenerationRequest, GenerationResult, ParsedEvaluation, ParsedQuestion, TaskKind},
};

use super::builder::EngineBuilder;

/// Inputs for grading a student's answer
#[derive(Debug, Clone, Copy, Default)]
pub struct EvaluationInput<'a> {
    /// Source text the question was asked about
    pub text: &'a str,
    pub student_answer: &'a str,
    /// Question the student was answering, if known
    pub question: Option<&'a str>,
    /// Expected answer, if known
    pub reference_answer: Option<&'a str>,
}

impl<'a> EvaluationInput<'a> {
    pub fn new(text: &'a str, student_answer: &'a str) -> Self {
        Self {
            text,
            student_answer,
            question: None,
            reference_answer: None,
        }
    }

    pub fn with_question(mut self, question: &'a str) -> Self {
        self.question = Some(question);
        self
    }

    pub fn with_reference_answer(mut self, answer: &'a str) -> Self {
        self.reference_answer = Some(answer);
        self
    }

    fn slots(&self) -> Slots<'a> {
        Slots {
            text: self.text,
            focus: None,
            student_answer: Some(self.student_answer),
            question: self.question,
            reference_answer: self.reference_answer,
        }
    }
}

/// Main entry point: prompt, generate and parse for each task
pub struct QuestionEngine {
    pub(super) config: Arc<EngineConfig>,
    pub(super) registry: Arc<ModelRegistry>,
}

impl QuestionEngine {
    /// Create a new engine builder
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.registry
    }

    pub async fn ensure_loaded(&self, model: &str) -> Result<ModelInstance, ModelError> {
        self.registry.ensure_loaded(model).await
    }

    /// Generate one question about `text`, centred on `focus` when it is non-empty
    pub async fn generate_question(&self, text: &str, focus: &str) -> Result<ParsedQuestion, PipelineError> {
        let slots = Slots::new(text).with_focus(focus);
        let result = self.run(TaskKind::GenerateQuestion, &slots).await?;
        Ok(OutputParser::parse_question(&result.text))
    }

    /// Fragment stream of a question generation, for callers forwarding tokens live
    ///
    /// The request timeout is not applied; the caller decides when to stop.
    pub async fn stream_question(&self, text: &str, focus: &str) -> Result<TokenStream, PipelineError> {
        let task = TaskKind::GenerateQuestion;
        let slots = Slots::new(text).with_focus(focus);
        let request = self.request(task, &slots)?;
        let instance = self.instance(task).await?;
        StreamingGenerator::generate(&instance, request)
            .await
            .map_err(|e| PipelineError::new(task, Stage::Generate, e))
    }

    /// Grade `student_answer` against `text`
    pub async fn evaluate_answer(&self, text: &str, student_answer: &str) -> Result<ParsedEvaluation, PipelineError> {
        self.evaluate(EvaluationInput::new(text, student_answer)).await
    }

    /// Grade an answer with optional question and reference answer context
    pub async fn evaluate(&self, input: EvaluationInput<'_>) -> Result<ParsedEvaluation, PipelineError> {
        let result = self.run(TaskKind::EvaluateAnswer, &input.slots()).await?;
        Ok(OutputParser::parse_evaluation(&result.text))
    }

    fn request(&self, task: TaskKind, slots: &Slots<'_>) -> Result<GenerationRequest, PipelineError> {
        let prompt = PromptBuilder::build(task, slots).map_err(|e| PipelineError::new(task, Stage::Prompt, e))?;
        let settings = self.config.task(task);
        Ok(GenerationRequest {
            prompt,
            max_tokens: settings.max_tokens,
            stop: settings.stop.clone(),
            sampling: settings.sampling(),
        })
    }

    async fn instance(&self, task: TaskKind) -> Result<ModelInstance, PipelineError> {
        let model = &self.config.task(task).model;
        self.registry
            .ensure_loaded(model)
            .await
            .map_err(|e| PipelineError::new(task, Stage::Load, e))
    }

    async fn run(&self, task: TaskKind, slots: &Slots<'_>) -> Result<GenerationResult, PipelineError> {
        // Prompt first: invalid input must not trigger a download
        let request = self.request(task, slots)?;
        let instance = self.instance(task).await?;

        info!(%task, model = %instance.name(), "running task");
        let generation = async {
            StreamingGenerator::generate(&instance, request)
                .await?
                .collect_result()
                .await
        };

        let result = match self.config.request_timeout() {
            Some(limit) => tokio::time::timeout(limit, generation)
                .await
                .map_err(|_| PipelineError::new(task, Stage::Timeout, StageError::Timeout(limit)))?,
            None => generation.await,
        }
        .map_err(|e| PipelineError::new(task, Stage::Generate, e))?;

        debug!(%task, tokens = result.tokens, stop_reason = ?result.stop_reason, "task generation finished");
        Ok(result)
    }
}
