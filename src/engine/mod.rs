//! Engine module providing the task-level interface: prompt, generate, parse

mod builder;
mod engine;

pub use builder::EngineBuilder;
pub use engine::{EvaluationInput, QuestionEngine};
