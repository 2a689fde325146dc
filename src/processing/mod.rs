//! Processing module: streaming generation and output parsing

mod parser;
mod stream;

pub use parser::{
    extract_markers, EvaluationSchema, OutputParser, OutputSchema, QuestionSchema, EVALUATION_MARKERS,
};
pub use stream::{StreamingGenerator, TokenStream};
