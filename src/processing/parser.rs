//! Extraction of structured fields from free-form model output
//!
//! Parsing never fails. Output that drifts from the instructed format
//! degrades to the raw text for questions and to absent fields for
//! evaluations.

use regex::Regex;
use tracing::warn;

use crate::types::{ParsedEvaluation, ParsedQuestion};

/// Marker tokens of the three-line evaluation contract, in order
pub const EVALUATION_MARKERS: [&str; 3] = ["Note :", "Erreur :", "Correction :"];

lazy_static::lazy_static! {
    // `**Question :` with an optional space before the closing `**`
    static ref QUESTION_PATTERN: Regex =
        Regex::new(r"^\*\*Question : ?\*\*(?s)(.*)").expect("valid question pattern");
}

/// Output layout expected from the model for one task
pub trait OutputSchema {
    type Output;

    fn parse(text: &str) -> Self::Output;
}

/// Single field introduced by the `**Question :**` marker, falling back to the raw text
#[derive(Debug, Clone, Copy, Default)]
pub struct QuestionSchema;

/// Ordered `Note :` / `Erreur :` / `Correction :` fields
#[derive(Debug, Clone, Copy, Default)]
pub struct EvaluationSchema;

impl OutputSchema for QuestionSchema {
    type Output = ParsedQuestion;

    fn parse(text: &str) -> ParsedQuestion {
        let raw = text.trim();
        let question = match QUESTION_PATTERN.captures(raw).and_then(|c| c.get(1)) {
            Some(m) => m.as_str().trim().to_string(),
            None => {
                if !raw.is_empty() {
                    warn!(raw = %raw, "question marker missing, using raw output");
                }
                raw.to_string()
            }
        };
        ParsedQuestion {
            question,
            raw: raw.to_string(),
        }
    }
}

impl OutputSchema for EvaluationSchema {
    type Output = ParsedEvaluation;

    fn parse(text: &str) -> ParsedEvaluation {
        let raw = text.trim();
        let [note, erreur, correction] = extract_markers(raw, &EVALUATION_MARKERS);
        let parsed = ParsedEvaluation {
            note,
            erreur,
            correction,
            raw: raw.to_string(),
        };
        if parsed.is_degraded() && !raw.is_empty() {
            warn!(raw = %raw, "no evaluation marker found in output");
        }
        parsed
    }
}

/// Value following each marker, or `None` when the marker does not occur
///
/// Each marker is located at its first occurrence. A value runs until the
/// nearest other marker found after it, or to the end of the text, and is
/// trimmed.
pub fn extract_markers<const N: usize>(text: &str, markers: &[&str; N]) -> [Option<String>; N] {
    let positions: [Option<usize>; N] = std::array::from_fn(|i| text.find(markers[i]));

    std::array::from_fn(|i| {
        let start = positions[i]? + markers[i].len();
        let end = positions
            .iter()
            .enumerate()
            .filter(|&(j, _)| j != i)
            .filter_map(|(_, p)| *p)
            .filter(|&p| p >= start)
            .min()
            .unwrap_or(text.len());
        Some(text[start..end].trim().to_string())
    })
}

/// Parses raw output according to an [`OutputSchema`]
#[derive(Debug, Default, Clone, Copy)]
pub struct OutputParser;

impl OutputParser {
    pub fn parse<S: OutputSchema>(text: &str) -> S::Output {
        S::parse(text)
    }

    pub fn parse_question(text: &str) -> ParsedQuestion {
        Self::parse::<QuestionSchema>(text)
    }

    pub fn parse_evaluation(text: &str) -> ParsedEvaluation {
        Self::parse::<EvaluationSchema>(text)
    }
}
