use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::GenerationError;
use crate::types::GenerationRequest;

/// A piece of decoded output and the number of tokens it covers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    pub text: String,
    pub tokens: usize,
}

impl Fragment {
    pub fn new(text: impl Into<String>, tokens: usize) -> Self {
        Self {
            text: text.into(),
            tokens,
        }
    }
}

/// Lazy, finite sequence of fragments produced by one inference call
pub type FragmentStream = BoxStream<'static, anyhow::Result<Fragment>>;

/// Everything a backend needs to instantiate a model
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadSpec {
    pub name: String,
    pub weights: PathBuf,
    pub tokenizer: Option<PathBuf>,
    pub context_size: usize,
    /// Thread hint; backends may treat it as advisory
    pub threads: usize,
    pub gpu_layers: u32,
}

/// Loads model files into runnable instances
#[async_trait]
pub trait InferenceBackend: Send + Sync {
    fn name(&self) -> &str;

    async fn load(&self, spec: LoadSpec) -> anyhow::Result<Arc<dyn InferenceModel>>;
}

/// A loaded model that can be prompted
///
/// Implementations may assume calls are serialized per instance; the
/// registry guarantees it.
pub trait InferenceModel: Send + Sync {
    /// Start generating for `request`. The returned stream yields fragments
    /// until the model emits end-of-sequence or `request.max_tokens` tokens
    /// have been produced. Dropping the stream stops generation.
    fn infer(&self, request: GenerationRequest) -> Result<FragmentStream, GenerationError>;
}
