//! Quantized Qwen2 GGUF backend built on candle
//!
//! Weights are read with `gguf_file`, decoding runs on a blocking thread and
//! fragments travel to the async consumer through a bounded channel. The
//! thread stops as soon as the receiving stream is dropped.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use candle_core::quantized::gguf_file;
use candle_core::{Device, Tensor};
use candle_transformers::generation::LogitsProcessor;
use candle_transformers::models::quantized_qwen2::ModelWeights;
use futures::StreamExt;
use parking_lot::Mutex;
use tokenizers::Tokenizer;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::GenerationError;
use crate::types::GenerationRequest;

use super::backend::{Fragment, FragmentStream, InferenceBackend, InferenceModel, LoadSpec};

const EOS_CANDIDATES: [&str; 3] = ["<|im_end|>", "<|endoftext|>", "</s>"];

/// Candle backend settings shared by every model it loads
#[derive(Debug, Clone)]
pub struct CandleConfig {
    /// Repeat penalty; 1.0 disables it
    pub repeat_penalty: f32,
    /// Tokens considered by the repeat penalty
    pub repeat_last_n: usize,
    /// Capacity of the fragment channel
    pub channel_capacity: usize,
}

impl Default for CandleConfig {
    fn default() -> Self {
        Self {
            repeat_penalty: 1.1,
            repeat_last_n: 64,
            channel_capacity: 32,
        }
    }
}

#[derive(Debug, Default)]
pub struct CandleBackend {
    config: CandleConfig,
}

impl CandleBackend {
    pub fn new(config: CandleConfig) -> Self {
        Self { config }
    }

    fn select_device(gpu_layers: u32) -> anyhow::Result<Device> {
        if gpu_layers == 0 {
            return Ok(Device::Cpu);
        }
        // candle offloads whole models; any positive layer count means GPU
        let device = Device::cuda_if_available(0)?;
        if device.is_cpu() {
            warn!(gpu_layers, "GPU offload requested but no CUDA device is available");
        }
        Ok(device)
    }
}

fn resolve_tokenizer_path(spec: &LoadSpec) -> anyhow::Result<PathBuf> {
    if let Some(path) = &spec.tokenizer {
        return Ok(path.clone());
    }
    let sibling = spec
        .weights
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .join("tokenizer.json");
    if sibling.exists() {
        return Ok(sibling);
    }
    Err(anyhow!(
        "no tokenizer configured for '{}' and none found at {}",
        spec.name,
        sibling.display()
    ))
}

fn find_eos_tokens(tokenizer: &Tokenizer) -> Vec<u32> {
    EOS_CANDIDATES
        .iter()
        .filter_map(|candidate| tokenizer.token_to_id(candidate))
        .collect()
}

#[async_trait]
impl InferenceBackend for CandleBackend {
    fn name(&self) -> &str {
        "candle"
    }

    async fn load(&self, spec: LoadSpec) -> anyhow::Result<Arc<dyn InferenceModel>> {
        let config = self.config.clone();

        let model = tokio::task::spawn_blocking(move || -> anyhow::Result<CandleModel> {
            let device = CandleBackend::select_device(spec.gpu_layers)?;
            info!(
                model = %spec.name,
                path = %spec.weights.display(),
                ?device,
                context_size = spec.context_size,
                threads = spec.threads,
                "loading GGUF weights"
            );

            let mut file = std::fs::File::open(&spec.weights)
                .with_context(|| format!("failed to open {}", spec.weights.display()))?;
            let content = gguf_file::Content::read(&mut file)
                .map_err(|e| e.with_path(&spec.weights))
                .context("malformed GGUF file")?;
            let weights = ModelWeights::from_gguf(content, &mut file, &device)
                .context("failed to load model weights")?;

            let tokenizer_path = resolve_tokenizer_path(&spec)?;
            let tokenizer = Tokenizer::from_file(&tokenizer_path).map_err(|e| {
                anyhow!("failed to load tokenizer from {}: {e}", tokenizer_path.display())
            })?;
            let eos_tokens = find_eos_tokens(&tokenizer);
            debug!(model = %spec.name, ?eos_tokens, "tokenizer ready");

            Ok(CandleModel {
                inner: Arc::new(CandleInner {
                    weights: Mutex::new(weights),
                    tokenizer,
                    device,
                    eos_tokens,
                    context_size: spec.context_size,
                    config,
                }),
            })
        })
        .await
        .context("model loading task panicked")??;

        Ok(Arc::new(model))
    }
}

struct CandleInner {
    weights: Mutex<ModelWeights>,
    tokenizer: Tokenizer,
    device: Device,
    eos_tokens: Vec<u32>,
    context_size: usize,
    config: CandleConfig,
}

/// A loaded GGUF model
pub struct CandleModel {
    inner: Arc<CandleInner>,
}

impl InferenceModel for CandleModel {
    fn infer(&self, request: GenerationRequest) -> Result<FragmentStream, GenerationError> {
        let encoding = self
            .inner
            .tokenizer
            .encode(request.prompt.as_str(), true)
            .map_err(|e| GenerationError::Backend(anyhow!("tokenization failed: {e}")))?;
        let prompt_tokens = encoding.get_ids().to_vec();

        if prompt_tokens.len() >= self.inner.context_size {
            return Err(GenerationError::ContextOverflow {
                prompt_tokens: prompt_tokens.len(),
                context_size: self.inner.context_size,
            });
        }
        let budget = request
            .max_tokens
            .min(self.inner.context_size - prompt_tokens.len());

        let (tx, rx) = mpsc::channel(self.inner.config.channel_capacity);
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || {
            if let Err(e) = inner.decode_loop(&prompt_tokens, budget, &request, &tx) {
                // Receiver may already be gone; nothing left to report to
                let _ = tx.blocking_send(Err(e));
            }
        });

        let stream = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });
        Ok(stream.boxed())
    }
}

impl CandleInner {
    fn decode_loop(
        &self,
        prompt_tokens: &[u32],
        budget: usize,
        request: &GenerationRequest,
        tx: &mpsc::Sender<anyhow::Result<Fragment>>,
    ) -> anyhow::Result<()> {
        let mut weights = self.weights.lock();
        let temperature = (request.sampling.temperature > 0.0).then_some(request.sampling.temperature);
        let mut sampler = LogitsProcessor::new(request.sampling.seed, temperature, Some(request.sampling.top_p));
        let mut decoder = IncrementalDecoder::new(&self.tokenizer);
        let mut history = prompt_tokens.to_vec();

        // Prefill at position 0 also resets the per-layer KV cache
        let input = Tensor::new(prompt_tokens, &self.device)?.unsqueeze(0)?;
        let mut logits = weights.forward(&input, 0)?.squeeze(0)?;

        for index in 0..budget {
            let logits_for_step = if self.config.repeat_penalty != 1.0 {
                let start = history.len().saturating_sub(self.config.repeat_last_n);
                candle_transformers::utils::apply_repeat_penalty(
                    &logits,
                    self.config.repeat_penalty,
                    &history[start..],
                )?
            } else {
                logits.clone()
            };

            let next = sampler.sample(&logits_for_step)?;
            if self.eos_tokens.contains(&next) {
                break;
            }
            history.push(next);

            if let Some(fragment) = decoder.push(next)? {
                if tx.blocking_send(Ok(fragment)).is_err() {
                    debug!("fragment receiver dropped, stopping generation");
                    return Ok(());
                }
            }

            if index + 1 == budget {
                break;
            }
            let input = Tensor::new(&[next], &self.device)?.unsqueeze(0)?;
            logits = weights.forward(&input, prompt_tokens.len() + index)?.squeeze(0)?;
        }

        if let Some(fragment) = decoder.flush()? {
            let _ = tx.blocking_send(Ok(fragment));
        }
        Ok(())
    }
}

/// Turns a token sequence into text fragments without splitting UTF-8 characters
struct IncrementalDecoder<'a> {
    tokenizer: &'a Tokenizer,
    tokens: Vec<u32>,
    emitted: usize,
    pending_tokens: usize,
}

impl<'a> IncrementalDecoder<'a> {
    fn new(tokenizer: &'a Tokenizer) -> Self {
        Self {
            tokenizer,
            tokens: Vec::new(),
            emitted: 0,
            pending_tokens: 0,
        }
    }

    fn decode(&self) -> anyhow::Result<String> {
        self.tokenizer
            .decode(&self.tokens, false)
            .map_err(|e| anyhow!("decoding failed: {e}"))
    }

    fn push(&mut self, token: u32) -> anyhow::Result<Option<Fragment>> {
        self.tokens.push(token);
        self.pending_tokens += 1;
        let text = self.decode()?;
        if text.len() <= self.emitted || text.ends_with('\u{FFFD}') || !text.is_char_boundary(self.emitted) {
            return Ok(None);
        }
        Ok(Some(self.take(text)))
    }

    fn flush(&mut self) -> anyhow::Result<Option<Fragment>> {
        if self.pending_tokens == 0 {
            return Ok(None);
        }
        let text = self.decode()?;
        if text.len() <= self.emitted || !text.is_char_boundary(self.emitted) {
            return Ok(None);
        }
        Ok(Some(self.take(text)))
    }

    fn take(&mut self, text: String) -> Fragment {
        let fragment = Fragment::new(&text[self.emitted..], self.pending_tokens);
        self.emitted = text.len();
        self.pending_tokens = 0;
        fragment
    }
}
