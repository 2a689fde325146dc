// Location: src/processing/stream.rs

use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;

use futures::{Stream, StreamExt};
use tokio::sync::OwnedSemaphorePermit;
use tracing::{debug, warn};

use crate::{
    error::GenerationError,
    model::{FragmentStream, ModelInstance},
    types::{GenerationRequest, GenerationResult, StopReason},
};

/// Runs generation requests against loaded model instances
#[derive(Debug, Default, Clone, Copy)]
pub struct StreamingGenerator;

impl StreamingGenerator {
    /// Start a generation and return its fragment stream
    ///
    /// Waits until no other generation holds `instance`. The stream keeps
    /// exclusive use of the instance until it ends or is dropped.
    pub async fn generate(
        instance: &ModelInstance,
        request: GenerationRequest,
    ) -> Result<TokenStream, GenerationError> {
        let permit = instance.acquire().await?;
        debug!(
            model = %instance.name(),
            prompt_chars = request.prompt.len(),
            max_tokens = request.max_tokens,
            "starting generation"
        );

        let stop = request
            .stop
            .iter()
            .filter(|s| !s.is_empty())
            .cloned()
            .collect();
        let max_tokens = request.max_tokens;

        if max_tokens == 0 {
            return Ok(TokenStream::finished(instance.name(), stop, StopReason::TokenBudget));
        }

        let inner = instance.model().infer(request)?;
        Ok(TokenStream {
            model: instance.name().to_string(),
            inner: Some(inner),
            permit: Some(permit),
            stop,
            max_tokens,
            tokens: 0,
            pending: String::new(),
            emitted: String::new(),
            finish: None,
            started: Instant::now(),
        })
    }

    /// Run a generation to completion
    pub async fn generate_to_end(
        instance: &ModelInstance,
        request: GenerationRequest,
    ) -> Result<GenerationResult, GenerationError> {
        Self::generate(instance, request).await?.collect_result().await
    }
}

/// Finite, non-restartable stream of generated text
///
/// Stop sequences are removed: text that could be the start of a stop
/// sequence is held back until it is known not to be one. A backend error
/// is yielded once and ends the stream.
pub struct TokenStream {
    model: String,
    inner: Option<FragmentStream>,
    permit: Option<OwnedSemaphorePermit>,
    stop: Vec<String>,
    max_tokens: usize,
    tokens: usize,
    pending: String,
    emitted: String,
    finish: Option<StopReason>,
    started: Instant,
}

impl TokenStream {
    fn finished(model: &str, stop: Vec<String>, reason: StopReason) -> Self {
        Self {
            model: model.to_string(),
            inner: None,
            permit: None,
            stop,
            max_tokens: 0,
            tokens: 0,
            pending: String::new(),
            emitted: String::new(),
            finish: Some(reason),
            started: Instant::now(),
        }
    }

    /// Tokens produced by the backend so far
    pub fn tokens(&self) -> usize {
        self.tokens
    }

    /// Text yielded so far
    pub fn text(&self) -> &str {
        &self.emitted
    }

    /// Reason the stream ended, once it has
    pub fn stop_reason(&self) -> Option<StopReason> {
        self.finish
    }

    // Releases the backend stream and the instance permit
    fn close(&mut self, reason: StopReason) {
        self.inner = None;
        self.permit = None;
        if self.finish.is_none() {
            self.finish = Some(reason);
        }
    }

    fn result(&self) -> GenerationResult {
        GenerationResult {
            text: self.emitted.clone(),
            stop_reason: self.finish.unwrap_or(StopReason::Abandoned),
            tokens: self.tokens,
            elapsed: self.started.elapsed(),
        }
    }

    /// Consume the remaining fragments and aggregate everything
    pub async fn collect_result(mut self) -> Result<GenerationResult, GenerationError> {
        while let Some(fragment) = self.next().await {
            fragment?;
        }
        let result = self.result();
        debug!(
            model = %self.model,
            tokens = result.tokens,
            stop_reason = ?result.stop_reason,
            elapsed_ms = result.elapsed.as_millis() as u64,
            "generation complete"
        );
        Ok(result)
    }

    /// Stop early, keeping what has been yielded so far
    pub fn abandon(mut self) -> GenerationResult {
        self.close(StopReason::Abandoned);
        self.result()
    }

    fn emit(&mut self, text: String) -> Poll<Option<Result<String, GenerationError>>> {
        self.emitted.push_str(&text);
        Poll::Ready(Some(Ok(text)))
    }
}

/// Byte offset of the earliest stop sequence in `text`
fn find_stop(text: &str, stop: &[String]) -> Option<usize> {
    stop.iter().filter_map(|s| text.find(s.as_str())).min()
}

/// Length of the longest suffix of `text` that is a proper prefix of a stop sequence
fn held_back_len(text: &str, stop: &[String]) -> usize {
    stop.iter()
        .map(|s| {
            (1..s.len().min(text.len() + 1))
                .rev()
                .find(|&n| {
                    let start = text.len() - n;
                    text.is_char_boundary(start) && s.is_char_boundary(n) && text[start..] == s[..n]
                })
                .unwrap_or(0)
        })
        .max()
        .unwrap_or(0)
}

impl Stream for TokenStream {
    type Item = Result<String, GenerationError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            let Some(inner) = this.inner.as_mut() else {
                if this.pending.is_empty() {
                    return Poll::Ready(None);
                }
                let rest = std::mem::take(&mut this.pending);
                return this.emit(rest);
            };

            let fragment = match inner.poll_next_unpin(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(None) => {
                    this.close(StopReason::EndOfStream);
                    continue;
                }
                Poll::Ready(Some(Err(e))) => {
                    warn!(model = %this.model, error = %format!("{e:#}"), "generation failed");
                    this.pending.clear();
                    this.close(StopReason::Abandoned);
                    return Poll::Ready(Some(Err(GenerationError::Backend(e))));
                }
                Poll::Ready(Some(Ok(fragment))) => fragment,
            };

            this.tokens += fragment.tokens;
            this.pending.push_str(&fragment.text);

            if let Some(index) = find_stop(&this.pending, &this.stop) {
                this.pending.truncate(index);
                this.close(StopReason::StopSequence);
                continue;
            }
            if this.tokens >= this.max_tokens {
                this.close(StopReason::TokenBudget);
                continue;
            }

            let ready = this.pending.len() - held_back_len(&this.pending, &this.stop);
            if ready == 0 {
                continue;
            }
            let rest = this.pending.split_off(ready);
            let text = std::mem::replace(&mut this.pending, rest);
            return this.emit(text);
        }
    }
}
