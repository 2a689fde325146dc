use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

const DEFAULT_ENDPOINT: &str = "https://huggingface.co";
const DEFAULT_REVISION: &str = "main";

/// Remote origin of model files
#[async_trait]
pub trait WeightSource: Send + Sync {
    /// Download `filename` from `repo_id` into `target_dir`, returning the local path
    async fn fetch(&self, repo_id: &str, filename: &str, target_dir: &Path) -> anyhow::Result<PathBuf>;
}

/// Downloads files from a Hugging Face compatible hub
pub struct HubSource {
    endpoint: String,
    revision: String,
    token: Option<String>,
    http_client: reqwest::Client,
}

impl HubSource {
    pub fn new(endpoint: impl Into<String>) -> anyhow::Result<Self> {
        let http_client = reqwest::Client::builder()
            .user_agent(concat!("question-engine/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("failed to create HTTP client")?;

        Ok(Self {
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            revision: DEFAULT_REVISION.to_string(),
            token: None,
            http_client,
        })
    }

    /// Endpoint from `HF_ENDPOINT`, token from `HF_TOKEN`
    pub fn from_env() -> anyhow::Result<Self> {
        let endpoint = std::env::var("HF_ENDPOINT").unwrap_or_else(|_| DEFAULT_ENDPOINT.to_string());
        let mut source = Self::new(endpoint)?;
        source.token = std::env::var("HF_TOKEN").ok().filter(|t| !t.is_empty());
        Ok(source)
    }

    pub fn with_revision(mut self, revision: impl Into<String>) -> Self {
        self.revision = revision.into();
        self
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    fn resolve_url(&self, repo_id: &str, filename: &str) -> String {
        format!(
            "{}/{}/resolve/{}/{}",
            self.endpoint, repo_id, self.revision, filename
        )
    }
}

#[async_trait]
impl WeightSource for HubSource {
    async fn fetch(&self, repo_id: &str, filename: &str, target_dir: &Path) -> anyhow::Result<PathBuf> {
        let target = target_dir.join(filename);
        if tokio::fs::try_exists(&target).await.unwrap_or(false) {
            debug!(path = %target.display(), "file already cached");
            return Ok(target);
        }
        let dir = target.parent().unwrap_or(target_dir).to_path_buf();
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("failed to create {}", dir.display()))?;

        let url = self.resolve_url(repo_id, filename);
        info!(%url, "downloading");

        let mut request = self.http_client.get(&url);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        let mut response = request
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .with_context(|| format!("request for {url} failed"))?;

        // Every fetch gets its own `.part` file, deleted on drop unless persisted
        let prefix = format!(
            ".{}.",
            target.file_name().map(|n| n.to_string_lossy()).unwrap_or_default()
        );
        let (file, partial) = tempfile::Builder::new()
            .prefix(&prefix)
            .suffix(".part")
            .tempfile_in(&dir)
            .with_context(|| format!("failed to create a temporary file in {}", dir.display()))?
            .into_parts();
        let mut file = tokio::fs::File::from_std(file);

        let mut written: u64 = 0;
        while let Some(chunk) = response
            .chunk()
            .await
            .with_context(|| format!("download of {url} interrupted"))?
        {
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        partial
            .persist(&target)
            .with_context(|| format!("failed to move download into {}", target.display()))?;

        info!(path = %target.display(), bytes = written, "download complete");
        Ok(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ModelConfig, WeightRef};
    use crate::error::GenerationError;
    use crate::model::{FragmentStream, InferenceBackend, InferenceModel, LoadSpec, ModelRegistry, ModelState};
    use crate::types::GenerationRequest;
    use futures::StreamExt;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;
    use tokio::net::{TcpListener, TcpStream};

    /// Response for one accepted connection
    #[derive(Clone)]
    enum Reply {
        Complete(Vec<u8>),
        /// Announces the whole body, sends `sent` bytes of it, then hangs up
        CutAfter { body: Vec<u8>, sent: usize },
    }

    async fn respond(mut socket: TcpStream, reply: Reply) {
        let mut request = Vec::new();
        let mut buf = [0u8; 1024];
        while !request.windows(4).any(|w| w == b"\r\n\r\n") {
            match socket.read(&mut buf).await {
                Ok(0) | Err(_) => return,
                Ok(n) => request.extend_from_slice(&buf[..n]),
            }
        }

        let (body, sent) = match reply {
            Reply::Complete(body) => {
                let len = body.len();
                (body, len)
            }
            Reply::CutAfter { body, sent } => (body, sent),
        };
        let head = format!(
            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            body.len()
        );
        if socket.write_all(head.as_bytes()).await.is_err() {
            return;
        }
        for chunk in body[..sent].chunks(10) {
            if socket.write_all(chunk).await.is_err() {
                return;
            }
            let _ = socket.flush().await;
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Answers connections with `replies` in order; returns the endpoint and a request counter
    async fn serve(replies: Vec<Reply>) -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = format!("http://{}", listener.local_addr().unwrap());
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        tokio::spawn(async move {
            for reply in replies {
                let Ok((socket, _)) = listener.accept().await else {
                    return;
                };
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(respond(socket, reply));
            }
        });
        (endpoint, hits)
    }

    fn body() -> Vec<u8> {
        (1..=100u8).collect()
    }

    fn dir_entries(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn test_resolve_url() {
        let source = HubSource::new("https://hub.example.org/").unwrap();
        assert_eq!(
            source.resolve_url("zinec/finetuned-qwen-fr", "model.gguf"),
            "https://hub.example.org/zinec/finetuned-qwen-fr/resolve/main/model.gguf"
        );

        let pinned = source.with_revision("v2");
        assert!(pinned.resolve_url("a/b", "c").contains("/resolve/v2/"));
    }

    #[tokio::test]
    async fn test_fetch_skips_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let existing = dir.path().join("model.gguf");
        std::fs::write(&existing, b"weights").unwrap();

        // Unroutable endpoint: any network access would fail the test.
        let source = HubSource::new("http://127.0.0.1:9").unwrap();
        let path = source.fetch("org/repo", "model.gguf", dir.path()).await.unwrap();
        assert_eq!(path, existing);
    }

    #[tokio::test]
    async fn test_fetch_downloads_into_place() {
        let dir = tempfile::tempdir().unwrap();
        let (endpoint, hits) = serve(vec![Reply::Complete(body())]).await;
        let source = HubSource::new(endpoint).unwrap();

        let path = source.fetch("org/repo", "tokenizer.json", dir.path()).await.unwrap();
        assert_eq!(path, dir.path().join("tokenizer.json"));
        assert_eq!(std::fs::read(&path).unwrap(), body());
        assert_eq!(dir_entries(dir.path()), vec!["tokenizer.json".to_string()]);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_interrupted_download_leaves_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let (endpoint, _) = serve(vec![Reply::CutAfter { body: body(), sent: 40 }]).await;
        let source = HubSource::new(endpoint).unwrap();

        let result = source.fetch("org/repo", "tokenizer.json", dir.path()).await;
        assert!(result.is_err());
        assert!(!dir.path().join("tokenizer.json").exists());
        assert!(dir_entries(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_fetches_of_same_file() {
        let dir = tempfile::tempdir().unwrap();
        let (endpoint, _) = serve(vec![Reply::Complete(body()), Reply::Complete(body())]).await;
        let source = Arc::new(HubSource::new(endpoint).unwrap());

        let spawn_fetch = |source: Arc<HubSource>, dir: PathBuf| {
            tokio::spawn(async move { source.fetch("org/repo", "tokenizer.json", &dir).await })
        };
        let first = spawn_fetch(source.clone(), dir.path().to_path_buf());
        // Second fetch starts while the first is mid-body
        tokio::time::sleep(Duration::from_millis(50)).await;
        let second = spawn_fetch(source.clone(), dir.path().to_path_buf());

        let first = first.await.unwrap().unwrap();
        let second = second.await.unwrap().unwrap();
        assert_eq!(first, second);
        assert_eq!(std::fs::read(&first).unwrap(), body());
        assert_eq!(dir_entries(dir.path()), vec!["tokenizer.json".to_string()]);
    }

    struct NullModel;

    impl InferenceModel for NullModel {
        fn infer(&self, _request: GenerationRequest) -> Result<FragmentStream, GenerationError> {
            Ok(futures::stream::empty().boxed())
        }
    }

    struct NullBackend;

    #[async_trait]
    impl InferenceBackend for NullBackend {
        fn name(&self) -> &str {
            "null"
        }

        async fn load(&self, _spec: LoadSpec) -> anyhow::Result<Arc<dyn InferenceModel>> {
            Ok(Arc::new(NullModel))
        }
    }

    #[tokio::test]
    async fn test_registry_downloads_again_after_interruption() {
        let dir = tempfile::tempdir().unwrap();
        let (endpoint, hits) = serve(vec![
            Reply::CutAfter { body: body(), sent: 30 },
            Reply::Complete(body()),
        ])
        .await;
        let registry = ModelRegistry::new(
            dir.path(),
            Arc::new(HubSource::new(endpoint).unwrap()),
            Arc::new(NullBackend),
        );
        registry
            .register(ModelConfig::new("question_generator", WeightRef::hub("org/repo", "model.gguf")), false)
            .unwrap();

        assert!(registry.ensure_loaded("question_generator").await.is_err());
        assert_eq!(registry.state("question_generator"), Some(ModelState::Failed));
        assert!(dir_entries(dir.path()).is_empty());

        registry.ensure_loaded("question_generator").await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert_eq!(std::fs::read(dir.path().join("model.gguf")).unwrap(), body());
    }
}
