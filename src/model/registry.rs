use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context};
use dashmap::{mapref::entry::Entry, DashMap};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error, info, warn};

use crate::config::{ModelConfig, WeightRef};
use crate::error::{GenerationError, ModelError, Result};

use super::backend::{InferenceBackend, InferenceModel, LoadSpec};
use super::source::WeightSource;

/// Lifecycle of a registry entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelState {
    Unregistered,
    Downloading,
    Loaded,
    Failed,
}

/// Shared handle to a loaded model
///
/// Clones refer to the same instance. Generation calls are serialized
/// through [`ModelInstance::acquire`].
#[derive(Clone)]
pub struct ModelInstance {
    inner: Arc<InstanceInner>,
}

struct InstanceInner {
    name: String,
    model: Arc<dyn InferenceModel>,
    gate: Arc<Semaphore>,
}

impl ModelInstance {
    pub fn new(name: impl Into<String>, model: Arc<dyn InferenceModel>) -> Self {
        Self {
            inner: Arc::new(InstanceInner {
                name: name.into(),
                model,
                gate: Arc::new(Semaphore::new(1)),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn model(&self) -> &Arc<dyn InferenceModel> {
        &self.inner.model
    }

    /// Wait for exclusive use of the instance
    pub async fn acquire(&self) -> std::result::Result<OwnedSemaphorePermit, GenerationError> {
        self.inner
            .gate
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| GenerationError::Cancelled(self.inner.name.clone()))
    }

    /// Whether both handles point at the same loaded instance
    pub fn ptr_eq(&self, other: &ModelInstance) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn close(&self) {
        self.inner.gate.close();
    }
}

impl fmt::Debug for ModelInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelInstance")
            .field("name", &self.inner.name)
            .finish()
    }
}

struct ModelEntry {
    config: ModelConfig,
    state: RwLock<ModelState>,
    instance: RwLock<Option<ModelInstance>>,
    // Held for the whole download + load so concurrent callers queue up
    load_gate: Mutex<()>,
}

impl ModelEntry {
    fn new(config: ModelConfig) -> Self {
        Self {
            config,
            state: RwLock::new(ModelState::Unregistered),
            instance: RwLock::new(None),
            load_gate: Mutex::new(()),
        }
    }

    fn cached(&self) -> Option<ModelInstance> {
        self.instance.read().clone()
    }

    fn set_state(&self, state: ModelState) {
        *self.state.write() = state;
    }
}

/// Named model configurations with lazily loaded, cached instances
pub struct ModelRegistry {
    cache_dir: PathBuf,
    source: Arc<dyn WeightSource>,
    backend: Arc<dyn InferenceBackend>,
    entries: DashMap<String, Arc<ModelEntry>>,
    // One gate per cached file, shared by every entry that resolves to it
    downloads: DashMap<PathBuf, Arc<Mutex<()>>>,
}

impl ModelRegistry {
    pub fn new(
        cache_dir: impl Into<PathBuf>,
        source: Arc<dyn WeightSource>,
        backend: Arc<dyn InferenceBackend>,
    ) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            source,
            backend,
            entries: DashMap::new(),
            downloads: DashMap::new(),
        }
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Add or replace a named entry in the `Unregistered` state
    ///
    /// Replacing an entry whose model is loaded requires `force`.
    pub fn register(&self, config: ModelConfig, force: bool) -> Result<()> {
        let name = config.name.clone();
        match self.entries.entry(name.clone()) {
            Entry::Occupied(mut occupied) => {
                let previous = Arc::clone(occupied.get());
                // Holding the state lock keeps a finishing load from marking
                // it Loaded between the check and the replacement
                let state = previous.state.read();
                if *state == ModelState::Loaded && !force {
                    return Err(ModelError::DuplicateName(name));
                }
                occupied.insert(Arc::new(ModelEntry::new(config)));
                drop(state);

                if let Some(instance) = previous.instance.write().take() {
                    instance.close();
                }
                debug!(model = %name, "replaced registry entry");
            }
            Entry::Vacant(vacant) => {
                vacant.insert(Arc::new(ModelEntry::new(config)));
                debug!(model = %name, "registered model");
            }
        }
        Ok(())
    }

    fn entry(&self, name: &str) -> Result<Arc<ModelEntry>> {
        self.entries
            .get(name)
            .map(|e| Arc::clone(e.value()))
            .ok_or_else(|| ModelError::UnknownModel(name.to_string()))
    }

    /// Non-blocking readiness check
    pub fn is_ready(&self, name: &str) -> bool {
        self.entries
            .get(name)
            .map(|e| *e.state.read() == ModelState::Loaded)
            .unwrap_or(false)
    }

    pub fn state(&self, name: &str) -> Option<ModelState> {
        self.entries.get(name).map(|e| *e.state.read())
    }

    /// Snapshot of every entry, sorted by name
    pub fn status(&self) -> Vec<(String, ModelState)> {
        let mut status: Vec<_> = self
            .entries
            .iter()
            .map(|e| (e.key().clone(), *e.state.read()))
            .collect();
        status.sort_by(|a, b| a.0.cmp(&b.0));
        status
    }

    /// Return the cached instance, downloading and loading it first if needed
    ///
    /// Concurrent callers for the same name wait for the first load to
    /// finish and then share its outcome.
    pub async fn ensure_loaded(&self, name: &str) -> Result<ModelInstance> {
        let entry = self.entry(name)?;
        if let Some(instance) = entry.cached() {
            debug!(model = %name, "model already loaded");
            return Ok(instance);
        }

        let _guard = entry.load_gate.lock().await;
        if let Some(instance) = entry.cached() {
            debug!(model = %name, "model loaded by a concurrent caller");
            return Ok(instance);
        }

        entry.set_state(ModelState::Downloading);
        info!(model = %name, backend = self.backend.name(), "loading model");

        match self.load_entry(&entry.config).await {
            Ok(instance) => {
                *entry.instance.write() = Some(instance.clone());
                entry.set_state(ModelState::Loaded);
                info!(model = %name, "model loaded successfully");
                Ok(instance)
            }
            Err(source) => {
                entry.instance.write().take();
                entry.set_state(ModelState::Failed);
                error!(model = %name, error = %format!("{source:#}"), "failed to load model");
                Err(ModelError::Load {
                    name: name.to_string(),
                    source,
                })
            }
        }
    }

    async fn load_entry(&self, config: &ModelConfig) -> anyhow::Result<ModelInstance> {
        let weights = self.resolve(&config.source).await?;
        let tokenizer = match &config.tokenizer {
            Some(reference) => Some(self.resolve(reference).await?),
            None => None,
        };

        let spec = LoadSpec {
            name: config.name.clone(),
            weights,
            tokenizer,
            context_size: config.context_size,
            threads: config.threads,
            gpu_layers: config.gpu_layers,
        };
        let model = self
            .backend
            .load(spec)
            .await
            .with_context(|| format!("{} backend could not instantiate the model", self.backend.name()))?;

        Ok(ModelInstance::new(config.name.clone(), model))
    }

    async fn resolve(&self, reference: &WeightRef) -> anyhow::Result<PathBuf> {
        match reference {
            WeightRef::Local { path } => {
                if tokio::fs::try_exists(path).await.unwrap_or(false) {
                    Ok(path.clone())
                } else {
                    Err(anyhow!("local file {} does not exist", path.display()))
                }
            }
            WeightRef::Hub { repo_id, filename } => {
                let cached = self.cache_dir.join(filename);
                if tokio::fs::try_exists(&cached).await.unwrap_or(false) {
                    info!(path = %cached.display(), "found locally");
                    return Ok(cached);
                }

                let gate = Arc::clone(&*self.downloads.entry(cached.clone()).or_default());
                let _guard = gate.lock().await;
                if tokio::fs::try_exists(&cached).await.unwrap_or(false) {
                    debug!(path = %cached.display(), "downloaded by a concurrent load");
                    return Ok(cached);
                }

                info!(repo = %repo_id, file = %filename, "not found locally, downloading");
                tokio::fs::create_dir_all(&self.cache_dir)
                    .await
                    .with_context(|| format!("failed to create {}", self.cache_dir.display()))?;
                self.source
                    .fetch(repo_id, filename, &self.cache_dir)
                    .await
                    .with_context(|| format!("failed to fetch {filename} from {repo_id}"))
            }
        }
    }

    /// Load every registered model, reporting failures instead of stopping at the first
    pub async fn preload_all(&self) -> Vec<(String, Result<()>)> {
        let mut names: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        names.sort();

        let mut outcomes = Vec::with_capacity(names.len());
        for name in names {
            let outcome = self.ensure_loaded(&name).await.map(|_| ());
            if outcome.is_err() {
                warn!(model = %name, "model did not load on startup");
            }
            outcomes.push((name, outcome));
        }
        outcomes
    }

    /// Drop the cached instance and return the entry to `Unregistered`
    ///
    /// Generations already holding the instance finish normally; callers
    /// still waiting for it fail with [`GenerationError::Cancelled`].
    pub async fn unload(&self, name: &str) -> Result<()> {
        let entry = self.entry(name)?;
        let _guard = entry.load_gate.lock().await;
        if let Some(instance) = entry.instance.write().take() {
            instance.close();
            info!(model = %name, "model unloaded");
        }
        entry.set_state(ModelState::Unregistered);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::backend::FragmentStream;
    use crate::types::GenerationRequest;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct CountingSource {
        fetches: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl WeightSource for CountingSource {
        async fn fetch(&self, _repo_id: &str, filename: &str, target_dir: &Path) -> anyhow::Result<PathBuf> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                anyhow::bail!("network unreachable");
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
            let path = target_dir.join(filename);
            tokio::fs::write(&path, b"gguf").await?;
            Ok(path)
        }
    }

    struct NullModel;

    impl InferenceModel for NullModel {
        fn infer(&self, _request: GenerationRequest) -> std::result::Result<FragmentStream, GenerationError> {
            Ok(Box::pin(futures::stream::empty()))
        }
    }

    #[derive(Default)]
    struct CountingBackend {
        loads: AtomicUsize,
        specs: parking_lot::Mutex<Vec<LoadSpec>>,
    }

    #[async_trait]
    impl InferenceBackend for CountingBackend {
        fn name(&self) -> &str {
            "counting"
        }

        async fn load(&self, spec: LoadSpec) -> anyhow::Result<Arc<dyn InferenceModel>> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            self.specs.lock().push(spec);
            Ok(Arc::new(NullModel))
        }
    }

    fn hub_config(name: &str) -> ModelConfig {
        let mut config = ModelConfig::new(name, WeightRef::hub("org/repo", format!("{name}.gguf")))
            .with_context_size(2048);
        config.threads = 3;
        config
    }

    fn create_test_registry(
        dir: &Path,
        source: Arc<CountingSource>,
        backend: Arc<CountingBackend>,
    ) -> ModelRegistry {
        ModelRegistry::new(dir, source, backend)
    }

    #[tokio::test]
    async fn test_second_load_is_cached() {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(CountingSource::default());
        let backend = Arc::new(CountingBackend::default());
        let registry = create_test_registry(dir.path(), source.clone(), backend.clone());
        registry.register(hub_config("question_generator"), false).unwrap();

        assert!(!registry.is_ready("question_generator"));
        let first = registry.ensure_loaded("question_generator").await.unwrap();
        let second = registry.ensure_loaded("question_generator").await.unwrap();

        assert!(first.ptr_eq(&second));
        assert!(registry.is_ready("question_generator"));
        assert_eq!(source.fetches.load(Ordering::SeqCst), 1);
        assert_eq!(backend.loads.load(Ordering::SeqCst), 1);

        let specs = backend.specs.lock();
        assert_eq!(specs[0].context_size, 2048);
        assert_eq!(specs[0].threads, 3);
        assert_eq!(specs[0].weights, dir.path().join("question_generator.gguf"));
    }

    #[tokio::test]
    async fn test_existing_file_skips_fetch() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("cached.gguf"), b"gguf").unwrap();
        let source = Arc::new(CountingSource::default());
        let backend = Arc::new(CountingBackend::default());
        let registry = create_test_registry(dir.path(), source.clone(), backend.clone());
        registry.register(hub_config("cached"), false).unwrap();

        registry.ensure_loaded("cached").await.unwrap();
        assert_eq!(source.fetches.load(Ordering::SeqCst), 0);
        assert_eq!(backend.loads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_concurrent_loads_share_one_fetch() {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(CountingSource::default());
        let backend = Arc::new(CountingBackend::default());
        let registry = Arc::new(create_test_registry(dir.path(), source.clone(), backend.clone()));
        registry.register(hub_config("shared"), false).unwrap();

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let registry = registry.clone();
                tokio::spawn(async move { registry.ensure_loaded("shared").await })
            })
            .collect();

        let mut instances = Vec::new();
        for handle in handles {
            instances.push(handle.await.unwrap().unwrap());
        }

        assert_eq!(source.fetches.load(Ordering::SeqCst), 1);
        assert_eq!(backend.loads.load(Ordering::SeqCst), 1);
        assert!(instances.windows(2).all(|w| w[0].ptr_eq(&w[1])));
    }

    #[tokio::test]
    async fn test_shared_tokenizer_is_fetched_once() {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(CountingSource::default());
        let backend = Arc::new(CountingBackend::default());
        let registry = Arc::new(create_test_registry(dir.path(), source.clone(), backend.clone()));
        let tokenizer = WeightRef::hub("Qwen/Qwen2.5-0.5B-Instruct", "tokenizer.json");
        for name in ["question_generator", "answer_evaluator"] {
            registry
                .register(hub_config(name).with_tokenizer(tokenizer.clone()), false)
                .unwrap();
        }

        let handles: Vec<_> = ["question_generator", "answer_evaluator"]
            .into_iter()
            .map(|name| {
                let registry = registry.clone();
                tokio::spawn(async move { registry.ensure_loaded(name).await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        // Two weight files plus one tokenizer
        assert_eq!(source.fetches.load(Ordering::SeqCst), 3);
        let specs = backend.specs.lock();
        assert!(specs
            .iter()
            .all(|s| s.tokenizer == Some(dir.path().join("tokenizer.json"))));
    }

    #[tokio::test]
    async fn test_register_during_load_leaves_new_entry_unloaded() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(create_test_registry(
            dir.path(),
            Arc::new(CountingSource::default()),
            Arc::new(CountingBackend::default()),
        ));
        registry.register(hub_config("model"), false).unwrap();

        let loading = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.ensure_loaded("model").await })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(registry.state("model"), Some(ModelState::Downloading));

        // Not loaded yet, so no force is needed
        registry.register(hub_config("model"), false).unwrap();
        loading.await.unwrap().unwrap();

        assert_eq!(registry.state("model"), Some(ModelState::Unregistered));
        registry.register(hub_config("model"), false).unwrap();
    }

    #[tokio::test]
    async fn test_failed_load_can_retry() {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(CountingSource {
            fail: true,
            ..Default::default()
        });
        let backend = Arc::new(CountingBackend::default());
        let registry = create_test_registry(dir.path(), source.clone(), backend.clone());
        registry.register(hub_config("flaky"), false).unwrap();

        let err = registry.ensure_loaded("flaky").await.unwrap_err();
        assert!(matches!(err, ModelError::Load { .. }));
        assert!(err.to_string().contains("network unreachable"));
        assert_eq!(registry.state("flaky"), Some(ModelState::Failed));

        let _ = registry.ensure_loaded("flaky").await;
        assert_eq!(source.fetches.load(Ordering::SeqCst), 2);
        assert_eq!(backend.loads.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_missing_local_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let registry = create_test_registry(
            dir.path(),
            Arc::new(CountingSource::default()),
            Arc::new(CountingBackend::default()),
        );
        let config = ModelConfig::new("local", WeightRef::local(dir.path().join("absent.gguf")));
        registry.register(config, false).unwrap();

        assert!(registry.ensure_loaded("local").await.is_err());
        assert_eq!(registry.state("local"), Some(ModelState::Failed));
    }

    #[tokio::test]
    async fn test_register_loaded_requires_force() {
        let dir = tempfile::tempdir().unwrap();
        let registry = create_test_registry(
            dir.path(),
            Arc::new(CountingSource::default()),
            Arc::new(CountingBackend::default()),
        );
        registry.register(hub_config("model"), false).unwrap();
        // Unloaded entries can be replaced freely
        registry.register(hub_config("model"), false).unwrap();

        registry.ensure_loaded("model").await.unwrap();
        assert!(matches!(
            registry.register(hub_config("model"), false),
            Err(ModelError::DuplicateName(_))
        ));

        registry.register(hub_config("model"), true).unwrap();
        assert_eq!(registry.state("model"), Some(ModelState::Unregistered));
    }

    #[tokio::test]
    async fn test_unknown_model() {
        let dir = tempfile::tempdir().unwrap();
        let registry = create_test_registry(
            dir.path(),
            Arc::new(CountingSource::default()),
            Arc::new(CountingBackend::default()),
        );
        assert!(matches!(
            registry.ensure_loaded("nope").await,
            Err(ModelError::UnknownModel(_))
        ));
        assert!(!registry.is_ready("nope"));
    }

    #[tokio::test]
    async fn test_preload_and_unload() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(CountingBackend::default());
        let registry = create_test_registry(dir.path(), Arc::new(CountingSource::default()), backend.clone());
        registry.register(hub_config("a"), false).unwrap();
        registry
            .register(ModelConfig::new("b", WeightRef::local(dir.path().join("missing.gguf"))), false)
            .unwrap();

        let outcomes = registry.preload_all().await;
        assert_eq!(outcomes.len(), 2);
        assert!(outcomes[0].1.is_ok());
        assert!(outcomes[1].1.is_err());
        assert_eq!(
            registry.status(),
            vec![
                ("a".to_string(), ModelState::Loaded),
                ("b".to_string(), ModelState::Failed),
            ]
        );

        let instance = registry.ensure_loaded("a").await.unwrap();
        registry.unload("a").await.unwrap();
        assert!(!registry.is_ready("a"));
        assert!(matches!(instance.acquire().await, Err(GenerationError::Cancelled(_))));

        registry.ensure_loaded("a").await.unwrap();
        assert_eq!(backend.loads.load(Ordering::SeqCst), 2);
    }
}
