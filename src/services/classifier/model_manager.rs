use crate::config::{Backend, ModelConfig};
use crate::error::AppError;
use crate::models::classify_types::ModelInfo;
use crate::services::classifier::inference::{OnnxClassifier, Preprocess};
use crate::services::classifier::{ModelHandle, ModelLoader};
use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use ort::session::builder::SessionBuilder;
use ort::session::Session;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;

const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];
const HALF: [f32; 3] = [0.5, 0.5, 0.5];

/// Download progress in percent.
pub type ProgressFn = Arc<dyn Fn(u64) + Send + Sync>;

/// Brings up the runtime for a backend without a model attached.
pub type RuntimeCheck = fn(Backend, usize) -> Result<(), AppError>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ModelType {
    MobileNetV2,
    ConvNextV2Base,
}

pub struct ModelArtifacts {
    pub model_url: &'static str,
    pub config_url: &'static str,
    pub model_file: &'static str,
    pub config_file: &'static str,
}

impl ModelType {
    pub fn artifacts(&self) -> ModelArtifacts {
        match self {
            ModelType::MobileNetV2 => ModelArtifacts {
                model_url: "https://huggingface.co/Xenova/mobilenet_v2_1.0_224/resolve/main/onnx/model.onnx",
                config_url: "https://huggingface.co/Xenova/mobilenet_v2_1.0_224/resolve/main/config.json",
                model_file: "mobilenet_v2_1.0_224.onnx",
                config_file: "mobilenet_v2_1.0_224-config.json",
            },
            ModelType::ConvNextV2Base => ModelArtifacts {
                model_url: "https://huggingface.co/Xenova/convnextv2-base-22k-384/resolve/main/onnx/model.onnx",
                config_url: "https://huggingface.co/Xenova/convnextv2-base-22k-384/resolve/main/config.json",
                model_file: "convnextv2-base-22k-384.onnx",
                config_file: "convnextv2-base-22k-384-config.json",
            },
        }
    }

    pub fn preprocess(&self) -> Preprocess {
        match self {
            ModelType::MobileNetV2 => Preprocess {
                crop_size: 224,
                crop_pct: 0.875,
                mean: HALF,
                std: HALF,
            },
            ModelType::ConvNextV2Base => Preprocess {
                crop_size: 384,
                crop_pct: 0.875,
                mean: IMAGENET_MEAN,
                std: IMAGENET_STD,
            },
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ModelType::MobileNetV2 => "mobilenet_v2_1.0_224",
            ModelType::ConvNextV2Base => "convnextv2-base-22k-384",
        }
    }
}

/// Fetches artifacts on first use and builds an ONNX Runtime session.
pub struct OnnxModelLoader {
    config: ModelConfig,
    model_dir: PathBuf,
    client: reqwest::Client,
    progress: Option<ProgressFn>,
    runtime_check: RuntimeCheck,
}

impl OnnxModelLoader {
    pub fn new(config: ModelConfig, model_dir: PathBuf) -> Self {
        Self {
            config,
            model_dir,
            client: reqwest::Client::new(),
            progress: None,
            runtime_check: prepare_runtime,
        }
    }

    pub fn with_progress(mut self, progress: impl Fn(u64) + Send + Sync + 'static) -> Self {
        self.progress = Some(Arc::new(progress));
        self
    }

    pub fn with_runtime_check(mut self, check: RuntimeCheck) -> Self {
        self.runtime_check = check;
        self
    }

    pub fn model_path(&self) -> PathBuf {
        self.model_dir.join(self.config.model_type.artifacts().model_file)
    }

    pub fn config_path(&self) -> PathBuf {
        self.model_dir.join(self.config.model_type.artifacts().config_file)
    }

    pub fn is_downloaded(&self) -> bool {
        self.model_path().exists() && self.config_path().exists()
    }

    pub async fn download_model(&self) -> Result<(), AppError> {
        if self.is_downloaded() {
            return Ok(());
        }

        tokio::fs::create_dir_all(&self.model_dir).await.map_err(|e| {
            AppError::ModelLoad(format!("Failed to create model directory: {}", e))
        })?;

        let artifacts = self.config.model_type.artifacts();
        let config_url = self.config.config_url.as_deref().unwrap_or(artifacts.config_url);
        let model_url = self.config.model_url.as_deref().unwrap_or(artifacts.model_url);

        let config_path = self.config_path();
        if !config_path.exists() {
            download_file(&self.client, config_url, &config_path, None).await?;
        }

        let model_path = self.model_path();
        if !model_path.exists() {
            download_file(&self.client, model_url, &model_path, self.progress.as_ref()).await?;
        }

        Ok(())
    }

    async fn do_load_model(&self) -> Result<ModelHandle, AppError> {
        let backend = self.config.backend;
        let intra_threads = self.config.intra_threads;

        // Runtime and backend come up before any artifact is requested
        let check = self.runtime_check;
        tokio::task::spawn_blocking(move || check(backend, intra_threads))
            .await
            .map_err(|e| AppError::ModelLoad(format!("Failed to spawn runtime setup task: {}", e)))??;
        log::debug!("Runtime ready on {} backend", backend.as_str());

        self.download_model().await?;

        let config_path = self.config_path();
        let config_content = tokio::fs::read_to_string(&config_path).await.map_err(|e| {
            AppError::ModelLoad(format!("Failed to read config file {}: {}", config_path.display(), e))
        })?;
        let config: serde_json::Value = serde_json::from_str(&config_content)
            .map_err(|e| AppError::ModelLoad(format!("Failed to parse config JSON: {}", e)))?;
        let labels = parse_labels(&config)?;

        let model_path = self.model_path();
        let session = tokio::task::spawn_blocking(move || build_session(&model_path, backend, intra_threads))
            .await
            .map_err(|e| AppError::ModelLoad(format!("Failed to spawn model loading task: {}", e)))??;

        let model_type = self.config.model_type;
        log::info!(
            "Loaded {} with {} labels on {} backend",
            model_type.name(),
            labels.len(),
            backend.as_str()
        );

        Ok(ModelHandle::new(
            OnnxClassifier::new(session, labels, model_type.preprocess(), self.config.top_k),
            ModelInfo {
                name: model_type.name().to_string(),
                backend: backend.as_str().to_string(),
            },
        ))
    }
}

impl ModelLoader for OnnxModelLoader {
    fn load(&self) -> BoxFuture<'_, Result<ModelHandle, AppError>> {
        self.do_load_model().boxed()
    }
}

/// Labels from the `id2label` map of a Hugging Face style config, ordered by index.
pub fn parse_labels(config: &serde_json::Value) -> Result<Vec<String>, AppError> {
    let id2label = config["id2label"]
        .as_object()
        .ok_or_else(|| AppError::ModelLoad("Config missing id2label field".to_string()))?;

    let mut labels: Vec<(usize, String)> = id2label
        .iter()
        .map(|(k, v)| {
            let idx = k
                .parse::<usize>()
                .map_err(|_| AppError::ModelLoad(format!("Invalid label index '{}'", k)))?;
            let label = v.as_str().unwrap_or("unknown").to_string();
            Ok((idx, label))
        })
        .collect::<Result<_, AppError>>()?;
    labels.sort_by_key(|(idx, _)| *idx);

    Ok(labels.into_iter().map(|(_, label)| label).collect())
}

/// Initialises ONNX Runtime and registers the backend's execution providers.
pub fn prepare_runtime(backend: Backend, intra_threads: usize) -> Result<(), AppError> {
    session_builder(backend, intra_threads).map(|_| ())
}

fn session_builder(backend: Backend, intra_threads: usize) -> Result<SessionBuilder, AppError> {
    let _ = ort::init().with_name("image-recognizer").commit();

    let builder = Session::builder()
        .map_err(|e| AppError::ModelLoad(format!("Failed to create session builder: {}", e)))?
        .with_optimization_level(ort::session::builder::GraphOptimizationLevel::Level3)
        .map_err(|e| AppError::ModelLoad(format!("Failed to set optimization level: {}", e)))?
        .with_intra_threads(intra_threads)
        .map_err(|e| AppError::ModelLoad(format!("Failed to set intra threads: {}", e)))?;

    let builder = match backend {
        Backend::Gpu => builder
            .with_execution_providers([
                ort::execution_providers::DirectMLExecutionProvider::default().build(),
                ort::execution_providers::CoreMLExecutionProvider::default().build(),
                ort::execution_providers::CUDAExecutionProvider::default().build(),
                ort::execution_providers::CPUExecutionProvider::default().build(),
            ])
            .map_err(|e| AppError::ModelLoad(format!("Failed to register GPU execution providers: {}", e)))?,
        Backend::Cpu => builder
            .with_execution_providers([ort::execution_providers::CPUExecutionProvider::default().build()])
            .map_err(|e| AppError::ModelLoad(format!("Failed to register CPU execution provider: {}", e)))?,
    };
    Ok(builder)
}

fn build_session(model_path: &Path, backend: Backend, intra_threads: usize) -> Result<Session, AppError> {
    session_builder(backend, intra_threads)?
        .commit_from_file(model_path)
        .map_err(|e| AppError::ModelLoad(format!("Failed to load ONNX model: {}", e)))
}

/// Streams `url` into `dest`, going through a `.part` file so a crash never leaves a truncated artifact.
async fn download_file(
    client: &reqwest::Client,
    url: &str,
    dest: &Path,
    progress: Option<&ProgressFn>,
) -> Result<(), AppError> {
    log::info!("Downloading {}", url);
    let response = client
        .get(url)
        .send()
        .await
        .map_err(|e| AppError::ModelLoad(format!("Failed to download {}: {}", url, e)))?;

    if !response.status().is_success() {
        return Err(AppError::ModelLoad(format!(
            "Failed to download {}: HTTP {}",
            url,
            response.status()
        )));
    }

    let total_size = response.content_length().unwrap_or(0);
    let mut downloaded: u64 = 0;
    let mut last_emit = 0;

    let partial = dest.with_extension("part");
    let mut file = tokio::fs::File::create(&partial).await.map_err(|e| {
        AppError::ModelLoad(format!("Failed to create file {}: {}", partial.display(), e))
    })?;

    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| AppError::ModelLoad(format!("Download of {} interrupted: {}", url, e)))?;
        downloaded += chunk.len() as u64;
        file.write_all(&chunk)
            .await
            .map_err(|e| AppError::ModelLoad(format!("Failed to write to file: {}", e)))?;

        if let Some(progress) = progress {
            if total_size > 0 {
                let percent = (downloaded * 100) / total_size;
                if percent > last_emit {
                    progress(percent);
                    last_emit = percent;
                }
            }
        }
    }
    file.flush()
        .await
        .map_err(|e| AppError::ModelLoad(format!("Failed to write to file: {}", e)))?;
    drop(file);

    tokio::fs::rename(&partial, dest).await.map_err(|e| {
        AppError::ModelLoad(format!("Failed to move {} into place: {}", dest.display(), e))
    })?;
    if let Some(progress) = progress {
        progress(100);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support;
    use axum::routing::get;
    use axum::Router;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[test]
    fn labels_follow_numeric_order() {
        let config = json!({ "id2label": { "10": "ten", "2": "two", "0": "zero" } });
        assert_eq!(parse_labels(&config).unwrap(), vec!["zero", "two", "ten"]);
    }

    #[test]
    fn labels_require_id2label() {
        assert!(matches!(
            parse_labels(&json!({ "label2id": {} })),
            Err(AppError::ModelLoad(_))
        ));
        assert!(matches!(
            parse_labels(&json!({ "id2label": { "x": "bad" } })),
            Err(AppError::ModelLoad(_))
        ));
    }

    #[tokio::test]
    async fn downloads_missing_artifacts_with_progress() {
        let body = vec![7u8; 4096];
        let served = body.clone();
        let base = test_support::serve(
            Router::new()
                .route("/config.json", get(|| async { r#"{"id2label":{"0":"tabby"}}"# }))
                .route("/model.onnx", get(move || {
                    let served = served.clone();
                    async move { served }
                })),
        )
        .await;

        let dir = tempfile::tempdir().unwrap();
        let config = ModelConfig {
            model_url: Some(format!("{}/model.onnx", base)),
            config_url: Some(format!("{}/config.json", base)),
            ..ModelConfig::default()
        };
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let loader = OnnxModelLoader::new(config, dir.path().join("models"))
            .with_progress(move |p| sink.lock().unwrap().push(p));

        assert!(!loader.is_downloaded());
        loader.download_model().await.unwrap();
        assert!(loader.is_downloaded());
        assert_eq!(std::fs::read(loader.model_path()).unwrap(), body);
        assert!(!loader.model_path().with_extension("part").exists());
        assert_eq!(seen.lock().unwrap().last(), Some(&100));
    }

    #[tokio::test]
    async fn unreachable_artifacts_are_model_load_failures() {
        let dir = tempfile::tempdir().unwrap();
        let config = ModelConfig {
            model_url: Some("http://127.0.0.1:9/model.onnx".to_string()),
            config_url: Some("http://127.0.0.1:9/config.json".to_string()),
            ..ModelConfig::default()
        };
        let loader = OnnxModelLoader::new(config, dir.path().to_path_buf()).with_runtime_check(|_, _| Ok(()));

        let err = loader.load().await.unwrap_err();
        assert!(matches!(err, AppError::ModelLoad(_)), "got {:?}", err);
        assert!(!loader.is_downloaded());
    }

    fn unavailable_backend(_: Backend, _: usize) -> Result<(), AppError> {
        Err(AppError::ModelLoad("no execution provider available".to_string()))
    }

    #[tokio::test]
    async fn runtime_failure_stops_before_any_download() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let base = test_support::serve(Router::new().fallback(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            async { r#"{"id2label":{"0":"tabby"}}"# }
        }))
        .await;

        let dir = tempfile::tempdir().unwrap();
        let config = ModelConfig {
            model_url: Some(format!("{}/model.onnx", base)),
            config_url: Some(format!("{}/config.json", base)),
            ..ModelConfig::default()
        };
        let loader = OnnxModelLoader::new(config, dir.path().to_path_buf())
            .with_runtime_check(unavailable_backend);

        let err = loader.load().await.unwrap_err();
        assert_eq!(err, AppError::ModelLoad("no execution provider available".to_string()));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert!(!loader.config_path().exists());
    }
}
