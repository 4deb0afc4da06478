use crate::error::AppError;
use crate::services::classifier::model_manager::ModelType;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

pub const CONFIG_FILE_NAME: &str = "config.json";

const ENV_MODEL_DIR: &str = "IMAGE_RECOGNIZER_MODEL_DIR";
const ENV_BACKEND: &str = "IMAGE_RECOGNIZER_BACKEND";
const ENV_DEMO_URL: &str = "IMAGE_RECOGNIZER_DEMO_URL";

const DEMO_IMAGE_URL: &str = "https://images.unsplash.com/photo-1517849845537-4d257902454a?q=80&w=800";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Try GPU execution providers first, fall back to CPU.
    Gpu,
    Cpu,
}

impl Backend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Backend::Gpu => "gpu",
            Backend::Cpu => "cpu",
        }
    }
}

impl FromStr for Backend {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "gpu" => Ok(Backend::Gpu),
            "cpu" => Ok(Backend::Cpu),
            other => Err(AppError::Config(format!("unknown backend '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub model_type: ModelType,
    /// Where artifacts are cached. Defaults to `<app data>/models`.
    pub model_dir: Option<PathBuf>,
    pub backend: Backend,
    pub top_k: usize,
    pub intra_threads: usize,
    pub model_url: Option<String>,
    pub config_url: Option<String>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            model_type: ModelType::MobileNetV2,
            model_dir: None,
            backend: Backend::Gpu,
            top_k: 3,
            intra_threads: 4,
            model_url: None,
            config_url: None,
        }
    }
}

impl ModelConfig {
    pub fn resolve_dir(&self, app_data_dir: &Path) -> PathBuf {
        self.model_dir
            .clone()
            .unwrap_or_else(|| app_data_dir.join("models"))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub demo_image_url: String,
    /// Run classification as soon as an acquisition decodes.
    pub auto_classify: bool,
    pub fetch_timeout_ms: u64,
    pub decode_timeout_ms: u64,
    pub classify_timeout_ms: u64,
    pub model_load_timeout_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            demo_image_url: DEMO_IMAGE_URL.to_string(),
            auto_classify: true,
            fetch_timeout_ms: 15_000,
            decode_timeout_ms: 10_000,
            classify_timeout_ms: 30_000,
            model_load_timeout_secs: 600,
        }
    }
}

impl PipelineConfig {
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }

    pub fn decode_timeout(&self) -> Duration {
        Duration::from_millis(self.decode_timeout_ms)
    }

    pub fn classify_timeout(&self) -> Duration {
        Duration::from_millis(self.classify_timeout_ms)
    }

    pub fn model_load_timeout(&self) -> Duration {
        Duration::from_secs(self.model_load_timeout_secs)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub model: ModelConfig,
    pub pipeline: PipelineConfig,
}

impl AppConfig {
    /// Reads `config.json` from `dir` if present, then applies environment overrides.
    pub fn load(dir: &Path) -> Result<Self, AppError> {
        let path = dir.join(CONFIG_FILE_NAME);
        let config = if path.exists() {
            let content = std::fs::read_to_string(&path).map_err(|e| {
                AppError::Config(format!("Failed to read {}: {}", path.display(), e))
            })?;
            serde_json::from_str(&content).map_err(|e| {
                AppError::Config(format!("Failed to parse {}: {}", path.display(), e))
            })?
        } else {
            log::info!("No {} found, using defaults", path.display());
            AppConfig::default()
        };

        config.with_overrides(|key| std::env::var(key).ok())
    }

    pub fn with_overrides<F>(mut self, lookup: F) -> Result<Self, AppError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = lookup(ENV_MODEL_DIR) {
            self.model.model_dir = Some(PathBuf::from(dir));
        }
        if let Some(backend) = lookup(ENV_BACKEND) {
            self.model.backend = backend.parse()?;
        }
        if let Some(url) = lookup(ENV_DEMO_URL) {
            self.pipeline.demo_image_url = url;
        }
        self.validate()?;
        Ok(self)
    }

    fn validate(&self) -> Result<(), AppError> {
        if self.model.top_k == 0 {
            return Err(AppError::Config("model.top_k must be at least 1".to_string()));
        }
        if self.model.intra_threads == 0 {
            return Err(AppError::Config("model.intra_threads must be at least 1".to_string()));
        }
        Ok(())
    }
}
