pub mod inference;
pub mod model_manager;

use crate::error::AppError;
use crate::models::classify_types::{ModelInfo, PredictionList};
use futures::future::BoxFuture;
use image::DynamicImage;
use std::fmt;
use std::sync::Arc;

/// Maps a decoded image to labels ordered by descending confidence.
///
/// Implementations are synchronous; the session runs them on a blocking thread.
pub trait Classifier: Send + Sync {
    fn classify(&self, image: &DynamicImage) -> Result<PredictionList, AppError>;
}

impl<T: Classifier + ?Sized> Classifier for Arc<T> {
    fn classify(&self, image: &DynamicImage) -> Result<PredictionList, AppError> {
        (**self).classify(image)
    }
}

/// Produces a ready classifier. Called at most once per session.
pub trait ModelLoader: Send + Sync {
    fn load(&self) -> BoxFuture<'_, Result<ModelHandle, AppError>>;
}

/// Loaded classifier plus what it is. Never mutated after creation.
#[derive(Clone)]
pub struct ModelHandle {
    classifier: Arc<dyn Classifier>,
    info: ModelInfo,
}

impl ModelHandle {
    pub fn new(classifier: impl Classifier + 'static, info: ModelInfo) -> Self {
        Self {
            classifier: Arc::new(classifier),
            info,
        }
    }

    pub fn info(&self) -> &ModelInfo {
        &self.info
    }

    pub fn classify(&self, image: &DynamicImage) -> Result<PredictionList, AppError> {
        self.classifier.classify(image)
    }
}

impl fmt::Debug for ModelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelHandle").field("info", &self.info).finish()
    }
}
