use crate::config::PipelineConfig;
use crate::error::AppError;
use crate::models::classify_types::{ModelInfo, PredictionList};
use crate::models::image_types::ImageSource;
use crate::models::session_types::{
    Acquired, ImageState, ModelState, Outcome, PredictionState, RequestId, SessionSnapshot,
    SessionState,
};
use crate::services::acquisition;
use crate::services::classifier::{ModelHandle, ModelLoader};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use tokio::task::AbortHandle;

/// Sole writer of [`SessionState`].
///
/// Every acquisition is tagged with a [`RequestId`]. Results that come back for anything
/// other than the latest id are dropped, so the displayed predictions always belong to the
/// displayed image no matter in which order decode and inference complete.
#[derive(Clone)]
pub struct Session {
    inner: Arc<Inner>,
}

struct Inner {
    state: Mutex<SessionState>,
    latest: AtomicU64,
    in_flight: Mutex<Option<AbortHandle>>,
    updates: watch::Sender<SessionSnapshot>,
    config: PipelineConfig,
    client: reqwest::Client,
}

impl Session {
    pub fn new(config: PipelineConfig) -> Result<Self, AppError> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.fetch_timeout())
            .build()
            .map_err(|e| AppError::Config(format!("Failed to build HTTP client: {}", e)))?;
        let (updates, _) = watch::channel(SessionSnapshot::default());

        Ok(Self {
            inner: Arc::new(Inner {
                state: Mutex::new(SessionState::default()),
                latest: AtomicU64::new(0),
                in_flight: Mutex::new(None),
                updates,
                config,
                client,
            }),
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.inner.config
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.state().snapshot()
    }

    /// Receives a fresh snapshot after every state transition.
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.inner.updates.subscribe()
    }

    pub fn model(&self) -> Option<ModelHandle> {
        self.state().model_handle().cloned()
    }

    /// The displayed image, ready to be classified again.
    pub fn current(&self) -> Option<Acquired> {
        match &self.state().image {
            ImageState::Decoded { request, image } => Some(Acquired {
                request: *request,
                image: image.clone(),
            }),
            _ => None,
        }
    }

    fn state(&self) -> MutexGuard<'_, SessionState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // Called with the state lock held so subscribers see transitions in order.
    fn publish(&self, state: &SessionState) {
        self.inner.updates.send_replace(state.snapshot());
    }

    fn next_request(&self) -> RequestId {
        RequestId(self.inner.latest.fetch_add(1, Ordering::SeqCst) + 1)
    }

    fn is_latest(&self, request: RequestId) -> bool {
        self.inner.latest.load(Ordering::SeqCst) == request.0
    }

    /// Loads the classifier. Only the first call does anything; a failure is final.
    pub async fn load_model<L: ModelLoader + ?Sized>(&self, loader: &L) -> Result<ModelInfo, AppError> {
        {
            let mut state = self.state();
            if !matches!(state.model, ModelState::Idle) {
                return Err(AppError::ModelAlreadyRequested);
            }
            state.model = ModelState::Loading;
            self.publish(&state);
        }

        log::info!("Loading model");
        let after = self.inner.config.model_load_timeout();
        let result = match tokio::time::timeout(after, loader.load()).await {
            Ok(result) => result,
            Err(_) => Err(AppError::Timeout {
                stage: "Model load",
                after,
            }),
        };

        let mut state = self.state();
        match result {
            Ok(handle) => {
                let info = handle.info().clone();
                log::info!("Model {} ready ({} backend)", info.name, info.backend);
                state.model = ModelState::Ready(handle);
                self.publish(&state);
                Ok(info)
            }
            Err(error) => {
                log::error!("Failed to load model: {}", error);
                state.model = ModelState::Failed(error.clone());
                self.publish(&state);
                Err(error)
            }
        }
    }

    // A missing selection or a model that is not ready yet is a no-op, not an error.
    fn admit(&self, source: Option<ImageSource>) -> Option<ImageSource> {
        let Some(source) = source else {
            log::debug!("No image selected");
            return None;
        };
        if self.model().is_none() {
            log::debug!("Model not ready, ignoring {}", source.describe());
            return None;
        }
        Some(source)
    }

    /// Decodes `source` and makes it the displayed image without classifying it.
    ///
    /// Returns `Ok(None)` when there is nothing to do.
    pub async fn acquire(&self, source: Option<ImageSource>) -> Result<Option<Acquired>, AppError> {
        let Some(source) = self.admit(source) else {
            return Ok(None);
        };
        let request = self.next_request();
        self.acquire_as(request, source).await.map(Some)
    }

    async fn acquire_as(&self, request: RequestId, source: ImageSource) -> Result<Acquired, AppError> {
        {
            let mut state = self.state();
            if !self.is_latest(request) {
                return Err(AppError::Superseded(request));
            }
            state.image = ImageState::Acquiring(request);
            state.predictions = PredictionState::Empty;
            self.publish(&state);
        }

        log::info!("Request {}: acquiring {}", request, source.describe());
        let result = acquisition::acquire(&self.inner.client, source, &self.inner.config).await;

        let mut state = self.state();
        if !self.is_latest(request) {
            log::debug!("Request {}: dropping stale image", request);
            return Err(AppError::Superseded(request));
        }
        match result {
            Ok(image) => {
                log::info!("Request {}: decoded {}x{}", request, image.width, image.height);
                state.image = ImageState::Decoded {
                    request,
                    image: image.clone(),
                };
                self.publish(&state);
                Ok(Acquired { request, image })
            }
            Err(error) => {
                log::warn!("Request {}: {}", request, error);
                state.image = ImageState::Failed {
                    request,
                    error: error.clone(),
                };
                self.publish(&state);
                Err(error)
            }
        }
    }

    /// Runs the classifier on the displayed image of `acquired.request` and, if it is still
    /// displayed afterwards, replaces the prediction list.
    pub async fn classify(&self, acquired: &Acquired) -> Result<PredictionList, AppError> {
        let request = acquired.request;
        let (handle, pixels) = {
            let mut state = self.state();
            let handle = state.model_handle().cloned().ok_or(AppError::ModelNotReady)?;
            let pixels = match state.decoded_for(request) {
                Some(image) if self.is_latest(request) => image.pixels.clone(),
                _ => return Err(AppError::Superseded(request)),
            };
            state.predictions = PredictionState::Classifying(request);
            self.publish(&state);
            (handle, pixels)
        };

        let after = self.inner.config.classify_timeout();
        let task = tokio::task::spawn_blocking(move || handle.classify(&pixels));
        let result = match tokio::time::timeout(after, task).await {
            Err(_) => Err(AppError::Timeout {
                stage: "Classification",
                after,
            }),
            Ok(Err(e)) => Err(AppError::Classification(format!("Classification task failed: {}", e))),
            Ok(Ok(result)) => result,
        };

        let mut state = self.state();
        if !self.is_latest(request) || state.decoded_for(request).is_none() {
            log::debug!("Request {}: dropping stale predictions", request);
            return Err(AppError::Superseded(request));
        }
        match result {
            Ok(predictions) => {
                if let Some(top) = predictions.first() {
                    log::info!(
                        "Request {}: {} ({:.1}%)",
                        request,
                        top.class_name,
                        top.confidence * 100.0
                    );
                }
                state.predictions = PredictionState::Ready {
                    request,
                    predictions: predictions.clone(),
                };
                self.publish(&state);
                Ok(predictions)
            }
            Err(error) => {
                log::warn!("Request {}: {}", request, error);
                state.predictions = PredictionState::Failed {
                    request,
                    error: error.clone(),
                };
                self.publish(&state);
                Err(error)
            }
        }
    }

    /// Acquire then, when `auto_classify` is on, classify. A newer submission aborts
    /// this one, which then resolves to [`AppError::Superseded`].
    pub async fn submit(&self, source: Option<ImageSource>) -> Result<Option<Outcome>, AppError> {
        let Some(source) = self.admit(source) else {
            return Ok(None);
        };

        let (request, task) = {
            let mut in_flight = self.inner.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
            let request = self.next_request();
            let session = self.clone();
            let task = tokio::spawn(async move { session.run_chain(request, source).await });
            if let Some(previous) = in_flight.replace(task.abort_handle()) {
                previous.abort();
            }
            (request, task)
        };

        match task.await {
            Ok(result) => result.map(Some),
            Err(e) if e.is_cancelled() => {
                log::debug!("Request {}: cancelled by a newer request", request);
                Err(AppError::Superseded(request))
            }
            Err(e) => Err(AppError::Classification(format!("Pipeline task failed: {}", e))),
        }
    }

    async fn run_chain(&self, request: RequestId, source: ImageSource) -> Result<Outcome, AppError> {
        let acquired = self.acquire_as(request, source).await?;
        let predictions = if self.inner.config.auto_classify {
            Some(self.classify(&acquired).await?)
        } else {
            None
        };
        Ok(Outcome {
            request,
            image: acquired.image.info(),
            predictions,
        })
    }
}
