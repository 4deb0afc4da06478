use crate::error::AppError;
use crate::models::classify_types::{Prediction, PredictionList};
use crate::models::image_types::{DisplayableImage, ImageInfo};
use crate::services::classifier::ModelHandle;
use serde::Serialize;
use std::fmt;

/// Generation number attached to every acquisition. Strictly increasing per session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct RequestId(pub u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone)]
pub enum ModelState {
    Idle,
    Loading,
    Ready(ModelHandle),
    Failed(AppError),
}

#[derive(Debug, Clone)]
pub enum ImageState {
    Empty,
    Acquiring(RequestId),
    Decoded {
        request: RequestId,
        image: DisplayableImage,
    },
    Failed {
        request: RequestId,
        error: AppError,
    },
}

#[derive(Debug, Clone)]
pub enum PredictionState {
    Empty,
    Classifying(RequestId),
    Ready {
        request: RequestId,
        predictions: PredictionList,
    },
    Failed {
        request: RequestId,
        error: AppError,
    },
}

#[derive(Debug, Clone)]
pub struct SessionState {
    pub model: ModelState,
    pub image: ImageState,
    pub predictions: PredictionState,
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            model: ModelState::Idle,
            image: ImageState::Empty,
            predictions: PredictionState::Empty,
        }
    }
}

impl SessionState {
    pub fn model_handle(&self) -> Option<&ModelHandle> {
        match &self.model {
            ModelState::Ready(handle) => Some(handle),
            _ => None,
        }
    }

    /// The displayed image, if the given request is the one that produced it.
    pub fn decoded_for(&self, request: RequestId) -> Option<&DisplayableImage> {
        match &self.image {
            ImageState::Decoded { request: r, image } if *r == request => Some(image),
            _ => None,
        }
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let (current_image, image_request, image_error) = match &self.image {
            ImageState::Empty => (None, None, None),
            ImageState::Acquiring(request) => (None, Some(*request), None),
            ImageState::Decoded { request, image } => (Some(image.info()), Some(*request), None),
            ImageState::Failed { request, error } => (None, Some(*request), Some(error.clone())),
        };

        let (predictions, prediction_error) = match &self.predictions {
            PredictionState::Ready { request, predictions }
                if current_image.is_some() && image_request == Some(*request) =>
            {
                (predictions.clone(), None)
            }
            PredictionState::Failed { request, error } if image_request == Some(*request) => {
                (Vec::new(), Some(error.clone()))
            }
            _ => (Vec::new(), None),
        };

        let model_error = match &self.model {
            ModelState::Failed(error) => Some(error.clone()),
            _ => None,
        };

        SessionSnapshot {
            loading: matches!(self.model, ModelState::Loading),
            model_ready: matches!(self.model, ModelState::Ready(_)),
            model_error,
            busy: matches!(self.image, ImageState::Acquiring(_))
                || matches!(self.predictions, PredictionState::Classifying(_)),
            request: image_request,
            current_image,
            predictions,
            error: image_error.or(prediction_error),
        }
    }
}

/// What the presentation layer renders. Published after every transition.
#[derive(Debug, Serialize, Clone, PartialEq, Default)]
pub struct SessionSnapshot {
    pub loading: bool,
    pub model_ready: bool,
    pub model_error: Option<AppError>,
    pub busy: bool,
    pub request: Option<RequestId>,
    pub current_image: Option<ImageInfo>,
    pub predictions: Vec<Prediction>,
    pub error: Option<AppError>,
}

impl SessionSnapshot {
    /// Clears the image source if `shown` is the request whose image was last sent with it.
    /// Updates `shown` to the request of the image in this snapshot.
    pub fn without_repeated_src(mut self, shown: &mut Option<RequestId>) -> Self {
        let request = self.current_image.as_ref().and(self.request);
        if request.is_some() && request == *shown {
            if let Some(image) = self.current_image.as_mut() {
                image.src.clear();
            }
        }
        *shown = request;
        self
    }
}

/// A decoded image together with the request that produced it.
#[derive(Debug, Clone)]
pub struct Acquired {
    pub request: RequestId,
    pub image: DisplayableImage,
}

/// Result of one orchestrated acquisition (and classification, when coupled).
#[derive(Debug, Serialize, Clone)]
pub struct Outcome {
    pub request: RequestId,
    pub image: ImageInfo,
    pub predictions: Option<PredictionList>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::image_types::ImageOrigin;
    use image::DynamicImage;

    fn displaying(request: u64, predictions: PredictionState) -> SessionState {
        SessionState {
            model: ModelState::Idle,
            image: ImageState::Decoded {
                request: RequestId(request),
                image: DisplayableImage::new(
                    DynamicImage::new_rgb8(3, 2),
                    "data:image/png;base64,AAAA".to_string(),
                    ImageOrigin::File { name: "cat.png".into() },
                ),
            },
            predictions,
        }
    }

    #[test]
    fn snapshot_hides_predictions_of_other_images() {
        let stale = PredictionState::Ready {
            request: RequestId(1),
            predictions: vec![Prediction::new("tabby", 0.9)],
        };
        assert!(displaying(2, stale.clone()).snapshot().predictions.is_empty());
        assert_eq!(displaying(1, stale).snapshot().predictions.len(), 1);
    }

    #[test]
    fn image_source_is_sent_once_per_request() {
        let mut shown = None;

        let first = displaying(1, PredictionState::Classifying(RequestId(1))).snapshot();
        let sent = first.clone().without_repeated_src(&mut shown);
        assert_eq!(sent, first);

        let ready = displaying(1, PredictionState::Empty).snapshot().without_repeated_src(&mut shown);
        let info = ready.current_image.unwrap();
        assert!(info.src.is_empty());
        assert!(serde_json::to_value(&info).unwrap().get("src").is_none());

        let next = displaying(2, PredictionState::Empty).snapshot().without_repeated_src(&mut shown);
        assert!(!next.current_image.unwrap().src.is_empty());
        assert_eq!(shown, Some(RequestId(2)));

        // Image gone, then the same request shows again: resend
        SessionSnapshot::default().without_repeated_src(&mut shown);
        let again = displaying(2, PredictionState::Empty).snapshot().without_repeated_src(&mut shown);
        assert!(!again.current_image.unwrap().src.is_empty());
    }
}
