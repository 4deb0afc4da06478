use crate::models::session_types::RequestId;
use serde::ser::SerializeStruct;
use serde::Serialize;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ModelLoadFailure,
    ImageDecodeFailure,
    CrossOriginFailure,
    ClassificationFailure,
    Timeout,
    ModelNotReady,
    ModelAlreadyRequested,
    Superseded,
    Io,
    Config,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AppError {
    #[error("Failed to load model: {0}")]
    ModelLoad(String),

    #[error("Failed to decode image: {0}")]
    ImageDecode(String),

    #[error("Remote image is not readable: {0}")]
    CrossOrigin(String),

    #[error("Classification failed: {0}")]
    Classification(String),

    #[error("{stage} timed out after {}ms", .after.as_millis())]
    Timeout { stage: &'static str, after: Duration },

    #[error("Model is not ready")]
    ModelNotReady,

    #[error("Model loading was already requested for this session")]
    ModelAlreadyRequested,

    #[error("Request {0} was superseded by a newer one")]
    Superseded(RequestId),

    #[error("{0}")]
    Io(String),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl AppError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AppError::ModelLoad(_) => ErrorKind::ModelLoadFailure,
            AppError::ImageDecode(_) => ErrorKind::ImageDecodeFailure,
            AppError::CrossOrigin(_) => ErrorKind::CrossOriginFailure,
            AppError::Classification(_) => ErrorKind::ClassificationFailure,
            AppError::Timeout { .. } => ErrorKind::Timeout,
            AppError::ModelNotReady => ErrorKind::ModelNotReady,
            AppError::ModelAlreadyRequested => ErrorKind::ModelAlreadyRequested,
            AppError::Superseded(_) => ErrorKind::Superseded,
            AppError::Io(_) => ErrorKind::Io,
            AppError::Config(_) => ErrorKind::Config,
        }
    }
}

// The front end only needs a stable kind plus something readable.
impl Serialize for AppError {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("AppError", 2)?;
        state.serialize_field("kind", &self.kind())?;
        state.serialize_field("message", &self.to_string())?;
        state.end()
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::Io(err.to_string())
    }
}

impl From<image::ImageError> for AppError {
    fn from(err: image::ImageError) -> Self {
        AppError::ImageDecode(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_kind_and_message() {
        let err = AppError::CrossOrigin("HTTP 403 Forbidden".to_string());
        let value = serde_json::to_value(&err).unwrap();
        assert_eq!(value["kind"], "cross_origin_failure");
        assert_eq!(value["message"], "Remote image is not readable: HTTP 403 Forbidden");
    }

    #[test]
    fn timeout_message_names_stage() {
        let err = AppError::Timeout {
            stage: "Image decode",
            after: Duration::from_millis(250),
        };
        assert_eq!(err.to_string(), "Image decode timed out after 250ms");
        assert_eq!(err.kind(), ErrorKind::Timeout);
    }

    #[test]
    fn image_errors_become_decode_failures() {
        let err: AppError = image::load_from_memory(b"not an image").unwrap_err().into();
        assert_eq!(err.kind(), ErrorKind::ImageDecodeFailure);
    }
}
