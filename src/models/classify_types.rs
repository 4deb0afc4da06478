use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Prediction {
    pub class_name: String,
    pub confidence: f32,
}

impl Prediction {
    pub fn new(class_name: impl Into<String>, confidence: f32) -> Self {
        Self {
            class_name: class_name.into(),
            confidence,
        }
    }
}

/// Ordered by non-increasing confidence. The classifier owns that ordering;
/// nothing downstream re-sorts it.
pub type PredictionList = Vec<Prediction>;

#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct ModelInfo {
    pub name: String,
    pub backend: String,
}
