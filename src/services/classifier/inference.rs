use crate::error::AppError;
use crate::models::classify_types::{Prediction, PredictionList};
use crate::services::classifier::Classifier;
use image::DynamicImage;
use ndarray::Array4;
use ort::session::Session as OrtSession;
use ort::value::Value;
use std::sync::Mutex;

/// How a model expects its input tensor to be prepared.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Preprocess {
    pub crop_size: u32,
    pub crop_pct: f32,
    pub mean: [f32; 3],
    pub std: [f32; 3],
}

pub fn preprocess_image(img: &DynamicImage, pre: &Preprocess) -> Result<Array4<f32>, AppError> {
    let crop_size = pre.crop_size;
    if img.width() == 0 || img.height() == 0 {
        return Err(AppError::Classification("Image has no pixels".to_string()));
    }

    // Same region as resizing the shortest edge to ceil(crop_size / crop_pct) and
    // center cropping, but cut from the source first so the buffer never exceeds crop_size²
    let resize_size = (crop_size as f32 / pre.crop_pct).ceil() as u32;
    let (w, h) = (img.width(), img.height());
    let side = ((w.min(h) as f32 * crop_size as f32 / resize_size as f32).round() as u32).clamp(1, w.min(h));
    let cropped = img.crop_imm((w - side) / 2, (h - side) / 2, side, side);
    let rgb = cropped
        .resize_exact(crop_size, crop_size, image::imageops::FilterType::Triangle)
        .to_rgb8();

    // HWC bytes -> normalized CHW planes
    let hw = (crop_size * crop_size) as usize;
    let mut data = vec![0f32; 3 * hw];
    for (i, pixel) in rgb.into_raw().chunks_exact(3).enumerate() {
        for c in 0..3 {
            data[c * hw + i] = (pixel[c] as f32 / 255.0 - pre.mean[c]) / pre.std[c];
        }
    }

    Array4::from_shape_vec((1, 3, crop_size as usize, crop_size as usize), data)
        .map_err(|e| AppError::Classification(format!("Failed to create tensor: {}", e)))
}

/// Softmax over raw logits, then the `top_k` most likely labels.
pub fn top_k_predictions(logits: &[f32], labels: &[String], top_k: usize) -> PredictionList {
    let max_logit = logits.iter().fold(f32::NEG_INFINITY, |a, &b| a.max(b));
    let exp_sum: f32 = logits.iter().map(|&x| (x - max_logit).exp()).sum();

    let mut indexed: Vec<(usize, f32)> = logits
        .iter()
        .map(|&x| (x - max_logit).exp() / exp_sum)
        .enumerate()
        .collect();
    indexed.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    indexed.truncate(top_k);

    indexed
        .into_iter()
        .map(|(idx, conf)| {
            let class_name = labels
                .get(idx)
                .cloned()
                .unwrap_or_else(|| format!("class_{}", idx));
            Prediction::new(class_name, conf)
        })
        .collect()
}

pub fn run_inference_with_model(
    model: &mut OrtSession,
    input: Array4<f32>,
    labels: &[String],
    top_k: usize,
) -> Result<PredictionList, AppError> {
    let input_name = model
        .inputs()
        .first()
        .map(|input| input.name().to_string())
        .ok_or_else(|| AppError::Classification("Model declares no inputs".to_string()))?;

    let input_tensor = Value::from_array(input)
        .map_err(|e| AppError::Classification(format!("Failed to create tensor value: {}", e)))?;

    let outputs = model
        .run(ort::inputs![input_name.as_str() => input_tensor])
        .map_err(|e| AppError::Classification(format!("Inference failed: {}", e)))?;

    let output_value = outputs
        .values()
        .next()
        .ok_or_else(|| AppError::Classification("Model produced no outputs".to_string()))?;

    let (_, logits) = output_value
        .try_extract_tensor::<f32>()
        .map_err(|e| AppError::Classification(format!("Failed to extract output tensor: {}", e)))?;

    Ok(top_k_predictions(logits, labels, top_k))
}

/// ONNX Runtime backed classifier. The session needs `&mut` to run, so calls serialize on the lock.
pub struct OnnxClassifier {
    session: Mutex<OrtSession>,
    labels: Vec<String>,
    preprocess: Preprocess,
    top_k: usize,
}

impl OnnxClassifier {
    pub fn new(session: OrtSession, labels: Vec<String>, preprocess: Preprocess, top_k: usize) -> Self {
        Self {
            session: Mutex::new(session),
            labels,
            preprocess,
            top_k,
        }
    }
}

impl Classifier for OnnxClassifier {
    fn classify(&self, image: &DynamicImage) -> Result<PredictionList, AppError> {
        let tensor = preprocess_image(image, &self.preprocess)?;
        let mut session = self
            .session
            .lock()
            .map_err(|_| AppError::Classification("Model session lock poisoned".to_string()))?;
        run_inference_with_model(&mut session, tensor, &self.labels, self.top_k)
    }
}
