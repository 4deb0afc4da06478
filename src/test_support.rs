//! Fakes and fixtures shared by unit tests.

use crate::error::AppError;
use crate::models::classify_types::{ModelInfo, Prediction, PredictionList};
use crate::services::classifier::{Classifier, ModelHandle, ModelLoader};
use futures::future::BoxFuture;
use futures::FutureExt;
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use std::collections::HashMap;
use std::io::Cursor;
use std::sync::{mpsc, Mutex};
use tokio::sync::oneshot;

pub fn png_bytes(width: u32, height: u32) -> Vec<u8> {
    let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(width, height, Rgb([200, 120, 40])));
    let mut buffer = Cursor::new(Vec::new());
    img.write_to(&mut buffer, ImageFormat::Png).unwrap();
    buffer.into_inner()
}

/// A JPEG whose EXIF block carries `orientation`, as phone cameras write them.
pub fn jpeg_with_orientation(width: u32, height: u32, orientation: u16) -> Vec<u8> {
    let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(width, height, Rgb([90, 160, 30])));
    let mut buffer = Cursor::new(Vec::new());
    img.write_to(&mut buffer, ImageFormat::Jpeg).unwrap();
    let jpeg = buffer.into_inner();

    // Little-endian TIFF header, one IFD entry: Orientation (0x0112), SHORT, count 1
    let mut tiff = vec![b'I', b'I', 0x2A, 0x00, 0x08, 0x00, 0x00, 0x00, 0x01, 0x00];
    tiff.extend_from_slice(&[0x12, 0x01, 0x03, 0x00, 0x01, 0x00, 0x00, 0x00]);
    tiff.extend_from_slice(&orientation.to_le_bytes());
    tiff.extend_from_slice(&[0x00, 0x00, 0x00, 0x00, 0x00, 0x00]);

    let mut app1 = b"Exif\0\0".to_vec();
    app1.extend_from_slice(&tiff);
    let length = (app1.len() + 2) as u16;

    let mut out = jpeg[..2].to_vec();
    out.extend_from_slice(&[0xFF, 0xE1]);
    out.extend_from_slice(&length.to_be_bytes());
    out.extend_from_slice(&app1);
    out.extend_from_slice(&jpeg[2..]);
    out
}

/// Serves `router` on an ephemeral local port and returns its base URL.
pub async fn serve(router: axum::Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{}", addr)
}

/// Labels every image `width-<w>` so tests can tell which acquisition a result belongs to.
/// Images of a gated width block until the gate's sender fires or is dropped.
#[derive(Default)]
pub struct FakeClassifier {
    gates: Mutex<HashMap<u32, mpsc::Receiver<()>>>,
    failing_width: Option<u32>,
}

impl FakeClassifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_on(width: u32) -> Self {
        Self {
            failing_width: Some(width),
            ..Self::default()
        }
    }

    pub fn gate(&self, width: u32) -> mpsc::Sender<()> {
        let (tx, rx) = mpsc::channel();
        self.gates.lock().unwrap().insert(width, rx);
        tx
    }
}

impl Classifier for FakeClassifier {
    fn classify(&self, image: &DynamicImage) -> Result<PredictionList, AppError> {
        let width = image.width();
        let gate = self.gates.lock().unwrap().remove(&width);
        if let Some(gate) = gate {
            let _ = gate.recv();
        }
        if self.failing_width == Some(width) {
            return Err(AppError::Classification(format!("cannot classify width {}", width)));
        }
        Ok(vec![
            Prediction::new(format!("width-{}", width), 0.7),
            Prediction::new("golden retriever", 0.2),
            Prediction::new("tennis ball", 0.1),
        ])
    }
}

pub fn fake_info() -> ModelInfo {
    ModelInfo {
        name: "fake".to_string(),
        backend: "cpu".to_string(),
    }
}

/// Hands out a prepared result, optionally after a gate opens.
pub struct FakeLoader {
    result: Mutex<Option<Result<ModelHandle, AppError>>>,
    gate: Mutex<Option<oneshot::Receiver<()>>>,
}

impl FakeLoader {
    pub fn ready(handle: ModelHandle) -> Self {
        Self {
            result: Mutex::new(Some(Ok(handle))),
            gate: Mutex::new(None),
        }
    }

    pub fn failing(error: AppError) -> Self {
        Self {
            result: Mutex::new(Some(Err(error))),
            gate: Mutex::new(None),
        }
    }

    pub fn gated(handle: ModelHandle) -> (Self, oneshot::Sender<()>) {
        let (tx, rx) = oneshot::channel();
        let loader = Self {
            result: Mutex::new(Some(Ok(handle))),
            gate: Mutex::new(Some(rx)),
        };
        (loader, tx)
    }
}

impl ModelLoader for FakeLoader {
    fn load(&self) -> BoxFuture<'_, Result<ModelHandle, AppError>> {
        async move {
            let gate = self.gate.lock().unwrap().take();
            if let Some(gate) = gate {
                let _ = gate.await;
            }
            self.result
                .lock()
                .unwrap()
                .take()
                .unwrap_or_else(|| Err(AppError::ModelLoad("loader used twice".to_string())))
        }
        .boxed()
    }
}
