use image::DynamicImage;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;

/// Where an image comes from. Consumed by acquisition.
#[derive(Debug, Clone)]
pub enum ImageSource {
    Path(PathBuf),
    Bytes { name: String, bytes: Vec<u8> },
    Url(String),
}

impl ImageSource {
    pub fn describe(&self) -> String {
        match self {
            ImageSource::Path(path) => path.display().to_string(),
            ImageSource::Bytes { name, bytes } => format!("{} ({} bytes)", name, bytes.len()),
            ImageSource::Url(url) => url.clone(),
        }
    }
}

#[derive(Debug, Serialize, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ImageOrigin {
    File { name: String },
    Remote { url: String },
}

/// A fully decoded image. Pixels are shared, so clones are cheap.
#[derive(Debug, Clone)]
pub struct DisplayableImage {
    pub pixels: Arc<DynamicImage>,
    pub width: u32,
    pub height: u32,
    /// Renderable source: a data URL for local payloads, the URL itself for remote ones.
    pub src: String,
    pub origin: ImageOrigin,
}

impl DisplayableImage {
    pub fn new(pixels: DynamicImage, src: String, origin: ImageOrigin) -> Self {
        Self {
            width: pixels.width(),
            height: pixels.height(),
            pixels: Arc::new(pixels),
            src,
            origin,
        }
    }

    pub fn info(&self) -> ImageInfo {
        ImageInfo {
            src: self.src.clone(),
            width: self.width,
            height: self.height,
            origin: self.origin.clone(),
        }
    }
}

#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct ImageInfo {
    /// Empty when the renderer already holds this image's source.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub src: String,
    pub width: u32,
    pub height: u32,
    pub origin: ImageOrigin,
}
