use crate::config::PipelineConfig;
use crate::error::AppError;
use crate::models::image_types::{DisplayableImage, ImageOrigin, ImageSource};
use base64::Engine;
use image::{DynamicImage, ImageReader};
use reqwest::StatusCode;
use std::io::Cursor;
use std::path::Path;
use std::time::Duration;

pub const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "gif", "bmp", "webp", "tiff", "tif", "ico"];

pub async fn acquire(
    client: &reqwest::Client,
    source: ImageSource,
    config: &PipelineConfig,
) -> Result<DisplayableImage, AppError> {
    match source {
        ImageSource::Path(path) => acquire_from_file(&path, config).await,
        ImageSource::Bytes { name, bytes } => acquire_from_bytes(name, bytes, config).await,
        ImageSource::Url(url) => acquire_from_url(client, &url, config).await,
    }
}

pub async fn acquire_from_file(path: &Path, config: &PipelineConfig) -> Result<DisplayableImage, AppError> {
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|e| AppError::ImageDecode(format!("Failed to read {}: {}", path.display(), e)))?;
    let name = path
        .file_name()
        .unwrap_or_default()
        .to_string_lossy()
        .to_string();
    acquire_from_bytes(name, bytes, config).await
}

/// Local payloads render from a data URL, like a file picked in a browser.
pub async fn acquire_from_bytes(
    name: String,
    bytes: Vec<u8>,
    config: &PipelineConfig,
) -> Result<DisplayableImage, AppError> {
    let src = data_url(&bytes)?;
    let pixels = decode_with_timeout(bytes, config.decode_timeout()).await?;
    Ok(DisplayableImage::new(pixels, src, ImageOrigin::File { name }))
}

pub async fn acquire_from_url(
    client: &reqwest::Client,
    url: &str,
    config: &PipelineConfig,
) -> Result<DisplayableImage, AppError> {
    let fetch_timeout = config.fetch_timeout();
    let bytes = tokio::time::timeout(fetch_timeout, fetch_bytes(client, url))
        .await
        .map_err(|_| AppError::Timeout {
            stage: "Image fetch",
            after: fetch_timeout,
        })??;

    let pixels = decode_with_timeout(bytes, config.decode_timeout()).await?;
    Ok(DisplayableImage::new(
        pixels,
        url.to_string(),
        ImageOrigin::Remote { url: url.to_string() },
    ))
}

async fn fetch_bytes(client: &reqwest::Client, url: &str) -> Result<Vec<u8>, AppError> {
    let response = client
        .get(url)
        .send()
        .await
        .map_err(|e| AppError::ImageDecode(format!("Failed to fetch {}: {}", url, e)))?;

    // The remote answered but will not let us read the pixels
    let status = response.status();
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return Err(AppError::CrossOrigin(format!("{} answered HTTP {}", url, status)));
    }
    if !status.is_success() {
        return Err(AppError::ImageDecode(format!("Failed to fetch {}: HTTP {}", url, status)));
    }

    let bytes = response
        .bytes()
        .await
        .map_err(|e| AppError::ImageDecode(format!("Failed to read body of {}: {}", url, e)))?;
    Ok(bytes.to_vec())
}

async fn decode_with_timeout(bytes: Vec<u8>, after: Duration) -> Result<DynamicImage, AppError> {
    let task = tokio::task::spawn_blocking(move || decode_image(&bytes));
    match tokio::time::timeout(after, task).await {
        Err(_) => Err(AppError::Timeout {
            stage: "Image decode",
            after,
        }),
        Ok(Err(e)) => Err(AppError::ImageDecode(format!("Decode task failed: {}", e))),
        Ok(Ok(result)) => result,
    }
}

/// Full decode, with EXIF orientation applied so pixels match what is displayed.
pub fn decode_image(bytes: &[u8]) -> Result<DynamicImage, AppError> {
    let img = ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .map_err(|e| AppError::ImageDecode(e.to_string()))?
        .decode()?;

    let orientation = read_exif_orientation(bytes);
    Ok(apply_orientation(img, orientation))
}

fn data_url(bytes: &[u8]) -> Result<String, AppError> {
    let format = image::guess_format(bytes)?;
    let b64 = base64::engine::general_purpose::STANDARD.encode(bytes);
    Ok(format!("data:{};base64,{}", format.to_mime_type(), b64))
}

/// Orientation defaults to 1 if the payload carries no EXIF block.
fn read_exif_orientation(bytes: &[u8]) -> u32 {
    let exif = match exif::Reader::new().read_from_container(&mut Cursor::new(bytes)) {
        Ok(e) => e,
        Err(_) => return 1,
    };

    match exif.get_field(exif::Tag::Orientation, exif::In::PRIMARY) {
        Some(field) => match field.value {
            exif::Value::Short(ref v) => *v.first().unwrap_or(&1) as u32,
            exif::Value::Long(ref v) => *v.first().unwrap_or(&1),
            _ => 1,
        },
        None => 1,
    }
}

fn apply_orientation(img: DynamicImage, orientation: u32) -> DynamicImage {
    match orientation {
        2 => img.fliph(),
        3 => img.rotate180(),
        4 => img.flipv(),
        5 => img.fliph().rotate90(),
        6 => img.rotate90(),
        7 => img.fliph().rotate270(),
        8 => img.rotate270(),
        _ => img,
    }
}
