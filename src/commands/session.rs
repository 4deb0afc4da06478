use crate::error::AppError;
use crate::models::classify_types::PredictionList;
use crate::models::image_types::ImageSource;
use crate::models::session_types::{Outcome, SessionSnapshot};
use crate::services::acquisition::IMAGE_EXTENSIONS;
use crate::services::session::Session;
use std::path::PathBuf;
use tauri::{AppHandle, State};
use tauri_plugin_dialog::DialogExt;

#[tauri::command]
pub fn get_session_state(session: State<'_, Session>) -> SessionSnapshot {
    session.snapshot()
}

/// Opens the platform file picker. Cancelling it changes nothing.
#[tauri::command]
pub async fn select_image(app: AppHandle, session: State<'_, Session>) -> Result<Option<Outcome>, AppError> {
    if session.model().is_none() {
        return Ok(None);
    }

    let (tx, rx) = tokio::sync::oneshot::channel();
    app.dialog()
        .file()
        .add_filter("Images", IMAGE_EXTENSIONS)
        .pick_file(move |picked| {
            let _ = tx.send(picked);
        });

    let path = rx
        .await
        .ok()
        .flatten()
        .and_then(|picked| picked.into_path().ok());
    session.submit(path.map(ImageSource::Path)).await
}

#[tauri::command]
pub async fn classify_path(session: State<'_, Session>, path: String) -> Result<Option<Outcome>, AppError> {
    session.submit(Some(ImageSource::Path(PathBuf::from(path)))).await
}

/// For payloads the front end already holds, e.g. a dropped file.
#[tauri::command]
pub async fn classify_bytes(
    session: State<'_, Session>,
    name: String,
    bytes: Vec<u8>,
) -> Result<Option<Outcome>, AppError> {
    session.submit(Some(ImageSource::Bytes { name, bytes })).await
}

#[tauri::command]
pub async fn load_demo_image(session: State<'_, Session>) -> Result<Option<Outcome>, AppError> {
    let url = session.config().demo_image_url.clone();
    session.submit(Some(ImageSource::Url(url))).await
}

#[tauri::command]
pub async fn classify_current(session: State<'_, Session>) -> Result<Option<PredictionList>, AppError> {
    match session.current() {
        Some(current) => session.classify(&current).await.map(Some),
        None => Ok(None),
    }
}
