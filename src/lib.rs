#[cfg(feature = "desktop")]
mod commands;
pub mod config;
pub mod error;
pub mod models;
pub mod services;
#[cfg(test)]
mod test_support;

pub use config::AppConfig;
pub use error::{AppError, ErrorKind};
pub use services::session::Session;

/// `RUST_LOG` wins; otherwise everything at `info` and above.
pub fn init_logging() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).try_init();
}

#[cfg(feature = "desktop")]
#[cfg_attr(mobile, tauri::mobile_entry_point)]
pub fn run() {
    use services::classifier::model_manager::OnnxModelLoader;
    use tauri::{Emitter, Manager};

    init_logging();

    tauri::Builder::default()
        .plugin(tauri_plugin_dialog::init())
        .setup(|app| {
            let app_data_dir = app.path().app_data_dir()?;
            std::fs::create_dir_all(&app_data_dir)?;

            let config = AppConfig::load(&app_data_dir)?;
            let session = Session::new(config.pipeline.clone())?;
            app.manage(session.clone());

            // Forward every transition to the front end
            let mut updates = session.subscribe();
            let app_handle = app.handle().clone();
            tauri::async_runtime::spawn(async move {
                let mut shown = None;
                while updates.changed().await.is_ok() {
                    let snapshot = updates.borrow_and_update().clone().without_repeated_src(&mut shown);
                    let _ = app_handle.emit("session-changed", snapshot);
                }
            });

            let progress_handle = app.handle().clone();
            let loader = OnnxModelLoader::new(config.model.clone(), config.model.resolve_dir(&app_data_dir))
                .with_progress(move |percent| {
                    let _ = progress_handle.emit("download-progress", percent);
                });

            // Load once at startup; failures are logged and kept in the session state
            tauri::async_runtime::spawn(async move {
                let _ = session.load_model(&loader).await;
            });

            Ok(())
        })
        .invoke_handler(tauri::generate_handler![
            commands::session::get_session_state,
            commands::session::select_image,
            commands::session::classify_path,
            commands::session::classify_bytes,
            commands::session::load_demo_image,
            commands::session::classify_current,
        ])
        .run(tauri::generate_context!())
        .expect("error while running tauri application");
}
