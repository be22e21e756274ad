use serde_json::Value;
use std::sync::atomic::Ordering;

use crate::APP_START_EPOCH;

#[tauri::command]
pub async fn app_get_version() -> Result<String, String> {
    Ok(env!("CARGO_PKG_VERSION").to_string())
}

#[tauri::command]
pub async fn system_get_info() -> Result<Value, String> {
    let uptime_secs = {
        let started = APP_START_EPOCH.load(Ordering::Relaxed);
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        now.saturating_sub(started)
    };

    Ok(serde_json::json!({
        "version": env!("CARGO_PKG_VERSION"),
        "platform": std::env::consts::OS,
        "arch": std::env::consts::ARCH,
        "uptimeSecs": uptime_secs,
    }))
}

#[tauri::command]
pub async fn app_restart(app: tauri::AppHandle) -> Result<(), String> {
    tracing::info!("restart requested");
    app.restart()
}

#[tauri::command]
pub async fn app_shutdown(app: tauri::AppHandle) -> Result<(), String> {
    tracing::info!("shutdown requested");
    app.exit(0);
    Ok(())
}
