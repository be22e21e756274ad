use serde_json::Value;

use crate::db;
use crate::diagnostics as diag_service;

#[tauri::command]
pub async fn diagnostics_get_about() -> Result<Value, String> {
    Ok(diag_service::get_about_info())
}

#[tauri::command]
pub async fn diagnostics_get_system_health(
    db: tauri::State<'_, db::DbState>,
) -> Result<Value, String> {
    diag_service::get_system_health(&db)
}

#[tauri::command]
pub async fn database_health_check(db: tauri::State<'_, db::DbState>) -> Result<Value, String> {
    diag_service::database_health_check(&db)
}

#[tauri::command]
pub async fn diagnostics_export(
    arg0: Option<Value>,
    db: tauri::State<'_, db::DbState>,
    app: tauri::AppHandle,
) -> Result<Value, String> {
    use tauri::Manager;

    let output_dir = match arg0
        .as_ref()
        .and_then(|v| v.get("outputDir").or_else(|| v.get("output_dir")))
        .and_then(Value::as_str)
    {
        Some(dir) => std::path::PathBuf::from(dir),
        None => app
            .path()
            .app_data_dir()
            .map_err(|e| format!("resolve app data dir: {e}"))?
            .join("diagnostics"),
    };

    let path = diag_service::export_diagnostics(&db, &output_dir)?;
    Ok(serde_json::json!({ "success": true, "path": path }))
}
