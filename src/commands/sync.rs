use serde_json::Value;
use std::sync::Arc;

use crate::sync as sync_service;
use crate::{db, storage};

#[tauri::command]
pub async fn sync_get_status(
    db: tauri::State<'_, db::DbState>,
    sync_state: tauri::State<'_, Arc<sync_service::SyncState>>,
) -> Result<Value, String> {
    sync_service::get_sync_status(&db, &sync_state)
}

#[tauri::command]
pub async fn sync_force(
    db: tauri::State<'_, db::DbState>,
    sync_state: tauri::State<'_, Arc<sync_service::SyncState>>,
    app: tauri::AppHandle,
) -> Result<Value, String> {
    sync_service::force_sync(&db, &sync_state, &app).await
}

#[tauri::command]
pub async fn sync_retry_failed(db: tauri::State<'_, db::DbState>) -> Result<Value, String> {
    sync_service::retry_failed(&db)
}

#[tauri::command]
pub async fn sync_prune_synced(
    arg0: Option<Value>,
    db: tauri::State<'_, db::DbState>,
) -> Result<Value, String> {
    let keep_days = arg0
        .as_ref()
        .and_then(|v| {
            v.as_i64()
                .or_else(|| v.get("keepDays").and_then(Value::as_i64))
        })
        .unwrap_or(30);
    sync_service::prune_synced(&db, keep_days)
}

#[tauri::command]
pub async fn sync_test_connection() -> Result<Value, String> {
    let admin_url = storage::get_credential("admin_dashboard_url")
        .ok_or("Terminal not configured: missing admin URL")?;
    let api_key = storage::get_credential("parking_api_key")
        .ok_or("Terminal not configured: missing API key")?;

    let result = crate::api::test_connectivity(&admin_url, &api_key).await;
    serde_json::to_value(result).map_err(|e| format!("serialize connectivity result: {e}"))
}
