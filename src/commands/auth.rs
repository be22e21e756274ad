use serde_json::Value;

use crate::auth as auth_service;
use crate::db;

#[tauri::command]
pub async fn auth_login(
    arg0: Option<Value>,
    db: tauri::State<'_, db::DbState>,
    auth: tauri::State<'_, auth_service::AuthState>,
) -> Result<Value, String> {
    auth_service::login(arg0, &db, &auth)
}

#[tauri::command]
pub async fn auth_logout(
    db: tauri::State<'_, db::DbState>,
    auth: tauri::State<'_, auth_service::AuthState>,
) -> Result<Value, String> {
    auth_service::logout(&auth, &db);
    Ok(serde_json::json!({ "success": true }))
}

#[tauri::command]
pub async fn auth_get_current_session(
    auth: tauri::State<'_, auth_service::AuthState>,
) -> Result<Value, String> {
    Ok(auth_service::get_session_json(&auth))
}

#[tauri::command]
pub async fn auth_validate_session(
    auth: tauri::State<'_, auth_service::AuthState>,
) -> Result<Value, String> {
    Ok(auth_service::validate_session(&auth))
}

#[tauri::command]
pub async fn auth_has_permission(
    arg0: Option<Value>,
    auth: tauri::State<'_, auth_service::AuthState>,
) -> Result<bool, String> {
    let permission = arg0.as_ref().and_then(|v| {
        v.as_str()
            .map(String::from)
            .or_else(|| v.get("permission").and_then(Value::as_str).map(String::from))
    });
    Ok(auth_service::has_permission(&auth, permission.as_deref()))
}

#[tauri::command]
pub async fn auth_has_any_permission(
    arg0: Option<Value>,
    auth: tauri::State<'_, auth_service::AuthState>,
) -> Result<bool, String> {
    let permissions: Option<Vec<String>> = arg0.as_ref().and_then(|v| {
        let arr = v
            .as_array()
            .or_else(|| v.get("permissions").and_then(Value::as_array))?;
        Some(
            arr.iter()
                .filter_map(|p| p.as_str().map(String::from))
                .collect(),
        )
    });
    Ok(auth_service::has_any_permission(
        &auth,
        permissions.as_deref(),
    ))
}

#[tauri::command]
pub async fn auth_get_session_stats(
    auth: tauri::State<'_, auth_service::AuthState>,
) -> Result<Value, String> {
    Ok(auth_service::get_session_stats(&auth))
}

#[tauri::command]
pub async fn auth_setup_pin(
    arg0: Option<Value>,
    db: tauri::State<'_, db::DbState>,
) -> Result<Value, String> {
    auth_service::setup_pin(arg0, &db)
}

#[tauri::command]
pub async fn auth_track_activity(
    auth: tauri::State<'_, auth_service::AuthState>,
) -> Result<(), String> {
    auth_service::track_activity(&auth);
    Ok(())
}
