use serde_json::Value;

use crate::db;
use crate::reports as report_service;

#[tauri::command]
pub async fn report_get_today_statistics(
    db: tauri::State<'_, db::DbState>,
) -> Result<Value, String> {
    report_service::today_statistics(&db)
}

#[tauri::command]
pub async fn report_generate_daily(
    arg0: Option<Value>,
    db: tauri::State<'_, db::DbState>,
) -> Result<Value, String> {
    let payload = arg0.unwrap_or_else(|| serde_json::json!({}));
    report_service::generate_daily_report(&db, &payload)
}

#[tauri::command]
pub async fn report_get(
    arg0: Option<Value>,
    db: tauri::State<'_, db::DbState>,
) -> Result<Value, String> {
    let report_date = arg0
        .as_ref()
        .and_then(|v| {
            v.as_str().map(String::from).or_else(|| {
                v.get("reportDate")
                    .or_else(|| v.get("report_date"))
                    .and_then(Value::as_str)
                    .map(String::from)
            })
        })
        .ok_or("Missing reportDate")?;
    report_service::get_report(&db, &report_date)
}

#[tauri::command]
pub async fn report_list(
    arg0: Option<Value>,
    db: tauri::State<'_, db::DbState>,
) -> Result<Value, String> {
    let payload = arg0.unwrap_or_else(|| serde_json::json!({}));
    report_service::list_reports(&db, &payload)
}
