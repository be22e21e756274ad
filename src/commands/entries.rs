use chrono::Utc;
use serde::Deserialize;
use serde_json::Value;
use tauri::Emitter;

use crate::entries as entry_service;
use crate::fees::FeeCalculator;
use crate::{db, value_str};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EntryIdPayload {
    #[serde(alias = "entry_id", alias = "id")]
    entry_id: String,
}

fn parse_entry_id_payload(arg0: Option<Value>) -> Result<EntryIdPayload, String> {
    let payload = match arg0 {
        Some(Value::String(entry_id)) => serde_json::json!({ "entryId": entry_id }),
        Some(Value::Object(obj)) => Value::Object(obj),
        Some(v) => v,
        None => serde_json::json!({}),
    };
    let mut parsed: EntryIdPayload =
        serde_json::from_value(payload).map_err(|e| format!("Invalid entry payload: {e}"))?;
    parsed.entry_id = parsed.entry_id.trim().to_string();
    if parsed.entry_id.is_empty() {
        return Err("Missing entryId".into());
    }
    Ok(parsed)
}

#[tauri::command]
pub async fn entry_create(
    arg0: Option<Value>,
    db: tauri::State<'_, db::DbState>,
    app: tauri::AppHandle,
) -> Result<Value, String> {
    let payload = arg0.ok_or("Missing entry payload")?;
    let result = entry_service::create_entry(&db, &payload)?;
    let _ = app.emit(
        "entry_updated",
        serde_json::json!({ "action": "created", "entry": result.clone() }),
    );
    Ok(result)
}

#[tauri::command]
pub async fn entry_process_exit(
    arg0: Option<Value>,
    db: tauri::State<'_, db::DbState>,
    app: tauri::AppHandle,
) -> Result<Value, String> {
    let payload = arg0.ok_or("Missing exit payload")?;
    let result = entry_service::process_exit(&db, &payload)?;
    let _ = app.emit(
        "entry_updated",
        serde_json::json!({ "action": "exited", "entry": result.clone() }),
    );
    Ok(result)
}

#[tauri::command]
pub async fn entry_update(
    arg0: Option<Value>,
    db: tauri::State<'_, db::DbState>,
    app: tauri::AppHandle,
) -> Result<Value, String> {
    let payload = arg0.ok_or("Missing update payload")?;
    let result = entry_service::update_entry(&db, &payload)?;
    let _ = app.emit(
        "entry_updated",
        serde_json::json!({ "action": "updated", "entry": result.clone() }),
    );
    Ok(result)
}

#[tauri::command]
pub async fn entry_get(
    arg0: Option<Value>,
    db: tauri::State<'_, db::DbState>,
) -> Result<Value, String> {
    let payload = parse_entry_id_payload(arg0)?;
    entry_service::get_entry(&db, &payload.entry_id)
}

#[tauri::command]
pub async fn entry_find_parked(
    arg0: Option<Value>,
    db: tauri::State<'_, db::DbState>,
) -> Result<Value, String> {
    let vehicle_number = arg0
        .as_ref()
        .and_then(|v| {
            v.as_str()
                .map(String::from)
                .or_else(|| value_str(v, &["vehicleNumber", "vehicle_number"]))
        })
        .ok_or("Missing vehicleNumber")?;
    entry_service::find_parked_vehicle(&db, &vehicle_number)
}

#[tauri::command]
pub async fn entry_list(
    arg0: Option<Value>,
    db: tauri::State<'_, db::DbState>,
) -> Result<Value, String> {
    let payload = arg0.unwrap_or_else(|| serde_json::json!({}));
    entry_service::list_entries(&db, &payload)
}

#[tauri::command]
pub async fn entry_refresh_overstays(
    db: tauri::State<'_, db::DbState>,
    app: tauri::AppHandle,
) -> Result<Value, String> {
    let result = entry_service::refresh_overstays(&db)?;
    if result["flagged"].as_i64().unwrap_or(0) > 0 {
        let _ = app.emit(
            "entry_updated",
            serde_json::json!({ "action": "overstay_flagged", "result": result.clone() }),
        );
    }
    Ok(result)
}

#[tauri::command]
pub async fn entry_get_audit_trail(
    arg0: Option<Value>,
    db: tauri::State<'_, db::DbState>,
) -> Result<Value, String> {
    let payload = parse_entry_id_payload(arg0)?;
    entry_service::get_audit_trail(&db, &payload.entry_id)
}

/// Estimate the fee for a currently-parked vehicle if it exited now.
#[tauri::command]
pub async fn entry_estimate_fee(
    arg0: Option<Value>,
    db: tauri::State<'_, db::DbState>,
) -> Result<Value, String> {
    let payload = parse_entry_id_payload(arg0)?;
    let entry = entry_service::get_entry(&db, &payload.entry_id)?;
    if entry.is_null() {
        return Err(format!("Entry not found: {}", payload.entry_id));
    }

    let vehicle_type = entry["vehicle_type"].as_str().unwrap_or_default().to_string();
    let entry_time = entry["entry_time"]
        .as_str()
        .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .ok_or("Entry has an invalid entry_time")?;

    let breakdown = {
        let conn = db.conn.lock().map_err(|e| e.to_string())?;
        let calculator = FeeCalculator::from_db(&conn)?;
        calculator.calculate(&vehicle_type, entry_time, Utc::now())?
    };

    Ok(serde_json::json!({
        "entryId": payload.entry_id,
        "estimate": breakdown,
    }))
}
