use serde::Deserialize;
use serde_json::Value;
use tauri::Emitter;
use tracing::warn;

use crate::db;
use crate::shifts as shift_service;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ShiftIdPayload {
    #[serde(alias = "shift_id", alias = "id")]
    shift_id: String,
}

fn parse_shift_id_payload(arg0: Option<Value>) -> Result<ShiftIdPayload, String> {
    let payload = match arg0 {
        Some(Value::String(shift_id)) => serde_json::json!({ "shiftId": shift_id }),
        Some(Value::Object(obj)) => Value::Object(obj),
        Some(v) => v,
        None => serde_json::json!({}),
    };
    let mut parsed: ShiftIdPayload =
        serde_json::from_value(payload).map_err(|e| format!("Invalid shift payload: {e}"))?;
    parsed.shift_id = parsed.shift_id.trim().to_string();
    if parsed.shift_id.is_empty() {
        return Err("Missing shiftId".into());
    }
    Ok(parsed)
}

fn parse_entered_cash(arg0: &Option<Value>) -> Option<f64> {
    arg0.as_ref().and_then(|v| {
        v.as_f64().or_else(|| {
            v.get("enteredClosingCash")
                .or_else(|| v.get("entered_closing_cash"))
                .or_else(|| v.get("closingCash"))
                .or_else(|| v.get("closing_cash"))
                .and_then(Value::as_f64)
        })
    })
}

#[tauri::command]
pub async fn shift_start(
    arg0: Option<Value>,
    db: tauri::State<'_, db::DbState>,
    app: tauri::AppHandle,
) -> Result<Value, String> {
    let payload = arg0.ok_or("Missing shift payload")?;
    let result = shift_service::start_shift(&db, &payload)?;
    let _ = app.emit(
        "shift_updated",
        serde_json::json!({ "action": "started", "shift": result.clone() }),
    );
    Ok(result)
}

#[tauri::command]
pub async fn shift_end(
    arg0: Option<Value>,
    db: tauri::State<'_, db::DbState>,
    app: tauri::AppHandle,
) -> Result<Value, String> {
    let payload = arg0.ok_or("Missing shift end payload")?;
    let result = shift_service::end_shift(&db, &payload)?;
    if result["success"].as_bool().unwrap_or(false) {
        let _ = app.emit(
            "shift_updated",
            serde_json::json!({ "action": "ended", "shift": result.clone() }),
        );
    }
    Ok(result)
}

#[tauri::command]
pub async fn shift_handover(
    arg0: Option<Value>,
    db: tauri::State<'_, db::DbState>,
    app: tauri::AppHandle,
) -> Result<Value, String> {
    let payload = arg0.ok_or("Missing handover payload")?;
    let result = shift_service::handover(&db, &payload)?;
    if result["success"].as_bool().unwrap_or(false) {
        let _ = app.emit(
            "shift_updated",
            serde_json::json!({ "action": "handover", "shift": result.clone() }),
        );
    }
    Ok(result)
}

#[tauri::command]
pub async fn shift_get_active(db: tauri::State<'_, db::DbState>) -> Result<Value, String> {
    shift_service::get_active(&db)
}

#[tauri::command]
pub async fn shift_get(
    arg0: Option<Value>,
    db: tauri::State<'_, db::DbState>,
) -> Result<Value, String> {
    let payload = parse_shift_id_payload(arg0)?;
    shift_service::get_shift(&db, &payload.shift_id)
}

#[tauri::command]
pub async fn shift_list(
    arg0: Option<Value>,
    db: tauri::State<'_, db::DbState>,
) -> Result<Value, String> {
    let payload = arg0.unwrap_or_else(|| serde_json::json!({}));
    shift_service::list_shifts(&db, &payload)
}

#[tauri::command]
pub async fn shift_get_summary(
    arg0: Option<Value>,
    db: tauri::State<'_, db::DbState>,
) -> Result<Value, String> {
    let payload = parse_shift_id_payload(arg0)?;
    shift_service::get_shift_summary(&db, &payload.shift_id)
}

#[tauri::command]
pub async fn shift_suggested_opening_cash(
    db: tauri::State<'_, db::DbState>,
) -> Result<Value, String> {
    shift_service::suggested_opening_cash(&db)
}

/// Live drawer snapshot. Degrades to `available: false` instead of failing
/// so the UI never renders a false zero when aggregation breaks.
#[tauri::command]
pub async fn shift_cash_status(db: tauri::State<'_, db::DbState>) -> Result<Value, String> {
    match shift_service::cash_status(&db) {
        Ok(mut status) => {
            if let Some(obj) = status.as_object_mut() {
                obj.insert("available".to_string(), serde_json::json!(true));
            }
            Ok(status)
        }
        Err(e) => {
            warn!("cash status unavailable: {e}");
            Ok(serde_json::json!({
                "available": false,
                "reason": e,
            }))
        }
    }
}

#[tauri::command]
pub async fn shift_preview_reconciliation(
    arg0: Option<Value>,
    db: tauri::State<'_, db::DbState>,
) -> Result<Value, String> {
    let entered = parse_entered_cash(&arg0).ok_or("Missing enteredClosingCash")?;
    shift_service::preview_reconciliation(&db, entered)
}

// -- Expenses ----------------------------------------------------------------

#[tauri::command]
pub async fn shift_record_expense(
    arg0: Option<Value>,
    db: tauri::State<'_, db::DbState>,
    app: tauri::AppHandle,
) -> Result<Value, String> {
    let payload = arg0.ok_or("Missing expense payload")?;
    let result = shift_service::record_expense(&db, &payload)?;
    let _ = app.emit(
        "shift_updated",
        serde_json::json!({ "action": "expense_recorded", "expense": result.clone() }),
    );
    Ok(result)
}

#[tauri::command]
pub async fn shift_delete_expense(
    arg0: Option<Value>,
    db: tauri::State<'_, db::DbState>,
    app: tauri::AppHandle,
) -> Result<Value, String> {
    let payload = arg0.ok_or("Missing expense payload")?;
    let result = shift_service::delete_expense(&db, &payload)?;
    let _ = app.emit(
        "shift_updated",
        serde_json::json!({ "action": "expense_deleted", "expense": result.clone() }),
    );
    Ok(result)
}

#[tauri::command]
pub async fn shift_get_expenses(
    arg0: Option<Value>,
    db: tauri::State<'_, db::DbState>,
) -> Result<Value, String> {
    let payload = parse_shift_id_payload(arg0)?;
    shift_service::get_expenses(&db, &payload.shift_id)
}

// -- Deposits ----------------------------------------------------------------

#[tauri::command]
pub async fn shift_record_deposit(
    arg0: Option<Value>,
    db: tauri::State<'_, db::DbState>,
    app: tauri::AppHandle,
) -> Result<Value, String> {
    let payload = arg0.ok_or("Missing deposit payload")?;
    let result = shift_service::record_deposit(&db, &payload)?;
    let _ = app.emit(
        "shift_updated",
        serde_json::json!({ "action": "deposit_recorded", "deposit": result.clone() }),
    );
    Ok(result)
}

#[tauri::command]
pub async fn shift_get_deposits(
    arg0: Option<Value>,
    db: tauri::State<'_, db::DbState>,
) -> Result<Value, String> {
    let payload = parse_shift_id_payload(arg0)?;
    shift_service::get_deposits(&db, &payload.shift_id)
}
