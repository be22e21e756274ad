use chrono::Utc;
use rusqlite::params;
use serde_json::Value;
use tauri::Emitter;
use tracing::info;

use crate::fees::FeeCalculator;
use crate::{db, storage, value_f64, value_str};

// -- Local settings ----------------------------------------------------------

#[tauri::command]
pub async fn settings_get(
    arg0: Option<Value>,
    arg1: Option<Value>,
    db: tauri::State<'_, db::DbState>,
) -> Result<Value, String> {
    let category = arg0
        .as_ref()
        .and_then(Value::as_str)
        .map(String::from)
        .ok_or("Missing setting category")?;
    let key = arg1
        .as_ref()
        .and_then(Value::as_str)
        .map(String::from)
        .ok_or("Missing setting key")?;

    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    Ok(match db::get_setting(&conn, &category, &key) {
        Some(v) => Value::String(v),
        None => Value::Null,
    })
}

#[tauri::command]
pub async fn settings_set(
    arg0: Option<Value>,
    db: tauri::State<'_, db::DbState>,
) -> Result<Value, String> {
    let payload = arg0.ok_or("Missing settings payload")?;
    let category = value_str(&payload, &["category", "settingCategory", "setting_category"])
        .ok_or("Missing category")?;
    let key = value_str(&payload, &["key", "settingKey", "setting_key"]).ok_or("Missing key")?;
    let value = value_str(&payload, &["value", "settingValue", "setting_value"])
        .ok_or("Missing value")?;

    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    db::set_setting(&conn, &category, &key, &value)?;
    Ok(serde_json::json!({ "success": true }))
}

#[tauri::command]
pub async fn settings_get_all(db: tauri::State<'_, db::DbState>) -> Result<Value, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    Ok(db::get_all_settings(&conn))
}

// -- Terminal credentials ----------------------------------------------------

#[tauri::command]
pub async fn settings_is_configured() -> Result<bool, String> {
    Ok(storage::is_configured())
}

#[tauri::command]
pub async fn settings_get_full_config() -> Result<Value, String> {
    Ok(storage::get_full_config())
}

#[tauri::command]
pub async fn settings_update_terminal_credentials(
    arg0: Option<Value>,
) -> Result<Value, String> {
    let payload = arg0.ok_or("Missing credentials payload")?;
    storage::update_terminal_credentials(&payload)
}

/// Factory reset: wipe credentials and every operational table. Leaves the
/// schema in place so the app restarts into onboarding.
#[tauri::command]
pub async fn settings_factory_reset(
    db: tauri::State<'_, db::DbState>,
    app: tauri::AppHandle,
) -> Result<Value, String> {
    {
        let conn = db.conn.lock().map_err(|e| e.to_string())?;
        conn.execute_batch(
            "BEGIN IMMEDIATE;
             DELETE FROM entry_audit_log;
             DELETE FROM shift_expenses;
             DELETE FROM shift_deposits;
             DELETE FROM daily_reports;
             DELETE FROM parking_entries;
             DELETE FROM shift_sessions;
             DELETE FROM sync_queue;
             DELETE FROM staff_sessions;
             DELETE FROM local_settings;
             COMMIT;",
        )
        .map_err(|e| format!("factory reset wipe: {e}"))?;
    }

    storage::factory_reset()?;
    info!("factory reset completed");
    let _ = app.emit("app_reset", serde_json::json!({ "reason": "factory_reset" }));
    Ok(serde_json::json!({ "success": true }))
}

// -- Rate card and fee policy ------------------------------------------------

#[tauri::command]
pub async fn rates_get_schedule(db: tauri::State<'_, db::DbState>) -> Result<Value, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    let calculator = FeeCalculator::from_db(&conn)?;
    Ok(calculator.rate_schedule())
}

/// Create or update a rate card row. A rate set to inactive stops being a
/// valid vehicle type for new entries but keeps historical rows intact.
#[tauri::command]
pub async fn rates_update(
    arg0: Option<Value>,
    db: tauri::State<'_, db::DbState>,
    app: tauri::AppHandle,
) -> Result<Value, String> {
    let payload = arg0.ok_or("Missing rate payload")?;
    let name = value_str(&payload, &["name", "vehicleType", "vehicle_type"])
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or("Missing vehicle type name")?;
    let daily_rate = value_f64(&payload, &["dailyRate", "daily_rate"]).ok_or("Missing dailyRate")?;
    if daily_rate < 0.0 {
        return Err("Daily rate cannot be negative".into());
    }
    let is_active = payload
        .get("isActive")
        .or_else(|| payload.get("is_active"))
        .and_then(Value::as_bool)
        .unwrap_or(true);

    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    conn.execute(
        "INSERT INTO vehicle_rates (name, daily_rate, is_active, updated_at)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(name) DO UPDATE SET
            daily_rate = excluded.daily_rate,
            is_active = excluded.is_active,
            updated_at = excluded.updated_at",
        params![name, daily_rate, is_active as i64, Utc::now().to_rfc3339()],
    )
    .map_err(|e| format!("update rate: {e}"))?;

    info!(vehicle_type = %name, daily_rate = %daily_rate, is_active, "rate card updated");
    let _ = app.emit(
        "settings_updated",
        serde_json::json!({ "scope": "rates", "vehicleType": name }),
    );
    Ok(serde_json::json!({ "success": true }))
}

/// Update the overstay policy (threshold hours / penalty multiplier).
#[tauri::command]
pub async fn fees_set_policy(
    arg0: Option<Value>,
    db: tauri::State<'_, db::DbState>,
    app: tauri::AppHandle,
) -> Result<Value, String> {
    let payload = arg0.ok_or("Missing fee policy payload")?;
    let overstay_hours = value_f64(&payload, &["overstayHours", "overstay_hours"]);
    let penalty_multiplier = value_f64(&payload, &["penaltyMultiplier", "penalty_multiplier"]);

    if overstay_hours.is_none() && penalty_multiplier.is_none() {
        return Err("Nothing to update: provide overstayHours and/or penaltyMultiplier".into());
    }

    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    if let Some(hours) = overstay_hours {
        if hours <= 0.0 {
            return Err("Overstay threshold must be positive".into());
        }
        db::set_setting(&conn, "fees", "overstay_hours", &hours.to_string())?;
    }
    if let Some(multiplier) = penalty_multiplier {
        if multiplier < 1.0 {
            return Err("Penalty multiplier must be at least 1.0".into());
        }
        db::set_setting(&conn, "fees", "penalty_multiplier", &multiplier.to_string())?;
    }

    let _ = app.emit(
        "settings_updated",
        serde_json::json!({ "scope": "fees" }),
    );
    Ok(serde_json::json!({ "success": true }))
}

/// Projected fee for a planned stay, shown on the rate schedule screen.
#[tauri::command]
pub async fn rates_estimate_fee(
    arg0: Option<Value>,
    db: tauri::State<'_, db::DbState>,
) -> Result<Value, String> {
    let payload = arg0.ok_or("Missing estimate payload")?;
    let vehicle_type = value_str(&payload, &["vehicleType", "vehicle_type"])
        .ok_or("Missing vehicleType")?;
    let hours = value_f64(&payload, &["hours", "durationHours", "duration_hours"])
        .ok_or("Missing hours")?;
    if hours < 0.0 {
        return Err("Duration cannot be negative".into());
    }

    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    let calculator = FeeCalculator::from_db(&conn)?;
    let base_fee = calculator.estimate(&vehicle_type, hours);
    let overstay_penalty = calculator.overstay_penalty(&vehicle_type, hours);

    Ok(serde_json::json!({
        "vehicleType": vehicle_type,
        "hours": hours,
        "dailyRate": calculator.daily_rate(&vehicle_type),
        "baseFee": base_fee,
        "overstayPenalty": overstay_penalty,
        "totalFee": base_fee + overstay_penalty,
    }))
}

#[tauri::command]
pub async fn terminal_config_get_setting(
    arg0: Option<Value>,
) -> Result<Value, String> {
    let key = arg0.as_ref().and_then(Value::as_str);
    Ok(storage::get_setting(key))
}
