//! Parking entry management for ParkPoint.
//!
//! Implements vehicle entry registration, exit processing with fee
//! calculation, detail corrections, and overstay flagging. Entries are
//! never deleted; every mutation appends a row to `entry_audit_log` in the
//! same transaction, and each write enqueues a sync entry for the admin
//! dashboard.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde_json::Value;
use tracing::{info, warn};
use uuid::Uuid;

use crate::db::DbState;
use crate::fees::FeeCalculator;

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate a vehicle number: required, at least 3 characters, at least 3
/// alphanumeric characters.
pub fn validate_vehicle_number(raw: &str) -> Result<String, String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err("Vehicle number is required".into());
    }
    if trimmed.len() < 3 {
        return Err("Vehicle number must be at least 3 characters".into());
    }
    let alnum = trimmed.chars().filter(|c| c.is_ascii_alphanumeric()).count();
    if alnum < 3 {
        return Err("Vehicle number must contain at least 3 alphanumeric characters".into());
    }
    Ok(trimmed.to_uppercase())
}

fn validate_transport_name(raw: &str) -> Result<String, String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err("Transport name is required".into());
    }
    Ok(trimmed.to_string())
}

const PAYMENT_STATUSES: &[&str] = &["Paid", "Unpaid", "Pending", "Refunded"];

fn validate_payment_status(raw: &str) -> Result<String, String> {
    let trimmed = raw.trim();
    if PAYMENT_STATUSES.contains(&trimmed) {
        Ok(trimmed.to_string())
    } else {
        Err(format!(
            "Invalid payment status: {trimmed}. Must be one of Paid, Unpaid, Pending, Refunded"
        ))
    }
}

fn parse_timestamp(raw: &str, label: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| format!("Invalid {label} timestamp '{raw}': {e}"))
}

// ---------------------------------------------------------------------------
// Audit trail
// ---------------------------------------------------------------------------

/// Append an audit row for an entry mutation. Must run inside the caller's
/// transaction so the mutation and its trail commit together.
fn record_audit(
    conn: &Connection,
    entry_id: &str,
    action: &str,
    old_values: Option<&Value>,
    new_values: Option<&Value>,
    performed_by: Option<&str>,
) -> Result<(), String> {
    conn.execute(
        "INSERT INTO entry_audit_log (id, entry_id, action, old_values, new_values, performed_by, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            Uuid::new_v4().to_string(),
            entry_id,
            action,
            old_values.map(|v| v.to_string()),
            new_values.map(|v| v.to_string()),
            performed_by,
            Utc::now().to_rfc3339(),
        ],
    )
    .map_err(|e| format!("insert audit row: {e}"))?;
    Ok(())
}

/// Get the audit trail for an entry, oldest first.
pub fn get_audit_trail(db: &DbState, entry_id: &str) -> Result<Value, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    let mut stmt = conn
        .prepare(
            "SELECT id, entry_id, action, old_values, new_values, performed_by, created_at
             FROM entry_audit_log WHERE entry_id = ?1 ORDER BY created_at ASC",
        )
        .map_err(|e| e.to_string())?;

    let rows = stmt
        .query_map(params![entry_id], |row| {
            let old: Option<String> = row.get(3)?;
            let new: Option<String> = row.get(4)?;
            Ok(serde_json::json!({
                "id": row.get::<_, String>(0)?,
                "entryId": row.get::<_, String>(1)?,
                "action": row.get::<_, String>(2)?,
                "oldValues": old.and_then(|s| serde_json::from_str::<Value>(&s).ok()),
                "newValues": new.and_then(|s| serde_json::from_str::<Value>(&s).ok()),
                "performedBy": row.get::<_, Option<String>>(5)?,
                "createdAt": row.get::<_, String>(6)?,
            }))
        })
        .map_err(|e| e.to_string())?;

    let items: Vec<Value> = rows.filter_map(|r| r.ok()).collect();
    Ok(serde_json::json!(items))
}

// ---------------------------------------------------------------------------
// Create entry
// ---------------------------------------------------------------------------

/// Register a vehicle entering the lot.
///
/// Validates vehicle number / transport name / vehicle type, normalizes the
/// vehicle number to uppercase, assigns the next serial number, and rejects
/// a second open entry for the same vehicle.
pub fn create_entry(db: &DbState, payload: &Value) -> Result<Value, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;

    let vehicle_number = validate_vehicle_number(
        &str_field(payload, "vehicleNumber")
            .or_else(|| str_field(payload, "vehicle_number"))
            .ok_or("Missing vehicleNumber")?,
    )?;
    let transport_name = validate_transport_name(
        &str_field(payload, "transportName")
            .or_else(|| str_field(payload, "transport_name"))
            .ok_or("Missing transportName")?,
    )?;
    let vehicle_type = str_field(payload, "vehicleType")
        .or_else(|| str_field(payload, "vehicle_type"))
        .ok_or("Missing vehicleType")?;

    let calculator = FeeCalculator::from_db(&conn)?;
    if !calculator.knows_vehicle_type(&vehicle_type) {
        return Err(format!(
            "Invalid vehicle type: {vehicle_type}. Known types: {}",
            calculator.vehicle_types().join(", ")
        ));
    }

    let driver_name = str_field(payload, "driverName").or_else(|| str_field(payload, "driver_name"));
    let driver_phone =
        str_field(payload, "driverPhone").or_else(|| str_field(payload, "driver_phone"));
    let location = str_field(payload, "location");
    let notes = str_field(payload, "notes");
    let created_by = str_field(payload, "createdBy")
        .or_else(|| str_field(payload, "created_by"))
        .unwrap_or_else(|| "System".to_string());

    let entry_time = match str_field(payload, "entryTime").or_else(|| str_field(payload, "entry_time"))
    {
        Some(raw) => parse_timestamp(&raw, "entry")?.to_rfc3339(),
        None => Utc::now().to_rfc3339(),
    };

    // A vehicle can only be in the lot once
    let open: Option<String> = conn
        .query_row(
            "SELECT id FROM parking_entries
             WHERE vehicle_number = ?1 AND status IN ('Active', 'Overstay')",
            params![vehicle_number],
            |row| row.get(0),
        )
        .ok();
    if let Some(open_id) = open {
        return Err(format!(
            "Vehicle {vehicle_number} is already parked (entry {open_id})"
        ));
    }

    let entry_id = Uuid::new_v4().to_string();
    let now = Utc::now().to_rfc3339();

    conn.execute_batch("BEGIN IMMEDIATE")
        .map_err(|e| format!("begin transaction: {e}"))?;

    let result = (|| -> Result<i64, String> {
        let serial: i64 = conn
            .query_row(
                "SELECT COALESCE(MAX(serial_number), 0) + 1 FROM parking_entries",
                [],
                |row| row.get(0),
            )
            .map_err(|e| format!("next serial: {e}"))?;

        conn.execute(
            "INSERT INTO parking_entries (
                id, serial_number, transport_name, vehicle_type, vehicle_number,
                driver_name, driver_phone, location, notes, entry_time,
                status, payment_status, created_by, sync_status, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10,
                'Active', 'Unpaid', ?11, 'pending', ?12, ?12)",
            params![
                entry_id,
                serial,
                transport_name,
                vehicle_type,
                vehicle_number,
                driver_name,
                driver_phone,
                location,
                notes,
                entry_time,
                created_by,
                now,
            ],
        )
        .map_err(|e| format!("insert entry: {e}"))?;

        let snapshot = serde_json::json!({
            "serialNumber": serial,
            "transportName": &transport_name,
            "vehicleType": &vehicle_type,
            "vehicleNumber": &vehicle_number,
            "entryTime": &entry_time,
            "status": "Active",
        });
        record_audit(&conn, &entry_id, "created", None, Some(&snapshot), Some(&created_by))?;

        // Enqueue for sync
        let idempotency_key = format!("entry:create:{entry_id}");
        let sync_payload = serde_json::json!({
            "entryId": &entry_id,
            "serialNumber": serial,
            "transportName": &transport_name,
            "vehicleType": &vehicle_type,
            "vehicleNumber": &vehicle_number,
            "driverName": &driver_name,
            "driverPhone": &driver_phone,
            "entryTime": &entry_time,
            "createdBy": &created_by,
        })
        .to_string();
        conn.execute(
            "INSERT INTO sync_queue (entity_type, entity_id, operation, payload, idempotency_key)
             VALUES ('entry', ?1, 'insert', ?2, ?3)",
            params![entry_id, sync_payload, idempotency_key],
        )
        .map_err(|e| format!("enqueue entry sync: {e}"))?;

        Ok(serial)
    })();

    let serial = match result {
        Ok(serial) => {
            conn.execute_batch("COMMIT")
                .map_err(|e| format!("commit: {e}"))?;
            serial
        }
        Err(e) => {
            let _ = conn.execute_batch("ROLLBACK");
            return Err(e);
        }
    };

    info!(entry_id = %entry_id, vehicle = %vehicle_number, serial = serial, "Vehicle entry registered");

    Ok(serde_json::json!({
        "success": true,
        "entryId": entry_id,
        "serialNumber": serial,
        "vehicleNumber": &vehicle_number,
        "message": format!("Entry {serial} created for {vehicle_number}"),
    }))
}

// ---------------------------------------------------------------------------
// Process exit
// ---------------------------------------------------------------------------

/// Process a vehicle exit.
///
/// Computes the parking fee (manual override allowed, recorded in the audit
/// trail), stamps exit time / status / payment fields, and links the entry
/// to the active shift so the revenue aggregator can attribute it.
pub fn process_exit(db: &DbState, payload: &Value) -> Result<Value, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;

    // Resolve the entry by id or by open vehicle number
    let entry_id = match str_field(payload, "entryId").or_else(|| str_field(payload, "entry_id")) {
        Some(id) => id,
        None => {
            let vehicle_number = validate_vehicle_number(
                &str_field(payload, "vehicleNumber")
                    .or_else(|| str_field(payload, "vehicle_number"))
                    .ok_or("Missing entryId or vehicleNumber")?,
            )?;
            conn.query_row(
                "SELECT id FROM parking_entries
                 WHERE vehicle_number = ?1 AND status IN ('Active', 'Overstay')",
                params![vehicle_number],
                |row| row.get(0),
            )
            .map_err(|_| format!("No parked vehicle found with number {vehicle_number}"))?
        }
    };

    let (vehicle_type, vehicle_number, entry_time_raw, status): (String, String, String, String) =
        conn.query_row(
            "SELECT vehicle_type, vehicle_number, entry_time, status
             FROM parking_entries WHERE id = ?1",
            params![entry_id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
        )
        .map_err(|_| format!("Entry not found: {entry_id}"))?;

    if status == "Exited" {
        return Err(format!("Entry {entry_id} has already exited"));
    }

    let payment_type = str_field(payload, "paymentType")
        .or_else(|| str_field(payload, "payment_type"))
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or("Missing paymentType")?;
    let payment_status = match str_field(payload, "paymentStatus")
        .or_else(|| str_field(payload, "payment_status"))
    {
        Some(raw) => validate_payment_status(&raw)?,
        None => "Paid".to_string(),
    };
    let performed_by = str_field(payload, "performedBy")
        .or_else(|| str_field(payload, "performed_by"))
        .unwrap_or_else(|| "System".to_string());

    let exit_time = match str_field(payload, "exitTime").or_else(|| str_field(payload, "exit_time"))
    {
        Some(raw) => parse_timestamp(&raw, "exit")?,
        None => Utc::now(),
    };
    let entry_time = parse_timestamp(&entry_time_raw, "entry")?;

    let calculator = FeeCalculator::from_db(&conn)?;
    let breakdown = calculator.calculate(&vehicle_type, entry_time, exit_time)?;

    let fee_override = num_field(payload, "feeOverride")
        .or_else(|| num_field(payload, "fee_override"))
        .or_else(|| num_field(payload, "fee"));
    if let Some(fee) = fee_override {
        if fee < 0.0 {
            return Err("Fee cannot be negative".into());
        }
    }
    let fee = fee_override.unwrap_or(breakdown.total_fee);

    // Attribute revenue to the active shift, if any
    let shift_session_id: Option<String> = conn
        .query_row(
            "SELECT id FROM shift_sessions WHERE status = 'active' LIMIT 1",
            [],
            |row| row.get(0),
        )
        .ok();

    let exit_time_str = exit_time.to_rfc3339();
    let now = Utc::now().to_rfc3339();

    conn.execute_batch("BEGIN IMMEDIATE")
        .map_err(|e| format!("begin transaction: {e}"))?;

    let result = (|| -> Result<(), String> {
        conn.execute(
            "UPDATE parking_entries SET
                exit_time = ?1, status = 'Exited', parking_fee = ?2,
                payment_status = ?3, payment_type = ?4, shift_session_id = ?5,
                sync_status = 'pending', updated_at = ?6
             WHERE id = ?7",
            params![
                exit_time_str,
                fee,
                payment_status,
                payment_type,
                shift_session_id,
                now,
                entry_id,
            ],
        )
        .map_err(|e| format!("update entry exit: {e}"))?;

        let old_values = serde_json::json!({ "status": &status, "parkingFee": 0.0 });
        let new_values = serde_json::json!({
            "status": "Exited",
            "exitTime": &exit_time_str,
            "parkingFee": fee,
            "calculatedFee": breakdown.total_fee,
            "feeOverridden": fee_override.is_some(),
            "paymentStatus": &payment_status,
            "paymentType": &payment_type,
            "shiftSessionId": &shift_session_id,
        });
        record_audit(
            &conn,
            &entry_id,
            "exit_processed",
            Some(&old_values),
            Some(&new_values),
            Some(&performed_by),
        )?;

        let idempotency_key = format!("entry:exit:{entry_id}");
        let sync_payload = new_values.to_string();
        conn.execute(
            "INSERT OR IGNORE INTO sync_queue (entity_type, entity_id, operation, payload, idempotency_key)
             VALUES ('entry', ?1, 'update', ?2, ?3)",
            params![entry_id, sync_payload, idempotency_key],
        )
        .map_err(|e| format!("enqueue exit sync: {e}"))?;

        Ok(())
    })();

    match result {
        Ok(()) => {
            conn.execute_batch("COMMIT")
                .map_err(|e| format!("commit: {e}"))?;
        }
        Err(e) => {
            let _ = conn.execute_batch("ROLLBACK");
            return Err(e);
        }
    }

    info!(
        entry_id = %entry_id,
        vehicle = %vehicle_number,
        fee = %fee,
        payment_type = %payment_type,
        "Vehicle exit processed"
    );

    Ok(serde_json::json!({
        "success": true,
        "entryId": entry_id,
        "fee": fee,
        "feeBreakdown": breakdown,
        "feeOverridden": fee_override.is_some(),
        "shiftSessionId": shift_session_id,
        "message": format!("Exit processed for {vehicle_number}. Fee: {:.2}", fee),
    }))
}

// ---------------------------------------------------------------------------
// Update entry details
// ---------------------------------------------------------------------------

/// Fields an operator may correct after creation.
const EDITABLE_FIELDS: &[(&str, &str)] = &[
    ("transportName", "transport_name"),
    ("driverName", "driver_name"),
    ("driverPhone", "driver_phone"),
    ("location", "location"),
    ("notes", "notes"),
    ("paymentStatus", "payment_status"),
    ("paymentType", "payment_type"),
];

/// Correct entry details. Status, timestamps, and the fee are managed by
/// `process_exit` and are not editable here. Every change is audited.
pub fn update_entry(db: &DbState, payload: &Value) -> Result<Value, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;

    let entry_id = str_field(payload, "entryId")
        .or_else(|| str_field(payload, "entry_id"))
        .or_else(|| str_field(payload, "id"))
        .ok_or("Missing entryId")?;
    let performed_by = str_field(payload, "performedBy")
        .or_else(|| str_field(payload, "performed_by"))
        .unwrap_or_else(|| "System".to_string());

    let existing = query_entry(
        &conn,
        "SELECT * FROM parking_entries WHERE id = ?1",
        params![entry_id],
    )?;
    if existing.is_null() {
        return Err(format!("Entry not found: {entry_id}"));
    }

    let mut changes: Vec<(&str, String)> = Vec::new();
    let mut old_values = serde_json::Map::new();
    let mut new_values = serde_json::Map::new();

    for &(camel, column) in EDITABLE_FIELDS {
        if let Some(new_val) = str_field(payload, camel) {
            let new_val = if camel == "paymentStatus" {
                validate_payment_status(&new_val)?
            } else if camel == "transportName" {
                validate_transport_name(&new_val)?
            } else {
                new_val.trim().to_string()
            };
            let old_val = existing
                .get(column)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            if old_val != new_val {
                old_values.insert(column.to_string(), Value::String(old_val));
                new_values.insert(column.to_string(), Value::String(new_val.clone()));
                changes.push((column, new_val));
            }
        }
    }

    if changes.is_empty() {
        return Ok(serde_json::json!({ "success": true, "updated": 0 }));
    }

    let now = Utc::now().to_rfc3339();

    conn.execute_batch("BEGIN IMMEDIATE")
        .map_err(|e| format!("begin transaction: {e}"))?;

    let result = (|| -> Result<(), String> {
        for (column, new_val) in &changes {
            conn.execute(
                &format!(
                    "UPDATE parking_entries SET {column} = ?1, sync_status = 'pending', updated_at = ?2 WHERE id = ?3"
                ),
                params![new_val, now, entry_id],
            )
            .map_err(|e| format!("update {column}: {e}"))?;
        }

        record_audit(
            &conn,
            &entry_id,
            "updated",
            Some(&Value::Object(old_values.clone())),
            Some(&Value::Object(new_values.clone())),
            Some(&performed_by),
        )?;

        let idempotency_key = format!("entry:update:{entry_id}:{}", Utc::now().timestamp_millis());
        conn.execute(
            "INSERT INTO sync_queue (entity_type, entity_id, operation, payload, idempotency_key)
             VALUES ('entry', ?1, 'update', ?2, ?3)",
            params![
                entry_id,
                Value::Object(new_values.clone()).to_string(),
                idempotency_key
            ],
        )
        .map_err(|e| format!("enqueue update sync: {e}"))?;

        Ok(())
    })();

    match result {
        Ok(()) => {
            conn.execute_batch("COMMIT")
                .map_err(|e| format!("commit: {e}"))?;
        }
        Err(e) => {
            let _ = conn.execute_batch("ROLLBACK");
            return Err(e);
        }
    }

    info!(entry_id = %entry_id, fields = changes.len(), "Entry details updated");

    Ok(serde_json::json!({
        "success": true,
        "updated": changes.len(),
    }))
}

// ---------------------------------------------------------------------------
// Overstay flagging
// ---------------------------------------------------------------------------

/// Flag `Active` entries parked longer than the overstay threshold.
///
/// Called by the background monitor and on demand from the entries screen.
/// Returns the number of entries newly flagged.
pub fn refresh_overstays(db: &DbState) -> Result<Value, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;

    let calculator = FeeCalculator::from_db(&conn)?;
    let now = Utc::now();

    let mut stmt = conn
        .prepare("SELECT id, entry_time FROM parking_entries WHERE status = 'Active'")
        .map_err(|e| format!("prepare overstay scan: {e}"))?;
    let candidates: Vec<(String, String)> = stmt
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
        .map_err(|e| format!("query overstay scan: {e}"))?
        .filter_map(|r| r.ok())
        .collect();
    drop(stmt);

    let mut flagged = 0i64;
    let now_str = now.to_rfc3339();

    for (entry_id, entry_time_raw) in candidates {
        let entry_time = match parse_timestamp(&entry_time_raw, "entry") {
            Ok(t) => t,
            Err(e) => {
                warn!(entry_id = %entry_id, "skipping overstay check: {e}");
                continue;
            }
        };
        let hours = (now - entry_time).num_seconds() as f64 / 3600.0;
        if hours <= calculator.overstay_threshold_hours {
            continue;
        }

        conn.execute_batch("BEGIN IMMEDIATE")
            .map_err(|e| format!("begin transaction: {e}"))?;
        let result = (|| -> Result<(), String> {
            conn.execute(
                "UPDATE parking_entries SET status = 'Overstay', sync_status = 'pending', updated_at = ?1
                 WHERE id = ?2 AND status = 'Active'",
                params![now_str, entry_id],
            )
            .map_err(|e| format!("flag overstay: {e}"))?;

            let new_values = serde_json::json!({ "status": "Overstay", "parkedHours": hours });
            record_audit(&conn, &entry_id, "overstay_flagged", None, Some(&new_values), None)?;
            Ok(())
        })();

        match result {
            Ok(()) => {
                conn.execute_batch("COMMIT")
                    .map_err(|e| format!("commit: {e}"))?;
                flagged += 1;
            }
            Err(e) => {
                let _ = conn.execute_batch("ROLLBACK");
                warn!(entry_id = %entry_id, "overstay flag failed: {e}");
            }
        }
    }

    if flagged > 0 {
        info!(flagged, "Overstay entries flagged");
    }

    Ok(serde_json::json!({ "success": true, "flagged": flagged }))
}

// ---------------------------------------------------------------------------
// Queries
// ---------------------------------------------------------------------------

/// Get a single entry by id, or null.
pub fn get_entry(db: &DbState, entry_id: &str) -> Result<Value, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    query_entry(
        &conn,
        "SELECT * FROM parking_entries WHERE id = ?1",
        params![entry_id],
    )
}

/// Get the open (Active/Overstay) entry for a vehicle number, or null.
pub fn find_parked_vehicle(db: &DbState, vehicle_number: &str) -> Result<Value, String> {
    let normalized = validate_vehicle_number(vehicle_number)?;
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    query_entry(
        &conn,
        "SELECT * FROM parking_entries
         WHERE vehicle_number = ?1 AND status IN ('Active', 'Overstay')
         ORDER BY entry_time DESC LIMIT 1",
        params![normalized],
    )
}

/// List entries with optional filters: status, date range (on entry_time),
/// and a text search over vehicle number / transport name.
pub fn list_entries(db: &DbState, payload: &Value) -> Result<Value, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;

    let status = str_field(payload, "status").filter(|s| !s.trim().is_empty());
    let date_from = str_field(payload, "dateFrom").or_else(|| str_field(payload, "date_from"));
    let date_to = str_field(payload, "dateTo").or_else(|| str_field(payload, "date_to"));
    let search = str_field(payload, "search")
        .map(|s| s.trim().to_uppercase())
        .filter(|s| !s.is_empty());
    let limit = num_field(payload, "limit").map(|n| n as i64).unwrap_or(200);

    let search_like = search.map(|s| format!("%{s}%"));

    let mut stmt = conn
        .prepare(
            "SELECT * FROM parking_entries
             WHERE (?1 IS NULL OR status = ?1)
               AND (?2 IS NULL OR entry_time >= ?2)
               AND (?3 IS NULL OR entry_time <= ?3)
               AND (?4 IS NULL OR vehicle_number LIKE ?4 OR upper(transport_name) LIKE ?4)
             ORDER BY entry_time DESC
             LIMIT ?5",
        )
        .map_err(|e| format!("prepare list: {e}"))?;

    let col_names: Vec<String> = stmt
        .column_names()
        .into_iter()
        .map(|s| s.to_string())
        .collect();

    let rows = stmt
        .query_map(
            params![status, date_from, date_to, search_like, limit],
            |row| Ok(row_to_json(row, &col_names)),
        )
        .map_err(|e| format!("query list: {e}"))?;

    let items: Vec<Value> = rows.filter_map(|r| r.ok()).collect();
    Ok(serde_json::json!(items))
}

/// Count of vehicles currently in the lot (Active + Overstay).
pub fn parked_count(conn: &Connection) -> i64 {
    conn.query_row(
        "SELECT COUNT(*) FROM parking_entries WHERE status IN ('Active', 'Overstay')",
        [],
        |row| row.get(0),
    )
    .unwrap_or(0)
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

/// Execute an entry query and return the first row as JSON, or null.
fn query_entry(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
) -> Result<Value, String> {
    let mut stmt = conn.prepare(sql).map_err(|e| e.to_string())?;
    let col_names: Vec<String> = stmt
        .column_names()
        .into_iter()
        .map(|s| s.to_string())
        .collect();

    let result = stmt.query_row(params, |row| Ok(row_to_json(row, &col_names)));

    match result {
        Ok(entry) => Ok(entry),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(Value::Null),
        Err(e) => {
            warn!("entry query error: {e}");
            Err(format!("entry query: {e}"))
        }
    }
}

/// Convert a row to a JSON object keyed by raw snake_case column names
/// (the frontend expects them as stored).
fn row_to_json(row: &rusqlite::Row, col_names: &[String]) -> Value {
    let mut obj = serde_json::Map::new();
    for (i, name) in col_names.iter().enumerate() {
        obj.insert(name.clone(), row_value_at(row, i));
    }
    Value::Object(obj)
}

/// Extract a column value from a row using SQLite's actual stored type.
/// Uses `get_ref` to avoid i64/f64 coercion issues where REAL values
/// like 100.0 would be returned as integer 100.
fn row_value_at(row: &rusqlite::Row, idx: usize) -> Value {
    use rusqlite::types::ValueRef;
    match row.get_ref(idx) {
        Ok(ValueRef::Integer(v)) => Value::Number(serde_json::Number::from(v)),
        Ok(ValueRef::Real(v)) => serde_json::json!(v),
        Ok(ValueRef::Text(v)) => Value::String(String::from_utf8_lossy(v).into_owned()),
        Ok(ValueRef::Null) => Value::Null,
        Ok(ValueRef::Blob(_)) => Value::Null,
        Err(_) => Value::Null,
    }
}

fn str_field(v: &Value, key: &str) -> Option<String> {
    v.get(key).and_then(Value::as_str).map(String::from)
}

fn num_field(v: &Value, key: &str) -> Option<f64> {
    v.get(key).and_then(Value::as_f64)
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use rusqlite::Connection;

    fn test_db() -> DbState {
        let conn = Connection::open_in_memory().expect("open in-memory db");
        conn.execute_batch(
            "PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;
             PRAGMA synchronous = NORMAL;",
        )
        .expect("pragma setup");
        db::run_migrations_for_test(&conn);
        DbState {
            conn: std::sync::Mutex::new(conn),
            db_path: std::path::PathBuf::from(":memory:"),
        }
    }

    fn create_test_entry(db: &DbState, vehicle_number: &str, entry_time: &str) -> String {
        let payload = serde_json::json!({
            "vehicleNumber": vehicle_number,
            "transportName": "ABC Transport",
            "vehicleType": "4 Wheeler",
            "entryTime": entry_time,
        });
        let result = create_entry(db, &payload).expect("create entry");
        result["entryId"].as_str().unwrap().to_string()
    }

    #[test]
    fn test_create_entry_defaults() {
        let db = test_db();
        let payload = serde_json::json!({
            "vehicleNumber": "mh12ab1234",
            "transportName": "ABC Transport",
            "vehicleType": "6 Wheeler",
            "driverName": "John Doe",
        });
        let result = create_entry(&db, &payload).expect("create");
        assert_eq!(result["success"], true);
        assert_eq!(result["serialNumber"], 1);
        // Vehicle number is normalized to uppercase
        assert_eq!(result["vehicleNumber"], "MH12AB1234");

        let entry_id = result["entryId"].as_str().unwrap();
        let entry = get_entry(&db, entry_id).expect("get");
        assert_eq!(entry["status"], "Active");
        assert_eq!(entry["payment_status"], "Unpaid");
        assert_eq!(entry["parking_fee"], 0.0);
        assert_eq!(entry["driver_name"], "John Doe");
        assert!(entry["exit_time"].is_null());
    }

    #[test]
    fn test_serial_numbers_increment() {
        let db = test_db();
        let first = create_entry(
            &db,
            &serde_json::json!({
                "vehicleNumber": "KA01AA0001",
                "transportName": "T",
                "vehicleType": "2 Wheeler",
            }),
        )
        .expect("first");
        let second = create_entry(
            &db,
            &serde_json::json!({
                "vehicleNumber": "KA01AA0002",
                "transportName": "T",
                "vehicleType": "2 Wheeler",
            }),
        )
        .expect("second");
        assert_eq!(first["serialNumber"], 1);
        assert_eq!(second["serialNumber"], 2);
    }

    #[test]
    fn test_vehicle_number_validation() {
        assert!(validate_vehicle_number("ABC123").is_ok());
        assert_eq!(validate_vehicle_number("mh12ab1234").unwrap(), "MH12AB1234");

        assert!(validate_vehicle_number("").is_err());
        assert!(validate_vehicle_number("   ").is_err());
        assert!(validate_vehicle_number("AB").is_err());
        assert!(validate_vehicle_number("!@#").is_err());
    }

    #[test]
    fn test_unknown_vehicle_type_rejected() {
        let db = test_db();
        let err = create_entry(
            &db,
            &serde_json::json!({
                "vehicleNumber": "KA01AB1234",
                "transportName": "T",
                "vehicleType": "Hovercraft",
            }),
        )
        .expect_err("should reject");
        assert!(err.contains("Invalid vehicle type"), "got: {err}");
    }

    #[test]
    fn test_duplicate_parked_vehicle_rejected() {
        let db = test_db();
        create_test_entry(&db, "KA01AB1234", "2026-01-15T10:00:00+00:00");

        let err = create_entry(
            &db,
            &serde_json::json!({
                "vehicleNumber": "ka01ab1234",
                "transportName": "Other Transport",
                "vehicleType": "4 Wheeler",
            }),
        )
        .expect_err("second open entry should be rejected");
        assert!(err.contains("already parked"), "got: {err}");
    }

    #[test]
    fn test_exit_computes_day_based_fee() {
        let db = test_db();
        let entry_id = create_test_entry(&db, "KA01AB1234", "2026-01-15T10:00:00+00:00");

        // 25 hours later: 2 chargeable days, 4 Wheeler = 100/day. The second
        // hour past the 24h threshold also accrues 1 penalty day at 50%.
        let result = process_exit(
            &db,
            &serde_json::json!({
                "entryId": entry_id,
                "paymentType": "Cash",
                "exitTime": "2026-01-16T11:00:00+00:00",
            }),
        )
        .expect("exit");
        assert_eq!(result["success"], true);
        assert_eq!(result["feeBreakdown"]["chargeable_days"], 2);
        assert_eq!(result["feeBreakdown"]["base_fee"], 200.0);
        assert_eq!(result["feeBreakdown"]["penalty_fee"], 50.0);
        assert_eq!(result["fee"], 250.0);

        let entry = get_entry(&db, &entry_id).expect("get");
        assert_eq!(entry["status"], "Exited");
        assert_eq!(entry["payment_status"], "Paid");
        assert_eq!(entry["payment_type"], "Cash");
        assert_eq!(entry["parking_fee"], 250.0);
    }

    #[test]
    fn test_exit_links_to_active_shift() {
        let db = test_db();
        let entry_id = create_test_entry(&db, "KA01AB1234", "2026-01-15T10:00:00+00:00");

        {
            let conn = db.conn.lock().unwrap();
            conn.execute(
                "INSERT INTO shift_sessions (id, employee_name, shift_start_time, opening_cash_amount,
                    status, sync_status, created_at, updated_at)
                 VALUES ('shift-1', 'Op One', datetime('now'), 500.0, 'active', 'pending',
                    datetime('now'), datetime('now'))",
                [],
            )
            .unwrap();
        }

        let result = process_exit(
            &db,
            &serde_json::json!({
                "entryId": entry_id,
                "paymentType": "UPI",
                "exitTime": "2026-01-15T14:00:00+00:00",
            }),
        )
        .expect("exit");
        assert_eq!(result["shiftSessionId"], "shift-1");

        let entry = get_entry(&db, &entry_id).expect("get");
        assert_eq!(entry["shift_session_id"], "shift-1");
    }

    #[test]
    fn test_exit_without_shift_leaves_link_null() {
        let db = test_db();
        let entry_id = create_test_entry(&db, "KA01AB1234", "2026-01-15T10:00:00+00:00");

        process_exit(
            &db,
            &serde_json::json!({
                "entryId": entry_id,
                "paymentType": "Cash",
                "exitTime": "2026-01-15T12:00:00+00:00",
            }),
        )
        .expect("exit");

        let entry = get_entry(&db, &entry_id).expect("get");
        assert!(entry["shift_session_id"].is_null());
    }

    #[test]
    fn test_fee_override_recorded_in_audit() {
        let db = test_db();
        let entry_id = create_test_entry(&db, "KA01AB1234", "2026-01-15T10:00:00+00:00");

        let result = process_exit(
            &db,
            &serde_json::json!({
                "entryId": entry_id,
                "paymentType": "Cash",
                "exitTime": "2026-01-15T12:00:00+00:00",
                "feeOverride": 75.0,
            }),
        )
        .expect("exit");
        assert_eq!(result["fee"], 75.0);
        assert_eq!(result["feeOverridden"], true);

        let trail = get_audit_trail(&db, &entry_id).expect("trail");
        let exit_event = trail
            .as_array()
            .unwrap()
            .iter()
            .find(|e| e["action"] == "exit_processed")
            .expect("exit audit row");
        assert_eq!(exit_event["newValues"]["feeOverridden"], true);
        assert_eq!(exit_event["newValues"]["parkingFee"], 75.0);
        assert_eq!(exit_event["newValues"]["calculatedFee"], 100.0);
    }

    #[test]
    fn test_double_exit_rejected() {
        let db = test_db();
        let entry_id = create_test_entry(&db, "KA01AB1234", "2026-01-15T10:00:00+00:00");

        process_exit(
            &db,
            &serde_json::json!({
                "entryId": entry_id,
                "paymentType": "Cash",
                "exitTime": "2026-01-15T12:00:00+00:00",
            }),
        )
        .expect("first exit");

        let err = process_exit(
            &db,
            &serde_json::json!({
                "entryId": entry_id,
                "paymentType": "Cash",
            }),
        )
        .expect_err("second exit should fail");
        assert!(err.contains("already exited"), "got: {err}");
    }

    #[test]
    fn test_exit_by_vehicle_number() {
        let db = test_db();
        create_test_entry(&db, "KA01AB1234", "2026-01-15T10:00:00+00:00");

        let result = process_exit(
            &db,
            &serde_json::json!({
                "vehicleNumber": "ka01ab1234",
                "paymentType": "Cash",
                "exitTime": "2026-01-15T12:00:00+00:00",
            }),
        )
        .expect("exit by vehicle number");
        assert_eq!(result["success"], true);
    }

    #[test]
    fn test_update_entry_audits_changes() {
        let db = test_db();
        let entry_id = create_test_entry(&db, "KA01AB1234", "2026-01-15T10:00:00+00:00");

        let result = update_entry(
            &db,
            &serde_json::json!({
                "entryId": entry_id,
                "driverName": "New Driver",
                "notes": "Corrected details",
            }),
        )
        .expect("update");
        assert_eq!(result["updated"], 2);

        let entry = get_entry(&db, &entry_id).expect("get");
        assert_eq!(entry["driver_name"], "New Driver");

        let trail = get_audit_trail(&db, &entry_id).expect("trail");
        let update_event = trail
            .as_array()
            .unwrap()
            .iter()
            .find(|e| e["action"] == "updated")
            .expect("update audit row");
        assert_eq!(update_event["newValues"]["driver_name"], "New Driver");
    }

    #[test]
    fn test_refresh_overstays_flags_old_entries() {
        let db = test_db();
        // Parked 30 hours ago — past the default 24h threshold
        let old_time = (Utc::now() - chrono::Duration::hours(30)).to_rfc3339();
        let old_id = create_test_entry(&db, "KA01AA0001", &old_time);
        // Parked 1 hour ago — within threshold
        let recent_time = (Utc::now() - chrono::Duration::hours(1)).to_rfc3339();
        let recent_id = create_test_entry(&db, "KA01AA0002", &recent_time);

        let result = refresh_overstays(&db).expect("refresh");
        assert_eq!(result["flagged"], 1);

        let old_entry = get_entry(&db, &old_id).expect("get old");
        assert_eq!(old_entry["status"], "Overstay");
        let recent_entry = get_entry(&db, &recent_id).expect("get recent");
        assert_eq!(recent_entry["status"], "Active");

        // Overstayed vehicle can still exit (and still counts as parked until then)
        {
            let conn = db.conn.lock().unwrap();
            assert_eq!(parked_count(&conn), 2);
        }
        process_exit(
            &db,
            &serde_json::json!({ "entryId": old_id, "paymentType": "Cash" }),
        )
        .expect("exit overstayed vehicle");
    }

    #[test]
    fn test_list_entries_filters() {
        let db = test_db();
        let e1 = create_test_entry(&db, "KA01AA0001", "2026-01-15T10:00:00+00:00");
        create_test_entry(&db, "MH02BB0002", "2026-01-16T10:00:00+00:00");

        process_exit(
            &db,
            &serde_json::json!({
                "entryId": e1,
                "paymentType": "Cash",
                "exitTime": "2026-01-15T12:00:00+00:00",
            }),
        )
        .expect("exit");

        let exited = list_entries(&db, &serde_json::json!({ "status": "Exited" })).expect("list");
        assert_eq!(exited.as_array().unwrap().len(), 1);

        let by_search = list_entries(&db, &serde_json::json!({ "search": "mh02" })).expect("list");
        assert_eq!(by_search.as_array().unwrap().len(), 1);
        assert_eq!(by_search[0]["vehicle_number"], "MH02BB0002");

        let by_date = list_entries(
            &db,
            &serde_json::json!({ "dateFrom": "2026-01-16T00:00:00+00:00" }),
        )
        .expect("list");
        assert_eq!(by_date.as_array().unwrap().len(), 1);
    }

    #[test]
    fn test_audit_trail_is_ordered() {
        let db = test_db();
        let entry_id = create_test_entry(&db, "KA01AB1234", "2026-01-15T10:00:00+00:00");
        update_entry(
            &db,
            &serde_json::json!({ "entryId": entry_id, "driverName": "Someone" }),
        )
        .expect("update");
        process_exit(
            &db,
            &serde_json::json!({
                "entryId": entry_id,
                "paymentType": "Cash",
                "exitTime": "2026-01-15T12:00:00+00:00",
            }),
        )
        .expect("exit");

        let trail = get_audit_trail(&db, &entry_id).expect("trail");
        let actions: Vec<&str> = trail
            .as_array()
            .unwrap()
            .iter()
            .map(|e| e["action"].as_str().unwrap())
            .collect();
        assert_eq!(actions, vec!["created", "updated", "exit_processed"]);
    }
}
