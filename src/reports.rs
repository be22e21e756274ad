//! Reporting for ParkPoint.
//!
//! Two surfaces: live dashboard statistics for the current day, and
//! persisted end-of-day snapshots in `daily_reports` (idempotent per date,
//! enqueued for sync to the admin dashboard).

use chrono::Utc;
use rusqlite::{params, Connection};
use serde_json::Value;
use tracing::info;
use uuid::Uuid;

use crate::db::DbState;
use crate::entries;

// ---------------------------------------------------------------------------
// Live statistics
// ---------------------------------------------------------------------------

/// Dashboard numbers for today: traffic, occupancy, and realized revenue.
pub fn today_statistics(db: &DbState) -> Result<Value, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    let today = Utc::now().format("%Y-%m-%d").to_string();
    day_statistics(&conn, &today)
}

/// Statistics for one calendar date (UTC, matching the stored RFC 3339
/// timestamps).
fn day_statistics(conn: &Connection, date: &str) -> Result<Value, String> {
    let vehicles_entered: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM parking_entries WHERE substr(entry_time, 1, 10) = ?1",
            params![date],
            |row| row.get(0),
        )
        .map_err(|e| format!("count entries: {e}"))?;

    let vehicles_exited: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM parking_entries
             WHERE status = 'Exited' AND substr(exit_time, 1, 10) = ?1",
            params![date],
            |row| row.get(0),
        )
        .map_err(|e| format!("count exits: {e}"))?;

    let (cash_revenue, digital_revenue) = day_revenue(conn, date)?;

    let unpaid_exits: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM parking_entries
             WHERE status = 'Exited' AND substr(exit_time, 1, 10) = ?1
               AND payment_status != 'Paid'",
            params![date],
            |row| row.get(0),
        )
        .map_err(|e| format!("count unpaid: {e}"))?;

    let overstays: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM parking_entries WHERE status = 'Overstay'",
            [],
            |row| row.get(0),
        )
        .map_err(|e| format!("count overstays: {e}"))?;

    Ok(serde_json::json!({
        "date": date,
        "vehiclesEntered": vehicles_entered,
        "vehiclesExited": vehicles_exited,
        "currentlyParked": entries::parked_count(conn),
        "overstays": overstays,
        "unpaidExits": unpaid_exits,
        "cashRevenue": cash_revenue,
        "digitalRevenue": digital_revenue,
        "totalRevenue": cash_revenue + digital_revenue,
    }))
}

/// Realized revenue for a date, bucketed by payment type the same way the
/// shift aggregator buckets it.
fn day_revenue(conn: &Connection, date: &str) -> Result<(f64, f64), String> {
    let mut stmt = conn
        .prepare(
            "SELECT COALESCE(payment_type, ''), COALESCE(parking_fee, 0)
             FROM parking_entries
             WHERE status = 'Exited' AND payment_status = 'Paid'
               AND substr(exit_time, 1, 10) = ?1",
        )
        .map_err(|e| format!("prepare day revenue: {e}"))?;

    let rows: Vec<(String, f64)> = stmt
        .query_map(params![date], |row| Ok((row.get(0)?, row.get(1)?)))
        .map_err(|e| format!("query day revenue: {e}"))?
        .filter_map(|r| r.ok())
        .collect();

    let mut cash = 0.0;
    let mut digital = 0.0;
    for (payment_type, fee) in rows {
        if payment_type.eq_ignore_ascii_case("cash") {
            cash += fee;
        } else if payment_type.eq_ignore_ascii_case("digital")
            || payment_type.eq_ignore_ascii_case("upi")
            || payment_type.eq_ignore_ascii_case("card")
        {
            digital += fee;
        }
    }
    Ok((cash, digital))
}

// ---------------------------------------------------------------------------
// Daily report generation
// ---------------------------------------------------------------------------

/// Generate the end-of-day snapshot for a date (default: today).
///
/// **Idempotent:** if a report already exists for the date, returns the
/// existing one without creating a duplicate.
pub fn generate_daily_report(db: &DbState, payload: &Value) -> Result<Value, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;

    let report_date = payload
        .get("reportDate")
        .or_else(|| payload.get("report_date"))
        .and_then(Value::as_str)
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| Utc::now().format("%Y-%m-%d").to_string());

    // Idempotency check
    let existing: Option<String> = conn
        .query_row(
            "SELECT id FROM daily_reports WHERE report_date = ?1",
            params![report_date],
            |row| row.get(0),
        )
        .ok();
    if let Some(existing_id) = existing {
        let report = get_report_by_id(&conn, &existing_id)?;
        return Ok(serde_json::json!({
            "success": true,
            "existing": true,
            "reportId": existing_id,
            "report": report,
        }));
    }

    let stats = day_statistics(&conn, &report_date)?;

    // Revenue by vehicle type
    let mut vt_stmt = conn
        .prepare(
            "SELECT vehicle_type, COUNT(*), COALESCE(SUM(parking_fee), 0)
             FROM parking_entries
             WHERE status = 'Exited' AND payment_status = 'Paid'
               AND substr(exit_time, 1, 10) = ?1
             GROUP BY vehicle_type ORDER BY vehicle_type",
        )
        .map_err(|e| format!("prepare vehicle breakdown: {e}"))?;
    let by_vehicle_type: Vec<Value> = vt_stmt
        .query_map(params![report_date], |row| {
            Ok(serde_json::json!({
                "vehicleType": row.get::<_, String>(0)?,
                "count": row.get::<_, i64>(1)?,
                "revenue": row.get::<_, f64>(2)?,
            }))
        })
        .map_err(|e| format!("query vehicle breakdown: {e}"))?
        .filter_map(|r| r.ok())
        .collect();
    drop(vt_stmt);

    // Expenses and deposits recorded that day (regardless of owning shift)
    let expenses_total: f64 = conn
        .query_row(
            "SELECT COALESCE(SUM(amount), 0) FROM shift_expenses
             WHERE substr(created_at, 1, 10) = ?1",
            params![report_date],
            |row| row.get(0),
        )
        .map_err(|e| format!("sum day expenses: {e}"))?;
    let deposits_total: f64 = conn
        .query_row(
            "SELECT COALESCE(SUM(cash_amount) + SUM(digital_amount), 0) FROM shift_deposits
             WHERE substr(created_at, 1, 10) = ?1",
            params![report_date],
            |row| row.get(0),
        )
        .map_err(|e| format!("sum day deposits: {e}"))?;

    // Shifts that ended that day, with their reconciliation outcomes
    let mut shift_stmt = conn
        .prepare(
            "SELECT id, employee_name, status, opening_cash_amount, closing_cash_amount,
                    expected_cash_amount, cash_discrepancy
             FROM shift_sessions
             WHERE shift_end_time IS NOT NULL AND substr(shift_end_time, 1, 10) = ?1
             ORDER BY shift_end_time ASC",
        )
        .map_err(|e| format!("prepare shift outcomes: {e}"))?;
    let shift_outcomes: Vec<Value> = shift_stmt
        .query_map(params![report_date], |row| {
            Ok(serde_json::json!({
                "shiftId": row.get::<_, String>(0)?,
                "employeeName": row.get::<_, String>(1)?,
                "status": row.get::<_, String>(2)?,
                "openingCash": row.get::<_, f64>(3)?,
                "closingCash": row.get::<_, Option<f64>>(4)?,
                "expectedCash": row.get::<_, Option<f64>>(5)?,
                "discrepancy": row.get::<_, Option<f64>>(6)?,
            }))
        })
        .map_err(|e| format!("query shift outcomes: {e}"))?
        .filter_map(|r| r.ok())
        .collect();
    drop(shift_stmt);

    let vehicles_entered = stats["vehiclesEntered"].as_i64().unwrap_or(0);
    let vehicles_exited = stats["vehiclesExited"].as_i64().unwrap_or(0);
    let cash_revenue = stats["cashRevenue"].as_f64().unwrap_or(0.0);
    let digital_revenue = stats["digitalRevenue"].as_f64().unwrap_or(0.0);
    let shifts_count = shift_outcomes.len() as i64;

    let report_json = serde_json::json!({
        "statistics": stats,
        "byVehicleType": by_vehicle_type,
        "shifts": shift_outcomes,
        "expensesTotal": expenses_total,
        "depositsTotal": deposits_total,
    });

    let report_id = Uuid::new_v4().to_string();
    let now = Utc::now().to_rfc3339();

    conn.execute_batch("BEGIN IMMEDIATE")
        .map_err(|e| format!("begin transaction: {e}"))?;

    let result = (|| -> Result<(), String> {
        conn.execute(
            "INSERT INTO daily_reports (
                id, report_date, generated_at, vehicles_entered, vehicles_exited,
                cash_revenue, digital_revenue, total_revenue, expenses_total,
                deposits_total, shifts_count, report_json, sync_state, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, 'pending', ?3, ?3)",
            params![
                report_id,
                report_date,
                now,
                vehicles_entered,
                vehicles_exited,
                cash_revenue,
                digital_revenue,
                cash_revenue + digital_revenue,
                expenses_total,
                deposits_total,
                shifts_count,
                report_json.to_string(),
            ],
        )
        .map_err(|e| format!("insert report: {e}"))?;

        let idempotency_key = format!("report:{report_date}");
        conn.execute(
            "INSERT OR IGNORE INTO sync_queue (entity_type, entity_id, operation, payload, idempotency_key)
             VALUES ('daily_report', ?1, 'insert', ?2, ?3)",
            params![report_id, report_json.to_string(), idempotency_key],
        )
        .map_err(|e| format!("enqueue report sync: {e}"))?;

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

    info!(report_id = %report_id, date = %report_date, "Daily report generated");

    let report = get_report_by_id(&conn, &report_id)?;
    Ok(serde_json::json!({
        "success": true,
        "existing": false,
        "reportId": report_id,
        "report": report,
    }))
}

// ---------------------------------------------------------------------------
// Report queries
// ---------------------------------------------------------------------------

fn get_report_by_id(conn: &Connection, report_id: &str) -> Result<Value, String> {
    conn.query_row(
        "SELECT id, report_date, generated_at, vehicles_entered, vehicles_exited,
                cash_revenue, digital_revenue, total_revenue, expenses_total,
                deposits_total, shifts_count, report_json
         FROM daily_reports WHERE id = ?1",
        params![report_id],
        |row| {
            let report_json: String = row.get(11)?;
            Ok(serde_json::json!({
                "id": row.get::<_, String>(0)?,
                "reportDate": row.get::<_, String>(1)?,
                "generatedAt": row.get::<_, String>(2)?,
                "vehiclesEntered": row.get::<_, i64>(3)?,
                "vehiclesExited": row.get::<_, i64>(4)?,
                "cashRevenue": row.get::<_, f64>(5)?,
                "digitalRevenue": row.get::<_, f64>(6)?,
                "totalRevenue": row.get::<_, f64>(7)?,
                "expensesTotal": row.get::<_, f64>(8)?,
                "depositsTotal": row.get::<_, f64>(9)?,
                "shiftsCount": row.get::<_, i64>(10)?,
                "details": serde_json::from_str::<Value>(&report_json).unwrap_or(Value::Null),
            }))
        },
    )
    .map_err(|_| format!("Report not found: {report_id}"))
}

/// Get a report by date (`YYYY-MM-DD`), or null when none was generated.
pub fn get_report(db: &DbState, report_date: &str) -> Result<Value, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    let id: Option<String> = conn
        .query_row(
            "SELECT id FROM daily_reports WHERE report_date = ?1",
            params![report_date],
            |row| row.get(0),
        )
        .ok();
    match id {
        Some(id) => get_report_by_id(&conn, &id),
        None => Ok(Value::Null),
    }
}

/// List report summaries, newest first.
pub fn list_reports(db: &DbState, payload: &Value) -> Result<Value, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    let limit = payload
        .get("limit")
        .and_then(Value::as_i64)
        .unwrap_or(30);

    let mut stmt = conn
        .prepare(
            "SELECT id, report_date, generated_at, total_revenue, vehicles_entered,
                    vehicles_exited, shifts_count, sync_state
             FROM daily_reports ORDER BY report_date DESC LIMIT ?1",
        )
        .map_err(|e| format!("prepare report list: {e}"))?;

    let rows = stmt
        .query_map(params![limit], |row| {
            Ok(serde_json::json!({
                "id": row.get::<_, String>(0)?,
                "reportDate": row.get::<_, String>(1)?,
                "generatedAt": row.get::<_, String>(2)?,
                "totalRevenue": row.get::<_, f64>(3)?,
                "vehiclesEntered": row.get::<_, i64>(4)?,
                "vehiclesExited": row.get::<_, i64>(5)?,
                "shiftsCount": row.get::<_, i64>(6)?,
                "syncState": row.get::<_, String>(7)?,
            }))
        })
        .map_err(|e| format!("query report list: {e}"))?;

    let items: Vec<Value> = rows.filter_map(|r| r.ok()).collect();
    Ok(serde_json::json!(items))
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

    /// Seed one exited entry with fixed timestamps on 2026-02-03.
    fn seed_entry(
        db: &DbState,
        id: &str,
        vehicle_type: &str,
        fee: f64,
        payment_type: &str,
        payment_status: &str,
    ) {
        let conn = db.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO parking_entries (id, serial_number, transport_name, vehicle_type,
                vehicle_number, entry_time, exit_time, status, parking_fee, payment_status,
                payment_type, sync_status, created_at, updated_at)
             VALUES (?1, 1, 'T', ?2, ?3, '2026-02-03T06:00:00+00:00', '2026-02-03T18:00:00+00:00',
                'Exited', ?4, ?5, ?6, 'pending', datetime('now'), datetime('now'))",
            params![id, vehicle_type, format!("KA{id}"), fee, payment_status, payment_type],
        )
        .unwrap();
    }

    fn seed_ended_shift(db: &DbState, id: &str, end_time: &str, discrepancy: f64) {
        let conn = db.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO shift_sessions (id, employee_name, shift_start_time, shift_end_time,
                opening_cash_amount, closing_cash_amount, expected_cash_amount, cash_discrepancy,
                status, sync_status, created_at, updated_at)
             VALUES (?1, 'Asha', '2026-02-03T06:00:00+00:00', ?2,
                1000.0, 1200.0, ?3, ?4, 'completed', 'pending', datetime('now'), datetime('now'))",
            params![id, end_time, 1200.0 - discrepancy, discrepancy],
        )
        .unwrap();
    }

    #[test]
    fn test_generate_daily_report_totals() {
        let db = test_db();
        seed_entry(&db, "e1", "4 Wheeler", 100.0, "Cash", "Paid");
        seed_entry(&db, "e2", "Trailer", 225.0, "UPI", "Paid");
        seed_entry(&db, "e3", "4 Wheeler", 100.0, "Cash", "Unpaid"); // excluded from revenue
        seed_ended_shift(&db, "s1", "2026-02-03T14:00:00+00:00", 0.0);

        let result = generate_daily_report(&db, &serde_json::json!({ "reportDate": "2026-02-03" }))
            .expect("generate");
        assert_eq!(result["success"], true);
        assert_eq!(result["existing"], false);

        let report = &result["report"];
        assert_eq!(report["reportDate"], "2026-02-03");
        assert_eq!(report["vehiclesExited"], 3);
        assert_eq!(report["cashRevenue"], 100.0);
        assert_eq!(report["digitalRevenue"], 225.0);
        assert_eq!(report["totalRevenue"], 325.0);
        assert_eq!(report["shiftsCount"], 1);

        // Vehicle-type breakdown only counts realized revenue
        let by_type = report["details"]["byVehicleType"].as_array().unwrap();
        let four_wheeler = by_type
            .iter()
            .find(|v| v["vehicleType"] == "4 Wheeler")
            .unwrap();
        assert_eq!(four_wheeler["revenue"], 100.0);
    }

    #[test]
    fn test_generate_daily_report_is_idempotent() {
        let db = test_db();
        seed_entry(&db, "e1", "4 Wheeler", 100.0, "Cash", "Paid");

        let first = generate_daily_report(&db, &serde_json::json!({ "reportDate": "2026-02-03" }))
            .expect("first");
        let second = generate_daily_report(&db, &serde_json::json!({ "reportDate": "2026-02-03" }))
            .expect("second");

        assert_eq!(second["existing"], true);
        assert_eq!(first["reportId"], second["reportId"]);

        let conn = db.conn.lock().unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM daily_reports", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_get_report_by_date_and_listing() {
        let db = test_db();
        seed_entry(&db, "e1", "4 Wheeler", 100.0, "Cash", "Paid");
        generate_daily_report(&db, &serde_json::json!({ "reportDate": "2026-02-03" }))
            .expect("generate");

        let report = get_report(&db, "2026-02-03").expect("get");
        assert_eq!(report["reportDate"], "2026-02-03");

        let missing = get_report(&db, "2026-02-04").expect("get missing");
        assert!(missing.is_null());

        let list = list_reports(&db, &serde_json::json!({})).expect("list");
        assert_eq!(list.as_array().unwrap().len(), 1);
        assert_eq!(list[0]["syncState"], "pending");
    }

    #[test]
    fn test_shift_discrepancies_in_report() {
        let db = test_db();
        seed_ended_shift(&db, "s1", "2026-02-03T14:00:00+00:00", 150.0);
        seed_ended_shift(&db, "s2", "2026-02-03T22:00:00+00:00", -20.0);

        let result = generate_daily_report(&db, &serde_json::json!({ "reportDate": "2026-02-03" }))
            .expect("generate");
        let shifts = result["report"]["details"]["shifts"].as_array().unwrap();
        assert_eq!(shifts.len(), 2);
        assert_eq!(shifts[0]["discrepancy"], 150.0);
        assert_eq!(shifts[1]["discrepancy"], -20.0);
    }

    #[test]
    fn test_today_statistics_counts_open_entries() {
        let db = test_db();
        let now = Utc::now().to_rfc3339();
        {
            let conn = db.conn.lock().unwrap();
            conn.execute(
                "INSERT INTO parking_entries (id, serial_number, transport_name, vehicle_type,
                    vehicle_number, entry_time, status, sync_status, created_at, updated_at)
                 VALUES ('e1', 1, 'T', '4 Wheeler', 'KA01', ?1, 'Active', 'pending',
                    datetime('now'), datetime('now'))",
                params![now],
            )
            .unwrap();
        }

        let stats = today_statistics(&db).expect("stats");
        assert_eq!(stats["vehiclesEntered"], 1);
        assert_eq!(stats["currentlyParked"], 1);
        assert_eq!(stats["vehiclesExited"], 0);
        assert_eq!(stats["totalRevenue"], 0.0);
    }
}
