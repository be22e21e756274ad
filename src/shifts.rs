//! Shift management for ParkPoint.
//!
//! Implements the shift lifecycle (start, end, handover, emergency end)
//! with cash reconciliation at every transition. Revenue is attributed to a
//! shift through `parking_entries.shift_session_id`, expenses and deposits
//! are shift-scoped rows, and the expected-cash arithmetic lives in
//! [`crate::reconcile`]. Multi-write transitions run inside a single
//! `BEGIN IMMEDIATE` transaction so a persistence failure can never leave a
//! half-ended shift behind.

use chrono::Utc;
use rusqlite::{params, Connection};
use serde_json::Value;
use tracing::{info, warn};
use uuid::Uuid;

use crate::db::DbState;
use crate::reconcile::{self, Reconciliation, ShiftTotals};

/// Expense categories accepted by `record_expense` (mirrors the CHECK
/// constraint on `shift_expenses`).
pub const EXPENSE_CATEGORIES: &[&str] = &[
    "fuel",
    "maintenance",
    "supplies",
    "salary_advance",
    "utilities",
    "other",
];

// ---------------------------------------------------------------------------
// Ledger aggregation
// ---------------------------------------------------------------------------

/// Aggregate the shift's ledgers into a reconciliation snapshot.
///
/// Revenue counts only `Exited` entries with `payment_status = 'Paid'`;
/// `Cash` buckets to cash revenue, `Digital` / `UPI` / `Card` to digital.
/// A payment type outside that set contributes to neither bucket (it still
/// counts toward vehicles processed) and is logged for follow-up.
pub fn aggregate_totals(
    conn: &Connection,
    shift_id: &str,
    opening_cash: f64,
) -> Result<ShiftTotals, String> {
    let mut stmt = conn
        .prepare(
            "SELECT COALESCE(payment_type, ''), COALESCE(parking_fee, 0)
             FROM parking_entries
             WHERE shift_session_id = ?1 AND status = 'Exited' AND payment_status = 'Paid'",
        )
        .map_err(|e| format!("prepare revenue query: {e}"))?;

    let rows: Vec<(String, f64)> = stmt
        .query_map(params![shift_id], |row| Ok((row.get(0)?, row.get(1)?)))
        .map_err(|e| format!("query revenue: {e}"))?
        .filter_map(|r| r.ok())
        .collect();
    drop(stmt);

    let mut cash_revenue = 0.0;
    let mut digital_revenue = 0.0;
    let mut vehicles_processed = 0i64;

    for (payment_type, fee) in &rows {
        vehicles_processed += 1;
        if payment_type.eq_ignore_ascii_case("cash") {
            cash_revenue += fee;
        } else if payment_type.eq_ignore_ascii_case("digital")
            || payment_type.eq_ignore_ascii_case("upi")
            || payment_type.eq_ignore_ascii_case("card")
        {
            digital_revenue += fee;
        } else {
            warn!(
                shift_id = %shift_id,
                payment_type = %payment_type,
                fee = %fee,
                "Entry with unrecognized payment type excluded from revenue buckets"
            );
        }
    }

    let total_expenses: f64 = conn
        .query_row(
            "SELECT COALESCE(SUM(amount), 0) FROM shift_expenses WHERE shift_session_id = ?1",
            params![shift_id],
            |row| row.get(0),
        )
        .map_err(|e| format!("sum expenses: {e}"))?;

    let (cash_deposits, digital_deposits): (f64, f64) = conn
        .query_row(
            "SELECT COALESCE(SUM(cash_amount), 0), COALESCE(SUM(digital_amount), 0)
             FROM shift_deposits WHERE shift_session_id = ?1",
            params![shift_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .map_err(|e| format!("sum deposits: {e}"))?;

    Ok(ShiftTotals {
        opening_cash,
        cash_revenue,
        digital_revenue,
        vehicles_processed,
        total_expenses,
        cash_deposits,
        digital_deposits,
    })
}

// ---------------------------------------------------------------------------
// Start shift
// ---------------------------------------------------------------------------

/// Start a new shift.
///
/// Requires an operator name and an opening cash amount. Rejects the start
/// while any shift is `active` — the check and the insert share one
/// `BEGIN IMMEDIATE` transaction, so two concurrent starts cannot both
/// pass the check.
pub fn start_shift(db: &DbState, payload: &Value) -> Result<Value, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;

    let employee_name = str_field(payload, "employeeName")
        .or_else(|| str_field(payload, "employee_name"))
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or("Missing employeeName")?;
    let employee_id =
        str_field(payload, "employeeId").or_else(|| str_field(payload, "employee_id"));
    let opening_cash = num_field(payload, "openingCash")
        .or_else(|| num_field(payload, "opening_cash"))
        .ok_or("Missing openingCash")?;
    if opening_cash < 0.0 {
        return Err("Opening cash cannot be negative".into());
    }
    let notes = str_field(payload, "notes");

    let shift_id = Uuid::new_v4().to_string();
    let now = Utc::now().to_rfc3339();

    conn.execute_batch("BEGIN IMMEDIATE")
        .map_err(|e| format!("begin transaction: {e}"))?;

    let result = (|| -> Result<(), String> {
        // One drawer, one active shift. Checked inside the transaction.
        let existing: Option<(String, String)> = conn
            .query_row(
                "SELECT id, employee_name FROM shift_sessions WHERE status = 'active' LIMIT 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .ok();
        if let Some((active_id, active_name)) = existing {
            return Err(format!(
                "A shift is already active for {active_name} ({active_id}). End it before starting a new one."
            ));
        }

        conn.execute(
            "INSERT INTO shift_sessions (
                id, employee_id, employee_name, shift_start_time, opening_cash_amount,
                status, shift_notes, sync_status, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, 'active', ?6, 'pending', ?4, ?4)",
            params![shift_id, employee_id, employee_name, now, opening_cash, notes],
        )
        .map_err(|e| format!("insert shift: {e}"))?;

        let idempotency_key = format!("shift:start:{shift_id}");
        let sync_payload = serde_json::json!({
            "shiftId": &shift_id,
            "employeeId": &employee_id,
            "employeeName": &employee_name,
            "shiftStartTime": &now,
            "openingCash": opening_cash,
        })
        .to_string();
        conn.execute(
            "INSERT INTO sync_queue (entity_type, entity_id, operation, payload, idempotency_key)
             VALUES ('shift', ?1, 'insert', ?2, ?3)",
            params![shift_id, sync_payload, idempotency_key],
        )
        .map_err(|e| format!("enqueue shift sync: {e}"))?;

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

    info!(shift_id = %shift_id, employee = %employee_name, opening_cash = %opening_cash, "Shift started");

    Ok(serde_json::json!({
        "success": true,
        "shiftId": shift_id,
        "message": format!("Shift started for {employee_name}"),
    }))
}

/// Opening cash suggestion for the start-shift form: the most recently
/// ended shift's closing cash, or zero for the first shift ever.
pub fn suggested_opening_cash(db: &DbState) -> Result<Value, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    let suggestion: Option<f64> = conn
        .query_row(
            "SELECT closing_cash_amount FROM shift_sessions
             WHERE status != 'active' AND closing_cash_amount IS NOT NULL
             ORDER BY shift_end_time DESC LIMIT 1",
            [],
            |row| row.get(0),
        )
        .ok();
    Ok(serde_json::json!({ "suggestedOpeningCash": suggestion.unwrap_or(0.0) }))
}

// ---------------------------------------------------------------------------
// Shift queries
// ---------------------------------------------------------------------------

/// Get the active shift, or null when none is running.
pub fn get_active(db: &DbState) -> Result<Value, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    query_shift(
        &conn,
        "SELECT * FROM shift_sessions WHERE status = 'active' LIMIT 1",
        [],
    )
}

/// Get a shift by id, or null.
pub fn get_shift(db: &DbState, shift_id: &str) -> Result<Value, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    query_shift(
        &conn,
        "SELECT * FROM shift_sessions WHERE id = ?1",
        params![shift_id],
    )
}

/// List recent shifts, newest first.
pub fn list_shifts(db: &DbState, payload: &Value) -> Result<Value, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    let date_from = str_field(payload, "dateFrom").or_else(|| str_field(payload, "date_from"));
    let date_to = str_field(payload, "dateTo").or_else(|| str_field(payload, "date_to"));
    let limit = num_field(payload, "limit").map(|n| n as i64).unwrap_or(50);

    let mut stmt = conn
        .prepare(
            "SELECT * FROM shift_sessions
             WHERE (?1 IS NULL OR shift_start_time >= ?1)
               AND (?2 IS NULL OR shift_start_time <= ?2)
             ORDER BY shift_start_time DESC
             LIMIT ?3",
        )
        .map_err(|e| format!("prepare shift list: {e}"))?;

    let col_names: Vec<String> = stmt
        .column_names()
        .into_iter()
        .map(|s| s.to_string())
        .collect();
    let rows = stmt
        .query_map(params![date_from, date_to, limit], |row| {
            Ok(row_to_json(row, &col_names))
        })
        .map_err(|e| format!("query shift list: {e}"))?;

    let items: Vec<Value> = rows.filter_map(|r| r.ok()).collect();
    Ok(serde_json::json!(items))
}

// ---------------------------------------------------------------------------
// Live cash status
// ---------------------------------------------------------------------------

/// Current drawer snapshot for the active shift: aggregated ledgers and the
/// expected cash-on-hand. The command layer converts an error here into a
/// "reconciliation unavailable" response so a fetch failure is never shown
/// as a zero balance.
pub fn cash_status(db: &DbState) -> Result<Value, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;

    let (shift_id, opening_cash): (String, f64) = conn
        .query_row(
            "SELECT id, opening_cash_amount FROM shift_sessions WHERE status = 'active' LIMIT 1",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .map_err(|_| "No active shift".to_string())?;

    let totals = aggregate_totals(&conn, &shift_id, opening_cash)?;
    let expected = totals.expected_closing_cash();

    Ok(serde_json::json!({
        "shiftId": shift_id,
        "totals": totals,
        "expectedClosingCash": expected,
        "asOf": Utc::now().to_rfc3339(),
    }))
}

/// Recompute the reconciliation preview for an entered count without
/// persisting anything. The UI calls this whenever any input changes.
pub fn preview_reconciliation(db: &DbState, entered_closing_cash: f64) -> Result<Value, String> {
    if entered_closing_cash < 0.0 {
        return Err("Closing cash cannot be negative".into());
    }
    let conn = db.conn.lock().map_err(|e| e.to_string())?;

    let (shift_id, opening_cash): (String, f64) = conn
        .query_row(
            "SELECT id, opening_cash_amount FROM shift_sessions WHERE status = 'active' LIMIT 1",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .map_err(|_| "No active shift".to_string())?;

    let totals = aggregate_totals(&conn, &shift_id, opening_cash)?;
    let reconciliation = reconcile::reconcile(&totals, entered_closing_cash);

    Ok(serde_json::json!({
        "shiftId": shift_id,
        "totals": totals,
        "reconciliation": reconciliation,
    }))
}

// ---------------------------------------------------------------------------
// End shift
// ---------------------------------------------------------------------------

/// End the active shift.
///
/// Runs the reconciliation engine against the entered closing cash. A
/// significant discrepancy is a soft gate: the call returns a
/// `requiresConfirmation` response without persisting, and the operator
/// must resubmit with `confirmDiscrepancy: true`. An emergency end
/// (`isEmergency: true`) bypasses the gate and records the shift as
/// `emergency_ended`.
pub fn end_shift(db: &DbState, payload: &Value) -> Result<Value, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;

    let closing_cash = num_field(payload, "closingCash")
        .or_else(|| num_field(payload, "closing_cash"))
        .ok_or("Missing closingCash")?;
    if closing_cash < 0.0 {
        return Err("Closing cash cannot be negative".into());
    }
    let is_emergency = bool_field(payload, "isEmergency")
        .or_else(|| bool_field(payload, "is_emergency"))
        .unwrap_or(false);
    let confirm_discrepancy = bool_field(payload, "confirmDiscrepancy")
        .or_else(|| bool_field(payload, "confirm_discrepancy"))
        .unwrap_or(false);
    let extra_notes = str_field(payload, "notes").filter(|s| !s.trim().is_empty());

    let (shift_id, opening_cash, existing_notes): (String, f64, Option<String>) = match str_field(
        payload, "shiftId",
    )
    .or_else(|| str_field(payload, "shift_id"))
    {
        Some(id) => conn
            .query_row(
                "SELECT id, opening_cash_amount, shift_notes FROM shift_sessions
                 WHERE id = ?1 AND status = 'active'",
                params![id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .map_err(|_| format!("No active shift found with id {id}"))?,
        None => conn
            .query_row(
                "SELECT id, opening_cash_amount, shift_notes FROM shift_sessions
                 WHERE status = 'active' LIMIT 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .map_err(|_| "No active shift to end".to_string())?,
    };

    let totals = aggregate_totals(&conn, &shift_id, opening_cash)?;
    let reconciliation = reconcile::reconcile(&totals, closing_cash);

    // Soft gate: significant discrepancies need explicit confirmation,
    // unless this is an emergency end.
    if reconciliation.is_significant() && !is_emergency && !confirm_discrepancy {
        warn!(
            shift_id = %shift_id,
            discrepancy = %reconciliation.discrepancy,
            "Significant discrepancy at shift end, awaiting confirmation"
        );
        let message = format!(
            "Significant cash discrepancy of {:.2}. Confirm to end the shift anyway.",
            reconciliation.discrepancy
        );
        return Ok(serde_json::json!({
            "success": false,
            "requiresConfirmation": true,
            "shiftId": shift_id,
            "totals": totals,
            "reconciliation": reconciliation,
            "message": message,
        }));
    }

    let final_status = if is_emergency {
        "emergency_ended"
    } else {
        "completed"
    };
    let notes = compose_closing_notes(existing_notes, extra_notes, &reconciliation);
    let now = Utc::now().to_rfc3339();

    persist_shift_end(
        &conn,
        &shift_id,
        closing_cash,
        &reconciliation,
        final_status,
        notes.as_deref(),
        &now,
    )?;

    info!(
        shift_id = %shift_id,
        status = final_status,
        discrepancy = %reconciliation.discrepancy,
        "Shift ended"
    );

    let message = format!(
        "Shift ended. Expected {:.2}, counted {:.2}, discrepancy {:.2}",
        reconciliation.expected_closing_cash, closing_cash, reconciliation.discrepancy
    );
    Ok(serde_json::json!({
        "success": true,
        "shiftId": shift_id,
        "status": final_status,
        "totals": totals,
        "reconciliation": reconciliation,
        "message": message,
    }))
}

/// Append the closing annotations to the shift notes: the operator's note,
/// plus the discrepancy audit line when significant.
fn compose_closing_notes(
    existing: Option<String>,
    extra: Option<String>,
    reconciliation: &Reconciliation,
) -> Option<String> {
    let mut parts: Vec<String> = Vec::new();
    if let Some(prev) = existing.filter(|s| !s.trim().is_empty()) {
        parts.push(prev);
    }
    if let Some(note) = extra {
        parts.push(note.trim().to_string());
    }
    if reconciliation.is_significant() {
        parts.push(reconciliation.audit_note());
    }
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("\n"))
    }
}

/// Persist a shift transition to an ended state, all-or-nothing.
fn persist_shift_end(
    conn: &Connection,
    shift_id: &str,
    closing_cash: f64,
    reconciliation: &Reconciliation,
    final_status: &str,
    notes: Option<&str>,
    now: &str,
) -> Result<(), String> {
    conn.execute_batch("BEGIN IMMEDIATE")
        .map_err(|e| format!("begin transaction: {e}"))?;

    let result = (|| -> Result<(), String> {
        let updated = conn
            .execute(
                "UPDATE shift_sessions SET
                    shift_end_time = ?1, closing_cash_amount = ?2, expected_cash_amount = ?3,
                    cash_discrepancy = ?4, status = ?5, shift_notes = ?6,
                    sync_status = 'pending', updated_at = ?1
                 WHERE id = ?7 AND status = 'active'",
                params![
                    now,
                    closing_cash,
                    reconciliation.expected_closing_cash,
                    reconciliation.discrepancy,
                    final_status,
                    notes,
                    shift_id,
                ],
            )
            .map_err(|e| format!("close shift: {e}"))?;
        if updated == 0 {
            return Err(format!("Shift {shift_id} is no longer active"));
        }

        let idempotency_key = format!("shift:end:{shift_id}");
        let sync_payload = serde_json::json!({
            "shiftId": shift_id,
            "shiftEndTime": now,
            "closingCash": closing_cash,
            "expectedCash": reconciliation.expected_closing_cash,
            "discrepancy": reconciliation.discrepancy,
            "status": final_status,
        })
        .to_string();
        conn.execute(
            "INSERT OR IGNORE INTO sync_queue (entity_type, entity_id, operation, payload, idempotency_key)
             VALUES ('shift', ?1, 'update', ?2, ?3)",
            params![shift_id, sync_payload, idempotency_key],
        )
        .map_err(|e| format!("enqueue shift end sync: {e}"))?;

        Ok(())
    })();

    match result {
        Ok(()) => conn
            .execute_batch("COMMIT")
            .map_err(|e| format!("commit: {e}")),
        Err(e) => {
            let _ = conn.execute_batch("ROLLBACK");
            Err(e)
        }
    }
}

// ---------------------------------------------------------------------------
// Handover
// ---------------------------------------------------------------------------

/// Hand the drawer over to the next operator.
///
/// Ends the current shift with status `handover` and starts the successor
/// in the same transaction, carrying the computed cash-on-hand forward as
/// the new opening cash. If the outgoing operator enters a physical count
/// it is reconciled like a normal end (with the same confirmation gate);
/// otherwise the computed figure is recorded as the closing amount.
pub fn handover(db: &DbState, payload: &Value) -> Result<Value, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;

    let incoming_name = str_field(payload, "employeeName")
        .or_else(|| str_field(payload, "employee_name"))
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or("Missing employeeName for the incoming operator")?;
    let incoming_id =
        str_field(payload, "employeeId").or_else(|| str_field(payload, "employee_id"));
    let entered_closing = num_field(payload, "enteredClosingCash")
        .or_else(|| num_field(payload, "entered_closing_cash"));
    if let Some(amount) = entered_closing {
        if amount < 0.0 {
            return Err("Closing cash cannot be negative".into());
        }
    }
    let confirm_discrepancy = bool_field(payload, "confirmDiscrepancy")
        .or_else(|| bool_field(payload, "confirm_discrepancy"))
        .unwrap_or(false);
    let extra_notes = str_field(payload, "notes").filter(|s| !s.trim().is_empty());

    let (old_shift_id, opening_cash, existing_notes, outgoing_name): (
        String,
        f64,
        Option<String>,
        String,
    ) = conn
        .query_row(
            "SELECT id, opening_cash_amount, shift_notes, employee_name FROM shift_sessions
             WHERE status = 'active' LIMIT 1",
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
        )
        .map_err(|_| "No active shift to hand over".to_string())?;

    let totals = aggregate_totals(&conn, &old_shift_id, opening_cash)?;
    let expected = totals.expected_closing_cash();
    let closing_cash = entered_closing.unwrap_or(expected);
    let reconciliation = reconcile::reconcile(&totals, closing_cash);

    if reconciliation.is_significant() && !confirm_discrepancy {
        warn!(
            shift_id = %old_shift_id,
            discrepancy = %reconciliation.discrepancy,
            "Significant discrepancy at handover, awaiting confirmation"
        );
        let message = format!(
            "Significant cash discrepancy of {:.2}. Confirm to hand over anyway.",
            reconciliation.discrepancy
        );
        return Ok(serde_json::json!({
            "success": false,
            "requiresConfirmation": true,
            "shiftId": old_shift_id,
            "totals": totals,
            "reconciliation": reconciliation,
            "message": message,
        }));
    }

    let handover_note = format!("Handover to {incoming_name}");
    let notes = compose_closing_notes(
        existing_notes,
        Some(match extra_notes {
            Some(extra) => format!("{handover_note}. {extra}"),
            None => handover_note,
        }),
        &reconciliation,
    );

    let new_shift_id = Uuid::new_v4().to_string();
    let now = Utc::now().to_rfc3339();

    conn.execute_batch("BEGIN IMMEDIATE")
        .map_err(|e| format!("begin transaction: {e}"))?;

    let result = (|| -> Result<(), String> {
        let updated = conn
            .execute(
                "UPDATE shift_sessions SET
                    shift_end_time = ?1, closing_cash_amount = ?2, expected_cash_amount = ?3,
                    cash_discrepancy = ?4, status = 'handover', shift_notes = ?5,
                    sync_status = 'pending', updated_at = ?1
                 WHERE id = ?6 AND status = 'active'",
                params![
                    now,
                    closing_cash,
                    reconciliation.expected_closing_cash,
                    reconciliation.discrepancy,
                    notes,
                    old_shift_id,
                ],
            )
            .map_err(|e| format!("end outgoing shift: {e}"))?;
        if updated == 0 {
            return Err(format!("Shift {old_shift_id} is no longer active"));
        }

        // The incoming shift opens with the computed cash-on-hand, not the
        // self-reported count.
        conn.execute(
            "INSERT INTO shift_sessions (
                id, employee_id, employee_name, shift_start_time, opening_cash_amount,
                status, shift_notes, sync_status, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, 'active', ?6, 'pending', ?4, ?4)",
            params![
                new_shift_id,
                incoming_id,
                incoming_name,
                now,
                expected,
                format!("Handover from {outgoing_name}"),
            ],
        )
        .map_err(|e| format!("start incoming shift: {e}"))?;

        let end_key = format!("shift:end:{old_shift_id}");
        conn.execute(
            "INSERT OR IGNORE INTO sync_queue (entity_type, entity_id, operation, payload, idempotency_key)
             VALUES ('shift', ?1, 'update', ?2, ?3)",
            params![
                old_shift_id,
                serde_json::json!({
                    "shiftId": &old_shift_id,
                    "shiftEndTime": &now,
                    "closingCash": closing_cash,
                    "expectedCash": reconciliation.expected_closing_cash,
                    "discrepancy": reconciliation.discrepancy,
                    "status": "handover",
                })
                .to_string(),
                end_key,
            ],
        )
        .map_err(|e| format!("enqueue handover end sync: {e}"))?;

        let start_key = format!("shift:start:{new_shift_id}");
        conn.execute(
            "INSERT INTO sync_queue (entity_type, entity_id, operation, payload, idempotency_key)
             VALUES ('shift', ?1, 'insert', ?2, ?3)",
            params![
                new_shift_id,
                serde_json::json!({
                    "shiftId": &new_shift_id,
                    "employeeId": &incoming_id,
                    "employeeName": &incoming_name,
                    "shiftStartTime": &now,
                    "openingCash": expected,
                    "handoverFrom": &old_shift_id,
                })
                .to_string(),
                start_key,
            ],
        )
        .map_err(|e| format!("enqueue handover start sync: {e}"))?;

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
        old_shift = %old_shift_id,
        new_shift = %new_shift_id,
        carried_cash = %expected,
        "Shift handed over"
    );

    Ok(serde_json::json!({
        "success": true,
        "endedShiftId": old_shift_id,
        "newShiftId": new_shift_id,
        "openingCash": expected,
        "reconciliation": reconciliation,
        "message": format!(
            "Handover complete. {incoming_name} opens with {:.2}",
            expected
        ),
    }))
}

// ---------------------------------------------------------------------------
// Expenses
// ---------------------------------------------------------------------------

/// Record an expense against the active shift.
pub fn record_expense(db: &DbState, payload: &Value) -> Result<Value, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;

    let amount = num_field(payload, "amount").ok_or("Missing amount")?;
    if amount <= 0.0 {
        return Err("Amount must be positive".into());
    }
    let category = str_field(payload, "expenseCategory")
        .or_else(|| str_field(payload, "expense_category"))
        .or_else(|| str_field(payload, "category"))
        .unwrap_or_else(|| "other".to_string());
    if !EXPENSE_CATEGORIES.contains(&category.as_str()) {
        return Err(format!(
            "Invalid expense category: {category}. Must be one of {}",
            EXPENSE_CATEGORIES.join(", ")
        ));
    }
    let description = str_field(payload, "description")
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or("Missing description")?;
    let created_by = str_field(payload, "createdBy").or_else(|| str_field(payload, "created_by"));

    let shift_id = resolve_active_shift(&conn, payload)?;

    let expense_id = Uuid::new_v4().to_string();
    let now = Utc::now().to_rfc3339();

    conn.execute_batch("BEGIN IMMEDIATE")
        .map_err(|e| format!("begin transaction: {e}"))?;

    let result = (|| -> Result<(), String> {
        conn.execute(
            "INSERT INTO shift_expenses (
                id, shift_session_id, expense_category, amount, description,
                created_by, sync_status, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'pending', ?7, ?7)",
            params![expense_id, shift_id, category, amount, description, created_by, now],
        )
        .map_err(|e| format!("insert expense: {e}"))?;

        let idempotency_key = format!("expense:create:{expense_id}");
        conn.execute(
            "INSERT INTO sync_queue (entity_type, entity_id, operation, payload, idempotency_key)
             VALUES ('shift_expense', ?1, 'insert', ?2, ?3)",
            params![
                expense_id,
                serde_json::json!({
                    "expenseId": &expense_id,
                    "shiftId": &shift_id,
                    "category": &category,
                    "amount": amount,
                    "description": &description,
                    "createdBy": &created_by,
                })
                .to_string(),
                idempotency_key,
            ],
        )
        .map_err(|e| format!("enqueue expense sync: {e}"))?;

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

    info!(expense_id = %expense_id, shift_id = %shift_id, amount = %amount, "Expense recorded");

    Ok(serde_json::json!({
        "success": true,
        "expenseId": expense_id,
        "message": format!("Expense of {:.2} recorded", amount),
    }))
}

/// Delete an expense. Only allowed while the owning shift is still active;
/// ended shifts are immutable history.
pub fn delete_expense(db: &DbState, payload: &Value) -> Result<Value, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;

    let expense_id = str_field(payload, "expenseId")
        .or_else(|| str_field(payload, "expense_id"))
        .or_else(|| str_field(payload, "id"))
        .ok_or("Missing expenseId")?;

    let (shift_id, shift_status): (String, String) = conn
        .query_row(
            "SELECT se.shift_session_id, ss.status
             FROM shift_expenses se
             JOIN shift_sessions ss ON ss.id = se.shift_session_id
             WHERE se.id = ?1",
            params![expense_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .map_err(|_| format!("Expense not found: {expense_id}"))?;

    if shift_status != "active" {
        return Err("Cannot delete an expense from an ended shift".into());
    }

    conn.execute_batch("BEGIN IMMEDIATE")
        .map_err(|e| format!("begin transaction: {e}"))?;

    let result = (|| -> Result<(), String> {
        conn.execute(
            "DELETE FROM shift_expenses WHERE id = ?1",
            params![expense_id],
        )
        .map_err(|e| format!("delete expense: {e}"))?;

        let idempotency_key = format!("expense:delete:{expense_id}");
        conn.execute(
            "INSERT OR IGNORE INTO sync_queue (entity_type, entity_id, operation, payload, idempotency_key)
             VALUES ('shift_expense', ?1, 'delete', ?2, ?3)",
            params![
                expense_id,
                serde_json::json!({ "expenseId": &expense_id, "shiftId": &shift_id }).to_string(),
                idempotency_key,
            ],
        )
        .map_err(|e| format!("enqueue expense delete sync: {e}"))?;

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

    info!(expense_id = %expense_id, shift_id = %shift_id, "Expense deleted");

    Ok(serde_json::json!({ "success": true, "expenseId": expense_id }))
}

/// Get all expenses for a shift, newest first.
pub fn get_expenses(db: &DbState, shift_id: &str) -> Result<Value, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;

    let mut stmt = conn
        .prepare(
            "SELECT id, shift_session_id, expense_category, amount, description,
                    created_by, created_at
             FROM shift_expenses
             WHERE shift_session_id = ?1
             ORDER BY created_at DESC",
        )
        .map_err(|e| e.to_string())?;

    let rows = stmt
        .query_map(params![shift_id], |row| {
            Ok(serde_json::json!({
                "id": row.get::<_, String>(0)?,
                "shiftId": row.get::<_, String>(1)?,
                "expenseCategory": row.get::<_, String>(2)?,
                "amount": row.get::<_, f64>(3)?,
                "description": row.get::<_, String>(4)?,
                "createdBy": row.get::<_, Option<String>>(5)?,
                "createdAt": row.get::<_, String>(6)?,
            }))
        })
        .map_err(|e| e.to_string())?;

    let mut expenses = Vec::new();
    for row in rows {
        match row {
            Ok(expense) => expenses.push(expense),
            Err(e) => warn!("skipping malformed expense row: {e}"),
        }
    }

    Ok(serde_json::json!(expenses))
}

// ---------------------------------------------------------------------------
// Deposits
// ---------------------------------------------------------------------------

/// Record a deposit (cash removed from the drawer and/or a digital
/// settlement) against the active shift. Append-only.
pub fn record_deposit(db: &DbState, payload: &Value) -> Result<Value, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;

    let cash_amount = num_field(payload, "cashAmount")
        .or_else(|| num_field(payload, "cash_amount"))
        .unwrap_or(0.0);
    let digital_amount = num_field(payload, "digitalAmount")
        .or_else(|| num_field(payload, "digital_amount"))
        .unwrap_or(0.0);
    if cash_amount < 0.0 || digital_amount < 0.0 {
        return Err("Deposit amounts cannot be negative".into());
    }
    if cash_amount + digital_amount <= 0.0 {
        return Err("Deposit must have a positive cash or digital amount".into());
    }
    let notes = str_field(payload, "notes");
    let created_by = str_field(payload, "createdBy").or_else(|| str_field(payload, "created_by"));

    let shift_id = resolve_active_shift(&conn, payload)?;

    let deposit_id = Uuid::new_v4().to_string();
    let now = Utc::now().to_rfc3339();

    conn.execute_batch("BEGIN IMMEDIATE")
        .map_err(|e| format!("begin transaction: {e}"))?;

    let result = (|| -> Result<(), String> {
        conn.execute(
            "INSERT INTO shift_deposits (
                id, shift_session_id, cash_amount, digital_amount, notes,
                created_by, sync_status, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'pending', ?7)",
            params![deposit_id, shift_id, cash_amount, digital_amount, notes, created_by, now],
        )
        .map_err(|e| format!("insert deposit: {e}"))?;

        let idempotency_key = format!("deposit:create:{deposit_id}");
        conn.execute(
            "INSERT INTO sync_queue (entity_type, entity_id, operation, payload, idempotency_key)
             VALUES ('shift_deposit', ?1, 'insert', ?2, ?3)",
            params![
                deposit_id,
                serde_json::json!({
                    "depositId": &deposit_id,
                    "shiftId": &shift_id,
                    "cashAmount": cash_amount,
                    "digitalAmount": digital_amount,
                    "notes": &notes,
                    "createdBy": &created_by,
                })
                .to_string(),
                idempotency_key,
            ],
        )
        .map_err(|e| format!("enqueue deposit sync: {e}"))?;

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
        deposit_id = %deposit_id,
        shift_id = %shift_id,
        cash = %cash_amount,
        digital = %digital_amount,
        "Deposit recorded"
    );

    Ok(serde_json::json!({
        "success": true,
        "depositId": deposit_id,
        "message": format!("Deposit of {:.2} cash recorded", cash_amount),
    }))
}

/// Get all deposits for a shift, newest first.
pub fn get_deposits(db: &DbState, shift_id: &str) -> Result<Value, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;

    let mut stmt = conn
        .prepare(
            "SELECT id, shift_session_id, cash_amount, digital_amount, notes,
                    created_by, created_at
             FROM shift_deposits
             WHERE shift_session_id = ?1
             ORDER BY created_at DESC",
        )
        .map_err(|e| e.to_string())?;

    let rows = stmt
        .query_map(params![shift_id], |row| {
            Ok(serde_json::json!({
                "id": row.get::<_, String>(0)?,
                "shiftId": row.get::<_, String>(1)?,
                "cashAmount": row.get::<_, f64>(2)?,
                "digitalAmount": row.get::<_, f64>(3)?,
                "notes": row.get::<_, Option<String>>(4)?,
                "createdBy": row.get::<_, Option<String>>(5)?,
                "createdAt": row.get::<_, String>(6)?,
            }))
        })
        .map_err(|e| e.to_string())?;

    let items: Vec<Value> = rows.filter_map(|r| r.ok()).collect();
    Ok(serde_json::json!(items))
}

// ---------------------------------------------------------------------------
// Shift summary
// ---------------------------------------------------------------------------

/// Full summary of a shift: the session row, aggregated totals, the
/// reconciliation (against the recorded closing count for ended shifts),
/// and the expense / deposit line items.
pub fn get_shift_summary(db: &DbState, shift_id: &str) -> Result<Value, String> {
    let shift = get_shift(db, shift_id)?;
    if shift.is_null() {
        return Err(format!("Shift not found: {shift_id}"));
    }

    let opening_cash = shift["opening_cash_amount"].as_f64().unwrap_or(0.0);

    let totals = {
        let conn = db.conn.lock().map_err(|e| e.to_string())?;
        aggregate_totals(&conn, shift_id, opening_cash)?
    };

    let reconciliation = shift["closing_cash_amount"]
        .as_f64()
        .map(|closing| reconcile::reconcile(&totals, closing));

    let expenses = get_expenses(db, shift_id)?;
    let deposits = get_deposits(db, shift_id)?;
    let expected = totals.expected_closing_cash();

    Ok(serde_json::json!({
        "shift": shift,
        "totals": totals,
        "expectedClosingCash": expected,
        "reconciliation": reconciliation,
        "expenses": expenses,
        "deposits": deposits,
    }))
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

/// Resolve the shift a mutation applies to: an explicit `shiftId` that must
/// be active, or the single active shift.
fn resolve_active_shift(conn: &Connection, payload: &Value) -> Result<String, String> {
    match str_field(payload, "shiftId").or_else(|| str_field(payload, "shift_id")) {
        Some(id) => conn
            .query_row(
                "SELECT id FROM shift_sessions WHERE id = ?1 AND status = 'active'",
                params![id],
                |row| row.get(0),
            )
            .map_err(|_| format!("No active shift found with id {id}")),
        None => conn
            .query_row(
                "SELECT id FROM shift_sessions WHERE status = 'active' LIMIT 1",
                [],
                |row| row.get(0),
            )
            .map_err(|_| "No active shift".to_string()),
    }
}

/// Execute a shift query and return the first row as JSON, or null if not found.
fn query_shift(
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
        Ok(shift) => Ok(shift),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(Value::Null),
        Err(e) => {
            warn!("shift query error: {e}");
            Err(format!("shift query: {e}"))
        }
    }
}

/// Convert a row to a JSON object keyed by raw snake_case column names.
fn row_to_json(row: &rusqlite::Row, col_names: &[String]) -> Value {
    let mut obj = serde_json::Map::new();
    for (i, name) in col_names.iter().enumerate() {
        obj.insert(name.clone(), row_value_at(row, i));
    }
    Value::Object(obj)
}

/// Extract a column value from a row using SQLite's actual stored type.
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

fn bool_field(v: &Value, key: &str) -> Option<bool> {
    v.get(key).and_then(Value::as_bool)
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::reconcile::DiscrepancyClass;
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

    fn start_test_shift(db: &DbState, opening_cash: f64) -> String {
        let result = start_shift(
            db,
            &serde_json::json!({
                "employeeName": "Asha",
                "employeeId": "op-1",
                "openingCash": opening_cash,
            }),
        )
        .expect("start shift");
        result["shiftId"].as_str().unwrap().to_string()
    }

    /// Insert an exited, linked parking entry directly (the entries module
    /// has its own tests for the exit path).
    fn insert_exited_entry(
        db: &DbState,
        id: &str,
        shift_id: &str,
        fee: f64,
        payment_type: &str,
        payment_status: &str,
    ) {
        let conn = db.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO parking_entries (id, serial_number, transport_name, vehicle_type,
                vehicle_number, entry_time, exit_time, status, parking_fee, payment_status,
                payment_type, shift_session_id, sync_status, created_at, updated_at)
             VALUES (?1, 1, 'T', '4 Wheeler', ?2, datetime('now','-4 hours'), datetime('now'),
                'Exited', ?3, ?4, ?5, ?6, 'pending', datetime('now'), datetime('now'))",
            params![id, format!("KA{id}"), fee, payment_status, payment_type, shift_id],
        )
        .unwrap();
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    #[test]
    fn test_start_shift_and_get_active() {
        let db = test_db();
        let shift_id = start_test_shift(&db, 1000.0);

        let active = get_active(&db).expect("get active");
        assert_eq!(active["id"], shift_id.as_str());
        assert_eq!(active["status"], "active");
        assert_eq!(active["opening_cash_amount"], 1000.0);
        assert_eq!(active["employee_name"], "Asha");
    }

    #[test]
    fn test_second_active_shift_rejected() {
        let db = test_db();
        start_test_shift(&db, 1000.0);

        let err = start_shift(
            &db,
            &serde_json::json!({ "employeeName": "Ravi", "openingCash": 500.0 }),
        )
        .expect_err("second active shift must be rejected");
        assert!(err.contains("already active"), "got: {err}");

        // And no second row was created
        let conn = db.conn.lock().unwrap();
        let active_count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM shift_sessions WHERE status = 'active'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(active_count, 1);
    }

    #[test]
    fn test_negative_opening_cash_rejected() {
        let db = test_db();
        let err = start_shift(
            &db,
            &serde_json::json!({ "employeeName": "Asha", "openingCash": -5.0 }),
        )
        .expect_err("negative opening cash");
        assert!(err.contains("negative"), "got: {err}");
    }

    #[test]
    fn test_suggested_opening_cash_from_previous_close() {
        let db = test_db();
        let first = suggested_opening_cash(&db).expect("suggestion");
        assert_eq!(first["suggestedOpeningCash"], 0.0);

        start_test_shift(&db, 1000.0);
        end_shift(&db, &serde_json::json!({ "closingCash": 1000.0 })).expect("end");

        let after = suggested_opening_cash(&db).expect("suggestion");
        assert_eq!(after["suggestedOpeningCash"], 1000.0);
    }

    // ------------------------------------------------------------------
    // Revenue aggregation
    // ------------------------------------------------------------------

    #[test]
    fn test_revenue_buckets_by_payment_type() {
        let db = test_db();
        let shift_id = start_test_shift(&db, 1000.0);

        insert_exited_entry(&db, "e1", &shift_id, 200.0, "Cash", "Paid");
        insert_exited_entry(&db, "e2", &shift_id, 300.0, "Cash", "Paid");
        insert_exited_entry(&db, "e3", &shift_id, 150.0, "UPI", "Paid");
        insert_exited_entry(&db, "e4", &shift_id, 100.0, "Digital", "Paid");
        insert_exited_entry(&db, "e5", &shift_id, 70.0, "Card", "Paid");

        let conn = db.conn.lock().unwrap();
        let totals = aggregate_totals(&conn, &shift_id, 1000.0).expect("aggregate");
        assert_eq!(totals.cash_revenue, 500.0);
        assert_eq!(totals.digital_revenue, 320.0);
        assert_eq!(totals.vehicles_processed, 5);
    }

    #[test]
    fn test_unpaid_entries_excluded_from_revenue() {
        let db = test_db();
        let shift_id = start_test_shift(&db, 1000.0);

        insert_exited_entry(&db, "e1", &shift_id, 200.0, "Cash", "Paid");
        // Fee populated but not realized — must not count
        insert_exited_entry(&db, "e2", &shift_id, 500.0, "Cash", "Unpaid");
        insert_exited_entry(&db, "e3", &shift_id, 400.0, "UPI", "Pending");
        insert_exited_entry(&db, "e4", &shift_id, 300.0, "Cash", "Refunded");

        let conn = db.conn.lock().unwrap();
        let totals = aggregate_totals(&conn, &shift_id, 1000.0).expect("aggregate");
        assert_eq!(totals.cash_revenue, 200.0);
        assert_eq!(totals.digital_revenue, 0.0);
        assert_eq!(totals.vehicles_processed, 1);
    }

    #[test]
    fn test_parked_entries_excluded_from_revenue() {
        let db = test_db();
        let shift_id = start_test_shift(&db, 1000.0);

        insert_exited_entry(&db, "e1", &shift_id, 200.0, "Cash", "Paid");
        {
            let conn = db.conn.lock().unwrap();
            // Still in the lot: linked by a pre-payment but not exited
            conn.execute(
                "INSERT INTO parking_entries (id, serial_number, transport_name, vehicle_type,
                    vehicle_number, entry_time, status, parking_fee, payment_status, payment_type,
                    shift_session_id, sync_status, created_at, updated_at)
                 VALUES ('e2', 2, 'T', '4 Wheeler', 'KAe2', datetime('now'), 'Active', 100.0,
                    'Paid', 'Cash', ?1, 'pending', datetime('now'), datetime('now'))",
                params![shift_id],
            )
            .unwrap();
            let totals = aggregate_totals(&conn, &shift_id, 1000.0).expect("aggregate");
            assert_eq!(totals.cash_revenue, 200.0);
            assert_eq!(totals.vehicles_processed, 1);
        }
    }

    #[test]
    fn test_unknown_payment_type_drops_to_neither_bucket() {
        let db = test_db();
        let shift_id = start_test_shift(&db, 1000.0);

        insert_exited_entry(&db, "e1", &shift_id, 200.0, "Cash", "Paid");
        insert_exited_entry(&db, "e2", &shift_id, 90.0, "Barter", "Paid");

        let conn = db.conn.lock().unwrap();
        let totals = aggregate_totals(&conn, &shift_id, 1000.0).expect("aggregate");
        assert_eq!(totals.cash_revenue, 200.0);
        assert_eq!(totals.digital_revenue, 0.0);
        // The vehicle was still processed during the shift
        assert_eq!(totals.vehicles_processed, 2);
    }

    #[test]
    fn test_expense_order_does_not_affect_total() {
        let db = test_db();
        let shift_id = start_test_shift(&db, 1000.0);

        for amount in [10.0, 25.5, 14.5] {
            record_expense(
                &db,
                &serde_json::json!({
                    "amount": amount,
                    "expenseCategory": "supplies",
                    "description": "consumables",
                }),
            )
            .expect("record expense");
        }

        let conn = db.conn.lock().unwrap();
        let totals = aggregate_totals(&conn, &shift_id, 1000.0).expect("aggregate");
        assert_eq!(totals.total_expenses, 50.0);
        drop(conn);

        // Same amounts in reverse order on a fresh shift give the same sum
        let db2 = test_db();
        let shift_id2 = start_test_shift(&db2, 1000.0);
        for amount in [14.5, 25.5, 10.0] {
            record_expense(
                &db2,
                &serde_json::json!({
                    "amount": amount,
                    "expenseCategory": "supplies",
                    "description": "consumables",
                }),
            )
            .expect("record expense");
        }
        let conn2 = db2.conn.lock().unwrap();
        let totals2 = aggregate_totals(&conn2, &shift_id2, 1000.0).expect("aggregate");
        assert_eq!(totals2.total_expenses, totals.total_expenses);
    }

    // ------------------------------------------------------------------
    // End shift + reconciliation
    // ------------------------------------------------------------------

    /// Build the reference shift: opening 1000, cash revenue 500,
    /// expenses 50, cash deposits 200 -> expected closing cash 1250.
    fn build_reference_shift(db: &DbState) -> String {
        let shift_id = start_test_shift(db, 1000.0);
        insert_exited_entry(db, "e1", &shift_id, 500.0, "Cash", "Paid");
        record_expense(
            db,
            &serde_json::json!({
                "amount": 50.0,
                "expenseCategory": "fuel",
                "description": "generator fuel",
            }),
        )
        .expect("expense");
        record_deposit(
            db,
            &serde_json::json!({ "cashAmount": 200.0, "notes": "bank drop" }),
        )
        .expect("deposit");
        shift_id
    }

    #[test]
    fn test_end_shift_exact_count_completes() {
        let db = test_db();
        let shift_id = build_reference_shift(&db);

        let result =
            end_shift(&db, &serde_json::json!({ "closingCash": 1250.0 })).expect("end shift");
        assert_eq!(result["success"], true);
        assert_eq!(result["status"], "completed");
        assert_eq!(result["reconciliation"]["expected_closing_cash"], 1250.0);
        assert_eq!(result["reconciliation"]["discrepancy"], 0.0);
        assert_eq!(result["reconciliation"]["class"], "match");

        let shift = get_shift(&db, &shift_id).expect("get shift");
        assert_eq!(shift["status"], "completed");
        assert_eq!(shift["closing_cash_amount"], 1250.0);
        assert_eq!(shift["expected_cash_amount"], 1250.0);
        assert_eq!(shift["cash_discrepancy"], 0.0);
        assert!(!shift["shift_end_time"].is_null());
    }

    #[test]
    fn test_end_shift_excess_requires_confirmation() {
        let db = test_db();
        let shift_id = build_reference_shift(&db);

        // +150 discrepancy: significant, excess branch
        let gated = end_shift(&db, &serde_json::json!({ "closingCash": 1400.0 })).expect("gated");
        assert_eq!(gated["success"], false);
        assert_eq!(gated["requiresConfirmation"], true);
        assert_eq!(gated["reconciliation"]["discrepancy"], 150.0);
        assert_eq!(gated["reconciliation"]["class"], "significant");

        // Nothing persisted yet
        let shift = get_shift(&db, &shift_id).expect("get shift");
        assert_eq!(shift["status"], "active");
        assert!(shift["closing_cash_amount"].is_null());

        // Confirmed resubmission persists with the audit annotation
        let confirmed = end_shift(
            &db,
            &serde_json::json!({ "closingCash": 1400.0, "confirmDiscrepancy": true }),
        )
        .expect("confirmed");
        assert_eq!(confirmed["success"], true);

        let shift = get_shift(&db, &shift_id).expect("get shift");
        assert_eq!(shift["status"], "completed");
        assert_eq!(shift["cash_discrepancy"], 150.0);
        let notes = shift["shift_notes"].as_str().unwrap();
        assert!(notes.contains("SIGNIFICANT CASH DISCREPANCY"), "notes: {notes}");
        assert!(notes.contains("excess"), "notes: {notes}");
    }

    #[test]
    fn test_end_shift_shortage_branch() {
        let db = test_db();
        build_reference_shift(&db);

        let gated = end_shift(&db, &serde_json::json!({ "closingCash": 1100.0 })).expect("gated");
        assert_eq!(gated["requiresConfirmation"], true);
        assert_eq!(gated["reconciliation"]["discrepancy"], -150.0);

        let confirmed = end_shift(
            &db,
            &serde_json::json!({ "closingCash": 1100.0, "confirmDiscrepancy": true }),
        )
        .expect("confirmed");
        assert_eq!(confirmed["success"], true);
        let notes_shift = get_active(&db).expect("no active left");
        assert!(notes_shift.is_null());
    }

    #[test]
    fn test_minor_discrepancy_ends_without_gate() {
        let db = test_db();
        let shift_id = build_reference_shift(&db);

        // 1250 + 40 = minor discrepancy, no confirmation needed
        let result =
            end_shift(&db, &serde_json::json!({ "closingCash": 1290.0 })).expect("end shift");
        assert_eq!(result["success"], true);
        assert_eq!(result["reconciliation"]["class"], "minor");

        let shift = get_shift(&db, &shift_id).expect("get shift");
        // Minor discrepancies do not add the audit annotation
        assert!(shift["shift_notes"].is_null());
    }

    #[test]
    fn test_emergency_end_skips_confirmation_gate() {
        let db = test_db();
        let shift_id = build_reference_shift(&db);

        // Significant discrepancy, but emergency end bypasses the gate
        let result = end_shift(
            &db,
            &serde_json::json!({ "closingCash": 600.0, "isEmergency": true }),
        )
        .expect("emergency end");
        assert_eq!(result["success"], true);
        assert_eq!(result["status"], "emergency_ended");

        let shift = get_shift(&db, &shift_id).expect("get shift");
        assert_eq!(shift["status"], "emergency_ended");
        // The discrepancy is still recorded for audit
        assert_eq!(shift["cash_discrepancy"], -650.0);
        assert!(shift["shift_notes"]
            .as_str()
            .unwrap()
            .contains("SIGNIFICANT CASH DISCREPANCY"));
    }

    #[test]
    fn test_end_without_active_shift_fails() {
        let db = test_db();
        let err = end_shift(&db, &serde_json::json!({ "closingCash": 100.0 }))
            .expect_err("no active shift");
        assert!(err.contains("No active shift"), "got: {err}");
    }

    #[test]
    fn test_ended_shift_is_immutable() {
        let db = test_db();
        build_reference_shift(&db);
        end_shift(&db, &serde_json::json!({ "closingCash": 1250.0 })).expect("end");

        // A second end attempt finds no active shift
        let err = end_shift(&db, &serde_json::json!({ "closingCash": 1250.0 }))
            .expect_err("already ended");
        assert!(err.contains("No active shift"), "got: {err}");

        // Expenses can no longer be recorded against it
        let err = record_expense(
            &db,
            &serde_json::json!({
                "amount": 5.0,
                "expenseCategory": "other",
                "description": "late expense",
            }),
        )
        .expect_err("no active shift for expense");
        assert!(err.contains("No active shift"), "got: {err}");
    }

    // ------------------------------------------------------------------
    // Handover
    // ------------------------------------------------------------------

    #[test]
    fn test_handover_carries_cash_forward() {
        let db = test_db();
        let old_shift_id = build_reference_shift(&db);

        let result = handover(
            &db,
            &serde_json::json!({ "employeeName": "Ravi", "employeeId": "op-2" }),
        )
        .expect("handover");
        assert_eq!(result["success"], true);
        assert_eq!(result["endedShiftId"], old_shift_id.as_str());
        // Computed cash-on-hand carried forward as the new opening float
        assert_eq!(result["openingCash"], 1250.0);

        let old_shift = get_shift(&db, &old_shift_id).expect("old shift");
        assert_eq!(old_shift["status"], "handover");
        assert_eq!(old_shift["closing_cash_amount"], 1250.0);

        let new_shift = get_active(&db).expect("new active");
        assert_eq!(new_shift["employee_name"], "Ravi");
        assert_eq!(new_shift["opening_cash_amount"], 1250.0);

        // Exactly one active shift after the handover
        let conn = db.conn.lock().unwrap();
        let active_count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM shift_sessions WHERE status = 'active'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(active_count, 1);
    }

    #[test]
    fn test_handover_with_significant_count_requires_confirmation() {
        let db = test_db();
        build_reference_shift(&db);

        let gated = handover(
            &db,
            &serde_json::json!({
                "employeeName": "Ravi",
                "enteredClosingCash": 1000.0,
            }),
        )
        .expect("gated handover");
        assert_eq!(gated["success"], false);
        assert_eq!(gated["requiresConfirmation"], true);

        // Original shift still active, no successor created
        let active = get_active(&db).expect("active");
        assert_eq!(active["employee_name"], "Asha");

        let confirmed = handover(
            &db,
            &serde_json::json!({
                "employeeName": "Ravi",
                "enteredClosingCash": 1000.0,
                "confirmDiscrepancy": true,
            }),
        )
        .expect("confirmed handover");
        assert_eq!(confirmed["success"], true);
        // New opening is still the computed figure, not the short count
        assert_eq!(confirmed["openingCash"], 1250.0);
    }

    #[test]
    fn test_handover_without_active_shift_fails() {
        let db = test_db();
        let err = handover(&db, &serde_json::json!({ "employeeName": "Ravi" }))
            .expect_err("nothing to hand over");
        assert!(err.contains("No active shift"), "got: {err}");
    }

    // ------------------------------------------------------------------
    // Expenses and deposits
    // ------------------------------------------------------------------

    #[test]
    fn test_expense_validation() {
        let db = test_db();
        start_test_shift(&db, 1000.0);

        let err = record_expense(
            &db,
            &serde_json::json!({ "amount": 0.0, "expenseCategory": "fuel", "description": "x" }),
        )
        .expect_err("zero amount");
        assert!(err.contains("positive"), "got: {err}");

        let err = record_expense(
            &db,
            &serde_json::json!({ "amount": 10.0, "expenseCategory": "bribes", "description": "x" }),
        )
        .expect_err("bad category");
        assert!(err.contains("Invalid expense category"), "got: {err}");

        let err = record_expense(
            &db,
            &serde_json::json!({ "amount": 10.0, "expenseCategory": "fuel" }),
        )
        .expect_err("missing description");
        assert!(err.contains("description"), "got: {err}");
    }

    #[test]
    fn test_expense_delete_only_while_active() {
        let db = test_db();
        let shift_id = start_test_shift(&db, 1000.0);

        let created = record_expense(
            &db,
            &serde_json::json!({ "amount": 10.0, "expenseCategory": "fuel", "description": "x" }),
        )
        .expect("record");
        let expense_id = created["expenseId"].as_str().unwrap().to_string();

        delete_expense(&db, &serde_json::json!({ "expenseId": expense_id }))
            .expect("delete while active");

        // Re-create and end the shift; now delete must fail
        let created = record_expense(
            &db,
            &serde_json::json!({ "amount": 20.0, "expenseCategory": "fuel", "description": "y" }),
        )
        .expect("record again");
        let expense_id = created["expenseId"].as_str().unwrap().to_string();
        end_shift(&db, &serde_json::json!({ "closingCash": 980.0 })).expect("end");

        let err = delete_expense(&db, &serde_json::json!({ "expenseId": expense_id }))
            .expect_err("immutable after end");
        assert!(err.contains("ended shift"), "got: {err}");

        let expenses = get_expenses(&db, &shift_id).expect("list");
        assert_eq!(expenses.as_array().unwrap().len(), 1);
    }

    #[test]
    fn test_deposit_validation_and_listing() {
        let db = test_db();
        let shift_id = start_test_shift(&db, 1000.0);

        let err = record_deposit(&db, &serde_json::json!({ "cashAmount": 0.0 }))
            .expect_err("empty deposit");
        assert!(err.contains("positive"), "got: {err}");

        let err = record_deposit(&db, &serde_json::json!({ "cashAmount": -5.0 }))
            .expect_err("negative deposit");
        assert!(err.contains("negative"), "got: {err}");

        record_deposit(
            &db,
            &serde_json::json!({ "cashAmount": 300.0, "digitalAmount": 120.0, "notes": "drop" }),
        )
        .expect("deposit");

        let deposits = get_deposits(&db, &shift_id).expect("list");
        assert_eq!(deposits.as_array().unwrap().len(), 1);
        assert_eq!(deposits[0]["cashAmount"], 300.0);
        assert_eq!(deposits[0]["digitalAmount"], 120.0);

        let conn = db.conn.lock().unwrap();
        let totals = aggregate_totals(&conn, &shift_id, 1000.0).expect("aggregate");
        assert_eq!(totals.cash_deposits, 300.0);
        assert_eq!(totals.digital_deposits, 120.0);
        // Only the cash side reduces the drawer
        assert_eq!(totals.expected_closing_cash(), 700.0);
    }

    // ------------------------------------------------------------------
    // Status / summary
    // ------------------------------------------------------------------

    #[test]
    fn test_cash_status_reflects_ledgers() {
        let db = test_db();
        let shift_id = build_reference_shift(&db);

        let status = cash_status(&db).expect("cash status");
        assert_eq!(status["shiftId"], shift_id.as_str());
        assert_eq!(status["expectedClosingCash"], 1250.0);
        assert_eq!(status["totals"]["cash_revenue"], 500.0);
        assert_eq!(status["totals"]["total_expenses"], 50.0);
        assert_eq!(status["totals"]["cash_deposits"], 200.0);
    }

    #[test]
    fn test_cash_status_without_shift_is_error_not_zero() {
        let db = test_db();
        let err = cash_status(&db).expect_err("no active shift");
        assert!(err.contains("No active shift"), "got: {err}");
    }

    #[test]
    fn test_preview_reconciliation_is_reactive_and_pure() {
        let db = test_db();
        build_reference_shift(&db);

        let first = preview_reconciliation(&db, 1250.0).expect("preview");
        assert_eq!(first["reconciliation"]["class"], "match");

        // Recording another expense changes the preview on the next call
        record_expense(
            &db,
            &serde_json::json!({ "amount": 30.0, "expenseCategory": "other", "description": "z" }),
        )
        .expect("expense");
        let second = preview_reconciliation(&db, 1250.0).expect("preview");
        assert_eq!(second["reconciliation"]["expected_closing_cash"], 1220.0);
        assert_eq!(second["reconciliation"]["discrepancy"], 30.0);

        // Identical inputs, identical output
        let third = preview_reconciliation(&db, 1250.0).expect("preview");
        assert_eq!(second, third);
    }

    #[test]
    fn test_shift_summary_for_ended_shift() {
        let db = test_db();
        let shift_id = build_reference_shift(&db);
        end_shift(
            &db,
            &serde_json::json!({ "closingCash": 1400.0, "confirmDiscrepancy": true }),
        )
        .expect("end");

        let summary = get_shift_summary(&db, &shift_id).expect("summary");
        assert_eq!(summary["shift"]["status"], "completed");
        assert_eq!(summary["expectedClosingCash"], 1250.0);
        assert_eq!(summary["reconciliation"]["discrepancy"], 150.0);
        assert_eq!(summary["expenses"].as_array().unwrap().len(), 1);
        assert_eq!(summary["deposits"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn test_reconciliation_class_boundaries_through_end_shift() {
        // Discrepancy of exactly 100 is significant and hits the gate.
        let db = test_db();
        build_reference_shift(&db);
        let gated = end_shift(&db, &serde_json::json!({ "closingCash": 1350.0 })).expect("gated");
        assert_eq!(gated["requiresConfirmation"], true);
        assert_eq!(
            gated["reconciliation"]["class"],
            serde_json::to_value(DiscrepancyClass::Significant).unwrap()
        );

        // Discrepancy of exactly 10 is minor, not a match, but no gate.
        let db2 = test_db();
        build_reference_shift(&db2);
        let minor = end_shift(&db2, &serde_json::json!({ "closingCash": 1260.0 })).expect("minor");
        assert_eq!(minor["success"], true);
        assert_eq!(minor["reconciliation"]["class"], "minor");
    }
}
