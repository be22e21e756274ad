//! Background sync engine for ParkPoint.
//!
//! Drains the append-only `sync_queue` in batches and POSTs them to the
//! admin dashboard. Entries go to `/api/parking/entries/sync`; shift
//! events (sessions, expenses, deposits) go to `/api/parking/shifts/sync`;
//! daily reports go to `/api/parking/reports/sync`. Each entity type is
//! synced independently so a failure in one category does not block the
//! others.

use chrono::Utc;
use rusqlite::{params, Connection};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tauri::{AppHandle, Emitter};
use tracing::{debug, info, warn};

use crate::api;
use crate::db::DbState;
use crate::storage;

/// Rows fetched per entity type per cycle.
const BATCH_SIZE: i64 = 50;

// ---------------------------------------------------------------------------
// Sync engine state (managed by Tauri)
// ---------------------------------------------------------------------------

/// Managed state for the background sync engine.
pub struct SyncState {
    pub is_running: Arc<AtomicBool>,
    pub last_sync: Arc<std::sync::Mutex<Option<String>>>,
    pub last_error: Arc<std::sync::Mutex<Option<String>>>,
}

impl SyncState {
    pub fn new() -> Self {
        Self {
            is_running: Arc::new(AtomicBool::new(false)),
            last_sync: Arc::new(std::sync::Mutex::new(None)),
            last_error: Arc::new(std::sync::Mutex::new(None)),
        }
    }
}

impl Default for SyncState {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Queue inspection
// ---------------------------------------------------------------------------

/// A pending queue row ready to ship.
#[derive(Debug, Clone)]
pub struct QueueItem {
    pub id: i64,
    pub entity_type: String,
    pub entity_id: String,
    pub operation: String,
    pub payload: Value,
    pub idempotency_key: String,
}

/// Sync endpoint for an entity type.
fn endpoint_for(entity_type: &str) -> &'static str {
    match entity_type {
        "entry" => "/api/parking/entries/sync",
        "shift" | "shift_expense" | "shift_deposit" => "/api/parking/shifts/sync",
        "daily_report" => "/api/parking/reports/sync",
        _ => "/api/parking/sync",
    }
}

/// Fetch the next batch of pending rows for one entity type, oldest first.
pub fn collect_pending(
    conn: &Connection,
    entity_type: &str,
    limit: i64,
) -> Result<Vec<QueueItem>, String> {
    let mut stmt = conn
        .prepare(
            "SELECT id, entity_type, entity_id, operation, payload, idempotency_key
             FROM sync_queue
             WHERE entity_type = ?1 AND status = 'pending' AND retry_count < max_retries
             ORDER BY id ASC
             LIMIT ?2",
        )
        .map_err(|e| format!("prepare pending query: {e}"))?;

    let rows = stmt
        .query_map(params![entity_type, limit], |row| {
            let payload_raw: String = row.get(4)?;
            Ok(QueueItem {
                id: row.get(0)?,
                entity_type: row.get(1)?,
                entity_id: row.get(2)?,
                operation: row.get(3)?,
                payload: serde_json::from_str(&payload_raw).unwrap_or(Value::Null),
                idempotency_key: row.get(5)?,
            })
        })
        .map_err(|e| format!("query pending: {e}"))?;

    Ok(rows.filter_map(|r| r.ok()).collect())
}

/// Distinct entity types with pending work.
fn pending_entity_types(conn: &Connection) -> Vec<String> {
    let mut stmt = match conn.prepare(
        "SELECT DISTINCT entity_type FROM sync_queue
         WHERE status = 'pending' AND retry_count < max_retries",
    ) {
        Ok(s) => s,
        Err(e) => {
            warn!("pending entity types prepare: {e}");
            return Vec::new();
        }
    };
    stmt.query_map([], |row| row.get::<_, String>(0))
        .map(|rows| rows.filter_map(|r| r.ok()).collect())
        .unwrap_or_default()
}

/// Mark a queue row as synced.
pub fn mark_synced(conn: &Connection, queue_id: i64) -> Result<(), String> {
    conn.execute(
        "UPDATE sync_queue SET status = 'synced', synced_at = ?1, updated_at = ?1 WHERE id = ?2",
        params![Utc::now().to_rfc3339(), queue_id],
    )
    .map_err(|e| format!("mark synced: {e}"))?;
    Ok(())
}

/// Record a failed attempt. The row moves to `failed` once it exhausts its
/// retry budget; until then it stays `pending` for the next cycle.
pub fn mark_attempt_failed(conn: &Connection, queue_id: i64, error: &str) -> Result<(), String> {
    conn.execute(
        "UPDATE sync_queue SET
            retry_count = retry_count + 1,
            last_error = ?1,
            status = CASE WHEN retry_count + 1 >= max_retries THEN 'failed' ELSE 'pending' END,
            updated_at = ?2
         WHERE id = ?3",
        params![error, Utc::now().to_rfc3339(), queue_id],
    )
    .map_err(|e| format!("mark attempt failed: {e}"))?;
    Ok(())
}

/// Re-queue failed rows for another round of attempts.
pub fn retry_failed(db: &DbState) -> Result<Value, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    let requeued = conn
        .execute(
            "UPDATE sync_queue SET status = 'pending', retry_count = 0, last_error = NULL,
                updated_at = ?1
             WHERE status = 'failed'",
            params![Utc::now().to_rfc3339()],
        )
        .map_err(|e| format!("retry failed: {e}"))?;
    info!(requeued, "failed sync rows re-queued");
    Ok(serde_json::json!({ "success": true, "requeued": requeued }))
}

/// Drop synced rows older than the retention window (housekeeping).
pub fn prune_synced(db: &DbState, keep_days: i64) -> Result<Value, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    let pruned = conn
        .execute(
            "DELETE FROM sync_queue
             WHERE status = 'synced' AND synced_at < datetime('now', ?1)",
            params![format!("-{keep_days} days")],
        )
        .map_err(|e| format!("prune synced: {e}"))?;
    Ok(serde_json::json!({ "success": true, "pruned": pruned }))
}

/// Queue counts and engine status for the UI.
pub fn get_sync_status(db: &DbState, sync_state: &SyncState) -> Result<Value, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;

    let mut stmt = conn
        .prepare("SELECT status, COUNT(*) FROM sync_queue GROUP BY status")
        .map_err(|e| format!("prepare status counts: {e}"))?;
    let mut counts = serde_json::Map::new();
    let rows = stmt
        .query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })
        .map_err(|e| format!("query status counts: {e}"))?;
    for (status, count) in rows.flatten() {
        counts.insert(status, serde_json::json!(count));
    }

    Ok(serde_json::json!({
        "isRunning": sync_state.is_running.load(Ordering::Relaxed),
        "isConfigured": storage::is_configured(),
        "lastSync": sync_state.last_sync.lock().unwrap().clone(),
        "lastError": sync_state.last_error.lock().unwrap().clone(),
        "queue": counts,
    }))
}

// ---------------------------------------------------------------------------
// Sync cycle
// ---------------------------------------------------------------------------

/// Run one sync cycle: for each entity type with pending work, POST a batch
/// to its endpoint and mark the rows. Returns per-type counts.
pub async fn run_sync_cycle(db: &DbState, app: Option<&AppHandle>) -> Result<Value, String> {
    let admin_url =
        storage::get_credential("admin_dashboard_url").ok_or("Terminal not configured: missing admin URL")?;
    let api_key =
        storage::get_credential("parking_api_key").ok_or("Terminal not configured: missing API key")?;
    let lot_id = storage::get_credential("lot_id");

    let entity_types = {
        let conn = db.conn.lock().map_err(|e| e.to_string())?;
        pending_entity_types(&conn)
    };

    if entity_types.is_empty() {
        debug!("sync cycle: queue empty");
        return Ok(serde_json::json!({ "synced": 0, "failed": 0 }));
    }

    let mut total_synced = 0i64;
    let mut total_failed = 0i64;

    for entity_type in entity_types {
        let batch = {
            let conn = db.conn.lock().map_err(|e| e.to_string())?;
            collect_pending(&conn, &entity_type, BATCH_SIZE)?
        };
        if batch.is_empty() {
            continue;
        }

        let items: Vec<Value> = batch
            .iter()
            .map(|item| {
                serde_json::json!({
                    "entityType": &item.entity_type,
                    "entityId": &item.entity_id,
                    "operation": &item.operation,
                    "payload": &item.payload,
                    "idempotencyKey": &item.idempotency_key,
                })
            })
            .collect();

        let body = serde_json::json!({
            "lotId": lot_id,
            "items": items,
        });

        let result = api::fetch_from_admin(
            &admin_url,
            &api_key,
            endpoint_for(&entity_type),
            "POST",
            Some(body),
        )
        .await;

        let conn = db.conn.lock().map_err(|e| e.to_string())?;
        match result {
            Ok(_) => {
                for item in &batch {
                    mark_synced(&conn, item.id)?;
                }
                total_synced += batch.len() as i64;
                debug!(entity_type = %entity_type, count = batch.len(), "sync batch applied");
            }
            Err(e) => {
                for item in &batch {
                    mark_attempt_failed(&conn, item.id, &e)?;
                }
                total_failed += batch.len() as i64;
                warn!(entity_type = %entity_type, error = %e, "sync batch failed");

                if api::is_terminal_auth_failure(&e) {
                    if let Some(app) = app {
                        let _ = app.emit(
                            "terminal_auth_failed",
                            serde_json::json!({ "error": e.clone() }),
                        );
                    }
                    // Credentials are bad for every batch; stop the cycle.
                    return Err(e);
                }
            }
        }
    }

    if let Some(app) = app {
        let _ = app.emit(
            "sync_completed",
            serde_json::json!({
                "synced": total_synced,
                "failed": total_failed,
                "timestamp": Utc::now().to_rfc3339(),
            }),
        );
    }

    Ok(serde_json::json!({ "synced": total_synced, "failed": total_failed }))
}

/// Start the background sync loop.
///
/// Uses its own database connection (passed in by the caller) so the loop
/// never contends with command handlers for the main connection's mutex
/// across an await point.
pub fn start_sync_loop(
    app: AppHandle,
    db: Arc<DbState>,
    state: Arc<SyncState>,
    interval_secs: u64,
) {
    tauri::async_runtime::spawn(async move {
        info!(interval_secs, "background sync loop started");
        loop {
            tokio::time::sleep(Duration::from_secs(interval_secs)).await;

            if !storage::is_configured() {
                debug!("sync loop: terminal not configured, skipping cycle");
                continue;
            }
            if state.is_running.swap(true, Ordering::SeqCst) {
                // Previous cycle (or a force_sync) still in flight
                continue;
            }

            let outcome = run_sync_cycle(&db, Some(&app)).await;
            match outcome {
                Ok(counts) => {
                    *state.last_sync.lock().unwrap() = Some(Utc::now().to_rfc3339());
                    *state.last_error.lock().unwrap() = None;
                    let synced = counts["synced"].as_i64().unwrap_or(0);
                    if synced > 0 {
                        info!(synced, "sync cycle completed");
                    }
                }
                Err(e) => {
                    *state.last_error.lock().unwrap() = Some(e.clone());
                    warn!("sync cycle error: {e}");
                }
            }

            state.is_running.store(false, Ordering::SeqCst);
        }
    });
}

/// Run a sync cycle immediately (the "Sync now" button).
pub async fn force_sync(
    db: &DbState,
    state: &SyncState,
    app: &AppHandle,
) -> Result<Value, String> {
    if state.is_running.swap(true, Ordering::SeqCst) {
        return Err("Sync already in progress".into());
    }
    let result = run_sync_cycle(db, Some(app)).await;
    state.is_running.store(false, Ordering::SeqCst);

    match &result {
        Ok(_) => {
            *state.last_sync.lock().unwrap() = Some(Utc::now().to_rfc3339());
            *state.last_error.lock().unwrap() = None;
        }
        Err(e) => {
            *state.last_error.lock().unwrap() = Some(e.clone());
        }
    }

    result
}

// ===========================================================================
// Tests
// ===========================================================================
