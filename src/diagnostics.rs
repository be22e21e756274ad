//! Diagnostics module for ParkPoint.
//!
//! Provides:
//! - **About info**: version, build timestamp, git SHA, platform
//! - **System health**: sync backlog, database size, active shift, occupancy
//! - **Diagnostics export**: packages logs, DB counters, and the last sync
//!   errors into a zip bundle for support.
//! - **Log rotation helpers**: used by `lib.rs` to configure rolling log files.

use crate::db::DbState;
use rusqlite::params;
use serde_json::{json, Value};
use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use tracing::warn;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Maximum number of log files to retain.
pub const MAX_LOG_FILES: usize = 10;

// ---------------------------------------------------------------------------
// About info
// ---------------------------------------------------------------------------

/// Returns version, build timestamp, git SHA, and platform info.
pub fn get_about_info() -> Value {
    json!({
        "version": env!("CARGO_PKG_VERSION"),
        "buildTimestamp": env!("BUILD_TIMESTAMP"),
        "gitSha": env!("BUILD_GIT_SHA"),
        "platform": std::env::consts::OS,
        "arch": std::env::consts::ARCH,
    })
}

// ---------------------------------------------------------------------------
// System health
// ---------------------------------------------------------------------------

/// Collects system health status for display on the System Health screen.
pub fn get_system_health(db: &DbState) -> Result<Value, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;

    let schema_version: i32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    let sync_backlog: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM sync_queue WHERE status = 'pending'",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);
    let sync_failed: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM sync_queue WHERE status = 'failed'",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    let active_shift: Option<String> = conn
        .query_row(
            "SELECT employee_name FROM shift_sessions WHERE status = 'active' LIMIT 1",
            [],
            |row| row.get(0),
        )
        .ok();

    let parked: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM parking_entries WHERE status IN ('Active', 'Overstay')",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);
    let overstays: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM parking_entries WHERE status = 'Overstay'",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    let db_size = fs::metadata(&db.db_path).map(|m| m.len()).unwrap_or(0);

    Ok(json!({
        "schemaVersion": schema_version,
        "databaseSizeBytes": db_size,
        "syncBacklog": sync_backlog,
        "syncFailed": sync_failed,
        "activeShiftOperator": active_shift,
        "vehiclesParked": parked,
        "overstays": overstays,
        "isConfigured": crate::storage::is_configured(),
        "checkedAt": chrono::Utc::now().to_rfc3339(),
    }))
}

/// Quick database health check: can we read and write?
pub fn database_health_check(db: &DbState) -> Result<Value, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;

    let integrity: String = conn
        .query_row("PRAGMA integrity_check", [], |row| row.get(0))
        .map_err(|e| format!("integrity check: {e}"))?;

    let write_ok = conn
        .execute(
            "INSERT INTO local_settings (setting_category, setting_key, setting_value, updated_at)
             VALUES ('system', 'health_check_probe', ?1, datetime('now'))
             ON CONFLICT(setting_category, setting_key) DO UPDATE SET
                setting_value = excluded.setting_value, updated_at = excluded.updated_at",
            params![chrono::Utc::now().to_rfc3339()],
        )
        .is_ok();

    Ok(json!({
        "healthy": integrity == "ok" && write_ok,
        "integrity": integrity,
        "writable": write_ok,
    }))
}

// ---------------------------------------------------------------------------
// Diagnostics export
// ---------------------------------------------------------------------------

/// Export a diagnostics bundle (zip) into `output_dir`. Returns the path to
/// the created file.
pub fn export_diagnostics(db: &DbState, output_dir: &Path) -> Result<String, String> {
    fs::create_dir_all(output_dir).map_err(|e| format!("create export dir: {e}"))?;

    let stamp = chrono::Utc::now().format("%Y%m%d_%H%M%S");
    let zip_path = output_dir.join(format!("parkpoint_diagnostics_{stamp}.zip"));
    let file = fs::File::create(&zip_path).map_err(|e| format!("create zip: {e}"))?;
    let mut zip = zip::ZipWriter::new(file);
    let options = zip::write::SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated);

    // info.json: about + health + last sync errors
    let info = json!({
        "about": get_about_info(),
        "health": get_system_health(db)?,
        "recentSyncErrors": recent_sync_errors(db, 20),
    });
    zip.start_file("info.json", options)
        .map_err(|e| format!("zip info.json: {e}"))?;
    zip.write_all(serde_json::to_string_pretty(&info).unwrap_or_default().as_bytes())
        .map_err(|e| format!("write info.json: {e}"))?;

    // Recent log files
    let log_dir = get_log_dir();
    if let Ok(entries) = fs::read_dir(&log_dir) {
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            match fs::read(&path) {
                Ok(contents) => {
                    if zip.start_file(format!("logs/{name}"), options).is_ok() {
                        let _ = zip.write_all(&contents);
                    }
                }
                Err(e) => warn!(file = %name, "skipping unreadable log file: {e}"),
            }
        }
    }

    zip.finish().map_err(|e| format!("finalize zip: {e}"))?;

    Ok(zip_path.to_string_lossy().into_owned())
}

/// The last N sync-queue errors, newest first.
fn recent_sync_errors(db: &DbState, limit: i64) -> Value {
    let conn = match db.conn.lock() {
        Ok(c) => c,
        Err(_) => return json!([]),
    };
    let mut stmt = match conn.prepare(
        "SELECT entity_type, entity_id, retry_count, last_error, updated_at
         FROM sync_queue
         WHERE last_error IS NOT NULL
         ORDER BY updated_at DESC LIMIT ?1",
    ) {
        Ok(s) => s,
        Err(_) => return json!([]),
    };
    let rows = stmt.query_map(params![limit], |row| {
        Ok(json!({
            "entityType": row.get::<_, String>(0)?,
            "entityId": row.get::<_, String>(1)?,
            "retryCount": row.get::<_, i64>(2)?,
            "lastError": row.get::<_, Option<String>>(3)?,
            "updatedAt": row.get::<_, String>(4)?,
        }))
    });
    match rows {
        Ok(r) => Value::Array(r.filter_map(|x| x.ok()).collect()),
        Err(_) => json!([]),
    }
}

// ---------------------------------------------------------------------------
// Log directory helpers
// ---------------------------------------------------------------------------

/// Directory for rolling log files: `{data_local_dir}/parkpoint/logs`
/// with a temp-dir fallback when no home directory is resolvable.
pub fn get_log_dir() -> PathBuf {
    let base = std::env::var_os("LOCALAPPDATA")
        .or_else(|| std::env::var_os("XDG_DATA_HOME"))
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".local/share")))
        .unwrap_or_else(std::env::temp_dir);
    base.join("parkpoint").join("logs")
}

/// Remove the oldest log files beyond the retention count.
pub fn prune_old_logs() {
    let log_dir = get_log_dir();
    let entries = match fs::read_dir(&log_dir) {
        Ok(e) => e,
        Err(_) => return, // dir does not exist yet
    };

    let mut files: Vec<(PathBuf, std::time::SystemTime)> = entries
        .flatten()
        .filter_map(|entry| {
            let path = entry.path();
            if !path.is_file() {
                return None;
            }
            let modified = entry.metadata().ok()?.modified().ok()?;
            Some((path, modified))
        })
        .collect();

    if files.len() <= MAX_LOG_FILES {
        return;
    }

    // Oldest first
    files.sort_by_key(|(_, modified)| *modified);
    let excess = files.len() - MAX_LOG_FILES;
    for (path, _) in files.into_iter().take(excess) {
        if let Err(e) = fs::remove_file(&path) {
            warn!(file = %path.display(), "failed to prune log file: {e}");
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
