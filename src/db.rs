//! Local SQLite database layer for ParkPoint.
//!
//! Uses rusqlite with WAL mode. Provides schema migrations, settings
//! helpers, and managed state for use across Tauri commands. The schema
//! mirrors the cloud dashboard's relational layout (parking entries, shift
//! sessions, shift-scoped expenses and deposits) so sync payloads map
//! one-to-one onto remote rows.

use rusqlite::{params, Connection};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{error, info, warn};

/// Tauri managed state holding the database connection.
pub struct DbState {
    pub conn: Mutex<Connection>,
    pub db_path: PathBuf,
}

/// Current schema version. Bump when adding new migrations.
const CURRENT_SCHEMA_VERSION: i32 = 7;

/// Initialize the database at `{app_data_dir}/parkpoint.db`.
///
/// Creates the directory if needed, opens the connection, sets pragmas,
/// and runs any pending migrations. On corruption or open failure,
/// deletes the file and retries once.
pub fn init(app_data_dir: &Path) -> Result<DbState, String> {
    fs::create_dir_all(app_data_dir).map_err(|e| format!("Failed to create data dir: {e}"))?;

    let db_path = app_data_dir.join("parkpoint.db");
    info!("Opening database at {}", db_path.display());

    let conn = match open_and_configure(&db_path) {
        Ok(c) => c,
        Err(first_err) => {
            warn!(
                "Database open failed ({}), deleting and retrying once",
                first_err
            );
            if db_path.exists() {
                let _ = fs::remove_file(&db_path);
                // Also remove WAL/SHM files if present
                let wal = db_path.with_extension("db-wal");
                let shm = db_path.with_extension("db-shm");
                let _ = fs::remove_file(&wal);
                let _ = fs::remove_file(&shm);
            }
            open_and_configure(&db_path)
                .map_err(|e| format!("Database open failed after retry: {e}"))?
        }
    };

    run_migrations(&conn)?;

    info!("Database initialized (schema v{CURRENT_SCHEMA_VERSION})");

    Ok(DbState {
        conn: Mutex::new(conn),
        db_path,
    })
}

/// Open the database file and apply pragmas.
fn open_and_configure(path: &Path) -> Result<Connection, String> {
    let conn = Connection::open(path).map_err(|e| format!("sqlite open: {e}"))?;

    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;",
    )
    .map_err(|e| format!("pragma setup: {e}"))?;

    Ok(conn)
}

/// Run all pending migrations up to `CURRENT_SCHEMA_VERSION`.
fn run_migrations(conn: &Connection) -> Result<(), String> {
    // Ensure schema_version table exists first
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT DEFAULT (datetime('now'))
        );",
    )
    .map_err(|e| format!("create schema_version: {e}"))?;

    let current: i32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if current >= CURRENT_SCHEMA_VERSION {
        info!("Database schema up to date (v{current})");
        return Ok(());
    }

    info!("Migrating database from v{current} to v{CURRENT_SCHEMA_VERSION}");

    if current < 1 {
        migrate_v1(conn)?;
    }
    if current < 2 {
        migrate_v2(conn)?;
    }
    if current < 3 {
        migrate_v3(conn)?;
    }
    if current < 4 {
        migrate_v4(conn)?;
    }
    if current < 5 {
        migrate_v5(conn)?;
    }
    if current < 6 {
        migrate_v6(conn)?;
    }
    if current < 7 {
        migrate_v7(conn)?;
    }

    Ok(())
}

/// Migration v1: Core tables — settings, parking entries, sync queue.
fn migrate_v1(conn: &Connection) -> Result<(), String> {
    conn.execute_batch(
        "
        -- local_settings (category/key/value store)
        CREATE TABLE IF NOT EXISTS local_settings (
            id TEXT PRIMARY KEY DEFAULT (lower(hex(randomblob(16)))),
            setting_category TEXT NOT NULL,
            setting_key TEXT NOT NULL,
            setting_value TEXT NOT NULL,
            last_sync TEXT DEFAULT '',
            created_at TEXT DEFAULT (datetime('now')),
            updated_at TEXT DEFAULT (datetime('now')),
            UNIQUE(setting_category, setting_key)
        );

        -- parking_entries (one row per vehicle visit, never deleted)
        CREATE TABLE IF NOT EXISTS parking_entries (
            id TEXT PRIMARY KEY,
            serial_number INTEGER NOT NULL,
            transport_name TEXT NOT NULL,
            vehicle_type TEXT NOT NULL,
            vehicle_number TEXT NOT NULL,
            driver_name TEXT,
            driver_phone TEXT,
            location TEXT,
            notes TEXT,
            entry_time TEXT NOT NULL,
            exit_time TEXT,
            status TEXT NOT NULL DEFAULT 'Active'
                CHECK (status IN ('Active', 'Exited', 'Overstay')),
            parking_fee REAL NOT NULL DEFAULT 0,
            payment_status TEXT NOT NULL DEFAULT 'Unpaid'
                CHECK (payment_status IN ('Paid', 'Unpaid', 'Pending', 'Refunded')),
            payment_type TEXT,
            shift_session_id TEXT,
            created_by TEXT DEFAULT 'System',
            sync_status TEXT NOT NULL DEFAULT 'pending',
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            UNIQUE (vehicle_number, entry_time)
        );

        -- sync_queue (append-only)
        CREATE TABLE IF NOT EXISTS sync_queue (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            entity_type TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            operation TEXT NOT NULL,
            payload TEXT NOT NULL,
            idempotency_key TEXT UNIQUE NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            retry_count INTEGER DEFAULT 0,
            max_retries INTEGER DEFAULT 5,
            last_error TEXT,
            created_at TEXT DEFAULT (datetime('now')),
            updated_at TEXT DEFAULT (datetime('now')),
            synced_at TEXT
        );

        -- staff_sessions (login audit)
        CREATE TABLE IF NOT EXISTS staff_sessions (
            id TEXT PRIMARY KEY,
            staff_id TEXT NOT NULL,
            role TEXT NOT NULL DEFAULT 'operator',
            login_time TEXT DEFAULT (datetime('now')),
            logout_time TEXT,
            is_active INTEGER DEFAULT 1
        );

        -- Indexes
        CREATE INDEX IF NOT EXISTS idx_entries_vehicle_number ON parking_entries(vehicle_number);
        CREATE INDEX IF NOT EXISTS idx_entries_status ON parking_entries(status);
        CREATE INDEX IF NOT EXISTS idx_entries_entry_time ON parking_entries(entry_time);
        CREATE INDEX IF NOT EXISTS idx_entries_transport ON parking_entries(transport_name);
        CREATE INDEX IF NOT EXISTS idx_entries_shift ON parking_entries(shift_session_id);
        CREATE INDEX IF NOT EXISTS idx_entries_sync_status ON parking_entries(sync_status);
        CREATE INDEX IF NOT EXISTS idx_sync_queue_status ON sync_queue(status);
        CREATE INDEX IF NOT EXISTS idx_local_settings_cat_key ON local_settings(setting_category, setting_key);

        -- Record migration
        INSERT INTO schema_version (version) VALUES (1);
        ",
    )
    .map_err(|e| {
        error!("Migration v1 failed: {e}");
        format!("migration v1: {e}")
    })?;

    info!("Applied migration v1");
    Ok(())
}

/// Migration v2: Shift session tracking.
fn migrate_v2(conn: &Connection) -> Result<(), String> {
    conn.execute_batch(
        "
        -- shift_sessions (one operator working period per row)
        CREATE TABLE IF NOT EXISTS shift_sessions (
            id TEXT PRIMARY KEY,
            employee_id TEXT,
            employee_name TEXT NOT NULL,
            shift_start_time TEXT NOT NULL,
            shift_end_time TEXT,
            opening_cash_amount REAL NOT NULL DEFAULT 0,
            closing_cash_amount REAL,
            expected_cash_amount REAL,
            cash_discrepancy REAL,
            status TEXT NOT NULL DEFAULT 'active'
                CHECK (status IN ('active', 'completed', 'handover', 'emergency_ended')),
            shift_notes TEXT,
            sync_status TEXT NOT NULL DEFAULT 'pending',
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        -- Indexes for shift queries
        CREATE INDEX IF NOT EXISTS idx_shift_sessions_status ON shift_sessions(status);
        CREATE INDEX IF NOT EXISTS idx_shift_sessions_employee ON shift_sessions(employee_id);
        CREATE INDEX IF NOT EXISTS idx_shift_sessions_start ON shift_sessions(shift_start_time);

        -- Record migration
        INSERT INTO schema_version (version) VALUES (2);
        ",
    )
    .map_err(|e| {
        error!("Migration v2 failed: {e}");
        format!("migration v2: {e}")
    })?;

    info!("Applied migration v2 (shift_sessions table)");
    Ok(())
}

/// Migration v3: Shift expenses table.
fn migrate_v3(conn: &Connection) -> Result<(), String> {
    conn.execute_batch(
        "
        -- shift_expenses (cash outflows recorded during a shift)
        CREATE TABLE IF NOT EXISTS shift_expenses (
            id TEXT PRIMARY KEY,
            shift_session_id TEXT NOT NULL,
            expense_category TEXT NOT NULL
                CHECK (expense_category IN ('fuel', 'maintenance', 'supplies', 'salary_advance', 'utilities', 'other')),
            amount REAL NOT NULL,
            description TEXT NOT NULL,
            created_by TEXT,
            sync_status TEXT NOT NULL DEFAULT 'pending',
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            FOREIGN KEY(shift_session_id) REFERENCES shift_sessions(id) ON DELETE CASCADE
        );

        -- Indexes for expense queries
        CREATE INDEX IF NOT EXISTS idx_shift_expenses_shift_id ON shift_expenses(shift_session_id);
        CREATE INDEX IF NOT EXISTS idx_shift_expenses_created_at ON shift_expenses(created_at);

        -- Record migration
        INSERT INTO schema_version (version) VALUES (3);
        ",
    )
    .map_err(|e| {
        error!("Migration v3 failed: {e}");
        format!("migration v3: {e}")
    })?;

    info!("Applied migration v3 (shift_expenses table)");
    Ok(())
}

/// Migration v4: Shift deposits table.
///
/// Deposits record cash physically removed from the drawer (bank drops,
/// owner collections) plus any digital amount settled out of the terminal.
/// Append-only: there is no delete path.
fn migrate_v4(conn: &Connection) -> Result<(), String> {
    conn.execute_batch(
        "
        -- shift_deposits (append-only drawer removals)
        CREATE TABLE IF NOT EXISTS shift_deposits (
            id TEXT PRIMARY KEY,
            shift_session_id TEXT NOT NULL,
            cash_amount REAL NOT NULL DEFAULT 0,
            digital_amount REAL NOT NULL DEFAULT 0,
            notes TEXT,
            created_by TEXT,
            sync_status TEXT NOT NULL DEFAULT 'pending',
            created_at TEXT NOT NULL,
            FOREIGN KEY(shift_session_id) REFERENCES shift_sessions(id) ON DELETE CASCADE
        );

        CREATE INDEX IF NOT EXISTS idx_shift_deposits_shift_id ON shift_deposits(shift_session_id);
        CREATE INDEX IF NOT EXISTS idx_shift_deposits_created_at ON shift_deposits(created_at);

        -- Record migration
        INSERT INTO schema_version (version) VALUES (4);
        ",
    )
    .map_err(|e| {
        error!("Migration v4 failed: {e}");
        format!("migration v4: {e}")
    })?;

    info!("Applied migration v4 (shift_deposits table)");
    Ok(())
}

/// Migration v5: Vehicle rate card.
fn migrate_v5(conn: &Connection) -> Result<(), String> {
    conn.execute_batch(
        "
        -- vehicle_rates (daily rate per vehicle type)
        CREATE TABLE IF NOT EXISTS vehicle_rates (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT UNIQUE NOT NULL,
            daily_rate REAL NOT NULL CHECK (daily_rate >= 0),
            is_active INTEGER NOT NULL DEFAULT 1,
            created_at TEXT DEFAULT (datetime('now')),
            updated_at TEXT DEFAULT (datetime('now'))
        );

        -- Default rate card
        INSERT OR IGNORE INTO vehicle_rates (name, daily_rate) VALUES
            ('Trailer', 225.0),
            ('6 Wheeler', 150.0),
            ('4 Wheeler', 100.0),
            ('2 Wheeler', 50.0);

        -- Record migration
        INSERT INTO schema_version (version) VALUES (5);
        ",
    )
    .map_err(|e| {
        error!("Migration v5 failed: {e}");
        format!("migration v5: {e}")
    })?;

    info!("Applied migration v5 (vehicle_rates table)");
    Ok(())
}

/// Migration v6: Entry audit trail.
///
/// Every mutation of a parking entry (creation, exit processing, detail
/// edits, overstay flagging) appends a row here. Entries themselves are
/// never deleted, so the trail is complete by construction.
fn migrate_v6(conn: &Connection) -> Result<(), String> {
    conn.execute_batch(
        "
        -- entry_audit_log (append-only mutation trail)
        CREATE TABLE IF NOT EXISTS entry_audit_log (
            id TEXT PRIMARY KEY,
            entry_id TEXT NOT NULL,
            action TEXT NOT NULL
                CHECK (action IN ('created', 'exit_processed', 'updated', 'overstay_flagged')),
            old_values TEXT,
            new_values TEXT,
            performed_by TEXT,
            created_at TEXT NOT NULL,
            FOREIGN KEY(entry_id) REFERENCES parking_entries(id) ON DELETE CASCADE
        );

        CREATE INDEX IF NOT EXISTS idx_entry_audit_entry_id ON entry_audit_log(entry_id);
        CREATE INDEX IF NOT EXISTS idx_entry_audit_created_at ON entry_audit_log(created_at);

        -- Record migration
        INSERT INTO schema_version (version) VALUES (6);
        ",
    )
    .map_err(|e| {
        error!("Migration v6 failed: {e}");
        format!("migration v6: {e}")
    })?;

    info!("Applied migration v6 (entry_audit_log table)");
    Ok(())
}

/// Migration v7: Daily report snapshots.
fn migrate_v7(conn: &Connection) -> Result<(), String> {
    conn.execute_batch(
        "
        -- daily_reports: per-date financial snapshots
        CREATE TABLE IF NOT EXISTS daily_reports (
            id TEXT PRIMARY KEY,
            report_date TEXT UNIQUE NOT NULL,
            generated_at TEXT NOT NULL,
            -- Normalized totals for efficient queries
            vehicles_entered INTEGER NOT NULL DEFAULT 0,
            vehicles_exited INTEGER NOT NULL DEFAULT 0,
            cash_revenue REAL NOT NULL DEFAULT 0,
            digital_revenue REAL NOT NULL DEFAULT 0,
            total_revenue REAL NOT NULL DEFAULT 0,
            expenses_total REAL NOT NULL DEFAULT 0,
            deposits_total REAL NOT NULL DEFAULT 0,
            shifts_count INTEGER NOT NULL DEFAULT 0,
            -- Full breakdown JSON blob
            report_json TEXT NOT NULL DEFAULT '{}',
            sync_state TEXT NOT NULL DEFAULT 'pending'
                CHECK (sync_state IN ('pending', 'syncing', 'applied', 'failed')),
            sync_last_error TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_daily_reports_date ON daily_reports(report_date);
        CREATE INDEX IF NOT EXISTS idx_daily_reports_sync_state ON daily_reports(sync_state);

        -- Record migration
        INSERT INTO schema_version (version) VALUES (7);
        ",
    )
    .map_err(|e| {
        error!("Migration v7 failed: {e}");
        format!("migration v7: {e}")
    })?;

    info!("Applied migration v7 (daily_reports table)");
    Ok(())
}

// ---------------------------------------------------------------------------
// Settings helpers
// ---------------------------------------------------------------------------

/// Get a single setting value.
pub fn get_setting(conn: &Connection, category: &str, key: &str) -> Option<String> {
    conn.query_row(
        "SELECT setting_value FROM local_settings WHERE setting_category = ?1 AND setting_key = ?2",
        params![category, key],
        |row| row.get(0),
    )
    .ok()
}

/// Insert or update a setting.
pub fn set_setting(
    conn: &Connection,
    category: &str,
    key: &str,
    value: &str,
) -> Result<(), String> {
    conn.execute(
        "INSERT INTO local_settings (setting_category, setting_key, setting_value, updated_at)
         VALUES (?1, ?2, ?3, datetime('now'))
         ON CONFLICT(setting_category, setting_key) DO UPDATE SET
            setting_value = excluded.setting_value,
            updated_at = excluded.updated_at",
        params![category, key, value],
    )
    .map_err(|e| format!("set_setting: {e}"))?;
    Ok(())
}

/// Get all settings grouped by category as JSON.
pub fn get_all_settings(conn: &Connection) -> serde_json::Value {
    let mut stmt = match conn.prepare(
        "SELECT setting_category, setting_key, setting_value FROM local_settings ORDER BY setting_category, setting_key",
    ) {
        Ok(s) => s,
        Err(e) => {
            error!("get_all_settings prepare: {e}");
            return serde_json::json!({});
        }
    };

    let mut result = serde_json::Map::new();

    let rows = match stmt.query_map([], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
        ))
    }) {
        Ok(r) => r,
        Err(e) => {
            error!("get_all_settings query: {e}");
            return serde_json::json!({});
        }
    };

    for (cat, key, val) in rows.flatten() {
        let category = result.entry(cat).or_insert_with(|| serde_json::json!({}));
        if let serde_json::Value::Object(ref mut map) = category {
            map.insert(key, serde_json::Value::String(val));
        }
    }

    serde_json::Value::Object(result)
}

/// Delete all settings in a category.
#[allow(dead_code)]
pub fn delete_all_settings(conn: &Connection, category: &str) -> Result<(), String> {
    conn.execute(
        "DELETE FROM local_settings WHERE setting_category = ?1",
        params![category],
    )
    .map_err(|e| format!("delete_all_settings: {e}"))?;
    Ok(())
}

/// Load the active rate card as (name, daily_rate) pairs.
pub fn load_vehicle_rates(conn: &Connection) -> Result<Vec<(String, f64)>, String> {
    let mut stmt = conn
        .prepare("SELECT name, daily_rate FROM vehicle_rates WHERE is_active = 1 ORDER BY name")
        .map_err(|e| format!("prepare vehicle_rates: {e}"))?;
    let rows = stmt
        .query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?))
        })
        .map_err(|e| format!("query vehicle_rates: {e}"))?;
    Ok(rows.filter_map(|r| r.ok()).collect())
}

/// Run all migrations on the given connection (test helper, not public API).
#[cfg(test)]
pub fn run_migrations_for_test(conn: &Connection) {
    run_migrations(conn).expect("run_migrations should succeed in test");
}

// ===========================================================================
// Tests
// ===========================================================================
