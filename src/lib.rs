#![recursion_limit = "256"]

//! ParkPoint - Tauri v2 Backend
//!
//! This module registers all IPC command handlers that the React frontend
//! calls via `@tauri-apps/api/core::invoke()`. Command names use snake_case
//! grouped by domain (e.g. `entry_create`, `shift_end`, `report_list`).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tauri::Emitter;
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// App start time for uptime calculation (epoch seconds).
pub(crate) static APP_START_EPOCH: AtomicU64 = AtomicU64::new(0);

/// Interval for the background overstay monitor (seconds).
const OVERSTAY_MONITOR_INTERVAL_SECS: u64 = 300;

/// Interval for the background sync loop (seconds).
const SYNC_INTERVAL_SECS: u64 = 15;

mod api;
mod auth;
mod commands;
mod db;
mod diagnostics;
mod entries;
mod fees;
mod reconcile;
mod reports;
mod shifts;
mod storage;
mod sync;

pub(crate) fn value_str(v: &serde_json::Value, keys: &[&str]) -> Option<String> {
    for key in keys {
        if let Some(s) = v.get(*key).and_then(|x| x.as_str()) {
            let trimmed = s.trim();
            if !trimmed.is_empty() {
                return Some(trimmed.to_string());
            }
        }
    }
    None
}

pub(crate) fn value_f64(v: &serde_json::Value, keys: &[&str]) -> Option<f64> {
    for key in keys {
        if let Some(n) = v.get(*key).and_then(|x| x.as_f64()) {
            return Some(n);
        }
    }
    None
}

/// Background monitor flagging overstayed vehicles. Uses its own database
/// connection so it never blocks command handlers.
fn start_overstay_monitor(app: tauri::AppHandle, db: Arc<db::DbState>, interval_secs: u64) {
    tauri::async_runtime::spawn(async move {
        info!(interval_secs, "overstay monitor started");
        loop {
            tokio::time::sleep(std::time::Duration::from_secs(interval_secs)).await;
            match entries::refresh_overstays(&db) {
                Ok(result) => {
                    let flagged = result["flagged"].as_i64().unwrap_or(0);
                    if flagged > 0 {
                        let _ = app.emit(
                            "entry_updated",
                            serde_json::json!({ "action": "overstay_flagged", "result": result }),
                        );
                    }
                }
                Err(e) => warn!("overstay monitor pass failed: {e}"),
            }
        }
    });
}

// ============================================================================
// App entry point
// ============================================================================

pub fn run() {
    // Record start time for uptime tracking
    let epoch = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    APP_START_EPOCH.store(epoch, Ordering::Relaxed);

    // Initialize structured logging (console + rolling file)
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,parkpoint_lib=debug"));

    // Prune old log files before setting up the appender
    diagnostics::prune_old_logs();

    // Rolling file appender: creates daily log files in the logs directory
    let log_dir = diagnostics::get_log_dir();
    std::fs::create_dir_all(&log_dir).ok();

    let file_appender = tracing_appender::rolling::daily(&log_dir, "parkpoint");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true);
    let console_layer = fmt::layer().with_target(true);
    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    // Keep the guard alive for the lifetime of the app — dropping it flushes logs.
    // We leak it intentionally since the app runs until process exit.
    std::mem::forget(_guard);

    info!("Starting ParkPoint v{}", env!("CARGO_PKG_VERSION"));

    tauri::Builder::default()
        .setup(|app| {
            use tauri::Manager;

            let app_data_dir = app
                .path()
                .app_data_dir()
                .expect("Failed to get app data dir");

            // Main DB connection for Tauri commands
            let db_state = db::init(&app_data_dir).expect("Failed to initialize database");
            app.manage(db_state);

            // Auth state
            app.manage(auth::AuthState::new());

            // Sync state (shared between commands and background loop)
            let sync_state = Arc::new(sync::SyncState::new());
            app.manage(sync_state.clone());

            // Second DB connection for the background sync loop
            let db_for_sync =
                Arc::new(db::init(&app_data_dir).expect("Failed to init sync database"));
            sync::start_sync_loop(
                app.handle().clone(),
                db_for_sync,
                sync_state,
                SYNC_INTERVAL_SECS,
            );

            // Third DB connection for the overstay monitor
            let db_for_overstays =
                Arc::new(db::init(&app_data_dir).expect("Failed to init overstay database"));
            start_overstay_monitor(
                app.handle().clone(),
                db_for_overstays,
                OVERSTAY_MONITOR_INTERVAL_SECS,
            );

            info!("Database, auth, sync loop, and overstay monitor registered");
            Ok(())
        })
        .invoke_handler(tauri::generate_handler![
            // App lifecycle
            commands::runtime::app_shutdown,
            commands::runtime::app_restart,
            commands::runtime::app_get_version,
            commands::runtime::system_get_info,
            // Auth
            commands::auth::auth_login,
            commands::auth::auth_logout,
            commands::auth::auth_get_current_session,
            commands::auth::auth_validate_session,
            commands::auth::auth_has_permission,
            commands::auth::auth_has_any_permission,
            commands::auth::auth_get_session_stats,
            commands::auth::auth_setup_pin,
            commands::auth::auth_track_activity,
            // Parking entries
            commands::entries::entry_create,
            commands::entries::entry_process_exit,
            commands::entries::entry_update,
            commands::entries::entry_get,
            commands::entries::entry_find_parked,
            commands::entries::entry_list,
            commands::entries::entry_refresh_overstays,
            commands::entries::entry_get_audit_trail,
            commands::entries::entry_estimate_fee,
            // Shifts
            commands::shifts::shift_start,
            commands::shifts::shift_end,
            commands::shifts::shift_handover,
            commands::shifts::shift_get_active,
            commands::shifts::shift_get,
            commands::shifts::shift_list,
            commands::shifts::shift_get_summary,
            commands::shifts::shift_suggested_opening_cash,
            commands::shifts::shift_cash_status,
            commands::shifts::shift_preview_reconciliation,
            commands::shifts::shift_record_expense,
            commands::shifts::shift_delete_expense,
            commands::shifts::shift_get_expenses,
            commands::shifts::shift_record_deposit,
            commands::shifts::shift_get_deposits,
            // Settings
            commands::settings::settings_get,
            commands::settings::settings_set,
            commands::settings::settings_get_all,
            commands::settings::settings_is_configured,
            commands::settings::settings_get_full_config,
            commands::settings::settings_update_terminal_credentials,
            commands::settings::settings_factory_reset,
            commands::settings::rates_get_schedule,
            commands::settings::rates_update,
            commands::settings::rates_estimate_fee,
            commands::settings::fees_set_policy,
            commands::settings::terminal_config_get_setting,
            // Reports
            commands::reports::report_get_today_statistics,
            commands::reports::report_generate_daily,
            commands::reports::report_get,
            commands::reports::report_list,
            // Sync
            commands::sync::sync_get_status,
            commands::sync::sync_force,
            commands::sync::sync_retry_failed,
            commands::sync::sync_prune_synced,
            commands::sync::sync_test_connection,
            // Diagnostics
            commands::diagnostics::diagnostics_get_about,
            commands::diagnostics::diagnostics_get_system_health,
            commands::diagnostics::database_health_check,
            commands::diagnostics::diagnostics_export,
        ])
        .run(tauri::generate_context!())
        .expect("error while running ParkPoint");
}
