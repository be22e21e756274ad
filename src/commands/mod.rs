//! IPC command handlers, grouped by domain.
//!
//! Each module wraps a service module with `#[tauri::command]` functions:
//! payload parsing (camelCase with snake_case aliases), permission-neutral
//! delegation, and change events for the frontend.

pub mod auth;
pub mod diagnostics;
pub mod entries;
pub mod reports;
pub mod runtime;
pub mod settings;
pub mod shifts;
pub mod sync;
