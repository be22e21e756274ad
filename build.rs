fn main() {
    // Build metadata surfaced by diagnostics::get_about_info().
    let timestamp = chrono_free_timestamp();
    println!("cargo:rustc-env=BUILD_TIMESTAMP={timestamp}");

    let git_sha = std::process::Command::new("git")
        .args(["rev-parse", "--short", "HEAD"])
        .output()
        .ok()
        .filter(|o| o.status.success())
        .map(|o| String::from_utf8_lossy(&o.stdout).trim().to_string())
        .unwrap_or_else(|| "unknown".to_string());
    println!("cargo:rustc-env=BUILD_GIT_SHA={git_sha}");

    tauri_build::build()
}

/// Seconds since the Unix epoch, formatted without pulling chrono into the
/// build script.
fn chrono_free_timestamp() -> String {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs().to_string())
        .unwrap_or_else(|_| "0".to_string())
}
