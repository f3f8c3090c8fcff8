use std::fmt;
use std::fs;
use std::path::Path;

use serde::Serialize;

use crate::AppContext;

/// Local integrity checks: config files on disk, a launchable Chromium,
/// and a usable profile directory.
pub fn check(context: &AppContext) -> Vec<HealthEntry> {
    let mut results = Vec::new();
    results.push(check_file("chauffeur.toml", &context.config_path));
    results.push(check_file("browser.toml", &context.browser_path));
    results.push(check_executable(
        "chromium",
        Path::new(&context.browser.chromium.executable_path),
    ));
    results.push(check_profiles_dir(
        "profiles",
        Path::new(&context.browser.profiles.base_dir),
    ));
    results.push(check_pool_limits(context));
    results
}

fn check_file(name: &str, path: &Path) -> HealthEntry {
    if path.is_file() {
        HealthEntry::ok(name, path.display().to_string())
    } else {
        HealthEntry::error(name, format!("{} missing", path.display()))
    }
}

fn check_executable(name: &str, path: &Path) -> HealthEntry {
    match fs::metadata(path) {
        Ok(meta) if meta.is_file() => HealthEntry::ok(name, path.display().to_string()),
        Ok(_) => HealthEntry::error(name, format!("{} is not a file", path.display())),
        Err(_) => HealthEntry::error(
            name,
            format!(
                "{} not found; install Chromium or adjust chromium.executable_path",
                path.display()
            ),
        ),
    }
}

fn check_profiles_dir(name: &str, path: &Path) -> HealthEntry {
    match fs::metadata(path) {
        Ok(meta) if meta.is_dir() => HealthEntry::ok(name, path.display().to_string()),
        Ok(_) => HealthEntry::error(name, format!("{} is not a directory", path.display())),
        Err(_) => HealthEntry::warn(
            name,
            format!("{} absent; it is created on first launch", path.display()),
        ),
    }
}

fn check_pool_limits(context: &AppContext) -> HealthEntry {
    let pool = &context.service.pool;
    if pool.max_sessions > 8 {
        HealthEntry::warn(
            "pool",
            format!(
                "max {} sessions; each one is a full Chromium process",
                pool.max_sessions
            ),
        )
    } else {
        HealthEntry::ok(
            "pool",
            format!(
                "max {} sessions, warm minimum {}",
                pool.max_sessions, pool.min_idle
            ),
        )
    }
}

#[derive(Debug, Serialize)]
pub struct HealthEntry {
    pub name: String,
    pub status: CheckStatus,
    pub detail: String,
}

#[derive(Debug, Serialize)]
pub enum CheckStatus {
    #[serde(rename = "ok")]
    Ok,
    #[serde(rename = "warn")]
    Warn,
    #[serde(rename = "error")]
    Error,
}

impl fmt::Display for CheckStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            CheckStatus::Ok => "OK",
            CheckStatus::Warn => "WARN",
            CheckStatus::Error => "ERROR",
        };
        write!(f, "{}", label)
    }
}

impl HealthEntry {
    fn ok(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: CheckStatus::Ok,
            detail: detail.into(),
        }
    }

    fn warn(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: CheckStatus::Warn,
            detail: detail.into(),
        }
    }

    fn error(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: CheckStatus::Error,
            detail: detail.into(),
        }
    }
}
