use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::config::ProfilesSection;

use super::error::{SessionError, SessionResult};

/// An ephemeral Chromium user-data directory, one per launched session.
/// Keeps cookie/cache state off the default profile and lets stale state
/// age out with the directory.
#[derive(Debug, Clone)]
pub struct SessionProfile {
    id: String,
    path: PathBuf,
    created_at: DateTime<Utc>,
}

impl SessionProfile {
    fn create(base_dir: &Path) -> SessionResult<Self> {
        let id = Uuid::new_v4().to_string();
        let path = base_dir.join(&id);
        std::fs::create_dir_all(&path)
            .map_err(|err| SessionError::Profile(format!("failed to create profile dir: {err}")))?;
        Ok(Self {
            id,
            path,
            created_at: Utc::now(),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Remove the directory from disk. Best effort; a vanished directory is
    /// not an error.
    pub fn remove(&self) {
        if let Err(err) = std::fs::remove_dir_all(&self.path) {
            if err.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(profile = %self.id, error = %err, "failed to remove session profile");
            }
        }
    }
}

/// Allocates and garbage-collects session profiles under one base
/// directory.
#[derive(Debug, Clone)]
pub struct ProfileStore {
    base_dir: PathBuf,
    ttl: Duration,
}

impl ProfileStore {
    pub fn new<P: AsRef<Path>>(base_dir: P, ttl: Duration) -> SessionResult<Self> {
        let base_dir = base_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&base_dir).map_err(|err| {
            SessionError::Profile(format!("failed to create profile base dir: {err}"))
        })?;
        Ok(Self { base_dir, ttl })
    }

    pub fn from_config(section: &ProfilesSection) -> SessionResult<Self> {
        Self::new(&section.base_dir, section.ttl())
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn allocate(&self) -> SessionResult<SessionProfile> {
        SessionProfile::create(&self.base_dir)
    }

    /// Drop profile directories whose mtime is past the TTL. Directories
    /// belonging to live sessions get their mtime refreshed on every
    /// launch, so only abandoned ones match.
    pub fn cleanup_expired(&self) -> SessionResult<()> {
        let now = SystemTime::now();
        let entries = std::fs::read_dir(&self.base_dir).map_err(|err| {
            SessionError::Profile(format!("failed to list profile directory: {err}"))
        })?;
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let modified = match entry.metadata().and_then(|meta| meta.modified()) {
                Ok(modified) => modified,
                Err(err) => {
                    tracing::warn!(path = %path.display(), error = %err, "failed to read profile metadata");
                    continue;
                }
            };
            if now.duration_since(modified).unwrap_or(Duration::ZERO) > self.ttl {
                if let Err(err) = std::fs::remove_dir_all(&path) {
                    tracing::warn!(path = %path.display(), error = %err, "failed to remove expired profile");
                }
            }
        }
        Ok(())
    }
}
