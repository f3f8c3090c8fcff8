use std::path::Path;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::error::{ConfigError, Result};

/// Service-level configuration: the knobs the deployment supplies from
/// outside (port, pool bounds, task deadlines).
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ServiceConfig {
    pub service: ServiceSection,
    pub pool: PoolSection,
    pub task: TaskSection,
}

impl ServiceConfig {
    /// Apply environment overrides on top of the file values. The front end
    /// deployment injects these; unset or unparseable variables are ignored.
    pub fn apply_env_overrides(&mut self) {
        if let Some(port) = env_parse::<u16>("CHAUFFEUR_PORT") {
            self.service.listen_port = port;
        }
        if let Some(max) = env_parse::<usize>("CHAUFFEUR_MAX_SESSIONS") {
            self.pool.max_sessions = max;
        }
        if let Some(secs) = env_parse::<u64>("CHAUFFEUR_TASK_TIMEOUT_SECONDS") {
            self.task.default_deadline_seconds = secs;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.pool.max_sessions == 0 {
            return Err(ConfigError::Invalid {
                field: "pool.max_sessions",
                message: "must be at least 1".to_string(),
            });
        }
        if self.pool.min_idle > self.pool.max_sessions {
            return Err(ConfigError::Invalid {
                field: "pool.min_idle",
                message: format!(
                    "warm minimum {} exceeds max_sessions {}",
                    self.pool.min_idle, self.pool.max_sessions
                ),
            });
        }
        if self.task.default_deadline_seconds == 0 {
            return Err(ConfigError::Invalid {
                field: "task.default_deadline_seconds",
                message: "must be non-zero".to_string(),
            });
        }
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|value| value.parse().ok())
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceSection {
    pub listen_port: u16,
    pub shutdown_grace_seconds: u64,
}

impl ServiceSection {
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_seconds)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PoolSection {
    pub max_sessions: usize,
    pub min_idle: usize,
    pub idle_ttl_seconds: u64,
    pub reap_interval_seconds: u64,
    pub max_session_failures: u32,
    pub acquire_timeout_ms: u64,
}

impl PoolSection {
    pub fn idle_ttl(&self) -> Duration {
        Duration::from_secs(self.idle_ttl_seconds)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_seconds)
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TaskSection {
    pub default_deadline_seconds: u64,
    pub acquire_safety_margin_ms: u64,
}

impl TaskSection {
    pub fn default_deadline(&self) -> Duration {
        Duration::from_secs(self.default_deadline_seconds)
    }

    pub fn acquire_safety_margin(&self) -> Duration {
        Duration::from_millis(self.acquire_safety_margin_ms)
    }
}

/// Browser-side configuration: how Chromium itself is launched and dressed.
#[derive(Debug, Clone, Deserialize)]
pub struct BrowserConfig {
    pub chromium: ChromiumSection,
    pub flags: FlagsSection,
    pub user_agents: UserAgentSection,
    pub viewport: ViewportSection,
    pub profiles: ProfilesSection,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChromiumSection {
    pub executable_path: String,
    pub headless: bool,
    pub sandbox: bool,
    pub disable_gpu: bool,
    pub request_timeout_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FlagsSection {
    pub no_first_run: bool,
    pub mute_audio: bool,
    pub extra_args: Vec<String>,
    pub lang: Option<String>,
    pub accept_language: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UserAgentSection {
    pub pool: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ViewportSection {
    pub width: u32,
    pub height: u32,
    pub device_scale_factor: f64,
    pub jitter_pixels: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProfilesSection {
    pub base_dir: String,
    pub ttl_hours: u64,
}

impl ProfilesSection {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_hours * 60 * 60)
    }
}

#[derive(Debug, Clone)]
pub struct ConfigBundle {
    pub service: ServiceConfig,
    pub browser: BrowserConfig,
}

impl ConfigBundle {
    pub fn from_directory<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref();
        let mut service = load_service_config(dir.join("chauffeur.toml"))?;
        service.apply_env_overrides();
        service.validate()?;
        let browser = load_browser_config(dir.join("browser.toml"))?;
        Ok(Self { service, browser })
    }
}

pub fn load_service_config<P: AsRef<Path>>(path: P) -> Result<ServiceConfig> {
    load_toml(path)
}

pub fn load_browser_config<P: AsRef<Path>>(path: P) -> Result<BrowserConfig> {
    load_toml(path)
}

fn load_toml<T, P>(path: P) -> Result<T>
where
    T: DeserializeOwned,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        source,
        path: path.to_path_buf(),
    })?;
    toml::from_str(&content).map_err(|source| ConfigError::Parse {
        source,
        path: path.to_path_buf(),
    })
}
