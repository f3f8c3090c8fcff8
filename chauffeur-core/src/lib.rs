pub mod config;
pub mod error;
pub mod executor;
pub mod metrics;
pub mod pool;
pub mod session;
pub mod task;

pub use config::{
    load_browser_config, load_service_config, BrowserConfig, ConfigBundle, PoolSection,
    ServiceConfig, TaskSection,
};
pub use error::{ConfigError, Result};
pub use executor::{ExecutorError, Outcome, TaskExecutor};
pub use metrics::ExecutorMetrics;
pub use pool::{PoolError, PoolResult, PoolStats, SessionLease, SessionPool, SessionState};
pub use session::{
    ChromiumBackend, ProfileStore, SessionBackend, SessionError, SessionHandle, SessionProfile,
    SessionResult,
};
pub use task::{Action, Task, TaskBuilder, TaskPayload, TaskSpec};
