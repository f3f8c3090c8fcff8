use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::PoolSection;
use crate::session::{SessionBackend, SessionError, SessionHandle, SessionResult};
use crate::task::{TaskPayload, TaskSpec};

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("pool exhausted: no session became available within {waited_ms}ms")]
    Exhausted { waited_ms: u64 },
    #[error("pool closed")]
    Closed,
    #[error("session launch failed: {0}")]
    Launch(#[source] SessionError),
}

pub type PoolResult<T> = Result<T, PoolError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Busy,
    Draining,
    Dead,
}

/// A browser session owned by the pool, together with its supervision
/// bookkeeping.
pub struct PooledSession {
    id: Uuid,
    handle: Box<dyn SessionHandle>,
    state: SessionState,
    failures: u32,
    created_at: DateTime<Utc>,
    idle_since: Instant,
    last_used: Instant,
}

impl PooledSession {
    fn new(handle: Box<dyn SessionHandle>) -> Self {
        let now = Instant::now();
        Self {
            id: Uuid::new_v4(),
            handle,
            state: SessionState::Busy,
            failures: 0,
            created_at: Utc::now(),
            idle_since: now,
            last_used: now,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn last_used(&self) -> Instant {
        self.last_used
    }

    pub fn state(&self) -> SessionState {
        self.state
    }
}

struct PoolState {
    idle: VecDeque<PooledSession>,
    /// In-flight sessions plus slots reserved for launches still underway.
    busy: usize,
    closed: bool,
    created_total: u64,
    destroyed_total: u64,
}

impl PoolState {
    fn live(&self) -> usize {
        self.idle.len() + self.busy
    }
}

/// Point-in-time snapshot of the pool, for operators and log lines.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub max_sessions: usize,
    pub idle: usize,
    pub busy: usize,
    pub live: usize,
    pub created_total: u64,
    pub destroyed_total: u64,
    pub closed: bool,
}

enum AcquirePlan {
    Ready(PooledSession),
    Launch,
    Wait,
}

/// Bounded set of reusable browser sessions.
///
/// All registry mutations go through one async mutex, so the invariant
/// busy + idle <= max_sessions holds across concurrent acquires, releases
/// and reaping. Launch slots are reserved before the launch starts, which
/// keeps the cap honest while a launch is in flight.
pub struct SessionPool {
    config: PoolSection,
    backend: Arc<dyn SessionBackend>,
    state: Mutex<PoolState>,
    released: Notify,
    reaper: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl SessionPool {
    pub fn new(config: PoolSection, backend: Arc<dyn SessionBackend>) -> Self {
        Self {
            config,
            backend,
            state: Mutex::new(PoolState {
                idle: VecDeque::new(),
                busy: 0,
                closed: false,
                created_total: 0,
                destroyed_total: 0,
            }),
            released: Notify::new(),
            reaper: std::sync::Mutex::new(None),
        }
    }

    pub fn config(&self) -> &PoolSection {
        &self.config
    }

    /// Spawn the background reaper and warm the pool up to its idle
    /// minimum. Idempotent enough for practical use: a second call replaces
    /// the previous reaper.
    pub fn start(self: &Arc<Self>) {
        let pool = Arc::clone(self);
        let handle = tokio::spawn(async move {
            pool.warm_up().await;
            let interval = pool.config.reap_interval();
            loop {
                sleep(interval).await;
                if pool.is_closed().await {
                    break;
                }
                pool.reap().await;
                pool.warm_up().await;
            }
        });
        if let Ok(mut slot) = self.reaper.lock() {
            if let Some(previous) = slot.replace(handle) {
                previous.abort();
            }
        }
    }

    /// Hand out an idle session, or launch a new one while under the cap,
    /// or park the caller until a session is released or `timeout` elapses.
    pub async fn acquire(self: &Arc<Self>, timeout: Duration) -> PoolResult<SessionLease> {
        let deadline = Instant::now() + timeout;
        loop {
            // Register for release wakeups before inspecting state, so a
            // release landing between the check and the await is not lost.
            let released = self.released.notified();

            let plan = {
                let mut state = self.state.lock().await;
                if state.closed {
                    return Err(PoolError::Closed);
                }
                if let Some(mut session) = state.idle.pop_front() {
                    session.state = SessionState::Busy;
                    state.busy += 1;
                    AcquirePlan::Ready(session)
                } else if state.live() < self.config.max_sessions {
                    // Reserve the slot for the launch about to happen.
                    state.busy += 1;
                    AcquirePlan::Launch
                } else {
                    AcquirePlan::Wait
                }
            };

            match plan {
                AcquirePlan::Ready(session) => {
                    debug!(session_id = %session.id, "reusing idle browser session");
                    return Ok(SessionLease::new(self, session));
                }
                AcquirePlan::Launch => match self.backend.launch().await {
                    Ok(handle) => {
                        let session = PooledSession::new(handle);
                        {
                            let mut state = self.state.lock().await;
                            state.created_total += 1;
                        }
                        info!(session_id = %session.id, "launched new browser session");
                        return Ok(SessionLease::new(self, session));
                    }
                    Err(err) => {
                        {
                            let mut state = self.state.lock().await;
                            state.busy -= 1;
                        }
                        self.released.notify_one();
                        return Err(PoolError::Launch(err));
                    }
                },
                AcquirePlan::Wait => {
                    if Instant::now() >= deadline {
                        return Err(PoolError::Exhausted {
                            waited_ms: timeout.as_millis() as u64,
                        });
                    }
                    tokio::select! {
                        _ = released => {}
                        _ = sleep_until(deadline) => {
                            return Err(PoolError::Exhausted {
                                waited_ms: timeout.as_millis() as u64,
                            });
                        }
                    }
                }
            }
        }
    }

    /// Take a session back. Healthy sessions below the failure threshold
    /// return to the idle set; everything else is destroyed and the slot
    /// freed for a future launch.
    async fn release(&self, session: PooledSession, healthy: bool) {
        let mut returned = Some(session);
        let reason = {
            let mut state = self.state.lock().await;
            state.busy -= 1;
            let failures = returned.as_ref().map(|s| s.failures).unwrap_or(0);
            let reason = if state.closed {
                Some("pool closed")
            } else if !healthy {
                Some("released unhealthy")
            } else if self.config.max_session_failures > 0
                && failures >= self.config.max_session_failures
            {
                Some("failure threshold reached")
            } else {
                None
            };
            if reason.is_some() {
                state.destroyed_total += 1;
            } else if let Some(mut session) = returned.take() {
                let now = Instant::now();
                session.state = SessionState::Idle;
                session.idle_since = now;
                session.last_used = now;
                state.idle.push_back(session);
            }
            reason
        };

        match (reason, returned) {
            (Some(reason), Some(session)) => {
                self.destroy(session, reason).await;
                // The freed slot unblocks an acquire waiter; after close it
                // is the shutdown waiter watching the busy count. notify_one
                // stores a permit when nobody is parked yet, so wakeups
                // cannot be lost between the state check and the await.
                self.released.notify_one();
            }
            _ => {
                self.released.notify_one();
            }
        }
    }

    /// Close a session's underlying browser and log the reason.
    async fn destroy(&self, mut session: PooledSession, reason: &str) {
        session.state = SessionState::Draining;
        if let Err(err) = session.handle.close().await {
            warn!(session_id = %session.id, error = %err, "failed to close browser session");
        }
        session.state = SessionState::Dead;
        debug!(session_id = %session.id, reason, "browser session destroyed");
    }

    /// Evict idle sessions past the TTL and idle sessions carrying failures,
    /// so flaky instances heal without waiting for pressure.
    pub async fn reap(&self) {
        let ttl = self.config.idle_ttl();
        let now = Instant::now();
        let evicted: Vec<PooledSession> = {
            let mut state = self.state.lock().await;
            if state.closed {
                return;
            }
            let mut keep = VecDeque::with_capacity(state.idle.len());
            let mut evicted = Vec::new();
            while let Some(session) = state.idle.pop_front() {
                let expired = now.duration_since(session.idle_since) > ttl;
                if expired || session.failures > 0 {
                    evicted.push(session);
                } else {
                    keep.push_back(session);
                }
            }
            state.idle = keep;
            state.destroyed_total += evicted.len() as u64;
            evicted
        };
        for session in evicted {
            let reason = if session.failures > 0 {
                "flaky idle session"
            } else {
                "idle ttl expired"
            };
            self.destroy(session, reason).await;
        }
    }

    /// Launch sessions until the idle set reaches the configured warm
    /// minimum, respecting the cap.
    async fn warm_up(&self) {
        loop {
            {
                let mut state = self.state.lock().await;
                if state.closed
                    || state.idle.len() >= self.config.min_idle
                    || state.live() >= self.config.max_sessions
                {
                    return;
                }
                state.busy += 1;
            }
            match self.backend.launch().await {
                Ok(handle) => {
                    let mut session = PooledSession::new(handle);
                    session.state = SessionState::Idle;
                    session.idle_since = Instant::now();
                    let closed = {
                        let mut state = self.state.lock().await;
                        state.busy -= 1;
                        state.created_total += 1;
                        if state.closed {
                            state.destroyed_total += 1;
                            true
                        } else {
                            debug!(session_id = %session.id, "warm session ready");
                            state.idle.push_back(session);
                            false
                        }
                    };
                    if closed {
                        return;
                    }
                    self.released.notify_one();
                }
                Err(err) => {
                    {
                        let mut state = self.state.lock().await;
                        state.busy -= 1;
                    }
                    warn!(error = %err, "warm-up launch failed");
                    return;
                }
            }
        }
    }

    /// Close the pool: reject new acquires, drain idle sessions now, and
    /// wait up to `grace` for busy sessions to come back. Sessions released
    /// after the close are destroyed on return, never recycled.
    pub async fn shutdown(&self, grace: Duration) {
        let drained: Vec<PooledSession> = {
            let mut state = self.state.lock().await;
            if state.closed {
                Vec::new()
            } else {
                state.closed = true;
                let drained: Vec<PooledSession> = state.idle.drain(..).collect();
                state.destroyed_total += drained.len() as u64;
                drained
            }
        };
        self.released.notify_waiters();
        for session in drained {
            self.destroy(session, "pool shutdown").await;
        }

        let deadline = Instant::now() + grace;
        loop {
            let released = self.released.notified();
            {
                let state = self.state.lock().await;
                if state.busy == 0 {
                    break;
                }
            }
            tokio::select! {
                _ = released => {}
                _ = sleep_until(deadline) => {
                    let state = self.state.lock().await;
                    warn!(
                        busy = state.busy,
                        "shutdown grace period elapsed with sessions still in flight"
                    );
                    break;
                }
            }
        }

        if let Ok(mut slot) = self.reaper.lock() {
            if let Some(handle) = slot.take() {
                handle.abort();
            }
        }
        info!("session pool shut down");
    }

    pub async fn is_closed(&self) -> bool {
        self.state.lock().await.closed
    }

    pub async fn stats(&self) -> PoolStats {
        let state = self.state.lock().await;
        PoolStats {
            max_sessions: self.config.max_sessions,
            idle: state.idle.len(),
            busy: state.busy,
            live: state.live(),
            created_total: state.created_total,
            destroyed_total: state.destroyed_total,
            closed: state.closed,
        }
    }
}

/// RAII wrapper around an acquired session. Every exit path releases the
/// session exactly once; a lease dropped without an explicit release (a
/// cancelled future, a panicking caller) discards its session as unhealthy
/// instead of trusting unknown browser state.
pub struct SessionLease {
    pool: Arc<SessionPool>,
    session: Option<PooledSession>,
}

impl SessionLease {
    fn new(pool: &Arc<SessionPool>, session: PooledSession) -> Self {
        Self {
            pool: Arc::clone(pool),
            session: Some(session),
        }
    }

    pub fn session_id(&self) -> Option<Uuid> {
        self.session.as_ref().map(|session| session.id)
    }

    pub fn failures(&self) -> u32 {
        self.session
            .as_ref()
            .map(|session| session.failures)
            .unwrap_or(0)
    }

    pub fn record_failure(&mut self) {
        if let Some(session) = self.session.as_mut() {
            session.failures = session.failures.saturating_add(1);
        }
    }

    pub fn record_success(&mut self) {
        if let Some(session) = self.session.as_mut() {
            session.failures = 0;
        }
    }

    pub async fn run(&mut self, spec: &TaskSpec) -> SessionResult<TaskPayload> {
        let session = self
            .session
            .as_mut()
            .ok_or_else(|| SessionError::Protocol("lease already released".to_string()))?;
        session.last_used = Instant::now();
        session.handle.run(spec).await
    }

    pub async fn release(mut self, healthy: bool) {
        if let Some(session) = self.session.take() {
            self.pool.release(session, healthy).await;
        }
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            warn!(session_id = %session.id, "session lease dropped without release; discarding session");
            let pool = Arc::clone(&self.pool);
            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                runtime.spawn(async move {
                    pool.release(session, false).await;
                });
            }
        }
    }
}
