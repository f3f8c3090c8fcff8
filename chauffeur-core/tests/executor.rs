use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chauffeur_core::{
    ExecutorError, Outcome, PoolSection, SessionBackend, SessionError, SessionHandle, SessionPool,
    SessionResult, Task, TaskExecutor, TaskPayload, TaskSection, TaskSpec,
};
use tokio::time::{sleep, Instant};

/// Scripted behavior for the next `run` call; the queue is shared across
/// every session the backend launches.
#[derive(Debug, Clone, Copy)]
enum RunPlan {
    Succeed,
    Delay(Duration),
    ActionError,
    ProtocolError,
    Hang,
}

#[derive(Default)]
struct MockBackend {
    plans: Arc<Mutex<VecDeque<RunPlan>>>,
    launches: AtomicUsize,
    launch_failures: AtomicUsize,
    closes: Arc<AtomicUsize>,
    concurrent: Arc<AtomicUsize>,
    max_concurrent: Arc<AtomicUsize>,
}

impl MockBackend {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn with_plans(plans: Vec<RunPlan>) -> Arc<Self> {
        let backend = Self::default();
        *backend.plans.lock().unwrap() = plans.into();
        Arc::new(backend)
    }

    fn fail_next_launches(&self, count: usize) {
        self.launch_failures.store(count, Ordering::SeqCst);
    }

    fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    fn max_concurrent(&self) -> usize {
        self.max_concurrent.load(Ordering::SeqCst)
    }
}

struct MockSession {
    plans: Arc<Mutex<VecDeque<RunPlan>>>,
    closes: Arc<AtomicUsize>,
    concurrent: Arc<AtomicUsize>,
    max_concurrent: Arc<AtomicUsize>,
    closed: bool,
}

struct ConcurrencyGuard {
    concurrent: Arc<AtomicUsize>,
}

impl ConcurrencyGuard {
    fn enter(concurrent: &Arc<AtomicUsize>, max: &Arc<AtomicUsize>) -> Self {
        let current = concurrent.fetch_add(1, Ordering::SeqCst) + 1;
        max.fetch_max(current, Ordering::SeqCst);
        Self {
            concurrent: Arc::clone(concurrent),
        }
    }
}

impl Drop for ConcurrencyGuard {
    fn drop(&mut self) {
        self.concurrent.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl SessionBackend for MockBackend {
    async fn launch(&self) -> SessionResult<Box<dyn SessionHandle>> {
        let remaining = self.launch_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.launch_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(SessionError::Launch("chromium exited early".to_string()));
        }
        self.launches.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockSession {
            plans: Arc::clone(&self.plans),
            closes: Arc::clone(&self.closes),
            concurrent: Arc::clone(&self.concurrent),
            max_concurrent: Arc::clone(&self.max_concurrent),
            closed: false,
        }))
    }
}

#[async_trait]
impl SessionHandle for MockSession {
    async fn run(&mut self, spec: &TaskSpec) -> SessionResult<TaskPayload> {
        let plan = self
            .plans
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(RunPlan::Succeed);
        let _guard = ConcurrencyGuard::enter(&self.concurrent, &self.max_concurrent);
        match plan {
            RunPlan::Succeed => {}
            RunPlan::Delay(duration) => sleep(duration).await,
            RunPlan::ActionError => {
                return Err(SessionError::Action {
                    action: "click",
                    message: "element missing".to_string(),
                })
            }
            RunPlan::ProtocolError => {
                return Err(SessionError::Protocol("websocket closed".to_string()))
            }
            RunPlan::Hang => sleep(Duration::from_secs(3600)).await,
        }
        let mut payload = TaskPayload::default();
        payload.final_url = Some(spec.start_url.clone());
        payload.insert("status", serde_json::json!("ok"));
        Ok(payload)
    }

    async fn close(&mut self) -> SessionResult<()> {
        if !self.closed {
            self.closed = true;
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

fn pool_section(max_sessions: usize) -> PoolSection {
    PoolSection {
        max_sessions,
        min_idle: 0,
        idle_ttl_seconds: 300,
        reap_interval_seconds: 60,
        max_session_failures: 3,
        acquire_timeout_ms: 30_000,
    }
}

fn task_section() -> TaskSection {
    TaskSection {
        default_deadline_seconds: 300,
        acquire_safety_margin_ms: 2_000,
    }
}

fn build_executor(backend: &Arc<MockBackend>, max_sessions: usize) -> Arc<TaskExecutor> {
    let pool = Arc::new(SessionPool::new(
        pool_section(max_sessions),
        Arc::clone(backend) as Arc<dyn SessionBackend>,
    ));
    Arc::new(TaskExecutor::new(pool, task_section()))
}

fn task(deadline: Duration) -> Task {
    Task::builder(TaskSpec::new("https://example.com"))
        .deadline_in(deadline)
        .build()
}

#[tokio::test(start_paused = true)]
async fn successful_task_returns_payload() {
    let backend = MockBackend::new();
    let executor = build_executor(&backend, 2);

    let outcome = executor.execute(task(Duration::from_secs(10))).await.unwrap();
    match outcome {
        Outcome::Success(payload) => {
            assert_eq!(payload.final_url.as_deref(), Some("https://example.com"));
            assert_eq!(
                payload.get("status").and_then(|v| v.as_str()),
                Some("ok")
            );
        }
        other => panic!("expected success, got {other:?}"),
    }

    let metrics = executor.metrics();
    assert_eq!(metrics.tasks_executed, 1);
    assert_eq!(metrics.tasks_succeeded, 1);
    assert_eq!(executor.pool().stats().await.idle, 1);
}

#[tokio::test(start_paused = true)]
async fn expired_deadline_short_circuits_without_running() {
    let backend = MockBackend::new();
    let executor = build_executor(&backend, 2);

    let expired = Task::builder(TaskSpec::new("https://example.com"))
        .deadline(Instant::now())
        .build();
    let outcome = executor.execute(expired).await.unwrap();
    assert!(matches!(outcome, Outcome::Timeout));
    assert_eq!(backend.launches(), 0, "no session may be touched");
    assert_eq!(executor.metrics().timeouts, 1);
}

#[tokio::test(start_paused = true)]
async fn burst_of_five_tasks_shares_two_sessions() {
    let backend = MockBackend::with_plans(vec![RunPlan::Delay(Duration::from_secs(3)); 5]);
    let executor = build_executor(&backend, 2);

    let mut handles = Vec::new();
    for _ in 0..5 {
        let executor = Arc::clone(&executor);
        handles.push(tokio::spawn(async move {
            executor.execute(task(Duration::from_secs(10))).await
        }));
    }
    for handle in handles {
        let outcome = handle.await.unwrap().unwrap();
        assert!(matches!(outcome, Outcome::Success(_)));
    }

    assert!(backend.launches() <= 2, "created {} sessions", backend.launches());
    assert_eq!(backend.max_concurrent(), 2);
    assert_eq!(executor.metrics().tasks_succeeded, 5);
}

#[tokio::test(start_paused = true)]
async fn deadline_mid_run_cancels_and_discards_the_session() {
    let backend = MockBackend::with_plans(vec![RunPlan::Hang]);
    let executor = build_executor(&backend, 1);

    let outcome = executor.execute(task(Duration::from_secs(5))).await.unwrap();
    assert!(matches!(outcome, Outcome::Timeout));
    assert_eq!(backend.closes(), 1, "timed-out session must be destroyed");

    let stats = executor.pool().stats().await;
    assert_eq!(stats.busy, 0, "no leaked busy session");
    assert_eq!(stats.live, 0);
}

#[tokio::test(start_paused = true)]
async fn crash_retries_once_on_a_fresh_session() {
    let backend = MockBackend::with_plans(vec![RunPlan::ProtocolError, RunPlan::Succeed]);
    let executor = build_executor(&backend, 2);

    let outcome = executor.execute(task(Duration::from_secs(30))).await.unwrap();
    assert!(matches!(outcome, Outcome::Success(_)));
    assert_eq!(backend.launches(), 2, "retry must use a fresh session");
    assert_eq!(backend.closes(), 1, "crashed session destroyed");

    let metrics = executor.metrics();
    assert_eq!(metrics.internal_retries, 1);
    assert_eq!(metrics.tasks_succeeded, 1);
}

#[tokio::test(start_paused = true)]
async fn second_crash_surfaces_browser_crashed() {
    let backend = MockBackend::with_plans(vec![RunPlan::ProtocolError, RunPlan::ProtocolError]);
    let executor = build_executor(&backend, 2);

    let outcome = executor.execute(task(Duration::from_secs(30))).await.unwrap();
    assert!(matches!(outcome, Outcome::BrowserCrashed { .. }));
    assert_eq!(backend.closes(), 2);
    assert_eq!(executor.metrics().browser_crashes, 1);
    assert_eq!(executor.metrics().internal_retries, 1);
}

#[tokio::test(start_paused = true)]
async fn task_error_keeps_the_session_and_is_not_retried() {
    let backend = MockBackend::with_plans(vec![RunPlan::ActionError, RunPlan::Succeed]);
    let executor = build_executor(&backend, 1);

    let outcome = executor.execute(task(Duration::from_secs(10))).await.unwrap();
    match outcome {
        Outcome::TaskError { message } => assert!(message.contains("element missing")),
        other => panic!("expected task error, got {other:?}"),
    }
    assert_eq!(backend.closes(), 0, "session stays usable after a task error");
    assert_eq!(executor.pool().stats().await.idle, 1);

    // The same session serves the next task.
    let outcome = executor.execute(task(Duration::from_secs(10))).await.unwrap();
    assert!(matches!(outcome, Outcome::Success(_)));
    assert_eq!(backend.launches(), 1);
}

#[tokio::test(start_paused = true)]
async fn launch_failure_is_retried_like_a_crash() {
    let backend = MockBackend::new();
    backend.fail_next_launches(1);
    let executor = build_executor(&backend, 1);

    let outcome = executor.execute(task(Duration::from_secs(30))).await.unwrap();
    assert!(matches!(outcome, Outcome::Success(_)));
    assert_eq!(backend.launches(), 1);
    assert_eq!(executor.metrics().internal_retries, 1);
}

#[tokio::test(start_paused = true)]
async fn exhausted_pool_is_reported_without_retry() {
    let backend = MockBackend::with_plans(vec![RunPlan::Hang]);
    let executor = build_executor(&backend, 1);

    let hogging = {
        let executor = Arc::clone(&executor);
        tokio::spawn(async move { executor.execute(task(Duration::from_secs(120))).await })
    };
    sleep(Duration::from_millis(50)).await;

    let denied = executor.execute(task(Duration::from_secs(6))).await;
    assert!(matches!(denied, Err(ExecutorError::PoolExhausted)));
    let metrics = executor.metrics();
    assert_eq!(metrics.pool_exhaustions, 1);
    assert_eq!(metrics.internal_retries, 0);

    hogging.abort();
}

#[tokio::test(start_paused = true)]
async fn shutdown_lets_the_in_flight_task_finish_and_rejects_new_ones() {
    let backend = MockBackend::with_plans(vec![RunPlan::Delay(Duration::from_secs(3))]);
    let executor = build_executor(&backend, 1);

    let in_flight = {
        let executor = Arc::clone(&executor);
        tokio::spawn(async move { executor.execute(task(Duration::from_secs(30))).await })
    };
    sleep(Duration::from_millis(50)).await;

    let shutdown = {
        let executor = Arc::clone(&executor);
        tokio::spawn(async move { executor.shutdown(Duration::from_secs(30)).await })
    };
    sleep(Duration::from_millis(50)).await;

    let denied = executor.execute(task(Duration::from_secs(10))).await;
    assert!(matches!(denied, Err(ExecutorError::PoolClosed)));
    assert!(
        !shutdown.is_finished(),
        "shutdown must wait for the in-flight task"
    );

    let outcome = in_flight.await.unwrap().unwrap();
    assert!(matches!(outcome, Outcome::Success(_)));
    shutdown.await.unwrap();
    assert_eq!(backend.closes(), 1, "session destroyed at shutdown");
}
