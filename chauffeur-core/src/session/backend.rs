use async_trait::async_trait;

use crate::task::{TaskPayload, TaskSpec};

use super::error::SessionResult;

/// Launches browser sessions for the pool. The production implementation is
/// [`super::ChromiumBackend`]; tests inject mocks.
#[async_trait]
pub trait SessionBackend: Send + Sync {
    async fn launch(&self) -> SessionResult<Box<dyn SessionHandle>>;
}

/// One live browser session. Exclusively owned by whoever holds the box;
/// nothing else may drive the underlying browser concurrently.
#[async_trait]
pub trait SessionHandle: Send {
    /// Run a task's actions in program order and collect the payload.
    async fn run(&mut self, spec: &TaskSpec) -> SessionResult<TaskPayload>;

    /// Tear down the underlying browser. Idempotent; safe on a session
    /// whose process already died.
    async fn close(&mut self) -> SessionResult<()>;
}
