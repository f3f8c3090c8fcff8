use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use clap::Args;
use serde::Serialize;

use chauffeur_core::{
    Action, ChromiumBackend, Outcome, SessionPool, Task, TaskExecutor, TaskSpec,
};

use crate::{AppContext, AppError, DisplayFallback, Result};

/// Run one task end to end on a locally launched pool.
#[derive(Args, Debug, Clone)]
pub struct ExecArgs {
    /// Target URL opened before any actions run
    #[arg(short, long)]
    pub url: Option<String>,

    /// JSON file holding a full task spec (takes precedence over --url)
    #[arg(long)]
    pub task_file: Option<PathBuf>,

    /// Hard deadline in seconds (defaults to the configured task deadline)
    #[arg(long)]
    pub deadline_seconds: Option<u64>,

    /// CSS selector whose text lands in the payload slot "text"
    #[arg(long)]
    pub extract: Option<String>,
}

pub async fn run(context: &AppContext, args: &ExecArgs) -> Result<ExecReport> {
    let spec = load_spec(args)?;

    let backend = ChromiumBackend::new(context.browser.clone())?;
    let pool = Arc::new(SessionPool::new(
        context.service.pool.clone(),
        Arc::new(backend),
    ));
    pool.start();
    let executor = TaskExecutor::new(Arc::clone(&pool), context.service.task.clone());

    let deadline = args
        .deadline_seconds
        .map(Duration::from_secs)
        .unwrap_or_else(|| context.service.task.default_deadline());
    let task = Task::builder(spec).deadline_in(deadline).build();
    let task_id = task.id();

    let started = std::time::Instant::now();
    let result = executor.execute(task).await;
    let duration_ms = started.elapsed().as_millis() as u64;
    executor
        .shutdown(context.service.service.shutdown_grace())
        .await;

    let report = match result {
        Ok(outcome) => ExecReport {
            task_id: task_id.to_string(),
            status: outcome_label(&outcome).to_string(),
            outcome: Some(outcome),
            error: None,
            duration_ms,
            generated_at: Utc::now(),
        },
        Err(err) => ExecReport {
            task_id: task_id.to_string(),
            status: "rejected".to_string(),
            outcome: None,
            error: Some(err.to_string()),
            duration_ms,
            generated_at: Utc::now(),
        },
    };
    Ok(report)
}

fn load_spec(args: &ExecArgs) -> Result<TaskSpec> {
    if let Some(path) = &args.task_file {
        let content = std::fs::read_to_string(path)?;
        return serde_json::from_str(&content)
            .map_err(|err| AppError::InvalidTask(format!("{}: {err}", path.display())));
    }
    let url = args
        .url
        .as_ref()
        .ok_or_else(|| AppError::InvalidTask("provide --url or --task-file".to_string()))?;
    let mut spec = TaskSpec::new(url.clone());
    if let Some(selector) = &args.extract {
        spec.actions.push(Action::ExtractText {
            selector: selector.clone(),
            into: "text".to_string(),
        });
    }
    Ok(spec)
}

fn outcome_label(outcome: &Outcome) -> &'static str {
    match outcome {
        Outcome::Success(_) => "success",
        Outcome::Timeout => "timeout",
        Outcome::BrowserCrashed { .. } => "browser_crashed",
        Outcome::TaskError { .. } => "task_error",
    }
}

#[derive(Debug, Serialize)]
pub struct ExecReport {
    pub task_id: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<Outcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
    pub generated_at: DateTime<Utc>,
}

impl DisplayFallback for ExecReport {
    fn display(&self) -> String {
        let mut lines = vec![
            format!("task: {}", self.task_id),
            format!("status: {} ({} ms)", self.status, self.duration_ms),
        ];
        match &self.outcome {
            Some(Outcome::Success(payload)) => {
                if let Some(final_url) = &payload.final_url {
                    lines.push(format!("final url: {final_url}"));
                }
                for (key, value) in &payload.values {
                    lines.push(format!("  {key}: {value}"));
                }
            }
            Some(Outcome::BrowserCrashed { message }) => {
                lines.push(format!("browser crashed: {message}"));
            }
            Some(Outcome::TaskError { message }) => {
                lines.push(format!("task error: {message}"));
            }
            Some(Outcome::Timeout) | None => {}
        }
        if let Some(error) = &self.error {
            lines.push(format!("error: {error}"));
        }
        lines.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn load_spec_requires_a_target() {
        let args = ExecArgs {
            url: None,
            task_file: None,
            deadline_seconds: None,
            extract: None,
        };
        assert!(matches!(load_spec(&args), Err(AppError::InvalidTask(_))));
    }

    #[test]
    fn load_spec_builds_extract_action_from_flags() {
        let args = ExecArgs {
            url: Some("https://example.com".to_string()),
            task_file: None,
            deadline_seconds: None,
            extract: Some("h1".to_string()),
        };
        let spec = load_spec(&args).unwrap();
        assert_eq!(spec.start_url, "https://example.com");
        assert_eq!(spec.actions.len(), 1);
        assert!(matches!(spec.actions[0], Action::ExtractText { .. }));
    }

    #[test]
    fn load_spec_reads_task_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"start_url": "https://example.com/login", "actions": [
                {{"type": "fill", "selectors": ["input[type=email]"], "value": "user@example.com"}},
                {{"type": "press_key", "key": "Enter"}}
            ]}}"#
        )
        .unwrap();
        let args = ExecArgs {
            url: None,
            task_file: Some(file.path().to_path_buf()),
            deadline_seconds: None,
            extract: None,
        };
        let spec = load_spec(&args).unwrap();
        assert_eq!(spec.actions.len(), 2);
    }
}
