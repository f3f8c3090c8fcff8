use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use uuid::Uuid;

/// One unit of work: a start URL plus the ordered actions to perform on a
/// session. Serializable so callers can ship specs over the wire or load
/// them from files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    pub start_url: String,
    #[serde(default)]
    pub actions: Vec<Action>,
}

impl TaskSpec {
    pub fn new(start_url: impl Into<String>) -> Self {
        Self {
            start_url: start_url.into(),
            actions: Vec::new(),
        }
    }

    pub fn with_actions(mut self, actions: Vec<Action>) -> Self {
        self.actions = actions;
        self
    }
}

/// Navigation and extraction steps understood by a browser session.
///
/// Selector-driven steps take a fallback list tried in order; the first
/// match wins. Extraction steps write their result into the named payload
/// slot.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    Goto {
        url: String,
    },
    WaitForSelector {
        selectors: Vec<String>,
        #[serde(default)]
        timeout_ms: Option<u64>,
    },
    Fill {
        selectors: Vec<String>,
        value: String,
    },
    Click {
        selectors: Vec<String>,
    },
    PressKey {
        key: String,
    },
    Sleep {
        ms: u64,
    },
    WaitForUrl {
        contains: String,
        #[serde(default)]
        timeout_ms: Option<u64>,
    },
    ExtractText {
        selector: String,
        into: String,
    },
    ExtractAttribute {
        selector: String,
        attribute: String,
        into: String,
    },
    ExtractUrlParam {
        param: String,
        into: String,
    },
    Evaluate {
        script: String,
        #[serde(default)]
        into: Option<String>,
    },
    Screenshot {
        into: String,
    },
}

impl Action {
    pub fn label(&self) -> &'static str {
        match self {
            Action::Goto { .. } => "goto",
            Action::WaitForSelector { .. } => "wait_for_selector",
            Action::Fill { .. } => "fill",
            Action::Click { .. } => "click",
            Action::PressKey { .. } => "press_key",
            Action::Sleep { .. } => "sleep",
            Action::WaitForUrl { .. } => "wait_for_url",
            Action::ExtractText { .. } => "extract_text",
            Action::ExtractAttribute { .. } => "extract_attribute",
            Action::ExtractUrlParam { .. } => "extract_url_param",
            Action::Evaluate { .. } => "evaluate",
            Action::Screenshot { .. } => "screenshot",
        }
    }
}

/// What a successful task hands back to the caller.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskPayload {
    pub final_url: Option<String>,
    pub values: BTreeMap<String, serde_json::Value>,
}

impl TaskPayload {
    pub fn insert(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.values.insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.values.get(key)
    }
}

/// A submitted task. Immutable once built; the deadline is absolute so it
/// survives queueing delays without silently stretching.
#[derive(Debug, Clone)]
pub struct Task {
    id: Uuid,
    spec: TaskSpec,
    deadline: Instant,
    priority: i64,
}

impl Task {
    pub fn builder(spec: TaskSpec) -> TaskBuilder {
        TaskBuilder {
            id: None,
            spec,
            deadline: None,
            deadline_in: None,
            priority: 0,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn spec(&self) -> &TaskSpec {
        &self.spec
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn priority(&self) -> i64 {
        self.priority
    }

    /// Time left before the deadline, zero if it already passed.
    pub fn remaining(&self, now: Instant) -> Duration {
        self.deadline.saturating_duration_since(now)
    }
}

#[derive(Debug)]
pub struct TaskBuilder {
    id: Option<Uuid>,
    spec: TaskSpec,
    deadline: Option<Instant>,
    deadline_in: Option<Duration>,
    priority: i64,
}

impl TaskBuilder {
    pub fn id(mut self, id: Uuid) -> Self {
        self.id = Some(id);
        self
    }

    pub fn deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn deadline_in(mut self, remaining: Duration) -> Self {
        self.deadline_in = Some(remaining);
        self
    }

    pub fn priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn build(self) -> Task {
        let deadline = self.deadline.unwrap_or_else(|| {
            Instant::now() + self.deadline_in.unwrap_or(Duration::from_secs(300))
        });
        Task {
            id: self.id.unwrap_or_else(Uuid::new_v4),
            spec: self.spec,
            deadline,
            priority: self.priority,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_generates_id_and_deadline() {
        let task = Task::builder(TaskSpec::new("https://example.com"))
            .deadline_in(Duration::from_secs(10))
            .build();
        assert_eq!(task.priority(), 0);
        assert!(task.remaining(Instant::now()) <= Duration::from_secs(10));
    }

    #[test]
    fn action_specs_round_trip_as_json() {
        let spec = TaskSpec::new("https://example.com/login").with_actions(vec![
            Action::Fill {
                selectors: vec!["input[type=email]".into(), "#email".into()],
                value: "user@example.com".into(),
            },
            Action::PressKey {
                key: "Enter".into(),
            },
            Action::WaitForUrl {
                contains: "/callback".into(),
                timeout_ms: Some(30_000),
            },
            Action::ExtractUrlParam {
                param: "code".into(),
                into: "auth_code".into(),
            },
        ]);
        let json = serde_json::to_string(&spec).unwrap();
        let parsed: TaskSpec = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.actions.len(), 4);
        assert_eq!(parsed.actions[1].label(), "press_key");
    }

    #[test]
    fn payload_slots_are_named() {
        let mut payload = TaskPayload::default();
        payload.insert("title", serde_json::json!("Example Domain"));
        assert_eq!(
            payload.get("title").and_then(|v| v.as_str()),
            Some("Example Domain")
        );
        assert!(payload.get("missing").is_none());
    }
}
