use crate::memory::MemorySettingsPatch;
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, path::PathBuf, str::FromStr};

/// The closed set of agent runners a gateway can drive.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum AgentKind {
    #[serde(rename = "opencode")]
    Opencode,
    #[serde(rename = "claude-code")]
    ClaudeCode,
    #[serde(rename = "gemini")]
    Gemini,
}

impl FromStr for AgentKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "opencode" => Ok(AgentKind::Opencode),
            "claude-code" => Ok(AgentKind::ClaudeCode),
            "gemini" => Ok(AgentKind::Gemini),
            _ => Err(format!("Unknown agent kind: {s}")),
        }
    }
}

impl std::fmt::Display for AgentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            AgentKind::Opencode => "opencode",
            AgentKind::ClaudeCode => "claude-code",
            AgentKind::Gemini => "gemini",
        };
        write!(f, "{name}")
    }
}

/// Execution capabilities announced to the orchestrator during registration.
/// Immutable for the lifetime of the process.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostCapabilities {
    pub host_name: String,
    pub agents: Vec<AgentKind>,
    pub max_concurrent: usize,
    pub cwd: PathBuf,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub labels: Vec<String>,
}

/// A task pushed down by the orchestrator.
///
/// Tasks are the fundamental unit of work: each one drives a child runner
/// through a full session lifecycle and reports a single terminal result.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRequest {
    pub task_id: String,
    pub prompt: String,
    pub cwd: PathBuf,
    pub agent_type: AgentKind,
    /// `provider/model…` — the first slash splits provider from model id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<HashMap<String, String>>,
    /// Hard deadline from start to terminal event, in milliseconds.
    #[serde(default, rename = "timeout", skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub metadata: TaskMetadata,
}

/// Free-form task metadata; the memory subsystem reads its hints from here.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_settings_snapshot: Option<MemorySettingsPatch>,
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

impl TaskRequest {
    /// Splits `model` into `(provider_id, model_id)` on the first slash.
    pub fn model_ref(&self) -> Option<(String, String)> {
        let raw = self.model.as_deref()?.trim();
        let (provider, model) = raw.split_once('/')?;
        if provider.is_empty() || model.is_empty() {
            return None;
        }
        Some((provider.to_string(), model.to_string()))
    }
}

/// Event taxonomy streamed back toward the orchestrator while a task runs.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AgentEventType {
    Log,
    Thinking,
    ToolCall,
    ToolResult,
    FileChange,
    Message,
    Error,
    Stdout,
    Stderr,
    Output,
}

/// A single streamed event. Timestamps are epoch millis and monotone per task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentEvent {
    #[serde(rename = "type")]
    pub event_type: AgentEventType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    pub timestamp: i64,
}

impl AgentEvent {
    pub fn new(event_type: AgentEventType, content: impl Into<String>) -> Self {
        Self {
            event_type,
            content: Some(content.into()),
            data: None,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn with_data(event_type: AgentEventType, data: serde_json::Value) -> Self {
        Self {
            event_type,
            content: None,
            data: Some(data),
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }
}

/// Terminal outcome of a task execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub files_changed: Option<Vec<String>>,
    /// Short failure reason, e.g. "aborted", "timeout", "capacity exceeded".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Structured failure context, e.g. `{code: "CWD_NOT_ALLOWED", cwd}`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl TaskResult {
    pub fn failure(error: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            success: false,
            exit_code: None,
            output: None,
            duration_ms,
            files_changed: None,
            error: Some(error.into()),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn with_output(mut self, output: impl Into<String>) -> Self {
        self.output = Some(output.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_kind_round_trips_through_str() {
        for kind in [AgentKind::Opencode, AgentKind::ClaudeCode, AgentKind::Gemini] {
            assert_eq!(kind.to_string().parse::<AgentKind>().unwrap(), kind);
        }
        assert!("copilot".parse::<AgentKind>().is_err());
    }

    #[test]
    fn model_ref_splits_on_first_slash() {
        let mut task = task("t1");
        task.model = Some("anthropic/claude-sonnet-4/beta".to_string());
        assert_eq!(
            task.model_ref(),
            Some(("anthropic".to_string(), "claude-sonnet-4/beta".to_string()))
        );

        task.model = Some("no-slash".to_string());
        assert_eq!(task.model_ref(), None);

        task.model = None;
        assert_eq!(task.model_ref(), None);
    }

    #[test]
    fn task_request_deserializes_wire_shape() {
        let raw = serde_json::json!({
            "taskId": "t1",
            "prompt": "echo hi",
            "cwd": "/srv/projects/app",
            "agentType": "opencode",
            "timeout": 30000,
            "metadata": {"projectId": "p1", "custom": 7}
        });
        let task: TaskRequest = serde_json::from_value(raw).unwrap();
        assert_eq!(task.task_id, "t1");
        assert_eq!(task.timeout_ms, Some(30_000));
        assert_eq!(task.metadata.project_id.as_deref(), Some("p1"));
        assert_eq!(task.metadata.extra["custom"], 7);
    }

    fn task(id: &str) -> TaskRequest {
        TaskRequest {
            task_id: id.to_string(),
            prompt: "do things".to_string(),
            cwd: PathBuf::from("/tmp"),
            agent_type: AgentKind::Opencode,
            model: None,
            env: None,
            timeout_ms: None,
            metadata: TaskMetadata::default(),
        }
    }
}
