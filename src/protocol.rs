//! Wire protocol spoken over the orchestrator channel.
//!
//! Every message is a JSON object with a top-level `type` discriminator.
//! Unknown inbound types are ignored by the entry loop; malformed JSON is
//! dropped at the link.

use crate::memory::MemoryItem;
use crate::models::{AgentEvent, HostCapabilities, TaskRequest, TaskResult};
use serde::{Deserialize, Serialize};

/// Messages the gateway sends to the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum GatewayMessage {
    #[serde(rename = "register", rename_all = "camelCase")]
    Register {
        host_id: String,
        token: String,
        capabilities: HostCapabilities,
    },
    #[serde(rename = "heartbeat")]
    Heartbeat { timestamp: i64 },
    #[serde(rename = "task:started", rename_all = "camelCase")]
    TaskStarted { task_id: String },
    #[serde(rename = "task:event", rename_all = "camelCase")]
    TaskEvent { task_id: String, event: AgentEvent },
    #[serde(rename = "task:completed", rename_all = "camelCase")]
    TaskCompleted { task_id: String, result: TaskResult },
    #[serde(rename = "task:failed", rename_all = "camelCase")]
    TaskFailed {
        task_id: String,
        error: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        details: Option<serde_json::Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<TaskResult>,
    },
    #[serde(rename = "models:response", rename_all = "camelCase")]
    ModelsResponse {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        providers: Vec<serde_json::Value>,
    },
    #[serde(rename = "memory:response", rename_all = "camelCase")]
    MemoryResponse {
        request_id: String,
        ok: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<serde_json::Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    #[serde(rename = "memory:sync")]
    MemorySync { op: String, items: Vec<MemoryItem> },
}

/// Messages the orchestrator sends to the gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "registered")]
    Registered {
        ok: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    #[serde(rename = "ping")]
    Ping {},
    #[serde(rename = "task:execute")]
    TaskExecute {
        #[serde(flatten)]
        task: TaskRequest,
    },
    #[serde(rename = "task:abort", rename_all = "camelCase")]
    TaskAbort { task_id: String },
    #[serde(rename = "task:input", rename_all = "camelCase")]
    TaskInput { task_id: String, content: String },
    #[serde(rename = "models:request", rename_all = "camelCase")]
    ModelsRequest {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },
    #[serde(rename = "memory:request", rename_all = "camelCase")]
    MemoryRequest {
        request_id: String,
        action: String,
        #[serde(default)]
        payload: serde_json::Value,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AgentEventType, AgentKind};

    #[test]
    fn register_serializes_with_type_tag() {
        let msg = GatewayMessage::Register {
            host_id: "host-dev".to_string(),
            token: "dev-token".to_string(),
            capabilities: HostCapabilities {
                host_name: "dev".to_string(),
                agents: vec![AgentKind::Opencode],
                max_concurrent: 2,
                cwd: "/srv".into(),
                labels: vec![],
            },
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "register");
        assert_eq!(value["hostId"], "host-dev");
        assert_eq!(value["capabilities"]["maxConcurrent"], 2);
    }

    #[test]
    fn task_execute_flattens_request_fields() {
        let raw = serde_json::json!({
            "type": "task:execute",
            "taskId": "t1",
            "prompt": "echo hi",
            "cwd": "/srv/app",
            "agentType": "opencode"
        });
        match serde_json::from_value::<ServerMessage>(raw).unwrap() {
            ServerMessage::TaskExecute { task } => {
                assert_eq!(task.task_id, "t1");
                assert_eq!(task.prompt, "echo hi");
            }
            other => panic!("expected task:execute, got {other:?}"),
        }
    }

    #[test]
    fn task_event_round_trips() {
        let msg = GatewayMessage::TaskEvent {
            task_id: "t9".to_string(),
            event: AgentEvent::new(AgentEventType::Message, "hi"),
        };
        let text = serde_json::to_string(&msg).unwrap();
        let back: GatewayMessage = serde_json::from_str(&text).unwrap();
        match back {
            GatewayMessage::TaskEvent { task_id, event } => {
                assert_eq!(task_id, "t9");
                assert_eq!(event.event_type, AgentEventType::Message);
                assert_eq!(event.content.as_deref(), Some("hi"));
            }
            other => panic!("expected task:event, got {other:?}"),
        }
    }

    #[test]
    fn unknown_server_type_fails_to_parse() {
        let raw = serde_json::json!({"type": "mystery"});
        assert!(serde_json::from_value::<ServerMessage>(raw).is_err());
    }
}
