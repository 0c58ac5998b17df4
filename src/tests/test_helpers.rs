//! Shared test doubles: a scripted runner, its factory, and small
//! WebSocket helpers for playing the orchestrator side of the link.

use crate::models::{AgentKind, HostCapabilities, TaskMetadata, TaskRequest};
use crate::runner::{EventSink, RunnerEvent, RunnerFactory, SessionApi, SessionMessage, TaskRunner};
use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{accept_async, tungstenite::Message, WebSocketStream};

/// Scripted runner double: fixed session id, delayed reply, canned events.
pub struct MockRunner {
    pub session_id: Option<String>,
    pub reply: String,
    pub prompt_delay: Duration,
    pub events: Vec<RunnerEvent>,
    pub messages: Vec<SessionMessage>,
    pub providers: Vec<Value>,
    pub aborted: Arc<AtomicBool>,
    pub stopped: Arc<AtomicBool>,
    pub stdin_lines: Arc<std::sync::Mutex<Vec<String>>>,
}

impl MockRunner {
    pub fn base(reply: &str) -> Self {
        Self {
            session_id: Some("sess-1".to_string()),
            reply: reply.to_string(),
            prompt_delay: Duration::from_millis(10),
            events: Vec::new(),
            messages: Vec::new(),
            providers: Vec::new(),
            aborted: Arc::new(AtomicBool::new(false)),
            stopped: Arc::new(AtomicBool::new(false)),
            stdin_lines: Arc::new(std::sync::Mutex::new(Vec::new())),
        }
    }

    pub fn quick(reply: &str) -> Arc<Self> {
        Arc::new(Self::base(reply))
    }

    pub fn slow() -> Arc<Self> {
        Arc::new(Self {
            prompt_delay: Duration::from_secs(30),
            ..Self::base("late")
        })
    }
}

#[async_trait]
impl SessionApi for MockRunner {
    async fn create_session(&self, _title: &str) -> crate::Result<Option<String>> {
        Ok(self.session_id.clone())
    }

    async fn prompt_async(
        &self,
        _session_id: &str,
        _model: Option<(String, String)>,
        _text: &str,
    ) -> crate::Result<()> {
        Ok(())
    }

    async fn list_messages(&self, _session_id: &str) -> crate::Result<Vec<SessionMessage>> {
        Ok(self.messages.clone())
    }

    async fn abort_session(&self, _session_id: &str) -> crate::Result<()> {
        self.aborted.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl TaskRunner for MockRunner {
    fn server_url(&self) -> String {
        "http://127.0.0.1:0".to_string()
    }

    fn is_running(&self) -> bool {
        !self.stopped.load(Ordering::SeqCst)
    }

    async fn prompt(
        &self,
        _session_id: &str,
        _model: Option<(String, String)>,
        _text: &str,
    ) -> crate::Result<String> {
        tokio::time::sleep(self.prompt_delay).await;
        Ok(self.reply.clone())
    }

    async fn subscribe_events(&self) -> crate::Result<BoxStream<'static, RunnerEvent>> {
        Ok(stream::iter(self.events.clone()).boxed())
    }

    async fn list_providers(&self) -> crate::Result<Vec<Value>> {
        Ok(self.providers.clone())
    }

    async fn write_stdin(&self, content: &str) -> bool {
        self.stdin_lines
            .lock()
            .unwrap()
            .push(content.to_string());
        true
    }

    async fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}

pub struct MockFactory {
    pub runner: Arc<MockRunner>,
    pub starts: AtomicUsize,
}

impl MockFactory {
    pub fn new(runner: Arc<MockRunner>) -> Arc<Self> {
        Arc::new(Self {
            runner,
            starts: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl RunnerFactory for MockFactory {
    async fn start(
        &self,
        _cwd: &Path,
        _env: &HashMap<String, String>,
        _sink: Option<EventSink>,
    ) -> crate::Result<Arc<dyn TaskRunner>> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        Ok(self.runner.clone())
    }
}

pub fn capabilities(max_concurrent: usize) -> HostCapabilities {
    HostCapabilities {
        host_name: "test-host".to_string(),
        agents: vec![AgentKind::Opencode],
        max_concurrent,
        cwd: std::env::temp_dir(),
        labels: vec![],
    }
}

pub fn task_request(id: &str, cwd: &Path) -> TaskRequest {
    TaskRequest {
        task_id: id.to_string(),
        prompt: "echo hi".to_string(),
        cwd: cwd.to_path_buf(),
        agent_type: AgentKind::Opencode,
        model: None,
        env: None,
        timeout_ms: None,
        metadata: TaskMetadata::default(),
    }
}

// Orchestrator-side WebSocket helpers.

pub async fn accept_ws(listener: &TcpListener) -> WebSocketStream<TcpStream> {
    let (stream, _) = listener.accept().await.unwrap();
    accept_async(stream).await.unwrap()
}

pub async fn next_json(ws: &mut WebSocketStream<TcpStream>) -> Value {
    loop {
        let message = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for a message")
            .unwrap()
            .unwrap();
        if message.is_text() {
            return serde_json::from_str(message.to_text().unwrap()).unwrap();
        }
    }
}

pub async fn send_json(ws: &mut WebSocketStream<TcpStream>, value: Value) {
    ws.send(Message::Text(value.to_string())).await.unwrap();
}

/// Reads messages until one of the wanted type arrives; heartbeats and
/// interleaved events from other tasks are skipped.
pub async fn next_of_type(ws: &mut WebSocketStream<TcpStream>, wanted: &str) -> Value {
    loop {
        let message = next_json(ws).await;
        if message["type"] == wanted {
            return message;
        }
    }
}
