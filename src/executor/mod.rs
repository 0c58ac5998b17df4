//! Per-task lifecycle supervision.
//!
//! Each accepted task runs as one cancellable flow: admission checks, child
//! runner acquisition, prompt augmentation, session dispatch, event
//! streaming, and teardown. The executor never returns an `Err` from
//! `execute` — every failure collapses into a `TaskResult` so the entry
//! loop always has exactly one terminal to emit.

use crate::constants::{TASK_OUTPUT_BUFFER_CAP, TASK_RESULT_OUTPUT_CAP};
use crate::memory::{MemoryManager, PostRunContext};
use crate::models::{AgentEvent, AgentEventType, HostCapabilities, TaskRequest, TaskResult};
use crate::runner::{RunnerEvent, RunnerFactory, SessionApi, TaskRunner};
use serde_json::json;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};


/// Signals flowing from task execution toward the entry loop. The entry
/// loop itself contributes `Started` and `Terminal` so that the per-task
/// trace stays ordered on a single channel.
#[derive(Debug)]
pub enum TaskSignal {
    Started { task_id: String },
    Event { task_id: String, event: AgentEvent },
    Terminal { task_id: String, result: TaskResult },
}

struct ActiveTask {
    cancel: CancellationToken,
    runner: std::sync::Mutex<Option<Arc<dyn TaskRunner>>>,
}

impl ActiveTask {
    fn new() -> Self {
        Self {
            cancel: CancellationToken::new(),
            runner: std::sync::Mutex::new(None),
        }
    }

    fn set_runner(&self, runner: Arc<dyn TaskRunner>) {
        *self.runner.lock().unwrap_or_else(|e| e.into_inner()) = Some(runner);
    }

    fn runner(&self) -> Option<Arc<dyn TaskRunner>> {
        self.runner.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

/// Drives the lifecycle of every accepted task, bounded by
/// `capabilities.max_concurrent`.
pub struct TaskExecutor {
    capabilities: HostCapabilities,
    allowed_roots: Vec<PathBuf>,
    factory: Arc<dyn RunnerFactory>,
    memory: Arc<MemoryManager>,
    signals: mpsc::UnboundedSender<TaskSignal>,
    active: Arc<RwLock<HashMap<String, Arc<ActiveTask>>>>,
    started_at: Instant,
}

enum Outcome {
    Finished(crate::Result<String>),
    Aborted,
    TimedOut,
}

impl TaskExecutor {
    pub fn new(
        capabilities: HostCapabilities,
        allowed_roots: Vec<PathBuf>,
        factory: Arc<dyn RunnerFactory>,
        memory: Arc<MemoryManager>,
        signals: mpsc::UnboundedSender<TaskSignal>,
    ) -> Self {
        Self {
            capabilities,
            allowed_roots,
            factory,
            memory,
            signals,
            active: Arc::new(RwLock::new(HashMap::new())),
            started_at: Instant::now(),
        }
    }

    pub async fn active_task_ids(&self) -> Vec<String> {
        self.active.read().await.keys().cloned().collect()
    }

    pub async fn active_task_count(&self) -> usize {
        self.active.read().await.len()
    }

    pub fn uptime(&self) -> std::time::Duration {
        self.started_at.elapsed()
    }

    /// Runs a task to its terminal result. Capacity and duplicate-id
    /// admission happen before any child is spawned.
    pub async fn execute(&self, task: TaskRequest) -> TaskResult {
        let start = Instant::now();
        let record = {
            let mut active = self.active.write().await;
            if active.len() >= self.capabilities.max_concurrent {
                warn!(task_id = %task.task_id, "rejecting task: capacity exceeded");
                return TaskResult::failure("capacity exceeded", elapsed_ms(start));
            }
            if active.contains_key(&task.task_id) {
                return TaskResult::failure("task already active", elapsed_ms(start));
            }
            let record = Arc::new(ActiveTask::new());
            active.insert(task.task_id.clone(), record.clone());
            record
        };

        let result = self.run_task(&task, &record, start).await;

        if let Some(runner) = record.runner() {
            runner.stop().await;
        }
        self.active.write().await.remove(&task.task_id);
        info!(
            task_id = %task.task_id,
            success = result.success,
            duration_ms = result.duration_ms,
            "task finished"
        );
        result
    }

    async fn run_task(
        &self,
        task: &TaskRequest,
        record: &Arc<ActiveTask>,
        start: Instant,
    ) -> TaskResult {
        let task_id = task.task_id.clone();

        // Admission: the working directory must live under an allowed root.
        if !self.allowed_roots.is_empty() && !cwd_allowed(&task.cwd, &self.allowed_roots) {
            let reason = "cwd outside allowed project roots";
            self.emit(&task_id, AgentEvent::new(AgentEventType::Error, reason));
            return TaskResult::failure(reason, elapsed_ms(start))
                .with_output(reason)
                .with_details(json!({
                    "code": "CWD_NOT_ALLOWED",
                    "cwd": task.cwd,
                }));
        }

        // Child acquisition. Runner stdout/stderr flows back as task events
        // and into the cumulative output buffer.
        let buffer = Arc::new(std::sync::Mutex::new(String::new()));
        let (sink_tx, mut sink_rx) = mpsc::unbounded_channel::<AgentEvent>();
        {
            let signals = self.signals.clone();
            let task_id = task_id.clone();
            let buffer = buffer.clone();
            tokio::spawn(async move {
                while let Some(event) = sink_rx.recv().await {
                    if let Some(content) = &event.content {
                        append_bounded(&buffer, content);
                    }
                    let _ = signals.send(TaskSignal::Event {
                        task_id: task_id.clone(),
                        event,
                    });
                }
            });
        }

        let env = task.env.clone().unwrap_or_default();
        let runner = match self.factory.start(&task.cwd, &env, Some(sink_tx)).await {
            Ok(runner) => runner,
            Err(e) => {
                let message = e.to_string();
                self.emit(&task_id, AgentEvent::new(AgentEventType::Error, message.clone()));
                return TaskResult::failure(message, elapsed_ms(start));
            }
        };
        record.set_runner(runner.clone());

        // Prompt augmentation replaces the original prompt for the run.
        let prepared = self.memory.prepare_prompt(task, &task.prompt).await;
        if prepared.injected_count > 0 {
            self.emit(
                &task_id,
                AgentEvent::new(
                    AgentEventType::Log,
                    format!(
                        "Injected {} memory items (~{} tokens)",
                        prepared.injected_count, prepared.estimated_tokens
                    ),
                ),
            );
        }

        let title = task
            .metadata
            .task_title
            .clone()
            .unwrap_or_else(|| format!("task {task_id}"));
        let session_id = match runner.create_session(&title).await {
            Ok(Some(id)) => id,
            Ok(None) => {
                self.emit(
                    &task_id,
                    AgentEvent::new(AgentEventType::Error, "Failed to create session"),
                );
                return TaskResult::failure("Failed to create session", elapsed_ms(start))
                    .with_output("Failed to create session");
            }
            Err(e) => {
                let message = e.to_string();
                self.emit(&task_id, AgentEvent::new(AgentEventType::Error, message.clone()));
                return TaskResult::failure(message, elapsed_ms(start));
            }
        };

        // Event stream: translated into the gateway taxonomy concurrently
        // with the prompt call.
        let files_changed = Arc::new(std::sync::Mutex::new(Vec::<String>::new()));
        let stream_task = match runner.subscribe_events().await {
            Ok(stream) => Some(self.spawn_stream_translator(
                stream,
                task_id.clone(),
                session_id.clone(),
                buffer.clone(),
                files_changed.clone(),
            )),
            Err(e) => {
                debug!(task_id = %task_id, "event stream unavailable: {e}");
                None
            }
        };

        let timeout = task.timeout_ms.map(std::time::Duration::from_millis);
        let deadline = async move {
            match timeout {
                Some(duration) => tokio::time::sleep(duration).await,
                None => futures::future::pending::<()>().await,
            }
        };

        let prompt_fut = runner.prompt(&session_id, task.model_ref(), &prepared.prompt);
        tokio::pin!(prompt_fut);
        let outcome = tokio::select! {
            _ = record.cancel.cancelled() => Outcome::Aborted,
            _ = deadline => Outcome::TimedOut,
            result = &mut prompt_fut => Outcome::Finished(result),
        };
        if let Some(mut handle) = stream_task {
            // On clean completion let the translator drain what the child
            // already emitted; on abort or timeout cut it immediately.
            let grace = std::time::Duration::from_millis(150);
            if !matches!(outcome, Outcome::Finished(_))
                || tokio::time::timeout(grace, &mut handle).await.is_err()
            {
                handle.abort();
            }
        }

        let result = match outcome {
            Outcome::Finished(Ok(reply)) => {
                if !reply.is_empty() {
                    append_bounded(&buffer, &reply);
                }
                TaskResult {
                    success: true,
                    exit_code: Some(0),
                    output: Some(truncate_output(&buffer)),
                    duration_ms: elapsed_ms(start),
                    files_changed: take_files(&files_changed),
                    error: None,
                    details: None,
                }
            }
            Outcome::Finished(Err(e)) => {
                let message = e.to_string();
                self.emit(&task_id, AgentEvent::new(AgentEventType::Error, message.clone()));
                TaskResult::failure(message, elapsed_ms(start))
                    .with_output(truncate_output(&buffer))
            }
            Outcome::Aborted => {
                if let Err(e) = runner.abort_session(&session_id).await {
                    debug!(task_id = %task_id, "session abort failed: {e}");
                }
                self.emit(&task_id, AgentEvent::new(AgentEventType::Log, "Task aborted"));
                TaskResult::failure("aborted", elapsed_ms(start))
                    .with_output(truncate_output(&buffer))
            }
            Outcome::TimedOut => {
                self.emit(&task_id, AgentEvent::new(AgentEventType::Error, "Task timed out"));
                if let Err(e) = runner.abort_session(&session_id).await {
                    debug!(task_id = %task_id, "session abort failed: {e}");
                }
                TaskResult::failure("timeout", elapsed_ms(start))
                    .with_output(truncate_output(&buffer))
            }
        };

        // Post-run persist never fails the task.
        let output = buffer.lock().unwrap_or_else(|e| e.into_inner()).clone();
        let persist = self
            .memory
            .post_run_persist(PostRunContext {
                task_id: &task_id,
                project_id: task.metadata.project_id.as_deref(),
                project_cwd: Some(task.cwd.as_path()),
                title: task.metadata.task_title.as_deref().unwrap_or_default(),
                description: task.metadata.task_description.as_deref().unwrap_or_default(),
                prompt: &prepared.prompt,
                output: &output,
                settings_snapshot: task.metadata.memory_settings_snapshot.as_ref(),
                session_api: Some(runner.as_ref() as &dyn SessionApi),
            })
            .await;
        if let Err(e) = persist {
            warn!(task_id = %task_id, "post-run memory persist failed: {e}");
        }

        result
    }

    fn spawn_stream_translator(
        &self,
        mut stream: futures::stream::BoxStream<'static, RunnerEvent>,
        task_id: String,
        session_id: String,
        buffer: Arc<std::sync::Mutex<String>>,
        files_changed: Arc<std::sync::Mutex<Vec<String>>>,
    ) -> tokio::task::JoinHandle<()> {
        let signals = self.signals.clone();
        tokio::spawn(async move {
            use futures::StreamExt;
            while let Some(raw) = stream.next().await {
                let Some(event) = translate_runner_event(&raw, &session_id) else {
                    continue;
                };
                if event.event_type == AgentEventType::Message {
                    if let Some(content) = &event.content {
                        append_bounded(&buffer, content);
                    }
                }
                if event.event_type == AgentEventType::FileChange {
                    if let Some(file) = &event.content {
                        let mut files = files_changed.lock().unwrap_or_else(|e| e.into_inner());
                        if !files.contains(file) {
                            files.push(file.clone());
                        }
                    }
                }
                let _ = signals.send(TaskSignal::Event {
                    task_id: task_id.clone(),
                    event,
                });
            }
        })
    }

    fn emit(&self, task_id: &str, event: AgentEvent) {
        let _ = self.signals.send(TaskSignal::Event {
            task_id: task_id.to_string(),
            event,
        });
    }

    /// Cancels a task's flow. Returns false when the id is not active.
    pub async fn abort(&self, task_id: &str) -> bool {
        match self.active.read().await.get(task_id) {
            Some(record) => {
                record.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Forwards input to the task's child stdin when supported.
    pub async fn send_input(&self, task_id: &str, content: &str) -> bool {
        let runner = self
            .active
            .read()
            .await
            .get(task_id)
            .and_then(|record| record.runner());
        match runner {
            Some(runner) => runner.write_stdin(content).await,
            None => false,
        }
    }

    /// Aborts every active task and stops the children that are still up.
    pub async fn shutdown(&self) {
        let records: Vec<Arc<ActiveTask>> = self.active.read().await.values().cloned().collect();
        for record in &records {
            record.cancel.cancel();
        }
        // Give in-flight teardowns a moment, then stop stragglers directly.
        for _ in 0..20 {
            if self.active.read().await.is_empty() {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        }
        for record in records {
            if let Some(runner) = record.runner() {
                runner.stop().await;
            }
        }
    }
}

fn elapsed_ms(start: Instant) -> u64 {
    start.elapsed().as_millis() as u64
}

/// Prefix-safe containment: both sides canonicalized, compared by path
/// components. A cwd that cannot be canonicalized is rejected.
fn cwd_allowed(cwd: &Path, roots: &[PathBuf]) -> bool {
    let Ok(cwd) = cwd.canonicalize() else {
        return false;
    };
    roots.iter().any(|root| {
        let root = root.canonicalize().unwrap_or_else(|_| root.clone());
        cwd.starts_with(&root)
    })
}

fn append_bounded(buffer: &Arc<std::sync::Mutex<String>>, content: &str) {
    let mut buffer = buffer.lock().unwrap_or_else(|e| e.into_inner());
    buffer.push_str(content);
    if !content.ends_with('\n') {
        buffer.push('\n');
    }
    if buffer.len() > TASK_OUTPUT_BUFFER_CAP {
        let keep = buffer.len() - TASK_OUTPUT_BUFFER_CAP / 2;
        let cut = buffer
            .char_indices()
            .map(|(i, _)| i)
            .find(|i| *i >= keep)
            .unwrap_or(0);
        let tail = buffer[cut..].to_string();
        *buffer = format!("[…output truncated…]\n{tail}");
    }
}

fn truncate_output(buffer: &Arc<std::sync::Mutex<String>>) -> String {
    let buffer = buffer.lock().unwrap_or_else(|e| e.into_inner());
    if buffer.len() <= TASK_RESULT_OUTPUT_CAP {
        return buffer.clone();
    }
    let start = buffer.len() - TASK_RESULT_OUTPUT_CAP;
    let cut = buffer
        .char_indices()
        .map(|(i, _)| i)
        .find(|i| *i >= start)
        .unwrap_or(0);
    format!("[…output truncated…]\n{}", &buffer[cut..])
}

fn take_files(files: &Arc<std::sync::Mutex<Vec<String>>>) -> Option<Vec<String>> {
    let files = files.lock().unwrap_or_else(|e| e.into_inner());
    (!files.is_empty()).then(|| files.clone())
}

/// Maps a child runner event onto the gateway taxonomy. Events carrying a
/// different session id are dropped.
fn translate_runner_event(event: &RunnerEvent, session_id: &str) -> Option<AgentEvent> {
    let props = &event.properties;
    let event_session = props
        .get("sessionID")
        .or_else(|| props.pointer("/part/sessionID"))
        .and_then(|s| s.as_str());
    if let Some(sid) = event_session {
        if sid != session_id {
            return None;
        }
    }

    match event.event_type.as_str() {
        "message.part.updated" => {
            let part = props.get("part")?;
            match part.get("type").and_then(|t| t.as_str())? {
                "text" => {
                    let text = part.get("text").and_then(|t| t.as_str())?;
                    Some(AgentEvent::new(AgentEventType::Message, text))
                }
                "reasoning" => {
                    let text = part.get("text").and_then(|t| t.as_str())?;
                    Some(AgentEvent::new(AgentEventType::Thinking, text))
                }
                "tool" => {
                    let status = part
                        .pointer("/state/status")
                        .and_then(|s| s.as_str())
                        .unwrap_or_default();
                    let event_type = if matches!(status, "completed" | "error") {
                        AgentEventType::ToolResult
                    } else {
                        AgentEventType::ToolCall
                    };
                    Some(AgentEvent::with_data(event_type, part.clone()))
                }
                _ => None,
            }
        }
        "file.edited" => {
            let file = props.get("file").and_then(|f| f.as_str())?;
            Some(AgentEvent::new(AgentEventType::FileChange, file))
        }
        "session.error" => {
            let message = props
                .get("error")
                .map(|e| e.to_string())
                .unwrap_or_else(|| "runner session error".to_string());
            Some(AgentEvent::new(AgentEventType::Error, message))
        }
        _ => None,
    }
}
