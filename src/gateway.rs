//! Entry loop: routes inbound orchestrator messages to the executor, the
//! memory manager, or a disposable runner, and forwards task signals back
//! out as protocol messages.
//!
//! Per accepted task the outbound trace is always `task:started`, any
//! number of `task:event`s, then exactly one terminal — the terminal is
//! sent once, after the executor future settles, on the same ordered
//! channel the events travel through.

use crate::connection::Connection;
use crate::executor::{TaskExecutor, TaskSignal};
use crate::memory::MemoryManager;
use crate::models::TaskResult;
use crate::protocol::{GatewayMessage, ServerMessage};
use crate::runner::RunnerFactory;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub struct Gateway {
    connection: Arc<Connection>,
    executor: Arc<TaskExecutor>,
    memory: Arc<MemoryManager>,
    factory: Arc<dyn RunnerFactory>,
    signals_tx: mpsc::UnboundedSender<TaskSignal>,
    gateway_cwd: PathBuf,
}

impl Gateway {
    pub fn new(
        connection: Arc<Connection>,
        executor: Arc<TaskExecutor>,
        memory: Arc<MemoryManager>,
        factory: Arc<dyn RunnerFactory>,
        signals_tx: mpsc::UnboundedSender<TaskSignal>,
        gateway_cwd: PathBuf,
    ) -> Self {
        // Persisted memory items mirror out as `memory:sync` when enabled.
        let sync_connection = connection.clone();
        memory.set_on_sync(Box::new(move |items| {
            let message = GatewayMessage::MemorySync {
                op: "upsert".to_string(),
                items,
            };
            if sync_connection.send(message).is_err() {
                warn!("memory:sync dropped: link is shut down");
            }
        }));

        Self {
            connection,
            executor,
            memory,
            factory,
            signals_tx,
            gateway_cwd,
        }
    }

    /// Pumps both queues until the link closes its inbound channel.
    pub async fn run(
        &self,
        mut inbound: mpsc::UnboundedReceiver<ServerMessage>,
        mut signals: mpsc::UnboundedReceiver<TaskSignal>,
    ) {
        loop {
            tokio::select! {
                message = inbound.recv() => {
                    match message {
                        Some(message) => self.route(message).await,
                        None => break,
                    }
                }
                signal = signals.recv() => {
                    match signal {
                        Some(signal) => self.forward(signal),
                        None => break,
                    }
                }
            }
        }
        info!("entry loop stopped");
    }

    async fn route(&self, message: ServerMessage) {
        match message {
            ServerMessage::TaskExecute { task } => {
                let task_id = task.task_id.clone();
                debug!(task_id = %task_id, "task:execute received");
                let executor = self.executor.clone();
                let signals = self.signals_tx.clone();
                tokio::spawn(async move {
                    let _ = signals.send(TaskSignal::Started {
                        task_id: task_id.clone(),
                    });
                    let result = executor.execute(task).await;
                    let _ = signals.send(TaskSignal::Terminal { task_id, result });
                });
            }
            ServerMessage::TaskAbort { task_id } => {
                if !self.executor.abort(&task_id).await {
                    debug!(task_id = %task_id, "abort for unknown task");
                }
            }
            ServerMessage::TaskInput { task_id, content } => {
                if !self.executor.send_input(&task_id, &content).await {
                    debug!(task_id = %task_id, "input dropped: no such task or unsupported");
                }
            }
            ServerMessage::ModelsRequest { request_id } => {
                let factory = self.factory.clone();
                let connection = self.connection.clone();
                let cwd = self.gateway_cwd.clone();
                tokio::spawn(async move {
                    let providers = discover_providers(factory.as_ref(), &cwd).await;
                    let _ = connection.send(GatewayMessage::ModelsResponse {
                        request_id,
                        providers,
                    });
                });
            }
            ServerMessage::MemoryRequest {
                request_id,
                action,
                payload,
            } => {
                let response = match self.memory.handle_request(&action, &payload).await {
                    Ok(data) => GatewayMessage::MemoryResponse {
                        request_id,
                        ok: true,
                        data: Some(data),
                        error: None,
                    },
                    Err(e) => GatewayMessage::MemoryResponse {
                        request_id,
                        ok: false,
                        data: None,
                        error: Some(e.to_string()),
                    },
                };
                let _ = self.connection.send(response);
            }
            // Registration and pings are handled inside the link.
            ServerMessage::Registered { .. } | ServerMessage::Ping {} => {}
        }
    }

    fn forward(&self, signal: TaskSignal) {
        let message = match signal {
            TaskSignal::Started { task_id } => GatewayMessage::TaskStarted { task_id },
            TaskSignal::Event { task_id, event } => GatewayMessage::TaskEvent { task_id, event },
            TaskSignal::Terminal { task_id, result } => terminal_message(task_id, result),
        };
        if self.connection.send(message).is_err() {
            warn!("outbound message dropped: link is shut down");
        }
    }
}

fn terminal_message(task_id: String, result: TaskResult) -> GatewayMessage {
    if result.success {
        GatewayMessage::TaskCompleted { task_id, result }
    } else {
        GatewayMessage::TaskFailed {
            task_id,
            error: result
                .error
                .clone()
                .unwrap_or_else(|| "task failed".to_string()),
            details: result.details.clone(),
            result: Some(result),
        }
    }
}

/// Provider discovery runs on a disposable runner started in the gateway
/// cwd; any failure collapses to an empty list.
async fn discover_providers(
    factory: &dyn RunnerFactory,
    cwd: &std::path::Path,
) -> Vec<serde_json::Value> {
    match factory.start(cwd, &HashMap::new(), None).await {
        Ok(runner) => {
            let providers = runner.list_providers().await.unwrap_or_else(|e| {
                warn!("provider discovery failed: {e}");
                Vec::new()
            });
            runner.stop().await;
            providers
        }
        Err(e) => {
            warn!("provider discovery runner failed to start: {e}");
            Vec::new()
        }
    }
}
