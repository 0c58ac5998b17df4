//! Child runner supervision.
//!
//! Each task gets a short-lived local runner process: the gateway spawns
//! it, scrapes its bound URL off stdout, drives it over HTTP, and tears it
//! down when the task ends. The executor only sees the `TaskRunner` trait
//! so tests can substitute a scripted double; the LLM extractor sees the
//! narrower `SessionApi` capability.

pub mod http;

pub use http::{RunnerApi, RunnerEvent, SessionMessage};

use crate::constants::RUNNER_URL_TIMEOUT_SECS;
use crate::models::{AgentEvent, AgentEventType};
use crate::{GatewayError, Result};
use async_trait::async_trait;
use futures::stream::BoxStream;
use regex::Regex;
use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

/// Where a runner's own stdout/stderr lines are forwarded as events.
pub type EventSink = mpsc::UnboundedSender<AgentEvent>;

/// Session operations the LLM extractor needs. Any implementation will do.
#[async_trait]
pub trait SessionApi: Send + Sync {
    async fn create_session(&self, title: &str) -> Result<Option<String>>;
    /// Fires a prompt without waiting for the run to finish.
    async fn prompt_async(
        &self,
        session_id: &str,
        model: Option<(String, String)>,
        text: &str,
    ) -> Result<()>;
    async fn list_messages(&self, session_id: &str) -> Result<Vec<SessionMessage>>;
    async fn abort_session(&self, session_id: &str) -> Result<()>;
}

/// Full runner surface the task executor drives.
#[async_trait]
pub trait TaskRunner: SessionApi {
    fn server_url(&self) -> String;
    fn is_running(&self) -> bool;
    /// Blocks until the run finishes; resolves with the final assistant text.
    async fn prompt(
        &self,
        session_id: &str,
        model: Option<(String, String)>,
        text: &str,
    ) -> Result<String>;
    async fn subscribe_events(&self) -> Result<BoxStream<'static, RunnerEvent>>;
    async fn list_providers(&self) -> Result<Vec<serde_json::Value>>;
    /// Forwards a line to the child's stdin; false when unsupported.
    async fn write_stdin(&self, content: &str) -> bool;
    async fn stop(&self);
}

/// Starts runners. The executor owns one factory for the process lifetime.
#[async_trait]
pub trait RunnerFactory: Send + Sync {
    async fn start(
        &self,
        cwd: &Path,
        env: &HashMap<String, String>,
        sink: Option<EventSink>,
    ) -> Result<Arc<dyn TaskRunner>>;
}

/// A spawned runner child plus the HTTP client bound to its URL.
#[derive(Debug)]
pub struct RunnerProcess {
    api: RunnerApi,
    child: Mutex<Option<Child>>,
    stdin: Mutex<Option<ChildStdin>>,
    running: Arc<AtomicBool>,
}

/// Environment variables never passed through to a child runner.
const CLEARED_ENV: &[&str] = &[
    "HTTP_PROXY",
    "HTTPS_PROXY",
    "http_proxy",
    "https_proxy",
    "ALL_PROXY",
    "all_proxy",
];

impl RunnerProcess {
    /// Spawns `<bin> serve --hostname 127.0.0.1 --port <port>` in `cwd` and
    /// waits for the child to report its listen URL. Fails if the child
    /// exits or stays silent past the startup deadline.
    pub async fn start(
        bin: &str,
        port: u16,
        credential: Option<(String, String)>,
        cwd: &Path,
        env: &HashMap<String, String>,
        sink: Option<EventSink>,
    ) -> Result<Self> {
        let mut command = Command::new(bin);
        command
            .args(["serve", "--hostname", "127.0.0.1", "--port", &port.to_string()])
            .current_dir(cwd)
            .env("NO_COLOR", "1")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for key in CLEARED_ENV {
            command.env_remove(key);
        }
        command.envs(env);

        let mut child = command.spawn().map_err(|e| GatewayError::Runner {
            message: format!("failed to spawn runner {bin:?}: {e}"),
        })?;

        let stdin = child.stdin.take();
        let (line_tx, mut line_rx) = mpsc::unbounded_channel::<(bool, String)>();
        if let Some(stdout) = child.stdout.take() {
            spawn_line_reader(stdout, false, line_tx.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_line_reader(stderr, true, line_tx);
        }

        let pattern = Regex::new(r"listening on (\S+)").map_err(|e| GatewayError::Runner {
            message: format!("invalid listen pattern: {e}"),
        })?;
        let url = match tokio::time::timeout(
            Duration::from_secs(RUNNER_URL_TIMEOUT_SECS),
            scan_for_url(&pattern, &mut line_rx),
        )
        .await
        {
            Ok(Ok(url)) => url,
            Ok(Err(tail)) => {
                let _ = child.start_kill();
                return Err(GatewayError::Runner {
                    message: format!("runner exited before reporting a listen URL: {tail}"),
                });
            }
            Err(_) => {
                let _ = child.start_kill();
                return Err(GatewayError::Runner {
                    message: format!(
                        "runner did not report a listen URL within {RUNNER_URL_TIMEOUT_SECS}s"
                    ),
                });
            }
        };
        url::Url::parse(&url).map_err(|e| GatewayError::Runner {
            message: format!("runner reported an unparseable URL {url:?}: {e}"),
        })?;
        info!("runner listening on {url}");

        let running = Arc::new(AtomicBool::new(true));
        let running_flag = running.clone();
        tokio::spawn(async move {
            while let Some((is_err, line)) = line_rx.recv().await {
                if let Some(sink) = &sink {
                    let event_type = if is_err {
                        AgentEventType::Stderr
                    } else {
                        AgentEventType::Stdout
                    };
                    let _ = sink.send(AgentEvent::new(event_type, line));
                }
            }
            // Both pipes closed: the child is gone.
            running_flag.store(false, Ordering::SeqCst);
        });

        Ok(Self {
            api: RunnerApi::new(url, credential),
            child: Mutex::new(Some(child)),
            stdin: Mutex::new(stdin),
            running,
        })
    }

    pub fn api(&self) -> &RunnerApi {
        &self.api
    }
}

fn spawn_line_reader(
    pipe: impl tokio::io::AsyncRead + Unpin + Send + 'static,
    is_err: bool,
    tx: mpsc::UnboundedSender<(bool, String)>,
) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(pipe).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if tx.send((is_err, line)).is_err() {
                break;
            }
        }
    });
}

/// Reads lines until one matches `listening on <url>`. Returns the tail of
/// observed output as the error when the pipes close first.
async fn scan_for_url(
    pattern: &Regex,
    rx: &mut mpsc::UnboundedReceiver<(bool, String)>,
) -> std::result::Result<String, String> {
    let mut tail: Vec<String> = Vec::new();
    while let Some((_, line)) = rx.recv().await {
        if let Some(captures) = pattern.captures(&line) {
            return Ok(captures[1].to_string());
        }
        tail.push(line);
        if tail.len() > 10 {
            tail.remove(0);
        }
    }
    Err(tail.join(" | "))
}

#[async_trait]
impl SessionApi for RunnerProcess {
    async fn create_session(&self, title: &str) -> Result<Option<String>> {
        self.api.create_session(title).await
    }

    async fn prompt_async(
        &self,
        session_id: &str,
        model: Option<(String, String)>,
        text: &str,
    ) -> Result<()> {
        let api = self.api.clone();
        let session_id = session_id.to_string();
        let text = text.to_string();
        tokio::spawn(async move {
            if let Err(e) = api.prompt(&session_id, model.as_ref(), &text).await {
                debug!("async prompt for session {session_id} failed: {e}");
            }
        });
        Ok(())
    }

    async fn list_messages(&self, session_id: &str) -> Result<Vec<SessionMessage>> {
        self.api.list_messages(session_id).await
    }

    async fn abort_session(&self, session_id: &str) -> Result<()> {
        self.api.abort_session(session_id).await
    }
}

#[async_trait]
impl TaskRunner for RunnerProcess {
    fn server_url(&self) -> String {
        self.api.base_url().to_string()
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    async fn prompt(
        &self,
        session_id: &str,
        model: Option<(String, String)>,
        text: &str,
    ) -> Result<String> {
        self.api.prompt(session_id, model.as_ref(), text).await
    }

    async fn subscribe_events(&self) -> Result<BoxStream<'static, RunnerEvent>> {
        self.api.subscribe_events().await
    }

    async fn list_providers(&self) -> Result<Vec<serde_json::Value>> {
        self.api.list_providers().await
    }

    async fn write_stdin(&self, content: &str) -> bool {
        let mut stdin = self.stdin.lock().await;
        let Some(pipe) = stdin.as_mut() else {
            return false;
        };
        let mut payload = content.as_bytes().to_vec();
        payload.push(b'\n');
        if let Err(e) = pipe.write_all(&payload).await {
            warn!("stdin forward failed: {e}");
            return false;
        }
        pipe.flush().await.is_ok()
    }

    async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        let mut child = self.child.lock().await;
        if let Some(mut child) = child.take() {
            if let Err(e) = child.start_kill() {
                debug!("runner kill failed: {e}");
            }
            let _ = child.wait().await;
        }
    }
}

/// Spawns real runner processes per the gateway configuration.
pub struct ProcessRunnerFactory {
    bin: String,
    port: u16,
    credential: Option<(String, String)>,
}

impl ProcessRunnerFactory {
    pub fn new(config: &crate::config::RunnerConfig) -> Self {
        let credential = config.credential.as_deref().and_then(|raw| {
            raw.split_once(':')
                .map(|(user, pass)| (user.to_string(), pass.to_string()))
        });
        Self {
            bin: config.bin.clone(),
            port: config.port,
            credential,
        }
    }
}

#[async_trait]
impl RunnerFactory for ProcessRunnerFactory {
    async fn start(
        &self,
        cwd: &Path,
        env: &HashMap<String, String>,
        sink: Option<EventSink>,
    ) -> Result<Arc<dyn TaskRunner>> {
        let runner = RunnerProcess::start(
            &self.bin,
            self.port,
            self.credential.clone(),
            cwd,
            env,
            sink,
        )
        .await?;
        Ok(Arc::new(runner))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    fn fake_runner(script_body: &str) -> (tempfile::TempDir, String) {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fake-runner");
        std::fs::write(&path, format!("#!/bin/sh\n{script_body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        (dir, path.to_string_lossy().to_string())
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn start_scrapes_listen_url_and_forwards_output() {
        let (dir, bin) = fake_runner(
            "echo starting up\n\
             echo listening on http://127.0.0.1:39999\n\
             echo ready to serve\n\
             sleep 5",
        );
        let (sink, mut events) = mpsc::unbounded_channel();
        let runner = RunnerProcess::start(
            &bin,
            0,
            None,
            dir.path(),
            &HashMap::new(),
            Some(sink),
        )
        .await
        .unwrap();

        assert_eq!(runner.server_url(), "http://127.0.0.1:39999");
        assert!(runner.is_running());

        let event = events.recv().await.unwrap();
        assert_eq!(event.event_type, AgentEventType::Stdout);
        assert_eq!(event.content.as_deref(), Some("ready to serve"));

        runner.stop().await;
        assert!(!runner.is_running());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn start_fails_when_child_exits_without_url() {
        let (dir, bin) = fake_runner("echo no port for you >&2\nexit 3");
        let result = RunnerProcess::start(&bin, 0, None, dir.path(), &HashMap::new(), None).await;
        match result {
            Err(GatewayError::Runner { message }) => {
                assert!(message.contains("no port for you"), "message: {message}");
            }
            other => panic!("expected runner error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn start_fails_for_missing_binary() {
        let dir = tempfile::tempdir().unwrap();
        let result = RunnerProcess::start(
            "definitely-not-a-real-binary",
            0,
            None,
            dir.path(),
            &HashMap::new(),
            None,
        )
        .await;
        assert!(matches!(result, Err(GatewayError::Runner { .. })));
    }

    #[test]
    fn factory_parses_credential() {
        let factory = ProcessRunnerFactory::new(&crate::config::RunnerConfig {
            bin: "opencode".to_string(),
            port: 0,
            credential: Some("gateway:s3cret".to_string()),
        });
        assert_eq!(
            factory.credential,
            Some(("gateway".to_string(), "s3cret".to_string()))
        );
    }
}
