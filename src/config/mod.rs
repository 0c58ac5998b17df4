use crate::memory::MemorySettings;
use crate::models::{AgentKind, HostCapabilities};
use crate::{Result, GatewayError};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;

#[cfg(test)]
mod tests;

/// Immutable runtime configuration, resolved once at startup from the
/// process environment with per-variable defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub host: HostConfig,
    pub runner: RunnerConfig,
    pub data_dir: PathBuf,
    pub memory: MemorySettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub url: String,
    pub auth_token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostConfig {
    pub host_id: String,
    pub host_name: String,
    pub max_concurrent: usize,
    pub cwd: PathBuf,
    pub allowed_project_roots: Vec<PathBuf>,
    pub agents: Vec<AgentKind>,
    pub labels: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    pub bin: String,
    pub port: u16,
    /// Optional `user:pass` basic-auth credential for the runner API.
    pub credential: Option<String>,
}

const DEFAULT_SERVER_URL: &str = "ws://127.0.0.1:8081";
const DEFAULT_AUTH_TOKEN: &str = "dev-token";
const DEFAULT_MAX_CONCURRENT: usize = 2;
const DEFAULT_RUNNER_BIN: &str = "opencode";

impl Config {
    pub fn load() -> Result<Self> {
        // Load environment variables from a .env file when present
        match dotenvy::dotenv() {
            Ok(path) => tracing::debug!("Loaded .env file from: {:?}", path),
            Err(_) => tracing::debug!("No .env file loaded"),
        }

        let auth_token =
            env::var("GATEWAY_AUTH_TOKEN").unwrap_or_else(|_| DEFAULT_AUTH_TOKEN.to_string());
        if auth_token.trim().is_empty() {
            return Err(GatewayError::ConfigurationError(
                "GATEWAY_AUTH_TOKEN cannot be blank".to_string(),
            ));
        }

        let server = ServerConfig {
            url: env::var("GATEWAY_SERVER_URL").unwrap_or_else(|_| DEFAULT_SERVER_URL.to_string()),
            auth_token,
        };

        let host_name = env::var("GATEWAY_HOST_NAME").unwrap_or_else(|_| os_hostname());
        let host_id = env::var("GATEWAY_HOST_ID")
            .unwrap_or_else(|_| format!("host-{}", sanitize_host_name(&host_name)));

        let cwd = match env::var("GATEWAY_CWD") {
            Ok(dir) if !dir.trim().is_empty() => PathBuf::from(dir),
            _ => env::current_dir()?,
        };

        let allowed_project_roots = env::var("GATEWAY_ALLOWED_PROJECT_ROOTS")
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(PathBuf::from)
            .collect();

        let host = HostConfig {
            host_id,
            host_name,
            // An unparseable value silently falls back to the default
            max_concurrent: env::var("GATEWAY_MAX_CONCURRENT")
                .ok()
                .and_then(|v| v.parse::<usize>().ok())
                .filter(|n| *n > 0)
                .unwrap_or(DEFAULT_MAX_CONCURRENT),
            cwd,
            allowed_project_roots,
            agents: parse_agents(&env::var("GATEWAY_AGENTS").unwrap_or_default()),
            labels: env::var("GATEWAY_LABELS")
                .unwrap_or_default()
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect(),
        };

        let runner = RunnerConfig {
            bin: env::var("GATEWAY_RUNNER_BIN").unwrap_or_else(|_| DEFAULT_RUNNER_BIN.to_string()),
            port: env::var("OPENCODE_PORT")
                .ok()
                .and_then(|v| v.parse::<u16>().ok())
                .unwrap_or(0),
            credential: env::var("GATEWAY_RUNNER_AUTH")
                .ok()
                .filter(|v| !v.trim().is_empty()),
        };

        let data_dir = match env::var("GATEWAY_DATA_DIR") {
            Ok(dir) if !dir.trim().is_empty() => PathBuf::from(dir),
            _ => dirs::home_dir()
                .map(|home| home.join(".agent-gateway"))
                .unwrap_or_else(|| PathBuf::from(".agent-gateway")),
        };

        let memory = MemorySettings {
            enabled: env_bool("MEMORY_ENABLE", true),
            gateway_store_enabled: env_bool("MEMORY_GATEWAY_STORE_ENABLE", true),
            rust_store_enabled: env_bool("MEMORY_RUST_STORE_ENABLE", false),
            auto_write: env_bool("MEMORY_AUTO_WRITE_ENABLE", true),
            prompt_injection: env_bool("MEMORY_PROMPT_INJECTION_ENABLE", true),
            token_budget: env::var("MEMORY_INJECTION_TOKEN_BUDGET")
                .ok()
                .and_then(|v| v.parse::<u32>().ok())
                .unwrap_or(2_000),
            retrieval_top_k: env::var("MEMORY_RETRIEVAL_TOP_K")
                .ok()
                .and_then(|v| v.parse::<usize>().ok())
                .unwrap_or(8),
            llm_extract_enabled: env_bool("MEMORY_LLM_EXTRACT_ENABLE", false),
        }
        .clamped();

        Ok(Config {
            server,
            host,
            runner,
            data_dir,
            memory,
        })
    }

    /// The capability set announced during registration.
    pub fn capabilities(&self) -> HostCapabilities {
        HostCapabilities {
            host_name: self.host.host_name.clone(),
            agents: self.host.agents.clone(),
            max_concurrent: self.host.max_concurrent,
            cwd: self.host.cwd.clone(),
            labels: self.host.labels.clone(),
        }
    }
}

fn os_hostname() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .ok()
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

/// Lowercases and maps runs of non-alphanumeric characters to a single `-`.
fn sanitize_host_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut last_dash = true;
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash {
            out.push('-');
            last_dash = true;
        }
    }
    out.trim_end_matches('-').to_string()
}

fn parse_agents(raw: &str) -> Vec<AgentKind> {
    let parsed: Vec<AgentKind> = raw
        .split(',')
        .map(str::trim)
        .filter_map(|s| s.parse().ok())
        .collect();
    if parsed.is_empty() {
        vec![AgentKind::Opencode]
    } else {
        parsed
    }
}

fn env_bool(key: &str, default: bool) -> bool {
    match env::var(key) {
        Ok(v) => matches!(
            v.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => default,
    }
}
