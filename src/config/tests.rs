use super::*;
use crate::models::AgentKind;
use serial_test::serial;
use std::env;

// These tests mutate process environment variables and use #[serial] so
// they never interfere with each other.

const GATEWAY_VARS: &[&str] = &[
    "GATEWAY_SERVER_URL",
    "GATEWAY_AUTH_TOKEN",
    "GATEWAY_HOST_ID",
    "GATEWAY_HOST_NAME",
    "GATEWAY_MAX_CONCURRENT",
    "GATEWAY_CWD",
    "GATEWAY_ALLOWED_PROJECT_ROOTS",
    "GATEWAY_AGENTS",
    "GATEWAY_LABELS",
    "GATEWAY_RUNNER_BIN",
    "GATEWAY_RUNNER_AUTH",
    "GATEWAY_DATA_DIR",
    "OPENCODE_PORT",
    "MEMORY_ENABLE",
    "MEMORY_GATEWAY_STORE_ENABLE",
    "MEMORY_RUST_STORE_ENABLE",
    "MEMORY_AUTO_WRITE_ENABLE",
    "MEMORY_PROMPT_INJECTION_ENABLE",
    "MEMORY_INJECTION_TOKEN_BUDGET",
    "MEMORY_RETRIEVAL_TOP_K",
    "MEMORY_LLM_EXTRACT_ENABLE",
];

fn cleanup_env() {
    for var in GATEWAY_VARS {
        env::remove_var(var);
    }
}

#[test]
#[serial]
fn defaults_apply_when_environment_is_empty() {
    cleanup_env();
    let config = Config::load().unwrap();

    assert_eq!(config.server.url, "ws://127.0.0.1:8081");
    assert_eq!(config.server.auth_token, "dev-token");
    assert_eq!(config.host.max_concurrent, 2);
    assert!(config.host.host_id.starts_with("host-"));
    assert!(config.host.allowed_project_roots.is_empty());
    assert_eq!(config.host.agents, vec![AgentKind::Opencode]);
    assert_eq!(config.runner.bin, "opencode");
    assert_eq!(config.runner.port, 0);
    assert!(config.memory.enabled);
    assert!(!config.memory.rust_store_enabled);
    assert_eq!(config.memory.token_budget, 2_000);
    assert_eq!(config.memory.retrieval_top_k, 8);
}

#[test]
#[serial]
fn environment_overrides_are_honored() {
    cleanup_env();
    env::set_var("GATEWAY_SERVER_URL", "ws://orchestrator:9000");
    env::set_var("GATEWAY_AUTH_TOKEN", "prod-token");
    env::set_var("GATEWAY_HOST_NAME", "Build Box 01");
    env::set_var("GATEWAY_MAX_CONCURRENT", "5");
    env::set_var("GATEWAY_ALLOWED_PROJECT_ROOTS", "/srv/projects, ,/opt/work,");
    env::set_var("GATEWAY_AGENTS", "opencode,claude-code");
    env::set_var("OPENCODE_PORT", "4242");

    let config = Config::load().unwrap();
    assert_eq!(config.server.url, "ws://orchestrator:9000");
    assert_eq!(config.server.auth_token, "prod-token");
    assert_eq!(config.host.host_id, "host-build-box-01");
    assert_eq!(config.host.max_concurrent, 5);
    assert_eq!(
        config.host.allowed_project_roots,
        vec![PathBuf::from("/srv/projects"), PathBuf::from("/opt/work")]
    );
    assert_eq!(
        config.host.agents,
        vec![AgentKind::Opencode, AgentKind::ClaudeCode]
    );
    assert_eq!(config.runner.port, 4242);

    cleanup_env();
}

#[test]
#[serial]
fn invalid_max_concurrent_falls_back_to_default() {
    cleanup_env();
    env::set_var("GATEWAY_MAX_CONCURRENT", "not-a-number");
    let config = Config::load().unwrap();
    assert_eq!(config.host.max_concurrent, 2);

    env::set_var("GATEWAY_MAX_CONCURRENT", "0");
    let config = Config::load().unwrap();
    assert_eq!(config.host.max_concurrent, 2);

    cleanup_env();
}

#[test]
#[serial]
fn blank_auth_token_is_rejected() {
    cleanup_env();
    env::set_var("GATEWAY_AUTH_TOKEN", "   ");
    let result = Config::load();
    assert!(matches!(result, Err(GatewayError::ConfigurationError(_))));
    cleanup_env();
}

#[test]
#[serial]
fn memory_settings_are_parsed_and_clamped() {
    cleanup_env();
    env::set_var("MEMORY_ENABLE", "false");
    env::set_var("MEMORY_RUST_STORE_ENABLE", "1");
    env::set_var("MEMORY_INJECTION_TOKEN_BUDGET", "999999");
    env::set_var("MEMORY_RETRIEVAL_TOP_K", "0");

    let config = Config::load().unwrap();
    assert!(!config.memory.enabled);
    assert!(config.memory.rust_store_enabled);
    assert_eq!(config.memory.token_budget, 6_000);
    assert_eq!(config.memory.retrieval_top_k, 1);

    cleanup_env();
}

#[test]
fn host_name_sanitization() {
    assert_eq!(sanitize_host_name("Build Box 01"), "build-box-01");
    assert_eq!(sanitize_host_name("dev.local"), "dev-local");
    assert_eq!(sanitize_host_name("--weird__name--"), "weird-name");
    assert_eq!(sanitize_host_name(""), "");
}
