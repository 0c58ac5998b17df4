//! System-wide configuration values shared across gateway components.

// Orchestrator link
/// Interval between outbound heartbeats on an established channel.
pub const HEARTBEAT_INTERVAL_SECS: u64 = 30;

/// Base delay for the reconnect backoff schedule.
pub const RECONNECT_BASE_DELAY_MS: u64 = 1_000;

/// Ceiling for the reconnect backoff schedule.
pub const RECONNECT_MAX_DELAY_MS: u64 = 60_000;

/// Uniform jitter bounds applied to every scheduled reconnect delay.
pub const RECONNECT_JITTER_LOW: f64 = 0.75;
pub const RECONNECT_JITTER_HIGH: f64 = 1.25;

// Child runner supervision
/// How long to wait for the child to print its bound URL before giving up.
pub const RUNNER_URL_TIMEOUT_SECS: u64 = 15;

/// Retries for connection-refused right after the child reports its URL.
pub const RUNNER_CONNECT_RETRIES: u32 = 3;
pub const RUNNER_CONNECT_RETRY_DELAY_MS: u64 = 250;

// Task execution
/// Cap on the cumulative per-task output buffer. Oldest half is dropped on overflow.
pub const TASK_OUTPUT_BUFFER_CAP: usize = 256 * 1024;

/// Cap on the output string carried in a task result.
pub const TASK_RESULT_OUTPUT_CAP: usize = 16 * 1024;

// Memory subsystem
/// Hard cap on a single list page.
pub const MEMORY_LIST_LIMIT_CAP: usize = 500;

pub const MEMORY_TOKEN_BUDGET_MIN: u32 = 200;
pub const MEMORY_TOKEN_BUDGET_MAX: u32 = 6_000;
pub const MEMORY_TOP_K_MIN: usize = 1;
pub const MEMORY_TOP_K_MAX: usize = 50;

/// Maximum candidates either extractor pass may return.
pub const EXTRACT_MAX_CANDIDATES: usize = 8;

/// Facts are only mined from the first sentences of task output.
pub const FACT_SENTENCE_WINDOW: usize = 24;

/// The LLM extraction pass polls the session for at most this long.
pub const LLM_EXTRACT_TIMEOUT_SECS: u64 = 25;
pub const LLM_EXTRACT_POLL_MS: u64 = 1_000;

/// Token estimate: `ceil(chars / 4)` plus a fixed per-item overhead.
pub const TOKEN_ESTIMATE_CHARS_PER_TOKEN: usize = 4;
pub const TOKEN_ESTIMATE_ITEM_OVERHEAD: usize = 8;
