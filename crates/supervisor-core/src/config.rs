use std::time::Duration;

fn env_duration_secs(name: &str, default_secs: u64) -> Duration {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or_else(|| Duration::from_secs(default_secs))
}

fn env_usize(name: &str, default: usize) -> usize {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(default)
}

fn env_string(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

/// Per-policy thresholds for the Policy Engine. Each policy is independently
/// toggleable; `max_retries`/`retry_reset` bound how often it may re-fire
/// for the same session.
#[derive(Debug, Clone)]
pub struct PolicyConfig {
    pub enabled: bool,
    pub max_retries: u32,
    pub retry_reset: Duration,
}

#[derive(Debug, Clone)]
pub struct ResumeOnIdleConfig {
    pub policy: PolicyConfig,
    pub idle_threshold: Duration,
}

#[derive(Debug, Clone)]
pub struct RestartOnCompactionConfig {
    pub policy: PolicyConfig,
    pub token_threshold: u64,
}

#[derive(Debug, Clone)]
pub struct KillOnCostConfig {
    pub policy: PolicyConfig,
    pub cost_threshold_usd: f64,
}

/// Process-wide configuration assembled from environment variables — no
/// config-file format is parsed here, that collaborator lives outside this
/// crate.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub data_dir: String,
    pub bind_addr: String,
    pub auth_token: String,
    pub origin_allow_list: Vec<String>,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout_count: u32,
    pub ping_interval: Duration,
    pub read_deadline: Duration,
    pub write_deadline: Duration,
    pub send_queue_capacity: usize,
    pub read_byte_limit: usize,
    pub event_channel_capacity: usize,
    pub event_dedup_cache_capacity: usize,
    pub credential_push_cache_capacity: usize,
    pub policy_check_interval: Duration,
    pub resume_on_idle: ResumeOnIdleConfig,
    pub restart_on_compaction: RestartOnCompactionConfig,
    pub kill_on_cost: KillOnCostConfig,
}

impl SupervisorConfig {
    pub fn from_env() -> Self {
        Self {
            data_dir: env_string("SUPERVISOR_DATA_DIR", "./data"),
            bind_addr: env_string("SUPERVISOR_BIND_ADDR", "0.0.0.0:8088"),
            auth_token: env_string("SUPERVISOR_AUTH_TOKEN", ""),
            origin_allow_list: std::env::var("SUPERVISOR_ORIGIN_ALLOW_LIST")
                .ok()
                .map(|v| v.split(',').map(|s| s.trim().to_string()).collect())
                .unwrap_or_default(),
            heartbeat_interval: env_duration_secs("SUPERVISOR_HEARTBEAT_INTERVAL_SECS", 20),
            heartbeat_timeout_count: env_usize("SUPERVISOR_HEARTBEAT_TIMEOUT_COUNT", 3) as u32,
            ping_interval: env_duration_secs("SUPERVISOR_PING_INTERVAL_SECS", 54),
            read_deadline: env_duration_secs("SUPERVISOR_READ_DEADLINE_SECS", 60),
            write_deadline: env_duration_secs("SUPERVISOR_WRITE_DEADLINE_SECS", 10),
            send_queue_capacity: env_usize("SUPERVISOR_SEND_QUEUE_CAPACITY", 256),
            read_byte_limit: env_usize("SUPERVISOR_READ_BYTE_LIMIT", 64 * 1024),
            event_channel_capacity: env_usize("SUPERVISOR_EVENT_CHANNEL_CAPACITY", 1024),
            event_dedup_cache_capacity: env_usize("SUPERVISOR_EVENT_DEDUP_CACHE_CAPACITY", 1000),
            credential_push_cache_capacity: env_usize(
                "SUPERVISOR_CREDENTIAL_PUSH_CACHE_CAPACITY",
                1000,
            ),
            policy_check_interval: env_duration_secs("SUPERVISOR_POLICY_CHECK_INTERVAL_SECS", 30),
            resume_on_idle: ResumeOnIdleConfig {
                policy: PolicyConfig {
                    enabled: env_string("SUPERVISOR_POLICY_RESUME_ON_IDLE_ENABLED", "true")
                        == "true",
                    max_retries: env_usize("SUPERVISOR_POLICY_RESUME_ON_IDLE_MAX_RETRIES", 3)
                        as u32,
                    retry_reset: env_duration_secs(
                        "SUPERVISOR_POLICY_RESUME_ON_IDLE_RETRY_RESET_SECS",
                        3600,
                    ),
                },
                idle_threshold: env_duration_secs(
                    "SUPERVISOR_POLICY_RESUME_ON_IDLE_THRESHOLD_SECS",
                    900,
                ),
            },
            restart_on_compaction: RestartOnCompactionConfig {
                policy: PolicyConfig {
                    enabled: env_string(
                        "SUPERVISOR_POLICY_RESTART_ON_COMPACTION_ENABLED",
                        "true",
                    ) == "true",
                    max_retries: env_usize(
                        "SUPERVISOR_POLICY_RESTART_ON_COMPACTION_MAX_RETRIES",
                        3,
                    ) as u32,
                    retry_reset: env_duration_secs(
                        "SUPERVISOR_POLICY_RESTART_ON_COMPACTION_RETRY_RESET_SECS",
                        3600,
                    ),
                },
                token_threshold: env_usize(
                    "SUPERVISOR_POLICY_RESTART_ON_COMPACTION_TOKEN_THRESHOLD",
                    180_000,
                ) as u64,
            },
            kill_on_cost: KillOnCostConfig {
                policy: PolicyConfig {
                    enabled: env_string("SUPERVISOR_POLICY_KILL_ON_COST_ENABLED", "true")
                        == "true",
                    max_retries: env_usize("SUPERVISOR_POLICY_KILL_ON_COST_MAX_RETRIES", 1) as u32,
                    retry_reset: env_duration_secs(
                        "SUPERVISOR_POLICY_KILL_ON_COST_RETRY_RESET_SECS",
                        86_400,
                    ),
                },
                cost_threshold_usd: std::env::var("SUPERVISOR_POLICY_KILL_ON_COST_THRESHOLD_USD")
                    .ok()
                    .and_then(|v| v.parse::<f64>().ok())
                    .unwrap_or(25.0),
            },
        }
    }
}
