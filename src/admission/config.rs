//! Admission Configuration
//!
//! Budgets and operating mode for admission control.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Default budgets
pub const DEFAULT_USER_MAX_IN_FLIGHT: u32 = 3;
pub const DEFAULT_GLOBAL_MAX_IN_FLIGHT: u32 = 200;
pub const DEFAULT_GLOBAL_MAX_MESSAGES_PER_SECOND: u32 = 40;
pub const DEFAULT_GLOBAL_MAX_TOOL_CALLS_PER_SECOND: u32 = 120;
pub const DEFAULT_TICKET_TTL_MS: u64 = 120_000;
pub const DEFAULT_RETRY_AFTER_MS: u64 = 1_500;
pub const DEFAULT_ESTIMATED_TOOL_CALLS_PER_MESSAGE: u32 = 2;
pub const DEFAULT_KEY_PREFIX: &str = "admission";
pub const DEFAULT_STORE_TIMEOUT_MS: u64 = 2_000;

/// How admission decisions are applied
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdmissionMode {
    /// Reserve capacity and deny over-budget requests
    Enforce,
    /// Observe would-be decisions without gating traffic
    Shadow,
}

impl AdmissionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AdmissionMode::Enforce => "enforce",
            AdmissionMode::Shadow => "shadow",
        }
    }
}

impl fmt::Display for AdmissionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AdmissionMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "enforce" => Ok(AdmissionMode::Enforce),
            "shadow" => Ok(AdmissionMode::Shadow),
            other => anyhow::bail!("Invalid admission mode: {}. Must be 'enforce' or 'shadow'", other),
        }
    }
}

/// Admission control configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmissionConfig {
    /// Enable admission control
    pub enabled: bool,

    /// Mode used when a caller does not pick one
    pub mode: AdmissionMode,

    /// Concurrent admitted requests per principal
    pub user_max_in_flight: u32,

    /// Concurrent admitted requests across all principals
    pub global_max_in_flight: u32,

    /// Admissions per wall-clock second
    pub global_max_messages_per_second: u32,

    /// Estimated tool calls admitted per wall-clock second
    pub global_max_tool_calls_per_second: u32,

    /// Lifetime of a ticket and of the in-flight counters it holds
    pub ticket_ttl_ms: u64,

    /// Backoff hint returned with denials
    pub retry_after_ms: u64,

    /// Tool calls assumed for a request that does not estimate its own
    pub estimated_tool_calls_per_message: u32,

    /// Namespace for every counter store key
    pub key_prefix: String,

    /// REST endpoint of the counter store
    pub redis_url: Option<String>,

    /// Bearer token for the counter store
    pub redis_token: Option<String>,

    /// Per-call timeout for counter store requests
    pub store_timeout_ms: u64,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            mode: AdmissionMode::Shadow,
            user_max_in_flight: DEFAULT_USER_MAX_IN_FLIGHT,
            global_max_in_flight: DEFAULT_GLOBAL_MAX_IN_FLIGHT,
            global_max_messages_per_second: DEFAULT_GLOBAL_MAX_MESSAGES_PER_SECOND,
            global_max_tool_calls_per_second: DEFAULT_GLOBAL_MAX_TOOL_CALLS_PER_SECOND,
            ticket_ttl_ms: DEFAULT_TICKET_TTL_MS,
            retry_after_ms: DEFAULT_RETRY_AFTER_MS,
            estimated_tool_calls_per_message: DEFAULT_ESTIMATED_TOOL_CALLS_PER_MESSAGE,
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            redis_url: None,
            redis_token: None,
            store_timeout_ms: DEFAULT_STORE_TIMEOUT_MS,
        }
    }
}

fn env_parse<T: FromStr>(name: &str, target: &mut T) {
    if let Ok(val) = std::env::var(name) {
        match val.parse() {
            Ok(parsed) => *target = parsed,
            Err(_) => tracing::warn!(variable = name, value = %val, "Ignoring unparsable value"),
        }
    }
}

fn env_string(names: &[&str]) -> Option<String> {
    names
        .iter()
        .filter_map(|name| std::env::var(name).ok())
        .map(|val| val.trim().to_string())
        .find(|val| !val.is_empty())
}

impl AdmissionConfig {
    /// Create a new admission configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        Self::default().apply_env_overrides()
    }

    /// Overlay `ADMISSION_*` environment variables onto this configuration
    pub fn apply_env_overrides(mut self) -> Self {
        env_parse("ADMISSION_ENABLED", &mut self.enabled);
        env_parse("ADMISSION_MODE", &mut self.mode);
        env_parse("ADMISSION_USER_MAX_INFLIGHT", &mut self.user_max_in_flight);
        env_parse("ADMISSION_GLOBAL_MAX_INFLIGHT", &mut self.global_max_in_flight);
        env_parse(
            "ADMISSION_GLOBAL_MAX_MSG_PER_SEC",
            &mut self.global_max_messages_per_second,
        );
        env_parse(
            "ADMISSION_GLOBAL_MAX_TOOL_CALLS_PER_SEC",
            &mut self.global_max_tool_calls_per_second,
        );
        env_parse("ADMISSION_TICKET_TTL_MS", &mut self.ticket_ttl_ms);
        env_parse("ADMISSION_RETRY_AFTER_MS", &mut self.retry_after_ms);
        env_parse(
            "ADMISSION_ESTIMATED_TOOL_CALLS",
            &mut self.estimated_tool_calls_per_message,
        );
        env_parse("ADMISSION_STORE_TIMEOUT_MS", &mut self.store_timeout_ms);

        if let Some(prefix) = env_string(&["ADMISSION_KEY_PREFIX"]) {
            self.key_prefix = prefix;
        }
        if let Some(url) = env_string(&["ADMISSION_REDIS_URL", "UPSTASH_REDIS_REST_URL"]) {
            self.redis_url = Some(url);
        }
        if let Some(token) = env_string(&["ADMISSION_REDIS_TOKEN", "UPSTASH_REDIS_REST_TOKEN"]) {
            self.redis_token = Some(token);
        }

        self
    }

    /// Disable admission control (for testing)
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Validate budgets
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.user_max_in_flight == 0 {
            anyhow::bail!("user_max_in_flight must be > 0");
        }
        if self.global_max_in_flight == 0 {
            anyhow::bail!("global_max_in_flight must be > 0");
        }
        if self.global_max_messages_per_second == 0 {
            anyhow::bail!("global_max_messages_per_second must be > 0");
        }
        if self.global_max_tool_calls_per_second == 0 {
            anyhow::bail!("global_max_tool_calls_per_second must be > 0");
        }
        if self.ticket_ttl_ms == 0 {
            anyhow::bail!("ticket_ttl_ms must be > 0");
        }
        if self.key_prefix.trim().is_empty() {
            anyhow::bail!("key_prefix must not be empty");
        }
        if self.store_timeout_ms == 0 {
            anyhow::bail!("store_timeout_ms must be > 0");
        }
        Ok(())
    }

    /// Ticket and in-flight counter TTL in whole seconds (at least one)
    pub fn ticket_ttl_secs(&self) -> u64 {
        self.ticket_ttl_ms.div_ceil(1000).max(1)
    }

    /// Get store request timeout
    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    /// Copy with the store token masked, for display
    pub fn redacted(&self) -> Self {
        Self {
            redis_token: self.redis_token.as_ref().map(|_| "***".to_string()),
            ..self.clone()
        }
    }
}
