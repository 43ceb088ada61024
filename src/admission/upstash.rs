//! REST Counter Store
//!
//! Counter store backed by a Redis instance reachable over an HTTP REST
//! gateway (Upstash-compatible).
//!
//! # Wire format
//!
//! Each command is a single HTTP POST whose body is the command as a JSON
//! array, authenticated with a bearer token:
//!
//! ```text
//! POST {url}
//! Authorization: Bearer {token}
//!
//! ["INCRBY", "admission:rate:tool:1700000000", "3"]
//! ```
//!
//! The reply is `{"result": <value>}` on success or `{"error": "<message>"}`
//! when the store rejects the command.

use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

use super::error::{StoreError, StoreResult};
use super::store::CounterStore;

#[derive(Debug, Deserialize)]
struct CommandReply {
    #[serde(default)]
    result: serde_json::Value,
    #[serde(default)]
    error: Option<String>,
}

/// Counter store speaking the REST command protocol
///
/// One HTTP transaction per command. Commands are never pipelined, so every
/// admission step observes the result of the previous one.
pub struct UpstashStore {
    /// Reqwest HTTP client
    client: reqwest::Client,

    /// REST endpoint URL
    url: String,

    /// Bearer token
    token: String,

    /// Per-request timeout
    timeout: Duration,
}

impl std::fmt::Debug for UpstashStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstashStore")
            .field("url", &self.url)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl UpstashStore {
    /// Create a store client for the given endpoint
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(url: impl Into<String>, token: impl Into<String>, timeout: Duration) -> StoreResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| StoreError::Unavailable(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            url: url.into().trim_end_matches('/').to_string(),
            token: token.into(),
            timeout,
        })
    }

    /// Get the endpoint URL
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Get the request timeout
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn command(&self, args: &[&str]) -> StoreResult<serde_json::Value> {
        tracing::trace!(command = args.first().copied().unwrap_or_default(), "Counter store command");

        let http_response = self
            .client
            .post(&self.url)
            .bearer_auth(&self.token)
            .json(args)
            .send()
            .await?;

        let status = http_response.status();
        let body = http_response.text().await?;

        // Rejected commands come back as 4xx with an error body
        if let Ok(reply) = serde_json::from_str::<CommandReply>(&body) {
            if let Some(error) = reply.error {
                return Err(StoreError::Server(error));
            }
            if status.is_success() {
                return Ok(reply.result);
            }
        }

        if !status.is_success() {
            return Err(StoreError::Status(status.as_u16()));
        }
        Err(StoreError::Decode(format!("unexpected reply body: {}", body)))
    }

    async fn integer_command(&self, args: &[&str]) -> StoreResult<i64> {
        let value = self.command(args).await?;
        parse_integer(&value)
            .ok_or_else(|| StoreError::Decode(format!("expected integer reply to {}, got {}", args[0], value)))
    }
}

/// Interpret a reply as an integer. Strings are accepted since `GET` returns
/// stored values as strings.
pub(crate) fn parse_integer(value: &serde_json::Value) -> Option<i64> {
    match value {
        serde_json::Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        serde_json::Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    }
}

#[async_trait]
impl CounterStore for UpstashStore {
    async fn get(&self, key: &str) -> StoreResult<Option<i64>> {
        let value = self.command(&["GET", key]).await?;
        if value.is_null() {
            return Ok(None);
        }
        // Non-numeric payloads count as zero
        Ok(Some(parse_integer(&value).unwrap_or_else(|| {
            tracing::debug!(key, %value, "Non-numeric counter value");
            0
        })))
    }

    async fn set(&self, key: &str, value: i64) -> StoreResult<()> {
        self.command(&["SET", key, &value.to_string()]).await?;
        Ok(())
    }

    async fn del(&self, key: &str) -> StoreResult<u64> {
        let removed = self.integer_command(&["DEL", key]).await?;
        Ok(removed.max(0) as u64)
    }

    async fn incr(&self, key: &str) -> StoreResult<i64> {
        self.integer_command(&["INCR", key]).await
    }

    async fn incr_by(&self, key: &str, by: i64) -> StoreResult<i64> {
        self.integer_command(&["INCRBY", key, &by.to_string()]).await
    }

    async fn decr(&self, key: &str) -> StoreResult<i64> {
        self.integer_command(&["DECR", key]).await
    }

    async fn decr_by(&self, key: &str, by: i64) -> StoreResult<i64> {
        self.integer_command(&["DECRBY", key, &by.to_string()]).await
    }

    async fn expire(&self, key: &str, ttl_secs: u64) -> StoreResult<bool> {
        let applied = self.integer_command(&["EXPIRE", key, &ttl_secs.to_string()]).await?;
        Ok(applied == 1)
    }

    fn name(&self) -> &str {
        "upstash"
    }
}
