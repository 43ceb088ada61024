//! Counter store key derivation.

use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};

/// Characters left unescaped in principal keys: `A-Z a-z 0-9 - _ . ! ~ * ' ( )`.
const PRINCIPAL_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'!')
    .remove(b'~')
    .remove(b'*')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')');

/// Rate buckets are one wall-clock second wide.
pub const RATE_BUCKET_MS: i64 = 1000;

/// All keys touched by one admission attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdmissionKeys {
    pub global_in_flight: String,
    pub user_in_flight: String,
    pub msg_rate: String,
    pub tool_rate: String,
    /// Empty when no ticket id was supplied
    pub ticket: String,
}

impl AdmissionKeys {
    /// Derive the keys for a principal at `now_ms`.
    pub fn build(prefix: &str, principal_key: &str, now_ms: i64, ticket_id: Option<&str>) -> Self {
        let second = now_ms.div_euclid(RATE_BUCKET_MS);
        let principal = utf8_percent_encode(principal_key, PRINCIPAL_ENCODE_SET);

        Self {
            global_in_flight: format!("{prefix}:inflight:global"),
            user_in_flight: format!("{prefix}:inflight:user:{principal}"),
            msg_rate: format!("{prefix}:rate:msg:{second}"),
            tool_rate: format!("{prefix}:rate:tool:{second}"),
            ticket: ticket_id
                .filter(|id| !id.is_empty())
                .map(|id| format!("{prefix}:ticket:{id}"))
                .unwrap_or_default(),
        }
    }
}
