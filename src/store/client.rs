// =============================================================================
// Vector Store Client — HTTP/JSON façade over the durable outcome store
// =============================================================================
//
// Read-mostly dependency: the engine bulk-fetches outcome vectors at startup
// and on reload, polls `/stats` for growth, and forwards freshly observed
// outcomes through the optional write path. Every call is request/response;
// transient failures are tolerated upstream by retaining the last snapshot.
//
// SECURITY: when a shared secret is configured, requests carry an
// `X-Meridian-Signature` header: HMAC-SHA256 over `<path>?<query>` plus a
// millisecond timestamp, hex-encoded. The secret itself is never logged.
// =============================================================================

use anyhow::{Context, Result};
use hmac::{Hmac, Mac};
use reqwest::header::HeaderValue;
use sha2::Sha256;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, instrument, warn};

use crate::types::{DataType, TradeOutcome};

type HmacSha256 = Hmac<Sha256>;

/// Filters accepted by the bulk fetch endpoint. Every field is optional;
/// an empty filter fetches the whole store.
#[derive(Debug, Clone, Default)]
pub struct VectorFilters {
    /// Restrict to these data-type tags.
    pub data_types: Vec<DataType>,
    /// Restrict to one raw instrument symbol.
    pub instrument: Option<String>,
    /// Cap on returned records.
    pub limit: Option<usize>,
}

/// Aggregate counters reported by the store.
#[derive(Debug, Clone, Copy, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreStats {
    pub total_vectors: u64,
}

/// HTTP client for the durable vector store.
#[derive(Clone)]
pub struct VectorStoreClient {
    base_url: String,
    secret: Option<String>,
    client: reqwest::Client,
}

impl VectorStoreClient {
    // -------------------------------------------------------------------------
    // Construction
    // -------------------------------------------------------------------------

    /// Create a new client.
    ///
    /// # Arguments
    /// * `base_url` — store root, e.g. `http://127.0.0.1:3015`.
    /// * `secret`   — optional shared secret for request signing.
    /// * `timeout`  — per-request timeout.
    pub fn new(
        base_url: impl Into<String>,
        secret: Option<String>,
        timeout: std::time::Duration,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("failed to build reqwest client");

        let base_url = base_url.into();
        debug!(base_url = %base_url, signed = secret.is_some(), "VectorStoreClient initialised");

        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            secret,
            client,
        }
    }

    // -------------------------------------------------------------------------
    // Signing helpers
    // -------------------------------------------------------------------------

    /// Produce an HMAC-SHA256 hex signature of `payload`.
    fn sign(&self, secret: &str, payload: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
            .expect("HMAC accepts any key size");
        mac.update(payload.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Current UNIX timestamp in milliseconds.
    fn timestamp_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before UNIX epoch")
            .as_millis() as u64
    }

    /// Attach the signature headers to a request when a secret is configured.
    fn maybe_sign(
        &self,
        req: reqwest::RequestBuilder,
        path_and_query: &str,
    ) -> reqwest::RequestBuilder {
        match &self.secret {
            Some(secret) => {
                let ts = Self::timestamp_ms();
                let sig = self.sign(secret, &format!("{path_and_query}|{ts}"));
                req.header("X-Meridian-Timestamp", ts)
                    .header(
                        "X-Meridian-Signature",
                        HeaderValue::from_str(&sig).expect("hex is a valid header value"),
                    )
            }
            None => req,
        }
    }

    // -------------------------------------------------------------------------
    // Reads
    // -------------------------------------------------------------------------

    /// GET /api/v1/vectors — bulk fetch with optional filters.
    ///
    /// Records that fail to parse are skipped (and counted in the warning
    /// log) rather than failing the whole fetch; one malformed legacy row
    /// must not block a reload.
    #[instrument(skip(self, filters), name = "store::fetch_vectors")]
    pub async fn fetch_vectors(&self, filters: &VectorFilters) -> Result<Vec<TradeOutcome>> {
        let mut query = Vec::new();
        if !filters.data_types.is_empty() {
            let tags: Vec<&str> = filters
                .data_types
                .iter()
                .map(|t| match t {
                    DataType::Training => "TRAINING",
                    DataType::Recent => "RECENT",
                    DataType::OutOfSample => "OUT_OF_SAMPLE",
                })
                .collect();
            query.push(format!("dataType={}", tags.join(",")));
        }
        if let Some(instrument) = &filters.instrument {
            query.push(format!("instrument={instrument}"));
        }
        if let Some(limit) = filters.limit {
            query.push(format!("limit={limit}"));
        }

        let path = if query.is_empty() {
            "/api/v1/vectors".to_string()
        } else {
            format!("/api/v1/vectors?{}", query.join("&"))
        };
        let url = format!("{}{}", self.base_url, path);

        let resp = self
            .maybe_sign(self.client.get(&url), &path)
            .send()
            .await
            .context("GET /api/v1/vectors request failed")?;

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .context("failed to parse vectors response")?;

        if !status.is_success() {
            anyhow::bail!("store GET /api/v1/vectors returned {}: {}", status, body);
        }

        // The store wraps the array as {"vectors": [...]}; tolerate a bare
        // array for older deployments.
        let rows = body
            .get("vectors")
            .and_then(|v| v.as_array())
            .or_else(|| body.as_array())
            .context("vectors response is not an array")?;

        let mut outcomes = Vec::with_capacity(rows.len());
        let mut skipped = 0usize;
        for row in rows {
            match serde_json::from_value::<TradeOutcome>(row.clone()) {
                Ok(o) => outcomes.push(o),
                Err(e) => {
                    skipped += 1;
                    debug!(error = %e, "skipping unparseable vector record");
                }
            }
        }
        if skipped > 0 {
            warn!(skipped, kept = outcomes.len(), "some vector records failed to parse");
        }

        debug!(count = outcomes.len(), "vectors fetched");
        Ok(outcomes)
    }

    /// GET /api/v1/stats — aggregate store counters.
    #[instrument(skip(self), name = "store::stats")]
    pub async fn stats(&self) -> Result<StoreStats> {
        let path = "/api/v1/stats";
        let url = format!("{}{}", self.base_url, path);

        let resp = self
            .maybe_sign(self.client.get(&url), path)
            .send()
            .await
            .context("GET /api/v1/stats request failed")?;

        let status = resp.status();
        if !status.is_success() {
            anyhow::bail!("store GET /api/v1/stats returned {}", status);
        }

        let stats: StoreStats = resp
            .json()
            .await
            .context("failed to parse stats response")?;
        Ok(stats)
    }

    // -------------------------------------------------------------------------
    // Writes (optional feedback path)
    // -------------------------------------------------------------------------

    /// POST /api/v1/vectors — forward a freshly observed outcome.
    ///
    /// Best-effort: the engine's in-process ring already holds the outcome,
    /// so a store failure here is logged by the caller and otherwise ignored.
    #[instrument(skip(self, outcome), name = "store::store_outcome")]
    pub async fn store_outcome(&self, outcome: &TradeOutcome) -> Result<()> {
        let path = "/api/v1/vectors";
        let url = format!("{}{}", self.base_url, path);

        let resp = self
            .maybe_sign(self.client.post(&url), path)
            .json(outcome)
            .send()
            .await
            .context("POST /api/v1/vectors request failed")?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("store POST /api/v1/vectors returned {}: {}", status, body);
        }

        debug!(entry_signal_id = %outcome.entry_signal_id, "outcome stored");
        Ok(())
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn client(secret: Option<&str>) -> VectorStoreClient {
        VectorStoreClient::new(
            "http://127.0.0.1:3015/",
            secret.map(String::from),
            std::time::Duration::from_secs(1),
        )
    }

    #[test]
    fn base_url_trailing_slash_is_trimmed() {
        let c = client(None);
        assert_eq!(c.base_url, "http://127.0.0.1:3015");
    }

    #[test]
    fn signature_is_deterministic_hex() {
        let c = client(Some("topsecret"));
        let a = c.sign("topsecret", "/api/v1/stats|1000");
        let b = c.sign("topsecret", "/api/v1/stats|1000");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|ch| ch.is_ascii_hexdigit()));
    }

    #[test]
    fn different_payloads_sign_differently() {
        let c = client(Some("topsecret"));
        assert_ne!(
            c.sign("topsecret", "/api/v1/stats|1000"),
            c.sign("topsecret", "/api/v1/stats|1001")
        );
    }
}
