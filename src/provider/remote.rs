//! Remote system-of-record adapter over HTTP
//!
//! The remote tier may be unreachable at any time. While the availability
//! flag is down, every operation degrades gracefully (`None`/`false`/empty)
//! instead of erroring, so user-facing reads and saves keep working from
//! the local tiers. Connection failures flip the flag; a successful
//! [`init`](StorageProvider::init) health probe raises it again.

use super::{ProviderStats, SearchHit, SearchQuery, SetOptions, StorageProvider};
use crate::config::RemoteConfig;
use crate::errors::{Result, StorageError};
use crate::types::IncrementalUpdate;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, warn};

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireHit {
    key: String,
    score: f64,
    value: Value,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct WireStats {
    entry_count: usize,
    total_size: usize,
    hits: u64,
    misses: u64,
    average_access_time_ms: f64,
    oldest_entry: Option<i64>,
    newest_entry: Option<i64>,
}

/// HTTP adapter for the remote tier.
pub struct HttpRemote {
    client: reqwest::Client,
    config: RemoteConfig,
    available: AtomicBool,
}

impl HttpRemote {
    /// Build the adapter. The endpoint comes from [`RemoteConfig`]; use
    /// [`RemoteConfig::from_env`] to avoid hard-coding credentials.
    pub fn new(config: RemoteConfig) -> Result<Self> {
        let mut headers = reqwest::header::HeaderMap::new();
        if let Some(key) = &config.api_key {
            let value = reqwest::header::HeaderValue::from_str(&format!("Bearer {key}"))
                .map_err(|_| StorageError::Validation("API key is not a valid header value".into()))?;
            headers.insert(reqwest::header::AUTHORIZATION, value);
        }
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .default_headers(headers)
            .build()?;
        Ok(Self {
            client,
            config,
            available: AtomicBool::new(true),
        })
    }

    /// Flip the availability flag (used by connectivity observers and tests).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.config.base_url.trim_end_matches('/'), path)
    }

    /// Mark unavailable on transport-level failures; anything else is a
    /// real error the caller should see.
    fn degrade(&self, operation: &str, e: reqwest::Error) -> StorageError {
        if e.is_connect() || e.is_timeout() {
            self.available.store(false, Ordering::SeqCst);
            warn!(operation, error = %e, "remote unreachable, marking unavailable");
        }
        StorageError::Network(e.to_string())
    }
}

#[async_trait]
impl StorageProvider for HttpRemote {
    fn name(&self) -> &'static str {
        "remote"
    }

    async fn init(&self) -> Result<()> {
        match self.client.get(self.url("v1/health")).send().await {
            Ok(resp) if resp.status().is_success() => {
                self.available.store(true, Ordering::SeqCst);
                debug!("remote health probe ok");
                Ok(())
            }
            Ok(resp) => {
                self.available.store(false, Ordering::SeqCst);
                warn!(status = %resp.status(), "remote health probe failed");
                Ok(())
            }
            Err(e) => {
                self.available.store(false, Ordering::SeqCst);
                warn!(error = %e, "remote unreachable at init");
                Ok(())
            }
        }
    }

    async fn destroy(&self) -> Result<()> {
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Value>> {
        if !self.is_available() {
            return Ok(None);
        }
        let resp = self
            .client
            .get(self.url(&format!("v1/records/{key}")))
            .send()
            .await
            .map_err(|e| self.degrade("get", e))?;
        match resp.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => Ok(Some(resp.json().await?)),
            status => Err(StorageError::provider(
                self.name(),
                "get",
                format!("unexpected status {status}"),
            )),
        }
    }

    async fn set(&self, key: &str, value: Value, options: Option<SetOptions>) -> Result<()> {
        if !self.is_available() {
            warn!(key, "remote unavailable, dropping write");
            return Ok(());
        }
        let mut body = serde_json::json!({ "value": value });
        if let Some(options) = options {
            if let Some(expires_at) = options.expires_at {
                body["expiresAt"] = expires_at.into();
            }
            if options.compress {
                body["compress"] = true.into();
            }
        }
        let resp = self
            .client
            .put(self.url(&format!("v1/records/{key}")))
            .json(&body)
            .send()
            .await
            .map_err(|e| self.degrade("set", e))?;
        if !resp.status().is_success() {
            return Err(StorageError::provider(
                self.name(),
                "set",
                format!("unexpected status {}", resp.status()),
            ));
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        if !self.is_available() {
            return Ok(false);
        }
        let resp = self
            .client
            .delete(self.url(&format!("v1/records/{key}")))
            .send()
            .await
            .map_err(|e| self.degrade("delete", e))?;
        match resp.status() {
            StatusCode::NOT_FOUND => Ok(false),
            status if status.is_success() => Ok(true),
            status => Err(StorageError::provider(
                self.name(),
                "delete",
                format!("unexpected status {status}"),
            )),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.get(key).await?.is_some())
    }

    async fn clear(&self) -> Result<()> {
        // The remote tier is the system of record; wholesale deletion is an
        // explicit administrative operation, not part of this contract.
        Err(StorageError::Validation(
            "clear is not supported on the remote tier".into(),
        ))
    }

    async fn list(&self, prefix: Option<&str>, limit: Option<usize>) -> Result<Vec<String>> {
        if !self.is_available() {
            return Ok(Vec::new());
        }
        let mut req = self.client.get(self.url("v1/records"));
        if let Some(prefix) = prefix {
            req = req.query(&[("prefix", prefix)]);
        }
        if let Some(limit) = limit {
            req = req.query(&[("limit", limit.to_string())]);
        }
        let resp = req.send().await.map_err(|e| self.degrade("list", e))?;
        if !resp.status().is_success() {
            return Err(StorageError::provider(
                self.name(),
                "list",
                format!("unexpected status {}", resp.status()),
            ));
        }
        Ok(resp.json().await?)
    }

    async fn search(&self, query: &SearchQuery) -> Result<Vec<SearchHit>> {
        if !self.is_available() {
            return Ok(Vec::new());
        }
        let body = serde_json::json!({
            "query": query.text,
            "agentId": query.agent_id,
            "limit": if query.limit == usize::MAX { None } else { Some(query.limit) },
        });
        let resp = self
            .client
            .post(self.url("v1/search"))
            .json(&body)
            .send()
            .await
            .map_err(|e| self.degrade("search", e))?;
        if !resp.status().is_success() {
            return Err(StorageError::provider(
                self.name(),
                "search",
                format!("unexpected status {}", resp.status()),
            ));
        }
        let hits: Vec<WireHit> = resp.json().await?;
        Ok(hits
            .into_iter()
            .map(|h| SearchHit {
                key: h.key,
                score: h.score,
                value: h.value,
            })
            .collect())
    }

    async fn stats(&self) -> Result<ProviderStats> {
        if !self.is_available() {
            return Ok(ProviderStats::default());
        }
        let resp = self
            .client
            .get(self.url("v1/stats"))
            .send()
            .await
            .map_err(|e| self.degrade("stats", e))?;
        if !resp.status().is_success() {
            return Ok(ProviderStats::default());
        }
        let wire: WireStats = resp.json().await.unwrap_or_default();
        Ok(ProviderStats {
            entry_count: wire.entry_count,
            total_size: wire.total_size,
            hits: wire.hits,
            misses: wire.misses,
            hit_rate: 0.0,
            average_access_time_ms: wire.average_access_time_ms,
            oldest_entry: wire.oldest_entry,
            newest_entry: wire.newest_entry,
        }
        .finalize())
    }

    fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    async fn changes_since(
        &self,
        agent_id: &str,
        since: Option<i64>,
    ) -> Result<Option<Vec<IncrementalUpdate>>> {
        if !self.is_available() {
            return Ok(None);
        }
        let mut req = self
            .client
            .get(self.url("v1/changes"))
            .query(&[("agentId", agent_id)]);
        if let Some(since) = since {
            req = req.query(&[("since", since.to_string())]);
        }
        let resp = req
            .send()
            .await
            .map_err(|e| self.degrade("changes_since", e))?;
        if !resp.status().is_success() {
            return Err(StorageError::provider(
                self.name(),
                "changes_since",
                format!("unexpected status {}", resp.status()),
            ));
        }
        Ok(Some(resp.json().await?))
    }
}
