//! Network gateway: the single chokepoint for remote calls.
//!
//! Every request to the CivicSweep service goes through `NetworkGateway::call`,
//! which attaches the bearer token, busts intermediary caches on reads, and
//! serves cached data when the network cannot.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use reqwest::Method;
use serde_json::Value;
use tracing::{debug, warn};

use super::transport::{HttpRequest, HttpResponse, Transport};
use super::ApiError;
use crate::auth::CredentialVault;
use crate::cache::{CacheRecord, ResponseCache};
use crate::connectivity::Connectivity;
use crate::events::{EventBus, SyncEvent};
use crate::store::{keys, KeyValueStore};

/// Query parameter appended to GET requests to defeat intermediary caches.
const CACHE_BUST_PARAM: &str = "_ts";

#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Cache key for GET results; enables cache population and fallback
    pub cache_key: Option<String>,
    /// Serve a cached result no older than this without calling out, even
    /// while online
    pub cache_max_age: Option<Duration>,
}

impl CallOptions {
    pub fn cached(key: impl Into<String>) -> Self {
        Self {
            cache_key: Some(key.into()),
            cache_max_age: None,
        }
    }

    pub fn max_age(mut self, max_age: Duration) -> Self {
        self.cache_max_age = Some(max_age);
        self
    }
}

/// Where a result came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataSource {
    Network,
    Cache,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Fetched {
    pub data: Value,
    pub source: DataSource,
    /// When the cached copy was stored (cache results only)
    pub cached_at: Option<DateTime<Utc>>,
}

impl Fetched {
    fn network(data: Value) -> Self {
        Self {
            data,
            source: DataSource::Network,
            cached_at: None,
        }
    }

    fn cache(record: CacheRecord) -> Self {
        Self {
            data: record.value,
            source: DataSource::Cache,
            cached_at: Some(record.timestamp),
        }
    }
}

pub struct NetworkGateway {
    transport: Arc<dyn Transport>,
    base_url: String,
    cache: Arc<ResponseCache>,
    vault: Arc<CredentialVault>,
    connectivity: Connectivity,
    events: EventBus,
    store: Arc<dyn KeyValueStore>,
}

impl NetworkGateway {
    pub fn new(
        transport: Arc<dyn Transport>,
        base_url: impl Into<String>,
        cache: Arc<ResponseCache>,
        vault: Arc<CredentialVault>,
        connectivity: Connectivity,
        events: EventBus,
        store: Arc<dyn KeyValueStore>,
    ) -> Self {
        Self {
            transport,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            cache,
            vault,
            connectivity,
            events,
            store,
        }
    }

    pub fn connectivity(&self) -> &Connectivity {
        &self.connectivity
    }

    /// Perform a remote call.
    ///
    /// GET calls with a cache key are answered from the cache (at any age)
    /// while offline, refresh the cache on success, and fall back to the
    /// cache (at any age) when the transport fails.
    pub async fn call(
        &self,
        path: &str,
        method: Method,
        body: Option<&Value>,
        options: &CallOptions,
    ) -> Result<Fetched, ApiError> {
        let cache_key = options.cache_key.as_deref().filter(|_| method == Method::GET);

        if let Some(key) = cache_key {
            if !self.connectivity.is_online() {
                if let Some(record) = self.cache.get_any(key) {
                    debug!(cache_key = key, "Offline, serving cached result");
                    return Ok(Fetched::cache(record));
                }
            } else if let Some(max_age) = options.cache_max_age {
                let fresh = self
                    .cache
                    .get_any(key)
                    .filter(|record| record.is_fresh(max_age, Utc::now()));
                if let Some(record) = fresh {
                    debug!(cache_key = key, "Serving fresh cached result");
                    return Ok(Fetched::cache(record));
                }
            }
        }

        let request = self.build_request(path, method, body);
        debug!(method = %request.method, path, "Remote call");

        self.events.publish(SyncEvent::ProgressStarted);
        let result = self.transport.send(request).await;
        self.events.publish(SyncEvent::ProgressStopped);

        match result.and_then(Self::parse_response) {
            Ok(data) => {
                if let Some(key) = cache_key {
                    if let Err(e) = self.cache.set(key, data.clone()) {
                        warn!(cache_key = key, error = %e, "Failed to cache response");
                    }
                }
                self.mark_synced();
                Ok(Fetched::network(data))
            }
            Err(ApiError::Network(message)) => {
                if let Some(record) = cache_key.and_then(|key| self.cache.get_any(key)) {
                    warn!(path, error = %message, "Network failed, serving cached result");
                    return Ok(Fetched::cache(record));
                }
                Err(ApiError::Network(message))
            }
            Err(e) => Err(e),
        }
    }

    fn build_request(&self, path: &str, method: Method, body: Option<&Value>) -> HttpRequest {
        let mut url = if path.starts_with('/') {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}/{}", self.base_url, path)
        };

        let mut headers = vec![("Accept".to_string(), "application/json".to_string())];
        if let Some(token) = self.vault.token() {
            headers.push(("Authorization".to_string(), format!("Bearer {}", token)));
        }

        if method == Method::GET {
            let separator = if url.contains('?') { '&' } else { '?' };
            url.push_str(&format!(
                "{}{}={}",
                separator,
                CACHE_BUST_PARAM,
                Utc::now().timestamp_millis()
            ));
            headers.push(("Cache-Control".to_string(), "no-store".to_string()));
            headers.push(("Pragma".to_string(), "no-cache".to_string()));
        }

        HttpRequest {
            method,
            url,
            headers,
            body: body.cloned(),
        }
    }

    fn parse_response(response: HttpResponse) -> Result<Value, ApiError> {
        if !response.is_success() {
            return Err(ApiError::from_status(response.status, &response.body));
        }
        if response.body.trim().is_empty() {
            return Ok(Value::Null);
        }
        match serde_json::from_str(&response.body) {
            Ok(value) => Ok(value),
            Err(e) => {
                debug!(error = %e, "Success response was not JSON");
                Ok(Value::Null)
            }
        }
    }

    fn mark_synced(&self) {
        if let Err(e) = self.store.set(keys::LAST_SYNC, &Utc::now().to_rfc3339()) {
            warn!(error = %e, "Failed to record last sync time");
        }
    }

    /// When a remote call last succeeded.
    pub fn last_sync(&self) -> Option<DateTime<Utc>> {
        self.store
            .get(keys::LAST_SYNC)
            .ok()
            .flatten()
            .and_then(|raw| DateTime::parse_from_rfc3339(&raw).ok())
            .map(|dt| dt.with_timezone(&Utc))
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{Role, Session};
    use crate::testing::Harness;
    use serde_json::json;

    #[tokio::test]
    async fn test_get_attaches_token_and_cache_busting() {
        let h = Harness::new(true);
        h.vault
            .activate(
                Session {
                    role: Role::User,
                    id: "u1".to_string(),
                    login_id: None,
                    name: String::new(),
                },
                "tok-123".to_string(),
            )
            .unwrap();
        h.transport.push_json(200, json!([{"id": 1}]));

        let fetched = h
            .gateway
            .call("/reports/mine?page=2", Method::GET, None, &CallOptions::default())
            .await
            .unwrap();
        assert_eq!(fetched.source, DataSource::Network);
        assert_eq!(fetched.data, json!([{"id": 1}]));

        let request = &h.transport.requests()[0];
        assert!(request.url.starts_with("http://test.local/api/reports/mine?page=2&_ts="));
        assert_eq!(request.header("authorization"), Some("Bearer tok-123"));
        assert_eq!(request.header("cache-control"), Some("no-store"));
    }

    #[tokio::test]
    async fn test_post_has_no_cache_busting_and_no_token_when_signed_out() {
        let h = Harness::new(true);
        h.transport.push_json(201, json!({"id": "r1"}));

        let body = json!({"a": 1});
        h.gateway
            .call("reports", Method::POST, Some(&body), &CallOptions::default())
            .await
            .unwrap();

        let request = &h.transport.requests()[0];
        assert_eq!(request.url, "http://test.local/api/reports");
        assert_eq!(request.header("authorization"), None);
        assert_eq!(request.header("cache-control"), None);
        assert_eq!(request.body, Some(body));
    }

    #[tokio::test]
    async fn test_success_populates_cache_and_last_sync() {
        let h = Harness::new(true);
        assert!(h.gateway.last_sync().is_none());
        h.transport.push_json(200, json!({"count": 3}));

        h.gateway
            .call("/stats", Method::GET, None, &CallOptions::cached("stats"))
            .await
            .unwrap();

        assert_eq!(h.cache.get("stats", None), Some(json!({"count": 3})));
        assert!(h.gateway.last_sync().is_some());
    }

    #[tokio::test]
    async fn test_offline_get_serves_stale_cache_without_calling_out() {
        let h = Harness::new(false);
        h.cache
            .set_at("stats", json!({"count": 1}), Utc::now() - Duration::days(3))
            .unwrap();

        let fetched = h
            .gateway
            .call("/stats", Method::GET, None, &CallOptions::cached("stats"))
            .await
            .unwrap();
        assert_eq!(fetched.source, DataSource::Cache);
        assert_eq!(fetched.data, json!({"count": 1}));
        assert!(h.transport.requests().is_empty());
    }

    #[tokio::test]
    async fn test_offline_get_without_cache_still_tries_network() {
        let h = Harness::new(false);
        h.transport.push_network_error();

        let result = h
            .gateway
            .call("/stats", Method::GET, None, &CallOptions::cached("stats"))
            .await;
        assert!(matches!(result, Err(ApiError::Network(_))));
        assert_eq!(h.transport.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_transport_failure_falls_back_to_cache() {
        let h = Harness::new(true);
        h.cache
            .set_at("stats", json!("old"), Utc::now() - Duration::hours(5))
            .unwrap();
        h.transport.push_network_error();

        let fetched = h
            .gateway
            .call("/stats", Method::GET, None, &CallOptions::cached("stats"))
            .await
            .unwrap();
        assert_eq!(fetched.source, DataSource::Cache);
        assert_eq!(fetched.data, json!("old"));
        assert!(fetched.cached_at.is_some());
        assert!(h.gateway.last_sync().is_none());
    }

    #[tokio::test]
    async fn test_remote_error_does_not_fall_back() {
        let h = Harness::new(true);
        h.cache.set("stats", json!("old")).unwrap();
        h.transport.push_json(403, json!({"error": "Admins only"}));

        let result = h
            .gateway
            .call("/stats", Method::GET, None, &CallOptions::cached("stats"))
            .await;
        assert_eq!(
            result,
            Err(ApiError::Remote {
                status: 403,
                message: "Admins only".to_string()
            })
        );
    }

    #[tokio::test]
    async fn test_read_through_max_age() {
        let h = Harness::new(true);
        h.cache
            .set_at("stats", json!("cached"), Utc::now() - Duration::minutes(2))
            .unwrap();

        let options = CallOptions::cached("stats").max_age(Duration::minutes(5));
        let fetched = h.gateway.call("/stats", Method::GET, None, &options).await.unwrap();
        assert_eq!(fetched.source, DataSource::Cache);
        assert!(h.transport.requests().is_empty());

        // Too old for the requested max age: goes to the network
        h.transport.push_json(200, json!("fresh"));
        let options = CallOptions::cached("stats").max_age(Duration::minutes(1));
        let fetched = h.gateway.call("/stats", Method::GET, None, &options).await.unwrap();
        assert_eq!(fetched.data, json!("fresh"));
        assert_eq!(h.transport.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_empty_and_non_json_success_bodies() {
        let h = Harness::new(true);
        h.transport.push_raw(204, "");
        h.transport.push_raw(200, "OK");

        let empty = h
            .gateway
            .call("/reports/status", Method::POST, None, &CallOptions::default())
            .await
            .unwrap();
        assert_eq!(empty.data, Value::Null);

        let text = h
            .gateway
            .call("/reports/status", Method::POST, None, &CallOptions::default())
            .await
            .unwrap();
        assert_eq!(text.data, Value::Null);
    }

    #[tokio::test]
    async fn test_progress_events_wrap_calls() {
        let h = Harness::new(true);
        let mut rx = h.events.subscribe();
        h.transport.push_network_error();

        let _ = h
            .gateway
            .call("/reports", Method::POST, None, &CallOptions::default())
            .await;

        assert_eq!(rx.recv().await.unwrap(), SyncEvent::ProgressStarted);
        assert_eq!(rx.recv().await.unwrap(), SyncEvent::ProgressStopped);
    }
}
