//! Test doubles shared by the module tests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};
use futures::future::BoxFuture;
use serde_json::{json, Value};

use crate::api::{ApiError, HttpRequest, HttpResponse, NetworkGateway, Transport};
use crate::auth::token::encode_test_token;
use crate::auth::{CredentialVault, Role};
use crate::cache::ResponseCache;
use crate::connectivity::Connectivity;
use crate::events::EventBus;
use crate::queue::RetryQueue;
use crate::store::MemoryStore;

pub const BASE_URL: &str = "http://test.local/api";

/// Transport that replays scripted responses in order and records every
/// request. An unscripted request fails as a network error. With a latency
/// set, each response is held back that long on the tokio clock.
#[derive(Default)]
pub struct ScriptedTransport {
    responses: Mutex<VecDeque<Result<HttpResponse, ApiError>>>,
    requests: Mutex<Vec<HttpRequest>>,
    latency: Mutex<Option<StdDuration>>,
}

impl ScriptedTransport {
    pub fn push_raw(&self, status: u16, body: &str) {
        self.responses.lock().unwrap().push_back(Ok(HttpResponse {
            status,
            body: body.to_string(),
        }));
    }

    pub fn push_json(&self, status: u16, body: Value) {
        self.push_raw(status, &body.to_string());
    }

    pub fn push_network_error(&self) {
        self.responses
            .lock()
            .unwrap()
            .push_back(Err(ApiError::Network("connection refused".to_string())));
    }

    pub fn set_latency(&self, latency: StdDuration) {
        *self.latency.lock().unwrap() = Some(latency);
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().unwrap().clone()
    }
}

impl Transport for ScriptedTransport {
    fn send(&self, request: HttpRequest) -> BoxFuture<'_, Result<HttpResponse, ApiError>> {
        self.requests.lock().unwrap().push(request);
        let response = self
            .responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(ApiError::Network("no scripted response".to_string())));
        let latency = *self.latency.lock().unwrap();
        Box::pin(async move {
            if let Some(latency) = latency {
                tokio::time::sleep(latency).await;
            }
            response
        })
    }
}

/// A fully wired set of components over an in-memory store.
pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub transport: Arc<ScriptedTransport>,
    pub cache: Arc<ResponseCache>,
    pub vault: Arc<CredentialVault>,
    pub connectivity: Connectivity,
    pub events: EventBus,
    pub gateway: Arc<NetworkGateway>,
    pub queue: Arc<RetryQueue>,
}

impl Harness {
    pub fn new(online: bool) -> Self {
        let store = Arc::new(MemoryStore::new());
        let transport = Arc::new(ScriptedTransport::default());
        let cache = Arc::new(ResponseCache::new(store.clone()));
        let vault = Arc::new(CredentialVault::new(store.clone(), Duration::seconds(60)));
        let connectivity = Connectivity::new(online);
        let events = EventBus::new();
        let gateway = Arc::new(NetworkGateway::new(
            transport.clone(),
            BASE_URL,
            cache.clone(),
            vault.clone(),
            connectivity.clone(),
            events.clone(),
            store.clone(),
        ));
        let queue = RetryQueue::load(store.clone(), gateway.clone(), vault.clone(), events.clone()).unwrap();
        Self {
            store,
            transport,
            cache,
            vault,
            connectivity,
            events,
            gateway,
            queue,
        }
    }
}

/// A token for `role` expiring `secs` from now.
pub fn token_expiring_in(secs: i64, role: Role) -> String {
    encode_test_token(&json!({ "exp": Utc::now().timestamp() + secs, "role": role.as_str() }))
}
