//! The sync engine context.
//!
//! `SyncEngine` owns one instance of every component and wires them over a
//! shared store, event bus and connectivity handle. Hosts construct it once,
//! call `start` inside a tokio runtime, and route all sign-in, submission
//! and query traffic through it.

use std::sync::{Arc, Mutex};

use anyhow::Result;
use reqwest::Method;
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::api::{ApiError, CallOptions, FailureKind, Fetched, HttpTransport, NetworkGateway, Transport};
use crate::auth::{ActiveSession, CredentialVault, OfflineGrant, OfflineRejection, Role, Session};
use crate::cache::ResponseCache;
use crate::config::Config;
use crate::connectivity::{Connectivity, ConnectivityMonitor};
use crate::events::{EventBus, SyncEvent};
use crate::queue::{FlushOutcome, PayloadError, QueueAction, QueueError, QueueItem, QueueStatus, RetryQueue};
use crate::store::{FileStore, KeyValueStore};

const LOGIN_PATH: &str = "/auth/login";

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("Session expired - sign in again")]
    Expired,

    #[error("Session token does not match the signed-in role")]
    RoleMismatch,

    #[error("Not signed in")]
    NotLoggedIn,

    #[error("Login id and password are required")]
    MissingCredentials,

    #[error("Login failed: {0}")]
    Rejected(ApiError),

    #[error("Offline sign-in unavailable: {0}")]
    Offline(#[from] OfflineRejection),

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

#[derive(Error, Debug)]
pub enum SubmitError {
    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Invalid(#[from] PayloadError),

    #[error(transparent)]
    Rejected(#[from] ApiError),

    #[error(transparent)]
    Queue(#[from] QueueError),
}

/// How a submitted action was handled.
#[derive(Debug, Clone, PartialEq)]
pub enum Submitted {
    /// Sent directly; carries the service response
    Sent(Value),
    /// Queued for replay
    Queued(QueueItem),
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
    token: String,
    session: Session,
}

pub struct SyncEngine {
    config: Config,
    cache: Arc<ResponseCache>,
    vault: Arc<CredentialVault>,
    connectivity: Connectivity,
    events: EventBus,
    gateway: Arc<NetworkGateway>,
    queue: Arc<RetryQueue>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SyncEngine {
    /// Wire up all components over `store` and `transport`. Persisted
    /// session slots and queued actions are restored.
    pub fn new(
        config: Config,
        store: Arc<dyn KeyValueStore>,
        transport: Arc<dyn Transport>,
        online: bool,
    ) -> Result<Self> {
        let cache = Arc::new(ResponseCache::with_max_age(store.clone(), config.cache_max_age()));
        let vault = Arc::new(CredentialVault::new(store.clone(), config.offline_skew()));
        vault.load()?;

        let connectivity = Connectivity::new(online);
        let events = EventBus::new();
        let gateway = Arc::new(NetworkGateway::new(
            transport,
            config.api_base_url.clone(),
            cache.clone(),
            vault.clone(),
            connectivity.clone(),
            events.clone(),
            store.clone(),
        ));
        let queue = RetryQueue::load(store, gateway.clone(), vault.clone(), events.clone())?;

        Ok(Self {
            config,
            cache,
            vault,
            connectivity,
            events,
            gateway,
            queue,
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Build an engine over the file store in the configured data directory
    /// and the HTTP transport.
    pub fn open(config: Config, online: bool) -> Result<Self> {
        let store = Arc::new(FileStore::new(config.data_dir()?)?);
        let transport = Arc::new(HttpTransport::new(config.request_timeout())?);
        Self::new(config, store, transport, online)
    }

    /// Spawn the queue driver and connectivity monitor. Must be called
    /// inside a tokio runtime.
    pub fn start(&self) {
        let driver = tokio::spawn(self.queue.clone().run());
        let monitor = ConnectivityMonitor::new(&self.connectivity, self.queue.clone()).spawn();
        self.tasks.lock().unwrap_or_else(|e| e.into_inner()).extend([driver, monitor]);

        if self.connectivity.is_online() {
            self.queue.schedule_flush();
        }
        self.queue.publish_status();
        info!(pending = self.queue.len(), online = self.connectivity.is_online(), "Sync engine started");
    }

    /// Stop background tasks. Queued actions stay persisted.
    pub fn shutdown(&self) {
        for task in self.tasks.lock().unwrap_or_else(|e| e.into_inner()).drain(..) {
            task.abort();
        }
        self.queue.cancel_timer();
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn cache(&self) -> &Arc<ResponseCache> {
        &self.cache
    }

    pub fn vault(&self) -> &Arc<CredentialVault> {
        &self.vault
    }

    pub fn gateway(&self) -> &Arc<NetworkGateway> {
        &self.gateway
    }

    pub fn queue(&self) -> &Arc<RetryQueue> {
        &self.queue
    }

    pub fn connectivity(&self) -> &Connectivity {
        &self.connectivity
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    /// Report platform connectivity. Returns whether this was a transition.
    pub fn set_online(&self, online: bool) -> bool {
        self.connectivity.set_online(online)
    }

    pub fn status(&self) -> QueueStatus {
        self.queue.status()
    }

    pub async fn flush(&self, force: bool) -> FlushOutcome {
        self.queue.flush(force).await
    }

    // =========================================================================
    // Authentication
    // =========================================================================

    /// Sign in against the service. When the service cannot be reached the
    /// remembered account for `(role, login_id)` is used instead, if its
    /// token is still valid. A rejection by the service is not retried
    /// offline.
    pub async fn login(&self, role: Role, login_id: &str, password: &str) -> Result<Session, AuthError> {
        let login_id = login_id.trim();
        if login_id.is_empty() || password.is_empty() {
            return Err(AuthError::MissingCredentials);
        }

        if !self.connectivity.is_online() {
            info!(%role, "Offline, using remembered account");
            return self.activate_grant(self.vault.find_offline_account(role, login_id)?);
        }

        let body = json!({ "role": role.as_str(), "loginId": login_id, "password": password });
        match self
            .gateway
            .call(LOGIN_PATH, Method::POST, Some(&body), &CallOptions::default())
            .await
        {
            Ok(fetched) => {
                let response: LoginResponse = serde_json::from_value(fetched.data)
                    .map_err(|e| AuthError::Rejected(ApiError::InvalidResponse(e.to_string())))?;
                self.vault
                    .remember_session(&response.session, &response.token, Some(login_id))?;
                self.vault.activate(response.session.clone(), response.token)?;
                info!(%role, "Login successful");
                Ok(response.session)
            }
            Err(e) if e.classify(self.connectivity.is_online()) == FailureKind::Network => {
                warn!(error = %e, "Service unreachable, trying offline sign-in");
                self.activate_grant(self.vault.find_offline_account(role, login_id)?)
            }
            Err(e) => {
                warn!(error = %e, "Login rejected");
                Err(AuthError::Rejected(e))
            }
        }
    }

    /// Continue as a remembered identity without contacting the service:
    /// the account under `key` if given, else whoever signed in last.
    pub fn login_offline(&self, key: Option<&str>) -> Result<Session, AuthError> {
        let grant = self.vault.resolve_offline_candidate(key)?;
        self.activate_grant(grant)
    }

    fn activate_grant(&self, grant: OfflineGrant) -> Result<Session, AuthError> {
        info!(key = %grant.account.key, via = ?grant.via, "Offline sign-in");
        let active = grant.account.into_active();
        self.vault.activate(active.session.clone(), active.token)?;
        Ok(active.session)
    }

    /// Re-check the persisted session at startup. An expired or mismatched
    /// session is cleared and reported.
    pub fn restore_session(&self) -> Option<Session> {
        let active = self.vault.current()?;
        match self.vault.check_token(&active) {
            Ok(()) => {
                info!(role = %active.session.role, "Session restored");
                Some(active.session)
            }
            Err(rejection) => {
                self.expire_session(rejection);
                None
            }
        }
    }

    /// Local validity check before authenticated work.
    pub fn ensure_session(&self) -> Result<ActiveSession, AuthError> {
        let active = self.vault.current().ok_or(AuthError::NotLoggedIn)?;
        self.vault
            .check_token(&active)
            .map_err(|rejection| self.expire_session(rejection))?;
        Ok(active)
    }

    fn expire_session(&self, rejection: OfflineRejection) -> AuthError {
        warn!(reason = rejection.reason(), "Session no longer valid");
        if let Err(e) = self.vault.logout() {
            warn!(error = %e, "Failed to clear expired session");
        }
        self.events.publish(SyncEvent::SessionExpired(rejection.to_string()));
        match rejection {
            OfflineRejection::Mismatch => AuthError::RoleMismatch,
            _ => AuthError::Expired,
        }
    }

    /// Sign out. Remembered accounts, the cache and the queue are kept.
    pub fn logout(&self) -> Result<(), AuthError> {
        self.vault.logout()?;
        Ok(())
    }

    // =========================================================================
    // Data
    // =========================================================================

    /// Perform a mutating action now if possible, else queue it. Actions are
    /// queued while anything is already queued so they replay in order.
    pub async fn submit(&self, action: QueueAction) -> Result<Submitted, SubmitError> {
        action.validate()?;
        self.ensure_session()?;

        if !self.connectivity.is_online() || !self.queue.is_empty() {
            return Ok(Submitted::Queued(self.queue.enqueue(action)?));
        }

        let body = action.payload_value();
        match self
            .gateway
            .call(action.endpoint(), Method::POST, Some(&body), &CallOptions::default())
            .await
        {
            Ok(fetched) => Ok(Submitted::Sent(fetched.data)),
            Err(e) if e.classify(self.connectivity.is_online()) == FailureKind::Network => {
                warn!(kind = %action.kind(), error = %e, "Send failed, queueing");
                Ok(Submitted::Queued(self.queue.enqueue(action)?))
            }
            Err(e) if e.is_unauthorized() => Err(self.expire_session(OfflineRejection::Expired).into()),
            Err(e) => Err(e.into()),
        }
    }

    /// GET through the gateway. With a cache key, results are cached and a
    /// copy younger than the configured max age is served without calling out.
    pub async fn fetch(&self, path: &str, cache_key: Option<&str>) -> Result<Fetched, ApiError> {
        let options = match cache_key {
            Some(key) => CallOptions::cached(key).max_age(self.cache.default_max_age()),
            None => CallOptions::default(),
        };
        self.gateway.call(path, Method::GET, None, &options).await
    }
}

impl Drop for SyncEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Lookup;
    use crate::queue::QueueKind;
    use crate::store::MemoryStore;
    use crate::testing::{token_expiring_in, ScriptedTransport, BASE_URL};
    use chrono::Utc;
    use std::time::Duration;

    fn create_engine(store: Arc<MemoryStore>, online: bool) -> (SyncEngine, Arc<ScriptedTransport>) {
        let transport = Arc::new(ScriptedTransport::default());
        let config = Config {
            api_base_url: BASE_URL.to_string(),
            ..Config::default()
        };
        let engine = SyncEngine::new(config, store, transport.clone(), online).unwrap();
        (engine, transport)
    }

    fn citizen(login_id: &str) -> Session {
        Session {
            role: Role::User,
            id: "u1".to_string(),
            login_id: Some(login_id.to_string()),
            name: "Asha".to_string(),
        }
    }

    fn report() -> QueueAction {
        QueueAction::from_parts(
            QueueKind::ReportCreate,
            json!({
                "reporterId": "u1",
                "category": "pothole",
                "description": "Deep pothole at junction",
                "latitude": 19.07,
                "longitude": 72.87
            }),
        )
        .unwrap()
    }

    fn sign_in(engine: &SyncEngine) {
        engine
            .vault()
            .activate(citizen("asha@example.com"), token_expiring_in(3600, Role::User))
            .unwrap();
    }

    #[tokio::test]
    async fn test_login_online_remembers_account() {
        let (engine, transport) = create_engine(Arc::new(MemoryStore::new()), true);
        let token = token_expiring_in(3600, Role::Vendor);
        transport.push_json(
            200,
            json!({
                "token": token,
                "session": {"role": "vendor", "id": "v9", "loginId": "vendor@x.org", "name": "Fix-It"}
            }),
        );

        let session = engine.login(Role::Vendor, " Vendor@X.org ", "pw").await.unwrap();
        assert_eq!(session.id, "v9");
        assert_eq!(engine.vault().token(), Some(token));

        let request = &transport.requests()[0];
        assert!(request.url.ends_with("/auth/login"));
        assert_eq!(request.body.as_ref().unwrap()["password"], "pw");
        assert_eq!(request.body.as_ref().unwrap()["role"], "vendor");

        let accounts = engine.vault().accounts();
        assert_eq!(accounts.len(), 1);
        assert_eq!(accounts[0].key, "vendor:vendor@x.org");
    }

    #[tokio::test]
    async fn test_login_falls_back_offline_on_network_failure() {
        let (engine, transport) = create_engine(Arc::new(MemoryStore::new()), true);
        engine
            .vault()
            .remember_session(&citizen("asha@example.com"), &token_expiring_in(3600, Role::User), None)
            .unwrap();
        transport.push_network_error();

        let session = engine.login(Role::User, "asha@example.com", "pw").await.unwrap();
        assert_eq!(session.id, "u1");
        assert!(engine.vault().has_session());
        assert_eq!(
            engine.vault().find_offline_account(Role::User, "asha@example.com").unwrap().via,
            Lookup::AccountKey
        );
    }

    #[tokio::test]
    async fn test_login_rejection_is_not_retried_offline() {
        let (engine, transport) = create_engine(Arc::new(MemoryStore::new()), true);
        engine
            .vault()
            .remember_session(&citizen("asha@example.com"), &token_expiring_in(3600, Role::User), None)
            .unwrap();
        transport.push_json(401, json!({"error": "Invalid credentials"}));

        let err = engine.login(Role::User, "asha@example.com", "wrong").await.unwrap_err();
        match err {
            AuthError::Rejected(e) => assert_eq!(e.to_string(), "Invalid credentials"),
            other => panic!("unexpected error {:?}", other),
        }
        assert!(!engine.vault().has_session());
    }

    #[tokio::test]
    async fn test_login_requires_credentials() {
        let (engine, _) = create_engine(Arc::new(MemoryStore::new()), true);
        assert!(matches!(
            engine.login(Role::User, "  ", "pw").await,
            Err(AuthError::MissingCredentials)
        ));
    }

    #[tokio::test]
    async fn test_offline_login_rejects_token_within_skew() {
        let (engine, transport) = create_engine(Arc::new(MemoryStore::new()), false);
        // Expires in 10s, inside the 60s skew
        engine
            .vault()
            .remember_session(&citizen("asha@example.com"), &token_expiring_in(10, Role::User), None)
            .unwrap();

        let err = engine.login(Role::User, "asha@example.com", "pw").await.unwrap_err();
        assert!(matches!(err, AuthError::Offline(OfflineRejection::Expired)));
        assert!(matches!(
            engine.login_offline(None),
            Err(AuthError::Offline(OfflineRejection::Expired))
        ));
        assert!(!engine.vault().has_session());
        assert!(transport.requests().is_empty());
    }

    #[tokio::test]
    async fn test_login_offline_uses_last_session() {
        let (engine, _) = create_engine(Arc::new(MemoryStore::new()), false);
        engine
            .vault()
            .remember_session(&citizen("asha@example.com"), &token_expiring_in(3600, Role::User), None)
            .unwrap();

        let session = engine.login_offline(None).unwrap();
        assert_eq!(session.login_id.as_deref(), Some("asha@example.com"));
        assert!(engine.vault().has_session());
    }

    #[tokio::test]
    async fn test_restore_session() {
        let store = Arc::new(MemoryStore::new());
        {
            let (engine, _) = create_engine(store.clone(), false);
            sign_in(&engine);
        }
        let (engine, _) = create_engine(store.clone(), false);
        assert_eq!(engine.restore_session().map(|s| s.id), Some("u1".to_string()));

        engine
            .vault()
            .activate(citizen("asha@example.com"), token_expiring_in(5, Role::User))
            .unwrap();
        let (engine, _) = create_engine(store, false);
        let mut rx = engine.subscribe();
        assert!(engine.restore_session().is_none());
        assert!(!engine.vault().has_session());
        assert!(matches!(rx.try_recv().unwrap(), SyncEvent::SessionExpired(_)));
    }

    #[tokio::test]
    async fn test_ensure_session_detects_role_mismatch() {
        let (engine, _) = create_engine(Arc::new(MemoryStore::new()), true);
        engine
            .vault()
            .activate(citizen("asha@example.com"), token_expiring_in(3600, Role::Admin))
            .unwrap();
        assert!(matches!(engine.ensure_session(), Err(AuthError::RoleMismatch)));
        assert!(matches!(engine.ensure_session(), Err(AuthError::NotLoggedIn)));
    }

    #[tokio::test]
    async fn test_submit_requires_session() {
        let (engine, _) = create_engine(Arc::new(MemoryStore::new()), true);
        assert!(matches!(
            engine.submit(report()).await,
            Err(SubmitError::Auth(AuthError::NotLoggedIn))
        ));
    }

    #[tokio::test]
    async fn test_submit_online_sends_directly() {
        let (engine, transport) = create_engine(Arc::new(MemoryStore::new()), true);
        sign_in(&engine);
        transport.push_json(201, json!({"id": "r42"}));

        let submitted = engine.submit(report()).await.unwrap();
        assert_eq!(submitted, Submitted::Sent(json!({"id": "r42"})));
        assert!(engine.queue().is_empty());
    }

    #[tokio::test]
    async fn test_submit_queues_on_network_failure() {
        let (engine, transport) = create_engine(Arc::new(MemoryStore::new()), true);
        sign_in(&engine);
        transport.push_network_error();

        let submitted = engine.submit(report()).await.unwrap();
        assert!(matches!(submitted, Submitted::Queued(_)));
        assert_eq!(engine.queue().len(), 1);

        // Later submissions queue behind it to preserve order
        let second = engine.submit(report()).await.unwrap();
        assert!(matches!(second, Submitted::Queued(_)));
        assert_eq!(engine.queue().len(), 2);
        assert_eq!(transport.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_submit_propagates_rejection() {
        let (engine, transport) = create_engine(Arc::new(MemoryStore::new()), true);
        sign_in(&engine);
        transport.push_json(422, json!({"error": "Photo is required"}));

        let err = engine.submit(report()).await.unwrap_err();
        assert!(matches!(err, SubmitError::Rejected(ApiError::Remote { status: 422, .. })));
        assert!(engine.queue().is_empty());
    }

    #[tokio::test]
    async fn test_submit_unauthorized_expires_session() {
        let (engine, transport) = create_engine(Arc::new(MemoryStore::new()), true);
        sign_in(&engine);
        transport.push_json(401, json!({"error": "jwt expired"}));

        let err = engine.submit(report()).await.unwrap_err();
        assert!(matches!(err, SubmitError::Auth(AuthError::Expired)));
        assert!(!engine.vault().has_session());
    }

    #[tokio::test]
    async fn test_offline_report_syncs_on_reconnect() {
        let (engine, transport) = create_engine(Arc::new(MemoryStore::new()), false);
        sign_in(&engine);
        engine.start();

        let submitted = engine.submit(report()).await.unwrap();
        assert!(matches!(submitted, Submitted::Queued(_)));
        assert!(engine.gateway().last_sync().is_none());

        transport.push_json(201, json!({"id": "r1"}));
        let before = Utc::now();
        assert!(engine.set_online(true));

        for _ in 0..100 {
            if engine.queue().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(engine.queue().is_empty());
        assert!(engine.gateway().last_sync().unwrap() >= before - chrono::Duration::seconds(1));
        assert_eq!(transport.requests().len(), 1);
        engine.shutdown();
    }

    #[tokio::test]
    async fn test_fetch_reads_through_cache() {
        let (engine, transport) = create_engine(Arc::new(MemoryStore::new()), true);
        transport.push_json(200, json!([{"id": "r1"}]));

        let first = engine.fetch("/reports/mine", Some("reports.mine")).await.unwrap();
        assert_eq!(first.source, crate::api::DataSource::Network);
        let second = engine.fetch("/reports/mine", Some("reports.mine")).await.unwrap();
        assert_eq!(second.source, crate::api::DataSource::Cache);
        assert_eq!(second.data, json!([{"id": "r1"}]));
        assert_eq!(transport.requests().len(), 1);
    }
}
