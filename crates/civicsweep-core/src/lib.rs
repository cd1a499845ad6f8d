//! CivicSweep offline sync engine.
//!
//! This crate keeps the CivicSweep report workflow usable while the device
//! drifts in and out of connectivity. It provides:
//!
//! - `store`: the durable key-value substrate every other component writes to
//! - `cache`: a TTL-bounded read cache for remote query results
//! - `auth`: the credential vault and offline login fallback
//! - `api`: the network gateway all remote calls go through
//! - `queue`: the durable, ordered retry queue for mutating actions
//! - `connectivity`: online/offline tracking and reconnect flushes
//! - `events`: the broadcast channel the UI listens on
//! - `config`: persisted engine settings
//! - `engine`: the context object that wires everything together

pub mod api;
pub mod auth;
pub mod cache;
pub mod config;
pub mod connectivity;
pub mod engine;
pub mod events;
pub mod queue;
pub mod store;

#[cfg(test)]
pub(crate) mod testing;

pub use api::{ApiError, CallOptions, DataSource, Fetched, HttpTransport, NetworkGateway, Transport};
pub use auth::{Account, CredentialVault, OfflineGrant, OfflineRejection, Role, Session};
pub use cache::{CacheRecord, ResponseCache};
pub use config::Config;
pub use connectivity::{Connectivity, ConnectivityMonitor};
pub use engine::{AuthError, SubmitError, Submitted, SyncEngine};
pub use events::{EventBus, SyncEvent};
pub use queue::{FlushOutcome, QueueAction, QueueError, QueueItem, QueueKind, QueueStatus, RetryQueue};
pub use store::{FileStore, KeyValueStore, MemoryStore};
