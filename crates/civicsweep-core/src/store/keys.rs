//! Storage key namespace.
//!
//! Each component owns a disjoint subset of these keys.

/// Current bearer token (vault).
pub const TOKEN: &str = "cs.token";
/// Current session (vault).
pub const SESSION: &str = "cs.session";
/// Remembered accounts, most recent first (vault).
pub const ACCOUNTS: &str = "cs.accounts";

// Legacy single-slot fallback written alongside the account list.
pub const LAST_SESSION: &str = "cs.last_session";
pub const LAST_TOKEN: &str = "cs.last_token";
pub const LAST_LOGIN_ID: &str = "cs.last_login_id";
pub const LAST_LOGIN_AT: &str = "cs.last_login_at";

/// Pending retry queue items (queue).
pub const QUEUE: &str = "cs.queue";
/// Cache key to record map (cache).
pub const CACHE: &str = "cs.cache";
/// Last successful remote call (gateway).
pub const LAST_SYNC: &str = "cs.last_sync";
