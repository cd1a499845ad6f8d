use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::session::{account_key, normalize_login_id, Account, ActiveSession, Role, Session};
use super::token;
use crate::store::{keys, load_json, save_json, KeyValueStore};

/// Maximum number of remembered accounts.
pub const MAX_ACCOUNTS: usize = 5;

/// Safety margin subtracted from a token's `exp` before it is trusted offline.
pub const DEFAULT_SKEW_SECS: i64 = 60;

/// Why an offline login was refused.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfflineRejection {
    #[error("No saved session is available for offline use")]
    None,

    #[error("Saved session has expired - connect to sign in again")]
    Expired,

    #[error("Saved token does not match the saved session role")]
    Mismatch,

    #[error("Role and login id are required")]
    Missing,

    #[error("No saved account for this login")]
    NotFound,
}

impl OfflineRejection {
    /// Stable short code for logs and status display.
    pub fn reason(&self) -> &'static str {
        match self {
            OfflineRejection::None => "none",
            OfflineRejection::Expired => "expired",
            OfflineRejection::Mismatch => "mismatch",
            OfflineRejection::Missing => "missing",
            OfflineRejection::NotFound => "not_found",
        }
    }
}

/// Named places an offline identity can be recovered from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lookup {
    /// Remembered account list, by exact `role:loginId` key
    AccountKey,
    /// Legacy single slot, whoever signed in last
    LastSession,
    /// Legacy single slot, only if role and login id match exactly
    LegacySlot,
}

/// Fallback order for restoring "whoever was here last".
pub const CANDIDATE_LOOKUPS: [Lookup; 2] = [Lookup::AccountKey, Lookup::LastSession];

/// Fallback order for signing in a specific identity offline.
pub const ACCOUNT_LOOKUPS: [Lookup; 2] = [Lookup::AccountKey, Lookup::LegacySlot];

/// An account cleared for offline use, and where it was found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OfflineGrant {
    pub account: Account,
    pub via: Lookup,
}

#[derive(Debug, Default)]
struct Query {
    key: Option<String>,
    role: Option<Role>,
    login_id: Option<String>,
}

/// Stores the current token and session plus the remembered accounts that
/// make offline login possible.
pub struct CredentialVault {
    store: Arc<dyn KeyValueStore>,
    skew: Duration,
    current: RwLock<Option<ActiveSession>>,
}

impl CredentialVault {
    pub fn new(store: Arc<dyn KeyValueStore>, skew: Duration) -> Self {
        Self {
            store,
            skew,
            current: RwLock::new(None),
        }
    }

    fn read_current(&self) -> RwLockReadGuard<'_, Option<ActiveSession>> {
        self.current.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_current(&self) -> RwLockWriteGuard<'_, Option<ActiveSession>> {
        self.current.write().unwrap_or_else(|e| e.into_inner())
    }

    // =========================================================================
    // Current session
    // =========================================================================

    /// Restore the current session slots from the store. Returns whether a
    /// session was found. Validity is not checked here.
    pub fn load(&self) -> Result<bool> {
        let token = self.store.get(keys::TOKEN)?;
        let session: Option<Session> = load_json(self.store.as_ref(), keys::SESSION)?;
        let restored = match (session, token) {
            (Some(session), Some(token)) if !token.is_empty() => Some(ActiveSession { session, token }),
            _ => None,
        };
        let found = restored.is_some();
        *self.write_current() = restored;
        debug!(found, "Current session slots loaded");
        Ok(found)
    }

    /// Make `session` the current session and persist it.
    pub fn activate(&self, session: Session, token: String) -> Result<()> {
        self.store
            .set(keys::TOKEN, &token)
            .context("Failed to save current token")?;
        save_json(self.store.as_ref(), keys::SESSION, &session).context("Failed to save current session")?;
        info!(role = %session.role, id = %session.id, "Session activated");
        *self.write_current() = Some(ActiveSession { session, token });
        Ok(())
    }

    pub fn current(&self) -> Option<ActiveSession> {
        self.read_current().clone()
    }

    /// Bearer token for authenticated calls, if signed in
    pub fn token(&self) -> Option<String> {
        self.read_current().as_ref().map(|a| a.token.clone())
    }

    pub fn has_session(&self) -> bool {
        self.read_current().is_some()
    }

    /// Clear the current session. Remembered accounts are kept so the same
    /// identity can sign back in offline.
    pub fn logout(&self) -> Result<()> {
        *self.write_current() = None;
        self.store.remove(keys::TOKEN)?;
        self.store.remove(keys::SESSION)?;
        info!("Session cleared");
        Ok(())
    }

    /// Check a session's token locally: expiry (with skew) first, then that
    /// the token's role claim agrees with the session.
    pub fn check_token(&self, active: &ActiveSession) -> Result<(), OfflineRejection> {
        self.check_token_at(&active.token, active.session.role, Utc::now())
    }

    fn check_token_at(&self, token: &str, role: Role, now: DateTime<Utc>) -> Result<(), OfflineRejection> {
        if token::is_expired(token, self.skew, now) {
            return Err(OfflineRejection::Expired);
        }
        let claimed = token::decode_claims(token).and_then(|c| c.role);
        if let Some(claimed) = claimed {
            if claimed.parse::<Role>().ok() != Some(role) {
                return Err(OfflineRejection::Mismatch);
            }
        }
        Ok(())
    }

    // =========================================================================
    // Remembered accounts
    // =========================================================================

    /// Remembered accounts, most recently used first.
    pub fn accounts(&self) -> Vec<Account> {
        match load_json::<Vec<Account>>(self.store.as_ref(), keys::ACCOUNTS) {
            Ok(accounts) => accounts.unwrap_or_default(),
            Err(e) => {
                warn!(error = %e, "Failed to load remembered accounts");
                Vec::new()
            }
        }
    }

    fn save_accounts(&self, accounts: &[Account]) -> Result<()> {
        save_json(self.store.as_ref(), keys::ACCOUNTS, accounts).context("Failed to save remembered accounts")
    }

    /// Record a successful online login. The account moves to the front of
    /// the list, the list is truncated to `MAX_ACCOUNTS`, and the legacy
    /// last-session slot is overwritten.
    pub fn remember_session(&self, session: &Session, token: &str, identifier: Option<&str>) -> Result<Account> {
        let login_id = identifier
            .filter(|id| !id.trim().is_empty())
            .or(session.login_id.as_deref().filter(|id| !id.trim().is_empty()))
            .unwrap_or(session.id.as_str());
        let login_id = normalize_login_id(login_id);

        let account = Account {
            key: account_key(session.role, &login_id),
            role: session.role,
            login_id,
            name: session.name.clone(),
            session: session.clone(),
            token: token.to_string(),
            last_login_at: Utc::now(),
        };

        let mut accounts = self.accounts();
        accounts.retain(|a| a.key != account.key);
        accounts.insert(0, account.clone());
        accounts.truncate(MAX_ACCOUNTS);
        self.save_accounts(&accounts)?;

        self.save_legacy_slot(&account)?;
        info!(key = %account.key, remembered = accounts.len(), "Account remembered");
        Ok(account)
    }

    /// Drop one remembered account. Returns whether it existed.
    pub fn forget(&self, key: &str) -> Result<bool> {
        let key = key.trim().to_lowercase();
        let mut accounts = self.accounts();
        let before = accounts.len();
        accounts.retain(|a| a.key != key);
        if accounts.len() == before {
            return Ok(false);
        }
        self.save_accounts(&accounts)?;
        Ok(true)
    }

    fn save_legacy_slot(&self, account: &Account) -> Result<()> {
        save_json(self.store.as_ref(), keys::LAST_SESSION, &account.session)?;
        self.store.set(keys::LAST_TOKEN, &account.token)?;
        self.store.set(keys::LAST_LOGIN_ID, &account.login_id)?;
        self.store.set(keys::LAST_LOGIN_AT, &account.last_login_at.to_rfc3339())?;
        Ok(())
    }

    fn legacy_slot(&self) -> Result<Option<Account>> {
        let session: Option<Session> = load_json(self.store.as_ref(), keys::LAST_SESSION)?;
        let token = self.store.get(keys::LAST_TOKEN)?;
        let (session, token) = match (session, token) {
            (Some(session), Some(token)) if !token.is_empty() => (session, token),
            _ => return Ok(None),
        };

        let login_id = self
            .store
            .get(keys::LAST_LOGIN_ID)?
            .or_else(|| session.login_id.clone())
            .unwrap_or_else(|| session.id.clone());
        let login_id = normalize_login_id(&login_id);
        let last_login_at = self
            .store
            .get(keys::LAST_LOGIN_AT)?
            .and_then(|raw| DateTime::parse_from_rfc3339(&raw).ok())
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_default();

        Ok(Some(Account {
            key: account_key(session.role, &login_id),
            role: session.role,
            login_id,
            name: session.name.clone(),
            session,
            token,
            last_login_at,
        }))
    }

    // =========================================================================
    // Offline resolution
    // =========================================================================

    fn lookup(&self, lookup: Lookup, query: &Query) -> Option<Account> {
        let found = match lookup {
            Lookup::AccountKey => {
                let key = query.key.as_deref()?.trim().to_lowercase();
                self.accounts().into_iter().find(|a| a.key == key)
            }
            Lookup::LastSession => self.legacy_slot().unwrap_or_else(|e| {
                warn!(error = %e, "Failed to read last-session slot");
                None
            }),
            Lookup::LegacySlot => {
                let role = query.role?;
                let login_id = normalize_login_id(query.login_id.as_deref()?);
                self.legacy_slot()
                    .unwrap_or_else(|e| {
                        warn!(error = %e, "Failed to read last-session slot");
                        None
                    })
                    .filter(|a| a.role == role && a.login_id == login_id)
            }
        };
        debug!(?lookup, found = found.is_some(), "Offline lookup");
        found
    }

    /// Find whoever can continue offline: the account under `key` if given,
    /// else the last session.
    pub fn resolve_offline_candidate(&self, key: Option<&str>) -> Result<OfflineGrant, OfflineRejection> {
        self.resolve_offline_candidate_at(key, Utc::now())
    }

    pub(crate) fn resolve_offline_candidate_at(
        &self,
        key: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<OfflineGrant, OfflineRejection> {
        let query = Query {
            key: key.filter(|k| !k.trim().is_empty()).map(str::to_string),
            ..Query::default()
        };
        let (account, via) = CANDIDATE_LOOKUPS
            .iter()
            .find_map(|&lookup| self.lookup(lookup, &query).map(|a| (a, lookup)))
            .ok_or(OfflineRejection::None)?;

        self.check_token_at(&account.token, account.session.role, now)?;
        Ok(OfflineGrant { account, via })
    }

    /// Find a specific identity for offline sign-in.
    pub fn find_offline_account(&self, role: Role, login_id: &str) -> Result<OfflineGrant, OfflineRejection> {
        self.find_offline_account_at(role, login_id, Utc::now())
    }

    pub(crate) fn find_offline_account_at(
        &self,
        role: Role,
        login_id: &str,
        now: DateTime<Utc>,
    ) -> Result<OfflineGrant, OfflineRejection> {
        if login_id.trim().is_empty() {
            return Err(OfflineRejection::Missing);
        }
        let query = Query {
            key: Some(account_key(role, login_id)),
            role: Some(role),
            login_id: Some(login_id.to_string()),
        };
        let (account, via) = ACCOUNT_LOOKUPS
            .iter()
            .find_map(|&lookup| self.lookup(lookup, &query).map(|a| (a, lookup)))
            .ok_or(OfflineRejection::NotFound)?;

        if token::is_expired(&account.token, self.skew, now) {
            return Err(OfflineRejection::Expired);
        }
        Ok(OfflineGrant { account, via })
    }
}

// ============================================================================
// Tests
// ============================================================================
