//! Authentication state and offline login.
//!
//! This module provides:
//! - `Session` / `Account`: the signed-in identity and remembered identities
//! - `CredentialVault`: current token/session slots plus the bounded
//!   most-recently-used account list used for offline login
//! - `token`: bearer token claim decoding and expiry checks
//!
//! Offline login never renews a token; it only lets a still-valid token keep
//! working while the remote service is unreachable.

pub mod session;
pub mod token;
pub mod vault;

pub use session::{account_key, Account, ActiveSession, Role, Session};
pub use vault::{CredentialVault, Lookup, OfflineGrant, OfflineRejection};
