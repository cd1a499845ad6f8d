//! Bearer token claim inspection.
//!
//! Tokens are issued by the remote service and only read here: three
//! dot-separated segments whose middle segment is base64 JSON carrying an
//! `exp` claim (epoch seconds) and optionally a `role` claim. Nothing is
//! verified cryptographically; the claims only gate offline reuse.

use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use base64::Engine as _;
use chrono::{DateTime, Duration, TimeZone, Utc};
use serde_json::Value;

/// URL-safe alphabet, padding optional.
const CLAIMS_ENGINE: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TokenClaims {
    pub exp: Option<i64>,
    pub role: Option<String>,
}

impl TokenClaims {
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.exp.and_then(|exp| Utc.timestamp_opt(exp, 0).single())
    }
}

/// Decode the claims segment of `token`. Returns `None` if the token is not
/// three segments or the middle one is not base64 JSON.
pub fn decode_claims(token: &str) -> Option<TokenClaims> {
    let mut segments = token.trim().split('.');
    let (_header, payload, _signature) = (segments.next()?, segments.next()?, segments.next()?);
    if segments.next().is_some() {
        return None;
    }

    // Accept standard-alphabet encoders too
    let normalized = payload.replace('+', "-").replace('/', "_");
    let bytes = CLAIMS_ENGINE.decode(normalized.as_bytes()).ok()?;
    let claims: Value = serde_json::from_slice(&bytes).ok()?;
    let claims = claims.as_object()?;

    let exp = claims
        .get("exp")
        .and_then(|e| e.as_i64().or_else(|| e.as_f64().map(|f| f as i64)));
    let role = claims
        .get("role")
        .and_then(Value::as_str)
        .map(str::to_string);

    Some(TokenClaims { exp, role })
}

/// Whether `token` should be treated as expired at `now`.
///
/// The token counts as expired once `exp - skew` is at or before `now`.
/// Undecodable tokens and tokens without `exp` are always expired.
pub fn is_expired(token: &str, skew: Duration, now: DateTime<Utc>) -> bool {
    match decode_claims(token).and_then(|c| c.exp) {
        Some(exp) => exp - skew.num_seconds() <= now.timestamp(),
        None => true,
    }
}

/// Build an unsigned token carrying `claims`. Test helper.
#[cfg(test)]
pub(crate) fn encode_test_token(claims: &Value) -> String {
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
    let body = URL_SAFE_NO_PAD.encode(claims.to_string().as_bytes());
    format!("{}.{}.signature", header, body)
}
