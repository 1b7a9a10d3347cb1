//! Token infrastructure - signing keys, signature verification and the
//! validated [`Token`] value
//!
//! ```text
//! ┌──────────────────────────────┐
//! │        TokenValidator        │  parse + verify + expiry
//! └──────────────┬───────────────┘
//!                │ resolve(kid)
//! ┌──────────────▼───────────────┐
//! │            KeySet            │  kid -> [SigningKey]
//! └──────────────┬───────────────┘
//!                │ get_or_fetch(project id)
//! ┌──────────────▼───────────────┐
//! │      SingleFlightCache       │  one in-flight fetch per project
//! └──────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - `keys` - key-set fetch, RSA key construction and kid lookup
//! - `validator` - signature and expiry validation

pub mod keys;
pub mod validator;

pub use keys::{KeyDescriptor, KeySet, SigningKey};
pub use validator::{Clock, SystemClock, TokenValidator};

use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde_json::{Map, Value};

use crate::error::{AuthError, AuthResult};

/// Claim holding tenant-scoped authorization data
pub const TENANTS_CLAIM: &str = "tenants";
/// Claim holding permissions (top level or per tenant)
pub const PERMISSIONS_CLAIM: &str = "permissions";
/// Claim holding roles (top level or per tenant)
pub const ROLES_CLAIM: &str = "roles";
/// Claim holding the tenant selected for the session
pub const CURRENT_TENANT_CLAIM: &str = "dct";

/// A signature-verified token
///
/// `subject_id` and `issuer_project_id` are derived from `sub`/`iss` when the
/// token is validated and never change afterwards. `claims` holds every
/// payload claim in the order it appeared.
#[derive(Clone, PartialEq)]
pub struct Token {
    raw: String,
    subject_id: String,
    issuer_project_id: String,
    expiration: SystemTime,
    claims: Map<String, Value>,
    refresh_expiration: Option<SystemTime>,
}

// Manual Debug impl to keep the encoded token out of logs
impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Token")
            .field("raw", &"[REDACTED]")
            .field("subject_id", &self.subject_id)
            .field("issuer_project_id", &self.issuer_project_id)
            .field("expiration", &self.expiration)
            .field("claims", &self.claims.keys().collect::<Vec<_>>())
            .field("refresh_expiration", &self.refresh_expiration)
            .finish()
    }
}

impl Token {
    /// Build a token from an already-verified payload.
    ///
    /// # Errors
    ///
    /// Returns an invalid-token error when `exp` or `sub` is missing or
    /// malformed.
    pub(crate) fn from_verified_claims(raw: &str, claims: Map<String, Value>) -> AuthResult<Self> {
        let expiration = expiration_from_claims(&claims)?;

        let subject_id = claims
            .get("sub")
            .and_then(Value::as_str)
            .filter(|sub| !sub.is_empty())
            .ok_or_else(|| AuthError::invalid_token("token has no subject claim"))?
            .to_string();

        let issuer_project_id = claims
            .get("iss")
            .and_then(Value::as_str)
            .map(project_id_from_issuer)
            .unwrap_or_default();

        Ok(Self {
            raw: raw.to_string(),
            subject_id,
            issuer_project_id,
            expiration,
            claims,
            refresh_expiration: None,
        })
    }

    /// Attach the expiration of the refresh token this token was issued with
    #[must_use]
    pub fn with_refresh_expiration(mut self, refresh_expiration: SystemTime) -> Self {
        self.refresh_expiration = Some(refresh_expiration);
        self
    }

    /// The encoded token exactly as received
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// Subject (`sub`) - the user or access key id
    pub fn subject_id(&self) -> &str {
        &self.subject_id
    }

    /// Project id taken from the issuer (`iss`)
    pub fn issuer_project_id(&self) -> &str {
        &self.issuer_project_id
    }

    /// Expiration (`exp`)
    pub fn expiration(&self) -> SystemTime {
        self.expiration
    }

    /// Expiration of the associated refresh token, when known
    pub fn refresh_expiration(&self) -> Option<SystemTime> {
        self.refresh_expiration
    }

    pub fn has_refresh_expiration(&self) -> bool {
        self.refresh_expiration.is_some()
    }

    /// Every claim in the payload
    pub fn claims(&self) -> &Map<String, Value> {
        &self.claims
    }

    /// A single claim by name
    pub fn claim(&self, name: &str) -> Option<&Value> {
        self.claims.get(name)
    }

    /// Tenant ids present in the `tenants` claim
    pub fn tenant_ids(&self) -> Vec<String> {
        self.claims
            .get(TENANTS_CLAIM)
            .and_then(Value::as_object)
            .map(|tenants| tenants.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Tenant selected for this session (`dct`), if any
    pub fn current_tenant(&self) -> Option<&str> {
        self.claims.get(CURRENT_TENANT_CLAIM).and_then(Value::as_str)
    }

    /// Whether `exp` lies before `now`, ignoring clock skew
    pub fn is_expired_at(&self, now: SystemTime) -> bool {
        self.expiration < now
    }

    /// Seconds until expiration, zero once expired
    pub fn expires_in(&self, now: SystemTime) -> Duration {
        self.expiration.duration_since(now).unwrap_or_default()
    }
}

/// Read `exp` as a NumericDate.
///
/// Fractional seconds are truncated. Values that are negative, not numeric or
/// beyond what `SystemTime` can represent are rejected.
pub(crate) fn expiration_from_claims(claims: &Map<String, Value>) -> AuthResult<SystemTime> {
    let exp = claims
        .get("exp")
        .ok_or_else(|| AuthError::invalid_token("token has no expiration claim"))?;

    let seconds = match exp.as_u64() {
        Some(seconds) => Duration::from_secs(seconds),
        None => exp
            .as_f64()
            .filter(|seconds| seconds.is_finite() && *seconds >= 0.0)
            .and_then(|seconds| Duration::try_from_secs_f64(seconds.floor()).ok())
            .ok_or_else(|| AuthError::invalid_token("malformed expiration claim"))?,
    };

    UNIX_EPOCH
        .checked_add(seconds)
        .ok_or_else(|| AuthError::invalid_token("expiration out of range"))
}

/// The issuer is either the bare project id or a URL ending in it
fn project_id_from_issuer(issuer: &str) -> String {
    issuer
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or(issuer)
        .to_string()
}
