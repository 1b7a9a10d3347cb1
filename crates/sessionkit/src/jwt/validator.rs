//! Signature and expiry validation
//!
//! Issuer and audience are not enforced: the identity provider is the only
//! issuer this client talks to. What is enforced:
//!
//! - the token is a well-formed signed JWT using an RSA algorithm
//! - its header `kid` resolves to a published key whose algorithm matches
//! - the signature verifies against one of those keys
//! - `exp` is present and not older than `now - clock_skew`
//!
//! Errors from `jsonwebtoken` stay inside this module. Callers only ever see
//! [`AuthError::TokenValidation`] with a short description, or a key fetch
//! failure (`KeyResolution`, `Timeout`, `Cancelled`) when the keys could not be
//! obtained at all.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use jsonwebtoken::{Validation, decode, decode_header};
use serde_json::{Map, Value};
use tracing::debug;

use super::{Token, expiration_from_claims};
use super::keys::{KeySet, is_rsa_family};
use crate::error::{AuthError, AuthResult, ErrorCode};

/// Default tolerance applied to `exp`
pub const DEFAULT_CLOCK_SKEW: Duration = Duration::from_secs(5);

/// Source of the current time for expiry checks
pub trait Clock: Send + Sync + fmt::Debug {
    fn now(&self) -> SystemTime;
}

/// Wall-clock time
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}

/// A token is expired once `now` is strictly past `exp + skew`
fn check_expiry(expiration: SystemTime, now: SystemTime, skew: Duration) -> AuthResult<()> {
    let deadline = expiration
        .checked_add(skew)
        .ok_or_else(|| AuthError::invalid_token("expiration out of range"))?;
    if now > deadline {
        return Err(AuthError::invalid_token("token has expired"));
    }
    Ok(())
}

/// Validates encoded tokens against a project's [`KeySet`]
///
/// # Example
///
/// ```rust,no_run
/// # use std::sync::Arc;
/// # use sessionkit::jwt::{KeySet, TokenValidator};
/// # async fn example(keys: Arc<KeySet>) -> Result<(), sessionkit::AuthError> {
/// let validator = TokenValidator::new(keys);
/// let token = validator.validate("eyJhbGciOiJSUzI1NiIsImtpZCI6...").await?;
/// println!("session for {}", token.subject_id());
/// # Ok(())
/// # }
/// ```
pub struct TokenValidator {
    keys: Arc<KeySet>,
    clock_skew: Duration,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for TokenValidator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenValidator")
            .field("keys", &self.keys)
            .field("clock_skew", &self.clock_skew)
            .field("clock", &self.clock)
            .finish()
    }
}

impl TokenValidator {
    /// Create a validator with the default 5 second skew and the system clock
    pub fn new(keys: Arc<KeySet>) -> Self {
        Self {
            keys,
            clock_skew: DEFAULT_CLOCK_SKEW,
            clock: Arc::new(SystemClock),
        }
    }

    /// Set the tolerance applied to `exp`
    pub fn with_clock_skew(mut self, skew: Duration) -> Self {
        self.clock_skew = skew;
        self
    }

    /// Replace the time source (tests pin it to a fixed instant)
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Key set this validator resolves signing keys from
    pub fn key_set(&self) -> &Arc<KeySet> {
        &self.keys
    }

    pub fn clock_skew(&self) -> Duration {
        self.clock_skew
    }

    /// Validate an encoded token and return its claims.
    ///
    /// The first call fetches the project's key set; concurrent first calls
    /// share that fetch.
    ///
    /// # Errors
    ///
    /// - `TokenValidation(InvalidToken)` for malformed tokens, unknown key
    ///   ids, bad signatures, missing or past expiration
    /// - `KeyResolution`, `Timeout` or `Cancelled` when the key set could not
    ///   be fetched
    pub async fn validate(&self, raw: &str) -> AuthResult<Token> {
        if raw.is_empty() {
            return Err(AuthError::invalid_token("token is empty"));
        }

        let header = decode_header(raw).map_err(|e| {
            debug!(error = %e, "Failed to decode token header");
            AuthError::invalid_token("token is not a well-formed signed token")
        })?;

        if !is_rsa_family(header.alg) {
            debug!(algorithm = ?header.alg, "Rejecting token with non-RSA algorithm");
            return Err(AuthError::invalid_token(format!(
                "algorithm {:?} is not accepted",
                header.alg
            )));
        }

        let kid = header
            .kid
            .filter(|kid| !kid.is_empty())
            .ok_or_else(|| AuthError::invalid_token("token header has no key id"))?;

        let candidates = self
            .keys
            .resolve(&kid)
            .await
            .map_err(|e| e.retag_validation(ErrorCode::InvalidToken))?;

        let mut validation = Validation::new(header.alg);
        validation.validate_exp = false;
        validation.validate_nbf = false;
        validation.validate_aud = false;
        validation.required_spec_claims = HashSet::new();

        let mut verified = None;
        for key in candidates.iter().filter(|key| key.algorithm() == header.alg) {
            match decode::<Map<String, Value>>(raw, key.decoding_key(), &validation) {
                Ok(data) => {
                    verified = Some(data.claims);
                    break;
                }
                Err(e) => {
                    debug!(kid = %kid, error = %e, "Signature did not verify against candidate key");
                }
            }
        }
        let claims =
            verified.ok_or_else(|| AuthError::invalid_token("signature verification failed"))?;

        let expiration = expiration_from_claims(&claims)?;
        check_expiry(expiration, self.clock.now(), self.clock_skew)?;

        let token = Token::from_verified_claims(raw, claims)?;
        debug!(
            subject = %token.subject_id(),
            project_id = %token.issuer_project_id(),
            kid = %kid,
            "Token validated"
        );
        Ok(token)
    }
}
