//! Session lifecycle
//!
//! Validation, refresh, tenant selection, logout and access-key exchange
//! over caller-supplied JWT strings. Nothing here keeps state between calls
//! besides the shared key set behind the [`TokenValidator`]; every result is
//! a fresh, immutable [`Token`] or [`Session`].
//!
//! Errors from local validation are re-tagged with the lifecycle step that
//! failed (`SessionInvalid`, `RefreshInvalid`, `RefreshParseError`). Key fetch,
//! remote, timeout and cancellation errors pass through unchanged.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::bearer::CallCredentials;
use crate::error::{AuthError, AuthResult, ErrorCode};
use crate::jwt::{Token, TokenValidator};
use crate::transport::HttpTransport;

pub const REFRESH_PATH: &str = "/v1/auth/refresh";
pub const SELECT_TENANT_PATH: &str = "/v1/auth/tenant/select";
pub const LOGOUT_PATH: &str = "/v1/auth/logout";
pub const LOGOUT_ALL_PATH: &str = "/v1/auth/logoutall";
pub const ACCESS_KEY_EXCHANGE_PATH: &str = "/v1/auth/accesskey/exchange";
pub const ME_PATH: &str = "/v1/auth/me";

/// User details returned alongside issued tokens
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserSnapshot {
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub login_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(default)]
    pub verified_email: bool,
    #[serde(default)]
    pub verified_phone: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    /// Every other field the identity provider sent
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Options for access-key exchange
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginOptions {
    /// Request a step-up session
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub stepup: bool,
    /// Request an MFA session
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub mfa: bool,
    /// Extra claims to embed in the issued session token
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_claims: Option<Map<String, Value>>,
}

/// Body of refresh and tenant-selection responses
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AuthenticationResponse {
    session_jwt: String,
    #[serde(default)]
    refresh_jwt: Option<String>,
    #[serde(default)]
    user: Option<UserSnapshot>,
    #[serde(default)]
    first_seen: bool,
}

#[derive(Debug, Serialize)]
struct SelectTenantRequest<'a> {
    tenant: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ExchangeRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    login_options: Option<&'a LoginOptions>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExchangeResponse {
    session_jwt: String,
}

/// An authenticated session
///
/// Only produced by a successful authentication exchange. To get an updated
/// session, run the lifecycle again.
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    session_token: Token,
    refresh_token: Token,
    user: UserSnapshot,
    first_seen: bool,
}

impl Session {
    pub fn session_token(&self) -> &Token {
        &self.session_token
    }

    pub fn refresh_token(&self) -> &Token {
        &self.refresh_token
    }

    pub fn user(&self) -> &UserSnapshot {
        &self.user
    }

    /// Whether this was the user's first authentication
    pub fn first_seen(&self) -> bool {
        self.first_seen
    }
}

fn is_blank(value: &str) -> bool {
    value.trim().is_empty()
}

fn require(value: &str, argument: &str) -> AuthResult<()> {
    if is_blank(value) {
        return Err(AuthError::empty_input(argument));
    }
    Ok(())
}

/// Session state transitions against the identity provider
#[derive(Debug, Clone)]
pub struct SessionLifecycle {
    validator: Arc<TokenValidator>,
    transport: HttpTransport,
}

impl SessionLifecycle {
    /// `transport` must be the auth-role transport: every call here is
    /// authenticated with a per-call refresh JWT or access key.
    pub fn new(validator: Arc<TokenValidator>, transport: HttpTransport) -> Self {
        Self {
            validator,
            transport,
        }
    }

    pub fn validator(&self) -> &Arc<TokenValidator> {
        &self.validator
    }

    /// Validate a session token locally.
    ///
    /// # Errors
    ///
    /// `EmptyInput` for a blank token, `SessionInvalid` when validation fails.
    pub async fn validate_session(&self, session_jwt: &str) -> AuthResult<Token> {
        require(session_jwt, "session token")?;
        self.validator
            .validate(session_jwt)
            .await
            .map_err(|e| e.retag_validation(ErrorCode::SessionInvalid))
    }

    /// Exchange a refresh token for a new session token.
    ///
    /// The refresh token is validated locally before any remote call. The
    /// returned token carries the refresh token's expiration.
    ///
    /// # Errors
    ///
    /// `EmptyInput`, `RefreshInvalid` for a locally rejected refresh token,
    /// `RefreshParseError` when the issued session token does not validate,
    /// or the remote failure.
    pub async fn refresh_session(&self, refresh_jwt: &str) -> AuthResult<Token> {
        let refresh = self.validate_refresh(refresh_jwt).await?;

        let response: AuthenticationResponse = self
            .transport
            .post(
                REFRESH_PATH,
                None::<&()>,
                &CallCredentials::jwt(refresh_jwt),
                "session refresh",
            )
            .await?;

        let session = self.parse_issued(&response.session_jwt).await?;
        info!(subject = %session.subject_id(), "Session refreshed");
        Ok(session.with_refresh_expiration(refresh.expiration()))
    }

    /// Validate the session token, falling back to a refresh on any failure.
    ///
    /// The session validation error is never returned; only a failure of the
    /// refresh path is.
    ///
    /// # Errors
    ///
    /// `BothEmpty` when both tokens are blank, `RefreshRequired` when the
    /// session token is unusable and no refresh token was given, otherwise
    /// whatever [`SessionLifecycle::refresh_session`] returns.
    pub async fn validate_and_refresh_session(
        &self,
        session_jwt: &str,
        refresh_jwt: &str,
    ) -> AuthResult<Token> {
        if is_blank(session_jwt) && is_blank(refresh_jwt) {
            return Err(AuthError::invalid_input(
                ErrorCode::BothEmpty,
                "session token and refresh token are both empty",
            ));
        }

        if !is_blank(session_jwt) {
            match self.validate_session(session_jwt).await {
                Ok(token) => return Ok(token),
                Err(e) => debug!(error = %e, "Session token rejected, falling back to refresh"),
            }
        }

        if is_blank(refresh_jwt) {
            return Err(AuthError::invalid_input(
                ErrorCode::RefreshRequired,
                "session token is invalid and no refresh token was provided",
            ));
        }
        self.refresh_session(refresh_jwt).await
    }

    /// Select the tenant the session is scoped to.
    ///
    /// An empty `tenant` clears the selection.
    ///
    /// # Errors
    ///
    /// `EmptyInput`/`RefreshInvalid` for the refresh token,
    /// `RefreshParseError` for issued tokens that do not validate, or the
    /// remote failure.
    pub async fn select_tenant(&self, tenant: &str, refresh_jwt: &str) -> AuthResult<Session> {
        let refresh = self.validate_refresh(refresh_jwt).await?;

        let response: AuthenticationResponse = self
            .transport
            .post(
                SELECT_TENANT_PATH,
                Some(&SelectTenantRequest { tenant }),
                &CallCredentials::jwt(refresh_jwt),
                "tenant selection",
            )
            .await?;

        let session = self.session_from_response(response, refresh).await?;
        info!(
            subject = %session.session_token.subject_id(),
            tenant,
            "Tenant selected"
        );
        Ok(session)
    }

    /// End the session of `refresh_jwt`
    ///
    /// # Errors
    ///
    /// `EmptyInput`/`RefreshInvalid` for the refresh token, or the remote
    /// failure.
    pub async fn logout(&self, refresh_jwt: &str) -> AuthResult<()> {
        self.logout_at(LOGOUT_PATH, refresh_jwt, "logout").await
    }

    /// End every session of the user owning `refresh_jwt`
    ///
    /// # Errors
    ///
    /// Same as [`SessionLifecycle::logout`].
    pub async fn logout_all(&self, refresh_jwt: &str) -> AuthResult<()> {
        self.logout_at(LOGOUT_ALL_PATH, refresh_jwt, "logout all")
            .await
    }

    /// Exchange an access key for a session token.
    ///
    /// # Errors
    ///
    /// `EmptyInput` for a blank key, `InvalidToken` when the issued token does
    /// not validate, or the remote failure.
    pub async fn exchange_access_key(
        &self,
        access_key: &str,
        login_options: Option<&LoginOptions>,
    ) -> AuthResult<Token> {
        require(access_key, "access key")?;

        let response: ExchangeResponse = self
            .transport
            .post(
                ACCESS_KEY_EXCHANGE_PATH,
                Some(&ExchangeRequest { login_options }),
                &CallCredentials::access_key(access_key),
                "access key exchange",
            )
            .await?;

        if is_blank(&response.session_jwt) {
            return Err(AuthError::invalid_token(
                "access key exchange returned no session token",
            ));
        }
        let token = self.validator.validate(&response.session_jwt).await?;
        info!(subject = %token.subject_id(), "Access key exchanged");
        Ok(token)
    }

    /// Current user details for the owner of `refresh_jwt`
    ///
    /// # Errors
    ///
    /// `EmptyInput`/`RefreshInvalid` for the refresh token, or the remote
    /// failure.
    pub async fn me(&self, refresh_jwt: &str) -> AuthResult<UserSnapshot> {
        self.validate_refresh(refresh_jwt).await?;
        self.transport
            .get(ME_PATH, &CallCredentials::jwt(refresh_jwt), "me")
            .await
    }

    async fn logout_at(&self, path: &str, refresh_jwt: &str, operation: &str) -> AuthResult<()> {
        let refresh = self.validate_refresh(refresh_jwt).await?;
        self.transport
            .post_empty(path, None::<&()>, &CallCredentials::jwt(refresh_jwt), operation)
            .await?;
        info!(subject = %refresh.subject_id(), operation, "Logged out");
        Ok(())
    }

    /// Validate a refresh token and mark it with its own expiration
    async fn validate_refresh(&self, refresh_jwt: &str) -> AuthResult<Token> {
        require(refresh_jwt, "refresh token")?;
        let token = self
            .validator
            .validate(refresh_jwt)
            .await
            .map_err(|e| e.retag_validation(ErrorCode::RefreshInvalid))?;
        let expiration = token.expiration();
        Ok(token.with_refresh_expiration(expiration))
    }

    /// Validate a token issued by the identity provider
    async fn parse_issued(&self, raw: &str) -> AuthResult<Token> {
        if is_blank(raw) {
            return Err(AuthError::token_validation(
                ErrorCode::RefreshParseError,
                "identity provider returned an empty token",
            ));
        }
        self.validator
            .validate(raw)
            .await
            .map_err(|e| e.retag_validation(ErrorCode::RefreshParseError))
    }

    async fn session_from_response(
        &self,
        response: AuthenticationResponse,
        current_refresh: Token,
    ) -> AuthResult<Session> {
        let refresh_token = match response.refresh_jwt.as_deref().filter(|raw| !is_blank(raw)) {
            Some(raw) => {
                let issued = self.parse_issued(raw).await?;
                let expiration = issued.expiration();
                issued.with_refresh_expiration(expiration)
            }
            None => current_refresh,
        };

        let mut session_token = self.parse_issued(&response.session_jwt).await?;
        if let Some(expiration) = refresh_token.refresh_expiration() {
            session_token = session_token.with_refresh_expiration(expiration);
        }

        Ok(Session {
            session_token,
            refresh_token,
            user: response.user.unwrap_or_default(),
            first_seen: response.first_seen,
        })
    }
}
