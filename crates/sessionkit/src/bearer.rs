//! Bearer credential composition for outbound calls
//!
//! The credential placed after `Bearer ` is a colon-delimited string whose
//! shape depends on who is calling:
//!
//! | Caller | Per-call credential | Bearer |
//! |---|---|---|
//! | management | (ignored) | `{project}:{managementKey}` |
//! | auth | access key | `{project}:{accessKey}` |
//! | auth | JWT | `{project}:{jwt}[:{authManagementKey}]` |
//! | auth | none | `{project}[:{authManagementKey}]` |
//!
//! An auth management key made only of whitespace counts as absent, and so
//! does an empty access key or JWT.

use std::collections::HashMap;
use std::fmt;

use http::HeaderMap;
use http::header::{AUTHORIZATION, HeaderValue};
use secrecy::{ExposeSecret, SecretString};

use crate::error::{AuthError, AuthResult, ErrorCode};

/// Key under which a JWT may be passed through [`CallCredentials::with_context`]
pub const CONTEXT_JWT_KEY: &str = "jwt";

/// Everything [`compose_bearer`] needs for one outbound call
#[derive(Clone, Default)]
pub struct BearerContext {
    /// Project id, always the first segment
    pub project_id: String,
    /// Management key; when non-blank the call is a management call
    pub management_key: Option<String>,
    /// Key appended to auth calls that carry no access key
    pub auth_management_key: Option<String>,
    /// Per-call JWT (refresh token or step-up/MFA JWT)
    pub per_call_jwt: Option<String>,
    /// Per-call access key
    pub per_call_access_key: Option<String>,
}

// Manual Debug impl to prevent credential exposure in logs
impl fmt::Debug for BearerContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let redact = |value: &Option<String>| value.as_ref().map(|_| "[REDACTED]");
        f.debug_struct("BearerContext")
            .field("project_id", &self.project_id)
            .field("management_key", &redact(&self.management_key))
            .field("auth_management_key", &redact(&self.auth_management_key))
            .field("per_call_jwt", &redact(&self.per_call_jwt))
            .field("per_call_access_key", &redact(&self.per_call_access_key))
            .finish()
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.is_empty())
}

/// Whitespace-only keys count as absent; present keys are used as configured
fn non_blank(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.trim().is_empty())
}

/// Compose the bearer credential for one call.
///
/// Rules, highest precedence first:
/// 1. non-blank management key: `{project}:{managementKey}`, nothing appended
/// 2. non-empty access key: `{project}:{accessKey}`, auth management key never appended
/// 3. non-empty JWT: `{project}:{jwt}`, plus `:{authManagementKey}` when configured
/// 4. auth management key alone: `{project}:{authManagementKey}`
/// 5. otherwise `{project}`
pub fn compose_bearer(context: &BearerContext) -> String {
    let project = context.project_id.as_str();

    if let Some(management_key) = non_blank(context.management_key.as_deref()) {
        return format!("{project}:{management_key}");
    }

    if let Some(access_key) = non_empty(context.per_call_access_key.as_deref()) {
        return format!("{project}:{access_key}");
    }

    let auth_management_key = non_blank(context.auth_management_key.as_deref());
    match (non_empty(context.per_call_jwt.as_deref()), auth_management_key) {
        (Some(jwt), Some(key)) => format!("{project}:{jwt}:{key}"),
        (Some(jwt), None) => format!("{project}:{jwt}"),
        (None, Some(key)) => format!("{project}:{key}"),
        (None, None) => project.to_string(),
    }
}

/// Credentials supplied for a single call
///
/// They are consulted once and never stored on the authenticator.
#[derive(Clone, Default)]
pub struct CallCredentials {
    jwt: Option<String>,
    access_key: Option<String>,
    context: HashMap<String, String>,
}

impl fmt::Debug for CallCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallCredentials")
            .field("jwt", &self.jwt.as_ref().map(|_| "[REDACTED]"))
            .field("access_key", &self.access_key.as_ref().map(|_| "[REDACTED]"))
            .field("context", &self.context.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl CallCredentials {
    /// No per-call credential
    pub fn none() -> Self {
        Self::default()
    }

    /// Authenticate the call with a JWT (usually the refresh token)
    pub fn jwt(jwt: impl Into<String>) -> Self {
        Self {
            jwt: Some(jwt.into()),
            ..Self::default()
        }
    }

    /// Authenticate the call with a step-up or MFA JWT
    pub fn step_up(jwt: impl Into<String>) -> Self {
        Self::jwt(jwt)
    }

    /// Authenticate the call with an access key
    pub fn access_key(access_key: impl Into<String>) -> Self {
        Self {
            access_key: Some(access_key.into()),
            ..Self::default()
        }
    }

    /// Attach a value to the generic per-call context map
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    /// The JWT to use: the explicit option wins over the context map
    fn effective_jwt(&self) -> Option<&str> {
        non_empty(self.jwt.as_deref())
            .or_else(|| non_empty(self.context.get(CONTEXT_JWT_KEY).map(String::as_str)))
    }
}

/// Which class of API an authenticator serves
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallerRole {
    /// Privileged management API
    Management,
    /// End-user auth API
    Auth,
}

/// Computes the `Authorization` header for one caller role
#[derive(Clone)]
pub struct RequestAuthenticator {
    project_id: String,
    role: CallerRole,
    management_key: Option<SecretString>,
    auth_management_key: Option<SecretString>,
}

impl fmt::Debug for RequestAuthenticator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestAuthenticator")
            .field("project_id", &self.project_id)
            .field("role", &self.role)
            .field(
                "auth_management_key",
                &self.auth_management_key.as_ref().map(|_| "[REDACTED]"),
            )
            .finish_non_exhaustive()
    }
}

fn require_project_id(project_id: &str) -> AuthResult<String> {
    let project_id = project_id.trim();
    if project_id.is_empty() {
        return Err(AuthError::invalid_input(
            ErrorCode::MissingProjectId,
            "project id is required",
        ));
    }
    Ok(project_id.to_string())
}

impl RequestAuthenticator {
    /// Authenticator for management calls
    ///
    /// # Errors
    ///
    /// Fails with `MissingProjectId` for a blank project id and with a
    /// configuration error for a blank management key.
    pub fn management(project_id: &str, management_key: SecretString) -> AuthResult<Self> {
        let project_id = require_project_id(project_id)?;
        if management_key.expose_secret().trim().is_empty() {
            return Err(AuthError::configuration(
                "management calls require a non-blank management key",
            ));
        }
        Ok(Self {
            project_id,
            role: CallerRole::Management,
            management_key: Some(management_key),
            auth_management_key: None,
        })
    }

    /// Authenticator for end-user auth calls
    ///
    /// # Errors
    ///
    /// Fails with `MissingProjectId` for a blank project id.
    pub fn auth(project_id: &str, auth_management_key: Option<SecretString>) -> AuthResult<Self> {
        Ok(Self {
            project_id: require_project_id(project_id)?,
            role: CallerRole::Auth,
            management_key: None,
            auth_management_key,
        })
    }

    /// Project id every bearer starts with
    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    /// Role this authenticator was built for
    pub fn role(&self) -> CallerRole {
        self.role
    }

    /// Combine persistent and per-call credentials into a [`BearerContext`]
    pub fn bearer_context(&self, credentials: &CallCredentials) -> BearerContext {
        let expose = |secret: &Option<SecretString>| {
            secret.as_ref().map(|s| s.expose_secret().to_string())
        };

        match self.role {
            CallerRole::Management => BearerContext {
                project_id: self.project_id.clone(),
                management_key: expose(&self.management_key),
                ..BearerContext::default()
            },
            CallerRole::Auth => BearerContext {
                project_id: self.project_id.clone(),
                management_key: None,
                auth_management_key: expose(&self.auth_management_key),
                per_call_jwt: credentials.effective_jwt().map(str::to_string),
                per_call_access_key: credentials.access_key.clone(),
            },
        }
    }

    /// Bearer credential for one call
    pub fn bearer(&self, credentials: &CallCredentials) -> String {
        compose_bearer(&self.bearer_context(credentials))
    }

    /// Set `Authorization: Bearer <bearer>` on an outbound request.
    ///
    /// # Errors
    ///
    /// Fails with `MissingRequest` when no request headers are supplied, and
    /// with a configuration error when the credential is not a valid header
    /// value.
    pub fn authorize(
        &self,
        request: Option<&mut HeaderMap>,
        credentials: &CallCredentials,
    ) -> AuthResult<()> {
        let headers = request.ok_or_else(|| {
            AuthError::invalid_input(
                ErrorCode::MissingRequest,
                "cannot authenticate without a request",
            )
        })?;

        let mut value = HeaderValue::from_str(&format!("Bearer {}", self.bearer(credentials)))
            .map_err(|_| {
                AuthError::configuration("bearer credential contains invalid header characters")
            })?;
        value.set_sensitive(true);
        headers.insert(AUTHORIZATION, value);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn secret(value: &str) -> SecretString {
        SecretString::new(value.to_string())
    }

    fn auth_ctx(amk: Option<&str>, jwt: Option<&str>, access_key: Option<&str>) -> BearerContext {
        BearerContext {
            project_id: "P1".to_string(),
            management_key: None,
            auth_management_key: amk.map(str::to_string),
            per_call_jwt: jwt.map(str::to_string),
            per_call_access_key: access_key.map(str::to_string),
        }
    }

    #[test]
    fn test_access_key_wins_and_drops_auth_management_key() {
        let ctx = auth_ctx(Some("AMK"), Some("J1"), Some("AK"));
        assert_eq!(compose_bearer(&ctx), "P1:AK");
    }

    #[test]
    fn test_jwt_with_auth_management_key() {
        let ctx = auth_ctx(Some("AMK"), Some("J1"), None);
        assert_eq!(compose_bearer(&ctx), "P1:J1:AMK");
    }

    #[test]
    fn test_whitespace_auth_management_key_is_absent() {
        let ctx = auth_ctx(Some("   "), Some("J1"), None);
        assert_eq!(compose_bearer(&ctx), "P1:J1");
    }

    #[test]
    fn test_configured_keys_are_not_trimmed() {
        assert_eq!(compose_bearer(&auth_ctx(Some(" K "), Some("J1"), None)), "P1:J1: K ");
        assert_eq!(compose_bearer(&auth_ctx(Some(" K "), None, None)), "P1: K ");

        let ctx = BearerContext {
            management_key: Some(" MK ".to_string()),
            ..auth_ctx(None, None, None)
        };
        assert_eq!(compose_bearer(&ctx), "P1: MK ");
    }

    #[test]
    fn test_empty_access_key_falls_through() {
        assert_eq!(compose_bearer(&auth_ctx(Some("AMK"), Some("J1"), Some(""))), "P1:J1:AMK");
        assert_eq!(compose_bearer(&auth_ctx(Some("AMK"), None, Some(""))), "P1:AMK");
    }

    #[test]
    fn test_auth_management_key_alone_and_bare_project() {
        assert_eq!(compose_bearer(&auth_ctx(Some("AMK"), None, None)), "P1:AMK");
        assert_eq!(compose_bearer(&auth_ctx(None, None, None)), "P1");
    }

    #[test]
    fn test_management_key_ignores_per_call_credentials() {
        let ctx = BearerContext {
            management_key: Some("MK".to_string()),
            ..auth_ctx(Some("AMK"), Some("J1"), Some("AK"))
        };
        assert_eq!(compose_bearer(&ctx), "P1:MK");
    }

    #[test]
    fn test_management_authenticator_drops_per_call_values() {
        let authenticator = RequestAuthenticator::management("P1", secret("MK")).unwrap();
        let bearer = authenticator.bearer(&CallCredentials::jwt("J1"));
        assert_eq!(bearer, "P1:MK");
        assert_eq!(authenticator.role(), CallerRole::Management);
    }

    #[test]
    fn test_explicit_jwt_beats_context_jwt() {
        let authenticator = RequestAuthenticator::auth("P1", None).unwrap();
        let creds = CallCredentials::jwt("explicit").with_context(CONTEXT_JWT_KEY, "from-context");
        assert_eq!(authenticator.bearer(&creds), "P1:explicit");

        let creds = CallCredentials::none().with_context(CONTEXT_JWT_KEY, "from-context");
        assert_eq!(authenticator.bearer(&creds), "P1:from-context");
    }

    #[test]
    fn test_blank_project_id_rejected() {
        let err = RequestAuthenticator::auth("  ", None).unwrap_err();
        assert_eq!(err.code(), ErrorCode::MissingProjectId);

        let err = RequestAuthenticator::management("", secret("MK")).unwrap_err();
        assert_eq!(err.code(), ErrorCode::MissingProjectId);
    }

    #[test]
    fn test_blank_management_key_rejected() {
        let err = RequestAuthenticator::management("P1", secret("  ")).unwrap_err();
        assert_eq!(err.code(), ErrorCode::Configuration);
    }

    #[test]
    fn test_authorize_requires_request() {
        let authenticator = RequestAuthenticator::auth("P1", None).unwrap();
        let err = authenticator
            .authorize(None, &CallCredentials::none())
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::MissingRequest);
    }

    #[test]
    fn test_authorize_sets_sensitive_header() {
        let authenticator = RequestAuthenticator::auth("P1", Some(secret("AMK"))).unwrap();
        let mut headers = HeaderMap::new();
        authenticator
            .authorize(Some(&mut headers), &CallCredentials::step_up("MFA"))
            .unwrap();

        let value = headers.get(AUTHORIZATION).unwrap();
        assert_eq!(value.to_str().unwrap(), "Bearer P1:MFA:AMK");
        assert!(value.is_sensitive());
    }

    #[test]
    fn test_debug_redacts_credentials() {
        let rendered = format!("{:?}", auth_ctx(Some("AMK"), Some("J1"), Some("AK")));
        assert!(!rendered.contains("AMK"));
        assert!(!rendered.contains("J1"));
    }

    proptest! {
        #[test]
        fn prop_bearer_always_starts_with_project(
            amk in proptest::option::of("[ a-zA-Z0-9]{0,8}"),
            jwt in proptest::option::of("[a-zA-Z0-9.]{0,12}"),
            access_key in proptest::option::of("[a-zA-Z0-9]{0,8}"),
        ) {
            let ctx = auth_ctx(amk.as_deref(), jwt.as_deref(), access_key.as_deref());
            let bearer = compose_bearer(&ctx);
            prop_assert!(bearer == "P1" || bearer.starts_with("P1:"));
        }

        #[test]
        fn prop_access_key_never_carries_auth_management_key(
            amk in "[a-zA-Z0-9]{1,8}",
            access_key in "[a-zA-Z0-9]{1,8}",
            jwt in proptest::option::of("[a-zA-Z0-9.]{1,12}"),
        ) {
            let ctx = auth_ctx(Some(&amk), jwt.as_deref(), Some(&access_key));
            prop_assert_eq!(compose_bearer(&ctx), format!("P1:{access_key}"));
        }
    }
}
