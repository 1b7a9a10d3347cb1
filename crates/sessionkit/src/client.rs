//! Top-level client wiring
//!
//! [`AuthClient`] builds one transport per caller role, a single shared
//! [`KeySet`], and the validator and lifecycle on top of it. Clone the
//! `Arc`s it hands out to share them across tasks.

use std::fmt;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::bearer::RequestAuthenticator;
use crate::config::ClientConfig;
use crate::error::AuthResult;
use crate::jwt::{Clock, KeySet, TokenValidator};
use crate::session::SessionLifecycle;
use crate::transport::{HttpTransport, MetadataHeader};

/// Session and authorization client for one project
///
/// # Example
///
/// ```rust,no_run
/// use sessionkit::{AuthClient, ClientConfig, authz};
///
/// # async fn example(session_jwt: &str, refresh_jwt: &str) -> Result<(), sessionkit::AuthError> {
/// let client = AuthClient::new(ClientConfig::from_env())?;
///
/// let token = client
///     .sessions()
///     .validate_and_refresh_session(session_jwt, refresh_jwt)
///     .await?;
///
/// if authz::validate_roles(&token, &["admin"], None) {
///     println!("{} is an admin", token.subject_id());
/// }
/// # Ok(())
/// # }
/// ```
pub struct AuthClient {
    config: ClientConfig,
    auth_transport: HttpTransport,
    management_transport: Option<HttpTransport>,
    key_set: Arc<KeySet>,
    validator: Arc<TokenValidator>,
    sessions: SessionLifecycle,
    cancel: CancellationToken,
}

impl fmt::Debug for AuthClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthClient")
            .field("config", &self.config)
            .field("auth_transport", &self.auth_transport)
            .field("management_transport", &self.management_transport)
            .field("key_set", &self.key_set)
            .finish_non_exhaustive()
    }
}

impl AuthClient {
    /// Build a client from `config`.
    ///
    /// No network call happens here; the key set and the optional license
    /// header are fetched on first use.
    ///
    /// # Errors
    ///
    /// `MissingProjectId` or a configuration error when the configuration is
    /// invalid or an HTTP client cannot be created.
    pub fn new(config: ClientConfig) -> AuthResult<Self> {
        config.validate()?;
        let base_url = config.resolved_base_url()?;
        let cancel = CancellationToken::new();

        let mut auth_transport = HttpTransport::new(
            base_url.clone(),
            RequestAuthenticator::auth(&config.project_id, config.auth_management_key.clone())?,
            config.request_timeout,
            cancel.clone(),
        )?;

        let mut management_transport = match config.usable_management_key() {
            Some(key) => Some(HttpTransport::new(
                base_url.clone(),
                RequestAuthenticator::management(&config.project_id, key.clone())?,
                config.request_timeout,
                cancel.clone(),
            )?),
            None => None,
        };

        if config.fetch_metadata_header
            && let Some(management) = management_transport.take()
        {
            // The header source fetches through a copy that carries no header
            // itself.
            let metadata = Arc::new(MetadataHeader::new(
                management.clone(),
                config.metadata_header_wait,
            ));
            auth_transport = auth_transport.with_metadata_header(Arc::clone(&metadata));
            management_transport = Some(management.with_metadata_header(metadata));
        }

        let key_set = Arc::new(KeySet::new(
            config.project_id.trim(),
            auth_transport.clone(),
            config.min_key_refresh_interval,
        ));
        let validator =
            Arc::new(TokenValidator::new(Arc::clone(&key_set)).with_clock_skew(config.clock_skew));
        let sessions = SessionLifecycle::new(Arc::clone(&validator), auth_transport.clone());

        info!(
            project_id = %config.project_id,
            base_url = %base_url,
            management = management_transport.is_some(),
            "Created session client"
        );

        Ok(Self {
            config,
            auth_transport,
            management_transport,
            key_set,
            validator,
            sessions,
            cancel,
        })
    }

    /// Replace the validator's time source, keeping the shared key set
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.validator = Arc::new(
            TokenValidator::new(Arc::clone(&self.key_set))
                .with_clock_skew(self.config.clock_skew)
                .with_clock(clock),
        );
        self.sessions = SessionLifecycle::new(Arc::clone(&self.validator), self.auth_transport.clone());
        self
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Session validation, refresh, tenant selection, logout and exchange
    pub fn sessions(&self) -> &SessionLifecycle {
        &self.sessions
    }

    pub fn validator(&self) -> &Arc<TokenValidator> {
        &self.validator
    }

    pub fn key_set(&self) -> &Arc<KeySet> {
        &self.key_set
    }

    /// Transport for end-user auth calls
    pub fn auth_transport(&self) -> &HttpTransport {
        &self.auth_transport
    }

    /// Transport for management calls, present when a management key is
    /// configured
    pub fn management_transport(&self) -> Option<&HttpTransport> {
        self.management_transport.as_ref()
    }

    /// Token that aborts every pending call of this client when cancelled
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Cancel every pending and future call
    pub fn shutdown(&self) {
        info!(project_id = %self.config.project_id, "Shutting down session client");
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bearer::{CallCredentials, CallerRole};
    use crate::error::ErrorCode;

    #[test]
    fn test_blank_project_rejected() {
        let err = AuthClient::new(ClientConfig::default()).unwrap_err();
        assert_eq!(err.code(), ErrorCode::MissingProjectId);
    }

    #[test]
    fn test_transports_per_role() {
        let config = ClientConfig::builder("P1")
            .management_key("MK")
            .auth_management_key("AMK")
            .build()
            .unwrap();
        let client = AuthClient::new(config).unwrap();

        let auth = client.auth_transport().authenticator();
        assert_eq!(auth.role(), CallerRole::Auth);
        assert_eq!(auth.bearer(&CallCredentials::jwt("J1")), "P1:J1:AMK");

        let management = client.management_transport().unwrap().authenticator();
        assert_eq!(management.role(), CallerRole::Management);
        assert_eq!(management.bearer(&CallCredentials::jwt("J1")), "P1:MK");
    }

    #[test]
    fn test_no_management_transport_without_key() {
        let config = ClientConfig::builder("P1")
            .management_key("   ")
            .build()
            .unwrap();
        let client = AuthClient::new(config).unwrap();
        assert!(client.management_transport().is_none());
    }

    #[test]
    fn test_shutdown_cancels_token() {
        let client = AuthClient::new(ClientConfig::builder("P1").build().unwrap()).unwrap();
        let token = client.cancellation_token();
        assert!(!token.is_cancelled());
        client.shutdown();
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_debug_hides_keys() {
        let config = ClientConfig::builder("P1")
            .management_key("MK-secret")
            .build()
            .unwrap();
        let client = AuthClient::new(config).unwrap();
        assert!(!format!("{client:?}").contains("MK-secret"));
    }
}
