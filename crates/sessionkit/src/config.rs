//! Client configuration
//!
//! [`ClientConfig`] can be deserialized, assembled with
//! [`ClientConfigBuilder`], or read from `SESSIONKIT_*` environment
//! variables. Keys are held as [`SecretString`] and never appear in `Debug`
//! output.

use std::fmt;
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{AuthError, AuthResult, ErrorCode};

pub const PROJECT_ID_ENV: &str = "SESSIONKIT_PROJECT_ID";
pub const BASE_URL_ENV: &str = "SESSIONKIT_BASE_URL";
pub const MANAGEMENT_KEY_ENV: &str = "SESSIONKIT_MANAGEMENT_KEY";
pub const AUTH_MANAGEMENT_KEY_ENV: &str = "SESSIONKIT_AUTH_MANAGEMENT_KEY";

/// Base URL used when the project id carries no region
pub const DEFAULT_BASE_URL: &str = "https://api.sessionkit.dev";

/// Project ids at least this long embed a region in characters 1..5
const REGIONAL_PROJECT_ID_LEN: usize = 32;

/// Configuration for [`crate::AuthClient`]
#[derive(Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Project every token and bearer belongs to
    #[serde(default)]
    pub project_id: String,
    /// Identity provider base URL; derived from the project id when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    /// Key for management calls
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        serialize_with = "serialize_secret",
        deserialize_with = "deserialize_secret"
    )]
    pub management_key: Option<SecretString>,
    /// Key appended to auth calls authenticated with a JWT
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        serialize_with = "serialize_secret",
        deserialize_with = "deserialize_secret"
    )]
    pub auth_management_key: Option<SecretString>,
    /// Timeout for each outbound call
    #[serde(default = "default_request_timeout")]
    pub request_timeout: Duration,
    /// Tolerance applied to token expiration
    #[serde(default = "default_clock_skew")]
    pub clock_skew: Duration,
    /// Minimum spacing between key-set refetches for unknown key ids
    #[serde(default = "default_min_key_refresh_interval")]
    pub min_key_refresh_interval: Duration,
    /// Attach the license header to management-keyed calls
    #[serde(default = "default_fetch_metadata_header")]
    pub fetch_metadata_header: bool,
    /// Longest a call waits for the license header before going without it
    #[serde(default = "default_metadata_header_wait")]
    pub metadata_header_wait: Duration,
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_clock_skew() -> Duration {
    Duration::from_secs(5)
}

fn default_min_key_refresh_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_fetch_metadata_header() -> bool {
    true
}

fn default_metadata_header_wait() -> Duration {
    Duration::from_secs(1)
}

fn serialize_secret<S>(secret: &Option<SecretString>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    match secret {
        Some(secret) => serializer.serialize_some(secret.expose_secret()),
        None => serializer.serialize_none(),
    }
}

fn deserialize_secret<'de, D>(deserializer: D) -> Result<Option<SecretString>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value: Option<String> = Deserialize::deserialize(deserializer)?;
    Ok(value.map(SecretString::new))
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            project_id: String::new(),
            base_url: None,
            management_key: None,
            auth_management_key: None,
            request_timeout: default_request_timeout(),
            clock_skew: default_clock_skew(),
            min_key_refresh_interval: default_min_key_refresh_interval(),
            fetch_metadata_header: default_fetch_metadata_header(),
            metadata_header_wait: default_metadata_header_wait(),
        }
    }
}

// Manual Debug impl to keep keys out of logs
impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let redact = |secret: &Option<SecretString>| secret.as_ref().map(|_| "[REDACTED]");
        f.debug_struct("ClientConfig")
            .field("project_id", &self.project_id)
            .field("base_url", &self.base_url)
            .field("management_key", &redact(&self.management_key))
            .field("auth_management_key", &redact(&self.auth_management_key))
            .field("request_timeout", &self.request_timeout)
            .field("clock_skew", &self.clock_skew)
            .field("min_key_refresh_interval", &self.min_key_refresh_interval)
            .field("fetch_metadata_header", &self.fetch_metadata_header)
            .field("metadata_header_wait", &self.metadata_header_wait)
            .finish()
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

impl ClientConfig {
    /// Start a builder for `project_id`
    pub fn builder(project_id: impl Into<String>) -> ClientConfigBuilder {
        ClientConfigBuilder::new(project_id)
    }

    /// Read the configuration from `SESSIONKIT_*` environment variables.
    ///
    /// Unset and blank variables are treated alike. Nothing is validated
    /// here; see [`ClientConfig::validate`].
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as [`ClientConfig::from_env`] with a custom variable source
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        Self {
            project_id: lookup(PROJECT_ID_ENV)
                .map(|v| v.trim().to_string())
                .unwrap_or_default(),
            base_url: non_blank(lookup(BASE_URL_ENV)),
            management_key: non_blank(lookup(MANAGEMENT_KEY_ENV)).map(SecretString::new),
            auth_management_key: non_blank(lookup(AUTH_MANAGEMENT_KEY_ENV)).map(SecretString::new),
            ..Self::default()
        }
    }

    /// Check the configuration
    ///
    /// # Errors
    ///
    /// `MissingProjectId` for a blank project id, a configuration error for an
    /// unparseable base URL.
    pub fn validate(&self) -> AuthResult<()> {
        if self.project_id.trim().is_empty() {
            return Err(AuthError::invalid_input(
                ErrorCode::MissingProjectId,
                "project id is required",
            ));
        }
        self.resolved_base_url()?;
        Ok(())
    }

    /// Base URL to use: the configured one, or one derived from the project id
    ///
    /// # Errors
    ///
    /// Returns a configuration error when the URL does not parse or is not
    /// http(s).
    pub fn resolved_base_url(&self) -> AuthResult<Url> {
        let raw = match non_blank(self.base_url.clone()) {
            Some(configured) => configured,
            None => derive_base_url(&self.project_id),
        };
        let url = Url::parse(raw.trim())
            .map_err(|e| AuthError::configuration(format!("Invalid base URL '{raw}': {e}")))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(AuthError::configuration(format!(
                "Base URL must use http or https, got '{}'",
                url.scheme()
            )));
        }
        Ok(url)
    }

    /// Management key, when one is configured and not blank
    pub(crate) fn usable_management_key(&self) -> Option<&SecretString> {
        self.management_key
            .as_ref()
            .filter(|key| !key.expose_secret().trim().is_empty())
    }
}

/// Regional project ids (32+ characters) carry their region in characters 1..5
pub fn derive_base_url(project_id: &str) -> String {
    let project_id = project_id.trim();
    if project_id.chars().count() >= REGIONAL_PROJECT_ID_LEN {
        let region: String = project_id
            .chars()
            .skip(1)
            .take(4)
            .collect::<String>()
            .to_ascii_lowercase();
        format!("https://api.{region}.sessionkit.dev")
    } else {
        DEFAULT_BASE_URL.to_string()
    }
}

/// Builder for [`ClientConfig`]
#[derive(Debug, Clone)]
pub struct ClientConfigBuilder {
    config: ClientConfig,
}

impl ClientConfigBuilder {
    pub fn new(project_id: impl Into<String>) -> Self {
        Self {
            config: ClientConfig {
                project_id: project_id.into(),
                ..ClientConfig::default()
            },
        }
    }

    #[must_use]
    pub fn base_url(mut self, base_url: impl Into<String>) -> Self {
        self.config.base_url = Some(base_url.into());
        self
    }

    #[must_use]
    pub fn management_key(mut self, key: impl Into<String>) -> Self {
        self.config.management_key = Some(SecretString::new(key.into()));
        self
    }

    #[must_use]
    pub fn auth_management_key(mut self, key: impl Into<String>) -> Self {
        self.config.auth_management_key = Some(SecretString::new(key.into()));
        self
    }

    #[must_use]
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    #[must_use]
    pub fn clock_skew(mut self, skew: Duration) -> Self {
        self.config.clock_skew = skew;
        self
    }

    #[must_use]
    pub fn min_key_refresh_interval(mut self, interval: Duration) -> Self {
        self.config.min_key_refresh_interval = interval;
        self
    }

    /// Disable or enable the optional license header
    #[must_use]
    pub fn fetch_metadata_header(mut self, enabled: bool) -> Self {
        self.config.fetch_metadata_header = enabled;
        self
    }

    #[must_use]
    pub fn metadata_header_wait(mut self, wait: Duration) -> Self {
        self.config.metadata_header_wait = wait;
        self
    }

    /// Finish and validate the configuration
    ///
    /// # Errors
    ///
    /// See [`ClientConfig::validate`].
    pub fn build(self) -> AuthResult<ClientConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.request_timeout, Duration::from_secs(30));
        assert_eq!(config.clock_skew, Duration::from_secs(5));
        assert_eq!(config.min_key_refresh_interval, Duration::from_secs(5));
        assert!(config.fetch_metadata_header);
        assert_eq!(config.metadata_header_wait, Duration::from_secs(1));
    }

    #[test]
    fn test_short_project_id_uses_global_url() {
        assert_eq!(derive_base_url("P2abc"), DEFAULT_BASE_URL);
    }

    #[test]
    fn test_regional_project_id() {
        let project_id = "Puse12aAc4T2V93bddihGEx2Ryhc8e5Z";
        assert_eq!(project_id.len(), 32);
        assert_eq!(derive_base_url(project_id), "https://api.use1.sessionkit.dev");
    }

    #[test]
    fn test_configured_base_url_wins() {
        let config = ClientConfig::builder("Puse12aAc4T2V93bddihGEx2Ryhc8e5Z")
            .base_url("http://localhost:8080")
            .build()
            .unwrap();
        assert_eq!(
            config.resolved_base_url().unwrap().as_str(),
            "http://localhost:8080/"
        );
    }

    #[test]
    fn test_validate_rejects_blank_project() {
        let err = ClientConfig::builder("  ").build().unwrap_err();
        assert_eq!(err.code(), ErrorCode::MissingProjectId);
    }

    #[test]
    fn test_validate_rejects_bad_base_url() {
        let err = ClientConfig::builder("P1")
            .base_url("not a url")
            .build()
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::Configuration);

        let err = ClientConfig::builder("P1")
            .base_url("ftp://example.com")
            .build()
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::Configuration);
    }

    #[test]
    fn test_from_lookup() {
        let vars: HashMap<&str, &str> = [
            (PROJECT_ID_ENV, " P1 "),
            (BASE_URL_ENV, ""),
            (MANAGEMENT_KEY_ENV, "MK"),
            (AUTH_MANAGEMENT_KEY_ENV, "   "),
        ]
        .into_iter()
        .collect();

        let config = ClientConfig::from_lookup(|name| vars.get(name).map(|v| v.to_string()));
        assert_eq!(config.project_id, "P1");
        assert!(config.base_url.is_none());
        assert_eq!(
            config.management_key.as_ref().map(|k| k.expose_secret().as_str()),
            Some("MK")
        );
        assert!(config.auth_management_key.is_none());
    }

    #[test]
    fn test_deserialize_with_defaults() {
        let config: ClientConfig = serde_json::from_str(
            r#"{"project_id":"P1","management_key":"MK","fetch_metadata_header":false}"#,
        )
        .unwrap();
        assert_eq!(config.project_id, "P1");
        assert!(config.usable_management_key().is_some());
        assert!(!config.fetch_metadata_header);
        assert_eq!(config.request_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_debug_redacts_keys() {
        let config = ClientConfig::builder("P1")
            .management_key("MK-secret")
            .auth_management_key("AMK-secret")
            .build()
            .unwrap();
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("MK-secret"));
        assert!(!rendered.contains("AMK-secret"));
    }
}
