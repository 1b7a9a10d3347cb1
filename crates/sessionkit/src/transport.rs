//! Outbound HTTP to the identity provider
//!
//! One [`HttpTransport`] exists per caller role. Each owns its own
//! `reqwest::Client` so the management and auth paths never share a
//! connection pool or any connection-scoped state.
//!
//! Every request races the transport's cancellation token; a cancelled call
//! resolves to [`AuthError::Cancelled`] and a timed-out one to
//! [`AuthError::Timeout`].

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use http::HeaderMap;
use http::header::{HeaderName, HeaderValue};
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

use crate::bearer::{CallCredentials, RequestAuthenticator};
use crate::cache::SingleFlightCache;
use crate::error::{AuthError, AuthResult};

/// Header naming the SDK
pub const SDK_NAME_HEADER: &str = "x-sessionkit-sdk-name";
/// Header carrying the SDK version
pub const SDK_VERSION_HEADER: &str = "x-sessionkit-sdk-version";
/// Optional license header attached when available
pub const LICENSE_HEADER: &str = "x-sessionkit-license";
/// Management endpoint returning the project license
pub const LICENSE_PATH: &str = "/v1/mgmt/license";

const SDK_NAME: &str = "rust";

/// Structured error body returned by the identity provider
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerErrorBody {
    #[serde(default)]
    error_code: Option<String>,
    #[serde(default)]
    error_description: Option<String>,
    #[serde(default)]
    error_message: Option<String>,
}

fn remote_error(status: StatusCode, body: &str) -> AuthError {
    let parsed: ServerErrorBody = serde_json::from_str(body).unwrap_or_default();
    match parsed.error_code {
        Some(code) if !code.is_empty() => AuthError::Remote {
            status: Some(status.as_u16()),
            code,
            description: parsed
                .error_description
                .unwrap_or_else(|| status.to_string()),
            message: parsed.error_message,
        },
        _ => AuthError::http_status(
            status.as_u16(),
            status.canonical_reason().unwrap_or("unexpected status"),
        ),
    }
}

fn map_reqwest_error(err: &reqwest::Error, operation: &str) -> AuthError {
    if err.is_timeout() {
        return AuthError::timeout(operation);
    }
    match err.status() {
        Some(status) => AuthError::http_status(status.as_u16(), err.to_string()),
        None => AuthError::network(format!("{operation} failed: {err}")),
    }
}

/// HTTP client for one caller role
#[derive(Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: Url,
    authenticator: RequestAuthenticator,
    metadata: Option<Arc<MetadataHeader>>,
    cancel: CancellationToken,
}

impl fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpTransport")
            .field("client", &"<reqwest::Client>")
            .field("base_url", &self.base_url.as_str())
            .field("authenticator", &self.authenticator)
            .field("metadata", &self.metadata.is_some())
            .finish()
    }
}

impl HttpTransport {
    /// Create a transport with its own connection pool
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the HTTP client cannot be built.
    pub fn new(
        base_url: Url,
        authenticator: RequestAuthenticator,
        timeout: Duration,
        cancel: CancellationToken,
    ) -> AuthResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .pool_idle_timeout(Some(Duration::from_secs(90)))
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| AuthError::configuration(format!("Failed to create HTTP client: {e}")))?;
        let base_url = with_trailing_slash(base_url);

        debug!(base_url = %base_url, role = ?authenticator.role(), "Created HTTP transport");

        Ok(Self {
            client,
            base_url,
            authenticator,
            metadata: None,
            cancel,
        })
    }

    /// Attach the optional metadata header source
    pub fn with_metadata_header(mut self, metadata: Arc<MetadataHeader>) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Authenticator used for this transport's calls
    pub fn authenticator(&self) -> &RequestAuthenticator {
        &self.authenticator
    }

    /// Base URL every path is resolved against
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Cancellation token aborting this transport's pending calls
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    fn url(&self, path: &str) -> AuthResult<Url> {
        self.base_url
            .join(path.trim_start_matches('/'))
            .map_err(|e| AuthError::configuration(format!("Invalid request path '{path}': {e}")))
    }

    fn base_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            HeaderName::from_static(SDK_NAME_HEADER),
            HeaderValue::from_static(SDK_NAME),
        );
        headers.insert(
            HeaderName::from_static(SDK_VERSION_HEADER),
            HeaderValue::from_static(env!("CARGO_PKG_VERSION")),
        );
        headers
    }

    async fn authenticated_headers(&self, credentials: &CallCredentials) -> AuthResult<HeaderMap> {
        let mut headers = Self::base_headers();
        self.authenticator.authorize(Some(&mut headers), credentials)?;

        if let Some(metadata) = &self.metadata
            && let Some(license) = metadata.value().await
            && let Ok(header_value) = HeaderValue::from_str(&license)
        {
            headers.insert(HeaderName::from_static(LICENSE_HEADER), header_value);
        }

        Ok(headers)
    }

    /// GET authenticated with this transport's own credentials only.
    ///
    /// Never attaches the metadata header, so the header source can fetch
    /// through it.
    pub(crate) async fn get_plain<T: DeserializeOwned>(
        &self,
        path: &str,
        operation: &str,
    ) -> AuthResult<T> {
        let mut headers = Self::base_headers();
        self.authenticator
            .authorize(Some(&mut headers), &CallCredentials::none())?;
        let body = self
            .execute(Method::GET, path, headers, None, operation)
            .await?;
        Self::decode(&body, operation)
    }

    /// GET without an `Authorization` header (key distribution)
    ///
    /// # Errors
    ///
    /// Returns remote, timeout or cancellation errors.
    pub async fn get_unauthenticated<T: DeserializeOwned>(
        &self,
        path: &str,
        operation: &str,
    ) -> AuthResult<T> {
        let body = self
            .execute(Method::GET, path, Self::base_headers(), None, operation)
            .await?;
        Self::decode(&body, operation)
    }

    /// Authenticated GET
    ///
    /// # Errors
    ///
    /// Returns remote, timeout or cancellation errors.
    pub async fn get<T: DeserializeOwned>(
        &self,
        path: &str,
        credentials: &CallCredentials,
        operation: &str,
    ) -> AuthResult<T> {
        let headers = self.authenticated_headers(credentials).await?;
        let body = self
            .execute(Method::GET, path, headers, None, operation)
            .await?;
        Self::decode(&body, operation)
    }

    /// Authenticated POST with an optional JSON body
    ///
    /// # Errors
    ///
    /// Returns remote, timeout or cancellation errors.
    pub async fn post<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        path: &str,
        body: Option<&B>,
        credentials: &CallCredentials,
        operation: &str,
    ) -> AuthResult<T> {
        let response = self.post_raw(path, body, credentials, operation).await?;
        Self::decode(&response, operation)
    }

    /// Authenticated POST whose response body is ignored
    ///
    /// # Errors
    ///
    /// Returns remote, timeout or cancellation errors.
    pub async fn post_empty<B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: Option<&B>,
        credentials: &CallCredentials,
        operation: &str,
    ) -> AuthResult<()> {
        self.post_raw(path, body, credentials, operation).await?;
        Ok(())
    }

    async fn post_raw<B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: Option<&B>,
        credentials: &CallCredentials,
        operation: &str,
    ) -> AuthResult<String> {
        let headers = self.authenticated_headers(credentials).await?;
        let payload = body
            .map(serde_json::to_vec)
            .transpose()
            .map_err(|e| AuthError::configuration(format!("Failed to encode {operation} body: {e}")))?;
        self.execute(Method::POST, path, headers, payload, operation)
            .await
    }

    async fn execute(
        &self,
        method: Method,
        path: &str,
        headers: HeaderMap,
        payload: Option<Vec<u8>>,
        operation: &str,
    ) -> AuthResult<String> {
        let url = self.url(path)?;
        let mut request = self.client.request(method.clone(), url).headers(headers);
        if let Some(payload) = payload {
            request = request
                .header(http::header::CONTENT_TYPE, "application/json")
                .body(payload);
        }

        let call = async {
            let response = request
                .send()
                .await
                .map_err(|e| map_reqwest_error(&e, operation))?;
            let status = response.status();
            let body = response
                .text()
                .await
                .map_err(|e| map_reqwest_error(&e, operation))?;
            Ok::<_, AuthError>((status, body))
        };

        let (status, body) = tokio::select! {
            biased;
            () = self.cancel.cancelled() => {
                debug!(operation, path, "Call cancelled");
                return Err(AuthError::cancelled(operation));
            }
            result = call => result?,
        };

        if !status.is_success() {
            let err = remote_error(status, &body);
            warn!(operation, path, %method, status = %status, error = %err, "Identity provider returned error status");
            return Err(err);
        }

        debug!(operation, path, %method, status = %status, "Call succeeded");
        Ok(body)
    }

    fn decode<T: DeserializeOwned>(body: &str, operation: &str) -> AuthResult<T> {
        serde_json::from_str(body).map_err(|e| AuthError::Remote {
            status: None,
            code: "INVALID_RESPONSE".to_string(),
            description: format!("Failed to parse {operation} response: {e}"),
            message: None,
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LicenseResponse {
    license_type: String,
}

const LICENSE_SLOT: &str = "license";

/// Resolve request paths below the base path rather than at the host root
fn with_trailing_slash(mut base_url: Url) -> Url {
    if !base_url.path().ends_with('/') {
        let path = format!("{}/", base_url.path());
        base_url.set_path(&path);
    }
    base_url
}

/// Optional header whose value is fetched once from the management API
///
/// Failures never reach the caller: the header is simply left off and the
/// fetch is retried on a later call. A call waits at most `wait` for a
/// pending fetch; the fetch itself keeps running in the background.
pub struct MetadataHeader {
    management: HttpTransport,
    cache: Arc<SingleFlightCache<&'static str, String>>,
    wait: Duration,
}

impl fmt::Debug for MetadataHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetadataHeader")
            .field("cache", &self.cache)
            .field("wait", &self.wait)
            .finish_non_exhaustive()
    }
}

impl MetadataHeader {
    /// Create a header source fetching through `management`.
    ///
    /// The fetch never carries the header itself.
    pub fn new(management: HttpTransport, wait: Duration) -> Self {
        Self {
            management,
            cache: Arc::new(SingleFlightCache::new()),
            wait,
        }
    }

    /// Header value, or `None` when it is unavailable or still being fetched
    pub async fn value(&self) -> Option<String> {
        if let Some(value) = self.cache.peek(&LICENSE_SLOT) {
            return Some(value);
        }

        // Spawned so the slot is settled even when this call stops waiting
        let cache = Arc::clone(&self.cache);
        let management = self.management.clone();
        let fetch = tokio::spawn(async move {
            cache
                .get_or_fetch(LICENSE_SLOT, move || async move {
                    let response: LicenseResponse =
                        management.get_plain(LICENSE_PATH, "license fetch").await?;
                    Ok(response.license_type)
                })
                .await
        });

        match tokio::time::timeout(self.wait, fetch).await {
            Ok(Ok(Ok(value))) => Some(value),
            Ok(Ok(Err(e))) => {
                warn!(error = %e, "License fetch failed, continuing without license header");
                None
            }
            Ok(Err(e)) => {
                warn!(error = %e, "License fetch task failed, continuing without license header");
                None
            }
            Err(_) => {
                debug!(wait = ?self.wait, "License fetch still pending, continuing without license header");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::SecretString;

    #[test]
    fn test_structured_error_body_is_preserved() {
        let body = r#"{"errorCode":"E061301","errorDescription":"Invalid refresh token","errorMessage":"token revoked"}"#;
        match remote_error(StatusCode::UNAUTHORIZED, body) {
            AuthError::Remote {
                status,
                code,
                description,
                message,
            } => {
                assert_eq!(status, Some(401));
                assert_eq!(code, "E061301");
                assert_eq!(description, "Invalid refresh token");
                assert_eq!(message.as_deref(), Some("token revoked"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_unstructured_error_body_synthesizes_code() {
        match remote_error(StatusCode::BAD_GATEWAY, "<html>upstream down</html>") {
            AuthError::Remote { code, status, .. } => {
                assert_eq!(code, "HTTP502");
                assert_eq!(status, Some(502));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_transports_resolve_paths_against_base() {
        let authenticator = RequestAuthenticator::auth("P1", None).unwrap();
        let transport = HttpTransport::new(
            Url::parse("https://api.sessionkit.dev").unwrap(),
            authenticator,
            Duration::from_secs(5),
            CancellationToken::new(),
        )
        .unwrap();

        assert_eq!(
            transport.url("/v2/keys/P1").unwrap().as_str(),
            "https://api.sessionkit.dev/v2/keys/P1"
        );
    }

    #[test]
    fn test_base_path_prefix_is_kept() {
        let authenticator = RequestAuthenticator::auth("P1", None).unwrap();
        let transport = HttpTransport::new(
            Url::parse("https://gw.example.com/idp").unwrap(),
            authenticator,
            Duration::from_secs(5),
            CancellationToken::new(),
        )
        .unwrap();

        assert_eq!(
            transport.url("/v2/keys/P1").unwrap().as_str(),
            "https://gw.example.com/idp/v2/keys/P1"
        );
        assert_eq!(
            transport.url("/v1/auth/refresh").unwrap().as_str(),
            "https://gw.example.com/idp/v1/auth/refresh"
        );
    }

    fn assert_send<T: Send>(_: &T) {}

    #[test]
    fn test_license_lookup_future_is_send() {
        let management = HttpTransport::new(
            Url::parse("https://api.sessionkit.dev").unwrap(),
            RequestAuthenticator::management("P1", SecretString::new("MK".to_string())).unwrap(),
            Duration::from_secs(5),
            CancellationToken::new(),
        )
        .unwrap();
        let metadata = Arc::new(MetadataHeader::new(management, Duration::from_secs(1)));
        let auth = HttpTransport::new(
            Url::parse("https://api.sessionkit.dev").unwrap(),
            RequestAuthenticator::auth("P1", None).unwrap(),
            Duration::from_secs(5),
            CancellationToken::new(),
        )
        .unwrap()
        .with_metadata_header(Arc::clone(&metadata));

        let lookup = metadata.value();
        assert_send(&lookup);
        let credentials = CallCredentials::none();
        let call = auth.get::<serde_json::Value>("/v1/auth/me", &credentials, "me");
        assert_send(&call);
    }

    #[test]
    fn test_debug_hides_management_key() {
        let authenticator =
            RequestAuthenticator::management("P1", SecretString::new("MK-secret".to_string()))
                .unwrap();
        let transport = HttpTransport::new(
            Url::parse("https://api.sessionkit.dev").unwrap(),
            authenticator,
            Duration::from_secs(5),
            CancellationToken::new(),
        )
        .unwrap();
        assert!(!format!("{transport:?}").contains("MK-secret"));
    }
}
