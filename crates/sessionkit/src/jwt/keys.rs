//! Signing-key distribution and lookup
//!
//! The identity provider publishes one key set per project at
//! `GET /v2/keys/{projectId}`. [`KeySet`] fetches it on first use through a
//! [`SingleFlightCache`], so any number of concurrent validations share a
//! single request.
//!
//! When a token names a `kid` the cached set does not contain, the set is
//! refetched at most once per `min_refresh_interval`. This picks up rotated
//! keys without letting a stream of forged `kid`s hammer the endpoint.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use jsonwebtoken::{Algorithm, DecodingKey};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::cache::SingleFlightCache;
use crate::error::{AuthError, AuthResult};
use crate::transport::HttpTransport;

/// Default minimum spacing between rotation-driven refetches
pub const DEFAULT_MIN_REFRESH_INTERVAL: Duration = Duration::from_secs(5);

/// One published key, as it appears on the wire
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyDescriptor {
    /// Signature algorithm, e.g. `RS256`
    #[serde(default)]
    pub alg: String,
    /// RSA public exponent, base64url without padding
    #[serde(default)]
    pub e: String,
    /// Key id
    #[serde(default)]
    pub kid: String,
    /// Key type, `RSA` for every key this crate accepts
    #[serde(default)]
    pub kty: String,
    /// RSA modulus, base64url without padding
    #[serde(default)]
    pub n: String,
    /// Intended use (`sig`)
    #[serde(default, rename = "use", skip_serializing_if = "Option::is_none")]
    pub key_use: Option<String>,
}

/// Response body of the key-distribution endpoint
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KeyDistribution {
    #[serde(default)]
    pub keys: Vec<KeyDescriptor>,
}

/// Decode URL-safe base64 that may be missing its `=` padding.
///
/// The input is mapped to the standard alphabet and padded to a multiple of
/// four before decoding.
///
/// # Errors
///
/// Returns a key resolution error when the input is not valid base64.
pub fn decode_base64url_padded(input: &str) -> AuthResult<Vec<u8>> {
    let mut normalized: String = input
        .trim()
        .chars()
        .map(|c| match c {
            '-' => '+',
            '_' => '/',
            other => other,
        })
        .collect();
    while normalized.len() % 4 != 0 {
        normalized.push('=');
    }
    STANDARD
        .decode(normalized.as_bytes())
        .map_err(|e| AuthError::key_resolution(format!("invalid base64url value: {e}")))
}

pub(crate) fn is_rsa_family(algorithm: Algorithm) -> bool {
    matches!(
        algorithm,
        Algorithm::RS256
            | Algorithm::RS384
            | Algorithm::RS512
            | Algorithm::PS256
            | Algorithm::PS384
            | Algorithm::PS512
    )
}

/// An RSA public key ready for signature verification
#[derive(Clone)]
pub struct SigningKey {
    key_id: String,
    algorithm: Algorithm,
    modulus: Vec<u8>,
    exponent: Vec<u8>,
    decoding_key: DecodingKey,
}

impl fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningKey")
            .field("key_id", &self.key_id)
            .field("algorithm", &self.algorithm)
            .field("modulus_bits", &(self.modulus.len() * 8))
            .finish_non_exhaustive()
    }
}

impl SigningKey {
    /// Build a key from its wire descriptor.
    ///
    /// A descriptor without `alg` is taken to be `RS256`.
    ///
    /// # Errors
    ///
    /// Fails for non-RSA keys, unsupported algorithms and modulus/exponent
    /// values that are not valid base64url.
    pub fn from_descriptor(descriptor: &KeyDescriptor) -> AuthResult<Self> {
        if !descriptor.kty.eq_ignore_ascii_case("RSA") {
            return Err(AuthError::key_resolution(format!(
                "unsupported key type '{}'",
                descriptor.kty
            )));
        }

        let algorithm = if descriptor.alg.is_empty() {
            Algorithm::RS256
        } else {
            Algorithm::from_str(&descriptor.alg).map_err(|_| {
                AuthError::key_resolution(format!("unsupported algorithm '{}'", descriptor.alg))
            })?
        };
        if !is_rsa_family(algorithm) {
            return Err(AuthError::key_resolution(format!(
                "algorithm {algorithm:?} is not an RSA algorithm"
            )));
        }

        let modulus = decode_base64url_padded(&descriptor.n)?;
        let exponent = decode_base64url_padded(&descriptor.e)?;
        if modulus.is_empty() || exponent.is_empty() {
            return Err(AuthError::key_resolution("empty RSA modulus or exponent"));
        }
        let decoding_key = DecodingKey::from_rsa_raw_components(&modulus, &exponent);

        Ok(Self {
            key_id: descriptor.kid.clone(),
            algorithm,
            modulus,
            exponent,
            decoding_key,
        })
    }

    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    /// Big-endian RSA modulus
    pub fn modulus(&self) -> &[u8] {
        &self.modulus
    }

    /// Big-endian RSA public exponent
    pub fn exponent(&self) -> &[u8] {
        &self.exponent
    }

    pub(crate) fn decoding_key(&self) -> &DecodingKey {
        &self.decoding_key
    }
}

/// Keys indexed by `kid`. Every descriptor sharing a `kid` is kept.
pub type KeyMap = HashMap<String, Vec<SigningKey>>;

fn index_keys(distribution: &KeyDistribution) -> KeyMap {
    let mut map = KeyMap::new();
    for descriptor in &distribution.keys {
        match SigningKey::from_descriptor(descriptor) {
            Ok(key) => map.entry(key.key_id.clone()).or_default().push(key),
            Err(e) => {
                warn!(kid = %descriptor.kid, kty = %descriptor.kty, error = %e, "Skipping unusable signing key");
            }
        }
    }
    map
}

/// Signing keys for one project, fetched lazily and shared
pub struct KeySet {
    project_id: String,
    transport: HttpTransport,
    cache: SingleFlightCache<String, Arc<KeyMap>>,
    min_refresh_interval: Duration,
    last_refresh: Arc<Mutex<Option<Instant>>>,
}

impl fmt::Debug for KeySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeySet")
            .field("project_id", &self.project_id)
            .field("cache", &self.cache)
            .field("min_refresh_interval", &self.min_refresh_interval)
            .finish_non_exhaustive()
    }
}

impl KeySet {
    /// Create an empty key set. Nothing is fetched until the first
    /// [`KeySet::resolve`].
    pub fn new(
        project_id: impl Into<String>,
        transport: HttpTransport,
        min_refresh_interval: Duration,
    ) -> Self {
        Self {
            project_id: project_id.into(),
            transport,
            cache: SingleFlightCache::new(),
            min_refresh_interval,
            last_refresh: Arc::new(Mutex::new(None)),
        }
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    /// Every key for `kid`.
    ///
    /// # Errors
    ///
    /// - `KeyNotFound` when the id is absent after the fetch (and after the
    ///   rate-limited rotation refetch, when one was allowed)
    /// - `KeyResolution` when the key set could not be fetched
    /// - `Timeout` / `Cancelled` when the fetch was aborted
    pub async fn resolve(&self, kid: &str) -> AuthResult<Vec<SigningKey>> {
        let keys = self.keys().await?;
        if let Some(found) = keys.get(kid) {
            return Ok(found.clone());
        }

        if self.begin_rotation_refresh() {
            info!(project_id = %self.project_id, kid, "Unknown kid, refetching key set");
            self.cache.invalidate(&self.project_id);
        } else {
            debug!(project_id = %self.project_id, kid, "Unknown kid, key set refetch rate limited");
        }

        let keys = self.keys().await?;
        keys.get(kid)
            .cloned()
            .ok_or_else(|| AuthError::key_not_found(kid))
    }

    /// Drop the cached key set; the next resolve refetches it
    pub fn invalidate(&self) {
        debug!(project_id = %self.project_id, "Key set invalidated");
        self.cache.invalidate(&self.project_id);
    }

    /// Number of distinct key ids currently cached
    pub fn cached_key_ids(&self) -> usize {
        self.cache
            .peek(&self.project_id)
            .map_or(0, |keys| keys.len())
    }

    fn begin_rotation_refresh(&self) -> bool {
        let mut last = self.last_refresh.lock();
        if let Some(previous) = *last
            && previous.elapsed() < self.min_refresh_interval
        {
            return false;
        }
        *last = Some(Instant::now());
        true
    }

    async fn keys(&self) -> AuthResult<Arc<KeyMap>> {
        let transport = self.transport.clone();
        let project_id = self.project_id.clone();
        let last_refresh = Arc::clone(&self.last_refresh);

        self.cache
            .get_or_fetch(self.project_id.clone(), move || async move {
                *last_refresh.lock() = Some(Instant::now());
                fetch_keys(&transport, &project_id).await.map(Arc::new)
            })
            .await
    }
}

async fn fetch_keys(transport: &HttpTransport, project_id: &str) -> AuthResult<KeyMap> {
    info!(project_id, "Fetching signing keys");

    let path = format!("/v2/keys/{project_id}");
    let distribution: KeyDistribution = transport
        .get_unauthenticated(&path, "key set fetch")
        .await
        .map_err(|e| match e {
            AuthError::Timeout { .. } | AuthError::Cancelled { .. } => e,
            other => {
                warn!(project_id, error = %other, "Failed to fetch signing keys");
                AuthError::key_resolution(format!("key set fetch failed: {other}"))
            }
        })?;

    let keys = index_keys(&distribution);
    info!(
        project_id,
        descriptors = distribution.keys.len(),
        key_ids = keys.len(),
        "Fetched signing keys"
    );
    Ok(keys)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;

    // 2048-bit modulus taken from a test key; only its decodability matters here
    const MODULUS: &str = "sXchDaQebHnPiGvyDOAT4saGEUetSyo9MKLOoWFsueri23bOdgWp4Dy1WlUzewbgBHod5pcM9H95GQRV3JDXboIRROSBigeC5yjU1hGzHHyXss8UDprecbAYxknTcQkhslANGRUZmdTOQ5qTRsLAt6BTYuyvVRdhS8exSZEy_c4gs_7svlJJQ4H9_NxsiIoLwAEk7-Q3UXERGYw_75IDrGA84-lA_-Ct4eTlXHBIY2EaV7t7LjJaynVJCpkv4LKjTTAumiGUIuQhrNhZLuF_RJLqHpM2kgWFLU7-VTdL1VbC2tejvcI2BlMkEpk1BzBZI0KQB0GaDWFLN-aEAw3vRw";

    fn descriptor(kid: &str) -> KeyDescriptor {
        KeyDescriptor {
            alg: "RS256".to_string(),
            e: "AQAB".to_string(),
            kid: kid.to_string(),
            kty: "RSA".to_string(),
            n: MODULUS.to_string(),
            key_use: Some("sig".to_string()),
        }
    }

    #[test]
    fn test_decode_unpadded_base64url() {
        assert_eq!(decode_base64url_padded("AQAB").unwrap(), vec![1, 0, 1]);
        // "-_8" is 0xFB 0xFF without padding
        assert_eq!(decode_base64url_padded("-_8").unwrap(), vec![0xFB, 0xFF]);
        assert_eq!(decode_base64url_padded("AQ").unwrap(), vec![1]);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(decode_base64url_padded("!!!").is_err());
    }

    #[test]
    fn test_signing_key_from_descriptor() {
        let key = SigningKey::from_descriptor(&descriptor("k1")).unwrap();
        assert_eq!(key.key_id(), "k1");
        assert_eq!(key.algorithm(), Algorithm::RS256);
        assert_eq!(key.exponent(), &[1, 0, 1]);
        assert_eq!(key.modulus().len(), 256);
    }

    #[test]
    fn test_missing_alg_defaults_to_rs256() {
        let mut desc = descriptor("k1");
        desc.alg = String::new();
        let key = SigningKey::from_descriptor(&desc).unwrap();
        assert_eq!(key.algorithm(), Algorithm::RS256);
    }

    #[test]
    fn test_non_rsa_keys_are_rejected() {
        let mut desc = descriptor("k1");
        desc.kty = "EC".to_string();
        let err = SigningKey::from_descriptor(&desc).unwrap_err();
        assert_eq!(err.code(), ErrorCode::KeyFetchFailed);

        let mut desc = descriptor("k1");
        desc.alg = "HS256".to_string();
        assert!(SigningKey::from_descriptor(&desc).is_err());
    }

    #[test]
    fn test_duplicate_kids_are_all_kept() {
        let mut second = descriptor("shared");
        second.alg = "RS512".to_string();
        let distribution = KeyDistribution {
            keys: vec![descriptor("shared"), second, descriptor("other")],
        };

        let keys = index_keys(&distribution);
        assert_eq!(keys.len(), 2);
        let shared = &keys["shared"];
        assert_eq!(shared.len(), 2);
        assert_eq!(shared[0].algorithm(), Algorithm::RS256);
        assert_eq!(shared[1].algorithm(), Algorithm::RS512);
    }

    #[test]
    fn test_unusable_descriptors_are_skipped() {
        let mut broken = descriptor("broken");
        broken.n = "***".to_string();
        let distribution = KeyDistribution {
            keys: vec![broken, descriptor("good")],
        };

        let keys = index_keys(&distribution);
        assert!(keys.contains_key("good"));
        assert!(!keys.contains_key("broken"));
    }

    #[test]
    fn test_descriptor_wire_format() {
        let json = r#"{"keys":[{"alg":"RS256","e":"AQAB","kid":"k1","kty":"RSA","n":"AQAB","use":"sig"}]}"#;
        let parsed: KeyDistribution = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.keys[0].key_use.as_deref(), Some("sig"));
        assert_eq!(parsed.keys[0].kid, "k1");
    }
}
