//! Common test utilities for integration tests
//!
//! A wiremock-backed identity provider plus RSA test keys that publish
//! themselves as key descriptors and sign tokens.

#![allow(dead_code)]

use std::sync::LazyLock;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use jsonwebtoken::{Algorithm, EncodingKey, Header, encode};
use serde_json::{Value, json};
use sessionkit::{AuthClient, ClientConfig, Clock};
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

pub const PROJECT_ID: &str = "P1";

/// RSA key that can sign tokens and describe itself on the wire
pub struct TestKey {
    pub kid: String,
    pub n: String,
    pub e: String,
    encoding: EncodingKey,
}

impl TestKey {
    /// Generate a fresh 2048-bit key
    pub fn generate(kid: &str) -> Self {
        use rsa::RsaPrivateKey;
        use rsa::pkcs8::{EncodePrivateKey, LineEnding};
        use rsa::traits::PublicKeyParts;

        let mut rng = rand::thread_rng();
        let private_key = RsaPrivateKey::new(&mut rng, 2048).expect("Failed to generate RSA key");
        let public_key = private_key.to_public_key();

        let pem = private_key
            .to_pkcs8_pem(LineEnding::LF)
            .expect("Failed to encode private key");
        let encoding = EncodingKey::from_rsa_pem(pem.as_bytes()).expect("Invalid RSA key");

        Self {
            kid: kid.to_string(),
            n: URL_SAFE_NO_PAD.encode(public_key.n().to_bytes_be()),
            e: URL_SAFE_NO_PAD.encode(public_key.e().to_bytes_be()),
            encoding,
        }
    }

    /// Key descriptor as served by the key-distribution endpoint
    pub fn descriptor(&self) -> Value {
        self.descriptor_as(&self.kid)
    }

    /// Descriptor published under a different key id
    pub fn descriptor_as(&self, kid: &str) -> Value {
        json!({
            "alg": "RS256",
            "e": self.e,
            "kid": kid,
            "kty": "RSA",
            "n": self.n,
            "use": "sig",
        })
    }

    /// Sign `claims` with RS256 and this key's id
    pub fn sign(&self, claims: &Value) -> String {
        self.sign_as(&self.kid, claims)
    }

    /// Sign `claims` with this key but put `kid` in the header
    pub fn sign_as(&self, kid: &str, claims: &Value) -> String {
        let mut header = Header::new(Algorithm::RS256);
        header.kid = Some(kid.to_string());
        encode(&header, claims, &self.encoding).expect("Failed to encode test JWT")
    }
}

// Key generation is slow in debug builds, so each test binary makes two keys
// and reuses them.
pub static PRIMARY_KEY: LazyLock<TestKey> = LazyLock::new(|| TestKey::generate("key-1"));
pub static ROTATED_KEY: LazyLock<TestKey> = LazyLock::new(|| TestKey::generate("key-2"));

/// Get current Unix timestamp
pub fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("Time went backwards")
        .as_secs()
}

/// Claims for a token of `sub` expiring `exp_offset_secs` from now
pub fn token_claims(sub: &str, exp_offset_secs: i64) -> Value {
    let now = current_timestamp();
    json!({
        "sub": sub,
        "iss": format!("https://api.sessionkit.dev/{PROJECT_ID}"),
        "exp": (now as i64 + exp_offset_secs) as u64,
        "iat": now,
    })
}

/// A valid session token for `sub`
pub fn session_jwt(sub: &str) -> String {
    PRIMARY_KEY.sign(&token_claims(sub, 600))
}

/// A valid refresh token for `sub`
pub fn refresh_jwt(sub: &str) -> String {
    let mut claims = token_claims(sub, 86_400);
    claims["drn"] = json!("DSR");
    PRIMARY_KEY.sign(&claims)
}

/// A session token that expired an hour ago
pub fn expired_session_jwt(sub: &str) -> String {
    PRIMARY_KEY.sign(&token_claims(sub, -3600))
}

/// Clock pinned to one instant
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub SystemTime);

impl FixedClock {
    pub fn at_unix(secs: u64) -> Self {
        Self(UNIX_EPOCH + Duration::from_secs(secs))
    }
}

impl Clock for FixedClock {
    fn now(&self) -> SystemTime {
        self.0
    }
}

/// Mock identity provider
pub struct MockIdentityProvider {
    pub server: MockServer,
}

impl MockIdentityProvider {
    pub async fn start() -> Self {
        Self {
            server: MockServer::start().await,
        }
    }

    pub fn uri(&self) -> String {
        self.server.uri()
    }

    /// Config pointing at this server, without management key
    pub fn config(&self) -> ClientConfig {
        ClientConfig::builder(PROJECT_ID)
            .base_url(self.uri())
            .request_timeout(Duration::from_secs(5))
            .build()
            .expect("valid test config")
    }

    pub fn client(&self) -> AuthClient {
        AuthClient::new(self.config()).expect("client")
    }

    /// Publish `keys` at the key-distribution endpoint
    pub async fn mount_keys(&self, keys: &[&TestKey]) {
        let descriptors: Vec<Value> = keys.iter().map(|key| key.descriptor()).collect();
        self.mount_key_descriptors(descriptors).await;
    }

    pub async fn mount_key_descriptors(&self, descriptors: Vec<Value>) {
        Mock::given(method("GET"))
            .and(path(format!("/v2/keys/{PROJECT_ID}")))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "keys": descriptors })))
            .mount(&self.server)
            .await;
    }

    /// Refresh endpoint that only accepts `refresh_jwt` and issues `session_jwt`
    pub async fn mount_refresh(&self, refresh_jwt: &str, response: Value) {
        Mock::given(method("POST"))
            .and(path("/v1/auth/refresh"))
            .and(header(
                "authorization",
                format!("Bearer {PROJECT_ID}:{refresh_jwt}").as_str(),
            ))
            .respond_with(ResponseTemplate::new(200).set_body_json(response))
            .mount(&self.server)
            .await;
    }
}
