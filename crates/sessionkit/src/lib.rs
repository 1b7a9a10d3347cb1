//! # sessionkit - Session & Authorization Engine
//!
//! Relying-party client for a multi-tenant identity provider: validates the
//! session tokens it issues, evaluates tenant/role/permission claims, drives
//! refresh and tenant selection, and authenticates outbound calls.
//!
//! ## Architecture
//!
//! - [`cache`] - single-flight memoized fetch shared by the key set and the
//!   optional license header
//! - [`jwt`] - [`Token`], signing keys ([`jwt::KeySet`]) and [`jwt::TokenValidator`]
//! - [`authz`] - pure permission/role checks, optionally scoped to a tenant
//! - [`session`] - [`SessionLifecycle`]: validate, refresh, fallback, tenant
//!   selection, logout, access-key exchange
//! - [`bearer`] - bearer credential composition and [`RequestAuthenticator`]
//! - [`transport`] - one HTTP client per caller role, structured remote errors,
//!   cancellation
//! - [`config`] / [`client`] - configuration and wiring
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use sessionkit::{AuthClient, ClientConfig, authz};
//!
//! # async fn example(session_jwt: &str, refresh_jwt: &str) -> Result<(), sessionkit::AuthError> {
//! let config = ClientConfig::builder("P2abc")
//!     .auth_management_key("optional-key")
//!     .build()?;
//! let client = AuthClient::new(config)?;
//!
//! let token = client
//!     .sessions()
//!     .validate_and_refresh_session(session_jwt, refresh_jwt)
//!     .await?;
//!
//! if authz::validate_permissions(&token, &["reports:read"], Some("t1")) {
//!     println!("{} may read reports of t1", token.subject_id());
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Logging
//!
//! Events are emitted with `tracing`; install a subscriber to see them. Keys,
//! JWTs and access keys never appear in log fields or `Debug` output.

pub mod authz;
pub mod bearer;
pub mod cache;
pub mod client;
pub mod config;
pub mod error;
pub mod jwt;
pub mod session;
pub mod transport;

#[doc(inline)]
pub use bearer::{BearerContext, CallCredentials, CallerRole, RequestAuthenticator, compose_bearer};
#[doc(inline)]
pub use client::AuthClient;
#[doc(inline)]
pub use config::{ClientConfig, ClientConfigBuilder};
#[doc(inline)]
pub use error::{AuthError, AuthResult, ErrorCode};
#[doc(inline)]
pub use jwt::{Clock, KeySet, SystemClock, Token, TokenValidator};
#[doc(inline)]
pub use session::{LoginOptions, Session, SessionLifecycle, UserSnapshot};
