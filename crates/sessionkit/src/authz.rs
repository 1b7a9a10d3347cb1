//! Permission and role checks over validated token claims
//!
//! Every check takes an optional tenant. Without one (or with an empty
//! string) the top-level `permissions`/`roles` claim is consulted. With one,
//! the token must be associated with that tenant, meaning the tenant id is a
//! key of the `tenants` claim, and the list nested under it is consulted
//! instead. An unassociated tenant fails every check.
//!
//! A missing or malformed claim counts as an empty grant list, so it never
//! raises an error: `validate_*` is false unless nothing was requested, and
//! `get_matched_*` is empty.
//!
//! ```rust,no_run
//! # use sessionkit::{authz, Token};
//! # fn example(token: &Token) {
//! if authz::validate_permissions(token, &["billing:read"], Some("t1")) {
//!     // caller may read billing data of tenant t1
//! }
//! # }
//! ```

use serde_json::Value;

use crate::jwt::{PERMISSIONS_CLAIM, ROLES_CLAIM, TENANTS_CLAIM, Token};

/// Which claim to read and under which tenant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClaimQuery<'a> {
    pub claim_name: &'a str,
    pub tenant_id: Option<&'a str>,
}

impl<'a> ClaimQuery<'a> {
    pub fn new(claim_name: &'a str, tenant_id: Option<&'a str>) -> Self {
        Self {
            claim_name,
            tenant_id: tenant_id.filter(|tenant| !tenant.is_empty()),
        }
    }

    /// Values granted to the token for this claim.
    ///
    /// `None` when a tenant was named and the token is not associated with it.
    pub fn granted<'t>(&self, token: &'t Token) -> Option<Vec<&'t str>> {
        let source = match self.tenant_id {
            Some(tenant) => token
                .claim(TENANTS_CLAIM)
                .and_then(Value::as_object)?
                .get(tenant)?
                .get(self.claim_name),
            None => token.claim(self.claim_name),
        };
        Some(string_list(source))
    }
}

fn string_list(value: Option<&Value>) -> Vec<&str> {
    value
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default()
}

fn validate<S: AsRef<str>>(query: ClaimQuery<'_>, token: &Token, requested: &[S]) -> bool {
    match query.granted(token) {
        Some(granted) => requested
            .iter()
            .all(|value| granted.contains(&value.as_ref())),
        None => false,
    }
}

fn matched<S: AsRef<str>>(query: ClaimQuery<'_>, token: &Token, requested: &[S]) -> Vec<String> {
    let Some(granted) = query.granted(token) else {
        return Vec::new();
    };
    requested
        .iter()
        .filter(|value| granted.contains(&value.as_ref()))
        .map(|value| value.as_ref().to_string())
        .collect()
}

/// Whether the token carries `tenant` in its `tenants` claim
pub fn is_associated_with_tenant(token: &Token, tenant: &str) -> bool {
    token
        .claim(TENANTS_CLAIM)
        .and_then(Value::as_object)
        .is_some_and(|tenants| tenants.contains_key(tenant))
}

/// Tenant ids the token is associated with
pub fn tenant_ids(token: &Token) -> Vec<String> {
    token.tenant_ids()
}

/// True when every requested permission is granted
pub fn validate_permissions<S: AsRef<str>>(
    token: &Token,
    permissions: &[S],
    tenant: Option<&str>,
) -> bool {
    validate(ClaimQuery::new(PERMISSIONS_CLAIM, tenant), token, permissions)
}

/// The requested permissions that are granted, in request order
pub fn get_matched_permissions<S: AsRef<str>>(
    token: &Token,
    permissions: &[S],
    tenant: Option<&str>,
) -> Vec<String> {
    matched(ClaimQuery::new(PERMISSIONS_CLAIM, tenant), token, permissions)
}

/// True when every requested role is granted
pub fn validate_roles<S: AsRef<str>>(token: &Token, roles: &[S], tenant: Option<&str>) -> bool {
    validate(ClaimQuery::new(ROLES_CLAIM, tenant), token, roles)
}

/// The requested roles that are granted, in request order
pub fn get_matched_roles<S: AsRef<str>>(
    token: &Token,
    roles: &[S],
    tenant: Option<&str>,
) -> Vec<String> {
    matched(ClaimQuery::new(ROLES_CLAIM, tenant), token, roles)
}
