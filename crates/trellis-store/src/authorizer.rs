//! Authorization hook consumed by admission stages.

use std::collections::HashSet;
use std::sync::RwLock;

use trellis_api::signer_name::signer_domain;

use crate::principal::Principal;

/// Resource name under which signer permissions are granted.
pub const SIGNERS_RESOURCE: &str = "signers";

/// Answers whether a principal may perform a verb on a resource.
pub trait Authorizer: Send + Sync {
    /// Whether `principal` holds `verb` on `resource` scoped by
    /// `resource_name`.
    fn authorized(
        &self,
        principal: &Principal,
        verb: &str,
        resource: &str,
        resource_name: &str,
    ) -> bool;
}

/// Check a signer-scoped permission.
///
/// A grant may name the signer exactly (`example.com/foo`) or cover the
/// whole domain with a wildcard (`example.com/*`).
pub fn is_authorized_for_signer_name(
    authz: &dyn Authorizer,
    principal: &Principal,
    verb: &str,
    signer_name: &str,
) -> bool {
    if authz.authorized(principal, verb, SIGNERS_RESOURCE, signer_name) {
        return true;
    }
    let wildcard = format!("{}/*", signer_domain(signer_name));
    authz.authorized(principal, verb, SIGNERS_RESOURCE, &wildcard)
}

/// Explicit allow-list authorizer.
#[derive(Debug, Default)]
pub struct PolicyAuthorizer {
    rules: RwLock<HashSet<(String, String, String, String)>>,
}

impl PolicyAuthorizer {
    /// An authorizer that denies everything until rules are added.
    pub fn new() -> Self {
        Self::default()
    }

    /// Grant `principal` the given verb on `resource`/`resource_name`.
    pub fn allow(&self, principal: &str, verb: &str, resource: &str, resource_name: &str) {
        self.rules.write().expect("authorizer lock poisoned").insert((
            principal.to_string(),
            verb.to_string(),
            resource.to_string(),
            resource_name.to_string(),
        ));
    }
}

impl Authorizer for PolicyAuthorizer {
    fn authorized(
        &self,
        principal: &Principal,
        verb: &str,
        resource: &str,
        resource_name: &str,
    ) -> bool {
        self.rules.read().expect("authorizer lock poisoned").contains(&(
            principal.name.clone(),
            verb.to_string(),
            resource.to_string(),
            resource_name.to_string(),
        ))
    }
}

/// Authorizer that grants everything. Test-only convenience.
#[derive(Clone, Copy, Debug, Default)]
pub struct AllowAll;

impl Authorizer for AllowAll {
    fn authorized(&self, _: &Principal, _: &str, _: &str, _: &str) -> bool {
        true
    }
}
