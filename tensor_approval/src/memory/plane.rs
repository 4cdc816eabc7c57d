// SPDX-License-Identifier: MIT OR Apache-2.0
//! In-process control plane: tokens, policies and roles.
//!
//! Authority model:
//! - root credentials may do anything;
//! - token-issuer credentials may only create tokens;
//! - ordinary credentials may look themselves up and read policies and
//!   roles, except policies explicitly hidden from them.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};

use dashmap::{DashMap, DashSet};
use parking_lot::Mutex;
use rand::RngCore;

use crate::{
    backend::{ControlPlane, Credential, CredentialScope, Identity, IssuedToken, TokenSpec},
    error::{BackendError, BackendResult},
};

#[derive(Debug, Clone)]
struct TokenEntry {
    display_name: String,
    policies: Vec<String>,
    scope: Option<CredentialScope>,
    hidden: HashSet<String>,
    accessor: String,
}

/// Consume one injected failure, if any remain.
fn take_failure(remaining: &AtomicUsize) -> bool {
    remaining
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

fn random_hex(len: usize) -> String {
    let mut bytes = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// [`ControlPlane`] over concurrent maps, with failure injection.
#[derive(Default)]
pub struct MemoryControlPlane {
    tokens: DashMap<String, TokenEntry>,
    policies: DashMap<String, String>,
    roles: DashSet<String>,
    /// Reconstructed root secrets not yet minted.
    pending_roots: DashSet<String>,
    /// Wrapping token to the token it delivers.
    deliveries: DashMap<String, String>,
    issued_specs: Mutex<Vec<TokenSpec>>,
    failing_writes: DashSet<String>,
    failing_mints: AtomicUsize,
    failing_revokes: AtomicUsize,
    writes: AtomicUsize,
    revocations: AtomicUsize,
}

impl MemoryControlPlane {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an ordinary user and return their credential.
    pub fn add_user(&self, display_name: &str) -> Credential {
        let token = format!("s.{}", random_hex(12));
        self.tokens.insert(
            token.clone(),
            TokenEntry {
                display_name: display_name.to_string(),
                policies: vec!["default".to_string()],
                scope: None,
                hidden: HashSet::new(),
                accessor: random_hex(12),
            },
        );
        Credential::new(token)
    }

    /// Deny `credential` read access to `policy`.
    pub fn hide_policy(&self, credential: &Credential, policy: &str) {
        if let Some(mut entry) = self.tokens.get_mut(credential.expose()) {
            entry.hidden.insert(policy.to_string());
        }
    }

    /// Seed or overwrite a policy outside any approval.
    pub fn set_policy(&self, name: &str, rules: &str) {
        self.policies.insert(name.to_string(), rules.to_string());
    }

    pub fn remove_policy(&self, name: &str) {
        self.policies.remove(name);
    }

    pub fn policy(&self, name: &str) -> Option<String> {
        self.policies.get(name).map(|r| r.value().clone())
    }

    pub fn policies(&self) -> BTreeMap<String, String> {
        self.policies
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    pub fn add_role(&self, role: &str) {
        self.roles.insert(role.to_string());
    }

    /// Make every later write or delete of `policy` fail.
    pub fn fail_writes_to(&self, policy: &str) {
        self.failing_writes.insert(policy.to_string());
    }

    /// Make the next `count` calls to `mint` fail.
    pub fn fail_next_mints(&self, count: usize) {
        self.failing_mints.store(count, Ordering::SeqCst);
    }

    /// Make the next `count` calls to `revoke` fail, leaving the token live.
    pub fn fail_next_revokes(&self, count: usize) {
        self.failing_revokes.store(count, Ordering::SeqCst);
    }

    /// Successful policy writes and deletes so far.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn revocation_count(&self) -> usize {
        self.revocations.load(Ordering::SeqCst)
    }

    /// Minted credentials that have not been revoked.
    pub fn live_elevated_count(&self) -> usize {
        self.tokens.iter().filter(|e| e.scope.is_some()).count()
    }

    /// Specifications passed to `create_token`, in call order.
    pub fn issued_specs(&self) -> Vec<TokenSpec> {
        self.issued_specs.lock().clone()
    }

    /// Redeem a wrapping token handed out by `create_token`.
    pub fn redeem_delivery(&self, wrapping_token: &str) -> Option<Credential> {
        self.deliveries
            .remove(wrapping_token)
            .map(|(_, token)| Credential::new(token))
    }

    /// Accept `secret` as a root secret for one later `mint`.
    pub(crate) fn register_root(&self, secret: &str) {
        self.pending_roots.insert(secret.to_string());
    }

    fn entry(&self, credential: &Credential) -> BackendResult<TokenEntry> {
        self.tokens
            .get(credential.expose())
            .map(|e| e.value().clone())
            .ok_or_else(|| BackendError::PermissionDenied("invalid token".to_string()))
    }

    fn require_root(&self, credential: &Credential) -> BackendResult<TokenEntry> {
        let entry = self.entry(credential)?;
        if entry.scope != Some(CredentialScope::Root) {
            return Err(BackendError::PermissionDenied(
                "1 error occurred:\n\t* permission denied".to_string(),
            ));
        }
        Ok(entry)
    }

    fn write_guard(&self, name: &str) -> BackendResult<()> {
        if self.failing_writes.contains(name) {
            return Err(BackendError::Unavailable(format!(
                "write to sys/policies/acl/{name} failed: code 500: internal error"
            )));
        }
        Ok(())
    }
}

impl ControlPlane for MemoryControlPlane {
    fn who_am_i(&self, credential: &Credential) -> BackendResult<Identity> {
        let entry = self.entry(credential)?;
        Ok(Identity {
            display_name: entry.display_name,
            policies: entry.policies,
        })
    }

    fn list_policies(&self, credential: &Credential) -> BackendResult<Vec<String>> {
        let entry = self.entry(credential)?;
        if entry.scope == Some(CredentialScope::TokenIssuer) {
            return Err(BackendError::PermissionDenied("permission denied".to_string()));
        }
        let mut names: Vec<String> = self.policies.iter().map(|e| e.key().clone()).collect();
        names.sort();
        Ok(names)
    }

    fn read_policy(&self, credential: &Credential, name: &str) -> BackendResult<String> {
        let entry = self.entry(credential)?;
        if entry.hidden.contains(name) || entry.scope == Some(CredentialScope::TokenIssuer) {
            return Err(BackendError::PermissionDenied(format!(
                "cannot read policy {name}: permission denied"
            )));
        }
        Ok(self.policy(name).unwrap_or_default())
    }

    fn write_policy(&self, credential: &Credential, name: &str, rules: &str) -> BackendResult<()> {
        self.require_root(credential)?;
        self.write_guard(name)?;
        self.policies.insert(name.to_string(), rules.to_string());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn delete_policy(&self, credential: &Credential, name: &str) -> BackendResult<()> {
        self.require_root(credential)?;
        self.write_guard(name)?;
        self.policies.remove(name);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn read_role(&self, credential: &Credential, role: &str) -> BackendResult<()> {
        self.entry(credential)?;
        if self.roles.contains(role) {
            Ok(())
        } else {
            Err(BackendError::NotFound(format!("role {role}")))
        }
    }

    fn create_token(
        &self,
        credential: &Credential,
        spec: &TokenSpec,
    ) -> BackendResult<IssuedToken> {
        let parent = self.entry(credential)?;
        if parent.scope.is_none() {
            return Err(BackendError::PermissionDenied(
                "permission denied".to_string(),
            ));
        }
        if spec.orphan && spec.role.is_some() {
            return Err(BackendError::Invalid(
                "orphan and role are mutually exclusive".to_string(),
            ));
        }
        if let Some(role) = &spec.role {
            if !self.roles.contains(role) {
                return Err(BackendError::NotFound(format!("role {role}")));
            }
        }

        let token = format!("s.{}", random_hex(12));
        let accessor = random_hex(12);
        let display_name = if spec.request.display_name.is_empty() {
            "token".to_string()
        } else {
            format!("token-{}", spec.request.display_name)
        };
        self.tokens.insert(
            token.clone(),
            TokenEntry {
                display_name,
                policies: spec.request.policies.clone(),
                scope: None,
                hidden: HashSet::new(),
                accessor: accessor.clone(),
            },
        );

        let wrapping_token = format!("s.{}", random_hex(12));
        self.deliveries.insert(wrapping_token.clone(), token);
        self.issued_specs.lock().push(spec.clone());

        Ok(IssuedToken {
            wrapping_token,
            wrap_ttl_secs: spec.wrap_ttl.as_secs(),
            accessor,
        })
    }

    fn mint(&self, secret: &str, scope: CredentialScope) -> BackendResult<Credential> {
        if take_failure(&self.failing_mints) {
            return Err(BackendError::Unavailable(
                "create token: code 503: service unavailable".to_string(),
            ));
        }
        if self.pending_roots.remove(secret).is_none() {
            return Err(BackendError::PermissionDenied(
                "secret is not a valid root token".to_string(),
            ));
        }
        let token = format!("s.{}", random_hex(12));
        let policies = match scope {
            CredentialScope::Root => vec!["root".to_string()],
            CredentialScope::TokenIssuer => vec!["token-issuer".to_string()],
        };
        self.tokens.insert(
            token.clone(),
            TokenEntry {
                display_name: "root".to_string(),
                policies,
                scope: Some(scope),
                hidden: HashSet::new(),
                accessor: random_hex(12),
            },
        );
        Ok(Credential::new(token))
    }

    fn revoke(&self, credential: &Credential) -> BackendResult<()> {
        if take_failure(&self.failing_revokes) {
            return Err(BackendError::Unavailable(
                "revoke self: code 503: service unavailable".to_string(),
            ));
        }
        match self.tokens.remove(credential.expose()) {
            Some((_, entry)) => {
                tracing::debug!(accessor = %entry.accessor, "credential revoked");
                self.revocations.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            None => Err(BackendError::NotFound("token not found".to_string())),
        }
    }
}
