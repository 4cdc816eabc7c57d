// SPDX-License-Identifier: MIT OR Apache-2.0
//! Boundary traits for the systems the broker drives.
//!
//! The broker never talks to a network or a disk itself. Every side effect
//! goes through one of these traits, so a deployment plugs in real clients
//! and tests plug in [`crate::memory`].

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::error::BackendResult;

/// An authentication token presented to the control plane.
///
/// The token text is zeroized on drop and never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(Zeroizing<String>);

impl Credential {
    pub fn new(token: impl Into<String>) -> Self {
        Self(Zeroizing::new(token.into()))
    }

    pub fn expose(&self) -> &str {
        self.0.as_str()
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(***)")
    }
}

/// Result of a self-lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub display_name: String,
    pub policies: Vec<String>,
}

/// How much authority a minted credential carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialScope {
    /// Full root authority.
    Root,
    /// Enough authority to issue tokens, nothing else.
    TokenIssuer,
}

/// State of the external root generation protocol after a call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationStatus {
    pub nonce: String,
    pub progress: usize,
    pub required: usize,
    /// Base64 root token blinded with the OTP, present once complete.
    pub encoded_root: Option<String>,
}

impl GenerationStatus {
    pub fn is_complete(&self) -> bool {
        self.encoded_root.is_some()
    }
}

/// Parameters for a token creation call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenCreateRequest {
    pub policies: Vec<String>,
    pub ttl: String,
    pub explicit_max_ttl: String,
    pub display_name: String,
    pub num_uses: u32,
    pub renewable: Option<bool>,
    pub meta: BTreeMap<String, String>,
    /// Always forced on so the token survives revocation of its parent.
    pub no_parent: bool,
}

/// Full specification handed to [`ControlPlane::create_token`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenSpec {
    pub request: TokenCreateRequest,
    pub orphan: bool,
    pub role: Option<String>,
    pub wrap_ttl: Duration,
}

/// Wrapped delivery of a freshly created token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssuedToken {
    /// Single-use wrapping token that redeems the new token.
    pub wrapping_token: String,
    pub wrap_ttl_secs: u64,
    pub accessor: String,
}

/// Key/value storage scoped to the broker plus single-use envelopes.
pub trait SecretStore: Send + Sync {
    fn get(&self, key: &str) -> BackendResult<Option<Vec<u8>>>;

    fn put(&self, key: &str, value: Vec<u8>) -> BackendResult<()>;

    /// Deleting a missing key succeeds.
    fn delete(&self, key: &str) -> BackendResult<()>;

    /// Seal `payload` behind a token redeemable once before `ttl` elapses.
    fn wrap(&self, ttl: Duration, payload: &[u8]) -> BackendResult<String>;

    /// Redeem an envelope. Fails with `EnvelopeUnavailable` once consumed or
    /// expired.
    fn unwrap(&self, token: &str) -> BackendResult<Zeroizing<Vec<u8>>>;
}

/// The external threshold reconstruction protocol.
///
/// It holds one global generation at a time.
pub trait RootGenerator: Send + Sync {
    /// Live number of shares needed to reconstruct.
    fn required(&self) -> BackendResult<usize>;

    fn init(&self, otp: &str) -> BackendResult<GenerationStatus>;

    fn submit_share(&self, share: &str, nonce: &str) -> BackendResult<GenerationStatus>;

    fn cancel(&self) -> BackendResult<()>;
}

/// Read-only oracle for the desired policy set at a given revision.
pub trait PolicySource: Send + Sync {
    /// Policy name to policy text for every document under `path`.
    fn fetch_proposed(&self, revision: &str, path: &str) -> BackendResult<BTreeMap<String, String>>;
}

/// The managed system: identities, policies, roles and tokens.
pub trait ControlPlane: Send + Sync {
    fn who_am_i(&self, credential: &Credential) -> BackendResult<Identity>;

    fn list_policies(&self, credential: &Credential) -> BackendResult<Vec<String>>;

    /// Empty text when the policy does not exist.
    fn read_policy(&self, credential: &Credential, name: &str) -> BackendResult<String>;

    fn write_policy(&self, credential: &Credential, name: &str, rules: &str) -> BackendResult<()>;

    fn delete_policy(&self, credential: &Credential, name: &str) -> BackendResult<()>;

    fn read_role(&self, credential: &Credential, role: &str) -> BackendResult<()>;

    fn create_token(&self, credential: &Credential, spec: &TokenSpec)
        -> BackendResult<IssuedToken>;

    /// Turn a reconstructed secret into a usable credential.
    fn mint(&self, secret: &str, scope: CredentialScope) -> BackendResult<Credential>;

    fn revoke(&self, credential: &Credential) -> BackendResult<()>;
}
