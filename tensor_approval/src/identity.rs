// SPDX-License-Identifier: MIT OR Apache-2.0
//! Content-derived request identifiers.
//!
//! A request is addressed by the SHA-256 of its immutable fields. The same
//! digest doubles as an integrity check on every read, because privileged
//! operators can write arbitrary bytes to the backing store.

use std::fmt;

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::{ApprovalError, Result};

/// Domain tag mixed into every request digest.
const HASH_DOMAIN: &str = "tensor_approval:request:v1";

/// Hex length of a request identifier.
pub const REQUEST_ID_LEN: usize = 64;

/// Opaque, fixed-length identifier of a request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(String);

impl RequestId {
    /// Parse a caller-supplied identifier.
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if raw.len() != REQUEST_ID_LEN {
            return Err(ApprovalError::Validation(format!(
                "request id must be {REQUEST_ID_LEN} hex characters"
            )));
        }
        if !raw
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
        {
            return Err(ApprovalError::Validation(
                "request id must be lowercase hex".to_string(),
            ));
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for RequestId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// The hashed view of a request. Volatile fields never appear here.
#[derive(Serialize)]
pub(crate) struct HashInput<'a> {
    pub kind: &'a str,
    pub requester: &'a str,
    pub requester_hash: &'a str,
    pub required: usize,
    pub payload: serde_json::Value,
}

/// Digest a request's immutable fields into its identifier.
pub(crate) fn digest(input: &HashInput<'_>) -> Result<RequestId> {
    // serde_json maps are ordered, so the encoding is canonical.
    let encoded = serde_json::to_vec(input)?;
    let mut hasher = Sha256::new();
    hasher.update(HASH_DOMAIN.as_bytes());
    hasher.update([0u8]);
    hasher.update(&encoded);
    Ok(RequestId(hex::encode(hasher.finalize())))
}

/// One-way digest of a requester's display name.
pub fn requester_hash(display_name: &str) -> String {
    hex::encode(Sha256::digest(display_name.as_bytes()))
}

/// Reject a stored record whose recomputed identifier differs.
pub(crate) fn check_integrity(expected: &RequestId, actual: &RequestId) -> Result<()> {
    if expected == actual {
        Ok(())
    } else {
        Err(ApprovalError::Integrity(format!(
            "stored request does not hash to {expected}"
        )))
    }
}
