// SPDX-License-Identifier: MIT OR Apache-2.0
//! Persistence of request records and their accumulated shares.
//!
//! A record lives under `_areq:<id>` and its share list under
//! `_ashares:<id>`. The share list is a JSON array of envelope tokens, each
//! sealing one submitted share; plaintext shares are never stored.

use std::time::Duration;

use zeroize::Zeroizing;

use crate::{
    backend::SecretStore,
    error::{redact_upstream, BackendError},
    identity::{check_integrity, RequestId},
    request::Request,
    ApprovalError, Result,
};

const REQUEST_PREFIX: &str = "_areq:";
const SHARES_PREFIX: &str = "_ashares:";

fn request_key(id: &RequestId) -> String {
    format!("{REQUEST_PREFIX}{id}")
}

fn shares_key(id: &RequestId) -> String {
    format!("{SHARES_PREFIX}{id}")
}

/// Shares recovered from their envelopes.
pub struct Redeemed {
    /// Plaintext shares in submission order.
    pub shares: Vec<Zeroizing<String>>,
    /// Envelopes that could not be redeemed.
    pub dropped: usize,
}

/// Record and share storage over a [`SecretStore`].
///
/// Callers must hold the request's lock for every mutating call.
pub struct QuorumLedger<'a> {
    store: &'a dyn SecretStore,
    share_ttl: Duration,
    error_limit: usize,
}

impl<'a> QuorumLedger<'a> {
    pub fn new(store: &'a dyn SecretStore, share_ttl: Duration, error_limit: usize) -> Self {
        Self {
            store,
            share_ttl,
            error_limit,
        }
    }

    fn storage(&self, err: BackendError) -> ApprovalError {
        ApprovalError::Storage(redact_upstream(&err.to_string(), self.error_limit))
    }

    /// Load the record stored under `id`, verifying it still hashes to `id`.
    pub fn load_request(&self, id: &RequestId) -> Result<Option<Request>> {
        let Some(bytes) = self
            .store
            .get(&request_key(id))
            .map_err(|e| self.storage(e))?
        else {
            return Ok(None);
        };
        let request: Request = serde_json::from_slice(&bytes)?;
        check_integrity(id, &request.id()?)?;
        Ok(Some(request))
    }

    pub fn save_request(&self, id: &RequestId, request: &Request) -> Result<()> {
        let bytes = serde_json::to_vec(request)?;
        self.store
            .put(&request_key(id), bytes)
            .map_err(|e| self.storage(e))
    }

    /// Envelope tokens accumulated for `id`, oldest first.
    pub fn load_shares(&self, id: &RequestId) -> Result<Vec<String>> {
        match self.store.get(&shares_key(id)).map_err(|e| self.storage(e))? {
            Some(bytes) => Ok(serde_json::from_slice(&bytes)?),
            None => Ok(Vec::new()),
        }
    }

    fn save_shares(&self, id: &RequestId, wrapped: &[String]) -> Result<()> {
        if wrapped.is_empty() {
            return self.delete_share_list(id);
        }
        let bytes = serde_json::to_vec(wrapped)?;
        self.store
            .put(&shares_key(id), bytes)
            .map_err(|e| self.storage(e))
    }

    fn seal(&self, share: &str) -> Result<String> {
        self.store
            .wrap(self.share_ttl, share.as_bytes())
            .map_err(|e| self.storage(e))
    }

    /// Seal `share` and append it. Returns the new share count.
    ///
    /// Shares are not deduplicated; the reconstruction protocol rejects
    /// repeats.
    pub fn append_share(&self, id: &RequestId, share: &str) -> Result<usize> {
        let mut wrapped = self.load_shares(id)?;
        wrapped.push(self.seal(share)?);
        self.save_shares(id, &wrapped)?;
        Ok(wrapped.len())
    }

    /// Open every envelope accumulated for `id`.
    ///
    /// Envelopes are single use, so after this call the stored list is
    /// spent; survivors must be put back with [`Self::restore_shares`] if
    /// the approval does not complete.
    pub fn redeem(&self, id: &RequestId) -> Result<Redeemed> {
        let wrapped = self.load_shares(id)?;
        let mut shares = Vec::with_capacity(wrapped.len());
        let mut dropped = 0;
        for (position, token) in wrapped.iter().enumerate() {
            match self.store.unwrap(token) {
                Ok(bytes) => match std::str::from_utf8(&bytes) {
                    Ok(text) => shares.push(Zeroizing::new(text.to_string())),
                    Err(_) => {
                        tracing::warn!(request = %id, position, "envelope held non-utf8 share");
                        dropped += 1;
                    }
                },
                Err(err) => {
                    tracing::warn!(
                        request = %id,
                        position,
                        error = %err,
                        "share envelope unavailable"
                    );
                    dropped += 1;
                }
            }
        }
        Ok(Redeemed { shares, dropped })
    }

    /// Reseal `shares` as the share list for `id`. Returns the count kept.
    pub fn restore_shares(&self, id: &RequestId, shares: &[Zeroizing<String>]) -> Result<usize> {
        let wrapped = shares
            .iter()
            .map(|share| self.seal(share))
            .collect::<Result<Vec<_>>>()?;
        self.save_shares(id, &wrapped)?;
        Ok(wrapped.len())
    }

    fn delete_share_list(&self, id: &RequestId) -> Result<()> {
        self.store
            .delete(&shares_key(id))
            .map_err(|e| self.storage(e))
    }

    /// Discard every share for `id`, burning envelopes that are still open.
    pub fn purge_shares(&self, id: &RequestId) -> Result<()> {
        for token in self.load_shares(id)? {
            // Already-spent envelopes fail here; nothing is left to burn.
            let _ = self.store.unwrap(&token);
        }
        self.delete_share_list(id)
    }

    /// Remove the share list and the record.
    pub fn purge(&self, id: &RequestId) -> Result<()> {
        self.purge_shares(id)?;
        self.store
            .delete(&request_key(id))
            .map_err(|e| self.storage(e))
    }
}
