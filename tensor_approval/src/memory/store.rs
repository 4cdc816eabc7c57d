// SPDX-License-Identifier: MIT OR Apache-2.0
//! In-process secret store with single-use expiring envelopes.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use rand::RngCore;
use zeroize::Zeroizing;

use crate::{
    backend::SecretStore,
    error::{BackendError, BackendResult},
};

/// Storage prefix for wrapped payloads.
const WRAP_PREFIX: &str = "_awrap:";

struct Envelope {
    payload: Zeroizing<Vec<u8>>,
    expires_at: Instant,
}

fn generate_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!("{WRAP_PREFIX}{}", hex::encode(bytes))
}

/// [`SecretStore`] backed by concurrent maps.
#[derive(Default)]
pub struct MemorySecretStore {
    entries: DashMap<String, Vec<u8>>,
    envelopes: DashMap<String, Envelope>,
    /// Wraps allowed before the store starts failing them; `None` is unlimited.
    wrap_budget: Mutex<Option<usize>>,
}

impl MemorySecretStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of plain entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Envelopes not yet redeemed (expired ones included).
    pub fn envelope_count(&self) -> usize {
        self.envelopes.len()
    }

    /// Let `count` more wraps succeed, then fail every later one.
    pub fn fail_wraps_after(&self, count: usize) {
        *self.wrap_budget.lock() = Some(count);
    }

    /// Stop failing wraps.
    pub fn heal_wraps(&self) {
        *self.wrap_budget.lock() = None;
    }

    /// Expire every outstanding envelope immediately.
    pub fn expire_envelopes(&self) {
        let now = Instant::now();
        for mut envelope in self.envelopes.iter_mut() {
            envelope.expires_at = now;
        }
    }
}

impl SecretStore for MemorySecretStore {
    fn get(&self, key: &str) -> BackendResult<Option<Vec<u8>>> {
        Ok(self.entries.get(key).map(|v| v.value().clone()))
    }

    fn put(&self, key: &str, value: Vec<u8>) -> BackendResult<()> {
        self.entries.insert(key.to_string(), value);
        Ok(())
    }

    fn delete(&self, key: &str) -> BackendResult<()> {
        self.entries.remove(key);
        Ok(())
    }

    fn wrap(&self, ttl: Duration, payload: &[u8]) -> BackendResult<String> {
        if ttl.is_zero() {
            return Err(BackendError::Invalid("wrap ttl must be positive".to_string()));
        }
        if let Some(budget) = self.wrap_budget.lock().as_mut() {
            if *budget == 0 {
                return Err(BackendError::Unavailable(
                    "sys/wrapping/wrap: code 503: storage unavailable".to_string(),
                ));
            }
            *budget -= 1;
        }
        let token = generate_token();
        self.envelopes.insert(
            token.clone(),
            Envelope {
                payload: Zeroizing::new(payload.to_vec()),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(token)
    }

    fn unwrap(&self, token: &str) -> BackendResult<Zeroizing<Vec<u8>>> {
        // Removal first: a token is spent even when it turns out expired.
        let (_, envelope) = self.envelopes.remove(token).ok_or_else(|| {
            BackendError::EnvelopeUnavailable(
                "wrapping token is not valid or does not exist".to_string(),
            )
        })?;
        if Instant::now() >= envelope.expires_at {
            return Err(BackendError::EnvelopeUnavailable(
                "wrapping token has expired".to_string(),
            ));
        }
        Ok(envelope.payload)
    }
}
