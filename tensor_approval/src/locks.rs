// SPDX-License-Identifier: MIT OR Apache-2.0
//! Per-request mutual exclusion.
//!
//! At most one operation touches a request identifier at a time. Acquisition
//! never waits: a held identifier is reported as contention and the caller
//! decides whether to come back later.

#![allow(clippy::significant_drop_tightening)]

use std::collections::HashSet;

use parking_lot::Mutex;

use crate::{ApprovalError, Result};

/// Registry of identifiers currently being operated on.
#[derive(Debug, Default)]
pub struct LockRegistry {
    held: Mutex<HashSet<String>>,
}

impl LockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `id`, failing with `Contention` if someone else holds it.
    ///
    /// The claim is released when the returned guard drops.
    pub fn try_acquire(&self, id: &str) -> Result<RequestLock<'_>> {
        let mut held = self.held.lock();
        if !held.insert(id.to_string()) {
            return Err(ApprovalError::Contention(format!(
                "someone else is currently operating on request {id}"
            )));
        }
        Ok(RequestLock {
            registry: self,
            id: id.to_string(),
        })
    }

    pub fn is_locked(&self, id: &str) -> bool {
        self.held.lock().contains(id)
    }

    pub fn held_count(&self) -> usize {
        self.held.lock().len()
    }

    fn release(&self, id: &str) {
        self.held.lock().remove(id);
    }
}

/// Exclusive claim on one request identifier.
#[derive(Debug)]
pub struct RequestLock<'a> {
    registry: &'a LockRegistry,
    id: String,
}

impl RequestLock<'_> {
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl Drop for RequestLock<'_> {
    fn drop(&mut self) {
        self.registry.release(&self.id);
    }
}
