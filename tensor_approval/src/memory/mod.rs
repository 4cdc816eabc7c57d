// SPDX-License-Identifier: MIT OR Apache-2.0
//! In-process implementations of every collaborator.
//!
//! Nothing here talks to a network. The root generator performs real
//! threshold reconstruction, so wrong or repeated shares fail the same way
//! they would against a live system.

mod generator;
mod plane;
mod source;
mod store;

use std::sync::Arc;

pub use generator::{MemoryRootGenerator, UNSEAL_KEY_LEN};
pub use plane::MemoryControlPlane;
pub use source::StaticPolicySource;
pub use store::MemorySecretStore;

use crate::{broker::ApprovalBroker, error::BackendResult, ApprovalConfig, Result};

/// A complete set of in-memory collaborators plus the unseal shares.
pub struct Sandbox {
    pub store: Arc<MemorySecretStore>,
    pub generator: Arc<MemoryRootGenerator>,
    pub plane: Arc<MemoryControlPlane>,
    pub source: Arc<StaticPolicySource>,
    /// Base64 unseal shares, `threshold` of which reconstruct the root.
    pub shares: Vec<String>,
}

impl Sandbox {
    pub fn new(total: u8, threshold: u8) -> BackendResult<Self> {
        let plane = Arc::new(MemoryControlPlane::new());
        let (generator, shares) = MemoryRootGenerator::new(Arc::clone(&plane), total, threshold)?;
        Ok(Self {
            store: Arc::new(MemorySecretStore::new()),
            generator: Arc::new(generator),
            plane,
            source: Arc::new(StaticPolicySource::new()),
            shares,
        })
    }

    /// A broker wired to this sandbox.
    pub fn broker(&self, config: ApprovalConfig) -> Result<ApprovalBroker> {
        ApprovalBroker::new(
            Arc::clone(&self.store) as _,
            Arc::clone(&self.generator) as _,
            Arc::clone(&self.plane) as _,
            Arc::clone(&self.source) as _,
            config,
        )
    }
}
