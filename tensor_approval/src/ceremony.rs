// SPDX-License-Identifier: MIT OR Apache-2.0
//! The root reconstruction ceremony.
//!
//! The external protocol keeps a single global generation (one nonce, one
//! pad), so ceremonies are serialized process-wide. A failed ceremony always
//! cancels the outstanding generation before returning, so that a partially
//! fed generation can never be completed by an unrelated caller.

#![allow(clippy::significant_drop_tightening)]

use parking_lot::Mutex;
use zeroize::Zeroizing;

use crate::{
    backend::RootGenerator,
    blinding::{BlindedReconstruction, RootSecret},
    error::{redact_upstream, ApprovalError, BackendError, Phase},
};

/// Which share, if any, a failed ceremony blames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Culprit {
    /// The share at this position was rejected.
    Share(usize),
    /// A share was bad but the protocol could not say which.
    Unattributed,
    /// The failure was not caused by share content.
    None,
}

/// A failed ceremony and the share it blames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CeremonyFailure {
    pub error: ApprovalError,
    pub culprit: Culprit,
}

impl CeremonyFailure {
    fn new(error: ApprovalError, culprit: Culprit) -> Self {
        Self { error, culprit }
    }
}

/// Serializes reconstruction against the external protocol.
#[derive(Debug, Default)]
pub struct RootCeremony {
    gate: Mutex<()>,
}

impl RootCeremony {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed `shares` to the protocol in order and unblind the result.
    ///
    /// Blocks while another ceremony is running.
    pub fn reconstruct(
        &self,
        generator: &dyn RootGenerator,
        shares: &[Zeroizing<String>],
        error_limit: usize,
    ) -> std::result::Result<RootSecret, CeremonyFailure> {
        let _gate = self.gate.lock();

        let exchange = BlindedReconstruction::begin();
        let mut status = generator.init(exchange.otp()).map_err(|e| {
            CeremonyFailure::new(
                ApprovalError::from_backend(Phase::Reconstruct, e, error_limit),
                Culprit::None,
            )
        })?;

        for (position, share) in shares.iter().enumerate() {
            if status.is_complete() {
                break;
            }
            match generator.submit_share(share, &status.nonce) {
                Ok(next) => status = next,
                Err(err) => {
                    let culprit = match &err {
                        BackendError::InvalidShare {
                            position: Some(p), ..
                        } => Culprit::Share(*p),
                        BackendError::InvalidShare { position: None, .. } => Culprit::Unattributed,
                        _ => Culprit::None,
                    };
                    tracing::warn!(position, "share rejected during root generation");
                    let error = cancel_after(
                        generator,
                        format!(
                            "could not generate root token: {}",
                            redact_upstream(&err.to_string(), error_limit)
                        ),
                    );
                    return Err(CeremonyFailure::new(error, culprit));
                }
            }
        }

        let Some(encoded) = status.encoded_root else {
            let error = cancel_after(
                generator,
                format!(
                    "root generation incomplete after {} of {} shares; was the secret re-split?",
                    status.progress, status.required
                ),
            );
            return Err(CeremonyFailure::new(error, Culprit::None));
        };

        exchange
            .complete(&encoded)
            .map_err(|error| CeremonyFailure::new(error, Culprit::None))
    }
}

/// Cancel the outstanding generation and fold any cancel failure into the
/// returned error.
fn cancel_after(generator: &dyn RootGenerator, mut message: String) -> ApprovalError {
    match generator.cancel() {
        Ok(()) => tracing::info!("root generation cancelled"),
        Err(err) => {
            tracing::error!(error = %err, "failed to cancel root generation");
            message.push_str(&format!(
                "; attempted to cancel root generation, but: {err}"
            ));
        }
    }
    ApprovalError::Reconstruction(message)
}
