// SPDX-License-Identifier: MIT OR Apache-2.0
//! The approval broker: filing, inspection, approval and rejection.
//!
//! Every operation on an existing request runs under that request's lock,
//! so progress and the share list are never updated concurrently. When an
//! approval reaches the threshold, the broker reconstructs the root secret
//! under the global ceremony lock, mints a single-use elevated credential,
//! executes the change and always revokes the credential and purges the
//! request afterwards.

use std::sync::Arc;

use serde_json::Value;
use zeroize::Zeroizing;

use crate::{
    backend::{
        ControlPlane, Credential, CredentialScope, PolicySource, RootGenerator, SecretStore,
    },
    ceremony::{CeremonyFailure, Culprit, RootCeremony},
    error::Phase,
    identity::RequestId,
    locks::LockRegistry,
    quorum::QuorumLedger,
    request::{Context, Drift, HclPolicySyntax, PolicySyntax, Request},
    ApprovalConfig, ApprovalError, Result,
};

/// Quorum-gated broker over a set of collaborators.
pub struct ApprovalBroker {
    store: Arc<dyn SecretStore>,
    generator: Arc<dyn RootGenerator>,
    plane: Arc<dyn ControlPlane>,
    source: Arc<dyn PolicySource>,
    syntax: Arc<dyn PolicySyntax>,
    locks: Arc<LockRegistry>,
    ceremony: Arc<RootCeremony>,
    config: ApprovalConfig,
}

impl ApprovalBroker {
    /// Create a broker with its own lock registry and ceremony gate.
    pub fn new(
        store: Arc<dyn SecretStore>,
        generator: Arc<dyn RootGenerator>,
        plane: Arc<dyn ControlPlane>,
        source: Arc<dyn PolicySource>,
        config: ApprovalConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            store,
            generator,
            plane,
            source,
            syntax: Arc::new(HclPolicySyntax),
            locks: Arc::new(LockRegistry::new()),
            ceremony: Arc::new(RootCeremony::new()),
            config,
        })
    }

    /// Use a different policy language checker.
    #[must_use]
    pub fn with_syntax(mut self, syntax: Arc<dyn PolicySyntax>) -> Self {
        self.syntax = syntax;
        self
    }

    /// Share a lock registry with other brokers over the same store.
    #[must_use]
    pub fn with_locks(mut self, locks: Arc<LockRegistry>) -> Self {
        self.locks = locks;
        self
    }

    /// Share a ceremony gate with other brokers over the same generator.
    #[must_use]
    pub fn with_ceremony(mut self, ceremony: Arc<RootCeremony>) -> Self {
        self.ceremony = ceremony;
        self
    }

    pub fn config(&self) -> &ApprovalConfig {
        &self.config
    }

    pub fn locks(&self) -> &LockRegistry {
        &self.locks
    }

    fn context(&self) -> Context<'_> {
        Context {
            plane: self.plane.as_ref(),
            source: self.source.as_ref(),
            generator: self.generator.as_ref(),
            syntax: self.syntax.as_ref(),
            config: &self.config,
        }
    }

    fn ledger(&self) -> QuorumLedger<'_> {
        QuorumLedger::new(
            self.store.as_ref(),
            self.config.share_ttl,
            self.config.upstream_error_limit,
        )
    }

    /// File a new request and return its identifier.
    ///
    /// Filing the same request twice returns the same identifier and leaves
    /// the stored record (and its progress) untouched.
    pub fn add(&self, caller: &Credential, raw: &Value) -> Result<RequestId> {
        let ctx = self.context();
        let (request, id) = Request::create(&ctx, caller, raw)?;

        let _lock = self.locks.try_acquire(id.as_str())?;
        let ledger = self.ledger();
        if ledger.load_request(&id)?.is_some() {
            tracing::debug!(request = %id, "request already filed");
            return Ok(id);
        }
        ledger.save_request(&id, &request)?;
        tracing::info!(
            request = %id,
            kind = %request.request_type(),
            required = request.required,
            "request filed"
        );
        Ok(id)
    }

    /// Load a request and re-verify it against live state.
    pub fn get(&self, caller: &Credential, id: &str) -> Result<Request> {
        let id = RequestId::parse(id)?;
        let _lock = self.locks.try_acquire(id.as_str())?;
        let ctx = self.context();
        let ledger = self.ledger();

        let mut request = load(&ledger, &id)?;
        let drift = request.verify(&ctx, caller)?;
        settle(&ledger, &id, &request, drift)?;
        Ok(request)
    }

    /// Contribute one share.
    ///
    /// Below the threshold this records the share and returns the updated
    /// request. At the threshold the change is executed; the returned
    /// request then has `progress == required` and is no longer stored.
    pub fn approve(&self, caller: &Credential, id: &str, share: &str) -> Result<Request> {
        let id = RequestId::parse(id)?;
        let share = Zeroizing::new(share.trim().to_string());
        if share.is_empty() {
            return Err(ApprovalError::Validation("'share' is required".to_string()));
        }

        let _lock = self.locks.try_acquire(id.as_str())?;
        let ctx = self.context();
        let ledger = self.ledger();

        let mut request = load(&ledger, &id)?;
        let drift = request.verify(&ctx, caller)?;
        settle(&ledger, &id, &request, drift)?;

        request.progress = ledger.append_share(&id, &share)?;
        drop(share);
        if request.progress < request.required {
            ledger.save_request(&id, &request)?;
            tracing::info!(
                request = %id,
                progress = request.progress,
                required = request.required,
                "share accepted"
            );
            return Ok(request);
        }

        // The record must match the share list before any envelope is spent.
        ledger.save_request(&id, &request)?;
        tracing::info!(request = %id, required = request.required, "quorum reached");
        self.complete(&ctx, &ledger, &id, request)
    }

    /// Drop a request and its shares. Rejecting an absent request succeeds.
    pub fn reject(&self, caller: &Credential, id: &str) -> Result<()> {
        let id = RequestId::parse(id)?;
        let _lock = self.locks.try_acquire(id.as_str())?;
        let ctx = self.context();
        let ledger = self.ledger();

        match ledger.load_request(&id)? {
            Some(request) => {
                request.check_access(&ctx, caller)?;
                ledger.purge(&id)?;
                tracing::info!(request = %id, progress = request.progress, "request rejected");
            }
            None => {
                // A stray share list may outlive its record.
                ledger.purge_shares(&id)?;
                tracing::debug!(request = %id, "reject of absent request");
            }
        }
        Ok(())
    }

    /// Reconstruct, execute and clean up. Caller holds the request lock.
    fn complete(
        &self,
        ctx: &Context<'_>,
        ledger: &QuorumLedger<'_>,
        id: &RequestId,
        mut request: Request,
    ) -> Result<Request> {
        let limit = self.config.upstream_error_limit;
        let redeemed = ledger.redeem(id)?;
        if redeemed.dropped > 0 {
            request.progress = ledger.restore_shares(id, &redeemed.shares)?;
            ledger.save_request(id, &request)?;
            tracing::warn!(
                request = %id,
                dropped = redeemed.dropped,
                progress = request.progress,
                "shares expired before the quorum was reached"
            );
            return Err(ApprovalError::Reconstruction(format!(
                "{} share(s) expired or were already used; {} of {} remain, please resubmit",
                redeemed.dropped, request.progress, request.required
            )));
        }

        let secret = match self
            .ceremony
            .reconstruct(self.generator.as_ref(), &redeemed.shares, limit)
        {
            Ok(secret) => secret,
            Err(failure) => {
                let mut survivors = redeemed.shares;
                let error = discard_culprit(&mut request, &mut survivors, failure);
                request.progress = ledger.restore_shares(id, &survivors)?;
                ledger.save_request(id, &request)?;
                tracing::warn!(
                    request = %id,
                    progress = request.progress,
                    suspect_newest = request.newest_discarded,
                    "reconstruction failed"
                );
                return Err(error);
            }
        };

        let scope = if request.is_root_only() {
            CredentialScope::Root
        } else {
            CredentialScope::TokenIssuer
        };
        let elevated = match self.plane.mint(secret.expose(), scope) {
            Ok(credential) => credential,
            Err(err) => {
                request.progress = ledger.restore_shares(id, &redeemed.shares)?;
                ledger.save_request(id, &request)?;
                tracing::error!(request = %id, "could not mint elevated credential");
                return Err(ApprovalError::from_backend(Phase::Reconstruct, err, limit));
            }
        };
        drop(secret);

        request.progress = request.required;
        let executed = request.execute(ctx, &elevated);
        let cleaned = self.cleanup(ledger, id, &elevated);

        match (&executed, &cleaned) {
            (Ok(()), Ok(())) => {
                tracing::info!(request = %id, kind = %request.request_type(), "request executed");
            }
            (Err(err), _) => {
                tracing::warn!(request = %id, error = %err, "request execution failed");
            }
            (Ok(()), Err(_)) => {}
        }
        executed?;
        cleaned?;
        Ok(request)
    }

    /// Revoke the elevated credential and purge all request state.
    ///
    /// Both steps always run; the first failure is reported.
    fn cleanup(
        &self,
        ledger: &QuorumLedger<'_>,
        id: &RequestId,
        elevated: &Credential,
    ) -> Result<()> {
        let revoked = self.plane.revoke(elevated).map_err(|err| {
            tracing::error!(request = %id, "failed to revoke elevated credential");
            ApprovalError::from_backend(Phase::Cleanup, err, self.config.upstream_error_limit)
        });
        let purged = ledger.purge(id).map_err(|err| {
            tracing::error!(request = %id, error = %err, "failed to purge request state");
            err
        });
        revoked.and(purged)
    }
}

/// Drop the share a failed ceremony blames and annotate the error.
///
/// An unattributed failure first costs only the newest share. If the set
/// fails again without a named culprit, the bad share is among the older
/// ones and every share is discarded.
fn discard_culprit(
    request: &mut Request,
    shares: &mut Vec<Zeroizing<String>>,
    failure: CeremonyFailure,
) -> ApprovalError {
    let note = match failure.culprit {
        Culprit::Share(position) if position < shares.len() => {
            shares.remove(position);
            "the rejected share was discarded"
        }
        Culprit::Unattributed if request.newest_discarded => {
            shares.clear();
            request.newest_discarded = false;
            "the bad share could not be identified; progress has been reset, \
             all shares must be resubmitted"
        }
        Culprit::Unattributed => {
            shares.pop();
            request.newest_discarded = true;
            "the most recent share was discarded; resubmit it if it is valid"
        }
        _ => return failure.error,
    };
    match failure.error {
        ApprovalError::Reconstruction(message) => {
            ApprovalError::Reconstruction(format!("{message}; {note}"))
        }
        other => other,
    }
}

fn load(ledger: &QuorumLedger<'_>, id: &RequestId) -> Result<Request> {
    ledger
        .load_request(id)?
        .ok_or_else(|| ApprovalError::NotFound(id.to_string()))
}

/// Persist the outcome of a verification.
///
/// Any drift discards accumulated shares and saves the reset record; an
/// outdated request additionally fails the operation.
fn settle(
    ledger: &QuorumLedger<'_>,
    id: &RequestId,
    request: &Request,
    drift: Drift,
) -> Result<()> {
    if drift == Drift::Current {
        return Ok(());
    }
    ledger.purge_shares(id)?;
    ledger.save_request(id, request)?;
    match drift {
        Drift::Outdated(err) => {
            tracing::info!(request = %id, reason = %err, "request outdated, progress reset");
            Err(err)
        }
        _ => {
            tracing::info!(request = %id, "request refreshed, progress reset");
            Ok(())
        }
    }
}
