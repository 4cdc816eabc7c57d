// SPDX-License-Identifier: MIT OR Apache-2.0
//! Tensor Approval: quorum-gated execution of privileged changes.
//!
//! An operator files a request (a policy rewrite, a bulk policy sync or a
//! token issuance). Holders of a threshold-split root secret each approve it
//! with their share. Once enough shares are in, the root secret is rebuilt
//! through a one-time-pad blinded ceremony, the change runs under a
//! single-use elevated credential, and that credential is revoked before the
//! call returns.
//!
//! Properties:
//! - requests are addressed by a SHA-256 content hash, re-checked on every read
//! - one operation per request at a time; one ceremony per process at a time
//! - shares are stored only inside single-use expiring envelopes
//! - a request that drifted from live state resets its progress

#![allow(clippy::missing_errors_doc)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::module_name_repetitions)]

pub mod backend;
mod blinding;
pub mod broker;
mod ceremony;
pub mod config;
pub mod error;
mod identity;
mod locks;
pub mod memory;
mod quorum;
pub mod request;

pub use backend::{
    ControlPlane, Credential, CredentialScope, GenerationStatus, Identity, IssuedToken,
    PolicySource, RootGenerator, SecretStore, TokenCreateRequest, TokenSpec,
};
pub use blinding::{blind, decode_otp, BlindedReconstruction, RootSecret, OTP_LEN};
pub use broker::ApprovalBroker;
pub use ceremony::{CeremonyFailure, Culprit, RootCeremony};
pub use config::ApprovalConfig;
pub use error::{
    ApprovalError, BackendError, BackendResult, ExecutionFailures, Phase, ResourceFailure,
    Result,
};
pub use identity::{requester_hash, RequestId, REQUEST_ID_LEN};
pub use locks::{LockRegistry, RequestLock};
pub use quorum::{QuorumLedger, Redeemed};
pub use request::{
    HclPolicySyntax, PolicyChange, PolicyDiff, PolicySync, PolicySyntax, Request, RequestKind,
    RequestType, TokenIssuance,
};
