// SPDX-License-Identifier: MIT OR Apache-2.0
//! Request model: a tagged union of change kinds sharing one lifecycle.
//!
//! Each kind owns its immutable payload and supplies four pieces of logic:
//! parameter validation, capture of the baseline against live state,
//! re-verification against live state, and the privileged execution step.
//! Accumulation, reconstruction and cleanup are shared and live in the
//! broker.

mod policy;
mod sync;
mod syntax;
mod token;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{
    backend::{ControlPlane, Credential, PolicySource, RootGenerator},
    error::Phase,
    identity::{self, HashInput, RequestId},
    ApprovalConfig, ApprovalError, Result,
};

pub use policy::PolicyChange;
pub use sync::{PolicyDiff, PolicySync};
pub use syntax::{HclPolicySyntax, PolicySyntax};
pub use token::TokenIssuance;

/// Discriminator of a request kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestType {
    /// Rewrite or delete one policy.
    Policy,
    /// Bring every policy in line with a source-of-truth revision.
    Sync,
    /// Issue a token under elevated authority.
    Token,
}

impl RequestType {
    /// Parse a caller-supplied type name (case-insensitive).
    pub fn parse(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "policy" => Ok(Self::Policy),
            "sync" | "github" => Ok(Self::Sync),
            "token" => Ok(Self::Token),
            "" => Err(ApprovalError::Validation("'type' field is empty".to_string())),
            other => Err(ApprovalError::Validation(format!(
                "unsupported request type: {other}"
            ))),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Policy => "policy",
            Self::Sync => "sync",
            Self::Token => "token",
        }
    }
}

impl std::fmt::Display for RequestType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind-specific payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum RequestKind {
    Policy(PolicyChange),
    Sync(PolicySync),
    Token(TokenIssuance),
}

/// A pending privileged change awaiting quorum.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub kind: RequestKind,
    /// Display name of whoever filed the request.
    pub requester: String,
    /// SHA-256 hex of `requester`.
    pub requester_hash: String,
    /// Shares needed, captured from the live threshold at filing time.
    pub required: usize,
    /// Shares collected so far. Not part of the identifier.
    pub progress: usize,
    /// The last failed ceremony could not name a culprit and discarded the
    /// newest share on suspicion. Not part of the identifier.
    #[serde(default)]
    pub newest_discarded: bool,
}

/// How a request compares with live state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Drift {
    /// Nothing moved.
    Current,
    /// The derived payload was refreshed in place; progress must restart.
    Refreshed,
    /// The request can no longer be executed as filed; progress must
    /// restart and the caller gets the error.
    Outdated(ApprovalError),
}

/// Collaborators and settings visible to request kinds.
pub struct Context<'a> {
    pub plane: &'a dyn ControlPlane,
    pub source: &'a dyn PolicySource,
    pub generator: &'a dyn RootGenerator,
    pub syntax: &'a dyn PolicySyntax,
    pub config: &'a ApprovalConfig,
}

impl Context<'_> {
    pub(crate) fn upstream(&self, phase: Phase) -> impl Fn(crate::BackendError) -> ApprovalError {
        let limit = self.config.upstream_error_limit;
        move |err| ApprovalError::from_backend(phase, err, limit)
    }

    fn live_required(&self) -> Result<usize> {
        self.generator
            .required()
            .map_err(self.upstream(Phase::Validate))
    }
}

/// Logic every request kind supplies.
pub(crate) trait RequestVariant {
    /// Whether execution needs full root authority.
    fn is_root_only(&self) -> bool;

    /// The immutable part of the payload that feeds the identifier.
    fn identity_payload(&self) -> Result<Value>;

    /// Compare with live state, refreshing derived fields when allowed.
    fn verify(&mut self, ctx: &Context<'_>, caller: &Credential) -> Result<Drift>;

    /// Fail unless `caller` may see the resources this request touches.
    fn check_access(&self, ctx: &Context<'_>, caller: &Credential) -> Result<()>;

    /// Apply the change with elevated authority.
    fn execute(&mut self, ctx: &Context<'_>, elevated: &Credential) -> Result<()>;
}

impl Request {
    /// Validate `raw`, capture the baseline, and compute the identifier.
    pub fn create(
        ctx: &Context<'_>,
        caller: &Credential,
        raw: &Value,
    ) -> Result<(Self, RequestId)> {
        let params = raw.as_object().ok_or_else(|| {
            ApprovalError::Validation("request body must be a JSON object".to_string())
        })?;
        let kind_name = string_field(params, &["type", "Type"])?
            .ok_or_else(|| ApprovalError::Validation("'type' field is required".to_string()))?;
        let request_type = RequestType::parse(&kind_name)?;

        // Pure validation first so malformed input never reaches upstream.
        let mut kind = match request_type {
            RequestType::Policy => RequestKind::Policy(PolicyChange::parse(params, ctx.syntax)?),
            RequestType::Sync => RequestKind::Sync(PolicySync::parse(params, ctx.config)?),
            RequestType::Token => RequestKind::Token(TokenIssuance::parse(params)?),
        };

        let me = ctx
            .plane
            .who_am_i(caller)
            .map_err(ctx.upstream(Phase::Validate))?;
        if me.display_name.is_empty() {
            return Err(ApprovalError::PermissionDenied(
                "could not confirm requester identity".to_string(),
            ));
        }

        match &mut kind {
            RequestKind::Policy(change) => change.capture(ctx, caller)?,
            RequestKind::Sync(sync) => sync.capture(ctx, caller)?,
            RequestKind::Token(token) => token.capture(ctx, caller)?,
        }

        let request = Self {
            kind,
            requester_hash: identity::requester_hash(&me.display_name),
            requester: me.display_name,
            required: ctx.live_required()?,
            progress: 0,
            newest_discarded: false,
        };
        let id = request.id()?;
        Ok((request, id))
    }

    pub fn request_type(&self) -> RequestType {
        match self.kind {
            RequestKind::Policy(_) => RequestType::Policy,
            RequestKind::Sync(_) => RequestType::Sync,
            RequestKind::Token(_) => RequestType::Token,
        }
    }

    /// Content hash over every field except the volatile ones.
    pub fn id(&self) -> Result<RequestId> {
        identity::digest(&HashInput {
            kind: self.request_type().as_str(),
            requester: &self.requester,
            requester_hash: &self.requester_hash,
            required: self.required,
            payload: self.variant().identity_payload()?,
        })
    }

    pub fn is_root_only(&self) -> bool {
        self.variant().is_root_only()
    }

    /// Re-check against live state, including the live threshold.
    ///
    /// Any drift resets `progress`; the caller is responsible for purging
    /// shares and persisting the record.
    pub(crate) fn verify(&mut self, ctx: &Context<'_>, caller: &Credential) -> Result<Drift> {
        let mut drift = self.variant_mut().verify(ctx, caller)?;
        if !matches!(drift, Drift::Outdated(_)) && ctx.live_required()? != self.required {
            drift = Drift::Outdated(ApprovalError::Stale(
                "share threshold changed since the request was filed; reject and refile it"
                    .to_string(),
            ));
        }
        if drift != Drift::Current {
            self.progress = 0;
            self.newest_discarded = false;
        }
        Ok(drift)
    }

    pub(crate) fn check_access(&self, ctx: &Context<'_>, caller: &Credential) -> Result<()> {
        self.variant().check_access(ctx, caller)
    }

    pub(crate) fn execute(&mut self, ctx: &Context<'_>, elevated: &Credential) -> Result<()> {
        self.variant_mut().execute(ctx, elevated)
    }

    pub fn as_policy(&self) -> Option<&PolicyChange> {
        match &self.kind {
            RequestKind::Policy(change) => Some(change),
            _ => None,
        }
    }

    pub fn as_sync(&self) -> Option<&PolicySync> {
        match &self.kind {
            RequestKind::Sync(sync) => Some(sync),
            _ => None,
        }
    }

    pub fn as_token(&self) -> Option<&TokenIssuance> {
        match &self.kind {
            RequestKind::Token(token) => Some(token),
            _ => None,
        }
    }

    fn variant(&self) -> &dyn RequestVariant {
        match &self.kind {
            RequestKind::Policy(v) => v,
            RequestKind::Sync(v) => v,
            RequestKind::Token(v) => v,
        }
    }

    fn variant_mut(&mut self) -> &mut dyn RequestVariant {
        match &mut self.kind {
            RequestKind::Policy(v) => v,
            RequestKind::Sync(v) => v,
            RequestKind::Token(v) => v,
        }
    }
}

/// Read an optional string parameter under any of `keys`.
pub(crate) fn string_field(params: &Map<String, Value>, keys: &[&str]) -> Result<Option<String>> {
    for key in keys {
        match params.get(*key) {
            None | Some(Value::Null) => continue,
            Some(Value::String(s)) => return Ok(Some(s.clone())),
            Some(_) => {
                return Err(ApprovalError::Validation(format!(
                    "'{}' must be a string",
                    keys[0]
                )))
            }
        }
    }
    Ok(None)
}
