// SPDX-License-Identifier: MIT OR Apache-2.0
//! Single policy rewrite or deletion.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use super::{string_field, Context, Drift, PolicySyntax, RequestVariant};
use crate::{
    backend::Credential,
    error::{redact_upstream, ExecutionFailures, Phase},
    ApprovalError, Result,
};

/// Replace the text of one policy. An empty `proposed` deletes it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyChange {
    pub policy_name: String,
    /// Live text when the request was filed (empty if the policy was absent).
    pub previous: String,
    pub proposed: String,
}

impl PolicyChange {
    pub(crate) fn parse(params: &Map<String, Value>, syntax: &dyn PolicySyntax) -> Result<Self> {
        let policy_name = string_field(params, &["policy_name", "policyname"])?
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| ApprovalError::Validation("'policy_name' is required".to_string()))?;

        let proposed = string_field(params, &["rules", "proposed"])?
            .ok_or_else(|| ApprovalError::Validation("'rules' field is required".to_string()))?;
        if !proposed.is_empty() {
            syntax.check(&proposed).map_err(ApprovalError::Validation)?;
        }

        Ok(Self {
            policy_name,
            previous: String::new(),
            proposed,
        })
    }

    pub(crate) fn capture(&mut self, ctx: &Context<'_>, caller: &Credential) -> Result<()> {
        self.previous = ctx
            .plane
            .read_policy(caller, &self.policy_name)
            .map_err(ctx.upstream(Phase::Validate))?;
        if self.previous == self.proposed {
            return Err(ApprovalError::NoChange(
                "request contains no changes to the policy".to_string(),
            ));
        }
        Ok(())
    }

    pub fn is_deletion(&self) -> bool {
        self.proposed.is_empty()
    }
}

impl RequestVariant for PolicyChange {
    fn is_root_only(&self) -> bool {
        true
    }

    fn identity_payload(&self) -> Result<Value> {
        Ok(json!({
            "policy_name": self.policy_name,
            "previous": self.previous,
            "proposed": self.proposed,
        }))
    }

    fn verify(&mut self, ctx: &Context<'_>, caller: &Credential) -> Result<Drift> {
        if !self.proposed.is_empty() {
            ctx.syntax
                .check(&self.proposed)
                .map_err(|e| ApprovalError::Validation(format!("stored policy: {e}")))?;
        }

        let current = ctx
            .plane
            .read_policy(caller, &self.policy_name)
            .map_err(ctx.upstream(Phase::Validate))?;
        if current != self.previous {
            return Ok(Drift::Outdated(ApprovalError::Stale(format!(
                "policy '{}' has been changed since the request was made",
                self.policy_name
            ))));
        }
        Ok(Drift::Current)
    }

    fn check_access(&self, ctx: &Context<'_>, caller: &Credential) -> Result<()> {
        ctx.plane
            .read_policy(caller, &self.policy_name)
            .map(|_| ())
            .map_err(ctx.upstream(Phase::Validate))
    }

    fn execute(&mut self, ctx: &Context<'_>, elevated: &Credential) -> Result<()> {
        let outcome = if self.is_deletion() {
            ctx.plane.delete_policy(elevated, &self.policy_name)
        } else {
            ctx.plane
                .write_policy(elevated, &self.policy_name, &self.proposed)
        };

        if let Err(err) = outcome {
            let mut failures = ExecutionFailures::new();
            failures.push(
                self.policy_name.clone(),
                redact_upstream(&err.to_string(), ctx.config.upstream_error_limit),
            );
            return failures.into_result();
        }

        // Reflect what the control plane actually stored.
        self.previous = if self.is_deletion() {
            String::new()
        } else {
            ctx.plane
                .read_policy(elevated, &self.policy_name)
                .unwrap_or_else(|_| self.proposed.clone())
        };
        tracing::info!(
            policy = %self.policy_name,
            deleted = self.is_deletion(),
            "policy change applied"
        );
        Ok(())
    }
}
