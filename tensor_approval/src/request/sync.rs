// SPDX-License-Identifier: MIT OR Apache-2.0
//! Bulk reconciliation of every policy against a source revision.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use super::{string_field, Context, Drift, RequestVariant};
use crate::{
    backend::Credential,
    error::{redact_upstream, ExecutionFailures, Phase},
    ApprovalConfig, ApprovalError, Result,
};

/// Live and desired text of one policy. Empty `proposed` means delete.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyDiff {
    pub previous: String,
    pub proposed: String,
}

impl PolicyDiff {
    pub fn is_deletion(&self) -> bool {
        self.proposed.is_empty()
    }
}

/// Bring live policies in line with `revision` of the policy source.
///
/// `changes` is derived and may be refreshed between approvals; only the
/// revision and path identify the request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicySync {
    pub revision: String,
    pub path: String,
    #[serde(default)]
    pub changes: BTreeMap<String, PolicyDiff>,
}

impl PolicySync {
    pub(crate) fn parse(params: &Map<String, Value>, config: &ApprovalConfig) -> Result<Self> {
        let revision = string_field(params, &["revision", "commithash"])?
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| ApprovalError::Validation("'revision' is required".to_string()))?;
        let path = string_field(params, &["path"])?.unwrap_or_else(|| config.sync_path.clone());
        Ok(Self {
            revision,
            path,
            changes: BTreeMap::new(),
        })
    }

    pub(crate) fn capture(&mut self, ctx: &Context<'_>, caller: &Credential) -> Result<()> {
        self.changes = self.compute_diff(ctx, caller)?;
        if self.changes.is_empty() {
            return Err(ApprovalError::NoChange(format!(
                "revision {} matches the live policies",
                self.revision
            )));
        }
        Ok(())
    }

    /// Diff the source revision against live state as seen by `caller`.
    fn compute_diff(
        &self,
        ctx: &Context<'_>,
        caller: &Credential,
    ) -> Result<BTreeMap<String, PolicyDiff>> {
        let proposed = ctx
            .source
            .fetch_proposed(&self.revision, &self.path)
            .map_err(ctx.upstream(Phase::Validate))?;
        for (name, rules) in &proposed {
            if !rules.is_empty() {
                ctx.syntax.check(rules).map_err(|e| {
                    ApprovalError::Validation(format!("policy '{name}' at {}: {e}", self.revision))
                })?;
            }
        }

        let live = ctx
            .plane
            .list_policies(caller)
            .map_err(ctx.upstream(Phase::Validate))?;

        let mut changes = BTreeMap::new();
        for (name, rules) in proposed.iter() {
            let previous = ctx
                .plane
                .read_policy(caller, name)
                .map_err(ctx.upstream(Phase::Validate))?;
            if previous != *rules {
                changes.insert(
                    name.clone(),
                    PolicyDiff {
                        previous,
                        proposed: rules.clone(),
                    },
                );
            }
        }
        for name in live {
            if proposed.contains_key(&name) || ctx.config.is_protected(&name) {
                continue;
            }
            let previous = ctx
                .plane
                .read_policy(caller, &name)
                .map_err(ctx.upstream(Phase::Validate))?;
            changes.insert(
                name,
                PolicyDiff {
                    previous,
                    proposed: String::new(),
                },
            );
        }
        Ok(changes)
    }
}

impl RequestVariant for PolicySync {
    fn is_root_only(&self) -> bool {
        true
    }

    fn identity_payload(&self) -> Result<Value> {
        Ok(json!({
            "revision": self.revision,
            "path": self.path,
        }))
    }

    fn verify(&mut self, ctx: &Context<'_>, caller: &Credential) -> Result<Drift> {
        let fresh = self.compute_diff(ctx, caller)?;
        if fresh == self.changes {
            return Ok(Drift::Current);
        }
        tracing::debug!(
            revision = %self.revision,
            before = self.changes.len(),
            after = fresh.len(),
            "sync diff refreshed"
        );
        self.changes = fresh;
        if self.changes.is_empty() {
            return Ok(Drift::Outdated(ApprovalError::NoChange(format!(
                "revision {} now matches the live policies",
                self.revision
            ))));
        }
        Ok(Drift::Refreshed)
    }

    fn check_access(&self, ctx: &Context<'_>, caller: &Credential) -> Result<()> {
        for name in self.changes.keys() {
            ctx.plane
                .read_policy(caller, name)
                .map_err(ctx.upstream(Phase::Validate))?;
        }
        Ok(())
    }

    fn execute(&mut self, ctx: &Context<'_>, elevated: &Credential) -> Result<()> {
        let mut failures = ExecutionFailures::new();
        for (name, diff) in &self.changes {
            let outcome = if diff.is_deletion() {
                ctx.plane.delete_policy(elevated, name)
            } else {
                ctx.plane.write_policy(elevated, name, &diff.proposed)
            };
            if let Err(err) = outcome {
                tracing::warn!(policy = %name, "sync write failed");
                failures.push(
                    name.clone(),
                    redact_upstream(&err.to_string(), ctx.config.upstream_error_limit),
                );
            }
        }
        tracing::info!(
            revision = %self.revision,
            changed = self.changes.len() - failures.len(),
            failed = failures.len(),
            "policy sync applied"
        );
        failures.into_result()
    }
}
