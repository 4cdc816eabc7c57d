// SPDX-License-Identifier: MIT OR Apache-2.0
//! Token issuance under elevated authority.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use super::{string_field, Context, Drift, RequestVariant};
use crate::{
    backend::{Credential, IssuedToken, TokenCreateRequest, TokenSpec},
    error::{redact_upstream, ExecutionFailures, Phase},
    ApprovalError, Result,
};

/// Create a token the requester could not create alone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenIssuance {
    pub create_request: TokenCreateRequest,
    pub wrap_ttl_secs: u64,
    pub orphan: bool,
    pub role: Option<String>,
    /// Set once the token was created.
    #[serde(default)]
    pub issued: Option<IssuedToken>,
}

impl TokenIssuance {
    pub(crate) fn parse(params: &Map<String, Value>) -> Result<Self> {
        let mut create_request: TokenCreateRequest = match params.get("create_request") {
            None | Some(Value::Null) => {
                return Err(ApprovalError::Validation(
                    "'create_request' is required".to_string(),
                ))
            }
            Some(value @ Value::Object(_)) => serde_json::from_value(value.clone()).map_err(|e| {
                ApprovalError::Validation(format!("'create_request' is malformed: {e}"))
            })?,
            Some(_) => {
                return Err(ApprovalError::Validation(
                    "'create_request' must be an object".to_string(),
                ))
            }
        };
        create_request.no_parent = true;

        let wrap_ttl_secs = parse_wrap_ttl(params.get("wrap_ttl"))?;
        let orphan = parse_orphan(params.get("orphan"))?;
        let role = string_field(params, &["role"])?.filter(|r| !r.is_empty());
        if orphan && role.is_some() {
            return Err(ApprovalError::Validation(
                "'orphan' and 'role' cannot be combined".to_string(),
            ));
        }

        Ok(Self {
            create_request,
            wrap_ttl_secs,
            orphan,
            role,
            issued: None,
        })
    }

    pub(crate) fn capture(&mut self, ctx: &Context<'_>, caller: &Credential) -> Result<()> {
        self.check_role(ctx, caller)
    }

    fn check_role(&self, ctx: &Context<'_>, caller: &Credential) -> Result<()> {
        match &self.role {
            Some(role) => ctx
                .plane
                .read_role(caller, role)
                .map_err(ctx.upstream(Phase::Validate)),
            None => Ok(()),
        }
    }

    fn spec(&self) -> TokenSpec {
        TokenSpec {
            request: self.create_request.clone(),
            orphan: self.orphan,
            role: self.role.clone(),
            wrap_ttl: Duration::from_secs(self.wrap_ttl_secs),
        }
    }
}

fn parse_wrap_ttl(value: Option<&Value>) -> Result<u64> {
    let secs = match value {
        None | Some(Value::Null) => {
            return Err(ApprovalError::Validation("'wrap_ttl' is required".to_string()))
        }
        Some(Value::Number(n)) => n.as_u64(),
        Some(Value::String(s)) => s.trim().parse::<u64>().ok(),
        Some(_) => None,
    };
    match secs {
        Some(secs) if secs >= 1 => Ok(secs),
        _ => Err(ApprovalError::Validation(
            "'wrap_ttl' must be a whole number of seconds, at least 1".to_string(),
        )),
    }
}

fn parse_orphan(value: Option<&Value>) -> Result<bool> {
    match value {
        None | Some(Value::Null) => Ok(false),
        Some(Value::Bool(b)) => Ok(*b),
        Some(Value::String(s)) => match s.as_str() {
            "" | "false" => Ok(false),
            "true" => Ok(true),
            _ => Err(ApprovalError::Validation(
                "'orphan' must be true or false".to_string(),
            )),
        },
        Some(_) => Err(ApprovalError::Validation(
            "'orphan' must be true or false".to_string(),
        )),
    }
}

impl RequestVariant for TokenIssuance {
    fn is_root_only(&self) -> bool {
        false
    }

    fn identity_payload(&self) -> Result<Value> {
        Ok(json!({
            "create_request": serde_json::to_value(&self.create_request)?,
            "wrap_ttl_secs": self.wrap_ttl_secs,
            "orphan": self.orphan,
            "role": self.role,
        }))
    }

    fn verify(&mut self, ctx: &Context<'_>, caller: &Credential) -> Result<Drift> {
        ctx.plane
            .who_am_i(caller)
            .map_err(ctx.upstream(Phase::Validate))?;
        self.check_role(ctx, caller)?;
        Ok(Drift::Current)
    }

    fn check_access(&self, ctx: &Context<'_>, caller: &Credential) -> Result<()> {
        ctx.plane
            .who_am_i(caller)
            .map(|_| ())
            .map_err(ctx.upstream(Phase::Validate))
    }

    fn execute(&mut self, ctx: &Context<'_>, elevated: &Credential) -> Result<()> {
        match ctx.plane.create_token(elevated, &self.spec()) {
            Ok(issued) => {
                tracing::info!(accessor = %issued.accessor, "token issued");
                self.issued = Some(issued);
                Ok(())
            }
            Err(err) => {
                let mut failures = ExecutionFailures::new();
                failures.push(
                    "token",
                    redact_upstream(&err.to_string(), ctx.config.upstream_error_limit),
                );
                failures.into_result()
            }
        }
    }
}
