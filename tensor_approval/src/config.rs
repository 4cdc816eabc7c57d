// SPDX-License-Identifier: MIT OR Apache-2.0
//! Broker configuration.

use std::time::Duration;

use crate::error::{ApprovalError, Result};

/// Share envelope lifetime environment variable.
pub const ENV_SHARE_TTL_SECS: &str = "NEUMANN_APPROVAL_SHARE_TTL_SECS";
/// Comma separated list of policies a sync never deletes.
pub const ENV_PROTECTED_POLICIES: &str = "NEUMANN_APPROVAL_PROTECTED_POLICIES";
/// Directory inside the policy source that holds policy files.
pub const ENV_SYNC_PATH: &str = "NEUMANN_APPROVAL_SYNC_PATH";
/// Maximum length of an upstream error message relayed to callers.
pub const ENV_UPSTREAM_ERROR_LIMIT: &str = "NEUMANN_APPROVAL_UPSTREAM_ERROR_LIMIT";

/// Environment variable parsing helpers.
mod env_parse {
    use std::time::Duration;

    use super::{ApprovalError, Result};

    pub fn parse_duration_secs(key: &str) -> Option<Result<Duration>> {
        std::env::var(key).ok().map(|val| {
            val.trim()
                .parse::<u64>()
                .map(Duration::from_secs)
                .map_err(|e| ApprovalError::Config(format!("invalid {key}: {e}")))
        })
    }

    pub fn parse_usize(key: &str) -> Option<Result<usize>> {
        std::env::var(key).ok().map(|val| {
            val.trim()
                .parse()
                .map_err(|e| ApprovalError::Config(format!("invalid {key}: {e}")))
        })
    }

    pub fn parse_list(key: &str) -> Option<Vec<String>> {
        std::env::var(key).ok().map(|val| {
            val.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(ToString::to_string)
                .collect()
        })
    }
}

/// Configuration for the approval broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApprovalConfig {
    /// Lifetime of each wrapped share (default: 60 minutes).
    pub share_ttl: Duration,
    /// Policies a bulk sync leaves alone even when the source lacks them.
    pub protected_policies: Vec<String>,
    /// Path inside the policy source that holds policy documents.
    pub sync_path: String,
    /// Upstream error messages longer than this are truncated.
    pub upstream_error_limit: usize,
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            share_ttl: Duration::from_secs(60 * 60),
            protected_policies: vec!["root".to_string(), "default".to_string()],
            sync_path: String::new(),
            upstream_error_limit: 200,
        }
    }
}

impl ApprovalConfig {
    #[must_use]
    pub fn with_share_ttl(mut self, ttl: Duration) -> Self {
        self.share_ttl = ttl;
        self
    }

    #[must_use]
    pub fn with_protected_policies<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.protected_policies = names.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_sync_path(mut self, path: impl Into<String>) -> Self {
        self.sync_path = path.into();
        self
    }

    #[must_use]
    pub fn with_upstream_error_limit(mut self, limit: usize) -> Self {
        self.upstream_error_limit = limit;
        self
    }

    /// Build from defaults overlaid with `NEUMANN_APPROVAL_*` variables.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        if let Some(ttl) = env_parse::parse_duration_secs(ENV_SHARE_TTL_SECS) {
            config.share_ttl = ttl?;
        }
        if let Some(names) = env_parse::parse_list(ENV_PROTECTED_POLICIES) {
            config.protected_policies = names;
        }
        if let Ok(path) = std::env::var(ENV_SYNC_PATH) {
            config.sync_path = path;
        }
        if let Some(limit) = env_parse::parse_usize(ENV_UPSTREAM_ERROR_LIMIT) {
            config.upstream_error_limit = limit?;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.share_ttl.is_zero() {
            return Err(ApprovalError::Config(
                "share_ttl must be greater than zero".to_string(),
            ));
        }
        if self.upstream_error_limit == 0 {
            return Err(ApprovalError::Config(
                "upstream_error_limit must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn is_protected(&self, policy: &str) -> bool {
        self.protected_policies.iter().any(|p| p == policy)
    }
}
