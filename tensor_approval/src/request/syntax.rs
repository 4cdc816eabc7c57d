// SPDX-License-Identifier: MIT OR Apache-2.0
//! Policy language checks.

/// Validates policy documents before they are proposed.
pub trait PolicySyntax: Send + Sync {
    /// `Err` carries a human-readable reason.
    fn check(&self, rules: &str) -> std::result::Result<(), String>;
}

/// Accepts HCL documents and JSON objects, the two encodings the control
/// plane understands.
#[derive(Debug, Default, Clone, Copy)]
pub struct HclPolicySyntax;

impl PolicySyntax for HclPolicySyntax {
    fn check(&self, rules: &str) -> std::result::Result<(), String> {
        let trimmed = rules.trim_start();
        if trimmed.starts_with('{') {
            return serde_json::from_str::<serde_json::Map<String, serde_json::Value>>(rules)
                .map(|_| ())
                .map_err(|e| format!("policy is not valid JSON: {e}"));
        }
        hcl::parse(rules)
            .map(|_| ())
            .map_err(|e| format!("policy must be HCL formatted: {e}"))
    }
}
