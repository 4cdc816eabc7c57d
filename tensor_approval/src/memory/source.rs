// SPDX-License-Identifier: MIT OR Apache-2.0
//! Policy source backed by published revisions held in memory.

use std::collections::BTreeMap;

use dashmap::DashMap;

use crate::{
    backend::PolicySource,
    error::{BackendError, BackendResult},
};

/// Extension stripped from document paths to form policy names.
const POLICY_EXT: &str = ".hcl";

/// [`PolicySource`] where each revision is a set of `path -> text` files.
///
/// A policy is every `*.hcl` file directly under the requested directory;
/// its name is the file stem.
#[derive(Default)]
pub struct StaticPolicySource {
    revisions: DashMap<String, BTreeMap<String, String>>,
}

impl StaticPolicySource {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish<I, P, T>(&self, revision: &str, files: I)
    where
        I: IntoIterator<Item = (P, T)>,
        P: Into<String>,
        T: Into<String>,
    {
        let files = files
            .into_iter()
            .map(|(p, t)| (p.into(), t.into()))
            .collect();
        self.revisions.insert(revision.to_string(), files);
    }
}

impl PolicySource for StaticPolicySource {
    fn fetch_proposed(
        &self,
        revision: &str,
        path: &str,
    ) -> BackendResult<BTreeMap<String, String>> {
        let files = self
            .revisions
            .get(revision)
            .ok_or_else(|| BackendError::NotFound(format!("revision {revision}")))?;

        let dir = path.trim_matches('/');
        let mut proposed = BTreeMap::new();
        for (file, text) in files.iter() {
            let relative = if dir.is_empty() {
                file.as_str()
            } else {
                match file
                    .strip_prefix(dir)
                    .and_then(|rest| rest.strip_prefix('/'))
                {
                    Some(rest) => rest,
                    None => continue,
                }
            };
            if relative.contains('/') {
                continue;
            }
            if let Some(name) = relative.strip_suffix(POLICY_EXT) {
                if !name.is_empty() {
                    proposed.insert(name.to_string(), text.clone());
                }
            }
        }
        Ok(proposed)
    }
}
