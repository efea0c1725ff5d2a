//! Model-alias registry.
//!
//! Maps friendly aliases ("analyst", "lite") to concrete deployments and
//! holds the shared model client. Immutable after construction; an unknown
//! alias is an `invalid_request` surfaced before any token is emitted.

use std::collections::HashMap;
use std::sync::Arc;

use sp_domain::config::LlmConfig;
use sp_domain::error::{Error, Result};

use crate::traits::LlmClient;

/// An alias resolved to its deployment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedModel {
    pub alias: String,
    pub deployment: String,
}

pub struct ModelRegistry {
    aliases: HashMap<String, String>,
    default_alias: String,
    simple_alias: String,
    client: Arc<dyn LlmClient>,
}

impl ModelRegistry {
    pub fn new(cfg: &LlmConfig, client: Arc<dyn LlmClient>) -> Result<Self> {
        if !cfg.aliases.contains_key(&cfg.default_alias) {
            return Err(Error::Internal(format!(
                "default alias '{}' is not in the alias table",
                cfg.default_alias
            )));
        }
        Ok(Self {
            aliases: cfg.aliases.clone(),
            default_alias: cfg.default_alias.clone(),
            simple_alias: cfg.simple_alias.clone(),
            client,
        })
    }

    /// Resolve a client-supplied alias; `None` means the default.
    pub fn resolve(&self, requested: Option<&str>) -> Result<ResolvedModel> {
        let alias = requested.unwrap_or(&self.default_alias);
        match self.aliases.get(alias) {
            Some(deployment) => Ok(ResolvedModel {
                alias: alias.to_string(),
                deployment: deployment.clone(),
            }),
            None => Err(Error::InvalidRequest(format!("unknown model alias '{alias}'"))),
        }
    }

    /// The cheaper model used on the simple-query fast path. Falls back to
    /// the default when the simple alias is not configured.
    pub fn resolve_simple(&self) -> ResolvedModel {
        self.resolve(Some(&self.simple_alias))
            .unwrap_or_else(|_| ResolvedModel {
                alias: self.default_alias.clone(),
                deployment: self.aliases[&self.default_alias].clone(),
            })
    }

    pub fn client(&self) -> Arc<dyn LlmClient> {
        self.client.clone()
    }

    pub fn default_alias(&self) -> &str {
        &self.default_alias
    }

    /// Alias table, sorted, for the admin surface.
    pub fn list_aliases(&self) -> Vec<(String, String)> {
        let mut out: Vec<_> = self
            .aliases
            .iter()
            .map(|(a, d)| (a.clone(), d.clone()))
            .collect();
        out.sort();
        out
    }
}
