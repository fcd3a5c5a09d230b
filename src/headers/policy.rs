//! Compiled header policies and route-prefix lookup.
//!
//! # Responsibilities
//! - Compile a plugin manifest into inbound/outbound rule sets
//! - Precompute allow/deny name sets and security header values
//! - Resolve the policy governing a request path (longest prefix wins)
//!
//! # Design Decisions
//! - Immutable after compilation; the registry swaps whole snapshots
//! - Prefixes match on segment boundaries: `/jobs` governs `/jobs/1`, not `/jobsx`

use std::path::PathBuf;
use std::sync::Arc;

use arc_swap::ArcSwap;
use axum::http::HeaderValue;

use crate::config::schema::HeadersConfig;
use crate::headers::manifest::{DefaultPosture, HeaderPolicyManifest};
use crate::headers::rule::{PolicyCompileError, RuleSet};
use crate::headers::transform::TransformResolver;

/// Header names, optionally ending in `*` for a prefix match.
#[derive(Debug, Clone, Default)]
pub struct NameSet {
    exact: Vec<String>,
    prefixes: Vec<String>,
}

impl NameSet {
    pub fn new(names: &[String]) -> Self {
        let mut set = NameSet::default();
        for name in names {
            let name = name.trim().to_ascii_lowercase();
            match name.strip_suffix('*') {
                Some(prefix) => set.prefixes.push(prefix.to_string()),
                None => set.exact.push(name),
            }
        }
        set
    }

    pub fn contains(&self, name: &str) -> bool {
        self.exact.iter().any(|n| n == name) || self.prefixes.iter().any(|p| name.starts_with(p.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.exact.is_empty() && self.prefixes.is_empty()
    }
}

/// Response headers derived from the manifest's security section.
#[derive(Debug, Clone, Default)]
pub struct SecurityHeaders {
    pub expose_headers: Option<HeaderValue>,
    pub allow_headers: Option<HeaderValue>,
    pub hsts: Option<HeaderValue>,
}

impl SecurityHeaders {
    fn compile(manifest: &HeaderPolicyManifest) -> Result<Self, PolicyCompileError> {
        let list = |names: &[String]| -> Result<Option<HeaderValue>, PolicyCompileError> {
            if names.is_empty() {
                return Ok(None);
            }
            let joined = names.join(", ");
            HeaderValue::from_str(&joined)
                .map(Some)
                .map_err(|_| PolicyCompileError::InvalidHeaderName(joined))
        };

        let (expose_headers, allow_headers) = match &manifest.security.cors {
            Some(cors) => (list(&cors.expose_headers)?, list(&cors.allow_headers)?),
            None => (None, None),
        };

        let hsts = manifest.security.hsts.as_ref().map(|hsts| {
            let value = if hsts.include_sub_domains {
                format!("max-age={}; includeSubDomains", hsts.max_age)
            } else {
                format!("max-age={}", hsts.max_age)
            };
            // Only digits and ASCII literals.
            HeaderValue::from_str(&value).unwrap_or_else(|_| HeaderValue::from_static("max-age=0"))
        });

        Ok(Self {
            expose_headers,
            allow_headers,
            hsts,
        })
    }
}

/// A plugin manifest compiled for enforcement.
#[derive(Debug, Clone)]
pub struct CompiledHeaderPolicy {
    pub plugin_id: String,
    pub plugin_root: Option<PathBuf>,
    pub posture: DefaultPosture,
    pub inbound: RuleSet,
    pub outbound: RuleSet,
    pub allow: NameSet,
    pub deny: NameSet,
    pub security: SecurityHeaders,
}

impl CompiledHeaderPolicy {
    pub fn compile(
        manifest: &HeaderPolicyManifest,
        resolver: &dyn TransformResolver,
    ) -> Result<Self, PolicyCompileError> {
        let root = manifest.plugin_root.as_deref();
        Ok(Self {
            plugin_id: manifest.plugin_id.clone(),
            plugin_root: manifest.plugin_root.clone(),
            posture: manifest.defaults,
            inbound: RuleSet::compile(&manifest.inbound, root, resolver)?,
            outbound: RuleSet::compile(&manifest.outbound, root, resolver)?,
            allow: NameSet::new(&manifest.allow),
            deny: NameSet::new(&manifest.deny),
            security: SecurityHeaders::compile(manifest)?,
        })
    }
}

#[derive(Debug, Default)]
struct PolicyTable {
    /// Sorted longest prefix first.
    entries: Vec<(String, Arc<CompiledHeaderPolicy>)>,
}

impl PolicyTable {
    fn new(mut entries: Vec<(String, Arc<CompiledHeaderPolicy>)>) -> Self {
        entries.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
        Self { entries }
    }

    fn resolve(&self, path: &str) -> Option<Arc<CompiledHeaderPolicy>> {
        self.entries
            .iter()
            .find(|(prefix, _)| prefix_matches(prefix, path))
            .map(|(_, policy)| policy.clone())
    }
}

fn prefix_matches(prefix: &str, path: &str) -> bool {
    let prefix = prefix.trim_end_matches('/');
    if prefix.is_empty() {
        return true;
    }
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

/// Route-prefix → policy table, swapped atomically on reload.
#[derive(Debug, Default)]
pub struct PolicyRegistry {
    table: ArcSwap<PolicyTable>,
}

impl PolicyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compile every configured policy. Fails on the first bad manifest.
    pub fn from_config(
        config: &HeadersConfig,
        resolver: &dyn TransformResolver,
    ) -> Result<Self, PolicyCompileError> {
        let registry = Self::new();
        registry.reload(config, resolver)?;
        Ok(registry)
    }

    /// Recompile from config and swap in. The old table stays live on error.
    pub fn reload(
        &self,
        config: &HeadersConfig,
        resolver: &dyn TransformResolver,
    ) -> Result<(), PolicyCompileError> {
        let entries = config
            .policies
            .iter()
            .map(|p| {
                CompiledHeaderPolicy::compile(&p.manifest, resolver)
                    .map(|policy| (p.route_prefix.clone(), Arc::new(policy)))
            })
            .collect::<Result<Vec<_>, _>>()?;

        tracing::info!(policies = entries.len(), "Header policies compiled");
        self.table.store(Arc::new(PolicyTable::new(entries)));
        Ok(())
    }

    /// Install a single policy; used by tests and embedders.
    pub fn insert(&self, prefix: impl Into<String>, policy: CompiledHeaderPolicy) {
        let prefix = prefix.into();
        let current = self.table.load();
        let mut entries: Vec<_> = current
            .entries
            .iter()
            .filter(|(p, _)| *p != prefix)
            .cloned()
            .collect();
        entries.push((prefix, Arc::new(policy)));
        self.table.store(Arc::new(PolicyTable::new(entries)));
    }

    pub fn resolve(&self, path: &str) -> Option<Arc<CompiledHeaderPolicy>> {
        self.table.load().resolve(path)
    }

    pub fn len(&self) -> usize {
        self.table.load().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
