//! Plugin-declared header policy manifests.
//!
//! These are the serde shapes a plugin manifest (or the gateway config) uses to
//! declare header rules. They are inert until compiled by `policy.rs`.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Fallback for headers no rule matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum DefaultPosture {
    /// Admit the fixed safe set.
    #[default]
    #[serde(alias = "allowSafe")]
    AllowSafe,
    /// Strip everything not explicitly retained.
    Deny,
}

/// How a rule selects header names.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchSpec {
    /// Case-insensitive exact name.
    Exact(String),
    /// Case-insensitive regular expression over the whole name.
    Pattern(String),
}

/// What happens to a matched header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HeaderAction {
    Forward,
    /// Forward under `map_to`.
    Map,
    Strip,
}

/// Value check run after transforms.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ValidatorSpec {
    Regex {
        pattern: String,
    },
    Enum {
        values: Vec<String>,
        #[serde(default)]
        case_insensitive: bool,
    },
    Length {
        #[serde(default)]
        min: Option<usize>,
        #[serde(default)]
        max: Option<usize>,
    },
}

/// One declared header rule.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct HeaderRuleSpec {
    #[serde(rename = "match")]
    pub matcher: MatchSpec,

    pub action: HeaderAction,

    /// Target name for `map`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub map_to: Option<String>,

    #[serde(default)]
    pub required: bool,

    #[serde(default)]
    pub sensitive: bool,

    #[serde(default, alias = "cacheVary")]
    pub cache_vary: bool,

    #[serde(default, alias = "rateLimitKey")]
    pub rate_limit_key: bool,

    /// Built-in transforms separated by `|`, applied left to right.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transform: Option<String>,

    /// Host-registered transform, resolved against the plugin root.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_transform: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub validate: Vec<ValidatorSpec>,
}

impl HeaderRuleSpec {
    pub fn exact(name: impl Into<String>, action: HeaderAction) -> Self {
        Self::with_matcher(MatchSpec::Exact(name.into()), action)
    }

    pub fn pattern(pattern: impl Into<String>, action: HeaderAction) -> Self {
        Self::with_matcher(MatchSpec::Pattern(pattern.into()), action)
    }

    fn with_matcher(matcher: MatchSpec, action: HeaderAction) -> Self {
        Self {
            matcher,
            action,
            map_to: None,
            required: false,
            sensitive: false,
            cache_vary: false,
            rate_limit_key: false,
            transform: None,
            custom_transform: None,
            validate: Vec::new(),
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn sensitive(mut self) -> Self {
        self.sensitive = true;
        self
    }

    pub fn cache_vary(mut self) -> Self {
        self.cache_vary = true;
        self
    }

    pub fn rate_limit_key(mut self) -> Self {
        self.rate_limit_key = true;
        self
    }

    pub fn transform(mut self, pipeline: impl Into<String>) -> Self {
        self.transform = Some(pipeline.into());
        self
    }

    pub fn custom_transform(mut self, reference: impl Into<String>) -> Self {
        self.custom_transform = Some(reference.into());
        self
    }

    pub fn map_to(mut self, target: impl Into<String>) -> Self {
        self.map_to = Some(target.into());
        self
    }

    pub fn validate(mut self, validator: ValidatorSpec) -> Self {
        self.validate.push(validator);
        self
    }
}

/// CORS header lists emitted on responses.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct CorsSpec {
    pub expose_headers: Vec<String>,
    pub allow_headers: Vec<String>,
}

/// Strict-Transport-Security settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct HstsSpec {
    pub max_age: u64,
    #[serde(default)]
    pub include_sub_domains: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct SecuritySpec {
    pub cors: Option<CorsSpec>,
    pub hsts: Option<HstsSpec>,
}

/// A plugin's complete header declaration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct HeaderPolicyManifest {
    pub plugin_id: String,

    /// Directory custom transforms are resolved against.
    #[serde(default)]
    pub plugin_root: Option<PathBuf>,

    #[serde(default)]
    pub defaults: DefaultPosture,

    #[serde(default)]
    pub inbound: Vec<HeaderRuleSpec>,

    #[serde(default)]
    pub outbound: Vec<HeaderRuleSpec>,

    /// Names (or `prefix*`) retained when no rule matched.
    #[serde(default)]
    pub allow: Vec<String>,

    /// Names (or `prefix*`) always dropped.
    #[serde(default)]
    pub deny: Vec<String>,

    #[serde(default)]
    pub security: SecuritySpec,
}

impl HeaderPolicyManifest {
    pub fn new(plugin_id: impl Into<String>) -> Self {
        Self {
            plugin_id: plugin_id.into(),
            plugin_root: None,
            defaults: DefaultPosture::AllowSafe,
            inbound: Vec::new(),
            outbound: Vec::new(),
            allow: Vec::new(),
            deny: Vec::new(),
            security: SecuritySpec::default(),
        }
    }
}
