//! Compiled header rules and first-match lookup.
//!
//! # Design Decisions
//! - Exact names hash to their first declaring rule; patterns are scanned in
//!   declaration order only until they can no longer beat the exact hit
//! - Declaration order decides ties: first matching rule wins
//! - Patterns are case-insensitive and anchored to the whole name

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use axum::http::HeaderName;
use regex::{Regex, RegexBuilder};
use thiserror::Error;

use crate::headers::manifest::{HeaderAction, HeaderRuleSpec, MatchSpec, ValidatorSpec};
use crate::headers::transform::{
    parse_pipeline, BuiltinTransform, HeaderTransform, TransformError, TransformResolver,
};

#[derive(Debug, Error)]
pub enum PolicyCompileError {
    #[error("rule {rule}: invalid name pattern `{pattern}`: {source}")]
    InvalidPattern {
        rule: usize,
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("rule {rule}: invalid validator regex `{pattern}`: {source}")]
    InvalidValidator {
        rule: usize,
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("rule {rule}: {source}")]
    Transform {
        rule: usize,
        #[source]
        source: TransformError,
    },

    #[error("rule {rule}: `map` requires `map_to`")]
    MissingMapTarget { rule: usize },

    #[error("invalid header name `{0}`")]
    InvalidHeaderName(String),
}

#[derive(Debug, Clone)]
pub enum RuleMatcher {
    Exact(String),
    Pattern(Regex),
}

impl RuleMatcher {
    pub fn matches(&self, name: &str) -> bool {
        match self {
            RuleMatcher::Exact(exact) => exact == name,
            RuleMatcher::Pattern(re) => re.is_match(name),
        }
    }
}

impl fmt::Display for RuleMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuleMatcher::Exact(name) => f.write_str(name),
            RuleMatcher::Pattern(re) => write!(f, "/{}/", re.as_str()),
        }
    }
}

#[derive(Debug, Clone)]
pub enum Validator {
    Regex(Regex),
    Enum { values: Vec<String>, case_insensitive: bool },
    Length { min: Option<usize>, max: Option<usize> },
}

impl Validator {
    fn compile(rule: usize, spec: &ValidatorSpec) -> Result<Self, PolicyCompileError> {
        Ok(match spec {
            ValidatorSpec::Regex { pattern } => {
                let re = Regex::new(pattern).map_err(|source| PolicyCompileError::InvalidValidator {
                    rule,
                    pattern: pattern.clone(),
                    source,
                })?;
                Validator::Regex(re)
            }
            ValidatorSpec::Enum { values, case_insensitive } => Validator::Enum {
                values: values.clone(),
                case_insensitive: *case_insensitive,
            },
            ValidatorSpec::Length { min, max } => Validator::Length { min: *min, max: *max },
        })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Validator::Regex(_) => "regex",
            Validator::Enum { .. } => "enum",
            Validator::Length { .. } => "length",
        }
    }

    pub fn check(&self, value: &str) -> bool {
        match self {
            Validator::Regex(re) => re.is_match(value),
            Validator::Enum { values, case_insensitive } => values.iter().any(|allowed| {
                if *case_insensitive {
                    allowed.eq_ignore_ascii_case(value)
                } else {
                    allowed == value
                }
            }),
            Validator::Length { min, max } => {
                let len = value.chars().count();
                min.map_or(true, |m| len >= m) && max.map_or(true, |m| len <= m)
            }
        }
    }
}

/// A custom transform, resolved (or not) when the policy compiled.
#[derive(Clone)]
pub enum CustomTransform {
    Resolved {
        reference: String,
        transform: Arc<dyn HeaderTransform>,
    },
    /// Resolution failed; using the rule fails the request.
    Unresolved {
        reference: String,
        error: TransformError,
    },
}

impl fmt::Debug for CustomTransform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CustomTransform::Resolved { reference, .. } => {
                f.debug_tuple("Resolved").field(reference).finish()
            }
            CustomTransform::Unresolved { reference, error } => f
                .debug_tuple("Unresolved")
                .field(reference)
                .field(error)
                .finish(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CompiledRule {
    /// Declaration index within its direction.
    pub index: usize,
    pub matcher: RuleMatcher,
    pub action: HeaderAction,
    pub map_to: Option<HeaderName>,
    pub required: bool,
    pub sensitive: bool,
    pub cache_vary: bool,
    pub rate_limit_key: bool,
    pub transforms: Vec<BuiltinTransform>,
    pub custom: Option<CustomTransform>,
    pub validators: Vec<Validator>,
}

impl CompiledRule {
    pub fn compile(
        index: usize,
        spec: &HeaderRuleSpec,
        plugin_root: Option<&Path>,
        resolver: &dyn TransformResolver,
    ) -> Result<Self, PolicyCompileError> {
        let matcher = match &spec.matcher {
            MatchSpec::Exact(name) => RuleMatcher::Exact(name.trim().to_ascii_lowercase()),
            MatchSpec::Pattern(pattern) => {
                let re = RegexBuilder::new(&format!("^(?:{pattern})$"))
                    .case_insensitive(true)
                    .build()
                    .map_err(|source| PolicyCompileError::InvalidPattern {
                        rule: index,
                        pattern: pattern.clone(),
                        source,
                    })?;
                RuleMatcher::Pattern(re)
            }
        };

        let map_to = match (spec.action, &spec.map_to) {
            (HeaderAction::Map, None) => return Err(PolicyCompileError::MissingMapTarget { rule: index }),
            (_, Some(target)) => Some(
                HeaderName::from_bytes(target.trim().to_ascii_lowercase().as_bytes())
                    .map_err(|_| PolicyCompileError::InvalidHeaderName(target.clone()))?,
            ),
            (_, None) => None,
        };

        let transforms = match &spec.transform {
            Some(pipeline) => parse_pipeline(pipeline)
                .map_err(|source| PolicyCompileError::Transform { rule: index, source })?,
            None => Vec::new(),
        };

        let custom = spec.custom_transform.as_ref().map(|reference| {
            match resolver.resolve(plugin_root, reference) {
                Ok(transform) => CustomTransform::Resolved {
                    reference: reference.clone(),
                    transform,
                },
                Err(error) => {
                    tracing::warn!(reference = %reference, error = %error, "Custom header transform unresolved");
                    CustomTransform::Unresolved {
                        reference: reference.clone(),
                        error,
                    }
                }
            }
        });

        let validators = spec
            .validate
            .iter()
            .map(|v| Validator::compile(index, v))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            index,
            matcher,
            action: spec.action,
            map_to,
            required: spec.required,
            sensitive: spec.sensitive,
            cache_vary: spec.cache_vary,
            rate_limit_key: spec.rate_limit_key,
            transforms,
            custom,
            validators,
        })
    }

    /// Run built-ins then the custom transform.
    pub fn apply_transforms(&self, value: &str) -> Result<String, TransformError> {
        let mut out = self
            .transforms
            .iter()
            .fold(value.to_string(), |acc, t| t.apply(&acc));

        match &self.custom {
            Some(CustomTransform::Resolved { transform, .. }) => {
                out = transform.apply(&out)?;
            }
            Some(CustomTransform::Unresolved { error, .. }) => return Err(error.clone()),
            None => {}
        }
        Ok(out)
    }

    /// First failing validator kind, if any.
    pub fn validate(&self, value: &str) -> Result<(), &'static str> {
        match self.validators.iter().find(|v| !v.check(value)) {
            Some(failed) => Err(failed.kind()),
            None => Ok(()),
        }
    }

    pub fn describe(&self) -> String {
        self.matcher.to_string()
    }
}

/// Rules for one direction, with first-match lookup.
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    rules: Vec<CompiledRule>,
    exact: HashMap<String, usize>,
    patterns: Vec<usize>,
}

impl RuleSet {
    pub fn compile(
        specs: &[HeaderRuleSpec],
        plugin_root: Option<&Path>,
        resolver: &dyn TransformResolver,
    ) -> Result<Self, PolicyCompileError> {
        let mut set = RuleSet::default();
        for (index, spec) in specs.iter().enumerate() {
            let rule = CompiledRule::compile(index, spec, plugin_root, resolver)?;
            match &rule.matcher {
                RuleMatcher::Exact(name) => {
                    set.exact.entry(name.clone()).or_insert(index);
                }
                RuleMatcher::Pattern(_) => set.patterns.push(index),
            }
            set.rules.push(rule);
        }
        Ok(set)
    }

    /// First rule (by declaration order) matching a lowercase header name.
    pub fn find(&self, name: &str) -> Option<&CompiledRule> {
        let exact = self.exact.get(name).copied();
        let pattern = self
            .patterns
            .iter()
            .copied()
            .take_while(|&i| exact.map_or(true, |e| i < e))
            .find(|&i| self.rules[i].matcher.matches(name));

        pattern.or(exact).map(|i| &self.rules[i])
    }

    pub fn required(&self) -> impl Iterator<Item = &CompiledRule> {
        self.rules.iter().filter(|r| r.required)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}
