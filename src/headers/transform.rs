//! Header value transforms.
//!
//! Built-in transforms are plain string functions. Custom transforms are a
//! capability supplied by the host: a plugin manifest names one, and the
//! `TransformResolver` turns that name into an implementation once, when the
//! policy compiles.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransformError {
    #[error("unknown built-in transform `{0}`")]
    UnknownBuiltin(String),

    #[error("custom transform `{reference}` declared without a plugin root")]
    MissingPluginRoot { reference: String },

    #[error("plugin root {} does not exist", .root.display())]
    PluginRootNotFound { root: PathBuf },

    #[error("custom transform `{0}` is not registered")]
    NotRegistered(String),

    #[error("transform failed: {0}")]
    Failed(String),
}

/// String transforms available to every policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuiltinTransform {
    Trim,
    Lowercase,
    Uppercase,
    CollapseWhitespace,
    StripQuotes,
}

impl BuiltinTransform {
    pub fn apply(self, value: &str) -> String {
        match self {
            BuiltinTransform::Trim => value.trim().to_string(),
            BuiltinTransform::Lowercase => value.to_lowercase(),
            BuiltinTransform::Uppercase => value.to_uppercase(),
            BuiltinTransform::CollapseWhitespace => {
                value.split_whitespace().collect::<Vec<_>>().join(" ")
            }
            BuiltinTransform::StripQuotes => {
                let v = value.trim();
                let stripped = v
                    .strip_prefix('"')
                    .and_then(|s| s.strip_suffix('"'))
                    .or_else(|| v.strip_prefix('\'').and_then(|s| s.strip_suffix('\'')));
                stripped.unwrap_or(v).to_string()
            }
        }
    }
}

impl FromStr for BuiltinTransform {
    type Err = TransformError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "trim" => Ok(BuiltinTransform::Trim),
            "lowercase" | "lower" => Ok(BuiltinTransform::Lowercase),
            "uppercase" | "upper" => Ok(BuiltinTransform::Uppercase),
            "collapse-whitespace" => Ok(BuiltinTransform::CollapseWhitespace),
            "strip-quotes" => Ok(BuiltinTransform::StripQuotes),
            other => Err(TransformError::UnknownBuiltin(other.to_string())),
        }
    }
}

/// Parse a `trim|lowercase` pipeline.
pub fn parse_pipeline(spec: &str) -> Result<Vec<BuiltinTransform>, TransformError> {
    spec.split('|')
        .map(str::trim)
        .filter(|step| !step.is_empty())
        .map(BuiltinTransform::from_str)
        .collect()
}

/// A custom value transform supplied by the host for a plugin.
pub trait HeaderTransform: Send + Sync {
    fn apply(&self, value: &str) -> Result<String, TransformError>;
}

impl<F> HeaderTransform for F
where
    F: Fn(&str) -> Result<String, TransformError> + Send + Sync,
{
    fn apply(&self, value: &str) -> Result<String, TransformError> {
        self(value)
    }
}

/// Resolves a manifest's custom transform reference.
pub trait TransformResolver: Send + Sync {
    fn resolve(
        &self,
        plugin_root: Option<&Path>,
        reference: &str,
    ) -> Result<Arc<dyn HeaderTransform>, TransformError>;
}

/// Host-registered transforms, optionally scoped to one plugin root.
#[derive(Clone, Default)]
pub struct TransformCatalog {
    global: HashMap<String, Arc<dyn HeaderTransform>>,
    scoped: HashMap<(PathBuf, String), Arc<dyn HeaderTransform>>,
}

impl fmt::Debug for TransformCatalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransformCatalog")
            .field("global", &self.global.keys().collect::<Vec<_>>())
            .field("scoped", &self.scoped.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl TransformCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a transform available to any plugin.
    pub fn register(&mut self, reference: impl Into<String>, transform: Arc<dyn HeaderTransform>) {
        self.global.insert(reference.into(), transform);
    }

    /// Register a transform visible only to the plugin living at `root`.
    pub fn register_for(
        &mut self,
        root: impl Into<PathBuf>,
        reference: impl Into<String>,
        transform: Arc<dyn HeaderTransform>,
    ) {
        self.scoped.insert((root.into(), reference.into()), transform);
    }
}

impl TransformResolver for TransformCatalog {
    fn resolve(
        &self,
        plugin_root: Option<&Path>,
        reference: &str,
    ) -> Result<Arc<dyn HeaderTransform>, TransformError> {
        let root = plugin_root.ok_or_else(|| TransformError::MissingPluginRoot {
            reference: reference.to_string(),
        })?;
        if !root.is_dir() {
            return Err(TransformError::PluginRootNotFound {
                root: root.to_path_buf(),
            });
        }

        self.scoped
            .get(&(root.to_path_buf(), reference.to_string()))
            .or_else(|| self.global.get(reference))
            .cloned()
            .ok_or_else(|| TransformError::NotRegistered(reference.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipeline_applies_in_order() {
        let steps = parse_pipeline(" trim | lowercase ").unwrap();
        let out = steps.iter().fold("  SECRET  ".to_string(), |v, t| t.apply(&v));
        assert_eq!(out, "secret");
    }

    #[test]
    fn unknown_step_rejected() {
        assert_eq!(
            parse_pipeline("trim|rot13").unwrap_err(),
            TransformError::UnknownBuiltin("rot13".into())
        );
    }

    #[test]
    fn strip_quotes_and_collapse() {
        assert_eq!(BuiltinTransform::StripQuotes.apply("\"abc\""), "abc");
        assert_eq!(BuiltinTransform::StripQuotes.apply("'abc'"), "abc");
        assert_eq!(BuiltinTransform::CollapseWhitespace.apply(" a   b \t c "), "a b c");
    }

    #[test]
    fn catalog_requires_existing_root() {
        let mut catalog = TransformCatalog::new();
        catalog.register("redact", Arc::new(|_: &str| -> Result<String, TransformError> { Ok("***".to_string()) }));

        let err = catalog.resolve(None, "redact").err().unwrap();
        assert!(matches!(err, TransformError::MissingPluginRoot { .. }));

        let err = catalog
            .resolve(Some(Path::new("/definitely/not/here")), "redact")
            .err()
            .unwrap();
        assert!(matches!(err, TransformError::PluginRootNotFound { .. }));

        let dir = tempfile::tempdir().unwrap();
        let t = catalog.resolve(Some(dir.path()), "redact").unwrap();
        assert_eq!(t.apply("token").unwrap(), "***");
    }

    #[test]
    fn scoped_registration_wins() {
        let dir = tempfile::tempdir().unwrap();
        let mut catalog = TransformCatalog::new();
        catalog.register("t", Arc::new(|_: &str| -> Result<String, TransformError> { Ok("global".to_string()) }));
        catalog.register_for(dir.path(), "t", Arc::new(|_: &str| -> Result<String, TransformError> { Ok("scoped".to_string()) }));

        let t = catalog.resolve(Some(dir.path()), "t").unwrap();
        assert_eq!(t.apply("x").unwrap(), "scoped");
    }
}
