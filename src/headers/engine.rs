//! Header policy enforcement.
//!
//! # Responsibilities
//! - Inbound pass: sanitize request headers, run transforms and validators,
//!   check required rules, collect Vary / sensitive / rate-limit keys
//! - Outbound pass: fixed strips, policy rules, Vary merge, CORS and HSTS
//! - Finish: flush counters once, push decisions into the debug ring
//!
//! # Design Decisions
//! - The engine never mutates the request; it fills `EnforcementState::sanitized`
//!   and the caller swaps it in (so dry-run can skip the swap)
//! - Hop-by-hop headers are transport state and are stripped in every mode
//! - Outbound problems degrade to stripping the header

use std::collections::HashSet;
use std::sync::Arc;

use axum::http::header::{
    ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_EXPOSE_HEADERS, AUTHORIZATION, CONNECTION,
    SET_COOKIE, STRICT_TRANSPORT_SECURITY, VARY,
};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use chrono::Utc;
use thiserror::Error;

use crate::headers::manifest::{DefaultPosture, HeaderAction};
use crate::headers::policy::{CompiledHeaderPolicy, PolicyRegistry};
use crate::headers::rule::{CompiledRule, RuleSet};
use crate::headers::state::{DebugEntry, DebugRing, DecisionReason, Direction, EnforcementState};
use crate::headers::{
    canonical_name, is_default_sensitive, is_hop_by_hop, is_system_header, EnforcementMode,
    SAFE_INBOUND, SAFE_OUTBOUND,
};
use crate::observability::metrics::MetricsCollector;

/// Request-fatal policy violations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HeaderPolicyError {
    #[error("required header `{header}` is missing")]
    Required { header: String },

    #[error("header `{header}` failed {validator} validation")]
    Invalid { header: String, validator: &'static str },

    #[error("header `{header}` transform failed: {reason}")]
    Transform { header: String, reason: String },
}

impl HeaderPolicyError {
    pub fn code(&self) -> &'static str {
        match self {
            HeaderPolicyError::Required { .. } => "E_HEADER_REQUIRED",
            HeaderPolicyError::Invalid { .. } => "E_HEADER_INVALID",
            HeaderPolicyError::Transform { .. } => "E_HEADER_TRANSFORM",
        }
    }

    pub fn status(&self) -> StatusCode {
        StatusCode::BAD_REQUEST
    }

    pub fn header(&self) -> &str {
        match self {
            HeaderPolicyError::Required { header }
            | HeaderPolicyError::Invalid { header, .. }
            | HeaderPolicyError::Transform { header, .. } => header,
        }
    }
}

/// Request facts recorded alongside decisions in the debug ring.
#[derive(Debug, Clone, Default)]
pub struct RequestInfo {
    pub request_id: Option<String>,
    pub method: String,
    pub path: String,
}

pub struct HeaderPolicyEngine {
    mode: EnforcementMode,
    registry: Arc<PolicyRegistry>,
    debug: Arc<DebugRing>,
    metrics: Arc<MetricsCollector>,
}

impl HeaderPolicyEngine {
    pub fn new(
        mode: EnforcementMode,
        registry: Arc<PolicyRegistry>,
        debug: Arc<DebugRing>,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            mode,
            registry,
            debug,
            metrics,
        }
    }

    pub fn mode(&self) -> EnforcementMode {
        self.mode
    }

    pub fn registry(&self) -> &Arc<PolicyRegistry> {
        &self.registry
    }

    pub fn debug_ring(&self) -> &Arc<DebugRing> {
        &self.debug
    }

    pub fn resolve(&self, path: &str) -> Option<Arc<CompiledHeaderPolicy>> {
        self.registry.resolve(path)
    }

    pub fn new_state(&self) -> EnforcementState {
        EnforcementState::new(self.mode.records_decisions())
    }

    /// Inbound pass. On success `state.sanitized` holds the retained headers.
    ///
    /// In dry-run every would-be failure is recorded and the pass always
    /// succeeds.
    pub fn enforce_inbound(
        &self,
        policy: &CompiledHeaderPolicy,
        headers: &HeaderMap,
        state: &mut EnforcementState,
    ) -> Result<(), HeaderPolicyError> {
        let dry_run = self.mode.is_dry_run();
        let connection = connection_tokens(headers);
        let mut satisfied = HashSet::new();

        for name in headers.keys() {
            let lname = name.as_str();

            if is_hop_by_hop(lname) || connection.contains(lname) {
                state.record(lname, Direction::Inbound, false, DecisionReason::HopByHop);
                continue;
            }
            if policy.deny.contains(lname) {
                state.record(lname, Direction::Inbound, false, DecisionReason::DenyList);
                continue;
            }

            let rule = policy.inbound.find(lname);
            if rule.is_some_and(|r| r.sensitive) || is_default_sensitive(lname) {
                state.sensitive.insert(lname.to_string());
                state.sensitive_inbound += 1;
            }

            let Some(rule) = rule else {
                let reason = fallback(policy, lname, SAFE_INBOUND);
                let kept = is_kept(reason);
                if kept {
                    for value in headers.get_all(name) {
                        state.sanitized.append(name.clone(), value.clone());
                    }
                }
                state.record(lname, Direction::Inbound, kept, reason);
                continue;
            };

            if rule.action == HeaderAction::Strip {
                state.record(lname, Direction::Inbound, false, DecisionReason::RuleStrip);
                continue;
            }

            let target = rule.map_to.clone().unwrap_or_else(|| name.clone());
            let mut first_kept: Option<String> = None;

            for value in headers.get_all(name) {
                let raw = String::from_utf8_lossy(value.as_bytes());
                match process_value(rule, &raw, state, lname, Direction::Inbound) {
                    Ok(Some(out)) => {
                        state.sanitized.append(target.clone(), out.1);
                        first_kept.get_or_insert(out.0);
                    }
                    Ok(None) => {}
                    Err(e) if dry_run => {
                        tracing::debug!(error = %e, "Dry-run: header violation not enforced");
                    }
                    Err(e) => return Err(e),
                }
            }

            if let Some(first) = first_kept {
                state.record(lname, Direction::Inbound, true, DecisionReason::RuleForward);
                satisfied.insert(rule.index);
                if rule.cache_vary {
                    state.vary.insert(canonical_name(lname));
                }
                if rule.rate_limit_key {
                    state.rate_limit_keys.entry(lname.to_string()).or_insert(first);
                }
            }
        }

        check_required(&policy.inbound, &satisfied, state, dry_run)
    }

    /// Outbound pass over response headers. Never fails.
    pub fn enforce_outbound(
        &self,
        policy: Option<&CompiledHeaderPolicy>,
        headers: &mut HeaderMap,
        state: &mut EnforcementState,
    ) {
        let dry_run = self.mode.is_dry_run();
        let connection = connection_tokens(headers);
        let mut out = HeaderMap::with_capacity(headers.len());

        for name in headers.keys() {
            let lname = name.as_str();

            if is_hop_by_hop(lname) || connection.contains(lname) {
                state.record(lname, Direction::Outbound, false, DecisionReason::HopByHop);
                continue;
            }
            if *name == AUTHORIZATION {
                state.record(lname, Direction::Outbound, false, DecisionReason::SensitiveStrip);
                continue;
            }

            let Some(policy) = policy else {
                if *name == SET_COOKIE {
                    state.record(lname, Direction::Outbound, false, DecisionReason::SensitiveStrip);
                    continue;
                }
                for value in headers.get_all(name) {
                    out.append(name.clone(), value.clone());
                }
                continue;
            };

            if policy.deny.contains(lname) {
                state.record(lname, Direction::Outbound, false, DecisionReason::DenyList);
                continue;
            }

            let rule = policy.outbound.find(lname);
            let forwards = rule.is_some_and(|r| r.action != HeaderAction::Strip);
            if *name == SET_COOKIE && !forwards {
                state.record(lname, Direction::Outbound, false, DecisionReason::SensitiveStrip);
                continue;
            }

            let Some(rule) = rule else {
                let reason = fallback(policy, lname, SAFE_OUTBOUND);
                let kept = is_kept(reason);
                if kept {
                    for value in headers.get_all(name) {
                        out.append(name.clone(), value.clone());
                    }
                }
                state.record(lname, Direction::Outbound, kept, reason);
                continue;
            };

            if rule.action == HeaderAction::Strip {
                state.record(lname, Direction::Outbound, false, DecisionReason::RuleStrip);
                continue;
            }

            let target = rule.map_to.clone().unwrap_or_else(|| name.clone());
            let mut kept_any = false;
            for value in headers.get_all(name) {
                let raw = String::from_utf8_lossy(value.as_bytes());
                // Failures are already recorded; outbound just drops.
                if let Ok(Some((_, value))) = process_value(rule, &raw, state, lname, Direction::Outbound) {
                    out.append(target.clone(), value);
                    kept_any = true;
                }
            }
            if kept_any {
                state.record(lname, Direction::Outbound, true, DecisionReason::RuleForward);
                if rule.cache_vary {
                    state.vary.insert(canonical_name(lname));
                }
            }
        }

        if !state.vary.is_empty() {
            state.vary_applied += 1;
            if let Some(merged) = merge_vary(&out, &state.vary) {
                out.insert(VARY, merged);
            }
        }

        if let Some(policy) = policy {
            let security = &policy.security;
            if let Some(v) = &security.expose_headers {
                out.insert(ACCESS_CONTROL_EXPOSE_HEADERS, v.clone());
            }
            if let Some(v) = &security.allow_headers {
                out.insert(ACCESS_CONTROL_ALLOW_HEADERS, v.clone());
            }
            if let Some(v) = &security.hsts {
                out.insert(STRICT_TRANSPORT_SECURITY, v.clone());
            }
        }

        if dry_run {
            strip_hop_by_hop(headers);
        } else {
            *headers = out;
        }
    }

    /// Flush counters and publish decisions. Safe to call more than once.
    pub fn finish(&self, plugin_id: &str, state: &mut EnforcementState, info: RequestInfo) {
        if !state.flush(&self.metrics, plugin_id, self.mode.is_dry_run()) {
            return;
        }
        if self.mode.records_decisions() {
            self.debug.push(DebugEntry {
                timestamp: Utc::now(),
                request_id: info.request_id,
                method: info.method,
                path: info.path,
                plugin_id: plugin_id.to_string(),
                dry_run: self.mode.is_dry_run(),
                decisions: state.take_decisions(),
            });
        }
    }
}

/// Transform then validate one value. `Ok(None)` means dropped quietly.
fn process_value(
    rule: &CompiledRule,
    raw: &str,
    state: &mut EnforcementState,
    header: &str,
    direction: Direction,
) -> Result<Option<(String, HeaderValue)>, HeaderPolicyError> {
    let transformed = match rule.apply_transforms(raw) {
        Ok(v) => v,
        Err(e) => {
            state.record(header, direction, false, DecisionReason::TransformError);
            return Err(HeaderPolicyError::Transform {
                header: header.to_string(),
                reason: e.to_string(),
            });
        }
    };

    if transformed.is_empty() {
        state.record(header, direction, false, DecisionReason::TransformEmpty);
        return Ok(None);
    }

    if let Err(kind) = rule.validate(&transformed) {
        state.validation_errors += 1;
        state.record(header, direction, false, DecisionReason::Validator(kind));
        return Err(HeaderPolicyError::Invalid {
            header: header.to_string(),
            validator: kind,
        });
    }

    match HeaderValue::from_str(&transformed) {
        Ok(value) => Ok(Some((transformed, value))),
        Err(_) => {
            state.record(header, direction, false, DecisionReason::TransformError);
            Ok(None)
        }
    }
}

fn check_required(
    rules: &RuleSet,
    satisfied: &HashSet<usize>,
    state: &mut EnforcementState,
    dry_run: bool,
) -> Result<(), HeaderPolicyError> {
    for rule in rules.required() {
        if satisfied.contains(&rule.index) {
            continue;
        }
        let header = rule.describe();
        state.record(&header, Direction::Inbound, false, DecisionReason::RequiredMissing);
        if !dry_run {
            return Err(HeaderPolicyError::Required { header });
        }
    }
    Ok(())
}

/// Fallback for headers no rule matched: allow-list, system, safe default.
fn fallback(policy: &CompiledHeaderPolicy, name: &str, safe: &[&str]) -> DecisionReason {
    if policy.allow.contains(name) {
        DecisionReason::AllowList
    } else if is_system_header(name) {
        DecisionReason::System
    } else {
        match policy.posture {
            DefaultPosture::AllowSafe if is_safe(name, safe) => DecisionReason::DefaultAllow,
            DefaultPosture::AllowSafe => DecisionReason::NotAllowed,
            DefaultPosture::Deny => DecisionReason::DefaultDeny,
        }
    }
}

fn is_safe(name: &str, safe: &[&str]) -> bool {
    safe.contains(&name)
}

fn is_kept(reason: DecisionReason) -> bool {
    matches!(
        reason,
        DecisionReason::AllowList | DecisionReason::System | DecisionReason::DefaultAllow
    )
}

/// Lowercase header names listed in `Connection`.
fn connection_tokens(headers: &HeaderMap) -> HashSet<String> {
    headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|t| t.trim().to_ascii_lowercase())
        .filter(|t| !t.is_empty())
        .collect()
}

fn merge_vary(existing: &HeaderMap, extra: &std::collections::BTreeSet<String>) -> Option<HeaderValue> {
    let mut seen = HashSet::new();
    let mut names = Vec::new();
    let current = existing
        .get_all(VARY)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty());

    for name in current.chain(extra.iter().cloned()) {
        if seen.insert(name.to_ascii_lowercase()) {
            names.push(name);
        }
    }
    HeaderValue::from_str(&names.join(", ")).ok()
}

/// Remove hop-by-hop headers, including any named by `Connection`.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let connection = connection_tokens(headers);
    let doomed: Vec<HeaderName> = headers
        .keys()
        .filter(|n| is_hop_by_hop(n.as_str()) || connection.contains(n.as_str()))
        .cloned()
        .collect();
    for name in doomed {
        headers.remove(&name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headers::manifest::{HeaderPolicyManifest, HeaderRuleSpec, HstsSpec, ValidatorSpec};
    use crate::headers::transform::{TransformCatalog, TransformError};

    fn engine(mode: EnforcementMode) -> HeaderPolicyEngine {
        HeaderPolicyEngine::new(
            mode,
            Arc::new(PolicyRegistry::new()),
            Arc::new(DebugRing::new(10)),
            Arc::new(MetricsCollector::new()),
        )
    }

    fn compile(manifest: HeaderPolicyManifest) -> CompiledHeaderPolicy {
        CompiledHeaderPolicy::compile(&manifest, &TransformCatalog::new()).unwrap()
    }

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (k, v) in pairs {
            map.append(
                HeaderName::from_bytes(k.as_bytes()).unwrap(),
                HeaderValue::from_str(v).unwrap(),
            );
        }
        map
    }

    fn api_key_policy() -> CompiledHeaderPolicy {
        let mut manifest = HeaderPolicyManifest::new("jobs");
        manifest.inbound.push(
            HeaderRuleSpec::exact("x-api-key", HeaderAction::Forward)
                .required()
                .transform("trim|lowercase"),
        );
        compile(manifest)
    }

    #[test]
    fn trims_and_lowercases_required_key() {
        let engine = engine(EnforcementMode::Off);
        let mut state = engine.new_state();
        let input = headers(&[("x-api-key", "  SECRET  "), ("accept", "*/*")]);

        engine.enforce_inbound(&api_key_policy(), &input, &mut state).unwrap();

        assert_eq!(state.sanitized.get("x-api-key").unwrap(), "secret");
        assert_eq!(state.sanitized.get("accept").unwrap(), "*/*");
        assert_eq!(state.validation_errors, 0);
    }

    #[test]
    fn missing_required_header_fails() {
        let engine = engine(EnforcementMode::Off);
        let mut state = engine.new_state();
        let err = engine
            .enforce_inbound(&api_key_policy(), &headers(&[("accept", "*/*")]), &mut state)
            .unwrap_err();
        assert_eq!(err.code(), "E_HEADER_REQUIRED");
    }

    #[test]
    fn dry_run_never_fails() {
        let engine = engine(EnforcementMode::DryRun);
        let mut state = engine.new_state();
        engine
            .enforce_inbound(&api_key_policy(), &headers(&[("accept", "*/*")]), &mut state)
            .unwrap();
        assert!(state
            .decisions()
            .iter()
            .any(|d| d.reason == DecisionReason::RequiredMissing));
    }

    #[test]
    fn hop_by_hop_and_connection_tokens_dropped() {
        let engine = engine(EnforcementMode::Off);
        let mut manifest = HeaderPolicyManifest::new("p");
        manifest.allow = vec!["x-custom".into()];
        let policy = compile(manifest);

        let input = headers(&[
            ("connection", "x-custom"),
            ("keep-alive", "timeout=5"),
            ("x-custom", "1"),
            ("x-other", "2"),
        ]);
        let mut state = engine.new_state();
        engine.enforce_inbound(&policy, &input, &mut state).unwrap();
        assert!(state.sanitized.is_empty());
    }

    #[test]
    fn deny_posture_drops_safe_headers() {
        let engine = engine(EnforcementMode::Debug);
        let mut manifest = HeaderPolicyManifest::new("p");
        manifest.defaults = DefaultPosture::Deny;
        let policy = compile(manifest);

        let mut state = engine.new_state();
        let input = headers(&[("accept", "*/*"), ("x-request-id", "r1")]);
        engine.enforce_inbound(&policy, &input, &mut state).unwrap();

        assert!(state.sanitized.get("accept").is_none());
        assert_eq!(state.sanitized.get("x-request-id").unwrap(), "r1");
        let reasons: Vec<_> = state.decisions().iter().map(|d| d.reason.code()).collect();
        assert!(reasons.contains(&"default-deny".to_string()));
        assert!(reasons.contains(&"system".to_string()));
    }

    #[test]
    fn validator_failure_is_invalid() {
        let engine = engine(EnforcementMode::Off);
        let mut manifest = HeaderPolicyManifest::new("p");
        manifest.inbound.push(
            HeaderRuleSpec::exact("x-env", HeaderAction::Forward).validate(ValidatorSpec::Regex {
                pattern: "^(prod|dev)$".into(),
            }),
        );
        let policy = compile(manifest);

        let mut state = engine.new_state();
        let err = engine
            .enforce_inbound(&policy, &headers(&[("x-env", "qa")]), &mut state)
            .unwrap_err();
        assert_eq!(err.code(), "E_HEADER_INVALID");
        assert_eq!(state.validation_errors, 1);
    }

    #[test]
    fn map_vary_and_rate_limit_key() {
        let engine = engine(EnforcementMode::Off);
        let mut manifest = HeaderPolicyManifest::new("p");
        manifest.inbound.push(
            HeaderRuleSpec::exact("x-legacy-tenant", HeaderAction::Map)
                .map_to("x-tenant")
                .cache_vary()
                .rate_limit_key(),
        );
        let policy = compile(manifest);

        let mut state = engine.new_state();
        engine
            .enforce_inbound(&policy, &headers(&[("x-legacy-tenant", "acme")]), &mut state)
            .unwrap();
        assert_eq!(state.sanitized.get("x-tenant").unwrap(), "acme");
        assert!(state.sanitized.get("x-legacy-tenant").is_none());
        assert!(state.vary.contains("X-Legacy-Tenant"));
        assert_eq!(state.rate_limit_keys["x-legacy-tenant"], "acme");
    }

    #[test]
    fn empty_transform_result_drops_header() {
        let engine = engine(EnforcementMode::Off);
        let mut manifest = HeaderPolicyManifest::new("p");
        manifest
            .inbound
            .push(HeaderRuleSpec::exact("x-note", HeaderAction::Forward).transform("trim"));
        let policy = compile(manifest);

        let mut state = engine.new_state();
        engine
            .enforce_inbound(&policy, &headers(&[("x-note", "   ")]), &mut state)
            .unwrap();
        assert!(state.sanitized.get("x-note").is_none());
    }

    fn token_policy(root: Option<&std::path::Path>) -> CompiledHeaderPolicy {
        let mut catalog = TransformCatalog::new();
        catalog.register(
            "verify-token",
            Arc::new(|value: &str| -> Result<String, TransformError> {
                if value.starts_with("tok_") {
                    Ok(value.to_string())
                } else {
                    Err(TransformError::Failed("token signature mismatch".into()))
                }
            }),
        );
        let mut manifest = HeaderPolicyManifest::new("tokens");
        manifest.plugin_root = root.map(|r| r.to_path_buf());
        manifest
            .inbound
            .push(HeaderRuleSpec::exact("x-token", HeaderAction::Forward).custom_transform("verify-token"));
        CompiledHeaderPolicy::compile(&manifest, &catalog).unwrap()
    }

    #[test]
    fn custom_transform_failure_rejects_request() {
        let root = tempfile::tempdir().unwrap();
        let policy = token_policy(Some(root.path()));
        let engine = engine(EnforcementMode::Debug);

        let mut state = engine.new_state();
        engine
            .enforce_inbound(&policy, &headers(&[("x-token", "tok_abc")]), &mut state)
            .unwrap();
        assert_eq!(state.sanitized.get("x-token").unwrap(), "tok_abc");

        let mut state = engine.new_state();
        let err = engine
            .enforce_inbound(&policy, &headers(&[("x-token", "forged")]), &mut state)
            .unwrap_err();
        assert_eq!(err.code(), "E_HEADER_TRANSFORM");
        assert_eq!(err.header(), "x-token");
        assert!(err.to_string().contains("token signature mismatch"));
        assert!(state
            .decisions()
            .iter()
            .any(|d| d.header == "x-token" && d.reason == DecisionReason::TransformError));
    }

    #[test]
    fn dry_run_drops_header_when_transform_fails() {
        let root = tempfile::tempdir().unwrap();
        let policy = token_policy(Some(root.path()));
        let engine = engine(EnforcementMode::DryRun);

        let mut state = engine.new_state();
        engine
            .enforce_inbound(&policy, &headers(&[("x-token", "forged"), ("accept", "*/*")]), &mut state)
            .unwrap();
        assert!(state.sanitized.get("x-token").is_none());
        assert_eq!(state.sanitized.get("accept").unwrap(), "*/*");
        assert!(state
            .decisions()
            .iter()
            .any(|d| d.header == "x-token" && d.reason == DecisionReason::TransformError));
    }

    #[test]
    fn unresolved_custom_transform_rejects_matching_request() {
        // No plugin root, so the reference cannot resolve at compile time.
        let policy = token_policy(None);
        let engine = engine(EnforcementMode::Off);

        let mut state = engine.new_state();
        engine
            .enforce_inbound(&policy, &headers(&[("accept", "*/*")]), &mut state)
            .unwrap();

        let mut state = engine.new_state();
        let err = engine
            .enforce_inbound(&policy, &headers(&[("x-token", "tok_abc")]), &mut state)
            .unwrap_err();
        assert_eq!(err.code(), "E_HEADER_TRANSFORM");
        assert!(err.to_string().contains("without a plugin root"));
    }

    #[test]
    fn outbound_fixed_strips_and_security_headers() {
        let engine = engine(EnforcementMode::Off);
        let mut manifest = HeaderPolicyManifest::new("p");
        manifest.security.hsts = Some(HstsSpec {
            max_age: 60,
            include_sub_domains: false,
        });
        let policy = compile(manifest);

        let mut state = engine.new_state();
        state.vary.insert("X-Api-Key".into());
        let mut response = headers(&[
            ("content-type", "application/json"),
            ("set-cookie", "a=b"),
            ("authorization", "Bearer x"),
            ("transfer-encoding", "chunked"),
            ("vary", "Accept-Encoding"),
            ("x-internal", "1"),
        ]);
        engine.enforce_outbound(Some(&policy), &mut response, &mut state);

        assert_eq!(response.get("content-type").unwrap(), "application/json");
        assert!(response.get("set-cookie").is_none());
        assert!(response.get("authorization").is_none());
        assert!(response.get("transfer-encoding").is_none());
        assert!(response.get("x-internal").is_none());
        assert_eq!(response.get("vary").unwrap(), "Accept-Encoding, X-Api-Key");
        assert_eq!(response.get("strict-transport-security").unwrap(), "max-age=60");
        assert_eq!(state.vary_applied, 1);
    }

    #[test]
    fn outbound_rule_can_forward_set_cookie() {
        let engine = engine(EnforcementMode::Off);
        let mut manifest = HeaderPolicyManifest::new("p");
        manifest
            .outbound
            .push(HeaderRuleSpec::exact("set-cookie", HeaderAction::Forward));
        let policy = compile(manifest);

        let mut state = engine.new_state();
        let mut response = headers(&[("set-cookie", "session=1")]);
        engine.enforce_outbound(Some(&policy), &mut response, &mut state);
        assert_eq!(response.get("set-cookie").unwrap(), "session=1");
    }

    #[test]
    fn outbound_dry_run_only_strips_hop_by_hop() {
        let engine = engine(EnforcementMode::DryRun);
        let mut manifest = HeaderPolicyManifest::new("p");
        manifest.defaults = DefaultPosture::Deny;
        let policy = compile(manifest);

        let mut state = engine.new_state();
        let mut response = headers(&[("x-internal", "1"), ("upgrade", "h2c")]);
        engine.enforce_outbound(Some(&policy), &mut response, &mut state);
        assert_eq!(response.get("x-internal").unwrap(), "1");
        assert!(response.get("upgrade").is_none());
    }

    #[test]
    fn finish_pushes_debug_entry_once() {
        let engine = engine(EnforcementMode::Debug);
        let mut state = engine.new_state();
        engine
            .enforce_inbound(&api_key_policy(), &headers(&[("x-api-key", "k")]), &mut state)
            .unwrap();
        engine.finish("jobs", &mut state, RequestInfo::default());
        engine.finish("jobs", &mut state, RequestInfo::default());

        let entries = engine.debug_ring().snapshot(None);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].decisions[0].reason, DecisionReason::RuleForward);
    }
}
