//! Content-filter middleware: blacklist, HTML sanitizer, PII
//! redactor, and size manager, composed into the filter chain in that
//! order when content filtering is enabled.
//!
//! All four filters read their settings from a shared copy-on-write
//! snapshot. A reload validates the incoming document fully (regexes
//! compiled, thresholds checked) before the snapshot pointer is
//! swapped; in-flight filter calls finish under the snapshot they
//! already cloned.

use crate::error::{BridgeError, Result};
use crate::filter::{
    BridgeFilter, Direction, DirectionMask, FilterChain, FilterResult, rewrite_strings,
};
use crate::metrics::Metrics;
use crate::rpc;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::{Arc, RwLock};

pub const EMAIL_MARKER: &str = "[EMAIL_REDACTED]";
pub const PHONE_MARKER: &str = "[PHONE_REDACTED]";
pub const SSN_MARKER: &str = "[SSN_REDACTED]";
pub const CARD_MARKER: &str = "[CARD_REDACTED]";

fn default_true() -> bool {
    true
}

fn default_max_response_length() -> usize {
    15_000
}

fn default_summarize_threshold() -> usize {
    5_000
}

fn default_hard_truncate() -> usize {
    25_000
}

fn default_base64_skip_threshold() -> usize {
    256
}

/// On-disk filter configuration document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ContentFilterConfig {
    pub blocked_domains: Vec<String>,
    pub blocked_keywords: Vec<String>,
    pub blocked_patterns: Vec<String>,
    pub redact_emails: bool,
    pub redact_phones: bool,
    pub redact_ssns: bool,
    pub redact_credit_cards: bool,
    pub remove_scripts: bool,
    pub remove_trackers: bool,
    pub max_response_length: usize,
    pub summarize_threshold: usize,
    pub hard_truncate: usize,
    pub base64_skip_threshold: usize,
    /// Extra patterns fed to the core `redact_secrets` filter.
    pub secret_patterns: Vec<String>,
}

impl Default for ContentFilterConfig {
    fn default() -> Self {
        Self {
            blocked_domains: Vec::new(),
            blocked_keywords: Vec::new(),
            blocked_patterns: Vec::new(),
            redact_emails: default_true(),
            redact_phones: default_true(),
            redact_ssns: default_true(),
            redact_credit_cards: default_true(),
            remove_scripts: default_true(),
            remove_trackers: default_true(),
            max_response_length: default_max_response_length(),
            summarize_threshold: default_summarize_threshold(),
            hard_truncate: default_hard_truncate(),
            base64_skip_threshold: default_base64_skip_threshold(),
            secret_patterns: Vec::new(),
        }
    }
}

/// A validated config with its regexes compiled.
#[derive(Debug)]
pub struct CompiledConfig {
    pub config: ContentFilterConfig,
    blocked_patterns: Vec<Regex>,
    base64_run: Regex,
}

impl CompiledConfig {
    pub fn compile(config: ContentFilterConfig) -> Result<Self> {
        if config.summarize_threshold == 0 || config.hard_truncate == 0 {
            return Err(BridgeError::InvalidConfig(
                "summarize_threshold and hard_truncate must be non-zero".to_string(),
            ));
        }
        if config.summarize_threshold > config.hard_truncate {
            return Err(BridgeError::InvalidConfig(
                "summarize_threshold must not exceed hard_truncate".to_string(),
            ));
        }
        let blocked_patterns = config
            .blocked_patterns
            .iter()
            .map(|src| {
                Regex::new(src).map_err(|e| {
                    BridgeError::InvalidConfig(format!("invalid blocked pattern {src:?}: {e}"))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let base64_run = Regex::new(&format!(
            r"[A-Za-z0-9+/]{{{},}}={{0,2}}",
            config.base64_skip_threshold.max(1)
        ))
        .map_err(|e| BridgeError::InvalidConfig(format!("invalid base64 threshold: {e}")))?;
        Ok(Self {
            config,
            blocked_patterns,
            base64_run,
        })
    }
}

/// Copy-on-write handle shared by the four filters and the control
/// endpoint. Readers clone the inner `Arc`; reload swaps the pointer
/// only after full validation.
#[derive(Clone)]
pub struct ContentFilterState {
    inner: Arc<RwLock<Arc<CompiledConfig>>>,
}

impl ContentFilterState {
    pub fn new(config: ContentFilterConfig) -> Result<Self> {
        let compiled = CompiledConfig::compile(config)?;
        Ok(Self {
            inner: Arc::new(RwLock::new(Arc::new(compiled))),
        })
    }

    pub fn snapshot(&self) -> Arc<CompiledConfig> {
        self.inner.read().unwrap().clone()
    }

    /// Replace the config atomically. On any validation error the
    /// previous config stays in force.
    pub fn reload(&self, document: Value) -> Result<()> {
        let parsed: ContentFilterConfig = serde_json::from_value(document)
            .map_err(|e| BridgeError::InvalidConfig(e.to_string()))?;
        let compiled = CompiledConfig::compile(parsed)?;
        *self.inner.write().unwrap() = Arc::new(compiled);
        Ok(())
    }
}

/// Scan every string leaf; the first hit wins.
fn scan_strings<'a>(value: &'a Value, f: &mut dyn FnMut(&'a str) -> Option<String>) -> Option<String> {
    match value {
        Value::String(s) => f(s),
        Value::Array(items) => items.iter().find_map(|v| scan_strings(v, f)),
        Value::Object(map) => map.values().find_map(|v| scan_strings(v, f)),
        _ => None,
    }
}

/// Blocks messages whose content matches configured domains, keywords,
/// or regex patterns.
pub struct BlacklistFilter {
    state: ContentFilterState,
    metrics: Arc<Metrics>,
}

impl BlacklistFilter {
    pub fn new(state: ContentFilterState, metrics: Arc<Metrics>) -> Self {
        Self { state, metrics }
    }
}

impl BridgeFilter for BlacklistFilter {
    fn name(&self) -> &str {
        "blacklist"
    }

    fn apply(&self, _direction: Direction, _session_id: &str, message: &Value) -> FilterResult {
        let snapshot = self.state.snapshot();
        let config = &snapshot.config;

        let reason = scan_strings(message, &mut |s| {
            for domain in &config.blocked_domains {
                if s.contains(domain.as_str()) {
                    return Some(format!("domain:{domain}"));
                }
            }
            for keyword in &config.blocked_keywords {
                if s.contains(keyword.as_str()) {
                    return Some(format!("keyword:{keyword}"));
                }
            }
            for (re, src) in snapshot
                .blocked_patterns
                .iter()
                .zip(config.blocked_patterns.iter())
            {
                if re.is_match(s) {
                    return Some(format!("pattern:{src}"));
                }
            }
            None
        });

        match reason {
            Some(reason) => {
                let rule = reason.split(':').next().unwrap_or("rule");
                self.metrics.incr_filter(&format!("blacklist.blocks.{rule}"));
                FilterResult::Block(rpc::error_object(
                    rpc::BLOCKED_BY_POLICY,
                    "blocked by policy",
                    Some(serde_json::json!({ "reason": reason })),
                ))
            }
            None => FilterResult::Pass,
        }
    }
}

/// Strips active content out of string fields that look like HTML.
pub struct HtmlSanitizerFilter {
    state: ContentFilterState,
    metrics: Arc<Metrics>,
    script_re: Regex,
    iframe_re: Regex,
    orphan_tag_re: Regex,
    event_attr_re: Regex,
    js_url_re: Regex,
    tracker_re: Regex,
    blank_runs_re: Regex,
}

impl HtmlSanitizerFilter {
    pub fn new(state: ContentFilterState, metrics: Arc<Metrics>) -> Self {
        Self {
            state,
            metrics,
            script_re: Regex::new(r"(?is)<script\b[^>]*>.*?</script\s*>").unwrap(),
            iframe_re: Regex::new(r"(?is)<iframe\b[^>]*>.*?</iframe\s*>").unwrap(),
            orphan_tag_re: Regex::new(r"(?i)</?(?:script|iframe)\b[^>]*>").unwrap(),
            event_attr_re: Regex::new(r#"(?i)\son\w+\s*=\s*(?:"[^"]*"|'[^']*'|[^\s>]+)"#).unwrap(),
            js_url_re: Regex::new(r#"(?i)(href|src)\s*=\s*(["']?)\s*javascript:[^"'>\s]*"#)
                .unwrap(),
            tracker_re: Regex::new(
                r#"(?is)<img\b[^>]*(?:width\s*=\s*["']?1["']?[^>]*height\s*=\s*["']?1["']?|tracking|pixel)[^>]*/?>"#,
            )
            .unwrap(),
            blank_runs_re: Regex::new(r"\n{3,}").unwrap(),
        }
    }

    fn looks_like_html(s: &str) -> bool {
        s.contains('<') && s.contains('>')
    }

    fn sanitize(&self, s: &str, config: &ContentFilterConfig) -> Option<String> {
        if !Self::looks_like_html(s) {
            return None;
        }
        let mut out = s.to_string();
        if config.remove_scripts {
            out = self.script_re.replace_all(&out, "").into_owned();
            out = self.iframe_re.replace_all(&out, "").into_owned();
            out = self.orphan_tag_re.replace_all(&out, "").into_owned();
            out = self.event_attr_re.replace_all(&out, "").into_owned();
            out = self.js_url_re.replace_all(&out, "$1=$2").into_owned();
        }
        if config.remove_trackers {
            out = self.tracker_re.replace_all(&out, "").into_owned();
        }
        out = self.blank_runs_re.replace_all(&out, "\n\n").into_owned();
        if out != s { Some(out) } else { None }
    }
}

impl BridgeFilter for HtmlSanitizerFilter {
    fn name(&self) -> &str {
        "html_sanitizer"
    }

    fn apply(&self, _direction: Direction, _session_id: &str, message: &Value) -> FilterResult {
        let snapshot = self.state.snapshot();
        let config = &snapshot.config;
        if !config.remove_scripts && !config.remove_trackers {
            return FilterResult::Pass;
        }

        let mut candidate = message.clone();
        let changed = rewrite_strings(&mut candidate, &mut |s| self.sanitize(s, config));
        if changed {
            self.metrics.incr_filter("html_sanitizer.sanitized");
            FilterResult::Transform(candidate)
        } else {
            FilterResult::Pass
        }
    }
}

/// Replaces PII-shaped substrings with fixed markers. Long base64
/// runs are skipped wholesale; digit groups inside them are payload,
/// not phone numbers.
pub struct PiiRedactorFilter {
    state: ContentFilterState,
    metrics: Arc<Metrics>,
    email_re: Regex,
    phone_res: Vec<Regex>,
    ssn_re: Regex,
    card_re: Regex,
}

impl PiiRedactorFilter {
    pub fn new(state: ContentFilterState, metrics: Arc<Metrics>) -> Self {
        Self {
            state,
            metrics,
            email_re: Regex::new(r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}").unwrap(),
            phone_res: vec![
                Regex::new(r"\+\d{1,3}[-. ]?\d{2,4}[-. ]?\d{3,4}[-. ]?\d{3,4}").unwrap(),
                Regex::new(r"\b\(?\d{3}\)?[-. ]\d{3}[-. ]\d{4}\b").unwrap(),
            ],
            ssn_re: Regex::new(r"\b\d{3}-\d{2}-\d{4}\b").unwrap(),
            card_re: Regex::new(r"\b(?:\d{4}[ -]?){3}\d{1,4}\b").unwrap(),
        }
    }

    fn redact(
        &self,
        s: &str,
        snapshot: &CompiledConfig,
    ) -> Option<(String, Vec<&'static str>)> {
        let config = &snapshot.config;
        if snapshot.base64_run.is_match(s) {
            return None;
        }
        let mut out = s.to_string();
        let mut kinds = Vec::new();

        if config.redact_emails && self.email_re.is_match(&out) {
            out = self.email_re.replace_all(&out, EMAIL_MARKER).into_owned();
            kinds.push("email");
        }
        if config.redact_ssns && self.ssn_re.is_match(&out) {
            out = self.ssn_re.replace_all(&out, SSN_MARKER).into_owned();
            kinds.push("ssn");
        }
        if config.redact_credit_cards && self.card_re.is_match(&out) {
            out = self.card_re.replace_all(&out, CARD_MARKER).into_owned();
            kinds.push("credit_card");
        }
        if config.redact_phones {
            for re in &self.phone_res {
                if re.is_match(&out) {
                    out = re.replace_all(&out, PHONE_MARKER).into_owned();
                    if !kinds.contains(&"phone") {
                        kinds.push("phone");
                    }
                }
            }
        }

        if kinds.is_empty() { None } else { Some((out, kinds)) }
    }
}

impl BridgeFilter for PiiRedactorFilter {
    fn name(&self) -> &str {
        "pii_redactor"
    }

    fn apply(&self, _direction: Direction, _session_id: &str, message: &Value) -> FilterResult {
        let snapshot = self.state.snapshot();

        let mut redacted_kinds: Vec<&'static str> = Vec::new();
        let mut candidate = message.clone();
        let changed = rewrite_strings(&mut candidate, &mut |s| {
            self.redact(s, &snapshot).map(|(out, kinds)| {
                redacted_kinds.extend(kinds);
                out
            })
        });

        if changed {
            for kind in redacted_kinds {
                self.metrics
                    .incr_filter(&format!("pii_redactor.redactions.{kind}"));
            }
            FilterResult::Transform(candidate)
        } else {
            FilterResult::Pass
        }
    }
}

/// Keeps oversized response fields from flooding clients: fields past
/// the summarize threshold are cut to their leading sentences, fields
/// past the hard cap are replaced outright.
pub struct SizeManagerFilter {
    state: ContentFilterState,
    metrics: Arc<Metrics>,
}

impl SizeManagerFilter {
    pub fn new(state: ContentFilterState, metrics: Arc<Metrics>) -> Self {
        Self { state, metrics }
    }

    fn manage(&self, s: &str, config: &ContentFilterConfig) -> Option<String> {
        let len = s.chars().count();
        if len > config.hard_truncate {
            self.metrics.incr_filter("size_manager.truncated");
            return Some(format!("[TRUNCATED] original length {len}"));
        }
        if len > config.summarize_threshold {
            self.metrics.incr_filter("size_manager.summarized");
            return Some(format!(
                "{} … [truncated, original length {len}]",
                leading_sentences(s, 3, config.max_response_length)
            ));
        }
        None
    }
}

/// First `max_sentences` sentences of `text`, never exceeding
/// `max_chars` characters.
fn leading_sentences(text: &str, max_sentences: usize, max_chars: usize) -> String {
    let mut out = String::new();
    let mut sentences = 0;
    for (i, c) in text.char_indices() {
        out.push(c);
        if matches!(c, '.' | '!' | '?')
            && text[i + c.len_utf8()..]
                .chars()
                .next()
                .is_none_or(|next| next.is_whitespace())
        {
            sentences += 1;
            if sentences >= max_sentences {
                break;
            }
        }
        if out.chars().count() >= max_chars {
            break;
        }
    }
    out.trim_end().to_string()
}

impl BridgeFilter for SizeManagerFilter {
    fn name(&self) -> &str {
        "size_manager"
    }

    fn apply(&self, _direction: Direction, _session_id: &str, message: &Value) -> FilterResult {
        let snapshot = self.state.snapshot();
        let config = &snapshot.config;

        // Only responses carry payloads worth trimming.
        if message.get("result").is_none() {
            return FilterResult::Pass;
        }

        let mut candidate = message.clone();
        let result = &mut candidate["result"];
        let changed = rewrite_strings(result, &mut |s| self.manage(s, config));
        if changed {
            FilterResult::Transform(candidate)
        } else {
            FilterResult::Pass
        }
    }
}

/// Compose the four content filters into a chain, in policy order:
/// blacklist, HTML sanitizer, PII redactor, size manager.
pub fn register_content_filters(
    chain: &mut FilterChain,
    state: &ContentFilterState,
    metrics: &Arc<Metrics>,
) {
    chain.register(
        Arc::new(BlacklistFilter::new(state.clone(), metrics.clone())),
        true,
        DirectionMask::Both,
    );
    chain.register(
        Arc::new(HtmlSanitizerFilter::new(state.clone(), metrics.clone())),
        true,
        DirectionMask::Both,
    );
    chain.register(
        Arc::new(PiiRedactorFilter::new(state.clone(), metrics.clone())),
        true,
        DirectionMask::Both,
    );
    chain.register(
        Arc::new(SizeManagerFilter::new(state.clone(), metrics.clone())),
        true,
        DirectionMask::Inbound,
    );
}
