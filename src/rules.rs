//! Allow-rule engine (spec component C1).
//!
//! Parses `--allow` spec strings into [`Rule`]s and evaluates
//! `(method, url)` pairs against a [`RuleSet`]. Host and path wildcards
//! are tagged variants (`Literal` / `AnyOne`), never regexes, so matching
//! is a single right-aligned or left-aligned linear scan, no backtracking.

use std::collections::HashSet;
use std::fmt;

use crate::error::{BoundaryError, Result};

/// One label pattern within a [`HostPattern`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostLabel {
    Literal(String),
    AnyOne,
}

/// One segment pattern within a [`PathPattern`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathSegment {
    Literal(String),
    AnyOne,
}

/// The method half of a rule: either every method (`*`) or an explicit set
/// of RFC 7230 tokens, compared case-sensitively.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MethodSet {
    Any,
    Tokens(HashSet<String>),
}

impl MethodSet {
    fn matches(&self, method: &str) -> bool {
        match self {
            MethodSet::Any => true,
            MethodSet::Tokens(set) => set.contains(method),
        }
    }
}

/// Ordered label sequence, compared right-aligned (TLD-first) against an
/// actual hostname so that subdomains match automatically.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostPattern(pub Vec<HostLabel>);

impl HostPattern {
    fn matches(&self, host: &str) -> bool {
        let labels: Vec<&str> = host.split('.').collect();
        if self.0.len() > labels.len() {
            return false;
        }
        let offset = labels.len() - self.0.len();
        self.0.iter().enumerate().all(|(i, pattern)| match pattern {
            HostLabel::AnyOne => true,
            HostLabel::Literal(expected) => {
                expected.eq_ignore_ascii_case(labels[offset + i])
            }
        })
    }
}

/// Ordered segment sequence, compared prefix-wise so sub-paths match
/// automatically.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathPattern(pub Vec<PathSegment>);

impl PathPattern {
    fn matches(&self, path: &str) -> bool {
        let segments: Vec<&str> = path
            .split('/')
            .skip(if path.starts_with('/') { 1 } else { 0 })
            .collect();
        if self.0.len() > segments.len() {
            return false;
        }
        self.0.iter().enumerate().all(|(i, pattern)| match pattern {
            PathSegment::AnyOne => true,
            PathSegment::Literal(expected) => expected == segments[i],
        })
    }
}

/// A single allow rule: a conjunction of optional patterns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    pub methods: Option<MethodSet>,
    pub host: Option<HostPattern>,
    pub path: Option<PathPattern>,
    pub raw: String,
}

impl Rule {
    /// A rule with no keys set matches every well-formed request.
    fn matches(&self, method: &str, url: &url::Url) -> bool {
        if let Some(methods) = &self.methods {
            if !methods.matches(method) {
                return false;
            }
        }
        if let Some(host_pattern) = &self.host {
            let Some(host) = url.host_str() else {
                return false;
            };
            if !host_pattern.matches(host) {
                return false;
            }
        }
        if let Some(path_pattern) = &self.path {
            if !path_pattern.matches(url.path()) {
                return false;
            }
        }
        true
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.raw)
    }
}

/// Ordered list of rules; first match wins. An empty set denies everything.
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    rules: Vec<Rule>,
}

/// Outcome of evaluating one request against a [`RuleSet`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub allowed: bool,
    pub rule: Option<String>,
}

impl RuleSet {
    pub fn new(rules: Vec<Rule>) -> Self {
        Self { rules }
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Parse one `--allow` value per rule and fold the resulting rules
    /// (a spec with a comma-separated `path=` list expands into N rules)
    /// into a single ordered set, preserving flag order.
    pub fn from_specs<I, S>(specs: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut rules = Vec::new();
        for spec in specs {
            rules.extend(parse_spec(spec.as_ref())?);
        }
        Ok(Self::new(rules))
    }

    /// `evaluate(method, url) -> {allowed, rule}`. Malformed URLs or rules
    /// whose URL fails to parse are skipped, per spec 4.1 step 1: "Parse
    /// failure -> skip rule" collapses to "no match" for the whole engine
    /// when the request URL itself cannot be parsed.
    pub fn evaluate(&self, method: &str, raw_url: &str) -> Decision {
        let Ok(url) = url::Url::parse(raw_url) else {
            return Decision {
                allowed: false,
                rule: None,
            };
        };
        for rule in &self.rules {
            if rule.matches(method, &url) {
                return Decision {
                    allowed: true,
                    rule: Some(rule.raw.clone()),
                };
            }
        }
        Decision {
            allowed: false,
            rule: None,
        }
    }
}

/// Parse one `--allow SPEC` value into one or more [`Rule`]s (more than
/// one only when `path=` carries a comma-separated alternative list).
pub fn parse_spec(spec: &str) -> Result<Vec<Rule>> {
    let trimmed = spec.trim();
    if trimmed.is_empty() {
        return Err(invalid(spec, "empty spec"));
    }

    let mut methods: Option<MethodSet> = None;
    let mut host: Option<HostPattern> = None;
    let mut path_alternatives: Option<Vec<String>> = None;

    for token in trimmed.split_whitespace() {
        let Some((key, value)) = token.split_once('=') else {
            return Err(invalid(spec, format!("missing '=' in token {token:?}")));
        };
        if value.is_empty() {
            return Err(invalid(spec, format!("empty value for key {key:?}")));
        }
        match key {
            "method" => {
                if methods.is_some() {
                    return Err(invalid(spec, "duplicate 'method' key"));
                }
                methods = Some(parse_method_value(spec, value)?);
            }
            "domain" => {
                if host.is_some() {
                    return Err(invalid(spec, "duplicate 'domain' key"));
                }
                host = Some(parse_domain_value(spec, value)?);
            }
            "path" => {
                if path_alternatives.is_some() {
                    return Err(invalid(spec, "duplicate 'path' key"));
                }
                path_alternatives = Some(value.split(',').map(str::to_string).collect());
            }
            other => return Err(invalid(spec, format!("unknown key {other:?}"))),
        }
    }

    let path_alternatives = path_alternatives.unwrap_or_default();
    if path_alternatives.is_empty() {
        return Ok(vec![Rule {
            methods,
            host,
            path: None,
            raw: spec.to_string(),
        }]);
    }

    path_alternatives
        .into_iter()
        .map(|alt| {
            Ok(Rule {
                methods: methods.clone(),
                host: host.clone(),
                path: Some(parse_path_value(spec, &alt)?),
                raw: spec.to_string(),
            })
        })
        .collect()
}

fn parse_method_value(spec: &str, value: &str) -> Result<MethodSet> {
    if value == "*" {
        return Ok(MethodSet::Any);
    }
    let mut tokens = HashSet::new();
    for tok in value.split(',') {
        if tok.is_empty() || !tok.chars().all(is_tchar) {
            return Err(invalid(spec, format!("invalid method token {tok:?}")));
        }
        tokens.insert(tok.to_string());
    }
    Ok(MethodSet::Tokens(tokens))
}

fn is_tchar(c: char) -> bool {
    c.is_ascii_alphanumeric()
        || "!#$%&'*+-.^_`|~".contains(c)
}

fn parse_domain_value(spec: &str, value: &str) -> Result<HostPattern> {
    if value.ends_with('.') {
        return Err(invalid(spec, "trailing dot in domain"));
    }
    let mut labels = Vec::new();
    for label in value.split('.') {
        if label == "*" {
            labels.push(HostLabel::AnyOne);
            continue;
        }
        if !is_valid_dns_label(label) {
            return Err(invalid(spec, format!("invalid domain label {label:?}")));
        }
        labels.push(HostLabel::Literal(label.to_ascii_lowercase()));
    }
    Ok(HostPattern(labels))
}

fn is_valid_dns_label(label: &str) -> bool {
    let bytes = label.as_bytes();
    if bytes.is_empty() {
        return false;
    }
    let alnum = |b: u8| b.is_ascii_alphanumeric();
    if !alnum(bytes[0]) || !alnum(*bytes.last().unwrap()) {
        return false;
    }
    bytes.iter().all(|&b| alnum(b) || b == b'-')
}

fn parse_path_value(spec: &str, value: &str) -> Result<PathPattern> {
    let trimmed = value.strip_prefix('/').unwrap_or(value);
    if trimmed.is_empty() {
        return Ok(PathPattern(Vec::new()));
    }
    let mut segments = Vec::new();
    for segment in trimmed.split('/') {
        if segment == "*" {
            segments.push(PathSegment::AnyOne);
            continue;
        }
        if segment.starts_with('*') {
            return Err(invalid(
                spec,
                format!("wildcard must span the whole segment: {segment:?}"),
            ));
        }
        if !is_valid_pchar_segment(segment) {
            return Err(invalid(spec, format!("invalid path segment {segment:?}")));
        }
        segments.push(PathSegment::Literal(segment.to_string()));
    }
    Ok(PathPattern(segments))
}

fn is_valid_pchar_segment(segment: &str) -> bool {
    let bytes = segment.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        if b == b'%' {
            if i + 2 >= bytes.len()
                || !bytes[i + 1].is_ascii_hexdigit()
                || !bytes[i + 2].is_ascii_hexdigit()
            {
                return false;
            }
            i += 3;
            continue;
        }
        let is_pchar = b.is_ascii_alphanumeric()
            || b"-._~!$&'()*+,;=:@".contains(&b);
        if !is_pchar {
            return false;
        }
        i += 1;
    }
    true
}

fn invalid(spec: &str, reason: impl Into<String>) -> BoundaryError {
    BoundaryError::InvalidSpec {
        spec: spec.to_string(),
        reason: reason.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eval(rules: &RuleSet, method: &str, url: &str) -> Decision {
        rules.evaluate(method, url)
    }

    #[test]
    fn empty_ruleset_denies_everything() {
        let rules = RuleSet::new(vec![]);
        assert!(!eval(&rules, "GET", "https://example.com/").allowed);
    }

    #[test]
    fn no_keys_matches_everything() {
        let rules = RuleSet::from_specs(["domain=x.com"]).unwrap();
        // sanity: a rule with zero keys (possible only via empty spec string,
        // which we reject) never arises from parse_spec; test the matcher
        // directly instead via an explicit empty-key rule.
        let wildcard = Rule {
            methods: None,
            host: None,
            path: None,
            raw: String::new(),
        };
        let url = url::Url::parse("https://anything.example/any/path").unwrap();
        assert!(wildcard.matches("DELETE", &url));
        let _ = rules;
    }

    #[test]
    fn domain_subdomain_auto_match() {
        let rules = RuleSet::from_specs(["domain=github.com"]).unwrap();
        assert!(eval(&rules, "GET", "https://api.github.com/repos").allowed);
        assert!(eval(&rules, "GET", "https://github.com/").allowed);
        assert!(!eval(&rules, "GET", "https://example.com/github.com/x").allowed);
    }

    #[test]
    fn host_wildcard_label() {
        let rules = RuleSet::from_specs(["domain=*.com"]).unwrap();
        assert!(eval(&rules, "GET", "https://anything.com/").allowed);
        assert!(!eval(&rules, "GET", "https://anything.org/").allowed);
    }

    #[test]
    fn method_restricts_request() {
        let rules = RuleSet::from_specs(["method=GET,HEAD domain=api.github.com"]).unwrap();
        assert!(eval(&rules, "GET", "https://api.github.com/x").allowed);
        assert!(eval(&rules, "HEAD", "https://api.github.com/x").allowed);
        assert!(!eval(&rules, "POST", "https://api.github.com/x").allowed);
    }

    #[test]
    fn method_wildcard_short_circuits() {
        let rules = RuleSet::from_specs(["method=* domain=example.com"]).unwrap();
        assert!(eval(&rules, "PATCH", "https://example.com/").allowed);
    }

    #[test]
    fn path_prefix_matching() {
        let rules = RuleSet::from_specs(["domain=example.com path=/api"]).unwrap();
        assert!(eval(&rules, "GET", "https://example.com/api").allowed);
        assert!(eval(&rules, "GET", "https://example.com/api/v1/things").allowed);
        assert!(!eval(&rules, "GET", "https://example.com/other").allowed);
    }

    #[test]
    fn multiple_paths_expand_to_separate_rules() {
        let rules =
            RuleSet::from_specs(["method=POST domain=api.example.com path=/users,/posts"])
                .unwrap();
        assert_eq!(rules.len(), 2);
        assert!(eval(&rules, "POST", "https://api.example.com/users/1").allowed);
        assert!(eval(&rules, "POST", "https://api.example.com/posts/1").allowed);
        assert!(!eval(&rules, "POST", "https://api.example.com/comments").allowed);
    }

    #[test]
    fn first_match_wins() {
        let rules =
            RuleSet::from_specs(["domain=example.com path=/admin", "domain=example.com"])
                .unwrap();
        let decision = eval(&rules, "GET", "https://example.com/admin/panel");
        assert!(decision.allowed);
        assert_eq!(decision.rule.as_deref(), Some("domain=example.com path=/admin"));
    }

    #[test]
    fn no_match_denies() {
        let rules = RuleSet::from_specs(["domain=jsonplaceholder.typicode.com"]).unwrap();
        assert!(!eval(&rules, "GET", "https://example.com/").allowed);
    }

    #[test]
    fn round_trip_raw_reparses_equivalently() {
        let original = "method=GET,HEAD domain=api.github.com path=/repos";
        let rules_a = RuleSet::from_specs([original]).unwrap();
        let raw = rules_a.rules[0].raw.clone();
        let rules_b = RuleSet::from_specs([raw.as_str()]).unwrap();
        let probes = [
            ("GET", "https://api.github.com/repos/foo"),
            ("POST", "https://api.github.com/repos/foo"),
            ("GET", "https://api.github.com/other"),
        ];
        for (method, url) in probes {
            assert_eq!(
                eval(&rules_a, method, url).allowed,
                eval(&rules_b, method, url).allowed
            );
        }
    }

    #[test]
    fn rejects_unknown_key() {
        assert!(parse_spec("color=blue").is_err());
    }

    #[test]
    fn rejects_wildcard_inside_segment() {
        assert!(parse_spec("path=/foo*bar").is_err());
    }

    #[test]
    fn rejects_trailing_dot_domain() {
        assert!(parse_spec("domain=example.com.").is_err());
    }

    #[test]
    fn rejects_missing_value() {
        assert!(parse_spec("domain=").is_err());
        assert!(parse_spec("domain").is_err());
    }
}
