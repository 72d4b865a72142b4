use std::borrow::Cow;

use anyhow::{bail, Context, Result};
use regex::{Regex, RegexBuilder};
use serde::Deserialize;

/// Wire shape of one rename rule as delivered in the connect reply.
#[derive(Debug, Clone, Deserialize)]
pub struct RuleSpec {
    pub match_expression: String,
    #[serde(default)]
    pub replacement: String,
    #[serde(default)]
    pub ignore: bool,
    #[serde(default)]
    pub eval_order: u32,
    #[serde(default)]
    pub each_segment: bool,
    #[serde(default)]
    pub replace_all: bool,
    #[serde(default)]
    pub terminate_chain: bool,
}

#[derive(Debug)]
struct MetricRule {
    pattern: Regex,
    replacement: String,
    ignore: bool,
    replace_all: bool,
    each_segment: bool,
    terminate: bool,
}

/// Outcome of pushing one name through the rule chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleResult {
    /// An ignore rule matched; the caller must drop the enclosing data.
    Ignored,
    /// At least one substitution occurred.
    Renamed(String),
    /// No rule changed the name.
    Unchanged,
}

/// Ordered rename/ignore rule chain.
///
/// Rules evaluate ascending by `eval_order`. An ignore rule that matches
/// ends evaluation immediately; a terminating rule ends evaluation only
/// after it actually substituted something.
#[derive(Debug, Default)]
pub struct MetricRules {
    rules: Vec<MetricRule>,
}

impl MetricRules {
    /// A chain with no rules; `apply` always returns Unchanged.
    pub fn empty() -> Self {
        Self { rules: Vec::new() }
    }

    /// Compiles rule specs into an evaluation chain.
    ///
    /// Patterns compile case-insensitive. Replacement backreferences use the
    /// agent's `\1` syntax and are normalized here; a backslash followed by
    /// more than one digit is ambiguous and rejected rather than guessed.
    pub fn compile(mut specs: Vec<RuleSpec>) -> Result<Self> {
        specs.sort_by_key(|s| s.eval_order);

        let mut rules = Vec::with_capacity(specs.len());
        for spec in specs {
            let pattern = RegexBuilder::new(&spec.match_expression)
                .case_insensitive(true)
                .build()
                .with_context(|| format!("compiling rule pattern {:?}", spec.match_expression))?;

            let replacement = normalize_replacement(&spec.replacement)
                .with_context(|| format!("normalizing replacement {:?}", spec.replacement))?;

            rules.push(MetricRule {
                pattern,
                replacement,
                ignore: spec.ignore,
                replace_all: spec.replace_all,
                each_segment: spec.each_segment,
                terminate: spec.terminate_chain,
            });
        }

        Ok(Self { rules })
    }

    /// Parses and compiles rules from their connect-reply JSON form.
    pub fn from_json(value: &serde_json::Value) -> Result<Self> {
        let specs: Vec<RuleSpec> =
            serde_json::from_value(value.clone()).context("parsing metric rules")?;
        Self::compile(specs)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Pushes one name through the chain.
    pub fn apply(&self, name: &str) -> RuleResult {
        let mut current = Cow::Borrowed(name);
        let mut changed = false;

        for rule in &self.rules {
            if rule.ignore {
                if rule.pattern.is_match(&current) {
                    return RuleResult::Ignored;
                }
                continue;
            }

            let (next, matched) = rule.rewrite(&current);
            if matched {
                current = Cow::Owned(next);
                changed = true;
                if rule.terminate {
                    break;
                }
            }
        }

        if changed {
            RuleResult::Renamed(current.into_owned())
        } else {
            RuleResult::Unchanged
        }
    }
}

impl MetricRule {
    /// Applies this rule once. The bool reports whether a substitution
    /// actually occurred.
    fn rewrite(&self, name: &str) -> (String, bool) {
        if self.each_segment {
            let mut matched = false;
            let segments: Vec<String> = name
                .split('/')
                .map(|segment| match self.pattern.replace(segment, self.replacement.as_str()) {
                    Cow::Owned(replaced) => {
                        matched = true;
                        replaced
                    }
                    Cow::Borrowed(unchanged) => unchanged.to_string(),
                })
                .collect();
            return (segments.join("/"), matched);
        }

        let replaced = if self.replace_all {
            self.pattern.replace_all(name, self.replacement.as_str())
        } else {
            self.pattern.replace(name, self.replacement.as_str())
        };

        match replaced {
            Cow::Owned(s) => (s, true),
            Cow::Borrowed(_) => (name.to_string(), false),
        }
    }
}

/// Rewrites agent `\1` backreferences into the regex crate's `${1}` syntax
/// and escapes literal `$`.
///
/// `\` followed by two or more digits is ambiguous in the agent syntax
/// (group 12 vs. group 1 then "2") and is rejected.
fn normalize_replacement(replacement: &str) -> Result<String> {
    let mut out = String::with_capacity(replacement.len());
    let mut chars = replacement.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '$' => out.push_str("$$"),
            '\\' => match chars.next() {
                Some(d) if d.is_ascii_digit() => {
                    if chars.peek().is_some_and(char::is_ascii_digit) {
                        bail!("ambiguous backreference \\{d}{}", chars.peek().expect("peeked"));
                    }
                    out.push_str("${");
                    out.push(d);
                    out.push('}');
                }
                Some(other) => {
                    out.push('\\');
                    out.push(other);
                }
                None => bail!("trailing backslash"),
            },
            _ => out.push(c),
        }
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(expr: &str, replacement: &str) -> RuleSpec {
        RuleSpec {
            match_expression: expr.to_string(),
            replacement: replacement.to_string(),
            ignore: false,
            eval_order: 0,
            each_segment: false,
            replace_all: false,
            terminate_chain: false,
        }
    }

    #[test]
    fn test_first_match_replacement() {
        let rules = MetricRules::compile(vec![spec("[0-9]+", "*")]).expect("compiles");
        assert_eq!(
            rules.apply("users/123/posts/456"),
            RuleResult::Renamed("users/*/posts/456".to_string()),
        );
    }

    #[test]
    fn test_replace_all() {
        let mut s = spec("[0-9]+", "*");
        s.replace_all = true;
        let rules = MetricRules::compile(vec![s]).expect("compiles");
        assert_eq!(
            rules.apply("users/123/posts/456"),
            RuleResult::Renamed("users/*/posts/*".to_string()),
        );
    }

    #[test]
    fn test_each_segment() {
        let mut s = spec("a", "x");
        s.each_segment = true;
        let rules = MetricRules::compile(vec![s]).expect("compiles");
        assert_eq!(
            rules.apply("a/b/a"),
            RuleResult::Renamed("x/b/x".to_string()),
        );
    }

    #[test]
    fn test_each_segment_first_match_per_segment() {
        let mut s = spec("a", "x");
        s.each_segment = true;
        let rules = MetricRules::compile(vec![s]).expect("compiles");
        // Only the first "a" within each segment is replaced.
        assert_eq!(
            rules.apply("aa/baa"),
            RuleResult::Renamed("xa/bxa".to_string()),
        );
    }

    #[test]
    fn test_ignore_rule_short_circuits() {
        let mut ignore = spec("^private/", "");
        ignore.ignore = true;
        ignore.eval_order = 0;
        let mut rename = spec("private", "public");
        rename.eval_order = 1;

        let rules = MetricRules::compile(vec![ignore, rename]).expect("compiles");
        assert_eq!(rules.apply("private/data"), RuleResult::Ignored);
        // Non-matching names fall through to later rules.
        assert_eq!(
            rules.apply("semi-private/data"),
            RuleResult::Renamed("semi-public/data".to_string()),
        );
    }

    #[test]
    fn test_eval_order_ascending() {
        let mut second = spec("b", "c");
        second.eval_order = 2;
        let mut first = spec("a", "b");
        first.eval_order = 1;

        let rules = MetricRules::compile(vec![second, first]).expect("compiles");
        // "a" -> "b" (order 1), then "b" -> "c" (order 2).
        assert_eq!(rules.apply("a"), RuleResult::Renamed("c".to_string()));
    }

    #[test]
    fn test_terminate_stops_after_match_only() {
        let mut first = spec("nomatch", "x");
        first.terminate_chain = true;
        first.eval_order = 0;
        let mut second = spec("a", "b");
        second.eval_order = 1;

        let rules = MetricRules::compile(vec![first, second]).expect("compiles");
        // First rule terminates the chain only on a match; it missed, so
        // the second rule still runs.
        assert_eq!(rules.apply("a"), RuleResult::Renamed("b".to_string()));

        let mut matching = spec("a", "b");
        matching.terminate_chain = true;
        matching.eval_order = 0;
        let mut later = spec("b", "c");
        later.eval_order = 1;

        let rules = MetricRules::compile(vec![matching, later]).expect("compiles");
        assert_eq!(rules.apply("a"), RuleResult::Renamed("b".to_string()));
    }

    #[test]
    fn test_case_insensitive_matching() {
        let rules = MetricRules::compile(vec![spec("WEB", "api")]).expect("compiles");
        assert_eq!(
            rules.apply("web/index"),
            RuleResult::Renamed("api/index".to_string()),
        );
    }

    #[test]
    fn test_backreference_normalization() {
        let rules =
            MetricRules::compile(vec![spec("^foo/(.*)$", r"bar/\1")]).expect("compiles");
        assert_eq!(
            rules.apply("foo/baz"),
            RuleResult::Renamed("bar/baz".to_string()),
        );
    }

    #[test]
    fn test_ambiguous_backreference_rejected() {
        let err = MetricRules::compile(vec![spec("(a)(b)", r"\12")]).expect_err("should fail");
        assert!(err.to_string().contains("normalizing replacement"));
    }

    #[test]
    fn test_trailing_backslash_rejected() {
        assert!(MetricRules::compile(vec![spec("a", "b\\")]).is_err());
    }

    #[test]
    fn test_literal_dollar_preserved() {
        let rules = MetricRules::compile(vec![spec("price", "$cost")]).expect("compiles");
        assert_eq!(
            rules.apply("price/list"),
            RuleResult::Renamed("$cost/list".to_string()),
        );
    }

    #[test]
    fn test_unmatched_name_unchanged() {
        let rules = MetricRules::compile(vec![spec("zzz", "x")]).expect("compiles");
        assert_eq!(rules.apply("users/list"), RuleResult::Unchanged);
    }

    #[test]
    fn test_from_json_wire_shape() {
        let value = serde_json::json!([
            {
                "match_expression": "[0-9]+",
                "replacement": "*",
                "ignore": false,
                "eval_order": 0,
                "each_segment": false,
                "replace_all": true,
                "terminate_chain": true
            }
        ]);

        let rules = MetricRules::from_json(&value).expect("parses and compiles");
        assert_eq!(rules.len(), 1);
        assert_eq!(
            rules.apply("a1b2"),
            RuleResult::Renamed("a*b*".to_string()),
        );
    }

    #[test]
    fn test_invalid_pattern_rejected() {
        assert!(MetricRules::compile(vec![spec("(unclosed", "x")]).is_err());
    }
}
