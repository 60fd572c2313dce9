//! Hostname rules and routing decisions.
//!
//! Rules map comma-separated wildcard patterns to an action. Enabled rules
//! are evaluated in ascending priority order (ties keep insertion order);
//! the first rule with any matching pattern wins, otherwise the default
//! action applies.
//!
//! The compiled rule set is published as an immutable snapshot through
//! `ArcSwap`, so config reloads never expose a half-built rule list to
//! connections that are matching concurrently.

use std::fmt;
use std::sync::Arc;

use arc_swap::ArcSwap;
use globset::{GlobBuilder, GlobMatcher};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::PatternError;

/// What to do with a connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    /// Send through the listener's upstream proxy.
    #[default]
    Proxy,
    /// Connect to the destination directly.
    Direct,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Proxy => "proxy",
            Action::Direct => "direct",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A user-authored routing rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    pub id: String,
    pub name: String,
    /// One or more wildcard patterns separated by commas.
    pub pattern: String,
    pub action: Action,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Lower values are evaluated first.
    #[serde(default)]
    pub priority: i32,
}

fn default_enabled() -> bool {
    true
}

/// Result of matching a hostname.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteMatch {
    pub action: Action,
    pub matched_rule: Option<Rule>,
}

/// Outcome of [`RuleRouter::validate_pattern`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PatternValidation {
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Split a pattern list on commas, trimming and dropping empty entries.
pub fn split_patterns(pattern: &str) -> impl Iterator<Item = &str> {
    pattern.split(',').map(str::trim).filter(|p| !p.is_empty())
}

/// Compile one wildcard pattern: `*` spans any characters (dots and slashes
/// included) and matching ignores case.
pub fn compile_pattern(pattern: &str) -> Result<GlobMatcher, PatternError> {
    GlobBuilder::new(pattern)
        .case_insensitive(true)
        .literal_separator(false)
        .backslash_escape(true)
        .build()
        .map(|glob| glob.compile_matcher())
        .map_err(|e| PatternError::Invalid {
            pattern: pattern.to_string(),
            reason: e.kind().to_string(),
        })
}

struct CompiledRule {
    rule: Rule,
    matchers: Vec<GlobMatcher>,
}

impl CompiledRule {
    fn compile(rule: Rule) -> Self {
        let matchers = split_patterns(&rule.pattern)
            .filter_map(|p| match compile_pattern(p) {
                Ok(m) => Some(m),
                Err(e) => {
                    warn!(rule = %rule.name, error = %e, "Skipping uncompilable pattern");
                    None
                }
            })
            .collect();
        Self { rule, matchers }
    }

    fn is_match(&self, hostname: &str) -> bool {
        self.matchers.iter().any(|m| m.is_match(hostname))
    }
}

/// Immutable rule set shared with readers.
struct RuleSnapshot {
    rules: Arc<Vec<CompiledRule>>,
    default_action: Action,
}

/// Priority-ordered wildcard router.
pub struct RuleRouter {
    snapshot: ArcSwap<RuleSnapshot>,
}

impl Default for RuleRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl RuleRouter {
    /// Create an empty router whose default action is `proxy`.
    pub fn new() -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(RuleSnapshot {
                rules: Arc::new(Vec::new()),
                default_action: Action::default(),
            }),
        }
    }

    /// Replace the whole rule set.
    ///
    /// Disabled rules are dropped, the rest sorted by priority with a stable
    /// sort. Patterns that fail to compile are skipped individually.
    pub fn load_rules(&self, rules: &[Rule]) {
        let mut enabled: Vec<Rule> = rules.iter().filter(|r| r.enabled).cloned().collect();
        enabled.sort_by_key(|r| r.priority);
        let compiled: Vec<CompiledRule> = enabled.into_iter().map(CompiledRule::compile).collect();

        info!(
            total = rules.len(),
            enabled = compiled.len(),
            "Loaded routing rules"
        );

        let compiled = Arc::new(compiled);
        self.snapshot.rcu(|current| RuleSnapshot {
            rules: Arc::clone(&compiled),
            default_action: current.default_action,
        });
    }

    pub fn set_default_action(&self, action: Action) {
        self.snapshot.rcu(|current| RuleSnapshot {
            rules: Arc::clone(&current.rules),
            default_action: action,
        });
        debug!(action = %action, "Default action updated");
    }

    pub fn default_action(&self) -> Action {
        self.snapshot.load().default_action
    }

    /// Number of enabled rules currently loaded.
    pub fn rule_count(&self) -> usize {
        self.snapshot.load().rules.len()
    }

    /// Pick the action for a hostname.
    pub fn match_host(&self, hostname: &str) -> RouteMatch {
        let hostname = hostname.to_lowercase();
        let snapshot = self.snapshot.load();

        for compiled in snapshot.rules.iter() {
            if compiled.is_match(&hostname) {
                return RouteMatch {
                    action: compiled.rule.action,
                    matched_rule: Some(compiled.rule.clone()),
                };
            }
        }

        RouteMatch {
            action: snapshot.default_action,
            matched_rule: None,
        }
    }

    /// One-off match that leaves the loaded rules untouched.
    ///
    /// If any sub-pattern fails to compile the whole test is a non-match.
    pub fn test_rule(&self, pattern: &str, hostname: &str) -> bool {
        let hostname = hostname.to_lowercase();
        let matchers: Result<Vec<GlobMatcher>, PatternError> =
            split_patterns(pattern).map(compile_pattern).collect();
        match matchers {
            Ok(matchers) => matchers.iter().any(|m| m.is_match(&hostname)),
            Err(e) => {
                debug!(pattern, error = %e, "Test pattern does not compile");
                false
            }
        }
    }

    /// Check that a pattern list is non-empty and every entry compiles.
    pub fn validate_pattern(&self, pattern: &str) -> PatternValidation {
        match check_pattern(pattern) {
            Ok(()) => PatternValidation {
                valid: true,
                error: None,
            },
            Err(e) => PatternValidation {
                valid: false,
                error: Some(e.to_string()),
            },
        }
    }
}

/// Validate a comma-separated pattern list, reporting the first failure.
pub fn check_pattern(pattern: &str) -> Result<(), PatternError> {
    let mut count = 0;
    for p in split_patterns(pattern) {
        compile_pattern(p)?;
        count += 1;
    }
    if count == 0 {
        return Err(PatternError::Empty);
    }
    Ok(())
}
