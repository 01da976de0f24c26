//! Static screening of submitted construct source.
//!
//! Two independent rule families run over the raw source text:
//!
//! - **capability rules** catch invocation forms that would let guest code
//!   escape the sandbox (dynamic evaluation, dynamic module loading, process
//!   and filesystem access, directory introspection);
//! - **credential rules** catch token-shaped literals and hardcoded
//!   passwords. These are always critical, whatever security configuration
//!   the caller supplied.
//!
//! This is a denylist pre-filter: obfuscated calls slip through, and benign
//! high-entropy strings can trip the credential rules.

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::error::ConfigError;
use crate::types::{SecurityViolation, Severity, ViolationKind};

/// A single pattern the screener looks for.
#[derive(Debug, Clone)]
pub struct ScreenRule {
    pub name: String,
    pub pattern: Regex,
    pub kind: ViolationKind,
    pub severity: Severity,
    pub message: String,
}

impl ScreenRule {
    fn builtin(
        name: &str,
        pattern: &str,
        kind: ViolationKind,
        severity: Severity,
        message: &str,
    ) -> Self {
        Self {
            name: name.to_string(),
            pattern: Regex::new(pattern).unwrap(),
            kind,
            severity,
            message: message.to_string(),
        }
    }
}

/// Operator-supplied rule, as written in the `[screener]` config section.
#[derive(Debug, Clone, Deserialize)]
pub struct RuleConfig {
    pub name: String,
    pub pattern: String,
    pub kind: ViolationKind,
    pub severity: Severity,
    pub message: String,
}

impl TryFrom<&RuleConfig> for ScreenRule {
    type Error = ConfigError;

    fn try_from(config: &RuleConfig) -> Result<Self, Self::Error> {
        let pattern = Regex::new(&config.pattern).map_err(|source| ConfigError::InvalidRule {
            name: config.name.clone(),
            source,
        })?;
        Ok(Self {
            name: config.name.clone(),
            pattern,
            kind: config.kind,
            severity: config.severity,
            message: config.message.clone(),
        })
    }
}

// Compiled once; order here is the order violations are reported in.
static CAPABILITY_RULES: Lazy<Vec<ScreenRule>> = Lazy::new(|| {
    use Severity::*;
    use ViolationKind::Code;
    vec![
        ScreenRule::builtin("eval", r"\beval\s*\(", Code, High, "eval() is not allowed"),
        ScreenRule::builtin(
            "function_constructor",
            r"\bnew\s+Function\s*\(",
            Code,
            High,
            "Function constructor is not allowed",
        ),
        ScreenRule::builtin(
            "string_timer",
            r#"\bset(?:Timeout|Interval)\s*\(\s*["'`]"#,
            Code,
            High,
            "String-evaluated timers are not allowed",
        ),
        ScreenRule::builtin(
            "dynamic_import",
            r"\bimport\s*\(",
            Code,
            High,
            "Dynamic import() is not allowed",
        ),
        ScreenRule::builtin("require", r"\brequire\s*\(", Code, High, "require() is not allowed"),
        ScreenRule::builtin(
            "process_access",
            r"\bprocess\s*\.",
            Code,
            High,
            "Access to process is not allowed",
        ),
        ScreenRule::builtin(
            "child_process",
            r"\bchild_process\b",
            Code,
            High,
            "Subprocess access is not allowed",
        ),
        ScreenRule::builtin(
            "filesystem",
            r"\bfs\s*\.",
            Code,
            High,
            "Filesystem access is not allowed",
        ),
        ScreenRule::builtin(
            "directory_introspection",
            r"\b__(?:dirname|filename)\b",
            Code,
            High,
            "Directory introspection is not allowed",
        ),
        ScreenRule::builtin(
            "debugger",
            r"\bdebugger\b",
            Code,
            Low,
            "debugger statement left in component",
        ),
        ScreenRule::builtin(
            "console",
            r"\bconsole\s*\.\s*(?:log|debug|trace)\s*\(",
            Code,
            Low,
            "Console output is captured, not shown to users",
        ),
        ScreenRule::builtin(
            "inner_html",
            r"\.innerHTML\s*=",
            Code,
            Medium,
            "Direct innerHTML assignment may allow markup injection",
        ),
    ]
});

static CREDENTIAL_RULES: Lazy<Vec<ScreenRule>> = Lazy::new(|| {
    use Severity::Critical;
    use ViolationKind::Credential;
    vec![
        ScreenRule::builtin(
            "opaque_token",
            r#"["'`][A-Za-z0-9+/_\-]{40,}={0,2}["'`]"#,
            Credential,
            Critical,
            "Hardcoded opaque token detected",
        ),
        ScreenRule::builtin(
            "openai_style_key",
            r"\bsk-[A-Za-z0-9_\-]{20,}",
            Credential,
            Critical,
            "Hardcoded secret API key detected",
        ),
        ScreenRule::builtin(
            "stripe_live_key",
            r"\b[sr]k_live_[A-Za-z0-9]{16,}",
            Credential,
            Critical,
            "Hardcoded live payment key detected",
        ),
        ScreenRule::builtin(
            "aws_access_key",
            r"\bAKIA[0-9A-Z]{16}\b",
            Credential,
            Critical,
            "Hardcoded AWS access key detected",
        ),
        ScreenRule::builtin(
            "github_token",
            r"\bgh[pousr]_[A-Za-z0-9]{36,}",
            Credential,
            Critical,
            "Hardcoded GitHub token detected",
        ),
        ScreenRule::builtin(
            "slack_token",
            r"\bxox[abprs]-[A-Za-z0-9\-]{10,}",
            Credential,
            Critical,
            "Hardcoded Slack token detected",
        ),
        ScreenRule::builtin(
            "hardcoded_password",
            r#"(?i)\b(?:password|passwd|secret|api_?key)\s*[:=]\s*["'`][^"'`\s]{4,}["'`]"#,
            Credential,
            Critical,
            "Hardcoded password or secret assignment detected",
        ),
    ]
});

/// Pattern-based source screener.
///
/// Built-in rules are shared across instances; extra rules are per instance.
#[derive(Debug, Clone, Default)]
pub struct Screener {
    extra_rules: Vec<ScreenRule>,
}

impl Screener {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds operator-defined rules after the built-in families.
    pub fn with_rules(configs: &[RuleConfig]) -> Result<Self, ConfigError> {
        let extra_rules = configs
            .iter()
            .map(ScreenRule::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { extra_rules })
    }

    /// Screens `source`, stamping violations with the current time.
    pub fn screen(&self, source: &str) -> Vec<SecurityViolation> {
        self.screen_at(source, Utc::now())
    }

    /// Screens `source` with a fixed detection timestamp.
    ///
    /// Identical inputs always produce identical violation lists.
    pub fn screen_at(&self, source: &str, detected_at: DateTime<Utc>) -> Vec<SecurityViolation> {
        let rules = CAPABILITY_RULES
            .iter()
            .chain(CREDENTIAL_RULES.iter())
            .chain(self.extra_rules.iter());

        let mut violations = Vec::new();
        for rule in rules {
            for found in rule.pattern.find_iter(source) {
                let (line, column) = line_column(source, found.start());
                debug!(rule = %rule.name, line, column, "Screener match");
                // Never copy the matched text: it may be the secret itself.
                violations.push(SecurityViolation {
                    kind: rule.kind,
                    severity: rule.severity,
                    message: rule.message.clone(),
                    detected_at,
                    context: Some(json!({
                        "rule": rule.name,
                        "line": line,
                        "column": column,
                    })),
                });
            }
        }
        violations
    }
}

/// True if any violation must stop execution.
pub fn is_blocking(violations: &[SecurityViolation]) -> bool {
    violations.iter().any(|v| v.severity.is_blocking())
}

/// 1-based line and column of a byte offset.
fn line_column(source: &str, offset: usize) -> (usize, usize) {
    let before = &source[..offset];
    let line = before.matches('\n').count() + 1;
    let column = before
        .rsplit('\n')
        .next()
        .map(|l| l.chars().count() + 1)
        .unwrap_or(1);
    (line, column)
}
