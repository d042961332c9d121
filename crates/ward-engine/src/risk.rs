//! Static risk analysis of script text.
//!
//! The analyzer is a denylist: every rule is a case-insensitive regular
//! expression matched line by line, ignoring `#` line comments and
//! `<# ... #>` block comments. Comment markers inside quoted strings are
//! plain text. The aggregate risk is the highest severity matched, `Low` when
//! nothing matched.
//!
//! Analysis is pure and deterministic. It never fails; malformed input simply
//! produces fewer findings.

use std::sync::{Arc, LazyLock};

use regex::{Regex, RegexBuilder};

use crate::comments::mask_comments;
use crate::model::{Finding, Location, RiskLevel, SecurityAnalysis};

/// A denylist rule before compilation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RiskRule {
    /// Stable identifier reported with each finding.
    pub id: String,
    /// Regular expression, matched case-insensitively per line.
    pub pattern: String,
    /// Severity assigned to matches.
    pub severity: RiskLevel,
    /// Human readable explanation.
    pub description: String,
}

impl RiskRule {
    /// Build a rule.
    pub fn new(
        id: impl Into<String>,
        pattern: impl Into<String>,
        severity: RiskLevel,
        description: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            pattern: pattern.into(),
            severity,
            description: description.into(),
        }
    }
}

#[derive(Debug)]
struct CompiledRule {
    id: String,
    regex: Regex,
    severity: RiskLevel,
    description: String,
}

/// Built-in PowerShell denylist: (id, pattern, severity, description).
const DEFAULT_RULES: &[(&str, &str, RiskLevel, &str)] = &[
    (
        "format-volume",
        r"\bFormat-Volume\b",
        RiskLevel::Critical,
        "formats a volume",
    ),
    (
        "clear-disk",
        r"\bClear-Disk\b",
        RiskLevel::Critical,
        "wipes a disk",
    ),
    (
        "delete-system-path",
        r#"\bRemove-Item\b.*\s['"]?(?:[A-Za-z]:\\?|[A-Za-z]:\\(?:Windows|Program Files)\\?|\$env:(?:SystemRoot|windir)\\?)['"]?(?:\s|$)"#,
        RiskLevel::Critical,
        "deletes a drive root or system directory",
    ),
    (
        "download-execute",
        r"(?:\b(?:Invoke-WebRequest|iwr|Invoke-RestMethod|irm|curl|wget)\b|\.DownloadString\s*\().*\|\s*(?:Invoke-Expression|iex)\b|\b(?:Invoke-Expression|iex)\b.*\.DownloadString\s*\(",
        RiskLevel::Critical,
        "downloads remote content and executes it",
    ),
    (
        "rm-rf-root",
        r"\brm\s+-(?:rf|fr)\s+/(?:\*|\s|$)",
        RiskLevel::Critical,
        "recursively deletes the filesystem root",
    ),
    (
        "invoke-expression",
        r"\b(?:Invoke-Expression|iex)\b",
        RiskLevel::High,
        "evaluates a string as code",
    ),
    (
        "remove-item-recurse",
        r"\bRemove-Item\b.*\s-Recurse\b",
        RiskLevel::High,
        "recursively deletes files",
    ),
    (
        "execution-policy-bypass",
        r"\bSet-ExecutionPolicy\b.*\b(?:Bypass|Unrestricted)\b",
        RiskLevel::High,
        "weakens the execution policy",
    ),
    (
        "stop-computer",
        r"\b(?:Stop-Computer|Restart-Computer)\b",
        RiskLevel::High,
        "shuts down or restarts the host",
    ),
    (
        "encoded-command",
        r"(?:^|\s)-(?:EncodedCommand|enc)\b",
        RiskLevel::High,
        "runs an encoded command",
    ),
    (
        "scriptblock-create",
        r"\[ScriptBlock\]::Create\s*\(",
        RiskLevel::High,
        "compiles a script block from a string",
    ),
    (
        "add-type-inline",
        r"\bAdd-Type\b.*-(?:TypeDefinition|MemberDefinition)\b",
        RiskLevel::High,
        "compiles inline source code",
    ),
    (
        "download-file",
        r"\.DownloadFile\s*\(",
        RiskLevel::High,
        "downloads a file to disk",
    ),
    (
        "start-process",
        r"\bStart-Process\b",
        RiskLevel::Medium,
        "starts another process",
    ),
    (
        "web-request",
        r"\b(?:Invoke-WebRequest|iwr|Invoke-RestMethod|irm)\b",
        RiskLevel::Medium,
        "makes a network request",
    ),
    (
        "webclient",
        r"\bNew-Object\s+(?:System\.)?Net\.WebClient\b",
        RiskLevel::Medium,
        "creates a web client",
    ),
    (
        "hklm-write",
        r"\b(?:Set-ItemProperty|New-ItemProperty|Remove-ItemProperty|New-Item)\b.*\bHKLM:",
        RiskLevel::Medium,
        "modifies machine-wide registry settings",
    ),
    (
        "remote-command",
        r"\bInvoke-Command\b.*-ComputerName\b",
        RiskLevel::Medium,
        "runs commands on a remote computer",
    ),
    (
        "env-echo",
        r"\bWrite-(?:Host|Output)\b.*\$env:",
        RiskLevel::Low,
        "prints environment values",
    ),
    (
        "credential-prompt",
        r"\bGet-Credential\b",
        RiskLevel::Low,
        "prompts for credentials",
    ),
];

static DEFAULT_COMPILED: LazyLock<Arc<[CompiledRule]>> = LazyLock::new(|| {
    DEFAULT_RULES
        .iter()
        .map(|(id, pattern, severity, description)| CompiledRule {
            id: (*id).to_string(),
            regex: compile(pattern).expect("built-in risk rule"),
            severity: *severity,
            description: (*description).to_string(),
        })
        .collect()
});

fn compile(pattern: &str) -> Result<Regex, regex::Error> {
    RegexBuilder::new(pattern).case_insensitive(true).build()
}

/// The built-in denylist as uncompiled rules.
pub fn default_rules() -> Vec<RiskRule> {
    DEFAULT_RULES
        .iter()
        .map(|(id, pattern, severity, description)| {
            RiskRule::new(*id, *pattern, *severity, *description)
        })
        .collect()
}

/// Compiled denylist. Cheap to clone and safe to share between tasks.
#[derive(Debug, Clone)]
pub struct RiskAnalyzer {
    rules: Arc<[CompiledRule]>,
}

impl Default for RiskAnalyzer {
    fn default() -> Self {
        Self {
            rules: Arc::clone(&DEFAULT_COMPILED),
        }
    }
}

impl RiskAnalyzer {
    /// Compile exactly the given rules.
    pub fn new(rules: Vec<RiskRule>) -> Result<Self, regex::Error> {
        let compiled = rules
            .into_iter()
            .map(|rule| {
                Ok(CompiledRule {
                    regex: compile(&rule.pattern)?,
                    id: rule.id,
                    severity: rule.severity,
                    description: rule.description,
                })
            })
            .collect::<Result<Vec<_>, regex::Error>>()?;
        Ok(Self {
            rules: compiled.into(),
        })
    }

    /// Configured rules on top of the defaults, or instead of them.
    pub fn with_rules(extra: Vec<RiskRule>, replace_defaults: bool) -> Result<Self, regex::Error> {
        if replace_defaults {
            return Self::new(extra);
        }
        let mut rules = default_rules();
        rules.extend(extra);
        Self::new(rules)
    }

    /// Number of active rules.
    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    /// Analyze script text.
    pub fn analyze(&self, content: &str) -> SecurityAnalysis {
        let mut findings = Vec::new();
        let masked = mask_comments(content);

        for (idx, (line, code)) in content.lines().zip(masked.lines()).enumerate() {
            if code.trim().is_empty() {
                continue;
            }

            let mut line_findings: Vec<Finding> = self
                .rules
                .iter()
                .filter_map(|rule| {
                    let m = rule.regex.find(&code)?;
                    let column = line
                        .get(..m.start())
                        .map(|prefix| prefix.chars().count())
                        .unwrap_or(m.start())
                        + 1;
                    Some(Finding {
                        severity: rule.severity,
                        rule: rule.id.clone(),
                        description: rule.description.clone(),
                        location: Location {
                            line: idx + 1,
                            column,
                        },
                    })
                })
                .collect();
            line_findings.sort_by_key(|f| f.location.column);
            findings.extend(line_findings);
        }

        let risk_score = findings
            .iter()
            .map(|f| f.severity)
            .max()
            .unwrap_or(RiskLevel::Low);

        SecurityAnalysis {
            risk_score,
            findings,
        }
    }
}
