//! Pre-flight request validation.
//!
//! Errors block execution; warnings are informational. The same checks back
//! both `validate_execution` and the gate in front of every `execute_*` call.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;

use crate::catalog::parse_script_parameters;
use crate::model::{Parameters, ValidationReport};
use crate::risk::RiskAnalyzer;

/// Default ceiling on script size: 1 MiB.
pub const DEFAULT_MAX_SCRIPT_BYTES: usize = 1024 * 1024;

static PARAMETER_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("parameter name regex"));

/// Errors in the parameter list itself, independent of the script.
pub fn check_parameter_names(parameters: &Parameters) -> Vec<String> {
    let mut errors = Vec::new();
    let mut seen = HashSet::new();
    for (name, _) in parameters {
        if !PARAMETER_NAME.is_match(name) {
            errors.push(format!("invalid parameter name '{name}'"));
            continue;
        }
        if !seen.insert(name.to_ascii_lowercase()) {
            errors.push(format!("duplicate parameter '{name}'"));
        }
    }
    errors
}

/// Validate resolved script content against the supplied parameters.
///
/// `required` adds mandatory parameters on top of those declared in the
/// script's own `param(...)` block (catalog definitions may list them).
pub fn validate_script(
    content: &str,
    parameters: &Parameters,
    required: &[String],
    analyzer: &RiskAnalyzer,
    max_script_bytes: usize,
) -> ValidationReport {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    if content.trim().is_empty() {
        errors.push("script content is empty".to_string());
    }
    if content.len() > max_script_bytes {
        errors.push(format!(
            "script content is {} bytes, exceeding the limit of {max_script_bytes} bytes",
            content.len()
        ));
    }
    errors.extend(check_parameter_names(parameters));

    let declared = parse_script_parameters(content);
    let supplied = |name: &str| parameters.iter().any(|(p, _)| p.eq_ignore_ascii_case(name));
    let mut missing: Vec<&str> = Vec::new();
    for name in declared.mandatory.iter().chain(required) {
        if !supplied(name.as_str()) && !missing.iter().any(|m| m.eq_ignore_ascii_case(name)) {
            missing.push(name.as_str());
        }
    }
    errors.extend(
        missing
            .into_iter()
            .map(|name| format!("missing mandatory parameter '{name}'")),
    );

    let analysis = analyzer.analyze(content);
    warnings.extend(analysis.findings.iter().map(ToString::to_string));
    if declared.has_param_block {
        for (name, _) in parameters {
            if !declared.declares(name) {
                warnings.push(format!("parameter '{name}' is not declared by the script"));
            }
        }
    }

    ValidationReport {
        is_valid: errors.is_empty(),
        errors,
        warnings,
        analysis: Some(analysis),
    }
}

/// Report for a catalog id that does not resolve.
pub fn unknown_script(script_id: &str, parameters: &Parameters) -> ValidationReport {
    let mut errors = vec![format!("unknown script id '{script_id}'")];
    errors.extend(check_parameter_names(parameters));
    ValidationReport {
        is_valid: false,
        errors,
        warnings: Vec::new(),
        analysis: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::RiskLevel;

    fn params(pairs: &[(&str, &str)]) -> Parameters {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn validate(content: &str, parameters: &Parameters) -> ValidationReport {
        validate_script(
            content,
            parameters,
            &[],
            &RiskAnalyzer::default(),
            DEFAULT_MAX_SCRIPT_BYTES,
        )
    }

    #[test]
    fn clean_script_is_valid() {
        let report = validate("Write-Output 'hello'", &params(&[("Name", "x")]));
        assert!(report.is_valid, "{report:?}");
        assert!(report.errors.is_empty());
        assert!(report.warnings.is_empty());
        assert_eq!(report.analysis.unwrap().risk_score, RiskLevel::Low);
    }

    #[test]
    fn empty_content_is_an_error() {
        let report = validate("   \n\t", &vec![]);
        assert!(!report.is_valid);
        assert_eq!(report.errors, vec!["script content is empty"]);
    }

    #[test]
    fn oversized_content_is_an_error_not_a_finding() {
        let report = validate_script(
            "Write-Output 'x'",
            &vec![],
            &[],
            &RiskAnalyzer::default(),
            4,
        );
        assert!(!report.is_valid);
        assert!(report.errors[0].contains("exceeding the limit of 4 bytes"));
        assert!(report.analysis.unwrap().is_clean());
    }

    #[test]
    fn bad_and_duplicate_parameter_names() {
        let report = validate(
            "Write-Output 1",
            &params(&[("ok_1", "a"), ("1bad", "b"), ("has-dash", "c"), ("OK_1", "d")]),
        );
        assert_eq!(
            report.errors,
            vec![
                "invalid parameter name '1bad'",
                "invalid parameter name 'has-dash'",
                "duplicate parameter 'OK_1'",
            ]
        );
    }

    #[test]
    fn findings_become_warnings() {
        let report = validate("Invoke-Expression $cmd", &vec![]);
        assert!(report.is_valid);
        assert_eq!(report.warnings.len(), 1);
        assert!(report.warnings[0].starts_with("high line 1:"), "{:?}", report.warnings);
    }

    #[test]
    fn mandatory_parameters_are_enforced() {
        let script = "param([Parameter(Mandatory)][string]$Path, [int]$Depth)\nGet-ChildItem $Path";
        let report = validate(script, &vec![]);
        assert_eq!(report.errors, vec!["missing mandatory parameter 'Path'"]);

        let report = validate(script, &params(&[("path", "/tmp")]));
        assert!(report.is_valid, "{report:?}");
    }

    #[test]
    fn catalog_required_parameters_are_merged() {
        let report = validate_script(
            "param([Parameter(Mandatory)]$Path)\nWrite-Output $Path",
            &vec![],
            &["Path".to_string(), "Owner".to_string()],
            &RiskAnalyzer::default(),
            DEFAULT_MAX_SCRIPT_BYTES,
        );
        assert_eq!(
            report.errors,
            vec![
                "missing mandatory parameter 'Path'",
                "missing mandatory parameter 'Owner'",
            ]
        );
    }

    #[test]
    fn undeclared_parameters_warn_only_with_param_block() {
        let script = "param($Path)\nWrite-Output $Path";
        let report = validate(script, &params(&[("Path", "a"), ("Extra", "b")]));
        assert!(report.is_valid);
        assert_eq!(
            report.warnings,
            vec!["parameter 'Extra' is not declared by the script"]
        );

        let report = validate("Write-Output 1", &params(&[("Extra", "b")]));
        assert!(report.warnings.is_empty());
    }

    #[test]
    fn unknown_script_report() {
        let report = unknown_script("nightly-backup", &params(&[("9", "x")]));
        assert!(!report.is_valid);
        assert_eq!(
            report.errors,
            vec![
                "unknown script id 'nightly-backup'",
                "invalid parameter name '9'",
            ]
        );
        assert!(report.analysis.is_none());
    }
}
