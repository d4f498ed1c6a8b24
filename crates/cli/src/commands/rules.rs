//! Offline rule file validation

use anyhow::{bail, Context, Result};
use judge_lib::judge::{validate_rule, CompiledRule};
use judge_lib::models::{AlertRule, RuleType};
use judge_lib::rules::parse_rules;
use serde::Serialize;
use std::collections::HashSet;
use std::path::Path;
use tabled::Tabled;

use crate::output::{color_status, print_rows, print_success, OutputFormat};

/// Verdict for one rule of a file
#[derive(Debug, Clone, Serialize)]
pub struct RuleCheck {
    pub id: i64,
    pub name: String,
    pub rule_type: RuleType,
    pub expression: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RuleCheck {
    pub fn is_valid(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Tabled)]
struct RuleRow {
    #[tabled(rename = "ID")]
    id: i64,
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Type")]
    rule_type: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Expression / Error")]
    detail: String,
}

fn expression_of(rule: &AlertRule) -> String {
    match rule.rule_type {
        RuleType::Push => CompiledRule::compile(rule.clone())
            .map(|compiled| compiled.readable_expression())
            .unwrap_or_default(),
        RuleType::Pull => rule
            .pull_expr
            .as_ref()
            .map(|expr| expr.prom_ql.clone())
            .unwrap_or_default(),
    }
}

/// Validate every rule of a rules document; duplicate ids are errors
pub fn check_rules(raw: &str) -> Result<Vec<RuleCheck>> {
    let rules = parse_rules(raw).context("Rules file is not a valid rule list")?;
    let mut seen = HashSet::new();

    Ok(rules
        .iter()
        .map(|rule| {
            let error = if !seen.insert(rule.id) {
                Some(format!("duplicate rule id {}", rule.id))
            } else {
                validate_rule(rule).err().map(|e| e.to_string())
            };
            RuleCheck {
                id: rule.id,
                name: rule.name.clone(),
                rule_type: rule.rule_type,
                expression: expression_of(rule),
                error,
            }
        })
        .collect())
}

pub fn validate_file(path: &Path, format: OutputFormat) -> Result<()> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let checks = check_rules(&raw)?;

    let rows = checks
        .iter()
        .map(|check| RuleRow {
            id: check.id,
            name: check.name.clone(),
            rule_type: match check.rule_type {
                RuleType::Push => "PUSH".to_string(),
                RuleType::Pull => "PULL".to_string(),
            },
            status: color_status(if check.is_valid() { "ok" } else { "invalid" }),
            detail: check
                .error
                .clone()
                .unwrap_or_else(|| check.expression.clone()),
        })
        .collect();
    print_rows(&checks, rows, format);

    let invalid = checks.iter().filter(|c| !c.is_valid()).count();
    if invalid > 0 {
        bail!("{} of {} rules are invalid", invalid, checks.len());
    }
    if let OutputFormat::Table = format {
        print_success(&format!("{} rules valid", checks.len()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const RULES: &str = r#"[
        {
            "id": 1, "name": "cpu", "type": "PUSH", "alertDuration": 60,
            "pushExpr": {"exps": [{"metric": "cpu_util", "func": "all", "optr": ">", "threshold": 80}]}
        },
        {
            "id": 2, "name": "down", "type": "PULL", "alertDuration": 120,
            "pullExpr": {"promQl": "up == 0"}
        },
        {
            "id": 3, "name": "broken", "type": "PUSH", "alertDuration": 60,
            "pushExpr": {"exps": [{"metric": "mem", "func": "bogus", "optr": ">", "threshold": 1}]}
        },
        {
            "id": 1, "name": "dup", "type": "PULL", "alertDuration": 0,
            "pullExpr": {"promQl": "up"}
        }
    ]"#;

    #[test]
    fn test_check_rules_reports_each_rule() {
        let checks = check_rules(RULES).unwrap();
        assert_eq!(checks.len(), 4);

        assert!(checks[0].is_valid());
        assert_eq!(checks[0].expression, "cpu_util(all,60s) > 80");

        assert!(checks[1].is_valid());
        assert_eq!(checks[1].expression, "up == 0");

        assert!(!checks[2].is_valid());
        assert!(checks[3].error.as_deref().unwrap().contains("duplicate"));
    }

    #[test]
    fn test_check_rules_rejects_malformed_document() {
        assert!(check_rules("{not json").is_err());
    }

    #[test]
    fn test_validate_file_fails_on_invalid_rules() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(RULES.as_bytes()).unwrap();
        assert!(validate_file(file.path(), OutputFormat::Json).is_err());

        let mut ok = tempfile::NamedTempFile::new().unwrap();
        ok.write_all(br#"[{"id": 9, "name": "n", "type": "PULL", "alertDuration": 0, "pullExpr": {"promQl": "up"}}]"#)
            .unwrap();
        assert!(validate_file(ok.path(), OutputFormat::Json).is_ok());
    }
}
