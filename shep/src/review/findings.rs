//! Reviewer findings: parsing and cycle detection

use regex::Regex;
use std::collections::HashSet;
use std::sync::LazyLock;

/// Finding severity, highest first
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Severity {
    Critical,
    High,
    Medium,
    Low,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Critical => "CRITICAL",
            Severity::High => "HIGH",
            Severity::Medium => "MEDIUM",
            Severity::Low => "LOW",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "CRITICAL" => Some(Severity::Critical),
            "HIGH" => Some(Severity::High),
            "MEDIUM" => Some(Severity::Medium),
            "LOW" => Some(Severity::Low),
            _ => None,
        }
    }

    /// Worth fixing in a follow-up iteration
    pub fn actionable(&self) -> bool {
        matches!(self, Severity::Critical | Severity::High | Severity::Medium)
    }
}

/// One severity-tagged issue from a reviewer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Finding {
    pub severity: Severity,
    pub description: String,
    pub location: Option<String>,
}

impl Finding {
    /// Normalized key used for cycle comparison
    pub fn key(&self) -> String {
        self.description.trim().to_lowercase()
    }
}

impl std::fmt::Display for Finding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "- {}: {}", self.severity.as_str(), self.description)?;
        if let Some(location) = &self.location {
            write!(f, " ({})", location)?;
        }
        Ok(())
    }
}

static FINDING_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^-\s*(CRITICAL|HIGH|MEDIUM|LOW):\s*(.+?)(?:\.\s*(\S+:\d+))?$").unwrap());

/// Parse findings from reviewer output.
///
/// Primary format is `- SEV: description. path:line`; when no line
/// matches it, any line mentioning a severity with a colon is accepted.
pub fn parse_findings(review_output: &str) -> Vec<Finding> {
    let mut findings = Vec::new();

    for line in review_output.lines() {
        if let Some(caps) = FINDING_RE.captures(line.trim()) {
            findings.push(Finding {
                severity: Severity::parse(&caps[1]).unwrap_or(Severity::Low),
                description: caps[2].trim().to_string(),
                location: caps.get(3).map(|m| m.as_str().to_string()),
            });
        }
    }

    if !findings.is_empty() {
        return findings;
    }

    // Fallback: bare severity mentions anywhere on a line
    for line in review_output.lines() {
        let line = line.trim();
        for severity in [Severity::Critical, Severity::High, Severity::Medium, Severity::Low] {
            if line.contains(severity.as_str()) && line.contains(':') {
                if let Some((_, description)) = line.split_once(':') {
                    let description = description.trim();
                    if !description.is_empty() {
                        findings.push(Finding {
                            severity,
                            description: description.chars().take(200).collect(),
                            location: None,
                        });
                    }
                }
                break;
            }
        }
    }

    findings
}

/// Cycle verdict over the last three iterations
#[derive(Debug, Clone)]
pub struct CycleReport {
    pub reason: String,
    pub repeating: Vec<String>,
}

/// Detect a fix/review cycle: the same findings keep coming back.
///
/// Looks at the last three finding sets (case-insensitive, trimmed). A
/// non-empty intersection, or three identical non-empty sets, is a cycle.
pub fn detect_cycle(finding_sets: &[Vec<Finding>]) -> Option<CycleReport> {
    if finding_sets.len() < 3 {
        return None;
    }

    let last_3: Vec<HashSet<String>> = finding_sets[finding_sets.len() - 3..]
        .iter()
        .map(|findings| findings.iter().map(Finding::key).collect())
        .collect();

    if last_3.iter().all(|s| !s.is_empty()) {
        let mut common = last_3[0].clone();
        for set in &last_3[1..] {
            common = common.intersection(set).cloned().collect();
        }

        if !common.is_empty() {
            let mut repeating: Vec<String> = common.into_iter().collect();
            repeating.sort();
            repeating.truncate(5);
            return Some(CycleReport {
                reason: format!("{} issues keep repeating", repeating.len()),
                repeating,
            });
        }
    }

    if !last_3[0].is_empty() && last_3.iter().all(|s| *s == last_3[0]) {
        let mut repeating: Vec<String> = last_3[0].iter().cloned().collect();
        repeating.sort();
        repeating.truncate(5);
        return Some(CycleReport {
            reason: format!("Same {} issues repeated 3 times", last_3[0].len()),
            repeating,
        });
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn finding(severity: Severity, description: &str) -> Finding {
        Finding {
            severity,
            description: description.to_string(),
            location: None,
        }
    }

    #[test]
    fn test_parse_primary_format() {
        let output = "Review results:\n\
                      - CRITICAL: null pointer dereference in handler. src/api.ts:42\n\
                      - MEDIUM: missing input validation\n\
                      done";
        let findings = parse_findings(output);
        assert_eq!(findings.len(), 2);
        assert_eq!(findings[0].severity, Severity::Critical);
        assert_eq!(findings[0].description, "null pointer dereference in handler");
        assert_eq!(findings[0].location.as_deref(), Some("src/api.ts:42"));
        assert_eq!(findings[1].severity, Severity::Medium);
        assert!(findings[1].location.is_none());
    }

    #[test]
    fn test_parse_fallback_format() {
        let output = "The review found HIGH: race condition when two writers collide";
        let findings = parse_findings(output);
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].severity, Severity::High);
        assert!(findings[0].description.contains("race condition"));
    }

    #[test]
    fn test_parse_clean_review() {
        assert!(parse_findings("No problems found. Everything checks out.").is_empty());
    }

    #[test]
    fn test_severity_actionable() {
        assert!(Severity::Critical.actionable());
        assert!(Severity::Medium.actionable());
        assert!(!Severity::Low.actionable());
    }

    #[test]
    fn test_no_cycle_with_short_history() {
        let sets = vec![vec![finding(Severity::High, "issue a")]; 2];
        assert!(detect_cycle(&sets).is_none());
    }

    #[test]
    fn test_cycle_on_common_finding() {
        let sets = vec![
            vec![finding(Severity::High, "Missing null check in foo.ts:10"), finding(Severity::Low, "style")],
            vec![finding(Severity::High, "missing null check in foo.ts:10")],
            vec![finding(Severity::High, "MISSING NULL CHECK IN FOO.TS:10"), finding(Severity::Medium, "other")],
        ];
        let report = detect_cycle(&sets).unwrap();
        assert!(report.reason.contains("repeating"));
        assert_eq!(report.repeating, vec!["missing null check in foo.ts:10"]);
    }

    #[test]
    fn test_cycle_on_identical_sets() {
        let set = vec![finding(Severity::Medium, "a"), finding(Severity::Medium, "b")];
        let sets = vec![set.clone(), set.clone(), set];
        let report = detect_cycle(&sets).unwrap();
        assert!(report.reason.contains("3 times") || report.reason.contains("repeating"));
    }

    #[test]
    fn test_no_cycle_when_findings_change() {
        let sets = vec![
            vec![finding(Severity::High, "issue a")],
            vec![finding(Severity::High, "issue b")],
            vec![finding(Severity::High, "issue c")],
        ];
        assert!(detect_cycle(&sets).is_none());
    }

    #[test]
    fn test_no_cycle_with_empty_middle_set() {
        let sets = vec![
            vec![finding(Severity::High, "issue a")],
            vec![],
            vec![finding(Severity::High, "issue a")],
        ];
        assert!(detect_cycle(&sets).is_none());
    }

    #[test]
    fn test_cycle_uses_last_three_only() {
        let sets = vec![
            vec![finding(Severity::High, "ancient issue")],
            vec![finding(Severity::High, "issue x")],
            vec![finding(Severity::High, "issue x")],
            vec![finding(Severity::High, "issue x")],
        ];
        let report = detect_cycle(&sets).unwrap();
        assert_eq!(report.repeating, vec!["issue x"]);
    }
}
