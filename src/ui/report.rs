//! Plain-text rendering of issues, outcomes and batch summaries.

use console::{StyledObject, style};

use crate::analytics::BatchSummary;
use crate::orchestrator::ReviewOutcome;
use crate::review::issue::{Issue, Severity};
use crate::ui::icons::{CHECK, CROSS, WARN};

fn severity_label(severity: Severity) -> StyledObject<&'static str> {
    let label = style(severity.as_str());
    match severity {
        Severity::Critical => label.red().bold(),
        Severity::Error => label.red(),
        Severity::Warning => label.yellow(),
        Severity::Info => label.dim(),
    }
}

pub fn issue_line(issue: &Issue) -> String {
    let location = match (issue.line, issue.field.as_deref()) {
        (Some(line), _) => format!(" (line {line})"),
        (None, Some(field)) => format!(" ({field})"),
        (None, None) => String::new(),
    };
    format!(
        "  {:<8} {}{}",
        severity_label(issue.severity),
        issue.message,
        style(location).dim()
    )
}

/// Result block for one reviewed document.
pub fn outcome_lines(outcome: &ReviewOutcome) -> Vec<String> {
    let status = if let Some(error) = &outcome.error {
        format!("{}{}", CROSS, style(format!("error: {error}")).red())
    } else if outcome.requires_human_review {
        format!("{}{}", WARN, style("needs human review").yellow())
    } else {
        format!("{}{}", CHECK, style("converged").green())
    };

    let mut lines = vec![format!(
        "{} {} {}",
        style(&outcome.document_id).bold(),
        status,
        style(format!(
            "({} iteration(s){})",
            outcome.iterations,
            if outcome.changed { ", changed" } else { "" }
        ))
        .dim()
    )];
    lines.extend(outcome.issues.iter().map(issue_line));
    if let Some(report) = &outcome.failure_report {
        lines.push(format!("  {} {}", style("Summary:").dim(), report.summary));
        for cause in &report.root_causes {
            lines.push(format!("    - {cause}"));
        }
        for recommendation in &report.recommendations {
            lines.push(format!("    → {recommendation}"));
        }
    }
    lines
}

pub fn summary_lines(summary: &BatchSummary) -> Vec<String> {
    let mut lines = vec![format!(
        "{} document(s): {} converged, {} need review, {} errored, {} changed",
        summary.documents,
        style(summary.converged).green(),
        style(summary.escalated).yellow(),
        style(summary.errored).red(),
        summary.changed
    )];
    if let Some(avg) = summary.avg_iterations {
        lines.push(format!("  {} {avg:.1}", style("avg iterations:").dim()));
    }
    if let Some(avg) = summary.avg_issues_resolved {
        lines.push(format!("  {} {avg:.1}", style("avg issues resolved:").dim()));
    }
    if let Some(avg) = summary.avg_duration_secs {
        lines.push(format!("  {} {avg:.2}s", style("avg duration:").dim()));
    }
    lines
}

#[cfg(test)]
mod tests {
    use super::*;
    use console::strip_ansi_codes;

    #[test]
    fn test_issue_line_shows_location() {
        let issue = Issue::error("Unclosed code fence").with_line(12);
        let line = strip_ansi_codes(&issue_line(&issue)).to_string();
        assert!(line.contains("ERROR"));
        assert!(line.ends_with("Unclosed code fence (line 12)"));

        let issue = Issue::warning("'updated' timestamp is in the future").with_field("updated");
        let line = strip_ansi_codes(&issue_line(&issue)).to_string();
        assert!(line.ends_with("(updated)"));
    }

    #[test]
    fn test_summary_lines() {
        let summary = BatchSummary {
            documents: 2,
            converged: 1,
            escalated: 1,
            avg_iterations: Some(2.5),
            ..BatchSummary::default()
        };
        let lines: Vec<String> = summary_lines(&summary)
            .iter()
            .map(|l| strip_ansi_codes(l).to_string())
            .collect();
        assert_eq!(
            lines[0],
            "2 document(s): 1 converged, 1 need review, 0 errored, 0 changed"
        );
        assert!(lines[1].ends_with("2.5"));
        assert_eq!(lines.len(), 2);
    }
}
