//! One validation pass without repair (`mender check`).

use anyhow::Result;
use console::style;
use futures::future::try_join_all;
use serde::Serialize;
use std::path::Path;

use mender::batch::{DocumentInput, collect_documents};
use mender::collaborators::builtin;
use mender::mender_config::MenderConfig;
use mender::review::issue::{Issue, dedup_issues};
use mender::ui::icons::{CHECK, CROSS, FILE};
use mender::ui::report::issue_line;

use super::super::CheckArgs;

#[derive(Debug, Serialize)]
struct CheckResult {
    document: String,
    blocking: bool,
    reason: String,
    issues: Vec<Issue>,
}

/// Validate every document named by `args` once.
///
/// Returns `true` when no document has issues beyond the completion thresholds.
pub async fn cmd_check(project_dir: &Path, args: &CheckArgs) -> Result<bool> {
    let config = MenderConfig::new(project_dir.to_path_buf())?;
    let settings = config.toml.review_settings();
    let thresholds = settings.thresholds();
    let validators = builtin::validators(config.toml.document_rules());

    let paths = collect_documents(&args.paths, &config.project_dir)?;
    let mut results = Vec::with_capacity(paths.len());
    for path in &paths {
        let document = DocumentInput::read(path.clone())?;
        let found = try_join_all(validators.iter().map(|v| v.validate(&document.text))).await?;
        let issues = dedup_issues(found.into_iter().flatten().collect());
        let check = thresholds.check(&issues, settings.completion_mode);
        results.push(CheckResult {
            document: path
                .strip_prefix(&config.project_dir)
                .unwrap_or(path)
                .display()
                .to_string(),
            blocking: check.blocking,
            reason: check.reason,
            issues,
        });
    }

    let passed = results.iter().all(|r| !r.blocking);
    if args.json {
        println!("{}", serde_json::to_string_pretty(&results)?);
        return Ok(passed);
    }

    for result in &results {
        let icon = if result.blocking { CROSS } else { CHECK };
        println!(
            "{}{}{} {}",
            icon,
            FILE,
            style(&result.document).bold(),
            style(&result.reason).dim()
        );
        for issue in &result.issues {
            println!("{}", issue_line(issue));
        }
    }
    let failing = results.iter().filter(|r| r.blocking).count();
    println!();
    println!(
        "{} document(s) checked, {} blocking",
        results.len(),
        if failing == 0 {
            style(failing).green()
        } else {
            style(failing).red()
        }
    );
    Ok(passed)
}
