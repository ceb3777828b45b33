//! Batch repair of documents (`mender review`).

use anyhow::{Context, Result, bail};
use console::style;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use mender::batch::{BatchProcessor, BatchReport, DocumentInput, collect_documents};
use mender::mender_config::{CliOverrides, MenderConfig};
use mender::orchestrator::ReviewOrchestrator;
use mender::ui::BatchUI;
use mender::ui::icons::FILE_MOD;
use mender::ui::report::{outcome_lines, summary_lines};

use super::super::ReviewArgs;

fn overrides(args: &ReviewArgs) -> Result<CliOverrides> {
    Ok(CliOverrides {
        profile: args.profile.as_deref().map(str::parse).transpose()?,
        completion_mode: args.mode.as_deref().map(str::parse).transpose()?,
        max_iterations: args.max_iterations,
        workers: args.workers,
        agent_cmd: args.agent_cmd.clone(),
        sequential: args.sequential,
    })
}

/// Read every document, keyed by a display id relative to the project.
fn read_documents(
    paths: &[PathBuf],
    project_dir: &Path,
) -> Result<(Vec<DocumentInput>, HashMap<String, PathBuf>)> {
    let mut documents = Vec::with_capacity(paths.len());
    let mut locations = HashMap::new();
    for path in paths {
        let mut document = DocumentInput::read(path.clone())?;
        document.id = path
            .strip_prefix(project_dir)
            .unwrap_or(path)
            .display()
            .to_string();
        locations.insert(document.id.clone(), path.clone());
        documents.push(document);
    }
    Ok((documents, locations))
}

/// Write back the final text of every document that converged with changes.
fn write_back(report: &BatchReport, locations: &HashMap<String, PathBuf>) -> Result<usize> {
    let mut written = 0;
    for outcome in report
        .outcomes
        .iter()
        .filter(|o| o.changed && o.error.is_none())
    {
        let Some(path) = locations.get(&outcome.document_id) else {
            continue;
        };
        std::fs::write(path, &outcome.final_text)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        tracing::info!(document = %outcome.document_id, "wrote repaired document");
        written += 1;
    }
    Ok(written)
}

/// Run the repair loop over every document named by `args`.
///
/// Returns `true` when every document converged without escalation.
pub async fn cmd_review(project_dir: &Path, args: &ReviewArgs, verbose: bool) -> Result<bool> {
    let config = MenderConfig::with_cli_args(project_dir.to_path_buf(), &overrides(args)?)?;
    let problems = config.validate();
    if !problems.is_empty() {
        let listed: Vec<String> = problems.iter().map(|p| format!("  - {p}")).collect();
        bail!("Invalid configuration:\n{}", listed.join("\n"));
    }

    let paths = collect_documents(&args.paths, &config.project_dir)?;
    let (documents, locations) = read_documents(&paths, &config.project_dir)?;

    let orchestrator =
        ReviewOrchestrator::new(config.toml.review_settings(), config.toml.collaborators());

    let (tx, rx) = mpsc::channel(64);
    let ui = BatchUI::new(documents.len() as u64, verbose, args.json).spawn(rx);

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupted, cancelling remaining documents");
            on_interrupt.cancel();
        }
    });

    let processor = BatchProcessor::new(orchestrator, config.toml.batch)
        .with_event_channel(tx)
        .with_cancellation(cancel);
    let report = processor.run(documents).await;
    drop(processor);
    if let Err(e) = ui.await {
        tracing::warn!(error = %e, "progress display stopped early");
    }

    let written = if args.write {
        write_back(&report, &locations)?
    } else {
        0
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(report.all_succeeded());
    }

    println!();
    for outcome in report.needs_attention() {
        for line in outcome_lines(outcome) {
            println!("{line}");
        }
        println!();
    }
    for failure in &report.failures {
        println!(
            "{} {}",
            style(&failure.document).red().bold(),
            style(&failure.error).red()
        );
    }
    for line in summary_lines(&report.summary) {
        println!("{line}");
    }
    if args.write {
        println!("{}Wrote {written} file(s)", FILE_MOD);
    } else if report.outcomes.iter().any(|o| o.changed) {
        println!(
            "{}",
            style("Run again with --write to save the repaired documents.").dim()
        );
    }

    Ok(report.all_succeeded())
}
