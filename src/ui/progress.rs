use crate::analytics::BatchSummary;
use crate::batch::BatchEvent;
use crate::ui::icons::{CHECK, CROSS, FILE_MOD, RUNNING, SPARKLE, WARN};
use console::style;
use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::collections::BTreeSet;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Terminal UI for a batch run, rendered via `indicatif` progress bars.
///
/// Two bars are stacked vertically:
/// - Document bar: how many documents have finished
/// - Activity spinner: the documents currently being worked on
///
/// Per-document result lines are printed above the bars as workers finish.
pub struct BatchUI {
    multi: MultiProgress,
    document_bar: ProgressBar,
    activity_bar: ProgressBar,
    verbose: bool,
    active: BTreeSet<String>,
}

impl BatchUI {
    /// Create the UI sized for `total_documents`.
    ///
    /// With `hidden` nothing is drawn, which keeps `--json` output clean.
    pub fn new(total_documents: u64, verbose: bool, hidden: bool) -> Self {
        let multi = if hidden {
            MultiProgress::with_draw_target(ProgressDrawTarget::hidden())
        } else {
            MultiProgress::new()
        };

        let document_style = ProgressStyle::default_bar()
            .template("{prefix:.bold.dim} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
            .expect("progress bar template is a valid static string")
            .progress_chars("█▓▒░");

        let document_bar = multi.add(ProgressBar::new(total_documents));
        document_bar.set_style(document_style);
        document_bar.set_prefix("Documents");

        let activity_style = ProgressStyle::default_spinner()
            .template("{prefix:.bold.dim} {spinner} {msg}")
            .expect("progress bar template is a valid static string");

        let activity_bar = multi.add(ProgressBar::new_spinner());
        activity_bar.set_style(activity_style);
        activity_bar.set_prefix("   Active");
        if !hidden {
            activity_bar.enable_steady_tick(Duration::from_millis(100));
        }

        Self {
            multi,
            document_bar,
            activity_bar,
            verbose,
            active: BTreeSet::new(),
        }
    }

    /// Print a line via `MultiProgress`, falling back to `eprintln!` if the rich UI fails.
    fn print_line(&self, msg: impl AsRef<str>) {
        if self.multi.println(msg.as_ref()).is_err() {
            eprintln!("{}", msg.as_ref());
        }
    }

    fn refresh_activity(&self) {
        let message = match self.active.len() {
            0 => style("idle").dim().to_string(),
            1..=3 => self
                .active
                .iter()
                .map(String::as_str)
                .collect::<Vec<_>>()
                .join(", "),
            n => format!("{n} documents in progress"),
        };
        self.activity_bar.set_message(message);
    }

    pub fn handle(&mut self, event: &BatchEvent) {
        match event {
            BatchEvent::Started { document } => {
                self.active.insert(document.clone());
                if self.verbose {
                    self.print_line(format!("{} {}", RUNNING, style(document).dim()));
                }
                self.refresh_activity();
            }
            BatchEvent::Finished {
                document,
                iterations,
                changed,
                requires_human_review,
                error,
            } => {
                self.active.remove(document);
                self.document_bar.inc(1);
                let line = match (error, requires_human_review) {
                    (Some(error), _) => format!(
                        "{} {} {}",
                        CROSS,
                        style(document).red().bold(),
                        style(format!("error: {error}")).red()
                    ),
                    (None, true) => format!(
                        "{} {} {}",
                        WARN,
                        style(document).yellow().bold(),
                        style(format!("needs review after {iterations} iteration(s)")).yellow()
                    ),
                    (None, false) => format!(
                        "{} {} {}{}",
                        CHECK,
                        style(document).green(),
                        style(format!("converged in {iterations} iteration(s)")).dim(),
                        if *changed {
                            format!(" {FILE_MOD}")
                        } else {
                            String::new()
                        }
                    ),
                };
                self.print_line(line);
                self.refresh_activity();
            }
            BatchEvent::WorkerFailed { document, error } => {
                self.active.remove(document);
                self.document_bar.inc(1);
                self.print_line(format!(
                    "{} {} {}",
                    CROSS,
                    style(document).red().bold(),
                    style(error).red()
                ));
                self.refresh_activity();
            }
            BatchEvent::BatchCompleted { summary } => self.finish(summary),
        }
    }

    fn finish(&self, summary: &BatchSummary) {
        self.activity_bar.finish_and_clear();
        let message = if summary.all_converged() {
            format!("{SPARKLE}all documents converged")
        } else {
            format!(
                "{} converged, {} need review, {} errored",
                summary.converged, summary.escalated, summary.errored
            )
        };
        self.document_bar.finish_with_message(message);
    }

    /// Consume `rx` on a background task until the batch closes the channel.
    pub fn spawn(mut self, mut rx: mpsc::Receiver<BatchEvent>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                self.handle(&event);
            }
        })
    }
}
