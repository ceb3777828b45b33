//! Drives one document through the repair loop.
//!
//! Every step is a function from the current [`ReviewState`] to a
//! [`Transition`]: the update to merge and the step to run next. The runner
//! applies the update and moves on until it reaches [`Step::Done`].
//!
//! Bookkeeping that is not part of the public state (fix memory, the best
//! validated snapshot, per-validator results carried between passes) lives
//! in a private `RunContext`.

use futures::future::try_join_all;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

use super::state::{FixAttempt, FixResult, HistoryEntry, ReviewState, StateUpdate, Step};
use super::{PreflightCheck, ReviewSettings};
use crate::analytics::DocumentAnalytics;
use crate::collaborators::builtin::{self, DocumentRules, LocalSummarizer, StrictQaVerifier};
use crate::collaborators::{
    FailureReport, FailureSummarizer, FixContext, Fixer, InitialReviewer, NoopFixer, QaRequest,
    QaVerifier, ReferenceResolver, Validator, ValidatorKind,
};
use crate::document::ParsedDocument;
use crate::errors::CollaboratorError;
use crate::repair::deterministic::DeterministicFixer;
use crate::repair::fix_memory::{FixMemory, Regression};
use crate::repair::gate::{FixValidationGate, GateVerdict};
use crate::repair::oscillation::{OscillationDetector, OscillationReport};
use crate::repair::rescue::OscillationRescue;
use crate::repair::selector::ValidatorSelector;
use crate::review::decision::{Decision, DecisionContext, DecisionRule, decide};
use crate::review::issue::{Issue, IssueCounts, dedup_issues, signatures};

/// The collaborators one run talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub validators: Vec<Arc<dyn Validator>>,
    pub fixer: Arc<dyn Fixer>,
    pub qa: Arc<dyn QaVerifier>,
    pub summarizer: Arc<dyn FailureSummarizer>,
    pub initial_reviewer: Option<Arc<dyn InitialReviewer>>,
    pub reference_resolver: Option<Arc<dyn ReferenceResolver>>,
}

impl Collaborators {
    pub fn new(validators: Vec<Arc<dyn Validator>>, fixer: Arc<dyn Fixer>) -> Self {
        Self {
            validators,
            fixer,
            qa: Arc::new(StrictQaVerifier),
            summarizer: Arc::new(LocalSummarizer),
            initial_reviewer: None,
            reference_resolver: None,
        }
    }

    /// Built-in validators, QA and summarizer; no external fixer.
    pub fn builtin(rules: DocumentRules) -> Self {
        Self::new(builtin::validators(rules), Arc::new(NoopFixer))
    }

    pub fn with_fixer(mut self, fixer: Arc<dyn Fixer>) -> Self {
        self.fixer = fixer;
        self
    }

    pub fn with_qa(mut self, qa: Arc<dyn QaVerifier>) -> Self {
        self.qa = qa;
        self
    }

    pub fn with_summarizer(mut self, summarizer: Arc<dyn FailureSummarizer>) -> Self {
        self.summarizer = summarizer;
        self
    }

    pub fn with_initial_reviewer(mut self, reviewer: Arc<dyn InitialReviewer>) -> Self {
        self.initial_reviewer = Some(reviewer);
        self
    }

    pub fn with_reference_resolver(mut self, resolver: Arc<dyn ReferenceResolver>) -> Self {
        self.reference_resolver = Some(resolver);
        self
    }
}

/// Result of processing one document.
#[derive(Debug, Clone, Serialize)]
pub struct ReviewOutcome {
    pub document_id: String,
    /// The accepted text, or the best validated snapshot when the run did
    /// not finish cleanly.
    pub final_text: String,
    pub changed: bool,
    pub iterations: u32,
    pub issues: Vec<Issue>,
    pub error: Option<String>,
    pub requires_human_review: bool,
    pub qa_passed: Option<bool>,
    pub history: Vec<HistoryEntry>,
    pub fix_attempts: Vec<FixAttempt>,
    pub failure_report: Option<FailureReport>,
    pub analytics: DocumentAnalytics,
    #[serde(skip)]
    pub memory: FixMemory,
}

impl ReviewOutcome {
    /// Finished without errors and without needing a human.
    pub fn succeeded(&self) -> bool {
        self.error.is_none() && !self.requires_human_review
    }
}

struct Transition {
    update: StateUpdate,
    next: Step,
}

impl Transition {
    fn to(next: Step, update: StateUpdate) -> Self {
        Self { update, next }
    }
}

#[derive(Debug, Clone)]
struct Snapshot {
    counts: IssueCounts,
    text: String,
    issues: Vec<Issue>,
}

struct RunContext {
    memory: FixMemory,
    /// Text of the last validation pass.
    validated_text: Option<String>,
    per_kind: BTreeMap<ValidatorKind, Vec<Issue>>,
    best: Option<Snapshot>,
    rescue_attempted: bool,
    /// Oscillation detection ignores snapshots before this index.
    oscillation_baseline: usize,
    oscillation: Option<OscillationReport>,
    analytics: DocumentAnalytics,
}

impl RunContext {
    /// Keep the snapshot with the fewest issues, weighted by severity.
    fn record_best(&mut self, counts: IssueCounts, text: &str, issues: &[Issue]) {
        if self.best.as_ref().is_none_or(|best| counts < best.counts) {
            self.best = Some(Snapshot {
                counts,
                text: text.to_string(),
                issues: issues.to_vec(),
            });
        }
    }
}

pub struct ReviewOrchestrator {
    settings: ReviewSettings,
    collaborators: Collaborators,
    gate: FixValidationGate,
    selector: ValidatorSelector,
    preflight: PreflightCheck,
    deterministic: DeterministicFixer,
    detector: OscillationDetector,
    rescue: OscillationRescue,
}

impl ReviewOrchestrator {
    pub fn new(settings: ReviewSettings, collaborators: Collaborators) -> Self {
        let mut deterministic = DeterministicFixer::new();
        if let Some(today) = settings.rules.today {
            deterministic = deterministic.with_today(today);
        }
        Self {
            gate: settings.effective_gate(),
            selector: ValidatorSelector::new(settings.profile.full_validation()),
            preflight: PreflightCheck::new(&settings.rules),
            deterministic,
            detector: OscillationDetector::new(),
            rescue: OscillationRescue::new(settings.rules.required_sections.clone()),
            settings,
            collaborators,
        }
    }

    pub fn settings(&self) -> &ReviewSettings {
        &self.settings
    }

    pub async fn process(&self, document_id: &str, text: &str) -> ReviewOutcome {
        self.process_with(document_id, text, FixMemory::new(), &CancellationToken::new())
            .await
    }

    /// Process one document starting from `memory`, stopping early when
    /// `cancel` fires or the configured timeout elapses.
    pub async fn process_with(
        &self,
        document_id: &str,
        text: &str,
        memory: FixMemory,
        cancel: &CancellationToken,
    ) -> ReviewOutcome {
        let started = Instant::now();
        let token = cancel.child_token();
        let timer = self.settings.timeout.map(|timeout| {
            let guard = token.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = tokio::time::sleep(timeout) => guard.cancel(),
                    _ = guard.cancelled() => {}
                }
            })
        });

        let mut state = ReviewState::new(document_id, text, self.settings.effective_max_iterations());
        let mut ctx = RunContext {
            memory,
            validated_text: None,
            per_kind: BTreeMap::new(),
            best: None,
            rescue_attempted: false,
            oscillation_baseline: 0,
            oscillation: None,
            analytics: DocumentAnalytics::new(document_id, self.settings.profile),
        };

        tracing::info!(
            document = document_id,
            max_iterations = state.max_iterations,
            profile = %self.settings.profile,
            "starting review"
        );

        let mut step = Step::PreFlight;
        while step != Step::Done {
            let transition = if token.is_cancelled() {
                self.interrupted(&state, step, cancel)
            } else {
                match step {
                    Step::PreFlight => self.pre_flight(&state),
                    Step::InitialReview => self.initial_review(&state, &token, cancel).await,
                    Step::RunValidators => {
                        self.run_validators(&state, &mut ctx, &token, cancel).await
                    }
                    Step::Decide => self.decide(&state, &mut ctx),
                    Step::Fix => self.fix(&state, &mut ctx, &token, cancel).await,
                    Step::TryOscillationRescue => self.try_rescue(&state, &mut ctx),
                    Step::QaVerify => self.qa_verify(&state, &mut ctx, &token, cancel).await,
                    Step::SummarizeFailures => {
                        self.summarize_failures(&state, &token, cancel).await
                    }
                    Step::Done => break,
                }
            };

            tracing::debug!(
                document = document_id,
                iteration = state.iteration,
                node = %step,
                next = %transition.next,
                "{}",
                transition.update.entry.message
            );
            if let Err(e) = state.apply(transition.update) {
                tracing::error!(document = document_id, node = %step, error = %e, "state update refused");
                break;
            }
            step = transition.next;
        }

        if let Some(timer) = timer {
            timer.abort();
        }
        self.finish(state, ctx, started)
    }

    fn finish(&self, state: ReviewState, ctx: RunContext, started: Instant) -> ReviewOutcome {
        let clean = state.completed && state.error.is_none() && !state.requires_human_review;
        let (final_text, issues) = match (clean, ctx.best) {
            (true, _) => (state.current_text.clone(), state.issues.clone()),
            (false, Some(best)) => (best.text, best.issues),
            (false, None) => (state.original_text.clone(), state.issues.clone()),
        };
        let changed = final_text != state.original_text;

        let mut analytics = ctx.analytics;
        analytics.duration = started.elapsed();
        analytics.iterations = state.iteration;
        analytics.final_issue_count = issues.len();
        analytics.qa_passed = state.qa_passed;
        analytics.error = state.error.clone();
        analytics.requires_human_review = state.requires_human_review;
        analytics.trend = state.issue_history.trend();

        tracing::info!(
            document = %state.document_id,
            iterations = state.iteration,
            changed,
            requires_human_review = state.requires_human_review,
            error = state.error.as_deref().unwrap_or(""),
            "review finished"
        );

        ReviewOutcome {
            document_id: state.document_id,
            final_text,
            changed,
            iterations: state.iteration,
            issues,
            error: state.error,
            requires_human_review: state.requires_human_review,
            qa_passed: state.qa_passed,
            history: state.history,
            fix_attempts: state.fix_attempts,
            failure_report: state.failure_report,
            analytics,
            memory: ctx.memory,
        }
    }

    fn entry(&self, state: &ReviewState, node: Step, message: impl Into<String>) -> HistoryEntry {
        HistoryEntry::new(state.iteration, node, message)
    }

    fn interrupted(&self, state: &ReviewState, step: Step, cancel: &CancellationToken) -> Transition {
        let reason = if cancel.is_cancelled() {
            "cancelled"
        } else {
            "timed out"
        };
        tracing::warn!(document = %state.document_id, node = %step, reason, "review interrupted");
        Transition::to(
            Step::Done,
            StateUpdate::new(self.entry(state, step, format!("Run {reason} during {step}")))
                .error(reason),
        )
    }

    /// Map a collaborator failure to a terminal transition. Failures other
    /// than cancellation still pass through `Decide` so the stop is recorded.
    fn failed(
        &self,
        state: &ReviewState,
        step: Step,
        err: CollaboratorError,
        cancel: &CancellationToken,
    ) -> Transition {
        let update = StateUpdate::new(self.entry(state, step, format!("Collaborator failure: {err}")))
            .error(err.to_string());
        match err {
            CollaboratorError::Cancelled { .. } => self.interrupted(state, step, cancel),
            CollaboratorError::Schema { .. } => {
                tracing::error!(document = %state.document_id, node = %step, error = %err, "invalid collaborator output");
                Transition::to(Step::Decide, update.human_review())
            }
            CollaboratorError::Transient { .. } => {
                tracing::error!(document = %state.document_id, node = %step, error = %err, "collaborator unavailable");
                Transition::to(Step::Decide, update)
            }
        }
    }

    fn pre_flight(&self, state: &ReviewState) -> Transition {
        let problems = self.preflight.check(&state.current_text);
        if problems.is_empty() {
            return Transition::to(
                Step::InitialReview,
                StateUpdate::new(self.entry(state, Step::PreFlight, "Pre-flight checks passed")),
            );
        }
        let reasons: Vec<&str> = problems.iter().map(|p| p.message.as_str()).collect();
        let message = format!("Pre-flight check failed: {}", reasons.join("; "));
        tracing::warn!(document = %state.document_id, "{message}");
        Transition::to(
            Step::SummarizeFailures,
            StateUpdate::new(self.entry(state, Step::PreFlight, message))
                .issues(problems)
                .human_review(),
        )
    }

    async fn initial_review(
        &self,
        state: &ReviewState,
        token: &CancellationToken,
        cancel: &CancellationToken,
    ) -> Transition {
        let reviewer = match &self.collaborators.initial_reviewer {
            Some(reviewer) if self.settings.profile.runs_initial_review() => reviewer,
            _ => {
                return Transition::to(
                    Step::RunValidators,
                    StateUpdate::new(self.entry(state, Step::InitialReview, "Initial review skipped")),
                );
            }
        };

        let current = state.current_text.as_str();
        let output = match self
            .settings
            .retry
            .execute(reviewer.name(), token, || reviewer.review(current))
            .await
        {
            Ok(output) => output,
            Err(e) => return self.failed(state, Step::InitialReview, e, cancel),
        };

        if !output.changed || output.revised_text == current {
            return Transition::to(
                Step::RunValidators,
                StateUpdate::new(self.entry(state, Step::InitialReview, "Initial review made no changes")),
            );
        }
        let update = match self.gate.check(current, &output.revised_text) {
            GateVerdict::Accepted { text, spliced } => StateUpdate::new(self.entry(
                state,
                Step::InitialReview,
                with_spliced(
                    format!("Initial review applied {} fix(es)", output.fixes_applied.len()),
                    &spliced,
                ),
            ))
            .text(text),
            GateVerdict::Rejected(reason) => StateUpdate::new(self.entry(
                state,
                Step::InitialReview,
                format!("Initial review edit rejected by validation gate: {reason}"),
            )),
        };
        Transition::to(Step::RunValidators, update)
    }

    async fn run_selected(
        &self,
        selected: Vec<Arc<dyn Validator>>,
        text: &str,
        token: &CancellationToken,
    ) -> Result<Vec<(ValidatorKind, Vec<Issue>)>, CollaboratorError> {
        let retry = &self.settings.retry;
        let run_one = |validator: Arc<dyn Validator>| async move {
            let issues = retry
                .execute(validator.name(), token, || validator.validate(text))
                .await?;
            Ok::<_, CollaboratorError>((validator.kind(), issues))
        };

        if self.settings.parallel_validators {
            try_join_all(selected.into_iter().map(run_one)).await
        } else {
            let mut results = Vec::with_capacity(selected.len());
            for validator in selected {
                results.push(run_one(validator).await?);
            }
            Ok(results)
        }
    }

    async fn run_validators(
        &self,
        state: &ReviewState,
        ctx: &mut RunContext,
        token: &CancellationToken,
        cancel: &CancellationToken,
    ) -> Transition {
        if state.iteration >= state.max_iterations {
            return Transition::to(
                Step::Decide,
                StateUpdate::new(self.entry(state, Step::RunValidators, "Iteration budget exhausted")),
            );
        }

        let selection = self
            .selector
            .select(ctx.validated_text.as_deref(), &state.current_text);
        let selected: Vec<Arc<dyn Validator>> = self
            .collaborators
            .validators
            .iter()
            .filter(|v| selection.kinds.contains(&v.kind()))
            .cloned()
            .collect();

        let results = match self.run_selected(selected, &state.current_text, token).await {
            Ok(results) => results,
            Err(e) => return self.failed(state, Step::RunValidators, e, cancel),
        };

        let mut per_kind = ctx.per_kind.clone();
        for kind in &selection.kinds {
            per_kind.remove(kind);
        }
        for (kind, issues) in results {
            per_kind.entry(kind).or_default().extend(issues);
        }
        let issues = dedup_issues(per_kind.values().flatten().cloned().collect());
        ctx.per_kind = per_kind;
        ctx.validated_text = Some(state.current_text.clone());

        let iteration = state.iteration + 1;
        let counts = IssueCounts::from_issues(&issues);
        ctx.record_best(counts, &state.current_text, &issues);
        ctx.analytics
            .record_iteration(iteration, &selection.kinds, &issues);

        tracing::info!(
            document = %state.document_id,
            iteration,
            issues = %counts,
            validators = selection.kinds.len(),
            "validation pass complete"
        );

        let entry = HistoryEntry::new(
            iteration,
            Step::RunValidators,
            format!(
                "Validation pass {iteration}: {} issue(s) ({counts}); {}",
                issues.len(),
                selection.reason
            ),
        )
        .with_issues_after(counts);
        let update = StateUpdate::new(entry)
            .validation_pass(signatures(&issues))
            .issues(issues);
        Transition::to(Step::Decide, update)
    }

    fn decide(&self, state: &ReviewState, ctx: &mut RunContext) -> Transition {
        if let Some(error) = &state.error {
            // The state is frozen; only a stopping decision can be recorded.
            let outcome = decide(
                &DecisionContext::new(state.iteration, state.max_iterations)
                    .with_error(error.clone()),
            );
            ctx.analytics.record_decision(outcome.decision);
            tracing::info!(
                document = %state.document_id,
                iteration = state.iteration,
                decision = %outcome.decision,
                rule = ?outcome.rule,
                "{}",
                outcome.reason
            );
            return Transition::to(
                Step::Done,
                StateUpdate::new(
                    self.entry(state, Step::Decide, outcome.reason)
                        .with_decision(outcome.decision),
                ),
            );
        }

        let oscillation = self
            .detector
            .detect_from(state.issue_history.snapshots(), ctx.oscillation_baseline);
        let decision_ctx = DecisionContext::new(state.iteration, state.max_iterations)
            .with_issues(state.issues.clone())
            .with_human_review(state.requires_human_review)
            .with_completed(state.completed)
            .with_qa(state.qa_passed)
            .with_oscillation(oscillation.clone())
            .with_mode(self.settings.completion_mode)
            .with_thresholds(self.settings.thresholds());

        let outcome = decide(&decision_ctx);
        ctx.analytics.record_decision(outcome.decision);

        let mut message = outcome.reason.clone();
        let next = match outcome.decision {
            Decision::Continue => Step::Fix,
            Decision::QaVerify => Step::QaVerify,
            Decision::SummarizeFailures
                if outcome.rule == DecisionRule::Oscillation
                    && !ctx.rescue_attempted
                    && state.iteration < state.max_iterations =>
            {
                message.push_str(" - attempting oscillation rescue");
                ctx.oscillation = oscillation;
                Step::TryOscillationRescue
            }
            Decision::SummarizeFailures => Step::SummarizeFailures,
            Decision::Done => Step::Done,
        };

        tracing::info!(
            document = %state.document_id,
            iteration = state.iteration,
            decision = %outcome.decision,
            rule = ?outcome.rule,
            "{}",
            outcome.reason
        );

        let mut update = StateUpdate::new(
            self.entry(state, Step::Decide, message)
                .with_decision(outcome.decision),
        );
        if next == Step::Done && state.error.is_none() {
            update = update.completed();
        }
        Transition::to(next, update)
    }

    async fn fix(
        &self,
        state: &ReviewState,
        ctx: &mut RunContext,
        token: &CancellationToken,
        cancel: &CancellationToken,
    ) -> Transition {
        let iteration = state.iteration;
        let prior = state.current_text.as_str();
        let memory_before = ctx.memory.clone();
        let targeted: Vec<String> = state.issues.iter().map(Issue::signature).collect();

        let deterministic = async { self.deterministic.fix(prior, &state.issues) };
        let references = async {
            match &self.collaborators.reference_resolver {
                Some(resolver) => Some(
                    self.settings
                        .retry
                        .execute(resolver.name(), token, || resolver.resolve(prior))
                        .await,
                ),
                None => None,
            }
        };
        let (det, references) = tokio::join!(deterministic, references);

        let mut notes = Vec::new();
        let mut fixes_applied = Vec::new();
        match references {
            Some(Ok(created)) => {
                if !created.is_empty() {
                    notes.push(format!("Created {} referenced resource(s)", created.len()));
                }
                fixes_applied.extend(created);
            }
            Some(Err(CollaboratorError::Cancelled { .. })) => {
                return self.interrupted(state, Step::Fix, cancel);
            }
            Some(Err(e)) => {
                tracing::warn!(document = %state.document_id, error = %e, "reference resolution failed");
                notes.push(format!("Reference resolution failed: {e}"));
            }
            None => {}
        }

        let mut text = prior.to_string();
        let mut rejected = false;
        let mut fresh = Vec::new();
        let resolved = det.resolved_count();
        let remaining = if det.changed {
            match self.gate.check(&text, &det.text) {
                GateVerdict::Accepted {
                    text: accepted,
                    spliced,
                } => {
                    fresh =
                        remember(&mut ctx.memory, &text, &accepted, iteration, &det.fixes_applied);
                    notes.push(with_spliced(
                        format!("Deterministic fixer resolved {resolved} issue(s)"),
                        &spliced,
                    ));
                    fixes_applied.extend(det.fixes_applied);
                    text = accepted;
                    det.remaining
                }
                GateVerdict::Rejected(reason) => {
                    rejected = true;
                    notes.push(format!(
                        "Deterministic fix rejected by validation gate: {reason}"
                    ));
                    state.issues.clone()
                }
            }
        } else {
            det.remaining
        };

        if !remaining.is_empty() {
            let fixer = &self.collaborators.fixer;
            let context = FixContext {
                iteration,
                max_iterations: state.max_iterations,
                memory_context: ctx.memory.context_for_fixer(iteration),
                memory_summary: ctx.memory.summary(),
                attempts: state.fix_attempts.clone(),
            };
            let current = text.as_str();
            let output = match self
                .settings
                .retry
                .execute(fixer.name(), token, || fixer.fix(current, &remaining, &context))
                .await
            {
                Ok(output) => output,
                Err(e) => {
                    ctx.memory = memory_before;
                    return self.failed(state, Step::Fix, e, cancel);
                }
            };

            if output.changed && output.revised_text != text {
                match self.gate.check(&text, &output.revised_text) {
                    GateVerdict::Accepted {
                        text: candidate,
                        spliced,
                    } => {
                        let regressions =
                            introduced_regressions(&ctx.memory, &text, &candidate, iteration, &fresh);
                        if !regressions.is_empty() {
                            ctx.memory = memory_before;
                            let detail: Vec<String> =
                                regressions.iter().map(ToString::to_string).collect();
                            tracing::warn!(
                                document = %state.document_id,
                                iteration,
                                regressions = regressions.len(),
                                "fix attempt reverted"
                            );
                            let attempt = FixAttempt {
                                iteration,
                                issues_targeted: targeted.clone(),
                                fixes_applied: output.fixes_applied,
                                result: FixResult::Reverted,
                                issues_remaining: targeted,
                            };
                            return Transition::to(
                                Step::Decide,
                                StateUpdate::new(self.entry(
                                    state,
                                    Step::Fix,
                                    format!(
                                        "Regression detected, reverting fix attempt: {}",
                                        detail.join("; ")
                                    ),
                                ))
                                .human_review()
                                .attempt(attempt),
                            );
                        }
                        remember(
                            &mut ctx.memory,
                            &text,
                            &candidate,
                            iteration,
                            &output.fixes_applied,
                        );
                        notes.push(with_spliced(
                            format!(
                                "{} applied {} fix(es)",
                                fixer.name(),
                                output.fixes_applied.len()
                            ),
                            &spliced,
                        ));
                        fixes_applied.extend(output.fixes_applied);
                        text = candidate;
                    }
                    GateVerdict::Rejected(reason) => {
                        rejected = true;
                        notes.push(format!(
                            "{} edit rejected by validation gate: {reason}",
                            fixer.name()
                        ));
                    }
                }
            }
        }

        let remaining_signatures: Vec<String> = remaining.iter().map(Issue::signature).collect();
        if text == prior {
            let attempt = FixAttempt {
                iteration,
                issues_targeted: targeted,
                fixes_applied,
                result: FixResult::Failed,
                issues_remaining: remaining_signatures,
            };
            if rejected {
                notes.push("keeping prior snapshot".to_string());
                return Transition::to(
                    Step::RunValidators,
                    StateUpdate::new(self.entry(state, Step::Fix, notes.join("; "))).attempt(attempt),
                );
            }
            notes.push(format!(
                "Fixers could not apply changes for {} issue(s)",
                state.issues.len()
            ));
            return Transition::to(
                Step::Decide,
                StateUpdate::new(self.entry(state, Step::Fix, notes.join("; ")))
                    .human_review()
                    .attempt(attempt),
            );
        }

        let attempt = FixAttempt {
            iteration,
            issues_targeted: targeted,
            fixes_applied,
            result: if rejected {
                FixResult::Partial
            } else {
                FixResult::Success
            },
            issues_remaining: remaining_signatures,
        };
        Transition::to(
            Step::RunValidators,
            StateUpdate::new(self.entry(state, Step::Fix, notes.join("; ")))
                .text(text)
                .qa(None)
                .attempt(attempt),
        )
    }

    fn try_rescue(&self, state: &ReviewState, ctx: &mut RunContext) -> Transition {
        ctx.rescue_attempted = true;
        let Some(report) = ctx.oscillation.take() else {
            return Transition::to(
                Step::SummarizeFailures,
                StateUpdate::new(self.entry(
                    state,
                    Step::TryOscillationRescue,
                    "No oscillation report to act on",
                )),
            );
        };

        let outcome = self
            .rescue
            .apply(&state.current_text, &report, &state.issues, &ctx.memory);
        if !outcome.changed {
            return Transition::to(
                Step::SummarizeFailures,
                StateUpdate::new(self.entry(
                    state,
                    Step::TryOscillationRescue,
                    "Oscillation rescue found nothing to change",
                )),
            );
        }

        match self.gate.check(&state.current_text, &outcome.text) {
            GateVerdict::Accepted { text, .. } => {
                ctx.oscillation_baseline = state.issue_history.len();
                tracing::info!(document = %state.document_id, actions = ?outcome.actions, "oscillation rescue applied");
                Transition::to(
                    Step::RunValidators,
                    StateUpdate::new(self.entry(
                        state,
                        Step::TryOscillationRescue,
                        format!("Oscillation rescue applied: {}", outcome.actions.join("; ")),
                    ))
                    .text(text)
                    .qa(None),
                )
            }
            GateVerdict::Rejected(reason) => Transition::to(
                Step::SummarizeFailures,
                StateUpdate::new(self.entry(
                    state,
                    Step::TryOscillationRescue,
                    format!("Oscillation rescue rejected by validation gate: {reason}"),
                )),
            ),
        }
    }

    async fn qa_verify(
        &self,
        state: &ReviewState,
        ctx: &mut RunContext,
        token: &CancellationToken,
        cancel: &CancellationToken,
    ) -> Transition {
        let qa = &self.collaborators.qa;
        let request = QaRequest {
            document: &state.current_text,
            iteration: state.iteration,
            issues: &state.issues,
            issue_history: state.issue_history.snapshots(),
        };
        let verdict = match self
            .settings
            .retry
            .execute(qa.name(), token, || qa.verify(request))
            .await
        {
            Ok(verdict) => verdict,
            Err(e) => return self.failed(state, Step::QaVerify, e, cancel),
        };
        ctx.analytics
            .record_qa(state.iteration, verdict.acceptable, &verdict.summary);

        let update = if verdict.acceptable {
            StateUpdate::new(self.entry(
                state,
                Step::QaVerify,
                format!("QA verification passed: {}", verdict.summary),
            ))
            .qa(Some(true))
        } else {
            let mut issues = state.issues.clone();
            issues.extend(verdict.problems);
            let issues = dedup_issues(issues);
            let counts = IssueCounts::from_issues(&issues);
            StateUpdate::new(
                self.entry(
                    state,
                    Step::QaVerify,
                    format!("QA verification failed: {}", verdict.summary),
                )
                .with_issues_after(counts),
            )
            .qa(Some(false))
            .issues(issues)
        };
        Transition::to(Step::Decide, update)
    }

    async fn summarize_failures(
        &self,
        state: &ReviewState,
        token: &CancellationToken,
        cancel: &CancellationToken,
    ) -> Transition {
        let summarizer = &self.collaborators.summarizer;
        let report = match self
            .settings
            .retry
            .execute(summarizer.name(), token, || {
                summarizer.summarize(&state.current_text, &state.history, &state.issues)
            })
            .await
        {
            Ok(report) => report,
            Err(CollaboratorError::Cancelled { .. }) => {
                return self.interrupted(state, Step::SummarizeFailures, cancel);
            }
            Err(e) => {
                tracing::warn!(
                    document = %state.document_id,
                    error = %e,
                    "failure summarizer unavailable, using local summary"
                );
                LocalSummarizer.report(&state.history, &state.issues)
            }
        };

        let message = format!(
            "Failure summary by {}: {}",
            report.produced_by, report.summary
        );
        Transition::to(
            Step::Done,
            StateUpdate::new(self.entry(state, Step::SummarizeFailures, message))
                .human_review()
                .completed()
                .report(report),
        )
    }
}

fn with_spliced(message: String, spliced: &[String]) -> String {
    if spliced.is_empty() {
        message
    } else {
        format!("{message} (restored sections: {})", spliced.join(", "))
    }
}

/// Record header fields that differ between `before` and `after`.
/// Returns the header fields newly marked as fixed.
fn remember(
    memory: &mut FixMemory,
    before: &str,
    after: &str,
    iteration: u32,
    fixes: &[String],
) -> Vec<String> {
    let before = ParsedDocument::parse(before).snapshot();
    let after = ParsedDocument::parse(after).snapshot();
    let fields = memory.extract_fixes(&before, &after, iteration, fixes);
    if !fields.is_empty() {
        tracing::debug!(iteration, fields = ?fields, "remembered header fixes");
    }
    fields
}

/// Regressions present in `candidate` that were not already present in `prior`.
///
/// `fresh` names fields fixed earlier in the same step; `candidate` may not
/// change those either, since memory refuses a same-iteration overwrite.
fn introduced_regressions(
    memory: &FixMemory,
    prior: &str,
    candidate: &str,
    iteration: u32,
    fresh: &[String],
) -> Vec<Regression> {
    let existing: BTreeSet<String> = memory
        .detect_regressions(&ParsedDocument::parse(prior).snapshot(), iteration)
        .into_iter()
        .map(|r| r.field_path)
        .collect();
    let snapshot = ParsedDocument::parse(candidate).snapshot();
    let mut regressions: Vec<Regression> = memory
        .detect_regressions(&snapshot, iteration)
        .into_iter()
        .filter(|r| !existing.contains(&r.field_path))
        .collect();
    regressions.extend(memory.detect_overwrites(&snapshot, fresh, iteration));
    regressions
}
