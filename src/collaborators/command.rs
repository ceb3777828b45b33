//! Collaborators backed by an external agent command.
//!
//! The command receives a prompt on stdin and must print a JSON object on
//! stdout, either raw or inside a fenced code block. A spawn failure, a
//! timeout or a non-zero exit is reported as transient; output that holds
//! no usable JSON is a schema error.

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use super::{
    FailureReport, FailureSummarizer, FixContext, FixOutput, Fixer, InitialReviewer, QaRequest,
    QaVerdict, QaVerifier,
};
use crate::errors::CollaboratorError;
use crate::orchestrator::state::HistoryEntry;
use crate::review::issue::Issue;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentCommand {
    pub program: String,
    pub args: Vec<String>,
    pub timeout: Duration,
}

impl AgentCommand {
    pub fn new(program: impl Into<String>, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args,
            timeout,
        }
    }

    /// Run the command with `prompt` on stdin and return its stdout.
    pub async fn run(&self, label: &str, prompt: &str) -> Result<String, CollaboratorError> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            CollaboratorError::transient(label, format!("failed to spawn '{}': {e}", self.program))
        })?;

        if let Some(mut stdin) = child.stdin.take() {
            let written = async {
                stdin.write_all(prompt.as_bytes()).await?;
                stdin.shutdown().await
            }
            .await;
            if let Err(e) = written {
                tracing::debug!(collaborator = label, error = %e, "agent closed stdin early");
            }
        }

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| {
                CollaboratorError::transient(
                    label,
                    format!("timed out after {}s", self.timeout.as_secs_f64()),
                )
            })?
            .map_err(|e| CollaboratorError::transient(label, format!("failed to wait: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(CollaboratorError::transient(
                label,
                format!(
                    "exited with code {}: {}",
                    output.status.code().unwrap_or(-1),
                    stderr.trim()
                ),
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// One agent command acting as fixer, QA verifier, summarizer and initial
/// reviewer depending on the prompt it is sent.
#[derive(Debug, Clone)]
pub struct AgentCollaborator {
    command: AgentCommand,
}

impl AgentCollaborator {
    pub fn new(command: AgentCommand) -> Self {
        Self { command }
    }

    async fn ask<T: DeserializeOwned>(&self, label: &str, prompt: &str) -> Result<T, CollaboratorError> {
        let output = self.command.run(label, prompt).await?;
        parse_response(label, &output)
    }
}

/// Parse the JSON object embedded in an agent's output.
pub fn parse_response<T: DeserializeOwned>(label: &str, output: &str) -> Result<T, CollaboratorError> {
    let json = extract_json(output)
        .ok_or_else(|| CollaboratorError::schema(label, "no JSON object in output"))?;
    serde_json::from_str(&json).map_err(|e| CollaboratorError::schema(label, e.to_string()))
}

/// Extract JSON from output that may contain markdown or other text.
pub fn extract_json(output: &str) -> Option<String> {
    if let Some(start) = output.find("```json") {
        let after_marker = &output[start + 7..];
        if let Some(end) = after_marker.find("```") {
            return Some(after_marker[..end].trim().to_string());
        }
    }

    if let Some(start) = output.find("```") {
        let after_marker = &output[start + 3..];
        if let Some(end) = after_marker.find("```") {
            if let Some(json_start) = after_marker[..end].find('{') {
                return Some(after_marker[json_start..end].trim().to_string());
            }
        }
    }

    // Raw object: match braces, ignoring those inside strings.
    let start = output.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, c) in output[start..].char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(output[start..start + i + 1].to_string());
                }
            }
            _ => {}
        }
    }
    None
}

fn render_issues(issues: &[Issue]) -> String {
    if issues.is_empty() {
        return "(none)".to_string();
    }
    issues
        .iter()
        .map(|i| format!("- {i}"))
        .collect::<Vec<_>>()
        .join("\n")
}

fn to_json<T: Serialize>(value: &T) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| "[]".to_string())
}

fn fix_prompt(document: &str, issues: &[Issue], context: &FixContext) -> String {
    format!(
        r#"You are repairing a markdown document with a YAML header.
Iteration {iteration} of {max}.

Fix ONLY the issues listed below. Do not rewrite unrelated content and do not
remove sections.

## Issues
{issues}

{memory}

## Previous attempts
{attempts}

## Document
<<<DOCUMENT
{document}
DOCUMENT

Respond with a single JSON object:
{{"revised_text": "<full revised document>", "fixes_applied": ["..."], "changed": true}}
"#,
        iteration = context.iteration,
        max = context.max_iterations,
        issues = render_issues(issues),
        memory = context.memory_context,
        attempts = to_json(&context.attempts),
    )
}

fn qa_prompt(request: &QaRequest<'_>) -> String {
    format!(
        r#"You are the final quality gate for a repaired markdown document.
Iteration {iteration}. Remaining non-blocking issues:
{issues}

Issue signatures per iteration (oldest first):
{history}

Block if errors remain, the issue count grew in the last iteration, an issue
resolved earlier came back, timestamps are invalid, or required header
fields are missing. Warnings alone do not block.

## Document
<<<DOCUMENT
{document}
DOCUMENT

Respond with a single JSON object:
{{"acceptable": true, "problems": [{{"severity": "ERROR", "message": "..."}}], "summary": "..."}}
"#,
        iteration = request.iteration,
        issues = render_issues(request.issues),
        history = to_json(&request.issue_history),
        document = request.document,
    )
}

fn summary_prompt(document: &str, history: &[HistoryEntry], unresolved: &[Issue]) -> String {
    let trail = history
        .iter()
        .map(|h| format!("[Iteration {}] {}: {}", h.iteration, h.node, h.message))
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        r#"Automated repair of this document failed. Explain why for a human reviewer.

## Run history
{trail}

## Unresolved issues
{issues}

## Document
<<<DOCUMENT
{document}
DOCUMENT

Respond with a single JSON object:
{{"summary": "...", "root_causes": ["..."], "recommendations": ["..."]}}
"#,
        issues = render_issues(unresolved),
    )
}

fn review_prompt(document: &str) -> String {
    format!(
        r#"Review this markdown document for technical accuracy and clarity.
Make conservative corrections only. Keep every section and the YAML header.

<<<DOCUMENT
{document}
DOCUMENT

Respond with a single JSON object:
{{"revised_text": "<full revised document>", "fixes_applied": ["..."], "changed": true}}
"#
    )
}

fn check_fix_output(label: &str, output: FixOutput) -> Result<FixOutput, CollaboratorError> {
    if output.changed && output.revised_text.trim().is_empty() {
        return Err(CollaboratorError::schema(label, "changed is true but revised_text is empty"));
    }
    Ok(output)
}

#[async_trait]
impl Fixer for AgentCollaborator {
    fn name(&self) -> &str {
        "agent-fixer"
    }

    async fn fix(
        &self,
        document: &str,
        issues: &[Issue],
        context: &FixContext,
    ) -> Result<FixOutput, CollaboratorError> {
        let output = self
            .ask(Fixer::name(self), &fix_prompt(document, issues, context))
            .await?;
        check_fix_output(Fixer::name(self), output)
    }
}

#[async_trait]
impl QaVerifier for AgentCollaborator {
    fn name(&self) -> &str {
        "agent-qa"
    }

    async fn verify(&self, request: QaRequest<'_>) -> Result<QaVerdict, CollaboratorError> {
        self.ask(QaVerifier::name(self), &qa_prompt(&request)).await
    }
}

#[async_trait]
impl FailureSummarizer for AgentCollaborator {
    fn name(&self) -> &str {
        "agent-summarizer"
    }

    async fn summarize(
        &self,
        document: &str,
        history: &[HistoryEntry],
        unresolved: &[Issue],
    ) -> Result<FailureReport, CollaboratorError> {
        let mut report: FailureReport = self
            .ask(FailureSummarizer::name(self), &summary_prompt(document, history, unresolved))
            .await?;
        if report.unresolved.is_empty() {
            report.unresolved = unresolved.to_vec();
        }
        report.produced_by = FailureSummarizer::name(self).to_string();
        Ok(report)
    }
}

#[async_trait]
impl InitialReviewer for AgentCollaborator {
    fn name(&self) -> &str {
        "agent-reviewer"
    }

    async fn review(&self, document: &str) -> Result<FixOutput, CollaboratorError> {
        let output = self.ask(InitialReviewer::name(self), &review_prompt(document)).await?;
        check_fix_output(InitialReviewer::name(self), output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_json_from_fenced_block() {
        let output = "Here you go:\n```json\n{\"acceptable\": true}\n```\nDone.";
        assert_eq!(extract_json(output).unwrap(), "{\"acceptable\": true}");
    }

    #[test]
    fn test_extract_json_from_generic_fence() {
        let output = "```\n{\"a\": 1}\n```";
        assert_eq!(extract_json(output).unwrap(), "{\"a\": 1}");
    }

    #[test]
    fn test_extract_raw_json_with_braces_in_strings() {
        let output = r#"noise {"revised_text": "fn main() { }", "changed": true} trailing"#;
        assert_eq!(
            extract_json(output).unwrap(),
            r#"{"revised_text": "fn main() { }", "changed": true}"#
        );
    }

    #[test]
    fn test_extract_json_none_without_object() {
        assert!(extract_json("no json here").is_none());
        assert!(extract_json("{ unterminated").is_none());
    }

    #[test]
    fn test_parse_response_schema_errors() {
        let err = parse_response::<QaVerdict>("qa", "plain text").unwrap_err();
        assert!(err.is_schema());
        let err = parse_response::<QaVerdict>("qa", "{\"summary\": 3}").unwrap_err();
        assert!(err.is_schema());
        let verdict: QaVerdict =
            parse_response("qa", "{\"acceptable\": false, \"problems\": [{\"severity\": \"error\", \"message\": \"x\"}]}")
                .unwrap();
        assert!(!verdict.acceptable);
        assert_eq!(verdict.problems[0].message, "x");
    }

    #[test]
    fn test_fix_output_with_empty_text_is_rejected() {
        let out = FixOutput {
            revised_text: "  ".into(),
            fixes_applied: Vec::new(),
            changed: true,
        };
        assert!(check_fix_output("fixer", out).unwrap_err().is_schema());
    }

    #[test]
    fn test_fix_prompt_includes_issues_and_memory() {
        let context = FixContext {
            iteration: 2,
            max_iterations: 5,
            memory_context: "PREVIOUSLY FIXED".into(),
            ..FixContext::default()
        };
        let prompt = fix_prompt("doc", &[Issue::error("Missing required field 'title'")], &context);
        assert!(prompt.contains("Iteration 2 of 5"));
        assert!(prompt.contains("- [ERROR] Missing required field 'title'"));
        assert!(prompt.contains("PREVIOUSLY FIXED"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_agent_command_round_trip() {
        let command = AgentCommand::new(
            "sh",
            vec![
                "-c".into(),
                r#"cat > /dev/null; echo '{"revised_text": "new", "changed": true}'"#.into(),
            ],
            Duration::from_secs(10),
        );
        let agent = AgentCollaborator::new(command);
        let out = agent
            .fix("old", &[Issue::error("x")], &FixContext::default())
            .await
            .unwrap();
        assert_eq!(out.revised_text, "new");
        assert!(out.changed);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_each_role_reports_under_its_own_name() {
        let summarizer = AgentCollaborator::new(AgentCommand::new(
            "sh",
            vec![
                "-c".into(),
                r#"cat > /dev/null; echo '{"summary": "stuck on title"}'"#.into(),
            ],
            Duration::from_secs(10),
        ));
        let unresolved = vec![Issue::error("Missing required field 'title'")];
        let report = summarizer.summarize("doc", &[], &unresolved).await.unwrap();
        assert_eq!(report.produced_by, "agent-summarizer");
        assert_eq!(report.unresolved, unresolved);

        let failing = AgentCollaborator::new(AgentCommand::new(
            "sh",
            vec!["-c".into(), "cat > /dev/null; exit 2".into()],
            Duration::from_secs(10),
        ));
        let err = failing
            .fix("doc", &unresolved, &FixContext::default())
            .await
            .unwrap_err();
        assert!(err.to_string().starts_with("agent-fixer failed"));

        let request = QaRequest {
            document: "doc",
            iteration: 1,
            issues: &[],
            issue_history: &[],
        };
        let err = failing.verify(request).await.unwrap_err();
        assert!(err.to_string().starts_with("agent-qa failed"));

        let err = failing.review("doc").await.unwrap_err();
        assert!(err.to_string().starts_with("agent-reviewer failed"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_agent_command_failures_are_transient() {
        let failing = AgentCommand::new("sh", vec!["-c".into(), "exit 3".into()], Duration::from_secs(10));
        assert!(failing.run("fixer", "prompt").await.unwrap_err().is_transient());

        let slow = AgentCommand::new("sleep", vec!["5".into()], Duration::from_millis(100));
        assert!(slow.run("fixer", "prompt").await.unwrap_err().is_transient());

        let missing = AgentCommand::new("mender-no-such-binary", Vec::new(), Duration::from_secs(1));
        assert!(missing.run("fixer", "prompt").await.unwrap_err().is_transient());
    }
}
