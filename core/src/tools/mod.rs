//! The closed set of tools the planner may call.

pub mod kubectl;
pub mod kyverno;
pub mod playbook;
pub mod rego;

use crate::artifact::WorkingDirectory;
use crate::command::CommandRunner;
use crate::config::{AgentConfig, Binaries};
use crate::error::ToolError;
use crate::llm::TextCompletion;
use crate::schema::{validate_arguments, ToolDescriptor, ToolKind};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::fs;
use std::sync::Arc;
use tracing::warn;

pub use kubectl::KubectlTool;
pub use kyverno::KyvernoGenerator;
pub use playbook::{PlaybookGenerator, PlaybookRunner};
pub use rego::{EvaluationResult, RegoEvaluator, RegoGenerator};

/// Characters of context data shown to the code-generation model.
pub const CONTEXT_CAP: usize = 1000;
pub const CONTEXT_TRUNCATION_NOTE: &str = "\n(original data is too long, so truncated here)";

/// Shared construction parameters for every tool of one scenario run.
#[derive(Clone)]
pub struct ToolContext {
    pub workdir: WorkingDirectory,
    pub runner: CommandRunner,
    pub binaries: Binaries,
    pub completion: Arc<dyn TextCompletion>,
    pub read_only: bool,
}

impl ToolContext {
    pub fn new(
        config: &AgentConfig,
        workdir: WorkingDirectory,
        completion: Arc<dyn TextCompletion>,
        read_only: bool,
    ) -> Self {
        Self {
            workdir,
            runner: CommandRunner::from_config(config),
            binaries: config.binaries.clone(),
            completion,
            read_only,
        }
    }
}

pub enum Tool {
    RunKubectl(KubectlTool),
    GenerateRego(RegoGenerator),
    RunRego(RegoEvaluator),
    GenerateKyverno(KyvernoGenerator),
    GeneratePlaybook(PlaybookGenerator),
    RunPlaybook(PlaybookRunner),
}

impl Tool {
    pub fn build(kind: ToolKind, ctx: &ToolContext) -> Self {
        match kind {
            ToolKind::RunKubectl => Tool::RunKubectl(KubectlTool::new(
                ctx.workdir.clone(),
                ctx.runner.clone(),
                ctx.binaries.kubectl.clone(),
                ctx.read_only,
            )),
            ToolKind::GenerateRego => Tool::GenerateRego(RegoGenerator::new(
                ctx.workdir.clone(),
                Arc::clone(&ctx.completion),
            )),
            ToolKind::RunRego => Tool::RunRego(RegoEvaluator::new(
                ctx.workdir.clone(),
                ctx.runner.clone(),
                ctx.binaries.opa.clone(),
            )),
            ToolKind::GenerateKyverno => Tool::GenerateKyverno(KyvernoGenerator::new(
                ctx.workdir.clone(),
                Arc::clone(&ctx.completion),
            )),
            ToolKind::GeneratePlaybook => Tool::GeneratePlaybook(PlaybookGenerator::new(
                ctx.workdir.clone(),
                Arc::clone(&ctx.completion),
            )),
            ToolKind::RunPlaybook => Tool::RunPlaybook(PlaybookRunner::new(
                ctx.workdir.clone(),
                ctx.runner.clone(),
                ctx.binaries.ansible_playbook.clone(),
            )),
        }
    }

    pub fn kind(&self) -> ToolKind {
        match self {
            Tool::RunKubectl(_) => ToolKind::RunKubectl,
            Tool::GenerateRego(_) => ToolKind::GenerateRego,
            Tool::RunRego(_) => ToolKind::RunRego,
            Tool::GenerateKyverno(_) => ToolKind::GenerateKyverno,
            Tool::GeneratePlaybook(_) => ToolKind::GeneratePlaybook,
            Tool::RunPlaybook(_) => ToolKind::RunPlaybook,
        }
    }

    pub fn descriptor(&self) -> ToolDescriptor {
        self.kind().descriptor()
    }

    /// Validates the named arguments against the tool's schema, then runs it.
    pub fn invoke(&self, args: &Value) -> Result<Value, ToolError> {
        let kind = self.kind();
        let mut errors = Vec::new();
        for diagnostic in validate_arguments(kind, args) {
            if diagnostic.is_error() {
                errors.push(diagnostic.to_string());
            } else {
                warn!(tool = %kind, "{diagnostic}");
            }
        }
        if !errors.is_empty() {
            return Err(ToolError::Precondition(format!(
                "invalid arguments for {kind}:\n{}",
                errors.join("\n")
            )));
        }

        match self {
            Tool::RunKubectl(tool) => tool.run(&parse_request(args)?),
            Tool::GenerateRego(tool) => tool.generate(&parse_request(args)?).map(Value::String),
            Tool::RunRego(tool) => {
                let result = tool.evaluate(&parse_request(args)?)?;
                serde_json::to_value(result)
                    .map_err(|err| ToolError::Validation(format!("unserializable result: {err}")))
            }
            Tool::GenerateKyverno(tool) => tool.generate(&parse_request(args)?).map(Value::String),
            Tool::GeneratePlaybook(tool) => {
                tool.generate(&parse_request(args)?).map(Value::String)
            }
            Tool::RunPlaybook(tool) => tool.run(&parse_request(args)?),
        }
    }
}

/// The tools offered to the planner for one task, in declaration order.
pub struct ToolSet {
    tools: Vec<Tool>,
}

impl ToolSet {
    pub fn new(kinds: &[ToolKind], ctx: &ToolContext) -> Self {
        Self {
            tools: kinds.iter().map(|kind| Tool::build(*kind, ctx)).collect(),
        }
    }

    pub fn empty() -> Self {
        Self { tools: Vec::new() }
    }

    pub fn descriptors(&self) -> Vec<ToolDescriptor> {
        self.tools.iter().map(Tool::descriptor).collect()
    }

    pub fn kinds(&self) -> Vec<ToolKind> {
        self.tools.iter().map(Tool::kind).collect()
    }

    pub fn get(&self, name: &str) -> Option<&Tool> {
        let kind = ToolKind::from_name(name)?;
        self.tools.iter().find(|tool| tool.kind() == kind)
    }
}

fn parse_request<T: DeserializeOwned>(args: &Value) -> Result<T, ToolError> {
    serde_json::from_value(args.clone())
        .map_err(|err| ToolError::Precondition(format!("invalid tool input: {err}")))
}

/// A requirement may arrive as free text or as a structured object.
pub(crate) fn requirement_text(sentence: &Value) -> String {
    match sentence {
        Value::String(text) => text.clone(),
        other => serde_json::to_string_pretty(other).unwrap_or_else(|_| other.to_string()),
    }
}

/// Reads a context file for a generation prompt, failing before any
/// completion call when it is missing.
pub(crate) fn read_context_file(
    workdir: &WorkingDirectory,
    file: &str,
    what: &str,
) -> Result<String, ToolError> {
    let path = workdir.resolve(file);
    if !path.exists() {
        return Err(ToolError::Precondition(format!(
            "{what} `{file}` is not found. This file must be prepared beforehand."
        )));
    }
    fs::read_to_string(&path).map_err(|source| ToolError::io("failed to read", path, source))
}

/// Caps context data at [`CONTEXT_CAP`] characters, noting the cut.
pub(crate) fn truncate_context(data: &str) -> (String, &'static str) {
    match data.char_indices().nth(CONTEXT_CAP) {
        Some((idx, _)) => (data[..idx].to_string(), CONTEXT_TRUNCATION_NOTE),
        None => (data.to_string(), ""),
    }
}


#[cfg(test)]
mod tests {
    use super::testing::CannedCompletion;
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    fn context(dir: &std::path::Path, read_only: bool) -> ToolContext {
        ToolContext {
            workdir: WorkingDirectory::create(dir).expect("workdir"),
            runner: CommandRunner::new(Some(Duration::from_secs(5)), 1000),
            binaries: Binaries::default(),
            completion: Arc::new(CannedCompletion::new(&[])),
            read_only,
        }
    }

    #[test]
    fn tool_set_looks_up_by_name() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ctx = context(dir.path(), true);
        let set = ToolSet::new(&[ToolKind::RunRego, ToolKind::RunKubectl], &ctx);
        assert_eq!(set.kinds(), vec![ToolKind::RunRego, ToolKind::RunKubectl]);
        assert!(set.get("RunKubectlTool").is_some());
        assert!(set.get("runoparegotool").is_some());
        assert!(set.get("GenerateKyvernoTool").is_none());
        assert_eq!(set.descriptors()[0].name, "RunOPARegoTool");
    }

    #[test]
    fn schema_errors_are_preconditions() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ctx = context(dir.path(), true);
        let tool = Tool::build(ToolKind::RunRego, &ctx);
        let err = tool
            .invoke(&json!({ "policy_file": "policy.rego" }))
            .expect_err("input_file missing");
        match err {
            ToolError::Precondition(message) => assert!(message.contains("input_file")),
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(tool.invoke(&json!("policy.rego")).is_err());
    }

    #[test]
    fn structured_requirement_is_pretty_printed() {
        let text = requirement_text(&json!({ "minimum": 2 }));
        assert_eq!(text, "{\n  \"minimum\": 2\n}");
        assert_eq!(requirement_text(&json!("plain")), "plain");
    }

    #[test]
    fn context_is_capped_with_note() {
        let (kept, note) = truncate_context(&"d".repeat(1200));
        assert_eq!(kept.len(), CONTEXT_CAP);
        assert_eq!(note, CONTEXT_TRUNCATION_NOTE);
        let (kept, note) = truncate_context("short");
        assert_eq!(kept, "short");
        assert!(note.is_empty());
    }
}
