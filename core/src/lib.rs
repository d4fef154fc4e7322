pub mod agent;
pub mod artifact;
pub mod command;
pub mod config;
pub mod error;
pub mod extract;
pub mod llm;
pub mod scenario;
pub mod schema;
pub mod tools;

pub use agent::{AgentLoop, AgentTask, InvocationStatus, ToolInvocation, Transcript};
pub use artifact::{
    copy_files_for_eval, sanitize_filename, ArtifactKind, GeneratedArtifact, ScenarioReport,
    WorkingDirectory,
};
pub use command::{truncate_output, CommandResult, CommandRunner, RawOutput, TRUNCATION_MARKER};
pub use config::{AgentConfig, Binaries, ConfigFile, LlmSection, LlmSettings, LoadOptions};
pub use error::{AgentError, ConfigError, LlmError, ScenarioError, ToolError};
pub use extract::{extract_code, CodeKind, Extraction};
pub use llm::{
    ChatMessage, OpenAiClient, Planner, PlannerAction, PlannerRequest, TextCompletion, ToolCall,
};
pub use scenario::{
    build_report, ReportPolicy, ScenarioInputs, ScenarioKind, ScenarioOutcome, ScenarioRunner,
    ScenarioState,
};
pub use schema::{
    builtin_tool_descriptors, builtin_tool_schema_bundle, validate_arguments, Diagnostic,
    DiagnosticLevel, ToolDescriptor, ToolKind, ToolSchemaBundle,
};
pub use tools::{EvaluationResult, Tool, ToolContext, ToolSet};
