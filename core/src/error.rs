use std::path::PathBuf;

/// Failures raised by a single tool invocation.
///
/// External-process failures of the kubectl and playbook runners are not
/// errors; they come back as data so the planner can react to them.
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("{0}")]
    Precondition(String),
    #[error("{0}")]
    Validation(String),
    #[error("failed to run `{command}` command; error details:\nSTDOUT: {stdout}\nSTDERR: {stderr}")]
    Evaluation {
        command: String,
        stdout: String,
        stderr: String,
    },
    #[error("`{command}` did not finish within {seconds}s")]
    Timeout { command: String, seconds: u64 },
    #[error("failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{action} {path:?}: {source}")]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("text completion failed: {0}")]
    Completion(#[from] LlmError),
}

impl ToolError {
    pub(crate) fn io(action: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        ToolError::Io {
            action,
            path: path.into(),
            source,
        }
    }
}

/// Failures talking to the external language model.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("network error: {0}")]
    Network(String),
    #[error("api error (status {status}): {message}")]
    Api { status: u16, message: String },
    #[error("authentication failed")]
    AuthenticationFailed,
    #[error("rate limited")]
    RateLimited,
    #[error("failed to parse response: {0}")]
    Parse(String),
    #[error("{0}")]
    Other(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("could not read config file `{path}`: {source}")]
    ReadFile {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("could not parse config file `{path}`: {source}")]
    ParseFile {
        path: PathBuf,
        source: serde_yaml::Error,
    },
    #[error("invalid value for `{key}`: `{value}`")]
    InvalidValue { key: String, value: String },
}

/// Failures of one end-to-end scenario run.
#[derive(Debug, thiserror::Error)]
pub enum ScenarioError {
    #[error("failed to prepare working directory: {0}")]
    Setup(String),
    #[error("agent run failed: {0}")]
    Agent(#[from] AgentError),
    #[error("crew agent returned an empty string.")]
    EmptyAnswer,
    #[error("crew agent returned an invalid string. This is the actual output: {raw}")]
    InvalidAnswer { raw: String },
    #[error("Failed to parse this as JSON: {raw}")]
    ReportParse {
        raw: String,
        #[source]
        source: Option<serde_json::Error>,
    },
    #[error("failed to copy generated files for evaluation: {0}")]
    EvalCopy(#[source] std::io::Error),
}

/// Failures that abort the planning loop itself.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("planner failed: {0}")]
    Planner(#[from] LlmError),
    #[error("task '{task}' did not produce a final answer within {limit} iterations")]
    IterationLimit { task: String, limit: usize },
}
