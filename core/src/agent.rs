//! Drives the planner through a sequence of tasks, dispatching the tool
//! calls it asks for and recording what happened.

use crate::error::AgentError;
use crate::llm::{ChatMessage, Planner, PlannerAction, PlannerRequest, ToolCall};
use crate::tools::ToolSet;
use comfy_table::{presets::ASCII_FULL, Table};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fmt;
use std::time::Instant;
use time::{format_description::well_known::Rfc3339, OffsetDateTime};
use tracing::{debug, info, warn};

const PREVIEW_CHARS: usize = 80;

/// One step of a plan. Tasks run in order; each sees the previous answer.
pub struct AgentTask {
    pub name: String,
    pub description: String,
    pub expected_output: String,
    pub tools: ToolSet,
}

impl AgentTask {
    fn prompt(&self, context: Option<&str>) -> String {
        let mut prompt = format!(
            "{}\n\nThis is the expected criteria for your final answer: {}\nyou MUST return the actual complete content as the final answer, not a summary.",
            self.description.trim_end(),
            self.expected_output.trim_end()
        );
        if let Some(context) = context.filter(|text| !text.trim().is_empty()) {
            prompt.push_str("\n\nThis is the context you're working with:\n");
            prompt.push_str(context);
        }
        prompt
    }
}

pub struct AgentLoop<'p> {
    planner: &'p mut dyn Planner,
    goal: String,
    max_iterations: usize,
    transcript: Transcript,
}

impl<'p> AgentLoop<'p> {
    pub fn new(planner: &'p mut dyn Planner, goal: impl Into<String>, max_iterations: usize) -> Self {
        Self {
            planner,
            goal: goal.into(),
            max_iterations: max_iterations.max(1),
            transcript: Transcript::default(),
        }
    }

    /// Runs every task in order and returns the last task's final answer.
    pub fn run_plan(&mut self, tasks: &[AgentTask]) -> Result<String, AgentError> {
        let mut context: Option<String> = None;
        for task in tasks {
            let answer = self.run_task(task, context.as_deref())?;
            context = Some(answer);
        }
        Ok(context.unwrap_or_default())
    }

    pub fn run_task(&mut self, task: &AgentTask, context: Option<&str>) -> Result<String, AgentError> {
        info!(task = %task.name, tools = ?task.tools.kinds(), "starting task");
        let descriptors = task.tools.descriptors();
        let mut messages = vec![
            ChatMessage::system(format!("Your personal goal is: {}", self.goal)),
            ChatMessage::user(task.prompt(context)),
        ];

        for iteration in 1..=self.max_iterations {
            let request = PlannerRequest {
                messages: &messages,
                tools: &descriptors,
            };
            match self.planner.next_action(&request)? {
                PlannerAction::Finish(answer) => {
                    info!(task = %task.name, iteration, "task finished");
                    self.transcript.answers.push(TaskAnswer {
                        task: task.name.clone(),
                        answer: answer.clone(),
                    });
                    return Ok(answer);
                }
                PlannerAction::CallTools { thought, calls } => {
                    if let Some(thought) = &thought {
                        debug!(task = %task.name, %thought, "planner thought");
                    }
                    messages.push(ChatMessage::assistant_tool_calls(thought, calls.clone()));
                    for call in &calls {
                        let observation = self.dispatch(task, iteration, call);
                        messages.push(ChatMessage::tool_result(call.id.clone(), observation));
                    }
                }
            }
        }

        Err(AgentError::IterationLimit {
            task: task.name.clone(),
            limit: self.max_iterations,
        })
    }

    /// Every failure becomes an `{"error": ...}` observation; the planner
    /// decides what to do next.
    fn dispatch(&mut self, task: &AgentTask, iteration: usize, call: &ToolCall) -> String {
        let started_at = OffsetDateTime::now_utc()
            .format(&Rfc3339)
            .unwrap_or_else(|_| "unknown".to_string());
        let timer = Instant::now();

        let arguments = parse_arguments(&call.arguments);
        let (status, observation) = match (&arguments, task.tools.get(&call.name)) {
            (Err(err), _) => (
                InvocationStatus::Rejected,
                error_observation(format!("tool input is not valid JSON: {err}")),
            ),
            (Ok(_), None) => (
                InvocationStatus::Rejected,
                error_observation(format!(
                    "tool '{}' is not available for this task; available tools: {}",
                    call.name,
                    task.tools
                        .kinds()
                        .iter()
                        .map(|kind| kind.name())
                        .collect::<Vec<_>>()
                        .join(", ")
                )),
            ),
            (Ok(args), Some(tool)) => {
                info!(task = %task.name, tool = %tool.kind(), "tool call");
                match tool.invoke(args) {
                    Ok(Value::String(text)) => (InvocationStatus::Completed, text),
                    Ok(value) => (InvocationStatus::Completed, value.to_string()),
                    Err(err) => {
                        warn!(task = %task.name, tool = %tool.kind(), error = %err, "tool call failed");
                        (InvocationStatus::Failed, error_observation(err.to_string()))
                    }
                }
            }
        };

        self.transcript.invocations.push(ToolInvocation {
            task: task.name.clone(),
            iteration,
            tool: call.name.clone(),
            arguments: arguments.unwrap_or_else(|_| Value::String(call.arguments.clone())),
            status,
            observation: observation.clone(),
            started_at,
            duration_ms: timer.elapsed().as_millis() as u64,
        });
        observation
    }

    pub fn transcript(&self) -> &Transcript {
        &self.transcript
    }

    pub fn into_transcript(self) -> Transcript {
        self.transcript
    }
}

fn parse_arguments(raw: &str) -> Result<Value, serde_json::Error> {
    if raw.trim().is_empty() {
        return Ok(Value::Object(Map::new()));
    }
    serde_json::from_str(raw)
}

fn error_observation(message: String) -> String {
    json!({ "error": message }).to_string()
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum InvocationStatus {
    Completed,
    Failed,
    /// Never reached a tool: unknown name or unparsable input.
    Rejected,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub task: String,
    pub iteration: usize,
    pub tool: String,
    pub arguments: Value,
    pub status: InvocationStatus,
    pub observation: String,
    pub started_at: String,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskAnswer {
    pub task: String,
    pub answer: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Transcript {
    pub invocations: Vec<ToolInvocation>,
    pub answers: Vec<TaskAnswer>,
}

impl Transcript {
    pub fn has_failures(&self) -> bool {
        self.invocations
            .iter()
            .any(|call| call.status != InvocationStatus::Completed)
    }

    pub fn render_table(&self) -> String {
        let mut display = Table::new();
        display.load_preset(ASCII_FULL);
        display.set_header(vec!["task", "#", "tool", "status", "ms", "observation"]);
        for call in &self.invocations {
            display.add_row(vec![
                call.task.clone(),
                call.iteration.to_string(),
                call.tool.clone(),
                format!("{:?}", call.status),
                call.duration_ms.to_string(),
                preview(&call.observation),
            ]);
        }
        display.to_string()
    }
}

impl fmt::Display for Transcript {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.invocations.is_empty() {
            writeln!(f, "No tool calls.")?;
        } else {
            writeln!(f, "Tool calls:")?;
            for call in &self.invocations {
                let status = match call.status {
                    InvocationStatus::Completed => "completed",
                    InvocationStatus::Failed => "failed",
                    InvocationStatus::Rejected => "rejected",
                };
                writeln!(f, "  - [{}] {} ({})", status, call.tool, call.task)?;
                if call.status != InvocationStatus::Completed {
                    for line in call.observation.lines() {
                        writeln!(f, "      {}", line)?;
                    }
                }
            }
        }
        for answer in &self.answers {
            writeln!(f, "Final answer of {}: {}", answer.task, preview(&answer.answer))?;
        }
        Ok(())
    }
}

fn preview(text: &str) -> String {
    let flat = text.replace('\n', " ");
    match flat.char_indices().nth(PREVIEW_CHARS) {
        Some((idx, _)) => format!("{}...", &flat[..idx]),
        None => flat,
    }
}
