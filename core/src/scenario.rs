use crate::agent::{AgentLoop, AgentTask, Transcript};
use crate::artifact::{copy_files_for_eval, ScenarioReport, WorkingDirectory};
use crate::config::AgentConfig;
use crate::error::ScenarioError;
use crate::extract::{extract_code, CodeKind};
use crate::llm::{Planner, TextCompletion};
use crate::schema::ToolKind;
use crate::tools::kubectl::KUBECONFIG_FILE;
use crate::tools::playbook::INVENTORY_FILE;
use crate::tools::{ToolContext, ToolSet};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

const KUBECTL_OPA_GOAL: &str = "I would like to check if the following condition is satisfied, given a Kubernetes cluster with `kubeconfig.yaml`
    ${compliance}

To check the condition, do the following steps.
- get related resource(s) on the cluster by kubectl command and save it as `collected_data.json`
- check if the conditions are satisfied by OPA Rego policy

for those steps, you need to create an OPA Rego policy `policy.rego`.
Also, save the kubectl command as `script.sh`.

If running the policy failed and if you can fix the issue, you will do it and try running again.

Once you get a final answer, you can quit the work.
";

const KYVERNO_GOAL: &str = "I would like to check if the following condition is satisfied, given a Kubernetes cluster with `kubeconfig.yaml`
    ${compliance}

To check the condition, do the following steps.
- deploy a Kyverno policy to the cluster
- check if the policy is correctly deployed.

If deploying the policy failed and if you can fix the issue, you will do it and try deploying again.
Once you get a final answer, you can quit the work.
";

const KYVERNO_UPDATE_GOAL: &str = "Currently, the following Kyverno policies are deployed in the Kubernetes cluster.
Review these existing policies and edit them to meet additional security requirements.
Please avoid creating new policy resources; instead, make the necessary changes directly to the existing resources.

${current_compliance}

However, the new internal security policy now requires the following additional conditions:

${updated_compliance}

Your task is to review the existing Kyverno policies and directly edit the existing policies to meet these new requirements.
Do not change the resource names. Once you have completed the edits, update the existing resources in the Kubernetes cluster.
Steps
- Get Kyverno policies and review them.
- Generate an updated Kyverno policy to meet the new requirements based on the current one. Ensure that you do not change the names of the resources.
- Apply the updated one to the cluster.

Once you get a final answer, you can quit the work.
";

const PLAYBOOK_OPA_GOAL: &str = "I would like to check if the following condition is satisfied, given a host name `rhel9_servers`
    ${compliance}

To check the condition, do the following steps.
- collect some required configuration to check the condition from the RHEL host and save it locally. you can use ansible-playbook to do that.
- check if the condition is met by using rego policy with the input given by the step above.

for those steps, you need to create ansible playbook `playbook.yml` and OPA rego policy `policy.rego`.
If you can fix the generated code, do it and run the fixed code again.

You can use the inventory file `inventory.ansible.ini` to access `rhel9_servers`.

Once you get a final answer, you can quit the work.
";

const REPORT_DESCRIPTION: &str = "Report filepaths that are created in the previous task.
You must not replay the steps in the previous task such as generating code / running something.
Just to report the result.
";

const CHECK_TASK: &str =
    "Check a rego policy for a given input file. If policy or input file are not ready, prepare them first.";
const CHECK_OUTPUT: &str = "A boolean which indicates if the check is passed or not";

/// What happens when the final answer is not a JSON object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportPolicy {
    /// Fail the run, surfacing the raw text.
    Strict,
    /// Log and continue with an empty report.
    Lenient,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ScenarioKind {
    KubectlOpa,
    Kyverno,
    KyvernoUpdate,
    PlaybookOpa,
}

impl ScenarioKind {
    pub fn name(&self) -> &'static str {
        match self {
            ScenarioKind::KubectlOpa => "kubectl-opa",
            ScenarioKind::Kyverno => "kyverno",
            ScenarioKind::KyvernoUpdate => "kyverno-update",
            ScenarioKind::PlaybookOpa => "playbook-opa",
        }
    }

    pub fn tools(&self) -> &'static [ToolKind] {
        match self {
            ScenarioKind::KubectlOpa => &[ToolKind::RunRego, ToolKind::GenerateRego, ToolKind::RunKubectl],
            ScenarioKind::Kyverno | ScenarioKind::KyvernoUpdate => {
                &[ToolKind::RunKubectl, ToolKind::GenerateKyverno]
            }
            ScenarioKind::PlaybookOpa => &[
                ToolKind::RunRego,
                ToolKind::GenerateRego,
                ToolKind::RunPlaybook,
                ToolKind::GeneratePlaybook,
            ],
        }
    }

    /// Whether kubectl is limited to `get`.
    pub fn read_only(&self) -> bool {
        matches!(self, ScenarioKind::KubectlOpa)
    }

    /// Conventional name the caller's credential material is copied to.
    pub fn credential_file(&self) -> &'static str {
        match self {
            ScenarioKind::PlaybookOpa => INVENTORY_FILE,
            _ => KUBECONFIG_FILE,
        }
    }

    pub fn report_policy(&self) -> ReportPolicy {
        match self {
            ScenarioKind::KubectlOpa | ScenarioKind::PlaybookOpa => ReportPolicy::Strict,
            ScenarioKind::Kyverno | ScenarioKind::KyvernoUpdate => ReportPolicy::Lenient,
        }
    }

    pub fn copies_for_eval(&self) -> bool {
        matches!(self, ScenarioKind::KubectlOpa)
    }

    pub fn goal(&self, inputs: &ScenarioInputs) -> Result<String, ScenarioError> {
        let goal = match self {
            ScenarioKind::KubectlOpa => KUBECTL_OPA_GOAL.replace("${compliance}", &inputs.compliance),
            ScenarioKind::Kyverno => KYVERNO_GOAL.replace("${compliance}", &inputs.compliance),
            ScenarioKind::PlaybookOpa => {
                PLAYBOOK_OPA_GOAL.replace("${compliance}", &inputs.compliance)
            }
            ScenarioKind::KyvernoUpdate => {
                let updated = inputs
                    .updated_compliance
                    .as_deref()
                    .filter(|text| !text.trim().is_empty())
                    .ok_or_else(|| {
                        ScenarioError::Setup(
                            "kyverno-update needs the updated compliance requirement".to_string(),
                        )
                    })?;
                KYVERNO_UPDATE_GOAL
                    .replace("${current_compliance}", &inputs.compliance)
                    .replace("${updated_compliance}", updated)
            }
        };
        Ok(goal)
    }

    fn target_task(&self) -> (&'static str, &'static str) {
        match self {
            ScenarioKind::KubectlOpa | ScenarioKind::PlaybookOpa => (CHECK_TASK, CHECK_OUTPUT),
            ScenarioKind::Kyverno => (
                "Check a Kyverno policy successfully deployed on the cluster. If not yet, create it first. You must report the filenames that you generated.",
                "All files you generated in your task and those explanations",
            ),
            ScenarioKind::KyvernoUpdate => (
                "Get the Kyverno policy and generate the updated one based on it. Then deploy it on the cluster.",
                "A boolean which indicates if the result is OK or not",
            ),
        }
    }

    fn report_expected_output(&self) -> &'static str {
        match self {
            ScenarioKind::KubectlOpa => "A JSON string with the following info:
```json
{
    \"path_to_generated_shell_script\": <PLACEHOLDER>,
    \"path_to_generated_rego_policy\": <PLACEHOLDER>,
    \"path_to_collected_data_by_script\": <PLACEHOLDER>
}
```
",
            ScenarioKind::Kyverno => "A JSON string with the following info:
```json
{
    \"deployed_resource\": {
        \"namespace\": <PLACEHOLDER>,
        \"kind\": <PLACEHOLDER>,
        \"name\": <PLACEHOLDER>
    },
    \"path_to_generated_kyverno_policy\": <PLACEHOLDER>
}
```
You can omit `namespace` in `deployed_resource` if the policy is a cluster-scope resource.
",
            ScenarioKind::KyvernoUpdate => "A JSON string with the following info:
```json
{
    \"updated_resource\": {
        \"namespace\": <PLACEHOLDER>,
        \"kind\": <PLACEHOLDER>,
        \"name\": <PLACEHOLDER>
    },
    \"path_to_generated_kyverno_policy\": <PLACEHOLDER>
}
```
You can omit `namespace` in `updated_resource` if the policy is a cluster-scope resource.
",
            ScenarioKind::PlaybookOpa => "A JSON string with the following info:
```json
{
    \"path_to_generated_playbook\": <PLACEHOLDER>,
    \"path_to_generated_rego_policy\": <PLACEHOLDER>,
    \"path_to_collected_data_by_playbook\": <PLACEHOLDER>
}
```
",
        }
    }

    /// Target task with the scenario's tools, then a report task with none.
    pub fn plan(&self, ctx: &ToolContext) -> Vec<AgentTask> {
        let (description, expected_output) = self.target_task();
        vec![
            AgentTask {
                name: "target_task".to_string(),
                description: description.to_string(),
                expected_output: expected_output.to_string(),
                tools: ToolSet::new(self.tools(), ctx),
            },
            AgentTask {
                name: "report_task".to_string(),
                description: REPORT_DESCRIPTION.to_string(),
                expected_output: self.report_expected_output().to_string(),
                tools: ToolSet::empty(),
            },
        ]
    }
}

impl fmt::Display for ScenarioKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Default)]
pub struct ScenarioInputs {
    /// The compliance requirement; the current one for kyverno-update.
    pub compliance: String,
    pub updated_compliance: Option<String>,
    pub workdir: Option<PathBuf>,
    /// kubeconfig, or the Ansible inventory for playbook-opa.
    pub credential: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScenarioState {
    Init,
    Prepared,
    Running,
    Reporting,
    Done,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioOutcome {
    pub kind: ScenarioKind,
    pub workdir: PathBuf,
    pub report: ScenarioReport,
    pub raw_answer: String,
    pub eval_copies: Vec<PathBuf>,
    pub transcript: Transcript,
}

impl fmt::Display for ScenarioOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Scenario: {}", self.kind)?;
        writeln!(f, "  working directory: {}", self.workdir.display())?;
        if self.report.is_empty() {
            writeln!(f, "  report: (empty)")?;
        } else {
            writeln!(f, "  report:")?;
            for (key, value) in self.report.fields() {
                match value {
                    Value::String(text) => writeln!(f, "    - {key}: {text}")?,
                    other => writeln!(f, "    - {key}: {other}")?,
                }
            }
        }
        for path in &self.eval_copies {
            writeln!(f, "  copied for evaluation: {}", path.display())?;
        }
        Ok(())
    }
}

/// One end-to-end scenario: prepare the workdir, drive the planner through
/// the two-task plan, turn its final answer into a report.
pub struct ScenarioRunner {
    config: AgentConfig,
    completion: Arc<dyn TextCompletion>,
    state: ScenarioState,
}

impl ScenarioRunner {
    pub fn new(config: AgentConfig, completion: Arc<dyn TextCompletion>) -> Self {
        Self {
            config,
            completion,
            state: ScenarioState::Init,
        }
    }

    pub fn state(&self) -> ScenarioState {
        self.state
    }

    pub fn run(
        &mut self,
        kind: ScenarioKind,
        inputs: &ScenarioInputs,
        planner: &mut dyn Planner,
    ) -> Result<ScenarioOutcome, ScenarioError> {
        self.state = ScenarioState::Init;
        let result = self.drive(kind, inputs, planner);
        if result.is_err() {
            self.transition(ScenarioState::Failed);
        }
        result
    }

    fn drive(
        &mut self,
        kind: ScenarioKind,
        inputs: &ScenarioInputs,
        planner: &mut dyn Planner,
    ) -> Result<ScenarioOutcome, ScenarioError> {
        let goal = kind.goal(inputs)?;
        let workdir = self.prepare(kind, inputs)?;

        self.transition(ScenarioState::Running);
        let ctx = ToolContext::new(
            &self.config,
            workdir.clone(),
            Arc::clone(&self.completion),
            kind.read_only(),
        );
        let tasks = kind.plan(&ctx);
        let mut agent = AgentLoop::new(planner, goal, self.config.max_iterations);
        let raw_answer = agent.run_plan(&tasks)?;
        let transcript = agent.into_transcript();

        self.transition(ScenarioState::Reporting);
        let report = build_report(&raw_answer, &workdir, kind.report_policy())?;
        let eval_copies = if kind.copies_for_eval() {
            copy_files_for_eval(&report).map_err(ScenarioError::EvalCopy)?
        } else {
            Vec::new()
        };

        self.transition(ScenarioState::Done);
        Ok(ScenarioOutcome {
            kind,
            workdir: workdir.path().to_path_buf(),
            report,
            raw_answer,
            eval_copies,
            transcript,
        })
    }

    /// Creates the working directory and seeds the credential file.
    pub fn prepare(
        &mut self,
        kind: ScenarioKind,
        inputs: &ScenarioInputs,
    ) -> Result<WorkingDirectory, ScenarioError> {
        let path = inputs
            .workdir
            .clone()
            .filter(|path| !path.as_os_str().is_empty())
            .unwrap_or_else(|| WorkingDirectory::timestamped_path(&self.config.workdir_root));
        let workdir = WorkingDirectory::create(&path)
            .map_err(|err| ScenarioError::Setup(format!("{}: {err}", path.display())))?;

        match &inputs.credential {
            Some(source) => {
                workdir
                    .seed_file(source, kind.credential_file())
                    .map_err(|err| ScenarioError::Setup(format!("{}: {err}", source.display())))?;
            }
            None if !workdir.resolve(kind.credential_file()).exists() => {
                warn!(file = kind.credential_file(), "no credential file in working directory");
            }
            None => {}
        }

        info!(scenario = %kind, workdir = %workdir.path().display(), "working directory ready");
        self.transition(ScenarioState::Prepared);
        Ok(workdir)
    }

    fn transition(&mut self, next: ScenarioState) {
        info!(from = ?self.state, to = ?next, "scenario state");
        self.state = next;
    }
}

/// Turns the planner's final text into a report rooted at `workdir`.
pub fn build_report(
    raw: &str,
    workdir: &WorkingDirectory,
    policy: ReportPolicy,
) -> Result<ScenarioReport, ScenarioError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(ScenarioError::EmptyAnswer);
    }

    let extracted = if trimmed.contains("```") {
        extract_code(trimmed, CodeKind::Json).into_text()
    } else {
        trimmed.to_string()
    };
    let text = extracted.trim();
    if text.is_empty() {
        return Err(ScenarioError::InvalidAnswer {
            raw: raw.to_string(),
        });
    }

    let parsed = match serde_json::from_str::<Value>(text) {
        Ok(Value::Object(fields)) => Ok(ScenarioReport::new(fields)),
        Ok(_) => Err(ScenarioError::ReportParse {
            raw: text.to_string(),
            source: None,
        }),
        Err(err) => Err(ScenarioError::ReportParse {
            raw: text.to_string(),
            source: Some(err),
        }),
    };

    let mut report = match (parsed, policy) {
        (Ok(report), _) => report,
        (Err(err), ReportPolicy::Strict) => return Err(err),
        (Err(err), ReportPolicy::Lenient) => {
            warn!(error = %err, "continuing with an empty report");
            ScenarioReport::default()
        }
    };
    report.normalize_paths(workdir);
    Ok(report)
}
