use super::requirement_text;
use crate::artifact::{sanitize_filename, ArtifactKind, GeneratedArtifact, WorkingDirectory};
use crate::command::CommandRunner;
use crate::error::ToolError;
use crate::extract::{extract_code, CodeKind};
use crate::llm::TextCompletion;
use serde::Deserialize;
use serde_json::{json, Value};
use std::fs;
use std::sync::Arc;
use tracing::{debug, info};

/// Conventional name of the inventory inside the working directory.
pub const INVENTORY_FILE: &str = "inventory.ansible.ini";

const PLAYBOOK_RULES: &str = r#"

Points:
- You should save a detailed info. Not a boolean of the check result.
- To read/write OS level files (e.g. under `/etc` dir), you should add `become: true`. Use grep.
- Do not use `setup` module.
- To save a variable in the playbook, you can use this task.
    ```yaml
    - name: Save a variable content in a localhost
      copy:
        content: {{ variable_name | quote }}
        dest: collected_data.json
      delegate_to: localhost
      become: false
    ```
  If you try to save a registered variable, do not parse it. Just save it as is.
  `become: false` is necessary for this task because you don't have sudo permission on localhost.
  Use "collected_data.json" and do not change the destination file name.
- Do not try to find "collected_data.json" when not found. Just collect the data again.
- Do not specify absolute path anywhere. You must use the current directory.
- If you need command result as a collected data, you should add `ignore_errors: true` to the task.
- Use Ansible module instead of command, if possible.
"#;

#[derive(Debug, Clone, Deserialize)]
pub struct PlaybookGenerateRequest {
    pub sentence: Value,
    #[serde(default)]
    pub playbook_file: String,
}

/// Generates an Ansible playbook that collects compliance evidence.
pub struct PlaybookGenerator {
    workdir: WorkingDirectory,
    completion: Arc<dyn TextCompletion>,
}

impl PlaybookGenerator {
    pub fn new(workdir: WorkingDirectory, completion: Arc<dyn TextCompletion>) -> Self {
        Self {
            workdir,
            completion,
        }
    }

    pub fn generate(&self, request: &PlaybookGenerateRequest) -> Result<String, ToolError> {
        info!(playbook_file = %request.playbook_file, "GeneratePlaybookTool called");
        let requirement = requirement_text(&request.sentence);
        let prompt = format!(
            "Generate a very simple Ansible Playbook to do the following:\n{requirement}\n{PLAYBOOK_RULES}"
        );
        debug!(%prompt, "playbook generation prompt");

        let answer = self.completion.complete(&prompt)?;
        let code = extract_code(&answer, CodeKind::Yaml).into_text();

        let file = sanitize_filename(
            &request.playbook_file,
            ArtifactKind::Playbook.default_filename(),
        );
        let path = self.workdir.resolve(&file);
        let artifact = GeneratedArtifact::persist(ArtifactKind::Playbook, path.clone(), code)
            .map_err(|source| ToolError::io("failed to write playbook", path, source))?;
        Ok(artifact.content)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlaybookRunRequest {
    pub host: String,
    pub playbook_file: String,
}

/// Runs a saved playbook against one inventory host.
pub struct PlaybookRunner {
    workdir: WorkingDirectory,
    runner: CommandRunner,
    program: String,
}

impl PlaybookRunner {
    pub fn new(workdir: WorkingDirectory, runner: CommandRunner, program: String) -> Self {
        Self {
            workdir,
            runner,
            program,
        }
    }

    /// Pins the playbook to `host`, then runs it. A failed run is returned as
    /// data for the planner to inspect.
    pub fn run(&self, request: &PlaybookRunRequest) -> Result<Value, ToolError> {
        info!(host = %request.host, playbook_file = %request.playbook_file, "RunPlaybookTool called");
        let path = self.workdir.resolve(&request.playbook_file);
        if !path.exists() {
            return Err(ToolError::Precondition(format!(
                "playbook_file `{}` is not found. Generate the playbook first.",
                request.playbook_file
            )));
        }

        let source = fs::read_to_string(&path)
            .map_err(|err| ToolError::io("failed to read playbook", path.clone(), err))?;
        let pinned = pin_hosts(&source, &request.host);
        fs::write(&path, pinned.as_bytes())
            .map_err(|err| ToolError::io("failed to write playbook", path.clone(), err))?;
        debug!(playbook = %pinned, "running playbook");

        let args = vec![
            request.playbook_file.clone(),
            "-i".to_string(),
            INVENTORY_FILE.to_string(),
        ];
        let raw = self
            .runner
            .run(&self.program, &args, self.workdir.path(), None)?;
        let result = raw.to_result(self.runner.output_cap());
        debug!(returncode = result.returncode, stdout = %result.stdout, stderr = %result.stderr, "ansible-playbook finished");

        let mut payload = json!({
            "returncode": result.returncode,
            "stdout": result.stdout,
        });
        if result.returncode != 0 {
            payload["stderr"] = json!(result.stderr);
        }
        if result.timed_out {
            payload["timed_out"] = json!(true);
        }
        Ok(payload)
    }
}

/// Rewrites every `hosts:` entry so the play targets `host`.
pub fn pin_hosts(playbook: &str, host: &str) -> String {
    let mut out = String::with_capacity(playbook.len());
    for line in playbook.lines() {
        let body = line.trim_start().trim_start_matches(['-', ' ']);
        match line.find("hosts:") {
            Some(idx) if body.starts_with("hosts") => {
                out.push_str(&line[..idx]);
                out.push_str("hosts: ");
                out.push_str(host);
            }
            _ => out.push_str(line),
        }
        out.push('\n');
    }
    out
}
