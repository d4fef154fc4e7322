use crate::artifact::WorkingDirectory;
use crate::command::CommandRunner;
use crate::error::ToolError;
use serde::Deserialize;
use serde_json::{json, Value};
use std::fs;
use std::path::Path;
use tracing::{debug, info};

/// Conventional name of the credential file inside the working directory.
pub const KUBECONFIG_FILE: &str = "kubeconfig.yaml";

const KUBECONFIG_FLAG: &str = "--kubeconfig";
const CHAINING_TOKENS: &[&str] = &[";", "&&", "||", "|"];

#[derive(Debug, Clone, Deserialize)]
pub struct KubectlRequest {
    pub args: String,
    #[serde(default)]
    pub output_file: String,
    #[serde(default)]
    pub return_output: Option<Value>,
    #[serde(default)]
    pub script_file: String,
}

impl KubectlRequest {
    pub fn wants_output(&self) -> bool {
        match &self.return_output {
            Some(Value::Bool(flag)) => *flag,
            Some(Value::String(text)) => text.trim().eq_ignore_ascii_case("true"),
            _ => false,
        }
    }
}

/// Runs `kubectl` against the cluster named by an explicit kubeconfig.
pub struct KubectlTool {
    workdir: WorkingDirectory,
    runner: CommandRunner,
    program: String,
    read_only: bool,
}

impl KubectlTool {
    pub fn new(
        workdir: WorkingDirectory,
        runner: CommandRunner,
        program: String,
        read_only: bool,
    ) -> Self {
        Self {
            workdir,
            runner,
            program,
            read_only,
        }
    }

    /// Non-zero exits come back in the payload; only precondition and I/O
    /// failures are errors.
    pub fn run(&self, request: &KubectlRequest) -> Result<Value, ToolError> {
        let output_file = request.output_file.trim();
        let script_file = request.script_file.trim();
        let args = prepare_args(&request.args, output_file, self.read_only)?;
        info!(args = %shell_words::join(&args), read_only = self.read_only, "RunKubectlTool called");

        let raw = self
            .runner
            .run(&self.program, &args, self.workdir.path(), None)?;

        if !output_file.is_empty() {
            let path = self.workdir.resolve(output_file);
            fs::write(&path, raw.stdout.as_bytes())
                .map_err(|source| ToolError::io("failed to write output to", path, source))?;
        }

        let result = raw.to_result(self.runner.output_cap());
        debug!(returncode = result.returncode, stdout = %result.stdout, stderr = %result.stderr, "kubectl finished");

        let mut payload = json!({ "return_code": result.returncode });
        if request.wants_output() {
            payload["stdout"] = json!(result.stdout);
        }
        if result.returncode != 0 {
            payload["stderr"] = json!(result.stderr);
        }
        if result.timed_out {
            payload["timed_out"] = json!(true);
        }

        if !script_file.is_empty() {
            self.write_script(&args, output_file, script_file)?;
        }

        Ok(payload)
    }

    fn write_script(
        &self,
        args: &[String],
        output_file: &str,
        script_file: &str,
    ) -> Result<(), ToolError> {
        let kubeconfig = self.workdir.resolve(KUBECONFIG_FILE);
        let body = script_body(args, &kubeconfig, output_file);
        let path = self.workdir.resolve(script_file);
        fs::write(&path, body.as_bytes())
            .map_err(|source| ToolError::io("failed to write script", path.clone(), source))?;
        make_executable(&path)?;
        debug!(path = %path.display(), "replay script saved");
        Ok(())
    }
}

/// Splits and checks a planner-supplied kubectl command line.
pub fn prepare_args(
    line: &str,
    output_file: &str,
    read_only: bool,
) -> Result<Vec<String>, ToolError> {
    let mut words = shell_words::split(line).map_err(|err| {
        ToolError::Precondition(format!("failed to parse kubectl arguments `{line}`: {err}"))
    })?;

    if words.first().is_some_and(|word| word.contains("kubectl")) {
        words.remove(0);
    }

    if words
        .iter()
        .any(|word| CHAINING_TOKENS.contains(&word.as_str()))
    {
        return Err(ToolError::Precondition(
            "Multiple commands with `;` or `&&` is not allowed".to_string(),
        ));
    }

    let has_kubeconfig = words.iter().any(|word| {
        word == KUBECONFIG_FLAG || word.starts_with(&format!("{KUBECONFIG_FLAG}="))
    });
    if !has_kubeconfig {
        return Err(ToolError::Precondition(
            "--kubeconfig must be specified to avoid touching wrong cluster".to_string(),
        ));
    }

    if read_only && words.first().map(String::as_str) != Some("get") {
        return Err(ToolError::Precondition(
            "Only `get` operation is allowed".to_string(),
        ));
    }

    if output_file.ends_with(".json") && !has_output_flag(&words) {
        words.push("-o".to_string());
        words.push("json".to_string());
    }

    Ok(words)
}

fn has_output_flag(words: &[String]) -> bool {
    words.iter().any(|word| {
        word == "--output"
            || word.starts_with("--output=")
            || (word.starts_with("-o") && !word.starts_with("--"))
    })
}

/// `#!/bin/bash` replay script with every reference to the working
/// directory's credential file made absolute.
pub fn script_body(args: &[String], kubeconfig: &Path, output_file: &str) -> String {
    let absolute = kubeconfig.to_string_lossy();
    let mut words = vec!["kubectl".to_string()];
    for word in args {
        let word = match word.strip_prefix(&format!("{KUBECONFIG_FLAG}=")) {
            Some(value) if refers_to(value, kubeconfig) => format!("{KUBECONFIG_FLAG}={absolute}"),
            None if refers_to(word, kubeconfig) => absolute.to_string(),
            _ => word.clone(),
        };
        words.push(word);
    }
    let mut line = shell_words::join(&words);
    if !output_file.is_empty() {
        line.push_str(" > ");
        line.push_str(&shell_words::quote(output_file));
    }
    format!("#!/bin/bash\n{line}\n")
}

/// Whether `word`, taken relative to the credential's directory, names it.
fn refers_to(word: &str, kubeconfig: &Path) -> bool {
    let candidate = Path::new(word);
    if word.is_empty() || candidate.is_absolute() {
        return false;
    }
    let base = kubeconfig.parent().unwrap_or_else(|| Path::new(""));
    // component comparison drops interior `.` segments
    base.join(candidate) == kubeconfig
}

#[cfg(unix)]
fn make_executable(path: &Path) -> Result<(), ToolError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o755))
        .map_err(|source| ToolError::io("failed to chmod", path, source))
}

#[cfg(not(unix))]
fn make_executable(_path: &Path) -> Result<(), ToolError> {
    Ok(())
}
