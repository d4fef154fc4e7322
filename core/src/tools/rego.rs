use super::{read_context_file, requirement_text, truncate_context};
use crate::artifact::{sanitize_filename, ArtifactKind, GeneratedArtifact, WorkingDirectory};
use crate::command::CommandRunner;
use crate::error::ToolError;
use crate::extract::{extract_code, CodeKind};
use crate::llm::TextCompletion;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

const REGO_RULES: &str = r#"

Points:
- `input` in your code is the above "Input data"
- If input data is just a string, check string match
- If input data is truncated, assume the data contents
- the final output must be `result`
- when input data should be disallowed, `result` must be `false`
- the package name must be `check`
- always insert `import rego.v1` after `package check`
- OPA is case sensitive. "False" and "false" is different.
- when error says "`if` keyword is required before rule body", you should change the code
  from something like `result := false {}` to `result := false if {}`
- The following is an example of a OPA Rego policy to disallow input if any item's value contains "ab"
```rego
package check
import rego.v1

default result := true

result := false if {
    some i
    contains(input.items[i].value, "ab")
}
```

for this example input data.
```json
{
    "items": [
        {"value": "abc"},
        {"value": "def"}
    ]
}
```
"#;

#[derive(Debug, Clone, Deserialize)]
pub struct RegoGenerateRequest {
    pub sentence: Value,
    #[serde(default)]
    pub policy_file: String,
    #[serde(default)]
    pub input_file: String,
}

/// Asks the code-generation model for a Rego policy and saves it.
pub struct RegoGenerator {
    workdir: WorkingDirectory,
    completion: Arc<dyn TextCompletion>,
}

impl RegoGenerator {
    pub fn new(workdir: WorkingDirectory, completion: Arc<dyn TextCompletion>) -> Self {
        Self {
            workdir,
            completion,
        }
    }

    pub fn generate(&self, request: &RegoGenerateRequest) -> Result<String, ToolError> {
        info!(policy_file = %request.policy_file, input_file = %request.input_file, "GenerateOPARegoTool called");
        let prompt = self.prompt(request)?;
        debug!(%prompt, "rego generation prompt");

        let answer = self.completion.complete(&prompt)?;
        let code = extract_code(&answer, CodeKind::Rego).into_text();

        let file = sanitize_filename(
            &request.policy_file,
            ArtifactKind::RegoPolicy.default_filename(),
        );
        let path = self.workdir.resolve(&file);
        let artifact = GeneratedArtifact::persist(ArtifactKind::RegoPolicy, path.clone(), code)
            .map_err(|source| ToolError::io("failed to write policy", path, source))?;
        Ok(artifact.content)
    }

    fn prompt(&self, request: &RegoGenerateRequest) -> Result<String, ToolError> {
        let requirement = requirement_text(&request.sentence);
        let mut prompt = format!(
            "Generate a very simple OPA Rego policy to evaluate the following condition:\n    {requirement}\n"
        );

        let input_file = request.input_file.trim();
        if !input_file.is_empty() {
            let data = read_context_file(&self.workdir, input_file, "input_file")?;
            let (data, note) = truncate_context(&data);
            prompt.push_str(&format!(
                "\nInput data to be evaluated:\n```json\n{data}\n{note}\n```\n"
            ));
        }

        prompt.push_str(REGO_RULES);
        Ok(prompt)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegoEvaluateRequest {
    pub policy_file: String,
    pub input_file: String,
}

/// Decoded outcome of one `opa eval`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationResult {
    pub value: Value,
    pub message: String,
}

/// Evaluates a saved policy against saved input with the `opa` binary.
pub struct RegoEvaluator {
    workdir: WorkingDirectory,
    runner: CommandRunner,
    program: String,
}

impl RegoEvaluator {
    pub fn new(workdir: WorkingDirectory, runner: CommandRunner, program: String) -> Self {
        Self {
            workdir,
            runner,
            program,
        }
    }

    pub fn evaluate(&self, request: &RegoEvaluateRequest) -> Result<EvaluationResult, ToolError> {
        info!(policy_file = %request.policy_file, input_file = %request.input_file, "RunOPARegoTool called");

        let policy_path = self.workdir.resolve(&request.policy_file);
        let package = read_package_name(&policy_path)?.ok_or_else(|| {
            ToolError::Validation("`package` must be defined in the rego policy file".to_string())
        })?;

        let input_path = self.workdir.resolve(&request.input_file);
        let input = fs::read_to_string(&input_path)
            .map_err(|source| ToolError::io("failed to read input", input_path, source))?;

        let args = vec![
            "eval".to_string(),
            "--data".to_string(),
            request.policy_file.clone(),
            "--stdin-input".to_string(),
            format!("data.{package}"),
        ];
        let raw = self
            .runner
            .run(&self.program, &args, self.workdir.path(), Some(&input))?;
        debug!(stdout = %raw.stdout, stderr = %raw.stderr, "opa eval finished");

        if raw.timed_out {
            return Err(ToolError::Timeout {
                command: raw.invocation,
                seconds: self.runner.timeout().map(|t| t.as_secs()).unwrap_or_default(),
            });
        }
        if raw.returncode != 0 {
            return Err(ToolError::Evaluation {
                command: "opa eval".to_string(),
                stdout: raw.stdout,
                stderr: raw.stderr,
            });
        }

        let value = parse_eval_output(&raw.stdout)?;
        Ok(EvaluationResult {
            value,
            message: raw.stderr,
        })
    }
}

/// First `package <name>` declaration in the policy, if any.
pub fn read_package_name(path: &Path) -> Result<Option<String>, ToolError> {
    let source = fs::read_to_string(path)
        .map_err(|source| ToolError::io("failed to read policy", path, source))?;
    Ok(package_name(&source))
}

pub fn package_name(policy: &str) -> Option<String> {
    policy.lines().find_map(|line| {
        line.trim()
            .strip_prefix("package ")
            .map(|name| name.trim().to_string())
            .filter(|name| !name.is_empty())
    })
}

/// Digs `result[0].expressions[0].value` out of `opa eval` JSON, naming the
/// first level that is missing.
pub fn parse_eval_output(stdout: &str) -> Result<Value, ToolError> {
    let parsed: Value = serde_json::from_str(stdout).map_err(|err| {
        ToolError::Validation(format!(
            "output from `opa eval` command is not valid JSON ({err}); raw output: {stdout}"
        ))
    })?;

    let Some(results) = parsed.get("result") else {
        return Err(ToolError::Validation(format!(
            "`result` field does not exist in the output from `opa eval` command; raw output: {stdout}"
        )));
    };
    let Some(first) = results.as_array().and_then(|items| items.first()) else {
        return Err(ToolError::Validation(format!(
            "`result` field in the output from `opa eval` command has no contents; raw output: {stdout}"
        )));
    };
    let Some(expressions) = first.get("expressions") else {
        return Err(ToolError::Validation(format!(
            "`expressions` field does not exist in the first result of output from `opa eval` command; first_result: {first}"
        )));
    };
    let Some(expression) = expressions.as_array().and_then(|items| items.first()) else {
        return Err(ToolError::Validation(format!(
            "`expressions` field in the output from `opa eval` command has no contents; first_result: {first}"
        )));
    };

    Ok(expression
        .get("value")
        .cloned()
        .unwrap_or_else(|| Value::Object(Map::new())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::testing::CannedCompletion;
    use crate::tools::CONTEXT_TRUNCATION_NOTE;
    use serde_json::json;
    use std::time::Duration;

    #[test]
    fn package_is_first_declaration() {
        assert_eq!(
            package_name("# policy\n  package check\nimport rego.v1\npackage other\n"),
            Some("check".to_string())
        );
        assert_eq!(package_name("import rego.v1\n"), None);
    }

    #[test]
    fn eval_output_yields_value() {
        let value = parse_eval_output(r#"{"result":[{"expressions":[{"value": false}]}]}"#)
            .expect("valid output");
        assert_eq!(value, Value::Bool(false));

        let nested = parse_eval_output(
            r#"{"result":[{"expressions":[{"value":{"result":true},"text":"data.check"}]}]}"#,
        )
        .expect("valid output");
        assert_eq!(nested, json!({ "result": true }));
    }

    #[test]
    fn missing_value_defaults_to_empty_object() {
        let value = parse_eval_output(r#"{"result":[{"expressions":[{"text":"data.check"}]}]}"#)
            .expect("valid output");
        assert_eq!(value, json!({}));
    }

    #[test]
    fn each_missing_level_is_named() {
        let cases = [
            ("{}", "`result` field does not exist"),
            (r#"{"result":[]}"#, "`result` field in the output"),
            (r#"{"result":[{}]}"#, "`expressions` field does not exist"),
            (r#"{"result":[{"expressions":[]}]}"#, "`expressions` field in the output"),
            ("not json", "not valid JSON"),
        ];
        for (stdout, expected) in cases {
            match parse_eval_output(stdout) {
                Err(ToolError::Validation(message)) => {
                    assert!(message.contains(expected), "{stdout}: {message}")
                }
                other => panic!("{stdout}: unexpected {other:?}"),
            }
        }
    }

    fn generator(dir: &Path, completion: Arc<CannedCompletion>) -> RegoGenerator {
        RegoGenerator::new(WorkingDirectory::create(dir).expect("workdir"), completion)
    }

    #[test]
    fn generated_policy_is_saved_verbatim() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("pods.json"), "{\"items\": []}").unwrap();
        let completion = Arc::new(CannedCompletion::new(&[
            "Sure:\n```rego\npackage check\nimport rego.v1\n\ndefault result := true\n```\n",
        ]));
        let tool = generator(dir.path(), Arc::clone(&completion));

        let code = tool
            .generate(&RegoGenerateRequest {
                sentence: json!("no pod runs as root"),
                policy_file: "\"{policy.rego}\"".to_string(),
                input_file: "pods.json".to_string(),
            })
            .expect("generated");

        let saved = fs::read_to_string(dir.path().join("policy.rego")).expect("saved");
        assert_eq!(saved, code);
        assert_eq!(saved, "package check\nimport rego.v1\n\ndefault result := true\n");

        let prompts = completion.prompts.borrow();
        assert!(prompts[0].contains("no pod runs as root"));
        assert!(prompts[0].contains("{\"items\": []}"));
        assert!(prompts[0].contains("the package name must be `check`"));
    }

    #[test]
    fn long_input_is_truncated_in_prompt() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("big.json"), "x".repeat(5000)).unwrap();
        let completion = Arc::new(CannedCompletion::new(&["```rego\npackage check\n```"]));
        let tool = generator(dir.path(), Arc::clone(&completion));
        tool.generate(&RegoGenerateRequest {
            sentence: json!("anything"),
            policy_file: String::new(),
            input_file: "big.json".to_string(),
        })
        .expect("generated");

        let prompt = completion.prompts.borrow()[0].clone();
        assert!(prompt.contains(CONTEXT_TRUNCATION_NOTE));
        assert!(!prompt.contains(&"x".repeat(1001)));
        assert!(dir.path().join("policy.rego").exists());
    }

    #[test]
    fn missing_input_fails_before_completion() {
        let dir = tempfile::tempdir().expect("tempdir");
        let completion = Arc::new(CannedCompletion::new(&["unused"]));
        let tool = generator(dir.path(), Arc::clone(&completion));
        let err = tool
            .generate(&RegoGenerateRequest {
                sentence: json!("anything"),
                policy_file: "policy.rego".to_string(),
                input_file: "collected.json".to_string(),
            })
            .expect_err("input missing");
        assert!(matches!(err, ToolError::Precondition(msg) if msg.contains("collected.json")));
        assert_eq!(completion.calls(), 0);
    }

    #[test]
    fn regenerating_overwrites_policy() {
        let dir = tempfile::tempdir().expect("tempdir");
        let completion = Arc::new(CannedCompletion::new(&[
            "```rego\npackage check\n# first, longer version\n```",
            "```rego\npackage check\n```",
        ]));
        let tool = generator(dir.path(), completion);
        let request = RegoGenerateRequest {
            sentence: json!("anything"),
            policy_file: "policy.rego".to_string(),
            input_file: String::new(),
        };
        tool.generate(&request).expect("first");
        tool.generate(&request).expect("second");
        let saved = fs::read_to_string(dir.path().join("policy.rego")).unwrap();
        assert_eq!(saved, "package check\n");
    }

    fn evaluator(dir: &Path, program: &str) -> RegoEvaluator {
        RegoEvaluator::new(
            WorkingDirectory::create(dir).expect("workdir"),
            CommandRunner::new(Some(Duration::from_secs(5)), 1000),
            program.to_string(),
        )
    }

    #[test]
    fn policy_without_package_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("policy.rego"), "default result := true\n").unwrap();
        fs::write(dir.path().join("input.json"), "{}").unwrap();
        let err = evaluator(dir.path(), "no-such-opa")
            .evaluate(&RegoEvaluateRequest {
                policy_file: "policy.rego".into(),
                input_file: "input.json".into(),
            })
            .expect_err("no package");
        assert!(matches!(err, ToolError::Validation(msg) if msg.contains("`package`")));
    }

    // `sh` runs a script file named `eval` from the working directory, so
    // the fake opa is never exec'd directly.
    #[cfg(unix)]
    #[test]
    fn evaluates_through_binary_with_stdin_input() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("policy.rego"), "package check\nimport rego.v1\n").unwrap();
        fs::write(dir.path().join("input.json"), "{\"items\": []}").unwrap();
        fs::write(
            dir.path().join("eval"),
            "input=$(cat)\n\
             [ \"$3\" = \"--stdin-input\" ] || exit 9\n\
             [ \"$4\" = \"data.check\" ] || exit 8\n\
             [ \"$input\" = '{\"items\": []}' ] || exit 7\n\
             echo 'deprecated flag' >&2\n\
             echo '{\"result\":[{\"expressions\":[{\"value\":false}]}]}'\n",
        )
        .unwrap();

        let result = evaluator(dir.path(), "sh")
            .evaluate(&RegoEvaluateRequest {
                policy_file: "policy.rego".into(),
                input_file: "input.json".into(),
            })
            .expect("evaluates");
        assert_eq!(result.value, Value::Bool(false));
        assert_eq!(result.message, "deprecated flag\n");
    }

    #[cfg(unix)]
    #[test]
    fn non_zero_exit_is_an_evaluation_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("policy.rego"), "package check\n").unwrap();
        fs::write(dir.path().join("input.json"), "{}").unwrap();
        fs::write(dir.path().join("eval"), "cat >/dev/null\necho 'rego_parse_error' >&2\nexit 2\n").unwrap();

        let err = evaluator(dir.path(), "sh")
            .evaluate(&RegoEvaluateRequest {
                policy_file: "policy.rego".into(),
                input_file: "input.json".into(),
            })
            .expect_err("evaluation fails");
        match err {
            ToolError::Evaluation { stderr, .. } => assert!(stderr.contains("rego_parse_error")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[cfg(unix)]
    #[test]
    fn slow_evaluation_is_a_timeout() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("policy.rego"), "package check
").unwrap();
        fs::write(dir.path().join("input.json"), "{}").unwrap();
        fs::write(dir.path().join("eval"), "cat >/dev/null
sleep 5
").unwrap();

        let tool = RegoEvaluator::new(
            WorkingDirectory::create(dir.path()).expect("workdir"),
            CommandRunner::new(Some(Duration::from_millis(200)), 1000),
            "sh".to_string(),
        );
        let err = tool
            .evaluate(&RegoEvaluateRequest {
                policy_file: "policy.rego".into(),
                input_file: "input.json".into(),
            })
            .expect_err("evaluation times out");
        match err {
            ToolError::Timeout { command, .. } => assert!(command.starts_with("sh eval")),
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
