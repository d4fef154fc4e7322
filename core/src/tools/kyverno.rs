use super::{read_context_file, requirement_text};
use crate::artifact::{sanitize_filename, ArtifactKind, GeneratedArtifact, WorkingDirectory};
use crate::error::ToolError;
use crate::extract::{extract_code, CodeKind};
use crate::llm::TextCompletion;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info};

const KYVERNO_EXAMPLE: &str = r#"
---
The following is an example of a Kyverno Policy to disallow Pod creation in `default` namespace
```yaml
apiVersion: kyverno.io/v1
kind: ClusterPolicy
metadata:
  name: disallow-default-namespace
spec:
  rules:
  - name: validate-namespace
    match:
      any:
      - resources:
          kinds:
          - Pod
    validate:
      message: "Using 'default' namespace is not allowed."
      pattern:
        metadata:
          namespace: "!default"
```
"#;

#[derive(Debug, Clone, Deserialize)]
pub struct KyvernoGenerateRequest {
    pub sentence: Value,
    #[serde(default)]
    pub policy_file: String,
    #[serde(default)]
    pub current_policy_file: String,
}

/// Generates (or updates) a Kyverno ClusterPolicy document.
pub struct KyvernoGenerator {
    workdir: WorkingDirectory,
    completion: Arc<dyn TextCompletion>,
}

impl KyvernoGenerator {
    pub fn new(workdir: WorkingDirectory, completion: Arc<dyn TextCompletion>) -> Self {
        Self {
            workdir,
            completion,
        }
    }

    /// Returns a message quoting the saved policy and where it was saved,
    /// so the planner can pass the path straight to `kubectl apply`.
    pub fn generate(&self, request: &KyvernoGenerateRequest) -> Result<String, ToolError> {
        info!(policy_file = %request.policy_file, current_policy_file = %request.current_policy_file, "GenerateKyvernoTool called");
        let prompt = self.prompt(request)?;
        debug!(%prompt, "kyverno generation prompt");

        let answer = self.completion.complete(&prompt)?;
        let code = extract_code(&answer, CodeKind::Yaml).into_text();

        let file = sanitize_filename(
            &request.policy_file,
            ArtifactKind::KyvernoPolicy.default_filename(),
        );
        let path = self.workdir.resolve(&file);
        let artifact =
            GeneratedArtifact::persist(ArtifactKind::KyvernoPolicy, path.clone(), code)
                .map_err(|source| ToolError::io("failed to write policy", path, source))?;

        Ok(format!(
            "The generated policy is below:\n```yaml\n{}\n```\n\nThis policy file has been saved at {}.\n",
            artifact.content,
            artifact.path.display()
        ))
    }

    fn prompt(&self, request: &KyvernoGenerateRequest) -> Result<String, ToolError> {
        let requirement = requirement_text(&request.sentence);

        let current = request.current_policy_file.trim();
        let current_block = if current.is_empty() {
            String::new()
        } else {
            let policy = read_context_file(&self.workdir, current, "current_policy_file")?;
            format!("Please update the following current policy:\n```yaml\n{policy}\n```\n\n")
        };

        Ok(format!(
            "Generate a very simple Kyverno policy to do the following:\n{requirement}\n\n{current_block}\n{KYVERNO_EXAMPLE}"
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::testing::CannedCompletion;
    use serde_json::json;
    use std::fs;

    const ANSWER: &str = "Here it is:\n```yaml\napiVersion: kyverno.io/v1\nkind: ClusterPolicy\n```\n";

    #[test]
    fn saves_policy_and_reports_location() {
        let dir = tempfile::tempdir().expect("tempdir");
        let completion = Arc::new(CannedCompletion::new(&[ANSWER]));
        let tool = KyvernoGenerator::new(
            WorkingDirectory::create(dir.path()).expect("workdir"),
            completion.clone(),
        );

        let message = tool
            .generate(&KyvernoGenerateRequest {
                sentence: json!({ "rule": "disallow latest tag" }),
                policy_file: "'{}'".to_string(),
                current_policy_file: String::new(),
            })
            .expect("generated");

        let path = dir.path().join("policy.yaml");
        let saved = fs::read_to_string(&path).expect("saved at default name");
        assert_eq!(saved, "apiVersion: kyverno.io/v1\nkind: ClusterPolicy\n");
        assert!(message.contains(&saved));
        assert!(message.contains(&format!("saved at {}", path.display())));

        let prompt = completion.prompts.borrow()[0].clone();
        assert!(prompt.contains("\"rule\": \"disallow latest tag\""));
        assert!(!prompt.contains("Please update"));
    }

    #[test]
    fn update_includes_current_policy() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("current.yaml"), "kind: ClusterPolicy # old\n").unwrap();
        let completion = Arc::new(CannedCompletion::new(&[ANSWER]));
        let tool = KyvernoGenerator::new(
            WorkingDirectory::create(dir.path()).expect("workdir"),
            completion.clone(),
        );
        tool.generate(&KyvernoGenerateRequest {
            sentence: json!("also cover Deployments"),
            policy_file: "updated.yaml".to_string(),
            current_policy_file: "current.yaml".to_string(),
        })
        .expect("generated");

        let prompt = completion.prompts.borrow()[0].clone();
        assert!(prompt.contains("Please update the following current policy:"));
        assert!(prompt.contains("kind: ClusterPolicy # old"));
        assert!(dir.path().join("updated.yaml").exists());
    }

    #[test]
    fn missing_current_policy_fails_before_completion() {
        let dir = tempfile::tempdir().expect("tempdir");
        let completion = Arc::new(CannedCompletion::new(&[ANSWER]));
        let tool = KyvernoGenerator::new(
            WorkingDirectory::create(dir.path()).expect("workdir"),
            completion.clone(),
        );
        let err = tool
            .generate(&KyvernoGenerateRequest {
                sentence: json!("x"),
                policy_file: "policy.yaml".to_string(),
                current_policy_file: "gone.yaml".to_string(),
            })
            .expect_err("missing context");
        assert!(matches!(err, ToolError::Precondition(_)));
        assert_eq!(completion.calls(), 0);
    }
}
