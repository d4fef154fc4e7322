use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use time::macros::format_description;
use time::OffsetDateTime;
use tracing::{debug, info};

pub const PATH_KEY_PREFIX: &str = "path_to_";

/// Filesystem scope for one scenario run. Created on demand, never removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkingDirectory {
    root: PathBuf,
}

impl WorkingDirectory {
    pub fn create(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref();
        let root = if path.is_absolute() {
            path.to_path_buf()
        } else {
            env::current_dir()?.join(path)
        };
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// `<root>/<YYYYmmddHHMMSS>_/workspace`, stamped in UTC.
    pub fn timestamped_path(root: &Path) -> PathBuf {
        let stamp = OffsetDateTime::now_utc()
            .format(format_description!(
                "[year][month][day][hour][minute][second]"
            ))
            .unwrap_or_else(|_| "unknown".to_string());
        root.join(format!("{stamp}_")).join("workspace")
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    /// Absolute paths pass through; everything else lands under the root.
    pub fn resolve(&self, file: &str) -> PathBuf {
        let candidate = Path::new(file);
        if candidate.is_absolute() {
            candidate.to_path_buf()
        } else {
            self.root.join(candidate)
        }
    }

    /// Copies `source` to `<root>/<name>` unless it already is that file.
    pub fn seed_file(&self, source: &Path, name: &str) -> io::Result<PathBuf> {
        let dest = self.root.join(name);
        if same_file(source, &dest) {
            debug!(path = %dest.display(), "credential file already in place");
            return Ok(dest);
        }
        fs::copy(source, &dest)?;
        info!(source = %source.display(), dest = %dest.display(), "seeded working directory");
        Ok(dest)
    }
}

fn same_file(a: &Path, b: &Path) -> bool {
    match (fs::canonicalize(a), fs::canonicalize(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}

/// Cleans a filename echoed back by the planner, which sometimes keeps
/// template punctuation such as `"{policy.rego}"`.
pub fn sanitize_filename(raw: &str, default: &str) -> String {
    let cleaned = raw
        .trim()
        .trim_matches('"')
        .trim_matches('\'')
        .trim_start_matches('{')
        .trim_end_matches('}')
        .trim();
    if cleaned.is_empty() {
        default.to_string()
    } else {
        cleaned.to_string()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ArtifactKind {
    RegoPolicy,
    KyvernoPolicy,
    Playbook,
}

impl ArtifactKind {
    pub fn default_filename(&self) -> &'static str {
        match self {
            ArtifactKind::RegoPolicy => "policy.rego",
            ArtifactKind::KyvernoPolicy => "policy.yaml",
            ArtifactKind::Playbook => "playbook.yml",
        }
    }
}

/// A document a generator wrote into the working directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratedArtifact {
    pub kind: ArtifactKind,
    pub path: PathBuf,
    pub content: String,
}

impl GeneratedArtifact {
    /// Writes `content` to `path`, replacing whatever was there.
    pub fn persist(kind: ArtifactKind, path: PathBuf, content: String) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, content.as_bytes())?;
        debug!(kind = ?kind, path = %path.display(), bytes = content.len(), "artifact written");
        Ok(Self {
            kind,
            path,
            content,
        })
    }
}

/// The planner's final answer, parsed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScenarioReport {
    fields: Map<String, Value>,
}

impl ScenarioReport {
    pub fn new(fields: Map<String, Value>) -> Self {
        Self { fields }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn path(&self, key: &str) -> Option<&str> {
        self.fields.get(key).and_then(Value::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.fields)
    }

    /// Roots bare filenames under `path_to_*` keys at the working directory;
    /// the planner never learns where that directory is.
    pub fn normalize_paths(&mut self, workdir: &WorkingDirectory) {
        for (key, value) in self.fields.iter_mut() {
            if !key.starts_with(PATH_KEY_PREFIX) {
                continue;
            }
            let Value::String(path) = value else {
                continue;
            };
            if path.is_empty() || path.contains('/') {
                continue;
            }
            let rooted = workdir.path().join(path.as_str());
            *path = rooted.to_string_lossy().to_string();
        }
    }
}

/// Fixed names the downstream grader looks for, keyed by report field.
pub const EVAL_COPIES: &[(&str, &str)] = &[
    ("path_to_generated_shell_script", "fetcher.sh"),
    ("path_to_generated_rego_policy", "policy.rego"),
    ("path_to_collected_data_by_script", "collected_data.json"),
];

/// Copies each reported artifact next to itself under its fixed grading name.
/// Missing sources and already-conventional names are skipped.
pub fn copy_files_for_eval(report: &ScenarioReport) -> io::Result<Vec<PathBuf>> {
    let mut copied = Vec::new();
    for (key, fixed_name) in EVAL_COPIES {
        let Some(source) = report.path(key) else {
            continue;
        };
        let source = Path::new(source);
        if source.as_os_str().is_empty() || !source.exists() {
            continue;
        }
        if source.file_name().and_then(|name| name.to_str()) == Some(*fixed_name) {
            continue;
        }
        let dest = source
            .parent()
            .unwrap_or_else(|| Path::new(""))
            .join(fixed_name);
        fs::copy(source, &dest)?;
        debug!(source = %source.display(), dest = %dest.display(), "copied artifact for evaluation");
        copied.push(dest);
    }
    Ok(copied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn report(value: Value) -> ScenarioReport {
        match value {
            Value::Object(map) => ScenarioReport::new(map),
            other => panic!("expected object, got {other}"),
        }
    }

    #[test]
    fn bare_filenames_are_rooted_at_workdir() {
        let dir = tempfile::tempdir().expect("tempdir");
        let workdir = WorkingDirectory::create(dir.path()).expect("workdir");
        let mut parsed = report(json!({
            "path_to_generated_rego_policy": "policy.rego",
            "path_to_collected_data_by_script": "/abs/data.json",
            "path_to_generated_shell_script": "",
            "deployed_resource": { "kind": "ClusterPolicy", "name": "policy.yaml" },
            "note": "script.sh"
        }));
        parsed.normalize_paths(&workdir);

        let expected = format!("{}/policy.rego", workdir.path().display());
        assert_eq!(parsed.path("path_to_generated_rego_policy"), Some(expected.as_str()));
        assert_eq!(parsed.path("path_to_collected_data_by_script"), Some("/abs/data.json"));
        assert_eq!(parsed.path("path_to_generated_shell_script"), Some(""));
        assert_eq!(parsed.path("note"), Some("script.sh"));
        assert_eq!(parsed.get("deployed_resource").unwrap()["name"], "policy.yaml");
    }

    #[test]
    fn relative_paths_with_separator_pass_through() {
        let dir = tempfile::tempdir().expect("tempdir");
        let workdir = WorkingDirectory::create(dir.path()).expect("workdir");
        let mut parsed = report(json!({ "path_to_generated_playbook": "out/playbook.yml" }));
        parsed.normalize_paths(&workdir);
        assert_eq!(parsed.path("path_to_generated_playbook"), Some("out/playbook.yml"));
    }

    #[test]
    fn filenames_lose_placeholder_punctuation() {
        assert_eq!(sanitize_filename("\"policy.rego\"", "x"), "policy.rego");
        assert_eq!(sanitize_filename("'{playbook.yml}'", "x"), "playbook.yml");
        assert_eq!(sanitize_filename("{}", "policy.yaml"), "policy.yaml");
        assert_eq!(sanitize_filename("  ", "policy.rego"), "policy.rego");
    }

    #[test]
    fn resolve_keeps_absolute_paths() {
        let dir = tempfile::tempdir().expect("tempdir");
        let workdir = WorkingDirectory::create(dir.path().join("nested")).expect("workdir");
        assert!(workdir.path().is_dir());
        assert_eq!(workdir.resolve("/etc/hosts"), PathBuf::from("/etc/hosts"));
        assert_eq!(workdir.resolve("a.json"), workdir.path().join("a.json"));
    }

    #[test]
    fn timestamped_path_ends_in_workspace() {
        let path = WorkingDirectory::timestamped_path(Path::new("/tmp/agent"));
        assert!(path.ends_with("workspace"));
        let stamp = path
            .parent()
            .and_then(|p| p.file_name())
            .and_then(|n| n.to_str())
            .expect("stamp dir");
        assert_eq!(stamp.len(), 15);
        assert!(stamp.ends_with('_'));
    }

    #[test]
    fn seeding_copies_once_and_tolerates_same_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let source = dir.path().join("my-kubeconfig");
        fs::write(&source, "apiVersion: v1").expect("write source");
        let workdir = WorkingDirectory::create(dir.path().join("ws")).expect("workdir");

        let dest = workdir.seed_file(&source, "kubeconfig.yaml").expect("seed");
        assert_eq!(fs::read_to_string(&dest).unwrap(), "apiVersion: v1");

        let again = workdir.seed_file(&dest, "kubeconfig.yaml").expect("same file is fine");
        assert_eq!(again, dest);
    }

    #[test]
    fn eval_copies_use_fixed_names() {
        let dir = tempfile::tempdir().expect("tempdir");
        let workdir = WorkingDirectory::create(dir.path()).expect("workdir");
        fs::write(workdir.resolve("get_pods.sh"), "#!/bin/bash\n").unwrap();
        fs::write(workdir.resolve("policy.rego"), "package check\n").unwrap();
        fs::write(workdir.resolve("pods.json"), "{}").unwrap();

        let mut parsed = report(json!({
            "path_to_generated_shell_script": "get_pods.sh",
            "path_to_generated_rego_policy": "policy.rego",
            "path_to_collected_data_by_script": "pods.json",
        }));
        parsed.normalize_paths(&workdir);

        let copied = copy_files_for_eval(&parsed).expect("copies");
        assert_eq!(copied.len(), 2);
        assert_eq!(fs::read_to_string(workdir.resolve("fetcher.sh")).unwrap(), "#!/bin/bash\n");
        assert_eq!(fs::read_to_string(workdir.resolve("collected_data.json")).unwrap(), "{}");
    }

    #[test]
    fn eval_copies_skip_missing_sources() {
        let dir = tempfile::tempdir().expect("tempdir");
        let workdir = WorkingDirectory::create(dir.path()).expect("workdir");
        let mut parsed = report(json!({ "path_to_generated_shell_script": "missing.sh" }));
        parsed.normalize_paths(&workdir);
        assert!(copy_files_for_eval(&parsed).expect("no error").is_empty());
        assert!(!workdir.resolve("fetcher.sh").exists());
    }

    #[test]
    fn persisting_twice_overwrites() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("policy.rego");
        GeneratedArtifact::persist(ArtifactKind::RegoPolicy, path.clone(), "first\nlonger".into())
            .expect("first write");
        GeneratedArtifact::persist(ArtifactKind::RegoPolicy, path.clone(), "second".into())
            .expect("second write");
        assert_eq!(fs::read_to_string(path).unwrap(), "second");
    }
}
