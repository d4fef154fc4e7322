//! Locating fenced code blocks in free-form model output.

use serde::{Deserialize, Serialize};
use std::fmt;

const FENCE: &str = "```";

/// Languages the tools ask the model for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CodeKind {
    Json,
    Yaml,
    Rego,
}

impl CodeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CodeKind::Json => "json",
            CodeKind::Yaml => "yaml",
            CodeKind::Rego => "rego",
        }
    }

    fn matches_label(&self, label: &str) -> bool {
        let label = label.to_ascii_lowercase();
        match self {
            CodeKind::Json => label == "json",
            CodeKind::Yaml => label == "yaml" || label == "yml",
            CodeKind::Rego => label == "rego",
        }
    }
}

impl fmt::Display for CodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a fence search. Absence is not an error by itself; the caller
/// decides.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Extraction {
    Extracted(String),
    NotFound(String),
}

impl Extraction {
    pub fn is_extracted(&self) -> bool {
        matches!(self, Extraction::Extracted(_))
    }

    /// The fenced body, or the original text when nothing was fenced.
    pub fn into_text(self) -> String {
        match self {
            Extraction::Extracted(text) | Extraction::NotFound(text) => text,
        }
    }
}

#[derive(Debug)]
struct Fence<'a> {
    label: &'a str,
    body: &'a str,
}

/// Returns the interior of the first fence labelled `kind`, falling back to
/// the first fence of any label. Unterminated fences run to the end of the
/// text.
pub fn extract_code(text: &str, kind: CodeKind) -> Extraction {
    let fences = find_fences(text);

    let chosen = fences
        .iter()
        .find(|fence| kind.matches_label(fence.label))
        .or_else(|| fences.first());

    match chosen {
        Some(fence) => Extraction::Extracted(fence.body.to_string()),
        None => Extraction::NotFound(text.to_string()),
    }
}

fn find_fences(text: &str) -> Vec<Fence<'_>> {
    let mut fences = Vec::new();
    let mut open: Option<(&str, usize)> = None;
    let mut offset = 0usize;

    for line in text.split_inclusive('\n') {
        let line_start = offset;
        offset += line.len();
        let trimmed = line.trim();

        match open {
            None => {
                let Some(rest) = trimmed.strip_prefix(FENCE) else {
                    continue;
                };
                // ```{"a": 1}``` on a single line
                if let Some((inner, _)) = rest.split_once(FENCE) {
                    fences.push(Fence {
                        label: "",
                        body: inner.trim(),
                    });
                    continue;
                }
                let label = rest.split_whitespace().next().unwrap_or("");
                open = Some((label, offset));
            }
            Some((label, body_start)) => {
                if trimmed.starts_with(FENCE) {
                    fences.push(Fence {
                        label,
                        body: &text[body_start..line_start],
                    });
                    open = None;
                }
            }
        }
    }

    if let Some((label, body_start)) = open {
        fences.push(Fence {
            label,
            body: &text[body_start.min(text.len())..],
        });
    }

    fences
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_without_fence_is_returned_unchanged() {
        let text = "{\"path_to_generated_rego_policy\": \"policy.rego\"}";
        let extraction = extract_code(text, CodeKind::Json);
        assert_eq!(extraction, Extraction::NotFound(text.to_string()));
        assert_eq!(extraction.into_text(), text);
    }

    #[test]
    fn single_block_yields_interior_only() {
        let text = "Here you go:\n```rego\npackage check\nimport rego.v1\n```\nDone.";
        let extraction = extract_code(text, CodeKind::Rego);
        assert_eq!(
            extraction,
            Extraction::Extracted("package check\nimport rego.v1\n".to_string())
        );
    }

    #[test]
    fn labelled_block_wins_over_earlier_unlabelled_one() {
        let text = "```\nnot this\n```\n\n```json\n{\"a\": 1}\n```\n";
        let body = extract_code(text, CodeKind::Json).into_text();
        assert_eq!(body, "{\"a\": 1}\n");
    }

    #[test]
    fn falls_back_to_first_block_of_other_label() {
        let text = "```yml\nkind: ClusterPolicy\n```";
        assert_eq!(
            extract_code(text, CodeKind::Yaml).into_text(),
            "kind: ClusterPolicy\n"
        );
        assert_eq!(
            extract_code("```python\nprint(1)\n```", CodeKind::Rego).into_text(),
            "print(1)\n"
        );
    }

    #[test]
    fn unterminated_fence_degrades_to_rest_of_text() {
        let text = "```json\n{\"a\": 1}\n";
        let extraction = extract_code(text, CodeKind::Json);
        assert!(extraction.is_extracted());
        assert_eq!(extraction.into_text(), "{\"a\": 1}\n");

        let bare = "```json";
        assert_eq!(extract_code(bare, CodeKind::Json).into_text(), "");
    }

    #[test]
    fn single_line_fence_is_supported() {
        let text = "```{\"a\": 1}```";
        assert_eq!(extract_code(text, CodeKind::Json).into_text(), "{\"a\": 1}");
    }

    #[test]
    fn indented_fences_are_recognised() {
        let text = "Result:\n  ```json\n  {\"ok\": true}\n  ```\n";
        assert_eq!(
            extract_code(text, CodeKind::Json).into_text(),
            "  {\"ok\": true}\n"
        );
    }
}
