use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fmt;
use time::{format_description::well_known::Rfc3339, OffsetDateTime};

/// The closed set of tools the planner may call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ToolKind {
    RunKubectl,
    GenerateRego,
    RunRego,
    GenerateKyverno,
    GeneratePlaybook,
    RunPlaybook,
}

impl ToolKind {
    pub const ALL: [ToolKind; 6] = [
        ToolKind::RunKubectl,
        ToolKind::GenerateRego,
        ToolKind::RunRego,
        ToolKind::GenerateKyverno,
        ToolKind::GeneratePlaybook,
        ToolKind::RunPlaybook,
    ];

    pub fn name(&self) -> &'static str {
        self.schema().name
    }

    pub fn from_name(name: &str) -> Option<ToolKind> {
        let name = name.trim();
        ToolKind::ALL
            .into_iter()
            .find(|kind| kind.name().eq_ignore_ascii_case(name))
    }

    pub fn descriptor(&self) -> ToolDescriptor {
        self.schema().to_descriptor()
    }

    fn schema(&self) -> &'static ToolSchemaDef {
        match self {
            ToolKind::RunKubectl => &BUILTIN_SCHEMAS[0],
            ToolKind::GenerateRego => &BUILTIN_SCHEMAS[1],
            ToolKind::RunRego => &BUILTIN_SCHEMAS[2],
            ToolKind::GenerateKyverno => &BUILTIN_SCHEMAS[3],
            ToolKind::GeneratePlaybook => &BUILTIN_SCHEMAS[4],
            ToolKind::RunPlaybook => &BUILTIN_SCHEMAS[5],
        }
    }
}

impl fmt::Display for ToolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// What the planner is shown about a tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub required: Vec<String>,
    pub optional: Vec<String>,
    /// JSON schema of the named arguments.
    pub parameters: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSchemaBundle {
    pub version: String,
    pub generated_at: String,
    pub tools: Vec<ToolDescriptor>,
}

pub fn builtin_tool_descriptors() -> Vec<ToolDescriptor> {
    ToolKind::ALL.iter().map(ToolKind::descriptor).collect()
}

pub fn builtin_tool_schema_bundle() -> ToolSchemaBundle {
    ToolSchemaBundle {
        version: SCHEMA_VERSION.to_string(),
        generated_at: OffsetDateTime::now_utc()
            .format(&Rfc3339)
            .unwrap_or_else(|_| "unknown".to_string()),
        tools: builtin_tool_descriptors(),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DiagnosticLevel {
    Error,
    Warning,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Diagnostic {
    pub level: DiagnosticLevel,
    pub location: Option<String>,
    pub message: String,
}

impl Diagnostic {
    fn error(location: Option<String>, message: impl Into<String>) -> Self {
        Self {
            level: DiagnosticLevel::Error,
            location,
            message: message.into(),
        }
    }

    fn warning(location: Option<String>, message: impl Into<String>) -> Self {
        Self {
            level: DiagnosticLevel::Warning,
            location,
            message: message.into(),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self.level, DiagnosticLevel::Error)
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let level = match self.level {
            DiagnosticLevel::Error => "error",
            DiagnosticLevel::Warning => "warn",
        };
        match &self.location {
            Some(location) => write!(f, "[{level}] {location}: {}", self.message),
            None => write!(f, "[{level}] {}", self.message),
        }
    }
}

/// Checks named arguments against the tool's declared parameters.
pub fn validate_arguments(kind: ToolKind, args: &Value) -> Vec<Diagnostic> {
    let schema = kind.schema();
    let mut diagnostics = Vec::new();

    let Some(object) = args.as_object() else {
        diagnostics.push(Diagnostic::error(
            Some(schema.name.to_string()),
            "tool input must be a JSON object of named arguments",
        ));
        return diagnostics;
    };

    for param in schema.params {
        let location = Some(format!("{}.{}", schema.name, param.name));
        match object.get(param.name) {
            None | Some(Value::Null) => {
                if param.required {
                    diagnostics.push(Diagnostic::error(
                        location,
                        format!(
                            "missing required parameter '{}' for tool '{}'",
                            param.name, schema.name
                        ),
                    ));
                }
            }
            Some(value) => {
                if !param.kind.accepts(value) {
                    diagnostics.push(Diagnostic::error(
                        location,
                        format!("parameter '{}' must be {}", param.name, param.kind.expected()),
                    ));
                } else if param.required && param.non_empty && is_blank(value) {
                    diagnostics.push(Diagnostic::error(
                        location,
                        format!(
                            "parameter '{}' for tool '{}' cannot be empty",
                            param.name, schema.name
                        ),
                    ));
                }
            }
        }
    }

    for key in object.keys() {
        if !schema.allows(key) {
            diagnostics.push(Diagnostic::warning(
                Some(schema.name.to_string()),
                format!(
                    "unknown parameter '{}' for tool '{}'; it will be ignored",
                    key, schema.name
                ),
            ));
        }
    }

    diagnostics
}

fn is_blank(value: &Value) -> bool {
    match value {
        Value::String(text) => text.trim().is_empty(),
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

#[derive(Debug, Clone, Copy)]
enum ParamKind {
    Text,
    /// A free-text requirement or a structured object describing it.
    TextOrObject,
    /// `"True"`/`"False"`; real booleans are tolerated.
    BoolText,
}

impl ParamKind {
    fn accepts(&self, value: &Value) -> bool {
        match self {
            ParamKind::Text => value.is_string(),
            ParamKind::TextOrObject => value.is_string() || value.is_object(),
            ParamKind::BoolText => value.is_string() || value.is_boolean(),
        }
    }

    fn expected(&self) -> &'static str {
        match self {
            ParamKind::Text => "a string",
            ParamKind::TextOrObject => "a string or an object",
            ParamKind::BoolText => "a boolean string",
        }
    }

    fn json_schema(&self, description: &str, default: Option<&str>) -> Value {
        let mut schema = match self {
            ParamKind::Text | ParamKind::BoolText => json!({ "type": "string" }),
            ParamKind::TextOrObject => json!({ "type": ["string", "object"] }),
        };
        schema["description"] = json!(description);
        if let Some(default) = default {
            schema["default"] = json!(default);
        }
        schema
    }
}

struct ParamDef {
    name: &'static str,
    description: &'static str,
    kind: ParamKind,
    required: bool,
    non_empty: bool,
    default: Option<&'static str>,
}

struct ToolSchemaDef {
    name: &'static str,
    description: &'static str,
    params: &'static [ParamDef],
}

impl ToolSchemaDef {
    fn allows(&self, key: &str) -> bool {
        self.params.iter().any(|param| param.name == key)
    }

    fn to_descriptor(&self) -> ToolDescriptor {
        let mut properties = Map::new();
        for param in self.params {
            properties.insert(
                param.name.to_string(),
                param.kind.json_schema(param.description, param.default),
            );
        }
        let required: Vec<String> = self
            .params
            .iter()
            .filter(|param| param.required)
            .map(|param| param.name.to_string())
            .collect();
        let optional = self
            .params
            .iter()
            .filter(|param| !param.required)
            .map(|param| param.name.to_string())
            .collect();

        ToolDescriptor {
            name: self.name.to_string(),
            description: self.description.to_string(),
            parameters: json!({
                "type": "object",
                "properties": properties,
                "required": required,
            }),
            required,
            optional,
        }
    }
}

const SCHEMA_VERSION: &str = "1.0.0";

const SENTENCE: &str = "sentence";

static BUILTIN_SCHEMAS: [ToolSchemaDef; 6] = [
    ToolSchemaDef {
        name: "RunKubectlTool",
        description: "The tool to execute a kubectl command.
This tool returns the following:
  - return_code: if 0, the command was successful, otherwise, failure.
  - stdout: standard output of the command (only when `return_output` is True)
  - stderr: standard error of the command (only when error occurred)

For example, to execute `kubectl get pod -n default --kubeconfig kubeconfig.yaml`,
Tool Input should be the following:
{\"args\": \"get pod -n default --kubeconfig kubeconfig.yaml\", \"output_file\": \"\", \"return_output\": \"True\", \"script_file\": \"\"}

Hint:
- If you need to get all pods in all namespaces, you can do it by `kubectl get pods --all-namespaces --kubeconfig <kubeconfig_path> -o json`",
        params: &[
            ParamDef {
                name: "args",
                description: "command arguments after `kubectl`. `--kubeconfig` should be specified here. Multiple commands with `;` or `&&` is not allowed.",
                kind: ParamKind::Text,
                required: true,
                non_empty: true,
                default: None,
            },
            ParamDef {
                name: "output_file",
                description: "The filepath to save the result. If empty string, not save anything",
                kind: ParamKind::Text,
                required: false,
                non_empty: false,
                default: Some(""),
            },
            ParamDef {
                name: "return_output",
                description: "A boolean string. Set this to \"True\" if you want to get the command output",
                kind: ParamKind::BoolText,
                required: false,
                non_empty: false,
                default: Some("False"),
            },
            ParamDef {
                name: "script_file",
                description: "A filepath. If provided, save the kubectl command as a script at the specified file.",
                kind: ParamKind::Text,
                required: false,
                non_empty: false,
                default: Some(""),
            },
        ],
    },
    ToolSchemaDef {
        name: "GenerateOPARegoTool",
        description: "The tool to generate an OPA Rego policy. This tool returns the generated Rego policy.",
        params: &[
            ParamDef {
                name: SENTENCE,
                description: "A short description of OPA Rego policy to be generated. This includes what is validated with the Rego policy evaluation.",
                kind: ParamKind::TextOrObject,
                required: true,
                non_empty: true,
                default: None,
            },
            ParamDef {
                name: "policy_file",
                description: "A filepath for the Rego policy to be saved.",
                kind: ParamKind::Text,
                required: true,
                non_empty: false,
                default: Some("policy.rego"),
            },
            ParamDef {
                name: "input_file",
                description: "The filepath to the input data to be used for checking the policy.",
                kind: ParamKind::Text,
                required: true,
                non_empty: false,
                default: None,
            },
        ],
    },
    ToolSchemaDef {
        name: "RunOPARegoTool",
        description: "The tool to run OPA Rego evaluation. This tool returns the check result.",
        params: &[
            ParamDef {
                name: "policy_file",
                description: "Rego policy filepath to be evaluated",
                kind: ParamKind::Text,
                required: true,
                non_empty: true,
                default: None,
            },
            ParamDef {
                name: "input_file",
                description: "The filepath to the input data to be used for checking the policy",
                kind: ParamKind::Text,
                required: true,
                non_empty: true,
                default: None,
            },
        ],
    },
    ToolSchemaDef {
        name: "GenerateKyvernoTool",
        description: "The tool to generate a Kyverno policy. This tool returns the generated Kyverno policy. This can be used for updating existing Kyverno policy.",
        params: &[
            ParamDef {
                name: SENTENCE,
                description: "A short description of Kyverno policy to be generated. This includes what is validated with the Kyverno policy.",
                kind: ParamKind::TextOrObject,
                required: true,
                non_empty: true,
                default: None,
            },
            ParamDef {
                name: "policy_file",
                description: "filepath for the Kyverno policy to be saved.",
                kind: ParamKind::Text,
                required: true,
                non_empty: false,
                default: Some("policy.yaml"),
            },
            ParamDef {
                name: "current_policy_file",
                description: "filepath of the current Kyverno policy to be updated. Only needed when updating an existing policy",
                kind: ParamKind::Text,
                required: false,
                non_empty: false,
                default: Some(""),
            },
        ],
    },
    ToolSchemaDef {
        name: "GeneratePlaybookTool",
        description: "The tool to generate a Playbook. This tool returns the generated Playbook.",
        params: &[
            ParamDef {
                name: SENTENCE,
                description: "A short description of Ansible Playbook to be generated. This includes the compliance requirement. This includes what is accomplished with the Playbook execution.",
                kind: ParamKind::TextOrObject,
                required: true,
                non_empty: true,
                default: None,
            },
            ParamDef {
                name: "playbook_file",
                description: "A filepath for the Playbook to be saved.",
                kind: ParamKind::Text,
                required: false,
                non_empty: false,
                default: Some("playbook.yml"),
            },
        ],
    },
    ToolSchemaDef {
        name: "RunPlaybookTool",
        description: "The tool to run a playbook on a given host.
This tool returns the following:
  - returncode: if 0, the command was successful, otherwise, failure.
  - stdout: standard output of the command
  - stderr: standard error of the command (only when error occurred)",
        params: &[
            ParamDef {
                name: "host",
                description: "The hostname where the Playbook should be executed",
                kind: ParamKind::Text,
                required: true,
                non_empty: true,
                default: None,
            },
            ParamDef {
                name: "playbook_file",
                description: "Playbook filepath to be run",
                kind: ParamKind::Text,
                required: true,
                non_empty: true,
                default: None,
            },
        ],
    },
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_kind_round_trips_through_its_name() {
        for kind in ToolKind::ALL {
            assert_eq!(ToolKind::from_name(kind.name()), Some(kind));
        }
        assert_eq!(ToolKind::from_name("runkubectltool"), Some(ToolKind::RunKubectl));
        assert_eq!(ToolKind::from_name("DeleteClusterTool"), None);
    }

    #[test]
    fn descriptor_exposes_json_schema() {
        let descriptor = ToolKind::RunKubectl.descriptor();
        assert_eq!(descriptor.required, vec!["args".to_string()]);
        assert_eq!(
            descriptor.optional,
            vec!["output_file", "return_output", "script_file"]
        );
        assert_eq!(descriptor.parameters["type"], "object");
        assert_eq!(
            descriptor.parameters["properties"]["return_output"]["default"],
            "False"
        );
    }

    #[test]
    fn missing_and_empty_required_arguments_are_errors() {
        let diagnostics = validate_arguments(ToolKind::RunRego, &json!({ "policy_file": " " }));
        let errors: Vec<_> = diagnostics.iter().filter(|d| d.is_error()).collect();
        assert_eq!(errors.len(), 2);
        assert!(errors[0].message.contains("cannot be empty"));
        assert!(errors[1].message.contains("missing required parameter 'input_file'"));
    }

    #[test]
    fn unknown_arguments_only_warn() {
        let diagnostics = validate_arguments(
            ToolKind::RunKubectl,
            &json!({ "args": "get pods --kubeconfig kubeconfig.yaml", "namespace": "default" }),
        );
        assert_eq!(diagnostics.len(), 1);
        assert!(!diagnostics[0].is_error());
        assert!(diagnostics[0].to_string().contains("namespace"));
    }

    #[test]
    fn requirement_may_be_an_object() {
        let diagnostics = validate_arguments(
            ToolKind::GenerateRego,
            &json!({
                "sentence": { "condition": "no privileged pods" },
                "policy_file": "",
                "input_file": "collected_data.json"
            }),
        );
        assert!(diagnostics.iter().all(|d| !d.is_error()), "{diagnostics:?}");
    }

    #[test]
    fn non_object_input_is_rejected() {
        let diagnostics = validate_arguments(ToolKind::RunPlaybook, &json!("playbook.yml"));
        assert_eq!(diagnostics.len(), 1);
        assert!(diagnostics[0].is_error());
    }

    #[test]
    fn bundle_lists_all_tools() {
        let bundle = builtin_tool_schema_bundle();
        assert_eq!(bundle.version, SCHEMA_VERSION);
        assert_eq!(bundle.tools.len(), ToolKind::ALL.len());
    }
}
