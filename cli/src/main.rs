use anyhow::{anyhow, Context};
use ciso_core::{
    builtin_tool_schema_bundle, AgentConfig, ConfigFile, LlmSection, LoadOptions, OpenAiClient,
    ScenarioInputs, ScenarioKind, ScenarioOutcome, ScenarioRunner, Tool, ToolContext,
    ToolDescriptor, ToolKind, WorkingDirectory,
};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

const DEFAULT_KUBE_COMPLIANCE: &str =
    "Ensure that the cluster-admin role is only used where required";
const DEFAULT_RHEL_COMPLIANCE: &str = "Ensure that the cron daemon is enabled";

#[derive(Debug, Parser)]
#[command(author, version, about = "Compliance agent: drives kubectl/OPA/Kyverno/Ansible checks from an LLM planner")]
struct CisoCli {
    /// YAML config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Log filter, e.g. `debug` or `ciso_core=debug` (defaults to RUST_LOG, then `info`)
    #[arg(long, global = true)]
    log_level: Option<String>,
    /// Print the tool-call transcript as JSON instead of a table
    #[arg(long, global = true)]
    json: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Collect cluster data with kubectl and check it with an OPA Rego policy
    KubectlOpa {
        /// The compliance requirement to check
        #[arg(short, long, default_value = DEFAULT_KUBE_COMPLIANCE)]
        compliance: String,
        /// Path to the kubeconfig of the target cluster
        #[arg(short, long)]
        kubeconfig: PathBuf,
        #[command(flatten)]
        run: RunArgs,
    },
    /// Generate and deploy a Kyverno policy
    Kyverno {
        /// The compliance requirement the policy must enforce
        #[arg(short, long, default_value = DEFAULT_KUBE_COMPLIANCE)]
        compliance: String,
        /// Path to the kubeconfig of the target cluster
        #[arg(short, long)]
        kubeconfig: PathBuf,
        #[command(flatten)]
        run: RunArgs,
    },
    /// Update deployed Kyverno policies for an additional requirement
    KyvernoUpdate {
        /// The requirement the deployed policies already enforce
        #[arg(short = 'c', long)]
        current_compliance: String,
        /// The additional requirement
        #[arg(short = 'u', long)]
        updated_compliance: String,
        /// Path to the kubeconfig of the target cluster
        #[arg(short, long)]
        kubeconfig: PathBuf,
        #[command(flatten)]
        run: RunArgs,
    },
    /// Collect host data with an Ansible playbook and check it with OPA Rego
    PlaybookOpa {
        /// The compliance requirement to check
        #[arg(short, long, default_value = DEFAULT_RHEL_COMPLIANCE)]
        compliance: String,
        /// Path to the Ansible inventory for `rhel9_servers`; defaults to the
        /// `inventory.ansible.ini` already in the working directory
        #[arg(short, long)]
        inventory: Option<PathBuf>,
        #[command(flatten)]
        run: RunArgs,
    },
    /// Run a single tool directly with JSON input
    Invoke {
        /// Tool name, e.g. RunKubectlTool
        tool: String,
        /// Named arguments as a JSON object
        #[arg(long)]
        input: String,
        /// Working directory the tool resolves files against
        #[arg(short, long)]
        workdir: PathBuf,
        /// Only allow `kubectl get`
        #[arg(long)]
        read_only: bool,
    },
    /// Export builtin tool schemas
    Schema {
        /// Filter by tool name
        #[arg(long)]
        tool: Option<String>,
        /// Output format
        #[arg(long, default_value_t = SchemaFormat::Json)]
        format: SchemaFormat,
    },
}

#[derive(Debug, Args)]
struct RunArgs {
    /// Working directory for generated files (default: a timestamped directory)
    #[arg(short, long)]
    workdir: Option<PathBuf>,
    /// Also write the result JSON to this file
    #[arg(short, long)]
    output: Option<PathBuf>,
    /// Planner model name
    #[arg(long)]
    model: Option<String>,
    /// Planner iterations allowed per task
    #[arg(long)]
    max_iterations: Option<usize>,
    /// Per-command timeout in seconds; 0 disables it
    #[arg(long)]
    command_timeout_secs: Option<u64>,
}

impl RunArgs {
    fn overrides(&self) -> ConfigFile {
        ConfigFile {
            llm: LlmSection {
                model: self.model.clone(),
                ..LlmSection::default()
            },
            command_timeout_secs: self.command_timeout_secs,
            max_iterations: self.max_iterations,
            ..ConfigFile::default()
        }
    }
}

fn main() -> anyhow::Result<()> {
    let cli = CisoCli::parse();
    init_tracing(cli.log_level.as_deref())?;

    match cli.command {
        Command::KubectlOpa {
            compliance,
            kubeconfig,
            run,
        } => {
            let inputs = ScenarioInputs {
                compliance,
                updated_compliance: None,
                workdir: run.workdir.clone(),
                credential: Some(kubeconfig),
            };
            run_scenario(ScenarioKind::KubectlOpa, inputs, &run, cli.config, cli.json)?;
        }
        Command::Kyverno {
            compliance,
            kubeconfig,
            run,
        } => {
            let inputs = ScenarioInputs {
                compliance,
                updated_compliance: None,
                workdir: run.workdir.clone(),
                credential: Some(kubeconfig),
            };
            run_scenario(ScenarioKind::Kyverno, inputs, &run, cli.config, cli.json)?;
        }
        Command::KyvernoUpdate {
            current_compliance,
            updated_compliance,
            kubeconfig,
            run,
        } => {
            let inputs = ScenarioInputs {
                compliance: current_compliance,
                updated_compliance: Some(updated_compliance),
                workdir: run.workdir.clone(),
                credential: Some(kubeconfig),
            };
            run_scenario(ScenarioKind::KyvernoUpdate, inputs, &run, cli.config, cli.json)?;
        }
        Command::PlaybookOpa {
            compliance,
            inventory,
            run,
        } => {
            let inputs = ScenarioInputs {
                compliance,
                updated_compliance: None,
                workdir: run.workdir.clone(),
                credential: inventory,
            };
            run_scenario(ScenarioKind::PlaybookOpa, inputs, &run, cli.config, cli.json)?;
        }
        Command::Invoke {
            tool,
            input,
            workdir,
            read_only,
        } => {
            invoke_tool(&tool, &input, &workdir, read_only, cli.config)?;
        }
        Command::Schema { tool, format } => {
            output_schema(tool, format)?;
        }
    }

    Ok(())
}

fn init_tracing(level: Option<&str>) -> anyhow::Result<()> {
    let filter = match level {
        Some(level) => EnvFilter::try_new(level)
            .map_err(|err| anyhow!("invalid --log-level '{level}': {err}"))?,
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();
    Ok(())
}

fn load_config(path: Option<PathBuf>, overrides: ConfigFile) -> anyhow::Result<AgentConfig> {
    let config = AgentConfig::load(LoadOptions {
        config_path: path,
        overrides,
    })?;
    info!(
        planner_model = %config.agent_llm.model,
        code_gen_model = %config.code_gen_llm.model,
        "configuration loaded"
    );
    Ok(config)
}

fn run_scenario(
    kind: ScenarioKind,
    inputs: ScenarioInputs,
    run: &RunArgs,
    config_path: Option<PathBuf>,
    json: bool,
) -> anyhow::Result<()> {
    let config = load_config(config_path, run.overrides())?;
    let completion = Arc::new(OpenAiClient::new(config.code_gen_llm.clone())?);
    let mut planner = OpenAiClient::new(config.agent_llm.clone())?;

    let mut runner = ScenarioRunner::new(config, completion);
    let outcome = runner
        .run(kind, &inputs, &mut planner)
        .with_context(|| format!("{kind} scenario failed"))?;

    output_outcome(&outcome, run.output.as_deref(), json)
}

fn output_outcome(outcome: &ScenarioOutcome, output: Option<&Path>, json: bool) -> anyhow::Result<()> {
    // stdout carries only the result
    if json {
        eprintln!("{}", serde_json::to_string_pretty(&outcome.transcript)?);
    } else {
        eprintln!("{}", outcome.transcript.render_table());
        eprintln!("{outcome}");
        if outcome.transcript.has_failures() {
            eprintln!("[warn] some tool calls failed");
            eprint!("{}", outcome.transcript);
        }
    }

    let result = serde_json::to_string_pretty(&outcome.report)?;
    println!("---- Result ----");
    println!("{result}");
    println!("----------------");

    if let Some(path) = output {
        fs::write(path, &result)
            .with_context(|| format!("failed to write result to {}", path.display()))?;
    }
    Ok(())
}

fn invoke_tool(
    name: &str,
    input: &str,
    workdir: &Path,
    read_only: bool,
    config_path: Option<PathBuf>,
) -> anyhow::Result<()> {
    let kind = ToolKind::from_name(name).ok_or_else(|| anyhow!("unknown tool '{name}'"))?;
    let args: Value = serde_json::from_str(input).context("--input must be a JSON object")?;

    let config = load_config(config_path, ConfigFile::default())?;
    let completion = Arc::new(OpenAiClient::new(config.code_gen_llm.clone())?);
    let workdir = WorkingDirectory::create(workdir)
        .with_context(|| format!("failed to create {}", workdir.display()))?;
    let ctx = ToolContext::new(&config, workdir, completion, read_only);

    let output = Tool::build(kind, &ctx).invoke(&args)?;
    match output {
        Value::String(text) => println!("{text}"),
        other => println!("{}", serde_json::to_string_pretty(&other)?),
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum SchemaFormat {
    Json,
    Yaml,
}

impl std::fmt::Display for SchemaFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let value = match self {
            SchemaFormat::Json => "json",
            SchemaFormat::Yaml => "yaml",
        };
        write!(f, "{value}")
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct SchemaResponse {
    version: String,
    generated_at: String,
    tools: Vec<ToolDescriptor>,
}

fn output_schema(tool: Option<String>, format: SchemaFormat) -> anyhow::Result<()> {
    let bundle = builtin_tool_schema_bundle();
    let mut tools = bundle.tools;

    if let Some(filter) = tool {
        let kind = ToolKind::from_name(&filter).ok_or_else(|| anyhow!("unknown tool '{filter}'"))?;
        tools.retain(|schema| schema.name == kind.name());
    }

    let response = SchemaResponse {
        version: bundle.version,
        generated_at: bundle.generated_at,
        tools,
    };

    match format {
        SchemaFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&response)?);
        }
        SchemaFormat::Yaml => {
            let yaml = serde_yaml::to_string(&response)?;
            print!("{yaml}");
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn playbook_opa_defaults_to_cron_requirement_without_inventory() {
        let cli = CisoCli::try_parse_from(["ciso", "playbook-opa", "-w", "ws"]).expect("parses");
        match cli.command {
            Command::PlaybookOpa {
                compliance,
                inventory,
                run,
            } => {
                assert_eq!(compliance, "Ensure that the cron daemon is enabled");
                assert!(inventory.is_none());
                assert_eq!(run.workdir, Some(PathBuf::from("ws")));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn kubectl_opa_still_requires_kubeconfig() {
        assert!(CisoCli::try_parse_from(["ciso", "kubectl-opa"]).is_err());
    }
}
