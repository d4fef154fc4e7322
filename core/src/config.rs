use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_MODEL: &str = "gpt-4o";
pub const DEFAULT_WORKDIR_ROOT: &str = "/tmp/agent/";
pub const DEFAULT_OUTPUT_CAP: usize = 1000;
pub const DEFAULT_MAX_ITERATIONS: usize = 25;
pub const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 300;
const DEFAULT_LLM_TIMEOUT_SECS: u64 = 120;

/// Settings for one OpenAI-compatible endpoint.
#[derive(Clone, PartialEq, Eq)]
pub struct LlmSettings {
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub timeout_secs: u64,
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key: None,
            model: DEFAULT_MODEL.to_string(),
            timeout_secs: DEFAULT_LLM_TIMEOUT_SECS,
        }
    }
}

impl fmt::Debug for LlmSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LlmSettings")
            .field("base_url", &self.base_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "***"))
            .field("model", &self.model)
            .field("timeout_secs", &self.timeout_secs)
            .finish()
    }
}

/// External binaries the tools shell out to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Binaries {
    pub kubectl: String,
    pub opa: String,
    pub ansible_playbook: String,
}

impl Default for Binaries {
    fn default() -> Self {
        Self {
            kubectl: "kubectl".to_string(),
            opa: "opa".to_string(),
            ansible_playbook: "ansible-playbook".to_string(),
        }
    }
}

/// Everything a scenario run and its tools need, resolved once up front.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentConfig {
    pub agent_llm: LlmSettings,
    pub code_gen_llm: LlmSettings,
    pub workdir_root: PathBuf,
    pub command_timeout: Option<Duration>,
    pub max_iterations: usize,
    pub output_cap: usize,
    pub binaries: Binaries,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            agent_llm: LlmSettings::default(),
            code_gen_llm: LlmSettings::default(),
            workdir_root: PathBuf::from(DEFAULT_WORKDIR_ROOT),
            command_timeout: Some(Duration::from_secs(DEFAULT_COMMAND_TIMEOUT_SECS)),
            max_iterations: DEFAULT_MAX_ITERATIONS,
            output_cap: DEFAULT_OUTPUT_CAP,
            binaries: Binaries::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LlmSection {
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    pub model: Option<String>,
    pub timeout_secs: Option<u64>,
}

impl LlmSection {
    fn overlay(&mut self, other: LlmSection) {
        if other.base_url.is_some() {
            self.base_url = other.base_url;
        }
        if other.api_key.is_some() {
            self.api_key = other.api_key;
        }
        if other.model.is_some() {
            self.model = other.model;
        }
        if other.timeout_secs.is_some() {
            self.timeout_secs = other.timeout_secs;
        }
    }
}

/// Shape of the optional YAML config file. Every field is optional.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConfigFile {
    pub llm: LlmSection,
    pub code_gen: LlmSection,
    pub workdir_root: Option<PathBuf>,
    /// `0` disables the timeout.
    pub command_timeout_secs: Option<u64>,
    pub max_iterations: Option<usize>,
    pub output_cap: Option<usize>,
    pub kubectl: Option<String>,
    pub opa: Option<String>,
    pub ansible_playbook: Option<String>,
}

impl ConfigFile {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::ReadFile {
            path: path.to_path_buf(),
            source,
        })?;
        serde_yaml::from_str(&content).map_err(|source| ConfigError::ParseFile {
            path: path.to_path_buf(),
            source,
        })
    }

    fn overlay(&mut self, other: ConfigFile) {
        self.llm.overlay(other.llm);
        self.code_gen.overlay(other.code_gen);
        if other.workdir_root.is_some() {
            self.workdir_root = other.workdir_root;
        }
        if other.command_timeout_secs.is_some() {
            self.command_timeout_secs = other.command_timeout_secs;
        }
        if other.max_iterations.is_some() {
            self.max_iterations = other.max_iterations;
        }
        if other.output_cap.is_some() {
            self.output_cap = other.output_cap;
        }
        if other.kubectl.is_some() {
            self.kubectl = other.kubectl;
        }
        if other.opa.is_some() {
            self.opa = other.opa;
        }
        if other.ansible_playbook.is_some() {
            self.ansible_playbook = other.ansible_playbook;
        }
    }

    fn resolve(self) -> AgentConfig {
        let defaults = AgentConfig::default();
        let agent_llm = resolve_llm(&self.llm, &LlmSection::default());
        // code generation falls back to the agent endpoint field by field
        let code_gen_llm = resolve_llm(&self.code_gen, &self.llm);

        let command_timeout = match self.command_timeout_secs {
            Some(0) => None,
            Some(secs) => Some(Duration::from_secs(secs)),
            None => defaults.command_timeout,
        };

        AgentConfig {
            agent_llm,
            code_gen_llm,
            workdir_root: self.workdir_root.unwrap_or(defaults.workdir_root),
            command_timeout,
            max_iterations: self.max_iterations.unwrap_or(defaults.max_iterations),
            output_cap: self.output_cap.unwrap_or(defaults.output_cap),
            binaries: Binaries {
                kubectl: self.kubectl.unwrap_or(defaults.binaries.kubectl),
                opa: self.opa.unwrap_or(defaults.binaries.opa),
                ansible_playbook: self
                    .ansible_playbook
                    .unwrap_or(defaults.binaries.ansible_playbook),
            },
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    pub config_path: Option<PathBuf>,
    /// Highest precedence; usually filled from CLI flags.
    pub overrides: ConfigFile,
}

impl AgentConfig {
    /// Defaults, then the config file, then process environment, then overrides.
    pub fn load(options: LoadOptions) -> Result<Self, ConfigError> {
        let file = match &options.config_path {
            Some(path) => ConfigFile::load(path)?,
            None => ConfigFile::default(),
        };
        Self::from_sources(file, |key: &str| env::var(key).ok(), options.overrides)
    }

    pub fn from_sources<F>(
        file: ConfigFile,
        lookup: F,
        overrides: ConfigFile,
    ) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut merged = file;
        merged.overlay(env_layer(&lookup)?);
        merged.overlay(overrides);
        Ok(merged.resolve())
    }
}

fn resolve_llm(primary: &LlmSection, fallback: &LlmSection) -> LlmSettings {
    let defaults = LlmSettings::default();
    LlmSettings {
        base_url: primary
            .base_url
            .clone()
            .or_else(|| fallback.base_url.clone())
            .unwrap_or(defaults.base_url),
        api_key: primary
            .api_key
            .clone()
            .or_else(|| fallback.api_key.clone())
            .filter(|key| !key.is_empty()),
        model: primary
            .model
            .clone()
            .or_else(|| fallback.model.clone())
            .unwrap_or(defaults.model),
        timeout_secs: primary
            .timeout_secs
            .or(fallback.timeout_secs)
            .unwrap_or(defaults.timeout_secs),
    }
}

fn env_layer<F>(lookup: &F) -> Result<ConfigFile, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let get = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

    Ok(ConfigFile {
        llm: LlmSection {
            base_url: get("LLM_BASE_URL"),
            api_key: get("LLM_API_KEY"),
            model: get("LLM_MODEL"),
            timeout_secs: parse_number(&get, "LLM_TIMEOUT_SECS")?,
        },
        code_gen: LlmSection {
            base_url: get("CODE_GEN_BASE_URL"),
            api_key: get("CODE_GEN_API_KEY"),
            model: get("CODE_GEN_MODEL"),
            timeout_secs: None,
        },
        workdir_root: get("CISO_WORKDIR_ROOT").map(PathBuf::from),
        command_timeout_secs: parse_number(&get, "CISO_COMMAND_TIMEOUT_SECS")?,
        max_iterations: parse_number(&get, "CISO_MAX_ITERATIONS")?,
        output_cap: None,
        kubectl: get("CISO_KUBECTL"),
        opa: get("CISO_OPA"),
        ansible_playbook: get("CISO_ANSIBLE_PLAYBOOK"),
    })
}

fn parse_number<T, G>(get: &G, key: &str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue {
                key: key.to_string(),
                value: raw,
            }),
        None => Ok(None),
    }
}
