//! Application configuration for repolore.
//!
//! User config lives at `~/.repolore/repolore.toml`.
//! CLI flags override config file values, which override defaults.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{RepoloreError, Result};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "repolore.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".repolore";

// ---------------------------------------------------------------------------
// Config structs (matching repolore.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Orchestrator settings.
    #[serde(default)]
    pub pipeline: PipelineSection,

    /// Production agent bridge settings.
    #[serde(default)]
    pub agent: AgentSection,

    /// Persistence settings.
    #[serde(default)]
    pub storage: StorageSection,
}

/// What to do when no production agent is available.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissingAgentPolicy {
    /// Ask the user; fall back to degrading when no answer arrives in time.
    Ask,
    /// Run the heuristic-only path without asking.
    Degrade,
    /// Stop the run.
    Abort,
}

/// `[pipeline]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSection {
    /// Ceiling for one dimension's production call, in seconds.
    #[serde(default = "default_production_timeout")]
    pub production_timeout_secs: u64,

    /// How long to wait for a user decision when the agent is missing.
    #[serde(default = "default_decision_timeout")]
    pub decision_timeout_secs: u64,

    /// Behaviour when no production agent is available.
    #[serde(default = "default_missing_agent")]
    pub on_missing_agent: MissingAgentPolicy,

    /// Actor recorded on every persisted candidate.
    #[serde(default = "default_actor")]
    pub actor: String,

    /// Skip dimensions that already have a digest in a restored checkpoint.
    #[serde(default = "default_true")]
    pub resume: bool,
}

impl Default for PipelineSection {
    fn default() -> Self {
        Self {
            production_timeout_secs: default_production_timeout(),
            decision_timeout_secs: default_decision_timeout(),
            on_missing_agent: default_missing_agent(),
            actor: default_actor(),
            resume: default_true(),
        }
    }
}

fn default_production_timeout() -> u64 {
    180
}
fn default_decision_timeout() -> u64 {
    30
}
fn default_missing_agent() -> MissingAgentPolicy {
    MissingAgentPolicy::Ask
}
fn default_actor() -> String {
    "repolore-bootstrap".into()
}
fn default_true() -> bool {
    true
}

/// `[agent]` section — the JSON-lines bridge subprocess.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSection {
    /// Whether the bridge should be treated as a real production agent.
    #[serde(default)]
    pub enabled: bool,

    /// Bridge command (e.g., "bun").
    #[serde(default = "default_agent_command")]
    pub command: String,

    /// Bridge script path.
    #[serde(default = "default_agent_script")]
    pub script: String,

    /// Working directory for the bridge subprocess.
    #[serde(default = "default_working_dir")]
    pub working_dir: String,

    /// Model identifier forwarded to the bridge.
    #[serde(default = "default_model")]
    pub model: String,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            enabled: false,
            command: default_agent_command(),
            script: default_agent_script(),
            working_dir: default_working_dir(),
            model: default_model(),
        }
    }
}

fn default_agent_command() -> String {
    "bun".into()
}
fn default_agent_script() -> String {
    "packages/ts/agent-bridge/src/bridge.ts".into()
}
fn default_working_dir() -> String {
    ".".into()
}
fn default_model() -> String {
    "anthropic/claude-sonnet-4".into()
}

/// `[storage]` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageSection {
    /// Database path. Defaults to `~/.repolore/repolore.db`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub db_path: Option<String>,
}

impl StorageSection {
    /// Resolve the database path, falling back to the config directory.
    pub fn resolve_db_path(&self) -> Result<PathBuf> {
        match &self.db_path {
            Some(p) => Ok(PathBuf::from(p)),
            None => Ok(config_dir()?.join("repolore.db")),
        }
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.repolore/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| RepoloreError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.repolore/repolore.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| RepoloreError::io(path, e))?;

    toml::from_str(&content).map_err(|e| {
        RepoloreError::config(format!("failed to parse {}: {e}", path.display()))
    })
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| RepoloreError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| RepoloreError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| RepoloreError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize default config");
        assert!(toml_str.contains("production_timeout_secs"));
        assert!(toml_str.contains("on_missing_agent = \"ask\""));
    }

    #[test]
    fn config_roundtrip() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize");
        let parsed: AppConfig = toml::from_str(&toml_str).expect("deserialize");
        assert_eq!(parsed.pipeline.production_timeout_secs, 180);
        assert_eq!(parsed.pipeline.decision_timeout_secs, 30);
        assert!(!parsed.agent.enabled);
    }

    #[test]
    fn partial_config_fills_defaults() {
        let toml_str = r#"
[pipeline]
on_missing_agent = "degrade"

[agent]
enabled = true
script = "bridge/run.ts"
"#;
        let config: AppConfig = toml::from_str(toml_str).expect("parse");
        assert_eq!(config.pipeline.on_missing_agent, MissingAgentPolicy::Degrade);
        assert_eq!(config.pipeline.production_timeout_secs, 180);
        assert!(config.agent.enabled);
        assert_eq!(config.agent.command, "bun");
        assert_eq!(config.agent.script, "bridge/run.ts");
    }

    #[test]
    fn explicit_db_path_wins() {
        let section = StorageSection {
            db_path: Some("/tmp/lore.db".into()),
        };
        assert_eq!(
            section.resolve_db_path().expect("resolve"),
            PathBuf::from("/tmp/lore.db")
        );
    }

    #[test]
    fn load_from_file() {
        let path = std::env::temp_dir().join(format!("repolore_cfg_{}.toml", uuid::Uuid::now_v7()));
        std::fs::write(&path, "[pipeline]\nproduction_timeout_secs = 5\n").expect("write");
        let config = load_config_from(&path).expect("load");
        assert_eq!(config.pipeline.production_timeout_secs, 5);
        let _ = std::fs::remove_file(&path);
    }
}
