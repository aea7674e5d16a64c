use std::path::PathBuf;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::TriageError;

/// What the external agent CLI is capable of; the runner chooses argv
/// and environment from this at spawn time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerCapability {
    #[serde(default = "default_runner_type")]
    pub runner_type: String,
    #[serde(default = "default_max_turns")]
    pub max_turns: u32,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    #[serde(default)]
    pub allowed_tools: Vec<String>,
    #[serde(default)]
    pub skip_permissions: bool,
}

fn default_runner_type() -> String {
    "claude-code".to_string()
}

fn default_max_turns() -> u32 {
    40
}

fn default_timeout_seconds() -> u64 {
    1_800
}

impl Default for RunnerCapability {
    fn default() -> Self {
        Self {
            runner_type: default_runner_type(),
            max_turns: default_max_turns(),
            timeout_seconds: default_timeout_seconds(),
            allowed_tools: Vec::new(),
            skip_permissions: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentProfile {
    pub id: String,
    /// Executable to spawn; defaults per runner type when empty.
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub runner: RunnerCapability,
}

impl AgentProfile {
    fn fallback(id: &str) -> Self {
        Self {
            id: id.to_string(),
            command: String::new(),
            runner: RunnerCapability::default(),
        }
    }

    /// Concrete argv for one invocation. The prompt always travels as
    /// a single argument; flags depend on the runner type.
    pub fn build_invocation(&self, prompt: &str) -> (String, Vec<String>) {
        match self.runner.runner_type.as_str() {
            "codex" => {
                let command = if self.command.is_empty() {
                    "codex".to_string()
                } else {
                    self.command.clone()
                };
                let mut args = vec!["exec".to_string(), "--json".to_string()];
                if self.runner.skip_permissions {
                    args.push("--full-auto".to_string());
                }
                args.push(prompt.to_string());
                (command, args)
            }
            _ => {
                let command = if self.command.is_empty() {
                    "claude".to_string()
                } else {
                    self.command.clone()
                };
                let mut args = vec![
                    "-p".to_string(),
                    prompt.to_string(),
                    "--output-format".to_string(),
                    "stream-json".to_string(),
                    "--max-turns".to_string(),
                    self.runner.max_turns.to_string(),
                ];
                if !self.runner.allowed_tools.is_empty() {
                    args.push("--allowedTools".to_string());
                    args.push(self.runner.allowed_tools.join(","));
                }
                if self.runner.skip_permissions {
                    args.push("--dangerously-skip-permissions".to_string());
                }
                (command, args)
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSettings {
    #[serde(default = "default_agent_id")]
    pub default_agent: String,
    #[serde(default)]
    pub agents: Vec<AgentProfile>,
}

fn default_agent_id() -> String {
    "claude-code".to_string()
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            default_agent: default_agent_id(),
            agents: vec![AgentProfile::fallback(&default_agent_id())],
        }
    }
}

/// Process-scoped agent settings: loaded once from the scenario root,
/// re-read on `reload`, replaced wholesale when the scenario root
/// switches.
pub struct SettingsManager {
    path: RwLock<PathBuf>,
    settings: RwLock<AgentSettings>,
}

impl SettingsManager {
    pub fn load(path: PathBuf) -> Self {
        let settings = Self::read(&path);
        Self {
            path: RwLock::new(path),
            settings: RwLock::new(settings),
        }
    }

    fn read(path: &PathBuf) -> AgentSettings {
        match std::fs::read(path) {
            Ok(bytes) => match serde_yaml::from_slice::<AgentSettings>(&bytes) {
                Ok(settings) => settings,
                Err(err) => {
                    warn!(event = "agent_settings_invalid", path = %path.display(), error = %err);
                    AgentSettings::default()
                }
            },
            Err(_) => AgentSettings::default(),
        }
    }

    /// Re-read the document under the write lock, discarding any
    /// derived state readers may have cached.
    pub fn reload(&self) -> Result<(), TriageError> {
        let path = self.path.read().expect("settings path lock").clone();
        let fresh = Self::read(&path);
        *self.settings.write().expect("settings lock") = fresh;
        info!(event = "agent_settings_reloaded", path = %path.display());
        Ok(())
    }

    /// Point at a different settings document (scenario root switch)
    /// and reload immediately.
    pub fn set_path(&self, path: PathBuf) -> Result<(), TriageError> {
        *self.path.write().expect("settings path lock") = path;
        self.reload()
    }

    pub fn default_agent_id(&self) -> String {
        self.settings
            .read()
            .expect("settings lock")
            .default_agent
            .clone()
    }

    /// Resolve a profile by id; unknown ids get a fallback profile so
    /// a misconfigured trigger still runs with defaults.
    pub fn profile(&self, agent_id: &str) -> AgentProfile {
        let settings = self.settings.read().expect("settings lock");
        settings
            .agents
            .iter()
            .find(|profile| profile.id == agent_id)
            .cloned()
            .unwrap_or_else(|| AgentProfile::fallback(agent_id))
    }
}
