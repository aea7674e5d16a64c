use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

/// Snapshot cache TTL for the rate-limit manager's view of `open/`.
pub const RATE_LIMIT_SNAPSHOT_TTL: Duration = Duration::from_secs(1);

pub const DEFAULT_CONCURRENT_SLOTS: usize = 2;
pub const DEFAULT_REFRESH_INTERVAL_SECONDS: u64 = 45;

#[derive(Parser, Debug)]
#[command(name = "opsdeck-triage")]
pub struct Args {
    /// Listen port.
    #[arg(long, env = "API_PORT")]
    pub port: u16,
    /// Bind host.
    #[arg(long, env = "API_HOST", default_value = "0.0.0.0")]
    pub host: String,
    /// Scenario root; issue data, agent settings and run artifacts
    /// live underneath unless overridden.
    #[arg(long, env = "SCENARIO_ROOT", default_value = ".")]
    pub scenario_root: PathBuf,
    /// Issues directory; defaults to `<scenario_root>/issues`.
    #[arg(long, env = "ISSUES_DIR")]
    pub issues_dir: Option<PathBuf>,
    /// Agent settings document; defaults to `<scenario_root>/agents.yaml`.
    #[arg(long, env = "AGENT_SETTINGS_PATH")]
    pub agent_settings_path: Option<PathBuf>,
    /// Prompt template; defaults to `<issues_dir>/templates/investigation.md`.
    #[arg(long, env = "PROMPT_TEMPLATE_PATH")]
    pub prompt_template_path: Option<PathBuf>,
    /// Per-investigation timeout in seconds.
    #[arg(long, env = "AGENT_TIMEOUT_SECONDS", default_value_t = 1_800)]
    pub agent_timeout_seconds: u64,
    /// Optional directory for the service's own log file.
    #[arg(long, env = "TRIAGE_LOG_DIR", default_value = "")]
    pub log_dir: String,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: String,
    pub scenario_root: PathBuf,
    pub issues_dir: PathBuf,
    pub agent_settings_path: PathBuf,
    pub prompt_template_path: PathBuf,
    pub agent_timeout: Duration,
    pub log_dir: String,
}

impl Config {
    pub fn resolve(args: Args) -> Self {
        let issues_dir = args
            .issues_dir
            .unwrap_or_else(|| args.scenario_root.join("issues"));
        let agent_settings_path = args
            .agent_settings_path
            .unwrap_or_else(|| args.scenario_root.join("agents.yaml"));
        let prompt_template_path = args
            .prompt_template_path
            .unwrap_or_else(|| issues_dir.join("templates").join("investigation.md"));
        Self {
            bind_addr: format!("{}:{}", args.host, args.port),
            scenario_root: args.scenario_root,
            issues_dir,
            agent_settings_path,
            prompt_template_path,
            agent_timeout: Duration::from_secs(args.agent_timeout_seconds.max(1)),
            log_dir: args.log_dir,
        }
    }
}
