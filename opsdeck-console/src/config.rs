use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConsoleError;

const MIN_PANIC_GRACE_MS: u64 = 500;
const MIN_READ_BUFFER_BYTES: usize = 512;

#[derive(Parser, Debug)]
#[command(name = "opsdeck-console")]
pub struct Args {
    /// Listen port.
    #[arg(long, env = "API_PORT")]
    pub port: u16,
    /// Bind host.
    #[arg(long, env = "API_HOST", default_value = "0.0.0.0")]
    pub host: String,
    /// Command spawned when a create request names none.
    #[arg(long, env = "WEB_CONSOLE_DEFAULT_COMMAND", default_value = "/bin/bash")]
    pub default_command: String,
    /// Whitespace-separated arguments for the fallback command.
    #[arg(long, env = "WEB_CONSOLE_DEFAULT_ARGS", default_value = "")]
    pub default_args: String,
    /// Session time-to-live in seconds.
    #[arg(long, env = "WEB_CONSOLE_SESSION_TTL", default_value_t = 14_400)]
    pub session_ttl_seconds: u64,
    /// Idle timeout in seconds; runtime-mutable through the workspace.
    #[arg(long, env = "WEB_CONSOLE_IDLE_TIMEOUT", default_value_t = 1_800)]
    pub idle_timeout_seconds: u64,
    /// Maximum concurrently live sessions.
    #[arg(long, env = "WEB_CONSOLE_MAX_CONCURRENT", default_value_t = 8)]
    pub max_concurrent: usize,
    /// Reject requests that did not come through the fronting proxy.
    #[arg(long, env = "WEB_CONSOLE_EXPECT_PROXY", default_value_t = false)]
    pub expect_proxy: bool,
    /// Grace between SIGINT and SIGKILL on close, in milliseconds.
    #[arg(long, env = "WEB_CONSOLE_PANIC_GRACE", default_value_t = 3_000)]
    pub panic_grace_ms: u64,
    /// PTY read buffer size in bytes.
    #[arg(long, env = "WEB_CONSOLE_READ_BUFFER", default_value_t = 4_096)]
    pub read_buffer_bytes: usize,
    /// Initial terminal rows.
    #[arg(long, env = "WEB_CONSOLE_TTY_ROWS", default_value_t = 24)]
    pub tty_rows: u16,
    /// Initial terminal columns.
    #[arg(long, env = "WEB_CONSOLE_TTY_COLS", default_value_t = 80)]
    pub tty_cols: u16,
    /// Directory holding transcripts and the workspace document.
    #[arg(long, env = "WEB_CONSOLE_STORAGE_PATH", default_value = "./console-data")]
    pub storage_path: PathBuf,
    /// Working directory injected into spawned sessions.
    #[arg(long, env = "WEB_CONSOLE_WORKING_DIR", default_value = "")]
    pub working_dir: String,
    /// Optional directory for the service's own log file.
    #[arg(long, env = "WEB_CONSOLE_LOG_DIR", default_value = "")]
    pub log_dir: String,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: String,
    pub default_command: String,
    pub default_args: Vec<String>,
    pub session_ttl: Duration,
    pub idle_timeout: Duration,
    pub max_concurrent: usize,
    pub expect_proxy: bool,
    pub panic_grace: Duration,
    pub read_buffer_bytes: usize,
    pub tty_rows: u16,
    pub tty_cols: u16,
    pub storage_path: PathBuf,
    pub working_dir: Option<PathBuf>,
    pub log_dir: String,
}

impl Config {
    /// Validate parsed arguments into a runnable configuration.
    /// Violations are fatal at startup.
    pub fn resolve(args: Args) -> Result<Self, ConsoleError> {
        if args.panic_grace_ms < MIN_PANIC_GRACE_MS {
            return Err(ConsoleError::validation(format!(
                "panic grace must be at least {MIN_PANIC_GRACE_MS} ms"
            )));
        }
        if args.read_buffer_bytes < MIN_READ_BUFFER_BYTES {
            return Err(ConsoleError::validation(format!(
                "read buffer must be at least {MIN_READ_BUFFER_BYTES} bytes"
            )));
        }
        if args.max_concurrent == 0 {
            return Err(ConsoleError::validation("max concurrent must be positive"));
        }
        if args.tty_rows == 0 || args.tty_cols == 0 {
            return Err(ConsoleError::validation("terminal size must be positive"));
        }
        let working_dir = if args.working_dir.trim().is_empty() {
            None
        } else {
            Some(PathBuf::from(args.working_dir.trim()))
        };
        Ok(Self {
            bind_addr: format!("{}:{}", args.host, args.port),
            default_command: args.default_command,
            default_args: args
                .default_args
                .split_whitespace()
                .map(str::to_string)
                .collect(),
            session_ttl: Duration::from_secs(args.session_ttl_seconds.max(1)),
            idle_timeout: Duration::from_secs(args.idle_timeout_seconds.max(1)),
            max_concurrent: args.max_concurrent,
            expect_proxy: args.expect_proxy,
            panic_grace: Duration::from_millis(args.panic_grace_ms),
            read_buffer_bytes: args.read_buffer_bytes,
            tty_rows: args.tty_rows,
            tty_cols: args.tty_cols,
            storage_path: args.storage_path,
            working_dir,
            log_dir: args.log_dir,
        })
    }
}
