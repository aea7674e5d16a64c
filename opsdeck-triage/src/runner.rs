use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use serde_json::json;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{info, warn};

use opsdeck_core::ids::filename_safe;
use opsdeck_core::time::now_rfc3339_millis;

use crate::model::{AgentRunResult, RunOutcome};
use crate::registry::CancelHandle;

const RATE_LIMIT_SIGNALS: [&str; 7] = [
    "usage limit",
    "rate limit",
    "ai usage limit reached",
    "rate/usage limit reached",
    "429",
    "too many requests",
    "quota exceeded",
];

const REPORT_SECTIONS: [&str; 5] = [
    "investigation summary",
    "root cause",
    "remediation",
    "validation plan",
    "confidence assessment",
];

const DIRTY_SUCCESS_MIN_BYTES: usize = 500;

/// Everything needed to execute one agent CLI run.
pub struct RunSpec {
    pub issue_id: String,
    pub agent_id: String,
    pub command: String,
    pub args: Vec<String>,
    pub prompt: String,
    pub timeout: Duration,
    pub cancel: CancelHandle,
    pub transcript_path: PathBuf,
    pub last_message_path: PathBuf,
}

/// Deterministic artifact paths:
/// `<scenario_root>/tmp/codex/<tag>-<unix-nano>-{conversation.jsonl,last.txt}`.
pub fn artifact_paths(scenario_root: &Path, agent_id: &str) -> (PathBuf, PathBuf) {
    let tag = filename_safe(agent_id);
    let nanos = chrono::Utc::now()
        .timestamp_nanos_opt()
        .unwrap_or_default();
    let dir = scenario_root.join("tmp").join("codex");
    (
        dir.join(format!("{tag}-{nanos}-conversation.jsonl")),
        dir.join(format!("{tag}-{nanos}-last.txt")),
    )
}

/// Classify a finished run in the fixed priority order. Cancellation
/// is not decided here; the investigation service overrides the
/// outcome after consulting the cancellation registry.
pub fn classify(timed_out: bool, exit_code: i32, output: &str) -> RunOutcome {
    if timed_out {
        return RunOutcome::Timeout;
    }
    let lowered = output.to_lowercase();
    if lowered.contains("max turns") && lowered.contains("reached") {
        return RunOutcome::MaxTurnsExceeded;
    }
    if RATE_LIMIT_SIGNALS
        .iter()
        .any(|signal| lowered.contains(signal))
    {
        return RunOutcome::RateLimited;
    }
    if exit_code != 0 {
        if output.len() >= DIRTY_SUCCESS_MIN_BYTES
            && REPORT_SECTIONS
                .iter()
                .any(|section| lowered.contains(section))
        {
            return RunOutcome::SuccessWithDirtyExit;
        }
        return RunOutcome::Failure;
    }
    RunOutcome::Success
}

struct StreamState {
    combined: String,
    last_message: String,
    transcript: Vec<u8>,
}

/// Execute the agent CLI, streaming stdout and stderr into the
/// combined buffer and the transcript file, then classify the result.
pub async fn run(spec: RunSpec) -> AgentRunResult {
    let started = Instant::now();
    let state = Arc::new(StdMutex::new(StreamState {
        combined: String::new(),
        last_message: String::new(),
        transcript: Vec::new(),
    }));

    let mut command = Command::new(&spec.command);
    command
        .args(&spec.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(err) => {
            warn!(event = "agent_spawn_failed", command = %spec.command, error = %err);
            let spawn_error = Some(format!("failed to spawn {}: {err}", spec.command));
            return finish(
                spec,
                state,
                RunOutcome::Failure,
                -1,
                spawn_error,
                started.elapsed(),
            );
        }
    };

    let stdout_task = child.stdout.take().map(|stdout| {
        let state = state.clone();
        tokio::spawn(async move { consume_stream(stdout, "stdout", state).await })
    });
    let stderr_task = child.stderr.take().map(|stderr| {
        let state = state.clone();
        tokio::spawn(async move { consume_stream(stderr, "stderr", state).await })
    });

    let mut timed_out = false;
    let exit_code = tokio::select! {
        status = child.wait() => match status {
            Ok(status) => status.code().unwrap_or(-1),
            Err(_) => -1,
        },
        _ = tokio::time::sleep(spec.timeout) => {
            timed_out = true;
            let _ = child.kill().await;
            child.wait().await.ok().and_then(|s| s.code()).unwrap_or(-1)
        }
        _ = spec.cancel.cancelled() => {
            let _ = child.kill().await;
            child.wait().await.ok().and_then(|s| s.code()).unwrap_or(-1)
        }
    };

    if let Some(task) = stdout_task {
        let _ = task.await;
    }
    if let Some(task) = stderr_task {
        let _ = task.await;
    }

    let output_snapshot = state.lock().expect("stream state").combined.clone();
    let outcome = classify(timed_out, exit_code, &output_snapshot);
    let error = match outcome {
        RunOutcome::Timeout => Some(format!(
            "investigation timed out after {}s",
            spec.timeout.as_secs()
        )),
        RunOutcome::MaxTurnsExceeded => {
            Some("agent reached its maximum turn budget".to_string())
        }
        RunOutcome::RateLimited => Some("agent hit a rate or usage limit".to_string()),
        RunOutcome::Failure => Some(format!(
            "agent exited with code {exit_code}: {}",
            tail(&output_snapshot, 300)
        )),
        _ => None,
    };
    finish(spec, state, outcome, exit_code, error, started.elapsed())
}

async fn consume_stream(
    stream: impl tokio::io::AsyncRead + Unpin,
    label: &'static str,
    state: Arc<StdMutex<StreamState>>,
) {
    let mut lines = BufReader::new(stream).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let record = json!({
            "ts": now_rfc3339_millis(),
            "stream": label,
            "line": line,
        });
        let mut state = state.lock().expect("stream state");
        state.combined.push_str(&line);
        state.combined.push('\n');
        if !line.trim().is_empty() {
            state.last_message = line.clone();
        }
        if let Ok(mut encoded) = serde_json::to_vec(&record) {
            encoded.push(b'\n');
            state.transcript.extend_from_slice(&encoded);
        }
    }
}

fn finish(
    spec: RunSpec,
    state: Arc<StdMutex<StreamState>>,
    outcome: RunOutcome,
    exit_code: i32,
    error: Option<String>,
    duration: Duration,
) -> AgentRunResult {
    let (combined, last_message, transcript) = {
        let state = state.lock().expect("stream state");
        (
            state.combined.clone(),
            state.last_message.clone(),
            state.transcript.clone(),
        )
    };

    if let Some(parent) = spec.transcript_path.parent() {
        if let Err(err) = std::fs::create_dir_all(parent) {
            warn!(event = "transcript_dir_failed", error = %err);
        }
    }

    let transcript_bytes = if transcript.is_empty() {
        fallback_transcript(&spec, &last_message)
    } else {
        transcript
    };
    if let Err(err) = std::fs::write(&spec.transcript_path, &transcript_bytes) {
        warn!(event = "transcript_write_failed", path = %spec.transcript_path.display(), error = %err);
    }
    if let Err(err) = std::fs::write(&spec.last_message_path, last_message.as_bytes()) {
        warn!(event = "last_message_write_failed", path = %spec.last_message_path.display(), error = %err);
    }

    let digest = Sha256::digest(&transcript_bytes);
    let transcript_sha256 = Some(format!("{digest:x}"));

    info!(
        event = "agent_run_finished",
        issue_id = %spec.issue_id,
        agent_id = %spec.agent_id,
        outcome = ?outcome,
        exit_code = exit_code,
        duration_ms = duration.as_millis() as u64
    );

    AgentRunResult {
        outcome,
        output: combined,
        last_message,
        error,
        transcript_path: spec.transcript_path,
        last_message_path: spec.last_message_path,
        transcript_sha256,
        exit_code,
        duration,
    }
}

/// Minimal transcript written when the agent produced nothing: a
/// sandbox header, the prompt, and a final-response entry from the
/// captured last message.
fn fallback_transcript(spec: &RunSpec, last_message: &str) -> Vec<u8> {
    let records = [
        json!({
            "type": "sandbox",
            "ts": now_rfc3339_millis(),
            "content": format!(
                "sandbox run for issue {} by agent {}",
                spec.issue_id, spec.agent_id
            ),
        }),
        json!({
            "type": "prompt",
            "ts": now_rfc3339_millis(),
            "content": spec.prompt,
        }),
        json!({
            "type": "final_response",
            "ts": now_rfc3339_millis(),
            "content": last_message,
        }),
    ];
    let mut bytes = Vec::new();
    for record in records {
        if let Ok(mut encoded) = serde_json::to_vec(&record) {
            encoded.push(b'\n');
            bytes.extend_from_slice(&encoded);
        }
    }
    bytes
}

fn tail(text: &str, max_chars: usize) -> String {
    let trimmed = text.trim();
    let count = trimmed.chars().count();
    if count <= max_chars {
        trimmed.to_string()
    } else {
        trimmed
            .chars()
            .skip(count - max_chars)
            .collect::<String>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec_for(dir: &tempfile::TempDir, command: &str, args: &[&str]) -> RunSpec {
        let (transcript_path, last_message_path) = artifact_paths(dir.path(), "claude-code");
        RunSpec {
            issue_id: "iss-1".to_string(),
            agent_id: "claude-code".to_string(),
            command: command.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            prompt: "investigate the crash".to_string(),
            timeout: Duration::from_secs(10),
            cancel: CancelHandle::new(),
            transcript_path,
            last_message_path,
        }
    }

    #[test]
    fn classification_priority_is_fixed() {
        // Timeout beats every textual signal.
        assert_eq!(
            classify(true, 0, "rate limit reached and max turns reached"),
            RunOutcome::Timeout
        );
        // Max turns beats rate limit.
        assert_eq!(
            classify(false, 1, "Max turns (40) reached; also a rate limit note"),
            RunOutcome::MaxTurnsExceeded
        );
        // Rate limit beats dirty-success sniffing.
        let big_report = format!("{}\nRoot Cause: quota exceeded", "x".repeat(600));
        assert_eq!(classify(false, 1, &big_report), RunOutcome::RateLimited);
        // Dirty exit with a real report is a success.
        let clean_report = format!("{}\nInvestigation Summary: fine", "x".repeat(600));
        assert_eq!(
            classify(false, 2, &clean_report),
            RunOutcome::SuccessWithDirtyExit
        );
        // Small output with nonzero exit is a plain failure.
        assert_eq!(classify(false, 2, "Root Cause: nope"), RunOutcome::Failure);
        assert_eq!(classify(false, 0, "all done"), RunOutcome::Success);
    }

    #[test]
    fn dirty_success_requires_size_and_section() {
        let big_noise = "x".repeat(600);
        assert_eq!(classify(false, 1, &big_noise), RunOutcome::Failure);
        let small_report = "Investigation Summary: short";
        assert_eq!(classify(false, 1, small_report), RunOutcome::Failure);
    }

    #[test]
    fn rate_limit_signals_are_case_insensitive() {
        for signal in ["Usage Limit", "RATE LIMIT", "HTTP 429", "Too Many Requests"] {
            assert_eq!(
                classify(false, 1, &format!("error: {signal} hit")),
                RunOutcome::RateLimited,
                "signal {signal}"
            );
        }
    }

    #[test]
    fn artifact_paths_are_filename_safe() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (transcript, last) = artifact_paths(dir.path(), "Claude Code/v2");
        let name = transcript.file_name().expect("name").to_string_lossy();
        assert!(name.starts_with("claude-code-v2-"));
        assert!(name.ends_with("-conversation.jsonl"));
        assert!(last
            .file_name()
            .expect("name")
            .to_string_lossy()
            .ends_with("-last.txt"));
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn successful_run_captures_output_and_transcript() {
        let dir = tempfile::tempdir().expect("tempdir");
        let spec = spec_for(
            &dir,
            "/bin/sh",
            &["-c", "echo working; echo 'Investigation Summary: resolved'"],
        );
        let transcript_path = spec.transcript_path.clone();
        let result = run(spec).await;

        assert_eq!(result.outcome, RunOutcome::Success);
        assert_eq!(result.exit_code, 0);
        assert!(result.output.contains("working"));
        assert_eq!(result.last_message, "Investigation Summary: resolved");
        assert!(result.transcript_sha256.is_some());

        let transcript = std::fs::read_to_string(&transcript_path).expect("transcript");
        assert_eq!(transcript.lines().count(), 2);
        assert!(transcript.contains("\"stream\":\"stdout\""));
        let last = std::fs::read_to_string(&result.last_message_path).expect("last message");
        assert_eq!(last, "Investigation Summary: resolved");
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn silent_run_synthesizes_fallback_transcript() {
        let dir = tempfile::tempdir().expect("tempdir");
        let spec = spec_for(&dir, "/bin/true", &[]);
        let transcript_path = spec.transcript_path.clone();
        let result = run(spec).await;

        assert_eq!(result.outcome, RunOutcome::Success);
        let transcript = std::fs::read_to_string(&transcript_path).expect("transcript");
        let lines: Vec<_> = transcript.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].contains("\"type\":\"sandbox\""));
        assert!(lines[1].contains("investigate the crash"));
        assert!(lines[2].contains("\"type\":\"final_response\""));
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn deadline_kills_the_child_and_reports_timeout() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut spec = spec_for(&dir, "/bin/sh", &["-c", "sleep 30"]);
        spec.timeout = Duration::from_millis(200);
        let started = Instant::now();
        let result = run(spec).await;

        assert_eq!(result.outcome, RunOutcome::Timeout);
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(result
            .error
            .as_deref()
            .expect("timeout error")
            .contains("timed out"));
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn cancellation_stops_the_child() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut spec = spec_for(&dir, "/bin/sh", &["-c", "sleep 30"]);
        spec.cancel = CancelHandle::new();
        let cancel = spec.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(150)).await;
            cancel.cancel();
        });
        let started = Instant::now();
        let result = run(spec).await;
        // The classification is left to the service; the runner just
        // reports the kill.
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_ne!(result.outcome, RunOutcome::Timeout);
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn missing_binary_is_a_failure_with_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let spec = spec_for(&dir, "/nonexistent/agent-cli", &[]);
        let result = run(spec).await;
        assert_eq!(result.outcome, RunOutcome::Failure);
        assert_eq!(result.exit_code, -1);
        assert!(result
            .error
            .as_deref()
            .expect("spawn error")
            .contains("failed to spawn"));
    }
}
