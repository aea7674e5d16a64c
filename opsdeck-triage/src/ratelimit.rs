use std::sync::{Arc, Mutex as StdMutex};
use std::time::Instant;

use chrono::{Duration as ChronoDuration, Utc};
use regex::Regex;
use serde::Serialize;
use tracing::{info, warn};

use opsdeck_core::time::parse_rfc3339_lenient;

use crate::config::RATE_LIMIT_SNAPSHOT_TTL;
use crate::error::TriageError;
use crate::model::{extras, Issue, IssueStatus};
use crate::store::{IssueFilter, IssueStore};

const FALLBACK_BACKOFF_MINUTES: i64 = 5;

#[derive(Debug, Clone, Serialize)]
pub struct RateLimitStatus {
    pub rate_limited: bool,
    pub count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reset_time: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seconds_until_reset: Option<i64>,
}

struct OpenSnapshot {
    taken_at: Instant,
    issues: Vec<Issue>,
}

/// Tracks which issues are parked behind an upstream rate limit and
/// keeps a short-lived snapshot of `open/` for the processor loop.
pub struct RateLimitManager {
    store: Arc<IssueStore>,
    snapshot: StdMutex<Option<OpenSnapshot>>,
}

impl RateLimitManager {
    pub fn new(store: Arc<IssueStore>) -> Self {
        Self {
            store,
            snapshot: StdMutex::new(None),
        }
    }

    /// Extract the announced reset instant from run output; RFC 3339
    /// with or without a zone. Falls back to now + 5 minutes.
    pub fn parse_reset_timestamp(output: &str) -> Option<String> {
        let pattern = Regex::new(
            r"\d{4}-\d{2}-\d{2}[T ]\d{2}:\d{2}:\d{2}(?:\.\d+)?(?:Z|[+-]\d{2}:?\d{2})?",
        )
        .expect("static regex");
        for candidate in pattern.find_iter(output) {
            if parse_rfc3339_lenient(candidate.as_str()).is_some() {
                return Some(candidate.as_str().to_string());
            }
        }
        None
    }

    /// Tag the issue's extras with the parsed (or fallback) reset
    /// instant and invalidate the open-folder snapshot. The caller
    /// persists the issue.
    pub fn note_rate_limit(&self, issue: &mut Issue, agent_id: &str, output: &str) -> String {
        let until = Self::parse_reset_timestamp(output).unwrap_or_else(|| {
            (Utc::now() + ChronoDuration::minutes(FALLBACK_BACKOFF_MINUTES)).to_rfc3339()
        });
        issue.set_extra(extras::RATE_LIMIT_UNTIL, until.clone());
        issue.set_extra(extras::RATE_LIMIT_AGENT, agent_id);
        self.invalidate();
        info!(event = "rate_limit_recorded", issue_id = %issue.id, until = %until);
        until
    }

    pub fn invalidate(&self) {
        *self.snapshot.lock().expect("snapshot lock") = None;
    }

    /// Current standing: live entries, earliest reset, seconds until.
    /// Stale and unparseable entries are cleared as a side effect.
    pub fn status(&self) -> Result<RateLimitStatus, TriageError> {
        let entries = self.sweep()?;
        let now = Utc::now();
        let mut resets: Vec<_> = entries
            .iter()
            .filter_map(|(_, until)| parse_rfc3339_lenient(until).map(|at| (at, until.clone())))
            .collect();
        resets.sort_by_key(|(at, _)| *at);

        let (reset_time, seconds_until_reset) = match resets.first() {
            Some((at, text)) => (
                Some(text.clone()),
                Some((*at - now).num_seconds().max(0)),
            ),
            None => (None, None),
        };
        Ok(RateLimitStatus {
            rate_limited: !entries.is_empty(),
            count: entries.len(),
            reset_time,
            seconds_until_reset,
        })
    }

    /// Drop expired or unparseable entries from every status folder;
    /// returns the live `(issue_id, rate_limit_until)` pairs.
    pub fn sweep(&self) -> Result<Vec<(String, String)>, TriageError> {
        let now = Utc::now();
        let mut live = Vec::new();
        let mut cleared = 0usize;
        for status in IssueStatus::ALL {
            for issue_id in self.store.issue_ids_in(status)? {
                let mut issue = match self.store.load(&issue_id) {
                    Ok(issue) => issue,
                    Err(_) => continue,
                };
                let Some(until) = issue.extra(extras::RATE_LIMIT_UNTIL).map(str::to_string)
                else {
                    continue;
                };
                match parse_rfc3339_lenient(&until) {
                    Some(at) if at > now => live.push((issue_id, until)),
                    _ => {
                        issue.clear_extra(extras::RATE_LIMIT_UNTIL);
                        issue.clear_extra(extras::RATE_LIMIT_AGENT);
                        if let Err(err) = self.store.save(&mut issue) {
                            warn!(event = "rate_limit_clear_failed", issue_id = %issue_id, error = %err);
                        } else {
                            cleared += 1;
                        }
                    }
                }
            }
        }
        if cleared > 0 {
            self.invalidate();
            info!(event = "rate_limit_swept", cleared = cleared);
        }
        Ok(live)
    }

    /// Open issues eligible for automation: snapshot of `open/` at
    /// most one second old, minus anything still parked behind a rate
    /// limit.
    pub fn eligible_open_issues(&self) -> Result<Vec<Issue>, TriageError> {
        let now = Utc::now();
        let mut snapshot = self.snapshot.lock().expect("snapshot lock");
        let fresh = match snapshot.as_ref() {
            Some(entry) if entry.taken_at.elapsed() < RATE_LIMIT_SNAPSHOT_TTL => None,
            _ => Some(self.store.list(&IssueFilter {
                status: Some(IssueStatus::Open),
                ..Default::default()
            })?),
        };
        if let Some(issues) = fresh {
            *snapshot = Some(OpenSnapshot {
                taken_at: Instant::now(),
                issues,
            });
        }
        let issues = snapshot
            .as_ref()
            .map(|entry| entry.issues.clone())
            .unwrap_or_default();
        Ok(issues
            .into_iter()
            .filter(|issue| {
                match issue
                    .extra(extras::RATE_LIMIT_UNTIL)
                    .and_then(parse_rfc3339_lenient)
                {
                    Some(until) => until <= now,
                    None => true,
                }
            })
            .collect())
    }
}
