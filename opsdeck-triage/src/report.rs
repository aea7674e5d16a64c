use std::collections::BTreeMap;

use serde::Serialize;

use crate::error::TriageError;
use crate::model::{Issue, IssueStatus};
use crate::store::{IssueFilter, IssueStore};

#[derive(Debug, Clone, Serialize)]
pub struct Stats {
    pub total: usize,
    pub by_status: BTreeMap<String, usize>,
    pub by_priority: BTreeMap<String, usize>,
    pub by_type: BTreeMap<String, usize>,
    pub investigated: usize,
    pub resolved: usize,
}

pub fn stats(store: &IssueStore) -> Result<Stats, TriageError> {
    let issues = store.list(&IssueFilter::default())?;
    let mut by_status = BTreeMap::new();
    for status in IssueStatus::ALL {
        by_status.insert(status.as_str().to_string(), 0);
    }
    let mut by_priority = BTreeMap::new();
    let mut by_type = BTreeMap::new();
    let mut investigated = 0;
    let mut resolved = 0;
    for issue in &issues {
        *by_status.entry(issue.status.to_string()).or_insert(0) += 1;
        *by_priority.entry(issue.priority.to_string()).or_insert(0) += 1;
        let issue_type = if issue.issue_type.is_empty() {
            "unspecified".to_string()
        } else {
            issue.issue_type.clone()
        };
        *by_type.entry(issue_type).or_insert(0) += 1;
        if issue.investigation.started_at.is_some() {
            investigated += 1;
        }
        if issue.metadata.resolved_at.is_some() {
            resolved += 1;
        }
    }
    Ok(Stats {
        total: issues.len(),
        by_status,
        by_priority,
        by_type,
        investigated,
        resolved,
    })
}

/// Full dump in the requested format. JSON carries everything; CSV
/// and markdown cover the flat columns.
pub fn export(store: &IssueStore, format: &str) -> Result<(String, String), TriageError> {
    let issues = store.list(&IssueFilter::default())?;
    match format {
        "json" => {
            let body = serde_json::to_string_pretty(&issues)
                .map_err(|err| TriageError::internal(format!("encode export: {err}")))?;
            Ok(("application/json".to_string(), body))
        }
        "csv" => Ok(("text/csv".to_string(), to_csv(&issues))),
        "markdown" => Ok(("text/markdown".to_string(), to_markdown(&issues))),
        other => Err(TriageError::validation(format!(
            "unknown export format {other}"
        ))),
    }
}

fn to_csv(issues: &[Issue]) -> String {
    let mut out =
        String::from("id,title,status,priority,type,app_id,created_at,updated_at,resolved_at\n");
    for issue in issues {
        let row = [
            issue.id.as_str(),
            issue.title.as_str(),
            issue.status.as_str(),
            issue.priority.as_str(),
            issue.issue_type.as_str(),
            issue.app_id.as_str(),
            issue.metadata.created_at.as_str(),
            issue.metadata.updated_at.as_str(),
            issue.metadata.resolved_at.as_deref().unwrap_or(""),
        ];
        let encoded: Vec<String> = row.iter().map(|field| csv_field(field)).collect();
        out.push_str(&encoded.join(","));
        out.push('\n');
    }
    out
}

fn csv_field(field: &str) -> String {
    if field.contains(',') || field.contains('"') || field.contains('\n') {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

fn to_markdown(issues: &[Issue]) -> String {
    let mut out = String::from("| id | title | status | priority | type | app |\n");
    out.push_str("|---|---|---|---|---|---|\n");
    for issue in issues {
        out.push_str(&format!(
            "| {} | {} | {} | {} | {} | {} |\n",
            issue.id,
            issue.title.replace('|', "\\|"),
            issue.status,
            issue.priority,
            issue.issue_type,
            issue.app_id,
        ));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::IssuePriority;
    use crate::store::NewIssue;

    fn seeded_store(dir: &tempfile::TempDir) -> IssueStore {
        let store = IssueStore::open(dir.path().join("issues")).expect("store");
        for (title, priority) in [
            ("first, with comma", IssuePriority::High),
            ("second", IssuePriority::Low),
        ] {
            store
                .create(NewIssue {
                    title: title.to_string(),
                    issue_type: "bug".to_string(),
                    priority,
                    app_id: "app-1".to_string(),
                    ..Default::default()
                })
                .expect("create");
        }
        store
    }

    #[test]
    fn stats_count_by_dimension() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = seeded_store(&dir);
        let stats = stats(&store).expect("stats");
        assert_eq!(stats.total, 2);
        assert_eq!(stats.by_status["open"], 2);
        assert_eq!(stats.by_status["completed"], 0);
        assert_eq!(stats.by_priority["high"], 1);
        assert_eq!(stats.by_type["bug"], 2);
        assert_eq!(stats.investigated, 0);
        assert_eq!(stats.resolved, 0);
    }

    #[test]
    fn export_formats() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = seeded_store(&dir);

        let (mime, body) = export(&store, "json").expect("json");
        assert_eq!(mime, "application/json");
        assert!(body.contains("\"second\""));

        let (mime, body) = export(&store, "csv").expect("csv");
        assert_eq!(mime, "text/csv");
        assert!(body.starts_with("id,title,status"));
        assert!(body.contains("\"first, with comma\""));

        let (mime, body) = export(&store, "markdown").expect("markdown");
        assert_eq!(mime, "text/markdown");
        assert!(body.contains("| open |"));

        assert!(matches!(
            export(&store, "xml"),
            Err(TriageError::Validation(_))
        ));
    }
}
