use std::fs;
use std::path::{Component, Path, PathBuf};

use tracing::{info, warn};

use opsdeck_core::fsatomic::write_atomic;
use opsdeck_core::ids::new_id;
use opsdeck_core::time::now_rfc3339;

use crate::error::TriageError;
use crate::model::{Issue, IssuePriority, IssueStatus};

const METADATA_FILE: &str = "metadata.yaml";
pub const ARTIFACTS_DIR: &str = "artifacts";

/// Filters for issue listing.
#[derive(Debug, Clone, Default)]
pub struct IssueFilter {
    pub status: Option<IssueStatus>,
    pub priority: Option<IssuePriority>,
    pub issue_type: Option<String>,
    pub app_id: Option<String>,
    pub limit: Option<usize>,
}

/// Fields accepted when creating an issue.
#[derive(Debug, Clone, Default)]
pub struct NewIssue {
    pub title: String,
    pub description: String,
    pub issue_type: String,
    pub priority: IssuePriority,
    pub app_id: String,
    pub reporter_name: String,
    pub reporter_contact: Option<String>,
    pub tags: Vec<String>,
}

/// Directory-per-issue store. The containing status folder is the
/// source of truth for an issue's status; everything else lives in
/// `metadata.yaml` plus the `artifacts/` folder next to it.
pub struct IssueStore {
    root: PathBuf,
}

impl IssueStore {
    pub fn open(root: PathBuf) -> Result<Self, TriageError> {
        let store = Self { root };
        store.ensure_layout()?;
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn ensure_layout(&self) -> Result<(), TriageError> {
        for status in IssueStatus::ALL {
            fs::create_dir_all(self.root.join(status.as_str()))?;
        }
        fs::create_dir_all(self.root.join("templates"))?;
        Ok(())
    }

    pub fn issue_dir(&self, status: IssueStatus, issue_id: &str) -> PathBuf {
        self.root.join(status.as_str()).join(issue_id)
    }

    /// Locate an issue by scanning the status folders.
    pub fn find(&self, issue_id: &str) -> Option<(IssueStatus, PathBuf)> {
        for status in IssueStatus::ALL {
            let dir = self.issue_dir(status, issue_id);
            if dir.join(METADATA_FILE).is_file() {
                return Some((status, dir));
            }
        }
        None
    }

    pub fn create(&self, new: NewIssue) -> Result<Issue, TriageError> {
        if new.title.trim().is_empty() {
            return Err(TriageError::validation("title must not be empty"));
        }
        let now = now_rfc3339();
        let issue = Issue {
            id: new_id(),
            title: new.title,
            description: new.description,
            issue_type: new.issue_type,
            priority: new.priority,
            app_id: new.app_id,
            status: IssueStatus::Open,
            reporter: crate::model::Reporter {
                name: new.reporter_name,
                contact: new.reporter_contact,
            },
            attachments: Vec::new(),
            investigation: Default::default(),
            metadata: crate::model::IssueMetadata {
                created_at: now.clone(),
                updated_at: now,
                resolved_at: None,
                tags: new.tags,
                extra: Default::default(),
            },
        };
        let dir = self.issue_dir(IssueStatus::Open, &issue.id);
        fs::create_dir_all(dir.join(ARTIFACTS_DIR))?;
        self.write_metadata(&dir, &issue)?;
        info!(event = "issue_created", issue_id = %issue.id);
        Ok(issue)
    }

    pub fn load(&self, issue_id: &str) -> Result<Issue, TriageError> {
        let (status, dir) = self
            .find(issue_id)
            .ok_or_else(|| TriageError::not_found(format!("issue {issue_id} not found")))?;
        let bytes = fs::read(dir.join(METADATA_FILE))?;
        let mut issue: Issue = serde_yaml::from_slice(&bytes)?;
        // The folder wins over whatever the document claims.
        issue.status = status;
        if issue.id != issue_id {
            warn!(event = "issue_id_mismatch", folder = issue_id, document = %issue.id);
            issue.id = issue_id.to_string();
        }
        Ok(issue)
    }

    /// Persist the document into the issue's current folder, bumping
    /// `updated_at` and keeping `created_at <= updated_at`.
    pub fn save(&self, issue: &mut Issue) -> Result<(), TriageError> {
        let (status, dir) = self
            .find(&issue.id)
            .ok_or_else(|| TriageError::not_found(format!("issue {} not found", issue.id)))?;
        issue.status = status;
        issue.metadata.updated_at = now_rfc3339();
        if issue.metadata.created_at.is_empty()
            || issue.metadata.created_at > issue.metadata.updated_at
        {
            issue.metadata.created_at = issue.metadata.updated_at.clone();
        }
        self.write_metadata(&dir, issue)
    }

    fn write_metadata(&self, dir: &Path, issue: &Issue) -> Result<(), TriageError> {
        let yaml = serde_yaml::to_string(issue)?;
        write_atomic(&dir.join(METADATA_FILE), yaml.as_bytes())?;
        Ok(())
    }

    /// Move the issue directory across status folders. A move to the
    /// current status is a no-op.
    pub fn move_status(&self, issue_id: &str, to: IssueStatus) -> Result<Issue, TriageError> {
        let (from, dir) = self
            .find(issue_id)
            .ok_or_else(|| TriageError::not_found(format!("issue {issue_id} not found")))?;
        if from != to {
            let target = self.issue_dir(to, issue_id);
            fs::rename(&dir, &target)?;
            info!(event = "issue_moved", issue_id = issue_id, from = %from, to = %to);
        }
        let mut issue = self.load(issue_id)?;
        self.save(&mut issue)?;
        Ok(issue)
    }

    pub fn delete(&self, issue_id: &str) -> Result<(), TriageError> {
        let (_, dir) = self
            .find(issue_id)
            .ok_or_else(|| TriageError::not_found(format!("issue {issue_id} not found")))?;
        fs::remove_dir_all(dir)?;
        info!(event = "issue_deleted", issue_id = issue_id);
        Ok(())
    }

    pub fn list(&self, filter: &IssueFilter) -> Result<Vec<Issue>, TriageError> {
        let statuses: Vec<IssueStatus> = match filter.status {
            Some(status) => vec![status],
            None => IssueStatus::ALL.to_vec(),
        };
        let mut issues = Vec::new();
        for status in statuses {
            for issue_id in self.issue_ids_in(status)? {
                let issue = match self.load(&issue_id) {
                    Ok(issue) => issue,
                    Err(err) => {
                        warn!(event = "issue_load_failed", issue_id = %issue_id, error = %err);
                        continue;
                    }
                };
                if let Some(priority) = filter.priority {
                    if issue.priority != priority {
                        continue;
                    }
                }
                if let Some(issue_type) = filter.issue_type.as_deref() {
                    if issue.issue_type != issue_type {
                        continue;
                    }
                }
                if let Some(app_id) = filter.app_id.as_deref() {
                    if issue.app_id != app_id {
                        continue;
                    }
                }
                issues.push(issue);
            }
        }
        issues.sort_by(|a, b| a.metadata.created_at.cmp(&b.metadata.created_at));
        if let Some(limit) = filter.limit {
            issues.truncate(limit);
        }
        Ok(issues)
    }

    pub fn issue_ids_in(&self, status: IssueStatus) -> Result<Vec<String>, TriageError> {
        let dir = self.root.join(status.as_str());
        let mut ids = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    ids.push(name.to_string());
                }
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Case-insensitive text match over title, description, type,
    /// app id and tags.
    pub fn search(&self, query: &str, limit: usize) -> Result<Vec<Issue>, TriageError> {
        let needle = query.trim().to_lowercase();
        if needle.is_empty() {
            return Ok(Vec::new());
        }
        let mut matches = Vec::new();
        for issue in self.list(&IssueFilter::default())? {
            let haystack = format!(
                "{} {} {} {} {}",
                issue.title.to_lowercase(),
                issue.description.to_lowercase(),
                issue.issue_type.to_lowercase(),
                issue.app_id.to_lowercase(),
                issue.metadata.tags.join(" ").to_lowercase(),
            );
            if haystack.contains(&needle) {
                matches.push(issue);
                if matches.len() >= limit {
                    break;
                }
            }
        }
        Ok(matches)
    }

    /// Resolve a path under the issue's `artifacts/` folder, rejecting
    /// anything that would escape it.
    pub fn attachment_path(&self, issue_id: &str, relative: &str) -> Result<PathBuf, TriageError> {
        let (_, dir) = self
            .find(issue_id)
            .ok_or_else(|| TriageError::not_found(format!("issue {issue_id} not found")))?;
        let relative_path = Path::new(relative);
        if relative_path.is_absolute() {
            return Err(TriageError::validation("attachment path must be relative"));
        }
        for component in relative_path.components() {
            match component {
                Component::Normal(_) => {}
                _ => {
                    return Err(TriageError::validation(
                        "attachment path escapes the artifacts folder",
                    ))
                }
            }
        }
        let path = dir.join(ARTIFACTS_DIR).join(relative_path);
        if !path.is_file() {
            return Err(TriageError::not_found(format!(
                "attachment {relative} not found"
            )));
        }
        Ok(path)
    }

    pub fn count_by_status(&self) -> Result<Vec<(IssueStatus, usize)>, TriageError> {
        let mut counts = Vec::new();
        for status in IssueStatus::ALL {
            counts.push((status, self.issue_ids_in(status)?.len()));
        }
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::extras;

    fn store_in(dir: &tempfile::TempDir) -> IssueStore {
        IssueStore::open(dir.path().join("issues")).expect("open store")
    }

    fn seed(store: &IssueStore, title: &str) -> Issue {
        store
            .create(NewIssue {
                title: title.to_string(),
                description: "something broke".to_string(),
                issue_type: "bug".to_string(),
                priority: IssuePriority::High,
                app_id: "app-1".to_string(),
                reporter_name: "ops".to_string(),
                ..Default::default()
            })
            .expect("create issue")
    }

    #[test]
    fn status_always_equals_containing_folder() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store_in(&dir);
        let issue = seed(&store, "folder truth");

        assert_eq!(store.load(&issue.id).expect("load").status, IssueStatus::Open);
        assert!(dir
            .path()
            .join("issues/open")
            .join(&issue.id)
            .join("metadata.yaml")
            .is_file());

        let moved = store
            .move_status(&issue.id, IssueStatus::Active)
            .expect("move");
        assert_eq!(moved.status, IssueStatus::Active);
        assert!(!dir.path().join("issues/open").join(&issue.id).exists());
        assert!(dir.path().join("issues/active").join(&issue.id).exists());
        assert_eq!(
            store.load(&issue.id).expect("reload").status,
            IssueStatus::Active
        );
    }

    #[test]
    fn move_to_current_status_is_a_noop() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store_in(&dir);
        let issue = seed(&store, "noop move");
        let moved = store.move_status(&issue.id, IssueStatus::Open).expect("move");
        assert_eq!(moved.status, IssueStatus::Open);
    }

    #[test]
    fn save_keeps_created_before_updated() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store_in(&dir);
        let mut issue = seed(&store, "timestamps");
        issue.set_extra(extras::AGENT_STATUS, "running");
        store.save(&mut issue).expect("save");
        assert!(issue.metadata.created_at <= issue.metadata.updated_at);

        let loaded = store.load(&issue.id).expect("load");
        assert_eq!(loaded.extra(extras::AGENT_STATUS), Some("running"));
    }

    #[test]
    fn list_filters_compose() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store_in(&dir);
        seed(&store, "first");
        let second = seed(&store, "second");
        store
            .move_status(&second.id, IssueStatus::Failed)
            .expect("move");

        let open_only = store
            .list(&IssueFilter {
                status: Some(IssueStatus::Open),
                ..Default::default()
            })
            .expect("list open");
        assert_eq!(open_only.len(), 1);
        assert_eq!(open_only[0].title, "first");

        let high = store
            .list(&IssueFilter {
                priority: Some(IssuePriority::High),
                ..Default::default()
            })
            .expect("list high");
        assert_eq!(high.len(), 2);

        let none = store
            .list(&IssueFilter {
                app_id: Some("other-app".to_string()),
                ..Default::default()
            })
            .expect("list app");
        assert!(none.is_empty());

        let limited = store
            .list(&IssueFilter {
                limit: Some(1),
                ..Default::default()
            })
            .expect("list limited");
        assert_eq!(limited.len(), 1);
    }

    #[test]
    fn search_matches_title_and_tags() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store_in(&dir);
        seed(&store, "Payment gateway 500");
        let mut tagged = seed(&store, "Slow dashboard");
        tagged.metadata.tags.push("performance".to_string());
        store.save(&mut tagged).expect("save tags");

        let hits = store.search("payment", 10).expect("search");
        assert_eq!(hits.len(), 1);
        let hits = store.search("PERFORMANCE", 10).expect("search tags");
        assert_eq!(hits.len(), 1);
        assert!(store.search("   ", 10).expect("blank").is_empty());
    }

    #[test]
    fn attachment_paths_cannot_escape_artifacts() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store_in(&dir);
        let issue = seed(&store, "attachments");
        let artifacts = dir
            .path()
            .join("issues/open")
            .join(&issue.id)
            .join(ARTIFACTS_DIR);
        std::fs::write(artifacts.join("crash.log"), "boom").expect("write artifact");

        let ok = store
            .attachment_path(&issue.id, "crash.log")
            .expect("resolve");
        assert!(ok.ends_with("crash.log"));

        assert!(matches!(
            store.attachment_path(&issue.id, "../metadata.yaml"),
            Err(TriageError::Validation(_))
        ));
        assert!(matches!(
            store.attachment_path(&issue.id, "/etc/passwd"),
            Err(TriageError::Validation(_))
        ));
        assert!(matches!(
            store.attachment_path(&issue.id, "missing.log"),
            Err(TriageError::NotFound(_))
        ));
    }

    #[test]
    fn delete_removes_the_directory() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store_in(&dir);
        let issue = seed(&store, "delete me");
        store.delete(&issue.id).expect("delete");
        assert!(store.find(&issue.id).is_none());
        assert!(matches!(
            store.load(&issue.id),
            Err(TriageError::NotFound(_))
        ));
    }
}
