use std::collections::BTreeMap;
use std::path::Path;

use tracing::warn;

use opsdeck_core::time::now_rfc3339;

use crate::model::{extras, Issue};

const NOT_PROVIDED: &str = "(not provided)";

const DEFAULT_TEMPLATE: &str = "\
# Investigation Request

Issue {{issue_id}}: {{issue_title}} ({{issue_type}}, priority {{issue_priority}})
Application: {{app_name}}

## Description
{{issue_description}}

## Error
{{error_message}}

## Stack trace
{{stack_trace}}

## Affected files
{{affected_files}}

## Metadata
{{issue_metadata}}

## Artifacts
{{issue_artifacts}}

Investigate the issue above. Work from {{project_path}}. You are agent
{{agent_id}}; it is {{timestamp}}. Produce an Investigation Summary
with Root Cause, Remediation, Validation Plan and Confidence
Assessment sections.
";

/// Build the substitution map for one issue/agent pair.
pub fn variables(issue: &Issue, agent_id: &str, project_path: &Path) -> BTreeMap<String, String> {
    let mut vars = BTreeMap::new();
    vars.insert("issue_id".to_string(), issue.id.clone());
    vars.insert("issue_title".to_string(), issue.title.clone());
    vars.insert("issue_description".to_string(), issue.description.clone());
    vars.insert("issue_type".to_string(), issue.issue_type.clone());
    vars.insert("issue_priority".to_string(), issue.priority.to_string());
    vars.insert("app_name".to_string(), issue.app_id.clone());
    vars.insert(
        "error_message".to_string(),
        issue.extra(extras::ERROR_MESSAGE).unwrap_or("").to_string(),
    );
    vars.insert(
        "stack_trace".to_string(),
        issue.extra(extras::STACK_TRACE).unwrap_or("").to_string(),
    );
    vars.insert(
        "affected_files".to_string(),
        issue.extra(extras::AFFECTED_FILES).unwrap_or("").to_string(),
    );
    vars.insert(
        "issue_metadata".to_string(),
        serde_yaml::to_string(&issue.metadata).unwrap_or_default(),
    );
    vars.insert(
        "issue_artifacts".to_string(),
        issue
            .attachments
            .iter()
            .map(|attachment| format!("- {} ({})", attachment.name, attachment.path))
            .collect::<Vec<_>>()
            .join("\n"),
    );
    vars.insert("agent_id".to_string(), agent_id.to_string());
    vars.insert(
        "project_path".to_string(),
        project_path.display().to_string(),
    );
    vars.insert("timestamp".to_string(), now_rfc3339());
    vars
}

/// Substitute `{{name}}` placeholders; blank values become the
/// literal `(not provided)`. Unknown placeholders are left alone.
pub fn render(template: &str, vars: &BTreeMap<String, String>) -> String {
    let mut output = template.to_string();
    for (name, value) in vars {
        let placeholder = format!("{{{{{name}}}}}");
        let replacement = if value.trim().is_empty() {
            NOT_PROVIDED
        } else {
            value.as_str()
        };
        output = output.replace(&placeholder, replacement);
    }
    output
}

/// Load the template file, falling back to the built-in template when
/// the file is absent or unreadable.
pub fn load_template(path: &Path) -> String {
    match std::fs::read_to_string(path) {
        Ok(text) if !text.trim().is_empty() => text,
        Ok(_) => DEFAULT_TEMPLATE.to_string(),
        Err(err) => {
            if path.exists() {
                warn!(event = "prompt_template_unreadable", path = %path.display(), error = %err);
            }
            DEFAULT_TEMPLATE.to_string()
        }
    }
}

pub fn compose(template_path: &Path, issue: &Issue, agent_id: &str, project_path: &Path) -> String {
    let template = load_template(template_path);
    let vars = variables(issue, agent_id, project_path);
    render(&template, &vars)
}
