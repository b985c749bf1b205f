//! One JSON file per rule under the linkedge directory

use crate::error::LinkEdgeError;
use crate::model::LinkEdgeConfig;
use driverbox_core::persistence::{read_optional, remove_if_exists, write_json};
use std::path::{Path, PathBuf};
use tokio::fs;

/// Ids double as file names
pub fn validate_id(id: &str) -> Result<(), LinkEdgeError> {
    let valid = !id.is_empty()
        && id.len() <= 100
        && id != "."
        && id != ".."
        && !id.contains(['/', '\\'])
        && !id.chars().any(char::is_control);
    if valid {
        Ok(())
    } else {
        Err(LinkEdgeError::InvalidId(id.to_string()))
    }
}

#[must_use]
pub fn rule_path(dir: &Path, id: &str) -> PathBuf {
    dir.join(format!("{id}.json"))
}

/// Load every rule file; unreadable files are logged and skipped
pub async fn load_rules(dir: &Path) -> Result<Vec<LinkEdgeConfig>, LinkEdgeError> {
    fs::create_dir_all(dir).await?;
    let mut entries = fs::read_dir(dir).await?;
    let mut rules = Vec::new();

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let Some(stem) = path
            .extension()
            .filter(|ext| *ext == "json")
            .and(path.file_stem())
            .and_then(|s| s.to_str())
        else {
            continue;
        };
        let Some(contents) = read_optional(&path).await? else {
            continue;
        };
        match serde_json::from_str::<LinkEdgeConfig>(&contents) {
            Ok(mut rule) => {
                if rule.id.is_empty() {
                    rule.id = stem.to_string();
                }
                rules.push(rule);
            }
            Err(e) => tracing::warn!("Failed to parse linkEdge file {:?}: {}", path, e),
        }
    }

    rules.sort_by(|a, b| a.id.cmp(&b.id));
    tracing::info!("Loaded {} linkEdge rules from {:?}", rules.len(), dir);
    Ok(rules)
}

pub async fn save_rule(dir: &Path, rule: &LinkEdgeConfig) -> Result<(), LinkEdgeError> {
    validate_id(&rule.id)?;
    write_json(&rule_path(dir, &rule.id), rule).await?;
    Ok(())
}

pub async fn remove_rule(dir: &Path, id: &str) -> Result<(), LinkEdgeError> {
    validate_id(id)?;
    remove_if_exists(&rule_path(dir, id)).await?;
    Ok(())
}
