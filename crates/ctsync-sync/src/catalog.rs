//! Read-side queries over the record store.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use ctsync_core::{TrialDocument, DEFAULT_STATUS_FILTER};
use ctsync_storage::{Collection, Filter, SortSpec, StoreError, Stored};
use tokio::fs;
use tracing::info;

use crate::normalize_condition;

pub const DEFAULT_LIST_LIMIT: usize = 100;

/// Documents whose condition key contains `condition` (case-insensitive),
/// optionally restricted to one status, newest `last_updated` first.
pub async fn find_trials(
    trials: &dyn Collection<TrialDocument>,
    condition: Option<&str>,
    status: Option<&str>,
    limit: usize,
) -> Result<Vec<Stored<TrialDocument>>, StoreError> {
    let mut filter = Filter::all();
    if let Some(condition) = condition.map(normalize_condition).filter(|c| !c.is_empty()) {
        filter = filter.contains_ignore_case("condition", condition);
    }
    if let Some(status) = status.filter(|s| !s.is_empty()) {
        filter = filter.eq("status", status.to_ascii_uppercase());
    }
    trials
        .find_by_filter(&filter, Some(&SortSpec::descending("last_updated")), limit)
        .await
}

pub async fn trial_markdown(
    trials: &dyn Collection<TrialDocument>,
    nct_id: &str,
) -> Result<Option<String>, StoreError> {
    Ok(trials
        .find_by_key(nct_id)
        .await?
        .map(|stored| stored.doc.markdown_content))
}

/// `trials/{condition}/{phase}/{nct_id}.md` → rendered text, over recruiting
/// documents for `condition`.
pub async fn filesystem_view(
    trials: &dyn Collection<TrialDocument>,
    condition: &str,
) -> Result<BTreeMap<String, String>, StoreError> {
    let key = normalize_condition(condition);
    let filter = Filter::all()
        .contains_ignore_case("condition", key.clone())
        .eq("status", DEFAULT_STATUS_FILTER);
    let docs = trials.get_all(&filter).await?;

    Ok(docs
        .into_values()
        .map(|stored| {
            let path = format!(
                "trials/{}/{}/{}.md",
                key, stored.doc.normalized_phase, stored.doc.record.nct_id
            );
            (path, stored.doc.markdown_content)
        })
        .collect())
}

/// Write the filesystem view under `out_dir`; returns the number of files.
pub async fn export_filesystem(
    trials: &dyn Collection<TrialDocument>,
    condition: &str,
    out_dir: &Path,
) -> Result<usize> {
    let view = filesystem_view(trials, condition)
        .await
        .context("loading filesystem view")?;
    for (relative, content) in &view {
        let path = out_dir.join(relative);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        fs::write(&path, content)
            .await
            .with_context(|| format!("writing {}", path.display()))?;
    }
    info!(condition, files = view.len(), out = %out_dir.display(), "exported trial documents");
    Ok(view.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ctsync_core::{CanonicalRecord, Fingerprint, PhaseBucket};
    use ctsync_storage::MemoryCollection;

    fn doc(id: &str, condition: &str, status: &str, phase: &str, updated: &str) -> TrialDocument {
        TrialDocument {
            record: CanonicalRecord {
                nct_id: id.into(),
                status: Some(status.into()),
                phase: Some(phase.into()),
                last_updated: Some(updated.into()),
                source_url: format!("https://clinicaltrials.gov/study/{id}"),
                ..Default::default()
            },
            condition: condition.into(),
            normalized_phase: PhaseBucket::from_phase(Some(phase)),
            markdown_content: format!("# Trial: {id}\n"),
            enriched_content: None,
            source_hash: Fingerprint::new("00"),
        }
    }

    async fn seeded() -> MemoryCollection<TrialDocument> {
        let store = MemoryCollection::new();
        store
            .upsert_many(&[
                doc("NCT1", "breast_cancer", "RECRUITING", "PHASE2", "2024-03-01"),
                doc("NCT2", "breast_cancer", "COMPLETED", "PHASE3", "2024-05-01"),
                doc("NCT3", "breast_cancer", "RECRUITING", "PHASE1, PHASE2", "2024-07-01"),
                doc("NCT4", "lung_cancer", "RECRUITING", "PHASE2", "2024-09-01"),
            ])
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn find_trials_filters_and_orders_newest_first() {
        let store = seeded().await;
        let found = find_trials(&store, Some("Breast Cancer"), None, 10).await.unwrap();
        let ids: Vec<_> = found.iter().map(|s| s.doc.record.nct_id.as_str()).collect();
        assert_eq!(ids, vec!["NCT3", "NCT2", "NCT1"]);

        let recruiting = find_trials(&store, Some("breast"), Some("recruiting"), 10).await.unwrap();
        assert_eq!(recruiting.len(), 2);

        let limited = find_trials(&store, None, None, 2).await.unwrap();
        let ids: Vec<_> = limited.iter().map(|s| s.doc.record.nct_id.as_str()).collect();
        assert_eq!(ids, vec!["NCT4", "NCT3"]);
    }

    #[tokio::test]
    async fn markdown_lookup() {
        let store = seeded().await;
        assert_eq!(
            trial_markdown(&store, "NCT1").await.unwrap().as_deref(),
            Some("# Trial: NCT1\n")
        );
        assert_eq!(trial_markdown(&store, "NCT404").await.unwrap(), None);
    }

    #[tokio::test]
    async fn filesystem_view_groups_recruiting_by_phase() {
        let store = seeded().await;
        let view = filesystem_view(&store, "Breast Cancer").await.unwrap();
        let paths: Vec<_> = view.keys().map(String::as_str).collect();
        assert_eq!(
            paths,
            vec![
                "trials/breast_cancer/phase1_2/NCT3.md",
                "trials/breast_cancer/phase2/NCT1.md",
            ]
        );
    }

    #[tokio::test]
    async fn export_writes_the_view_to_disk() {
        let store = seeded().await;
        let dir = tempfile::tempdir().unwrap();
        let written = export_filesystem(&store, "breast cancer", dir.path()).await.unwrap();
        assert_eq!(written, 2);
        let text = std::fs::read_to_string(dir.path().join("trials/breast_cancer/phase2/NCT1.md")).unwrap();
        assert_eq!(text, "# Trial: NCT1\n");
    }
}
