//! Run orchestration: fetch → normalize → classify → enrich → render → persist.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use ctsync_core::{CanonicalRecord, CrawlStateEntry, Fingerprint, PhaseBucket, RunRequest, RunStatistics, TrialDocument};
use ctsync_registry::{enrich_batch, fetch_all, normalize, Enricher, RegistrySource, DEFAULT_STUDY_PAGE_BASE};
use ctsync_storage::{Collection, FetchError, Filter, StoreError};
use thiserror::Error;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::change::{fingerprint, ChangeDetector, ChangeKind};
use crate::normalize_condition;
use crate::render::render;

/// Run-fatal failures. Record-level problems never surface here; they land in
/// [`RunStatistics::errors`].
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("registry fetch failed: {0}")]
    Transport(#[from] FetchError),
    #[error("persistence failed: {0}")]
    Persistence(#[from] StoreError),
}

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub study_page_base: String,
    pub enrich_concurrency: usize,
    pub enrich_batch_delay: Duration,
    pub term_cooldown: Duration,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            study_page_base: DEFAULT_STUDY_PAGE_BASE.to_string(),
            enrich_concurrency: 2,
            enrich_batch_delay: Duration::from_secs(1),
            term_cooldown: Duration::from_secs(2),
        }
    }
}

/// One search term's result inside a multi-term run.
#[derive(Debug)]
pub struct TermRun {
    pub condition: String,
    pub result: Result<RunStatistics, SyncError>,
}

struct PendingRecord {
    record: CanonicalRecord,
    fingerprint: Fingerprint,
}

pub struct SyncPipeline {
    registry: Arc<dyn RegistrySource>,
    enricher: Option<Arc<dyn Enricher>>,
    trials: Arc<dyn Collection<TrialDocument>>,
    crawl_index: Arc<dyn Collection<CrawlStateEntry>>,
    options: PipelineOptions,
}

impl SyncPipeline {
    pub fn new(
        registry: Arc<dyn RegistrySource>,
        trials: Arc<dyn Collection<TrialDocument>>,
        crawl_index: Arc<dyn Collection<CrawlStateEntry>>,
    ) -> Self {
        Self {
            registry,
            enricher: None,
            trials,
            crawl_index,
            options: PipelineOptions::default(),
        }
    }

    pub fn with_enricher(mut self, enricher: Arc<dyn Enricher>) -> Self {
        self.enricher = Some(enricher);
        self
    }

    pub fn with_options(mut self, options: PipelineOptions) -> Self {
        self.options = options;
        self
    }

    pub fn trials(&self) -> &Arc<dyn Collection<TrialDocument>> {
        &self.trials
    }

    pub async fn run_once(&self, request: &RunRequest) -> Result<RunStatistics, SyncError> {
        let stats = RunStatistics::start(&request.condition);
        let span = info_span!("sync_run", run_id = %stats.run_id, condition = %request.condition);
        self.run_stages(request, stats).instrument(span).await
    }

    /// Run each term in order with the configured cooldown in between. A failed
    /// term is reported and does not stop the remaining terms.
    pub async fn run_many(&self, conditions: &[String], template: &RunRequest) -> Vec<TermRun> {
        let mut runs = Vec::with_capacity(conditions.len());
        for (index, condition) in conditions.iter().enumerate() {
            if index > 0 && !self.options.term_cooldown.is_zero() {
                tokio::time::sleep(self.options.term_cooldown).await;
            }
            let result = self.run_once(&template.for_condition(condition)).await;
            if let Err(err) = &result {
                error!(condition = %condition, error = %err, "crawl run failed");
            }
            runs.push(TermRun {
                condition: condition.clone(),
                result,
            });
        }
        runs
    }

    async fn run_stages(
        &self,
        request: &RunRequest,
        mut stats: RunStatistics,
    ) -> Result<RunStatistics, SyncError> {
        // FETCHING
        let raw_records = fetch_all(
            self.registry.as_ref(),
            &request.condition,
            &request.status,
            request.max_records,
        )
        .await?;
        stats.total_fetched = raw_records.len();
        if raw_records.is_empty() {
            info!("no trials found for this condition");
            return Ok(finish(stats));
        }

        // PROCESSING
        let state = self.crawl_index.get_all(&Filter::all()).await?;
        let mut detector = ChangeDetector::from_entries(
            state.into_values().map(|stored| stored.doc),
            request.force_refresh,
        );
        info!(known = detector.known_count(), "loaded crawl index");

        let mut pending = Vec::new();
        for (index, raw) in raw_records.iter().enumerate() {
            let record = match normalize(raw, &self.options.study_page_base) {
                Ok(record) => record,
                Err(err) => {
                    warn!(index, error = %err, "skipping unprocessable record");
                    stats.record_error(format!("record #{index}: {err}"));
                    continue;
                }
            };

            let current = fingerprint(&record);
            let kind = detector.classify(&record.nct_id, &current);
            match kind {
                ChangeKind::Unchanged => {
                    debug!(nct_id = %record.nct_id, "unchanged, skipping");
                    stats.skipped_trials += 1;
                    continue;
                }
                ChangeKind::New => stats.new_trials += 1,
                ChangeKind::Changed => stats.updated_trials += 1,
            }
            info!(nct_id = %record.nct_id, ?kind, title = %title_preview(&record), "processing trial");

            detector.observe(&record.nct_id, current.clone());
            pending.push(PendingRecord {
                record,
                fingerprint: current,
            });
        }

        let enrichments = if request.enrich {
            self.enrich_pending(&pending).await
        } else {
            HashMap::new()
        };

        let condition_key = normalize_condition(&request.condition);
        let seen_at = Utc::now();
        let mut documents = Vec::with_capacity(pending.len());
        let mut entries = Vec::with_capacity(pending.len());
        for PendingRecord { record, fingerprint } in pending {
            entries.push(CrawlStateEntry {
                nct_id: record.nct_id.clone(),
                source_hash: fingerprint.clone(),
                last_seen_at: seen_at,
            });
            documents.push(TrialDocument {
                condition: condition_key.clone(),
                normalized_phase: PhaseBucket::from_phase(record.phase.as_deref()),
                markdown_content: render(&record),
                enriched_content: enrichments.get(&record.nct_id).cloned(),
                source_hash: fingerprint,
                record,
            });
        }

        // PERSISTING
        if documents.is_empty() {
            info!("no new or changed trials to save");
        } else {
            let written = self.trials.upsert_many(&documents).await?;
            self.crawl_index.upsert_many(&entries).await?;
            info!(inserted = written.inserted, updated = written.updated, "saved trials");
        }

        // DONE
        Ok(finish(stats))
    }

    async fn enrich_pending(&self, pending: &[PendingRecord]) -> HashMap<String, String> {
        let Some(enricher) = &self.enricher else {
            warn!("enrichment requested but no enricher is configured");
            return HashMap::new();
        };
        if pending.is_empty() {
            return HashMap::new();
        }

        let ids: Vec<String> = pending.iter().map(|p| p.record.nct_id.clone()).collect();
        let outcomes = enrich_batch(
            enricher.as_ref(),
            &ids,
            self.options.enrich_concurrency,
            self.options.enrich_batch_delay,
        )
        .await;

        let total = outcomes.len();
        let enriched: HashMap<String, String> = outcomes
            .into_iter()
            .filter_map(|outcome| outcome.text.map(|text| (outcome.nct_id, text)))
            .collect();
        info!(enriched = enriched.len(), attempted = total, "enrichment finished");
        enriched
    }
}

fn title_preview(record: &CanonicalRecord) -> String {
    record
        .title
        .as_deref()
        .map(|t| t.chars().take(50).collect())
        .unwrap_or_else(|| "Unknown".to_string())
}

fn finish(stats: RunStatistics) -> RunStatistics {
    let stats = stats.finish();
    info!(
        fetched = stats.total_fetched,
        new = stats.new_trials,
        updated = stats.updated_trials,
        skipped = stats.skipped_trials,
        errors = stats.error_count,
        duration_secs = stats.duration_secs().unwrap_or_default(),
        "crawl summary"
    );
    stats
}
