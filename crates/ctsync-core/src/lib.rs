//! Core domain model for ctsync: canonical trial records, crawl state and run statistics.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "ctsync-core";

/// Registry status filter applied when the caller does not pick one.
pub const DEFAULT_STATUS_FILTER: &str = "RECRUITING";

/// Upper bound on records a single run may request.
pub const MAX_RECORDS_PER_RUN: usize = 1000;

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Location {
    pub facility: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub country: Option<String>,
    pub postal_code: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Contact {
    pub name: Option<String>,
    pub role: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Intervention {
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub name: Option<String>,
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PrimaryOutcome {
    pub measure: Option<String>,
    pub time_frame: Option<String>,
}

/// Normalized shape of one registry study.
///
/// Only `nct_id` and `source_url` are guaranteed; every other scalar is `None`
/// when the registry omitted it and every list is empty. Placeholder text such
/// as "N/A" never appears here, it is added by the renderer.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CanonicalRecord {
    pub nct_id: String,
    pub title: Option<String>,
    pub official_title: Option<String>,

    pub status: Option<String>,
    pub start_date: Option<String>,
    pub completion_date: Option<String>,
    pub last_updated: Option<String>,

    pub phase: Option<String>,
    pub study_type: Option<String>,
    pub enrollment: Option<u64>,

    pub eligibility_criteria: Option<String>,
    pub minimum_age: Option<String>,
    pub maximum_age: Option<String>,
    pub sex: Option<String>,
    pub healthy_volunteers: Option<bool>,

    pub brief_summary: Option<String>,
    pub detailed_description: Option<String>,

    pub sponsor: Option<String>,
    #[serde(default)]
    pub collaborators: Vec<String>,

    #[serde(default)]
    pub locations: Vec<Location>,
    #[serde(default)]
    pub central_contacts: Vec<Contact>,
    #[serde(default)]
    pub interventions: Vec<Intervention>,
    #[serde(default)]
    pub primary_outcomes: Vec<PrimaryOutcome>,

    pub source_url: String,
}

/// Hex digest of the change-relevant fields of a [`CanonicalRecord`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn new(hex_digest: impl Into<String>) -> Self {
        Self(hex_digest.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Last fingerprint seen for an identifier, persisted in the crawl index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrawlStateEntry {
    pub nct_id: String,
    pub source_hash: Fingerprint,
    pub last_seen_at: DateTime<Utc>,
}

/// Coarse phase grouping used to lay out documents by phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseBucket {
    #[serde(rename = "phase1_2")]
    Phase1To2,
    #[serde(rename = "phase2_3")]
    Phase2To3,
    Phase1,
    Phase2,
    Phase3,
    Phase4,
    EarlyPhase1,
    Other,
}

impl PhaseBucket {
    /// Bucket a joined phase summary such as `"PHASE1, PHASE2"`.
    pub fn from_phase(phase: Option<&str>) -> Self {
        let Some(phase) = phase.map(str::trim).filter(|p| !p.is_empty()) else {
            return Self::Other;
        };
        if phase.eq_ignore_ascii_case("na") || phase.eq_ignore_ascii_case("n/a") {
            return Self::Other;
        }

        let lower = phase.to_ascii_lowercase();
        // Before the digit rules: EARLY_PHASE1 gets its own bucket, not phase1.
        if lower.contains("early") {
            return Self::EarlyPhase1;
        }
        let has = |digit: char| lower.contains(digit);
        match (has('1'), has('2'), has('3'), has('4')) {
            (true, true, _, _) => Self::Phase1To2,
            (_, true, true, _) => Self::Phase2To3,
            (true, _, _, _) => Self::Phase1,
            (_, true, _, _) => Self::Phase2,
            (_, _, true, _) => Self::Phase3,
            (_, _, _, true) => Self::Phase4,
            _ => Self::Other,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Phase1To2 => "phase1_2",
            Self::Phase2To3 => "phase2_3",
            Self::Phase1 => "phase1",
            Self::Phase2 => "phase2",
            Self::Phase3 => "phase3",
            Self::Phase4 => "phase4",
            Self::EarlyPhase1 => "early_phase1",
            Self::Other => "other",
        }
    }
}

impl fmt::Display for PhaseBucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rendered, persistable form of a trial, keyed by `record.nct_id`.
///
/// Store-managed `created_at` / `updated_at` stamps are attached by the
/// persistence layer, not carried here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialDocument {
    #[serde(flatten)]
    pub record: CanonicalRecord,
    pub condition: String,
    pub normalized_phase: PhaseBucket,
    pub markdown_content: String,
    pub enriched_content: Option<String>,
    pub source_hash: Fingerprint,
}

/// Caller-supplied parameters of one pipeline run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRequest {
    pub condition: String,
    pub status: String,
    pub max_records: usize,
    pub enrich: bool,
    pub force_refresh: bool,
}

impl RunRequest {
    pub fn new(condition: impl Into<String>) -> Self {
        Self {
            condition: condition.into(),
            status: DEFAULT_STATUS_FILTER.to_string(),
            max_records: 50,
            enrich: false,
            force_refresh: false,
        }
    }

    pub fn with_max_records(mut self, max_records: usize) -> Self {
        self.max_records = max_records.clamp(1, MAX_RECORDS_PER_RUN);
        self
    }

    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = status.into();
        self
    }

    pub fn with_enrichment(mut self, enrich: bool) -> Self {
        self.enrich = enrich;
        self
    }

    pub fn with_force_refresh(mut self, force_refresh: bool) -> Self {
        self.force_refresh = force_refresh;
        self
    }

    /// Same options, different search term.
    pub fn for_condition(&self, condition: impl Into<String>) -> Self {
        Self {
            condition: condition.into(),
            ..self.clone()
        }
    }
}

/// Per-run counters returned to the caller. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunStatistics {
    pub run_id: Uuid,
    pub condition: String,
    pub total_fetched: usize,
    pub new_trials: usize,
    pub updated_trials: usize,
    pub skipped_trials: usize,
    pub error_count: usize,
    pub errors: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl RunStatistics {
    pub fn start(condition: impl Into<String>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            condition: condition.into(),
            total_fetched: 0,
            new_trials: 0,
            updated_trials: 0,
            skipped_trials: 0,
            error_count: 0,
            errors: Vec::new(),
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn record_error(&mut self, message: impl Into<String>) {
        self.errors.push(message.into());
        self.error_count = self.errors.len();
    }

    pub fn finish(mut self) -> Self {
        self.finished_at = Some(Utc::now());
        self
    }

    pub fn duration_secs(&self) -> Option<f64> {
        self.finished_at
            .map(|end| (end - self.started_at).num_milliseconds() as f64 / 1000.0)
    }
}
