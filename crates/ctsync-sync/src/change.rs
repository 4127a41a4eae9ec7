//! Fingerprint-based change detection against the crawl index.

use std::collections::{HashMap, HashSet};

use ctsync_core::{CanonicalRecord, CrawlStateEntry, Fingerprint};
use serde::Serialize;
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    New,
    Changed,
    Unchanged,
}

/// Digest of title, status and eligibility criteria. Absent fields hash as the
/// empty string; each field is length-prefixed so values cannot bleed into
/// their neighbours.
pub fn fingerprint(record: &CanonicalRecord) -> Fingerprint {
    let mut hasher = Sha256::new();
    for field in [&record.title, &record.status, &record.eligibility_criteria] {
        let value = field.as_deref().unwrap_or_default();
        hasher.update((value.len() as u64).to_be_bytes());
        hasher.update(value.as_bytes());
    }
    Fingerprint::new(hex::encode(hasher.finalize()))
}

/// In-memory view of the crawl index for one run, loaded once up front.
#[derive(Debug, Clone, Default)]
pub struct ChangeDetector {
    known: HashMap<String, Fingerprint>,
    processed: HashSet<String>,
    force_refresh: bool,
}

impl ChangeDetector {
    pub fn new(known: HashMap<String, Fingerprint>, force_refresh: bool) -> Self {
        Self {
            known,
            processed: HashSet::new(),
            force_refresh,
        }
    }

    pub fn from_entries(entries: impl IntoIterator<Item = CrawlStateEntry>, force_refresh: bool) -> Self {
        let known = entries
            .into_iter()
            .map(|entry| (entry.nct_id, entry.source_hash))
            .collect();
        Self::new(known, force_refresh)
    }

    pub fn known_count(&self) -> usize {
        self.known.len()
    }

    /// An id already observed in this run is always `Unchanged`, even under
    /// force refresh.
    pub fn classify(&self, nct_id: &str, current: &Fingerprint) -> ChangeKind {
        if self.processed.contains(nct_id) {
            return ChangeKind::Unchanged;
        }
        match self.known.get(nct_id) {
            None => ChangeKind::New,
            Some(previous) if previous == current && !self.force_refresh => ChangeKind::Unchanged,
            Some(_) => ChangeKind::Changed,
        }
    }

    /// Remember `fingerprint` so later occurrences in the same run compare against it.
    pub fn observe(&mut self, nct_id: &str, fingerprint: Fingerprint) {
        self.processed.insert(nct_id.to_string());
        self.known.insert(nct_id.to_string(), fingerprint);
    }
}
