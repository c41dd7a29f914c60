//! Detection ledger – species recognised this session that are not yet in
//! the user's durable collection.
//!
//! Keyed by species code; the first entry for a code wins.  Whenever the
//! collection changes, [`DetectionLedger::reconcile`] drops every entry the
//! collection now covers.

use chrono::{DateTime, Utc};
use tracing::debug;

use birdlens_common::detection::{Detection, IdentifiedBird};
use birdlens_common::protocol::CollectedBird;

#[derive(Debug, Default, Clone)]
pub struct DetectionLedger {
    entries: Vec<IdentifiedBird>,
}

impl DetectionLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> &[IdentifiedBird] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, species_code: &str) -> bool {
        self.entries.iter().any(|b| b.species_code == species_code)
    }

    /// Merge detections; codes already present are skipped.  Returns how
    /// many entries were added.
    pub fn add_detections(&mut self, detections: &[Detection], at: DateTime<Utc>) -> usize {
        let mut added = 0;
        for detection in detections {
            if self.contains(&detection.species_code) {
                continue;
            }
            self.entries
                .push(IdentifiedBird::from_detection(detection, at));
            added += 1;
        }
        if added > 0 {
            debug!("Ledger: {added} new species ({} total)", self.entries.len());
        }
        added
    }

    /// Remove one entry.  Returns whether it was present.
    pub fn remove_bird(&mut self, species_code: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|b| b.species_code != species_code);
        before != self.entries.len()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Drop entries the collection now covers, matched by species code or
    /// by scientific name (case-insensitive).  Returns how many were dropped.
    pub fn reconcile(&mut self, collection: &[CollectedBird]) -> usize {
        let before = self.entries.len();
        self.entries.retain(|entry| {
            !collection.iter().any(|bird| {
                let collected = bird.species_name.trim();
                collected.eq_ignore_ascii_case(&entry.species_code)
                    || entry
                        .scientific_name
                        .as_deref()
                        .is_some_and(|sci| collected.eq_ignore_ascii_case(sci.trim()))
            })
        });
        let removed = before - self.entries.len();
        if removed > 0 {
            debug!("Ledger: {removed} species now collected");
        }
        removed
    }
}
