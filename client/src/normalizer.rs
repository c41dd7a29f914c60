//! Result normalizer – deduplicates raw detections by species and puts
//! canonical taxonomy names on the survivors.
//!
//! Lookups for one batch run concurrently and are all awaited before the
//! batch is returned.  A failed lookup keeps the detection as it was.

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::future::join_all;
use tracing::{debug, warn};

use birdlens_common::detection::{Detection, RawDetection};

use crate::taxonomy::TaxonomyLookup;

pub struct Normalizer {
    taxonomy: Arc<dyn TaxonomyLookup>,
}

impl Normalizer {
    pub fn new(taxonomy: Arc<dyn TaxonomyLookup>) -> Self {
        Normalizer { taxonomy }
    }

    /// Deduplicate, then enrich every survivor.  Never fails; an empty input
    /// makes no lookups.
    pub async fn normalize(&self, raw: Vec<RawDetection>) -> Vec<Detection> {
        if raw.is_empty() {
            return Vec::new();
        }
        let unique = dedup(raw);
        debug!("Enriching {} unique detection(s)", unique.len());
        join_all(unique.into_iter().map(|d| self.enrich(d))).await
    }

    async fn enrich(&self, mut detection: Detection) -> Detection {
        match self.taxonomy.lookup(&detection.species_code).await {
            Ok(name) => {
                if let Some(sci) = name.scientific_name {
                    detection.scientific_name = Some(sci);
                }
                if let Some(com) = name.common_name {
                    detection.common_name = Some(com);
                }
            }
            Err(e) => warn!(
                "Taxonomy lookup for {} failed, keeping reported names: {e}",
                detection.species_code
            ),
        }
        detection
    }
}

/// One detection per species code, the most confident one.  Ties keep the
/// first seen.  Output follows the first appearance of each code.
/// Detections with neither a code nor a label are dropped.
pub fn dedup(raw: Vec<RawDetection>) -> Vec<Detection> {
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut unique: Vec<Detection> = Vec::new();

    for detection in raw.into_iter().map(Detection::from_raw) {
        if detection.species_code.is_empty() {
            warn!(
                "Dropping detection without species code or label (confidence {:.4})",
                detection.confidence
            );
            continue;
        }
        match index.get(&detection.species_code) {
            Some(&i) => {
                if detection.confidence > unique[i].confidence {
                    unique[i] = detection;
                }
            }
            None => {
                index.insert(detection.species_code.clone(), unique.len());
                unique.push(detection);
            }
        }
    }
    unique
}
