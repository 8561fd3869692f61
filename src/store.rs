//! Unique detection store.
//!
//! Detections are keyed by class plus the top-left corner snapped to a 50 px
//! grid. This is an approximate identity, not object tracking: two nearby
//! objects of the same class merge, and one object drifting across a grid line
//! splits. Both are accepted behaviour.
//!
//! Rules:
//! - A known key rejects every later offer, whatever its confidence. Stored
//!   records are never upgraded or mutated.
//! - An unknown key is accepted only when the offer meets the threshold. A
//!   below-threshold offer leaves no trace.
//! - Accepted offers since the last `clear()` equal the number of records.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::SystemTime;

use serde::Serialize;

use crate::detect::RawDetection;
use crate::filter::{passes, Confidence};

/// Spatial grid size for key bucketing, in pixels.
pub const BUCKET_SIZE_PX: f32 = 50.0;

/// Approximate detection identity: `(class_id, round(x / 50), round(y / 50))`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct DetectionKey {
    pub class_id: u32,
    pub bucket_x: i64,
    pub bucket_y: i64,
}

impl DetectionKey {
    pub fn new(class_id: u32, bucket_x: i64, bucket_y: i64) -> Self {
        Self {
            class_id,
            bucket_x,
            bucket_y,
        }
    }

    pub fn for_detection(detection: &RawDetection) -> Self {
        Self {
            class_id: detection.class_id,
            bucket_x: bucket(detection.bbox.x),
            bucket_y: bucket(detection.bbox.y),
        }
    }
}

impl std::fmt::Display for DetectionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.class_id, self.bucket_x, self.bucket_y)
    }
}

/// Round half up, so -25 px and 25 px land on adjacent cells consistently.
fn bucket(coordinate: f32) -> i64 {
    (coordinate / BUCKET_SIZE_PX + 0.5).floor() as i64
}

/// A deduplicated detection, frozen at first sighting.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DetectionRecord {
    /// Record identity. Equal to the key it was stored under.
    pub id: DetectionKey,
    pub detection: RawDetection,
    pub first_seen_at: SystemTime,
    /// Insertion order, used to break `first_seen_at` ties.
    pub sequence: u64,
}

impl DetectionRecord {
    pub fn key(&self) -> DetectionKey {
        self.id
    }
}

/// Result of offering one detection to the store.
#[derive(Clone, Debug, PartialEq)]
pub enum OfferOutcome {
    Accepted(DetectionRecord),
    /// Key already stored.
    Duplicate(DetectionKey),
    /// Key unknown and confidence under the threshold. Nothing was stored.
    BelowThreshold(DetectionKey),
}

impl OfferOutcome {
    pub fn accepted(&self) -> bool {
        matches!(self, OfferOutcome::Accepted(_))
    }

    pub fn record(&self) -> Option<&DetectionRecord> {
        match self {
            OfferOutcome::Accepted(record) => Some(record),
            _ => None,
        }
    }
}

/// Immutable view of the store handed to consumers.
#[derive(Clone, Debug, Default)]
pub struct DetectionSnapshot {
    records: Arc<Vec<DetectionRecord>>,
}

impl DetectionSnapshot {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, DetectionRecord> {
        self.records.iter()
    }

    pub fn records(&self) -> &[DetectionRecord] {
        &self.records
    }

    pub fn get(&self, key: &DetectionKey) -> Option<&DetectionRecord> {
        self.records.iter().find(|record| record.id == *key)
    }
}

impl<'a> IntoIterator for &'a DetectionSnapshot {
    type Item = &'a DetectionRecord;
    type IntoIter = std::slice::Iter<'a, DetectionRecord>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.iter()
    }
}

#[derive(Debug, Default)]
pub struct DetectionStore {
    records: HashMap<DetectionKey, DetectionRecord>,
    next_sequence: u64,
}

impl DetectionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Offer one detection under `threshold`.
    pub fn offer(&mut self, detection: &RawDetection, threshold: Confidence) -> OfferOutcome {
        let key = DetectionKey::for_detection(detection);
        if self.records.contains_key(&key) {
            return OfferOutcome::Duplicate(key);
        }
        if !passes(detection, threshold) {
            return OfferOutcome::BelowThreshold(key);
        }

        self.next_sequence += 1;
        let record = DetectionRecord {
            id: key,
            detection: detection.clone(),
            first_seen_at: SystemTime::now(),
            sequence: self.next_sequence,
        };
        self.records.insert(key, record.clone());
        OfferOutcome::Accepted(record)
    }

    /// Drop every record.
    pub fn clear(&mut self) {
        self.records.clear();
    }

    pub fn snapshot(&self) -> DetectionSnapshot {
        let mut records: Vec<DetectionRecord> = self.records.values().cloned().collect();
        records.sort_by_key(|record| record.sequence);
        DetectionSnapshot {
            records: Arc::new(records),
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn contains(&self, key: &DetectionKey) -> bool {
        self.records.contains_key(key)
    }

    pub fn get(&self, key: &DetectionKey) -> Option<&DetectionRecord> {
        self.records.get(key)
    }
}
