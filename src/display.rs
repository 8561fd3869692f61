//! Presentation helpers.
//!
//! Display filtering is a second, independent confidence gate over records the
//! store already accepted. Raising the threshold hides records; it never
//! removes them from the store.

use crate::filter::{passes, Confidence};
use crate::store::{DetectionRecord, DetectionSnapshot};

/// COCO class names, indexed by class id.
pub const COCO_CLASSES: [&str; 80] = [
    "person",
    "bicycle",
    "car",
    "motorcycle",
    "airplane",
    "bus",
    "train",
    "truck",
    "boat",
    "traffic light",
    "fire hydrant",
    "stop sign",
    "parking meter",
    "bench",
    "bird",
    "cat",
    "dog",
    "horse",
    "sheep",
    "cow",
    "elephant",
    "bear",
    "zebra",
    "giraffe",
    "backpack",
    "umbrella",
    "handbag",
    "tie",
    "suitcase",
    "frisbee",
    "skis",
    "snowboard",
    "sports ball",
    "kite",
    "baseball bat",
    "baseball glove",
    "skateboard",
    "surfboard",
    "tennis racket",
    "bottle",
    "wine glass",
    "cup",
    "fork",
    "knife",
    "spoon",
    "bowl",
    "banana",
    "apple",
    "sandwich",
    "orange",
    "broccoli",
    "carrot",
    "hot dog",
    "pizza",
    "donut",
    "cake",
    "chair",
    "couch",
    "potted plant",
    "bed",
    "dining table",
    "toilet",
    "tv",
    "laptop",
    "mouse",
    "remote",
    "keyboard",
    "cell phone",
    "microwave",
    "oven",
    "toaster",
    "sink",
    "refrigerator",
    "book",
    "clock",
    "vase",
    "scissors",
    "teddy bear",
    "hair drier",
    "toothbrush",
];

pub fn class_name(class_id: u32) -> &'static str {
    COCO_CLASSES
        .get(class_id as usize)
        .copied()
        .unwrap_or("unknown")
}

/// Records passing `threshold`, newest first.
pub fn visible_records(snapshot: &DetectionSnapshot, threshold: Confidence) -> Vec<DetectionRecord> {
    let mut visible: Vec<DetectionRecord> = snapshot
        .iter()
        .filter(|record| passes(&record.detection, threshold))
        .cloned()
        .collect();
    visible.sort_by(|a, b| {
        b.first_seen_at
            .cmp(&a.first_seen_at)
            .then(b.sequence.cmp(&a.sequence))
    });
    visible
}

/// One display line, e.g. `person 91%`.
pub fn format_record(record: &DetectionRecord) -> String {
    format!(
        "{} {:.0}%",
        class_name(record.detection.class_id),
        record.detection.confidence * 100.0
    )
}
