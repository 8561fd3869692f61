use serde::{Deserialize, Serialize};

/// Axis-aligned box in pixel units of the captured frame.
///
/// `x`/`y` are the top-left corner. Serialized as `[x, y, w, h]`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(from = "[f32; 4]", into = "[f32; 4]")]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl BoundingBox {
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// `[x, y, w, h]` as used on the wire.
    pub fn to_array(self) -> [f32; 4] {
        [self.x, self.y, self.width, self.height]
    }
}

impl From<[f32; 4]> for BoundingBox {
    fn from(v: [f32; 4]) -> Self {
        Self::new(v[0], v[1], v[2], v[3])
    }
}

impl From<BoundingBox> for [f32; 4] {
    fn from(b: BoundingBox) -> Self {
        b.to_array()
    }
}

/// One detection as returned by the inference endpoint, before deduplication.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RawDetection {
    pub class_id: u32,
    /// Detector confidence in [0, 1].
    pub confidence: f32,
    #[serde(rename = "box")]
    pub bbox: BoundingBox,
}

impl RawDetection {
    pub fn new(class_id: u32, confidence: f32, bbox: impl Into<BoundingBox>) -> Self {
        Self {
            class_id,
            confidence,
            bbox: bbox.into(),
        }
    }
}
