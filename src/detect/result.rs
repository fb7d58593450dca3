/// Class vocabulary of the PPE model, as trained.
pub const PPE_CLASSES: [&str; 10] = [
    "Hardhat",
    "Mask",
    "NO-Hardhat",
    "NO-Mask",
    "NO-Safety Vest",
    "Person",
    "Safety Cone",
    "Safety Vest",
    "machinery",
    "vehicle",
];

/// Classes reported as compliance violations.
pub const VIOLATION_CLASSES: [&str; 3] = ["NO-Hardhat", "NO-Mask", "NO-Safety Vest"];

/// Membership test against [`VIOLATION_CLASSES`]. Exact match; detectors
/// report class names verbatim, so no substring or label parsing is involved.
pub fn is_violation_class(class_name: &str) -> bool {
    VIOLATION_CLASSES.contains(&class_name)
}

/// Axis-aligned box in frame pixel coordinates, `(x1, y1)` top-left
/// inclusive, `(x2, y2)` bottom-right exclusive.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BoundingBox {
    pub x1: u32,
    pub y1: u32,
    pub x2: u32,
    pub y2: u32,
}

impl BoundingBox {
    pub fn new(x1: u32, y1: u32, x2: u32, y2: u32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn width(&self) -> u32 {
        self.x2.saturating_sub(self.x1)
    }

    pub fn height(&self) -> u32 {
        self.y2.saturating_sub(self.y1)
    }
}

/// One structured detector result. Detectors emit the class name and
/// confidence as separate fields; nothing downstream parses labels.
#[derive(Clone, Debug, PartialEq)]
pub struct Detection {
    pub class_name: String,
    pub confidence: f32,
    pub bbox: BoundingBox,
}

impl Detection {
    pub fn new(class_name: impl Into<String>, confidence: f32, bbox: BoundingBox) -> Self {
        Self {
            class_name: class_name.into(),
            confidence,
            bbox,
        }
    }

    pub fn is_violation(&self) -> bool {
        is_violation_class(&self.class_name)
    }
}
