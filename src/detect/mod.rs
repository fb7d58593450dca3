mod backends;
mod detector;
mod registry;
mod result;

pub use backends::{ScriptedDetector, SyntheticDetector};
#[cfg(feature = "backend-onnx")]
pub use backends::OnnxDetector;
pub use detector::Detector;
pub use registry::DetectorRegistry;
pub use result::{is_violation_class, BoundingBox, Detection, PPE_CLASSES, VIOLATION_CLASSES};
