mod synthetic;

#[cfg(feature = "backend-onnx")]
mod onnx;

pub use synthetic::{ScriptedDetector, SyntheticDetector};

#[cfg(feature = "backend-onnx")]
pub use onnx::OnnxDetector;
