use anyhow::Result;

use crate::detect::result::Detection;
use crate::frame::Frame;

/// Object detector capability.
///
/// Implementations return structured [`Detection`] records; class names come
/// from the model vocabulary and confidence is a separate numeric field, so
/// callers never reconstruct either from a formatted label.
///
/// `detect` takes `&mut self` because real backends keep inference state;
/// every consumer that needs a detector resolves its own instance from the
/// [`DetectorRegistry`](crate::detect::DetectorRegistry) instead of sharing
/// one across threads.
pub trait Detector: Send {
    /// Implementation identifier, for logs.
    fn name(&self) -> &'static str;

    /// Run detection on one frame. A failure applies to this frame only;
    /// callers degrade to "no detections" rather than stopping.
    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>>;

    /// Optional warm-up hook, called once before the first frame.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}

impl std::fmt::Debug for dyn Detector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Detector")
            .field("name", &self.name())
            .finish()
    }
}
