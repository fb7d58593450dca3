use std::collections::VecDeque;

use anyhow::{anyhow, Result};

use crate::detect::detector::Detector;
use crate::detect::result::{BoundingBox, Detection, VIOLATION_CLASSES};

/// Default build stand-in for the PPE model. Emits a deterministic pattern
/// keyed off the frame index: a person plus headgear every frame, with the
/// headgear flipping to a violation class once per interval.
pub struct SyntheticDetector {
    violation_interval: u64,
}

impl SyntheticDetector {
    pub fn new() -> Self {
        Self::with_violation_interval(30)
    }

    /// Emit one violation every `interval` frames (cycling through the
    /// violation classes), compliant detections otherwise.
    pub fn with_violation_interval(interval: u64) -> Self {
        Self {
            violation_interval: interval.max(1),
        }
    }
}

impl Default for SyntheticDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl Detector for SyntheticDetector {
    fn name(&self) -> &'static str {
        "synthetic-ppe"
    }

    fn detect(&mut self, frame: &crate::frame::Frame) -> Result<Vec<Detection>> {
        let (w, h) = (frame.width, frame.height);
        let person = BoundingBox::new(w / 4, h / 8, 3 * w / 4, 7 * h / 8);
        let head = BoundingBox::new(w / 3, h / 8, 2 * w / 3, h / 3);

        let mut detections = vec![Detection::new("Person", 0.93, person)];
        if frame.index % self.violation_interval == 0 {
            let cycle = (frame.index / self.violation_interval) as usize;
            let class = VIOLATION_CLASSES[cycle % VIOLATION_CLASSES.len()];
            detections.push(Detection::new(class, 0.82, head));
        } else {
            detections.push(Detection::new("Hardhat", 0.88, head));
        }
        Ok(detections)
    }
}

/// Test detector that replays a prepared script, one step per frame, then
/// reports nothing. Steps may be failures to exercise degrade paths.
pub struct ScriptedDetector {
    steps: VecDeque<Result<Vec<Detection>>>,
}

impl ScriptedDetector {
    pub fn with_script(script: Vec<Vec<Detection>>) -> Self {
        Self {
            steps: script.into_iter().map(Ok).collect(),
        }
    }

    /// Append a failing step after the scripted ones.
    pub fn then_fail(mut self, message: &str) -> Self {
        self.steps.push_back(Err(anyhow!("{message}")));
        self
    }
}

impl Detector for ScriptedDetector {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn detect(&mut self, _frame: &crate::frame::Frame) -> Result<Vec<Detection>> {
        self.steps.pop_front().unwrap_or_else(|| Ok(Vec::new()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Frame;

    fn frame(index: u64) -> Frame {
        Frame::new(index, 64, 48, vec![0; 64 * 48 * 3])
    }

    #[test]
    fn synthetic_violates_on_interval_only() {
        let mut detector = SyntheticDetector::with_violation_interval(5);

        let at_interval = detector.detect(&frame(10)).unwrap();
        assert!(at_interval.iter().any(|d| d.is_violation()));

        let off_interval = detector.detect(&frame(11)).unwrap();
        assert!(!off_interval.iter().any(|d| d.is_violation()));
        assert!(off_interval.iter().any(|d| d.class_name == "Person"));
    }

    #[test]
    fn synthetic_cycles_violation_classes() {
        let mut detector = SyntheticDetector::with_violation_interval(1);
        let classes: Vec<String> = (0..3)
            .map(|i| {
                detector
                    .detect(&frame(i))
                    .unwrap()
                    .into_iter()
                    .find(|d| d.is_violation())
                    .map(|d| d.class_name)
                    .unwrap()
            })
            .collect();
        assert_eq!(classes, ["NO-Hardhat", "NO-Mask", "NO-Safety Vest"]);
    }

    #[test]
    fn scripted_replays_then_goes_quiet() {
        let step = vec![Detection::new(
            "NO-Mask",
            0.91,
            BoundingBox::new(0, 0, 10, 10),
        )];
        let mut detector = ScriptedDetector::with_script(vec![step.clone()]).then_fail("model gone");

        assert_eq!(detector.detect(&frame(0)).unwrap(), step);
        assert!(detector.detect(&frame(1)).is_err());
        assert!(detector.detect(&frame(2)).unwrap().is_empty());
    }
}
