use std::collections::HashMap;

use anyhow::{anyhow, Result};

use super::backends::SyntheticDetector;
use super::detector::Detector;

type DetectorCtor = Box<dyn Fn() -> Result<Box<dyn Detector>> + Send + Sync>;

/// Registration table mapping detector names to constructors.
///
/// Constructors rather than instances: `Detector::detect` takes `&mut self`,
/// so each detection worker and each annotated-stream connection resolves a
/// private instance instead of contending on a shared one. Names are resolved
/// at startup; an unknown name is a configuration error, reported as such.
pub struct DetectorRegistry {
    ctors: HashMap<String, DetectorCtor>,
    default_name: Option<String>,
}

impl DetectorRegistry {
    pub fn new() -> Self {
        Self {
            ctors: HashMap::new(),
            default_name: None,
        }
    }

    /// Registry with the stock `"ppe"` detector installed.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register("ppe", || Ok(Box::new(SyntheticDetector::new())));
        registry
    }

    /// Register a constructor. The first registered name becomes the default.
    pub fn register<F>(&mut self, name: &str, ctor: F)
    where
        F: Fn() -> Result<Box<dyn Detector>> + Send + Sync + 'static,
    {
        if self.default_name.is_none() {
            self.default_name = Some(name.to_string());
        }
        self.ctors.insert(name.to_string(), Box::new(ctor));
    }

    /// Set the default detector by name.
    pub fn set_default(&mut self, name: &str) -> Result<()> {
        if !self.ctors.contains_key(name) {
            return Err(self.unknown(name));
        }
        self.default_name = Some(name.to_string());
        Ok(())
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.ctors.contains_key(name)
    }

    /// Registered names, sorted for stable output.
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.ctors.keys().cloned().collect();
        names.sort();
        names
    }

    /// Construct a fresh instance of the named detector.
    pub fn resolve(&self, name: &str) -> Result<Box<dyn Detector>> {
        let ctor = self.ctors.get(name).ok_or_else(|| self.unknown(name))?;
        ctor()
    }

    /// Construct a fresh instance of the default detector.
    pub fn resolve_default(&self) -> Result<Box<dyn Detector>> {
        let name = self
            .default_name
            .as_deref()
            .ok_or_else(|| anyhow!("no detectors registered"))?;
        self.resolve(name)
    }

    pub fn default_name(&self) -> Option<&str> {
        self.default_name.as_deref()
    }

    fn unknown(&self, name: &str) -> anyhow::Error {
        anyhow!(
            "unknown detector '{}' (registered: {})",
            name,
            self.list().join(", ")
        )
    }
}

impl Default for DetectorRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}
