//! Application state: one explicit aggregate owning every shared handle.
//!
//! Everything the HTTP layer and the worker threads share hangs off
//! [`AppState`]; nothing lives in globals. Handlers receive an `Arc<AppState>`
//! and clone out the pieces they need.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

use crate::alert::Mailer;
use crate::config::MonitorConfig;
use crate::detect::DetectorRegistry;
use crate::events::{EventBroadcaster, EventLog};
use crate::sources::{AddSource, PipelineHandles, SourceManager};

/// Runtime-adjustable knobs, updated through the settings endpoint.
#[derive(Clone, Debug, Serialize)]
pub struct Settings {
    pub confidence_threshold: f32,
    pub email_alerts: bool,
    pub email_recipient: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.5,
            email_alerts: false,
            email_recipient: None,
        }
    }
}

/// Partial settings update. Absent fields keep their current value; an
/// empty recipient clears it.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct SettingsUpdate {
    pub confidence_threshold: Option<f32>,
    pub email_alerts: Option<bool>,
    pub email_recipient: Option<String>,
}

/// Settings handle shared between the HTTP layer and detection workers.
/// Workers read a snapshot per frame, so an update applies from the next
/// frame onward without restarting anything.
#[derive(Clone)]
pub struct SharedSettings {
    inner: Arc<Mutex<Settings>>,
}

impl SharedSettings {
    pub fn new(settings: Settings) -> Self {
        Self {
            inner: Arc::new(Mutex::new(settings)),
        }
    }

    fn locked(&self) -> MutexGuard<'_, Settings> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self) -> Settings {
        self.locked().clone()
    }

    /// Validate and apply a partial update, returning the resulting settings.
    pub fn apply(&self, update: SettingsUpdate) -> Result<Settings> {
        if let Some(threshold) = update.confidence_threshold {
            if !(threshold > 0.0 && threshold <= 1.0) {
                bail!("confidence_threshold must be within (0, 1], got {threshold}");
            }
        }
        let mut settings = self.locked();
        if let Some(threshold) = update.confidence_threshold {
            settings.confidence_threshold = threshold;
        }
        if let Some(enabled) = update.email_alerts {
            settings.email_alerts = enabled;
        }
        if let Some(recipient) = update.email_recipient {
            let recipient = recipient.trim().to_string();
            settings.email_recipient = if recipient.is_empty() {
                None
            } else {
                Some(recipient)
            };
        }
        Ok(settings.clone())
    }
}

/// Everything the service shares between threads.
pub struct AppState {
    pub sources: SourceManager,
    pub events: Arc<EventLog>,
    pub broadcaster: Arc<EventBroadcaster>,
    pub settings: SharedSettings,
    pub detectors: Arc<DetectorRegistry>,
    pub detector_name: String,
    pub video_dir: PathBuf,
}

impl AppState {
    /// Wire up the state aggregate. Fails when the configured detector name
    /// is not registered, so a typo surfaces at startup instead of as a dead
    /// source later.
    pub fn new(
        config: &MonitorConfig,
        mut detectors: DetectorRegistry,
        mailer: Arc<dyn Mailer>,
    ) -> Result<Arc<Self>> {
        detectors.set_default(&config.detector)?;
        let detectors = Arc::new(detectors);

        let events = Arc::new(EventLog::new());
        let broadcaster = Arc::new(EventBroadcaster::new());
        let settings = SharedSettings::new(Settings {
            confidence_threshold: config.confidence_threshold,
            email_alerts: config.email_alerts,
            email_recipient: config.email_recipient.clone(),
        });

        let sources = SourceManager::new(PipelineHandles {
            events: events.clone(),
            broadcaster: broadcaster.clone(),
            settings: settings.clone(),
            detectors: detectors.clone(),
            mailer,
            detector_name: config.detector.clone(),
            alert_sender: config.alert_sender.clone(),
        });

        Ok(Arc::new(Self {
            sources,
            events,
            broadcaster,
            settings,
            detectors,
            detector_name: config.detector.clone(),
            video_dir: config.video_dir.clone(),
        }))
    }

    /// Register the sources listed in the config file. A source that fails
    /// to open is logged and skipped; one dead camera must not take the
    /// service down with it.
    pub fn preload_sources(&self, config: &MonitorConfig) {
        for entry in &config.sources {
            let request = AddSource {
                kind: entry.kind,
                location: entry.location.clone(),
                name: entry.name.clone(),
            };
            match self.sources.add(request) {
                Ok(info) => log::info!("preloaded source '{}'", info.name),
                Err(err) => {
                    log::warn!("skipping configured source '{}': {err:#}", entry.location)
                }
            }
        }
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("detector_name", &self.detector_name)
            .field("video_dir", &self.video_dir)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::LogMailer;

    fn state_with_defaults() -> Arc<AppState> {
        let config = MonitorConfig::default();
        AppState::new(&config, DetectorRegistry::with_defaults(), Arc::new(LogMailer)).unwrap()
    }

    #[test]
    fn settings_updates_are_partial() {
        let shared = SharedSettings::new(Settings::default());
        shared
            .apply(SettingsUpdate {
                confidence_threshold: Some(0.8),
                ..SettingsUpdate::default()
            })
            .unwrap();

        let settings = shared.get();
        assert_eq!(settings.confidence_threshold, 0.8);
        assert!(!settings.email_alerts);
    }

    #[test]
    fn out_of_range_threshold_is_rejected_without_side_effects() {
        let shared = SharedSettings::new(Settings::default());
        assert!(shared
            .apply(SettingsUpdate {
                confidence_threshold: Some(1.5),
                email_alerts: Some(true),
                ..SettingsUpdate::default()
            })
            .is_err());
        let settings = shared.get();
        assert_eq!(settings.confidence_threshold, 0.5);
        assert!(!settings.email_alerts);
    }

    #[test]
    fn empty_recipient_clears_the_address() {
        let shared = SharedSettings::new(Settings {
            email_recipient: Some("safety@example.net".to_string()),
            ..Settings::default()
        });
        shared
            .apply(SettingsUpdate {
                email_recipient: Some("  ".to_string()),
                ..SettingsUpdate::default()
            })
            .unwrap();
        assert!(shared.get().email_recipient.is_none());
    }

    #[test]
    fn unknown_configured_detector_fails_construction() {
        let config = MonitorConfig {
            detector: "does-not-exist".to_string(),
            ..MonitorConfig::default()
        };
        let err = AppState::new(
            &config,
            DetectorRegistry::with_defaults(),
            Arc::new(LogMailer),
        )
        .unwrap_err();
        assert!(err.to_string().contains("unknown detector"));
    }

    #[test]
    fn state_wires_a_default_registry() {
        let state = state_with_defaults();
        assert!(state.detectors.is_registered("ppe"));
        assert!(state.sources.is_empty());
        assert!(state.events.is_empty());
    }
}
