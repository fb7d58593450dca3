use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::ingest::SourceKind;

const DEFAULT_API_ADDR: &str = "127.0.0.1:8870";
const DEFAULT_DETECTOR: &str = "ppe";
const DEFAULT_CONFIDENCE: f32 = 0.5;
const DEFAULT_VIDEO_DIR: &str = "videos";
const DEFAULT_ALERT_SENDER: &str = "ppe-monitor@localhost";

#[derive(Debug, Deserialize, Default)]
struct MonitorConfigFile {
    api: Option<ApiConfigFile>,
    detection: Option<DetectionConfigFile>,
    alerts: Option<AlertsConfigFile>,
    video_dir: Option<String>,
    sources: Option<Vec<SourceEntryFile>>,
}

#[derive(Debug, Deserialize, Default)]
struct ApiConfigFile {
    addr: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct DetectionConfigFile {
    detector: Option<String>,
    confidence_threshold: Option<f32>,
}

#[derive(Debug, Deserialize, Default)]
struct AlertsConfigFile {
    enabled: Option<bool>,
    recipient: Option<String>,
    sender: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SourceEntryFile {
    #[serde(rename = "type")]
    kind: SourceKind,
    location: String,
    name: Option<String>,
}

/// A source to register at startup.
#[derive(Debug, Clone)]
pub struct SourceEntry {
    pub kind: SourceKind,
    pub location: String,
    pub name: Option<String>,
}

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub api_addr: String,
    pub detector: String,
    pub confidence_threshold: f32,
    pub email_alerts: bool,
    pub email_recipient: Option<String>,
    pub alert_sender: String,
    pub video_dir: PathBuf,
    pub sources: Vec<SourceEntry>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            api_addr: DEFAULT_API_ADDR.to_string(),
            detector: DEFAULT_DETECTOR.to_string(),
            confidence_threshold: DEFAULT_CONFIDENCE,
            email_alerts: false,
            email_recipient: None,
            alert_sender: DEFAULT_ALERT_SENDER.to_string(),
            video_dir: PathBuf::from(DEFAULT_VIDEO_DIR),
            sources: Vec::new(),
        }
    }
}

impl MonitorConfig {
    /// Resolve configuration in layers: built-in defaults, then the JSON
    /// config file (explicit path, or `PPE_CONFIG`), then `PPE_*` environment
    /// overrides, then validation.
    pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
        let env_path = std::env::var("PPE_CONFIG").ok().map(PathBuf::from);
        let path = explicit_path.map(Path::to_path_buf).or(env_path);
        let file_cfg = match path.as_deref() {
            Some(path) => Some(read_config_file(path)?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: MonitorConfigFile) -> Self {
        let api_addr = file
            .api
            .and_then(|api| api.addr)
            .unwrap_or_else(|| DEFAULT_API_ADDR.to_string());
        let detector = file
            .detection
            .as_ref()
            .and_then(|det| det.detector.clone())
            .unwrap_or_else(|| DEFAULT_DETECTOR.to_string());
        let confidence_threshold = file
            .detection
            .and_then(|det| det.confidence_threshold)
            .unwrap_or(DEFAULT_CONFIDENCE);
        let email_alerts = file
            .alerts
            .as_ref()
            .and_then(|alerts| alerts.enabled)
            .unwrap_or(false);
        let email_recipient = file
            .alerts
            .as_ref()
            .and_then(|alerts| alerts.recipient.clone());
        let alert_sender = file
            .alerts
            .and_then(|alerts| alerts.sender)
            .unwrap_or_else(|| DEFAULT_ALERT_SENDER.to_string());
        let video_dir = PathBuf::from(
            file.video_dir
                .unwrap_or_else(|| DEFAULT_VIDEO_DIR.to_string()),
        );
        let sources = file
            .sources
            .unwrap_or_default()
            .into_iter()
            .map(|entry| SourceEntry {
                kind: entry.kind,
                location: entry.location,
                name: entry.name,
            })
            .collect();
        Self {
            api_addr,
            detector,
            confidence_threshold,
            email_alerts,
            email_recipient,
            alert_sender,
            video_dir,
            sources,
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(addr) = std::env::var("PPE_API_ADDR") {
            if !addr.trim().is_empty() {
                self.api_addr = addr;
            }
        }
        if let Ok(detector) = std::env::var("PPE_DETECTOR") {
            if !detector.trim().is_empty() {
                self.detector = detector;
            }
        }
        if let Ok(threshold) = std::env::var("PPE_CONFIDENCE") {
            self.confidence_threshold = threshold
                .parse()
                .map_err(|_| anyhow!("PPE_CONFIDENCE must be a number"))?;
        }
        if let Ok(enabled) = std::env::var("PPE_EMAIL_ALERTS") {
            self.email_alerts = parse_bool(&enabled)
                .ok_or_else(|| anyhow!("PPE_EMAIL_ALERTS must be a boolean"))?;
        }
        if let Ok(recipient) = std::env::var("PPE_EMAIL_RECIPIENT") {
            let recipient = recipient.trim().to_string();
            self.email_recipient = if recipient.is_empty() {
                None
            } else {
                Some(recipient)
            };
        }
        if let Ok(sender) = std::env::var("PPE_ALERT_SENDER") {
            if !sender.trim().is_empty() {
                self.alert_sender = sender;
            }
        }
        if let Ok(dir) = std::env::var("PPE_VIDEO_DIR") {
            if !dir.trim().is_empty() {
                self.video_dir = PathBuf::from(dir);
            }
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        if !(self.confidence_threshold > 0.0 && self.confidence_threshold <= 1.0) {
            return Err(anyhow!(
                "confidence_threshold must be within (0, 1], got {}",
                self.confidence_threshold
            ));
        }
        if self.detector.trim().is_empty() {
            return Err(anyhow!("detector name must not be empty"));
        }
        if self.api_addr.trim().is_empty() {
            return Err(anyhow!("api addr must not be empty"));
        }
        Ok(())
    }
}

fn read_config_file(path: &Path) -> Result<MonitorConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = serde_json::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
