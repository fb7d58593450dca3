use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::Result;
use tempfile::NamedTempFile;

use ppe_monitor::{MonitorConfig, SourceKind};

// Environment variables are process-global, so tests that touch them must
// not interleave.
static ENV_LOCK: Mutex<()> = Mutex::new(());

const ENV_KEYS: [&str; 8] = [
    "PPE_CONFIG",
    "PPE_API_ADDR",
    "PPE_DETECTOR",
    "PPE_CONFIDENCE",
    "PPE_EMAIL_ALERTS",
    "PPE_EMAIL_RECIPIENT",
    "PPE_ALERT_SENDER",
    "PPE_VIDEO_DIR",
];

fn clear_env() {
    for key in ENV_KEYS {
        std::env::remove_var(key);
    }
}

fn write_config(json: &str) -> Result<NamedTempFile> {
    let mut file = NamedTempFile::new()?;
    file.write_all(json.as_bytes())?;
    Ok(file)
}

#[test]
fn defaults_apply_without_file_or_env() -> Result<()> {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let cfg = MonitorConfig::load(None)?;
    assert_eq!(cfg.api_addr, "127.0.0.1:8870");
    assert_eq!(cfg.detector, "ppe");
    assert_eq!(cfg.confidence_threshold, 0.5);
    assert!(!cfg.email_alerts);
    assert_eq!(cfg.email_recipient, None);
    assert_eq!(cfg.alert_sender, "ppe-monitor@localhost");
    assert_eq!(cfg.video_dir, PathBuf::from("videos"));
    assert!(cfg.sources.is_empty());

    clear_env();
    Ok(())
}

#[test]
fn file_values_override_defaults() -> Result<()> {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = write_config(
        r#"{
            "api": {"addr": "0.0.0.0:9000"},
            "detection": {"detector": "onnx", "confidence_threshold": 0.25},
            "alerts": {"enabled": true, "recipient": "safety@example.com", "sender": "alerts@example.com"},
            "video_dir": "/srv/footage",
            "sources": [
                {"type": "file", "location": "videos/yard.mp4", "name": "Yard"},
                {"type": "stream", "location": "rtsp://cam.local/feed"}
            ]
        }"#,
    )?;

    let cfg = MonitorConfig::load(Some(file.path()))?;
    assert_eq!(cfg.api_addr, "0.0.0.0:9000");
    assert_eq!(cfg.detector, "onnx");
    assert_eq!(cfg.confidence_threshold, 0.25);
    assert!(cfg.email_alerts);
    assert_eq!(cfg.email_recipient.as_deref(), Some("safety@example.com"));
    assert_eq!(cfg.alert_sender, "alerts@example.com");
    assert_eq!(cfg.video_dir, PathBuf::from("/srv/footage"));
    assert_eq!(cfg.sources.len(), 2);
    assert_eq!(cfg.sources[0].kind, SourceKind::File);
    assert_eq!(cfg.sources[0].location, "videos/yard.mp4");
    assert_eq!(cfg.sources[0].name.as_deref(), Some("Yard"));
    assert_eq!(cfg.sources[1].kind, SourceKind::Stream);
    assert_eq!(cfg.sources[1].name, None);

    clear_env();
    Ok(())
}

#[test]
fn partial_file_keeps_remaining_defaults() -> Result<()> {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = write_config(r#"{"detection": {"confidence_threshold": 0.7}}"#)?;
    let cfg = MonitorConfig::load(Some(file.path()))?;
    assert_eq!(cfg.confidence_threshold, 0.7);
    assert_eq!(cfg.detector, "ppe");
    assert_eq!(cfg.api_addr, "127.0.0.1:8870");

    clear_env();
    Ok(())
}

#[test]
fn env_overrides_file_values() -> Result<()> {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = write_config(
        r#"{
            "api": {"addr": "0.0.0.0:9000"},
            "detection": {"detector": "onnx", "confidence_threshold": 0.25},
            "alerts": {"recipient": "safety@example.com"}
        }"#,
    )?;
    std::env::set_var("PPE_API_ADDR", "127.0.0.1:8888");
    std::env::set_var("PPE_DETECTOR", "ppe");
    std::env::set_var("PPE_CONFIDENCE", "0.9");
    std::env::set_var("PPE_EMAIL_ALERTS", "yes");
    std::env::set_var("PPE_ALERT_SENDER", "watch@example.com");
    std::env::set_var("PPE_VIDEO_DIR", "/tmp/clips");

    let cfg = MonitorConfig::load(Some(file.path()))?;
    assert_eq!(cfg.api_addr, "127.0.0.1:8888");
    assert_eq!(cfg.detector, "ppe");
    assert_eq!(cfg.confidence_threshold, 0.9);
    assert!(cfg.email_alerts);
    assert_eq!(cfg.email_recipient.as_deref(), Some("safety@example.com"));
    assert_eq!(cfg.alert_sender, "watch@example.com");
    assert_eq!(cfg.video_dir, PathBuf::from("/tmp/clips"));

    clear_env();
    Ok(())
}

#[test]
fn config_env_var_points_at_file() -> Result<()> {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = write_config(r#"{"api": {"addr": "10.0.0.1:8000"}}"#)?;
    std::env::set_var("PPE_CONFIG", file.path());

    let cfg = MonitorConfig::load(None)?;
    assert_eq!(cfg.api_addr, "10.0.0.1:8000");

    clear_env();
    Ok(())
}

#[test]
fn empty_recipient_env_clears_file_value() -> Result<()> {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = write_config(r#"{"alerts": {"recipient": "safety@example.com"}}"#)?;
    std::env::set_var("PPE_EMAIL_RECIPIENT", "");

    let cfg = MonitorConfig::load(Some(file.path()))?;
    assert_eq!(cfg.email_recipient, None);

    clear_env();
    Ok(())
}

#[test]
fn invalid_env_values_are_rejected() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("PPE_CONFIDENCE", "abc");
    let err = MonitorConfig::load(None).unwrap_err();
    assert!(err.to_string().contains("PPE_CONFIDENCE"), "{err:#}");

    std::env::set_var("PPE_CONFIDENCE", "1.5");
    let err = MonitorConfig::load(None).unwrap_err();
    assert!(err.to_string().contains("within (0, 1]"), "{err:#}");

    std::env::remove_var("PPE_CONFIDENCE");
    std::env::set_var("PPE_EMAIL_ALERTS", "maybe");
    let err = MonitorConfig::load(None).unwrap_err();
    assert!(err.to_string().contains("PPE_EMAIL_ALERTS"), "{err:#}");

    clear_env();
}

#[test]
fn missing_config_file_is_an_error() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let path = PathBuf::from("/nonexistent/ppe-monitor.json");
    let err = MonitorConfig::load(Some(&path)).unwrap_err();
    assert!(err.to_string().contains("failed to read config file"), "{err:#}");

    clear_env();
}

#[test]
fn malformed_config_file_is_an_error() -> Result<()> {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = write_config("{not json")?;
    let err = MonitorConfig::load(Some(file.path())).unwrap_err();
    assert!(err.to_string().contains("invalid config file"), "{err:#}");

    clear_env();
    Ok(())
}
