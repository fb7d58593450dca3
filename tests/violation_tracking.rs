use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::Local;

use ppe_monitor::sources::AddSource;
use ppe_monitor::track::render_report;
use ppe_monitor::{
    AlertMessage, AppState, BoundingBox, Detection, DetectorRegistry, LogMailer, Mailer,
    MonitorConfig, ScriptedDetector, SourceKind,
};

/// Registry whose "ppe" detector reports one NO-Hardhat per frame for a few
/// hundred frames.
fn violating_registry() -> DetectorRegistry {
    let mut registry = DetectorRegistry::new();
    registry.register("ppe", || {
        let steps = (0..400)
            .map(|_| {
                vec![Detection::new(
                    "NO-Hardhat",
                    0.9,
                    BoundingBox::new(10, 10, 60, 60),
                )]
            })
            .collect();
        Ok(Box::new(ScriptedDetector::with_script(steps)))
    });
    registry
}

fn wait_until(deadline: Duration, mut check: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if check() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    false
}

fn add_source(state: &AppState, kind: SourceKind, location: &str, name: &str) -> Result<Arc<ppe_monitor::SourceInfo>> {
    state.sources.add(AddSource {
        kind,
        location: location.to_string(),
        name: Some(name.to_string()),
    })
}

#[test]
fn first_completed_loop_freezes_the_committed_log() -> Result<()> {
    let state = AppState::new(
        &MonitorConfig::default(),
        violating_registry(),
        Arc::new(LogMailer),
    )?;
    let info = add_source(
        &state,
        SourceKind::File,
        "stub://dock?frames=4&fps=200",
        "Dock",
    )?;

    assert!(
        wait_until(Duration::from_secs(5), || !info
            .committed_violations()
            .is_empty()),
        "no loop completion committed the violation log"
    );

    let committed = info.committed_violations();
    assert!(committed.contains_key("NO-Hardhat"));
    let frozen: u64 = committed.values().map(|r| r.count).sum();
    assert!(frozen >= 1);

    // Later loops keep counting but never rewrite the committed log.
    assert!(
        wait_until(Duration::from_secs(5), || info.violation_total() > frozen),
        "violations stopped accumulating after the commit"
    );
    let after = info.committed_violations();
    assert_eq!(after.len(), committed.len());
    assert_eq!(
        after.values().map(|r| r.count).sum::<u64>(),
        frozen,
        "committed log changed after the first completed loop"
    );

    let report = render_report(&state.sources.report_sections(), Local::now());
    assert!(report.contains("Source: Dock"));
    assert!(report.contains("NO-Hardhat"));
    Ok(())
}

#[test]
fn live_streams_never_commit_a_log() -> Result<()> {
    let state = AppState::new(
        &MonitorConfig::default(),
        violating_registry(),
        Arc::new(LogMailer),
    )?;
    let info = add_source(&state, SourceKind::Stream, "stub://cam?fps=200", "Gate Cam")?;

    assert!(
        wait_until(Duration::from_secs(5), || info.violation_total() >= 2),
        "stream produced no violations"
    );
    std::thread::sleep(Duration::from_millis(200));

    // No loop boundary ever fires on a live stream, so the durable log
    // stays open (and empty) for its whole lifetime.
    assert!(info.committed_violations().is_empty());
    assert!(info.compliance_rate() < 100.0);
    assert!(info.summary().violations >= 2);
    Ok(())
}

#[test]
fn detections_land_in_the_shared_event_log() -> Result<()> {
    let state = AppState::new(
        &MonitorConfig::default(),
        violating_registry(),
        Arc::new(LogMailer),
    )?;
    let info = add_source(
        &state,
        SourceKind::File,
        "stub://dock?frames=4&fps=200",
        "Dock",
    )?;

    let events = state.events.clone();
    assert!(
        wait_until(Duration::from_secs(5), || events.len() >= 3),
        "expected at least three detection events"
    );

    let snapshot = events.snapshot();
    assert!(snapshot.len() >= 3);
    for pair in snapshot.windows(2) {
        assert!(pair[0].timestamp <= pair[1].timestamp, "replay order broke");
    }
    for event in &snapshot {
        assert_eq!(event.source_id, info.id);
        assert_eq!(event.violation_type, "NO-Hardhat");
        assert!(event.event_id.starts_with("NO-Hardhat_"), "{}", event.event_id);
        assert!(event.confidence > 0.5);
    }
    Ok(())
}

struct CountingMailer {
    sent: AtomicU64,
    last_subject: Mutex<Option<String>>,
    last_recipient: Mutex<Option<String>>,
}

impl CountingMailer {
    fn new() -> Self {
        Self {
            sent: AtomicU64::new(0),
            last_subject: Mutex::new(None),
            last_recipient: Mutex::new(None),
        }
    }
}

impl Mailer for CountingMailer {
    fn send(&self, message: &AlertMessage) -> Result<()> {
        self.sent.fetch_add(1, Ordering::SeqCst);
        *self.last_subject.lock().unwrap() = Some(message.subject.clone());
        *self.last_recipient.lock().unwrap() = Some(message.recipient.clone());
        Ok(())
    }
}

#[test]
fn violations_trigger_at_most_one_alert_per_class_minute() -> Result<()> {
    let mailer = Arc::new(CountingMailer::new());
    let config = MonitorConfig {
        email_alerts: true,
        email_recipient: Some("safety@example.com".to_string()),
        ..MonitorConfig::default()
    };
    let state = AppState::new(&config, violating_registry(), mailer.clone())?;
    add_source(
        &state,
        SourceKind::File,
        "stub://dock?frames=4&fps=200",
        "Dock",
    )?;

    assert!(
        wait_until(Duration::from_secs(5), || mailer
            .sent
            .load(Ordering::SeqCst)
            >= 1),
        "no alert email went out"
    );
    let first_count = mailer.sent.load(Ordering::SeqCst);

    // More violations of the same class arrive right away; the per-minute
    // gate must swallow them.
    std::thread::sleep(Duration::from_millis(300));
    let second_count = mailer.sent.load(Ordering::SeqCst);
    assert!(
        second_count <= first_count + 1,
        "alert gate let {} extra emails through",
        second_count - first_count
    );

    assert_eq!(
        mailer.last_recipient.lock().unwrap().as_deref(),
        Some("safety@example.com")
    );
    let subject = mailer.last_subject.lock().unwrap().clone();
    assert_eq!(
        subject.as_deref(),
        Some("PPE Violation Detected - Dock")
    );
    Ok(())
}
