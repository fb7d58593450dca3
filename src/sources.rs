//! Source registry and the per-source background pipeline.
//!
//! Each registered source owns its frame buffer, violation tracker,
//! compliance counters, and alert dedupe set. Two detached threads serve a
//! source: a producer (decode, pace, buffer) and a detection worker (buffer,
//! detect, publish). Removal flips the status flag; both threads observe it
//! within one poll interval and exit on their own.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Local};
use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::alert::{violation_body, violation_subject, AlertGate, AlertMessage, Mailer};
use crate::detect::DetectorRegistry;
use crate::events::{DetectionEvent, EventBroadcaster, EventLog};
use crate::frame::{Frame, ReadOutcome, SharedFrameBuffer};
use crate::ingest::{has_allowed_extension, FrameSource, SourceKind};
use crate::jpeg;
use crate::state::{Settings, SharedSettings};
use crate::track::{ReportSection, ViolationRecord, ViolationTracker};

/// How long the detection worker sleeps when its cursor has caught up with
/// the producer.
pub const DETECT_IDLE_POLL: Duration = Duration::from_millis(100);

/// Pause between processed frames so detection never monopolizes a core;
/// the cursor's skip-ahead absorbs the backlog this creates on fast sources.
pub const DETECT_FRAME_PACING: Duration = Duration::from_millis(50);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceStatus {
    /// Removed or never started; workers exit when they see this.
    Inactive,
    /// Producing and detecting.
    Active,
    /// The decoder failed terminally. Clients still get placeholder frames.
    Error,
}

/// A registered source and everything owned on its behalf.
pub struct SourceInfo {
    pub id: String,
    pub name: String,
    pub kind: SourceKind,
    pub location: String,
    pub fps: f64,
    pub buffer: SharedFrameBuffer,
    status: Mutex<SourceStatus>,
    tracker: Mutex<ViolationTracker>,
    frames_processed: AtomicU64,
    violation_frames: AtomicU64,
    last_detection: Mutex<Option<DateTime<Local>>>,
    alert_gate: Mutex<AlertGate>,
}

impl SourceInfo {
    fn new(name: String, kind: SourceKind, location: String, fps: f64) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name,
            kind,
            location,
            fps,
            buffer: SharedFrameBuffer::new(),
            status: Mutex::new(SourceStatus::Inactive),
            tracker: Mutex::new(ViolationTracker::new()),
            frames_processed: AtomicU64::new(0),
            violation_frames: AtomicU64::new(0),
            last_detection: Mutex::new(None),
            alert_gate: Mutex::new(AlertGate::new()),
        }
    }

    // Status and counters stay consistent under panic, so poisoned locks are
    // recovered rather than propagated.
    fn lock_status(&self) -> MutexGuard<'_, SourceStatus> {
        self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_tracker(&self) -> MutexGuard<'_, ViolationTracker> {
        self.tracker.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn status(&self) -> SourceStatus {
        *self.lock_status()
    }

    pub fn is_active(&self) -> bool {
        self.status() == SourceStatus::Active
    }

    fn set_status(&self, status: SourceStatus) {
        *self.lock_status() = status;
    }

    pub fn frames_processed(&self) -> u64 {
        self.frames_processed.load(Ordering::Relaxed)
    }

    /// Share of processed frames without a violation, in percent. A source
    /// that has processed nothing reports 100.
    pub fn compliance_rate(&self) -> f64 {
        let processed = self.frames_processed.load(Ordering::Relaxed);
        if processed == 0 {
            return 100.0;
        }
        let violating = self.violation_frames.load(Ordering::Relaxed);
        (processed - violating) as f64 / processed as f64 * 100.0
    }

    pub fn last_detection(&self) -> Option<DateTime<Local>> {
        *self
            .last_detection
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Total running violation observations this epoch.
    pub fn violation_total(&self) -> u64 {
        self.lock_tracker().total_current()
    }

    /// The durable per-class log, committed by the first completed loop.
    pub fn committed_violations(&self) -> std::collections::BTreeMap<String, ViolationRecord> {
        self.lock_tracker().committed().clone()
    }

    /// Start a fresh tracking epoch for this source.
    pub fn reset_tracking(&self) {
        self.lock_tracker().reset();
        self.frames_processed.store(0, Ordering::Relaxed);
        self.violation_frames.store(0, Ordering::Relaxed);
    }

    fn note_frame(&self, had_violation: bool) {
        self.frames_processed.fetch_add(1, Ordering::Relaxed);
        if had_violation {
            self.violation_frames.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn record_violation(&self, class_name: &str, at: DateTime<Local>) {
        self.lock_tracker().record_at(class_name, at);
        *self
            .last_detection
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(at);
    }

    pub fn summary(&self) -> SourceSummary {
        SourceSummary {
            id: self.id.clone(),
            name: self.name.clone(),
            kind: self.kind,
            status: self.status(),
            location: self.location.clone(),
            fps: self.fps,
            frames_processed: self.frames_processed(),
            violations: self.violation_total(),
            compliance_rate: round2(self.compliance_rate()),
        }
    }
}

impl std::fmt::Debug for SourceInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceInfo")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("location", &self.location)
            .field("fps", &self.fps)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

/// Wire shape for `/api/sources`.
#[derive(Clone, Debug, Serialize)]
pub struct SourceSummary {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: SourceKind,
    pub status: SourceStatus,
    pub location: String,
    pub fps: f64,
    pub frames_processed: u64,
    pub violations: u64,
    pub compliance_rate: f64,
}

/// Wire shape for `/api/stats` and the SSE stats event.
#[derive(Clone, Debug, Serialize)]
pub struct DashboardStats {
    pub active_sources: usize,
    pub active_violations: u64,
    pub compliance_rate: f64,
    pub last_detection: Option<DateTime<Local>>,
}

/// Request to register a source.
#[derive(Clone, Debug, Deserialize)]
pub struct AddSource {
    #[serde(rename = "type")]
    pub kind: SourceKind,
    pub location: String,
    #[serde(default)]
    pub name: Option<String>,
}

/// Shared collaborators handed to every worker thread.
#[derive(Clone)]
pub struct PipelineHandles {
    pub events: Arc<EventLog>,
    pub broadcaster: Arc<EventBroadcaster>,
    pub settings: SharedSettings,
    pub detectors: Arc<DetectorRegistry>,
    pub mailer: Arc<dyn Mailer>,
    pub detector_name: String,
    pub alert_sender: String,
}

/// Registry of live sources plus the wiring their workers need.
pub struct SourceManager {
    sources: Mutex<HashMap<String, Arc<SourceInfo>>>,
    handles: PipelineHandles,
    stream_counter: AtomicU64,
}

impl SourceManager {
    pub fn new(handles: PipelineHandles) -> Self {
        Self {
            sources: Mutex::new(HashMap::new()),
            handles,
            stream_counter: AtomicU64::new(0),
        }
    }

    fn locked(&self) -> MutexGuard<'_, HashMap<String, Arc<SourceInfo>>> {
        self.sources.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Open, register, and start a source. The decoder is opened before
    /// anything is registered, so a bad location never leaves a half-created
    /// entry behind.
    pub fn add(&self, request: AddSource) -> Result<Arc<SourceInfo>> {
        let location = request.location.trim().to_string();
        if request.kind == SourceKind::File
            && !location.starts_with("stub://")
            && !has_allowed_extension(&location)
        {
            bail!(
                "unsupported video format '{}' (allowed: {})",
                Path::new(&location)
                    .extension()
                    .and_then(|e| e.to_str())
                    .unwrap_or("none"),
                crate::ingest::ALLOWED_VIDEO_EXTENSIONS.join(", ")
            );
        }

        let source = FrameSource::open(request.kind, &location)
            .with_context(|| format!("failed to open {} '{location}'", request.kind))?;

        let name = request
            .name
            .map(|n| n.trim().to_string())
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| self.auto_name(request.kind, &location));

        let info = Arc::new(SourceInfo::new(name, request.kind, location, source.fps()));
        info.set_status(SourceStatus::Active);
        self.locked().insert(info.id.clone(), info.clone());
        log::info!(
            "source '{}' registered as {} ({} {})",
            info.name,
            info.id,
            info.kind,
            info.location
        );

        self.spawn_pipeline(source, info.clone());
        Ok(info)
    }

    fn spawn_pipeline(&self, source: FrameSource, info: Arc<SourceInfo>) {
        let producer_info = info.clone();
        thread::spawn(move || run_producer(source, producer_info));

        let handles = self.handles.clone();
        thread::spawn(move || run_detection(handles, info));
    }

    /// Flip a source to inactive and drop it from the registry. Workers and
    /// open stream connections exit on their next status check.
    pub fn remove(&self, id: &str) -> bool {
        let Some(info) = self.locked().remove(id) else {
            return false;
        };
        info.set_status(SourceStatus::Inactive);
        log::info!("source '{}' removed", info.name);
        true
    }

    pub fn get(&self, id: &str) -> Option<Arc<SourceInfo>> {
        self.locked().get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.locked().len()
    }

    pub fn is_empty(&self) -> bool {
        self.locked().is_empty()
    }

    /// Summaries of every registered source, name-ordered for stable output.
    pub fn summaries(&self) -> Vec<SourceSummary> {
        let mut summaries: Vec<SourceSummary> =
            self.locked().values().map(|info| info.summary()).collect();
        summaries.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
        summaries
    }

    pub fn dashboard_stats(&self) -> DashboardStats {
        let sources: Vec<Arc<SourceInfo>> = self.locked().values().cloned().collect();
        let active_sources = sources.iter().filter(|s| s.is_active()).count();
        let active_violations = sources.iter().map(|s| s.violation_total()).sum();
        let compliance_rate = if sources.is_empty() {
            100.0
        } else {
            sources.iter().map(|s| s.compliance_rate()).sum::<f64>() / sources.len() as f64
        };
        let last_detection = sources.iter().filter_map(|s| s.last_detection()).max();
        DashboardStats {
            active_sources,
            active_violations,
            compliance_rate: round2(compliance_rate),
            last_detection,
        }
    }

    /// Committed violation logs per source, name-ordered, for the report.
    pub fn report_sections(&self) -> Vec<ReportSection> {
        let mut sections: Vec<ReportSection> = self
            .locked()
            .values()
            .map(|info| ReportSection {
                source_name: info.name.clone(),
                records: info.committed_violations(),
            })
            .collect();
        sections.sort_by(|a, b| a.source_name.cmp(&b.source_name));
        sections
    }

    fn auto_name(&self, kind: SourceKind, location: &str) -> String {
        match kind {
            SourceKind::File => file_display_name(location),
            SourceKind::Stream => stream_display_name(location).unwrap_or_else(|| {
                format!("Stream {}", self.stream_counter.fetch_add(1, Ordering::Relaxed) + 1)
            }),
        }
    }
}

/// "site_entrance-cam2.mp4" becomes "Site Entrance Cam2".
fn file_display_name(location: &str) -> String {
    let trimmed = location.strip_prefix("stub://").unwrap_or(location);
    let trimmed = trimmed.split('?').next().unwrap_or(trimmed);
    let stem = Path::new(trimmed)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(trimmed);
    let spaced = stem.replace(['_', '-'], " ");
    let mut name = String::with_capacity(spaced.len());
    for (i, word) in spaced.split_whitespace().enumerate() {
        if i > 0 {
            name.push(' ');
        }
        let mut chars = word.chars();
        if let Some(first) = chars.next() {
            name.extend(first.to_uppercase());
            name.push_str(chars.as_str());
        }
    }
    if name.is_empty() {
        "Video".to_string()
    } else {
        name
    }
}

/// "rtsp://10.0.0.8:554/live" becomes "Stream - 10.0.0.8".
fn stream_display_name(location: &str) -> Option<String> {
    static HOST_RE: OnceLock<Regex> = OnceLock::new();
    let re = HOST_RE.get_or_init(|| Regex::new(r"://(?:[^@/]*@)?([^:/?]+)").unwrap());
    re.captures(location)
        .map(|caps| format!("Stream - {}", &caps[1]))
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn run_producer(mut source: FrameSource, info: Arc<SourceInfo>) {
    log::debug!("producer for '{}' started", info.name);
    while info.is_active() {
        match source.read_next() {
            Ok(read) => {
                if read.loop_restarted {
                    log::debug!(
                        "source '{}' restarted its loop at frame {}",
                        info.name,
                        read.frame.index
                    );
                    info.lock_tracker().complete_loop();
                }
                info.buffer.push(read.frame);
            }
            Err(err) => {
                log::warn!("source '{}' failed: {err:#}", info.name);
                info.set_status(SourceStatus::Error);
                break;
            }
        }
    }
    log::info!(
        "producer for '{}' stopped after {} frames",
        info.name,
        source.frames_read()
    );
}

fn run_detection(handles: PipelineHandles, info: Arc<SourceInfo>) {
    let mut detector = match handles.detectors.resolve(&handles.detector_name) {
        Ok(detector) => detector,
        Err(err) => {
            log::error!("source '{}': {err:#}", info.name);
            info.set_status(SourceStatus::Error);
            return;
        }
    };
    if let Err(err) = detector.warm_up() {
        log::warn!("detector warm-up for '{}' failed: {err:#}", info.name);
    }

    let mut cursor = 0u64;
    while info.is_active() {
        let (frame, skipped) = match info.buffer.read_at(cursor) {
            ReadOutcome::NotReady => {
                thread::sleep(DETECT_IDLE_POLL);
                continue;
            }
            ReadOutcome::Frame {
                frame,
                next_cursor,
                skipped,
            } => {
                cursor = next_cursor;
                (frame, skipped)
            }
        };
        if skipped > 0 {
            log::debug!(
                "detection for '{}' skipped ahead past {} frames",
                info.name,
                skipped
            );
        }

        let settings = handles.settings.get();
        let detections = match detector.detect(&frame) {
            Ok(detections) => detections,
            Err(err) => {
                log::warn!(
                    "detector failed on frame {} of '{}': {err:#}",
                    frame.index,
                    info.name
                );
                Vec::new()
            }
        };

        let mut frame_violated = false;
        for detection in &detections {
            if detection.confidence < settings.confidence_threshold || !detection.is_violation() {
                continue;
            }
            frame_violated = true;
            let event = DetectionEvent::new(
                &info.id,
                &detection.class_name,
                detection.confidence,
                frame.index,
            );
            info.record_violation(&detection.class_name, event.timestamp);
            handles.events.append(event.clone());
            handles.broadcaster.publish(&event);
            maybe_send_alert(&handles, &info, &settings, &event, &frame);
        }
        info.note_frame(frame_violated);

        thread::sleep(DETECT_FRAME_PACING);
    }
    log::info!("detection for '{}' stopped", info.name);
}

/// Send one alert per violation class per minute, when alerts are enabled
/// and a recipient is configured. Failures are logged and never bubble up.
fn maybe_send_alert(
    handles: &PipelineHandles,
    info: &SourceInfo,
    settings: &Settings,
    event: &DetectionEvent,
    frame: &Frame,
) {
    if !settings.email_alerts {
        return;
    }
    let Some(recipient) = settings
        .email_recipient
        .as_deref()
        .filter(|r| !r.trim().is_empty())
    else {
        return;
    };
    {
        let mut gate = info
            .alert_gate
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if !gate.should_send(&event.violation_type, event.timestamp) {
            return;
        }
    }

    let snapshot = match jpeg::encode_frame(frame) {
        Ok(bytes) => bytes,
        Err(err) => {
            log::warn!("alert snapshot for '{}' failed: {err:#}", info.name);
            return;
        }
    };
    let message = AlertMessage {
        sender: handles.alert_sender.clone(),
        recipient: recipient.to_string(),
        subject: violation_subject(&info.name),
        body: violation_body(event, &info.name),
        snapshot,
    };
    if let Err(err) = handles.mailer.send(&message) {
        log::warn!("email alert for '{}' failed: {err:#}", info.name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::LogMailer;
    use crate::detect::{BoundingBox, Detection, DetectorRegistry, ScriptedDetector};
    use std::time::Instant;

    fn test_handles(detectors: DetectorRegistry, detector_name: &str) -> PipelineHandles {
        PipelineHandles {
            events: Arc::new(EventLog::new()),
            broadcaster: Arc::new(EventBroadcaster::new()),
            settings: SharedSettings::new(Settings::default()),
            detectors: Arc::new(detectors),
            mailer: Arc::new(LogMailer),
            detector_name: detector_name.to_string(),
            alert_sender: "alerts@example.net".to_string(),
        }
    }

    fn scripted_registry(violation_frames: usize) -> DetectorRegistry {
        let mut registry = DetectorRegistry::new();
        registry.register("scripted", move || {
            let steps = (0..violation_frames)
                .map(|_| {
                    vec![Detection::new(
                        "NO-Hardhat",
                        0.9,
                        BoundingBox::new(0, 0, 10, 10),
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
            thread::sleep(Duration::from_millis(20));
        }
        false
    }

    #[test]
    fn add_rejects_files_with_unsupported_extensions() {
        let manager = SourceManager::new(test_handles(scripted_registry(0), "scripted"));
        let err = manager
            .add(AddSource {
                kind: SourceKind::File,
                location: "clip.mkv".to_string(),
                name: None,
            })
            .unwrap_err();
        assert!(err.to_string().contains("unsupported video format"));
        assert!(manager.is_empty());
    }

    #[test]
    fn add_rejects_unopenable_sources_without_registering() {
        let manager = SourceManager::new(test_handles(scripted_registry(0), "scripted"));
        let err = manager
            .add(AddSource {
                kind: SourceKind::File,
                location: "stub://bad?frames=zero".to_string(),
                name: None,
            })
            .unwrap_err();
        assert!(format!("{err:#}").contains("failed to open"));
        assert!(manager.is_empty());
    }

    #[test]
    fn pipeline_buffers_frames_and_records_violations() {
        let handles = test_handles(scripted_registry(2), "scripted");
        let events = handles.events.clone();
        let manager = SourceManager::new(handles);

        let info = manager
            .add(AddSource {
                kind: SourceKind::File,
                location: "stub://clip?frames=5&fps=120".to_string(),
                name: Some("Test Clip".to_string()),
            })
            .unwrap();

        assert!(wait_until(Duration::from_secs(5), || {
            info.violation_total() >= 2 && !events.is_empty()
        }));
        assert_eq!(info.name, "Test Clip");
        assert!(info.frames_processed() >= 2);
        assert!(info.compliance_rate() < 100.0);
        assert!(info.last_detection().is_some());

        manager.remove(&info.id);
    }

    #[test]
    fn compliant_detections_produce_no_events_or_violation_counts() {
        let mut registry = DetectorRegistry::new();
        registry.register("scripted", || {
            let steps = (0..4)
                .map(|_| vec![Detection::new("Hardhat", 0.9, BoundingBox::new(0, 0, 10, 10))])
                .collect();
            Ok(Box::new(ScriptedDetector::with_script(steps)))
        });
        let handles = test_handles(registry, "scripted");
        let events = handles.events.clone();
        let manager = SourceManager::new(handles);

        let info = manager
            .add(AddSource {
                kind: SourceKind::File,
                location: "stub://clip?frames=5&fps=120".to_string(),
                name: None,
            })
            .unwrap();

        assert!(wait_until(Duration::from_secs(5), || {
            info.frames_processed() >= 4
        }));
        assert!(events.is_empty());
        assert_eq!(info.violation_total(), 0);
        assert_eq!(info.compliance_rate(), 100.0);
        assert!(info.last_detection().is_none());

        manager.remove(&info.id);
    }

    #[test]
    fn compliance_rate_follows_processed_and_violating_counts() {
        let info = SourceInfo::new(
            "Dock".to_string(),
            SourceKind::File,
            "clip.mp4".to_string(),
            30.0,
        );
        assert_eq!(info.compliance_rate(), 100.0);

        info.note_frame(true);
        info.note_frame(false);
        info.note_frame(false);
        info.note_frame(false);
        assert_eq!(info.frames_processed(), 4);
        assert_eq!(info.compliance_rate(), 75.0);
    }

    #[test]
    fn remove_flips_status_and_unregisters() {
        let manager = SourceManager::new(test_handles(scripted_registry(0), "scripted"));
        let info = manager
            .add(AddSource {
                kind: SourceKind::File,
                location: "stub://clip?frames=5&fps=120".to_string(),
                name: None,
            })
            .unwrap();
        assert!(info.is_active());
        assert_eq!(manager.len(), 1);

        assert!(manager.remove(&info.id));
        assert_eq!(info.status(), SourceStatus::Inactive);
        assert!(manager.get(&info.id).is_none());
        assert!(!manager.remove(&info.id));
    }

    #[test]
    fn unknown_detector_marks_the_source_errored() {
        let manager = SourceManager::new(test_handles(scripted_registry(0), "missing"));
        let info = manager
            .add(AddSource {
                kind: SourceKind::File,
                location: "stub://clip?frames=5&fps=120".to_string(),
                name: None,
            })
            .unwrap();

        assert!(wait_until(Duration::from_secs(2), || {
            info.status() == SourceStatus::Error
        }));
    }

    #[test]
    fn dashboard_stats_average_compliance_across_sources() {
        let manager = SourceManager::new(test_handles(scripted_registry(0), "scripted"));
        let stats = manager.dashboard_stats();
        assert_eq!(stats.active_sources, 0);
        assert_eq!(stats.active_violations, 0);
        assert_eq!(stats.compliance_rate, 100.0);
        assert!(stats.last_detection.is_none());
    }

    #[test]
    fn file_names_prettify_to_title_case() {
        assert_eq!(file_display_name("videos/site_entrance-cam2.mp4"), "Site Entrance Cam2");
        assert_eq!(file_display_name("stub://yard_cam?frames=10"), "Yard Cam");
        assert_eq!(file_display_name(""), "Video");
    }

    #[test]
    fn stream_names_use_the_host() {
        assert_eq!(
            stream_display_name("rtsp://10.0.0.8:554/live").as_deref(),
            Some("Stream - 10.0.0.8")
        );
        assert_eq!(
            stream_display_name("rtsp://user:pw@cam.example.net/feed").as_deref(),
            Some("Stream - cam.example.net")
        );
        assert_eq!(stream_display_name("not a url"), None);
    }
}
