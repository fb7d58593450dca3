//! PPE Monitor
//!
//! This crate implements a safety-compliance video monitor: it ingests video
//! sources, runs PPE detection over their frames, and serves live streams,
//! violation events, and compliance statistics over HTTP.
//!
//! # Architecture
//!
//! A few rules hold throughout the pipeline:
//!
//! 1. **One producer per source**: exactly one thread decodes and paces a
//!    source; everything else reads frame copies through cursors.
//! 2. **Consumers never block producers**: the frame buffer is bounded and
//!    eviction-based; slow readers lose frames, not the pipeline.
//! 3. **Detection is authoritative**: violation records, events, and alerts
//!    come from the per-source detection worker only. Annotated streams run
//!    their own detector instance purely for display.
//! 4. **Sources fail alone**: a dead decoder flips one source to `error`;
//!    the service, and every other source, keeps running.
//!
//! # Module Structure
//!
//! - `frame`: bounded frame window and cursor reads
//! - `ingest`: decoders, fps pacing, file looping (`stub://` for tests)
//! - `detect`: detector trait, registry, and backends
//! - `annotate`: detection box overlays
//! - `jpeg`: JPEG encoding and the placeholder frame
//! - `track`: per-source violation aggregation and the report
//! - `events`: rolling event log and SSE fan-out
//! - `alert`: email alert gate and transport
//! - `sources`: source registry and worker threads
//! - `api`: HTTP endpoints, MJPEG streams, SSE
//! - `state`: the shared application aggregate
//! - `config`: startup configuration layering

pub mod alert;
pub mod annotate;
pub mod api;
pub mod config;
pub mod detect;
pub mod events;
pub mod frame;
pub mod ingest;
pub mod jpeg;
pub mod sources;
pub mod state;
pub mod track;

pub use alert::{AlertGate, AlertMessage, LogMailer, Mailer};
pub use config::{MonitorConfig, SourceEntry};
pub use detect::{
    is_violation_class, BoundingBox, Detection, Detector, DetectorRegistry, ScriptedDetector,
    SyntheticDetector, PPE_CLASSES, VIOLATION_CLASSES,
};
#[cfg(feature = "backend-onnx")]
pub use detect::OnnxDetector;
pub use events::{DetectionEvent, EventBroadcaster, EventLog};
pub use frame::{Frame, FrameBuffer, ReadOutcome, SharedFrameBuffer, BUFFER_CAPACITY};
pub use ingest::{FrameSource, SourceFrame, SourceKind};
pub use sources::{
    AddSource, DashboardStats, SourceInfo, SourceManager, SourceStatus, SourceSummary,
};
pub use state::{AppState, Settings, SettingsUpdate, SharedSettings};
pub use track::{ViolationRecord, ViolationTracker};
