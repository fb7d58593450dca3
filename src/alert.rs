//! Email alerting: transport capability, logging default, and dedupe gate.

use std::collections::HashSet;

use anyhow::Result;
use chrono::{DateTime, Local};

use crate::events::DetectionEvent;

/// One alert ready for transport, snapshot attached.
#[derive(Debug)]
pub struct AlertMessage {
    pub sender: String,
    pub recipient: String,
    pub subject: String,
    pub body: String,
    /// JPEG of the offending frame.
    pub snapshot: Vec<u8>,
}

/// Mail transport. Send failures are logged by the caller; they must never
/// stall the detection path.
pub trait Mailer: Send + Sync {
    fn send(&self, message: &AlertMessage) -> Result<()>;
}

/// Default transport: records the alert in the log instead of sending.
/// Deployments wire a real transport behind the same trait.
pub struct LogMailer;

impl Mailer for LogMailer {
    fn send(&self, message: &AlertMessage) -> Result<()> {
        log::info!(
            "email alert to {}: {} ({} byte snapshot)",
            message.recipient,
            message.subject,
            message.snapshot.len()
        );
        Ok(())
    }
}

/// Dedupe key: one alert per violation class per wall-clock minute.
pub fn alert_key(class_name: &str, at: DateTime<Local>) -> String {
    format!("{}_{}", class_name, at.format("%Y%m%d_%H%M"))
}

/// Remembers which `(class, minute)` keys have already alerted. The set
/// lives and dies with its source, so it stays small in practice.
#[derive(Default)]
pub struct AlertGate {
    sent: HashSet<String>,
}

impl AlertGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// True exactly once per `(class, minute)` key.
    pub fn should_send(&mut self, class_name: &str, at: DateTime<Local>) -> bool {
        self.sent.insert(alert_key(class_name, at))
    }

    pub fn sent_count(&self) -> usize {
        self.sent.len()
    }
}

pub fn violation_subject(source_name: &str) -> String {
    format!("PPE Violation Detected - {source_name}")
}

pub fn violation_body(event: &DetectionEvent, source_name: &str) -> String {
    format!(
        "A PPE violation was detected.\n\n\
         Source: {}\n\
         Violation: {}\n\
         Confidence: {:.2}\n\
         Time: {}\n\
         Frame: {}\n",
        source_name,
        event.violation_type,
        event.confidence,
        event.timestamp.format("%Y-%m-%d %H:%M:%S"),
        event.frame_number
    )
}
