//! Request/response correlator.
//!
//! Tracks the single analysis request that may be in flight and turns
//! inbound frames into request outcomes:
//!
//! ```text
//! Idle → Submitted → (Accepted)? → Completed | Failed
//! ```
//!
//! Submitting is split in two so a refused or unsendable request never
//! touches state: [`Correlator::prepare`] validates and encodes,
//! [`Correlator::mark_submitted`] commits once the frame is on the link.

use std::time::Duration;

use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use birdlens_common::audio::encode_payload;
use birdlens_common::detection::RawDetection;
use birdlens_common::protocol::{id_text, ClientMessage, ServerMessage};

use crate::error::SubmitError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestPhase {
    Idle,
    Submitted,
    Accepted,
    Completed,
    Failed,
}

/// What an inbound frame (or a lost link) meant for the current request.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Accepted { analysis_id: Option<String> },
    Progress(String),
    Completed(Vec<RawDetection>),
    Failed(String),
}

#[derive(Debug)]
pub struct Correlator {
    phase: RequestPhase,
    filename: Option<String>,
    analysis_id: Option<String>,
    submitted_at: Option<Instant>,
    last_error: Option<String>,
    available_commands: Vec<String>,
}

impl Default for Correlator {
    fn default() -> Self {
        Self::new()
    }
}

impl Correlator {
    pub fn new() -> Self {
        Correlator {
            phase: RequestPhase::Idle,
            filename: None,
            analysis_id: None,
            submitted_at: None,
            last_error: None,
            available_commands: Vec::new(),
        }
    }

    pub fn phase(&self) -> RequestPhase {
        self.phase
    }

    pub fn is_analyzing(&self) -> bool {
        matches!(self.phase, RequestPhase::Submitted | RequestPhase::Accepted)
    }

    pub fn analysis_id(&self) -> Option<&str> {
        self.analysis_id.as_deref()
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Commands advertised in the service handshake.
    pub fn available_commands(&self) -> &[String] {
        &self.available_commands
    }

    /// Validate a submission and build its `analyze_audio` frame.
    /// Does not change any state.
    pub fn prepare(
        &self,
        connected: bool,
        audio: &[u8],
        filename: &str,
    ) -> Result<String, SubmitError> {
        if audio.is_empty() {
            return Err(SubmitError::EmptyAudio);
        }
        if !connected {
            return Err(SubmitError::NotConnected);
        }
        if self.is_analyzing() {
            return Err(SubmitError::AlreadyAnalyzing);
        }

        ClientMessage::AnalyzeAudio {
            audio: encode_payload(audio),
            filename: filename.to_string(),
        }
        .to_json()
        .map_err(|e| SubmitError::Encode(e.to_string()))
    }

    /// Record that the frame for `filename` went out.
    pub fn mark_submitted(&mut self, filename: &str, now: Instant) {
        self.phase = RequestPhase::Submitted;
        self.filename = Some(filename.to_string());
        self.analysis_id = None;
        self.last_error = None;
        self.submitted_at = Some(now);
        info!("Submitted {filename} for analysis");
    }

    /// Interpret one inbound text frame.
    ///
    /// Malformed frames and unknown types are logged and ignored; they
    /// never change the request state.
    pub fn handle_frame(&mut self, text: &str) -> Option<Outcome> {
        let message = match ServerMessage::decode(text) {
            Ok(m) => m,
            Err(e) => {
                warn!("Ignoring malformed frame ({e}): {}", preview(text));
                return None;
            }
        };

        match message {
            ServerMessage::Connected { available_commands } => {
                self.available_commands = command_names(&available_commands);
                info!(
                    "Analysis service ready (commands: {})",
                    self.available_commands.join(", ")
                );
                None
            }
            ServerMessage::AnalysisAccepted { analysis_id } => {
                if !self.is_analyzing() {
                    debug!("analysis_accepted while idle, ignoring");
                    return None;
                }
                let analysis_id = id_text(&analysis_id);
                info!(
                    "Analysis of {} accepted (id={})",
                    self.filename.as_deref().unwrap_or("?"),
                    analysis_id.as_deref().unwrap_or("none")
                );
                self.phase = RequestPhase::Accepted;
                self.analysis_id = analysis_id.clone();
                Some(Outcome::Accepted { analysis_id })
            }
            ServerMessage::AnalysisProgress { message } => {
                info!("Analysis progress: {message}");
                self.is_analyzing().then_some(Outcome::Progress(message))
            }
            ServerMessage::AnalysisCompleted(payload) => {
                if !self.is_analyzing() {
                    warn!("analysis_completed with no request in flight, ignoring");
                    return None;
                }
                let detections = payload.into_detections();
                info!(
                    "Analysis of {} completed: {} raw detection(s)",
                    self.filename.as_deref().unwrap_or("?"),
                    detections.len()
                );
                self.finish(RequestPhase::Completed);
                Some(Outcome::Completed(detections))
            }
            ServerMessage::Error { message } => {
                if !self.is_analyzing() {
                    warn!("Service error with no request in flight: {message}");
                    return None;
                }
                let message = if message.is_empty() {
                    "analysis failed".to_string()
                } else {
                    message
                };
                Some(self.fail(message))
            }
            ServerMessage::Unknown => {
                debug!("Ignoring unrecognised message: {}", preview(text));
                None
            }
        }
    }

    /// The link dropped.  An in-flight request is abandoned, not resent.
    pub fn connection_lost(&mut self) -> Option<Outcome> {
        self.is_analyzing()
            .then(|| self.fail("connection lost during analysis".to_string()))
    }

    /// Fail the in-flight request if it has been pending longer than
    /// `timeout`.
    pub fn expire(&mut self, now: Instant, timeout: Duration) -> Option<Outcome> {
        let started = self.submitted_at?;
        if !self.is_analyzing() || now.duration_since(started) < timeout {
            return None;
        }
        Some(self.fail(format!(
            "analysis timed out after {}s",
            timeout.as_secs_f64()
        )))
    }

    fn fail(&mut self, message: String) -> Outcome {
        warn!(
            "Analysis of {} failed: {message}",
            self.filename.as_deref().unwrap_or("?")
        );
        self.finish(RequestPhase::Failed);
        self.last_error = Some(message.clone());
        Outcome::Failed(message)
    }

    fn finish(&mut self, phase: RequestPhase) {
        self.phase = phase;
        self.submitted_at = None;
    }
}

fn command_names(value: &Value) -> Vec<String> {
    match value {
        Value::Array(items) => items
            .iter()
            .filter_map(|v| match v {
                Value::String(s) => Some(s.clone()),
                other => other.get("name").and_then(Value::as_str).map(String::from),
            })
            .collect(),
        Value::Object(map) => map.keys().cloned().collect(),
        _ => Vec::new(),
    }
}

/// First 120 characters of a frame, for logs.
fn preview(text: &str) -> String {
    let mut out: String = text.chars().take(120).collect();
    if out.len() < text.len() {
        out.push('…');
    }
    out
}
