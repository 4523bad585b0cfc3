//! Analysis session: merges streamed sections with the canonical record.
//!
//! A session is keyed by a [`ResourceId`]. It streams the requested sections
//! and fetches the record concurrently, and becomes ready once the record has
//! arrived and the gating section has been merged, in whichever order. The
//! session yields its outcome exactly once and aborts the stream at that
//! point.

use crate::api::{ApiClient, ApiError, ResourceId, ResourceRecord, StreamQuery};
use crate::config::AnalysisConfig;
use crate::stream::{FrameStream, StreamFrame, EVENT_DONE, EVENT_ERROR};
use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Event name of a section frame
pub const EVENT_SECTION: &str = "section";

/// Errors surfaced by an analysis session
#[derive(Error, Debug)]
pub enum AnalysisError {
    #[error("Failed to open analysis stream: {0}")]
    Request(#[source] ApiError),

    #[error("Analysis stream failed: {0}")]
    Stream(String),

    #[error("Failed to fetch record: {0}")]
    Fetch(#[source] ApiError),

    #[error("Stream closed before section {gating} arrived")]
    ServerTimeout { gating: String },

    #[error("Analysis cancelled")]
    Cancelled,

    #[error("Analysis task failed: {0}")]
    TaskFailed(String),
}

/// Section name to payload, one entry per section
pub type Accumulator = BTreeMap<String, Value>;

/// Result of a session that reached the ready state
#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisOutcome {
    pub record: ResourceRecord,
    pub sections: Accumulator,
}

/// Whether an event made the session ready
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub enum Transition {
    Pending,
    Ready,
}

impl Transition {
    pub fn is_ready(self) -> bool {
        self == Transition::Ready
    }
}

/// Synchronous core of a session.
///
/// Owns the accumulator and the navigation guard; every input goes through
/// `&mut self`, so `Ready` is reported at most once.
#[derive(Debug)]
pub struct AnalysisState {
    gating_section: String,
    sections: Accumulator,
    record: Option<ResourceRecord>,
    navigated: bool,
}

impl AnalysisState {
    pub fn new(gating_section: impl Into<String>) -> Self {
        Self {
            gating_section: gating_section.into(),
            sections: Accumulator::new(),
            record: None,
            navigated: false,
        }
    }

    /// Merge a section frame. Frames of other events are ignored.
    pub fn on_frame(&mut self, frame: &StreamFrame) -> Transition {
        if frame.event() != Some(EVENT_SECTION) {
            return Transition::Pending;
        }
        let Some(body) = frame.json() else {
            debug!("Section frame without JSON payload ignored");
            return Transition::Pending;
        };
        let Some(section) = body.get("section").and_then(Value::as_str) else {
            debug!("Section frame without a section name ignored");
            return Transition::Pending;
        };

        let data = body.get("data").cloned().unwrap_or(Value::Null);
        let payload = match data {
            Value::Object(mut map) if map.contains_key(section) => {
                map.remove(section).unwrap_or(Value::Null)
            }
            other => other,
        };

        self.merge_section(section, payload)
    }

    /// Store `payload` under `section`, replacing any earlier payload.
    pub fn merge_section(&mut self, section: &str, payload: Value) -> Transition {
        self.sections.insert(section.to_string(), payload);
        metrics::counter!("analysis.sections.merged").increment(1);
        debug!(section = %section, merged = self.sections.len(), "Section merged");
        self.check()
    }

    pub fn on_record(&mut self, record: ResourceRecord) -> Transition {
        self.record = Some(record);
        self.check()
    }

    pub fn has_gating_section(&self) -> bool {
        self.sections.contains_key(&self.gating_section)
    }

    pub fn has_navigated(&self) -> bool {
        self.navigated
    }

    pub fn sections(&self) -> &Accumulator {
        &self.sections
    }

    pub fn record(&self) -> Option<&ResourceRecord> {
        self.record.as_ref()
    }

    /// Hand over the merged result once ready. Later calls return `None`.
    pub fn take_outcome(&mut self) -> Option<AnalysisOutcome> {
        if !self.navigated {
            return None;
        }
        let record = self.record.take()?;
        Some(AnalysisOutcome {
            record,
            sections: std::mem::take(&mut self.sections),
        })
    }

    fn check(&mut self) -> Transition {
        if self.navigated || self.record.is_none() || !self.has_gating_section() {
            return Transition::Pending;
        }
        self.navigated = true;
        Transition::Ready
    }
}

/// Runs analysis sessions against the API
#[derive(Clone)]
pub struct AnalysisRunner {
    api: ApiClient,
    config: AnalysisConfig,
}

impl AnalysisRunner {
    pub fn new(api: ApiClient, config: AnalysisConfig) -> Self {
        Self { api, config }
    }

    pub fn query(&self) -> StreamQuery {
        StreamQuery {
            sections: self.config.sections.clone(),
            timeout: self.config.timeout(),
        }
    }

    /// Drive one session to completion or until `cancel` fires.
    #[instrument(skip(self, cancel), fields(resource_id = %resource_id))]
    pub async fn run(
        &self,
        resource_id: ResourceId,
        cancel: CancellationToken,
    ) -> Result<AnalysisOutcome, AnalysisError> {
        let query = self.query();
        let request = tokio::select! {
            _ = cancel.cancelled() => return Err(AnalysisError::Cancelled),
            request = self.api.analysis_stream_request(resource_id, &query) => {
                request.map_err(AnalysisError::Request)?
            }
        };

        let mut stream = FrameStream::open(request, self.config.frame_buffer);
        let fetch = self.api.get_resource(resource_id);
        tokio::pin!(fetch);

        let mut state = AnalysisState::new(self.config.gating_section.clone());
        let mut fetch_pending = true;
        let mut stream_open = true;

        loop {
            let transition = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    stream.abort();
                    debug!("Analysis session torn down");
                    return Err(AnalysisError::Cancelled);
                }
                result = &mut fetch, if fetch_pending => {
                    fetch_pending = false;
                    match result {
                        Ok(record) => state.on_record(record),
                        Err(e) => {
                            stream.abort();
                            warn!(error = %e, "Record fetch failed");
                            return Err(AnalysisError::Fetch(e));
                        }
                    }
                }
                frame = stream.next(), if stream_open => match frame {
                    Some(frame) => match frame.event() {
                        Some(EVENT_ERROR) => {
                            let message = frame.error_message().unwrap_or_default();
                            warn!(error = %message, "Analysis stream reported an error");
                            return Err(AnalysisError::Stream(message));
                        }
                        Some(EVENT_DONE) => {
                            stream_open = false;
                            if !state.has_gating_section() {
                                return Err(self.server_timeout());
                            }
                            Transition::Pending
                        }
                        _ => state.on_frame(&frame),
                    },
                    None => {
                        stream_open = false;
                        if !state.has_gating_section() {
                            return Err(self.server_timeout());
                        }
                        Transition::Pending
                    }
                },
                else => return Err(self.server_timeout()),
            };

            if transition.is_ready() {
                stream.abort();
                break;
            }
        }

        let outcome = state
            .take_outcome()
            .ok_or_else(|| AnalysisError::TaskFailed("ready without outcome".to_string()))?;
        info!(sections = outcome.sections.len(), "Analysis ready");
        Ok(outcome)
    }

    /// Run a session on its own task.
    pub fn spawn(&self, resource_id: ResourceId) -> AnalysisHandle {
        let cancel = CancellationToken::new();
        let runner = self.clone();
        let token = cancel.clone();
        let task = tokio::spawn(async move { runner.run(resource_id, token).await });
        AnalysisHandle {
            resource_id,
            cancel,
            task: Some(task),
        }
    }

    fn server_timeout(&self) -> AnalysisError {
        AnalysisError::ServerTimeout {
            gating: self.config.gating_section.clone(),
        }
    }
}

/// A session running on a background task
pub struct AnalysisHandle {
    resource_id: ResourceId,
    cancel: CancellationToken,
    task: Option<JoinHandle<Result<AnalysisOutcome, AnalysisError>>>,
}

impl AnalysisHandle {
    pub fn resource_id(&self) -> ResourceId {
        self.resource_id
    }

    /// Tear the session down; its result is discarded.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub async fn outcome(mut self) -> Result<AnalysisOutcome, AnalysisError> {
        let task = self
            .task
            .take()
            .ok_or_else(|| AnalysisError::TaskFailed("outcome already taken".to_string()))?;
        task.await
            .map_err(|e| AnalysisError::TaskFailed(e.to_string()))?
    }
}

impl Drop for AnalysisHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Holds the session for the resource currently on screen.
///
/// Starting a session for a different id tears the previous one down.
pub struct AnalysisController {
    runner: AnalysisRunner,
    current: Option<AnalysisHandle>,
}

impl AnalysisController {
    pub fn new(runner: AnalysisRunner) -> Self {
        Self {
            runner,
            current: None,
        }
    }

    /// Key the controller to `resource_id`. Re-keying to the id already
    /// running keeps that session.
    pub fn start(&mut self, resource_id: ResourceId) {
        if let Some(current) = &self.current {
            if current.resource_id() == resource_id {
                return;
            }
            debug!(previous = %current.resource_id(), next = %resource_id, "Re-keying analysis");
            current.cancel();
        }
        self.current = Some(self.runner.spawn(resource_id));
    }

    pub fn current(&self) -> Option<ResourceId> {
        self.current.as_ref().map(AnalysisHandle::resource_id)
    }

    /// Wait for the current session's outcome.
    pub async fn wait(&mut self) -> Option<Result<AnalysisOutcome, AnalysisError>> {
        let handle = self.current.take()?;
        Some(handle.outcome().await)
    }

    pub fn cancel(&mut self) {
        if let Some(handle) = self.current.take() {
            handle.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::ResourceId;
    use crate::stream::{FrameData, FrameParser};
    use serde_json::json;

    fn record(id: i64) -> ResourceRecord {
        serde_json::from_value(json!({ "id": id, "name": "Submariner" })).unwrap()
    }

    fn section_frame(section: &str, data: Value) -> StreamFrame {
        StreamFrame {
            event: Some(EVENT_SECTION.to_string()),
            data: FrameData::Json(json!({ "section": section, "data": data })),
        }
    }

    #[test]
    fn test_record_then_section() {
        let mut state = AnalysisState::new("quick_facts");

        assert_eq!(state.on_record(record(1)), Transition::Pending);
        assert_eq!(
            state.on_frame(&section_frame("overall", json!({ "letter": "B" }))),
            Transition::Pending
        );
        assert_eq!(
            state.on_frame(&section_frame("quick_facts", json!({ "brand": "Rolex" }))),
            Transition::Ready
        );
        assert!(state.has_navigated());
    }

    #[test]
    fn test_section_then_record() {
        let mut state = AnalysisState::new("quick_facts");

        assert_eq!(
            state.on_frame(&section_frame("quick_facts", json!({}))),
            Transition::Pending
        );
        assert_eq!(state.on_record(record(1)), Transition::Ready);
    }

    #[test]
    fn test_ready_exactly_once() {
        let mut state = AnalysisState::new("quick_facts");
        assert!(state.on_record(record(1)) == Transition::Pending);
        assert!(state.on_frame(&section_frame("quick_facts", json!(1))).is_ready());

        // Later inputs never re-trigger
        assert!(!state.on_frame(&section_frame("quick_facts", json!(2))).is_ready());
        assert!(!state.on_record(record(1)).is_ready());

        assert!(state.take_outcome().is_some());
        assert!(state.take_outcome().is_none());
    }

    #[test]
    fn test_not_ready_without_both_inputs() {
        let mut state = AnalysisState::new("quick_facts");
        assert!(state.take_outcome().is_none());
        assert!(!state.on_frame(&section_frame("overall", json!({}))).is_ready());
        assert!(!state.on_record(record(1)).is_ready());
        assert!(state.take_outcome().is_none());
    }

    #[test]
    fn test_accumulator_keeps_last_payload_per_section() {
        let mut state = AnalysisState::new("never");
        let writes = [
            ("overall", json!({ "letter": "C" })),
            ("quick_facts", json!({ "year": 1968 })),
            ("overall", json!({ "letter": "A" })),
        ];
        for (section, data) in writes {
            let _ = state.on_frame(&section_frame(section, data));
        }

        assert_eq!(state.sections().len(), 2);
        assert_eq!(state.sections()["overall"], json!({ "letter": "A" }));
        assert_eq!(state.sections()["quick_facts"], json!({ "year": 1968 }));
    }

    #[test]
    fn test_nested_section_payload_is_unwrapped() {
        let mut state = AnalysisState::new("quick_facts");
        let _ = state.on_frame(&section_frame(
            "quick_facts",
            json!({ "quick_facts": { "brand": "Omega" }, "meta": 1 }),
        ));
        let _ = state.on_frame(&section_frame("overall", json!({ "letter": "A" })));

        assert_eq!(state.sections()["quick_facts"], json!({ "brand": "Omega" }));
        assert_eq!(state.sections()["overall"], json!({ "letter": "A" }));
    }

    #[test]
    fn test_non_section_frames_are_ignored() {
        let mut state = AnalysisState::new("quick_facts");
        let _ = state.on_frame(&StreamFrame {
            event: Some("progress".to_string()),
            data: FrameData::Json(json!({ "section": "quick_facts", "data": {} })),
        });
        let _ = state.on_frame(&StreamFrame {
            event: Some(EVENT_SECTION.to_string()),
            data: FrameData::Text("garbled".to_string()),
        });
        let _ = state.on_frame(&StreamFrame {
            event: Some(EVENT_SECTION.to_string()),
            data: FrameData::Json(json!({ "data": {} })),
        });
        assert!(state.sections().is_empty());
    }

    #[test]
    fn test_two_sections_in_one_delivery() {
        let chunk = concat!(
            "event: section\ndata: {\"section\":\"quick_facts\",\"data\":{\"brand\":\"Seiko\"}}\n\n",
            "event: section\ndata: {\"section\":\"overall\",\"data\":{\"letter\":\"B\"}}\n\n",
        );
        let mut parser = FrameParser::new();
        let mut state = AnalysisState::new("quick_facts");

        for frame in parser.push(chunk.as_bytes()) {
            let _ = state.on_frame(&frame);
        }

        let keys: Vec<_> = state.sections().keys().cloned().collect();
        assert_eq!(keys, vec!["overall".to_string(), "quick_facts".to_string()]);
    }

    #[test]
    fn test_outcome_carries_record_and_sections() {
        let mut state = AnalysisState::new("quick_facts");
        let _ = state.on_frame(&section_frame("quick_facts", json!({ "x": 1 })));
        assert!(state.on_record(record(9)).is_ready());

        let outcome = state.take_outcome().unwrap();
        assert_eq!(outcome.record.id, ResourceId(9));
        assert_eq!(outcome.sections["quick_facts"], json!({ "x": 1 }));
    }
}
