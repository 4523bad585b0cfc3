//! Incremental `event:`/`data:` framing over a chunked HTTP response.
//!
//! Frames are separated by a blank line (`\n\n`). Inside a frame an `event:`
//! line names the event and every `data:` line is trimmed and concatenated
//! into the payload. Payloads are decoded as JSON when possible and delivered
//! as raw text otherwise.
//!
//! The connection lifecycle is folded into the frame sequence: a clean close
//! yields a synthetic `done` frame and a transport failure an `error` frame.

use futures::StreamExt;
use reqwest::RequestBuilder;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

const FRAME_DELIMITER: &[u8] = b"\n\n";

/// Event name of the synthetic clean-close frame
pub const EVENT_DONE: &str = "done";
/// Event name of the synthetic failure frame
pub const EVENT_ERROR: &str = "error";

/// Payload of a frame
#[derive(Debug, Clone, PartialEq)]
pub enum FrameData {
    /// Payload decoded as JSON
    Json(Value),
    /// Payload that was not valid JSON
    Text(String),
}

/// One discrete frame of the stream
#[derive(Debug, Clone, PartialEq)]
pub struct StreamFrame {
    pub event: Option<String>,
    pub data: FrameData,
}

impl StreamFrame {
    pub fn done() -> Self {
        Self {
            event: Some(EVENT_DONE.to_string()),
            data: FrameData::Json(json!({ "ok": true })),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            event: Some(EVENT_ERROR.to_string()),
            data: FrameData::Json(json!({ "message": message.into() })),
        }
    }

    pub fn event(&self) -> Option<&str> {
        self.event.as_deref()
    }

    pub fn json(&self) -> Option<&Value> {
        match &self.data {
            FrameData::Json(value) => Some(value),
            FrameData::Text(_) => None,
        }
    }

    /// `done` or `error`
    pub fn is_terminal(&self) -> bool {
        matches!(self.event(), Some(EVENT_DONE) | Some(EVENT_ERROR))
    }

    /// Human-readable message of an `error` frame
    pub fn error_message(&self) -> Option<String> {
        if self.event() != Some(EVENT_ERROR) {
            return None;
        }
        Some(match &self.data {
            FrameData::Json(value) => value
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| value.to_string()),
            FrameData::Text(text) => text.clone(),
        })
    }
}

/// Incremental frame parser.
///
/// Bytes can be fed either as deltas ([`FrameParser::push`]) or as the whole
/// buffer received so far ([`FrameParser::on_progress`]). Any split of the
/// input, including inside the delimiter or inside a UTF-8 sequence, yields
/// the same frames as parsing it in one piece.
#[derive(Debug, Default)]
pub struct FrameParser {
    accum: Vec<u8>,
    last_index: usize,
}

impl FrameParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed the full buffer received so far; only bytes past the previous
    /// call are consumed.
    pub fn on_progress(&mut self, buffer: &[u8]) -> Vec<StreamFrame> {
        let start = self.last_index.min(buffer.len());
        self.last_index = buffer.len();
        self.push(&buffer[start..])
    }

    /// Feed newly received bytes.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<StreamFrame> {
        self.accum.extend_from_slice(chunk);

        let mut frames = Vec::new();
        let mut consumed = 0;
        while let Some(pos) = find_delimiter(&self.accum[consumed..]) {
            let segment = &self.accum[consumed..consumed + pos];
            if let Some(frame) = parse_frame(segment) {
                frames.push(frame);
            }
            consumed += pos + FRAME_DELIMITER.len();
        }
        self.accum.drain(..consumed);

        frames
    }

    /// Bytes held back waiting for a delimiter
    pub fn pending(&self) -> usize {
        self.accum.len()
    }
}

fn find_delimiter(haystack: &[u8]) -> Option<usize> {
    haystack
        .windows(FRAME_DELIMITER.len())
        .position(|window| window == FRAME_DELIMITER)
}

fn parse_frame(segment: &[u8]) -> Option<StreamFrame> {
    let text = String::from_utf8_lossy(segment);
    if text.trim().is_empty() {
        return None;
    }

    let mut event = None;
    let mut data = String::new();
    for line in text.split('\n') {
        if let Some(rest) = line.strip_prefix("event:") {
            event = Some(rest.trim().to_string());
        } else if let Some(rest) = line.strip_prefix("data:") {
            data.push_str(rest.trim());
        }
    }

    if data.is_empty() {
        return None;
    }

    let data = match serde_json::from_str::<Value>(&data) {
        Ok(value) => FrameData::Json(value),
        Err(_) => FrameData::Text(data),
    };
    trace!(event = ?event, "Frame parsed");
    Some(StreamFrame { event, data })
}

/// A live frame stream read by a background task.
///
/// Dropping the stream aborts the connection.
pub struct FrameStream {
    rx: mpsc::Receiver<StreamFrame>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl FrameStream {
    /// Send `request` and start reading frames. `buffer` bounds the frames
    /// queued ahead of the consumer.
    pub fn open(request: RequestBuilder, buffer: usize) -> Self {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let cancel = CancellationToken::new();
        let task = tokio::spawn(read_frames(request, tx, cancel.clone()));
        Self { rx, cancel, task }
    }

    /// Next frame; `None` once the stream has ended or was aborted.
    pub async fn next(&mut self) -> Option<StreamFrame> {
        if self.cancel.is_cancelled() {
            return None;
        }
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            frame = self.rx.recv() => frame,
        }
    }

    /// Abort the connection. No frame, terminal or not, is delivered after
    /// this returns.
    pub fn abort(&mut self) {
        if !self.cancel.is_cancelled() {
            debug!("Frame stream aborted");
        }
        self.cancel.cancel();
        self.rx.close();
    }

    pub fn is_aborted(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Whether the reader task has exited
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for FrameStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn read_frames(
    request: RequestBuilder,
    tx: mpsc::Sender<StreamFrame>,
    cancel: CancellationToken,
) {
    let response = tokio::select! {
        _ = cancel.cancelled() => return,
        response = request.send() => response,
    };

    let response = match response {
        Ok(response) => response,
        Err(e) => {
            warn!(error = %e, "Stream connection failed");
            emit(&tx, &cancel, StreamFrame::error(format!("network error: {e}"))).await;
            return;
        }
    };

    let status = response.status();
    debug!(
        status = status.as_u16(),
        content_type = ?response.headers().get(reqwest::header::CONTENT_TYPE),
        "Stream headers received"
    );
    if status.as_u16() >= 400 {
        emit(&tx, &cancel, StreamFrame::error(format!("HTTP {}", status.as_u16()))).await;
        return;
    }

    let mut parser = FrameParser::new();
    let mut body = response.bytes_stream();
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            next = body.next() => next,
        };

        match next {
            Some(Ok(chunk)) => {
                for frame in parser.push(&chunk) {
                    if !emit(&tx, &cancel, frame).await {
                        return;
                    }
                }
            }
            Some(Err(e)) => {
                warn!(error = %e, "Stream read failed");
                emit(&tx, &cancel, StreamFrame::error(format!("network error: {e}"))).await;
                return;
            }
            None => {
                debug!(pending = parser.pending(), "Stream closed by server");
                emit(&tx, &cancel, StreamFrame::done()).await;
                return;
            }
        }
    }
}

/// Deliver a frame unless the stream was aborted; false once delivery is over.
async fn emit(
    tx: &mpsc::Sender<StreamFrame>,
    cancel: &CancellationToken,
    frame: StreamFrame,
) -> bool {
    if cancel.is_cancelled() {
        return false;
    }
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        sent = tx.send(frame) => sent.is_ok(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::Method::GET;
    use httpmock::MockServer;
    use std::time::Duration;

    const FIXTURE: &str = concat!(
        "event: section\n",
        "data: {\"section\":\"quick_facts\",\"data\":{\"name\":\"Ré\"}}\n",
        "\n",
        ": keepalive\n",
        "\n",
        "event: section\n",
        "data: {\"section\":\"overall\",\n",
        "data:  \"data\":{\"score\":{\"letter\":\"A\"}}}\n",
        "\n",
        "event: note\n",
        "data: not json at all\n",
        "\n",
        "event: empty\n",
        "data:\n",
        "\n",
        "\n\n\n",
        "event: tail\n",
        "data: {\"partial\":true}",
    );

    fn parse_whole(input: &[u8]) -> Vec<StreamFrame> {
        FrameParser::new().push(input)
    }

    #[test]
    fn test_parses_events_and_payloads() {
        let frames = parse_whole(FIXTURE.as_bytes());

        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0].event(), Some("section"));
        assert_eq!(
            frames[0].json().unwrap()["data"]["name"],
            Value::String("Ré".to_string())
        );

        // Multi-line data is concatenated after trimming each line
        assert_eq!(frames[1].json().unwrap()["section"], "overall");
        assert_eq!(frames[1].json().unwrap()["data"]["score"]["letter"], "A");

        // Invalid JSON degrades to text instead of being dropped
        assert_eq!(frames[2].event(), Some("note"));
        assert_eq!(frames[2].data, FrameData::Text("not json at all".to_string()));
    }

    #[test]
    fn test_incomplete_tail_is_held_back() {
        let mut parser = FrameParser::new();
        let frames = parser.push(FIXTURE.as_bytes());
        assert_eq!(frames.len(), 3);
        // The blank segment before it leaves one newline in front
        assert_eq!(parser.pending(), "\nevent: tail\ndata: {\"partial\":true}".len());

        let frames = parser.push(b"\n\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].event(), Some("tail"));
        assert_eq!(parser.pending(), 0);
    }

    #[test]
    fn test_any_two_way_split_matches_whole_parse() {
        let input = FIXTURE.as_bytes();
        let expected = parse_whole(input);

        for split in 0..=input.len() {
            let mut parser = FrameParser::new();
            let mut frames = parser.push(&input[..split]);
            frames.extend(parser.push(&input[split..]));
            assert_eq!(frames, expected, "split at byte {split}");
        }
    }

    #[test]
    fn test_byte_at_a_time_matches_whole_parse() {
        let input = FIXTURE.as_bytes();
        let expected = parse_whole(input);

        let mut parser = FrameParser::new();
        let frames: Vec<_> = input
            .iter()
            .flat_map(|b| parser.push(std::slice::from_ref(b)))
            .collect();
        assert_eq!(frames, expected);
    }

    #[test]
    fn test_accumulated_buffer_delivery() {
        let input = FIXTURE.as_bytes();
        let expected = parse_whole(input);

        // Each notification carries everything received so far
        let mut parser = FrameParser::new();
        let mut frames = Vec::new();
        for end in [5, 17, 60, 61, 62, 120, input.len()] {
            frames.extend(parser.on_progress(&input[..end.min(input.len())]));
        }
        // A repeated notification with no new bytes yields nothing
        frames.extend(parser.on_progress(input));
        assert_eq!(frames, expected);
    }

    #[test]
    fn test_error_message() {
        assert_eq!(
            StreamFrame::error("HTTP 502").error_message().as_deref(),
            Some("HTTP 502")
        );
        assert!(StreamFrame::done().error_message().is_none());
        assert!(StreamFrame::done().is_terminal());
    }

    #[tokio::test]
    async fn test_stream_reports_frames_then_done() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/stream");
                then.status(200)
                    .header("content-type", "text/event-stream")
                    .body("event: section\ndata: {\"section\":\"a\",\"data\":1}\n\n");
            })
            .await;

        let request = reqwest::Client::new().get(server.url("/stream"));
        let mut stream = FrameStream::open(request, 8);

        let first = stream.next().await.unwrap();
        assert_eq!(first.event(), Some("section"));
        let second = stream.next().await.unwrap();
        assert_eq!(second, StreamFrame::done());
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_http_error_status_becomes_error_frame() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/stream");
                then.status(503);
            })
            .await;

        let request = reqwest::Client::new().get(server.url("/stream"));
        let mut stream = FrameStream::open(request, 8);

        let frame = stream.next().await.unwrap();
        assert_eq!(frame.error_message().as_deref(), Some("HTTP 503"));
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_abort_suppresses_further_frames() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/stream");
                then.status(200)
                    .delay(Duration::from_millis(300))
                    .body("event: section\ndata: {}\n\n");
            })
            .await;

        let request = reqwest::Client::new().get(server.url("/stream"));
        let mut stream = FrameStream::open(request, 8);
        stream.abort();

        assert!(stream.is_aborted());
        assert!(stream.next().await.is_none());
    }
}
