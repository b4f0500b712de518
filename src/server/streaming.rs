//! SSE (Server-Sent Events) relay for token-by-token responses.
//!
//! Each upstream chunk becomes one `data: <chunk json>` frame, flushed as
//! soon as it arrives. Once the response headers are out a failure can no
//! longer change the status code, so a mid-stream fault is reported as a
//! final `event: error` frame before the connection closes.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Instant;

use axum::response::sse::Event;
use futures::stream::{self, Stream};
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{error, info};
use uuid::Uuid;

use crate::error::mid_stream_detail;
use crate::inference::types::{StreamChunk, StreamEvent};
use crate::metrics::Metrics;
use crate::server::api::STREAM_PATH;

/// Where a relayed stream currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamPhase {
    FirstTokenPending,
    Emitting,
    Completed,
    Faulted,
}

/// Per-stream bookkeeping: phase, chunk count and latency milestones.
///
/// Dropped together with the response body, so a stream dropped while
/// still active means the caller went away.
pub struct StreamTracker {
    request_id: Uuid,
    started: Instant,
    metrics: Arc<Metrics>,
    phase: StreamPhase,
    chunks: usize,
}

impl StreamTracker {
    /// `started` is the moment generation was initiated.
    pub fn new(request_id: Uuid, started: Instant, metrics: Arc<Metrics>) -> Self {
        Self {
            request_id,
            started,
            metrics,
            phase: StreamPhase::FirstTokenPending,
            chunks: 0,
        }
    }

    pub fn phase(&self) -> StreamPhase {
        self.phase
    }

    fn on_chunk(&mut self, chunk: &StreamChunk) {
        let elapsed = self.started.elapsed();

        if self.phase == StreamPhase::FirstTokenPending {
            info!(
                request_id = %self.request_id,
                time_to_first_token_secs = elapsed.as_secs_f64(),
                "First token"
            );
            self.metrics.observe_first_token(elapsed);
            self.phase = StreamPhase::Emitting;
        }
        self.chunks += 1;

        if chunk.is_eos() {
            info!(
                request_id = %self.request_id,
                time_to_last_token_secs = elapsed.as_secs_f64(),
                chunks = self.chunks,
                "Last token"
            );
            self.metrics.observe_last_token(elapsed);
            self.phase = StreamPhase::Completed;
        }
    }

    fn on_fault(&mut self) {
        self.phase = StreamPhase::Faulted;
        self.metrics.record_request(STREAM_PATH, "fault");
    }

    fn on_end(&mut self) {
        if self.phase != StreamPhase::Completed {
            info!(
                request_id = %self.request_id,
                chunks = self.chunks,
                "Upstream stream ended without an end-of-sequence chunk"
            );
            self.phase = StreamPhase::Completed;
        }
        self.metrics.record_request(STREAM_PATH, "ok");
    }
}

impl Drop for StreamTracker {
    fn drop(&mut self) {
        if matches!(self.phase, StreamPhase::FirstTokenPending | StreamPhase::Emitting) {
            info!(
                request_id = %self.request_id,
                chunks = self.chunks,
                "Client disconnected mid-stream"
            );
            self.metrics.record_request(STREAM_PATH, "disconnected");
        }
    }
}

/// SSE frame for one upstream chunk.
pub fn chunk_event(chunk: &StreamChunk) -> Event {
    Event::default().data(chunk.to_payload())
}

/// Convert a generation event receiver into an SSE stream.
///
/// Chunks are emitted in arrival order. The stream ends right after the
/// end-of-sequence chunk, or after exactly one error frame following a
/// fault, whatever the channel still holds.
pub fn events_to_sse_stream(
    rx: mpsc::Receiver<StreamEvent>,
    tracker: StreamTracker,
) -> impl Stream<Item = Result<Event, Infallible>> {
    stream::unfold((rx, tracker), |(mut rx, mut tracker)| async move {
        match tracker.phase() {
            StreamPhase::Faulted => return None,
            StreamPhase::Completed => {
                tracker.on_end();
                return None;
            }
            StreamPhase::FirstTokenPending | StreamPhase::Emitting => {}
        }

        let Some(event) = rx.recv().await else {
            tracker.on_end();
            return None;
        };

        let frame = match event {
            StreamEvent::Chunk(chunk) => {
                tracker.on_chunk(&chunk);
                chunk_event(&chunk)
            }
            StreamEvent::Fault(e) => {
                error!(request_id = %tracker.request_id, error = %e, "Streaming error");
                tracker.on_fault();
                Event::default()
                    .event("error")
                    .data(json!({ "detail": mid_stream_detail(&e) }).to_string())
            }
        };

        Some((Ok(frame), (rx, tracker)))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::types::{UpstreamError, EOS_STOP_REASON};
    use futures::StreamExt;

    fn tracker(metrics: &Arc<Metrics>) -> StreamTracker {
        StreamTracker::new(Uuid::new_v4(), Instant::now(), metrics.clone())
    }

    #[tokio::test]
    async fn test_frames_follow_channel_order() {
        let metrics = Arc::new(Metrics::new().unwrap());
        let (tx, rx) = mpsc::channel(8);
        for (text, stop) in [("Pa", None), ("ris", None), (".", None), ("", Some(EOS_STOP_REASON))] {
            tx.send(StreamEvent::Chunk(StreamChunk::text(text, stop))).await.unwrap();
        }
        drop(tx);

        let frames: Vec<_> = events_to_sse_stream(rx, tracker(&metrics)).collect().await;
        assert_eq!(frames.len(), 4);
        assert_eq!(metrics.request_count(STREAM_PATH, "ok"), 1);
    }

    #[tokio::test]
    async fn test_fault_emits_one_error_frame_and_stops() {
        let metrics = Arc::new(Metrics::new().unwrap());
        let (tx, rx) = mpsc::channel(8);
        tx.send(StreamEvent::Chunk(StreamChunk::text("a", None))).await.unwrap();
        tx.send(StreamEvent::Fault(UpstreamError::InvalidPayload("x".into())))
            .await
            .unwrap();
        tx.send(StreamEvent::Chunk(StreamChunk::text("late", None))).await.unwrap();

        let frames: Vec<_> = events_to_sse_stream(rx, tracker(&metrics)).collect().await;
        assert_eq!(frames.len(), 2);
        assert_eq!(metrics.request_count(STREAM_PATH, "fault"), 1);
        drop(tx);
    }

    #[tokio::test]
    async fn test_phase_transitions() {
        let metrics = Arc::new(Metrics::new().unwrap());
        let mut t = tracker(&metrics);
        assert_eq!(t.phase(), StreamPhase::FirstTokenPending);
        t.on_chunk(&StreamChunk::text("a", None));
        assert_eq!(t.phase(), StreamPhase::Emitting);
        t.on_chunk(&StreamChunk::text("", Some(EOS_STOP_REASON)));
        assert_eq!(t.phase(), StreamPhase::Completed);
    }

    #[tokio::test]
    async fn test_dropped_stream_counts_as_disconnect() {
        let metrics = Arc::new(Metrics::new().unwrap());
        let (tx, rx) = mpsc::channel(8);
        tx.send(StreamEvent::Chunk(StreamChunk::text("a", None))).await.unwrap();

        let mut sse = Box::pin(events_to_sse_stream(rx, tracker(&metrics)));
        assert!(sse.next().await.is_some());
        drop(sse);

        assert_eq!(
            metrics.request_count(STREAM_PATH, "disconnected"),
            1
        );
        // The relay side sees the closed channel.
        assert!(tx.is_closed());
    }
}
