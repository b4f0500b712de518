//! Upstream token stream decoding.
//!
//! The provider streams server-sent events whose `data:` payload is one
//! JSON [`StreamChunk`]. [`decode_sse_chunks`] turns the raw response body
//! into chunks; [`spawn_relay`] drives that stream on its own task and
//! hands the results to the gateway as [`StreamEvent`]s.

use std::fmt::Display;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures::stream::{self, Stream, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::inference::types::{StreamChunk, StreamEvent, UpstreamError};

/// Chunks allowed in flight between the upstream reader and the caller.
const RELAY_CAPACITY: usize = 1;

/// Accumulates body bytes and splits them into complete SSE events.
#[derive(Debug, Default)]
struct SseDecoder {
    buffer: BytesMut,
    /// No more input will arrive (end of body or fault).
    done: bool,
}

impl SseDecoder {
    fn push(&mut self, data: &[u8]) {
        // CR only ever appears as part of a line terminator in SSE.
        self.buffer.extend(data.iter().copied().filter(|b| *b != b'\r'));
    }

    /// Next complete event, without its terminating blank line.
    fn next_event(&mut self) -> Option<String> {
        let end = self.buffer.windows(2).position(|w| w == b"\n\n")?;
        let event = self.buffer.split_to(end + 2);
        Some(String::from_utf8_lossy(&event[..end]).into_owned())
    }

    /// Whatever is left once the body has ended.
    fn take_rest(&mut self) -> Option<String> {
        let rest = self.buffer.split();
        let text = String::from_utf8_lossy(&rest).trim().to_string();
        (!text.is_empty()).then_some(text)
    }

    fn fail(&mut self) {
        self.buffer.clear();
        self.done = true;
    }
}

/// Parse one SSE event. Returns `Ok(None)` for events without a payload
/// (keep-alives, comments).
fn parse_event(event: &str) -> Result<Option<StreamChunk>, UpstreamError> {
    let mut event_type = None;
    let mut data = Vec::new();

    for line in event.lines() {
        if let Some(value) = line.strip_prefix("data:") {
            data.push(value.strip_prefix(' ').unwrap_or(value));
        } else if let Some(value) = line.strip_prefix("event:") {
            event_type = Some(value.trim());
        }
    }

    let payload = data.join("\n");
    let payload = payload.trim();

    if event_type == Some("error") {
        return Err(UpstreamError::InvalidPayload(format!(
            "provider reported an error: {payload}"
        )));
    }
    if payload.is_empty() || payload == "[DONE]" {
        return Ok(None);
    }

    StreamChunk::from_payload(payload)
        .map(Some)
        .map_err(|e| UpstreamError::InvalidPayload(format!("failed to parse stream chunk: {e}")))
}

/// Decode an SSE response body into stream chunks.
///
/// A read error or a malformed event yields one `Err` and ends the stream.
/// With `idle_timeout` set, waiting longer than that for the next body
/// fragment is a [`UpstreamError::Timeout`].
pub fn decode_sse_chunks<S, E>(
    body: S,
    endpoint: String,
    idle_timeout: Option<Duration>,
) -> impl Stream<Item = Result<StreamChunk, UpstreamError>> + Send + 'static
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: Display + Send + 'static,
{
    let body = Box::pin(body);

    stream::unfold(
        (body, SseDecoder::default(), endpoint),
        move |(mut body, mut decoder, endpoint)| async move {
            loop {
                if let Some(event) = decoder.next_event() {
                    match parse_event(&event) {
                        Ok(Some(chunk)) => return Some((Ok(chunk), (body, decoder, endpoint))),
                        Ok(None) => continue,
                        Err(e) => {
                            decoder.fail();
                            return Some((Err(e), (body, decoder, endpoint)));
                        }
                    }
                }

                if decoder.done {
                    return None;
                }

                let next = match idle_timeout {
                    Some(limit) => match tokio::time::timeout(limit, body.next()).await {
                        Ok(next) => next,
                        Err(_) => {
                            decoder.fail();
                            return Some((Err(UpstreamError::Timeout(limit)), (body, decoder, endpoint)));
                        }
                    },
                    None => body.next().await,
                };

                match next {
                    Some(Ok(data)) => decoder.push(&data),
                    Some(Err(e)) => {
                        decoder.fail();
                        let err = UpstreamError::Connection {
                            endpoint: endpoint.clone(),
                            reason: format!("stream read error: {e}"),
                        };
                        return Some((Err(err), (body, decoder, endpoint)));
                    }
                    None => {
                        decoder.done = true;
                        let rest = decoder.take_rest()?;
                        match parse_event(&rest) {
                            Ok(Some(chunk)) => return Some((Ok(chunk), (body, decoder, endpoint))),
                            Ok(None) => return None,
                            Err(e) => return Some((Err(e), (body, decoder, endpoint))),
                        }
                    }
                }
            }
        },
    )
}

/// Drive `chunks` on a background task, forwarding each item in order.
///
/// The relay claims a free channel slot before it pulls the next chunk, so
/// upstream progress follows the caller: at most one chunk sits between
/// the upstream reader and the consumer. The task stops after an
/// end-of-sequence chunk, after the first error (forwarded as
/// [`StreamEvent::Fault`]), or as soon as the receiver is dropped; in
/// every case the upstream stream is dropped with it.
pub fn spawn_relay<S>(chunks: S) -> mpsc::Receiver<StreamEvent>
where
    S: Stream<Item = Result<StreamChunk, UpstreamError>> + Send + 'static,
{
    let (tx, rx) = mpsc::channel(RELAY_CAPACITY);

    tokio::spawn(async move {
        let mut chunks = Box::pin(chunks);
        let mut forwarded = 0usize;

        loop {
            let Ok(permit) = tx.reserve().await else {
                info!(forwarded, "Receiver dropped, stopping upstream stream");
                return;
            };

            let item = tokio::select! {
                _ = tx.closed() => {
                    info!(forwarded, "Receiver dropped, stopping upstream stream");
                    return;
                }
                item = chunks.next() => item,
            };

            let Some(item) = item else {
                debug!(forwarded, "Upstream stream ended");
                return;
            };

            let (event, last) = match item {
                Ok(chunk) => {
                    let eos = chunk.is_eos();
                    (StreamEvent::Chunk(chunk), eos)
                }
                Err(e) => (StreamEvent::Fault(e), true),
            };

            permit.send(event);
            forwarded += 1;

            if last {
                debug!(forwarded, "Upstream stream finished");
                return;
            }
        }
    });

    rx
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::types::EOS_STOP_REASON;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn body(parts: &[&str]) -> impl Stream<Item = Result<Bytes, std::io::Error>> + Send + 'static {
        let parts: Vec<Result<Bytes, std::io::Error>> = parts
            .iter()
            .map(|p| Ok(Bytes::from(p.to_string())))
            .collect();
        stream::iter(parts)
    }

    fn frame(text: &str, stop: &str) -> String {
        format!(
            "id: 1\nevent: message\ndata: {{\"model_id\":\"m\",\"results\":[{{\"generated_text\":\"{text}\",\"stop_reason\":\"{stop}\"}}]}}\n\n"
        )
    }

    async fn collect(
        s: impl Stream<Item = Result<StreamChunk, UpstreamError>>,
    ) -> Vec<Result<StreamChunk, UpstreamError>> {
        s.collect().await
    }

    #[tokio::test]
    async fn test_decodes_frames_in_order() {
        let raw = [
            frame("Pa", "not_finished"),
            frame("ris", "not_finished"),
            frame(".", "not_finished"),
            frame("", EOS_STOP_REASON),
        ]
        .concat();
        let items = collect(decode_sse_chunks(body(&[&raw]), "test".into(), None)).await;

        let texts: Vec<String> = items
            .iter()
            .map(|i| i.as_ref().unwrap().results[0].generated_text.clone())
            .collect();
        assert_eq!(texts, vec!["Pa", "ris", ".", ""]);
        assert!(items[3].as_ref().unwrap().is_eos());
        assert_eq!(items[0].as_ref().unwrap().extra["model_id"], "m");
    }

    #[tokio::test]
    async fn test_frames_split_across_reads() {
        let raw = frame("hello", "not_finished");
        let (a, b) = raw.split_at(17);
        let (b, c) = b.split_at(20);
        let items = collect(decode_sse_chunks(body(&[a, b, c]), "test".into(), None)).await;
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].as_ref().unwrap().results[0].generated_text, "hello");
    }

    #[tokio::test]
    async fn test_crlf_and_keepalive() {
        let raw = format!(": ping\r\n\r\n{}", frame("x", "eos_token").replace('\n', "\r\n"));
        let items = collect(decode_sse_chunks(body(&[&raw]), "test".into(), None)).await;
        assert_eq!(items.len(), 1);
        assert!(items[0].as_ref().unwrap().is_eos());
    }

    #[tokio::test]
    async fn test_trailing_event_without_blank_line() {
        let raw = "data: {\"results\":[{\"generated_text\":\"tail\"}]}";
        let items = collect(decode_sse_chunks(body(&[raw]), "test".into(), None)).await;
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].as_ref().unwrap().results[0].generated_text, "tail");
    }

    #[tokio::test]
    async fn test_malformed_payload_ends_stream() {
        let raw = format!("data: {{not json\n\n{}", frame("late", "not_finished"));
        let items = collect(decode_sse_chunks(body(&[&raw]), "test".into(), None)).await;
        assert_eq!(items.len(), 1);
        assert!(matches!(items[0], Err(UpstreamError::InvalidPayload(_))));
    }

    #[tokio::test]
    async fn test_provider_error_event() {
        let raw = "event: error\ndata: {\"errors\":[{\"code\":\"model_not_supported\"}]}\n\n";
        let items = collect(decode_sse_chunks(body(&[raw]), "test".into(), None)).await;
        assert_eq!(items.len(), 1);
        assert!(items[0].is_err());
    }

    #[tokio::test]
    async fn test_read_error_is_connection_fault() {
        let parts: Vec<Result<Bytes, std::io::Error>> = vec![
            Ok(Bytes::from(frame("a", "not_finished"))),
            Err(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset")),
            Ok(Bytes::from(frame("b", "not_finished"))),
        ];
        let items = collect(decode_sse_chunks(stream::iter(parts), "test".into(), None)).await;
        assert_eq!(items.len(), 2);
        assert!(items[0].is_ok());
        assert!(matches!(&items[1], Err(e) if e.is_connection()));
    }

    #[tokio::test]
    async fn test_idle_timeout() {
        let stalled = stream::pending::<Result<Bytes, std::io::Error>>();
        let items = collect(decode_sse_chunks(
            stalled,
            "test".into(),
            Some(Duration::from_millis(20)),
        ))
        .await;
        assert_eq!(items.len(), 1);
        assert!(matches!(items[0], Err(UpstreamError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_relay_stops_after_eos() {
        let chunks: Vec<Result<StreamChunk, UpstreamError>> = vec![
            Ok(StreamChunk::text("a", None)),
            Ok(StreamChunk::text("", Some(EOS_STOP_REASON))),
            Ok(StreamChunk::text("never", None)),
        ];
        let mut rx = spawn_relay(stream::iter(chunks));

        let mut seen = Vec::new();
        while let Some(event) = rx.recv().await {
            match event {
                StreamEvent::Chunk(c) => seen.push(c.results[0].generated_text.clone()),
                StreamEvent::Fault(e) => panic!("Unexpected fault: {e}"),
            }
        }
        assert_eq!(seen, vec!["a", ""]);
    }

    #[tokio::test]
    async fn test_relay_forwards_single_fault() {
        let chunks = stream::iter(vec![
            Ok(StreamChunk::text("a", None)),
            Err(UpstreamError::InvalidPayload("boom".into())),
            Ok(StreamChunk::text("never", None)),
        ]);
        let mut rx = spawn_relay(chunks);

        assert!(matches!(rx.recv().await, Some(StreamEvent::Chunk(_))));
        assert!(matches!(rx.recv().await, Some(StreamEvent::Fault(_))));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_relay_pulls_only_as_fast_as_the_caller_reads() {
        let pulled = Arc::new(AtomicUsize::new(0));
        let counter = pulled.clone();
        let chunks = stream::iter(0..100).map(move |i| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok::<_, UpstreamError>(StreamChunk::text(i.to_string(), None))
        });
        let mut rx = spawn_relay(chunks);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(pulled.load(Ordering::SeqCst) <= 1);

        for _ in 0..3 {
            assert!(matches!(rx.recv().await, Some(StreamEvent::Chunk(_))));
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(pulled.load(Ordering::SeqCst) <= 4);
    }

    #[tokio::test]
    async fn test_relay_stops_when_receiver_dropped() {
        let (witness_tx, mut witness_rx) = mpsc::channel::<()>(1);
        // Never yields; the relay can only exit through the closed receiver.
        let chunks = stream::pending::<Result<StreamChunk, UpstreamError>>().chain(stream::once(
            async move {
                drop(witness_tx);
                Ok(StreamChunk::text("never", None))
            },
        ));
        let rx = spawn_relay(chunks);
        drop(rx);

        // The sender inside the pending stream is dropped with the task.
        assert!(witness_rx.recv().await.is_none());
    }
}
