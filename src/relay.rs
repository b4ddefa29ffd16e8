//! Segment streaming relay.
//!
//! A spawned task owns the origin body stream and pushes [`RelayEvent`]s into
//! a bounded channel; the client response body drains that channel. The
//! bound gives backpressure (a slow client stalls origin reads instead of
//! growing a buffer), and dropping the client body cancels the task, which
//! drops the origin stream and closes the upstream connection.
//!
//! State machine: `Init -> HeadersFlushed -> Streaming -> Done`, with
//! `Errored` reachable from `Init` and `Streaming`.

use crate::error::RelayError;
use crate::metrics;
use crate::server::cors;
use crate::upstream::{OriginHeaders, SegmentResponse};
use async_trait::async_trait;
use axum::{
    body::{Body, Bytes},
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use futures_util::{StreamExt, stream};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, warn};

/// Origin response headers passed through to the client
pub const FORWARDED_HEADERS: [&str; 9] = [
    "content-type",
    "content-length",
    "accept-ranges",
    "content-range",
    "etag",
    "last-modified",
    "cache-control",
    "date",
    "server",
];

pub const FALLBACK_CONTENT_TYPE: &str = "application/octet-stream";

/// Chunks buffered between the relay task and the client body
const RELAY_CHANNEL_CAPACITY: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    Init,
    HeadersFlushed,
    Streaming,
    Done,
    Errored,
}

/// Status line and headers committed to the client exactly once
#[derive(Debug, Clone)]
pub struct RelayHead {
    pub status: StatusCode,
    pub headers: HeaderMap,
}

#[derive(Debug)]
pub enum RelayEvent {
    Head(RelayHead),
    Chunk(Bytes),
    Failed(String),
    End,
}

/// The client side of the relay has gone away
#[derive(Debug, Error)]
#[error("client sink closed")]
pub struct SinkClosed;

/// Destination for relay events
#[async_trait]
pub trait RelaySink: Send {
    async fn send(&mut self, event: RelayEvent) -> Result<(), SinkClosed>;
}

/// Sink feeding the bounded channel drained by the client response body
pub struct ChannelSink {
    tx: mpsc::Sender<RelayEvent>,
}

#[async_trait]
impl RelaySink for ChannelSink {
    async fn send(&mut self, event: RelayEvent) -> Result<(), SinkClosed> {
        self.tx.send(event).await.map_err(|_| SinkClosed)
    }
}

/// Build the client-facing head: whitelisted origin headers, a content type
/// fallback and the CORS headers.
pub fn build_head(status: StatusCode, origin: &OriginHeaders) -> RelayHead {
    let mut headers = HeaderMap::new();

    for name in FORWARDED_HEADERS {
        let Some(value) = origin.get(name) else {
            continue;
        };
        match HeaderValue::from_str(value) {
            Ok(v) => {
                headers.insert(HeaderName::from_static(name), v);
            }
            Err(_) => warn!("Dropping invalid origin header value for {}", name),
        }
    }

    if !headers.contains_key(header::CONTENT_TYPE) {
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static(FALLBACK_CONTENT_TYPE),
        );
    }
    cors::apply(&mut headers);

    RelayHead { status, headers }
}

/// Drive one origin response into `sink` until the body ends, fails, or the
/// client goes away. Returns the terminal state.
///
/// The head is flushed on the first non-empty chunk, or at end of stream if
/// the body was empty.
pub async fn relay<S>(response: SegmentResponse, sink: &mut S, cancel: &CancellationToken) -> RelayState
where
    S: RelaySink + ?Sized,
{
    let SegmentResponse {
        status,
        headers,
        mut body,
    } = response;

    let mut head = Some(build_head(status, &headers));
    let mut state = RelayState::Init;
    let mut relayed: u64 = 0;

    let final_state = loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                warn!("Client disconnected after {} bytes, aborting upstream fetch", relayed);
                metrics::record_client_disconnect();
                break RelayState::Errored;
            }
            next = body.next() => next,
        };

        match next {
            Some(Ok(chunk)) => {
                if chunk.is_empty() {
                    continue;
                }
                if let Some(head) = head.take() {
                    if sink.send(RelayEvent::Head(head)).await.is_err() {
                        metrics::record_client_disconnect();
                        break RelayState::Errored;
                    }
                    state = transition(state, RelayState::HeadersFlushed);
                }

                let len = chunk.len() as u64;
                if sink.send(RelayEvent::Chunk(chunk)).await.is_err() {
                    warn!("Client went away after {} bytes", relayed);
                    metrics::record_client_disconnect();
                    break RelayState::Errored;
                }
                relayed += len;
                if state != RelayState::Streaming {
                    state = transition(state, RelayState::Streaming);
                }
            }
            Some(Err(e)) => {
                if state == RelayState::Init {
                    warn!("Origin failed before first byte: {}", e);
                } else {
                    warn!("Origin failed mid-stream after {} bytes: {}", relayed, e);
                }
                let _ = sink.send(RelayEvent::Failed(e.to_string())).await;
                break RelayState::Errored;
            }
            None => {
                if let Some(head) = head.take() {
                    // HEAD request or genuinely empty body
                    if sink.send(RelayEvent::Head(head)).await.is_err() {
                        break RelayState::Errored;
                    }
                    state = transition(state, RelayState::HeadersFlushed);
                }
                let _ = sink.send(RelayEvent::End).await;
                break RelayState::Done;
            }
        }
    };

    metrics::record_relayed_bytes(relayed);
    debug!(
        "Segment relay {:?} -> {:?} ({} bytes)",
        state, final_state, relayed
    );
    final_state
}

fn transition(from: RelayState, to: RelayState) -> RelayState {
    debug!("Segment relay {:?} -> {:?}", from, to);
    to
}

/// Spawn the relay for `response` and turn it into the client response.
///
/// Waits for the head before answering, so a failure before the first byte
/// becomes a `502` instead of a committed, broken response.
pub async fn respond(response: SegmentResponse) -> Response {
    let (tx, mut rx) = mpsc::channel(RELAY_CHANNEL_CAPACITY);
    let cancel = CancellationToken::new();

    // Cancels the relay if this handler (or later the body) is dropped
    let guard = cancel.clone().drop_guard();

    tokio::spawn(async move {
        let mut sink = ChannelSink { tx };
        relay(response, &mut sink, &cancel).await;
    });

    match rx.recv().await {
        Some(RelayEvent::Head(head)) => {
            let mut resp = Response::new(client_body(rx, guard));
            *resp.status_mut() = head.status;
            *resp.headers_mut() = head.headers;
            resp
        }
        Some(RelayEvent::Failed(msg)) => RelayError::UpstreamUnreachable(msg).into_response(),
        _ => RelayError::UpstreamUnreachable("relay ended before response headers".to_string())
            .into_response(),
    }
}

/// Client body fed from the relay channel.
///
/// A failure after the head was committed surfaces as a body error, which
/// makes the server abort the connection: the client sees a truncated
/// transfer rather than a clean end.
fn client_body(rx: mpsc::Receiver<RelayEvent>, guard: DropGuard) -> Body {
    let chunks = stream::unfold(Some((rx, guard)), |state| async move {
        let (mut rx, guard) = state?;
        match rx.recv().await {
            Some(RelayEvent::Chunk(bytes)) => Some((Ok(bytes), Some((rx, guard)))),
            Some(RelayEvent::End) => None,
            Some(RelayEvent::Failed(msg)) => Some((Err(std::io::Error::other(msg)), None)),
            Some(RelayEvent::Head(_)) | None => Some((
                Err(std::io::Error::other("segment relay ended unexpectedly")),
                None,
            )),
        }
    });
    Body::from_stream(chunks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upstream::fetcher::BodyStream;
    use http_body_util::BodyExt;
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingSink {
        events: Vec<RelayEvent>,
        /// Refuse sends after this many accepted events
        accept_limit: Option<usize>,
    }

    #[async_trait]
    impl RelaySink for RecordingSink {
        async fn send(&mut self, event: RelayEvent) -> Result<(), SinkClosed> {
            if self.accept_limit.is_some_and(|limit| self.events.len() >= limit) {
                return Err(SinkClosed);
            }
            self.events.push(event);
            Ok(())
        }
    }

    fn origin_headers(pairs: &[(&str, &str)]) -> OriginHeaders {
        let mut map = HeaderMap::new();
        for (k, v) in pairs {
            map.append(
                HeaderName::from_bytes(k.as_bytes()).unwrap(),
                HeaderValue::from_str(v).unwrap(),
            );
        }
        OriginHeaders::from_header_map(&map)
    }

    fn body_of(items: Vec<crate::error::Result<Bytes>>) -> BodyStream {
        stream::iter(items).boxed()
    }

    fn response(status: StatusCode, headers: &[(&str, &str)], body: BodyStream) -> SegmentResponse {
        SegmentResponse {
            status,
            headers: origin_headers(headers),
            body,
        }
    }

    #[test]
    fn head_keeps_only_whitelisted_headers() {
        let head = build_head(
            StatusCode::PARTIAL_CONTENT,
            &origin_headers(&[
                ("content-type", "video/mp2t"),
                ("content-range", "bytes 0-999/5000"),
                ("set-cookie", "a=1"),
                ("x-internal", "secret"),
                ("etag", "\"abc\""),
            ]),
        );
        assert_eq!(head.status, StatusCode::PARTIAL_CONTENT);
        assert_eq!(head.headers.get("content-type").unwrap(), "video/mp2t");
        assert_eq!(head.headers.get("content-range").unwrap(), "bytes 0-999/5000");
        assert_eq!(head.headers.get("etag").unwrap(), "\"abc\"");
        assert!(head.headers.get("set-cookie").is_none());
        assert!(head.headers.get("x-internal").is_none());
        assert_eq!(head.headers.get("access-control-allow-origin").unwrap(), "*");
    }

    #[test]
    fn head_falls_back_to_octet_stream() {
        let head = build_head(StatusCode::OK, &OriginHeaders::default());
        assert_eq!(
            head.headers.get("content-type").unwrap(),
            FALLBACK_CONTENT_TYPE
        );
    }

    #[tokio::test]
    async fn chunks_forwarded_in_order_after_single_head() {
        let body = body_of(vec![
            Ok(Bytes::from_static(b"one")),
            Ok(Bytes::new()),
            Ok(Bytes::from_static(b"two")),
            Ok(Bytes::from_static(b"three")),
        ]);
        let mut sink = RecordingSink::default();
        let state = relay(
            response(StatusCode::OK, &[("content-type", "video/mp2t")], body),
            &mut sink,
            &CancellationToken::new(),
        )
        .await;

        assert_eq!(state, RelayState::Done);
        assert_eq!(sink.events.len(), 5);
        assert!(matches!(sink.events[0], RelayEvent::Head(_)));
        let chunks: Vec<&[u8]> = sink
            .events
            .iter()
            .filter_map(|e| match e {
                RelayEvent::Chunk(b) => Some(&b[..]),
                _ => None,
            })
            .collect();
        assert_eq!(chunks, vec![&b"one"[..], &b"two"[..], &b"three"[..]]);
        assert!(matches!(sink.events[4], RelayEvent::End));
    }

    #[tokio::test]
    async fn empty_body_flushes_head_at_end() {
        let mut sink = RecordingSink::default();
        let state = relay(
            response(StatusCode::OK, &[("content-length", "1234")], body_of(vec![])),
            &mut sink,
            &CancellationToken::new(),
        )
        .await;

        assert_eq!(state, RelayState::Done);
        assert_eq!(sink.events.len(), 2);
        match &sink.events[0] {
            RelayEvent::Head(head) => {
                assert_eq!(head.headers.get("content-length").unwrap(), "1234");
                assert_eq!(
                    head.headers.get("content-type").unwrap(),
                    FALLBACK_CONTENT_TYPE
                );
            }
            other => panic!("expected head, got {other:?}"),
        }
        assert!(matches!(sink.events[1], RelayEvent::End));
    }

    #[tokio::test]
    async fn failure_before_first_byte_sends_no_head() {
        let body = body_of(vec![Err(RelayError::UpstreamUnreachable("reset".into()))]);
        let mut sink = RecordingSink::default();
        let state = relay(
            response(StatusCode::OK, &[], body),
            &mut sink,
            &CancellationToken::new(),
        )
        .await;

        assert_eq!(state, RelayState::Errored);
        assert_eq!(sink.events.len(), 1);
        assert!(matches!(sink.events[0], RelayEvent::Failed(_)));
    }

    #[tokio::test]
    async fn failure_mid_stream_after_head() {
        let body = body_of(vec![
            Ok(Bytes::from_static(b"partial")),
            Err(RelayError::UpstreamUnreachable("timeout".into())),
        ]);
        let mut sink = RecordingSink::default();
        let state = relay(
            response(StatusCode::OK, &[], body),
            &mut sink,
            &CancellationToken::new(),
        )
        .await;

        assert_eq!(state, RelayState::Errored);
        assert!(matches!(sink.events[0], RelayEvent::Head(_)));
        assert!(matches!(sink.events[1], RelayEvent::Chunk(_)));
        assert!(matches!(sink.events[2], RelayEvent::Failed(_)));
    }

    #[tokio::test]
    async fn closed_sink_stops_relay() {
        let body = body_of(vec![
            Ok(Bytes::from_static(b"a")),
            Ok(Bytes::from_static(b"b")),
            Ok(Bytes::from_static(b"c")),
        ]);
        let mut sink = RecordingSink {
            accept_limit: Some(2),
            ..Default::default()
        };
        let state = relay(
            response(StatusCode::OK, &[], body),
            &mut sink,
            &CancellationToken::new(),
        )
        .await;

        assert_eq!(state, RelayState::Errored);
        assert_eq!(sink.events.len(), 2);
    }

    #[tokio::test]
    async fn cancellation_aborts_stalled_origin() {
        let body: BodyStream = stream::pending().boxed();
        let cancel = CancellationToken::new();
        let mut sink = RecordingSink::default();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let state = tokio::time::timeout(
            Duration::from_secs(2),
            relay(response(StatusCode::OK, &[], body), &mut sink, &cancel),
        )
        .await
        .expect("relay should stop once cancelled");

        assert_eq!(state, RelayState::Errored);
        assert!(sink.events.is_empty());
    }

    #[tokio::test]
    async fn dropping_client_body_drops_origin_stream() {
        let (dropped_tx, dropped_rx) = tokio::sync::oneshot::channel::<()>();
        let body: BodyStream = stream::iter(vec![Ok(Bytes::from_static(b"first"))])
            .chain(stream::pending())
            .map(move |item| {
                // Held by the stream; released only when the stream is dropped
                let _alive = &dropped_tx;
                item
            })
            .boxed();

        let resp = respond(response(StatusCode::OK, &[], body)).await;
        assert_eq!(resp.status(), StatusCode::OK);

        let mut client = resp.into_body();
        let frame = client.frame().await.unwrap().unwrap();
        assert_eq!(frame.into_data().unwrap(), Bytes::from_static(b"first"));

        drop(client);

        tokio::time::timeout(Duration::from_secs(2), dropped_rx)
            .await
            .expect("origin stream should be dropped after the client goes away")
            .unwrap_err();
    }

    #[tokio::test]
    async fn respond_streams_partial_content() {
        let body = body_of(vec![
            Ok(Bytes::from_static(b"0123")),
            Ok(Bytes::from_static(b"4567")),
        ]);
        let resp = respond(response(
            StatusCode::PARTIAL_CONTENT,
            &[("content-range", "bytes 0-7/100"), ("content-type", "video/mp2t")],
            body,
        ))
        .await;

        assert_eq!(resp.status(), StatusCode::PARTIAL_CONTENT);
        assert_eq!(resp.headers().get("content-range").unwrap(), "bytes 0-7/100");
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&bytes[..], b"01234567");
    }

    #[tokio::test]
    async fn respond_maps_early_failure_to_bad_gateway() {
        let body = body_of(vec![Err(RelayError::UpstreamUnreachable("tls".into()))]);
        let resp = respond(response(StatusCode::OK, &[], body)).await;

        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(resp.headers().get("access-control-allow-origin").unwrap(), "*");
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        assert!(String::from_utf8_lossy(&bytes).contains("tls"));
    }

    #[tokio::test]
    async fn respond_surfaces_mid_stream_failure_as_body_error() {
        let body = body_of(vec![
            Ok(Bytes::from_static(b"abc")),
            Err(RelayError::UpstreamUnreachable("reset".into())),
        ]);
        let resp = respond(response(StatusCode::OK, &[], body)).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(resp.into_body().collect().await.is_err());
    }
}
