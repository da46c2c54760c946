//! Connection Session: lifecycle and routing for one live protocol session.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use uuid::Uuid;

use burrow_core::frame::{decode, Frame, FrameError};
use burrow_core::{validate_request, ControlMessage, ErrorCode, ProtocolMeta};

use crate::dispatch;
use crate::fetch::ResourceFetcher;
use crate::server::AppState;
use crate::tracker::{FrameOutcome, PendingBodyTracker};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Unique per-connection identifier, used in tracing fields only.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub String);

impl ConnectionId {
    pub fn new() -> Self {
        Self(format!("conn_{}", Uuid::now_v7()))
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Handle on the session's outbound queue. Clones share one bounded
/// channel; serialization happens here so callers deal in protocol types.
#[derive(Clone)]
pub struct OutboundSender {
    tx: mpsc::Sender<WsMessage>,
}

impl OutboundSender {
    pub fn new(tx: mpsc::Sender<WsMessage>) -> Self {
        Self { tx }
    }

    pub async fn control(&self, message: &ControlMessage) {
        match serde_json::to_string(message) {
            Ok(json) => {
                if self.tx.send(WsMessage::Text(json.into())).await.is_err() {
                    tracing::debug!("outbound channel closed, dropping control message");
                }
            }
            Err(e) => tracing::warn!(error = %e, "failed to serialize control message"),
        }
    }

    pub async fn error(&self, code: ErrorCode, id: Option<burrow_core::RequestId>) {
        self.control(&ControlMessage::error(code, id)).await;
    }

    pub async fn frame(&self, frame: &Frame) {
        if self
            .tx
            .send(WsMessage::Binary(frame.to_bytes()))
            .await
            .is_err()
        {
            tracing::debug!("outbound channel closed, dropping frame");
        }
    }
}

/// In-flight dispatch tasks for one session. Finished tasks are reaped on
/// every spawn; a `JoinSet` holds finished entries until joined, so without
/// this the set would grow by one per request for the session's lifetime.
struct DispatchSet {
    tasks: JoinSet<()>,
}

impl DispatchSet {
    fn new() -> Self {
        Self {
            tasks: JoinSet::new(),
        }
    }

    fn spawn<F>(&mut self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        while self.tasks.try_join_next().is_some() {}
        self.tasks.spawn(task);
    }

    async fn shutdown(&mut self) {
        self.tasks.shutdown().await;
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.tasks.len()
    }
}

/// Drive one accepted WebSocket until the client goes away.
///
/// Inbound frames are observed in transport order, but dispatches run in a
/// `JoinSet` so a slow fetch never blocks the next inbound message.
pub async fn run(socket: WebSocket, version: u16, state: AppState) {
    let conn_id = ConnectionId::new();
    tracing::info!(conn_id = %conn_id, version, "session opened");

    let (ws_tx, mut ws_rx) = socket.split();
    let (tx, rx) = mpsc::channel::<WsMessage>(state.max_send_queue);
    let outbound = OutboundSender::new(tx);

    let writer = tokio::spawn(write_loop(ws_tx, rx, conn_id.clone()));

    let tracker = PendingBodyTracker::new(state.meta.request_timeout(), outbound.clone());
    let mut dispatches = DispatchSet::new();

    while let Some(Ok(message)) = ws_rx.next().await {
        match message {
            WsMessage::Text(text) => {
                handle_text(
                    text.as_str(),
                    &conn_id,
                    &state.meta,
                    &state.fetcher,
                    &tracker,
                    &outbound,
                    &mut dispatches,
                )
                .await;
            }
            WsMessage::Binary(data) => {
                handle_binary(
                    data,
                    &conn_id,
                    &state.meta,
                    &state.fetcher,
                    &tracker,
                    &outbound,
                    &mut dispatches,
                )
                .await;
            }
            WsMessage::Close(_) => break,
            // axum answers pings itself; pongs need no bookkeeping here
            WsMessage::Ping(_) | WsMessage::Pong(_) => {}
        }
    }

    // Closed state: cancel timers, abandon in-flight fetches, stop writing.
    tracker.close();
    dispatches.shutdown().await;
    writer.abort();

    tracing::info!(conn_id = %conn_id, "session closed");
}

/// Text frame: validate, then either dispatch immediately or start
/// collecting the declared body. A declared length of zero means no body,
/// matching the wire's absent-field semantics.
async fn handle_text(
    raw: &str,
    conn_id: &ConnectionId,
    meta: &Arc<ProtocolMeta>,
    fetcher: &Arc<dyn ResourceFetcher>,
    tracker: &PendingBodyTracker,
    outbound: &OutboundSender,
    dispatches: &mut DispatchSet,
) {
    match validate_request(raw, meta) {
        Ok(request) => match request.body {
            Some(declared) if declared > 0 => {
                tracing::debug!(conn_id = %conn_id, request_id = %request.id, declared, "collecting request body");
                tracker.open(request, declared);
            }
            _ => {
                dispatches.spawn(dispatch::dispatch(
                    request,
                    None,
                    Arc::clone(meta),
                    Arc::clone(fetcher),
                    outbound.clone(),
                ));
            }
        },
        Err(rejection) => {
            tracing::debug!(conn_id = %conn_id, code = %rejection.code, "rejected control message");
            outbound.error(rejection.code, rejection.id).await;
        }
    }
}

/// Binary frame: bounds-checked header decode, then route to the pending
/// body it belongs to. Frames for unknown ids are answered, not fatal.
async fn handle_binary(
    data: Bytes,
    conn_id: &ConnectionId,
    meta: &Arc<ProtocolMeta>,
    fetcher: &Arc<dyn ResourceFetcher>,
    tracker: &PendingBodyTracker,
    outbound: &OutboundSender,
    dispatches: &mut DispatchSet,
) {
    let frame = match Frame::parse(data) {
        Ok(frame) => frame,
        Err(e) => {
            tracing::debug!(conn_id = %conn_id, error = %e, "unparseable binary frame");
            outbound.error(ErrorCode::InvalidFormat, None).await;
            return;
        }
    };

    match tracker.on_frame(frame) {
        FrameOutcome::Buffered => {}
        FrameOutcome::Unknown(id) => {
            outbound.error(ErrorCode::RequestNotFound, Some(id)).await;
        }
        FrameOutcome::Complete { request, frames } => match decode(&frames) {
            // Overshooting or duplicating frames can satisfy the byte count
            // while reassembling to the wrong length; never forward such a
            // body upstream.
            Ok(body) if body.len() as u64 != request.body.unwrap_or(0) => {
                tracing::debug!(
                    conn_id = %conn_id,
                    request_id = %request.id,
                    reassembled = body.len(),
                    "reassembled body does not match the declared length"
                );
                outbound
                    .error(ErrorCode::InvalidFormat, Some(request.id))
                    .await;
            }
            Ok(body) => {
                dispatches.spawn(dispatch::dispatch(
                    request,
                    Some(body),
                    Arc::clone(meta),
                    Arc::clone(fetcher),
                    outbound.clone(),
                ));
            }
            Err(e) => {
                // Only reachable on an internal invariant violation; recover
                // by dropping the partial state and reporting the id.
                let index = match e {
                    FrameError::MissingPacket(i) => i,
                    _ => 0,
                };
                tracing::warn!(conn_id = %conn_id, request_id = %request.id, index, "reassembly failed");
                outbound
                    .error(ErrorCode::MissingPacket, Some(request.id))
                    .await;
            }
        },
    }
}

/// Writer half: drain the outbound queue onto the socket and keep the
/// connection warm with periodic pings.
async fn write_loop(
    mut ws_tx: futures::stream::SplitSink<WebSocket, WsMessage>,
    mut rx: mpsc::Receiver<WsMessage>,
    conn_id: ConnectionId,
) {
    let mut ping_interval = tokio::time::interval(HEARTBEAT_INTERVAL);
    ping_interval.tick().await; // consume the immediate first tick

    loop {
        tokio::select! {
            message = rx.recv() => {
                match message {
                    Some(message) => {
                        if ws_tx.send(message).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            _ = ping_interval.tick() => {
                if ws_tx.send(WsMessage::Ping(vec![].into())).await.is_err() {
                    break;
                }
                tracing::trace!(conn_id = %conn_id, "sent ping");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_ids_are_unique_and_prefixed() {
        let a = ConnectionId::new();
        let b = ConnectionId::new();
        assert_ne!(a, b);
        assert!(a.0.starts_with("conn_"));
    }

    #[tokio::test]
    async fn finished_dispatches_are_reaped_on_spawn() {
        let mut dispatches = DispatchSet::new();
        let (tx, mut rx) = mpsc::channel::<()>(64);
        for _ in 0..32 {
            let tx = tx.clone();
            dispatches.spawn(async move {
                let _ = tx.send(()).await;
            });
        }
        for _ in 0..32 {
            rx.recv().await.unwrap();
        }
        // All tasks have sent; give the runtime a moment to retire them.
        tokio::time::sleep(Duration::from_millis(50)).await;

        dispatches.spawn(async {});
        assert!(
            dispatches.len() <= 2,
            "finished tasks must not accumulate, len = {}",
            dispatches.len()
        );
    }

    #[tokio::test]
    async fn outbound_sender_serializes_control_messages() {
        let (tx, mut rx) = mpsc::channel(8);
        let outbound = OutboundSender::new(tx);

        outbound.error(ErrorCode::InvalidMethod, None).await;

        match rx.recv().await.unwrap() {
            WsMessage::Text(text) => {
                let value: serde_json::Value = serde_json::from_str(text.as_str()).unwrap();
                assert_eq!(value["type"], "error");
                assert_eq!(value["code"], "INVALID_METHOD");
            }
            other => panic!("expected text, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn outbound_sender_emits_wire_frames() {
        let (tx, mut rx) = mpsc::channel(8);
        let outbound = OutboundSender::new(tx);

        let id = burrow_core::RequestId::parse("0123456789abcdef0123456789abcdef").unwrap();
        let frame = Frame {
            id,
            index: 3,
            payload: Bytes::from_static(b"chunk"),
        };
        outbound.frame(&frame).await;

        match rx.recv().await.unwrap() {
            WsMessage::Binary(data) => {
                assert_eq!(&data[..16], id.as_bytes());
                assert_eq!(&data[16..18], &[0, 3]);
                assert_eq!(&data[18..], b"chunk");
            }
            other => panic!("expected binary, got {other:?}"),
        }
    }
}
