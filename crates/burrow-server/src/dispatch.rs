//! Request Dispatch: execute one validated request against the remote
//! resource and stream the outcome back over the session.

use std::sync::Arc;

use bytes::Bytes;

use burrow_core::frame;
use burrow_core::validate::TunnelRequest;
use burrow_core::{ControlMessage, ErrorCode, ProtocolMeta};

use crate::fetch::{FetchRequest, ResourceFetcher};
use crate::session::OutboundSender;

/// Fetch the resource and answer with either a response message plus body
/// frames, or a single error message. Each dispatch owns its id; nothing
/// here touches shared state, so concurrent dispatches cannot interleave
/// incorrectly beyond frame ordering per id, which the channel preserves.
pub async fn dispatch(
    request: TunnelRequest,
    body: Option<Bytes>,
    meta: Arc<ProtocolMeta>,
    fetcher: Arc<dyn ResourceFetcher>,
    outbound: OutboundSender,
) {
    let id = request.id;
    let fetch_request = FetchRequest {
        method: request.method,
        url: request.url,
        headers: request.headers,
        body,
    };

    let response = match fetcher.fetch(fetch_request).await {
        Ok(response) => response,
        Err(e) => {
            tracing::warn!(request_id = %id, error = %e, "upstream fetch failed");
            outbound.error(ErrorCode::FetchFailed, Some(id)).await;
            return;
        }
    };

    let length = response.body.len() as u64;
    if length > meta.effective_body_cap() {
        tracing::debug!(request_id = %id, length, "response body over the cap");
        outbound.error(ErrorCode::BodyTooLarge, Some(id)).await;
        return;
    }

    tracing::debug!(request_id = %id, status = response.status, length, "dispatch complete");

    outbound
        .control(&ControlMessage::Response {
            id,
            url: response.url,
            status: response.status,
            headers: response.headers,
            body: (length > 0).then_some(length),
        })
        .await;

    if length > 0 {
        match frame::encode(id, &response.body, meta.max_packet_size) {
            Ok(frames) => {
                for frame in &frames {
                    outbound.frame(frame).await;
                }
            }
            // The cap check above keeps bodies under the frame-count limit,
            // so this only fires on an internal invariant violation.
            Err(e) => {
                tracing::warn!(request_id = %id, error = %e, "failed to frame response body");
                outbound.error(ErrorCode::BodyTooLarge, Some(id)).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::HashMap;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use axum::extract::ws::Message as WsMessage;
    use http::Method;
    use tokio::sync::mpsc;
    use url::Url;

    use burrow_core::frame::{decode, Frame};
    use burrow_core::RequestId;

    use crate::fetch::{FetchError, FetchResponse};

    const ID: &str = "0123456789abcdef0123456789abcdef";

    struct MockFetcher {
        result: Result<FetchResponse, FetchError>,
        seen: Mutex<Option<FetchRequest>>,
    }

    impl MockFetcher {
        fn responding(response: FetchResponse) -> Arc<Self> {
            Arc::new(Self {
                result: Ok(response),
                seen: Mutex::new(None),
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                result: Err(FetchError::Network("connection refused".into())),
                seen: Mutex::new(None),
            })
        }
    }

    #[async_trait]
    impl ResourceFetcher for MockFetcher {
        async fn fetch(&self, request: FetchRequest) -> Result<FetchResponse, FetchError> {
            *self.seen.lock().unwrap() = Some(request);
            self.result.clone()
        }
    }

    fn request(id: RequestId) -> TunnelRequest {
        TunnelRequest {
            id,
            method: Method::GET,
            url: Url::parse("https://example.com/data").unwrap(),
            headers: HashMap::new(),
            body: None,
        }
    }

    fn response(body: &'static [u8]) -> FetchResponse {
        FetchResponse {
            url: "https://example.com/data".to_string(),
            status: 200,
            headers: HashMap::from([("content-type".to_string(), "text/plain".to_string())]),
            body: Bytes::from_static(body),
        }
    }

    async fn drain(rx: &mut mpsc::Receiver<WsMessage>) -> Vec<WsMessage> {
        let mut messages = Vec::new();
        while let Ok(message) = rx.try_recv() {
            messages.push(message);
        }
        messages
    }

    fn as_json(message: &WsMessage) -> serde_json::Value {
        match message {
            WsMessage::Text(text) => serde_json::from_str(text.as_str()).unwrap(),
            other => panic!("expected text, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn bodyless_response_is_a_single_text_message() {
        let (tx, mut rx) = mpsc::channel(16);
        let id = RequestId::parse(ID).unwrap();
        let fetcher = MockFetcher::responding(response(b""));

        dispatch(
            request(id),
            None,
            Arc::new(ProtocolMeta::default()),
            fetcher,
            OutboundSender::new(tx),
        )
        .await;

        let messages = drain(&mut rx).await;
        assert_eq!(messages.len(), 1);
        let value = as_json(&messages[0]);
        assert_eq!(value["type"], "response");
        assert_eq!(value["id"], ID);
        assert_eq!(value["status"], 200);
        assert!(value.get("body").is_none(), "empty body must not be declared");
    }

    #[tokio::test]
    async fn response_body_follows_as_frames() {
        let (tx, mut rx) = mpsc::channel(16);
        let id = RequestId::parse(ID).unwrap();
        let fetcher = MockFetcher::responding(response(b"tunnelled payload"));

        dispatch(
            request(id),
            None,
            Arc::new(ProtocolMeta::default()),
            fetcher,
            OutboundSender::new(tx),
        )
        .await;

        let messages = drain(&mut rx).await;
        let value = as_json(&messages[0]);
        assert_eq!(value["body"], 17);

        let frames: Vec<Frame> = messages[1..]
            .iter()
            .map(|m| match m {
                WsMessage::Binary(data) => Frame::parse(data.clone()).unwrap(),
                other => panic!("expected binary, got {other:?}"),
            })
            .collect();
        assert!(!frames.is_empty());
        assert!(frames.iter().all(|f| f.id == id));
        assert_eq!(decode(&frames).unwrap(), Bytes::from_static(b"tunnelled payload"));
    }

    #[tokio::test]
    async fn oversized_response_becomes_body_too_large() {
        let (tx, mut rx) = mpsc::channel(16);
        let id = RequestId::parse(ID).unwrap();
        let fetcher = MockFetcher::responding(response(b"0123456789"));
        let meta = ProtocolMeta {
            max_body_size: 5,
            ..ProtocolMeta::default()
        };

        dispatch(request(id), None, Arc::new(meta), fetcher, OutboundSender::new(tx)).await;

        let messages = drain(&mut rx).await;
        assert_eq!(messages.len(), 1, "no response message, no frames");
        let value = as_json(&messages[0]);
        assert_eq!(value["type"], "error");
        assert_eq!(value["code"], "BODY_TOO_LARGE");
        assert_eq!(value["id"], ID);
    }

    #[tokio::test]
    async fn network_failure_becomes_fetch_failed() {
        let (tx, mut rx) = mpsc::channel(16);
        let id = RequestId::parse(ID).unwrap();

        dispatch(
            request(id),
            None,
            Arc::new(ProtocolMeta::default()),
            MockFetcher::failing(),
            OutboundSender::new(tx),
        )
        .await;

        let messages = drain(&mut rx).await;
        assert_eq!(messages.len(), 1);
        let value = as_json(&messages[0]);
        assert_eq!(value["code"], "FETCH_FAILED");
        assert_eq!(value["id"], ID);
    }

    #[tokio::test]
    async fn reassembled_body_reaches_the_fetcher() {
        let (tx, _rx) = mpsc::channel(16);
        let id = RequestId::parse(ID).unwrap();
        let fetcher = MockFetcher::responding(response(b"ok"));
        let mut req = request(id);
        req.method = Method::POST;

        dispatch(
            req,
            Some(Bytes::from_static(b"upload bytes")),
            Arc::new(ProtocolMeta::default()),
            Arc::clone(&fetcher) as Arc<dyn ResourceFetcher>,
            OutboundSender::new(tx),
        )
        .await;

        let seen = fetcher.seen.lock().unwrap().take().unwrap();
        assert_eq!(seen.method, Method::POST);
        assert_eq!(seen.body, Some(Bytes::from_static(b"upload bytes")));
    }
}
