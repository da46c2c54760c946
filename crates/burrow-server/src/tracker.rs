//! Pending Body Tracker: per-session registry of requests waiting for
//! binary-framed bodies.
//!
//! Completion, timeout, and session close all race for the same entry;
//! removal from the map is the linearization point, so exactly one of them
//! acts for a given id.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::task::AbortHandle;

use burrow_core::frame::Frame;
use burrow_core::validate::TunnelRequest;
use burrow_core::{ErrorCode, RequestId};

use crate::session::OutboundSender;

struct PendingBody {
    request: TunnelRequest,
    frames: Vec<Frame>,
    /// Payload bytes received so far, compared against the declared length.
    received: u64,
    declared: u64,
    timer: AbortHandle,
}

/// What became of an inbound frame.
pub enum FrameOutcome {
    /// Accepted, body still incomplete.
    Buffered,
    /// No pending request carries this id.
    Unknown(RequestId),
    /// The declared byte count has arrived; the entry is removed and its
    /// timer cancelled. Frames are returned unassembled and unordered.
    Complete {
        request: TunnelRequest,
        frames: Vec<Frame>,
    },
}

pub struct PendingBodyTracker {
    entries: Arc<DashMap<RequestId, PendingBody>>,
    timeout: Duration,
    outbound: OutboundSender,
}

impl PendingBodyTracker {
    pub fn new(timeout: Duration, outbound: OutboundSender) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            timeout,
            outbound,
        }
    }

    /// Register a request whose body is still in flight and arm its
    /// deadline. If the body has not completed when the timer fires, the
    /// entry is dropped and the client is told.
    pub fn open(&self, request: TunnelRequest, declared: u64) {
        let id = request.id;
        let entries = Arc::clone(&self.entries);
        let outbound = self.outbound.clone();
        let timeout = self.timeout;

        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if entries.remove(&id).is_some() {
                tracing::debug!(request_id = %id, "request body timed out");
                outbound.error(ErrorCode::BodyTimeout, Some(id)).await;
            }
        })
        .abort_handle();

        self.entries.insert(
            id,
            PendingBody {
                request,
                frames: Vec::new(),
                received: 0,
                declared,
                timer,
            },
        );
    }

    /// Attribute a frame to its pending request. Duplicate indices still
    /// count toward the byte total here; reassembly collapses them later.
    pub fn on_frame(&self, frame: Frame) -> FrameOutcome {
        let id = frame.id;
        let complete = {
            let Some(mut entry) = self.entries.get_mut(&id) else {
                return FrameOutcome::Unknown(id);
            };
            entry.received += frame.payload.len() as u64;
            entry.frames.push(frame);
            entry.received >= entry.declared
        };
        if !complete {
            return FrameOutcome::Buffered;
        }
        match self.entries.remove(&id) {
            Some((_, body)) => {
                body.timer.abort();
                FrameOutcome::Complete {
                    request: body.request,
                    frames: body.frames,
                }
            }
            // The timeout removed the entry first; it already answered.
            None => FrameOutcome::Buffered,
        }
    }

    /// Drop every pending body and cancel its timer. No errors are sent;
    /// the session is gone.
    pub fn close(&self) {
        self.entries.retain(|_, body| {
            body.timer.abort();
            false
        });
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.len()
    }
}
