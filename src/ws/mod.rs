//! In-process WebSocket pairs.
//!
//! A pair yields two ends bound such that every frame sent on one is
//! dispatched as a message event on the other. Frames sent while the
//! receiving end has not yet accepted are buffered there and drained in
//! order on accept. Close codes are validated (1000 or 3000..=4999; 1005
//! is reserved), a reason requires a code, and closing twice is an error.
//! A close transitions the initiator to `CLOSING` and both ends to
//! `CLOSED` once the peer observes the close event.
//!
//! When a request context is attached, receiving waits for the input gate
//! and sending or closing waits for the output gate, so socket traffic
//! observes durable-object writes in commit order.
//!
//! # Examples
//!
//! ```rust
//! use kumo::ws::{WebSocketPair, WsEvent, WsMessage};
//!
//! # async fn example() -> kumo::error::Result<()> {
//! let (a, b) = WebSocketPair::new();
//! a.accept()?;
//! a.send(WsMessage::Text("hi".into())).await?;
//! b.accept()?;
//! match b.next_event().await? {
//!     Some(WsEvent::Message(WsMessage::Text(text))) => assert_eq!(text, "hi"),
//!     other => panic!("unexpected event: {other:?}"),
//! }
//! # Ok(())
//! # }
//! ```

use std::collections::VecDeque;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::{
    error::{KumoError, Result},
    gate::RequestContext,
};

pub mod couple;

pub use couple::couple;

/// Ready-state constants mirrored on both ends.
pub const CONNECTING: u8 = 0;
pub const OPEN: u8 = 1;
pub const CLOSING: u8 = 2;
pub const CLOSED: u8 = 3;

/// A frame crossing the pair.
#[derive(Debug, Clone, PartialEq)]
pub enum WsMessage {
    Text(String),
    Binary(Bytes),
}

/// An event observed on one end.
#[derive(Debug, Clone, PartialEq)]
pub enum WsEvent {
    Message(WsMessage),
    Close { code: u16, reason: String },
}

#[derive(Default)]
struct EndState {
    ready_state: u8,
    accepted: bool,
    coupled: bool,
    sent_close: bool,
    /// Events awaiting this end's accept.
    buffered: VecDeque<WsEvent>,
    /// Deliverable events after accept.
    inbox: VecDeque<WsEvent>,
    context: Option<RequestContext>,
}

struct PairInner {
    ends: [Mutex<EndState>; 2],
    notifies: [Notify; 2],
}

/// One end of an in-process WebSocket pair.
#[derive(Clone)]
pub struct WebSocket {
    pair: Arc<PairInner>,
    index: usize,
}

/// Factory for bound end pairs.
pub struct WebSocketPair;

impl WebSocketPair {
    /// Creates a bound pair; both ends start open and unaccepted.
    #[allow(clippy::new_ret_no_self)]
    pub fn new() -> (WebSocket, WebSocket) {
        let make_end = || {
            Mutex::new(EndState {
                ready_state: OPEN,
                ..Default::default()
            })
        };
        let inner = Arc::new(PairInner {
            ends: [make_end(), make_end()],
            notifies: [Notify::new(), Notify::new()],
        });
        (
            WebSocket {
                pair: inner.clone(),
                index: 0,
            },
            WebSocket {
                pair: inner,
                index: 1,
            },
        )
    }
}

impl WebSocket {
    fn peer_index(&self) -> usize {
        self.index ^ 1
    }

    fn state(&self) -> &Mutex<EndState> {
        &self.pair.ends[self.index]
    }

    fn peer_state(&self) -> &Mutex<EndState> {
        &self.pair.ends[self.peer_index()]
    }

    /// Current ready state of this end.
    pub fn ready_state(&self) -> u8 {
        self.state().lock().ready_state
    }

    /// Whether this end has been accepted.
    pub fn is_accepted(&self) -> bool {
        self.state().lock().accepted
    }

    /// Attaches a request context whose gates guard traffic on this end.
    pub fn set_context(&self, ctx: RequestContext) {
        self.state().lock().context = Some(ctx);
    }

    /// Accepts this end, draining any frames buffered before the accept.
    /// A coupled end has been used in a response and cannot be accepted.
    pub fn accept(&self) -> Result<()> {
        let mut state = self.state().lock();
        if state.coupled {
            return Err(KumoError::type_error(
                "Can't accept() WebSocket that was already used in a response",
            ));
        }
        if state.accepted {
            return Ok(());
        }
        state.accepted = true;
        let buffered = std::mem::take(&mut state.buffered);
        state.inbox.extend(buffered);
        drop(state);
        self.pair.notifies[self.index].notify_waiters();
        Ok(())
    }

    /// Sends a frame to the peer, buffering when the peer has not
    /// accepted yet. Waits for the output gate when a context is
    /// attached.
    pub async fn send(&self, message: WsMessage) -> Result<()> {
        let ctx = {
            let state = self.state().lock();
            if state.coupled {
                return Err(KumoError::type_error(
                    "Can't call send() on a WebSocket that was used in a response",
                ));
            }
            if state.ready_state >= CLOSING {
                return Err(KumoError::type_error(
                    "Can't call WebSocket send() after close()",
                ));
            }
            state.context.clone()
        };
        if let Some(ctx) = ctx {
            ctx.output_gate.wait_open().await;
        }
        self.deliver_to_peer(WsEvent::Message(message));
        Ok(())
    }

    /// Closes this end. Valid codes are 1000 and 3000..=4999; 1005 is
    /// reserved; a reason requires a code; closing twice is an error.
    pub async fn close(&self, code: Option<u16>, reason: Option<String>) -> Result<()> {
        let ctx = {
            let state = self.state().lock();
            if state.coupled {
                return Err(KumoError::type_error(
                    "Can't call close() on a WebSocket that was used in a response",
                ));
            }
            state.context.clone()
        };
        if reason.is_some() && code.is_none() {
            return Err(KumoError::type_error(
                "If you specify a reason, you must also specify a code",
            ));
        }
        if let Some(code) = code {
            let valid = code == 1000 || (3000..=4999).contains(&code);
            if !valid {
                return Err(KumoError::type_error(format!(
                    "The close code must be either 1000 or in the range of 3000 to 4999. Received: {code}"
                )));
            }
        }
        if let Some(ctx) = ctx {
            ctx.output_gate.wait_open().await;
        }

        {
            let mut state = self.state().lock();
            if state.sent_close || state.ready_state >= CLOSING {
                return Err(KumoError::type_error("WebSocket already closed"));
            }
            state.sent_close = true;
            state.ready_state = CLOSING;
        }
        self.deliver_to_peer(WsEvent::Close {
            code: code.unwrap_or(1005),
            reason: reason.unwrap_or_default(),
        });
        Ok(())
    }

    /// Receives the next event on this accepted end, waiting for the
    /// input gate when a context is attached. Returns `None` once the end
    /// is closed and drained.
    pub async fn next_event(&self) -> Result<Option<WsEvent>> {
        {
            let state = self.state().lock();
            if !state.accepted && !state.coupled {
                return Err(KumoError::programming(
                    "You must call accept() on this WebSocket before receiving messages",
                ));
            }
        }
        loop {
            let ctx = self.state().lock().context.clone();
            if let Some(ctx) = ctx {
                ctx.input_gate.wait_open().await;
            }

            let notified = self.pair.notifies[self.index].notified();
            {
                let mut state = self.state().lock();
                if let Some(event) = state.inbox.pop_front() {
                    if let WsEvent::Close { .. } = &event {
                        state.ready_state = CLOSED;
                        drop(state);
                        self.peer_state().lock().ready_state = CLOSED;
                        self.pair.notifies[self.peer_index()].notify_waiters();
                    }
                    return Ok(Some(event));
                }
                if state.ready_state == CLOSED {
                    return Ok(None);
                }
            }
            notified.await;
        }
    }

    fn deliver_to_peer(&self, event: WsEvent) {
        let mut peer = self.peer_state().lock();
        if peer.accepted || peer.coupled {
            peer.inbox.push_back(event);
        } else {
            peer.buffered.push_back(event);
        }
        drop(peer);
        self.pair.notifies[self.peer_index()].notify_waiters();
    }

    /// Marks this end as coupled to a network socket. Fails when the end
    /// was already accepted or coupled.
    pub(crate) fn mark_coupled(&self) -> Result<()> {
        let mut state = self.state().lock();
        if state.accepted {
            return Err(KumoError::programming(
                "Can't return a WebSocket that was already accepted in a response",
            ));
        }
        if state.coupled {
            return Err(KumoError::programming(
                "Can't return a WebSocket in a response twice",
            ));
        }
        state.coupled = true;
        // Coupled ends receive through the bridge, so buffered frames
        // become deliverable.
        let buffered = std::mem::take(&mut state.buffered);
        state.inbox.extend(buffered);
        drop(state);
        self.pair.notifies[self.index].notify_waiters();
        Ok(())
    }

    /// Injects a frame as if this end had sent it, bypassing the coupled
    /// restriction. Used by the bridge for frames arriving off the wire.
    pub(crate) fn inject(&self, event: WsEvent) {
        if let WsEvent::Close { .. } = &event {
            self.state().lock().ready_state = CLOSING;
        }
        self.deliver_to_peer(event);
    }

    /// Forcibly closes both ends with the given code, used on
    /// cancellation. Never fails.
    pub(crate) fn abort(&self, code: u16, reason: &str) {
        {
            let mut state = self.state().lock();
            if state.ready_state == CLOSED {
                return;
            }
            state.ready_state = CLOSED;
        }
        {
            let mut peer = self.peer_state().lock();
            if peer.ready_state != CLOSED {
                peer.ready_state = CLOSED;
                peer.inbox.push_back(WsEvent::Close {
                    code,
                    reason: reason.to_string(),
                });
            }
        }
        self.pair.notifies[0].notify_waiters();
        self.pair.notifies[1].notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frames_cross_the_pair_in_order() {
        let (a, b) = WebSocketPair::new();
        a.accept().unwrap();
        b.accept().unwrap();

        a.send(WsMessage::Text("one".into())).await.unwrap();
        a.send(WsMessage::Binary(Bytes::from_static(&[2]))).await.unwrap();

        assert_eq!(
            b.next_event().await.unwrap(),
            Some(WsEvent::Message(WsMessage::Text("one".into())))
        );
        assert_eq!(
            b.next_event().await.unwrap(),
            Some(WsEvent::Message(WsMessage::Binary(Bytes::from_static(&[2]))))
        );
    }

    #[tokio::test]
    async fn frames_buffer_until_accept() {
        let (a, b) = WebSocketPair::new();
        a.accept().unwrap();
        a.send(WsMessage::Text("hi".into())).await.unwrap();
        b.send(WsMessage::Text("yo".into())).await.unwrap();
        b.accept().unwrap();

        // After accept, each side observes the other's frames in order.
        assert_eq!(
            a.next_event().await.unwrap(),
            Some(WsEvent::Message(WsMessage::Text("yo".into())))
        );
        assert_eq!(
            b.next_event().await.unwrap(),
            Some(WsEvent::Message(WsMessage::Text("hi".into())))
        );
    }

    #[tokio::test]
    async fn close_code_validation() {
        let (a, _b) = WebSocketPair::new();
        a.accept().unwrap();

        let err = a.close(None, Some("bye".into())).await.unwrap_err();
        assert!(err.message().contains("must also specify a code"));

        for code in [999, 1005, 2999, 5000] {
            let err = a.close(Some(code), None).await.unwrap_err();
            assert!(err.message().contains("close code"), "code {code}");
        }

        a.close(Some(4000), Some("done".into())).await.unwrap();
        let err = a.close(Some(1000), None).await.unwrap_err();
        assert!(err.message().contains("already closed"));
    }

    #[tokio::test]
    async fn close_transitions_ready_states() {
        let (a, b) = WebSocketPair::new();
        a.accept().unwrap();
        b.accept().unwrap();
        assert_eq!(a.ready_state(), OPEN);

        a.close(Some(1000), None).await.unwrap();
        assert_eq!(a.ready_state(), CLOSING);

        assert_eq!(
            b.next_event().await.unwrap(),
            Some(WsEvent::Close {
                code: 1000,
                reason: String::new()
            })
        );
        assert_eq!(a.ready_state(), CLOSED);
        assert_eq!(b.ready_state(), CLOSED);
        assert_eq!(b.next_event().await.unwrap(), None);
    }

    #[tokio::test]
    async fn send_after_close_fails() {
        let (a, b) = WebSocketPair::new();
        a.accept().unwrap();
        b.accept().unwrap();
        a.close(Some(1000), None).await.unwrap();
        let err = a.send(WsMessage::Text("late".into())).await.unwrap_err();
        assert!(err.message().contains("after close()"));
    }

    #[tokio::test]
    async fn coupled_end_rejects_worker_operations() {
        let (a, _b) = WebSocketPair::new();
        a.mark_coupled().unwrap();
        assert!(a.accept().is_err());
        assert!(a.send(WsMessage::Text("x".into())).await.is_err());
        assert!(a.close(Some(1000), None).await.is_err());
        // Coupling twice is also an error.
        assert!(a.mark_coupled().is_err());
    }

    #[tokio::test]
    async fn accepted_end_cannot_be_coupled() {
        let (a, _b) = WebSocketPair::new();
        a.accept().unwrap();
        assert!(a.mark_coupled().is_err());
    }

    #[tokio::test]
    async fn input_gate_defers_delivery() {
        let (a, b) = WebSocketPair::new();
        a.accept().unwrap();
        b.accept().unwrap();
        let ctx = RequestContext::default();
        b.set_context(ctx.clone());

        let lock = ctx.input_gate.lock();
        a.send(WsMessage::Text("gated".into())).await.unwrap();

        let receiver = tokio::spawn(async move { b.next_event().await });
        tokio::task::yield_now().await;
        assert!(!receiver.is_finished());

        drop(lock);
        let event = tokio::time::timeout(std::time::Duration::from_secs(1), receiver)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(event, Some(WsEvent::Message(WsMessage::Text("gated".into()))));
    }
}
