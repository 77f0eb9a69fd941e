//! Bridging a pair end to a real network socket.
//!
//! `couple` pumps frames between a tungstenite stream and one end of a
//! [`WebSocketPair`](super::WebSocketPair): frames arriving off the wire
//! are injected as if the coupled end had sent them, and frames the
//! worker sends on the other end are written to the wire. From the moment
//! of coupling the local end counts as used in a response and can no
//! longer be accepted by the worker. Close frames map one-to-one between
//! the sides, with invalid wire close codes normalised to 1005 on the
//! local side. Cancellation closes both ends with code 1006.

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::{
    WebSocketStream,
    tungstenite::protocol::{CloseFrame, Message, frame::coding::CloseCode},
};
use tracing::debug;

use crate::{
    error::Result,
    gate::RequestContext,
    ws::{WebSocket, WsEvent, WsMessage},
};

/// Bridges `socket` to `local_end`, running until either side closes.
///
/// The local end must be neither accepted nor already coupled. With a
/// request context attached, each message arriving off the wire consumes
/// one unit of the external-subrequest budget.
pub async fn couple<S>(
    socket: WebSocketStream<S>,
    local_end: WebSocket,
    ctx: Option<RequestContext>,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    local_end.mark_coupled()?;
    let (mut sink, mut stream) = socket.split();

    loop {
        tokio::select! {
            wire = stream.next() => match wire {
                Some(Ok(Message::Text(text))) => {
                    if let Some(ctx) = &ctx {
                        ctx.count_external_subrequest()?;
                        ctx.input_gate.wait_open().await;
                    }
                    local_end.inject(WsEvent::Message(WsMessage::Text(text.to_string())));
                }
                Some(Ok(Message::Binary(data))) => {
                    if let Some(ctx) = &ctx {
                        ctx.count_external_subrequest()?;
                        ctx.input_gate.wait_open().await;
                    }
                    local_end.inject(WsEvent::Message(WsMessage::Binary(Bytes::from(data))));
                }
                Some(Ok(Message::Close(frame))) => {
                    if let Some(ctx) = &ctx {
                        ctx.input_gate.wait_open().await;
                    }
                    let (code, reason) = match frame {
                        Some(frame) => (normalise_close_code(frame.code.into()), frame.reason.to_string()),
                        None => (1005, String::new()),
                    };
                    local_end.inject(WsEvent::Close { code, reason });
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!("WebSocket bridge read failed: {e}");
                    local_end.abort(1006, "");
                    break;
                }
                None => {
                    local_end.abort(1006, "");
                    break;
                }
            },
            event = local_end.next_event() => match event? {
                Some(WsEvent::Message(WsMessage::Text(text))) => {
                    if let Some(ctx) = &ctx {
                        ctx.output_gate.wait_open().await;
                    }
                    if sink.send(Message::Text(text.into())).await.is_err() {
                        local_end.abort(1006, "");
                        break;
                    }
                }
                Some(WsEvent::Message(WsMessage::Binary(data))) => {
                    if let Some(ctx) = &ctx {
                        ctx.output_gate.wait_open().await;
                    }
                    if sink.send(Message::Binary(data)).await.is_err() {
                        local_end.abort(1006, "");
                        break;
                    }
                }
                Some(WsEvent::Close { code, reason }) => {
                    if let Some(ctx) = &ctx {
                        ctx.output_gate.wait_open().await;
                    }
                    let frame = CloseFrame {
                        code: CloseCode::from(code),
                        reason: reason.into(),
                    };
                    let _ = sink.send(Message::Close(Some(frame))).await;
                    break;
                }
                None => {
                    let _ = sink.close().await;
                    break;
                }
            },
        }
    }
    Ok(())
}

/// Wire close codes outside the user-visible valid set map to 1005.
fn normalise_close_code(code: u16) -> u16 {
    if code == 1000 || (3000..=4999).contains(&code) {
        code
    } else {
        1005
    }
}
