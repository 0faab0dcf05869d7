//! WebSocket signaling endpoint (`GET /ws`).
//!
//! One JSON frame per text message. The reader decodes client frames and
//! hands them to the session actor; the writer drains the session's
//! outbound channel. Closing, erroring or ending the socket is the
//! session's disconnect.

use crate::actors::{SessionCoordinator, SessionHandle, OUTBOUND_CHANNEL_CAPACITY};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use signaling_protocol::{decode_request, encode_frame, ResponsePayload, ServerFrame};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

/// Largest accepted client frame. Signaling frames are small JSON objects.
const MAX_FRAME_SIZE: usize = 64 * 1024;

/// Router serving the signaling WebSocket.
pub fn signaling_router(coordinator: Arc<SessionCoordinator>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(coordinator)
}

async fn ws_handler(
    State(coordinator): State<Arc<SessionCoordinator>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.max_message_size(MAX_FRAME_SIZE)
        .on_upgrade(move |socket| serve_socket(socket, coordinator))
}

async fn serve_socket(socket: WebSocket, coordinator: Arc<SessionCoordinator>) {
    let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_CHANNEL_CAPACITY);
    let handle = match coordinator.connect(outbound_tx) {
        Ok(handle) => handle,
        Err(e) => {
            warn!(target: "sc.signaling", error = %e, "Rejecting signaling connection");
            return;
        }
    };
    let session_id = handle.id();
    info!(target: "sc.signaling", session_id = %session_id, "Signaling connection opened");

    let (sink, stream) = socket.split();
    let writer = tokio::spawn(write_frames(sink, outbound_rx, handle.cancel_token()));

    read_frames(stream, &handle).await;

    coordinator.disconnect(session_id).await;
    if let Err(e) = writer.await {
        debug!(target: "sc.signaling", session_id = %session_id, error = %e, "Writer task failed");
    }
    info!(target: "sc.signaling", session_id = %session_id, "Signaling connection closed");
}

async fn read_frames(mut stream: SplitStream<WebSocket>, handle: &SessionHandle) {
    let cancel_token = handle.cancel_token();
    loop {
        let message = tokio::select! {
            () = cancel_token.cancelled() => break,
            message = stream.next() => message,
        };

        match message {
            Some(Ok(Message::Text(text))) => {
                if !handle_text(handle, &text).await {
                    break;
                }
            }
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                debug!(
                    target: "sc.signaling",
                    session_id = %handle.id(),
                    error = %e,
                    "WebSocket read failed"
                );
                break;
            }
        }
    }
}

/// Decode one text message and hand it to the session.
///
/// Undecodable frames are answered with an error when they carry a
/// callback id and dropped otherwise. Returns false once the session is gone.
pub async fn handle_text(handle: &SessionHandle, text: &str) -> bool {
    match decode_request(text) {
        Ok(frame) => {
            if frame.request.expects_response() && frame.id.is_none() {
                warn!(
                    target: "sc.signaling",
                    session_id = %handle.id(),
                    event = frame.request.event_name(),
                    "Protocol violation: request without callback id"
                );
                return true;
            }
            handle.dispatch(frame).await.is_ok()
        }
        Err(e) => {
            warn!(
                target: "sc.signaling",
                session_id = %handle.id(),
                error = %e,
                "Undecodable signaling frame"
            );
            match e.callback_id() {
                Some(id) => handle
                    .reply(id, ResponsePayload::error(e.to_string()))
                    .await
                    .is_ok(),
                None => true,
            }
        }
    }
}

async fn write_frames(
    mut sink: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::Receiver<ServerFrame>,
    cancel_token: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            () = cancel_token.cancelled() => break,
            frame = outbound.recv() => frame,
        };
        let Some(frame) = frame else { break };

        let text = match encode_frame(&frame) {
            Ok(text) => text,
            Err(e) => {
                warn!(target: "sc.signaling", error = %e, "Dropping unencodable frame");
                continue;
            }
        };
        if sink.send(Message::Text(text)).await.is_err() {
            break;
        }
    }
    let _ = sink.send(Message::Close(None)).await;
}
