//! Per-client WebSocket connection: handshake, read/write/state pumps,
//! rate limiting, and inbound dispatch.
//!
//! The token rides as the second subprotocol token so browser clients can
//! authenticate without custom headers.  An invalid token still gets the
//! upgrade, then an immediate policy-violation close frame, so the client
//! sees *why* instead of a bare TCP reset.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use wv_core::{validate_page_key, TokenBucket};
use wv_protocol::{
    ClientMessage, DrawResponse, KeysUpdated, LoadResponse, PageRef, PageResponse, ServerMessage,
    UndoResponse, SUBPROTOCOL,
};

use crate::auth::Claims;
use crate::hub::{ConnHandle, UserEvent, OUTBOUND_QUEUE};
use crate::service::AuthUser;
use crate::state::AppState;
use crate::store::Store as _;

/// Inbound frames above this are refused at the socket layer.
pub const MAX_FRAME_BYTES: usize = 16 * 1024;
/// Idle read deadline; refreshed by any inbound frame, pongs included.
const READ_DEADLINE: Duration = Duration::from_secs(60);
/// Ping cadence, comfortably inside the read deadline.
const PING_INTERVAL: Duration = Duration::from_secs(54);
const WRITE_DEADLINE: Duration = Duration::from_secs(10);
/// Token bucket: sustained messages per second and burst size.
const RATE_PER_SEC: u32 = 20;
const RATE_BURST: u32 = 30;

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Response {
    if !origin_allowed(&headers, &state.config.allowed_origins) {
        return StatusCode::FORBIDDEN.into_response();
    }
    let ws = ws
        .protocols([SUBPROTOCOL])
        .max_message_size(MAX_FRAME_BYTES)
        .max_frame_size(MAX_FRAME_BYTES);
    // Authenticate before replying to the upgrade; failures close right
    // after the upgrade completes.
    let claims = token_from_subprotocols(&headers).and_then(|token| state.auth.verify(&token));
    ws.on_upgrade(move |socket| handle_socket(socket, state, claims))
        .into_response()
}

fn origin_allowed(headers: &HeaderMap, allowed: &[String]) -> bool {
    let Some(origin) = headers.get(header::ORIGIN).and_then(|v| v.to_str().ok()) else {
        // Non-browser clients send no Origin.
        return true;
    };
    if allowed.is_empty() {
        return true;
    }
    allowed.iter().any(|entry| entry.eq_ignore_ascii_case(origin))
}

/// `Sec-WebSocket-Protocol: webverse-v1, <token>` — the second slot is the
/// raw bearer token.
fn token_from_subprotocols(headers: &HeaderMap) -> Option<String> {
    let value = headers
        .get(header::SEC_WEBSOCKET_PROTOCOL)
        .and_then(|v| v.to_str().ok())?;
    let mut parts = value.split(',').map(str::trim);
    if parts.next() != Some(SUBPROTOCOL) {
        return None;
    }
    let token = parts.next()?;
    if token.is_empty() {
        None
    } else {
        Some(token.to_owned())
    }
}

async fn close_with(mut socket: WebSocket, code: u16, reason: &'static str) {
    let frame = CloseFrame { code, reason: reason.into() };
    let _ = socket.send(Message::Close(Some(frame))).await;
}

async fn handle_socket(socket: WebSocket, state: AppState, claims: Option<Claims>) {
    let Some(claims) = claims else {
        close_with(socket, close_code::POLICY, "Unauthenticated").await;
        return;
    };
    let user = match state.store.get_user(claims.provider, &claims.provider_id).await {
        Ok(Some(user)) => user,
        Ok(None) => {
            close_with(socket, close_code::POLICY, "Unauthenticated").await;
            return;
        }
        Err(e) => {
            warn!(error = %e, "user lookup failed during handshake");
            close_with(socket, close_code::ERROR, "TransportError").await;
            return;
        }
    };

    let conn_id = NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed);
    let cancel = state.shutdown.child_token();
    let (out_tx, out_rx) = mpsc::channel::<Message>(OUTBOUND_QUEUE);
    let (event_tx, event_rx) = mpsc::unbounded_channel::<UserEvent>();
    let registered = state
        .hub
        .register(ConnHandle {
            id: conn_id,
            user_id: user.id.clone(),
            out: out_tx.clone(),
            events: event_tx,
            cancel: cancel.clone(),
        })
        .await;
    if !registered {
        close_with(socket, close_code::POLICY, "TooManyConnections").await;
        return;
    }
    info!(conn_id, user_id = %user.id, "client connected");

    let user_state = Arc::new(RwLock::new(AuthUser {
        id: user.id.clone(),
        provider: user.provider,
        provider_id: user.provider_id.clone(),
        key_version: user.key_version,
    }));

    let (sender, receiver) = socket.split();
    let write_task = tokio::spawn(write_pump(sender, out_rx, cancel.clone()));
    let state_task = tokio::spawn(state_pump(
        event_rx,
        Arc::clone(&user_state),
        out_tx.clone(),
        cancel.clone(),
    ));

    read_pump(receiver, &state, conn_id, &user_state, &out_tx, cancel.clone()).await;

    // Closure is idempotent: whichever pump exits first cancels the rest.
    cancel.cancel();
    state.hub.unregister(conn_id).await;
    let _ = write_task.await;
    let _ = state_task.await;
    info!(conn_id, user_id = %user.id, "client disconnected");
}

async fn write_pump(
    mut sender: SplitSink<WebSocket, Message>,
    mut out_rx: mpsc::Receiver<Message>,
    cancel: CancellationToken,
) {
    let mut ping = tokio::time::interval(PING_INTERVAL);
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ping.tick().await;

    loop {
        tokio::select! {
            message = out_rx.recv() => {
                let Some(message) = message else { break };
                match tokio::time::timeout(WRITE_DEADLINE, sender.send(message)).await {
                    Ok(Ok(())) => {}
                    _ => {
                        cancel.cancel();
                        break;
                    }
                }
            }
            _ = ping.tick() => {
                match tokio::time::timeout(WRITE_DEADLINE, sender.send(Message::Ping(Vec::new()))).await {
                    Ok(Ok(())) => {}
                    _ => {
                        cancel.cancel();
                        break;
                    }
                }
            }
            _ = cancel.cancelled() => {
                let frame = CloseFrame { code: close_code::AWAY, reason: "going away".into() };
                let _ = sender.send(Message::Close(Some(frame))).await;
                break;
            }
        }
    }
}

/// Applies user-level updates to the connection's local view, so messages
/// later on the same socket see the new key version, and pushes the
/// `keys_updated` frame to the client.
async fn state_pump(
    mut event_rx: mpsc::UnboundedReceiver<UserEvent>,
    user_state: Arc<RwLock<AuthUser>>,
    out_tx: mpsc::Sender<Message>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            event = event_rx.recv() => {
                let Some(event) = event else { break };
                match event {
                    UserEvent::KeysUpdated { key_version, keys_deleted } => {
                        user_state.write().await.key_version = key_version;
                        let frame = ServerMessage::KeysUpdated(KeysUpdated { key_version, keys_deleted });
                        if !push(&out_tx, &frame) {
                            cancel.cancel();
                            break;
                        }
                    }
                }
            }
            _ = cancel.cancelled() => break,
        }
    }
}

async fn read_pump(
    mut receiver: SplitStream<WebSocket>,
    state: &AppState,
    conn_id: u64,
    user_state: &Arc<RwLock<AuthUser>>,
    out_tx: &mpsc::Sender<Message>,
    cancel: CancellationToken,
) {
    let mut bucket = TokenBucket::new(RATE_BURST, RATE_PER_SEC);
    loop {
        let frame = tokio::select! {
            frame = tokio::time::timeout(READ_DEADLINE, receiver.next()) => frame,
            _ = cancel.cancelled() => break,
        };
        match frame {
            Err(_) => {
                debug!(conn_id, "read deadline hit");
                break;
            }
            Ok(None) => break,
            Ok(Some(Err(e))) => {
                debug!(conn_id, error = %e, "socket error");
                break;
            }
            Ok(Some(Ok(Message::Text(text)))) => {
                if !bucket.try_acquire() {
                    // Rate breaches terminate without a response.
                    warn!(conn_id, "rate limit breached");
                    break;
                }
                if !dispatch(state, conn_id, user_state, out_tx, &text).await {
                    break;
                }
            }
            Ok(Some(Ok(Message::Ping(data)))) => {
                let _ = out_tx.try_send(Message::Pong(data));
            }
            // Any inbound traffic, pongs included, refreshes the deadline
            // on the next loop turn.
            Ok(Some(Ok(Message::Pong(_)))) => {}
            Ok(Some(Ok(Message::Close(_)))) => break,
            Ok(Some(Ok(Message::Binary(_)))) => {
                warn!(conn_id, "binary frame on a text protocol");
                break;
            }
        }
    }
}

/// Handle one inbound frame; false terminates the connection.
async fn dispatch(
    state: &AppState,
    conn_id: u64,
    user_state: &Arc<RwLock<AuthUser>>,
    out_tx: &mpsc::Sender<Message>,
    text: &str,
) -> bool {
    let message: ClientMessage = match serde_json::from_str(text) {
        Ok(message) => message,
        Err(e) => {
            // Malformed JSON or an unknown type is a protocol violation,
            // not a request that can be answered.
            warn!(conn_id, error = %e, "unparseable client frame");
            return false;
        }
    };
    let user = user_state.read().await.clone();

    let response = match message {
        ClientMessage::Load(page) => {
            let result = state.service.load(&page).await;
            let PageRef { page_key, layer, layer_id } = page;
            ServerMessage::LoadResponse(match result {
                Ok(strokes) => LoadResponse {
                    success: true,
                    error: None,
                    page_key,
                    layer,
                    layer_id,
                    strokes,
                },
                Err(e) => LoadResponse {
                    success: false,
                    error: Some(e.kind().to_owned()),
                    page_key,
                    layer,
                    layer_id,
                    strokes: Vec::new(),
                },
            })
        }
        ClientMessage::Subscribe(page) => {
            let result = match validate_page_key(page.layer, &page.page_key) {
                Ok(()) => state.hub.subscribe(conn_id, page.page_key.clone()).await,
                Err(_) => Err(crate::error::ServiceError::InvalidRequest),
            };
            ServerMessage::SubscribeResponse(page_response(page, result))
        }
        ClientMessage::Unsubscribe(page) => {
            let result = match validate_page_key(page.layer, &page.page_key) {
                Ok(()) => {
                    state.hub.unsubscribe(conn_id, page.page_key.clone()).await;
                    Ok(())
                }
                Err(_) => Err(crate::error::ServiceError::InvalidRequest),
            };
            ServerMessage::UnsubscribeResponse(page_response(page, result))
        }
        ClientMessage::Draw(request) => {
            let echo = (request.page_key.clone(), request.user_stroke_id, request.layer, request.layer_id.clone());
            let result = state.service.draw(&user, request, false).await;
            ServerMessage::DrawResponse(draw_response(echo, result))
        }
        ClientMessage::Redo(request) => {
            let echo = (request.page_key.clone(), request.user_stroke_id, request.layer, request.layer_id.clone());
            let result = state.service.draw(&user, request, true).await;
            ServerMessage::RedoResponse(draw_response(echo, result))
        }
        ClientMessage::Undo(request) => {
            let echo = request.clone();
            let result = state.service.undo(&user, request).await;
            ServerMessage::UndoResponse(UndoResponse {
                success: result.is_ok(),
                error: result.err().map(|e| e.kind().to_owned()),
                page_key: echo.page_key,
                layer: echo.layer,
                layer_id: echo.layer_id,
                stroke_id: echo.stroke_id,
            })
        }
    };
    push(out_tx, &response)
}

fn page_response(page: PageRef, result: Result<(), crate::error::ServiceError>) -> PageResponse {
    PageResponse {
        success: result.is_ok(),
        error: result.err().map(|e| e.kind().to_owned()),
        page_key: page.page_key,
        layer: page.layer,
        layer_id: page.layer_id,
    }
}

fn draw_response(
    echo: (String, u32, wv_protocol::Layer, String),
    result: Result<String, crate::error::ServiceError>,
) -> DrawResponse {
    let (page_key, user_stroke_id, layer, layer_id) = echo;
    match result {
        Ok(stroke_id) => DrawResponse {
            success: true,
            error: None,
            page_key,
            user_stroke_id,
            layer,
            layer_id,
            stroke_id: Some(stroke_id),
        },
        Err(e) => DrawResponse {
            success: false,
            error: Some(e.kind().to_owned()),
            page_key,
            user_stroke_id,
            layer,
            layer_id,
            stroke_id: None,
        },
    }
}

/// Non-blocking enqueue onto the connection's outbound queue; a full
/// queue means the client cannot keep up and the connection ends.
fn push(out_tx: &mpsc::Sender<Message>, frame: &ServerMessage) -> bool {
    let json = match serde_json::to_string(frame) {
        Ok(json) => json,
        Err(e) => {
            warn!(error = %e, "unserializable server frame");
            return true;
        }
    };
    match out_tx.try_send(Message::Text(json)) {
        Ok(()) => true,
        Err(mpsc::error::TrySendError::Full(_)) => {
            warn!("outbound queue overflow");
            false
        }
        Err(mpsc::error::TrySendError::Closed(_)) => false,
    }
}
