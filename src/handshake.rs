//! Token handshake over one WebSocket connection
//!
//! Single responsibility: open one transport connection, exchange the
//! session token for exactly one init payload, and hand back a ready
//! socket. No reconnection here; the socket dies on disconnect and the
//! engine decides what happens next.
//!
//! One attempt runs `Opening -> AwaitingInit -> {Ready | Failed |
//! BanSignaled}`. A BAN close code is honored even before the handshake
//! completes: the ban record is persisted and surfaced as
//! [`SessionError::Banned`] so the caller never retries into a ban.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use tokio::sync::Mutex;
use tokio_tungstenite::{
    connect_async,
    tungstenite::protocol::{frame::coding::CloseCode, CloseFrame, Message},
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, info, warn};

use crate::close_code::{
    build_reason, CloseInfo, CLOSED_NO_STATUS, CLOSE_ABNORMAL, STATEFULL_BAN, STATEFULL_ERROR,
    STATEFULL_KICK, STATEFULL_NORMAL_CLOSE, STATEFULL_PROTOCOL_PROBLEM,
};
use crate::error::{Result, SessionError};
use crate::store::SessionStorage;
use crate::types::{now_millis, BanRecord, SessionSettings};

/// Type alias for the WebSocket send half
pub type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>, Message>;

/// Type alias for the WebSocket receive half
pub type WsStream = SplitStream<WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>>;

/// The handshake's init payload: a JSON object.
pub type JsonObject = serde_json::Map<String, serde_json::Value>;

type Ws = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// The send half of a session socket that completed its handshake.
///
/// Cloneable so the engine can close it from outside the event loop;
/// closing is idempotent.
#[derive(Clone)]
pub struct HandshakeSocket {
    sink: Arc<Mutex<Option<WsSink>>>,
}

/// What the socket produced after the handshake completed.
#[derive(Debug)]
pub enum SocketEvent {
    /// A text frame for the session layer
    Message(String),
    /// Terminal: the socket closed
    Closed(CloseInfo),
}

/// The receive half of a ready socket, consumed until closure.
pub struct SocketEvents {
    stream: WsStream,
    sink: Arc<Mutex<Option<WsSink>>>,
}

impl HandshakeSocket {
    /// Perform one handshake attempt against a node.
    ///
    /// Sends `jwtRequestPrefix + sessionToken` as the first frame, then
    /// waits up to `init_timeout` for the init message. On success the
    /// socket is ready and the parsed init object is returned together
    /// with the event stream.
    ///
    /// # Errors
    /// - `Transport` - connect or send failed
    /// - `HandshakeTimeout` - no message within `init_timeout` (the socket
    ///   is closed locally with `STATEFULL_PROTOCOL_PROBLEM`)
    /// - `ProtocolViolation` - wrong prefix, binary frame, or a payload
    ///   that is not a JSON object
    /// - `Banned` - the server closed with the BAN code before ready; the
    ///   ban record has been persisted and the caller must not retry
    /// - `ConnectionClosed` - closed before ready with any other code
    pub async fn connect(
        node_url: &str,
        settings: &SessionSettings,
        storage: &SessionStorage,
        init_timeout: Duration,
    ) -> Result<(HandshakeSocket, SocketEvents, JsonObject)> {
        info!(node_url = %node_url, "Connecting websocket");
        let (mut ws, _) = connect_async(node_url)
            .await
            .map_err(|e| SessionError::Transport(format!("websocket connect failed: {}", e)))?;

        let token = storage.session_token().unwrap_or_default();
        ws.send(Message::Text(format!(
            "{}{}",
            settings.jwt_request_prefix, token
        )))
        .await
        .map_err(|e| SessionError::Transport(format!("failed to send token frame: {}", e)))?;
        debug!("Token frame sent, waiting for init message");

        let first = match tokio::time::timeout(init_timeout, await_first_frame(&mut ws, storage))
            .await
        {
            Ok(result) => result?,
            Err(_) => {
                close_ws(&mut ws, STATEFULL_PROTOCOL_PROBLEM, Some("Connect timeout, wait for first message")).await;
                warn!("No init message received within timeout");
                return Err(SessionError::HandshakeTimeout(init_timeout));
            }
        };

        let Some(raw) = first.strip_prefix(settings.jwt_response_prefix.as_str()) else {
            return Err(SessionError::ProtocolViolation(format!(
                "wrong init message prefix, expected '{}'",
                settings.jwt_response_prefix
            )));
        };

        let init = match serde_json::from_str::<serde_json::Value>(raw) {
            Ok(serde_json::Value::Object(object)) => object,
            Ok(_) => {
                close_ws(&mut ws, STATEFULL_PROTOCOL_PROBLEM, Some("First message is not a json object")).await;
                return Err(SessionError::ProtocolViolation(
                    "init payload is not a json object".to_string(),
                ));
            }
            Err(err) => {
                close_ws(&mut ws, STATEFULL_PROTOCOL_PROBLEM, Some("First message is not a json object")).await;
                return Err(SessionError::ProtocolViolation(format!(
                    "init payload is not valid json: {}",
                    err
                )));
            }
        };

        debug!("Init message received, handshake complete");
        let (sink, stream) = ws.split();
        let sink = Arc::new(Mutex::new(Some(sink)));
        let socket = HandshakeSocket { sink: sink.clone() };
        Ok((socket, SocketEvents { stream, sink }, init))
    }

    /// Send a JSON object to the session layer's peer.
    ///
    /// Fails with `Transport` once the socket is closed.
    pub async fn send(&self, object: &JsonObject) -> Result<()> {
        let text = serde_json::to_string(object)?;
        let mut guard = self.sink.lock().await;
        let sink = guard
            .as_mut()
            .ok_or_else(|| SessionError::Transport("websocket is not open".to_string()))?;
        sink.send(Message::Text(text))
            .await
            .map_err(|e| SessionError::Transport(format!("failed to send: {}", e)))
    }

    /// Whether the send half is still open.
    ///
    /// A handle only exists once the handshake completed, so there is no
    /// connecting state to report here; while the connection is still being
    /// established, `connect()` itself is in flight.
    pub async fn is_open(&self) -> bool {
        self.sink.lock().await.is_some()
    }

    /// Close with an arbitrary code and an id-tagged reason. Idempotent.
    pub async fn close(&self, code: u16, reason: Option<&str>) {
        close_shared_sink(&self.sink, code, reason).await;
    }

    pub async fn normal_close(&self, reason: Option<&str>) {
        self.close(STATEFULL_NORMAL_CLOSE, reason).await;
    }

    pub async fn protocol_error_close(&self, reason: Option<&str>) {
        self.close(STATEFULL_PROTOCOL_PROBLEM, reason).await;
    }

    pub async fn error_close(&self, reason: Option<&str>) {
        self.close(STATEFULL_ERROR, reason).await;
    }

    pub async fn kick(&self, reason: Option<&str>) {
        self.close(STATEFULL_KICK, reason).await;
    }

    /// Close with the BAN code; duration below `-1` normalizes to
    /// permanent. The payload is `"<durationMs>[: <freeText>]"`.
    pub async fn ban(&self, duration_ms: i64, reason: Option<&str>) {
        let duration = if duration_ms < BanRecord::PERMANENT {
            BanRecord::PERMANENT
        } else {
            duration_ms
        };
        let payload = match reason {
            Some(reason) => format!("{}: {}", duration, reason),
            None => duration.to_string(),
        };
        self.close(STATEFULL_BAN, Some(&payload)).await;
    }
}

impl SocketEvents {
    /// The next post-handshake event. `Closed` is terminal; the stream
    /// end without a close frame and transport errors both surface as an
    /// abnormal 1006 closure.
    pub async fn next_event(&mut self) -> SocketEvent {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => return SocketEvent::Message(text),
                Some(Ok(Message::Close(frame))) => {
                    drop_shared_sink(&self.sink).await;
                    let (code, reason) = close_frame_parts(frame);
                    debug!(code, reason = %reason, "Websocket closed");
                    return SocketEvent::Closed(CloseInfo::parse(code, &reason));
                }
                Some(Ok(_)) => continue, // ping/pong/binary at this layer
                Some(Err(err)) => {
                    warn!(error = %err, "Websocket transport error");
                    close_shared_sink(&self.sink, STATEFULL_ERROR, Some("Unexpected error")).await;
                    return SocketEvent::Closed(CloseInfo::parse(CLOSE_ABNORMAL, ""));
                }
                None => {
                    drop_shared_sink(&self.sink).await;
                    return SocketEvent::Closed(CloseInfo::parse(CLOSE_ABNORMAL, ""));
                }
            }
        }
    }
}

async fn await_first_frame(ws: &mut Ws, storage: &SessionStorage) -> Result<String> {
    loop {
        match ws.next().await {
            Some(Ok(Message::Text(text))) => return Ok(text),
            Some(Ok(Message::Binary(_))) => {
                return Err(SessionError::ProtocolViolation(
                    "init message must be a text frame".to_string(),
                ))
            }
            Some(Ok(Message::Close(frame))) => return Err(close_before_ready(frame, storage)),
            Some(Ok(_)) => continue, // ping/pong
            Some(Err(err)) => {
                close_ws(ws, STATEFULL_ERROR, Some("Unexpected error")).await;
                return Err(SessionError::Transport(format!(
                    "websocket error during handshake: {}",
                    err
                )));
            }
            None => {
                return Err(SessionError::ConnectionClosed {
                    code: CLOSE_ABNORMAL,
                    reason: String::new(),
                    was_clean: false,
                })
            }
        }
    }
}

/// Classify a close frame that arrived before the handshake completed.
///
/// BAN is honored here even though the session never became ready: the
/// record is persisted so the ban gate refuses the next start.
fn close_before_ready(frame: Option<CloseFrame<'_>>, storage: &SessionStorage) -> SessionError {
    let (code, reason) = close_frame_parts(frame);
    if code == STATEFULL_BAN {
        let record = BanRecord::from_close_reason(&reason, now_millis());
        warn!(
            end_time = record.end_time,
            reason = %record.reason,
            "Ban signaled during handshake"
        );
        storage.set_ban_record(&record);
        return SessionError::Banned {
            end_time: record.end_time,
            reason: record.reason,
        };
    }
    info!(code, reason = %reason, "Connection closed before ready");
    SessionError::ConnectionClosed {
        code,
        reason,
        was_clean: true,
    }
}

fn close_frame_parts(frame: Option<CloseFrame<'_>>) -> (u16, String) {
    match frame {
        Some(frame) => (u16::from(frame.code), frame.reason.to_string()),
        None => (CLOSED_NO_STATUS, String::new()),
    }
}

async fn close_ws(ws: &mut Ws, code: u16, payload: Option<&str>) {
    let frame = CloseFrame {
        code: CloseCode::from(code),
        reason: build_reason(code, payload).into(),
    };
    if let Err(err) = ws.send(Message::Close(Some(frame))).await {
        debug!(error = %err, "Close frame not delivered");
    }
}

async fn close_shared_sink(sink: &Arc<Mutex<Option<WsSink>>>, code: u16, payload: Option<&str>) {
    let mut guard = sink.lock().await;
    if let Some(mut sink) = guard.take() {
        let frame = CloseFrame {
            code: CloseCode::from(code),
            reason: build_reason(code, payload).into(),
        };
        if let Err(err) = sink.send(Message::Close(Some(frame))).await {
            debug!(error = %err, "Close frame not delivered");
        }
    }
}

async fn drop_shared_sink(sink: &Arc<Mutex<Option<WsSink>>>) {
    let mut guard = sink.lock().await;
    guard.take();
}
