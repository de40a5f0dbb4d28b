//! HTTP and live-stream handlers for murmur server.
//!
//! Request/response routes cover the chat operations; the stream routes
//! register the caller with the broker and forward events until the client
//! goes away or the server shuts down.

use crate::config::Config;
use crate::error::ApiError;
use crate::metrics::{self, StreamMetricsGuard};
use anyhow::Result;
use async_trait::async_trait;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        FromRequestParts, Path, Query, State,
    },
    http::{request::Parts, HeaderMap, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse,
    },
    routing::{get, post},
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use murmur_core::{Broker, ChatService, Database, RoomId, UserId};
use murmur_protocol::{codec, ChatEvent, MessagePayload, Version, PROTOCOL_VERSION, VERSION_HEADER};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

/// Header carrying the authenticated caller's identity.
pub const USER_ID_HEADER: &str = "x-user-id";

/// Shared server state.
pub struct AppState {
    /// The chat service.
    pub chat: ChatService,
    /// Server configuration.
    pub config: Config,
}

impl AppState {
    /// Create new app state.
    #[must_use]
    pub fn new(chat: ChatService, config: Config) -> Self {
        Self { chat, config }
    }
}

/// Run the HTTP server until interrupted.
///
/// # Errors
///
/// Returns an error if the database can't be opened or the server fails
/// to start.
pub async fn run_server(config: Config) -> Result<()> {
    let db = Database::connect(&config.database.url, config.database.max_connections).await?;
    let broker = Arc::new(Broker::with_config(config.broker_config()));
    let chat = ChatService::new(db, Arc::clone(&broker), config.chat_limits());
    let state = Arc::new(AppState::new(chat, config.clone()));

    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    let app = router(state);

    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr).await?;

    info!("murmur server listening on {}", addr);
    if config.transport.sse {
        info!("SSE endpoint: http://{}{}", addr, config.transport.stream_path);
    }
    if config.transport.websocket {
        info!(
            "WebSocket endpoint: ws://{}{}",
            addr, config.transport.websocket_path
        );
    }

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(broker))
        .await?;

    info!("murmur server stopped");
    Ok(())
}

/// Wait for Ctrl-C, then end every live stream so connections can drain.
async fn shutdown_signal(broker: Arc<Broker>) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        return;
    }
    info!("Shutdown requested");
    broker.shutdown();
}

/// Build the application router.
pub fn router(state: Arc<AppState>) -> Router {
    let transport = &state.config.transport;

    let mut app: Router<Arc<AppState>> = Router::new()
        .route("/health", get(health_handler))
        .route("/chat/rooms", post(open_room_handler))
        .route("/chat/conversations", get(list_conversations_handler))
        .route("/chat/rooms/:room_id/messages", get(list_messages_handler))
        .route("/chat/rooms/:room_id/read", post(mark_read_handler))
        .route("/chat/messages", post(send_message_handler))
        .route("/chat/unread", get(unread_handler));

    if transport.sse {
        app = app.route(&transport.stream_path, get(sse_handler));
    }
    if transport.websocket {
        app = app.route(&transport.websocket_path, get(ws_handler));
    }

    app.with_state(state)
}

/// The caller's identity, as vouched for by the session layer in front of
/// this server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallerId(pub UserId);

#[async_trait]
impl<S> FromRequestParts<S> for CallerId
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get(USER_ID_HEADER)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse::<UserId>().ok())
            .filter(|id| *id > 0)
            .map(CallerId)
            .ok_or(ApiError::Unauthorized)
    }
}

/// Parse a room id and check the caller is one of its participants.
fn authorize(room_id: &str, caller: UserId) -> Result<RoomId, ApiError> {
    let room = RoomId::parse(room_id).map_err(murmur_core::ChatError::from)?;
    if !room.contains(caller) {
        warn!(room = %room, user = caller, "Caller is not a participant");
        return Err(ApiError::Forbidden(room.to_string()));
    }
    Ok(room)
}

/// Reject clients announcing an incompatible protocol version.
fn check_version(headers: &HeaderMap) -> Result<(), ApiError> {
    let Some(value) = headers.get(VERSION_HEADER) else {
        return Ok(());
    };

    let raw = value.to_str().unwrap_or_default();
    match raw.parse::<Version>() {
        Ok(version) if version.is_compatible_with(&PROTOCOL_VERSION) => Ok(()),
        _ => Err(ApiError::UnsupportedVersion(raw.to_string())),
    }
}

#[derive(Debug, Deserialize)]
pub struct OpenRoomRequest {
    pub other_user_id: UserId,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct OpenRoomResponse {
    pub room_id: String,
}

#[derive(Debug, Deserialize)]
pub struct SendMessageRequest {
    pub room_id: String,
    pub body: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct PageQuery {
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "protocol": PROTOCOL_VERSION.to_string(),
        "streams": state.chat.broker().stats().connection_count,
        "timestamp": chrono::Utc::now(),
    }))
}

async fn open_room_handler(
    State(state): State<Arc<AppState>>,
    CallerId(user_id): CallerId,
    Json(request): Json<OpenRoomRequest>,
) -> Result<Json<OpenRoomResponse>, ApiError> {
    let room = state.chat.open_room(user_id, request.other_user_id).await?;
    Ok(Json(OpenRoomResponse {
        room_id: room.id.to_string(),
    }))
}

async fn list_conversations_handler(
    State(state): State<Arc<AppState>>,
    CallerId(user_id): CallerId,
    Query(page): Query<PageQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let conversations = state
        .chat
        .list_conversations(user_id, page.limit, page.offset.unwrap_or(0))
        .await?;
    Ok(Json(conversations))
}

async fn list_messages_handler(
    State(state): State<Arc<AppState>>,
    CallerId(user_id): CallerId,
    Path(room_id): Path<String>,
    Query(page): Query<PageQuery>,
) -> Result<impl IntoResponse, ApiError> {
    authorize(&room_id, user_id)?;
    let messages = state
        .chat
        .list_messages(&room_id, page.limit, page.offset.unwrap_or(0))
        .await?;
    Ok(Json(messages))
}

async fn send_message_handler(
    State(state): State<Arc<AppState>>,
    CallerId(user_id): CallerId,
    Json(request): Json<SendMessageRequest>,
) -> Result<impl IntoResponse, ApiError> {
    authorize(&request.room_id, user_id)?;

    let start = Instant::now();
    let sent = state
        .chat
        .send_message(&request.room_id, user_id, &request.body)
        .await?;
    metrics::record_send(&sent.delivery, start.elapsed().as_secs_f64());

    Ok((StatusCode::CREATED, Json(MessagePayload::from(&sent.message))))
}

async fn mark_read_handler(
    State(state): State<Arc<AppState>>,
    CallerId(user_id): CallerId,
    Path(room_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    authorize(&room_id, user_id)?;
    let read = state.chat.mark_room_read(&room_id, user_id).await?;
    metrics::record_broadcast(&read.delivery);
    Ok(StatusCode::NO_CONTENT)
}

async fn unread_handler(
    State(state): State<Arc<AppState>>,
    CallerId(user_id): CallerId,
) -> Result<impl IntoResponse, ApiError> {
    let totals = state.chat.unread_total(user_id).await?;
    Ok(Json(totals))
}

fn sse_event(event: &ChatEvent) -> Result<Event, murmur_protocol::ProtocolError> {
    let data = codec::encode_text(event)?;
    Ok(Event::default().event(event.kind().as_str()).data(data))
}

/// Server-Sent Events stream handler.
async fn sse_handler(
    State(state): State<Arc<AppState>>,
    CallerId(user_id): CallerId,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    check_version(&headers)?;

    let mut subscription = state.chat.open_stream(user_id);
    let metrics_guard = StreamMetricsGuard::new("sse");
    let connection = subscription.connection_id();
    debug!(user = user_id, connection = %connection, "SSE stream opened");

    let stream = async_stream::stream! {
        let _metrics_guard = metrics_guard;

        while let Some(event) = subscription.recv().await {
            match sse_event(&event) {
                Ok(frame) => yield Ok::<Event, Infallible>(frame),
                Err(e) => {
                    warn!(user = user_id, connection = %connection, error = %e, "Failed to encode event");
                    metrics::record_error("encode");
                }
            }
        }

        debug!(user = user_id, connection = %connection, "SSE stream ended");
    };

    let keep_alive = KeepAlive::new().interval(state.config.keepalive_interval());
    Ok((
        [(VERSION_HEADER, PROTOCOL_VERSION.to_string())],
        Sse::new(stream).keep_alive(keep_alive),
    ))
}

/// WebSocket upgrade handler.
async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    CallerId(user_id): CallerId,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    check_version(&headers)?;
    Ok(ws.on_upgrade(move |socket| handle_websocket(socket, state, user_id)))
}

/// Forward a user's events over a WebSocket connection.
async fn handle_websocket(socket: WebSocket, state: Arc<AppState>, user_id: UserId) {
    let _metrics_guard = StreamMetricsGuard::new("websocket");

    let mut subscription = state.chat.open_stream(user_id);
    let connection = subscription.connection_id();
    debug!(user = user_id, connection = %connection, "WebSocket connected");

    let (mut sender, mut receiver) = socket.split();

    let mut ping = tokio::time::interval(state.config.keepalive_interval());
    ping.tick().await;

    loop {
        tokio::select! {
            biased;

            event = subscription.recv() => {
                let Some(event) = event else {
                    debug!(user = user_id, connection = %connection, "Stream closed by broker");
                    let _ = sender.send(Message::Close(None)).await;
                    break;
                };

                match codec::encode_text(&event) {
                    Ok(text) => {
                        if sender.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(user = user_id, connection = %connection, error = %e, "Failed to encode event");
                        metrics::record_error("encode");
                    }
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) => {
                        debug!(connection = %connection, "Received close frame");
                        break;
                    }
                    Some(Ok(_)) => {
                        // Inbound traffic is ignored; sends go through HTTP
                    }
                    Some(Err(e)) => {
                        warn!(connection = %connection, error = %e, "WebSocket error");
                        metrics::record_error("websocket");
                        break;
                    }
                    None => {
                        debug!(connection = %connection, "WebSocket stream ended");
                        break;
                    }
                }
            }

            _ = ping.tick() => {
                if sender.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
        }
    }

    drop(subscription);
    debug!(user = user_id, connection = %connection, "WebSocket disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;
    use bytes::BytesMut;
    use murmur_core::ChatLimits;
    use std::time::Duration;
    use tokio_tungstenite::tungstenite::{self, client::IntoClientRequest};

    async fn test_state() -> Arc<AppState> {
        let db = Database::in_memory().await.unwrap();
        let chat = ChatService::new(db, Arc::new(Broker::new()), ChatLimits::default());
        Arc::new(AppState::new(chat, Config::default()))
    }

    async fn json_body(response: axum::response::Response) -> serde_json::Value {
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    async fn wait_connected(broker: &Broker, user_id: UserId) {
        for _ in 0..200 {
            if broker.is_connected(user_id) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("user {user_id} never connected");
    }

    #[tokio::test]
    async fn test_caller_id_extraction() {
        let request = Request::builder()
            .header(USER_ID_HEADER, " 7 ")
            .body(())
            .unwrap();
        let (mut parts, ()) = request.into_parts();
        let caller = CallerId::from_request_parts(&mut parts, &()).await.unwrap();
        assert_eq!(caller, CallerId(7));

        for bad in ["", "abc", "0", "-3"] {
            let request = Request::builder().header(USER_ID_HEADER, bad).body(()).unwrap();
            let (mut parts, ()) = request.into_parts();
            assert!(CallerId::from_request_parts(&mut parts, &()).await.is_err());
        }
    }

    #[test]
    fn test_authorize() {
        assert!(authorize("3_7", 3).is_ok());
        assert!(matches!(authorize("3_7", 5), Err(ApiError::Forbidden(_))));
        assert_eq!(authorize("7_3", 3).unwrap_err().status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_check_version() {
        let mut headers = HeaderMap::new();
        assert!(check_version(&headers).is_ok());

        headers.insert(VERSION_HEADER, "1.3".parse().unwrap());
        assert!(check_version(&headers).is_ok());

        headers.insert(VERSION_HEADER, "2.0".parse().unwrap());
        assert!(check_version(&headers).is_err());
    }

    #[tokio::test]
    async fn test_send_and_list_messages() {
        let state = test_state().await;

        let opened = open_room_handler(
            State(Arc::clone(&state)),
            CallerId(7),
            Json(OpenRoomRequest { other_user_id: 3 }),
        )
        .await
        .unwrap();
        assert_eq!(opened.room_id, "3_7");

        let response = send_message_handler(
            State(Arc::clone(&state)),
            CallerId(3),
            Json(SendMessageRequest {
                room_id: "3_7".to_string(),
                body: "hi".to_string(),
            }),
        )
        .await
        .unwrap()
        .into_response();
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(json_body(response).await["body"], "hi");

        let response = list_messages_handler(
            State(Arc::clone(&state)),
            CallerId(7),
            Path("3_7".to_string()),
            Query(PageQuery::default()),
        )
        .await
        .unwrap()
        .into_response();
        let messages = json_body(response).await;
        assert_eq!(messages.as_array().unwrap().len(), 1);
        assert_eq!(messages[0]["sender_id"], 3);
        assert_eq!(messages[0]["room_id"], "3_7");
    }

    #[tokio::test]
    async fn test_outsider_is_forbidden() {
        let state = test_state().await;
        state.chat.open_room(3, 7).await.unwrap();

        let err = send_message_handler(
            State(Arc::clone(&state)),
            CallerId(5),
            Json(SendMessageRequest {
                room_id: "3_7".to_string(),
                body: "let me in".to_string(),
            }),
        )
        .await
        .err()
        .unwrap();
        assert_eq!(err.status(), StatusCode::FORBIDDEN);
        assert!(state.chat.list_messages("3_7", None, 0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_mark_read_and_unread() {
        let state = test_state().await;
        state.chat.open_room(3, 7).await.unwrap();
        state.chat.send_message("3_7", 3, "one").await.unwrap();
        state.chat.send_message("3_7", 3, "two").await.unwrap();

        let response = unread_handler(State(Arc::clone(&state)), CallerId(7))
            .await
            .unwrap()
            .into_response();
        let totals = json_body(response).await;
        assert_eq!(totals["total"], 2);
        assert_eq!(totals["rooms"]["3_7"], 2);

        let status = mark_read_handler(State(Arc::clone(&state)), CallerId(7), Path("3_7".into()))
            .await
            .unwrap();
        assert_eq!(status, StatusCode::NO_CONTENT);

        let response = unread_handler(State(Arc::clone(&state)), CallerId(7))
            .await
            .unwrap()
            .into_response();
        assert_eq!(json_body(response).await["total"], 0);

        let err = mark_read_handler(State(Arc::clone(&state)), CallerId(1), Path("1_2".into()))
            .await
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_list_conversations() {
        let state = test_state().await;
        state.chat.open_room(3, 7).await.unwrap();
        state.chat.send_message("3_7", 7, "hey").await.unwrap();

        let response = list_conversations_handler(
            State(Arc::clone(&state)),
            CallerId(3),
            Query(PageQuery::default()),
        )
        .await
        .unwrap()
        .into_response();
        let conversations = json_body(response).await;
        assert_eq!(conversations[0]["other_user_id"], 7);
        assert_eq!(conversations[0]["unread_count"], 1);
        assert_eq!(conversations[0]["last_message"]["body"], "hey");
    }

    #[tokio::test]
    async fn test_health() {
        let state = test_state().await;
        let response = health_handler(State(state)).await.into_response();
        let health = json_body(response).await;
        assert_eq!(health["status"], "ok");
        assert_eq!(health["streams"], 0);
        assert_eq!(health["protocol"], PROTOCOL_VERSION.to_string());
    }

    #[tokio::test]
    async fn test_sse_stream_delivers_events() {
        let state = test_state().await;
        state.chat.open_room(3, 7).await.unwrap();

        let response = sse_handler(State(Arc::clone(&state)), CallerId(7), HeaderMap::new())
            .await
            .unwrap()
            .into_response();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(state.chat.broker().is_connected(7));

        state.chat.send_message("3_7", 3, "hi").await.unwrap();

        let mut body = response.into_body().into_data_stream();
        let mut buf = BytesMut::new();
        let event = loop {
            if let Some(event) = codec::decode_sse_from(&mut buf).unwrap() {
                break event;
            }
            let chunk = body.next().await.unwrap().unwrap();
            buf.extend_from_slice(&chunk);
        };

        match event {
            ChatEvent::NewMessage { room_id, message } => {
                assert_eq!(room_id, "3_7");
                assert_eq!(message.body, "hi");
            }
            other => panic!("unexpected event: {other:?}"),
        }

        drop(body);
        assert!(!state.chat.broker().is_connected(7));
    }

    #[tokio::test]
    async fn test_sse_rejects_incompatible_version() {
        let state = test_state().await;
        let mut headers = HeaderMap::new();
        headers.insert(VERSION_HEADER, "9.0".parse().unwrap());

        let err = sse_handler(State(Arc::clone(&state)), CallerId(7), headers)
            .await
            .err()
            .unwrap();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        assert!(!state.chat.broker().is_connected(7));
    }

    async fn serve(state: Arc<AppState>) -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = router(state);
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    #[tokio::test]
    async fn test_websocket_requires_identity() {
        let state = test_state().await;
        let addr = serve(Arc::clone(&state)).await;

        let err = tokio_tungstenite::connect_async(format!("ws://{addr}/chat/ws"))
            .await
            .err()
            .unwrap();
        match err {
            tungstenite::Error::Http(response) => {
                assert_eq!(response.status().as_u16(), 401);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(state.chat.broker().stats().connection_count, 0);
    }

    #[tokio::test]
    async fn test_websocket_stream() {
        let state = test_state().await;
        state.chat.open_room(3, 7).await.unwrap();

        let addr = serve(Arc::clone(&state)).await;

        let mut request = format!("ws://{addr}/chat/ws").into_client_request().unwrap();
        request
            .headers_mut()
            .insert(USER_ID_HEADER, "7".parse().unwrap());
        let (mut ws, _) = tokio_tungstenite::connect_async(request).await.unwrap();

        wait_connected(state.chat.broker(), 7).await;
        state.chat.send_message("3_7", 3, "over the wire").await.unwrap();

        let text = loop {
            match ws.next().await.unwrap().unwrap() {
                tungstenite::Message::Text(text) => break text,
                _ => continue,
            }
        };
        let event = codec::decode(text.as_bytes()).unwrap();
        assert_eq!(event.room_id(), "3_7");
        match event {
            ChatEvent::NewMessage { message, .. } => assert_eq!(message.body, "over the wire"),
            other => panic!("unexpected event: {other:?}"),
        }

        ws.close(None).await.unwrap();
        for _ in 0..200 {
            if !state.chat.broker().is_connected(7) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("stream was not released after close");
    }
}
