use crate::auth::verify_token;
use crate::error::SignalError;
use crate::sfu::ClassSession;
use crate::state::AppState;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use lectern_protocol::{ClientMessage, ErrorCode, Role, ServerMessage};
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Per-connection signaling state established during the handshake
struct ConnState {
    connection_id: Uuid,
    user_id: Uuid,
    display_name: String,
    /// Role the identity provider signed into the token
    token_role: Role,
    /// Session this connection has joined, if any
    session_id: Option<String>,
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();

    // First message must be authentication
    let auth_msg = match receiver.next().await {
        Some(Ok(Message::Text(text))) => text,
        _ => {
            tracing::warn!("WebSocket closed before authentication");
            return;
        }
    };

    let auth: ClientMessage = match serde_json::from_str(&auth_msg) {
        Ok(msg) => msg,
        Err(e) => {
            tracing::warn!("Invalid auth message: {}", e);
            let _ = sender
                .send(error_frame(
                    ErrorCode::BadRequest,
                    "Invalid message format",
                ))
                .await;
            return;
        }
    };

    let claims = match auth {
        ClientMessage::Authenticate { token } => {
            match verify_token(&token, &state.config.jwt_secret) {
                Ok(claims) => claims,
                Err(_) => {
                    let _ = sender
                        .send(error_frame(ErrorCode::Forbidden, "Invalid token"))
                        .await;
                    return;
                }
            }
        }
        _ => {
            let _ = sender
                .send(error_frame(
                    ErrorCode::BadRequest,
                    "First message must be authentication",
                ))
                .await;
            return;
        }
    };

    let connection_id = Uuid::new_v4();
    let authenticated = ServerMessage::Authenticated { connection_id };
    if sender
        .send(Message::Text(
            serde_json::to_string(&authenticated).unwrap().into(),
        ))
        .await
        .is_err()
    {
        return;
    }

    tracing::info!(
        "User {} ({:?}) authenticated on WebSocket",
        claims.sub,
        claims.role
    );

    // Channel for outbound messages; broadcasts and responses both flow
    // through it so delivery order matches processing order
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    state
        .connections
        .add_connection(connection_id, claims.sub, tx)
        .await;

    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if sender.send(Message::Text(msg.into())).await.is_err() {
                break;
            }
        }
    });

    let mut conn = ConnState {
        connection_id,
        user_id: claims.sub,
        display_name: claims.name,
        token_role: claims.role,
        session_id: None,
    };

    // Requests from one connection are processed in submission order
    while let Some(msg) = receiver.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                let client_msg: ClientMessage = match serde_json::from_str(&text) {
                    Ok(m) => m,
                    Err(e) => {
                        tracing::warn!("Invalid message from {}: {}", conn.user_id, e);
                        state
                            .connections
                            .send_to_connection(
                                connection_id,
                                &ServerMessage::Error {
                                    code: ErrorCode::BadRequest,
                                    message: "Invalid message format".to_string(),
                                },
                            )
                            .await;
                        continue;
                    }
                };

                handle_client_message(&state, &mut conn, client_msg).await;
            }
            Ok(Message::Ping(_)) => {
                state
                    .connections
                    .send_to_connection(connection_id, &ServerMessage::Pong)
                    .await;
            }
            Ok(Message::Close(_)) => break,
            Err(e) => {
                tracing::error!("WebSocket error for user {}: {}", conn.user_id, e);
                break;
            }
            _ => {}
        }
    }

    // Disconnect without an explicit leave: deferred cleanup with grace
    if let Some(session_id) = &conn.session_id {
        if let Some(session) = state.sessions.get(session_id).await {
            session
                .disconnect_cleanup(conn.user_id, connection_id)
                .await;
        }
    }

    state.connections.remove_connection(connection_id).await;
    send_task.abort();

    tracing::info!("User {} disconnected from WebSocket", conn.user_id);
}

fn error_frame(code: ErrorCode, message: &str) -> Message {
    let frame = ServerMessage::Error {
        code,
        message: message.to_string(),
    };
    Message::Text(serde_json::to_string(&frame).unwrap().into())
}

async fn handle_client_message(state: &AppState, conn: &mut ConnState, message: ClientMessage) {
    match dispatch(state, conn, message).await {
        Ok(Some(response)) => {
            state
                .connections
                .send_to_connection(conn.connection_id, &response)
                .await;
        }
        Ok(None) => {}
        Err(e) => {
            state
                .connections
                .send_to_connection(conn.connection_id, &e.to_message())
                .await;
        }
    }
}

/// The session this connection joined; resource operations that carry only
/// opaque ids are resolved against it
async fn current_session(
    state: &AppState,
    conn: &ConnState,
) -> Result<Arc<ClassSession>, SignalError> {
    let session_id = conn
        .session_id
        .as_ref()
        .ok_or_else(|| SignalError::BadRequest("not joined to a session".to_string()))?;
    state
        .sessions
        .get(session_id)
        .await
        .ok_or_else(|| SignalError::NotFound(format!("session {} not found", session_id)))
}

async fn dispatch(
    state: &AppState,
    conn: &mut ConnState,
    message: ClientMessage,
) -> Result<Option<ServerMessage>, SignalError> {
    match message {
        ClientMessage::Authenticate { .. } => {
            // Already authenticated
            Ok(None)
        }

        ClientMessage::Join {
            session_id,
            role,
            display_name,
        } => handle_join(state, conn, session_id, role, display_name)
            .await
            .map(Some),

        ClientMessage::GetCapabilities { session_id } => {
            let session = state.sessions.get_or_create(&session_id).await?;
            Ok(Some(ServerMessage::Capabilities {
                session_id,
                capabilities: session.capabilities(),
            }))
        }

        ClientMessage::CreateTransport {
            session_id,
            direction,
        } => {
            let session = state.sessions.get_or_create(&session_id).await?;
            let (transport_id, params) = session.create_transport(conn.user_id, direction).await?;
            Ok(Some(ServerMessage::TransportCreated {
                transport_id,
                direction,
                params,
            }))
        }

        ClientMessage::ConnectTransport {
            transport_id,
            params,
        } => {
            let session = current_session(state, conn).await?;
            session.connect_transport(transport_id, params).await?;
            Ok(Some(ServerMessage::TransportConnected { transport_id }))
        }

        ClientMessage::Produce {
            session_id,
            transport_id,
            kind,
            params,
        } => {
            let session = state.sessions.get(&session_id).await.ok_or_else(|| {
                SignalError::NotFound(format!("session {} not found", session_id))
            })?;
            let info = session
                .create_producer(transport_id, kind, params, conn.user_id, conn.connection_id)
                .await?;
            Ok(Some(ServerMessage::Produced {
                producer_id: info.producer_id,
            }))
        }

        ClientMessage::ReplaceProducer {
            transport_id,
            params,
            is_substitute,
        } => {
            let session = current_session(state, conn).await?;
            let info = session
                .replace_producer(
                    transport_id,
                    params,
                    conn.user_id,
                    conn.connection_id,
                    is_substitute,
                )
                .await?;
            Ok(Some(ServerMessage::ProducerSwapped {
                producer_id: info.producer_id,
            }))
        }

        ClientMessage::Consume {
            transport_id,
            producer_id,
            capabilities,
        } => {
            let session = current_session(state, conn).await?;
            let (consumer_id, params) = session
                .create_consumer(transport_id, producer_id, capabilities, conn.user_id)
                .await?;
            Ok(Some(ServerMessage::Consumed {
                consumer_id,
                producer_id,
                params,
            }))
        }

        ClientMessage::ResumeConsumer { consumer_id } => {
            // Soft path: racing a teardown is not a caller error
            if let Ok(session) = current_session(state, conn).await {
                session.resume_consumer(consumer_id).await;
            } else {
                tracing::debug!("Resume consumer {} outside a session, ignoring", consumer_id);
            }
            Ok(Some(ServerMessage::Ack))
        }

        ClientMessage::PauseConsumer { consumer_id } => {
            if let Ok(session) = current_session(state, conn).await {
                session.pause_consumer(consumer_id).await;
            } else {
                tracing::debug!("Pause consumer {} outside a session, ignoring", consumer_id);
            }
            Ok(Some(ServerMessage::Ack))
        }

        ClientMessage::PauseProducer { producer_id } => {
            let session = current_session(state, conn).await?;
            session.pause_producer(producer_id, conn.user_id).await?;
            Ok(Some(ServerMessage::Ack))
        }

        ClientMessage::ResumeProducer { producer_id } => {
            let session = current_session(state, conn).await?;
            session.resume_producer(producer_id, conn.user_id).await?;
            Ok(Some(ServerMessage::Ack))
        }

        ClientMessage::CloseProducer { producer_id } => {
            if let Ok(session) = current_session(state, conn).await {
                session.close_producer(producer_id).await;
            } else {
                tracing::debug!("Close producer {} outside a session, ignoring", producer_id);
            }
            Ok(Some(ServerMessage::Ack))
        }

        ClientMessage::Leave { session_id } => {
            if let Some(session) = state.sessions.get(&session_id).await {
                if session.leave_cleanup(conn.user_id).await {
                    let count = session.participant_count().await;
                    session
                        .broadcast(
                            &ServerMessage::ParticipantLeft {
                                session_id: session_id.clone(),
                                user_id: conn.user_id,
                                participant_count: count,
                            },
                            Some(conn.connection_id),
                        )
                        .await;
                }
            }
            state
                .connections
                .leave_session(conn.connection_id, &session_id)
                .await;
            if conn.session_id.as_deref() == Some(session_id.as_str()) {
                conn.session_id = None;
            }
            Ok(Some(ServerMessage::Ack))
        }

        ClientMessage::GrantPermission {
            session_id,
            user_id,
            capability,
        } => {
            let session = state.sessions.get(&session_id).await.ok_or_else(|| {
                SignalError::NotFound(format!("session {} not found", session_id))
            })?;
            session
                .grant_permission(conn.user_id, user_id, capability)
                .await?;
            Ok(Some(ServerMessage::Ack))
        }

        ClientMessage::RevokePermission {
            session_id,
            user_id,
            capability,
        } => {
            let session = state.sessions.get(&session_id).await.ok_or_else(|| {
                SignalError::NotFound(format!("session {} not found", session_id))
            })?;
            session
                .revoke_permission(conn.user_id, user_id, capability)
                .await?;
            Ok(Some(ServerMessage::Ack))
        }

        ClientMessage::RaiseHand { session_id } => {
            let session = state.sessions.get(&session_id).await.ok_or_else(|| {
                SignalError::NotFound(format!("session {} not found", session_id))
            })?;
            session.raise_hand(conn.user_id).await?;
            Ok(Some(ServerMessage::Ack))
        }

        ClientMessage::LowerHand { session_id } => {
            let session = state.sessions.get(&session_id).await.ok_or_else(|| {
                SignalError::NotFound(format!("session {} not found", session_id))
            })?;
            session.lower_hand(conn.user_id).await?;
            Ok(Some(ServerMessage::Ack))
        }

        ClientMessage::Chat { session_id, body } => {
            let session = state.sessions.get(&session_id).await.ok_or_else(|| {
                SignalError::NotFound(format!("session {} not found", session_id))
            })?;
            session.chat(conn.user_id, body).await?;
            Ok(Some(ServerMessage::Ack))
        }

        ClientMessage::Ping => Ok(Some(ServerMessage::Pong)),
    }
}

async fn handle_join(
    state: &AppState,
    conn: &mut ConnState,
    session_id: String,
    role: Role,
    display_name: String,
) -> Result<ServerMessage, SignalError> {
    let class = state
        .directory
        .find_class(&session_id)
        .await
        .ok_or_else(|| SignalError::NotFound(format!("class {} not found", session_id)))?;
    if !state.directory.is_live(&session_id).await {
        return Err(SignalError::NotFound(format!(
            "class {} is not live",
            session_id
        )));
    }
    tracing::debug!("Join request from {} for class {}", conn.user_id, class.title);

    // The token decides what the connection may be; moderators can join in a
    // lesser role, nobody can escalate
    if role != conn.token_role && !conn.token_role.is_moderator() {
        return Err(SignalError::Forbidden(format!(
            "token role {:?} cannot join as {:?}",
            conn.token_role, role
        )));
    }

    let session = state.sessions.get_or_create(&session_id).await?;
    let display_name = if display_name.is_empty() {
        conn.display_name.clone()
    } else {
        display_name
    };

    let (participant, reconnect) = session
        .add_participant(conn.user_id, display_name, role, conn.connection_id)
        .await;

    state
        .connections
        .join_session(conn.connection_id, &session_id)
        .await;
    conn.session_id = Some(session_id.clone());

    let producers = session.producers_snapshot().await;
    let permissions = session.permissions_snapshot().await;
    let participant_count = session.participant_count().await;

    if reconnect {
        tracing::info!(
            "User {} reconnected to session {} within grace",
            conn.user_id,
            session_id
        );
    } else {
        session
            .broadcast(
                &ServerMessage::ParticipantJoined {
                    session_id: session_id.clone(),
                    participant,
                    participant_count,
                },
                Some(conn.connection_id),
            )
            .await;
    }

    Ok(ServerMessage::Joined {
        session_id,
        capabilities: session.capabilities(),
        producers,
        participant_count,
        permissions,
    })
}
