//! End-to-end signaling tests
//!
//! Drive real WebSocket clients against a server on an ephemeral port and
//! assert the request/response pairs and session-scoped broadcasts.

use futures_util::{SinkExt, StreamExt};
use lectern_protocol::{
    Capability, ClientMessage, CodecCapability, ConsumerCapabilities, ErrorCode, MediaKind,
    MediaParams, Role, ServerMessage, TransportConnectParams, TransportDirection,
};
use lectern_server::directory::OpenDirectory;
use lectern_server::engine::{LoopbackConfig, LoopbackEngine, MediaEngine};
use lectern_server::state::Config;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

const JWT_SECRET: &str = "test-secret-key-for-testing-only";

struct TestServer {
    addr: std::net::SocketAddr,
    shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
}

impl TestServer {
    async fn start() -> anyhow::Result<Self> {
        Self::start_with_directory(Arc::new(OpenDirectory)).await
    }

    async fn start_with_directory(
        directory: Arc<dyn lectern_server::directory::ClassDirectory>,
    ) -> anyhow::Result<Self> {
        let config = Config {
            bind_address: "127.0.0.1:0".to_string(),
            jwt_secret: JWT_SECRET.to_string(),
            worker_pool_size: 2,
            produce_settle: Duration::from_millis(10),
            conflict_backoff_step: Duration::from_millis(50),
            replace_settle: Duration::from_millis(20),
            replace_settle_substitute: Duration::from_millis(30),
            ..Config::default()
        };

        let engine: Arc<dyn MediaEngine> =
            Arc::new(LoopbackEngine::new(LoopbackConfig::default()));
        let (router, _state) = lectern_server::create_app(config, engine, directory).await?;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
        tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async {
                    shutdown_rx.await.ok();
                })
                .await
                .ok();
        });

        tokio::time::sleep(Duration::from_millis(100)).await;

        Ok(Self {
            addr,
            shutdown_tx: Some(shutdown_tx),
        })
    }

    fn ws_url(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }

    fn http_url(&self) -> String {
        format!("http://{}", self.addr)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct WsClient {
    stream: WsStream,
    user_id: Uuid,
}

impl WsClient {
    async fn connect(server: &TestServer, name: &str, role: Role) -> anyhow::Result<Self> {
        let user_id = Uuid::new_v4();
        let token = lectern_server::auth::create_token(user_id, name, role, JWT_SECRET)?;

        let (mut stream, _) = connect_async(server.ws_url()).await?;
        send_on(&mut stream, &ClientMessage::Authenticate { token }).await?;

        match next_msg(&mut stream).await? {
            ServerMessage::Authenticated { .. } => {}
            other => anyhow::bail!("expected authenticated, got {:?}", other),
        }

        Ok(Self { stream, user_id })
    }

    async fn send(&mut self, msg: &ClientMessage) -> anyhow::Result<()> {
        send_on(&mut self.stream, msg).await
    }

    async fn recv(&mut self) -> anyhow::Result<ServerMessage> {
        next_msg(&mut self.stream).await
    }

    /// Skip interleaved frames until one matches
    async fn recv_until<F>(&mut self, pred: F) -> anyhow::Result<ServerMessage>
    where
        F: Fn(&ServerMessage) -> bool,
    {
        for _ in 0..20 {
            let msg = self.recv().await?;
            if pred(&msg) {
                return Ok(msg);
            }
        }
        anyhow::bail!("no matching message within 20 frames")
    }

    async fn join(&mut self, session_id: &str, role: Role, name: &str) -> anyhow::Result<ServerMessage> {
        self.send(&ClientMessage::Join {
            session_id: session_id.to_string(),
            role,
            display_name: name.to_string(),
        })
        .await?;
        self.recv_until(|m| matches!(m, ServerMessage::Joined { .. } | ServerMessage::Error { .. }))
            .await
    }

    /// Create and connect a transport, returning its id
    async fn setup_transport(
        &mut self,
        session_id: &str,
        direction: TransportDirection,
    ) -> anyhow::Result<Uuid> {
        self.send(&ClientMessage::CreateTransport {
            session_id: session_id.to_string(),
            direction,
        })
        .await?;
        let created = self
            .recv_until(|m| matches!(m, ServerMessage::TransportCreated { .. }))
            .await?;
        let transport_id = match created {
            ServerMessage::TransportCreated { transport_id, .. } => transport_id,
            _ => unreachable!(),
        };

        self.send(&ClientMessage::ConnectTransport {
            transport_id,
            params: TransportConnectParams {
                dtls_fingerprint: "AA:BB:CC".to_string(),
                ice_ufrag: "client".to_string(),
                ice_pwd: "client-pwd".to_string(),
            },
        })
        .await?;
        self.recv_until(|m| matches!(m, ServerMessage::TransportConnected { .. }))
            .await?;

        Ok(transport_id)
    }

    async fn produce(
        &mut self,
        session_id: &str,
        transport_id: Uuid,
        ssrc: u32,
    ) -> anyhow::Result<Uuid> {
        self.send(&ClientMessage::Produce {
            session_id: session_id.to_string(),
            transport_id,
            kind: MediaKind::Video,
            params: video_params(ssrc),
        })
        .await?;
        match self
            .recv_until(|m| matches!(m, ServerMessage::Produced { .. } | ServerMessage::Error { .. }))
            .await?
        {
            ServerMessage::Produced { producer_id } => Ok(producer_id),
            other => anyhow::bail!("produce failed: {:?}", other),
        }
    }
}

async fn send_on(stream: &mut WsStream, msg: &ClientMessage) -> anyhow::Result<()> {
    stream
        .send(Message::Text(serde_json::to_string(msg)?.into()))
        .await?;
    Ok(())
}

async fn next_msg(stream: &mut WsStream) -> anyhow::Result<ServerMessage> {
    loop {
        let frame = timeout(Duration::from_secs(2), stream.next())
            .await?
            .ok_or_else(|| anyhow::anyhow!("connection closed"))??;
        if let Message::Text(text) = frame {
            return Ok(serde_json::from_str(&text)?);
        }
    }
}

fn video_params(ssrc: u32) -> MediaParams {
    MediaParams {
        mime_type: "video/VP8".to_string(),
        clock_rate: 90000,
        channels: 0,
        ssrc,
        fmtp: None,
    }
}

fn full_caps() -> ConsumerCapabilities {
    ConsumerCapabilities {
        codecs: vec![
            CodecCapability {
                mime_type: "audio/opus".to_string(),
                clock_rate: 48000,
                channels: 2,
            },
            CodecCapability {
                mime_type: "video/VP8".to_string(),
                clock_rate: 90000,
                channels: 0,
            },
        ],
    }
}

#[tokio::test]
async fn late_joiner_sees_existing_producers() -> anyhow::Result<()> {
    let server = TestServer::start().await?;

    let mut teacher = WsClient::connect(&server, "teacher", Role::Teacher).await?;
    let joined = teacher.join("cls1", Role::Teacher, "Ms. Frizzle").await?;
    match joined {
        ServerMessage::Joined {
            producers,
            participant_count,
            ..
        } => {
            assert!(producers.is_empty());
            assert_eq!(participant_count, 1);
        }
        other => anyhow::bail!("unexpected join response: {:?}", other),
    }

    let transport = teacher
        .setup_transport("cls1", TransportDirection::Send)
        .await?;
    let producer_id = teacher.produce("cls1", transport, 42).await?;

    let mut student = WsClient::connect(&server, "student", Role::Student).await?;
    let joined = student.join("cls1", Role::Student, "Arnold").await?;
    match joined {
        ServerMessage::Joined {
            producers,
            participant_count,
            ..
        } => {
            assert_eq!(participant_count, 2);
            assert_eq!(producers.len(), 1);
            assert_eq!(producers[0].producer_id, producer_id);
            assert_eq!(producers[0].user_id, teacher.user_id);
            assert_eq!(producers[0].kind, MediaKind::Video);
        }
        other => anyhow::bail!("unexpected join response: {:?}", other),
    }

    // Teacher observes the student joining
    let joined_event = teacher
        .recv_until(|m| matches!(m, ServerMessage::ParticipantJoined { .. }))
        .await?;
    match joined_event {
        ServerMessage::ParticipantJoined { participant, .. } => {
            assert_eq!(participant.user_id, student.user_id);
        }
        _ => unreachable!(),
    }

    // And the student can consume the teacher's stream
    let recv_transport = student
        .setup_transport("cls1", TransportDirection::Receive)
        .await?;
    student
        .send(&ClientMessage::Consume {
            transport_id: recv_transport,
            producer_id,
            capabilities: full_caps(),
        })
        .await?;
    let consumed = student
        .recv_until(|m| matches!(m, ServerMessage::Consumed { .. } | ServerMessage::Error { .. }))
        .await?;
    let consumer_id = match consumed {
        ServerMessage::Consumed {
            consumer_id,
            producer_id: bound,
            ..
        } => {
            assert_eq!(bound, producer_id);
            consumer_id
        }
        other => anyhow::bail!("consume failed: {:?}", other),
    };

    student
        .send(&ClientMessage::ResumeConsumer { consumer_id })
        .await?;
    let ack = student
        .recv_until(|m| matches!(m, ServerMessage::Ack))
        .await?;
    assert!(matches!(ack, ServerMessage::Ack));

    Ok(())
}

#[tokio::test]
async fn new_producer_broadcast_reaches_other_participants() -> anyhow::Result<()> {
    let server = TestServer::start().await?;

    let mut teacher = WsClient::connect(&server, "teacher", Role::Teacher).await?;
    teacher.join("cls2", Role::Teacher, "Teacher").await?;
    let mut student = WsClient::connect(&server, "student", Role::Student).await?;
    student.join("cls2", Role::Student, "Student").await?;

    let transport = teacher
        .setup_transport("cls2", TransportDirection::Send)
        .await?;
    let producer_id = teacher.produce("cls2", transport, 7).await?;

    let event = student
        .recv_until(|m| matches!(m, ServerMessage::NewProducer { .. }))
        .await?;
    match event {
        ServerMessage::NewProducer { producer, .. } => {
            assert_eq!(producer.producer_id, producer_id);
            assert_eq!(producer.user_id, teacher.user_id);
            assert_eq!(producer.kind, MediaKind::Video);
        }
        _ => unreachable!(),
    }

    Ok(())
}

#[tokio::test]
async fn permission_broadcast_carries_full_map() -> anyhow::Result<()> {
    let server = TestServer::start().await?;

    let mut teacher = WsClient::connect(&server, "teacher", Role::Teacher).await?;
    teacher.join("cls3", Role::Teacher, "Teacher").await?;
    let mut student = WsClient::connect(&server, "student", Role::Student).await?;
    student.join("cls3", Role::Student, "Student").await?;

    let student_id = student.user_id;
    teacher
        .send(&ClientMessage::GrantPermission {
            session_id: "cls3".to_string(),
            user_id: student_id,
            capability: Capability::Speak,
        })
        .await?;

    // Every connection sees the grant, the acting teacher's own included
    for client in [&mut teacher, &mut student] {
        let event = client
            .recv_until(|m| matches!(m, ServerMessage::PermissionGranted { .. }))
            .await?;
        match event {
            ServerMessage::PermissionGranted {
                user_id,
                capability,
                permissions,
                ..
            } => {
                assert_eq!(user_id, student_id);
                assert_eq!(capability, Capability::Speak);
                assert!(permissions[&student_id].speak);
            }
            _ => unreachable!(),
        }
    }

    teacher
        .send(&ClientMessage::RevokePermission {
            session_id: "cls3".to_string(),
            user_id: student_id,
            capability: Capability::Speak,
        })
        .await?;

    for client in [&mut teacher, &mut student] {
        let event = client
            .recv_until(|m| matches!(m, ServerMessage::PermissionRevoked { .. }))
            .await?;
        match event {
            ServerMessage::PermissionRevoked { permissions, .. } => {
                assert!(!permissions[&student_id].speak);
            }
            _ => unreachable!(),
        }
    }

    Ok(())
}

#[tokio::test]
async fn students_cannot_grant_permissions() -> anyhow::Result<()> {
    let server = TestServer::start().await?;

    let mut teacher = WsClient::connect(&server, "teacher", Role::Teacher).await?;
    teacher.join("cls4", Role::Teacher, "Teacher").await?;
    let mut student = WsClient::connect(&server, "student", Role::Student).await?;
    student.join("cls4", Role::Student, "Student").await?;

    student
        .send(&ClientMessage::GrantPermission {
            session_id: "cls4".to_string(),
            user_id: teacher.user_id,
            capability: Capability::ScreenShare,
        })
        .await?;

    let response = student
        .recv_until(|m| matches!(m, ServerMessage::Error { .. }))
        .await?;
    match response {
        ServerMessage::Error { code, .. } => assert_eq!(code, ErrorCode::Forbidden),
        _ => unreachable!(),
    }

    Ok(())
}

#[tokio::test]
async fn hand_raise_is_relayed() -> anyhow::Result<()> {
    let server = TestServer::start().await?;

    let mut teacher = WsClient::connect(&server, "teacher", Role::Teacher).await?;
    teacher.join("cls5", Role::Teacher, "Teacher").await?;
    let mut student = WsClient::connect(&server, "student", Role::Student).await?;
    student.join("cls5", Role::Student, "Student").await?;

    student
        .send(&ClientMessage::RaiseHand {
            session_id: "cls5".to_string(),
        })
        .await?;

    let event = teacher
        .recv_until(|m| matches!(m, ServerMessage::HandRaised { .. }))
        .await?;
    match event {
        ServerMessage::HandRaised { user_id, .. } => assert_eq!(user_id, student.user_id),
        _ => unreachable!(),
    }

    student
        .send(&ClientMessage::LowerHand {
            session_id: "cls5".to_string(),
        })
        .await?;
    let event = teacher
        .recv_until(|m| matches!(m, ServerMessage::HandLowered { .. }))
        .await?;
    assert!(matches!(event, ServerMessage::HandLowered { .. }));

    Ok(())
}

#[tokio::test]
async fn chat_respects_capability() -> anyhow::Result<()> {
    let server = TestServer::start().await?;

    let mut teacher = WsClient::connect(&server, "teacher", Role::Teacher).await?;
    teacher.join("cls6", Role::Teacher, "Teacher").await?;
    let mut student = WsClient::connect(&server, "student", Role::Student).await?;
    student.join("cls6", Role::Student, "Student").await?;

    // Students can chat by default
    student
        .send(&ClientMessage::Chat {
            session_id: "cls6".to_string(),
            body: "hello".to_string(),
        })
        .await?;
    let event = teacher
        .recv_until(|m| matches!(m, ServerMessage::ChatMessage { .. }))
        .await?;
    match event {
        ServerMessage::ChatMessage { user_id, body, .. } => {
            assert_eq!(user_id, student.user_id);
            assert_eq!(body, "hello");
        }
        _ => unreachable!(),
    }

    // Revoking chat silences them
    teacher
        .send(&ClientMessage::RevokePermission {
            session_id: "cls6".to_string(),
            user_id: student.user_id,
            capability: Capability::Chat,
        })
        .await?;
    student
        .recv_until(|m| matches!(m, ServerMessage::PermissionRevoked { .. }))
        .await?;

    student
        .send(&ClientMessage::Chat {
            session_id: "cls6".to_string(),
            body: "still here?".to_string(),
        })
        .await?;
    let response = student
        .recv_until(|m| matches!(m, ServerMessage::Error { .. }))
        .await?;
    match response {
        ServerMessage::Error { code, .. } => assert_eq!(code, ErrorCode::Forbidden),
        _ => unreachable!(),
    }

    Ok(())
}

#[tokio::test]
async fn leave_broadcasts_participant_left() -> anyhow::Result<()> {
    let server = TestServer::start().await?;

    let mut teacher = WsClient::connect(&server, "teacher", Role::Teacher).await?;
    teacher.join("cls7", Role::Teacher, "Teacher").await?;
    let mut student = WsClient::connect(&server, "student", Role::Student).await?;
    student.join("cls7", Role::Student, "Student").await?;

    student
        .send(&ClientMessage::Leave {
            session_id: "cls7".to_string(),
        })
        .await?;
    let ack = student
        .recv_until(|m| matches!(m, ServerMessage::Ack))
        .await?;
    assert!(matches!(ack, ServerMessage::Ack));

    let event = teacher
        .recv_until(|m| matches!(m, ServerMessage::ParticipantLeft { .. }))
        .await?;
    match event {
        ServerMessage::ParticipantLeft {
            user_id,
            participant_count,
            ..
        } => {
            assert_eq!(user_id, student.user_id);
            assert_eq!(participant_count, 1);
        }
        _ => unreachable!(),
    }

    Ok(())
}

#[tokio::test]
async fn join_rejects_role_escalation() -> anyhow::Result<()> {
    let server = TestServer::start().await?;

    let mut student = WsClient::connect(&server, "student", Role::Student).await?;
    let response = student.join("cls8", Role::Teacher, "Impostor").await?;
    match response {
        ServerMessage::Error { code, .. } => assert_eq!(code, ErrorCode::Forbidden),
        other => anyhow::bail!("expected forbidden, got {:?}", other),
    }

    Ok(())
}

#[tokio::test]
async fn join_requires_live_class() -> anyhow::Result<()> {
    let roster = lectern_server::directory::FixedRoster::new(["algebra-101"]);
    let server = TestServer::start_with_directory(Arc::new(roster)).await?;

    let mut student = WsClient::connect(&server, "student", Role::Student).await?;

    let response = student.join("geometry-202", Role::Student, "Student").await?;
    match response {
        ServerMessage::Error { code, .. } => assert_eq!(code, ErrorCode::NotFound),
        other => anyhow::bail!("expected not_found, got {:?}", other),
    }

    let response = student.join("algebra-101", Role::Student, "Student").await?;
    assert!(matches!(response, ServerMessage::Joined { .. }));

    Ok(())
}

#[tokio::test]
async fn health_reports_pool_state() -> anyhow::Result<()> {
    let server = TestServer::start().await?;

    let body: serde_json::Value = reqwest::get(format!("{}/health", server.http_url()))
        .await?
        .json()
        .await?;

    assert_eq!(body["status"], "ok");
    assert_eq!(body["workers_total"], 2);
    assert_eq!(body["workers_alive"], 2);

    Ok(())
}
