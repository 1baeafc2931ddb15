use lectern_protocol::ServerMessage;
use std::collections::{HashMap, HashSet};
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub user_id: Uuid,
    pub session_id: Option<String>,
}

/// Registry of live WebSocket connections and their session membership
pub struct ConnectionManager {
    /// Map from connection ID to message sender channel
    senders: RwLock<HashMap<Uuid, mpsc::UnboundedSender<String>>>,
    /// Map from connection ID to connection info
    connection_info: RwLock<HashMap<Uuid, ConnectionInfo>>,
    /// Map from user ID to connection IDs (a user may have multiple connections)
    user_connections: RwLock<HashMap<Uuid, HashSet<Uuid>>>,
    /// Map from session ID to connection IDs of its members
    session_members: RwLock<HashMap<String, HashSet<Uuid>>>,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self {
            senders: RwLock::new(HashMap::new()),
            connection_info: RwLock::new(HashMap::new()),
            user_connections: RwLock::new(HashMap::new()),
            session_members: RwLock::new(HashMap::new()),
        }
    }

    pub async fn add_connection(
        &self,
        connection_id: Uuid,
        user_id: Uuid,
        sender: mpsc::UnboundedSender<String>,
    ) {
        self.senders.write().await.insert(connection_id, sender);

        self.connection_info.write().await.insert(
            connection_id,
            ConnectionInfo {
                user_id,
                session_id: None,
            },
        );

        self.user_connections
            .write()
            .await
            .entry(user_id)
            .or_default()
            .insert(connection_id);

        tracing::debug!(
            "User {} connected with connection ID {}",
            user_id,
            connection_id
        );
    }

    pub async fn remove_connection(&self, connection_id: Uuid) {
        let info = self.connection_info.write().await.remove(&connection_id);

        if let Some(info) = info {
            if let Some(user_conns) = self.user_connections.write().await.get_mut(&info.user_id) {
                user_conns.remove(&connection_id);
            }

            if let Some(session_id) = &info.session_id {
                if let Some(members) = self.session_members.write().await.get_mut(session_id) {
                    members.remove(&connection_id);
                }
            }

            tracing::debug!(
                "User {} disconnected (connection ID {})",
                info.user_id,
                connection_id
            );
        }

        self.senders.write().await.remove(&connection_id);
    }

    /// Enter a connection into a session's broadcast group
    pub async fn join_session(&self, connection_id: Uuid, session_id: &str) {
        if let Some(info) = self.connection_info.write().await.get_mut(&connection_id) {
            info.session_id = Some(session_id.to_string());
        }

        self.session_members
            .write()
            .await
            .entry(session_id.to_string())
            .or_default()
            .insert(connection_id);

        tracing::debug!("Connection {} joined session {}", connection_id, session_id);
    }

    pub async fn leave_session(&self, connection_id: Uuid, session_id: &str) {
        if let Some(info) = self.connection_info.write().await.get_mut(&connection_id) {
            if info.session_id.as_deref() == Some(session_id) {
                info.session_id = None;
            }
        }

        if let Some(members) = self.session_members.write().await.get_mut(session_id) {
            members.remove(&connection_id);
        }
    }

    /// Drop a whole session's broadcast group (on session close)
    pub async fn drop_session(&self, session_id: &str) {
        let members = self.session_members.write().await.remove(session_id);
        if let Some(members) = members {
            let mut info = self.connection_info.write().await;
            for connection_id in members {
                if let Some(conn) = info.get_mut(&connection_id) {
                    if conn.session_id.as_deref() == Some(session_id) {
                        conn.session_id = None;
                    }
                }
            }
        }
    }

    /// Fan a message out to a session's members, optionally excluding the
    /// originating connection
    pub async fn broadcast_to_session(
        &self,
        session_id: &str,
        message: &ServerMessage,
        except: Option<Uuid>,
    ) {
        let json = match serde_json::to_string(message) {
            Ok(j) => j,
            Err(e) => {
                tracing::error!("Failed to serialize message: {}", e);
                return;
            }
        };

        let members = self.session_members.read().await;
        let senders = self.senders.read().await;

        if let Some(conns) = members.get(session_id) {
            for conn_id in conns {
                if Some(*conn_id) == except {
                    continue;
                }
                if let Some(sender) = senders.get(conn_id) {
                    if let Err(e) = sender.send(json.clone()) {
                        tracing::error!("Failed to send message to {}: {}", conn_id, e);
                    }
                }
            }
        }
    }

    pub async fn send_to_user(&self, user_id: Uuid, message: &ServerMessage) {
        let json = match serde_json::to_string(message) {
            Ok(j) => j,
            Err(e) => {
                tracing::error!("Failed to serialize message: {}", e);
                return;
            }
        };

        let user_connections = self.user_connections.read().await;
        let senders = self.senders.read().await;

        if let Some(conn_ids) = user_connections.get(&user_id) {
            for conn_id in conn_ids {
                if let Some(sender) = senders.get(conn_id) {
                    if let Err(e) = sender.send(json.clone()) {
                        tracing::error!(
                            "Failed to send message to user {} ({}): {}",
                            user_id,
                            conn_id,
                            e
                        );
                    }
                }
            }
        }
    }

    pub async fn send_to_connection(&self, connection_id: Uuid, message: &ServerMessage) {
        let json = match serde_json::to_string(message) {
            Ok(j) => j,
            Err(e) => {
                tracing::error!("Failed to serialize message: {}", e);
                return;
            }
        };

        let senders = self.senders.read().await;

        if let Some(sender) = senders.get(&connection_id) {
            if let Err(e) = sender.send(json) {
                tracing::error!("Failed to send message to {}: {}", connection_id, e);
            }
        }
    }
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new()
    }
}
