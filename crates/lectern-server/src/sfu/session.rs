//! Session registry
//!
//! One entry per live class session. Each session owns its routing context
//! and independently locked arenas for participants, transports, producers,
//! and consumers, so operations against one session never contend with
//! another's. Idle sessions are closed by a periodic sweep.

use super::cleanup::EvictionQueue;
use crate::engine::{Router, Transport, Worker, WorkerPool};
use crate::error::SignalError;
use crate::state::Config;
use crate::ws::connections::ConnectionManager;
use chrono::{DateTime, Utc};
use lectern_protocol::{
    MediaKind, MediaParams, ParticipantInfo, PermissionMap, PermissionSet, ProducerInfo, Role,
    RouterCapabilities, TransportDirection,
};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::{watch, Mutex, RwLock};
use tokio::time::{Duration, Instant};
use uuid::Uuid;

/// A (session, user) participant
#[derive(Debug, Clone)]
pub struct Participant {
    pub user_id: Uuid,
    pub display_name: String,
    pub role: Role,
    pub connection_id: Uuid,
    pub joined_at: DateTime<Utc>,
}

impl Participant {
    pub fn info(&self, permissions: PermissionSet) -> ParticipantInfo {
        ParticipantInfo {
            user_id: self.user_id,
            display_name: self.display_name.clone(),
            role: self.role,
            joined_at: self.joined_at,
            permissions,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    New,
    Connecting,
    Connected,
    Closed,
}

pub struct TransportEntry {
    pub id: Uuid,
    pub owner: Uuid,
    pub direction: TransportDirection,
    pub state: TransportState,
    pub handle: Arc<dyn Transport>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProducerState {
    Open,
    Paused,
    /// Owner disconnected; closes when the grace period lapses unless a new
    /// consumer arrives or the owner reconnects first
    PendingCleanup,
}

pub struct ProducerEntry {
    pub id: Uuid,
    pub user_id: Uuid,
    pub transport_id: Uuid,
    pub kind: MediaKind,
    pub state: ProducerState,
    pub params: MediaParams,
    pub handle: Arc<dyn crate::engine::Producer>,
}

impl ProducerEntry {
    pub fn info(&self) -> ProducerInfo {
        ProducerInfo {
            producer_id: self.id,
            user_id: self.user_id,
            kind: self.kind,
            paused: self.state == ProducerState::Paused,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Paused,
    Resumed,
}

pub struct ConsumerEntry {
    pub id: Uuid,
    pub user_id: Uuid,
    pub transport_id: Uuid,
    pub producer_id: Uuid,
    pub state: ConsumerState,
    pub handle: Arc<dyn crate::engine::Consumer>,
}

/// Server-side state for one live class meeting
pub struct ClassSession {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub(crate) worker: Arc<dyn Worker>,
    pub(crate) router: Arc<dyn Router>,
    pub(crate) connections: Arc<ConnectionManager>,
    pub(crate) config: Config,
    pub(crate) participants: RwLock<HashMap<Uuid, Participant>>,
    pub(crate) transports: RwLock<HashMap<Uuid, TransportEntry>>,
    pub(crate) producers: RwLock<HashMap<Uuid, ProducerEntry>>,
    pub(crate) consumers: RwLock<HashMap<Uuid, ConsumerEntry>>,
    pub(crate) permissions: RwLock<PermissionMap>,
    /// Serializes producer conflict resolution per (participant, kind)
    pub(crate) produce_gates: Mutex<HashMap<(Uuid, MediaKind), Arc<Mutex<()>>>>,
    pub(crate) evictions: EvictionQueue,
    /// Self-reference for deferred tasks; a task firing after the last Arc
    /// is gone simply fails the upgrade and no-ops
    pub(crate) weak: Weak<ClassSession>,
    last_activity: RwLock<Instant>,
    closed: watch::Sender<bool>,
}

impl ClassSession {
    pub fn new(
        id: String,
        worker: Arc<dyn Worker>,
        router: Arc<dyn Router>,
        connections: Arc<ConnectionManager>,
        config: Config,
    ) -> Arc<Self> {
        let (closed, _) = watch::channel(false);
        Arc::new_cyclic(|weak| Self {
            id,
            created_at: Utc::now(),
            worker,
            router,
            connections,
            config,
            participants: RwLock::new(HashMap::new()),
            transports: RwLock::new(HashMap::new()),
            producers: RwLock::new(HashMap::new()),
            consumers: RwLock::new(HashMap::new()),
            permissions: RwLock::new(HashMap::new()),
            produce_gates: Mutex::new(HashMap::new()),
            evictions: EvictionQueue::new(),
            weak: weak.clone(),
            last_activity: RwLock::new(Instant::now()),
            closed,
        })
    }

    pub fn capabilities(&self) -> RouterCapabilities {
        self.router.capabilities()
    }

    /// The engine worker this session's routing context lives on
    pub fn worker_id(&self) -> Uuid {
        self.worker.id()
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    pub(crate) fn closed_rx(&self) -> watch::Receiver<bool> {
        self.closed.subscribe()
    }

    /// Sleep that aborts early if the session closes mid-wait
    pub(crate) async fn sleep_unless_closed(&self, delay: Duration) -> Result<(), SignalError> {
        let mut closed = self.closed_rx();
        tokio::select! {
            _ = tokio::time::sleep(delay) => Ok(()),
            _ = closed.wait_for(|c| *c) => {
                Err(SignalError::NotFound(format!("session {} closed", self.id)))
            }
        }
    }

    pub(crate) async fn touch(&self) {
        *self.last_activity.write().await = Instant::now();
    }

    pub async fn idle_for(&self) -> Duration {
        self.last_activity.read().await.elapsed()
    }

    pub async fn participant_count(&self) -> usize {
        self.participants.read().await.len()
    }

    pub async fn participant(&self, user_id: Uuid) -> Option<Participant> {
        self.participants.read().await.get(&user_id).cloned()
    }

    /// Register or refresh a participant. Returns the participant's info and
    /// whether this was a reconnect of an already-present participant.
    pub async fn add_participant(
        &self,
        user_id: Uuid,
        display_name: String,
        role: Role,
        connection_id: Uuid,
    ) -> (ParticipantInfo, bool) {
        let mut participants = self.participants.write().await;
        let reconnect = participants.contains_key(&user_id);

        let participant = participants
            .entry(user_id)
            .and_modify(|p| {
                p.connection_id = connection_id;
                p.display_name = display_name.clone();
            })
            .or_insert_with(|| Participant {
                user_id,
                display_name: display_name.clone(),
                role,
                connection_id,
                joined_at: Utc::now(),
            })
            .clone();
        drop(participants);

        let permissions = {
            let mut permissions = self.permissions.write().await;
            *permissions
                .entry(user_id)
                .or_insert_with(|| PermissionSet::defaults_for(role))
        };

        if reconnect {
            // The brief-disconnect path: keep the participant's producers
            // alive instead of letting the grace-period eviction fire
            self.evictions.cancel(user_id).await;
            let mut producers = self.producers.write().await;
            for entry in producers.values_mut() {
                if entry.user_id == user_id && entry.state == ProducerState::PendingCleanup {
                    self.evictions.cancel(entry.id).await;
                    entry.state = ProducerState::Open;
                    tracing::debug!(
                        "Producer {} unmarked for cleanup after reconnect of {}",
                        entry.id,
                        user_id
                    );
                }
            }
        }

        self.touch().await;
        (participant.info(permissions), reconnect)
    }

    pub async fn remove_participant(&self, user_id: Uuid) -> Option<Participant> {
        let removed = self.participants.write().await.remove(&user_id);
        if removed.is_some() {
            self.permissions.write().await.remove(&user_id);
            self.touch().await;
        }
        removed
    }

    /// Currently live producers, including ones in their grace period
    pub async fn producers_snapshot(&self) -> Vec<ProducerInfo> {
        self.producers
            .read()
            .await
            .values()
            .map(ProducerEntry::info)
            .collect()
    }

    pub async fn permissions_snapshot(&self) -> PermissionMap {
        self.permissions.read().await.clone()
    }

    pub async fn consumer_count(&self) -> usize {
        self.consumers.read().await.len()
    }

    pub async fn transport_count(&self) -> usize {
        self.transports.read().await.len()
    }

    pub(crate) async fn produce_gate(&self, user_id: Uuid, kind: MediaKind) -> Arc<Mutex<()>> {
        self.produce_gates
            .lock()
            .await
            .entry((user_id, kind))
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Tear down everything the session owns. Safe to call once; deferred
    /// cleanup tasks that fire afterwards find empty arenas and no-op.
    pub(crate) async fn shutdown(&self) {
        self.closed.send_replace(true);
        self.evictions.cancel_all().await;

        let consumers: Vec<_> = self.consumers.write().await.drain().collect();
        for (_, entry) in consumers {
            entry.handle.close().await;
        }

        let producers: Vec<_> = self.producers.write().await.drain().collect();
        for (_, entry) in producers {
            entry.handle.close().await;
        }

        let transports: Vec<_> = self.transports.write().await.drain().collect();
        for (_, entry) in transports {
            entry.handle.close().await;
        }

        self.router.close().await;
        self.participants.write().await.clear();
        self.permissions.write().await.clear();

        tracing::info!("Session {} closed", self.id);
    }
}

/// Process-wide registry of live sessions
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<ClassSession>>>,
    pool: Arc<WorkerPool>,
    connections: Arc<ConnectionManager>,
    config: Config,
}

impl SessionRegistry {
    pub fn new(
        pool: Arc<WorkerPool>,
        connections: Arc<ConnectionManager>,
        config: Config,
    ) -> Arc<Self> {
        Arc::new(Self {
            sessions: RwLock::new(HashMap::new()),
            pool,
            connections,
            config,
        })
    }

    pub async fn get(&self, session_id: &str) -> Option<Arc<ClassSession>> {
        self.sessions.read().await.get(session_id).cloned()
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Idempotent: returns the existing session or assigns a worker, creates
    /// a routing context on it, and caches the new session.
    pub async fn get_or_create(&self, session_id: &str) -> Result<Arc<ClassSession>, SignalError> {
        if let Some(session) = self.sessions.read().await.get(session_id) {
            return Ok(session.clone());
        }

        // Engine calls happen outside the registry lock; a concurrent create
        // for the same id is resolved below in favor of the first writer.
        let worker = self.pool.acquire().await?;
        let router = worker.create_router().await?;

        let mut sessions = self.sessions.write().await;
        if let Some(existing) = sessions.get(session_id) {
            let existing = existing.clone();
            drop(sessions);
            router.close().await;
            return Ok(existing);
        }

        let session = ClassSession::new(
            session_id.to_string(),
            worker.clone(),
            router,
            self.connections.clone(),
            self.config.clone(),
        );
        sessions.insert(session_id.to_string(), session.clone());
        tracing::info!(
            "Created session {} on worker {}",
            session_id,
            worker.id()
        );

        Ok(session)
    }

    /// Close a session and everything it owns; no-op for an unknown id
    pub async fn close_session(&self, session_id: &str) {
        let session = self.sessions.write().await.remove(session_id);
        if let Some(session) = session {
            session.shutdown().await;
            self.connections.drop_session(session_id).await;
        }
    }

    /// Periodic sweep closing sessions idle past the configured threshold
    pub fn spawn_idle_sweep(self: Arc<Self>) {
        let registry = self;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(registry.config.sweep_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                registry.sweep_idle().await;
            }
        });
    }

    pub(crate) async fn sweep_idle(&self) {
        let candidates: Vec<(String, Arc<ClassSession>)> = self
            .sessions
            .read()
            .await
            .iter()
            .map(|(id, s)| (id.clone(), s.clone()))
            .collect();

        for (id, session) in candidates {
            if session.idle_for().await > self.config.idle_timeout {
                tracing::info!("Closing idle session {}", id);
                self.close_session(&id).await;
            }
        }
    }
}
