//! Resource lifecycle management
//!
//! Creation, tracking, and teardown of transports, producers, and consumers
//! within one session. Producer creation enforces at most one live producer
//! per (participant, kind) and absorbs the engine's lazy release of
//! synchronization identifiers with a settle delay and a bounded retry loop.
//! Teardown after a disconnect is deferred by a grace period so a brief
//! reconnect does not break other participants' consumption.

use super::session::{
    ClassSession, ConsumerEntry, ConsumerState, ProducerEntry, ProducerState, TransportEntry,
    TransportState,
};
use crate::engine::EngineError;
use crate::error::SignalError;
use lectern_protocol::{
    ConsumerCapabilities, MediaKind, MediaParams, ProducerInfo, ServerMessage,
    TransportConnectParams, TransportDirection, TransportParams,
};
use uuid::Uuid;

impl ClassSession {
    pub(crate) async fn broadcast(&self, message: &ServerMessage, except: Option<Uuid>) {
        self.connections
            .broadcast_to_session(&self.id, message, except)
            .await;
    }

    /// Create a transport on the session's routing context
    pub async fn create_transport(
        &self,
        owner: Uuid,
        direction: TransportDirection,
    ) -> Result<(Uuid, TransportParams), SignalError> {
        let handle = self.router.create_transport().await?;
        let id = handle.id();
        let params = handle.params();

        self.transports.write().await.insert(
            id,
            TransportEntry {
                id,
                owner,
                direction,
                state: TransportState::New,
                handle,
            },
        );
        self.touch().await;

        tracing::debug!(
            "Created {:?} transport {} for {} in session {}",
            direction,
            id,
            owner,
            self.id
        );
        Ok((id, params))
    }

    /// Connect a transport with the remote endpoint's parameters. A transport
    /// already connected or mid-connect acks without re-invoking the engine,
    /// which would reject the duplicate negotiation.
    pub async fn connect_transport(
        &self,
        transport_id: Uuid,
        remote: TransportConnectParams,
    ) -> Result<(), SignalError> {
        let handle = {
            let mut transports = self.transports.write().await;
            let entry = transports.get_mut(&transport_id).ok_or_else(|| {
                SignalError::NotFound(format!("transport {} not found", transport_id))
            })?;
            match entry.state {
                TransportState::Connected | TransportState::Connecting => {
                    tracing::debug!("Transport {} already connected, skipping", transport_id);
                    return Ok(());
                }
                TransportState::Closed => {
                    return Err(SignalError::NotFound(format!(
                        "transport {} is closed",
                        transport_id
                    )));
                }
                TransportState::New => {}
            }
            entry.state = TransportState::Connecting;
            entry.handle.clone()
        };

        match handle.connect(remote).await {
            Ok(()) => {
                if let Some(entry) = self.transports.write().await.get_mut(&transport_id) {
                    entry.state = TransportState::Connected;
                }
                Ok(())
            }
            Err(e) => {
                // Allow the client to retry the whole operation
                if let Some(entry) = self.transports.write().await.get_mut(&transport_id) {
                    entry.state = TransportState::New;
                }
                Err(SignalError::TransientNetwork(e.to_string()))
            }
        }
    }

    /// Publish a stream, replacing any live producer for the same
    /// (participant, kind), and announce it to the rest of the session.
    pub async fn create_producer(
        &self,
        transport_id: Uuid,
        kind: MediaKind,
        params: MediaParams,
        user_id: Uuid,
        connection_id: Uuid,
    ) -> Result<ProducerInfo, SignalError> {
        let info = self
            .produce_inner(transport_id, kind, params, user_id)
            .await?;

        self.broadcast(
            &ServerMessage::NewProducer {
                session_id: self.id.clone(),
                producer: info.clone(),
            },
            Some(connection_id),
        )
        .await;

        Ok(info)
    }

    /// The produce pipeline: close the previous holder of the key, give the
    /// engine a moment to release its identifier space, then create, retrying
    /// with a sweep and linear backoff if the engine still holds the SSRC.
    async fn produce_inner(
        &self,
        transport_id: Uuid,
        kind: MediaKind,
        params: MediaParams,
        user_id: Uuid,
    ) -> Result<ProducerInfo, SignalError> {
        let gate = self.produce_gate(user_id, kind).await;
        let _guard = gate.lock().await;

        let existing: Vec<Uuid> = self
            .producers
            .read()
            .await
            .values()
            .filter(|p| p.user_id == user_id && p.kind == kind)
            .map(|p| p.id)
            .collect();
        for producer_id in existing {
            self.close_producer_quiet(producer_id).await;
        }

        self.sleep_unless_closed(self.config.produce_settle).await?;

        let mut attempt: u32 = 0;
        loop {
            let handle = {
                let transports = self.transports.read().await;
                let entry = transports.get(&transport_id).ok_or_else(|| {
                    SignalError::NotFound(format!("transport {} not found", transport_id))
                })?;
                if entry.state == TransportState::Closed {
                    return Err(SignalError::NotFound(format!(
                        "transport {} is closed",
                        transport_id
                    )));
                }
                entry.handle.clone()
            };

            match handle.produce(kind, params.clone()).await {
                Ok(producer) => {
                    let id = producer.id();
                    let entry = ProducerEntry {
                        id,
                        user_id,
                        transport_id,
                        kind,
                        state: ProducerState::Open,
                        params: params.clone(),
                        handle: producer,
                    };
                    let info = entry.info();
                    self.producers.write().await.insert(id, entry);
                    self.touch().await;
                    tracing::info!(
                        "Producer {} ({:?}) created for {} in session {}",
                        id,
                        kind,
                        user_id,
                        self.id
                    );
                    return Ok(info);
                }
                Err(EngineError::SsrcInUse(ssrc)) => {
                    attempt += 1;
                    if attempt > self.config.conflict_retry_limit {
                        tracing::warn!(
                            "Producer creation for {} in session {} gave up after {} retries (ssrc {})",
                            user_id,
                            self.id,
                            self.config.conflict_retry_limit,
                            ssrc
                        );
                        return Err(SignalError::Conflict(format!(
                            "ssrc {} is still registered after {} retries",
                            ssrc, self.config.conflict_retry_limit
                        )));
                    }

                    tracing::warn!(
                        "SSRC {} conflict for {} in session {}, sweeping and retrying ({}/{})",
                        ssrc,
                        user_id,
                        self.id,
                        attempt,
                        self.config.conflict_retry_limit
                    );
                    self.conflict_sweep(user_id, kind).await;
                    self.sleep_unless_closed(self.config.conflict_backoff_step * attempt)
                        .await?;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Aggressive sweep on identifier conflict: close every registered
    /// producer belonging to the participant or sharing the media kind.
    async fn conflict_sweep(&self, user_id: Uuid, kind: MediaKind) {
        let stale: Vec<Uuid> = self
            .producers
            .read()
            .await
            .values()
            .filter(|p| p.user_id == user_id || p.kind == kind)
            .map(|p| p.id)
            .collect();
        for producer_id in stale {
            self.close_producer_quiet(producer_id).await;
        }
    }

    /// Swap a participant's video source. Consumers bound to the old
    /// producer(s) are closed first, then the producers; after a settle delay
    /// sized for the source's bandwidth the replacement is created.
    pub async fn replace_producer(
        &self,
        transport_id: Uuid,
        params: MediaParams,
        user_id: Uuid,
        connection_id: Uuid,
        is_substitute: bool,
    ) -> Result<ProducerInfo, SignalError> {
        let replaced: Vec<Uuid> = self
            .producers
            .read()
            .await
            .values()
            .filter(|p| p.user_id == user_id && p.kind == MediaKind::Video)
            .map(|p| p.id)
            .collect();

        for producer_id in &replaced {
            self.close_consumers_of(*producer_id).await;
        }
        for producer_id in &replaced {
            self.close_producer_quiet(*producer_id).await;
        }

        let settle = if is_substitute {
            self.config.replace_settle_substitute
        } else {
            self.config.replace_settle
        };
        self.sleep_unless_closed(settle).await?;

        let info = self
            .produce_inner(transport_id, MediaKind::Video, params, user_id)
            .await?;

        self.broadcast(
            &ServerMessage::ProducerReplaced {
                session_id: self.id.clone(),
                producer: info.clone(),
                replaced_producer_ids: replaced,
                is_substitute,
            },
            Some(connection_id),
        )
        .await;

        Ok(info)
    }

    /// Subscribe a participant to a producer's stream. Created paused; a new
    /// consumer also cancels any pending grace-period eviction of its
    /// producer, since active consumption means the stream is still wanted.
    pub async fn create_consumer(
        &self,
        transport_id: Uuid,
        producer_id: Uuid,
        capabilities: ConsumerCapabilities,
        user_id: Uuid,
    ) -> Result<(Uuid, MediaParams), SignalError> {
        let transport = {
            let transports = self.transports.read().await;
            let entry = transports.get(&transport_id).ok_or_else(|| {
                SignalError::NotFound(format!("transport {} not found", transport_id))
            })?;
            if entry.state == TransportState::Closed {
                return Err(SignalError::NotFound(format!(
                    "transport {} is closed",
                    transport_id
                )));
            }
            entry.handle.clone()
        };

        let (producer_handle, producer_params) = {
            let mut producers = self.producers.write().await;
            let entry = match producers.get_mut(&producer_id) {
                Some(entry) => entry,
                None => {
                    // Self-heal path: the client's view of the session has
                    // gone stale, push it the current producer list
                    let refresh = ServerMessage::ProducerList {
                        session_id: self.id.clone(),
                        producers: producers.values().map(ProducerEntry::info).collect(),
                    };
                    drop(producers);
                    self.connections.send_to_user(user_id, &refresh).await;
                    return Err(SignalError::NotFound(format!(
                        "producer {} not found",
                        producer_id
                    )));
                }
            };
            if entry.state == ProducerState::PendingCleanup {
                self.evictions.cancel(entry.id).await;
                entry.state = ProducerState::Open;
                tracing::debug!(
                    "Producer {} rescued from pending cleanup by consumer of {}",
                    producer_id,
                    user_id
                );
            }
            (entry.handle.clone(), entry.params.clone())
        };

        if !self.router.can_consume(&producer_params, &capabilities) {
            return Err(SignalError::IncompatibleCapabilities(format!(
                "cannot consume {} with offered capabilities",
                producer_params.mime_type
            )));
        }

        let consumer = match transport.consume(producer_handle, &capabilities).await {
            Ok(consumer) => consumer,
            Err(EngineError::Closed) => {
                return Err(SignalError::Stale(format!(
                    "producer {} already closed",
                    producer_id
                )));
            }
            Err(EngineError::Negotiation(msg)) => {
                return Err(SignalError::IncompatibleCapabilities(msg));
            }
            Err(e) => return Err(e.into()),
        };

        let id = consumer.id();
        let params = consumer.media_params();
        self.consumers.write().await.insert(
            id,
            ConsumerEntry {
                id,
                user_id,
                transport_id,
                producer_id,
                state: ConsumerState::Paused,
                handle: consumer,
            },
        );
        self.touch().await;

        tracing::debug!(
            "Consumer {} created for {} on producer {} in session {}",
            id,
            user_id,
            producer_id,
            self.id
        );
        Ok((id, params))
    }

    /// Best-effort resume. A consumer racing its own teardown is not an
    /// error the caller can act on, so absence is logged and acked.
    pub async fn resume_consumer(&self, consumer_id: Uuid) {
        let handle = {
            let mut consumers = self.consumers.write().await;
            match consumers.get_mut(&consumer_id) {
                Some(entry) => {
                    entry.state = ConsumerState::Resumed;
                    entry.handle.clone()
                }
                None => {
                    tracing::debug!("Resume for unknown consumer {}, ignoring", consumer_id);
                    return;
                }
            }
        };
        handle.resume().await;
    }

    /// Best-effort pause, same policy as [`resume_consumer`]
    pub async fn pause_consumer(&self, consumer_id: Uuid) {
        let handle = {
            let mut consumers = self.consumers.write().await;
            match consumers.get_mut(&consumer_id) {
                Some(entry) => {
                    entry.state = ConsumerState::Paused;
                    entry.handle.clone()
                }
                None => {
                    tracing::debug!("Pause for unknown consumer {}, ignoring", consumer_id);
                    return;
                }
            }
        };
        handle.pause().await;
    }

    /// Pause the caller's own producer (mute, camera off)
    pub async fn pause_producer(&self, producer_id: Uuid, user_id: Uuid) -> Result<(), SignalError> {
        let handle = {
            let mut producers = self.producers.write().await;
            match producers.get_mut(&producer_id) {
                Some(entry) => {
                    if entry.user_id != user_id {
                        return Err(SignalError::Forbidden(
                            "cannot pause another participant's producer".to_string(),
                        ));
                    }
                    if entry.state == ProducerState::Open {
                        entry.state = ProducerState::Paused;
                    }
                    entry.handle.clone()
                }
                None => {
                    tracing::debug!("Pause for unknown producer {}, ignoring", producer_id);
                    return Ok(());
                }
            }
        };
        handle.pause().await;

        self.broadcast(
            &ServerMessage::ProducerPaused {
                session_id: self.id.clone(),
                producer_id,
            },
            None,
        )
        .await;
        Ok(())
    }

    pub async fn resume_producer(
        &self,
        producer_id: Uuid,
        user_id: Uuid,
    ) -> Result<(), SignalError> {
        let handle = {
            let mut producers = self.producers.write().await;
            match producers.get_mut(&producer_id) {
                Some(entry) => {
                    if entry.user_id != user_id {
                        return Err(SignalError::Forbidden(
                            "cannot resume another participant's producer".to_string(),
                        ));
                    }
                    if entry.state == ProducerState::Paused {
                        entry.state = ProducerState::Open;
                    }
                    entry.handle.clone()
                }
                None => {
                    tracing::debug!("Resume for unknown producer {}, ignoring", producer_id);
                    return Ok(());
                }
            }
        };
        handle.resume().await;

        self.broadcast(
            &ServerMessage::ProducerResumed {
                session_id: self.id.clone(),
                producer_id,
            },
            None,
        )
        .await;
        Ok(())
    }

    /// Unconditionally close and remove a producer; no-op if absent
    pub async fn close_producer(&self, producer_id: Uuid) {
        let owner = match self.producers.read().await.get(&producer_id) {
            Some(entry) => entry.user_id,
            None => {
                tracing::debug!("Close for unknown producer {}, ignoring", producer_id);
                return;
            }
        };

        self.close_producer_quiet(producer_id).await;

        self.broadcast(
            &ServerMessage::ProducerClosed {
                session_id: self.id.clone(),
                producer_id,
                user_id: owner,
            },
            None,
        )
        .await;
    }

    /// Close a producer and the consumers bound to it without broadcasting.
    /// A consumer is never valid after its producer closes, so both go in
    /// the same operation.
    pub(crate) async fn close_producer_quiet(&self, producer_id: Uuid) {
        self.evictions.cancel(producer_id).await;
        self.close_consumers_of(producer_id).await;

        let entry = self.producers.write().await.remove(&producer_id);
        if let Some(entry) = entry {
            entry.handle.close().await;
            tracing::debug!("Producer {} closed in session {}", producer_id, self.id);
        }
    }

    pub(crate) async fn close_consumers_of(&self, producer_id: Uuid) {
        let bound: Vec<ConsumerEntry> = {
            let mut consumers = self.consumers.write().await;
            let ids: Vec<Uuid> = consumers
                .values()
                .filter(|c| c.producer_id == producer_id)
                .map(|c| c.id)
                .collect();
            ids.into_iter().filter_map(|id| consumers.remove(&id)).collect()
        };
        for entry in bound {
            entry.handle.close().await;
        }
    }

    /// Deferred teardown after a connection drop. Consumers close at once,
    /// producers are marked for cleanup and survive the grace period so a
    /// brief reconnect keeps other participants' streams intact.
    pub async fn disconnect_cleanup(&self, user_id: Uuid, connection_id: Uuid) {
        match self.participant(user_id).await {
            // Ignore drops of connections the participant already replaced
            Some(p) if p.connection_id != connection_id => return,
            Some(_) => {}
            None => return,
        }

        self.close_consumers_for_user(user_id).await;

        let grace = self.config.producer_grace;
        let marked: Vec<Uuid> = {
            let mut producers = self.producers.write().await;
            producers
                .values_mut()
                .filter(|p| p.user_id == user_id)
                .map(|p| {
                    p.state = ProducerState::PendingCleanup;
                    p.id
                })
                .collect()
        };

        for producer_id in &marked {
            let weak = self.weak.clone();
            let id = *producer_id;
            self.evictions
                .schedule(id, grace, async move {
                    if let Some(session) = weak.upgrade() {
                        session.evict_producer(id).await;
                    }
                })
                .await;
        }

        let weak = self.weak.clone();
        self.evictions
            .schedule(user_id, grace, async move {
                if let Some(session) = weak.upgrade() {
                    session.evict_participant(user_id, connection_id).await;
                }
            })
            .await;

        self.touch().await;
        tracing::info!(
            "Participant {} disconnected from session {}, {} producers in grace period",
            user_id,
            self.id,
            marked.len()
        );
    }

    /// Grace period lapsed for one producer without a rescue
    async fn evict_producer(&self, producer_id: Uuid) {
        let owner = match self.producers.read().await.get(&producer_id) {
            Some(entry) if entry.state == ProducerState::PendingCleanup => entry.user_id,
            _ => return,
        };

        self.close_producer_quiet(producer_id).await;
        self.broadcast(
            &ServerMessage::ProducerClosed {
                session_id: self.id.clone(),
                producer_id,
                user_id: owner,
            },
            None,
        )
        .await;
    }

    /// Grace period lapsed for the participant itself. If every producer is
    /// gone (none were rescued by a consumer), the participant entry and its
    /// transports go too.
    async fn evict_participant(&self, user_id: Uuid, connection_id: Uuid) {
        match self.participant(user_id).await {
            Some(p) if p.connection_id != connection_id => return,
            Some(_) => {}
            None => return,
        }

        // Idempotent with the per-producer eviction tasks
        let pending: Vec<Uuid> = self
            .producers
            .read()
            .await
            .values()
            .filter(|p| p.user_id == user_id && p.state == ProducerState::PendingCleanup)
            .map(|p| p.id)
            .collect();
        for producer_id in pending {
            self.evict_producer(producer_id).await;
        }

        let still_producing = self
            .producers
            .read()
            .await
            .values()
            .any(|p| p.user_id == user_id);
        if still_producing {
            // A consumer rescued a stream mid-grace; keep the participant
            // registered so the producer stays owned
            tracing::debug!(
                "Participant {} kept in session {} after grace: producers still consumed",
                user_id,
                self.id
            );
            return;
        }

        self.close_transports_for_user(user_id).await;

        if self.remove_participant(user_id).await.is_some() {
            let count = self.participant_count().await;
            self.broadcast(
                &ServerMessage::ParticipantLeft {
                    session_id: self.id.clone(),
                    user_id,
                    participant_count: count,
                },
                None,
            )
            .await;
            tracing::info!(
                "Participant {} removed from session {} after grace period",
                user_id,
                self.id
            );
        }
    }

    /// Synchronous full teardown for an explicit leave. Returns whether the
    /// user was actually a participant.
    pub async fn leave_cleanup(&self, user_id: Uuid) -> bool {
        self.evictions.cancel(user_id).await;
        self.close_consumers_for_user(user_id).await;

        let owned: Vec<Uuid> = self
            .producers
            .read()
            .await
            .values()
            .filter(|p| p.user_id == user_id)
            .map(|p| p.id)
            .collect();
        for producer_id in owned {
            self.close_producer_quiet(producer_id).await;
        }

        self.close_transports_for_user(user_id).await;
        self.remove_participant(user_id).await.is_some()
    }

    async fn close_consumers_for_user(&self, user_id: Uuid) {
        let owned: Vec<ConsumerEntry> = {
            let mut consumers = self.consumers.write().await;
            let ids: Vec<Uuid> = consumers
                .values()
                .filter(|c| c.user_id == user_id)
                .map(|c| c.id)
                .collect();
            ids.into_iter().filter_map(|id| consumers.remove(&id)).collect()
        };
        for entry in owned {
            entry.handle.close().await;
        }
    }

    async fn close_transports_for_user(&self, user_id: Uuid) {
        let owned: Vec<TransportEntry> = {
            let mut transports = self.transports.write().await;
            let ids: Vec<Uuid> = transports
                .values()
                .filter(|t| t.owner == user_id)
                .map(|t| t.id)
                .collect();
            ids.into_iter().filter_map(|id| transports.remove(&id)).collect()
        };
        for entry in owned {
            entry.handle.close().await;
        }
    }
}
