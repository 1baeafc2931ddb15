//! Presence and permission fan-out
//!
//! Capability grants and revokes are accepted from moderator-tier roles only.
//! Every permission broadcast carries the session's full permission map so
//! observers converge even if they missed earlier events. Hand-raise and
//! lower are stateless relays. Media publication itself is not gated here;
//! clients enable and disable capture based on the granted set.

use super::session::ClassSession;
use crate::error::SignalError;
use chrono::Utc;
use lectern_protocol::{Capability, ServerMessage};
use uuid::Uuid;

impl ClassSession {
    pub async fn grant_permission(
        &self,
        actor_id: Uuid,
        target_id: Uuid,
        capability: Capability,
    ) -> Result<(), SignalError> {
        self.set_permission(actor_id, target_id, capability, true)
            .await
    }

    pub async fn revoke_permission(
        &self,
        actor_id: Uuid,
        target_id: Uuid,
        capability: Capability,
    ) -> Result<(), SignalError> {
        self.set_permission(actor_id, target_id, capability, false)
            .await
    }

    async fn set_permission(
        &self,
        actor_id: Uuid,
        target_id: Uuid,
        capability: Capability,
        granted: bool,
    ) -> Result<(), SignalError> {
        let actor = self.participant(actor_id).await.ok_or_else(|| {
            SignalError::NotFound(format!("participant {} not in session", actor_id))
        })?;
        if !actor.role.is_moderator() {
            return Err(SignalError::Forbidden(format!(
                "role {:?} cannot change permissions",
                actor.role
            )));
        }
        if self.participant(target_id).await.is_none() {
            return Err(SignalError::NotFound(format!(
                "participant {} not in session",
                target_id
            )));
        }

        let permissions = {
            let mut permissions = self.permissions.write().await;
            if let Some(set) = permissions.get_mut(&target_id) {
                set.set(capability, granted);
            }
            permissions.clone()
        };

        tracing::info!(
            "{:?} {} for {} in session {} by {}",
            capability,
            if granted { "granted" } else { "revoked" },
            target_id,
            self.id,
            actor_id
        );

        let message = if granted {
            ServerMessage::PermissionGranted {
                session_id: self.id.clone(),
                user_id: target_id,
                capability,
                permissions,
            }
        } else {
            ServerMessage::PermissionRevoked {
                session_id: self.id.clone(),
                user_id: target_id,
                capability,
                permissions,
            }
        };

        // Everyone sees the change, the acting moderator included
        self.broadcast(&message, None).await;
        Ok(())
    }

    pub async fn raise_hand(&self, user_id: Uuid) -> Result<(), SignalError> {
        if self.participant(user_id).await.is_none() {
            return Err(SignalError::NotFound(format!(
                "participant {} not in session",
                user_id
            )));
        }
        self.broadcast(
            &ServerMessage::HandRaised {
                session_id: self.id.clone(),
                user_id,
            },
            None,
        )
        .await;
        Ok(())
    }

    pub async fn lower_hand(&self, user_id: Uuid) -> Result<(), SignalError> {
        if self.participant(user_id).await.is_none() {
            return Err(SignalError::NotFound(format!(
                "participant {} not in session",
                user_id
            )));
        }
        self.broadcast(
            &ServerMessage::HandLowered {
                session_id: self.id.clone(),
                user_id,
            },
            None,
        )
        .await;
        Ok(())
    }

    /// Relay a chat line to the session, gated on the chat capability
    pub async fn chat(&self, user_id: Uuid, body: String) -> Result<(), SignalError> {
        let participant = self.participant(user_id).await.ok_or_else(|| {
            SignalError::NotFound(format!("participant {} not in session", user_id))
        })?;

        let allowed = self
            .permissions
            .read()
            .await
            .get(&user_id)
            .map(|set| set.chat)
            .unwrap_or(false);
        if !allowed {
            return Err(SignalError::Forbidden(
                "chat capability not granted".to_string(),
            ));
        }

        self.broadcast(
            &ServerMessage::ChatMessage {
                session_id: self.id.clone(),
                user_id,
                display_name: participant.display_name,
                body,
                sent_at: Utc::now(),
            },
            None,
        )
        .await;
        Ok(())
    }
}
