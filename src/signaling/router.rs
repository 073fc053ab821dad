use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::room::{LeaveOutcome, Participant};
use crate::shared::{AppError, AppState};
use crate::signaling::messages::{
    EndMeetingPayload, InstantCallCancelPayload, InstantCallRequestPayload,
    InstantCallResponsePayload, JoinPayload, LeavePayload, MessageType, PeerInfo,
    RegisterPresencePayload, SignalPayload, WireMessage,
};
use crate::timer::EndReason;

/// What this connection has told us about itself so far.
#[derive(Debug, Default, Clone)]
struct ConnectionSession {
    room_id: Option<String>,
}

/// Parses inbound events and dispatches them to the domain services.
///
/// One router is shared by every connection. A malformed or
/// precondition-failing event answers with an `error` event on the same
/// connection and never affects other rooms or tears the socket down.
pub struct MessageRouter {
    state: AppState,
    sessions: RwLock<HashMap<Uuid, ConnectionSession>>,
}

impl MessageRouter {
    pub fn new(state: AppState) -> Self {
        Self {
            state,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Entry point for every inbound frame.
    pub async fn handle_message(&self, connection_id: Uuid, raw: String) {
        let message = match serde_json::from_str::<WireMessage>(&raw) {
            Ok(message) => message,
            Err(e) => {
                warn!(connection_id = %connection_id, error = %e, "Unparseable inbound event");
                self.send_error(connection_id, "malformed message".to_string())
                    .await;
                return;
            }
        };

        debug!(
            connection_id = %connection_id,
            message_type = ?message.message_type,
            "Inbound event"
        );

        let result = match message.message_type {
            MessageType::Join => self.handle_join(connection_id, message.payload).await,
            MessageType::Offer | MessageType::Answer | MessageType::IceCandidate => {
                self.handle_signal(connection_id, message.message_type, message.payload)
                    .await
            }
            MessageType::Leave => self.handle_leave(connection_id, message.payload).await,
            MessageType::EndMeeting => {
                self.handle_end_meeting(connection_id, message.payload).await
            }
            MessageType::RegisterPresence => {
                self.handle_register_presence(connection_id, message.payload)
                    .await
            }
            MessageType::InstantCallRequest => {
                self.handle_call_request(connection_id, message.payload).await
            }
            MessageType::InstantCallResponse => {
                self.handle_call_response(connection_id, message.payload).await
            }
            MessageType::InstantCallCancel => {
                self.handle_call_cancel(connection_id, message.payload).await
            }
            other => {
                debug!(message_type = ?other, "Ignoring server-to-client type from client");
                Ok(())
            }
        };

        if let Err(e) = result {
            info!(connection_id = %connection_id, error = %e, "Inbound event rejected");
            self.send_error(connection_id, e.to_string()).await;
        }
    }

    #[instrument(skip(self, payload))]
    async fn handle_join(
        &self,
        connection_id: Uuid,
        payload: serde_json::Value,
    ) -> Result<(), AppError> {
        let payload: JoinPayload = parse(payload)?;

        // A supplied meeting id must reference a known meeting before the
        // participant enters the room. A database outage is not a definitive
        // answer, so the join proceeds unverified rather than bouncing.
        if let Some(meeting_id) = payload.meeting_id {
            match self.state.meeting_repository.get_meeting(meeting_id).await {
                Ok(Some(_)) => {}
                Ok(None) => {
                    return Err(AppError::ValidationError(format!(
                        "unknown meeting {meeting_id}"
                    )));
                }
                Err(e) => {
                    warn!(
                        meeting_id = meeting_id,
                        error = %e,
                        "Meeting lookup unavailable, admitting join unverified"
                    );
                }
            }
        }

        let room_id = payload
            .room_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        // A connection is in at most one room; a join while already in
        // another room leaves the old one first so it never keeps a dead
        // participant around.
        let previous_room = {
            let sessions = self.sessions.read().await;
            sessions
                .get(&connection_id)
                .and_then(|session| session.room_id.clone())
        };
        if let Some(previous_room) = previous_room {
            if previous_room != room_id {
                self.leave_room(connection_id, &previous_room).await;
            }
        }

        let participant = Participant::new(
            connection_id,
            payload.peer_id.clone(),
            payload.role,
            payload.user_id.clone(),
        );
        let outcome = self.state.rooms.join(&room_id, participant).await;

        if let Some(meeting_id) = payload.meeting_id {
            self.state.rooms.set_meeting_id(&room_id, meeting_id).await;
        }

        {
            let mut sessions = self.sessions.write().await;
            sessions.entry(connection_id).or_default().room_id = Some(room_id.clone());
        }

        let reply = if outcome.is_creator {
            WireMessage::created_room(room_id.clone(), payload.peer_id.clone())
        } else {
            let existing_peers = outcome
                .existing_peers
                .iter()
                .map(|p| PeerInfo {
                    peer_id: p.peer_id.clone(),
                    role: p.role,
                    user_id: p.user_id.clone(),
                })
                .collect();
            WireMessage::joined_room(room_id.clone(), payload.peer_id.clone(), existing_peers)
        };
        self.state
            .connections
            .send_to_connection(&connection_id, &reply.to_json())
            .await;

        // Tell everyone already in the room about the newcomer.
        let others = outcome.room.other_connection_ids(&connection_id);
        if !others.is_empty() {
            let joined = WireMessage::user_joined_call(
                payload.peer_id.clone(),
                payload.role,
                payload.user_id.clone(),
            );
            self.state
                .connections
                .send_to_connections(&others, &joined.to_json())
                .await;
        }

        if outcome.room.participant_count() >= 2 {
            // A refill within the grace window keeps the meeting alive.
            self.state.timers.cancel_leave_grace(&room_id).await;
        }

        if outcome.reached_two {
            if let Some(meeting_id) = outcome.room.meeting_id.or(payload.meeting_id) {
                self.state.timers.start(&room_id, meeting_id).await;
            } else {
                debug!(room_id = %room_id, "Room full but no meeting bound, timer not started");
            }
        }

        Ok(())
    }

    /// Offer/answer/ICE are relayed verbatim to the other side; the server
    /// never inspects the SDP or candidate payload.
    async fn handle_signal(
        &self,
        connection_id: Uuid,
        message_type: MessageType,
        payload: serde_json::Value,
    ) -> Result<(), AppError> {
        let signal: SignalPayload = parse(payload.clone())?;

        let room = self
            .state
            .rooms
            .get_room(&signal.room_id)
            .await
            .ok_or_else(|| AppError::NotFound(format!("room {} not found", signal.room_id)))?;
        if !room.has_connection(&connection_id) {
            return Err(AppError::PreconditionFailed(
                "sender is not in the room".to_string(),
            ));
        }

        let targets = room.other_connection_ids(&connection_id);
        if targets.is_empty() {
            debug!(room_id = %signal.room_id, "No peer to relay signal to");
            return Ok(());
        }

        let relayed = WireMessage::relay(message_type, payload);
        self.state
            .connections
            .send_to_connections(&targets, &relayed.to_json())
            .await;
        Ok(())
    }

    async fn handle_leave(
        &self,
        connection_id: Uuid,
        payload: serde_json::Value,
    ) -> Result<(), AppError> {
        let payload: LeavePayload = parse(payload)?;
        self.leave_room(connection_id, &payload.room_id).await;
        Ok(())
    }

    #[instrument(skip(self, payload))]
    async fn handle_end_meeting(
        &self,
        connection_id: Uuid,
        payload: serde_json::Value,
    ) -> Result<(), AppError> {
        let payload: EndMeetingPayload = parse(payload)?;

        let room = self
            .state
            .rooms
            .get_room(&payload.room_id)
            .await
            .ok_or_else(|| AppError::NotFound(format!("room {} not found", payload.room_id)))?;
        if !room.has_connection(&connection_id) {
            return Err(AppError::PreconditionFailed(
                "only participants can end the meeting".to_string(),
            ));
        }

        self.state.timers.end(&payload.room_id, EndReason::Manual).await;
        Ok(())
    }

    async fn handle_register_presence(
        &self,
        connection_id: Uuid,
        payload: serde_json::Value,
    ) -> Result<(), AppError> {
        let payload: RegisterPresencePayload = parse(payload)?;
        self.state
            .presence
            .register(&payload.user_id, payload.role, connection_id)
            .await;
        self.sessions
            .write()
            .await
            .entry(connection_id)
            .or_default();
        Ok(())
    }

    async fn handle_call_request(
        &self,
        _connection_id: Uuid,
        payload: serde_json::Value,
    ) -> Result<(), AppError> {
        let payload: InstantCallRequestPayload = parse(payload)?;
        self.state
            .calls
            .request(
                &payload.volunteer_id,
                &payload.student_id,
                &payload.volunteer_name,
            )
            .await?;
        Ok(())
    }

    async fn handle_call_response(
        &self,
        _connection_id: Uuid,
        payload: serde_json::Value,
    ) -> Result<(), AppError> {
        let payload: InstantCallResponsePayload = parse(payload)?;
        self.state
            .calls
            .respond(&payload.call_id, payload.accepted, &payload.student_id)
            .await
    }

    async fn handle_call_cancel(
        &self,
        _connection_id: Uuid,
        payload: serde_json::Value,
    ) -> Result<(), AppError> {
        let payload: InstantCallCancelPayload = parse(payload)?;
        self.state
            .calls
            .cancel(&payload.call_id, &payload.volunteer_id)
            .await
    }

    /// Socket teardown: departure from any joined room, then presence.
    /// Driven by the connection task after its loop exits.
    #[instrument(skip(self))]
    pub async fn handle_disconnect(&self, connection_id: Uuid) {
        let session = {
            let mut sessions = self.sessions.write().await;
            sessions.remove(&connection_id)
        };

        if let Some(room_id) = session.and_then(|s| s.room_id) {
            self.leave_room(connection_id, &room_id).await;
        }

        self.state.presence.unregister(&connection_id).await;
        debug!(connection_id = %connection_id, "Connection cleaned up");
    }

    /// Shared by explicit `leave` and socket teardown. Notifies the rest of
    /// the room and, when a meeting is running, arms the grace re-check
    /// instead of ending immediately.
    async fn leave_room(&self, connection_id: Uuid, room_id: &str) {
        {
            let mut sessions = self.sessions.write().await;
            if let Some(session) = sessions.get_mut(&connection_id) {
                // A leave naming some other room must not unbind the room
                // the connection is actually in.
                if session.room_id.as_deref() == Some(room_id) {
                    session.room_id = None;
                }
            }
        }

        match self.state.rooms.leave(room_id, &connection_id).await {
            LeaveOutcome::Left { room, participant } => {
                let left = WireMessage::user_left_call(
                    participant.peer_id.clone(),
                    participant.user_id.clone(),
                );
                self.state
                    .connections
                    .send_to_connections(&room.connection_ids(), &left.to_json())
                    .await;

                if self.state.timers.is_running(room_id).await {
                    self.state.timers.schedule_leave_grace(room_id).await;
                }
            }
            LeaveOutcome::RoomDeleted { .. } => {
                // Nobody left to notify; the running meeting still gets its
                // grace window in case this was a transient double-drop.
                if self.state.timers.is_running(room_id).await {
                    self.state.timers.schedule_leave_grace(room_id).await;
                }
            }
            LeaveOutcome::NotInRoom | LeaveOutcome::RoomNotFound => {
                debug!(
                    connection_id = %connection_id,
                    room_id = %room_id,
                    "Leave for a room the connection is not in"
                );
            }
        }
    }

    async fn send_error(&self, connection_id: Uuid, message: String) {
        let error = WireMessage::error(message);
        self.state
            .connections
            .send_to_connection(&connection_id, &error.to_json())
            .await;
    }
}

fn parse<T: serde::de::DeserializeOwned>(payload: serde_json::Value) -> Result<T, AppError> {
    serde_json::from_value(payload)
        .map_err(|e| AppError::ValidationError(format!("invalid payload: {e}")))
}
