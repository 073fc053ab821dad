use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::models::{CachedRoomRecord, Participant, RoomModel};
use crate::store::CacheStore;

/// TTL on cached room metadata; generous next to meeting durations so only
/// genuinely abandoned records age out.
const ROOM_TTL: Duration = Duration::from_secs(4 * 60 * 60);

fn room_key(room_id: &str) -> String {
    format!("room:{room_id}")
}

/// Result of joining a room
#[derive(Debug, Clone)]
pub struct JoinOutcome {
    pub room: RoomModel,
    /// First participant creates the room.
    pub is_creator: bool,
    /// Members already present before this join.
    pub existing_peers: Vec<Participant>,
    /// True exactly when this join moved the count 1 -> 2; the only timer
    /// start trigger.
    pub reached_two: bool,
}

/// Result of leaving a room
#[derive(Debug, Clone)]
pub enum LeaveOutcome {
    /// Participant removed, others remain
    Left {
        room: RoomModel,
        participant: Participant,
    },
    /// Last participant removed; room deleted from memory and cache
    RoomDeleted {
        participant: Participant,
        meeting_id: Option<i64>,
    },
    /// The connection was not in the room
    NotInRoom,
    RoomNotFound,
}

/// Tracks participants per room and persists scalar metadata write-behind.
///
/// In-memory mutation happens synchronously under the lock before the async
/// cache write is issued, so in-process state is immediately consistent.
pub struct RoomManager {
    cache: Arc<dyn CacheStore>,
    rooms: RwLock<HashMap<String, RoomModel>>,
}

impl RoomManager {
    pub fn new(cache: Arc<dyn CacheStore>) -> Self {
        Self {
            cache,
            rooms: RwLock::new(HashMap::new()),
        }
    }

    /// Creates a room, generating an id when none is supplied.
    #[instrument(skip(self))]
    pub async fn create_room(&self, room_id: Option<String>) -> RoomModel {
        let id = room_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let room = RoomModel::new(id.clone());

        {
            let mut rooms = self.rooms.write().await;
            rooms.entry(id).or_insert_with(|| room.clone());
        }

        self.persist(&room).await;
        info!(room_id = %room.id, "Room created");
        room
    }

    /// Memory first; falls back to the cached scalar record (membership is
    /// never reconstructable from cache).
    pub async fn get_room(&self, room_id: &str) -> Option<RoomModel> {
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(room_id) {
                return Some(room.clone());
            }
        }

        match self.cache.get(&room_key(room_id)).await {
            Ok(Some(json)) => match serde_json::from_str::<CachedRoomRecord>(&json) {
                Ok(record) => {
                    debug!(room_id = %room_id, "Room reconstructed from cache metadata");
                    Some(record.into_room())
                }
                Err(e) => {
                    warn!(room_id = %room_id, error = %e, "Malformed cached room record");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                warn!(room_id = %room_id, error = %e, "Room lookup degraded to memory-only");
                None
            }
        }
    }

    /// Adds a participant, lazily creating the room. Joining twice with the
    /// same connection is a no-op rejoin.
    #[instrument(skip(self, participant), fields(connection_id = %participant.connection_id))]
    pub async fn join(&self, room_id: &str, participant: Participant) -> JoinOutcome {
        let outcome = {
            let mut rooms = self.rooms.write().await;
            let room = rooms
                .entry(room_id.to_string())
                .or_insert_with(|| RoomModel::new(room_id.to_string()));

            if room.has_connection(&participant.connection_id) {
                return JoinOutcome {
                    room: room.clone(),
                    is_creator: false,
                    existing_peers: Vec::new(),
                    reached_two: false,
                };
            }

            let existing_peers = room.participants.clone();
            let count_before = room.participant_count();
            room.participants.push(participant);

            JoinOutcome {
                room: room.clone(),
                is_creator: count_before == 0,
                existing_peers,
                reached_two: count_before == 1,
            }
        };

        self.persist(&outcome.room).await;
        info!(
            room_id = %room_id,
            participant_count = outcome.room.participant_count(),
            is_creator = outcome.is_creator,
            "Participant joined room"
        );
        outcome
    }

    /// Removes a participant; deletes the room from memory and cache when
    /// the count reaches zero.
    #[instrument(skip(self))]
    pub async fn leave(&self, room_id: &str, connection_id: &Uuid) -> LeaveOutcome {
        let outcome = {
            let mut rooms = self.rooms.write().await;
            let room = match rooms.get_mut(room_id) {
                Some(room) => room,
                None => return LeaveOutcome::RoomNotFound,
            };

            let position = room
                .participants
                .iter()
                .position(|p| p.connection_id == *connection_id);
            let participant = match position {
                Some(index) => room.participants.remove(index),
                None => return LeaveOutcome::NotInRoom,
            };

            if room.participants.is_empty() {
                let meeting_id = room.meeting_id;
                rooms.remove(room_id);
                LeaveOutcome::RoomDeleted {
                    participant,
                    meeting_id,
                }
            } else {
                LeaveOutcome::Left {
                    room: room.clone(),
                    participant,
                }
            }
        };

        match &outcome {
            LeaveOutcome::Left { room, .. } => {
                self.persist(room).await;
                info!(
                    room_id = %room_id,
                    participant_count = room.participant_count(),
                    "Participant left room"
                );
            }
            LeaveOutcome::RoomDeleted { .. } => {
                if let Err(e) = self.cache.delete(&room_key(room_id)).await {
                    warn!(room_id = %room_id, error = %e, "Failed to delete cached room");
                }
                info!(room_id = %room_id, "Room deleted after last participant left");
            }
            _ => {}
        }

        outcome
    }

    /// Binds the external meeting id to the room.
    #[instrument(skip(self))]
    pub async fn set_meeting_id(&self, room_id: &str, meeting_id: i64) {
        let updated = {
            let mut rooms = self.rooms.write().await;
            match rooms.get_mut(room_id) {
                Some(room) => {
                    room.meeting_id = Some(meeting_id);
                    Some(room.clone())
                }
                None => None,
            }
        };

        if let Some(room) = updated {
            self.persist(&room).await;
        }
    }

    /// Flips the one-shot timer flag. Returns false (no-op) when the timer
    /// was already started.
    #[instrument(skip(self))]
    pub async fn mark_timer_started(&self, room_id: &str, at: DateTime<Utc>) -> bool {
        let updated = {
            let mut rooms = self.rooms.write().await;
            match rooms.get_mut(room_id) {
                Some(room) if !room.timer_started => {
                    room.timer_started = true;
                    room.timer_started_at = Some(at);
                    Some(room.clone())
                }
                _ => None,
            }
        };

        match updated {
            Some(room) => {
                self.persist(&room).await;
                true
            }
            None => false,
        }
    }

    /// Current participant count, zero for unknown rooms. Grace-period
    /// checks re-read this at fire time.
    pub async fn participant_count(&self, room_id: &str) -> usize {
        let rooms = self.rooms.read().await;
        rooms
            .get(room_id)
            .map(|r| r.participant_count())
            .unwrap_or(0)
    }

    async fn persist(&self, room: &RoomModel) {
        let record = CachedRoomRecord::from_room(room);
        match serde_json::to_string(&record) {
            Ok(json) => {
                if let Err(e) = self.cache.set(&room_key(&room.id), &json, ROOM_TTL).await {
                    warn!(room_id = %room.id, error = %e, "Failed to mirror room to cache");
                }
            }
            Err(e) => warn!(room_id = %room.id, error = %e, "Failed to serialize room record"),
        }
    }
}
