use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The two sides of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Volunteer,
    Student,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Volunteer => "volunteer",
            Role::Student => "student",
        }
    }
}

/// A room member. Immutable once created; removed wholesale on leave.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Participant {
    pub connection_id: Uuid,
    /// Routing key used by clients to address each other in signaling.
    pub peer_id: String,
    pub role: Role,
    pub user_id: String,
    pub joined_at: DateTime<Utc>,
}

impl Participant {
    pub fn new(connection_id: Uuid, peer_id: String, role: Role, user_id: String) -> Self {
        Self {
            connection_id,
            peer_id,
            role,
            user_id,
            joined_at: Utc::now(),
        }
    }
}

/// A two-party signaling session container.
///
/// Live membership is authoritative only in this process; the cache carries
/// scalar metadata so other instances and restarts can see counts and timer
/// flags, but never membership.
#[derive(Debug, Clone)]
pub struct RoomModel {
    pub id: String,
    pub meeting_id: Option<i64>,
    pub participants: Vec<Participant>,
    pub created_at: DateTime<Utc>,
    pub timer_started: bool,
    pub timer_started_at: Option<DateTime<Utc>>,
}

impl RoomModel {
    pub fn new(id: String) -> Self {
        Self {
            id,
            meeting_id: None,
            participants: Vec::new(),
            created_at: Utc::now(),
            timer_started: false,
            timer_started_at: None,
        }
    }

    pub fn participant_count(&self) -> usize {
        self.participants.len()
    }

    pub fn has_connection(&self, connection_id: &Uuid) -> bool {
        self.participants
            .iter()
            .any(|p| p.connection_id == *connection_id)
    }

    pub fn connection_ids(&self) -> Vec<Uuid> {
        self.participants.iter().map(|p| p.connection_id).collect()
    }

    /// Connections of everyone except the given sender. The relay uses this
    /// for verbatim signaling forwarding.
    pub fn other_connection_ids(&self, sender: &Uuid) -> Vec<Uuid> {
        self.participants
            .iter()
            .filter(|p| p.connection_id != *sender)
            .map(|p| p.connection_id)
            .collect()
    }
}

/// Scalar room metadata mirrored into the cache (membership excluded)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedRoomRecord {
    pub room_id: String,
    pub meeting_id: Option<i64>,
    pub participant_count: usize,
    pub created_at: DateTime<Utc>,
    pub timer_started: bool,
    pub timer_started_at: Option<DateTime<Utc>>,
}

impl CachedRoomRecord {
    pub fn from_room(room: &RoomModel) -> Self {
        Self {
            room_id: room.id.clone(),
            meeting_id: room.meeting_id,
            participant_count: room.participant_count(),
            created_at: room.created_at,
            timer_started: room.timer_started,
            timer_started_at: room.timer_started_at,
        }
    }

    /// Rebuilds a room shell after failover. Membership is not
    /// reconstructable from cache, so the participant list starts empty.
    pub fn into_room(self) -> RoomModel {
        RoomModel {
            id: self.room_id,
            meeting_id: self.meeting_id,
            participants: Vec::new(),
            created_at: self.created_at,
            timer_started: self.timer_started,
            timer_started_at: self.timer_started_at,
        }
    }
}
