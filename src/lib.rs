// Library crate for the meeting session-coordination server
// This file exposes the public API for integration tests

pub mod call;
pub mod config;
pub mod meeting;
pub mod presence;
pub mod room;
pub mod shared;
pub mod signaling;
pub mod store;
pub mod timer;

// Re-export commonly used types for easier access in tests
pub use call::{CallStatus, InstantCallOrchestrator};
pub use config::{ConfigService, MeetingTimerConfig};
pub use meeting::{MeetingRepository, MeetingStatus};
pub use presence::PresenceTracker;
pub use room::{Participant, Role, RoomManager, RoomModel};
pub use shared::{AppError, AppState};
pub use signaling::{ConnectionManager, MessageRouter, MessageType, WireMessage};
pub use store::CacheStore;
pub use timer::{EndReason, MeetingTimerEngine};
