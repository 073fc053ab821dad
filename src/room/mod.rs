// Room/session tracking: participants, counts, and the one-shot timer
// trigger at two participants.

pub mod manager;
pub mod models;

pub use manager::{JoinOutcome, LeaveOutcome, RoomManager};
pub use models::{Participant, Role, RoomModel};
