// External meeting records: the only persistent relational surface this
// service touches. Reads validate the id; writes are the status
// transitions scheduled -> in_progress -> completed with timestamps.

pub mod models;
pub mod repository;

pub use models::{MeetingRecord, MeetingStatus};
pub use repository::{InMemoryMeetingRepository, MeetingRepository, PostgresMeetingRepository};
