// Meeting duration enforcement: countdown from the two-participant
// threshold, checkpoint warnings, and recovery from persisted timestamps
// after a process restart.

pub mod engine;

pub use engine::{EndReason, MeetingTimerEngine, TimerSnapshot};
