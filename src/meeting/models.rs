use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of an externally-scheduled meeting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MeetingStatus {
    Scheduled,
    InProgress,
    Completed,
}

impl MeetingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MeetingStatus::Scheduled => "scheduled",
            MeetingStatus::InProgress => "in_progress",
            MeetingStatus::Completed => "completed",
        }
    }
}

/// The slice of the scheduling domain's meeting row this service reads
/// and writes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeetingRecord {
    pub id: i64,
    pub status: MeetingStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl MeetingRecord {
    pub fn scheduled(id: i64) -> Self {
        Self {
            id,
            status: MeetingStatus::Scheduled,
            started_at: None,
            ended_at: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_serializes_snake_case() {
        let s = serde_json::to_string(&MeetingStatus::InProgress).unwrap();
        assert_eq!(s, "\"in_progress\"");
        assert_eq!(MeetingStatus::Completed.as_str(), "completed");
    }
}
