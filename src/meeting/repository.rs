use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::{debug, instrument, warn};

use super::models::{MeetingRecord, MeetingStatus};
use crate::shared::AppError;

/// Trait for meeting record operations
///
/// The surface is deliberately narrow: one read for id validation and the
/// two status transitions this service owns.
#[async_trait]
pub trait MeetingRepository: Send + Sync {
    async fn get_meeting(&self, meeting_id: i64) -> Result<Option<MeetingRecord>, AppError>;

    /// scheduled -> in_progress with a start timestamp
    async fn mark_in_progress(
        &self,
        meeting_id: i64,
        started_at: DateTime<Utc>,
    ) -> Result<(), AppError>;

    /// in_progress -> completed with an end timestamp
    async fn mark_completed(
        &self,
        meeting_id: i64,
        ended_at: DateTime<Utc>,
    ) -> Result<(), AppError>;
}

/// In-memory implementation of MeetingRepository for development and testing
pub struct InMemoryMeetingRepository {
    meetings: Mutex<HashMap<i64, MeetingRecord>>,
}

impl Default for InMemoryMeetingRepository {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryMeetingRepository {
    /// Creates a new empty in-memory repository
    pub fn new() -> Self {
        Self {
            meetings: Mutex::new(HashMap::new()),
        }
    }

    /// Creates an in-memory repository pre-populated with scheduled meetings
    pub fn with_scheduled(meeting_ids: Vec<i64>) -> Self {
        let mut meetings = HashMap::new();
        for id in meeting_ids {
            meetings.insert(id, MeetingRecord::scheduled(id));
        }
        Self {
            meetings: Mutex::new(meetings),
        }
    }
}

#[async_trait]
impl MeetingRepository for InMemoryMeetingRepository {
    #[instrument(skip(self))]
    async fn get_meeting(&self, meeting_id: i64) -> Result<Option<MeetingRecord>, AppError> {
        let meetings = self.meetings.lock().unwrap();
        Ok(meetings.get(&meeting_id).cloned())
    }

    #[instrument(skip(self))]
    async fn mark_in_progress(
        &self,
        meeting_id: i64,
        started_at: DateTime<Utc>,
    ) -> Result<(), AppError> {
        let mut meetings = self.meetings.lock().unwrap();
        let meeting = meetings
            .get_mut(&meeting_id)
            .ok_or_else(|| AppError::NotFound(format!("Meeting {meeting_id} not found")))?;

        meeting.status = MeetingStatus::InProgress;
        meeting.started_at = Some(started_at);
        debug!(meeting_id = meeting_id, "Meeting marked in_progress in memory");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn mark_completed(
        &self,
        meeting_id: i64,
        ended_at: DateTime<Utc>,
    ) -> Result<(), AppError> {
        let mut meetings = self.meetings.lock().unwrap();
        let meeting = meetings
            .get_mut(&meeting_id)
            .ok_or_else(|| AppError::NotFound(format!("Meeting {meeting_id} not found")))?;

        meeting.status = MeetingStatus::Completed;
        meeting.ended_at = Some(ended_at);
        debug!(meeting_id = meeting_id, "Meeting marked completed in memory");
        Ok(())
    }
}

/// PostgreSQL implementation of MeetingRepository
pub struct PostgresMeetingRepository {
    pool: PgPool,
}

impl PostgresMeetingRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MeetingRepository for PostgresMeetingRepository {
    #[instrument(skip(self))]
    async fn get_meeting(&self, meeting_id: i64) -> Result<Option<MeetingRecord>, AppError> {
        debug!(meeting_id = meeting_id, "Fetching meeting from database");

        let row = sqlx::query("SELECT id, status, started_at, ended_at FROM meetings WHERE id = $1")
            .bind(meeting_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| {
                warn!(error = %e, meeting_id = meeting_id, "Failed to fetch meeting");
                AppError::DatabaseError(e.to_string())
            })?;

        let meeting = match row {
            Some(row) => {
                let status: String = row.get("status");
                let status = match status.as_str() {
                    "in_progress" => MeetingStatus::InProgress,
                    "completed" => MeetingStatus::Completed,
                    _ => MeetingStatus::Scheduled,
                };
                Some(MeetingRecord {
                    id: row.get("id"),
                    status,
                    started_at: row.get("started_at"),
                    ended_at: row.get("ended_at"),
                })
            }
            None => {
                debug!(meeting_id = meeting_id, "Meeting not found in database");
                None
            }
        };

        Ok(meeting)
    }

    #[instrument(skip(self))]
    async fn mark_in_progress(
        &self,
        meeting_id: i64,
        started_at: DateTime<Utc>,
    ) -> Result<(), AppError> {
        let result = sqlx::query(
            "UPDATE meetings SET status = 'in_progress', started_at = $2 WHERE id = $1",
        )
        .bind(meeting_id)
        .bind(started_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            warn!(error = %e, meeting_id = meeting_id, "Failed to mark meeting in_progress");
            AppError::DatabaseError(e.to_string())
        })?;

        if result.rows_affected() == 0 {
            warn!(meeting_id = meeting_id, "Meeting not found for start transition");
            return Err(AppError::NotFound("Meeting not found".to_string()));
        }

        debug!(meeting_id = meeting_id, "Meeting marked in_progress");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn mark_completed(
        &self,
        meeting_id: i64,
        ended_at: DateTime<Utc>,
    ) -> Result<(), AppError> {
        let result =
            sqlx::query("UPDATE meetings SET status = 'completed', ended_at = $2 WHERE id = $1")
                .bind(meeting_id)
                .bind(ended_at)
                .execute(&self.pool)
                .await
                .map_err(|e| {
                    warn!(error = %e, meeting_id = meeting_id, "Failed to mark meeting completed");
                    AppError::DatabaseError(e.to_string())
                })?;

        if result.rows_affected() == 0 {
            warn!(meeting_id = meeting_id, "Meeting not found for end transition");
            return Err(AppError::NotFound("Meeting not found".to_string()));
        }

        debug!(meeting_id = meeting_id, "Meeting marked completed");
        Ok(())
    }
}
