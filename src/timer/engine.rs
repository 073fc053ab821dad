use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, error, info, instrument, warn};

use crate::config::{ConfigService, MeetingTimerConfig};
use crate::meeting::repository::MeetingRepository;
use crate::room::RoomManager;
use crate::signaling::connection_manager::ConnectionManager;
use crate::signaling::messages::{TimerStartPayload, WireMessage};
use crate::store::CacheStore;

/// Elapsed-time polling beat; short relative to minute-scale checkpoints.
const POLL_INTERVAL: Duration = Duration::from_secs(10);

/// How long a disconnection is tolerated before the meeting is ended.
const LEAVE_GRACE_PERIOD: Duration = Duration::from_secs(2 * 60);

/// Slack added to the persisted record's TTL beyond the meeting duration.
const TIMER_TTL_SLACK: Duration = Duration::from_secs(15 * 60);

fn timer_key(room_id: &str) -> String {
    format!("meeting_timer:{room_id}")
}

/// Wall-clock anchored to the tokio runtime's clock. Identical to
/// `Utc::now()` in production, but advances with paused test time.
struct Clock {
    base_wall: DateTime<Utc>,
    base_instant: tokio::time::Instant,
}

impl Clock {
    fn new() -> Self {
        Self {
            base_wall: Utc::now(),
            base_instant: tokio::time::Instant::now(),
        }
    }

    fn now(&self) -> DateTime<Utc> {
        self.base_wall
            + ChronoDuration::from_std(self.base_instant.elapsed()).unwrap_or_default()
    }
}

/// Why a meeting ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    TimerExpired,
    Manual,
    ParticipantLeft,
}

impl EndReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            EndReason::TimerExpired => "timer_expired",
            EndReason::Manual => "manual",
            EndReason::ParticipantLeft => "participant_left",
        }
    }
}

/// Persisted timer record; everything recovery needs lives here. The poll
/// handle is process-local and recomputed, never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct TimerRecord {
    meeting_id: i64,
    started_at: DateTime<Utc>,
    ends_at: DateTime<Utc>,
    warned_first: bool,
    warned_second: bool,
    config: MeetingTimerConfig,
}

struct TimerState {
    record: TimerRecord,
    poll_handle: Option<JoinHandle<()>>,
}

/// Read-only view of a running timer
#[derive(Debug, Clone)]
pub struct TimerSnapshot {
    pub meeting_id: i64,
    pub started_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    pub warned_first: bool,
    pub warned_second: bool,
}

/// Drives meeting countdowns: NotStarted -> Running -> warnings -> Ended.
///
/// All scheduling handles are stored here and aborted before their owning
/// state is discarded; timeout-driven actions re-validate live state at
/// fire time instead of trusting values captured at schedule time.
pub struct MeetingTimerEngine {
    cache: Arc<dyn CacheStore>,
    meeting_repository: Arc<dyn MeetingRepository>,
    rooms: Arc<RoomManager>,
    connections: Arc<dyn ConnectionManager>,
    config: Arc<ConfigService>,
    redirect_url: String,
    clock: Clock,
    timers: Mutex<HashMap<String, TimerState>>,
    grace_handles: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl MeetingTimerEngine {
    pub fn new(
        cache: Arc<dyn CacheStore>,
        meeting_repository: Arc<dyn MeetingRepository>,
        rooms: Arc<RoomManager>,
        connections: Arc<dyn ConnectionManager>,
        config: Arc<ConfigService>,
        redirect_url: String,
    ) -> Self {
        Self {
            cache,
            meeting_repository,
            rooms,
            connections,
            config,
            redirect_url,
            clock: Clock::new(),
            timers: Mutex::new(HashMap::new()),
            grace_handles: Mutex::new(HashMap::new()),
        }
    }

    /// Starts the countdown for a room. Idempotent: repeated calls for the
    /// same room are no-ops.
    #[instrument(skip(self))]
    pub async fn start(self: &Arc<Self>, room_id: &str, meeting_id: i64) {
        {
            let timers = self.timers.lock().await;
            if timers.contains_key(room_id) {
                debug!(room_id = %room_id, "Timer already running, start is a no-op");
                return;
            }
        }

        let now = self.clock.now();
        if !self.rooms.mark_timer_started(room_id, now).await {
            debug!(room_id = %room_id, "Room timer flag already set, start is a no-op");
            return;
        }

        // Snapshot: in-flight meetings keep the config they started with.
        let config = self.config.current().await;
        let ends_at = now + ChronoDuration::milliseconds(config.duration_ms);
        let record = TimerRecord {
            meeting_id,
            started_at: now,
            ends_at,
            warned_first: false,
            warned_second: false,
            config: config.clone(),
        };

        {
            let mut timers = self.timers.lock().await;
            timers.insert(
                room_id.to_string(),
                TimerState {
                    record: record.clone(),
                    poll_handle: None,
                },
            );
        }

        self.persist_record(room_id, &record).await;

        if let Err(e) = self.meeting_repository.mark_in_progress(meeting_id, now).await {
            warn!(
                room_id = %room_id,
                meeting_id = meeting_id,
                error = %e,
                "Failed to mark meeting in_progress, continuing"
            );
        }

        let start_message = WireMessage::meeting_timer_start(TimerStartPayload {
            room_id: room_id.to_string(),
            meeting_id,
            duration_ms: config.duration_ms,
            start_time: now,
            end_time: ends_at,
            warnings: vec![
                config.first_warning_remaining_ms,
                config.second_warning_remaining_ms,
            ],
        });
        self.send_to_room(room_id, &start_message).await;

        info!(
            room_id = %room_id,
            meeting_id = meeting_id,
            duration_ms = config.duration_ms,
            "Meeting timer started"
        );

        self.spawn_poll(room_id.to_string()).await;
    }

    /// Ends the meeting now, whatever the trigger.
    #[instrument(skip(self))]
    pub async fn end(self: &Arc<Self>, room_id: &str, reason: EndReason) {
        self.end_inner(room_id, reason, true).await;
    }

    /// Shared ending path. `abort_poll` is false when the poll task itself
    /// is the caller; it exits its loop after this returns.
    async fn end_inner(self: &Arc<Self>, room_id: &str, reason: EndReason, abort_poll: bool) {
        let removed = {
            let mut timers = self.timers.lock().await;
            timers.remove(room_id)
        };

        let meeting_id = match removed {
            Some(state) => {
                if abort_poll {
                    if let Some(handle) = state.poll_handle {
                        handle.abort();
                    }
                }
                Some(state.record.meeting_id)
            }
            None => None,
        };

        self.cancel_leave_grace(room_id).await;

        let Some(meeting_id) = meeting_id else {
            debug!(room_id = %room_id, "No running timer to end");
            return;
        };

        self.finalize(room_id, meeting_id, reason).await;
    }

    /// Terminal work: cache cleanup, status write, notifications, forced
    /// disconnect. Uniform for every end reason.
    async fn finalize(self: &Arc<Self>, room_id: &str, meeting_id: i64, reason: EndReason) {
        if let Err(e) = self.cache.delete(&timer_key(room_id)).await {
            warn!(room_id = %room_id, error = %e, "Failed to delete persisted timer record");
        }

        // The termination notice below goes out even if this write fails;
        // a missed status write is reconcilable later, a missed notice is not.
        if let Err(e) = self
            .meeting_repository
            .mark_completed(meeting_id, self.clock.now())
            .await
        {
            error!(
                room_id = %room_id,
                meeting_id = meeting_id,
                error = %e,
                "Failed to mark meeting completed"
            );
        }

        let member_connections = self
            .rooms
            .get_room(room_id)
            .await
            .map(|room| room.connection_ids())
            .unwrap_or_default();

        let auto_end = WireMessage::meeting_auto_end(reason.as_str().to_string());
        let force_end = WireMessage::meeting_force_end(
            reason.as_str().to_string(),
            self.redirect_url.clone(),
        );
        self.connections
            .send_to_connections(&member_connections, &auto_end.to_json())
            .await;
        self.connections
            .send_to_connections(&member_connections, &force_end.to_json())
            .await;

        for connection_id in &member_connections {
            self.connections.close_connection(connection_id).await;
        }

        info!(
            room_id = %room_id,
            meeting_id = meeting_id,
            reason = reason.as_str(),
            "Meeting ended"
        );
    }

    /// One poll beat. Returns true when the timer is finished or gone.
    async fn poll_once(self: &Arc<Self>, room_id: &str) -> bool {
        let now = self.clock.now();
        let due = {
            let mut timers = self.timers.lock().await;
            let state = match timers.get_mut(room_id) {
                Some(state) => state,
                None => return true,
            };

            let remaining_ms = (state.record.ends_at - now).num_milliseconds();
            if remaining_ms <= 0 {
                PollAction::Expired
            } else if !state.record.warned_first
                && remaining_ms <= state.record.config.first_warning_remaining_ms
            {
                state.record.warned_first = true;
                PollAction::Warn(state.record.clone(), remaining_ms)
            } else if !state.record.warned_second
                && remaining_ms <= state.record.config.second_warning_remaining_ms
            {
                state.record.warned_second = true;
                PollAction::Warn(state.record.clone(), remaining_ms)
            } else {
                PollAction::Nothing
            }
        };

        match due {
            PollAction::Expired => {
                self.end_inner(room_id, EndReason::TimerExpired, false).await;
                true
            }
            PollAction::Warn(record, remaining_ms) => {
                self.persist_record(room_id, &record).await;
                let minutes = remaining_ms / 60_000;
                let message = WireMessage::meeting_timer_warning(
                    remaining_ms,
                    format!("{minutes} minutes remaining in this meeting"),
                );
                self.send_to_room(room_id, &message).await;
                info!(room_id = %room_id, remaining_ms = remaining_ms, "Meeting warning sent");
                false
            }
            PollAction::Nothing => false,
        }
    }

    async fn spawn_poll(self: &Arc<Self>, room_id: String) {
        let engine = Arc::clone(self);
        let poll_room = room_id.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = interval(POLL_INTERVAL);
            ticker.tick().await; // first tick resolves immediately
            loop {
                ticker.tick().await;
                if engine.poll_once(&poll_room).await {
                    break;
                }
            }
        });

        let mut timers = self.timers.lock().await;
        if let Some(state) = timers.get_mut(&room_id) {
            state.poll_handle = Some(handle);
        } else {
            // Timer ended between insert and spawn; don't leak the task.
            handle.abort();
        }
    }

    /// Schedules the post-disconnect re-check. Only ends the meeting if the
    /// room is still at or below one participant when the grace fires.
    #[instrument(skip(self))]
    pub async fn schedule_leave_grace(self: &Arc<Self>, room_id: &str) {
        let engine = Arc::clone(self);
        let grace_room = room_id.to_string();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(LEAVE_GRACE_PERIOD).await;

            // Drop our own handle before ending; the shared ending path
            // cancels pending grace tasks, and aborting ourselves here would
            // cut off the completion write and the termination notices.
            engine.grace_handles.lock().await.remove(&grace_room);

            // Re-validate at fire time; a reconnect within the window wins.
            let count = engine.rooms.participant_count(&grace_room).await;
            if count <= 1 {
                info!(
                    room_id = %grace_room,
                    participant_count = count,
                    "Grace period expired, ending meeting"
                );
                engine.end(&grace_room, EndReason::ParticipantLeft).await;
            } else {
                debug!(room_id = %grace_room, "Room refilled during grace period");
            }
        });

        let mut handles = self.grace_handles.lock().await;
        if let Some(previous) = handles.insert(room_id.to_string(), handle) {
            previous.abort();
        }
        debug!(room_id = %room_id, "Leave grace period scheduled");
    }

    /// Cancels a pending grace re-check, if any.
    pub async fn cancel_leave_grace(&self, room_id: &str) {
        let mut handles = self.grace_handles.lock().await;
        if let Some(handle) = handles.remove(room_id) {
            handle.abort();
            debug!(room_id = %room_id, "Leave grace period cancelled");
        }
    }

    /// Scans persisted timer records and resumes or finishes each one.
    ///
    /// Remaining time comes from the persisted end timestamp; warning flags
    /// are recomputed retroactively so a delayed recovery never re-emits a
    /// stale warning. A record already past its end performs the Ended
    /// transition immediately, without waiting a polling interval.
    #[instrument(skip(self))]
    pub async fn recover(self: &Arc<Self>) {
        let keys = match self.cache.scan("meeting_timer:").await {
            Ok(keys) => keys,
            Err(e) => {
                error!(error = %e, "Timer recovery scan failed");
                return;
            }
        };

        if keys.is_empty() {
            info!("No persisted timers to recover");
            return;
        }

        info!(count = keys.len(), "Recovering persisted meeting timers");
        for key in keys {
            let room_id = match key.strip_prefix("meeting_timer:") {
                Some(room_id) => room_id.to_string(),
                None => continue,
            };

            let record = match self.cache.get(&key).await {
                Ok(Some(json)) => match serde_json::from_str::<TimerRecord>(&json) {
                    Ok(record) => record,
                    Err(e) => {
                        warn!(room_id = %room_id, error = %e, "Dropping malformed timer record");
                        let _ = self.cache.delete(&key).await;
                        continue;
                    }
                },
                Ok(None) => continue,
                Err(e) => {
                    warn!(room_id = %room_id, error = %e, "Failed to read timer record");
                    continue;
                }
            };

            let remaining_ms = (record.ends_at - self.clock.now()).num_milliseconds();
            if remaining_ms <= 0 {
                info!(
                    room_id = %room_id,
                    meeting_id = record.meeting_id,
                    "Recovered timer already expired, ending immediately"
                );
                self.finalize(&room_id, record.meeting_id, EndReason::TimerExpired)
                    .await;
                continue;
            }

            let recovered = TimerRecord {
                warned_first: remaining_ms <= record.config.first_warning_remaining_ms,
                warned_second: remaining_ms <= record.config.second_warning_remaining_ms,
                ..record
            };

            info!(
                room_id = %room_id,
                meeting_id = recovered.meeting_id,
                remaining_ms = remaining_ms,
                "Resuming recovered timer"
            );
            {
                let mut timers = self.timers.lock().await;
                timers.insert(
                    room_id.clone(),
                    TimerState {
                        record: recovered,
                        poll_handle: None,
                    },
                );
            }
            self.spawn_poll(room_id).await;
        }
    }

    /// Read-only view of a running timer; elapsed/remaining derive from the
    /// persisted start and end timestamps.
    pub async fn snapshot(&self, room_id: &str) -> Option<TimerSnapshot> {
        let timers = self.timers.lock().await;
        timers.get(room_id).map(|state| TimerSnapshot {
            meeting_id: state.record.meeting_id,
            started_at: state.record.started_at,
            ends_at: state.record.ends_at,
            warned_first: state.record.warned_first,
            warned_second: state.record.warned_second,
        })
    }

    pub async fn is_running(&self, room_id: &str) -> bool {
        self.timers.lock().await.contains_key(room_id)
    }

    async fn persist_record(&self, room_id: &str, record: &TimerRecord) {
        let ttl = Duration::from_millis(record.config.duration_ms.max(0) as u64) + TIMER_TTL_SLACK;
        match serde_json::to_string(record) {
            Ok(json) => {
                if let Err(e) = self.cache.set(&timer_key(room_id), &json, ttl).await {
                    warn!(room_id = %room_id, error = %e, "Failed to persist timer record");
                }
            }
            Err(e) => warn!(room_id = %room_id, error = %e, "Failed to serialize timer record"),
        }
    }

    async fn send_to_room(&self, room_id: &str, message: &WireMessage) {
        let member_connections = self
            .rooms
            .get_room(room_id)
            .await
            .map(|room| room.connection_ids())
            .unwrap_or_default();
        self.connections
            .send_to_connections(&member_connections, &message.to_json())
            .await;
    }
}

enum PollAction {
    Expired,
    Warn(TimerRecord, i64),
    Nothing,
}
