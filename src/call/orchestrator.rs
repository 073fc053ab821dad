use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::presence::PresenceTracker;
use crate::shared::AppError;
use crate::signaling::connection_manager::ConnectionManager;
use crate::signaling::messages::WireMessage;
use crate::store::CacheStore;

/// How long a ringing call waits for the student before timing out.
const CALL_TIMEOUT: Duration = Duration::from_secs(3 * 60);

/// Cache TTL backstop; outlives the timeout so a stale record can never
/// block a fresh request for long even if cleanup is missed.
const CALL_TTL: Duration = Duration::from_secs(5 * 60);

fn call_key(call_id: &str) -> String {
    format!("instant_call:{call_id}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    Pending,
    Accepted,
    Declined,
    Cancelled,
    TimedOut,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstantCall {
    pub call_id: String,
    pub volunteer_id: String,
    pub student_id: String,
    pub volunteer_name: String,
    /// Pre-allocated room both sides join on accept.
    pub room_id: String,
    pub status: CallStatus,
    pub created_at: DateTime<Utc>,
}

struct CallState {
    call: InstantCall,
    timeout_handle: Option<JoinHandle<()>>,
}

/// Drives instant calls from Pending to exactly one terminal status.
///
/// Every transition goes through a check-and-clear on the pending entry
/// under the call-table lock, so a response, a cancel, and the timeout can
/// race freely and only the first one wins.
pub struct InstantCallOrchestrator {
    cache: Arc<dyn CacheStore>,
    presence: Arc<PresenceTracker>,
    connections: Arc<dyn ConnectionManager>,
    calls: Mutex<HashMap<String, CallState>>,
}

impl InstantCallOrchestrator {
    pub fn new(
        cache: Arc<dyn CacheStore>,
        presence: Arc<PresenceTracker>,
        connections: Arc<dyn ConnectionManager>,
    ) -> Self {
        Self {
            cache,
            presence,
            connections,
            calls: Mutex::new(HashMap::new()),
        }
    }

    /// Starts a call from a volunteer to an online student. Returns the new
    /// call id.
    #[instrument(skip(self))]
    pub async fn request(
        self: &Arc<Self>,
        volunteer_id: &str,
        student_id: &str,
        volunteer_name: &str,
    ) -> Result<String, AppError> {
        if !self.presence.is_online(student_id).await {
            return Err(AppError::PreconditionFailed(format!(
                "student {student_id} is not online"
            )));
        }

        let call = {
            let mut calls = self.calls.lock().await;
            let already_ringing = calls.values().any(|state| {
                state.call.student_id == student_id && state.call.status == CallStatus::Pending
            });
            if already_ringing {
                return Err(AppError::PreconditionFailed(format!(
                    "student {student_id} already has a pending call"
                )));
            }

            let call = InstantCall {
                call_id: Uuid::new_v4().to_string(),
                volunteer_id: volunteer_id.to_string(),
                student_id: student_id.to_string(),
                volunteer_name: volunteer_name.to_string(),
                room_id: Uuid::new_v4().to_string(),
                status: CallStatus::Pending,
                created_at: Utc::now(),
            };
            calls.insert(
                call.call_id.clone(),
                CallState {
                    call: call.clone(),
                    timeout_handle: None,
                },
            );
            call
        };

        self.persist(&call).await;

        let incoming = WireMessage::instant_call_incoming(
            call.call_id.clone(),
            call.volunteer_id.clone(),
            call.volunteer_name.clone(),
            call.room_id.clone(),
        );
        self.send_to_user(student_id, &incoming).await;

        let sent = WireMessage::instant_call_sent(
            call.call_id.clone(),
            call.student_id.clone(),
            call.room_id.clone(),
        );
        self.send_to_user(volunteer_id, &sent).await;

        self.arm_timeout(call.call_id.clone()).await;

        info!(
            call_id = %call.call_id,
            volunteer_id = %volunteer_id,
            student_id = %student_id,
            "Instant call requested"
        );
        Ok(call.call_id)
    }

    /// Student's answer. Accept moves both sides toward the pre-allocated
    /// room; decline just notifies the volunteer.
    #[instrument(skip(self))]
    pub async fn respond(
        self: &Arc<Self>,
        call_id: &str,
        accepted: bool,
        student_id: &str,
    ) -> Result<(), AppError> {
        let status = if accepted {
            CallStatus::Accepted
        } else {
            CallStatus::Declined
        };

        let call = self
            .settle(call_id, status, Some(student_id), None)
            .await
            .ok_or_else(|| {
                AppError::PreconditionFailed(format!("call {call_id} is no longer pending"))
            })?;

        if accepted {
            let accepted_message =
                WireMessage::instant_call_accepted(call.call_id.clone(), call.room_id.clone());
            self.send_to_user(&call.volunteer_id, &accepted_message).await;
            self.send_to_user(&call.student_id, &accepted_message).await;
            info!(call_id = %call_id, room_id = %call.room_id, "Instant call accepted");
        } else {
            let declined_message = WireMessage::instant_call_declined(call.call_id.clone());
            self.send_to_user(&call.volunteer_id, &declined_message).await;
            info!(call_id = %call_id, "Instant call declined");
        }
        Ok(())
    }

    /// Volunteer withdraws a still-ringing call.
    #[instrument(skip(self))]
    pub async fn cancel(
        self: &Arc<Self>,
        call_id: &str,
        volunteer_id: &str,
    ) -> Result<(), AppError> {
        let call = self
            .settle(call_id, CallStatus::Cancelled, None, Some(volunteer_id))
            .await
            .ok_or_else(|| {
                AppError::PreconditionFailed(format!("call {call_id} is no longer pending"))
            })?;

        let cancelled = WireMessage::instant_call_cancelled(call.call_id.clone(), None);
        self.send_to_user(&call.student_id, &cancelled).await;
        info!(call_id = %call_id, "Instant call cancelled by volunteer");
        Ok(())
    }

    pub async fn status_of(&self, call_id: &str) -> Option<CallStatus> {
        let calls = self.calls.lock().await;
        calls.get(call_id).map(|state| state.call.status)
    }

    /// The single transition point: clears the pending entry, aborts its
    /// timeout, deletes the cache record. Returns None when the call is
    /// unknown, already terminal, or owned by someone else.
    async fn settle(
        &self,
        call_id: &str,
        status: CallStatus,
        expect_student: Option<&str>,
        expect_volunteer: Option<&str>,
    ) -> Option<InstantCall> {
        let state = {
            let mut calls = self.calls.lock().await;
            let pending = match calls.get(call_id) {
                Some(state) if state.call.status == CallStatus::Pending => state,
                _ => return None,
            };
            if expect_student.is_some_and(|id| pending.call.student_id != id) {
                return None;
            }
            if expect_volunteer.is_some_and(|id| pending.call.volunteer_id != id) {
                return None;
            }
            let mut state = calls.remove(call_id)?;
            state.call.status = status;
            state
        };

        if let Some(handle) = state.timeout_handle {
            handle.abort();
        }
        if let Err(e) = self.cache.delete(&call_key(call_id)).await {
            warn!(call_id = %call_id, error = %e, "Failed to delete cached call record");
        }
        Some(state.call)
    }

    async fn arm_timeout(self: &Arc<Self>, call_id: String) {
        let orchestrator = Arc::clone(self);
        let timeout_call = call_id.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(CALL_TIMEOUT).await;

            // Detach our own handle first; settle aborts whatever handle is
            // still attached, and aborting ourselves would drop the cache
            // cleanup and the timeout notifications below.
            {
                let mut calls = orchestrator.calls.lock().await;
                if let Some(state) = calls.get_mut(&timeout_call) {
                    let _ = state.timeout_handle.take();
                }
            }

            // Re-check at fire time; a response that won the race already
            // cleared the entry and this settles to None.
            let Some(call) = orchestrator
                .settle(&timeout_call, CallStatus::TimedOut, None, None)
                .await
            else {
                return;
            };

            info!(call_id = %timeout_call, "Instant call timed out");
            let cancelled = WireMessage::instant_call_cancelled(
                call.call_id.clone(),
                Some("timeout".to_string()),
            );
            orchestrator.send_to_user(&call.volunteer_id, &cancelled).await;
            orchestrator.send_to_user(&call.student_id, &cancelled).await;
        });

        let mut calls = self.calls.lock().await;
        if let Some(state) = calls.get_mut(&call_id) {
            state.timeout_handle = Some(handle);
        } else {
            // Settled before the timeout was armed
            handle.abort();
        }
    }

    async fn send_to_user(&self, user_id: &str, message: &WireMessage) {
        let targets = self.presence.connections_for(user_id).await;
        if targets.is_empty() {
            debug!(user_id = %user_id, "No live connections for call notification");
            return;
        }
        self.connections
            .send_to_connections(&targets, &message.to_json())
            .await;
    }

    async fn persist(&self, call: &InstantCall) {
        match serde_json::to_string(call) {
            Ok(json) => {
                if let Err(e) = self.cache.set(&call_key(&call.call_id), &json, CALL_TTL).await {
                    warn!(call_id = %call.call_id, error = %e, "Failed to persist call record");
                }
            }
            Err(e) => warn!(call_id = %call.call_id, error = %e, "Failed to serialize call record"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::room::Role;
    use crate::signaling::connection_manager::InMemoryConnectionManager;
    use crate::store::InMemoryCacheStore;
    use tokio::sync::mpsc;

    struct Harness {
        orchestrator: Arc<InstantCallOrchestrator>,
        presence: Arc<PresenceTracker>,
        cache: Arc<InMemoryCacheStore>,
        connections: Arc<InMemoryConnectionManager>,
    }

    fn harness() -> Harness {
        let cache = Arc::new(InMemoryCacheStore::new());
        let connections = Arc::new(InMemoryConnectionManager::new());
        let presence = Arc::new(PresenceTracker::new(
            Arc::clone(&cache) as Arc<dyn CacheStore>,
            Arc::clone(&connections) as Arc<dyn ConnectionManager>,
        ));
        let orchestrator = Arc::new(InstantCallOrchestrator::new(
            Arc::clone(&cache) as Arc<dyn CacheStore>,
            Arc::clone(&presence),
            Arc::clone(&connections) as Arc<dyn ConnectionManager>,
        ));
        Harness {
            orchestrator,
            presence,
            cache,
            connections,
        }
    }

    async fn online(h: &Harness, user_id: &str, role: Role) -> mpsc::UnboundedReceiver<String> {
        let (tx, rx) = mpsc::unbounded_channel();
        let connection_id = Uuid::new_v4();
        h.connections.add_connection(connection_id, tx).await;
        h.presence.register(user_id, role, connection_id).await;
        rx
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<String>) -> Vec<String> {
        let mut out = Vec::new();
        while let Ok(message) = rx.try_recv() {
            out.push(message);
        }
        out
    }

    #[tokio::test]
    async fn test_request_notifies_both_sides() {
        let h = harness();
        let mut volunteer_rx = online(&h, "v1", Role::Volunteer).await;
        let mut student_rx = online(&h, "s1", Role::Student).await;

        let call_id = h.orchestrator.request("v1", "s1", "Alex").await.unwrap();

        let student_messages = drain(&mut student_rx);
        let incoming = student_messages
            .iter()
            .find(|m| m.contains("instant-call-incoming"))
            .expect("student rung");
        assert!(incoming.contains(&call_id));
        assert!(incoming.contains("Alex"));

        let volunteer_messages = drain(&mut volunteer_rx);
        assert!(volunteer_messages
            .iter()
            .any(|m| m.contains("instant-call-sent")));

        assert!(h
            .cache
            .exists(&format!("instant_call:{call_id}"))
            .await
            .unwrap());
        assert_eq!(
            h.orchestrator.status_of(&call_id).await,
            Some(CallStatus::Pending)
        );
    }

    #[tokio::test]
    async fn test_request_rejected_when_student_offline() {
        let h = harness();
        online(&h, "v1", Role::Volunteer).await;

        let result = h.orchestrator.request("v1", "s1", "Alex").await;
        assert!(matches!(result, Err(AppError::PreconditionFailed(_))));
    }

    #[tokio::test]
    async fn test_request_rejected_while_student_already_ringing() {
        let h = harness();
        online(&h, "v1", Role::Volunteer).await;
        online(&h, "v2", Role::Volunteer).await;
        online(&h, "s1", Role::Student).await;

        h.orchestrator.request("v1", "s1", "Alex").await.unwrap();
        let second = h.orchestrator.request("v2", "s1", "Sam").await;
        assert!(matches!(second, Err(AppError::PreconditionFailed(_))));
    }

    #[tokio::test]
    async fn test_accept_reaches_both_sides_with_room() {
        let h = harness();
        let mut volunteer_rx = online(&h, "v1", Role::Volunteer).await;
        let mut student_rx = online(&h, "s1", Role::Student).await;

        let call_id = h.orchestrator.request("v1", "s1", "Alex").await.unwrap();
        drain(&mut volunteer_rx);
        drain(&mut student_rx);

        h.orchestrator.respond(&call_id, true, "s1").await.unwrap();

        for rx in [&mut volunteer_rx, &mut student_rx] {
            let accepted = drain(rx)
                .into_iter()
                .find(|m| m.contains("instant-call-accepted"))
                .expect("accepted event");
            assert!(accepted.contains("roomId"));
        }
        assert!(!h
            .cache
            .exists(&format!("instant_call:{call_id}"))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_decline_notifies_volunteer_only() {
        let h = harness();
        let mut volunteer_rx = online(&h, "v1", Role::Volunteer).await;
        let mut student_rx = online(&h, "s1", Role::Student).await;

        let call_id = h.orchestrator.request("v1", "s1", "Alex").await.unwrap();
        drain(&mut volunteer_rx);
        drain(&mut student_rx);

        h.orchestrator.respond(&call_id, false, "s1").await.unwrap();

        assert!(drain(&mut volunteer_rx)
            .iter()
            .any(|m| m.contains("instant-call-declined")));
        assert!(!drain(&mut student_rx)
            .iter()
            .any(|m| m.contains("instant-call-declined")));
    }

    #[tokio::test]
    async fn test_terminal_transition_is_exactly_once() {
        let h = harness();
        online(&h, "v1", Role::Volunteer).await;
        online(&h, "s1", Role::Student).await;

        let call_id = h.orchestrator.request("v1", "s1", "Alex").await.unwrap();

        h.orchestrator.respond(&call_id, true, "s1").await.unwrap();
        assert!(matches!(
            h.orchestrator.respond(&call_id, false, "s1").await,
            Err(AppError::PreconditionFailed(_))
        ));
        assert!(matches!(
            h.orchestrator.cancel(&call_id, "v1").await,
            Err(AppError::PreconditionFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_respond_from_wrong_student_is_rejected() {
        let h = harness();
        online(&h, "v1", Role::Volunteer).await;
        online(&h, "s1", Role::Student).await;

        let call_id = h.orchestrator.request("v1", "s1", "Alex").await.unwrap();

        assert!(matches!(
            h.orchestrator.respond(&call_id, true, "s2").await,
            Err(AppError::PreconditionFailed(_))
        ));
        assert_eq!(
            h.orchestrator.status_of(&call_id).await,
            Some(CallStatus::Pending)
        );
    }

    #[tokio::test]
    async fn test_cancel_notifies_student() {
        let h = harness();
        online(&h, "v1", Role::Volunteer).await;
        let mut student_rx = online(&h, "s1", Role::Student).await;

        let call_id = h.orchestrator.request("v1", "s1", "Alex").await.unwrap();
        drain(&mut student_rx);

        h.orchestrator.cancel(&call_id, "v1").await.unwrap();

        assert!(drain(&mut student_rx)
            .iter()
            .any(|m| m.contains("instant-call-cancelled")));
        assert!(h.orchestrator.status_of(&call_id).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_fires_and_late_accept_is_noop() {
        let h = harness();
        let mut volunteer_rx = online(&h, "v1", Role::Volunteer).await;
        let mut student_rx = online(&h, "s1", Role::Student).await;

        let call_id = h.orchestrator.request("v1", "s1", "Alex").await.unwrap();
        drain(&mut volunteer_rx);
        drain(&mut student_rx);

        // Let the timeout task register its timer before advancing
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        tokio::time::advance(CALL_TIMEOUT + Duration::from_secs(1)).await;
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        for rx in [&mut volunteer_rx, &mut student_rx] {
            let cancelled = drain(rx)
                .into_iter()
                .find(|m| m.contains("instant-call-cancelled"))
                .expect("timeout notification");
            assert!(cancelled.contains("timeout"));
        }

        assert!(matches!(
            h.orchestrator.respond(&call_id, true, "s1").await,
            Err(AppError::PreconditionFailed(_))
        ));

        // The student is callable again after the timeout
        h.orchestrator.request("v1", "s1", "Alex").await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_notifies_over_yielding_cache() {
        use crate::store::cache::test_support::YieldingCacheStore;

        // Real cache I/O suspends at every operation; the timeout task must
        // survive its own cancellation bookkeeping and still deliver the
        // timeout notices to both sides.
        let cache = Arc::new(YieldingCacheStore::new());
        let connections = Arc::new(InMemoryConnectionManager::new());
        let presence = Arc::new(PresenceTracker::new(
            Arc::clone(&cache) as Arc<dyn CacheStore>,
            Arc::clone(&connections) as Arc<dyn ConnectionManager>,
        ));
        let orchestrator = Arc::new(InstantCallOrchestrator::new(
            Arc::clone(&cache) as Arc<dyn CacheStore>,
            Arc::clone(&presence),
            Arc::clone(&connections) as Arc<dyn ConnectionManager>,
        ));

        let (tx_v, mut volunteer_rx) = mpsc::unbounded_channel();
        let volunteer_conn = Uuid::new_v4();
        connections.add_connection(volunteer_conn, tx_v).await;
        presence.register("v1", Role::Volunteer, volunteer_conn).await;

        let (tx_s, mut student_rx) = mpsc::unbounded_channel();
        let student_conn = Uuid::new_v4();
        connections.add_connection(student_conn, tx_s).await;
        presence.register("s1", Role::Student, student_conn).await;

        let call_id = orchestrator.request("v1", "s1", "Alex").await.unwrap();
        drain(&mut volunteer_rx);
        drain(&mut student_rx);

        // Let the timeout task register its timer before advancing
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        tokio::time::advance(CALL_TIMEOUT + Duration::from_secs(1)).await;
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        for rx in [&mut volunteer_rx, &mut student_rx] {
            let cancelled = drain(rx)
                .into_iter()
                .find(|m| m.contains("instant-call-cancelled"))
                .expect("timeout notification");
            assert!(cancelled.contains("timeout"));
        }
        assert!(orchestrator.status_of(&call_id).await.is_none());
    }
}
