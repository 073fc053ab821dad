use std::sync::Arc;
use uuid::Uuid;

use meetbridge::config::{ConfigService, MeetingTimerConfig};
use meetbridge::meeting::repository::InMemoryMeetingRepository;
use meetbridge::meeting::MeetingRepository;
use meetbridge::shared::AppState;
use meetbridge::signaling::{ConnectionManager, MessageRouter};
use meetbridge::store::{CacheStore, InMemoryCacheStore};

use super::mocks::MockConnectionManager;

/// Everything an end-to-end scenario needs, wired over in-memory fakes.
pub struct TestSetup {
    pub state: AppState,
    pub router: Arc<MessageRouter>,
    pub connections: Arc<MockConnectionManager>,
    pub cache: Arc<InMemoryCacheStore>,
    pub meeting_repository: Arc<InMemoryMeetingRepository>,
}

impl TestSetup {
    /// Registers a new fake client connection and returns its id.
    pub async fn connect(&self) -> Uuid {
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let connection_id = Uuid::new_v4();
        self.state.connections.add_connection(connection_id, tx).await;
        connection_id
    }

    pub async fn send(&self, connection_id: Uuid, frame: &str) {
        self.router.handle_message(connection_id, frame.to_string()).await;
    }

    pub async fn join(
        &self,
        connection_id: Uuid,
        room_id: &str,
        peer_id: &str,
        role: &str,
        user_id: &str,
        meeting_id: i64,
    ) {
        let frame = format!(
            r#"{{"type":"join","payload":{{"roomId":"{room_id}","peerId":"{peer_id}","role":"{role}","userId":"{user_id}","meetingId":{meeting_id}}},"meta":null}}"#
        );
        self.send(connection_id, &frame).await;
    }

    pub async fn register_presence(&self, connection_id: Uuid, user_id: &str, role: &str) {
        let frame = format!(
            r#"{{"type":"register-presence","payload":{{"userId":"{user_id}","role":"{role}"}},"meta":null}}"#
        );
        self.send(connection_id, &frame).await;
    }

    pub async fn leave(&self, connection_id: Uuid, room_id: &str) {
        let frame =
            format!(r#"{{"type":"leave","payload":{{"roomId":"{room_id}"}},"meta":null}}"#);
        self.send(connection_id, &frame).await;
    }

    pub async fn end_meeting(&self, connection_id: Uuid, room_id: &str, meeting_id: i64) {
        let frame = format!(
            r#"{{"type":"end-meeting","payload":{{"roomId":"{room_id}","meetingId":{meeting_id},"reason":null}},"meta":null}}"#
        );
        self.send(connection_id, &frame).await;
    }

    /// Simulates a socket drop: deregister then run teardown, exactly like
    /// the connection task does.
    pub async fn disconnect(&self, connection_id: Uuid) {
        self.state.connections.remove_connection(&connection_id).await;
        self.router.handle_disconnect(connection_id).await;
    }

    pub async fn messages_for(&self, connection_id: &Uuid) -> Vec<String> {
        self.connections.get_messages_for(connection_id).await
    }

    pub async fn clear_messages(&self) {
        self.connections.clear_messages().await;
    }
}

pub struct TestSetupBuilder {
    scheduled_meetings: Vec<i64>,
    timer_config: MeetingTimerConfig,
    cache: Option<Arc<InMemoryCacheStore>>,
    meeting_repository: Option<Arc<InMemoryMeetingRepository>>,
}

impl TestSetupBuilder {
    pub fn new() -> Self {
        Self {
            scheduled_meetings: vec![1],
            timer_config: MeetingTimerConfig::default(),
            cache: None,
            meeting_repository: None,
        }
    }

    pub fn with_meetings(mut self, meeting_ids: Vec<i64>) -> Self {
        self.scheduled_meetings = meeting_ids;
        self
    }

    pub fn with_timer_config(mut self, config: MeetingTimerConfig) -> Self {
        self.timer_config = config;
        self
    }

    /// Share infrastructure with a previous setup to simulate a restarted
    /// process against the same store and database.
    pub fn with_infrastructure_of(mut self, other: &TestSetup) -> Self {
        self.cache = Some(Arc::clone(&other.cache));
        self.meeting_repository = Some(Arc::clone(&other.meeting_repository));
        self
    }

    pub fn build(self) -> TestSetup {
        let cache = self
            .cache
            .unwrap_or_else(|| Arc::new(InMemoryCacheStore::new()));
        let meeting_repository = self.meeting_repository.unwrap_or_else(|| {
            Arc::new(InMemoryMeetingRepository::with_scheduled(
                self.scheduled_meetings,
            ))
        });
        let connections = Arc::new(MockConnectionManager::new());
        let config = Arc::new(ConfigService::with_config(
            Arc::clone(&cache) as Arc<dyn CacheStore>,
            self.timer_config,
        ));

        let state = AppState::build(
            Arc::clone(&cache) as Arc<dyn CacheStore>,
            Arc::clone(&meeting_repository) as Arc<dyn MeetingRepository>,
            Arc::clone(&connections) as Arc<dyn ConnectionManager>,
            config,
            "/dashboard".to_string(),
        );
        let router = Arc::new(MessageRouter::new(state.clone()));

        TestSetup {
            state,
            router,
            connections,
            cache,
            meeting_repository,
        }
    }
}

impl Default for TestSetupBuilder {
    fn default() -> Self {
        Self::new()
    }
}
