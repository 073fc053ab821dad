use axum::{
    extract::{State, WebSocketUpgrade},
    response::Response,
};
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

use tracing::{info, warn};

use super::connection::Connection;
use super::router::MessageRouter;

/// WebSocket endpoint. Identity arrives in-band (`register-presence`,
/// `join`), so the upgrade itself is unconditional.
pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(router): State<Arc<MessageRouter>>,
) -> Response {
    ws.on_upgrade(move |socket| handle_websocket_connection(socket, router))
}

/// Handle the upgraded WebSocket connection
async fn handle_websocket_connection(socket: axum::extract::ws::WebSocket, router: Arc<MessageRouter>) {
    let connection_id = Uuid::new_v4();
    info!(connection_id = %connection_id, "WebSocket connection established");

    // Outbound channel (app -> client); the manager owns the sender, so
    // closing the connection there ends the loop below.
    let (outbound_sender, outbound_receiver) = mpsc::unbounded_channel::<String>();
    router
        .state()
        .connections
        .add_connection(connection_id, outbound_sender)
        .await;

    let connection = Connection::new(
        connection_id,
        Box::new(socket),
        outbound_receiver,
        Arc::clone(&router),
    );

    match connection.run().await {
        Ok(()) => {
            info!(connection_id = %connection_id, "WebSocket connection closed cleanly");
        }
        Err(e) => {
            warn!(connection_id = %connection_id, error = %e, "WebSocket connection error");
        }
    }

    // Cleanup: deregister, then let the router unwind room and presence
    // membership for this connection.
    router
        .state()
        .connections
        .remove_connection(&connection_id)
        .await;
    router.handle_disconnect(connection_id).await;
}
