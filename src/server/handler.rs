//! Connection and message handling

use crate::pipeline::{OverlayContext, run_overlay_capture};
use crate::protocol::{ClientMessage, ServerMessage, State};
use crate::socket::SocketError;
use crate::transport::ServiceConnection;
use std::sync::Arc;
use tokio::net::UnixStream;
use tracing::{debug, info, warn};

use super::ServerInner;
use super::SubscriberHandle;

type ServerResult<T> = std::result::Result<T, SocketError>;

pub(super) async fn handle_connection(
    stream: UnixStream,
    inner: Arc<ServerInner>,
) -> ServerResult<()> {
    inner.update_activity();

    let mut conn = ServiceConnection::new(stream);

    // Track if this connection is a subscriber
    let mut subscriber_id: Option<String> = None;
    let (event_tx, mut event_rx) = tokio::sync::mpsc::unbounded_channel();

    loop {
        tokio::select! {
            // Read from client
            result = conn.next_request() => {
                let request = match result {
                    Ok(Some(request)) => request,
                    Ok(None) => break,
                    Err(SocketError::Serialization(e)) => {
                        warn!("Malformed request: {}", e);
                        let response = ServerMessage::new_error(uuid::Uuid::nil(), format!("Malformed request: {}", e));
                        conn.reply(&response).await?;
                        continue;
                    }
                    Err(e) => return Err(e),
                };
                debug!("Received request: {:?}", request);
                inner.update_activity();

                match request {
                    ClientMessage::Subscribe { id } => {
                        subscriber_id = Some(id.to_string());
                        if let Ok(mut subs) = inner.subscribers.lock() {
                            subs.push(SubscriberHandle {
                                id: id.to_string(),
                                tx: event_tx.clone(),
                            });
                        }

                        // Send acknowledgment, then the current state
                        let response = ServerMessage::new_subscribed(id);
                        conn.reply(&response).await?;
                        inner.broadcast_status();
                    }
                    ClientMessage::Capture { id } => {
                        // Run the capture in the background so events keep flowing
                        let inner_clone = Arc::clone(&inner);
                        let (result_tx, mut result_rx) = tokio::sync::mpsc::unbounded_channel();

                        tokio::spawn(async move {
                            let response = handle_capture_request(id, inner_clone).await;
                            let _ = result_tx.send(response);
                        });

                        // Wait for result in a nested select loop so events can flow
                        loop {
                            tokio::select! {
                                response = result_rx.recv() => {
                                    let response = response.unwrap_or_else(|| {
                                        ServerMessage::new_error(id, "Capture task ended without a result".to_string())
                                    });
                                    conn.reply(&response).await?;
                                    break;
                                }

                                Some(event_data) = event_rx.recv() => {
                                    conn.forward(&event_data).await?;
                                }
                            }
                        }
                    }
                    _ => {
                        // Regular request-response (Grant, Revoke, Status)
                        let response = process_message(request, Arc::clone(&inner)).await;
                        conn.reply(&response).await?;
                    }
                }
            }

            // Send events to subscriber
            Some(event_data) = event_rx.recv() => {
                conn.forward(&event_data).await?;
            }
        }
    }

    // Clean up subscriber on disconnect
    if let Some(id) = subscriber_id
        && let Ok(mut subs) = inner.subscribers.lock()
    {
        subs.retain(|s| s.id != id);
    }

    Ok(())
}

/// One overlay capture, from grant check to clipboard
async fn handle_capture_request(id: uuid::Uuid, inner: Arc<ServerInner>) -> ServerMessage {
    let settings = match inner.load_settings() {
        Ok(settings) => settings,
        Err(e) => {
            warn!("{}", e);
            inner.notifier.notify(&e.to_string());
            inner.transition(State::Error);
            inner.set_current_state(State::Idle);
            return ServerMessage::new_error(id, e.to_string());
        }
    };

    let ctx = OverlayContext {
        gate: &inner.gate,
        producer: inner.producer.as_ref(),
        client: &inner.client,
        settings: &settings,
        clipboard: inner.clipboard.as_ref(),
        notifier: inner.notifier.as_ref(),
        settle_delay: inner.capture_delay,
    };

    let outcome = run_overlay_capture(&ctx, |state| inner.transition(state)).await;

    // An error is broadcast once, then the service is ready again
    inner.set_current_state(State::Idle);
    inner.update_activity();

    match outcome {
        Ok(text) => ServerMessage::new_reply(id, text),
        Err(error) => ServerMessage::new_error(id, error),
    }
}

async fn process_message(request: ClientMessage, inner: Arc<ServerInner>) -> ServerMessage {
    match request {
        ClientMessage::Grant {
            id,
            result_code,
            payload,
        } => {
            let usable = inner.gate.lock().await.store_capture(result_code, payload);
            ServerMessage::new_granted(id, usable)
        }

        ClientMessage::Revoke { id } => {
            inner.gate.lock().await.release_grant();
            info!("Capture grant revoked by client");
            ServerMessage::new_revoked(id)
        }

        ClientMessage::Status { id } => inner.status(id).await,

        ClientMessage::Capture { id } | ClientMessage::Subscribe { id } => {
            // Handled at connection level
            ServerMessage::new_error(id, "Request must be handled at connection level".to_string())
        }
    }
}
