use crate::permissions::Capability;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum State {
    Idle,
    Capturing,
    Sending,
    Error,
}

impl State {
    pub fn as_str(&self) -> &'static str {
        match self {
            State::Idle => "Ready",
            State::Capturing => "Capturing",
            State::Sending => "Sending",
            State::Error => "Error",
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct PermissionStatus {
    pub capability: Capability,
    pub granted: bool,
}

/// Messages sent from clients to the server
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientMessage {
    /// Capture the granted display and copy the model's reply (bubble tap)
    Capture { id: Uuid },
    /// Store a screen capture grant
    Grant {
        id: Uuid,
        result_code: i32,
        #[serde(default = "default_payload")]
        payload: String,
    },
    /// Release the current grant
    Revoke { id: Uuid },
    /// Request server status
    Status { id: Uuid },
    /// Subscribe to server events
    Subscribe { id: Uuid },
}

fn default_payload() -> String {
    "primary".to_string()
}

impl ClientMessage {
    pub fn new_capture() -> Self {
        ClientMessage::Capture { id: Uuid::new_v4() }
    }

    pub fn new_grant(result_code: i32, payload: String) -> Self {
        ClientMessage::Grant {
            id: Uuid::new_v4(),
            result_code,
            payload,
        }
    }

    pub fn new_revoke() -> Self {
        ClientMessage::Revoke { id: Uuid::new_v4() }
    }

    /// Create a new Status request
    pub fn new_status() -> Self {
        ClientMessage::Status { id: Uuid::new_v4() }
    }

    /// Create a new Subscribe request
    pub fn new_subscribe() -> Self {
        ClientMessage::Subscribe { id: Uuid::new_v4() }
    }

    pub fn id(&self) -> Uuid {
        match self {
            ClientMessage::Capture { id }
            | ClientMessage::Grant { id, .. }
            | ClientMessage::Revoke { id }
            | ClientMessage::Status { id }
            | ClientMessage::Subscribe { id } => *id,
        }
    }
}

/// Messages sent from server to client
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMessage {
    /// Model reply, already on the clipboard
    Reply { id: Uuid, text: String },
    /// Error response
    Error { id: Uuid, error: String },
    /// Grant stored; `usable` is false for a declined consent
    Granted { id: Uuid, usable: bool },
    Revoked { id: Uuid },
    /// Status information (in response to status request)
    Status {
        id: Uuid,
        service_running: bool,
        grant_active: bool,
        permissions: Vec<PermissionStatus>,
        model: String,
        endpoint: String,
        uptime_seconds: u64,
        last_activity_seconds_ago: u64,
    },
    /// Subscription confirmation
    Subscribed { id: Uuid },
    /// Status event broadcast (sent periodically to subscribers)
    #[serde(rename = "status_event")]
    StatusEvent {
        state: State,
        ts: u64,
        #[serde(default = "default_version")]
        ver: u32,
    },
}

fn default_version() -> u32 {
    1
}

impl ServerMessage {
    pub fn new_reply(id: Uuid, text: String) -> Self {
        ServerMessage::Reply { id, text }
    }

    pub fn new_error(id: Uuid, error: String) -> Self {
        ServerMessage::Error { id, error }
    }

    pub fn new_granted(id: Uuid, usable: bool) -> Self {
        ServerMessage::Granted { id, usable }
    }

    pub fn new_revoked(id: Uuid) -> Self {
        ServerMessage::Revoked { id }
    }

    /// Create a Status response
    #[allow(clippy::too_many_arguments)]
    pub fn new_status(
        id: Uuid,
        service_running: bool,
        grant_active: bool,
        permissions: Vec<PermissionStatus>,
        model: String,
        endpoint: String,
        uptime_seconds: u64,
        last_activity_seconds_ago: u64,
    ) -> Self {
        ServerMessage::Status {
            id,
            service_running,
            grant_active,
            permissions,
            model,
            endpoint,
            uptime_seconds,
            last_activity_seconds_ago,
        }
    }

    /// Create a Subscribed response
    pub fn new_subscribed(id: Uuid) -> Self {
        ServerMessage::Subscribed { id }
    }

    /// Create a StatusEvent broadcast
    pub fn new_status_event(state: State, ts: u64) -> Self {
        ServerMessage::StatusEvent { state, ts, ver: 1 }
    }

    /// Id of the request this answers; events answer none
    pub fn id(&self) -> Option<Uuid> {
        match self {
            ServerMessage::Reply { id, .. }
            | ServerMessage::Error { id, .. }
            | ServerMessage::Granted { id, .. }
            | ServerMessage::Revoked { id }
            | ServerMessage::Status { id, .. }
            | ServerMessage::Subscribed { id } => Some(*id),
            ServerMessage::StatusEvent { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_messages_are_lowercase_tagged() {
        let json = serde_json::to_value(ClientMessage::new_grant(-1, "primary".to_string())).unwrap();
        assert_eq!(json["type"], "grant");
        assert_eq!(json["result_code"], -1);
        assert_eq!(json["payload"], "primary");

        let json = serde_json::to_value(ClientMessage::new_capture()).unwrap();
        assert_eq!(json["type"], "capture");
    }

    #[test]
    fn test_grant_payload_defaults_to_primary() {
        let id = Uuid::new_v4();
        let line = format!(r#"{{"type":"grant","id":"{}","result_code":-1}}"#, id);
        match serde_json::from_str::<ClientMessage>(&line).unwrap() {
            ClientMessage::Grant { payload, result_code, .. } => {
                assert_eq!(payload, "primary");
                assert_eq!(result_code, -1);
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_status_event_shape() {
        let json = serde_json::to_value(ServerMessage::new_status_event(State::Capturing, 42)).unwrap();
        assert_eq!(json["type"], "status_event");
        assert_eq!(json["state"], "capturing");
        assert_eq!(json["ver"], 1);
    }

    #[test]
    fn test_replies_carry_request_id_and_events_do_not() {
        let id = Uuid::new_v4();
        assert_eq!(ServerMessage::new_revoked(id).id(), Some(id));
        assert_eq!(ServerMessage::new_error(id, "x".to_string()).id(), Some(id));
        assert_eq!(ServerMessage::new_status_event(State::Idle, 0).id(), None);
    }

    #[test]
    fn test_status_lists_permissions() {
        let message = ServerMessage::new_status(
            Uuid::new_v4(),
            true,
            false,
            vec![PermissionStatus {
                capability: Capability::ScreenCapture,
                granted: false,
            }],
            "m".to_string(),
            "https://example.com/".to_string(),
            10,
            2,
        );
        let json = serde_json::to_value(message).unwrap();
        assert_eq!(json["permissions"][0]["capability"], "screen_capture");
        assert_eq!(json["grant_active"], false);
    }
}
