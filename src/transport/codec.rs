//! NDJSON codec for the service socket
//!
//! One JSON object per line, in both directions.

use crate::protocol::{ClientMessage, ServerMessage};
use crate::socket::SocketError;

/// Encode a client message into NDJSON format (JSON + newline)
pub fn encode_client_message(message: &ClientMessage) -> Result<String, SocketError> {
    let mut json = serde_json::to_string(message)?;
    json.push('\n');
    Ok(json)
}

/// Encode a server message into NDJSON format
pub fn encode_server_message(message: &ServerMessage) -> Result<String, SocketError> {
    let mut json = serde_json::to_string(message)?;
    json.push('\n');
    Ok(json)
}

pub fn decode_client_message(line: &str) -> Result<ClientMessage, SocketError> {
    let message: ClientMessage = serde_json::from_str(line.trim())?;
    Ok(message)
}

pub fn decode_server_message(line: &str) -> Result<ServerMessage, SocketError> {
    let message: ServerMessage = serde_json::from_str(line.trim())?;
    Ok(message)
}
