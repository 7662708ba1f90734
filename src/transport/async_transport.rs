//! Async transport implementation using tokio
//!
//! Clients either make one request and wait for the reply carrying its id,
//! or subscribe and follow the service's state events. The service side
//! reads requests and writes replies and forwarded events on one stream.

use crate::protocol::{ClientMessage, ServerMessage};
use crate::socket::SocketError;
use crate::transport::codec;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tracing::debug;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// Line-delimited halves of one socket stream
struct Lines {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl Lines {
    fn new(stream: UnixStream) -> Self {
        let (reader, writer) = stream.into_split();
        Self {
            reader: BufReader::new(reader),
            writer,
        }
    }

    /// Next non-blank line, `None` at EOF
    async fn next_line(&mut self) -> Result<Option<String>, SocketError> {
        let mut line = String::new();
        loop {
            line.clear();
            if self.reader.read_line(&mut line).await? == 0 {
                return Ok(None);
            }
            if !line.trim().is_empty() {
                return Ok(Some(line));
            }
        }
    }

    async fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), SocketError> {
        self.writer.write_all(bytes).await?;
        self.writer.flush().await?;
        Ok(())
    }
}

/// Client side of the service socket
pub struct AsyncTransport {
    socket_path: String,
}

impl AsyncTransport {
    pub fn new(socket_path: String) -> Self {
        Self { socket_path }
    }

    async fn connect(&self) -> Result<Lines, SocketError> {
        let stream = UnixStream::connect(&self.socket_path).await.map_err(|e| {
            match e.kind() {
                std::io::ErrorKind::ConnectionRefused => SocketError::Connection(
                    "Service is not running. Use 'tyan service' to start the service."
                        .to_string(),
                ),
                std::io::ErrorKind::NotFound => SocketError::Connection(format!(
                    "Service socket not found at {}. Use 'tyan service' to start the service.",
                    self.socket_path
                )),
                _ => SocketError::Connection(format!(
                    "Failed to connect to service at {}: {}",
                    self.socket_path, e
                )),
            }
        })?;
        Ok(Lines::new(stream))
    }

    /// Send one request and wait for the reply with the same id
    pub async fn request(&self, message: &ClientMessage) -> Result<ServerMessage, SocketError> {
        let mut lines = self.connect().await?;
        lines
            .write_bytes(codec::encode_client_message(message)?.as_bytes())
            .await?;

        // Captures wait on the model, so allow for a slow endpoint
        tokio::time::timeout(REQUEST_TIMEOUT, read_reply(&mut lines, message.id()))
            .await
            .map_err(|_| {
                SocketError::Connection(format!(
                    "Request timed out after {} seconds",
                    REQUEST_TIMEOUT.as_secs()
                ))
            })?
    }

    /// Subscribe to state events
    pub async fn subscribe(&self) -> Result<Subscription, SocketError> {
        let mut lines = self.connect().await?;
        lines
            .write_bytes(codec::encode_client_message(&ClientMessage::new_subscribe())?.as_bytes())
            .await?;
        Ok(Subscription { lines })
    }
}

async fn read_reply(lines: &mut Lines, id: uuid::Uuid) -> Result<ServerMessage, SocketError> {
    while let Some(line) = lines.next_line().await? {
        let message = codec::decode_server_message(&line)?;
        if message.id() == Some(id) {
            return Ok(message);
        }
        debug!("Skipping unrelated message: {:?}", message);
    }
    Err(SocketError::Connection("No response from server".to_string()))
}

/// Stream of messages following a subscribe request
pub struct Subscription {
    lines: Lines,
}

impl Subscription {
    /// Next message from the service, `None` once it hangs up
    pub async fn next(&mut self) -> Result<Option<ServerMessage>, SocketError> {
        match self.lines.next_line().await? {
            Some(line) => codec::decode_server_message(&line).map(Some),
            None => Ok(None),
        }
    }
}

/// Service side of one client connection
pub struct ServiceConnection {
    lines: Lines,
}

impl ServiceConnection {
    pub fn new(stream: UnixStream) -> Self {
        Self {
            lines: Lines::new(stream),
        }
    }

    /// Next request, `None` when the client hung up
    pub async fn next_request(&mut self) -> Result<Option<ClientMessage>, SocketError> {
        match self.lines.next_line().await? {
            Some(line) => codec::decode_client_message(&line).map(Some),
            None => Ok(None),
        }
    }

    pub async fn reply(&mut self, message: &ServerMessage) -> Result<(), SocketError> {
        self.lines
            .write_bytes(codec::encode_server_message(message)?.as_bytes())
            .await
    }

    /// Forward an already encoded event line
    pub async fn forward(&mut self, event: &[u8]) -> Result<(), SocketError> {
        self.lines.write_bytes(event).await
    }
}
