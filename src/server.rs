//! Socket server owning the capture grant and running overlay captures
//!
//! The server listens on a Unix socket, keeps the process-wide permission
//! gate, and runs the capture-to-clipboard pipeline when a client taps.

mod handler;

use crate::capture::{DesktopScreenProducer, FrameProducer};
use crate::delivery::{ClipboardSink, Notifier};
use crate::desktop::{DesktopNotifier, SystemClipboard};
use crate::model::ModelClient;
use crate::permissions::{PermissionGate, RESULT_OK};
use crate::protocol::{PermissionStatus, ServerMessage, State};
use crate::settings::{SettingsError, SettingsStore, StyleSettings};
use crate::socket::SocketError;
use crate::transport::encode_server_message;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UnixListener;
use tokio::sync::Notify;
use tracing::{error, info, warn};

use handler::handle_connection;

// Server result type using SocketError for structured error handling
type ServerResult<T> = std::result::Result<T, SocketError>;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(2);

/// Service knobs from the command line
#[derive(Debug, Clone, Default)]
pub struct ServiceConfig {
    /// Settings file, `None` for the default location
    pub settings_path: Option<PathBuf>,
    pub capture_delay: Duration,
    pub request_timeout: Option<Duration>,
    /// Store a grant for this display at startup
    pub auto_grant: Option<String>,
}

/// Platform pieces the service drives
pub struct Collaborators {
    pub gate: PermissionGate,
    pub producer: Box<dyn FrameProducer>,
    pub clipboard: Box<dyn ClipboardSink>,
    pub notifier: Box<dyn Notifier>,
}

impl Collaborators {
    pub fn desktop() -> Self {
        Self {
            gate: PermissionGate::desktop(),
            producer: Box::new(DesktopScreenProducer::new()),
            clipboard: Box::new(SystemClipboard::new()),
            notifier: Box::new(DesktopNotifier::new()),
        }
    }
}

pub struct SocketServer {
    inner: Arc<ServerInner>,
    listener: UnixListener,
}

impl SocketServer {
    pub fn new<P: AsRef<Path>>(
        socket_path: P,
        config: ServiceConfig,
        collaborators: Collaborators,
    ) -> ServerResult<Self> {
        if let Some(parent) = socket_path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }

        // Remove existing socket file if it exists
        if socket_path.as_ref().exists() {
            std::fs::remove_file(socket_path.as_ref())?;
        }

        let listener = UnixListener::bind(&socket_path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::AddrInUse {
                SocketError::Connection(format!(
                    "Service already running at socket: {}. Stop it first.",
                    socket_path.as_ref().display()
                ))
            } else {
                SocketError::Connection(format!("Failed to bind socket: {}", e))
            }
        })?;

        // Set socket permissions to 0600 (owner read/write only) for security
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut permissions = std::fs::metadata(&socket_path)
                .map_err(|e| {
                    SocketError::Connection(format!("Failed to read socket metadata: {}", e))
                })?
                .permissions();
            permissions.set_mode(0o600);
            std::fs::set_permissions(&socket_path, permissions).map_err(|e| {
                SocketError::Connection(format!("Failed to set socket permissions: {}", e))
            })?;
        }

        let client = ModelClient::new(config.request_timeout).map_err(|e| {
            SocketError::Connection(format!("Failed to create HTTP client: {}", e))
        })?;

        let mut collaborators = collaborators;
        if let Some(display) = &config.auto_grant {
            collaborators.gate.store_capture(RESULT_OK, display.clone());
        }

        let inner = Arc::new(ServerInner::new(collaborators, client, config, Instant::now()));
        Ok(Self { inner, listener })
    }

    pub async fn run(&mut self) -> ServerResult<()> {
        info!("Socket server listening for connections");

        let shutdown_notify = Arc::clone(&self.inner);

        // Broadcasts status every 2 seconds to keep subscribers alive
        let heartbeat = tokio::spawn(Self::heartbeat_monitor(Arc::clone(&self.inner)));

        tokio::select! {
            _ = shutdown_notify.shutdown_notify.notified() => {
                info!("Shutdown requested, stopping server");
                heartbeat.abort();
                self.cleanup().await
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupt received, stopping server");
                heartbeat.abort();
                self.cleanup().await
            }
            result = self.accept_loop() => {
                heartbeat.abort();
                result
            }
        }
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            inner: Arc::clone(&self.inner),
        }
    }

    async fn heartbeat_monitor(inner: Arc<ServerInner>) {
        loop {
            tokio::time::sleep(HEARTBEAT_INTERVAL).await;
            inner.broadcast_status();
        }
    }

    async fn accept_loop(&mut self) -> ServerResult<()> {
        loop {
            match self.listener.accept().await {
                Ok((stream, _)) => {
                    let inner = Arc::clone(&self.inner);
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, inner).await {
                            warn!("Error handling connection: {}", e);
                        }
                    });
                }
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                }
            }
        }
    }

    async fn cleanup(&self) -> ServerResult<()> {
        self.inner.gate.lock().await.release_grant();

        let addr = self.listener.local_addr().ok();
        if let Some(path) = addr
            .as_ref()
            .and_then(|a| a.as_pathname())
            .filter(|p| p.exists())
            && let Err(e) = std::fs::remove_file(path)
        {
            warn!("Failed to remove socket file: {}", e);
        }
        Ok(())
    }
}

/// Asks a running server to stop
#[derive(Clone)]
pub struct ShutdownHandle {
    inner: Arc<ServerInner>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.inner.shutdown_notify.notify_one();
    }
}

struct SubscriberHandle {
    id: String,
    tx: tokio::sync::mpsc::UnboundedSender<Vec<u8>>,
}

/// Inner server state with all shared data
struct ServerInner {
    // Single writer for the capture grant
    pub gate: tokio::sync::Mutex<PermissionGate>,
    pub last_activity: std::sync::Mutex<Instant>,
    pub subscribers: std::sync::Mutex<Vec<SubscriberHandle>>,
    pub current_state: std::sync::Mutex<State>,

    // Shared immutable state
    pub producer: Box<dyn FrameProducer>,
    pub clipboard: Box<dyn ClipboardSink>,
    pub notifier: Box<dyn Notifier>,
    pub client: ModelClient,
    pub settings_path: Option<PathBuf>,
    pub capture_delay: Duration,
    pub start_time: Instant,

    // Async coordination
    pub shutdown_notify: Notify,
}

impl ServerInner {
    fn new(
        collaborators: Collaborators,
        client: ModelClient,
        config: ServiceConfig,
        start_time: Instant,
    ) -> Self {
        Self {
            gate: tokio::sync::Mutex::new(collaborators.gate),
            last_activity: std::sync::Mutex::new(start_time),
            subscribers: std::sync::Mutex::new(Vec::new()),
            current_state: std::sync::Mutex::new(State::Idle),
            producer: collaborators.producer,
            clipboard: collaborators.clipboard,
            notifier: collaborators.notifier,
            client,
            settings_path: config.settings_path,
            capture_delay: config.capture_delay,
            start_time,
            shutdown_notify: Notify::new(),
        }
    }

    /// Get monotonic timestamp in milliseconds since server start
    pub fn elapsed_ms(&self) -> u64 {
        self.start_time.elapsed().as_millis() as u64
    }

    /// Settings as they are on disk right now, API key override applied
    pub fn load_settings(&self) -> Result<StyleSettings, SettingsError> {
        let store = SettingsStore::open(self.settings_path.as_deref())?;
        Ok(store.settings().clone().with_env_overrides())
    }

    /// Broadcast a typed event to all subscribers
    fn broadcast_event(&self, event: ServerMessage) {
        let bytes = match encode_server_message(&event) {
            Ok(json) => json.into_bytes(),
            Err(e) => {
                warn!("Failed to encode event: {}", e);
                return;
            }
        };

        if let Ok(mut subs) = self.subscribers.lock() {
            // Drop subscribers whose connection has gone away
            subs.retain(|sub| sub.tx.send(bytes.clone()).is_ok());
        }
    }

    pub fn update_activity(&self) {
        if let Ok(mut last) = self.last_activity.lock() {
            *last = Instant::now();
        }
    }

    pub fn set_current_state(&self, state: State) {
        if let Ok(mut current) = self.current_state.lock() {
            *current = state;
        }
    }

    fn get_current_state(&self) -> State {
        self.current_state.lock().map(|s| *s).unwrap_or(State::Idle)
    }

    fn get_idle_time(&self) -> Duration {
        self.last_activity
            .lock()
            .map(|last| last.elapsed())
            .unwrap_or_default()
    }

    /// Broadcast unified status event with current state
    pub fn broadcast_status(&self) {
        let state = self.get_current_state();
        self.broadcast_event(ServerMessage::new_status_event(state, self.elapsed_ms()));
    }

    /// Set and broadcast in one step
    pub fn transition(&self, state: State) {
        self.set_current_state(state);
        self.broadcast_status();
    }

    pub async fn status(&self, id: uuid::Uuid) -> ServerMessage {
        let (grant_active, permissions) = {
            let gate = self.gate.lock().await;
            let permissions = gate
                .check_all()
                .into_iter()
                .map(|(capability, granted)| PermissionStatus {
                    capability,
                    granted,
                })
                .collect::<Vec<_>>();
            (gate.active_grant().is_some(), permissions)
        };

        let settings = self.load_settings().unwrap_or_else(|e| {
            warn!("Failed to load settings for status: {}", e);
            StyleSettings::default()
        });

        ServerMessage::new_status(
            id,
            true,
            grant_active,
            permissions,
            settings.model_name,
            settings.url,
            self.start_time.elapsed().as_secs(),
            self.get_idle_time().as_secs(),
        )
    }
}
