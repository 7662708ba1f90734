mod capture;
mod chat;
mod delivery;
mod desktop;
mod logging;
mod model;
mod permissions;
mod pipeline;
mod protocol;
mod server;
mod settings;
mod socket;
mod transport;

use crate::chat::ChatSession;
use crate::delivery::CycleOutcome;
use crate::desktop::{DesktopNotifier, SystemClipboard};
use crate::model::ModelClient;
use crate::permissions::{PermissionGate, RESULT_CANCELED, RESULT_OK};
use crate::protocol::{ClientMessage, ServerMessage};
use crate::server::{Collaborators, ServiceConfig, SocketServer};
use crate::settings::{SettingKey, SettingsStore};
use crate::socket::{DEFAULT_SOCKET_PATH, expand_socket_path};
use crate::transport::AsyncTransport;
use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "tyan")]
#[command(about = "Screen-aware reply assistant: capture, ask a vision model, copy the reply")]
#[command(version = "0.1.0")]
struct Cli {
    /// Settings file (defaults to the user config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Debug logging (honours RUST_LOG)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the capture service
    Service {
        /// Unix socket path
        #[arg(long, default_value = DEFAULT_SOCKET_PATH)]
        socket_path: String,

        /// Grant screen capture at startup
        #[arg(long)]
        grant: bool,

        /// Display to capture: "primary" or a display id
        #[arg(long, default_value = "primary")]
        display: String,

        /// Wait before grabbing the screen (milliseconds)
        #[arg(long, default_value = "300")]
        capture_delay_ms: u64,

        /// Model request timeout in seconds (0 = none)
        #[arg(long, default_value = "0")]
        request_timeout_secs: u64,
    },

    /// Capture the screen and copy the model's reply to the clipboard
    Capture {
        /// Service socket path
        #[arg(long, default_value = DEFAULT_SOCKET_PATH)]
        socket_path: String,
    },

    /// Allow the service to capture a display
    Grant {
        /// Display to capture: "primary" or a display id
        #[arg(long, default_value = "primary")]
        display: String,

        /// Record a declined consent instead
        #[arg(long)]
        deny: bool,

        /// Service socket path
        #[arg(long, default_value = DEFAULT_SOCKET_PATH)]
        socket_path: String,
    },

    /// Release the service's capture grant
    Revoke {
        /// Service socket path
        #[arg(long, default_value = DEFAULT_SOCKET_PATH)]
        socket_path: String,
    },

    /// Check service health and configuration
    Status {
        /// Service socket path
        #[arg(long, default_value = DEFAULT_SOCKET_PATH)]
        socket_path: String,
    },

    /// Print service state changes as they happen
    Watch {
        /// Service socket path
        #[arg(long, default_value = DEFAULT_SOCKET_PATH)]
        socket_path: String,
    },

    /// Show which desktop capabilities are available
    Permissions,

    /// Ask for one reply to a message, optionally about an image
    Reply {
        /// Message to reply to
        text: String,

        /// Image to send along
        #[arg(long)]
        image: Option<PathBuf>,

        /// Model request timeout in seconds (0 = none)
        #[arg(long, default_value = "0")]
        request_timeout_secs: u64,
    },

    /// Interactive chat with an optional picked image
    Chat {
        /// Image to start with
        #[arg(long)]
        image: Option<PathBuf>,

        /// Show the clipboard contents as the first message; Enter sends it
        #[arg(long)]
        paste: bool,

        /// Model request timeout in seconds (0 = none)
        #[arg(long, default_value = "0")]
        request_timeout_secs: u64,
    },

    /// Read or change reply-style settings
    Settings {
        #[command(subcommand)]
        action: SettingsAction,
    },
}

#[derive(Subcommand)]
enum SettingsAction {
    /// Print every setting
    Show,
    /// Print one setting
    Get { key: String },
    /// Change one setting
    Set { key: String, value: String },
    /// Restore every setting to its default
    Reset,
    /// Print the settings file location
    Path,
}

fn timeout_from_secs(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

fn mask_secret(value: &str) -> String {
    let visible: String = value.chars().take(4).collect();
    if value.chars().count() <= 4 {
        "****".to_string()
    } else {
        format!("{}****", visible)
    }
}

async fn request(socket_path: &str, message: ClientMessage) -> Result<ServerMessage> {
    let transport = AsyncTransport::new(expand_socket_path(socket_path));
    Ok(transport.request(&message).await?)
}

fn chat_session(config: Option<&PathBuf>, request_timeout_secs: u64) -> Result<ChatSession> {
    let store = SettingsStore::open(config.map(|p| p.as_path()))?;
    let settings = store.settings().clone().with_env_overrides();
    let client = ModelClient::new(timeout_from_secs(request_timeout_secs))
        .context("Failed to create HTTP client")?;

    Ok(ChatSession::new(
        settings,
        client,
        Arc::new(SystemClipboard::new()),
        Arc::new(DesktopNotifier::new()),
        PermissionGate::desktop(),
    ))
}

async fn run(cli: Cli) -> Result<()> {
    let config = cli.config;

    match cli.command {
        Commands::Service {
            socket_path,
            grant,
            display,
            capture_delay_ms,
            request_timeout_secs,
        } => {
            // Expand $UID in socket path
            let expanded_socket_path = expand_socket_path(&socket_path);

            eprintln!("Starting tyan service");
            eprintln!("Socket: {}", expanded_socket_path);
            eprintln!("Capture delay: {}ms", capture_delay_ms);
            if grant {
                eprintln!("Screen capture granted for display: {}", display);
            }

            let service_config = ServiceConfig {
                settings_path: config,
                capture_delay: Duration::from_millis(capture_delay_ms),
                request_timeout: timeout_from_secs(request_timeout_secs),
                auto_grant: grant.then_some(display),
            };

            let mut server =
                SocketServer::new(&expanded_socket_path, service_config, Collaborators::desktop())
                    .context("Failed to create socket server")?;
            server.run().await.context("Socket server error")?;
        }

        Commands::Capture { socket_path } => {
            match request(&socket_path, ClientMessage::new_capture()).await? {
                ServerMessage::Reply { text, .. } => println!("{}", text),
                ServerMessage::Error { error, .. } => return Err(anyhow!(error)),
                other => return Err(anyhow!("Unexpected response: {:?}", other)),
            }
        }

        Commands::Grant {
            display,
            deny,
            socket_path,
        } => {
            let result_code = if deny { RESULT_CANCELED } else { RESULT_OK };
            match request(&socket_path, ClientMessage::new_grant(result_code, display.clone())).await? {
                ServerMessage::Granted { usable: true, .. } => {
                    println!("Screen capture granted for display {}", display)
                }
                ServerMessage::Granted { usable: false, .. } => {
                    println!("Screen capture consent declined; captures will fail until granted")
                }
                ServerMessage::Error { error, .. } => return Err(anyhow!(error)),
                other => return Err(anyhow!("Unexpected response: {:?}", other)),
            }
        }

        Commands::Revoke { socket_path } => {
            match request(&socket_path, ClientMessage::new_revoke()).await? {
                ServerMessage::Revoked { .. } => println!("Screen capture grant released"),
                ServerMessage::Error { error, .. } => return Err(anyhow!(error)),
                other => return Err(anyhow!("Unexpected response: {:?}", other)),
            }
        }

        Commands::Status { socket_path } => {
            match request(&socket_path, ClientMessage::new_status()).await? {
                ServerMessage::Status {
                    service_running,
                    grant_active,
                    permissions,
                    model,
                    endpoint,
                    uptime_seconds,
                    last_activity_seconds_ago,
                    ..
                } => {
                    println!("Service Status:");
                    let status_json = serde_json::json!({
                        "service_running": service_running,
                        "grant_active": grant_active,
                        "permissions": permissions,
                        "model": model,
                        "endpoint": endpoint,
                        "uptime_seconds": uptime_seconds,
                        "last_activity_seconds_ago": last_activity_seconds_ago,
                    });
                    println!("{}", serde_json::to_string_pretty(&status_json)?);
                }
                ServerMessage::Error { error, .. } => return Err(anyhow!(error)),
                other => return Err(anyhow!("Unexpected response: {:?}", other)),
            }
        }

        Commands::Watch { socket_path } => {
            let transport = AsyncTransport::new(expand_socket_path(&socket_path));
            let mut subscription = transport.subscribe().await?;

            while let Some(message) = subscription.next().await? {
                match message {
                    ServerMessage::Subscribed { .. } => println!("Watching service state"),
                    ServerMessage::StatusEvent { state, ts, .. } => {
                        println!("{:>10}ms  {}", ts, state.as_str())
                    }
                    other => println!("{:?}", other),
                }
            }
        }

        Commands::Permissions => {
            let gate = PermissionGate::desktop();
            println!("{:<16} Granted", "Capability");
            println!("{}", "-".repeat(26));
            for (capability, granted) in gate.check_all() {
                println!("{:<16} {}", capability.as_str(), if granted { "YES" } else { "NO" });
            }
            println!();
            println!(
                "Display server:  {}",
                SystemClipboard::new().display_server().as_str()
            );
            println!("screen_capture is granted through the running service ('tyan grant').");
        }

        Commands::Reply {
            text,
            image,
            request_timeout_secs,
        } => {
            let mut session = chat_session(config.as_ref(), request_timeout_secs)?;
            if let Some(path) = image
                && !session.pick_image(path.clone())
            {
                return Err(anyhow!("Could not use image {}", path.display()));
            }

            let outcome = session.run_once(&text, &mut std::io::stdout()).await?;
            if outcome == CycleOutcome::Failed {
                return Err(anyhow!("No reply received"));
            }
        }

        Commands::Chat {
            image,
            paste,
            request_timeout_secs,
        } => {
            let mut session = chat_session(config.as_ref(), request_timeout_secs)?;
            if let Some(path) = image {
                session.pick_image(path);
            }
            session.run_interactive(paste).await?;
        }

        Commands::Settings { action } => {
            let mut store = SettingsStore::open(config.as_deref())?;
            match action {
                SettingsAction::Show => {
                    for key in SettingKey::ALL {
                        let value = store.get(key);
                        let shown = if key == SettingKey::ApiKey {
                            mask_secret(value)
                        } else {
                            value.to_string()
                        };
                        println!("{:<20} {}", key.as_str(), shown);
                    }
                }
                SettingsAction::Get { key } => {
                    let key: SettingKey = key.parse()?;
                    println!("{}", store.get(key));
                }
                SettingsAction::Set { key, value } => {
                    let key: SettingKey = key.parse()?;
                    store.set(key, value)?;
                    println!("Saved {} to {}", key, store.path().display());
                }
                SettingsAction::Reset => {
                    store.reset()?;
                    println!("Settings reset to defaults");
                }
                SettingsAction::Path => println!("{}", store.path().display()),
            }
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    if let Err(e) = run(cli).await {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}
