use thiserror::Error;

/// Default Unix socket path for the tyan service
pub const DEFAULT_SOCKET_PATH: &str = "/run/user/$UID/tyan/tyan.sock";

/// Socket error types
#[derive(Error, Debug)]
pub enum SocketError {
    #[error("Socket connection error: {0}")]
    Connection(String),
    #[error("Socket I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

fn get_uid() -> String {
    std::env::var("UID").unwrap_or_else(|_| {
        // Fallback: use nix to get actual UID
        nix::unistd::getuid().to_string()
    })
}

/// Expand `$UID` and `$RUNTIME_DIRECTORY` in a socket path
pub fn expand_socket_path(path: &str) -> String {
    let expanded = path.replace("$UID", &get_uid());

    // Support $RUNTIME_DIRECTORY for systemd RuntimeDirectory=
    if let Ok(runtime_dir) = std::env::var("RUNTIME_DIRECTORY") {
        expanded.replace("$RUNTIME_DIRECTORY", &runtime_dir)
    } else {
        expanded
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_replaces_uid() {
        let expanded = expand_socket_path(DEFAULT_SOCKET_PATH);
        assert!(!expanded.contains("$UID"));
        assert!(expanded.starts_with("/run/user/"));
        assert!(expanded.ends_with("/tyan/tyan.sock"));
    }

    #[test]
    fn test_expand_leaves_plain_paths_alone() {
        assert_eq!(expand_socket_path("/tmp/tyan.sock"), "/tmp/tyan.sock");
    }
}
