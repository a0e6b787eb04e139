//! Bind target selection and socket creation.

use super::{Listener, ListenerError};
use std::fmt;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tokio::net::{TcpListener, UnixListener};
use tracing::{debug, info, warn};

/// Where a server should listen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindTarget {
    /// Filesystem path of a Unix domain socket.
    Unix(PathBuf),
    /// `host:port` TCP address. An empty host means all interfaces.
    Tcp(String),
}

/// Check whether an address string names a Unix socket path.
pub fn is_unix_address(addr: &str) -> bool {
    addr.starts_with('/') || addr.starts_with('.')
}

impl BindTarget {
    /// Classify a bind string.
    ///
    /// Paths starting with `/` or `.` are Unix sockets, anything with a `:`
    /// is a TCP address, everything else is rejected.
    pub fn parse(bind: &str) -> Result<Self, ListenerError> {
        if is_unix_address(bind) {
            Ok(BindTarget::Unix(PathBuf::from(bind)))
        } else if bind.contains(':') {
            Ok(BindTarget::Tcp(bind.to_string()))
        } else {
            Err(ListenerError::InvalidBind(bind.to_string()))
        }
    }

    /// Whether this target is a Unix domain socket.
    pub fn is_unix(&self) -> bool {
        matches!(self, BindTarget::Unix(_))
    }

    /// Address string suitable for `TcpListener::bind`.
    ///
    /// A leading `:` (no host) is expanded to the IPv4 wildcard.
    fn tcp_address(addr: &str) -> String {
        if addr.starts_with(':') {
            format!("0.0.0.0{addr}")
        } else {
            addr.to_string()
        }
    }
}

impl FromStr for BindTarget {
    type Err = ListenerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for BindTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BindTarget::Unix(path) => write!(f, "unix:{}", path.display()),
            BindTarget::Tcp(addr) => write!(f, "tcp:{addr}"),
        }
    }
}

/// Bind a listener for the given address string.
pub async fn listen(bind: &str) -> Result<Listener, ListenerError> {
    match BindTarget::parse(bind)? {
        BindTarget::Unix(path) => {
            info!(path = %path.display(), "listening on unix socket");
            listen_unix(&path)
        }
        BindTarget::Tcp(addr) => {
            info!(addr = %addr, "listening on tcp socket");
            listen_tcp(&addr).await
        }
    }
}

/// Bind a TCP listener.
pub async fn listen_tcp(addr: &str) -> Result<Listener, ListenerError> {
    let target = BindTarget::tcp_address(addr);
    let listener = TcpListener::bind(&target)
        .await
        .map_err(|source| ListenerError::Bind { target, source })?;
    Ok(Listener::Tcp(listener))
}

/// Bind a Unix domain socket, removing a stale socket file first.
///
/// The socket file is made world-accessible so a front-end web server
/// running as another user can connect.
pub fn listen_unix(path: &Path) -> Result<Listener, ListenerError> {
    remove_stale_socket(path)?;

    let listener = UnixListener::bind(path).map_err(|source| ListenerError::Bind {
        target: path.display().to_string(),
        source,
    })?;

    if let Err(e) = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o777)) {
        warn!(path = %path.display(), error = %e, "failed to set unix socket permissions");
    }

    Ok(Listener::Unix(listener))
}

/// Remove a socket file left behind by an earlier run.
///
/// A missing file is fine; any other error is returned.
pub fn remove_stale_socket(path: &Path) -> Result<(), ListenerError> {
    match std::fs::symlink_metadata(path) {
        Ok(_) => {
            debug!(path = %path.display(), "removing stale unix socket");
            std::fs::remove_file(path).map_err(|source| ListenerError::StaleSocket {
                path: path.to_path_buf(),
                source,
            })
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(ListenerError::StaleSocket {
            path: path.to_path_buf(),
            source,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_unix_targets() {
        assert_eq!(
            BindTarget::parse("/run/app.sock").unwrap(),
            BindTarget::Unix(PathBuf::from("/run/app.sock"))
        );
        assert_eq!(
            BindTarget::parse("./app.sock").unwrap(),
            BindTarget::Unix(PathBuf::from("./app.sock"))
        );
    }

    #[test]
    fn test_parse_tcp_targets() {
        assert_eq!(
            BindTarget::parse("127.0.0.1:8080").unwrap(),
            BindTarget::Tcp("127.0.0.1:8080".to_string())
        );
        assert_eq!(
            BindTarget::parse(":8080").unwrap(),
            BindTarget::Tcp(":8080".to_string())
        );
    }

    #[test]
    fn test_parse_rejects_plain_words() {
        let err = BindTarget::parse("localhost").unwrap_err();
        assert!(matches!(err, ListenerError::InvalidBind(ref s) if s == "localhost"));
    }

    #[test]
    fn test_unix_path_with_colon_is_unix() {
        // Path check wins over the port separator.
        assert!(BindTarget::parse("/tmp/a:b.sock").unwrap().is_unix());
    }

    #[test]
    fn test_tcp_address_expands_empty_host() {
        assert_eq!(BindTarget::tcp_address(":80"), "0.0.0.0:80");
        assert_eq!(BindTarget::tcp_address("[::1]:80"), "[::1]:80");
    }

    #[test]
    fn test_remove_stale_socket_missing_is_ok() {
        let dir = TempDir::new().unwrap();
        assert!(remove_stale_socket(&dir.path().join("missing.sock")).is_ok());
    }

    #[test]
    fn test_remove_stale_socket_removes_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("stale.sock");
        std::fs::write(&path, b"").unwrap();

        remove_stale_socket(&path).unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn test_remove_stale_socket_surfaces_other_errors() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("not-empty");
        std::fs::create_dir(&path).unwrap();
        std::fs::write(path.join("child"), b"x").unwrap();

        let err = remove_stale_socket(&path).unwrap_err();
        assert!(matches!(err, ListenerError::StaleSocket { .. }));
    }

    #[tokio::test]
    async fn test_listen_unix_replaces_stale_socket() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("app.sock");
        std::fs::write(&path, b"leftover").unwrap();

        let listener = listen_unix(&path).unwrap();
        assert!(listener.is_unix());

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o777);
    }

    #[tokio::test]
    async fn test_listen_rejects_invalid_bind() {
        let result = listen("nowhere").await;
        assert!(matches!(result, Err(ListenerError::InvalidBind(_))));
    }

    #[tokio::test]
    async fn test_listen_tcp_ephemeral_port() {
        let listener = listen("127.0.0.1:0").await.unwrap();
        assert!(!listener.is_unix());
    }
}
