//! OS signals that can trigger a graceful shutdown.

use futures::future::select_all;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::io;
use tokio::signal::unix::{SignalKind, signal};

/// A catchable termination signal. SIGKILL cannot be handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Signal {
    Interrupt,
    Terminate,
    Quit,
    Hangup,
    User1,
}

impl Signal {
    /// Signals handled when the caller does not choose.
    pub const DEFAULT: &'static [Signal] = &[
        Signal::Interrupt,
        Signal::Terminate,
        Signal::Quit,
        Signal::Hangup,
        Signal::User1,
    ];

    pub fn kind(&self) -> SignalKind {
        match self {
            Signal::Interrupt => SignalKind::interrupt(),
            Signal::Terminate => SignalKind::terminate(),
            Signal::Quit => SignalKind::quit(),
            Signal::Hangup => SignalKind::hangup(),
            Signal::User1 => SignalKind::user_defined1(),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Signal::Interrupt => "SIGINT",
            Signal::Terminate => "SIGTERM",
            Signal::Quit => "SIGQUIT",
            Signal::Hangup => "SIGHUP",
            Signal::User1 => "SIGUSR1",
        }
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Install handlers for `signals` and return a future that resolves with
/// the first one received.
///
/// Handlers are installed before this returns, so a signal delivered while
/// the future has not been polled yet is not lost. With an empty list the
/// future never resolves.
pub fn listen(signals: &[Signal]) -> io::Result<impl Future<Output = Option<Signal>> + Send + 'static> {
    let mut streams = Vec::with_capacity(signals.len());
    for &sig in signals {
        streams.push((sig, signal(sig.kind())?));
    }

    Ok(async move {
        if streams.is_empty() {
            return std::future::pending().await;
        }
        let waits = streams
            .iter_mut()
            .map(|(sig, stream)| Box::pin(async move { stream.recv().await.map(|_| *sig) }));
        let (received, _, _) = select_all(waits).await;
        received
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_parse_signal_names() {
        let parsed: Vec<Signal> = serde_yaml::from_str("[interrupt, terminate, user1]").unwrap();
        assert_eq!(parsed, vec![Signal::Interrupt, Signal::Terminate, Signal::User1]);
        assert_eq!(Signal::Hangup.to_string(), "SIGHUP");
    }

    #[tokio::test]
    async fn test_empty_list_never_resolves() {
        let pending = listen(&[]).unwrap();
        assert!(tokio::time::timeout(Duration::from_millis(20), pending).await.is_err());
    }
}
