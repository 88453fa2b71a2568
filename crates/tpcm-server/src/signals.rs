//! Process signals for the connection manager.
//!
//! SIGTERM and SIGINT stop the manager; SIGHUP asks it to re-check its
//! installed manifest. Embedders and tests drive the same paths through
//! [`SignalHandler::request_shutdown`] and [`SignalHandler::request_reload`].

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, error, info};

struct Triggers {
    shutdown: watch::Sender<bool>,
    /// Counts reload requests; observers wait for it to move.
    reloads: watch::Sender<u64>,
}

/// Shared source of shutdown and reload requests. Clones refer to the same
/// requests.
#[derive(Clone)]
pub struct SignalHandler {
    triggers: Arc<Triggers>,
}

impl Default for SignalHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl SignalHandler {
    pub fn new() -> Self {
        let (shutdown, _) = watch::channel(false);
        let (reloads, _) = watch::channel(0);
        Self {
            triggers: Arc::new(Triggers { shutdown, reloads }),
        }
    }

    /// Listens for process signals on a background task. Call once at
    /// startup; without installed handlers the manager only stops through
    /// [`SignalHandler::request_shutdown`].
    pub fn spawn_listener(&self) {
        let handler = self.clone();
        tokio::spawn(async move {
            if let Err(error) = handler.listen().await {
                error!(%error, "cannot install signal handlers");
            }
            debug!("signal listener stopped");
        });
    }

    #[cfg(unix)]
    async fn listen(&self) -> std::io::Result<()> {
        use tokio::signal::unix::{SignalKind, signal};

        let mut term = signal(SignalKind::terminate())?;
        let mut int = signal(SignalKind::interrupt())?;
        let mut hup = signal(SignalKind::hangup())?;
        loop {
            let name = tokio::select! {
                _ = term.recv() => "SIGTERM",
                _ = int.recv() => "SIGINT",
                _ = hup.recv() => {
                    info!(signal = "SIGHUP", "re-checking installed manifest");
                    self.request_reload();
                    continue;
                }
            };
            info!(signal = name, "disconnecting all connections");
            self.request_shutdown();
            return Ok(());
        }
    }

    #[cfg(not(unix))]
    async fn listen(&self) -> std::io::Result<()> {
        tokio::signal::ctrl_c().await?;
        info!(signal = "ctrl-c", "disconnecting all connections");
        self.request_shutdown();
        Ok(())
    }

    pub fn request_shutdown(&self) {
        self.triggers.shutdown.send_replace(true);
    }

    pub fn request_reload(&self) {
        self.triggers.reloads.send_modify(|count| *count += 1);
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.triggers.shutdown.borrow()
    }

    /// Resolves once shutdown is requested, including a request made
    /// before this call.
    pub fn shutdown(&self) -> ShutdownSignal {
        ShutdownSignal {
            rx: self.triggers.shutdown.subscribe(),
        }
    }

    /// Reload requests made from now on.
    pub fn reload(&self) -> ReloadSignal {
        ReloadSignal {
            rx: self.triggers.reloads.subscribe(),
        }
    }
}

pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    pub async fn wait(mut self) {
        let _ = self.rx.wait_for(|stop| *stop).await;
    }
}

pub struct ReloadSignal {
    rx: watch::Receiver<u64>,
}

impl ReloadSignal {
    /// Waits for a reload request this signal has not reported yet.
    /// Several requests between two calls are reported once.
    pub async fn next(&mut self) {
        // the handler lives as long as anyone can still request a reload
        if self.rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn clones_share_requests() {
        let handler = SignalHandler::new();
        let other = handler.clone();
        assert!(!handler.is_shutting_down());
        other.request_shutdown();
        assert!(handler.is_shutting_down());
    }

    #[tokio::test]
    async fn shutdown_resolves_after_a_request() {
        let handler = SignalHandler::new();
        let shutdown = handler.shutdown();
        let requester = handler.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            requester.request_shutdown();
        });
        tokio::time::timeout(Duration::from_millis(500), shutdown.wait())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn earlier_shutdown_requests_count() {
        let handler = SignalHandler::new();
        handler.request_shutdown();
        tokio::time::timeout(Duration::from_millis(50), handler.shutdown().wait())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn reloads_are_reported_once() {
        let handler = SignalHandler::new();
        handler.request_reload();
        let mut reload = handler.reload();
        let stale = tokio::time::timeout(Duration::from_millis(20), reload.next()).await;
        assert!(stale.is_err(), "requests before subscribing are not replayed");

        handler.request_reload();
        handler.request_reload();
        tokio::time::timeout(Duration::from_millis(50), reload.next())
            .await
            .unwrap();
        let again = tokio::time::timeout(Duration::from_millis(20), reload.next()).await;
        assert!(again.is_err());
    }
}
