//! Shutdown signal handling.
//!
//! [`SigDown`] listens for SIGTERM and SIGINT (Ctrl-C on Windows) in a
//! background task and cancels a [`CancellationToken`] when one arrives. The
//! HTTP server stops accepting connections on that token, after which the
//! gateway drains the log transport before exiting.

use std::io;

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Turns OS shutdown signals into a cancellation token.
#[allow(missing_debug_implementations)] // TaskTracker doesn't impl Debug
pub struct SigDown {
    listener: TaskTracker,
    token: CancellationToken,
}

impl SigDown {
    /// Registers the signal handlers and starts listening.
    ///
    /// # Errors
    ///
    /// Returns an [`io::Error`] if a handler cannot be registered.
    pub fn try_new() -> Result<Self, io::Error> {
        let token = CancellationToken::new();
        let signal = shutdown_signal()?;
        let listener = TaskTracker::new();
        let cancel = token.clone();
        listener.spawn(async move {
            tokio::select! {
                name = signal => {
                    tracing::info!(signal = name, "shutdown signal received");
                    cancel.cancel();
                }
                () = cancel.cancelled() => {}
            }
        });
        listener.close();
        Ok(Self { listener, token })
    }

    /// Returns a clone of the token cancelled on shutdown.
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Waits for shutdown and for the listener task to finish.
    pub async fn recv(&self) {
        self.token.cancelled().await;
        self.listener.wait().await;
    }
}

/// Resolves with the name of the first shutdown signal delivered.
///
/// Handlers are registered eagerly so a registration failure surfaces from
/// [`SigDown::try_new`] rather than inside the task.
#[cfg(unix)]
fn shutdown_signal() -> io::Result<impl Future<Output = &'static str> + Send> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    Ok(async move {
        tokio::select! {
            _ = sigterm.recv() => "SIGTERM",
            _ = sigint.recv() => "SIGINT",
        }
    })
}

#[cfg(not(unix))]
#[allow(clippy::unnecessary_wraps)] // mirrors the fallible unix registration
fn shutdown_signal() -> io::Result<impl Future<Output = &'static str> + Send> {
    Ok(async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %err, "Ctrl-C handler failed, shutting down");
        }
        "Ctrl-C"
    })
}
