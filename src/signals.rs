//! Two-stage signal handling: the first SIGINT/SIGTERM cancels the root
//! context so in-flight phases abort cleanly; the second one gives up on
//! graceful shutdown.

use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Install the handler and return the root cancellation token.
pub fn install() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        wait_for_signal().await;
        warn!("received interrupt, cancelling operation (repeat to abort immediately)");
        token.cancel();

        wait_for_signal().await;
        warn!("second interrupt, aborting");
        std::process::exit(1);
    });
    cancel
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sigint = signal(SignalKind::interrupt()).expect("install SIGINT handler");
        let mut sigterm = signal(SignalKind::terminate()).expect("install SIGTERM handler");

        tokio::select! {
            _ = sigint.recv() => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.expect("install Ctrl+C handler");
    }
}
