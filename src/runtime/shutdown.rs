//! Termination signal listener used by [`Broker::run_until_shutdown`](super::Broker::run_until_shutdown).
//!
//! Unix listens for `SIGINT`, `SIGTERM` (Kubernetes pod stop) and `SIGQUIT`;
//! other platforms only for Ctrl-C.

/// Completes on the first termination signal.
#[cfg(unix)]
pub(crate) async fn termination_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    let mut quit = signal(SignalKind::quit())?;

    tokio::select! {
        _ = interrupt.recv() => {},
        _ = terminate.recv() => {},
        _ = quit.recv() => {},
    }
    Ok(())
}

/// Completes on Ctrl-C.
#[cfg(not(unix))]
pub(crate) async fn termination_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}
