use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Exit status used when a second signal forces an immediate exit.
const FORCED_EXIT_CODE: i32 = 130;

/// Cancel `token` on the first SIGTERM or SIGINT.
///
/// Workers drain their in-flight builds after the first signal; a second signal exits
/// the process without waiting.
pub fn install_shutdown_handler(token: CancellationToken) -> std::io::Result<JoinHandle<()>> {
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    Ok(tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM, draining workers");
            }
            _ = sigint.recv() => {
                tracing::info!("Received SIGINT, draining workers");
            }
        }
        token.cancel();

        tokio::select! {
            _ = sigterm.recv() => {}
            _ = sigint.recv() => {}
        }
        tracing::warn!("Second signal received, exiting without draining");
        std::process::exit(FORCED_EXIT_CODE);
    }))
}
