//! Bridging process signals into session cancellation.
//!
//! The first interrupt or terminate cancels the session scope and lets the
//! supervisor unwind everything gracefully. A second signal inside the
//! window means the user has given up waiting: exit immediately with the
//! conventional 128+signo code.

use {tokio_util::sync::CancellationToken, tracing::info};

use crate::defaults;

/// Watch for shutdown signals for the lifetime of the process.
pub fn spawn_watcher(cancel: CancellationToken) {
    tokio::spawn(watch(cancel));
}

#[cfg(unix)]
async fn watch(cancel: CancellationToken) {
    use tokio::signal::unix::{signal, SignalKind};
    use tracing::error;

    let (mut interrupt, mut terminate) = match (
        signal(SignalKind::interrupt()),
        signal(SignalKind::terminate()),
    ) {
        (Ok(interrupt), Ok(terminate)) => (interrupt, terminate),
        (interrupt, terminate) => {
            error!(
                "failed to install signal handlers: {:?} {:?}",
                interrupt.err(),
                terminate.err()
            );
            return;
        }
    };

    tokio::select! {
        _ = interrupt.recv() => {}
        _ = terminate.recv() => {}
    }
    info!("shutdown signal received; closing the session");
    cancel.cancel();

    let window = tokio::time::sleep(defaults::second_signal_window());
    tokio::pin!(window);
    let forced = tokio::select! {
        () = &mut window => None,
        _ = interrupt.recv() => Some(libc::SIGINT),
        _ = terminate.recv() => Some(libc::SIGTERM),
    };
    if let Some(signo) = forced {
        // A forced exit skips every destructor; put the terminal back
        // before going.
        crate::terminal::restore();
        eprintln!("second signal; exiting immediately");
        std::process::exit(128 + signo);
    }
}

#[cfg(not(unix))]
async fn watch(cancel: CancellationToken) {
    if tokio::signal::ctrl_c().await.is_err() {
        return;
    }
    info!("shutdown signal received; closing the session");
    cancel.cancel();

    let window = tokio::time::sleep(defaults::second_signal_window());
    tokio::pin!(window);
    tokio::select! {
        () = &mut window => {}
        _ = tokio::signal::ctrl_c() => {
            // A forced exit skips every destructor; put the terminal back
            // before going.
            crate::terminal::restore();
            eprintln!("second signal; exiting immediately");
            std::process::exit(1);
        }
    }
}
