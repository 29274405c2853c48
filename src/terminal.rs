//! Master-side terminal control: raw mode and window-size reporting.

use {std::io, tracing::warn};

use crate::protocol::Resize;

/// Raw-mode handle. Restores the terminal on drop, which covers every exit
/// path including panics; raw-mode state is process-wide, so exactly one
/// guard exists per session.
pub struct RawModeGuard(());

/// Put the local terminal into raw mode until the guard drops.
pub fn enter_raw_mode() -> io::Result<RawModeGuard> {
    crossterm::terminal::enable_raw_mode()?;
    Ok(RawModeGuard(()))
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        if let Err(error) = crossterm::terminal::disable_raw_mode() {
            warn!(%error, "failed to restore terminal mode");
        }
    }
}

/// Best-effort restore for exit paths that never unwind to the guard,
/// such as a forced second-signal exit. Disabling raw mode when it was
/// never enabled is harmless.
pub fn restore() {
    let _ = crossterm::terminal::disable_raw_mode();
}

/// The current window size.
pub fn size() -> io::Result<Resize> {
    let (cols, rows) = crossterm::terminal::size()?;
    Ok(Resize { rows, cols })
}

/// Window-size change notifications.
#[cfg(unix)]
pub fn resize_signal() -> io::Result<tokio::signal::unix::Signal> {
    tokio::signal::unix::signal(tokio::signal::unix::SignalKind::window_change())
}
