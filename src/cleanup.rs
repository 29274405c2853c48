//! Best-effort removal of the running executable, for slaves deployed as
//! drop-and-forget binaries.

use tracing::{debug, warn};

/// Delete the current executable. Failure is logged, never fatal: on
/// platforms that refuse to unlink a running binary there is nothing more
/// to do.
pub fn self_delete() {
    match std::env::current_exe() {
        Ok(path) => match std::fs::remove_file(&path) {
            Ok(()) => debug!(path = %path.display(), "removed executable"),
            Err(error) => warn!(%error, path = %path.display(), "could not remove executable"),
        },
        Err(error) => warn!(%error, "could not resolve the executable path"),
    }
}
