use std::time::Duration;

pub const APPLICATION: &str = "zeekat";

/// Maximum length of a control-channel or resize frame body.
pub const fn max_frame_length() -> usize {
    1024 * 1024
}

/// Maximum length of a stream header line, newline included.
pub const fn max_header_length() -> usize {
    512
}

/// How long a TLS handshake may take before the session is abandoned.
pub const fn tls_handshake_timeout() -> Duration {
    Duration::from_secs(10)
}

/// Grace period granted to background jobs after the foreground job exits,
/// and to the session after a cancellation signal.
pub const fn shutdown_grace() -> Duration {
    Duration::from_secs(5)
}

/// Window within which a second interrupt forces immediate process exit.
pub const fn second_signal_window() -> Duration {
    Duration::from_secs(5)
}
