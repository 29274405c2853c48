//! Plain TCP dial and listen.

use {
    std::io,
    tokio::net::{lookup_host, TcpListener, TcpStream},
};

use crate::protocol::format_addr;

/// Resolve `host:port` and connect to the first address that answers.
pub async fn dial(host: &str, port: u16) -> io::Result<TcpStream> {
    let mut addresses = lookup_host((host, port)).await?;

    let mut connect_error = None;
    let stream = loop {
        if let Some(address) = addresses.next() {
            match TcpStream::connect(address).await {
                Ok(stream) => break stream,
                Err(e) => connect_error = Some(e),
            }
        } else {
            return Err(connect_error.unwrap_or_else(|| {
                io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("unknown host: {}", host),
                )
            }));
        }
    };

    // Control traffic is small and latency-sensitive; send it immediately.
    stream.set_nodelay(true)?;
    Ok(stream)
}

/// Bind `host:port`; an empty host binds all interfaces.
pub async fn listen(host: &str, port: u16) -> io::Result<TcpListener> {
    TcpListener::bind(format_addr(host, port)).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn dial_reaches_a_local_listener() {
        let listener = listen("127.0.0.1", 0).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (dialed, accepted) = tokio::join!(dial("127.0.0.1", port), listener.accept());
        dialed.unwrap();
        accepted.unwrap();
    }

    #[tokio::test]
    async fn empty_host_binds_all_interfaces() {
        listen("", 0).await.unwrap();
    }
}
