//! Slave-side pseudo-terminal allocation and async I/O on its master end.
//!
//! The child runs as a session leader with the PTY as its controlling
//! terminal; this end keeps the master fd, made non-blocking and driven
//! through [`AsyncFd`] so reads and writes park on readiness instead of
//! tying up a thread. A separate dup of the fd serves window resizes, so
//! the resize handler and the split read/write halves never contend.

use {
    nix::pty::{openpty, Winsize},
    std::{
        io,
        os::fd::{AsRawFd, OwnedFd},
        pin::Pin,
        process::Stdio,
        task::{Context, Poll},
    },
    tokio::{
        io::{unix::AsyncFd, AsyncRead, AsyncWrite, ReadBuf},
        process::{Child, Command},
    },
};

use crate::protocol::Resize;

nix::ioctl_write_ptr_bad!(tiocswinsz, libc::TIOCSWINSZ, Winsize);

const DEFAULT_SIZE: Winsize = Winsize {
    ws_row: 24,
    ws_col: 80,
    ws_xpixel: 0,
    ws_ypixel: 0,
};

/// The master end of an allocated PTY.
pub struct PtyMaster {
    fd: AsyncFd<OwnedFd>,
}

/// A handle for applying window sizes, independent of the I/O halves.
pub struct PtyResizer {
    fd: OwnedFd,
}

impl PtyResizer {
    pub fn resize(&self, size: Resize) -> io::Result<()> {
        let winsize = Winsize {
            ws_row: size.rows,
            ws_col: size.cols,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };
        unsafe { tiocswinsz(self.fd.as_raw_fd(), &winsize) }
            .map_err(io::Error::from)?;
        Ok(())
    }
}

/// Allocate a PTY and spawn `program` inside it as a session leader.
///
/// The child starts at a default 80x24; the first resize message from the
/// master corrects it.
pub fn spawn(program: &str) -> io::Result<(PtyMaster, PtyResizer, Child)> {
    let pty = openpty(Some(&DEFAULT_SIZE), None::<&nix::sys::termios::Termios>)
        .map_err(io::Error::from)?;
    let master = pty.master;
    let slave = pty.slave;

    let resizer = PtyResizer {
        fd: master.try_clone()?,
    };

    let mut command = Command::new(program);
    command
        .stdin(Stdio::from(slave.try_clone()?))
        .stdout(Stdio::from(slave.try_clone()?))
        .stderr(Stdio::from(slave))
        .kill_on_drop(true);
    unsafe {
        command.pre_exec(|| {
            nix::unistd::setsid().map_err(io::Error::from)?;
            // Fd 0 is the PTY slave at this point; adopt it as the
            // controlling terminal.
            if libc::ioctl(0, libc::TIOCSCTTY as libc::c_ulong, 0) != 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        });
    }
    let child = command.spawn()?;

    Ok((PtyMaster::new(master)?, resizer, child))
}

impl PtyMaster {
    fn new(fd: OwnedFd) -> io::Result<Self> {
        set_nonblocking(&fd)?;
        Ok(PtyMaster {
            fd: AsyncFd::new(fd)?,
        })
    }
}

fn set_nonblocking(fd: &OwnedFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

impl AsyncRead for PtyMaster {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let mut chunk = [0u8; 4096];
        loop {
            let mut guard = match this.fd.poll_read_ready(cx) {
                Poll::Ready(guard) => guard?,
                Poll::Pending => return Poll::Pending,
            };
            let read = guard.try_io(|inner| {
                let n = unsafe {
                    libc::read(
                        inner.get_ref().as_raw_fd(),
                        chunk.as_mut_ptr() as *mut libc::c_void,
                        chunk.len().min(buf.remaining()),
                    )
                };
                if n < 0 {
                    let error = io::Error::last_os_error();
                    // A closed slave side surfaces as EIO; that is EOF here.
                    if error.raw_os_error() == Some(libc::EIO) {
                        return Ok(0);
                    }
                    return Err(error);
                }
                Ok(n as usize)
            });
            match read {
                Ok(Ok(n)) => {
                    buf.put_slice(&chunk[..n]);
                    return Poll::Ready(Ok(()));
                }
                Ok(Err(error)) => return Poll::Ready(Err(error)),
                Err(_would_block) => continue,
            }
        }
    }
}

impl AsyncWrite for PtyMaster {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        loop {
            let mut guard = match this.fd.poll_write_ready(cx) {
                Poll::Ready(guard) => guard?,
                Poll::Pending => return Poll::Pending,
            };
            let written = guard.try_io(|inner| {
                let n = unsafe {
                    libc::write(
                        inner.get_ref().as_raw_fd(),
                        buf.as_ptr() as *const libc::c_void,
                        buf.len(),
                    )
                };
                if n < 0 {
                    return Err(io::Error::last_os_error());
                }
                Ok(n as usize)
            });
            match written {
                Ok(result) => return Poll::Ready(result),
                Err(_would_block) => continue,
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn shell_in_pty_echoes_and_exits() {
        let (master, resizer, mut child) = spawn("sh").unwrap();
        resizer.resize(Resize { rows: 40, cols: 120 }).unwrap();

        let (mut read_half, mut write_half) = tokio::io::split(master);
        write_half.write_all(b"echo pty-ok\n").await.unwrap();

        // Read until the marker shows up; the PTY echoes input and may
        // print prompts around it.
        let seen = tokio::time::timeout(std::time::Duration::from_secs(10), async {
            let mut collected = Vec::new();
            let mut chunk = [0u8; 256];
            loop {
                let n = read_half.read(&mut chunk).await.unwrap();
                if n == 0 {
                    break false;
                }
                collected.extend_from_slice(&chunk[..n]);
                // Skip the echoed command line: the marker must appear
                // after a line that is exactly the output.
                if String::from_utf8_lossy(&collected)
                    .lines()
                    .any(|line| line.trim() == "pty-ok")
                {
                    break true;
                }
            }
        })
        .await
        .unwrap();
        assert!(seen);

        write_half.write_all(b"exit\n").await.unwrap();
        let status = tokio::time::timeout(std::time::Duration::from_secs(10), child.wait())
            .await
            .unwrap()
            .unwrap();
        assert!(status.success());
    }
}
