//! §4.F Gateway server: a stdio/unix-socket/TCP listener multiplexed into
//! the same event loop as the CAN interfaces, speaking the ASCII gateway
//! protocol the orchestrator registers a parser callback for.

use crate::error::{CanOpenError, CanOpenResult};
use crate::eventloop::EventLoop;
use crate::logging::log_printf;
use log::Level;
use std::io::{Read, Write};
use std::mem;
use std::net::TcpListener;
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};

const LISTEN_BACKLOG: i32 = 50;

/// Selects the listening transport at startup (§4.F).
pub enum GatewayMode {
    Stdio,
    UnixSocket(std::path::PathBuf),
    Tcp(u16),
}

enum Listener {
    None,
    Unix(UnixListener),
    Tcp(TcpListener),
}

impl Listener {
    fn raw_fd(&self) -> Option<RawFd> {
        match self {
            Listener::None => None,
            Listener::Unix(l) => Some(l.as_raw_fd()),
            Listener::Tcp(l) => Some(l.as_raw_fd()),
        }
    }
}

/// §4.F gateway server.
pub struct Gateway {
    mode: GatewayMode,
    listener: Listener,
    active_fd: Option<RawFd>,
    active_stream: Option<Box<dyn ActiveConn>>,
    idle_elapsed_us: u64,
    idle_timeout_us: u64,
    fresh_command: bool,
}

trait ActiveConn: Read + Write + Send {}
impl<T: Read + Write + Send> ActiveConn for T {}

impl Gateway {
    /// Opens the listener (or, in `Stdio` mode, adopts fd 0 as the active
    /// connection directly) and registers it with the event loop. In socket
    /// modes `SIGPIPE` is suppressed process-wide per §4.F.
    pub fn create(evl: &mut EventLoop, mode: GatewayMode, idle_timeout_us: u64) -> CanOpenResult<Gateway> {
        let mut gw = Gateway {
            mode: GatewayMode::Stdio,
            listener: Listener::None,
            active_fd: None,
            active_stream: None,
            idle_elapsed_us: 0,
            idle_timeout_us,
            fresh_command: true,
        };

        match mode {
            GatewayMode::Stdio => {
                evl.register_read(0)?;
                gw.active_fd = Some(0);
                gw.mode = GatewayMode::Stdio;
            }
            GatewayMode::UnixSocket(ref path) => {
                ignore_sigpipe();
                let _ = std::fs::remove_file(path);
                let listener = UnixListener::bind(path).map_err(CanOpenError::Syscall)?;
                listener.set_nonblocking(true).map_err(CanOpenError::Syscall)?;
                evl.register_oneshot(listener.as_raw_fd())?;
                gw.listener = Listener::Unix(listener);
                gw.mode = GatewayMode::UnixSocket(path.clone());
            }
            GatewayMode::Tcp(port) => {
                ignore_sigpipe();
                let listener = bind_tcp_reuseaddr(port)?;
                listener.set_nonblocking(true).map_err(CanOpenError::Syscall)?;
                evl.register_oneshot(listener.as_raw_fd())?;
                gw.listener = Listener::Tcp(listener);
                gw.mode = GatewayMode::Tcp(port);
            }
        }

        Ok(gw)
    }

    fn listener_fd(&self) -> Option<RawFd> {
        self.listener.raw_fd()
    }

    /// Per-iteration state machine (§4.F). `dt_us` is the iteration's
    /// elapsed time, used to advance the idle timer when no gateway fd was
    /// the one that woke the loop. `feed` receives readable bytes for the
    /// ASCII parser; it returns the number of bytes it consumed space for
    /// (used only to size the next read, so a parser with no backpressure
    /// may return `usize::MAX`).
    pub fn poll_event(
        &mut self,
        evl: &mut EventLoop,
        ready_fd: Option<RawFd>,
        events: u32,
        dt_us: u64,
        mut feed: impl FnMut(&[u8]),
    ) {
        if ready_fd.is_some() && ready_fd == self.listener_fd() {
            self.accept_one(evl);
            return;
        }

        if ready_fd.is_some() && ready_fd == self.active_fd {
            if events & (libc::EPOLLHUP as u32 | libc::EPOLLERR as u32) != 0 {
                self.teardown_active(evl);
                return;
            }

            let mut buf = [0u8; 4096];
            let n = self.read_active(&mut buf);
            match n {
                Some(0) => self.teardown_active(evl),
                Some(n) => {
                    self.idle_elapsed_us = 0;
                    let chunk = self.apply_stdio_prefix(&buf[..n]);
                    feed(&chunk);
                    self.fresh_command = chunk.ends_with(b"\n");
                }
                None => {}
            }
            return;
        }

        // Neither fd fired: advance the idle clock. Idle timeout applies to
        // socket modes only (§6's `-T` description); stdio has no listener
        // to re-arm after a teardown, so it would never accept input again.
        if !matches!(self.mode, GatewayMode::Stdio) && self.idle_timeout_us > 0 && self.active_fd.is_some() {
            self.idle_elapsed_us += dt_us;
            if self.idle_elapsed_us > self.idle_timeout_us {
                log_printf(Level::Debug, None, format_args!("gateway connection idle timeout exceeded"));
                self.teardown_active(evl);
            }
        }
    }

    fn apply_stdio_prefix(&self, chunk: &[u8]) -> Vec<u8> {
        if !matches!(self.mode, GatewayMode::Stdio) || !self.fresh_command {
            return chunk.to_vec();
        }
        let starts_plain = chunk.first().map(|b| *b != b'[' && *b != b'#' && b.is_ascii_graphic()).unwrap_or(false);
        if starts_plain && chunk.ends_with(b"\n") {
            let mut prefixed = b"[0] ".to_vec();
            prefixed.extend_from_slice(chunk);
            prefixed
        } else {
            chunk.to_vec()
        }
    }

    fn read_active(&mut self, buf: &mut [u8]) -> Option<usize> {
        match self.active_fd {
            Some(0) if self.active_stream.is_none() => {
                let r = unsafe { libc::read(0, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
                if r < 0 {
                    None
                } else {
                    Some(r as usize)
                }
            }
            Some(_) => match self.active_stream.as_mut() {
                Some(s) => match s.read(buf) {
                    Ok(n) => Some(n),
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => None,
                    Err(_) => Some(0),
                },
                None => None,
            },
            None => None,
        }
    }

    fn accept_one(&mut self, evl: &mut EventLoop) {
        let accepted: Option<(RawFd, Box<dyn ActiveConn>)> = match &self.listener {
            Listener::Unix(l) => match l.accept() {
                Ok((stream, _)) => {
                    let _ = stream.set_nonblocking(true);
                    let fd = stream.as_raw_fd();
                    Some((fd, Box::new(stream)))
                }
                Err(_) => None,
            },
            Listener::Tcp(l) => match l.accept() {
                Ok((stream, _)) => {
                    let _ = stream.set_nonblocking(true);
                    let fd = stream.as_raw_fd();
                    Some((fd, Box::new(stream)))
                }
                Err(_) => None,
            },
            Listener::None => None,
        };

        match accepted {
            Some((fd, stream)) => {
                if let Err(e) = evl.register_read(fd) {
                    log_printf(Level::Warn, None, format_args!("failed to register gateway connection: {}", e));
                } else {
                    self.active_fd = Some(fd);
                    self.active_stream = Some(stream);
                    self.idle_elapsed_us = 0;
                    self.fresh_command = true;
                }
            }
            None => {
                if let Some(lfd) = self.listener_fd() {
                    let _ = evl.rearm_oneshot(lfd);
                }
            }
        }
    }

    fn teardown_active(&mut self, evl: &mut EventLoop) {
        if let Some(fd) = self.active_fd.take() {
            if !matches!(self.mode, GatewayMode::Stdio) {
                let _ = evl.unregister(fd);
            }
        }
        self.active_stream = None;
        if let Some(lfd) = self.listener_fd() {
            let _ = evl.rearm_oneshot(lfd);
        }
    }

    /// Write callback for the ASCII parser's response path. A short/blocked
    /// write (`EAGAIN`) is reported as zero bytes written so the parser can
    /// retry; no active connection reports zero as well.
    pub fn write_response(&mut self, bytes: &[u8]) -> usize {
        match self.active_fd {
            Some(0) if self.active_stream.is_none() => {
                let r = unsafe { libc::write(1, bytes.as_ptr() as *const libc::c_void, bytes.len()) };
                r.max(0) as usize
            }
            Some(_) => match self.active_stream.as_mut() {
                Some(s) => match s.write(bytes) {
                    Ok(n) => n,
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => 0,
                    Err(_) => 0,
                },
                None => 0,
            },
            None => 0,
        }
    }
}

/// §5 "the unix-socket path is unlinked from the filesystem on close": the
/// listener's bound path (not a per-connection teardown) is removed once the
/// `Gateway` itself goes out of scope at the end of a reset-loop iteration.
impl Drop for Gateway {
    fn drop(&mut self) {
        if let GatewayMode::UnixSocket(path) = &self.mode {
            let _ = std::fs::remove_file(path);
        }
    }
}

fn ignore_sigpipe() {
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }
}

fn bind_tcp_reuseaddr(port: u16) -> CanOpenResult<TcpListener> {
    let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0) };
    if fd < 0 {
        return Err(CanOpenError::Syscall(std::io::Error::last_os_error()));
    }
    let one: libc::c_int = 1;
    unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &one as *const libc::c_int as *const libc::c_void,
            mem::size_of::<libc::c_int>() as u32,
        );
    }

    let addr = libc::sockaddr_in {
        sin_family: libc::AF_INET as libc::sa_family_t,
        sin_port: port.to_be(),
        sin_addr: libc::in_addr { s_addr: 0 }, // 0.0.0.0
        sin_zero: [0; 8],
    };

    let r = unsafe {
        libc::bind(fd, &addr as *const libc::sockaddr_in as *const libc::sockaddr, mem::size_of::<libc::sockaddr_in>() as u32)
    };
    if r < 0 {
        let e = std::io::Error::last_os_error();
        unsafe { libc::close(fd) };
        return Err(CanOpenError::Syscall(e));
    }

    let r = unsafe { libc::listen(fd, LISTEN_BACKLOG) };
    if r < 0 {
        let e = std::io::Error::last_os_error();
        unsafe { libc::close(fd) };
        return Err(CanOpenError::Syscall(e));
    }

    Ok(unsafe { TcpListener::from_raw_fd(fd) })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stdio_prefix_applied_to_plain_fresh_command() {
        let gw = Gateway {
            mode: GatewayMode::Stdio,
            listener: Listener::None,
            active_fd: Some(0),
            active_stream: None,
            idle_elapsed_us: 0,
            idle_timeout_us: 0,
            fresh_command: true,
        };
        let out = gw.apply_stdio_prefix(b"read 0x1000 0\n");
        assert_eq!(out, b"[0] read 0x1000 0\n".to_vec());
    }

    #[test]
    fn stdio_prefix_skipped_when_already_addressed() {
        let gw = Gateway {
            mode: GatewayMode::Stdio,
            listener: Listener::None,
            active_fd: Some(0),
            active_stream: None,
            idle_elapsed_us: 0,
            idle_timeout_us: 0,
            fresh_command: true,
        };
        let out = gw.apply_stdio_prefix(b"[0] read 0x1000 0\n");
        assert_eq!(out, b"[0] read 0x1000 0\n".to_vec());
    }

    #[test]
    fn unix_listener_registers_oneshot_on_create() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gw.sock");
        let mut evl = EventLoop::create(1_000_000).unwrap();
        let gw = Gateway::create(&mut evl, GatewayMode::UnixSocket(path.clone()), 0).unwrap();
        assert!(gw.listener_fd().is_some());
        assert!(path.exists() || UnixStream::connect(&path).is_ok());
    }
}
