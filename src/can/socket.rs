use log::debug;
use std::os::unix::io::{AsRawFd, FromRawFd, IntoRawFd, RawFd};
use std::{io, mem, ptr, time};

use crate::can::constants::*;
use crate::can::errors::CanSocketOpenError;
use crate::can::filter::CanFilter;
use crate::can::frame::CanFrame;
use crate::can::util::{
    set_socket_option, set_socket_option_mult, system_time_from_timespec, timeval_from_duration,
};

/// A socket for a CAN device.
///
/// Will be closed upon deallocation. To close manually, use std::drop::Drop.
/// Internally this is just a wrapped file-descriptor plus the interface
/// identity the §3 "CAN interface" object needs to report.
#[derive(Debug)]
pub struct CanSocket {
    fd: libc::c_int,
    ifname: String,
    ifindex: libc::c_uint,
}

/// A CAN address struct for binding a socket
#[derive(Debug)]
#[repr(C)]
struct CanAddr {
    af_can: libc::c_short,
    if_index: libc::c_int,
    rx_id: libc::c_uint, // transport protocol class address information (e.g. ISOTP)
    tx_id: libc::c_uint,
}

/// Outcome of a single non-blocking frame receive, carrying the ancillary
/// data the CAN driver needs per §4.C `poll_event`: the software RX
/// timestamp and the kernel's queue-overflow drop counter (`SO_RXQ_OVFL`).
#[derive(Debug)]
pub struct RxOutcome {
    pub frame: CanFrame,
    pub timestamp: Option<time::SystemTime>,
    pub rx_dropped: Option<u32>,
}

impl CanSocket {
    /// Open a named CAN device.
    ///
    /// Usually the more common case, opens a socket can device by name, such
    /// as "vcan0" or "can0".
    pub fn open(ifname: &str) -> Result<CanSocket, CanSocketOpenError> {
        match nix::net::if_::if_nametoindex(ifname) {
            Ok(ifindex) => CanSocket::open_interface(ifname, ifindex),
            Err(e) => Err(CanSocketOpenError::from(e)),
        }
    }

    fn open_interface(ifname: &str, if_index: libc::c_uint) -> Result<CanSocket, CanSocketOpenError> {
        let fd = CanSocket::open_socket()?;
        CanSocket::bind_socket(ifname, if_index, fd)
    }

    fn open_socket() -> Result<i32, CanSocketOpenError> {
        let fd: i32;
        unsafe {
            fd = libc::socket(libc::PF_CAN, libc::SOCK_RAW, CAN_RAW);
        }

        if fd == -1 {
            return Err(CanSocketOpenError::from(io::Error::last_os_error()));
        }

        Ok(fd)
    }

    fn bind_socket(ifname: &str, if_index: libc::c_uint, fd: i32) -> Result<CanSocket, CanSocketOpenError> {
        let socketaddr = CanAddr {
            af_can: libc::AF_CAN as libc::c_short,
            if_index: if_index as libc::c_int,
            rx_id: 0,
            tx_id: 0,
        };

        let r: i32;
        unsafe {
            let p = &socketaddr as *const CanAddr;
            r = libc::bind(fd, p as *const libc::sockaddr, mem::size_of::<CanAddr>() as u32);
        }

        if r == -1 {
            let e = io::Error::last_os_error();
            // clean up resource if failure to open
            unsafe {
                libc::close(fd);
            }
            return Err(CanSocketOpenError::from(e));
        }

        Ok(CanSocket { fd, ifname: ifname.to_owned(), ifindex: if_index })
    }

    pub fn ifname(&self) -> &str {
        &self.ifname
    }

    pub fn ifindex(&self) -> libc::c_uint {
        self.ifindex
    }

    pub fn close(&mut self) -> io::Result<()> {
        let r: i32;
        unsafe {
            r = libc::close(self.fd);
        }

        if r == -1 {
            return Err(io::Error::last_os_error());
        }

        Ok(())
    }

    /// Blocking read a single can frame with timestamp
    ///
    /// Note that reading a frame and retrieving the timestamp requires two
    /// consecutive syscalls.
    pub fn read(&self) -> io::Result<(CanFrame, time::SystemTime)> {
        let frame = self.read_socket()?;
        let ts = self.socket_timestamp()?;

        Ok((frame, ts))
    }

    fn socket_timestamp(&self) -> io::Result<time::SystemTime> {
        let mut ts = mem::MaybeUninit::<libc::timespec>::uninit();
        let r = unsafe { libc::ioctl(self.fd, SIOCGSTAMPNS as libc::c_ulong, ts.as_mut_ptr()) };

        if r == -1 {
            return Err(io::Error::last_os_error());
        }

        let ts = unsafe { ts.assume_init() };

        Ok(system_time_from_timespec(ts))
    }

    /// Blocking read a single can frame.
    fn read_socket(&self) -> io::Result<CanFrame> {
        let mut frame = CanFrame::empty();

        let r = unsafe {
            let frame_ptr = &mut frame as *mut CanFrame;
            libc::read(self.fd, frame_ptr as *mut libc::c_void, mem::size_of::<CanFrame>())
        };

        if r as usize != mem::size_of::<CanFrame>() {
            return Err(io::Error::last_os_error());
        }

        Ok(frame)
    }

    /// Non-blocking receive used by the driver's `poll_event` (§4.C): reads
    /// exactly one frame via `recvmsg`, decoding the `SO_TIMESTAMPNS` and
    /// `SO_RXQ_OVFL` ancillary data alongside it. Returns `WouldBlock` if no
    /// frame is queued.
    pub fn recv_with_ancillary(&self) -> io::Result<RxOutcome> {
        let mut frame = CanFrame::empty();
        let mut iov = libc::iovec {
            iov_base: &mut frame as *mut CanFrame as *mut libc::c_void,
            iov_len: mem::size_of::<CanFrame>(),
        };

        // Room for a SO_TIMESTAMPNS (timespec) and a SO_RXQ_OVFL (u32) cmsg.
        const CMSG_BUF_LEN: usize = 128;
        let mut cmsg_buf = [0u8; CMSG_BUF_LEN];

        let mut msg: libc::msghdr = unsafe { mem::zeroed() };
        msg.msg_iov = &mut iov as *mut libc::iovec;
        msg.msg_iovlen = 1;
        msg.msg_control = cmsg_buf.as_mut_ptr() as *mut libc::c_void;
        msg.msg_controllen = CMSG_BUF_LEN as _;

        let r = unsafe { libc::recvmsg(self.fd, &mut msg as *mut libc::msghdr, 0) };
        if r < 0 {
            return Err(io::Error::last_os_error());
        }
        if r as usize != mem::size_of::<CanFrame>() {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "short CAN frame read"));
        }

        let mut timestamp = None;
        let mut rx_dropped = None;

        unsafe {
            let mut cmsg_ptr = libc::CMSG_FIRSTHDR(&msg);
            while !cmsg_ptr.is_null() {
                let cmsg = &*cmsg_ptr;
                if cmsg.cmsg_level == libc::SOL_SOCKET && cmsg.cmsg_type == SO_TIMESTAMPNS {
                    let data_ptr = libc::CMSG_DATA(cmsg_ptr) as *const libc::timespec;
                    timestamp = Some(system_time_from_timespec(ptr::read_unaligned(data_ptr)));
                } else if cmsg.cmsg_level == libc::SOL_SOCKET && cmsg.cmsg_type == SO_RXQ_OVFL {
                    let data_ptr = libc::CMSG_DATA(cmsg_ptr) as *const u32;
                    rx_dropped = Some(ptr::read_unaligned(data_ptr));
                }
                cmsg_ptr = libc::CMSG_NXTHDR(&msg, cmsg_ptr);
            }
        }

        Ok(RxOutcome { frame, timestamp, rx_dropped })
    }

    /// Write a single can frame.
    ///
    /// Note that this function can fail with an `EAGAIN` error or similar.
    pub fn write(&self, frame: &CanFrame) -> io::Result<()> {
        let r = unsafe {
            let frame_ptr = frame as *const CanFrame;
            libc::write(self.fd, frame_ptr as *const libc::c_void, mem::size_of::<CanFrame>())
        };

        if r as usize != mem::size_of::<CanFrame>() {
            return Err(io::Error::last_os_error());
        }

        Ok(())
    }

    /// Change socket to non-blocking mode
    pub fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        let old_flags = unsafe { libc::fcntl(self.fd, libc::F_GETFL) };

        if old_flags == -1 {
            return Err(io::Error::last_os_error());
        }

        let new_flags = if nonblocking { old_flags | libc::O_NONBLOCK } else { old_flags & !libc::O_NONBLOCK };

        let r = unsafe { libc::fcntl(self.fd, libc::F_SETFL, new_flags) };

        if r != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub fn set_read_timeout(&self, duration: time::Duration) -> io::Result<()> {
        set_socket_option(self.fd, libc::SOL_SOCKET, libc::SO_RCVTIMEO, &timeval_from_duration(duration))
    }

    pub fn set_write_timeout(&self, duration: time::Duration) -> io::Result<()> {
        set_socket_option(self.fd, libc::SOL_SOCKET, libc::SO_SNDTIMEO, &timeval_from_duration(duration))
    }

    /// Sets filters on the socket.
    ///
    /// CAN packages received by SocketCAN are matched against these filters,
    /// only matching packets are returned by the interface.
    pub fn set_filters(&self, filters: &[CanFilter]) -> io::Result<()> {
        set_socket_option_mult(self.fd, SOL_CAN_RAW, CAN_RAW_FILTER, filters)
    }

    /// Sets the error mask on the socket (§4.C: at least ACK-miss, controller
    /// status, bus-off, bus-error).
    #[inline]
    pub fn set_error_mask(&self, mask: u32) -> io::Result<()> {
        set_socket_option(self.fd, SOL_CAN_RAW, CAN_RAW_ERR_FILTER, &mask)
    }

    #[inline]
    pub fn set_loopback(&self, enabled: bool) -> io::Result<()> {
        let loopback: libc::c_int = if enabled { 1 } else { 0 };
        set_socket_option(self.fd, SOL_CAN_RAW, CAN_RAW_LOOPBACK, &loopback)
    }

    pub fn set_recv_own_msgs(&self, enabled: bool) -> io::Result<()> {
        let recv_own_msgs: libc::c_int = if enabled { 1 } else { 0 };
        set_socket_option(self.fd, SOL_CAN_RAW, CAN_RAW_RECV_OWN_MSGS, &recv_own_msgs)
    }

    pub fn set_join_filters(&self, enabled: bool) -> io::Result<()> {
        let join_filters: libc::c_int = if enabled { 1 } else { 0 };
        set_socket_option(self.fd, SOL_CAN_RAW, CAN_RAW_JOIN_FILTERS, &join_filters)
    }

    /// Enable `SO_RXQ_OVFL`, letting `recv_with_ancillary` report how many
    /// frames the kernel dropped on this socket's queue since the last read.
    pub fn enable_rxq_overflow_reporting(&self) -> io::Result<()> {
        let one: libc::c_int = 1;
        set_socket_option(self.fd, libc::SOL_SOCKET, SO_RXQ_OVFL, &one)
    }

    /// Enable software RX timestamping (`SO_TIMESTAMPNS`), read back via the
    /// `recvmsg` ancillary data in `recv_with_ancillary`.
    pub fn enable_software_timestamping(&self) -> io::Result<()> {
        let one: libc::c_int = 1;
        set_socket_option(self.fd, libc::SOL_SOCKET, SO_TIMESTAMPNS, &one)
    }
}

impl AsRawFd for CanSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl FromRawFd for CanSocket {
    unsafe fn from_raw_fd(fd: RawFd) -> CanSocket {
        CanSocket { fd, ifname: String::new(), ifindex: 0 }
    }
}

impl IntoRawFd for CanSocket {
    fn into_raw_fd(self) -> RawFd {
        self.fd
    }
}

impl Drop for CanSocket {
    fn drop(&mut self) {
        match self.close() {
            Ok(_) => debug!("CAN socket dropped (fd: {})", self.fd),
            Err(e) => debug!("error closing CAN socket: {}", e),
        };
    }
}
