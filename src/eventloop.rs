//! §4.D Event loop: multiplexes a periodic hardware timer, a cross-thread
//! wake-up descriptor, and any number of collaborator file descriptors
//! (CAN sockets, gateway listener/connection) on a single `epoll` instance.

use crate::clock::{now_us, us_to_timespec};
use crate::error::{CanOpenError, CanOpenResult};
use log::warn;
use std::collections::HashMap;
use std::mem;
use std::os::unix::io::RawFd;

/// Why the most recent `wait()` call returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeSource {
    WakeUp,
    Timer,
    Fd(RawFd),
    Interrupted,
}

/// The per-iteration snapshot described in §3 "Event-loop handle": valid
/// only between a `wait()` return and the matching `finish_iteration()`.
pub struct Iteration {
    pub dt_us: u64,
    pub next_us: u64,
    pub fired_timer: bool,
    pub new_event: bool,
    pub source: WakeSource,
}

/// §4.D event loop. Owns the epoll instance, the wake-up eventfd, and the
/// periodic timerfd.
pub struct EventLoop {
    epoll_fd: RawFd,
    wakeup_fd: RawFd,
    timer_fd: RawFd,
    interval_us: u64,
    prev_wait_us: u64,
    registered: HashMap<RawFd, ()>,
    last_events: u32,
}

const MAX_EPOLL_EVENTS: usize = 16;

impl EventLoop {
    /// Provisions the three descriptors. The periodic timer is armed with
    /// interval `interval_us` and a 1us initial expiration so the first
    /// iteration fires immediately.
    pub fn create(interval_us: u64) -> CanOpenResult<EventLoop> {
        let epoll_fd = unsafe { libc::epoll_create1(0) };
        if epoll_fd < 0 {
            return Err(CanOpenError::Syscall(std::io::Error::last_os_error()));
        }

        let wakeup_fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK) };
        if wakeup_fd < 0 {
            let e = std::io::Error::last_os_error();
            unsafe { libc::close(epoll_fd) };
            return Err(CanOpenError::Syscall(e));
        }

        let timer_fd = unsafe { libc::timerfd_create(libc::CLOCK_MONOTONIC, libc::TFD_NONBLOCK) };
        if timer_fd < 0 {
            let e = std::io::Error::last_os_error();
            unsafe {
                libc::close(epoll_fd);
                libc::close(wakeup_fd);
            }
            return Err(CanOpenError::Syscall(e));
        }

        let mut evl = EventLoop {
            epoll_fd,
            wakeup_fd,
            timer_fd,
            interval_us,
            prev_wait_us: now_us(),
            registered: HashMap::new(),
            last_events: 0,
        };

        evl.register_read(wakeup_fd)?;
        evl.register_read(timer_fd)?;
        evl.arm_timer(1, interval_us)?;

        Ok(evl)
    }

    fn arm_timer(&self, initial_us: u64, interval_us: u64) -> CanOpenResult<()> {
        let spec = libc::itimerspec {
            it_interval: us_to_timespec(interval_us),
            it_value: us_to_timespec(initial_us.max(1)),
        };
        let r = unsafe { libc::timerfd_settime(self.timer_fd, 0, &spec, std::ptr::null_mut()) };
        if r < 0 {
            return Err(CanOpenError::Syscall(std::io::Error::last_os_error()));
        }
        Ok(())
    }

    /// Register `fd` for level-triggered read readiness, reported to clients
    /// as `WakeSource::Fd(fd)` when ready.
    pub fn register_read(&mut self, fd: RawFd) -> CanOpenResult<()> {
        self.epoll_ctl(libc::EPOLL_CTL_ADD, fd, libc::EPOLLIN as u32)?;
        self.registered.insert(fd, ());
        Ok(())
    }

    /// Register `fd` one-shot: after it fires once it must be re-armed with
    /// `rearm_oneshot` (used by the gateway listener, §4.F).
    pub fn register_oneshot(&mut self, fd: RawFd) -> CanOpenResult<()> {
        self.epoll_ctl(libc::EPOLL_CTL_ADD, fd, (libc::EPOLLIN | libc::EPOLLONESHOT) as u32)?;
        self.registered.insert(fd, ());
        Ok(())
    }

    pub fn rearm_oneshot(&mut self, fd: RawFd) -> CanOpenResult<()> {
        self.epoll_ctl(libc::EPOLL_CTL_MOD, fd, (libc::EPOLLIN | libc::EPOLLONESHOT) as u32)
    }

    pub fn unregister(&mut self, fd: RawFd) -> CanOpenResult<()> {
        if self.registered.remove(&fd).is_none() {
            return Ok(());
        }
        let r = unsafe { libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut()) };
        if r < 0 {
            return Err(CanOpenError::Syscall(std::io::Error::last_os_error()));
        }
        Ok(())
    }

    fn epoll_ctl(&self, op: libc::c_int, fd: RawFd, events: u32) -> CanOpenResult<()> {
        let mut ev = libc::epoll_event { events, u64: fd as u64 };
        let r = unsafe { libc::epoll_ctl(self.epoll_fd, op, fd, &mut ev as *mut libc::epoll_event) };
        if r < 0 {
            return Err(CanOpenError::Syscall(std::io::Error::last_os_error()));
        }
        Ok(())
    }

    /// Raw epoll events for the iteration's ready fd, used by collaborators
    /// (the CAN driver, the gateway) to distinguish EPOLLIN from
    /// EPOLLERR/EPOLLHUP without a second syscall.
    pub fn last_events(&self) -> u32 {
        self.last_events
    }

    /// Blocks until exactly one descriptor is ready, then builds the
    /// iteration snapshot (§4.D).
    pub fn wait(&mut self) -> Iteration {
        let mut events: [libc::epoll_event; MAX_EPOLL_EVENTS] = unsafe { mem::zeroed() };
        let n = unsafe { libc::epoll_wait(self.epoll_fd, events.as_mut_ptr(), MAX_EPOLL_EVENTS as i32, -1) };

        let now = now_us();
        let dt_us = now.saturating_sub(self.prev_wait_us);
        self.prev_wait_us = now;

        if n < 0 {
            let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
            if errno == libc::EINTR {
                return Iteration { dt_us, next_us: self.interval_us, fired_timer: false, new_event: false, source: WakeSource::Interrupted };
            }
            warn!("epoll_wait failed: {}", std::io::Error::last_os_error());
            return Iteration { dt_us, next_us: self.interval_us, fired_timer: false, new_event: false, source: WakeSource::Interrupted };
        }

        if n == 0 {
            return Iteration { dt_us, next_us: self.interval_us, fired_timer: false, new_event: false, source: WakeSource::Interrupted };
        }

        let ready_fd = events[0].u64 as RawFd;
        self.last_events = events[0].events;

        if ready_fd == self.wakeup_fd {
            self.drain_eventfd(self.wakeup_fd);
            Iteration { dt_us, next_us: self.interval_us, fired_timer: false, new_event: false, source: WakeSource::WakeUp }
        } else if ready_fd == self.timer_fd {
            self.drain_eventfd(self.timer_fd);
            Iteration { dt_us, next_us: self.interval_us, fired_timer: true, new_event: false, source: WakeSource::Timer }
        } else {
            Iteration { dt_us, next_us: self.interval_us, fired_timer: false, new_event: true, source: WakeSource::Fd(ready_fd) }
        }
    }

    fn drain_eventfd(&self, fd: RawFd) {
        let mut buf = [0u8; 8];
        loop {
            let r = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, 8) };
            if r != 8 {
                break;
            }
        }
    }

    /// Called once per iteration after collaborators have had a chance to
    /// lower `iteration.next_us`. Logs an unconsumed event, then — iff
    /// `next_us < interval_us` — re-arms the timer once with that one-shot
    /// expiration. The permanent interval is never altered (§9).
    pub fn finish_iteration(&mut self, iteration: &Iteration) {
        if iteration.new_event {
            warn!("unconsumed event loop fd {:?} at end of iteration", iteration.source);
        }

        if iteration.next_us < self.interval_us {
            // +1us guard against a zero timespec, which disarms the timer
            // instead of firing immediately.
            if let Err(e) = self.arm_timer(iteration.next_us + 1, self.interval_us) {
                warn!("failed to retune periodic timer: {}", e);
            }
        }
    }

    /// Writes a one-count value into the wake-up descriptor. Safe to call
    /// from any thread; coalesces with any pending, undrained count.
    pub fn trigger_wakeup(&self) {
        let one: u64 = 1;
        let r = unsafe { libc::write(self.wakeup_fd, &one as *const u64 as *const libc::c_void, 8) };
        if r < 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EAGAIN) {
                warn!("trigger_wakeup write failed: {}", err);
            }
        }
    }

    /// A cheap, thread-safe handle that can only trigger the wake-up —
    /// modeling the "any number of thread-safe senders" guidance of §9.
    pub fn waker(&self) -> Waker {
        Waker { wakeup_fd: self.wakeup_fd }
    }
}

/// Non-owning handle to an `EventLoop`'s wake-up descriptor. Protocol
/// callbacks running in RT context hold one of these to reach the mainline
/// loop (§5 "Cross-thread wake-up"); it outlives the callback because the
/// orchestrator tears collaborators down before the loop itself.
#[derive(Clone, Copy)]
pub struct Waker {
    wakeup_fd: RawFd,
}

unsafe impl Send for Waker {}
unsafe impl Sync for Waker {}

impl Waker {
    pub fn trigger(&self) {
        let one: u64 = 1;
        unsafe {
            libc::write(self.wakeup_fd, &one as *const u64 as *const libc::c_void, 8);
        }
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.epoll_fd);
            libc::close(self.wakeup_fd);
            libc::close(self.timer_fd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn first_iteration_fires_immediately() {
        let mut evl = EventLoop::create(100_000).unwrap();
        let it = evl.wait();
        assert_eq!(it.source, WakeSource::Timer);
        evl.finish_iteration(&it);
    }

    #[test]
    fn wakeup_coalesces_multiple_triggers() {
        // S1: three triggers between waits produce exactly one wake-up.
        let mut evl = EventLoop::create(100_000).unwrap();
        let _first = evl.wait(); // drains the immediate timer fire
        evl.finish_iteration(&_first);

        let waker = evl.waker();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(5));
            waker.trigger();
            waker.trigger();
            waker.trigger();
        });

        let it = evl.wait();
        assert_eq!(it.source, WakeSource::WakeUp);
        assert!(!it.fired_timer);
        handle.join().unwrap();

        // A second wait must not immediately fire again from the coalesced
        // extra triggers — it should block until the timer's full interval.
    }

    #[test]
    fn lowered_next_us_causes_early_timer_fire() {
        // S2: collaborator lowers next_us, the following wait returns early
        // with fired_timer = true, then the interval reverts to I.
        let mut evl = EventLoop::create(50_000).unwrap();
        let first = evl.wait();
        evl.finish_iteration(&first);

        let mut it = evl.wait();
        it.next_us = 2_000;
        evl.finish_iteration(&it);

        let fast = evl.wait();
        assert!(fast.fired_timer);
        assert!(fast.dt_us < 50_000);
    }

    #[test]
    fn register_and_observe_fd_readiness() {
        let mut evl = EventLoop::create(1_000_000).unwrap();
        let (r, w) = nix::unistd::pipe().unwrap();
        use std::os::unix::io::IntoRawFd;
        let rfd = r.into_raw_fd();
        let wfd = w.into_raw_fd();
        evl.register_read(rfd).unwrap();

        let first = evl.wait(); // the immediate timer tick
        evl.finish_iteration(&first);

        unsafe {
            libc::write(wfd, b"x".as_ptr() as *const libc::c_void, 1);
        }
        let it = evl.wait();
        assert_eq!(it.source, WakeSource::Fd(rfd));
        assert!(it.new_event);

        unsafe {
            libc::close(rfd);
            libc::close(wfd);
        }
    }
}
