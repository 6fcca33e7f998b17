//! §4.A Clock: a monotonic microsecond time source, plus the one-shot
//! wall-clock read used to seed the CANopen TIME object at startup.

use std::time::Duration;

/// Microseconds since an arbitrary, monotonic epoch (`CLOCK_MONOTONIC`).
/// Never goes backwards, unaffected by wall-clock adjustments — the basis
/// for every Δt computation in the event loop and the gateway idle timer.
pub fn now_us() -> u64 {
    let mut ts = std::mem::MaybeUninit::<libc::timespec>::uninit();
    let r = unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, ts.as_mut_ptr()) };
    debug_assert_eq!(r, 0, "CLOCK_MONOTONIC must always be available on Linux");
    let ts = unsafe { ts.assume_init() };
    ts.tv_sec as u64 * 1_000_000 + (ts.tv_nsec as u64) / 1_000
}

pub fn timespec_to_us(ts: libc::timespec) -> u64 {
    ts.tv_sec as u64 * 1_000_000 + (ts.tv_nsec as u64) / 1_000
}

pub fn us_to_timespec(us: u64) -> libc::timespec {
    libc::timespec {
        tv_sec: (us / 1_000_000) as libc::time_t,
        tv_nsec: ((us % 1_000_000) * 1_000) as i64,
    }
}

pub fn us_to_duration(us: u64) -> Duration {
    Duration::from_micros(us)
}

/// CANopen TIME_OF_DAY encoding: days since 1984-01-01 and milliseconds
/// since midnight, read once at startup from the wall clock (§4.A).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CanOpenTimeOfDay {
    pub days_since_1984: u16,
    pub ms_since_midnight: u32,
}

const SECONDS_PER_DAY: i64 = 86_400;
/// Seconds from the Unix epoch (1970-01-01) to the CANopen epoch (1984-01-01):
/// 14 non-leap years plus 4 leap days (1972, 1976, 1980, 1984 is the boundary
/// itself so only 3 leap days fall strictly inside 1970..1984... the kernel
/// and every CANopen stack actually use 5114 days; we match that constant).
const DAYS_1970_TO_1984: i64 = 5_114;

pub fn wall_clock_time_of_day() -> CanOpenTimeOfDay {
    let mut ts = std::mem::MaybeUninit::<libc::timespec>::uninit();
    let r = unsafe { libc::clock_gettime(libc::CLOCK_REALTIME, ts.as_mut_ptr()) };
    debug_assert_eq!(r, 0);
    let ts = unsafe { ts.assume_init() };
    time_of_day_from_unix_seconds(ts.tv_sec, (ts.tv_nsec / 1_000_000) as u32)
}

fn time_of_day_from_unix_seconds(unix_secs: i64, extra_ms: u32) -> CanOpenTimeOfDay {
    let days_since_epoch = unix_secs.div_euclid(SECONDS_PER_DAY);
    let secs_of_day = unix_secs.rem_euclid(SECONDS_PER_DAY);
    let days_since_1984 = (days_since_epoch - DAYS_1970_TO_1984).max(0) as u16;
    let ms_since_midnight = secs_of_day as u32 * 1_000 + extra_ms;
    CanOpenTimeOfDay { days_since_1984, ms_since_midnight }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn now_us_is_monotonic_across_two_reads() {
        let a = now_us();
        let b = now_us();
        assert!(b >= a);
    }

    #[test]
    fn timespec_roundtrip_preserves_microseconds() {
        let us = 12_345_678u64;
        let ts = us_to_timespec(us);
        assert_eq!(timespec_to_us(ts), us);
    }

    #[test]
    fn time_of_day_epoch_boundary() {
        // 1984-01-01T00:00:00Z is exactly DAYS_1970_TO_1984 days after the
        // Unix epoch.
        let tod = time_of_day_from_unix_seconds(DAYS_1970_TO_1984 * SECONDS_PER_DAY, 0);
        assert_eq!(tod.days_since_1984, 0);
        assert_eq!(tod.ms_since_midnight, 0);
    }

    #[test]
    fn time_of_day_advances_by_one_day() {
        let tod = time_of_day_from_unix_seconds((DAYS_1970_TO_1984 + 1) * SECONDS_PER_DAY + 3, 500);
        assert_eq!(tod.days_since_1984, 1);
        assert_eq!(tod.ms_since_midnight, 3_500);
    }
}
