//! §4.B CAN error monitor: tracks bus health from received error frames and
//! gates transmission while the bus is unusable. Built on the `CanError`
//! decode in `errors.rs`, which already distinguishes `BusOff`, `NoAck`, and
//! `ControllerProblem` — the three trigger classes discriminated here.

use crate::can::errors::{CanError, ControllerProblem};
use crate::can::frame::CanFrame;
use crate::logging::log_printf;
use log::Level;

/// N_noack_max: consecutive unacknowledged transmissions before the monitor
/// treats the bus as unreachable and enters LISTEN_ONLY.
const N_NOACK_MAX: u32 = 16;

/// T_listen: minimum time LISTEN_ONLY is held before a transmission attempt
/// is allowed to probe the bus again.
const T_LISTEN_US: u64 = 10_000_000;

/// `CANerrorStatus` bits (§3 "cumulative bus-error status bitfield", §7).
pub const STATUS_BUS_OFF: u32 = 1 << 0;
pub const STATUS_RX_PASSIVE: u32 = 1 << 1;
pub const STATUS_TX_PASSIVE: u32 = 1 << 2;
pub const STATUS_RX_WARNING: u32 = 1 << 3;
pub const STATUS_TX_WARNING: u32 = 1 << 4;
pub const STATUS_RX_OVERFLOW: u32 = 1 << 5;
pub const STATUS_TX_OVERFLOW: u32 = 1 << 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusState {
    Active,
    ListenOnly,
    BusOff,
}

/// §3 "Error monitor": per-interface bus health state machine, driven by
/// decoded error frames and transmit outcomes.
pub struct ErrorMonitor {
    state: BusState,
    noack_count: u32,
    listen_since_us: u64,
    status: u32,
}

impl ErrorMonitor {
    pub fn new() -> ErrorMonitor {
        ErrorMonitor { state: BusState::Active, noack_count: 0, listen_since_us: 0, status: 0 }
    }

    pub fn state(&self) -> BusState {
        self.state
    }

    /// `CANerrorStatus`: the cumulative bus-error status bitfield the
    /// protocol layer samples (§7). Not cleared by reading it.
    pub fn status(&self) -> u32 {
        self.status
    }

    /// Sets the TX-overflow status bit, used by the driver on `ENOBUFS` and
    /// on a re-drive of an already-full TX buffer (§4.C `send`).
    pub fn set_tx_overflow(&mut self) {
        self.status |= STATUS_TX_OVERFLOW;
    }

    /// Feeds one received error frame to the monitor. `now_us` is the
    /// monotonic clock reading at the time of reception, used to timestamp
    /// LISTEN_ONLY entry.
    pub fn on_error_frame(&mut self, frame: &CanFrame, now_us: u64) {
        let decoded = match CanError::from_frame(frame) {
            Ok(e) => e,
            Err(_) => return,
        };

        match decoded {
            CanError::BusOff => self.enter_bus_off(),
            CanError::NoAck => self.on_noack(now_us),
            CanError::ControllerProblem(problem) => self.apply_controller_problem(problem),
            CanError::Restarted => self.on_recovery_reset(),
            _ => {}
        }
    }

    /// §4.B "Controller status (CRTL)": clears the BUS_OFF status bit, then
    /// sets the bit matching the reported condition. A warning clears its
    /// corresponding passive bit; no hardware counter is tracked here.
    fn apply_controller_problem(&mut self, problem: ControllerProblem) {
        self.status &= !STATUS_BUS_OFF;
        match problem {
            ControllerProblem::ReceiveBufferOverflow => self.status |= STATUS_RX_OVERFLOW,
            ControllerProblem::TransmitBufferOverflow => self.status |= STATUS_TX_OVERFLOW,
            ControllerProblem::ReceiveErrorWarning => {
                self.status |= STATUS_RX_WARNING;
                self.status &= !STATUS_RX_PASSIVE;
            }
            ControllerProblem::TransmitErrorWarning => {
                self.status |= STATUS_TX_WARNING;
                self.status &= !STATUS_TX_PASSIVE;
            }
            ControllerProblem::ReceiveErrorPassive => self.status |= STATUS_RX_PASSIVE,
            ControllerProblem::TransmitErrorPassive => self.status |= STATUS_TX_PASSIVE,
            ControllerProblem::Active | ControllerProblem::Unspecified => {}
        }
        log_printf(Level::Warn, None, format_args!("CAN controller status error frame received: {}", problem));
    }

    /// Records a successful, acknowledged transmission. Clears the ACK-miss
    /// counter; does not by itself leave LISTEN_ONLY (only a received data
    /// frame, per §4.B, does that).
    pub fn on_tx_ack(&mut self) {
        self.noack_count = 0;
    }

    fn on_noack(&mut self, now_us: u64) {
        if self.state == BusState::BusOff {
            return;
        }
        self.noack_count = self.noack_count.saturating_add(1);
        if self.noack_count >= N_NOACK_MAX && self.state == BusState::Active {
            self.enter_listen_only(now_us);
        }
    }

    fn enter_listen_only(&mut self, now_us: u64) {
        log_printf(
            Level::Warn,
            None,
            format_args!("CAN bus entering listen-only after {} unacknowledged frames", self.noack_count),
        );
        self.state = BusState::ListenOnly;
        self.listen_since_us = now_us;
    }

    fn enter_bus_off(&mut self) {
        log_printf(Level::Warn, None, format_args!("CAN bus-off indicated by controller"));
        self.state = BusState::BusOff;
        self.noack_count = 0;
        self.status |= STATUS_BUS_OFF;
    }

    /// A data frame was successfully received from the bus: direct evidence
    /// the bus is usable, so LISTEN_ONLY is cleared immediately (§4.B).
    pub fn on_data_frame_received(&mut self) {
        if self.state == BusState::ListenOnly {
            log_printf(Level::Info, None, format_args!("CAN bus leaving listen-only: frame received"));
            self.state = BusState::Active;
            self.noack_count = 0;
        }
    }

    /// Called after the driver performs a bus-off recovery reset (interface
    /// bounced via `ip link set ... down/up`, §4.B/§6) or the kernel reports
    /// `CanError::Restarted`. The only path out of `BUS_OFF`.
    pub fn on_recovery_reset(&mut self) {
        log_printf(Level::Info, None, format_args!("CAN bus-off recovery reset; bus state returning to active"));
        self.state = BusState::Active;
        self.noack_count = 0;
        self.status = 0;
    }

    /// Whether the module may attempt a transmission. BUS_OFF always
    /// refuses. LISTEN_ONLY refuses until T_listen has elapsed since entry,
    /// at which point exactly one probe transmission is allowed through by
    /// provisionally clearing LISTEN_ONLY back to ACTIVE (§4.B).
    pub fn may_transmit(&mut self, now_us: u64) -> bool {
        match self.state {
            BusState::Active => true,
            BusState::BusOff => false,
            BusState::ListenOnly => {
                if now_us.saturating_sub(self.listen_since_us) >= T_LISTEN_US {
                    log_printf(
                        Level::Info,
                        None,
                        format_args!("CAN bus leaving listen-only: T_listen elapsed, probing with next transmission"),
                    );
                    self.state = BusState::Active;
                    true
                } else {
                    false
                }
            }
        }
    }
}

impl Default for ErrorMonitor {
    fn default() -> ErrorMonitor {
        ErrorMonitor::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::can::constants::{CAN_ERR_ACK, CAN_ERR_BUSOFF, CAN_ERR_CRTL, CAN_ERR_RESTARTED};

    fn error_frame(class: u32) -> CanFrame {
        CanFrame::new(class, &[0u8; 8], false, true).unwrap()
    }

    fn controller_problem_frame(code: u8) -> CanFrame {
        let mut data = [0u8; 8];
        data[1] = code;
        CanFrame::new(CAN_ERR_CRTL, &data, false, true).unwrap()
    }

    #[test]
    fn noack_escalates_to_listen_only_at_threshold() {
        let mut mon = ErrorMonitor::new();
        let frame = error_frame(CAN_ERR_ACK);
        for i in 0..N_NOACK_MAX {
            mon.on_error_frame(&frame, 1_000 * i as u64);
        }
        assert_eq!(mon.state(), BusState::ListenOnly);
    }

    #[test]
    fn bus_off_frame_sets_state_immediately() {
        let mut mon = ErrorMonitor::new();
        let frame = error_frame(CAN_ERR_BUSOFF);
        mon.on_error_frame(&frame, 0);
        assert_eq!(mon.state(), BusState::BusOff);
    }

    #[test]
    fn data_frame_clears_listen_only() {
        let mut mon = ErrorMonitor::new();
        let frame = error_frame(CAN_ERR_ACK);
        for i in 0..N_NOACK_MAX {
            mon.on_error_frame(&frame, i as u64);
        }
        assert_eq!(mon.state(), BusState::ListenOnly);
        mon.on_data_frame_received();
        assert_eq!(mon.state(), BusState::Active);
    }

    #[test]
    fn listen_only_blocks_transmission_until_t_listen_elapses() {
        let mut mon = ErrorMonitor::new();
        let frame = error_frame(CAN_ERR_ACK);
        for i in 0..N_NOACK_MAX {
            mon.on_error_frame(&frame, i as u64);
        }
        assert!(!mon.may_transmit(N_NOACK_MAX as u64));
        assert!(mon.may_transmit(N_NOACK_MAX as u64 + T_LISTEN_US));
    }

    #[test]
    fn probe_transmission_provisionally_clears_listen_only() {
        let mut mon = ErrorMonitor::new();
        let frame = error_frame(CAN_ERR_ACK);
        for i in 0..N_NOACK_MAX {
            mon.on_error_frame(&frame, i as u64);
        }
        assert!(mon.may_transmit(N_NOACK_MAX as u64 + T_LISTEN_US));
        assert_eq!(mon.state(), BusState::Active);
    }

    #[test]
    fn bus_off_never_permits_transmission() {
        let mut mon = ErrorMonitor::new();
        mon.on_error_frame(&error_frame(CAN_ERR_BUSOFF), 0);
        assert!(!mon.may_transmit(u64::MAX));
    }

    #[test]
    fn bus_off_sets_status_bit_and_restarted_clears_it() {
        let mut mon = ErrorMonitor::new();
        mon.on_error_frame(&error_frame(CAN_ERR_BUSOFF), 0);
        assert_eq!(mon.status() & STATUS_BUS_OFF, STATUS_BUS_OFF);

        mon.on_error_frame(&error_frame(CAN_ERR_RESTARTED), 1);
        assert_eq!(mon.state(), BusState::Active);
        assert_eq!(mon.status(), 0);
    }

    #[test]
    fn controller_warning_sets_warning_and_clears_passive_bit() {
        let mut mon = ErrorMonitor::new();
        mon.on_error_frame(&controller_problem_frame(0x10), 0); // ReceiveErrorPassive
        assert_eq!(mon.status() & STATUS_RX_PASSIVE, STATUS_RX_PASSIVE);

        mon.on_error_frame(&controller_problem_frame(0x04), 1); // ReceiveErrorWarning
        assert_eq!(mon.status() & STATUS_RX_WARNING, STATUS_RX_WARNING);
        assert_eq!(mon.status() & STATUS_RX_PASSIVE, 0);
    }

    #[test]
    fn controller_status_frame_clears_bus_off_bit() {
        let mut mon = ErrorMonitor::new();
        mon.on_error_frame(&error_frame(CAN_ERR_BUSOFF), 0);
        assert_eq!(mon.status() & STATUS_BUS_OFF, STATUS_BUS_OFF);

        mon.on_error_frame(&controller_problem_frame(0x04), 1); // ReceiveErrorWarning
        assert_eq!(mon.status() & STATUS_BUS_OFF, 0);
    }
}
