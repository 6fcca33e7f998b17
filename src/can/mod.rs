//! CAN driver (§4.C), the error monitor (§4.B), and the SocketCAN primitives
//! they are built from.

pub mod constants;
pub mod driver;
pub mod errors;
pub mod filter;
pub mod frame;
pub mod monitor;
pub mod socket;
mod util;

pub use driver::{CanModule, RxSlot, SendOutcome, TxSlot};
pub use errors::{CanError, CanErrorDecodingFailure, CanSocketOpenError};
pub use filter::CanFilter;
pub use frame::CanFrame;
pub use monitor::{BusState, ErrorMonitor};
pub use socket::CanSocket;

/// Check an error return value for timeouts.
///
/// Due to the fact that timeouts are reported as errors, calling a blocking
/// read with a timeout that does not receive a frame in time results in an
/// error being returned. This trait adds a `should_retry` method to `Error`
/// and `Result` to check for this condition.
pub trait ShouldRetry {
    fn should_retry(&self) -> bool;
}

impl ShouldRetry for std::io::Error {
    fn should_retry(&self) -> bool {
        match self.kind() {
            std::io::ErrorKind::WouldBlock | std::io::ErrorKind::Interrupted => true,
            std::io::ErrorKind::Other => {
                matches!(self.raw_os_error(), Some(e) if e == libc::EINPROGRESS)
            }
            _ => false,
        }
    }
}

impl<E: std::fmt::Debug> ShouldRetry for std::io::Result<E> {
    fn should_retry(&self) -> bool {
        match self {
            Err(e) => e.should_retry(),
            Ok(_) => false,
        }
    }
}
