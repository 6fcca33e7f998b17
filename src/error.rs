//! The flat error taxonomy of §7: every fallible core operation returns one
//! of these variants. Propagation policy (§7): transient I/O is recovered
//! locally and never reaches this type; fatal setup errors abort startup;
//! runtime errors from the (out-of-scope) protocol stack become emergencies.

use std::{error, fmt, io};

#[derive(Debug)]
pub enum CanOpenError {
    IllegalArgument(&'static str),
    OutOfMemory,
    Syscall(io::Error),
    /// Operation attempted in the wrong lifecycle phase, e.g. `add_interface`
    /// after the module entered normal mode.
    InvalidState(&'static str),
    TxBusy,
    TxOverflow,
    DataCorrupt,
    OdParameters,
    NodeIdUnconfiguredLss,
}

impl fmt::Display for CanOpenError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            CanOpenError::IllegalArgument(msg) => write!(f, "illegal argument: {}", msg),
            CanOpenError::OutOfMemory => write!(f, "out of memory"),
            CanOpenError::Syscall(e) => write!(f, "syscall failed: {}", e),
            CanOpenError::InvalidState(msg) => write!(f, "invalid state: {}", msg),
            CanOpenError::TxBusy => write!(f, "transmit busy"),
            CanOpenError::TxOverflow => write!(f, "transmit overflow"),
            CanOpenError::DataCorrupt => write!(f, "data corrupt"),
            CanOpenError::OdParameters => write!(f, "inconsistent object dictionary parameters"),
            CanOpenError::NodeIdUnconfiguredLss => write!(f, "node-id unconfigured, LSS required"),
        }
    }
}

impl error::Error for CanOpenError {}

impl From<io::Error> for CanOpenError {
    fn from(e: io::Error) -> CanOpenError {
        CanOpenError::Syscall(e)
    }
}

impl From<crate::can::errors::CanSocketOpenError> for CanOpenError {
    fn from(e: crate::can::errors::CanSocketOpenError) -> CanOpenError {
        match e {
            crate::can::errors::CanSocketOpenError::IOError(io) => CanOpenError::Syscall(io),
            crate::can::errors::CanSocketOpenError::LookupError(nix_err) => {
                CanOpenError::Syscall(io::Error::from_raw_os_error(nix_err as i32))
            }
        }
    }
}

/// `OK` from §7 is modeled as `Result::Ok(())`, matching idiomatic Rust
/// rather than carrying a redundant success variant.
pub type CanOpenResult<T> = Result<T, CanOpenError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn syscall_error_displays_inner_io_error() {
        let e = CanOpenError::from(io::Error::from_raw_os_error(libc::ENOBUFS));
        assert!(e.to_string().contains("syscall failed"));
    }
}
