use crate::can::constants::*;
use crate::can::errors::{CanError, CanErrorDecodingFailure};
use crate::error::CanOpenError;
use itertools::Itertools;
use std::fmt;

/// CanFrame
///
/// Uses the same memory layout as the underlying kernel struct for
/// performance reasons: this is the kernel's 16-byte `struct can_frame`
/// (§6 "Wire (CAN)").
#[derive(Debug, Copy, Clone)]
#[repr(C)]
pub struct CanFrame {
    /// 32 bit CAN_ID + EFF/RTR/ERR flags
    id: u32,
    /// data length. Bytes beyond are not valid
    data_len: u8,
    /// padding
    pad: u8,
    /// reserved
    res0: u8,
    /// reserved
    res1: u8,
    /// buffer for data
    data: [u8; 8],
}

impl CanFrame {
    pub fn new(id: u32, data: &[u8], rtr: bool, err: bool) -> Result<CanFrame, CanOpenError> {
        let mut full_id = id;

        if data.len() > 8 {
            return Err(CanOpenError::IllegalArgument("CAN payload exceeds 8 bytes"));
        }

        if id > EFF_MASK {
            return Err(CanOpenError::IllegalArgument("CAN id exceeds EFF_MASK"));
        }

        // set EFF_FLAG on large message
        if id > SFF_MASK {
            full_id |= EFF_FLAG;
        }

        if rtr {
            full_id |= RTR_FLAG;
        }

        if err {
            full_id |= ERR_FLAG;
        }

        let mut full_data = [0u8; 8];
        full_data[..data.len()].copy_from_slice(data);

        Ok(CanFrame {
            id: full_id,
            data_len: data.len() as u8,
            pad: 0,
            res0: 0,
            res1: 0,
            data: full_data,
        })
    }

    /// The all-zero frame used to receive into before a `read`/`recvmsg`.
    pub fn empty() -> CanFrame {
        CanFrame { id: 0, data_len: 0, pad: 0, res0: 0, res1: 0, data: [0; 8] }
    }

    /// Construct a TX-buffer frame: identifier with the RTR bit folded in,
    /// per §3 "TX buffer".
    pub fn for_tx(id: u32, rtr: bool, dlc: u8, payload: [u8; 8]) -> CanFrame {
        let mut full_id = id & SFF_MASK;
        if id > SFF_MASK {
            full_id = (id & EFF_MASK) | EFF_FLAG;
        }
        if rtr {
            full_id |= RTR_FLAG;
        }
        CanFrame { id: full_id, data_len: dlc.min(8), pad: 0, res0: 0, res1: 0, data: payload }
    }

    /// Return the actual CAN ID (without EFF/RTR/ERR flags)
    #[inline]
    pub fn id(&self) -> u32 {
        if self.is_extended() {
            self.id & EFF_MASK
        } else {
            self.id & SFF_MASK
        }
    }

    /// The raw identifier word, flags included.
    #[inline]
    pub fn raw_id(&self) -> u32 {
        self.id
    }

    /// Return the error class bits (only meaningful if `is_error()`)
    #[inline]
    pub fn err(&self) -> u32 {
        self.id & ERR_MASK
    }

    /// Check if frame uses 29 bit extended frame format
    #[inline]
    pub fn is_extended(&self) -> bool {
        self.id & EFF_FLAG != 0
    }

    /// Check if frame is an error message
    #[inline]
    pub fn is_error(&self) -> bool {
        self.id & ERR_FLAG != 0
    }

    /// Check if frame is a remote transmission request
    #[inline]
    pub fn is_rtr(&self) -> bool {
        self.id & RTR_FLAG != 0
    }

    #[inline]
    pub fn dlc(&self) -> u8 {
        self.data_len
    }

    /// A slice into the actual data. Slice will always be <= 8 bytes in length
    #[inline]
    pub fn data(&self) -> &[u8] {
        &self.data[..(self.data_len as usize)]
    }

    /// Read error from message and transform it into a `CanError`.
    #[inline]
    pub fn error(&self) -> Result<CanError, CanErrorDecodingFailure> {
        CanError::from_frame(self)
    }
}

impl fmt::UpperHex for CanFrame {
    fn fmt(&self, f: &mut fmt::Formatter) -> Result<(), fmt::Error> {
        write!(f, "{:X}#", self.id())?;

        let mut parts = self.data().iter().map(|v| format!("{:02X}", v));

        let sep = if f.alternate() { " " } else { "" };
        write!(f, "{}", parts.join(sep))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_sets_eff_flag_for_large_ids() {
        let f = CanFrame::new(0x1ABCDE, &[1, 2, 3], false, false).unwrap();
        assert!(f.is_extended());
        assert_eq!(f.id(), 0x1ABCDE);
    }

    #[test]
    fn new_rejects_oversized_payload() {
        let data = [0u8; 9];
        assert!(CanFrame::new(1, &data, false, false).is_err());
    }

    #[test]
    fn for_tx_folds_rtr_bit() {
        let f = CanFrame::for_tx(0x123, true, 0, [0; 8]);
        assert!(f.is_rtr());
        assert_eq!(f.id(), 0x123);
    }
}
