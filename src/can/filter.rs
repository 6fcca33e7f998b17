use crate::can::constants::{EFF_FLAG, RTR_FLAG, SFF_MASK};
use crate::error::CanOpenError;

/// CanFilter
///
/// Contains an internal id and mask. Packets are considered to be matched by
/// a filter if `received_id & mask == filter_id & mask` holds true.
#[derive(Debug, Copy, Clone)]
#[repr(C)]
pub struct CanFilter {
    pub(crate) id: u32,
    pub(crate) mask: u32,
}

impl CanFilter {
    /// Construct a new kernel CAN filter.
    pub fn new(id: u32, mask: u32) -> CanFilter {
        CanFilter { id, mask }
    }

    /// A filter matching nothing at all: used to mute RX while still holding
    /// a non-empty filter vector (an empty vector would admit every frame).
    pub fn match_nothing() -> CanFilter {
        CanFilter { id: 0, mask: u32::MAX }
    }

    pub fn is_zero(&self) -> bool {
        self.id == 0 && self.mask == 0
    }
}

/// Build the effective (id, mask) pair for an RX slot per §4.C
/// `rx_buffer_init`: extended-frame and RTR bits are always compared so that
/// standard-frame RTR-matching is strict.
pub fn effective_rx_filter(id: u32, mask: u32, rtr: bool) -> Result<CanFilter, CanOpenError> {
    if id & !SFF_MASK != 0 || mask & !SFF_MASK != 0 {
        return Err(CanOpenError::IllegalArgument("rx id/mask exceeds SFF range"));
    }
    let eff_id = (id & SFF_MASK) | if rtr { RTR_FLAG } else { 0 };
    let eff_mask = (mask & SFF_MASK) | EFF_FLAG | RTR_FLAG;
    Ok(CanFilter::new(eff_id, eff_mask))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rx_filter_compares_rtr_and_eff_bits() {
        let f = effective_rx_filter(0x180, 0x7ff, false).unwrap();
        assert_eq!(f.mask & EFF_FLAG, EFF_FLAG);
        assert_eq!(f.mask & RTR_FLAG, RTR_FLAG);
    }

    #[test]
    fn zero_id_zero_mask_does_not_admit_everything() {
        // boundary behaviour from §8: a (0,0) slot must not become a
        // match-everything kernel filter once copied into the filter vector.
        let f = CanFilter::new(0, 0);
        assert!(f.is_zero());
    }
}
