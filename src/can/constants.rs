// Protocol of the PF_CAN Family: Standard
pub const CAN_RAW: libc::c_int = 1;

pub const SOL_CAN_BASE: libc::c_int = 100;
pub const SOL_CAN_RAW: libc::c_int = SOL_CAN_BASE + CAN_RAW;
pub const CAN_RAW_FILTER: libc::c_int = 1;
pub const CAN_RAW_ERR_FILTER: libc::c_int = 2;
pub const CAN_RAW_LOOPBACK: libc::c_int = 3;
pub const CAN_RAW_RECV_OWN_MSGS: libc::c_int = 4;
pub const CAN_RAW_JOIN_FILTERS: libc::c_int = 6;

// get timestamp from ioctl in a struct timespec (ns accuracy)
pub const SIOCGSTAMPNS: libc::c_int = 0x8907;

/// Software RX timestamping, SO_TIMESTAMPING flags (kernel uapi/asm-generic/socket.h)
pub const SO_TIMESTAMPNS: libc::c_int = 35;
/// Report the number of packets dropped on the socket's receive queue (kernel net.h)
pub const SO_RXQ_OVFL: libc::c_int = 40;

/// Special address description flags for the CAN_ID
///
/// EFF/SFF is set in the MSB
pub const EFF_FLAG: u32 = 0x80000000;
/// remote transmission request
pub const RTR_FLAG: u32 = 0x40000000;
/// error message frame
pub const ERR_FLAG: u32 = 0x20000000;

/// valid bits in CAN ID for frame formats
/// standard frame format (SFF)
pub const SFF_MASK: u32 = 0x000007ff;
/// extended frame format (EFF)
pub const EFF_MASK: u32 = 0x1fffffff;
/// omit EFF, RTR, ERR flags
pub const ERR_MASK: u32 = 0x1fffffff;

/// an error mask that will cause SocketCAN to report all errors
pub const ERR_MASK_ALL: u32 = ERR_MASK;

/// an error mask that will cause SocketCAN to silently drop all errors
pub const ERR_MASK_NONE: u32 = 0;

/// error class bits, decoded from CanFrame::err()
pub const CAN_ERR_TX_TIMEOUT: u32 = 0x0000_0001;
pub const CAN_ERR_LOSTARB: u32 = 0x0000_0002;
pub const CAN_ERR_CRTL: u32 = 0x0000_0004;
pub const CAN_ERR_PROT: u32 = 0x0000_0008;
pub const CAN_ERR_TRX: u32 = 0x0000_0010;
pub const CAN_ERR_ACK: u32 = 0x0000_0020;
pub const CAN_ERR_BUSOFF: u32 = 0x0000_0040;
pub const CAN_ERR_BUSERROR: u32 = 0x0000_0080;
pub const CAN_ERR_RESTARTED: u32 = 0x0000_0100;

/// Filter mask that admits all of the error classes the monitor acts on:
/// ACK-miss, controller status, bus-off, bus-error (§6 "Wire (CAN)").
pub const CAN_ERR_MASK_MONITORED: u32 =
    CAN_ERR_ACK | CAN_ERR_CRTL | CAN_ERR_BUSOFF | CAN_ERR_BUSERROR;
