//! Wire protocol: fixed-size frames and the logical messages they carry.
//!
//! ## Frame layout
//!
//! ```text
//! offset  0..3    errNo       3 decimal digits, 999 = connection severed
//! offset  3       '_'
//! offset  4..7    service     3 decimal digits
//! offset  7       '_'
//! offset  8..11   format      3 decimal digits
//! offset 11       '_'
//! offset 12..17   dataLength  5 decimal digits (TID + chunk)
//! offset 17       '_'
//! offset 18..273  TID         space padded
//! offset 273..    chunk       up to 751 bytes, NUL filled to 1024
//! ```

pub mod frame;
pub mod message;

pub use frame::{
    decode, encode, Format, Frame, Service, FRAME_SIZE, MAX_CHUNK_LEN, SEVERED_ERR_NO, TID_LEN,
};
pub use message::TransferMessage;
