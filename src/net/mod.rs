//! Byte-level transport: segmented receive/send buffers and the unified
//! socket endpoint every other subsystem reads from and writes to.

pub mod buffer;
pub mod socket;

pub use buffer::{Buffer, BLOCK_SIZE};
pub use socket::{Listener, Socket};
