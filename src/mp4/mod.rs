//! ISO base media (MP4) output
//!
//! Header synthesis for fixed streams and the streaming interleaver that
//! feeds the matching `mdat` payload.

pub mod boxes;
pub mod header;

pub use header::{Interleaver, KeyPart, Mp4Header};
