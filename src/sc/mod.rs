//! SC stream container
//!
//! The self-describing container used between ingest and delivery: DTMI
//! value bodies framed by a short magic and a big-endian length. The live
//! [`Stream`](stream::Stream) buffers recent packets for many concurrent
//! readers; [`ScFile`](file::ScFile) gives seekable access to recordings.

pub mod file;
pub mod meta;
pub mod packet;
pub mod stream;
pub mod value;

pub use file::{ScFile, SeekPos};
pub use meta::{KeyEntry, StreamMeta, TrackKind, TrackMeta};
pub use packet::{frame_header, frame_packet, Kind, NaluFlag, Packet};
pub use stream::{LivePos, Ring, SeekResult, Stream};
pub use value::Value;
