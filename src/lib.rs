//! streamcore: media plumbing for a low-latency live streaming server
//!
//! This library ingests time-stamped audio/video/metadata packets in a
//! lightweight self-describing stream container (SC) and emits them in, or
//! translates them to/from, FLV and ISOBMFF/MP4. It also carries the
//! chunked-HTTP framing layer and the buffered socket abstraction the
//! protocol front-ends are built on:
//!
//! - Live ingest with fan-out: [`sc::Stream`] buffers recent packets,
//!   keyframe-aligned, for any number of independent readers.
//! - Container translation: [`flv::Tag`] parses/serialises FLV tags and
//!   converts them to/from SC packets; [`mp4::Mp4Header`] plans an
//!   interleaved MP4 and back-patches its chunk offsets.
//! - Transport: [`net::Socket`] unifies TCP/Unix/pipe endpoints behind a
//!   segmented [`net::Buffer`], and [`http::HttpParser`] frames requests,
//!   responses and chunked bodies on top.
//!
//! # Example: live FLV ingest
//!
//! ```no_run
//! use streamcore::{flv, net, sc};
//!
//! #[tokio::main]
//! async fn main() -> streamcore::Result<()> {
//!     let listener = net::Listener::bind_tcp("", 8080).await?;
//!     let mut socket = listener.accept().await?;
//!
//!     let mut stream = sc::Stream::new(50, 10_000);
//!     let mut tag = flv::Tag::new();
//!     let mut meta = sc::StreamMeta::default();
//!     loop {
//!         if !socket.spool() && !socket.connected() {
//!             break;
//!         }
//!         while tag.load_from(socket.received())? {
//!             if let Some(packet) = tag.to_packet(&mut meta) {
//!                 stream.add_packet(packet);
//!             }
//!         }
//!     }
//!     Ok(())
//! }
//! ```

pub mod amf;
pub mod error;
pub mod flv;
pub mod http;
pub mod mp4;
pub mod net;
pub mod sc;

// Re-export main types for convenience
pub use error::{Error, Result};
pub use http::HttpParser;
pub use net::{Buffer, Listener, Socket};
pub use sc::{LivePos, Packet, Ring, ScFile, Stream, StreamMeta};
