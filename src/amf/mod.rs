//! AMF0 value support
//!
//! FLV script-data tags (onMetaData and friends) carry AMF0 payloads. This
//! module implements the marker subset those tags actually use; references,
//! typed objects and AMF3 switching never occur in script data and are not
//! supported.

pub mod amf0;
pub mod value;

pub use amf0::{decode_all, encode, encode_all};
pub use value::AmfValue;
