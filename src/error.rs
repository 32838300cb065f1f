//! Unified error types for streamcore

use std::fmt;
use std::io;

/// Result type alias using the library's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Unified error type for all streamcore operations
#[derive(Debug)]
pub enum Error {
    /// I/O error during network or file operations
    Io(io::Error),
    /// FLV tag parsing/serialisation error
    Media(MediaError),
    /// AMF0 encoding/decoding error
    Amf(AmfError),
    /// Stream container (SC) error
    Container(ContainerError),
    /// HTTP framing error
    Http(HttpError),
    /// MP4 header synthesis error
    Mp4(Mp4Error),
    /// Connection was closed
    ConnectionClosed,
    /// Invalid configuration
    Config(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::Media(e) => write!(f, "Media error: {}", e),
            Error::Amf(e) => write!(f, "AMF error: {}", e),
            Error::Container(e) => write!(f, "Container error: {}", e),
            Error::Http(e) => write!(f, "HTTP error: {}", e),
            Error::Mp4(e) => write!(f, "MP4 error: {}", e),
            Error::ConnectionClosed => write!(f, "Connection closed"),
            Error::Config(msg) => write!(f, "Configuration error: {}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(err)
    }
}

impl From<MediaError> for Error {
    fn from(err: MediaError) -> Self {
        Error::Media(err)
    }
}

impl From<AmfError> for Error {
    fn from(err: AmfError) -> Self {
        Error::Amf(err)
    }
}

impl From<ContainerError> for Error {
    fn from(err: ContainerError) -> Self {
        Error::Container(err)
    }
}

impl From<HttpError> for Error {
    fn from(err: HttpError) -> Self {
        Error::Http(err)
    }
}

impl From<Mp4Error> for Error {
    fn from(err: Mp4Error) -> Self {
        Error::Mp4(err)
    }
}

/// FLV tag parsing errors
#[derive(Debug)]
pub enum MediaError {
    /// FLV container header failed validation
    InvalidFlvHeader,
    /// Tag type byte outside the valid range
    InvalidTagType(u8),
    /// Tag too short for its codec-specific header
    TruncatedTag,
    /// Buffer growth failed; length clamped to existing capacity
    BufferExhausted,
    /// AMF0 script data could not be parsed
    InvalidScriptData,
}

impl fmt::Display for MediaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaError::InvalidFlvHeader => write!(f, "Invalid FLV container header"),
            MediaError::InvalidTagType(t) => write!(f, "Invalid FLV tag type: 0x{:02x}", t),
            MediaError::TruncatedTag => write!(f, "FLV tag truncated"),
            MediaError::BufferExhausted => write!(f, "Tag buffer growth failed"),
            MediaError::InvalidScriptData => write!(f, "Invalid script data payload"),
        }
    }
}

impl std::error::Error for MediaError {}

/// AMF0 encoding/decoding errors
#[derive(Debug)]
pub enum AmfError {
    UnknownMarker(u8),
    UnexpectedEof,
    InvalidUtf8,
    NestingTooDeep,
}

impl fmt::Display for AmfError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AmfError::UnknownMarker(m) => write!(f, "Unknown AMF marker: 0x{:02x}", m),
            AmfError::UnexpectedEof => write!(f, "Unexpected end of AMF data"),
            AmfError::InvalidUtf8 => write!(f, "Invalid UTF-8 in AMF string"),
            AmfError::NestingTooDeep => write!(f, "AMF nesting too deep"),
        }
    }
}

impl std::error::Error for AmfError {}

/// Stream container (SC) errors
#[derive(Debug)]
pub enum ContainerError {
    /// Neither packet nor header magic found at a record boundary
    BadMagic,
    /// A DTMI value could not be decoded
    InvalidValue,
    /// A packet is missing a required field
    MissingField(&'static str),
    /// Header (re)write size mismatch without force
    HeaderSizeMismatch { existing: usize, new: usize },
    /// Seek target outside any selected track's key index
    SeekOutOfRange(u64),
}

impl fmt::Display for ContainerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContainerError::BadMagic => write!(f, "Invalid container magic"),
            ContainerError::InvalidValue => write!(f, "Invalid serialised value"),
            ContainerError::MissingField(field) => {
                write!(f, "Missing required field: {}", field)
            }
            ContainerError::HeaderSizeMismatch { existing, new } => {
                write!(f, "Header size mismatch: {} existing, {} new", existing, new)
            }
            ContainerError::SeekOutOfRange(ms) => write!(f, "Seek out of range: {}ms", ms),
        }
    }
}

impl std::error::Error for ContainerError {}

/// HTTP framing errors
#[derive(Debug)]
pub enum HttpError {
    /// Chunk size line was not valid hexadecimal
    InvalidChunkSize,
    /// The peer disconnected before the body completed
    IncompleteBody,
}

impl fmt::Display for HttpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HttpError::InvalidChunkSize => write!(f, "Invalid chunk size line"),
            HttpError::IncompleteBody => write!(f, "Body ended before declared length"),
        }
    }
}

impl std::error::Error for HttpError {}

/// MP4 header synthesis errors
#[derive(Debug)]
pub enum Mp4Error {
    /// A track has no key index, so no interleave can be planned
    EmptyKeyIndex(u32),
    /// A codec with no sample-entry mapping
    UnsupportedCodec(String),
}

impl fmt::Display for Mp4Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mp4Error::EmptyKeyIndex(t) => write!(f, "Track {} has no key index", t),
            Mp4Error::UnsupportedCodec(c) => write!(f, "Unsupported codec: {}", c),
        }
    }
}

impl std::error::Error for Mp4Error {}
