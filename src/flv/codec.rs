//! FLV codec classification
//!
//! The first payload byte of an audio or video tag carries the codec and
//! framing information in two nibbles:
//!
//! ```text
//! Video: | FrameType (4 bits) | CodecID (4 bits)  |
//! Audio: | SoundFormat (4)    | Rate(2) Size(1) Type(1) |
//! ```

/// Video codec ID (lower 4 bits of the first video payload byte)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoCodec {
    Jpeg = 1,
    H263 = 2,
    ScreenVideo1 = 3,
    Vp6 = 4,
    Vp6Alpha = 5,
    ScreenVideo2 = 6,
    H264 = 7,
}

impl VideoCodec {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b & 0x0F {
            1 => Some(VideoCodec::Jpeg),
            2 => Some(VideoCodec::H263),
            3 => Some(VideoCodec::ScreenVideo1),
            4 => Some(VideoCodec::Vp6),
            5 => Some(VideoCodec::Vp6Alpha),
            6 => Some(VideoCodec::ScreenVideo2),
            7 => Some(VideoCodec::H264),
            _ => None,
        }
    }

    /// Symbolic name as used in track metadata.
    pub fn name(&self) -> &'static str {
        match self {
            VideoCodec::Jpeg => "JPEG",
            VideoCodec::H263 => "H263",
            VideoCodec::ScreenVideo1 => "ScreenVideo1",
            VideoCodec::Vp6 => "VP6",
            VideoCodec::Vp6Alpha => "VP6Alpha",
            VideoCodec::ScreenVideo2 => "ScreenVideo2",
            VideoCodec::H264 => "H264",
        }
    }
}

/// Video frame type (upper 4 bits of the first video payload byte)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoFrameType {
    Keyframe = 1,
    InterFrame = 2,
    DisposableInterFrame = 3,
    /// Server-generated keyframe
    GeneratedKeyframe = 4,
    /// Video info/command frame
    VideoInfoFrame = 5,
}

impl VideoFrameType {
    pub fn from_byte(b: u8) -> Option<Self> {
        match (b >> 4) & 0x0F {
            1 => Some(VideoFrameType::Keyframe),
            2 => Some(VideoFrameType::InterFrame),
            3 => Some(VideoFrameType::DisposableInterFrame),
            4 => Some(VideoFrameType::GeneratedKeyframe),
            5 => Some(VideoFrameType::VideoInfoFrame),
            _ => None,
        }
    }

    pub fn is_keyframe(&self) -> bool {
        matches!(
            self,
            VideoFrameType::Keyframe | VideoFrameType::GeneratedKeyframe
        )
    }
}

/// Audio format (upper 4 bits of the first audio payload byte)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioCodec {
    LinearPcmPe = 0,
    Adpcm = 1,
    Mp3 = 2,
    LinearPcmLe = 3,
    Nelly16k = 4,
    Nelly8k = 5,
    Nelly = 6,
    G711ALaw = 7,
    G711MuLaw = 8,
    Aac = 10,
    Speex = 11,
    Mp38k = 14,
    DeviceSpecific = 15,
}

impl AudioCodec {
    pub fn from_byte(b: u8) -> Option<Self> {
        match (b >> 4) & 0x0F {
            0 => Some(AudioCodec::LinearPcmPe),
            1 => Some(AudioCodec::Adpcm),
            2 => Some(AudioCodec::Mp3),
            3 => Some(AudioCodec::LinearPcmLe),
            4 => Some(AudioCodec::Nelly16k),
            5 => Some(AudioCodec::Nelly8k),
            6 => Some(AudioCodec::Nelly),
            7 => Some(AudioCodec::G711ALaw),
            8 => Some(AudioCodec::G711MuLaw),
            10 => Some(AudioCodec::Aac),
            11 => Some(AudioCodec::Speex),
            14 => Some(AudioCodec::Mp38k),
            15 => Some(AudioCodec::DeviceSpecific),
            _ => None,
        }
    }

    /// Symbolic name as used in track metadata.
    pub fn name(&self) -> &'static str {
        match self {
            AudioCodec::LinearPcmPe => "linear PCM PE",
            AudioCodec::Adpcm => "ADPCM",
            AudioCodec::Mp3 => "MP3",
            AudioCodec::LinearPcmLe => "linear PCM LE",
            AudioCodec::Nelly16k => "Nelly16kHz",
            AudioCodec::Nelly8k => "Nelly8kHz",
            AudioCodec::Nelly => "Nelly",
            AudioCodec::G711ALaw => "G711A-law",
            AudioCodec::G711MuLaw => "G711mu-law",
            AudioCodec::Aac => "AAC",
            AudioCodec::Speex => "Speex",
            AudioCodec::Mp38k => "MP38kHz",
            AudioCodec::DeviceSpecific => "DeviceSpecific",
        }
    }
}

/// Audio sample rate (bits 2-3 of the first audio payload byte)
pub fn sample_rate_from_byte(b: u8) -> u32 {
    match b & 0x0C {
        0x00 => 5512,
        0x04 => 11025,
        0x08 => 22050,
        _ => 44100,
    }
}

/// Rate bits for a sample rate in Hz, rounding down to the nearest tier.
pub fn sample_rate_bits(rate: u32) -> u8 {
    if rate >= 44100 {
        0x0C
    } else if rate >= 22050 {
        0x08
    } else if rate >= 11025 {
        0x04
    } else {
        0x00
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_video_nibbles() {
        // keyframe + H264
        assert_eq!(VideoFrameType::from_byte(0x17), Some(VideoFrameType::Keyframe));
        assert_eq!(VideoCodec::from_byte(0x17), Some(VideoCodec::H264));
        // inter frame + H263
        assert_eq!(VideoFrameType::from_byte(0x22), Some(VideoFrameType::InterFrame));
        assert_eq!(VideoCodec::from_byte(0x22), Some(VideoCodec::H263));
        // reserved codec id
        assert_eq!(VideoCodec::from_byte(0x1F), None);
    }

    #[test]
    fn test_video_codec_names() {
        assert_eq!(VideoCodec::from_byte(0x02).unwrap().name(), "H263");
        assert_eq!(VideoCodec::from_byte(0x04).unwrap().name(), "VP6");
        assert_eq!(VideoCodec::from_byte(0x07).unwrap().name(), "H264");
    }

    #[test]
    fn test_audio_nibbles() {
        assert_eq!(AudioCodec::from_byte(0xAF), Some(AudioCodec::Aac));
        assert_eq!(AudioCodec::from_byte(0x2F), Some(AudioCodec::Mp3));
        assert_eq!(AudioCodec::from_byte(0x00), Some(AudioCodec::LinearPcmPe));
        assert_eq!(AudioCodec::from_byte(0xE0), Some(AudioCodec::Mp38k));
        assert_eq!(AudioCodec::from_byte(0x90), None);
    }

    #[test]
    fn test_sample_rate_bits() {
        assert_eq!(sample_rate_from_byte(0xAF), 44100);
        assert_eq!(sample_rate_from_byte(0xA8), 22050);
        assert_eq!(sample_rate_bits(48000), 0x0C);
        assert_eq!(sample_rate_bits(22050), 0x08);
        assert_eq!(sample_rate_bits(8000), 0x00);
    }

    #[test]
    fn test_generated_keyframe_counts() {
        assert!(VideoFrameType::from_byte(0x47).unwrap().is_keyframe());
        assert!(!VideoFrameType::from_byte(0x27).unwrap().is_keyframe());
    }
}
