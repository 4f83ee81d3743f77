//! Value types of the CDM plugin ABI.
//!
//! ABI enums are transparent `u32` newtypes rather than Rust enums: the vendor
//! module may report values this bridge does not know about and those must
//! pass through untouched. The `#[repr(C)]` structs double as the in-memory
//! layout handed across the C boundary.

use serde::{Deserialize, Serialize};

macro_rules! abi_enum {
    (
        $(#[$meta:meta])*
        $name:ident { $($(#[$vmeta:meta])* $variant:ident = $value:expr),* $(,)? }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
        #[serde(transparent)]
        #[repr(transparent)]
        pub struct $name(pub u32);

        impl $name {
            $($(#[$vmeta])* pub const $variant: Self = Self($value);)*
        }
    };
}

abi_enum! {
    /// Result of a decrypt or decode call.
    Status {
        SUCCESS = 0,
        NEED_MORE_DATA = 1,
        NO_KEY = 2,
        INITIALIZATION_ERROR = 3,
        DECRYPT_ERROR = 4,
        DECODE_ERROR = 5,
        DEFERRED_INITIALIZATION = 6,
    }
}

abi_enum! {
    EncryptionScheme {
        UNENCRYPTED = 0,
        CENC = 1,
        CBCS = 2,
    }
}

abi_enum! {
    SessionType {
        TEMPORARY = 0,
        PERSISTENT_LICENSE = 1,
    }
}

abi_enum! {
    InitDataType {
        CENC = 0,
        KEY_IDS = 1,
        WEBM = 2,
    }
}

abi_enum! {
    MessageType {
        LICENSE_REQUEST = 0,
        LICENSE_RENEWAL = 1,
        LICENSE_RELEASE = 2,
        INDIVIDUALIZATION_REQUEST = 3,
    }
}

abi_enum! {
    KeyStatus {
        USABLE = 0,
        INTERNAL_ERROR = 1,
        EXPIRED = 2,
        OUTPUT_RESTRICTED = 3,
        OUTPUT_DOWNSCALED = 4,
        STATUS_PENDING = 5,
        RELEASED = 6,
    }
}

abi_enum! {
    StreamType {
        AUDIO = 0,
        VIDEO = 1,
    }
}

abi_enum! {
    /// Outcome of `QueryOutputProtectionStatus`.
    QueryResult {
        SUCCEEDED = 0,
        FAILED = 1,
    }
}

abi_enum! {
    VideoCodec {
        UNKNOWN = 0,
        VP8 = 1,
        H264 = 2,
        VP9 = 3,
        AV1 = 4,
    }
}

abi_enum! {
    VideoCodecProfile {
        UNKNOWN = 0,
        NOT_NEEDED = 1,
        H264_BASELINE = 2,
        H264_MAIN = 3,
        H264_EXTENDED = 4,
        H264_HIGH = 5,
        H264_HIGH10 = 6,
        H264_HIGH422 = 7,
        H264_HIGH444_PREDICTIVE = 8,
        VP9_PROFILE0 = 9,
        VP9_PROFILE1 = 10,
        VP9_PROFILE2 = 11,
        VP9_PROFILE3 = 12,
        AV1_MAIN = 13,
        AV1_HIGH = 14,
        AV1_PRO = 15,
    }
}

abi_enum! {
    /// Pixel layout of a decoded frame.
    VideoFormat {
        UNKNOWN = 0,
        YV12 = 1,
        I420 = 2,
        YUV420P9 = 16,
        YUV420P10 = 17,
        YUV422P9 = 18,
        YUV422P10 = 19,
        YUV444P9 = 20,
        YUV444P10 = 21,
        YUV420P12 = 22,
        YUV422P12 = 23,
        YUV444P12 = 24,
    }
}

abi_enum! {
    VideoPlane {
        Y = 0,
        U = 1,
        V = 2,
    }
}

impl VideoPlane {
    /// Number of addressable planes in a `VideoFrame`.
    pub const COUNT: usize = 3;

    pub fn index(self) -> Option<usize> {
        let index = self.0 as usize;
        (index < Self::COUNT).then_some(index)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[repr(C)]
pub struct SubsampleEntry {
    pub clear_bytes: u32,
    pub cipher_bytes: u32,
}

/// Crypt/skip block counts for pattern encryption (`cbcs`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[repr(C)]
pub struct Pattern {
    pub crypt_byte_block: u32,
    pub skip_byte_block: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[repr(C)]
pub struct Size {
    pub width: i32,
    pub height: i32,
}

/// `cdm::ColorSpace`, with the ITU-T H.273 code points as raw bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(C)]
pub struct ColorSpace {
    pub primaries: u8,
    pub transfer: u8,
    pub matrix: u8,
    pub range: u8,
}

impl Default for ColorSpace {
    fn default() -> Self {
        // 2 is "unspecified" for all three H.273 tables; range 0 is kInvalid.
        Self {
            primaries: 2,
            transfer: 2,
            matrix: 2,
            range: 0,
        }
    }
}

/// Encrypted sample handed to `Decrypt` / `DecryptAndDecodeFrame`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct InputBuffer {
    #[serde(with = "crate::bytes")]
    pub data: Vec<u8>,
    pub encryption_scheme: EncryptionScheme,
    #[serde(with = "crate::bytes")]
    pub key_id: Vec<u8>,
    #[serde(with = "crate::bytes")]
    pub iv: Vec<u8>,
    #[serde(default)]
    pub subsamples: Vec<SubsampleEntry>,
    #[serde(default)]
    pub pattern: Pattern,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct VideoDecoderConfig {
    pub codec: VideoCodec,
    pub profile: VideoCodecProfile,
    pub format: VideoFormat,
    #[serde(default)]
    pub color_space: ColorSpace,
    pub coded_size: Size,
    #[serde(with = "crate::bytes")]
    pub extra_data: Vec<u8>,
    pub encryption_scheme: EncryptionScheme,
}

/// One key's status as reported through `OnSessionKeysChange`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyInformation {
    #[serde(with = "crate::bytes")]
    pub key_id: Vec<u8>,
    pub status: KeyStatus,
    pub system_code: u32,
}

/// A byte range inside the worker's shared arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BufferRef {
    pub offset: u32,
    pub size: u32,
}

impl BufferRef {
    /// Exclusive end offset, or `None` if it overflows.
    pub fn end(self) -> Option<u32> {
        self.offset.checked_add(self.size)
    }
}

/// Location of a decrypted block inside the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecryptedBlockInfo {
    pub buffer: BufferRef,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PlaneInfo {
    pub offset: u32,
    pub stride: u32,
}

/// Location and geometry of a decoded frame inside the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoFrameInfo {
    pub format: VideoFormat,
    pub size: Size,
    pub buffer: BufferRef,
    pub planes: [PlaneInfo; VideoPlane::COUNT],
    pub timestamp: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_abi_enum_is_transparent() {
        let json = serde_json::to_string(&Status::NO_KEY).unwrap();
        assert_eq!(json, "2");

        // Unknown vendor values survive a round trip.
        let parsed: Status = serde_json::from_str("4242").unwrap();
        assert_eq!(parsed, Status(4242));
    }

    #[test]
    fn test_input_buffer_bytes_are_base64() {
        let input = InputBuffer {
            data: vec![0xde, 0xad, 0xbe, 0xef],
            encryption_scheme: EncryptionScheme::CENC,
            key_id: b"key".to_vec(),
            iv: vec![0; 16],
            subsamples: vec![SubsampleEntry {
                clear_bytes: 1,
                cipher_bytes: 3,
            }],
            pattern: Pattern::default(),
            timestamp: 1_000,
        };

        let json = serde_json::to_string(&input).unwrap();
        assert!(json.contains("\"data\":\"3q2+7w==\""));
        assert!(json.contains("\"key_id\":\"a2V5\""));

        let parsed: InputBuffer = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, input);
    }

    #[test]
    fn test_invalid_base64_is_rejected() {
        let json = r#"{"key_id":"!!","status":0,"system_code":0}"#;
        assert!(serde_json::from_str::<KeyInformation>(json).is_err());
    }

    #[test]
    fn test_video_plane_index() {
        assert_eq!(VideoPlane::Y.index(), Some(0));
        assert_eq!(VideoPlane::V.index(), Some(2));
        assert_eq!(VideoPlane(3).index(), None);
    }

    #[test]
    fn test_buffer_ref_end_overflow() {
        let range = BufferRef {
            offset: u32::MAX,
            size: 1,
        };
        assert_eq!(range.end(), None);
    }

    #[test]
    fn test_color_space_defaults_to_unspecified() {
        let parsed: VideoDecoderConfig = serde_json::from_str(
            r#"{"codec":2,"profile":5,"format":2,"coded_size":{"width":640,"height":360},"extra_data":"","encryption_scheme":1}"#,
        )
        .unwrap();
        assert_eq!(parsed.color_space, ColorSpace::default());
        assert_eq!(parsed.codec, VideoCodec::H264);
    }
}
