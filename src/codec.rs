// Codec identifiers and hardware decoder profiles

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::video::VideoFormat;

/// Compression standards the decoder can be configured for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Codec {
    None,
    H264,
    Vp9,
    H265,
    Vp8,
    Mpeg2,
}

impl Codec {
    /// Exclusive upper bound of the codec discriminants
    pub const LAST: usize = 6;

    /// Every real codec, in registration order
    pub const ALL: [Codec; 5] = [Codec::H264, Codec::Vp9, Codec::H265, Codec::Vp8, Codec::Mpeg2];

    pub fn from_index(index: usize) -> Option<Self> {
        match index {
            0 => Some(Codec::None),
            1 => Some(Codec::H264),
            2 => Some(Codec::Vp9),
            3 => Some(Codec::H265),
            4 => Some(Codec::Vp8),
            5 => Some(Codec::Mpeg2),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Codec::None => "none",
            Codec::H264 => "h264",
            Codec::Vp9 => "vp9",
            Codec::H265 => "h265",
            Codec::Vp8 => "vp8",
            Codec::Mpeg2 => "mpeg2",
        }
    }

    /// Smallest number of output surfaces that can hold every reference
    /// picture the codec may keep, plus the picture being decoded where the
    /// codec's reference slots do not already include it.
    pub fn min_dpb_size(self) -> usize {
        match self {
            Codec::None => 0,
            Codec::H264 | Codec::H265 => 1,
            // last, golden, altref + current
            Codec::Vp8 => 4,
            // eight reference slots
            Codec::Vp9 => 8,
            // forward + backward reference + current
            Codec::Mpeg2 => 3,
        }
    }

    /// Output formats the codec can be decoded to
    pub fn output_formats(self) -> &'static [VideoFormat] {
        match self {
            Codec::H265 | Codec::Vp9 => &[VideoFormat::Nv12, VideoFormat::P01010le],
            Codec::None => &[],
            _ => &[VideoFormat::Nv12],
        }
    }

    /// Hardware profiles that can decode `format`, in preference order
    pub fn profile_candidates(self, format: VideoFormat) -> &'static [DecoderProfile] {
        match (self, format) {
            (Codec::H264, VideoFormat::Nv12) => &[DecoderProfile::H264_VLD_NOFGT],
            (Codec::H265, VideoFormat::Nv12) => &[DecoderProfile::HEVC_VLD_MAIN],
            (Codec::H265, VideoFormat::P01010le) => &[DecoderProfile::HEVC_VLD_MAIN10],
            (Codec::Vp8, VideoFormat::Nv12) => &[DecoderProfile::VP8_VLD],
            (Codec::Vp9, VideoFormat::Nv12) => &[DecoderProfile::VP9_VLD_PROFILE0],
            (Codec::Vp9, VideoFormat::P01010le) => &[DecoderProfile::VP9_VLD_10BIT_PROFILE2],
            (Codec::Mpeg2, VideoFormat::Nv12) => {
                &[DecoderProfile::MPEG2_VLD, DecoderProfile::MPEG2_AND_MPEG1_VLD]
            }
            _ => &[],
        }
    }

    /// `ConfigBitstreamRaw` value the decoder configuration must report.
    /// H.264 is fed short-format slice control (2); every other codec
    /// uses raw bitstream with full slice data (1).
    pub fn bitstream_raw(self) -> u32 {
        match self {
            Codec::H264 => 2,
            _ => 1,
        }
    }
}

impl fmt::Display for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// GUID identifying a hardware decode profile (codec + bit depth/chroma)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DecoderProfile(Uuid);

impl DecoderProfile {
    pub const H264_VLD_NOFGT: Self = Self(Uuid::from_u128(0x1b81be68_a0c7_11d3_b984_00c04f2e73c5));
    pub const HEVC_VLD_MAIN: Self = Self(Uuid::from_u128(0x5b11d51b_2f4c_4452_bcc3_09f2a1160cc0));
    pub const HEVC_VLD_MAIN10: Self = Self(Uuid::from_u128(0x107af0e0_ef1a_4d19_aba8_67a163073d13));
    pub const VP8_VLD: Self = Self(Uuid::from_u128(0x90b899ea_3a62_4705_88b3_8df04b2744e7));
    pub const VP9_VLD_PROFILE0: Self = Self(Uuid::from_u128(0x463707f8_a1d0_4585_876d_83aa6d60b89e));
    pub const VP9_VLD_10BIT_PROFILE2: Self =
        Self(Uuid::from_u128(0xa4c749ef_6ecf_48aa_8448_50a7a1165ff7));
    pub const MPEG2_VLD: Self = Self(Uuid::from_u128(0xee27417f_5e28_4e65_beea_1d26b508adc9));
    pub const MPEG2_AND_MPEG1_VLD: Self =
        Self(Uuid::from_u128(0x86695f12_340e_4f04_9fd3_9253dd327460));

    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn uuid(&self) -> Uuid {
        self.0
    }

    /// Short name for logs, `None` for profiles this crate never selects
    pub fn name(&self) -> Option<&'static str> {
        PROFILE_NAMES
            .iter()
            .find(|(profile, _)| profile == self)
            .map(|(_, name)| *name)
    }

    /// Every profile this crate knows how to drive
    pub fn known() -> impl Iterator<Item = DecoderProfile> {
        PROFILE_NAMES.iter().map(|(profile, _)| *profile)
    }
}

const PROFILE_NAMES: [(DecoderProfile, &str); 8] = [
    (DecoderProfile::H264_VLD_NOFGT, "H264_VLD_NOFGT"),
    (DecoderProfile::HEVC_VLD_MAIN, "HEVC_VLD_MAIN"),
    (DecoderProfile::HEVC_VLD_MAIN10, "HEVC_VLD_MAIN10"),
    (DecoderProfile::VP8_VLD, "VP8_VLD"),
    (DecoderProfile::VP9_VLD_PROFILE0, "VP9_VLD_PROFILE0"),
    (DecoderProfile::VP9_VLD_10BIT_PROFILE2, "VP9_VLD_10BIT_PROFILE2"),
    (DecoderProfile::MPEG2_VLD, "MPEG2_VLD"),
    (DecoderProfile::MPEG2_AND_MPEG1_VLD, "MPEG2and1_VLD"),
];

impl fmt::Display for DecoderProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{} ({})", name, self.0),
            None => write!(f, "{}", self.0),
        }
    }
}
