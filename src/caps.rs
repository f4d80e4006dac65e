// Hardware capability queries
// Profile, output format and resolution support for a decode device

use serde::{Deserialize, Serialize};

use crate::backend::{DecodeDevice, DecoderDesc, DxgiFormat, HwDecoderConfig};
use crate::codec::{Codec, DecoderProfile};
use crate::error::DecoderError;
use crate::video::VideoFormat;

pub const VENDOR_AMD: u32 = 0x1002;
pub const VENDOR_AMD_ALT: u32 = 0x1022;

// Evergreen / Northern Islands parts. Their drivers advertise newer decode
// profiles that then fail at runtime.
const LEGACY_AMD_DEVICES: &[u32] = &[
    0x130f, 0x6700, 0x6701, 0x6702, 0x6703, 0x6704, 0x6705, 0x6706, 0x6707, 0x6708, 0x6709,
    0x6718, 0x6719, 0x671c, 0x671d, 0x671f, 0x6720, 0x6721, 0x6722, 0x6723, 0x6724, 0x6725,
    0x6726, 0x6727, 0x6728, 0x6729, 0x6738, 0x6739, 0x673e, 0x6740, 0x6741, 0x6742, 0x6743,
    0x6744, 0x6745, 0x6746, 0x6747, 0x6748, 0x6749, 0x674a, 0x6750, 0x6751, 0x6758, 0x6759,
    0x675b, 0x675d, 0x675f, 0x6760, 0x6761, 0x6762, 0x6763, 0x6764, 0x6765, 0x6766, 0x6767,
    0x6768, 0x6770, 0x6771, 0x6772, 0x6778, 0x6779, 0x677b, 0x6840, 0x6841, 0x6842, 0x6843,
    0x6849, 0x6850, 0x6858, 0x6859, 0x6880, 0x6888, 0x6889, 0x688a, 0x688c, 0x688d, 0x6898,
    0x6899, 0x689b, 0x689c, 0x689d, 0x689e, 0x68a0, 0x68a1, 0x68a8, 0x68a9, 0x68b0, 0x68b8,
    0x68b9, 0x68ba, 0x68be, 0x68bf, 0x68c0, 0x68c1, 0x68c7, 0x68c8, 0x68c9, 0x68d8, 0x68d9,
    0x68da, 0x68de, 0x68e0, 0x68e1, 0x68e4, 0x68e5, 0x68e8, 0x68e9, 0x68f1, 0x68f2, 0x68f8,
    0x68f9, 0x68fa, 0x68fe, 0x9900, 0x9901, 0x9903, 0x9904, 0x9905, 0x9906, 0x9907, 0x9908,
    0x9909, 0x990a, 0x990b, 0x990c, 0x990d, 0x990e, 0x990f, 0x9910, 0x9913, 0x9917, 0x9918,
    0x9919, 0x9990, 0x9991, 0x9992, 0x9993, 0x9994, 0x9995, 0x9996, 0x9997, 0x9998, 0x9999,
    0x999a, 0x999b, 0x999c, 0x999d, 0x99a0, 0x99a2, 0x99a4,
];

/// Sizes tried when looking for the largest supported coded size
pub const RESOLUTION_PROBES: [Resolution; 6] = [
    Resolution::new(1920, 1088),
    Resolution::new(2560, 1440),
    Resolution::new(3840, 2160),
    Resolution::new(4096, 2160),
    Resolution::new(7680, 4320),
    Resolution::new(8192, 4320),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Round both sides up to a multiple of `alignment`
    pub fn aligned(self, alignment: u32) -> Self {
        let alignment = alignment.max(1);
        Self {
            width: self.width.next_multiple_of(alignment),
            height: self.height.next_multiple_of(alignment),
        }
    }
}

impl std::fmt::Display for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Capability queries against one device. Every method is read-only.
pub struct CapabilityProber<'a> {
    device: &'a dyn DecodeDevice,
    log_target: &'a str,
}

impl<'a> CapabilityProber<'a> {
    pub fn new(device: &'a dyn DecodeDevice) -> Self {
        Self {
            device,
            log_target: crate::DEFAULT_LOG_TARGET,
        }
    }

    /// Emit probe diagnostics under `log_target`
    pub fn with_log_target(mut self, log_target: &'a str) -> Self {
        self.log_target = log_target;
        self
    }

    /// First candidate profile for (`codec`, `format`) the driver advertises
    pub fn supported_decoder_profile(
        &self,
        codec: Codec,
        format: VideoFormat,
    ) -> Result<DecoderProfile, DecoderError> {
        let candidates = codec.profile_candidates(format);
        if candidates.is_empty() {
            return Err(DecoderError::UnsupportedFormat(format!(
                "{} cannot be decoded to {}",
                codec,
                format.name()
            )));
        }

        let available = self.device.decoder_profiles()?;
        log::trace!(target: self.log_target, "Device advertises {} decoder profiles", available.len());

        candidates
            .iter()
            .copied()
            .find(|candidate| available.contains(candidate))
            .ok_or_else(|| {
                DecoderError::UnsupportedFormat(format!(
                    "no {} profile for {} on this device",
                    codec,
                    format.name()
                ))
            })
    }

    /// Whether `profile` can decode into `format` surfaces
    pub fn supports_format(&self, profile: DecoderProfile, format: DxgiFormat) -> bool {
        match self.device.check_format(profile, format) {
            Ok(supported) => supported,
            Err(e) => {
                log::warn!(target: self.log_target, "CheckVideoDecoderFormat failed for {}: {}", profile, e);
                false
            }
        }
    }

    /// Whether the device reports a decoder configuration for this size
    pub fn supports_resolution(
        &self,
        profile: DecoderProfile,
        format: DxgiFormat,
        width: u32,
        height: u32,
    ) -> bool {
        !self.configs(profile, format, width, height).is_empty()
    }

    /// Older hardware that is only trusted with H.264
    pub fn is_legacy_device(&self) -> bool {
        let info = self.device.adapter_info();
        (info.vendor_id == VENDOR_AMD || info.vendor_id == VENDOR_AMD_ALT)
            && LEGACY_AMD_DEVICES.contains(&info.device_id)
    }

    /// Largest entry of [`RESOLUTION_PROBES`] the device accepts, probing in
    /// ascending order and stopping at the first refusal
    pub fn max_resolution(&self, profile: DecoderProfile, format: DxgiFormat) -> Option<Resolution> {
        let mut max = None;
        for probe in RESOLUTION_PROBES {
            if !self.supports_resolution(profile, format, probe.width, probe.height) {
                break;
            }
            max = Some(probe);
        }
        max
    }

    /// Decoder configuration whose bitstream mode matches what `codec` feeds
    pub fn select_decoder_config(
        &self,
        codec: Codec,
        desc: &DecoderDesc,
    ) -> Result<HwDecoderConfig, DecoderError> {
        let configs = self.device.decoder_configs(desc)?;
        if configs.is_empty() {
            return Err(DecoderError::UnsupportedFormat(format!(
                "{} does not support {}x{}",
                desc.profile, desc.width, desc.height
            )));
        }

        let wanted = codec.bitstream_raw();
        configs
            .into_iter()
            .find(|config| config.bitstream_raw == wanted)
            .ok_or_else(|| {
                DecoderError::UnsupportedFormat(format!(
                    "no decoder config with ConfigBitstreamRaw {} for {}",
                    wanted, desc.profile
                ))
            })
    }

    fn configs(
        &self,
        profile: DecoderProfile,
        format: DxgiFormat,
        width: u32,
        height: u32,
    ) -> Vec<HwDecoderConfig> {
        let desc = DecoderDesc {
            profile,
            width,
            height,
            format,
        };
        match self.device.decoder_configs(&desc) {
            Ok(configs) => configs,
            Err(e) => {
                log::warn!(
                    target: self.log_target,
                    "GetVideoDecoderConfigCount failed for {}x{}: {}",
                    width,
                    height,
                    e
                );
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::emulated::EmulatedDevice;

    #[test]
    fn test_profile_selection() {
        let device = EmulatedDevice::new();
        let prober = CapabilityProber::new(&device);

        assert_eq!(
            prober.supported_decoder_profile(Codec::H264, VideoFormat::Nv12).unwrap(),
            DecoderProfile::H264_VLD_NOFGT
        );
        assert_eq!(
            prober.supported_decoder_profile(Codec::Vp9, VideoFormat::P01010le).unwrap(),
            DecoderProfile::VP9_VLD_10BIT_PROFILE2
        );
        assert!(matches!(
            prober.supported_decoder_profile(Codec::H264, VideoFormat::P01010le),
            Err(DecoderError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn test_custom_log_target_keeps_results() {
        let device = EmulatedDevice::new();
        let prober = CapabilityProber::new(&device).with_log_target("vdec");

        assert_eq!(prober.log_target, "vdec");
        assert_eq!(CapabilityProber::new(&device).log_target, crate::DEFAULT_LOG_TARGET);
        assert_eq!(
            prober.supported_decoder_profile(Codec::H264, VideoFormat::Nv12).unwrap(),
            DecoderProfile::H264_VLD_NOFGT
        );
    }

    #[test]
    fn test_mpeg2_falls_back_to_combined_profile() {
        let device = EmulatedDevice::new().with_profiles(vec![DecoderProfile::MPEG2_AND_MPEG1_VLD]);
        let prober = CapabilityProber::new(&device);
        assert_eq!(
            prober.supported_decoder_profile(Codec::Mpeg2, VideoFormat::Nv12).unwrap(),
            DecoderProfile::MPEG2_AND_MPEG1_VLD
        );
    }

    #[test]
    fn test_missing_profile_is_unsupported() {
        let device = EmulatedDevice::new().with_profiles(vec![DecoderProfile::H264_VLD_NOFGT]);
        let prober = CapabilityProber::new(&device);
        assert!(prober.supported_decoder_profile(Codec::Vp8, VideoFormat::Nv12).is_err());
    }

    #[test]
    fn test_resolution_limits() {
        let device = EmulatedDevice::new();
        let prober = CapabilityProber::new(&device);
        let profile = DecoderProfile::H264_VLD_NOFGT;

        assert!(prober.supports_resolution(profile, DxgiFormat::NV12, 1920, 1088));
        assert!(!prober.supports_resolution(profile, DxgiFormat::NV12, 8192, 4320));
        assert!(prober.supports_format(profile, DxgiFormat::NV12));
        assert!(!prober.supports_format(profile, DxgiFormat::P010));
    }

    #[test]
    fn test_max_resolution() {
        let device = EmulatedDevice::new();
        let prober = CapabilityProber::new(&device);
        assert_eq!(
            prober.max_resolution(DecoderProfile::HEVC_VLD_MAIN, DxgiFormat::NV12),
            Some(Resolution::new(4096, 2160))
        );

        let small = EmulatedDevice::new().with_max_resolution(1280, 720);
        let prober = CapabilityProber::new(&small);
        assert_eq!(prober.max_resolution(DecoderProfile::HEVC_VLD_MAIN, DxgiFormat::NV12), None);
    }

    #[test]
    fn test_legacy_device_detection() {
        let modern = EmulatedDevice::new();
        assert!(!CapabilityProber::new(&modern).is_legacy_device());

        let legacy = EmulatedDevice::new().with_adapter(0, VENDOR_AMD, 0x6738);
        let prober = CapabilityProber::new(&legacy);
        assert!(prober.is_legacy_device());
        // Repeated queries give the same answer
        assert_eq!(prober.is_legacy_device(), prober.is_legacy_device());

        let new_amd = EmulatedDevice::new().with_adapter(0, VENDOR_AMD, 0x73bf);
        assert!(!CapabilityProber::new(&new_amd).is_legacy_device());

        // Device id alone is not enough
        let other_vendor = EmulatedDevice::new().with_adapter(0, 0x8086, 0x6738);
        assert!(!CapabilityProber::new(&other_vendor).is_legacy_device());
    }

    #[test]
    fn test_config_selection_by_bitstream_mode() {
        let device = EmulatedDevice::new();
        let prober = CapabilityProber::new(&device);
        let desc = DecoderDesc {
            profile: DecoderProfile::H264_VLD_NOFGT,
            width: 1920,
            height: 1088,
            format: DxgiFormat::NV12,
        };
        assert_eq!(prober.select_decoder_config(Codec::H264, &desc).unwrap().bitstream_raw, 2);

        let desc = DecoderDesc {
            profile: DecoderProfile::VP9_VLD_PROFILE0,
            ..desc
        };
        assert_eq!(prober.select_decoder_config(Codec::Vp9, &desc).unwrap().bitstream_raw, 1);
    }

    #[test]
    fn test_aligned_resolution() {
        assert_eq!(Resolution::new(1920, 1080).aligned(16), Resolution::new(1920, 1088));
        assert_eq!(Resolution::new(33, 17).aligned(0), Resolution::new(33, 17));
    }
}
