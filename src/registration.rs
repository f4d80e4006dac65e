//! Per-device decoder registration
//!
//! Builds the class data (sink/src caps plus adapter identity) for every
//! codec a device can decode, and creates decoders from it. Enumerating the
//! adapters themselves is left to the embedder.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::backend::DecodeDevice;
use crate::caps::{CapabilityProber, Resolution};
use crate::codec::Codec;
use crate::decoder::{Decoder, DecoderSettings};
use crate::error::DecoderError;
use crate::negotiate::CAPS_FEATURE_MEMORY_D3D11;
use crate::video::VideoFormat;

/// GStreamer `GST_RANK_SECONDARY`
pub const RANK_SECONDARY: u32 = 128;

/// Everything an element class needs to know about its device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecoderClassData {
    pub sink_caps: String,
    pub src_caps: String,
    pub adapter: u32,
    pub device_id: u32,
    pub vendor_id: u32,
    pub description: String,
}

impl DecoderClassData {
    pub fn new(device: &dyn DecodeDevice, sink_caps: String, src_caps: String) -> Self {
        let info = device.adapter_info();
        Self {
            sink_caps,
            src_caps,
            adapter: info.adapter,
            device_id: info.device_id,
            vendor_id: info.vendor_id,
            description: info.description,
        }
    }

    /// Whether `device` is the adapter this class was registered for
    pub fn matches(&self, device: &dyn DecodeDevice) -> bool {
        let info = device.adapter_info();
        info.adapter == self.adapter
            && info.device_id == self.device_id
            && info.vendor_id == self.vendor_id
    }
}

/// One decoder element to register
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecoderRegistration {
    pub codec: Codec,
    pub element_name: String,
    pub long_name: String,
    pub rank: u32,
    pub max_resolution: Resolution,
    pub class_data: DecoderClassData,
}

impl DecoderRegistration {
    /// Create a decoder for this registration on `device`
    pub fn create_decoder(
        &self,
        device: Arc<dyn DecodeDevice>,
        settings: DecoderSettings,
    ) -> Result<Decoder, DecoderError> {
        if !self.class_data.matches(device.as_ref()) {
            return Err(DecoderError::InvalidState(format!(
                "{} was registered for adapter {} ({:04x}:{:04x})",
                self.element_name,
                self.class_data.adapter,
                self.class_data.vendor_id,
                self.class_data.device_id
            )));
        }
        Ok(Decoder::new(device, settings))
    }
}

/// Codecs worth probing on `device`. Software adapters get none and legacy
/// hardware only H.264.
pub fn codecs_for_device(device: &dyn DecodeDevice) -> Vec<Codec> {
    if !device.adapter_info().hardware {
        return Vec::new();
    }
    if CapabilityProber::new(device).is_legacy_device() {
        return vec![Codec::H264];
    }
    Codec::ALL.to_vec()
}

/// Probe every codec of [`codecs_for_device`] and describe the ones the
/// device can actually decode
pub fn register_device(device: &dyn DecodeDevice) -> Vec<DecoderRegistration> {
    let info = device.adapter_info();
    let prober = CapabilityProber::new(device);

    codecs_for_device(device)
        .into_iter()
        .filter_map(|codec| {
            let registration = register_codec(device, &prober, codec);
            if registration.is_none() {
                log::debug!(
                    target: crate::DEFAULT_LOG_TARGET,
                    "{} is not supported by {}",
                    codec,
                    info.description
                );
            }
            registration
        })
        .collect()
}

fn register_codec(
    device: &dyn DecodeDevice,
    prober: &CapabilityProber<'_>,
    codec: Codec,
) -> Option<DecoderRegistration> {
    let formats: Vec<VideoFormat> = codec
        .output_formats()
        .iter()
        .copied()
        .filter(|&format| {
            prober
                .supported_decoder_profile(codec, format)
                .ok()
                .zip(format.dxgi_format())
                .is_some_and(|(profile, dxgi)| prober.supports_format(profile, dxgi))
        })
        .collect();

    // The 8-bit profile decides the advertised size range
    let base = *formats.first()?;
    let profile = prober.supported_decoder_profile(codec, base).ok()?;
    let max = prober.max_resolution(profile, base.dxgi_format()?)?;
    let ten_bit = formats.contains(&VideoFormat::P01010le);

    let class_data = DecoderClassData::new(
        device,
        sink_caps(codec, max, ten_bit),
        src_caps(&formats, max),
    );
    let suffix = match class_data.adapter {
        0 => String::new(),
        n => format!("device{}", n),
    };

    log::info!(
        target: crate::DEFAULT_LOG_TARGET,
        "Registering {} decoder for {} up to {}",
        codec,
        class_data.description,
        max
    );

    Some(DecoderRegistration {
        codec,
        element_name: format!("d3d11{}{}dec", codec.name(), suffix),
        long_name: format!("Direct3D11 {} {} Decoder", display_name(codec), class_data.description),
        rank: RANK_SECONDARY,
        max_resolution: max,
        class_data,
    })
}

fn display_name(codec: Codec) -> &'static str {
    match codec {
        Codec::H264 => "H.264",
        Codec::H265 => "H.265",
        Codec::Vp8 => "VP8",
        Codec::Vp9 => "VP9",
        Codec::Mpeg2 => "MPEG2",
        Codec::None => "",
    }
}

fn size_range(max: Resolution) -> String {
    format!(
        "width=(int)[ 1, {} ], height=(int)[ 1, {} ]",
        max.width, max.height
    )
}

/// Compressed caps accepted by the `codec` decoder
pub fn sink_caps(codec: Codec, max: Resolution, ten_bit: bool) -> String {
    let media = match codec {
        Codec::H264 => "video/x-h264, stream-format=(string){ avc, avc3, byte-stream }, \
                        alignment=(string)au, profile=(string){ high, main, constrained-baseline, baseline }"
            .to_string(),
        Codec::H265 => {
            let profiles = if ten_bit { "{ main, main-10 }" } else { "main" };
            format!(
                "video/x-h265, stream-format=(string){{ hev1, hvc1, byte-stream }}, \
                 alignment=(string)au, profile=(string){}",
                profiles
            )
        }
        Codec::Vp9 => {
            let profiles = if ten_bit { "{ 0, 2 }" } else { "0" };
            format!("video/x-vp9, alignment=(string)frame, profile=(string){}", profiles)
        }
        Codec::Vp8 => "video/x-vp8".to_string(),
        Codec::Mpeg2 => {
            "video/mpeg, mpegversion=(int)2, systemstream=(boolean)false, profile=(string){ main, simple }"
                .to_string()
        }
        Codec::None => return String::new(),
    };
    format!("{}, {}", media, size_range(max))
}

/// Raw caps produced by a decoder outputting `formats`
pub fn src_caps(formats: &[VideoFormat], max: Resolution) -> String {
    let format = match formats {
        [single] => single.name().to_string(),
        _ => format!(
            "{{ {} }}",
            formats.iter().map(|f| f.name()).collect::<Vec<_>>().join(", ")
        ),
    };
    let fields = format!("format=(string){}, {}", format, size_range(max));
    format!(
        "video/x-raw({}), {}; video/x-raw, {}",
        CAPS_FEATURE_MEMORY_D3D11, fields, fields
    )
}
