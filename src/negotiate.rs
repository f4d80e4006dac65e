//! Output negotiation and allocation decisions
//!
//! Decides whether decoded surfaces can be handed downstream as GPU memory
//! or have to be copied into system memory, and which buffer pool backs the
//! output in either case.

use serde::{Deserialize, Serialize};

use crate::backend::DeviceId;
use crate::codec::Codec;
use crate::error::DecoderError;
use crate::video::{VideoFormat, VideoInfo};

pub const CAPS_FEATURE_MEMORY_D3D11: &str = "memory:D3D11Memory";
pub const CAPS_FEATURE_MEMORY_SYSTEM: &str = "memory:SystemMemory";
pub const CAPS_FEATURE_META_OVERLAY_COMPOSITION: &str = "meta:GstVideoOverlayComposition";

/// Where output buffers live
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MemoryFeature {
    Device,
    System,
}

impl MemoryFeature {
    pub fn caps_feature(self) -> &'static str {
        match self {
            MemoryFeature::Device => CAPS_FEATURE_MEMORY_D3D11,
            MemoryFeature::System => CAPS_FEATURE_MEMORY_SYSTEM,
        }
    }

    pub fn from_caps_feature(feature: &str) -> Option<Self> {
        match feature {
            CAPS_FEATURE_MEMORY_D3D11 => Some(MemoryFeature::Device),
            CAPS_FEATURE_MEMORY_SYSTEM => Some(MemoryFeature::System),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fraction {
    pub numer: i32,
    pub denom: i32,
}

impl Fraction {
    pub const fn new(numer: i32, denom: i32) -> Self {
        Self { numer, denom }
    }
}

impl std::fmt::Display for Fraction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.numer, self.denom)
    }
}

/// Stream properties reported by the bitstream parser
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputState {
    pub codec: Codec,
    pub bit_depth: u32,
    pub display_width: u32,
    pub display_height: u32,
    pub interlaced: bool,
    pub framerate: Fraction,
    pub pixel_aspect_ratio: Fraction,
    pub colorimetry: Option<String>,
}

impl InputState {
    pub fn new(codec: Codec, display_width: u32, display_height: u32) -> Self {
        Self {
            codec,
            bit_depth: 8,
            display_width,
            display_height,
            interlaced: false,
            framerate: Fraction::new(0, 1),
            pixel_aspect_ratio: Fraction::new(1, 1),
            colorimetry: None,
        }
    }

    pub fn with_bit_depth(mut self, bit_depth: u32) -> Self {
        self.bit_depth = bit_depth;
        self
    }

    /// Raw format the hardware decodes this stream to
    pub fn output_format(&self) -> VideoFormat {
        if self.bit_depth > 8 {
            VideoFormat::P01010le
        } else {
            VideoFormat::Nv12
        }
    }
}

/// One structure of the downstream caps: a feature set plus the raw
/// formats accepted with it. An empty format list accepts any format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapsEntry {
    pub features: Vec<String>,
    pub formats: Vec<VideoFormat>,
}

impl CapsEntry {
    pub fn new(memory: MemoryFeature, formats: Vec<VideoFormat>) -> Self {
        Self {
            features: vec![memory.caps_feature().to_string()],
            formats,
        }
    }

    fn memory(&self) -> MemoryFeature {
        self.features
            .iter()
            .find_map(|f| MemoryFeature::from_caps_feature(f))
            .unwrap_or(MemoryFeature::System)
    }

    fn accepts(&self, memory: MemoryFeature, format: VideoFormat) -> bool {
        self.memory() == memory && (self.formats.is_empty() || self.formats.contains(&format))
    }
}

/// What the downstream peer can take, in its order of preference
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownstreamCaps {
    pub entries: Vec<CapsEntry>,
}

impl DownstreamCaps {
    /// Unconstrained peer, GPU memory preferred
    pub fn any() -> Self {
        Self {
            entries: vec![
                CapsEntry::new(MemoryFeature::Device, Vec::new()),
                CapsEntry::new(MemoryFeature::System, Vec::new()),
            ],
        }
    }

    pub fn system_memory(formats: Vec<VideoFormat>) -> Self {
        Self {
            entries: vec![CapsEntry::new(MemoryFeature::System, formats)],
        }
    }

    pub fn with_entry(mut self, entry: CapsEntry) -> Self {
        self.entries.push(entry);
        self
    }

    pub fn accepts(&self, memory: MemoryFeature, format: VideoFormat) -> bool {
        self.entries.iter().any(|entry| entry.accepts(memory, format))
    }
}

/// Negotiated output description
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputState {
    pub info: VideoInfo,
    pub memory: MemoryFeature,
    pub framerate: Fraction,
    pub pixel_aspect_ratio: Fraction,
    pub colorimetry: Option<String>,
}

impl OutputState {
    /// Caps string in GStreamer syntax
    pub fn caps_string(&self) -> String {
        let mut caps = String::from("video/x-raw");
        if self.memory == MemoryFeature::Device {
            caps.push('(');
            caps.push_str(CAPS_FEATURE_MEMORY_D3D11);
            caps.push(')');
        }
        caps.push_str(&format!(
            ", format=(string){}, width=(int){}, height=(int){}, framerate=(fraction){}, pixel-aspect-ratio=(fraction){}",
            self.info.format.name(),
            self.info.width,
            self.info.height,
            self.framerate,
            self.pixel_aspect_ratio
        ));
        if self.info.interlaced {
            caps.push_str(", interlace-mode=(string)mixed");
        }
        if let Some(colorimetry) = &self.colorimetry {
            caps.push_str(&format!(", colorimetry=(string){}", colorimetry));
        }
        caps
    }
}

/// Derive the output state for `input`, preferring GPU memory when
/// downstream accepts it.
pub fn negotiate(input: &InputState, downstream: &DownstreamCaps) -> Result<OutputState, DecoderError> {
    let format = input.output_format();
    if !input.codec.output_formats().contains(&format) {
        return Err(DecoderError::NotNegotiated(format!(
            "{} has no {}-bit output",
            input.codec, input.bit_depth
        )));
    }
    if input.display_width == 0 || input.display_height == 0 {
        return Err(DecoderError::NotNegotiated(format!(
            "invalid display size {}x{}",
            input.display_width, input.display_height
        )));
    }

    let memory = [MemoryFeature::Device, MemoryFeature::System]
        .into_iter()
        .find(|memory| downstream.accepts(*memory, format))
        .ok_or_else(|| {
            DecoderError::NotNegotiated(format!("downstream does not accept {}", format.name()))
        })?;

    let info = VideoInfo::new(format, input.display_width, input.display_height)
        .with_interlaced(input.interlaced);

    Ok(OutputState {
        info,
        memory,
        framerate: input.framerate,
        pixel_aspect_ratio: input.pixel_aspect_ratio,
        colorimetry: input.colorimetry.clone(),
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PoolKind {
    /// Textures on the given device
    Device(DeviceId),
    /// Generic system-memory video pool
    Video,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PoolOption {
    VideoMeta,
    VideoAlignment,
}

/// Pool offered in an allocation query
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolProposal {
    pub kind: PoolKind,
    pub size: usize,
    pub min_buffers: u32,
    pub max_buffers: u32,
}

/// Allocation query as seen by the decoder
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationQuery {
    pub caps: Option<OutputState>,
    pub pools: Vec<PoolProposal>,
    pub need_pool: bool,
}

impl AllocationQuery {
    pub fn new(caps: OutputState) -> Self {
        Self {
            caps: Some(caps),
            pools: Vec::new(),
            need_pool: true,
        }
    }

    pub fn with_pool(mut self, pool: PoolProposal) -> Self {
        self.pools.push(pool);
        self
    }
}

/// Configuration applied to the output buffer pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    pub kind: PoolKind,
    pub size: usize,
    pub min_buffers: u32,
    pub max_buffers: u32,
    pub options: Vec<PoolOption>,
}

impl PoolConfig {
    pub fn has_option(&self, option: PoolOption) -> bool {
        self.options.contains(&option)
    }
}

/// Pick the output pool for the negotiated caps carried by `query` and
/// write the decision back into it.
pub fn decide_allocation(
    query: &mut AllocationQuery,
    device: DeviceId,
) -> Result<PoolConfig, DecoderError> {
    let caps = query
        .caps
        .as_ref()
        .ok_or_else(|| DecoderError::NotNegotiated("allocation query without caps".to_string()))?;

    let use_device = caps.memory == MemoryFeature::Device;
    let size = caps.info.size();
    let wanted = if use_device {
        PoolKind::Device(device)
    } else {
        PoolKind::Video
    };

    let (kind, min_buffers, max_buffers) = match query.pools.first() {
        // A device pool of another GPU or a system pool for device caps is
        // not reusable
        Some(proposal) if proposal.kind == wanted => {
            (proposal.kind, proposal.min_buffers, proposal.max_buffers)
        }
        Some(proposal) => (wanted, proposal.min_buffers, proposal.max_buffers),
        None => (wanted, 0, 0),
    };

    let options = if use_device {
        vec![PoolOption::VideoMeta]
    } else {
        vec![PoolOption::VideoMeta, PoolOption::VideoAlignment]
    };

    let proposal = PoolProposal {
        kind,
        size,
        min_buffers,
        max_buffers,
    };
    match query.pools.first_mut() {
        Some(first) => *first = proposal,
        None => query.pools.push(proposal),
    }

    Ok(PoolConfig {
        kind,
        size,
        min_buffers,
        max_buffers,
        options,
    })
}

/// Rewrite a caps feature set for `memory`: the memory feature is replaced,
/// the overlay composition meta survives, everything else is dropped.
pub fn transform_caps_features(features: &[String], memory: MemoryFeature) -> Vec<String> {
    let mut out = vec![memory.caps_feature().to_string()];
    if features.iter().any(|f| f == CAPS_FEATURE_META_OVERLAY_COMPOSITION) {
        out.push(CAPS_FEATURE_META_OVERLAY_COMPOSITION.to_string());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(codec: Codec) -> InputState {
        InputState::new(codec, 1920, 1080)
    }

    #[test]
    fn test_prefers_device_memory() {
        let out = negotiate(&input(Codec::H264), &DownstreamCaps::any()).unwrap();
        assert_eq!(out.memory, MemoryFeature::Device);
        assert_eq!(out.info.format, VideoFormat::Nv12);
        assert_eq!((out.info.width, out.info.height), (1920, 1080));
    }

    #[test]
    fn test_system_memory_fallback() {
        let downstream = DownstreamCaps::system_memory(vec![VideoFormat::Nv12, VideoFormat::I420]);
        let out = negotiate(&input(Codec::H264), &downstream).unwrap();
        assert_eq!(out.memory, MemoryFeature::System);
    }

    #[test]
    fn test_ten_bit_output() {
        let input = input(Codec::H265).with_bit_depth(10);
        let out = negotiate(&input, &DownstreamCaps::any()).unwrap();
        assert_eq!(out.info.format, VideoFormat::P01010le);

        // H.264 has no 10-bit decode profile here
        let input = InputState::new(Codec::H264, 1920, 1080).with_bit_depth(10);
        assert!(matches!(
            negotiate(&input, &DownstreamCaps::any()),
            Err(DecoderError::NotNegotiated(_))
        ));
    }

    #[test]
    fn test_incompatible_downstream() {
        let downstream = DownstreamCaps::system_memory(vec![VideoFormat::Bgra]);
        assert!(matches!(
            negotiate(&input(Codec::Vp9), &downstream),
            Err(DecoderError::NotNegotiated(_))
        ));
    }

    #[test]
    fn test_carries_interlace_and_colorimetry() {
        let mut input = input(Codec::Mpeg2);
        input.interlaced = true;
        input.colorimetry = Some("bt709".to_string());
        input.framerate = Fraction::new(30000, 1001);

        let out = negotiate(&input, &DownstreamCaps::any()).unwrap();
        assert!(out.info.interlaced);
        let caps = out.caps_string();
        assert!(caps.starts_with("video/x-raw(memory:D3D11Memory), format=(string)NV12"));
        assert!(caps.contains("framerate=(fraction)30000/1001"));
        assert!(caps.contains("interlace-mode=(string)mixed"));
        assert!(caps.contains("colorimetry=(string)bt709"));
    }

    #[test]
    fn test_allocation_without_caps() {
        let mut query = AllocationQuery::default();
        assert!(matches!(
            decide_allocation(&mut query, DeviceId(1)),
            Err(DecoderError::NotNegotiated(_))
        ));
    }

    #[test]
    fn test_device_pool_for_device_caps() {
        let caps = negotiate(&input(Codec::H264), &DownstreamCaps::any()).unwrap();
        let size = caps.info.size();
        let mut query = AllocationQuery::new(caps);

        let config = decide_allocation(&mut query, DeviceId(7)).unwrap();
        assert_eq!(config.kind, PoolKind::Device(DeviceId(7)));
        assert_eq!(config.size, size);
        assert!(config.has_option(PoolOption::VideoMeta));
        assert!(!config.has_option(PoolOption::VideoAlignment));
        assert_eq!((config.min_buffers, config.max_buffers), (0, 0));
        assert_eq!(query.pools.len(), 1);
    }

    #[test]
    fn test_video_pool_for_system_caps() {
        let downstream = DownstreamCaps::system_memory(Vec::new());
        let caps = negotiate(&input(Codec::H264), &downstream).unwrap();
        let mut query = AllocationQuery::new(caps).with_pool(PoolProposal {
            kind: PoolKind::Device(DeviceId(7)),
            size: 1,
            min_buffers: 2,
            max_buffers: 8,
        });

        let config = decide_allocation(&mut query, DeviceId(7)).unwrap();
        assert_eq!(config.kind, PoolKind::Video);
        assert!(config.has_option(PoolOption::VideoAlignment));
        assert_eq!((config.min_buffers, config.max_buffers), (2, 8));
        // Proposal replaced in place
        assert_eq!(query.pools.len(), 1);
        assert_eq!(query.pools[0].kind, PoolKind::Video);
    }

    #[test]
    fn test_foreign_device_pool_replaced() {
        let caps = negotiate(&input(Codec::H264), &DownstreamCaps::any()).unwrap();
        let mut query = AllocationQuery::new(caps).with_pool(PoolProposal {
            kind: PoolKind::Device(DeviceId(99)),
            size: 0,
            min_buffers: 1,
            max_buffers: 0,
        });

        let config = decide_allocation(&mut query, DeviceId(7)).unwrap();
        assert_eq!(config.kind, PoolKind::Device(DeviceId(7)));
        assert_eq!(config.min_buffers, 1);
    }

    #[test]
    fn test_transform_caps_features() {
        let features = vec![
            CAPS_FEATURE_MEMORY_SYSTEM.to_string(),
            CAPS_FEATURE_META_OVERLAY_COMPOSITION.to_string(),
            "meta:Other".to_string(),
        ];
        assert_eq!(
            transform_caps_features(&features, MemoryFeature::Device),
            vec![
                CAPS_FEATURE_MEMORY_D3D11.to_string(),
                CAPS_FEATURE_META_OVERLAY_COMPOSITION.to_string()
            ]
        );
        assert_eq!(
            transform_caps_features(&[], MemoryFeature::System),
            vec![CAPS_FEATURE_MEMORY_SYSTEM.to_string()]
        );
    }
}
