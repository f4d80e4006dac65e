// GStreamer glue
// Converts between the decoder's negotiation model and gstreamer types so
// the decoder can sit inside a GstVideoDecoder subclass.

use gst::prelude::*;
use gstreamer as gst;
use gstreamer_video as gst_video;

use crate::backend::DeviceId;
use crate::error::DecoderError;
use crate::negotiate::{
    CAPS_FEATURE_MEMORY_D3D11, CAPS_FEATURE_META_OVERLAY_COMPOSITION, CapsEntry, DownstreamCaps,
    MemoryFeature, OutputState, PoolConfig, PoolKind, PoolOption, PoolProposal,
};
use crate::video::VideoFormat;

impl From<VideoFormat> for gst_video::VideoFormat {
    fn from(format: VideoFormat) -> Self {
        match format {
            VideoFormat::Nv12 => gst_video::VideoFormat::Nv12,
            VideoFormat::P01010le => gst_video::VideoFormat::P01010le,
            VideoFormat::I420 => gst_video::VideoFormat::I420,
            VideoFormat::Bgra => gst_video::VideoFormat::Bgra,
        }
    }
}

pub fn from_gst_format(format: gst_video::VideoFormat) -> Option<VideoFormat> {
    match format {
        gst_video::VideoFormat::Nv12 => Some(VideoFormat::Nv12),
        gst_video::VideoFormat::P01010le => Some(VideoFormat::P01010le),
        gst_video::VideoFormat::I420 => Some(VideoFormat::I420),
        gst_video::VideoFormat::Bgra => Some(VideoFormat::Bgra),
        _ => None,
    }
}

/// Source pad caps for a negotiated output
pub fn output_caps(state: &OutputState) -> Result<gst::Caps, DecoderError> {
    let interlace_mode = if state.info.interlaced {
        gst_video::VideoInterlaceMode::Mixed
    } else {
        gst_video::VideoInterlaceMode::Progressive
    };

    let info = gst_video::VideoInfo::builder(state.info.format.into(), state.info.width, state.info.height)
        .fps(gst::Fraction::new(state.framerate.numer, state.framerate.denom))
        .par(gst::Fraction::new(
            state.pixel_aspect_ratio.numer,
            state.pixel_aspect_ratio.denom,
        ))
        .interlace_mode(interlace_mode)
        .build()
        .map_err(|e| DecoderError::NotNegotiated(e.to_string()))?;

    let mut caps = info
        .to_caps()
        .map_err(|e| DecoderError::NotNegotiated(e.to_string()))?;
    {
        let caps = caps.make_mut();
        if let Some(colorimetry) = &state.colorimetry {
            caps.set("colorimetry", colorimetry.as_str());
        }
        if state.memory == MemoryFeature::Device {
            caps.set_features_simple(Some(gst::CapsFeatures::new([CAPS_FEATURE_MEMORY_D3D11])));
        }
    }
    Ok(caps)
}

fn structure_formats(structure: &gst::StructureRef) -> Vec<VideoFormat> {
    let Ok(value) = structure.value("format") else {
        return Vec::new();
    };
    if let Ok(name) = value.get::<&str>() {
        return VideoFormat::from_name(name).into_iter().collect();
    }
    if let Ok(list) = value.get::<gst::List>() {
        return list
            .iter()
            .filter_map(|v| v.get::<&str>().ok())
            .filter_map(VideoFormat::from_name)
            .collect();
    }
    Vec::new()
}

/// Raw video structures of the peer caps, in peer order
pub fn downstream_caps(caps: &gst::CapsRef) -> DownstreamCaps {
    if caps.is_any() {
        return DownstreamCaps::any();
    }

    let entries = caps
        .iter_with_features()
        .filter(|(structure, _)| structure.name() == "video/x-raw")
        .map(|(structure, features)| {
            let memory = if features.contains(CAPS_FEATURE_MEMORY_D3D11) {
                MemoryFeature::Device
            } else {
                MemoryFeature::System
            };
            let mut entry = CapsEntry::new(memory, structure_formats(structure));
            if features.contains(CAPS_FEATURE_META_OVERLAY_COMPOSITION) {
                entry.features.push(CAPS_FEATURE_META_OVERLAY_COMPOSITION.to_string());
            }
            entry
        })
        .collect();

    DownstreamCaps { entries }
}

/// GType name of the d3d11 plugin's buffer pool
pub const D3D11_BUFFER_POOL_TYPE: &str = "GstD3D11BufferPool";

/// Whether `pool` is a D3D11 buffer pool or a subclass of one
pub fn is_d3d11_pool(pool: &gst::BufferPool) -> bool {
    gst::glib::Type::from_name(D3D11_BUFFER_POOL_TYPE).is_some_and(|ty| pool.type_().is_a(ty))
}

/// Pools proposed by downstream. A D3D11 buffer pool is taken to live on
/// `device`, the device of the peer's D3D11 context as known to the
/// embedder; without one every proposal is a generic video pool.
pub fn pool_proposals(query: &gst::query::Allocation, device: Option<DeviceId>) -> Vec<PoolProposal> {
    query
        .allocation_pools()
        .into_iter()
        .map(|(pool, size, min_buffers, max_buffers)| {
            let kind = match (pool, device) {
                (Some(pool), Some(device)) if is_d3d11_pool(&pool) => PoolKind::Device(device),
                _ => PoolKind::Video,
            };
            PoolProposal {
                kind,
                size: size as usize,
                min_buffers,
                max_buffers,
            }
        })
        .collect()
}

/// Apply `config` to `pool`. For [`PoolKind::Device`] the embedder passes
/// its D3D11 buffer pool.
pub fn configure_pool(pool: &gst::BufferPool, caps: &gst::Caps, config: &PoolConfig) -> Result<(), DecoderError> {
    let size = u32::try_from(config.size)
        .map_err(|_| DecoderError::NotNegotiated(format!("buffer size {} too large", config.size)))?;

    let mut pool_config = pool.config();
    pool_config.set_params(Some(caps), size, config.min_buffers, config.max_buffers);
    for option in &config.options {
        let name = match option {
            PoolOption::VideoMeta => gst_video::BUFFER_POOL_OPTION_VIDEO_META.as_str(),
            PoolOption::VideoAlignment => gst_video::BUFFER_POOL_OPTION_VIDEO_ALIGNMENT.as_str(),
        };
        pool_config.add_option(name);
    }

    pool.set_config(pool_config)
        .map_err(|e| DecoderError::NotNegotiated(format!("pool rejected config: {}", e)))
}

/// Write the chosen pool back into the allocation query
pub fn update_allocation_query(
    query: &mut gst::query::Allocation,
    pool: &gst::BufferPool,
    config: &PoolConfig,
) -> Result<(), DecoderError> {
    let size = u32::try_from(config.size)
        .map_err(|_| DecoderError::NotNegotiated(format!("buffer size {} too large", config.size)))?;

    if query.allocation_pools().into_iter().next().is_some() {
        query.set_nth_allocation_pool(0, Some(pool), size, config.min_buffers, config.max_buffers);
    } else {
        query.add_allocation_pool(Some(pool), size, config.min_buffers, config.max_buffers);
    }
    if config.has_option(PoolOption::VideoMeta) {
        query.add_allocation_meta::<gst_video::VideoMeta>(None);
    }
    Ok(())
}
