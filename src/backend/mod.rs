// Hardware video decode device abstraction
//
// Backends:
// 1. Direct3D11 video device (Windows)
// 2. Emulated device (every platform, used for tests and GPU-less hosts)

pub mod emulated;

#[cfg(target_os = "windows")]
pub mod d3d11;

use std::any::Any;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::codec::DecoderProfile;
use crate::error::DecoderError;
use crate::video::{PlaneMut, VideoFormat};

/// DXGI surface format value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DxgiFormat(pub u32);

impl DxgiFormat {
    pub const UNKNOWN: Self = Self(0);
    pub const NV12: Self = Self(103);
    pub const P010: Self = Self(104);
}

/// Identity of a GPU device, compared to decide zero-copy eligibility
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceId(pub u64);

/// Adapter description reported by the device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterInfo {
    pub adapter: u32,
    pub vendor_id: u32,
    pub device_id: u32,
    pub description: String,
    /// False for software rasterizers (WARP and friends)
    pub hardware: bool,
}

/// Scratch buffer kinds, numerically identical to
/// `D3D11_VIDEO_DECODER_BUFFER_TYPE`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u32)]
pub enum DecoderBufferType {
    PictureParameters = 0,
    MacroblockControl = 1,
    ResidualDifference = 2,
    DeblockingControl = 3,
    InverseQuantizationMatrix = 4,
    SliceControl = 5,
    Bitstream = 6,
    MotionVector = 7,
    FilmGrain = 8,
}

impl DecoderBufferType {
    pub const ALL: [DecoderBufferType; 9] = [
        DecoderBufferType::PictureParameters,
        DecoderBufferType::MacroblockControl,
        DecoderBufferType::ResidualDifference,
        DecoderBufferType::DeblockingControl,
        DecoderBufferType::InverseQuantizationMatrix,
        DecoderBufferType::SliceControl,
        DecoderBufferType::Bitstream,
        DecoderBufferType::MotionVector,
        DecoderBufferType::FilmGrain,
    ];

    pub fn from_raw(raw: u32) -> Option<Self> {
        Self::ALL.get(raw as usize).copied()
    }

    pub fn as_raw(self) -> u32 {
        self as u32
    }
}

/// One entry of a frame submission, mirrors `D3D11_VIDEO_DECODER_BUFFER_DESC`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecoderBufferDesc {
    pub buffer_type: DecoderBufferType,
    pub buffer_index: u32,
    pub data_offset: u32,
    pub data_size: u32,
    pub first_mb_address: u32,
    pub num_mbs_in_buffer: u32,
}

impl DecoderBufferDesc {
    pub fn new(buffer_type: DecoderBufferType, data_size: u32) -> Self {
        Self {
            buffer_type,
            buffer_index: 0,
            data_offset: 0,
            data_size,
            first_mb_address: 0,
            num_mbs_in_buffer: 0,
        }
    }

    pub fn with_macroblocks(mut self, first: u32, count: u32) -> Self {
        self.first_mb_address = first;
        self.num_mbs_in_buffer = count;
        self
    }
}

/// Decoder description, mirrors `D3D11_VIDEO_DECODER_DESC`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecoderDesc {
    pub profile: DecoderProfile,
    pub width: u32,
    pub height: u32,
    pub format: DxgiFormat,
}

/// One hardware decoder configuration as reported for a [`DecoderDesc`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HwDecoderConfig {
    /// Position in the device's config list
    pub index: u32,
    pub bitstream_raw: u32,
}

/// Decoder handle plus the surfaces it decodes into, created together
pub struct HwSession {
    pub decoder: Box<dyn HwDecoder>,
    pub surfaces: Arc<dyn SurfaceArray>,
}

/// GPU texture owned by a downstream consumer, target of zero-copy output
#[derive(Clone)]
pub struct DeviceSurface {
    pub device: DeviceId,
    pub format: VideoFormat,
    pub width: u32,
    pub height: u32,
    /// Backend specific texture object
    pub handle: Arc<dyn Any + Send + Sync>,
}

impl std::fmt::Debug for DeviceSurface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceSurface")
            .field("device", &self.device)
            .field("format", &self.format)
            .field("width", &self.width)
            .field("height", &self.height)
            .finish()
    }
}

/// A GPU that exposes a video decode unit
pub trait DecodeDevice: Send + Sync {
    fn device_id(&self) -> DeviceId;

    fn adapter_info(&self) -> AdapterInfo;

    /// Every decoder profile the driver advertises
    fn decoder_profiles(&self) -> Result<Vec<DecoderProfile>, DecoderError>;

    /// Whether `profile` can decode into surfaces of `format`
    fn check_format(&self, profile: DecoderProfile, format: DxgiFormat) -> Result<bool, DecoderError>;

    /// Decoder configurations available for `desc`; empty when the
    /// resolution is out of range
    fn decoder_configs(&self, desc: &DecoderDesc) -> Result<Vec<HwDecoderConfig>, DecoderError>;

    /// Allocate a `surface_count` slice texture array decodable with `desc`
    fn create_surfaces(
        &self,
        desc: &DecoderDesc,
        surface_count: usize,
    ) -> Result<Arc<dyn SurfaceArray>, DecoderError>;

    /// Create a decoder handle writing into `surfaces`, which must come from
    /// [`DecodeDevice::create_surfaces`] on this device with the same `desc`
    fn create_decoder(
        &self,
        desc: &DecoderDesc,
        config: &HwDecoderConfig,
        surfaces: &Arc<dyn SurfaceArray>,
    ) -> Result<Box<dyn HwDecoder>, DecoderError>;

    /// Surfaces and a decoder on them in one step
    fn create_session(
        &self,
        desc: &DecoderDesc,
        config: &HwDecoderConfig,
        surface_count: usize,
    ) -> Result<HwSession, DecoderError> {
        let surfaces = self.create_surfaces(desc, surface_count)?;
        let decoder = self.create_decoder(desc, config, &surfaces)?;
        Ok(HwSession { decoder, surfaces })
    }
}

/// Hardware decoder handle, driven one frame at a time
pub trait HwDecoder: Send {
    fn begin_frame(&mut self, view: u8, content_key: Option<&[u8]>) -> Result<(), DecoderError>;

    /// Map the scratch region of `buffer_type`. Valid until released.
    fn get_buffer(&mut self, buffer_type: DecoderBufferType) -> Result<&mut [u8], DecoderError>;

    fn release_buffer(&mut self, buffer_type: DecoderBufferType) -> Result<(), DecoderError>;

    fn submit(&mut self, buffers: &[DecoderBufferDesc]) -> Result<(), DecoderError>;

    fn end_frame(&mut self) -> Result<(), DecoderError>;
}

/// Texture array backing the output view pool
pub trait SurfaceArray: Send + Sync {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn device_id(&self) -> DeviceId;

    fn format(&self) -> DxgiFormat;

    /// Allocated (aligned) surface size
    fn dimensions(&self) -> (u32, u32);

    /// Concrete backend type, for the backend's own decoder
    fn as_any(&self) -> &dyn Any;

    /// Copy the top-left `width` x `height` region of slice `index` into
    /// system memory planes
    fn read_slice(
        &self,
        index: u8,
        width: u32,
        height: u32,
        planes: &mut [PlaneMut<'_>],
    ) -> Result<(), DecoderError>;

    /// GPU copy of the top-left region of slice `index` into `target`
    fn copy_slice_to(
        &self,
        index: u8,
        width: u32,
        height: u32,
        target: &DeviceSurface,
    ) -> Result<(), DecoderError>;
}
