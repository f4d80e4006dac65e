// Emulated video decode device
// Software stand-in for a GPU decode unit, with configurable capabilities
// and fault injection. Decoded pictures are filled with a deterministic
// pattern so readback and crop paths can be verified.

use std::any::Any;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use super::{
    AdapterInfo, DecodeDevice, DecoderBufferDesc, DecoderBufferType, DecoderDesc, DeviceId,
    DeviceSurface, DxgiFormat, HwDecoder, HwDecoderConfig, HwSession, SurfaceArray,
};
use crate::codec::DecoderProfile;
use crate::error::DecoderError;
use crate::video::{PlaneMut, VideoFormat, copy_plane};

static NEXT_DEVICE_ID: AtomicU64 = AtomicU64::new(0x1000);

/// Default maximum coded size, matches common 4K-class decode units
pub const DEFAULT_MAX_WIDTH: u32 = 4096;
pub const DEFAULT_MAX_HEIGHT: u32 = 2176;

/// Byte written at (`x`, `y`) of `plane` for the `frame`-th decoded picture
pub fn pattern_byte(frame: u64, plane: usize, x: usize, y: usize) -> u8 {
    (frame as usize * 7 + plane * 50 + x + 3 * y) as u8
}

fn scratch_size(buffer_type: DecoderBufferType) -> usize {
    match buffer_type {
        DecoderBufferType::Bitstream => 256 * 1024,
        DecoderBufferType::SliceControl => 64 * 1024,
        _ => 4096,
    }
}

struct DeviceState {
    profiles: Vec<DecoderProfile>,
    formats: Vec<DxgiFormat>,
    max_width: u32,
    max_height: u32,
    lost: bool,
    fail_next_submit: bool,
    fail_surfaces: usize,
    fail_decoders: usize,
    live_decoders: usize,
    live_surfaces: usize,
    outstanding_buffers: usize,
    peak_live_decoders: usize,
    sessions_created: usize,
    frames_decoded: u64,
    last_submission: Vec<DecoderBufferDesc>,
    last_content_key: Option<Vec<u8>>,
}

/// Software decode device
pub struct EmulatedDevice {
    id: DeviceId,
    info: AdapterInfo,
    state: Arc<Mutex<DeviceState>>,
}

impl EmulatedDevice {
    /// Hardware-class device supporting every known profile in NV12 and P010
    pub fn new() -> Self {
        Self {
            id: DeviceId(NEXT_DEVICE_ID.fetch_add(1, Ordering::Relaxed)),
            info: AdapterInfo {
                adapter: 0,
                vendor_id: 0x10de,
                device_id: 0x1eb8,
                description: "Emulated Video Decoder".to_string(),
                hardware: true,
            },
            state: Arc::new(Mutex::new(DeviceState {
                profiles: DecoderProfile::known().collect(),
                formats: vec![DxgiFormat::NV12, DxgiFormat::P010],
                max_width: DEFAULT_MAX_WIDTH,
                max_height: DEFAULT_MAX_HEIGHT,
                lost: false,
                fail_next_submit: false,
                fail_surfaces: 0,
                fail_decoders: 0,
                live_decoders: 0,
                live_surfaces: 0,
                outstanding_buffers: 0,
                peak_live_decoders: 0,
                sessions_created: 0,
                frames_decoded: 0,
                last_submission: Vec::new(),
                last_content_key: None,
            })),
        }
    }

    pub fn with_profiles(self, profiles: Vec<DecoderProfile>) -> Self {
        self.state.lock().profiles = profiles;
        self
    }

    pub fn with_formats(self, formats: Vec<DxgiFormat>) -> Self {
        self.state.lock().formats = formats;
        self
    }

    pub fn with_max_resolution(self, width: u32, height: u32) -> Self {
        {
            let mut state = self.state.lock();
            state.max_width = width;
            state.max_height = height;
        }
        self
    }

    pub fn with_adapter(mut self, adapter: u32, vendor_id: u32, device_id: u32) -> Self {
        self.info.adapter = adapter;
        self.info.vendor_id = vendor_id;
        self.info.device_id = device_id;
        self
    }

    /// Report as a software rasterizer
    pub fn software(mut self) -> Self {
        self.info.hardware = false;
        self
    }

    /// Simulate a device reset; every hardware call fails until restored
    pub fn lose_device(&self) {
        log::warn!(target: crate::DEFAULT_LOG_TARGET, "Emulated device {:?} lost", self.id);
        self.state.lock().lost = true;
    }

    pub fn restore_device(&self) {
        self.state.lock().lost = false;
    }

    /// Reject the next frame submission as malformed
    pub fn fail_next_submit(&self) {
        self.state.lock().fail_next_submit = true;
    }

    /// Fail the next `count` surface array allocations
    pub fn fail_surface_allocation(&self, count: usize) {
        self.state.lock().fail_surfaces = count;
    }

    /// Fail the next `count` decoder handle creations
    pub fn fail_decoder_creation(&self, count: usize) {
        self.state.lock().fail_decoders = count;
    }

    /// Hardware decoder handles currently alive
    pub fn live_decoders(&self) -> usize {
        self.state.lock().live_decoders
    }

    /// Most hardware decoder handles ever alive at the same time
    pub fn peak_live_decoders(&self) -> usize {
        self.state.lock().peak_live_decoders
    }

    /// Surface arrays currently allocated
    pub fn live_surface_arrays(&self) -> usize {
        self.state.lock().live_surfaces
    }

    /// Decoder buffers mapped and not yet released
    pub fn outstanding_buffers(&self) -> usize {
        self.state.lock().outstanding_buffers
    }

    /// Decoder handles created so far
    pub fn sessions_created(&self) -> usize {
        self.state.lock().sessions_created
    }

    pub fn frames_decoded(&self) -> u64 {
        self.state.lock().frames_decoded
    }

    pub fn last_submission(&self) -> Vec<DecoderBufferDesc> {
        self.state.lock().last_submission.clone()
    }

    pub fn last_content_key(&self) -> Option<Vec<u8>> {
        self.state.lock().last_content_key.clone()
    }

    /// Allocate a texture on this device, usable as a zero-copy output target
    pub fn create_texture(&self, format: VideoFormat, width: u32, height: u32) -> DeviceSurface {
        DeviceSurface {
            device: self.id,
            format,
            width,
            height,
            handle: Arc::new(EmulatedTexture {
                format,
                width,
                data: Mutex::new(vec![0u8; packed_size(format, width, height)]),
            }),
        }
    }

    /// Packed contents of a texture created by [`EmulatedDevice::create_texture`]
    pub fn texture_data(surface: &DeviceSurface) -> Option<Vec<u8>> {
        surface
            .handle
            .downcast_ref::<EmulatedTexture>()
            .map(|texture| texture.data.lock().clone())
    }
}

impl Default for EmulatedDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl DecodeDevice for EmulatedDevice {
    fn device_id(&self) -> DeviceId {
        self.id
    }

    fn adapter_info(&self) -> AdapterInfo {
        self.info.clone()
    }

    fn decoder_profiles(&self) -> Result<Vec<DecoderProfile>, DecoderError> {
        let state = self.state.lock();
        if state.lost {
            return Err(DecoderError::device_lost("GetVideoDecoderProfile", "device removed"));
        }
        Ok(state.profiles.clone())
    }

    fn check_format(&self, profile: DecoderProfile, format: DxgiFormat) -> Result<bool, DecoderError> {
        let state = self.state.lock();
        if state.lost {
            return Err(DecoderError::device_lost("CheckVideoDecoderFormat", "device removed"));
        }
        let ten_bit_profile = profile == DecoderProfile::HEVC_VLD_MAIN10
            || profile == DecoderProfile::VP9_VLD_10BIT_PROFILE2;
        let ten_bit_format = format == DxgiFormat::P010;
        Ok(state.profiles.contains(&profile)
            && state.formats.contains(&format)
            && ten_bit_profile == ten_bit_format)
    }

    fn decoder_configs(&self, desc: &DecoderDesc) -> Result<Vec<HwDecoderConfig>, DecoderError> {
        let state = self.state.lock();
        if state.lost {
            return Err(DecoderError::device_lost("GetVideoDecoderConfigCount", "device removed"));
        }
        if !state.profiles.contains(&desc.profile)
            || desc.width == 0
            || desc.height == 0
            || desc.width > state.max_width
            || desc.height > state.max_height
        {
            return Ok(Vec::new());
        }

        // Long and short slice formats, as most drivers report
        Ok(vec![
            HwDecoderConfig {
                index: 0,
                bitstream_raw: 1,
            },
            HwDecoderConfig {
                index: 1,
                bitstream_raw: 2,
            },
        ])
    }

    fn create_surfaces(
        &self,
        desc: &DecoderDesc,
        surface_count: usize,
    ) -> Result<Arc<dyn SurfaceArray>, DecoderError> {
        let video_format = VideoFormat::from_dxgi(desc.format).ok_or_else(|| {
            DecoderError::device("CreateTexture2D", format!("unsupported format {:?}", desc.format))
        })?;

        let mut state = self.state.lock();
        if state.lost {
            return Err(DecoderError::device_lost("CreateTexture2D", "device removed"));
        }
        if state.fail_surfaces > 0 {
            state.fail_surfaces -= 1;
            return Err(DecoderError::device("CreateTexture2D", "out of video memory"));
        }
        if desc.width > state.max_width || desc.height > state.max_height {
            return Err(DecoderError::device("CreateTexture2D", "E_INVALIDARG"));
        }
        state.live_surfaces += 1;

        let slice_size = packed_size(video_format, desc.width, desc.height);
        Ok(Arc::new(EmulatedSurfaces {
            device: self.id,
            state: self.state.clone(),
            format: desc.format,
            video_format,
            width: desc.width,
            height: desc.height,
            slices: (0..surface_count)
                .map(|_| Mutex::new(vec![0u8; slice_size]))
                .collect(),
        }))
    }

    fn create_decoder(
        &self,
        desc: &DecoderDesc,
        config: &HwDecoderConfig,
        surfaces: &Arc<dyn SurfaceArray>,
    ) -> Result<Box<dyn HwDecoder>, DecoderError> {
        let Some(emulated) = surfaces.as_any().downcast_ref::<EmulatedSurfaces>() else {
            return Err(DecoderError::device("CreateVideoDecoderOutputView", "foreign surfaces"));
        };
        if emulated.device != self.id
            || emulated.format != desc.format
            || (emulated.width, emulated.height) != (desc.width, desc.height)
        {
            return Err(DecoderError::device("CreateVideoDecoderOutputView", "E_INVALIDARG"));
        }

        let mut state = self.state.lock();
        if state.lost {
            return Err(DecoderError::device_lost("CreateVideoDecoder", "device removed"));
        }
        if state.fail_decoders > 0 {
            state.fail_decoders -= 1;
            return Err(DecoderError::device("CreateVideoDecoder", "E_OUTOFMEMORY"));
        }

        state.live_decoders += 1;
        state.peak_live_decoders = state.peak_live_decoders.max(state.live_decoders);
        state.sessions_created += 1;

        log::debug!(
            target: crate::DEFAULT_LOG_TARGET,
            "Emulated decoder created: {} {}x{}, config {} (raw {}), {} surfaces",
            desc.profile,
            desc.width,
            desc.height,
            config.index,
            config.bitstream_raw,
            surfaces.len()
        );

        Ok(Box::new(EmulatedDecoder {
            state: self.state.clone(),
            surfaces: surfaces.clone(),
            scratch: HashMap::new(),
            mapped: BTreeSet::new(),
            target: None,
            submitted: false,
        }))
    }
}

fn packed_size(format: VideoFormat, width: u32, height: u32) -> usize {
    (0..format.n_planes())
        .map(|plane| format.plane_row_bytes(plane, width) * format.plane_rows(plane, height))
        .sum()
}

fn plane_offset(format: VideoFormat, width: u32, height: u32, plane: usize) -> usize {
    (0..plane)
        .map(|p| format.plane_row_bytes(p, width) * format.plane_rows(p, height))
        .sum()
}

struct EmulatedTexture {
    format: VideoFormat,
    width: u32,
    data: Mutex<Vec<u8>>,
}

struct EmulatedSurfaces {
    device: DeviceId,
    state: Arc<Mutex<DeviceState>>,
    format: DxgiFormat,
    video_format: VideoFormat,
    width: u32,
    height: u32,
    slices: Vec<Mutex<Vec<u8>>>,
}

impl EmulatedSurfaces {
    fn slice(&self, index: u8) -> Result<&Mutex<Vec<u8>>, DecoderError> {
        self.slices
            .get(index as usize)
            .ok_or_else(|| DecoderError::device("CopySubresourceRegion", format!("no slice {}", index)))
    }

    fn check_region(&self, width: u32, height: u32) -> Result<(), DecoderError> {
        if width > self.width || height > self.height {
            return Err(DecoderError::ConversionError(format!(
                "region {}x{} exceeds surface {}x{}",
                width, height, self.width, self.height
            )));
        }
        Ok(())
    }

    fn fill_pattern(&self, index: u8, frame: u64) -> Result<(), DecoderError> {
        let format = self.video_format;
        let mut data = self.slice(index)?.lock();

        for plane in 0..format.n_planes() {
            let pitch = format.plane_row_bytes(plane, self.width);
            let base = plane_offset(format, self.width, self.height, plane);
            for y in 0..format.plane_rows(plane, self.height) {
                for x in 0..pitch {
                    data[base + y * pitch + x] = pattern_byte(frame, plane, x, y);
                }
            }
        }
        Ok(())
    }
}

impl SurfaceArray for EmulatedSurfaces {
    fn len(&self) -> usize {
        self.slices.len()
    }

    fn device_id(&self) -> DeviceId {
        self.device
    }

    fn format(&self) -> DxgiFormat {
        self.format
    }

    fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn read_slice(
        &self,
        index: u8,
        width: u32,
        height: u32,
        planes: &mut [PlaneMut<'_>],
    ) -> Result<(), DecoderError> {
        self.check_region(width, height)?;
        let format = self.video_format;
        if planes.len() < format.n_planes() {
            return Err(DecoderError::ConversionError(format!(
                "{} planes given, {} needs {}",
                planes.len(),
                format.name(),
                format.n_planes()
            )));
        }

        let data = self.slice(index)?.lock();
        for (plane, dst) in planes.iter_mut().take(format.n_planes()).enumerate() {
            let pitch = format.plane_row_bytes(plane, self.width);
            let base = plane_offset(format, self.width, self.height, plane);
            copy_plane(
                &data[base..],
                pitch,
                dst.data,
                dst.stride,
                format.plane_row_bytes(plane, width),
                format.plane_rows(plane, height),
            );
        }
        Ok(())
    }

    fn copy_slice_to(
        &self,
        index: u8,
        width: u32,
        height: u32,
        target: &DeviceSurface,
    ) -> Result<(), DecoderError> {
        self.check_region(width, height)?;
        let texture = target
            .handle
            .downcast_ref::<EmulatedTexture>()
            .ok_or_else(|| DecoderError::device("CopySubresourceRegion", "foreign texture"))?;
        if texture.format != self.video_format {
            return Err(DecoderError::ConversionError(format!(
                "texture format {} does not match {}",
                texture.format.name(),
                self.video_format.name()
            )));
        }

        let format = self.video_format;
        let src = self.slice(index)?.lock();
        let mut dst = texture.data.lock();
        let dst_height = target.height;

        for plane in 0..format.n_planes() {
            let src_pitch = format.plane_row_bytes(plane, self.width);
            let dst_pitch = format.plane_row_bytes(plane, texture.width);
            let src_base = plane_offset(format, self.width, self.height, plane);
            let dst_base = plane_offset(format, texture.width, dst_height, plane);
            copy_plane(
                &src[src_base..],
                src_pitch,
                &mut dst[dst_base..],
                dst_pitch,
                format.plane_row_bytes(plane, width),
                format.plane_rows(plane, height),
            );
        }
        Ok(())
    }
}

impl Drop for EmulatedSurfaces {
    fn drop(&mut self) {
        self.state.lock().live_surfaces -= 1;
    }
}

struct EmulatedDecoder {
    state: Arc<Mutex<DeviceState>>,
    surfaces: Arc<dyn SurfaceArray>,
    scratch: HashMap<DecoderBufferType, Vec<u8>>,
    mapped: BTreeSet<DecoderBufferType>,
    target: Option<u8>,
    submitted: bool,
}

impl HwDecoder for EmulatedDecoder {
    fn begin_frame(&mut self, view: u8, content_key: Option<&[u8]>) -> Result<(), DecoderError> {
        let mut state = self.state.lock();
        if state.lost {
            return Err(DecoderError::device_lost("DecoderBeginFrame", "device removed"));
        }
        if view as usize >= self.surfaces.len() {
            return Err(DecoderError::device("DecoderBeginFrame", "E_INVALIDARG"));
        }
        state.last_content_key = content_key.map(<[u8]>::to_vec);
        self.target = Some(view);
        self.submitted = false;
        Ok(())
    }

    fn get_buffer(&mut self, buffer_type: DecoderBufferType) -> Result<&mut [u8], DecoderError> {
        if self.state.lock().lost {
            return Err(DecoderError::device_lost("GetDecoderBuffer", "device removed"));
        }
        if !self.mapped.insert(buffer_type) {
            return Err(DecoderError::device("GetDecoderBuffer", "E_FAIL"));
        }
        self.state.lock().outstanding_buffers += 1;
        let buffer = self
            .scratch
            .entry(buffer_type)
            .or_insert_with(|| vec![0u8; scratch_size(buffer_type)]);
        Ok(buffer.as_mut_slice())
    }

    fn release_buffer(&mut self, buffer_type: DecoderBufferType) -> Result<(), DecoderError> {
        if !self.mapped.remove(&buffer_type) {
            return Err(DecoderError::device("ReleaseDecoderBuffer", "E_FAIL"));
        }
        self.state.lock().outstanding_buffers -= 1;
        Ok(())
    }

    fn submit(&mut self, buffers: &[DecoderBufferDesc]) -> Result<(), DecoderError> {
        let mut state = self.state.lock();
        if state.lost {
            return Err(DecoderError::device_lost("SubmitDecoderBuffers", "device removed"));
        }
        if std::mem::take(&mut state.fail_next_submit) {
            return Err(DecoderError::device("SubmitDecoderBuffers", "E_INVALIDARG"));
        }
        for desc in buffers {
            let end = desc.data_offset as usize + desc.data_size as usize;
            if end > scratch_size(desc.buffer_type) {
                return Err(DecoderError::device(
                    "SubmitDecoderBuffers",
                    format!("{:?} descriptor overruns its buffer", desc.buffer_type),
                ));
            }
        }
        state.last_submission = buffers.to_vec();
        self.submitted = true;
        Ok(())
    }

    fn end_frame(&mut self) -> Result<(), DecoderError> {
        let target = self.target.take();
        let mut state = self.state.lock();
        state.outstanding_buffers -= self.mapped.len();
        self.mapped.clear();

        if state.lost {
            return Err(DecoderError::device_lost("DecoderEndFrame", "device removed"));
        }
        let target =
            target.ok_or_else(|| DecoderError::device("DecoderEndFrame", "no frame in progress"))?;

        if std::mem::take(&mut self.submitted) {
            let surfaces = self
                .surfaces
                .as_any()
                .downcast_ref::<EmulatedSurfaces>()
                .ok_or_else(|| DecoderError::device("DecoderEndFrame", "foreign surfaces"))?;
            surfaces.fill_pattern(target, state.frames_decoded)?;
            state.frames_decoded += 1;
        }
        Ok(())
    }
}

impl Drop for EmulatedDecoder {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        state.live_decoders -= 1;
        state.outstanding_buffers -= self.mapped.len();
    }
}
