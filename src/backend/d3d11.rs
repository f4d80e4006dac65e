// Direct3D11 video decode device
// ID3D11VideoDevice / ID3D11VideoContext backed implementation of the
// decode device traits. Requires Windows 8+.

use std::collections::HashMap;
use std::ffi::c_void;
use std::sync::Arc;

use parking_lot::Mutex;

use windows::{
    Win32::Foundation::HMODULE,
    Win32::Graphics::Direct3D::*,
    Win32::Graphics::Direct3D11::*,
    Win32::Graphics::Dxgi::Common::*,
    Win32::Graphics::Dxgi::*,
    core::{GUID, Interface},
};

use super::{
    AdapterInfo, DecodeDevice, DecoderBufferDesc, DecoderBufferType, DecoderDesc, DeviceId,
    DeviceSurface, DxgiFormat, HwDecoder, HwDecoderConfig, SurfaceArray,
};
use crate::codec::DecoderProfile;
use crate::error::DecoderError;
use crate::video::{PlaneMut, VideoFormat, copy_plane};

fn map_err(op: &'static str, e: windows::core::Error) -> DecoderError {
    let code = e.code();
    if code == DXGI_ERROR_DEVICE_REMOVED
        || code == DXGI_ERROR_DEVICE_RESET
        || code == DXGI_ERROR_DEVICE_HUNG
    {
        DecoderError::device_lost(op, e.to_string())
    } else {
        DecoderError::device(op, e.to_string())
    }
}

fn to_guid(profile: DecoderProfile) -> GUID {
    GUID::from_u128(profile.uuid().as_u128())
}

fn from_guid(guid: &GUID) -> DecoderProfile {
    DecoderProfile::from_uuid(uuid::Uuid::from_u128(guid.to_u128()))
}

fn decoder_desc(desc: &DecoderDesc) -> D3D11_VIDEO_DECODER_DESC {
    D3D11_VIDEO_DECODER_DESC {
        Guid: to_guid(desc.profile),
        SampleWidth: desc.width,
        SampleHeight: desc.height,
        OutputFormat: DXGI_FORMAT(desc.format.0 as i32),
    }
}

struct DeviceContext {
    context: ID3D11DeviceContext,
    video_context: ID3D11VideoContext,
}

// Every use of the immediate context goes through the Mutex
unsafe impl Send for DeviceContext {}
unsafe impl Sync for DeviceContext {}

/// Texture handed to [`DeviceSurface::handle`] for D3D11 devices
pub struct D3d11Texture {
    pub texture: ID3D11Texture2D,
    pub subresource: u32,
}

unsafe impl Send for D3d11Texture {}
unsafe impl Sync for D3d11Texture {}

/// Video decode device on one DXGI adapter
pub struct D3d11Device {
    id: DeviceId,
    info: AdapterInfo,
    device: ID3D11Device,
    video_device: ID3D11VideoDevice,
    context: Arc<Mutex<DeviceContext>>,
}

unsafe impl Send for D3d11Device {}
unsafe impl Sync for D3d11Device {}

impl D3d11Device {
    /// Create a video capable device on adapter `adapter_index`
    pub fn new(adapter_index: u32) -> Result<Self, DecoderError> {
        unsafe {
            let factory: IDXGIFactory1 =
                CreateDXGIFactory1().map_err(|e| map_err("CreateDXGIFactory1", e))?;
            let adapter: IDXGIAdapter1 = factory
                .EnumAdapters1(adapter_index)
                .map_err(|e| map_err("EnumAdapters1", e))?;
            let desc = adapter.GetDesc1().map_err(|e| map_err("GetDesc1", e))?;

            let mut device: Option<ID3D11Device> = None;
            let mut context: Option<ID3D11DeviceContext> = None;
            D3D11CreateDevice(
                &adapter,
                D3D_DRIVER_TYPE_UNKNOWN,
                HMODULE(std::ptr::null_mut()),
                D3D11_CREATE_DEVICE_BGRA_SUPPORT | D3D11_CREATE_DEVICE_VIDEO_SUPPORT,
                Some(&[D3D_FEATURE_LEVEL_11_1, D3D_FEATURE_LEVEL_11_0, D3D_FEATURE_LEVEL_10_1]),
                D3D11_SDK_VERSION,
                Some(&mut device),
                None,
                Some(&mut context),
            )
            .map_err(|e| map_err("D3D11CreateDevice", e))?;

            let device =
                device.ok_or_else(|| DecoderError::device("D3D11CreateDevice", "null device"))?;
            let context =
                context.ok_or_else(|| DecoderError::device("D3D11CreateDevice", "null context"))?;

            let video_device: ID3D11VideoDevice = device
                .cast()
                .map_err(|e| map_err("QueryInterface(ID3D11VideoDevice)", e))?;
            let video_context: ID3D11VideoContext = context
                .cast()
                .map_err(|e| map_err("QueryInterface(ID3D11VideoContext)", e))?;

            let name_len = desc
                .Description
                .iter()
                .position(|&c| c == 0)
                .unwrap_or(desc.Description.len());
            let luid = desc.AdapterLuid;
            let info = AdapterInfo {
                adapter: adapter_index,
                vendor_id: desc.VendorId,
                device_id: desc.DeviceId,
                description: String::from_utf16_lossy(&desc.Description[..name_len]),
                hardware: (desc.Flags & DXGI_ADAPTER_FLAG_SOFTWARE.0 as u32) == 0,
            };

            log::info!(
                target: crate::DEFAULT_LOG_TARGET,
                "D3D11 video device on adapter {}: {} ({:04x}:{:04x})",
                adapter_index,
                info.description,
                info.vendor_id,
                info.device_id
            );

            Ok(Self {
                id: DeviceId(((luid.HighPart as u32 as u64) << 32) | luid.LowPart as u64),
                info,
                device,
                video_device,
                context: Arc::new(Mutex::new(DeviceContext {
                    context,
                    video_context,
                })),
            })
        }
    }

    pub fn device(&self) -> &ID3D11Device {
        &self.device
    }

    /// Wrap a texture owned by a downstream consumer as a copy target
    pub fn wrap_texture(
        &self,
        texture: ID3D11Texture2D,
        subresource: u32,
        format: VideoFormat,
    ) -> DeviceSurface {
        let mut desc = D3D11_TEXTURE2D_DESC::default();
        unsafe { texture.GetDesc(&mut desc) };
        DeviceSurface {
            device: self.id,
            format,
            width: desc.Width,
            height: desc.Height,
            handle: Arc::new(D3d11Texture {
                texture,
                subresource,
            }),
        }
    }
}

impl DecodeDevice for D3d11Device {
    fn device_id(&self) -> DeviceId {
        self.id
    }

    fn adapter_info(&self) -> AdapterInfo {
        self.info.clone()
    }

    fn decoder_profiles(&self) -> Result<Vec<DecoderProfile>, DecoderError> {
        unsafe {
            let count = self.video_device.GetVideoDecoderProfileCount();
            let mut profiles = Vec::with_capacity(count as usize);
            for i in 0..count {
                let guid = self
                    .video_device
                    .GetVideoDecoderProfile(i)
                    .map_err(|e| map_err("GetVideoDecoderProfile", e))?;
                profiles.push(from_guid(&guid));
            }
            Ok(profiles)
        }
    }

    fn check_format(&self, profile: DecoderProfile, format: DxgiFormat) -> Result<bool, DecoderError> {
        let guid = to_guid(profile);
        unsafe {
            self.video_device
                .CheckVideoDecoderFormat(&guid, DXGI_FORMAT(format.0 as i32))
                .map(|supported| supported.as_bool())
                .map_err(|e| map_err("CheckVideoDecoderFormat", e))
        }
    }

    fn decoder_configs(&self, desc: &DecoderDesc) -> Result<Vec<HwDecoderConfig>, DecoderError> {
        let d3d_desc = decoder_desc(desc);
        unsafe {
            // Out of range sizes make the driver fail the count query
            let Ok(count) = self.video_device.GetVideoDecoderConfigCount(&d3d_desc) else {
                return Ok(Vec::new());
            };

            let mut configs = Vec::with_capacity(count as usize);
            for index in 0..count {
                let mut config = D3D11_VIDEO_DECODER_CONFIG::default();
                self.video_device
                    .GetVideoDecoderConfig(&d3d_desc, index, &mut config)
                    .map_err(|e| map_err("GetVideoDecoderConfig", e))?;
                configs.push(HwDecoderConfig {
                    index,
                    bitstream_raw: config.ConfigBitstreamRaw,
                });
            }
            Ok(configs)
        }
    }

    fn create_surfaces(
        &self,
        desc: &DecoderDesc,
        surface_count: usize,
    ) -> Result<Arc<dyn SurfaceArray>, DecoderError> {
        let video_format = VideoFormat::from_dxgi(desc.format).ok_or_else(|| {
            DecoderError::device("CreateTexture2D", format!("unsupported format {:?}", desc.format))
        })?;

        let texture_desc = D3D11_TEXTURE2D_DESC {
            Width: desc.width,
            Height: desc.height,
            MipLevels: 1,
            ArraySize: surface_count as u32,
            Format: DXGI_FORMAT(desc.format.0 as i32),
            SampleDesc: DXGI_SAMPLE_DESC {
                Count: 1,
                Quality: 0,
            },
            Usage: D3D11_USAGE_DEFAULT,
            BindFlags: D3D11_BIND_DECODER.0 as u32,
            CPUAccessFlags: 0,
            MiscFlags: 0,
        };
        let mut texture: Option<ID3D11Texture2D> = None;
        unsafe {
            self.device
                .CreateTexture2D(&texture_desc, None, Some(&mut texture))
                .map_err(|e| map_err("CreateTexture2D", e))?;
        }
        let texture =
            texture.ok_or_else(|| DecoderError::device("CreateTexture2D", "null texture"))?;

        Ok(Arc::new(D3d11Surfaces {
            device_id: self.id,
            device: self.device.clone(),
            context: self.context.clone(),
            texture,
            count: surface_count,
            format: desc.format,
            video_format,
            width: desc.width,
            height: desc.height,
            staging: Mutex::new(None),
        }))
    }

    fn create_decoder(
        &self,
        desc: &DecoderDesc,
        config: &HwDecoderConfig,
        surfaces: &Arc<dyn SurfaceArray>,
    ) -> Result<Box<dyn HwDecoder>, DecoderError> {
        let Some(array) = surfaces.as_any().downcast_ref::<D3d11Surfaces>() else {
            return Err(DecoderError::device("CreateVideoDecoderOutputView", "foreign surfaces"));
        };
        if array.device_id != self.id || array.format != desc.format {
            return Err(DecoderError::device(
                "CreateVideoDecoderOutputView",
                "surfaces do not match the decoder description",
            ));
        }
        let d3d_desc = decoder_desc(desc);

        unsafe {
            let mut d3d_config = D3D11_VIDEO_DECODER_CONFIG::default();
            self.video_device
                .GetVideoDecoderConfig(&d3d_desc, config.index, &mut d3d_config)
                .map_err(|e| map_err("GetVideoDecoderConfig", e))?;

            let mut views = Vec::with_capacity(array.count);
            for slice in 0..array.count as u32 {
                let view_desc = D3D11_VIDEO_DECODER_OUTPUT_VIEW_DESC {
                    DecodeProfile: d3d_desc.Guid,
                    ViewDimension: D3D11_VDOV_DIMENSION_TEXTURE2D,
                    Anonymous: D3D11_VIDEO_DECODER_OUTPUT_VIEW_DESC_0 {
                        Texture2D: D3D11_TEX2D_VDOV { ArraySlice: slice },
                    },
                };
                let mut view: Option<ID3D11VideoDecoderOutputView> = None;
                self.video_device
                    .CreateVideoDecoderOutputView(&array.texture, &view_desc, Some(&mut view))
                    .map_err(|e| map_err("CreateVideoDecoderOutputView", e))?;
                views.push(view.ok_or_else(|| {
                    DecoderError::device("CreateVideoDecoderOutputView", "null view")
                })?);
            }

            let decoder = self
                .video_device
                .CreateVideoDecoder(&d3d_desc, &d3d_config)
                .map_err(|e| map_err("CreateVideoDecoder", e))?;

            log::debug!(
                target: crate::DEFAULT_LOG_TARGET,
                "Created D3D11 decoder {} {}x{}, ConfigBitstreamRaw {}, {} surfaces",
                desc.profile,
                desc.width,
                desc.height,
                d3d_config.ConfigBitstreamRaw,
                array.count
            );

            Ok(Box::new(D3d11Decoder {
                decoder,
                views,
                context: self.context.clone(),
                mapped: HashMap::new(),
            }))
        }
    }
}

struct D3d11Decoder {
    decoder: ID3D11VideoDecoder,
    views: Vec<ID3D11VideoDecoderOutputView>,
    context: Arc<Mutex<DeviceContext>>,
    mapped: HashMap<DecoderBufferType, (*mut u8, usize)>,
}

unsafe impl Send for D3d11Decoder {}

impl HwDecoder for D3d11Decoder {
    fn begin_frame(&mut self, view: u8, content_key: Option<&[u8]>) -> Result<(), DecoderError> {
        let output = self
            .views
            .get(view as usize)
            .ok_or_else(|| DecoderError::device("DecoderBeginFrame", format!("no view {}", view)))?;
        let (key_size, key) = match content_key {
            Some(key) => (key.len() as u32, Some(key.as_ptr() as *const c_void)),
            None => (0, None),
        };

        let ctx = self.context.lock();
        unsafe {
            ctx.video_context
                .DecoderBeginFrame(&self.decoder, output, key_size, key)
                .map_err(|e| map_err("DecoderBeginFrame", e))
        }
    }

    fn get_buffer(&mut self, buffer_type: DecoderBufferType) -> Result<&mut [u8], DecoderError> {
        let mut size = 0u32;
        let mut data: *mut c_void = std::ptr::null_mut();
        {
            let ctx = self.context.lock();
            unsafe {
                ctx.video_context
                    .GetDecoderBuffer(
                        &self.decoder,
                        D3D11_VIDEO_DECODER_BUFFER_TYPE(buffer_type.as_raw() as i32),
                        &mut size,
                        &mut data,
                    )
                    .map_err(|e| map_err("GetDecoderBuffer", e))?;
            }
        }
        if data.is_null() {
            return Err(DecoderError::device("GetDecoderBuffer", "null buffer"));
        }

        self.mapped.insert(buffer_type, (data as *mut u8, size as usize));
        // Valid until ReleaseDecoderBuffer, which needs &mut self
        Ok(unsafe { std::slice::from_raw_parts_mut(data as *mut u8, size as usize) })
    }

    fn release_buffer(&mut self, buffer_type: DecoderBufferType) -> Result<(), DecoderError> {
        self.mapped.remove(&buffer_type);
        let ctx = self.context.lock();
        unsafe {
            ctx.video_context
                .ReleaseDecoderBuffer(
                    &self.decoder,
                    D3D11_VIDEO_DECODER_BUFFER_TYPE(buffer_type.as_raw() as i32),
                )
                .map_err(|e| map_err("ReleaseDecoderBuffer", e))
        }
    }

    fn submit(&mut self, buffers: &[DecoderBufferDesc]) -> Result<(), DecoderError> {
        let descs: Vec<D3D11_VIDEO_DECODER_BUFFER_DESC> = buffers
            .iter()
            .map(|b| D3D11_VIDEO_DECODER_BUFFER_DESC {
                BufferType: D3D11_VIDEO_DECODER_BUFFER_TYPE(b.buffer_type.as_raw() as i32),
                BufferIndex: b.buffer_index,
                DataOffset: b.data_offset,
                DataSize: b.data_size,
                FirstMBaddress: b.first_mb_address,
                NumMBsInBuffer: b.num_mbs_in_buffer,
                ..Default::default()
            })
            .collect();

        let ctx = self.context.lock();
        unsafe {
            ctx.video_context
                .SubmitDecoderBuffers(&self.decoder, &descs)
                .map_err(|e| map_err("SubmitDecoderBuffers", e))
        }
    }

    fn end_frame(&mut self) -> Result<(), DecoderError> {
        self.mapped.clear();
        let ctx = self.context.lock();
        unsafe {
            ctx.video_context
                .DecoderEndFrame(&self.decoder)
                .map_err(|e| map_err("DecoderEndFrame", e))
        }
    }
}

/// Copy extent for a `width` x `height` region. YUV 4:2:0 copies cover
/// whole chroma samples, but never reach past `limit`.
fn copy_extent(width: u32, height: u32, limit: (u32, u32)) -> (u32, u32) {
    (
        width.next_multiple_of(2).min(limit.0),
        height.next_multiple_of(2).min(limit.1),
    )
}

struct D3d11Surfaces {
    device_id: DeviceId,
    device: ID3D11Device,
    context: Arc<Mutex<DeviceContext>>,
    texture: ID3D11Texture2D,
    count: usize,
    format: DxgiFormat,
    video_format: VideoFormat,
    width: u32,
    height: u32,
    staging: Mutex<Option<ID3D11Texture2D>>,
}

unsafe impl Send for D3d11Surfaces {}
unsafe impl Sync for D3d11Surfaces {}

impl D3d11Surfaces {
    fn check_region(&self, index: u8, width: u32, height: u32) -> Result<(), DecoderError> {
        if index as usize >= self.count {
            return Err(DecoderError::device("CopySubresourceRegion", format!("no slice {}", index)));
        }
        if width > self.width || height > self.height {
            return Err(DecoderError::ConversionError(format!(
                "region {}x{} exceeds surface {}x{}",
                width, height, self.width, self.height
            )));
        }
        Ok(())
    }

    fn copy_box(&self, width: u32, height: u32, limit: (u32, u32)) -> D3D11_BOX {
        let limit = (self.width.min(limit.0), self.height.min(limit.1));
        let (right, bottom) = copy_extent(width, height, limit);
        D3D11_BOX {
            left: 0,
            top: 0,
            front: 0,
            right,
            bottom,
            back: 1,
        }
    }

    fn staging_texture(&self) -> Result<ID3D11Texture2D, DecoderError> {
        let mut staging = self.staging.lock();
        if let Some(texture) = staging.as_ref() {
            return Ok(texture.clone());
        }

        let desc = D3D11_TEXTURE2D_DESC {
            Width: self.width,
            Height: self.height,
            MipLevels: 1,
            ArraySize: 1,
            Format: DXGI_FORMAT(self.format.0 as i32),
            SampleDesc: DXGI_SAMPLE_DESC {
                Count: 1,
                Quality: 0,
            },
            Usage: D3D11_USAGE_STAGING,
            BindFlags: 0,
            CPUAccessFlags: D3D11_CPU_ACCESS_READ.0 as u32,
            MiscFlags: 0,
        };
        let mut texture: Option<ID3D11Texture2D> = None;
        unsafe {
            self.device
                .CreateTexture2D(&desc, None, Some(&mut texture))
                .map_err(|e| map_err("CreateTexture2D", e))?;
        }
        let texture =
            texture.ok_or_else(|| DecoderError::device("CreateTexture2D", "null staging texture"))?;
        *staging = Some(texture.clone());
        Ok(texture)
    }
}

impl SurfaceArray for D3d11Surfaces {
    fn len(&self) -> usize {
        self.count
    }

    fn device_id(&self) -> DeviceId {
        self.device_id
    }

    fn format(&self) -> DxgiFormat {
        self.format
    }

    fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn read_slice(
        &self,
        index: u8,
        width: u32,
        height: u32,
        planes: &mut [PlaneMut<'_>],
    ) -> Result<(), DecoderError> {
        self.check_region(index, width, height)?;
        let format = self.video_format;
        if planes.len() < format.n_planes() {
            return Err(DecoderError::ConversionError(format!(
                "{} planes given, {} needs {}",
                planes.len(),
                format.name(),
                format.n_planes()
            )));
        }

        let staging = self.staging_texture()?;
        let copy_box = self.copy_box(width, height, (self.width, self.height));
        let ctx = self.context.lock();

        unsafe {
            ctx.context.CopySubresourceRegion(
                &staging,
                0,
                0,
                0,
                0,
                &self.texture,
                index as u32,
                Some(&copy_box),
            );

            let mut mapped = D3D11_MAPPED_SUBRESOURCE::default();
            ctx.context
                .Map(&staging, 0, D3D11_MAP_READ, 0, Some(&mut mapped))
                .map_err(|e| map_err("Map", e))?;

            let pitch = mapped.RowPitch as usize;
            // Chroma plane follows the luma rows of the whole texture
            let total_rows = format.plane_rows(0, self.height) + format.plane_rows(1, self.height);
            let src = std::slice::from_raw_parts(mapped.pData as *const u8, pitch * total_rows);

            let mut base = 0;
            for (plane, dst) in planes.iter_mut().take(format.n_planes()).enumerate() {
                copy_plane(
                    &src[base..],
                    pitch,
                    dst.data,
                    dst.stride,
                    format.plane_row_bytes(plane, width),
                    format.plane_rows(plane, height),
                );
                base += pitch * format.plane_rows(plane, self.height);
            }

            ctx.context.Unmap(&staging, 0);
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
        self.check_region(index, width, height)?;
        if target.device != self.device_id {
            return Err(DecoderError::ConversionError(
                "target texture belongs to another device".to_string(),
            ));
        }
        let texture = target
            .handle
            .downcast_ref::<D3d11Texture>()
            .ok_or_else(|| DecoderError::device("CopySubresourceRegion", "foreign texture"))?;

        let copy_box = self.copy_box(width, height, (target.width, target.height));
        let ctx = self.context.lock();
        unsafe {
            ctx.context.CopySubresourceRegion(
                &texture.texture,
                texture.subresource,
                0,
                0,
                0,
                &self.texture,
                index as u32,
                Some(&copy_box),
            );
        }
        Ok(())
    }
}
