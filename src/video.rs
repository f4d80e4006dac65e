// Raw video description
// Pixel formats, plane layout and system-memory frames used as copy targets

use serde::{Deserialize, Serialize};

use crate::backend::DxgiFormat;

/// Raw pixel formats known to the decoder.
///
/// Only [`VideoFormat::Nv12`] and [`VideoFormat::P01010le`] can be decoded
/// into; the others exist so incompatible output requests can be rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VideoFormat {
    Nv12,
    P01010le,
    I420,
    Bgra,
}

impl VideoFormat {
    /// Matching DXGI surface format, if the hardware can decode into it
    pub fn dxgi_format(self) -> Option<DxgiFormat> {
        match self {
            VideoFormat::Nv12 => Some(DxgiFormat::NV12),
            VideoFormat::P01010le => Some(DxgiFormat::P010),
            VideoFormat::I420 | VideoFormat::Bgra => None,
        }
    }

    pub fn from_dxgi(format: DxgiFormat) -> Option<Self> {
        match format {
            DxgiFormat::NV12 => Some(VideoFormat::Nv12),
            DxgiFormat::P010 => Some(VideoFormat::P01010le),
            _ => None,
        }
    }

    /// Caps string name
    pub fn name(self) -> &'static str {
        match self {
            VideoFormat::Nv12 => "NV12",
            VideoFormat::P01010le => "P010_10LE",
            VideoFormat::I420 => "I420",
            VideoFormat::Bgra => "BGRA",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "NV12" => Some(VideoFormat::Nv12),
            "P010_10LE" => Some(VideoFormat::P01010le),
            "I420" => Some(VideoFormat::I420),
            "BGRA" => Some(VideoFormat::Bgra),
            _ => None,
        }
    }

    pub fn bit_depth(self) -> u32 {
        match self {
            VideoFormat::P01010le => 10,
            _ => 8,
        }
    }

    pub fn n_planes(self) -> usize {
        match self {
            VideoFormat::Nv12 | VideoFormat::P01010le => 2,
            VideoFormat::I420 => 3,
            VideoFormat::Bgra => 1,
        }
    }

    /// Bytes occupied by `width` pixels of `plane`
    pub fn plane_row_bytes(self, plane: usize, width: u32) -> usize {
        let w = width as usize;
        let half = w.div_ceil(2);
        match (self, plane) {
            (VideoFormat::Nv12, 0) => w,
            // Interleaved UV: one byte pair per two luma columns
            (VideoFormat::Nv12, _) => half * 2,
            (VideoFormat::P01010le, 0) => w * 2,
            (VideoFormat::P01010le, _) => half * 4,
            (VideoFormat::I420, 0) => w,
            (VideoFormat::I420, _) => half,
            (VideoFormat::Bgra, _) => w * 4,
        }
    }

    /// Rows occupied by `height` pixels of `plane`
    pub fn plane_rows(self, plane: usize, height: u32) -> usize {
        let h = height as usize;
        match (self, plane) {
            (VideoFormat::Bgra, _) | (_, 0) => h,
            _ => h.div_ceil(2),
        }
    }
}

/// Layout of a raw frame in system memory.
///
/// Strides are rounded up to 4 bytes and planes are packed back to back,
/// the same default layout GStreamer computes for `video/x-raw`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoInfo {
    pub format: VideoFormat,
    pub width: u32,
    pub height: u32,
    pub interlaced: bool,
    strides: [usize; 3],
    offsets: [usize; 3],
    size: usize,
}

impl VideoInfo {
    pub fn new(format: VideoFormat, width: u32, height: u32) -> Self {
        let mut strides = [0usize; 3];
        let mut offsets = [0usize; 3];
        let mut offset = 0;

        for plane in 0..format.n_planes() {
            let stride = format.plane_row_bytes(plane, width).next_multiple_of(4);
            strides[plane] = stride;
            offsets[plane] = offset;
            offset += stride * format.plane_rows(plane, height);
        }

        Self {
            format,
            width,
            height,
            interlaced: false,
            strides,
            offsets,
            size: offset,
        }
    }

    pub fn with_interlaced(mut self, interlaced: bool) -> Self {
        self.interlaced = interlaced;
        self
    }

    pub fn n_planes(&self) -> usize {
        self.format.n_planes()
    }

    pub fn stride(&self, plane: usize) -> usize {
        self.strides[plane]
    }

    pub fn offset(&self, plane: usize) -> usize {
        self.offsets[plane]
    }

    /// Total frame size in bytes
    pub fn size(&self) -> usize {
        self.size
    }

    /// Same format and geometry, ignoring interlacing
    pub fn is_compatible(&self, other: &VideoInfo) -> bool {
        self.format == other.format && self.width == other.width && self.height == other.height
    }
}

/// Destination for one plane of a surface readback
#[derive(Debug)]
pub struct PlaneMut<'a> {
    pub data: &'a mut [u8],
    pub stride: usize,
}

/// A raw frame in system memory, the fallback output for non-GPU consumers
#[derive(Debug, Clone)]
pub struct VideoFrame {
    info: VideoInfo,
    data: Vec<u8>,
}

impl VideoFrame {
    /// Allocate a zeroed frame
    pub fn new(info: VideoInfo) -> Self {
        let data = vec![0u8; info.size()];
        Self { info, data }
    }

    pub fn info(&self) -> &VideoInfo {
        &self.info
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn plane(&self, plane: usize) -> &[u8] {
        let start = self.info.offset(plane);
        let len = self.info.stride(plane) * self.info.format.plane_rows(plane, self.info.height);
        &self.data[start..start + len]
    }

    /// Split the backing store into per-plane mutable views
    pub fn planes_mut(&mut self) -> Vec<PlaneMut<'_>> {
        let info = &self.info;
        let mut rest: &mut [u8] = &mut self.data;
        let mut planes = Vec::with_capacity(info.n_planes());

        for plane in 0..info.n_planes() {
            let len = info.stride(plane) * info.format.plane_rows(plane, info.height);
            let (head, tail) = std::mem::take(&mut rest).split_at_mut(len);
            planes.push(PlaneMut {
                data: head,
                stride: info.stride(plane),
            });
            rest = tail;
        }

        planes
    }
}

/// Copy `rows` rows of `row_bytes` between two strided buffers
pub fn copy_plane(
    src: &[u8],
    src_stride: usize,
    dst: &mut [u8],
    dst_stride: usize,
    row_bytes: usize,
    rows: usize,
) {
    for row in 0..rows {
        let s = row * src_stride;
        let d = row * dst_stride;
        dst[d..d + row_bytes].copy_from_slice(&src[s..s + row_bytes]);
    }
}
