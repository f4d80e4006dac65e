// Decoded picture output: crop-aware copies and the zero-copy decision

use super::Decoder;
use crate::backend::DeviceSurface;
use crate::error::DecoderError;
use crate::negotiate::MemoryFeature;
use crate::pool::OutputViewBuffer;
use crate::video::{VideoFormat, VideoFrame, VideoInfo};

/// Destination of [`Decoder::process_output`]
pub enum OutputBuffer<'a> {
    /// CPU copy into a system-memory frame
    System(&'a mut VideoFrame),
    /// GPU copy into a texture on the decoder's device
    Device(&'a DeviceSurface),
}

/// Per-picture properties that affect direct rendering
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PictureInfo {
    pub display_width: u32,
    pub display_height: u32,
    pub reverse_playback: bool,
}

impl PictureInfo {
    pub fn new(display_width: u32, display_height: u32) -> Self {
        Self {
            display_width,
            display_height,
            reverse_playback: false,
        }
    }
}

fn check_target_size(
    what: &str,
    width: u32,
    height: u32,
    display_width: u32,
    display_height: u32,
) -> Result<(), DecoderError> {
    if width < display_width || height < display_height {
        return Err(DecoderError::ConversionError(format!(
            "{} {}x{} cannot hold {}x{}",
            what, width, height, display_width, display_height
        )));
    }
    Ok(())
}

impl Decoder {
    /// Copy the top-left `display_width` x `display_height` area of the
    /// picture in `decoded` into `output`.
    ///
    /// Works on the surfaces `decoded` was allocated from, so pictures
    /// decoded before a reconfiguration can still be output.
    pub fn process_output(
        &self,
        info: &VideoInfo,
        display_width: u32,
        display_height: u32,
        decoded: &OutputViewBuffer,
        output: OutputBuffer<'_>,
    ) -> Result<(), DecoderError> {
        let surfaces = decoded.surfaces();
        let format = VideoFormat::from_dxgi(surfaces.format()).ok_or_else(|| {
            DecoderError::ConversionError(format!("unknown surface format {:?}", surfaces.format()))
        })?;
        if info.format != format {
            return Err(DecoderError::ConversionError(format!(
                "decoded {} cannot be output as {}",
                format.name(),
                info.format.name()
            )));
        }
        if display_width == 0 || display_height == 0 {
            return Err(DecoderError::ConversionError(format!(
                "invalid display size {}x{}",
                display_width, display_height
            )));
        }
        let (coded_width, coded_height) = surfaces.dimensions();
        check_target_size("decoded surface", coded_width, coded_height, display_width, display_height)?;

        if let Some(frame) = self.session.as_ref().and_then(|s| s.frame.as_ref()) {
            if frame.view == decoded.view() {
                return Err(DecoderError::InvalidState(format!(
                    "view {} is still being decoded",
                    decoded.index()
                )));
            }
        }

        match output {
            OutputBuffer::System(frame) => {
                let out = frame.info();
                if out.format != format {
                    return Err(DecoderError::ConversionError(format!(
                        "output frame is {}, decoded picture is {}",
                        out.format.name(),
                        format.name()
                    )));
                }
                check_target_size("output frame", out.width, out.height, display_width, display_height)?;
                surfaces.read_slice(decoded.index(), display_width, display_height, &mut frame.planes_mut())
            }
            OutputBuffer::Device(texture) => {
                if texture.device != decoded.device_id() {
                    return Err(DecoderError::ConversionError(format!(
                        "texture on {:?} is not on decoding device {:?}",
                        texture.device,
                        decoded.device_id()
                    )));
                }
                if texture.format != format {
                    return Err(DecoderError::ConversionError(format!(
                        "texture is {}, decoded picture is {}",
                        texture.format.name(),
                        format.name()
                    )));
                }
                check_target_size("texture", texture.width, texture.height, display_width, display_height)?;
                surfaces.copy_slice_to(decoded.index(), display_width, display_height, texture)
            }
        }
    }

    /// Whether `buffer` can be pushed downstream as is, without a copy.
    ///
    /// A successful check does not reserve the surface; pair it with
    /// [`OutputViewBuffer::export`] when handing the buffer out.
    pub fn can_direct_render(&self, buffer: &OutputViewBuffer, picture: &PictureInfo) -> bool {
        if !self.settings.allow_direct_render || picture.reverse_playback {
            return false;
        }
        let Some(output) = &self.output_state else {
            return false;
        };
        if output.memory != MemoryFeature::Device {
            return false;
        }
        if buffer.device_id() != self.device.device_id() {
            return false;
        }
        if self.get_output_view_from_buffer(buffer).is_none() {
            return false;
        }
        if output.info.width != picture.display_width || output.info.height != picture.display_height {
            return false;
        }

        // One outstanding zero-copy export per surface
        !buffer.is_exported()
    }
}
