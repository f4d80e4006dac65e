// Hardware decoder state machine
// Owns the decode handle and output view pool of one stream and enforces
// the configure -> (begin_frame -> buffers -> submit -> end_frame) cycle.
//
// Per frame, driven by the bitstream parser:
// 1. get_output_view_buffer() for the picture being decoded
// 2. begin_frame(view, key)
// 3. get_decoder_buffer / fill / release_decoder_buffer, any number of times
// 4. submit_decoder_buffers(descs)
// 5. end_frame()

mod output;

pub use output::{OutputBuffer, PictureInfo};

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::backend::{
    DecodeDevice, DecoderBufferDesc, DecoderBufferType, DecoderDesc, DeviceId, HwDecoder,
    HwDecoderConfig,
};
use crate::caps::{CapabilityProber, Resolution};
use crate::codec::{Codec, DecoderProfile};
use crate::error::DecoderError;
use crate::negotiate::{self, AllocationQuery, DownstreamCaps, InputState, OutputState, PoolConfig};
use crate::pool::{MAX_POOL_SIZE, OutputView, OutputViewBuffer, OutputViewPool, PoolStats};
use crate::video::VideoInfo;

/// Construction-time decoder settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecoderSettings {
    /// `log` target every message of this decoder is emitted under
    pub log_target: String,
    /// Allow handing decode surfaces downstream without a copy
    pub allow_direct_render: bool,
    /// Coded size alignment of the decode surfaces, in pixels
    pub surface_alignment: u32,
}

impl Default for DecoderSettings {
    fn default() -> Self {
        Self {
            log_target: crate::DEFAULT_LOG_TARGET.to_string(),
            allow_direct_render: true,
            surface_alignment: 16,
        }
    }
}

/// Externally visible decoder state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecoderState {
    Unconfigured,
    Configured,
    FrameOpen,
}

/// Parameters of a `configure` call, compared for the idempotent no-op
#[derive(Debug, Clone, PartialEq, Eq)]
struct ConfigParams {
    codec: Codec,
    info: VideoInfo,
    coded_width: u32,
    coded_height: u32,
    dpb_size: usize,
}

/// State of one begin_frame .. end_frame pair
struct FrameSession {
    view: OutputView,
    // Keeps the target surface claimed while the hardware writes to it
    _target: OutputViewBuffer,
    content_key: Option<Vec<u8>>,
    acquired: BTreeSet<DecoderBufferType>,
    submitted: bool,
}

/// Everything that exists while configured
struct Session {
    params: ConfigParams,
    profile: DecoderProfile,
    desc: DecoderDesc,
    config: HwDecoderConfig,
    decoder: Box<dyn HwDecoder>,
    pool: OutputViewPool,
    frame: Option<FrameSession>,
    device_lost: bool,
}

impl Session {
    fn frame_mut(&mut self) -> Result<&mut FrameSession, DecoderError> {
        self.frame
            .as_mut()
            .ok_or_else(|| DecoderError::InvalidState("no frame is open".to_string()))
    }

    fn check_device(&self) -> Result<(), DecoderError> {
        if self.device_lost {
            return Err(DecoderError::device_lost(
                "decoder",
                "device was lost, configure must run again",
            ));
        }
        Ok(())
    }

    /// Destroy the decode handle, keeping the surfaces
    fn retire(self) -> RetiredSession {
        drop(self.decoder);
        RetiredSession {
            params: self.params,
            profile: self.profile,
            desc: self.desc,
            config: self.config,
            pool: self.pool,
            device_lost: self.device_lost,
        }
    }

    fn track(&mut self, result: &Result<(), DecoderError>) {
        if let Err(e) = result {
            if e.requires_reconfigure() {
                self.device_lost = true;
            }
        }
    }
}

/// Session whose decode handle was destroyed for a reconfiguration
struct RetiredSession {
    params: ConfigParams,
    profile: DecoderProfile,
    desc: DecoderDesc,
    config: HwDecoderConfig,
    pool: OutputViewPool,
    device_lost: bool,
}

impl RetiredSession {
    fn resume(self, decoder: Box<dyn HwDecoder>) -> Session {
        Session {
            params: self.params,
            profile: self.profile,
            desc: self.desc,
            config: self.config,
            decoder,
            pool: self.pool,
            frame: None,
            device_lost: false,
        }
    }
}

/// Hardware video decoder for one stream
pub struct Decoder {
    device: Arc<dyn DecodeDevice>,
    settings: DecoderSettings,
    session: Option<Session>,
    output_state: Option<OutputState>,
    allocation: Option<PoolConfig>,
}

impl Decoder {
    pub fn new(device: Arc<dyn DecodeDevice>, settings: DecoderSettings) -> Self {
        log::debug!(
            target: settings.log_target.as_str(),
            "Creating decoder on {:?} ({})",
            device.device_id(),
            device.adapter_info().description
        );
        Self {
            device,
            settings,
            session: None,
            output_state: None,
            allocation: None,
        }
    }

    pub fn settings(&self) -> &DecoderSettings {
        &self.settings
    }

    pub fn device_id(&self) -> DeviceId {
        self.device.device_id()
    }

    pub fn is_configured(&self) -> bool {
        self.session.is_some()
    }

    pub fn state(&self) -> DecoderState {
        match &self.session {
            None => DecoderState::Unconfigured,
            Some(session) if session.frame.is_some() => DecoderState::FrameOpen,
            Some(_) => DecoderState::Configured,
        }
    }

    pub fn codec(&self) -> Codec {
        self.session.as_ref().map_or(Codec::None, |s| s.params.codec)
    }

    pub fn profile(&self) -> Option<DecoderProfile> {
        self.session.as_ref().map(|s| s.profile)
    }

    pub fn dpb_size(&self) -> Option<usize> {
        self.session.as_ref().map(|s| s.params.dpb_size)
    }

    pub fn is_device_lost(&self) -> bool {
        self.session.as_ref().is_some_and(|s| s.device_lost)
    }

    pub fn pool_stats(&self) -> Option<PoolStats> {
        self.session.as_ref().map(|s| s.pool.stats())
    }

    pub fn output_state(&self) -> Option<&OutputState> {
        self.output_state.as_ref()
    }

    pub fn allocation(&self) -> Option<&PoolConfig> {
        self.allocation.as_ref()
    }

    /// Content key bound to the open frame
    pub fn frame_content_key(&self) -> Option<&[u8]> {
        self.session
            .as_ref()
            .and_then(|s| s.frame.as_ref())
            .and_then(|f| f.content_key.as_deref())
    }

    /// Create the hardware decoder and a `dpb_size` surface pool.
    ///
    /// Calling again with the same parameters is a no-op. Every capability
    /// check runs before the current decoder is touched, so a rejected
    /// configuration leaves the previous one in place.
    pub fn configure(
        &mut self,
        codec: Codec,
        info: &VideoInfo,
        coded_width: u32,
        coded_height: u32,
        dpb_size: usize,
    ) -> Result<(), DecoderError> {
        let target = self.settings.log_target.as_str();
        let params = ConfigParams {
            codec,
            info: info.clone(),
            coded_width,
            coded_height,
            dpb_size,
        };

        if let Some(session) = &self.session {
            if session.frame.is_some() {
                return Err(DecoderError::InvalidState(
                    "cannot configure while a frame is open".to_string(),
                ));
            }
            if session.params == params && !session.device_lost {
                log::debug!(target: target, "Configuration unchanged");
                return Ok(());
            }
        }

        if codec == Codec::None {
            return Err(DecoderError::UnsupportedFormat("no codec given".to_string()));
        }
        if dpb_size < codec.min_dpb_size() {
            return Err(DecoderError::UnsupportedFormat(format!(
                "{} needs at least {} reference surfaces, got {}",
                codec,
                codec.min_dpb_size(),
                dpb_size
            )));
        }
        if dpb_size > MAX_POOL_SIZE {
            return Err(DecoderError::UnsupportedFormat(format!(
                "{} reference surfaces exceed the {} addressable views",
                dpb_size, MAX_POOL_SIZE
            )));
        }
        if coded_width == 0 || coded_height == 0 {
            return Err(DecoderError::UnsupportedFormat(format!(
                "invalid coded size {}x{}",
                coded_width, coded_height
            )));
        }
        let dxgi_format = info.format.dxgi_format().ok_or_else(|| {
            DecoderError::UnsupportedFormat(format!("cannot decode to {}", info.format.name()))
        })?;

        let prober = CapabilityProber::new(self.device.as_ref()).with_log_target(target);
        let profile = prober.supported_decoder_profile(codec, info.format)?;
        if !prober.supports_format(profile, dxgi_format) {
            return Err(DecoderError::UnsupportedFormat(format!(
                "{} does not output {}",
                profile,
                info.format.name()
            )));
        }

        let aligned =
            Resolution::new(coded_width, coded_height).aligned(self.settings.surface_alignment);
        let desc = DecoderDesc {
            profile,
            width: aligned.width,
            height: aligned.height,
            format: dxgi_format,
        };
        let config = prober.select_decoder_config(codec, &desc)?;

        // Only the decode handle goes before the new one is created. The
        // previous surfaces stay until the new session is complete.
        let previous = self.session.take().map(Session::retire);

        let built = self
            .device
            .create_surfaces(&desc, dpb_size)
            .and_then(|surfaces| {
                let decoder = self.device.create_decoder(&desc, &config, &surfaces)?;
                Ok((decoder, surfaces))
            });

        match built {
            Ok((decoder, surfaces)) => {
                log::info!(
                    target: target,
                    "Configured {} decoder: {} {}x{} (surface {}), {} surfaces",
                    codec,
                    profile,
                    info.width,
                    info.height,
                    aligned,
                    dpb_size
                );
                self.session = Some(Session {
                    params,
                    profile,
                    desc,
                    config,
                    decoder,
                    pool: OutputViewPool::with_log_target(surfaces, target),
                    frame: None,
                    device_lost: false,
                });
                Ok(())
            }
            Err(e) => {
                log::error!(target: target, "Failed to create {} decoder: {}", codec, e);
                if let Some(previous) = previous {
                    self.restore(previous);
                }
                Err(e)
            }
        }
    }

    /// Recreate the decode handle of a retired session on its own surfaces,
    /// so views handed out before the failed reconfiguration stay valid
    fn restore(&mut self, previous: RetiredSession) {
        let target = self.settings.log_target.as_str();
        if previous.device_lost {
            log::warn!(target: target, "Previous decoder was on a lost device, not restoring");
            return;
        }

        match self
            .device
            .create_decoder(&previous.desc, &previous.config, previous.pool.surfaces())
        {
            Ok(decoder) => {
                log::info!(target: target, "Restored previous {} decoder", previous.params.codec);
                self.session = Some(previous.resume(decoder));
            }
            Err(e) => {
                log::error!(target: target, "Could not restore previous decoder: {}", e);
            }
        }
    }

    /// Drop the hardware decoder and pool. Buffers still held downstream
    /// keep their surfaces alive.
    pub fn reset(&mut self) {
        if self.session.take().is_some() {
            log::debug!(target: self.settings.log_target.as_str(), "Decoder reset");
        }
        self.output_state = None;
        self.allocation = None;
    }

    /// Open a frame decoding into `target`
    pub fn begin_frame(
        &mut self,
        target: &OutputViewBuffer,
        content_key: Option<&[u8]>,
    ) -> Result<(), DecoderError> {
        let log_target = self.settings.log_target.as_str();
        let session = self
            .session
            .as_mut()
            .ok_or_else(|| DecoderError::InvalidState("decoder is not configured".to_string()))?;

        if session.frame.is_some() {
            return Err(DecoderError::InvalidState("a frame is already open".to_string()));
        }
        session.check_device()?;
        if !session.pool.owns(target) {
            return Err(DecoderError::InvalidState(format!(
                "view {} does not belong to this decoder's pool",
                target.index()
            )));
        }

        let result = session.decoder.begin_frame(target.index(), content_key);
        session.track(&result);
        if let Err(e) = result {
            log::error!(target: log_target, "DecoderBeginFrame failed: {}", e);
            return Err(e);
        }

        log::trace!(target: log_target, "Frame opened on view {}", target.index());
        session.frame = Some(FrameSession {
            view: target.view(),
            _target: target.clone(),
            content_key: content_key.map(<[u8]>::to_vec),
            acquired: BTreeSet::new(),
            submitted: false,
        });
        Ok(())
    }

    /// Map the scratch buffer of `buffer_type` for the open frame
    pub fn get_decoder_buffer(
        &mut self,
        buffer_type: DecoderBufferType,
    ) -> Result<&mut [u8], DecoderError> {
        let log_target = self.settings.log_target.as_str();
        let session = self
            .session
            .as_mut()
            .ok_or_else(|| DecoderError::InvalidState("decoder is not configured".to_string()))?;
        session.check_device()?;
        let frame = session
            .frame
            .as_mut()
            .ok_or_else(|| DecoderError::InvalidState("no frame is open".to_string()))?;
        if frame.acquired.contains(&buffer_type) {
            return Err(DecoderError::BufferBusy(buffer_type));
        }

        match session.decoder.get_buffer(buffer_type) {
            Ok(buffer) => {
                frame.acquired.insert(buffer_type);
                Ok(buffer)
            }
            Err(e) => {
                if e.requires_reconfigure() {
                    session.device_lost = true;
                }
                log::error!(target: log_target, "GetDecoderBuffer {:?} failed: {}", buffer_type, e);
                Err(e)
            }
        }
    }

    pub fn release_decoder_buffer(&mut self, buffer_type: DecoderBufferType) -> Result<(), DecoderError> {
        let session = self
            .session
            .as_mut()
            .ok_or_else(|| DecoderError::InvalidState("decoder is not configured".to_string()))?;
        if !session.frame_mut()?.acquired.remove(&buffer_type) {
            return Err(DecoderError::InvalidState(format!(
                "decoder buffer {:?} is not acquired",
                buffer_type
            )));
        }

        let result = session.decoder.release_buffer(buffer_type);
        session.track(&result);
        result
    }

    /// Hand every buffer description of the open frame to the hardware.
    /// Rejections are reported as is; nothing is retried.
    pub fn submit_decoder_buffers(&mut self, buffers: &[DecoderBufferDesc]) -> Result<(), DecoderError> {
        let log_target = self.settings.log_target.as_str();
        let session = self
            .session
            .as_mut()
            .ok_or_else(|| DecoderError::InvalidState("decoder is not configured".to_string()))?;
        let frame = session.frame_mut()?;
        if let Some(busy) = frame.acquired.first() {
            return Err(DecoderError::InvalidState(format!(
                "decoder buffer {:?} is still acquired",
                busy
            )));
        }
        if buffers.is_empty() {
            return Err(DecoderError::InvalidState("no decoder buffers to submit".to_string()));
        }
        session.check_device()?;

        let result = session.decoder.submit(buffers);
        session.track(&result);
        match result {
            Ok(()) => {
                if let Some(frame) = session.frame.as_mut() {
                    frame.submitted = true;
                }
                Ok(())
            }
            Err(e) => {
                log::error!(target: log_target, "SubmitDecoderBuffers failed: {}", e);
                Err(e)
            }
        }
    }

    /// Close the open frame. The frame is closed and leftover buffers are
    /// released even when the hardware reports a failure or the device is
    /// lost.
    pub fn end_frame(&mut self) -> Result<(), DecoderError> {
        let log_target = self.settings.log_target.as_str();
        let session = self
            .session
            .as_mut()
            .ok_or_else(|| DecoderError::InvalidState("decoder is not configured".to_string()))?;
        let frame = session
            .frame
            .take()
            .ok_or_else(|| DecoderError::InvalidState("no frame is open".to_string()))?;

        for buffer_type in &frame.acquired {
            log::warn!(target: log_target, "Releasing leftover decoder buffer {:?}", buffer_type);
            let result = session.decoder.release_buffer(*buffer_type);
            session.track(&result);
        }
        if session.device_lost {
            return session.check_device();
        }
        if !frame.submitted {
            log::debug!(target: log_target, "Frame on view {} ended without submission", frame.view.index());
        }

        let result = session.decoder.end_frame();
        session.track(&result);
        if let Err(e) = &result {
            log::error!(target: log_target, "DecoderEndFrame failed: {}", e);
        }
        result
    }

    /// Claim the lowest free output view.
    ///
    /// [`DecoderError::PoolExhausted`] is backpressure: wait for downstream
    /// to drop a buffer, then retry.
    pub fn get_output_view_buffer(&self) -> Result<OutputViewBuffer, DecoderError> {
        let session = self
            .session
            .as_ref()
            .ok_or_else(|| DecoderError::InvalidState("decoder is not configured".to_string()))?;

        session.pool.acquire().inspect_err(|e| {
            log::debug!(target: self.settings.log_target.as_str(), "{}", e);
        })
    }

    /// View behind `buffer` when it was allocated from the current pool
    pub fn get_output_view_from_buffer(&self, buffer: &OutputViewBuffer) -> Option<OutputView> {
        self.session
            .as_ref()
            .filter(|s| s.pool.owns(buffer))
            .map(|_| buffer.view())
    }

    pub fn get_output_view_index(view: &OutputView) -> u8 {
        view.index()
    }

    /// Negotiate the output format with downstream. The format is checked
    /// against the device so a stream the hardware cannot decode fails here.
    pub fn negotiate(
        &mut self,
        input: &InputState,
        downstream: &DownstreamCaps,
    ) -> Result<&OutputState, DecoderError> {
        let log_target = self.settings.log_target.as_str();
        let format = input.output_format();

        CapabilityProber::new(self.device.as_ref())
            .with_log_target(log_target)
            .supported_decoder_profile(input.codec, format)
            .map_err(|e| DecoderError::NotNegotiated(e.to_string()))?;

        let mut state = negotiate::negotiate(input, downstream)?;
        if !self.settings.allow_direct_render && state.memory == negotiate::MemoryFeature::Device {
            if !downstream.accepts(negotiate::MemoryFeature::System, format) {
                return Err(DecoderError::NotNegotiated(
                    "direct render disabled and downstream requires device memory".to_string(),
                ));
            }
            state.memory = negotiate::MemoryFeature::System;
        }

        log::debug!(target: log_target, "Negotiated {}", state.caps_string());
        self.allocation = None;
        Ok(self.output_state.insert(state))
    }

    /// Answer an allocation query for the negotiated output
    pub fn decide_allocation(&mut self, query: &mut AllocationQuery) -> Result<PoolConfig, DecoderError> {
        let log_target = self.settings.log_target.as_str();
        let proposed = query.pools.first().map(|p| p.kind);
        let config = negotiate::decide_allocation(query, self.device.device_id())?;
        if let Some(kind) = proposed.filter(|kind| *kind != config.kind) {
            log::debug!(target: log_target, "Discarded proposed {:?} pool", kind);
        }
        log::debug!(
            target: log_target,
            "Output pool {:?}, {} bytes, {}..{} buffers",
            config.kind,
            config.size,
            config.min_buffers,
            config.max_buffers
        );
        self.allocation = Some(config.clone());
        Ok(config)
    }
}

impl Drop for Decoder {
    fn drop(&mut self) {
        if let Some(session) = &self.session {
            if session.frame.is_some() {
                log::warn!(target: self.settings.log_target.as_str(), "Decoder dropped with a frame open");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::DeviceSurface;
    use crate::backend::emulated::{EmulatedDevice, pattern_byte};
    use crate::negotiate::{CapsEntry, MemoryFeature};
    use crate::testing::init_logging;
    use crate::video::{VideoFormat, VideoFrame};

    fn setup() -> (Arc<EmulatedDevice>, Decoder) {
        init_logging();
        let device = Arc::new(EmulatedDevice::new());
        let decoder = Decoder::new(device.clone(), DecoderSettings::default());
        (device, decoder)
    }

    fn nv12(width: u32, height: u32) -> VideoInfo {
        VideoInfo::new(VideoFormat::Nv12, width, height)
    }

    fn configure_h264(decoder: &mut Decoder, dpb_size: usize) {
        decoder
            .configure(Codec::H264, &nv12(1920, 1080), 1920, 1080, dpb_size)
            .unwrap();
    }

    fn decode_one(decoder: &mut Decoder) -> OutputViewBuffer {
        let view = decoder.get_output_view_buffer().unwrap();
        decoder.begin_frame(&view, None).unwrap();
        let buffer = decoder.get_decoder_buffer(DecoderBufferType::Bitstream).unwrap();
        buffer[..4].copy_from_slice(&[0, 0, 0, 1]);
        decoder.release_decoder_buffer(DecoderBufferType::Bitstream).unwrap();
        decoder
            .submit_decoder_buffers(&[DecoderBufferDesc::new(DecoderBufferType::Bitstream, 4)])
            .unwrap();
        decoder.end_frame().unwrap();
        view
    }

    #[test]
    fn test_configure_every_supported_pair() {
        let (_device, mut decoder) = setup();
        for codec in Codec::ALL {
            for &format in codec.output_formats() {
                let info = VideoInfo::new(format, 1280, 720);
                decoder
                    .configure(codec, &info, 1280, 720, codec.min_dpb_size())
                    .unwrap();
                assert!(decoder.is_configured(), "{} {}", codec, format.name());
                assert_eq!(decoder.codec(), codec);
            }
        }
    }

    #[test]
    fn test_unconfigured_state() {
        let (_device, mut decoder) = setup();
        assert!(!decoder.is_configured());
        assert_eq!(decoder.state(), DecoderState::Unconfigured);
        assert!(matches!(decoder.get_output_view_buffer(), Err(DecoderError::InvalidState(_))));
        assert!(matches!(decoder.end_frame(), Err(DecoderError::InvalidState(_))));
        assert!(matches!(
            decoder.configure(Codec::None, &nv12(64, 64), 64, 64, 4),
            Err(DecoderError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn test_small_dpb_rejected_and_previous_kept() {
        let (device, mut decoder) = setup();
        configure_h264(&mut decoder, 4);

        let result = decoder.configure(Codec::Vp9, &nv12(1920, 1080), 1920, 1080, 7);
        assert!(matches!(result, Err(DecoderError::UnsupportedFormat(_))));

        assert!(decoder.is_configured());
        assert_eq!(decoder.codec(), Codec::H264);
        assert_eq!(decoder.dpb_size(), Some(4));
        assert_eq!(device.sessions_created(), 1);
        decode_one(&mut decoder);
    }

    #[test]
    fn test_dpb_larger_than_index_domain_rejected() {
        let (_device, mut decoder) = setup();
        assert!(matches!(
            decoder.configure(Codec::H264, &nv12(64, 64), 64, 64, 257),
            Err(DecoderError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn test_pool_exhaustion_and_reuse() {
        let (_device, mut decoder) = setup();
        configure_h264(&mut decoder, 4);

        let mut views: Vec<_> = (0..4).map(|_| decoder.get_output_view_buffer().unwrap()).collect();
        let indices: Vec<u8> = views.iter().map(|v| v.index()).collect();
        assert_eq!(indices, vec![0, 1, 2, 3]);

        assert_eq!(
            decoder.get_output_view_buffer().unwrap_err(),
            DecoderError::PoolExhausted(4)
        );

        let released = views.remove(2);
        assert_eq!(released.index(), 2);
        drop(released);
        assert_eq!(decoder.get_output_view_buffer().unwrap().index(), 2);
    }

    #[test]
    fn test_begin_frame_twice() {
        let (_device, mut decoder) = setup();
        configure_h264(&mut decoder, 2);
        let a = decoder.get_output_view_buffer().unwrap();
        let b = decoder.get_output_view_buffer().unwrap();

        decoder.begin_frame(&a, None).unwrap();
        assert_eq!(decoder.state(), DecoderState::FrameOpen);
        assert!(matches!(decoder.begin_frame(&b, None), Err(DecoderError::InvalidState(_))));
        decoder.end_frame().unwrap();
        assert_eq!(decoder.state(), DecoderState::Configured);
    }

    #[test]
    fn test_double_acquire_is_busy() {
        let (_device, mut decoder) = setup();
        configure_h264(&mut decoder, 1);
        let view = decoder.get_output_view_buffer().unwrap();
        decoder.begin_frame(&view, None).unwrap();

        decoder.get_decoder_buffer(DecoderBufferType::SliceControl).unwrap();
        assert_eq!(
            decoder.get_decoder_buffer(DecoderBufferType::SliceControl).unwrap_err(),
            DecoderError::BufferBusy(DecoderBufferType::SliceControl)
        );
        // Other types are independent
        decoder.get_decoder_buffer(DecoderBufferType::PictureParameters).unwrap();
        decoder.end_frame().unwrap();
    }

    #[test]
    fn test_buffer_protocol_errors() {
        let (_device, mut decoder) = setup();
        configure_h264(&mut decoder, 1);

        assert!(matches!(
            decoder.get_decoder_buffer(DecoderBufferType::Bitstream),
            Err(DecoderError::InvalidState(_))
        ));
        assert!(matches!(
            decoder.submit_decoder_buffers(&[DecoderBufferDesc::new(DecoderBufferType::Bitstream, 1)]),
            Err(DecoderError::InvalidState(_))
        ));

        let view = decoder.get_output_view_buffer().unwrap();
        decoder.begin_frame(&view, None).unwrap();
        assert!(matches!(
            decoder.release_decoder_buffer(DecoderBufferType::Bitstream),
            Err(DecoderError::InvalidState(_))
        ));

        decoder.get_decoder_buffer(DecoderBufferType::Bitstream).unwrap();
        assert!(matches!(
            decoder.submit_decoder_buffers(&[DecoderBufferDesc::new(DecoderBufferType::Bitstream, 1)]),
            Err(DecoderError::InvalidState(_))
        ));
        decoder.release_decoder_buffer(DecoderBufferType::Bitstream).unwrap();
        assert!(matches!(decoder.submit_decoder_buffers(&[]), Err(DecoderError::InvalidState(_))));
        decoder.end_frame().unwrap();
    }

    #[test]
    fn test_view_index_round_trip() {
        let (_device, mut decoder) = setup();
        configure_h264(&mut decoder, 3);

        let buffers: Vec<_> = (0..3).map(|_| decoder.get_output_view_buffer().unwrap()).collect();
        for buffer in &buffers {
            let view = decoder.get_output_view_from_buffer(buffer).unwrap();
            assert_eq!(Decoder::get_output_view_index(&view), buffer.index());
        }

        // Stable while the buffer lives, across frames
        let first = buffers[0].index();
        decoder.begin_frame(&buffers[0], None).unwrap();
        decoder.end_frame().unwrap();
        assert_eq!(buffers[0].index(), first);
    }

    #[test]
    fn test_end_frame_recovers_after_failure() {
        let (device, mut decoder) = setup();
        configure_h264(&mut decoder, 2);
        let view = decoder.get_output_view_buffer().unwrap();

        // No submission at all
        decoder.begin_frame(&view, None).unwrap();
        decoder.end_frame().unwrap();
        assert_eq!(decoder.state(), DecoderState::Configured);

        // Rejected submission
        device.fail_next_submit();
        decoder.begin_frame(&view, None).unwrap();
        let err = decoder
            .submit_decoder_buffers(&[DecoderBufferDesc::new(DecoderBufferType::Bitstream, 16)])
            .unwrap_err();
        assert!(matches!(err, DecoderError::DeviceError { lost: false, .. }));
        decoder.end_frame().unwrap();
        assert_eq!(decoder.state(), DecoderState::Configured);

        // Buffers left acquired are released by end_frame
        decoder.begin_frame(&view, None).unwrap();
        decoder.get_decoder_buffer(DecoderBufferType::Bitstream).unwrap();
        decoder.end_frame().unwrap();
        decoder.begin_frame(&view, None).unwrap();
        decoder.get_decoder_buffer(DecoderBufferType::Bitstream).unwrap();
        decoder.end_frame().unwrap();

        drop(view);
        decode_one(&mut decoder);
        assert_eq!(device.frames_decoded(), 1);
    }

    #[test]
    fn test_resolution_limits() {
        let (_device, mut decoder) = setup();
        decoder
            .configure(Codec::H264, &nv12(1920, 1080), 1920, 1080, 16)
            .unwrap();

        let (_device, mut decoder) = setup();
        let result = decoder.configure(Codec::H264, &nv12(8192, 1080), 8192, 1080, 16);
        assert!(matches!(result, Err(DecoderError::UnsupportedFormat(_))));
        assert!(!decoder.is_configured());
    }

    #[test]
    fn test_identical_configure_is_noop() {
        let (device, mut decoder) = setup();
        configure_h264(&mut decoder, 4);
        let held = decoder.get_output_view_buffer().unwrap();

        configure_h264(&mut decoder, 4);
        assert_eq!(device.sessions_created(), 1);
        assert!(decoder.get_output_view_from_buffer(&held).is_some());
    }

    #[test]
    fn test_reconfigure_replaces_handle() {
        let (device, mut decoder) = setup();
        configure_h264(&mut decoder, 4);
        let old = decode_one(&mut decoder);

        decoder
            .configure(Codec::H264, &nv12(1280, 720), 1280, 720, 4)
            .unwrap();
        assert_eq!(device.sessions_created(), 2);
        assert_eq!(device.live_decoders(), 1);
        assert_eq!(device.peak_live_decoders(), 1);

        // Old buffer still readable, but not usable as a new decode target
        assert!(decoder.get_output_view_from_buffer(&old).is_none());
        assert!(matches!(decoder.begin_frame(&old, None), Err(DecoderError::InvalidState(_))));
        let mut frame = VideoFrame::new(nv12(1920, 1080));
        decoder
            .process_output(&nv12(1920, 1080), 1920, 1080, &old, OutputBuffer::System(&mut frame))
            .unwrap();
        assert_eq!(frame.plane(0)[7], pattern_byte(0, 0, 7, 0));

        // New pool starts empty even though the old buffer is alive
        assert_eq!(decoder.get_output_view_buffer().unwrap().index(), 0);
    }

    #[test]
    fn test_failed_reconfigure_keeps_previous() {
        let (device, mut decoder) = setup();
        configure_h264(&mut decoder, 4);

        device.fail_surface_allocation(1);
        let err = decoder
            .configure(Codec::H265, &nv12(1920, 1080), 1920, 1080, 4)
            .unwrap_err();
        assert!(matches!(err, DecoderError::DeviceError { .. }));
        assert!(decoder.is_configured());
        assert_eq!(decoder.codec(), Codec::H264);
        assert_eq!(device.peak_live_decoders(), 1);
        decode_one(&mut decoder);

        // Neither the new decoder nor the previous one can be created
        device.fail_decoder_creation(2);
        let err = decoder
            .configure(Codec::H265, &nv12(1920, 1080), 1920, 1080, 4)
            .unwrap_err();
        assert!(matches!(err, DecoderError::DeviceError { .. }));
        assert!(!decoder.is_configured());
        assert_eq!(device.live_surface_arrays(), 0);

        configure_h264(&mut decoder, 4);
        decode_one(&mut decoder);
    }

    #[test]
    fn test_reference_views_survive_failed_reconfigure() {
        let (device, mut decoder) = setup();
        configure_h264(&mut decoder, 4);
        let reference = decode_one(&mut decoder);

        device.fail_surface_allocation(1);
        assert!(
            decoder
                .configure(Codec::H265, &nv12(1920, 1080), 1920, 1080, 4)
                .is_err()
        );
        assert!(decoder.get_output_view_from_buffer(&reference).is_some());
        assert_eq!(decoder.pool_stats().unwrap().in_use, 1);
        assert_eq!(device.live_surface_arrays(), 1);

        // Surfaces allocated, decoder creation fails: new surfaces are freed
        device.fail_decoder_creation(1);
        assert!(
            decoder
                .configure(Codec::H265, &nv12(1920, 1080), 1920, 1080, 4)
                .is_err()
        );
        assert!(decoder.get_output_view_from_buffer(&reference).is_some());
        assert_eq!(device.live_surface_arrays(), 1);
        assert_eq!(device.peak_live_decoders(), 1);

        // The held reference is still a valid decode target and keeps its slot
        decoder.begin_frame(&reference, None).unwrap();
        decoder.end_frame().unwrap();
        assert_ne!(decoder.get_output_view_buffer().unwrap().index(), reference.index());

        let info = nv12(1920, 1080);
        let mut frame = VideoFrame::new(info.clone());
        decoder
            .process_output(&info, 1920, 1080, &reference, OutputBuffer::System(&mut frame))
            .unwrap();
        assert_eq!(frame.plane(0)[9], pattern_byte(0, 0, 9, 0));
    }

    #[test]
    fn test_configure_while_frame_open() {
        let (_device, mut decoder) = setup();
        configure_h264(&mut decoder, 1);
        let view = decoder.get_output_view_buffer().unwrap();
        decoder.begin_frame(&view, None).unwrap();

        assert!(matches!(
            decoder.configure(Codec::H265, &nv12(64, 64), 64, 64, 1),
            Err(DecoderError::InvalidState(_))
        ));
        decoder.end_frame().unwrap();
    }

    #[test]
    fn test_device_loss_requires_reconfigure() {
        let (device, mut decoder) = setup();
        configure_h264(&mut decoder, 2);
        let view = decoder.get_output_view_buffer().unwrap();
        decoder.begin_frame(&view, None).unwrap();

        device.lose_device();
        let err = decoder
            .submit_decoder_buffers(&[DecoderBufferDesc::new(DecoderBufferType::Bitstream, 4)])
            .unwrap_err();
        assert!(err.requires_reconfigure());
        assert!(decoder.is_device_lost());

        assert!(decoder.end_frame().unwrap_err().requires_reconfigure());
        assert_eq!(decoder.state(), DecoderState::Configured);
        assert_eq!(device.outstanding_buffers(), 0);

        // Even after the device comes back the old handle stays unusable
        device.restore_device();
        assert!(decoder.begin_frame(&view, None).unwrap_err().requires_reconfigure());

        // Same parameters rebuild the handle
        drop(view);
        configure_h264(&mut decoder, 2);
        assert!(!decoder.is_device_lost());
        decode_one(&mut decoder);
    }

    #[test]
    fn test_end_frame_on_lost_device_releases_buffers() {
        let (device, mut decoder) = setup();
        configure_h264(&mut decoder, 1);
        let view = decoder.get_output_view_buffer().unwrap();
        decoder.begin_frame(&view, None).unwrap();
        decoder.get_decoder_buffer(DecoderBufferType::PictureParameters).unwrap();

        device.lose_device();
        assert!(
            decoder
                .get_decoder_buffer(DecoderBufferType::Bitstream)
                .unwrap_err()
                .requires_reconfigure()
        );
        assert_eq!(device.outstanding_buffers(), 1);

        assert!(decoder.end_frame().unwrap_err().requires_reconfigure());
        assert_eq!(device.outstanding_buffers(), 0);
        assert_eq!(decoder.state(), DecoderState::Configured);
    }

    #[test]
    fn test_content_key_passthrough() {
        let (device, mut decoder) = setup();
        configure_h264(&mut decoder, 1);
        let view = decoder.get_output_view_buffer().unwrap();

        decoder.begin_frame(&view, Some(&[0xde, 0xad])).unwrap();
        assert_eq!(decoder.frame_content_key(), Some(&[0xde, 0xad][..]));
        assert_eq!(device.last_content_key(), Some(vec![0xde, 0xad]));
        decoder.end_frame().unwrap();
        assert_eq!(decoder.frame_content_key(), None);
    }

    #[test]
    fn test_submission_forwarded() {
        let (device, mut decoder) = setup();
        configure_h264(&mut decoder, 1);
        decode_one(&mut decoder);

        let submitted = device.last_submission();
        assert_eq!(submitted.len(), 1);
        assert_eq!(submitted[0].buffer_type, DecoderBufferType::Bitstream);
        assert_eq!(submitted[0].data_size, 4);
    }

    #[test]
    fn test_process_output_crops() {
        let (_device, mut decoder) = setup();
        configure_h264(&mut decoder, 2);
        let decoded = decode_one(&mut decoder);

        let info = nv12(1920, 1080);
        let mut frame = VideoFrame::new(info.clone());
        decoder
            .process_output(&info, 1920, 1080, &decoded, OutputBuffer::System(&mut frame))
            .unwrap();

        let stride = frame.info().stride(0);
        assert_eq!(frame.plane(0)[3 * stride + 5], pattern_byte(0, 0, 5, 3));
        let stride = frame.info().stride(1);
        assert_eq!(frame.plane(1)[2 * stride + 10], pattern_byte(0, 1, 10, 2));

        // Crop to a smaller area of a smaller frame
        let small = nv12(640, 360);
        let mut frame = VideoFrame::new(small.clone());
        decoder
            .process_output(&small, 640, 360, &decoded, OutputBuffer::System(&mut frame))
            .unwrap();
        assert_eq!(frame.plane(0)[359 * 640 + 639], pattern_byte(0, 0, 639, 359));
    }

    #[test]
    fn test_process_output_rejects_mismatch() {
        let (_device, mut decoder) = setup();
        configure_h264(&mut decoder, 2);
        let decoded = decode_one(&mut decoder);

        let p010 = VideoInfo::new(VideoFormat::P01010le, 1920, 1080);
        let mut frame = VideoFrame::new(p010.clone());
        assert!(matches!(
            decoder.process_output(&p010, 1920, 1080, &decoded, OutputBuffer::System(&mut frame)),
            Err(DecoderError::ConversionError(_))
        ));

        let info = nv12(1920, 1080);
        let mut frame = VideoFrame::new(info.clone());
        assert!(matches!(
            decoder.process_output(&info, 4096, 1080, &decoded, OutputBuffer::System(&mut frame)),
            Err(DecoderError::ConversionError(_))
        ));

        let mut small = VideoFrame::new(nv12(640, 360));
        assert!(matches!(
            decoder.process_output(&info, 1920, 1080, &decoded, OutputBuffer::System(&mut small)),
            Err(DecoderError::ConversionError(_))
        ));
    }

    #[test]
    fn test_process_output_to_texture() {
        let (device, mut decoder) = setup();
        configure_h264(&mut decoder, 2);
        let decoded = decode_one(&mut decoder);
        let info = nv12(1920, 1080);

        let texture = device.create_texture(VideoFormat::Nv12, 1920, 1080);
        decoder
            .process_output(&info, 1920, 1080, &decoded, OutputBuffer::Device(&texture))
            .unwrap();
        let data = EmulatedDevice::texture_data(&texture).unwrap();
        assert_eq!(data[1920 + 4], pattern_byte(0, 0, 4, 1));

        let other = EmulatedDevice::new();
        let foreign: DeviceSurface = other.create_texture(VideoFormat::Nv12, 1920, 1080);
        assert!(matches!(
            decoder.process_output(&info, 1920, 1080, &decoded, OutputBuffer::Device(&foreign)),
            Err(DecoderError::ConversionError(_))
        ));
    }

    #[test]
    fn test_process_output_of_open_frame() {
        let (_device, mut decoder) = setup();
        configure_h264(&mut decoder, 1);
        let view = decoder.get_output_view_buffer().unwrap();
        decoder.begin_frame(&view, None).unwrap();

        let info = nv12(1920, 1080);
        let mut frame = VideoFrame::new(info.clone());
        assert!(matches!(
            decoder.process_output(&info, 1920, 1080, &view, OutputBuffer::System(&mut frame)),
            Err(DecoderError::InvalidState(_))
        ));
        decoder.end_frame().unwrap();
    }

    #[test]
    fn test_direct_render_conditions() {
        let (_device, mut decoder) = setup();
        configure_h264(&mut decoder, 2);
        let decoded = decode_one(&mut decoder);
        let picture = PictureInfo::new(1920, 1080);

        // Nothing negotiated yet
        assert!(!decoder.can_direct_render(&decoded, &picture));

        let input = InputState::new(Codec::H264, 1920, 1080);
        let state = decoder.negotiate(&input, &DownstreamCaps::any()).unwrap();
        assert_eq!(state.memory, MemoryFeature::Device);
        assert!(decoder.can_direct_render(&decoded, &picture));

        let reverse = PictureInfo {
            reverse_playback: true,
            ..picture
        };
        assert!(!decoder.can_direct_render(&decoded, &reverse));
        assert!(!decoder.can_direct_render(&decoded, &PictureInfo::new(1280, 720)));

        // Already shown downstream without a copy
        let exported = decoded.export().unwrap();
        assert!(!decoder.can_direct_render(&decoded, &picture));
        drop(exported);
        assert!(decoder.can_direct_render(&decoded, &picture));
    }

    #[test]
    fn test_direct_render_needs_same_device() {
        let (_device, mut decoder) = setup();
        let (_other_device, mut other) = setup();
        configure_h264(&mut decoder, 1);
        configure_h264(&mut other, 1);

        let input = InputState::new(Codec::H264, 1920, 1080);
        decoder.negotiate(&input, &DownstreamCaps::any()).unwrap();
        let foreign = decode_one(&mut other);
        assert!(!decoder.can_direct_render(&foreign, &PictureInfo::new(1920, 1080)));
    }

    #[test]
    fn test_direct_render_disabled_by_settings() {
        init_logging();
        let device = Arc::new(EmulatedDevice::new());
        let settings = DecoderSettings {
            allow_direct_render: false,
            ..DecoderSettings::default()
        };
        let mut decoder = Decoder::new(device, settings);
        configure_h264(&mut decoder, 1);

        let input = InputState::new(Codec::H264, 1920, 1080);
        let state = decoder.negotiate(&input, &DownstreamCaps::any()).unwrap();
        assert_eq!(state.memory, MemoryFeature::System);

        let decoded = decode_one(&mut decoder);
        assert!(!decoder.can_direct_render(&decoded, &PictureInfo::new(1920, 1080)));

        let device_only = DownstreamCaps::default().with_entry(CapsEntry::new(MemoryFeature::Device, Vec::new()));
        assert!(matches!(
            decoder.negotiate(&input, &device_only),
            Err(DecoderError::NotNegotiated(_))
        ));
    }

    #[test]
    fn test_negotiate_checks_device_profiles() {
        init_logging();
        let device = Arc::new(EmulatedDevice::new().with_profiles(vec![DecoderProfile::H264_VLD_NOFGT]));
        let mut decoder = Decoder::new(device, DecoderSettings::default());

        let input = InputState::new(Codec::Vp9, 1920, 1080);
        assert!(matches!(
            decoder.negotiate(&input, &DownstreamCaps::any()),
            Err(DecoderError::NotNegotiated(_))
        ));
        assert!(decoder.output_state().is_none());
    }

    #[test]
    fn test_decide_allocation_records_config() {
        let (device, mut decoder) = setup();
        let input = InputState::new(Codec::H264, 1920, 1080);
        let state = decoder.negotiate(&input, &DownstreamCaps::any()).unwrap().clone();

        let mut query = AllocationQuery::new(state);
        let config = decoder.decide_allocation(&mut query).unwrap();
        assert_eq!(config.kind, negotiate::PoolKind::Device(device.device_id()));
        assert_eq!(decoder.allocation(), Some(&config));
    }

    #[test]
    fn test_views_released_from_other_thread() {
        let (_device, mut decoder) = setup();
        configure_h264(&mut decoder, 2);
        let a = decoder.get_output_view_buffer().unwrap();
        let b = decoder.get_output_view_buffer().unwrap();
        assert!(decoder.get_output_view_buffer().is_err());

        std::thread::spawn(move || drop((a, b))).join().unwrap();
        assert_eq!(decoder.pool_stats().unwrap().in_use, 0);
        assert_eq!(decoder.get_output_view_buffer().unwrap().index(), 0);
    }

    #[test]
    fn test_settings_defaults_from_partial_json() {
        let settings: DecoderSettings =
            serde_json::from_str(r#"{"log_target": "mydecoder"}"#).unwrap();
        assert_eq!(settings.log_target, "mydecoder");
        assert!(settings.allow_direct_render);
        assert_eq!(settings.surface_alignment, 16);
    }
}
