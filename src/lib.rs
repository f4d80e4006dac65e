// D3D11 Decoder - Direct3D11 hardware video decode resource management
// Main library entry point

pub mod backend;
pub mod caps;
pub mod codec;
pub mod decoder;
pub mod error;
#[cfg(feature = "gstreamer")]
pub mod gst;
pub mod negotiate;
pub mod pool;
pub mod registration;
pub mod video;

pub use backend::{AdapterInfo, DecodeDevice, DecoderBufferDesc, DecoderBufferType, DeviceId, DeviceSurface};
pub use caps::{CapabilityProber, Resolution};
pub use codec::{Codec, DecoderProfile};
pub use decoder::{Decoder, DecoderSettings, DecoderState, OutputBuffer, PictureInfo};
pub use error::DecoderError;
pub use negotiate::{AllocationQuery, DownstreamCaps, InputState, MemoryFeature, OutputState};
pub use pool::{ExportedView, OutputView, OutputViewBuffer, OutputViewPool};
pub use registration::{DecoderRegistration, register_device};
pub use video::{VideoFormat, VideoFrame, VideoInfo};

/// `log` target used when no decoder settings are in scope
pub const DEFAULT_LOG_TARGET: &str = "d3d11decoder";
