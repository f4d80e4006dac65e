// Decoder error taxonomy

use thiserror::Error;

use crate::backend::DecoderBufferType;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecoderError {
    /// No profile, format or resolution match. Retrying with the same
    /// parameters will fail again.
    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),
    /// Protocol violation by the caller
    #[error("Invalid state: {0}")]
    InvalidState(String),
    /// Same buffer type acquired twice without a release
    #[error("Decoder buffer {0:?} is already acquired")]
    BufferBusy(DecoderBufferType),
    /// Every output view is referenced downstream; retry once one is dropped
    #[error("All {0} output views are in use")]
    PoolExhausted(usize),
    /// Hardware or driver failure. Lost devices need a full reconfigure.
    #[error("Device error in {op}: {message}")]
    DeviceError {
        op: &'static str,
        message: String,
        lost: bool,
    },
    #[error("Cannot convert decoded picture: {0}")]
    ConversionError(String),
    #[error("Not negotiated: {0}")]
    NotNegotiated(String),
}

impl DecoderError {
    pub fn device(op: &'static str, message: impl Into<String>) -> Self {
        DecoderError::DeviceError {
            op,
            message: message.into(),
            lost: false,
        }
    }

    pub fn device_lost(op: &'static str, message: impl Into<String>) -> Self {
        DecoderError::DeviceError {
            op,
            message: message.into(),
            lost: true,
        }
    }

    /// Flow-control signal rather than a failure
    pub fn is_transient(&self) -> bool {
        matches!(self, DecoderError::PoolExhausted(_))
    }

    /// The hardware decoder handle is unusable until `configure` runs again
    pub fn requires_reconfigure(&self) -> bool {
        matches!(self, DecoderError::DeviceError { lost: true, .. })
    }
}
