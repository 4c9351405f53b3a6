//! Crate-wide error type
//!
//! Three error strata exist conceptually: transport errors, firmware
//! status (carried as data, not as `Err`, since a non-zero status is the
//! caller's to interpret), and DDI status (mapped into this enum by
//! [`DdiStatus::to_error`] in `hsm::ddi`). This type covers the first and
//! third; firmware status lives in [`crate::hsm::cp::FwStatus`].

use core::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AziHsmError {
    /// A caller-supplied argument was invalid (null pointer, zero length,
    /// buffer size that would overflow a 32-bit wire field).
    InvalidParameter,
    /// Allocation of a DMA buffer or queue pair failed.
    OutOfResources,
    /// The device reported an error, or a timeout expired waiting on it.
    DeviceError,
    /// A destination buffer was too small to hold the result.
    BufferTooSmall,
    /// MBOR decode found a marker or field-id mismatch.
    CompromisedData,
    /// A well-formed-looking message violated a structural rule (wrong
    /// field count, duplicate optional field, decoded-size mismatch).
    ProtocolError,
    /// An operation or feature id was not recognized.
    Unsupported,
}

impl fmt::Display for AziHsmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            AziHsmError::InvalidParameter => "invalid parameter",
            AziHsmError::OutOfResources => "out of resources",
            AziHsmError::DeviceError => "device error",
            AziHsmError::BufferTooSmall => "buffer too small",
            AziHsmError::CompromisedData => "compromised data",
            AziHsmError::ProtocolError => "protocol error",
            AziHsmError::Unsupported => "unsupported",
        };
        f.write_str(msg)
    }
}

pub type Result<T> = core::result::Result<T, AziHsmError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn variants_are_distinct() {
        assert_ne!(AziHsmError::InvalidParameter, AziHsmError::DeviceError);
        assert_eq!(AziHsmError::BufferTooSmall, AziHsmError::BufferTooSmall);
    }
}
