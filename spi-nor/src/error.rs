use core::fmt::Debug;
use embedded_nvm::{NvmError, NvmErrorKind};

/// Error type for the JEDEC SPI NOR driver.
///
/// It is generic over the SPI error type (SE), which allows for different SPI implementations.
#[derive(Debug, thiserror::Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum SpiNorError<SE> {
    /// Error from the SPI peripheral
    #[error("SpiDevice error: {0}")]
    SPI(SE),
    /// Status register read back does not match what was written.
    /// This can happen if the status register is locked by the WP pin.
    #[error("Status register write failed")]
    StatusWriteFailed,
    /// The requested range intersects the block protected region
    #[error("Range is write protected")]
    Protected,
    /// The block protection bits cannot express the requested region
    #[error("Range does not match a protectable region")]
    Unprotectable,
    /// Requested bytes out of bounds
    #[error("Requested bytes out of bounds")]
    OutOfBounds,
    /// Requested bytes not aligned
    #[error("Requested bytes not aligned")]
    NotAligned,
    /// Device is stopped or busy
    #[error("Device not ready")]
    NotReady,
    /// Configuration does not describe a valid device
    #[error("Invalid configuration")]
    InvalidConfig,
    /// Other error
    #[error("Other error. Should not happen")]
    Other,
}

// Convert from SPI error to more generic NvmError
impl<SE: Debug> NvmError for SpiNorError<SE> {
    fn kind(&self) -> NvmErrorKind {
        match self {
            SpiNorError::SPI(_) => NvmErrorKind::Transport,
            SpiNorError::StatusWriteFailed => NvmErrorKind::Transport,
            SpiNorError::Protected => NvmErrorKind::Protected,
            SpiNorError::Unprotectable => NvmErrorKind::NotAligned,
            SpiNorError::OutOfBounds => NvmErrorKind::OutOfBounds,
            SpiNorError::NotAligned => NvmErrorKind::NotAligned,
            SpiNorError::NotReady => NvmErrorKind::InvalidState,
            SpiNorError::InvalidConfig => NvmErrorKind::InvalidConfig,
            SpiNorError::Other => NvmErrorKind::Other,
        }
    }
}

// This impl is only for the bounds / alignment check helpers, for auto conversion of errors
impl<SE> From<NvmErrorKind> for SpiNorError<SE> {
    fn from(kind: NvmErrorKind) -> Self {
        match kind {
            NvmErrorKind::NotAligned => SpiNorError::NotAligned,
            NvmErrorKind::OutOfBounds => SpiNorError::OutOfBounds,
            NvmErrorKind::InvalidState => SpiNorError::NotReady,
            NvmErrorKind::Protected => SpiNorError::Protected,
            NvmErrorKind::InvalidConfig => SpiNorError::InvalidConfig,
            _ => SpiNorError::Other,
        }
    }
}
