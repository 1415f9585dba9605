use thiserror::Error;

pub type Result<T> = std::result::Result<T, TransportError>;

/// Failures surfaced by channel, directory and host-facade operations.
///
/// None of these are fatal: a failed call leaves every other channel untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TransportError {
    /// Bad length, unknown channel or an index inside the reserved range.
    #[error("invalid argument")]
    InvalidArgument,

    /// A virtual channel is missing the peer side's attachment.
    #[error("channel not ready: peer side is not attached")]
    NotReady,

    /// The channel pool could not grow.
    #[error("out of channel resources")]
    OutOfMemory,

    /// The index is already bound on the requested side.
    #[error("channel already in use")]
    AlreadyInUse,

    /// The target queue is full and the caller asked not to drop packets.
    #[error("channel queue full")]
    QueueFull,

    #[error("general failure")]
    GeneralFailure,
}

impl TransportError {
    /// Encoding used by the `Status` register and directory responses.
    pub const fn status_code(self) -> u32 {
        match self {
            TransportError::InvalidArgument => 1,
            TransportError::NotReady => 2,
            TransportError::OutOfMemory => 3,
            TransportError::AlreadyInUse => 4,
            TransportError::QueueFull => 5,
            TransportError::GeneralFailure => 6,
        }
    }

    pub const fn from_status_code(code: u32) -> Option<Self> {
        Some(match code {
            1 => TransportError::InvalidArgument,
            2 => TransportError::NotReady,
            3 => TransportError::OutOfMemory,
            4 => TransportError::AlreadyInUse,
            5 => TransportError::QueueFull,
            6 => TransportError::GeneralFailure,
            _ => return None,
        })
    }
}

pub const STATUS_SUCCESS: u32 = 0;

/// Collapse an operation result into a `Status` register value.
pub fn status_of<T>(result: &Result<T>) -> u32 {
    match result {
        Ok(_) => STATUS_SUCCESS,
        Err(err) => err.status_code(),
    }
}
