//! Error handling for the video DMA engine
//!
//! Every fallible operation returns [`VdmaError`]. The ioctl-facing glue
//! converts it to a negative errno with [`VdmaError::to_error_code`].

/// errno values used at the character-device boundary
pub mod errno {
    pub const EIO: isize = 5;
    pub const ENXIO: isize = 6;
    pub const EAGAIN: isize = 11;
    pub const ENOMEM: isize = 12;
    pub const EFAULT: isize = 14;
    pub const EBUSY: isize = 16;
    pub const ENODEV: isize = 19;
    pub const EINVAL: isize = 22;
    pub const ETIME: isize = 62;
    pub const ENOBUFS: isize = 105;
    pub const EALREADY: isize = 114;
}

/// Error type for DMA engine operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum VdmaError {
    /// Pinning, mapping or a coherent allocation ran out of memory
    #[error("out of memory")]
    OutOfMemory,
    /// Caller supplied a bad length, alignment, count or index
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    /// Buffers are already bound to the channel
    #[error("channel already has buffers bound")]
    AlreadyBound,
    /// Operation needs bound buffers
    #[error("channel has no buffers bound")]
    NotBound,
    /// Channel is already opened by another caller
    #[error("channel busy")]
    Busy,
    /// User pages could not be pinned or are not accessible
    #[error("bad user address")]
    BadAddress,
    /// No completion arrived in time
    #[error("timed out waiting for frame")]
    Timeout,
    /// SG buffers are not ready in store mode 1
    #[error("scatter-gather buffers not ready")]
    NotReady,
    /// Board index does not name a registered device
    #[error("no such device")]
    NoDevice,
    /// Channel id outside the engine's channel range
    #[error("no such channel")]
    InvalidChannel,
    /// Engine IP revision is not supported
    #[error("unsupported engine version {major}.{minor}")]
    UnsupportedVersion { major: u8, minor: u8 },
    /// Platform layer failure with description
    #[error("platform error: {0}")]
    Platform(&'static str),
}

impl VdmaError {
    /// Converts the error to a negative errno
    pub fn to_error_code(&self) -> isize {
        match self {
            VdmaError::OutOfMemory => -errno::ENOMEM,
            VdmaError::InvalidArgument(_) => -errno::EINVAL,
            VdmaError::AlreadyBound => -errno::EALREADY,
            VdmaError::NotBound => -errno::ENOBUFS,
            VdmaError::Busy => -errno::EBUSY,
            VdmaError::BadAddress => -errno::EFAULT,
            VdmaError::Timeout => -errno::ETIME,
            VdmaError::NotReady => -errno::EAGAIN,
            VdmaError::NoDevice => -errno::ENODEV,
            VdmaError::InvalidChannel => -errno::ENXIO,
            VdmaError::UnsupportedVersion { .. } => -errno::ENODEV,
            VdmaError::Platform(_) => -errno::EIO,
        }
    }
}

/// Result alias used across the crate
pub type Result<T> = core::result::Result<T, VdmaError>;
