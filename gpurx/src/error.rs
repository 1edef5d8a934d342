use nix::errno::Errno;

/// Result type alias for gpurx operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the capture engine.
///
/// Construction-time failures (device open, flow rules, malformed filter)
/// abort pipeline startup and are never retried. Runtime hardware errors
/// carry the failing operation and a numeric status code; the host polling
/// loop treats them as the signal to stop and drain, not to crash mid-batch.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A device-level operation failed with the given status code.
    #[error("{op}: {errno}")]
    Device { op: &'static str, errno: Errno },

    /// No device is registered under the given PCI address.
    #[error("device not found: {0}")]
    DeviceNotFound(String),

    /// PCI address string could not be parsed as `bus:device.function`.
    #[error("invalid pci address: {0}")]
    InvalidPciAddr(String),

    /// Source-IP filter was present but not a dotted-quad address.
    #[error("invalid source ip filter: {0}")]
    InvalidIpFilter(String),

    /// Flow pipe or entry installation failed.
    #[error("flow: {0}")]
    Flow(String),

    /// Semaphore slot was not in the state the transition requires.
    #[error("semaphore protocol violation at slot {slot}")]
    Semaphore { slot: u32 },

    /// The convert channel closed underneath a producer push.
    #[error("convert channel closed")]
    ChannelClosed,

    /// Columnar batch construction failed.
    #[error("arrow: {0}")]
    Arrow(#[from] arrow::error::ArrowError),
}

impl Error {
    /// Wrap a device status code with the operation that produced it.
    pub fn device(op: &'static str, errno: Errno) -> Self {
        Error::Device { op, errno }
    }
}

/// Map a negative device status code to an error, tagging the operation.
pub fn check_dev_status(op: &'static str, ret: i32) -> Result<()> {
    if ret < 0 {
        Err(Error::device(op, Errno::from_raw(-ret)))
    } else {
        Ok(())
    }
}
