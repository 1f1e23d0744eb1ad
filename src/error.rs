use core::fmt;

/// Driver error
///
/// Generic over the transport error type so that callers using different UART/GPIO HALs get a
/// precise error type, while the driver itself never needs to know anything about it beyond
/// `Debug`.
#[derive(Debug)]
pub enum Error<E> {
    /// No tag was present during a detection window
    NotFound,
    /// Deadline exceeded waiting for an ACK, a response frame, or a tag answer
    Timeout,
    /// Framing violation: bad preamble, checksum, TFI or response command echo
    DataLoss,
    /// The PN532 reported an explicit error frame or a non-zero `InDataExchange` status
    DeviceError,
    /// Caller-provided response buffer is too small to hold the payload
    BufferTooSmall,
    /// Caller-provided request params don't fit in a normal information frame
    TooLarge,
    /// UART or GPIO transport error
    IoError(E),
    /// A second request was made while one was already in flight
    Busy,
    /// Initialization exhausted its retries
    Unavailable,
}

impl<E> From<E> for Error<E> {
    fn from(err: E) -> Self {
        Self::IoError(err)
    }
}

impl<E: fmt::Debug> fmt::Display for Error<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound => write!(f, "No tag found"),
            Self::Timeout => write!(f, "Timeout"),
            Self::DataLoss => write!(f, "Framing error"),
            Self::DeviceError => write!(f, "Device reported an error"),
            Self::BufferTooSmall => write!(f, "Buffer too small"),
            Self::TooLarge => write!(f, "Request too large"),
            Self::IoError(_err) => write!(f, "I/O error"),
            Self::Busy => write!(f, "Busy"),
            Self::Unavailable => write!(f, "Reader unavailable"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_error_converts_via_from() {
        let err: Error<&str> = Error::from("bus reset");
        assert!(matches!(err, Error::IoError("bus reset")));
    }

    #[test]
    fn display_does_not_panic() {
        extern crate std;
        for err in [
            Error::<()>::NotFound,
            Error::Timeout,
            Error::DataLoss,
            Error::DeviceError,
            Error::BufferTooSmall,
            Error::TooLarge,
            Error::Busy,
            Error::Unavailable,
        ] {
            let _ = std::format!("{err}");
        }
    }
}
