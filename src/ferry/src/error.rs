use std::fmt;

use thiserror::Error;

use ferry_na::NaError;

/// Status codes carried in reply envelopes.
///
/// The numeric values are part of the wire contract.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Code {
    Success = 0,
    Timeout = 1,
    Canceled = 2,
    DecodeFailed = 3,
    EncodeFailed = 4,
    UnknownOp = 5,
    AlreadyCompleted = 6,
    AlreadyFreed = 7,
    CorruptDescriptor = 8,
    NetworkFailed = 9,
    OutOfMemory = 10,
    Internal = 11,
    InvalidArgument = 12,
}

impl Code {
    pub fn description(&self) -> &'static str {
        match self {
            Code::Success => "The operation completed successfully",
            Code::Timeout => "The wait timed out before the operation completed",
            Code::Canceled => "The operation was canceled",
            Code::DecodeFailed => "The input could not be decoded",
            Code::EncodeFailed => "The output could not be encoded",
            Code::UnknownOp => "No operation is registered under this identifier",
            Code::AlreadyCompleted => "The handle has already been completed",
            Code::AlreadyFreed => "The object has already been freed",
            Code::CorruptDescriptor => "The bulk descriptor is malformed",
            Code::NetworkFailed => "The network layer reported a failure",
            Code::OutOfMemory => "Out of memory",
            Code::Internal => "Internal error",
            Code::InvalidArgument => "An argument was invalid",
        }
    }

    #[inline]
    pub fn as_u32(self) -> u32 {
        self as u32
    }
}

impl From<u32> for Code {
    fn from(i: u32) -> Self {
        match i {
            0 => Code::Success,
            1 => Code::Timeout,
            2 => Code::Canceled,
            3 => Code::DecodeFailed,
            4 => Code::EncodeFailed,
            5 => Code::UnknownOp,
            6 => Code::AlreadyCompleted,
            7 => Code::AlreadyFreed,
            8 => Code::CorruptDescriptor,
            9 => Code::NetworkFailed,
            10 => Code::OutOfMemory,
            11 => Code::Internal,
            12 => Code::InvalidArgument,
            _ => Code::Internal,
        }
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self.description(), f)
    }
}

#[derive(Debug, Clone, Error)]
pub enum Error {
    #[error("timed out")]
    Timeout,
    #[error("canceled")]
    Canceled,
    #[error("decode failed: {0}")]
    DecodeFailed(String),
    #[error("encode failed: {0}")]
    EncodeFailed(String),
    #[error("unknown operation {0:#010x}")]
    UnknownOp(u32),
    #[error("already completed")]
    AlreadyCompleted,
    #[error("already freed")]
    AlreadyFreed,
    #[error("corrupt bulk descriptor: {0}")]
    CorruptDescriptor(String),
    #[error("network failure: {0}")]
    NetworkFailed(NaError),
    #[error("out of memory")]
    OutOfMemory,
    #[error("internal error: {0}")]
    Internal(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("micro-transfer {index} failed: {source}")]
    BulkFailed { index: usize, source: Box<Error> },
    #[error("remote peer replied {code:?}: {message}")]
    Remote { code: Code, message: String },
}

impl Error {
    pub fn code(&self) -> Code {
        match self {
            Error::Timeout => Code::Timeout,
            Error::Canceled => Code::Canceled,
            Error::DecodeFailed(_) => Code::DecodeFailed,
            Error::EncodeFailed(_) => Code::EncodeFailed,
            Error::UnknownOp(_) => Code::UnknownOp,
            Error::AlreadyCompleted => Code::AlreadyCompleted,
            Error::AlreadyFreed => Code::AlreadyFreed,
            Error::CorruptDescriptor(_) => Code::CorruptDescriptor,
            Error::NetworkFailed(_) => Code::NetworkFailed,
            Error::OutOfMemory => Code::OutOfMemory,
            Error::Internal(_) => Code::Internal,
            Error::InvalidArgument(_) => Code::InvalidArgument,
            Error::BulkFailed { source, .. } => source.code(),
            Error::Remote { code, .. } => *code,
        }
    }

    /// A timeout leaves the awaited operation pending; it is not a failure of the operation.
    #[inline]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout)
    }
}

impl From<NaError> for Error {
    fn from(e: NaError) -> Self {
        match e {
            NaError::Canceled => Error::Canceled,
            e => Error::NetworkFailed(e),
        }
    }
}

impl From<std::collections::TryReserveError> for Error {
    fn from(_: std::collections::TryReserveError) -> Self {
        Error::OutOfMemory
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_roundtrips_through_u32() {
        for i in 0..=12u32 {
            assert_eq!(Code::from(i).as_u32(), i);
        }
        assert_eq!(Code::from(0xdead_beef), Code::Internal);
    }

    #[test]
    fn na_errors_map_to_codes() {
        assert_eq!(Error::from(NaError::Canceled).code(), Code::Canceled);
        let transient = Error::from(NaError::Transient("flaky".into()));
        assert_eq!(transient.code(), Code::NetworkFailed);
        assert_eq!(Error::from(NaError::Closed).code(), Code::NetworkFailed);
    }

    #[test]
    fn bulk_failure_reports_cause_code() {
        let e = Error::BulkFailed {
            index: 3,
            source: Box::new(Error::Canceled),
        };
        assert_eq!(e.code(), Code::Canceled);
        assert!(e.to_string().contains("micro-transfer 3"));
    }
}
