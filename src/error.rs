//! Error types returned by the archive reader.

use std::borrow::Cow;
use std::io;

use thiserror::Error;

/// Result type used throughout the crate.
pub type ZipResult<T> = Result<T, ZipError>;

/// Error type for archive reading.
///
/// Variants follow the reader's failure classes:
///
/// - [`ZipError::Format`]: the bytes do not form a valid archive (bad signature,
///   out-of-bounds record, multi-disk archive, strong encryption, malformed extra field).
/// - [`ZipError::Consistency`]: the archive's metadata cannot be reconciled with
///   any legal layout, including the truncated-field recovery.
/// - [`ZipError::Usage`]: the caller used the API incorrectly.
/// - [`ZipError::Io`]: an error from the underlying byte source, passed through unchanged.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ZipError {
    /// I/O error from the byte source
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("invalid ZIP archive: {0}")]
    Format(Cow<'static, str>),

    #[error("inconsistent ZIP archive: {0}")]
    Consistency(Cow<'static, str>),

    #[error("unsupported ZIP feature: {0}")]
    Unsupported(Cow<'static, str>),

    #[error("usage error: {0}")]
    Usage(Cow<'static, str>),

    #[error("CRC32 validation failed: expected {expected:#010x}, received {actual:#010x}")]
    Crc32Mismatch { expected: u32, actual: u32 },

    #[error("too many bytes in the stream: expected {expected}, got at least {actual}")]
    TooManyBytes { expected: u64, actual: u64 },

    #[error("not enough bytes in the stream: expected {expected}, got only {actual}")]
    TooFewBytes { expected: u64, actual: u64 },
}

impl ZipError {
    pub(crate) fn format(message: impl Into<Cow<'static, str>>) -> Self {
        ZipError::Format(message.into())
    }

    pub(crate) fn consistency(message: impl Into<Cow<'static, str>>) -> Self {
        ZipError::Consistency(message.into())
    }

    pub(crate) fn unsupported(message: impl Into<Cow<'static, str>>) -> Self {
        ZipError::Unsupported(message.into())
    }

    pub(crate) fn usage(message: impl Into<Cow<'static, str>>) -> Self {
        ZipError::Usage(message.into())
    }

    /// Recover a [`ZipError`] from an error produced by an entry stream.
    ///
    /// Validation stages report failures through [`std::io::Error`] because
    /// they implement [`tokio::io::AsyncRead`]. This unwraps the original error
    /// when there is one, and wraps plain I/O errors as [`ZipError::Io`].
    pub fn from_stream_error(err: io::Error) -> Self {
        match err.downcast::<ZipError>() {
            Ok(zip_err) => zip_err,
            Err(err) => ZipError::Io(err),
        }
    }
}

impl From<ZipError> for io::Error {
    fn from(err: ZipError) -> io::Error {
        match err {
            ZipError::Io(inner) => inner,
            other => {
                let kind = match &other {
                    ZipError::Unsupported(_) => io::ErrorKind::Unsupported,
                    ZipError::Usage(_) => io::ErrorKind::InvalidInput,
                    _ => io::ErrorKind::InvalidData,
                };
                io::Error::new(kind, other)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_error_round_trip() {
        let original = ZipError::Crc32Mismatch {
            expected: 1,
            actual: 2,
        };
        let io_err: io::Error = original.into();
        assert_eq!(io_err.kind(), io::ErrorKind::InvalidData);

        match ZipError::from_stream_error(io_err) {
            ZipError::Crc32Mismatch { expected, actual } => {
                assert_eq!(expected, 1);
                assert_eq!(actual, 2);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn plain_io_error_is_wrapped() {
        let io_err = io::Error::new(io::ErrorKind::UnexpectedEof, "short read");
        assert!(matches!(
            ZipError::from_stream_error(io_err),
            ZipError::Io(e) if e.kind() == io::ErrorKind::UnexpectedEof
        ));
    }

    #[test]
    fn io_variant_converts_back_unchanged() {
        let err = ZipError::Io(io::Error::new(io::ErrorKind::PermissionDenied, "nope"));
        let io_err: io::Error = err.into();
        assert_eq!(io_err.kind(), io::ErrorKind::PermissionDenied);
        assert!(io_err.get_ref().is_some_and(|e| !e.is::<ZipError>()));
    }
}
