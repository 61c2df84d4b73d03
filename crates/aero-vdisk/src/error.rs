use thiserror::Error;

pub type Result<T> = std::result::Result<T, DiskError>;

/// Coarse classification of [`DiskError`] values.
///
/// Open paths abort on `Format`/`Corruption`; per-call `Capability`/`Range` failures leave the
/// open image usable.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    Format,
    Corruption,
    Capability,
    Range,
    Config,
    Io,
}

/// Unified error type for virtual disk images and the streams composed on top of them.
///
/// Note: [`DiskError::Io`] stores a human-readable `String` rather than `std::io::Error` so
/// backends that are not `std::fs` based can surface their own failures.
#[derive(Debug, Error)]
pub enum DiskError {
    #[error("unaligned buffer length {len} (expected multiple of {alignment})")]
    UnalignedLength { len: usize, alignment: usize },

    #[error("out of bounds: offset={offset} len={len} capacity={capacity}")]
    OutOfBounds {
        offset: u64,
        len: usize,
        capacity: u64,
    },

    #[error("integer overflow while computing byte offsets")]
    OffsetOverflow,

    #[error("invalid image format: {0}")]
    InvalidFormat(&'static str),

    #[error("corrupt disk image: {0}")]
    CorruptImage(&'static str),

    #[error("unsupported disk image feature: {0}")]
    Unsupported(&'static str),

    #[error("operation not supported on read-only image: {0}")]
    ReadOnly(&'static str),

    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),

    /// A structure required to open an image failed validation.
    #[error("failed to open image: {structure} invalid (redundant copy tried: {fallback_attempted}): {source}")]
    OpenFailed {
        structure: &'static str,
        fallback_attempted: bool,
        #[source]
        source: Box<DiskError>,
    },

    #[error("storage quota exceeded")]
    QuotaExceeded,

    /// Generic I/O failure.
    ///
    /// This is a catch-all for errors that do not map to a more structured variant.
    #[error("io error: {0}")]
    Io(String),
}

impl DiskError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidFormat(_) | Self::Unsupported(_) => ErrorKind::Format,
            Self::CorruptImage(_) => ErrorKind::Corruption,
            Self::ReadOnly(_) => ErrorKind::Capability,
            Self::UnalignedLength { .. } | Self::OutOfBounds { .. } | Self::OffsetOverflow => {
                ErrorKind::Range
            }
            Self::InvalidConfig(_) => ErrorKind::Config,
            Self::OpenFailed { source, .. } => source.kind(),
            Self::QuotaExceeded | Self::Io(_) => ErrorKind::Io,
        }
    }

    pub(crate) fn open_failed(
        structure: &'static str,
        fallback_attempted: bool,
        source: DiskError,
    ) -> Self {
        Self::OpenFailed {
            structure,
            fallback_attempted,
            source: Box::new(source),
        }
    }
}

impl From<std::io::Error> for DiskError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}
