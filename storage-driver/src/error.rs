use std::error::Error as StdError;
use std::fmt;
use std::io;

use tracing_error::SpanTrace;

/// Categorizes storage errors by their meaning, independent of the
/// backend that produced them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageErrorKind {
    /// The requested object does not exist.
    ///
    /// Callers usually treat this as a cache miss.
    NotFound,

    /// The backend refused access to the object.
    PermissionDenied,

    /// The object path is not acceptable to the backend
    /// (absolute, or escaping the storage root).
    InvalidPath,

    /// Reading or writing failed.
    Io,

    /// An unexpected or uncategorized error occurred.
    Other,
}

impl StorageErrorKind {
    /// Classify an I/O error.
    pub fn from_io(err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => StorageErrorKind::NotFound,
            io::ErrorKind::PermissionDenied => StorageErrorKind::PermissionDenied,
            _ => StorageErrorKind::Io,
        }
    }
}

impl fmt::Display for StorageErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageErrorKind::NotFound => write!(f, "not found"),
            StorageErrorKind::PermissionDenied => write!(f, "permission denied"),
            StorageErrorKind::InvalidPath => write!(f, "invalid path"),
            StorageErrorKind::Io => write!(f, "I/O error"),
            StorageErrorKind::Other => write!(f, "other error"),
        }
    }
}

/// An error from a storage driver, carrying the driver name, the path
/// involved and the span context where it was created.
///
/// # Example
///
/// ```rust
/// use storage_driver::{StorageError, StorageErrorKind};
///
/// let error = StorageError::new(
///     "local",
///     StorageErrorKind::NotFound,
///     std::io::Error::new(std::io::ErrorKind::NotFound, "file not found"),
/// )
/// .with_path("blobs/sha256/abc");
///
/// assert!(error.is_not_found());
/// assert_eq!(error.path(), Some("blobs/sha256/abc"));
/// ```
#[derive(Debug)]
pub struct StorageError {
    kind: StorageErrorKind,
    engine: &'static str,
    path: Option<String>,
    source: Box<dyn StdError + Send + Sync + 'static>,
    span_trace: SpanTrace,
}

impl StdError for StorageError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        Some(self.source.as_ref())
    }
}

impl StorageError {
    /// Create a new storage error.
    pub fn new<E>(engine: &'static str, kind: StorageErrorKind, error: E) -> Self
    where
        E: Into<Box<dyn StdError + Send + Sync + 'static>>,
    {
        Self {
            kind,
            engine,
            path: None,
            source: error.into(),
            span_trace: SpanTrace::capture(),
        }
    }

    /// Create a storage error from an I/O error, classifying its kind.
    pub fn io(engine: &'static str, error: io::Error) -> Self {
        let kind = StorageErrorKind::from_io(&error);
        Self::new(engine, kind, error)
    }

    /// Returns a closure that wraps a downstream error, for use with `.map_err()`.
    ///
    /// ```rust
    /// use storage_driver::{StorageError, StorageErrorKind};
    ///
    /// fn operation() -> Result<(), StorageError> {
    ///     "x".parse::<u32>()
    ///         .map_err(StorageError::with("memory", StorageErrorKind::Other))?;
    ///     Ok(())
    /// }
    /// assert!(operation().is_err());
    /// ```
    pub fn with<E>(
        engine: &'static str,
        kind: StorageErrorKind,
    ) -> impl FnOnce(E) -> StorageError
    where
        E: Into<Box<dyn StdError + Send + Sync + 'static>>,
    {
        move |error: E| StorageError::new(engine, kind, error)
    }

    /// Attach the path of the object involved.
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Returns the error kind.
    pub fn kind(&self) -> StorageErrorKind {
        self.kind
    }

    /// Returns the storage engine name.
    pub fn engine(&self) -> &'static str {
        self.engine
    }

    /// Returns the object path, if available.
    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    /// Returns true when the object does not exist.
    pub fn is_not_found(&self) -> bool {
        self.kind == StorageErrorKind::NotFound
    }

    /// Returns the span trace captured when this error was created.
    pub fn span_trace(&self) -> &SpanTrace {
        &self.span_trace
    }
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Storage error [{}] from {}", self.kind, self.engine)?;

        if let Some(path) = &self.path {
            write!(f, " (path: {})", path)?;
        }

        write!(f, ": {}", self.source)
    }
}
