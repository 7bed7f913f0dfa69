//! The storage driver interface shared by every storage backend.

mod driver;
mod error;

pub use driver::Driver;
pub use driver::Metadata;
pub use driver::ReadStream;
pub use driver::Reader;
pub use error::StorageError;
pub use error::StorageErrorKind;
