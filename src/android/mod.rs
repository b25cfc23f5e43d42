pub mod manifest;
pub mod zip;

pub use manifest::{ManifestError, ManifestInfo};
pub use zip::{ApkReader, ApkWriter, ApkZipError};
