use serde::Deserialize;
use std::io::Read;

/// Options that control how strict the parser is.
///
/// Can be loaded from a YAML document with kebab-case keys. Missing keys use the default.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct Config {
    /// Run the type-specific checks on every entry before assembling it.
    pub full_classification: bool,

    /// Keep reading entries after the end-of-directory marker.
    pub scan_past_end: bool,

    /// Compute SetChecksum for completed entry sets.
    pub verify_checksums: bool,

    /// Fail [`crate::Volume::open()`] when the root directory has no allocation bitmap for the
    /// active FAT.
    pub require_bitmap: bool,
}

impl Config {
    pub fn from_file(file: impl Read) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_reader(file)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            full_classification: true,
            scan_past_end: false,
            verify_checksums: true,
            require_bitmap: true,
        }
    }
}
