use crate::entry::{NameEntry, RawEntry, NAME_UNITS_PER_ENTRY};
use serde::Serialize;
use thiserror::Error;

/// Result of reassembling a file name.
///
/// Decoding never fails. Problems found along the way are kept in [`DecodedName::errors()`]
/// and the name is degraded instead.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DecodedName {
    value: String,
    #[serde(skip)]
    errors: Vec<NameError>,
}

impl DecodedName {
    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn into_value(self) -> String {
        self.value
    }

    pub fn errors(&self) -> &[NameError] {
        &self.errors
    }

    pub fn has_length_mismatch(&self) -> bool {
        self.errors
            .iter()
            .any(|e| matches!(e, NameError::LengthMismatch { .. }))
    }

    pub fn has_invalid_utf16(&self) -> bool {
        self.errors.contains(&NameError::InvalidUtf16)
    }
}

/// Reassembles a file name from its File Name entries.
///
/// `length` is NameLength from the stream extension, in code units. Units past `length` are
/// ignored.
pub fn decode_name(names: &[RawEntry], length: usize) -> DecodedName {
    let mut units: Vec<u16> = Vec::with_capacity(names.len() * NAME_UNITS_PER_ENTRY);

    for entry in names {
        units.extend(NameEntry::new(entry).units());
    }

    let mut errors = Vec::new();

    if units.len() < length {
        errors.push(NameError::LengthMismatch {
            expected: length,
            available: units.len(),
        });
    } else {
        units.truncate(length);
    }

    let (value, valid) = decode_utf16_units(units);

    if !valid {
        errors.push(NameError::InvalidUtf16);
    }

    DecodedName { value, errors }
}

/// Decodes UTF-16 code units, replacing unpaired surrogates with U+FFFD.
///
/// The second value is `false` if any replacement was made.
pub fn decode_utf16_units<I>(units: I) -> (String, bool)
where
    I: IntoIterator<Item = u16>,
{
    let mut valid = true;
    let value = char::decode_utf16(units)
        .map(|r| {
            r.unwrap_or_else(|_| {
                valid = false;
                char::REPLACEMENT_CHARACTER
            })
        })
        .collect();

    (value, valid)
}

/// Represents a recoverable problem in a file name.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NameError {
    #[error("name has {available} code units but NameLength is {expected}")]
    LengthMismatch { expected: usize, available: usize },

    #[error("name contains an unpaired surrogate")]
    InvalidUtf16,
}
