use crate::checksum::table_checksum;
use byteorder::{ByteOrder, LE};
use thiserror::Error;

/// Number of code units covered by a fully expanded table.
pub const UPCASE_TABLE_UNITS: usize = 0x10000;

/// Marker of an identity run in a compressed table.
const IDENTITY_RUN: u16 = 0xffff;

/// Contents of an Up-case Table.
///
/// Only the format is decoded. Units that the table does not cover map to themselves.
#[derive(Debug, Clone)]
pub struct UpcaseTable {
    mappings: Vec<u16>,
    checksum: u32,
    compressed: bool,
}

impl UpcaseTable {
    pub fn parse(data: &[u8]) -> Result<Self, UpcaseError> {
        if data.len() % 2 != 0 {
            return Err(UpcaseError::OddLength(data.len()));
        }

        let mut mappings = Vec::with_capacity(UPCASE_TABLE_UNITS);
        let mut units = data.chunks_exact(2).map(LE::read_u16);
        let mut compressed = false;

        while let Some(unit) = units.next() {
            if mappings.len() >= UPCASE_TABLE_UNITS {
                return Err(UpcaseError::TooLarge);
            }

            // A trailing marker without a length is an ordinary mapping.
            if unit == IDENTITY_RUN {
                if let Some(run) = units.next() {
                    let start = mappings.len();
                    let end = start + usize::from(run);

                    if end > UPCASE_TABLE_UNITS {
                        return Err(UpcaseError::TooLarge);
                    }

                    mappings.extend((start..end).map(|v| v as u16));
                    compressed = true;
                    continue;
                }
            }

            mappings.push(unit);
        }

        // Fill the rest with identity.
        let len = mappings.len();

        mappings.extend((len..UPCASE_TABLE_UNITS).map(|v| v as u16));

        Ok(Self {
            mappings,
            checksum: table_checksum(data),
            compressed,
        })
    }

    /// TableChecksum computed over the raw bytes.
    pub fn checksum(&self) -> u32 {
        self.checksum
    }

    /// Returns `true` if the raw table contained at least one identity run.
    pub fn is_compressed(&self) -> bool {
        self.compressed
    }

    /// Compares against the TableChecksum stored in the Up-case Table directory entry.
    pub fn verify(&self, expected: u32) -> bool {
        self.checksum == expected
    }

    /// Gets the mapping of `unit`.
    pub fn get(&self, unit: u16) -> u16 {
        self.mappings[usize::from(unit)]
    }
}

/// Represents an error for [`UpcaseTable::parse()`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum UpcaseError {
    #[error("table has odd length ({0} bytes)")]
    OddLength(usize),

    #[error("table covers more than 65536 code units")]
    TooLarge,
}
