use crate::entry::RawEntry;

/// Computes SetChecksum over the entries of an entry set.
///
/// The first entry must be the primary. Its SetChecksum field (bytes 2 and 3) is skipped, every
/// other byte of the set is included.
pub fn entry_set_checksum<'a, I>(entries: I) -> u16
where
    I: IntoIterator<Item = &'a RawEntry>,
{
    set_checksum(entries, 0)
}

/// Computes SetChecksum of a deleted entry set.
///
/// SetChecksum is written while the set is in use, so the InUse bit is put back on every type
/// byte before it is summed.
pub fn deleted_set_checksum<'a, I>(entries: I) -> u16
where
    I: IntoIterator<Item = &'a RawEntry>,
{
    set_checksum(entries, 0x80)
}

fn set_checksum<'a, I>(entries: I, type_bits: u8) -> u16
where
    I: IntoIterator<Item = &'a RawEntry>,
{
    let mut checksum = 0u16;

    for (i, entry) in entries.into_iter().enumerate() {
        for (j, &b) in entry.data().iter().enumerate() {
            let b = match j {
                0 => b | type_bits,
                2 | 3 if i == 0 => continue,
                _ => b,
            };

            checksum = checksum.rotate_right(1).wrapping_add(b.into());
        }
    }

    checksum
}

/// Computes TableChecksum of an up-case table.
pub fn table_checksum(data: &[u8]) -> u32 {
    data.iter()
        .fold(0u32, |c, &b| c.rotate_right(1).wrapping_add(b.into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{file_set, raw};

    // Reference form of the rotate used by the on-disk format.
    fn rotate_add(checksum: u16, b: u8) -> u16 {
        (((checksum >> 1) | (checksum << 15)) as u32 + b as u32) as u16
    }

    #[test]
    fn matches_reference_rotation() {
        let set: Vec<RawEntry> = file_set("checksum.txt", 0x01, 10, 100)
            .into_iter()
            .map(raw)
            .collect();
        let mut expected = 0u16;

        for (i, entry) in set.iter().enumerate() {
            for (j, &b) in entry.data().iter().enumerate() {
                if i == 0 && (j == 2 || j == 3) {
                    continue;
                }

                expected = rotate_add(expected, b);
            }
        }

        assert_eq!(entry_set_checksum(&set), expected);
    }

    #[test]
    fn stored_field_is_ignored() {
        let mut set: Vec<RawEntry> = file_set("a", 0x01, 10, 100)
            .into_iter()
            .map(raw)
            .collect();
        let before = entry_set_checksum(&set);
        let mut data = *set[0].data();

        data[2] ^= 0xff;
        data[3] ^= 0xff;
        set[0] = RawEntry::new(0, data);

        assert_eq!(entry_set_checksum(&set), before);

        // Type byte is covered.
        data[0] = 0x05;
        set[0] = RawEntry::new(0, data);

        assert_ne!(entry_set_checksum(&set), before);
    }

    #[test]
    fn secondary_bytes_are_covered() {
        let mut set: Vec<RawEntry> = file_set("abc", 0x01, 10, 100)
            .into_iter()
            .map(raw)
            .collect();
        let before = entry_set_checksum(&set);
        let mut data = *set[2].data();

        data[2] ^= 0x01;
        set[2] = RawEntry::new(2, data);

        assert_ne!(entry_set_checksum(&set), before);
    }

    #[test]
    fn deleted_set_matches_live_checksum() {
        let live = file_set("gone.txt", 0x01, 10, 100);
        let stored = u16::from_le_bytes([live[0][2], live[0][3]]);
        let deleted: Vec<RawEntry> = live
            .iter()
            .map(|&e| {
                let mut e = e;

                e[0] &= 0x7f;
                raw(e)
            })
            .collect();

        assert_ne!(entry_set_checksum(&deleted), stored);
        assert_eq!(deleted_set_checksum(&deleted), stored);

        // A live set is unchanged by the InUse bit.
        let live: Vec<RawEntry> = live.into_iter().map(raw).collect();

        assert_eq!(deleted_set_checksum(&live), stored);
    }

    #[test]
    fn table() {
        assert_eq!(table_checksum(&[]), 0);
        assert_eq!(table_checksum(&[1]), 1);
        assert_eq!(table_checksum(&[1, 0]), 0x80000000);
    }
}
