//! Builders for synthetic on-disk structures used by the unit tests.
use crate::checksum::entry_set_checksum;
use crate::entry::{RawEntry, NAME_UNITS_PER_ENTRY};
use byteorder::{ByteOrder, LE};

/// Builds a 512-byte exFAT boot sector.
pub struct BootBuilder {
    bytes_per_sector_shift: u8,
    sectors_per_cluster_shift: u8,
    fat_offset: u32,
    fat_length: u32,
    cluster_heap_offset: u32,
    cluster_count: u32,
    root_cluster: u32,
    number_of_fats: u8,
    volume_flags: u16,
}

impl BootBuilder {
    pub fn new() -> Self {
        Self {
            bytes_per_sector_shift: 9,
            sectors_per_cluster_shift: 0,
            fat_offset: 24,
            fat_length: 8,
            cluster_heap_offset: 48,
            cluster_count: 64,
            root_cluster: 4,
            number_of_fats: 1,
            volume_flags: 0,
        }
    }

    pub fn shifts(mut self, bytes_per_sector: u8, sectors_per_cluster: u8) -> Self {
        self.bytes_per_sector_shift = bytes_per_sector;
        self.sectors_per_cluster_shift = sectors_per_cluster;
        self
    }

    pub fn fat(mut self, offset: u32, length: u32) -> Self {
        self.fat_offset = offset;
        self.fat_length = length;
        self
    }

    pub fn heap_offset(mut self, v: u32) -> Self {
        self.cluster_heap_offset = v;
        self
    }

    pub fn cluster_count(mut self, v: u32) -> Self {
        self.cluster_count = v;
        self
    }

    pub fn root_cluster(mut self, v: u32) -> Self {
        self.root_cluster = v;
        self
    }

    pub fn number_of_fats(mut self, v: u8) -> Self {
        self.number_of_fats = v;
        self
    }

    pub fn volume_flags(mut self, v: u16) -> Self {
        self.volume_flags = v;
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let mut s = vec![0u8; 512];
        let volume_length = u64::from(self.cluster_heap_offset)
            + (u64::from(self.cluster_count) << self.sectors_per_cluster_shift.min(32));

        s[..3].copy_from_slice(&[0xeb, 0x76, 0x90]);
        s[3..11].copy_from_slice(b"EXFAT   ");
        LE::write_u64(&mut s[72..], volume_length);
        LE::write_u32(&mut s[80..], self.fat_offset);
        LE::write_u32(&mut s[84..], self.fat_length);
        LE::write_u32(&mut s[88..], self.cluster_heap_offset);
        LE::write_u32(&mut s[92..], self.cluster_count);
        LE::write_u32(&mut s[96..], self.root_cluster);
        LE::write_u32(&mut s[100..], 0x1234abcd);
        LE::write_u16(&mut s[104..], 0x0100);
        LE::write_u16(&mut s[106..], self.volume_flags);
        s[108] = self.bytes_per_sector_shift;
        s[109] = self.sectors_per_cluster_shift;
        s[110] = self.number_of_fats;
        s[111] = 0x80;
        s[112] = 0xff;
        s[510] = 0x55;
        s[511] = 0xaa;
        s
    }
}

pub fn raw(data: [u8; 32]) -> RawEntry {
    RawEntry::new(0, data)
}

pub fn raw_entries(entries: &[[u8; 32]]) -> Vec<RawEntry> {
    entries
        .iter()
        .enumerate()
        .map(|(i, &d)| RawEntry::new(i, d))
        .collect()
}

pub fn flatten(entries: &[[u8; 32]]) -> Vec<u8> {
    entries.iter().flatten().copied().collect()
}

pub fn file_entry(secondary_count: u8, attributes: u16) -> [u8; 32] {
    let mut e = [0u8; 32];

    e[0] = 0x85;
    e[1] = secondary_count;
    LE::write_u16(&mut e[4..], attributes);
    e
}

pub fn stream_entry(
    flags: u8,
    name_length: u8,
    first_cluster: u32,
    valid_data_length: u64,
    data_length: u64,
) -> [u8; 32] {
    let mut e = [0u8; 32];

    e[0] = 0xc0;
    e[1] = flags;
    e[3] = name_length;
    LE::write_u64(&mut e[8..], valid_data_length);
    LE::write_u32(&mut e[20..], first_cluster);
    LE::write_u64(&mut e[24..], data_length);
    e
}

/// File Name entries for `name`, padded with NUL.
pub fn name_entries(name: &str) -> Vec<[u8; 32]> {
    let units: Vec<u16> = name.encode_utf16().collect();

    units
        .chunks(NAME_UNITS_PER_ENTRY)
        .map(|chunk| {
            let mut e = [0u8; 32];

            e[0] = 0xc1;

            for (i, &u) in chunk.iter().enumerate() {
                LE::write_u16(&mut e[(2 + i * 2)..], u);
            }

            e
        })
        .collect()
}

pub fn label_entry(label: &str) -> [u8; 32] {
    let mut e = [0u8; 32];
    let units: Vec<u16> = label.encode_utf16().collect();

    e[0] = 0x83;
    e[1] = units.len() as u8;

    for (i, &u) in units.iter().enumerate() {
        LE::write_u16(&mut e[(2 + i * 2)..], u);
    }

    e
}

pub fn bitmap_entry(index: u8, first_cluster: u32, data_length: u64) -> [u8; 32] {
    let mut e = [0u8; 32];

    e[0] = 0x81;
    e[1] = index;
    LE::write_u32(&mut e[20..], first_cluster);
    LE::write_u64(&mut e[24..], data_length);
    e
}

/// A complete file entry set with a valid SetChecksum.
pub fn file_set(name: &str, stream_flags: u8, first_cluster: u32, data_length: u64) -> Vec<[u8; 32]> {
    let names = name_entries(name);
    let length = name.encode_utf16().count() as u8;
    let mut set = vec![
        file_entry(1 + names.len() as u8, 0),
        stream_entry(stream_flags, length, first_cluster, data_length, data_length),
    ];

    set.extend(names);

    let checksum = entry_set_checksum(&raw_entries(&set));

    LE::write_u16(&mut set[0][2..], checksum);
    set
}
