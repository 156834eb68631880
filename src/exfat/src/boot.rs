use bitflags::bitflags;
use byteorder::{ByteOrder, LE};
use log::warn;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Size of the part of the boot sector that has a defined layout.
pub const BOOT_SECTOR_SIZE: usize = 512;

/// Number of sectors covered by the boot region checksum.
pub const BOOT_REGION_SECTORS: usize = 11;

/// Highest value of `BytesPerSectorShift + SectorsPerClusterShift` (32 MB clusters).
const MAX_CLUSTER_SHIFT: u8 = 25;

/// Main boot sector of an exFAT volume.
///
/// Only the fields required for addressing are validated. Everything else is reported as-is so
/// a damaged volume can still be examined.
#[derive(Debug, Clone)]
pub struct BootSector {
    geometry: VolumeGeometry,
    partition_offset: u64,
    volume_length: u64,
    volume_serial_number: u32,
    file_system_revision: u16,
    drive_select: u8,
    percent_in_use: u8,
    must_be_zero_clean: bool,
}

impl BootSector {
    pub fn parse(sector: &[u8]) -> Result<Self, BootSectorError> {
        if sector.len() < BOOT_SECTOR_SIZE {
            return Err(BootSectorError::TooSmall(sector.len()));
        }

        // Check type.
        if &sector[3..11] != b"EXFAT   " {
            return Err(BootSectorError::NotExFat);
        }

        if sector[510..512] != [0x55, 0xaa] {
            return Err(BootSectorError::InvalidSignature(LE::read_u16(&sector[510..])));
        }

        let must_be_zero_clean = sector[11..64].iter().all(|&b| b == 0);

        if !must_be_zero_clean {
            warn!("MustBeZero region of the boot sector is not zero");
        }

        // Check shifts.
        let bytes_per_sector_shift = sector[108];
        let sectors_per_cluster_shift = sector[109];

        if !(9..=12).contains(&bytes_per_sector_shift) {
            return Err(BootSectorError::InvalidBytesPerSectorShift(
                bytes_per_sector_shift,
            ));
        }

        // No need to check if subtraction is underflow because the value was checked above.
        if sectors_per_cluster_shift > MAX_CLUSTER_SHIFT - bytes_per_sector_shift {
            return Err(BootSectorError::InvalidSectorsPerClusterShift(
                sectors_per_cluster_shift,
            ));
        }

        let number_of_fats = sector[110];

        if number_of_fats != 1 && number_of_fats != 2 {
            return Err(BootSectorError::InvalidNumberOfFats(number_of_fats));
        }

        // Load geometry.
        let geometry = VolumeGeometry {
            bytes_per_sector_shift,
            sectors_per_cluster_shift,
            fat_offset: LE::read_u32(&sector[80..]),
            fat_length: LE::read_u32(&sector[84..]),
            cluster_heap_offset: LE::read_u32(&sector[88..]),
            cluster_count: LE::read_u32(&sector[92..]),
            first_cluster_of_root_directory: LE::read_u32(&sector[96..]),
            number_of_fats,
            volume_flags: VolumeFlags::from_bits_retain(LE::read_u16(&sector[106..])),
        };

        // The cluster heap cannot be addressed if it overlaps the FAT region.
        let fat_end = u64::from(geometry.fat_offset)
            + u64::from(geometry.fat_length) * u64::from(number_of_fats);

        if u64::from(geometry.cluster_heap_offset) < fat_end {
            return Err(BootSectorError::OverlappedClusterHeap);
        }

        if geometry.volume_flags.contains(VolumeFlags::ACTIVE_FAT) && number_of_fats == 1 {
            warn!("ActiveFat points to the second FAT but the volume has only one");
        }

        Ok(Self {
            geometry,
            partition_offset: LE::read_u64(&sector[64..]),
            volume_length: LE::read_u64(&sector[72..]),
            volume_serial_number: LE::read_u32(&sector[100..]),
            file_system_revision: LE::read_u16(&sector[104..]),
            drive_select: sector[111],
            percent_in_use: sector[112],
            must_be_zero_clean,
        })
    }

    pub fn geometry(&self) -> &VolumeGeometry {
        &self.geometry
    }

    /// Offset of the partition on the media, in sectors.
    pub fn partition_offset(&self) -> u64 {
        self.partition_offset
    }

    /// Size of the volume, in sectors.
    pub fn volume_length(&self) -> u64 {
        self.volume_length
    }

    pub fn volume_serial_number(&self) -> u32 {
        self.volume_serial_number
    }

    /// Major version in the high byte, minor version in the low byte.
    pub fn file_system_revision(&self) -> u16 {
        self.file_system_revision
    }

    pub fn drive_select(&self) -> u8 {
        self.drive_select
    }

    /// `0xff` means the value is not available.
    pub fn percent_in_use(&self) -> u8 {
        self.percent_in_use
    }

    /// Returns `false` if the MustBeZero region contained any non-zero byte.
    pub fn must_be_zero_clean(&self) -> bool {
        self.must_be_zero_clean
    }
}

/// Addressing information of an exFAT volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VolumeGeometry {
    bytes_per_sector_shift: u8,
    sectors_per_cluster_shift: u8,
    fat_offset: u32,          // in sector
    fat_length: u32,          // in sector
    cluster_heap_offset: u32, // in sector
    cluster_count: u32,
    first_cluster_of_root_directory: u32,
    number_of_fats: u8,
    volume_flags: VolumeFlags,
}

impl VolumeGeometry {
    pub fn bytes_per_sector_shift(&self) -> u8 {
        self.bytes_per_sector_shift
    }

    pub fn sectors_per_cluster_shift(&self) -> u8 {
        self.sectors_per_cluster_shift
    }

    pub fn bytes_per_sector(&self) -> u64 {
        1 << self.bytes_per_sector_shift
    }

    pub fn sectors_per_cluster(&self) -> u64 {
        1 << self.sectors_per_cluster_shift
    }

    pub fn cluster_size(&self) -> u64 {
        1 << (self.bytes_per_sector_shift + self.sectors_per_cluster_shift)
    }

    pub fn fat_offset(&self) -> u32 {
        self.fat_offset
    }

    pub fn fat_length(&self) -> u32 {
        self.fat_length
    }

    pub fn cluster_heap_offset(&self) -> u32 {
        self.cluster_heap_offset
    }

    pub fn cluster_count(&self) -> u32 {
        self.cluster_count
    }

    pub fn first_cluster_of_root_directory(&self) -> u32 {
        self.first_cluster_of_root_directory
    }

    pub fn number_of_fats(&self) -> u8 {
        self.number_of_fats
    }

    pub fn volume_flags(&self) -> VolumeFlags {
        self.volume_flags
    }

    /// Index of the FAT and allocation bitmap currently in use.
    ///
    /// A volume with a single FAT always uses the first one regardless of the flag.
    pub fn active_fat(&self) -> usize {
        if self.number_of_fats == 2 && self.volume_flags.contains(VolumeFlags::ACTIVE_FAT) {
            1
        } else {
            0
        }
    }

    /// Gets the first sector of FAT #`index`.
    pub fn fat_sector(&self, index: usize) -> u64 {
        u64::from(self.fat_offset) + u64::from(self.fat_length) * index as u64
    }

    pub fn fat_byte_offset(&self, index: usize) -> u64 {
        self.fat_sector(index) << self.bytes_per_sector_shift
    }

    pub fn cluster_heap_byte_offset(&self) -> u64 {
        u64::from(self.cluster_heap_offset) << self.bytes_per_sector_shift
    }

    /// Returns `true` if `cluster` is inside `[2, ClusterCount + 1]`.
    pub fn is_valid_cluster(&self, cluster: u32) -> bool {
        cluster >= 2 && u64::from(cluster) <= u64::from(self.cluster_count) + 1
    }

    /// Gets the first sector of `cluster` or [`None`] if the cluster is not in the heap.
    pub fn cluster_sector(&self, cluster: u32) -> Option<u64> {
        if !self.is_valid_cluster(cluster) {
            return None;
        }

        let index = u64::from(cluster - 2);

        Some(u64::from(self.cluster_heap_offset) + (index << self.sectors_per_cluster_shift))
    }

    pub fn cluster_byte_offset(&self, cluster: u32) -> Option<u64> {
        self.cluster_sector(cluster)
            .map(|s| s << self.bytes_per_sector_shift)
    }

    /// Number of clusters needed to hold `length` bytes.
    pub fn clusters_for(&self, length: u64) -> u64 {
        length.div_ceil(self.cluster_size())
    }
}

bitflags! {
    /// VolumeFlags field of the boot sector.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(transparent)]
    #[repr(transparent)]
    pub struct VolumeFlags: u16 {
        const ACTIVE_FAT = 0x0001;
        const VOLUME_DIRTY = 0x0002;
        const MEDIA_FAILURE = 0x0004;
        const CLEAR_TO_ZERO = 0x0008;
    }
}

/// Computes the checksum of the first 11 sectors of a boot region.
///
/// VolumeFlags and PercentInUse are skipped since they change without the boot region being
/// rewritten.
pub fn boot_region_checksum(region: &[u8], bytes_per_sector: usize) -> u32 {
    let len = region.len().min(bytes_per_sector * BOOT_REGION_SECTORS);
    let mut checksum = 0u32;

    for (i, &b) in region[..len].iter().enumerate() {
        if i == 106 || i == 107 || i == 112 {
            continue;
        }

        checksum = checksum.rotate_right(1).wrapping_add(b.into());
    }

    checksum
}

/// Checks a 12-sector boot region against the checksum repeated in its last sector.
pub fn verify_boot_region(region: &[u8], bytes_per_sector: usize) -> bool {
    let start = bytes_per_sector * BOOT_REGION_SECTORS;
    let stored = match region.get(start..(start + bytes_per_sector)) {
        Some(v) => v,
        None => return false,
    };

    let expected = boot_region_checksum(region, bytes_per_sector);

    stored.chunks_exact(4).all(|v| LE::read_u32(v) == expected)
}

/// Represents an error for [`BootSector::parse()`].
///
/// All of these make the volume geometry unusable.
#[derive(Debug, Error)]
pub enum BootSectorError {
    #[error("boot sector has {0} bytes, need at least 512")]
    TooSmall(usize),

    #[error("image is not exFAT")]
    NotExFat,

    #[error("invalid boot signature {0:#06x}")]
    InvalidSignature(u16),

    #[error("invalid BytesPerSectorShift ({0})")]
    InvalidBytesPerSectorShift(u8),

    #[error("invalid SectorsPerClusterShift ({0})")]
    InvalidSectorsPerClusterShift(u8),

    #[error("invalid NumberOfFats ({0})")]
    InvalidNumberOfFats(u8),

    #[error("cluster heap overlaps the FAT region")]
    OverlappedClusterHeap,
}
