use crate::boot::VolumeGeometry;
use bitflags::bitflags;
use byteorder::{ByteOrder, LE};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

/// Size of a directory entry.
pub const ENTRY_SIZE: usize = 32;

/// Maximum number of UTF-16 code units in a volume label.
pub const MAX_VOLUME_LABEL_LEN: usize = 11;

/// Maximum value of SecondaryCount on a File entry (1 stream + 17 names).
pub const MAX_FILE_SECONDARY_COUNT: u8 = 18;

/// Number of UTF-16 code units held by a single File Name entry.
pub const NAME_UNITS_PER_ENTRY: usize = 15;

/// Represents a raw directory entry with its position in the directory stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RawEntry {
    index: usize,
    data: [u8; ENTRY_SIZE],
}

impl RawEntry {
    pub fn new(index: usize, data: [u8; ENTRY_SIZE]) -> Self {
        Self { index, data }
    }

    /// Copies an entry out of `data`. Returns [`None`] if `data` is not exactly 32 bytes.
    pub fn from_slice(index: usize, data: &[u8]) -> Option<Self> {
        Some(Self {
            index,
            data: data.try_into().ok()?,
        })
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn ty(&self) -> EntryType {
        EntryType(self.data[0])
    }

    pub fn data(&self) -> &[u8; ENTRY_SIZE] {
        &self.data
    }

    fn u16(&self, offset: usize) -> u16 {
        LE::read_u16(&self.data[offset..])
    }

    fn u32(&self, offset: usize) -> u32 {
        LE::read_u32(&self.data[offset..])
    }

    fn u64(&self, offset: usize) -> u64 {
        LE::read_u64(&self.data[offset..])
    }

    fn is_zero(&self, from: usize, to: usize) -> bool {
        self.data[from..to].iter().all(|&b| b == 0)
    }
}

/// Encapsulate EntryType field of the directory entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct EntryType(u8);

impl EntryType {
    pub const PRIMARY: u8 = 0;
    pub const SECONDARY: u8 = 1;
    pub const CRITICAL: u8 = 0;
    pub const BENIGN: u8 = 1;

    pub fn new(v: u8) -> Self {
        Self(v)
    }

    pub fn value(self) -> u8 {
        self.0
    }

    /// Returns `true` for the end-of-directory marker.
    pub fn is_end_of_directory(self) -> bool {
        self.0 == 0x00
    }

    pub fn is_in_use(self) -> bool {
        (self.0 & 0x80) != 0
    }

    pub fn type_code(self) -> u8 {
        self.0 & 0x1f
    }

    pub fn type_importance(self) -> u8 {
        (self.0 & 0x20) >> 5
    }

    pub fn type_category(self) -> u8 {
        (self.0 & 0x40) >> 6
    }
}

impl Display for EntryType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.is_in_use() {
            if self.type_importance() == Self::CRITICAL {
                f.write_str("critical ")?;
            } else {
                f.write_str("benign ")?;
            }

            if self.type_category() == Self::PRIMARY {
                f.write_str("primary ")?;
            } else {
                f.write_str("secondary ")?;
            }

            write!(f, "{}", self.type_code())
        } else {
            write!(f, "{:#04x}", self.0)
        }
    }
}

/// Classification of a directory entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntryKind {
    VolumeLabel,
    VolumeLabelEmpty,
    VolumeGuid,
    AllocationBitmap,
    UpcaseTable,
    TexFat,
    AccessControlTable,
    File,
    FileDeleted,
    FileStream,
    FileStreamDeleted,
    FileName,
    FileNameDeleted,
    Unknown,
}

impl EntryKind {
    /// Maps the entry type byte without looking at any other field.
    pub fn from_type(ty: EntryType) -> Self {
        match ty.value() {
            0x83 => Self::VolumeLabel,
            0x03 => Self::VolumeLabelEmpty,
            0xa0 => Self::VolumeGuid,
            0x81 => Self::AllocationBitmap,
            0x82 => Self::UpcaseTable,
            0xa1 => Self::TexFat,
            0xe2 => Self::AccessControlTable,
            0x85 => Self::File,
            0x05 => Self::FileDeleted,
            0xc0 => Self::FileStream,
            0x40 => Self::FileStreamDeleted,
            0xc1 => Self::FileName,
            0x41 => Self::FileNameDeleted,
            _ => Self::Unknown,
        }
    }

    pub fn is_file(self) -> bool {
        matches!(self, Self::File | Self::FileDeleted)
    }

    pub fn is_stream(self) -> bool {
        matches!(self, Self::FileStream | Self::FileStreamDeleted)
    }

    pub fn is_name(self) -> bool {
        matches!(self, Self::FileName | Self::FileNameDeleted)
    }

    pub fn is_deleted(self) -> bool {
        matches!(
            self,
            Self::FileDeleted | Self::FileStreamDeleted | Self::FileNameDeleted
        )
    }
}

/// Classifies directory entries, optionally checking cluster fields against a volume.
#[derive(Debug, Clone, Copy, Default)]
pub struct Classifier {
    geometry: Option<VolumeGeometry>,
}

impl Classifier {
    pub fn new(geometry: Option<VolumeGeometry>) -> Self {
        Self { geometry }
    }

    /// Classifies `entry`.
    ///
    /// When `basic` is `true` only the type byte is considered. Otherwise the type-specific
    /// fields are checked too and an entry that fails is reported as [`EntryKind::Unknown`].
    pub fn classify(&self, entry: &RawEntry, basic: bool) -> EntryKind {
        let kind = EntryKind::from_type(entry.ty());

        if basic || self.is_consistent(kind, entry) {
            kind
        } else {
            EntryKind::Unknown
        }
    }

    fn is_consistent(&self, kind: EntryKind, entry: &RawEntry) -> bool {
        match kind {
            EntryKind::VolumeLabel => {
                let label = VolumeLabelEntry::new(entry);

                label.character_count() <= MAX_VOLUME_LABEL_LEN && entry.is_zero(24, 32)
            }
            EntryKind::VolumeLabelEmpty => {
                VolumeLabelEntry::new(entry).character_count() == 0 && entry.is_zero(24, 32)
            }
            EntryKind::VolumeGuid => {
                VolumeGuidEntry::new(entry).secondary_count() == 0 && entry.is_zero(22, 32)
            }
            EntryKind::AllocationBitmap => {
                let bitmap = BitmapEntry::new(entry);

                (entry.data[1] & 0xfe) == 0
                    && entry.is_zero(2, 20)
                    && self.is_valid_cluster(bitmap.first_cluster())
            }
            EntryKind::UpcaseTable => {
                let table = UpcaseEntry::new(entry);

                entry.is_zero(1, 4)
                    && entry.is_zero(8, 20)
                    && table.data_length() != 0
                    && self.is_valid_cluster(table.first_cluster())
            }
            EntryKind::TexFat | EntryKind::AccessControlTable => true,
            EntryKind::File | EntryKind::FileDeleted => {
                (1..=MAX_FILE_SECONDARY_COUNT).contains(&FileEntry::new(entry).secondary_count())
            }
            EntryKind::FileStream | EntryKind::FileStreamDeleted => {
                let stream = StreamEntry::new(entry);

                // NameLength is a single byte so the upper bound of 255 always holds.
                stream.name_length() >= 1
                    && stream.valid_data_length() <= stream.data_length()
                    && (stream.data_length() == 0 || self.is_valid_cluster(stream.first_cluster()))
            }
            EntryKind::FileName | EntryKind::FileNameDeleted => {
                !NameEntry::new(entry)
                    .flags()
                    .contains(StreamFlags::ALLOCATION_POSSIBLE)
            }
            EntryKind::Unknown => false,
        }
    }

    fn is_valid_cluster(&self, cluster: u32) -> bool {
        match &self.geometry {
            Some(g) => g.is_valid_cluster(cluster),
            None => cluster >= 2,
        }
    }
}

/// Classifies `entry` without knowledge of the volume geometry.
pub fn classify(entry: &RawEntry, basic: bool) -> EntryKind {
    Classifier::default().classify(entry, basic)
}

/// Represents a File Directory Entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FileEntry {
    secondary_count: u8,
    set_checksum: u16,
    attributes: FileAttributes,
    timestamps: RawTimestamps,
}

impl FileEntry {
    pub fn new(entry: &RawEntry) -> Self {
        Self {
            secondary_count: entry.data[1],
            set_checksum: entry.u16(2),
            attributes: FileAttributes::from_bits_retain(entry.u16(4)),
            timestamps: RawTimestamps {
                create: entry.u32(8),
                last_modified: entry.u32(12),
                last_accessed: entry.u32(16),
                create_10ms_increment: entry.data[20],
                last_modified_10ms_increment: entry.data[21],
                create_utc_offset: entry.data[22],
                last_modified_utc_offset: entry.data[23],
                last_accessed_utc_offset: entry.data[24],
            },
        }
    }

    pub fn secondary_count(&self) -> u8 {
        self.secondary_count
    }

    pub fn set_checksum(&self) -> u16 {
        self.set_checksum
    }

    pub fn attributes(&self) -> FileAttributes {
        self.attributes
    }

    pub fn timestamps(&self) -> &RawTimestamps {
        &self.timestamps
    }
}

/// Timestamp fields of a File entry, exactly as stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RawTimestamps {
    pub create: u32,
    pub last_modified: u32,
    pub last_accessed: u32,
    pub create_10ms_increment: u8,
    pub last_modified_10ms_increment: u8,
    pub create_utc_offset: u8,
    pub last_modified_utc_offset: u8,
    pub last_accessed_utc_offset: u8,
}

/// Represents a Stream Extension Directory Entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StreamEntry {
    flags: StreamFlags,
    name_length: u8,
    name_hash: u16,
    valid_data_length: u64,
    first_cluster: u32,
    data_length: u64,
}

impl StreamEntry {
    pub fn new(entry: &RawEntry) -> Self {
        Self {
            flags: StreamFlags::from_bits_retain(entry.data[1]),
            name_length: entry.data[3],
            name_hash: entry.u16(4),
            valid_data_length: entry.u64(8),
            first_cluster: entry.u32(20),
            data_length: entry.u64(24),
        }
    }

    pub fn flags(&self) -> StreamFlags {
        self.flags
    }

    pub fn no_fat_chain(&self) -> bool {
        self.flags.contains(StreamFlags::NO_FAT_CHAIN)
    }

    /// Length of the file name in UTF-16 code units.
    pub fn name_length(&self) -> usize {
        self.name_length.into()
    }

    pub fn name_hash(&self) -> u16 {
        self.name_hash
    }

    pub fn valid_data_length(&self) -> u64 {
        self.valid_data_length
    }

    pub fn first_cluster(&self) -> u32 {
        self.first_cluster
    }

    pub fn data_length(&self) -> u64 {
        self.data_length
    }
}

/// Represents a File Name Directory Entry.
#[derive(Debug, Clone, Copy)]
pub struct NameEntry<'a> {
    entry: &'a RawEntry,
}

impl<'a> NameEntry<'a> {
    pub fn new(entry: &'a RawEntry) -> Self {
        Self { entry }
    }

    pub fn flags(&self) -> StreamFlags {
        StreamFlags::from_bits_retain(self.entry.data[1])
    }

    /// Gets the 15 code units of this fragment.
    pub fn units(&self) -> impl Iterator<Item = u16> + 'a {
        self.entry.data[2..].chunks_exact(2).map(LE::read_u16)
    }
}

/// Represents a Volume Label Directory Entry.
#[derive(Debug, Clone, Copy)]
pub struct VolumeLabelEntry<'a> {
    entry: &'a RawEntry,
}

impl<'a> VolumeLabelEntry<'a> {
    pub fn new(entry: &'a RawEntry) -> Self {
        Self { entry }
    }

    pub fn character_count(&self) -> usize {
        self.entry.data[1].into()
    }

    /// Gets the label code units, clamped to the size of the field.
    pub fn units(&self) -> impl Iterator<Item = u16> + 'a {
        let count = self.character_count().min(MAX_VOLUME_LABEL_LEN);

        self.entry.data[2..(2 + count * 2)]
            .chunks_exact(2)
            .map(LE::read_u16)
    }
}

/// Represents a Volume GUID Directory Entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct VolumeGuidEntry {
    secondary_count: u8,
    set_checksum: u16,
    flags: u16,
    guid: [u8; 16],
}

impl VolumeGuidEntry {
    pub fn new(entry: &RawEntry) -> Self {
        let mut guid = [0u8; 16];

        guid.copy_from_slice(&entry.data[6..22]);

        Self {
            secondary_count: entry.data[1],
            set_checksum: entry.u16(2),
            flags: entry.u16(4),
            guid,
        }
    }

    pub fn secondary_count(&self) -> u8 {
        self.secondary_count
    }

    pub fn set_checksum(&self) -> u16 {
        self.set_checksum
    }

    pub fn flags(&self) -> u16 {
        self.flags
    }

    pub fn guid(&self) -> &[u8; 16] {
        &self.guid
    }
}

/// Represents an Allocation Bitmap Directory Entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BitmapEntry {
    index: usize,
    first_cluster: u32,
    data_length: u64,
}

impl BitmapEntry {
    pub fn new(entry: &RawEntry) -> Self {
        Self {
            index: (entry.data[1] & 1).into(),
            first_cluster: entry.u32(20),
            data_length: entry.u64(24),
        }
    }

    /// Index of the FAT this bitmap belongs to.
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn first_cluster(&self) -> u32 {
        self.first_cluster
    }

    pub fn data_length(&self) -> u64 {
        self.data_length
    }
}

/// Represents an Up-case Table Directory Entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct UpcaseEntry {
    checksum: u32,
    first_cluster: u32,
    data_length: u64,
}

impl UpcaseEntry {
    pub fn new(entry: &RawEntry) -> Self {
        Self {
            checksum: entry.u32(4),
            first_cluster: entry.u32(20),
            data_length: entry.u64(24),
        }
    }

    pub fn checksum(&self) -> u32 {
        self.checksum
    }

    pub fn first_cluster(&self) -> u32 {
        self.first_cluster
    }

    pub fn data_length(&self) -> u64 {
        self.data_length
    }
}

bitflags! {
    /// FileAttributes field of the File entry.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(transparent)]
    #[repr(transparent)]
    pub struct FileAttributes: u16 {
        const READ_ONLY = 0x0001;
        const HIDDEN = 0x0002;
        const SYSTEM = 0x0004;
        const DIRECTORY = 0x0010;
        const ARCHIVE = 0x0020;
    }
}

bitflags! {
    /// GeneralSecondaryFlags of a secondary entry.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(transparent)]
    #[repr(transparent)]
    pub struct StreamFlags: u8 {
        const ALLOCATION_POSSIBLE = 0x01;
        const NO_FAT_CHAIN = 0x02;
    }
}
