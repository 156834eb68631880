use crate::checksum::{deleted_set_checksum, entry_set_checksum};
use crate::config::Config;
use crate::entry::{
    BitmapEntry, Classifier, EntryKind, FileAttributes, FileEntry, RawEntry, StreamEntry,
    UpcaseEntry, VolumeGuidEntry, VolumeLabelEntry, ENTRY_SIZE, MAX_FILE_SECONDARY_COUNT,
};
use crate::name::{decode_name, decode_utf16_units, DecodedName};
use bitflags::bitflags;
use log::{debug, trace};
use serde::{Deserialize, Serialize};
use std::mem::replace;

/// A primary directory entry together with its secondary entries.
#[derive(Debug, Clone, Serialize)]
pub struct EntrySet {
    kind: EntryKind,
    record: Record,
    entries: Vec<RawEntry>,
    flags: SetFlags,
}

impl EntrySet {
    /// Classification of the primary entry.
    pub fn kind(&self) -> EntryKind {
        self.kind
    }

    pub fn record(&self) -> &Record {
        &self.record
    }

    /// Gets the raw entries that make up this set, primary first.
    pub fn entries(&self) -> &[RawEntry] {
        &self.entries
    }

    /// Index of the primary entry in the directory stream.
    pub fn index(&self) -> usize {
        self.entries[0].index()
    }

    pub fn flags(&self) -> SetFlags {
        self.flags
    }

    pub fn is_corrupt(&self) -> bool {
        self.flags.contains(SetFlags::CORRUPT)
    }

    pub fn is_deleted(&self) -> bool {
        self.flags.contains(SetFlags::DELETED)
    }

    pub fn checksum_invalid(&self) -> bool {
        self.flags.contains(SetFlags::CHECKSUM_INVALID)
    }

    /// Shortcut to the file record, if this is a file set.
    pub fn file(&self) -> Option<&FileRecord> {
        match &self.record {
            Record::File(v) => Some(v),
            _ => None,
        }
    }

    fn single(entry: RawEntry, kind: EntryKind, config: &Config) -> Self {
        let mut flags = SetFlags::empty();
        let record = match kind {
            EntryKind::VolumeLabel => {
                let (label, valid) = decode_utf16_units(VolumeLabelEntry::new(&entry).units());

                if !valid {
                    flags |= SetFlags::INVALID_UTF16;
                }

                Record::VolumeLabel(label)
            }
            EntryKind::VolumeLabelEmpty => Record::VolumeLabelEmpty,
            EntryKind::VolumeGuid => {
                let guid = VolumeGuidEntry::new(&entry);

                if config.verify_checksums
                    && entry_set_checksum([&entry]) != guid.set_checksum()
                {
                    flags |= SetFlags::CHECKSUM_INVALID;
                }

                Record::VolumeGuid(guid)
            }
            EntryKind::AllocationBitmap => Record::AllocationBitmap(BitmapEntry::new(&entry)),
            EntryKind::UpcaseTable => Record::UpcaseTable(UpcaseEntry::new(&entry)),
            EntryKind::TexFat => Record::TexFat,
            EntryKind::AccessControlTable => Record::AccessControlTable,
            _ => unreachable!("{kind:?} is not a single-entry primary"),
        };

        Self {
            kind,
            record,
            entries: vec![entry],
            flags,
        }
    }
}

/// Decoded content of an entry set.
#[derive(Debug, Clone, Serialize)]
pub enum Record {
    VolumeLabel(String),
    VolumeLabelEmpty,
    VolumeGuid(VolumeGuidEntry),
    AllocationBitmap(BitmapEntry),
    UpcaseTable(UpcaseEntry),
    TexFat,
    AccessControlTable,
    File(FileRecord),
}

/// Decoded content of a file entry set.
///
/// `stream` and `name` are [`None`] when the set was cut before those entries.
#[derive(Debug, Clone, Serialize)]
pub struct FileRecord {
    file: FileEntry,
    stream: Option<StreamEntry>,
    name: Option<DecodedName>,
}

impl FileRecord {
    pub fn file(&self) -> &FileEntry {
        &self.file
    }

    pub fn attributes(&self) -> FileAttributes {
        self.file.attributes()
    }

    pub fn is_directory(&self) -> bool {
        self.file.attributes().contains(FileAttributes::DIRECTORY)
    }

    pub fn stream(&self) -> Option<&StreamEntry> {
        self.stream.as_ref()
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_ref().map(|v| v.value())
    }

    pub fn decoded_name(&self) -> Option<&DecodedName> {
        self.name.as_ref()
    }

    pub fn data_length(&self) -> Option<u64> {
        self.stream.as_ref().map(|v| v.data_length())
    }
}

bitflags! {
    /// Validity flags of an [`EntrySet`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct SetFlags: u8 {
        /// The set was broken by an unexpected entry or an invalid SecondaryCount.
        const CORRUPT = 0x01;
        /// The directory ended before the set was complete.
        const TRUNCATED = 0x02;
        const DELETED = 0x04;
        const CHECKSUM_INVALID = 0x08;
        const NAME_LENGTH_MISMATCH = 0x10;
        const INVALID_UTF16 = 0x20;
    }
}

/// State of the entry set assembler between two entries.
#[derive(Debug, Clone, Default)]
pub enum State {
    /// Expecting a primary entry.
    #[default]
    Idle,
    /// A File entry was consumed, expecting its stream extension.
    InFileStream(PendingFile),
    /// The stream extension was consumed, expecting the next File Name entry.
    InFileName(PendingFile),
}

impl State {
    /// Feeds one classified entry and returns the next state with the sets it completed.
    ///
    /// When `entry` breaks a pending set, the partial set is emitted as corrupt and `entry` is
    /// evaluated again as a primary. So at most two sets come out of a single step.
    pub fn step(self, entry: RawEntry, kind: EntryKind, config: &Config) -> (Self, Vec<EntrySet>) {
        let mut out = Vec::new();
        let next = self.advance(entry, kind, config, &mut out);

        (next, out)
    }

    /// Closes a pending set at the end of a directory.
    pub fn finish(self) -> Option<EntrySet> {
        match self {
            Self::Idle => None,
            Self::InFileStream(p) | Self::InFileName(p) => {
                debug!(
                    "directory ended inside the entry set at entry #{}",
                    p.primary.index()
                );

                Some(p.into_corrupt(SetFlags::TRUNCATED))
            }
        }
    }

    pub fn is_idle(&self) -> bool {
        matches!(self, Self::Idle)
    }

    fn advance(
        self,
        entry: RawEntry,
        kind: EntryKind,
        config: &Config,
        out: &mut Vec<EntrySet>,
    ) -> Self {
        match self {
            Self::Idle => Self::primary(entry, kind, config, out),
            Self::InFileStream(mut p) => {
                if !p.accepts_stream(kind) {
                    return Self::resync(p, entry, kind, config, out);
                }

                p.stream = Some((StreamEntry::new(&entry), entry));

                if p.expected_names == 0 {
                    out.push(p.into_complete(config));
                    Self::Idle
                } else {
                    Self::InFileName(p)
                }
            }
            Self::InFileName(mut p) => {
                if !p.accepts_name(kind) {
                    return Self::resync(p, entry, kind, config, out);
                }

                p.names.push(entry);

                if p.names.len() == p.expected_names {
                    out.push(p.into_complete(config));
                    Self::Idle
                } else {
                    Self::InFileName(p)
                }
            }
        }
    }

    fn primary(entry: RawEntry, kind: EntryKind, config: &Config, out: &mut Vec<EntrySet>) -> Self {
        match kind {
            EntryKind::VolumeLabel
            | EntryKind::VolumeLabelEmpty
            | EntryKind::VolumeGuid
            | EntryKind::AllocationBitmap
            | EntryKind::UpcaseTable
            | EntryKind::TexFat
            | EntryKind::AccessControlTable => {
                out.push(EntrySet::single(entry, kind, config));
                Self::Idle
            }
            EntryKind::File | EntryKind::FileDeleted => {
                let file = FileEntry::new(&entry);
                let count = file.secondary_count();
                let pending = PendingFile {
                    deleted: kind == EntryKind::FileDeleted,
                    file,
                    primary: entry,
                    stream: None,
                    names: Vec::new(),
                    expected_names: usize::from(count).saturating_sub(1),
                };

                if !(1..=MAX_FILE_SECONDARY_COUNT).contains(&count) {
                    debug!(
                        "entry #{} has invalid SecondaryCount {}",
                        pending.primary.index(),
                        count
                    );

                    out.push(pending.into_corrupt(SetFlags::empty()));
                    Self::Idle
                } else {
                    Self::InFileStream(pending)
                }
            }
            EntryKind::FileStream
            | EntryKind::FileStreamDeleted
            | EntryKind::FileName
            | EntryKind::FileNameDeleted
            | EntryKind::Unknown => {
                trace!(
                    "skipping entry #{} ({}) outside of an entry set",
                    entry.index(),
                    entry.ty()
                );

                Self::Idle
            }
        }
    }

    fn resync(
        pending: PendingFile,
        entry: RawEntry,
        kind: EntryKind,
        config: &Config,
        out: &mut Vec<EntrySet>,
    ) -> Self {
        debug!(
            "entry #{} ({}) breaks the entry set at entry #{}",
            entry.index(),
            entry.ty(),
            pending.primary.index()
        );

        out.push(pending.into_corrupt(SetFlags::empty()));

        Self::primary(entry, kind, config, out)
    }
}

/// A file entry set under construction.
#[derive(Debug, Clone)]
pub struct PendingFile {
    primary: RawEntry,
    file: FileEntry,
    deleted: bool,
    stream: Option<(StreamEntry, RawEntry)>,
    names: Vec<RawEntry>,
    expected_names: usize,
}

impl PendingFile {
    /// Number of File Name entries collected so far.
    pub fn names_collected(&self) -> usize {
        self.names.len()
    }

    /// Number of File Name entries announced by the File entry.
    pub fn names_expected(&self) -> usize {
        self.expected_names
    }

    fn accepts_stream(&self, kind: EntryKind) -> bool {
        kind == EntryKind::FileStream || (self.deleted && kind == EntryKind::FileStreamDeleted)
    }

    fn accepts_name(&self, kind: EntryKind) -> bool {
        kind == EntryKind::FileName || (self.deleted && kind == EntryKind::FileNameDeleted)
    }

    fn into_complete(self, config: &Config) -> EntrySet {
        let mut set = self.into_set(SetFlags::empty());

        if config.verify_checksums {
            let file = match &set.record {
                Record::File(v) => v.file.set_checksum(),
                _ => unreachable!(),
            };

            let computed = if set.is_deleted() {
                deleted_set_checksum(&set.entries)
            } else {
                entry_set_checksum(&set.entries)
            };

            if computed != file {
                debug!("entry set at entry #{} has invalid checksum", set.index());
                set.flags |= SetFlags::CHECKSUM_INVALID;
            }
        }

        set
    }

    fn into_corrupt(self, extra: SetFlags) -> EntrySet {
        self.into_set(SetFlags::CORRUPT | extra)
    }

    fn into_set(self, mut flags: SetFlags) -> EntrySet {
        let kind = if self.deleted {
            flags |= SetFlags::DELETED;
            EntryKind::FileDeleted
        } else {
            EntryKind::File
        };

        let mut entries = Vec::with_capacity(2 + self.names.len());

        entries.push(self.primary);

        let stream = self.stream.map(|(stream, raw)| {
            entries.push(raw);
            stream
        });

        // Decode whatever fragments are available, a broken set may still carry most of its name.
        let name = stream.as_ref().map(|s| {
            let name = decode_name(&self.names, s.name_length());

            if name.has_length_mismatch() {
                flags |= SetFlags::NAME_LENGTH_MISMATCH;
            }

            if name.has_invalid_utf16() {
                flags |= SetFlags::INVALID_UTF16;
            }

            name
        });

        entries.extend(self.names);

        EntrySet {
            kind,
            record: Record::File(FileRecord {
                file: self.file,
                stream,
                name,
            }),
            entries,
            flags,
        }
    }
}

/// Groups the entries of one directory into entry sets.
pub struct Assembler {
    classifier: Classifier,
    config: Config,
    state: State,
}

impl Assembler {
    pub fn new(classifier: Classifier, config: Config) -> Self {
        Self {
            classifier,
            config,
            state: State::Idle,
        }
    }

    pub fn state(&self) -> &State {
        &self.state
    }

    /// Classifies and feeds `entry`, returning the sets it completed.
    pub fn push(&mut self, entry: RawEntry) -> Vec<EntrySet> {
        let kind = self
            .classifier
            .classify(&entry, !self.config.full_classification);
        let (state, sets) = replace(&mut self.state, State::Idle).step(entry, kind, &self.config);

        self.state = state;

        sets
    }

    /// Ends the directory, returning the truncated set if one was pending.
    pub fn finish(self) -> Option<EntrySet> {
        self.state.finish()
    }
}

/// Assembles all entry sets from a sequence of entries.
pub fn assemble<I>(entries: I, classifier: Classifier, config: &Config) -> Vec<EntrySet>
where
    I: IntoIterator<Item = RawEntry>,
{
    let mut assembler = Assembler::new(classifier, config.clone());
    let mut sets = Vec::new();

    for entry in entries {
        sets.extend(assembler.push(entry));
    }

    sets.extend(assembler.finish());
    sets
}

/// Assembles all entry sets from the raw content of a directory.
///
/// Reading stops at the first end-of-directory entry unless [`Config::scan_past_end`] is set.
/// A trailing partial entry is ignored.
pub fn parse_directory(data: &[u8], classifier: Classifier, config: &Config) -> Vec<EntrySet> {
    assemble(
        directory_entries(data, config.scan_past_end),
        classifier,
        config,
    )
}

/// Splits the raw content of a directory into entries.
pub fn directory_entries(data: &[u8], scan_past_end: bool) -> impl Iterator<Item = RawEntry> + '_ {
    data.chunks_exact(ENTRY_SIZE)
        .enumerate()
        .filter_map(|(i, d)| RawEntry::from_slice(i, d))
        .take_while(move |e| scan_past_end || !e.ty().is_end_of_directory())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{
        bitmap_entry, file_entry, file_set, flatten, label_entry, name_entries, raw_entries,
        stream_entry,
    };

    fn run(entries: &[[u8; 32]]) -> Vec<EntrySet> {
        assemble(raw_entries(entries), Classifier::default(), &Config::default())
    }

    #[test]
    fn file_set_round_trip() {
        let sets = run(&file_set("document.pdf", 0x03, 10, 12345));

        assert_eq!(sets.len(), 1);

        let set = &sets[0];
        let file = set.file().unwrap();

        assert_eq!(set.kind(), EntryKind::File);
        assert_eq!(set.flags(), SetFlags::empty());
        assert_eq!(set.entries().len(), 3);
        assert_eq!(file.name(), Some("document.pdf"));
        assert_eq!(file.data_length(), Some(12345));
        assert!(file.stream().unwrap().no_fat_chain());
    }

    #[test]
    fn three_secondaries() {
        let name = "exactly-twenty-two.txt";
        let set = file_set(name, 0x01, 5, 1);

        // File + stream + 2 names.
        assert_eq!(set.len(), 4);
        assert_eq!(set[0][1], 3);

        let sets = run(&set);

        assert_eq!(sets.len(), 1);
        assert!(!sets[0].checksum_invalid());

        let decoded = sets[0].file().unwrap().name().unwrap();

        assert_eq!(decoded, name);
        assert!(decoded.encode_utf16().count() <= 30);
    }

    #[test]
    fn long_name() {
        let name: String = std::iter::repeat('n').take(255).collect();
        let set = file_set(&name, 0x01, 5, 1);

        assert_eq!(set[0][1], 18);

        let sets = run(&set);

        assert_eq!(sets.len(), 1);
        assert_eq!(sets[0].flags(), SetFlags::empty());
        assert_eq!(sets[0].file().unwrap().name(), Some(name.as_str()));
    }

    #[test]
    fn single_entry_primaries() {
        let mut guid = [0u8; 32];

        guid[0] = 0xa0;
        guid[6..22].copy_from_slice(&[7u8; 16]);

        let checksum = entry_set_checksum([&RawEntry::new(0, guid)]);

        guid[2..4].copy_from_slice(&checksum.to_le_bytes());

        let mut texfat = [0u8; 32];
        let mut acl = [0u8; 32];

        texfat[0] = 0xa1;
        acl[0] = 0xe2;

        let sets = run(&[label_entry("USB"), guid, bitmap_entry(0, 2, 8), texfat, acl]);

        assert_eq!(sets.len(), 5);
        assert!(matches!(sets[0].record(), Record::VolumeLabel(v) if v == "USB"));
        assert!(matches!(sets[1].record(), Record::VolumeGuid(v) if v.guid() == &[7u8; 16]));
        assert!(!sets[1].checksum_invalid());
        assert!(matches!(sets[2].record(), Record::AllocationBitmap(v) if v.first_cluster() == 2));
        assert!(matches!(sets[3].record(), Record::TexFat));
        assert!(matches!(sets[4].record(), Record::AccessControlTable));
        assert!(sets.iter().all(|s| s.entries().len() == 1));
    }

    #[test]
    fn corrupted_stream_type() {
        let mut entries = file_set("first.txt", 0x01, 10, 10);

        entries[1][0] = 0xff;
        entries.extend(file_set("second.txt", 0x01, 11, 10));

        let sets = run(&entries);

        assert_eq!(sets.len(), 2);
        assert!(sets[0].is_corrupt());
        assert_eq!(sets[0].entries().len(), 1);
        assert!(sets[0].file().unwrap().stream().is_none());
        assert!(!sets[1].is_corrupt());
        assert_eq!(sets[1].file().unwrap().name(), Some("second.txt"));
    }

    #[test]
    fn corrupted_name_type() {
        let long = "a file name long enough for three";
        let mut entries = file_set(long, 0x01, 10, 10);
        let first = entries.len();

        // Turn the last name entry into a file entry.
        entries[first - 1][0] = 0x85;
        entries.extend(file_set("next.bin", 0x01, 11, 10));

        let sets = run(&entries);
        let good: Vec<_> = sets.iter().filter(|s| !s.is_corrupt()).collect();

        assert_eq!(first, 5);
        assert!(sets[0].is_corrupt());
        assert_eq!(sets[0].entries().len(), first - 1);
        assert!(sets[0].flags().contains(SetFlags::NAME_LENGTH_MISMATCH));
        assert!(sets[0].file().unwrap().name().unwrap().starts_with("a file name"));
        assert_eq!(good.len(), 1);
        assert_eq!(good[0].file().unwrap().name(), Some("next.bin"));
    }

    #[test]
    fn every_secondary_corruption_resyncs() {
        let first = file_set("a long enough name to need several", 0x01, 10, 10);

        for i in 1..first.len() {
            for ty in [0x00, 0x85, 0xc0, 0xc1, 0x20, 0xff] {
                let mut entries = first.clone();

                if entries[i][0] == ty {
                    continue;
                }

                entries[i][0] = ty;
                entries.extend(file_set("after.txt", 0x01, 11, 10));

                let sets = run(&entries);

                assert!(sets[0].is_corrupt(), "entry {i} type {ty:#04x}");

                let last = sets.last().unwrap();

                assert!(!last.is_corrupt(), "entry {i} type {ty:#04x}");
                assert_eq!(last.file().unwrap().name(), Some("after.txt"));
            }
        }
    }

    #[test]
    fn truncated_at_end() {
        let mut entries = file_set("cut short at the end of the dir", 0x01, 10, 10);

        entries.pop();

        let sets = run(&entries);

        assert_eq!(sets.len(), 1);
        assert!(sets[0].flags().contains(SetFlags::CORRUPT | SetFlags::TRUNCATED));
        assert_eq!(sets[0].entries().len(), entries.len());
        assert!(sets[0].file().unwrap().name().is_some());
    }

    #[test]
    fn deleted_set() {
        let mut entries = file_set("gone.txt", 0x01, 10, 10);

        for e in entries.iter_mut() {
            e[0] &= 0x7f;
        }

        let sets = run(&entries);

        assert_eq!(sets.len(), 1);
        assert_eq!(sets[0].kind(), EntryKind::FileDeleted);
        assert!(sets[0].is_deleted());
        assert!(!sets[0].is_corrupt());
        assert!(!sets[0].checksum_invalid());
        assert_eq!(sets[0].file().unwrap().name(), Some("gone.txt"));

        // Damage after deletion is still detected.
        entries[2][2] ^= 0x01;

        let sets = run(&entries);

        assert!(sets[0].is_deleted());
        assert!(sets[0].checksum_invalid());
    }

    #[test]
    fn deleted_primary_with_live_secondaries() {
        let mut entries = file_set("reused.txt", 0x01, 10, 10);

        entries[0][0] = 0x05;

        let sets = run(&entries);

        assert_eq!(sets.len(), 1);
        assert!(sets[0].is_deleted());
        assert!(!sets[0].is_corrupt());
        assert!(!sets[0].checksum_invalid());
    }

    #[test]
    fn live_primary_rejects_deleted_secondaries() {
        let mut entries = file_set("mixed.txt", 0x01, 10, 10);

        entries[1][0] = 0x40;

        let sets = run(&entries);

        assert!(sets[0].is_corrupt());
    }

    #[test]
    fn checksum_mismatch_is_kept() {
        let mut entries = file_set("tampered.txt", 0x01, 10, 10);

        entries[1][4] ^= 0x10;

        let sets = run(&entries);

        assert_eq!(sets.len(), 1);
        assert!(sets[0].checksum_invalid());
        assert!(!sets[0].is_corrupt());
        assert_eq!(sets[0].file().unwrap().name(), Some("tampered.txt"));
    }

    #[test]
    fn invalid_secondary_count_in_basic_mode() {
        let config = Config {
            full_classification: false,
            ..Config::default()
        };
        let mut entries = vec![file_entry(0, 0)];

        entries.extend(file_set("ok.txt", 0x01, 10, 10));

        let sets = assemble(raw_entries(&entries), Classifier::default(), &config);

        assert_eq!(sets.len(), 2);
        assert!(sets[0].is_corrupt());
        assert!(!sets[1].is_corrupt());
    }

    #[test]
    fn stream_only_set() {
        // SecondaryCount of 1 closes the set on the stream.
        let mut entries = vec![file_entry(1, 0), stream_entry(0x01, 3, 10, 10, 10)];

        entries.extend(name_entries("abc"));

        let sets = run(&entries);

        assert_eq!(sets.len(), 1);
        assert_eq!(sets[0].entries().len(), 2);
        assert!(sets[0].flags().contains(SetFlags::NAME_LENGTH_MISMATCH));
    }

    #[test]
    fn step_is_pure() {
        let config = Config::default();
        let entries = raw_entries(&file_set("state.txt", 0x01, 10, 10));
        let kinds: Vec<_> = entries
            .iter()
            .map(|e| Classifier::default().classify(e, false))
            .collect();

        let (state, out) = State::Idle.step(entries[0].clone(), kinds[0], &config);

        assert!(out.is_empty());
        assert!(matches!(state, State::InFileStream(_)));

        // The same state can be continued twice independently.
        let (a, _) = state.clone().step(entries[1].clone(), kinds[1], &config);
        let (b, _) = state.step(entries[1].clone(), kinds[1], &config);

        match (&a, &b) {
            (State::InFileName(x), State::InFileName(y)) => {
                assert_eq!(x.names_collected(), 0);
                assert_eq!(y.names_expected(), 1);
            }
            _ => panic!("unexpected state"),
        }

        let (done, out) = a.step(entries[2].clone(), kinds[2], &config);

        assert!(done.is_idle());
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn directory_end() {
        let mut entries = file_set("one.txt", 0x01, 10, 10);

        entries.push([0u8; 32]);
        entries.extend(file_set("stale.txt", 0x01, 11, 10));

        let data = flatten(&entries);
        let sets = parse_directory(&data, Classifier::default(), &Config::default());

        assert_eq!(sets.len(), 1);

        let config = Config {
            scan_past_end: true,
            ..Config::default()
        };
        let sets = parse_directory(&data, Classifier::default(), &config);

        assert_eq!(sets.len(), 2);
        assert_eq!(sets[1].index(), 4);
        assert_eq!(sets[1].file().unwrap().name(), Some("stale.txt"));
    }
}
