pub use self::bitmap::*;
pub use self::boot::*;
pub use self::config::*;
pub use self::directory::*;
pub use self::entry::*;
pub use self::fat::*;
pub use self::image::*;
pub use self::name::*;
pub use self::tracker::*;
pub use self::upcase::*;

use self::cluster::{contiguous_clusters, read_allocation, ClustersReader};
use log::{info, warn};
use std::io::Read;
use thiserror::Error;

pub mod bitmap;
pub mod boot;
pub mod checksum;
pub mod cluster;
pub mod config;
pub mod directory;
pub mod entry;
pub mod fat;
pub mod image;
pub mod name;
pub mod tracker;
pub mod upcase;

#[cfg(test)]
pub(crate) mod testing;

/// Metadata view of an exFAT volume.
///
/// Nothing is ever written to the device.
// https://learn.microsoft.com/en-us/windows/win32/fileio/exfat-specification
pub struct Volume<D: Device> {
    device: D,
    config: Config,
    boot: BootSector,
    root: Vec<EntrySet>,
    tracker: Option<ClusterAllocationTracker>,
    volume_label: Option<String>,
}

impl<D: Device> Volume<D> {
    pub fn open(device: D, config: Config) -> Result<Self, OpenError> {
        // Read boot sector.
        let mut sector = [0u8; 512];

        if let Err(e) = device.read_at(0, &mut sector) {
            return Err(OpenError::ReadBootSectorFailed(e));
        }

        let boot = match BootSector::parse(&sector) {
            Ok(v) => v,
            Err(e) => return Err(OpenError::CorruptBootSector(e)),
        };

        // Read root directory.
        let geometry = *boot.geometry();
        let root_cluster = geometry.first_cluster_of_root_directory();

        if !geometry.is_valid_cluster(root_cluster) {
            return Err(OpenError::InvalidRootCluster(root_cluster));
        }

        let fat = DeviceFat::active(&device, &geometry);
        let data = match walk_chain(&fat, &geometry, root_cluster) {
            Ok(v) => {
                if v.is_broken() {
                    warn!(
                        "FAT chain of the root directory is broken after {} clusters",
                        v.len()
                    );
                }

                match read_clusters(&geometry, &device, v.into_clusters(), None) {
                    Ok(v) => v,
                    Err(e) => return Err(OpenError::ReadRootFailed(e)),
                }
            }
            Err(e) => return Err(OpenError::ReadRootFailed(e)),
        };

        let classifier = Classifier::new(Some(geometry));
        let root = parse_directory(&data, classifier, &config);

        // Load allocation bitmaps.
        let entries: Vec<RawEntry> = directory_entries(&data, config.scan_past_end).collect();
        let tracker = match ClusterAllocationTracker::bootstrap(&geometry, &device, &entries) {
            Ok(v) => Some(v),
            Err(e) if config.require_bitmap => return Err(OpenError::LoadBitmapFailed(e)),
            Err(e) => {
                warn!("opening the volume without allocation bitmap: {}", e);
                None
            }
        };

        // Get volume label.
        let volume_label = root.iter().find_map(|s| match s.record() {
            Record::VolumeLabel(v) => Some(v.clone()),
            _ => None,
        });

        info!(
            "opened exFAT volume with {} clusters of {} bytes, {} root entry sets",
            geometry.cluster_count(),
            geometry.cluster_size(),
            root.len()
        );

        Ok(Self {
            device,
            config,
            boot,
            root,
            tracker,
            volume_label,
        })
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn boot_sector(&self) -> &BootSector {
        &self.boot
    }

    pub fn geometry(&self) -> &VolumeGeometry {
        self.boot.geometry()
    }

    /// Gets the entry sets of the root directory.
    pub fn root(&self) -> &[EntrySet] {
        &self.root
    }

    pub fn volume_label(&self) -> Option<&str> {
        self.volume_label.as_deref()
    }

    /// Gets the allocation tracker. This is [`None`] only when the volume was opened without
    /// [`Config::require_bitmap`] and the bitmap cannot be loaded.
    pub fn tracker(&self) -> Option<&ClusterAllocationTracker> {
        self.tracker.as_ref()
    }

    /// Reads and assembles the entry sets of a directory.
    pub fn read_directory(
        &self,
        first_cluster: u32,
        no_fat_chain: bool,
        data_length: u64,
    ) -> Result<Vec<EntrySet>, ReadDirectoryError> {
        let geometry = self.geometry();

        if !geometry.is_valid_cluster(first_cluster) {
            return Err(ReadDirectoryError::InvalidCluster(first_cluster));
        }

        // Get clusters.
        let clusters = if no_fat_chain {
            contiguous_clusters(geometry, first_cluster, data_length)
        } else {
            let fat = DeviceFat::active(&self.device, geometry);

            match walk_chain(&fat, geometry, first_cluster) {
                Ok(v) => v,
                Err(e) => return Err(ReadDirectoryError::ReadFatFailed(e)),
            }
        };

        let available = clusters.len() as u64 * geometry.cluster_size();

        if clusters.is_broken() && available < data_length {
            warn!(
                "directory at cluster #{} has {} bytes but only {} are reachable",
                first_cluster, data_length, available
            );
        }

        // Read entries.
        let length = data_length.min(available);
        let clusters = clusters.into_clusters();
        let data = match read_clusters(geometry, &self.device, clusters, Some(length)) {
            Ok(v) => v,
            Err(e) => return Err(ReadDirectoryError::ReadFailed(e)),
        };

        Ok(parse_directory(
            &data,
            Classifier::new(Some(*geometry)),
            &self.config,
        ))
    }

    /// Reads the directory described by a file entry set.
    pub fn read_subdirectory(&self, file: &FileRecord) -> Result<Vec<EntrySet>, ReadDirectoryError> {
        if !file.is_directory() {
            return Err(ReadDirectoryError::NotDirectory);
        }

        let stream = match file.stream() {
            Some(v) => v,
            None => return Err(ReadDirectoryError::NoStream),
        };

        self.read_directory(
            stream.first_cluster(),
            stream.no_fat_chain(),
            stream.data_length(),
        )
    }

    /// Enumerates the clusters of a file through the active FAT.
    pub fn file_clusters(&self, stream: &StreamEntry) -> std::io::Result<Clusters> {
        let geometry = self.geometry();
        let fat = DeviceFat::active(&self.device, geometry);

        cluster::file_clusters(&fat, geometry, stream)
    }

    /// Loads the Up-case Table referenced by the root directory.
    ///
    /// Returns [`None`] when the root directory has no Up-case Table entry.
    pub fn upcase_table(&self) -> Result<Option<UpcaseTable>, ReadUpcaseTableError> {
        let entry = match self.root.iter().find_map(|s| match s.record() {
            Record::UpcaseTable(v) if !s.is_corrupt() => Some(*v),
            _ => None,
        }) {
            Some(v) => v,
            None => return Ok(None),
        };

        // A table never holds more than one mapping per UTF-16 code unit.
        let length = entry.data_length().min(UPCASE_TABLE_UNITS as u64 * 2);
        let geometry = self.geometry();
        let data = match read_allocation(geometry, &self.device, entry.first_cluster(), length) {
            Ok(v) => v,
            Err(e) => return Err(ReadUpcaseTableError::ReadFailed(e)),
        };

        if entry.data_length() > length {
            warn!(
                "Up-case Table DataLength {} is larger than a full table",
                entry.data_length()
            );
        } else if (data.len() as u64) < length {
            warn!(
                "Up-case Table has {} bytes but only {} are readable",
                entry.data_length(),
                data.len()
            );
        }

        let table = match UpcaseTable::parse(&data) {
            Ok(v) => v,
            Err(e) => return Err(ReadUpcaseTableError::InvalidTable(e)),
        };

        if !table.verify(entry.checksum()) {
            warn!(
                "Up-case Table checksum mismatch: stored {:#010x}, computed {:#010x}",
                entry.checksum(),
                table.checksum()
            );
        }

        Ok(Some(table))
    }

    /// Checks the Main Boot Checksum sector against the rest of the main boot region.
    pub fn verify_boot_region(&self) -> std::io::Result<bool> {
        let bps = self.geometry().bytes_per_sector() as usize;
        let mut region = vec![0u8; bps * 12];

        self.device.read_at(0, &mut region)?;

        Ok(verify_boot_region(&region, bps))
    }
}

fn read_clusters<D: Device + ?Sized>(
    geometry: &VolumeGeometry,
    device: &D,
    clusters: Vec<u32>,
    data_length: Option<u64>,
) -> std::io::Result<Vec<u8>> {
    let mut reader = ClustersReader::new(geometry, device, clusters, data_length)?;
    let mut data = Vec::new();

    reader.read_to_end(&mut data)?;

    Ok(data)
}

/// Represents an error for [`Volume::open()`].
#[derive(Debug, Error)]
pub enum OpenError {
    #[error("cannot read boot sector")]
    ReadBootSectorFailed(#[source] std::io::Error),

    #[error("boot sector is corrupted")]
    CorruptBootSector(#[source] BootSectorError),

    #[error("FirstClusterOfRootDirectory #{0} is not in the cluster heap")]
    InvalidRootCluster(u32),

    #[error("cannot read root directory")]
    ReadRootFailed(#[source] std::io::Error),

    #[error("cannot load allocation bitmap")]
    LoadBitmapFailed(#[source] TrackerError),
}

/// Represents an error for [`Volume::read_directory()`].
#[derive(Debug, Error)]
pub enum ReadDirectoryError {
    #[error("cluster #{0} is not in the cluster heap")]
    InvalidCluster(u32),

    #[error("entry set is not a directory")]
    NotDirectory,

    #[error("entry set has no stream extension")]
    NoStream,

    #[error("cannot read FAT")]
    ReadFatFailed(#[source] std::io::Error),

    #[error("cannot read directory entries")]
    ReadFailed(#[source] std::io::Error),
}

/// Represents an error for [`Volume::upcase_table()`].
#[derive(Debug, Error)]
pub enum ReadUpcaseTableError {
    #[error("cannot read Up-case Table")]
    ReadFailed(#[source] std::io::Error),

    #[error("Up-case Table is invalid")]
    InvalidTable(#[source] UpcaseError),
}
