use crate::bitmap::{AllocationBitmap, OutOfRange};
use crate::boot::VolumeGeometry;
use crate::cluster::{file_clusters, read_allocation};
use crate::entry::{BitmapEntry, EntryKind, RawEntry, StreamEntry};
use crate::fat::{Clusters, FatTable};
use crate::image::Device;
use log::{debug, warn};
use thiserror::Error;

/// Answers cluster allocation queries for one volume.
///
/// The bitmaps are loaded once and never modified. Open the volume again to get a fresh view.
#[derive(Debug, Clone)]
pub struct ClusterAllocationTracker {
    geometry: VolumeGeometry,
    bitmaps: [Option<AllocationBitmap>; 2],
}

impl ClusterAllocationTracker {
    /// Creates a tracker from bitmaps that were already loaded, indexed by FAT.
    pub fn new(
        geometry: &VolumeGeometry,
        bitmaps: [Option<AllocationBitmap>; 2],
    ) -> Result<Self, TrackerError> {
        let active = geometry.active_fat();

        if bitmaps[active].is_none() {
            return Err(TrackerError::NoAllocationBitmap(active));
        }

        Ok(Self {
            geometry: *geometry,
            bitmaps,
        })
    }

    /// Loads the allocation bitmaps described by the entries of the root directory.
    pub fn bootstrap<'a, D, I>(
        geometry: &VolumeGeometry,
        device: &D,
        root: I,
    ) -> Result<Self, TrackerError>
    where
        D: Device + ?Sized,
        I: IntoIterator<Item = &'a RawEntry>,
    {
        let mut bitmaps: [Option<AllocationBitmap>; 2] = [None, None];

        for entry in root {
            // A bitmap entry has no secondary entries so the type byte is enough.
            if EntryKind::from_type(entry.ty()) != EntryKind::AllocationBitmap {
                continue;
            }

            let desc = BitmapEntry::new(entry);
            let index = desc.index();

            if bitmaps[index].is_some() {
                warn!(
                    "ignoring duplicated allocation bitmap #{} at entry #{}",
                    index,
                    entry.index()
                );
                continue;
            }

            let data = match read_bitmap(geometry, device, &desc) {
                Ok(v) => v,
                Err(e) => return Err(TrackerError::ReadBitmapFailed(index, e)),
            };

            bitmaps[index] = Some(AllocationBitmap::new(data, geometry.cluster_count()));
        }

        Self::new(geometry, bitmaps)
    }

    pub fn geometry(&self) -> &VolumeGeometry {
        &self.geometry
    }

    /// Gets the bitmap of FAT #`index`.
    pub fn bitmap(&self, index: usize) -> Option<&AllocationBitmap> {
        self.bitmaps.get(index)?.as_ref()
    }

    /// Gets the bitmap of the active FAT.
    pub fn active_bitmap(&self) -> &AllocationBitmap {
        match &self.bitmaps[self.geometry.active_fat()] {
            Some(v) => v,
            None => unreachable!(),
        }
    }

    /// Returns `true` if `cluster` is marked as allocated in the active bitmap.
    pub fn is_allocated(&self, cluster: u32) -> Result<bool, OutOfRange> {
        self.active_bitmap().is_set(cluster)
    }

    /// Same as [`Self::is_allocated()`] but against the bitmap of FAT #`index`.
    ///
    /// Returns [`None`] when the volume has no such bitmap.
    pub fn is_allocated_in(&self, index: usize, cluster: u32) -> Option<Result<bool, OutOfRange>> {
        self.bitmap(index).map(|b| b.is_set(cluster))
    }

    /// Enumerates the clusters of a file from its stream extension.
    ///
    /// A NoFatChain file never reads `fat`.
    pub fn file_clusters<F>(&self, fat: &F, stream: &StreamEntry) -> std::io::Result<Clusters>
    where
        F: FatTable + ?Sized,
    {
        file_clusters(fat, &self.geometry, stream)
    }
}

/// Reads the content of an allocation bitmap.
///
/// This is the only place the FAT is used before a bitmap is available.
fn read_bitmap<D>(
    geometry: &VolumeGeometry,
    device: &D,
    desc: &BitmapEntry,
) -> std::io::Result<Vec<u8>>
where
    D: Device + ?Sized,
{
    let need = AllocationBitmap::size_for(geometry.cluster_count()) as u64;
    let data = read_allocation(
        geometry,
        device,
        desc.first_cluster(),
        desc.data_length().min(need),
    )?;

    debug!(
        "loaded {} bytes of allocation bitmap #{}",
        data.len(),
        desc.index()
    );

    Ok(data)
}

/// Represents an error for [`ClusterAllocationTracker`] construction.
#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("no allocation bitmap available for FAT #{0}")]
    NoAllocationBitmap(usize),

    #[error("cannot read allocation bitmap #{0}")]
    ReadBitmapFailed(usize, #[source] std::io::Error),
}
