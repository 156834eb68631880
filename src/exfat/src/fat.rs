use crate::boot::VolumeGeometry;
use crate::image::Device;
use byteorder::{ByteOrder, LE};
use log::debug;
use std::cell::RefCell;
use std::collections::HashSet;
use std::io::{Error, ErrorKind};

/// FAT entry of a free cluster.
pub const FAT_FREE: u32 = 0x00000000;

/// FAT entry of a cluster marked bad.
pub const FAT_BAD: u32 = 0xfffffff7;

/// FAT entry terminating a cluster chain.
pub const FAT_END_OF_CHAIN: u32 = 0xffffffff;

/// A source of FAT entries.
pub trait FatTable {
    /// Gets the FAT entry of `cluster`.
    fn entry(&self, cluster: u32) -> Result<u32, Error>;
}

impl FatTable for [u32] {
    fn entry(&self, cluster: u32) -> Result<u32, Error> {
        match self.get(cluster as usize) {
            Some(&v) => Ok(v),
            None => Err(Error::new(
                ErrorKind::InvalidInput,
                format!("cluster #{} is past the end of the FAT", cluster),
            )),
        }
    }
}

impl FatTable for Vec<u32> {
    fn entry(&self, cluster: u32) -> Result<u32, Error> {
        self.as_slice().entry(cluster)
    }
}

/// Reads FAT entries from a [`Device`] on demand.
///
/// The most recently read sector is kept so walking a chain does not read the same sector for
/// every entry.
pub struct DeviceFat<'a, D: Device + ?Sized> {
    device: &'a D,
    geometry: VolumeGeometry,
    index: usize,
    cache: RefCell<Option<(u64, Vec<u8>)>>,
}

impl<'a, D: Device + ?Sized> DeviceFat<'a, D> {
    /// Reads from FAT #`index`.
    pub fn new(device: &'a D, geometry: &VolumeGeometry, index: usize) -> Self {
        Self {
            device,
            geometry: *geometry,
            index,
            cache: RefCell::new(None),
        }
    }

    /// Reads from the FAT selected by ActiveFat.
    pub fn active(device: &'a D, geometry: &VolumeGeometry) -> Self {
        Self::new(device, geometry, geometry.active_fat())
    }
}

impl<'a, D: Device + ?Sized> FatTable for DeviceFat<'a, D> {
    fn entry(&self, cluster: u32) -> Result<u32, Error> {
        let geometry = &self.geometry;
        let offset = u64::from(cluster) * 4;
        let fat_size = u64::from(geometry.fat_length()) * geometry.bytes_per_sector();

        if offset + 4 > fat_size {
            return Err(Error::new(
                ErrorKind::InvalidInput,
                format!("cluster #{} is past the end of the FAT", cluster),
            ));
        }

        // Load the sector that contains the entry.
        let sector = geometry.fat_sector(self.index) + (offset >> geometry.bytes_per_sector_shift());
        let within = (offset & (geometry.bytes_per_sector() - 1)) as usize;
        let mut cache = self.cache.borrow_mut();

        match cache.as_ref() {
            Some((s, _)) if *s == sector => {}
            _ => {
                let mut data = vec![0u8; geometry.bytes_per_sector() as usize];

                self.device.read_sectors(geometry, sector, &mut data)?;
                *cache = Some((sector, data));
            }
        }

        match cache.as_ref() {
            Some((_, data)) => Ok(LE::read_u32(&data[within..])),
            None => unreachable!(),
        }
    }
}

/// Iterator over the clusters of a FAT chain.
///
/// The walk stops at the end-of-chain marker. A bad or reserved marker, a free entry, a link
/// outside of the cluster heap or a link to an already visited cluster stops it too and marks
/// the chain as broken. The cluster whose entry holds the faulty value is still yielded.
pub struct ClusterChain<'a, F: FatTable + ?Sized> {
    fat: &'a F,
    geometry: &'a VolumeGeometry,
    next: Option<u32>,
    visited: HashSet<u32>,
    broken: bool,
}

impl<'a, F: FatTable + ?Sized> ClusterChain<'a, F> {
    pub fn new(fat: &'a F, geometry: &'a VolumeGeometry, first: u32) -> Self {
        Self {
            fat,
            geometry,
            next: Some(first),
            visited: HashSet::new(),
            broken: false,
        }
    }

    /// Returns `true` if the walk stopped without reaching the end-of-chain marker.
    pub fn is_broken(&self) -> bool {
        self.broken
    }

    fn stop(&mut self, cluster: u32, reason: &str) {
        debug!("cluster chain is broken at cluster #{}: {}", cluster, reason);
        self.broken = true;
    }
}

impl<'a, F: FatTable + ?Sized> Iterator for ClusterChain<'a, F> {
    type Item = Result<u32, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        let cluster = self.next.take()?;

        if !self.geometry.is_valid_cluster(cluster) {
            self.stop(cluster, "not in the cluster heap");
            return None;
        } else if !self.visited.insert(cluster) {
            self.stop(cluster, "already visited");
            return None;
        }

        // Get the link to the next cluster.
        let value = match self.fat.entry(cluster) {
            Ok(v) => v,
            Err(e) => return Some(Err(e)),
        };

        match value {
            FAT_END_OF_CHAIN => {}
            FAT_FREE => self.stop(cluster, "entry is free"),
            FAT_BAD => self.stop(cluster, "cluster is bad"),
            v if v > FAT_BAD => self.stop(cluster, "entry is reserved"),
            v => self.next = Some(v),
        }

        Some(Ok(cluster))
    }
}

/// Clusters that make up an allocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Clusters {
    clusters: Vec<u32>,
    broken: bool,
}

impl Clusters {
    pub fn new(clusters: Vec<u32>, broken: bool) -> Self {
        Self { clusters, broken }
    }

    pub fn clusters(&self) -> &[u32] {
        &self.clusters
    }

    pub fn into_clusters(self) -> Vec<u32> {
        self.clusters
    }

    pub fn len(&self) -> usize {
        self.clusters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clusters.is_empty()
    }

    /// Returns `true` if the enumeration stopped before the end of the allocation.
    pub fn is_broken(&self) -> bool {
        self.broken
    }
}

/// Collects the cluster chain that starts at `first`.
pub fn walk_chain<F>(fat: &F, geometry: &VolumeGeometry, first: u32) -> Result<Clusters, Error>
where
    F: FatTable + ?Sized,
{
    let mut chain = ClusterChain::new(fat, geometry, first);
    let mut clusters = Vec::new();

    for cluster in &mut chain {
        clusters.push(cluster?);
    }

    Ok(Clusters::new(clusters, chain.is_broken()))
}
