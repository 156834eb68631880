use crate::boot::VolumeGeometry;
use crate::entry::StreamEntry;
use crate::fat::{walk_chain, Clusters, DeviceFat, FatTable};
use crate::image::Device;
use log::{debug, warn};
use std::cmp::min;
use std::io::{Error, ErrorKind, Read};

/// Enumerates the clusters of a contiguous (NoFatChain) allocation without touching the FAT.
///
/// The run stops early and is marked broken if it leaves the cluster heap.
pub fn contiguous_clusters(geometry: &VolumeGeometry, first: u32, data_length: u64) -> Clusters {
    let count = geometry.clusters_for(data_length);
    let mut clusters = Vec::new();

    for i in 0..count {
        let cluster = match u32::try_from(u64::from(first) + i) {
            Ok(v) if geometry.is_valid_cluster(v) => v,
            _ => {
                debug!(
                    "contiguous run from cluster #{} leaves the cluster heap after {} clusters",
                    first, i
                );

                return Clusters::new(clusters, true);
            }
        };

        clusters.push(cluster);
    }

    Clusters::new(clusters, false)
}

/// Enumerates the clusters of a file from its stream extension.
///
/// A NoFatChain file never reads `fat`.
pub fn file_clusters<F>(
    fat: &F,
    geometry: &VolumeGeometry,
    stream: &StreamEntry,
) -> Result<Clusters, Error>
where
    F: FatTable + ?Sized,
{
    if stream.first_cluster() == 0 || stream.data_length() == 0 {
        return Ok(Clusters::default());
    }

    if stream.no_fat_chain() {
        Ok(contiguous_clusters(
            geometry,
            stream.first_cluster(),
            stream.data_length(),
        ))
    } else {
        walk_chain(fat, geometry, stream.first_cluster())
    }
}

/// Reads up to `length` bytes of a metadata allocation that starts at `first`.
///
/// The chain is taken from the active FAT. When it is broken before `length` is covered the
/// allocation is assumed to be contiguous. The result never extends past the cluster heap, so
/// callers bound `length` by what the structure can hold.
pub fn read_allocation<D>(
    geometry: &VolumeGeometry,
    device: &D,
    first: u32,
    length: u64,
) -> Result<Vec<u8>, Error>
where
    D: Device + ?Sized,
{
    let fat = DeviceFat::active(device, geometry);
    let chain = walk_chain(&fat, geometry, first)?;
    let available = chain.len() as u64 * geometry.cluster_size();
    let chain = if chain.is_broken() && available < length {
        warn!(
            "FAT chain from cluster #{} is broken after {} clusters, assuming contiguous clusters",
            first,
            chain.len()
        );

        contiguous_clusters(geometry, first, length)
    } else {
        chain
    };

    let length = length.min(chain.len() as u64 * geometry.cluster_size());
    let mut reader = ClustersReader::new(geometry, device, chain.into_clusters(), Some(length))?;
    let mut data = Vec::new();

    reader.read_to_end(&mut data)?;

    Ok(data)
}

/// A reader over the data of a list of clusters.
pub struct ClustersReader<'a, D: Device + ?Sized> {
    geometry: &'a VolumeGeometry,
    device: &'a D,
    chain: Vec<u32>,
    cluster_size: u64, // in bytes
    tail_size: u64,
    cluster: usize, // index into chain
    offset: u64,    // offset into current cluster
}

impl<'a, D: Device + ?Sized> ClustersReader<'a, D> {
    /// `data_length` limits the total size. [`None`] means the whole of every cluster.
    pub fn new(
        geometry: &'a VolumeGeometry,
        device: &'a D,
        chain: Vec<u32>,
        data_length: Option<u64>,
    ) -> Result<Self, Error> {
        let cluster_size = geometry.cluster_size();
        let capacity = cluster_size * chain.len() as u64;
        let data_length = match data_length {
            Some(v) if v > capacity => {
                return Err(Error::new(
                    ErrorKind::InvalidInput,
                    format!(
                        "data length {} does not fit in {} clusters",
                        v,
                        chain.len()
                    ),
                ));
            }
            Some(v) => v,
            None => capacity,
        };

        // Drop clusters past the data length.
        let mut chain = chain;

        chain.truncate(geometry.clusters_for(data_length) as usize);

        let tail_size = data_length % cluster_size;

        Ok(Self {
            geometry,
            device,
            chain,
            cluster_size,
            tail_size: if tail_size == 0 {
                cluster_size
            } else {
                tail_size
            },
            cluster: 0,
            offset: 0,
        })
    }

    /// Gets the cluster being read, or [`None`] at the end.
    pub fn cluster(&self) -> Option<u32> {
        self.chain.get(self.cluster).copied()
    }
}

impl<'a, D: Device + ?Sized> Read for ClustersReader<'a, D> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        // Check if the actual read is required.
        let cluster = match self.cluster() {
            Some(v) if !buf.is_empty() => v,
            _ => return Ok(0),
        };

        // Get cluster size.
        let cluster_size = if self.cluster == self.chain.len() - 1 {
            self.tail_size
        } else {
            self.cluster_size
        };

        // Read image.
        let offset = match self.geometry.cluster_byte_offset(cluster) {
            Some(v) => v + self.offset,
            None => {
                return Err(Error::new(
                    ErrorKind::InvalidInput,
                    format!("cluster #{} is not available", cluster),
                ));
            }
        };

        let remaining = cluster_size - self.offset;
        let target = min(buf.len() as u64, remaining) as usize;

        self.device.read_at(offset, &mut buf[..target])?;
        self.offset += target as u64;

        // Check if all data in the current cluster is read.
        if self.offset == cluster_size {
            self.cluster += 1;
            self.offset = 0;
        }

        Ok(target)
    }
}
