use log::warn;
use thiserror::Error;

/// Allocation Bitmap of the cluster heap. Bit 0 of byte 0 is cluster #2.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationBitmap {
    data: Vec<u8>,
    cluster_count: u32,
}

impl AllocationBitmap {
    /// Clusters not covered by `data` are reported as unallocated.
    pub fn new(mut data: Vec<u8>, cluster_count: u32) -> Self {
        let need = Self::size_for(cluster_count);

        if data.len() < need {
            warn!(
                "allocation bitmap has {} bytes but {} clusters need {}",
                data.len(),
                cluster_count,
                need
            );
        }

        data.truncate(need);

        Self {
            data,
            cluster_count,
        }
    }

    /// Number of bytes needed to cover `cluster_count` clusters.
    pub fn size_for(cluster_count: u32) -> usize {
        (cluster_count as usize).div_ceil(8)
    }

    pub fn cluster_count(&self) -> u32 {
        self.cluster_count
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Returns `true` if the bit for `cluster` is set.
    pub fn is_set(&self, cluster: u32) -> Result<bool, OutOfRange> {
        if cluster < 2 || u64::from(cluster) > u64::from(self.cluster_count) + 1 {
            return Err(OutOfRange(cluster));
        }

        let index = (cluster - 2) as usize;

        Ok(self
            .data
            .get(index / 8)
            .is_some_and(|&b| (b >> (index % 8)) & 1 != 0))
    }

    /// Number of clusters marked as allocated.
    pub fn allocated_count(&self) -> u64 {
        let full = (self.cluster_count / 8) as usize;
        let mut count: u64 = self
            .data
            .iter()
            .take(full)
            .map(|b| u64::from(b.count_ones()))
            .sum();

        // Ignore the padding bits of the last byte.
        let tail = self.cluster_count % 8;

        if tail != 0 {
            if let Some(&b) = self.data.get(full) {
                count += u64::from((b & ((1u8 << tail) - 1)).count_ones());
            }
        }

        count
    }
}

/// Represents an error when a cluster address is outside `[2, ClusterCount + 1]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("cluster #{0} is outside of the cluster heap")]
pub struct OutOfRange(pub u32);
