use crate::boot::VolumeGeometry;
use std::io::{Error, ErrorKind, Read, Seek, SeekFrom};
use std::sync::Mutex;

/// Source of the raw bytes of an exFAT volume.
///
/// Errors returned by the implementation are passed to the caller unchanged.
pub trait Device {
    /// Fill `buf` from data at byte `offset` of the volume.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<(), Error>;

    /// Fill `buf` starting at `sector`.
    fn read_sectors(
        &self,
        geometry: &VolumeGeometry,
        sector: u64,
        buf: &mut [u8],
    ) -> Result<(), Error> {
        let offset = match sector.checked_mul(geometry.bytes_per_sector()) {
            Some(v) => v,
            None => {
                return Err(Error::new(
                    ErrorKind::InvalidInput,
                    format!("sector #{} is not addressable", sector),
                ));
            }
        };

        self.read_at(offset, buf)
    }

    /// Fill `buf` starting at `cluster`.
    fn read_cluster(
        &self,
        geometry: &VolumeGeometry,
        cluster: u32,
        buf: &mut [u8],
    ) -> Result<(), Error> {
        let offset = match geometry.cluster_byte_offset(cluster) {
            Some(v) => v,
            None => {
                return Err(Error::new(
                    ErrorKind::InvalidInput,
                    format!("cluster #{} is not available", cluster),
                ));
            }
        };

        self.read_at(offset, buf)
    }
}

impl<D: Device + ?Sized> Device for &D {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<(), Error> {
        (**self).read_at(offset, buf)
    }
}

/// A [`Device`] over an in-memory image.
#[derive(Debug, Clone, Copy)]
pub struct SliceDevice<'image> {
    image: &'image [u8],
}

impl<'image> SliceDevice<'image> {
    pub fn new(image: &'image [u8]) -> Self {
        Self { image }
    }
}

impl<'image> Device for SliceDevice<'image> {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<(), Error> {
        let data = usize::try_from(offset)
            .ok()
            .and_then(|o| self.image.get(o..(o.checked_add(buf.len())?)));

        match data {
            Some(v) => {
                buf.copy_from_slice(v);
                Ok(())
            }
            None => Err(Error::new(
                ErrorKind::UnexpectedEof,
                format!("{} bytes at {:#x} is outside of the image", buf.len(), offset),
            )),
        }
    }
}

/// A [`Device`] over a seekable reader such as an image file.
pub struct ReaderDevice<R: Read + Seek> {
    reader: Mutex<R>,
}

impl<R: Read + Seek> ReaderDevice<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader: Mutex::new(reader),
        }
    }

    pub fn into_inner(self) -> R {
        self.reader
            .into_inner()
            .unwrap_or_else(|e| e.into_inner())
    }
}

impl<R: Read + Seek> Device for ReaderDevice<R> {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<(), Error> {
        let mut reader = self.reader.lock().unwrap_or_else(|e| e.into_inner());

        reader.seek(SeekFrom::Start(offset))?;
        reader.read_exact(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::boot::BootSector;
    use crate::testing::BootBuilder;
    use std::io::Cursor;

    #[test]
    fn slice_bounds() {
        let image: Vec<u8> = (0..=255).collect();
        let device = SliceDevice::new(&image);
        let mut buf = [0u8; 4];

        device.read_at(252, &mut buf).unwrap();

        assert_eq!(buf, [252, 253, 254, 255]);
        assert_eq!(
            device.read_at(253, &mut buf).unwrap_err().kind(),
            ErrorKind::UnexpectedEof
        );
        assert!(device.read_at(u64::MAX, &mut buf).is_err());
    }

    #[test]
    fn cluster_addressing() {
        let boot = BootBuilder::new()
            .fat(1, 1)
            .heap_offset(4)
            .cluster_count(2)
            .build();
        let geometry = *BootSector::parse(&boot).unwrap().geometry();
        let mut image = vec![0u8; 512 * 6];

        image[512 * 5] = 0xab;

        let device = ReaderDevice::new(Cursor::new(image));
        let mut buf = [0u8; 1];

        device.read_cluster(&geometry, 3, &mut buf).unwrap();

        assert_eq!(buf[0], 0xab);
        assert_eq!(
            device.read_cluster(&geometry, 4, &mut buf).unwrap_err().kind(),
            ErrorKind::InvalidInput
        );

        device.read_sectors(&geometry, 5, &mut buf).unwrap();

        assert_eq!(buf[0], 0xab);
    }
}
