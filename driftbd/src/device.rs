//! The backing device: a flat file accessed with positional I/O.
//!
//! The advertised size is fixed when the file is opened and rounded down
//! to whole 512-byte sectors; trailing partial sectors are never exposed.
//! Reads and writes use `pread`/`pwrite` style calls, so no seek position
//! is shared and reads need no locking. Write ordering across clients and
//! the migration relay is the handler's job, not ours.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use bytes::{Bytes, BytesMut};
use tracing::debug;

use crate::error::StoreError;

pub struct Device {
    file: File,
    size: u64,
    path: PathBuf,
}

impl Device {
    /// Open an existing backing file for serving.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        let raw_size = file.metadata()?.len();
        let size = nbd::round_to_sectors(raw_size);
        debug!(path = %path.display(), raw_size, size, "opened backing file");
        Ok(Self { file, size, path })
    }

    /// Advertised device size in bytes (sector-rounded).
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Validate that `offset..offset+len` lies within the device,
    /// rejecting arithmetic overflow as out-of-range.
    pub fn check_bounds(&self, offset: u64, len: u64) -> Result<(), StoreError> {
        match offset.checked_add(len) {
            Some(end) if end <= self.size => Ok(()),
            _ => Err(StoreError::OutOfBounds {
                offset,
                len,
                size: self.size,
            }),
        }
    }

    pub fn read_at(&self, offset: u64, len: usize) -> Result<Bytes, StoreError> {
        debug_assert!(self.check_bounds(offset, len as u64).is_ok());
        let mut buf = BytesMut::zeroed(len);
        self.file.read_exact_at(&mut buf, offset)?;
        Ok(buf.freeze())
    }

    pub fn write_at(&self, offset: u64, data: &[u8]) -> Result<(), StoreError> {
        debug_assert!(self.check_bounds(offset, data.len() as u64).is_ok());
        self.file.write_all_at(data, offset)?;
        Ok(())
    }

    /// Push the given range to stable storage before returning.
    ///
    /// `fdatasync` has no range granularity, so this is a whole-file data
    /// sync; the range is kept in the signature because it is what the
    /// FUA contract promises and a finer-grained backend could honor it.
    pub fn flush_range(&self, _offset: u64, _len: u64) -> Result<(), StoreError> {
        self.file.sync_data()?;
        Ok(())
    }

    pub fn flush_all(&self) -> Result<(), StoreError> {
        self.file.sync_data()?;
        Ok(())
    }

    /// Remove the backing file. Called after a successful handoff when
    /// the mirror was started with the unlink action.
    pub fn unlink(&self) -> Result<(), StoreError> {
        std::fs::remove_file(&self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn temp_device(len: usize) -> (tempfile::TempDir, Device) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.img");
        let mut f = File::create(&path).unwrap();
        f.write_all(&vec![0u8; len]).unwrap();
        (dir, Device::open(&path).unwrap())
    }

    #[test]
    fn size_rounds_down_to_sectors() {
        let (_dir, dev) = temp_device(1000);
        assert_eq!(dev.size(), 512);
        let (_dir, dev) = temp_device(4096);
        assert_eq!(dev.size(), 4096);
    }

    #[test]
    fn write_then_read_roundtrips() {
        let (_dir, dev) = temp_device(4096);
        dev.write_at(512, &[0xAB; 512]).unwrap();
        let data = dev.read_at(512, 512).unwrap();
        assert_eq!(&data[..], &[0xAB; 512]);
        // neighbors untouched
        assert_eq!(&dev.read_at(0, 512).unwrap()[..], &[0u8; 512]);
        assert_eq!(&dev.read_at(1024, 512).unwrap()[..], &[0u8; 512]);
    }

    #[test]
    fn bounds_check_rejects_past_end() {
        let (_dir, dev) = temp_device(4096);
        assert!(dev.check_bounds(0, 4096).is_ok());
        assert!(dev.check_bounds(4096, 0).is_ok());
        assert!(matches!(
            dev.check_bounds(4096, 1),
            Err(StoreError::OutOfBounds { .. })
        ));
        assert!(matches!(
            dev.check_bounds(1, 4096),
            Err(StoreError::OutOfBounds { .. })
        ));
    }

    #[test]
    fn bounds_check_rejects_overflow() {
        let (_dir, dev) = temp_device(4096);
        assert!(dev.check_bounds(u64::MAX, 2).is_err());
    }

    #[test]
    fn unlink_removes_the_file() {
        let (_dir, dev) = temp_device(512);
        let path = dev.path().to_path_buf();
        assert!(path.exists());
        dev.unlink().unwrap();
        assert!(!path.exists());
    }
}
