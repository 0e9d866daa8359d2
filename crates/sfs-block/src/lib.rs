#![forbid(unsafe_code)]
//! Sector-granular device access for btree node extents.
//!
//! Provides the `SectorDevice` trait with `&Cx` capability context for
//! cooperative cancellation, an in-memory device for tests and crash
//! simulation, and a file-backed device using positioned I/O.

use asupersync::Cx;
use parking_lot::Mutex;
use sfs_error::{Result, StoreError};
use sfs_types::{DeviceIdx, SectorAddr};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use tracing::trace;

/// Bytes per sector.
pub const SECTOR_BYTES: usize = 512;

#[inline]
fn cx_checkpoint(cx: &Cx) -> Result<()> {
    cx.checkpoint().map_err(|_| StoreError::Cancelled)
}

/// Multi-device sector I/O. One extent per btree node replica.
pub trait SectorDevice: Send + Sync {
    /// Read `buf.len()` bytes starting at `addr` on device `dev`.
    fn read_extent(&self, cx: &Cx, dev: DeviceIdx, addr: SectorAddr, buf: &mut [u8])
        -> Result<()>;

    /// Write `buf` starting at `addr` on device `dev`.
    fn write_extent(&self, cx: &Cx, dev: DeviceIdx, addr: SectorAddr, buf: &[u8]) -> Result<()>;

    /// Flush device caches.
    fn sync(&self, cx: &Cx) -> Result<()>;

    /// Number of member devices.
    fn nr_devices(&self) -> u8;
}

fn byte_offset(addr: SectorAddr) -> Result<u64> {
    addr.0
        .checked_mul(SECTOR_BYTES as u64)
        .ok_or_else(|| StoreError::Corruption {
            location: format!("sector {}", addr.0),
            detail: "byte offset overflows u64".to_owned(),
        })
}

/// In-memory device: one extent map per member device.
///
/// Writes replace whole extents keyed by their starting sector, which is
/// exactly how btree nodes are written; reads must start at a previously
/// written extent. Good enough for the engine and for crash-shaped tests
/// that snapshot device state between commits.
pub struct MemSectorDevice {
    nr_devices: u8,
    extents: Mutex<HashMap<(u8, u64), Vec<u8>>>,
}

impl MemSectorDevice {
    #[must_use]
    pub fn new(nr_devices: u8) -> Self {
        assert!(nr_devices > 0);
        Self {
            nr_devices,
            extents: Mutex::new(HashMap::new()),
        }
    }

    /// Snapshot the full device contents (for recovery tests).
    #[must_use]
    pub fn snapshot(&self) -> HashMap<(u8, u64), Vec<u8>> {
        self.extents.lock().clone()
    }

    /// Restore contents captured by [`MemSectorDevice::snapshot`].
    pub fn restore(&self, snap: HashMap<(u8, u64), Vec<u8>>) {
        *self.extents.lock() = snap;
    }

    /// Number of distinct extents currently stored.
    #[must_use]
    pub fn nr_extents(&self) -> usize {
        self.extents.lock().len()
    }
}

impl SectorDevice for MemSectorDevice {
    fn read_extent(
        &self,
        cx: &Cx,
        dev: DeviceIdx,
        addr: SectorAddr,
        buf: &mut [u8],
    ) -> Result<()> {
        cx_checkpoint(cx)?;
        let extents = self.extents.lock();
        let data = extents
            .get(&(dev.0, addr.0))
            .ok_or_else(|| StoreError::Corruption {
                location: format!("dev {} sector {}", dev.0, addr.0),
                detail: "read of unwritten extent".to_owned(),
            })?;
        if data.len() < buf.len() {
            return Err(StoreError::Corruption {
                location: format!("dev {} sector {}", dev.0, addr.0),
                detail: format!("extent holds {} bytes, read wants {}", data.len(), buf.len()),
            });
        }
        buf.copy_from_slice(&data[..buf.len()]);
        Ok(())
    }

    fn write_extent(&self, cx: &Cx, dev: DeviceIdx, addr: SectorAddr, buf: &[u8]) -> Result<()> {
        cx_checkpoint(cx)?;
        trace!(
            target: "sfs::block",
            event = "extent_write",
            dev = dev.0,
            sector = addr.0,
            bytes = buf.len()
        );
        self.extents.lock().insert((dev.0, addr.0), buf.to_vec());
        Ok(())
    }

    fn sync(&self, cx: &Cx) -> Result<()> {
        cx_checkpoint(cx)
    }

    fn nr_devices(&self) -> u8 {
        self.nr_devices
    }
}

/// File-backed device. Member devices are striped into one file at a
/// fixed per-device byte span.
///
/// Uses `std::os::unix::fs::FileExt`, which is thread-safe and does not
/// move a shared cursor.
pub struct FileSectorDevice {
    file: File,
    nr_devices: u8,
    device_span_bytes: u64,
}

impl FileSectorDevice {
    pub fn create(path: impl AsRef<Path>, nr_devices: u8, device_span_bytes: u64) -> Result<Self> {
        assert!(nr_devices > 0);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        file.set_len(u64::from(nr_devices) * device_span_bytes)?;
        Ok(Self {
            file,
            nr_devices,
            device_span_bytes,
        })
    }

    fn offset(&self, dev: DeviceIdx, addr: SectorAddr, len: usize) -> Result<u64> {
        assert!(dev.0 < self.nr_devices, "device index out of range");
        let within = byte_offset(addr)?;
        within
            .checked_add(len as u64)
            .filter(|&end| end <= self.device_span_bytes)
            .ok_or_else(|| StoreError::Corruption {
                location: format!("dev {} sector {}", dev.0, addr.0),
                detail: "extent past end of device span".to_owned(),
            })?;
        Ok(u64::from(dev.0) * self.device_span_bytes + within)
    }
}

impl SectorDevice for FileSectorDevice {
    fn read_extent(
        &self,
        cx: &Cx,
        dev: DeviceIdx,
        addr: SectorAddr,
        buf: &mut [u8],
    ) -> Result<()> {
        cx_checkpoint(cx)?;
        let off = self.offset(dev, addr, buf.len())?;
        self.file.read_exact_at(buf, off)?;
        Ok(())
    }

    fn write_extent(&self, cx: &Cx, dev: DeviceIdx, addr: SectorAddr, buf: &[u8]) -> Result<()> {
        cx_checkpoint(cx)?;
        let off = self.offset(dev, addr, buf.len())?;
        self.file.write_all_at(buf, off)?;
        Ok(())
    }

    fn sync(&self, cx: &Cx) -> Result<()> {
        cx_checkpoint(cx)?;
        self.file.sync_data()?;
        Ok(())
    }

    fn nr_devices(&self) -> u8 {
        self.nr_devices
    }
}
