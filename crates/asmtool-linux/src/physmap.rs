//! Physical memory mapping for MMIO access
//!
//! Maps a range of physical memory through `/dev/mem`. Used to read the
//! controller's BAR-decoded register window.
//!
//! # Safety
//!
//! Accessing physical memory is inherently unsafe and requires root
//! privileges. The mapping is read-only and uncached (`O_SYNC`).

use std::fs::OpenOptions;
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;

use asmtool_core::MmioRegion;

use crate::error::LinuxPciError;

/// A mapped region of physical memory; unmapped on drop
pub struct PhysMap {
    /// Start of the page-aligned mapping
    base: *mut u8,
    /// Length of the page-aligned mapping
    map_len: usize,
    /// Offset of `phys_addr` within the first page
    offset: usize,
    /// Requested size
    size: usize,
    phys_addr: u64,
}

fn page_size() -> usize {
    // SAFETY: sysconf has no preconditions
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 {
        size as usize
    } else {
        4096
    }
}

impl PhysMap {
    /// Map `size` bytes of physical memory starting at `phys_addr`
    pub fn new(phys_addr: u64, size: usize) -> Result<Self, LinuxPciError> {
        let map_err = |source: io::Error| LinuxPciError::MemoryMap {
            address: phys_addr,
            size,
            source,
        };

        let file = OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_SYNC)
            .open("/dev/mem")
            .map_err(map_err)?;

        let page_mask = page_size() - 1;
        let offset = (phys_addr as usize) & page_mask;
        let aligned_addr = phys_addr & !(page_mask as u64);
        let map_len = (size + offset + page_mask) & !page_mask;

        // SAFETY: fresh shared read-only mapping of a file descriptor we own;
        // the result is checked against MAP_FAILED below
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                map_len,
                libc::PROT_READ,
                libc::MAP_SHARED,
                file.as_raw_fd(),
                aligned_addr as libc::off_t,
            )
        };

        if ptr == libc::MAP_FAILED {
            return Err(map_err(io::Error::last_os_error()));
        }

        log::debug!(
            "Mapped {:#x} bytes at {:#x} ({:#x} page-aligned)",
            size,
            phys_addr,
            map_len
        );

        Ok(Self {
            base: ptr as *mut u8,
            map_len,
            offset,
            size,
            phys_addr,
        })
    }

    /// Read an 8-bit value from the mapped region
    #[inline]
    pub fn read8(&self, offset: usize) -> u8 {
        assert!(offset < self.size, "read outside mapped window");
        // SAFETY: offset is within the requested range, which lies inside
        // the live mapping
        unsafe { core::ptr::read_volatile(self.base.add(self.offset + offset)) }
    }
}

impl MmioRegion for PhysMap {
    fn phys_addr(&self) -> u64 {
        self.phys_addr
    }

    fn size(&self) -> usize {
        self.size
    }

    fn read8(&self, offset: usize) -> u8 {
        PhysMap::read8(self, offset)
    }
}

impl Drop for PhysMap {
    fn drop(&mut self) {
        // SAFETY: base/map_len are exactly what mmap returned
        let rc = unsafe { libc::munmap(self.base as *mut libc::c_void, self.map_len) };
        if rc != 0 {
            log::warn!(
                "munmap of {:#x} failed: {}",
                self.phys_addr,
                io::Error::last_os_error()
            );
        }
    }
}
