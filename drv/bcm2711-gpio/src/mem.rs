// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Peripheral register access via mapped device memory.
//!
//! The GPIO block is reachable through `/dev/gpiomem`, which any member of
//! the gpio group can open. The bus controller blocks (SPI, BSC) are only
//! visible through `/dev/mem`, which needs a root-equivalent capability;
//! when that mapping is unavailable the bus operations fail with
//! [`GpioError::DeviceAccess`] and everything else keeps working.

use std::ffi::CString;

use drv_gpio_api::GpioError;

/// One page-aligned window of peripheral registers, addressed in 32-bit
/// units.
pub struct MmioBlock {
    ptr: *mut u32,
    len: usize,
}

// The pointer refers to device memory valid for the life of the mapping;
// all access goes through volatile reads/writes.
unsafe impl Send for MmioBlock {}
unsafe impl Sync for MmioBlock {}

impl MmioBlock {
    /// Maps `len` bytes of `path` starting at byte `offset`. `offset` must
    /// be page aligned, which all peripheral block bases are.
    pub fn map(path: &str, offset: i64, len: usize) -> Result<Self, GpioError> {
        let cpath = CString::new(path).map_err(|_| GpioError::DeviceAccess)?;
        let fd = unsafe {
            libc::open(cpath.as_ptr(), libc::O_RDWR | libc::O_SYNC)
        };
        if fd < 0 {
            return Err(GpioError::DeviceAccess);
        }

        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                offset,
            )
        };
        // The mapping keeps its own reference; the descriptor is no longer
        // needed either way.
        unsafe {
            libc::close(fd);
        }
        if ptr == libc::MAP_FAILED {
            return Err(GpioError::DeviceAccess);
        }

        Ok(Self {
            ptr: ptr.cast::<u32>(),
            len,
        })
    }

    /// Reads the register at 32-bit index `idx`.
    pub fn read(&self, idx: usize) -> u32 {
        assert!(idx * 4 < self.len);
        unsafe { self.ptr.add(idx).read_volatile() }
    }

    /// Writes the register at 32-bit index `idx`.
    pub fn write(&self, idx: usize, value: u32) {
        assert!(idx * 4 < self.len);
        unsafe { self.ptr.add(idx).write_volatile(value) }
    }
}

impl Drop for MmioBlock {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr.cast(), self.len);
        }
    }
}
