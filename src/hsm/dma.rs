//! DMA buffer provider
//!
//! A page-aligned, device-visible memory region: a host-side pointer and a
//! device-side physical address that alias the same storage, zeroed on
//! allocation, released exactly once.

use crate::error::{AziHsmError, Result};

/// The bus-master capability this driver borrows from the upstream VPCI
/// VSC. The driver-model shell and bus enumeration that produce this
/// capability are out of scope here; only the operations the core needs
/// from it are modeled.
///
/// A real implementation backs this with the firmware's `EFI_PCI_IO_PROTOCOL`
/// (`AllocateBuffer`/`Map`/`Unmap`/`FreeBuffer` for DMA, plus register
/// read/write for `hsm::regs`). Tests back it with an in-memory simulator.
pub trait PciIo {
    /// Allocate `pages` pages of bus-master common-buffer memory and
    /// return the host-visible pointer.
    fn allocate_buffer(&self, pages: usize) -> Result<*mut u8>;

    /// Release memory previously returned by `allocate_buffer`.
    ///
    /// # Safety
    /// `host_address` must be a pointer previously returned by
    /// `allocate_buffer` on the same `pages` count, not already freed.
    unsafe fn free_buffer(&self, pages: usize, host_address: *mut u8);

    /// Map a host buffer for bus-master common-buffer access, returning the
    /// device-visible physical address and an opaque mapping token.
    ///
    /// # Safety
    /// `host_address` must be valid for `len` bytes for the lifetime of the
    /// mapping.
    unsafe fn map(&self, host_address: *mut u8, len: usize) -> Result<(u64, usize)>;

    /// Release a mapping previously returned by `map`.
    fn unmap(&self, mapping: usize);

    /// Read a register from the HCI BAR at `offset`.
    fn mmio_read32(&self, bar: u8, offset: usize) -> u32;
    fn mmio_read64(&self, bar: u8, offset: usize) -> u64;
    /// Write a register in the HCI BAR at `offset`.
    fn mmio_write32(&self, bar: u8, offset: usize, value: u32);
    fn mmio_write64(&self, bar: u8, offset: usize, value: u64);
}

const PAGE_SIZE: usize = 4096;

/// A contiguous, page-multiple region jointly accessible to host and
/// device. `alloc` zeroes it; `free` releases it and clears every field so
/// a double-free is observable rather than silently repeated.
pub struct DmaBuffer {
    host_address: *mut u8,
    device_address: u64,
    size: usize,
    mapping: usize,
    pages: usize,
}

// SAFETY: the buffer names a region the device may write to at any time;
// callers are responsible for synchronizing access through volatile
// reads/writes (see `hsm::queue`). The struct itself holds no borrowed
// non-Send/Sync state beyond a raw pointer and integers.
unsafe impl Send for DmaBuffer {}

impl DmaBuffer {
    /// Allocate `pages * page_size` bytes of bus-master common-buffer
    /// memory, map it, zero it. On failure of the map step, the just
    /// allocated buffer is released before returning the error.
    pub fn alloc(pci: &dyn PciIo, pages: usize) -> Result<Self> {
        if pages == 0 {
            return Err(AziHsmError::InvalidParameter);
        }

        let host_address = pci.allocate_buffer(pages)?;

        // SAFETY: host_address was just returned by allocate_buffer for
        // `pages` pages, which is `pages * PAGE_SIZE` bytes.
        let map_result = unsafe { pci.map(host_address, pages * PAGE_SIZE) };
        let (device_address, mapping) = match map_result {
            Ok(v) => v,
            Err(e) => {
                // SAFETY: host_address was allocated for `pages` pages and
                // is being freed exactly once here.
                unsafe { pci.free_buffer(pages, host_address) };
                return Err(e);
            }
        };

        let size = pages * PAGE_SIZE;
        // SAFETY: host_address is valid for `size` bytes, freshly mapped,
        // exclusively owned by this buffer until freed.
        unsafe {
            core::ptr::write_bytes(host_address, 0, size);
        }

        Ok(DmaBuffer {
            host_address,
            device_address,
            size,
            mapping,
            pages,
        })
    }

    /// Unmap, free, and clear every field of this buffer. Idempotent: a
    /// buffer that has already been released (host pointer null) is a
    /// no-op.
    pub fn free(&mut self, pci: &dyn PciIo) {
        if self.mapping != 0 || self.device_address != 0 {
            pci.unmap(self.mapping);
        }
        if !self.host_address.is_null() {
            // SAFETY: host_address was returned by allocate_buffer for
            // `self.pages` pages and has not been freed before (guarded by
            // the null check above).
            unsafe {
                pci.free_buffer(self.pages, self.host_address);
            }
        }
        self.host_address = core::ptr::null_mut();
        self.device_address = 0;
        self.size = 0;
        self.mapping = 0;
        self.pages = 0;
    }

    pub fn host_ptr(&self) -> *mut u8 {
        self.host_address
    }

    pub fn device_address(&self) -> u64 {
        self.device_address
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Volatile write of `bytes` at the start of this buffer. Used by the
    /// producer side of a queue pair to post an SQE, and by DDI entry
    /// points to stage an encoded request.
    pub fn write_volatile(&mut self, offset: usize, bytes: &[u8]) {
        debug_assert!(offset + bytes.len() <= self.size);
        for (i, b) in bytes.iter().enumerate() {
            // SAFETY: offset + i < self.size, within the allocated region.
            unsafe {
                core::ptr::write_volatile(self.host_address.add(offset + i), *b);
            }
        }
    }

    /// Volatile read of `len` bytes starting at `offset` into `out`. Used
    /// to observe device-written completion data.
    pub fn read_volatile(&self, offset: usize, out: &mut [u8]) {
        debug_assert!(offset + out.len() <= self.size);
        for (i, b) in out.iter_mut().enumerate() {
            // SAFETY: offset + i < self.size, within the allocated region.
            unsafe {
                *b = core::ptr::read_volatile(self.host_address.add(offset + i));
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use alloc::alloc::{alloc_zeroed, dealloc, Layout};
    use spin::Mutex;

    /// A fake `PciIo` backed by the host allocator, for unit tests. BAR 0
    /// (the HCI register block) and BAR 2 (the doorbell array) are
    /// distinct register files — a real device decodes them off separate
    /// base addresses, and a shared backing array would let a doorbell
    /// write at offset 0 silently corrupt `CAP` (also at offset 0).
    pub struct FakePciIo {
        bar0: Mutex<[u8; 256]>,
        bar2: Mutex<[u8; 256]>,
    }

    impl FakePciIo {
        pub fn new() -> Self {
            FakePciIo { bar0: Mutex::new([0u8; 256]), bar2: Mutex::new([0u8; 256]) }
        }

        fn bar(&self, bar: u8) -> &Mutex<[u8; 256]> {
            match bar {
                0 => &self.bar0,
                2 => &self.bar2,
                _ => panic!("FakePciIo: unexpected BAR index {bar}"),
            }
        }
    }

    impl PciIo for FakePciIo {
        fn allocate_buffer(&self, pages: usize) -> Result<*mut u8> {
            let layout = Layout::from_size_align(pages * PAGE_SIZE, PAGE_SIZE).unwrap();
            // SAFETY: layout has non-zero size.
            let ptr = unsafe { alloc_zeroed(layout) };
            if ptr.is_null() {
                Err(AziHsmError::OutOfResources)
            } else {
                Ok(ptr)
            }
        }

        unsafe fn free_buffer(&self, pages: usize, host_address: *mut u8) {
            let layout = Layout::from_size_align(pages * PAGE_SIZE, PAGE_SIZE).unwrap();
            dealloc(host_address, layout);
        }

        unsafe fn map(&self, host_address: *mut u8, _len: usize) -> Result<(u64, usize)> {
            Ok((host_address as u64, host_address as usize))
        }

        fn unmap(&self, _mapping: usize) {}

        fn mmio_read32(&self, bar: u8, offset: usize) -> u32 {
            let regs = self.bar(bar).lock();
            u32::from_le_bytes(regs[offset..offset + 4].try_into().unwrap())
        }

        fn mmio_read64(&self, bar: u8, offset: usize) -> u64 {
            let regs = self.bar(bar).lock();
            u64::from_le_bytes(regs[offset..offset + 8].try_into().unwrap())
        }

        fn mmio_write32(&self, bar: u8, offset: usize, value: u32) {
            let mut regs = self.bar(bar).lock();
            regs[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
        }

        fn mmio_write64(&self, bar: u8, offset: usize, value: u64) {
            let mut regs = self.bar(bar).lock();
            regs[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::FakePciIo;
    use super::*;

    #[test]
    fn alloc_zeroes_and_free_clears_every_field() {
        let pci = FakePciIo::new();
        let mut buf = DmaBuffer::alloc(&pci, 1).unwrap();
        assert_ne!(buf.host_ptr(), core::ptr::null_mut());
        assert_ne!(buf.device_address(), 0);
        assert_eq!(buf.size(), PAGE_SIZE);

        let mut check = [0u8; 16];
        buf.read_volatile(0, &mut check);
        assert_eq!(check, [0u8; 16]);

        buf.free(&pci);
        assert_eq!(buf.host_ptr(), core::ptr::null_mut());
        assert_eq!(buf.device_address(), 0);
        assert_eq!(buf.size(), 0);
    }

    #[test]
    fn free_is_idempotent() {
        let pci = FakePciIo::new();
        let mut buf = DmaBuffer::alloc(&pci, 1).unwrap();
        buf.free(&pci);
        buf.free(&pci);
    }

    #[test]
    fn zero_pages_is_invalid_parameter() {
        let pci = FakePciIo::new();
        assert_eq!(DmaBuffer::alloc(&pci, 0).unwrap_err(), AziHsmError::InvalidParameter);
    }
}
