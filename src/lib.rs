//! AziHsm — firmware-phase driver for the Azure Integrated HSM PCI function
//!
//! [`hsm::Controller`] is the entry point: `bind_start` brings the
//! controller from reset to HSM-ready against a platform-supplied
//! [`hsm::dma::PciIo`], and its DDI methods drive BKS3 provisioning and
//! retrieval. PCI bus enumeration, interrupt routing, and UEFI driver
//! binding protocol installation are the embedding firmware's concern, not
//! this crate's.

#![cfg_attr(not(test), no_std)]
#![allow(dead_code)]
#![allow(unsafe_op_in_unsafe_fn)]

// No heap allocator exists pre-OS; production code uses fixed-capacity
// buffers (heapless) throughout. Unit tests run on the host test harness
// (linked against std, see the `cfg_attr` above) which does provide an
// allocator, and the DMA simulation harness in `hsm::dma::test_support`
// uses it.
#[cfg(test)]
extern crate alloc;

pub mod arch;
pub mod error;
pub mod hsm;
pub mod logger;
pub mod time;

use core::panic::PanicInfo;

/// Global panic handler: log the location and message, then halt.
///
/// Only compiled outside `cfg(test)` — the host test harness supplies its
/// own via `std`, and defining both is a duplicate-lang-item error.
#[cfg(not(test))]
#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    if let Some(location) = info.location() {
        log::error!(
            "PANIC at {}:{}: {}",
            location.file(),
            location.line(),
            info.message()
        );
    } else {
        log::error!("PANIC: {}", info.message());
    }

    loop {
        #[cfg(target_arch = "x86_64")]
        arch::x86_64::halt();
    }
}
