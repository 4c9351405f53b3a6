//! Submission/completion queue pair
//!
//! A fixed-slot-count producer/consumer pair backed by two DMA buffers.
//! Slot count is parametrized (`slot_count`) rather than hard-coded to the
//! historical `AZIHSM_QUEUE_SIZE = 1` (two slots via `^= 1`) so deeper
//! queues can be exercised in tests; production bring-up still uses two
//! slots per pair, matching the device.

use crate::error::{AziHsmError, Result};
use crate::hsm::dma::{DmaBuffer, PciIo};

/// A queue pair's per-command-exchange state. Mirrors spec §4.9: each
/// pair carries exactly one command in flight at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueState {
    Idle,
    Posted,
    Completed,
    /// Terminal: a poll timed out. The pair must not be reused.
    Faulted,
}

struct Ring {
    buffer: DmaBuffer,
    slot_count: u16,
    entry_size: usize,
    index: u16,
}

impl Ring {
    fn slot_offset(&self, idx: u16) -> usize {
        idx as usize * self.entry_size
    }

    fn advance(idx: u16, slot_count: u16) -> u16 {
        (idx + 1) % slot_count
    }
}

/// One submission queue and one completion queue sharing a queue id.
pub struct QueuePair {
    pub id: u16,
    pub doorbell_stride: u32,
    phase: u8,
    state: QueueState,
    sq: Ring,
    cq: Ring,
}

impl QueuePair {
    /// Allocate the SQ and CQ DMA buffers (one page each), zero head and
    /// tail, stamp the queue id, doorbell stride, and phase to zero. On
    /// failure of the CQ allocation, the SQ buffer is released.
    pub fn init(
        pci: &dyn PciIo,
        queue_id: u16,
        slot_count: u16,
        sqe_size: usize,
        cqe_size: usize,
        doorbell_stride: u32,
    ) -> Result<Self> {
        if slot_count == 0 {
            return Err(AziHsmError::InvalidParameter);
        }

        let sq_buffer = DmaBuffer::alloc(pci, 1)?;
        let cq_buffer = match DmaBuffer::alloc(pci, 1) {
            Ok(b) => b,
            Err(e) => {
                let mut sq_buffer = sq_buffer;
                sq_buffer.free(pci);
                return Err(e);
            }
        };

        Ok(QueuePair {
            id: queue_id,
            doorbell_stride,
            phase: 0,
            state: QueueState::Idle,
            sq: Ring {
                buffer: sq_buffer,
                slot_count,
                entry_size: sqe_size,
                index: 0,
            },
            cq: Ring {
                buffer: cq_buffer,
                slot_count,
                entry_size: cqe_size,
                index: 0,
            },
        })
    }

    /// Free both DMA buffers. Tolerant of a zero-initialized pair (free is
    /// idempotent on an empty buffer).
    pub fn uninit(&mut self, pci: &dyn PciIo) {
        self.sq.buffer.free(pci);
        self.cq.buffer.free(pci);
        self.state = QueueState::Idle;
    }

    pub fn state(&self) -> QueueState {
        self.state
    }

    pub fn sq_tail(&self) -> u16 {
        self.sq.index
    }

    pub fn cq_head(&self) -> u16 {
        self.cq.index
    }

    pub fn slot_count(&self) -> u16 {
        self.sq.slot_count
    }

    /// Device-visible address of the SQ buffer, for programming ASQ (admin
    /// queue) or a `CreateSq` admin command (HSM queue).
    pub fn sq_device_address(&self) -> u64 {
        self.sq.buffer.device_address()
    }

    /// Device-visible address of the CQ buffer, for programming ACQ (admin
    /// queue) or a `CreateCq` admin command (HSM queue).
    pub fn cq_device_address(&self) -> u64 {
        self.cq.buffer.device_address()
    }

    /// Write `sqe` into the submission slot at `tail`, without advancing
    /// any index. Transition `Idle -> Posted` happens in the caller once
    /// the doorbell has also been rung (see `hsm::admin`/`hsm::cp`).
    pub fn post_sqe(&mut self, sqe: &[u8]) {
        debug_assert_eq!(sqe.len(), self.sq.entry_size);
        let off = self.sq.slot_offset(self.sq.index);
        self.sq.buffer.write_volatile(off, sqe);
    }

    /// Advance the SQ tail index and return the new value, for the
    /// doorbell write.
    pub fn advance_sq_tail(&mut self) -> u16 {
        self.sq.index = Ring::advance(self.sq.index, self.sq.slot_count);
        self.state = QueueState::Posted;
        self.sq.index
    }

    /// Read the phase byte (low bit of the status word) of the CQE
    /// currently at `head`, without advancing anything. Used to capture
    /// the "phase before post" baseline.
    pub fn cq_phase_at_head(&self) -> u8 {
        let off = self.cq.slot_offset(self.cq.index);
        let mut word = [0u8; 2];
        self.cq.buffer.read_volatile(off + self.cq.entry_size - 2, &mut word);
        (u16::from_le_bytes(word) & 0x1) as u8
    }

    /// Copy the CQE at `head` into `out`.
    pub fn read_cqe(&self, out: &mut [u8]) {
        debug_assert_eq!(out.len(), self.cq.entry_size);
        let off = self.cq.slot_offset(self.cq.index);
        self.cq.buffer.read_volatile(off, out);
    }

    /// Advance the CQ head index and return the new value, for the
    /// doorbell write. Transitions `Posted -> Completed -> Idle`.
    pub fn advance_cq_head(&mut self) -> u16 {
        self.cq.index = Ring::advance(self.cq.index, self.cq.slot_count);
        self.state = QueueState::Idle;
        self.cq.index
    }

    /// Mark this pair as faulted after a poll timeout. The pair must not
    /// be reused afterward.
    pub fn mark_faulted(&mut self) {
        self.state = QueueState::Faulted;
    }

    /// Write a raw completion entry into the slot currently at CQ head,
    /// simulating the device posting a completion. Test-only: production
    /// code never writes into its own completion queue.
    #[cfg(test)]
    pub fn simulate_cq_write(&mut self, cqe: &[u8]) {
        debug_assert_eq!(cqe.len(), self.cq.entry_size);
        let off = self.cq.slot_offset(self.cq.index);
        self.cq.buffer.write_volatile(off, cqe);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hsm::dma::test_support::FakePciIo;

    #[test]
    fn init_zeroes_indices_and_both_buffers() {
        let pci = FakePciIo::new();
        let qp = QueuePair::init(&pci, 0, 2, 64, 16, 0).unwrap();
        assert_eq!(qp.sq_tail(), 0);
        assert_eq!(qp.cq_head(), 0);
        assert_eq!(qp.cq_phase_at_head(), 0);
    }

    #[test]
    fn tail_and_head_advance_modulo_slot_count() {
        let pci = FakePciIo::new();
        let mut qp = QueuePair::init(&pci, 0, 2, 64, 16, 0).unwrap();
        assert_eq!(qp.advance_sq_tail(), 1);
        assert_eq!(qp.advance_sq_tail(), 0);
        assert_eq!(qp.advance_cq_head(), 1);
        assert_eq!(qp.advance_cq_head(), 0);
    }

    #[test]
    fn deeper_queue_advances_correctly() {
        let pci = FakePciIo::new();
        let mut qp = QueuePair::init(&pci, 0, 4, 64, 16, 0).unwrap();
        for expected in [1, 2, 3, 0] {
            assert_eq!(qp.advance_sq_tail(), expected);
        }
    }

    #[test]
    fn uninit_is_idempotent_on_already_freed_pair() {
        let pci = FakePciIo::new();
        let mut qp = QueuePair::init(&pci, 0, 2, 64, 16, 0).unwrap();
        qp.uninit(&pci);
        qp.uninit(&pci);
    }
}
