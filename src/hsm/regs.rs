//! HCI register layout
//!
//! BAR 0 carries the controller register block (CAP/VER/CFG/STS/AQA/ASQ/
//! ACQ); BAR 2 carries a linear doorbell array. Field layout is taken
//! verbatim from the device's register map.

use tock_registers::register_bitfields;
use tock_registers::LocalRegisterCopy;

use crate::error::{AziHsmError, Result};
use crate::hsm::dma::PciIo;

pub const PCI_BAR_INDEX: u8 = 0;
pub const DB_BAR_INDEX: u8 = 2;

pub const CAP_OFFSET: usize = 0x0000;
pub const VER_OFFSET: usize = 0x0008;
pub const CFG_OFFSET: usize = 0x0014;
pub const STS_OFFSET: usize = 0x001C;
pub const AQA_OFFSET: usize = 0x0024;
pub const ASQ_OFFSET: usize = 0x0028;
pub const ACQ_OFFSET: usize = 0x0030;

register_bitfields! [
    u64,
    /// Controller Capabilities (CAP, 0x00)
    pub CAP [
        MQES OFFSET(0) NUMBITS(16) [],
        CQR OFFSET(16) NUMBITS(1) [],
        AMS OFFSET(17) NUMBITS(2) [],
        TO OFFSET(24) NUMBITS(8) [],
        DSTRD OFFSET(32) NUMBITS(4) [],
        SSRS OFFSET(36) NUMBITS(1) [],
        CSS OFFSET(37) NUMBITS(8) [],
        MPS_MIN OFFSET(45) NUMBITS(4) [],
        MPS_MAX OFFSET(49) NUMBITS(4) []
    ]
];

register_bitfields! [
    u32,
    /// Version (VER, 0x08)
    pub VER [
        TER OFFSET(0) NUMBITS(8) [],
        MNR OFFSET(8) NUMBITS(8) [],
        MJR OFFSET(16) NUMBITS(16) []
    ],

    /// Controller Configuration (CFG, 0x14)
    pub CFG [
        EN OFFSET(0) NUMBITS(1) [],
        CSS OFFSET(1) NUMBITS(3) [],
        MPS OFFSET(4) NUMBITS(4) [],
        AMS OFFSET(8) NUMBITS(3) [],
        SHN OFFSET(11) NUMBITS(2) [],
        HSM_SQES OFFSET(13) NUMBITS(4) [],
        HSM_CQES OFFSET(17) NUMBITS(4) [],
        AES_SQES OFFSET(21) NUMBITS(4) [],
        AES_CQES OFFSET(25) NUMBITS(4) []
    ],

    /// Controller Status (STS, 0x1C)
    pub STS [
        RDY OFFSET(0) NUMBITS(1) [],
        CFS OFFSET(1) NUMBITS(1) [],
        SHST OFFSET(2) NUMBITS(2) [],
        SSRO OFFSET(4) NUMBITS(1) []
    ],

    /// Admin Queue Attributes (AQA, 0x24)
    pub AQA [
        ASQS OFFSET(0) NUMBITS(16) [],
        ACQS OFFSET(16) NUMBITS(16) []
    ]
];

/// SQ-tail doorbell byte offset for queue id `queue_id`, generalized for
/// `dstrd` (`CAP.DSTRD`). `dstrd == 0` reduces to the device's documented
/// `2*Q*4` formula.
pub fn sq_tail_db_offset(queue_id: u16, dstrd: u8) -> usize {
    ((2 * queue_id as usize) << dstrd) * 4
}

/// CQ-head doorbell byte offset for queue id `queue_id`.
pub fn cq_head_db_offset(queue_id: u16, dstrd: u8) -> usize {
    ((2 * queue_id as usize + 1) << dstrd) * 4
}

/// Maximum queue id supported by this device family: the admin queue (0)
/// and exactly one HSM queue (1).
pub const MAX_QUEUE_ID: u16 = 1;

/// Ring the SQ-tail doorbell for `queue_id`. Rejects any queue id above
/// [`MAX_QUEUE_ID`] rather than writing past the doorbell array.
pub fn write_sq_tail_doorbell(pci: &dyn PciIo, queue_id: u16, dstrd: u8, value: u32) -> Result<()> {
    if queue_id > MAX_QUEUE_ID {
        return Err(AziHsmError::InvalidParameter);
    }
    pci.mmio_write32(DB_BAR_INDEX, sq_tail_db_offset(queue_id, dstrd), value);
    Ok(())
}

/// Ring the CQ-head doorbell for `queue_id`. Same queue-id bound as
/// [`write_sq_tail_doorbell`].
pub fn write_cq_head_doorbell(pci: &dyn PciIo, queue_id: u16, dstrd: u8, value: u32) -> Result<()> {
    if queue_id > MAX_QUEUE_ID {
        return Err(AziHsmError::InvalidParameter);
    }
    pci.mmio_write32(DB_BAR_INDEX, cq_head_db_offset(queue_id, dstrd), value);
    Ok(())
}

pub fn cap_from_raw(raw: u64) -> LocalRegisterCopy<u64, CAP::Register> {
    LocalRegisterCopy::new(raw)
}

pub fn ver_from_raw(raw: u32) -> LocalRegisterCopy<u32, VER::Register> {
    LocalRegisterCopy::new(raw)
}

pub fn cfg_from_raw(raw: u32) -> LocalRegisterCopy<u32, CFG::Register> {
    LocalRegisterCopy::new(raw)
}

pub fn sts_from_raw(raw: u32) -> LocalRegisterCopy<u32, STS::Register> {
    LocalRegisterCopy::new(raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doorbell_offsets_match_dstrd_zero_formula() {
        assert_eq!(sq_tail_db_offset(0, 0), 0);
        assert_eq!(cq_head_db_offset(0, 0), 4);
        assert_eq!(sq_tail_db_offset(1, 0), 8);
        assert_eq!(cq_head_db_offset(1, 0), 12);
    }

    #[test]
    fn doorbell_offsets_scale_with_dstrd() {
        assert_eq!(sq_tail_db_offset(1, 1), 16);
        assert_eq!(cq_head_db_offset(1, 1), 24);
    }

    #[test]
    fn cap_fields_decode() {
        let raw: u64 = (3u64) | (1u64 << 24) | (2u64 << 32);
        let cap = cap_from_raw(raw);
        assert_eq!(cap.read(CAP::MQES), 3);
        assert_eq!(cap.read(CAP::TO), 1);
        assert_eq!(cap.read(CAP::DSTRD), 2);
    }

    #[test]
    fn doorbell_write_rejects_queue_id_above_maximum() {
        let pci = crate::hsm::dma::test_support::FakePciIo::new();
        let result = write_sq_tail_doorbell(&pci, MAX_QUEUE_ID + 1, 0, 1);
        assert_eq!(result.unwrap_err(), AziHsmError::InvalidParameter);
    }

    #[test]
    fn doorbell_write_accepts_the_admin_and_hsm_queue_ids() {
        let pci = crate::hsm::dma::test_support::FakePciIo::new();
        assert!(write_sq_tail_doorbell(&pci, 0, 0, 1).is_ok());
        assert!(write_cq_head_doorbell(&pci, MAX_QUEUE_ID, 0, 1).is_ok());
    }
}
