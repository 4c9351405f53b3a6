//! Admin command issue
//!
//! Admin SQEs/CQEs are fixed 64/16-byte wire records. Every field is
//! produced and parsed by explicit serializer/deserializer code — never by
//! overlaying a host `#[repr(C)]` struct on the buffer — so the layout is
//! exact regardless of host struct-layout rules (padding, alignment).

use crate::error::{AziHsmError, Result};
use crate::hsm::dma::PciIo;
use crate::hsm::queue::QueuePair;
use crate::time::Timeout;

pub const SQE_SIZE: usize = 64;
pub const CQE_SIZE: usize = 16;
pub const ADMIN_CMD_TIMEOUT_MS: u64 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AdminOpcode {
    DeleteSq = 0x00,
    CreateSq = 0x01,
    DeleteCq = 0x04,
    CreateCq = 0x05,
    Identify = 0x06,
    Abort = 0x08,
    SetFeature = 0x09,
    GetFeature = 0x0A,
    SetResetCount = 0xC3,
    GetResetCount = 0xC4,
}

pub const FEAT_ID_HSM_QUEUE_CNT: u8 = 0x07;
pub const FEAT_ID_AES_QUEUE_CNT: u8 = 0xC1;

/// A parsed admin completion entry: phase bit, 11-bit status, SQ-head
/// echo, and the opaque command-specific 32-bit `Cs` word (queue counts
/// for SetFeature, otherwise device-defined).
#[derive(Debug, Clone, Copy, Default)]
pub struct AdminCqe {
    pub cs: u32,
    pub sq_head_echo: u16,
    pub sq_id: u16,
    pub cid: u16,
    pub phase: u8,
    pub status: u16,
}

impl AdminCqe {
    fn from_bytes(b: &[u8; CQE_SIZE]) -> Self {
        let cs = u32::from_le_bytes(b[0..4].try_into().unwrap());
        let sq_head_echo = u16::from_le_bytes(b[8..10].try_into().unwrap());
        let sq_id = u16::from_le_bytes(b[10..12].try_into().unwrap());
        let cid = u16::from_le_bytes(b[12..14].try_into().unwrap());
        let psf = u16::from_le_bytes(b[14..16].try_into().unwrap());
        AdminCqe {
            cs,
            sq_head_echo,
            sq_id,
            cid,
            phase: (psf & 0x1) as u8,
            status: (psf >> 1) & 0x7FF,
        }
    }
}

/// Builds a zeroed 64-byte SQE and fills in the common header
/// (opcode, PSDT=0, PRP1). Callers fill in the opcode-specific tail.
fn new_sqe(opcode: AdminOpcode, prp1: u64) -> [u8; SQE_SIZE] {
    let mut sqe = [0u8; SQE_SIZE];
    sqe[0] = opcode as u8;
    // bytes 1: Rsvd1:6 | Psdt:2, both zero (PSDT = PRP)
    // bytes 2..4: Cid, left zero
    // bytes 4..16: Rsvd2[3], left zero
    // bytes 16..24: Mptr, left zero
    sqe[24..32].copy_from_slice(&prp1.to_le_bytes());
    // bytes 32..40: dptr.prp.Snd, left zero
    sqe
}

/// Issue one admin command and wait for its completion by phase-bit flip.
/// Returns the parsed CQE on a successful transport round-trip — *even if*
/// the firmware's status code is non-zero; the caller inspects `status`.
pub fn issue_admin(pci: &dyn PciIo, qp: &mut QueuePair, sqe: &[u8; SQE_SIZE]) -> Result<AdminCqe> {
    let phase_before_post = qp.cq_phase_at_head();

    qp.post_sqe(sqe);
    let new_tail = qp.advance_sq_tail();
    crate::hsm::regs::write_sq_tail_doorbell(pci, qp.id, qp.doorbell_stride as u8, new_tail as u32)?;

    let timeout = Timeout::from_ms(ADMIN_CMD_TIMEOUT_MS);
    let completed = loop {
        if qp.cq_phase_at_head() != phase_before_post {
            break true;
        }
        if timeout.is_expired() {
            break false;
        }
        crate::time::stall_1ms();
    };

    if !completed {
        qp.mark_faulted();
        return Err(AziHsmError::DeviceError);
    }

    let mut raw = [0u8; CQE_SIZE];
    qp.read_cqe(&mut raw);
    let cqe = AdminCqe::from_bytes(&raw);

    let new_head = qp.advance_cq_head();
    crate::hsm::regs::write_cq_head_doorbell(pci, qp.id, qp.doorbell_stride as u8, new_head as u32)?;

    Ok(cqe)
}

/// Identify the controller (opcode 0x06, CNS=1), writing the 4 KiB
/// response into `prp1`-addressed DMA storage already supplied by the
/// caller. Non-zero firmware status is translated to `DeviceError`.
pub fn identify(pci: &dyn PciIo, qp: &mut QueuePair, dma_device_address: u64) -> Result<()> {
    let mut sqe = new_sqe(AdminOpcode::Identify, dma_device_address);
    // Cns:8 at byte 40, CtrlId:16 at byte 41..43
    sqe[40] = 0x01;
    let cqe = issue_admin(pci, qp, &sqe)?;
    if cqe.status != 0 {
        return Err(AziHsmError::DeviceError);
    }
    Ok(())
}

/// Ask the firmware for the HSM queue count it supports, clamp to
/// `create_queue_cnt` (the number of queues this driver intends to
/// create), and return the clamped count. Firmware reports a zero-based
/// count; the driver adds 1 before clamping.
pub fn set_hsm_queue_count(
    pci: &dyn PciIo,
    qp: &mut QueuePair,
    create_queue_cnt: u32,
) -> Result<u32> {
    let mut sqe = new_sqe(AdminOpcode::SetFeature, 0);
    sqe[40] = FEAT_ID_HSM_QUEUE_CNT;
    // Data.QueueCnt: SqCnt u16 at 44..46, CqCnt u16 at 46..48. Request the
    // maximum queue count the device can report (firmware clamps on its
    // own side); the driver clamps the *returned* count below.
    sqe[44..46].copy_from_slice(&u16::MAX.to_le_bytes());
    sqe[46..48].copy_from_slice(&u16::MAX.to_le_bytes());

    let cqe = issue_admin(pci, qp, &sqe)?;
    if cqe.status != 0 {
        return Err(AziHsmError::DeviceError);
    }

    let sq_cnt = cqe.cs & 0xFFFF;
    let cq_cnt = (cqe.cs >> 16) & 0xFFFF;
    debug_assert_eq!(sq_cnt, cq_cnt);

    let reported = sq_cnt + 1;
    Ok(core::cmp::min(create_queue_cnt, reported))
}

/// Create a completion queue with the given id, physically contiguous,
/// fixed queue size.
pub fn create_cq(pci: &dyn PciIo, qp: &mut QueuePair, id: u16, slot_count: u16, device_address: u64) -> Result<()> {
    let mut sqe = new_sqe(AdminOpcode::CreateCq, device_address);
    sqe[40..42].copy_from_slice(&id.to_le_bytes());
    sqe[42..44].copy_from_slice(&slot_count.to_le_bytes());
    sqe[44] |= 0x1; // Pc (physically contiguous) bit 0 of the Pc/Ien/Rsvd1/Ivec dword
    let cqe = issue_admin(pci, qp, &sqe)?;
    if cqe.status != 0 {
        return Err(AziHsmError::DeviceError);
    }
    Ok(())
}

/// Create a submission queue associated with completion queue `cq_id`.
pub fn create_sq(
    pci: &dyn PciIo,
    qp: &mut QueuePair,
    id: u16,
    slot_count: u16,
    cq_id: u16,
    device_address: u64,
) -> Result<()> {
    let mut sqe = new_sqe(AdminOpcode::CreateSq, device_address);
    sqe[40..42].copy_from_slice(&id.to_le_bytes());
    sqe[42..44].copy_from_slice(&slot_count.to_le_bytes());
    sqe[44] |= 0x1; // PhyCont bit
    sqe[46..48].copy_from_slice(&cq_id.to_le_bytes());
    let cqe = issue_admin(pci, qp, &sqe)?;
    if cqe.status != 0 {
        return Err(AziHsmError::DeviceError);
    }
    Ok(())
}

/// Create the HSM queue pair in the device: CQ first, then SQ. On SQ
/// failure the CQ is deleted to keep device state clean.
pub fn create_hsm_device_queue_pair(
    pci: &dyn PciIo,
    admin_qp: &mut QueuePair,
    id: u16,
    slot_count: u16,
    sq_device_address: u64,
    cq_device_address: u64,
) -> Result<()> {
    create_cq(pci, admin_qp, id, slot_count, cq_device_address)?;
    if let Err(e) = create_sq(pci, admin_qp, id, slot_count, id, sq_device_address) {
        let _ = delete_cq(pci, admin_qp, id, cq_device_address);
        return Err(e);
    }
    Ok(())
}

pub fn delete_sq(pci: &dyn PciIo, qp: &mut QueuePair, id: u16, device_address: u64) -> Result<()> {
    let mut sqe = new_sqe(AdminOpcode::DeleteSq, device_address);
    sqe[40..42].copy_from_slice(&id.to_le_bytes());
    let cqe = issue_admin(pci, qp, &sqe)?;
    if cqe.status != 0 {
        return Err(AziHsmError::DeviceError);
    }
    Ok(())
}

pub fn delete_cq(pci: &dyn PciIo, qp: &mut QueuePair, id: u16, device_address: u64) -> Result<()> {
    let mut sqe = new_sqe(AdminOpcode::DeleteCq, device_address);
    sqe[40..42].copy_from_slice(&id.to_le_bytes());
    let cqe = issue_admin(pci, qp, &sqe)?;
    if cqe.status != 0 {
        return Err(AziHsmError::DeviceError);
    }
    Ok(())
}

/// Delete the HSM queue pair: SQ first, then CQ (reverse of creation).
pub fn delete_hsm_device_queue_pair(
    pci: &dyn PciIo,
    admin_qp: &mut QueuePair,
    id: u16,
    sq_device_address: u64,
    cq_device_address: u64,
) -> Result<()> {
    delete_sq(pci, admin_qp, id, sq_device_address)?;
    delete_cq(pci, admin_qp, id, cq_device_address)?;
    Ok(())
}
