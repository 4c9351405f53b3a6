//! Control-Processor (HSM) command issue
//!
//! Every HSM command carries both an input buffer (`Src`) and an output
//! buffer (`Dst`), unlike admin commands which carry one PRP pair. The
//! polling structure mirrors `hsm::admin::issue_admin` exactly.

use crate::error::{AziHsmError, Result};
use crate::hsm::dma::PciIo;
use crate::hsm::queue::QueuePair;
use crate::time::Timeout;

pub const SQE_SIZE: usize = 64;
pub const CQE_SIZE: usize = 16;
pub const CMD_TIMEOUT_MS: u64 = 100;

pub const CP_CMD_SET_SESSION_GENERIC: u8 = 0x0;
const PSDT_PRP: u8 = 0;

/// In-SQE session control block: a 4-bit opcode flow plus three flag
/// bits. Copied verbatim into every HSM SQE's `SqeData` field.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SessionOpcodeFlow {
    #[default]
    NoSession = 0,
    OpenSession = 1,
    CloseSession = 2,
    InSession = 3,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SessionControl {
    pub opcode: SessionOpcodeFlow,
    pub in_session_cmd: bool,
    pub short_app_id_valid: bool,
    pub safe_to_close_session: bool,
    pub session_id: u16,
}

impl SessionControl {
    fn flags_byte(&self) -> u8 {
        (self.opcode as u8 & 0x3)
            | ((self.in_session_cmd as u8) << 2)
            | ((self.short_app_id_valid as u8) << 3)
            | ((self.safe_to_close_session as u8) << 4)
    }
}

/// Parsed CP completion entry.
#[derive(Debug, Clone, Copy, Default)]
pub struct CpCqe {
    pub byte_count: u16,
    pub session_id: u16,
    pub short_app_id: u8,
    pub sq_head_echo: u16,
    pub cmd_id: u16,
    pub phase: u8,
    /// Firmware status (`Sts`). Non-zero means the transport round-trip
    /// succeeded but the device refused the command; the caller decides.
    pub status: u16,
}

impl CpCqe {
    fn from_bytes(b: &[u8; CQE_SIZE]) -> Self {
        let byte_count = u16::from_le_bytes(b[0..2].try_into().unwrap());
        let session_id = u16::from_le_bytes(b[4..6].try_into().unwrap());
        let short_app_id = b[6];
        let sq_head_echo = u16::from_le_bytes(b[8..10].try_into().unwrap());
        let cmd_id = u16::from_le_bytes(b[12..14].try_into().unwrap());
        let psf = u16::from_le_bytes(b[14..16].try_into().unwrap());
        CpCqe {
            byte_count,
            session_id,
            short_app_id,
            sq_head_echo,
            cmd_id,
            phase: (psf & 0x1) as u8,
            status: (psf >> 1) & 0x7FF,
        }
    }
}

/// Fire one HSM command over the HSM queue pair and wait for completion.
///
/// Preconditions: `in_size > 0` and `out_size > 0` (spec §4.5). On
/// completion with non-zero firmware status, `*out_size` is left
/// unchanged and the status is returned in the `CpCqe`; on zero status,
/// `*out_size` is overwritten with the device's `ByteCount` so the caller
/// learns how much of the output buffer is meaningful.
pub fn fire_hsm(
    pci: &dyn PciIo,
    qp: &mut QueuePair,
    in_device_address: u64,
    in_size: u32,
    out_device_address: u64,
    out_size: &mut u32,
    opcode: u16,
    session: &SessionControl,
) -> Result<CpCqe> {
    if in_size == 0 || *out_size == 0 {
        return Err(AziHsmError::InvalidParameter);
    }

    let mut sqe = [0u8; SQE_SIZE];
    // bytes 0..4: OpCode:10 | CmdSet:4 | Psdt:2 | CmdId:16
    let word0: u32 = (opcode as u32 & 0x3FF)
        | ((CP_CMD_SET_SESSION_GENERIC as u32 & 0xF) << 10)
        | ((PSDT_PRP as u32 & 0x3) << 14);
    sqe[0..4].copy_from_slice(&word0.to_le_bytes());

    sqe[4..8].copy_from_slice(&in_size.to_le_bytes());
    sqe[8..16].copy_from_slice(&in_device_address.to_le_bytes());
    // bytes 16..24: Src.Snd, left zero

    sqe[24..28].copy_from_slice(&out_size.to_le_bytes());
    sqe[28..36].copy_from_slice(&out_device_address.to_le_bytes());
    // bytes 36..44: Dst.Snd, left zero

    // SqeData: SessionCtrlFlags(1) + rsvd[3] + SessionId(2) + rsvd[14] = 20 bytes, at 44..64
    sqe[44] = session.flags_byte();
    sqe[48..50].copy_from_slice(&session.session_id.to_le_bytes());

    let phase_before_post = qp.cq_phase_at_head();
    qp.post_sqe(&sqe);
    let new_tail = qp.advance_sq_tail();
    crate::hsm::regs::write_sq_tail_doorbell(pci, qp.id, qp.doorbell_stride as u8, new_tail as u32)?;

    let timeout = Timeout::from_ms(CMD_TIMEOUT_MS);
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
    let cqe = CpCqe::from_bytes(&raw);

    let new_head = qp.advance_cq_head();
    crate::hsm::regs::write_cq_head_doorbell(pci, qp.id, qp.doorbell_stride as u8, new_head as u32)?;

    if cqe.status == 0 {
        *out_size = cqe.byte_count as u32;
    }

    Ok(cqe)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hsm::dma::test_support::FakePciIo;

    fn new_hsm_pair(pci: &FakePciIo) -> QueuePair {
        QueuePair::init(pci, 1, 2, SQE_SIZE, CQE_SIZE, 0).unwrap()
    }

    fn make_cqe(phase: u8, status: u16, byte_count: u16) -> [u8; CQE_SIZE] {
        let mut cqe = [0u8; CQE_SIZE];
        cqe[0..2].copy_from_slice(&byte_count.to_le_bytes());
        let psf: u16 = (phase as u16 & 0x1) | ((status & 0x7FF) << 1);
        cqe[14..16].copy_from_slice(&psf.to_le_bytes());
        cqe
    }

    #[test]
    fn zero_size_buffers_are_rejected_before_posting() {
        let pci = FakePciIo::new();
        let mut qp = new_hsm_pair(&pci);
        let mut out_size = 0u32;
        let result = fire_hsm(&pci, &mut qp, 0x1000, 4, 0x2000, &mut out_size, 0, &SessionControl::default());
        assert_eq!(result.unwrap_err(), AziHsmError::InvalidParameter);
        assert_eq!(qp.sq_tail(), 0, "rejected command must not post an SQE");
    }

    #[test]
    fn successful_command_overwrites_out_size_with_byte_count() {
        let pci = FakePciIo::new();
        let mut qp = new_hsm_pair(&pci);
        qp.simulate_cq_write(&make_cqe(1, 0, 42));
        let mut out_size = 4096u32;
        let cqe = fire_hsm(&pci, &mut qp, 0x1000, 16, 0x2000, &mut out_size, 7, &SessionControl::default()).unwrap();
        assert_eq!(cqe.status, 0);
        assert_eq!(out_size, 42);
    }

    #[test]
    fn nonzero_status_leaves_out_size_untouched() {
        let pci = FakePciIo::new();
        let mut qp = new_hsm_pair(&pci);
        qp.simulate_cq_write(&make_cqe(1, 0x5, 99));
        let mut out_size = 4096u32;
        let cqe = fire_hsm(&pci, &mut qp, 0x1000, 16, 0x2000, &mut out_size, 7, &SessionControl::default()).unwrap();
        assert_eq!(cqe.status, 0x5);
        assert_eq!(out_size, 4096);
    }

    #[test]
    fn timeout_faults_the_queue_pair() {
        let pci = FakePciIo::new();
        let mut qp = new_hsm_pair(&pci);
        let mut out_size = 4096u32;
        let result = fire_hsm(&pci, &mut qp, 0x1000, 16, 0x2000, &mut out_size, 7, &SessionControl::default());
        assert_eq!(result.unwrap_err(), AziHsmError::DeviceError);
        assert_eq!(qp.state(), crate::hsm::queue::QueueState::Faulted);
    }
}
