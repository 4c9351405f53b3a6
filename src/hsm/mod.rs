//! Controller lifecycle and DDI orchestration
//!
//! This is the `AZIHSM_CONTROLLER_STATE` layer: HCI enable/disable
//! sequencing, admin- and HSM-queue bring-up and teardown, Identify
//! parsing, and the four DDI entry points that package a request into DMA
//! buffers, hand it to the control-processor command layer, and decode the
//! response. A platform binding (bind-start/bind-stop in firmware terms)
//! drives [`Controller`]; bus enumeration and protocol installation are out
//! of scope here (see [`dma::PciIo`]'s doc comment).

pub mod admin;
pub mod cp;
pub mod ddi;
pub mod dma;
pub mod mbor;
pub mod queue;
pub mod regs;
pub mod tpm;

use crate::error::{AziHsmError, Result};
use dma::{DmaBuffer, PciIo};
use ddi::ApiRev;
use queue::QueuePair;
use tpm::{SealedBlob, SensitiveBuffer, TpmKeyService};

/// The only PCI identity this driver will bind to.
pub const PCI_VENDOR_ID: u16 = 0x1414;
pub const PCI_DEVICE_ID: u16 = 0xC003;

const ADMIN_QUEUE_ID: u16 = 0;
const HSM_QUEUE_ID: u16 = 1;
/// Two slots per queue pair (the device's historical `QUEUE_SIZE = 1`,
/// i.e. one bit of index, toggled with every command).
const QUEUE_SLOT_COUNT: u16 = 2;
/// The number of HSM command queues this driver asks the device to create.
const HSM_CREATE_QUEUE_CNT: u32 = 1;

/// Every DDI request/response is carried by the same generic session-less
/// CP opcode; the operation itself is identified by the MBOR-encoded
/// `DdiOp` inside the payload, not by the SQE opcode field.
const CP_OPCODE_DDI_PASSTHROUGH: u16 = 0;

/// One 4 KiB page, shared by every DDI request/response DMA buffer.
const DDI_DMA_BUFFER_PAGES: usize = 1;
const DDI_DMA_BUFFER_SIZE: usize = 4096;

const ENABLE_POLL_ITERATIONS: u32 = 1000;

const IDENT_SN_LEN: usize = 32;
const IDENT_FR_LEN: usize = 32;
const IDENTIFY_MIN_LEN: usize = 102;

/// Controller bring-up/teardown state. A queue pair's own `QueueState`
/// (`hsm::queue::QueueState`) tracks in-flight commands within this.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Reset,
    AdminReady,
    HsmReady,
    TearingDown,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueEntrySize {
    pub min: u8,
    pub max: u8,
}

fn queue_entry_size(raw: u8) -> QueueEntrySize {
    QueueEntrySize { min: raw & 0x0F, max: (raw >> 4) & 0x0F }
}

/// Parsed Identify response (admin opcode `Identify`, CNS = 1). Only the
/// fields this driver inspects or logs are kept; the rest of the 4 KiB
/// Identify page is device-reserved.
#[derive(Debug, Clone)]
pub struct IdentifyData {
    pub vid: u16,
    pub ss_vid: u16,
    pub serial_number: [u8; IDENT_SN_LEN],
    pub firmware_revision: [u8; IDENT_FR_LEN],
    pub cp_mdts: u8,
    pub ctrl_id: u16,
    pub cp_sqes: QueueEntrySize,
    pub cp_cqes: QueueEntrySize,
    pub cp_max_cmd: u16,
    pub oacs: u16,
    pub sgls: u32,
    pub ver: u32,
    pub ctrl_type: u8,
    pub frmw: u8,
}

impl IdentifyData {
    fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < IDENTIFY_MIN_LEN {
            return Err(AziHsmError::ProtocolError);
        }
        let mut serial_number = [0u8; IDENT_SN_LEN];
        serial_number.copy_from_slice(&buf[4..36]);
        let mut firmware_revision = [0u8; IDENT_FR_LEN];
        firmware_revision.copy_from_slice(&buf[36..68]);
        Ok(IdentifyData {
            vid: u16::from_le_bytes(buf[0..2].try_into().unwrap()),
            ss_vid: u16::from_le_bytes(buf[2..4].try_into().unwrap()),
            serial_number,
            firmware_revision,
            cp_mdts: buf[72],
            ctrl_id: u16::from_le_bytes(buf[74..76].try_into().unwrap()),
            cp_sqes: queue_entry_size(buf[77]),
            cp_cqes: queue_entry_size(buf[78]),
            cp_max_cmd: u16::from_le_bytes(buf[80..82].try_into().unwrap()),
            oacs: u16::from_le_bytes(buf[88..90].try_into().unwrap()),
            sgls: u32::from_le_bytes(buf[92..96].try_into().unwrap()),
            ver: u32::from_le_bytes(buf[96..100].try_into().unwrap()),
            ctrl_type: buf[100],
            frmw: buf[101],
        })
    }

    /// The device reports an all-zero serial number until it has finished
    /// provisioning its identity; bind-start treats that as a failure.
    pub fn has_valid_serial(&self) -> bool {
        self.serial_number.iter().any(|&b| b != 0)
    }
}

fn read_cap(pci: &dyn PciIo) -> tock_registers::LocalRegisterCopy<u64, regs::CAP::Register> {
    regs::cap_from_raw(pci.mmio_read64(regs::PCI_BAR_INDEX, regs::CAP_OFFSET))
}

fn read_cfg(pci: &dyn PciIo) -> tock_registers::LocalRegisterCopy<u32, regs::CFG::Register> {
    regs::cfg_from_raw(pci.mmio_read32(regs::PCI_BAR_INDEX, regs::CFG_OFFSET))
}

fn read_sts(pci: &dyn PciIo) -> tock_registers::LocalRegisterCopy<u32, regs::STS::Register> {
    regs::sts_from_raw(pci.mmio_read32(regs::PCI_BAR_INDEX, regs::STS_OFFSET))
}

/// Set `CFG.EN` and poll `STS.RDY`, up to `ENABLE_POLL_ITERATIONS` one
/// millisecond stalls. A no-op if the controller is already ready.
fn enable_controller(pci: &dyn PciIo) -> Result<()> {
    if read_sts(pci).is_set(regs::STS::RDY) {
        return Ok(());
    }

    let mut cfg = read_cfg(pci);
    cfg.modify(regs::CFG::EN.val(1));
    pci.mmio_write32(regs::PCI_BAR_INDEX, regs::CFG_OFFSET, cfg.get());

    for _ in 0..ENABLE_POLL_ITERATIONS {
        crate::time::stall_1ms();
        if read_sts(pci).is_set(regs::STS::RDY) {
            return Ok(());
        }
    }
    log::error!("azihsm: controller did not report ready after enable");
    Err(AziHsmError::DeviceError)
}

/// Clear `CFG.EN` and poll for `STS.RDY` to drop, bounded by
/// `max(CAP.TO, 1) * 500` one millisecond stalls. A no-op if the
/// controller is already not ready. Unlike `enable_controller`, a timeout
/// here is only logged: the caller is tearing down regardless.
fn disable_controller(pci: &dyn PciIo) {
    if !read_sts(pci).is_set(regs::STS::RDY) {
        return;
    }

    let cap = read_cap(pci);
    let mut cfg = read_cfg(pci);
    cfg.modify(regs::CFG::EN.val(0));
    pci.mmio_write32(regs::PCI_BAR_INDEX, regs::CFG_OFFSET, cfg.get());

    let timeout_units = core::cmp::max(cap.read(regs::CAP::TO) as u32, 1);
    for _ in 0..(timeout_units * 500) {
        crate::time::stall_1ms();
        if !read_sts(pci).is_set(regs::STS::RDY) {
            return;
        }
    }
    log::warn!("azihsm: controller still ready after disable timeout");
}

/// Owns the admin queue pair (always present once bound) and the HSM
/// command queue pair (present from `HsmReady` onward), plus the
/// device-reported identity used to derive BKS3 key material.
pub struct Controller {
    lifecycle: LifecycleState,
    admin_qp: QueuePair,
    hsm_qp: Option<QueuePair>,
    identity: Option<IdentifyData>,
}

impl Controller {
    pub fn lifecycle(&self) -> LifecycleState {
        self.lifecycle
    }

    pub fn identity(&self) -> Option<&IdentifyData> {
        self.identity.as_ref()
    }

    /// Bring the controller from `Reset` to `HsmReady`: identity-gate the
    /// PCI function, initialize the admin queue pair, enable the
    /// controller, Identify it, then provision and enable the HSM command
    /// queue pair. On any failure the partially-built state is torn down
    /// before the error is returned.
    pub fn bind_start(pci: &dyn PciIo, vendor_id: u16, device_id: u16) -> Result<Self> {
        if vendor_id != PCI_VENDOR_ID || device_id != PCI_DEVICE_ID {
            return Err(AziHsmError::Unsupported);
        }

        disable_controller(pci);

        let cap = read_cap(pci);
        let dstrd = cap.read(regs::CAP::DSTRD) as u8;

        let mut admin_qp = QueuePair::init(
            pci,
            ADMIN_QUEUE_ID,
            QUEUE_SLOT_COUNT,
            admin::SQE_SIZE,
            admin::CQE_SIZE,
            dstrd as u32,
        )?;

        let mut aqa = tock_registers::LocalRegisterCopy::<u32, regs::AQA::Register>::new(0);
        aqa.write(regs::AQA::ASQS.val(QUEUE_SLOT_COUNT as u32) + regs::AQA::ACQS.val(QUEUE_SLOT_COUNT as u32));
        pci.mmio_write32(regs::PCI_BAR_INDEX, regs::AQA_OFFSET, aqa.get());
        pci.mmio_write64(regs::PCI_BAR_INDEX, regs::ASQ_OFFSET, admin_qp.sq_device_address());
        pci.mmio_write64(regs::PCI_BAR_INDEX, regs::ACQ_OFFSET, admin_qp.cq_device_address());

        // HSM_SQES/HSM_CQES are queue-entry-size classes (log2 of bytes),
        // same shape as NVMe's IOSQES/IOCQES; must be set before EN flips.
        let mut cfg = read_cfg(pci);
        cfg.modify(
            regs::CFG::HSM_SQES.val(cp::SQE_SIZE.trailing_zeros())
                + regs::CFG::HSM_CQES.val(cp::CQE_SIZE.trailing_zeros()),
        );
        pci.mmio_write32(regs::PCI_BAR_INDEX, regs::CFG_OFFSET, cfg.get());

        if let Err(e) = enable_controller(pci) {
            admin_qp.uninit(pci);
            return Err(e);
        }

        let mut controller = Controller { lifecycle: LifecycleState::AdminReady, admin_qp, hsm_qp: None, identity: None };

        if let Err(e) = controller.identify(pci) {
            controller.teardown(pci);
            return Err(e);
        }

        let identity = controller.identity.as_ref().expect("identify() populates identity on success");
        if !identity.has_valid_serial() {
            log::error!("azihsm: device reported an all-zero serial number");
            controller.teardown(pci);
            return Err(AziHsmError::DeviceError);
        }

        if let Err(e) = controller.bring_up_hsm_queue(pci) {
            controller.teardown(pci);
            return Err(e);
        }

        Ok(controller)
    }

    /// Issue Identify (CNS = 1) over the admin queue and parse the result.
    fn identify(&mut self, pci: &dyn PciIo) -> Result<()> {
        let mut buf = DmaBuffer::alloc(pci, 1)?;
        let result = admin::identify(pci, &mut self.admin_qp, buf.device_address());
        let parsed = result.and_then(|()| {
            let mut raw = [0u8; IDENTIFY_MIN_LEN];
            buf.read_volatile(0, &mut raw);
            IdentifyData::parse(&raw)
        });
        buf.free(pci);
        self.identity = Some(parsed?);
        Ok(())
    }

    /// Negotiate and create the HSM command queue pair: ask the device how
    /// many HSM queues it supports (clamped to what this driver wants),
    /// allocate the pair, create it device-side, enable the doorbell.
    fn bring_up_hsm_queue(&mut self, pci: &dyn PciIo) -> Result<()> {
        let granted = admin::set_hsm_queue_count(pci, &mut self.admin_qp, HSM_CREATE_QUEUE_CNT)?;
        if granted < HSM_CREATE_QUEUE_CNT {
            log::error!("azihsm: device granted {} HSM queues, need {}", granted, HSM_CREATE_QUEUE_CNT);
            return Err(AziHsmError::DeviceError);
        }

        let dstrd = read_cap(pci).read(regs::CAP::DSTRD) as u32;
        let mut hsm_qp = QueuePair::init(pci, HSM_QUEUE_ID, QUEUE_SLOT_COUNT, cp::SQE_SIZE, cp::CQE_SIZE, dstrd)?;

        if let Err(e) = admin::create_hsm_device_queue_pair(
            pci,
            &mut self.admin_qp,
            HSM_QUEUE_ID,
            QUEUE_SLOT_COUNT,
            hsm_qp.sq_device_address(),
            hsm_qp.cq_device_address(),
        ) {
            hsm_qp.uninit(pci);
            return Err(e);
        }

        self.hsm_qp = Some(hsm_qp);
        self.lifecycle = LifecycleState::HsmReady;
        Ok(())
    }

    /// Tear down the HSM queue pair (device-side delete, then free its
    /// buffers), disable the controller, and free the admin queue pair's
    /// buffers. Every step runs even if an earlier one failed, mirroring
    /// `AziHsmHciUninitialize`'s best-effort unwind.
    pub fn bind_stop(mut self, pci: &dyn PciIo) {
        self.teardown(pci);
    }

    fn teardown(&mut self, pci: &dyn PciIo) {
        self.lifecycle = LifecycleState::TearingDown;

        if let Some(mut hsm_qp) = self.hsm_qp.take() {
            if let Err(e) = admin::delete_hsm_device_queue_pair(
                pci,
                &mut self.admin_qp,
                HSM_QUEUE_ID,
                hsm_qp.sq_device_address(),
                hsm_qp.cq_device_address(),
            ) {
                log::warn!("azihsm: failed to delete HSM device queue pair: {e}");
            }
            hsm_qp.uninit(pci);
        }

        disable_controller(pci);
        self.admin_qp.uninit(pci);
        self.lifecycle = LifecycleState::Reset;
    }

    /// Query the controller's supported DDI API revision range.
    pub fn get_api_revision(&mut self, pci: &dyn PciIo) -> Result<ddi::ApiRevResponse> {
        let hsm_qp = self.hsm_qp()?;
        let (resp, _fips) = run_ddi_exchange(
            pci,
            hsm_qp,
            |enc| ddi::encode_get_api_rev_request(enc, None, None),
            ddi::decode_get_api_rev_response,
        )?;
        Ok(resp)
    }

    /// Initialize BKS3: hand the HSM the platform-derived key material and
    /// get back a device-wrapped key blob plus a device-unique GUID. The
    /// wrapped key still needs TPM sealing (`set_sealed_bks3` consumes the
    /// sealed form, not this raw wrapped form).
    pub fn init_bks3(&mut self, pci: &dyn PciIo, api_rev: ApiRev, derived_key: &[u8]) -> Result<(SealedBlob, [u8; 16])> {
        let hsm_qp = self.hsm_qp()?;
        let (resp, _fips) = run_ddi_exchange(
            pci,
            hsm_qp,
            |enc| ddi::encode_init_bks3_request(enc, Some(&api_rev), None, derived_key),
            ddi::decode_init_bks3_response,
        )?;
        let wrapped_key = SensitiveBuffer::from_slice(&resp.bks3)?;
        Ok((wrapped_key, resp.guid))
    }

    /// Hand the HSM a TPM-sealed BKS3 blob to persist. Returns whether the
    /// device accepted it; unlike every other DDI operation, a non-success
    /// DDI status here is reported through this boolean rather than as an
    /// error (see `ddi::decode_set_sealed_bks3_response`).
    pub fn set_sealed_bks3(&mut self, pci: &dyn PciIo, api_rev: ApiRev, sealed_bks3: &[u8]) -> Result<bool> {
        let hsm_qp = self.hsm_qp()?;
        run_ddi_exchange(
            pci,
            hsm_qp,
            |enc| ddi::encode_set_sealed_bks3_request(enc, Some(&api_rev), None, sealed_bks3),
            ddi::decode_set_sealed_bks3_response,
        )
    }

    /// Retrieve the previously persisted TPM-sealed BKS3 blob.
    pub fn get_sealed_bks3(&mut self, pci: &dyn PciIo, api_rev: ApiRev) -> Result<SealedBlob> {
        let hsm_qp = self.hsm_qp()?;
        let (sealed, _fips) = run_ddi_exchange(
            pci,
            hsm_qp,
            |enc| ddi::encode_get_sealed_bks3_request(enc, Some(&api_rev), None),
            ddi::decode_get_sealed_bks3_response,
        )?;
        SensitiveBuffer::from_slice(&sealed)
    }

    /// Run the full BKS3 bring-up workflow: ask the TPM for the platform
    /// secret, derive the BKS3 key from it and the device's serial number,
    /// initialize BKS3 on the device, seal the result to the TPM's Null
    /// hierarchy, persist it, and measure the returned GUID. Every
    /// intermediate key buffer is a `SensitiveBuffer` and is zeroized on
    /// drop regardless of where this function returns.
    pub fn provision_bks3(&mut self, pci: &dyn PciIo, api_rev: ApiRev, tpm: &dyn TpmKeyService) -> Result<()> {
        let identity = self.identity.clone().ok_or(AziHsmError::DeviceError)?;
        let platform_secret = tpm.get_platform_secret()?;
        let derived_key = tpm.derive_bks3_from_id(platform_secret.as_slice(), &identity.serial_number)?;

        let (wrapped_key, guid) = self.init_bks3(pci, api_rev, derived_key.as_slice())?;
        let sealed = tpm.seal_to_null_hierarchy(wrapped_key.as_slice())?;
        let accepted = self.set_sealed_bks3(pci, api_rev, sealed.as_slice())?;
        if !accepted {
            return Err(AziHsmError::DeviceError);
        }
        tpm.measure_guid_event(&guid)?;
        Ok(())
    }

    fn hsm_qp(&mut self) -> Result<&mut QueuePair> {
        self.hsm_qp.as_mut().ok_or(AziHsmError::DeviceError)
    }
}

/// The shared shape of every DDI entry point: encode a request into a
/// scratch buffer, copy it into a freshly allocated DMA input buffer,
/// fire it over the HSM queue pair, copy the response out of the DMA
/// output buffer, and decode it. Both DMA buffers are freed on every exit
/// path, mirroring the `Cleanup:` label every `AziHsmDdiApi.c` entry point
/// ends with.
fn run_ddi_exchange<T>(
    pci: &dyn PciIo,
    hsm_qp: &mut QueuePair,
    encode: impl FnOnce(&mut mbor::Encoder) -> Result<()>,
    decode: impl FnOnce(&mut mbor::Decoder) -> Result<T>,
) -> Result<T> {
    let mut scratch = [0u8; DDI_DMA_BUFFER_SIZE];
    let encoded_len = {
        let mut enc = mbor::Encoder::new(&mut scratch);
        encode(&mut enc)?;
        enc.position()
    };

    let mut in_buf = DmaBuffer::alloc(pci, DDI_DMA_BUFFER_PAGES)?;
    let mut out_buf = match DmaBuffer::alloc(pci, DDI_DMA_BUFFER_PAGES) {
        Ok(b) => b,
        Err(e) => {
            in_buf.free(pci);
            return Err(e);
        }
    };

    in_buf.write_volatile(0, &scratch[..encoded_len]);
    scratch.fill(0);

    let mut out_size = out_buf.size() as u32;
    let cqe = cp::fire_hsm(
        pci,
        hsm_qp,
        in_buf.device_address(),
        encoded_len as u32,
        out_buf.device_address(),
        &mut out_size,
        CP_OPCODE_DDI_PASSTHROUGH,
        &cp::SessionControl::default(),
    );

    let result = cqe.and_then(|cqe| {
        if cqe.status != 0 {
            return Err(AziHsmError::DeviceError);
        }
        if out_size as usize > out_buf.size() {
            return Err(AziHsmError::ProtocolError);
        }

        let mut resp = [0u8; DDI_DMA_BUFFER_SIZE];
        out_buf.read_volatile(0, &mut resp[..out_size as usize]);

        let mut dec = mbor::Decoder::new(&resp[..out_size as usize]);
        let value = decode(&mut dec)?;
        if dec.position() != out_size as usize {
            return Err(AziHsmError::ProtocolError);
        }
        Ok(value)
    });

    in_buf.free(pci);
    out_buf.free(pci);
    result
}
