//! TPM-backed key material and the BKS3 derivation boundary
//!
//! The HSM driver does not speak TPM2 commands itself; a platform-
//! specific collaborator (analogous to [`crate::hsm::dma::PciIo`] for bus
//! access) implements [`TpmKeyService`] against whatever TPM stack the
//! platform provides. This keeps `hsm::tpm` free of TPM2 command/response
//! encoding while still letting `hsm::mod` drive the BKS3 bring-up
//! sequence against a concrete trait object.

use crate::error::Result;

pub const DERIVED_KEY_SIZE: usize = 48;
pub const PCI_IDENTIFIER_MAX_LEN: usize = 32;
pub const SEALED_BLOB_MAX_SIZE: usize = 1024;
pub const BUFFER_MAX_SIZE: usize = 1024;
pub const GUID_SIZE: usize = 16;
pub const TCG_PCR_INDEX: u32 = 6;

/// A fixed-capacity buffer that zeroizes its backing storage when
/// dropped. Used for every buffer that carries derived key material or
/// unsealed secrets on its way between the TPM boundary and the wire.
pub struct SensitiveBuffer<const N: usize> {
    data: [u8; N],
    len: usize,
}

impl<const N: usize> SensitiveBuffer<N> {
    pub fn new() -> Self {
        SensitiveBuffer { data: [0u8; N], len: 0 }
    }

    pub fn from_slice(src: &[u8]) -> Result<Self> {
        if src.len() > N {
            return Err(crate::error::AziHsmError::BufferTooSmall);
        }
        let mut buf = Self::new();
        buf.data[..src.len()].copy_from_slice(src);
        buf.len = src.len();
        Ok(buf)
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.len]
    }

    /// Capacity-sized mutable view for filling in place (e.g. a TPM
    /// GetRandom call writing directly into the buffer), paired with
    /// `set_len` once the caller knows how much was written.
    pub fn as_mut_capacity(&mut self) -> &mut [u8; N] {
        &mut self.data
    }

    pub fn set_len(&mut self, len: usize) {
        debug_assert!(len <= N);
        self.len = len.min(N);
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl<const N: usize> Default for SensitiveBuffer<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> Drop for SensitiveBuffer<N> {
    fn drop(&mut self) {
        self.data.fill(0);
    }
}

pub type DerivedKey = SensitiveBuffer<DERIVED_KEY_SIZE>;
pub type SealedBlob = SensitiveBuffer<SEALED_BLOB_MAX_SIZE>;
pub type UnsealedBuffer = SensitiveBuffer<BUFFER_MAX_SIZE>;

/// The platform's TPM 2.0 collaborator. Every method is one logical TPM
/// transaction; retries and command-buffer framing are the
/// implementation's concern, not this trait's.
pub trait TpmKeyService {
    /// Derives the platform-hierarchy secret used as the BKS3 KDF's IKM.
    fn get_platform_secret(&self) -> Result<DerivedKey>;

    /// Seals `data` to the TPM's Null hierarchy.
    fn seal_to_null_hierarchy(&self, data: &[u8]) -> Result<SealedBlob>;

    /// Unseals a blob previously produced by `seal_to_null_hierarchy`.
    fn unseal_using_null_hierarchy(&self, sealed: &[u8]) -> Result<UnsealedBuffer>;

    /// Derives the BKS3 key from the unsealed platform secret and the
    /// device's PCI identifier (serial number), `id`.
    fn derive_bks3_from_id(&self, platform_secret: &[u8], id: &[u8]) -> Result<DerivedKey>;

    /// Fills `out` with TPM-sourced random bytes.
    fn get_random(&self, out: &mut [u8]) -> Result<()>;

    /// Extends a PCR with the device-unique GUID, for TCG event logging.
    fn measure_guid_event(&self, guid: &[u8; GUID_SIZE]) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_slice_rejects_oversized_input() {
        let oversized = [0u8; DERIVED_KEY_SIZE + 1];
        let result = DerivedKey::from_slice(&oversized);
        assert!(result.is_err());
    }

    #[test]
    fn from_slice_preserves_exact_length() {
        let key = DerivedKey::from_slice(&[1, 2, 3]).unwrap();
        assert_eq!(key.as_slice(), &[1, 2, 3]);
        assert_eq!(key.len(), 3);
    }

    #[test]
    fn fill_in_place_then_set_len_exposes_only_written_bytes() {
        let mut buf: SensitiveBuffer<16> = SensitiveBuffer::new();
        buf.as_mut_capacity()[..4].copy_from_slice(&[9, 8, 7, 6]);
        buf.set_len(4);
        assert_eq!(buf.as_slice(), &[9, 8, 7, 6]);
    }

    #[test]
    fn new_buffer_is_empty() {
        let buf: SensitiveBuffer<8> = SensitiveBuffer::new();
        assert!(buf.is_empty());
        assert_eq!(buf.as_slice(), &[] as &[u8]);
    }
}
