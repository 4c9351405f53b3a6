//! DDI command envelopes: MBOR-encoded request/response headers wrapping
//! the four BKS3 lifecycle operations, plus the status mapping between
//! DDI status codes and the transport error type.

use crate::error::{AziHsmError, Result};
use crate::hsm::mbor::{Decoder, Encoder};
use heapless::Vec;

pub const INIT_BKS3_REQ_MAX_LEN: usize = 48;
pub const INIT_BKS3_RESP_MAX_LEN: usize = 1024;
pub const SET_SEALED_BKS3_MAX_LEN: usize = 1024;
pub const GET_SEALED_BKS3_MAX_LEN: usize = 1024;
const GUID_LEN: usize = 16;

const REQ_HDR_FIELD_COUNT: u8 = 3;
const REV_FIELD_ID: u8 = 1;
const DDI_OP_FIELD_ID: u8 = 2;
const SESSION_ID_FIELD_ID: u8 = 3;
const MIN_REQ_HDR_FIELD_COUNT: u8 = 1;

const RSP_HDR_FIELD_COUNT: u8 = 5;
const RSP_REV_FIELD_ID: u8 = 1;
const RSP_DDI_OP_FIELD_ID: u8 = 2;
const RSP_SESSION_ID_FIELD_ID: u8 = 3;
const RSP_DDI_STATUS_FIELD_ID: u8 = 4;
const RSP_FIPS_APPROVED_FIELD_ID: u8 = 5;
const MIN_RSP_HDR_FIELD_COUNT: u8 = 3;

const CMD_HDR_FIELD_ID: u8 = 0;
const CMD_DATA_FIELD_ID: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum DdiOp {
    GetApiRev = 1002,
    InitBks3 = 1111,
    GetSealedBks3 = 1112,
    SetSealedBks3 = 1113,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum DdiStatus {
    Success = 0,
    InvalidArg = 134_217_731,
    InternalError = 134_217_736,
    UnsupportedCmd = 134_217_737,
    EncodeFailed = 141_033_473,
    DecodeFailed = 141_033_474,
}

impl DdiStatus {
    fn from_raw(raw: u32) -> Option<Self> {
        Some(match raw {
            0 => DdiStatus::Success,
            134_217_731 => DdiStatus::InvalidArg,
            134_217_736 => DdiStatus::InternalError,
            134_217_737 => DdiStatus::UnsupportedCmd,
            141_033_473 => DdiStatus::EncodeFailed,
            141_033_474 => DdiStatus::DecodeFailed,
            _ => return None,
        })
    }

    /// Maps a DDI status word to the crate's transport error type. An
    /// unrecognized code is treated as a device error, matching the
    /// conservative default the firmware-side mapping falls back to.
    pub fn to_error(raw: u32) -> Result<()> {
        match Self::from_raw(raw) {
            Some(DdiStatus::Success) => Ok(()),
            Some(DdiStatus::InvalidArg) => Err(AziHsmError::InvalidParameter),
            Some(DdiStatus::UnsupportedCmd) => Err(AziHsmError::Unsupported),
            Some(DdiStatus::EncodeFailed) | Some(DdiStatus::DecodeFailed) => {
                Err(AziHsmError::ProtocolError)
            }
            Some(DdiStatus::InternalError) | None => Err(AziHsmError::DeviceError),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ApiRev {
    pub major: u32,
    pub minor: u32,
}

fn encode_api_rev(enc: &mut Encoder, rev: &ApiRev) -> Result<()> {
    enc.map(2)?;
    enc.u8(1)?;
    enc.u32(rev.major)?;
    enc.u8(2)?;
    enc.u32(rev.minor)
}

fn decode_api_rev(dec: &mut Decoder) -> Result<ApiRev> {
    let field_count = dec.map()?;
    if field_count != 2 {
        return Err(AziHsmError::ProtocolError);
    }
    let mut rev = ApiRev::default();
    for _ in 0..field_count {
        match dec.u8()? {
            1 => rev.major = dec.u32()?,
            2 => rev.minor = dec.u32()?,
            _ => return Err(AziHsmError::Unsupported),
        }
    }
    Ok(rev)
}

/// Encodes field 0 (`[hdr]`) of every DDI command request: field count,
/// operation code, and optional revision/session id.
fn encode_request_header(
    enc: &mut Encoder,
    op: DdiOp,
    api_rev: Option<&ApiRev>,
    session_id: Option<u16>,
) -> Result<()> {
    let field_count = 1 + api_rev.is_some() as u8 + session_id.is_some() as u8;
    if field_count > REQ_HDR_FIELD_COUNT {
        return Err(AziHsmError::ProtocolError);
    }

    enc.map(field_count)?;
    if let Some(rev) = api_rev {
        enc.u8(REV_FIELD_ID)?;
        encode_api_rev(enc, rev)?;
    }
    enc.u8(DDI_OP_FIELD_ID)?;
    enc.u32(op as u32)?;
    if let Some(sid) = session_id {
        enc.u8(SESSION_ID_FIELD_ID)?;
        enc.u16(sid)?;
    }
    Ok(())
}

/// Encodes the two-field command envelope (`[FieldCount:2][hdr][data]`)
/// shared by every DDI request, deferring the data payload to `encode_data`.
fn encode_command_request(
    enc: &mut Encoder,
    op: DdiOp,
    api_rev: Option<&ApiRev>,
    session_id: Option<u16>,
    encode_data: impl FnOnce(&mut Encoder) -> Result<()>,
) -> Result<()> {
    enc.map(2)?;
    enc.raw_byte(CMD_HDR_FIELD_ID)?;
    encode_request_header(enc, op, api_rev, session_id)?;
    enc.raw_byte(CMD_DATA_FIELD_ID)?;
    encode_data(enc)
}

/// Parsed response header: the firmware-asserted operation code is not
/// surfaced to callers (it is only used to validate the envelope), but
/// status and FIPS-approval are.
struct ResponseHeader {
    ddi_status: u32,
    fips_approved: bool,
}

fn decode_response_header(dec: &mut Decoder) -> Result<ResponseHeader> {
    let field_count = dec.map()?;
    if !(MIN_RSP_HDR_FIELD_COUNT..=RSP_HDR_FIELD_COUNT).contains(&field_count) {
        return Err(AziHsmError::ProtocolError);
    }

    let mut ddi_status = None;
    let mut fips_approved = None;
    let mut op_seen = false;
    let mut rev_seen = false;
    let mut session_seen = false;

    for _ in 0..field_count {
        match dec.u8()? {
            RSP_REV_FIELD_ID => {
                if rev_seen {
                    return Err(AziHsmError::ProtocolError);
                }
                rev_seen = true;
                decode_api_rev(dec)?;
            }
            RSP_DDI_OP_FIELD_ID => {
                if op_seen {
                    return Err(AziHsmError::ProtocolError);
                }
                op_seen = true;
                dec.u32()?;
            }
            RSP_SESSION_ID_FIELD_ID => {
                if session_seen {
                    return Err(AziHsmError::ProtocolError);
                }
                session_seen = true;
                dec.u16()?;
            }
            RSP_DDI_STATUS_FIELD_ID => {
                if ddi_status.is_some() {
                    return Err(AziHsmError::ProtocolError);
                }
                ddi_status = Some(dec.u32()?);
            }
            RSP_FIPS_APPROVED_FIELD_ID => {
                if fips_approved.is_some() {
                    return Err(AziHsmError::ProtocolError);
                }
                fips_approved = Some(dec.boolean()?);
            }
            _ => return Err(AziHsmError::Unsupported),
        }
    }

    let (ddi_status, fips_approved) = match (ddi_status, fips_approved) {
        (Some(s), Some(f)) if op_seen => (s, f),
        _ => return Err(AziHsmError::ProtocolError),
    };

    Ok(ResponseHeader { ddi_status, fips_approved })
}

/// Decodes the two-field command envelope (`[FieldCount:2][hdr][data]`)
/// shared by every DDI response, handing the data payload to `decode_data`.
/// A non-success DDI status is surfaced before `decode_data` runs.
fn decode_command_response<T>(
    dec: &mut Decoder,
    decode_data: impl FnOnce(&mut Decoder) -> Result<T>,
) -> Result<(T, bool)> {
    let field_count = dec.map()?;
    if field_count < 2 {
        return Err(AziHsmError::ProtocolError);
    }
    if dec.raw_byte()? != CMD_HDR_FIELD_ID {
        return Err(AziHsmError::ProtocolError);
    }
    let hdr = decode_response_header(dec)?;
    DdiStatus::to_error(hdr.ddi_status)?;

    if dec.raw_byte()? != CMD_DATA_FIELD_ID {
        return Err(AziHsmError::ProtocolError);
    }
    let data = decode_data(dec)?;
    Ok((data, hdr.fips_approved))
}

pub fn encode_get_api_rev_request(
    enc: &mut Encoder,
    api_rev: Option<&ApiRev>,
    session_id: Option<u16>,
) -> Result<()> {
    encode_command_request(enc, DdiOp::GetApiRev, api_rev, session_id, |enc| enc.map(0))
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ApiRevResponse {
    pub min: ApiRev,
    pub max: ApiRev,
}

pub fn decode_get_api_rev_response(dec: &mut Decoder) -> Result<(ApiRevResponse, bool)> {
    decode_command_response(dec, |dec| {
        let field_count = dec.map()?;
        if field_count != 2 {
            return Err(AziHsmError::ProtocolError);
        }
        let mut resp = ApiRevResponse::default();
        for _ in 0..field_count {
            match dec.u8()? {
                1 => resp.min = decode_api_rev(dec)?,
                2 => resp.max = decode_api_rev(dec)?,
                _ => return Err(AziHsmError::Unsupported),
            }
        }
        Ok(resp)
    })
}

pub fn encode_init_bks3_request(
    enc: &mut Encoder,
    api_rev: Option<&ApiRev>,
    session_id: Option<u16>,
    bks3_data: &[u8],
) -> Result<()> {
    if bks3_data.len() > INIT_BKS3_REQ_MAX_LEN {
        return Err(AziHsmError::InvalidParameter);
    }
    encode_command_request(enc, DdiOp::InitBks3, api_rev, session_id, |enc| {
        enc.map(1)?;
        enc.u8(1)?;
        enc.bytes(bks3_data)
    })
}

pub struct InitBks3Response {
    pub bks3: Vec<u8, INIT_BKS3_RESP_MAX_LEN>,
    pub guid: [u8; GUID_LEN],
}

pub fn decode_init_bks3_response(dec: &mut Decoder) -> Result<(InitBks3Response, bool)> {
    decode_command_response(dec, |dec| {
        let field_count = dec.map()?;
        if field_count != 2 {
            return Err(AziHsmError::ProtocolError);
        }
        let mut bks3 = Vec::new();
        let mut guid = [0u8; GUID_LEN];
        for _ in 0..field_count {
            match dec.u8()? {
                1 => {
                    bks3.resize_default(INIT_BKS3_RESP_MAX_LEN)
                        .map_err(|_| AziHsmError::OutOfResources)?;
                    let len = dec.padded_bytes(&mut bks3)?;
                    bks3.truncate(len);
                }
                2 => {
                    let len = dec.bytes(&mut guid)?;
                    if len != GUID_LEN {
                        return Err(AziHsmError::ProtocolError);
                    }
                }
                _ => return Err(AziHsmError::Unsupported),
            }
        }
        Ok(InitBks3Response { bks3, guid })
    })
}

pub fn encode_set_sealed_bks3_request(
    enc: &mut Encoder,
    api_rev: Option<&ApiRev>,
    session_id: Option<u16>,
    sealed_bks3: &[u8],
) -> Result<()> {
    if sealed_bks3.len() > SET_SEALED_BKS3_MAX_LEN {
        return Err(AziHsmError::InvalidParameter);
    }
    encode_command_request(enc, DdiOp::SetSealedBks3, api_rev, session_id, |enc| {
        enc.map(1)?;
        enc.u8(1)?;
        enc.bytes(sealed_bks3)
    })
}

/// Unlike every other DDI response, a non-success `DdiStatus` here is not a
/// transport error: the returned boolean *is* the seal result. The data map
/// is always empty and always decoded, regardless of status.
pub fn decode_set_sealed_bks3_response(dec: &mut Decoder) -> Result<bool> {
    let field_count = dec.map()?;
    if field_count < 2 {
        return Err(AziHsmError::ProtocolError);
    }
    if dec.raw_byte()? != CMD_HDR_FIELD_ID {
        return Err(AziHsmError::ProtocolError);
    }
    let hdr = decode_response_header(dec)?;
    let seal_succeeded = hdr.ddi_status == DdiStatus::Success as u32;

    if dec.raw_byte()? != CMD_DATA_FIELD_ID {
        return Err(AziHsmError::ProtocolError);
    }
    let data_field_count = dec.map()?;
    if data_field_count != 0 {
        return Err(AziHsmError::ProtocolError);
    }
    Ok(seal_succeeded)
}

pub fn encode_get_sealed_bks3_request(
    enc: &mut Encoder,
    api_rev: Option<&ApiRev>,
    session_id: Option<u16>,
) -> Result<()> {
    encode_command_request(enc, DdiOp::GetSealedBks3, api_rev, session_id, |enc| enc.map(0))
}

pub fn decode_get_sealed_bks3_response(
    dec: &mut Decoder,
) -> Result<(Vec<u8, GET_SEALED_BKS3_MAX_LEN>, bool)> {
    decode_command_response(dec, |dec| {
        let field_count = dec.map()?;
        if field_count != 1 {
            return Err(AziHsmError::ProtocolError);
        }
        if dec.u8()? != 1 {
            return Err(AziHsmError::Unsupported);
        }
        let mut sealed = Vec::new();
        sealed
            .resize_default(GET_SEALED_BKS3_MAX_LEN)
            .map_err(|_| AziHsmError::OutOfResources)?;
        let len = dec.padded_bytes(&mut sealed)?;
        sealed.truncate(len);
        Ok(sealed)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_api_rev_round_trips_through_the_wire_format() {
        let mut buf = [0u8; 128];
        let mut enc = Encoder::new(&mut buf);
        encode_get_api_rev_request(&mut enc, None, None).unwrap();
        let req_len = enc.position();
        assert_eq!(
            &buf[..req_len],
            &[0xA2, 0x00, 0xA1, 0x18, 0x02, 0x1A, 0x00, 0x00, 0x03, 0xEA, 0x01, 0xA0]
        );

        // Build a matching response by hand, as firmware would send it.
        let mut resp_buf = [0u8; 128];
        let mut resp_enc = Encoder::new(&mut resp_buf);
        resp_enc.map(2).unwrap();
        resp_enc.raw_byte(0).unwrap();
        resp_enc.map(3).unwrap();
        resp_enc.u8(RSP_DDI_OP_FIELD_ID).unwrap();
        resp_enc.u32(DdiOp::GetApiRev as u32).unwrap();
        resp_enc.u8(RSP_DDI_STATUS_FIELD_ID).unwrap();
        resp_enc.u32(0).unwrap();
        resp_enc.u8(RSP_FIPS_APPROVED_FIELD_ID).unwrap();
        resp_enc.boolean(true).unwrap();
        resp_enc.raw_byte(1).unwrap();
        resp_enc.map(2).unwrap();
        resp_enc.u8(1).unwrap();
        encode_api_rev(&mut resp_enc, &ApiRev { major: 1, minor: 0 }).unwrap();
        resp_enc.u8(2).unwrap();
        encode_api_rev(&mut resp_enc, &ApiRev { major: 2, minor: 3 }).unwrap();
        let resp_len = resp_enc.position();

        let mut dec = Decoder::new(&resp_buf[..resp_len]);
        let (resp, fips) = decode_get_api_rev_response(&mut dec).unwrap();
        assert!(fips);
        assert_eq!(resp.min.major, 1);
        assert_eq!(resp.max.minor, 3);
    }

    #[test]
    fn get_api_rev_response_decodes_the_documented_wire_dump() {
        let bytes: &[u8] = &[
            0xA2, 0x00, 0xA5, 0x18, 0x02, 0x1A, 0x00, 0x00, 0x03, 0xEA, 0x18, 0x04, 0x1A, 0x00,
            0x00, 0x00, 0x00, 0x18, 0x05, 0x15, 0x01, 0xA2, 0x18, 0x01, 0xA2, 0x18, 0x01, 0x1A,
            0x00, 0x00, 0x00, 0x01, 0x18, 0x02, 0x1A, 0x00, 0x00, 0x00, 0x00, 0x18, 0x02, 0xA2,
            0x18, 0x01, 0x1A, 0x00, 0x00, 0x00, 0x02, 0x18, 0x02, 0x1A, 0x00, 0x00, 0x00, 0x03,
        ];
        let mut dec = Decoder::new(bytes);
        let (resp, fips) = decode_get_api_rev_response(&mut dec).unwrap();
        assert!(fips);
        assert_eq!(resp.min.major, 1);
        assert_eq!(resp.min.minor, 0);
        assert_eq!(resp.max.major, 2);
        assert_eq!(resp.max.minor, 3);
    }

    #[test]
    fn nonzero_ddi_status_maps_to_transport_error() {
        let mut buf = [0u8; 128];
        let mut enc = Encoder::new(&mut buf);
        enc.map(2).unwrap();
        enc.raw_byte(0).unwrap();
        enc.map(3).unwrap();
        enc.u8(RSP_DDI_OP_FIELD_ID).unwrap();
        enc.u32(DdiOp::GetApiRev as u32).unwrap();
        enc.u8(RSP_DDI_STATUS_FIELD_ID).unwrap();
        enc.u32(DdiStatus::UnsupportedCmd as u32).unwrap();
        enc.u8(RSP_FIPS_APPROVED_FIELD_ID).unwrap();
        enc.boolean(false).unwrap();
        enc.raw_byte(1).unwrap();
        enc.map(0).unwrap();
        let len = enc.position();

        let mut dec = Decoder::new(&buf[..len]);
        let result = decode_get_api_rev_response(&mut dec);
        assert_eq!(result.unwrap_err(), AziHsmError::Unsupported);
    }

    #[test]
    fn init_bks3_request_rejects_oversized_payload() {
        let mut buf = [0u8; 16];
        let mut enc = Encoder::new(&mut buf);
        let oversized = [0u8; INIT_BKS3_REQ_MAX_LEN + 1];
        let result = encode_init_bks3_request(&mut enc, None, None, &oversized);
        assert_eq!(result.unwrap_err(), AziHsmError::InvalidParameter);
    }

    #[test]
    fn get_sealed_bks3_response_surfaces_the_sealed_blob() {
        let mut buf = [0u8; 64];
        let mut enc = Encoder::new(&mut buf);
        enc.map(2).unwrap();
        enc.raw_byte(0).unwrap();
        enc.map(3).unwrap();
        enc.u8(RSP_DDI_OP_FIELD_ID).unwrap();
        enc.u32(DdiOp::GetSealedBks3 as u32).unwrap();
        enc.u8(RSP_DDI_STATUS_FIELD_ID).unwrap();
        enc.u32(0).unwrap();
        enc.u8(RSP_FIPS_APPROVED_FIELD_ID).unwrap();
        enc.boolean(true).unwrap();
        enc.raw_byte(1).unwrap();
        enc.map(1).unwrap();
        enc.u8(1).unwrap();
        enc.bytes(&[0xAA, 0xBB, 0xCC]).unwrap();
        let len = enc.position();

        let mut dec = Decoder::new(&buf[..len]);
        let (sealed, fips) = decode_get_sealed_bks3_response(&mut dec).unwrap();
        assert!(fips);
        assert_eq!(sealed.as_slice(), &[0xAA, 0xBB, 0xCC]);
    }

    #[test]
    fn set_sealed_bks3_response_reports_failure_as_a_boolean_not_an_error() {
        let mut buf = [0u8; 64];
        let mut enc = Encoder::new(&mut buf);
        enc.map(2).unwrap();
        enc.raw_byte(0).unwrap();
        enc.map(3).unwrap();
        enc.u8(RSP_DDI_OP_FIELD_ID).unwrap();
        enc.u32(DdiOp::SetSealedBks3 as u32).unwrap();
        enc.u8(RSP_DDI_STATUS_FIELD_ID).unwrap();
        enc.u32(DdiStatus::InternalError as u32).unwrap();
        enc.u8(RSP_FIPS_APPROVED_FIELD_ID).unwrap();
        enc.boolean(false).unwrap();
        enc.raw_byte(1).unwrap();
        enc.map(0).unwrap();
        let len = enc.position();

        let mut dec = Decoder::new(&buf[..len]);
        assert_eq!(decode_set_sealed_bks3_response(&mut dec).unwrap(), false);
    }

    #[test]
    fn duplicate_status_field_in_response_header_is_a_protocol_error() {
        let mut buf = [0u8; 64];
        let mut enc = Encoder::new(&mut buf);
        enc.map(4).unwrap();
        enc.u8(RSP_DDI_OP_FIELD_ID).unwrap();
        enc.u32(DdiOp::GetApiRev as u32).unwrap();
        enc.u8(RSP_DDI_STATUS_FIELD_ID).unwrap();
        enc.u32(0).unwrap();
        enc.u8(RSP_DDI_STATUS_FIELD_ID).unwrap();
        enc.u32(0).unwrap();
        enc.u8(RSP_FIPS_APPROVED_FIELD_ID).unwrap();
        enc.boolean(false).unwrap();
        let len = enc.position();

        let mut dec = Decoder::new(&buf[..len]);
        let result = decode_response_header(&mut dec);
        assert_eq!(result.unwrap_err(), AziHsmError::ProtocolError);
    }
}
