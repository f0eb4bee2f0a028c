//! DFU request encoding and response parsing for the Nordic serial bootloader.
//!
//! Requests are `[opcode, params...]`, responses `[0x60, opcode, result, payload...]`.
//! All integers are little-endian. Framing (SLIP) is applied by the transport.

use crc::crc32;

use super::config::{describe_result, DfuOpcode, DfuResultCode, ObjectType};
use super::error::{TransportError, TransportResult};

// ============================================================================
// CRC32 (IEEE), as computed by the bootloader over received data
// ============================================================================

/// Extend a running CRC32 with more data.
pub fn crc32_update(crc: u32, data: &[u8]) -> u32 {
    crc32::update(crc, &crc32::IEEE_TABLE, data)
}

/// CRC32 of a complete buffer.
pub fn crc32(data: &[u8]) -> u32 {
    crc32::checksum_ieee(data)
}

// ============================================================================
// Request Builders
// ============================================================================

/// Ping: `[0x09, id]`.
pub fn ping_request(id: u8) -> Vec<u8> {
    vec![DfuOpcode::Ping as u8, id]
}

/// SetPrn: `[0x02, prn(2)]`.
pub fn set_prn_request(prn: u16) -> Vec<u8> {
    let mut request = Vec::with_capacity(3);
    request.push(DfuOpcode::SetPrn as u8);
    request.extend_from_slice(&prn.to_le_bytes());
    request
}

/// SelectObject: `[0x06, type]`.
pub fn select_object_request(object_type: ObjectType) -> Vec<u8> {
    vec![DfuOpcode::SelectObject as u8, object_type as u8]
}

/// CreateObject: `[0x01, type, size(4)]`.
pub fn create_object_request(object_type: ObjectType, size: u32) -> Vec<u8> {
    let mut request = Vec::with_capacity(6);
    request.push(DfuOpcode::CreateObject as u8);
    request.push(object_type as u8);
    request.extend_from_slice(&size.to_le_bytes());
    request
}

/// WriteObject: `[0x08, data...]`.
pub fn write_object_request(chunk: &[u8]) -> Vec<u8> {
    let mut request = Vec::with_capacity(1 + chunk.len());
    request.push(DfuOpcode::WriteObject as u8);
    request.extend_from_slice(chunk);
    request
}

/// CalcChecksum: `[0x03]`.
pub fn calc_checksum_request() -> Vec<u8> {
    vec![DfuOpcode::CalcChecksum as u8]
}

/// Execute: `[0x04]`.
pub fn execute_request() -> Vec<u8> {
    vec![DfuOpcode::Execute as u8]
}

// ============================================================================
// Response Parsing
// ============================================================================

/// A decoded response frame from the bootloader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// Opcode of the request being answered.
    pub opcode: u8,
    /// Raw result code.
    pub result: u8,
    /// Opcode-specific payload following the result code.
    pub payload: Vec<u8>,
}

impl Response {
    /// Parse a response from a decoded SLIP frame.
    pub fn parse(frame: &[u8]) -> TransportResult<Self> {
        if frame.len() < 3 {
            return Err(malformed(format!(
                "frame of {} bytes is shorter than a response header",
                frame.len()
            )));
        }

        if frame[0] != DfuOpcode::Response as u8 {
            return Err(malformed(format!(
                "expected response marker 0x60, got 0x{:02X}",
                frame[0]
            )));
        }

        Ok(Self {
            opcode: frame[1],
            result: frame[2],
            payload: frame[3..].to_vec(),
        })
    }

    pub fn is_success(&self) -> bool {
        self.result == DfuResultCode::Success as u8
    }

    /// Check that this answers `opcode` with success and return the payload.
    pub fn into_payload(self, opcode: DfuOpcode) -> TransportResult<Vec<u8>> {
        if self.opcode != opcode as u8 {
            return Err(malformed(format!(
                "expected response to 0x{:02X}, got 0x{:02X}",
                opcode as u8, self.opcode
            )));
        }

        if !self.is_success() {
            return Err(TransportError::DeviceError {
                opcode: self.opcode,
                result: self.result,
                message: describe_result(self.result),
            });
        }

        Ok(self.payload)
    }
}

/// Offset and CRC reported by CalcChecksum and by packet receipt notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Checksum {
    pub offset: u32,
    pub crc: u32,
}

impl Checksum {
    pub fn parse(payload: &[u8]) -> TransportResult<Self> {
        Ok(Self {
            offset: read_u32(payload, 0)?,
            crc: read_u32(payload, 4)?,
        })
    }
}

/// State of an object type as reported by SelectObject.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SelectedObject {
    /// Largest object the device accepts for this type.
    pub max_size: u32,
    pub offset: u32,
    pub crc: u32,
}

impl SelectedObject {
    pub fn parse(payload: &[u8]) -> TransportResult<Self> {
        Ok(Self {
            max_size: read_u32(payload, 0)?,
            offset: read_u32(payload, 4)?,
            crc: read_u32(payload, 8)?,
        })
    }
}

/// Extract the echoed identifier from a Ping response payload.
pub fn parse_ping(payload: &[u8]) -> TransportResult<u8> {
    payload
        .first()
        .copied()
        .ok_or_else(|| malformed("ping response carries no identifier"))
}

fn read_u32(payload: &[u8], at: usize) -> TransportResult<u32> {
    payload
        .get(at..at + 4)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .ok_or_else(|| malformed(format!("payload of {} bytes too short", payload.len())))
}

fn malformed(reason: impl Into<String>) -> TransportError {
    TransportError::MalformedResponse {
        reason: reason.into(),
    }
}

/// Build a raw response frame, as the bootloader would send it.
#[cfg(test)]
pub fn response_frame(opcode: DfuOpcode, result: DfuResultCode, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(3 + payload.len());
    frame.push(DfuOpcode::Response as u8);
    frame.push(opcode as u8);
    frame.push(result as u8);
    frame.extend_from_slice(payload);
    frame
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc32_known_value() {
        // CRC-32/IEEE check value
        assert_eq!(crc32(b"123456789"), 0xCBF4_3926);
    }

    #[test]
    fn test_crc32_update_is_chainable() {
        let data = b"firmware image bytes";
        let running = crc32_update(crc32_update(0, &data[..7]), &data[7..]);
        assert_eq!(running, crc32(data));
    }

    #[test]
    fn test_request_layouts() {
        assert_eq!(ping_request(7), vec![0x09, 7]);
        assert_eq!(set_prn_request(0x0102), vec![0x02, 0x02, 0x01]);
        assert_eq!(select_object_request(ObjectType::Data), vec![0x06, 0x02]);
        assert_eq!(
            create_object_request(ObjectType::Command, 0x0000_0180),
            vec![0x01, 0x01, 0x80, 0x01, 0x00, 0x00]
        );
        assert_eq!(write_object_request(&[0xAA, 0xBB]), vec![0x08, 0xAA, 0xBB]);
        assert_eq!(calc_checksum_request(), vec![0x03]);
        assert_eq!(execute_request(), vec![0x04]);
    }

    #[test]
    fn test_parse_checksum_response() {
        let mut payload = 1280u32.to_le_bytes().to_vec();
        payload.extend_from_slice(&0xDEAD_BEEFu32.to_le_bytes());
        let frame = response_frame(DfuOpcode::CalcChecksum, DfuResultCode::Success, &payload);

        let response = Response::parse(&frame).unwrap();
        let checksum = Checksum::parse(&response.into_payload(DfuOpcode::CalcChecksum).unwrap())
            .unwrap();

        assert_eq!(checksum.offset, 1280);
        assert_eq!(checksum.crc, 0xDEAD_BEEF);
    }

    #[test]
    fn test_parse_select_response() {
        let mut payload = Vec::new();
        for value in [4096u32, 0, 0] {
            payload.extend_from_slice(&value.to_le_bytes());
        }

        let selected = SelectedObject::parse(&payload).unwrap();
        assert_eq!(selected.max_size, 4096);
        assert_eq!(selected.offset, 0);
    }

    #[test]
    fn test_error_result_becomes_device_error() {
        let frame = response_frame(
            DfuOpcode::CreateObject,
            DfuResultCode::InsufficientResources,
            &[],
        );
        let result = Response::parse(&frame)
            .unwrap()
            .into_payload(DfuOpcode::CreateObject);

        assert!(matches!(
            result,
            Err(TransportError::DeviceError { opcode: 0x01, result: 0x04, .. })
        ));
    }

    #[test]
    fn test_response_to_other_opcode_is_malformed() {
        let frame = response_frame(DfuOpcode::Execute, DfuResultCode::Success, &[]);
        let result = Response::parse(&frame)
            .unwrap()
            .into_payload(DfuOpcode::CalcChecksum);

        assert!(matches!(result, Err(TransportError::MalformedResponse { .. })));
    }

    #[test]
    fn test_short_frames_are_malformed() {
        assert!(Response::parse(&[0x60, 0x09]).is_err());
        assert!(Response::parse(&[0x61, 0x09, 0x01]).is_err());
        assert!(Checksum::parse(&[0x00; 7]).is_err());
        assert!(parse_ping(&[]).is_err());
    }
}
