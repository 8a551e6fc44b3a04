//! Modbus TCP framing
//!
//! Pure functions over complete ADUs ([`decode_frame`], [`encode_response`])
//! plus [`MbapCodec`], which buffers a byte stream until the length field
//! says a whole frame is present.

use bytes::{BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::trace;

use super::constants::{
    MAX_MBAP_LENGTH, MBAP_HEADER_LEN, MBAP_PREFIX_LEN, MIN_FRAME_LEN, MIN_MBAP_LENGTH,
    MODBUS_PROTOCOL_ID,
};
use super::pdu::ModbusPdu;
use crate::error::FrameError;

/// MBAP header fields
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MbapHeader {
    pub transaction_id: u16,
    pub protocol_id: u16,
    /// Unit id + PDU byte count
    pub length: u16,
    pub unit_id: u8,
}

/// A decoded inbound request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestAdu {
    pub header: MbapHeader,
    pub pdu: ModbusPdu,
}

/// An outbound response; the length field is derived on encode
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseAdu {
    pub transaction_id: u16,
    pub unit_id: u8,
    pub pdu: ModbusPdu,
}

impl ResponseAdu {
    /// Response echoing the request's transaction and unit id
    pub fn reply_to(header: &MbapHeader, pdu: ModbusPdu) -> Self {
        Self {
            transaction_id: header.transaction_id,
            unit_id: header.unit_id,
            pdu,
        }
    }
}

#[inline]
fn be_u16(bytes: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes([bytes[offset], bytes[offset + 1]])
}

/// Total frame size announced by a header prefix
///
/// Needs the first 6 bytes; rejects length fields outside `2..=254` before
/// the rest of the frame arrives.
pub fn frame_len(header: &[u8]) -> Result<usize, FrameError> {
    if header.len() < MBAP_PREFIX_LEN {
        return Err(FrameError::TooShort(header.len()));
    }
    let length = be_u16(header, 4);
    if !(MIN_MBAP_LENGTH..=MAX_MBAP_LENGTH).contains(&length) {
        return Err(FrameError::LengthOutOfRange(length));
    }
    Ok(MBAP_PREFIX_LEN + usize::from(length))
}

/// Validate whatever part of an MBAP header is present
///
/// Protocol id once 4 bytes are in, length range once 6 are in. Shorter
/// input passes.
pub fn check_header_prefix(bytes: &[u8]) -> Result<(), FrameError> {
    if bytes.len() >= 4 {
        let protocol_id = be_u16(bytes, 2);
        if protocol_id != MODBUS_PROTOCOL_ID {
            return Err(FrameError::ProtocolId(protocol_id));
        }
    }
    if bytes.len() >= MBAP_PREFIX_LEN {
        frame_len(&bytes[..MBAP_PREFIX_LEN])?;
    }
    Ok(())
}

/// Decode one complete ADU
pub fn decode_frame(bytes: &[u8]) -> Result<RequestAdu, FrameError> {
    if bytes.len() < MIN_FRAME_LEN {
        return Err(FrameError::TooShort(bytes.len()));
    }

    let header = MbapHeader {
        transaction_id: be_u16(bytes, 0),
        protocol_id: be_u16(bytes, 2),
        length: be_u16(bytes, 4),
        unit_id: bytes[6],
    };

    if header.protocol_id != MODBUS_PROTOCOL_ID {
        return Err(FrameError::ProtocolId(header.protocol_id));
    }
    if !(MIN_MBAP_LENGTH..=MAX_MBAP_LENGTH).contains(&header.length) {
        return Err(FrameError::LengthOutOfRange(header.length));
    }
    let actual = bytes.len() - MBAP_PREFIX_LEN;
    if usize::from(header.length) != actual {
        return Err(FrameError::LengthMismatch {
            declared: header.length,
            actual,
        });
    }

    let pdu = ModbusPdu::from_slice(&bytes[MBAP_HEADER_LEN..])?;
    trace!(
        "ADU decoded: tid={} unit={} fc={:02X} len={}",
        header.transaction_id,
        header.unit_id,
        pdu.function_code().unwrap_or(0),
        pdu.len()
    );
    Ok(RequestAdu { header, pdu })
}

fn put_response(adu: &ResponseAdu, dst: &mut BytesMut) {
    let pdu = adu.pdu.as_slice();
    dst.reserve(MBAP_HEADER_LEN + pdu.len());
    dst.put_u16(adu.transaction_id);
    dst.put_u16(MODBUS_PROTOCOL_ID);
    dst.put_u16((pdu.len() + 1) as u16);
    dst.put_u8(adu.unit_id);
    dst.put_slice(pdu);
}

/// Encode a response ADU; the length field is recomputed from the PDU
pub fn encode_response(adu: &ResponseAdu) -> Bytes {
    let mut buf = BytesMut::with_capacity(MBAP_HEADER_LEN + adu.pdu.len());
    put_response(adu, &mut buf);
    buf.freeze()
}

/// Stream codec for Modbus TCP server connections
#[derive(Debug, Default, Clone, Copy)]
pub struct MbapCodec;

impl Decoder for MbapCodec {
    type Item = RequestAdu;
    type Error = FrameError;

    /// A frame is only released once the bytes already buffered behind it
    /// also read as the start of a header. Otherwise its length field
    /// understated the payload and the whole stream is rejected.
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        check_header_prefix(src)?;
        if src.len() < MBAP_PREFIX_LEN {
            return Ok(None);
        }
        let total = frame_len(&src[..MBAP_PREFIX_LEN])?;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }
        check_header_prefix(&src[total..])?;
        let frame = src.split_to(total);
        decode_frame(&frame).map(Some)
    }
}

impl Encoder<ResponseAdu> for MbapCodec {
    type Error = FrameError;

    fn encode(&mut self, item: ResponseAdu, dst: &mut BytesMut) -> Result<(), Self::Error> {
        put_response(&item, dst);
        Ok(())
    }
}
